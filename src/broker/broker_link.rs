//! Subscribe session driver and per-call status publishing.
//!
//! The subscriber owns the reconnect state machine: each session runs until
//! shutdown or failure, and [`BrokerLink::run_subscriber`] decides between
//! backing off and giving up. Giving up surfaces as a typed error so the
//! orchestrator keeps the process-exit decision to itself.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, Outgoing, Packet, QoS};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::reconnect::{RetryCounter, RetryDecision};
use super::{BrokerError, BrokerSettings, Command, ConnectionState};
use crate::notify::{self, Notify};

const EVENT_CHANNEL_CAPACITY: usize = 16;
const PUBLISH_CHANNEL_CAPACITY: usize = 4;
const PUBLISH_ACK_TIMEOUT: Duration = Duration::from_secs(10);
const DISCONNECT_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Drives a session until its DISCONNECT packet leaves, so the broker sees
/// a clean close. Bounded; a dead link just gets dropped.
async fn flush_disconnect(eventloop: &mut EventLoop) {
    let _ = timeout(DISCONNECT_FLUSH_TIMEOUT, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                Ok(_) => {}
                Err(_) => break,
            }
        }
    })
    .await;
}

/// How a single subscribe session ended.
#[derive(Debug)]
enum SessionEnd {
    /// Shutdown was requested and the session closed cleanly.
    Shutdown,
    /// The connection or the subscription failed.
    Failed(String),
}

pub struct BrokerLink {
    settings: BrokerSettings,
    state: ConnectionState,
    retries: RetryCounter,
    notifier: Arc<dyn Notify>,
}

impl BrokerLink {
    pub fn new(settings: BrokerSettings, notifier: Arc<dyn Notify>) -> Self {
        let retries = RetryCounter::new(settings.max_attempts, settings.backoff);
        Self {
            settings,
            state: ConnectionState::Disconnected,
            retries,
            notifier,
        }
    }

    /// The publish half. Independent short-lived sessions, usable while the
    /// subscriber owns `self`.
    pub fn publisher(&self) -> StatusPublisher {
        StatusPublisher {
            settings: self.settings.clone(),
        }
    }

    #[cfg(test)]
    fn state(&self) -> ConnectionState {
        self.state
    }

    /// Drives connect/subscribe/receive sessions until shutdown or until
    /// the retry budget is exhausted. Every inbound message payload is
    /// pushed into `commands` in arrival order. An `Err` return means the
    /// cap was hit and the fatal alert already went out; the caller owns
    /// what happens to the process.
    pub async fn run_subscriber(
        mut self,
        commands: mpsc::Sender<Command>,
        shutdown: CancellationToken,
    ) -> Result<(), BrokerError> {
        loop {
            self.state = ConnectionState::Connecting;
            let end = self.subscribe_session(&commands, &shutdown).await;
            match self.after_session(end, &shutdown).await? {
                ControlFlow::Continue(()) => continue,
                ControlFlow::Break(()) => return Ok(()),
            }
        }
    }

    /// One connect+subscribe+receive cycle. Returns only when the session
    /// is over; transient protocol chatter stays inside.
    async fn subscribe_session(
        &mut self,
        commands: &mpsc::Sender<Command>,
        shutdown: &CancellationToken,
    ) -> SessionEnd {
        let client_id = format!("portlink-sub-{}", self.settings.device_id);
        let options = self.settings.mqtt_options(&client_id);
        let (client, mut eventloop) = AsyncClient::new(options, EVENT_CHANNEL_CAPACITY);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    if let Err(err) = client.disconnect().await {
                        debug!(%err, "disconnect on shutdown failed");
                    } else {
                        flush_disconnect(&mut eventloop).await;
                    }
                    return SessionEnd::Shutdown;
                }
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        debug!(host = %self.settings.host, "broker session established");
                        if let Err(err) = client
                            .subscribe(self.settings.control_topic.as_str(), QoS::AtLeastOnce)
                            .await
                        {
                            return SessionEnd::Failed(err.to_string());
                        }
                    }
                    Ok(Event::Incoming(Packet::SubAck(_))) => {
                        self.state = ConnectionState::Subscribed;
                        self.retries.record_success();
                        info!(topic = %self.settings.control_topic, "subscribed to control topic");
                        self.notifier
                            .send(&notify::subscribed_alert(
                                &self.settings.device_id,
                                &self.settings.control_topic,
                            ))
                            .await;
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let command = Command::from_payload(&publish.payload);
                        debug!(%command, topic = %publish.topic, "inbound command");
                        if commands.send(command).await.is_err() {
                            // The relay side is gone, so the process is on
                            // its way down; not a broker failure.
                            if client.disconnect().await.is_ok() {
                                flush_disconnect(&mut eventloop).await;
                            }
                            return SessionEnd::Shutdown;
                        }
                    }
                    Ok(_) => {}
                    Err(err) => return SessionEnd::Failed(err.to_string()),
                }
            }
        }
    }

    /// Applies one session outcome to the state machine. `Break` is a clean
    /// stop, `Continue` means reconnect after backoff, `Err` means the cap
    /// is exhausted and exactly one fatal alert has been dispatched.
    async fn after_session(
        &mut self,
        end: SessionEnd,
        shutdown: &CancellationToken,
    ) -> Result<ControlFlow<()>, BrokerError> {
        match end {
            SessionEnd::Shutdown => {
                self.state = ConnectionState::Disconnected;
                info!("broker session closed");
                Ok(ControlFlow::Break(()))
            }
            SessionEnd::Failed(reason) => {
                warn!(%reason, "broker session failed");
                match self.retries.record_failure() {
                    RetryDecision::RetryAfter(delay) => {
                        self.state = ConnectionState::Backoff;
                        debug!(
                            failures = self.retries.failures(),
                            delay_ms = delay.as_millis() as u64,
                            "backing off before reconnect"
                        );
                        tokio::select! {
                            _ = shutdown.cancelled() => {
                                self.state = ConnectionState::Disconnected;
                                return Ok(ControlFlow::Break(()));
                            }
                            _ = sleep(delay) => {}
                        }
                        Ok(ControlFlow::Continue(()))
                    }
                    RetryDecision::GiveUp => {
                        self.state = ConnectionState::Exhausted;
                        let attempts = self.retries.failures();
                        error!(attempts, "broker retry budget exhausted");
                        self.notifier
                            .send(&notify::exhausted_alert(&self.settings.device_id, attempts))
                            .await;
                        Err(BrokerError::RetriesExhausted { attempts })
                    }
                }
            }
        }
    }
}

#[derive(Debug, Error)]
enum PublishError {
    #[error(transparent)]
    Client(#[from] rumqttc::ClientError),
    #[error(transparent)]
    Connection(#[from] rumqttc::ConnectionError),
    #[error("timed out waiting for the broker to acknowledge")]
    AckTimeout,
}

/// Publishes one status line per short-lived session. Losing a line is
/// acceptable; publish failures are logged and dropped.
#[derive(Clone)]
pub struct StatusPublisher {
    settings: BrokerSettings,
}

impl StatusPublisher {
    pub async fn publish(&self, line: &str) {
        if let Err(err) = self.try_publish(line).await {
            warn!(%err, line, "failed to publish status line");
        }
    }

    async fn try_publish(&self, line: &str) -> Result<(), PublishError> {
        let client_id = format!("portlink-pub-{}", self.settings.device_id);
        let options = self.settings.mqtt_options(&client_id);
        let (client, mut eventloop) = AsyncClient::new(options, PUBLISH_CHANNEL_CAPACITY);
        client
            .publish(
                self.settings.response_topic.clone(),
                QoS::AtLeastOnce,
                false,
                line.to_owned(),
            )
            .await?;

        // Drive the session until the broker acks the message, bounded so a
        // dead broker cannot park the poll duty here.
        let acked = timeout(PUBLISH_ACK_TIMEOUT, async {
            loop {
                match eventloop.poll().await? {
                    Event::Incoming(Packet::PubAck(_)) => return Ok::<(), PublishError>(()),
                    _ => {}
                }
            }
        })
        .await;
        match acked {
            Ok(result) => result?,
            Err(_) => return Err(PublishError::AckTimeout),
        }

        if client.disconnect().await.is_ok() {
            flush_disconnect(&mut eventloop).await;
        }
        Ok(())
    }
}
