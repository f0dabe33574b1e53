//! Orchestrates the two bridge duties over one serial device and one
//! broker link.
//!
//! ```text
//! broker ─► subscriber ─[Command]─► inbound duty ─► serial device
//! serial device ─► poll duty ─[status lines]─► broker response topic
//! ```
//!
//! The inbound duty relays commands for as long as the subscriber feeds the
//! channel; the poll duty drains the device on a fixed period. Both reach
//! the device through the same [`SerialHandle`], so their transactions are
//! serialized by the serial worker. Shutdown is coordinated through one
//! cancellation token and is idempotent and bounded.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::broker_link::{BrokerLink, StatusPublisher};
use crate::broker::{BrokerError, Command};
use crate::serial::SerialHandle;

const COMMAND_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("subscriber task aborted unexpectedly")]
    SubscriberLost,
}

pub struct Bridge {
    serial: SerialHandle,
    link: BrokerLink,
    publisher: StatusPublisher,
    poll_interval: Duration,
}

impl Bridge {
    pub fn new(serial: SerialHandle, link: BrokerLink, poll_interval: Duration) -> Self {
        let publisher = link.publisher();
        Self {
            serial,
            link,
            publisher,
            poll_interval,
        }
    }

    /// Runs both duties until `shutdown` fires or the broker link gives up.
    /// A clean shutdown returns `Ok`; retry exhaustion comes back as the
    /// broker's typed error so the caller can pick the exit code.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), BridgeError> {
        // Drop whatever the device buffered before we existed, so the first
        // poll republishes nothing stale.
        if !self.serial.clear_buffer().await {
            warn!("could not reset the device buffers at startup");
        }

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);

        let subscriber = tokio::spawn(self.link.run_subscriber(command_tx, shutdown.clone()));
        let inbound = tokio::spawn(inbound_duty(self.serial.clone(), command_rx));
        let poll = tokio::spawn(poll_duty(
            self.serial,
            self.publisher,
            self.poll_interval,
            shutdown.clone(),
        ));

        // The subscriber decides how the bridge ends: Ok when shutdown was
        // requested, Err when the retry budget ran out.
        let result = match subscriber.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(BridgeError::Broker(err)),
            Err(join_err) => {
                error!(%join_err, "subscriber task aborted");
                Err(BridgeError::SubscriberLost)
            }
        };

        // Either way, wind the duties down. The subscriber has dropped the
        // command sender, so the inbound duty drains and exits on its own.
        shutdown.cancel();
        if let Err(err) = inbound.await {
            warn!(%err, "inbound duty did not stop cleanly");
        }
        if let Err(err) = poll.await {
            warn!(%err, "poll duty did not stop cleanly");
        }
        info!("bridge shut down");
        result
    }
}

/// Relays each inbound command to the device and logs the outcome. Runs
/// until the subscriber closes the channel; per-command problems never end
/// the duty.
async fn inbound_duty(serial: SerialHandle, mut commands: mpsc::Receiver<Command>) {
    while let Some(command) = commands.recv().await {
        let response = serial.send_command(command.as_str()).await;
        if response.is_empty() {
            info!(%command, "command forwarded, no status lines in response");
        } else {
            info!(%command, lines = response.len(), "command forwarded");
        }
    }
    debug!("command channel closed, inbound duty finished");
}

/// Drains the device on a fixed period and publishes every qualifying line
/// individually, preserving read order. Checks the shutdown token at least
/// once per period.
async fn poll_duty(
    serial: SerialHandle,
    publisher: StatusPublisher,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = interval(period);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let lines = serial.read_poll().await;
                if lines.is_empty() {
                    continue;
                }
                debug!(lines = lines.len(), "publishing polled status lines");
                for line in &lines {
                    publisher.publish(line).await;
                }
            }
        }
    }
    debug!("poll duty finished");
}
