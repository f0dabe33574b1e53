//! # Broker Link
//!
//! Connection lifecycle against the MQTT broker. Two halves with very
//! different lifetimes:
//!
//! - [`broker_link::BrokerLink`] drives the long-lived subscribe session.
//!   Reconnection is transparent to the consumer: failures walk the
//!   state machine below with a fixed backoff and a bounded retry counter,
//!   and only total exhaustion ends the command stream.
//! - [`broker_link::StatusPublisher`] opens a short-lived session per
//!   published status line. Keeping publishes off the subscribe session
//!   means no connection object is ever used bidirectionally at once; the
//!   extra connection setup is cheap at the polling rate we publish at.
//!
//! ```text
//! Disconnected ─► Connecting ─► Subscribed
//!                    │  ▲           │ session error
//!            failure │  │ retry     ▼
//!                    └─► Backoff ─► Exhausted (cap hit, terminal)
//! ```
//!
//! Exhaustion is reported to the orchestrator as a typed error; the
//! decision to terminate the process stays out of this module.

pub mod broker_link;
pub mod reconnect;

use std::fmt;
use std::time::Duration;

use rumqttc::{MqttOptions, TlsConfiguration, Transport};
use thiserror::Error;

use crate::config::{render_topic, BridgeConfig};

/// Fixed wait between reconnect attempts.
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(6);

/// Consecutive session failures tolerated before giving up for good.
pub const MAX_CONNECT_ATTEMPTS: u32 = 5;

const KEEP_ALIVE: Duration = Duration::from_secs(5);

/// One inbound control-topic payload, forwarded verbatim to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command(String);

impl Command {
    /// Decodes a raw message payload; the device protocol lives in the text
    /// itself, so all we do is drop the line terminator.
    pub fn from_payload(payload: &[u8]) -> Self {
        Self(
            String::from_utf8_lossy(payload)
                .trim_end_matches(['\r', '\n'])
                .to_string(),
        )
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of the long-lived subscribe session. Exactly one per process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Subscribed,
    Backoff,
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub device_id: String,
    /// Rendered once from the config template; stable for the process.
    pub control_topic: String,
    pub response_topic: String,
    pub keep_alive: Duration,
    pub backoff: Duration,
    pub max_attempts: u32,
}

impl BrokerSettings {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            host: config.broker.host.clone(),
            port: config.broker.port,
            username: config.broker.username.clone(),
            password: config.broker.password.clone(),
            device_id: config.device_id.clone(),
            control_topic: render_topic(&config.broker.control_topic, &config.device_id),
            response_topic: render_topic(&config.broker.response_topic, &config.device_id),
            keep_alive: KEEP_ALIVE,
            backoff: RECONNECT_BACKOFF,
            max_attempts: MAX_CONNECT_ATTEMPTS,
        }
    }

    /// Options for one TLS session against the broker. Sessions are cheap
    /// to set up, so both halves build them on demand. The platform trust
    /// store decides which broker certificates are acceptable.
    fn mqtt_options(&self, client_id: &str) -> MqttOptions {
        let mut options = MqttOptions::new(client_id, self.host.clone(), self.port);
        options
            .set_credentials(self.username.clone(), self.password.clone())
            .set_keep_alive(self.keep_alive)
            .set_transport(Transport::Tls(TlsConfiguration::Native));
        options
    }
}

#[derive(Debug, Error)]
pub enum BrokerError {
    /// The retry cap was exhausted; the subscribe stream is over for good.
    #[error("gave up on the broker after {attempts} consecutive failed sessions")]
    RetriesExhausted { attempts: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_payload_is_trimmed_of_line_endings() {
        assert_eq!(Command::from_payload(b"get-status\r\n").as_str(), "get-status");
        assert_eq!(Command::from_payload(b"get-status").as_str(), "get-status");
    }

    #[test]
    fn command_keeps_interior_text_verbatim() {
        assert_eq!(
            Command::from_payload("st\u{e4}ll om l\u{e4}ge 2\n".as_bytes()).as_str(),
            "st\u{e4}ll om l\u{e4}ge 2"
        );
    }

    #[test]
    fn settings_render_topics_once() {
        let config: crate::config::BridgeConfig = toml::from_str(
            r#"
            device_id = "greenhouse-1"

            [serial]
            port = "/dev/ttyUSB0"

            [broker]
            host = "broker.example.net"
            username = "bridge"
            password = "secret"

            [notifier]
            bot_token = "123:abc"
            chat_id = "42"
            "#,
        )
        .unwrap();
        let settings = BrokerSettings::from_config(&config);
        assert_eq!(settings.control_topic, "devices/greenhouse-1/control");
        assert_eq!(settings.response_topic, "devices/greenhouse-1/response");
        assert_eq!(settings.max_attempts, 5);
        assert_eq!(settings.backoff, Duration::from_secs(6));
    }
}
