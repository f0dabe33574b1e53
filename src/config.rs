//! Configuration bundle for the bridge process.
//!
//! Everything the bridge needs is read once at startup from a single TOML
//! file. The file path comes from `PORTLINK_CONFIG` or falls back to
//! `portlink/portlink.toml` under the platform config directory. Validation
//! is deliberately thin: required strings must be non-empty, nothing more.
//! Topic strings are rendered once from their `{device_id}` templates and
//! stay fixed for the process lifetime.

use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Environment variable overriding the config file location.
pub const CONFIG_PATH_ENV: &str = "PORTLINK_CONFIG";

const CONFIG_DIR: &str = "portlink";
const CONFIG_FILE: &str = "portlink.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no config file location; set {CONFIG_PATH_ENV} or create a platform config dir")]
    NoConfigPath,

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("config field `{0}` must not be empty")]
    EmptyField(&'static str),
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// Identifier of the attached device, used in topic names and alerts.
    pub device_id: String,
    /// Period of the status poll duty in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    pub serial: SerialConfig,
    pub broker: BrokerConfig,
    pub notifier: NotifierConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SerialConfig {
    /// Device path, e.g. `/dev/ttyUSB0`.
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Wait after writing a command before draining the response; 1-3s is
    /// the range the device tolerates.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Per-read timeout while draining buffered input.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    pub host: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Template for the subscribed command topic; `{device_id}` is
    /// substituted once at startup.
    #[serde(default = "default_control_topic")]
    pub control_topic: String,
    /// Template for the published status topic.
    #[serde(default = "default_response_topic")]
    pub response_topic: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifierConfig {
    pub bot_token: String,
    pub chat_id: String,
}

impl BridgeConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path()?;
        Self::from_file(&path)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.into(),
            source,
        })?;
        let config: Self = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.into(),
            source,
        })?;
        config.validate()?;
        info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("device_id", self.device_id.as_str()),
            ("serial.port", self.serial.port.as_str()),
            ("broker.host", self.broker.host.as_str()),
            ("broker.username", self.broker.username.as_str()),
            ("broker.password", self.broker.password.as_str()),
            ("broker.control_topic", self.broker.control_topic.as_str()),
            ("broker.response_topic", self.broker.response_topic.as_str()),
            ("notifier.bot_token", self.notifier.bot_token.as_str()),
            ("notifier.chat_id", self.notifier.chat_id.as_str()),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::EmptyField(name));
            }
        }
        Ok(())
    }
}

/// Substitutes the device identifier into a topic template.
pub fn render_topic(template: &str, device_id: &str) -> String {
    template.replace("{device_id}", device_id)
}

fn config_path() -> Result<PathBuf, ConfigError> {
    if let Ok(path) = env::var(CONFIG_PATH_ENV) {
        return Ok(PathBuf::from(path));
    }
    dirs::config_dir()
        .map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
        .ok_or(ConfigError::NoConfigPath)
}

fn default_poll_interval_ms() -> u64 {
    3000
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_settle_delay_ms() -> u64 {
    1000
}

fn default_read_timeout_ms() -> u64 {
    200
}

fn default_broker_port() -> u16 {
    8883
}

fn default_control_topic() -> String {
    "devices/{device_id}/control".to_string()
}

fn default_response_topic() -> String {
    "devices/{device_id}/response".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
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
    "#;

    #[test]
    fn parses_sample_with_defaults() {
        let config: BridgeConfig = toml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.serial.baud_rate, 9600);
        assert_eq!(config.serial.settle_delay_ms, 1000);
        assert_eq!(config.broker.port, 8883);
        assert_eq!(config.poll_interval(), Duration::from_millis(3000));
        assert_eq!(config.broker.control_topic, "devices/{device_id}/control");
    }

    #[test]
    fn rejects_empty_required_field() {
        let mut config: BridgeConfig = toml::from_str(SAMPLE).unwrap();
        config.broker.password = "  ".to_string();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::EmptyField("broker.password")));
    }

    #[test]
    fn renders_topics_from_template() {
        assert_eq!(
            render_topic("devices/{device_id}/control", "greenhouse-1"),
            "devices/greenhouse-1/control"
        );
        assert_eq!(render_topic("fixed/topic", "greenhouse-1"), "fixed/topic");
    }
}
