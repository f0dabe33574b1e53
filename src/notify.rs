//! Out-of-band operator alerting.
//!
//! Alerts go to a Telegram-style bot endpoint over HTTPS. Delivery is
//! fire-and-forget at every trigger point: a failure to alert must never
//! change what the bridge does next, so implementations log and swallow.

use async_trait::async_trait;
use chrono::Local;
use serde::Serialize;
use std::time::Duration;
use tracing::warn;

use crate::config::NotifierConfig;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Alert sink consumed by the broker link at its two trigger points:
/// successful (re)subscribe and terminal retry exhaustion.
#[async_trait]
pub trait Notify: Send + Sync {
    async fn send(&self, text: &str);
}

/// Markdown alert for a successful (re)subscribe.
pub fn subscribed_alert(device_id: &str, topic: &str) -> String {
    format!(
        "*{device_id}* bridge online, listening on `{topic}` ({})",
        Local::now().format(TIMESTAMP_FORMAT)
    )
}

/// Markdown alert for the terminal state: the retry budget is spent and the
/// process is about to exit.
pub fn exhausted_alert(device_id: &str, attempts: u32) -> String {
    format!(
        "*{device_id}* bridge lost the broker, giving up after {attempts} attempts ({})",
        Local::now().format(TIMESTAMP_FORMAT)
    )
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'a str,
}

/// Production sink: the bot API `sendMessage` call, markdown body.
pub struct TelegramNotifier {
    api_url: String,
    chat_id: String,
    client: reqwest::Client,
}

impl TelegramNotifier {
    pub fn new(config: &NotifierConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            api_url: format!(
                "https://api.telegram.org/bot{}/sendMessage",
                config.bot_token
            ),
            chat_id: config.chat_id.clone(),
            client,
        })
    }
}

#[async_trait]
impl Notify for TelegramNotifier {
    async fn send(&self, text: &str) {
        let payload = SendMessage {
            chat_id: &self.chat_id,
            text,
            parse_mode: "Markdown",
        };
        match self.client.post(&self.api_url).form(&payload).send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => warn!(status = %response.status(), "alert rejected by the bot API"),
            Err(err) => warn!(%err, "alert delivery failed"),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Test sink capturing alert texts for assertions.
    #[derive(Default)]
    pub(crate) struct RecordingNotifier {
        texts: Mutex<Vec<String>>,
    }

    impl RecordingNotifier {
        pub(crate) fn sent(&self) -> Vec<String> {
            self.texts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Notify for RecordingNotifier {
        async fn send(&self, text: &str) {
            self.texts.lock().unwrap().push(text.to_string());
        }
    }

    #[test]
    fn alerts_carry_the_device_id() {
        let online = subscribed_alert("greenhouse-1", "devices/greenhouse-1/control");
        assert!(online.contains("*greenhouse-1*"));
        assert!(online.contains("`devices/greenhouse-1/control`"));

        let fatal = exhausted_alert("greenhouse-1", 5);
        assert!(fatal.contains("*greenhouse-1*"));
        assert!(fatal.contains("5 attempts"));
    }
}
