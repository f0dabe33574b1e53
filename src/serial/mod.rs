//! # Serial Channel
//!
//! Mediates all device I/O as discrete transactions. The device handle is
//! owned by a single blocking worker thread ([`port_worker`]); every caller
//! goes through [`SerialHandle`], whose requests travel over an mpsc queue
//! and are answered on oneshot channels. Because the worker processes one
//! request at a time, a command transaction and a poll drain can never
//! interleave reads on the same input buffer.
//!
//! ```text
//! inbound duty ──┐
//!                ├─[PortRequest]─► worker thread ─► serialport handle
//! poll duty   ───┘                    (blocking I/O, settle delays)
//! ```
//!
//! Transactions are write+settle+drain: the command goes out with a line
//! terminator, the worker waits a fixed settle delay, then drains whatever
//! the device buffered. Drains are bounded (per-read timeout, max line
//! count) and only lines carrying the [`STATUS_MARKER`] survive filtering.

pub mod port_worker;

use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::config::SerialConfig;
use self::port_worker::{DevicePort, PortRequest, PortWorker, SerialDevice};

/// A device output line is forwarded only if it contains this marker.
pub const STATUS_MARKER: char = '-';

/// Upper bound on lines returned by a single drain; the rest stay buffered
/// for the next call.
pub const MAX_LINES_PER_DRAIN: usize = 64;

const REQUEST_QUEUE_CAPACITY: usize = 32;

/// Returns true when a device output line qualifies for forwarding.
pub fn is_status_line(line: &str) -> bool {
    line.contains(STATUS_MARKER)
}

#[derive(Debug, Clone)]
pub struct SerialSettings {
    pub path: String,
    pub baud_rate: u32,
    pub settle_delay: Duration,
    pub read_timeout: Duration,
    pub max_lines_per_drain: usize,
}

impl SerialSettings {
    pub fn from_config(config: &SerialConfig) -> Self {
        Self {
            path: config.port.clone(),
            baud_rate: config.baud_rate,
            settle_delay: Duration::from_millis(config.settle_delay_ms),
            read_timeout: Duration::from_millis(config.read_timeout_ms),
            max_lines_per_drain: MAX_LINES_PER_DRAIN,
        }
    }
}

#[derive(Debug, Error)]
pub enum SerialError {
    /// The device could not be opened. The process cannot run without it.
    #[error("failed to open serial device {path}: {source}")]
    Open {
        path: String,
        source: serialport::Error,
    },

    #[error("failed to start the serial worker thread: {0}")]
    WorkerSpawn(#[from] std::io::Error),
}

/// Async front for the serial worker. Cheap to clone; all clones feed the
/// same request queue and therefore the same device.
#[derive(Clone)]
pub struct SerialHandle {
    requests: mpsc::Sender<PortRequest>,
}

impl SerialHandle {
    /// Opens the device and starts the worker thread. Open failure is fatal
    /// and propagated; nothing useful runs without the device.
    pub fn open(settings: SerialSettings) -> Result<Self, SerialError> {
        let device = SerialDevice::open(&settings)?;
        Self::start(device, settings)
    }

    pub(crate) fn start<P: DevicePort + 'static>(
        port: P,
        settings: SerialSettings,
    ) -> Result<Self, SerialError> {
        let (requests, queue) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
        PortWorker::spawn(port, settings, queue)?;
        Ok(Self { requests })
    }

    /// Writes `command` plus a line terminator, waits the settle delay and
    /// returns the filtered response lines in read order. Transient device
    /// I/O failures surface as an empty response, never as an error.
    pub async fn send_command(&self, command: &str) -> Vec<String> {
        let command = command.to_owned();
        self.roundtrip(|reply| PortRequest::SendCommand { command, reply }, Vec::new())
            .await
    }

    /// Drains whatever the device already buffered, without writing or
    /// waiting. Returns immediately, possibly with nothing.
    pub async fn read_poll(&self) -> Vec<String> {
        self.roundtrip(|reply| PortRequest::Drain { reply }, Vec::new())
            .await
    }

    /// Closes and reopens the device, discarding both buffers. Idempotent;
    /// meant for recovery, not the hot path.
    pub async fn clear_buffer(&self) -> bool {
        self.roundtrip(|reply| PortRequest::ClearBuffer { reply }, false)
            .await
    }

    async fn roundtrip<T>(
        &self,
        request: impl FnOnce(oneshot::Sender<T>) -> PortRequest,
        fallback: T,
    ) -> T {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.requests.send(request(reply_tx)).await.is_err() {
            warn!("serial worker is gone, dropping request");
            return fallback;
        }
        match reply_rx.await {
            Ok(value) => value,
            Err(_) => {
                warn!("serial worker dropped a reply");
                fallback
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_decides_forwarding() {
        assert!(is_status_line("TEMP-21"));
        assert!(!is_status_line("ok"));
        assert!(!is_status_line(""));
    }
}
