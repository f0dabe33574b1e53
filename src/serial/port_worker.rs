//! Blocking serial worker.
//!
//! Owns the device handle for the process lifetime and executes one request
//! at a time, so transactions from the two bridge duties are serialized by
//! construction. Runs on its own OS thread; the tokio runtime never touches
//! the port directly.

use std::io::{self, Read, Write};
use std::time::Duration;

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::{is_status_line, SerialError, SerialSettings};

const READ_CHUNK_SIZE: usize = 256;

pub(crate) enum PortRequest {
    SendCommand {
        command: String,
        reply: oneshot::Sender<Vec<String>>,
    },
    Drain {
        reply: oneshot::Sender<Vec<String>>,
    },
    ClearBuffer {
        reply: oneshot::Sender<bool>,
    },
}

/// Minimal surface the worker needs from a serial device. Implemented by
/// the real port below and by scripted fakes in tests.
pub(crate) trait DevicePort: Send {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;
    fn bytes_to_read(&mut self) -> io::Result<usize>;
    /// Reads into `buf`, returning `Ok(0)` when nothing arrived within the
    /// port timeout.
    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    /// Closes and reopens the device with empty buffers.
    fn reopen(&mut self) -> io::Result<()>;
}

/// The real device, a thin wrapper keeping the open parameters around so
/// the port can be reopened for recovery.
pub(crate) struct SerialDevice {
    path: String,
    baud_rate: u32,
    read_timeout: Duration,
    port: Box<dyn SerialPort>,
}

impl SerialDevice {
    pub(crate) fn open(settings: &SerialSettings) -> Result<Self, SerialError> {
        let port = Self::open_port(&settings.path, settings.baud_rate, settings.read_timeout)
            .map_err(|source| SerialError::Open {
                path: settings.path.clone(),
                source,
            })?;
        info!(path = %settings.path, baud = settings.baud_rate, "serial device opened");
        Ok(Self {
            path: settings.path.clone(),
            baud_rate: settings.baud_rate,
            read_timeout: settings.read_timeout,
            port,
        })
    }

    fn open_port(
        path: &str,
        baud_rate: u32,
        read_timeout: Duration,
    ) -> Result<Box<dyn SerialPort>, serialport::Error> {
        serialport::new(path, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(read_timeout)
            .open()
    }
}

impl DevicePort for SerialDevice {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.port.write_all(bytes)?;
        self.port.flush()
    }

    fn bytes_to_read(&mut self) -> io::Result<usize> {
        self.port
            .bytes_to_read()
            .map(|n| n as usize)
            .map_err(io::Error::from)
    }

    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(err) if err.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(err) => Err(err),
        }
    }

    fn reopen(&mut self) -> io::Result<()> {
        self.port = Self::open_port(&self.path, self.baud_rate, self.read_timeout)
            .map_err(io::Error::from)?;
        self.port
            .clear(ClearBuffer::All)
            .map_err(io::Error::from)?;
        Ok(())
    }
}

pub(crate) struct PortWorker<P: DevicePort> {
    port: P,
    settings: SerialSettings,
    /// Bytes of a line whose terminator has not arrived yet; completed by
    /// the next drain instead of being dropped.
    carry: Vec<u8>,
}

impl<P: DevicePort + 'static> PortWorker<P> {
    pub(crate) fn spawn(
        port: P,
        settings: SerialSettings,
        mut queue: mpsc::Receiver<PortRequest>,
    ) -> io::Result<()> {
        std::thread::Builder::new()
            .name("serial-io".to_string())
            .spawn(move || {
                let mut worker = PortWorker {
                    port,
                    settings,
                    carry: Vec::new(),
                };
                while let Some(request) = queue.blocking_recv() {
                    worker.handle(request);
                }
                debug!("request queue closed, serial worker exiting");
            })?;
        Ok(())
    }

    fn handle(&mut self, request: PortRequest) {
        match request {
            PortRequest::SendCommand { command, reply } => {
                let _ = reply.send(self.transaction(&command));
            }
            PortRequest::Drain { reply } => {
                let _ = reply.send(self.drain());
            }
            PortRequest::ClearBuffer { reply } => {
                let _ = reply.send(self.clear());
            }
        }
    }

    /// Write, settle, drain. A failed write means "no response"; the caller
    /// decides whether that matters.
    fn transaction(&mut self, command: &str) -> Vec<String> {
        let mut framed = String::with_capacity(command.len() + 1);
        framed.push_str(command);
        framed.push('\n');
        if let Err(err) = self.port.write_all(framed.as_bytes()) {
            warn!(%err, command, "serial write failed, treating as no response");
            return Vec::new();
        }
        std::thread::sleep(self.settings.settle_delay);
        self.drain()
    }

    /// Drains currently buffered input into trimmed, marker-qualified lines,
    /// preserving read order. Bounded by the per-read timeout and the
    /// max-lines cap, so a continuously streaming device cannot pin us here.
    fn drain(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        // Leftovers from a capped or partial earlier drain come first.
        self.split_complete_lines(&mut lines);
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        while lines.len() < self.settings.max_lines_per_drain {
            match self.port.bytes_to_read() {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) => {
                    warn!(%err, "serial status query failed mid-drain");
                    break;
                }
            }
            match self.port.read_some(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    self.carry.extend_from_slice(&chunk[..n]);
                    self.split_complete_lines(&mut lines);
                }
                Err(err) => {
                    warn!(%err, "serial read failed mid-drain");
                    break;
                }
            }
        }
        lines
    }

    fn split_complete_lines(&mut self, lines: &mut Vec<String>) {
        while lines.len() < self.settings.max_lines_per_drain {
            let Some(pos) = self.carry.iter().position(|&b| b == b'\n') else {
                break;
            };
            let raw: Vec<u8> = self.carry.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&raw);
            let line = text.trim();
            if !line.is_empty() && is_status_line(line) {
                lines.push(line.to_string());
            }
        }
    }

    fn clear(&mut self) -> bool {
        self.carry.clear();
        match self.port.reopen() {
            Ok(()) => true,
            Err(err) => {
                warn!(%err, "failed to reset serial device");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::SerialHandle;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Scripted stand-in for the device: reads consume a primed buffer,
    /// writes optionally echo a response the way the bench device does.
    struct FakePort {
        buffered: VecDeque<u8>,
        written: Vec<String>,
        echo: bool,
        open: bool,
        reopens: usize,
        fail_writes: bool,
    }

    impl FakePort {
        fn new() -> Self {
            Self {
                buffered: VecDeque::new(),
                written: Vec::new(),
                echo: false,
                open: true,
                reopens: 0,
                fail_writes: false,
            }
        }

        fn echoing() -> Self {
            Self {
                echo: true,
                ..Self::new()
            }
        }

        fn prime(&mut self, text: &str) {
            self.buffered.extend(text.bytes());
        }
    }

    impl DevicePort for FakePort {
        fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
            if self.fail_writes {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device detached"));
            }
            let command = String::from_utf8_lossy(bytes).trim().to_string();
            if self.echo {
                let response = format!("{command}-RESPONSE\n");
                self.prime(&response);
            }
            self.written.push(command);
            Ok(())
        }

        fn bytes_to_read(&mut self) -> io::Result<usize> {
            Ok(self.buffered.len())
        }

        fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(self.buffered.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.buffered.pop_front().unwrap();
            }
            Ok(n)
        }

        fn reopen(&mut self) -> io::Result<()> {
            self.buffered.clear();
            self.open = true;
            self.reopens += 1;
            Ok(())
        }
    }

    /// Same fake behind a lock, for tests that go through the handle and
    /// need to inspect state afterwards.
    #[derive(Clone)]
    struct SharedPort(Arc<Mutex<FakePort>>);

    impl DevicePort for SharedPort {
        fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
            self.0.lock().unwrap().write_all(bytes)
        }

        fn bytes_to_read(&mut self) -> io::Result<usize> {
            self.0.lock().unwrap().bytes_to_read()
        }

        fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.0.lock().unwrap().read_some(buf)
        }

        fn reopen(&mut self) -> io::Result<()> {
            self.0.lock().unwrap().reopen()
        }
    }

    fn test_settings() -> SerialSettings {
        SerialSettings {
            path: "fake".to_string(),
            baud_rate: 9600,
            settle_delay: Duration::ZERO,
            read_timeout: Duration::from_millis(10),
            max_lines_per_drain: 64,
        }
    }

    fn worker_with(port: FakePort) -> PortWorker<FakePort> {
        PortWorker {
            port,
            settings: test_settings(),
            carry: Vec::new(),
        }
    }

    #[test]
    fn drain_filters_and_preserves_order() {
        let mut port = FakePort::new();
        port.prime("ok\nTEMP-21\n\nPRESSURE-5\n");
        let mut worker = worker_with(port);
        assert_eq!(worker.drain(), vec!["TEMP-21", "PRESSURE-5"]);
    }

    #[test]
    fn transaction_returns_device_echo() {
        let mut worker = worker_with(FakePort::echoing());
        assert_eq!(worker.transaction("TEST"), vec!["TEST-RESPONSE"]);
        assert_eq!(worker.port.written, vec!["TEST"]);
    }

    #[test]
    fn empty_poll_returns_nothing() {
        let mut worker = worker_with(FakePort::new());
        assert!(worker.drain().is_empty());
    }

    #[test]
    fn write_failure_is_swallowed() {
        let mut port = FakePort::new();
        port.fail_writes = true;
        let mut worker = worker_with(port);
        assert!(worker.transaction("STATUS").is_empty());
    }

    #[test]
    fn partial_line_carries_to_next_drain() {
        let mut port = FakePort::new();
        port.prime("TEMP-2");
        let mut worker = worker_with(port);
        assert!(worker.drain().is_empty());
        worker.port.prime("1\n");
        assert_eq!(worker.drain(), vec!["TEMP-21"]);
    }

    #[test]
    fn drain_is_bounded_by_the_line_cap() {
        let mut port = FakePort::new();
        for i in 0..70 {
            port.prime(&format!("LINE-{i}\n"));
        }
        let mut worker = worker_with(port);
        let first = worker.drain();
        assert_eq!(first.len(), 64);
        assert_eq!(first[0], "LINE-0");
        assert_eq!(first[63], "LINE-63");
        let rest = worker.drain();
        assert_eq!(rest.len(), 6);
        assert_eq!(rest[5], "LINE-69");
    }

    #[tokio::test]
    async fn clear_buffer_twice_leaves_the_device_open_and_empty() {
        let state = Arc::new(Mutex::new(FakePort::new()));
        state.lock().unwrap().prime("STALE-1\nSTALE-2\n");
        let handle = SerialHandle::start(SharedPort(state.clone()), test_settings()).unwrap();

        assert!(handle.clear_buffer().await);
        assert!(handle.clear_buffer().await);

        {
            let port = state.lock().unwrap();
            assert!(port.open);
            assert_eq!(port.reopens, 2);
            assert!(port.buffered.is_empty());
        }
        assert!(handle.read_poll().await.is_empty());
    }

    #[tokio::test]
    async fn concurrent_command_and_poll_do_not_interleave() {
        let state = Arc::new(Mutex::new(FakePort::echoing()));
        let mut settings = test_settings();
        // A real settle window, so an unserialized poll would have time to
        // steal the echo between write and drain.
        settings.settle_delay = Duration::from_millis(50);
        let handle = SerialHandle::start(SharedPort(state.clone()), settings).unwrap();

        let (response, polled) = tokio::join!(handle.send_command("CMD"), handle.read_poll());

        assert_eq!(response, vec!["CMD-RESPONSE"]);
        assert!(polled.is_empty());
    }
}
