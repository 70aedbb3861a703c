//! USB serial transport: per-port listener with DTR/RTS reset, chunk
//! reassembly, and a shared write path (§4.4 of the spec).
//!
//! Port I/O is synchronous (the `serialport` crate has no async API), so
//! each connected port gets one `spawn_blocking` task that owns the read
//! loop end-to-end and calls into the (synchronous) [`FrameDispatcher`]
//! directly -- there's no need to hop back onto the async runtime per
//! line. Grounded on the teacher's `OwnedJoinHandle`-tracked worker style
//! (`minidsp/src/transport/hub.rs`) generalized from its message-passing
//! transport to a line-oriented one.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use serialport::{ClearBuffer, DataBits, Parity, SerialPort, StopBits};
use tokio::sync::Mutex;

use crate::error::{GatewayError, Result};
use crate::frame::{FrameDispatcher, FrameSource};
use crate::registry::DeviceRegistry;
use crate::state::TransportKind;
use crate::store::DefinitionStore;

const BAUD_RATE: u32 = 9600;
const READ_TIMEOUT: Duration = Duration::from_millis(100);
const DTR_SETTLE: Duration = Duration::from_millis(100);
const RESET_SETTLE: Duration = Duration::from_millis(200);
const DRAIN_DEADLINE: Duration = Duration::from_secs(2);
const IDLE_SLEEP: Duration = Duration::from_millis(10);
const CHUNK_TOTAL_CEILING: usize = 64;

type PortHandleInner = Arc<StdMutex<Box<dyn SerialPort>>>;

struct Connection {
    device_id: String,
    handle: PortHandleInner,
    cancel: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
}

pub struct SerialTransport {
    registry: Arc<DeviceRegistry>,
    dispatcher: Arc<FrameDispatcher>,
    definitions: Arc<DefinitionStore>,
    connections: Mutex<HashMap<String, Connection>>,
}

impl SerialTransport {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        dispatcher: Arc<FrameDispatcher>,
        definitions: Arc<DefinitionStore>,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            definitions,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Host tty candidates, straight from the serial port library's own
    /// enumeration. Doesn't touch the registry.
    pub fn list_ports() -> Vec<String> {
        serialport::available_ports()
            .map(|ports| ports.into_iter().map(|p| p.port_name).collect())
            .unwrap_or_default()
    }

    /// Opens `port`, reads lines for up to `timeout`, and returns the
    /// first known device id whose `usb_identifiers` appear (uppercased
    /// substring match) in any line. The port is always closed before
    /// returning.
    pub async fn detect(&self, port: &str, timeout: Duration) -> Option<String> {
        let candidates = self.definitions.usb_identifier_candidates();
        let port = port.to_string();
        tokio::task::spawn_blocking(move || detect_blocking(&port, timeout, &candidates))
            .await
            .unwrap_or(None)
    }

    /// Idempotent per port: a second call for a port with a live listener
    /// returns success without spawning a second one.
    pub async fn connect(&self, port: &str, id: &str) -> Result<()> {
        let mut connections = self.connections.lock().await;
        if let Some(existing) = connections.get(port) {
            if existing.alive.load(Ordering::SeqCst) {
                return Ok(());
            }
            connections.remove(port);
        }

        let port_owned = port.to_string();
        let opened = tokio::task::spawn_blocking(move || open_and_reset(&port_owned))
            .await
            .map_err(|e| GatewayError::IoFatal(e.to_string()))?
            .map_err(|e| GatewayError::IoFatal(e.to_string()))?;

        self.registry.update(id, |s| {
            s.transport = TransportKind::Usb;
            s.serial.port = Some(port.to_string());
            s.connected = false;
            s.network.ip = None;
        });

        let handle: PortHandleInner = Arc::new(StdMutex::new(opened));
        let cancel = Arc::new(AtomicBool::new(false));
        let alive = Arc::new(AtomicBool::new(true));

        let task = {
            let handle = handle.clone();
            let cancel = cancel.clone();
            let alive = alive.clone();
            let device_id = id.to_string();
            let port_name = port.to_string();
            let dispatcher = self.dispatcher.clone();
            let registry = self.registry.clone();
            tokio::task::spawn_blocking(move || {
                listen(handle, cancel, device_id.clone(), port_name, dispatcher);
                alive.store(false, Ordering::SeqCst);
                registry.update(&device_id, |s| s.connected = false);
            })
        };

        connections.insert(
            port.to_string(),
            Connection {
                device_id: id.to_string(),
                handle,
                cancel,
                alive,
                task,
            },
        );
        Ok(())
    }

    /// Signals the listener to exit and marks the device disconnected.
    /// A no-op (returns `Ok`) if the port has no active connection.
    pub async fn disconnect(&self, port: &str) -> Result<()> {
        let mut connections = self.connections.lock().await;
        let Some(connection) = connections.remove(port) else {
            return Ok(());
        };
        connection.cancel.store(true, Ordering::SeqCst);
        self.registry.update(&connection.device_id, |s| s.connected = false);
        connection.task.abort();
        Ok(())
    }

    /// Writes `cmd` (newline-terminated) to `port`. Reuses the listener's
    /// open handle under its port-level lock if one exists; otherwise
    /// performs a one-shot open/write/close.
    pub async fn send(&self, port: &str, cmd: &[u8]) -> Result<()> {
        let handle = {
            let connections = self.connections.lock().await;
            connections.get(port).map(|c| c.handle.clone())
        };

        let mut payload = cmd.to_vec();
        payload.push(b'\n');
        let port_owned = port.to_string();

        tokio::task::spawn_blocking(move || match handle {
            Some(handle) => {
                let mut guard = handle.lock().unwrap();
                guard
                    .write_all(&payload)
                    .map_err(|e| GatewayError::IoTransient(e.to_string()))
            }
            None => {
                let mut port = serialport::new(&port_owned, BAUD_RATE)
                    .timeout(READ_TIMEOUT)
                    .open()
                    .map_err(|e| GatewayError::IoTransient(e.to_string()))?;
                port.write_all(&payload)
                    .map_err(|e| GatewayError::IoTransient(e.to_string()))
            }
        })
        .await
        .map_err(|e| GatewayError::IoFatal(e.to_string()))?
    }
}

fn open_and_reset(port: &str) -> std::result::Result<Box<dyn SerialPort>, serialport::Error> {
    let mut handle = serialport::new(port, BAUD_RATE)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .timeout(READ_TIMEOUT)
        .open()?;

    handle.write_data_terminal_ready(false)?;
    handle.write_request_to_send(false)?;
    std::thread::sleep(DTR_SETTLE);

    handle.write_data_terminal_ready(true)?;
    handle.write_request_to_send(true)?;
    std::thread::sleep(RESET_SETTLE);

    handle.clear(ClearBuffer::All)?;

    let deadline = Instant::now() + DRAIN_DEADLINE;
    let mut scratch = [0u8; 256];
    while Instant::now() < deadline {
        match handle.bytes_to_read() {
            Ok(0) => break,
            Ok(_) => {
                if handle.read(&mut scratch).is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }

    handle.set_timeout(READ_TIMEOUT)?;
    Ok(handle)
}

fn detect_blocking(port: &str, timeout: Duration, candidates: &[(String, String)]) -> Option<String> {
    let mut handle = serialport::new(port, BAUD_RATE).timeout(READ_TIMEOUT).open().ok()?;
    let deadline = Instant::now() + timeout;
    let mut line_buf: Vec<u8> = Vec::new();
    let mut scratch = [0u8; 256];

    while Instant::now() < deadline {
        let n = match handle.read(&mut scratch) {
            Ok(n) => n,
            Err(e) if is_read_timeout(&e) => 0,
            Err(_) => break,
        };
        if n == 0 {
            std::thread::sleep(IDLE_SLEEP);
            continue;
        }
        line_buf.extend_from_slice(&scratch[..n]);
        while let Some(pos) = line_buf.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = line_buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw).trim().to_uppercase();
            if let Some((id, _)) = candidates.iter().find(|(_, marker)| line.contains(marker.as_str())) {
                return Some(id.clone());
            }
        }
    }
    None
}

fn is_read_timeout(e: &std::io::Error) -> bool {
    matches!(e.kind(), std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock)
}

/// Per-port chunk reassembly state, kept here rather than per-device
/// since chunks travel on the physical port (§9 design note).
#[derive(Default)]
struct ChunkBuffer {
    total: Option<usize>,
    parts: HashMap<usize, String>,
}

impl ChunkBuffer {
    fn reset(&mut self) {
        self.total = None;
        self.parts.clear();
    }

    /// Accepts one `CHUNK_n/total:payload` line. Returns the assembled
    /// line once every part up to `total` has arrived.
    fn accept(&mut self, n: usize, total: usize, payload: &str) -> Option<String> {
        if n == 0 || total == 0 || total > CHUNK_TOTAL_CEILING {
            return None;
        }

        if self.total != Some(total) {
            self.reset();
            self.total = Some(total);
        }
        self.parts.insert(n, payload.to_string());

        if self.parts.len() > total {
            self.reset();
            return None;
        }
        if self.parts.len() < total {
            return None;
        }

        let mut keys: Vec<_> = self.parts.keys().copied().collect();
        keys.sort_unstable();
        let assembled = keys.into_iter().map(|k| self.parts[&k].clone()).collect::<String>();
        self.reset();
        Some(assembled)
    }
}

fn parse_chunk_header(line: &str) -> Option<(usize, usize, String)> {
    let rest = line.strip_prefix("CHUNK_")?;
    let (header, payload) = rest.split_once(':')?;
    let (n_str, total_str) = header.split_once('/')?;
    let n: usize = n_str.parse().ok()?;
    let total: usize = total_str.parse().ok()?;
    Some((n, total, payload.to_string()))
}

fn listen(
    handle: PortHandleInner,
    cancel: Arc<AtomicBool>,
    device_id: String,
    port_name: String,
    dispatcher: Arc<FrameDispatcher>,
) {
    let mut line_buf: Vec<u8> = Vec::new();
    let mut chunks = ChunkBuffer::default();
    let mut scratch = [0u8; 256];

    loop {
        if cancel.load(Ordering::SeqCst) {
            return;
        }

        let read_result = {
            let mut guard = handle.lock().unwrap();
            guard.read(&mut scratch)
        };

        let n = match read_result {
            Ok(n) => n,
            Err(e) if is_read_timeout(&e) => 0,
            Err(e) => {
                log::warn!("serial port {port_name} failed: {e}");
                return;
            }
        };

        if n == 0 {
            std::thread::sleep(IDLE_SLEEP);
            continue;
        }

        line_buf.extend_from_slice(&scratch[..n]);
        while let Some(pos) = line_buf.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = line_buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw).trim().to_string();
            if line.is_empty() {
                continue;
            }

            let dispatched = if line.starts_with("CHUNK_") {
                match parse_chunk_header(&line) {
                    Some((n, total, payload)) => chunks.accept(n, total, &payload),
                    None => None,
                }
            } else {
                Some(line)
            };

            if let Some(assembled) = dispatched {
                dispatcher.ensure_usb_connected(&device_id);
                dispatcher.dispatch(
                    &assembled,
                    FrameSource::Serial {
                        port: port_name.clone(),
                        device_id: device_id.clone(),
                    },
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_buffer_reassembles_out_of_order() {
        let mut buf = ChunkBuffer::default();
        assert_eq!(buf.accept(2, 3, "world"), None);
        assert_eq!(buf.accept(1, 3, "hello "), None);
        assert_eq!(buf.accept(3, 3, "!"), Some("hello world!".to_string()));
    }

    #[test]
    fn chunk_buffer_starts_fresh_after_completion() {
        let mut buf = ChunkBuffer::default();
        buf.accept(1, 2, "a");
        buf.accept(2, 2, "b");
        assert_eq!(buf.accept(1, 2, "x"), None);
        assert_eq!(buf.parts.len(), 1);
    }

    #[test]
    fn chunk_buffer_discards_on_overflow() {
        let mut buf = ChunkBuffer::default();
        buf.accept(1, 2, "a");
        assert_eq!(buf.accept(2, 2, "b"), Some("ab".to_string()));
        // simulate a desync: more parts arrive than the declared total
        buf.accept(1, 3, "x");
        buf.accept(2, 3, "y");
        assert_eq!(buf.accept(3, 3, "z"), Some("xyz".to_string()));
    }

    #[test]
    fn chunk_buffer_rejects_totals_above_ceiling() {
        let mut buf = ChunkBuffer::default();
        assert_eq!(buf.accept(1, 65, "x"), None);
        assert!(buf.parts.is_empty());
    }

    #[test]
    fn parse_chunk_header_extracts_fields() {
        let (n, total, payload) = parse_chunk_header("CHUNK_2/3:world").unwrap();
        assert_eq!((n, total), (2, 3));
        assert_eq!(payload, "world");
    }

    #[test]
    fn parse_chunk_header_rejects_malformed() {
        assert!(parse_chunk_header("CHUNK_nope").is_none());
        assert!(parse_chunk_header("CHUNK_1:missing_total").is_none());
    }
}
