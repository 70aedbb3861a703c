//! UDP discovery/telemetry transport (§4.3 of the spec).
//!
//! Binds one datagram socket, broadcasts `DISCOVER_DEVICE` on request, and
//! demuxes everything it receives into the shared [`FrameDispatcher`].
//! Grounded on the teacher's own discovery socket handling in
//! `minidsp/src/discovery/{server,client}.rs`, generalized from a
//! single advertise-and-listen pair into a bound, bidirectional socket.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{broadcast, Mutex};

use crate::error::{GatewayError, Result};
use crate::frame::{FrameDispatcher, FrameSource};

pub const UDP_BIND_PORT: u16 = 6272;
const DISCOVERY_MESSAGE: &[u8] = b"DISCOVER_DEVICE PORT=6272";
const RECV_TIMEOUT: Duration = Duration::from_millis(100);
const RECV_BUF_SIZE: usize = 2048;

fn broadcast_targets() -> Vec<SocketAddrV4> {
    let mut targets = vec![SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 255), 8888)];
    for port in 8888..=8891 {
        targets.push(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port));
    }
    targets
}

/// A bound (or permanently disabled) UDP socket. Disabled at construction
/// if the bind fails; the rest of the system continues without it.
pub struct UdpTransport {
    socket: Option<UdpSocket>,
    send_lock: Mutex<()>,
}

impl UdpTransport {
    /// Binds `0.0.0.0:{port}` (normally [`UDP_BIND_PORT`], overridable
    /// from the daemon's config). A bind failure (most commonly
    /// `EADDRINUSE`) is logged once and leaves the transport disabled
    /// rather than propagated -- serial devices must keep working.
    pub async fn bind(port: u16) -> Self {
        match UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).await {
            Ok(socket) => {
                if let Err(e) = socket.set_broadcast(true) {
                    log::warn!("failed to enable broadcast on UDP socket: {e}");
                }
                log::info!("UDP transport bound on port {port}");
                Self {
                    socket: Some(socket),
                    send_lock: Mutex::new(()),
                }
            }
            Err(e) => {
                log::warn!("UDP transport disabled, failed to bind port {port}: {e}");
                Self {
                    socket: None,
                    send_lock: Mutex::new(()),
                }
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.socket.is_some()
    }

    /// Sends the literal discovery message to the LAN broadcast address
    /// and the local simulator ports. Individual send failures are
    /// swallowed -- a partial broadcast is still useful.
    pub async fn broadcast(&self) {
        let Some(socket) = &self.socket else {
            return;
        };
        let _guard = self.send_lock.lock().await;
        for target in broadcast_targets() {
            if let Err(e) = socket.send_to(DISCOVERY_MESSAGE, SocketAddr::V4(target)).await {
                log::trace!("discovery broadcast to {target} failed: {e}");
            }
        }
    }

    /// Sends an opaque command payload to a specific device address.
    pub async fn send(&self, ip: Ipv4Addr, port: u16, bytes: &[u8]) -> Result<()> {
        let Some(socket) = &self.socket else {
            return Err(GatewayError::TransportDisabled);
        };
        let _guard = self.send_lock.lock().await;
        socket
            .send_to(bytes, SocketAddr::V4(SocketAddrV4::new(ip, port)))
            .await
            .map(|_| ())
            .map_err(|e| GatewayError::IoTransient(e.to_string()))
    }

    /// Runs the receive loop until `shutdown` fires. Each complete
    /// datagram is decoded (UTF-8 with replacement), trimmed, and handed
    /// to the dispatcher tagged with its source IP.
    pub async fn run(&self, dispatcher: Arc<FrameDispatcher>, mut shutdown: broadcast::Receiver<()>) {
        let Some(socket) = &self.socket else {
            return;
        };
        let mut buf = vec![0u8; RECV_BUF_SIZE];

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    log::info!("UDP transport shutting down");
                    return;
                }
                result = tokio::time::timeout(RECV_TIMEOUT, socket.recv_from(&mut buf)) => {
                    match result {
                        Err(_elapsed) => continue,
                        Ok(Err(e)) => {
                            if is_transient(&e) {
                                continue;
                            }
                            log::warn!("UDP receive error: {e}");
                            continue;
                        }
                        Ok(Ok((n, SocketAddr::V4(from)))) => {
                            let line = String::from_utf8_lossy(&buf[..n]);
                            dispatcher.dispatch(line.trim(), FrameSource::Network(*from.ip()));
                        }
                        Ok(Ok((_, SocketAddr::V6(_)))) => {
                            // The wire protocol only speaks IPv4.
                        }
                    }
                }
            }
        }
    }
}

fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_targets_include_lan_and_local_simulators() {
        let targets = broadcast_targets();
        assert!(targets.contains(&SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 255), 8888)));
        for port in 8888..=8891 {
            assert!(targets.contains(&SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)));
        }
    }

    #[tokio::test]
    async fn send_on_disabled_transport_is_transport_disabled() {
        let transport = UdpTransport {
            socket: None,
            send_lock: Mutex::new(()),
        };
        let result = transport.send(Ipv4Addr::new(10, 0, 0, 5), 8888, b"cmd").await;
        assert_eq!(result, Err(GatewayError::TransportDisabled));
    }
}
