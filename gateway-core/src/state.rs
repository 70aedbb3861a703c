//! Mutable per-device state, merged from both transports.

use std::{
    collections::HashMap,
    net::Ipv4Addr,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};

/// The user-selected preferred transport for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Network,
    Usb,
}

impl Default for TransportKind {
    fn default() -> Self {
        TransportKind::Network
    }
}

/// Liveness timeout for a given transport, per invariant 4 in the data
/// model: 3s for network, 6s for USB.
impl TransportKind {
    pub fn liveness_timeout(self) -> Duration {
        match self {
            TransportKind::Network => Duration::from_secs_f64(3.0),
            TransportKind::Usb => Duration::from_secs_f64(6.0),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkState {
    pub ip: Option<Ipv4Addr>,
    pub port: u16,
}

impl NetworkState {
    pub fn new() -> Self {
        Self {
            ip: None,
            port: 8888,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SerialState {
    pub port: Option<String>,
}

/// One entry per known device, created the first time its definition is
/// loaded and kept for the daemon's lifetime.
#[derive(Debug, Clone)]
pub struct DeviceState {
    pub id: String,
    pub connected: bool,
    pub transport: TransportKind,
    pub network: NetworkState,
    pub serial: SerialState,
    /// `None` is the "never" sentinel described in the data model.
    pub last_rx: Option<Instant>,
    pub firmware_version: Option<String>,
    pub telemetry: HashMap<String, String>,
}

impl DeviceState {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            connected: false,
            transport: TransportKind::Network,
            network: NetworkState::new(),
            serial: SerialState::default(),
            last_rx: None,
            firmware_version: None,
            telemetry: HashMap::new(),
        }
    }

    pub fn mark_rx_now(&mut self) {
        self.last_rx = Some(Instant::now());
    }

    /// True if this device has exceeded its transport's liveness window.
    pub fn is_stale(&self, now: Instant) -> bool {
        match self.last_rx {
            Some(last_rx) => now.saturating_duration_since(last_rx) > self.transport.liveness_timeout(),
            None => false,
        }
    }
}

/// A serializable, client-facing view of a [`DeviceState`]. Carries a
/// wall-clock-relative "seconds since last seen" instead of leaking an
/// `Instant`, which has no stable external representation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub id: String,
    pub connected: bool,
    pub transport: TransportKind,
    pub ip: Option<Ipv4Addr>,
    pub port: u16,
    pub serial_port: Option<String>,
    pub last_rx_secs_ago: Option<f64>,
    pub firmware_version: Option<String>,
    pub telemetry: HashMap<String, String>,
}

impl From<&DeviceState> for DeviceSnapshot {
    fn from(s: &DeviceState) -> Self {
        let now = Instant::now();
        Self {
            id: s.id.clone(),
            connected: s.connected,
            transport: s.transport,
            ip: s.network.ip,
            port: s.network.port,
            serial_port: s.serial.port.clone(),
            last_rx_secs_ago: s
                .last_rx
                .map(|t| now.saturating_duration_since(t).as_secs_f64()),
            firmware_version: s.firmware_version.clone(),
            telemetry: s.telemetry.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usb_timeout_is_twice_network() {
        assert_eq!(
            TransportKind::Usb.liveness_timeout(),
            TransportKind::Network.liveness_timeout() * 2
        );
    }

    #[test]
    fn fresh_device_is_never_stale() {
        let state = DeviceState::new("pressboi");
        assert!(!state.is_stale(Instant::now()));
    }
}
