//! Periodic sweep flipping stale devices to disconnected (§4.6).

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use crate::registry::DeviceRegistry;

const SWEEP_PERIOD: Duration = Duration::from_millis(500);

pub struct LivenessMonitor {
    registry: Arc<DeviceRegistry>,
}

impl LivenessMonitor {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self { registry }
    }

    /// Runs the sweep loop until `shutdown` fires. Doesn't distinguish a
    /// USB unplug (handled synchronously by the listener) from a plain
    /// stale-data timeout -- both collapse to `connected = false`.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(SWEEP_PERIOD);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    log::info!("liveness monitor shutting down");
                    return;
                }
                _ = interval.tick() => {
                    self.sweep(Instant::now());
                }
            }
        }
    }

    fn sweep(&self, now: Instant) {
        for (id, snapshot) in self.registry.list() {
            if !snapshot.connected {
                continue;
            }
            let Some(secs_ago) = snapshot.last_rx_secs_ago else {
                continue;
            };
            let timeout = snapshot.transport.liveness_timeout().as_secs_f64();
            if secs_ago <= timeout {
                continue;
            }

            self.registry.update(&id, |s| {
                if s.is_stale(now) {
                    s.connected = false;
                    s.network.ip = None;
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::DeviceDefinition;
    use crate::events::EventBus;
    use crate::state::TransportKind;
    use std::net::Ipv4Addr;

    fn registry_with(id: &str) -> Arc<DeviceRegistry> {
        let registry = Arc::new(DeviceRegistry::new(EventBus::new()));
        registry.ensure(&DeviceDefinition {
            id: id.to_string(),
            ..Default::default()
        });
        registry
    }

    #[test]
    fn scenario_5_stale_network_device_flips_disconnected_and_clears_ip() {
        let registry = registry_with("pressboi");
        registry.update("pressboi", |s| {
            s.connected = true;
            s.network.ip = Some(Ipv4Addr::new(10, 0, 0, 5));
            s.last_rx = Some(Instant::now() - Duration::from_secs_f64(3.1));
        });

        let monitor = LivenessMonitor::new(registry.clone());
        monitor.sweep(Instant::now());

        let snapshot = registry.get("pressboi").unwrap();
        assert!(!snapshot.connected);
        assert!(snapshot.ip.is_none());
    }

    #[test]
    fn fresh_network_device_survives_a_sweep() {
        let registry = registry_with("pressboi");
        registry.update("pressboi", |s| {
            s.connected = true;
            s.network.ip = Some(Ipv4Addr::new(10, 0, 0, 5));
            s.last_rx = Some(Instant::now());
        });

        let monitor = LivenessMonitor::new(registry.clone());
        monitor.sweep(Instant::now());

        assert!(registry.get("pressboi").unwrap().connected);
    }

    #[test]
    fn usb_device_tolerates_up_to_its_own_longer_timeout() {
        let registry = registry_with("pressboi");
        registry.update("pressboi", |s| {
            s.connected = true;
            s.transport = TransportKind::Usb;
            s.last_rx = Some(Instant::now() - Duration::from_secs_f64(4.0));
        });

        let monitor = LivenessMonitor::new(registry.clone());
        monitor.sweep(Instant::now());

        // 4s is within the 6s USB window -- a plain network timeout of 3s
        // must not apply to a Usb-bound device.
        assert!(registry.get("pressboi").unwrap().connected);
    }

    #[test]
    fn never_received_device_is_left_alone() {
        let registry = registry_with("pressboi");
        registry.update("pressboi", |s| s.connected = true);

        let monitor = LivenessMonitor::new(registry.clone());
        monitor.sweep(Instant::now());

        assert!(registry.get("pressboi").unwrap().connected);
    }
}
