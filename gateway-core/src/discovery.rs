//! Periodic UDP discovery broadcast ticker (§4.7).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::transport::UdpTransport;

const BROADCAST_PERIOD: Duration = Duration::from_secs_f64(2.0);

pub struct DiscoveryScheduler {
    udp: Arc<UdpTransport>,
}

impl DiscoveryScheduler {
    pub fn new(udp: Arc<UdpTransport>) -> Self {
        Self { udp }
    }

    /// Triggers one broadcast immediately, independent of the ticker --
    /// used by the client surface's `/discovery/trigger` endpoint.
    pub async fn trigger(&self) {
        self.udp.broadcast().await;
    }

    /// Runs the 2s ticker until `shutdown` fires. A no-op loop (but not
    /// disabled outright) if the UDP socket never bound -- `broadcast`
    /// itself becomes a no-op in that case.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        if !self.udp.is_enabled() {
            log::info!("discovery scheduler idle: UDP transport disabled");
            return;
        }

        let mut interval = tokio::time::interval(BROADCAST_PERIOD);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    log::info!("discovery scheduler shutting down");
                    return;
                }
                _ = interval.tick() => {
                    self.udp.broadcast().await;
                }
            }
        }
    }
}
