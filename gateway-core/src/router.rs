//! Picks the live transport for a device and forwards commands (§4.5).

use std::sync::Arc;

use crate::error::{GatewayError, Result};
use crate::persistence::{ConnectionPref, ConnectionsStore};
use crate::registry::DeviceRegistry;
use crate::state::TransportKind;
use crate::transport::{SerialTransport, UdpTransport};

pub struct Router {
    registry: Arc<DeviceRegistry>,
    udp: Arc<UdpTransport>,
    serial: Arc<SerialTransport>,
    connections: Arc<ConnectionsStore>,
}

impl Router {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        udp: Arc<UdpTransport>,
        serial: Arc<SerialTransport>,
        connections: Arc<ConnectionsStore>,
    ) -> Self {
        Self {
            registry,
            udp,
            serial,
            connections,
        }
    }

    /// Looks up `id`'s current transport and forwards `command` to it.
    /// Never sends on the transport a device isn't currently bound to.
    pub async fn dispatch(&self, id: &str, command: &[u8]) -> Result<()> {
        let snapshot = self.registry.get(id).ok_or(GatewayError::UnknownDevice)?;

        match snapshot.transport {
            TransportKind::Usb => {
                let port = snapshot.serial_port.ok_or(GatewayError::NotConfigured)?;
                self.serial.send(&port, command).await
            }
            TransportKind::Network => {
                let ip = snapshot.ip.ok_or(GatewayError::NoRoute)?;
                self.udp.send(ip, snapshot.port, command).await
            }
        }
    }

    /// Switches `id` back to the network transport, tearing down any
    /// active serial listener for its current port first.
    pub async fn use_network(&self, id: &str) -> Result<()> {
        let snapshot = self.registry.get(id).ok_or(GatewayError::UnknownDevice)?;

        if let Some(port) = snapshot.serial_port {
            self.serial.disconnect(&port).await?;
        }

        self.registry.update(id, |s| {
            s.transport = TransportKind::Network;
            s.serial.port = None;
            s.connected = false;
        });

        self.connections
            .set(
                id,
                ConnectionPref {
                    transport: TransportKind::Network,
                    serial_port: None,
                },
            )
            .map_err(|e| GatewayError::IoFatal(e.to_string()))?;

        Ok(())
    }

    /// Connects `id` over USB on `port`, persisting the preference.
    pub async fn use_serial(&self, port: &str, id: &str) -> Result<()> {
        self.serial.connect(port, id).await?;
        self.connections
            .set(
                id,
                ConnectionPref {
                    transport: TransportKind::Usb,
                    serial_port: Some(port.to_string()),
                },
            )
            .map_err(|e| GatewayError::IoFatal(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::DeviceDefinition;
    use crate::events::EventBus;
    use crate::frame::FrameDispatcher;
    use crate::store::DefinitionStore;

    async fn router_with(id: &str) -> (Router, Arc<DeviceRegistry>, tempfile::TempDir) {
        let events = EventBus::new();
        let registry = Arc::new(DeviceRegistry::new(events.clone()));
        registry.ensure(&DeviceDefinition {
            id: id.to_string(),
            ..Default::default()
        });
        let definitions = Arc::new(DefinitionStore::new());
        let dispatcher = Arc::new(FrameDispatcher::new(registry.clone(), definitions.clone(), events));
        let udp = Arc::new(UdpTransport::bind(0).await);
        let serial = Arc::new(SerialTransport::new(registry.clone(), dispatcher, definitions));

        let dir = tempfile::tempdir().unwrap();
        let connections = Arc::new(ConnectionsStore::load(dir.path().join("connections.json")));

        let router = Router::new(registry.clone(), udp, serial, connections);
        (router, registry, dir)
    }

    #[tokio::test]
    async fn dispatch_on_unknown_device_is_unknown_device() {
        let (router, _registry, _dir) = router_with("pressboi").await;
        let result = router.dispatch("ghost", b"cmd").await;
        assert_eq!(result, Err(GatewayError::UnknownDevice));
    }

    #[tokio::test]
    async fn dispatch_on_network_device_without_ip_is_no_route() {
        let (router, _registry, _dir) = router_with("pressboi").await;
        let result = router.dispatch("pressboi", b"cmd").await;
        assert_eq!(result, Err(GatewayError::NoRoute));
    }

    #[tokio::test]
    async fn dispatch_on_usb_device_without_port_is_not_configured() {
        let (router, registry, _dir) = router_with("pressboi").await;
        registry.update("pressboi", |s| s.transport = TransportKind::Usb);

        let result = router.dispatch("pressboi", b"cmd").await;
        assert_eq!(result, Err(GatewayError::NotConfigured));
    }

    #[tokio::test]
    async fn use_network_resets_transport_and_clears_serial_port() {
        let (router, registry, _dir) = router_with("pressboi").await;
        registry.update("pressboi", |s| {
            s.transport = TransportKind::Usb;
            s.serial.port = Some("/dev/ttyUSB0".to_string());
        });

        router.use_network("pressboi").await.unwrap();

        let snapshot = registry.get("pressboi").unwrap();
        assert_eq!(snapshot.transport, TransportKind::Network);
        assert!(snapshot.serial_port.is_none());
        assert!(!snapshot.connected);
    }
}
