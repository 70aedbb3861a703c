//! The device-gateway transport and state engine.
//!
//! This crate owns the hard, observable part of the system: the UDP and
//! USB serial receive paths, the schema-driven telemetry parser, the
//! shared device registry, and the liveness/discovery/command-routing
//! machinery built on top of it. The client-facing REST/WebSocket
//! surface and the on-disk definition loader live in the daemon binary
//! and depend on this crate, not the other way around.

pub mod definition;
pub mod discovery;
pub mod error;
pub mod events;
pub mod frame;
pub mod liveness;
pub mod persistence;
pub mod registry;
pub mod router;
pub mod state;
pub mod store;
pub mod telemetry;
pub mod transport;

pub use definition::{DeviceConfig, DeviceDefinition, FieldSpec, FieldType};
pub use error::{GatewayError, Result};
pub use events::{Event, EventBus, GeneralEvent, LogLevel, Subscription};
pub use frame::{FrameDispatcher, FrameSource};
pub use registry::{ChangeSet, DeviceRegistry};
pub use state::{DeviceSnapshot, DeviceState, TransportKind};
pub use store::DefinitionStore;

/// Wires up the engine: registry, event bus, definition store, both
/// transports, and the background workers, without starting anything.
/// The daemon binary calls `Engine::spawn_workers` once its own config
/// and shutdown signal are ready.
pub struct Engine {
    pub registry: std::sync::Arc<DeviceRegistry>,
    pub events: EventBus,
    pub definitions: std::sync::Arc<DefinitionStore>,
    pub dispatcher: std::sync::Arc<FrameDispatcher>,
    pub udp: std::sync::Arc<transport::UdpTransport>,
    pub serial: std::sync::Arc<transport::SerialTransport>,
    pub router: std::sync::Arc<router::Router>,
    pub liveness: std::sync::Arc<liveness::LivenessMonitor>,
    pub discovery: std::sync::Arc<discovery::DiscoveryScheduler>,
}

impl Engine {
    /// `events` is taken from the caller rather than created here so the
    /// daemon binary can fan its own log records through the same bus the
    /// registry publishes device updates on.
    pub async fn new(
        events: EventBus,
        definitions: Vec<DeviceDefinition>,
        connections: std::sync::Arc<persistence::ConnectionsStore>,
        udp_port: u16,
    ) -> Self {
        let registry = std::sync::Arc::new(DeviceRegistry::new(events.clone()));
        let store = std::sync::Arc::new(DefinitionStore::new());
        store.reload(definitions);

        for definition in store.all() {
            registry.ensure(&definition);
            if let Some(pref) = connections.get(&definition.id) {
                registry.update(&definition.id, |s| {
                    s.transport = pref.transport;
                    s.serial.port = pref.serial_port.clone();
                });
            }
        }

        let dispatcher = std::sync::Arc::new(FrameDispatcher::new(
            registry.clone(),
            store.clone(),
            events.clone(),
        ));

        let udp = std::sync::Arc::new(transport::UdpTransport::bind(udp_port).await);
        let serial = std::sync::Arc::new(transport::SerialTransport::new(
            registry.clone(),
            dispatcher.clone(),
            store.clone(),
        ));

        let router = std::sync::Arc::new(router::Router::new(
            registry.clone(),
            udp.clone(),
            serial.clone(),
            connections,
        ));
        let liveness = std::sync::Arc::new(liveness::LivenessMonitor::new(registry.clone()));
        let discovery = std::sync::Arc::new(discovery::DiscoveryScheduler::new(udp.clone()));

        Self {
            registry,
            events,
            definitions: store,
            dispatcher,
            udp,
            serial,
            router,
            liveness,
            discovery,
        }
    }

    /// Spawns the UDP receive loop, liveness sweep, and discovery ticker
    /// as independent tasks, all observing the same shutdown broadcast.
    pub fn spawn_workers(
        &self,
        shutdown: &tokio::sync::broadcast::Sender<()>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let udp = self.udp.clone();
        let dispatcher = self.dispatcher.clone();
        let udp_rx = shutdown.subscribe();
        let udp_task = tokio::spawn(async move {
            udp.run(dispatcher, udp_rx).await;
        });

        let liveness = self.liveness.clone();
        let liveness_rx = shutdown.subscribe();
        let liveness_task = tokio::spawn(async move {
            liveness.run(liveness_rx).await;
        });

        let discovery = self.discovery.clone();
        let discovery_rx = shutdown.subscribe();
        let discovery_task = tokio::spawn(async move {
            discovery.run(discovery_rx).await;
        });

        vec![udp_task, liveness_task, discovery_task]
    }
}
