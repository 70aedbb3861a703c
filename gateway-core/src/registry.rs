//! Thread-safe mapping of device-id -> [`DeviceState`], the single piece of
//! shared mutable state in the engine (§5 of the spec).
//!
//! All mutation goes through [`DeviceRegistry::update`], which takes the
//! exclusive lock, runs the mutator, and releases the lock *before*
//! publishing a snapshot to the [`EventBus`] -- this is what keeps
//! subscribers from ever re-entering the registry lock from inside an
//! event callback.

use std::{collections::HashMap, sync::RwLock};

use crate::{
    definition::DeviceDefinition,
    events::EventBus,
    state::{DeviceSnapshot, DeviceState},
};

/// Which observable fields changed as a result of a mutation. Used to
/// decide whether a `device_update` event is worth emitting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub connected: bool,
    pub network: bool,
    pub serial: bool,
    pub firmware_version: bool,
    pub telemetry: bool,
}

impl ChangeSet {
    pub fn any(self) -> bool {
        self.connected || self.network || self.serial || self.firmware_version || self.telemetry
    }
}

#[derive(Default)]
struct Fingerprint {
    connected: bool,
    ip: Option<std::net::Ipv4Addr>,
    port: u16,
    serial_port: Option<String>,
    firmware_version: Option<String>,
    telemetry: std::collections::HashMap<String, String>,
}

impl From<&DeviceState> for Fingerprint {
    fn from(s: &DeviceState) -> Self {
        Self {
            connected: s.connected,
            ip: s.network.ip,
            port: s.network.port,
            serial_port: s.serial.port.clone(),
            firmware_version: s.firmware_version.clone(),
            telemetry: s.telemetry.clone(),
        }
    }
}

pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, DeviceState>>,
    events: EventBus,
}

impl DeviceRegistry {
    pub fn new(events: EventBus) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Creates a `DeviceState` for a definition if one doesn't already
    /// exist. A no-op on repeated calls for the same id.
    pub fn ensure(&self, definition: &DeviceDefinition) {
        let mut devices = self.devices.write().unwrap();
        devices
            .entry(definition.id.clone())
            .or_insert_with(|| DeviceState::new(definition.id.clone()));
    }

    pub fn get(&self, id: &str) -> Option<DeviceSnapshot> {
        let devices = self.devices.read().unwrap();
        devices.get(id).map(DeviceSnapshot::from)
    }

    pub fn list(&self) -> HashMap<String, DeviceSnapshot> {
        let devices = self.devices.read().unwrap();
        devices
            .iter()
            .map(|(id, state)| (id.clone(), DeviceSnapshot::from(state)))
            .collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.devices.read().unwrap().contains_key(id)
    }

    /// Applies `mutator` to the device named `id` under the registry's
    /// exclusive lock. Returns `None` if `id` is unknown -- per invariant
    /// 2, unknown ids never cause a mutation. On success, a `device_update`
    /// is emitted if anything observable changed, and the resulting
    /// [`ChangeSet`] is returned so the caller can make further decisions
    /// (e.g. only parsing telemetry once connection fields are updated).
    pub fn update<F>(&self, id: &str, mutator: F) -> Option<ChangeSet>
    where
        F: FnOnce(&mut DeviceState),
    {
        let (changed, snapshot) = {
            let mut devices = self.devices.write().unwrap();
            let state = devices.get_mut(id)?;
            let before = Fingerprint::from(&*state);
            mutator(state);
            let after = Fingerprint::from(&*state);

            let changes = ChangeSet {
                connected: before.connected != after.connected,
                network: before.ip != after.ip || before.port != after.port,
                serial: before.serial_port != after.serial_port,
                firmware_version: before.firmware_version != after.firmware_version,
                telemetry: before.telemetry != after.telemetry,
            };

            (changes, DeviceSnapshot::from(&*state))
        };

        if changed.any() {
            self.events.emit_device_update(snapshot);
        }

        Some(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(id: &str) -> DeviceDefinition {
        DeviceDefinition {
            id: id.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn ensure_is_idempotent() {
        let registry = DeviceRegistry::new(EventBus::new());
        registry.ensure(&definition("pressboi"));
        registry.ensure(&definition("pressboi"));
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn update_on_unknown_device_is_a_noop() {
        let registry = DeviceRegistry::new(EventBus::new());
        let result = registry.update("ghost", |s| s.connected = true);
        assert!(result.is_none());
        assert!(registry.get("ghost").is_none());
    }

    #[test]
    fn update_reports_connected_change() {
        let registry = DeviceRegistry::new(EventBus::new());
        registry.ensure(&definition("pressboi"));

        let changes = registry.update("pressboi", |s| s.connected = true).unwrap();
        assert!(changes.connected);
        assert!(registry.get("pressboi").unwrap().connected);
    }
}
