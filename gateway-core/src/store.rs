//! In-memory map of device-id -> [`DeviceDefinition`] (§4.9 of the spec).
//!
//! Populated once at startup by an external loader (a filesystem walker
//! lives in the daemon binary, not here) and swappable wholesale on
//! [`DefinitionStore::reload`] so a client-triggered reload never observes
//! a half-populated store.

use std::{collections::HashMap, sync::Arc, sync::RwLock};

use crate::definition::DeviceDefinition;

#[derive(Default)]
pub struct DefinitionStore {
    definitions: RwLock<HashMap<String, Arc<DeviceDefinition>>>,
}

impl DefinitionStore {
    pub fn new() -> Self {
        Self {
            definitions: RwLock::new(HashMap::new()),
        }
    }

    /// Replaces the entire contents of the store. Used both for initial
    /// population and for a `reload()` triggered from the client surface.
    pub fn reload(&self, definitions: Vec<DeviceDefinition>) {
        let mut map = HashMap::with_capacity(definitions.len());
        for def in definitions {
            map.insert(def.id.clone(), Arc::new(def));
        }
        *self.definitions.write().unwrap() = map;
    }

    pub fn get(&self, id: &str) -> Option<Arc<DeviceDefinition>> {
        self.definitions.read().unwrap().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.definitions.read().unwrap().contains_key(id)
    }

    pub fn all(&self) -> Vec<Arc<DeviceDefinition>> {
        self.definitions.read().unwrap().values().cloned().collect()
    }

    /// Every `(id, uppercased usb identifier)` pair across all loaded
    /// definitions, used by `SerialTransport::detect` to match a probed
    /// line against a candidate device.
    pub fn usb_identifier_candidates(&self) -> Vec<(String, String)> {
        self.definitions
            .read()
            .unwrap()
            .values()
            .flat_map(|def| {
                def.usb_identifier_candidates()
                    .map(|candidate| (def.id.clone(), candidate.to_uppercase()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(id: &str) -> DeviceDefinition {
        DeviceDefinition {
            id: id.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn reload_replaces_contents_wholesale() {
        let store = DefinitionStore::new();
        store.reload(vec![def("pressboi")]);
        assert!(store.contains("pressboi"));

        store.reload(vec![def("other")]);
        assert!(!store.contains("pressboi"));
        assert!(store.contains("other"));
    }

    #[test]
    fn get_returns_none_for_unknown_id() {
        let store = DefinitionStore::new();
        assert!(store.get("ghost").is_none());
    }
}
