//! Atomic JSON persistence for runtime user preferences (§6 of the spec):
//! per-device transport choice and manually-registered serial paths.
//!
//! Unlike the definitions loader or the `confy`-managed startup config,
//! these files are rewritten while the daemon is running, so every write
//! goes through a temp-file-then-rename so a concurrent reader never
//! observes a half-written file. Pattern adapted from the registry
//! persistence layer in the broader example pack, reshaped around a
//! single JSON document instead of a directory tree of schema files.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::state::TransportKind;

fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let tmp = tempfile::NamedTempFile::new_in(dir)?;
    fs::write(tmp.path(), json)?;
    tmp.persist(path)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    Ok(())
}

fn read_json_or_default<T: Default + for<'de> Deserialize<'de>>(path: &Path) -> T {
    match fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
            log::warn!("discarding malformed {}: {e}", path.display());
            T::default()
        }),
        Err(_) => T::default(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionPref {
    pub transport: TransportKind,
    pub serial_port: Option<String>,
}

/// `connections.json`: `{ id: { transport, serial_port } }`.
pub struct ConnectionsStore {
    path: PathBuf,
    entries: RwLock<HashMap<String, ConnectionPref>>,
}

impl ConnectionsStore {
    pub fn load(path: PathBuf) -> Self {
        let entries = read_json_or_default(&path);
        Self {
            path,
            entries: RwLock::new(entries),
        }
    }

    pub fn get(&self, id: &str) -> Option<ConnectionPref> {
        self.entries.read().unwrap().get(id).cloned()
    }

    pub fn set(&self, id: &str, pref: ConnectionPref) -> io::Result<()> {
        let snapshot = {
            let mut entries = self.entries.write().unwrap();
            entries.insert(id.to_string(), pref);
            entries.clone()
        };
        atomic_write_json(&self.path, &snapshot)
    }
}

/// `device_paths.json`: `{ paths: [string] }` -- serial device paths the
/// user has manually registered (beyond whatever `list_ports()` finds).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DevicePaths {
    pub paths: Vec<String>,
}

pub struct DevicePathsStore {
    path: PathBuf,
    state: RwLock<DevicePaths>,
}

impl DevicePathsStore {
    pub fn load(path: PathBuf) -> Self {
        let state = read_json_or_default(&path);
        Self {
            path,
            state: RwLock::new(state),
        }
    }

    pub fn all(&self) -> Vec<String> {
        self.state.read().unwrap().paths.clone()
    }

    pub fn add(&self, device_path: String) -> io::Result<()> {
        let snapshot = {
            let mut state = self.state.write().unwrap();
            if !state.paths.contains(&device_path) {
                state.paths.push(device_path);
            }
            state.clone()
        };
        atomic_write_json(&self.path, &snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connections_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("connections.json");

        let store = ConnectionsStore::load(path.clone());
        store
            .set(
                "pressboi",
                ConnectionPref {
                    transport: TransportKind::Usb,
                    serial_port: Some("/dev/ttyUSB0".to_string()),
                },
            )
            .unwrap();

        let reloaded = ConnectionsStore::load(path);
        let pref = reloaded.get("pressboi").unwrap();
        assert_eq!(pref.transport, TransportKind::Usb);
        assert_eq!(pref.serial_port.as_deref(), Some("/dev/ttyUSB0"));
    }

    #[test]
    fn missing_file_yields_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConnectionsStore::load(dir.path().join("nonexistent.json"));
        assert!(store.get("ghost").is_none());
    }

    #[test]
    fn device_paths_dedupes_on_add() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device_paths.json");
        let store = DevicePathsStore::load(path);
        store.add("/dev/ttyUSB0".to_string()).unwrap();
        store.add("/dev/ttyUSB0".to_string()).unwrap();
        assert_eq!(store.all(), vec!["/dev/ttyUSB0".to_string()]);
    }
}
