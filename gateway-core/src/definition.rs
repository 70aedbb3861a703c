//! Static, immutable-after-load per-device schema and configuration.
//!
//! A [`DeviceDefinition`] is produced by an external loader (a filesystem
//! walker, see `gateway-daemon::definitions`) and handed to
//! [`crate::registry::DeviceRegistry::ensure`]. Nothing in this crate
//! mutates a definition after it's loaded.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// The wire/display type of a telemetry field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Float,
    Int,
    String,
    Enum,
}

/// Describes how to format one telemetry field for display.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(rename = "type")]
    pub field_type: Option<FieldType>,

    /// Enum code -> display label.
    #[serde(default)]
    pub map: Option<HashMap<String, String>>,

    /// Applied to the numeric value before formatting.
    #[serde(default)]
    pub multiplier: Option<f64>,

    /// Digits of precision, if formatting as float/int.
    #[serde(default)]
    pub precision: Option<usize>,

    /// Appended as ` {unit}` to the formatted value.
    #[serde(default)]
    pub unit: Option<String>,
}

/// Static per-device schema/config loaded from disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceDefinition {
    /// Lowercased ASCII identifier, unique across all loaded definitions.
    pub id: String,

    /// Opaque key/value bag. `usb_identifiers` is the only entry the core
    /// engine reads directly (see `config.usb_identifiers`).
    #[serde(default)]
    pub config: DeviceConfig,

    /// Opaque command table, passed through to clients verbatim.
    #[serde(default)]
    pub commands: serde_json::Value,

    pub telemetry_schema: HashMap<String, FieldSpec>,

    #[serde(default)]
    pub events: serde_json::Value,
    #[serde(default)]
    pub warnings: serde_json::Value,
    #[serde(default)]
    pub reports: serde_json::Value,
    #[serde(default)]
    pub views: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub usb_identifiers: HashSet<String>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl DeviceDefinition {
    /// Parses a definition from a JSON document, lower-casing `id` so it's
    /// always consistent with the registry key it's stored under.
    pub fn from_json(data: &str) -> serde_json::Result<Self> {
        let mut def: DeviceDefinition = serde_json::from_str(data)?;
        def.id = def.id.to_lowercase();
        Ok(def)
    }

    /// Uppercase identifiers used to recognize this device's lines during
    /// USB probing (see `SerialTransport::detect`).
    pub fn usb_identifier_candidates(&self) -> impl Iterator<Item = &str> {
        self.config.usb_identifiers.iter().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_definition_and_lowercases_id() {
        let json = r#"{
            "id": "PressBoi",
            "config": { "usb_identifiers": ["PRESSBOI"] },
            "commands": {},
            "telemetry_schema": {
                "psi": { "type": "float", "precision": 2, "unit": "PSI" }
            }
        }"#;

        let def = DeviceDefinition::from_json(json).unwrap();
        assert_eq!(def.id, "pressboi");
        assert!(def.config.usb_identifiers.contains("PRESSBOI"));
        let psi = def.telemetry_schema.get("psi").unwrap();
        assert_eq!(psi.precision, Some(2));
        assert_eq!(psi.unit.as_deref(), Some("PSI"));
    }
}
