//! Filesystem walker that turns a directory of `*.json` files into
//! [`DeviceDefinition`]s (§4.9, ambient). A file that fails to parse is
//! logged and skipped rather than aborting the whole load, mirroring the
//! teacher's own tolerance for partial/malformed on-disk records.

use std::path::Path;

use gateway_core::DeviceDefinition;

pub fn load_dir(dir: &Path) -> Vec<DeviceDefinition> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("could not read definitions directory {}: {e}", dir.display());
            return Vec::new();
        }
    };

    let mut definitions = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }

        match std::fs::read_to_string(&path).and_then(|contents| {
            DeviceDefinition::from_json(&contents).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        }) {
            Ok(definition) => {
                log::info!("loaded device definition {} from {}", definition.id, path.display());
                definitions.push(definition);
            }
            Err(e) => {
                log::warn!("skipping malformed definition {}: {e}", path.display());
            }
        }
    }

    definitions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_directory_yields_empty_list() {
        let definitions = load_dir(Path::new("/nonexistent/path/for/sure"));
        assert!(definitions.is_empty());
    }

    #[test]
    fn loads_valid_definitions_and_skips_malformed_ones() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("pressboi.json"),
            r#"{"id":"pressboi","telemetry_schema":{}}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.json"), "not json").unwrap();
        std::fs::write(dir.path().join("ignored.txt"), "irrelevant").unwrap();

        let definitions = load_dir(dir.path());
        assert_eq!(definitions.len(), 1);
        assert_eq!(definitions[0].id, "pressboi");
    }
}
