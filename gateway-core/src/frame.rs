//! Shared line classification and registry dispatch for both transports
//! (§4.3/§4.4 of the spec).
//!
//! `UdpTransport` and `SerialTransport` both decode their wire bytes into
//! a line and hand it to [`FrameDispatcher::dispatch`] along with a
//! [`FrameSource`] describing where it came from. All of the demux logic
//! lives here once instead of being duplicated per transport.

use std::net::Ipv4Addr;

use crate::{
    events::{EventBus, GeneralEvent},
    registry::DeviceRegistry,
    state::TransportKind,
    store::DefinitionStore,
    telemetry,
};

/// Where a dispatched line came from.
#[derive(Debug, Clone)]
pub enum FrameSource {
    Network(Ipv4Addr),
    Serial { port: String, device_id: String },
}

impl FrameSource {
    fn serial_device(&self) -> Option<&str> {
        match self {
            FrameSource::Serial { device_id, .. } => Some(device_id.as_str()),
            FrameSource::Network(_) => None,
        }
    }
}

pub struct FrameDispatcher {
    registry: std::sync::Arc<DeviceRegistry>,
    definitions: std::sync::Arc<DefinitionStore>,
    events: EventBus,
}

impl FrameDispatcher {
    pub fn new(
        registry: std::sync::Arc<DeviceRegistry>,
        definitions: std::sync::Arc<DefinitionStore>,
        events: EventBus,
    ) -> Self {
        Self {
            registry,
            definitions,
            events,
        }
    }

    /// Classifies and dispatches one already-decoded, trimmed line.
    pub fn dispatch(&self, line: &str, source: FrameSource) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        if let Some(rest) = strip_prefix_ci(line, "DISCOVERY_RESPONSE:") {
            self.handle_discovery_response(rest, &source);
            return;
        }

        if let Some(id) = find_ci(line, "_TELEM:").map(|(prefix, _)| prefix.to_lowercase()) {
            self.handle_telemetry(&id, line, &source);
            return;
        }

        if find_ci(line, "_RECOVERY:").is_some() || starts_with_ci(line, "RECOVERY:") {
            self.handle_recovery(line);
            return;
        }

        if starts_with_ci(line, "NVMDUMP:") {
            self.handle_nvm_dump(line);
            return;
        }

        if starts_with_ci(line, "INFO:") || starts_with_ci(line, "DONE:") || starts_with_ci(line, "ERROR:") {
            self.handle_status(line, &source);
            return;
        }

        if let Some(id) = self.match_device_scoped(line) {
            self.handle_device_scoped(&id, line, &source);
            return;
        }

        log::trace!("unhandled line: {line}");
        self.events.emit(GeneralEvent::StatusMessage {
            device: None,
            message: format!("[UNHANDLED] {line}"),
        });
    }

    /// Called by `SerialTransport` before `dispatch` for every complete
    /// line on a connected port, per §4.4: every serial line marks the
    /// owning device connected on the Usb transport, independent of
    /// whichever branch classification below takes.
    pub fn ensure_usb_connected(&self, id: &str) {
        self.registry.update(id, |s| {
            let was_connected = s.connected;
            s.transport = TransportKind::Usb;
            s.connected = true;
            s.mark_rx_now();
            if !was_connected {
                log::info!("{id} connected over USB");
            }
        });
    }

    fn handle_discovery_response(&self, rest: &str, source: &FrameSource) {
        let tokens = parse_kv_tokens(rest);
        let Some(device_id) = tokens.get("DEVICE_ID").map(|s| s.to_lowercase()) else {
            log::trace!("DISCOVERY_RESPONSE missing DEVICE_ID: {rest}");
            return;
        };
        if !self.definitions.contains(&device_id) {
            return;
        }

        let ip = match source {
            FrameSource::Network(ip) => Some(*ip),
            FrameSource::Serial { .. } => None,
        };

        let port: Option<u16> = tokens.get("PORT").and_then(|v| v.parse().ok());
        let firmware = tokens
            .get("FW")
            .or_else(|| tokens.get("FIRMWARE"))
            .or_else(|| tokens.get("VERSION"))
            .cloned();

        let changed = self.registry.update(&device_id, |s| {
            if ip.is_some() && s.transport != TransportKind::Network {
                // Invariant 3: a UDP-sourced announcement for a Usb-bound
                // device updates nothing.
                return;
            }
            s.connected = true;
            if let Some(ip) = ip {
                s.network.ip = Some(ip);
            }
            if let Some(port) = port {
                s.network.port = port;
            }
            s.mark_rx_now();
            if let Some(firmware) = firmware {
                s.firmware_version = Some(firmware);
            }
        });

        if changed.map(|c| c.any()).unwrap_or(false) {
            if let Some(snapshot) = self.registry.get(&device_id) {
                self.events.emit(GeneralEvent::Devices(vec![snapshot]));
            }
        }
    }

    fn handle_telemetry(&self, device_id: &str, line: &str, source: &FrameSource) {
        let Some(definition) = self.definitions.get(device_id) else {
            return;
        };
        let Some(snapshot) = self.registry.get(device_id) else {
            return;
        };

        if let FrameSource::Network(ip) = source {
            if snapshot.transport != TransportKind::Network {
                // Invariant 3: a UDP telemetry frame addressed to a
                // Usb-bound device updates nothing, including telemetry.
                return;
            }
            self.registry.update(device_id, |s| {
                s.connected = true;
                s.network.ip = Some(*ip);
                s.mark_rx_now();
            });
        }

        let parsed = telemetry::parse(line, &definition);
        if parsed.is_empty() {
            return;
        }

        self.registry.update(device_id, |s| {
            s.telemetry.extend(parsed.clone());
        });

        self.events.emit(GeneralEvent::Telemetry {
            device: device_id.to_string(),
            data: parsed,
        });
    }

    fn handle_recovery(&self, line: &str) {
        let device = find_ci(line, "_RECOVERY:").map(|(prefix, _)| prefix.to_lowercase());
        self.events.emit(GeneralEvent::Recovery {
            device,
            message: line.to_string(),
        });
    }

    fn handle_nvm_dump(&self, line: &str) {
        let mut parts = line.splitn(3, ':');
        let _marker = parts.next();
        let Some(device) = parts.next() else {
            log::trace!("malformed NVMDUMP line: {line}");
            return;
        };
        let data = parts.next().unwrap_or_default();
        self.events.emit(GeneralEvent::NvmDump {
            device: device.to_lowercase(),
            data: data.to_string(),
        });
    }

    fn handle_status(&self, line: &str, source: &FrameSource) {
        let device = match source {
            FrameSource::Network(ip) => self.find_device_by_ip(*ip),
            FrameSource::Serial { .. } => source.serial_device().map(str::to_string),
        };

        if let Some(device) = &device {
            self.registry.update(device, |s| {
                if s.transport == TransportKind::Network {
                    s.mark_rx_now();
                }
            });
        }

        self.events.emit(GeneralEvent::StatusMessage {
            device,
            message: line.to_string(),
        });
    }

    fn match_device_scoped(&self, line: &str) -> Option<String> {
        let upper = line.to_uppercase();
        self.definitions
            .all()
            .into_iter()
            .map(|def| def.id.clone())
            .find(|id| upper.starts_with(&format!("{}_", id.to_uppercase())))
    }

    fn handle_device_scoped(&self, device_id: &str, line: &str, source: &FrameSource) {
        let changed = self.registry.update(device_id, |s| {
            match source {
                FrameSource::Network(_) if s.transport != TransportKind::Network => return,
                _ => {}
            }
            s.mark_rx_now();
        });
        if changed.is_none() {
            return;
        }
        self.events.emit(GeneralEvent::StatusMessage {
            device: Some(device_id.to_string()),
            message: line.to_string(),
        });
    }

    fn find_device_by_ip(&self, ip: Ipv4Addr) -> Option<String> {
        self.registry
            .list()
            .into_iter()
            .find(|(_, snapshot)| snapshot.ip == Some(ip))
            .map(|(id, _)| id)
    }
}

fn starts_with_ci(haystack: &str, prefix: &str) -> bool {
    haystack.len() >= prefix.len() && haystack[..prefix.len()].eq_ignore_ascii_case(prefix)
}

fn strip_prefix_ci<'a>(haystack: &'a str, prefix: &str) -> Option<&'a str> {
    starts_with_ci(haystack, prefix).then(|| haystack[prefix.len()..].trim())
}

/// Finds `needle` case-insensitively and returns `(text_before, text_after)`.
fn find_ci<'a>(haystack: &'a str, needle: &str) -> Option<(&'a str, &'a str)> {
    let upper = haystack.to_uppercase();
    let idx = upper.find(&needle.to_uppercase())?;
    Some((&haystack[..idx], &haystack[idx + needle.len()..]))
}

fn parse_kv_tokens(rest: &str) -> std::collections::HashMap<String, String> {
    rest.split_whitespace()
        .filter_map(|tok| tok.split_once('='))
        .map(|(k, v)| (k.to_uppercase(), v.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{DeviceConfig, FieldSpec, FieldType};
    use crate::events::Event;

    fn pressboi_dispatcher() -> (FrameDispatcher, std::sync::Arc<DeviceRegistry>) {
        let events = EventBus::new();
        let registry = std::sync::Arc::new(DeviceRegistry::new(events.clone()));
        let definitions = std::sync::Arc::new(DefinitionStore::new());

        let mut schema = std::collections::HashMap::new();
        schema.insert(
            "psi".to_string(),
            FieldSpec {
                field_type: Some(FieldType::Float),
                precision: Some(2),
                unit: Some("PSI".to_string()),
                ..Default::default()
            },
        );
        let definition = crate::definition::DeviceDefinition {
            id: "pressboi".to_string(),
            config: DeviceConfig::default(),
            telemetry_schema: schema,
            ..Default::default()
        };
        definitions.reload(vec![definition.clone()]);
        registry.ensure(&definition);

        let dispatcher = FrameDispatcher::new(registry.clone(), definitions, events);
        (dispatcher, registry)
    }

    #[test]
    fn scenario_1_udp_telemetry_updates_connection_and_telemetry() {
        let (dispatcher, registry) = pressboi_dispatcher();
        let ip = Ipv4Addr::new(10, 0, 0, 5);

        dispatcher.dispatch("PRESSBOI_TELEM:psi=12.345", FrameSource::Network(ip));

        let snapshot = registry.get("pressboi").unwrap();
        assert!(snapshot.connected);
        assert_eq!(snapshot.ip, Some(ip));
        assert_eq!(snapshot.telemetry.get("psi").unwrap(), "12.345");
        assert_eq!(snapshot.telemetry.get("psi_formatted").unwrap(), "12.35 PSI");
    }

    #[test]
    fn scenario_2_usb_bound_device_ignores_udp_telemetry() {
        let (dispatcher, registry) = pressboi_dispatcher();
        registry.update("pressboi", |s| s.transport = TransportKind::Usb);

        dispatcher.dispatch(
            "PRESSBOI_TELEM:psi=1",
            FrameSource::Network(Ipv4Addr::new(10, 0, 0, 5)),
        );

        let snapshot = registry.get("pressboi").unwrap();
        assert!(!snapshot.connected);
        assert!(snapshot.ip.is_none());
        assert!(snapshot.telemetry.is_empty());
    }

    #[test]
    fn scenario_4_discovery_response_sets_network_fields() {
        let (dispatcher, registry) = pressboi_dispatcher();
        let ip = Ipv4Addr::new(10, 0, 0, 5);

        dispatcher.dispatch(
            "DISCOVERY_RESPONSE: DEVICE_ID=pressboi PORT=8889 FW=1.2.3",
            FrameSource::Network(ip),
        );

        let snapshot = registry.get("pressboi").unwrap();
        assert!(snapshot.connected);
        assert_eq!(snapshot.ip, Some(ip));
        assert_eq!(snapshot.port, 8889);
        assert_eq!(snapshot.firmware_version.as_deref(), Some("1.2.3"));
    }

    #[test]
    fn invariant_2_unknown_device_id_causes_no_mutation() {
        let (dispatcher, registry) = pressboi_dispatcher();

        dispatcher.dispatch(
            "GHOST_TELEM:psi=1",
            FrameSource::Network(Ipv4Addr::new(10, 0, 0, 5)),
        );

        assert!(registry.get("ghost").is_none());
        assert!(registry.get("pressboi").unwrap().telemetry.is_empty());
    }

    #[tokio::test]
    async fn nvmdump_line_splits_into_device_and_payload() {
        let events = EventBus::new();
        let registry = std::sync::Arc::new(DeviceRegistry::new(events.clone()));
        let definitions = std::sync::Arc::new(DefinitionStore::new());
        let dispatcher = FrameDispatcher::new(registry, definitions, events.clone());
        let mut sub = events.subscribe();

        dispatcher.dispatch(
            "NVMDUMP:pressboi:deadbeef",
            FrameSource::Network(Ipv4Addr::new(10, 0, 0, 5)),
        );

        match sub.recv().await {
            Event::General(GeneralEvent::NvmDump { device, data }) => {
                assert_eq!(device, "pressboi");
                assert_eq!(data, "deadbeef");
            }
            other => panic!("expected an nvm_dump event, got {other:?}"),
        }
    }

    #[test]
    fn serial_source_never_resolves_to_a_network_ip() {
        let (dispatcher, registry) = pressboi_dispatcher();
        dispatcher.dispatch(
            "PRESSBOI_TELEM:psi=1",
            FrameSource::Serial {
                port: "/dev/ttyUSB0".to_string(),
                device_id: "pressboi".to_string(),
            },
        );
        // Serial frames don't flow through the connection-field branch
        // that's gated on FrameSource::Network; telemetry still parses
        // against the schema regardless of transport binding.
        let snapshot = registry.get("pressboi").unwrap();
        assert_eq!(snapshot.telemetry.get("psi").unwrap(), "1");
    }
}
