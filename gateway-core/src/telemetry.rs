//! Schema-driven telemetry frame parsing (§4.1 of the spec).

use std::collections::HashMap;

use crate::definition::{DeviceDefinition, FieldSpec, FieldType};

/// Locates and parses the `{ID}_TELEM:` payload of a line, if present.
///
/// Returns an empty map if the marker isn't found. Malformed individual
/// fields are skipped rather than aborting the whole parse -- emit what
/// could be parsed.
pub fn parse(line: &str, definition: &DeviceDefinition) -> HashMap<String, String> {
    let marker = format!("{}_TELEM:", definition.id.to_uppercase());
    let Some(start) = find_case_insensitive(line, &marker) else {
        return HashMap::new();
    };

    let payload = line[start + marker.len()..].trim();
    let pairs = split_pairs(payload);

    let mut parsed = HashMap::with_capacity(pairs.len() * 2);
    for (key, value) in pairs {
        parsed.insert(key.clone(), value.clone());

        if let Some(spec) = definition.telemetry_schema.get(&key) {
            let formatted = format_field(spec, &value);
            parsed.insert(format!("{key}_formatted"), formatted);
        }
    }

    parsed
}

/// Finds the byte offset of `needle` in `haystack`, ignoring ASCII case.
fn find_case_insensitive(haystack: &str, needle: &str) -> Option<usize> {
    let haystack_upper = haystack.to_uppercase();
    let needle_upper = needle.to_uppercase();
    haystack_upper.find(&needle_upper)
}

/// A payload using `=` for key/value assignment is item-separated by `;`
/// (a single field with no `;` is still one well-formed item, e.g.
/// `psi=12.345`). A payload with no `=` at all is the `key:value,...`
/// form instead. Pairs are split on the *first* occurrence of the
/// delimiter only; malformed pairs (no delimiter) are skipped.
///
/// The spec's prose ("contains both `;` and `=`") describes the common
/// multi-field case; a lone `key=value` field with no `;` (spec §8
/// scenario 1) must still parse, so the mode is picked on `=` alone.
fn split_pairs(payload: &str) -> Vec<(String, String)> {
    let (item_sep, kv_sep) = if payload.contains('=') {
        (';', '=')
    } else {
        (',', ':')
    };

    payload
        .split(item_sep)
        .filter_map(|item| {
            let item = item.trim();
            if item.is_empty() {
                return None;
            }
            let (k, v) = item.split_once(kv_sep)?;
            Some((k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}

fn format_field(spec: &FieldSpec, raw: &str) -> String {
    if let Some(map) = &spec.map {
        if let Some(label) = map.get(raw) {
            return label.clone();
        }
    }

    match spec.field_type {
        Some(FieldType::Float) | Some(FieldType::Int) => format_numeric(spec, raw),
        _ => raw.to_string(),
    }
}

/// Parses `raw` as a decimal float, falling back to `0.0` if it's
/// unparseable (e.g. `"."`, an empty trailing fraction). Applies the
/// multiplier, then renders with the configured precision (or the default
/// string form), appending ` {unit}` if set.
fn format_numeric(spec: &FieldSpec, raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('.');
    let value: f64 = trimmed.parse().unwrap_or(0.0);
    let value = value * spec.multiplier.unwrap_or(1.0);

    let mut rendered = match spec.precision {
        Some(precision) => format!("{value:.precision$}"),
        None => value.to_string(),
    };

    if let Some(unit) = &spec.unit {
        rendered.push(' ');
        rendered.push_str(unit);
    }

    rendered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::DeviceConfig;

    fn pressboi() -> DeviceDefinition {
        let mut schema = HashMap::new();
        schema.insert(
            "psi".to_string(),
            FieldSpec {
                field_type: Some(FieldType::Float),
                precision: Some(2),
                unit: Some("PSI".to_string()),
                ..Default::default()
            },
        );
        schema.insert(
            "a".to_string(),
            FieldSpec {
                field_type: Some(FieldType::Int),
                ..Default::default()
            },
        );
        schema.insert(
            "b".to_string(),
            FieldSpec {
                field_type: Some(FieldType::Int),
                ..Default::default()
            },
        );
        DeviceDefinition {
            id: "pressboi".to_string(),
            config: DeviceConfig::default(),
            telemetry_schema: schema,
            ..Default::default()
        }
    }

    #[test]
    fn absent_marker_yields_empty_map() {
        let result = parse("some unrelated line", &pressboi());
        assert!(result.is_empty());
    }

    #[test]
    fn scenario_1_semicolon_separated_float_field() {
        let result = parse("PRESSBOI_TELEM:psi=12.345", &pressboi());
        assert_eq!(result.get("psi").unwrap(), "12.345");
        assert_eq!(result.get("psi_formatted").unwrap(), "12.35 PSI");
    }

    #[test]
    fn comma_colon_separated_pairs_round_trip() {
        let result = parse("PRESSBOI_TELEM:a:1,b:2", &pressboi());
        assert_eq!(result.get("a").unwrap(), "1");
        assert_eq!(result.get("b").unwrap(), "2");
        assert!(result.contains_key("a_formatted"));
        assert!(result.contains_key("b_formatted"));
    }

    #[test]
    fn invariant_4_semicolon_equals_round_trip() {
        let result = parse("PRESSBOI_TELEM:a=1;b=2", &pressboi());
        assert_eq!(result.get("a").unwrap(), "1");
        assert_eq!(result.get("b").unwrap(), "2");
        assert!(result.contains_key("a_formatted"));
        assert!(result.contains_key("b_formatted"));
    }

    #[test]
    fn malformed_numeric_falls_back_to_zero() {
        let result = parse("PRESSBOI_TELEM:psi=.;", &pressboi());
        assert_eq!(result.get("psi_formatted").unwrap(), "0.00 PSI");
    }

    #[test]
    fn unknown_key_is_stored_raw_only() {
        let result = parse("PRESSBOI_TELEM:mystery:7", &pressboi());
        assert_eq!(result.get("mystery").unwrap(), "7");
        assert!(!result.contains_key("mystery_formatted"));
    }

    #[test]
    fn malformed_pair_without_delimiter_is_skipped() {
        let result = parse("PRESSBOI_TELEM:psi=1;justword", &pressboi());
        assert_eq!(result.get("psi").unwrap(), "1");
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn marker_lookup_is_case_insensitive() {
        let result = parse("pressboi_telem:psi:5", &pressboi());
        assert_eq!(result.get("psi").unwrap(), "5");
    }
}
