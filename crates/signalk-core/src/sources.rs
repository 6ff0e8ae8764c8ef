//! Source identification and the per-label source registry.
//!
//! Every value in the full model records which source produced it as a
//! [`get_source_id`] string. The [`SourceRegistry`] keeps protocol-specific
//! bookkeeping per source label: last-seen timestamps per PGN for NMEA 2000
//! devices and per sentence for NMEA 0183 talkers. It is rendered read-only
//! under the `sources` branch of the full model.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{json, Map, Value};

use crate::model::{Source, SourceKind, Update};

/// Source id used when an update carries no source at all.
pub const NO_SOURCE: &str = "no_source";

/// Talker used for NMEA 0183 sources without a talker id.
const UNKNOWN_TALKER: &str = "XX";

/// Compute the canonical source reference for a source descriptor.
///
/// - NMEA 2000 with a resolved device name: `label.canName`
/// - NMEA 2000 with only a bus address: `label.src`
/// - any other descriptor object: `label.talker`, or `label.XX`
/// - no object but a `$source` string: the string unchanged
/// - nothing: `no_source`
pub fn get_source_id(source: Option<&Source>, source_ref: Option<&str>) -> String {
    match (source, source_ref) {
        (Some(source), _) => {
            if let Some(can_name) = &source.can_name {
                format!("{}.{}", source.label, can_name)
            } else if let Some(src) = &source.src {
                format!("{}.{}", source.label, src)
            } else {
                let talker = source.talker.as_deref().unwrap_or(UNKNOWN_TALKER);
                format!("{}.{}", source.label, talker)
            }
        }
        (None, Some(source_ref)) => source_ref.to_string(),
        (None, None) => NO_SOURCE.to_string(),
    }
}

/// Source id of an update.
pub fn update_source_id(update: &Update) -> String {
    get_source_id(update.source.as_ref(), update.source_ref.as_deref())
}

/// Bookkeeping for one NMEA 2000 device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct N2kDevice {
    pub src: Option<String>,
    pub can_name: Option<String>,
    pub manufacturer_code: Option<String>,
    pub model_id: Option<String>,
    /// Last-seen timestamp per PGN.
    pub pgns: BTreeMap<u32, Option<String>>,
    pub instances: BTreeSet<String>,
}

/// Bookkeeping for one NMEA 0183 talker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Talker {
    /// Last-seen timestamp per sentence.
    pub sentences: BTreeMap<String, Option<String>>,
}

/// Everything known about one source label.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabelSources {
    pub label: String,
    pub source_type: Option<String>,
    /// NMEA 2000 devices keyed by canName, or by src when the name is unknown.
    pub devices: BTreeMap<String, N2kDevice>,
    pub talkers: BTreeMap<String, Talker>,
    /// Last-seen timestamp of a generic source.
    pub timestamp: Option<String>,
    /// Nodes created from `$source` references below the label.
    pub refs: Map<String, Value>,
}

/// Registry of all sources seen, keyed by label.
#[derive(Debug, Clone, Default)]
pub struct SourceRegistry {
    labels: BTreeMap<String, LabelSources>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, label: &str) -> Option<&LabelSources> {
        self.labels.get(label)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Record that `source` produced data at `timestamp`.
    pub fn update_source(&mut self, source: &Source, timestamp: Option<&str>) {
        let entry = self
            .labels
            .entry(source.label.clone())
            .or_insert_with(|| LabelSources {
                label: source.label.clone(),
                source_type: source.source_type.clone(),
                ..Default::default()
            });
        let timestamp = timestamp.map(String::from);

        match source.kind() {
            SourceKind::Can {
                src,
                can_name,
                pgn,
                instance,
            } => {
                let Some(key) = can_name.or(src) else {
                    entry.timestamp = timestamp;
                    return;
                };
                let device = entry.devices.entry(key.to_string()).or_default();
                if src.is_some() {
                    device.src = src.map(String::from);
                }
                if let Some(can_name) = can_name {
                    device.can_name = Some(can_name.to_string());
                }
                if let Some(code) = &source.manufacturer_code {
                    device.manufacturer_code = Some(code.clone());
                }
                if let Some(model) = &source.model_id {
                    device.model_id = Some(model.clone());
                }
                if let Some(instance) = instance {
                    device.instances.insert(instance.to_string());
                }
                if let Some(pgn) = pgn {
                    device.pgns.insert(pgn, timestamp);
                }
            }
            SourceKind::Nmea0183 { talker, sentence } => {
                let talker = entry
                    .talkers
                    .entry(talker.unwrap_or(UNKNOWN_TALKER).to_string())
                    .or_default();
                if let Some(sentence) = sentence {
                    talker.sentences.insert(sentence.to_string(), timestamp);
                }
            }
            SourceKind::Generic => entry.timestamp = timestamp,
        }
    }

    /// Make sure the dotted `$source` reference exists as a node chain.
    pub fn update_dollar_source(&mut self, source_ref: &str) {
        let mut parts = source_ref.split('.');
        let Some(label) = parts.next().filter(|l| !l.is_empty()) else {
            return;
        };
        let entry = self
            .labels
            .entry(label.to_string())
            .or_insert_with(|| LabelSources {
                label: label.to_string(),
                ..Default::default()
            });
        let mut cursor = &mut entry.refs;
        for part in parts {
            let node = cursor
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            let Value::Object(next) = node else {
                return;
            };
            cursor = next;
        }
    }

    /// Render the registry as the `sources` branch of the full model.
    pub fn to_json(&self) -> Value {
        let mut out = Map::new();
        for (label, sources) in &self.labels {
            let mut node = sources.refs.clone();
            node.insert("label".into(), json!(sources.label));
            if let Some(source_type) = &sources.source_type {
                node.insert("type".into(), json!(source_type));
            }
            if let Some(timestamp) = &sources.timestamp {
                node.insert("timestamp".into(), json!(timestamp));
            }
            for (key, device) in &sources.devices {
                let pgns: Map<String, Value> = device
                    .pgns
                    .iter()
                    .map(|(pgn, ts)| (pgn.to_string(), json!(ts)))
                    .collect();
                let mut n2k = Map::new();
                n2k.insert("src".into(), json!(device.src));
                n2k.insert("pgns".into(), Value::Object(pgns));
                if let Some(can_name) = &device.can_name {
                    n2k.insert("canName".into(), json!(can_name));
                }
                if let Some(code) = &device.manufacturer_code {
                    n2k.insert("manufacturerCode".into(), json!(code));
                }
                if let Some(model) = &device.model_id {
                    n2k.insert("modelId".into(), json!(model));
                }
                let mut device_node = Map::new();
                device_node.insert("n2k".into(), Value::Object(n2k));
                for instance in &device.instances {
                    device_node.insert(instance.clone(), json!({}));
                }
                node.insert(key.clone(), Value::Object(device_node));
            }
            for (talker, entry) in &sources.talkers {
                node.insert(
                    talker.clone(),
                    json!({ "talker": talker, "sentences": entry.sentences }),
                );
            }
            out.insert(label.clone(), Value::Object(node));
        }
        Value::Object(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_source_id_rules() {
        let mut n2k = Source::n2k("can0", 35, 127250);
        assert_eq!(get_source_id(Some(&n2k), None), "can0.35");

        n2k.can_name = Some("c0788c00e7e04312".into());
        assert_eq!(get_source_id(Some(&n2k), None), "can0.c0788c00e7e04312");

        let nmea = Source::nmea0183("serial", "GP", "RMC");
        assert_eq!(get_source_id(Some(&nmea), None), "serial.GP");

        let generic = Source::generic("ws", "SignalK");
        assert_eq!(get_source_id(Some(&generic), None), "ws.XX");

        assert_eq!(get_source_id(None, Some("derived.calc")), "derived.calc");
        assert_eq!(get_source_id(None, None), NO_SOURCE);
    }

    #[test]
    fn test_registry_tracks_pgns_and_sentences() {
        let mut registry = SourceRegistry::new();
        registry.update_source(&Source::n2k("can0", 35, 127250), Some("2024-01-01T00:00:00Z"));
        registry.update_source(&Source::n2k("can0", 35, 129025), Some("2024-01-01T00:00:01Z"));
        registry.update_source(&Source::nmea0183("serial", "GP", "RMC"), Some("t1"));

        let can0 = registry.get("can0").unwrap();
        let device = &can0.devices["35"];
        assert_eq!(device.pgns.len(), 2);
        assert_eq!(device.pgns[&129025].as_deref(), Some("2024-01-01T00:00:01Z"));

        let json = registry.to_json();
        assert_eq!(json["serial"]["GP"]["sentences"]["RMC"], "t1");
        assert_eq!(json["can0"]["35"]["n2k"]["src"], "35");
        assert_eq!(json["can0"]["type"], "NMEA2000");
    }

    #[test]
    fn test_dollar_source_creates_nodes() {
        let mut registry = SourceRegistry::new();
        registry.update_dollar_source("derived-data.calc.wind");
        let json = registry.to_json();
        assert!(json["derived-data"]["calc"]["wind"].is_object());
        assert_eq!(json["derived-data"]["label"], "derived-data");
    }
}
