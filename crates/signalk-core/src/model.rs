//! SignalK data model types.
//!
//! These types represent the core SignalK data model structures:
//! - Delta messages for efficient updates
//! - Source descriptors for multi-device provenance
//! - Metadata and notification values

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::warn;

/// A SignalK delta message containing one or more updates.
///
/// Deltas are the primary mechanism for transmitting changes in SignalK.
/// They contain a context (which vessel/object) and a list of updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    /// The context path (e.g., "vessels.urn:mrn:imo:mmsi:230099999")
    /// If None, defaults to the self vessel.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,

    /// The list of updates in this delta
    pub updates: Vec<Update>,
}

impl Delta {
    /// Create a delta with a single update.
    pub fn single(context: Option<String>, update: Update) -> Self {
        Self {
            context,
            updates: vec![update],
        }
    }
}

/// A single update within a delta, containing values from one source at one timestamp.
///
/// An update carries `values`, `meta`, or both. Updates carrying neither are
/// skipped by the aggregator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Update {
    /// Reference to source in /sources (e.g., "nmea0183.GP")
    #[serde(rename = "$source", skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,

    /// Embedded source object (alternative to $source)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,

    /// ISO 8601 timestamp (UTC)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,

    /// The path-value pairs in this update
    #[serde(
        default,
        deserialize_with = "deserialize_path_values",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub values: Vec<PathValue>,

    /// Metadata updates (separate from values)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Vec<PathMeta>>,
}

impl Update {
    /// Create an update from a source descriptor and a list of values.
    pub fn from_source(source: Source, timestamp: Option<String>, values: Vec<PathValue>) -> Self {
        Self {
            source_ref: None,
            source: Some(source),
            timestamp,
            values,
            meta: None,
        }
    }

    /// True when the update has neither values nor metadata.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.meta.as_ref().map_or(true, |m| m.is_empty())
    }
}

/// A single path-value pair within an update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathValue {
    /// The SignalK path (e.g., "navigation.speedOverGround")
    pub path: String,

    /// The value at this path
    pub value: Value,
}

impl PathValue {
    pub fn new(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            path: path.into(),
            value: value.into(),
        }
    }

    fn from_json(item: Value) -> Option<Self> {
        let Value::Object(mut map) = item else {
            return None;
        };
        let path = match map.remove("path") {
            Some(Value::String(path)) => path,
            _ => return None,
        };
        let value = map.remove("value")?;
        Some(Self { path, value })
    }
}

/// Parse `values` element by element, dropping pairs that lack a path or a value.
fn deserialize_path_values<'de, D>(deserializer: D) -> Result<Vec<PathValue>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<Value> = Vec::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .filter_map(|item| {
            let shown = item.to_string();
            let parsed = PathValue::from_json(item);
            if parsed.is_none() {
                warn!("Illegal value in delta, missing path or value: {}", shown);
            }
            parsed
        })
        .collect())
}

/// Metadata for a path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathMeta {
    /// The SignalK path this metadata applies to
    pub path: String,

    /// The metadata value
    pub value: Meta,
}

/// Source information describing where data originated.
///
/// The wire shape is the flat SignalK source object; [`Source::kind`] gives
/// the protocol-specific view.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Source {
    /// Label identifying the source bus (e.g., "N2K-1", "serial-COM1")
    pub label: String,

    /// Type of source (e.g., "NMEA0183", "NMEA2000", "SignalK")
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub source_type: Option<String>,

    /// NMEA 2000 source address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,

    /// NMEA 2000 device CAN name
    #[serde(rename = "canName", skip_serializing_if = "Option::is_none")]
    pub can_name: Option<String>,

    /// NMEA 2000 PGN
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pgn: Option<u32>,

    /// NMEA 2000 data instance
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,

    /// NMEA 2000 manufacturer code from the address claim
    #[serde(rename = "manufacturerCode", skip_serializing_if = "Option::is_none")]
    pub manufacturer_code: Option<String>,

    /// NMEA 2000 model id from the product information
    #[serde(rename = "modelId", skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,

    /// NMEA 0183 sentence type (e.g., "RMC", "GGA")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sentence: Option<String>,

    /// NMEA 0183 talker ID (e.g., "GP", "II")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub talker: Option<String>,
}

/// Protocol-specific view of a [`Source`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SourceKind<'a> {
    /// NMEA 2000 device on a CAN bus.
    Can {
        src: Option<&'a str>,
        can_name: Option<&'a str>,
        pgn: Option<u32>,
        instance: Option<&'a str>,
    },
    /// NMEA 0183 talker.
    Nmea0183 {
        talker: Option<&'a str>,
        sentence: Option<&'a str>,
    },
    /// Anything else (SignalK, plugins, ...).
    Generic,
}

impl Source {
    /// Source for an NMEA 2000 message.
    pub fn n2k(label: &str, src: u8, pgn: u32) -> Self {
        Self {
            label: label.to_string(),
            source_type: Some("NMEA2000".to_string()),
            src: Some(src.to_string()),
            pgn: Some(pgn),
            ..Default::default()
        }
    }

    /// Source for an NMEA 0183 sentence.
    pub fn nmea0183(label: &str, talker: &str, sentence: &str) -> Self {
        Self {
            label: label.to_string(),
            source_type: Some("NMEA0183".to_string()),
            talker: Some(talker.to_string()),
            sentence: Some(sentence.to_string()),
            ..Default::default()
        }
    }

    /// Source with just a label and type.
    pub fn generic(label: &str, source_type: &str) -> Self {
        Self {
            label: label.to_string(),
            source_type: Some(source_type.to_string()),
            ..Default::default()
        }
    }

    pub fn kind(&self) -> SourceKind<'_> {
        let source_type = self.source_type.as_deref();
        if source_type == Some("NMEA2000") || self.src.is_some() {
            SourceKind::Can {
                src: self.src.as_deref(),
                can_name: self.can_name.as_deref(),
                pgn: self.pgn,
                instance: self.instance.as_deref(),
            }
        } else if source_type == Some("NMEA0183") || self.sentence.is_some() {
            SourceKind::Nmea0183 {
                talker: self.talker.as_deref(),
                sentence: self.sentence.as_deref(),
            }
        } else {
            SourceKind::Generic
        }
    }
}

/// Metadata describing a SignalK path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    /// Human-readable description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Display name for gauges (no units)
    #[serde(rename = "displayName", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    /// Long name for displays with more space
    #[serde(rename = "longName", skip_serializing_if = "Option::is_none")]
    pub long_name: Option<String>,

    /// Short name for compact displays
    #[serde(rename = "shortName", skip_serializing_if = "Option::is_none")]
    pub short_name: Option<String>,

    /// SI unit string (e.g., "m/s", "rad", "K")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,

    /// Timeout in seconds after which data is stale
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,

    /// Display scale configuration
    #[serde(rename = "displayScale", skip_serializing_if = "Option::is_none")]
    pub display_scale: Option<DisplayScale>,

    /// Alarm zones
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zones: Option<Vec<Zone>>,

    /// Indicates this path supports PUT requests
    #[serde(rename = "supportsPut", skip_serializing_if = "Option::is_none")]
    pub supports_put: Option<bool>,
}

impl Meta {
    /// Fill fields that are unset here from `other`.
    pub fn fill_from(&mut self, other: &Meta) {
        macro_rules! fill {
            ($($field:ident),*) => {
                $(if self.$field.is_none() {
                    self.$field = other.$field.clone();
                })*
            };
        }
        fill!(
            description,
            display_name,
            long_name,
            short_name,
            units,
            timeout,
            display_scale,
            zones,
            supports_put
        );
    }
}

/// Display scale configuration for gauges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayScale {
    /// Lower bound of display
    pub lower: f64,

    /// Upper bound of display
    pub upper: f64,

    /// Scale type
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub scale_type: Option<ScaleType>,

    /// Power for power scale type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power: Option<f64>,
}

/// Scale type for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScaleType {
    Linear,
    Logarithmic,
    Squareroot,
    Power,
}

/// An alarm/warning zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    /// Lower bound (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lower: Option<f64>,

    /// Upper bound (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upper: Option<f64>,

    /// Alarm state when in this zone
    pub state: AlarmState,

    /// Message to display
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Alarm states in order of severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlarmState {
    Nominal,
    Normal,
    Alert,
    Warn,
    Alarm,
    Emergency,
}

/// How a notification should be presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationMethod {
    Visual,
    Sound,
}

/// Value carried under a `notifications.*` path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub state: AlarmState,

    #[serde(default)]
    pub method: Vec<NotificationMethod>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Notification {
    /// Read the alarm state out of a notification value, if it has one.
    pub fn state_of(value: &Value) -> Option<AlarmState> {
        value
            .get("state")
            .and_then(|state| AlarmState::deserialize(state).ok())
    }
}

/// Position in WGS84 coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
}
