//! NMEA 2000 messages to Signal K deltas.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use signalk_core::{AlarmState, Delta, Notification, PathValue, Source, Update};
use tokio::time::Instant;
use tracing::{debug, info};

use super::frame::PgnMessage;
use super::mapping::{can_name, manufacturer_name, to_values};
use crate::app::{AppHandle, ProviderEvent};
use crate::record::{iso_now, Record};
use crate::stage::Transform;

/// How often raised notifications are checked, and how long a notification
/// may go without being re-asserted before it is reverted to normal.
pub const NOTIFICATION_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Drops messages from one device, one PGN, or one PGN of one device.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SourceFilter {
    /// `src` address, or CAN name when `useCanName` is on.
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub pgn: String,
}

impl SourceFilter {
    fn is_empty(&self) -> bool {
        self.source.trim().is_empty() && self.pgn.trim().is_empty()
    }

    fn matches(&self, source_id: &str, pgn: u32) -> bool {
        if self.is_empty() {
            return false;
        }
        let source = self.source.trim();
        let wanted_pgn = self.pgn.trim();
        (source.is_empty() || source == source_id)
            && (wanted_pgn.is_empty() || wanted_pgn == pgn.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct N2kOptions {
    #[serde(default)]
    pub use_can_name: bool,
    #[serde(default)]
    pub filters_enabled: bool,
    #[serde(default)]
    pub filters: Vec<SourceFilter>,
}

/// What we know about the device behind one bus address.
#[derive(Debug, Clone, Default, PartialEq)]
struct DeviceInfo {
    can_name: Option<String>,
    manufacturer_code: Option<String>,
    model_id: Option<String>,
}

#[derive(Debug)]
struct RaisedNotification {
    last_seen: Instant,
    next_check: Instant,
    source: Source,
    normal: Value,
}

/// Maps [`PgnMessage`]s to deltas, tracks device identity and reverts
/// engine notifications that stop being asserted.
#[derive(Debug)]
pub struct N2kToSignalK {
    label: String,
    options: N2kOptions,
    app: AppHandle,
    devices: HashMap<u8, DeviceInfo>,
    // Unbounded: one entry per (path, src) currently in a non-normal state.
    raised: HashMap<(String, u8), RaisedNotification>,
}

impl N2kToSignalK {
    pub fn new(label: &str, options: N2kOptions, app: AppHandle) -> Self {
        Self {
            label: label.to_string(),
            options,
            app,
            devices: HashMap::new(),
            raised: HashMap::new(),
        }
    }

    pub fn raised_count(&self) -> usize {
        self.raised.len()
    }

    fn update_device(&mut self, msg: &PgnMessage) {
        let mut info = self.devices.get(&msg.src).cloned().unwrap_or_default();
        match msg.pgn {
            60928 => {
                info.can_name = can_name(&msg.fields);
                info.manufacturer_code = msg.field("manufacturerCode").and_then(manufacturer_name);
            }
            126996 => {
                info.model_id = msg.field("modelId").and_then(Value::as_str).map(String::from);
            }
            _ => return,
        }
        if self.devices.get(&msg.src) == Some(&info) {
            return;
        }
        debug!("{}: device {} is now {:?}", self.label, msg.src, info);
        self.devices.insert(msg.src, info);

        let source = self.source_for(msg);
        let key = format!("{}.{}", self.label, msg.src);
        self.app.property_value(
            "n2k.device",
            json!({"key": key, "source": source, "pgn": msg.pgn}),
        );
        self.app.source_delta(
            key,
            Delta::single(None, Update::from_source(source, Some(msg.timestamp.clone()), Vec::new())),
        );
    }

    fn source_for(&self, msg: &PgnMessage) -> Source {
        let mut source = Source::n2k(&self.label, msg.src, msg.pgn);
        if let Some(info) = self.devices.get(&msg.src) {
            if self.options.use_can_name {
                source.can_name = info.can_name.clone();
            }
            source.manufacturer_code = info.manufacturer_code.clone();
            source.model_id = info.model_id.clone();
        }
        source.instance = match msg.field("instance") {
            Some(Value::Number(n)) => Some(n.to_string()),
            Some(Value::String(s)) => Some(s.clone()),
            _ => None,
        };
        source
    }

    fn filter_id(&self, src: u8) -> String {
        if self.options.use_can_name {
            if let Some(name) = self.devices.get(&src).and_then(|d| d.can_name.clone()) {
                return name;
            }
        }
        src.to_string()
    }

    fn is_filtered(&self, msg: &PgnMessage) -> bool {
        if !self.options.filters_enabled {
            return false;
        }
        let id = self.filter_id(msg.src);
        self.options.filters.iter().any(|f| f.matches(&id, msg.pgn))
    }

    fn track_notifications(&mut self, src: u8, source: &Source, values: &[PathValue]) {
        let now = Instant::now();
        for pv in values.iter().filter(|pv| pv.path.starts_with("notifications.")) {
            let key = (pv.path.clone(), src);
            match Notification::state_of(&pv.value) {
                None | Some(AlarmState::Normal) | Some(AlarmState::Nominal) => {
                    self.raised.remove(&key);
                }
                Some(_) => {
                    let mut normal = pv.value.clone();
                    normal["state"] = json!("normal");
                    normal["method"] = json!([]);
                    self.raised
                        .entry(key)
                        .and_modify(|r| r.last_seen = now)
                        .or_insert_with(|| RaisedNotification {
                            last_seen: now,
                            next_check: now + NOTIFICATION_CHECK_INTERVAL,
                            source: source.clone(),
                            normal,
                        });
                }
            }
        }
    }

    pub fn convert(&mut self, msg: PgnMessage) -> Option<Delta> {
        self.app.publish(ProviderEvent::N2kMessage {
            provider_id: self.label.clone(),
            message: msg.clone(),
        });
        self.update_device(&msg);
        if self.is_filtered(&msg) {
            return None;
        }
        let values = to_values(&msg);
        if values.is_empty() {
            return None;
        }
        let source = self.source_for(&msg);
        self.track_notifications(msg.src, &source, &values);
        Some(Delta::single(
            None,
            Update::from_source(source, Some(msg.timestamp), values),
        ))
    }
}

impl Transform for N2kToSignalK {
    fn name(&self) -> &str {
        "n2k-to-signalk"
    }

    fn handle_read(&mut self, record: Record, out: &mut Vec<Record>) {
        match record {
            Record::Pgn(msg) => out.extend(self.convert(msg).map(Record::Delta)),
            other => out.push(other),
        }
    }

    fn poll_timeout(&self) -> Option<Instant> {
        self.raised.values().map(|r| r.next_check).min()
    }

    fn handle_timeout(&mut self, now: Instant, out: &mut Vec<Record>) {
        let mut expired = Vec::new();
        for (key, raised) in self.raised.iter_mut() {
            if raised.next_check > now {
                continue;
            }
            if now.duration_since(raised.last_seen) > NOTIFICATION_CHECK_INTERVAL {
                expired.push(key.clone());
            } else {
                raised.next_check = now + NOTIFICATION_CHECK_INTERVAL;
            }
        }
        for key in expired {
            if let Some(raised) = self.raised.remove(&key) {
                info!("{}: {} from {} not repeated, reverting to normal", self.label, key.0, key.1);
                out.push(Record::Delta(Delta::single(
                    None,
                    Update::from_source(
                        raised.source,
                        Some(iso_now()),
                        vec![PathValue::new(key.0, raised.normal)],
                    ),
                )));
            }
        }
    }

    fn close(&mut self, _out: &mut Vec<Record>) {
        self.raised.clear();
    }
}
