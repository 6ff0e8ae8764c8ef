//! SignalK full-model aggregator.
//!
//! The store merges deltas from every provider into one tree per context
//! (e.g. one per vessel). Each leaf remembers which source wrote it last and,
//! once a second source reports the same path, the latest value of every
//! source under `values`. Contexts record when they were last modified so
//! inactive ones can be pruned.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::meta::{MemoryMetaRegistry, MetaRegistry};
use crate::model::{Delta, Meta, PathMeta, PathValue, Source, Update};
use crate::path::Path;
use crate::sources::{update_source_id, SourceRegistry};

/// SignalK schema version reported in the full model.
pub const SIGNALK_VERSION: &str = "1.7.0";

/// Operations the rest of the server uses on the full model.
pub trait SignalKStore: Send + Sync {
    /// Merge a delta into the tree. Malformed updates are skipped.
    fn add_delta(&mut self, delta: &Delta);

    /// Render the full model, including the `sources` branch.
    fn retrieve(&self) -> Value;

    /// Drop contexts not modified within `max_age`. Returns the removed keys.
    fn prune_contexts(&mut self, max_age: Duration) -> Vec<String>;

    /// Get value at an absolute dotted path (e.g., "vessels.urn:...navigation.position").
    fn get_path(&self, path: &str) -> Option<Value>;

    /// The self context, e.g. "vessels.urn:mrn:signalk:uuid:...".
    fn self_context(&self) -> &str;
}

/// Latest value reported by one source for a multi-source leaf.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceValue {
    pub value: Value,
    pub timestamp: Option<String>,
}

/// Per-source history of a leaf.
#[derive(Debug, Clone, PartialEq)]
pub enum LeafSources {
    /// Only the source in [`Leaf::source`] has reported this path.
    Single,
    /// At least two sources have reported; each one's latest value.
    Multi(BTreeMap<String, SourceValue>),
}

/// A value node in the tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Leaf {
    pub value: Value,
    /// `$source` of the most recent update.
    pub source: String,
    pub timestamp: Option<String>,
    pub meta: Option<Meta>,
    pub sources: LeafSources,
}

impl Leaf {
    fn new(value: Value, source: &str, timestamp: Option<String>, meta: Option<Meta>) -> Self {
        Self {
            value,
            source: source.to_string(),
            timestamp,
            meta,
            sources: LeafSources::Single,
        }
    }

    /// Apply a newer value. The top level always reflects the latest update.
    fn apply(&mut self, source: &str, value: Value, timestamp: Option<String>) {
        let latest = SourceValue {
            value: value.clone(),
            timestamp: timestamp.clone(),
        };
        match &mut self.sources {
            LeafSources::Multi(values) => {
                values.insert(source.to_string(), latest);
            }
            LeafSources::Single if self.source != source => {
                let mut values = BTreeMap::new();
                values.insert(
                    self.source.clone(),
                    SourceValue {
                        value: self.value.clone(),
                        timestamp: self.timestamp.clone(),
                    },
                );
                values.insert(source.to_string(), latest);
                self.sources = LeafSources::Multi(values);
            }
            LeafSources::Single => {}
        }
        self.value = value;
        self.source = source.to_string();
        self.timestamp = timestamp;
    }

    fn to_json(&self) -> Map<String, Value> {
        let mut out = Map::new();
        out.insert("value".into(), self.value.clone());
        out.insert("$source".into(), json!(self.source));
        out.insert("timestamp".into(), json!(self.timestamp));
        if let Some(meta) = &self.meta {
            out.insert("meta".into(), json!(meta));
        }
        if let LeafSources::Multi(values) = &self.sources {
            let values: Map<String, Value> = values
                .iter()
                .map(|(source, v)| {
                    (
                        source.clone(),
                        json!({ "value": v.value, "timestamp": v.timestamp }),
                    )
                })
                .collect();
            out.insert("values".into(), Value::Object(values));
        }
        out
    }
}

/// A branch of the tree. A node may carry a leaf and children at the same time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Node {
    pub children: BTreeMap<String, Node>,
    pub leaf: Option<Leaf>,
}

impl Node {
    fn descend(&mut self, segments: &[String]) -> &mut Node {
        segments.iter().fold(self, |node, segment| {
            node.children.entry(segment.clone()).or_default()
        })
    }

    fn find(&self, segments: &[String]) -> Option<&Node> {
        segments
            .iter()
            .try_fold(self, |node, segment| node.children.get(segment))
    }

    fn count_leaves(&self) -> usize {
        usize::from(self.leaf.is_some())
            + self.children.values().map(Node::count_leaves).sum::<usize>()
    }

    fn to_json(&self) -> Map<String, Value> {
        let mut out = self.leaf.as_ref().map(Leaf::to_json).unwrap_or_default();
        for (key, child) in &self.children {
            out.insert(key.clone(), Value::Object(child.to_json()));
        }
        out
    }
}

/// One tracked entity (a vessel, an aid to navigation, ...).
#[derive(Debug, Clone, PartialEq)]
pub struct ContextNode {
    /// Top-level group, e.g. "vessels".
    pub namespace: String,
    /// Identity below the group, e.g. "urn:mrn:imo:mmsi:230099999".
    pub identity: String,
    /// Identity fields and fields merged from empty-path values.
    pub fields: Map<String, Value>,
    pub tree: Node,
}

impl ContextNode {
    fn new(namespace: &str, identity: &str) -> Self {
        let mut fields = Map::new();
        let parts: Vec<&str> = identity.split(':').collect();
        match parts.as_slice() {
            ["urn", "mrn", "imo", "mmsi", mmsi] => {
                fields.insert("mmsi".into(), json!(mmsi));
            }
            ["urn", "mrn", "signalk", "uuid", _] => {
                fields.insert("uuid".into(), json!(identity));
            }
            _ => {
                fields.insert("url".into(), json!(identity));
            }
        }
        Self {
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            fields,
            tree: Node::default(),
        }
    }

    /// Leaf at a dotted path below this context.
    pub fn leaf(&self, path: &str) -> Option<&Leaf> {
        let path = Path::parse(path).ok()?;
        self.tree.find(path.segments())?.leaf.as_ref()
    }

    fn to_json(&self) -> Value {
        let mut out = self.fields.clone();
        out.extend(self.tree.to_json());
        Value::Object(out)
    }
}

/// The full SignalK model: all contexts plus the source registry.
pub struct FullSignalK {
    self_context: String,
    contexts: BTreeMap<String, ContextNode>,
    last_modified: HashMap<String, Instant>,
    sources: SourceRegistry,
    meta: Box<dyn MetaRegistry>,
}

impl FullSignalK {
    /// Create an empty model for the self vessel identified by `self_urn`.
    ///
    /// Accepts either "vessels.urn:mrn:..." or the bare URN.
    pub fn new(self_urn: &str) -> Self {
        Self::with_meta_registry(self_urn, Box::new(MemoryMetaRegistry::new()))
    }

    pub fn with_meta_registry(self_urn: &str, meta: Box<dyn MetaRegistry>) -> Self {
        let self_context = if self_urn.contains('.') {
            self_urn.to_string()
        } else {
            format!("vessels.{}", self_urn)
        };
        let mut model = Self {
            self_context: self_context.clone(),
            contexts: BTreeMap::new(),
            last_modified: HashMap::new(),
            sources: SourceRegistry::new(),
            meta,
        };
        model.ensure_context(&self_context);
        model
    }

    /// Map "vessels.self" and a missing context onto the self context.
    fn resolve_context(&self, context: Option<&str>) -> String {
        match context {
            None | Some("vessels.self") => self.self_context.clone(),
            Some(context) => context.to_string(),
        }
    }

    /// Create the context on first use. Returns false for malformed keys.
    fn ensure_context(&mut self, key: &str) -> bool {
        if self.contexts.contains_key(key) {
            return true;
        }
        match key.split_once('.') {
            Some((namespace, identity)) if !namespace.is_empty() && !identity.is_empty() => {
                debug!("Creating context {}", key);
                self.contexts
                    .insert(key.to_string(), ContextNode::new(namespace, identity));
                true
            }
            _ => false,
        }
    }

    /// Merge a delta, stamping the context's last-modified time with `now`.
    pub fn add_delta_at(&mut self, delta: &Delta, now: Instant) {
        let context = self.resolve_context(delta.context.as_deref());
        if !self.ensure_context(&context) {
            warn!("Ignoring delta with malformed context '{}'", context);
            return;
        }
        for update in &delta.updates {
            self.add_update(&context, update);
        }
        self.last_modified.insert(context, now);
    }

    fn add_update(&mut self, context: &str, update: &Update) {
        if update.is_empty() {
            warn!("Ignoring update without values or meta in {}", context);
            return;
        }
        match (&update.source, &update.source_ref) {
            (Some(source), _) => self.update_source(source, update.timestamp.as_deref()),
            (None, Some(source_ref)) => self.update_dollar_source(source_ref),
            (None, None) => warn!("No source in delta update for {}", context),
        }
        let source_id = update_source_id(update);
        self.add_values(context, &source_id, update.timestamp.as_deref(), &update.values);
        if let Some(metas) = &update.meta {
            self.add_metas(context, metas);
        }
    }

    /// Apply path/value pairs in order.
    pub fn add_values(
        &mut self,
        context: &str,
        source_id: &str,
        timestamp: Option<&str>,
        values: &[PathValue],
    ) {
        for pv in values {
            self.add_value(context, source_id, timestamp, pv);
        }
    }

    /// Apply one path/value pair to an existing context.
    pub fn add_value(
        &mut self,
        context: &str,
        source_id: &str,
        timestamp: Option<&str>,
        pv: &PathValue,
    ) {
        let meta = &self.meta;
        let Some(node) = self.contexts.get_mut(context) else {
            warn!("No context {} for value at {}", context, pv.path);
            return;
        };

        if pv.path.is_empty() {
            match &pv.value {
                Value::Object(fields) => {
                    for (key, value) in fields {
                        node.fields.insert(key.clone(), value.clone());
                    }
                }
                other => warn!("Ignoring non-object value {} for empty path", other),
            }
            return;
        }

        let path = match Path::parse(&pv.path) {
            Ok(path) => path,
            Err(e) => {
                warn!("Illegal value in delta: {}", e);
                return;
            }
        };
        let target = node.tree.descend(path.segments());
        let timestamp = timestamp.map(String::from);
        match &mut target.leaf {
            Some(leaf) => leaf.apply(source_id, pv.value.clone(), timestamp),
            None => {
                let registered = meta.get(context, &pv.path);
                target.leaf = Some(Leaf::new(pv.value.clone(), source_id, timestamp, registered));
            }
        }
    }

    pub fn add_metas(&mut self, context: &str, metas: &[PathMeta]) {
        for meta in metas {
            self.add_meta(context, meta);
        }
    }

    /// Register metadata; the value tree is not touched.
    pub fn add_meta(&mut self, context: &str, meta: &PathMeta) {
        self.meta.set(context, &meta.path, meta.value.clone());
    }

    pub fn update_source(&mut self, source: &Source, timestamp: Option<&str>) {
        self.sources.update_source(source, timestamp);
    }

    pub fn update_dollar_source(&mut self, source_ref: &str) {
        self.sources.update_dollar_source(source_ref);
    }

    /// Remove contexts last modified more than `max_age` before `now`.
    pub fn prune_contexts_at(&mut self, now: Instant, max_age: Duration) -> Vec<String> {
        let stale: Vec<String> = self
            .last_modified
            .iter()
            .filter(|(_, modified)| now.saturating_duration_since(**modified) > max_age)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            debug!("Pruning inactive context {}", key);
            self.delete_context(key);
        }
        stale
    }

    /// Remove a context and its last-modified entry.
    pub fn delete_context(&mut self, key: &str) {
        self.contexts.remove(key);
        self.last_modified.remove(key);
    }

    pub fn context(&self, key: &str) -> Option<&ContextNode> {
        self.contexts.get(&self.resolve_context(Some(key)))
    }

    pub fn contexts(&self) -> impl Iterator<Item = (&String, &ContextNode)> {
        self.contexts.iter()
    }

    /// Leaf at `path` in `context` ("vessels.self" allowed).
    pub fn leaf(&self, context: &str, path: &str) -> Option<&Leaf> {
        self.context(context)?.leaf(path)
    }

    pub fn sources(&self) -> &SourceRegistry {
        &self.sources
    }

    /// Number of leaves across all contexts.
    pub fn path_count(&self) -> usize {
        self.contexts.values().map(|c| c.tree.count_leaves()).sum()
    }
}

impl SignalKStore for FullSignalK {
    fn add_delta(&mut self, delta: &Delta) {
        self.add_delta_at(delta, Instant::now());
    }

    fn retrieve(&self) -> Value {
        let mut root = Map::new();
        root.insert("version".into(), json!(SIGNALK_VERSION));
        root.insert("self".into(), json!(self.self_context));
        for context in self.contexts.values() {
            let group = root
                .entry(context.namespace.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(group) = group {
                group.insert(context.identity.clone(), context.to_json());
            }
        }
        root.insert("sources".into(), self.sources.to_json());
        Value::Object(root)
    }

    fn prune_contexts(&mut self, max_age: Duration) -> Vec<String> {
        self.prune_contexts_at(Instant::now(), max_age)
    }

    fn get_path(&self, path: &str) -> Option<Value> {
        let (namespace, rest) = path.split_once('.')?;
        let (identity, leaf_path) = match rest.split_once('.') {
            Some((identity, leaf_path)) => (identity, Some(leaf_path)),
            None => (rest, None),
        };
        let key = self.resolve_context(Some(&format!("{}.{}", namespace, identity)));
        let context = self.contexts.get(&key)?.to_json();
        match leaf_path {
            None => Some(context),
            Some(leaf_path) => leaf_path
                .split('.')
                .try_fold(&context, |node, segment| node.get(segment))
                .cloned(),
        }
    }

    fn self_context(&self) -> &str {
        &self.self_context
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SELF_URN: &str = "vessels.urn:mrn:signalk:uuid:test-vessel";

    fn delta(context: &str, source: &str, path: &str, value: Value, ts: &str) -> Delta {
        Delta::single(
            Some(context.to_string()),
            Update {
                source_ref: Some(source.to_string()),
                timestamp: Some(ts.to_string()),
                values: vec![PathValue::new(path, value)],
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_new_model() {
        let model = FullSignalK::new(SELF_URN);
        let full = model.retrieve();
        assert_eq!(full["version"], "1.7.0");
        assert_eq!(full["self"], SELF_URN);
        assert_eq!(
            full["vessels"]["urn:mrn:signalk:uuid:test-vessel"]["uuid"],
            "urn:mrn:signalk:uuid:test-vessel"
        );
        assert!(full["sources"].is_object());
    }

    #[test]
    fn test_add_delta_to_self() {
        let mut model = FullSignalK::new(SELF_URN);
        model.add_delta(&delta(
            "vessels.self",
            "test.source",
            "navigation.speedOverGround",
            json!(3.85),
            "2024-01-17T10:30:00.000Z",
        ));

        let leaf = model.leaf("vessels.self", "navigation.speedOverGround").unwrap();
        assert_eq!(leaf.value, json!(3.85));
        assert_eq!(leaf.source, "test.source");
        assert_eq!(leaf.timestamp.as_deref(), Some("2024-01-17T10:30:00.000Z"));
        assert_eq!(leaf.sources, LeafSources::Single);
    }

    #[test]
    fn test_same_source_twice_is_idempotent() {
        let mut model = FullSignalK::new(SELF_URN);
        let d = delta("vessels.self", "gps", "navigation.speedOverGround", json!(3.85), "t1");
        model.add_delta(&d);
        let once = model.leaf("vessels.self", "navigation.speedOverGround").cloned();
        model.add_delta(&d);
        let twice = model.leaf("vessels.self", "navigation.speedOverGround").cloned();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_multi_source_merge() {
        let mut model = FullSignalK::new(SELF_URN);
        model.add_delta(&delta("vessels.self", "A", "nav.x", json!(1), "t1"));
        model.add_delta(&delta("vessels.self", "B", "nav.x", json!(2), "t2"));

        let leaf = model.leaf("vessels.self", "nav.x").unwrap();
        assert_eq!(leaf.value, json!(2));
        assert_eq!(leaf.source, "B");
        let LeafSources::Multi(values) = &leaf.sources else {
            panic!("expected multi-source leaf");
        };
        assert_eq!(values["A"].value, json!(1));
        assert_eq!(values["A"].timestamp.as_deref(), Some("t1"));
        assert_eq!(values["B"].value, json!(2));

        // a third report from A keeps history and flips the top level back
        model.add_delta(&delta("vessels.self", "A", "nav.x", json!(3), "t3"));
        let full = model.retrieve();
        let leaf = &full["vessels"]["urn:mrn:signalk:uuid:test-vessel"]["nav"]["x"];
        assert_eq!(leaf["value"], 3);
        assert_eq!(leaf["$source"], "A");
        assert_eq!(leaf["values"]["A"]["value"], 3);
        assert_eq!(leaf["values"]["B"]["value"], 2);
    }

    #[test]
    fn test_context_identity_from_key() {
        let mut model = FullSignalK::new(SELF_URN);
        model.add_delta(&delta(
            "vessels.urn:mrn:imo:mmsi:230099999",
            "ais",
            "navigation.speedOverGround",
            json!(5.2),
            "t1",
        ));
        let full = model.retrieve();
        let other = &full["vessels"]["urn:mrn:imo:mmsi:230099999"];
        assert_eq!(other["mmsi"], "230099999");
        assert_eq!(other["navigation"]["speedOverGround"]["value"], 5.2);
    }

    #[test]
    fn test_empty_path_merges_into_context() {
        let mut model = FullSignalK::new(SELF_URN);
        model.add_delta(&delta("vessels.self", "ais", "", json!({"name": "Eagle"}), "t1"));
        let full = model.retrieve();
        let vessel = &full["vessels"]["urn:mrn:signalk:uuid:test-vessel"];
        assert_eq!(vessel["name"], "Eagle");
        assert_eq!(vessel["uuid"], "urn:mrn:signalk:uuid:test-vessel");
    }

    #[test]
    fn test_malformed_update_does_not_stop_delta() {
        let mut model = FullSignalK::new(SELF_URN);
        let delta = Delta {
            context: None,
            updates: vec![
                Update {
                    source_ref: Some("x".into()),
                    ..Default::default()
                },
                Update {
                    source_ref: Some("x".into()),
                    values: vec![
                        PathValue::new("navigation..bad", 1),
                        PathValue::new("navigation.headingTrue", 1.5),
                    ],
                    ..Default::default()
                },
            ],
        };
        model.add_delta(&delta);
        assert_eq!(model.path_count(), 1);
        assert!(model.leaf("vessels.self", "navigation.headingTrue").is_some());
    }

    #[test]
    fn test_meta_attaches_on_leaf_creation() {
        let mut model = FullSignalK::new(SELF_URN);
        let meta_delta = Delta::single(
            None,
            Update {
                source_ref: Some("defaults".into()),
                meta: Some(vec![PathMeta {
                    path: "environment.depth.belowKeel".into(),
                    value: Meta {
                        units: Some("m".into()),
                        ..Default::default()
                    },
                }]),
                ..Default::default()
            },
        );
        model.add_delta(&meta_delta);
        assert!(model.leaf("vessels.self", "environment.depth.belowKeel").is_none());

        model.add_delta(&delta("vessels.self", "sounder", "environment.depth.belowKeel", json!(4.2), "t1"));
        let leaf = model.leaf("vessels.self", "environment.depth.belowKeel").unwrap();
        assert_eq!(leaf.meta.as_ref().unwrap().units.as_deref(), Some("m"));
    }

    #[test]
    fn test_prune_contexts() {
        let mut model = FullSignalK::new(SELF_URN);
        let start = Instant::now();
        model.add_delta_at(
            &delta("vessels.urn:mrn:imo:mmsi:1", "ais", "a.b", json!(1), "t1"),
            start,
        );
        model.add_delta_at(
            &delta("vessels.urn:mrn:imo:mmsi:2", "ais", "a.b", json!(1), "t1"),
            start + Duration::from_secs(50),
        );

        let removed = model.prune_contexts_at(start + Duration::from_secs(70), Duration::from_secs(60));
        assert_eq!(removed, vec!["vessels.urn:mrn:imo:mmsi:1".to_string()]);
        assert!(model.context("vessels.urn:mrn:imo:mmsi:1").is_none());
        assert!(model.context("vessels.urn:mrn:imo:mmsi:2").is_some());
    }

    #[test]
    fn test_sources_branch_from_updates() {
        let mut model = FullSignalK::new(SELF_URN);
        let update = Update::from_source(
            Source::n2k("can0", 35, 127250),
            Some("2024-01-01T00:00:00Z".into()),
            vec![PathValue::new("navigation.headingTrue", 1.0)],
        );
        model.add_delta(&Delta::single(None, update));

        let leaf = model.leaf("vessels.self", "navigation.headingTrue").unwrap();
        assert_eq!(leaf.source, "can0.35");
        let full = model.retrieve();
        assert_eq!(full["sources"]["can0"]["35"]["n2k"]["pgns"]["127250"], "2024-01-01T00:00:00Z");
    }

    #[test]
    fn test_get_path() {
        let mut model = FullSignalK::new(SELF_URN);
        model.add_delta(&delta("vessels.self", "gps", "navigation.position", json!({"latitude": 60.1, "longitude": 24.9}), "t1"));

        let value = model
            .get_path("vessels.urn:mrn:signalk:uuid:test-vessel.navigation.position")
            .unwrap();
        assert_eq!(value["value"]["latitude"], 60.1);
        assert!(model.get_path("vessels.self.navigation.position.value").is_some());
        assert!(model.get_path("vessels.self.navigation.nonexistent").is_none());
    }
}
