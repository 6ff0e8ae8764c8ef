//! Metadata registry.
//!
//! Metadata arrives in `meta` updates and is kept apart from the value tree,
//! keyed by context and path. The aggregator copies registered metadata onto
//! a leaf when the leaf is first created.

use std::collections::HashMap;

use crate::model::Meta;

/// Storage for path metadata.
pub trait MetaRegistry: Send + Sync {
    /// Metadata registered for `path` in `context`, if any.
    fn get(&self, context: &str, path: &str) -> Option<Meta>;

    /// Register (merge) metadata for `path` in `context`.
    fn set(&mut self, context: &str, path: &str, meta: Meta);
}

/// In-memory metadata registry.
#[derive(Debug, Default)]
pub struct MemoryMetaRegistry {
    entries: HashMap<(String, String), Meta>,
}

impl MemoryMetaRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetaRegistry for MemoryMetaRegistry {
    fn get(&self, context: &str, path: &str) -> Option<Meta> {
        self.entries
            .get(&(context.to_string(), path.to_string()))
            .cloned()
    }

    fn set(&mut self, context: &str, path: &str, meta: Meta) {
        let entry = self
            .entries
            .entry((context.to_string(), path.to_string()))
            .or_default();
        let mut merged = meta;
        merged.fill_from(entry);
        *entry = merged;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_merges_fields() {
        let mut registry = MemoryMetaRegistry::new();
        registry.set(
            "vessels.self",
            "environment.depth.belowKeel",
            Meta {
                units: Some("m".into()),
                ..Default::default()
            },
        );
        registry.set(
            "vessels.self",
            "environment.depth.belowKeel",
            Meta {
                description: Some("Depth below keel".into()),
                ..Default::default()
            },
        );

        let meta = registry.get("vessels.self", "environment.depth.belowKeel").unwrap();
        assert_eq!(meta.units.as_deref(), Some("m"));
        assert_eq!(meta.description.as_deref(), Some("Depth below keel"));
        assert!(registry.get("vessels.other", "environment.depth.belowKeel").is_none());
    }
}
