//! Snapshot loading for the `relcache` command-line tool.
//!
//! A snapshot is a JSON document listing [`DynamicObject`]s. Loading it fills
//! a [`MemoryStore`], registers one extractor per `(kind, relation, target
//! kind)` shape found in the objects, and waits for the cache to populate.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::{Extractor, RelationCache};
use crate::error::Result;
use crate::storage::CacheOptions;
use crate::store::{DynamicObject, MemoryStore};
use crate::types::{Kind, Relation};

/// Objects to load into an in-memory store.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Snapshot {
    /// Every object in the snapshot.
    #[serde(default)]
    pub objects: Vec<DynamicObject>,
}

impl Snapshot {
    /// Parses a snapshot from JSON text.
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Reads and parses the snapshot at `path`.
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    /// Reference shapes per source kind.
    pub fn shapes(&self) -> BTreeMap<Kind, BTreeSet<(Relation, Kind)>> {
        let mut shapes: BTreeMap<Kind, BTreeSet<(Relation, Kind)>> = BTreeMap::new();
        for object in &self.objects {
            let entry = shapes.entry(object.kind.clone()).or_default();
            entry.extend(object.reference_shapes());
        }
        shapes.retain(|_, pairs| !pairs.is_empty());
        shapes
    }

    /// Loads the snapshot into a fresh store and returns a populated cache.
    pub fn load(self, options: CacheOptions, timeout: Duration) -> Result<RelationCache<MemoryStore>> {
        let shapes = self.shapes();
        let store = MemoryStore::new();
        let count = self.objects.len();
        for object in self.objects {
            store.apply(object)?;
        }

        let cache = RelationCache::new(Arc::new(store), options);
        for (kind, pairs) in shapes {
            let rules = pairs.into_iter().map(|(relation, target)| {
                let wanted = relation.clone();
                let target_kind = target.clone();
                let extract: Extractor<DynamicObject> =
                    Arc::new(move |object: &DynamicObject| object.refs_to(&wanted, &target_kind));
                (relation, target, extract)
            });
            cache.register_extractors(kind, rules)?;
        }
        if let Err(err) = cache.wait_ready(timeout) {
            cache.shutdown();
            return Err(err);
        }
        info!(objects = count, kinds = cache.registered_kinds().len(), "cli.snapshot.loaded");
        Ok(cache)
    }
}
