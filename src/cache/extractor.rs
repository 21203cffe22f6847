use std::any::{type_name, Any};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::error::{CacheError, Result};
use crate::store::Resource;
use crate::types::{Kind, ObjectIdSet, Relation, UsageInfo};

/// Pure function computing the targets an object references.
pub type Extractor<T> = Arc<dyn Fn(&T) -> ObjectIdSet + Send + Sync>;

struct Rule<T> {
    relation: Relation,
    target: Kind,
    extract: Extractor<T>,
}

impl<T> Clone for Rule<T> {
    fn clone(&self) -> Self {
        Self {
            relation: self.relation.clone(),
            target: self.target.clone(),
            extract: Arc::clone(&self.extract),
        }
    }
}

struct ExtractorTable<T> {
    rules: Vec<Rule<T>>,
}

struct Entry {
    type_name: &'static str,
    shapes: Vec<(Relation, Kind)>,
    table: Arc<dyn Any + Send + Sync>,
}

/// Extractors per source kind.
///
/// Tables are replaced wholesale on registration, so extraction only holds
/// the registry lock long enough to clone an `Arc`.
#[derive(Default)]
pub(crate) struct ExtractorRegistry {
    entries: RwLock<FxHashMap<Kind, Entry>>,
}

impl ExtractorRegistry {
    /// Adds a rule for `source`. Returns true when this is the first rule for
    /// the kind.
    pub(crate) fn register<T: Resource>(
        &self,
        source: &Kind,
        relation: Relation,
        target: Kind,
        extract: Extractor<T>,
    ) -> Result<bool> {
        let mut entries = self.entries.write();
        let rule = Rule {
            relation: relation.clone(),
            target: target.clone(),
            extract,
        };
        let first = match entries.get_mut(source) {
            Some(entry) => {
                let table = downcast_table::<T>(source, entry)?;
                let mut rules = table.rules.clone();
                rules.push(rule);
                entry.table = Arc::new(ExtractorTable { rules });
                entry.shapes.push((relation.clone(), target.clone()));
                false
            }
            None => {
                entries.insert(
                    source.clone(),
                    Entry {
                        type_name: type_name::<T>(),
                        shapes: vec![(relation.clone(), target.clone())],
                        table: Arc::new(ExtractorTable { rules: vec![rule] }),
                    },
                );
                true
            }
        };
        debug!(source = %source, relation = %relation, target = %target, first, "cache.extractor.register");
        Ok(first)
    }

    /// Runs every rule for `source` against `object`.
    ///
    /// Kinds without rules produce an empty usage. Results are filtered to
    /// each rule's target kind and unioned per relation.
    pub(crate) fn extract<T: Resource>(&self, source: &Kind, object: &T) -> Result<UsageInfo> {
        let table = {
            let entries = self.entries.read();
            match entries.get(source) {
                Some(entry) => downcast_table::<T>(source, entry)?,
                None => return Ok(UsageInfo::new()),
            }
        };
        let mut usage = UsageInfo::new();
        for rule in &table.rules {
            let mut targets = (rule.extract)(object);
            targets.retain_kind(&rule.target);
            usage.extend(rule.relation.clone(), targets);
        }
        Ok(usage)
    }

    /// Verifies that `source` is registered for `T`.
    pub(crate) fn check_type<T: Resource>(&self, source: &Kind) -> Result<()> {
        let entries = self.entries.read();
        match entries.get(source) {
            Some(entry) => downcast_table::<T>(source, entry).map(|_| ()),
            None => Ok(()),
        }
    }

    pub(crate) fn contains(&self, source: &Kind) -> bool {
        self.entries.read().contains_key(source)
    }

    /// Registered `(relation, target kind)` pairs for `source`.
    pub(crate) fn shapes(&self, source: &Kind) -> Vec<(Relation, Kind)> {
        self.entries
            .read()
            .get(source)
            .map(|entry| entry.shapes.clone())
            .unwrap_or_default()
    }

    /// Every kind with at least one rule, sorted.
    pub(crate) fn kinds(&self) -> Vec<Kind> {
        let mut kinds: Vec<Kind> = self.entries.read().keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

fn downcast_table<T: Resource>(source: &Kind, entry: &Entry) -> Result<Arc<ExtractorTable<T>>> {
    Arc::clone(&entry.table)
        .downcast::<ExtractorTable<T>>()
        .map_err(|_| CacheError::KindTypeMismatch {
            kind: source.clone(),
            expected: entry.type_name,
            found: type_name::<T>(),
        })
}
