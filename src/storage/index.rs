use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::debug;

use crate::types::{Edge, Kind, ObjectId, ObjectIdSet, Relation, UsageInfo};

use super::metrics::{default_metrics, CacheMetrics};

/// Forward and reverse edge maps. Both sides are only ever mutated together
/// under the owning [`EdgeIndex`] write lock.
#[derive(Default)]
pub(super) struct Adjacency {
    pub(super) forward: FxHashMap<ObjectId, UsageInfo>,
    pub(super) reverse: FxHashMap<ObjectId, UsageInfo>,
}

impl Adjacency {
    fn link(&mut self, edge: &Edge) -> bool {
        let added = self
            .forward
            .entry(edge.source.clone())
            .or_default()
            .insert(edge.relation.clone(), edge.target.clone());
        self.reverse
            .entry(edge.target.clone())
            .or_default()
            .insert(edge.relation.clone(), edge.source.clone());
        added
    }

    fn unlink(&mut self, edge: &Edge) -> bool {
        let removed = remove_member(&mut self.forward, &edge.source, &edge.relation, &edge.target);
        remove_member(&mut self.reverse, &edge.target, &edge.relation, &edge.source);
        removed
    }

    fn side(&self, side: Side) -> &FxHashMap<ObjectId, UsageInfo> {
        match side {
            Side::Forward => &self.forward,
            Side::Reverse => &self.reverse,
        }
    }
}

fn remove_member(
    map: &mut FxHashMap<ObjectId, UsageInfo>,
    key: &ObjectId,
    relation: &Relation,
    member: &ObjectId,
) -> bool {
    let Some(usage) = map.get_mut(key) else {
        return false;
    };
    let removed = usage.remove(relation, member);
    if usage.is_empty() {
        map.remove(key);
    }
    removed
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Side {
    Forward,
    Reverse,
}

impl Side {
    fn label(self) -> &'static str {
        match self {
            Side::Forward => "forward",
            Side::Reverse => "reverse",
        }
    }
}

/// Edges inserted and removed by one replace call, in ascending order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct EdgeDelta {
    /// Newly recorded edges.
    pub added: Vec<Edge>,
    /// Edges that no longer exist.
    pub removed: Vec<Edge>,
}

impl EdgeDelta {
    /// Returns true when the call changed nothing.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// Targets whose reverse side changed.
    pub fn touched_targets(&self) -> ObjectIdSet {
        self.added
            .iter()
            .chain(self.removed.iter())
            .map(|edge| edge.target.clone())
            .collect()
    }
}

/// Size summary of the index.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    /// Objects with at least one outgoing edge.
    pub sources: usize,
    /// Objects with at least one incoming edge.
    pub targets: usize,
    /// Total number of edges.
    pub edges: usize,
}

/// Result of [`EdgeIndex::verify`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    /// Edges present on one side only.
    pub asymmetric: Vec<Edge>,
    /// Entries holding no edges at all.
    pub empty_entries: usize,
}

impl IntegrityReport {
    /// Returns true when no issue was found.
    pub fn is_clean(&self) -> bool {
        self.asymmetric.is_empty() && self.empty_entries == 0
    }
}

/// Bidirectional index of typed edges between objects.
///
/// `forward[a][r]` holds what `a` points to through relation `r`;
/// `reverse[b][r]` holds who points to `b` through `r`. All mutations take the
/// write lock for their whole body, so both sides are always consistent from
/// the point of view of readers.
pub struct EdgeIndex {
    pub(super) adj: RwLock<Adjacency>,
    metrics: Arc<dyn CacheMetrics>,
}

impl Default for EdgeIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl EdgeIndex {
    /// Creates an empty index that discards metrics.
    pub fn new() -> Self {
        Self::with_metrics(default_metrics())
    }

    /// Creates an empty index reporting into `metrics`.
    pub fn with_metrics(metrics: Arc<dyn CacheMetrics>) -> Self {
        Self {
            adj: RwLock::new(Adjacency::default()),
            metrics,
        }
    }

    /// Replaces every outgoing edge of `id` with `usage`.
    ///
    /// Relations missing from `usage` are dropped entirely.
    pub fn replace_object_usage_info(&self, id: &ObjectId, usage: &UsageInfo) -> EdgeDelta {
        self.replace_object_usage_info_for_kinds(id, &[], usage)
    }

    /// Replaces the outgoing edges of `id` whose target kind is in `scope`.
    ///
    /// Edges to kinds outside `scope` are left exactly as they are, and targets
    /// in `usage` outside `scope` are ignored. An empty scope covers every kind.
    pub fn replace_object_usage_info_for_kinds(
        &self,
        id: &ObjectId,
        scope: &[Kind],
        usage: &UsageInfo,
    ) -> EdgeDelta {
        let mut adj = self.adj.write();
        self.apply_usage(&mut adj, id, scope, usage)
    }

    /// Applies `usage` and reads the post-update users of `id` under a single
    /// write lock.
    pub(crate) fn replace_and_collect_users(
        &self,
        id: &ObjectId,
        scope: &[Kind],
        usage: &UsageInfo,
    ) -> (EdgeDelta, ObjectIdSet) {
        let mut adj = self.adj.write();
        let delta = self.apply_usage(&mut adj, id, scope, usage);
        let users = adj
            .reverse
            .get(id)
            .map(UsageInfo::all_targets)
            .unwrap_or_default();
        (delta, users)
    }

    fn apply_usage(
        &self,
        adj: &mut Adjacency,
        id: &ObjectId,
        scope: &[Kind],
        usage: &UsageInfo,
    ) -> EdgeDelta {
        let in_scope = |target: &ObjectId| scope.is_empty() || scope.contains(target.kind());
        let mut delta = EdgeDelta::default();
        let empty = UsageInfo::new();
        let old = adj.forward.get(id).unwrap_or(&empty);
        for (relation, targets) in usage.iter() {
            for target in targets {
                if in_scope(target) && !old.contains(relation, target) {
                    delta.added.push(Edge {
                        source: id.clone(),
                        relation: relation.clone(),
                        target: target.clone(),
                    });
                }
            }
        }
        for (relation, targets) in old.iter() {
            let fresh = usage.get(relation);
            for target in targets {
                if in_scope(target) && !fresh.is_some_and(|set| set.contains(target)) {
                    delta.removed.push(Edge {
                        source: id.clone(),
                        relation: relation.clone(),
                        target: target.clone(),
                    });
                }
            }
        }
        for edge in &delta.removed {
            adj.unlink(edge);
        }
        for edge in &delta.added {
            adj.link(edge);
        }
        delta.added.sort_unstable();
        delta.removed.sort_unstable();

        self.metrics.object_replaced();
        if !delta.is_empty() {
            self.metrics.edges_added(delta.added.len() as u64);
            self.metrics.edges_removed(delta.removed.len() as u64);
            debug!(
                id = %id,
                added = delta.added.len(),
                removed = delta.removed.len(),
                scoped = !scope.is_empty(),
                "cache.index.replace"
            );
        }
        delta
    }

    /// Removes every edge touching `id` and returns who pointed at it before.
    pub fn delete_object(&self, id: &ObjectId) -> ObjectIdSet {
        let mut adj = self.adj.write();
        let users = adj
            .reverse
            .get(id)
            .map(UsageInfo::all_targets)
            .unwrap_or_default();
        let mut removed = 0u64;
        if let Some(outgoing) = adj.forward.remove(id) {
            for (relation, targets) in outgoing.iter() {
                for target in targets {
                    remove_member(&mut adj.reverse, target, relation, id);
                    removed += 1;
                }
            }
        }
        if let Some(incoming) = adj.reverse.remove(id) {
            for (relation, sources) in incoming.iter() {
                for source in sources {
                    if remove_member(&mut adj.forward, source, relation, id) {
                        removed += 1;
                    }
                }
            }
        }
        self.metrics.object_deleted();
        self.metrics.edges_removed(removed);
        debug!(id = %id, removed, users = users.len(), "cache.index.delete");
        users
    }

    fn collect(
        &self,
        side: Side,
        id: &ObjectId,
        relation: Option<&Relation>,
        kind: Option<&Kind>,
    ) -> ObjectIdSet {
        self.metrics.lookup(side.label());
        let adj = self.adj.read();
        let Some(usage) = adj.side(side).get(id) else {
            return ObjectIdSet::new();
        };
        let mut out = ObjectIdSet::new();
        for (rel, ids) in usage.iter() {
            if relation.is_some_and(|wanted| wanted != rel) {
                continue;
            }
            match kind {
                Some(kind) => out.extend(ids.iter().filter(|id| id.is_kind(kind)).cloned()),
                None => out.join(ids),
            }
        }
        out
    }

    /// Everything pointing at `id`, across all relations.
    pub fn get_users_for(&self, id: &ObjectId) -> ObjectIdSet {
        self.collect(Side::Reverse, id, None, None)
    }

    /// Objects of `kind` pointing at `id`.
    pub fn get_users_for_kind(&self, id: &ObjectId, kind: &Kind) -> ObjectIdSet {
        self.collect(Side::Reverse, id, None, Some(kind))
    }

    /// Objects pointing at `id` through `relation`.
    pub fn get_users_for_relation(&self, id: &ObjectId, relation: &Relation) -> ObjectIdSet {
        self.collect(Side::Reverse, id, Some(relation), None)
    }

    /// Objects of `kind` pointing at `id` through `relation`.
    pub fn get_users_for_relation_to_kind(
        &self,
        id: &ObjectId,
        relation: &Relation,
        kind: &Kind,
    ) -> ObjectIdSet {
        self.collect(Side::Reverse, id, Some(relation), Some(kind))
    }

    /// Everything `id` points at, across all relations.
    pub fn get_used_objects_for(&self, id: &ObjectId) -> ObjectIdSet {
        self.collect(Side::Forward, id, None, None)
    }

    /// Objects of `kind` that `id` points at.
    pub fn get_used_objects_for_kind(&self, id: &ObjectId, kind: &Kind) -> ObjectIdSet {
        self.collect(Side::Forward, id, None, Some(kind))
    }

    /// Objects `id` points at through `relation`.
    pub fn get_used_objects_for_relation(&self, id: &ObjectId, relation: &Relation) -> ObjectIdSet {
        self.collect(Side::Forward, id, Some(relation), None)
    }

    /// Objects of `kind` that `id` points at through `relation`.
    pub fn get_used_objects_for_relation_to_kind(
        &self,
        id: &ObjectId,
        relation: &Relation,
        kind: &Kind,
    ) -> ObjectIdSet {
        self.collect(Side::Forward, id, Some(relation), Some(kind))
    }

    /// Owners named by `id` through [`Relation::OWNER`].
    pub fn get_owners_for(&self, id: &ObjectId) -> ObjectIdSet {
        self.get_used_objects_for_relation(id, &Relation::OWNER)
    }

    /// Owners of `kind` named by `id`.
    pub fn get_owners_for_kind(&self, id: &ObjectId, kind: &Kind) -> ObjectIdSet {
        self.get_used_objects_for_relation_to_kind(id, &Relation::OWNER, kind)
    }

    /// Objects naming `id` as their owner.
    pub fn get_serfs_for(&self, id: &ObjectId) -> ObjectIdSet {
        self.get_users_for_relation(id, &Relation::OWNER)
    }

    /// Objects of `kind` naming `id` as their owner.
    pub fn get_serfs_for_kind(&self, id: &ObjectId, kind: &Kind) -> ObjectIdSet {
        self.get_users_for_relation_to_kind(id, &Relation::OWNER, kind)
    }

    /// Copy of the outgoing edges of `id`.
    pub fn usage_info(&self, id: &ObjectId) -> UsageInfo {
        self.adj.read().forward.get(id).cloned().unwrap_or_default()
    }

    /// Copy of the incoming edges of `id`, keyed by the pointer's relation.
    pub fn user_info(&self, id: &ObjectId) -> UsageInfo {
        self.adj.read().reverse.get(id).cloned().unwrap_or_default()
    }

    /// Returns true when `id` has any edge in either direction.
    pub fn contains(&self, id: &ObjectId) -> bool {
        let adj = self.adj.read();
        adj.forward.contains_key(id) || adj.reverse.contains_key(id)
    }

    /// Counts sources, targets and edges.
    pub fn stats(&self) -> IndexStats {
        let adj = self.adj.read();
        IndexStats {
            sources: adj.forward.len(),
            targets: adj.reverse.len(),
            edges: adj.forward.values().map(UsageInfo::edge_count).sum(),
        }
    }

    /// Ordered copy of the forward side.
    pub fn snapshot(&self) -> BTreeMap<ObjectId, UsageInfo> {
        let adj = self.adj.read();
        adj.forward
            .iter()
            .map(|(id, usage)| (id.clone(), usage.clone()))
            .collect()
    }

    /// Cross-checks the two sides of the index.
    pub fn verify(&self) -> IntegrityReport {
        let adj = self.adj.read();
        let mut report = IntegrityReport::default();
        for (source, usage) in &adj.forward {
            if usage.is_empty() {
                report.empty_entries += 1;
            }
            for (relation, targets) in usage.iter() {
                for target in targets {
                    let mirrored = adj
                        .reverse
                        .get(target)
                        .is_some_and(|back| back.contains(relation, source));
                    if !mirrored {
                        report.asymmetric.push(Edge {
                            source: source.clone(),
                            relation: relation.clone(),
                            target: target.clone(),
                        });
                    }
                }
            }
        }
        for (target, usage) in &adj.reverse {
            if usage.is_empty() {
                report.empty_entries += 1;
            }
            for (relation, sources) in usage.iter() {
                for source in sources {
                    let mirrored = adj
                        .forward
                        .get(source)
                        .is_some_and(|fwd| fwd.contains(relation, target));
                    if !mirrored {
                        report.asymmetric.push(Edge {
                            source: source.clone(),
                            relation: relation.clone(),
                            target: target.clone(),
                        });
                    }
                }
            }
        }
        report.asymmetric.sort_unstable();
        report.asymmetric.dedup();
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::metrics::CounterMetrics;

    fn id(s: &str) -> ObjectId {
        s.parse().expect("valid id")
    }

    fn usage(pairs: &[(&'static str, &str)]) -> UsageInfo {
        let mut out = UsageInfo::new();
        for (rel, target) in pairs {
            out.insert(Relation::from_static(*rel), id(target));
        }
        out
    }

    fn set(ids: &[&str]) -> ObjectIdSet {
        ids.iter().map(|s| id(s)).collect()
    }

    #[test]
    fn replace_links_both_sides() {
        let index = EdgeIndex::new();
        let src = id("Pod/ns/web");
        let delta = index.replace_object_usage_info(&src, &usage(&[("uses", "Volume/ns/data")]));
        assert_eq!(delta.added.len(), 1);
        assert!(delta.removed.is_empty());
        assert_eq!(index.get_used_objects_for(&src), set(&["Volume/ns/data"]));
        assert_eq!(index.get_users_for(&id("Volume/ns/data")), set(&["Pod/ns/web"]));
        assert!(index.verify().is_clean());
    }

    #[test]
    fn relation_dropped_from_usage_is_removed() {
        let index = EdgeIndex::new();
        let src = id("Pod/ns/web");
        index.replace_object_usage_info(
            &src,
            &usage(&[("uses", "Volume/ns/a"), ("claims", "Ip/ns/x")]),
        );
        let delta = index.replace_object_usage_info(&src, &usage(&[("uses", "Volume/ns/a")]));
        assert_eq!(delta.removed.len(), 1);
        assert_eq!(delta.removed[0].relation, Relation::CLAIMS);
        assert!(index.get_users_for(&id("Ip/ns/x")).is_empty());
        assert!(!index.contains(&id("Ip/ns/x")));
    }

    #[test]
    fn unchanged_usage_is_a_no_op() {
        let metrics = Arc::new(CounterMetrics::default());
        let index = EdgeIndex::with_metrics(metrics.clone());
        let src = id("Pod/ns/web");
        let u = usage(&[("uses", "Volume/ns/a"), ("uses", "Volume/ns/b")]);
        index.replace_object_usage_info(&src, &u);
        let before = index.snapshot();
        let delta = index.replace_object_usage_info(&src, &u);
        assert!(delta.is_empty());
        assert_eq!(index.snapshot(), before);
        assert_eq!(metrics.snapshot().edges_added, 2);
        assert_eq!(metrics.snapshot().objects_replaced, 2);
    }

    #[test]
    fn scoped_replace_leaves_other_kinds_alone() {
        let index = EdgeIndex::new();
        let src = id("Pod/ns/web");
        index.replace_object_usage_info(
            &src,
            &usage(&[("uses", "Volume/ns/a"), ("uses", "Secret/ns/s")]),
        );
        let delta = index.replace_object_usage_info_for_kinds(
            &src,
            &[Kind::from_static("Volume")],
            &usage(&[("uses", "Volume/ns/b"), ("uses", "Secret/ns/ignored")]),
        );
        assert_eq!(delta.added.len(), 1);
        assert_eq!(delta.removed.len(), 1);
        assert_eq!(
            index.get_used_objects_for(&src),
            set(&["Volume/ns/b", "Secret/ns/s"])
        );
        assert!(index.get_users_for(&id("Secret/ns/ignored")).is_empty());
    }

    #[test]
    fn delete_returns_prior_users_and_cleans_both_sides() {
        let index = EdgeIndex::new();
        let vol = id("Volume/ns/a");
        index.replace_object_usage_info(&id("Pod/ns/p1"), &usage(&[("uses", "Volume/ns/a")]));
        index.replace_object_usage_info(&id("Pod/ns/p2"), &usage(&[("claims", "Volume/ns/a")]));
        index.replace_object_usage_info(&vol, &usage(&[("uses", "Disk//d1")]));

        let users = index.delete_object(&vol);
        assert_eq!(users, set(&["Pod/ns/p1", "Pod/ns/p2"]));
        assert!(index.get_used_objects_for(&vol).is_empty());
        assert!(index.get_users_for(&vol).is_empty());
        assert!(index.get_users_for(&id("Disk//d1")).is_empty());
        assert!(index.get_used_objects_for(&id("Pod/ns/p1")).is_empty());
        assert_eq!(index.stats(), IndexStats::default());
        assert!(index.verify().is_clean());
    }

    #[test]
    fn delete_handles_self_loops() {
        let index = EdgeIndex::new();
        let node = id("Scope//root");
        index.replace_object_usage_info(&node, &usage(&[("parent", "Scope//root")]));
        assert_eq!(index.delete_object(&node), set(&["Scope//root"]));
        assert_eq!(index.stats(), IndexStats::default());
    }

    #[test]
    fn filtered_queries() {
        let index = EdgeIndex::new();
        let src = id("Pod/ns/web");
        index.replace_object_usage_info(
            &src,
            &usage(&[
                ("uses", "Volume/ns/a"),
                ("uses", "Secret/ns/s"),
                ("owner", "Deployment/ns/web"),
            ]),
        );
        let volume = Kind::from_static("Volume");
        assert_eq!(index.get_used_objects_for_kind(&src, &volume), set(&["Volume/ns/a"]));
        assert_eq!(
            index.get_used_objects_for_relation(&src, &Relation::USES),
            set(&["Volume/ns/a", "Secret/ns/s"])
        );
        assert_eq!(
            index.get_used_objects_for_relation_to_kind(&src, &Relation::USES, &volume),
            set(&["Volume/ns/a"])
        );
        assert_eq!(index.get_owners_for(&src), set(&["Deployment/ns/web"]));
        assert_eq!(index.get_serfs_for(&id("Deployment/ns/web")), set(&["Pod/ns/web"]));
        assert_eq!(
            index.get_serfs_for_kind(&id("Deployment/ns/web"), &Kind::from_static("Pod")),
            set(&["Pod/ns/web"])
        );
        assert!(index
            .get_users_for_relation_to_kind(&id("Volume/ns/a"), &Relation::OWNER, &volume)
            .is_empty());
        assert!(index.get_users_for(&id("Nope/ns/x")).is_empty());
    }
}
