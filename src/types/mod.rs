//! Identity and set primitives shared by every part of the cache.

use std::borrow::{Borrow, Cow};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use rustc_hash::{FxHashMap, FxHashSet};
use serde::de::{self, Deserializer};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

/// Type tag of a tracked object (for example `Volume` or `Node.storage.io`).
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Kind(Cow<'static, str>);

impl Kind {
    /// Builds a kind from a static string without validation.
    ///
    /// The string must be non-empty and must not contain `/`.
    pub const fn from_static(tag: &'static str) -> Self {
        Kind(Cow::Borrowed(tag))
    }

    /// Builds a validated kind.
    pub fn new(tag: impl Into<String>) -> Result<Self> {
        let tag = tag.into();
        if tag.is_empty() || tag.contains('/') {
            return Err(CacheError::InvalidKind(tag));
        }
        Ok(Kind(Cow::Owned(tag)))
    }

    /// Returns the tag as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Kind {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        Kind::new(s)
    }
}

impl Serialize for Kind {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Kind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Kind::new(raw).map_err(de::Error::custom)
    }
}

/// Label naming an edge type from the source object's point of view.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Relation(Cow<'static, str>);

impl Relation {
    /// Ownership: the source names the target as one of its owners.
    pub const OWNER: Relation = Relation::from_static("owner");
    /// Generic usage edge.
    pub const USES: Relation = Relation::from_static("uses");
    /// Exclusive claim on the target (volumes, addresses).
    pub const CLAIMS: Relation = Relation::from_static("claims");

    /// Builds a relation from a static label.
    pub const fn from_static(label: &'static str) -> Self {
        Relation(Cow::Borrowed(label))
    }

    /// Builds a relation from an owned label.
    pub fn new(label: impl Into<String>) -> Self {
        Relation(Cow::Owned(label.into()))
    }

    /// Returns the label.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Relation {
    fn from(value: &str) -> Self {
        Relation::new(value)
    }
}

impl From<String> for Relation {
    fn from(value: String) -> Self {
        Relation::new(value)
    }
}

impl Borrow<str> for Relation {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for Relation {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Relation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        String::deserialize(deserializer).map(Relation::new)
    }
}

/// Identity of one object across every kind: `(kind, namespace, name)`.
///
/// The text form is `Kind/namespace/name`; cluster-scoped objects carry an
/// empty namespace (`Kind//name`).
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct ObjectId {
    kind: Kind,
    namespace: String,
    name: String,
}

impl ObjectId {
    /// Creates an id from its three parts.
    pub fn new(kind: Kind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Kind tag of the object.
    pub fn kind(&self) -> &Kind {
        &self.kind
    }

    /// Namespace, empty for cluster-scoped objects.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Object name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true when the id belongs to `kind`.
    pub fn is_kind(&self, kind: &Kind) -> bool {
        &self.kind == kind
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

impl FromStr for ObjectId {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split('/');
        let (Some(kind), Some(namespace), Some(name), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(CacheError::InvalidObjectId(s.to_string()));
        };
        if name.is_empty() {
            return Err(CacheError::InvalidObjectId(s.to_string()));
        }
        let kind = Kind::new(kind).map_err(|_| CacheError::InvalidObjectId(s.to_string()))?;
        Ok(ObjectId::new(kind, namespace, name))
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

/// Set of object ids. An empty set and a missing entry mean the same thing.
#[derive(Clone, Default, PartialEq, Eq, Debug)]
pub struct ObjectIdSet(FxHashSet<ObjectId>);

impl ObjectIdSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `id`, returning true if it was not present.
    pub fn insert(&mut self, id: ObjectId) -> bool {
        self.0.insert(id)
    }

    /// Removes `id`, returning true if it was present.
    pub fn remove(&mut self, id: &ObjectId) -> bool {
        self.0.remove(id)
    }

    /// Membership test.
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.0.contains(id)
    }

    /// Number of ids.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true when the set holds no ids.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = &ObjectId> {
        self.0.iter()
    }

    /// In-place union with `other`.
    pub fn join(&mut self, other: &ObjectIdSet) {
        self.0.extend(other.0.iter().cloned());
    }

    /// Union of two sets as a new set.
    pub fn union(&self, other: &ObjectIdSet) -> ObjectIdSet {
        let mut out = self.clone();
        out.join(other);
        out
    }

    /// Ids of the given kind.
    pub fn filter_kind(&self, kind: &Kind) -> ObjectIdSet {
        self.0.iter().filter(|id| id.is_kind(kind)).cloned().collect()
    }

    /// Drops every id whose kind differs from `kind`.
    pub fn retain_kind(&mut self, kind: &Kind) {
        self.0.retain(|id| id.is_kind(kind));
    }

    /// Ids in ascending order.
    pub fn sorted(&self) -> Vec<ObjectId> {
        let mut ids: Vec<ObjectId> = self.0.iter().cloned().collect();
        ids.sort_unstable();
        ids
    }
}

impl FromIterator<ObjectId> for ObjectIdSet {
    fn from_iter<I: IntoIterator<Item = ObjectId>>(iter: I) -> Self {
        ObjectIdSet(iter.into_iter().collect())
    }
}

impl Extend<ObjectId> for ObjectIdSet {
    fn extend<I: IntoIterator<Item = ObjectId>>(&mut self, iter: I) {
        self.0.extend(iter);
    }
}

impl IntoIterator for ObjectIdSet {
    type Item = ObjectId;
    type IntoIter = std::collections::hash_set::IntoIter<ObjectId>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a ObjectIdSet {
    type Item = &'a ObjectId;
    type IntoIter = std::collections::hash_set::Iter<'a, ObjectId>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl Serialize for ObjectIdSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_seq(self.sorted())
    }
}

impl<'de> Deserialize<'de> for ObjectIdSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Vec::<ObjectId>::deserialize(deserializer).map(|ids| ids.into_iter().collect())
    }
}

/// Outgoing (or incoming) edges of one object grouped by relation.
///
/// Relations with an empty target set are never stored.
#[derive(Clone, Default, PartialEq, Eq, Debug)]
pub struct UsageInfo(FxHashMap<Relation, ObjectIdSet>);

impl UsageInfo {
    /// Creates an empty usage map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Target set for `relation`, if any.
    pub fn get(&self, relation: &Relation) -> Option<&ObjectIdSet> {
        self.0.get(relation)
    }

    /// Returns true when `relation` contains `id`.
    pub fn contains(&self, relation: &Relation, id: &ObjectId) -> bool {
        self.0.get(relation).is_some_and(|set| set.contains(id))
    }

    /// Adds one edge, returning true if it was new.
    pub fn insert(&mut self, relation: Relation, id: ObjectId) -> bool {
        self.0.entry(relation).or_default().insert(id)
    }

    /// Removes one edge and prunes the relation when it becomes empty.
    pub fn remove(&mut self, relation: &Relation, id: &ObjectId) -> bool {
        let Some(set) = self.0.get_mut(relation) else {
            return false;
        };
        let removed = set.remove(id);
        if set.is_empty() {
            self.0.remove(relation);
        }
        removed
    }

    /// Unions `ids` into `relation`. Empty input leaves the map untouched.
    pub fn extend(&mut self, relation: Relation, ids: ObjectIdSet) {
        if ids.is_empty() {
            return;
        }
        self.0.entry(relation).or_default().join(&ids);
    }

    /// Iterates over `(relation, targets)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&Relation, &ObjectIdSet)> {
        self.0.iter()
    }

    /// Relations present in the map.
    pub fn relations(&self) -> impl Iterator<Item = &Relation> {
        self.0.keys()
    }

    /// Returns true when no edges are recorded.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Total number of edges across all relations.
    pub fn edge_count(&self) -> usize {
        self.0.values().map(ObjectIdSet::len).sum()
    }

    /// Union of the targets of every relation.
    pub fn all_targets(&self) -> ObjectIdSet {
        let mut out = ObjectIdSet::new();
        for set in self.0.values() {
            out.join(set);
        }
        out
    }
}

impl FromIterator<(Relation, ObjectIdSet)> for UsageInfo {
    fn from_iter<I: IntoIterator<Item = (Relation, ObjectIdSet)>>(iter: I) -> Self {
        let mut usage = UsageInfo::new();
        for (relation, ids) in iter {
            usage.extend(relation, ids);
        }
        usage
    }
}

impl Serialize for UsageInfo {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let ordered: BTreeMap<&Relation, &ObjectIdSet> = self.0.iter().collect();
        let mut map = serializer.serialize_map(Some(ordered.len()))?;
        for (relation, ids) in ordered {
            map.serialize_entry(relation, ids)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for UsageInfo {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        BTreeMap::<Relation, ObjectIdSet>::deserialize(deserializer)
            .map(|raw| raw.into_iter().collect())
    }
}

/// One directed edge.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize)]
pub struct Edge {
    /// Object holding the reference.
    pub source: ObjectId,
    /// Relation label.
    pub relation: Relation,
    /// Referenced object.
    pub target: ObjectId,
}
