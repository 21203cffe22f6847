use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{Kind, ObjectId, ObjectIdSet, Relation};

use super::{ObjectMeta, Resource};

/// Schemaless object whose references are listed explicitly per relation.
///
/// Snapshot files and the CLI use this shape:
///
/// ```json
/// {"kind": "Pod", "metadata": {"namespace": "ns", "name": "web"},
///  "refs": {"uses": ["Volume/ns/data"]}}
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicObject {
    /// Kind tag.
    pub kind: Kind,
    /// Identity metadata.
    pub metadata: ObjectMeta,
    /// Outgoing references grouped by relation.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub refs: BTreeMap<Relation, Vec<ObjectId>>,
}

impl DynamicObject {
    /// Creates an object with no references.
    pub fn new(kind: Kind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            metadata: ObjectMeta::new(namespace, name),
            refs: BTreeMap::new(),
        }
    }

    /// Adds a reference and returns the object.
    pub fn with_ref(mut self, relation: Relation, target: ObjectId) -> Self {
        self.refs.entry(relation).or_default().push(target);
        self
    }

    /// References through `relation` that point at objects of `kind`.
    /// Owner references count as [`Relation::OWNER`] edges.
    pub fn refs_to(&self, relation: &Relation, kind: &Kind) -> ObjectIdSet {
        let owners: &[ObjectId] = if *relation == Relation::OWNER {
            &self.metadata.owner_references
        } else {
            &[]
        };
        let listed: &[ObjectId] = self.refs.get(relation).map(Vec::as_slice).unwrap_or(&[]);
        owners
            .iter()
            .chain(listed)
            .filter(|target| target.is_kind(kind))
            .cloned()
            .collect()
    }

    /// Every `(relation, target kind)` pair this object references.
    pub fn reference_shapes(&self) -> impl Iterator<Item = (Relation, Kind)> + '_ {
        let owned = self
            .metadata
            .owner_references
            .iter()
            .map(|owner| (Relation::OWNER, owner.kind().clone()));
        let refs = self.refs.iter().flat_map(|(relation, targets)| {
            targets
                .iter()
                .map(move |target| (relation.clone(), target.kind().clone()))
        });
        owned.chain(refs)
    }
}

impl Resource for DynamicObject {
    fn kind(&self) -> Kind {
        self.kind.clone()
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_snapshot_shape() {
        let raw = r#"{
            "kind": "Pod",
            "metadata": {"namespace": "ns", "name": "web", "owner_references": ["ReplicaSet/ns/web-1"]},
            "refs": {"uses": ["Volume/ns/data", "Secret/ns/token"]}
        }"#;
        let obj: DynamicObject = serde_json::from_str(raw).expect("parse object");
        assert_eq!(obj.object_id().to_string(), "Pod/ns/web");
        let volumes = obj.refs_to(&Relation::USES, &Kind::from_static("Volume"));
        assert_eq!(volumes.len(), 1);
        let owners = obj.refs_to(&Relation::OWNER, &Kind::from_static("ReplicaSet"));
        assert_eq!(owners.sorted(), vec!["ReplicaSet/ns/web-1".parse::<ObjectId>().unwrap()]);
        let mut shapes: Vec<(Relation, Kind)> = obj.reference_shapes().collect();
        shapes.sort();
        shapes.dedup();
        assert_eq!(
            shapes,
            vec![
                (Relation::OWNER, Kind::from_static("ReplicaSet")),
                (Relation::USES, Kind::from_static("Secret")),
                (Relation::USES, Kind::from_static("Volume")),
            ]
        );
    }

    #[test]
    fn rejects_bad_reference() {
        let raw = r#"{"kind": "Pod", "metadata": {"name": "web"}, "refs": {"uses": ["nope"]}}"#;
        assert!(serde_json::from_str::<DynamicObject>(raw).is_err());
    }
}
