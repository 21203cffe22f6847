//! Object store boundary.
//!
//! The cache never owns objects; it lists and watches them through
//! [`ObjectStore`] and only keeps the edges its extractors compute.

mod dynamic;
mod memory;

use std::sync::mpsc::Receiver;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{Kind, ObjectId};

pub use dynamic::DynamicObject;
pub use memory::MemoryStore;

/// Identity and ownership metadata carried by every object.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// Namespace, empty for cluster-scoped objects.
    #[serde(default)]
    pub namespace: String,
    /// Object name.
    pub name: String,
    /// Owners of this object.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<ObjectId>,
}

impl ObjectMeta {
    /// Creates metadata with no owners.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            owner_references: Vec::new(),
        }
    }

    /// Records `owner`, returning false if it was already present.
    pub fn add_owner(&mut self, owner: ObjectId) -> bool {
        if self.owner_references.contains(&owner) {
            return false;
        }
        self.owner_references.push(owner);
        true
    }
}

/// An object the cache can index.
pub trait Resource: Clone + Send + Sync + 'static {
    /// Kind tag of this object.
    fn kind(&self) -> Kind;

    /// Identity metadata.
    fn meta(&self) -> &ObjectMeta;

    /// Mutable identity metadata.
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    /// Full identity of this object.
    fn object_id(&self) -> ObjectId {
        let meta = self.meta();
        ObjectId::new(self.kind(), meta.namespace.clone(), meta.name.clone())
    }
}

/// A change notification from the store.
#[derive(Clone, Debug, PartialEq)]
pub enum WatchEvent<T> {
    /// The object was created.
    Created(T),
    /// The object was modified.
    Updated(T),
    /// The object was removed; carries its last known state.
    Deleted(T),
}

/// Stream of change notifications for one kind.
pub type Watch<T> = Receiver<WatchEvent<T>>;

/// Source of truth the cache is populated from.
pub trait ObjectStore: Send + Sync + 'static {
    /// Lists every current object of `kind`.
    fn list<T: Resource>(&self, kind: &Kind) -> Result<Vec<T>>;

    /// Subscribes to changes of `kind`. The stream ends when the store drops
    /// the subscription.
    fn watch<T: Resource>(&self, kind: &Kind) -> Result<Watch<T>>;

    /// Persists a new object.
    fn create<T: Resource>(&self, object: &T) -> Result<()>;
}
