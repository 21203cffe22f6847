use std::any::{type_name, Any};
use std::collections::BTreeMap;
use std::sync::mpsc::{self, Sender};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::error::{CacheError, Result};
use crate::types::{Kind, ObjectId};

use super::{ObjectStore, Resource, Watch, WatchEvent};

struct Slot {
    type_name: &'static str,
    bucket: Box<dyn Any + Send>,
}

struct Bucket<T> {
    objects: BTreeMap<(String, String), T>,
    watchers: Vec<Sender<WatchEvent<T>>>,
}

impl<T> Default for Bucket<T> {
    fn default() -> Self {
        Self {
            objects: BTreeMap::new(),
            watchers: Vec::new(),
        }
    }
}

impl<T: Clone> Bucket<T> {
    fn broadcast(&mut self, event: WatchEvent<T>) {
        self.watchers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// In-process object store with typed per-kind buckets.
///
/// Every kind is bound to the Rust type it was first used with. Watchers get
/// every change made through [`MemoryStore::apply`], [`MemoryStore::delete`]
/// and [`ObjectStore::create`].
#[derive(Default)]
pub struct MemoryStore {
    slots: Mutex<FxHashMap<Kind, Slot>>,
    list_failures: Mutex<FxHashMap<Kind, u32>>,
}

fn bucket_mut<'a, T: Resource>(
    slots: &'a mut FxHashMap<Kind, Slot>,
    kind: &Kind,
) -> Result<&'a mut Bucket<T>> {
    let slot = slots.entry(kind.clone()).or_insert_with(|| Slot {
        type_name: type_name::<T>(),
        bucket: Box::new(Bucket::<T>::default()),
    });
    let expected = slot.type_name;
    slot.bucket
        .downcast_mut::<Bucket<T>>()
        .ok_or_else(|| CacheError::KindTypeMismatch {
            kind: kind.clone(),
            expected,
            found: type_name::<T>(),
        })
}

fn key_of<T: Resource>(object: &T) -> (String, String) {
    let meta = object.meta();
    (meta.namespace.clone(), meta.name.clone())
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates or updates `object` and notifies watchers.
    pub fn apply<T: Resource>(&self, object: T) -> Result<()> {
        let kind = object.kind();
        let mut slots = self.slots.lock();
        let bucket = bucket_mut::<T>(&mut slots, &kind)?;
        let previous = bucket.objects.insert(key_of(&object), object.clone());
        let event = if previous.is_some() {
            WatchEvent::Updated(object)
        } else {
            WatchEvent::Created(object)
        };
        bucket.broadcast(event);
        Ok(())
    }

    /// Removes the object with `id`, notifying watchers. Returns the removed
    /// object, if any.
    pub fn delete<T: Resource>(&self, id: &ObjectId) -> Result<Option<T>> {
        let mut slots = self.slots.lock();
        let bucket = bucket_mut::<T>(&mut slots, id.kind())?;
        let removed = bucket
            .objects
            .remove(&(id.namespace().to_string(), id.name().to_string()));
        if let Some(object) = &removed {
            bucket.broadcast(WatchEvent::Deleted(object.clone()));
        }
        Ok(removed)
    }

    /// Current state of the object with `id`.
    pub fn get<T: Resource>(&self, id: &ObjectId) -> Result<Option<T>> {
        let mut slots = self.slots.lock();
        let bucket = bucket_mut::<T>(&mut slots, id.kind())?;
        Ok(bucket
            .objects
            .get(&(id.namespace().to_string(), id.name().to_string()))
            .cloned())
    }

    /// Makes the next `count` list calls for `kind` fail.
    pub fn fail_next_lists(&self, kind: &Kind, count: u32) {
        self.list_failures.lock().insert(kind.clone(), count);
    }

    /// Drops every open watch on `kind`, ending the subscribers' streams.
    pub fn disconnect_watchers<T: Resource>(&self, kind: &Kind) -> Result<usize> {
        let mut slots = self.slots.lock();
        let bucket = bucket_mut::<T>(&mut slots, kind)?;
        let dropped = bucket.watchers.len();
        bucket.watchers.clear();
        debug!(kind = %kind, dropped, "store.memory.disconnect");
        Ok(dropped)
    }

    /// Number of open watches on `kind`.
    pub fn watcher_count<T: Resource>(&self, kind: &Kind) -> Result<usize> {
        let mut slots = self.slots.lock();
        Ok(bucket_mut::<T>(&mut slots, kind)?.watchers.len())
    }

    fn take_injected_failure(&self, kind: &Kind) -> bool {
        let mut failures = self.list_failures.lock();
        match failures.get_mut(kind) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

impl ObjectStore for MemoryStore {
    fn list<T: Resource>(&self, kind: &Kind) -> Result<Vec<T>> {
        if self.take_injected_failure(kind) {
            return Err(CacheError::Store(format!("injected list failure for {kind}")));
        }
        let mut slots = self.slots.lock();
        let bucket = bucket_mut::<T>(&mut slots, kind)?;
        Ok(bucket.objects.values().cloned().collect())
    }

    fn watch<T: Resource>(&self, kind: &Kind) -> Result<Watch<T>> {
        let mut slots = self.slots.lock();
        let bucket = bucket_mut::<T>(&mut slots, kind)?;
        let (tx, rx) = mpsc::channel();
        bucket.watchers.push(tx);
        Ok(rx)
    }

    fn create<T: Resource>(&self, object: &T) -> Result<()> {
        let kind = object.kind();
        let mut slots = self.slots.lock();
        let bucket = bucket_mut::<T>(&mut slots, &kind)?;
        let key = key_of(object);
        if bucket.objects.contains_key(&key) {
            return Err(CacheError::AlreadyExists(object.object_id()));
        }
        bucket.objects.insert(key, object.clone());
        bucket.broadcast(WatchEvent::Created(object.clone()));
        Ok(())
    }
}
