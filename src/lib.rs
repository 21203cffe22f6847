//! In-process relationship cache.
//!
//! Keeps a bidirectional index of typed edges between objects held in an
//! external store, answers "what does this use" and "who uses this" without
//! rescanning, and wakes reconcilers whenever the edges around an object
//! change.

#![warn(missing_docs)]

pub mod cache;
pub mod cli;
pub mod error;
pub mod primitives;
pub mod storage;
pub mod store;
pub mod types;

pub use cache::{
    Check, Extractor, HealthCheck, HealthStatus, PopulationState, ReconcileQueue,
    ReconcileRequest, RelationCache, WorkQueue,
};
pub use error::{CacheError, Result};
pub use storage::{CacheOptions, EdgeDelta, EdgeIndex, RetryPolicy};
pub use store::{DynamicObject, MemoryStore, ObjectMeta, ObjectStore, Resource, WatchEvent};
pub use types::{Edge, Kind, ObjectId, ObjectIdSet, Relation, UsageInfo};
