use std::io;

use thiserror::Error;

use crate::types::{Kind, ObjectId};

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors raised by the relationship cache and its collaborators.
///
/// Mutations and reads against the edge index never fail for well-formed input;
/// these variants cover wiring bugs, store failures and bootstrap problems.
#[derive(Debug, Error)]
pub enum CacheError {
    /// An object id string did not have the `Kind/namespace/name` shape.
    #[error("invalid object id: {0}")]
    InvalidObjectId(String),
    /// A kind tag was empty or contained a `/`.
    #[error("invalid kind: {0:?}")]
    InvalidKind(String),
    /// A kind was used with two different Rust object types.
    #[error("kind {kind} is registered for {expected}, not {found}")]
    KindTypeMismatch {
        /// Offending kind.
        kind: Kind,
        /// Type the kind was first registered with.
        expected: &'static str,
        /// Type used by the failing call.
        found: &'static str,
    },
    /// The readiness gate was released more often than it was entered.
    #[error("readiness gate released more times than it was entered")]
    GateUnderflow,
    /// The object store reported a failure.
    #[error("object store: {0}")]
    Store(String),
    /// An object with the same id already exists in the store.
    #[error("{0} already exists")]
    AlreadyExists(ObjectId),
    /// A population unit gave up after exhausting its retry budget.
    #[error("population of {kind} failed: {reason}")]
    PopulationFailed {
        /// Kind whose initial listing never succeeded.
        kind: Kind,
        /// Last error observed.
        reason: String,
    },
    /// The cache did not become ready within the allotted time.
    #[error("cache not ready")]
    NotReady,
    /// The cache was shut down while the operation was in progress.
    #[error("cache shut down")]
    Cancelled,
    /// I/O failure while reading snapshots or configuration.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Snapshot decoding failed.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    /// Configuration decoding failed.
    #[error("toml: {0}")]
    Toml(#[from] toml::de::Error),
}

impl CacheError {
    /// Returns true for failures that are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, CacheError::Store(_) | CacheError::Io(_))
    }
}
