//! In-memory edge storage for the relationship cache.
//!
//! Holds the bidirectional edge index, the cycle walk over it, and the
//! metrics and options shared with the cache layer.

mod cycle;
mod index;
mod metrics;
mod options;

/// Bidirectional edge index and its reports.
pub use index::{EdgeDelta, EdgeIndex, IndexStats, IntegrityReport};

/// Metrics sinks.
pub use metrics::{default_metrics, CacheMetrics, CounterMetrics, MetricsSnapshot, NoopMetrics};

/// Cache configuration options.
pub use options::{CacheOptions, RetryPolicy};
