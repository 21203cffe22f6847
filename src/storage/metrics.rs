use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Trait for tracking relationship-cache activity.
///
/// Implementations collect statistics about index mutations, lookups and the
/// trigger fan-out. This information can be used for monitoring and to spot
/// reconcilers that are being woken far more often than expected.
pub trait CacheMetrics: Send + Sync {
    /// Records one `replace` against the index.
    fn object_replaced(&self);

    /// Records one object deletion.
    fn object_deleted(&self);

    /// Records edges inserted into the index.
    fn edges_added(&self, count: u64);

    /// Records edges removed from the index.
    fn edges_removed(&self, count: u64);

    /// Records a read query.
    ///
    /// # Parameters
    /// * `side` - `"forward"` for used-object lookups, `"reverse"` for user lookups.
    fn lookup(&self, side: &'static str);

    /// Records a reconcile request handed to a queue.
    fn trigger_enqueued(&self);

    /// Records a reconcile request a full queue refused.
    fn trigger_dropped(&self);

    /// Records a failed list or watch attempt that will be retried.
    fn population_retry(&self);
}

/// A no-op implementation of [`CacheMetrics`] that discards all recorded metrics.
#[derive(Default)]
pub struct NoopMetrics;

impl CacheMetrics for NoopMetrics {
    fn object_replaced(&self) {}
    fn object_deleted(&self) {}
    fn edges_added(&self, _count: u64) {}
    fn edges_removed(&self, _count: u64) {}
    fn lookup(&self, _side: &'static str) {}
    fn trigger_enqueued(&self) {}
    fn trigger_dropped(&self) {}
    fn population_retry(&self) {}
}

/// A thread-safe counter-based implementation of [`CacheMetrics`].
///
/// All counters are atomics and can be read from any thread while the cache
/// is running.
#[derive(Default)]
pub struct CounterMetrics {
    /// Number of replace operations.
    pub objects_replaced: AtomicU64,

    /// Number of delete operations.
    pub objects_deleted: AtomicU64,

    /// Number of edges inserted.
    pub edges_added: AtomicU64,

    /// Number of edges removed.
    pub edges_removed: AtomicU64,

    /// Number of forward-side lookups.
    pub lookups_forward: AtomicU64,

    /// Number of reverse-side lookups.
    pub lookups_reverse: AtomicU64,

    /// Number of reconcile requests delivered to queues.
    pub triggers_enqueued: AtomicU64,

    /// Number of reconcile requests refused by full queues.
    pub triggers_dropped: AtomicU64,

    /// Number of retried list/watch attempts.
    pub population_retries: AtomicU64,
}

/// Plain-value copy of [`CounterMetrics`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Number of replace operations.
    pub objects_replaced: u64,
    /// Number of delete operations.
    pub objects_deleted: u64,
    /// Number of edges inserted.
    pub edges_added: u64,
    /// Number of edges removed.
    pub edges_removed: u64,
    /// Number of forward-side lookups.
    pub lookups_forward: u64,
    /// Number of reverse-side lookups.
    pub lookups_reverse: u64,
    /// Number of reconcile requests delivered.
    pub triggers_enqueued: u64,
    /// Number of reconcile requests dropped.
    pub triggers_dropped: u64,
    /// Number of retried list/watch attempts.
    pub population_retries: u64,
}

impl CounterMetrics {
    /// Reads every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            objects_replaced: self.objects_replaced.load(Ordering::Relaxed),
            objects_deleted: self.objects_deleted.load(Ordering::Relaxed),
            edges_added: self.edges_added.load(Ordering::Relaxed),
            edges_removed: self.edges_removed.load(Ordering::Relaxed),
            lookups_forward: self.lookups_forward.load(Ordering::Relaxed),
            lookups_reverse: self.lookups_reverse.load(Ordering::Relaxed),
            triggers_enqueued: self.triggers_enqueued.load(Ordering::Relaxed),
            triggers_dropped: self.triggers_dropped.load(Ordering::Relaxed),
            population_retries: self.population_retries.load(Ordering::Relaxed),
        }
    }
}

impl CacheMetrics for CounterMetrics {
    fn object_replaced(&self) {
        self.objects_replaced.fetch_add(1, Ordering::Relaxed);
    }

    fn object_deleted(&self) {
        self.objects_deleted.fetch_add(1, Ordering::Relaxed);
    }

    fn edges_added(&self, count: u64) {
        self.edges_added.fetch_add(count, Ordering::Relaxed);
    }

    fn edges_removed(&self, count: u64) {
        self.edges_removed.fetch_add(count, Ordering::Relaxed);
    }

    fn lookup(&self, side: &'static str) {
        match side {
            "forward" => {
                self.lookups_forward.fetch_add(1, Ordering::Relaxed);
            }
            "reverse" => {
                self.lookups_reverse.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    fn trigger_enqueued(&self) {
        self.triggers_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    fn trigger_dropped(&self) {
        self.triggers_dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn population_retry(&self) {
        self.population_retries.fetch_add(1, Ordering::Relaxed);
    }
}

/// Returns the default metrics implementation wrapped in an [`Arc`].
///
/// The default implementation is [`NoopMetrics`], which discards everything.
pub fn default_metrics() -> Arc<dyn CacheMetrics> {
    Arc::new(NoopMetrics)
}
