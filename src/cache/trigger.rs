use std::collections::VecDeque;
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use tracing::{debug, trace};

use crate::storage::CacheMetrics;
use crate::types::{Kind, ObjectId, ObjectIdSet};

/// Identity-only wake-up handed to a reconciler.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ReconcileRequest {
    /// Namespace of the object to reconcile, empty when cluster-scoped.
    pub namespace: String,
    /// Name of the object to reconcile.
    pub name: String,
}

impl ReconcileRequest {
    /// Creates a request for `namespace/name`.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl From<&ObjectId> for ReconcileRequest {
    fn from(id: &ObjectId) -> Self {
        Self::new(id.namespace(), id.name())
    }
}

/// Downstream work queue of a reconciler.
///
/// Implementations must not block; the cache calls `enqueue` from population
/// workers and from mutation paths.
pub trait ReconcileQueue: Send + Sync {
    /// Offers `request`. Returns false when the queue refused it.
    fn enqueue(&self, request: ReconcileRequest) -> bool;
}

impl ReconcileQueue for SyncSender<ReconcileRequest> {
    fn enqueue(&self, request: ReconcileRequest) -> bool {
        self.try_send(request).is_ok()
    }
}

/// Reconcile queues registered per kind.
pub(crate) struct TriggerRegistry {
    queues: RwLock<FxHashMap<Kind, Vec<Arc<dyn ReconcileQueue>>>>,
    metrics: Arc<dyn CacheMetrics>,
}

impl TriggerRegistry {
    pub(crate) fn new(metrics: Arc<dyn CacheMetrics>) -> Self {
        Self {
            queues: RwLock::new(FxHashMap::default()),
            metrics,
        }
    }

    pub(crate) fn register(&self, kind: Kind, queue: Arc<dyn ReconcileQueue>) {
        let mut queues = self.queues.write();
        let list = queues.entry(kind.clone()).or_default();
        list.push(queue);
        debug!(kind = %kind, queues = list.len(), "cache.trigger.register");
    }

    /// Enqueues `id` on every queue registered for its kind and returns how
    /// many accepted it.
    pub(crate) fn trigger(&self, id: &ObjectId) -> usize {
        let targets: Vec<Arc<dyn ReconcileQueue>> = match self.queues.read().get(id.kind()) {
            Some(list) => list.clone(),
            None => return 0,
        };
        let request = ReconcileRequest::from(id);
        let mut accepted = 0;
        for queue in targets {
            if queue.enqueue(request.clone()) {
                accepted += 1;
                self.metrics.trigger_enqueued();
            } else {
                self.metrics.trigger_dropped();
                debug!(id = %id, "cache.trigger.dropped");
            }
        }
        trace!(id = %id, accepted, "cache.trigger");
        accepted
    }

    pub(crate) fn trigger_all(&self, ids: &ObjectIdSet) -> usize {
        ids.iter().map(|id| self.trigger(id)).sum()
    }
}

#[derive(Default)]
struct WorkState {
    queue: VecDeque<ReconcileRequest>,
    dirty: FxHashSet<ReconcileRequest>,
    processing: FxHashSet<ReconcileRequest>,
}

/// Deduplicating FIFO of reconcile requests.
///
/// A request already waiting is coalesced. A request that arrives while the
/// same key is being processed is parked until [`WorkQueue::done`] and then
/// queued once.
#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<WorkState>,
    ready: Condvar,
}

impl WorkQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the next request, waiting up to `timeout` for one to arrive.
    ///
    /// The returned key counts as processing until passed to `done`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<ReconcileRequest> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(request) = state.queue.pop_front() {
                state.dirty.remove(&request);
                state.processing.insert(request.clone());
                return Some(request);
            }
            if self.ready.wait_until(&mut state, deadline).timed_out() {
                return None;
            }
        }
    }

    /// Takes the next request without waiting.
    pub fn try_pop(&self) -> Option<ReconcileRequest> {
        self.pop_timeout(Duration::ZERO)
    }

    /// Marks `request` as processed, re-queuing it if it was triggered again
    /// meanwhile.
    pub fn done(&self, request: &ReconcileRequest) {
        let mut state = self.state.lock();
        state.processing.remove(request);
        if state.dirty.contains(request) {
            state.queue.push_back(request.clone());
            self.ready.notify_one();
        }
    }

    /// Number of requests waiting to be popped.
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Returns true when nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the waiting requests in queue order.
    pub fn pending(&self) -> Vec<ReconcileRequest> {
        self.state.lock().queue.iter().cloned().collect()
    }
}

impl ReconcileQueue for WorkQueue {
    fn enqueue(&self, request: ReconcileRequest) -> bool {
        let mut state = self.state.lock();
        if !state.dirty.insert(request.clone()) {
            return true;
        }
        if state.processing.contains(&request) {
            return true;
        }
        state.queue.push_back(request);
        self.ready.notify_one();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{CounterMetrics, NoopMetrics};
    use std::sync::mpsc;
    use std::thread;

    const POD: Kind = Kind::from_static("Pod");

    fn req(name: &str) -> ReconcileRequest {
        ReconcileRequest::new("ns", name)
    }

    #[test]
    fn work_queue_coalesces_pending_keys() {
        let queue = WorkQueue::new();
        assert!(queue.enqueue(req("a")));
        assert!(queue.enqueue(req("b")));
        assert!(queue.enqueue(req("a")));
        assert_eq!(queue.pending(), vec![req("a"), req("b")]);
    }

    #[test]
    fn key_triggered_while_processing_is_requeued_on_done() {
        let queue = WorkQueue::new();
        queue.enqueue(req("a"));
        let popped = queue.try_pop().expect("queued");
        queue.enqueue(req("a"));
        assert!(queue.is_empty());
        queue.done(&popped);
        assert_eq!(queue.try_pop(), Some(req("a")));
        queue.done(&req("a"));
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn pop_timeout_wakes_on_enqueue() {
        let queue = Arc::new(WorkQueue::new());
        let producer = Arc::clone(&queue);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.enqueue(req("late"));
        });
        assert_eq!(queue.pop_timeout(Duration::from_secs(5)), Some(req("late")));
        handle.join().unwrap();
        assert!(queue.pop_timeout(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn trigger_reaches_only_registered_kind() {
        let registry = TriggerRegistry::new(Arc::new(NoopMetrics));
        let queue = Arc::new(WorkQueue::new());
        registry.register(POD, queue.clone());
        let pod: ObjectId = "Pod/ns/web".parse().unwrap();
        let node: ObjectId = "Node//n1".parse().unwrap();
        assert_eq!(registry.trigger(&pod), 1);
        assert_eq!(registry.trigger(&node), 0);
        assert_eq!(queue.pending(), vec![req("web")]);
    }

    #[test]
    fn full_channel_drops_and_counts() {
        let metrics = Arc::new(CounterMetrics::default());
        let registry = TriggerRegistry::new(metrics.clone());
        let (tx, rx) = mpsc::sync_channel(1);
        registry.register(POD, Arc::new(tx));
        let ids: ObjectIdSet = ["Pod/ns/a", "Pod/ns/b"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        assert_eq!(registry.trigger_all(&ids), 1);
        assert!(rx.try_recv().is_ok());
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.triggers_enqueued, 1);
        assert_eq!(snapshot.triggers_dropped, 1);
    }
}
