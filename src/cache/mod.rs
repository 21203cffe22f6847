//! The relationship cache handle.
//!
//! [`RelationCache`] ties the edge index to an [`ObjectStore`]: extractors
//! registered per kind turn objects into edges, one population worker per
//! kind keeps the index in step with the store, and every change wakes the
//! reconcilers registered for the affected kinds.

mod extractor;
mod health;
mod population;
mod trigger;

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::{CacheError, Result};
use crate::primitives::concurrency::{CancelToken, GateSnapshot, ReadinessGate};
use crate::storage::{default_metrics, CacheMetrics, CacheOptions, EdgeDelta, EdgeIndex};
use crate::store::{ObjectStore, Resource};
use crate::types::{Kind, ObjectId, ObjectIdSet, Relation, UsageInfo};

use extractor::ExtractorRegistry;
use health::PopulationTracker;
use trigger::TriggerRegistry;

pub use extractor::Extractor;
pub use health::{Check, HealthCheck, HealthStatus, PopulationState};
pub use trigger::{ReconcileQueue, ReconcileRequest, WorkQueue};

struct Shared<S: ObjectStore> {
    store: Arc<S>,
    index: EdgeIndex,
    extractors: ExtractorRegistry,
    gate: ReadinessGate,
    triggers: TriggerRegistry,
    population: PopulationTracker,
    cancel: CancelToken,
    options: CacheOptions,
    metrics: Arc<dyn CacheMetrics>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    // Held across a registration so no caller returns before the first
    // registrant of a kind has taken its readiness ticket.
    registration: Mutex<()>,
}

/// Shared handle to one relationship cache.
///
/// Cloning is cheap; every clone sees the same index. Background workers keep
/// the cache alive until [`RelationCache::shutdown`] is called.
pub struct RelationCache<S: ObjectStore> {
    shared: Arc<Shared<S>>,
}

impl<S: ObjectStore> Clone for RelationCache<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: ObjectStore> RelationCache<S> {
    /// Creates an empty cache over `store`. Nothing is listed until the first
    /// extractor is registered.
    pub fn new(store: Arc<S>, options: CacheOptions) -> Self {
        let metrics = options.metrics.clone().unwrap_or_else(default_metrics);
        Self {
            shared: Arc::new(Shared {
                store,
                index: EdgeIndex::with_metrics(Arc::clone(&metrics)),
                extractors: ExtractorRegistry::default(),
                gate: ReadinessGate::new(),
                triggers: TriggerRegistry::new(Arc::clone(&metrics)),
                population: PopulationTracker::default(),
                cancel: CancelToken::new(),
                options,
                metrics,
                workers: Mutex::new(Vec::new()),
                registration: Mutex::new(()),
            }),
        }
    }

    /// Registers `extract` as the source of `relation` edges from `source`
    /// objects to `target` objects.
    ///
    /// The first registration for `source` starts its population worker and
    /// holds the readiness gate until the initial listing is indexed.
    pub fn register_extractor<T, F>(
        &self,
        source: Kind,
        relation: Relation,
        target: Kind,
        extract: F,
    ) -> Result<()>
    where
        T: Resource,
        F: Fn(&T) -> ObjectIdSet + Send + Sync + 'static,
    {
        let extract: Extractor<T> = Arc::new(extract);
        self.register_extractors(source, [(relation, target, extract)])
    }

    /// Registers several rules for `source` before its worker starts, so the
    /// initial listing already sees all of them.
    pub fn register_extractors<T, I>(&self, source: Kind, rules: I) -> Result<()>
    where
        T: Resource,
        I: IntoIterator<Item = (Relation, Kind, Extractor<T>)>,
    {
        let _registration = self.shared.registration.lock();
        if self.shared.cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        self.shared.extractors.check_type::<T>(&source)?;
        let rules: Vec<(Relation, Kind, Extractor<T>)> = rules.into_iter().collect();
        if rules.is_empty() {
            return Ok(());
        }
        let fresh = !self.shared.extractors.contains(&source);
        // Take the ticket before the first rule becomes visible to readers.
        let ticket = fresh.then(|| {
            self.shared.population.register(&source);
            self.shared.gate.enter()
        });
        for (relation, target, extract) in rules {
            self.shared
                .extractors
                .register(&source, relation, target, extract)?;
        }
        let Some(ticket) = ticket else {
            return Ok(());
        };

        match population::spawn::<S, T>(Arc::clone(&self.shared), source.clone(), ticket) {
            Ok(handle) => {
                self.shared.workers.lock().push(handle);
                info!(kind = %source, "cache.population.start");
                Ok(())
            }
            Err(err) => {
                self.shared
                    .population
                    .set_state(&source, PopulationState::Failed(err.to_string()));
                Err(err.into())
            }
        }
    }

    /// Re-extracts the edges of `object` and replaces its outgoing edges.
    ///
    /// Returns the object's id and its users after the update.
    pub fn replace_object<T: Resource>(&self, object: &T) -> Result<(ObjectId, ObjectIdSet)> {
        let id = object.object_id();
        let usage = self.shared.extractors.extract(&object.kind(), object)?;
        let (_, users) = self.shared.index.replace_and_collect_users(&id, &[], &usage);
        Ok((id, users))
    }

    /// See [`EdgeIndex::replace_object_usage_info`].
    pub fn replace_object_usage_info(&self, id: &ObjectId, usage: &UsageInfo) -> EdgeDelta {
        self.shared.index.replace_object_usage_info(id, usage)
    }

    /// See [`EdgeIndex::replace_object_usage_info_for_kinds`].
    pub fn replace_object_usage_info_for_kinds(
        &self,
        id: &ObjectId,
        scope: &[Kind],
        usage: &UsageInfo,
    ) -> EdgeDelta {
        self.shared
            .index
            .replace_object_usage_info_for_kinds(id, scope, usage)
    }

    /// See [`EdgeIndex::delete_object`].
    pub fn delete_object(&self, id: &ObjectId) -> ObjectIdSet {
        self.shared.index.delete_object(id)
    }

    /// Read access to the edge index.
    pub fn index(&self) -> &EdgeIndex {
        &self.shared.index
    }

    /// The store this cache is populated from.
    pub fn store(&self) -> &Arc<S> {
        &self.shared.store
    }

    /// Creates `child` in the store as a serf of `owner` and indexes it.
    ///
    /// The owner reference is added when missing. No index lock is held while
    /// the store call runs.
    pub fn create_serf<T: Resource>(
        &self,
        owner: &ObjectId,
        mut child: T,
    ) -> Result<(ObjectId, ObjectIdSet)> {
        child.meta_mut().add_owner(owner.clone());
        self.shared.store.create(&child)?;
        let (id, users) = self.replace_object(&child)?;
        info!(owner = %owner, serf = %id, "cache.serf.create");
        Ok((id, users))
    }

    /// Blocks until every initial population unit has finished.
    pub fn wait(&self) {
        self.shared.gate.wait();
    }

    /// Like [`RelationCache::wait`] with an upper bound. Returns true when
    /// the gate let the caller through.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.shared.gate.wait_timeout(timeout)
    }

    /// Waits for readiness and reports why the cache is unusable, if it is.
    pub fn wait_ready(&self, timeout: Duration) -> Result<()> {
        if !self.shared.gate.wait_timeout(timeout) {
            return Err(CacheError::NotReady);
        }
        if let Some((kind, reason)) = self.shared.population.first_failure() {
            return Err(CacheError::PopulationFailed { kind, reason });
        }
        if self.shared.cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        Ok(())
    }

    /// Current readiness gate state.
    pub fn readiness(&self) -> GateSnapshot {
        self.shared.gate.snapshot()
    }

    /// Population state of `kind`, if a worker was ever started for it.
    pub fn population_state(&self, kind: &Kind) -> Option<PopulationState> {
        self.shared.population.state(kind)
    }

    /// Kinds with registered extractors.
    pub fn registered_kinds(&self) -> Vec<Kind> {
        self.shared.extractors.kinds()
    }

    /// `(relation, target kind)` pairs registered for `source`.
    pub fn registered_shapes(&self, source: &Kind) -> Vec<(Relation, Kind)> {
        self.shared.extractors.shapes(source)
    }

    /// Wakes `queue` whenever an object of `kind` is affected by an edge
    /// change.
    pub fn register_controller_for(&self, kind: Kind, queue: Arc<dyn ReconcileQueue>) {
        self.shared.triggers.register(kind, queue);
    }

    /// Enqueues `id` on every queue registered for its kind. Returns how many
    /// queues accepted it.
    pub fn trigger(&self, id: &ObjectId) -> usize {
        self.shared.triggers.trigger(id)
    }

    /// [`RelationCache::trigger`] for every id in `ids`.
    pub fn trigger_all(&self, ids: &ObjectIdSet) -> usize {
        self.shared.triggers.trigger_all(ids)
    }

    /// Population and index health.
    pub fn health(&self) -> HealthCheck {
        let mut report = HealthCheck::new();
        for check in self.shared.population.checks() {
            report.add_check(check);
        }
        let asymmetric_edges = self.shared.index.verify().asymmetric.len();
        report.add_check(Check::Index {
            asymmetric_edges,
            healthy: asymmetric_edges == 0,
        });
        report
    }

    /// Stops every population worker and waits for them to exit.
    pub fn shutdown(&self) {
        self.shared.cancel.cancel();
        let workers: Vec<JoinHandle<()>> = self.shared.workers.lock().drain(..).collect();
        let count = workers.len();
        for handle in workers {
            if handle.join().is_err() {
                warn!("cache.shutdown.worker_panicked");
            }
        }
        info!(workers = count, "cache.shutdown");
    }
}
