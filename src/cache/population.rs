use std::any::Any;
use std::io;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use rustc_hash::FxHashSet;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::primitives::concurrency::GateTicket;
use crate::store::{ObjectStore, Resource, Watch, WatchEvent};
use crate::types::{Kind, ObjectId};

use super::health::PopulationState;
use super::Shared;

enum Stop {
    Cancelled,
    Failed(String),
}

enum WatchEnd {
    Cancelled,
    Disconnected,
}

/// Starts the population worker for `kind`. The worker owns `ticket` and
/// releases it after the first successful listing, or when it stops.
pub(super) fn spawn<S: ObjectStore, T: Resource>(
    shared: Arc<Shared<S>>,
    kind: Kind,
    ticket: GateTicket,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("relcache-pop-{kind}"))
        .spawn(move || {
            // The ticket lives outside the unwind boundary so a panicking
            // extractor is recorded as a failure before the gate opens.
            let mut ticket = Some(ticket);
            let worker = Worker::<S, T> {
                shared: Arc::clone(&shared),
                kind: kind.clone(),
                known: FxHashSet::default(),
                _marker: PhantomData,
            };
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| worker.run(&mut ticket)));
            if let Err(payload) = outcome {
                let reason = format!("extractor panicked: {}", panic_message(payload.as_ref()));
                error!(kind = %kind, reason = %reason, "cache.population.panicked");
                shared
                    .population
                    .set_state(&kind, PopulationState::Failed(reason));
            }
            drop(ticket);
        })
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

struct Worker<S: ObjectStore, T> {
    shared: Arc<Shared<S>>,
    kind: Kind,
    // Ids of `kind` currently reflected in the index.
    known: FxHashSet<ObjectId>,
    _marker: PhantomData<fn() -> T>,
}

impl<S: ObjectStore, T: Resource> Worker<S, T> {
    fn run(mut self, ticket: &mut Option<GateTicket>) {
        loop {
            self.set_state(PopulationState::Listing);
            let watch = match self.establish() {
                Ok(watch) => watch,
                Err(Stop::Cancelled) => {
                    self.set_state(PopulationState::Cancelled);
                    debug!(kind = %self.kind, "cache.population.cancelled");
                    return;
                }
                Err(Stop::Failed(reason)) => {
                    error!(kind = %self.kind, reason = %reason, "cache.population.failed");
                    self.set_state(PopulationState::Failed(reason));
                    return;
                }
            };

            self.set_state(PopulationState::Ready);
            if let Some(ticket) = ticket.take() {
                if let Err(err) = ticket.complete() {
                    error!(kind = %self.kind, error = %err, "cache.population.ticket");
                }
                info!(kind = %self.kind, objects = self.known.len(), "cache.population.ready");
            }

            match self.follow(&watch) {
                WatchEnd::Cancelled => {
                    self.set_state(PopulationState::Cancelled);
                    debug!(kind = %self.kind, "cache.population.cancelled");
                    return;
                }
                WatchEnd::Disconnected => {
                    warn!(kind = %self.kind, "cache.population.watch_lost");
                }
            }
        }
    }

    fn set_state(&self, state: PopulationState) {
        self.shared.population.set_state(&self.kind, state);
    }

    /// Opens a watch and lists, retrying per the configured policy.
    fn establish(&mut self) -> std::result::Result<Watch<T>, Stop> {
        let retry = self.shared.options.retry.clone();
        let mut failures = 0u32;
        let mut reuse = None;
        loop {
            if self.shared.cancel.is_cancelled() {
                return Err(Stop::Cancelled);
            }
            let attempt = self.shared.population.record_attempt(&self.kind);
            let err = match self.sync(&mut reuse) {
                Ok(watch) => return Ok(watch),
                Err(err) => err,
            };
            failures += 1;
            if !err.is_transient() || !retry.allows(failures) {
                return Err(Stop::Failed(err.to_string()));
            }
            self.shared.metrics.population_retry();
            let delay = retry.backoff(failures);
            warn!(
                kind = %self.kind,
                attempt,
                error = %err,
                delay_ms = delay.as_millis() as u64,
                "cache.population.retry"
            );
            if self.shared.cancel.sleep(delay) {
                return Err(Stop::Cancelled);
            }
        }
    }

    /// One watch-then-list round. A watch opened by an earlier failed round
    /// is reused; its buffered events replay in order after the listing.
    fn sync(&mut self, reuse: &mut Option<Watch<T>>) -> Result<Watch<T>> {
        let watch = match reuse.take() {
            Some(watch) => watch,
            None => self.shared.store.watch::<T>(&self.kind)?,
        };
        match self.relist() {
            Ok(()) => Ok(watch),
            Err(err) => {
                *reuse = Some(watch);
                Err(err)
            }
        }
    }

    /// Indexes every listed object and drops the ones missing from the
    /// listing.
    fn relist(&mut self) -> Result<()> {
        let objects = self.shared.store.list::<T>(&self.kind)?;
        let mut seen = FxHashSet::default();
        for object in &objects {
            seen.insert(self.apply(object)?);
        }
        let stale: Vec<ObjectId> = self.known.difference(&seen).cloned().collect();
        for id in &stale {
            self.remove(id);
        }
        self.known = seen;
        info!(
            kind = %self.kind,
            objects = objects.len(),
            stale = stale.len(),
            "cache.population.listed"
        );
        Ok(())
    }

    fn follow(&mut self, watch: &Watch<T>) -> WatchEnd {
        let poll = self.shared.options.watch_poll_interval;
        loop {
            if self.shared.cancel.is_cancelled() {
                return WatchEnd::Cancelled;
            }
            match watch.recv_timeout(poll) {
                Ok(WatchEvent::Created(object) | WatchEvent::Updated(object)) => {
                    match self.apply(&object) {
                        Ok(id) => {
                            self.known.insert(id);
                        }
                        Err(err) => {
                            warn!(kind = %self.kind, error = %err, "cache.population.apply_failed");
                        }
                    }
                }
                Ok(WatchEvent::Deleted(object)) => {
                    let id = object.object_id();
                    self.known.remove(&id);
                    self.remove(&id);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return WatchEnd::Disconnected,
            }
        }
    }

    /// Re-indexes `object` and wakes its users and every target whose users
    /// changed.
    fn apply(&self, object: &T) -> Result<ObjectId> {
        let id = object.object_id();
        let usage = self.shared.extractors.extract(&self.kind, object)?;
        let (delta, mut affected) = self.shared.index.replace_and_collect_users(&id, &[], &usage);
        affected.join(&delta.touched_targets());
        let notified = self.shared.triggers.trigger_all(&affected);
        debug!(id = %id, affected = affected.len(), notified, "cache.population.apply");
        Ok(id)
    }

    fn remove(&self, id: &ObjectId) {
        let users = self.shared.index.delete_object(id);
        let notified = self.shared.triggers.trigger_all(&users);
        debug!(id = %id, users = users.len(), notified, "cache.population.remove");
    }
}
