use std::collections::BTreeMap;
use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::Kind;

/// Overall verdict of a [`HealthCheck`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// Every check passed.
    Healthy,
    /// Some population is still listing.
    Degraded,
    /// A population failed or the index is inconsistent.
    Unhealthy,
}

/// Lifecycle of one population unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum PopulationState {
    /// Registered, worker not started yet.
    Pending,
    /// Initial listing (or a resync) in progress.
    Listing,
    /// Initial listing done, following the watch.
    Ready,
    /// Gave up: retries exhausted, a permanent error, or a panicking
    /// extractor.
    Failed(String),
    /// Stopped by shutdown.
    Cancelled,
}

impl fmt::Display for PopulationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PopulationState::Pending => f.write_str("pending"),
            PopulationState::Listing => f.write_str("listing"),
            PopulationState::Ready => f.write_str("ready"),
            PopulationState::Failed(reason) => write!(f, "failed: {reason}"),
            PopulationState::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// One entry of a health report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Check {
    /// Progress of one kind's population worker.
    Population {
        /// Source kind being populated.
        kind: Kind,
        /// Current worker state.
        state: PopulationState,
        /// List attempts so far, including resyncs.
        attempts: u32,
        /// True once the kind is ready.
        healthy: bool,
    },
    /// Forward/reverse consistency of the edge index.
    Index {
        /// Edges present on one side only.
        asymmetric_edges: usize,
        /// True when no edge is asymmetric.
        healthy: bool,
    },
}

/// Aggregated health report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Worst status among the checks.
    pub status: HealthStatus,
    /// Individual checks in the order they were added.
    pub checks: Vec<Check>,
}

impl HealthCheck {
    /// Empty, healthy report.
    pub fn new() -> Self {
        Self {
            status: HealthStatus::Healthy,
            checks: Vec::new(),
        }
    }

    /// Adds `check`, lowering the status if it failed.
    pub fn add_check(&mut self, check: Check) {
        let is_healthy = match &check {
            Check::Population { healthy, .. } | Check::Index { healthy, .. } => *healthy,
        };

        if !is_healthy {
            self.status = match self.status {
                HealthStatus::Healthy => HealthStatus::Degraded,
                HealthStatus::Degraded => HealthStatus::Degraded,
                HealthStatus::Unhealthy => HealthStatus::Unhealthy,
            };

            let fatal = match &check {
                Check::Population { state, .. } => matches!(state, PopulationState::Failed(_)),
                Check::Index {
                    asymmetric_edges, ..
                } => *asymmetric_edges > 0,
            };
            if fatal {
                self.status = HealthStatus::Unhealthy;
            }
        }

        self.checks.push(check);
    }

    /// True when every check passed.
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
struct UnitHealth {
    state: PopulationState,
    attempts: u32,
}

/// Per-kind population progress shared between workers and the cache handle.
#[derive(Default)]
pub(crate) struct PopulationTracker {
    units: Mutex<BTreeMap<Kind, UnitHealth>>,
}

impl PopulationTracker {
    pub(crate) fn register(&self, kind: &Kind) {
        self.units.lock().insert(
            kind.clone(),
            UnitHealth {
                state: PopulationState::Pending,
                attempts: 0,
            },
        );
    }

    pub(crate) fn set_state(&self, kind: &Kind, state: PopulationState) {
        if let Some(unit) = self.units.lock().get_mut(kind) {
            unit.state = state;
        }
    }

    pub(crate) fn record_attempt(&self, kind: &Kind) -> u32 {
        let mut units = self.units.lock();
        match units.get_mut(kind) {
            Some(unit) => {
                unit.attempts += 1;
                unit.attempts
            }
            None => 0,
        }
    }

    pub(crate) fn state(&self, kind: &Kind) -> Option<PopulationState> {
        self.units.lock().get(kind).map(|unit| unit.state.clone())
    }

    /// First unit that gave up, with its reason.
    pub(crate) fn first_failure(&self) -> Option<(Kind, String)> {
        self.units
            .lock()
            .iter()
            .find_map(|(kind, unit)| match &unit.state {
                PopulationState::Failed(reason) => Some((kind.clone(), reason.clone())),
                _ => None,
            })
    }

    pub(crate) fn checks(&self) -> Vec<Check> {
        self.units
            .lock()
            .iter()
            .map(|(kind, unit)| Check::Population {
                kind: kind.clone(),
                state: unit.state.clone(),
                attempts: unit.attempts,
                healthy: unit.state == PopulationState::Ready,
            })
            .collect()
    }
}
