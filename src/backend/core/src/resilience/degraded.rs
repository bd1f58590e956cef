//! Process-wide degraded-mode flag with recovery hysteresis.
//!
//! The flag goes up the moment any observed breaker opens. It comes down only
//! after `recovery_successes` consecutive successful calls against
//! dependencies that were open, with none of them open any more.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use super::circuit_breaker::{BreakerObserver, CircuitState};
use crate::observability::{metrics, KeelEvent};

#[derive(Debug, Default)]
struct DegradedInner {
    open: BTreeSet<String>,
    recovering: BTreeSet<String>,
    consecutive_successes: u32,
    activated_at: Option<DateTime<Utc>>,
}

/// Shared degraded-mode controller.
#[derive(Debug)]
pub struct DegradedMode {
    active: AtomicBool,
    recovery_successes: u32,
    inner: Mutex<DegradedInner>,
    activations: AtomicU64,
}

impl DegradedMode {
    pub fn new(recovery_successes: u32) -> Self {
        Self {
            active: AtomicBool::new(false),
            recovery_successes: recovery_successes.max(1),
            inner: Mutex::new(DegradedInner::default()),
            activations: AtomicU64::new(0),
        }
    }

    /// Whether writes must be deferred to the event store.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// A monitored dependency's breaker opened.
    pub fn breaker_opened(&self, dependency: &str) {
        let newly_active = {
            let mut inner = self.inner.lock();
            inner.open.insert(dependency.to_string());
            inner.recovering.insert(dependency.to_string());
            inner.consecutive_successes = 0;

            let newly_active = !self.active.swap(true, Ordering::AcqRel);
            if newly_active {
                inner.activated_at = Some(Utc::now());
            }
            newly_active
        };

        if newly_active {
            self.activations.fetch_add(1, Ordering::Relaxed);
            metrics::set_degraded(true);
            KeelEvent::DegradedActivated {
                dependency: dependency.to_string(),
            }
            .log();
        }
    }

    /// A monitored dependency's breaker left the open state.
    pub fn breaker_recovered(&self, dependency: &str) {
        self.inner.lock().open.remove(dependency);
    }

    /// A call to `dependency` succeeded.
    pub fn record_success(&self, dependency: &str) {
        if !self.is_active() {
            return;
        }

        let cleared = {
            let mut inner = self.inner.lock();
            if !inner.open.is_empty() || !inner.recovering.contains(dependency) {
                return;
            }
            inner.consecutive_successes += 1;
            if inner.consecutive_successes >= self.recovery_successes {
                let successes = inner.consecutive_successes;
                inner.recovering.clear();
                inner.consecutive_successes = 0;
                inner.activated_at = None;
                self.active.store(false, Ordering::Release);
                Some(successes)
            } else {
                None
            }
        };

        if let Some(consecutive_successes) = cleared {
            metrics::set_degraded(false);
            KeelEvent::DegradedCleared { consecutive_successes }.log();
        }
    }

    /// A call to `dependency` failed; the streak restarts if it is recovering.
    pub fn record_failure(&self, dependency: &str) {
        if !self.is_active() {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.recovering.contains(dependency) {
            inner.consecutive_successes = 0;
        }
    }

    pub fn snapshot(&self) -> DegradedSnapshot {
        let inner = self.inner.lock();
        DegradedSnapshot {
            active: self.is_active(),
            consecutive_successes: inner.consecutive_successes,
            recovery_successes: self.recovery_successes,
            open_dependencies: inner.open.iter().cloned().collect(),
            recovering: inner.recovering.iter().cloned().collect(),
            activated_at: inner.activated_at,
            activations: self.activations.load(Ordering::Relaxed),
        }
    }
}

impl BreakerObserver for DegradedMode {
    fn on_transition(&self, dependency: &str, _from: CircuitState, to: CircuitState) {
        match to {
            CircuitState::Open => self.breaker_opened(dependency),
            CircuitState::HalfOpen | CircuitState::Closed => self.breaker_recovered(dependency),
        }
    }

    fn on_success(&self, dependency: &str) {
        self.record_success(dependency);
    }

    fn on_failure(&self, dependency: &str) {
        self.record_failure(dependency);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DegradedSnapshot {
    pub active: bool,
    pub consecutive_successes: u32,
    pub recovery_successes: u32,
    pub open_dependencies: Vec<String>,
    pub recovering: Vec<String>,
    pub activated_at: Option<DateTime<Utc>>,
    pub activations: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_immediately() {
        let degraded = DegradedMode::new(3);
        assert!(!degraded.is_active());

        degraded.breaker_opened("vector_store");
        assert!(degraded.is_active());
        assert_eq!(degraded.snapshot().activations, 1);
    }

    #[test]
    fn test_successes_while_open_do_not_count() {
        let degraded = DegradedMode::new(2);
        degraded.breaker_opened("vector_store");

        degraded.record_success("vector_store");
        degraded.record_success("vector_store");
        assert!(degraded.is_active());
        assert_eq!(degraded.snapshot().consecutive_successes, 0);
    }

    #[test]
    fn test_unrelated_dependency_ignored() {
        let degraded = DegradedMode::new(1);
        degraded.breaker_opened("vector_store");
        degraded.breaker_recovered("vector_store");

        degraded.record_success("belief_processor");
        assert!(degraded.is_active());

        degraded.record_success("vector_store");
        assert!(!degraded.is_active());
    }
}
