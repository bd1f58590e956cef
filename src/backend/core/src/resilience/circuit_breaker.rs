//! Circuit Breaker for failure containment.
//!
//! One breaker guards one downstream dependency. After `fails` consecutive
//! failures it opens and rejects calls without attempting them. Once the
//! reset window has elapsed it admits probe calls (`half_open`); a successful
//! probe closes it again, a failed one re-opens it with a fresh timer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::BreakerSettings;
use crate::error::{KeelError, Result};
use crate::observability::{metrics, KeelEvent};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - calls pass through
    Closed,
    /// Too many failures - calls rejected immediately
    Open,
    /// Reset window elapsed - probe calls admitted
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    fn gauge_level(&self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

/// Receives state transitions and call outcomes from breakers.
///
/// Callbacks run after the breaker has released its lock.
pub trait BreakerObserver: Send + Sync {
    fn on_transition(&self, dependency: &str, from: CircuitState, to: CircuitState);

    fn on_success(&self, _dependency: &str) {}

    fn on_failure(&self, _dependency: &str) {}
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Circuit breaker for a single dependency.
pub struct CircuitBreaker {
    dependency: String,
    settings: BreakerSettings,
    inner: Mutex<BreakerInner>,
    observer: Option<Arc<dyn BreakerObserver>>,

    total_successes: AtomicU64,
    total_failures: AtomicU64,
    total_rejections: AtomicU64,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("dependency", &self.dependency)
            .field("settings", &self.settings)
            .field("inner", &*self.inner.lock())
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(dependency: impl Into<String>, settings: BreakerSettings) -> Self {
        Self {
            dependency: dependency.into(),
            settings,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
            observer: None,
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
        }
    }

    /// Attach an observer notified of transitions and outcomes.
    pub fn with_observer(mut self, observer: Arc<dyn BreakerObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn dependency(&self) -> &str {
        &self.dependency
    }

    pub fn settings(&self) -> &BreakerSettings {
        &self.settings
    }

    /// Ask to make one call.
    ///
    /// Returns `CircuitOpen` when the call must not be attempted. The permit
    /// should be settled with `success` or `failure`; dropping it unsettled
    /// records nothing and frees the half-open probe slot.
    pub fn try_acquire(&self) -> Result<BreakerPermit<'_>> {
        let mut transition = None;
        let (admitted, probe) = {
            let mut inner = self.inner.lock();

            if inner.state == CircuitState::Open {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.settings.reset)
                    .unwrap_or(true);
                if elapsed {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = false;
                    transition = Some((CircuitState::Open, CircuitState::HalfOpen));
                }
            }

            match inner.state {
                CircuitState::Closed => (true, false),
                CircuitState::Open => (false, false),
                CircuitState::HalfOpen => {
                    if inner.probe_in_flight {
                        (false, false)
                    } else if self.settings.half_open_prob >= 1.0
                        || rand::random::<f64>() < self.settings.half_open_prob
                    {
                        inner.probe_in_flight = true;
                        (true, true)
                    } else {
                        (false, false)
                    }
                }
            }
        };

        if let Some((from, to)) = transition {
            self.announce(from, to, 0);
        }

        if admitted {
            Ok(BreakerPermit {
                breaker: self,
                probe,
                settled: false,
            })
        } else {
            self.total_rejections.fetch_add(1, Ordering::Relaxed);
            Err(KeelError::circuit_open(
                self.dependency.clone(),
                self.retry_after().as_secs().max(1),
            ))
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);

        let transition = {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::HalfOpen => {
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.opened_at = None;
                    inner.probe_in_flight = false;
                    Some((CircuitState::HalfOpen, CircuitState::Closed))
                }
                CircuitState::Closed => {
                    inner.consecutive_failures = 0;
                    None
                }
                // Late result from a call admitted before the breaker opened
                CircuitState::Open => None,
            }
        };

        if let Some((from, to)) = transition {
            self.announce(from, to, 0);
        }
        if let Some(observer) = &self.observer {
            observer.on_success(&self.dependency);
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);

        let transition = {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::HalfOpen => {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    inner.probe_in_flight = false;
                    Some((CircuitState::HalfOpen, CircuitState::Open, inner.consecutive_failures))
                }
                CircuitState::Closed => {
                    inner.consecutive_failures += 1;
                    if inner.consecutive_failures >= self.settings.fails {
                        inner.state = CircuitState::Open;
                        inner.opened_at = Some(Instant::now());
                        Some((CircuitState::Closed, CircuitState::Open, inner.consecutive_failures))
                    } else {
                        None
                    }
                }
                CircuitState::Open => None,
            }
        };

        if let Some(observer) = &self.observer {
            observer.on_failure(&self.dependency);
        }
        if let Some((from, to, failures)) = transition {
            self.announce(from, to, failures);
        }
    }

    /// Free the probe slot of an abandoned half-open call.
    fn release_probe(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.probe_in_flight = false;
        }
    }

    /// Current state. An open breaker whose window has elapsed still reports
    /// `Open` until the next call attempt moves it to `HalfOpen`.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Instant at which an open breaker starts admitting probes.
    pub fn reset_deadline(&self) -> Option<Instant> {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Open => inner.opened_at.map(|at| at + self.settings.reset),
            _ => None,
        }
    }

    /// Time left before probes are admitted; zero unless open.
    pub fn retry_after(&self) -> Duration {
        self.reset_deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }

    /// Force the breaker closed.
    pub fn reset(&self) {
        let from = {
            let mut inner = self.inner.lock();
            let from = inner.state;
            inner.state = CircuitState::Closed;
            inner.consecutive_failures = 0;
            inner.opened_at = None;
            inner.probe_in_flight = false;
            from
        };
        tracing::info!(dependency = %self.dependency, "Circuit breaker manually reset");
        if from != CircuitState::Closed {
            self.announce(from, CircuitState::Closed, 0);
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let (state, consecutive_failures) = {
            let inner = self.inner.lock();
            (inner.state, inner.consecutive_failures)
        };
        BreakerSnapshot {
            dependency: self.dependency.clone(),
            state,
            consecutive_failures,
            fails: self.settings.fails,
            reset_secs: self.settings.reset.as_secs_f64(),
            half_open_prob: self.settings.half_open_prob,
            retry_after_ms: self.retry_after().as_millis() as u64,
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
        }
    }

    fn announce(&self, from: CircuitState, to: CircuitState, failures: u32) {
        metrics::record_breaker_transition(&self.dependency, to.as_str(), to.gauge_level());

        let event = match to {
            CircuitState::Open => KeelEvent::BreakerOpened {
                dependency: self.dependency.clone(),
                consecutive_failures: failures,
            },
            CircuitState::HalfOpen => KeelEvent::BreakerHalfOpened {
                dependency: self.dependency.clone(),
            },
            CircuitState::Closed => KeelEvent::BreakerClosed {
                dependency: self.dependency.clone(),
            },
        };
        event.log();

        if let Some(observer) = &self.observer {
            observer.on_transition(&self.dependency, from, to);
        }
    }
}

/// One admitted call through a breaker.
#[must_use = "an unsettled permit records no outcome"]
#[derive(Debug)]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl BreakerPermit<'_> {
    /// Whether this call is the half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }

    /// Settle with `success` when `ok`, `failure` otherwise.
    pub fn settle(self, ok: bool) {
        if ok {
            self.success();
        } else {
            self.failure();
        }
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            tracing::debug!(
                dependency = %self.breaker.dependency,
                "Half-open probe abandoned, slot released"
            );
            self.breaker.release_probe();
        }
    }
}

/// Point-in-time view of a breaker, as exposed on `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub dependency: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub fails: u32,
    pub reset_secs: f64,
    pub half_open_prob: f64,
    pub retry_after_ms: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
}
