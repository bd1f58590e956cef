//! Claim worker: leases due events, runs their handlers and records the outcome.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::backoff::RetryPolicy;
use super::handler::{HandlerError, HandlerRegistry, HandlerResult, Registration};
use crate::config::DispatcherConfig;
use crate::error::{ErrorCode, Result};
use crate::observability::{metrics, KeelEvent};
use crate::outbox::{visible_after, ClaimToken, ClaimedEvent, Event, EventStore};
use crate::resilience::{BreakerPermit, BreakerRegistry};
use crate::saga::SagaRecorder;

/// Saga name used for the lifecycle of one event.
pub fn event_saga_name(kind: &str, seq: i64) -> String {
    format!("{}#{}", kind, seq)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Outcomes & Stats
// ═══════════════════════════════════════════════════════════════════════════════

/// What happened to one claimed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOutcome {
    Done,
    Retried,
    Dead,
    /// No handler for the kind; moved to `error`
    Parked,
    /// Breaker rejected the call; released without using an attempt
    Deferred,
    /// Another worker took the event over before the outcome was written
    LeaseLost,
}

impl DispatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Retried => "retried",
            Self::Dead => "dead",
            Self::Parked => "parked",
            Self::Deferred => "deferred",
            Self::LeaseLost => "lease_lost",
        }
    }
}

/// Summary of one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    pub claimed: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub dead: usize,
    pub parked: usize,
    pub deferred: usize,
    pub lost_leases: usize,
    /// Events whose outcome could not be written to the store
    pub store_errors: usize,
}

impl TickReport {
    fn record(&mut self, outcome: DispatchOutcome) {
        match outcome {
            DispatchOutcome::Done => self.succeeded += 1,
            DispatchOutcome::Retried => self.retried += 1,
            DispatchOutcome::Dead => self.dead += 1,
            DispatchOutcome::Parked => self.parked += 1,
            DispatchOutcome::Deferred => self.deferred += 1,
            DispatchOutcome::LeaseLost => self.lost_leases += 1,
        }
    }

    pub fn merge(&mut self, other: TickReport) {
        self.claimed += other.claimed;
        self.succeeded += other.succeeded;
        self.retried += other.retried;
        self.dead += other.dead;
        self.parked += other.parked;
        self.deferred += other.deferred;
        self.lost_leases += other.lost_leases;
        self.store_errors += other.store_errors;
    }
}

/// Running totals for a dispatcher.
#[derive(Debug, Clone, Default)]
pub struct DispatcherStats {
    pub processed: Arc<AtomicU64>,
    pub succeeded: Arc<AtomicU64>,
    pub retried: Arc<AtomicU64>,
    pub dead: Arc<AtomicU64>,
    pub parked: Arc<AtomicU64>,
    pub deferred_by_breaker: Arc<AtomicU64>,
    pub lost_leases: Arc<AtomicU64>,
    pub ticks: Arc<AtomicU64>,
    pub empty_ticks: Arc<AtomicU64>,
}

impl DispatcherStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, outcome: DispatchOutcome) {
        let counter = match outcome {
            DispatchOutcome::Done => &self.succeeded,
            DispatchOutcome::Retried => &self.retried,
            DispatchOutcome::Dead => &self.dead,
            DispatchOutcome::Parked => &self.parked,
            DispatchOutcome::Deferred => &self.deferred_by_breaker,
            DispatchOutcome::LeaseLost => &self.lost_leases,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DispatcherStatsSnapshot {
        DispatcherStatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead: self.dead.load(Ordering::Relaxed),
            parked: self.parked.load(Ordering::Relaxed),
            deferred_by_breaker: self.deferred_by_breaker.load(Ordering::Relaxed),
            lost_leases: self.lost_leases.load(Ordering::Relaxed),
            ticks: self.ticks.load(Ordering::Relaxed),
            empty_ticks: self.empty_ticks.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherStatsSnapshot {
    pub processed: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub dead: u64,
    pub parked: u64,
    pub deferred_by_breaker: u64,
    pub lost_leases: u64,
    pub ticks: u64,
    pub empty_ticks: u64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Dispatcher
// ═══════════════════════════════════════════════════════════════════════════════

/// Polls the event store and drives claimed events to an outcome.
///
/// Any number of dispatchers may share one store; the conditional claim is
/// the only coordination between them.
pub struct Dispatcher {
    store: Arc<dyn EventStore>,
    handlers: Arc<HandlerRegistry>,
    breakers: Arc<BreakerRegistry>,
    sagas: Option<Arc<SagaRecorder>>,
    policy: RetryPolicy,
    config: DispatcherConfig,
    worker_id: String,
    stats: DispatcherStats,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn EventStore>,
        handlers: Arc<HandlerRegistry>,
        breakers: Arc<BreakerRegistry>,
        config: &DispatcherConfig,
    ) -> Self {
        let worker_id = config
            .worker_id
            .clone()
            .unwrap_or_else(|| format!("keel-{}", &Uuid::new_v4().simple().to_string()[..8]));

        Self {
            store,
            handlers,
            breakers,
            sagas: None,
            policy: RetryPolicy::from(&config.retry),
            config: config.clone(),
            worker_id,
            stats: DispatcherStats::new(),
        }
    }

    /// Record each event's attempts on the saga log.
    pub fn with_saga_recorder(mut self, sagas: Arc<SagaRecorder>) -> Self {
        self.sagas = Some(sagas);
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn stats(&self) -> &DispatcherStats {
        &self.stats
    }

    /// Claim one batch and process it.
    ///
    /// Handler failures never surface here; only a store error while claiming
    /// does.
    pub async fn tick(&self) -> Result<TickReport> {
        self.stats.ticks.fetch_add(1, Ordering::Relaxed);

        let claimed = self
            .store
            .claim_batch(self.config.batch_size, &self.worker_id, self.config.visibility_timeout)
            .await?;

        let mut report = TickReport {
            claimed: claimed.len(),
            ..TickReport::default()
        };
        if claimed.is_empty() {
            self.stats.empty_ticks.fetch_add(1, Ordering::Relaxed);
            return Ok(report);
        }

        tracing::debug!(worker_id = %self.worker_id, claimed = claimed.len(), "Processing batch");

        let results = futures::future::join_all(claimed.into_iter().map(|lease| self.process(lease))).await;
        for result in results {
            match result {
                Ok(outcome) => {
                    self.stats.record(outcome);
                    report.record(outcome);
                }
                Err(error) => {
                    error.log();
                    report.store_errors += 1;
                }
            }
        }

        Ok(report)
    }

    async fn process(&self, lease: ClaimedEvent) -> Result<DispatchOutcome> {
        let ClaimedEvent { event, token } = lease;
        self.stats.processed.fetch_add(1, Ordering::Relaxed);

        let Some(registration) = self.handlers.get(&event.kind) else {
            let reason = format!("no handler registered for kind {}", event.kind);
            tracing::warn!(seq = event.seq, kind = %event.kind, "Parking event without handler");
            let applied = self.store.park(&token, &reason).await?;
            self.end_saga(&event, false, &reason);
            return Ok(self.settle(applied, DispatchOutcome::Parked, &token));
        };

        let breaker = registration
            .dependency
            .as_deref()
            .and_then(|dependency| self.breakers.get(dependency));

        let permit = match &breaker {
            Some(breaker) => match breaker.try_acquire() {
                Ok(permit) => Some(permit),
                Err(rejection) => {
                    let wait = breaker.retry_after().max(self.config.tick_interval);
                    let applied = self
                        .store
                        .release(&token, visible_after(Utc::now(), wait), rejection.user_message())
                        .await?;
                    tracing::debug!(
                        seq = event.seq,
                        dependency = %breaker.dependency(),
                        wait_ms = wait.as_millis() as u64,
                        "Breaker open, event deferred"
                    );
                    return Ok(self.settle(applied, DispatchOutcome::Deferred, &token));
                }
            },
            None => None,
        };

        let started = Instant::now();
        let result = self.invoke(registration, &event).await;
        let latency = started.elapsed().as_secs_f64();
        let attempt = event.attempt_count + 1;

        let outcome = match result {
            Ok(()) => {
                record_call(permit, true);
                self.step_saga(&event, attempt, true);
                let applied = self.store.complete(&token).await?;
                if applied {
                    self.end_saga(&event, true, "done");
                }
                self.settle(applied, DispatchOutcome::Done, &token)
            }
            Err(error) => {
                // A permanent rejection still means the dependency answered.
                record_call(permit, !error.retryable);
                self.step_saga(&event, attempt, false);

                if error.retryable && !self.policy.is_exhausted(attempt) {
                    let delay = self.policy.delay_for_attempt(attempt);
                    tracing::warn!(
                        seq = event.seq,
                        kind = %event.kind,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Handler failed, retrying"
                    );
                    let applied = self
                        .store
                        .retry(&token, visible_after(Utc::now(), delay), &error.to_string())
                        .await?;
                    self.settle(applied, DispatchOutcome::Retried, &token)
                } else {
                    let applied = self.store.dead_letter(&token, &error.to_string()).await?;
                    if applied {
                        self.announce_dead(&event, attempt, &error);
                    }
                    self.settle(applied, DispatchOutcome::Dead, &token)
                }
            }
        };

        metrics::record_dispatch(&event.kind, outcome.as_str(), latency);
        Ok(outcome)
    }

    /// Run the handler under the downstream timeout. Panics count as
    /// transient failures.
    async fn invoke(&self, registration: &Registration, event: &Event) -> HandlerResult {
        let call = AssertUnwindSafe(registration.handler.handle(
            &event.payload,
            &event.idem_key,
            &event.correlation_id,
        ))
        .catch_unwind();

        match tokio::time::timeout(self.config.handler_timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(HandlerError::transient(format!(
                "handler for {} panicked",
                event.kind
            ))),
            Err(_) => Err(HandlerError::transient(format!(
                "handler for {} timed out after {}ms",
                event.kind,
                self.config.handler_timeout.as_millis()
            ))
            .with_code(ErrorCode::DependencyTimeout.as_str())),
        }
    }

    fn settle(&self, applied: bool, outcome: DispatchOutcome, token: &ClaimToken) -> DispatchOutcome {
        if applied {
            return outcome;
        }
        tracing::warn!(
            seq = token.seq,
            worker_id = %token.worker_id,
            lease_id = %token.lease_id,
            intended = outcome.as_str(),
            "Lease lost before outcome was written"
        );
        DispatchOutcome::LeaseLost
    }

    fn announce_dead(&self, event: &Event, attempt_count: u32, error: &HandlerError) {
        metrics::record_dead(&event.kind);
        KeelEvent::EventDeadLettered {
            seq: event.seq,
            kind: event.kind.clone(),
            idem_key: event.idem_key.clone(),
            attempt_count,
            error: error.to_string(),
        }
        .log();
        self.end_saga(event, false, &format!("dead-lettered: {}", error));
    }

    fn step_saga(&self, event: &Event, attempt: u32, ok: bool) {
        if let Some(sagas) = &self.sagas {
            sagas.saga_step(
                &event.correlation_id,
                &event_saga_name(&event.kind, event.seq),
                &format!("dispatch.attempt.{}", attempt),
                ok,
            );
        }
    }

    fn end_saga(&self, event: &Event, ok: bool, summary: &str) {
        if let Some(sagas) = &self.sagas {
            sagas.saga_end(
                &event.correlation_id,
                &event_saga_name(&event.kind, event.seq),
                ok,
                Some(summary.to_string()),
            );
        }
    }

    /// Tick until cancelled, backing off while the store has nothing due.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            worker_id = %self.worker_id,
            batch_size = self.config.batch_size,
            "Dispatcher started"
        );

        let base = self.config.tick_interval;
        let mut idle = base;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let delay = match self.tick().await {
                Ok(report) if report.claimed >= self.config.batch_size => {
                    idle = base;
                    Duration::ZERO
                }
                Ok(report) if report.claimed > 0 => {
                    idle = base;
                    base
                }
                Ok(_) => next_idle(&mut idle, self.config.idle_backoff_max),
                Err(error) => {
                    error.log();
                    next_idle(&mut idle, self.config.idle_backoff_max)
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::info!(worker_id = %self.worker_id, "Dispatcher stopped");
    }

    /// Start the run loop on the runtime.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> DispatcherHandle {
        let stats = self.stats.clone();
        let token = cancel.clone();
        let join = tokio::spawn(async move { self.run(token).await });
        DispatcherHandle { cancel, join, stats }
    }
}

fn record_call(permit: Option<BreakerPermit<'_>>, ok: bool) {
    if let Some(permit) = permit {
        permit.settle(ok);
    }
}

fn next_idle(idle: &mut Duration, max: Duration) -> Duration {
    let delay = *idle;
    *idle = idle.saturating_mul(2).min(max.max(delay));
    delay
}

/// Handle for controlling a running dispatcher.
pub struct DispatcherHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
    stats: DispatcherStats,
}

impl DispatcherHandle {
    pub fn stats(&self) -> &DispatcherStats {
        &self.stats
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop ticking and wait for the in-flight batch to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(error) = self.join.await {
            tracing::error!(error = %error, "Dispatcher task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::handler_fn;
    use crate::outbox::{EventStatus, InMemoryEventStore, NewEvent};

    fn config() -> DispatcherConfig {
        DispatcherConfig {
            worker_id: Some("test-worker".into()),
            ..DispatcherConfig::default()
        }
    }

    #[test]
    fn test_idle_backoff_doubles_to_cap() {
        let mut idle = Duration::from_millis(100);
        let max = Duration::from_millis(350);
        assert_eq!(next_idle(&mut idle, max), Duration::from_millis(100));
        assert_eq!(next_idle(&mut idle, max), Duration::from_millis(200));
        assert_eq!(next_idle(&mut idle, max), Duration::from_millis(350));
        assert_eq!(next_idle(&mut idle, max), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_unregistered_kind_is_parked() {
        let store = Arc::new(InMemoryEventStore::new());
        let seq = store
            .append(NewEvent::new("orphan.kind", serde_json::json!({}), "k", "c"))
            .await
            .unwrap()
            .seq;

        let dispatcher = Dispatcher::new(
            store.clone(),
            Arc::new(HandlerRegistry::new()),
            Arc::new(BreakerRegistry::new()),
            &config(),
        );
        let report = dispatcher.tick().await.unwrap();

        assert_eq!(report.parked, 1);
        let event = store.get(seq).await.unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Error);
        assert_eq!(event.attempt_count, 0);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_retried() {
        let store = Arc::new(InMemoryEventStore::new());
        let seq = store
            .append(NewEvent::new("journal.append", serde_json::json!({}), "k", "c"))
            .await
            .unwrap()
            .seq;

        let mut handlers = HandlerRegistry::new();
        handlers
            .register(
                "journal.append",
                None,
                handler_fn(|payload, _, _| async move {
                    if payload.is_object() {
                        panic!("boom");
                    }
                    Ok(())
                }),
            )
            .unwrap();

        let dispatcher = Dispatcher::new(
            store.clone(),
            Arc::new(handlers),
            Arc::new(BreakerRegistry::new()),
            &config(),
        );
        let report = dispatcher.tick().await.unwrap();

        assert_eq!(report.retried, 1);
        let event = store.get(seq).await.unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Pending);
        assert_eq!(event.attempt_count, 1);
        assert!(event.last_error.unwrap().contains("panicked"));
    }

    #[tokio::test]
    async fn test_handler_timeout_is_transient() {
        let store = Arc::new(InMemoryEventStore::new());
        store
            .append(NewEvent::new("slow", serde_json::json!({}), "k", "c"))
            .await
            .unwrap();

        let mut handlers = HandlerRegistry::new();
        handlers
            .register(
                "slow",
                None,
                handler_fn(|_, _, _| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                }),
            )
            .unwrap();

        let dispatcher = Dispatcher::new(
            store.clone(),
            Arc::new(handlers),
            Arc::new(BreakerRegistry::new()),
            &DispatcherConfig {
                handler_timeout: Duration::from_millis(20),
                ..config()
            },
        );
        let report = dispatcher.tick().await.unwrap();
        assert_eq!(report.retried, 1);
    }
}
