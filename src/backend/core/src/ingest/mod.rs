//! Inbound write path.
//!
//! `enqueue` is the normal route: charge the turn budget, then append to the
//! event store and let the dispatcher deliver it. `write_direct` calls the
//! handler inline when the dependency is healthy and falls back to the store
//! otherwise. If the store itself is down the caller gets a hard error.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};

use crate::budget::{AdmissionCounters, BudgetLimits, TurnBudget};
use crate::dispatch::{event_saga_name, HandlerError, HandlerRegistry};
use crate::error::{KeelError, Result};
use crate::observability::{metrics, KeelEvent};
use crate::outbox::{EventStatus, EventStore, NewEvent};
use crate::resilience::{BreakerRegistry, DegradedMode};
use crate::saga::SagaRecorder;

/// One write as received at the boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteRequest {
    pub kind: String,
    pub payload: serde_json::Value,
    pub idem_key: String,
    pub correlation_id: String,
    /// Tokens charged against the turn budget
    #[serde(default)]
    pub tokens: u64,
}

/// Acknowledgement for a write that went through the event store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnqueueReceipt {
    pub event_id: i64,
    pub idem_key: String,
    pub status: EventStatus,
    /// `false` when the key was already known and the prior record returned
    pub created: bool,
    /// Accepted in place of a direct call
    pub deferred: bool,
}

/// Result of a direct write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DirectOutcome {
    /// The handler ran inline and succeeded
    Applied { idem_key: String },
    /// Written to the event store for later delivery
    Deferred {
        receipt: EnqueueReceipt,
        reason: String,
    },
}

/// Shared entry point for every inbound write.
pub struct WritePath {
    store: Arc<dyn EventStore>,
    handlers: Arc<HandlerRegistry>,
    breakers: Arc<BreakerRegistry>,
    degraded: Arc<DegradedMode>,
    sagas: Arc<SagaRecorder>,
    limits: BudgetLimits,
    counters: Arc<AdmissionCounters>,
    handler_timeout: Duration,
}

impl WritePath {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn EventStore>,
        handlers: Arc<HandlerRegistry>,
        breakers: Arc<BreakerRegistry>,
        degraded: Arc<DegradedMode>,
        sagas: Arc<SagaRecorder>,
        limits: BudgetLimits,
        counters: Arc<AdmissionCounters>,
        handler_timeout: Duration,
    ) -> Self {
        Self {
            store,
            handlers,
            breakers,
            degraded,
            sagas,
            limits,
            counters,
            handler_timeout,
        }
    }

    /// A fresh budget for one turn.
    pub fn begin_turn(&self, turn_id: &str) -> TurnBudget {
        TurnBudget::new(turn_id, self.limits).with_counters(self.counters.clone())
    }

    /// Append a write in its own single-request turn.
    pub async fn enqueue(&self, request: WriteRequest) -> Result<EnqueueReceipt> {
        let mut budget = self.begin_turn(&request.correlation_id);
        self.enqueue_in_turn(&mut budget, request).await
    }

    /// Append a write, charging `budget` first.
    pub async fn enqueue_in_turn(
        &self,
        budget: &mut TurnBudget,
        request: WriteRequest,
    ) -> Result<EnqueueReceipt> {
        self.handlers.ensure_known(&request.kind)?;
        budget.admit(request.tokens)?;
        self.append(request, false).await
    }

    /// Call the handler inline, or defer to the store while degraded, while
    /// the breaker rejects, or when the call fails transiently.
    pub async fn write_direct(&self, request: WriteRequest) -> Result<DirectOutcome> {
        let mut budget = self.begin_turn(&request.correlation_id);
        self.write_direct_in_turn(&mut budget, request).await
    }

    pub async fn write_direct_in_turn(
        &self,
        budget: &mut TurnBudget,
        request: WriteRequest,
    ) -> Result<DirectOutcome> {
        self.handlers.ensure_known(&request.kind)?;
        budget.admit(request.tokens)?;

        if self.degraded.is_active() {
            return self.defer(request, "degraded mode active").await;
        }

        let registration = self
            .handlers
            .get(&request.kind)
            .ok_or_else(|| KeelError::unknown_event_kind(request.kind.clone()))?;
        let breaker = registration
            .dependency
            .as_deref()
            .and_then(|dependency| self.breakers.get(dependency));

        let permit = match &breaker {
            Some(breaker) => match breaker.try_acquire() {
                Ok(permit) => Some(permit),
                Err(rejection) => {
                    let reason = rejection.user_message().to_string();
                    return self.defer(request, &reason).await;
                }
            },
            None => None,
        };

        let saga = direct_saga_name(&request.kind);
        let call = AssertUnwindSafe(registration.handler.handle(
            &request.payload,
            &request.idem_key,
            &request.correlation_id,
        ))
        .catch_unwind();
        let result = match tokio::time::timeout(self.handler_timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(HandlerError::transient(format!(
                "direct call for {} panicked",
                request.kind
            ))),
            Err(_) => Err(HandlerError::transient(format!(
                "direct call timed out after {}ms",
                self.handler_timeout.as_millis()
            ))),
        };

        match result {
            Ok(()) => {
                if let Some(permit) = permit {
                    permit.success();
                }
                self.sagas
                    .saga_step(&request.correlation_id, &saga, "direct.call", true);
                self.sagas
                    .saga_end(&request.correlation_id, &saga, true, Some("applied".into()));
                Ok(DirectOutcome::Applied {
                    idem_key: request.idem_key,
                })
            }
            Err(error) if error.retryable => {
                if let Some(permit) = permit {
                    permit.failure();
                }
                self.sagas
                    .saga_step(&request.correlation_id, &saga, "direct.call", false);
                self.sagas.saga_end(
                    &request.correlation_id,
                    &saga,
                    false,
                    Some(format!("deferred: {}", error)),
                );
                let reason = error.to_string();
                self.defer(request, &reason).await
            }
            Err(error) => {
                if let Some(permit) = permit {
                    permit.success();
                }
                self.sagas
                    .saga_step(&request.correlation_id, &saga, "direct.call", false);
                self.sagas.saga_end(
                    &request.correlation_id,
                    &saga,
                    false,
                    Some(error.to_string()),
                );
                Err(KeelError::from(error))
            }
        }
    }

    async fn defer(&self, request: WriteRequest, reason: &str) -> Result<DirectOutcome> {
        tracing::info!(
            kind = %request.kind,
            idem_key = %request.idem_key,
            correlation_id = %request.correlation_id,
            reason = %reason,
            "Direct write deferred to event store"
        );
        let receipt = self.append(request, true).await?;
        Ok(DirectOutcome::Deferred {
            receipt,
            reason: reason.to_string(),
        })
    }

    async fn append(&self, request: WriteRequest, deferred: bool) -> Result<EnqueueReceipt> {
        let WriteRequest {
            kind,
            payload,
            idem_key,
            correlation_id,
            ..
        } = request;

        let outcome = self
            .store
            .append(NewEvent::new(
                kind.clone(),
                payload,
                idem_key.clone(),
                correlation_id.clone(),
            ))
            .await?;

        let saga = event_saga_name(&kind, outcome.seq);
        if outcome.created {
            metrics::record_appended(&kind);
            KeelEvent::EventAppended {
                seq: outcome.seq,
                kind: kind.clone(),
                idem_key: idem_key.clone(),
                correlation_id: correlation_id.clone(),
            }
            .log();
            self.sagas.saga_begin(
                &correlation_id,
                &saga,
                serde_json::json!({
                    "kind": kind,
                    "idem_key": idem_key,
                    "seq": outcome.seq,
                    "deferred": deferred,
                }),
            );
            self.sagas.saga_step(&correlation_id, &saga, "append", true);
        } else {
            metrics::record_deduplicated(&kind);
            tracing::debug!(seq = outcome.seq, idem_key = %idem_key, "Duplicate submission");
            self.sagas
                .saga_step(&correlation_id, &saga, "append.duplicate", true);
        }

        Ok(EnqueueReceipt {
            event_id: outcome.seq,
            idem_key,
            status: outcome.status,
            created: outcome.created,
            deferred,
        })
    }
}

/// Saga name for inline calls of `kind`.
pub fn direct_saga_name(kind: &str) -> String {
    format!("{}.direct", kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BreakerSettings;
    use crate::dispatch::{handler_fn, HandlerResult, IdempotentSink};
    use crate::error::ErrorCode;
    use crate::outbox::InMemoryEventStore;
    use crate::resilience::{CircuitBreaker, CircuitState};

    struct Fixture {
        store: Arc<InMemoryEventStore>,
        sink: Arc<IdempotentSink>,
        breakers: Arc<BreakerRegistry>,
        degraded: Arc<DegradedMode>,
        path: WritePath,
    }

    fn fixture(limits: BudgetLimits) -> Fixture {
        let store = Arc::new(InMemoryEventStore::new());
        let sink = Arc::new(IdempotentSink::new("vector"));
        let degraded = Arc::new(DegradedMode::new(2));
        let breakers = Arc::new(BreakerRegistry::new().with_observer(degraded.clone()));
        breakers.register(
            "vector_store",
            BreakerSettings {
                fails: 1,
                reset: Duration::from_secs(60),
                half_open_prob: 1.0,
            },
        );

        let mut handlers = HandlerRegistry::new();
        handlers
            .register("vector.upsert", Some("vector_store"), sink.clone())
            .unwrap();
        handlers
            .register(
                "flaky.call",
                Some("vector_store"),
                handler_fn(|_, _, _| async { Err(HandlerError::transient("connection reset")) }),
            )
            .unwrap();

        let path = WritePath::new(
            store.clone(),
            Arc::new(handlers),
            breakers.clone(),
            degraded.clone(),
            Arc::new(SagaRecorder::new(100)),
            limits,
            Arc::new(AdmissionCounters::new()),
            Duration::from_secs(1),
        );

        Fixture {
            store,
            sink,
            breakers,
            degraded,
            path,
        }
    }

    fn request(kind: &str, key: &str) -> WriteRequest {
        WriteRequest {
            kind: kind.into(),
            payload: serde_json::json!({"x": 1}),
            idem_key: key.into(),
            correlation_id: "corr-1".into(),
            tokens: 10,
        }
    }

    #[tokio::test]
    async fn test_enqueue_deduplicates() {
        let f = fixture(BudgetLimits::standard());
        let first = f.path.enqueue(request("vector.upsert", "abc")).await.unwrap();
        let second = f.path.enqueue(request("vector.upsert", "abc")).await.unwrap();

        assert_eq!(first.event_id, second.event_id);
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(f.store.counts().await.unwrap().total(), 1);
    }

    #[tokio::test]
    async fn test_budget_rejection_has_no_effect() {
        let f = fixture(BudgetLimits {
            tokens_limit: 5,
            tool_calls_limit: 4,
            retry_after_sec: 1,
        });
        let err = f.path.enqueue(request("vector.upsert", "abc")).await.unwrap_err();

        assert_eq!(err.code(), ErrorCode::BudgetExceeded);
        assert_eq!(err.budget_resource(), Some("tokens"));
        assert_eq!(f.store.counts().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_unknown_kind_rejected() {
        let f = fixture(BudgetLimits::standard());
        let err = f.path.enqueue(request("nope", "abc")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnknownEventKind);
    }

    #[tokio::test]
    async fn test_direct_write_applies_inline() {
        let f = fixture(BudgetLimits::standard());
        let outcome = f.path.write_direct(request("vector.upsert", "k1")).await.unwrap();

        assert!(matches!(outcome, DirectOutcome::Applied { .. }));
        assert!(f.sink.get("k1").is_some());
        assert_eq!(f.store.counts().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_defers_and_degrades() {
        let f = fixture(BudgetLimits::standard());
        let outcome = f.path.write_direct(request("flaky.call", "k1")).await.unwrap();

        assert!(matches!(outcome, DirectOutcome::Deferred { .. }));
        assert!(f.degraded.is_active());
        assert!(f.breakers.any_open());

        // Degraded: even a healthy kind goes through the store now.
        let outcome = f.path.write_direct(request("vector.upsert", "k2")).await.unwrap();
        match outcome {
            DirectOutcome::Deferred { receipt, .. } => assert!(receipt.deferred),
            other => panic!("expected deferral, got {:?}", other),
        }
        assert!(f.sink.is_empty());
        assert_eq!(f.store.counts().await.unwrap().pending, 2);
    }

    #[tokio::test]
    async fn test_store_outage_is_hard_failure() {
        let f = fixture(BudgetLimits::standard());
        f.degraded.breaker_opened("vector_store");
        f.store.set_unavailable(true);

        let err = f.path.write_direct(request("vector.upsert", "k1")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::EventStoreUnavailable);
    }

    async fn panicking_call() -> HandlerResult {
        panic!("index handle poisoned")
    }

    /// A path whose breaker is not wired to degraded mode, so direct writes
    /// reach a half-open breaker.
    fn half_open_path() -> (WritePath, Arc<CircuitBreaker>) {
        let breakers = Arc::new(BreakerRegistry::new());
        let breaker = breakers.register(
            "vector_store",
            BreakerSettings {
                fails: 1,
                reset: Duration::from_millis(10),
                half_open_prob: 1.0,
            },
        );

        let mut handlers = HandlerRegistry::new();
        handlers
            .register(
                "slow.call",
                Some("vector_store"),
                handler_fn(|_, _, _| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                }),
            )
            .unwrap();
        handlers
            .register("panicky.call", Some("vector_store"), handler_fn(|_, _, _| panicking_call()))
            .unwrap();

        let path = WritePath::new(
            Arc::new(InMemoryEventStore::new()),
            Arc::new(handlers),
            breakers,
            Arc::new(DegradedMode::new(2)),
            Arc::new(SagaRecorder::new(100)),
            BudgetLimits::standard(),
            Arc::new(AdmissionCounters::new()),
            Duration::from_secs(1),
        );
        (path, breaker)
    }

    #[tokio::test]
    async fn test_cancelled_direct_write_frees_breaker() {
        let (path, breaker) = half_open_path();
        breaker.record_failure();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let cancelled = tokio::time::timeout(
            Duration::from_millis(50),
            path.write_direct(request("slow.call", "k1")),
        )
        .await;
        assert!(cancelled.is_err());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.try_acquire().unwrap().success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_panicking_direct_call_counts_as_failure() {
        let (path, breaker) = half_open_path();
        breaker.record_failure();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let outcome = path.write_direct(request("panicky.call", "k1")).await.unwrap();
        match outcome {
            DirectOutcome::Deferred { reason, .. } => assert!(reason.contains("panicked")),
            other => panic!("expected deferral, got {:?}", other),
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.snapshot().total_failures, 2);
    }
}
