//! Dispatcher behaviour end to end over the in-memory store.
//!
//! Tests cover:
//! - Retry until success, and dead-lettering after `max_retries`
//! - Replay of dead events
//! - Permanent failures
//! - Breaker-open deferral without consuming an attempt
//! - Redelivery after lease expiry against an idempotent handler
//! - Several dispatchers sharing one store
//! - Saga records and graceful shutdown of the run loop

use keel_core::config::{BreakerSettings, DispatcherConfig};
use keel_core::dispatch::{
    event_saga_name, handler_fn, Dispatcher, EventHandler, HandlerError, HandlerRegistry,
    IdempotentSink, RetryPolicy,
};
use keel_core::outbox::{EventStatus, EventStore, InMemoryEventStore, NewEvent};
use keel_core::resilience::{BreakerRegistry, CircuitState};
use keel_core::saga::SagaRecorder;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn config(worker: &str) -> DispatcherConfig {
    DispatcherConfig {
        worker_id: Some(worker.to_string()),
        tick_interval: Duration::from_millis(10),
        idle_backoff_max: Duration::from_millis(20),
        handler_timeout: Duration::from_secs(1),
        ..DispatcherConfig::default()
    }
}

fn dispatcher(
    store: &Arc<InMemoryEventStore>,
    handlers: HandlerRegistry,
    breakers: Arc<BreakerRegistry>,
    max_retries: u32,
) -> Dispatcher {
    Dispatcher::new(store.clone(), Arc::new(handlers), breakers, &config("test-worker"))
        .with_policy(RetryPolicy::immediate(max_retries))
}

async fn append(store: &InMemoryEventStore, kind: &str, key: &str) -> i64 {
    store
        .append(NewEvent::new(kind, json!({"x": 1}), key, "corr-1"))
        .await
        .unwrap()
        .seq
}

/// Fails `failures` times, then succeeds.
fn flaky(failures: u32, calls: Arc<AtomicU32>) -> Arc<dyn EventHandler> {
    handler_fn(move |_, _, _| {
        let calls = calls.clone();
        async move {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= failures {
                Err(HandlerError::transient(format!("attempt {} failed", call)))
            } else {
                Ok(())
            }
        }
    })
}

// ============================================================================
// Retry & Dead-Letter
// ============================================================================

#[tokio::test]
async fn test_succeeds_on_third_attempt() {
    let store = Arc::new(InMemoryEventStore::new());
    let seq = append(&store, "journal.append", "abc").await;

    let calls = Arc::new(AtomicU32::new(0));
    let mut handlers = HandlerRegistry::new();
    handlers
        .register("journal.append", None, flaky(2, calls.clone()))
        .unwrap();
    let dispatcher = dispatcher(&store, handlers, Arc::new(BreakerRegistry::new()), 5);

    assert_eq!(dispatcher.tick().await.unwrap().retried, 1);
    assert_eq!(dispatcher.tick().await.unwrap().retried, 1);
    assert_eq!(dispatcher.tick().await.unwrap().succeeded, 1);
    assert_eq!(dispatcher.tick().await.unwrap().claimed, 0);

    let event = store.get(seq).await.unwrap().unwrap();
    assert_eq!(event.status, EventStatus::Done);
    assert_eq!(event.attempt_count, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let stats = dispatcher.stats().snapshot();
    assert_eq!(stats.retried, 2);
    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.empty_ticks, 1);
}

#[tokio::test]
async fn test_dead_letter_then_replay() {
    let store = Arc::new(InMemoryEventStore::new());
    let seq = append(&store, "journal.append", "abc").await;

    let healthy = Arc::new(AtomicBool::new(false));
    let flag = healthy.clone();
    let mut handlers = HandlerRegistry::new();
    handlers
        .register(
            "journal.append",
            None,
            handler_fn(move |_, _, _| {
                let healthy = flag.load(Ordering::SeqCst);
                async move {
                    if healthy {
                        Ok(())
                    } else {
                        Err(HandlerError::transient("downstream unavailable"))
                    }
                }
            }),
        )
        .unwrap();
    let dispatcher = dispatcher(&store, handlers, Arc::new(BreakerRegistry::new()), 3);

    for _ in 0..3 {
        dispatcher.tick().await.unwrap();
    }

    let dead = store.get(seq).await.unwrap().unwrap();
    assert_eq!(dead.status, EventStatus::Dead);
    assert_eq!(dead.attempt_count, 3);
    assert!(dead.last_error.unwrap().contains("downstream unavailable"));

    // Excluded from further claims
    assert_eq!(dispatcher.tick().await.unwrap().claimed, 0);
    let listed = store.list(Some(EventStatus::Dead), 100).await.unwrap();
    assert_eq!(listed.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![seq]);

    store.replay(seq).await.unwrap();
    healthy.store(true, Ordering::SeqCst);
    assert_eq!(dispatcher.tick().await.unwrap().succeeded, 1);

    let done = store.get(seq).await.unwrap().unwrap();
    assert_eq!(done.status, EventStatus::Done);
    assert_eq!(done.attempt_count, 1);
}

#[tokio::test]
async fn test_permanent_failure_dead_letters_immediately() {
    let store = Arc::new(InMemoryEventStore::new());
    let seq = append(&store, "vector.upsert", "abc").await;

    let breakers = Arc::new(BreakerRegistry::new());
    breakers.register(
        "vector_store",
        BreakerSettings {
            fails: 1,
            ..BreakerSettings::default()
        },
    );
    let mut handlers = HandlerRegistry::new();
    handlers
        .register(
            "vector.upsert",
            Some("vector_store"),
            handler_fn(|_, _, _| async { Err(HandlerError::permanent("bad vector")) }),
        )
        .unwrap();
    let dispatcher = dispatcher(&store, handlers, breakers.clone(), 5);

    assert_eq!(dispatcher.tick().await.unwrap().dead, 1);

    let event = store.get(seq).await.unwrap().unwrap();
    assert_eq!(event.status, EventStatus::Dead);
    assert_eq!(event.attempt_count, 1);
    // The dependency answered, so its breaker stays closed
    assert_eq!(
        breakers.get("vector_store").unwrap().state(),
        CircuitState::Closed
    );
}

// ============================================================================
// Circuit Breaker Interaction
// ============================================================================

#[tokio::test]
async fn test_open_breaker_defers_without_attempt() {
    let store = Arc::new(InMemoryEventStore::new());
    let first = append(&store, "vector.upsert", "a").await;

    let breakers = Arc::new(BreakerRegistry::new());
    breakers.register(
        "vector_store",
        BreakerSettings {
            fails: 1,
            reset: Duration::from_secs(60),
            half_open_prob: 1.0,
        },
    );
    let calls = Arc::new(AtomicU32::new(0));
    let mut handlers = HandlerRegistry::new();
    handlers
        .register("vector.upsert", Some("vector_store"), flaky(u32::MAX, calls.clone()))
        .unwrap();
    let dispatcher = dispatcher(&store, handlers, breakers.clone(), 5);

    // The first failure opens the breaker
    assert_eq!(dispatcher.tick().await.unwrap().retried, 1);
    assert_eq!(
        breakers.get("vector_store").unwrap().state(),
        CircuitState::Open
    );

    let second = append(&store, "vector.upsert", "b").await;
    let report = dispatcher.tick().await.unwrap();
    assert_eq!(report.deferred, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let first = store.get(first).await.unwrap().unwrap();
    assert_eq!(first.attempt_count, 1);
    let second = store.get(second).await.unwrap().unwrap();
    assert_eq!(second.status, EventStatus::Pending);
    assert_eq!(second.attempt_count, 0);
    assert!(second.next_visible_at > chrono::Utc::now() + chrono::Duration::seconds(30));

    assert_eq!(dispatcher.stats().snapshot().deferred_by_breaker, 2);
}

// ============================================================================
// At-least-once Delivery
// ============================================================================

#[tokio::test]
async fn test_redelivery_after_lease_expiry_is_idempotent() {
    let store = Arc::new(InMemoryEventStore::new());
    let seq = append(&store, "journal.append", "abc").await;

    let sink = Arc::new(IdempotentSink::new("journal"));
    let mut handlers = HandlerRegistry::new();
    handlers.register("journal.append", None, sink.clone()).unwrap();
    let dispatcher = dispatcher(&store, handlers, Arc::new(BreakerRegistry::new()), 5);

    // A worker applies the write, then dies before recording the outcome
    let crashed = store
        .claim(seq, "crashed-worker", Duration::from_millis(10))
        .await
        .unwrap()
        .unwrap();
    sink.handle(&crashed.event.payload, &crashed.event.idem_key, &crashed.event.correlation_id)
        .await
        .unwrap();
    let before = sink.state();

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(dispatcher.tick().await.unwrap().succeeded, 1);

    assert_eq!(sink.invocations(), 2);
    assert_eq!(sink.len(), 1);
    assert_eq!(sink.state(), before);
    assert!(!store.complete(&crashed.token).await.unwrap());
    assert_eq!(store.get(seq).await.unwrap().unwrap().status, EventStatus::Done);
}

#[tokio::test]
async fn test_parallel_dispatchers_process_each_event_once() {
    let store = Arc::new(InMemoryEventStore::new());
    for i in 0..40 {
        append(&store, "journal.append", &format!("key-{}", i)).await;
    }

    let sink = Arc::new(IdempotentSink::new("journal"));
    let mut handlers = HandlerRegistry::new();
    handlers.register("journal.append", None, sink.clone()).unwrap();
    let handlers = Arc::new(handlers);
    let breakers = Arc::new(BreakerRegistry::new());

    let workers: Vec<Arc<Dispatcher>> = (0..3)
        .map(|i| {
            Arc::new(Dispatcher::new(
                store.clone(),
                handlers.clone(),
                breakers.clone(),
                &DispatcherConfig {
                    batch_size: 8,
                    ..config(&format!("worker-{}", i))
                },
            ))
        })
        .collect();

    let tasks: Vec<_> = workers
        .iter()
        .cloned()
        .map(|worker| {
            tokio::spawn(async move {
                let mut total = 0;
                loop {
                    let report = worker.tick().await.unwrap();
                    if report.claimed == 0 {
                        break total;
                    }
                    total += report.succeeded;
                }
            })
        })
        .collect();

    let mut succeeded = 0;
    for task in tasks {
        succeeded += task.await.unwrap();
    }

    assert_eq!(succeeded, 40);
    assert_eq!(sink.invocations(), 40);
    assert_eq!(sink.len(), 40);
    assert_eq!(store.counts().await.unwrap().done, 40);
}

// ============================================================================
// Sagas & Run Loop
// ============================================================================

#[tokio::test]
async fn test_attempts_are_recorded_on_saga() {
    let store = Arc::new(InMemoryEventStore::new());
    let seq = append(&store, "journal.append", "abc").await;

    let sagas = Arc::new(SagaRecorder::new(100));
    let mut handlers = HandlerRegistry::new();
    handlers
        .register("journal.append", None, flaky(1, Arc::new(AtomicU32::new(0))))
        .unwrap();
    let dispatcher = dispatcher(&store, handlers, Arc::new(BreakerRegistry::new()), 5)
        .with_saga_recorder(sagas.clone());

    dispatcher.tick().await.unwrap();
    dispatcher.tick().await.unwrap();

    let records = sagas.get("corr-1");
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.saga_name, event_saga_name("journal.append", seq));
    let steps: Vec<(&str, bool)> = record.steps.iter().map(|s| (s.name.as_str(), s.ok)).collect();
    assert_eq!(
        steps,
        vec![("dispatch.attempt.1", false), ("dispatch.attempt.2", true)]
    );
    assert_eq!(record.ended_ok, Some(true));
}

#[tokio::test]
async fn test_run_loop_drains_and_shuts_down() {
    let store = Arc::new(InMemoryEventStore::new());
    for i in 0..5 {
        append(&store, "journal.append", &format!("key-{}", i)).await;
    }

    let sink = Arc::new(IdempotentSink::new("journal"));
    let mut handlers = HandlerRegistry::new();
    handlers.register("journal.append", None, sink.clone()).unwrap();
    let dispatcher = Arc::new(dispatcher(&store, handlers, Arc::new(BreakerRegistry::new()), 5));

    let cancel = CancellationToken::new();
    let handle = dispatcher.spawn(cancel.clone());

    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        while store.counts().await.unwrap().done < 5 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(drained.is_ok());

    tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
        .await
        .unwrap();
    assert!(cancel.is_cancelled());
    assert_eq!(sink.len(), 5);
}
