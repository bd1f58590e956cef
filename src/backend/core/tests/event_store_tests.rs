//! Event store contract, exercised against the in-memory store.
//!
//! Tests cover:
//! - Idempotent append, sequential and concurrent
//! - Claim exclusivity and lease expiry
//! - Lease-guarded outcome writes
//! - Replay, purge, list and counts

use chrono::Utc;
use keel_core::error::ErrorCode;
use keel_core::outbox::{EventStatus, EventStore, InMemoryEventStore, NewEvent};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const LEASE: Duration = Duration::from_secs(30);

fn event(key: &str) -> NewEvent {
    NewEvent::new("journal.append", json!({"x": 1}), key, "corr-1")
}

async fn seeded(keys: &[&str]) -> (Arc<InMemoryEventStore>, Vec<i64>) {
    let store = Arc::new(InMemoryEventStore::new());
    let mut seqs = Vec::new();
    for key in keys {
        seqs.push(store.append(event(key)).await.unwrap().seq);
    }
    (store, seqs)
}

// ============================================================================
// Append
// ============================================================================

#[tokio::test]
async fn test_duplicate_append_returns_original() {
    let store = InMemoryEventStore::new();

    let first = store.append(event("abc")).await.unwrap();
    let second = store
        .append(NewEvent::new("journal.append", json!({"x": 2}), "abc", "corr-2"))
        .await
        .unwrap();

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.seq, second.seq);
    assert_eq!(store.counts().await.unwrap().total(), 1);

    // The first payload wins
    let stored = store.get_by_idem_key("abc").await.unwrap().unwrap();
    assert_eq!(stored.payload, json!({"x": 1}));
    assert_eq!(stored.correlation_id, "corr-1");
}

#[tokio::test]
async fn test_concurrent_duplicate_appends_store_one_event() {
    let store = Arc::new(InMemoryEventStore::new());

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.append(event("abc")).await.unwrap() })
        })
        .collect();

    let mut seqs = Vec::new();
    let mut created = 0;
    for task in tasks {
        let outcome = task.await.unwrap();
        seqs.push(outcome.seq);
        if outcome.created {
            created += 1;
        }
    }

    seqs.dedup();
    assert_eq!(seqs.len(), 1);
    assert_eq!(created, 1);
    assert_eq!(store.counts().await.unwrap().pending, 1);
}

#[tokio::test]
async fn test_append_rejects_blank_fields() {
    let store = InMemoryEventStore::new();

    let err = store
        .append(NewEvent::new("journal.append", json!({}), "  ", "c"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidEvent);

    let err = store
        .append(NewEvent::new("", json!({}), "k", "c"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidEvent);
}

// ============================================================================
// Claims & Leases
// ============================================================================

#[tokio::test]
async fn test_query_pending_orders_by_seq() {
    let (store, seqs) = seeded(&["a", "b", "c"]).await;

    let pending: Vec<i64> = store
        .query_pending(10)
        .await
        .unwrap()
        .iter()
        .map(|e| e.seq)
        .collect();
    assert_eq!(pending, seqs);

    assert_eq!(store.query_pending(2).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_claim_is_exclusive() {
    let (store, seqs) = seeded(&["a"]).await;

    let lease = store.claim(seqs[0], "w1", LEASE).await.unwrap();
    assert!(lease.is_some());
    assert!(store.claim(seqs[0], "w2", LEASE).await.unwrap().is_none());
    assert!(store.query_pending(10).await.unwrap().is_empty());

    let claimed = store.get(seqs[0]).await.unwrap().unwrap();
    assert_eq!(claimed.status, EventStatus::Claimed);
    assert_eq!(claimed.claimed_by.as_deref(), Some("w1"));
}

#[tokio::test]
async fn test_concurrent_claims_have_one_winner() {
    let (store, seqs) = seeded(&["a"]).await;
    let seq = seqs[0];

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .claim(seq, &format!("w{}", i), LEASE)
                    .await
                    .unwrap()
                    .is_some()
            })
        })
        .collect();

    let mut winners = 0;
    for task in tasks {
        if task.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn test_expired_lease_is_reclaimable_and_fences_old_holder() {
    let (store, seqs) = seeded(&["a"]).await;
    let seq = seqs[0];

    let stale = store
        .claim(seq, "w1", Duration::from_millis(10))
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let fresh = store.claim(seq, "w2", LEASE).await.unwrap().unwrap();
    assert_ne!(stale.token.lease_id, fresh.token.lease_id);

    // The first worker finishing late must not overwrite the new lease
    assert!(!store.complete(&stale.token).await.unwrap());
    assert!(!store.retry(&stale.token, Utc::now(), "late").await.unwrap());
    assert!(!store.dead_letter(&stale.token, "late").await.unwrap());

    assert!(store.complete(&fresh.token).await.unwrap());
    let done = store.get(seq).await.unwrap().unwrap();
    assert_eq!(done.status, EventStatus::Done);
    assert_eq!(done.attempt_count, 1);
}

#[tokio::test]
async fn test_retry_hides_event_until_visible() {
    let (store, seqs) = seeded(&["a"]).await;
    let lease = store.claim(seqs[0], "w1", LEASE).await.unwrap().unwrap();

    let later = Utc::now() + chrono::Duration::seconds(60);
    assert!(store.retry(&lease.token, later, "boom").await.unwrap());

    let event = store.get(seqs[0]).await.unwrap().unwrap();
    assert_eq!(event.status, EventStatus::Pending);
    assert_eq!(event.attempt_count, 1);
    assert_eq!(event.last_error.as_deref(), Some("boom"));
    assert!(store.query_pending(10).await.unwrap().is_empty());
}

// ============================================================================
// Admin
// ============================================================================

#[tokio::test]
async fn test_replay_resets_dead_event() {
    let (store, seqs) = seeded(&["a"]).await;
    let lease = store.claim(seqs[0], "w1", LEASE).await.unwrap().unwrap();
    store.dead_letter(&lease.token, "permanent").await.unwrap();

    let dead = store.list(Some(EventStatus::Dead), 100).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert!(store.query_pending(10).await.unwrap().is_empty());

    let replayed = store.replay(seqs[0]).await.unwrap();
    assert_eq!(replayed.status, EventStatus::Pending);
    assert_eq!(replayed.attempt_count, 0);
    assert_eq!(store.query_pending(10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_replay_rejects_live_events() {
    let (store, seqs) = seeded(&["a"]).await;

    let err = store.replay(seqs[0]).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidStateTransition);

    let err = store.replay(999).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::EventNotFound);
}

#[tokio::test]
async fn test_purge_only_terminal_statuses() {
    let (store, seqs) = seeded(&["a", "b", "c"]).await;
    for seq in &seqs[..2] {
        let lease = store.claim(*seq, "w1", LEASE).await.unwrap().unwrap();
        store.complete(&lease.token).await.unwrap();
    }

    for status in [EventStatus::Pending, EventStatus::Claimed] {
        let err = store.purge(status, None).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidStateTransition);
    }

    // Nothing is older than a cutoff in the past
    let cutoff = Utc::now() - chrono::Duration::hours(1);
    assert_eq!(store.purge(EventStatus::Done, Some(cutoff)).await.unwrap(), 0);

    assert_eq!(store.purge(EventStatus::Done, None).await.unwrap(), 2);
    let counts = store.counts().await.unwrap();
    assert_eq!(counts.done, 0);
    assert_eq!(counts.pending, 1);
}

#[tokio::test]
async fn test_list_filters_and_limits() {
    let (store, seqs) = seeded(&["a", "b", "c", "d"]).await;
    let lease = store.claim(seqs[3], "w1", LEASE).await.unwrap().unwrap();
    store.park(&lease.token, "no handler").await.unwrap();

    assert_eq!(store.list(None, 100).await.unwrap().len(), 4);
    assert_eq!(store.list(None, 2).await.unwrap().len(), 2);
    assert_eq!(store.list(Some(EventStatus::Pending), 100).await.unwrap().len(), 3);

    let parked = store.list(Some(EventStatus::Error), 100).await.unwrap();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].attempt_count, 0);
}

#[tokio::test]
async fn test_outage_fails_closed() {
    let store = InMemoryEventStore::new();
    store.set_unavailable(true);

    let err = store.append(event("a")).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::EventStoreUnavailable);
    assert!(store.ping().await.is_err());

    store.set_unavailable(false);
    assert!(store.append(event("a")).await.unwrap().created);
}
