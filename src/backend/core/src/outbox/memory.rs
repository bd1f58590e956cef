//! In-memory event store for tests and single-process development.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    ensure_purgeable, visible_after, AppendOutcome, ClaimToken, ClaimedEvent, Event, EventStatus,
    EventStore, NewEvent, StatusCounts,
};
use crate::error::{KeelError, Result};

#[derive(Debug, Default)]
struct MemoryState {
    events: BTreeMap<i64, Event>,
    by_key: HashMap<String, i64>,
    leases: HashMap<i64, ClaimToken>,
    next_seq: i64,
}

impl MemoryState {
    /// The claimed event covered by `token`, if the lease is still current.
    fn leased_mut(&mut self, token: &ClaimToken) -> Option<&mut Event> {
        if self.leases.get(&token.seq) != Some(token) {
            return None;
        }
        self.events
            .get_mut(&token.seq)
            .filter(|event| event.status == EventStatus::Claimed)
    }
}

/// Event store held in process memory behind a single lock.
pub struct InMemoryEventStore {
    state: RwLock<MemoryState>,
    unavailable: AtomicBool,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState {
                next_seq: 1,
                ..MemoryState::default()
            }),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Simulate an outage: every call fails with `EventStoreUnavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(KeelError::store_unavailable("in-memory store marked unavailable"))
        } else {
            Ok(())
        }
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, new: NewEvent) -> Result<AppendOutcome> {
        self.check_available()?;
        new.validate()?;

        let mut state = self.state.write().await;
        if let Some(seq) = state.by_key.get(&new.idem_key).copied() {
            let status = state
                .events
                .get(&seq)
                .map(|event| event.status)
                .ok_or_else(|| KeelError::event_not_found(seq))?;
            return Ok(AppendOutcome {
                seq,
                status,
                created: false,
            });
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        let now = Utc::now();
        state.by_key.insert(new.idem_key.clone(), seq);
        state.events.insert(
            seq,
            Event {
                seq,
                idem_key: new.idem_key,
                correlation_id: new.correlation_id,
                kind: new.kind,
                payload: new.payload,
                created_at: now,
                status: EventStatus::Pending,
                attempt_count: 0,
                next_visible_at: now,
                last_error: None,
                claimed_by: None,
                updated_at: now,
            },
        );

        Ok(AppendOutcome {
            seq,
            status: EventStatus::Pending,
            created: true,
        })
    }

    async fn query_pending(&self, batch_size: usize) -> Result<Vec<Event>> {
        self.check_available()?;
        let now = Utc::now();
        let state = self.state.read().await;
        Ok(state
            .events
            .values()
            .filter(|event| event.is_claimable(now))
            .take(batch_size)
            .cloned()
            .collect())
    }

    async fn claim(&self, seq: i64, worker_id: &str, visibility: Duration) -> Result<Option<ClaimedEvent>> {
        self.check_available()?;
        let now = Utc::now();
        let mut state = self.state.write().await;

        let event = match state.events.get_mut(&seq) {
            Some(event) if event.is_claimable(now) => event,
            _ => return Ok(None),
        };

        event.status = EventStatus::Claimed;
        event.next_visible_at = visible_after(now, visibility);
        event.claimed_by = Some(worker_id.to_string());
        event.updated_at = now;
        let event = event.clone();

        let token = ClaimToken {
            seq,
            worker_id: worker_id.to_string(),
            lease_id: Uuid::new_v4(),
        };
        state.leases.insert(seq, token.clone());

        Ok(Some(ClaimedEvent { event, token }))
    }

    async fn complete(&self, token: &ClaimToken) -> Result<bool> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let Some(event) = state.leased_mut(token) else {
            return Ok(false);
        };
        let now = Utc::now();
        event.status = EventStatus::Done;
        event.attempt_count += 1;
        event.last_error = None;
        event.updated_at = now;
        state.leases.remove(&token.seq);
        Ok(true)
    }

    async fn retry(&self, token: &ClaimToken, next_visible_at: DateTime<Utc>, error: &str) -> Result<bool> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let Some(event) = state.leased_mut(token) else {
            return Ok(false);
        };
        event.status = EventStatus::Pending;
        event.attempt_count += 1;
        event.next_visible_at = next_visible_at;
        event.last_error = Some(error.to_string());
        event.claimed_by = None;
        event.updated_at = Utc::now();
        state.leases.remove(&token.seq);
        Ok(true)
    }

    async fn dead_letter(&self, token: &ClaimToken, error: &str) -> Result<bool> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let Some(event) = state.leased_mut(token) else {
            return Ok(false);
        };
        event.status = EventStatus::Dead;
        event.attempt_count += 1;
        event.last_error = Some(error.to_string());
        event.updated_at = Utc::now();
        state.leases.remove(&token.seq);
        Ok(true)
    }

    async fn release(&self, token: &ClaimToken, next_visible_at: DateTime<Utc>, reason: &str) -> Result<bool> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let Some(event) = state.leased_mut(token) else {
            return Ok(false);
        };
        event.status = EventStatus::Pending;
        event.next_visible_at = next_visible_at;
        event.last_error = Some(reason.to_string());
        event.claimed_by = None;
        event.updated_at = Utc::now();
        state.leases.remove(&token.seq);
        Ok(true)
    }

    async fn park(&self, token: &ClaimToken, error: &str) -> Result<bool> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let Some(event) = state.leased_mut(token) else {
            return Ok(false);
        };
        event.status = EventStatus::Error;
        event.last_error = Some(error.to_string());
        event.updated_at = Utc::now();
        state.leases.remove(&token.seq);
        Ok(true)
    }

    async fn get(&self, seq: i64) -> Result<Option<Event>> {
        self.check_available()?;
        Ok(self.state.read().await.events.get(&seq).cloned())
    }

    async fn get_by_idem_key(&self, idem_key: &str) -> Result<Option<Event>> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state
            .by_key
            .get(idem_key)
            .and_then(|seq| state.events.get(seq))
            .cloned())
    }

    async fn list(&self, status: Option<EventStatus>, limit: usize) -> Result<Vec<Event>> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state
            .events
            .values()
            .filter(|event| status.map_or(true, |s| event.status == s))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn replay(&self, seq: i64) -> Result<Event> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let event = state
            .events
            .get_mut(&seq)
            .ok_or_else(|| KeelError::event_not_found(seq))?;

        if !event.status.is_replayable() {
            return Err(KeelError::invalid_state_transition(
                seq,
                event.status,
                EventStatus::Pending,
            ));
        }

        let now = Utc::now();
        event.status = EventStatus::Pending;
        event.attempt_count = 0;
        event.next_visible_at = now;
        event.claimed_by = None;
        event.updated_at = now;
        Ok(event.clone())
    }

    async fn purge(&self, status: EventStatus, older_than: Option<DateTime<Utc>>) -> Result<u64> {
        self.check_available()?;
        ensure_purgeable(status)?;

        let mut state = self.state.write().await;
        let doomed: Vec<(i64, String)> = state
            .events
            .values()
            .filter(|event| event.status == status)
            .filter(|event| older_than.map_or(true, |cutoff| event.created_at < cutoff))
            .map(|event| (event.seq, event.idem_key.clone()))
            .collect();

        for (seq, idem_key) in &doomed {
            state.events.remove(seq);
            state.by_key.remove(idem_key);
        }
        Ok(doomed.len() as u64)
    }

    async fn counts(&self) -> Result<StatusCounts> {
        self.check_available()?;
        let state = self.state.read().await;
        let mut counts = StatusCounts::default();
        for event in state.events.values() {
            counts.add(event.status, 1);
        }
        Ok(counts)
    }

    async fn ping(&self) -> Result<()> {
        self.check_available()
    }
}
