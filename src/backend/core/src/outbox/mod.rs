//! Durable event log with idempotent append.
//!
//! Every pending side effect is recorded as an [`Event`] keyed by a unique
//! `idem_key`. Workers claim events with a single conditional update, which
//! is the only coordination needed between dispatcher instances.

mod memory;

pub use memory::InMemoryEventStore;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{KeelError, Result};

/// Lifecycle status of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Waiting to be claimed
    Pending,
    /// Leased by a worker until `next_visible_at`
    Claimed,
    /// Handler succeeded
    Done,
    /// Parked: no handler could take it. Replayable.
    Error,
    /// Retries exhausted or permanently rejected
    Dead,
}

impl EventStatus {
    pub const ALL: [EventStatus; 5] = [
        EventStatus::Pending,
        EventStatus::Claimed,
        EventStatus::Done,
        EventStatus::Error,
        EventStatus::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Done => "done",
            Self::Error => "error",
            Self::Dead => "dead",
        }
    }

    /// Statuses no worker will move an event out of.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Dead)
    }

    /// Statuses `replay` accepts.
    pub fn is_replayable(&self) -> bool {
        matches!(self, Self::Error | Self::Dead)
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = KeelError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "claimed" => Ok(Self::Claimed),
            "done" => Ok(Self::Done),
            "error" => Ok(Self::Error),
            "dead" => Ok(Self::Dead),
            other => Err(KeelError::validation(format!("unknown event status: {}", other))),
        }
    }
}

/// A durable record of one pending side effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub seq: i64,
    pub idem_key: String,
    pub correlation_id: String,
    pub kind: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub status: EventStatus,
    pub attempt_count: u32,
    pub next_visible_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub claimed_by: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Event {
    /// Whether a worker may claim this event at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, EventStatus::Pending | EventStatus::Claimed)
            && self.next_visible_at <= now
    }
}

/// Input to [`EventStore::append`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEvent {
    pub kind: String,
    pub payload: serde_json::Value,
    pub idem_key: String,
    pub correlation_id: String,
}

impl NewEvent {
    pub fn new(
        kind: impl Into<String>,
        payload: serde_json::Value,
        idem_key: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            payload,
            idem_key: idem_key.into(),
            correlation_id: correlation_id.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.kind.trim().is_empty() {
            return Err(KeelError::invalid_event("event kind must not be empty"));
        }
        if self.idem_key.trim().is_empty() {
            return Err(KeelError::invalid_event("idem_key must not be empty"));
        }
        if self.correlation_id.trim().is_empty() {
            return Err(KeelError::invalid_event("correlation_id must not be empty"));
        }
        Ok(())
    }
}

/// Result of an append: the stored `(seq, status)` and whether this call created it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendOutcome {
    pub seq: i64,
    pub status: EventStatus,
    pub created: bool,
}

/// Proof of a lease. Outcome writes only apply while it still matches the row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimToken {
    pub seq: i64,
    pub worker_id: String,
    pub lease_id: Uuid,
}

/// An event together with the lease that covers it.
#[derive(Debug, Clone)]
pub struct ClaimedEvent {
    pub event: Event,
    pub token: ClaimToken,
}

/// Per-status event counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub claimed: u64,
    pub done: u64,
    pub error: u64,
    pub dead: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: EventStatus, n: u64) {
        match status {
            EventStatus::Pending => self.pending += n,
            EventStatus::Claimed => self.claimed += n,
            EventStatus::Done => self.done += n,
            EventStatus::Error => self.error += n,
            EventStatus::Dead => self.dead += n,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.claimed + self.done + self.error + self.dead
    }
}

/// Storage backend for the event log.
///
/// Every mutation is a single-row conditional update; implementations must
/// make `claim` a compare-and-set so concurrent workers never both win.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Durably append an event, or return the existing one for its `idem_key`.
    async fn append(&self, event: NewEvent) -> Result<AppendOutcome>;

    /// Claimable events ordered by `seq`.
    async fn query_pending(&self, batch_size: usize) -> Result<Vec<Event>>;

    /// Try to lease one event. `None` if another worker got there first or it
    /// is no longer eligible.
    async fn claim(&self, seq: i64, worker_id: &str, visibility: Duration) -> Result<Option<ClaimedEvent>>;

    /// Claim up to `batch_size` eligible events.
    async fn claim_batch(
        &self,
        batch_size: usize,
        worker_id: &str,
        visibility: Duration,
    ) -> Result<Vec<ClaimedEvent>> {
        let candidates = self.query_pending(batch_size).await?;
        let mut claimed = Vec::with_capacity(candidates.len());
        for event in candidates {
            if let Some(lease) = self.claim(event.seq, worker_id, visibility).await? {
                claimed.push(lease);
            }
        }
        Ok(claimed)
    }

    /// Mark done, counting the final attempt. `false` if the lease was lost.
    async fn complete(&self, token: &ClaimToken) -> Result<bool>;

    /// Count a failed attempt and return the event to `pending` at `next_visible_at`.
    async fn retry(&self, token: &ClaimToken, next_visible_at: DateTime<Utc>, error: &str) -> Result<bool>;

    /// Count a failed attempt and move the event to `dead`.
    async fn dead_letter(&self, token: &ClaimToken, error: &str) -> Result<bool>;

    /// Give the lease back without counting an attempt.
    async fn release(&self, token: &ClaimToken, next_visible_at: DateTime<Utc>, reason: &str) -> Result<bool>;

    /// Move a claimed event to `error` without counting an attempt.
    async fn park(&self, token: &ClaimToken, error: &str) -> Result<bool>;

    async fn get(&self, seq: i64) -> Result<Option<Event>>;

    async fn get_by_idem_key(&self, idem_key: &str) -> Result<Option<Event>>;

    /// Events in `status` (all statuses when `None`) ordered by `seq`.
    async fn list(&self, status: Option<EventStatus>, limit: usize) -> Result<Vec<Event>>;

    /// Return a `dead` or `error` event to `pending` with `attempt_count = 0`.
    async fn replay(&self, seq: i64) -> Result<Event>;

    /// Delete terminal events, optionally only those created before `older_than`.
    async fn purge(&self, status: EventStatus, older_than: Option<DateTime<Utc>>) -> Result<u64>;

    async fn counts(&self) -> Result<StatusCounts>;

    /// Cheap reachability check.
    async fn ping(&self) -> Result<()>;
}

/// `now + duration`, saturating instead of overflowing.
pub fn visible_after(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Check `purge` arguments shared by every store.
pub(crate) fn ensure_purgeable(status: EventStatus) -> Result<()> {
    if status.is_terminal() {
        Ok(())
    } else {
        Err(KeelError::new(
            crate::error::ErrorCode::InvalidStateTransition,
            format!("only terminal events can be purged, not {}", status),
        ))
    }
}
