//! PostgreSQL-backed event store.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::Database;
use crate::error::{KeelError, Result};
use crate::outbox::{
    ensure_purgeable, AppendOutcome, ClaimToken, ClaimedEvent, Event, EventStatus, EventStore,
    NewEvent, StatusCounts,
};

const EVENT_COLUMNS: &str = "seq, idem_key, correlation_id, kind, payload, status, attempt_count, \
     next_visible_at, last_error, claimed_by, created_at, updated_at";

/// Event store over the `outbox_events` table.
#[derive(Clone)]
pub struct PgEventStore {
    db: Database,
}

impl PgEventStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Run a lease-guarded update. `true` when the row was still ours.
    async fn update_leased(&self, sql: &str, token: &ClaimToken, bind: LeaseBind<'_>) -> Result<bool> {
        let query = sqlx::query(sql).bind(token.seq).bind(token.lease_id);
        let query = match bind {
            LeaseBind::None => query,
            LeaseBind::Error(error) => query.bind(error),
            LeaseBind::Visible(at, error) => query.bind(at).bind(error),
        };
        let result = query.execute(self.db.pool()).await?;
        Ok(result.rows_affected() == 1)
    }
}

enum LeaseBind<'a> {
    None,
    Error(&'a str),
    Visible(DateTime<Utc>, &'a str),
}

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    seq: i64,
    idem_key: String,
    correlation_id: String,
    kind: String,
    payload: serde_json::Value,
    status: String,
    attempt_count: i32,
    next_visible_at: DateTime<Utc>,
    last_error: Option<String>,
    claimed_by: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for Event {
    type Error = KeelError;

    fn try_from(row: EventRow) -> Result<Self> {
        Ok(Event {
            seq: row.seq,
            idem_key: row.idem_key,
            correlation_id: row.correlation_id,
            kind: row.kind,
            payload: row.payload,
            status: row.status.parse()?,
            attempt_count: row.attempt_count.max(0) as u32,
            next_visible_at: row.next_visible_at,
            last_error: row.last_error,
            claimed_by: row.claimed_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn into_events(rows: Vec<EventRow>) -> Result<Vec<Event>> {
    rows.into_iter().map(Event::try_from).collect()
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn append(&self, new: NewEvent) -> Result<AppendOutcome> {
        new.validate()?;

        let inserted: Option<(i64, String)> = sqlx::query_as(
            r#"
            INSERT INTO outbox_events (idem_key, correlation_id, kind, payload)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (idem_key) DO NOTHING
            RETURNING seq, status
            "#,
        )
        .bind(&new.idem_key)
        .bind(&new.correlation_id)
        .bind(&new.kind)
        .bind(&new.payload)
        .fetch_optional(self.db.pool())
        .await?;

        if let Some((seq, status)) = inserted {
            return Ok(AppendOutcome {
                seq,
                status: status.parse()?,
                created: true,
            });
        }

        let (seq, status): (i64, String) =
            sqlx::query_as("SELECT seq, status FROM outbox_events WHERE idem_key = $1")
                .bind(&new.idem_key)
                .fetch_one(self.db.pool())
                .await?;

        Ok(AppendOutcome {
            seq,
            status: status.parse()?,
            created: false,
        })
    }

    async fn query_pending(&self, batch_size: usize) -> Result<Vec<Event>> {
        let rows = sqlx::query_as::<_, EventRow>(&format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM outbox_events
            WHERE status IN ('pending', 'claimed') AND next_visible_at <= NOW()
            ORDER BY seq ASC
            LIMIT $1
            "#
        ))
        .bind(batch_size as i64)
        .fetch_all(self.db.pool())
        .await?;

        into_events(rows)
    }

    async fn claim(&self, seq: i64, worker_id: &str, visibility: Duration) -> Result<Option<ClaimedEvent>> {
        let lease_id = Uuid::new_v4();
        let row = sqlx::query_as::<_, EventRow>(&format!(
            r#"
            UPDATE outbox_events
            SET status = 'claimed',
                next_visible_at = NOW() + ($2::double precision * INTERVAL '1 second'),
                claimed_by = $3,
                lease_id = $4,
                updated_at = NOW()
            WHERE seq = $1
              AND status IN ('pending', 'claimed')
              AND next_visible_at <= NOW()
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(seq)
        .bind(visibility.as_secs_f64())
        .bind(worker_id)
        .bind(lease_id)
        .fetch_optional(self.db.pool())
        .await?;

        row.map(|row| {
            Ok(ClaimedEvent {
                event: Event::try_from(row)?,
                token: ClaimToken {
                    seq,
                    worker_id: worker_id.to_string(),
                    lease_id,
                },
            })
        })
        .transpose()
    }

    async fn complete(&self, token: &ClaimToken) -> Result<bool> {
        self.update_leased(
            r#"
            UPDATE outbox_events
            SET status = 'done', attempt_count = attempt_count + 1, last_error = NULL,
                lease_id = NULL, updated_at = NOW()
            WHERE seq = $1 AND lease_id = $2 AND status = 'claimed'
            "#,
            token,
            LeaseBind::None,
        )
        .await
    }

    async fn retry(&self, token: &ClaimToken, next_visible_at: DateTime<Utc>, error: &str) -> Result<bool> {
        self.update_leased(
            r#"
            UPDATE outbox_events
            SET status = 'pending', attempt_count = attempt_count + 1, next_visible_at = $3,
                last_error = $4, claimed_by = NULL, lease_id = NULL, updated_at = NOW()
            WHERE seq = $1 AND lease_id = $2 AND status = 'claimed'
            "#,
            token,
            LeaseBind::Visible(next_visible_at, error),
        )
        .await
    }

    async fn dead_letter(&self, token: &ClaimToken, error: &str) -> Result<bool> {
        self.update_leased(
            r#"
            UPDATE outbox_events
            SET status = 'dead', attempt_count = attempt_count + 1, last_error = $3,
                lease_id = NULL, updated_at = NOW()
            WHERE seq = $1 AND lease_id = $2 AND status = 'claimed'
            "#,
            token,
            LeaseBind::Error(error),
        )
        .await
    }

    async fn release(&self, token: &ClaimToken, next_visible_at: DateTime<Utc>, reason: &str) -> Result<bool> {
        self.update_leased(
            r#"
            UPDATE outbox_events
            SET status = 'pending', next_visible_at = $3, last_error = $4,
                claimed_by = NULL, lease_id = NULL, updated_at = NOW()
            WHERE seq = $1 AND lease_id = $2 AND status = 'claimed'
            "#,
            token,
            LeaseBind::Visible(next_visible_at, reason),
        )
        .await
    }

    async fn park(&self, token: &ClaimToken, error: &str) -> Result<bool> {
        self.update_leased(
            r#"
            UPDATE outbox_events
            SET status = 'error', last_error = $3, lease_id = NULL, updated_at = NOW()
            WHERE seq = $1 AND lease_id = $2 AND status = 'claimed'
            "#,
            token,
            LeaseBind::Error(error),
        )
        .await
    }

    async fn get(&self, seq: i64) -> Result<Option<Event>> {
        let row = sqlx::query_as::<_, EventRow>(&format!(
            "SELECT {EVENT_COLUMNS} FROM outbox_events WHERE seq = $1"
        ))
        .bind(seq)
        .fetch_optional(self.db.pool())
        .await?;

        row.map(Event::try_from).transpose()
    }

    async fn get_by_idem_key(&self, idem_key: &str) -> Result<Option<Event>> {
        let row = sqlx::query_as::<_, EventRow>(&format!(
            "SELECT {EVENT_COLUMNS} FROM outbox_events WHERE idem_key = $1"
        ))
        .bind(idem_key)
        .fetch_optional(self.db.pool())
        .await?;

        row.map(Event::try_from).transpose()
    }

    async fn list(&self, status: Option<EventStatus>, limit: usize) -> Result<Vec<Event>> {
        let rows = sqlx::query_as::<_, EventRow>(&format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM outbox_events
            WHERE ($1::text IS NULL OR status = $1)
            ORDER BY seq ASC
            LIMIT $2
            "#
        ))
        .bind(status.map(|s| s.as_str()))
        .bind(limit as i64)
        .fetch_all(self.db.pool())
        .await?;

        into_events(rows)
    }

    async fn replay(&self, seq: i64) -> Result<Event> {
        let row = sqlx::query_as::<_, EventRow>(&format!(
            r#"
            UPDATE outbox_events
            SET status = 'pending', attempt_count = 0, next_visible_at = NOW(),
                claimed_by = NULL, lease_id = NULL, updated_at = NOW()
            WHERE seq = $1 AND status IN ('dead', 'error')
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(seq)
        .fetch_optional(self.db.pool())
        .await?;

        match row {
            Some(row) => Event::try_from(row),
            None => match self.get(seq).await? {
                Some(event) => Err(KeelError::invalid_state_transition(
                    seq,
                    event.status,
                    EventStatus::Pending,
                )),
                None => Err(KeelError::event_not_found(seq)),
            },
        }
    }

    async fn purge(&self, status: EventStatus, older_than: Option<DateTime<Utc>>) -> Result<u64> {
        ensure_purgeable(status)?;

        let result = sqlx::query(
            r#"
            DELETE FROM outbox_events
            WHERE status = $1 AND ($2::timestamptz IS NULL OR created_at < $2)
            "#,
        )
        .bind(status.as_str())
        .bind(older_than)
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected())
    }

    async fn counts(&self) -> Result<StatusCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM outbox_events GROUP BY status")
                .fetch_all(self.db.pool())
                .await?;

        let mut counts = StatusCounts::default();
        for (status, n) in rows {
            counts.add(status.parse()?, n.max(0) as u64);
        }
        Ok(counts)
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(self.db.pool()).await?;
        Ok(())
    }
}
