//! API request handlers.
//!
//! Handlers return `Result<impl IntoResponse, KeelError>`; the error's
//! `IntoResponse` picks the status code and wire shape.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};

use super::{ApiResponse, AppState};
use crate::budget::AdmissionSnapshot;
use crate::config::GovernorMode;
use crate::db::PoolStats;
use crate::dispatch::DispatcherStatsSnapshot;
use crate::error::{KeelError, Result};
use crate::ingest::{DirectOutcome, WriteRequest};
use crate::middleware::{GovernorSnapshot, WriteContext};
use crate::observability::KeelEvent;
use crate::outbox::{EventStatus, StatusCounts};
use crate::resilience::{BreakerSnapshot, DegradedSnapshot};
use crate::saga::SagaSnapshot;

const DEFAULT_LIST_LIMIT: usize = 100;
const MAX_LIST_LIMIT: usize = 1000;

// ═══════════════════════════════════════════════════════════════════════════════
// Health & Status
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let store = match state.store.ping().await {
        Ok(()) => "up",
        Err(_) => "down",
    };
    Json(serde_json::json!({
        "status": "healthy",
        "store": store,
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: String,
    pub uptime_secs: i64,
    pub store_available: bool,
    /// `None` when the store could not be reached
    pub events: Option<StatusCounts>,
    pub degraded: DegradedSnapshot,
    pub breakers: Vec<BreakerSnapshot>,
    pub dispatcher: Option<DispatcherStatsSnapshot>,
    pub admission: AdmissionSnapshot,
    pub governor_mode: GovernorMode,
    pub governor: GovernorSnapshot,
    pub sagas: SagaSnapshot,
    pub pool: Option<PoolStats>,
}

pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let events = match state.store.counts().await {
        Ok(counts) => Some(counts),
        Err(error) => {
            error.log();
            None
        }
    };

    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: (chrono::Utc::now() - state.started_at).num_seconds(),
        store_available: events.is_some(),
        events,
        degraded: state.degraded.snapshot(),
        breakers: state.breakers.snapshots(),
        dispatcher: state.dispatcher_stats.as_ref().map(|stats| stats.snapshot()),
        admission: state.admission.snapshot(),
        governor_mode: state.governor.mode,
        governor: state.governor_stats.snapshot(),
        sagas: state.sagas.snapshot(),
        pool: state.database.as_ref().map(|db| db.pool_stats()),
    })
}

pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = state
        .metrics
        .as_ref()
        .map(|handle| handle.render())
        .unwrap_or_default();

    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

// ═══════════════════════════════════════════════════════════════════════════════
// Writes
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
pub struct SubmitEventBody {
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Tokens charged against the request's turn budget
    #[serde(default)]
    pub tokens: u64,
}

impl SubmitEventBody {
    fn into_request(self, ctx: WriteContext) -> WriteRequest {
        WriteRequest {
            kind: self.kind,
            payload: self.payload,
            idem_key: ctx.idempotency_key,
            correlation_id: ctx.correlation_id,
            tokens: self.tokens,
        }
    }
}

pub async fn submit_event(
    State(state): State<AppState>,
    ctx: WriteContext,
    Json(body): Json<SubmitEventBody>,
) -> Result<impl IntoResponse> {
    let receipt = state.writes.enqueue(body.into_request(ctx)).await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

pub async fn write_direct(
    State(state): State<AppState>,
    ctx: WriteContext,
    Json(body): Json<SubmitEventBody>,
) -> Result<impl IntoResponse> {
    let response = match state.writes.write_direct(body.into_request(ctx)).await? {
        DirectOutcome::Applied { idem_key } => (
            StatusCode::OK,
            Json(serde_json::json!({
                "applied": true,
                "deferred": false,
                "idem_key": idem_key,
            })),
        ),
        DirectOutcome::Deferred { receipt, reason } => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "applied": false,
                "deferred": true,
                "event_id": receipt.event_id,
                "idem_key": receipt.idem_key,
                "status": receipt.status,
                "reason": reason,
            })),
        ),
    };
    Ok(response)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Admin
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

fn parse_status(status: Option<&str>) -> Result<Option<EventStatus>> {
    status.map(str::parse).transpose()
}

pub async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse> {
    let status = parse_status(query.status.as_deref())?;
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    let events = state.store.list(status, limit).await?;
    Ok(Json(ApiResponse::success(events)))
}

pub async fn get_event(
    State(state): State<AppState>,
    Path(seq): Path<i64>,
) -> Result<impl IntoResponse> {
    let event = state
        .store
        .get(seq)
        .await?
        .ok_or_else(|| KeelError::event_not_found(seq))?;
    Ok(Json(ApiResponse::success(event)))
}

pub async fn replay_event(
    State(state): State<AppState>,
    Path(seq): Path<i64>,
) -> Result<impl IntoResponse> {
    let event = state.store.replay(seq).await?;
    KeelEvent::EventReplayed { seq }.log();
    Ok(Json(ApiResponse::success(event)))
}

#[derive(Debug, Deserialize)]
pub struct PurgeQuery {
    pub status: String,
    pub older_than_secs: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PurgeResponse {
    pub status: EventStatus,
    pub purged: u64,
}

pub async fn purge_events(
    State(state): State<AppState>,
    Query(query): Query<PurgeQuery>,
) -> Result<impl IntoResponse> {
    let status: EventStatus = query.status.parse()?;
    let cutoff = query.older_than_secs.map(purge_cutoff).transpose()?;

    let purged = state.store.purge(status, cutoff).await?;
    tracing::info!(status = %status, purged, "Events purged");
    Ok(Json(ApiResponse::success(PurgeResponse { status, purged })))
}

fn purge_cutoff(older_than_secs: u64) -> Result<chrono::DateTime<chrono::Utc>> {
    i64::try_from(older_than_secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .and_then(|age| chrono::Utc::now().checked_sub_signed(age))
        .ok_or_else(|| KeelError::validation("older_than_secs is out of range"))
}

pub async fn list_breakers(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(state.breakers.snapshots()))
}

pub async fn reset_breaker(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse> {
    let snapshot = state.breakers.reset(&name)?;
    Ok(Json(ApiResponse::success(snapshot)))
}

pub async fn get_sagas(
    State(state): State<AppState>,
    Path(correlation_id): Path<String>,
) -> impl IntoResponse {
    Json(ApiResponse::success(state.sagas.get(&correlation_id)))
}
