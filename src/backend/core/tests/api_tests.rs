//! HTTP surface exercised through the full router.
//!
//! Tests cover:
//! - Write endpoint: accept, dedup, governor and budget rejections, outages
//! - Direct writes with degraded fallback
//! - Admin list, get, replay, purge and breaker reset
//! - Status, health, metrics and saga lookups

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    response::Response,
    Router,
};
use keel_core::api::{build_router, ApiResponse, AppState};
use keel_core::config::Config;
use keel_core::dispatch::{handler_fn, HandlerError, HandlerRegistry, IdempotentSink, RetryPolicy};
use keel_core::outbox::{EventStatus, EventStore, InMemoryEventStore};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

struct TestApp {
    router: Router,
    state: AppState,
    store: Arc<InMemoryEventStore>,
    sink: Arc<IdempotentSink>,
}

fn test_app() -> TestApp {
    let store = Arc::new(InMemoryEventStore::new());
    let sink = Arc::new(IdempotentSink::new("journal"));

    let mut handlers = HandlerRegistry::new();
    handlers.register("journal.append", None, sink.clone()).unwrap();
    handlers
        .register("vector.upsert", Some("vector_store"), sink.clone())
        .unwrap();
    handlers
        .register(
            "belief.update",
            Some("belief_processor"),
            handler_fn(|_, _, _| async { Err(HandlerError::permanent("belief rejected")) }),
        )
        .unwrap();

    let state = AppState::new(store.clone(), handlers, &Config::default()).unwrap();
    TestApp {
        router: build_router(state.clone()),
        state,
        store,
        sink,
    }
}

fn write(path: &str, key: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(path)
        .header("content-type", "application/json")
        .header("X-Correlation-ID", "corr-1")
        .header("Idempotency-Key", key)
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn admin(method: Method, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn send(app: &TestApp, request: Request<Body>) -> (StatusCode, Value) {
    let response: Response = app.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

async fn dead_event(app: &TestApp) -> i64 {
    let (_, body) = send(
        app,
        write("/v1/events", "belief-1", json!({"kind": "belief.update", "payload": {"b": 1}})),
    )
    .await;
    let dispatcher = app
        .state
        .dispatcher(&Config::default().dispatcher)
        .with_policy(RetryPolicy::immediate(3));
    dispatcher.tick().await.unwrap();
    body["event_id"].as_i64().unwrap()
}

// ============================================================================
// ApiResponse
// ============================================================================

#[test]
fn test_api_response_shapes() {
    let ok = serde_json::to_value(ApiResponse::success(json!({"n": 1}))).unwrap();
    assert_eq!(ok, json!({"success": true, "data": {"n": 1}}));

    let err = serde_json::to_value(ApiResponse::<()>::error("nope")).unwrap();
    assert_eq!(err, json!({"success": false, "error": "nope"}));
}

// ============================================================================
// Writes
// ============================================================================

#[tokio::test]
async fn test_submit_accepts_and_deduplicates() {
    let app = test_app();
    let body = json!({"kind": "journal.append", "payload": {"x": 1}});

    let (status, first) = send(&app, write("/v1/events", "abc", body.clone())).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(first["idem_key"], "abc");
    assert_eq!(first["status"], "pending");
    assert_eq!(first["created"], true);

    let (status, second) = send(&app, write("/v1/events", "abc", body)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(second["event_id"], first["event_id"]);
    assert_eq!(second["created"], false);

    assert_eq!(app.store.counts().await.unwrap().total(), 1);
}

#[tokio::test]
async fn test_concurrent_submissions_share_event_id() {
    let app = test_app();
    let body = json!({"kind": "journal.append", "payload": {"x": 1}});

    let (a, b) = tokio::join!(
        send(&app, write("/v1/events", "abc", body.clone())),
        send(&app, write("/v1/events", "abc", body.clone())),
    );

    assert_eq!(a.0, StatusCode::ACCEPTED);
    assert_eq!(b.0, StatusCode::ACCEPTED);
    assert_eq!(a.1["event_id"], b.1["event_id"]);
    assert_eq!(app.store.counts().await.unwrap().total(), 1);
}

#[tokio::test]
async fn test_missing_headers_rejected_in_strict_mode() {
    let app = test_app();
    let request = Request::builder()
        .method(Method::POST)
        .uri("/v1/events")
        .header("content-type", "application/json")
        .body(Body::from(json!({"kind": "journal.append", "payload": {}}).to_string()))
        .unwrap();

    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "missing_header");
    assert_eq!(app.store.counts().await.unwrap().total(), 0);
}

#[tokio::test]
async fn test_budget_rejection_has_no_effect() {
    let app = test_app();
    let (status, body) = send(
        &app,
        write(
            "/v1/events",
            "abc",
            json!({"kind": "journal.append", "payload": {}, "tokens": 1_000_000}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "budget_exceeded");
    assert_eq!(body["retry_after_sec"], 1);
    assert_eq!(app.store.counts().await.unwrap().total(), 0);
    assert_eq!(app.state.admission.snapshot().tokens_rejected, 1);
}

#[tokio::test]
async fn test_unknown_kind_rejected() {
    let app = test_app();
    let (status, body) = send(
        &app,
        write("/v1/events", "abc", json!({"kind": "mystery", "payload": {}})),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "unknown_event_kind");
}

#[tokio::test]
async fn test_store_outage_returns_503() {
    let app = test_app();
    app.store.set_unavailable(true);

    let (status, body) = send(
        &app,
        write("/v1/events", "abc", json!({"kind": "journal.append", "payload": {}})),
    )
    .await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "event_store_unavailable");
}

#[tokio::test]
async fn test_direct_write_applies_then_defers_when_degraded() {
    let app = test_app();

    let (status, body) = send(
        &app,
        write("/v1/writes/direct", "d1", json!({"kind": "vector.upsert", "payload": {"v": 1}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["applied"], true);
    assert!(app.sink.get("d1").is_some());

    app.state.degraded.breaker_opened("vector_store");
    let (status, body) = send(
        &app,
        write("/v1/writes/direct", "d2", json!({"kind": "vector.upsert", "payload": {"v": 2}})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["deferred"], true);
    assert_eq!(body["idem_key"], "d2");
    assert!(app.sink.get("d2").is_none());
    assert_eq!(app.store.counts().await.unwrap().pending, 1);
}

// ============================================================================
// Admin
// ============================================================================

#[tokio::test]
async fn test_list_get_and_replay_dead_event() {
    let app = test_app();
    let seq = dead_event(&app).await;

    let (status, body) = send(&app, admin(Method::GET, "/v1/admin/events?status=dead")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"][0]["seq"], seq);
    assert_eq!(body["data"][0]["status"], "dead");

    let (status, body) = send(&app, admin(Method::GET, &format!("/v1/admin/events/{}", seq))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["attempt_count"], 1);

    let (status, body) = send(
        &app,
        admin(Method::POST, &format!("/v1/admin/events/{}/replay", seq)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "pending");
    assert_eq!(body["data"]["attempt_count"], 0);

    // Replaying a pending event is a conflict
    let (status, _) = send(
        &app,
        admin(Method::POST, &format!("/v1/admin/events/{}/replay", seq)),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_admin_errors() {
    let app = test_app();

    let (status, body) = send(&app, admin(Method::GET, "/v1/admin/events/42")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "event_not_found");

    let (status, _) = send(&app, admin(Method::GET, "/v1/admin/events?status=bogus")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_purge_terminal_events_only() {
    let app = test_app();
    let seq = dead_event(&app).await;
    send(
        &app,
        write("/v1/events", "live", json!({"kind": "journal.append", "payload": {}})),
    )
    .await;

    let (status, _) = send(&app, admin(Method::DELETE, "/v1/admin/events?status=pending")).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = send(&app, admin(Method::DELETE, "/v1/admin/events?status=dead")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["purged"], 1);
    assert!(app.store.get(seq).await.unwrap().is_none());
    assert_eq!(
        app.store.list(Some(EventStatus::Pending), 10).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn test_purge_rejects_out_of_range_age() {
    let app = test_app();
    let seq = dead_event(&app).await;

    for age in ["10000000000000", "18446744073709551615"] {
        let uri = format!("/v1/admin/events?status=dead&older_than_secs={}", age);
        let (status, body) = send(&app, admin(Method::DELETE, &uri)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "validation_error");
    }
    assert!(app.store.get(seq).await.unwrap().is_some());

    let (status, body) = send(
        &app,
        admin(Method::DELETE, "/v1/admin/events?status=dead&older_than_secs=0"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["purged"], 1);
}

#[tokio::test]
async fn test_breaker_list_and_reset() {
    let app = test_app();
    let breaker = app.state.breakers.get("vector_store").unwrap();
    for _ in 0..breaker.settings().fails {
        breaker.record_failure();
    }

    let (_, body) = send(&app, admin(Method::GET, "/v1/admin/breakers")).await;
    let open: Vec<&Value> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|b| b["state"] == "open")
        .collect();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0]["dependency"], "vector_store");

    let (status, body) = send(
        &app,
        admin(Method::POST, "/v1/admin/breakers/vector_store/reset"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["state"], "closed");

    let (status, _) = send(&app, admin(Method::POST, "/v1/admin/breakers/nope/reset")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ============================================================================
// Status, Health, Metrics, Sagas
// ============================================================================

#[tokio::test]
async fn test_status_snapshot() {
    let app = test_app();
    dead_event(&app).await;

    let (status, body) = send(&app, admin(Method::GET, "/status")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["store_available"], true);
    assert_eq!(body["events"]["dead"], 1);
    assert_eq!(body["degraded"]["active"], false);
    assert_eq!(body["governor_mode"], "strict");
    assert_eq!(body["breakers"].as_array().unwrap().len(), 2);
    assert_eq!(body["admission"]["turns_admitted"], 1);

    app.store.set_unavailable(true);
    let (status, body) = send(&app, admin(Method::GET, "/status")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["store_available"], false);
    assert!(body["events"].is_null());
}

#[tokio::test]
async fn test_health_and_metrics() {
    let app = test_app();

    let (status, body) = send(&app, admin(Method::GET, "/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["store"], "up");

    let response = app
        .router
        .clone()
        .oneshot(admin(Method::GET, "/metrics"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_saga_records_by_correlation_id() {
    let app = test_app();
    let seq = dead_event(&app).await;

    let (status, body) = send(&app, admin(Method::GET, "/v1/sagas/corr-1")).await;
    assert_eq!(status, StatusCode::OK);

    let sagas = body["data"].as_array().unwrap();
    assert_eq!(sagas.len(), 1);
    assert_eq!(sagas[0]["saga_name"], format!("belief.update#{}", seq));
    assert_eq!(sagas[0]["steps"][0]["name"], "append");
    assert_eq!(sagas[0]["ended_ok"], false);

    let (_, body) = send(&app, admin(Method::GET, "/v1/sagas/unknown")).await;
    assert!(body["data"].as_array().unwrap().is_empty());
}
