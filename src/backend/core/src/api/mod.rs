//! HTTP surface for Keel.
//!
//! Write routes (`/v1/events`, `/v1/writes/*`) sit behind the governor layer.
//! Admin, status, health and metrics routes do not.

mod handlers;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::budget::{AdmissionCounters, BudgetLimits};
use crate::config::{Config, DispatcherConfig, GovernorConfig};
use crate::db::Database;
use crate::dispatch::{Dispatcher, DispatcherStats, HandlerRegistry};
use crate::error::Result;
use crate::ingest::WritePath;
use crate::middleware::{GovernorLayer, GovernorStats};
use crate::outbox::EventStore;
use crate::resilience::{BreakerObserver, BreakerRegistry, DegradedMode};
use crate::saga::SagaRecorder;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn EventStore>,
    pub handlers: Arc<HandlerRegistry>,
    pub writes: Arc<WritePath>,
    pub breakers: Arc<BreakerRegistry>,
    pub degraded: Arc<DegradedMode>,
    pub sagas: Arc<SagaRecorder>,
    pub admission: Arc<AdmissionCounters>,
    pub governor: GovernorConfig,
    pub governor_stats: Arc<GovernorStats>,
    pub dispatcher_stats: Option<DispatcherStats>,
    pub metrics: Option<PrometheusHandle>,
    pub database: Option<Database>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Wire breakers, degraded mode, sagas and the write path around `store`.
    ///
    /// Fails if a handler names a dependency without a configured breaker.
    pub fn new(store: Arc<dyn EventStore>, handlers: HandlerRegistry, config: &Config) -> Result<Self> {
        let degraded = Arc::new(DegradedMode::new(config.degraded.recovery_successes));
        let observer: Arc<dyn BreakerObserver> = degraded.clone();
        let breakers = Arc::new(BreakerRegistry::from_config(&config.breakers, Some(observer)));
        handlers.validate(&breakers)?;

        let handlers = Arc::new(handlers);
        let sagas = Arc::new(SagaRecorder::new(config.saga.max_sagas));
        let admission = Arc::new(AdmissionCounters::new());
        let writes = Arc::new(WritePath::new(
            store.clone(),
            handlers.clone(),
            breakers.clone(),
            degraded.clone(),
            sagas.clone(),
            BudgetLimits::from(&config.budget),
            admission.clone(),
            config.dispatcher.handler_timeout,
        ));

        Ok(Self {
            store,
            handlers,
            writes,
            breakers,
            degraded,
            sagas,
            admission,
            governor: config.governor.clone(),
            governor_stats: Arc::new(GovernorStats::new()),
            dispatcher_stats: None,
            metrics: None,
            database: None,
            started_at: Utc::now(),
        })
    }

    /// A dispatcher sharing this state's store, handlers, breakers and sagas.
    pub fn dispatcher(&self, config: &DispatcherConfig) -> Dispatcher {
        Dispatcher::new(
            self.store.clone(),
            self.handlers.clone(),
            self.breakers.clone(),
            config,
        )
        .with_saga_recorder(self.sagas.clone())
    }

    pub fn with_dispatcher_stats(mut self, stats: DispatcherStats) -> Self {
        self.dispatcher_stats = Some(stats);
        self
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    pub fn with_database(mut self, database: Database) -> Self {
        self.database = Some(database);
        self
    }
}

/// Build the API router.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let governor = GovernorLayer::with_stats(state.governor.clone(), state.governor_stats.clone());

    let writes = Router::new()
        .route("/v1/events", post(handlers::submit_event))
        .route("/v1/writes/direct", post(handlers::write_direct))
        .layer(governor);

    let admin = Router::new()
        .route(
            "/v1/admin/events",
            get(handlers::list_events).delete(handlers::purge_events),
        )
        .route("/v1/admin/events/:seq", get(handlers::get_event))
        .route("/v1/admin/events/:seq/replay", post(handlers::replay_event))
        .route("/v1/admin/breakers", get(handlers::list_breakers))
        .route("/v1/admin/breakers/:name/reset", post(handlers::reset_breaker))
        .route("/v1/sagas/:correlation_id", get(handlers::get_sagas));

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/status", get(handlers::status))
        .route("/metrics", get(handlers::prometheus_metrics))
        .merge(writes)
        .merge(admin)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Envelope for admin responses.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}
