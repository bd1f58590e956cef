//! Observability: Distributed Tracing, Metrics, and Logging.

use crate::config::ObservabilityConfig;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry_otlp::WithExportConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the observability stack.
///
/// `RUST_LOG` wins over the configured level when set.
pub fn init(service_name: &str, config: &ObservabilityConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    let json_layer = config
        .json_logging
        .then(|| tracing_subscriber::fmt::layer().json());
    let pretty_layer = (!config.json_logging).then(|| tracing_subscriber::fmt::layer().pretty());

    // Set up OpenTelemetry tracing if endpoint is provided
    let telemetry_layer = match config.otlp_endpoint.as_deref() {
        Some(endpoint) => {
            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(
                    opentelemetry_otlp::new_exporter()
                        .tonic()
                        .with_endpoint(endpoint),
                )
                .with_trace_config(
                    opentelemetry_sdk::trace::config()
                        .with_resource(opentelemetry_sdk::Resource::new(vec![
                            opentelemetry::KeyValue::new("service.name", service_name.to_string()),
                        ])),
                )
                .install_batch(opentelemetry_sdk::runtime::Tokio)?;
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(telemetry_layer)
        .with(json_layer)
        .with(pretty_layer)
        .try_init()?;

    metrics::register_metrics();
    Ok(())
}

/// Install the Prometheus recorder and return the handle that renders `/metrics`.
pub fn install_prometheus() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(handle)
}

/// Shutdown OpenTelemetry.
pub fn shutdown() {
    opentelemetry::global::shutdown_tracer_provider();
}

/// Metrics registry and helpers.
pub mod metrics {
    use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

    /// Register all metric descriptions.
    pub fn register_metrics() {
        // Counters
        describe_counter!(
            "keel_events_appended_total",
            "Events durably appended to the outbox"
        );
        describe_counter!(
            "keel_events_deduplicated_total",
            "Appends answered from an existing idempotency key"
        );
        describe_counter!(
            "keel_events_dispatched_total",
            "Handler invocations by kind and outcome"
        );
        describe_counter!(
            "keel_events_dead_total",
            "Events moved to the dead-letter state"
        );
        describe_counter!(
            "keel_breaker_transitions_total",
            "Circuit breaker state transitions"
        );
        describe_counter!(
            "keel_budget_exceeded_total",
            "Operations rejected by a turn budget"
        );
        describe_counter!(
            "keel_governor_violations_total",
            "Requests missing a correlation or idempotency header"
        );
        describe_counter!(
            "keel_saga_steps_total",
            "Saga steps recorded, by saga kind"
        );
        describe_counter!(
            "keel_errors_total",
            "Errors constructed, by code and category"
        );

        // Gauges
        describe_gauge!(
            "keel_breaker_state",
            "Breaker state per dependency (0 closed, 1 half-open, 2 open)"
        );
        describe_gauge!(
            "keel_degraded",
            "1 while degraded mode is active"
        );

        // Histograms
        describe_histogram!(
            "keel_handler_latency_seconds",
            "Handler invocation latency in seconds"
        );
    }

    pub fn record_appended(kind: &str) {
        counter!("keel_events_appended_total", "kind" => kind.to_string()).increment(1);
    }

    pub fn record_deduplicated(kind: &str) {
        counter!("keel_events_deduplicated_total", "kind" => kind.to_string()).increment(1);
    }

    /// Record one handler invocation.
    pub fn record_dispatch(kind: &str, outcome: &'static str, latency_secs: f64) {
        counter!(
            "keel_events_dispatched_total",
            "kind" => kind.to_string(),
            "outcome" => outcome,
        )
        .increment(1);
        histogram!("keel_handler_latency_seconds", "kind" => kind.to_string()).record(latency_secs);
    }

    pub fn record_dead(kind: &str) {
        counter!("keel_events_dead_total", "kind" => kind.to_string()).increment(1);
    }

    pub fn record_breaker_transition(dependency: &str, to: &'static str, level: f64) {
        counter!(
            "keel_breaker_transitions_total",
            "dependency" => dependency.to_string(),
            "to" => to,
        )
        .increment(1);
        gauge!("keel_breaker_state", "dependency" => dependency.to_string()).set(level);
    }

    pub fn set_degraded(active: bool) {
        gauge!("keel_degraded").set(if active { 1.0 } else { 0.0 });
    }

    pub fn record_budget_exceeded(resource: &'static str) {
        counter!("keel_budget_exceeded_total", "resource" => resource).increment(1);
    }

    pub fn record_governor_violation(header: &str) {
        counter!("keel_governor_violations_total", "header" => header.to_string()).increment(1);
    }

    /// `saga_kind` must be bounded; pass the kind, not a per-event saga name.
    pub fn record_saga_step(saga_kind: &str, ok: bool) {
        counter!(
            "keel_saga_steps_total",
            "saga_kind" => saga_kind.to_string(),
            "ok" => if ok { "true" } else { "false" },
        )
        .increment(1);
    }
}

/// Structured event types for logging.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "event_type")]
pub enum KeelEvent {
    EventAppended {
        seq: i64,
        kind: String,
        idem_key: String,
        correlation_id: String,
    },
    EventDeadLettered {
        seq: i64,
        kind: String,
        idem_key: String,
        attempt_count: u32,
        error: String,
    },
    EventReplayed {
        seq: i64,
    },
    BreakerOpened {
        dependency: String,
        consecutive_failures: u32,
    },
    BreakerHalfOpened {
        dependency: String,
    },
    BreakerClosed {
        dependency: String,
    },
    DegradedActivated {
        dependency: String,
    },
    DegradedCleared {
        consecutive_successes: u32,
    },
    BudgetExceeded {
        turn_id: String,
        resource: String,
        requested: u64,
        limit: u64,
    },
    GovernorViolation {
        header: String,
        path: String,
        synthesized: bool,
    },
    SagaBegan {
        correlation_id: String,
        saga: String,
    },
    SagaStep {
        correlation_id: String,
        saga: String,
        step: String,
        ok: bool,
    },
    SagaEnded {
        correlation_id: String,
        saga: String,
        ok: bool,
        summary: Option<String>,
    },
}

impl KeelEvent {
    /// Log this event.
    pub fn log(&self) {
        match self {
            KeelEvent::EventAppended { seq, kind, idem_key, correlation_id } => {
                tracing::debug!(
                    seq = %seq,
                    kind = %kind,
                    idem_key = %idem_key,
                    correlation_id = %correlation_id,
                    "Event appended"
                );
            }
            KeelEvent::EventDeadLettered { seq, kind, idem_key, attempt_count, error } => {
                tracing::error!(
                    seq = %seq,
                    kind = %kind,
                    idem_key = %idem_key,
                    attempt_count = %attempt_count,
                    error = %error,
                    "Event dead-lettered"
                );
            }
            KeelEvent::EventReplayed { seq } => {
                tracing::info!(seq = %seq, "Event replayed");
            }
            KeelEvent::BreakerOpened { dependency, consecutive_failures } => {
                tracing::warn!(
                    dependency = %dependency,
                    consecutive_failures = %consecutive_failures,
                    "Circuit breaker opened"
                );
            }
            KeelEvent::BreakerHalfOpened { dependency } => {
                tracing::info!(dependency = %dependency, "Circuit breaker half-open");
            }
            KeelEvent::BreakerClosed { dependency } => {
                tracing::info!(dependency = %dependency, "Circuit breaker closed");
            }
            KeelEvent::DegradedActivated { dependency } => {
                tracing::warn!(dependency = %dependency, "Degraded mode activated");
            }
            KeelEvent::DegradedCleared { consecutive_successes } => {
                tracing::info!(
                    consecutive_successes = %consecutive_successes,
                    "Degraded mode cleared"
                );
            }
            KeelEvent::BudgetExceeded { turn_id, resource, requested, limit } => {
                tracing::warn!(
                    turn_id = %turn_id,
                    resource = %resource,
                    requested = %requested,
                    limit = %limit,
                    "Turn budget exceeded"
                );
            }
            KeelEvent::GovernorViolation { header, path, synthesized } => {
                tracing::warn!(
                    header = %header,
                    path = %path,
                    synthesized = %synthesized,
                    "Governor header violation"
                );
            }
            KeelEvent::SagaBegan { correlation_id, saga } => {
                tracing::info!(correlation_id = %correlation_id, saga = %saga, "Saga began");
            }
            KeelEvent::SagaStep { correlation_id, saga, step, ok } => {
                tracing::debug!(
                    correlation_id = %correlation_id,
                    saga = %saga,
                    step = %step,
                    ok = %ok,
                    "Saga step"
                );
            }
            KeelEvent::SagaEnded { correlation_id, saga, ok, summary } => {
                tracing::info!(
                    correlation_id = %correlation_id,
                    saga = %saga,
                    ok = %ok,
                    summary = ?summary,
                    "Saga ended"
                );
            }
        }
    }
}
