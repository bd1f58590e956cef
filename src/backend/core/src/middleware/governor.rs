//! Correlation-id and idempotency-key enforcement for write routes.
//!
//! Strict mode rejects a request missing either header with
//! `400 {"error":"missing_header"}`. Soft mode fills the gaps: a UUIDv4
//! correlation id, and an idempotency key derived from the request so that
//! a client retry of the same body under the same correlation id maps to
//! the same event.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::{
    async_trait,
    body::{Body, Bytes},
    extract::{FromRequestParts, Request},
    http::{request::Parts, HeaderMap, HeaderName, HeaderValue},
    response::{IntoResponse, Response},
};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tower::{Layer, Service};
use uuid::Uuid;

use crate::config::{GovernorConfig, GovernorMode};
use crate::error::KeelError;
use crate::observability::{metrics, KeelEvent};

/// Largest body buffered for key synthesis.
pub const MAX_SYNTHESIS_BODY_BYTES: usize = 2 * 1024 * 1024;

const MAX_HEADER_LEN: usize = 256;

// ═══════════════════════════════════════════════════════════════════════════════
// Write Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Identifiers attached to every request that passed the governor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteContext {
    pub correlation_id: String,
    /// Used verbatim as the event store `idem_key`
    pub idempotency_key: String,
    pub correlation_synthesized: bool,
    pub idempotency_synthesized: bool,
}

#[async_trait]
impl<S> FromRequestParts<S> for WriteContext
where
    S: Send + Sync,
{
    type Rejection = KeelError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<WriteContext>()
            .cloned()
            .ok_or_else(|| KeelError::internal("write route is missing the governor layer"))
    }
}

/// Deterministic key for a request that arrived without one.
pub fn synthesize_idempotency_key(method: &str, path: &str, correlation_id: &str, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update(b"\n");
    hasher.update(path.as_bytes());
    hasher.update(b"\n");
    hasher.update(correlation_id.as_bytes());
    hasher.update(b"\n");
    hasher.update(body);
    hex::encode(hasher.finalize())
}

enum HeaderCheck {
    Present(String),
    Missing,
    Invalid(&'static str),
}

fn check_header(headers: &HeaderMap, name: &str) -> HeaderCheck {
    let Some(value) = headers.get(name) else {
        return HeaderCheck::Missing;
    };
    let Ok(value) = value.to_str() else {
        return HeaderCheck::Invalid("not visible ASCII");
    };
    let value = value.trim();
    if value.is_empty() {
        HeaderCheck::Missing
    } else if value.len() > MAX_HEADER_LEN {
        HeaderCheck::Invalid("longer than 256 bytes")
    } else {
        HeaderCheck::Present(value.to_string())
    }
}

/// Violation counters shared between the layer and the status endpoint.
#[derive(Debug, Default)]
pub struct GovernorStats {
    rejected: AtomicU64,
    synthesized: AtomicU64,
}

impl GovernorStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> GovernorSnapshot {
        GovernorSnapshot {
            rejected: self.rejected.load(Ordering::Relaxed),
            synthesized: self.synthesized.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GovernorSnapshot {
    /// Requests refused in strict mode
    pub rejected: u64,
    /// Headers filled in by soft mode
    pub synthesized: u64,
}

fn violation(stats: &GovernorStats, header: &str, path: &str, synthesized: bool) {
    let counter = if synthesized {
        &stats.synthesized
    } else {
        &stats.rejected
    };
    counter.fetch_add(1, Ordering::Relaxed);
    metrics::record_governor_violation(header);
    KeelEvent::GovernorViolation {
        header: header.to_string(),
        path: path.to_string(),
        synthesized,
    }
    .log();
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tower Layer and Service
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct GovernorLayer {
    config: Arc<GovernorConfig>,
    stats: Arc<GovernorStats>,
}

impl GovernorLayer {
    pub fn new(config: GovernorConfig) -> Self {
        Self::with_stats(config, Arc::new(GovernorStats::new()))
    }

    /// Report violations into `stats`.
    pub fn with_stats(config: GovernorConfig, stats: Arc<GovernorStats>) -> Self {
        Self {
            config: Arc::new(config),
            stats,
        }
    }

    pub fn stats(&self) -> Arc<GovernorStats> {
        self.stats.clone()
    }

    pub fn strict() -> Self {
        Self::new(GovernorConfig {
            mode: GovernorMode::Strict,
            ..GovernorConfig::default()
        })
    }

    pub fn soft() -> Self {
        Self::new(GovernorConfig {
            mode: GovernorMode::Soft,
            ..GovernorConfig::default()
        })
    }
}

impl Default for GovernorLayer {
    fn default() -> Self {
        Self::new(GovernorConfig::default())
    }
}

impl<S> Layer<S> for GovernorLayer {
    type Service = GovernorService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        GovernorService {
            inner,
            config: self.config.clone(),
            stats: self.stats.clone(),
        }
    }
}

#[derive(Clone)]
pub struct GovernorService<S> {
    inner: S,
    config: Arc<GovernorConfig>,
    stats: Arc<GovernorStats>,
}

impl<S> Service<Request<Body>> for GovernorService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let config = self.config.clone();
        let stats = self.stats.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let request = match govern(&config, &stats, request).await {
                Ok(request) => request,
                Err(error) => return Ok(error.into_response()),
            };

            let (correlation_id, idempotency_key) = request
                .extensions()
                .get::<WriteContext>()
                .map(|ctx| (ctx.correlation_id.clone(), ctx.idempotency_key.clone()))
                .unwrap_or_default();

            let mut response = inner.call(request).await?;
            echo_header(&mut response, &config.correlation_header, &correlation_id);
            echo_header(&mut response, &config.idempotency_header, &idempotency_key);
            Ok(response)
        })
    }
}

fn echo_header(response: &mut Response, name: &str, value: &str) {
    if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
        response.headers_mut().insert(name, value);
    }
}

/// Validate or synthesize the identifiers and attach a `WriteContext`.
async fn govern(
    config: &GovernorConfig,
    stats: &GovernorStats,
    request: Request<Body>,
) -> Result<Request<Body>, KeelError> {
    let path = request.uri().path().to_string();
    let correlation = check_header(request.headers(), &config.correlation_header);
    let idempotency = check_header(request.headers(), &config.idempotency_header);

    match config.mode {
        GovernorMode::Strict => {
            let correlation_id = require(stats, correlation, &config.correlation_header, &path)?;
            let idempotency_key = require(stats, idempotency, &config.idempotency_header, &path)?;
            let mut request = request;
            request.extensions_mut().insert(WriteContext {
                correlation_id,
                idempotency_key,
                correlation_synthesized: false,
                idempotency_synthesized: false,
            });
            Ok(request)
        }
        GovernorMode::Soft => {
            let (correlation_id, correlation_synthesized) = match correlation {
                HeaderCheck::Present(value) => (value, false),
                _ => {
                    violation(stats, &config.correlation_header, &path, true);
                    (Uuid::new_v4().to_string(), true)
                }
            };

            let (mut request, idempotency_key, idempotency_synthesized) = match idempotency {
                HeaderCheck::Present(value) => (request, value, false),
                _ => {
                    violation(stats, &config.idempotency_header, &path, true);
                    let (parts, body) = request.into_parts();
                    let bytes = buffer(body).await?;
                    let key = synthesize_idempotency_key(
                        parts.method.as_str(),
                        &path,
                        &correlation_id,
                        &bytes,
                    );
                    (Request::from_parts(parts, Body::from(bytes)), key, true)
                }
            };

            insert_header(&mut request, &config.correlation_header, &correlation_id);
            insert_header(&mut request, &config.idempotency_header, &idempotency_key);
            request.extensions_mut().insert(WriteContext {
                correlation_id,
                idempotency_key,
                correlation_synthesized,
                idempotency_synthesized,
            });
            Ok(request)
        }
    }
}

fn require(
    stats: &GovernorStats,
    check: HeaderCheck,
    header: &str,
    path: &str,
) -> Result<String, KeelError> {
    match check {
        HeaderCheck::Present(value) => Ok(value),
        HeaderCheck::Missing => {
            violation(stats, header, path, false);
            Err(KeelError::missing_header(header))
        }
        HeaderCheck::Invalid(reason) => {
            violation(stats, header, path, false);
            Err(KeelError::invalid_header(header, reason))
        }
    }
}

async fn buffer(body: Body) -> Result<Bytes, KeelError> {
    axum::body::to_bytes(body, MAX_SYNTHESIS_BODY_BYTES)
        .await
        .map_err(|e| KeelError::validation("request body could not be read").with_source(e))
}

fn insert_header(request: &mut Request<Body>, name: &str, value: &str) {
    if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
        request.headers_mut().insert(name, value);
    }
}
