//! Side-effect handlers and the registry that maps event kinds to them.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, KeelError, Result};
use crate::resilience::BreakerRegistry;

// ═══════════════════════════════════════════════════════════════════════════════
// Handler Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Failure reported by a handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerError {
    /// Error message
    pub message: String,
    /// Whether the event should be retried
    pub retryable: bool,
    /// Optional error code
    pub code: Option<String>,
}

impl HandlerError {
    /// Downstream timeout or network failure. Retried with backoff.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            code: Some(ErrorCode::TransientDependency.as_str().to_string()),
        }
    }

    /// Malformed payload or a rejection that will never succeed. Dead-lettered
    /// without retry.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            code: Some(ErrorCode::PermanentValidation.as_str().to_string()),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(code) = &self.code {
            write!(f, " (code: {})", code)?;
        }
        Ok(())
    }
}

impl std::error::Error for HandlerError {}

impl From<KeelError> for HandlerError {
    fn from(error: KeelError) -> Self {
        Self {
            message: error.user_message().to_string(),
            retryable: error.is_retryable(),
            code: Some(error.code().as_str().to_string()),
        }
    }
}

impl From<HandlerError> for KeelError {
    fn from(error: HandlerError) -> Self {
        if error.retryable {
            KeelError::new(ErrorCode::TransientDependency, error.message)
        } else {
            KeelError::permanent_validation(error.message)
        }
    }
}

pub type HandlerResult = std::result::Result<(), HandlerError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Handler Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// An idempotent side effect for one event kind.
///
/// Delivery is at-least-once: a handler may see the same `idem_key` more than
/// once and must leave the same end state each time.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(
        &self,
        payload: &serde_json::Value,
        idem_key: &str,
        correlation_id: &str,
    ) -> HandlerResult;
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(serde_json::Value, String, String) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn handle(
        &self,
        payload: &serde_json::Value,
        idem_key: &str,
        correlation_id: &str,
    ) -> HandlerResult {
        (self.f)(payload.clone(), idem_key.to_string(), correlation_id.to_string()).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(serde_json::Value, String, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════════════

/// A registered handler and the dependency its calls go through.
#[derive(Clone)]
pub struct Registration {
    pub handler: Arc<dyn EventHandler>,
    pub dependency: Option<String>,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("dependency", &self.dependency)
            .finish_non_exhaustive()
    }
}

/// `kind → handler` table, filled at startup and read-only afterwards.
#[derive(Debug, Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Registration>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `kind`. A kind can be registered once.
    pub fn register(
        &mut self,
        kind: impl Into<String>,
        dependency: Option<&str>,
        handler: Arc<dyn EventHandler>,
    ) -> Result<()> {
        let kind = kind.into();
        if kind.trim().is_empty() {
            return Err(KeelError::invalid_event("handler kind must not be empty"));
        }
        if self.handlers.contains_key(&kind) {
            return Err(KeelError::handler_already_registered(kind));
        }

        tracing::debug!(kind = %kind, dependency = ?dependency, "Handler registered");
        self.handlers.insert(
            kind,
            Registration {
                handler,
                dependency: dependency.map(str::to_string),
            },
        );
        Ok(())
    }

    pub fn get(&self, kind: &str) -> Option<&Registration> {
        self.handlers.get(kind)
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Fail unless `kind` has a handler.
    pub fn ensure_known(&self, kind: &str) -> Result<()> {
        if self.contains(kind) {
            Ok(())
        } else {
            Err(KeelError::unknown_event_kind(kind))
        }
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.handlers.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Check that every dependency a handler names has a breaker.
    pub fn validate(&self, breakers: &BreakerRegistry) -> Result<()> {
        for (kind, registration) in &self.handlers {
            if let Some(dependency) = &registration.dependency {
                if !breakers.contains(dependency) {
                    return Err(KeelError::dependency_not_found(dependency.clone())
                        .with_context("kind", kind));
                }
            }
        }
        Ok(())
    }
}
