//! Error handling for Keel Core.
//!
//! This module provides:
//! - A single structured error type with machine-readable codes
//! - HTTP status code mapping for API responses
//! - User-safe messages kept apart from internal detail
//! - Severity-based logging with tracing integration
//! - Metrics integration for error tracking
//!
//! # Usage
//!
//! ```rust,ignore
//! use keel_core::error::{KeelError, Result, ErrorContext};
//!
//! fn load(seq: i64) -> Result<Event> {
//!     store.get(seq)?.context("event not found")
//! }
//! ```

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Keel operations.
pub type Result<T> = std::result::Result<T, KeelError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
///
/// The snake_case serialization is the `error` field of every API error body,
/// so these names are part of the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    // Outbox Errors (1000-1099)
    EventNotFound,
    InvalidStateTransition,
    UnknownEventKind,
    HandlerAlreadyRegistered,
    InvalidEvent,

    // Admission Errors (1100-1199)
    BudgetExceeded,

    // Governor Errors (1200-1299)
    MissingHeader,
    InvalidHeader,

    // Storage Errors (2000-2099)
    EventStoreUnavailable,
    DatabaseError,
    DatabaseQueryFailed,

    // Serialization Errors (2200-2299)
    SerializationError,
    DeserializationError,

    // Dependency Errors (3000-3099)
    TransientDependency,
    PermanentValidation,
    CircuitOpen,
    DependencyTimeout,
    DependencyNotFound,

    // Validation Errors (4100-4199)
    ValidationError,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    InvalidConfiguration,

    // Internal Errors (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::EventNotFound => 1000,
            Self::InvalidStateTransition => 1001,
            Self::UnknownEventKind => 1002,
            Self::HandlerAlreadyRegistered => 1003,
            Self::InvalidEvent => 1004,

            Self::BudgetExceeded => 1100,

            Self::MissingHeader => 1200,
            Self::InvalidHeader => 1201,

            Self::EventStoreUnavailable => 2000,
            Self::DatabaseError => 2001,
            Self::DatabaseQueryFailed => 2002,

            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,

            Self::TransientDependency => 3000,
            Self::PermanentValidation => 3001,
            Self::CircuitOpen => 3002,
            Self::DependencyTimeout => 3003,
            Self::DependencyNotFound => 3004,

            Self::ValidationError => 4100,

            Self::ConfigurationError => 5000,
            Self::InvalidConfiguration => 5001,

            Self::InternalError => 9000,
        }
    }

    /// Get the HTTP status code for this error.
    pub const fn http_status(&self) -> StatusCode {
        match self {
            Self::EventNotFound | Self::DependencyNotFound => StatusCode::NOT_FOUND,

            Self::InvalidStateTransition | Self::HandlerAlreadyRegistered => StatusCode::CONFLICT,

            // Structured synchronous rejections
            Self::BudgetExceeded
            | Self::MissingHeader
            | Self::InvalidHeader
            | Self::InvalidEvent
            | Self::UnknownEventKind
            | Self::ValidationError
            | Self::DeserializationError => StatusCode::BAD_REQUEST,

            Self::PermanentValidation => StatusCode::UNPROCESSABLE_ENTITY,

            // Hard failures
            Self::EventStoreUnavailable | Self::CircuitOpen => StatusCode::SERVICE_UNAVAILABLE,

            Self::TransientDependency => StatusCode::BAD_GATEWAY,
            Self::DependencyTimeout => StatusCode::GATEWAY_TIMEOUT,

            Self::DatabaseError
            | Self::DatabaseQueryFailed
            | Self::SerializationError
            | Self::ConfigurationError
            | Self::InvalidConfiguration
            | Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this error is retryable.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientDependency
                | Self::DependencyTimeout
                | Self::CircuitOpen
                | Self::EventStoreUnavailable
                | Self::DatabaseQueryFailed
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "outbox",
            1100..=1199 => "admission",
            1200..=1299 => "governor",
            2000..=2099 => "storage",
            2200..=2299 => "serialization",
            3000..=3099 => "dependency",
            4100..=4199 => "validation",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }

    /// Wire name used in API error bodies.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EventNotFound => "event_not_found",
            Self::InvalidStateTransition => "invalid_state_transition",
            Self::UnknownEventKind => "unknown_event_kind",
            Self::HandlerAlreadyRegistered => "handler_already_registered",
            Self::InvalidEvent => "invalid_event",
            Self::BudgetExceeded => "budget_exceeded",
            Self::MissingHeader => "missing_header",
            Self::InvalidHeader => "invalid_header",
            Self::EventStoreUnavailable => "event_store_unavailable",
            Self::DatabaseError => "database_error",
            Self::DatabaseQueryFailed => "database_query_failed",
            Self::SerializationError => "serialization_error",
            Self::DeserializationError => "deserialization_error",
            Self::TransientDependency => "transient_dependency",
            Self::PermanentValidation => "permanent_validation",
            Self::CircuitOpen => "circuit_open",
            Self::DependencyTimeout => "dependency_timeout",
            Self::DependencyNotFound => "dependency_not_found",
            Self::ValidationError => "validation_error",
            Self::ConfigurationError => "configuration_error",
            Self::InvalidConfiguration => "invalid_configuration",
            Self::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging and alerting).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller errors (missing headers, bad input)
    Low,
    /// Operational conditions (budgets, open circuits, timeouts)
    Medium,
    /// System errors (query failures, serialization bugs)
    High,
    /// The durable path itself is down
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::EventNotFound
            | ErrorCode::InvalidStateTransition
            | ErrorCode::UnknownEventKind
            | ErrorCode::InvalidEvent
            | ErrorCode::MissingHeader
            | ErrorCode::InvalidHeader
            | ErrorCode::DependencyNotFound
            | ErrorCode::ValidationError
            | ErrorCode::DeserializationError => Self::Low,

            ErrorCode::BudgetExceeded
            | ErrorCode::CircuitOpen
            | ErrorCode::TransientDependency
            | ErrorCode::DependencyTimeout
            | ErrorCode::PermanentValidation => Self::Medium,

            ErrorCode::HandlerAlreadyRegistered
            | ErrorCode::DatabaseError
            | ErrorCode::DatabaseQueryFailed
            | ErrorCode::SerializationError
            | ErrorCode::ConfigurationError
            | ErrorCode::InvalidConfiguration => Self::High,

            ErrorCode::EventStoreUnavailable | ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Related entity ID (event seq, dependency name, header name)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Related entity type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    /// Retry information
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,

    /// Suggested action for resolution
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<String>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after_secs = Some(seconds);
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggested_action = Some(suggestion.into());
        self
    }

    fn is_empty(&self) -> bool {
        self.context.is_empty()
            && self.entity_id.is_none()
            && self.suggested_action.is_none()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Keel Core.
#[derive(Error, Debug)]
pub struct KeelError {
    /// Machine-readable error code
    code: ErrorCode,

    /// User-friendly error message (safe to expose to clients)
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for KeelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl KeelError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error (500).
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidConfiguration, message.into())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add error details, keeping context already attached.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        let mut context = std::mem::take(&mut self.details.context);
        context.extend(details.context.clone());
        self.details = details;
        self.details.context = context;
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    pub fn http_status(&self) -> StatusCode {
        self.code.http_status()
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    /// The exhausted resource (`"tools"` or `"tokens"`) for a budget rejection.
    pub fn budget_resource(&self) -> Option<&str> {
        if self.code != ErrorCode::BudgetExceeded {
            return None;
        }
        self.details.context.get("resource").and_then(|v| v.as_str())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();
        let status = self.http_status().as_u16();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    details = ?self.details,
                    source = ?self.source,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    "Low severity error"
                );
            }
        }
    }

    fn record_metrics(&self) {
        counter!(
            "keel_errors_total",
            "code" => self.code.as_str(),
            "category" => self.code.category(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// API Response
// ═══════════════════════════════════════════════════════════════════════════════

/// Error body returned to API clients.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Wire error name, e.g. `missing_header` or `budget_exceeded`
    pub error: ErrorCode,
    /// Numeric error code
    pub code: u32,
    /// User-friendly error message
    pub message: String,
    /// Seconds the caller should wait before retrying
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_sec: Option<u64>,
    /// Additional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<ErrorDetails>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl From<&KeelError> for ErrorResponse {
    fn from(error: &KeelError) -> Self {
        Self {
            error: error.code,
            code: error.code.numeric_code(),
            message: error.user_message.to_string(),
            retry_after_sec: error.details.retry_after_secs,
            details: if error.details.is_empty() {
                None
            } else {
                Some(error.details.clone())
            },
            timestamp: chrono::Utc::now(),
        }
    }
}

impl IntoResponse for KeelError {
    fn into_response(self) -> Response {
        self.log();

        let status = self.http_status();
        let body = ErrorResponse::from(&self);
        let mut response = (status, Json(body)).into_response();

        if let Some(secs) = self.details.retry_after_secs {
            if let Ok(value) = axum::http::HeaderValue::from_str(&secs.to_string()) {
                response
                    .headers_mut()
                    .insert(axum::http::header::RETRY_AFTER, value);
            }
        }
        response
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Add context with error code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| KeelError::internal(message.into()).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| KeelError::new(code, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| KeelError::new(ErrorCode::EventNotFound, message.into()))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| KeelError::new(code, "Resource not found"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<sqlx::Error> for KeelError {
    fn from(error: sqlx::Error) -> Self {
        let (code, user_msg) = match &error {
            sqlx::Error::RowNotFound => (ErrorCode::EventNotFound, "The requested event was not found"),
            sqlx::Error::Database(_) => (ErrorCode::DatabaseQueryFailed, "A database error occurred"),
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_) => (
                ErrorCode::EventStoreUnavailable,
                "The event store is unavailable",
            ),
            _ => (ErrorCode::DatabaseError, "A database error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for KeelError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_data() || error.is_syntax() || error.is_eof() {
            ErrorCode::DeserializationError
        } else {
            ErrorCode::SerializationError
        };

        Self::with_internal(code, "Failed to process JSON data", error.to_string()).with_source(error)
    }
}

impl From<tokio::time::error::Elapsed> for KeelError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        Self::with_internal(ErrorCode::DependencyTimeout, "Operation timed out", error.to_string())
            .with_source(error)
    }
}

impl From<anyhow::Error> for KeelError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<KeelError>() {
            Ok(keel_error) => keel_error,
            Err(error) => Self::with_internal(
                ErrorCode::InternalError,
                "An internal error occurred",
                error.to_string(),
            ),
        }
    }
}

impl From<config::ConfigError> for KeelError {
    fn from(error: config::ConfigError) -> Self {
        let (code, user_msg) = match &error {
            config::ConfigError::PathParse(_) | config::ConfigError::FileParse { .. } => (
                ErrorCode::InvalidConfiguration,
                "Configuration file is invalid",
            ),
            _ => (ErrorCode::ConfigurationError, "Configuration error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Convenience Constructors for Domain Errors
// ═══════════════════════════════════════════════════════════════════════════════

impl KeelError {
    // ─────────────────────────────────────────────────────────────────────────
    // Outbox Errors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn event_not_found(seq: i64) -> Self {
        Self::new(ErrorCode::EventNotFound, format!("Event not found: {}", seq))
            .with_details(ErrorDetails::new().with_entity("event", seq.to_string()))
    }

    /// An admin or worker operation was attempted from the wrong status.
    pub fn invalid_state_transition(seq: i64, from: impl fmt::Display, to: impl fmt::Display) -> Self {
        let from = from.to_string();
        let to = to.to_string();
        Self::new(
            ErrorCode::InvalidStateTransition,
            format!("Invalid event state transition for {}: {} -> {}", seq, from, to),
        )
        .with_context("from_state", from)
        .with_context("to_state", to)
        .with_details(ErrorDetails::new().with_entity("event", seq.to_string()))
    }

    pub fn unknown_event_kind(kind: impl Into<String>) -> Self {
        let kind = kind.into();
        Self::new(ErrorCode::UnknownEventKind, format!("No handler registered for kind: {}", kind))
            .with_details(ErrorDetails::new().with_entity("kind", kind))
    }

    pub fn handler_already_registered(kind: impl Into<String>) -> Self {
        let kind = kind.into();
        Self::new(
            ErrorCode::HandlerAlreadyRegistered,
            format!("A handler is already registered for kind: {}", kind),
        )
        .with_details(ErrorDetails::new().with_entity("kind", kind))
    }

    pub fn invalid_event(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidEvent, message.into())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Admission Errors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a budget exceeded error for `"tools"` or `"tokens"`.
    pub fn budget_exceeded(resource: &'static str, requested: u64, limit: u64, retry_after_secs: u64) -> Self {
        Self::new(
            ErrorCode::BudgetExceeded,
            format!("Turn budget exceeded for {}: requested {}, limit {}", resource, requested, limit),
        )
        .with_context("resource", resource)
        .with_context("requested", requested)
        .with_context("limit", limit)
        .with_details(
            ErrorDetails::new()
                .with_retry_after(retry_after_secs)
                .with_suggestion("Start a new turn or raise the per-turn budget"),
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Governor Errors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn missing_header(header: impl Into<String>) -> Self {
        let header = header.into();
        Self::new(ErrorCode::MissingHeader, format!("Required header is missing: {}", header))
            .with_details(ErrorDetails::new().with_entity("header", header))
    }

    pub fn invalid_header(header: impl Into<String>, reason: impl Into<String>) -> Self {
        let header = header.into();
        Self::new(
            ErrorCode::InvalidHeader,
            format!("Header {} is invalid: {}", header, reason.into()),
        )
        .with_details(ErrorDetails::new().with_entity("header", header))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Dependency Errors
    // ─────────────────────────────────────────────────────────────────────────

    /// The breaker for `dependency` rejected the call without attempting it.
    pub fn circuit_open(dependency: impl Into<String>, retry_after_secs: u64) -> Self {
        let dependency = dependency.into();
        Self::new(
            ErrorCode::CircuitOpen,
            format!("Circuit open for dependency: {}", dependency),
        )
        .with_details(
            ErrorDetails::new()
                .with_entity("dependency", dependency)
                .with_retry_after(retry_after_secs),
        )
    }

    pub fn transient_dependency(dependency: impl Into<String>, message: impl Into<String>) -> Self {
        let dependency = dependency.into();
        Self::new(
            ErrorCode::TransientDependency,
            format!("Dependency {} failed: {}", dependency, message.into()),
        )
        .with_details(ErrorDetails::new().with_entity("dependency", dependency))
    }

    pub fn permanent_validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PermanentValidation, message.into())
    }

    pub fn dependency_timeout(dependency: impl Into<String>, timeout_ms: u64) -> Self {
        let dependency = dependency.into();
        Self::new(
            ErrorCode::DependencyTimeout,
            format!("Dependency {} exceeded {}ms", dependency, timeout_ms),
        )
        .with_context("timeout_ms", timeout_ms)
        .with_details(ErrorDetails::new().with_entity("dependency", dependency))
    }

    pub fn dependency_not_found(dependency: impl Into<String>) -> Self {
        let dependency = dependency.into();
        Self::new(
            ErrorCode::DependencyNotFound,
            format!("No circuit breaker for dependency: {}", dependency),
        )
        .with_details(ErrorDetails::new().with_entity("dependency", dependency))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Storage Errors
    // ─────────────────────────────────────────────────────────────────────────

    /// The durable path is down; callers get a hard failure.
    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::EventStoreUnavailable,
            "The event store is unavailable",
            message,
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
