#![allow(clippy::result_large_err)]
//! # Keel Core
//!
//! Reliability layer for agent memory writes.
//!
//! ## Architecture
//!
//! - **Outbox**: Durable event store with idempotent append and leased claims
//! - **Dispatch**: Claim worker with retry, backoff and dead-lettering
//! - **Resilience**: Per-dependency circuit breakers and degraded mode
//! - **Budget**: Per-turn tool-call and token admission
//! - **Middleware**: Correlation-id and idempotency-key governor
//! - **Saga**: In-memory record of multi-step write workflows
//! - **API**: Write, admin, status and metrics endpoints

pub mod api;
pub mod budget;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod ingest;
pub mod middleware;
pub mod observability;
pub mod outbox;
pub mod resilience;
pub mod saga;

pub use error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, KeelError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::api::{build_router, AppState};
    pub use crate::budget::{BudgetLimits, TurnBudget};
    pub use crate::config::Config;
    pub use crate::dispatch::{
        handler_fn, Dispatcher, DispatcherHandle, EventHandler, HandlerError, HandlerRegistry,
        HandlerResult, IdempotentSink, RetryPolicy,
    };
    pub use crate::error::{ErrorCode, ErrorContext, KeelError, Result};
    pub use crate::ingest::{DirectOutcome, EnqueueReceipt, WritePath, WriteRequest};
    pub use crate::middleware::{GovernorLayer, WriteContext};
    pub use crate::outbox::{Event, EventStatus, EventStore, InMemoryEventStore, NewEvent};
    pub use crate::resilience::{BreakerRegistry, CircuitBreaker, CircuitState, DegradedMode};
    pub use crate::saga::SagaRecorder;
}
