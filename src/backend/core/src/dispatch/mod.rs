//! Event dispatch.
//!
//! - **handler**: the `EventHandler` contract and the `kind → handler` registry
//! - **backoff**: retry delays and the dead-letter threshold
//! - **dispatcher**: the claim worker that drives events to `done` or `dead`
//! - **sink**: a keyed in-process handler used by the dev server and tests

mod backoff;
mod dispatcher;
mod handler;
mod sink;

pub use backoff::{BackoffStrategy, RetryPolicy};
pub use dispatcher::{
    event_saga_name, DispatchOutcome, Dispatcher, DispatcherHandle, DispatcherStats,
    DispatcherStatsSnapshot, TickReport,
};
pub use handler::{
    handler_fn, EventHandler, HandlerError, HandlerRegistry, HandlerResult, Registration,
};
pub use sink::{AppliedWrite, IdempotentSink};
