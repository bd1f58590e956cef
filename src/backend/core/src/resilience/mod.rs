//! Failure containment: per-dependency circuit breakers and degraded mode.

pub mod circuit_breaker;
pub mod degraded;
pub mod registry;

pub use circuit_breaker::{
    BreakerObserver, BreakerPermit, BreakerSnapshot, CircuitBreaker, CircuitState,
};
pub use degraded::{DegradedMode, DegradedSnapshot};
pub use registry::BreakerRegistry;
