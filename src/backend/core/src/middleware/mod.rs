//! HTTP middleware for Keel.
pub mod governor;

pub use governor::{
    synthesize_idempotency_key, GovernorLayer, GovernorService, GovernorSnapshot, GovernorStats,
    WriteContext,
};
