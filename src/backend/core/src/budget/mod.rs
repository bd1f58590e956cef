//! Admission control.
//!
//! A `TurnBudget` is created at the start of a turn and dropped at its end.
//! Each `ensure_*` call either charges the budget or fails with
//! `BudgetExceeded` without charging anything, so the guarded operation can
//! be skipped before it has any effect.

mod limits;

pub use limits::BudgetLimits;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{KeelError, Result};
use crate::observability::{metrics, KeelEvent};

pub const RESOURCE_TOOLS: &str = "tools";
pub const RESOURCE_TOKENS: &str = "tokens";

/// Process-wide rejection counters shared by every turn.
#[derive(Debug, Default)]
pub struct AdmissionCounters {
    tools_rejected: AtomicU64,
    tokens_rejected: AtomicU64,
    turns_admitted: AtomicU64,
}

impl AdmissionCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> AdmissionSnapshot {
        AdmissionSnapshot {
            tools_rejected: self.tools_rejected.load(Ordering::Relaxed),
            tokens_rejected: self.tokens_rejected.load(Ordering::Relaxed),
            turns_admitted: self.turns_admitted.load(Ordering::Relaxed),
        }
    }

    fn record_rejection(&self, resource: &'static str) {
        let counter = if resource == RESOURCE_TOOLS {
            &self.tools_rejected
        } else {
            &self.tokens_rejected
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionSnapshot {
    pub tools_rejected: u64,
    pub tokens_rejected: u64,
    pub turns_admitted: u64,
}

/// Resource usage within one turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetUsage {
    pub tokens_used: u64,
    pub tool_calls_used: u32,
}

/// The budget for a single turn.
#[derive(Debug)]
pub struct TurnBudget {
    turn_id: String,
    limits: BudgetLimits,
    usage: BudgetUsage,
    counters: Option<Arc<AdmissionCounters>>,
}

impl TurnBudget {
    pub fn new(turn_id: impl Into<String>, limits: BudgetLimits) -> Self {
        Self {
            turn_id: turn_id.into(),
            limits,
            usage: BudgetUsage::default(),
            counters: None,
        }
    }

    /// Report rejections to shared counters.
    pub fn with_counters(mut self, counters: Arc<AdmissionCounters>) -> Self {
        counters.turns_admitted.fetch_add(1, Ordering::Relaxed);
        self.counters = Some(counters);
        self
    }

    pub fn turn_id(&self) -> &str {
        &self.turn_id
    }

    pub fn limits(&self) -> &BudgetLimits {
        &self.limits
    }

    pub fn usage(&self) -> BudgetUsage {
        self.usage
    }

    /// Charge one tool call.
    pub fn ensure_tool_call(&mut self) -> Result<()> {
        let requested = self.usage.tool_calls_used + 1;
        if requested > self.limits.tool_calls_limit {
            return Err(self.reject(
                RESOURCE_TOOLS,
                requested as u64,
                self.limits.tool_calls_limit as u64,
            ));
        }
        self.usage.tool_calls_used = requested;
        Ok(())
    }

    /// Charge `tokens` tokens.
    pub fn ensure_token_usage(&mut self, tokens: u64) -> Result<()> {
        let requested = self.usage.tokens_used.saturating_add(tokens);
        if requested > self.limits.tokens_limit {
            return Err(self.reject(RESOURCE_TOKENS, requested, self.limits.tokens_limit));
        }
        self.usage.tokens_used = requested;
        Ok(())
    }

    /// Charge one tool call plus `tokens`, or nothing at all.
    pub fn admit(&mut self, tokens: u64) -> Result<()> {
        let before = self.usage;
        self.ensure_tool_call()?;
        if let Err(err) = self.ensure_token_usage(tokens) {
            self.usage = before;
            return Err(err);
        }
        Ok(())
    }

    /// Remaining headroom.
    pub fn remaining(&self) -> BudgetUsage {
        BudgetUsage {
            tokens_used: self.limits.tokens_limit.saturating_sub(self.usage.tokens_used),
            tool_calls_used: self
                .limits
                .tool_calls_limit
                .saturating_sub(self.usage.tool_calls_used),
        }
    }

    fn reject(&self, resource: &'static str, requested: u64, limit: u64) -> KeelError {
        metrics::record_budget_exceeded(resource);
        if let Some(counters) = &self.counters {
            counters.record_rejection(resource);
        }
        KeelEvent::BudgetExceeded {
            turn_id: self.turn_id.clone(),
            resource: resource.to_string(),
            requested,
            limit,
        }
        .log();
        KeelError::budget_exceeded(resource, requested, limit, self.limits.retry_after_sec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn limits(tokens: u64, tools: u32) -> BudgetLimits {
        BudgetLimits {
            tokens_limit: tokens,
            tool_calls_limit: tools,
            retry_after_sec: 2,
        }
    }

    #[test]
    fn test_tool_calls_within_limit() {
        let mut budget = TurnBudget::new("turn-1", limits(100, 2));
        assert!(budget.ensure_tool_call().is_ok());
        assert!(budget.ensure_tool_call().is_ok());
        assert_eq!(budget.usage().tool_calls_used, 2);
    }

    #[test]
    fn test_token_rejection_leaves_usage_untouched() {
        let mut budget = TurnBudget::new("turn-1", limits(100, 2));
        budget.ensure_token_usage(60).unwrap();

        let err = budget.ensure_token_usage(50).unwrap_err();
        assert_eq!(err.code(), ErrorCode::BudgetExceeded);
        assert_eq!(err.budget_resource(), Some("tokens"));
        assert_eq!(budget.usage().tokens_used, 60);
    }

    #[test]
    fn test_admit_is_all_or_nothing() {
        let mut budget = TurnBudget::new("turn-1", limits(10, 5));
        let err = budget.admit(11).unwrap_err();

        assert_eq!(err.budget_resource(), Some("tokens"));
        assert_eq!(budget.usage(), BudgetUsage::default());
    }

    #[test]
    fn test_counters_record_rejections() {
        let counters = Arc::new(AdmissionCounters::new());
        let mut budget = TurnBudget::new("turn-1", limits(10, 0)).with_counters(counters.clone());

        assert!(budget.ensure_tool_call().is_err());
        assert!(budget.ensure_token_usage(11).is_err());

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.tools_rejected, 1);
        assert_eq!(snapshot.tokens_rejected, 1);
        assert_eq!(snapshot.turns_admitted, 1);
    }
}
