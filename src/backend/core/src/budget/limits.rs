//! Turn budget limit definitions.

use serde::{Deserialize, Serialize};

use crate::config::BudgetConfig;

/// Per-turn resource limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetLimits {
    /// Maximum tokens a turn may consume
    pub tokens_limit: u64,

    /// Maximum tool calls a turn may make
    pub tool_calls_limit: u32,

    /// Seconds a rejected caller is told to wait
    pub retry_after_sec: u64,
}

impl BudgetLimits {
    /// Limits for a short, single-action turn.
    pub fn minimal() -> Self {
        Self {
            tokens_limit: 4_000,
            tool_calls_limit: 4,
            retry_after_sec: 1,
        }
    }

    /// Limits for an ordinary conversational turn.
    pub fn standard() -> Self {
        Self {
            tokens_limit: 20_000,
            tool_calls_limit: 16,
            retry_after_sec: 1,
        }
    }

    /// Limits for turns that consolidate memory in bulk.
    pub fn consolidation() -> Self {
        Self {
            tokens_limit: 100_000,
            tool_calls_limit: 64,
            retry_after_sec: 5,
        }
    }

    /// Check if these limits are within another set of limits.
    pub fn fits_within(&self, other: &BudgetLimits) -> bool {
        self.tokens_limit <= other.tokens_limit && self.tool_calls_limit <= other.tool_calls_limit
    }
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self::standard()
    }
}

impl From<&BudgetConfig> for BudgetLimits {
    fn from(config: &BudgetConfig) -> Self {
        Self {
            tokens_limit: config.tokens_limit,
            tool_calls_limit: config.tool_calls_limit,
            retry_after_sec: config.retry_after_sec,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_are_ordered() {
        assert!(BudgetLimits::minimal().fits_within(&BudgetLimits::standard()));
        assert!(BudgetLimits::standard().fits_within(&BudgetLimits::consolidation()));
        assert!(!BudgetLimits::consolidation().fits_within(&BudgetLimits::minimal()));
    }

    #[test]
    fn test_default_matches_config_default() {
        let from_config = BudgetLimits::from(&BudgetConfig::default());
        assert_eq!(from_config, BudgetLimits::default());
    }
}
