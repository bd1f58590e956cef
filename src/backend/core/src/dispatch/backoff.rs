//! Retry delays and the dead-letter threshold.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::{BackoffKind, RetryConfig};

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay every time
    Fixed { delay: Duration },
    /// `initial * attempt`
    Linear { initial: Duration, max: Duration },
    /// `initial * multiplier^(attempt-1)`
    Exponential {
        initial: Duration,
        max: Duration,
        multiplier: f64,
    },
    /// Exponential, then scaled by `1 ± jitter_factor * U(0,1)`
    ExponentialWithJitter {
        initial: Duration,
        max: Duration,
        multiplier: f64,
        jitter_factor: f64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for BackoffStrategy {
    fn from(config: &RetryConfig) -> Self {
        match config.strategy {
            BackoffKind::Fixed => Self::Fixed {
                delay: config.initial_delay,
            },
            BackoffKind::Linear => Self::Linear {
                initial: config.initial_delay,
                max: config.max_delay,
            },
            BackoffKind::Exponential => Self::Exponential {
                initial: config.initial_delay,
                max: config.max_delay,
                multiplier: config.multiplier,
            },
            BackoffKind::ExponentialWithJitter => Self::ExponentialWithJitter {
                initial: config.initial_delay,
                max: config.max_delay,
                multiplier: config.multiplier,
                jitter_factor: config.jitter_factor,
            },
        }
    }
}

impl BackoffStrategy {
    /// Delay before the next try, given how many attempts have failed so far
    /// (1 after the first failure).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        match self {
            Self::Fixed { delay } => *delay,
            Self::Linear { initial, max } => initial.saturating_mul(attempt.max(1)).min(*max),
            Self::Exponential {
                initial,
                max,
                multiplier,
            } => exponential(*initial, *max, *multiplier, exponent),
            Self::ExponentialWithJitter {
                initial,
                max,
                multiplier,
                jitter_factor,
            } => {
                let capped = exponential(*initial, *max, *multiplier, exponent).as_secs_f64();
                let spread = capped * jitter_factor.clamp(0.0, 1.0);
                let jitter = rand::rng().random_range(-1.0f64..=1.0) * spread;
                Duration::from_secs_f64((capped + jitter).max(0.0))
            }
        }
    }
}

fn exponential(initial: Duration, max: Duration, multiplier: f64, exponent: i32) -> Duration {
    let secs = initial.as_secs_f64() * multiplier.powi(exponent);
    if !secs.is_finite() || secs >= max.as_secs_f64() {
        max
    } else {
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// When to give up on an event and how long to wait between tries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Failed attempts after which an event is dead-lettered
    pub max_retries: u32,
    pub backoff: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff: BackoffStrategy::from(config),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: BackoffStrategy) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// Retry immediately, dead-letter after `max_retries` failures.
    pub fn immediate(max_retries: u32) -> Self {
        Self::new(
            max_retries,
            BackoffStrategy::Fixed {
                delay: Duration::ZERO,
            },
        )
    }

    /// Whether an event with `attempts` failed attempts is out of retries.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_retries
    }

    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        self.backoff.delay_for_attempt(attempts)
    }
}
