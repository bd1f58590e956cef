//! Breakers keyed by dependency name.

use std::sync::Arc;

use dashmap::DashMap;

use super::circuit_breaker::{BreakerObserver, BreakerSnapshot, CircuitBreaker, CircuitState};
use crate::config::{BreakerSettings, BreakersConfig};
use crate::error::{KeelError, Result};

/// Owns one `CircuitBreaker` per monitored dependency.
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    observer: Option<Arc<dyn BreakerObserver>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self {
            breakers: DashMap::new(),
            observer: None,
        }
    }

    /// Notify `observer` of every breaker registered from now on.
    pub fn with_observer(mut self, observer: Arc<dyn BreakerObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Build a breaker for every configured dependency.
    pub fn from_config(config: &BreakersConfig, observer: Option<Arc<dyn BreakerObserver>>) -> Self {
        let registry = Self {
            breakers: DashMap::new(),
            observer,
        };
        for dependency in &config.dependencies {
            registry.register(dependency.clone(), config.settings_for(dependency));
        }
        registry
    }

    /// Register (or replace) the breaker for `dependency`.
    pub fn register(&self, dependency: impl Into<String>, settings: BreakerSettings) -> Arc<CircuitBreaker> {
        let dependency = dependency.into();
        let mut breaker = CircuitBreaker::new(dependency.clone(), settings);
        if let Some(observer) = &self.observer {
            breaker = breaker.with_observer(observer.clone());
        }
        let breaker = Arc::new(breaker);
        self.breakers.insert(dependency, breaker.clone());
        breaker
    }

    pub fn get(&self, dependency: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(dependency).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, dependency: &str) -> bool {
        self.breakers.contains_key(dependency)
    }

    /// Force the named breaker closed.
    pub fn reset(&self, dependency: &str) -> Result<BreakerSnapshot> {
        let breaker = self
            .get(dependency)
            .ok_or_else(|| KeelError::dependency_not_found(dependency))?;
        breaker.reset();
        Ok(breaker.snapshot())
    }

    pub fn any_open(&self) -> bool {
        self.breakers
            .iter()
            .any(|entry| entry.value().state() == CircuitState::Open)
    }

    /// Snapshots ordered by dependency name.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<BreakerSnapshot> = self
            .breakers
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.dependency.cmp(&b.dependency));
        snapshots
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
