//! In-process handler that applies each `idem_key` at most once.
//!
//! Backs the development server's built-in kinds and gives tests a
//! downstream whose end state can be compared across redeliveries.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use super::handler::{EventHandler, HandlerError, HandlerResult};

/// One applied write.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedWrite {
    pub correlation_id: String,
    pub payload: serde_json::Value,
}

/// Keyed write target. Redelivery of a key is acknowledged without changing
/// the stored value.
#[derive(Debug)]
pub struct IdempotentSink {
    name: String,
    applied: DashMap<String, AppliedWrite>,
    invocations: AtomicU64,
}

impl IdempotentSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            applied: DashMap::new(),
            invocations: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Every handler call, including redeliveries.
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    /// Distinct keys applied.
    pub fn len(&self) -> usize {
        self.applied.len()
    }

    pub fn is_empty(&self) -> bool {
        self.applied.is_empty()
    }

    pub fn get(&self, idem_key: &str) -> Option<AppliedWrite> {
        self.applied.get(idem_key).map(|entry| entry.value().clone())
    }

    /// Stored state ordered by key.
    pub fn state(&self) -> BTreeMap<String, AppliedWrite> {
        self.applied
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

#[async_trait]
impl EventHandler for IdempotentSink {
    async fn handle(
        &self,
        payload: &serde_json::Value,
        idem_key: &str,
        correlation_id: &str,
    ) -> HandlerResult {
        self.invocations.fetch_add(1, Ordering::Relaxed);

        if !payload.is_object() {
            return Err(HandlerError::permanent(format!(
                "{} expects a JSON object payload",
                self.name
            )));
        }

        self.applied
            .entry(idem_key.to_string())
            .or_insert_with(|| AppliedWrite {
                correlation_id: correlation_id.to_string(),
                payload: payload.clone(),
            });
        Ok(())
    }
}
