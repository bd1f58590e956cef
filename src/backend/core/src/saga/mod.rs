//! Saga recorder.
//!
//! Keeps an audit trail of named multi-step operations per correlation id.
//! Records are observability only; nothing reads them to roll anything back.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::observability::{metrics, KeelEvent};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaStep {
    pub name: String,
    pub ok: bool,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaRecord {
    pub correlation_id: String,
    pub saga_name: String,
    pub context: serde_json::Value,
    pub steps: Vec<SagaStep>,
    pub began_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub ended_ok: Option<bool>,
    pub summary: Option<String>,
}

impl SagaRecord {
    fn new(correlation_id: &str, saga_name: &str, context: serde_json::Value) -> Self {
        Self {
            correlation_id: correlation_id.to_string(),
            saga_name: saga_name.to_string(),
            context,
            steps: Vec::new(),
            began_at: Utc::now(),
            ended_at: None,
            ended_ok: None,
            summary: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.ended_at.is_some()
    }
}

#[derive(Debug, Default)]
struct SagaState {
    by_correlation: HashMap<String, Vec<SagaRecord>>,
    order: VecDeque<(String, String)>,
    len: usize,
}

impl SagaState {
    fn find_mut(&mut self, correlation_id: &str, saga_name: &str) -> Option<&mut SagaRecord> {
        self.by_correlation
            .get_mut(correlation_id)?
            .iter_mut()
            .find(|record| record.saga_name == saga_name)
    }

    fn insert(&mut self, record: SagaRecord) {
        self.order
            .push_back((record.correlation_id.clone(), record.saga_name.clone()));
        self.by_correlation
            .entry(record.correlation_id.clone())
            .or_default()
            .push(record);
        self.len += 1;
    }

    fn remove(&mut self, correlation_id: &str, saga_name: &str) {
        if let Some(records) = self.by_correlation.get_mut(correlation_id) {
            let before = records.len();
            records.retain(|record| record.saga_name != saga_name);
            self.len -= before - records.len();
            if records.is_empty() {
                self.by_correlation.remove(correlation_id);
            }
        }
        self.order
            .retain(|(corr, name)| !(corr == correlation_id && name == saga_name));
    }

    fn is_closed(&self, correlation_id: &str, saga_name: &str) -> bool {
        self.by_correlation
            .get(correlation_id)
            .and_then(|records| records.iter().find(|r| r.saga_name == saga_name))
            .map(SagaRecord::is_closed)
            .unwrap_or(true)
    }

    /// Drop the oldest closed saga, or the oldest saga if none is closed.
    fn evict_one(&mut self) {
        let victim = self
            .order
            .iter()
            .find(|(corr, name)| self.is_closed(corr, name))
            .or_else(|| self.order.front())
            .cloned();
        if let Some((corr, name)) = victim {
            self.remove(&corr, &name);
        }
    }
}

/// Retention-bounded saga log.
#[derive(Debug)]
pub struct SagaRecorder {
    state: Mutex<SagaState>,
    max_sagas: usize,
}

impl SagaRecorder {
    pub fn new(max_sagas: usize) -> Self {
        Self {
            state: Mutex::new(SagaState::default()),
            max_sagas: max_sagas.max(1),
        }
    }

    /// Open a saga. Re-beginning a closed saga starts a fresh record; an
    /// open one is left as is.
    pub fn saga_begin(&self, correlation_id: &str, saga_name: &str, context: serde_json::Value) {
        {
            let mut state = self.state.lock();
            let existing = state
                .find_mut(correlation_id, saga_name)
                .map(|record| record.is_closed());
            match existing {
                Some(false) => return,
                Some(true) => state.remove(correlation_id, saga_name),
                None => {}
            }
            state.insert(SagaRecord::new(correlation_id, saga_name, context));
            while state.len > self.max_sagas {
                state.evict_one();
            }
        }

        KeelEvent::SagaBegan {
            correlation_id: correlation_id.to_string(),
            saga: saga_name.to_string(),
        }
        .log();
    }

    /// Append a step, opening the saga if nobody has yet.
    pub fn saga_step(&self, correlation_id: &str, saga_name: &str, step_name: &str, ok: bool) {
        self.ensure_open(correlation_id, saga_name);
        {
            let mut state = self.state.lock();
            if let Some(record) = state.find_mut(correlation_id, saga_name) {
                record.steps.push(SagaStep {
                    name: step_name.to_string(),
                    ok,
                    ts: Utc::now(),
                });
            }
        }

        metrics::record_saga_step(saga_kind(saga_name), ok);
        KeelEvent::SagaStep {
            correlation_id: correlation_id.to_string(),
            saga: saga_name.to_string(),
            step: step_name.to_string(),
            ok,
        }
        .log();
    }

    /// Close a saga.
    pub fn saga_end(&self, correlation_id: &str, saga_name: &str, ok: bool, summary: Option<String>) {
        self.ensure_open(correlation_id, saga_name);
        {
            let mut state = self.state.lock();
            if let Some(record) = state.find_mut(correlation_id, saga_name) {
                record.ended_at = Some(Utc::now());
                record.ended_ok = Some(ok);
                record.summary = summary.clone();
            }
        }

        KeelEvent::SagaEnded {
            correlation_id: correlation_id.to_string(),
            saga: saga_name.to_string(),
            ok,
            summary,
        }
        .log();
    }

    /// All sagas recorded under a correlation id.
    pub fn get(&self, correlation_id: &str) -> Vec<SagaRecord> {
        self.state
            .lock()
            .by_correlation
            .get(correlation_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.state.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> SagaSnapshot {
        let state = self.state.lock();
        let open = state
            .by_correlation
            .values()
            .flatten()
            .filter(|record| !record.is_closed())
            .count();
        SagaSnapshot {
            total: state.len,
            open,
            closed: state.len - open,
            max_sagas: self.max_sagas,
        }
    }

    fn ensure_open(&self, correlation_id: &str, saga_name: &str) {
        let exists = self
            .state
            .lock()
            .find_mut(correlation_id, saga_name)
            .is_some();
        if !exists {
            self.saga_begin(correlation_id, saga_name, serde_json::Value::Null);
        }
    }
}

/// Saga name with any `#<seq>` instance suffix removed.
pub fn saga_kind(saga_name: &str) -> &str {
    saga_name
        .split_once('#')
        .map_or(saga_name, |(kind, _)| kind)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaSnapshot {
    pub total: usize,
    pub open: usize,
    pub closed: usize,
    pub max_sagas: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_step_end() {
        let recorder = SagaRecorder::new(10);
        recorder.saga_begin("c1", "memory.write", serde_json::json!({"kind": "journal.append"}));
        recorder.saga_step("c1", "memory.write", "append", true);
        recorder.saga_step("c1", "memory.write", "dispatch", false);
        recorder.saga_end("c1", "memory.write", false, Some("dead-lettered".into()));

        let records = recorder.get("c1");
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.steps.len(), 2);
        assert!(!record.steps[1].ok);
        assert_eq!(record.ended_ok, Some(false));
        assert_eq!(record.summary.as_deref(), Some("dead-lettered"));
    }

    #[test]
    fn test_step_without_begin_opens_saga() {
        let recorder = SagaRecorder::new(10);
        recorder.saga_step("c2", "dispatch", "attempt-1", true);

        let records = recorder.get("c2");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].context, serde_json::Value::Null);
        assert!(!records[0].is_closed());
    }

    #[test]
    fn test_begin_twice_keeps_open_record() {
        let recorder = SagaRecorder::new(10);
        recorder.saga_begin("c3", "s", serde_json::json!(1));
        recorder.saga_step("c3", "s", "a", true);
        recorder.saga_begin("c3", "s", serde_json::json!(2));

        let records = recorder.get("c3");
        assert_eq!(records[0].steps.len(), 1);
        assert_eq!(records[0].context, serde_json::json!(1));
    }

    #[test]
    fn test_eviction_prefers_closed_sagas() {
        let recorder = SagaRecorder::new(2);
        recorder.saga_begin("open-old", "s", serde_json::Value::Null);
        recorder.saga_begin("closed", "s", serde_json::Value::Null);
        recorder.saga_end("closed", "s", true, None);
        recorder.saga_begin("new", "s", serde_json::Value::Null);

        assert_eq!(recorder.len(), 2);
        assert!(recorder.get("closed").is_empty());
        assert_eq!(recorder.get("open-old").len(), 1);
        assert_eq!(recorder.get("new").len(), 1);
    }

    #[test]
    fn test_saga_kind_drops_event_sequence() {
        assert_eq!(saga_kind("journal.append#42"), "journal.append");
        assert_eq!(saga_kind("journal.append#43"), "journal.append");
        assert_eq!(saga_kind("vector.upsert.direct"), "vector.upsert.direct");
        assert_eq!(saga_kind("memory.write"), "memory.write");
    }

    #[test]
    fn test_step_metric_is_labelled_by_kind() {
        let prometheus = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = prometheus.handle();
        let recorder = SagaRecorder::new(10);

        ::metrics::with_local_recorder(&prometheus, || {
            for seq in 1..=3 {
                recorder.saga_step("c1", &format!("journal.append#{}", seq), "append", true);
            }
        });

        let rendered = handle.render();
        assert!(rendered.contains("saga_kind=\"journal.append\""));
        assert!(!rendered.contains("journal.append#"));
    }

    #[test]
    fn test_eviction_falls_back_to_oldest() {
        let recorder = SagaRecorder::new(1);
        recorder.saga_begin("a", "s", serde_json::Value::Null);
        recorder.saga_begin("b", "s", serde_json::Value::Null);

        assert!(recorder.get("a").is_empty());
        assert_eq!(recorder.snapshot().open, 1);
    }
}
