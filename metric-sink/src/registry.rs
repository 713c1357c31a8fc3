// SPDX-License-Identifier: MIT

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use log::{debug, warn};
use serde::Serialize;

use crate::metric::{MetricSnapshot, MetricVec};

/// Sink for labelled metric observations, addressed by metric id.
///
/// Implementations must be safe to share between threads: several dispatchers
/// may report into the same sink.
pub trait MultiLogger: Send + Sync {
    /// Registers `metric` under `id`. An already registered metric is kept and
    /// `false` is returned.
    fn add_new_metric(&self, id: &str, metric: Arc<dyn MetricVec>) -> bool;

    fn has_metric(&self, id: &str) -> bool;

    fn update(&self, elapsed: i64, id: &str, labels: &[&str]);

    fn add_val(&self, value: i64, id: &str, labels: &[&str]);

    fn sub_val(&self, value: i64, id: &str, labels: &[&str]);

    fn set_val(&self, value: i64, id: &str, labels: &[&str]);

    fn remove_logging(&self, id: &str, labels: &[&str]);

    fn snapshot(&self) -> RegistrySnapshot;
}

/// Snapshot of every metric in a registry, keyed by metric id.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RegistrySnapshot {
    pub metrics: BTreeMap<String, MetricSnapshot>,
}

impl RegistrySnapshot {
    /// Shortcut for the plain value of a gauge or counter series.
    pub fn value(&self, id: &str, labels: &[&str]) -> Option<i64> {
        self.metrics
            .get(id)?
            .series(labels)
            .and_then(|s| s.value.as_value())
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// In-process metric registry. Create one per application (or per test) and
/// hand it to whoever reports into it.
#[derive(Default)]
pub struct MetricRegistry {
    metrics: RwLock<BTreeMap<String, Arc<dyn MetricVec>>>,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_metric(&self, id: &str, f: impl FnOnce(&dyn MetricVec)) {
        let metric = self.metrics.read().unwrap().get(id).cloned();
        match metric {
            Some(metric) => f(metric.as_ref()),
            None => warn!("metric {} is not registered", id),
        }
    }
}

impl std::fmt::Debug for MetricRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<String> = self.metrics.read().unwrap().keys().cloned().collect();
        f.debug_struct("MetricRegistry").field("metrics", &ids).finish()
    }
}

impl MultiLogger for MetricRegistry {
    fn add_new_metric(&self, id: &str, metric: Arc<dyn MetricVec>) -> bool {
        let mut metrics = self.metrics.write().unwrap();
        if metrics.contains_key(id) {
            debug!("metric {} already registered", id);
            return false;
        }
        metrics.insert(id.to_string(), metric);
        true
    }

    fn has_metric(&self, id: &str) -> bool {
        self.metrics.read().unwrap().contains_key(id)
    }

    fn update(&self, elapsed: i64, id: &str, labels: &[&str]) {
        self.with_metric(id, |m| m.update_time(elapsed, labels));
    }

    fn add_val(&self, value: i64, id: &str, labels: &[&str]) {
        self.with_metric(id, |m| m.add_value(value, labels));
    }

    fn sub_val(&self, value: i64, id: &str, labels: &[&str]) {
        self.with_metric(id, |m| m.sub_value(value, labels));
    }

    fn set_val(&self, value: i64, id: &str, labels: &[&str]) {
        self.with_metric(id, |m| m.set_value(value, labels));
    }

    fn remove_logging(&self, id: &str, labels: &[&str]) {
        self.with_metric(id, |m| m.remove_series(labels));
    }

    fn snapshot(&self) -> RegistrySnapshot {
        let metrics = self
            .metrics
            .read()
            .unwrap()
            .iter()
            .map(|(id, metric)| (id.clone(), metric.snapshot()))
            .collect();
        RegistrySnapshot { metrics }
    }
}
