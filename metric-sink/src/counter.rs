// SPDX-License-Identifier: MIT

use std::collections::HashMap;
use std::sync::Mutex;

use log::{error, warn};

use crate::metric::{
    LabelValues, MetricDesc, MetricKind, MetricSnapshot, MetricVec, SeriesSnapshot, SeriesValue,
};

/// A monotonically increasing count per label set.
#[derive(Debug)]
pub struct CounterMetric {
    desc: MetricDesc,
    series: Mutex<HashMap<LabelValues, i64>>,
}

impl CounterMetric {
    pub fn new(name: &str, help: &str, label_names: &[&str]) -> Self {
        Self {
            desc: MetricDesc::new(name, help, label_names),
            series: Mutex::new(HashMap::new()),
        }
    }

    pub fn value(&self, labels: &[&str]) -> Option<i64> {
        let key = self.desc.key(labels)?;
        self.series.lock().unwrap().get(&key).copied()
    }
}

impl MetricVec for CounterMetric {
    fn update_time(&self, _elapsed: i64, _labels: &[&str]) {
        self.desc.unsupported(MetricKind::Counter, "update_time");
    }

    fn add_value(&self, value: i64, labels: &[&str]) {
        if value < 0 {
            warn!(
                "counter {} cannot decrease, ignoring add of {}",
                self.desc.name, value
            );
            return;
        }
        if let Some(key) = self.desc.key(labels) {
            *self.series.lock().unwrap().entry(key).or_insert(0) += value;
        }
    }

    fn sub_value(&self, _value: i64, _labels: &[&str]) {
        self.desc.unsupported(MetricKind::Counter, "sub_value");
    }

    fn set_value(&self, _value: i64, _labels: &[&str]) {
        self.desc.unsupported(MetricKind::Counter, "set_value");
    }

    fn remove_series(&self, labels: &[&str]) {
        let removed = self
            .desc
            .key(labels)
            .and_then(|key| self.series.lock().unwrap().remove(&key));
        if removed.is_none() {
            error!(
                "could not delete metric {} with labels {:?}",
                self.desc.name, labels
            );
        }
    }

    fn snapshot(&self) -> MetricSnapshot {
        let series = self
            .series
            .lock()
            .unwrap()
            .iter()
            .map(|(labels, value)| SeriesSnapshot {
                labels: labels.to_vec(),
                value: SeriesValue::Value { value: *value },
            })
            .collect();
        self.desc.snapshot(MetricKind::Counter, series)
    }
}
