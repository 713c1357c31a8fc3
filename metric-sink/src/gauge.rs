// SPDX-License-Identifier: MIT

use std::collections::HashMap;
use std::sync::Mutex;

use log::error;

use crate::metric::{
    LabelValues, MetricDesc, MetricKind, MetricSnapshot, MetricVec, SeriesSnapshot, SeriesValue,
};

/// A value per label set that can go up and down.
#[derive(Debug)]
pub struct GaugeMetric {
    desc: MetricDesc,
    series: Mutex<HashMap<LabelValues, i64>>,
}

impl GaugeMetric {
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

    fn modify(&self, labels: &[&str], f: impl FnOnce(&mut i64)) {
        if let Some(key) = self.desc.key(labels) {
            let mut series = self.series.lock().unwrap();
            f(series.entry(key).or_insert(0));
        }
    }
}

impl MetricVec for GaugeMetric {
    fn update_time(&self, _elapsed: i64, _labels: &[&str]) {
        self.desc.unsupported(MetricKind::Gauge, "update_time");
    }

    fn add_value(&self, value: i64, labels: &[&str]) {
        self.modify(labels, |v| *v += value);
    }

    fn sub_value(&self, value: i64, labels: &[&str]) {
        self.modify(labels, |v| *v -= value);
    }

    fn set_value(&self, value: i64, labels: &[&str]) {
        self.modify(labels, |v| *v = value);
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
        self.desc.snapshot(MetricKind::Gauge, series)
    }
}
