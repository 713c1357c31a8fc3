// SPDX-License-Identifier: MIT

use std::collections::HashMap;
use std::sync::Mutex;

use log::error;

use crate::metric::{
    DistributionSnapshot, LabelValues, MetricDesc, MetricKind, MetricSnapshot, MetricVec,
    SeriesSnapshot, SeriesValue,
};

/// Upper bounds in milliseconds.
pub const DEFAULT_BUCKETS: &[f64] = &[
    0.5, 1.0, 2.5, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
];

#[derive(Debug, Clone)]
struct Distribution {
    count: u64,
    sum: i64,
    min: i64,
    max: i64,
    buckets: Vec<u64>,
}

impl Distribution {
    fn new(bucket_count: usize) -> Self {
        Self {
            count: 0,
            sum: 0,
            min: i64::MAX,
            max: 0,
            buckets: vec![0; bucket_count],
        }
    }
}

/// Latency distribution per label set. Observations are given in microseconds
/// and bucketed in milliseconds.
#[derive(Debug)]
pub struct HistogramMetric {
    desc: MetricDesc,
    bounds: Vec<f64>,
    series: Mutex<HashMap<LabelValues, Distribution>>,
}

impl HistogramMetric {
    pub fn new(name: &str, help: &str, label_names: &[&str]) -> Self {
        Self::with_buckets(name, help, label_names, DEFAULT_BUCKETS)
    }

    pub fn with_buckets(name: &str, help: &str, label_names: &[&str], bounds: &[f64]) -> Self {
        let mut bounds = bounds.to_vec();
        bounds.sort_by(|a, b| a.total_cmp(b));
        bounds.dedup();
        Self {
            desc: MetricDesc::new(name, help, label_names),
            bounds,
            series: Mutex::new(HashMap::new()),
        }
    }

    pub fn count(&self, labels: &[&str]) -> u64 {
        self.desc
            .key(labels)
            .and_then(|key| self.series.lock().unwrap().get(&key).map(|d| d.count))
            .unwrap_or(0)
    }
}

impl MetricVec for HistogramMetric {
    fn update_time(&self, elapsed: i64, labels: &[&str]) {
        let Some(key) = self.desc.key(labels) else {
            return;
        };
        let millis = elapsed as f64 / 1000.0;
        let mut series = self.series.lock().unwrap();
        let dist = series
            .entry(key)
            .or_insert_with(|| Distribution::new(self.bounds.len()));
        dist.count += 1;
        dist.sum += elapsed;
        dist.min = dist.min.min(elapsed);
        dist.max = dist.max.max(elapsed);
        if let Some(idx) = self.bounds.iter().position(|b| millis <= *b) {
            dist.buckets[idx] += 1;
        }
    }

    fn add_value(&self, _value: i64, _labels: &[&str]) {
        self.desc.unsupported(MetricKind::Histogram, "add_value");
    }

    fn sub_value(&self, _value: i64, _labels: &[&str]) {
        self.desc.unsupported(MetricKind::Histogram, "sub_value");
    }

    fn set_value(&self, _value: i64, _labels: &[&str]) {
        self.desc.unsupported(MetricKind::Histogram, "set_value");
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
            .map(|(labels, dist)| {
                let mut cumulative = 0;
                let buckets = self
                    .bounds
                    .iter()
                    .zip(&dist.buckets)
                    .map(|(bound, n)| {
                        cumulative += n;
                        (*bound, cumulative)
                    })
                    .collect();
                SeriesSnapshot {
                    labels: labels.to_vec(),
                    value: SeriesValue::Distribution(DistributionSnapshot {
                        count: dist.count,
                        sum: dist.sum,
                        min: if dist.count == 0 { 0 } else { dist.min },
                        max: dist.max,
                        buckets,
                    }),
                }
            })
            .collect();
        self.desc.snapshot(MetricKind::Histogram, series)
    }
}
