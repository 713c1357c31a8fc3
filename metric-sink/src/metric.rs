// SPDX-License-Identifier: MIT

use log::warn;
use serde::Serialize;
use smallvec::SmallVec;

/// Label values identifying one series of a metric vec.
pub type LabelValues = SmallVec<[String; 4]>;

/// A family of series sharing a name, a help text and a set of label names.
///
/// Not every metric kind supports every operation. Unsupported operations are
/// logged and otherwise ignored, so callers never have to branch on the kind.
pub trait MetricVec: Send + Sync {
    /// Record an elapsed time in microseconds.
    fn update_time(&self, elapsed: i64, labels: &[&str]);

    fn add_value(&self, value: i64, labels: &[&str]);

    fn sub_value(&self, value: i64, labels: &[&str]);

    fn set_value(&self, value: i64, labels: &[&str]);

    /// Stop reporting the series identified by `labels`.
    fn remove_series(&self, labels: &[&str]);

    fn snapshot(&self) -> MetricSnapshot;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Gauge,
    Counter,
    Histogram,
}

/// Point-in-time copy of a metric vec, ready to be serialized.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSnapshot {
    pub name: String,
    pub help: String,
    pub kind: MetricKind,
    pub label_names: Vec<String>,
    pub series: Vec<SeriesSnapshot>,
}

impl MetricSnapshot {
    /// Finds the series with exactly these label values.
    pub fn series(&self, labels: &[&str]) -> Option<&SeriesSnapshot> {
        self.series.iter().find(|s| {
            s.labels.len() == labels.len() && s.labels.iter().zip(labels).all(|(a, b)| a == b)
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesSnapshot {
    pub labels: Vec<String>,
    #[serde(flatten)]
    pub value: SeriesValue,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SeriesValue {
    Value { value: i64 },
    Distribution(DistributionSnapshot),
}

impl SeriesValue {
    pub fn as_value(&self) -> Option<i64> {
        match self {
            SeriesValue::Value { value } => Some(*value),
            SeriesValue::Distribution(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DistributionSnapshot {
    pub count: u64,
    pub sum: i64,
    pub min: i64,
    pub max: i64,
    /// `(upper bound in ms, cumulative count)`
    pub buckets: Vec<(f64, u64)>,
}

/// Name, help and label names shared by all metric kinds.
#[derive(Debug, Clone)]
pub(crate) struct MetricDesc {
    pub name: String,
    pub help: String,
    pub label_names: Vec<String>,
}

impl MetricDesc {
    pub fn new(name: &str, help: &str, label_names: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            help: help.to_string(),
            label_names: label_names.iter().map(|l| l.to_string()).collect(),
        }
    }

    /// Turns label values into a series key. Returns `None` (and logs) on arity mismatch.
    pub fn key(&self, labels: &[&str]) -> Option<LabelValues> {
        if labels.len() != self.label_names.len() {
            warn!(
                "metric {} expects {} label values ({:?}), got {:?}",
                self.name,
                self.label_names.len(),
                self.label_names,
                labels
            );
            return None;
        }
        Some(labels.iter().map(|l| l.to_string()).collect())
    }

    pub fn unsupported(&self, kind: MetricKind, operation: &str) {
        warn!("cannot use {} for {:?} metric {}", operation, kind, self.name);
    }

    pub fn snapshot(&self, kind: MetricKind, mut series: Vec<SeriesSnapshot>) -> MetricSnapshot {
        series.sort_by(|a, b| a.labels.cmp(&b.labels));
        MetricSnapshot {
            name: self.name.clone(),
            help: self.help.clone(),
            kind,
            label_names: self.label_names.clone(),
            series,
        }
    }
}
