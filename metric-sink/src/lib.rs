// SPDX-License-Identifier: MIT

//! Labelled metrics for in-process reporting.
//!
//! A [`MultiLogger`] is the sink: callers address metrics by id and pass the
//! label values of the series they report on. [`MetricRegistry`] is the plain
//! implementation, [`RateLatencyLogger`] adds per-module request rate and
//! latency tracking on top of one.

pub mod counter;
pub mod gauge;
pub mod histogram;
pub mod latency;
pub mod metric;
pub mod registry;

pub use counter::CounterMetric;
pub use gauge::GaugeMetric;
pub use histogram::HistogramMetric;
pub use latency::{LatencyMessage, LatencyReport, RateLatencyLogger};
pub use metric::{MetricKind, MetricSnapshot, MetricVec, SeriesSnapshot, SeriesValue};
pub use registry::{MetricRegistry, MultiLogger, RegistrySnapshot};
