// SPDX-License-Identifier: MIT

//! # Bounded worker pool with utilization tracking
//!
//! - A [`Dispatcher`] owns a job queue and a fixed number of workers.
//! - Idle workers publish their private job channel into a shared pool; the
//!   dispatch loop takes one channel per job, so at most `max_workers` jobs run
//!   at once and a full pool blocks the queue (backpressure).
//! - Every hand-over emits a sample of how many workers are busy. A tracker
//!   thread keeps the maximum and reports new maxima to a
//!   [`MultiLogger`](metric_sink::MultiLogger) as `MAX-WORKERS`.
//! - Failed jobs are handled by a [`FailurePolicy`].
//!
//! ```text
//!         job queue ──> dispatch loop ──> worker channel ──> worker
//!                            ^   |                             |
//!                            |   └── sample ──> tracker ──> metrics sink
//!                            └──────── worker pool <───────────┘
//! ```

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod job;
pub mod policy;
pub mod tracker;
pub mod worker;

pub use config::{DispatcherConfig, FailurePolicyConfig};
pub use dispatcher::{Dispatcher, DispatcherBuilder, DEFAULT_MAX_WORKERS};
pub use error::{ConfigError, DispatchError};
pub use job::{BoxedJob, ClosureJob, Job};
pub use policy::{FailedJob, FailurePolicy, JobOutcome};
pub use tracker::MAX_WORKERS_METRIC_ID;
pub use worker::{DefaultWorker, Worker, WorkerFactory, WorkerPool};

#[cfg(test)]
mod tests;
