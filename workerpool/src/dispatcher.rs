// SPDX-License-Identifier: MIT

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use async_channel::{Receiver, Sender, TrySendError};
use log::{debug, error, info};
use metric_sink::{GaugeMetric, MetricRegistry, MultiLogger};

use crate::config::DispatcherConfig;
use crate::error::DispatchError;
use crate::job::BoxedJob;
use crate::policy::FailurePolicy;
use crate::tracker::{spawn_tracker, TrackerHandle, MAX_WORKERS_METRIC_ID};
use crate::worker::{DefaultWorker, JobSender, Worker, WorkerFactory};

pub const DEFAULT_MAX_WORKERS: usize = 10;

/// Configures and starts a [`Dispatcher`].
///
/// Invalid sizes (zero workers, zero queue capacity) are ignored and the
/// defaults are kept.
pub struct DispatcherBuilder {
    name: String,
    max_workers: usize,
    queue_capacity: Option<usize>,
    job_queue: Option<(Sender<BoxedJob>, Receiver<BoxedJob>)>,
    worker_factory: Option<WorkerFactory>,
    metrics: Option<Arc<dyn MultiLogger>>,
    failure_policy: FailurePolicy,
}

impl DispatcherBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_workers: DEFAULT_MAX_WORKERS,
            queue_capacity: None,
            job_queue: None,
            worker_factory: None,
            metrics: None,
            failure_policy: FailurePolicy::default(),
        }
    }

    pub fn from_config(config: &DispatcherConfig) -> Self {
        let mut builder = Self::new(config.name.clone()).failure_policy(config.failure_policy.into());
        if let Some(max_workers) = config.max_workers {
            builder = builder.max_workers(max_workers);
        }
        if let Some(capacity) = config.queue_capacity {
            builder = builder.queue_capacity(capacity);
        }
        builder
    }

    /// Number of workers. Default is 10.
    pub fn max_workers(mut self, max_workers: usize) -> Self {
        if max_workers > 0 {
            self.max_workers = max_workers;
        }
        self
    }

    /// Capacity of the job queue created by the dispatcher. Defaults to the
    /// number of workers. Has no effect when a queue is supplied.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        if capacity > 0 {
            self.queue_capacity = Some(capacity);
        }
        self
    }

    /// Use an existing queue instead of creating one.
    pub fn job_queue(mut self, sender: Sender<BoxedJob>, receiver: Receiver<BoxedJob>) -> Self {
        self.job_queue = Some((sender, receiver));
        self
    }

    /// Replaces the default worker. The factory is responsible for handling
    /// job failures; the failure policy is only passed to [`DefaultWorker`].
    pub fn worker_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(crate::worker::WorkerPool, usize) -> Box<dyn Worker> + Send + Sync + 'static,
    {
        self.worker_factory = Some(Arc::new(factory));
        self
    }

    /// Sink for the max-used-workers gauge. A private registry is used otherwise.
    pub fn metrics(mut self, metrics: Arc<dyn MultiLogger>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Starts the workers, the tracker and the dispatch loop.
    pub fn build(self) -> Dispatcher {
        let DispatcherBuilder {
            name,
            max_workers,
            queue_capacity,
            job_queue,
            worker_factory,
            metrics,
            failure_policy,
        } = self;

        let (queue_tx, queue_rx) = job_queue
            .unwrap_or_else(|| async_channel::bounded(queue_capacity.unwrap_or(max_workers)));
        let metrics = metrics.unwrap_or_else(|| Arc::new(MetricRegistry::new()));
        metrics.add_new_metric(
            MAX_WORKERS_METRIC_ID,
            Arc::new(GaugeMetric::new(
                "max_workers",
                "What are the max number of workers used",
                &["DispatcherName"],
            )),
        );
        let worker_factory =
            worker_factory.unwrap_or_else(|| DefaultWorker::factory(name.clone(), failure_policy));

        let (pool_tx, pool_rx) = async_channel::bounded::<JobSender>(max_workers);
        let workers: Vec<Box<dyn Worker>> = (0..max_workers)
            .map(|number| {
                let mut worker = worker_factory(pool_tx.clone(), number);
                worker.start();
                worker
            })
            .collect();
        drop(pool_tx);

        let (tracker, tracker_handle) = spawn_tracker(name.clone(), metrics.clone());

        let dispatch_tracker = tracker.clone();
        let dispatch_name = name.clone();
        let dispatch_handle = thread::Builder::new()
            .name(format!("{}-dispatch", name))
            .spawn(move || {
                futures::executor::block_on(dispatch_loop(
                    dispatch_name,
                    max_workers,
                    queue_rx,
                    pool_rx,
                    dispatch_tracker,
                    workers,
                ))
            })
            .unwrap_or_else(|e| panic!("failed to spawn dispatch thread: {e}"));

        debug!("[{}] new dispatcher created with {} workers", name, max_workers);

        Dispatcher {
            name,
            max_workers,
            job_queue: Some(queue_tx),
            tracker: Some(tracker),
            metrics,
            dispatch_handle: Some(dispatch_handle),
            tracker_handle: Some(tracker_handle),
        }
    }
}

/// Hands jobs from a queue to a fixed pool of workers.
///
/// At most `max_workers` jobs are processed at the same time: a job is only
/// passed to a worker after that worker has announced itself as idle. The
/// highest number of simultaneously busy workers is reported to the metrics
/// sink as `MAX-WORKERS`, labelled with the dispatcher's name.
pub struct Dispatcher {
    name: String,
    max_workers: usize,
    job_queue: Option<Sender<BoxedJob>>,
    tracker: Option<TrackerHandle>,
    metrics: Arc<dyn MultiLogger>,
    dispatch_handle: Option<JoinHandle<()>>,
    tracker_handle: Option<JoinHandle<()>>,
}

impl Dispatcher {
    /// Dispatcher with default settings: 10 workers, a queue of 10 and a private
    /// metrics registry.
    pub fn new(name: impl Into<String>) -> Self {
        Self::builder(name).build()
    }

    pub fn builder(name: impl Into<String>) -> DispatcherBuilder {
        DispatcherBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn metrics(&self) -> Arc<dyn MultiLogger> {
        self.metrics.clone()
    }

    /// Sender side of the job queue, for callers that submit from elsewhere.
    /// `None` once the dispatcher is closed.
    pub fn job_queue(&self) -> Option<Sender<BoxedJob>> {
        self.job_queue.clone()
    }

    /// Queues a job, blocking while the queue is full.
    pub fn dispatch(&self, job: BoxedJob) -> Result<(), DispatchError> {
        let queue = self.job_queue.as_ref().ok_or(DispatchError::Closed)?;
        queue.send_blocking(job).map_err(|_| DispatchError::Closed)
    }

    /// Queues a job if there is room.
    pub fn try_dispatch(&self, job: BoxedJob) -> Result<(), DispatchError> {
        let queue = self.job_queue.as_ref().ok_or(DispatchError::Closed)?;
        queue.try_send(job).map_err(|e| match e {
            TrySendError::Full(_) => DispatchError::Full,
            TrySendError::Closed(_) => DispatchError::Closed,
        })
    }

    /// Forgets the max-used-workers value seen so far, e.g. at the start of a
    /// reporting interval.
    pub fn reset_max_workers_used(&self) {
        debug!("[{}] resetting max worker count", self.name);
        if let Some(tracker) = &self.tracker {
            tracker.reset();
        }
    }

    /// Highest number of busy workers since the last reset.
    pub fn max_workers_used(&self) -> usize {
        self.tracker.as_ref().map(|t| t.current_max()).unwrap_or(0)
    }

    /// Stops accepting jobs through this handle. The dispatch loop ends when
    /// every clone of the queue sender is gone and the queue is drained.
    pub fn close(&mut self) {
        self.job_queue = None;
    }

    /// Closes the dispatcher and blocks until every queued job has been
    /// processed and all threads have ended.
    pub fn wait_until_finished(&mut self) {
        self.close();
        if let Some(handle) = self.dispatch_handle.take() {
            if handle.join().is_err() {
                error!("[{}] dispatch loop panicked", self.name);
            }
        }
        self.tracker = None;
        if let Some(handle) = self.tracker_handle.take() {
            if handle.join().is_err() {
                error!("[{}] worker tracker panicked", self.name);
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.name)
            .field("max_workers", &self.max_workers)
            .field("closed", &self.job_queue.is_none())
            .finish()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.close();
    }
}

async fn dispatch_loop(
    name: String,
    max_workers: usize,
    queue: Receiver<BoxedJob>,
    pool: Receiver<JobSender>,
    tracker: TrackerHandle,
    mut workers: Vec<Box<dyn Worker>>,
) {
    'jobs: while let Ok(mut job) = queue.recv().await {
        loop {
            // blocks until a worker is idle
            let job_tx = match pool.recv().await {
                Ok(job_tx) => job_tx,
                Err(_) => {
                    error!("[{}] no workers left, dropping {:?}", name, job);
                    break 'jobs;
                }
            };
            tracker.sample(max_workers.saturating_sub(pool.len())).await;
            match job_tx.send(job).await {
                Ok(()) => break,
                Err(e) => {
                    debug!("[{}] worker stopped before taking the job, retrying", name);
                    job = e.into_inner();
                }
            }
        }
    }

    info!("[{}] job queue closed, stopping workers", name);
    for worker in &workers {
        worker.stop();
    }
    for worker in workers.iter_mut() {
        worker.join();
    }
    debug!("[{}] dispatch loop ended", name);
}
