// SPDX-License-Identifier: MIT

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use async_channel::{Receiver, Sender};
use futures::FutureExt;
use log::debug;

use crate::job::BoxedJob;
use crate::policy::FailurePolicy;

/// A worker's private job channel.
pub type JobSender = Sender<BoxedJob>;

/// Shared pool into which idle workers publish their job channel.
pub type WorkerPool = Sender<JobSender>;

/// Builds worker number `n` for the given pool.
pub type WorkerFactory = Arc<dyn Fn(WorkerPool, usize) -> Box<dyn Worker> + Send + Sync>;

pub trait Worker: Send {
    /// Starts the worker loop in the background.
    fn start(&mut self);

    /// Asks the worker to stop. Returns immediately; the worker notices the
    /// request the next time it is idle.
    fn stop(&self);

    /// Blocks until the worker loop has ended.
    fn join(&mut self) {}
}

/// Worker running its loop on a dedicated thread.
///
/// Each cycle the worker publishes its job channel into the pool and then
/// waits for either a job or a stop request. Stopping is not preemptive: a
/// worker that is processing a job, or still publishing itself, finishes that
/// cycle first. A job that was handed over right before the stop is still
/// processed.
pub struct DefaultWorker {
    name: String,
    number: usize,
    pool: WorkerPool,
    job_tx: JobSender,
    job_rx: Receiver<BoxedJob>,
    quit_tx: Sender<()>,
    quit_rx: Receiver<()>,
    policy: FailurePolicy,
    thread_handle: Option<JoinHandle<()>>,
}

impl DefaultWorker {
    pub fn new(name: impl Into<String>, pool: WorkerPool, number: usize, policy: FailurePolicy) -> Self {
        // capacity 1: the dispatcher hands over a job without waiting for the
        // worker to pick it up, the worker is known to be idle at that point
        let (job_tx, job_rx) = async_channel::bounded(1);
        let (quit_tx, quit_rx) = async_channel::bounded(1);
        Self {
            name: name.into(),
            number,
            pool,
            job_tx,
            job_rx,
            quit_tx,
            quit_rx,
            policy,
            thread_handle: None,
        }
    }

    pub fn number(&self) -> usize {
        self.number
    }

    /// The factory the dispatcher uses unless told otherwise.
    pub fn factory(name: impl Into<String>, policy: FailurePolicy) -> WorkerFactory {
        let name = name.into();
        Arc::new(move |pool, number| {
            Box::new(DefaultWorker::new(name.clone(), pool, number, policy.clone())) as Box<dyn Worker>
        })
    }
}

impl std::fmt::Debug for DefaultWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultWorker")
            .field("name", &self.name)
            .field("number", &self.number)
            .field("running", &self.thread_handle.is_some())
            .finish()
    }
}

impl Worker for DefaultWorker {
    fn start(&mut self) {
        if self.thread_handle.is_some() {
            return;
        }
        let number = self.number;
        let pool = self.pool.clone();
        let job_tx = self.job_tx.clone();
        let job_rx = self.job_rx.clone();
        let quit_rx = self.quit_rx.clone();
        let policy = self.policy.clone();
        let thread_handle = thread::Builder::new()
            .name(format!("{}-worker-{}", self.name, self.number))
            .spawn(move || worker_loop(number, pool, job_tx, job_rx, quit_rx, policy))
            .unwrap_or_else(|e| panic!("failed to spawn worker thread: {e}"));
        self.thread_handle = Some(thread_handle);
    }

    fn stop(&self) {
        // a full channel means a stop request is already pending
        let _ = self.quit_tx.try_send(());
    }

    fn join(&mut self) {
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                debug!("[{}] worker {} ended with a panic", self.name, self.number());
            }
        }
    }
}

/// Jobs run on the worker thread itself, outside of any executor, so a job
/// may block on futures of its own.
fn worker_loop(
    number: usize,
    pool: WorkerPool,
    job_tx: JobSender,
    job_rx: Receiver<BoxedJob>,
    quit_rx: Receiver<()>,
    policy: FailurePolicy,
) {
    while let Some(job) =
        futures::executor::block_on(next_job(number, &pool, &job_tx, &job_rx, &quit_rx))
    {
        policy.run(job);
    }

    // refuse further jobs, but finish one that was already handed over
    job_rx.close();
    while let Ok(job) = job_rx.try_recv() {
        policy.run(job);
    }
    debug!("worker {} stopped", number);
}

/// Announces the worker as idle and waits for a job. `None` means stop.
async fn next_job(
    number: usize,
    pool: &WorkerPool,
    job_tx: &JobSender,
    job_rx: &Receiver<BoxedJob>,
    quit_rx: &Receiver<()>,
) -> Option<BoxedJob> {
    if pool.send(job_tx.clone()).await.is_err() {
        debug!("worker {}: pool closed", number);
        return None;
    }

    futures::select_biased! {
        _ = quit_rx.recv().fuse() => None,
        job = job_rx.recv().fuse() => job.ok(),
    }
}
