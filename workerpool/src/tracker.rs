// SPDX-License-Identifier: MIT

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use async_channel::{Receiver, Sender};
use futures::channel::oneshot;
use log::debug;
use metric_sink::MultiLogger;

/// Metric id under which the high-water mark of busy workers is reported.
pub const MAX_WORKERS_METRIC_ID: &str = "MAX-WORKERS";

const EVENT_CAPACITY: usize = 100;

#[derive(Debug)]
pub enum TrackerEvent {
    /// Number of workers busy right now.
    Sample(usize),
    Reset,
    Snapshot(oneshot::Sender<usize>),
}

/// Handle to the tracker thread. The thread exits once every handle is dropped.
#[derive(Debug, Clone)]
pub struct TrackerHandle {
    tx: Sender<TrackerEvent>,
}

/// Spawns the thread that owns the max-used-workers counter.
///
/// Events are applied in the order they were sent, so a reset only forgets
/// samples that were sent before it.
pub fn spawn_tracker(
    name: impl Into<String>,
    metrics: Arc<dyn MultiLogger>,
) -> (TrackerHandle, JoinHandle<()>) {
    let name = name.into();
    let (tx, rx) = async_channel::bounded(EVENT_CAPACITY);
    let thread_handle = thread::Builder::new()
        .name(format!("{}-tracker", name))
        .spawn(move || futures::executor::block_on(track_workers(name, metrics, rx)))
        .unwrap_or_else(|e| panic!("failed to spawn worker tracker thread: {e}"));
    (TrackerHandle { tx }, thread_handle)
}

async fn track_workers(name: String, metrics: Arc<dyn MultiLogger>, rx: Receiver<TrackerEvent>) {
    let mut max_used_workers = 0usize;
    while let Ok(event) = rx.recv().await {
        match event {
            TrackerEvent::Reset => {
                debug!("[{}] setting max workers to zero", name);
                max_used_workers = 0;
            }
            TrackerEvent::Sample(busy) => {
                if busy > max_used_workers {
                    max_used_workers = busy;
                    debug!("[{}] setting max workers to {}", name, busy);
                    metrics.set_val(busy as i64, MAX_WORKERS_METRIC_ID, &[name.as_str()]);
                }
            }
            TrackerEvent::Snapshot(reply) => {
                let _ = reply.send(max_used_workers);
            }
        }
    }
    debug!("[{}] worker tracker stopped", name);
}

impl TrackerHandle {
    pub async fn sample(&self, busy: usize) {
        let _ = self.tx.send(TrackerEvent::Sample(busy)).await;
    }

    pub fn sample_blocking(&self, busy: usize) {
        let _ = self.tx.send_blocking(TrackerEvent::Sample(busy));
    }

    pub fn reset(&self) {
        let _ = self.tx.send_blocking(TrackerEvent::Reset);
    }

    /// Current high-water mark, or 0 if the tracker is gone.
    pub fn current_max(&self) -> usize {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send_blocking(TrackerEvent::Snapshot(reply_tx)).is_err() {
            return 0;
        }
        futures::executor::block_on(reply_rx).unwrap_or(0)
    }
}
