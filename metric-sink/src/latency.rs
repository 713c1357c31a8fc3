// SPDX-License-Identifier: MIT

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use async_channel::{Receiver, Sender};
use async_io::Timer;
use futures::{FutureExt, StreamExt};
use log::{debug, info};
use serde::Serialize;

use crate::metric::MetricVec;
use crate::registry::{MetricRegistry, MultiLogger, RegistrySnapshot};

const UPDATE_CAPACITY: usize = 100;

/// Per-module request count and latency aggregate, in microseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatencyMessage {
    module: String,
    requests: u64,
    total_latency: i64,
    max_latency: i64,
    min_latency: i64,
}

/// What gets pushed for a module at the end of an interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyReport {
    pub module: String,
    pub request_rate: u64,
    pub mean_latency: i64,
    pub max_latency: i64,
    pub min_latency: i64,
}

impl LatencyMessage {
    pub fn new(module: &str) -> Self {
        Self {
            module: module.to_string(),
            requests: 0,
            total_latency: 0,
            max_latency: 0,
            min_latency: i64::MAX,
        }
    }

    pub fn update(&mut self, elapsed: i64) {
        self.requests += 1;
        self.total_latency += elapsed;
        self.min_latency = self.min_latency.min(elapsed);
        self.max_latency = self.max_latency.max(elapsed);
    }

    /// `None` while no request has been recorded since the last reset.
    pub fn report(&self) -> Option<LatencyReport> {
        if self.requests == 0 {
            return None;
        }
        Some(LatencyReport {
            module: self.module.clone(),
            request_rate: self.requests,
            mean_latency: self.total_latency / self.requests as i64,
            max_latency: self.max_latency,
            min_latency: if self.min_latency == i64::MAX {
                0
            } else {
                self.min_latency
            },
        })
    }

    pub fn reset(&mut self) {
        self.requests = 0;
        self.total_latency = 0;
        self.max_latency = 0;
        self.min_latency = i64::MAX;
    }
}

#[derive(Debug)]
struct LatencyPacket {
    module: String,
    latency: i64,
}

type Messages = Arc<Mutex<HashMap<String, LatencyMessage>>>;

/// Tracks request rate and latency per module and pushes one JSON line per
/// module every interval. Metric operations are forwarded to an inner sink.
pub struct RateLatencyLogger {
    registry: Arc<dyn MultiLogger>,
    messages: Messages,
    update_tx: Sender<LatencyPacket>,
    update_rx: Receiver<LatencyPacket>,
    running: AtomicBool,
}

impl RateLatencyLogger {
    pub fn new() -> Self {
        Self::with_registry(Arc::new(MetricRegistry::new()))
    }

    pub fn with_registry(registry: Arc<dyn MultiLogger>) -> Self {
        let (update_tx, update_rx) = async_channel::bounded(UPDATE_CAPACITY);
        Self {
            registry,
            messages: Arc::new(Mutex::new(HashMap::new())),
            update_tx,
            update_rx,
            running: AtomicBool::new(false),
        }
    }

    /// Starts a measurement for `module`.
    pub fn tic(&self, module: &str) -> Instant {
        let mut messages = self.messages.lock().unwrap();
        if !messages.contains_key(module) {
            messages.insert(module.to_string(), LatencyMessage::new(module));
        }
        Instant::now()
    }

    /// Records the time elapsed since `start`. Ignored until [`run`](Self::run) was called.
    pub fn toc(&self, module: &str, start: Instant) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        let packet = LatencyPacket {
            module: module.to_string(),
            latency: start.elapsed().as_micros() as i64,
        };
        if self.update_tx.send_blocking(packet).is_err() {
            debug!("latency logger stopped, dropping measurement for {}", module);
        }
    }

    /// Logs the aggregate of every module that saw requests and resets all of them.
    pub fn push(&self) {
        push_messages(&self.messages);
    }

    /// Current aggregates, without resetting them.
    pub fn reports(&self) -> Vec<LatencyReport> {
        let mut reports: Vec<_> = self
            .messages
            .lock()
            .unwrap()
            .values()
            .filter_map(LatencyMessage::report)
            .collect();
        reports.sort_by(|a, b| a.module.cmp(&b.module));
        reports
    }

    /// Starts the background thread that applies measurements and pushes every
    /// `interval`. Calling this more than once has no effect.
    pub fn run(&self, interval: Duration) {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let messages = self.messages.clone();
        let update_rx = self.update_rx.clone();
        thread::spawn(move || {
            futures::executor::block_on(latency_loop(messages, update_rx, interval));
        });
    }
}

impl Default for RateLatencyLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLatencyLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLatencyLogger")
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}

fn push_messages(messages: &Messages) {
    for message in messages.lock().unwrap().values_mut() {
        if let Some(report) = message.report() {
            match serde_json::to_string(&report) {
                Ok(line) => info!("{}", line),
                Err(e) => debug!("could not serialize latency report: {e}"),
            }
        }
        message.reset();
    }
}

async fn latency_loop(messages: Messages, update_rx: Receiver<LatencyPacket>, interval: Duration) {
    let mut ticker = Timer::interval(interval);
    loop {
        futures::select! {
            _ = ticker.next().fuse() => push_messages(&messages),
            packet = update_rx.recv().fuse() => match packet {
                Ok(packet) => {
                    let mut messages = messages.lock().unwrap();
                    messages
                        .entry(packet.module.clone())
                        .or_insert_with(|| LatencyMessage::new(&packet.module))
                        .update(packet.latency);
                }
                Err(_) => break,
            },
        }
    }
    debug!("latency logger loop ended");
}

impl MultiLogger for RateLatencyLogger {
    fn add_new_metric(&self, id: &str, metric: Arc<dyn MetricVec>) -> bool {
        self.registry.add_new_metric(id, metric)
    }

    fn has_metric(&self, id: &str) -> bool {
        self.registry.has_metric(id)
    }

    fn update(&self, elapsed: i64, id: &str, labels: &[&str]) {
        self.registry.update(elapsed, id, labels)
    }

    fn add_val(&self, value: i64, id: &str, labels: &[&str]) {
        self.registry.add_val(value, id, labels)
    }

    fn sub_val(&self, value: i64, id: &str, labels: &[&str]) {
        self.registry.sub_val(value, id, labels)
    }

    fn set_val(&self, value: i64, id: &str, labels: &[&str]) {
        self.registry.set_val(value, id, labels)
    }

    fn remove_logging(&self, id: &str, labels: &[&str]) {
        self.registry.remove_logging(id, labels)
    }

    fn snapshot(&self) -> RegistrySnapshot {
        self.registry.snapshot()
    }
}
