use crate::job::{BoxedJob, ClosureJob};
use crate::worker::{DefaultWorker, Worker};
use crate::{
    DispatchError, Dispatcher, DispatcherConfig, FailurePolicy, FailurePolicyConfig,
    MAX_WORKERS_METRIC_ID,
};

use metric_sink::{MetricRegistry, MultiLogger};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Blocks jobs until opened. Same pattern as a state + condvar pair.
#[derive(Clone, Default)]
struct Gate {
    state: Arc<(Mutex<bool>, Condvar)>,
}

impl Gate {
    fn open(&self) {
        let (lock, cvar) = &*self.state;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
    }

    fn wait(&self) {
        let (lock, cvar) = &*self.state;
        let mut open = lock.lock().unwrap();
        while !*open {
            open = cvar.wait(open).unwrap();
        }
    }
}

fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

fn counting_job(counter: &Arc<AtomicUsize>) -> BoxedJob {
    let counter = counter.clone();
    ClosureJob::boxed("count", move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
}

fn gated_job(gate: &Gate, started: &Arc<AtomicUsize>) -> BoxedJob {
    let gate = gate.clone();
    let started = started.clone();
    ClosureJob::boxed("gated", move || {
        started.fetch_add(1, Ordering::SeqCst);
        gate.wait();
        Ok(())
    })
}

//
// 1. Concurrency never exceeds the number of workers
//
#[test]
fn test_concurrency_is_bounded_by_worker_count() {
    let registry = Arc::new(MetricRegistry::new());
    let mut dispatcher = Dispatcher::builder("bounded")
        .max_workers(3)
        .metrics(registry.clone())
        .build();

    let active = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let processed = Arc::new(AtomicUsize::new(0));

    for i in 0..100 {
        let active = active.clone();
        let max_seen = max_seen.clone();
        let processed = processed.clone();
        dispatcher
            .dispatch(ClosureJob::boxed(format!("job-{i}"), move || {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(1));
                active.fetch_sub(1, Ordering::SeqCst);
                processed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .unwrap();
    }
    dispatcher.wait_until_finished();

    assert_eq!(processed.load(Ordering::SeqCst), 100);
    let max_seen = max_seen.load(Ordering::SeqCst);
    assert!((1..=3).contains(&max_seen), "saw {max_seen} concurrent jobs");

    let reported = registry
        .snapshot()
        .value(MAX_WORKERS_METRIC_ID, &["bounded"])
        .unwrap();
    assert!((1..=3).contains(&reported), "reported {reported}");
}

//
// 2. Every job is processed exactly once
//
#[test]
fn test_all_jobs_processed_exactly_once() {
    let mut dispatcher = Dispatcher::builder("once").max_workers(4).build();
    let seen = Arc::new(Mutex::new(Vec::new()));

    for i in 0..50 {
        let seen = seen.clone();
        dispatcher
            .dispatch(ClosureJob::boxed("record", move || {
                seen.lock().unwrap().push(i);
                Ok(())
            }))
            .unwrap();
    }
    dispatcher.wait_until_finished();

    let mut seen = seen.lock().unwrap().clone();
    seen.sort();
    assert_eq!(seen, (0..50).collect::<Vec<_>>());
}

#[test]
fn test_counter_reaches_job_count() {
    let mut dispatcher = Dispatcher::new("counter");
    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..50 {
        dispatcher.dispatch(counting_job(&counter)).unwrap();
    }
    dispatcher.wait_until_finished();
    assert_eq!(counter.load(Ordering::SeqCst), 50);
}

//
// 3. Max used workers follows the busy count and can be reset
//
#[test]
fn test_max_workers_used_and_reset() {
    let registry = Arc::new(MetricRegistry::new());
    let mut dispatcher = Dispatcher::builder("tracked")
        .max_workers(4)
        .metrics(registry.clone())
        .build();

    let gate = Gate::default();
    let started = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        dispatcher.dispatch(gated_job(&gate, &started)).unwrap();
    }
    assert!(wait_until(|| started.load(Ordering::SeqCst) == 3));

    // workers that had not registered yet count as busy, so 4 is possible
    let used = dispatcher.max_workers_used();
    assert!((3..=4).contains(&used), "max used {used}");
    assert_eq!(
        registry.snapshot().value(MAX_WORKERS_METRIC_ID, &["tracked"]),
        Some(used as i64)
    );

    gate.open();
    dispatcher.reset_max_workers_used();
    assert_eq!(dispatcher.max_workers_used(), 0);

    let counter = Arc::new(AtomicUsize::new(0));
    dispatcher.dispatch(counting_job(&counter)).unwrap();
    assert!(wait_until(|| counter.load(Ordering::SeqCst) == 1));
    assert!(dispatcher.max_workers_used() >= 1);

    dispatcher.wait_until_finished();
}

#[test]
fn test_reset_while_dispatching() {
    let dispatcher = Arc::new(Dispatcher::builder("resets").max_workers(4).build());
    let counter = Arc::new(AtomicUsize::new(0));
    let stop = Arc::new(AtomicBool::new(false));

    let resetter = {
        let dispatcher = dispatcher.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            let mut resets = 0usize;
            while !stop.load(Ordering::SeqCst) {
                dispatcher.reset_max_workers_used();
                assert!(dispatcher.max_workers_used() <= 4);
                resets += 1;
            }
            resets
        })
    };
    let submitter = {
        let dispatcher = dispatcher.clone();
        let counter = counter.clone();
        thread::spawn(move || {
            for _ in 0..500 {
                dispatcher.dispatch(counting_job(&counter)).unwrap();
            }
        })
    };

    submitter.join().unwrap();
    assert!(wait_until(|| counter.load(Ordering::SeqCst) == 500));
    stop.store(true, Ordering::SeqCst);
    assert!(resetter.join().unwrap() > 0);

    dispatcher.reset_max_workers_used();
    assert_eq!(dispatcher.max_workers_used(), 0);
    dispatcher.dispatch(counting_job(&counter)).unwrap();
    assert!(wait_until(|| counter.load(Ordering::SeqCst) == 501));
    let used = dispatcher.max_workers_used();
    assert!((1..=4).contains(&used), "max used {used}");

    let mut dispatcher = Arc::try_unwrap(dispatcher).unwrap();
    dispatcher.wait_until_finished();
    assert_eq!(counter.load(Ordering::SeqCst), 501);
}

//
// 4. A full pool and a full queue block the caller
//
#[test]
fn test_backpressure_blocks_submitter() {
    let mut dispatcher = Dispatcher::builder("backpressure")
        .max_workers(1)
        .queue_capacity(1)
        .build();
    let queue = dispatcher.job_queue().unwrap();

    let gate = Gate::default();
    let started = Arc::new(AtomicUsize::new(0));
    let counter = Arc::new(AtomicUsize::new(0));

    queue.send_blocking(gated_job(&gate, &started)).unwrap();
    assert!(wait_until(|| started.load(Ordering::SeqCst) == 1));

    // one job waits in the dispatch loop for a worker, one in the queue
    queue.send_blocking(counting_job(&counter)).unwrap();
    queue.send_blocking(counting_job(&counter)).unwrap();

    let submitted = Arc::new(AtomicBool::new(false));
    let submitter = {
        let queue = queue.clone();
        let submitted = submitted.clone();
        let counter = counter.clone();
        thread::spawn(move || {
            queue.send_blocking(counting_job(&counter)).unwrap();
            submitted.store(true, Ordering::SeqCst);
        })
    };

    thread::sleep(Duration::from_millis(100));
    assert!(!submitted.load(Ordering::SeqCst));

    gate.open();
    submitter.join().unwrap();
    assert!(submitted.load(Ordering::SeqCst));

    drop(queue);
    dispatcher.wait_until_finished();
    assert_eq!(counter.load(Ordering::SeqCst), 3);
}

#[test]
fn test_try_dispatch_reports_full_queue() {
    let mut dispatcher = Dispatcher::builder("full")
        .max_workers(1)
        .queue_capacity(1)
        .build();
    let gate = Gate::default();
    let started = Arc::new(AtomicUsize::new(0));
    let counter = Arc::new(AtomicUsize::new(0));

    dispatcher.dispatch(gated_job(&gate, &started)).unwrap();
    assert!(wait_until(|| started.load(Ordering::SeqCst) == 1));
    dispatcher.dispatch(counting_job(&counter)).unwrap();
    dispatcher.dispatch(counting_job(&counter)).unwrap();

    assert_eq!(
        dispatcher.try_dispatch(counting_job(&counter)),
        Err(DispatchError::Full)
    );

    gate.open();
    dispatcher.wait_until_finished();
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

//
// 5. Lifecycle
//
#[test]
fn test_dispatch_after_close_fails() {
    let mut dispatcher = Dispatcher::builder("closed").max_workers(2).build();
    dispatcher.close();
    let counter = Arc::new(AtomicUsize::new(0));
    assert_eq!(
        dispatcher.dispatch(counting_job(&counter)),
        Err(DispatchError::Closed)
    );
    assert_eq!(
        dispatcher.try_dispatch(counting_job(&counter)),
        Err(DispatchError::Closed)
    );
    assert!(dispatcher.job_queue().is_none());
    dispatcher.wait_until_finished();
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

#[test]
fn test_wait_until_finished_waits_for_running_jobs() {
    let mut dispatcher = Dispatcher::builder("drain").max_workers(2).build();
    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..4 {
        let done = done.clone();
        dispatcher
            .dispatch(ClosureJob::boxed("slow", move || {
                thread::sleep(Duration::from_millis(20));
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .unwrap();
    }
    dispatcher.wait_until_finished();
    assert_eq!(done.load(Ordering::SeqCst), 4);
    assert_eq!(dispatcher.max_workers_used(), 0);
}

//
// 6. Options
//
#[test]
fn test_invalid_sizes_keep_defaults() {
    let mut dispatcher = Dispatcher::builder("defaults")
        .max_workers(0)
        .queue_capacity(0)
        .build();
    assert_eq!(dispatcher.max_workers(), crate::DEFAULT_MAX_WORKERS);
    assert_eq!(
        dispatcher.job_queue().unwrap().capacity(),
        Some(crate::DEFAULT_MAX_WORKERS)
    );
    dispatcher.wait_until_finished();
}

#[test]
fn test_supplied_job_queue_is_used() {
    let (tx, rx) = async_channel::bounded(2);
    let mut dispatcher = Dispatcher::builder("supplied")
        .max_workers(2)
        .job_queue(tx.clone(), rx)
        .build();
    let counter = Arc::new(AtomicUsize::new(0));

    tx.send_blocking(counting_job(&counter)).unwrap();
    dispatcher.dispatch(counting_job(&counter)).unwrap();
    drop(tx);

    dispatcher.wait_until_finished();
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[test]
fn test_custom_worker_factory() {
    let created = Arc::new(Mutex::new(Vec::new()));
    let factory_created = created.clone();
    let mut dispatcher = Dispatcher::builder("custom")
        .max_workers(3)
        .worker_factory(move |pool, number| {
            factory_created.lock().unwrap().push(number);
            Box::new(DefaultWorker::new("custom", pool, number, FailurePolicy::Discard))
                as Box<dyn Worker>
        })
        .build();

    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..10 {
        dispatcher.dispatch(counting_job(&counter)).unwrap();
    }
    dispatcher.wait_until_finished();

    assert_eq!(counter.load(Ordering::SeqCst), 10);
    let mut created = created.lock().unwrap().clone();
    created.sort();
    assert_eq!(created, vec![0, 1, 2]);
}

#[test]
fn test_from_config() {
    let config = DispatcherConfig {
        name: "configured".into(),
        max_workers: Some(2),
        queue_capacity: Some(5),
        failure_policy: FailurePolicyConfig::Retry { retries: 1 },
    };
    let mut dispatcher = crate::DispatcherBuilder::from_config(&config).build();
    assert_eq!(dispatcher.name(), "configured");
    assert_eq!(dispatcher.max_workers(), 2);
    assert_eq!(dispatcher.job_queue().unwrap().capacity(), Some(5));

    let attempts = Arc::new(AtomicUsize::new(0));
    let a = attempts.clone();
    dispatcher
        .dispatch(ClosureJob::boxed("fails", move || {
            a.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("always")
        }))
        .unwrap();
    dispatcher.wait_until_finished();
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

//
// 7. Failures
//
#[test]
fn test_failed_jobs_reach_dead_letter_channel() {
    let (dead_tx, dead_rx) = async_channel::unbounded();
    let mut dispatcher = Dispatcher::builder("dead-letter")
        .max_workers(2)
        .failure_policy(FailurePolicy::DeadLetter {
            retries: 1,
            sink: dead_tx,
        })
        .build();

    let counter = Arc::new(AtomicUsize::new(0));
    dispatcher.dispatch(counting_job(&counter)).unwrap();
    dispatcher
        .dispatch(ClosureJob::boxed("broken", || anyhow::bail!("no route")))
        .unwrap();
    dispatcher.wait_until_finished();

    assert_eq!(counter.load(Ordering::SeqCst), 1);
    let failed = dead_rx.try_recv().unwrap();
    assert_eq!(failed.job.desc(), "broken");
    assert_eq!(failed.attempts, 2);
    assert_eq!(failed.error.to_string(), "no route");
    assert!(dead_rx.try_recv().is_err());
}

#[test]
fn test_panicking_job_keeps_pool_size() {
    let mut dispatcher = Dispatcher::builder("panics").max_workers(1).build();
    dispatcher
        .dispatch(ClosureJob::boxed("boom", || panic!("boom")))
        .unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        dispatcher.dispatch(counting_job(&counter)).unwrap();
    }
    dispatcher.wait_until_finished();
    assert_eq!(counter.load(Ordering::SeqCst), 3);
}

//
// 8. Several dispatchers can share one sink
//
#[test]
fn test_shared_sink_is_labelled_per_dispatcher() {
    let registry: Arc<dyn MultiLogger> = Arc::new(MetricRegistry::new());
    let mut first = Dispatcher::builder("first")
        .max_workers(2)
        .metrics(registry.clone())
        .build();
    let mut second = Dispatcher::builder("second")
        .max_workers(2)
        .metrics(registry.clone())
        .build();

    let counter = Arc::new(AtomicUsize::new(0));
    first.dispatch(counting_job(&counter)).unwrap();
    second.dispatch(counting_job(&counter)).unwrap();
    first.wait_until_finished();
    second.wait_until_finished();

    let snapshot = registry.snapshot();
    assert!(snapshot.value(MAX_WORKERS_METRIC_ID, &["first"]).is_some());
    assert!(snapshot.value(MAX_WORKERS_METRIC_ID, &["second"]).is_some());
    assert_eq!(snapshot.metrics.len(), 1);
}

//
// 9. Jobs run on a plain thread and may block on futures
//
#[test]
fn test_job_can_block_on_futures() {
    let dispatcher = Arc::new(Dispatcher::builder("nested").max_workers(2).build());
    let (result_tx, result_rx) = async_channel::unbounded();
    let handle = Arc::downgrade(&dispatcher);

    dispatcher
        .dispatch(ClosureJob::boxed("nested", move || {
            let value = futures::executor::block_on(async { 7 });
            let used = handle.upgrade().map(|d| d.max_workers_used());
            result_tx.send_blocking((value, used))?;
            Ok(())
        }))
        .unwrap();

    // a failing job drops its sender without sending, so this would error
    let (value, used) = result_rx.recv_blocking().unwrap();
    assert_eq!(value, 7);
    let used = used.unwrap();
    assert!((1..=2).contains(&used), "max used {used}");

    let mut dispatcher = Arc::try_unwrap(dispatcher).unwrap();
    dispatcher.wait_until_finished();
}
