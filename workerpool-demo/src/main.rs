// SPDX-License-Identifier: MIT
// workerpool-demo: pushes synthetic jobs through a dispatcher
//
// - Every job sleeps for a while and optionally fails.
// - Job latency is tracked per dispatcher with a rate/latency logger.
// - The max-used-workers gauge is printed and reset every report interval.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::Parser;
use log::info;
use metric_sink::{CounterMetric, HistogramMetric, MultiLogger, RateLatencyLogger};
use workerpool::{
    ClosureJob, Dispatcher, DispatcherBuilder, DispatcherConfig, FailurePolicy,
    MAX_WORKERS_METRIC_ID,
};

const FAILED_JOBS_METRIC_ID: &str = "FAILED-JOBS";
const JOB_LATENCY_METRIC_ID: &str = "JOB-LATENCY";

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Dispatcher name, used as metric label
    #[arg(long, default_value = "demo")]
    name: String,

    /// Number of workers
    #[arg(long)]
    workers: Option<usize>,

    /// Capacity of the job queue
    #[arg(long = "queue-capacity")]
    queue_capacity: Option<usize>,

    /// Number of jobs to submit
    #[arg(long, default_value_t = 100)]
    jobs: usize,

    /// How long every job sleeps
    #[arg(long = "job-millis", default_value_t = 10)]
    job_millis: u64,

    /// Let every n-th job fail (0 disables failures)
    #[arg(long = "fail-every", default_value_t = 0)]
    fail_every: usize,

    /// Retries for failed jobs
    #[arg(long, default_value_t = 0)]
    retries: usize,

    /// Dispatcher config (JSON). Note that this excludes --workers, --queue-capacity and --retries.
    #[arg(long, value_name = "JSON_FILE")]
    config: Option<PathBuf>,

    /// Interval for printing and resetting the max-used-workers gauge
    #[arg(long = "report-interval-ms", default_value_t = 500)]
    report_interval_ms: u64,
}

fn validate_args(args: &Args) -> Result<(), String> {
    if args.jobs == 0 {
        return Err("--jobs must be at least 1".into());
    }
    if args.report_interval_ms == 0 {
        return Err("--report-interval-ms must be at least 1".into());
    }
    if args.config.is_some()
        && (args.workers.is_some() || args.queue_capacity.is_some() || args.retries > 0)
    {
        return Err(
            "--config must not be used in combination with --workers, --queue-capacity or --retries"
                .into(),
        );
    }
    Ok(())
}

fn builder_from_args(args: &Args) -> anyhow::Result<DispatcherBuilder> {
    if let Some(path) = &args.config {
        let config = DispatcherConfig::from_file(path)
            .with_context(|| format!("loading dispatcher config {}", path.display()))?;
        return Ok(DispatcherBuilder::from_config(&config));
    }

    let mut builder = Dispatcher::builder(args.name.clone());
    if let Some(workers) = args.workers {
        builder = builder.max_workers(workers);
    }
    if let Some(capacity) = args.queue_capacity {
        builder = builder.queue_capacity(capacity);
    }
    if args.retries > 0 {
        builder = builder.failure_policy(FailurePolicy::Retry {
            retries: args.retries,
        });
    }
    Ok(builder)
}

fn register_metrics(metrics: &dyn MultiLogger) {
    metrics.add_new_metric(
        FAILED_JOBS_METRIC_ID,
        Arc::new(CounterMetric::new(
            "failed_jobs",
            "Job attempts that returned an error",
            &["DispatcherName"],
        )),
    );
    metrics.add_new_metric(
        JOB_LATENCY_METRIC_ID,
        Arc::new(HistogramMetric::new(
            "job_latency",
            "Time spent in a job",
            &["DispatcherName"],
        )),
    );
}

fn run(args: Args) -> anyhow::Result<()> {
    let latency = Arc::new(RateLatencyLogger::new());
    latency.run(Duration::from_millis(args.report_interval_ms));
    register_metrics(latency.as_ref());

    let mut dispatcher = builder_from_args(&args)?
        .metrics(latency.clone())
        .build();
    let name = dispatcher.name().to_string();
    info!(
        "Starting {} jobs on dispatcher '{}' with {} workers",
        args.jobs,
        name,
        dispatcher.max_workers()
    );

    let processed = Arc::new(AtomicUsize::new(0));
    let job_duration = Duration::from_millis(args.job_millis);
    let report_interval = Duration::from_millis(args.report_interval_ms);
    let mut last_report = Instant::now();

    for n in 1..=args.jobs {
        let latency = latency.clone();
        let processed = processed.clone();
        let name = name.clone();
        let fail = args.fail_every > 0 && n % args.fail_every == 0;
        let job = ClosureJob::boxed(format!("job-{n}"), move || {
            let start = latency.tic(&name);
            thread::sleep(job_duration);
            latency.toc(&name, start);
            latency.update(
                start.elapsed().as_micros() as i64,
                JOB_LATENCY_METRIC_ID,
                &[name.as_str()],
            );
            if fail {
                latency.add_val(1, FAILED_JOBS_METRIC_ID, &[name.as_str()]);
                bail!("job {n} failed on purpose");
            }
            processed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        dispatcher
            .dispatch(job)
            .with_context(|| format!("submitting job {n}"))?;

        if last_report.elapsed() >= report_interval {
            println!(
                "max workers used in the last {:?}: {}",
                last_report.elapsed(),
                dispatcher.max_workers_used()
            );
            dispatcher.reset_max_workers_used();
            last_report = Instant::now();
        }
    }

    println!("max workers used: {}", dispatcher.max_workers_used());
    dispatcher.wait_until_finished();
    latency.push();

    let snapshot = latency.snapshot();
    println!(
        "processed {} of {} jobs, gauge {:?}",
        processed.load(Ordering::SeqCst),
        args.jobs,
        snapshot.value(MAX_WORKERS_METRIC_ID, &[name.as_str()])
    );
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if let Err(e) = validate_args(&args) {
        eprintln!("Error: {e}");
        std::process::exit(2);
    }

    if let Err(e) = run(args) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
