// SPDX-License-Identifier: MIT

use std::panic::{self, AssertUnwindSafe};

use async_channel::Sender;
use log::{error, warn};

use crate::job::BoxedJob;

/// A job that kept failing and was handed to the dead-letter channel.
#[derive(Debug)]
pub struct FailedJob {
    pub job: BoxedJob,
    pub error: anyhow::Error,
    pub attempts: usize,
}

/// What a worker does when [`Job::process`](crate::job::Job::process) fails or panics.
#[derive(Debug, Clone, Default)]
pub enum FailurePolicy {
    /// Fire and forget: the error is dropped.
    Discard,
    /// Log the error at warn level.
    #[default]
    Log,
    /// Run the job again, at most `retries` more times.
    Retry { retries: usize },
    /// Retry, then hand the job to `sink`.
    DeadLetter {
        retries: usize,
        sink: Sender<FailedJob>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded { attempts: usize },
    Failed { attempts: usize },
    DeadLettered { attempts: usize },
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Succeeded { .. })
    }
}

impl FailurePolicy {
    fn retries(&self) -> usize {
        match self {
            FailurePolicy::Discard | FailurePolicy::Log => 0,
            FailurePolicy::Retry { retries } | FailurePolicy::DeadLetter { retries, .. } => {
                *retries
            }
        }
    }

    /// Processes `job` until it succeeds or the policy gives up on it.
    ///
    /// Runs on the calling thread and must not be called from inside an
    /// executor, since jobs are free to block on futures themselves.
    pub fn run(&self, mut job: BoxedJob) -> JobOutcome {
        let max_attempts = self.retries() + 1;
        let mut attempts = 0;
        let error = loop {
            attempts += 1;
            match process_catching_panics(&mut job) {
                Ok(()) => return JobOutcome::Succeeded { attempts },
                Err(e) if attempts < max_attempts => {
                    warn!(
                        "job '{}' failed (attempt {}/{}), retrying: {:#}",
                        job.desc(),
                        attempts,
                        max_attempts,
                        e
                    );
                }
                Err(e) => break e,
            }
        };

        match self {
            FailurePolicy::Discard => JobOutcome::Failed { attempts },
            FailurePolicy::Log | FailurePolicy::Retry { .. } => {
                warn!(
                    "job '{}' failed after {} attempt(s): {:#}",
                    job.desc(),
                    attempts,
                    error
                );
                JobOutcome::Failed { attempts }
            }
            FailurePolicy::DeadLetter { sink, .. } => {
                let failed = FailedJob {
                    job,
                    error,
                    attempts,
                };
                match sink.send_blocking(failed) {
                    Ok(()) => JobOutcome::DeadLettered { attempts },
                    Err(e) => {
                        let failed = e.into_inner();
                        error!(
                            "dead-letter channel closed, dropping job '{}': {:#}",
                            failed.job.desc(),
                            failed.error
                        );
                        JobOutcome::Failed { attempts }
                    }
                }
            }
        }
    }
}

fn process_catching_panics(job: &mut BoxedJob) -> anyhow::Result<()> {
    match panic::catch_unwind(AssertUnwindSafe(|| job.process())) {
        Ok(result) => result,
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_string());
            Err(anyhow::anyhow!("job panicked: {msg}"))
        }
    }
}
