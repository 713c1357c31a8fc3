// SPDX-License-Identifier: MIT

/// A unit of work handed to exactly one worker.
///
/// Ownership moves from the caller into the job queue and from there to the
/// worker that processes it. Nothing is returned to the caller; a failed
/// `process` is handled by the dispatcher's [`FailurePolicy`](crate::policy::FailurePolicy).
pub trait Job: Send + 'static {
    /// Free-form description, used for logging
    fn desc(&self) -> &str {
        "job"
    }

    /// Performs the work. May be called again if the failure policy retries.
    fn process(&mut self) -> anyhow::Result<()>;
}

pub type BoxedJob = Box<dyn Job>;

impl std::fmt::Debug for dyn Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job").field("desc", &self.desc()).finish()
    }
}

/// A job backed by a closure.
pub struct ClosureJob {
    desc: String,
    f: Box<dyn FnMut() -> anyhow::Result<()> + Send + 'static>,
}

impl ClosureJob {
    pub fn new<F>(desc: impl Into<String>, f: F) -> Self
    where
        F: FnMut() -> anyhow::Result<()> + Send + 'static,
    {
        Self {
            desc: desc.into(),
            f: Box::new(f),
        }
    }

    pub fn boxed<F>(desc: impl Into<String>, f: F) -> BoxedJob
    where
        F: FnMut() -> anyhow::Result<()> + Send + 'static,
    {
        Box::new(Self::new(desc, f))
    }
}

impl Job for ClosureJob {
    fn desc(&self) -> &str {
        &self.desc
    }

    fn process(&mut self) -> anyhow::Result<()> {
        (self.f)()
    }
}
