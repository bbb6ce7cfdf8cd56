//! # Job abstraction and task definitions.
//!
//! A [`Job`] is the user-supplied body of a periodic task: an async,
//! cancelable unit of work spawned once per execution. [`TaskDefinition`]
//! bundles the job with its timing contract (period, per-execution limit,
//! claim-heartbeat cadence, resurrection timeout) and is immutable after
//! registration.
//!
//! ## Rules
//! - `run(&self)` is `Fn`, not `FnMut`: each call creates a fresh,
//!   independent future. Shared state goes behind an explicit `Arc`.
//! - Job bodies **must** check `ctx.is_cancelled()` periodically; the owner
//!   cancels them on voluntary release and shutdown.
//! - At-most-one active executor is the contract; a body is either
//!   idempotent or its user accepts reruns after a crash.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::JobError;

/// Boxed future returned by [`Job::run`].
pub type BoxJobFuture = Pin<Box<dyn Future<Output = Result<(), JobError>> + Send + 'static>>;

/// Shared handle to a job body.
pub type JobRef = Arc<dyn Job>;

/// Asynchronous, cancelable body of a periodic task.
pub trait Job: Send + Sync + 'static {
    /// Creates a new future executing one run of the job.
    fn run(&self, ctx: CancellationToken) -> BoxJobFuture;
}

/// Function-backed job implementation.
///
/// ## Example
/// ```rust
/// use tokio_util::sync::CancellationToken;
/// use taskherd::{JobFn, JobRef, JobError};
///
/// let job: JobRef = JobFn::arc(|_ctx: CancellationToken| async {
///     Ok::<_, JobError>(())
/// });
/// ```
pub struct JobFn<F> {
    f: F,
}

impl<F> JobFn<F> {
    /// Wraps a closure creating a fresh future per run.
    pub fn new(f: F) -> Self {
        Self { f }
    }

    /// Wraps the closure and returns it as a shared [`JobRef`].
    pub fn arc<Fut>(f: F) -> Arc<Self>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        Arc::new(Self::new(f))
    }
}

impl<F, Fut> Job for JobFn<F>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    fn run(&self, ctx: CancellationToken) -> BoxJobFuture {
        Box::pin((self.f)(ctx))
    }
}

/// Immutable description of a registered task.
#[derive(Clone)]
pub struct TaskDefinition {
    name: String,
    job: JobRef,
    period: Duration,
    max_duration: Duration,
    claimed_signal_period: Duration,
    resurrection: Duration,
}

impl TaskDefinition {
    /// Starts a builder for a task named `name`.
    pub fn builder(name: impl Into<String>) -> TaskDefinitionBuilder {
        TaskDefinitionBuilder::new(name)
    }

    /// Unique task name; also the partition key of its signals.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The job body.
    pub fn job(&self) -> JobRef {
        Arc::clone(&self.job)
    }

    /// Desired cadence between execution starts.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Upper bound for one execution; the executor is canceled past it.
    pub fn max_duration(&self) -> Duration {
        self.max_duration
    }

    /// How often the owner reasserts a live claim.
    pub fn claimed_signal_period(&self) -> Duration {
        self.claimed_signal_period
    }

    /// Silence interval after which peers presume the task orphaned.
    pub fn resurrection(&self) -> Duration {
        self.resurrection
    }
}

impl std::fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("name", &self.name)
            .field("period", &self.period)
            .field("max_duration", &self.max_duration)
            .field("claimed_signal_period", &self.claimed_signal_period)
            .field("resurrection", &self.resurrection)
            .finish_non_exhaustive()
    }
}

/// Fluent builder for [`TaskDefinition`].
#[derive(Clone)]
pub struct TaskDefinitionBuilder {
    name: String,
    period: Duration,
    max_duration: Duration,
    claimed_signal_period: Duration,
    resurrection: Duration,
}

impl TaskDefinitionBuilder {
    /// Creates a builder with conservative defaults:
    /// `period = 10s`, `max_duration = 30s`, `claimed_signal_period = 5s`,
    /// `resurrection = 60s`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            period: Duration::from_secs(10),
            max_duration: Duration::from_secs(30),
            claimed_signal_period: Duration::from_secs(5),
            resurrection: Duration::from_secs(60),
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    pub fn with_max_duration(mut self, max: Duration) -> Self {
        self.max_duration = max;
        self
    }

    pub fn with_claimed_signal_period(mut self, period: Duration) -> Self {
        self.claimed_signal_period = period;
        self
    }

    pub fn with_resurrection(mut self, timeout: Duration) -> Self {
        self.resurrection = timeout;
        self
    }

    /// Builds the definition around an existing job handle.
    pub fn build(self, job: JobRef) -> TaskDefinition {
        TaskDefinition {
            name: self.name,
            job,
            period: self.period,
            max_duration: self.max_duration,
            claimed_signal_period: self.claimed_signal_period,
            resurrection: self.resurrection,
        }
    }

    /// Builds the definition from a closure.
    pub fn build_fn<F, Fut>(self, f: F) -> TaskDefinition
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        let job: JobRef = JobFn::arc(f);
        self.build(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_applies_overrides() {
        let def = TaskDefinition::builder("t")
            .with_period(Duration::from_secs(2))
            .with_max_duration(Duration::from_secs(3))
            .with_claimed_signal_period(Duration::from_secs(1))
            .with_resurrection(Duration::from_secs(9))
            .build_fn(|_ctx| async { Ok(()) });

        assert_eq!(def.name(), "t");
        assert_eq!(def.period(), Duration::from_secs(2));
        assert_eq!(def.max_duration(), Duration::from_secs(3));
        assert_eq!(def.claimed_signal_period(), Duration::from_secs(1));
        assert_eq!(def.resurrection(), Duration::from_secs(9));
    }
}
