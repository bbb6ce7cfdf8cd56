//! # Error types used by the taskherd runtime and job bodies.
//!
//! Two error enums cover the two failure domains:
//!
//! - [`NodeError`]: failures of the coordination runtime itself (configuration,
//!   lifecycle misuse, log I/O).
//! - [`JobError`]: failures of an individual job execution on the owning node.
//!
//! Both types provide `as_label()` for stable snake_case labels in logs.

use std::time::Duration;

use thiserror::Error;

use crate::log::LogError;

/// # Errors produced by the coordination runtime.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum NodeError {
    /// The node was asked to do something before `run()` completed.
    #[error("node '{node}' is not running")]
    NotRunning {
        /// Unique node id.
        node: String,
    },

    /// `run()` was called on a node that already shut down.
    #[error("node '{node}' already shut down")]
    AlreadyStopped {
        /// Unique node id.
        node: String,
    },

    /// Attempted to register a task name that is already present.
    #[error("task '{name}' already registered on this node")]
    TaskAlreadyRegistered {
        /// The duplicate task name.
        name: String,
    },

    /// Startup-time configuration problem (bad topic, unreachable log, ...).
    #[error("configuration error: {reason}")]
    Config {
        /// What was wrong.
        reason: String,
    },

    /// The underlying sync-topic client failed fatally.
    #[error(transparent)]
    Log(#[from] LogError),

    /// A supervised loop did not come up within the startup deadline.
    #[error("loop '{name}' failed to start within {deadline:?}")]
    StartupTimeout {
        /// Name of the supervised loop.
        name: &'static str,
        /// How long we waited.
        deadline: Duration,
    },
}

impl NodeError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            NodeError::NotRunning { .. } => "node_not_running",
            NodeError::AlreadyStopped { .. } => "node_already_stopped",
            NodeError::TaskAlreadyRegistered { .. } => "task_already_registered",
            NodeError::Config { .. } => "node_config",
            NodeError::Log(_) => "node_log",
            NodeError::StartupTimeout { .. } => "node_startup_timeout",
        }
    }
}

/// # Errors produced by a job execution.
///
/// A failing execution never affects the claim; the task returns to
/// `CLAIMED_BY_NODE` and runs again next period. `Canceled` signals
/// cooperative termination and is not an error in the traditional sense.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum JobError {
    /// Execution exceeded the definition's `max_duration`.
    #[error("job timed out after {max:?}")]
    Timeout {
        /// The configured limit.
        max: Duration,
    },

    /// Execution failed; the next periodic run may succeed.
    #[error("job failed: {reason}")]
    Fail {
        /// Failure description.
        reason: String,
    },

    /// Non-recoverable failure of the job body.
    #[error("job failed fatally: {reason}")]
    Fatal {
        /// Failure description.
        reason: String,
    },

    /// The job observed cancellation and exited early.
    #[error("job canceled")]
    Canceled,
}

impl JobError {
    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            JobError::Timeout { .. } => "job_timeout",
            JobError::Fail { .. } => "job_failed",
            JobError::Fatal { .. } => "job_fatal",
            JobError::Canceled => "job_canceled",
        }
    }

    /// True for failures that do not indicate a broken job body.
    pub fn is_transient(&self) -> bool {
        matches!(self, JobError::Timeout { .. } | JobError::Fail { .. })
    }
}
