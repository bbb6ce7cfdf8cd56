//! # Runtime events emitted by the node.
//!
//! [`EventKind`] classifies what happened; [`Event`] carries the metadata.
//! Events describe the node's own view (state changes, claims won and lost,
//! executions) and are consumed by in-process observers only. They never
//! travel over the sync topic and play no part in claim arbitration.
//!
//! ## Ordering
//! Each event gets a process-wide monotonically increasing `seq`, so
//! subscribers can order events delivered through async channels.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::SystemTime;

use crate::tasks::TaskState;

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of runtime events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// The signals watcher joined the topic and is positioned.
    WatcherStarted,
    /// A task changed its local state.
    StateChanged,
    /// This node won a claim (own `CLAIMING` echo matched the baseline).
    ClaimWon,
    /// This node observed the task going to another executor.
    ClaimLost,
    /// A job execution started on this node.
    HandlingStarted,
    /// A job execution finished on this node.
    HandlingFinished,
    /// A task transitioned to the dead `ERROR` state.
    TaskErrored,
    /// `shutdown()` was invoked.
    ShutdownRequested,
    /// All supervised loops exited.
    NodeStopped,
}

/// Runtime event with optional metadata.
#[derive(Clone, Debug)]
pub struct Event {
    /// Process-wide, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp (logging only; may go backwards under NTP).
    pub at: SystemTime,
    /// The kind of event.
    pub kind: EventKind,
    /// Unique id of the emitting node.
    pub node: String,
    /// Task name, if the event concerns one task.
    pub task: Option<String>,
    /// New local state, for `StateChanged` / `TaskErrored`.
    pub state: Option<TaskState>,
    /// Error message, if the event represents a failure.
    pub error: Option<String>,
}

impl Event {
    /// Creates a new event of the given kind with the next sequence number.
    pub fn new(kind: EventKind, node: &str, at: SystemTime) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at,
            kind,
            node: node.to_string(),
            task: None,
            state: None,
            error: None,
        }
    }

    /// Attaches a task name.
    pub fn with_task(mut self, name: impl Into<String>) -> Self {
        self.task = Some(name.into());
        self
    }

    /// Attaches the task's new local state.
    pub fn with_state(mut self, state: TaskState) -> Self {
        self.state = Some(state);
        self
    }

    /// Attaches an error message.
    pub fn with_error(mut self, msg: impl Into<String>) -> Self {
        self.error = Some(msg.into());
        self
    }
}
