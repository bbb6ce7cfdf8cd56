//! # Per-node runtime state of a registered task.
//!
//! [`Task`] is the mutable record the state machine drives. It lives in the
//! node's registry; only the watcher loop mutates it, one signal at a time,
//! which is what keeps per-task transitions serialized.

use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::log::Offset;

use super::definition::TaskDefinition;

/// Local view of where a task stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    /// Just registered; immediately driven to `Initiating`.
    #[serde(rename = "NEW")]
    New,
    /// Waiting for the grace period or a reason to claim.
    #[serde(rename = "INITIATING")]
    Initiating,
    /// `CLAIMING` published; waiting for the own echo.
    #[serde(rename = "CLAIMING")]
    Claiming,
    /// This node holds the claim.
    #[serde(rename = "CLAIMED_BY_NODE")]
    ClaimedByNode,
    /// This node holds the claim and an execution is in flight.
    #[serde(rename = "HANDLING_BY_NODE")]
    HandlingByNode,
    /// `UNCLAIMED` published; waiting for the own echo.
    #[serde(rename = "UNCLAIMING")]
    Unclaiming,
    /// A peer holds the claim.
    #[serde(rename = "CLAIMED_BY_OTHER")]
    ClaimedByOther,
    /// A peer holds the claim and reported an execution in flight.
    #[serde(rename = "HANDLING_BY_OTHER")]
    HandlingByOther,
    /// Dead state after a protocol violation; operator intervention only.
    #[serde(rename = "ERROR")]
    Error,
}

impl TaskState {
    /// True while this node alone may execute the task.
    pub fn is_locally_owned(&self) -> bool {
        matches!(self, TaskState::ClaimedByNode | TaskState::HandlingByNode)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::New => "NEW",
            TaskState::Initiating => "INITIATING",
            TaskState::Claiming => "CLAIMING",
            TaskState::ClaimedByNode => "CLAIMED_BY_NODE",
            TaskState::HandlingByNode => "HANDLING_BY_NODE",
            TaskState::Unclaiming => "UNCLAIMING",
            TaskState::ClaimedByOther => "CLAIMED_BY_OTHER",
            TaskState::HandlingByOther => "HANDLING_BY_OTHER",
            TaskState::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Mutable runtime record of one registered task.
pub struct Task {
    definition: Arc<TaskDefinition>,
    state: TaskState,
    unclaimed_signal_offset: Option<Offset>,
    state_started: SystemTime,
    claiming_timestamp: Option<SystemTime>,
    last_claimed_info: Option<SystemTime>,
    last_startup: Option<SystemTime>,
    current_executor: Option<String>,
    executor_token: Option<CancellationToken>,
}

impl Task {
    /// Creates the runtime record in state `New`.
    pub fn new(definition: Arc<TaskDefinition>, now: SystemTime) -> Self {
        Self {
            definition,
            state: TaskState::New,
            unclaimed_signal_offset: None,
            state_started: now,
            claiming_timestamp: None,
            last_claimed_info: None,
            last_startup: None,
            current_executor: None,
            executor_token: None,
        }
    }

    pub fn definition(&self) -> &Arc<TaskDefinition> {
        &self.definition
    }

    pub fn name(&self) -> &str {
        self.definition.name()
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Applies a state transition with the associated bookkeeping.
    pub fn set_state(&mut self, to: TaskState, now: SystemTime) {
        match to {
            TaskState::Claiming => {
                if self.state != TaskState::Claiming {
                    self.state_started = now;
                    self.claiming_timestamp = Some(now);
                }
            }
            TaskState::ClaimedByOther | TaskState::HandlingByOther => {
                self.last_claimed_info = Some(now);
                self.claiming_timestamp = None;
                if self.state != to {
                    self.state_started = now;
                }
            }
            TaskState::HandlingByNode => {
                if self.state != TaskState::HandlingByNode {
                    self.state_started = now;
                    self.last_startup = Some(now);
                }
            }
            _ => {
                if self.state != to {
                    self.state_started = now;
                }
            }
        }
        self.state = to;
    }

    /// Baseline for claim references: offset of the last observed
    /// `UNCLAIMED` for this task.
    pub fn unclaimed_signal_offset(&self) -> Option<Offset> {
        self.unclaimed_signal_offset
    }

    /// Advances the baseline monotonically. Replayed (older) offsets are
    /// ignored; returns whether the baseline moved.
    pub fn advance_unclaimed_offset(&mut self, offset: Offset) -> bool {
        match self.unclaimed_signal_offset {
            Some(current) if current >= offset => false,
            _ => {
                self.unclaimed_signal_offset = Some(offset);
                true
            }
        }
    }

    /// Records that fresh claim information about the task was observed.
    pub fn saw_claimed_info(&mut self, now: SystemTime) {
        self.last_claimed_info = Some(now);
    }

    pub fn last_claimed_info(&self) -> Option<SystemTime> {
        self.last_claimed_info
    }

    pub fn state_started(&self) -> SystemTime {
        self.state_started
    }

    pub fn claiming_timestamp(&self) -> Option<SystemTime> {
        self.claiming_timestamp
    }

    /// Start time of the most recent local execution.
    pub fn last_startup(&self) -> Option<SystemTime> {
        self.last_startup
    }

    /// Peer currently executing the task, when not this node.
    pub fn current_executor(&self) -> Option<&str> {
        self.current_executor.as_deref()
    }

    pub fn set_current_executor(&mut self, executor: Option<String>) {
        self.current_executor = executor;
    }

    /// Cancellation token of the in-flight local execution, if any.
    pub fn executor_token(&self) -> Option<&CancellationToken> {
        self.executor_token.as_ref()
    }

    pub fn set_executor_token(&mut self, token: Option<CancellationToken>) {
        self.executor_token = token;
    }

    /// Cancels any in-flight local execution.
    pub fn cancel_executor(&mut self) {
        if let Some(token) = self.executor_token.take() {
            token.cancel();
        }
    }

    /// Point-in-time view for callers outside the watcher loop.
    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            name: self.name().to_string(),
            state: self.state,
            unclaimed_signal_offset: self.unclaimed_signal_offset,
            current_executor: self.current_executor.clone(),
            last_startup: self.last_startup,
            last_claimed_info: self.last_claimed_info,
        }
    }
}

/// Read-only copy of a task's observable state.
#[derive(Clone, Debug)]
pub struct TaskSnapshot {
    pub name: String,
    pub state: TaskState,
    pub unclaimed_signal_offset: Option<Offset>,
    pub current_executor: Option<String>,
    pub last_startup: Option<SystemTime>,
    pub last_claimed_info: Option<SystemTime>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    fn task() -> Task {
        let def = Arc::new(
            TaskDefinition::builder("t").build_fn(|_ctx| async { Ok(()) }),
        );
        Task::new(def, UNIX_EPOCH)
    }

    #[test]
    fn baseline_only_advances() {
        let mut t = task();
        assert!(t.advance_unclaimed_offset(5));
        assert!(!t.advance_unclaimed_offset(5));
        assert!(!t.advance_unclaimed_offset(3));
        assert!(t.advance_unclaimed_offset(9));
        assert_eq!(t.unclaimed_signal_offset(), Some(9));
    }

    #[test]
    fn handling_records_startup_once_per_run() {
        let mut t = task();
        let t1 = UNIX_EPOCH + Duration::from_secs(1);
        t.set_state(TaskState::HandlingByNode, t1);
        assert_eq!(t.last_startup(), Some(t1));

        // Re-assertion of the same state keeps the original start.
        let t2 = UNIX_EPOCH + Duration::from_secs(2);
        t.set_state(TaskState::HandlingByNode, t2);
        assert_eq!(t.last_startup(), Some(t1));
    }

    #[test]
    fn claimed_by_other_clears_claiming_timestamp() {
        let mut t = task();
        let t1 = UNIX_EPOCH + Duration::from_secs(1);
        t.set_state(TaskState::Claiming, t1);
        assert_eq!(t.claiming_timestamp(), Some(t1));

        let t2 = UNIX_EPOCH + Duration::from_secs(2);
        t.set_state(TaskState::ClaimedByOther, t2);
        assert_eq!(t.claiming_timestamp(), None);
        assert_eq!(t.last_claimed_info(), Some(t2));
    }
}
