//! # Node-info: task inventories and placement knowledge.
//!
//! Every `DOHEARTBEAT` observed on the bus (own echo included) prompts the
//! node to serialize its [`NodeTaskInformation`] snapshot and, if it changed
//! since the last broadcast, publish it under its node id. Peer snapshots
//! are collected to surface cluster-wide placement; they never participate
//! in claim decisions.
//!
//! The handler also keeps *placement hints*: the latest signal observed for
//! a task this node has not (yet) registered. A late-starting node replays
//! recent history into these hints, so `register` can start a task directly
//! in `CLAIMED_BY_OTHER` instead of racing a live owner with `CLAIMING`.

use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::{unix_millis, ClockRef};
use crate::log::Offset;
use crate::signals::{Sender, Signal, SignalKind};
use crate::tasks::{Task, TaskState};

/// Inventory entry for one registered task.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInformation {
    /// Task name.
    pub task_name: String,
    /// Local state on the reporting node.
    pub state: TaskState,
    /// Executor the reporting node believes holds the claim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_executor: Option<String>,
    /// When the current state was entered (epoch millis).
    pub state_started_ms: u64,
    /// Start of the most recent local execution (epoch millis).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_startup_ms: Option<u64>,
}

/// One node's task inventory, broadcast to peers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTaskInformation {
    /// Unique id of the reporting node.
    pub node_id: String,
    /// Inventory of its registered tasks.
    pub tasks: Vec<TaskInformation>,
}

/// Latest signal observed for a task that is not registered locally.
#[derive(Clone, Debug)]
pub struct PlacementHint {
    /// Node that published the signal.
    pub origin: String,
    /// What it published.
    pub kind: SignalKind,
    /// Offset the signal was observed at.
    pub offset: Option<Offset>,
    /// Observation time on this node's clock.
    pub at: SystemTime,
}

/// Aggregates peer inventories and answers placement questions.
pub struct NodeInfoHandler {
    node_id: String,
    tasks: Arc<DashMap<String, Task>>,
    sender: Sender,
    clock: ClockRef,
    last_broadcast: Mutex<Option<String>>,
    peers: DashMap<String, NodeTaskInformation>,
    hints: DashMap<String, PlacementHint>,
}

impl NodeInfoHandler {
    pub(crate) fn new(
        node_id: String,
        tasks: Arc<DashMap<String, Task>>,
        sender: Sender,
        clock: ClockRef,
    ) -> Self {
        Self {
            node_id,
            tasks,
            sender,
            clock,
            last_broadcast: Mutex::new(None),
            peers: DashMap::new(),
            hints: DashMap::new(),
        }
    }

    /// Builds the current inventory snapshot.
    pub fn snapshot(&self) -> NodeTaskInformation {
        let mut tasks: Vec<TaskInformation> = self
            .tasks
            .iter()
            .map(|entry| {
                let task = entry.value();
                TaskInformation {
                    task_name: task.name().to_string(),
                    state: task.state(),
                    current_executor: task.current_executor().map(str::to_string),
                    state_started_ms: unix_millis(task.state_started()),
                    last_startup_ms: task.last_startup().map(unix_millis),
                }
            })
            .collect();
        tasks.sort_by(|a, b| a.task_name.cmp(&b.task_name));
        NodeTaskInformation { node_id: self.node_id.clone(), tasks }
    }

    /// Reacts to an observed `DOHEARTBEAT`: broadcast the snapshot if it
    /// changed since the last broadcast.
    pub fn on_doheartbeat(&self) {
        let snapshot = self.snapshot();
        let json = match serde_json::to_string(&snapshot) {
            Ok(j) => j,
            Err(e) => {
                warn!(node = %self.node_id, "failed to serialize node info: {e}");
                return;
            }
        };
        let mut last = self.last_broadcast.lock().expect("info poisoned");
        if last.as_deref() == Some(json.as_str()) {
            return;
        }
        *last = Some(json.clone());
        drop(last);
        self.sender.send_node_info(json);
    }

    /// Stores a peer's broadcast inventory.
    pub fn record_peer(&self, info: NodeTaskInformation) {
        if info.node_id == self.node_id {
            return;
        }
        debug!(node = %self.node_id, peer = %info.node_id, tasks = info.tasks.len(), "peer info");
        self.peers.insert(info.node_id.clone(), info);
    }

    /// Last known inventory per peer node.
    pub fn peer_information(&self) -> Vec<NodeTaskInformation> {
        self.peers.iter().map(|e| e.value().clone()).collect()
    }

    /// Records a signal observed for a task with no local registration.
    pub fn observe_unmatched(&self, signal: &Signal) {
        let Some(name) = signal.task_name.as_deref() else {
            return;
        };
        match signal.kind {
            SignalKind::Claiming
            | SignalKind::Claimed
            | SignalKind::Heartbeat
            | SignalKind::Handling
            | SignalKind::Unclaimed => {
                self.hints.insert(
                    name.to_string(),
                    PlacementHint {
                        origin: signal.origin.clone(),
                        kind: signal.kind,
                        offset: signal.current_offset,
                        at: self.clock.now(),
                    },
                );
            }
            _ => {}
        }
    }

    /// Latest placement knowledge for `task`, if any.
    pub fn placement_hint(&self, task: &str) -> Option<PlacementHint> {
        self.hints.get(task).map(|h| h.value().clone())
    }
}
