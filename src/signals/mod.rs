//! # Signals: the records coordinating the cluster.
//!
//! A [`Signal`] is one observation delivered to the per-task state machine.
//! Bus kinds travel over the sync topic and come back as echoes; internal
//! kinds are emitted by the node or the pending handler and never leave the
//! process. The dispatcher classifies every signal as internal, own (this
//! node's echo) or foreign before handing it to a state handler.
//!
//! Wire documents live here too: [`SignalDoc`] is the compact record value
//! for task signals, and [`WirePayload`] distinguishes signal records from
//! node-info documents sharing the topic.

mod sender;
mod watcher;

pub use sender::{Sender, SenderLoop};
pub use watcher::SignalsWatcher;

pub(crate) use sender::OutboundRecord;

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::clock::unix_millis;
use crate::log::Offset;
use crate::node::info::NodeTaskInformation;

/// Closed set of signal kinds.
///
/// Kinds suffixed `_I` on the wire-name side are internal: they are never
/// published and never observed from the log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalKind {
    /// A node asks for the claim, referencing its unclaimed-offset baseline.
    #[serde(rename = "CLAIMING")]
    Claiming,
    /// A node confirmed its claim after the echo check.
    #[serde(rename = "CLAIMED")]
    Claimed,
    /// The owner released the task.
    #[serde(rename = "UNCLAIMED")]
    Unclaimed,
    /// The owner started one job execution.
    #[serde(rename = "HANDLING")]
    Handling,
    /// The owner reasserts a live claim.
    #[serde(rename = "HEARTBEAT")]
    Heartbeat,
    /// Node-level self-announcement trigger; carries no task.
    #[serde(rename = "DOHEARTBEAT")]
    DoHeartbeat,
    /// Drive a freshly registered task out of `NEW`.
    #[serde(rename = "INITIATING_I")]
    InitiatingI,
    /// The claim-attempt timer fired.
    #[serde(rename = "CLAIMING_I")]
    ClaimingI,
    /// The claimed-heartbeat timer fired.
    #[serde(rename = "HEARTBEAT_I")]
    HeartbeatI,
    /// The periodic handling timer fired.
    #[serde(rename = "HANDLING_I")]
    HandlingI,
    /// A job execution on this node completed.
    #[serde(rename = "HANDLING_DONE_I")]
    HandlingDoneI,
    /// The resurrection timer fired after prolonged silence.
    #[serde(rename = "RESURRECTING_I")]
    ResurrectingI,
    /// Voluntary release requested (shutdown or caller).
    #[serde(rename = "UNCLAIM_I")]
    UnclaimI,
}

impl SignalKind {
    /// True for kinds that never traverse the log.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            SignalKind::InitiatingI
                | SignalKind::ClaimingI
                | SignalKind::HeartbeatI
                | SignalKind::HandlingI
                | SignalKind::HandlingDoneI
                | SignalKind::ResurrectingI
                | SignalKind::UnclaimI
        )
    }
}

/// How the dispatcher classified a signal relative to the local node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalClass {
    /// Emitted locally, never traversed the log.
    Internal,
    /// The echo of a record this node published.
    Own,
    /// Published by a peer.
    Foreign,
}

/// One observation delivered to the state machine.
#[derive(Clone, Debug)]
pub struct Signal {
    /// Task the signal concerns; `None` only for `DOHEARTBEAT`.
    pub task_name: Option<String>,
    /// What happened.
    pub kind: SignalKind,
    /// Unique node id of the origin.
    pub origin: String,
    /// Offset of a prior signal this one responds to.
    pub reference: Option<Offset>,
    /// Log offset stamped by the watcher when observed; `None` for internal
    /// signals.
    pub current_offset: Option<Offset>,
    /// When the signal was created.
    pub timestamp: SystemTime,
}

impl Signal {
    /// Builds an internal signal for `task`.
    pub fn internal(task: &str, kind: SignalKind, origin: &str, at: SystemTime) -> Self {
        debug_assert!(kind.is_internal());
        Self {
            task_name: Some(task.to_string()),
            kind,
            origin: origin.to_string(),
            reference: None,
            current_offset: None,
            timestamp: at,
        }
    }

    /// Classifies this signal for dispatch.
    pub fn classify(&self, local_node_id: &str) -> SignalClass {
        if self.kind.is_internal() {
            SignalClass::Internal
        } else if self.origin == local_node_id {
            SignalClass::Own
        } else {
            SignalClass::Foreign
        }
    }
}

/// Record value for task signals on the sync topic.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignalDoc {
    /// Task the signal concerns; absent for `DOHEARTBEAT`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_name: Option<String>,
    /// Signal kind.
    pub kind: SignalKind,
    /// Unique node id of the publisher.
    pub origin: String,
    /// Offset baseline this signal responds to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<Offset>,
    /// Publisher wall clock, milliseconds since the epoch (informational).
    pub timestamp_ms: u64,
}

impl SignalDoc {
    /// Builds the wire document for a bus signal.
    pub fn new(
        task: Option<&str>,
        kind: SignalKind,
        origin: &str,
        reference: Option<Offset>,
        at: SystemTime,
    ) -> Self {
        debug_assert!(!kind.is_internal());
        Self {
            task_name: task.map(str::to_string),
            kind,
            origin: origin.to_string(),
            reference,
            timestamp_ms: unix_millis(at),
        }
    }

    /// Lifts an observed record into a [`Signal`] stamped with its offset.
    pub fn into_signal(self, offset: Offset) -> Signal {
        Signal {
            task_name: self.task_name,
            kind: self.kind,
            origin: self.origin,
            reference: self.reference,
            current_offset: Some(offset),
            timestamp: std::time::UNIX_EPOCH + std::time::Duration::from_millis(self.timestamp_ms),
        }
    }
}

/// Everything that can appear as a record value on the sync topic.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WirePayload {
    /// A task or node signal.
    Signal(SignalDoc),
    /// A node's task-inventory document.
    NodeInfo(NodeTaskInformation),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    #[test]
    fn classify_discriminates_origin() {
        let s = Signal {
            task_name: Some("t".into()),
            kind: SignalKind::Claiming,
            origin: "a_1_1".into(),
            reference: None,
            current_offset: Some(3),
            timestamp: UNIX_EPOCH,
        };
        assert_eq!(s.classify("a_1_1"), SignalClass::Own);
        assert_eq!(s.classify("b_2_1"), SignalClass::Foreign);

        let i = Signal::internal("t", SignalKind::ClaimingI, "a_1_1", UNIX_EPOCH);
        assert_eq!(i.classify("a_1_1"), SignalClass::Internal);
    }

    #[test]
    fn signal_doc_round_trips_reference() {
        let doc = SignalDoc::new(Some("t"), SignalKind::Claiming, "a_1_1", Some(7), UNIX_EPOCH);
        let json = serde_json::to_string(&doc).unwrap();
        assert!(json.contains("\"CLAIMING\""));
        let parsed: WirePayload = serde_json::from_str(&json).unwrap();
        match parsed {
            WirePayload::Signal(d) => {
                assert_eq!(d.reference, Some(7));
                assert_eq!(d.task_name.as_deref(), Some("t"));
            }
            WirePayload::NodeInfo(_) => panic!("parsed as node info"),
        }
    }

    #[test]
    fn doheartbeat_omits_task_and_reference() {
        let doc = SignalDoc::new(None, SignalKind::DoHeartbeat, "a_1_1", None, UNIX_EPOCH);
        let json = serde_json::to_string(&doc).unwrap();
        assert!(!json.contains("task_name"));
        assert!(!json.contains("reference"));
    }
}
