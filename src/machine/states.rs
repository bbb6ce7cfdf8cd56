//! # Dispatch table of the per-task state machine.
//!
//! Each state is a record of three function pointers, one per signal class,
//! with base defaults that log the violation and park the task in
//! `ERROR`. States override only the `(class, kind)` pairs they accept, so
//! reading a handler shows exactly what a state tolerates.
//!
//! One deliberate softening of the base policy: queue-driven internal kinds
//! (`CLAIMING_I`, `RESURRECTING_I`, `HEARTBEAT_I`, `HANDLING_I`,
//! `HANDLING_DONE_I`, `INITIATING_I`) can race a transition: removal cannot
//! recall an action the pending loop already popped, and a log signal can
//! overtake a queued drive. States that no longer expect them drop one
//! stale fire instead of erroring.

use tracing::{info, warn};

use crate::signals::{Signal, SignalKind};
use crate::tasks::{Task, TaskState};

use super::{reference_matches, SignalHandler};

type HandlerFn = fn(&SignalHandler, &mut Task, &Signal);

/// Handler record for one state.
#[derive(Clone, Copy)]
pub(crate) struct StateHandler {
    pub on_internal: HandlerFn,
    pub on_own: HandlerFn,
    pub on_foreign: HandlerFn,
}

/// Returns the handler record for `state`.
pub(crate) fn handler_for(state: TaskState) -> StateHandler {
    match state {
        TaskState::New => StateHandler {
            on_internal: new_internal,
            on_own: unexpected_own,
            on_foreign: contending_foreign,
        },
        TaskState::Initiating => StateHandler {
            on_internal: initiating_internal,
            on_own: lagging_own,
            on_foreign: contending_foreign,
        },
        TaskState::Claiming => StateHandler {
            on_internal: claiming_internal,
            on_own: claiming_own,
            on_foreign: claiming_foreign,
        },
        TaskState::ClaimedByNode => StateHandler {
            on_internal: claimed_by_node_internal,
            on_own: owned_own,
            on_foreign: owned_foreign,
        },
        TaskState::HandlingByNode => StateHandler {
            on_internal: handling_by_node_internal,
            on_own: owned_own,
            on_foreign: owned_foreign,
        },
        TaskState::Unclaiming => StateHandler {
            on_internal: unclaiming_internal,
            on_own: unclaiming_own,
            on_foreign: unclaiming_foreign,
        },
        TaskState::ClaimedByOther => StateHandler {
            on_internal: observer_internal,
            on_own: lagging_own,
            on_foreign: claimed_by_other_foreign,
        },
        TaskState::HandlingByOther => StateHandler {
            on_internal: observer_internal,
            on_own: lagging_own,
            on_foreign: handling_by_other_foreign,
        },
        TaskState::Error => StateHandler {
            on_internal: error_sink,
            on_own: error_sink,
            on_foreign: error_sink,
        },
    }
}

// ---------------------------
// Base defaults
// ---------------------------

fn unexpected_internal(m: &SignalHandler, task: &mut Task, s: &Signal) {
    m.error_state(task, s, "did not expect internal signal in this state");
}

fn unexpected_own(m: &SignalHandler, task: &mut Task, s: &Signal) {
    m.error_state(task, s, "did not expect this own signal in this state");
}

fn unexpected_foreign(m: &SignalHandler, task: &mut Task, s: &Signal) {
    m.error_state(task, s, "did not expect foreign signal in this state");
}

/// Stale timer fires (and the late registration drive) tolerated in most
/// states: a log signal can advance the task between the emit and the
/// delivery of these, and removal cannot recall an already-popped action.
fn stale_timer(m: &SignalHandler, task: &mut Task, s: &Signal) -> bool {
    match s.kind {
        SignalKind::ClaimingI => m.discard(task, s, "stale claim timer"),
        SignalKind::ResurrectingI => m.discard(task, s, "stale resurrection timer"),
        SignalKind::HeartbeatI => m.discard(task, s, "stale heartbeat timer"),
        SignalKind::HandlingI => m.discard(task, s, "stale handling timer"),
        SignalKind::HandlingDoneI => m.discard(task, s, "late executor completion"),
        SignalKind::InitiatingI => m.discard(task, s, "registration drive after state advanced"),
        _ => return false,
    }
    true
}

// ---------------------------
// NEW / INITIATING
// ---------------------------

fn new_internal(m: &SignalHandler, task: &mut Task, s: &Signal) {
    match s.kind {
        SignalKind::InitiatingI => {
            m.transition(task, TaskState::Initiating);
            m.pending().schedule_wait_for_new_switch(task.name());
            m.rearm_resurrection(task);
        }
        _ => unexpected_internal(m, task, s),
    }
}

fn initiating_internal(m: &SignalHandler, task: &mut Task, s: &Signal) {
    match s.kind {
        SignalKind::ClaimingI | SignalKind::ResurrectingI => m.begin_claim(task),
        SignalKind::UnclaimI => m.discard(task, s, "unclaim ignored outside owned states"),
        _ if stale_timer(m, task, s) => {}
        _ => unexpected_internal(m, task, s),
    }
}

/// Own echoes arriving after a foreign event reset local state between the
/// write and the echo. Logged and dropped; not a violation.
fn lagging_own(m: &SignalHandler, task: &mut Task, s: &Signal) {
    match s.kind {
        SignalKind::Claiming => m.discard(task, s, "own CLAIMING echo after state reset"),
        SignalKind::Unclaimed => {
            if let Some(offset) = s.current_offset {
                task.advance_unclaimed_offset(offset);
            }
            m.discard(task, s, "own UNCLAIMED echo after state reset");
        }
        SignalKind::Claimed | SignalKind::Heartbeat | SignalKind::Handling => {
            m.discard(task, s, "lagging own echo");
        }
        _ => unexpected_own(m, task, s),
    }
}

/// Foreign signals while this node merely wants the task.
fn contending_foreign(m: &SignalHandler, task: &mut Task, s: &Signal) {
    match s.kind {
        SignalKind::Claiming => m.claiming_observed(task, s),
        SignalKind::Claimed => m.claimed_observed(task, s),
        SignalKind::Heartbeat => m.observe_owner(task, s, false),
        SignalKind::Handling => m.observe_owner(task, s, true),
        SignalKind::Unclaimed => m.unclaimed_observed(task, s),
        _ => unexpected_foreign(m, task, s),
    }
}

// ---------------------------
// CLAIMING
// ---------------------------

fn claiming_internal(m: &SignalHandler, task: &mut Task, s: &Signal) {
    match s.kind {
        SignalKind::UnclaimI => m.discard(task, s, "unclaim ignored outside owned states"),
        _ if stale_timer(m, task, s) => {}
        _ => unexpected_internal(m, task, s),
    }
}

fn claiming_own(m: &SignalHandler, task: &mut Task, s: &Signal) {
    match s.kind {
        SignalKind::Claiming => {
            if reference_matches(s.reference, task.unclaimed_signal_offset()) {
                m.win_claim(task);
            } else {
                // A release landed between our write and our echo; the
                // attempt is void. Contend again from the new baseline.
                m.discard(task, s, "claim reference went stale");
                m.transition(task, TaskState::Initiating);
                m.pending().schedule_task_for_claiming(task.name());
            }
        }
        SignalKind::Unclaimed => {
            if let Some(offset) = s.current_offset {
                task.advance_unclaimed_offset(offset);
            }
            m.discard(task, s, "own UNCLAIMED replay during claim");
        }
        _ => unexpected_own(m, task, s),
    }
}

fn claiming_foreign(m: &SignalHandler, task: &mut Task, s: &Signal) {
    match s.kind {
        SignalKind::Claiming => m.claiming_observed(task, s),
        SignalKind::Claimed => m.error_state(task, s, "foreign CLAIMED while claiming"),
        SignalKind::Unclaimed => {
            // Advance the baseline and keep waiting: the own echo will fail
            // its reference check and restart the claim cleanly.
            if let Some(offset) = s.current_offset {
                task.advance_unclaimed_offset(offset);
            }
            m.discard(task, s, "baseline advanced under in-flight claim");
        }
        SignalKind::Heartbeat => m.observe_owner(task, s, false),
        SignalKind::Handling => m.observe_owner(task, s, true),
        _ => unexpected_foreign(m, task, s),
    }
}

// ---------------------------
// CLAIMED_BY_NODE / HANDLING_BY_NODE
// ---------------------------

fn claimed_by_node_internal(m: &SignalHandler, task: &mut Task, s: &Signal) {
    match s.kind {
        SignalKind::HandlingI => m.start_handling(task),
        SignalKind::HeartbeatI => m.owner_heartbeat(task),
        SignalKind::UnclaimI => m.start_unclaiming(task),
        _ if stale_timer(m, task, s) => {}
        _ => unexpected_internal(m, task, s),
    }
}

fn handling_by_node_internal(m: &SignalHandler, task: &mut Task, s: &Signal) {
    match s.kind {
        SignalKind::HandlingDoneI => m.finish_handling(task),
        SignalKind::HeartbeatI => m.handling_heartbeat(task),
        SignalKind::UnclaimI => m.start_unclaiming(task),
        _ if stale_timer(m, task, s) => {}
        _ => unexpected_internal(m, task, s),
    }
}

fn owned_own(m: &SignalHandler, task: &mut Task, s: &Signal) {
    match s.kind {
        SignalKind::Claimed => {
            task.saw_claimed_info(m.now());
        }
        SignalKind::Heartbeat | SignalKind::Handling => {}
        SignalKind::Claiming => m.discard(task, s, "own CLAIMING replay after claim settled"),
        SignalKind::Unclaimed => {
            if let Some(offset) = s.current_offset {
                task.advance_unclaimed_offset(offset);
            }
            m.discard(task, s, "own UNCLAIMED replay while owner");
        }
        _ => unexpected_own(m, task, s),
    }
}

fn owned_foreign(m: &SignalHandler, task: &mut Task, s: &Signal) {
    match s.kind {
        SignalKind::Claiming => {
            // The known two-contender race: the later claimant's signal
            // reaches the winner. Reset through UNCLAIMING so the log keeps
            // a single authoritative owner trail.
            m.start_unclaiming(task);
        }
        SignalKind::Claimed => {
            m.error_state(task, s, "foreign CLAIMED while locally claimed");
        }
        SignalKind::Unclaimed => {
            // A previous owner's late release after this node claimed via
            // resurrection. The baseline advances; the claim stands.
            if let Some(offset) = s.current_offset {
                task.advance_unclaimed_offset(offset);
            }
            warn!(
                node = %m.node_id(),
                task = %task.name(),
                origin = %s.origin,
                "stale foreign release while owner",
            );
        }
        SignalKind::Heartbeat | SignalKind::Handling => {
            warn!(
                node = %m.node_id(),
                task = %task.name(),
                origin = %s.origin,
                kind = ?s.kind,
                "stale owner signal while locally claimed",
            );
        }
        _ => unexpected_foreign(m, task, s),
    }
}

// ---------------------------
// UNCLAIMING
// ---------------------------

fn unclaiming_internal(m: &SignalHandler, task: &mut Task, s: &Signal) {
    match s.kind {
        SignalKind::UnclaimI => m.discard(task, s, "release already in flight"),
        _ if stale_timer(m, task, s) => {}
        _ => unexpected_internal(m, task, s),
    }
}

fn unclaiming_own(m: &SignalHandler, task: &mut Task, s: &Signal) {
    match s.kind {
        SignalKind::Unclaimed => {
            // The release is on the log. Peers contend for the task right
            // away; this node parks in INITIATING and only re-enters
            // contention through the resurrection watchdog, so a release
            // (including the shutdown path) is not immediately undone by
            // its own author.
            if let Some(offset) = s.current_offset {
                task.advance_unclaimed_offset(offset);
            }
            task.set_current_executor(None);
            m.transition(task, TaskState::Initiating);
            m.rearm_resurrection(task);
        }
        SignalKind::Claiming | SignalKind::Claimed | SignalKind::Heartbeat | SignalKind::Handling => {
            m.discard(task, s, "lagging own echo during release");
        }
        _ => unexpected_own(m, task, s),
    }
}

fn unclaiming_foreign(m: &SignalHandler, task: &mut Task, s: &Signal) {
    match s.kind {
        SignalKind::Unclaimed => {
            if let Some(offset) = s.current_offset {
                task.advance_unclaimed_offset(offset);
            }
            m.discard(task, s, "foreign release during own release");
        }
        SignalKind::Claiming | SignalKind::Claimed | SignalKind::Heartbeat | SignalKind::Handling => {
            m.discard(task, s, "foreign signal during release; own echo pending");
        }
        _ => unexpected_foreign(m, task, s),
    }
}

// ---------------------------
// CLAIMED_BY_OTHER / HANDLING_BY_OTHER
// ---------------------------

fn observer_internal(m: &SignalHandler, task: &mut Task, s: &Signal) {
    match s.kind {
        SignalKind::ResurrectingI => {
            info!(
                node = %m.node_id(),
                task = %task.name(),
                executor = ?task.current_executor(),
                "task silent past resurrection timeout; contending",
            );
            m.begin_claim(task);
        }
        SignalKind::UnclaimI => m.discard(task, s, "unclaim ignored outside owned states"),
        _ if stale_timer(m, task, s) => {}
        _ => unexpected_internal(m, task, s),
    }
}

fn claimed_by_other_foreign(m: &SignalHandler, task: &mut Task, s: &Signal) {
    match s.kind {
        SignalKind::Heartbeat => {
            track_executor(m, task, s);
            task.saw_claimed_info(m.now());
            m.rearm_resurrection(task);
        }
        SignalKind::Handling => {
            track_executor(m, task, s);
            m.transition(task, TaskState::HandlingByOther);
            m.rearm_resurrection(task);
        }
        SignalKind::Claimed => m.claimed_observed(task, s),
        SignalKind::Claiming => m.claiming_observed(task, s),
        SignalKind::Unclaimed => m.unclaimed_observed(task, s),
        _ => unexpected_foreign(m, task, s),
    }
}

fn handling_by_other_foreign(m: &SignalHandler, task: &mut Task, s: &Signal) {
    match s.kind {
        SignalKind::Heartbeat => {
            // Heartbeat doubles as "not handling anymore".
            track_executor(m, task, s);
            m.transition(task, TaskState::ClaimedByOther);
            m.rearm_resurrection(task);
        }
        SignalKind::Handling => {
            track_executor(m, task, s);
            task.saw_claimed_info(m.now());
            m.rearm_resurrection(task);
        }
        SignalKind::Claimed => m.claimed_observed(task, s),
        SignalKind::Claiming => m.claiming_observed(task, s),
        SignalKind::Unclaimed => m.unclaimed_observed(task, s),
        _ => unexpected_foreign(m, task, s),
    }
}

fn track_executor(m: &SignalHandler, task: &mut Task, s: &Signal) {
    let known = task.current_executor().map(str::to_string);
    match known {
        Some(executor) if executor != s.origin => {
            info!(
                node = %m.node_id(),
                task = %task.name(),
                known = %executor,
                observed = %s.origin,
                "executor changed",
            );
            task.set_current_executor(Some(s.origin.clone()));
        }
        Some(_) => {}
        None => task.set_current_executor(Some(s.origin.clone())),
    }
}

// ---------------------------
// ERROR
// ---------------------------

/// `ERROR` is dead until operator intervention; signals are dropped, with
/// the baseline still tracked for a potential restart.
fn error_sink(m: &SignalHandler, task: &mut Task, s: &Signal) {
    if s.kind == SignalKind::Unclaimed {
        if let Some(offset) = s.current_offset {
            task.advance_unclaimed_offset(offset);
        }
    }
    m.discard(task, s, "task in ERROR; signal dropped");
}
