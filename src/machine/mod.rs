//! # The per-task distributed state machine.
//!
//! [`SignalHandler`] turns observed signals into claim decisions. For every
//! signal the dispatcher looks up the task, classifies the signal as
//! internal, own (this node's echo) or foreign, and hands it to the handler
//! registered for the task's current state (see [`states`]).
//!
//! ## Rules
//! - Only the watcher loop calls [`SignalHandler::dispatch`]; transitions
//!   are serialized per node, one signal at a time, in log order.
//! - Log offsets are the only arbitration fact. A claim is confirmed only
//!   when the own `CLAIMING` echo still references the task's
//!   unclaimed-offset baseline.
//! - Self-published signals come back through the log like everyone else's;
//!   nothing is short-circuited.
//! - Handlers are synchronous: publishing goes through the sender queue and
//!   job bodies run on spawned executor tasks, so no handler ever awaits.

mod states;

pub(crate) use states::handler_for;

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::ClockRef;
use crate::events::{Bus, Event, EventKind};
use crate::log::Offset;
use crate::node::info::NodeInfoHandler;
use crate::pending::PendingHandler;
use crate::signals::{Sender, Signal, SignalClass, SignalKind};
use crate::tasks::{Task, TaskState};

/// Reference matches baseline iff both are nil, or both set and equal.
pub(crate) fn reference_matches(reference: Option<Offset>, baseline: Option<Offset>) -> bool {
    reference == baseline
}

/// Drives all registered tasks in response to signals.
pub struct SignalHandler {
    node_id: String,
    tasks: Arc<DashMap<String, Task>>,
    pending: Arc<PendingHandler>,
    sender: Sender,
    events: Bus,
    clock: ClockRef,
    info: Arc<NodeInfoHandler>,
    /// Parent token for job executors; node-wide cancel stops them.
    runtime_token: CancellationToken,
    /// Executor completions re-enter the watcher queue through this.
    internal_tx: mpsc::Sender<Signal>,
}

impl SignalHandler {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        node_id: String,
        tasks: Arc<DashMap<String, Task>>,
        pending: Arc<PendingHandler>,
        sender: Sender,
        events: Bus,
        clock: ClockRef,
        info: Arc<NodeInfoHandler>,
        runtime_token: CancellationToken,
        internal_tx: mpsc::Sender<Signal>,
    ) -> Self {
        Self {
            node_id,
            tasks,
            pending,
            sender,
            events,
            clock,
            info,
            runtime_token,
            internal_tx,
        }
    }

    /// Dispatches one signal to the handler for the task's current state.
    ///
    /// Signals for unknown tasks become placement hints; a `DOHEARTBEAT`
    /// never reaches this method (the watcher routes it to the node layer).
    pub fn dispatch(&self, signal: Signal) {
        let Some(name) = signal.task_name.clone() else {
            debug!(node = %self.node_id, kind = ?signal.kind, "task-less signal ignored");
            return;
        };
        let Some(mut entry) = self.tasks.get_mut(&name) else {
            self.info.observe_unmatched(&signal);
            return;
        };
        let task = entry.value_mut();
        let class = signal.classify(&self.node_id);
        debug!(
            node = %self.node_id,
            task = %name,
            state = %task.state(),
            kind = ?signal.kind,
            origin = %signal.origin,
            offset = ?signal.current_offset,
            ?class,
            "signal",
        );
        let handler = handler_for(task.state());
        let f = match class {
            SignalClass::Internal => handler.on_internal,
            SignalClass::Own => handler.on_own,
            SignalClass::Foreign => handler.on_foreign,
        };
        f(self, task, &signal);
    }

    pub(crate) fn now(&self) -> SystemTime {
        self.clock.now()
    }

    pub(crate) fn node_id(&self) -> &str {
        &self.node_id
    }

    pub(crate) fn pending(&self) -> &PendingHandler {
        &self.pending
    }

    /// Applies a state transition and narrates it on the event bus.
    pub(crate) fn transition(&self, task: &mut Task, to: TaskState) {
        let now = self.now();
        task.set_state(to, now);
        self.events.publish(
            Event::new(EventKind::StateChanged, &self.node_id, now)
                .with_task(task.name())
                .with_state(to),
        );
    }

    /// Logs the violation, cancels local work and parks the task in the
    /// dead `ERROR` state. Other tasks keep running.
    pub(crate) fn error_state(&self, task: &mut Task, signal: &Signal, message: &str) {
        error!(
            node = %self.node_id,
            task = %task.name(),
            state = %task.state(),
            kind = ?signal.kind,
            origin = %signal.origin,
            offset = ?signal.current_offset,
            "{message}",
        );
        task.cancel_executor();
        task.set_executor_token(None);
        self.pending.remove_all_for_task(task.name());
        self.transition(task, TaskState::Error);
        self.events.publish(
            Event::new(EventKind::TaskErrored, &self.node_id, self.now())
                .with_task(task.name())
                .with_error(message),
        );
    }

    /// Drops a tolerated-but-meaningless signal with a trace of why.
    pub(crate) fn discard(&self, task: &Task, signal: &Signal, message: &str) {
        debug!(
            node = %self.node_id,
            task = %task.name(),
            state = %task.state(),
            kind = ?signal.kind,
            origin = %signal.origin,
            "{message}",
        );
    }

    /// Re-arms the silence watchdog for `task`.
    pub(crate) fn rearm_resurrection(&self, task: &Task) {
        self.pending
            .schedule_task_resurrection(task.name(), task.definition().resurrection());
    }

    /// Publishes `CLAIMING` referencing the current baseline and waits for
    /// the echo in state `CLAIMING`.
    pub(crate) fn begin_claim(&self, task: &mut Task) {
        self.sender.send_signal(
            Some(task.name()),
            SignalKind::Claiming,
            task.unclaimed_signal_offset(),
        );
        self.transition(task, TaskState::Claiming);
    }

    /// The own `CLAIMING` echo survived the baseline check: the claim is
    /// won. Publish `CLAIMED` and start the periodic machinery.
    pub(crate) fn win_claim(&self, task: &mut Task) {
        self.transition(task, TaskState::ClaimedByNode);
        task.set_current_executor(None);
        self.sender.send_signal(Some(task.name()), SignalKind::Claimed, None);
        self.pending
            .schedule_task_handling_on_node(task.name(), self.next_handling_delay(task));
        self.pending
            .schedule_task_heartbeat_on_node(task.name(), task.definition().claimed_signal_period());
        self.pending.remove_task_resurrection(task.name());
        self.events.publish(
            Event::new(EventKind::ClaimWon, &self.node_id, self.now()).with_task(task.name()),
        );
    }

    /// Delay until the next execution keeps the `period` cadence relative
    /// to the previous startup; the first execution runs immediately.
    pub(crate) fn next_handling_delay(&self, task: &Task) -> Duration {
        let period = task.definition().period();
        match task.last_startup() {
            None => Duration::ZERO,
            Some(started) => {
                let elapsed = self
                    .now()
                    .duration_since(started)
                    .unwrap_or(Duration::ZERO);
                period.saturating_sub(elapsed)
            }
        }
    }

    /// Owner heartbeat: reassert the claim and re-arm the timer.
    pub(crate) fn owner_heartbeat(&self, task: &Task) {
        self.sender.send_signal(Some(task.name()), SignalKind::Heartbeat, None);
        self.pending
            .schedule_task_heartbeat_on_node(task.name(), task.definition().claimed_signal_period());
    }

    /// Heartbeat while an execution is in flight: reassert `HANDLING`
    /// instead, so peers keep liveness without losing the handling view.
    pub(crate) fn handling_heartbeat(&self, task: &Task) {
        self.sender.send_signal(Some(task.name()), SignalKind::Handling, None);
        self.pending
            .schedule_task_heartbeat_on_node(task.name(), task.definition().claimed_signal_period());
    }

    /// A foreign `UNCLAIMED` was observed: remember its offset as the new
    /// baseline and contend for the freed task.
    pub(crate) fn unclaimed_observed(&self, task: &mut Task, signal: &Signal) {
        if let Some(offset) = signal.current_offset {
            task.advance_unclaimed_offset(offset);
        }
        task.set_current_executor(None);
        self.transition(task, TaskState::Initiating);
        self.pending.schedule_task_for_claiming(task.name());
        self.pending.remove_task_resurrection(task.name());
    }

    /// A foreign `CLAIMED` was observed outside our own ownership.
    pub(crate) fn claimed_observed(&self, task: &mut Task, signal: &Signal) {
        let now = self.now();
        if matches!(task.state(), TaskState::ClaimedByOther | TaskState::HandlingByOther) {
            let known = task.current_executor().map(str::to_string);
            match known {
                Some(executor) if executor != signal.origin => {
                    info!(
                        node = %self.node_id,
                        task = %task.name(),
                        known = %executor,
                        claimed_by = %signal.origin,
                        "executor changed",
                    );
                    task.set_current_executor(Some(signal.origin.clone()));
                }
                Some(_) => {}
                None => task.set_current_executor(Some(signal.origin.clone())),
            }
            task.saw_claimed_info(now);
        } else {
            self.yield_to_peer(task, signal, TaskState::ClaimedByOther);
        }
        self.rearm_resurrection(task);
    }

    /// A foreign `CLAIMING` was observed. If it references our baseline the
    /// claimant is legitimate and this node yields; a stale reference is
    /// dropped (the claimant's own echo check will fail the same way).
    pub(crate) fn claiming_observed(&self, task: &mut Task, signal: &Signal) {
        if reference_matches(signal.reference, task.unclaimed_signal_offset()) {
            self.yield_to_peer(task, signal, TaskState::ClaimedByOther);
            self.rearm_resurrection(task);
        } else {
            self.discard(task, signal, "stale foreign claim attempt");
        }
    }

    /// A peer owns the task: record it, drop our contention and watch for
    /// silence.
    pub(crate) fn observe_owner(&self, task: &mut Task, signal: &Signal, handling: bool) {
        let to = if handling { TaskState::HandlingByOther } else { TaskState::ClaimedByOther };
        self.yield_to_peer(task, signal, to);
        self.rearm_resurrection(task);
    }

    fn yield_to_peer(&self, task: &mut Task, signal: &Signal, to: TaskState) {
        let was_contending = matches!(task.state(), TaskState::Claiming);
        task.set_current_executor(Some(signal.origin.clone()));
        self.transition(task, to);
        self.pending.remove_task_starter(task.name());
        if was_contending {
            self.events.publish(
                Event::new(EventKind::ClaimLost, &self.node_id, self.now())
                    .with_task(task.name()),
            );
        }
    }

    /// Common release path: stop the periodic machinery, publish
    /// `UNCLAIMED` and wait for the own echo in `UNCLAIMING`.
    pub(crate) fn start_unclaiming(&self, task: &mut Task) {
        self.pending.remove_task_starter(task.name());
        self.pending.remove_claimed_heartbeat(task.name());
        task.cancel_executor();
        task.set_executor_token(None);
        self.transition(task, TaskState::Unclaiming);
        self.sender.send_signal(Some(task.name()), SignalKind::Unclaimed, None);
        // Triggering events for follow-up states must wait for the own
        // UNCLAIMED echo; see the UNCLAIMING handler.
    }

    /// Moves the task into execution and spawns the job body.
    pub(crate) fn start_handling(&self, task: &mut Task) {
        self.transition(task, TaskState::HandlingByNode);
        self.sender.send_signal(Some(task.name()), SignalKind::Handling, None);

        let job = task.definition().job();
        let max = task.definition().max_duration();
        let name = task.name().to_string();
        let token = self.runtime_token.child_token();
        task.set_executor_token(Some(token.clone()));

        let node = self.node_id.clone();
        let events = self.events.clone();
        let clock = Arc::clone(&self.clock);
        let done_tx = self.internal_tx.clone();
        events.publish(Event::new(EventKind::HandlingStarted, &node, clock.now()).with_task(name.as_str()));

        tokio::spawn(async move {
            let mut failure: Option<String> = None;
            match tokio::time::timeout(max, job.run(token.clone())).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(node = %node, task = %name, label = e.as_label(), "job failed: {e}");
                    failure = Some(e.to_string());
                }
                Err(_elapsed) => {
                    token.cancel();
                    warn!(node = %node, task = %name, "job exceeded max duration {max:?}");
                    failure = Some(format!("timed out after {max:?}"));
                }
            }
            let mut finished =
                Event::new(EventKind::HandlingFinished, &node, clock.now()).with_task(name.as_str());
            if let Some(reason) = failure {
                finished = finished.with_error(reason);
            }
            events.publish(finished);

            let done = Signal::internal(&name, SignalKind::HandlingDoneI, &node, clock.now());
            if done_tx.send(done).await.is_err() {
                debug!(node = %node, task = %name, "machine queue closed before completion signal");
            }
        });
    }

    /// Execution finished: back to `CLAIMED_BY_NODE`, next run on cadence.
    pub(crate) fn finish_handling(&self, task: &mut Task) {
        task.set_executor_token(None);
        self.transition(task, TaskState::ClaimedByNode);
        self.pending
            .schedule_task_handling_on_node(task.name(), self.next_handling_delay(task));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::config::Config;
    use crate::signals::{SignalDoc, WirePayload};
    use crate::tasks::TaskDefinition;
    use std::time::UNIX_EPOCH;
    use tokio::sync::mpsc::Receiver;

    struct Harness {
        machine: SignalHandler,
        tasks: Arc<DashMap<String, Task>>,
        outbound: Receiver<crate::signals::OutboundRecord>,
        _internal_rx: Receiver<Signal>,
    }

    fn harness() -> Harness {
        let cfg = Config::default();
        let clock: ClockRef = Arc::new(FixedClock::at_epoch_plus(Duration::from_secs(1)));
        let (internal_tx, internal_rx) = mpsc::channel(64);
        let (sender, outbound) =
            Sender::channel(64, "local_1_1".to_string(), Arc::clone(&clock));
        let tasks: Arc<DashMap<String, Task>> = Arc::new(DashMap::new());
        let pending = Arc::new(PendingHandler::new(
            internal_tx.clone(),
            "local_1_1".to_string(),
            Arc::clone(&clock),
            cfg.wait_in_new_state,
            Duration::ZERO,
        ));
        let events = Bus::new(cfg.bus_capacity);
        let info = Arc::new(NodeInfoHandler::new(
            "local_1_1".to_string(),
            Arc::clone(&tasks),
            sender.clone(),
            Arc::clone(&clock),
        ));
        let machine = SignalHandler::new(
            "local_1_1".to_string(),
            Arc::clone(&tasks),
            pending,
            sender,
            events,
            clock,
            info,
            CancellationToken::new(),
            internal_tx,
        );
        Harness { machine, tasks, outbound, _internal_rx: internal_rx }
    }

    impl Harness {
        fn register(&self, name: &str) {
            let def = Arc::new(
                TaskDefinition::builder(name)
                    .with_period(Duration::from_secs(5))
                    .build_fn(|_ctx| async { Ok(()) }),
            );
            self.tasks
                .insert(name.to_string(), Task::new(def, UNIX_EPOCH));
            self.machine.dispatch(Signal::internal(
                name,
                SignalKind::InitiatingI,
                "local_1_1",
                UNIX_EPOCH,
            ));
        }

        fn state(&self, name: &str) -> TaskState {
            self.tasks.get(name).unwrap().state()
        }

        fn internal(&self, name: &str, kind: SignalKind) {
            self.machine
                .dispatch(Signal::internal(name, kind, "local_1_1", UNIX_EPOCH));
        }

        fn bus(&self, name: &str, kind: SignalKind, origin: &str, reference: Option<Offset>, offset: Offset) {
            self.machine.dispatch(Signal {
                task_name: Some(name.to_string()),
                kind,
                origin: origin.to_string(),
                reference,
                current_offset: Some(offset),
                timestamp: UNIX_EPOCH,
            });
        }

        fn next_outbound(&mut self) -> Option<SignalDoc> {
            let record = self.outbound.try_recv().ok()?;
            match serde_json::from_str(&record.value).expect("outbound parses") {
                WirePayload::Signal(doc) => Some(doc),
                WirePayload::NodeInfo(_) => panic!("unexpected node info"),
            }
        }
    }

    #[tokio::test]
    async fn full_claim_round_trip() {
        let mut h = harness();
        h.register("t");
        assert_eq!(h.state("t"), TaskState::Initiating);

        // Claim-attempt timer fires: CLAIMING published with nil reference.
        h.internal("t", SignalKind::ClaimingI);
        assert_eq!(h.state("t"), TaskState::Claiming);
        let claiming = h.next_outbound().expect("claiming published");
        assert_eq!(claiming.kind, SignalKind::Claiming);
        assert_eq!(claiming.reference, None);

        // Own echo with the matching baseline wins the claim.
        h.bus("t", SignalKind::Claiming, "local_1_1", None, 0);
        assert_eq!(h.state("t"), TaskState::ClaimedByNode);
        let claimed = h.next_outbound().expect("claimed published");
        assert_eq!(claimed.kind, SignalKind::Claimed);
    }

    #[tokio::test]
    async fn stale_own_echo_reinitiates() {
        let mut h = harness();
        h.register("t");
        h.internal("t", SignalKind::ClaimingI);
        let _ = h.next_outbound();

        // A foreign release lands between our write and our echo.
        h.bus("t", SignalKind::Unclaimed, "peer_2_1", None, 0);
        assert_eq!(h.state("t"), TaskState::Claiming);

        // The echo now references a stale baseline: no claim, start over.
        h.bus("t", SignalKind::Claiming, "local_1_1", None, 1);
        assert_eq!(h.state("t"), TaskState::Initiating);
        assert_eq!(
            h.tasks.get("t").unwrap().unclaimed_signal_offset(),
            Some(0)
        );
    }

    #[tokio::test]
    async fn foreign_claiming_with_matching_reference_yields() {
        let mut h = harness();
        h.register("t");
        h.internal("t", SignalKind::ClaimingI);
        let _ = h.next_outbound();

        // The peer's CLAIMING echoes first: deterministic loss by offset order.
        h.bus("t", SignalKind::Claiming, "peer_2_1", None, 0);
        let entry = h.tasks.get("t").unwrap();
        assert_eq!(entry.state(), TaskState::ClaimedByOther);
        assert_eq!(entry.current_executor(), Some("peer_2_1"));
        drop(entry);

        // Our own echo arrives after the reset: discarded, not an error.
        h.bus("t", SignalKind::Claiming, "local_1_1", None, 1);
        assert_eq!(h.state("t"), TaskState::ClaimedByOther);
    }

    #[tokio::test]
    async fn forged_claimed_while_owner_errors_task() {
        let mut h = harness();
        h.register("t");
        h.internal("t", SignalKind::ClaimingI);
        let _ = h.next_outbound();
        h.bus("t", SignalKind::Claiming, "local_1_1", None, 0);
        assert_eq!(h.state("t"), TaskState::ClaimedByNode);

        h.bus("t", SignalKind::Claimed, "peer_2_1", None, 1);
        assert_eq!(h.state("t"), TaskState::Error);
    }

    #[tokio::test]
    async fn foreign_claiming_while_owner_resets_to_unclaiming() {
        let mut h = harness();
        h.register("t");
        h.internal("t", SignalKind::ClaimingI);
        let _ = h.next_outbound();
        h.bus("t", SignalKind::Claiming, "local_1_1", None, 0);
        let _ = h.next_outbound();

        h.bus("t", SignalKind::Claiming, "peer_2_1", None, 1);
        assert_eq!(h.state("t"), TaskState::Unclaiming);
        let unclaimed = h.next_outbound().expect("unclaimed published");
        assert_eq!(unclaimed.kind, SignalKind::Unclaimed);

        // Own UNCLAIMED echo: back to contention with an advanced baseline.
        h.bus("t", SignalKind::Unclaimed, "local_1_1", None, 2);
        assert_eq!(h.state("t"), TaskState::Initiating);
        assert_eq!(h.tasks.get("t").unwrap().unclaimed_signal_offset(), Some(2));
    }

    #[tokio::test]
    async fn unclaim_request_ignored_outside_owned_states() {
        let h = harness();
        h.register("t");
        h.bus("t", SignalKind::Claimed, "peer_2_1", None, 0);
        assert_eq!(h.state("t"), TaskState::ClaimedByOther);

        // A release request racing an already-observed foreign claim must
        // not resurrect.
        h.internal("t", SignalKind::UnclaimI);
        assert_eq!(h.state("t"), TaskState::ClaimedByOther);
    }

    #[tokio::test]
    async fn duplicate_unclaimed_replay_is_idempotent() {
        let h = harness();
        h.register("t");
        h.bus("t", SignalKind::Unclaimed, "peer_2_1", None, 5);
        assert_eq!(h.state("t"), TaskState::Initiating);
        assert_eq!(h.tasks.get("t").unwrap().unclaimed_signal_offset(), Some(5));

        // Consumer rewind: the same record observed again changes nothing.
        h.bus("t", SignalKind::Unclaimed, "peer_2_1", None, 5);
        assert_eq!(h.tasks.get("t").unwrap().unclaimed_signal_offset(), Some(5));
        assert_eq!(h.state("t"), TaskState::Initiating);
    }

    #[tokio::test]
    async fn foreign_heartbeat_tracks_owner() {
        let h = harness();
        h.register("t");
        h.bus("t", SignalKind::Heartbeat, "peer_2_1", None, 0);
        let entry = h.tasks.get("t").unwrap();
        assert_eq!(entry.state(), TaskState::ClaimedByOther);
        assert_eq!(entry.current_executor(), Some("peer_2_1"));
        drop(entry);

        h.bus("t", SignalKind::Handling, "peer_2_1", None, 1);
        assert_eq!(h.state("t"), TaskState::HandlingByOther);
        h.bus("t", SignalKind::Heartbeat, "peer_2_1", None, 2);
        assert_eq!(h.state("t"), TaskState::ClaimedByOther);
    }
}
