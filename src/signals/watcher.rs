//! # Signals watcher: the node's single reader of the sync topic.
//!
//! Tails the consumer, stamps every observed signal with its log offset and
//! dispatches it to the state machine synchronously on this loop, one
//! signal at a time, in log order. Internal signals (timer fires, executor
//! completions, release requests) merge into the same loop through a queue,
//! so this is the only thread that ever mutates task state.
//!
//! ## Startup handshake
//! The loop positions its consumer, optionally replays recent history (so a
//! late-starting node learns about tasks already claimed elsewhere before
//! emitting its own `CLAIMING`), and only then reports running. The node
//! blocks `run()` on that milestone.
//!
//! ## Failure
//! Transient fetch errors retry with bounded backoff. A fatal consumer
//! error cancels the node token: a node that cannot observe the log must
//! not keep acting on stale state.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::ClockRef;
use crate::config::BackoffPolicy;
use crate::core::LoopCtx;
use crate::events::{Bus, Event, EventKind};
use crate::log::{LogConsumer, LogRecord};
use crate::machine::SignalHandler;
use crate::node::info::NodeInfoHandler;

use super::{Signal, SignalKind, WirePayload};

/// Supervised loop delivering signals to the state machine.
pub struct SignalsWatcher {
    consumer: Box<dyn LogConsumer>,
    internal_rx: mpsc::Receiver<Signal>,
    machine: Arc<SignalHandler>,
    info: Arc<NodeInfoHandler>,
    events: Bus,
    clock: ClockRef,
    node_id: String,
    poll_time: Duration,
    read_old_signals: bool,
    old_signal_window: u64,
    fetch_backoff: BackoffPolicy,
    /// Node-wide token; canceled by this loop on a fatal consumer error.
    node_token: CancellationToken,
}

impl SignalsWatcher {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        consumer: Box<dyn LogConsumer>,
        internal_rx: mpsc::Receiver<Signal>,
        machine: Arc<SignalHandler>,
        info: Arc<NodeInfoHandler>,
        events: Bus,
        clock: ClockRef,
        node_id: String,
        poll_time: Duration,
        read_old_signals: bool,
        old_signal_window: u64,
        fetch_backoff: BackoffPolicy,
        node_token: CancellationToken,
    ) -> Self {
        Self {
            consumer,
            internal_rx,
            machine,
            info,
            events,
            clock,
            node_id,
            poll_time,
            read_old_signals,
            old_signal_window,
            fetch_backoff,
            node_token,
        }
    }

    /// Runs until canceled or a fatal consumer error.
    pub async fn run(mut self, ctx: LoopCtx) {
        if self.read_old_signals {
            if let Err(e) = self.replay_history(&ctx).await {
                error!(node = %self.node_id, "history replay failed fatally: {e}");
                self.node_token.cancel();
                ctx.set_stopped();
                return;
            }
        }

        // Milestone: positioned (history replayed) and ready to serve.
        ctx.set_running();
        self.events.publish(Event::new(
            EventKind::WatcherStarted,
            &self.node_id,
            self.clock.now(),
        ));
        info!(node = %self.node_id, position = self.consumer.position(), "watcher started");

        let mut retry_delay = None;
        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                Some(signal) = self.internal_rx.recv() => {
                    self.machine.dispatch(signal);
                }
                polled = self.consumer.poll(self.poll_time) => match polled {
                    Ok(batch) => {
                        retry_delay = None;
                        for record in batch {
                            self.observe(record);
                        }
                    }
                    Err(e) if e.is_transient() => {
                        let d = self.fetch_backoff.next(retry_delay);
                        retry_delay = Some(d);
                        warn!(node = %self.node_id, "fetch failed, backing off {d:?}: {e}");
                        tokio::select! {
                            _ = ctx.cancelled() => break,
                            _ = tokio::time::sleep(d) => {}
                        }
                    }
                    Err(e) => {
                        error!(node = %self.node_id, "consumer failed fatally: {e}");
                        self.node_token.cancel();
                        break;
                    }
                }
            }
        }
        ctx.set_stopped();
    }

    /// Rewinds up to `old_signal_window` records and feeds them through the
    /// normal dispatch path. Registered tasks do not exist yet, so replayed
    /// signals land as placement hints.
    async fn replay_history(&mut self, ctx: &LoopCtx) -> Result<(), crate::log::LogError> {
        let target = self.consumer.position();
        let from = target.saturating_sub(self.old_signal_window);
        if from >= target {
            return Ok(());
        }
        debug!(node = %self.node_id, from, target, "replaying old signals");
        self.consumer.seek(from);
        while self.consumer.position() < target && !ctx.is_cancelled() {
            let batch = self.consumer.poll(self.poll_time).await?;
            if batch.is_empty() {
                // The log shrank under us (retention); accept what we have.
                break;
            }
            for record in batch {
                self.observe(record);
            }
        }
        Ok(())
    }

    /// Parses one record and routes it.
    fn observe(&self, record: LogRecord) {
        let payload: WirePayload = match serde_json::from_str(&record.value) {
            Ok(p) => p,
            Err(e) => {
                warn!(
                    node = %self.node_id,
                    offset = record.offset,
                    key = %record.key,
                    "unparseable record skipped: {e}",
                );
                return;
            }
        };
        match payload {
            WirePayload::NodeInfo(info) => self.info.record_peer(info),
            WirePayload::Signal(doc) => {
                let signal = doc.into_signal(record.offset);
                match (&signal.task_name, signal.kind) {
                    // Task-less DOHEARTBEAT (own echo included) belongs to
                    // the node-info layer, not the per-task machine.
                    (None, SignalKind::DoHeartbeat) => self.info.on_doheartbeat(),
                    (None, kind) => {
                        debug!(node = %self.node_id, ?kind, "task-less signal ignored");
                    }
                    (Some(_), _) => self.machine.dispatch(signal),
                }
            }
        }
    }
}
