//! # Node: lifecycle owner and public API.
//!
//! A [`Node`] wires the signal bus, pending handler, state machine and
//! heartbeat together, supervises their loops, and owns the task registry.
//!
//! ## Lifecycle
//! - [`Node::run`] constructs producer and consumer, starts the pending and
//!   sender loops, arms the node heartbeat, starts the signals watcher and
//!   blocks until the watcher's startup milestone (consumer positioned,
//!   history replayed).
//! - [`Node::register`] adds a task; it contends for a claim on its own
//!   from there.
//! - [`Node::shutdown`] releases every locally held task through the log,
//!   waits one poll interval for the echoes to flush, then stops all loops.
//!   Shutdown is idempotent.

pub mod heartbeat;
pub mod info;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::info as log_info;

use crate::clock::ClockRef;
use crate::config::Config;
use crate::core::Supervisor;
use crate::error::NodeError;
use crate::events::{Bus, Event, EventKind, Subscribe};
use crate::log::LogClient;
use crate::machine::SignalHandler;
use crate::pending::PendingHandler;
use crate::signals::{OutboundRecord, Sender, SenderLoop, Signal, SignalKind, SignalsWatcher};
use crate::tasks::{Task, TaskDefinition, TaskSnapshot, TaskState};

use heartbeat::NodeHeartbeat;
use info::{NodeInfoHandler, NodeTaskInformation};

/// Process-wide counter making node ids unique within one process.
static NODE_COUNTER: AtomicU64 = AtomicU64::new(0);

fn unique_node_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    let pid = std::process::id();
    let n = NODE_COUNTER.fetch_add(1, Ordering::SeqCst) + 1;
    format!("{host}_{pid}_{n}")
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Running,
    Stopped,
}

struct Lifecycle {
    phase: Phase,
    supervisor: Option<Supervisor>,
    internal_rx: Option<mpsc::Receiver<Signal>>,
    sender_rx: Option<mpsc::Receiver<OutboundRecord>>,
}

/// One member of the coordination cluster.
pub struct Node {
    cfg: Config,
    clock: ClockRef,
    log: Arc<dyn LogClient>,
    node_id: String,
    tasks: Arc<DashMap<String, Task>>,
    events: Bus,
    pending: Arc<PendingHandler>,
    machine: Arc<SignalHandler>,
    info: Arc<NodeInfoHandler>,
    heartbeat: Arc<NodeHeartbeat>,
    internal_tx: mpsc::Sender<Signal>,
    node_token: CancellationToken,
    lifecycle: Mutex<Lifecycle>,
}

impl Node {
    /// Creates a node bound to `log`. All subcomponents are constructed
    /// eagerly; nothing starts until [`Node::run`].
    pub fn new(cfg: Config, log: Arc<dyn LogClient>, clock: ClockRef) -> Arc<Self> {
        let node_id = unique_node_id();
        let node_token = CancellationToken::new();
        let tasks: Arc<DashMap<String, Task>> = Arc::new(DashMap::new());
        let events = Bus::new(cfg.bus_capacity);

        let (internal_tx, internal_rx) = mpsc::channel(cfg.signal_queue_capacity);
        let (sender, sender_rx) =
            Sender::channel(cfg.sender_queue_capacity, node_id.clone(), Arc::clone(&clock));

        let pending = Arc::new(PendingHandler::new(
            internal_tx.clone(),
            node_id.clone(),
            Arc::clone(&clock),
            cfg.wait_in_new_state,
            cfg.claiming_jitter,
        ));

        let info = Arc::new(NodeInfoHandler::new(
            node_id.clone(),
            Arc::clone(&tasks),
            sender.clone(),
            Arc::clone(&clock),
        ));

        let machine = Arc::new(SignalHandler::new(
            node_id.clone(),
            Arc::clone(&tasks),
            Arc::clone(&pending),
            sender.clone(),
            events.clone(),
            Arc::clone(&clock),
            Arc::clone(&info),
            node_token.clone(),
            internal_tx.clone(),
        ));

        let heartbeat = Arc::new(NodeHeartbeat::new(
            node_id.clone(),
            cfg.heart_beat_period,
            sender.clone(),
            Arc::downgrade(&pending),
        ));

        Arc::new(Self {
            cfg,
            clock,
            log,
            node_id,
            tasks,
            events,
            pending,
            machine,
            info,
            heartbeat,
            internal_tx,
            node_token,
            lifecycle: Mutex::new(Lifecycle {
                phase: Phase::Created,
                supervisor: None,
                internal_rx: Some(internal_rx),
                sender_rx: Some(sender_rx),
            }),
        })
    }

    /// Unique node id: `hostname_pid_counter`.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// The in-process event bus.
    pub fn bus(&self) -> Bus {
        self.events.clone()
    }

    /// True until shutdown (or a loop-fatal error) canceled the node.
    pub fn is_alive(&self) -> bool {
        !self.node_token.is_cancelled()
    }

    /// Starts all supervised loops and blocks until the watcher milestone.
    pub async fn run(&self) -> Result<(), NodeError> {
        let mut lc = self.lifecycle.lock().await;
        match lc.phase {
            Phase::Running => return Ok(()),
            Phase::Stopped => {
                return Err(NodeError::AlreadyStopped { node: self.node_id.clone() })
            }
            Phase::Created => {}
        }

        let producer = self.log.producer().await?;
        let consumer = self.log.consumer(self.cfg.start_position).await?;

        let mut supervisor = Supervisor::new(self.node_token.clone());

        let pending = Arc::clone(&self.pending);
        supervisor.supervise("pending", move |ctx| async move {
            pending.run(ctx).await;
        });

        let sender_rx = lc.sender_rx.take().expect("sender queue consumed twice");
        let sender_loop = SenderLoop::new(
            sender_rx,
            producer,
            self.cfg.send_backoff,
            self.cfg.send_retries,
            self.node_id.clone(),
            self.node_token.clone(),
        );
        supervisor.supervise("sender", move |ctx| async move {
            sender_loop.run(ctx).await;
        });

        supervisor
            .wait_all_running(std::time::Duration::from_secs(10))
            .await?;

        // First self-announcement one heartbeat period from now.
        self.heartbeat.arm();

        let internal_rx = lc.internal_rx.take().expect("signal queue consumed twice");
        let watcher = SignalsWatcher::new(
            consumer,
            internal_rx,
            Arc::clone(&self.machine),
            Arc::clone(&self.info),
            self.events.clone(),
            Arc::clone(&self.clock),
            self.node_id.clone(),
            self.cfg.consumer_poll_time,
            self.cfg.read_old_signals,
            self.cfg.old_signal_window,
            self.cfg.send_backoff,
            self.node_token.clone(),
        );
        supervisor.supervise("signals-watcher", move |ctx| async move {
            watcher.run(ctx).await;
        });

        // The watcher reports running only after its consumer is positioned
        // and history is replayed; this is the startup milestone.
        supervisor
            .wait_all_running(std::time::Duration::from_secs(30))
            .await?;

        lc.supervisor = Some(supervisor);
        lc.phase = Phase::Running;
        log_info!(node = %self.node_id, "node running");
        Ok(())
    }

    /// Registers a task; it enters claim contention immediately.
    ///
    /// When replayed history shows the task recently claimed by a peer, the
    /// task starts as `CLAIMED_BY_OTHER` with the resurrection watchdog
    /// armed instead of racing the live owner.
    pub async fn register(&self, definition: TaskDefinition) -> Result<TaskSnapshot, NodeError> {
        {
            let lc = self.lifecycle.lock().await;
            if lc.phase != Phase::Running {
                return Err(NodeError::NotRunning { node: self.node_id.clone() });
            }
        }

        let name = definition.name().to_string();
        let definition = Arc::new(definition);
        let now = self.clock.now();

        let mut task = Task::new(Arc::clone(&definition), now);
        let mut seeded_other = false;
        if let Some(hint) = self.info.placement_hint(&name) {
            match hint.kind {
                SignalKind::Unclaimed => {
                    // The last word in history is a release; start from its
                    // offset as the claim baseline.
                    if let Some(offset) = hint.offset {
                        task.advance_unclaimed_offset(offset);
                    }
                }
                SignalKind::Handling => {
                    task.set_current_executor(Some(hint.origin.clone()));
                    task.set_state(TaskState::HandlingByOther, now);
                    seeded_other = true;
                }
                _ => {
                    task.set_current_executor(Some(hint.origin.clone()));
                    task.set_state(TaskState::ClaimedByOther, now);
                    seeded_other = true;
                }
            }
        }

        let snapshot = task.snapshot();
        match self.tasks.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(NodeError::TaskAlreadyRegistered { name });
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(task);
            }
        }

        if seeded_other {
            self.pending
                .schedule_task_resurrection(&name, definition.resurrection());
            self.events.publish(
                Event::new(EventKind::StateChanged, &self.node_id, now)
                    .with_task(name.as_str())
                    .with_state(snapshot.state),
            );
        } else {
            let drive = Signal::internal(&name, SignalKind::InitiatingI, &self.node_id, now);
            if self.internal_tx.send(drive).await.is_err() {
                return Err(NodeError::NotRunning { node: self.node_id.clone() });
            }
        }
        Ok(snapshot)
    }

    /// Point-in-time view of one registered task.
    pub fn task(&self, name: &str) -> Option<TaskSnapshot> {
        self.tasks.get(name).map(|t| t.snapshot())
    }

    /// This node's current task inventory.
    pub fn node_information(&self) -> NodeTaskInformation {
        self.info.snapshot()
    }

    /// Last known inventories of peer nodes.
    pub fn peer_information(&self) -> Vec<NodeTaskInformation> {
        self.info.peer_information()
    }

    /// Requests a voluntary release of one locally held task.
    pub fn unclaim(&self, name: &str) {
        let drive = Signal::internal(name, SignalKind::UnclaimI, &self.node_id, self.clock.now());
        let _ = self.internal_tx.try_send(drive);
    }

    /// Attaches a subscriber driven by its own loop until shutdown.
    pub fn attach_subscriber(&self, subscriber: Arc<dyn Subscribe>) {
        let mut rx = self.events.subscribe();
        let token = self.node_token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(ev) => subscriber.on_event(&ev).await,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });
    }

    /// Releases every locally held task through the log, lets the echoes
    /// flush, then stops all loops. Idempotent.
    pub async fn shutdown(&self) {
        let mut lc = self.lifecycle.lock().await;
        match lc.phase {
            Phase::Stopped => return,
            Phase::Created => {
                lc.phase = Phase::Stopped;
                self.node_token.cancel();
                return;
            }
            Phase::Running => {}
        }
        log_info!(node = %self.node_id, "shutting down");
        self.events.publish(Event::new(
            EventKind::ShutdownRequested,
            &self.node_id,
            self.clock.now(),
        ));

        let held: Vec<String> = self
            .tasks
            .iter()
            .filter(|e| e.value().state().is_locally_owned())
            .map(|e| e.key().clone())
            .collect();
        for name in held {
            let drive =
                Signal::internal(&name, SignalKind::UnclaimI, &self.node_id, self.clock.now());
            let _ = self.internal_tx.try_send(drive);
        }

        // Let the release signals round-trip through the log so peers learn
        // of them before this node goes quiet.
        tokio::time::sleep(self.cfg.consumer_poll_time + self.cfg.shutdown_flush).await;

        if let Some(mut supervisor) = lc.supervisor.take() {
            supervisor.stop_all().await;
        }
        self.node_token.cancel();
        lc.phase = Phase::Stopped;
        self.events.publish(Event::new(
            EventKind::NodeStopped,
            &self.node_id,
            self.clock.now(),
        ));
        log_info!(node = %self.node_id, "node stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_ids_are_unique_within_process() {
        let a = unique_node_id();
        let b = unique_node_id();
        assert_ne!(a, b);
        assert!(a.contains('_'));
        let pid = std::process::id().to_string();
        assert!(a.contains(&pid));
    }
}
