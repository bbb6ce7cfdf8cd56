//! # Sender: the node's single writer to the sync topic.
//!
//! [`Sender`] is a cheap handle any loop may call; records are serialized
//! immediately and queued, and [`SenderLoop`] drains the queue to the log
//! producer one record at a time. That keeps publishing serialized around
//! the producer without callers ever blocking on I/O.
//!
//! Publishing is fire-and-forget at the protocol level: the echo observed by
//! the watcher is the only acknowledgement. Transient produce errors retry
//! with bounded backoff; exhausted retries or a fatal producer error stop
//! the whole node (a node that cannot speak must not keep claims).

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::clock::ClockRef;
use crate::config::BackoffPolicy;
use crate::core::LoopCtx;
use crate::log::{LogProducer, Offset};

use super::{SignalDoc, SignalKind};

/// One serialized record awaiting publish.
#[derive(Debug)]
pub(crate) struct OutboundRecord {
    pub(crate) key: String,
    pub(crate) value: String,
}

/// Handle for publishing signals and node-info documents.
#[derive(Clone)]
pub struct Sender {
    tx: mpsc::Sender<OutboundRecord>,
    node_id: String,
    clock: ClockRef,
}

impl Sender {
    /// Creates the handle and the queue end consumed by [`SenderLoop`].
    pub(crate) fn channel(
        capacity: usize,
        node_id: String,
        clock: ClockRef,
    ) -> (Self, mpsc::Receiver<OutboundRecord>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx, node_id, clock }, rx)
    }

    /// Unique id of the node this sender publishes for.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Publishes a bus signal. Task signals are keyed by task name so every
    /// peer observes them in one per-task total order; task-less signals
    /// (`DOHEARTBEAT`) are keyed by the node id.
    pub fn send_signal(&self, task: Option<&str>, kind: SignalKind, reference: Option<Offset>) {
        debug_assert!(!kind.is_internal(), "internal kinds never leave the node");
        let doc = SignalDoc::new(task, kind, &self.node_id, reference, self.clock.now());
        let value = match serde_json::to_string(&doc) {
            Ok(v) => v,
            Err(e) => {
                error!(node = %self.node_id, ?kind, "failed to serialize signal: {e}");
                return;
            }
        };
        let key = task.unwrap_or(&self.node_id).to_string();
        self.enqueue(OutboundRecord { key, value }, "signal");
    }

    /// Publishes a serialized node-info document under this node's id.
    pub fn send_node_info(&self, value: String) {
        let key = self.node_id.clone();
        self.enqueue(OutboundRecord { key, value }, "node-info");
    }

    fn enqueue(&self, record: OutboundRecord, what: &str) {
        if let Err(e) = self.tx.try_send(record) {
            // Dropping is legal (fire-and-forget); peers recover via timers.
            warn!(node = %self.node_id, what, "outbound queue rejected record: {e}");
        }
    }
}

/// Supervised loop draining the outbound queue to the log producer.
pub struct SenderLoop {
    rx: mpsc::Receiver<OutboundRecord>,
    producer: Box<dyn LogProducer>,
    backoff: BackoffPolicy,
    retries: u32,
    node_id: String,
    /// Node-wide token; canceled by this loop on a fatal produce error.
    node_token: CancellationToken,
}

impl SenderLoop {
    pub(crate) fn new(
        rx: mpsc::Receiver<OutboundRecord>,
        producer: Box<dyn LogProducer>,
        backoff: BackoffPolicy,
        retries: u32,
        node_id: String,
        node_token: CancellationToken,
    ) -> Self {
        Self { rx, producer, backoff, retries, node_id, node_token }
    }

    /// Runs until canceled, the queue closes, or a fatal produce error.
    pub async fn run(mut self, ctx: LoopCtx) {
        ctx.set_running();
        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                msg = self.rx.recv() => match msg {
                    None => break,
                    Some(record) => {
                        if !self.publish(record, &ctx).await {
                            self.node_token.cancel();
                            break;
                        }
                    }
                }
            }
        }
        ctx.set_stopped();
    }

    /// Publishes one record with bounded retries. Returns false on a
    /// loop-fatal error.
    async fn publish(&self, record: OutboundRecord, ctx: &LoopCtx) -> bool {
        let mut delay = None;
        for attempt in 0..=self.retries {
            match self.producer.send(&record.key, record.value.clone()).await {
                Ok(offset) => {
                    debug!(node = %self.node_id, key = %record.key, offset, "published");
                    return true;
                }
                Err(e) if e.is_transient() && attempt < self.retries => {
                    let d = self.backoff.next(delay);
                    delay = Some(d);
                    warn!(node = %self.node_id, key = %record.key, attempt, "produce failed, retrying in {d:?}: {e}");
                    tokio::select! {
                        _ = ctx.cancelled() => return true,
                        _ = tokio::time::sleep(d) => {}
                    }
                }
                Err(e) => {
                    error!(node = %self.node_id, key = %record.key, "produce failed fatally: {e}");
                    return false;
                }
            }
        }
        false
    }
}
