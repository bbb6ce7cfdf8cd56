//! # Subscriber contract and the built-in log writer.
//!
//! [`Subscribe`] is the extension point for observing the node. A subscriber
//! attached via [`Node::attach_subscriber`](crate::Node::attach_subscriber)
//! is driven by its own supervised loop fed from the bus; a slow subscriber
//! lags and loses old events rather than blocking the runtime.

use async_trait::async_trait;
use tracing::{error, info};

use super::event::{Event, EventKind};

/// Contract for event subscribers.
#[async_trait]
pub trait Subscribe: Send + Sync + 'static {
    /// Handles a single event. Must not block the async runtime.
    async fn on_event(&self, event: &Event);

    /// Human-readable name for logs.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Subscriber that forwards events to `tracing`.
pub struct LogWriter;

impl LogWriter {
    /// Constructs a new [`LogWriter`].
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for LogWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Subscribe for LogWriter {
    async fn on_event(&self, e: &Event) {
        match e.kind {
            EventKind::StateChanged => {
                info!(node = %e.node, task = ?e.task, state = ?e.state, "state changed");
            }
            EventKind::ClaimWon => info!(node = %e.node, task = ?e.task, "claim won"),
            EventKind::ClaimLost => info!(node = %e.node, task = ?e.task, "claim lost"),
            EventKind::HandlingStarted => info!(node = %e.node, task = ?e.task, "handling started"),
            EventKind::HandlingFinished => {
                info!(node = %e.node, task = ?e.task, err = ?e.error, "handling finished");
            }
            EventKind::TaskErrored => {
                error!(node = %e.node, task = ?e.task, err = ?e.error, "task errored");
            }
            EventKind::WatcherStarted => info!(node = %e.node, "watcher started"),
            EventKind::ShutdownRequested => info!(node = %e.node, "shutdown requested"),
            EventKind::NodeStopped => info!(node = %e.node, "node stopped"),
        }
    }

    fn name(&self) -> &'static str {
        "LogWriter"
    }
}
