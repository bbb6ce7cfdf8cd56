//! # Node heartbeat: the periodic self-announcement driver.
//!
//! Every `heart_beat_period` the node publishes a task-less `DOHEARTBEAT`
//! to the sync topic. Observing it (own echo included) triggers the
//! node-info broadcast (see [`super::info`]). The entry re-arms itself
//! through the pending handler; shutdown clears the queue and the weak
//! handle stops the cycle.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::time::Instant;

use crate::pending::PendingHandler;
use crate::signals::{Sender, SignalKind};

/// Periodic `DOHEARTBEAT` driver.
pub struct NodeHeartbeat {
    node_id: String,
    period: Duration,
    sender: Sender,
    pending: Weak<PendingHandler>,
}

impl NodeHeartbeat {
    pub(crate) fn new(
        node_id: String,
        period: Duration,
        sender: Sender,
        pending: Weak<PendingHandler>,
    ) -> Self {
        Self { node_id, period, sender, pending }
    }

    /// Schedules the next heartbeat; each fire publishes and re-arms.
    pub fn arm(self: &Arc<Self>) {
        let Some(pending) = self.pending.upgrade() else {
            return;
        };
        let me = Arc::clone(self);
        pending.schedule(
            format!("node-heartbeat:{}", self.node_id),
            Instant::now() + self.period,
            move || {
                me.sender.send_signal(None, SignalKind::DoHeartbeat, None);
                me.arm();
            },
        );
    }
}
