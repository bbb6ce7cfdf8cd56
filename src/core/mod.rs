//! # Supervised loops.
//!
//! Every background loop of a node (pending handler, sender, watcher,
//! subscriber feeds) runs as a [`Stoppable`]: a spawned task with a
//! cancellation token and a readiness flag. The [`Supervisor`] owns the set
//! and drives lifecycle uniformly: wait until every loop reports running at
//! startup, cancel and join all of them at shutdown.
//!
//! ## Rules
//! - A loop calls [`LoopCtx::set_running`] once it can do useful work and
//!   [`LoopCtx::set_stopped`] on the way out.
//! - Loops exit cooperatively when their token is canceled; no loop blocks
//!   without a deadline.
//! - Loop tokens are children of the node token, so one cancel stops all.

mod stoppable;

pub use stoppable::{spawn_loop, LoopCtx, Stoppable};

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::NodeError;

/// Owns the node's supervised loops.
pub struct Supervisor {
    loops: Vec<Stoppable>,
    token: CancellationToken,
}

impl Supervisor {
    /// Creates a supervisor whose loops descend from `node_token`.
    pub fn new(node_token: CancellationToken) -> Self {
        Self { loops: Vec::new(), token: node_token }
    }

    /// Token all supervised loops descend from.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Spawns `f` as a supervised loop and adopts it.
    pub fn supervise<F, Fut>(&mut self, name: &'static str, f: F)
    where
        F: FnOnce(LoopCtx) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.loops.push(spawn_loop(name, &self.token, f));
    }

    /// Waits until every adopted loop reports running.
    pub async fn wait_all_running(&mut self, deadline: Duration) -> Result<(), NodeError> {
        for l in &mut self.loops {
            if !l.wait_running(deadline).await {
                return Err(NodeError::StartupTimeout { name: l.name(), deadline });
            }
        }
        Ok(())
    }

    /// True when every adopted loop is currently running.
    pub fn all_running(&self) -> bool {
        self.loops.iter().all(Stoppable::is_running)
    }

    /// Cancels every loop and waits for each to exit.
    pub async fn stop_all(&mut self) {
        self.token.cancel();
        for l in &mut self.loops {
            if !l.join(Duration::from_secs(5)).await {
                warn!(name = l.name(), "loop did not exit within the join deadline");
            }
        }
        self.loops.clear();
    }
}
