//! # Stoppable: one supervised background loop.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Capabilities handed to a supervised loop body.
pub struct LoopCtx {
    name: &'static str,
    token: CancellationToken,
    ready: watch::Sender<bool>,
}

impl LoopCtx {
    /// Marks the loop as running. Call once initialization is done.
    pub fn set_running(&self) {
        let _ = self.ready.send(true);
        debug!(name = self.name, "loop running");
    }

    /// Marks the loop as stopped. Call on the way out.
    pub fn set_stopped(&self) {
        let _ = self.ready.send(false);
        debug!(name = self.name, "loop stopped");
    }

    /// Completes when the loop should exit.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// True once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Handle to a spawned supervised loop.
pub struct Stoppable {
    name: &'static str,
    token: CancellationToken,
    ready: watch::Receiver<bool>,
    handle: JoinHandle<()>,
}

/// Spawns `f` on the runtime as a supervised loop.
///
/// The loop's token is a child of `parent`: canceling the parent stops the
/// loop, and [`Stoppable::stop`] stops just this one.
pub fn spawn_loop<F, Fut>(name: &'static str, parent: &CancellationToken, f: F) -> Stoppable
where
    F: FnOnce(LoopCtx) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let token = parent.child_token();
    let (ready_tx, ready_rx) = watch::channel(false);
    let ctx = LoopCtx { name, token: token.clone(), ready: ready_tx };
    let handle = tokio::spawn(f(ctx));
    Stoppable { name, token, ready: ready_rx, handle }
}

impl Stoppable {
    /// Name of this loop.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// True while the loop reports running.
    pub fn is_running(&self) -> bool {
        *self.ready.borrow()
    }

    /// Requests cooperative termination of this loop only.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Waits until the loop reports running; false if it exited first or the
    /// deadline passed.
    pub async fn wait_running(&mut self, deadline: Duration) -> bool {
        let waited = tokio::time::timeout(deadline, self.ready.wait_for(|r| *r)).await;
        matches!(waited, Ok(Ok(_)))
    }

    /// Waits for the loop task to exit; false on deadline.
    pub async fn join(&mut self, deadline: Duration) -> bool {
        tokio::time::timeout(deadline, &mut self.handle).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loop_reports_running_and_stops_on_cancel() {
        let parent = CancellationToken::new();
        let mut s = spawn_loop("demo", &parent, |ctx| async move {
            ctx.set_running();
            ctx.cancelled().await;
            ctx.set_stopped();
        });

        assert!(s.wait_running(Duration::from_secs(1)).await);
        assert!(s.is_running());
        s.stop();
        assert!(s.join(Duration::from_secs(1)).await);
        assert!(!s.is_running());
    }

    #[tokio::test]
    async fn parent_cancel_propagates() {
        let parent = CancellationToken::new();
        let mut s = spawn_loop("child", &parent, |ctx| async move {
            ctx.set_running();
            ctx.cancelled().await;
        });
        assert!(s.wait_running(Duration::from_secs(1)).await);
        parent.cancel();
        assert!(s.join(Duration::from_secs(1)).await);
    }
}
