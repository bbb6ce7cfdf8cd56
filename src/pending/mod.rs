//! # Pending handler: named future actions on a monotonic timer queue.
//!
//! A min-heap of named entries keyed by due instant, plus a name index with
//! replace-by-name semantics. The state machine leans on the replacement
//! rule: one `starter:<task>` entry carries the claim attempt while a task
//! is initiating and the periodic handling start once it is claimed;
//! scheduling either simply repoints the same name.
//!
//! ## Ordering guarantees
//! - For entries `a`, `b` with `a.due < b.due`, `a` fires before `b`.
//! - Ties break by insertion order.
//! - Actions run serially on the handler loop; long work must be handed to
//!   an executor task, never run inline.
//!
//! ## Rules
//! - `schedule` with an existing name replaces the old entry (it will never
//!   fire). `remove` is idempotent.
//! - Waits are interruptible: inserting an earlier-due entry preempts the
//!   current sleep.
//! - Removal cannot recall an action the loop already popped; consumers of
//!   the fired signals tolerate one stale fire.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::clock::ClockRef;
use crate::core::LoopCtx;
use crate::signals::{Signal, SignalKind};

type Action = Box<dyn FnOnce() + Send + 'static>;

struct HeapEntry {
    due: Instant,
    seq: u64,
    name: String,
    action: Action,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}
impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // Reversed so the max-heap pops the earliest due, then insertion order.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct Inner {
    heap: BinaryHeap<HeapEntry>,
    /// name -> seq of the live entry for that name (lazy heap deletion).
    live: HashMap<String, u64>,
    seq: u64,
}

/// Thread-safe timer queue with replace-by-name semantics.
pub struct PendingHandler {
    inner: Mutex<Inner>,
    changed: Notify,
    signal_tx: mpsc::Sender<Signal>,
    node_id: String,
    clock: ClockRef,
    wait_in_new_state: Duration,
    claiming_jitter: Duration,
}

impl PendingHandler {
    /// Creates a handler feeding internal signals into `signal_tx`.
    pub fn new(
        signal_tx: mpsc::Sender<Signal>,
        node_id: String,
        clock: ClockRef,
        wait_in_new_state: Duration,
        claiming_jitter: Duration,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            changed: Notify::new(),
            signal_tx,
            node_id,
            clock,
            wait_in_new_state,
            claiming_jitter,
        }
    }

    /// Schedules `action` under `name` at `due`, replacing any entry with
    /// the same name.
    pub fn schedule<F>(&self, name: impl Into<String>, due: Instant, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        {
            let mut inner = self.inner.lock().expect("pending poisoned");
            inner.seq += 1;
            let seq = inner.seq;
            inner.live.insert(name.clone(), seq);
            inner.heap.push(HeapEntry { due, seq, name, action: Box::new(action) });
        }
        self.changed.notify_one();
    }

    /// Removes the entry named `name`; idempotent.
    pub fn remove(&self, name: &str) {
        let mut inner = self.inner.lock().expect("pending poisoned");
        inner.live.remove(name);
    }

    /// Number of live entries (diagnostics and tests).
    pub fn len(&self) -> usize {
        self.inner.lock().expect("pending poisoned").live.len()
    }

    /// True when no entry is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cooperative loop: waits for the earliest due entry, runs its action
    /// on this loop, rescans. Earlier-due insertions preempt the wait.
    pub async fn run(&self, ctx: LoopCtx) {
        ctx.set_running();
        loop {
            let (due_actions, next_due) = self.collect_due();
            let fired = !due_actions.is_empty();
            for action in due_actions {
                action();
            }
            if fired {
                continue;
            }

            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = self.changed.notified() => {}
                _ = Self::sleep_until_opt(next_due) => {}
            }
        }
        // Drop remaining actions so timers do not survive shutdown.
        let mut inner = self.inner.lock().expect("pending poisoned");
        inner.heap.clear();
        inner.live.clear();
        drop(inner);
        ctx.set_stopped();
    }

    async fn sleep_until_opt(due: Option<Instant>) {
        match due {
            Some(d) => tokio::time::sleep_until(d).await,
            None => std::future::pending().await,
        }
    }

    /// Pops every live entry that is due, skipping replaced ones.
    fn collect_due(&self) -> (Vec<Action>, Option<Instant>) {
        let mut inner = self.inner.lock().expect("pending poisoned");
        let now = Instant::now();
        let mut due_actions = Vec::new();
        loop {
            let replaced = match inner.heap.peek() {
                None => break,
                Some(e) => {
                    if inner.live.get(&e.name) != Some(&e.seq) {
                        true
                    } else if e.due <= now {
                        false
                    } else {
                        break;
                    }
                }
            };
            let entry = inner.heap.pop().expect("peeked entry vanished");
            if replaced {
                continue; // replaced or removed; never fires
            }
            inner.live.remove(&entry.name);
            due_actions.push(entry.action);
        }
        let next_due = inner.heap.peek().map(|e| e.due);
        (due_actions, next_due)
    }

    // ---------------------------
    // Task-named helpers
    // ---------------------------

    fn starter_name(task: &str) -> String {
        format!("starter:{task}")
    }

    fn heartbeat_name(task: &str) -> String {
        format!("claimed-heartbeat:{task}")
    }

    fn resurrection_name(task: &str) -> String {
        format!("resurrection:{task}")
    }

    fn jitter(&self) -> Duration {
        let bound = self.claiming_jitter.as_nanos() as u64;
        if bound == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(rand::thread_rng().gen_range(0..=bound))
    }

    fn fire_internal(&self, task: &str, kind: SignalKind) -> impl FnOnce() + Send + 'static {
        let tx = self.signal_tx.clone();
        let signal = Signal::internal(task, kind, &self.node_id, self.clock.now());
        let node = self.node_id.clone();
        move || {
            if let Err(e) = tx.try_send(signal) {
                warn!(node = %node, "internal signal queue rejected timer fire: {e}");
            }
        }
    }

    /// Schedules a near-immediate (jittered) claim attempt.
    pub fn schedule_task_for_claiming(&self, task: &str) {
        let due = Instant::now() + self.jitter();
        debug!(node = %self.node_id, task, "scheduling claim attempt");
        self.schedule(Self::starter_name(task), due, self.fire_internal(task, SignalKind::ClaimingI));
    }

    /// Schedules the claim attempt for a freshly registered task, after the
    /// configured idle period in `NEW`/`INITIATING`.
    pub fn schedule_wait_for_new_switch(&self, task: &str) {
        let due = Instant::now() + self.wait_in_new_state + self.jitter();
        self.schedule(Self::starter_name(task), due, self.fire_internal(task, SignalKind::ClaimingI));
    }

    /// Schedules the next periodic job execution on this node.
    pub fn schedule_task_handling_on_node(&self, task: &str, delay: Duration) {
        let due = Instant::now() + delay;
        self.schedule(Self::starter_name(task), due, self.fire_internal(task, SignalKind::HandlingI));
    }

    /// Schedules the next owner heartbeat for a claimed task.
    pub fn schedule_task_heartbeat_on_node(&self, task: &str, period: Duration) {
        let due = Instant::now() + period;
        self.schedule(Self::heartbeat_name(task), due, self.fire_internal(task, SignalKind::HeartbeatI));
    }

    /// Arms (or re-arms) the silence watchdog for a task.
    pub fn schedule_task_resurrection(&self, task: &str, timeout: Duration) {
        let due = Instant::now() + timeout;
        self.schedule(Self::resurrection_name(task), due, self.fire_internal(task, SignalKind::ResurrectingI));
    }

    /// Cancels the starter entry (claim attempt or periodic handling).
    pub fn remove_task_starter(&self, task: &str) {
        self.remove(&Self::starter_name(task));
    }

    /// Cancels the owner-heartbeat entry.
    pub fn remove_claimed_heartbeat(&self, task: &str) {
        self.remove(&Self::heartbeat_name(task));
    }

    /// Cancels the silence watchdog.
    pub fn remove_task_resurrection(&self, task: &str) {
        self.remove(&Self::resurrection_name(task));
    }

    /// Cancels every entry belonging to `task` (error-state cleanup).
    pub fn remove_all_for_task(&self, task: &str) {
        self.remove_task_starter(task);
        self.remove_claimed_heartbeat(task);
        self.remove_task_resurrection(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{FixedClock, SystemClock};
    use crate::core::spawn_loop;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn handler() -> (Arc<PendingHandler>, mpsc::Receiver<Signal>) {
        let (tx, rx) = mpsc::channel(64);
        let p = Arc::new(PendingHandler::new(
            tx,
            "host_1_1".into(),
            Arc::new(SystemClock),
            Duration::from_secs(1),
            Duration::ZERO,
        ));
        (p, rx)
    }

    fn start(p: &Arc<PendingHandler>) -> (CancellationToken, crate::core::Stoppable) {
        let token = CancellationToken::new();
        let runner = Arc::clone(p);
        let s = spawn_loop("pending", &token, move |ctx| async move {
            runner.run(ctx).await;
        });
        (token, s)
    }

    #[tokio::test(start_paused = true)]
    async fn fires_in_due_order_with_insertion_tiebreak() {
        let (p, _rx) = handler();
        let (out_tx, mut out) = mpsc::unbounded_channel::<&'static str>();
        let (token, _s) = start(&p);

        let now = Instant::now();
        let t1 = out_tx.clone();
        let t2 = out_tx.clone();
        let t3 = out_tx.clone();
        p.schedule("b", now + Duration::from_millis(50), move || {
            let _ = t1.send("b");
        });
        p.schedule("a", now + Duration::from_millis(20), move || {
            let _ = t2.send("a");
        });
        // Same due as "b": insertion order breaks the tie.
        p.schedule("c", now + Duration::from_millis(50), move || {
            let _ = t3.send("c");
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut fired = Vec::new();
        while let Ok(v) = out.try_recv() {
            fired.push(v);
        }
        assert_eq!(fired, ["a", "b", "c"]);
        token.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn replace_by_name_fires_once_at_new_due() {
        let (p, _rx) = handler();
        let (out_tx, mut out) = mpsc::unbounded_channel::<&'static str>();
        let (token, _s) = start(&p);

        let t1 = out_tx.clone();
        p.schedule("h", Instant::now() + Duration::from_millis(1000), move || {
            let _ = t1.send("a1");
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        let t2 = out_tx.clone();
        // Earlier due preempts the pending wait on the old deadline.
        p.schedule("h", Instant::now() + Duration::from_millis(100), move || {
            let _ = t2.send("a2");
        });

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(out.try_recv().ok(), Some("a2"));
        assert!(out.try_recv().is_err());

        // The replaced entry never fires, even past its original due.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(out.try_recv().is_err());
        token.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn remove_is_idempotent_and_cancels() {
        let (p, _rx) = handler();
        let (out_tx, mut out) = mpsc::unbounded_channel::<&'static str>();
        let (token, _s) = start(&p);

        p.schedule("x", Instant::now() + Duration::from_millis(50), move || {
            let _ = out_tx.send("x");
        });
        p.remove("x");
        p.remove("x");
        p.remove("never-existed");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(out.try_recv().is_err());
        assert!(p.is_empty());
        token.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn helpers_emit_internal_signals() {
        let (tx, mut rx) = mpsc::channel(8);
        let p = Arc::new(PendingHandler::new(
            tx,
            "host_1_1".into(),
            Arc::new(FixedClock::at_epoch_plus(Duration::from_secs(1))),
            Duration::from_millis(10),
            Duration::ZERO,
        ));
        let (token, _s) = start(&p);

        p.schedule_task_for_claiming("job");
        tokio::time::sleep(Duration::from_millis(5)).await;
        let sig = rx.recv().await.expect("claiming fire");
        assert_eq!(sig.kind, SignalKind::ClaimingI);
        assert_eq!(sig.task_name.as_deref(), Some("job"));
        assert_eq!(sig.origin, "host_1_1");

        p.schedule_task_heartbeat_on_node("job", Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(25)).await;
        let sig = rx.recv().await.expect("heartbeat fire");
        assert_eq!(sig.kind, SignalKind::HeartbeatI);
        token.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn starter_entry_is_shared_between_claiming_and_handling() {
        let (tx, mut rx) = mpsc::channel(8);
        let p = Arc::new(PendingHandler::new(
            tx,
            "host_1_1".into(),
            Arc::new(SystemClock),
            Duration::from_secs(10),
            Duration::ZERO,
        ));
        let (token, _s) = start(&p);

        // A pending claim attempt far in the future...
        p.schedule_wait_for_new_switch("job");
        // ...is replaced by a near handling start under the same name.
        p.schedule_task_handling_on_node("job", Duration::from_millis(10));
        assert_eq!(p.len(), 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let sig = rx.recv().await.expect("handling fire");
        assert_eq!(sig.kind, SignalKind::HandlingI);
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(rx.try_recv().is_err(), "replaced claim attempt must not fire");
        token.cancel();
    }
}