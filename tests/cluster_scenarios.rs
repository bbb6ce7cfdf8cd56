//! Cluster simulation scenarios over the in-memory log.
//!
//! Multiple nodes run in one process against one `MemoryLog` topic; tokio's
//! paused clock drives all timers deterministically.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use taskherd::core::spawn_loop;
use taskherd::log::memory::{MemoryLog, MemoryLogClient};
use taskherd::log::{LogClient, Offset};
use taskherd::signals::{Signal, SignalDoc, SignalKind, WirePayload};
use taskherd::{
    Config, Event, EventKind, JobError, Node, PendingHandler, SystemClock, TaskDefinition,
    TaskState,
};
use tokio_util::sync::CancellationToken;

fn definition(name: &str) -> TaskDefinition {
    TaskDefinition::builder(name)
        .with_period(Duration::from_secs(5))
        .with_max_duration(Duration::from_secs(5))
        .with_claimed_signal_period(Duration::from_secs(1))
        .with_resurrection(Duration::from_secs(8))
        .build_fn(|_ctx| async { Ok::<(), JobError>(()) })
}

fn counting_definition(name: &str, counter: Arc<AtomicU32>) -> TaskDefinition {
    TaskDefinition::builder(name)
        .with_period(Duration::from_secs(5))
        .with_claimed_signal_period(Duration::from_secs(1))
        .with_resurrection(Duration::from_secs(8))
        .build_fn(move |_ctx| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), JobError>(())
            }
        })
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn start_node(log: &MemoryLog) -> (Arc<Node>, Arc<MemoryLogClient>) {
    init_tracing();
    let client = Arc::new(log.client());
    let node = Node::new(
        Config::default(),
        Arc::clone(&client) as Arc<dyn LogClient>,
        Arc::new(SystemClock),
    );
    node.run().await.expect("node starts");
    (node, client)
}

/// Task-signal records currently in the log, with their offsets.
fn signal_records(log: &MemoryLog) -> Vec<(Offset, SignalDoc)> {
    log.records()
        .into_iter()
        .filter_map(|r| match serde_json::from_str::<WirePayload>(&r.value) {
            Ok(WirePayload::Signal(doc)) => Some((r.offset, doc)),
            _ => None,
        })
        .collect()
}

fn count_kind(records: &[(Offset, SignalDoc)], task: &str, kind: SignalKind) -> usize {
    records
        .iter()
        .filter(|(_, d)| d.task_name.as_deref() == Some(task) && d.kind == kind)
        .count()
}

/// Replays captured events in sequence order and asserts that no two nodes
/// ever held the same task simultaneously.
fn assert_mutual_exclusion(mut events: Vec<Event>, task: &str) {
    events.sort_by_key(|e| e.seq);
    let mut owners: Vec<String> = Vec::new();
    for e in events {
        if e.kind != EventKind::StateChanged || e.task.as_deref() != Some(task) {
            continue;
        }
        let owned = e.state.map(|s| s.is_locally_owned()).unwrap_or(false);
        owners.retain(|n| n != &e.node);
        if owned {
            owners.push(e.node.clone());
        }
        assert!(
            owners.len() <= 1,
            "two simultaneous owners for '{task}': {owners:?}"
        );
    }
}

fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<Event>, into: &mut Vec<Event>) {
    while let Ok(e) = rx.try_recv() {
        into.push(e);
    }
}

#[tokio::test(start_paused = true)]
async fn s1_single_node_claims_and_executes() {
    let log = MemoryLog::new("sync");
    let (node, _client) = start_node(&log).await;

    let runs = Arc::new(AtomicU32::new(0));
    node.register(counting_definition("tick", Arc::clone(&runs)))
        .await
        .expect("register");
    assert_eq!(node.task("tick").unwrap().state, TaskState::New);

    tokio::time::sleep(Duration::from_secs(2)).await;

    let snap = node.task("tick").unwrap();
    assert_eq!(snap.state, TaskState::ClaimedByNode);
    assert!(runs.load(Ordering::SeqCst) >= 1, "job ran after the claim");

    let records = signal_records(&log);
    assert_eq!(count_kind(&records, "tick", SignalKind::Claiming), 1);
    assert_eq!(count_kind(&records, "tick", SignalKind::Claimed), 1);

    node.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn s2_two_node_race_has_one_winner() {
    let log = MemoryLog::new("sync");
    let (a, _ca) = start_node(&log).await;
    let (b, _cb) = start_node(&log).await;

    let mut rx_a = a.bus().subscribe();
    let mut rx_b = b.bus().subscribe();
    let mut events = Vec::new();

    a.register(definition("job")).await.expect("register on a");
    b.register(definition("job")).await.expect("register on b");

    tokio::time::sleep(Duration::from_secs(3)).await;
    drain_events(&mut rx_a, &mut events);
    drain_events(&mut rx_b, &mut events);

    let sa = a.task("job").unwrap();
    let sb = b.task("job").unwrap();
    let states = [sa.state, sb.state];
    assert_eq!(
        states
            .iter()
            .filter(|s| **s == TaskState::ClaimedByNode)
            .count(),
        1,
        "exactly one winner, got {states:?}"
    );

    let (winner, loser_snap) = if sa.state == TaskState::ClaimedByNode {
        (a.node_id().to_string(), sb)
    } else {
        (b.node_id().to_string(), sa)
    };
    assert_eq!(loser_snap.state, TaskState::ClaimedByOther);
    assert_eq!(loser_snap.current_executor.as_deref(), Some(winner.as_str()));

    assert_mutual_exclusion(events, "job");

    // The DOHEARTBEAT cycle surfaced each node's inventory to the other.
    assert!(!a.peer_information().is_empty());
    assert!(!b.peer_information().is_empty());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn s3_graceful_handoff_on_shutdown() {
    let log = MemoryLog::new("sync");
    let (a, _ca) = start_node(&log).await;
    let (b, _cb) = start_node(&log).await;

    let mut rx_a = a.bus().subscribe();
    let mut rx_b = b.bus().subscribe();
    let mut events = Vec::new();

    a.register(definition("job")).await.expect("register on a");
    b.register(definition("job")).await.expect("register on b");
    tokio::time::sleep(Duration::from_secs(3)).await;

    let (owner, backup) = if a.task("job").unwrap().state == TaskState::ClaimedByNode {
        (Arc::clone(&a), Arc::clone(&b))
    } else {
        (Arc::clone(&b), Arc::clone(&a))
    };
    let owner_id = owner.node_id().to_string();
    let backup_id = backup.node_id().to_string();

    owner.shutdown().await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    drain_events(&mut rx_a, &mut events);
    drain_events(&mut rx_b, &mut events);

    // Shutdown politeness: the release is on the log, authored by the owner.
    let records = signal_records(&log);
    let unclaimed_offset = records
        .iter()
        .find(|(_, d)| d.kind == SignalKind::Unclaimed && d.origin == owner_id)
        .map(|(o, _)| *o)
        .expect("owner released through the log");

    // The handoff claim references the release and comes after it.
    let backup_claim = records
        .iter()
        .find(|(o, d)| {
            d.kind == SignalKind::Claiming && d.origin == backup_id && *o > unclaimed_offset
        })
        .expect("backup claimed after the release");
    assert_eq!(backup_claim.1.reference, Some(unclaimed_offset));

    let snap = backup.task("job").unwrap();
    assert_eq!(snap.state, TaskState::ClaimedByNode);
    assert_eq!(snap.unclaimed_signal_offset, Some(unclaimed_offset));

    assert_mutual_exclusion(events, "job");
    backup.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn s4_silent_owner_is_resurrected() {
    let log = MemoryLog::new("sync");
    let (a, ca) = start_node(&log).await;
    let (b, cb) = start_node(&log).await;

    a.register(definition("job")).await.expect("register on a");
    b.register(definition("job")).await.expect("register on b");
    tokio::time::sleep(Duration::from_secs(3)).await;

    let (owner, owner_client, backup) = if a.task("job").unwrap().state == TaskState::ClaimedByNode
    {
        (Arc::clone(&a), ca, Arc::clone(&b))
    } else {
        (Arc::clone(&b), cb, Arc::clone(&a))
    };
    assert_eq!(backup.task("job").unwrap().state, TaskState::ClaimedByOther);

    // The owner's publishes stop reaching the cluster; its consumer lives.
    owner_client.halt();

    // Resurrection timeout is 8s past the last observed owner activity.
    tokio::time::sleep(Duration::from_secs(12)).await;

    assert_eq!(backup.task("job").unwrap().state, TaskState::ClaimedByNode);
    // The halted owner saw the new claim and stood down.
    assert!(!owner.task("job").unwrap().state.is_locally_owned());

    backup.shutdown().await;
    owner.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn s5_forged_claimed_errors_only_that_task() {
    let log = MemoryLog::new("sync");
    let (node, client) = start_node(&log).await;

    node.register(definition("victim")).await.expect("register");
    node.register(definition("bystander")).await.expect("register");
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(node.task("victim").unwrap().state, TaskState::ClaimedByNode);
    assert_eq!(node.task("bystander").unwrap().state, TaskState::ClaimedByNode);

    // Inject a forged CLAIMED from a node that never claimed.
    let forged = SignalDoc::new(
        Some("victim"),
        SignalKind::Claimed,
        "intruder_1_1",
        None,
        std::time::SystemTime::now(),
    );
    let producer = client.producer().await.expect("producer");
    producer
        .send("victim", serde_json::to_string(&forged).unwrap())
        .await
        .expect("forged record");

    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(node.task("victim").unwrap().state, TaskState::Error);
    assert_eq!(node.task("bystander").unwrap().state, TaskState::ClaimedByNode);

    node.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn s6_pending_replacement_preempts() {
    let (tx, _rx) = mpsc::channel::<Signal>(8);
    let pending = Arc::new(PendingHandler::new(
        tx,
        "host_1_1".to_string(),
        Arc::new(SystemClock),
        Duration::from_secs(1),
        Duration::ZERO,
    ));
    let token = CancellationToken::new();
    let runner = Arc::clone(&pending);
    let _loop = spawn_loop("pending", &token, move |ctx| async move {
        runner.run(ctx).await;
    });

    let (fired_tx, mut fired_rx) = mpsc::unbounded_channel::<(&'static str, Instant)>();
    let start = Instant::now();

    let t1 = fired_tx.clone();
    pending.schedule("h", start + Duration::from_millis(1000), move || {
        let _ = t1.send(("a1", Instant::now()));
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    let t2 = fired_tx.clone();
    pending.schedule("h", start + Duration::from_millis(200), move || {
        let _ = t2.send(("a2", Instant::now()));
    });

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let (which, at) = fired_rx.try_recv().expect("exactly one fire");
    assert_eq!(which, "a2");
    assert_eq!(at.duration_since(start), Duration::from_millis(200));
    assert!(fired_rx.try_recv().is_err(), "a1 must never fire");

    token.cancel();
}

#[tokio::test(start_paused = true)]
async fn late_starting_node_learns_placement_from_history() {
    let log = MemoryLog::new("sync");
    let (a, _ca) = start_node(&log).await;
    a.register(definition("job")).await.expect("register on a");
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(a.task("job").unwrap().state, TaskState::ClaimedByNode);

    // A node joining late replays history before serving...
    let (late, _cl) = start_node(&log).await;
    let snap = late.register(definition("job")).await.expect("register late");

    // ...so the task starts as claimed-by-other instead of contending.
    assert_eq!(snap.state, TaskState::ClaimedByOther);
    assert_eq!(snap.current_executor.as_deref(), Some(a.node_id()));

    tokio::time::sleep(Duration::from_secs(3)).await;
    let records = signal_records(&log);
    let late_claims = records
        .iter()
        .filter(|(_, d)| d.kind == SignalKind::Claiming && d.origin == late.node_id())
        .count();
    assert_eq!(late_claims, 0, "late node must not race a live owner");
    assert_eq!(late.task("job").unwrap().state, TaskState::ClaimedByOther);

    a.shutdown().await;
    late.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn baselines_advance_monotonically_across_handoffs() {
    let log = MemoryLog::new("sync");
    let (a, _ca) = start_node(&log).await;
    let (b, _cb) = start_node(&log).await;

    a.register(definition("job")).await.expect("register on a");
    b.register(definition("job")).await.expect("register on b");

    let mut last_a: Option<Offset> = None;
    let mut last_b: Option<Offset> = None;
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        for (node, last) in [(&a, &mut last_a), (&b, &mut last_b)] {
            let current = node.task("job").unwrap().unclaimed_signal_offset;
            if let (Some(prev), Some(now)) = (*last, current) {
                assert!(now >= prev, "baseline regressed: {prev} -> {now}");
            }
            if current.is_some() {
                *last = current;
            }
        }
    }

    // Force one release round and keep checking.
    let owner = if a.task("job").unwrap().state == TaskState::ClaimedByNode {
        &a
    } else {
        &b
    };
    owner.unclaim("job");
    tokio::time::sleep(Duration::from_secs(3)).await;
    for (node, last) in [(&a, &last_a), (&b, &last_b)] {
        if let (Some(prev), Some(now)) =
            (*last, node.task("job").unwrap().unclaimed_signal_offset)
        {
            assert!(now >= prev, "baseline regressed after release");
        }
    }

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn heartbeat_marks_handling_for_peers() {
    let log = MemoryLog::new("sync");
    let (a, _ca) = start_node(&log).await;
    let (b, _cb) = start_node(&log).await;

    // A slow job: peers should observe HANDLING, then HEARTBEAT flips them
    // back to claimed-by-other.
    let slow = TaskDefinition::builder("slow")
        .with_period(Duration::from_secs(4))
        .with_max_duration(Duration::from_secs(10))
        .with_claimed_signal_period(Duration::from_secs(1))
        .with_resurrection(Duration::from_secs(30))
        .build_fn(|_ctx| async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok::<(), JobError>(())
        });

    a.register(slow).await.expect("register on a");
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(a.task("slow").unwrap().state, TaskState::HandlingByNode);

    // B joins mid-execution: the last signal in history is HANDLING, so the
    // task starts as handling-by-other.
    let snap = b.register(definition("slow")).await.expect("register on b");
    assert_eq!(snap.state, TaskState::HandlingByOther);
    assert_eq!(snap.current_executor.as_deref(), Some(a.node_id()));

    // Execution ends around t=3.2s; the next owner HEARTBEAT reports a
    // quiet claim and flips the peer view back.
    tokio::time::sleep(Duration::from_millis(2800)).await;
    assert_eq!(b.task("slow").unwrap().state, TaskState::ClaimedByOther);

    let records = signal_records(&log);
    assert!(count_kind(&records, "slow", SignalKind::Handling) >= 1);

    a.shutdown().await;
    b.shutdown().await;
}
