//! Integration tests for the reconciliation flow.
//!
//! These tests drive the reconciler tick by tick against MockClusterApi:
//! 1. The mock serves a scripted allocation listing
//! 2. The reconciler diffs it against the tracked set
//! 3. Events land on the added/removed/error sinks
//!
//! A few tests run the full loop with paused time.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use allocsync_id::{AllocationId, NodeId};
use allocsync_node_watcher::actors::TrackedSet;
use allocsync_node_watcher::allocation::{Allocation, AllocationEvent, ClientStatus};
use allocsync_node_watcher::error::{ApiError, ApiErrorKind};
use allocsync_node_watcher::mock::MockClusterApi;
use allocsync_node_watcher::reconciler::{
    event_channels, live_allocations, EventStreams, OverflowPolicy, Reconciler, ReconcilerConfig,
    TickOutcome,
};
use allocsync_node_watcher::signal;
use proptest::prelude::*;
use rstest::rstest;
use tokio::sync::watch;

fn node() -> NodeId {
    NodeId::parse("node-1").unwrap()
}

fn alloc(id: &str, status: ClientStatus) -> Allocation {
    Allocation {
        id: AllocationId::parse(id).unwrap(),
        name: format!("web.app[{id}]"),
        node_id: node(),
        job_id: "web".to_string(),
        task_group: "app".to_string(),
        client_status: status,
        tasks: vec!["server".to_string()],
    }
}

fn running(id: &str) -> Allocation {
    alloc(id, ClientStatus::Running)
}

struct Harness {
    api: Arc<MockClusterApi>,
    tracked: TrackedSet,
    reconciler: Arc<Reconciler>,
    streams: EventStreams,
}

fn harness(initial: Vec<Allocation>, buffer: usize, overflow: OverflowPolicy) -> Harness {
    let api = Arc::new(MockClusterApi::new());
    let (tracked, _task) = TrackedSet::spawn_with(initial, signal::never());
    let (sinks, streams) = event_channels(buffer);
    let config = ReconcilerConfig {
        poll_interval: Duration::from_secs(10),
        overflow,
    };
    let reconciler = Arc::new(Reconciler::new(
        node(),
        api.clone(),
        tracked.clone(),
        sinks,
        config,
    ));

    Harness {
        api,
        tracked,
        reconciler,
        streams,
    }
}

fn drain(rx: &mut tokio::sync::mpsc::Receiver<AllocationEvent>) -> Vec<String> {
    let mut ids = Vec::new();
    while let Ok(event) = rx.try_recv() {
        ids.push(event.allocation().id.to_string());
    }
    ids
}

async fn tracked_ids(tracked: &TrackedSet) -> Vec<String> {
    tracked
        .snapshot()
        .await
        .unwrap()
        .ids()
        .into_iter()
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn test_empty_to_two_allocations() {
    let mut h = harness(Vec::new(), 16, OverflowPolicy::Block);
    h.api.push_allocations(vec![running("a1"), running("a2")]);

    let outcome = h.reconciler.tick(&mut signal::never()).await.unwrap();

    assert_eq!(
        outcome,
        TickOutcome::Applied {
            added: 2,
            removed: 0,
            dropped: 0
        }
    );
    assert_eq!(drain(&mut h.streams.added), vec!["a1", "a2"]);
    assert!(drain(&mut h.streams.removed).is_empty());
    assert_eq!(tracked_ids(&h.tracked).await, vec!["a1", "a2"]);
}

#[tokio::test]
async fn test_diff_against_tracked_set() {
    let mut h = harness(
        vec![running("a1"), running("a2"), running("a3")],
        16,
        OverflowPolicy::Block,
    );
    h.api
        .push_allocations(vec![running("a2"), running("a4"), running("a3"), running("a5")]);

    h.reconciler.tick(&mut signal::never()).await.unwrap();

    assert_eq!(drain(&mut h.streams.added), vec!["a4", "a5"]);
    assert_eq!(drain(&mut h.streams.removed), vec!["a1"]);
    assert_eq!(tracked_ids(&h.tracked).await, vec!["a2", "a4", "a3", "a5"]);
}

#[tokio::test]
async fn test_added_events_precede_removed() {
    let (tx, mut rx) = tokio::sync::mpsc::channel(16);
    let api = Arc::new(MockClusterApi::new());
    let (tracked, _task) = TrackedSet::spawn_with(vec![running("old")], signal::never());
    let (mut sinks, _streams) = event_channels(16);
    // Both sinks feed one channel so cross-sink ordering is observable.
    sinks.added = tx.clone();
    sinks.removed = tx;
    let reconciler = Reconciler::new(node(), api.clone(), tracked, sinks, ReconcilerConfig::default());

    api.push_allocations(vec![running("new-1"), running("new-2")]);
    reconciler.tick(&mut signal::never()).await.unwrap();

    let mut order = Vec::new();
    while let Ok(event) = rx.try_recv() {
        order.push(match event {
            AllocationEvent::Added(a) => format!("+{}", a.id),
            AllocationEvent::Removed(a) => format!("-{}", a.id),
        });
    }
    assert_eq!(order, vec!["+new-1", "+new-2", "-old"]);
}

#[tokio::test]
async fn test_steady_state_emits_nothing() {
    let mut h = harness(vec![running("a1"), running("a2")], 16, OverflowPolicy::Block);
    h.api.push_allocations(vec![running("a2"), running("a1")]);

    for _ in 0..3 {
        let outcome = h.reconciler.tick(&mut signal::never()).await.unwrap();
        assert_eq!(
            outcome,
            TickOutcome::Applied {
                added: 0,
                removed: 0,
                dropped: 0
            }
        );
    }

    assert!(drain(&mut h.streams.added).is_empty());
    assert!(drain(&mut h.streams.removed).is_empty());
    assert_eq!(h.api.list_calls(), 3);

    let snapshot = h.tracked.snapshot().await.unwrap();
    assert_eq!(snapshot.generation, 3);
    assert_eq!(tracked_ids(&h.tracked).await, vec!["a2", "a1"]);
}

#[rstest]
#[case::pending(ClientStatus::Pending)]
#[case::failed(ClientStatus::Failed)]
#[case::complete(ClientStatus::Complete)]
#[case::lost(ClientStatus::Lost)]
#[case::unknown(ClientStatus::Unknown)]
#[tokio::test]
async fn test_non_live_status_is_removed(#[case] status: ClientStatus) {
    let mut h = harness(vec![running("a1"), running("a2")], 16, OverflowPolicy::Block);
    h.api.push_allocations(vec![running("a1"), alloc("a2", status), alloc("a3", status)]);

    h.reconciler.tick(&mut signal::never()).await.unwrap();

    assert!(drain(&mut h.streams.added).is_empty());
    assert_eq!(drain(&mut h.streams.removed), vec!["a2"]);
    assert_eq!(tracked_ids(&h.tracked).await, vec!["a1"]);
}

#[tokio::test]
async fn test_restarting_is_not_churn() {
    let mut h = harness(vec![running("a1")], 16, OverflowPolicy::Block);
    h.api.push_allocations(vec![alloc("a1", ClientStatus::Restarting)]);
    h.api.push_allocations(vec![running("a1")]);

    h.reconciler.tick(&mut signal::never()).await.unwrap();
    h.reconciler.tick(&mut signal::never()).await.unwrap();

    assert!(drain(&mut h.streams.added).is_empty());
    assert!(drain(&mut h.streams.removed).is_empty());
}

#[tokio::test]
async fn test_fetch_failure_is_isolated() {
    let mut h = harness(vec![running("a1")], 16, OverflowPolicy::Block);
    h.api.push_error(ApiError::Network("connection refused".to_string()));

    let outcome = h.reconciler.tick(&mut signal::never()).await.unwrap();

    assert_eq!(outcome, TickOutcome::FetchFailed);
    let err = h.streams.errors.try_recv().unwrap();
    assert_eq!(err.kind(), ApiErrorKind::Network);
    assert!(h.streams.errors.try_recv().is_err());
    assert!(drain(&mut h.streams.added).is_empty());
    assert!(drain(&mut h.streams.removed).is_empty());

    let snapshot = h.tracked.snapshot().await.unwrap();
    assert_eq!(snapshot.generation, 0);
    assert_eq!(tracked_ids(&h.tracked).await, vec!["a1"]);
}

#[tokio::test]
async fn test_recovers_after_fetch_failure() {
    let mut h = harness(Vec::new(), 16, OverflowPolicy::Block);
    h.api.push_error(ApiError::Permission("403 Forbidden".to_string()));
    h.api.push_allocations(vec![running("a1")]);

    assert_eq!(
        h.reconciler.tick(&mut signal::never()).await.unwrap(),
        TickOutcome::FetchFailed
    );
    h.reconciler.tick(&mut signal::never()).await.unwrap();

    assert_eq!(drain(&mut h.streams.added), vec!["a1"]);
}

#[tokio::test]
async fn test_all_allocations_gone() {
    let mut h = harness(vec![running("a1"), running("a2")], 16, OverflowPolicy::Block);
    h.api.push_allocations(Vec::new());

    h.reconciler.tick(&mut signal::never()).await.unwrap();

    assert_eq!(drain(&mut h.streams.removed), vec!["a1", "a2"]);
    assert!(h.tracked.snapshot().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_duplicate_ids_in_listing() {
    let mut h = harness(Vec::new(), 16, OverflowPolicy::Block);
    h.api
        .push_allocations(vec![running("a1"), running("a1"), running("a2")]);

    h.reconciler.tick(&mut signal::never()).await.unwrap();

    assert_eq!(drain(&mut h.streams.added), vec!["a1", "a2"]);
    assert_eq!(tracked_ids(&h.tracked).await, vec!["a1", "a2"]);
}

#[tokio::test]
async fn test_drop_newest_when_sink_full() {
    let mut h = harness(Vec::new(), 1, OverflowPolicy::DropNewest);
    h.api
        .push_allocations(vec![running("a1"), running("a2"), running("a3")]);

    let outcome = h.reconciler.tick(&mut signal::never()).await.unwrap();

    assert_eq!(
        outcome,
        TickOutcome::Applied {
            added: 3,
            removed: 0,
            dropped: 2
        }
    );
    assert_eq!(drain(&mut h.streams.added), vec!["a1"]);
    assert_eq!(tracked_ids(&h.tracked).await, vec!["a1", "a2", "a3"]);
}

#[tokio::test(start_paused = true)]
async fn test_block_with_timeout_drops_after_limit() {
    let mut h = harness(
        Vec::new(),
        1,
        OverflowPolicy::BlockWithTimeout(Duration::from_millis(100)),
    );
    h.api.push_allocations(vec![running("a1"), running("a2")]);

    let outcome = h.reconciler.tick(&mut signal::never()).await.unwrap();

    assert_eq!(
        outcome,
        TickOutcome::Applied {
            added: 2,
            removed: 0,
            dropped: 1
        }
    );
    assert_eq!(drain(&mut h.streams.added), vec!["a1"]);
}

#[tokio::test]
async fn test_shutdown_interrupts_blocked_send() {
    let mut h = harness(Vec::new(), 1, OverflowPolicy::Block);
    h.api.push_allocations(vec![running("a1"), running("a2")]);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let tick = tokio::spawn({
        let reconciler = h.reconciler.clone();
        let mut shutdown = shutdown_rx;
        async move { reconciler.tick(&mut shutdown).await }
    });

    // Wait for the first event to fill the sink.
    while h.streams.added.is_empty() {
        tokio::task::yield_now().await;
    }
    shutdown_tx.send(true).unwrap();

    let outcome = tick.await.unwrap().unwrap();
    assert_eq!(outcome, TickOutcome::Interrupted);

    // The interrupted tick never committed its found set.
    let snapshot = h.tracked.snapshot().await.unwrap();
    assert_eq!(snapshot.generation, 0);
    assert!(snapshot.is_empty());
    assert_eq!(drain(&mut h.streams.added), vec!["a1"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_readers_never_see_partial_update() {
    let set_a: Vec<Allocation> = (0..20).map(|i| running(&format!("a{i}"))).collect();
    let set_b: Vec<Allocation> = (0..30).map(|i| running(&format!("b{i}"))).collect();
    let ids_a: Vec<String> = set_a.iter().map(|a| a.id.to_string()).collect();
    let ids_b: Vec<String> = set_b.iter().map(|a| a.id.to_string()).collect();

    let h = harness(set_a.clone(), 256, OverflowPolicy::DropNewest);
    for i in 0..20 {
        if i % 2 == 0 {
            h.api.push_allocations(set_b.clone());
        } else {
            h.api.push_allocations(set_a.clone());
        }
    }

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let tracked = h.tracked.clone();
            tokio::spawn(async move {
                let mut seen = Vec::new();
                for _ in 0..200 {
                    let ids: Vec<String> = tracked
                        .snapshot()
                        .await
                        .unwrap()
                        .ids()
                        .into_iter()
                        .map(str::to_string)
                        .collect();
                    seen.push(ids);
                    tokio::task::yield_now().await;
                }
                seen
            })
        })
        .collect();

    for _ in 0..20 {
        h.reconciler.tick(&mut signal::never()).await.unwrap();
    }

    for reader in readers {
        for ids in reader.await.unwrap() {
            assert!(ids == ids_a || ids == ids_b, "partial view: {ids:?}");
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_run_loop_ticks_and_stops() {
    let h = harness(Vec::new(), 16, OverflowPolicy::Block);
    h.api.push_allocations(vec![running("a1")]);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let run = tokio::spawn({
        let reconciler = h.reconciler.clone();
        async move { reconciler.run(shutdown_rx).await }
    });

    // The first tick fires one interval after start.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.api.list_calls(), 0);

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(h.api.list_calls(), 1);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.api.list_calls(), 2);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(1), run)
        .await
        .expect("run loop did not stop")
        .unwrap();

    assert_eq!(tracked_ids(&h.tracked).await, vec!["a1"]);
}

proptest! {
    #[test]
    fn prop_live_allocations_keeps_only_live_unique(
        statuses in prop::collection::vec((0usize..6, 0usize..8), 0..40)
    ) {
        let all = [
            ClientStatus::Pending,
            ClientStatus::Running,
            ClientStatus::Restarting,
            ClientStatus::Complete,
            ClientStatus::Failed,
            ClientStatus::Lost,
        ];
        let fetched: Vec<Allocation> = statuses
            .iter()
            .map(|(s, id)| alloc(&format!("a{id}"), all[*s]))
            .collect();

        let live = live_allocations(fetched.clone());

        let mut seen = HashSet::new();
        for a in &live {
            prop_assert!(a.is_live());
            prop_assert!(seen.insert(a.id.clone()));
        }
        for a in fetched.iter().filter(|a| a.is_live()) {
            prop_assert!(seen.contains(&a.id));
        }
    }
}
