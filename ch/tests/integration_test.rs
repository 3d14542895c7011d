//! Integration tests for clusterhub
//!
//! These run a coordinator and simulated workers over the in-process
//! transport and check end-to-end behavior.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use futures::FutureExt;
use serde_json::json;

use clusterhub::{HubConfig, HubError, HubHandle, HubMetrics, LocalCluster, Peer, WorkerId};

fn within<F: Future>(future: F) -> impl Future<Output = F::Output> {
    async move {
        tokio::time::timeout(Duration::from_secs(5), future)
            .await
            .expect("timed out")
    }
}

/// Poll the hub's metrics until `pred` holds
async fn wait_for(hub: &HubHandle, pred: impl Fn(&HubMetrics) -> bool) -> HubMetrics {
    within(async {
        loop {
            let metrics = hub.metrics().await.expect("metrics");
            if pred(&metrics) {
                return metrics;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
}

fn id(handle: &HubHandle) -> WorkerId {
    handle.worker_id().expect("worker handle")
}

fn serve_sum(hub: &HubHandle) {
    hub.serve("sum", |event| {
        let a = event.payload["a"].as_i64().unwrap_or(0);
        let b = event.payload["b"].as_i64().unwrap_or(0);
        Ok(json!(a + b))
    })
    .expect("serve");
}

// =============================================================================
// Request Tests
// =============================================================================

#[tokio::test]
async fn test_coordinator_requests_worker_sum() {
    let mut cluster = LocalCluster::start(HubConfig::default());
    let worker = cluster.spawn_worker().unwrap();
    serve_sum(&worker);

    let coordinator = cluster.coordinator().clone();
    let result = within(coordinator.request_worker(id(&worker), "sum", json!({"a": 5, "b": 7})).unwrap()).await;
    assert_eq!(result, Ok(json!(12)));
    assert_eq!(coordinator.metrics().await.unwrap().pending_requests, 0);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_worker_requests_coordinator() {
    let mut cluster = LocalCluster::start(HubConfig::default());
    let coordinator = cluster.coordinator().clone();
    coordinator
        .serve("whoami", |event| Ok(json!(event.sender.map(|p| p.to_string()))))
        .unwrap();
    let worker = cluster.spawn_worker().unwrap();

    let result = within(worker.request_coordinator("whoami", json!(null)).unwrap()).await;
    assert_eq!(result, Ok(json!(Peer::Worker(id(&worker)).to_string())));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_coordinator_requests_itself() {
    let cluster = LocalCluster::start(HubConfig::default());
    let coordinator = cluster.coordinator().clone();
    serve_sum(&coordinator);

    let result = within(coordinator.request_coordinator("sum", json!({"a": 1, "b": 2})).unwrap()).await;
    assert_eq!(result, Ok(json!(3)));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_handler_error_travels_to_caller() {
    let mut cluster = LocalCluster::start(HubConfig::default());
    let worker = cluster.spawn_worker().unwrap();
    worker.serve("fail", |_| Err(HubError::Remote("boom".into()))).unwrap();

    let coordinator = cluster.coordinator().clone();
    let result = within(coordinator.request_worker(id(&worker), "fail", json!(null)).unwrap()).await;
    assert_eq!(result, Err(HubError::Remote("boom".into())));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_worker_to_worker_request_rejected() {
    let mut cluster = LocalCluster::start(HubConfig::default());
    let a = cluster.spawn_worker().unwrap();
    let b = cluster.spawn_worker().unwrap();

    assert!(matches!(
        a.request_worker(id(&b), "sum", json!(null)),
        Err(HubError::UnsupportedDirection)
    ));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_request_all_workers() {
    let mut cluster = LocalCluster::start(HubConfig::default());
    let coordinator = cluster.coordinator().clone();

    let empty = within(coordinator.request_all_workers("whoami", json!(null)).unwrap())
        .await
        .unwrap();
    assert!(empty.is_empty());

    let mut expected = HashSet::new();
    for _ in 0..3 {
        let worker = cluster.spawn_worker().unwrap();
        let me = id(&worker);
        worker.serve("whoami", move |_| Ok(json!(me.to_string()))).unwrap();
        expected.insert(me);
    }

    let results = within(coordinator.request_all_workers("whoami", json!(null)).unwrap())
        .await
        .unwrap();
    assert_eq!(results.keys().copied().collect::<HashSet<_>>(), expected);
    for (worker, result) in results {
        assert_eq!(result, Ok(json!(worker.to_string())));
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_request_all_with_dying_worker() {
    let mut cluster = LocalCluster::start(HubConfig::default());
    let coordinator = cluster.coordinator().clone();
    let healthy = cluster.spawn_worker().unwrap();
    serve_sum(&healthy);
    let doomed = cluster.spawn_worker().unwrap();
    let mut never_answered = doomed.on("sum").unwrap();

    let all = coordinator.request_all_workers("sum", json!({"a": 2, "b": 2})).unwrap();
    let held = within(never_answered.recv()).await.expect("request delivered");
    cluster.kill_worker(id(&doomed)).unwrap();

    let results = within(all).await.unwrap();
    assert_eq!(results[&id(&healthy)], Ok(json!(4)));
    assert_eq!(results[&id(&doomed)], Err(HubError::PeerTerminated(id(&doomed))));
    drop(held);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_request_random_worker() {
    let mut cluster = LocalCluster::start(HubConfig::default());
    let coordinator = cluster.coordinator().clone();

    let none = within(coordinator.request_random_worker("whoami", json!(null)).unwrap()).await;
    assert_eq!(none, Err(HubError::NoWorkers));

    let mut ids = Vec::new();
    for _ in 0..2 {
        let worker = cluster.spawn_worker().unwrap();
        let me = id(&worker);
        worker.serve("whoami", move |_| Ok(json!(me.to_string()))).unwrap();
        ids.push(json!(me.to_string()));
    }
    for _ in 0..10 {
        let result = within(coordinator.request_random_worker("whoami", json!(null)).unwrap())
            .await
            .unwrap();
        assert!(ids.contains(&result));
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_worker_death_cancels_pending_requests() {
    let mut cluster = LocalCluster::start(HubConfig::default());
    let coordinator = cluster.coordinator().clone();
    let worker = cluster.spawn_worker().unwrap();
    let w = id(&worker);
    let mut inbox = worker.on("test").unwrap();

    let replies: Vec<_> = (0..4)
        .map(|i| coordinator.request_worker(w, "test", json!({ "n": i })).unwrap())
        .collect();
    let mut held = Vec::new();
    for _ in 0..4 {
        held.push(within(inbox.recv()).await.expect("request delivered"));
    }
    assert_eq!(coordinator.metrics().await.unwrap().pending_requests, 4);

    cluster.kill_worker(w).unwrap();
    for reply in replies {
        assert_eq!(within(reply).await, Err(HubError::PeerTerminated(w)));
    }
    assert_eq!(coordinator.metrics().await.unwrap().pending_requests, 0);

    // Later requests fail at once
    let late = within(coordinator.request_worker(w, "test", json!(null)).unwrap()).await;
    assert_eq!(late, Err(HubError::PeerTerminated(w)));

    cluster.shutdown().await;
}

// =============================================================================
// Messaging Tests
// =============================================================================

#[tokio::test]
async fn test_messages_between_coordinator_and_worker() {
    let mut cluster = LocalCluster::start(HubConfig::default());
    let coordinator = cluster.coordinator().clone();
    let mut at_coordinator = coordinator.on("worker-to-coordinator").unwrap();
    let worker = cluster.spawn_worker().unwrap();
    let mut at_worker = worker.on("coordinator-to-worker").unwrap();

    worker.send_to_coordinator("worker-to-coordinator", json!(2)).unwrap();
    coordinator
        .send_to_worker(id(&worker), "coordinator-to-worker", json!(1))
        .unwrap();

    let event = within(at_coordinator.recv()).await.unwrap();
    assert_eq!(event.payload, json!(2));
    assert_eq!(event.sender, Some(Peer::Worker(id(&worker))));

    let event = within(at_worker.recv()).await.unwrap();
    assert_eq!(event.payload, json!(1));
    assert_eq!(event.sender, Some(Peer::Coordinator));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_broadcast_excludes_sender() {
    let mut cluster = LocalCluster::start(HubConfig::default());
    let coordinator = cluster.coordinator().clone();
    let workers: Vec<HubHandle> = (0..3).map(|_| cluster.spawn_worker().unwrap()).collect();
    let mut news: Vec<_> = workers.iter().map(|w| w.on("news").unwrap()).collect();
    let mut marker = workers[0].on("marker").unwrap();

    workers[0].broadcast_to_workers("news", json!("hello")).unwrap();
    for subscription in news.iter_mut().skip(1) {
        let event = within(subscription.recv()).await.unwrap();
        assert_eq!(event.payload, json!("hello"));
        assert_eq!(event.sender, Some(Peer::Coordinator));
    }

    // Anything relayed to the sender would arrive before this marker
    coordinator.send_to_worker(id(&workers[0]), "marker", json!(null)).unwrap();
    within(marker.recv()).await.unwrap();
    assert!(news[0].try_recv().is_none());

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_foreign_namespace_ignored() {
    let mut cluster = LocalCluster::start(HubConfig::with_namespace("jobs"));
    let coordinator = cluster.coordinator().clone();
    let mut pings = coordinator.on("ping").unwrap();

    let stranger = cluster.spawn_worker_with(HubConfig::with_namespace("billing")).unwrap();
    stranger.send_to_coordinator("ping", json!("foreign")).unwrap();
    wait_for(&coordinator, |m| m.messages_dropped >= 1).await;

    let member = cluster.spawn_worker().unwrap();
    member.send_to_coordinator("ping", json!("member")).unwrap();
    let event = within(pings.recv()).await.unwrap();
    assert_eq!(event.payload, json!("member"));

    cluster.shutdown().await;
}

// =============================================================================
// Lock Tests
// =============================================================================

#[tokio::test]
async fn test_lock_grants_in_arrival_order() {
    let mut cluster = LocalCluster::start(HubConfig::default());
    let coordinator = cluster.coordinator().clone();
    let a = cluster.spawn_worker().unwrap();
    let b = cluster.spawn_worker().unwrap();
    let c = cluster.spawn_worker().unwrap();

    let mut guard_a = within(a.lock("foo")).await.unwrap();

    let b_task = tokio::spawn(async move { b.lock("foo").await });
    wait_for(&coordinator, |m| m.waiting_lockers == 1).await;

    guard_a.unlock().unwrap().await.unwrap();
    let mut guard_b = within(b_task).await.unwrap().unwrap();

    // C arrives after B was granted and must wait for B
    let c_task = tokio::spawn(async move { c.lock("foo").await });
    wait_for(&coordinator, |m| m.waiting_lockers == 1).await;
    assert!(!c_task.is_finished());

    guard_b.unlock().unwrap().await.unwrap();
    let mut guard_c = within(c_task).await.unwrap().unwrap();
    guard_c.unlock().unwrap().await.unwrap();

    let metrics = coordinator.metrics().await.unwrap();
    assert_eq!(metrics.held_locks, 0);
    assert_eq!(metrics.waiting_lockers, 0);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_coordinator_and_worker_contend() {
    let mut cluster = LocalCluster::start(HubConfig::default());
    let coordinator = cluster.coordinator().clone();
    let worker = cluster.spawn_worker().unwrap();

    let mut held = within(coordinator.lock("foo")).await.unwrap();
    let bar = within(worker.with_lock("bar", |_| async { "bar" }.boxed())).await.unwrap();
    assert_eq!(bar, "bar");

    let waiting = tokio::spawn(async move { worker.with_lock("foo", |_| async { "foo" }.boxed()).await });
    wait_for(&coordinator, |m| m.waiting_lockers == 1).await;

    held.unlock().unwrap().await.unwrap();
    assert_eq!(within(waiting).await.unwrap(), Ok("foo"));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_abandoned_coordinator_lock_is_released() {
    let mut cluster = LocalCluster::start(HubConfig::default());
    let coordinator = cluster.coordinator().clone();

    let mut held = within(coordinator.lock("foo")).await.unwrap();
    let gave_up = tokio::time::timeout(Duration::from_millis(20), coordinator.lock("foo")).await;
    assert!(gave_up.is_err());

    held.unlock().unwrap().await.unwrap();
    let mut third = within(coordinator.lock("foo")).await.unwrap();
    third.unlock().unwrap().await.unwrap();
    wait_for(&coordinator, |m| m.held_locks == 0 && m.waiting_lockers == 0).await;

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_abandoned_worker_lock_is_released() {
    let mut cluster = LocalCluster::start(HubConfig::default());
    let coordinator = cluster.coordinator().clone();
    let holder = cluster.spawn_worker().unwrap();
    let quitter = cluster.spawn_worker().unwrap();
    let third = cluster.spawn_worker().unwrap();

    let mut held = within(holder.lock("foo")).await.unwrap();
    let gave_up = tokio::time::timeout(Duration::from_millis(20), quitter.lock("foo")).await;
    assert!(gave_up.is_err());

    held.unlock().unwrap().await.unwrap();
    let mut guard = within(third.lock("foo")).await.unwrap();
    guard.unlock().unwrap().await.unwrap();
    wait_for(&coordinator, |m| m.held_locks == 0 && m.waiting_lockers == 0).await;

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_with_lock_body_unlocks_early() {
    let mut cluster = LocalCluster::start(HubConfig::default());
    let coordinator = cluster.coordinator().clone();
    let worker = cluster.spawn_worker().unwrap();

    let released = within(worker.with_lock("foo", |guard| {
        async move {
            guard.unlock().unwrap().await.unwrap();
            guard.is_released()
        }
        .boxed()
    }))
    .await
    .unwrap();
    assert!(released);

    let mut next = within(coordinator.lock("foo")).await.unwrap();
    next.unlock().unwrap().await.unwrap();

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_lock_holder_death_grants_next() {
    let mut cluster = LocalCluster::start(HubConfig::default());
    let coordinator = cluster.coordinator().clone();
    let holder = cluster.spawn_worker().unwrap();
    let next = cluster.spawn_worker().unwrap();

    let guard = within(holder.lock("foo")).await.unwrap();
    let next_task = tokio::spawn(async move { next.lock("foo").await });
    wait_for(&coordinator, |m| m.waiting_lockers == 1).await;

    cluster.kill_worker(id(&holder)).unwrap();
    let mut granted = within(next_task).await.unwrap().unwrap();

    let metrics = coordinator.metrics().await.unwrap();
    assert_eq!(metrics.held_locks, 1);
    assert_eq!(metrics.waiting_lockers, 0);

    granted.unlock().unwrap().await.unwrap();
    drop(guard);
    wait_for(&coordinator, |m| m.held_locks == 0).await;

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_lock_holder_death_without_waiters_frees_key() {
    let mut cluster = LocalCluster::start(HubConfig::default());
    let coordinator = cluster.coordinator().clone();
    let holder = cluster.spawn_worker().unwrap();

    let _guard = within(holder.lock("foo")).await.unwrap();
    cluster.kill_worker(id(&holder)).unwrap();
    wait_for(&coordinator, |m| m.held_locks == 0).await;

    // The key is free again
    let mut guard = within(coordinator.lock("foo")).await.unwrap();
    guard.unlock().unwrap().await.unwrap();

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_double_unlock_fails() {
    let mut cluster = LocalCluster::start(HubConfig::default());
    let worker = cluster.spawn_worker().unwrap();

    let mut guard = within(worker.lock("foo")).await.unwrap();
    guard.unlock().unwrap().await.unwrap();
    assert_eq!(guard.unlock().err(), Some(HubError::DoubleUnlock { key: "foo".into() }));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_unlock_by_non_holder_reported() {
    let mut cluster = LocalCluster::start(HubConfig::default());
    let worker = cluster.spawn_worker().unwrap();

    let result = within(worker.request_coordinator("_hub_unlock", json!({"key": "foo"})).unwrap()).await;
    assert_eq!(
        result,
        Err(HubError::NotLockHolder {
            key: "foo".into(),
            owner: Peer::Worker(id(&worker)),
        })
    );

    cluster.shutdown().await;
}
