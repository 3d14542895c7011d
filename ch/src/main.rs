//! ch - clusterhub demo
//!
//! Runs the coordination scenarios on a coordinator and simulated workers
//! inside one process.

use std::time::Duration;

use clap::Parser;
use colored::*;
use eyre::{Context, Result, eyre};
use futures::FutureExt;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::info;

use clusterhub::cli::{Cli, Command};
use clusterhub::config::HubConfig;
use clusterhub::{Event, HubError, HubHandle, LocalCluster, Subscription, WorkerId};

fn setup_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Invalid log level")?;

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    info!("Logging initialized (level: {})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = HubConfig::load(cli.config.as_ref()).context("Failed to load configuration")?;
    if let Some(namespace) = cli.namespace {
        config.namespace = namespace;
    }

    let level = cli
        .log_level
        .clone()
        .or_else(|| config.log_level.clone())
        .unwrap_or_else(|| "info".to_string());
    setup_logging(&level).context("Failed to setup logging")?;

    info!(namespace = %config.namespace, "ch starting");

    match cli.command {
        Command::Broadcast { workers } => cmd_broadcast(config, workers).await,
        Command::Requests { a, b } => cmd_requests(config, a, b).await,
        Command::Locks { hold_ms } => cmd_locks(config, Duration::from_millis(hold_ms)).await,
        Command::DieRequest { pending } => cmd_die_request(config, pending).await,
        Command::DieLock { workers } => cmd_die_lock(config, workers).await,
    }
}

async fn next_event(subscription: &mut Subscription) -> Result<Event> {
    subscription
        .recv()
        .await
        .ok_or_else(|| eyre!("Hub stopped while waiting for '{}'", subscription.kind()))
}

fn label(handle: &HubHandle) -> String {
    match handle.worker_id() {
        Some(id) => format!("worker {}", id.short()),
        None => "coordinator".to_string(),
    }
}

/// Plain messages in every direction, plus worker broadcasts
async fn cmd_broadcast(config: HubConfig, workers: usize) -> Result<()> {
    let mut cluster = LocalCluster::start(config);
    let coordinator = cluster.coordinator().clone();
    let mut to_self = coordinator.on("coordinator-to-coordinator")?;
    let mut from_workers = coordinator.on("worker-to-coordinator")?;

    let mut handles = Vec::new();
    let mut subscriptions = Vec::new();
    for _ in 0..workers {
        let worker = cluster.spawn_worker()?;
        subscriptions.push((worker.on("coordinator-to-worker")?, worker.on("worker-to-worker")?));
        handles.push(worker);
    }

    coordinator.send_to_coordinator("coordinator-to-coordinator", json!(1))?;
    for worker in &handles {
        worker.send_to_coordinator("worker-to-coordinator", json!(2))?;
        worker.broadcast_to_workers("worker-to-worker", json!(label(worker)))?;
    }
    for id in cluster.worker_ids() {
        coordinator.send_to_worker(id, "coordinator-to-worker", Value::Null)?;
    }

    next_event(&mut to_self).await?;
    println!("{} coordinator-to-coordinator received", "✓".green());
    for _ in 0..workers {
        let event = next_event(&mut from_workers).await?;
        let sender = event.sender.map(|p| p.to_string()).unwrap_or_default();
        println!("{} worker-to-coordinator received from {}", "✓".green(), sender.cyan());
    }
    for (worker, (direct, relayed)) in handles.iter().zip(subscriptions.iter_mut()) {
        next_event(direct).await?;
        println!("{} coordinator-to-worker received in {}", "✓".green(), label(worker).cyan());
        for _ in 1..workers {
            let event = next_event(relayed).await?;
            println!(
                "{} worker-to-worker from {} received in {}",
                "✓".green(),
                event.payload.as_str().unwrap_or("?").yellow(),
                label(worker).cyan()
            );
        }
    }

    drop(subscriptions);
    cluster.shutdown().await;
    Ok(())
}

fn arithmetic(event: &Event, op: fn(i64, i64) -> i64) -> Result<Value, HubError> {
    match (event.payload["a"].as_i64(), event.payload["b"].as_i64()) {
        (Some(a), Some(b)) => Ok(json!(op(a, b))),
        _ => Err(HubError::Remote(format!("'{}' needs integer a and b", event.kind))),
    }
}

/// Correlated requests: coordinator to itself, coordinator to worker, worker to coordinator
async fn cmd_requests(config: HubConfig, a: i64, b: i64) -> Result<()> {
    let mut cluster = LocalCluster::start(config);
    let coordinator = cluster.coordinator().clone();
    coordinator.serve("sum", |event| arithmetic(event, |a, b| a + b))?;

    let worker = cluster.spawn_worker()?;
    worker.serve("mult", |event| arithmetic(event, |a, b| a * b))?;
    let worker_id = worker.worker_id().ok_or_else(|| eyre!("Spawned hub is not a worker"))?;

    let sum = coordinator.request_coordinator("sum", json!({"a": a, "b": b}))?;
    let mult = coordinator.request_worker(worker_id, "mult", json!({"a": a, "b": b}))?;
    let from_worker = worker.request_coordinator("sum", json!({"a": 1, "b": 2}))?;

    println!("Sum in coordinator: {}", sum.await?.to_string().green());
    println!("Mult in coordinator: {}", mult.await?.to_string().green());
    println!("Sum in worker: {}", from_worker.await?.to_string().green());

    let metrics = coordinator.metrics().await?;
    println!("Pending requests: {}", metrics.pending_requests);
    cluster.shutdown().await;
    Ok(())
}

/// "foo" contended by the coordinator and two requests of one worker; "bar" is free
async fn cmd_locks(config: HubConfig, hold: Duration) -> Result<()> {
    let mut cluster = LocalCluster::start(config);
    let coordinator = cluster.coordinator().clone();
    let worker = cluster.spawn_worker()?;

    let mut held = coordinator.lock("foo").await?;
    println!("{} foo lock in coordinator", "🔒".yellow());

    let mut tasks = Vec::new();
    {
        let worker = worker.clone();
        tasks.push(tokio::spawn(async move {
            let mut guard = worker.lock("foo").await?;
            println!("{} foo lock in worker 1", "🔒".yellow());
            tokio::time::sleep(hold / 2).await;
            guard.unlock()?.await?;
            Ok::<_, HubError>(())
        }));
    }
    {
        let worker = worker.clone();
        tasks.push(tokio::spawn(async move {
            worker
                .with_lock("bar", |_| {
                    async {
                        println!("{} bar lock in worker", "🔒".yellow());
                    }
                    .boxed()
                })
                .await
        }));
    }

    // Make sure worker 1 queues for "foo" before worker 2
    while coordinator.metrics().await?.waiting_lockers == 0 {
        tokio::task::yield_now().await;
    }
    {
        let worker = worker.clone();
        tasks.push(tokio::spawn(async move {
            worker
                .with_lock("foo", |_| {
                    async {
                        println!("{} foo lock in worker 2", "🔒".yellow());
                    }
                    .boxed()
                })
                .await
        }));
    }

    tokio::time::sleep(hold).await;
    held.unlock()?.await?;
    println!("{} foo unlocked in coordinator", "🔓".green());

    for task in tasks {
        task.await??;
    }

    let metrics = coordinator.metrics().await?;
    println!("Held locks: {}, waiting: {}", metrics.held_locks, metrics.waiting_lockers);
    cluster.shutdown().await;
    Ok(())
}

/// Requests outstanding when their target dies fail with PeerTerminated
async fn cmd_die_request(config: HubConfig, pending: usize) -> Result<()> {
    let mut cluster = LocalCluster::start(config);
    let coordinator = cluster.coordinator().clone();
    let worker = cluster.spawn_worker()?;
    let worker_id = worker.worker_id().ok_or_else(|| eyre!("Spawned hub is not a worker"))?;

    // Requests are received but never answered
    let mut inbox = worker.on("test")?;
    let mut replies = Vec::with_capacity(pending);
    for i in 0..pending {
        replies.push(coordinator.request_worker(worker_id, "test", json!({ "n": i }))?);
    }
    let mut unanswered = Vec::with_capacity(pending);
    for _ in 0..pending {
        unanswered.push(next_event(&mut inbox).await?);
    }
    println!("{} requests pending in {}", pending, label(&worker).cyan());

    cluster.kill_worker(worker_id)?;
    println!("{} {} killed", "✗".red(), label(&worker).cyan());

    for (i, reply) in replies.into_iter().enumerate() {
        match reply.await {
            Ok(value) => println!("request {}: {}", i, value),
            Err(e) => println!("request {}: {}", i, e.to_string().red()),
        }
    }

    let metrics = coordinator.metrics().await?;
    println!("Pending requests: {}", metrics.pending_requests);
    drop(unanswered);
    cluster.shutdown().await;
    Ok(())
}

/// Each holder of "foo" dies while holding it; the next waiter is granted
async fn cmd_die_lock(config: HubConfig, workers: usize) -> Result<()> {
    let mut cluster = LocalCluster::start(config);
    let coordinator = cluster.coordinator().clone();
    let (granted_tx, mut granted_rx) = mpsc::unbounded_channel();

    for _ in 0..workers {
        let worker = cluster.spawn_worker()?;
        let granted_tx = granted_tx.clone();
        tokio::spawn(async move {
            let result = worker.lock("foo").await;
            let _ = granted_tx.send((worker.worker_id(), result));
        });
    }
    drop(granted_tx);

    // Holders are never unlocked, only killed
    let mut guards = Vec::new();
    while let Some((worker, result)) = granted_rx.recv().await {
        let worker: WorkerId = worker.ok_or_else(|| eyre!("Lock taken by a non-worker"))?;
        match result {
            Ok(guard) => {
                println!("{} locked foo in worker {}", "🔒".yellow(), worker.short().cyan());
                guards.push(guard);
                cluster.kill_worker(worker)?;
                println!("{} worker {} exited", "✗".red(), worker.short().cyan());
            }
            Err(e) => println!("worker {}: {}", worker.short(), e.to_string().red()),
        }
    }

    let metrics = coordinator.metrics().await?;
    println!("Held locks: {}, waiting: {}", metrics.held_locks, metrics.waiting_lockers);
    drop(guards);
    cluster.shutdown().await;
    Ok(())
}
