//! HubHandle - Client interface for application code

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use super::lock_guard::LockGuard;
use super::messages::{HubCommand, HubMetrics, Target};
use crate::domain::{Peer, Role, WorkerId};
use crate::error::{HubError, Reply};
use crate::router::{Event, LOCK_KIND, LockPayload, SubscriptionId, UNLOCK_KIND, encode};

static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);

/// Handle for interacting with the Hub task
///
/// Cloneable; every clone talks to the same hub. Sends never block: commands
/// are queued on an unbounded channel and processed in order by the hub.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::UnboundedSender<HubCommand>,
    role: Role,
}

impl HubHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<HubCommand>, role: Role) -> Self {
        debug!(%role, "HubHandle::new: called");
        Self { tx, role }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// This process's worker id (`None` on the coordinator)
    pub fn worker_id(&self) -> Option<WorkerId> {
        match self.role {
            Role::Worker(id) => Some(id),
            Role::Coordinator => None,
        }
    }

    pub fn is_coordinator(&self) -> bool {
        self.role.is_coordinator()
    }

    fn submit(&self, cmd: HubCommand) -> Result<(), HubError> {
        self.tx.send(cmd).map_err(|_| HubError::Closed)
    }

    /// Subscribe to events of one type
    pub fn on(&self, kind: &str) -> Result<Subscription, HubError> {
        let id = SubscriptionId(NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed));
        debug!(%kind, %id, "HubHandle::on: called");
        let (tx, rx) = mpsc::unbounded_channel();
        self.submit(HubCommand::Subscribe {
            id,
            kind: kind.to_string(),
            tx,
        })?;
        Ok(Subscription {
            id,
            kind: kind.to_string(),
            rx,
            hub: self.tx.clone(),
            active: true,
        })
    }

    /// Answer every request of one type with `handler`
    ///
    /// Plain (non-request) events of the type are ignored. The task ends when
    /// the hub stops.
    pub fn serve<F>(&self, kind: &str, handler: F) -> Result<JoinHandle<()>, HubError>
    where
        F: Fn(&Event) -> Result<Value, HubError> + Send + 'static,
    {
        debug!(%kind, "HubHandle::serve: called");
        let mut subscription = self.on(kind)?;
        Ok(tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                if event.is_request() {
                    event.respond(handler(&event));
                } else {
                    debug!(kind = %event.kind, "HubHandle::serve: ignoring plain event");
                }
            }
        }))
    }

    /// Dispatch to subscribers in this process only
    pub fn emit(&self, kind: &str, payload: Value) -> Result<(), HubError> {
        debug!(%kind, "HubHandle::emit: called");
        self.submit(HubCommand::Emit {
            kind: kind.to_string(),
            payload,
        })
    }

    /// Fire-and-forget message to one worker (coordinator only)
    pub fn send_to_worker(&self, worker: WorkerId, kind: &str, payload: Value) -> Result<(), HubError> {
        debug!(%worker, %kind, "HubHandle::send_to_worker: called");
        if self.role.is_worker() {
            return Err(HubError::UnsupportedDirection);
        }
        self.submit(HubCommand::Send {
            target: Target::Worker(worker),
            kind: kind.to_string(),
            payload,
        })
    }

    /// Fire-and-forget message to the coordinator
    pub fn send_to_coordinator(&self, kind: &str, payload: Value) -> Result<(), HubError> {
        debug!(%kind, "HubHandle::send_to_coordinator: called");
        self.submit(HubCommand::Send {
            target: Target::Coordinator,
            kind: kind.to_string(),
            payload,
        })
    }

    /// Fire-and-forget message to every live worker except this one
    pub fn broadcast_to_workers(&self, kind: &str, payload: Value) -> Result<(), HubError> {
        debug!(%kind, "HubHandle::broadcast_to_workers: called");
        self.submit(HubCommand::Send {
            target: Target::AllWorkers,
            kind: kind.to_string(),
            payload,
        })
    }

    /// Issue a correlated request; the send happens now, the answer is awaited later
    pub(crate) fn call(&self, target: Peer, kind: &str, payload: Value) -> Result<PendingReply, HubError> {
        if self.role.is_worker() && !target.is_coordinator() {
            return Err(HubError::UnsupportedDirection);
        }
        let (reply, rx) = oneshot::channel();
        self.submit(HubCommand::Request {
            target,
            kind: kind.to_string(),
            payload,
            reply,
        })?;
        Ok(PendingReply { rx })
    }

    /// Request the coordinator (a coordinator calling itself dispatches locally)
    pub fn request_coordinator(&self, kind: &str, payload: Value) -> Result<PendingReply, HubError> {
        debug!(%kind, "HubHandle::request_coordinator: called");
        self.call(Peer::Coordinator, kind, payload)
    }

    /// Request one worker; fails with `UnsupportedDirection` on a worker
    pub fn request_worker(&self, worker: WorkerId, kind: &str, payload: Value) -> Result<PendingReply, HubError> {
        debug!(%worker, %kind, "HubHandle::request_worker: called");
        self.call(Peer::Worker(worker), kind, payload)
    }

    /// Request one live worker chosen uniformly at random
    pub fn request_random_worker(&self, kind: &str, payload: Value) -> Result<PendingReply, HubError> {
        debug!(%kind, "HubHandle::request_random_worker: called");
        if self.role.is_worker() {
            return Err(HubError::UnsupportedDirection);
        }
        let (reply, rx) = oneshot::channel();
        self.submit(HubCommand::RequestRandom {
            kind: kind.to_string(),
            payload,
            reply,
        })?;
        Ok(PendingReply { rx })
    }

    /// Request every live worker and collect the results by worker id
    ///
    /// The requests are issued now. With no live workers the returned future
    /// completes with an empty map.
    pub fn request_all_workers(
        &self,
        kind: &str,
        payload: Value,
    ) -> Result<BoxFuture<'static, Result<HashMap<WorkerId, Reply>, HubError>>, HubError> {
        debug!(%kind, "HubHandle::request_all_workers: called");
        if self.role.is_worker() {
            return Err(HubError::UnsupportedDirection);
        }
        let (reply, rx) = oneshot::channel();
        self.submit(HubCommand::RequestAll {
            kind: kind.to_string(),
            payload,
            reply,
        })?;

        Ok(async move {
            let waits = rx.await.map_err(|_| HubError::Closed)?;
            let results = join_all(
                waits
                    .into_iter()
                    .map(|(worker, rx)| async move { (worker, rx.await.unwrap_or(Err(HubError::Closed))) }),
            )
            .await;
            Ok(results.into_iter().collect())
        }
        .boxed())
    }

    /// Acquire a cluster-wide lock, waiting behind earlier requesters
    ///
    /// Cancel-safe: if the returned future is dropped before it completes,
    /// a grant that already arrived is released and one still queued is
    /// released by the hub as soon as it is made.
    pub async fn lock(&self, key: &str) -> Result<LockGuard, HubError> {
        debug!(%key, "HubHandle::lock: called");
        let payload = encode(&LockPayload { key: key.to_string() });
        let mut acquiring = Acquiring {
            handle: self,
            key,
            reply: self.call(Peer::Coordinator, LOCK_KIND, payload)?,
            finished: false,
        };
        let result = (&mut acquiring.reply).await;
        acquiring.finished = true;
        result?;
        debug!(%key, "HubHandle::lock: granted");
        Ok(LockGuard::new(self.clone(), key.to_string()))
    }

    /// Run `body` while holding `key`
    ///
    /// `body` gets the guard and may unlock early; otherwise the lock is
    /// released once `body` completes.
    pub async fn with_lock<F, T>(&self, key: &str, body: F) -> Result<T, HubError>
    where
        F: for<'g> FnOnce(&'g mut LockGuard) -> BoxFuture<'g, T>,
    {
        let mut guard = self.lock(key).await?;
        let out = body(&mut guard).await;
        if !guard.is_released() {
            guard.unlock()?.await?;
        }
        Ok(out)
    }

    /// Fire-and-forget release of `key`
    pub(crate) fn release(&self, key: &str) -> Result<(), HubError> {
        let payload = encode(&LockPayload { key: key.to_string() });
        self.call(Peer::Coordinator, UNLOCK_KIND, payload).map(|_| ())
    }

    /// Live workers in spawn order (empty on a worker)
    pub async fn workers(&self) -> Result<Vec<WorkerId>, HubError> {
        let (reply, rx) = oneshot::channel();
        self.submit(HubCommand::ListWorkers { reply })?;
        rx.await.map_err(|_| HubError::Closed)
    }

    pub async fn metrics(&self) -> Result<HubMetrics, HubError> {
        let (reply, rx) = oneshot::channel();
        self.submit(HubCommand::GetMetrics { reply })?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Lifecycle: a worker process was started
    pub fn worker_spawned(&self, worker: WorkerId) -> Result<(), HubError> {
        debug!(%worker, "HubHandle::worker_spawned: called");
        self.submit(HubCommand::WorkerSpawned { worker })
    }

    /// Lifecycle: a worker process exited
    pub fn worker_exited(&self, worker: WorkerId) -> Result<(), HubError> {
        debug!(%worker, "HubHandle::worker_exited: called");
        self.submit(HubCommand::WorkerExited { worker })
    }

    /// Stop the hub task
    pub fn shutdown(&self) -> Result<(), HubError> {
        debug!(role = %self.role, "HubHandle::shutdown: called");
        self.submit(HubCommand::Shutdown)
    }
}

/// A lock request in flight; releases an unobserved grant when dropped
struct Acquiring<'a> {
    handle: &'a HubHandle,
    key: &'a str,
    reply: PendingReply,
    finished: bool,
}

impl Drop for Acquiring<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // After close the hub can no longer deliver, so a grant is either
        // readable here or reported as abandoned on the hub's side.
        self.reply.rx.close();
        if let Ok(Ok(_)) = self.reply.rx.try_recv() {
            debug!(key = %self.key, "Acquiring::drop: releasing unobserved grant");
            if let Err(e) = self.handle.release(self.key) {
                debug!(key = %self.key, "Acquiring::drop: release not sent: {}", e);
            }
        }
    }
}

/// Answer to a correlated request, resolved by the hub
#[must_use = "a request's answer is only observed by awaiting it"]
pub struct PendingReply {
    rx: oneshot::Receiver<Reply>,
}

impl Future for PendingReply {
    type Output = Reply;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(HubError::Closed)))
    }
}

/// A live subscription; dropping it unsubscribes
pub struct Subscription {
    id: SubscriptionId,
    kind: String,
    rx: mpsc::UnboundedReceiver<Event>,
    hub: mpsc::UnboundedSender<HubCommand>,
    active: bool,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Wait for the next event; `None` once the hub has stopped
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if self.active {
            self.active = false;
            let _ = self.hub.send(HubCommand::Unsubscribe {
                id: self.id,
                kind: self.kind.clone(),
            });
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}
