//! Request correlator
//!
//! Turns "send and wait" into a tracked pending entry keyed by a fresh
//! correlation id, and matches inbound responses back to the waiting caller.
//!
//! ```text
//! caller ──Request──▶ issue(id) ──_hub_request{type,data,id}──▶ remote
//!                                                                │
//!                                                  subscribers of `type`
//!                                                                │
//! caller ◀──fire(result)── resolve(id) ◀──_hub_response{id,result}─┘
//! ```
//!
//! Requests aimed at a worker are also indexed under that worker so its death
//! can cancel all of them in one sweep.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::domain::{CorrelationId, Peer, WorkerId};
use crate::error::{HubError, Reply};
use crate::hub::HubCommand;

/// Single-use completion slot for a pending request
pub struct Continuation {
    tx: Option<oneshot::Sender<Reply>>,
    abandoned: bool,
}

impl Continuation {
    pub fn new(tx: oneshot::Sender<Reply>) -> Self {
        Self {
            tx: Some(tx),
            abandoned: false,
        }
    }

    /// Deliver the result; returns false if this continuation already fired
    pub fn fire(&mut self, reply: Reply) -> bool {
        match self.tx.take() {
            Some(tx) => {
                if tx.send(reply).is_err() {
                    debug!("Continuation::fire: caller no longer waiting");
                    self.abandoned = true;
                }
                true
            }
            None => {
                warn!("Continuation::fire: already fired");
                false
            }
        }
    }

    pub fn is_consumed(&self) -> bool {
        self.tx.is_none()
    }

    /// Fired, but the caller had stopped waiting so nobody saw the result
    pub fn was_abandoned(&self) -> bool {
        self.abandoned
    }
}

/// A call awaiting its response
pub struct PendingRequest {
    pub id: CorrelationId,
    pub target: Peer,
    /// Key of a lock acquisition; its grant must be released if nobody takes it
    pub lock_key: Option<String>,
    continuation: Continuation,
}

/// Pending-request table for one hub
#[derive(Default)]
pub struct Correlator {
    pending: HashMap<CorrelationId, PendingRequest>,
    by_worker: HashMap<WorkerId, HashSet<CorrelationId>>,
    /// Locks granted to callers that had already given up
    abandoned_grants: Vec<String>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new pending request and return its correlation id
    pub fn issue(&mut self, target: Peer, continuation: Continuation) -> CorrelationId {
        self.issue_tracked(target, None, continuation)
    }

    /// Record a lock acquisition for `key`
    pub fn issue_lock(&mut self, target: Peer, key: String, continuation: Continuation) -> CorrelationId {
        self.issue_tracked(target, Some(key), continuation)
    }

    fn issue_tracked(&mut self, target: Peer, lock_key: Option<String>, continuation: Continuation) -> CorrelationId {
        let mut id = CorrelationId::generate();
        while self.pending.contains_key(&id) {
            id = CorrelationId::generate();
        }
        debug!(%id, %target, "Correlator::issue: called");

        if let Peer::Worker(worker) = target {
            self.by_worker.entry(worker).or_default().insert(id.clone());
        }
        self.pending.insert(
            id.clone(),
            PendingRequest {
                id: id.clone(),
                target,
                lock_key,
                continuation,
            },
        );
        id
    }

    /// Complete a pending request; unknown ids are ignored
    pub fn resolve(&mut self, id: &CorrelationId, reply: Reply) -> bool {
        let Some(mut pending) = self.pending.remove(id) else {
            debug!(%id, "Correlator::resolve: unknown or already resolved");
            return false;
        };
        debug!(%id, target = %pending.target, ok = reply.is_ok(), "Correlator::resolve: called");

        if let Peer::Worker(worker) = pending.target
            && let Some(ids) = self.by_worker.get_mut(&worker)
        {
            ids.remove(id);
            if ids.is_empty() {
                self.by_worker.remove(&worker);
            }
        }

        let granted = reply.is_ok();
        let fired = pending.continuation.fire(reply);
        if granted
            && pending.continuation.was_abandoned()
            && let Some(key) = pending.lock_key
        {
            warn!(%id, %key, "Lock granted to a caller that gave up; releasing");
            self.abandoned_grants.push(key);
        }
        fired
    }

    /// Drain the keys of locks granted to callers that stopped waiting
    pub fn take_abandoned_grants(&mut self) -> Vec<String> {
        std::mem::take(&mut self.abandoned_grants)
    }

    /// Fail every request aimed at a dead worker with `PeerTerminated`
    pub fn cancel_worker(&mut self, worker: WorkerId) -> usize {
        let Some(ids) = self.by_worker.remove(&worker) else {
            return 0;
        };
        debug!(%worker, count = ids.len(), "Correlator::cancel_worker: called");

        let mut cancelled = 0;
        for id in ids {
            if let Some(mut pending) = self.pending.remove(&id)
                && pending.continuation.fire(Err(HubError::PeerTerminated(worker)))
            {
                cancelled += 1;
            }
        }
        cancelled
    }

    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.pending.contains_key(id)
    }

    /// Number of pending requests aimed at a worker
    pub fn pending_for(&self, worker: WorkerId) -> usize {
        self.by_worker.get(&worker).map(|ids| ids.len()).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// One-shot answer capability handed to request subscribers
///
/// Cloned into every subscriber that receives the request. All clones share a
/// consumed flag, so the first `respond` wins and later ones are no-ops.
#[derive(Clone)]
pub struct Responder {
    inner: Arc<ResponderInner>,
}

struct ResponderInner {
    id: CorrelationId,
    reply_to: Option<Peer>,
    tx: mpsc::UnboundedSender<HubCommand>,
    responded: AtomicBool,
}

impl Responder {
    pub(crate) fn new(id: CorrelationId, reply_to: Option<Peer>, tx: mpsc::UnboundedSender<HubCommand>) -> Self {
        Self {
            inner: Arc::new(ResponderInner {
                id,
                reply_to,
                tx,
                responded: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &CorrelationId {
        &self.inner.id
    }

    /// Where the answer goes (`None` = this process)
    pub fn reply_to(&self) -> Option<Peer> {
        self.inner.reply_to
    }

    pub fn has_responded(&self) -> bool {
        self.inner.responded.load(Ordering::Acquire)
    }

    /// Send the answer back to the caller; false if already answered or the hub is gone
    pub fn respond(&self, result: Result<Value, HubError>) -> bool {
        if self.inner.responded.swap(true, Ordering::AcqRel) {
            debug!(id = %self.inner.id, "Responder::respond: already responded");
            return false;
        }
        debug!(id = %self.inner.id, reply_to = ?self.inner.reply_to, ok = result.is_ok(), "Responder::respond: called");
        self.inner
            .tx
            .send(HubCommand::Respond {
                reply_to: self.inner.reply_to,
                id: self.inner.id.clone(),
                result,
            })
            .is_ok()
    }

    pub fn ok(&self, value: Value) -> bool {
        self.respond(Ok(value))
    }

    /// Answer with an application-level failure
    pub fn fail(&self, message: impl Into<String>) -> bool {
        self.respond(Err(HubError::Remote(message.into())))
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("id", &self.inner.id)
            .field("reply_to", &self.inner.reply_to)
            .field("responded", &self.has_responded())
            .finish()
    }
}
