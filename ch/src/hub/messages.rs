//! Message types for the Hub task

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::domain::{CorrelationId, Peer, WorkerId};
use crate::error::{HubError, Reply};
use crate::router::{Envelope, Event, SubscriptionId};

/// Where a fire-and-forget message goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Coordinator,
    Worker(WorkerId),
    /// Every live worker except the sender
    AllWorkers,
}

/// Commands processed, in order, by the Hub task
#[derive(Debug)]
pub enum HubCommand {
    /// Envelope arriving from the transport
    Inbound { envelope: Envelope, from: Peer },

    /// A worker process was started (coordinator only)
    WorkerSpawned { worker: WorkerId },

    /// A worker process exited (coordinator only)
    WorkerExited { worker: WorkerId },

    /// Add a local subscriber for a message type
    Subscribe {
        id: SubscriptionId,
        kind: String,
        tx: mpsc::UnboundedSender<Event>,
    },

    /// Remove a local subscriber
    Unsubscribe { id: SubscriptionId, kind: String },

    /// Dispatch to local subscribers only
    Emit { kind: String, payload: Value },

    /// Fire-and-forget send
    Send { target: Target, kind: String, payload: Value },

    /// Correlated call to one peer
    Request {
        target: Peer,
        kind: String,
        payload: Value,
        reply: oneshot::Sender<Reply>,
    },

    /// Correlated call to every live worker; replies with one receiver per worker
    RequestAll {
        kind: String,
        payload: Value,
        reply: oneshot::Sender<Vec<(WorkerId, oneshot::Receiver<Reply>)>>,
    },

    /// Correlated call to one live worker chosen at random
    RequestRandom {
        kind: String,
        payload: Value,
        reply: oneshot::Sender<Reply>,
    },

    /// Answer to a request received earlier (`reply_to: None` = local caller)
    Respond {
        reply_to: Option<Peer>,
        id: CorrelationId,
        result: Result<Value, HubError>,
    },

    /// List live workers
    ListWorkers { reply: oneshot::Sender<Vec<WorkerId>> },

    /// Get current hub metrics
    GetMetrics { reply: oneshot::Sender<HubMetrics> },

    /// Stop the Hub task
    Shutdown,
}

/// Hub metrics for observability
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubMetrics {
    pub live_workers: usize,
    pub pending_requests: usize,
    pub held_locks: usize,
    pub waiting_lockers: usize,
    pub subscriptions: usize,
    pub messages_sent: u64,
    pub messages_received: u64,
    /// Foreign-namespace, stale or malformed envelopes
    pub messages_dropped: u64,
}
