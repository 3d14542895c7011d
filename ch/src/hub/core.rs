//! Main Hub task implementation

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::handle::HubHandle;
use super::messages::{HubCommand, HubMetrics, Target};
use crate::config::HubConfig;
use crate::correlator::{Continuation, Correlator, Responder};
use crate::domain::{CorrelationId, Peer, Role, WorkerId};
use crate::error::HubError;
use crate::locks::{LockManager, Waiter};
use crate::registry::WorkerRegistry;
use crate::router::{
    BROADCAST_KIND, BroadcastPayload, Envelope, Event, LOCK_KIND, LockPayload, REQUEST_KIND, RESPONSE_KIND,
    RequestPayload, ResponsePayload, Router, UNLOCK_KIND, encode, is_internal_kind,
};
use crate::transport::{Inbox, Transport};

/// The coordination engine for one process
///
/// Owns the router, registry, correlator and lock manager. All of them are
/// touched only from the task running [`Hub::run`], one command at a time.
pub struct Hub {
    role: Role,
    transport: Box<dyn Transport>,
    tx: mpsc::UnboundedSender<HubCommand>,
    rx: mpsc::UnboundedReceiver<HubCommand>,
    router: Router,
    registry: WorkerRegistry,
    correlator: Correlator,
    locks: LockManager,
    metrics: HubMetrics,
}

impl Hub {
    /// Create a new Hub for the given role
    pub fn new(config: HubConfig, role: Role, transport: impl Transport) -> Self {
        debug!(%role, namespace = %config.namespace, "Hub::new: called");
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            role,
            transport: Box::new(transport),
            tx,
            rx,
            router: Router::new(config.namespace),
            registry: WorkerRegistry::new(),
            correlator: Correlator::new(),
            locks: LockManager::new(),
            metrics: HubMetrics::default(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Get a sender for raw commands
    pub fn sender(&self) -> mpsc::UnboundedSender<HubCommand> {
        self.tx.clone()
    }

    /// Create a handle for application code
    pub fn handle(&self) -> HubHandle {
        HubHandle::new(self.tx.clone(), self.role)
    }

    /// Run the Hub task
    ///
    /// This consumes the Hub and runs until shutdown is requested.
    pub async fn run(mut self) {
        info!(role = %self.role, namespace = %self.router.namespace(), "Hub started");
        self.attach_coordinator_channel();

        while let Some(cmd) = self.rx.recv().await {
            if !self.handle_command(cmd) {
                info!(role = %self.role, "Hub shutting down");
                break;
            }
        }

        info!(
            role = %self.role,
            pending_requests = self.correlator.len(),
            "Hub stopped"
        );
    }

    /// Workers listen on their single channel to the coordinator
    fn attach_coordinator_channel(&mut self) {
        if self.role.is_worker() {
            let inbox = Inbox::new(Peer::Coordinator, self.tx.clone());
            if let Err(e) = self.transport.listen(&Peer::Coordinator, inbox) {
                warn!("Failed to attach coordinator channel: {}", e);
            }
        }
    }

    /// Process one command; returns false on shutdown
    fn handle_command(&mut self, cmd: HubCommand) -> bool {
        match cmd {
            HubCommand::Inbound { envelope, from } => self.handle_inbound(envelope, from),

            HubCommand::WorkerSpawned { worker } => {
                if self.role.is_worker() {
                    warn!(%worker, "Ignoring worker spawn event on a worker");
                } else {
                    let inbox = Inbox::new(Peer::Worker(worker), self.tx.clone());
                    self.registry.on_spawned(worker, self.transport.as_ref(), inbox);
                }
            }

            HubCommand::WorkerExited { worker } => {
                self.registry
                    .on_terminated(worker, &mut self.correlator, &mut self.locks);
            }

            HubCommand::Subscribe { id, kind, tx } => {
                self.router.subscribers_mut().subscribe(id, &kind, tx);
            }

            HubCommand::Unsubscribe { id, kind } => {
                self.router.subscribers_mut().unsubscribe(id, &kind);
            }

            HubCommand::Emit { kind, payload } => {
                self.router.publish_local(Event::message(kind, payload, None));
            }

            HubCommand::Send { target, kind, payload } => self.handle_send(target, kind, payload),

            HubCommand::Request {
                target,
                kind,
                payload,
                reply,
            } => self.call(target, kind, payload, Continuation::new(reply)),

            HubCommand::RequestAll { kind, payload, reply } => self.call_all_workers(kind, payload, reply),

            HubCommand::RequestRandom { kind, payload, reply } => self.call_random_worker(kind, payload, reply),

            HubCommand::Respond { reply_to, id, result } => self.handle_respond(reply_to, id, result),

            HubCommand::ListWorkers { reply } => {
                let _ = reply.send(self.registry.live().to_vec());
            }

            HubCommand::GetMetrics { reply } => {
                let _ = reply.send(self.snapshot_metrics());
            }

            HubCommand::Shutdown => return false,
        }
        true
    }

    fn transmit(&mut self, to: &Peer, envelope: Envelope) -> eyre::Result<()> {
        self.transport.send(to, envelope)?;
        self.metrics.messages_sent += 1;
        Ok(())
    }

    fn handle_inbound(&mut self, envelope: Envelope, from: Peer) {
        if !self.router.accepts(&envelope) {
            self.metrics.messages_dropped += 1;
            return;
        }
        if let Peer::Worker(worker) = from
            && !self.registry.is_live(worker)
        {
            debug!(%worker, kind = %envelope.kind, "Dropping envelope from terminated worker");
            self.metrics.messages_dropped += 1;
            return;
        }
        self.metrics.messages_received += 1;

        match envelope.kind.as_str() {
            REQUEST_KIND => match envelope.decode::<RequestPayload>() {
                Ok(request) => self.dispatch_request(request, Some(from)),
                Err(e) => self.drop_malformed(&from, e),
            },
            RESPONSE_KIND => match envelope.decode::<ResponsePayload>() {
                Ok(response) => {
                    self.correlator.resolve(&response.id, response.result);
                    self.release_abandoned_grants();
                }
                Err(e) => self.drop_malformed(&from, e),
            },
            BROADCAST_KIND => {
                if self.role.is_worker() {
                    warn!(%from, "Ignoring broadcast relay request on a worker");
                    self.metrics.messages_dropped += 1;
                    return;
                }
                match envelope.decode::<BroadcastPayload>() {
                    Ok(broadcast) => self.relay_broadcast(broadcast),
                    Err(e) => self.drop_malformed(&from, e),
                }
            }
            _ => {
                self.router
                    .publish_local(Event::message(envelope.kind, envelope.payload, Some(from)));
            }
        }
    }

    fn drop_malformed(&mut self, from: &Peer, error: HubError) {
        warn!(%from, "Dropping malformed envelope: {}", error);
        self.metrics.messages_dropped += 1;
    }

    fn handle_send(&mut self, target: Target, kind: String, payload: Value) {
        debug!(?target, %kind, "Hub::handle_send: called");
        if is_internal_kind(&kind) {
            warn!(%kind, "Refusing to send a reserved message type");
            return;
        }

        match target {
            Target::Coordinator => {
                if self.role.is_coordinator() {
                    self.router.publish_local(Event::message(kind, payload, None));
                } else {
                    let envelope = self.router.wrap(&kind, payload);
                    if let Err(e) = self.transmit(&Peer::Coordinator, envelope) {
                        warn!(%kind, "Failed to send to coordinator: {}", e);
                    }
                }
            }
            Target::Worker(worker) => {
                if self.role.is_worker() {
                    warn!(%worker, %kind, "Workers cannot message workers directly");
                    return;
                }
                if !self.registry.is_live(worker) {
                    debug!(%worker, %kind, "Dropping message for worker that is not live");
                    return;
                }
                let envelope = self.router.wrap(&kind, payload);
                if let Err(e) = self.transmit(&Peer::Worker(worker), envelope) {
                    warn!(%worker, %kind, "Failed to send to worker: {}", e);
                }
            }
            Target::AllWorkers => match self.role {
                Role::Coordinator => {
                    for worker in self.registry.live().to_vec() {
                        let envelope = self.router.wrap(&kind, payload.clone());
                        if let Err(e) = self.transmit(&Peer::Worker(worker), envelope) {
                            warn!(%worker, %kind, "Failed to broadcast to worker: {}", e);
                        }
                    }
                }
                Role::Worker(origin) => {
                    let relay = BroadcastPayload {
                        kind: kind.clone(),
                        data: payload,
                        origin,
                    };
                    let envelope = self.router.wrap(BROADCAST_KIND, encode(&relay));
                    if let Err(e) = self.transmit(&Peer::Coordinator, envelope) {
                        warn!(%kind, "Failed to send broadcast to coordinator: {}", e);
                    }
                }
            },
        }
    }

    /// Re-send a worker's broadcast to every other live worker
    fn relay_broadcast(&mut self, broadcast: BroadcastPayload) {
        debug!(origin = %broadcast.origin, kind = %broadcast.kind, "Hub::relay_broadcast: called");
        if is_internal_kind(&broadcast.kind) {
            warn!(origin = %broadcast.origin, kind = %broadcast.kind, "Refusing to relay a reserved message type");
            self.metrics.messages_dropped += 1;
            return;
        }
        let targets: Vec<WorkerId> = self
            .registry
            .live()
            .iter()
            .copied()
            .filter(|w| *w != broadcast.origin)
            .collect();

        for worker in targets {
            let envelope = self.router.wrap(&broadcast.kind, broadcast.data.clone());
            if let Err(e) = self.transmit(&Peer::Worker(worker), envelope) {
                warn!(%worker, kind = %broadcast.kind, "Failed to relay broadcast: {}", e);
            }
        }
    }

    /// Issue a correlated request
    fn call(&mut self, target: Peer, kind: String, payload: Value, mut continuation: Continuation) {
        debug!(%target, %kind, "Hub::call: called");
        if self.role.is_worker() && !target.is_coordinator() {
            continuation.fire(Err(HubError::UnsupportedDirection));
            return;
        }
        if let Peer::Worker(worker) = target
            && !self.registry.is_live(worker)
        {
            debug!(%worker, %kind, "Request target is not live");
            continuation.fire(Err(HubError::PeerTerminated(worker)));
            return;
        }

        let id = match lock_key(&kind, &payload) {
            Some(key) => self.correlator.issue_lock(target, key, continuation),
            None => self.correlator.issue(target, continuation),
        };
        let request = RequestPayload {
            kind,
            data: payload,
            id: id.clone(),
        };

        if target == self.role.as_peer() {
            // Coordinator calling itself: no transport round-trip
            self.dispatch_request(request, None);
            return;
        }

        let envelope = self.router.wrap(REQUEST_KIND, encode(&request));
        if let Err(e) = self.transmit(&target, envelope) {
            warn!(%target, %id, "Failed to send request: {}", e);
            self.correlator.resolve(&id, Err(HubError::Transport(e.to_string())));
        }
    }

    /// Release locks granted to callers that stopped waiting for them
    fn release_abandoned_grants(&mut self) {
        for key in self.correlator.take_abandoned_grants() {
            debug!(%key, "Hub::release_abandoned_grants: releasing");
            let (reply, _) = oneshot::channel();
            let payload = encode(&LockPayload { key });
            self.call(Peer::Coordinator, UNLOCK_KIND.to_string(), payload, Continuation::new(reply));
        }
    }

    fn call_all_workers(
        &mut self,
        kind: String,
        payload: Value,
        reply: oneshot::Sender<Vec<(WorkerId, oneshot::Receiver<crate::error::Reply>)>>,
    ) {
        let workers = if self.role.is_coordinator() {
            self.registry.live().to_vec()
        } else {
            Vec::new()
        };
        debug!(%kind, count = workers.len(), "Hub::call_all_workers: called");

        let mut waits = Vec::with_capacity(workers.len());
        for worker in workers {
            let (tx, rx) = oneshot::channel();
            self.call(Peer::Worker(worker), kind.clone(), payload.clone(), Continuation::new(tx));
            waits.push((worker, rx));
        }
        let _ = reply.send(waits);
    }

    fn call_random_worker(&mut self, kind: String, payload: Value, reply: oneshot::Sender<crate::error::Reply>) {
        use rand::seq::IndexedRandom;

        let chosen = if self.role.is_coordinator() {
            self.registry.live().choose(&mut rand::rng()).copied()
        } else {
            None
        };
        match chosen {
            Some(worker) => {
                debug!(%worker, %kind, "Hub::call_random_worker: chose worker");
                self.call(Peer::Worker(worker), kind, payload, Continuation::new(reply));
            }
            None => {
                debug!(%kind, "Hub::call_random_worker: no workers");
                let _ = reply.send(Err(HubError::NoWorkers));
            }
        }
    }

    /// Hand a request to the lock manager or to local subscribers
    fn dispatch_request(&mut self, request: RequestPayload, sender: Option<Peer>) {
        debug!(id = %request.id, kind = %request.kind, ?sender, "Hub::dispatch_request: called");
        let responder = Responder::new(request.id, sender, self.tx.clone());

        if self.role.is_coordinator() {
            match request.kind.as_str() {
                LOCK_KIND => return self.handle_lock(request.data, sender, responder),
                UNLOCK_KIND => return self.handle_unlock(request.data, sender, responder),
                _ => {}
            }
        }

        let kind = request.kind.clone();
        let delivered = self
            .router
            .publish_local(Event::request(request.kind, request.data, sender, responder));
        if delivered == 0 {
            warn!(%kind, "Request has no subscribers; caller keeps waiting");
        }
    }

    fn handle_lock(&mut self, data: Value, sender: Option<Peer>, responder: Responder) {
        let owner = sender.unwrap_or(Peer::Coordinator);
        match serde_json::from_value::<LockPayload>(data) {
            Ok(LockPayload { key }) => {
                self.locks.acquire(&key, Waiter::new(owner, responder));
            }
            Err(e) => {
                responder.respond(Err(HubError::MalformedPayload {
                    kind: LOCK_KIND.to_string(),
                    reason: e.to_string(),
                }));
            }
        }
    }

    fn handle_unlock(&mut self, data: Value, sender: Option<Peer>, responder: Responder) {
        let owner = sender.unwrap_or(Peer::Coordinator);
        let result = match serde_json::from_value::<LockPayload>(data) {
            Ok(LockPayload { key }) => self.locks.release(&key, owner).map(|_| Value::Null),
            Err(e) => Err(HubError::MalformedPayload {
                kind: UNLOCK_KIND.to_string(),
                reason: e.to_string(),
            }),
        };
        if let Err(e) = &result {
            warn!(%owner, "Unlock rejected: {}", e);
        }
        responder.respond(result);
    }

    fn handle_respond(&mut self, reply_to: Option<Peer>, id: CorrelationId, result: Result<Value, HubError>) {
        match reply_to {
            None => {
                self.correlator.resolve(&id, result);
                self.release_abandoned_grants();
            }
            Some(peer) => {
                if let Peer::Worker(worker) = peer
                    && !self.registry.is_live(worker)
                {
                    debug!(%worker, %id, "Dropping response for terminated worker");
                    return;
                }
                let envelope = self.router.wrap(RESPONSE_KIND, encode(&ResponsePayload { id, result }));
                if let Err(e) = self.transmit(&peer, envelope) {
                    warn!(%peer, "Failed to send response: {}", e);
                }
            }
        }
    }

    fn snapshot_metrics(&self) -> HubMetrics {
        HubMetrics {
            live_workers: self.registry.len(),
            pending_requests: self.correlator.len(),
            held_locks: self.locks.held_count(),
            waiting_lockers: self.locks.waiting_count(),
            subscriptions: self.router.subscribers().count(),
            ..self.metrics.clone()
        }
    }
}

/// Key of a lock acquisition request, if `kind` is one
fn lock_key(kind: &str, payload: &Value) -> Option<String> {
    if kind != LOCK_KIND {
        return None;
    }
    serde_json::from_value::<LockPayload>(payload.clone()).ok().map(|p| p.key)
}
