//! In-process transport and cluster harness
//!
//! Each worker gets a pair of unbounded channels to the coordinator. Sends
//! made before the other side listens are buffered, and per-channel order is
//! preserved.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use eyre::{Result, bail};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{Inbox, Transport};
use crate::config::HubConfig;
use crate::domain::{Peer, Role, WorkerId};
use crate::error::HubError;
use crate::hub::{Hub, HubHandle};
use crate::router::Envelope;

struct Link {
    /// Coordinator to worker
    down_tx: mpsc::UnboundedSender<Envelope>,
    down_rx: Option<mpsc::UnboundedReceiver<Envelope>>,
    /// Worker to coordinator
    up_tx: mpsc::UnboundedSender<Envelope>,
    up_rx: Option<mpsc::UnboundedReceiver<Envelope>>,
}

impl Link {
    fn new() -> Self {
        let (down_tx, down_rx) = mpsc::unbounded_channel();
        let (up_tx, up_rx) = mpsc::unbounded_channel();
        Self {
            down_tx,
            down_rx: Some(down_rx),
            up_tx,
            up_rx: Some(up_rx),
        }
    }
}

/// Channels between one coordinator and its workers
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    links: Arc<Mutex<HashMap<WorkerId, Link>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn links(&self) -> MutexGuard<'_, HashMap<WorkerId, Link>> {
        self.links.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Transport for the coordinator's hub
    pub fn coordinator_transport(&self) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            local: Peer::Coordinator,
        }
    }

    /// Create the channel pair for a worker and return the worker's transport
    pub fn connect(&self, worker: WorkerId) -> MemoryTransport {
        debug!(%worker, "MemoryNetwork::connect: called");
        self.links().entry(worker).or_insert_with(Link::new);
        MemoryTransport {
            network: self.clone(),
            local: Peer::Worker(worker),
        }
    }

    /// Tear down a worker's channels; later sends in either direction fail
    pub fn disconnect(&self, worker: WorkerId) -> bool {
        debug!(%worker, "MemoryNetwork::disconnect: called");
        self.links().remove(&worker).is_some()
    }

    pub fn is_connected(&self, worker: WorkerId) -> bool {
        self.links().contains_key(&worker)
    }
}

/// One endpoint of a [`MemoryNetwork`]
#[derive(Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    local: Peer,
}

impl MemoryTransport {
    pub fn local(&self) -> Peer {
        self.local
    }
}

impl Transport for MemoryTransport {
    fn send(&self, to: &Peer, envelope: Envelope) -> Result<()> {
        let links = self.network.links();
        let sent = match (self.local, *to) {
            (Peer::Coordinator, Peer::Worker(worker)) => match links.get(&worker) {
                Some(link) => link.down_tx.send(envelope).is_ok(),
                None => bail!("No channel to {}", worker),
            },
            (Peer::Worker(me), Peer::Coordinator) => match links.get(&me) {
                Some(link) => link.up_tx.send(envelope).is_ok(),
                None => bail!("{} is disconnected", me),
            },
            (from, to) => bail!("No channel from {} to {}", from, to),
        };
        if !sent {
            bail!("Channel to {} is closed", to);
        }
        Ok(())
    }

    fn listen(&self, from: &Peer, inbox: Inbox) -> Result<()> {
        let rx = {
            let mut links = self.network.links();
            let taken = match (self.local, *from) {
                (Peer::Coordinator, Peer::Worker(worker)) => links.get_mut(&worker).map(|l| l.up_rx.take()),
                (Peer::Worker(me), Peer::Coordinator) => links.get_mut(&me).map(|l| l.down_rx.take()),
                (local, from) => bail!("No channel from {} to {}", from, local),
            };
            match taken {
                Some(Some(rx)) => rx,
                Some(None) => bail!("Already listening to {}", from),
                None => bail!("No channel to {}", from),
            }
        };

        debug!(local = %self.local, %from, "MemoryTransport::listen: attaching");
        tokio::spawn(async move {
            let mut rx = rx;
            while let Some(envelope) = rx.recv().await {
                if !inbox.deliver(envelope) {
                    break;
                }
            }
            debug!(from = %inbox.from(), "MemoryTransport: channel closed");
        });
        Ok(())
    }
}

/// A coordinator and simulated workers in one runtime
///
/// Each worker is a separate hub task on its own [`MemoryTransport`]; killing
/// one aborts its task and reports the exit to the coordinator the way a
/// process supervisor would.
pub struct LocalCluster {
    config: HubConfig,
    network: MemoryNetwork,
    coordinator: HubHandle,
    coordinator_task: JoinHandle<()>,
    workers: HashMap<WorkerId, (HubHandle, JoinHandle<()>)>,
    order: Vec<WorkerId>,
}

impl LocalCluster {
    /// Start the coordinator hub; must be called inside a tokio runtime
    pub fn start(config: HubConfig) -> Self {
        info!(namespace = %config.namespace, "Starting local cluster");
        let network = MemoryNetwork::new();
        let hub = Hub::new(config.clone(), Role::Coordinator, network.coordinator_transport());
        let coordinator = hub.handle();
        let coordinator_task = tokio::spawn(hub.run());
        Self {
            config,
            network,
            coordinator,
            coordinator_task,
            workers: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn coordinator(&self) -> &HubHandle {
        &self.coordinator
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    /// Start a worker hub and announce it to the coordinator
    pub fn spawn_worker(&mut self) -> Result<HubHandle, HubError> {
        self.spawn_worker_with(self.config.clone())
    }

    /// Start a worker hub with its own config (e.g. a different namespace)
    pub fn spawn_worker_with(&mut self, config: HubConfig) -> Result<HubHandle, HubError> {
        let worker = WorkerId::new();
        debug!(%worker, "LocalCluster::spawn_worker: called");
        let hub = Hub::new(config, Role::Worker(worker), self.network.connect(worker));
        let handle = hub.handle();
        let task = tokio::spawn(hub.run());

        self.coordinator.worker_spawned(worker)?;
        self.workers.insert(worker, (handle.clone(), task));
        self.order.push(worker);
        Ok(handle)
    }

    pub fn worker(&self, worker: WorkerId) -> Option<&HubHandle> {
        self.workers.get(&worker).map(|(handle, _)| handle)
    }

    /// Running workers in spawn order
    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.order.clone()
    }

    /// Kill a worker; returns false if it was not running
    ///
    /// The coordinator learns of the exit before any command issued after
    /// this call returns.
    pub fn kill_worker(&mut self, worker: WorkerId) -> Result<bool, HubError> {
        let Some((_, task)) = self.workers.remove(&worker) else {
            return Ok(false);
        };
        info!(%worker, "Killing worker");
        self.order.retain(|w| *w != worker);

        self.coordinator.worker_exited(worker)?;
        task.abort();
        self.network.disconnect(worker);
        Ok(true)
    }

    /// Stop every worker, then the coordinator
    pub async fn shutdown(mut self) {
        info!(workers = self.workers.len(), "Stopping local cluster");
        for (worker, (handle, task)) in self.workers.drain() {
            let _ = handle.shutdown();
            let _ = task.await;
            let _ = self.coordinator.worker_exited(worker);
        }
        let _ = self.coordinator.shutdown();
        let _ = self.coordinator_task.await;
    }
}
