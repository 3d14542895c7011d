//! Worker registry
//!
//! Tracks which workers are live and which identities have ever been seen.
//! A worker's inbound handler is attached exactly once; its death cancels
//! everything the correlator and lock manager still hold for it.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use crate::correlator::Correlator;
use crate::domain::{Peer, WorkerId};
use crate::locks::{LockManager, ReleasedLocks};
use crate::transport::{Inbox, Transport};

/// Cleanup performed for one terminated worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Termination {
    pub worker: WorkerId,
    pub cancelled_requests: usize,
    pub locks: ReleasedLocks,
}

#[derive(Default)]
pub struct WorkerRegistry {
    /// Every identity whose handler was attached (never shrinks)
    attached: HashSet<WorkerId>,
    /// Live workers in spawn order
    live: Vec<WorkerId>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a spawned worker and attach its inbound handler
    ///
    /// Returns false (and does nothing) if the identity was seen before.
    pub fn on_spawned(&mut self, worker: WorkerId, transport: &dyn Transport, inbox: Inbox) -> bool {
        if !self.attached.insert(worker) {
            debug!(%worker, "WorkerRegistry::on_spawned: already attached");
            return false;
        }
        info!(%worker, "Worker spawned");
        self.live.push(worker);

        if let Err(e) = transport.listen(&Peer::Worker(worker), inbox) {
            warn!(%worker, "Failed to attach worker channel: {}", e);
        }
        true
    }

    /// Handle a worker's death: cancel its requests and release its locks
    ///
    /// Both sweeps finish before this returns. A second call for the same
    /// worker is a no-op and returns `None`.
    pub fn on_terminated(
        &mut self,
        worker: WorkerId,
        correlator: &mut Correlator,
        locks: &mut LockManager,
    ) -> Option<Termination> {
        // An exit for an identity we never saw still retires that identity
        self.attached.insert(worker);

        let Some(pos) = self.live.iter().position(|w| *w == worker) else {
            debug!(%worker, "WorkerRegistry::on_terminated: not live");
            return None;
        };
        self.live.remove(pos);

        let cancelled_requests = correlator.cancel_worker(worker);
        let released = locks.release_all(Peer::Worker(worker));
        info!(
            %worker,
            cancelled_requests,
            released_locks = released.released.len(),
            "Worker terminated"
        );

        Some(Termination {
            worker,
            cancelled_requests,
            locks: released,
        })
    }

    pub fn is_live(&self, worker: WorkerId) -> bool {
        self.live.contains(&worker)
    }

    /// Seen at some point, live or not
    pub fn is_known(&self, worker: WorkerId) -> bool {
        self.attached.contains(&worker)
    }

    pub fn live(&self) -> &[WorkerId] {
        &self.live
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlator::{Continuation, Responder};
    use crate::domain::CorrelationId;
    use crate::error::HubError;
    use crate::locks::Waiter;
    use crate::transport::testing::RecordingTransport;
    use tokio::sync::{mpsc, oneshot};

    fn inbox(worker: WorkerId) -> Inbox {
        let (tx, _rx) = mpsc::unbounded_channel();
        Inbox::new(Peer::Worker(worker), tx)
    }

    #[test]
    fn test_spawn_attaches_once() {
        let transport = RecordingTransport::new();
        let mut registry = WorkerRegistry::new();
        let w = WorkerId::new();

        assert!(registry.on_spawned(w, &transport, inbox(w)));
        assert!(!registry.on_spawned(w, &transport, inbox(w)));

        assert_eq!(transport.listening(), vec![Peer::Worker(w)]);
        assert_eq!(registry.live(), &[w]);
    }

    #[test]
    fn test_live_in_spawn_order() {
        let transport = RecordingTransport::new();
        let mut registry = WorkerRegistry::new();
        let ids: Vec<WorkerId> = (0..3).map(|_| WorkerId::new()).collect();
        for id in &ids {
            registry.on_spawned(*id, &transport, inbox(*id));
        }
        assert_eq!(registry.live(), ids.as_slice());
    }

    #[test]
    fn test_terminate_cleans_requests_and_locks() {
        let transport = RecordingTransport::new();
        let mut registry = WorkerRegistry::new();
        let mut correlator = Correlator::new();
        let mut locks = LockManager::new();
        let (dead, other) = (WorkerId::new(), WorkerId::new());
        registry.on_spawned(dead, &transport, inbox(dead));
        registry.on_spawned(other, &transport, inbox(other));

        let (tx, mut rx) = oneshot::channel();
        correlator.issue(Peer::Worker(dead), Continuation::new(tx));

        let (cmd_tx, _cmd_rx) = mpsc::unbounded_channel();
        let grant = |id: &str, owner| Responder::new(CorrelationId::from(id), Some(owner), cmd_tx.clone());
        locks.acquire("foo", Waiter::new(Peer::Worker(dead), grant("l1", Peer::Worker(dead))));
        locks.acquire("foo", Waiter::new(Peer::Worker(other), grant("l2", Peer::Worker(other))));

        let termination = registry.on_terminated(dead, &mut correlator, &mut locks).unwrap();
        assert_eq!(termination.cancelled_requests, 1);
        assert_eq!(termination.locks.released, vec!["foo".to_string()]);

        assert_eq!(rx.try_recv().unwrap(), Err(HubError::PeerTerminated(dead)));
        assert_eq!(locks.holder("foo"), Some(Peer::Worker(other)));
        assert!(!registry.is_live(dead));
        assert!(registry.is_known(dead));
        assert_eq!(registry.live(), &[other]);
    }

    #[test]
    fn test_terminate_twice_is_noop() {
        let transport = RecordingTransport::new();
        let mut registry = WorkerRegistry::new();
        let mut correlator = Correlator::new();
        let mut locks = LockManager::new();
        let w = WorkerId::new();
        registry.on_spawned(w, &transport, inbox(w));

        assert!(registry.on_terminated(w, &mut correlator, &mut locks).is_some());
        assert!(registry.on_terminated(w, &mut correlator, &mut locks).is_none());
    }

    #[test]
    fn test_identity_never_reattached_after_exit() {
        let transport = RecordingTransport::new();
        let mut registry = WorkerRegistry::new();
        let mut correlator = Correlator::new();
        let mut locks = LockManager::new();
        let w = WorkerId::new();

        // Exit reported before spawn: the identity is retired
        assert!(registry.on_terminated(w, &mut correlator, &mut locks).is_none());
        assert!(!registry.on_spawned(w, &transport, inbox(w)));
        assert!(registry.is_empty());
        assert!(transport.listening().is_empty());
    }
}
