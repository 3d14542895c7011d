//! Local subscriber table
//!
//! A small pub/sub capability: each subscription is an unbounded channel
//! keyed by message type. Dispatch walks a type's subscribers in the order they
//! subscribed; subscribers whose receiver is gone are pruned once the pass is
//! over, so a subscription ending mid-pass never disturbs that pass.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::debug;

use super::Event;

/// Identifies one subscription within a hub
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Default)]
pub struct Subscribers {
    by_kind: HashMap<String, Vec<(SubscriptionId, mpsc::UnboundedSender<Event>)>>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, id: SubscriptionId, kind: &str, tx: mpsc::UnboundedSender<Event>) {
        debug!(%id, %kind, "Subscribers::subscribe: called");
        self.by_kind.entry(kind.to_string()).or_default().push((id, tx));
    }

    /// Remove a subscription; returns false if it was not registered
    pub fn unsubscribe(&mut self, id: SubscriptionId, kind: &str) -> bool {
        debug!(%id, %kind, "Subscribers::unsubscribe: called");
        let Some(subs) = self.by_kind.get_mut(kind) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|(sub_id, _)| *sub_id != id);
        let removed = subs.len() != before;
        if subs.is_empty() {
            self.by_kind.remove(kind);
        }
        removed
    }

    /// Deliver an event to every subscriber of its type, returning how many got it
    pub fn publish(&mut self, event: &Event) -> usize {
        let Some(subs) = self.by_kind.get_mut(&event.kind) else {
            debug!(kind = %event.kind, "Subscribers::publish: no subscribers");
            return 0;
        };

        let mut delivered = 0;
        let mut closed = Vec::new();
        for (id, tx) in subs.iter() {
            if tx.send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                closed.push(*id);
            }
        }

        if !closed.is_empty() {
            debug!(kind = %event.kind, count = closed.len(), "Subscribers::publish: pruning closed subscribers");
            subs.retain(|(id, _)| !closed.contains(id));
            if subs.is_empty() {
                self.by_kind.remove(&event.kind);
            }
        }

        delivered
    }

    pub fn has_subscribers(&self, kind: &str) -> bool {
        self.by_kind.contains_key(kind)
    }

    pub fn count(&self) -> usize {
        self.by_kind.values().map(|s| s.len()).sum()
    }
}
