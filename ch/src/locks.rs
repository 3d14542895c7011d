//! Lock manager (coordinator-resident)
//!
//! Per key, a FIFO queue of waiters. The head of a queue is the holder and
//! has already been granted; everyone behind it is waiting. A key whose queue
//! empties is removed from the map.
//!
//! Grants are answers to the waiter's `_hub_lock` request, so a waiter's grant
//! capability is simply the [`Responder`] of that request.

use std::collections::{HashMap, VecDeque};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::correlator::Responder;
use crate::domain::Peer;
use crate::error::HubError;

/// A queued lock request
pub struct Waiter {
    pub owner: Peer,
    grant: Responder,
}

impl Waiter {
    pub fn new(owner: Peer, grant: Responder) -> Self {
        Self { owner, grant }
    }

    fn grant(&self, key: &str) {
        debug!(%key, owner = %self.owner, "Waiter::grant: called");
        if !self.grant.respond(Ok(Value::Null)) {
            warn!(%key, owner = %self.owner, "Lock grant could not be delivered");
        }
    }
}

/// What a dead owner's cleanup did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReleasedLocks {
    /// Keys the owner held
    pub released: Vec<String>,
    /// Queued requests of the owner that were dropped
    pub dropped_waiters: usize,
}

#[derive(Default)]
pub struct LockManager {
    queues: HashMap<String, VecDeque<Waiter>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an acquisition; returns true if it was granted immediately
    pub fn acquire(&mut self, key: &str, waiter: Waiter) -> bool {
        debug!(%key, owner = %waiter.owner, "LockManager::acquire: called");
        let queue = self.queues.entry(key.to_string()).or_default();
        queue.push_back(waiter);

        if queue.len() == 1 {
            queue[0].grant(key);
            true
        } else {
            debug!(%key, position = queue.len() - 1, "LockManager::acquire: queued");
            false
        }
    }

    /// Release `key` on behalf of `owner`, granting the next waiter if any
    ///
    /// Returns the new holder. Fails with `NotLockHolder` when `owner` is not
    /// the current holder (including a key nobody holds).
    pub fn release(&mut self, key: &str, owner: Peer) -> Result<Option<Peer>, HubError> {
        debug!(%key, %owner, "LockManager::release: called");
        let Some(queue) = self.queues.get_mut(key) else {
            return Err(HubError::NotLockHolder {
                key: key.to_string(),
                owner,
            });
        };
        if queue.front().map(|w| w.owner) != Some(owner) {
            return Err(HubError::NotLockHolder {
                key: key.to_string(),
                owner,
            });
        }

        queue.pop_front();
        match queue.front() {
            Some(next) => {
                next.grant(key);
                Ok(Some(next.owner))
            }
            None => {
                self.queues.remove(key);
                Ok(None)
            }
        }
    }

    /// Drop everything a dead owner held or was waiting for
    ///
    /// Queued requests are removed first so a released key is never granted
    /// back to the dead owner.
    pub fn release_all(&mut self, owner: Peer) -> ReleasedLocks {
        let mut result = ReleasedLocks::default();
        let mut held = Vec::new();

        for (key, queue) in self.queues.iter_mut() {
            let holds = queue.front().map(|w| w.owner) == Some(owner);
            let before = queue.len();
            let mut index = 0;
            queue.retain(|w| {
                let keep = (index == 0 && holds) || w.owner != owner;
                index += 1;
                keep
            });
            result.dropped_waiters += before - queue.len();
            if holds {
                held.push(key.clone());
            }
        }

        held.sort();
        for key in held {
            if let Err(e) = self.release(&key, owner) {
                warn!(%key, %owner, "Forced release failed: {}", e);
                continue;
            }
            result.released.push(key);
        }

        if !result.released.is_empty() || result.dropped_waiters > 0 {
            info!(
                %owner,
                released = ?result.released,
                dropped_waiters = result.dropped_waiters,
                "Released locks of terminated owner"
            );
        }
        result
    }

    pub fn holder(&self, key: &str) -> Option<Peer> {
        self.queues.get(key).and_then(|q| q.front()).map(|w| w.owner)
    }

    /// Number of waiters behind the holder
    pub fn waiting(&self, key: &str) -> usize {
        self.queues.get(key).map(|q| q.len().saturating_sub(1)).unwrap_or(0)
    }

    pub fn held_count(&self) -> usize {
        self.queues.len()
    }

    pub fn waiting_count(&self) -> usize {
        self.queues.values().map(|q| q.len().saturating_sub(1)).sum()
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.queues.contains_key(key)
    }
}
