//! Single-use unlock capability for a granted lock

use tracing::{debug, warn};

use super::handle::{HubHandle, PendingReply};
use crate::domain::Peer;
use crate::error::HubError;
use crate::router::{LockPayload, UNLOCK_KIND, encode};

/// A held cluster-wide lock
///
/// Release with [`LockGuard::unlock`]. A guard dropped without unlocking
/// still releases the lock, but nobody observes the coordinator's answer.
#[must_use = "dropping the guard releases the lock immediately"]
pub struct LockGuard {
    handle: HubHandle,
    key: String,
    released: bool,
}

impl LockGuard {
    pub(crate) fn new(handle: HubHandle, key: String) -> Self {
        Self {
            handle,
            key,
            released: false,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Release the lock; the returned reply completes once the coordinator has released it
    ///
    /// A second call fails with `DoubleUnlock` without contacting anyone.
    pub fn unlock(&mut self) -> Result<PendingReply, HubError> {
        debug!(key = %self.key, "LockGuard::unlock: called");
        if self.released {
            return Err(HubError::DoubleUnlock { key: self.key.clone() });
        }
        self.released = true;
        self.send_unlock()
    }

    fn send_unlock(&self) -> Result<PendingReply, HubError> {
        let payload = encode(&LockPayload { key: self.key.clone() });
        self.handle.call(Peer::Coordinator, UNLOCK_KIND, payload)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            debug!(key = %self.key, "LockGuard::drop: releasing");
            match self.send_unlock() {
                Ok(_) => {}
                // Hub gone: the coordinator releases on the worker's exit
                Err(HubError::Closed) => debug!(key = %self.key, "LockGuard::drop: hub already stopped"),
                Err(e) => warn!(key = %self.key, "Failed to release dropped lock: {}", e),
            }
        }
    }
}
