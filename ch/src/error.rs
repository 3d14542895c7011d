//! Hub error types

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{Peer, WorkerId};

/// Errors surfaced by the coordination engine
///
/// Serializable because request results, including failures raised on the
/// coordinator (e.g. `NotLockHolder`), travel back to workers inside
/// response envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HubError {
    #[error("Peer {0} terminated before replying")]
    PeerTerminated(WorkerId),

    #[error("No live workers")]
    NoWorkers,

    #[error("Requests from a worker to a worker are not supported")]
    UnsupportedDirection,

    #[error("Lock '{key}' already unlocked")]
    DoubleUnlock { key: String },

    #[error("Lock '{key}' is not held by {owner}")]
    NotLockHolder { key: String, owner: Peer },

    #[error("Remote handler failed: {0}")]
    Remote(String),

    #[error("Malformed '{kind}' payload: {reason}")]
    MalformedPayload { kind: String, reason: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Hub is shut down")]
    Closed,
}

impl HubError {
    /// Check if this error means the target process is gone
    pub fn is_peer_terminated(&self) -> bool {
        matches!(self, HubError::PeerTerminated(_))
    }

    /// Check if this error is a caller-side usage mistake
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            HubError::UnsupportedDirection | HubError::DoubleUnlock { .. } | HubError::NotLockHolder { .. }
        )
    }
}

/// Result of a remote call as seen by the caller
pub type Reply = Result<serde_json::Value, HubError>;
