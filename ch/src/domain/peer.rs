//! Peers and process roles

use serde::{Deserialize, Serialize};

use super::id::WorkerId;

/// One end of a transport channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Peer {
    Coordinator,
    Worker(WorkerId),
}

impl Peer {
    /// The worker identity, if this peer is a worker
    pub fn worker(&self) -> Option<WorkerId> {
        match self {
            Peer::Coordinator => None,
            Peer::Worker(id) => Some(*id),
        }
    }

    pub fn is_coordinator(&self) -> bool {
        matches!(self, Peer::Coordinator)
    }
}

impl From<WorkerId> for Peer {
    fn from(id: WorkerId) -> Self {
        Peer::Worker(id)
    }
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Peer::Coordinator => write!(f, "coordinator"),
            Peer::Worker(id) => write!(f, "{}", id),
        }
    }
}

/// The role this process plays in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Coordinator,
    Worker(WorkerId),
}

impl Role {
    pub fn is_coordinator(&self) -> bool {
        matches!(self, Role::Coordinator)
    }

    pub fn is_worker(&self) -> bool {
        matches!(self, Role::Worker(_))
    }

    /// How other processes address this one
    pub fn as_peer(&self) -> Peer {
        match self {
            Role::Coordinator => Peer::Coordinator,
            Role::Worker(id) => Peer::Worker(*id),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_peer())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_worker_accessor() {
        let id = WorkerId::new();
        assert_eq!(Peer::Worker(id).worker(), Some(id));
        assert_eq!(Peer::Coordinator.worker(), None);
        assert!(Peer::Coordinator.is_coordinator());
    }

    #[test]
    fn test_peer_serialization() {
        let json = serde_json::to_string(&Peer::Coordinator).unwrap();
        assert_eq!(json, r#""coordinator""#);

        let id = WorkerId::new();
        let json = serde_json::to_string(&Peer::Worker(id)).unwrap();
        assert!(json.contains("worker"));
        let back: Peer = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Peer::Worker(id));
    }

    #[test]
    fn test_role_as_peer() {
        let id = WorkerId::new();
        assert_eq!(Role::Worker(id).as_peer(), Peer::Worker(id));
        assert_eq!(Role::Coordinator.as_peer(), Peer::Coordinator);
        assert!(Role::Worker(id).is_worker());
        assert!(!Role::Worker(id).is_coordinator());
    }
}
