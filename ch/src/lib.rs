//! clusterhub - Messaging and coordination between a coordinator and its workers
//!
//! A coordinator process and the workers it spawns share no memory; they
//! exchange tagged messages over per-worker channels. clusterhub layers four
//! services on top of that raw transport:
//!
//! - **Pub/sub**: typed events dispatched to local subscribers
//! - **Requests**: correlated request/response in every direction except
//!   worker to worker
//! - **Lifecycle**: a worker's death fails its outstanding requests and
//!   releases its locks
//! - **Locks**: named cluster-wide mutual exclusion, granted in FIFO order
//!   by the coordinator
//!
//! # Modules
//!
//! - [`hub`] - The per-process engine and its handle
//! - [`router`] - Envelopes, namespace filtering and local dispatch
//! - [`correlator`] - Pending-request table
//! - [`locks`] - Coordinator-resident lock queues
//! - [`registry`] - Live worker tracking
//! - [`transport`] - Transport seam and the in-process implementation
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface of the demo binary

pub mod cli;
pub mod config;
pub mod correlator;
pub mod domain;
pub mod error;
pub mod hub;
pub mod locks;
pub mod registry;
pub mod router;
pub mod transport;

// Re-export commonly used types
pub use config::{DEFAULT_NAMESPACE, HubConfig};
pub use domain::{CorrelationId, Peer, Role, WorkerId};
pub use error::{HubError, Reply};
pub use hub::{Hub, HubCommand, HubHandle, HubMetrics, LockGuard, PendingReply, Subscription, Target};
pub use router::{Envelope, Event};
pub use transport::{Inbox, LocalCluster, MemoryNetwork, MemoryTransport, Transport};
