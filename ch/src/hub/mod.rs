//! Hub - per-process coordination engine
//!
//! One Hub task per process owns the router, worker registry, request
//! correlator and (on the coordinator) the lock manager. Application code
//! and the transport talk to it through commands on a single channel, so
//! every state change happens on one task in arrival order.

mod core;
mod handle;
mod lock_guard;
mod messages;

pub use core::Hub;
pub use handle::{HubHandle, PendingReply, Subscription};
pub use lock_guard::LockGuard;
pub use messages::{HubCommand, HubMetrics, Target};
