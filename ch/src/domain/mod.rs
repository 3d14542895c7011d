//! Domain types shared by every component

mod id;
mod peer;

pub use id::{CorrelationId, WorkerId};
pub use peer::{Peer, Role};
