//! Transport adapter seam
//!
//! The hub never frames, serializes or retries anything itself. It needs two
//! things from the transport:
//!
//! - `send(to, envelope)`: fire-and-forget, ordered per channel
//! - `listen(from, inbox)`: start feeding envelopes arriving on the channel to
//!   `from` into the hub's [`Inbox`], which tags them with that peer
//!
//! [`MemoryNetwork`] is an in-process implementation built on tokio channels.

mod memory;

pub use memory::{LocalCluster, MemoryNetwork, MemoryTransport};

use eyre::Result;
use tokio::sync::mpsc;
use tracing::trace;

use crate::domain::Peer;
use crate::hub::HubCommand;
use crate::router::Envelope;

/// Raw message transport between the coordinator and its workers
pub trait Transport: Send + 'static {
    /// Send an envelope to a peer
    fn send(&self, to: &Peer, envelope: Envelope) -> Result<()>;

    /// Attach the inbound handler for the channel to `from`
    fn listen(&self, from: &Peer, inbox: Inbox) -> Result<()>;
}

/// Inbound callback for one channel
///
/// Every envelope delivered here is handed to the hub annotated with the
/// channel's peer.
#[derive(Debug, Clone)]
pub struct Inbox {
    from: Peer,
    tx: mpsc::UnboundedSender<HubCommand>,
}

impl Inbox {
    pub(crate) fn new(from: Peer, tx: mpsc::UnboundedSender<HubCommand>) -> Self {
        Self { from, tx }
    }

    /// The peer at the other end of this channel
    pub fn from(&self) -> Peer {
        self.from
    }

    /// Hand an envelope to the hub; false once the hub has stopped
    pub fn deliver(&self, envelope: Envelope) -> bool {
        trace!(from = %self.from, kind = %envelope.kind, "Inbox::deliver: called");
        self.tx
            .send(HubCommand::Inbound {
                envelope,
                from: self.from,
            })
            .is_ok()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Transport double that records sends and listen calls
    #[derive(Clone, Default)]
    pub(crate) struct RecordingTransport {
        pub sent: Arc<Mutex<Vec<(Peer, Envelope)>>>,
        pub listening: Arc<Mutex<Vec<Peer>>>,
    }

    impl RecordingTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn sent(&self) -> Vec<(Peer, Envelope)> {
            self.sent.lock().unwrap().clone()
        }

        pub fn take_sent(&self) -> Vec<(Peer, Envelope)> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }

        pub fn listening(&self) -> Vec<Peer> {
            self.listening.lock().unwrap().clone()
        }
    }

    impl Transport for RecordingTransport {
        fn send(&self, to: &Peer, envelope: Envelope) -> Result<()> {
            self.sent.lock().unwrap().push((*to, envelope));
            Ok(())
        }

        fn listen(&self, from: &Peer, _inbox: Inbox) -> Result<()> {
            self.listening.lock().unwrap().push(*from);
            Ok(())
        }
    }
}
