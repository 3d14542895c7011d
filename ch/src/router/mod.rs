//! Message router
//!
//! Stamps outbound messages with the hub's namespace marker, filters inbound
//! envelopes by that marker, and dispatches typed events to local subscribers.

mod envelope;
mod subscribers;

pub use envelope::{
    BROADCAST_KIND, BroadcastPayload, Envelope, LOCK_KIND, LockPayload, REQUEST_KIND, RESPONSE_KIND, RequestPayload,
    ResponsePayload, UNLOCK_KIND, is_internal_kind,
};
pub(crate) use envelope::encode;
pub use subscribers::{SubscriptionId, Subscribers};

use serde_json::Value;
use tracing::{debug, trace};

use crate::correlator::Responder;
use crate::domain::Peer;
use crate::error::HubError;

/// A typed event delivered to local subscribers
///
/// `sender` is the peer the message came from, or `None` when it was emitted
/// inside this process. Requests carry a one-shot responder shared by every
/// subscriber that receives the event; only the first answer is sent.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: String,
    pub payload: Value,
    pub sender: Option<Peer>,
    responder: Option<Responder>,
}

impl Event {
    /// Create a plain (non-request) event
    pub fn message(kind: impl Into<String>, payload: Value, sender: Option<Peer>) -> Self {
        Self {
            kind: kind.into(),
            payload,
            sender,
            responder: None,
        }
    }

    /// Create a request event that can be answered through `responder`
    pub(crate) fn request(kind: impl Into<String>, payload: Value, sender: Option<Peer>, responder: Responder) -> Self {
        Self {
            kind: kind.into(),
            payload,
            sender,
            responder: Some(responder),
        }
    }

    /// Check whether the sender is waiting for an answer
    pub fn is_request(&self) -> bool {
        self.responder.is_some()
    }

    pub fn responder(&self) -> Option<&Responder> {
        self.responder.as_ref()
    }

    /// Answer the request; false if this is not a request or it was already answered
    pub fn respond(&self, result: Result<Value, HubError>) -> bool {
        match &self.responder {
            Some(responder) => responder.respond(result),
            None => {
                debug!(kind = %self.kind, "Event::respond: not a request");
                false
            }
        }
    }

    /// Answer the request with a value
    pub fn reply(&self, value: Value) -> bool {
        self.respond(Ok(value))
    }
}

/// Namespace filter plus local dispatch
pub struct Router {
    namespace: String,
    subscribers: Subscribers,
}

impl Router {
    pub fn new(namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        debug!(%namespace, "Router::new: called");
        Self {
            namespace,
            subscribers: Subscribers::new(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Wrap a payload in an envelope carrying this hub's namespace
    pub fn wrap(&self, kind: &str, payload: Value) -> Envelope {
        Envelope::new(self.namespace.clone(), kind, payload)
    }

    /// Check the namespace marker of an inbound envelope
    pub fn accepts(&self, envelope: &Envelope) -> bool {
        let ok = envelope.namespace == self.namespace;
        if !ok {
            trace!(
                expected = %self.namespace,
                got = %envelope.namespace,
                kind = %envelope.kind,
                "Router::accepts: foreign envelope"
            );
        }
        ok
    }

    /// Dispatch an event to local subscribers of its type
    pub fn publish_local(&mut self, event: Event) -> usize {
        debug!(kind = %event.kind, sender = ?event.sender, "Router::publish_local: called");
        self.subscribers.publish(&event)
    }

    pub fn subscribers(&self) -> &Subscribers {
        &self.subscribers
    }

    pub fn subscribers_mut(&mut self) -> &mut Subscribers {
        &mut self.subscribers
    }
}
