//! Envelope and internal payload types
//!
//! Application messages travel as `Envelope { type, data, hub-key }`. The hub
//! reserves a handful of `_hub_*` types for its own request, response,
//! broadcast relay and lock traffic; their payloads are the structs below,
//! encoded as JSON values inside `data`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{CorrelationId, WorkerId};
use crate::error::HubError;

/// Correlated request: `data` is a [`RequestPayload`]
pub const REQUEST_KIND: &str = "_hub_request";

/// Correlated response: `data` is a [`ResponsePayload`]
pub const RESPONSE_KIND: &str = "_hub_response";

/// Worker broadcast relayed by the coordinator: `data` is a [`BroadcastPayload`]
pub const BROADCAST_KIND: &str = "_hub_broadcast";

/// Lock acquisition request type (carried inside a request)
pub const LOCK_KIND: &str = "_hub_lock";

/// Lock release request type (carried inside a request)
pub const UNLOCK_KIND: &str = "_hub_unlock";

/// A tagged, typed message unit exchanged over the transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "data")]
    pub payload: Value,
    #[serde(rename = "hub-key")]
    pub namespace: String,
}

impl Envelope {
    pub fn new(namespace: impl Into<String>, kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            namespace: namespace.into(),
        }
    }

    /// Check whether this is one of the hub's own message types
    pub fn is_internal(&self) -> bool {
        is_internal_kind(&self.kind)
    }

    /// Decode the payload of an internal envelope
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, HubError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| HubError::MalformedPayload {
            kind: self.kind.clone(),
            reason: e.to_string(),
        })
    }
}

/// Check whether a message type is reserved for the hub
pub fn is_internal_kind(kind: &str) -> bool {
    matches!(kind, REQUEST_KIND | RESPONSE_KIND | BROADCAST_KIND)
}

/// Payload of a correlated request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    #[serde(rename = "request-id")]
    pub id: CorrelationId,
}

/// Payload of a correlated response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePayload {
    #[serde(rename = "request-id")]
    pub id: CorrelationId,
    pub result: Result<Value, HubError>,
}

/// Payload of a worker broadcast on its way through the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    #[serde(rename = "worker-id")]
    pub origin: WorkerId,
}

/// Payload of lock and unlock requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockPayload {
    pub key: String,
}

/// Encode an internal payload as a JSON value
pub(crate) fn encode<T: Serialize>(payload: &T) -> Value {
    // Internal payloads are plain structs of strings and JSON values
    serde_json::to_value(payload).unwrap_or(Value::Null)
}
