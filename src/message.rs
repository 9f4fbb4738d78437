//! Protocol-neutral messages exchanged with a remote service.
//!
//! DESIGN
//! ======
//! Every inbound frame is resolved into exactly one `Inbound` variant at decode
//! time. Routing downstream is a `match`, never an ad hoc inspection of an
//! untyped map: responses go to the correlation table, events to the
//! subscription registry, everything else is logged and dropped.
//!
//! Payloads stay as `serde_json::Value` because the session layer does not
//! interpret them. Codecs for non-JSON protocols wrap their payloads (the RCON
//! codec returns `Value::String`).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::credentials::Credential;

/// Client-generated correlation id. Starts at 1 and only grows within a session.
pub type RequestId = u32;

/// Topic key that receives every event regardless of its own topic.
pub const WILDCARD_TOPIC: &str = "*";

// =============================================================================
// OUTBOUND
// =============================================================================

/// A request the caller wants the remote service to perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub op: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl Command {
    #[must_use]
    pub fn new(op: impl Into<String>) -> Self {
        Self { op: op.into(), params: Map::new() }
    }

    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// Frames the session asks a codec to encode.
#[derive(Debug, Clone)]
pub enum Outbound {
    Auth { credential: Credential },
    Command { id: RequestId, command: Command },
    /// `topic` is the codec's remote topic, not the listener's key.
    Subscribe { id: RequestId, topic: String },
    /// `subscription` is the id of the `Subscribe` frame that created the
    /// server-side subscription on the current connection, when known.
    Unsubscribe { id: RequestId, topic: String, subscription: Option<RequestId> },
}

impl Outbound {
    /// Short label for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "auth",
            Self::Command { .. } => "command",
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
        }
    }
}

// =============================================================================
// INBOUND
// =============================================================================

/// Error object returned by the server for a failed command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub code: String,
    pub message: String,
}

impl RemoteError {
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: code.into(), message: message.into() }
    }

    /// Whether the server refused the command because of the credential.
    #[must_use]
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self.code.as_str(), "unauthorized" | "invalid_auth" | "auth_invalid" | "401" | "403")
    }
}

/// Payload carried by a push event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventValue {
    /// Complete replacement for the cached value of the topic.
    Full(Value),
    /// Fields to merge into the cached object.
    Partial(Map<String, Value>),
    /// Notification without a cacheable value.
    Signal(Value),
}

/// A push notification published under a topic key.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub topic: String,
    pub event_type: String,
    pub value: EventValue,
}

impl Event {
    #[must_use]
    pub fn full(topic: impl Into<String>, event_type: impl Into<String>, value: Value) -> Self {
        Self { topic: topic.into(), event_type: event_type.into(), value: EventValue::Full(value) }
    }

    /// The value listeners most likely want: the full value, the partial fields
    /// as an object, or the signal payload.
    #[must_use]
    pub fn payload(&self) -> Value {
        match &self.value {
            EventValue::Full(v) | EventValue::Signal(v) => v.clone(),
            EventValue::Partial(fields) => Value::Object(fields.clone()),
        }
    }
}

/// Decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    AuthRequired,
    AuthAccepted { server_version: Option<String> },
    AuthRejected { message: String },
    Response { id: RequestId, outcome: Result<Value, RemoteError> },
    Event(Event),
    /// The frame could not be decoded; logged and dropped.
    Malformed { reason: String },
    /// A well-formed frame the session has no use for (keepalive replies etc).
    Ignored { kind: String },
}

impl Inbound {
    /// Short label for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AuthRequired => "auth_required",
            Self::AuthAccepted { .. } => "auth_accepted",
            Self::AuthRejected { .. } => "auth_rejected",
            Self::Response { .. } => "response",
            Self::Event(_) => "event",
            Self::Malformed { .. } => "malformed",
            Self::Ignored { .. } => "ignored",
        }
    }
}

#[cfg(test)]
#[path = "message_test.rs"]
mod tests;
