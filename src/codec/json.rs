//! JSON text-frame codec for duplex push APIs.
//!
//! Frames follow the home-automation websocket API: an `auth` handshake,
//! id-tagged commands flattened into the top-level object, `result` frames
//! correlated by id, and `event` frames carrying entity state changes.
//!
//! Entity topics have no server-side subscription of their own. Every entity
//! and the wildcard ride one `subscribe_events` for `state_changed`, and
//! events are routed locally on `data.entity_id`.

use serde_json::{Map, Value, json};

use super::{Codec, CodecError, WireFrame};
use crate::message::{Event, EventValue, Inbound, Outbound, RemoteError, RequestId, WILDCARD_TOPIC};

/// Event type that carries every entity state change.
pub const STATE_CHANGED: &str = "state_changed";

/// Websocket endpoint path on a hub's base URL.
pub const SOCKET_PATH: &str = "/api/websocket";

/// Keepalive command; the hub answers with a `pong` carrying the same id.
pub const PING: &str = "ping";

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Codec for JsonCodec {
    fn encode(&self, message: &Outbound) -> Result<WireFrame, CodecError> {
        let value = match message {
            Outbound::Auth { credential } => json!({ "type": "auth", "access_token": credential.secret() }),
            Outbound::Command { id, command } => {
                let mut body = command.params.clone();
                body.insert("id".into(), json!(id));
                body.insert("type".into(), json!(command.op));
                Value::Object(body)
            }
            Outbound::Subscribe { id, topic } => subscribe_body(*id, topic),
            Outbound::Unsubscribe { id, topic, subscription } => {
                let mut body = Map::new();
                body.insert("id".into(), json!(id));
                body.insert("type".into(), json!("unsubscribe_events"));
                match subscription {
                    Some(sub) => body.insert("subscription".into(), json!(sub)),
                    None => body.insert("event_type".into(), json!(event_type_for(topic))),
                };
                Value::Object(body)
            }
        };
        Ok(WireFrame::Text(serde_json::to_string(&value)?))
    }

    fn decode(&self, frame: WireFrame) -> Inbound {
        let text = match frame {
            WireFrame::Text(text) => text,
            WireFrame::Binary(bytes) => {
                return Inbound::Malformed { reason: format!("unexpected binary frame of {} bytes", bytes.len()) };
            }
        };
        let value: Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(e) => return Inbound::Malformed { reason: e.to_string() },
        };
        decode_value(&value)
    }

    fn remote_topic(&self, topic: &str) -> String {
        event_type_for(topic).to_owned()
    }

    fn bulk_entities(&self, result: &Value) -> Vec<(String, Value)> {
        let Some(items) = result.as_array() else {
            return Vec::new();
        };
        items
            .iter()
            .filter_map(|item| {
                let key = item.get("entity_id")?.as_str()?;
                Some((key.to_owned(), item.clone()))
            })
            .collect()
    }
}

fn subscribe_body(id: RequestId, topic: &str) -> Value {
    json!({ "id": id, "type": "subscribe_events", "event_type": event_type_for(topic) })
}

/// Entity ids are `domain.object_id`; event types never contain a dot.
fn is_entity_topic(topic: &str) -> bool {
    topic.contains('.')
}

fn event_type_for(topic: &str) -> &str {
    if topic == WILDCARD_TOPIC || is_entity_topic(topic) { STATE_CHANGED } else { topic }
}

// =============================================================================
// DECODE
// =============================================================================

fn decode_value(value: &Value) -> Inbound {
    let Some(kind) = value.get("type").and_then(Value::as_str) else {
        return Inbound::Malformed { reason: "frame has no type field".into() };
    };
    match kind {
        "auth_required" => Inbound::AuthRequired,
        "auth_ok" => Inbound::AuthAccepted {
            server_version: value.get("ha_version").and_then(Value::as_str).map(str::to_owned),
        },
        "auth_invalid" => Inbound::AuthRejected {
            message: value.get("message").and_then(Value::as_str).unwrap_or("invalid credentials").to_owned(),
        },
        "result" => decode_result(value),
        "event" => decode_event(value),
        "pong" => match frame_id(value) {
            Some(id) => Inbound::Response { id, outcome: Ok(Value::Null) },
            None => Inbound::Ignored { kind: "pong".into() },
        },
        other => Inbound::Ignored { kind: other.to_owned() },
    }
}

fn decode_result(value: &Value) -> Inbound {
    let Some(id) = frame_id(value) else {
        return Inbound::Malformed { reason: "result frame has no usable id".into() };
    };
    let success = value.get("success").and_then(Value::as_bool).unwrap_or(false);
    let outcome = if success {
        Ok(value.get("result").cloned().unwrap_or(Value::Null))
    } else {
        let error = value.get("error");
        let code = error.and_then(|e| e.get("code")).map_or_else(|| "unknown_error".to_owned(), value_to_code);
        let message = error
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("request failed")
            .to_owned();
        Err(RemoteError { code, message })
    };
    Inbound::Response { id, outcome }
}

fn decode_event(value: &Value) -> Inbound {
    let Some(event) = value.get("event").and_then(Value::as_object) else {
        return Inbound::Malformed { reason: "event frame has no event object".into() };
    };
    let event_type = event.get("event_type").and_then(Value::as_str).unwrap_or(STATE_CHANGED).to_owned();
    let data = event.get("data").cloned().unwrap_or(Value::Null);
    let entity = data.get("entity_id").and_then(Value::as_str).map(str::to_owned);

    let (topic, value) = match entity {
        Some(entity_id) => {
            let value = match (data.get("new_state"), data.get("changes")) {
                (Some(state), _) if !state.is_null() => EventValue::Full(state.clone()),
                (_, Some(Value::Object(changes))) => EventValue::Partial(changes.clone()),
                _ => EventValue::Signal(data.clone()),
            };
            (entity_id, value)
        }
        None => (event_type.clone(), EventValue::Signal(data)),
    };
    Inbound::Event(Event { topic, event_type, value })
}

fn frame_id(value: &Value) -> Option<RequestId> {
    value.get("id").and_then(Value::as_u64).and_then(|id| RequestId::try_from(id).ok())
}

/// Error codes arrive as strings or integers depending on the endpoint.
fn value_to_code(code: &Value) -> String {
    match code {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
#[path = "json_test.rs"]
mod tests;
