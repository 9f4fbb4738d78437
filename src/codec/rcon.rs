//! Source RCON packet codec.
//!
//! DESIGN
//! ======
//! A packet body is `id: i32 LE | type: i32 LE | payload: UTF-8 | 0x00 0x00`.
//! The 4-byte length prefix in front of each body is framing, so it lives in
//! `transport::tcp`; this codec only ever sees complete bodies.
//!
//! The handshake uses a fixed request id of `0`. Session ids start at 1, so an
//! auth exchange can never be mistaken for a command response. Servers that
//! answer auth with an empty `RESPONSE_VALUE` before the real `AUTH_RESPONSE`
//! produce an id-0 response, which decodes as `Ignored`.
//!
//! RCON has no push events, so subscribe frames are refused.

use serde_json::Value;

use super::{Codec, CodecError, WireFrame};
use crate::message::{Command, Inbound, Outbound, RequestId};

pub const PACKET_TYPE_AUTH: i32 = 3;
pub const PACKET_TYPE_EXEC_COMMAND: i32 = 2;
pub const PACKET_TYPE_AUTH_RESPONSE: i32 = 2;
pub const PACKET_TYPE_RESPONSE_VALUE: i32 = 0;

/// Largest packet body accepted in either direction.
pub const MAX_PACKET_SIZE: usize = 4096;
/// id + type + two terminating nulls.
pub const MIN_PACKET_SIZE: usize = 10;
/// Request id used for the authentication exchange.
pub const AUTH_REQUEST_ID: i32 = 0;
/// Id the server answers with when the password is wrong.
pub const AUTH_FAILED_ID: i32 = -1;

#[derive(Debug, Clone, Copy, Default)]
pub struct RconCodec;

impl RconCodec {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Codec for RconCodec {
    fn encode(&self, message: &Outbound) -> Result<WireFrame, CodecError> {
        let body = match message {
            Outbound::Auth { credential } => build_packet(AUTH_REQUEST_ID, PACKET_TYPE_AUTH, credential.secret())?,
            Outbound::Command { id, command } => {
                let id = i32::try_from(*id).map_err(|_| CodecError::IdOutOfRange(*id))?;
                build_packet(id, PACKET_TYPE_EXEC_COMMAND, &command_line(command))?
            }
            Outbound::Subscribe { .. } => return Err(CodecError::UnsupportedFrame("subscribe")),
            Outbound::Unsubscribe { .. } => return Err(CodecError::UnsupportedFrame("unsubscribe")),
        };
        Ok(WireFrame::Binary(body))
    }

    fn decode(&self, frame: WireFrame) -> Inbound {
        let body = match frame {
            WireFrame::Binary(bytes) => bytes,
            WireFrame::Text(_) => return Inbound::Malformed { reason: "unexpected text frame".into() },
        };
        match parse_packet(&body) {
            Ok(packet) => packet.into_inbound(),
            Err(e) => Inbound::Malformed { reason: e.to_string() },
        }
    }

    fn supports_subscriptions(&self) -> bool {
        false
    }
}

/// Build the console line for a command: the op followed by its `args` param.
fn command_line(command: &Command) -> String {
    let args = match command.params.get("args") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| item.as_str().map_or_else(|| item.to_string(), str::to_owned))
            .collect::<Vec<_>>()
            .join(" "),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };
    if args.is_empty() { command.op.clone() } else { format!("{} {args}", command.op) }
}

fn build_packet(id: i32, packet_type: i32, payload: &str) -> Result<Vec<u8>, CodecError> {
    let size = MIN_PACKET_SIZE + payload.len();
    if size > MAX_PACKET_SIZE {
        return Err(CodecError::PacketTooLarge { size, max: MAX_PACKET_SIZE });
    }
    let mut body = Vec::with_capacity(size);
    body.extend_from_slice(&id.to_le_bytes());
    body.extend_from_slice(&packet_type.to_le_bytes());
    body.extend_from_slice(payload.as_bytes());
    body.extend_from_slice(&[0, 0]);
    Ok(body)
}

// =============================================================================
// DECODE
// =============================================================================

#[derive(Debug, PartialEq, Eq)]
struct Packet {
    id: i32,
    packet_type: i32,
    payload: String,
}

impl Packet {
    fn into_inbound(self) -> Inbound {
        match self.packet_type {
            PACKET_TYPE_AUTH_RESPONSE if self.id == AUTH_REQUEST_ID => Inbound::AuthAccepted { server_version: None },
            PACKET_TYPE_AUTH_RESPONSE if self.id == AUTH_FAILED_ID => {
                Inbound::AuthRejected { message: "invalid rcon password".into() }
            }
            // only the auth request's id may accept the session
            PACKET_TYPE_AUTH_RESPONSE => {
                Inbound::AuthRejected { message: format!("auth response for unexpected id {}", self.id) }
            }
            PACKET_TYPE_RESPONSE_VALUE if self.id == AUTH_REQUEST_ID => Inbound::Ignored { kind: "auth_preamble".into() },
            PACKET_TYPE_RESPONSE_VALUE => match RequestId::try_from(self.id) {
                Ok(id) => Inbound::Response { id, outcome: Ok(Value::String(self.payload)) },
                Err(_) => Inbound::Malformed { reason: format!("negative response id {}", self.id) },
            },
            other => Inbound::Ignored { kind: format!("packet_type_{other}") },
        }
    }
}

fn parse_packet(body: &[u8]) -> Result<Packet, CodecError> {
    if body.len() < MIN_PACKET_SIZE {
        return Err(CodecError::PacketTooShort { size: body.len(), min: MIN_PACKET_SIZE });
    }
    if body.len() > MAX_PACKET_SIZE {
        return Err(CodecError::PacketTooLarge { size: body.len(), max: MAX_PACKET_SIZE });
    }
    let id = read_i32(&body[0..4]);
    let packet_type = read_i32(&body[4..8]);
    let payload = String::from_utf8(body[8..body.len() - 2].to_vec())?;
    Ok(Packet { id, packet_type, payload })
}

fn read_i32(bytes: &[u8]) -> i32 {
    let mut raw = [0_u8; 4];
    raw.copy_from_slice(bytes);
    i32::from_le_bytes(raw)
}

#[cfg(test)]
#[path = "rcon_test.rs"]
mod tests;
