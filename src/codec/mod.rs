//! Wire codecs.
//!
//! DESIGN
//! ======
//! A `Codec` turns `Outbound` messages into transport frames and transport
//! frames into `Inbound` messages. It owns everything protocol-specific about
//! payload layout; framing (length prefixes, websocket opcodes) belongs to the
//! transport.
//!
//! `decode` is infallible by signature: a frame that cannot be parsed becomes
//! `Inbound::Malformed`, which the session logs and drops without tearing the
//! connection down. `encode` does return errors, because refusing to send is
//! something the caller can act on.

pub mod json;
pub mod rcon;

pub use json::JsonCodec;
pub use rcon::RconCodec;

use serde_json::Value;

use crate::message::{Inbound, Outbound};

/// One discrete unit of data on the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Text(String),
    Binary(Vec<u8>),
}

impl WireFrame {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(bytes) => bytes.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Error returned while encoding or decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// A text payload was not valid UTF-8.
    #[error("payload is not valid utf-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    /// A JSON payload could not be parsed or produced.
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    /// A packet exceeded the protocol's maximum size.
    #[error("packet of {size} bytes exceeds limit of {max}")]
    PacketTooLarge { size: usize, max: usize },
    /// A packet was shorter than the protocol's fixed header.
    #[error("packet of {size} bytes is shorter than minimum {min}")]
    PacketTooShort { size: usize, min: usize },
    /// A request id does not fit the protocol's id field.
    #[error("request id {0} does not fit the wire id field")]
    IdOutOfRange(u32),
    /// The protocol has no representation for this kind of message.
    #[error("{0} frames are not supported by this protocol")]
    UnsupportedFrame(&'static str),
}

impl CodecError {
    /// Grepable error code for logs.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidUtf8(_) => "E_CODEC_UTF8",
            Self::Json(_) => "E_CODEC_JSON",
            Self::PacketTooLarge { .. } => "E_CODEC_TOO_LARGE",
            Self::PacketTooShort { .. } => "E_CODEC_TOO_SHORT",
            Self::IdOutOfRange(_) => "E_CODEC_ID_RANGE",
            Self::UnsupportedFrame(_) => "E_CODEC_UNSUPPORTED",
        }
    }

    /// Codec failures are deterministic; resending the same input fails again.
    #[must_use]
    pub fn retryable(&self) -> bool {
        false
    }
}

/// Protocol adapter between `Outbound`/`Inbound` and transport frames.
pub trait Codec: Send + Sync {
    /// Encode one outbound message into a single transport frame.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnsupportedFrame`] when the protocol cannot carry
    /// the message, or a size/id error when a field does not fit the wire layout.
    fn encode(&self, message: &Outbound) -> Result<WireFrame, CodecError>;

    /// Decode one transport frame. Never fails; undecodable input becomes
    /// [`Inbound::Malformed`].
    fn decode(&self, frame: WireFrame) -> Inbound;

    /// Server-side subscription that delivers events for local `topic`.
    /// Topics sharing a remote topic share one server subscription.
    fn remote_topic(&self, topic: &str) -> String {
        topic.to_owned()
    }

    /// Split a bulk-refresh result into `(key, value)` cache entries.
    fn bulk_entities(&self, _result: &Value) -> Vec<(String, Value)> {
        Vec::new()
    }

    /// Whether the protocol has server-side subscriptions at all.
    fn supports_subscriptions(&self) -> bool {
        true
    }
}
