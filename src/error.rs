//! Session error taxonomy.
//!
//! DESIGN
//! ======
//! `SessionError` is what callers of the facade see. It is `Clone` because a
//! single transport failure fans out to every pending request, and each of
//! them gets its own copy of the cause.
//!
//! Transport and codec failures inside the frame loop never reach callers
//! directly: they move the state machine instead. Only command-level outcomes
//! resolve into a `SessionError`.

use crate::codec::CodecError;
use crate::message::RemoteError;
use crate::transport::TransportError;

/// Errors surfaced by session, credential, and HTTP operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// The connection dropped (or was closed) while the request was outstanding.
    #[error("connection lost")]
    ConnectionLost,
    /// No correlated response arrived before the per-command deadline.
    #[error("timed out waiting for response")]
    Timeout,
    /// The server rejected the credential.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),
    /// The reconnect policy ran out of attempts.
    #[error("gave up after {attempts} reconnect attempts")]
    MaxRetriesExceeded { attempts: u32 },
    /// An inbound frame could not be decoded.
    #[error("malformed frame: {0}")]
    Malformed(String),
    /// A command was issued while the session was not `Ready`.
    #[error("session is not ready")]
    NotReady,
    /// The server executed the command and reported a failure.
    #[error("server error {}: {}", .0.code, .0.message)]
    Remote(RemoteError),
    /// The server answered with a well-formed but semantically invalid response.
    #[error("protocol error: {0}")]
    ProtocolError(String),
    /// Opening or writing to the transport failed.
    #[error("transport failed: {0}")]
    Transport(String),
    /// An out-of-band HTTP exchange failed before a status was received.
    #[error("http request failed: {0}")]
    Http(String),
}

impl SessionError {
    /// Grepable error code for logs and user-facing messages.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConnectionLost => "E_CONNECTION_LOST",
            Self::Timeout => "E_TIMEOUT",
            Self::AuthRejected(_) => "E_AUTH_REJECTED",
            Self::MaxRetriesExceeded { .. } => "E_MAX_RETRIES",
            Self::Malformed(_) => "E_MALFORMED",
            Self::NotReady => "E_NOT_READY",
            Self::Remote(_) => "E_REMOTE",
            Self::ProtocolError(_) => "E_PROTOCOL",
            Self::Transport(_) => "E_TRANSPORT",
            Self::Http(_) => "E_HTTP",
        }
    }

    /// Whether repeating the same operation later could succeed.
    #[must_use]
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLost | Self::Timeout | Self::NotReady | Self::Transport(_) | Self::Http(_)
        )
    }

    /// Whether this error means the credential was refused.
    #[must_use]
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self, Self::AuthRejected(_))
    }
}

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Closed => Self::ConnectionLost,
            other => Self::Transport(other.to_string()),
        }
    }
}

impl From<CodecError> for SessionError {
    fn from(err: CodecError) -> Self {
        Self::ProtocolError(err.to_string())
    }
}

impl From<reqwest::Error> for SessionError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.to_string())
    }
}

#[cfg(test)]
#[path = "error_test.rs"]
mod tests;
