//! Connection lifecycle states.
//!
//! DESIGN
//! ======
//! `ConnectionState` is published through a `tokio::sync::watch` channel by the
//! session driver, which is the only writer. Consumers either poll
//! `Session::state()` or hold a receiver from `Session::observe_state()`.
//!
//! `Failed` carries the `SessionError` that ended the lifecycle. It is not
//! terminal: an explicit `connect()` starts over from `Connecting`.

use std::fmt;
use std::time::Duration;

use crate::error::SessionError;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    /// Waiting `delay` before reconnect attempt `attempt` (1-based).
    Reconnecting { attempt: u32, delay: Duration },
    Failed(SessionError),
}

impl ConnectionState {
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Whether `connect()` has nothing left to wait for in this state.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Ready | Self::Failed(_) | Self::Disconnected)
    }

    /// Short lowercase label for logs.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Ready => "ready",
            Self::Reconnecting { .. } => "reconnecting",
            Self::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reconnecting { attempt, delay } => {
                write!(f, "reconnecting (attempt {attempt}, in {}ms)", delay.as_millis())
            }
            Self::Failed(err) => write!(f, "failed: {err}"),
            other => f.write_str(other.label()),
        }
    }
}

#[cfg(test)]
#[path = "state_test.rs"]
mod tests;
