//! Byte-level connections the session runs over.
//!
//! DESIGN
//! ======
//! `Transport::open` produces a fresh connection split into a write half
//! (`FrameSink`) and a read half (`FrameStream`). The session hands the sink
//! to a single writer task and drains the stream from a single reader loop, so
//! neither half has to be safe for concurrent use.
//!
//! A transport knows about framing (websocket messages, length prefixes) but
//! nothing about payloads; that is the codec's job.

pub mod memory;
pub mod tcp;
pub mod ws;

pub use memory::{MemoryPeer, MemoryServer, MemoryTransport};
pub use tcp::TcpTransport;
pub use ws::WebSocketTransport;

use crate::codec::WireFrame;

/// Error raised while opening, reading, or writing a connection.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection could not be established.
    #[error("connect failed: {0}")]
    Connect(String),
    /// The peer closed the connection (or the local half was already closed).
    #[error("connection closed")]
    Closed,
    /// A socket read or write failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// A frame exceeded the transport's size limit.
    #[error("frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },
}

impl TransportError {
    /// Grepable error code for logs.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Connect(_) => "E_TRANSPORT_CONNECT",
            Self::Closed => "E_TRANSPORT_CLOSED",
            Self::Io(_) => "E_TRANSPORT_IO",
            Self::FrameTooLarge { .. } => "E_TRANSPORT_FRAME_SIZE",
        }
    }

    /// Whether reconnecting could plausibly clear the error.
    #[must_use]
    pub fn retryable(&self) -> bool {
        !matches!(self, Self::FrameTooLarge { .. })
    }
}

/// Both halves of one open connection.
pub struct TransportParts {
    pub sink: Box<dyn FrameSink>,
    pub stream: Box<dyn FrameStream>,
}

/// Factory for connections to one remote endpoint.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Open a new connection.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connect`] when the endpoint is unreachable or
    /// refuses the connection.
    async fn open(&self) -> Result<TransportParts, TransportError>;

    /// Human-readable endpoint for logs.
    fn endpoint(&self) -> String;
}

/// Write half of a connection.
#[async_trait::async_trait]
pub trait FrameSink: Send {
    /// Write one frame.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] once the connection is gone.
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError>;

    /// Close the connection from this side.
    ///
    /// # Errors
    ///
    /// Returns an error when the close handshake could not be written.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Read half of a connection.
#[async_trait::async_trait]
pub trait FrameStream: Send {
    /// Next inbound frame, or `None` once the peer has closed the connection.
    async fn next(&mut self) -> Option<Result<WireFrame, TransportError>>;
}
