//! In-process transport for tests and offline use.
//!
//! DESIGN
//! ======
//! `MemoryTransport::pair()` returns the client-side transport and a
//! `MemoryServer`. Every successful `open()` hands the server a `MemoryPeer`
//! whose `send`/`recv` are the other ends of the client's stream and sink.
//! Closing either side ends the other side's reads, exactly like a socket.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::mpsc;

use super::{FrameSink, FrameStream, Transport, TransportError, TransportParts};
use crate::codec::WireFrame;

struct Shared {
    refusing: AtomicBool,
    opened: AtomicUsize,
}

/// Client side of an in-memory connection factory.
#[derive(Clone)]
pub struct MemoryTransport {
    shared: Arc<Shared>,
    accept_tx: mpsc::UnboundedSender<MemoryPeer>,
}

/// Server side: yields one `MemoryPeer` per client `open()`.
pub struct MemoryServer {
    shared: Arc<Shared>,
    accept_rx: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryTransport {
    #[must_use]
    pub fn pair() -> (Self, MemoryServer) {
        let shared = Arc::new(Shared { refusing: AtomicBool::new(false), opened: AtomicUsize::new(0) });
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        (Self { shared: shared.clone(), accept_tx }, MemoryServer { shared, accept_rx })
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    async fn open(&self) -> Result<TransportParts, TransportError> {
        self.shared.opened.fetch_add(1, Ordering::SeqCst);
        if self.shared.refusing.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("connection refused".into()));
        }
        let (to_server_tx, to_server_rx) = mpsc::unbounded_channel();
        let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
        let peer = MemoryPeer { incoming: to_server_rx, outgoing: Some(to_client_tx) };
        self.accept_tx
            .send(peer)
            .map_err(|_| TransportError::Connect("memory server dropped".into()))?;
        Ok(TransportParts {
            sink: Box::new(MemorySink { tx: Some(to_server_tx) }),
            stream: Box::new(MemoryStream { rx: to_client_rx }),
        })
    }

    fn endpoint(&self) -> String {
        "memory".to_owned()
    }
}

impl MemoryServer {
    /// Wait for the next client connection.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.recv().await
    }

    /// Make every subsequent `open()` fail (or succeed again).
    pub fn set_refusing(&self, refusing: bool) {
        self.shared.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Number of `open()` calls so far, refused ones included.
    #[must_use]
    pub fn open_attempts(&self) -> usize {
        self.shared.opened.load(Ordering::SeqCst)
    }
}

/// Server end of one in-memory connection.
pub struct MemoryPeer {
    incoming: mpsc::UnboundedReceiver<WireFrame>,
    outgoing: Option<mpsc::UnboundedSender<WireFrame>>,
}

impl MemoryPeer {
    /// Next frame written by the client, or `None` once the client closed.
    pub async fn recv(&mut self) -> Option<WireFrame> {
        self.incoming.recv().await
    }

    /// Next frame as text; binary frames are lossily decoded.
    pub async fn recv_text(&mut self) -> Option<String> {
        match self.recv().await? {
            WireFrame::Text(text) => Some(text),
            WireFrame::Binary(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        }
    }

    /// Deliver a frame to the client. Returns `false` when the client is gone.
    pub fn send(&self, frame: WireFrame) -> bool {
        self.outgoing.as_ref().is_some_and(|tx| tx.send(frame).is_ok())
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.send(WireFrame::Text(text.into()))
    }

    /// Close the connection; the client's stream ends.
    pub fn close(&mut self) {
        self.outgoing = None;
    }
}

struct MemorySink {
    tx: Option<mpsc::UnboundedSender<WireFrame>>,
}

#[async_trait::async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(frame).map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }
}

struct MemoryStream {
    rx: mpsc::UnboundedReceiver<WireFrame>,
}

#[async_trait::async_trait]
impl FrameStream for MemoryStream {
    async fn next(&mut self) -> Option<Result<WireFrame, TransportError>> {
        self.rx.recv().await.map(Ok)
    }
}

#[cfg(test)]
#[path = "memory_test.rs"]
mod tests;
