//! Plain TCP transport with 4-byte little-endian length prefixes.
//!
//! Each frame on the wire is `len: i32 LE` followed by `len` bytes of body.
//! Declared lengths above the configured maximum are rejected before any body
//! bytes are read, since the stream cannot be trusted after that point.

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use super::{FrameSink, FrameStream, Transport, TransportError, TransportParts};
use crate::codec::WireFrame;

pub const MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct TcpTransport {
    addr: String,
    max_frame_len: usize,
}

impl TcpTransport {
    /// Create a transport for `addr` (`host:port`).
    #[must_use]
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into(), max_frame_len: MAX_FRAME_LEN }
    }

    #[must_use]
    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn open(&self) -> Result<TransportParts, TransportError> {
        let stream = TcpStream::connect(self.addr.as_str())
            .await
            .map_err(|e| TransportError::Connect(format!("{}: {e}", self.addr)))?;
        stream.set_nodelay(true)?;
        tracing::debug!(addr = %self.addr, "tcp: connected");
        let (reader, writer) = stream.into_split();
        let max = self.max_frame_len;
        Ok(TransportParts {
            sink: Box::new(TcpSink { writer, max }),
            stream: Box::new(TcpFrameStream { reader: BufReader::new(reader), max }),
        })
    }

    fn endpoint(&self) -> String {
        self.addr.clone()
    }
}

struct TcpSink {
    writer: OwnedWriteHalf,
    max: usize,
}

#[async_trait::async_trait]
impl FrameSink for TcpSink {
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError> {
        let body = match frame {
            WireFrame::Text(text) => text.into_bytes(),
            WireFrame::Binary(bytes) => bytes,
        };
        let len = u32::try_from(body.len())
            .ok()
            .filter(|_| body.len() <= self.max)
            .ok_or(TransportError::FrameTooLarge { size: body.len(), max: self.max })?;
        let mut packet = Vec::with_capacity(4 + body.len());
        packet.extend_from_slice(&len.to_le_bytes());
        packet.extend_from_slice(&body);
        self.writer.write_all(&packet).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

struct TcpFrameStream {
    reader: BufReader<OwnedReadHalf>,
    max: usize,
}

#[async_trait::async_trait]
impl FrameStream for TcpFrameStream {
    async fn next(&mut self) -> Option<Result<WireFrame, TransportError>> {
        let mut prefix = [0_u8; 4];
        match self.reader.read_exact(&mut prefix).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return None,
            Err(e) => return Some(Err(e.into())),
        }
        let len = u32::from_le_bytes(prefix) as usize;
        if len > self.max {
            return Some(Err(TransportError::FrameTooLarge { size: len, max: self.max }));
        }
        let mut body = vec![0_u8; len];
        if let Err(e) = self.reader.read_exact(&mut body).await {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                return Some(Err(TransportError::Closed));
            }
            return Some(Err(e.into()));
        }
        Some(Ok(WireFrame::Binary(body)))
    }
}

#[cfg(test)]
#[path = "tcp_test.rs"]
mod tests;
