//! WebSocket transport over `tokio-tungstenite`.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::{FrameSink, FrameStream, Transport, TransportError, TransportParts};
use crate::codec::WireFrame;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens one websocket connection per `open()` call.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: String,
    default_path: Option<String>,
}

impl WebSocketTransport {
    /// Create a transport for `url`. `http(s)://` URLs are rewritten to `ws(s)://`.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), default_path: None }
    }

    /// Path to connect to when `url` is a bare base URL, e.g. `/api/websocket`.
    #[must_use]
    pub fn with_default_path(mut self, path: impl Into<String>) -> Self {
        self.default_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The websocket URL `open()` connects to.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connect`] for URLs with an unknown scheme.
    pub fn target(&self) -> Result<String, TransportError> {
        let url = ws_url(&self.url)?;
        Ok(match &self.default_path {
            Some(path) if !has_path(&url) => format!("{url}/{}", path.trim_start_matches('/')),
            _ => url,
        })
    }
}

/// `url` has already been through `ws_url`, so a trailing `/` is gone.
fn has_path(url: &str) -> bool {
    url.split_once("://").is_some_and(|(_, rest)| rest.contains('/'))
}

#[async_trait::async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self) -> Result<TransportParts, TransportError> {
        let url = self.target()?;
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        tracing::debug!(%url, "ws: connected");
        let (sink, stream) = stream.split();
        Ok(TransportParts { sink: Box::new(WsSink { inner: sink }), stream: Box::new(WsFrameStream { inner: stream }) })
    }

    fn endpoint(&self) -> String {
        self.url.clone()
    }
}

/// Convert an HTTP base URL into its websocket equivalent.
///
/// # Errors
///
/// Returns [`TransportError::Connect`] for URLs with an unknown scheme.
pub fn ws_url(url: &str) -> Result<String, TransportError> {
    let trimmed = url.trim_end_matches('/');
    if let Some(rest) = trimmed.strip_prefix("http://") {
        return Ok(format!("ws://{rest}"));
    }
    if let Some(rest) = trimmed.strip_prefix("https://") {
        return Ok(format!("wss://{rest}"));
    }
    if trimmed.starts_with("ws://") || trimmed.starts_with("wss://") {
        return Ok(trimmed.to_owned());
    }
    Err(TransportError::Connect(format!("invalid websocket url: {url}")))
}

struct WsSink {
    inner: SplitSink<WsStream, Message>,
}

#[async_trait::async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError> {
        let message = match frame {
            WireFrame::Text(text) => Message::Text(text.into()),
            WireFrame::Binary(bytes) => Message::Binary(bytes.into()),
        };
        self.inner.send(message).await.map_err(map_ws_error)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.close().await.map_err(map_ws_error)
    }
}

struct WsFrameStream {
    inner: SplitStream<WsStream>,
}

#[async_trait::async_trait]
impl FrameStream for WsFrameStream {
    async fn next(&mut self) -> Option<Result<WireFrame, TransportError>> {
        loop {
            let message = match self.inner.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(map_ws_error(e))),
            };
            match message {
                Message::Text(text) => return Some(Ok(WireFrame::Text(text.as_str().to_owned()))),
                Message::Binary(bytes) => return Some(Ok(WireFrame::Binary(bytes.to_vec()))),
                Message::Close(_) => return None,
                // tungstenite answers pings itself
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }
}

fn map_ws_error(err: tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error;
    match err {
        Error::ConnectionClosed | Error::AlreadyClosed => TransportError::Closed,
        Error::Io(e) => TransportError::Io(e),
        other => TransportError::Io(std::io::Error::other(other.to_string())),
    }
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
