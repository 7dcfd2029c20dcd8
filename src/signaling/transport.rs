//! Message transport seam and its WebSocket implementation.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::VoiceError;

/// One open, bidirectional text-frame connection.
#[async_trait]
pub trait Transport: Send {
    /// Sends one text frame.
    async fn send(&mut self, text: String) -> Result<(), VoiceError>;

    /// Waits for the next text frame. `None` once the peer closed the
    /// connection cleanly.
    async fn next_frame(&mut self) -> Option<Result<String, VoiceError>>;

    /// Closes the connection. Safe to call more than once.
    async fn close(&mut self) -> Result<(), VoiceError>;
}

/// Opens transports.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a connection to `url`.
    ///
    /// # Errors
    ///
    /// Returns `HandshakeFailed` when the connection cannot be established.
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, VoiceError>;
}

/// Connects over WebSocket (`ws://` or `wss://`).
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, VoiceError> {
        let (stream, response) = connect_async(url)
            .await
            .map_err(|e| VoiceError::handshake_failed(format!("connect failed: {e}")))?;
        tracing::debug!(status = %response.status(), "WebSocket connected");
        Ok(Box::new(WebSocketTransport {
            stream,
            closed: false,
        }))
    }
}

struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    closed: bool,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, text: String) -> Result<(), VoiceError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| VoiceError::TransportError(e.to_string()))
    }

    async fn next_frame(&mut self) -> Option<Result<String, VoiceError>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                    return None;
                }
                Err(e) => return Some(Err(VoiceError::TransportError(e.to_string()))),
            };

            match message {
                Message::Text(text) => return Some(Ok(text)),
                Message::Binary(bytes) => {
                    return Some(Ok(String::from_utf8_lossy(&bytes).into_owned()));
                }
                Message::Close(frame) => {
                    tracing::debug!(?frame, "WebSocket closed by peer");
                    return None;
                }
                // Control frames are answered by tungstenite itself.
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }

    async fn close(&mut self) -> Result<(), VoiceError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match self.stream.close(None).await {
            Ok(())
            | Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                Ok(())
            }
            Err(e) => Err(VoiceError::TransportError(e.to_string())),
        }
    }
}
