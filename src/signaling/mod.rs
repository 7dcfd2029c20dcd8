//! Conversation socket: handshake, framing and the transport seam.
//!
//! A [`SignalingChannel`] wraps one [`Transport`]. [`SignalingChannel::connect`]
//! completes only after the service's `conversation_initiation_metadata`
//! handshake has been received and parsed; from then on the channel relays
//! decoded [`IncomingEvent`]s and encodes [`OutgoingEvent`]s.

mod mock;
mod protocol;
mod transport;

pub use mock::{MockConnector, MockPeer};
pub use protocol::{parse_pcm_rate, IncomingEvent, OutgoingEvent};
pub use transport::{Connector, Transport, WebSocketConnector};

use crate::VoiceError;

/// One connection to the conversation service.
pub struct SignalingChannel {
    transport: Box<dyn Transport>,
    conversation_id: String,
    output_sample_rate: u32,
    closed: bool,
}

impl SignalingChannel {
    /// Opens a connection and waits for the handshake.
    ///
    /// # Errors
    ///
    /// Returns `HandshakeFailed` if the connection cannot be opened, closes or
    /// errors before the handshake, or the first frame is not a valid
    /// `conversation_initiation_metadata` with a `pcm_<rate>` format.
    pub async fn connect(connector: &dyn Connector, url: &str) -> Result<Self, VoiceError> {
        let mut transport = connector.connect(url).await?;

        match handshake(&mut transport).await {
            Ok((conversation_id, output_sample_rate)) => {
                tracing::info!(
                    conversation_id = %conversation_id,
                    output_sample_rate,
                    "Handshake complete"
                );
                Ok(Self {
                    transport,
                    conversation_id,
                    output_sample_rate,
                    closed: false,
                })
            }
            Err(e) => {
                tracing::warn!("Handshake failed: {}", e);
                let _ = transport.close().await;
                Err(e)
            }
        }
    }

    /// Identifier the service assigned during the handshake.
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Sample rate of the agent's audio, from the handshake.
    pub fn output_sample_rate(&self) -> u32 {
        self.output_sample_rate
    }

    /// Sends one event.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the frame cannot be written, and
    /// `SessionClosed` after [`close`](Self::close).
    pub async fn send(&mut self, event: &OutgoingEvent) -> Result<(), VoiceError> {
        if self.closed {
            return Err(VoiceError::SessionClosed);
        }
        self.transport.send(event.encode()).await
    }

    /// Waits for the next inbound event.
    ///
    /// Yields `Some(Err(MalformedMessage))` for a frame that does not decode
    /// (the channel stays usable), `Some(Err(TransportError))` for a
    /// connection failure, and `None` once the connection is closed.
    pub async fn next_event(&mut self) -> Option<Result<IncomingEvent, VoiceError>> {
        if self.closed {
            return None;
        }
        match self.transport.next_frame().await? {
            Ok(text) => Some(IncomingEvent::decode(&text)),
            Err(e) => Some(Err(e)),
        }
    }

    /// Closes the connection. Safe to call more than once.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the close frame cannot be sent; the
    /// channel counts as closed either way.
    pub async fn close(&mut self) -> Result<(), VoiceError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.transport.close().await
    }
}

async fn handshake(transport: &mut Box<dyn Transport>) -> Result<(String, u32), VoiceError> {
    let frame = match transport.next_frame().await {
        Some(Ok(frame)) => frame,
        Some(Err(e)) => return Err(VoiceError::handshake_failed(e.to_string())),
        None => {
            return Err(VoiceError::handshake_failed(
                "connection closed before handshake",
            ))
        }
    };

    let event = IncomingEvent::decode(&frame)
        .map_err(|e| VoiceError::handshake_failed(e.to_string()))?;
    match event {
        IncomingEvent::InitiationMetadata {
            conversation_id,
            output_format,
        } => {
            let rate = parse_pcm_rate(&output_format).ok_or_else(|| {
                VoiceError::handshake_failed(format!(
                    "unsupported output format \"{output_format}\""
                ))
            })?;
            Ok((conversation_id, rate))
        }
        other => Err(VoiceError::handshake_failed(format!(
            "expected conversation_initiation_metadata, got \"{}\"",
            other.kind()
        ))),
    }
}
