//! In-memory transport for testing without a network.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::{Connector, Transport};
use crate::VoiceError;

enum PeerFrame {
    Text(String),
    Fail(String),
    Close,
}

/// A connector that hands out in-memory connections whose far ends are
/// driven by [`MockPeer`]s, one connection per peer, in the order the peers
/// were created.
///
/// Frames the peer sends before the connection is opened are buffered, so a
/// test can script the handshake up front.
///
/// # Example
///
/// ```
/// use stream_voice::signaling::MockConnector;
///
/// let (connector, peer) = MockConnector::pair();
/// peer.send_handshake("abc", 24000);
/// assert_eq!(connector.connect_count(), 0);
/// ```
pub struct MockConnector {
    transports: Mutex<VecDeque<MockTransport>>,
    connects: AtomicUsize,
    last_url: Arc<Mutex<Option<String>>>,
}

/// The far end of a [`MockConnector`] connection.
pub struct MockPeer {
    inbound: mpsc::UnboundedSender<PeerFrame>,
    outbound: mpsc::UnboundedReceiver<String>,
    closes: Arc<AtomicUsize>,
    last_url: Arc<Mutex<Option<String>>>,
}

struct MockTransport {
    inbound: mpsc::UnboundedReceiver<PeerFrame>,
    outbound: mpsc::UnboundedSender<String>,
    closes: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl MockConnector {
    /// Creates a connector and the peer that drives its first connection.
    pub fn pair() -> (Self, MockPeer) {
        let connector = Self {
            transports: Mutex::new(VecDeque::new()),
            connects: AtomicUsize::new(0),
            last_url: Arc::new(Mutex::new(None)),
        };
        let peer = connector.add_peer();
        (connector, peer)
    }

    /// Queues one more connection and returns the peer that drives it.
    pub fn add_peer(&self) -> MockPeer {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let closes = Arc::new(AtomicUsize::new(0));

        self.transports.lock().push_back(MockTransport {
            inbound: inbound_rx,
            outbound: outbound_tx,
            closes: closes.clone(),
            closed: AtomicBool::new(false),
        });
        MockPeer {
            inbound: inbound_tx,
            outbound: outbound_rx,
            closes,
            last_url: self.last_url.clone(),
        }
    }

    /// Number of `connect` calls, successful or not.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, VoiceError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        *self.last_url.lock() = Some(url.to_string());
        match self.transports.lock().pop_front() {
            Some(transport) => Ok(Box::new(transport)),
            None => Err(VoiceError::handshake_failed("no mock connection left")),
        }
    }
}

impl MockPeer {
    /// Sends a raw text frame to the engine.
    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self.inbound.send(PeerFrame::Text(text.into()));
    }

    /// Sends a JSON frame to the engine.
    pub fn send_json(&self, value: &Value) {
        self.send_text(value.to_string());
    }

    /// Sends the `conversation_initiation_metadata` handshake.
    pub fn send_handshake(&self, conversation_id: &str, output_sample_rate: u32) {
        self.send_json(&json!({
            "type": "conversation_initiation_metadata",
            "conversation_initiation_metadata_event": {
                "conversation_id": conversation_id,
                "agent_output_audio_format": format!("pcm_{output_sample_rate}"),
            }
        }));
    }

    /// Fails the connection with a transport error.
    pub fn fail(&self, reason: impl Into<String>) {
        let _ = self.inbound.send(PeerFrame::Fail(reason.into()));
    }

    /// Closes the connection cleanly from the far end.
    pub fn close(&self) {
        let _ = self.inbound.send(PeerFrame::Close);
    }

    /// Waits for the next frame the engine sent, parsed as JSON.
    ///
    /// Returns `None` once the engine's side is gone.
    pub async fn recv(&mut self) -> Option<Value> {
        let text = self.outbound.recv().await?;
        Some(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }

    /// Returns every frame the engine has sent so far without waiting.
    pub fn drain(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(text) = self.outbound.try_recv() {
            frames.push(serde_json::from_str(&text).unwrap_or(Value::String(text)));
        }
        frames
    }

    /// Number of times the engine closed its side.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// URL of the last `connect` call.
    pub fn url(&self) -> Option<String> {
        self.last_url.lock().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, text: String) -> Result<(), VoiceError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(VoiceError::TransportError("connection closed".to_string()));
        }
        self.outbound
            .send(text)
            .map_err(|_| VoiceError::TransportError("peer gone".to_string()))
    }

    async fn next_frame(&mut self) -> Option<Result<String, VoiceError>> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        match self.inbound.recv().await? {
            PeerFrame::Text(text) => Some(Ok(text)),
            PeerFrame::Fail(reason) => Some(Err(VoiceError::TransportError(reason))),
            PeerFrame::Close => None,
        }
    }

    async fn close(&mut self) -> Result<(), VoiceError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let (connector, mut peer) = MockConnector::pair();
        peer.send_text("hello");

        let mut transport = connector.connect("ws://mock").await.unwrap();
        assert_eq!(transport.next_frame().await.unwrap().unwrap(), "hello");

        transport.send(r#"{"a":1}"#.to_string()).await.unwrap();
        assert_eq!(peer.recv().await, Some(json!({"a": 1})));
        assert_eq!(peer.url().as_deref(), Some("ws://mock"));
    }

    #[tokio::test]
    async fn test_second_connect_fails() {
        let (connector, _peer) = MockConnector::pair();
        let _first = connector.connect("ws://mock").await.unwrap();

        let second = connector.connect("ws://mock").await;
        assert!(matches!(second, Err(VoiceError::HandshakeFailed { .. })));
        assert_eq!(connector.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_added_peers_are_served_in_order() {
        let (connector, first) = MockConnector::pair();
        let second = connector.add_peer();
        first.send_text("one");
        second.send_text("two");

        let mut a = connector.connect("ws://mock/a").await.unwrap();
        let mut b = connector.connect("ws://mock/b").await.unwrap();
        assert_eq!(a.next_frame().await.unwrap().unwrap(), "one");
        assert_eq!(b.next_frame().await.unwrap().unwrap(), "two");
        assert_eq!(second.url().as_deref(), Some("ws://mock/b"));
        assert!(connector.connect("ws://mock").await.is_err());
    }

    #[tokio::test]
    async fn test_close_is_counted_once() {
        let (connector, peer) = MockConnector::pair();
        let mut transport = connector.connect("ws://mock").await.unwrap();

        transport.close().await.unwrap();
        transport.close().await.unwrap();

        assert_eq!(peer.close_count(), 1);
        assert!(transport.send("x".to_string()).await.is_err());
        assert!(transport.next_frame().await.is_none());
    }

    #[tokio::test]
    async fn test_peer_close_and_fail() {
        let (connector, peer) = MockConnector::pair();
        let mut transport = connector.connect("ws://mock").await.unwrap();

        peer.fail("reset by peer");
        assert!(matches!(
            transport.next_frame().await,
            Some(Err(VoiceError::TransportError(_)))
        ));

        peer.close();
        assert!(transport.next_frame().await.is_none());
    }
}
