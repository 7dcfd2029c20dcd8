//! Tokio mpsc channel sink implementation.

use crate::sink::Sink;
use crate::{AudioChunk, SinkError};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// A sink that sends agent audio chunks to a tokio mpsc channel.
///
/// # Example
///
/// ```
/// use stream_voice::{AudioChunk, ChannelSink};
/// use tokio::sync::mpsc;
///
/// let (tx, mut rx) = mpsc::channel::<AudioChunk>(100);
/// let sink = ChannelSink::with_name("avatar", tx);
///
/// // Register with ConversationManager::builder().add_sink(..), then:
/// // while let Some(chunk) = rx.recv().await { renderer.push(&chunk.to_le_bytes()) }
/// ```
pub struct ChannelSink {
    name: String,
    sender: mpsc::Sender<AudioChunk>,
}

impl ChannelSink {
    /// Creates a new channel sink with the given sender.
    ///
    /// A full channel makes `write` wait, which stalls the session's event
    /// handling. Size the buffer for the consumer's worst-case lag.
    pub fn new(sender: mpsc::Sender<AudioChunk>) -> Self {
        Self {
            name: "channel".to_string(),
            sender,
        }
    }

    /// Creates a new channel sink with a custom name.
    pub fn with_name(name: impl Into<String>, sender: mpsc::Sender<AudioChunk>) -> Self {
        Self {
            name: name.into(),
            sender,
        }
    }
}

#[async_trait]
impl Sink for ChannelSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&self, chunk: &AudioChunk) -> Result<(), SinkError> {
        self.sender
            .send(chunk.clone())
            .await
            .map_err(|_| SinkError::ChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_sink_sends_chunks() {
        let (tx, mut rx) = mpsc::channel::<AudioChunk>(10);
        let sink = ChannelSink::new(tx);

        let chunk = AudioChunk::new(vec![1, 2, 3], 24000);
        sink.write(&chunk).await.unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(*received.samples, vec![1, 2, 3]);
        assert_eq!(received.to_le_bytes(), vec![1, 0, 2, 0, 3, 0]);
    }

    #[tokio::test]
    async fn test_channel_sink_closed() {
        let (tx, rx) = mpsc::channel::<AudioChunk>(10);
        let sink = ChannelSink::new(tx);

        drop(rx);

        let chunk = AudioChunk::new(vec![1, 2, 3], 24000);
        let result = sink.write(&chunk).await;

        assert!(matches!(result, Err(SinkError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_channel_sink_custom_name() {
        let (tx, _rx) = mpsc::channel::<AudioChunk>(10);
        let sink = ChannelSink::with_name("avatar", tx);
        assert_eq!(sink.name(), "avatar");
    }
}
