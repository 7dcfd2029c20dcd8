//! Sink trait for forwarding agent audio to an external consumer.
//!
//! Every accepted inbound `audio` frame is decoded into an [`AudioChunk`] and
//! handed to each registered [`Sink`] before it is queued for playback. The
//! typical consumer is an avatar renderer that lip-syncs to the agent's
//! voice; [`ChannelSink`] covers the common case of handing chunks to
//! another task.
//!
//! You can implement the [`Sink`] trait for custom destinations.

mod channel;

pub use channel::ChannelSink;

use crate::{AudioChunk, SinkError};
use async_trait::async_trait;

/// A destination for agent audio.
///
/// # Implementation Notes
///
/// - Methods take `&self` - use interior mutability (`Mutex`, `RwLock`) if needed
/// - All methods are async and run on the session's dispatch task, so a
///   slow `write` delays event handling
/// - `on_start` is called during session startup; an error aborts the start
/// - `on_stop` is called when the session ends, whatever the reason
///
/// # Example
///
/// ```
/// use stream_voice::{Sink, AudioChunk, SinkError};
/// use async_trait::async_trait;
///
/// struct PrintSink {
///     name: String,
/// }
///
/// #[async_trait]
/// impl Sink for PrintSink {
///     fn name(&self) -> &str {
///         &self.name
///     }
///
///     async fn write(&self, chunk: &AudioChunk) -> Result<(), SinkError> {
///         println!("Agent said {} bytes of PCM", chunk.to_le_bytes().len());
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Sink: Send + Sync {
    /// Human-readable name for logging and error messages.
    fn name(&self) -> &str;

    /// Called once while the session starts, before any audio flows.
    ///
    /// Errors here are fatal: the start unwinds and returns
    /// [`VoiceError::SinkStartFailed`](crate::VoiceError::SinkStartFailed).
    ///
    /// Default implementation does nothing.
    async fn on_start(&self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Receives one chunk of agent audio.
    ///
    /// Errors are recoverable: the session emits
    /// [`ConversationEvent::SinkError`] and keeps playing.
    ///
    /// [`ConversationEvent::SinkError`]: crate::ConversationEvent::SinkError
    async fn write(&self, chunk: &AudioChunk) -> Result<(), SinkError>;

    /// Called once when the session ends.
    ///
    /// Default implementation does nothing.
    async fn on_stop(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingSink {
        name: String,
        count: AtomicUsize,
    }

    impl CountingSink {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                count: AtomicUsize::new(0),
            }
        }

        fn count(&self) -> usize {
            self.count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Sink for CountingSink {
        fn name(&self) -> &str {
            &self.name
        }

        async fn write(&self, _chunk: &AudioChunk) -> Result<(), SinkError> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_sink_lifecycle() {
        let sink = CountingSink::new("test");

        sink.on_start().await.unwrap();

        let chunk = AudioChunk::new(vec![0i16; 100], 24000);
        sink.write(&chunk).await.unwrap();
        sink.write(&chunk).await.unwrap();

        assert_eq!(sink.count(), 2);

        sink.on_stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_sink_name() {
        let sink = CountingSink::new("avatar");
        assert_eq!(sink.name(), "avatar");
    }

    #[test]
    fn test_sink_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Arc<dyn Sink>>();
    }
}
