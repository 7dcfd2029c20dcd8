//! Session state enums and the notifications a session emits.
//!
//! Notifications are delivered through one [`EventCallback`]. They describe
//! what happened; the session keeps running after every event except
//! [`ConversationEvent::Disconnected`].

use std::fmt;
use std::sync::Arc;

/// Socket lifecycle of a session.
///
/// Transitions are linear: `Connecting → Connected → Disconnecting →
/// Disconnected`. A failed start jumps straight to `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    /// Devices and socket are being opened.
    #[default]
    Connecting,
    /// Handshake completed, audio flowing.
    Connected,
    /// Shutdown in progress.
    Disconnecting,
    /// Terminal.
    Disconnected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
            Self::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Turn-taking state of the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConversationMode {
    /// The agent is silent; the user may speak.
    #[default]
    Listening,
    /// Agent audio is queued or playing.
    Speaking,
    /// The agent was cut off; its audio is fading out.
    Interrupted,
}

impl fmt::Display for ConversationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Listening => "listening",
            Self::Speaking => "speaking",
            Self::Interrupted => "interrupted",
        };
        f.write_str(s)
    }
}

/// Who produced a committed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSource {
    /// The remote agent ("ai").
    Ai,
    /// The local user's recognised speech ("user").
    User,
}

impl fmt::Display for MessageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ai => "ai",
            Self::User => "user",
        })
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// [`Session::end()`](crate::Session::end) was called.
    User,
    /// The service closed the socket.
    Remote,
    /// A transport or device failure ended the session.
    Error(String),
}

/// Diagnostic-only notifications. Never part of the committed transcript.
#[derive(Debug, Clone, PartialEq)]
pub enum DebugEvent {
    /// The agent's in-progress, uncommitted response text.
    TentativeAgentResponse(String),
    /// A well-formed frame of a kind the engine does not act on.
    Unhandled(serde_json::Value),
    /// A frame that could not be decoded.
    MalformedFrame {
        /// Why decoding failed.
        reason: String,
    },
}

/// Notifications emitted by a running session.
///
/// # Example
///
/// ```
/// use stream_voice::{ConversationEvent, MessageSource};
///
/// fn handle_event(event: ConversationEvent) {
///     match event {
///         ConversationEvent::Message { source: MessageSource::Ai, text } => {
///             println!("agent: {text}");
///         }
///         ConversationEvent::Message { source: MessageSource::User, text } => {
///             println!("you: {text}");
///         }
///         ConversationEvent::Error { message } => eprintln!("error: {message}"),
///         _ => {}
///     }
/// }
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationEvent {
    /// Connection status changed.
    StatusChanged(ConnectionStatus),
    /// Conversation mode changed. Only fired on actual transitions.
    ModeChanged(ConversationMode),
    /// The handshake completed.
    Connected {
        /// Identifier assigned by the service.
        conversation_id: String,
    },
    /// The session ended.
    Disconnected {
        /// Why it ended.
        reason: DisconnectReason,
    },
    /// A committed message from the agent or the user.
    Message {
        /// Who said it.
        source: MessageSource,
        /// The text.
        text: String,
    },
    /// Diagnostic information.
    Debug(DebugEvent),
    /// A steady-state failure. The message is suitable for display as-is.
    Error {
        /// Description of the failure.
        message: String,
    },
    /// An audio sink rejected a chunk. Playback is unaffected.
    SinkError {
        /// Name of the sink that errored.
        sink_name: String,
        /// Description of the error.
        error: String,
    },
}

/// Callback type for receiving session notifications.
///
/// Register one via [`ConversationManagerBuilder::on_event()`].
///
/// [`ConversationManagerBuilder::on_event()`]: crate::ConversationManagerBuilder::on_event
pub type EventCallback = Arc<dyn Fn(ConversationEvent) + Send + Sync>;

/// Creates an [`EventCallback`] from a closure.
///
/// # Example
///
/// ```
/// use stream_voice::{event_callback, ConversationEvent};
///
/// let callback = event_callback(|event| {
///     println!("Got event: {:?}", event);
/// });
/// ```
pub fn event_callback<F>(f: F) -> EventCallback
where
    F: Fn(ConversationEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(ConnectionStatus::Connecting.to_string(), "connecting");
        assert_eq!(ConnectionStatus::Disconnected.to_string(), "disconnected");
    }

    #[test]
    fn test_mode_default_is_listening() {
        assert_eq!(ConversationMode::default(), ConversationMode::Listening);
        assert_eq!(ConversationMode::Interrupted.to_string(), "interrupted");
    }

    #[test]
    fn test_message_source_tags() {
        assert_eq!(MessageSource::Ai.to_string(), "ai");
        assert_eq!(MessageSource::User.to_string(), "user");
    }

    #[test]
    fn test_event_clone() {
        let event = ConversationEvent::SinkError {
            sink_name: "avatar".to_string(),
            error: "disconnected".to_string(),
        };
        let cloned = event.clone();
        assert_eq!(cloned, event);
    }

    #[test]
    fn test_event_callback_helper() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let called = Arc::new(AtomicBool::new(false));
        let called_clone = called.clone();

        let callback = event_callback(move |_| {
            called_clone.store(true, Ordering::SeqCst);
        });

        callback(ConversationEvent::StatusChanged(ConnectionStatus::Connected));
        assert!(called.load(Ordering::SeqCst));
    }
}
