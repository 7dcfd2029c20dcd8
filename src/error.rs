//! Error types for stream-voice.
//!
//! Errors are split into two categories:
//! - **Fatal errors** ([`VoiceError`]): Prevent a session from starting, or
//!   are returned from an explicit API call
//! - **Recoverable events**: Runtime issues surfaced via
//!   [`EventCallback`](crate::EventCallback) while the session keeps running

/// Errors produced by the conversation engine.
///
/// Startup failures are returned from
/// [`ConversationManager::start_session()`](crate::ConversationManager::start_session)
/// after every partially acquired resource has been released. Once a session
/// is running, the same variants are reported through
/// [`ConversationEvent::Error`](crate::ConversationEvent::Error) instead.
#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    /// A microphone or speaker could not be acquired.
    #[error("device unavailable: {name} - {reason}")]
    DeviceUnavailable {
        /// Name of the device (or "default input"/"default output").
        name: String,
        /// Reason the device is unavailable.
        reason: String,
    },

    /// The device only offers a sample format the backend cannot drive.
    #[error("unsupported sample format: {format}")]
    UnsupportedFormat {
        /// The format that wasn't supported.
        format: String,
    },

    /// The socket failed, closed, or sent something other than the
    /// initiation metadata before the handshake completed.
    #[error("handshake failed: {reason}")]
    HandshakeFailed {
        /// What went wrong during the handshake.
        reason: String,
    },

    /// The socket failed after the handshake.
    #[error("transport error: {0}")]
    TransportError(String),

    /// A frame could not be decoded.
    ///
    /// Never fatal on its own: the dispatcher reports it as a debug event
    /// and keeps the conversation going.
    #[error("malformed message: {reason}")]
    MalformedMessage {
        /// Why the frame was rejected.
        reason: String,
    },

    /// The collaborator that mints connection URLs failed.
    #[error("external call failed: {reason}")]
    ExternalCallFailed {
        /// Error reported by the collaborator.
        reason: String,
    },

    /// An audio sink failed during initialization.
    #[error("sink '{sink_name}' failed to start: {reason}")]
    SinkStartFailed {
        /// Name of the sink that failed.
        sink_name: String,
        /// Why the sink failed to start.
        reason: String,
    },

    /// The session has already ended.
    #[error("session closed")]
    SessionClosed,
}

impl VoiceError {
    /// Creates a `DeviceUnavailable` error.
    pub fn device_unavailable(name: impl Into<String>, reason: impl ToString) -> Self {
        Self::DeviceUnavailable {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    /// Creates a `HandshakeFailed` error.
    pub fn handshake_failed(reason: impl Into<String>) -> Self {
        Self::HandshakeFailed {
            reason: reason.into(),
        }
    }

    /// Creates a `MalformedMessage` error.
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedMessage {
            reason: reason.into(),
        }
    }

    /// Creates an `ExternalCallFailed` error.
    pub fn external_call_failed(reason: impl ToString) -> Self {
        Self::ExternalCallFailed {
            reason: reason.to_string(),
        }
    }
}

/// Errors that can occur within a [`Sink`](crate::Sink) implementation.
///
/// Sink errors are recoverable - the dispatcher emits a
/// [`ConversationEvent::SinkError`] and carries on with playback.
///
/// [`ConversationEvent::SinkError`]: crate::ConversationEvent::SinkError
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// A write operation failed.
    #[error("write failed: {reason}")]
    WriteFailed {
        /// Description of what went wrong.
        reason: String,
    },

    /// The receiving channel was closed.
    #[error("channel closed")]
    ChannelClosed,

    /// Custom error for user-implemented sinks.
    #[error("{0}")]
    Custom(String),
}

impl SinkError {
    /// Creates a custom sink error with the given message.
    pub fn custom(msg: impl Into<String>) -> Self {
        Self::Custom(msg.into())
    }

    /// Creates a write failed error with the given reason.
    pub fn write_failed(reason: impl Into<String>) -> Self {
        Self::WriteFailed {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_unavailable_display() {
        let err = VoiceError::device_unavailable("default input", "permission denied");
        assert_eq!(
            err.to_string(),
            "device unavailable: default input - permission denied"
        );
    }

    #[test]
    fn test_handshake_failed_display() {
        let err = VoiceError::handshake_failed("socket closed");
        assert_eq!(err.to_string(), "handshake failed: socket closed");
    }

    #[test]
    fn test_external_call_failed_display() {
        let err = VoiceError::external_call_failed("HTTP 403");
        assert_eq!(err.to_string(), "external call failed: HTTP 403");
    }

    #[test]
    fn test_sink_error_custom() {
        let err = SinkError::custom("avatar renderer offline");
        assert_eq!(err.to_string(), "avatar renderer offline");
    }

    #[test]
    fn test_sink_error_write_failed() {
        let err = SinkError::write_failed("buffer full");
        assert_eq!(err.to_string(), "write failed: buffer full");
    }
}
