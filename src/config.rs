//! Configuration types for conversation sessions.

use std::time::Duration;

use async_trait::async_trait;

/// Default service endpoint used to build a URL from a bare agent id.
pub const DEFAULT_ORIGIN: &str = "wss://api.elevenlabs.io";

/// Path of the conversation endpoint below the origin.
const CONVERSATION_PATH: &str = "/v1/convai/conversation";

/// Where to connect a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionTarget {
    /// A ready-to-use (usually pre-signed) socket URL.
    SignedUrl(String),
    /// An agent identifier.
    ///
    /// Resolved through the manager's [`UrlProvider`] when one is configured,
    /// otherwise formatted against [`SessionConfig::origin`].
    AgentId(String),
}

/// Mints connection URLs for agents.
///
/// This is the seam for the HTTP call that exchanges an agent id for a
/// signed URL. Errors surface as
/// [`VoiceError::ExternalCallFailed`](crate::VoiceError::ExternalCallFailed)
/// from `start_session`.
///
/// # Example
///
/// ```
/// use async_trait::async_trait;
/// use stream_voice::UrlProvider;
///
/// struct StaticUrl(String);
///
/// #[async_trait]
/// impl UrlProvider for StaticUrl {
///     async fn connection_url(&self, _agent_id: &str) -> Result<String, String> {
///         Ok(self.0.clone())
///     }
/// }
/// ```
#[async_trait]
pub trait UrlProvider: Send + Sync {
    /// Returns a socket URL for `agent_id`, or a description of the failure.
    async fn connection_url(&self, agent_id: &str) -> Result<String, String>;
}

/// Configuration for a single session.
///
/// Use [`SessionConfig::new()`] or struct update syntax over
/// [`SessionConfig::default()`].
///
/// # Example
///
/// ```
/// use stream_voice::{ConnectionTarget, SessionConfig};
/// use std::time::Duration;
///
/// let config = SessionConfig {
///     volume: 0.8,
///     fade_duration: Duration::from_secs(1),
///     ..SessionConfig::new(ConnectionTarget::AgentId("agent_123".into()))
/// };
/// assert_eq!(config.chunk_threshold(), 4000);
/// ```
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Where to connect.
    pub target: ConnectionTarget,

    /// Service origin used when formatting a URL from an agent id.
    ///
    /// Default: [`DEFAULT_ORIGIN`]
    pub origin: String,

    /// Playback gain. 1.0 is unity; values above 1.0 amplify.
    ///
    /// Default: 1.0
    pub volume: f32,

    /// Sample rate captured audio is converted to before sending.
    ///
    /// Default: 16000
    pub input_sample_rate: u32,

    /// Captured audio is sent in chunks of `input_sample_rate / chunk_divisor`
    /// samples.
    ///
    /// Default: 4 (250ms chunks)
    pub chunk_divisor: u32,

    /// Length of the fade-out applied when the agent is interrupted. Queued
    /// agent audio is flushed when it elapses.
    ///
    /// Default: 2 seconds
    pub fade_duration: Duration,

    /// Gain the fade-out ramps toward.
    ///
    /// Default: 0.0001
    pub fade_floor: f32,

    /// How often the capture bridge drains the microphone buffer.
    ///
    /// Default: 20ms
    pub poll_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            target: ConnectionTarget::SignedUrl(String::new()),
            origin: DEFAULT_ORIGIN.to_string(),
            volume: 1.0,
            input_sample_rate: 16000,
            chunk_divisor: 4,
            fade_duration: Duration::from_secs(2),
            fade_floor: 0.0001,
            poll_interval: Duration::from_millis(20),
        }
    }
}

impl SessionConfig {
    /// Creates a configuration for `target` with default settings.
    pub fn new(target: ConnectionTarget) -> Self {
        Self {
            target,
            ..Self::default()
        }
    }

    /// Number of captured samples per outbound chunk.
    #[must_use]
    pub fn chunk_threshold(&self) -> usize {
        (self.input_sample_rate / self.chunk_divisor.max(1)).max(1) as usize
    }

    /// Playback gain a session starts at. Negative and non-finite values
    /// are ignored in favour of the default gain of 1.0.
    #[must_use]
    pub fn initial_volume(&self) -> f32 {
        if is_valid_volume(self.volume) {
            self.volume
        } else {
            tracing::warn!(level = self.volume, "Ignoring invalid volume, using 1.0");
            1.0
        }
    }

    /// Socket URL for an agent id on the configured origin. The id is
    /// percent-encoded.
    #[must_use]
    pub fn agent_url(&self, agent_id: &str) -> String {
        format!(
            "{}{}?agent_id={}",
            self.origin.trim_end_matches('/'),
            CONVERSATION_PATH,
            urlencoding::encode(agent_id)
        )
    }
}

/// Playback gains must be finite and non-negative.
pub(crate) fn is_valid_volume(level: f32) -> bool {
    level.is_finite() && level >= 0.0
}
