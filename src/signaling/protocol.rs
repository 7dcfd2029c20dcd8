//! JSON wire format of the conversation socket.
//!
//! Inbound frames are tagged by a `type` field and carry their payload in a
//! kind-specific nested object (`audio_event`, `ping_event`, ...). Outbound
//! frames are either a bare `user_audio_chunk` or a typed `pong`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{AudioChunk, VoiceError};

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingEvent {
    /// Handshake. Must be the first frame on a connection.
    InitiationMetadata {
        /// Identifier assigned by the service.
        conversation_id: String,
        /// Agent audio format, e.g. `pcm_24000`.
        output_format: String,
    },
    /// The user cut the agent off. Audio older than `event_id` is stale.
    Interruption {
        /// Id of the interruption, when the service supplied one.
        event_id: Option<u64>,
    },
    /// Committed agent text.
    AgentResponse {
        /// The text.
        text: String,
    },
    /// Committed transcription of the user's speech.
    UserTranscript {
        /// The text.
        text: String,
    },
    /// In-progress agent text.
    TentativeAgentResponse {
        /// The text.
        text: String,
    },
    /// A slice of synthesized agent speech.
    Audio {
        /// Ordering id compared against the last interruption.
        event_id: u64,
        /// Little-endian PCM16 bytes.
        pcm: Vec<u8>,
    },
    /// Liveness probe; must be answered with a pong.
    Ping {
        /// Id to echo back.
        event_id: u64,
    },
    /// A well-formed frame of a kind not listed above.
    Unknown(Value),
}

#[derive(Deserialize)]
struct InitiationMetadataBody {
    conversation_id: String,
    agent_output_audio_format: String,
}

#[derive(Deserialize, Default)]
struct InterruptionBody {
    #[serde(default)]
    event_id: Option<u64>,
}

#[derive(Deserialize)]
struct AgentResponseBody {
    agent_response: String,
}

#[derive(Deserialize)]
struct UserTranscriptionBody {
    user_transcript: String,
}

#[derive(Deserialize)]
struct TentativeResponseBody {
    tentative_agent_response: String,
}

#[derive(Deserialize)]
struct AudioBody {
    event_id: u64,
    audio_base_64: String,
}

#[derive(Deserialize)]
struct PingBody {
    event_id: u64,
}

impl IncomingEvent {
    /// Decodes one text frame.
    ///
    /// # Errors
    ///
    /// Returns `MalformedMessage` when the frame is not JSON, has no `type`,
    /// or a known kind is missing required fields.
    pub fn decode(text: &str) -> Result<Self, VoiceError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| VoiceError::malformed(format!("invalid JSON: {e}")))?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| VoiceError::malformed("missing \"type\""))?;

        let event = match kind {
            "conversation_initiation_metadata" => {
                let body: InitiationMetadataBody =
                    body(&value, kind, "conversation_initiation_metadata_event")?;
                Self::InitiationMetadata {
                    conversation_id: body.conversation_id,
                    output_format: body.agent_output_audio_format,
                }
            }
            "interruption" => {
                let body: InterruptionBody = match value.get("interruption_event") {
                    Some(_) => body(&value, kind, "interruption_event")?,
                    None => InterruptionBody::default(),
                };
                Self::Interruption {
                    event_id: body.event_id,
                }
            }
            "agent_response" => {
                let body: AgentResponseBody = body(&value, kind, "agent_response_event")?;
                Self::AgentResponse {
                    text: body.agent_response,
                }
            }
            "user_transcript" => {
                let body: UserTranscriptionBody = body(&value, kind, "user_transcription_event")?;
                Self::UserTranscript {
                    text: body.user_transcript,
                }
            }
            "internal_tentative_agent_response" => {
                let body: TentativeResponseBody =
                    body(&value, kind, "tentative_agent_response_internal_event")?;
                Self::TentativeAgentResponse {
                    text: body.tentative_agent_response,
                }
            }
            "audio" => {
                let body: AudioBody = body(&value, kind, "audio_event")?;
                let pcm = STANDARD
                    .decode(body.audio_base_64.as_bytes())
                    .map_err(|e| VoiceError::malformed(format!("audio: invalid base64: {e}")))?;
                Self::Audio {
                    event_id: body.event_id,
                    pcm,
                }
            }
            "ping" => {
                let body: PingBody = body(&value, kind, "ping_event")?;
                Self::Ping {
                    event_id: body.event_id,
                }
            }
            _ => Self::Unknown(value),
        };
        Ok(event)
    }

    /// The frame's `type` tag.
    pub fn kind(&self) -> &str {
        match self {
            Self::InitiationMetadata { .. } => "conversation_initiation_metadata",
            Self::Interruption { .. } => "interruption",
            Self::AgentResponse { .. } => "agent_response",
            Self::UserTranscript { .. } => "user_transcript",
            Self::TentativeAgentResponse { .. } => "internal_tentative_agent_response",
            Self::Audio { .. } => "audio",
            Self::Ping { .. } => "ping",
            Self::Unknown(value) => value.get("type").and_then(Value::as_str).unwrap_or(""),
        }
    }
}

fn body<T: DeserializeOwned>(value: &Value, kind: &str, field: &str) -> Result<T, VoiceError> {
    let nested = value
        .get(field)
        .ok_or_else(|| VoiceError::malformed(format!("{kind}: missing \"{field}\"")))?;
    T::deserialize(nested).map_err(|e| VoiceError::malformed(format!("{kind}: {e}")))
}

/// Parses the sample rate out of a `pcm_<rate>` format string.
///
/// ```
/// use stream_voice::signaling::parse_pcm_rate;
///
/// assert_eq!(parse_pcm_rate("pcm_24000"), Some(24000));
/// assert_eq!(parse_pcm_rate("ulaw_8000"), None);
/// ```
pub fn parse_pcm_rate(format: &str) -> Option<u32> {
    format
        .strip_prefix("pcm_")?
        .parse::<u32>()
        .ok()
        .filter(|&rate| rate > 0)
}

/// A frame to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutgoingEvent {
    /// Captured microphone audio, base64 little-endian PCM16.
    UserAudioChunk(String),
    /// Reply to a ping.
    Pong {
        /// The ping's id.
        event_id: u64,
    },
}

impl OutgoingEvent {
    /// Wraps a captured chunk.
    pub fn user_audio(chunk: &AudioChunk) -> Self {
        Self::UserAudioChunk(STANDARD.encode(chunk.to_le_bytes()))
    }

    /// Serializes to a JSON text frame.
    pub fn encode(&self) -> String {
        let value = match self {
            Self::UserAudioChunk(audio) => json!({ "user_audio_chunk": audio }),
            Self::Pong { event_id } => json!({ "type": "pong", "event_id": event_id }),
        };
        value.to_string()
    }
}
