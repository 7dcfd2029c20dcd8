//! # stream-voice
//!
//! **Note:** This crate is under active development. The API may change before 1.0.
//!
//! Real-time, full-duplex voice conversations with a conversational agent.
//!
//! `stream-voice` captures the microphone via CPAL, streams it over a
//! WebSocket as base64 PCM16, and plays the agent's spoken replies back on
//! the speaker. When the user talks over the agent, queued agent audio fades
//! out and is discarded so the conversation can move on.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use stream_voice::{
//!     event_callback, ConnectionTarget, ConversationEvent, ConversationManager, SessionConfig,
//! };
//!
//! let manager = ConversationManager::builder()
//!     .on_event(event_callback(|event| match event {
//!         ConversationEvent::Message { source, text } => println!("{source}: {text}"),
//!         ConversationEvent::ModeChanged(mode) => tracing::debug!(%mode, "mode"),
//!         other => tracing::trace!(?other, "conversation event"),
//!     }))
//!     .build();
//!
//! let session = manager
//!     .start_session(SessionConfig::new(ConnectionTarget::AgentId("agent_123".into())))
//!     .await?;
//!
//! // Talk...
//!
//! session.end().await;
//! ```
//!
//! ## Architecture
//!
//! The crate maintains a strict thread boundary:
//!
//! - **CPAL Threads**: Input and output callbacks that never block on the
//!   network
//! - **Ring Buffer**: Lock-free SPSC queue between the input callback and
//!   the capture bridge
//! - **Tokio Runtime**: One dispatch task per session owns the socket,
//!   sends captured chunks, and routes inbound frames to playback, sinks and
//!   the event callback
//!
//! Hardware and network sit behind the [`device::AudioBackend`] and
//! [`signaling::Connector`] traits; [`device::MockBackend`] and
//! [`signaling::MockConnector`] replace them in tests.

#![warn(missing_docs)]
// Audio code requires intentional numeric casts between sample formats
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_lossless
)]
// unwrap/expect allowed in tests only
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]
// These doc lints are too strict for internal implementation details
#![allow(clippy::missing_panics_doc, clippy::missing_errors_doc)]

mod builder;
mod chunk;
mod config;
pub mod device;
mod dispatch;
mod error;
mod event;
pub mod format;
mod pipeline;
mod session;
pub mod signaling;
mod sink;

pub use builder::{ConversationManager, ConversationManagerBuilder};
pub use chunk::AudioChunk;
pub use config::{ConnectionTarget, SessionConfig, UrlProvider, DEFAULT_ORIGIN};
pub use error::{SinkError, VoiceError};
pub use event::{
    event_callback, ConnectionStatus, ConversationEvent, ConversationMode, DebugEvent,
    DisconnectReason, EventCallback, MessageSource,
};
pub use session::{Session, SessionStats};
pub use sink::{ChannelSink, Sink};
