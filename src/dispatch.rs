//! Session dispatch task.
//!
//! One task per session owns the socket and both audio pipelines. It
//! multiplexes five inputs in priority order:
//!
//! 1. commands from the [`Session`](crate::Session) handle
//! 2. device errors reported by the audio callbacks
//! 3. inbound socket frames
//! 4. playback progress from the output callback
//! 5. captured microphone chunks
//!
//! plus the timer that ends an interruption fade. Everything that touches the
//! socket happens here, so outbound frames never interleave.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::pipeline::{CapturePipeline, CapturedAudio, PlaybackPipeline, PlaybackSignal};
use crate::session::{Command, SessionState};
use crate::signaling::{IncomingEvent, OutgoingEvent, SignalingChannel};
use crate::{
    AudioChunk, ConnectionStatus, ConversationEvent, ConversationMode, DebugEvent,
    DisconnectReason, MessageSource, SessionConfig, Sink, VoiceError,
};

/// Receiving ends of the channels feeding a dispatcher.
pub(crate) struct DispatchInputs {
    pub commands: mpsc::UnboundedReceiver<Command>,
    pub device_errors: mpsc::UnboundedReceiver<String>,
    pub playback_signals: mpsc::UnboundedReceiver<PlaybackSignal>,
    pub captured: mpsc::Receiver<CapturedAudio>,
}

/// Why the loop stopped, and who is waiting for it.
type Exit = (DisconnectReason, Option<oneshot::Sender<()>>);

pub(crate) struct Dispatcher {
    channel: SignalingChannel,
    capture: CapturePipeline,
    playback: PlaybackPipeline,
    sinks: Vec<Arc<dyn Sink>>,
    state: Arc<SessionState>,
    inputs: DispatchInputs,
    output_sample_rate: u32,
    fade_duration: Duration,
    fade_floor: f32,
    /// Highest interruption event id seen; audio below it is stale.
    last_interrupt_id: u64,
    fade_deadline: Option<Instant>,
}

impl Dispatcher {
    pub fn new(
        channel: SignalingChannel,
        capture: CapturePipeline,
        playback: PlaybackPipeline,
        sinks: Vec<Arc<dyn Sink>>,
        state: Arc<SessionState>,
        config: &SessionConfig,
        inputs: DispatchInputs,
    ) -> Self {
        Self {
            output_sample_rate: channel.output_sample_rate(),
            channel,
            capture,
            playback,
            sinks,
            state,
            inputs,
            fade_duration: config.fade_duration,
            fade_floor: config.fade_floor,
            last_interrupt_id: 0,
            fade_deadline: None,
        }
    }

    /// Runs until the session ends, then releases every resource.
    pub async fn run(mut self) {
        let (reason, done) = self.event_loop().await;
        self.shutdown(reason).await;
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    async fn event_loop(&mut self) -> Exit {
        loop {
            let fade_deadline = self.fade_deadline;

            tokio::select! {
                biased;

                Some(command) = self.inputs.commands.recv() => match command {
                    Command::SetVolume(level) => self.apply_volume(level),
                    Command::Stop { reason, done } => return (reason, Some(done)),
                },

                Some(message) = self.inputs.device_errors.recv() => {
                    return self.fail(VoiceError::device_unavailable("audio device", message));
                }

                frame = self.channel.next_event() => match frame {
                    Some(Ok(event)) => {
                        if let Err(e) = self.handle_event(event).await {
                            return self.fail(e);
                        }
                    }
                    Some(Err(VoiceError::MalformedMessage { reason })) => self.malformed(reason),
                    Some(Err(e)) => return self.fail(e),
                    None => {
                        tracing::info!("Conversation closed by remote");
                        return (DisconnectReason::Remote, None);
                    }
                },

                Some(signal) = self.inputs.playback_signals.recv() => match signal {
                    // A late signal must not override audio queued since.
                    PlaybackSignal::Finished => {
                        if self.playback.is_idle() {
                            self.state.set_mode(ConversationMode::Listening);
                        }
                    }
                },

                Some(captured) = self.inputs.captured.recv() => {
                    if let Err(e) = self.send_captured(captured).await {
                        return self.fail(e);
                    }
                }

                () = fade_elapsed(fade_deadline) => self.finish_fade(),
            }
        }
    }

    async fn handle_event(&mut self, event: IncomingEvent) -> Result<(), VoiceError> {
        match event {
            IncomingEvent::Interruption { event_id } => self.interrupt(event_id),
            IncomingEvent::AgentResponse { text } => {
                self.state.emit(ConversationEvent::Message {
                    source: MessageSource::Ai,
                    text,
                });
            }
            IncomingEvent::UserTranscript { text } => {
                self.state.emit(ConversationEvent::Message {
                    source: MessageSource::User,
                    text,
                });
            }
            IncomingEvent::TentativeAgentResponse { text } => {
                self.state.emit(ConversationEvent::Debug(
                    DebugEvent::TentativeAgentResponse(text),
                ));
            }
            IncomingEvent::Audio { event_id, pcm } => self.play(event_id, &pcm).await,
            IncomingEvent::Ping { event_id } => {
                self.channel.send(&OutgoingEvent::Pong { event_id }).await?;
            }
            // Only meaningful as the handshake.
            IncomingEvent::InitiationMetadata {
                conversation_id,
                output_format,
            } => {
                self.state.emit(ConversationEvent::Debug(DebugEvent::Unhandled(json!({
                    "type": "conversation_initiation_metadata",
                    "conversation_initiation_metadata_event": {
                        "conversation_id": conversation_id,
                        "agent_output_audio_format": output_format,
                    }
                }))));
            }
            IncomingEvent::Unknown(value) => {
                self.state
                    .emit(ConversationEvent::Debug(DebugEvent::Unhandled(value)));
            }
        }
        Ok(())
    }

    fn interrupt(&mut self, event_id: Option<u64>) {
        if let Some(id) = event_id {
            self.last_interrupt_id = self.last_interrupt_id.max(id);
        }
        self.state.interruptions.fetch_add(1, Ordering::SeqCst);
        tracing::info!(?event_id, "Agent interrupted");

        self.state.set_mode(ConversationMode::Interrupted);
        self.state.set_mode(ConversationMode::Listening);

        self.playback.interrupt();
        self.playback.ramp_gain(self.fade_floor, self.fade_duration);
        self.fade_deadline = Some(Instant::now() + self.fade_duration);
    }

    async fn play(&mut self, event_id: u64, pcm: &[u8]) {
        self.state
            .audio_events_received
            .fetch_add(1, Ordering::SeqCst);

        if event_id < self.last_interrupt_id {
            self.state.stale_audio_dropped.fetch_add(1, Ordering::SeqCst);
            tracing::debug!(
                event_id,
                last_interrupt_id = self.last_interrupt_id,
                "Dropping audio from interrupted turn"
            );
            return;
        }

        let chunk = AudioChunk::from_le_bytes(pcm, self.output_sample_rate);

        for sink in &self.sinks {
            if let Err(e) = sink.write(&chunk).await {
                tracing::warn!("Sink '{}' write error: {}", sink.name(), e);
                self.state.emit(ConversationEvent::SinkError {
                    sink_name: sink.name().to_string(),
                    error: e.to_string(),
                });
            }
        }

        // Audio from a new turn ends any fade and drops what it was fading.
        self.fade_deadline = None;
        self.playback.set_gain(self.state.volume());
        self.playback.clear_interrupted();
        self.playback.enqueue(chunk);
        self.state.set_mode(ConversationMode::Speaking);
    }

    fn apply_volume(&mut self, level: f32) {
        if self.fade_deadline.is_none() {
            self.playback.set_gain(level);
        }
    }

    fn finish_fade(&mut self) {
        self.fade_deadline = None;
        self.playback.set_gain(self.state.volume());
        if self.playback.clear_interrupted() {
            tracing::debug!("Flushed interrupted agent audio");
        }
    }

    async fn send_captured(&mut self, captured: CapturedAudio) -> Result<(), VoiceError> {
        self.state.set_last_input_rms(captured.rms);
        if self.state.status() != ConnectionStatus::Connected {
            return Ok(());
        }

        self.channel
            .send(&OutgoingEvent::user_audio(&captured.chunk))
            .await?;

        let sent = self.state.chunks_sent.fetch_add(1, Ordering::SeqCst) + 1;
        if sent % 50 == 0 {
            tracing::debug!("Dispatcher: sent {} chunks", sent);
        }
        Ok(())
    }

    fn malformed(&self, reason: String) {
        tracing::warn!("Ignoring malformed frame: {}", reason);
        self.state.malformed_frames.fetch_add(1, Ordering::SeqCst);
        self.state
            .emit(ConversationEvent::Debug(DebugEvent::MalformedFrame { reason }));
    }

    fn fail(&self, error: VoiceError) -> Exit {
        let message = error.to_string();
        tracing::error!("Session failed: {}", message);
        self.state.emit(ConversationEvent::Error {
            message: message.clone(),
        });
        (DisconnectReason::Error(message), None)
    }

    async fn shutdown(&mut self, reason: DisconnectReason) {
        tracing::info!(?reason, "Ending session");
        self.state.begin_disconnect();

        if let Err(e) = self.channel.close().await {
            tracing::debug!("Socket close failed: {}", e);
        }
        self.capture.close().await;
        self.playback.close();

        for sink in &self.sinks {
            if let Err(e) = sink.on_stop().await {
                tracing::warn!("Sink '{}' stop error: {}", sink.name(), e);
                self.state.emit(ConversationEvent::SinkError {
                    sink_name: sink.name().to_string(),
                    error: e.to_string(),
                });
            }
        }

        self.state.set_mode(ConversationMode::Listening);
        self.state.set_status(ConnectionStatus::Disconnected);
        self.state
            .emit(ConversationEvent::Disconnected { reason });

        let stats = self.state.stats();
        tracing::info!(
            "Session ended: {} chunks sent, {} audio events received",
            stats.chunks_sent,
            stats.audio_events_received
        );
    }
}

async fn fade_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
