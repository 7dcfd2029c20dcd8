//! Conversation session management.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;

use crate::config::is_valid_volume;
use crate::format::VolumeMeter;
use crate::{
    ConnectionStatus, ConversationEvent, ConversationMode, DisconnectReason, EventCallback,
};

/// Statistics about a conversation session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Captured chunks sent to the service.
    pub chunks_sent: u64,
    /// Inbound `audio` frames received, including stale ones.
    pub audio_events_received: u64,
    /// Inbound `audio` frames dropped as older than the last interruption.
    pub stale_audio_dropped: u64,
    /// Interruptions received.
    pub interruptions: u64,
    /// Inbound frames that failed to decode.
    pub malformed_frames: u64,
}

/// Requests from the public handle to the dispatch task.
pub(crate) enum Command {
    SetVolume(f32),
    Stop {
        reason: DisconnectReason,
        done: oneshot::Sender<()>,
    },
}

/// Internal state shared between Session and the dispatch task.
pub(crate) struct SessionState {
    status: Mutex<ConnectionStatus>,
    mode: Mutex<ConversationMode>,
    volume: Mutex<f32>,
    last_input_rms: Mutex<f32>,
    pub chunks_sent: AtomicU64,
    pub audio_events_received: AtomicU64,
    pub stale_audio_dropped: AtomicU64,
    pub interruptions: AtomicU64,
    pub malformed_frames: AtomicU64,
    event_callback: Option<EventCallback>,
    teardown: Notify,
}

impl SessionState {
    pub fn new(event_callback: Option<EventCallback>, volume: f32) -> Self {
        Self {
            status: Mutex::new(ConnectionStatus::Connecting),
            mode: Mutex::new(ConversationMode::Listening),
            volume: Mutex::new(volume),
            last_input_rms: Mutex::new(0.0),
            chunks_sent: AtomicU64::new(0),
            audio_events_received: AtomicU64::new(0),
            stale_audio_dropped: AtomicU64::new(0),
            interruptions: AtomicU64::new(0),
            malformed_frames: AtomicU64::new(0),
            event_callback,
            teardown: Notify::new(),
        }
    }

    /// Emits an event via the callback if registered.
    pub fn emit(&self, event: ConversationEvent) {
        if let Some(ref callback) = self.event_callback {
            callback(event);
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.lock()
    }

    /// Moves to `status`, notifying only on an actual change.
    pub fn set_status(&self, status: ConnectionStatus) {
        let previous = std::mem::replace(&mut *self.status.lock(), status);
        if previous != status {
            tracing::debug!(from = %previous, to = %status, "Status changed");
            if status == ConnectionStatus::Disconnected {
                self.teardown.notify_waiters();
            }
            self.emit(ConversationEvent::StatusChanged(status));
        }
    }

    /// Resolves once the status reaches `disconnected`.
    pub async fn disconnected(&self) {
        loop {
            let notified = self.teardown.notified();
            if self.status() == ConnectionStatus::Disconnected {
                return;
            }
            notified.await;
        }
    }

    /// Moves `connected` to `disconnecting`. Returns `false` from any other
    /// status.
    pub fn begin_disconnect(&self) -> bool {
        {
            let mut status = self.status.lock();
            if *status != ConnectionStatus::Connected {
                return false;
            }
            *status = ConnectionStatus::Disconnecting;
        }
        self.emit(ConversationEvent::StatusChanged(
            ConnectionStatus::Disconnecting,
        ));
        true
    }

    pub fn mode(&self) -> ConversationMode {
        *self.mode.lock()
    }

    /// Moves to `mode`, notifying only on an actual change.
    pub fn set_mode(&self, mode: ConversationMode) {
        let previous = std::mem::replace(&mut *self.mode.lock(), mode);
        if previous != mode {
            self.emit(ConversationEvent::ModeChanged(mode));
        }
    }

    pub fn volume(&self) -> f32 {
        *self.volume.lock()
    }

    pub fn set_volume(&self, volume: f32) {
        *self.volume.lock() = volume;
    }

    pub fn last_input_rms(&self) -> f32 {
        *self.last_input_rms.lock()
    }

    pub fn set_last_input_rms(&self, rms: f32) {
        *self.last_input_rms.lock() = rms;
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            chunks_sent: self.chunks_sent.load(Ordering::SeqCst),
            audio_events_received: self.audio_events_received.load(Ordering::SeqCst),
            stale_audio_dropped: self.stale_audio_dropped.load(Ordering::SeqCst),
            interruptions: self.interruptions.load(Ordering::SeqCst),
            malformed_frames: self.malformed_frames.load(Ordering::SeqCst),
        }
    }
}

/// Handle to a running conversation.
///
/// Returned by [`ConversationManager::start_session()`]. The conversation
/// runs on a background task until [`end()`](Session::end) is called, the
/// service closes the socket, or a transport or device failure occurs.
///
/// # Lifecycle
///
/// 1. Created by [`ConversationManager::start_session()`] once devices are
///    open and the handshake completed; status is `connected`
/// 2. Audio and events flow in the background
/// 3. Call [`end()`](Session::end) for graceful shutdown
/// 4. Dropping the last handle also ends the conversation (but prefer
///    explicit `end()`)
///
/// # Example
///
/// ```ignore
/// let session = manager.start_session(config).await?;
/// println!("conversation {}", session.id());
///
/// tokio::time::sleep(Duration::from_secs(30)).await;
/// session.end().await;
/// ```
///
/// [`ConversationManager::start_session()`]: crate::ConversationManager::start_session
pub struct Session {
    id: String,
    output_sample_rate: u32,
    state: Arc<SessionState>,
    commands: mpsc::UnboundedSender<Command>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    input_meter: Arc<Mutex<VolumeMeter>>,
    output_meter: Arc<Mutex<VolumeMeter>>,
}

impl Session {
    pub(crate) fn new(
        id: String,
        output_sample_rate: u32,
        state: Arc<SessionState>,
        commands: mpsc::UnboundedSender<Command>,
        dispatcher: JoinHandle<()>,
        input_meter: Arc<Mutex<VolumeMeter>>,
        output_meter: Arc<Mutex<VolumeMeter>>,
    ) -> Self {
        Self {
            id,
            output_sample_rate,
            state,
            commands,
            dispatcher: Mutex::new(Some(dispatcher)),
            input_meter,
            output_meter,
        }
    }

    /// Conversation identifier assigned by the service.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Sample rate of the agent's audio.
    pub fn output_sample_rate(&self) -> u32 {
        self.output_sample_rate
    }

    /// Current connection status.
    pub fn status(&self) -> ConnectionStatus {
        self.state.status()
    }

    /// Returns `true` while the conversation is connected.
    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Current conversation mode.
    pub fn mode(&self) -> ConversationMode {
        self.state.mode()
    }

    /// Configured playback gain.
    pub fn volume(&self) -> f32 {
        self.state.volume()
    }

    /// Sets the playback gain. Takes effect immediately on audio that is
    /// playing, unless an interruption fade is in progress, in which case it
    /// applies when the fade ends. Negative and non-finite values are
    /// ignored.
    pub fn set_volume(&self, level: f32) {
        if !is_valid_volume(level) {
            tracing::warn!(level, "Ignoring invalid volume");
            return;
        }
        self.state.set_volume(level);
        let _ = self.commands.send(Command::SetVolume(level));
    }

    /// Microphone level in [0, 1], from the most recent captured block.
    pub fn input_volume(&self) -> f32 {
        VolumeMeter::shared_level(&self.input_meter)
    }

    /// Speaker level in [0, 1], from the most recent rendered block.
    pub fn output_volume(&self) -> f32 {
        VolumeMeter::shared_level(&self.output_meter)
    }

    /// RMS of the raw block behind the most recently sent chunk.
    pub fn last_input_rms(&self) -> f32 {
        self.state.last_input_rms()
    }

    /// Returns current session statistics.
    pub fn stats(&self) -> SessionStats {
        self.state.stats()
    }

    /// Waits until teardown has finished and the status is `disconnected`.
    pub(crate) async fn closed(&self) {
        self.state.disconnected().await;
    }

    /// Ends the conversation and waits for the socket and both audio
    /// streams to be released.
    ///
    /// Does nothing unless the status is `connected`.
    pub async fn end(&self) {
        if !self.state.begin_disconnect() {
            return;
        }

        let (done_tx, done_rx) = oneshot::channel();
        let stop = Command::Stop {
            reason: DisconnectReason::User,
            done: done_tx,
        };
        if self.commands.send(stop).is_ok() {
            // Err means the task already ended on its own.
            let _ = done_rx.await;
        }

        let dispatcher = self.dispatcher.lock().take();
        if let Some(handle) = dispatcher {
            let _ = handle.await;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state.begin_disconnect() {
            // Session dropped without explicit end() - trigger background cleanup
            let (done, _) = oneshot::channel();
            let _ = self.commands.send(Command::Stop {
                reason: DisconnectReason::User,
                done,
            });
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("output_sample_rate", &self.output_sample_rate)
            .field("status", &self.status())
            .field("mode", &self.mode())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn recording_state() -> (Arc<SessionState>, Arc<Mutex<Vec<ConversationEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let callback: EventCallback = Arc::new(move |event| sink.lock().push(event));
        (Arc::new(SessionState::new(Some(callback), 1.0)), events)
    }

    #[test]
    fn test_session_state_new() {
        let state = SessionState::new(None, 0.5);
        assert_eq!(state.status(), ConnectionStatus::Connecting);
        assert_eq!(state.mode(), ConversationMode::Listening);
        assert_eq!(state.volume(), 0.5);
        assert_eq!(state.stats(), SessionStats::default());
    }

    #[test]
    fn test_mode_changes_are_edge_triggered() {
        let (state, events) = recording_state();

        state.set_mode(ConversationMode::Speaking);
        state.set_mode(ConversationMode::Speaking);
        state.set_mode(ConversationMode::Listening);
        state.set_mode(ConversationMode::Listening);

        assert_eq!(
            *events.lock(),
            vec![
                ConversationEvent::ModeChanged(ConversationMode::Speaking),
                ConversationEvent::ModeChanged(ConversationMode::Listening),
            ]
        );
    }

    #[test]
    fn test_status_changes_are_edge_triggered() {
        let (state, events) = recording_state();

        state.set_status(ConnectionStatus::Connecting);
        state.set_status(ConnectionStatus::Connected);

        assert_eq!(
            *events.lock(),
            vec![ConversationEvent::StatusChanged(ConnectionStatus::Connected)]
        );
    }

    #[test]
    fn test_begin_disconnect_only_from_connected() {
        let (state, events) = recording_state();
        assert!(!state.begin_disconnect());

        state.set_status(ConnectionStatus::Connected);
        assert!(state.begin_disconnect());
        assert!(!state.begin_disconnect());
        assert_eq!(state.status(), ConnectionStatus::Disconnecting);
        assert_eq!(events.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_disconnected_resolves_after_teardown() {
        let state = Arc::new(SessionState::new(None, 1.0));
        state.set_status(ConnectionStatus::Connected);
        assert!(state.begin_disconnect());

        let waiter = tokio::spawn({
            let state = state.clone();
            async move { state.disconnected().await }
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        state.set_status(ConnectionStatus::Disconnected);
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .unwrap();

        // Already disconnected: returns at once.
        state.disconnected().await;
    }

    #[test]
    fn test_callback_may_read_state() {
        let reads = Arc::new(AtomicUsize::new(0));
        let state_slot: Arc<Mutex<Option<Arc<SessionState>>>> = Arc::new(Mutex::new(None));

        let slot = state_slot.clone();
        let counter = reads.clone();
        let callback: EventCallback = Arc::new(move |_| {
            if let Some(state) = slot.lock().as_ref() {
                let _ = state.status();
                let _ = state.mode();
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        let state = Arc::new(SessionState::new(Some(callback), 1.0));
        *state_slot.lock() = Some(state.clone());

        state.set_status(ConnectionStatus::Connected);
        state.set_mode(ConversationMode::Speaking);
        assert_eq!(reads.load(Ordering::SeqCst), 2);

        // Break the reference cycle.
        state_slot.lock().take();
    }

    #[test]
    fn test_session_stats_default() {
        let stats = SessionStats::default();
        assert_eq!(stats.chunks_sent, 0);
        assert_eq!(stats.stale_audio_dropped, 0);
    }
}
