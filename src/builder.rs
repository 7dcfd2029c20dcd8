//! Conversation manager and its builder.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::device::{AudioBackend, CpalBackend, DeviceErrorCallback};
use crate::dispatch::{DispatchInputs, Dispatcher};
use crate::format::VolumeMeter;
use crate::pipeline::{CaptureConfig, CapturePipeline, PlaybackPipeline};
use crate::session::SessionState;
use crate::signaling::{Connector, SignalingChannel, WebSocketConnector};
use crate::{
    ConnectionStatus, ConnectionTarget, ConversationEvent, EventCallback, Session,
    SessionConfig, Sink, UrlProvider, VoiceError,
};

/// Captured chunks buffered between the capture bridge and the dispatcher.
const CAPTURE_CHANNEL_CAPACITY: usize = 64;

/// Builder for configuring a [`ConversationManager`].
///
/// # Example
///
/// ```no_run
/// use stream_voice::{
///     event_callback, ChannelSink, ConnectionTarget, ConversationEvent, ConversationManager,
///     SessionConfig,
/// };
/// use tokio::sync::mpsc;
///
/// # async fn example() -> Result<(), stream_voice::VoiceError> {
/// let (tx, mut rx) = mpsc::channel(32);
///
/// let manager = ConversationManager::builder()
///     .add_sink(ChannelSink::with_name("avatar", tx))
///     .on_event(event_callback(|event| {
///         if let ConversationEvent::Message { source, text } = event {
///             println!("{source}: {text}");
///         }
///     }))
///     .build();
///
/// let session = manager
///     .start_session(SessionConfig::new(ConnectionTarget::AgentId("agent_123".into())))
///     .await?;
/// // ... talk ...
/// session.end().await;
/// # Ok(())
/// # }
/// ```
pub struct ConversationManagerBuilder {
    backend: Option<Arc<dyn AudioBackend>>,
    connector: Option<Arc<dyn Connector>>,
    url_provider: Option<Arc<dyn UrlProvider>>,
    sinks: Vec<Arc<dyn Sink>>,
    event_callback: Option<EventCallback>,
}

impl ConversationManagerBuilder {
    fn new() -> Self {
        Self {
            backend: None,
            connector: None,
            url_provider: None,
            sinks: Vec::new(),
            event_callback: None,
        }
    }

    /// Sets the audio device backend.
    ///
    /// Default: [`CpalBackend`] on the system default devices.
    pub fn backend<B: AudioBackend + 'static>(mut self, backend: B) -> Self {
        self.backend = Some(Arc::new(backend));
        self
    }

    /// Sets how sockets are opened.
    ///
    /// Default: [`WebSocketConnector`].
    pub fn connector<C: Connector + 'static>(mut self, connector: C) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Sets the collaborator that turns an agent id into a signed URL.
    ///
    /// Without one, agent ids are formatted onto the configured origin.
    pub fn url_provider<P: UrlProvider + 'static>(mut self, provider: P) -> Self {
        self.url_provider = Some(Arc::new(provider));
        self
    }

    /// Adds a sink that receives every accepted chunk of agent audio.
    pub fn add_sink<S: Sink + 'static>(mut self, sink: S) -> Self {
        self.sinks.push(Arc::new(sink));
        self
    }

    /// Sets the event callback for session notifications.
    pub fn on_event(mut self, callback: EventCallback) -> Self {
        self.event_callback = Some(callback);
        self
    }

    /// Builds the manager. No devices or sockets are touched until
    /// [`ConversationManager::start_session`].
    pub fn build(self) -> ConversationManager {
        ConversationManager {
            backend: self
                .backend
                .unwrap_or_else(|| Arc::new(CpalBackend::new())),
            connector: self
                .connector
                .unwrap_or_else(|| Arc::new(WebSocketConnector)),
            url_provider: self.url_provider,
            sinks: self.sinks,
            event_callback: self.event_callback,
            starting: tokio::sync::Mutex::new(()),
            current: Mutex::new(None),
        }
    }
}

/// Entry point: starts conversations and tracks the current one.
///
/// At most one session is live per manager. Concurrent
/// [`start_session`](Self::start_session) calls coalesce onto the same
/// session, so devices and the socket are opened once.
pub struct ConversationManager {
    backend: Arc<dyn AudioBackend>,
    connector: Arc<dyn Connector>,
    url_provider: Option<Arc<dyn UrlProvider>>,
    sinks: Vec<Arc<dyn Sink>>,
    event_callback: Option<EventCallback>,
    starting: tokio::sync::Mutex<()>,
    current: Mutex<Option<Arc<Session>>>,
}

impl ConversationManager {
    /// Creates a new builder.
    pub fn builder() -> ConversationManagerBuilder {
        ConversationManagerBuilder::new()
    }

    /// Opens the microphone, connects, completes the handshake and opens the
    /// speaker at the agent's sample rate.
    ///
    /// Returns the live session if one is already starting or running. If
    /// the previous session is still disconnecting, waits for its teardown
    /// to finish and then starts a new one.
    ///
    /// # Errors
    ///
    /// Any failure releases whatever was acquired, in reverse order, before
    /// returning:
    /// - `ExternalCallFailed` if the URL provider fails
    /// - `SinkStartFailed` if a sink fails to start
    /// - `DeviceUnavailable` / `UnsupportedFormat` if a device cannot be opened
    /// - `HandshakeFailed` if the socket or handshake fails
    pub async fn start_session(&self, config: SessionConfig) -> Result<Arc<Session>, VoiceError> {
        let _starting = self.starting.lock().await;

        if let Some(session) = self.session() {
            match session.status() {
                ConnectionStatus::Connecting | ConnectionStatus::Connected => {
                    tracing::debug!(id = session.id(), "Session already live");
                    return Ok(session);
                }
                ConnectionStatus::Disconnecting => {
                    tracing::debug!(id = session.id(), "Waiting for previous session to close");
                    session.closed().await;
                }
                ConnectionStatus::Disconnected => {}
            }
        }

        let state = Arc::new(SessionState::new(
            self.event_callback.clone(),
            config.initial_volume(),
        ));
        state.emit(ConversationEvent::StatusChanged(ConnectionStatus::Connecting));

        match self.open_session(&config, &state).await {
            Ok(session) => {
                let session = Arc::new(session);
                *self.current.lock() = Some(session.clone());
                Ok(session)
            }
            Err(e) => {
                tracing::warn!("Session start failed: {}", e);
                state.set_status(ConnectionStatus::Disconnected);
                Err(e)
            }
        }
    }

    /// Ends the current session, if it is connected.
    pub async fn end_session(&self) {
        if let Some(session) = self.session() {
            session.end().await;
        }
    }

    /// The most recently started session, live or not.
    pub fn session(&self) -> Option<Arc<Session>> {
        self.current.lock().clone()
    }

    /// Conversation id of the current session.
    pub fn id(&self) -> Option<String> {
        self.session().map(|session| session.id().to_string())
    }

    /// Connection status of the current session; `disconnected` if none.
    pub fn status(&self) -> ConnectionStatus {
        self.session()
            .map_or(ConnectionStatus::Disconnected, |session| session.status())
    }

    /// Sets the playback gain of the current session.
    pub fn set_volume(&self, level: f32) {
        if let Some(session) = self.session() {
            session.set_volume(level);
        }
    }

    /// Microphone level of the current session; 0 if none.
    pub fn input_volume(&self) -> f32 {
        self.session().map_or(0.0, |session| session.input_volume())
    }

    /// Speaker level of the current session; 0 if none.
    pub fn output_volume(&self) -> f32 {
        self.session().map_or(0.0, |session| session.output_volume())
    }

    async fn resolve_url(&self, config: &SessionConfig) -> Result<String, VoiceError> {
        match &config.target {
            ConnectionTarget::SignedUrl(url) => Ok(url.clone()),
            ConnectionTarget::AgentId(agent_id) => match &self.url_provider {
                Some(provider) => provider
                    .connection_url(agent_id)
                    .await
                    .map_err(VoiceError::external_call_failed),
                None => Ok(config.agent_url(agent_id)),
            },
        }
    }

    async fn start_sinks(&self) -> Result<(), VoiceError> {
        for (started, sink) in self.sinks.iter().enumerate() {
            tracing::debug!("Starting sink: {}", sink.name());
            if let Err(e) = sink.on_start().await {
                stop_sinks(&self.sinks[..started]).await;
                return Err(VoiceError::SinkStartFailed {
                    sink_name: sink.name().to_string(),
                    reason: e.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn open_session(
        &self,
        config: &SessionConfig,
        state: &Arc<SessionState>,
    ) -> Result<Session, VoiceError> {
        let url = self.resolve_url(config).await?;
        self.start_sinks().await?;

        let input_meter = Arc::new(Mutex::new(VolumeMeter::default()));
        let output_meter = Arc::new(Mutex::new(VolumeMeter::default()));

        let (captured_tx, captured_rx) = mpsc::channel(CAPTURE_CHANNEL_CAPACITY);
        let (device_error_tx, device_error_rx) = mpsc::unbounded_channel();
        let on_device_error: DeviceErrorCallback = Arc::new(move |message| {
            let _ = device_error_tx.send(message);
        });

        let capture_config = CaptureConfig {
            target_sample_rate: config.input_sample_rate,
            chunk_samples: config.chunk_threshold(),
            poll_interval: config.poll_interval,
        };
        let mut capture = match CapturePipeline::open(
            self.backend.as_ref(),
            &capture_config,
            input_meter.clone(),
            captured_tx,
            on_device_error.clone(),
        ) {
            Ok(capture) => capture,
            Err(e) => {
                stop_sinks(&self.sinks).await;
                return Err(e);
            }
        };

        let mut channel = match SignalingChannel::connect(self.connector.as_ref(), &url).await {
            Ok(channel) => channel,
            Err(e) => {
                capture.close().await;
                stop_sinks(&self.sinks).await;
                return Err(e);
            }
        };

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let playback = match PlaybackPipeline::open(
            self.backend.as_ref(),
            channel.output_sample_rate(),
            state.volume(),
            output_meter.clone(),
            signal_tx,
            on_device_error,
        ) {
            Ok(playback) => playback,
            Err(e) => {
                let _ = channel.close().await;
                capture.close().await;
                stop_sinks(&self.sinks).await;
                return Err(e);
            }
        };

        let conversation_id = channel.conversation_id().to_string();
        let output_sample_rate = channel.output_sample_rate();

        // Observers see `connected` before any conversation traffic.
        state.set_status(ConnectionStatus::Connected);
        state.emit(ConversationEvent::Connected {
            conversation_id: conversation_id.clone(),
        });
        tracing::info!(
            conversation_id = %conversation_id,
            output_sample_rate,
            sinks = self.sinks.len(),
            "Session started"
        );

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(
            channel,
            capture,
            playback,
            self.sinks.clone(),
            state.clone(),
            config,
            DispatchInputs {
                commands: command_rx,
                device_errors: device_error_rx,
                playback_signals: signal_rx,
                captured: captured_rx,
            },
        );
        let handle = tokio::spawn(dispatcher.run());

        Ok(Session::new(
            conversation_id,
            output_sample_rate,
            state.clone(),
            command_tx,
            handle,
            input_meter,
            output_meter,
        ))
    }
}

async fn stop_sinks(sinks: &[Arc<dyn Sink>]) {
    for sink in sinks {
        if let Err(e) = sink.on_stop().await {
            tracing::warn!("Sink '{}' stop error: {}", sink.name(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MockBackend;
    use crate::signaling::MockConnector;
    use crate::{AudioChunk, SinkError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSink {
        name: &'static str,
        fail_start: bool,
        starts: Arc<AtomicUsize>,
        stops: Arc<AtomicUsize>,
    }

    impl CountingSink {
        fn new(name: &'static str, fail_start: bool) -> (Self, Arc<AtomicUsize>, Arc<AtomicUsize>) {
            let starts = Arc::new(AtomicUsize::new(0));
            let stops = Arc::new(AtomicUsize::new(0));
            let sink = Self {
                name,
                fail_start,
                starts: starts.clone(),
                stops: stops.clone(),
            };
            (sink, starts, stops)
        }
    }

    #[async_trait]
    impl Sink for CountingSink {
        fn name(&self) -> &str {
            self.name
        }

        async fn on_start(&self) -> Result<(), SinkError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail_start {
                return Err(SinkError::custom("not ready"));
            }
            Ok(())
        }

        async fn write(&self, _chunk: &AudioChunk) -> Result<(), SinkError> {
            Ok(())
        }

        async fn on_stop(&self) -> Result<(), SinkError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl UrlProvider for FailingProvider {
        async fn connection_url(&self, _agent_id: &str) -> Result<String, String> {
            Err("token service down".to_string())
        }
    }

    struct SignedProvider;

    #[async_trait]
    impl UrlProvider for SignedProvider {
        async fn connection_url(&self, agent_id: &str) -> Result<String, String> {
            Ok(format!("wss://signed/{agent_id}?token=t"))
        }
    }

    fn agent_config() -> SessionConfig {
        SessionConfig::new(ConnectionTarget::AgentId("agent_1".into()))
    }

    #[test]
    fn test_builder_defaults() {
        let manager = ConversationManager::builder().build();
        assert!(manager.session().is_none());
        assert!(manager.id().is_none());
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        assert_eq!(manager.input_volume(), 0.0);
        assert_eq!(manager.output_volume(), 0.0);
    }

    #[tokio::test]
    async fn test_agent_id_formats_default_url() {
        let backend = MockBackend::new(16000);
        let (connector, peer) = MockConnector::pair();
        peer.send_handshake("conv_1", 16000);

        let manager = ConversationManager::builder()
            .backend(backend)
            .connector(connector)
            .build();
        let session = manager.start_session(agent_config()).await.unwrap();

        assert_eq!(
            peer.url().as_deref(),
            Some("wss://api.elevenlabs.io/v1/convai/conversation?agent_id=agent_1")
        );
        assert_eq!(manager.id().as_deref(), Some("conv_1"));
        session.end().await;
    }

    #[tokio::test]
    async fn test_url_provider_is_used() {
        let (connector, peer) = MockConnector::pair();
        peer.send_handshake("conv_1", 16000);

        let manager = ConversationManager::builder()
            .backend(MockBackend::new(16000))
            .connector(connector)
            .url_provider(SignedProvider)
            .build();
        let session = manager.start_session(agent_config()).await.unwrap();

        assert_eq!(peer.url().as_deref(), Some("wss://signed/agent_1?token=t"));
        session.end().await;
    }

    #[tokio::test]
    async fn test_url_provider_failure_touches_nothing() {
        let backend = MockBackend::new(16000);
        let (connector, _peer) = MockConnector::pair();

        let manager = ConversationManager::builder()
            .backend(backend.clone())
            .connector(connector)
            .url_provider(FailingProvider)
            .build();
        let result = manager.start_session(agent_config()).await;

        assert!(matches!(result, Err(VoiceError::ExternalCallFailed { .. })));
        assert_eq!(backend.input_opens(), 0);
        assert!(manager.session().is_none());
    }

    #[tokio::test]
    async fn test_sink_start_failure_stops_started_sinks() {
        let backend = MockBackend::new(16000);
        let (connector, peer) = MockConnector::pair();
        peer.send_handshake("conv_1", 16000);
        let (good, good_starts, good_stops) = CountingSink::new("good", false);
        let (bad, bad_starts, bad_stops) = CountingSink::new("bad", true);

        let manager = ConversationManager::builder()
            .backend(backend.clone())
            .connector(connector)
            .add_sink(good)
            .add_sink(bad)
            .build();
        let result = manager.start_session(agent_config()).await;

        match result {
            Err(VoiceError::SinkStartFailed { sink_name, .. }) => assert_eq!(sink_name, "bad"),
            other => panic!("expected SinkStartFailed, got {other:?}"),
        }
        assert_eq!(good_starts.load(Ordering::SeqCst), 1);
        assert_eq!(good_stops.load(Ordering::SeqCst), 1);
        assert_eq!(bad_starts.load(Ordering::SeqCst), 1);
        assert_eq!(bad_stops.load(Ordering::SeqCst), 0);
        assert_eq!(backend.input_opens(), 0);
    }

    #[tokio::test]
    async fn test_input_failure_stops_sinks() {
        let backend = MockBackend::new(16000);
        backend.fail_input("no microphone");
        let (connector, _peer) = MockConnector::pair();
        let (sink, _, stops) = CountingSink::new("avatar", false);

        let manager = ConversationManager::builder()
            .backend(backend)
            .connector(connector)
            .add_sink(sink)
            .build();
        let result = manager.start_session(agent_config()).await;

        assert!(matches!(result, Err(VoiceError::DeviceUnavailable { .. })));
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_restart_after_end() {
        let backend = MockBackend::new(16000);
        let (connector, peer) = MockConnector::pair();
        peer.send_handshake("conv_1", 16000);

        let manager = ConversationManager::builder()
            .backend(backend.clone())
            .connector(connector)
            .build();
        let first = manager.start_session(agent_config()).await.unwrap();
        manager.end_session().await;
        assert_eq!(first.status(), ConnectionStatus::Disconnected);

        // Only one connection is queued, so a fresh start must try to
        // connect again rather than return the ended session.
        let second = manager.start_session(agent_config()).await;
        assert!(matches!(second, Err(VoiceError::HandshakeFailed { .. })));
        assert_eq!(backend.input_opens(), 2);
        assert_eq!(backend.input_closes(), 2);
    }
}
