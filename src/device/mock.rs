//! Mock audio backend for testing without hardware.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use ringbuf::traits::{Producer, Split};
use ringbuf::HeapRb;

use super::{AudioBackend, DeviceErrorCallback, InputStream, StreamHandle};
use crate::pipeline::OutputRenderer;
use crate::VoiceError;

/// Microphone ring buffer size in samples.
const MOCK_BUFFER_CAPACITY: usize = 16000 * 30;

/// An in-memory audio backend.
///
/// Tests push microphone samples with [`push_input`](Self::push_input) and
/// pull what the speaker would play with [`pull_output`](Self::pull_output).
/// Clones share state, so a test can keep one clone while the manager owns
/// another.
///
/// # Example
///
/// ```
/// use stream_voice::device::MockBackend;
///
/// let backend = MockBackend::new(16000);
///
/// // Nothing is open yet, so samples go nowhere.
/// assert_eq!(backend.push_sine(440.0, 100), 0);
/// assert_eq!(backend.input_opens(), 0);
/// ```
#[derive(Clone)]
pub struct MockBackend {
    inner: Arc<MockInner>,
}

struct MockInner {
    input_sample_rate: u32,
    input_channels: u16,
    state: Mutex<MockState>,
    input_opens: AtomicUsize,
    input_closes: AtomicUsize,
    output_opens: AtomicUsize,
    output_closes: AtomicUsize,
}

#[derive(Default)]
struct MockState {
    microphone: Option<ringbuf::HeapProd<f32>>,
    speaker: Option<OutputRenderer>,
    output_sample_rate: Option<u32>,
    input_error: Option<DeviceErrorCallback>,
    output_error: Option<DeviceErrorCallback>,
    fail_input: Option<String>,
    fail_output: Option<String>,
}

impl MockBackend {
    /// Creates a mono mock microphone at `input_sample_rate`.
    pub fn new(input_sample_rate: u32) -> Self {
        Self::with_channels(input_sample_rate, 1)
    }

    /// Creates a mock microphone with an interleaved channel count.
    pub fn with_channels(input_sample_rate: u32, channels: u16) -> Self {
        Self {
            inner: Arc::new(MockInner {
                input_sample_rate,
                input_channels: channels.max(1),
                state: Mutex::new(MockState::default()),
                input_opens: AtomicUsize::new(0),
                input_closes: AtomicUsize::new(0),
                output_opens: AtomicUsize::new(0),
                output_closes: AtomicUsize::new(0),
            }),
        }
    }

    /// Makes every later `open_input` fail with `DeviceUnavailable`.
    pub fn fail_input(&self, reason: impl Into<String>) {
        self.inner.state.lock().fail_input = Some(reason.into());
    }

    /// Makes every later `open_output` fail with `DeviceUnavailable`.
    pub fn fail_output(&self, reason: impl Into<String>) {
        self.inner.state.lock().fail_output = Some(reason.into());
    }

    /// Feeds interleaved samples to the open microphone. Returns how many
    /// were accepted (zero while the microphone is closed).
    pub fn push_input(&self, samples: &[f32]) -> usize {
        match self.inner.state.lock().microphone.as_mut() {
            Some(producer) => producer.push_slice(samples),
            None => 0,
        }
    }

    /// Feeds silence for the given duration in milliseconds.
    pub fn push_silence(&self, duration_ms: u64) -> usize {
        let samples = vec![0.0; self.samples_for_duration(duration_ms)];
        self.push_input(&samples)
    }

    /// Feeds a sine wave at the given frequency for the given duration.
    pub fn push_sine(&self, frequency: f32, duration_ms: u64) -> usize {
        let channels = usize::from(self.inner.input_channels);
        let frames = self.samples_for_duration(duration_ms) / channels;
        let rate = self.inner.input_sample_rate as f32;

        let mut samples = Vec::with_capacity(frames * channels);
        for i in 0..frames {
            let value = (2.0 * std::f32::consts::PI * frequency * i as f32 / rate).sin() * 0.5;
            samples.extend(std::iter::repeat(value).take(channels));
        }
        self.push_input(&samples)
    }

    /// Renders `frames` samples from the open speaker, as the device
    /// callback would. Returns `None` while the speaker is closed.
    pub fn pull_output(&self, frames: usize) -> Option<Vec<f32>> {
        let mut state = self.inner.state.lock();
        let renderer = state.speaker.as_mut()?;
        let mut out = vec![0.0; frames];
        renderer.render(&mut out);
        Some(out)
    }

    /// Reports a failure on the open microphone.
    pub fn raise_input_error(&self, message: impl Into<String>) {
        let callback = self.inner.state.lock().input_error.clone();
        if let Some(callback) = callback {
            callback(message.into());
        }
    }

    /// Reports a failure on the open speaker.
    pub fn raise_output_error(&self, message: impl Into<String>) {
        let callback = self.inner.state.lock().output_error.clone();
        if let Some(callback) = callback {
            callback(message.into());
        }
    }

    /// Sample rate the speaker was last opened at.
    pub fn output_sample_rate(&self) -> Option<u32> {
        self.inner.state.lock().output_sample_rate
    }

    /// Returns `true` while a microphone stream is open.
    pub fn is_input_open(&self) -> bool {
        self.inner.state.lock().microphone.is_some()
    }

    /// Returns `true` while a speaker stream is open.
    pub fn is_output_open(&self) -> bool {
        self.inner.state.lock().speaker.is_some()
    }

    /// Number of successful `open_input` calls.
    pub fn input_opens(&self) -> usize {
        self.inner.input_opens.load(Ordering::SeqCst)
    }

    /// Number of microphone streams released.
    pub fn input_closes(&self) -> usize {
        self.inner.input_closes.load(Ordering::SeqCst)
    }

    /// Number of successful `open_output` calls.
    pub fn output_opens(&self) -> usize {
        self.inner.output_opens.load(Ordering::SeqCst)
    }

    /// Number of speaker streams released.
    pub fn output_closes(&self) -> usize {
        self.inner.output_closes.load(Ordering::SeqCst)
    }

    fn samples_for_duration(&self, duration_ms: u64) -> usize {
        let frames = (u64::from(self.inner.input_sample_rate) * duration_ms / 1000) as usize;
        frames * usize::from(self.inner.input_channels)
    }
}

impl AudioBackend for MockBackend {
    fn open_input(&self, on_error: DeviceErrorCallback) -> Result<InputStream, VoiceError> {
        let mut state = self.inner.state.lock();
        if let Some(reason) = &state.fail_input {
            return Err(VoiceError::device_unavailable("mock input", reason));
        }

        let (producer, consumer) = HeapRb::<f32>::new(MOCK_BUFFER_CAPACITY).split();
        state.microphone = Some(producer);
        state.input_error = Some(on_error);
        self.inner.input_opens.fetch_add(1, Ordering::SeqCst);

        let inner = self.inner.clone();
        let handle = StreamHandle::new(move || {
            let mut state = inner.state.lock();
            state.microphone = None;
            state.input_error = None;
            inner.input_closes.fetch_add(1, Ordering::SeqCst);
        });

        Ok(InputStream {
            sample_rate: self.inner.input_sample_rate,
            channels: self.inner.input_channels,
            consumer,
            handle,
        })
    }

    fn open_output(
        &self,
        sample_rate: u32,
        renderer: OutputRenderer,
        on_error: DeviceErrorCallback,
    ) -> Result<StreamHandle, VoiceError> {
        let mut state = self.inner.state.lock();
        if let Some(reason) = &state.fail_output {
            return Err(VoiceError::device_unavailable("mock output", reason));
        }

        state.speaker = Some(renderer);
        state.output_sample_rate = Some(sample_rate);
        state.output_error = Some(on_error);
        self.inner.output_opens.fetch_add(1, Ordering::SeqCst);

        let inner = self.inner.clone();
        Ok(StreamHandle::new(move || {
            let mut state = inner.state.lock();
            state.speaker = None;
            state.output_error = None;
            inner.output_closes.fetch_add(1, Ordering::SeqCst);
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringbuf::traits::Consumer;

    fn no_errors() -> DeviceErrorCallback {
        Arc::new(|_| {})
    }

    #[test]
    fn test_mock_input_round_trip() {
        let backend = MockBackend::new(16000);
        let mut input = backend.open_input(no_errors()).unwrap();

        assert_eq!(backend.push_input(&[0.1, 0.2, 0.3]), 3);

        let mut out = [0.0f32; 3];
        assert_eq!(input.consumer.pop_slice(&mut out), 3);
        assert_eq!(out, [0.1, 0.2, 0.3]);

        input.handle.close();
        assert!(!backend.is_input_open());
        assert_eq!(backend.push_input(&[0.1]), 0);
    }

    #[test]
    fn test_mock_silence_and_sine_lengths() {
        let backend = MockBackend::with_channels(48000, 2);
        let _input = backend.open_input(no_errors()).unwrap();

        // 48000 * 0.1 * 2 channels = 9600
        assert_eq!(backend.push_silence(100), 9600);
        assert_eq!(backend.push_sine(440.0, 100), 9600);
    }

    #[test]
    fn test_mock_counts_opens_and_closes() {
        let backend = MockBackend::new(16000);
        let input = backend.open_input(no_errors()).unwrap();
        assert_eq!(backend.input_opens(), 1);
        assert_eq!(backend.input_closes(), 0);

        drop(input);
        assert_eq!(backend.input_closes(), 1);
    }

    #[test]
    fn test_mock_input_failure() {
        let backend = MockBackend::new(16000);
        backend.fail_input("permission denied");

        let result = backend.open_input(no_errors());
        assert!(matches!(result, Err(VoiceError::DeviceUnavailable { .. })));
        assert_eq!(backend.input_opens(), 0);
    }

    #[test]
    fn test_mock_raises_input_error() {
        use std::sync::atomic::AtomicBool;

        let backend = MockBackend::new(16000);
        let raised = Arc::new(AtomicBool::new(false));
        let flag = raised.clone();
        let _input = backend
            .open_input(Arc::new(move |_| flag.store(true, Ordering::SeqCst)))
            .unwrap();

        backend.raise_input_error("unplugged");
        assert!(raised.load(Ordering::SeqCst));
    }

    #[test]
    fn test_pull_output_without_speaker() {
        let backend = MockBackend::new(16000);
        assert!(backend.pull_output(128).is_none());
        assert!(backend.output_sample_rate().is_none());
    }
}
