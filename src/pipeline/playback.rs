//! Agent audio playback: a chunk queue rendered by the speaker callback.
//!
//! ```text
//! Dispatcher ──enqueue──▶ PlaybackQueue ◀──render── OutputRenderer (device thread)
//!                                                       │
//!                            PlaybackSignal::Finished ◀─┘
//! ```
//!
//! The queue sits behind a `parking_lot` mutex shared by the dispatcher and
//! the device callback. Critical sections are a few hundred samples at most.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::device::{AudioBackend, DeviceErrorCallback, StreamHandle};
use crate::format::{i16_to_f32, VolumeMeter};
use crate::{AudioChunk, VoiceError};

/// Notifications sent from the speaker callback to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PlaybackSignal {
    /// The queue ran dry after playing audio.
    Finished,
}

/// Exponential gain ramp advanced once per rendered sample.
#[derive(Debug, Clone, Copy)]
struct GainRamp {
    factor: f32,
    remaining: usize,
    target: f32,
}

/// FIFO of agent audio plus gain state.
#[derive(Debug)]
pub(crate) struct PlaybackQueue {
    queue: VecDeque<AudioChunk>,
    current: Option<AudioChunk>,
    position: usize,
    interrupted: bool,
    finished: bool,
    gain: f32,
    ramp: Option<GainRamp>,
}

impl PlaybackQueue {
    pub fn new(gain: f32) -> Self {
        Self {
            queue: VecDeque::new(),
            current: None,
            position: 0,
            interrupted: false,
            // Nothing has played yet, so there is nothing to report.
            finished: true,
            gain,
            ramp: None,
        }
    }

    /// Appends a chunk. New audio always clears a pending interruption.
    pub fn enqueue(&mut self, chunk: AudioChunk) {
        self.interrupted = false;
        if chunk.is_empty() {
            return;
        }
        self.queue.push_back(chunk);
        self.finished = false;
    }

    /// Marks queued audio for flushing by [`clear_interrupted`](Self::clear_interrupted).
    pub fn interrupt(&mut self) {
        self.interrupted = true;
    }

    /// Flushes queued audio if the queue is still interrupted. Returns
    /// whether anything was flushed.
    pub fn clear_interrupted(&mut self) -> bool {
        if !self.interrupted {
            return false;
        }
        self.queue.clear();
        self.current = None;
        self.position = 0;
        self.interrupted = false;
        true
    }

    #[cfg(test)]
    pub fn is_interrupted(&self) -> bool {
        self.interrupted
    }

    /// Number of chunks not yet fully played.
    pub fn pending_chunks(&self) -> usize {
        self.queue.len() + usize::from(self.current.is_some())
    }

    #[cfg(test)]
    pub fn gain(&self) -> f32 {
        self.gain
    }

    /// Sets the gain immediately, cancelling any ramp in progress.
    pub fn set_gain(&mut self, gain: f32) {
        self.gain = gain;
        self.ramp = None;
    }

    /// Ramps the gain exponentially to `target` over `samples` rendered
    /// samples. A gain already at or below `target` is left alone.
    pub fn ramp_gain(&mut self, target: f32, samples: usize) {
        if self.gain <= target || target <= 0.0 {
            self.ramp = None;
            if target <= 0.0 {
                self.gain = 0.0;
            }
            return;
        }
        if samples == 0 {
            self.set_gain(target);
            return;
        }
        let factor = (target / self.gain).powf(1.0 / samples as f32);
        self.ramp = Some(GainRamp {
            factor,
            remaining: samples,
            target,
        });
    }

    fn advance_gain(&mut self) {
        if let Some(ramp) = self.ramp.as_mut() {
            ramp.remaining -= 1;
            if ramp.remaining == 0 {
                self.gain = ramp.target;
                self.ramp = None;
            } else {
                self.gain *= ramp.factor;
            }
        }
    }

    fn next_sample(&mut self) -> Option<i16> {
        loop {
            if let Some(chunk) = &self.current {
                if let Some(&sample) = chunk.samples.get(self.position) {
                    self.position += 1;
                    return Some(sample);
                }
                self.current = None;
                self.position = 0;
            }
            self.current = Some(self.queue.pop_front()?);
        }
    }

    /// Fills `out` with gain-scaled audio, padding with silence once the
    /// queue is empty. Returns `true` exactly once each time the queue runs
    /// dry after playing.
    pub fn render(&mut self, out: &mut [f32]) -> bool {
        for slot in out.iter_mut() {
            *slot = match self.next_sample() {
                Some(sample) => i16_to_f32(sample) * self.gain,
                None => 0.0,
            };
            self.advance_gain();
        }

        if !self.finished && self.pending_chunks() == 0 {
            self.finished = true;
            return true;
        }
        false
    }
}

/// Pulls samples for the speaker from a shared playback queue.
///
/// Handed to [`AudioBackend::open_output`]; backends call
/// [`render`](Self::render) from their audio callback.
pub struct OutputRenderer {
    queue: Arc<Mutex<PlaybackQueue>>,
    meter: Arc<Mutex<VolumeMeter>>,
    signals: mpsc::UnboundedSender<PlaybackSignal>,
}

impl OutputRenderer {
    /// Fills `out` with mono samples at the session's output rate.
    pub fn render(&mut self, out: &mut [f32]) {
        let finished = self.queue.lock().render(out);
        self.meter.lock().record(out);
        if finished {
            let _ = self.signals.send(PlaybackSignal::Finished);
        }
    }
}

/// The speaker side of a session.
pub(crate) struct PlaybackPipeline {
    queue: Arc<Mutex<PlaybackQueue>>,
    meter: Arc<Mutex<VolumeMeter>>,
    handle: StreamHandle,
    sample_rate: u32,
}

impl PlaybackPipeline {
    /// Opens the speaker at `sample_rate` with the given initial gain.
    pub fn open(
        backend: &dyn AudioBackend,
        sample_rate: u32,
        gain: f32,
        meter: Arc<Mutex<VolumeMeter>>,
        signals: mpsc::UnboundedSender<PlaybackSignal>,
        on_error: DeviceErrorCallback,
    ) -> Result<Self, VoiceError> {
        let queue = Arc::new(Mutex::new(PlaybackQueue::new(gain)));
        let renderer = OutputRenderer {
            queue: queue.clone(),
            meter: meter.clone(),
            signals,
        };
        let handle = backend.open_output(sample_rate, renderer, on_error)?;

        tracing::debug!(sample_rate, gain, "Playback pipeline opened");
        Ok(Self {
            queue,
            meter,
            handle,
            sample_rate,
        })
    }

    pub fn enqueue(&self, chunk: AudioChunk) {
        self.queue.lock().enqueue(chunk);
    }

    pub fn interrupt(&self) {
        self.queue.lock().interrupt();
    }

    pub fn clear_interrupted(&self) -> bool {
        self.queue.lock().clear_interrupted()
    }

    pub fn set_gain(&self, gain: f32) {
        self.queue.lock().set_gain(gain);
    }

    /// Returns `true` when no agent audio is queued or playing.
    pub fn is_idle(&self) -> bool {
        self.queue.lock().pending_chunks() == 0
    }

    /// Ramps the gain to `target` over `duration` of rendered audio.
    pub fn ramp_gain(&self, target: f32, duration: Duration) {
        let samples = (duration.as_secs_f64() * f64::from(self.sample_rate)).round() as usize;
        self.queue.lock().ramp_gain(target, samples);
    }

    /// Releases the speaker. Safe to call more than once.
    pub fn close(&mut self) {
        if self.handle.is_open() {
            self.handle.close();
            self.meter.lock().clear();
            tracing::debug!("Playback pipeline closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(samples: &[i16]) -> AudioChunk {
        AudioChunk::new(samples.to_vec(), 16000)
    }

    #[test]
    fn test_render_plays_in_order_then_silence() {
        let mut queue = PlaybackQueue::new(1.0);
        queue.enqueue(chunk(&[16384, -16384]));
        queue.enqueue(chunk(&[8192]));

        let mut out = [1.0f32; 5];
        let finished = queue.render(&mut out);

        assert_eq!(out, [0.5, -0.5, 0.25, 0.0, 0.0]);
        assert!(finished);
    }

    #[test]
    fn test_finished_fires_once_per_drain() {
        let mut queue = PlaybackQueue::new(1.0);
        let mut out = [0.0f32; 4];

        // Idle queue never reports.
        assert!(!queue.render(&mut out));

        queue.enqueue(chunk(&[1, 2, 3, 4, 5, 6]));
        assert!(!queue.render(&mut out));
        assert!(queue.render(&mut out));
        assert!(!queue.render(&mut out));

        queue.enqueue(chunk(&[1]));
        assert!(queue.render(&mut out));
    }

    #[test]
    fn test_gain_scales_output() {
        let mut queue = PlaybackQueue::new(0.5);
        queue.enqueue(chunk(&[16384]));
        let mut out = [0.0f32; 1];
        queue.render(&mut out);
        assert!((out[0] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_clear_interrupted_flushes_only_when_flagged() {
        let mut queue = PlaybackQueue::new(1.0);
        queue.enqueue(chunk(&[1, 2, 3]));
        assert!(!queue.clear_interrupted());
        assert_eq!(queue.pending_chunks(), 1);

        queue.interrupt();
        assert!(queue.clear_interrupted());
        assert_eq!(queue.pending_chunks(), 0);
        assert!(!queue.is_interrupted());
    }

    #[test]
    fn test_enqueue_clears_interrupted_flag() {
        let mut queue = PlaybackQueue::new(1.0);
        queue.enqueue(chunk(&[1, 2, 3]));
        queue.interrupt();
        queue.enqueue(chunk(&[4, 5, 6]));

        assert!(!queue.is_interrupted());
        assert!(!queue.clear_interrupted());
        assert_eq!(queue.pending_chunks(), 2);
    }

    #[test]
    fn test_interrupted_audio_keeps_playing_until_cleared() {
        let mut queue = PlaybackQueue::new(1.0);
        queue.enqueue(chunk(&[16384, 16384, 16384]));
        queue.interrupt();

        let mut out = [0.0f32; 1];
        queue.render(&mut out);
        assert!(out[0] > 0.0);

        queue.clear_interrupted();
        queue.render(&mut out);
        assert_eq!(out[0], 0.0);
    }

    #[test]
    fn test_ramp_reaches_target() {
        let mut queue = PlaybackQueue::new(1.0);
        queue.ramp_gain(0.0001, 100);

        let mut out = [0.0f32; 50];
        queue.render(&mut out);
        let midway = queue.gain();
        assert!(midway < 1.0 && midway > 0.0001, "midway={midway}");
        // Exponential: halfway in time is the geometric mean.
        assert!((midway - 0.01).abs() < 1e-3, "midway={midway}");

        queue.render(&mut out);
        assert_eq!(queue.gain(), 0.0001);
    }

    #[test]
    fn test_set_gain_cancels_ramp() {
        let mut queue = PlaybackQueue::new(1.0);
        queue.ramp_gain(0.0001, 100);
        queue.set_gain(0.8);

        let mut out = [0.0f32; 200];
        queue.render(&mut out);
        assert_eq!(queue.gain(), 0.8);
    }

    #[test]
    fn test_ramp_from_below_target_is_noop() {
        let mut queue = PlaybackQueue::new(0.0);
        queue.ramp_gain(0.0001, 100);

        let mut out = [0.0f32; 200];
        queue.render(&mut out);
        assert_eq!(queue.gain(), 0.0);
    }

    #[test]
    fn test_empty_chunk_is_ignored() {
        let mut queue = PlaybackQueue::new(1.0);
        queue.enqueue(chunk(&[]));
        assert_eq!(queue.pending_chunks(), 0);

        let mut out = [0.0f32; 4];
        assert!(!queue.render(&mut out));
    }

    #[test]
    fn test_renderer_signals_finished_and_meters() {
        let queue = Arc::new(Mutex::new(PlaybackQueue::new(1.0)));
        let meter = Arc::new(Mutex::new(VolumeMeter::default()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut renderer = OutputRenderer {
            queue: queue.clone(),
            meter: meter.clone(),
            signals: tx,
        };

        queue.lock().enqueue(chunk(&[16384; 256]));
        let mut out = vec![0.0f32; 512];
        renderer.render(&mut out);

        assert_eq!(rx.try_recv().ok(), Some(PlaybackSignal::Finished));
        assert!(rx.try_recv().is_err());
        assert!(meter.lock().level() > 0.0);
    }
}
