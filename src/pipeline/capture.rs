//! Capture bridge task - drains the microphone ring buffer, converts to
//! mono PCM16 at the session rate and emits fixed-size chunks.
//!
//! The bridge has two halves:
//! - [`CaptureProcessor`]: pure block processing (metering, downmix,
//!   resampling, chunking), unit-tested without a runtime
//! - [`CaptureBridge`]: the tokio task that polls the ring buffer and
//!   forwards processed chunks to the dispatcher

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::device::{AudioBackend, DeviceErrorCallback, StreamHandle};
use crate::format::{downmix_to_mono, f32_slice_to_i16, rms, StreamResampler, VolumeMeter};
use crate::{AudioChunk, VoiceError};

/// Shortest ring buffer poll period the bridge accepts.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// A chunk ready to send, with the level of the block that completed it.
#[derive(Debug, Clone)]
pub(crate) struct CapturedAudio {
    pub chunk: AudioChunk,
    pub rms: f32,
}

/// Configuration for the capture bridge task.
#[derive(Debug, Clone)]
pub(crate) struct CaptureConfig {
    /// Sample rate chunks are emitted at.
    pub target_sample_rate: u32,
    /// Samples per emitted chunk.
    pub chunk_samples: usize,
    /// How often the ring buffer is drained.
    pub poll_interval: Duration,
}

/// Output of [`CaptureProcessor::process_block`].
#[derive(Debug)]
pub(crate) struct ProcessedBlock {
    /// Complete chunks, possibly none.
    pub chunks: Vec<AudioChunk>,
    /// RMS of the raw interleaved block.
    pub rms: f32,
    /// The block downmixed to mono at the device rate.
    pub mono: Vec<f32>,
}

/// Turns raw interleaved device blocks into session-rate mono chunks.
#[derive(Debug)]
pub(crate) struct CaptureProcessor {
    channels: u16,
    resampler: StreamResampler,
    pending: Vec<f32>,
    chunk_samples: usize,
    target_sample_rate: u32,
}

impl CaptureProcessor {
    pub fn new(
        device_sample_rate: u32,
        device_channels: u16,
        target_sample_rate: u32,
        chunk_samples: usize,
    ) -> Self {
        Self {
            channels: device_channels.max(1),
            resampler: StreamResampler::new(device_sample_rate, target_sample_rate),
            pending: Vec::with_capacity(chunk_samples * 2),
            chunk_samples: chunk_samples.max(1),
            target_sample_rate,
        }
    }

    /// Processes one block of interleaved device samples.
    ///
    /// Leftover samples carry into the next call.
    pub fn process_block(&mut self, block: &[f32]) -> ProcessedBlock {
        let level = rms(block);
        let mono = downmix_to_mono(block, self.channels);
        if self.resampler.is_active() {
            let converted = self.resampler.process(&mono);
            self.pending.extend_from_slice(&converted);
        } else {
            self.pending.extend_from_slice(&mono);
        }

        let mut chunks = Vec::new();
        while self.pending.len() >= self.chunk_samples {
            let samples: Vec<f32> = self.pending.drain(..self.chunk_samples).collect();
            chunks.push(AudioChunk::new(
                f32_slice_to_i16(&samples),
                self.target_sample_rate,
            ));
        }
        ProcessedBlock {
            chunks,
            rms: level,
            mono,
        }
    }

    /// Samples waiting for the next chunk boundary.
    #[cfg(test)]
    pub fn pending_samples(&self) -> usize {
        self.pending.len()
    }
}

/// Polls the ring buffer and forwards chunks until aborted or the receiver
/// goes away.
pub(crate) struct CaptureBridge {
    consumer: ringbuf::HeapCons<f32>,
    processor: CaptureProcessor,
    meter: Arc<Mutex<VolumeMeter>>,
    chunk_tx: mpsc::Sender<CapturedAudio>,
    poll_interval: Duration,
    chunks_emitted: u64,
}

impl CaptureBridge {
    pub fn new(
        consumer: ringbuf::HeapCons<f32>,
        processor: CaptureProcessor,
        meter: Arc<Mutex<VolumeMeter>>,
        chunk_tx: mpsc::Sender<CapturedAudio>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            consumer,
            processor,
            meter,
            chunk_tx,
            poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
            chunks_emitted: 0,
        }
    }

    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut block = Vec::new();

        loop {
            interval.tick().await;

            block.clear();
            let available = self.consumer.occupied_len();
            if available == 0 {
                continue;
            }
            block.resize(available, 0.0);
            let read = self.consumer.pop_slice(&mut block);
            block.truncate(read);

            let processed = self.processor.process_block(&block);
            self.meter.lock().record(&processed.mono);

            for chunk in processed.chunks {
                self.chunks_emitted += 1;
                if self.chunks_emitted % 50 == 0 {
                    tracing::debug!(
                        "CaptureBridge: produced chunk #{}, {} samples",
                        self.chunks_emitted,
                        chunk.len()
                    );
                }
                let captured = CapturedAudio {
                    chunk,
                    rms: processed.rms,
                };
                if self.chunk_tx.send(captured).await.is_err() {
                    // Dispatcher gone, stop capturing
                    return;
                }
            }
        }
    }
}

/// The microphone side of a session.
pub(crate) struct CapturePipeline {
    handle: StreamHandle,
    bridge: Option<JoinHandle<()>>,
    meter: Arc<Mutex<VolumeMeter>>,
}

impl CapturePipeline {
    /// Opens the microphone and spawns the capture bridge.
    pub fn open(
        backend: &dyn AudioBackend,
        config: &CaptureConfig,
        meter: Arc<Mutex<VolumeMeter>>,
        chunk_tx: mpsc::Sender<CapturedAudio>,
        on_error: DeviceErrorCallback,
    ) -> Result<Self, VoiceError> {
        let input = backend.open_input(on_error)?;

        tracing::info!(
            "CaptureBridge creating: device={}Hz/{}ch, target={}Hz/1ch, chunk={} samples",
            input.sample_rate,
            input.channels,
            config.target_sample_rate,
            config.chunk_samples
        );

        let processor = CaptureProcessor::new(
            input.sample_rate,
            input.channels,
            config.target_sample_rate,
            config.chunk_samples,
        );
        let bridge = CaptureBridge::new(
            input.consumer,
            processor,
            meter.clone(),
            chunk_tx,
            config.poll_interval,
        );

        Ok(Self {
            handle: input.handle,
            bridge: Some(tokio::spawn(bridge.run())),
            meter,
        })
    }

    /// Stops the bridge and releases the microphone. Safe to call more than
    /// once.
    pub async fn close(&mut self) {
        if let Some(bridge) = self.bridge.take() {
            bridge.abort();
            let _ = bridge.await;
        }
        if self.handle.is_open() {
            self.handle.close();
            self.meter.lock().clear();
            tracing::debug!("Capture pipeline closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MockBackend;

    #[test]
    fn test_chunks_emitted_at_threshold() {
        let mut processor = CaptureProcessor::new(16000, 1, 16000, 4000);

        let processed = processor.process_block(&vec![0.1; 3000]);
        assert!(processed.chunks.is_empty());
        assert_eq!(processor.pending_samples(), 3000);

        let chunks = processor.process_block(&vec![0.1; 3000]).chunks;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 4000);
        assert_eq!(chunks[0].sample_rate, 16000);
        assert_eq!(processor.pending_samples(), 2000);
    }

    #[test]
    fn test_large_block_yields_several_chunks() {
        let mut processor = CaptureProcessor::new(16000, 1, 16000, 4000);
        let chunks = processor.process_block(&vec![0.0; 9000]).chunks;
        assert_eq!(chunks.len(), 2);
        assert_eq!(processor.pending_samples(), 1000);
    }

    #[test]
    fn test_block_rms_reported() {
        let mut processor = CaptureProcessor::new(16000, 1, 16000, 4000);
        let processed = processor.process_block(&[0.5, -0.5, 0.5, -0.5]);
        assert!((processed.rms - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_mono_block_is_downmixed_but_rms_is_raw() {
        let mut processor = CaptureProcessor::new(16000, 2, 16000, 4000);
        // Opposite channels cancel in the downmix.
        let processed = processor.process_block(&[0.5, -0.5, 0.5, -0.5, 0.5, -0.5]);
        assert_eq!(processed.mono, vec![0.0; 3]);
        assert!((processed.rms - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_stereo_48k_to_mono_16k() {
        let mut processor = CaptureProcessor::new(48000, 2, 16000, 160);

        // 10ms of stereo at 48kHz: 480 frames, 960 samples
        let block: Vec<f32> = (0..960).map(|i| if i % 2 == 0 { 0.5 } else { 0.0 }).collect();
        let chunks = processor.process_block(&block).chunks;

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 160);
        // Downmix averages the channels.
        let expected = crate::format::f32_to_i16(0.25);
        assert!(chunks[0].samples.iter().all(|&s| (s - expected).abs() <= 1));
    }

    #[test]
    fn test_samples_are_clamped() {
        let mut processor = CaptureProcessor::new(16000, 1, 16000, 2);
        let chunks = processor.process_block(&[2.0, -2.0]).chunks;
        assert_eq!(&chunks[0].samples[..], &[i16::MAX, i16::MIN]);
    }

    #[tokio::test]
    async fn test_pipeline_forwards_mock_audio() {
        let backend = MockBackend::new(16000);
        let meter = Arc::new(Mutex::new(VolumeMeter::default()));
        let (tx, mut rx) = mpsc::channel(8);
        let config = CaptureConfig {
            target_sample_rate: 16000,
            chunk_samples: 800,
            poll_interval: Duration::from_millis(5),
        };

        let mut pipeline =
            CapturePipeline::open(&backend, &config, meter.clone(), tx, Arc::new(|_| {}))
                .unwrap();
        backend.push_input(&vec![0.25; 1600]);

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.chunk.len(), 800);
        assert!((first.rms - 0.25).abs() < 1e-6);

        pipeline.close().await;
        pipeline.close().await;
        assert_eq!(backend.input_opens(), 1);
        assert_eq!(backend.input_closes(), 1);
        assert_eq!(meter.lock().level(), 0.0);
    }

    #[tokio::test]
    async fn test_input_meter_sees_downmixed_audio() {
        let backend = MockBackend::with_channels(16000, 2);
        let meter = Arc::new(Mutex::new(VolumeMeter::default()));
        let (tx, mut rx) = mpsc::channel(8);
        let config = CaptureConfig {
            target_sample_rate: 16000,
            chunk_samples: 800,
            poll_interval: Duration::from_millis(5),
        };

        let mut pipeline =
            CapturePipeline::open(&backend, &config, meter.clone(), tx, Arc::new(|_| {}))
                .unwrap();
        // Left and right in antiphase: loud per channel, silent once mixed.
        let frames: Vec<f32> = (0..1600).flat_map(|_| [0.5, -0.5]).collect();
        backend.push_input(&frames);

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!((first.rms - 0.5).abs() < 1e-6);
        assert_eq!(meter.lock().level(), 0.0);

        pipeline.close().await;
    }

    #[tokio::test]
    async fn test_zero_poll_interval_still_captures() {
        let backend = MockBackend::new(16000);
        let meter = Arc::new(Mutex::new(VolumeMeter::default()));
        let (tx, mut rx) = mpsc::channel(8);
        let config = CaptureConfig {
            target_sample_rate: 16000,
            chunk_samples: 800,
            poll_interval: Duration::ZERO,
        };

        let mut pipeline =
            CapturePipeline::open(&backend, &config, meter, tx, Arc::new(|_| {})).unwrap();
        backend.push_input(&vec![0.25; 800]);

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .expect("bridge still running");
        assert_eq!(first.chunk.len(), 800);

        pipeline.close().await;
    }
}
