//! CPAL-backed microphone and speaker streams.
//!
//! CPAL streams are not `Send` on every platform, so each stream is built,
//! played and dropped on a dedicated thread. The [`StreamHandle`] returned to
//! the caller signals that thread to drop the stream and waits for it.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, SampleRate, Stream, StreamConfig};
use ringbuf::traits::{Producer, Split};
use ringbuf::HeapRb;

use super::{AudioBackend, DeviceErrorCallback, InputStream, StreamHandle};
use crate::format::{f32_to_i16, i16_to_f32, StreamResampler};
use crate::pipeline::OutputRenderer;
use crate::VoiceError;

/// Frames rendered per pull when the output stream resamples.
const RENDER_QUANTUM: usize = 128;

/// Audio backend for the host's real devices.
///
/// # Example
///
/// ```no_run
/// use stream_voice::device::CpalBackend;
///
/// let backend = CpalBackend::new().with_input_device("USB Microphone");
/// ```
#[derive(Debug, Clone)]
pub struct CpalBackend {
    input_device: Option<String>,
    output_device: Option<String>,
    buffer_duration: Duration,
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CpalBackend {
    /// Uses the default input and output devices.
    pub fn new() -> Self {
        Self {
            input_device: None,
            output_device: None,
            buffer_duration: Duration::from_secs(2),
        }
    }

    /// Captures from the input device with this name instead of the default.
    #[must_use]
    pub fn with_input_device(mut self, name: impl Into<String>) -> Self {
        self.input_device = Some(name.into());
        self
    }

    /// Plays through the output device with this name instead of the default.
    #[must_use]
    pub fn with_output_device(mut self, name: impl Into<String>) -> Self {
        self.output_device = Some(name.into());
        self
    }

    /// How much microphone audio the ring buffer holds before dropping.
    ///
    /// Default: 2 seconds
    #[must_use]
    pub fn with_buffer_duration(mut self, duration: Duration) -> Self {
        self.buffer_duration = duration;
        self
    }

    /// Lists all available input devices.
    ///
    /// # Errors
    ///
    /// Returns an error if the audio host cannot be accessed.
    pub fn input_device_names() -> Result<Vec<String>, VoiceError> {
        let devices = cpal::default_host()
            .input_devices()
            .map_err(|e| VoiceError::device_unavailable("input", e))?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }

    /// Lists all available output devices.
    ///
    /// # Errors
    ///
    /// Returns an error if the audio host cannot be accessed.
    pub fn output_device_names() -> Result<Vec<String>, VoiceError> {
        let devices = cpal::default_host()
            .output_devices()
            .map_err(|e| VoiceError::device_unavailable("output", e))?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }
}

impl AudioBackend for CpalBackend {
    fn open_input(&self, on_error: DeviceErrorCallback) -> Result<InputStream, VoiceError> {
        let name = self.input_device.clone();
        let buffer_duration = self.buffer_duration;

        let ((format, consumer), handle) = spawn_stream("stream-voice-input", move || {
            let device = find_input_device(name.as_deref())?;
            let supported = device
                .default_input_config()
                .map_err(|e| VoiceError::device_unavailable(device_name(&device), e))?;
            let sample_format = supported.sample_format();
            let config: StreamConfig = supported.into();

            let capacity = (buffer_duration.as_secs_f64()
                * f64::from(config.sample_rate.0)
                * f64::from(config.channels))
            .ceil() as usize;
            let (producer, consumer) = HeapRb::<f32>::new(capacity.max(1024)).split();

            let stream = match sample_format {
                SampleFormat::F32 => build_f32_input(&device, &config, producer, on_error)?,
                SampleFormat::I16 => build_i16_input(&device, &config, producer, on_error)?,
                format => {
                    return Err(VoiceError::UnsupportedFormat {
                        format: format!("{format:?}"),
                    });
                }
            };
            stream
                .play()
                .map_err(|e| VoiceError::device_unavailable(device_name(&device), e))?;

            tracing::info!(
                device = %device_name(&device),
                sample_rate = config.sample_rate.0,
                channels = config.channels,
                "Microphone opened"
            );
            Ok((stream, ((config.sample_rate.0, config.channels), consumer)))
        })?;

        Ok(InputStream {
            sample_rate: format.0,
            channels: format.1,
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
        let name = self.output_device.clone();

        let ((), handle) = spawn_stream("stream-voice-output", move || {
            let device = find_output_device(name.as_deref())?;
            let (config, sample_format) = output_config(&device, sample_rate)?;
            let source = RenderSource::new(renderer, sample_rate, config.sample_rate.0);

            let stream = match sample_format {
                SampleFormat::F32 => build_f32_output(&device, &config, source, on_error)?,
                SampleFormat::I16 => build_i16_output(&device, &config, source, on_error)?,
                format => {
                    return Err(VoiceError::UnsupportedFormat {
                        format: format!("{format:?}"),
                    });
                }
            };
            stream
                .play()
                .map_err(|e| VoiceError::device_unavailable(device_name(&device), e))?;

            tracing::info!(
                device = %device_name(&device),
                sample_rate,
                device_rate = config.sample_rate.0,
                channels = config.channels,
                "Speaker opened"
            );
            Ok((stream, ()))
        })?;

        Ok(handle)
    }
}

/// Builds a stream on its own thread and parks the thread until the
/// returned handle is closed.
fn spawn_stream<T, F>(thread_name: &str, build: F) -> Result<(T, StreamHandle), VoiceError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<(Stream, T), VoiceError> + Send + 'static,
{
    let (ready_tx, ready_rx) = mpsc::channel::<Result<T, VoiceError>>();
    let (stop_tx, stop_rx) = mpsc::channel::<()>();

    let thread = thread::Builder::new()
        .name(thread_name.to_string())
        .spawn(move || match build() {
            Ok((stream, value)) => {
                if ready_tx.send(Ok(value)).is_err() {
                    return;
                }
                // Returns on an explicit stop or when the handle is dropped.
                let _ = stop_rx.recv();
                drop(stream);
            }
            Err(e) => {
                let _ = ready_tx.send(Err(e));
            }
        })
        .map_err(|e| VoiceError::device_unavailable(thread_name, e))?;

    let value = ready_rx
        .recv()
        .map_err(|_| VoiceError::device_unavailable(thread_name, "stream thread exited"))??;

    let handle = StreamHandle::new(move || {
        let _ = stop_tx.send(());
        if thread.join().is_err() {
            tracing::warn!("Audio stream thread panicked");
        }
    });
    Ok((value, handle))
}

fn device_name(device: &Device) -> String {
    device.name().unwrap_or_else(|_| "unknown".to_string())
}

fn find_input_device(name: Option<&str>) -> Result<Device, VoiceError> {
    let host = cpal::default_host();
    match name {
        None => host
            .default_input_device()
            .ok_or_else(|| VoiceError::device_unavailable("default input", "no device")),
        Some(name) => host
            .input_devices()
            .map_err(|e| VoiceError::device_unavailable(name, e))?
            .find(|d| d.name().is_ok_and(|n| n == name))
            .ok_or_else(|| VoiceError::device_unavailable(name, "not found")),
    }
}

fn find_output_device(name: Option<&str>) -> Result<Device, VoiceError> {
    let host = cpal::default_host();
    match name {
        None => host
            .default_output_device()
            .ok_or_else(|| VoiceError::device_unavailable("default output", "no device")),
        Some(name) => host
            .output_devices()
            .map_err(|e| VoiceError::device_unavailable(name, e))?
            .find(|d| d.name().is_ok_and(|n| n == name))
            .ok_or_else(|| VoiceError::device_unavailable(name, "not found")),
    }
}

/// Prefers a config that runs at `sample_rate` natively; falls back to the
/// device default and resamples.
fn output_config(
    device: &Device,
    sample_rate: u32,
) -> Result<(StreamConfig, SampleFormat), VoiceError> {
    let native = device.supported_output_configs().ok().and_then(|mut ranges| {
        ranges.find(|range| {
            matches!(range.sample_format(), SampleFormat::F32 | SampleFormat::I16)
                && range.min_sample_rate().0 <= sample_rate
                && range.max_sample_rate().0 >= sample_rate
        })
    });

    if let Some(range) = native {
        let supported = range.with_sample_rate(SampleRate(sample_rate));
        return Ok((supported.config(), supported.sample_format()));
    }

    let supported = device
        .default_output_config()
        .map_err(|e| VoiceError::device_unavailable(device_name(device), e))?;
    Ok((supported.config(), supported.sample_format()))
}

fn report_errors(on_error: DeviceErrorCallback) -> impl FnMut(cpal::StreamError) + Send {
    move |err| {
        tracing::error!("Audio stream error: {}", err);
        on_error(err.to_string());
    }
}

fn build_f32_input(
    device: &Device,
    config: &StreamConfig,
    mut producer: ringbuf::HeapProd<f32>,
    on_error: DeviceErrorCallback,
) -> Result<Stream, VoiceError> {
    device
        .build_input_stream(
            config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                // Non-blocking push - drops samples if buffer is full
                let _ = producer.push_slice(data);
            },
            report_errors(on_error),
            None,
        )
        .map_err(|e| VoiceError::device_unavailable(device_name(device), e))
}

fn build_i16_input(
    device: &Device,
    config: &StreamConfig,
    mut producer: ringbuf::HeapProd<f32>,
    on_error: DeviceErrorCallback,
) -> Result<Stream, VoiceError> {
    device
        .build_input_stream(
            config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                for &sample in data {
                    let _ = producer.try_push(i16_to_f32(sample));
                }
            },
            report_errors(on_error),
            None,
        )
        .map_err(|e| VoiceError::device_unavailable(device_name(device), e))
}

fn build_f32_output(
    device: &Device,
    config: &StreamConfig,
    mut source: RenderSource,
    on_error: DeviceErrorCallback,
) -> Result<Stream, VoiceError> {
    let channels = usize::from(config.channels.max(1));
    device
        .build_output_stream(
            config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                source.fill_interleaved(data, channels, |s| s);
            },
            report_errors(on_error),
            None,
        )
        .map_err(|e| VoiceError::device_unavailable(device_name(device), e))
}

fn build_i16_output(
    device: &Device,
    config: &StreamConfig,
    mut source: RenderSource,
    on_error: DeviceErrorCallback,
) -> Result<Stream, VoiceError> {
    let channels = usize::from(config.channels.max(1));
    device
        .build_output_stream(
            config,
            move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                source.fill_interleaved(data, channels, f32_to_i16);
            },
            report_errors(on_error),
            None,
        )
        .map_err(|e| VoiceError::device_unavailable(device_name(device), e))
}

/// Pulls mono audio from the renderer at the session rate and adapts it to
/// the device rate and channel layout.
struct RenderSource {
    renderer: OutputRenderer,
    resampler: StreamResampler,
    pending: Vec<f32>,
    scratch: Vec<f32>,
    mono: Vec<f32>,
}

impl RenderSource {
    fn new(renderer: OutputRenderer, source_rate: u32, device_rate: u32) -> Self {
        Self {
            renderer,
            resampler: StreamResampler::new(source_rate, device_rate),
            pending: Vec::new(),
            scratch: vec![0.0; RENDER_QUANTUM],
            mono: Vec::new(),
        }
    }

    /// Produces exactly `frames` mono samples into `self.mono`.
    fn render_mono(&mut self, frames: usize) {
        self.mono.clear();
        if !self.resampler.is_active() {
            self.mono.resize(frames, 0.0);
            self.renderer.render(&mut self.mono);
            return;
        }

        while self.pending.len() < frames {
            self.scratch.fill(0.0);
            self.renderer.render(&mut self.scratch);
            let converted = self.resampler.process(&self.scratch);
            self.pending.extend_from_slice(&converted);
        }
        self.mono.extend(self.pending.drain(..frames));
    }

    fn fill_interleaved<S: Copy>(
        &mut self,
        data: &mut [S],
        channels: usize,
        convert: impl Fn(f32) -> S,
    ) {
        let frames = data.len() / channels;
        self.render_mono(frames);
        for (frame, &sample) in data.chunks_mut(channels).zip(self.mono.iter()) {
            frame.fill(convert(sample));
        }
    }
}
