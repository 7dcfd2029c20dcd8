//! Audio hardware abstraction.
//!
//! The engine never talks to CPAL directly. It asks an [`AudioBackend`] for
//! a microphone stream (samples arrive in a lock-free ring buffer) and a
//! speaker stream (the backend pulls samples from an [`OutputRenderer`]).
//! [`CpalBackend`] drives real hardware; [`MockBackend`] drives tests.

mod cpal;
mod mock;

pub use self::cpal::CpalBackend;
pub use mock::MockBackend;

use std::fmt;
use std::sync::Arc;

pub use crate::pipeline::OutputRenderer;
use crate::VoiceError;

/// Receives descriptions of device failures that happen after a stream
/// was opened (device unplugged, driver error, ...).
pub type DeviceErrorCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Keeps a hardware stream alive. Closing (or dropping) releases it.
#[must_use]
pub struct StreamHandle {
    closer: Option<Box<dyn FnOnce() + Send>>,
}

impl StreamHandle {
    /// Creates a handle that runs `closer` once on release.
    pub fn new(closer: impl FnOnce() + Send + 'static) -> Self {
        Self {
            closer: Some(Box::new(closer)),
        }
    }

    /// Releases the stream. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(closer) = self.closer.take() {
            closer();
        }
    }

    /// Returns `true` until [`close`](Self::close) has run.
    pub fn is_open(&self) -> bool {
        self.closer.is_some()
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("open", &self.is_open())
            .finish()
    }
}

/// A running microphone stream.
pub struct InputStream {
    /// Native sample rate of the samples in `consumer`.
    pub sample_rate: u32,
    /// Interleaved channel count of the samples in `consumer`.
    pub channels: u16,
    /// Raw samples in [-1.0, 1.0], pushed by the device callback.
    pub consumer: ringbuf::HeapCons<f32>,
    /// Keeps the device open.
    pub handle: StreamHandle,
}

/// Source of microphone and speaker streams.
///
/// Implementations must not block inside their audio callbacks.
pub trait AudioBackend: Send + Sync {
    /// Acquires the microphone.
    ///
    /// # Errors
    ///
    /// Returns `DeviceUnavailable` if there is no input device or access is
    /// denied.
    fn open_input(&self, on_error: DeviceErrorCallback) -> Result<InputStream, VoiceError>;

    /// Acquires the speaker and starts pulling mono samples at
    /// `sample_rate` from `renderer`.
    ///
    /// # Errors
    ///
    /// Returns `DeviceUnavailable` if there is no output device.
    fn open_output(
        &self,
        sample_rate: u32,
        renderer: OutputRenderer,
        on_error: DeviceErrorCallback,
    ) -> Result<StreamHandle, VoiceError>;
}
