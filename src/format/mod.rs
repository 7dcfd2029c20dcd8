//! Audio format conversion utilities.
//!
//! This module provides utilities for converting between audio formats:
//! - Sample format conversion (f32 ↔ i16, PCM16 ↔ little-endian bytes)
//! - Channel conversion (interleaved → mono)
//! - Sample rate conversion (streaming resampling)
//! - Volume metering in the frequency domain

mod analyser;
mod convert;
mod resample;

pub use analyser::{VolumeMeter, DEFAULT_FFT_SIZE};
pub use convert::{
    downmix_to_mono, f32_slice_to_i16, f32_to_i16, i16_slice_to_f32, i16_to_f32,
    pcm16_from_le_bytes, pcm16_to_le_bytes,
};
pub use resample::StreamResampler;

/// Root-mean-square level of a block of float samples.
///
/// Returns 0.0 for an empty block.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    (sum / samples.len() as f64).sqrt() as f32
}
