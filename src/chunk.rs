//! PCM audio chunk passed between the pipelines and across the wire.

use std::sync::Arc;
use std::time::Duration;

/// An immutable buffer of mono 16-bit PCM samples.
///
/// `AudioChunk` is the unit of audio moving through the engine: the capture
/// pipeline emits them for the socket, and inbound `audio` frames are decoded
/// into them for playback and for the external audio sink.
///
/// Samples are stored in an `Arc<Vec<i16>>`, so handing the same chunk to the
/// sink and to the playback queue does not copy the audio.
///
/// # Example
///
/// ```
/// use stream_voice::AudioChunk;
/// use std::time::Duration;
///
/// let chunk = AudioChunk::new(vec![0i16; 4000], 16000);
/// assert_eq!(chunk.duration(), Duration::from_millis(250));
/// ```
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// PCM audio samples in 16-bit signed integer format.
    pub samples: Arc<Vec<i16>>,

    /// Sample rate in Hz (e.g., 16000, 24000).
    pub sample_rate: u32,
}

impl AudioChunk {
    /// Creates a new `AudioChunk`.
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples: Arc::new(samples),
            sample_rate,
        }
    }

    /// Decodes little-endian PCM16 bytes into a chunk.
    ///
    /// A trailing odd byte cannot form a sample and is ignored.
    pub fn from_le_bytes(bytes: &[u8], sample_rate: u32) -> Self {
        Self::new(crate::format::pcm16_from_le_bytes(bytes), sample_rate)
    }

    /// Encodes the samples as little-endian PCM16 bytes.
    ///
    /// This is the raw byte form expected by the wire protocol and by
    /// audio renderers.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        crate::format::pcm16_to_le_bytes(&self.samples)
    }

    /// Returns the duration of this audio chunk.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(self.sample_rate))
    }

    /// Returns the number of samples in this chunk.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns `true` if this chunk contains no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_16khz() {
        let chunk = AudioChunk::new(vec![0i16; 1600], 16000);
        assert_eq!(chunk.duration(), Duration::from_millis(100));
    }

    #[test]
    fn test_duration_24khz() {
        let chunk = AudioChunk::new(vec![0i16; 2400], 24000);
        assert_eq!(chunk.duration(), Duration::from_millis(100));
    }

    #[test]
    fn test_empty_chunk() {
        let chunk = AudioChunk::new(vec![], 16000);
        assert!(chunk.is_empty());
        assert_eq!(chunk.len(), 0);
        assert_eq!(chunk.duration(), Duration::ZERO);
    }

    #[test]
    fn test_zero_sample_rate() {
        let chunk = AudioChunk::new(vec![0i16; 100], 0);
        assert_eq!(chunk.duration(), Duration::ZERO);
    }

    #[test]
    fn test_le_bytes_layout() {
        let chunk = AudioChunk::new(vec![1, -2, 0x1234], 16000);
        assert_eq!(chunk.to_le_bytes(), vec![0x01, 0x00, 0xFE, 0xFF, 0x34, 0x12]);

        let decoded = AudioChunk::from_le_bytes(&chunk.to_le_bytes(), 16000);
        assert_eq!(*decoded.samples, vec![1, -2, 0x1234]);
    }

    #[test]
    fn test_from_le_bytes_ignores_odd_byte() {
        let chunk = AudioChunk::from_le_bytes(&[0x10, 0x00, 0x7F], 24000);
        assert_eq!(*chunk.samples, vec![0x10]);
    }
}
