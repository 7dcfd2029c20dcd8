//! Sample rate conversion.
//!
//! Linear interpolation, which is fast and adequate for speech. The
//! resampler keeps its fractional read position and the last input sample
//! between calls, so feeding a signal block by block produces the same
//! output as feeding it in one piece.

/// Streaming mono resampler.
///
/// When the source and target rates are equal, [`process`](Self::process)
/// is an identity pass.
///
/// # Example
///
/// ```
/// use stream_voice::format::StreamResampler;
///
/// let mut resampler = StreamResampler::new(48000, 16000);
/// let out = resampler.process(&vec![0.0f32; 480]);
/// assert_eq!(out.len(), 160);
/// ```
#[derive(Debug, Clone)]
pub struct StreamResampler {
    from_rate: u32,
    to_rate: u32,
    /// Source samples advanced per output sample.
    step: f64,
    /// Read position relative to the start of the pending buffer.
    position: f64,
    /// Last sample of the previous block, kept for interpolation.
    carry: Option<f32>,
}

impl StreamResampler {
    /// Creates a resampler from `from_rate` to `to_rate`.
    ///
    /// A zero rate on either side disables conversion.
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        let step = if from_rate == 0 || to_rate == 0 {
            1.0
        } else {
            f64::from(from_rate) / f64::from(to_rate)
        };
        Self {
            from_rate,
            to_rate,
            step,
            position: 0.0,
            carry: None,
        }
    }

    /// Returns `true` if this resampler changes the sample rate.
    pub fn is_active(&self) -> bool {
        self.from_rate != self.to_rate && self.from_rate != 0 && self.to_rate != 0
    }

    /// Source sample rate in Hz.
    pub fn from_rate(&self) -> u32 {
        self.from_rate
    }

    /// Target sample rate in Hz.
    pub fn to_rate(&self) -> u32 {
        self.to_rate
    }

    /// Resamples the next block of input.
    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        if !self.is_active() {
            return input.to_vec();
        }
        if input.is_empty() {
            return Vec::new();
        }

        let mut pending = Vec::with_capacity(input.len() + 1);
        pending.extend(self.carry);
        pending.extend_from_slice(input);

        let estimate = (input.len() as f64 / self.step).ceil() as usize + 1;
        let mut output = Vec::with_capacity(estimate);

        let last_index = pending.len() - 1;
        while self.position < last_index as f64 {
            let index = self.position.floor() as usize;
            let frac = (self.position - index as f64) as f32;
            let s1 = pending[index];
            let s2 = pending[index + 1];
            output.push(s1 + (s2 - s1) * frac);
            self.position += self.step;
        }

        // Keep the last sample; everything before it has been consumed.
        self.position -= last_index as f64;
        self.carry = pending.last().copied();

        output
    }

    /// Forgets any carried state, as if the stream were starting over.
    pub fn reset(&mut self) {
        self.position = 0.0;
        self.carry = None;
    }
}
