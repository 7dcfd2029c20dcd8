//! Frequency-domain volume metering.
//!
//! Mirrors what a browser analyser node reports: the most recent block is
//! Blackman-windowed, transformed, and every bin's magnitude is mapped from
//! a decibel window onto [0, 1]. The meter level is the mean over bins.

use std::f32::consts::PI;
use std::sync::Arc;

use parking_lot::Mutex;

/// Default transform size in samples.
pub const DEFAULT_FFT_SIZE: usize = 512;

/// Bin magnitudes at or below this level read as zero.
const MIN_DECIBELS: f32 = -100.0;

/// Bin magnitudes at or above this level read as one.
const MAX_DECIBELS: f32 = -30.0;

/// Volume meter over the most recently recorded block of samples.
///
/// Clones share the window, so cloning costs one block copy.
#[derive(Debug, Clone)]
pub struct VolumeMeter {
    fft_size: usize,
    window: Arc<[f32]>,
    block: Vec<f32>,
}

impl Default for VolumeMeter {
    fn default() -> Self {
        Self::new(DEFAULT_FFT_SIZE)
    }
}

impl VolumeMeter {
    /// Creates a meter. `fft_size` is rounded up to a power of two.
    pub fn new(fft_size: usize) -> Self {
        let fft_size = fft_size.max(2).next_power_of_two();
        let n = fft_size as f32;
        let window = (0..fft_size)
            .map(|i| {
                let x = i as f32 / n;
                0.42 - 0.5 * (2.0 * PI * x).cos() + 0.08 * (4.0 * PI * x).cos()
            })
            .collect();
        Self {
            fft_size,
            window,
            block: Vec::new(),
        }
    }

    /// Replaces the metered block with the tail of `samples`.
    pub fn record(&mut self, samples: &[f32]) {
        let start = samples.len().saturating_sub(self.fft_size);
        self.block.clear();
        self.block.extend_from_slice(&samples[start..]);
    }

    /// Forgets the metered block; the level reads zero until the next record.
    pub fn clear(&mut self) {
        self.block.clear();
    }

    /// Reads the level of a shared meter. Only the block copy happens under
    /// the lock; the transform runs after it is released.
    pub fn shared_level(meter: &Mutex<VolumeMeter>) -> f32 {
        let snapshot = meter.lock().clone();
        snapshot.level()
    }

    /// Returns the mean normalised bin level in [0, 1].
    pub fn level(&self) -> f32 {
        if self.block.is_empty() {
            return 0.0;
        }

        let mut re = vec![0.0f32; self.fft_size];
        let mut im = vec![0.0f32; self.fft_size];
        for (i, &s) in self.block.iter().enumerate() {
            re[i] = s * self.window[i];
        }
        fft_in_place(&mut re, &mut im);

        let bins = self.fft_size / 2;
        let scale = 1.0 / self.fft_size as f32;
        let total: f32 = (0..bins)
            .map(|k| {
                let magnitude = (re[k] * re[k] + im[k] * im[k]).sqrt() * scale;
                normalise_decibels(magnitude)
            })
            .sum();

        (total / bins as f32).clamp(0.0, 1.0)
    }
}

fn normalise_decibels(magnitude: f32) -> f32 {
    if magnitude <= 0.0 {
        return 0.0;
    }
    let db = 20.0 * magnitude.log10();
    ((db - MIN_DECIBELS) / (MAX_DECIBELS - MIN_DECIBELS)).clamp(0.0, 1.0)
}

/// Iterative radix-2 Cooley-Tukey transform. Length must be a power of two.
fn fft_in_place(re: &mut [f32], im: &mut [f32]) {
    let n = re.len();
    if n < 2 {
        return;
    }

    let mut j = 0;
    for i in 1..n {
        let mut bit = n >> 1;
        while j & bit != 0 {
            j ^= bit;
            bit >>= 1;
        }
        j |= bit;
        if i < j {
            re.swap(i, j);
            im.swap(i, j);
        }
    }

    let mut len = 2;
    while len <= n {
        let angle = -2.0 * PI / len as f32;
        let (w_im, w_re) = angle.sin_cos();
        for start in (0..n).step_by(len) {
            let (mut cur_re, mut cur_im) = (1.0f32, 0.0f32);
            for k in 0..len / 2 {
                let a = start + k;
                let b = a + len / 2;
                let t_re = re[b] * cur_re - im[b] * cur_im;
                let t_im = re[b] * cur_im + im[b] * cur_re;
                re[b] = re[a] - t_re;
                im[b] = im[a] - t_im;
                re[a] += t_re;
                im[a] += t_im;
                let next_re = cur_re * w_re - cur_im * w_im;
                cur_im = cur_re * w_im + cur_im * w_re;
                cur_re = next_re;
            }
        }
        len <<= 1;
    }
}
