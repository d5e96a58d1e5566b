//! Short-time Fourier transform.
//!
//! Frames are taken every `hop_length` samples; with `center` the signal is
//! padded by `n_fft / 2` on both sides first, so frame `i` is centered on
//! sample `i * hop_length`.

use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use serde::{Deserialize, Serialize};

/// Analysis window shape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    #[default]
    Hann,
    Hamming,
    Blackman,
    Bartlett,
    /// Rectangular window.
    Ones,
}

impl WindowKind {
    /// Periodic window of the given length.
    pub fn build(self, length: usize) -> Vec<f64> {
        let n = length as f64;
        let tau = 2.0 * std::f64::consts::PI;
        (0..length)
            .map(|i| {
                let x = i as f64;
                match self {
                    WindowKind::Hann => 0.5 * (1.0 - (tau * x / n).cos()),
                    WindowKind::Hamming => 0.54 - 0.46 * (tau * x / n).cos(),
                    WindowKind::Blackman => {
                        0.42 - 0.5 * (tau * x / n).cos() + 0.08 * (2.0 * tau * x / n).cos()
                    }
                    WindowKind::Bartlett => 1.0 - (2.0 * x / n - 1.0).abs(),
                    WindowKind::Ones => 1.0,
                }
            })
            .collect()
    }
}

/// How the signal edges are extended when `center` is set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PadMode {
    #[default]
    Reflect,
    Constant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StftConfig {
    pub n_fft: usize,
    pub hop_length: usize,
    pub win_length: usize,
    pub window: WindowKind,
    pub center: bool,
    pub pad_mode: PadMode,
    /// Exponent applied to the magnitude (1 = magnitude, 2 = power).
    pub power: f64,
}

impl Default for StftConfig {
    fn default() -> Self {
        Self {
            n_fft: 1024,
            hop_length: 256,
            win_length: 1024,
            window: WindowKind::Hann,
            center: true,
            pad_mode: PadMode::Reflect,
            power: 1.0,
        }
    }
}

/// Planned STFT with a cached window and FFT.
pub struct Stft {
    config: StftConfig,
    window: Vec<f64>,
    fft: Arc<dyn Fft<f64>>,
}

impl Stft {
    pub fn new(config: StftConfig) -> Self {
        // A window shorter than n_fft is zero-padded on both sides.
        let short = config.window.build(config.win_length.min(config.n_fft));
        let offset = (config.n_fft - short.len()) / 2;
        let mut window = vec![0.0; config.n_fft];
        window[offset..offset + short.len()].copy_from_slice(&short);

        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(config.n_fft);
        Self {
            config,
            window,
            fft,
        }
    }

    pub fn config(&self) -> &StftConfig {
        &self.config
    }

    /// Number of one-sided frequency bins.
    pub fn num_bins(&self) -> usize {
        self.config.n_fft / 2 + 1
    }

    /// Magnitude spectrogram, `[frames][bins]`.
    pub fn frames(&self, samples: &[f64]) -> Vec<Vec<f64>> {
        let n_fft = self.config.n_fft;
        let hop = self.config.hop_length.max(1);
        let num_bins = self.num_bins();

        let padded = if self.config.center {
            let pad = n_fft / 2;
            match self.config.pad_mode {
                PadMode::Reflect => reflect_pad(samples, pad, pad),
                PadMode::Constant => {
                    let mut padded = vec![0.0; pad];
                    padded.extend_from_slice(samples);
                    padded.extend(std::iter::repeat_n(0.0, pad));
                    padded
                }
            }
        } else {
            samples.to_vec()
        };

        if padded.len() < n_fft {
            return Vec::new();
        }
        let num_frames = (padded.len() - n_fft) / hop + 1;
        let mut frames = Vec::with_capacity(num_frames);
        let mut buffer = vec![Complex::new(0.0, 0.0); n_fft];

        for frame_idx in 0..num_frames {
            let start = frame_idx * hop;
            for (i, slot) in buffer.iter_mut().enumerate() {
                *slot = Complex::new(padded[start + i] * self.window[i], 0.0);
            }
            self.fft.process(&mut buffer);

            let magnitudes = buffer[..num_bins]
                .iter()
                .map(|c| {
                    let mag = c.norm();
                    if self.config.power == 1.0 {
                        mag
                    } else {
                        mag.powf(self.config.power)
                    }
                })
                .collect();
            frames.push(magnitudes);
        }
        frames
    }

    /// Spectrogram laid out `[bins][frames]`, the layout feature tensors use.
    pub fn spectrogram(&self, samples: &[f64]) -> Vec<Vec<f64>> {
        transpose(&self.frames(samples), self.num_bins())
    }
}

/// Linear-magnitude spectrogram with the default STFT settings.
pub fn spectrogram(samples: &[f64]) -> Vec<Vec<f64>> {
    Stft::new(StftConfig::default()).spectrogram(samples)
}

/// Reflect-pad a signal on both sides (edge sample not repeated).
pub fn reflect_pad(signal: &[f64], pad_left: usize, pad_right: usize) -> Vec<f64> {
    let len = signal.len();
    if len < 2 {
        let edge = signal.first().copied().unwrap_or(0.0);
        let mut padded = vec![edge; pad_left];
        padded.extend_from_slice(signal);
        padded.extend(std::iter::repeat_n(edge, pad_right));
        return padded;
    }
    let period = 2 * (len - 1);
    let reflect = |i: isize| -> f64 {
        let mut idx = i.rem_euclid(period as isize) as usize;
        if idx >= len {
            idx = period - idx;
        }
        signal[idx]
    };

    let mut padded = Vec::with_capacity(pad_left + len + pad_right);
    for i in (1..=pad_left as isize).rev() {
        padded.push(reflect(-i));
    }
    padded.extend_from_slice(signal);
    for i in 0..pad_right as isize {
        padded.push(reflect(len as isize + i));
    }
    padded
}

pub(crate) fn transpose(rows: &[Vec<f64>], width: usize) -> Vec<Vec<f64>> {
    let mut out = vec![Vec::with_capacity(rows.len()); width];
    for row in rows {
        for (col, &value) in out.iter_mut().zip(row.iter()) {
            col.push(value);
        }
    }
    out
}
