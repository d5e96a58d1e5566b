//! Fundamental frequency (F0) estimation.
//!
//! Two trackers:
//! - [`PitchTracker`]: frame-synchronous F0 on the feature hop grid, using the
//!   cumulative-mean-normalized difference function (YIN) with parabolic
//!   refinement. Unvoiced frames are reported as `0.0`.
//! - [`detect_pitch_frequency`]: coarse normalized cross-correlation pitch on
//!   10 ms frames, median smoothed.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Settings for [`PitchTracker`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PitchConfig {
    pub sample_rate: u32,
    /// Frame step in samples; F0 is reported every `hop_length / sample_rate` seconds.
    pub hop_length: usize,
    pub f0_floor: f64,
    pub f0_ceil: f64,
    /// Aperiodicity threshold on the normalized difference function.
    pub threshold: f64,
    /// Frames quieter than this RMS are unvoiced.
    pub silence_rms: f64,
}

impl Default for PitchConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            hop_length: 256,
            f0_floor: 71.0,
            f0_ceil: 800.0,
            threshold: 0.15,
            silence_rms: 1e-4,
        }
    }
}

/// F0 contour with the frame times it was sampled at.
#[derive(Debug, Clone, PartialEq)]
pub struct F0Track {
    /// Hz per frame, `0.0` when unvoiced.
    pub f0: Vec<f64>,
    /// Frame centers in seconds.
    pub times: Vec<f64>,
}

impl F0Track {
    pub fn len(&self) -> usize {
        self.f0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.f0.is_empty()
    }

    /// Mean spacing between frames in seconds.
    pub fn frame_step(&self) -> f64 {
        if self.times.len() < 2 {
            return 0.0;
        }
        let steps = self.times.windows(2).map(|w| w[1] - w[0]).sum::<f64>();
        steps / (self.times.len() - 1) as f64
    }
}

pub struct PitchTracker {
    config: PitchConfig,
}

impl PitchTracker {
    pub fn new(config: PitchConfig) -> Result<Self> {
        if config.f0_floor <= 0.0 || config.f0_ceil <= config.f0_floor {
            return Err(Error::Config(format!(
                "invalid F0 range {}..{}",
                config.f0_floor, config.f0_ceil
            )));
        }
        if config.hop_length == 0 {
            return Err(Error::Config("pitch hop_length must be non-zero".into()));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &PitchConfig {
        &self.config
    }

    /// Estimate F0 for every frame `0..=len / hop_length`.
    pub fn track(&self, samples: &[f64]) -> F0Track {
        let sr = self.config.sample_rate as f64;
        let hop = self.config.hop_length;
        let num_frames = samples.len() / hop + 1;

        let tau_min = ((sr / self.config.f0_ceil).floor() as usize).max(2);
        let tau_max = (sr / self.config.f0_floor).ceil() as usize;
        let window = tau_max;

        let mut f0 = Vec::with_capacity(num_frames);
        let mut times = Vec::with_capacity(num_frames);
        for frame in 0..num_frames {
            let center = frame * hop;
            times.push(center as f64 / sr);
            let start = center as isize - (window / 2) as isize;
            f0.push(self.frame_f0(samples, start, window, tau_min, tau_max));
        }
        F0Track { f0, times }
    }

    fn frame_f0(
        &self,
        samples: &[f64],
        start: isize,
        window: usize,
        tau_min: usize,
        tau_max: usize,
    ) -> f64 {
        let at = |i: isize| -> f64 {
            if i < 0 {
                0.0
            } else {
                samples.get(i as usize).copied().unwrap_or(0.0)
            }
        };

        let energy = (0..window).map(|j| at(start + j as isize).powi(2)).sum::<f64>();
        if (energy / window as f64).sqrt() < self.config.silence_rms {
            return 0.0;
        }

        // Difference function d(tau) and its cumulative-mean normalization.
        let mut cmnd = vec![1.0; tau_max + 2];
        let mut running = 0.0;
        for tau in 1..=tau_max + 1 {
            let d: f64 = (0..window)
                .map(|j| {
                    let j = start + j as isize;
                    (at(j) - at(j + tau as isize)).powi(2)
                })
                .sum();
            running += d;
            cmnd[tau] = if running > 0.0 {
                d * tau as f64 / running
            } else {
                1.0
            };
        }

        let mut best = None;
        let mut tau = tau_min;
        while tau <= tau_max {
            if cmnd[tau] < self.config.threshold {
                while tau < tau_max && cmnd[tau + 1] < cmnd[tau] {
                    tau += 1;
                }
                best = Some(tau);
                break;
            }
            tau += 1;
        }
        let Some(tau) = best else {
            return 0.0;
        };

        // Parabolic interpolation around the minimum.
        let (a, b, c) = (cmnd[tau - 1], cmnd[tau], cmnd[tau + 1]);
        let denom = a - 2.0 * b + c;
        let shift = if denom.abs() > 1e-12 {
            (0.5 * (a - c) / denom).clamp(-1.0, 1.0)
        } else {
            0.0
        };
        let period = tau as f64 + shift;
        let f0 = self.config.sample_rate as f64 / period;
        if f0 < self.config.f0_floor || f0 > self.config.f0_ceil {
            0.0
        } else {
            f0
        }
    }
}

/// Coarse pitch by normalized cross-correlation over 10 ms frames.
///
/// Searches lags for 85–3400 Hz and median-smooths the lag track over 30
/// frames. Returns one frequency per frame.
pub fn detect_pitch_frequency(samples: &[f64], sample_rate: u32) -> Vec<f64> {
    const FRAME_TIME: f64 = 0.01;
    const FREQ_LOW: f64 = 85.0;
    const FREQ_HIGH: f64 = 3400.0;
    const MEDIAN_WINDOW: usize = 30;

    let sr = sample_rate as f64;
    let frame_size = (sr * FRAME_TIME).ceil() as usize;
    let lag_min = (sr / FREQ_HIGH).ceil() as usize;
    let lag_max = (sr / FREQ_LOW).ceil() as usize;
    if samples.is_empty() || frame_size == 0 {
        return Vec::new();
    }
    let num_frames = samples.len().div_ceil(frame_size);
    let at = |i: usize| samples.get(i).copied().unwrap_or(0.0);

    let lags: Vec<usize> = (0..num_frames)
        .map(|frame| {
            let start = frame * frame_size;
            let scores: Vec<f64> = (lag_min..=lag_max)
                .map(|lag| {
                    let (mut num, mut e0, mut e1) = (0.0, 0.0, 0.0);
                    for n in start..start + frame_size {
                        let (x0, x1) = (at(n), at(n + lag));
                        num += x0 * x1;
                        e0 += x0 * x0;
                        e1 += x1 * x1;
                    }
                    num / (e0 * e1).sqrt().max(1e-9)
                })
                .collect();
            let best = scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            // Prefer the shortest period that nearly reaches the best score,
            // so multiples of the true period don't win on rounding noise.
            let Some(mut idx) = scores.iter().position(|&s| s >= 0.99 * best) else {
                return lag_max;
            };
            while idx + 1 < scores.len() && scores[idx + 1] > scores[idx] {
                idx += 1;
            }
            lag_min + idx
        })
        .collect();

    median_filter(&lags, MEDIAN_WINDOW)
        .into_iter()
        .map(|lag| sr / lag as f64)
        .collect()
}

fn median_filter(values: &[usize], window: usize) -> Vec<usize> {
    let half = window / 2;
    (0..values.len())
        .map(|i| {
            let lo = i.saturating_sub(half);
            let hi = (i + half + 1).min(values.len());
            let mut slice = values[lo..hi].to_vec();
            slice.sort_unstable();
            slice[slice.len() / 2]
        })
        .collect()
}
