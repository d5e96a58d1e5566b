//! Harmonic / aperiodic decomposition on the F0 grid.
//!
//! Each frame is analysed with a Hann window whose length follows the local
//! pitch period (three periods), so the harmonic structure is resolved
//! without smearing across pitch changes:
//!
//! ```text
//! window  = hann(2·round(1.5·sr/f0) + 1)   f0 floored at 3·sr/(fft_size-3)
//! power   = |FFT(window · (x - mean))|²    zero-padded to fft_size
//! envelope(k)  = mean(power[k ± f0/3])                 (harmonic part)
//! aperiodic(k) = min(power[k ± f0/2]) / max(...)       (valley / peak)
//! ```
//!
//! Unvoiced frames use a 500 Hz analysis pitch and are fully aperiodic.

use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use super::pitch::F0Track;
use crate::{Error, Result};

const UNVOICED_F0: f64 = 500.0;
const MIN_APERIODICITY: f64 = 0.001;
const MAX_APERIODICITY: f64 = 1.0 - 1e-12;

pub struct EnvelopeAnalyzer {
    sample_rate: u32,
    fft_size: usize,
    f0_floor: f64,
    fft: Arc<dyn Fft<f64>>,
}

impl EnvelopeAnalyzer {
    pub fn new(sample_rate: u32, fft_size: usize) -> Result<Self> {
        if fft_size < 8 {
            return Err(Error::Config(format!("fft_size {fft_size} is too small")));
        }
        let f0_floor = 3.0 * sample_rate as f64 / (fft_size as f64 - 3.0);
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(fft_size);
        Ok(Self {
            sample_rate,
            fft_size,
            f0_floor,
            fft,
        })
    }

    pub fn num_bins(&self) -> usize {
        self.fft_size / 2 + 1
    }

    /// Lowest F0 the window length can represent.
    pub fn f0_floor(&self) -> f64 {
        self.f0_floor
    }

    fn analysis_f0(&self, f0: f64) -> f64 {
        if f0 <= 0.0 {
            UNVOICED_F0
        } else {
            f0.max(self.f0_floor)
        }
    }

    fn frame_power(&self, samples: &[f64], time: f64, f0: f64) -> Vec<f64> {
        let sr = self.sample_rate as f64;
        let half = (1.5 * sr / f0).round() as isize;
        let half = half.min((self.fft_size as isize - 1) / 2);
        let center = (time * sr).round() as isize;
        let length = (2 * half + 1) as usize;

        let window: Vec<f64> = (0..length)
            .map(|j| {
                0.5 - 0.5 * (2.0 * std::f64::consts::PI * (j + 1) as f64 / (length + 1) as f64).cos()
            })
            .collect();
        let segment: Vec<f64> = (0..length)
            .map(|j| {
                let idx = center - half + j as isize;
                if idx < 0 {
                    0.0
                } else {
                    samples.get(idx as usize).copied().unwrap_or(0.0)
                }
            })
            .collect();

        // Remove the windowed DC component before transforming.
        let weight: f64 = window.iter().sum();
        let mean = segment.iter().zip(&window).map(|(x, w)| x * w).sum::<f64>() / weight;

        let mut buffer = vec![Complex::new(0.0, 0.0); self.fft_size];
        for (j, slot) in buffer.iter_mut().take(length).enumerate() {
            *slot = Complex::new((segment[j] - mean) * window[j], 0.0);
        }
        self.fft.process(&mut buffer);
        buffer[..self.num_bins()].iter().map(|c| c.norm_sqr()).collect()
    }

    fn bins_for(&self, hz: f64) -> usize {
        (hz * self.fft_size as f64 / self.sample_rate as f64).round() as usize
    }

    /// Smoothed power spectral envelope, `[frames][fft_size/2 + 1]`.
    pub fn spectral_envelope(&self, samples: &[f64], track: &F0Track) -> Vec<Vec<f64>> {
        track
            .f0
            .iter()
            .zip(&track.times)
            .map(|(&f0, &time)| {
                let f0 = self.analysis_f0(f0);
                let power = self.frame_power(samples, time, f0);
                let radius = self.bins_for(f0 / 3.0);
                band_reduce(&power, radius, |band| {
                    band.iter().sum::<f64>() / band.len() as f64
                })
                .into_iter()
                .map(|v| v.max(1e-16))
                .collect()
            })
            .collect()
    }

    /// Band aperiodicity in `[0.001, 1)`, `[frames][fft_size/2 + 1]`.
    pub fn aperiodicity(&self, samples: &[f64], track: &F0Track) -> Vec<Vec<f64>> {
        let num_bins = self.num_bins();
        track
            .f0
            .iter()
            .zip(&track.times)
            .map(|(&f0, &time)| {
                if f0 <= 0.0 {
                    return vec![MAX_APERIODICITY; num_bins];
                }
                let f0 = self.analysis_f0(f0);
                let power = self.frame_power(samples, time, f0);
                let radius = self.bins_for(f0 / 2.0).max(1);
                band_reduce(&power, radius, |band| {
                    let max = band.iter().cloned().fold(0.0, f64::max);
                    let min = band.iter().cloned().fold(f64::INFINITY, f64::min);
                    if max <= 0.0 { 1.0 } else { min / max }
                })
                .into_iter()
                .map(|v| v.clamp(MIN_APERIODICITY, MAX_APERIODICITY))
                .collect()
            })
            .collect()
    }
}

fn band_reduce(values: &[f64], radius: usize, reduce: impl Fn(&[f64]) -> f64) -> Vec<f64> {
    (0..values.len())
        .map(|k| {
            let lo = k.saturating_sub(radius);
            let hi = (k + radius + 1).min(values.len());
            reduce(&values[lo..hi])
        })
        .collect()
}

/// Keep the first `keep` bins and lay out as `[bins][frames]`.
pub fn to_feature_rows(frames: &[Vec<f64>], keep: usize) -> Vec<Vec<f64>> {
    let width = frames.first().map_or(0, |f| f.len().min(keep));
    let mut rows = vec![Vec::with_capacity(frames.len()); width];
    for frame in frames {
        for (row, &value) in rows.iter_mut().zip(frame) {
            row.push(value);
        }
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::pitch::{PitchConfig, PitchTracker};

    fn tone(freq: f64, n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| (2.0 * std::f64::consts::PI * freq * i as f64 / 16000.0).sin())
            .collect()
    }

    #[test]
    fn test_f0_floor_matches_fft_size() {
        let analyzer = EnvelopeAnalyzer::new(16000, 256).unwrap();
        assert!((analyzer.f0_floor() - 3.0 * 16000.0 / 253.0).abs() < 1e-9);
        assert_eq!(analyzer.num_bins(), 129);
    }

    #[test]
    fn test_envelope_peaks_near_tone() {
        let samples = tone(1000.0, 8000);
        let track = PitchTracker::new(PitchConfig::default())
            .unwrap()
            .track(&samples);
        let analyzer = EnvelopeAnalyzer::new(16000, 256).unwrap();
        let env = analyzer.spectral_envelope(&samples, &track);
        assert_eq!(env.len(), track.len());
        let frame = &env[env.len() / 2];
        let peak = frame
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        // 1000 Hz is bin 16 at 62.5 Hz resolution.
        assert!((peak as isize - 16).abs() <= 2, "peak at bin {peak}");
    }

    #[test]
    fn test_unvoiced_frames_are_aperiodic() {
        let samples = vec![0.0; 4000];
        let track = F0Track {
            f0: vec![0.0; 4],
            times: vec![0.0, 0.016, 0.032, 0.048],
        };
        let analyzer = EnvelopeAnalyzer::new(16000, 256).unwrap();
        let ap = analyzer.aperiodicity(&samples, &track);
        assert!(ap.iter().flatten().all(|&v| v > 0.99));
    }

    #[test]
    fn test_aperiodicity_is_bounded() {
        let samples = tone(220.0, 8000);
        let track = PitchTracker::new(PitchConfig::default())
            .unwrap()
            .track(&samples);
        let analyzer = EnvelopeAnalyzer::new(16000, 256).unwrap();
        let ap = analyzer.aperiodicity(&samples, &track);
        for &v in ap.iter().flatten() {
            assert!((MIN_APERIODICITY..=MAX_APERIODICITY).contains(&v));
        }
    }

    #[test]
    fn test_feature_rows_trim_and_transpose() {
        let frames = vec![vec![1.0; 129], vec![2.0; 129], vec![3.0; 129]];
        let rows = to_feature_rows(&frames, 128);
        assert_eq!(rows.len(), 128);
        assert_eq!(rows[0], vec![1.0, 2.0, 3.0]);
    }
}
