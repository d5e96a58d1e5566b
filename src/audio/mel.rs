//! Log-mel spectrogram and MFCC.
//!
//! Defaults describe the speech front end the encoders are trained on:
//! - Sample rate: 16000 Hz
//! - FFT size: 1024 (513 frequency bins), Hann window, hop 256
//! - Mel bins: 128, range 150–2000 Hz, HTK scale, no filter normalization
//! - Padding: constant, centered frames
//! - Compression: `log10`, floored 8 decades below the peak, mapped by `(x + 4) / 4`

use serde::{Deserialize, Serialize};

use super::stft::{PadMode, Stft, StftConfig, WindowKind};

/// Configuration for the mel spectrogram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MelConfig {
    pub sample_rate: u32,
    pub n_fft: usize,
    pub win_length: usize,
    pub hop_length: usize,
    pub n_mels: usize,
    pub f_min: f64,
    pub f_max: f64,
    pub power: f64,
    pub pad_mode: PadMode,
}

impl Default for MelConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            n_fft: 1024,
            win_length: 1024,
            hop_length: 256,
            n_mels: 128,
            f_min: 150.0,
            f_max: 2000.0,
            power: 1.0,
            pad_mode: PadMode::Constant,
        }
    }
}

/// Mel spectrogram processor.
///
/// Pre-computes the STFT plan and mel filterbank on construction. Call
/// [`MelSpectrogram::process`] for the normalized log-mel features or
/// [`MelSpectrogram::power_mel`] for the raw filterbank energies.
pub struct MelSpectrogram {
    config: MelConfig,
    stft: Stft,
    filterbank: Vec<Vec<f64>>,
}

impl MelSpectrogram {
    pub fn new(config: MelConfig) -> Self {
        let stft = Stft::new(StftConfig {
            n_fft: config.n_fft,
            hop_length: config.hop_length,
            win_length: config.win_length,
            window: WindowKind::Hann,
            center: true,
            pad_mode: config.pad_mode,
            power: config.power,
        });
        let filterbank = mel_filterbank(
            config.n_fft,
            config.n_mels,
            config.sample_rate,
            config.f_min,
            config.f_max,
        );
        Self {
            config,
            stft,
            filterbank,
        }
    }

    pub fn config(&self) -> &MelConfig {
        &self.config
    }

    /// Filterbank energies, `[n_mels][frames]`.
    pub fn power_mel(&self, samples: &[f64]) -> Vec<Vec<f64>> {
        let frames = self.stft.frames(samples);
        let mut mel = vec![vec![0.0; frames.len()]; self.config.n_mels];
        for (frame_idx, magnitudes) in frames.iter().enumerate() {
            for (mel_idx, filter) in self.filterbank.iter().enumerate() {
                mel[mel_idx][frame_idx] = filter
                    .iter()
                    .zip(magnitudes)
                    .filter(|(w, _)| **w > 0.0)
                    .map(|(w, m)| w * m)
                    .sum();
            }
        }
        mel
    }

    /// Normalized log-mel spectrogram, `[n_mels][frames]`.
    pub fn process(&self, samples: &[f64]) -> Vec<Vec<f64>> {
        let mut mel = self.power_mel(samples);
        let peak = mel
            .iter()
            .flatten()
            .map(|&v| v.max(1e-10).log10())
            .fold(f64::NEG_INFINITY, f64::max);
        let floor = peak - 8.0;
        for value in mel.iter_mut().flatten() {
            let log = value.max(1e-10).log10().max(floor);
            *value = (log + 4.0) / 4.0;
        }
        mel
    }
}

/// Mel-frequency cepstral coefficients, `[n_mfcc][frames]`.
///
/// Power mel energies with reflect padding, converted to decibels (floored
/// 80 dB below the peak), then projected with an orthonormal DCT-II.
pub fn mfcc(samples: &[f64], config: &MelConfig, n_mfcc: usize) -> Vec<Vec<f64>> {
    let mel = MelSpectrogram::new(MelConfig {
        power: 2.0,
        pad_mode: PadMode::Reflect,
        ..config.clone()
    });
    let mut energies = mel.power_mel(samples);
    let peak = energies
        .iter()
        .flatten()
        .map(|&v| 10.0 * v.max(1e-10).log10())
        .fold(f64::NEG_INFINITY, f64::max);
    for value in energies.iter_mut().flatten() {
        *value = (10.0 * value.max(1e-10).log10()).max(peak - 80.0);
    }

    let n_mels = config.n_mels;
    let num_frames = energies.first().map_or(0, Vec::len);
    let dct = dct_ortho(n_mfcc, n_mels);
    (0..n_mfcc)
        .map(|k| {
            (0..num_frames)
                .map(|t| (0..n_mels).map(|m| dct[k][m] * energies[m][t]).sum())
                .collect()
        })
        .collect()
}

/// Orthonormal DCT-II basis, `[n_out][n_in]`.
fn dct_ortho(n_out: usize, n_in: usize) -> Vec<Vec<f64>> {
    let n = n_in as f64;
    (0..n_out)
        .map(|k| {
            let scale = if k == 0 {
                (1.0 / n).sqrt()
            } else {
                (2.0 / n).sqrt()
            };
            (0..n_in)
                .map(|m| {
                    scale
                        * (std::f64::consts::PI / n * (m as f64 + 0.5) * k as f64).cos()
                })
                .collect()
        })
        .collect()
}

/// Build an HTK mel filterbank with unnormalized triangular filters.
///
/// Returns `n_mels` filters, each with `n_fft/2 + 1` weights.
fn mel_filterbank(
    n_fft: usize,
    n_mels: usize,
    sample_rate: u32,
    f_min: f64,
    f_max: f64,
) -> Vec<Vec<f64>> {
    let num_bins = n_fft / 2 + 1;
    let nyquist = sample_rate as f64 / 2.0;

    let mel_min = mel_scale_scalar(f_min);
    let mel_max = mel_scale_scalar(f_max);
    let hz_points: Vec<f64> = (0..=(n_mels + 1))
        .map(|i| mel_min + (mel_max - mel_min) * i as f64 / (n_mels + 1) as f64)
        .map(mel_to_hz)
        .collect();

    let bin_freqs: Vec<f64> = (0..num_bins)
        .map(|i| nyquist * i as f64 / (num_bins - 1).max(1) as f64)
        .collect();

    (0..n_mels)
        .map(|i| {
            let (f_left, f_center, f_right) = (hz_points[i], hz_points[i + 1], hz_points[i + 2]);
            bin_freqs
                .iter()
                .map(|&f| {
                    let down = (f - f_left) / (f_center - f_left);
                    let up = (f_right - f) / (f_right - f_center);
                    down.min(up).max(0.0)
                })
                .collect()
        })
        .collect()
}

/// HTK mel scale: `1127 · ln(1 + f / 700)`.
pub fn mel_scale_scalar(freq: f64) -> f64 {
    1127.0 * (1.0 + freq / 700.0).ln()
}

/// Inverse of [`mel_scale_scalar`].
pub fn mel_to_hz(mel: f64) -> f64 {
    700.0 * ((mel / 1127.0).exp() - 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mel_conversion_roundtrip() {
        for &freq in &[40.0, 150.0, 440.0, 1000.0, 2000.0, 8000.0] {
            let back = mel_to_hz(mel_scale_scalar(freq));
            assert!((freq - back).abs() < 1e-6, "roundtrip failed for {freq} Hz");
        }
    }

    #[test]
    fn test_htk_1000hz_is_about_1000_mel() {
        let mel = mel_scale_scalar(1000.0);
        assert!((mel - 1000.0).abs() < 0.1, "got {mel}");
    }

    #[test]
    fn test_filterbank_shape_and_support() {
        let fb = mel_filterbank(1024, 128, 16000, 150.0, 2000.0);
        assert_eq!(fb.len(), 128);
        assert_eq!(fb[0].len(), 513);
        for (i, filter) in fb.iter().enumerate() {
            assert!(filter.iter().all(|&w| (0.0..=1.0).contains(&w)));
            // Bins above 2000 Hz (bin 128) never contribute.
            assert!(filter[140..].iter().all(|&w| w == 0.0), "filter {i} leaks");
        }
    }

    #[test]
    fn test_output_shape() {
        let mel = MelSpectrogram::new(MelConfig::default());
        let samples = vec![0.0; 16000];
        let out = mel.process(&samples);
        assert_eq!(out.len(), 128);
        assert_eq!(out[0].len(), 1 + 16000 / 256);
    }

    #[test]
    fn test_normalized_range_is_bounded() {
        let mel = MelSpectrogram::new(MelConfig::default());
        let samples: Vec<f64> = (0..8000)
            .map(|i| (2.0 * std::f64::consts::PI * 440.0 * i as f64 / 16000.0).sin())
            .collect();
        let out = mel.process(&samples);
        let max = out.iter().flatten().cloned().fold(f64::NEG_INFINITY, f64::max);
        let min = out.iter().flatten().cloned().fold(f64::INFINITY, f64::min);
        assert!(max > min, "sine should produce variation");
        // Values sit within 8 decades (2.0 after /4) of the peak.
        assert!(max - min <= 2.0 + 1e-9);
    }

    #[test]
    fn test_mfcc_shape() {
        let samples: Vec<f64> = (0..4000).map(|i| (i as f64 * 0.05).sin()).collect();
        let coeffs = mfcc(&samples, &MelConfig::default(), 40);
        assert_eq!(coeffs.len(), 40);
        assert_eq!(coeffs[0].len(), 1 + 4000 / 256);
    }

    #[test]
    fn test_dct_rows_are_orthonormal() {
        let dct = dct_ortho(8, 8);
        for a in 0..8 {
            for b in 0..8 {
                let dot: f64 = dct[a].iter().zip(&dct[b]).map(|(x, y)| x * y).sum();
                let expected = if a == b { 1.0 } else { 0.0 };
                assert!((dot - expected).abs() < 1e-9);
            }
        }
    }
}
