//! WAV file I/O and sample-rate handling.

use std::path::Path;

use crate::{Error, Result};

/// Read a WAV file, return (samples, sample_rate, num_channels).
///
/// Samples are interleaved f32 in [-1, 1].
pub fn read_wav(path: impl AsRef<Path>) -> Result<(Vec<f32>, u32, u16)> {
    let reader = hound::WavReader::open(path)?;
    let spec = reader.spec();

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()?,
        hound::SampleFormat::Int => {
            let max_val = (1u32 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_val))
                .collect::<std::result::Result<Vec<_>, _>>()?
        }
    };

    Ok((samples, spec.sample_rate, spec.channels))
}

/// Write mono or interleaved f32 samples as a 32-bit float WAV.
pub fn write_wav(
    path: impl AsRef<Path>,
    samples: &[f32],
    sample_rate: u32,
    num_channels: u16,
) -> Result<()> {
    let spec = hound::WavSpec {
        channels: num_channels,
        sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for &s in samples {
        writer.write_sample(s)?;
    }
    writer.finalize()?;
    Ok(())
}

/// Average interleaved channels into one.
pub fn downmix(samples: &[f32], num_channels: u16) -> Vec<f64> {
    let channels = num_channels.max(1) as usize;
    samples
        .chunks(channels)
        .map(|frame| frame.iter().map(|&s| s as f64).sum::<f64>() / frame.len() as f64)
        .collect()
}

/// Band-limited sinc resampling of a mono signal.
///
/// The output has `round(len · to_rate / from_rate)` samples, aligned with
/// the input (the filter delay is removed).
pub fn resample(samples: &[f64], from_rate: u32, to_rate: u32) -> Result<Vec<f64>> {
    use rubato::{
        Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
    };

    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }
    if from_rate == 0 || to_rate == 0 {
        return Err(Error::Audio(format!("cannot resample {from_rate} Hz to {to_rate} Hz")));
    }

    let params = SincInterpolationParameters {
        sinc_len: SINC_LEN,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };
    let ratio = to_rate as f64 / from_rate as f64;
    let expected = ((samples.len() as f64) * ratio).round().max(1.0) as usize;

    // Trailing zeros flush the filter so the delayed tail reaches the output.
    let mut input = samples.to_vec();
    input.resize(samples.len() + SINC_LEN, 0.0);

    let mut resampler = SincFixedIn::<f64>::new(ratio, 1.0, params, input.len(), 1)
        .map_err(|e| Error::Audio(format!("resampler setup failed: {e}")))?;
    let delay = resampler.output_delay();
    let waves_in = vec![input];
    let mut output = resampler
        .process(&waves_in, None)
        .map_err(|e| Error::Audio(format!("resampling failed: {e}")))?
        .into_iter()
        .next()
        .unwrap_or_default();

    output.drain(..delay.min(output.len()));
    output.resize(expected, 0.0);
    Ok(output)
}

const SINC_LEN: usize = 256;

/// Load a WAV as mono f64 at `sample_rate`.
pub fn load_mono(path: impl AsRef<Path>, sample_rate: u32) -> Result<Vec<f64>> {
    let path = path.as_ref();
    let (samples, source_rate, channels) = read_wav(path)?;
    if source_rate == 0 {
        return Err(Error::Audio(format!("{} has a zero sample rate", path.display())));
    }
    let mono = downmix(&samples, channels);
    if source_rate != sample_rate {
        tracing::debug!(
            "resampling {} from {source_rate} Hz to {sample_rate} Hz",
            path.display()
        );
    }
    resample(&mono, source_rate, sample_rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.wav");
        let original = vec![0.0f32, 0.5, -0.5, 1.0, -1.0, 0.25];
        write_wav(&path, &original, 16000, 2).unwrap();
        let (loaded, sr, ch) = read_wav(&path).unwrap();
        assert_eq!(sr, 16000);
        assert_eq!(ch, 2);
        assert_eq!(loaded.len(), original.len());
        for (a, b) in loaded.iter().zip(original.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_downmix_averages_channels() {
        let mono = downmix(&[1.0, 0.0, 0.5, 0.5], 2);
        assert_eq!(mono, vec![0.5, 0.5]);
    }

    #[test]
    fn test_resample_halves_length() {
        let samples: Vec<f64> = (0..3200).map(|i| (i as f64 * 0.01).sin()).collect();
        let out = resample(&samples, 32000, 16000).unwrap();
        assert_eq!(out.len(), 1600);
        // Slow sine survives with its phase intact.
        for i in (200..1400).step_by(100) {
            assert!((out[i] - (2.0 * i as f64 * 0.01).sin()).abs() < 5e-2, "sample {i}");
        }
    }

    #[test]
    fn test_resample_same_rate_is_identity() {
        let samples = vec![0.1, -0.2, 0.3];
        assert_eq!(resample(&samples, 16000, 16000).unwrap(), samples);
    }

    #[test]
    fn test_resample_filters_above_nyquist() {
        // 12 kHz at 48 kHz has no place below the 8 kHz Nyquist of 16 kHz.
        let rate = 48000.0;
        let tone: Vec<f64> = (0..48000)
            .map(|i| (2.0 * std::f64::consts::PI * 12000.0 * i as f64 / rate).sin())
            .collect();
        let out = resample(&tone, 48000, 16000).unwrap();
        assert_eq!(out.len(), 16000);
        let middle = &out[2000..14000];
        let rms = (middle.iter().map(|s| s * s).sum::<f64>() / middle.len() as f64).sqrt();
        assert!(rms < 0.05, "aliased energy {rms}");
    }

    #[test]
    fn test_resample_rejects_zero_rate() {
        assert!(matches!(resample(&[1.0], 0, 16000), Err(Error::Audio(_))));
    }

    #[test]
    fn test_load_mono_resamples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        let stereo: Vec<f32> = (0..3200).flat_map(|_| [0.25f32, 0.75]).collect();
        write_wav(&path, &stereo, 32000, 2).unwrap();
        let mono = load_mono(&path, 16000).unwrap();
        assert_eq!(mono.len(), 1600);
        assert!(mono[400..1200].iter().all(|&s| (s - 0.5).abs() < 1e-2));
    }
}
