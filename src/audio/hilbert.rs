//! Analytic signal via the FFT-domain Hilbert transform.

use rustfft::FftPlanner;
use rustfft::num_complex::Complex;

/// Analytic signal `x + i·H{x}`.
///
/// Positive frequencies are doubled, negative ones zeroed; DC and (for even
/// lengths) Nyquist are kept as is.
pub fn hilbert_transform(signal: &[f64]) -> Vec<Complex<f64>> {
    let n = signal.len();
    if n == 0 {
        return Vec::new();
    }
    let mut planner = FftPlanner::new();
    let forward = planner.plan_fft_forward(n);
    let inverse = planner.plan_fft_inverse(n);

    let mut buffer: Vec<Complex<f64>> = signal.iter().map(|&x| Complex::new(x, 0.0)).collect();
    forward.process(&mut buffer);

    let positive_end = n.div_ceil(2);
    for (k, value) in buffer.iter_mut().enumerate() {
        let gain = if k == 0 || (n % 2 == 0 && k == n / 2) {
            1.0
        } else if k < positive_end {
            2.0
        } else {
            0.0
        };
        *value *= gain;
    }

    inverse.process(&mut buffer);
    let scale = 1.0 / n as f64;
    buffer.iter_mut().for_each(|c| *c *= scale);
    buffer
}

/// Instantaneous envelope `|analytic|` and phase `arg(analytic)`.
pub fn analytic_envelope_phase(signal: &[f64]) -> (Vec<f64>, Vec<f64>) {
    hilbert_transform(signal)
        .into_iter()
        .map(|c| (c.norm(), c.arg()))
        .unzip()
}

/// Row-wise envelope and phase of a `[bins][frames]` spectrogram.
pub fn process_spectrogram_with_hilbert(spec: &[Vec<f64>]) -> (Vec<Vec<f64>>, Vec<Vec<f64>>) {
    spec.iter().map(|row| analytic_envelope_phase(row)).unzip()
}
