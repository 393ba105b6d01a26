//! Level detection for captured audio
//!
//! Two estimators are provided:
//! - [`rms`]: broadband energy, used for the ambient noise floor
//! - [`goertzel_magnitude`]: energy in the single DFT bin nearest the test
//!   tone, far less sensitive to broadband room noise than RMS
//!
//! [`Detector`] selects which one measures the tone-playing capture.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Root mean square of a buffer, 0 for an empty buffer
pub fn rms(samples: &[f32]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| s as f64 * s as f64).sum();
    (sum / samples.len() as f64).sqrt()
}

/// Goertzel magnitude of the bin nearest `target_hz`
///
/// The bin index is `k = round(n * target_hz / sample_rate)` for a buffer of
/// `n` samples, with halfway values rounded to the even bin. For a sine of
/// amplitude `A` sitting exactly on bin `k` the result is `A * n / 2`, so the
/// value scales with capture length.
///
/// # Example
/// ```
/// use earbudtester_core::audio::detector::goertzel_magnitude;
///
/// assert_eq!(goertzel_magnitude(&[], 44100, 1000.0), 0.0);
/// ```
pub fn goertzel_magnitude(samples: &[f32], sample_rate: u32, target_hz: f64) -> f64 {
    let n = samples.len();
    if n == 0 {
        return 0.0;
    }

    let k = (n as f64 * target_hz / sample_rate as f64).round_ties_even();
    let omega = 2.0 * PI * k / n as f64;
    let (sin, cos) = omega.sin_cos();
    let coeff = 2.0 * cos;

    let mut q1 = 0.0f64;
    let mut q2 = 0.0f64;
    for &sample in samples {
        let q0 = coeff * q1 - q2 + sample as f64;
        q2 = q1;
        q1 = q0;
    }

    let real = q1 - q2 * cos;
    let imag = q2 * sin;
    (real * real + imag * imag).sqrt()
}

/// Estimator applied to the tone-playing capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Detector {
    /// Narrowband Goertzel magnitude at the tone frequency
    #[default]
    Goertzel,
    /// Broadband RMS
    Rms,
}

impl Detector {
    /// Measure `samples` with this estimator
    pub fn level(&self, samples: &[f32], sample_rate: u32, tone_hz: f64) -> f64 {
        match self {
            Detector::Goertzel => goertzel_magnitude(samples, sample_rate, tone_hz),
            Detector::Rms => rms(samples),
        }
    }

    /// Column suffix used in exported CSV headers
    pub fn csv_label(&self) -> &'static str {
        match self {
            Detector::Goertzel => "mag",
            Detector::Rms => "rms",
        }
    }
}
