//! Test tone synthesis
//!
//! Generates the sine-wave test tone played through one earbud at a time,
//! and defines the [`SampleBuffer`] type shared by the whole measurement path.

use thiserror::Error;

/// Errors raised when signal parameters violate their preconditions
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SignalError {
    #[error("Sample rate must be positive")]
    InvalidSampleRate,

    #[error("Tone frequency must be positive, got {0} Hz")]
    InvalidFrequency(f64),

    #[error("Tone duration must be positive, got {0} ms")]
    InvalidDuration(u32),

    #[error("Tone amplitude must be in (0, 1], got {0}")]
    InvalidAmplitude(f64),
}

/// Mono samples normalized to [-1.0, 1.0], tagged with their sample rate
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBuffer {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl SampleBuffer {
    /// Wrap existing samples
    ///
    /// # Errors
    /// Returns [`SignalError::InvalidSampleRate`] if `sample_rate` is zero
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Result<Self, SignalError> {
        if sample_rate == 0 {
            return Err(SignalError::InvalidSampleRate);
        }
        Ok(Self {
            samples,
            sample_rate,
        })
    }

    /// Empty buffer, used on degenerate capture paths
    pub fn empty(sample_rate: u32) -> Result<Self, SignalError> {
        Self::new(Vec::new(), sample_rate)
    }

    /// Build a buffer from 16-bit signed PCM, dividing each sample by 32768
    pub fn from_pcm16(pcm: &[i16], sample_rate: u32) -> Result<Self, SignalError> {
        let samples = pcm.iter().map(|&s| s as f32 / 32768.0).collect();
        Self::new(samples, sample_rate)
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Buffer length in milliseconds
    pub fn duration_ms(&self) -> f64 {
        self.samples.len() as f64 * 1000.0 / self.sample_rate as f64
    }
}

/// Parameters of a sine test tone
///
/// Validated on construction and immutable afterwards, so synthesis itself
/// cannot fail.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToneSpec {
    frequency_hz: f64,
    duration_ms: u32,
    amplitude: f64,
    sample_rate: u32,
}

impl ToneSpec {
    /// Create a tone spec
    ///
    /// # Arguments
    /// * `frequency_hz` - Tone frequency, must be > 0
    /// * `duration_ms` - Tone length, must be > 0
    /// * `amplitude` - Peak amplitude in (0, 1]
    /// * `sample_rate` - Sample rate in Hz, must be > 0
    ///
    /// # Example
    /// ```
    /// use earbudtester_core::audio::signal::ToneSpec;
    ///
    /// let spec = ToneSpec::new(1000.0, 100, 0.7, 44100).unwrap();
    /// assert_eq!(spec.sample_count(), 4410);
    /// ```
    pub fn new(
        frequency_hz: f64,
        duration_ms: u32,
        amplitude: f64,
        sample_rate: u32,
    ) -> Result<Self, SignalError> {
        if !(frequency_hz > 0.0 && frequency_hz.is_finite()) {
            return Err(SignalError::InvalidFrequency(frequency_hz));
        }
        if duration_ms == 0 {
            return Err(SignalError::InvalidDuration(duration_ms));
        }
        if !(amplitude > 0.0 && amplitude <= 1.0) {
            return Err(SignalError::InvalidAmplitude(amplitude));
        }
        if sample_rate == 0 {
            return Err(SignalError::InvalidSampleRate);
        }
        Ok(Self {
            frequency_hz,
            duration_ms,
            amplitude,
            sample_rate,
        })
    }

    pub fn frequency_hz(&self) -> f64 {
        self.frequency_hz
    }

    pub fn duration_ms(&self) -> u32 {
        self.duration_ms
    }

    pub fn amplitude(&self) -> f64 {
        self.amplitude
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Number of samples the tone occupies: round(rate * ms / 1000)
    pub fn sample_count(&self) -> usize {
        (self.sample_rate as f64 * self.duration_ms as f64 / 1000.0).round() as usize
    }
}

/// Sine tone synthesizer
pub struct ToneSynthesizer;

impl ToneSynthesizer {
    /// Render a tone into a fresh buffer
    ///
    /// Sample `i` is `amplitude * sin(2π * f * i / rate)`, so the first
    /// sample is always zero.
    pub fn generate(spec: &ToneSpec) -> SampleBuffer {
        let rate = spec.sample_rate as f64;
        let step = 2.0 * std::f64::consts::PI * spec.frequency_hz / rate;
        let samples = (0..spec.sample_count())
            .map(|i| (spec.amplitude * (step * i as f64).sin()) as f32)
            .collect();

        SampleBuffer {
            samples,
            sample_rate: spec.sample_rate,
        }
    }
}
