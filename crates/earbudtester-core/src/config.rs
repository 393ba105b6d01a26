//! Measurement configuration
//!
//! Every knob the operator can turn, with serde defaults so partially
//! written config files still load. Two presets mirror the two measurement
//! styles: narrowband (Goertzel at 1 kHz, 3 % balance threshold) and
//! broadband (RMS at 150 Hz, 5 % threshold).

use crate::audio::detector::Detector;
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use thiserror::Error;

/// Allowed repeat counts per channel
pub const REPEATS_RANGE: RangeInclusive<u32> = 1..=20;

/// Allowed tone-capture durations in milliseconds
pub const MEASURE_MS_RANGE: RangeInclusive<u32> = 200..=5000;

/// Allowed ambient-capture durations in milliseconds
pub const AMBIENT_MS_RANGE: RangeInclusive<u32> = 1..=5000;

/// Errors from [`MeasurementConfig::validate`]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Repeats must be between 1 and 20, got {0}")]
    RepeatsOutOfRange(u32),

    #[error("Measure duration must be between 200 and 5000 ms, got {0}")]
    MeasureDurationOutOfRange(u32),

    #[error("Tone frequency {frequency} Hz must be positive and below Nyquist ({nyquist} Hz)")]
    InvalidToneFrequency { frequency: f64, nyquist: f64 },

    #[error("Tone amplitude must be in (0, 1], got {0}")]
    InvalidAmplitude(f64),

    #[error("Sample rate must be positive")]
    InvalidSampleRate,

    #[error("Ambient duration must be between 1 and 5000 ms, got {0}")]
    AmbientDurationOutOfRange(u32),

    #[error("Balance threshold must be in (0, 1), got {0}")]
    InvalidThreshold(f64),
}

fn default_repeats() -> u32 {
    5
}

fn default_measure_ms() -> u32 {
    1200
}

fn default_ambient_ms() -> u32 {
    200
}

fn default_settle_ms() -> u32 {
    150
}

fn default_tone_frequency() -> f64 {
    crate::DEFAULT_TONE_FREQUENCY
}

fn default_tone_amplitude() -> f64 {
    0.7
}

fn default_sample_rate() -> u32 {
    crate::DEFAULT_SAMPLE_RATE
}

fn default_balance_threshold() -> f64 {
    crate::DEFAULT_BALANCE_THRESHOLD
}

/// Parameters of one channel measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementConfig {
    /// Capture cycles per channel (1-20)
    #[serde(default = "default_repeats")]
    pub repeats: u32,
    /// Tone-playing capture length in ms (200-5000)
    #[serde(default = "default_measure_ms")]
    pub measure_ms: u32,
    /// Ambient noise capture length in ms
    #[serde(default = "default_ambient_ms")]
    pub ambient_ms: u32,
    /// Pause between repeats in ms
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u32,
    /// Test tone frequency in Hz
    #[serde(default = "default_tone_frequency")]
    pub tone_frequency_hz: f64,
    /// Test tone peak amplitude
    #[serde(default = "default_tone_amplitude")]
    pub tone_amplitude: f64,
    /// Synthesis and capture sample rate in Hz
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// Estimator for the tone-playing capture
    #[serde(default)]
    pub detector: Detector,
    /// Relative difference below which the pair counts as balanced
    #[serde(default = "default_balance_threshold")]
    pub balance_threshold: f64,
}

impl Default for MeasurementConfig {
    fn default() -> Self {
        Self::narrowband()
    }
}

impl MeasurementConfig {
    /// Goertzel detector at 1 kHz with a 3 % balance threshold
    pub fn narrowband() -> Self {
        Self {
            repeats: default_repeats(),
            measure_ms: default_measure_ms(),
            ambient_ms: default_ambient_ms(),
            settle_ms: default_settle_ms(),
            tone_frequency_hz: default_tone_frequency(),
            tone_amplitude: default_tone_amplitude(),
            sample_rate: default_sample_rate(),
            detector: Detector::Goertzel,
            balance_threshold: default_balance_threshold(),
        }
    }

    /// RMS detector at 150 Hz with a 5 % balance threshold
    pub fn broadband() -> Self {
        Self {
            tone_frequency_hz: 150.0,
            detector: Detector::Rms,
            balance_threshold: 0.05,
            ..Self::narrowband()
        }
    }

    /// Check every field against its allowed range
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !REPEATS_RANGE.contains(&self.repeats) {
            return Err(ConfigError::RepeatsOutOfRange(self.repeats));
        }
        if !MEASURE_MS_RANGE.contains(&self.measure_ms) {
            return Err(ConfigError::MeasureDurationOutOfRange(self.measure_ms));
        }
        if !AMBIENT_MS_RANGE.contains(&self.ambient_ms) {
            return Err(ConfigError::AmbientDurationOutOfRange(self.ambient_ms));
        }
        if self.sample_rate == 0 {
            return Err(ConfigError::InvalidSampleRate);
        }
        let nyquist = self.sample_rate as f64 / 2.0;
        if !(self.tone_frequency_hz > 0.0 && self.tone_frequency_hz < nyquist) {
            return Err(ConfigError::InvalidToneFrequency {
                frequency: self.tone_frequency_hz,
                nyquist,
            });
        }
        if !(self.tone_amplitude > 0.0 && self.tone_amplitude <= 1.0) {
            return Err(ConfigError::InvalidAmplitude(self.tone_amplitude));
        }
        if !(self.balance_threshold > 0.0 && self.balance_threshold < 1.0) {
            return Err(ConfigError::InvalidThreshold(self.balance_threshold));
        }
        Ok(())
    }
}
