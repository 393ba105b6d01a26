//! Earbudtester Core - Tone playback, level detection, and balance analysis
//!
//! This library measures how loudly each earbud of a pair reaches a
//! microphone. It plays a sine tone on one channel, captures the result,
//! estimates the tone level against the ambient noise floor, and compares
//! the left and right estimates.

pub mod audio;
pub mod config;
pub mod measure;
pub mod stats;

pub use audio::detector::Detector;
pub use audio::engine::{CpalCapture, CpalPlayback};
pub use audio::loopback::SimulatedLoopback;
pub use config::MeasurementConfig;
pub use measure::balance::{BalanceAnalyzer, BalanceVerdict};
pub use measure::session::{Channel, MeasurementSession};
pub use stats::store::ResultStore;

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default synthesis and capture sample rate
pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

/// Default test tone frequency in Hz
pub const DEFAULT_TONE_FREQUENCY: f64 = 1000.0;

/// Relative difference below which a pair counts as balanced
pub const DEFAULT_BALANCE_THRESHOLD: f64 = 0.03;
