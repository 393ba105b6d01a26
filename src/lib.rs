//! Earbudtester - earbud left/right balance tester
//!
//! This library re-exports the tone synthesis, detection, measurement
//! session, and result history from `earbudtester-core`, plus the persistent
//! application config used by the command-line tool.

pub mod config;

pub use earbudtester_core::audio;
pub use earbudtester_core::measure;
pub use earbudtester_core::stats;

pub use earbudtester_core::config::{ConfigError, MeasurementConfig};
pub use earbudtester_core::{
    BalanceAnalyzer, BalanceVerdict, Channel, CpalCapture, CpalPlayback, Detector,
    MeasurementSession, ResultStore, SimulatedLoopback,
};
pub use earbudtester_core::{
    DEFAULT_BALANCE_THRESHOLD, DEFAULT_SAMPLE_RATE, DEFAULT_TONE_FREQUENCY, VERSION,
};
