//! E2E tests for persistent configuration
//!
//! Tests config round-trip, defaults, and that a saved configuration
//! drives a measurement session.

use earbudtester::audio::device::{Confirmation, FixedPrompt};
use earbudtester::config::AppConfig;
use earbudtester::measure::session::{MeasurementOutcome, SessionError};
use earbudtester::{
    Channel, ConfigError, Detector, MeasurementConfig, MeasurementSession, SimulatedLoopback,
};

#[test]
fn test_saved_config_survives_reload() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("earbudtester").join("config.json");

    let config = AppConfig {
        input_device: Some("Desk Microphone".to_string()),
        output_device: None,
        measurement: MeasurementConfig {
            repeats: 10,
            balance_threshold: 0.04,
            ..MeasurementConfig::broadband()
        },
    };
    config.save(&path).unwrap();

    let loaded = AppConfig::load_from(&path);
    assert_eq!(loaded.input_device.as_deref(), Some("Desk Microphone"));
    assert_eq!(loaded.measurement.repeats, 10);
    assert_eq!(loaded.measurement.detector, Detector::Rms);
    assert_eq!(loaded.measurement.balance_threshold, 0.04);
}

#[test]
fn test_detector_names_in_json() {
    let json = serde_json::to_string(&MeasurementConfig::narrowband()).unwrap();
    assert!(json.contains(r#""detector":"goertzel""#), "{}", json);
    let json = serde_json::to_string(&MeasurementConfig::broadband()).unwrap();
    assert!(json.contains(r#""detector":"rms""#), "{}", json);
}

#[test]
fn test_session_rejects_out_of_range_config() {
    let loopback = SimulatedLoopback::with_gains(0.5, 0.5);
    let config = MeasurementConfig {
        measure_ms: 6000,
        ..Default::default()
    };
    let result = MeasurementSession::new(loopback.playback(), loopback.capture(), config);
    assert!(matches!(
        result,
        Err(SessionError::Config(ConfigError::MeasureDurationOutOfRange(6000)))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_config_drives_session() {
    let loopback = SimulatedLoopback::with_gains(0.5, 0.5);
    let config = MeasurementConfig {
        repeats: 4,
        measure_ms: 250,
        ..Default::default()
    };
    let mut session =
        MeasurementSession::new(loopback.playback(), loopback.capture(), config).unwrap();
    assert_eq!(session.analyzer().threshold(), 0.03);

    let outcome = session
        .measure_channel(Channel::Left, &mut FixedPrompt(Confirmation::Proceed))
        .await
        .unwrap();

    let MeasurementOutcome::Completed(report) = outcome else {
        panic!("expected a completed measurement");
    };
    assert_eq!(report.runs.len(), 4);
    // 250 ms at 44100 Hz
    assert!(report.runs.iter().all(|r| r.tone_samples == 11025));
    assert_eq!(loopback.play_log().len(), 4);
}
