//! Multi-run channel measurement
//!
//! A session measures one earbud at a time. After the operator confirms the
//! earbud is in place, it runs `repeats` cycles of:
//!
//! 1. Ambient capture (no tone) → RMS noise floor
//! 2. Tone capture while the tone plays on the requested channel → tone level
//! 3. Short settle pause before the next cycle
//!
//! The cycles are reduced to one estimate, `max(0, mean level - mean noise)`,
//! which is paired into the session's [`ResultStore`].
//!
//! Every step is awaited in sequence; the microphone is never opened twice
//! and both devices are released on every exit path.

use crate::audio::detector::rms;
use crate::audio::device::{
    CaptureSource, Confirmation, DeviceError, OperatorPrompt, PlaybackHandle, PlaybackSink,
};
use crate::audio::mixer::{to_stereo, ChannelMask};
use crate::audio::resample::resample;
use crate::audio::signal::{SignalError, ToneSpec, ToneSynthesizer};
use crate::config::{ConfigError, MeasurementConfig};
use crate::measure::balance::BalanceAnalyzer;
use crate::stats::store::ResultStore;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Prompt shown before each channel measurement
pub const READY_PROMPT: &str = "Place the earbud near the microphone, then press OK.";

/// Extra playback time after a preview tone ends
const PREVIEW_TAIL_MS: u64 = 100;

/// Errors that abort a measurement
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid signal parameters: {0}")]
    Signal(#[from] SignalError),

    #[error("Device fault: {0}")]
    Device(#[from] DeviceError),
}

/// Earbud under test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Left,
    Right,
}

impl Channel {
    /// Mask routing the tone to this channel only
    pub fn mask(&self) -> ChannelMask {
        match self {
            Channel::Left => ChannelMask::LEFT,
            Channel::Right => ChannelMask::RIGHT,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Left => write!(f, "left"),
            Channel::Right => write!(f, "right"),
        }
    }
}

/// One ambient + tone cycle
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeasurementRun {
    /// RMS of the ambient capture
    pub noise_floor_rms: f64,
    /// Detector output for the tone capture, 0 if the capture came back empty
    pub tone_level: f64,
    /// Samples in the tone capture
    pub tone_samples: usize,
}

impl MeasurementRun {
    /// Tone capture produced no samples
    pub fn is_dropout(&self) -> bool {
        self.tone_samples == 0
    }
}

/// Mean and population standard deviation of a series
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SeriesStats {
    pub mean: f64,
    pub std_dev: f64,
}

impl SeriesStats {
    /// Statistics of `values`, all zero for an empty series
    pub fn of(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
        Self {
            mean,
            std_dev: var.sqrt(),
        }
    }
}

/// Reduced result of all cycles for one channel
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelReport {
    pub channel: Channel,
    pub runs: Vec<MeasurementRun>,
    /// Tone level statistics
    pub level: SeriesStats,
    /// Noise floor statistics
    pub noise_floor: SeriesStats,
    /// Noise-compensated estimate, never negative
    pub estimate: f64,
}

impl ChannelReport {
    /// Reduce `runs` to a single estimate
    pub fn from_runs(channel: Channel, runs: Vec<MeasurementRun>) -> Self {
        let levels: Vec<f64> = runs.iter().map(|r| r.tone_level).collect();
        let noise: Vec<f64> = runs.iter().map(|r| r.noise_floor_rms).collect();
        let level = SeriesStats::of(&levels);
        let noise_floor = SeriesStats::of(&noise);

        Self {
            channel,
            runs,
            level,
            noise_floor,
            estimate: (level.mean - noise_floor.mean).max(0.0),
        }
    }

    /// Number of cycles whose tone capture was empty
    pub fn dropouts(&self) -> usize {
        self.runs.iter().filter(|r| r.is_dropout()).count()
    }
}

/// Result of [`MeasurementSession::measure_channel`]
#[derive(Debug, Clone, PartialEq)]
pub enum MeasurementOutcome {
    Completed(ChannelReport),
    /// Operator declined the ready prompt; nothing was recorded
    Cancelled,
}

impl MeasurementOutcome {
    /// The estimate, or `None` when cancelled
    pub fn estimate(&self) -> Option<f64> {
        match self {
            MeasurementOutcome::Completed(report) => Some(report.estimate),
            MeasurementOutcome::Cancelled => None,
        }
    }
}

/// Owns the playback and capture devices plus the result history
pub struct MeasurementSession<P, C>
where
    P: PlaybackSink,
    C: CaptureSource,
{
    playback: P,
    capture: C,
    config: MeasurementConfig,
    results: ResultStore,
    active_playback: Option<PlaybackHandle>,
}

impl<P, C> MeasurementSession<P, C>
where
    P: PlaybackSink,
    C: CaptureSource,
{
    /// Create a session with an empty result history
    ///
    /// # Errors
    /// Returns [`SessionError::Config`] if `config` is out of range
    pub fn new(playback: P, capture: C, config: MeasurementConfig) -> Result<Self, SessionError> {
        config.validate()?;
        Ok(Self {
            playback,
            capture,
            config,
            results: ResultStore::new(),
            active_playback: None,
        })
    }

    /// Continue an existing result history
    pub fn with_results(mut self, results: ResultStore) -> Self {
        self.results = results;
        self
    }

    pub fn config(&self) -> &MeasurementConfig {
        &self.config
    }

    /// Replace the configuration between measurements
    pub fn set_config(&mut self, config: MeasurementConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.config = config;
        Ok(())
    }

    pub fn results(&self) -> &ResultStore {
        &self.results
    }

    /// Give up the session, keeping its result history
    pub fn into_results(mut self) -> ResultStore {
        std::mem::take(&mut self.results)
    }

    /// Analyzer using the configured balance threshold
    pub fn analyzer(&self) -> BalanceAnalyzer {
        BalanceAnalyzer::new(self.config.balance_threshold)
    }

    /// Measure one channel and record the estimate
    ///
    /// Returns [`MeasurementOutcome::Cancelled`] without touching any device
    /// if the operator declines. An empty tone capture counts as a zero level
    /// for that cycle. Device faults abort the measurement after both
    /// devices have been released, and nothing is recorded.
    pub async fn measure_channel<O>(
        &mut self,
        channel: Channel,
        prompt: &mut O,
    ) -> Result<MeasurementOutcome, SessionError>
    where
        O: OperatorPrompt + ?Sized,
    {
        if prompt.confirm(READY_PROMPT) == Confirmation::Cancel {
            tracing::info!(%channel, "Measurement cancelled by operator");
            return Ok(MeasurementOutcome::Cancelled);
        }

        tracing::info!(
            %channel,
            repeats = self.config.repeats,
            measure_ms = self.config.measure_ms,
            frequency = self.config.tone_frequency_hz,
            detector = ?self.config.detector,
            "Measuring channel"
        );

        let result = self.run_cycles(channel).await;
        self.release();

        let runs = match result {
            Ok(runs) => runs,
            Err(e) => {
                tracing::error!(%channel, error = %e, "Measurement failed");
                return Err(e);
            }
        };

        let report = ChannelReport::from_runs(channel, runs);
        let index = self.results.record(channel, report.estimate);

        tracing::info!(
            %channel,
            estimate = report.estimate,
            level_mean = report.level.mean,
            level_std = report.level.std_dev,
            noise_mean = report.noise_floor.mean,
            noise_std = report.noise_floor.std_dev,
            dropouts = report.dropouts(),
            entry = index,
            "Channel measurement complete"
        );

        Ok(MeasurementOutcome::Completed(report))
    }

    /// Play the test tone on the masked channels, then stop
    pub async fn play_preview(&mut self, mask: ChannelMask) -> Result<(), SessionError> {
        let result = self.preview(mask).await;
        self.release();
        result
    }

    async fn preview(&mut self, mask: ChannelMask) -> Result<(), SessionError> {
        let (stereo, rate) = self.prepare_tone(mask)?;
        let frames = (stereo.len() / 2) as u64;
        let tone_ms = (frames * 1000).div_ceil(rate as u64);

        let handle = self.playback.play(&stereo, rate)?;
        self.active_playback = Some(handle);
        tracing::info!(?mask, tone_ms, "Playing preview tone");

        tokio::time::sleep(Duration::from_millis(tone_ms + PREVIEW_TAIL_MS)).await;
        self.stop_playback(handle)
    }

    /// Synthesize the tone at the playback rate and route it
    fn prepare_tone(&self, mask: ChannelMask) -> Result<(Vec<f32>, u32), SessionError> {
        let spec = ToneSpec::new(
            self.config.tone_frequency_hz,
            self.config.measure_ms,
            self.config.tone_amplitude,
            self.config.sample_rate,
        )?;
        let mono = ToneSynthesizer::generate(&spec);

        let rate = self.playback.output_rate().unwrap_or(self.config.sample_rate);
        if rate != self.config.sample_rate {
            tracing::debug!(from = self.config.sample_rate, to = rate, "Resampling tone");
        }
        let mono = resample(mono, rate)?;

        Ok((to_stereo(mono.samples(), mask), rate))
    }

    async fn run_cycles(&mut self, channel: Channel) -> Result<Vec<MeasurementRun>, SessionError> {
        let (stereo, play_rate) = self.prepare_tone(channel.mask())?;
        let repeats = self.config.repeats as usize;
        let mut runs = Vec::with_capacity(repeats);

        for repeat in 0..repeats {
            let run = self.run_cycle(&stereo, play_rate).await?;
            tracing::debug!(
                %channel,
                repeat,
                noise = run.noise_floor_rms,
                level = run.tone_level,
                samples = run.tone_samples,
                "Cycle complete"
            );
            runs.push(run);

            if repeat + 1 < repeats {
                tokio::time::sleep(Duration::from_millis(self.config.settle_ms as u64)).await;
            }
        }

        Ok(runs)
    }

    async fn run_cycle(
        &mut self,
        stereo: &[f32],
        play_rate: u32,
    ) -> Result<MeasurementRun, SessionError> {
        let rate = self.capture.capture_rate().unwrap_or(self.config.sample_rate);

        self.capture.start_capture(rate)?;
        tokio::time::sleep(Duration::from_millis(self.config.ambient_ms as u64)).await;
        let ambient = self.capture.stop_capture()?;
        if ambient.is_empty() {
            tracing::warn!("Ambient capture returned no samples");
        }
        let noise_floor_rms = rms(ambient.samples());

        self.capture.start_capture(rate)?;
        let handle = self.playback.play(stereo, play_rate)?;
        self.active_playback = Some(handle);
        tokio::time::sleep(Duration::from_millis(self.config.measure_ms as u64)).await;

        let captured = self.capture.stop_capture();
        let stopped = self.stop_playback(handle);
        let captured = captured?;
        stopped?;

        let tone_level = if captured.is_empty() {
            tracing::warn!("Tone capture returned no samples, counting level as 0");
            0.0
        } else {
            self.config.detector.level(
                captured.samples(),
                captured.sample_rate(),
                self.config.tone_frequency_hz,
            )
        };

        Ok(MeasurementRun {
            noise_floor_rms,
            tone_level,
            tone_samples: captured.len(),
        })
    }

    fn stop_playback(&mut self, handle: PlaybackHandle) -> Result<(), SessionError> {
        self.active_playback = None;
        self.playback.stop(handle)?;
        Ok(())
    }

    /// Stop whatever is still running; faults here are only logged
    fn release(&mut self) {
        if let Some(handle) = self.active_playback.take() {
            if let Err(e) = self.playback.stop(handle) {
                tracing::warn!(error = %e, "Failed to stop playback during release");
            }
        }
        if self.capture.is_capturing() {
            if let Err(e) = self.capture.stop_capture() {
                tracing::warn!(error = %e, "Failed to stop capture during release");
            }
        }
    }
}

impl<P, C> Drop for MeasurementSession<P, C>
where
    P: PlaybackSink,
    C: CaptureSource,
{
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::FixedPrompt;
    use crate::audio::loopback::{
        LoopbackCapture, LoopbackConfig, LoopbackPlayback, SimulatedLoopback,
    };
    use approx::assert_relative_eq;

    fn run(noise: f64, level: f64) -> MeasurementRun {
        MeasurementRun {
            noise_floor_rms: noise,
            tone_level: level,
            tone_samples: 100,
        }
    }

    fn quick_config() -> MeasurementConfig {
        MeasurementConfig {
            repeats: 3,
            measure_ms: 200,
            ..Default::default()
        }
    }

    fn session(
        loopback: &SimulatedLoopback,
        config: MeasurementConfig,
    ) -> MeasurementSession<LoopbackPlayback, LoopbackCapture> {
        MeasurementSession::new(loopback.playback(), loopback.capture(), config).unwrap()
    }

    #[test]
    fn test_reduction_subtracts_noise() {
        let runs = vec![run(0.1, 0.5), run(0.1, 0.5), run(0.1, 0.5)];
        let report = ChannelReport::from_runs(Channel::Left, runs);
        assert_relative_eq!(report.estimate, 0.4, epsilon = 1e-12);
        assert_relative_eq!(report.level.mean, 0.5);
        assert_relative_eq!(report.level.std_dev, 0.0);
    }

    #[test]
    fn test_reduction_clamps_to_zero() {
        let runs = vec![run(0.3, 0.1), run(0.2, 0.05)];
        let report = ChannelReport::from_runs(Channel::Right, runs);
        assert_eq!(report.estimate, 0.0);
    }

    #[test]
    fn test_series_stats() {
        let stats = SeriesStats::of(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert_relative_eq!(stats.mean, 5.0);
        assert_relative_eq!(stats.std_dev, 2.0);
        assert_eq!(SeriesStats::of(&[]), SeriesStats::default());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let loopback = SimulatedLoopback::with_gains(1.0, 1.0);
        let config = MeasurementConfig {
            repeats: 0,
            ..Default::default()
        };
        let result = MeasurementSession::new(loopback.playback(), loopback.capture(), config);
        assert!(matches!(
            result,
            Err(SessionError::Config(ConfigError::RepeatsOutOfRange(0)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_records_nothing() {
        let loopback = SimulatedLoopback::with_gains(1.0, 1.0);
        let mut session = session(&loopback, quick_config());

        let outcome = session
            .measure_channel(Channel::Left, &mut FixedPrompt(Confirmation::Cancel))
            .await
            .unwrap();

        assert_eq!(outcome, MeasurementOutcome::Cancelled);
        assert_eq!(outcome.estimate(), None);
        assert!(session.results().is_empty());
        assert!(loopback.play_log().is_empty());
        assert_eq!(loopback.captures_completed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_measure_routes_tone_to_requested_channel() {
        let loopback = SimulatedLoopback::with_gains(0.5, 0.5);
        let mut session = session(&loopback, quick_config());
        let mut prompt = FixedPrompt(Confirmation::Proceed);

        session.measure_channel(Channel::Right, &mut prompt).await.unwrap();

        let log = loopback.play_log();
        assert_eq!(log.len(), 3);
        for play in &log {
            assert!(play.has_right());
            assert!(!play.has_left());
            assert!(play.stopped.is_some());
        }
        // Ambient + tone per repeat
        assert_eq!(loopback.captures_completed(), 6);
        assert!(!loopback.is_capturing());
        assert!(!loopback.is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_measure_estimate_matches_goertzel_scale() {
        let loopback = SimulatedLoopback::new(LoopbackConfig {
            left_gain: 0.5,
            noise_amplitude: 0.0,
            ..Default::default()
        });
        let mut session = session(&loopback, quick_config());

        let outcome = session
            .measure_channel(Channel::Left, &mut FixedPrompt(Confirmation::Proceed))
            .await
            .unwrap();

        // 200 ms at 44100 Hz = 8820 samples; tone 0.7 * gain 0.5 on bin 200
        let expected = 0.35 * 8820.0 / 2.0;
        let MeasurementOutcome::Completed(report) = outcome else {
            panic!("expected a completed measurement");
        };
        assert_eq!(report.runs.len(), 3);
        assert_eq!(report.noise_floor.mean, 0.0);
        assert_relative_eq!(report.estimate, expected, max_relative = 0.01);
        assert_eq!(session.results().latest().unwrap().left, Some(report.estimate));
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_timing() {
        let loopback = SimulatedLoopback::with_gains(1.0, 1.0);
        let mut session = session(&loopback, quick_config());
        let start = tokio::time::Instant::now();

        session
            .measure_channel(Channel::Left, &mut FixedPrompt(Confirmation::Proceed))
            .await
            .unwrap();

        // 3 * (200 ambient + 200 tone) + 2 * 150 settle
        assert_eq!(start.elapsed(), Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_capture_counts_as_zero() {
        let loopback = SimulatedLoopback::with_gains(0.5, 0.5);
        // Capture 3 is the tone capture of the second repeat
        loopback.inject_dropout(3);
        let mut session = session(&loopback, quick_config());

        let outcome = session
            .measure_channel(Channel::Left, &mut FixedPrompt(Confirmation::Proceed))
            .await
            .unwrap();

        let MeasurementOutcome::Completed(report) = outcome else {
            panic!("expected a completed measurement");
        };
        assert_eq!(report.dropouts(), 1);
        assert_eq!(report.runs[1].tone_level, 0.0);
        assert!(report.runs[0].tone_level > 0.0);
        assert!(report.runs[2].tone_level > 0.0);
        assert_relative_eq!(
            report.level.mean,
            (report.runs[0].tone_level + report.runs[2].tone_level) / 3.0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_playback_fault_releases_devices() {
        let loopback = SimulatedLoopback::with_gains(0.5, 0.5);
        loopback.inject_playback_fault(1);
        let mut session = session(&loopback, quick_config());

        let err = session
            .measure_channel(Channel::Left, &mut FixedPrompt(Confirmation::Proceed))
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::Device(DeviceError::Playback(_))));
        assert!(!loopback.is_capturing());
        assert!(!loopback.is_playing());
        assert!(session.results().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_fault_aborts_measurement() {
        let loopback = SimulatedLoopback::with_gains(0.5, 0.5);
        loopback.inject_capture_fault(0);
        let mut session = session(&loopback, quick_config());

        let err = session
            .measure_channel(Channel::Right, &mut FixedPrompt(Confirmation::Proceed))
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::Device(DeviceError::Capture(_))));
        assert!(loopback.play_log().is_empty());
        assert!(session.results().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tone_resampled_to_output_rate() {
        let loopback = SimulatedLoopback::new(LoopbackConfig {
            output_rate: Some(48000),
            ..Default::default()
        });
        let mut session = session(&loopback, quick_config());

        session
            .measure_channel(Channel::Left, &mut FixedPrompt(Confirmation::Proceed))
            .await
            .unwrap();

        let play = &loopback.play_log()[0];
        assert_eq!(play.sample_rate, 48000);
        // 8820 tone samples at 44100 Hz -> floor(8820 * 48000 / 44100)
        assert_eq!(play.frames, 9600);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_uses_device_rate() {
        let loopback = SimulatedLoopback::new(LoopbackConfig {
            left_gain: 0.5,
            noise_amplitude: 0.0,
            input_rate: Some(48000),
            ..Default::default()
        });
        let mut session = session(&loopback, quick_config());

        let outcome = session
            .measure_channel(Channel::Left, &mut FixedPrompt(Confirmation::Proceed))
            .await
            .unwrap();

        let MeasurementOutcome::Completed(report) = outcome else {
            panic!("expected a completed measurement");
        };
        // 200 ms at the microphone's 48000 Hz, not the configured 44100 Hz
        assert!(report.runs.iter().all(|r| r.tone_samples == 9600));
        // Goertzel bin level of a 0.35 sine over 9600 samples
        assert_relative_eq!(report.estimate, 0.35 * 9600.0 / 2.0, max_relative = 0.02);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_session_holds_one_tone() {
        let loopback = SimulatedLoopback::with_gains(0.5, 0.5);
        let mut session = session(
            &loopback,
            MeasurementConfig {
                repeats: 5,
                ..quick_config()
            },
        );

        session
            .measure_channel(Channel::Left, &mut FixedPrompt(Confirmation::Proceed))
            .await
            .unwrap();

        assert_eq!(loopback.play_log().len(), 5);
        // 200 ms stereo tone at 44100 Hz
        assert!(loopback.buffered_samples() <= 2 * 8820);
    }

    #[tokio::test(start_paused = true)]
    async fn test_preview_plays_both_and_stops() {
        let loopback = SimulatedLoopback::with_gains(1.0, 1.0);
        let mut session = session(&loopback, quick_config());
        let start = tokio::time::Instant::now();

        session.play_preview(ChannelMask::BOTH).await.unwrap();

        let log = loopback.play_log();
        assert_eq!(log.len(), 1);
        assert!(log[0].has_left() && log[0].has_right());
        assert!(!loopback.is_playing());
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_session_releases_devices() {
        let loopback = SimulatedLoopback::with_gains(1.0, 1.0);
        let mut session = session(&loopback, quick_config());
        let mut prompt = FixedPrompt(Confirmation::Proceed);
        {
            let measure = session.measure_channel(Channel::Left, &mut prompt);
            // Abandon the measurement partway through the first ambient capture
            let _ = tokio::time::timeout(Duration::from_millis(50), measure).await;
        }
        assert!(loopback.is_capturing());
        drop(session);
        assert!(!loopback.is_capturing());
    }
}
