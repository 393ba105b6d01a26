//! Simulated acoustic loopback
//!
//! Stands in for an earbud held against a microphone: whatever the
//! [`LoopbackPlayback`] plays is heard by the [`LoopbackCapture`], scaled by
//! a per-channel gain and mixed with seeded white noise. The captured length
//! follows the wall clock (tokio's clock, so paused-time tests stay exact),
//! and the result is quantized to 16-bit PCM like a real microphone.
//!
//! Faults can be injected to exercise the fail-soft and release paths:
//! empty captures, failing playback, and failing capture starts.
//!
//! Audio of a playback is dropped once it stopped before the current capture
//! window, so long sessions keep only the buffers a capture can still hear.

use super::device::{CaptureSource, DeviceError, PlaybackHandle, PlaybackSink};
use super::signal::SampleBuffer;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::Instant;

/// Acoustic properties of the simulated path
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopbackConfig {
    /// Gain from the left channel to the microphone
    pub left_gain: f64,
    /// Gain from the right channel to the microphone
    pub right_gain: f64,
    /// Peak amplitude of the uniform ambient noise
    pub noise_amplitude: f64,
    /// Noise generator seed
    pub seed: u64,
    /// Rate reported through [`PlaybackSink::output_rate`]
    pub output_rate: Option<u32>,
    /// Rate the microphone records at, whatever rate is requested
    pub input_rate: Option<u32>,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            left_gain: 0.5,
            right_gain: 0.5,
            noise_amplitude: 0.01,
            seed: 42,
            output_rate: None,
            input_rate: None,
        }
    }
}

/// One call to `play`, as seen by the simulated speaker
#[derive(Debug, Clone)]
pub struct PlayRecord {
    pub handle: PlaybackHandle,
    pub sample_rate: u32,
    /// Stereo frames that were queued
    pub frames: usize,
    pub started: Instant,
    pub stopped: Option<Instant>,
    left: bool,
    right: bool,
    /// Interleaved samples, emptied once no capture can hear them
    audio: Vec<f32>,
}

impl PlayRecord {
    fn new(handle: PlaybackHandle, stereo: &[f32], sample_rate: u32, started: Instant) -> Self {
        Self {
            handle,
            sample_rate,
            frames: stereo.len() / 2,
            started,
            stopped: None,
            left: stereo.iter().step_by(2).any(|&s| s != 0.0),
            right: stereo.iter().skip(1).step_by(2).any(|&s| s != 0.0),
            audio: stereo.to_vec(),
        }
    }

    /// Whether any left-channel sample was non-zero
    pub fn has_left(&self) -> bool {
        self.left
    }

    /// Whether any right-channel sample was non-zero
    pub fn has_right(&self) -> bool {
        self.right
    }
}

#[derive(Debug)]
struct LoopbackState {
    config: LoopbackConfig,
    rng: Pcg32,
    plays: Vec<PlayRecord>,
    capture: Option<(Instant, u32)>,
    captures_completed: usize,
    plays_attempted: usize,
    capture_starts: usize,
    dropouts: HashSet<usize>,
    playback_faults: HashSet<usize>,
    capture_start_faults: HashSet<usize>,
}

/// Shared simulated speaker + microphone pair
#[derive(Debug, Clone)]
pub struct SimulatedLoopback {
    state: Arc<Mutex<LoopbackState>>,
}

impl SimulatedLoopback {
    pub fn new(config: LoopbackConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(LoopbackState {
                rng: Pcg32::seed_from_u64(config.seed),
                config,
                plays: Vec::new(),
                capture: None,
                captures_completed: 0,
                plays_attempted: 0,
                capture_starts: 0,
                dropouts: HashSet::new(),
                playback_faults: HashSet::new(),
                capture_start_faults: HashSet::new(),
            })),
        }
    }

    /// Loopback with the given channel gains and default noise
    pub fn with_gains(left_gain: f64, right_gain: f64) -> Self {
        Self::new(LoopbackConfig {
            left_gain,
            right_gain,
            ..Default::default()
        })
    }

    fn lock(&self) -> MutexGuard<'_, LoopbackState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Playback half of the pair
    pub fn playback(&self) -> LoopbackPlayback {
        LoopbackPlayback {
            loopback: self.clone(),
        }
    }

    /// Capture half of the pair
    pub fn capture(&self) -> LoopbackCapture {
        LoopbackCapture {
            loopback: self.clone(),
        }
    }

    /// Make the `index`-th completed capture (0-based) come back empty
    pub fn inject_dropout(&self, index: usize) {
        self.lock().dropouts.insert(index);
    }

    /// Make the `index`-th call to `play` (0-based) fail
    pub fn inject_playback_fault(&self, index: usize) {
        self.lock().playback_faults.insert(index);
    }

    /// Make the `index`-th call to `start_capture` (0-based) fail
    pub fn inject_capture_fault(&self, index: usize) {
        self.lock().capture_start_faults.insert(index);
    }

    /// Change the acoustic gains, e.g. after the operator repositions the device
    pub fn set_gains(&self, left_gain: f64, right_gain: f64) {
        let mut state = self.lock();
        state.config.left_gain = left_gain;
        state.config.right_gain = right_gain;
    }

    /// Every playback so far, oldest first
    pub fn play_log(&self) -> Vec<PlayRecord> {
        self.lock().plays.clone()
    }

    /// Whether a playback is still sounding
    pub fn is_playing(&self) -> bool {
        self.lock()
            .plays
            .last()
            .map(|p| p.stopped.is_none())
            .unwrap_or(false)
    }

    /// Whether the microphone is open
    pub fn is_capturing(&self) -> bool {
        self.lock().capture.is_some()
    }

    /// Number of captures that have been stopped
    pub fn captures_completed(&self) -> usize {
        self.lock().captures_completed
    }

    /// Playback samples still held for rendering
    pub fn buffered_samples(&self) -> usize {
        self.lock().plays.iter().map(|p| p.audio.len()).sum()
    }
}

impl LoopbackState {
    fn stop_playback(&mut self, handle: PlaybackHandle, at: Instant) {
        if let Some(play) = self.plays.iter_mut().find(|p| p.handle == handle) {
            if play.stopped.is_none() {
                play.stopped = Some(at);
            }
        }
    }

    /// Drop the audio of playbacks that ended before the open capture began,
    /// or before `now` when no capture is open
    fn release_finished(&mut self, now: Instant) {
        let cutoff = self.capture.map(|(start, _)| start).unwrap_or(now);
        for play in &mut self.plays {
            if matches!(play.stopped, Some(stopped) if stopped <= cutoff) {
                play.audio = Vec::new();
            }
        }
    }

    /// Render what the microphone heard between `start` and `end`
    fn render(&mut self, start: Instant, end: Instant, rate: u32) -> Vec<f32> {
        let elapsed = end.saturating_duration_since(start).as_secs_f64();
        let n = (elapsed * rate as f64).round() as usize;
        let mut heard = vec![0.0f32; n];

        for play in self.plays.iter().filter(|p| !p.audio.is_empty()) {
            let play_end = play.stopped.unwrap_or(end);
            let offset = if start >= play.started {
                start.duration_since(play.started).as_secs_f64()
            } else {
                -play.started.duration_since(start).as_secs_f64()
            };
            let audible_until = play_end.saturating_duration_since(start).as_secs_f64();

            for (j, out) in heard.iter_mut().enumerate() {
                let t = j as f64 / rate as f64;
                if t >= audible_until {
                    break;
                }
                let frame = ((t + offset) * play.sample_rate as f64).round();
                if frame < 0.0 || frame as usize >= play.audio.len() / 2 {
                    continue;
                }
                let f = frame as usize;
                *out += (self.config.left_gain * play.audio[2 * f] as f64
                    + self.config.right_gain * play.audio[2 * f + 1] as f64)
                    as f32;
            }
        }

        let noise = self.config.noise_amplitude;
        if noise > 0.0 {
            for out in heard.iter_mut() {
                *out += self.rng.gen_range(-noise..noise) as f32;
            }
        }
        heard
    }
}

/// Simulated speaker
#[derive(Debug)]
pub struct LoopbackPlayback {
    loopback: SimulatedLoopback,
}

impl PlaybackSink for LoopbackPlayback {
    fn play(&mut self, stereo: &[f32], sample_rate: u32) -> Result<PlaybackHandle, DeviceError> {
        let now = Instant::now();
        let mut state = self.loopback.lock();

        let attempt = state.plays_attempted;
        state.plays_attempted += 1;
        if state.playback_faults.contains(&attempt) {
            tracing::warn!(attempt, "Simulated playback fault");
            return Err(DeviceError::Playback("simulated playback fault".to_string()));
        }

        if let Some(previous) = state.plays.last().map(|p| p.handle) {
            state.stop_playback(previous, now);
        }

        state.release_finished(now);

        let handle = PlaybackHandle(state.plays.len() as u64 + 1);
        state
            .plays
            .push(PlayRecord::new(handle, stereo, sample_rate, now));
        Ok(handle)
    }

    fn stop(&mut self, handle: PlaybackHandle) -> Result<(), DeviceError> {
        let now = Instant::now();
        let mut state = self.loopback.lock();
        state.stop_playback(handle, now);
        state.release_finished(now);
        Ok(())
    }

    fn output_rate(&self) -> Option<u32> {
        self.loopback.lock().config.output_rate
    }
}

/// Simulated microphone
#[derive(Debug)]
pub struct LoopbackCapture {
    loopback: SimulatedLoopback,
}

impl CaptureSource for LoopbackCapture {
    fn start_capture(&mut self, sample_rate: u32) -> Result<(), DeviceError> {
        let mut state = self.loopback.lock();
        if state.capture.is_some() {
            return Err(DeviceError::CaptureBusy);
        }

        let attempt = state.capture_starts;
        state.capture_starts += 1;
        if state.capture_start_faults.contains(&attempt) {
            tracing::warn!(attempt, "Simulated capture fault");
            return Err(DeviceError::Capture("simulated capture fault".to_string()));
        }

        let rate = state.config.input_rate.unwrap_or(sample_rate);
        state.capture = Some((Instant::now(), rate));
        Ok(())
    }

    fn stop_capture(&mut self) -> Result<SampleBuffer, DeviceError> {
        let end = Instant::now();
        let mut state = self.loopback.lock();
        let (start, rate) = state.capture.take().ok_or(DeviceError::CaptureNotRunning)?;

        let index = state.captures_completed;
        state.captures_completed += 1;

        let pcm: Vec<i16> = if state.dropouts.contains(&index) {
            Vec::new()
        } else {
            state
                .render(start, end, rate)
                .into_iter()
                .map(|s| (s.clamp(-1.0, 1.0) * 32767.0).round() as i16)
                .collect()
        };
        state.release_finished(end);

        SampleBuffer::from_pcm16(&pcm, rate).map_err(|e| DeviceError::Capture(e.to_string()))
    }

    fn is_capturing(&self) -> bool {
        self.loopback.lock().capture.is_some()
    }

    fn capture_rate(&self) -> Option<u32> {
        self.loopback.lock().config.input_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::detector::rms;
    use crate::audio::mixer::{to_stereo, ChannelMask};
    use approx::assert_relative_eq;
    use std::time::Duration;

    fn quiet(left_gain: f64, right_gain: f64) -> SimulatedLoopback {
        SimulatedLoopback::new(LoopbackConfig {
            left_gain,
            right_gain,
            noise_amplitude: 0.0,
            ..Default::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_length_follows_clock() {
        let loopback = quiet(1.0, 1.0);
        let mut mic = loopback.capture();

        mic.start_capture(8000).unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        let buf = mic.stop_capture().unwrap();

        assert_eq!(buf.len(), 2000);
        assert_eq!(buf.sample_rate(), 8000);
        assert!(buf.samples().iter().all(|&s| s == 0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_playback_is_heard_with_channel_gain() {
        let loopback = quiet(0.5, 0.25);
        let mut speaker = loopback.playback();
        let mut mic = loopback.capture();
        let mono = vec![0.8f32; 8000];

        mic.start_capture(8000).unwrap();
        let handle = speaker
            .play(&to_stereo(&mono, ChannelMask::RIGHT), 8000)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        let buf = mic.stop_capture().unwrap();
        speaker.stop(handle).unwrap();

        assert_eq!(buf.len(), 4000);
        assert_relative_eq!(rms(buf.samples()), 0.2, max_relative = 1e-3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_playback_is_not_heard() {
        let loopback = quiet(1.0, 1.0);
        let mut speaker = loopback.playback();
        let mut mic = loopback.capture();

        let handle = speaker
            .play(&to_stereo(&[0.5; 8000], ChannelMask::BOTH), 8000)
            .unwrap();
        speaker.stop(handle).unwrap();
        // Stopping twice is fine
        speaker.stop(handle).unwrap();
        assert!(!loopback.is_playing());

        mic.start_capture(8000).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let buf = mic.stop_capture().unwrap();
        assert_eq!(rms(buf.samples()), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropout_returns_empty_buffer() {
        let loopback = SimulatedLoopback::with_gains(1.0, 1.0);
        loopback.inject_dropout(1);
        let mut mic = loopback.capture();

        for expected_empty in [false, true, false] {
            mic.start_capture(44100).unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
            let buf = mic.stop_capture().unwrap();
            assert_eq!(buf.is_empty(), expected_empty);
        }
        assert_eq!(loopback.captures_completed(), 3);
    }

    #[test]
    fn test_capture_is_exclusive() {
        let loopback = SimulatedLoopback::with_gains(1.0, 1.0);
        let mut mic = loopback.capture();
        let mut second = loopback.capture();

        mic.start_capture(44100).unwrap();
        assert_eq!(second.start_capture(44100), Err(DeviceError::CaptureBusy));
        assert!(mic.is_capturing());
    }

    #[test]
    fn test_stop_without_start() {
        let loopback = SimulatedLoopback::with_gains(1.0, 1.0);
        let mut mic = loopback.capture();
        assert_eq!(mic.stop_capture(), Err(DeviceError::CaptureNotRunning));
    }

    #[test]
    fn test_injected_faults() {
        let loopback = SimulatedLoopback::with_gains(1.0, 1.0);
        loopback.inject_playback_fault(0);
        loopback.inject_capture_fault(0);

        let mut speaker = loopback.playback();
        let mut mic = loopback.capture();
        assert!(speaker.play(&[0.0, 0.0], 44100).is_err());
        assert!(speaker.play(&[0.0, 0.0], 44100).is_ok());
        assert!(mic.start_capture(44100).is_err());
        assert!(!mic.is_capturing());
        assert!(mic.start_capture(44100).is_ok());
    }

    #[test]
    fn test_play_log_tracks_channels() {
        let loopback = SimulatedLoopback::with_gains(1.0, 1.0);
        let mut speaker = loopback.playback();
        speaker
            .play(&to_stereo(&[0.0, 0.3], ChannelMask::LEFT), 44100)
            .unwrap();

        let log = loopback.play_log();
        assert_eq!(log.len(), 1);
        assert!(log[0].has_left());
        assert!(!log[0].has_right());
        assert_eq!(log[0].frames, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_playback_audio_is_released() {
        let loopback = quiet(1.0, 1.0);
        let mut speaker = loopback.playback();
        let tone = to_stereo(&[0.5; 4000], ChannelMask::BOTH);

        for _ in 0..3 {
            let handle = speaker.play(&tone, 8000).unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            speaker.stop(handle).unwrap();
        }

        assert_eq!(loopback.play_log().len(), 3);
        assert_eq!(loopback.buffered_samples(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_playback_kept_while_capture_can_hear_it() {
        let loopback = quiet(1.0, 0.0);
        let mut speaker = loopback.playback();
        let mut mic = loopback.capture();
        let tone = to_stereo(&[0.5; 8000], ChannelMask::LEFT);

        mic.start_capture(8000).unwrap();
        let handle = speaker.play(&tone, 8000).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        speaker.stop(handle).unwrap();
        assert_eq!(loopback.buffered_samples(), tone.len());

        tokio::time::sleep(Duration::from_millis(100)).await;
        let buf = mic.stop_capture().unwrap();
        assert_eq!(loopback.buffered_samples(), 0);

        // First half heard the tone, second half silence
        assert_eq!(buf.len(), 1600);
        assert!(buf.samples()[..800].iter().all(|&s| (s - 0.5).abs() < 1e-3));
        assert!(buf.samples()[800..].iter().all(|&s| s == 0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_input_rate_overrides_requested_rate() {
        let loopback = SimulatedLoopback::new(LoopbackConfig {
            noise_amplitude: 0.0,
            input_rate: Some(48000),
            ..Default::default()
        });
        let mut mic = loopback.capture();
        assert_eq!(mic.capture_rate(), Some(48000));

        mic.start_capture(44100).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let buf = mic.stop_capture().unwrap();

        assert_eq!(buf.sample_rate(), 48000);
        assert_eq!(buf.len(), 4800);
    }
}
