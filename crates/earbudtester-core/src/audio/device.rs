//! Boundary contracts between the measurement core and audio hardware
//!
//! The session only talks to devices through these traits. [`engine`] backs
//! them with cpal streams, [`loopback`] with a simulated acoustic path.
//!
//! [`engine`]: super::engine
//! [`loopback`]: super::loopback

use super::signal::SampleBuffer;
use thiserror::Error;

/// Errors raised by playback or capture devices
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("No input device available")]
    NoInputDevice,

    #[error("No output device available")]
    NoOutputDevice,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Capture already running")]
    CaptureBusy,

    #[error("Capture not running")]
    CaptureNotRunning,

    #[error("Playback failed: {0}")]
    Playback(String),

    #[error("Capture failed: {0}")]
    Capture(String),
}

/// Identifies one call to [`PlaybackSink::play`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlaybackHandle(pub u64);

/// Output device that plays interleaved stereo buffers
pub trait PlaybackSink {
    /// Start playing `stereo` (interleaved L/R) at `sample_rate`
    ///
    /// Any playback already in progress is stopped first.
    fn play(&mut self, stereo: &[f32], sample_rate: u32) -> Result<PlaybackHandle, DeviceError>;

    /// Stop a playback
    ///
    /// Stopping a handle that already finished, was already stopped, or was
    /// superseded by a later `play` is a no-op.
    fn stop(&mut self, handle: PlaybackHandle) -> Result<(), DeviceError>;

    /// Native output rate, if the device prefers one
    fn output_rate(&self) -> Option<u32> {
        None
    }
}

/// Input device capturing mono 16-bit PCM
pub trait CaptureSource {
    /// Begin buffering microphone input at `sample_rate`
    fn start_capture(&mut self, sample_rate: u32) -> Result<(), DeviceError>;

    /// Stop buffering and return everything captured since `start_capture`,
    /// normalized to [-1, 1]
    fn stop_capture(&mut self) -> Result<SampleBuffer, DeviceError>;

    /// Whether a capture is currently running
    fn is_capturing(&self) -> bool;

    /// Native input rate, if the device prefers one
    ///
    /// Captured buffers are tagged with the rate actually used, which may
    /// differ from the one passed to `start_capture`.
    fn capture_rate(&self) -> Option<u32> {
        None
    }
}

/// Operator answer to a confirmation prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Proceed,
    Cancel,
}

/// Human-in-the-loop gate shown before each channel measurement
pub trait OperatorPrompt {
    fn confirm(&mut self, message: &str) -> Confirmation;
}

/// Prompt that always answers the same way
#[derive(Debug, Clone, Copy)]
pub struct FixedPrompt(pub Confirmation);

impl OperatorPrompt for FixedPrompt {
    fn confirm(&mut self, _message: &str) -> Confirmation {
        self.0
    }
}
