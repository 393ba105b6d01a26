//! cpal audio engine for tone playback and microphone capture
//!
//! Provides:
//! - Device enumeration ([`list_devices`])
//! - [`CpalPlayback`]: plays interleaved stereo buffers on an output device
//! - [`CpalCapture`]: buffers mono 16-bit microphone input until stopped
//!
//! Audio callbacks never block or allocate: playback samples are handed over
//! through a pre-filled ring buffer, and captured samples are pushed into a
//! ring sized for the longest capture that [`CpalCapture::stop_capture`]
//! drains once the stream is closed. Stream errors reach the owner over a
//! bounded channel.

use super::device::{CaptureSource, DeviceError, PlaybackHandle, PlaybackSink};
use super::signal::SampleBuffer;
use crate::config::{AMBIENT_MS_RANGE, MEASURE_MS_RANGE};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig};
use crossbeam_channel::{Receiver, Sender};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Audio device information
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Device name
    pub name: String,
    /// Whether this is the default input or output device
    pub is_default: bool,
    /// Default input channel count (0 if not an input)
    pub input_channels: u16,
    /// Default output channel count (0 if not an output)
    pub output_channels: u16,
    /// Default sample rate reported by the device
    pub default_rate: Option<u32>,
}

/// List the devices of the default host
pub fn list_devices() -> Result<Vec<DeviceInfo>, DeviceError> {
    let host = cpal::default_host();

    let default_input = host.default_input_device().and_then(|d| d.name().ok());
    let default_output = host.default_output_device().and_then(|d| d.name().ok());

    let devices = host
        .devices()
        .map_err(|e| DeviceError::StreamError(e.to_string()))?;

    let mut result = Vec::new();
    for device in devices {
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        let is_default = default_input.as_deref() == Some(name.as_str())
            || default_output.as_deref() == Some(name.as_str());

        let input = device.default_input_config().ok();
        let output = device.default_output_config().ok();

        result.push(DeviceInfo {
            is_default,
            input_channels: input.as_ref().map(|c| c.channels()).unwrap_or(0),
            output_channels: output.as_ref().map(|c| c.channels()).unwrap_or(0),
            default_rate: output
                .as_ref()
                .or(input.as_ref())
                .map(|c| c.sample_rate().0),
            name,
        });
    }

    Ok(result)
}

fn find_device(name: &str, input: bool) -> Result<Device, DeviceError> {
    let host = cpal::default_host();
    let mut devices = if input {
        host.input_devices()
    } else {
        host.output_devices()
    }
    .map_err(|e| DeviceError::StreamError(e.to_string()))?;

    devices
        .find(|d| d.name().map(|n| n == name).unwrap_or(false))
        .ok_or_else(|| DeviceError::DeviceNotFound(name.to_string()))
}

struct ActivePlayback {
    handle: PlaybackHandle,
    _stream: Stream,
}

/// Stereo tone playback on a cpal output device
pub struct CpalPlayback {
    device: Device,
    device_name: String,
    channels: u16,
    sample_format: SampleFormat,
    native_rate: u32,
    active: Option<ActivePlayback>,
    next_handle: u64,
}

impl CpalPlayback {
    /// Open an output device by name, or the default output when `None`
    pub fn open(name: Option<&str>) -> Result<Self, DeviceError> {
        let device = match name {
            Some(name) => find_device(name, false)?,
            None => cpal::default_host()
                .default_output_device()
                .ok_or(DeviceError::NoOutputDevice)?,
        };
        let config = device
            .default_output_config()
            .map_err(|e| DeviceError::StreamError(e.to_string()))?;
        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());

        tracing::info!(
            device = %device_name,
            channels = config.channels(),
            rate = config.sample_rate().0,
            format = ?config.sample_format(),
            "Opened output device"
        );

        Ok(Self {
            device,
            device_name,
            channels: config.channels(),
            sample_format: config.sample_format(),
            native_rate: config.sample_rate().0,
            active: None,
            next_handle: 0,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    fn build_stream<T>(&self, stereo: &[f32], config: &StreamConfig) -> Result<Stream, DeviceError>
    where
        T: SizedSample + FromSample<f32>,
    {
        let ring = HeapRb::<f32>::new(stereo.len().max(2));
        let (mut producer, mut consumer) = ring.split();
        producer.push_slice(stereo);

        let channels = config.channels as usize;
        self.device
            .build_output_stream(
                config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    for frame in data.chunks_mut(channels) {
                        let mut lr = [0.0f32; 2];
                        consumer.pop_slice(&mut lr);

                        if frame.len() == 1 {
                            frame[0] = <T as FromSample<f32>>::from_sample_(0.5 * (lr[0] + lr[1]));
                            continue;
                        }
                        for (ch, out) in frame.iter_mut().enumerate() {
                            let value = if ch < 2 { lr[ch] } else { 0.0 };
                            *out = <T as FromSample<f32>>::from_sample_(value);
                        }
                    }
                },
                |err| tracing::error!(error = %err, "Playback stream error"),
                None,
            )
            .map_err(|e| DeviceError::StreamError(e.to_string()))
    }
}

impl PlaybackSink for CpalPlayback {
    fn play(&mut self, stereo: &[f32], sample_rate: u32) -> Result<PlaybackHandle, DeviceError> {
        self.active = None;

        let config = StreamConfig {
            channels: self.channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let stream = match self.sample_format {
            SampleFormat::F32 => self.build_stream::<f32>(stereo, &config)?,
            SampleFormat::I16 => self.build_stream::<i16>(stereo, &config)?,
            SampleFormat::U16 => self.build_stream::<u16>(stereo, &config)?,
            SampleFormat::I32 => self.build_stream::<i32>(stereo, &config)?,
            other => {
                return Err(DeviceError::StreamError(format!(
                    "Unsupported output sample format: {other:?}"
                )))
            }
        };
        stream.play().map_err(|e| DeviceError::Playback(e.to_string()))?;

        self.next_handle += 1;
        let handle = PlaybackHandle(self.next_handle);
        tracing::debug!(
            handle = handle.0,
            frames = stereo.len() / 2,
            rate = sample_rate,
            "Playback started"
        );

        self.active = Some(ActivePlayback {
            handle,
            _stream: stream,
        });
        Ok(handle)
    }

    fn stop(&mut self, handle: PlaybackHandle) -> Result<(), DeviceError> {
        if self.active.as_ref().map(|a| a.handle) == Some(handle) {
            // Dropping the stream closes it
            self.active = None;
            tracing::debug!(handle = handle.0, "Playback stopped");
        }
        Ok(())
    }

    fn output_rate(&self) -> Option<u32> {
        Some(self.native_rate)
    }
}

/// Extra capture room beyond the longest allowed capture window
const CAPTURE_MARGIN_MS: usize = 1000;

/// Ring capacity holding the longest capture at `rate`
fn capture_capacity(rate: u32) -> usize {
    let longest = (*MEASURE_MS_RANGE.end()).max(*AMBIENT_MS_RANGE.end()) as usize;
    rate as usize * (longest + CAPTURE_MARGIN_MS) / 1000
}

struct ActiveCapture {
    stream: Stream,
    samples: HeapCons<i16>,
    overflow: Arc<AtomicUsize>,
    errors: Receiver<String>,
    rate: u32,
}

/// Microphone capture on a cpal input device
pub struct CpalCapture {
    device: Device,
    device_name: String,
    channels: u16,
    sample_format: SampleFormat,
    native_rate: u32,
    active: Option<ActiveCapture>,
}

impl CpalCapture {
    /// Open an input device by name, or the default input when `None`
    pub fn open(name: Option<&str>) -> Result<Self, DeviceError> {
        let device = match name {
            Some(name) => find_device(name, true)?,
            None => cpal::default_host()
                .default_input_device()
                .ok_or(DeviceError::NoInputDevice)?,
        };
        let config = device
            .default_input_config()
            .map_err(|e| DeviceError::StreamError(e.to_string()))?;
        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());

        tracing::info!(
            device = %device_name,
            channels = config.channels(),
            rate = config.sample_rate().0,
            format = ?config.sample_format(),
            "Opened input device"
        );

        Ok(Self {
            device,
            device_name,
            channels: config.channels(),
            sample_format: config.sample_format(),
            native_rate: config.sample_rate().0,
            active: None,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    fn build_stream<T>(
        &self,
        config: &StreamConfig,
        mut producer: HeapProd<i16>,
        overflow: Arc<AtomicUsize>,
        errors: Sender<String>,
    ) -> Result<Stream, DeviceError>
    where
        T: SizedSample,
        i16: FromSample<T>,
    {
        let channels = config.channels as usize;
        self.device
            .build_input_stream(
                config,
                move |data: &[T], _: &cpal::InputCallbackInfo| {
                    // Keep the first channel of each frame
                    let mut dropped = 0;
                    for frame in data.chunks(channels) {
                        let sample = <i16 as FromSample<T>>::from_sample_(frame[0]);
                        if producer.try_push(sample).is_err() {
                            dropped += 1;
                        }
                    }
                    if dropped > 0 {
                        overflow.fetch_add(dropped, Ordering::Relaxed);
                    }
                },
                move |err| {
                    tracing::error!(error = %err, "Capture stream error");
                    let _ = errors.try_send(err.to_string());
                },
                None,
            )
            .map_err(|e| DeviceError::StreamError(e.to_string()))
    }

    fn open_stream(&self, rate: u32) -> Result<ActiveCapture, DeviceError> {
        let config = StreamConfig {
            channels: self.channels,
            sample_rate: SampleRate(rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let (producer, samples) = HeapRb::<i16>::new(capture_capacity(rate)).split();
        let overflow = Arc::new(AtomicUsize::new(0));
        let (errors_tx, errors) = crossbeam_channel::bounded(4);
        let counter = Arc::clone(&overflow);

        let stream = match self.sample_format {
            SampleFormat::I16 => self.build_stream::<i16>(&config, producer, counter, errors_tx)?,
            SampleFormat::F32 => self.build_stream::<f32>(&config, producer, counter, errors_tx)?,
            SampleFormat::U16 => self.build_stream::<u16>(&config, producer, counter, errors_tx)?,
            SampleFormat::I32 => self.build_stream::<i32>(&config, producer, counter, errors_tx)?,
            other => {
                return Err(DeviceError::StreamError(format!(
                    "Unsupported input sample format: {other:?}"
                )))
            }
        };
        stream.play().map_err(|e| DeviceError::Capture(e.to_string()))?;

        Ok(ActiveCapture {
            stream,
            samples,
            overflow,
            errors,
            rate,
        })
    }
}

impl CaptureSource for CpalCapture {
    fn start_capture(&mut self, sample_rate: u32) -> Result<(), DeviceError> {
        if self.active.is_some() {
            return Err(DeviceError::CaptureBusy);
        }

        let active = match self.open_stream(sample_rate) {
            Ok(active) => active,
            Err(e) if sample_rate != self.native_rate => {
                tracing::warn!(
                    requested = sample_rate,
                    native = self.native_rate,
                    error = %e,
                    "Capture rate rejected, using device default"
                );
                self.open_stream(self.native_rate)?
            }
            Err(e) => return Err(e),
        };

        self.active = Some(active);
        Ok(())
    }

    fn stop_capture(&mut self) -> Result<SampleBuffer, DeviceError> {
        let ActiveCapture {
            stream,
            mut samples,
            overflow,
            errors,
            rate,
        } = self.active.take().ok_or(DeviceError::CaptureNotRunning)?;

        if let Err(e) = stream.pause() {
            tracing::warn!(error = %e, "Failed to pause capture stream");
        }
        // Closing the stream drops the callback and with it the producer
        drop(stream);

        if let Ok(err) = errors.try_recv() {
            return Err(DeviceError::Capture(err));
        }

        let mut pcm = vec![0i16; samples.occupied_len()];
        let read = samples.pop_slice(&mut pcm);
        pcm.truncate(read);

        let dropped = overflow.load(Ordering::Relaxed);
        if dropped > 0 {
            tracing::warn!(dropped, "Capture buffer full, samples lost");
        }

        tracing::debug!(samples = pcm.len(), rate, "Capture stopped");
        SampleBuffer::from_pcm16(&pcm, rate).map_err(|e| DeviceError::Capture(e.to_string()))
    }

    fn is_capturing(&self) -> bool {
        self.active.is_some()
    }

    fn capture_rate(&self) -> Option<u32> {
        Some(self.native_rate)
    }
}
