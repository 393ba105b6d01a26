//! Nearest-neighbour sample rate conversion
//!
//! Used to bring the synthesized tone to the playback device's rate. There is
//! no interpolation and no anti-alias filtering: each output sample is the
//! closest source sample in time.

use super::signal::{SampleBuffer, SignalError};

/// Convert `src` to `dst_rate`
///
/// Returns `src` untouched when the rates already match. Otherwise the output
/// holds `floor(len * dst_rate / src_rate)` samples, and output sample `i`
/// copies source sample `round(i * src_rate / dst_rate)`, clamped to the last
/// source index. Halfway positions round to the even index.
///
/// # Errors
/// Returns [`SignalError::InvalidSampleRate`] if `dst_rate` is zero
///
/// # Example
/// ```
/// use earbudtester_core::audio::resample::resample;
/// use earbudtester_core::audio::signal::SampleBuffer;
///
/// let src = SampleBuffer::new(vec![0.0, 1.0, 2.0, 3.0], 4).unwrap();
/// let dst = resample(src, 2).unwrap();
/// assert_eq!(dst.samples(), &[0.0, 2.0]);
/// ```
pub fn resample(src: SampleBuffer, dst_rate: u32) -> Result<SampleBuffer, SignalError> {
    if dst_rate == 0 {
        return Err(SignalError::InvalidSampleRate);
    }

    let src_rate = src.sample_rate();
    if src_rate == dst_rate {
        return Ok(src);
    }

    let input = src.samples();
    if input.is_empty() {
        return SampleBuffer::empty(dst_rate);
    }

    let dst_len = (input.len() as u64 * dst_rate as u64 / src_rate as u64) as usize;
    let last = input.len() - 1;

    let output = (0..dst_len)
        .map(|i| {
            let pos = i as f64 * src_rate as f64 / dst_rate as f64;
            input[(pos.round_ties_even() as usize).min(last)]
        })
        .collect();

    SampleBuffer::new(output, dst_rate)
}
