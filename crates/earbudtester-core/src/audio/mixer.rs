//! Mono to stereo routing
//!
//! Routes the test tone to the left earbud, the right earbud, both, or
//! neither by gating each channel of an interleaved stereo buffer.

use serde::{Deserialize, Serialize};

/// Per-channel enable flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChannelMask {
    pub left: bool,
    pub right: bool,
}

impl ChannelMask {
    pub const LEFT: Self = Self {
        left: true,
        right: false,
    };
    pub const RIGHT: Self = Self {
        left: false,
        right: true,
    };
    pub const BOTH: Self = Self {
        left: true,
        right: true,
    };
    pub const SILENT: Self = Self {
        left: false,
        right: false,
    };
}

/// Interleave `mono` into stereo frames
///
/// Even indices carry the left channel, odd indices the right. A gated
/// channel is filled with silence.
pub fn to_stereo(mono: &[f32], mask: ChannelMask) -> Vec<f32> {
    let mut stereo = Vec::with_capacity(mono.len() * 2);
    for &sample in mono {
        stereo.push(if mask.left { sample } else { 0.0 });
        stereo.push(if mask.right { sample } else { 0.0 });
    }
    stereo
}
