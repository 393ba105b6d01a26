//! Audio processing module
//!
//! This module contains all audio-related functionality including:
//! - Test tone synthesis ([`signal`])
//! - Nearest-neighbour sample rate conversion ([`resample`])
//! - Mono to stereo channel routing ([`mixer`])
//! - RMS and Goertzel level estimation ([`detector`])
//! - Device traits and the operator prompt ([`device`])
//! - cpal playback and capture ([`engine`])
//! - Simulated earbud-to-microphone path ([`loopback`])

pub mod detector;
pub mod device;
pub mod engine;
pub mod loopback;
pub mod mixer;
pub mod resample;
pub mod signal;
