//! Measurement orchestration
//!
//! - Per-channel ambient/tone capture cycles ([`session`])
//! - Left/right balance verdicts ([`balance`])

pub mod balance;
pub mod session;
