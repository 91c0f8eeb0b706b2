//! # Audio Subsystem
//!
//! Capture (microphone → fixed PCM16 frames), voice activity detection on
//! those frames, and playback of assistant audio.

pub mod capture;
pub mod frame;
pub mod playback;
pub mod vad;
