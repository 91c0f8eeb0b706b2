//! # Voice Activity Detection
//!
//! Decides when the user has stopped talking so listening can end without
//! an explicit button press.
//!
//! ## Level Computation:
//! The activity level is the RMS of the frequency-domain magnitude spectrum,
//! normalized into [0, 1]. This tracks broadband speech energy well enough
//! for endpointing even though it weights the spectrum differently than a
//! plain time-domain RMS would.
//!
//! ## Two-Stage Silence Timeout:
//! 1. Level stays below the threshold for `silence_ms` (default 2000 ms)
//! 2. A grace stage of `grace_ms` (default 1000 ms) runs before stop fires
//!
//! The stop decision fires exactly once per listening run; any speech during
//! either stage resets both. Timing is driven by the timestamps on the
//! frames themselves, so tests inject synthetic clocks instead of sleeping.

use crate::config::VadConfig;
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use std::time::{Duration, Instant};
use tracing::debug;

/// Outcome of feeding one frame to the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadDecision {
    /// Activity above threshold
    Speech,
    /// Below threshold but the timeout has not elapsed
    Silence,
    /// Silence + grace elapsed; recording should stop now
    Stop,
}

/// Frequency-domain voice activity detector.
pub struct VoiceActivityDetector {
    config: VadConfig,
    planner: FftPlanner<f32>,
    level: f32,
    silence_since: Option<Instant>,
    stopped: bool,
}

impl VoiceActivityDetector {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            planner: FftPlanner::new(),
            level: 0.0,
            silence_since: None,
            stopped: false,
        }
    }

    /// Last computed activity level in [0, 1].
    pub fn level(&self) -> f32 {
        self.level
    }

    /// Feed one captured frame.
    pub fn process_frame(&mut self, samples: &[i16], at: Instant) -> VadDecision {
        let level = self.spectral_level(samples);
        self.update(level, at)
    }

    /// Advance the silence state machine with a precomputed level.
    ///
    /// Exposed separately so timing behavior is testable without audio.
    pub fn update(&mut self, level: f32, at: Instant) -> VadDecision {
        self.level = level;

        if !self.config.enabled || self.stopped {
            return VadDecision::Silence;
        }

        if level >= self.config.threshold {
            self.silence_since = None;
            return VadDecision::Speech;
        }

        let since = *self.silence_since.get_or_insert(at);
        let elapsed = at.saturating_duration_since(since);
        let timeout = Duration::from_millis(self.config.silence_ms + self.config.grace_ms);

        if elapsed >= timeout {
            debug!(elapsed_ms = elapsed.as_millis() as u64, "Silence timeout reached, stopping");
            self.stopped = true;
            VadDecision::Stop
        } else {
            VadDecision::Silence
        }
    }

    /// Re-arm the detector for a new listening run.
    pub fn reset(&mut self) {
        self.level = 0.0;
        self.silence_since = None;
        self.stopped = false;
    }

    /// Normalized RMS of the magnitude spectrum.
    fn spectral_level(&mut self, samples: &[i16]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }

        let mut buffer: Vec<Complex<f32>> = samples
            .iter()
            .map(|&s| Complex::new(s as f32 / 32768.0, 0.0))
            .collect();

        let fft = self.planner.plan_fft_forward(buffer.len());
        fft.process(&mut buffer);

        // Magnitudes normalized by half the window length, RMS over bins.
        let half = (buffer.len() as f32 / 2.0).max(1.0);
        let sum_sq: f32 = buffer
            .iter()
            .map(|c| {
                let magnitude = c.norm() / half;
                magnitude * magnitude
            })
            .sum();

        (sum_sq / buffer.len() as f32).sqrt().min(1.0)
    }
}
