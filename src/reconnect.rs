//! # Reconnection Policy Engine
//!
//! Pure retry/backoff decisions, kept separate from the session loop so the
//! curve is testable without timers. The session owns the counters and the
//! single timer slot; this module answers two questions:
//! - may this failure be retried at all (`should_retry`)
//! - how long to wait before the next attempt (`next_delay`)
//!
//! The curve is capped exponential with additive random jitter. Jitter is a
//! config knob so deterministic tests set it to zero.

use crate::config::ReconnectConfig;
use crate::error::VoiceError;
use rand::Rng;
use std::time::Duration;

/// Decides retry eligibility and backoff delays.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
}

impl ReconnectPolicy {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Whether another attempt is allowed after `attempts` failures.
    ///
    /// Non-retriable errors (configuration, media access) are refused no
    /// matter how much budget remains.
    pub fn should_retry(&self, error: &VoiceError, attempts: u32) -> bool {
        error.is_retriable() && attempts < self.config.max_attempts
    }

    /// Delay before attempt number `attempt` (1-based).
    ///
    /// `base * 2^(attempt-1)` capped at `max_delay_ms`, plus jitter drawn
    /// uniformly from `0..=jitter_ms`. The shift is clamped so a large
    /// attempt count cannot overflow.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(10);
        let scaled = self
            .config
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.config.max_delay_ms);

        let jitter = if self.config.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.config.jitter_ms)
        } else {
            0
        };

        Duration::from_millis(scaled + jitter)
    }
}

/// Counters the session carries between attempts.
#[derive(Debug, Clone, Default)]
pub struct ReconnectState {
    /// Consecutive failed attempts since the last successful connection
    pub attempts: u32,
    /// Delay of the currently scheduled attempt, if one is pending
    pub next_delay: Option<Duration>,
    /// Cleared when the user cancels reconnection or a fatal error lands
    pub auto_reconnect: bool,
}

impl ReconnectState {
    pub fn new() -> Self {
        Self {
            attempts: 0,
            next_delay: None,
            auto_reconnect: true,
        }
    }

    /// Reset after a successful connection: counters to zero, automatic
    /// reconnection re-armed.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.next_delay = None;
        self.auto_reconnect = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base: u64, max: u64, attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy::new(ReconnectConfig {
            max_attempts: attempts,
            base_delay_ms: base,
            max_delay_ms: max,
            jitter_ms: 0,
        })
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let policy = policy(800, 30_000, 5);
        assert_eq!(policy.next_delay(1), Duration::from_millis(800));
        assert_eq!(policy.next_delay(2), Duration::from_millis(1_600));
        assert_eq!(policy.next_delay(3), Duration::from_millis(3_200));
        assert_eq!(policy.next_delay(6), Duration::from_millis(25_600));
        assert_eq!(policy.next_delay(7), Duration::from_millis(30_000));
        assert_eq!(policy.next_delay(50), Duration::from_millis(30_000));
    }

    #[test]
    fn test_jitter_stays_within_bound() {
        let policy = ReconnectPolicy::new(ReconnectConfig {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter_ms: 50,
        });
        for _ in 0..20 {
            let delay = policy.next_delay(1).as_millis() as u64;
            assert!((100..=150).contains(&delay), "delay {} out of range", delay);
        }
    }

    #[test]
    fn test_retry_refusal() {
        let policy = policy(100, 1_000, 3);
        let transient = VoiceError::Connection("socket closed".into());
        let fatal = VoiceError::Configuration("no endpoint".into());

        assert!(policy.should_retry(&transient, 0));
        assert!(policy.should_retry(&transient, 2));
        // Budget exhausted after max_attempts failures.
        assert!(!policy.should_retry(&transient, 3));
        // Non-retriable errors are refused regardless of budget.
        assert!(!policy.should_retry(&fatal, 0));
    }

    #[test]
    fn test_state_reset() {
        let mut state = ReconnectState::new();
        state.attempts = 4;
        state.next_delay = Some(Duration::from_secs(8));
        state.auto_reconnect = false;

        state.reset();
        assert_eq!(state.attempts, 0);
        assert!(state.next_delay.is_none());
        assert!(state.auto_reconnect);
    }
}
