//! # Configuration Management
//!
//! This module handles loading and managing the voice client configuration
//! from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with VOICE_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (VOICE_ENDPOINT_URL, VOICE_RECONNECT_MAX_ATTEMPTS, etc.)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)
//!
//! The endpoint URL is deliberately optional: an absent URL is a meaningful
//! runtime state (`not_configured`) that the session surfaces as a fatal,
//! non-retriable error rather than a load failure.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Which transport adapter the session opens at connect time.
///
/// Evaluated once per `connect()`; the session is otherwise
/// transport-agnostic and only talks to the `Transport` trait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Persistent socket to a proxy endpoint that relays to the AI service
    SocketProxy,
    /// Negotiated peer session opened directly with the AI service
    PeerSession,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::SocketProxy => "socket_proxy",
            TransportKind::PeerSession => "peer_session",
        }
    }
}

/// Main configuration for the voice client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    pub endpoint: EndpointConfig,
    pub session: SessionConfig,
    pub audio: AudioConfig,
    pub vad: VadConfig,
    pub reconnect: ReconnectConfig,
    pub collaborators: CollaboratorConfig,
}

/// Remote endpoint settings.
///
/// ## Fields:
/// - `url`: base URL of the voice service or proxy. `None` means the
///   deployment never configured voice, which maps to `not_configured`.
/// - `transport`: which adapter `connect()` opens.
/// - `health_timeout_ms`: upper bound on the preflight health probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub url: Option<String>,
    pub transport: TransportKind,
    pub health_timeout_ms: u64,
}

/// Conversation session parameters sent in the `session.update` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub instructions: String,
    pub voice: String,
    pub temperature: f32,
    pub modalities: Vec<String>,
}

/// Audio capture format settings.
///
/// ## Fields:
/// - `sample_rate`: target rate frames are resampled to before framing
/// - `channels`: channel count on the wire (capture downmixes to mono)
/// - `bit_depth`: sample width on the wire (16-bit PCM)
/// - `frame_duration_ms`: duration of one fixed-size frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u8,
    pub bit_depth: u8,
    pub frame_duration_ms: u32,
}

impl AudioConfig {
    /// Samples per frame at the target rate.
    pub fn frame_samples(&self) -> usize {
        (self.sample_rate as usize * self.frame_duration_ms as usize) / 1000
    }
}

/// Voice activity detection settings.
///
/// The two-stage timeout (silence detect + grace) is deliberate: it avoids
/// cutting off a speaker on a brief pause mid-sentence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadConfig {
    pub enabled: bool,
    /// Activity threshold on the normalized [0,1] level
    pub threshold: f32,
    /// Continuous silence before the grace stage arms (milliseconds)
    pub silence_ms: u64,
    /// Additional grace period before recording stops (milliseconds)
    pub grace_ms: u64,
}

/// Reconnection backoff settings.
///
/// The backoff curve is a tunable, not a wire contract: capped exponential
/// with additive jitter, reasonable defaults below.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Upper bound on the random additive jitter (0 disables jitter)
    pub jitter_ms: u64,
}

/// External collaborator endpoints for fire-and-forget exports.
///
/// Both are optional; absent URLs disable the corresponding export without
/// affecting the session in any way.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaboratorConfig {
    pub message_store_url: Option<String>,
    pub event_fanout_url: Option<String>,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            endpoint: EndpointConfig {
                url: None,
                transport: TransportKind::SocketProxy,
                health_timeout_ms: 5_000,
            },
            session: SessionConfig {
                instructions: "You are a helpful business assistant.".to_string(),
                voice: "alloy".to_string(),
                temperature: 0.8,
                modalities: vec!["text".to_string(), "audio".to_string()],
            },
            audio: AudioConfig {
                sample_rate: 24_000,
                channels: 1,
                bit_depth: 16,
                frame_duration_ms: 100,
            },
            vad: VadConfig {
                enabled: true,
                threshold: 0.01,
                silence_ms: 2_000,
                grace_ms: 1_000,
            },
            reconnect: ReconnectConfig {
                max_attempts: 5,
                base_delay_ms: 800,
                max_delay_ms: 30_000,
                jitter_ms: 250,
            },
            collaborators: CollaboratorConfig {
                message_store_url: None,
                event_fanout_url: None,
            },
        }
    }
}

impl VoiceConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with VOICE_
    /// 4. Handle the bare VOICE_ENDPOINT variable used by deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&VoiceConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            // VOICE_ENDPOINT_URL becomes endpoint.url in the config
            .add_source(config::Environment::with_prefix("VOICE").separator("_"));

        // Deployment platforms often expose a single flat variable for the
        // service endpoint; honor it without the nested naming convention.
        if let Ok(url) = env::var("VOICE_ENDPOINT") {
            settings = settings.set_override("endpoint.url", url)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// A `None` endpoint URL is valid here; it is surfaced later as a
    /// `not_configured` health status, not a load-time failure.
    pub fn validate(&self) -> Result<()> {
        if let Some(url) = &self.endpoint.url {
            if !(url.starts_with("http://")
                || url.starts_with("https://")
                || url.starts_with("ws://")
                || url.starts_with("wss://"))
            {
                return Err(anyhow::anyhow!(
                    "Endpoint URL must use http(s) or ws(s) scheme: {}",
                    url
                ));
            }
        }

        if self.endpoint.health_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Health check timeout must be greater than 0"));
        }

        if !(0.0..=2.0).contains(&self.session.temperature) {
            return Err(anyhow::anyhow!(
                "Temperature must be between 0.0 and 2.0, got {}",
                self.session.temperature
            ));
        }

        if self.audio.sample_rate == 0 || self.audio.frame_duration_ms == 0 {
            return Err(anyhow::anyhow!("Audio sample rate and frame duration must be greater than 0"));
        }

        if self.audio.bit_depth != 16 {
            return Err(anyhow::anyhow!(
                "Only 16-bit PCM is supported, got {} bits",
                self.audio.bit_depth
            ));
        }

        if !(0.0..=1.0).contains(&self.vad.threshold) {
            return Err(anyhow::anyhow!(
                "VAD threshold must be between 0.0 and 1.0, got {}",
                self.vad.threshold
            ));
        }

        if self.reconnect.max_attempts == 0 {
            return Err(anyhow::anyhow!("Max reconnect attempts must be greater than 0"));
        }

        if self.reconnect.base_delay_ms == 0
            || self.reconnect.max_delay_ms < self.reconnect.base_delay_ms
        {
            return Err(anyhow::anyhow!(
                "Reconnect delays must satisfy 0 < base_delay_ms <= max_delay_ms"
            ));
        }

        Ok(())
    }

    /// Whether a voice endpoint has been configured at all.
    pub fn is_configured(&self) -> bool {
        self.endpoint.url.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = VoiceConfig::default();
        assert_eq!(config.endpoint.transport, TransportKind::SocketProxy);
        assert_eq!(config.audio.sample_rate, 24_000);
        assert_eq!(config.audio.frame_samples(), 2_400);
        assert_eq!(config.vad.threshold, 0.01);
        assert!(!config.is_configured());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = VoiceConfig::default();
        config.session.temperature = 3.5;
        assert!(config.validate().is_err());

        let mut config = VoiceConfig::default();
        config.endpoint.url = Some("ftp://example.com".to_string());
        assert!(config.validate().is_err());

        let mut config = VoiceConfig::default();
        config.reconnect.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_valid_endpoint_url() {
        let mut config = VoiceConfig::default();
        config.endpoint.url = Some("wss://voice.example.com/realtime".to_string());
        assert!(config.validate().is_ok());
        assert!(config.is_configured());
    }

    #[test]
    fn test_transport_kind_serialization() {
        let json = serde_json::to_string(&TransportKind::PeerSession).unwrap();
        assert_eq!(json, "\"peer_session\"");
        let kind: TransportKind = serde_json::from_str("\"socket_proxy\"").unwrap();
        assert_eq!(kind, TransportKind::SocketProxy);
    }
}
