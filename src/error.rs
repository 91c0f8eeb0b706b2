//! # Error Handling
//!
//! Custom error types for the voice streaming client and how they feed the
//! reconnection machinery. Every public operation catches failures and
//! converts them into this taxonomy; no error crosses a component boundary
//! as a panic or an unclassified type.
//!
//! ## Error Categories:
//! - **Configuration**: missing or invalid endpoint configuration - fatal, never retried
//! - **HealthCheck**: the preflight probe failed or timed out
//! - **Connection**: transport open/close/socket failures - retried via backoff
//! - **Protocol**: malformed or unexpected inbound envelope - logged, non-fatal
//! - **MediaAccess**: microphone permission or device failure - requires user action
//! - **Playback**: audio decode or output failure - surfaced per call, no session impact

use std::fmt;

/// Failure taxonomy for the voice client.
///
/// Each variant holds a human-readable message. The variant itself is the
/// machine-readable classification: it decides whether the reconnection
/// policy may retry (`is_retriable`) and which callback surface reports it.
#[derive(Debug, Clone, PartialEq)]
pub enum VoiceError {
    /// The endpoint URL is absent or the configuration is unusable
    Configuration(String),

    /// The health prechecker reported the service unreachable or broken
    HealthCheck(String),

    /// Transport open/close/socket failure (transient by default)
    Connection(String),

    /// Malformed or unexpected inbound protocol envelope
    Protocol(String),

    /// Microphone permission denied or capture device unavailable
    MediaAccess(String),

    /// Audio decode or output failure during playback
    Playback(String),
}

impl VoiceError {
    /// Whether the reconnection policy may feed this error into the backoff loop.
    ///
    /// Only transient network-level failures qualify. Configuration and
    /// media-access problems need operator or user action; retrying them
    /// would just burn the attempt budget.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            VoiceError::Connection(_) | VoiceError::HealthCheck(_)
        )
    }

    /// Machine-readable error kind, used in fan-out payloads and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            VoiceError::Configuration(_) => "configuration_error",
            VoiceError::HealthCheck(_) => "health_check_error",
            VoiceError::Connection(_) => "connection_error",
            VoiceError::Protocol(_) => "protocol_error",
            VoiceError::MediaAccess(_) => "media_access_error",
            VoiceError::Playback(_) => "playback_error",
        }
    }

    /// The message carried by the variant, without the category prefix.
    pub fn message(&self) -> &str {
        match self {
            VoiceError::Configuration(msg)
            | VoiceError::HealthCheck(msg)
            | VoiceError::Connection(msg)
            | VoiceError::Protocol(msg)
            | VoiceError::MediaAccess(msg)
            | VoiceError::Playback(msg) => msg,
        }
    }
}

impl fmt::Display for VoiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoiceError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            VoiceError::HealthCheck(msg) => write!(f, "Health check error: {}", msg),
            VoiceError::Connection(msg) => write!(f, "Connection error: {}", msg),
            VoiceError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            VoiceError::MediaAccess(msg) => write!(f, "Media access error: {}", msg),
            VoiceError::Playback(msg) => write!(f, "Playback error: {}", msg),
        }
    }
}

impl std::error::Error for VoiceError {}

/// JSON envelopes that fail to parse are protocol errors, not fatal ones.
impl From<serde_json::Error> for VoiceError {
    fn from(err: serde_json::Error) -> Self {
        VoiceError::Protocol(format!("JSON parsing error: {}", err))
    }
}

/// WebSocket failures are transient connection errors by default; permanent
/// cases (bad handshake configuration) are reclassified at the call site.
impl From<tokio_tungstenite::tungstenite::Error> for VoiceError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        VoiceError::Connection(err.to_string())
    }
}

/// HTTP client failures during peer negotiation map to connection errors.
/// The health prechecker never converts this way - it folds request errors
/// into an `unavailable` snapshot instead of returning an error at all.
impl From<reqwest::Error> for VoiceError {
    fn from(err: reqwest::Error) -> Self {
        VoiceError::Connection(err.to_string())
    }
}

/// Type alias for Results that use our error type.
pub type VoiceResult<T> = Result<T, VoiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        assert!(VoiceError::Connection("socket closed".into()).is_retriable());
        assert!(VoiceError::HealthCheck("timed out".into()).is_retriable());
        assert!(!VoiceError::Configuration("no endpoint".into()).is_retriable());
        assert!(!VoiceError::MediaAccess("permission denied".into()).is_retriable());
        assert!(!VoiceError::Protocol("bad envelope".into()).is_retriable());
        assert!(!VoiceError::Playback("decode failed".into()).is_retriable());
    }

    #[test]
    fn test_display_includes_category_and_message() {
        let err = VoiceError::Connection("peer reset".into());
        let text = err.to_string();
        assert!(text.contains("Connection error"));
        assert!(text.contains("peer reset"));
        assert_eq!(err.kind(), "connection_error");
        assert_eq!(err.message(), "peer reset");
    }
}
