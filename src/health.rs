//! # Health Prechecker
//!
//! Before any connection attempt the session asks the health prechecker
//! whether the voice service is worth dialing. The check always resolves to
//! a [`HealthSnapshot`]; it never returns an error across its boundary.
//! Timeouts, refused connections and malformed bodies all fold into an
//! `unavailable` snapshot, and an absent endpoint URL short-circuits to
//! `not_configured` without any network traffic.

use crate::config::VoiceConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Service availability as reported by the preflight probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Endpoint answered and reports itself ready
    Available,
    /// Endpoint unreachable, timed out, or reported a failure
    Unavailable,
    /// No endpoint URL configured; connecting is pointless until fixed
    NotConfigured,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Available => "available",
            HealthStatus::Unavailable => "unavailable",
            HealthStatus::NotConfigured => "not_configured",
        }
    }
}

/// Result of one health probe.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    /// Human-readable failure detail when not available
    pub error: Option<String>,
    pub last_checked: DateTime<Utc>,
    /// Feature flags advertised by the endpoint, when it reports any
    pub features: Option<Vec<String>>,
}

impl HealthSnapshot {
    pub fn available(features: Option<Vec<String>>) -> Self {
        Self {
            status: HealthStatus::Available,
            error: None,
            last_checked: Utc::now(),
            features,
        }
    }

    pub fn unavailable(error: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unavailable,
            error: Some(error.into()),
            last_checked: Utc::now(),
            features: None,
        }
    }

    pub fn not_configured() -> Self {
        Self {
            status: HealthStatus::NotConfigured,
            error: Some("no voice endpoint configured".to_string()),
            last_checked: Utc::now(),
            features: None,
        }
    }

    pub fn is_available(&self) -> bool {
        self.status == HealthStatus::Available
    }
}

/// Seam between the session and the concrete probe, so scenario tests can
/// inject canned health results.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self) -> HealthSnapshot;
}

/// Body shape the health endpoint responds with.
#[derive(Debug, Deserialize)]
struct HealthBody {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    features: Option<Vec<String>>,
}

/// HTTP health probe hitting `{endpoint}/health`.
pub struct HttpHealthProbe {
    url: Option<String>,
    client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new(config: &VoiceConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.endpoint.health_timeout_ms))
            .build()
            .unwrap_or_default();

        Self {
            url: config.endpoint.url.as_ref().map(|base| health_url(base)),
            client,
        }
    }
}

/// The probe hits the endpoint itself. WebSocket schemes map to their HTTP
/// counterparts since the probe is plain HTTP.
fn health_url(base: &str) -> String {
    if let Some(rest) = base.strip_prefix("wss://") {
        format!("https://{}", rest)
    } else if let Some(rest) = base.strip_prefix("ws://") {
        format!("http://{}", rest)
    } else {
        base.to_string()
    }
}

/// Interpret a health response body. Separate from the probe so the mapping
/// is testable without a server.
fn snapshot_from_body(status_ok: bool, body: Result<HealthBody, serde_json::Error>) -> HealthSnapshot {
    if !status_ok {
        return HealthSnapshot::unavailable("health endpoint returned a non-success status");
    }
    match body {
        Ok(body) => match body.status.as_deref() {
            Some("available") | Some("ok") | Some("healthy") => {
                HealthSnapshot::available(body.features)
            }
            // The service itself can report that voice was never set up.
            Some("not_configured") => HealthSnapshot::not_configured(),
            _ => HealthSnapshot::unavailable(
                body.error
                    .unwrap_or_else(|| "service reported itself unhealthy".to_string()),
            ),
        },
        Err(e) => HealthSnapshot::unavailable(format!("malformed health response: {}", e)),
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn check(&self) -> HealthSnapshot {
        let url = match &self.url {
            Some(url) => url.clone(),
            None => {
                debug!("Health check skipped: no endpoint configured");
                return HealthSnapshot::not_configured();
            }
        };

        debug!(url = %url, "Running voice service health check");

        // The client-level timeout bounds the whole request; any transport
        // failure folds into an unavailable snapshot.
        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Health check request failed");
                return HealthSnapshot::unavailable(e.to_string());
            }
        };

        let status_ok = response.status().is_success();
        let body = match response.text().await {
            Ok(text) => serde_json::from_str::<HealthBody>(&text),
            Err(e) => {
                warn!(error = %e, "Health check body read failed");
                return HealthSnapshot::unavailable(e.to_string());
            }
        };

        let snapshot = snapshot_from_body(status_ok, body);
        debug!(status = snapshot.status.as_str(), "Health check complete");
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_url_derivation() {
        assert_eq!(health_url("https://voice.example.com"), "https://voice.example.com");
        assert_eq!(health_url("wss://voice.example.com/rt"), "https://voice.example.com/rt");
        assert_eq!(health_url("ws://localhost:8080"), "http://localhost:8080");
    }

    #[test]
    fn test_snapshot_from_healthy_body() {
        let body: HealthBody =
            serde_json::from_str(r#"{"status":"available","features":["voice","transcripts"]}"#)
                .unwrap();
        let snapshot = snapshot_from_body(true, Ok(body));
        assert!(snapshot.is_available());
        assert_eq!(
            snapshot.features,
            Some(vec!["voice".to_string(), "transcripts".to_string()])
        );
    }

    #[test]
    fn test_snapshot_from_unhealthy_body() {
        let body: HealthBody =
            serde_json::from_str(r#"{"status":"unavailable","error":"model warming up"}"#).unwrap();
        let snapshot = snapshot_from_body(true, Ok(body));
        assert_eq!(snapshot.status, HealthStatus::Unavailable);
        assert_eq!(snapshot.error.as_deref(), Some("model warming up"));
    }

    #[test]
    fn test_server_can_report_not_configured() {
        let body: HealthBody = serde_json::from_str(r#"{"status":"not_configured"}"#).unwrap();
        let snapshot = snapshot_from_body(true, Ok(body));
        assert_eq!(snapshot.status, HealthStatus::NotConfigured);
    }

    #[test]
    fn test_snapshot_from_http_failure_and_garbage() {
        let snapshot = snapshot_from_body(false, serde_json::from_str("{}"));
        assert_eq!(snapshot.status, HealthStatus::Unavailable);

        let snapshot = snapshot_from_body(true, serde_json::from_str::<HealthBody>("not json"));
        assert_eq!(snapshot.status, HealthStatus::Unavailable);
        assert!(snapshot.error.unwrap().contains("malformed"));
    }

    #[tokio::test]
    async fn test_missing_url_is_not_configured_without_io() {
        let config = VoiceConfig::default();
        assert!(config.endpoint.url.is_none());
        let probe = HttpHealthProbe::new(&config);
        let snapshot = probe.check().await;
        assert_eq!(snapshot.status, HealthStatus::NotConfigured);
        assert!(!snapshot.is_available());
    }
}
