//! # Collaborator Fan-out
//!
//! Fire-and-forget exports to external collaborators: completed messages go
//! to a message store, text inputs and finished transcripts go to an event
//! endpoint. Every export is spawned off the session loop and every failure
//! is swallowed with a debug log; collaborators can never stall or break
//! the session.

use crate::config::CollaboratorConfig;
use crate::message::Message;
use serde_json::json;
use tracing::debug;

/// HTTP client for collaborator exports. Cheap to clone; no-ops when the
/// corresponding URL is not configured.
#[derive(Debug, Clone)]
pub struct CollaboratorClient {
    config: CollaboratorConfig,
    client: reqwest::Client,
}

impl CollaboratorClient {
    pub fn new(config: CollaboratorConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    /// Persist a completed conversation turn to the message store.
    pub fn persist_message(&self, message: &Message) {
        let Some(url) = self.config.message_store_url.clone() else {
            return;
        };
        let body = json!({
            "id": message.id,
            "role": message.role,
            "content": message.content,
            "timestamp": message.timestamp,
        });
        self.post(url, body);
    }

    /// Announce a user text input to the event endpoint.
    pub fn text_input_event(&self, text: &str) {
        let Some(url) = self.config.event_fanout_url.clone() else {
            return;
        };
        self.post(url, json!({ "event": "text_input", "text": text }));
    }

    /// Announce a finished assistant transcript to the event endpoint.
    pub fn transcript_event(&self, transcript: &str) {
        let Some(url) = self.config.event_fanout_url.clone() else {
            return;
        };
        self.post(
            url,
            json!({ "event": "transcript_complete", "transcript": transcript }),
        );
    }

    fn post(&self, url: String, body: serde_json::Value) {
        let client = self.client.clone();
        tokio::spawn(async move {
            match client.post(&url).json(&body).send().await {
                Ok(response) => {
                    debug!(url = %url, status = %response.status(), "Collaborator export delivered");
                }
                Err(e) => {
                    debug!(url = %url, error = %e, "Collaborator export failed (ignored)");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unconfigured_exports_are_noops() {
        let client = CollaboratorClient::new(CollaboratorConfig {
            message_store_url: None,
            event_fanout_url: None,
        });
        // Nothing to observe beyond not panicking and not spawning network IO.
        client.persist_message(&Message::user("hello"));
        client.text_input_event("hello");
        client.transcript_event("done");
    }
}
