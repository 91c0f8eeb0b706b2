//! # Peer Session Transport
//!
//! Direct session with the AI service, negotiated out-of-band:
//!
//! 1. POST to the endpoint's session route; the service answers with the
//!    realtime URL and a short-lived bearer token
//! 2. Open an authorized WebSocket to that URL
//! 3. Push `session.update` immediately (no proxy handshake here)
//!
//! Unlike the proxy transport this adapter supports muting: while muted,
//! outbound audio frames are dropped locally so the mic can stay hot
//! without anything leaving the machine.

use crate::config::{TransportKind, VoiceConfig};
use crate::error::{VoiceError, VoiceResult};
use crate::protocol::ClientEvent;
use crate::transport::{self, Transport, TransportEvent, WsSink};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};

/// Negotiation response from the session route.
#[derive(Debug, Deserialize)]
struct SessionGrant {
    url: String,
    token: String,
}

pub struct PeerSessionTransport {
    ws_tx: WsSink,
    muted: Arc<AtomicBool>,
    closed: bool,
}

impl PeerSessionTransport {
    /// Negotiate and open the direct session.
    pub async fn open(
        config: &VoiceConfig,
    ) -> VoiceResult<(Self, UnboundedReceiver<TransportEvent>)> {
        let base = config.endpoint.url.as_deref().ok_or_else(|| {
            VoiceError::Configuration("no endpoint URL configured".to_string())
        })?;

        let grant = negotiate(base).await?;
        info!(url = %grant.url, "Peer session granted, opening realtime socket");

        let mut request = grant
            .url
            .clone()
            .into_client_request()
            .map_err(|e| VoiceError::Connection(format!("invalid realtime URL: {}", e)))?;
        let auth = format!("Bearer {}", grant.token)
            .parse()
            .map_err(|_| VoiceError::Connection("token is not a valid header value".to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, auth);

        let (ws_stream, _response) = connect_async(request).await?;
        let (ws_tx, ws_rx) = ws_stream.split();

        let (tx, rx) = mpsc::unbounded_channel();
        transport::spawn_reader(ws_rx, tx);

        let mut transport = Self {
            ws_tx,
            muted: Arc::new(AtomicBool::new(false)),
            closed: false,
        };

        transport
            .send_event(&ClientEvent::session_update(&config.session))
            .await?;

        debug!("Peer session configured");
        Ok((transport, rx))
    }

    async fn send_event(&mut self, event: &ClientEvent) -> VoiceResult<()> {
        let json = event.encode()?;
        self.ws_tx.send(Message::Text(json)).await?;
        Ok(())
    }
}

/// Ask the endpoint for a realtime session grant.
async fn negotiate(base: &str) -> VoiceResult<SessionGrant> {
    let url = format!("{}/session", http_base(base).trim_end_matches('/'));
    debug!(url = %url, "Negotiating peer session");

    let response = reqwest::Client::new().post(&url).send().await?;
    if !response.status().is_success() {
        return Err(VoiceError::Connection(format!(
            "session negotiation failed with status {}",
            response.status()
        )));
    }
    response
        .json::<SessionGrant>()
        .await
        .map_err(|e| VoiceError::Connection(format!("malformed session grant: {}", e)))
}

/// The negotiation leg is plain HTTP even when the endpoint is given with a
/// WebSocket scheme.
fn http_base(base: &str) -> String {
    if let Some(rest) = base.strip_prefix("wss://") {
        format!("https://{}", rest)
    } else if let Some(rest) = base.strip_prefix("ws://") {
        format!("http://{}", rest)
    } else {
        base.to_string()
    }
}

#[async_trait]
impl Transport for PeerSessionTransport {
    async fn send_audio_frame(&mut self, pcm: &[u8]) -> VoiceResult<()> {
        if self.muted.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.send_event(&ClientEvent::audio_append(pcm)).await
    }

    async fn send_text(&mut self, text: &str) -> VoiceResult<()> {
        for event in ClientEvent::user_turn(text) {
            self.send_event(&event).await?;
        }
        Ok(())
    }

    async fn commit_audio(&mut self) -> VoiceResult<()> {
        self.send_event(&ClientEvent::InputAudioCommit).await
    }

    async fn close(&mut self) -> VoiceResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let _ = self.ws_tx.send(Message::Close(None)).await;
        debug!("Peer session transport closed");
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::PeerSession
    }

    async fn set_muted(&mut self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
        debug!(muted, "Peer session mute toggled");
    }
}
