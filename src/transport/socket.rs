//! # Socket Proxy Transport
//!
//! Persistent WebSocket to a proxy endpoint that relays to the AI service.
//!
//! ## Connection Sequence:
//! 1. Derive the ws(s) URL from the configured endpoint
//! 2. Open the WebSocket
//! 3. Send the `connect_realtime` handshake
//! 4. Wait a short settle delay for the proxy to establish its upstream leg
//! 5. Push the `session.update` configuration
//!
//! After that, audio frames and text turns go out as protocol envelopes and
//! everything inbound is pumped into the shared event channel.

use crate::config::{TransportKind, VoiceConfig};
use crate::error::{VoiceError, VoiceResult};
use crate::protocol::ClientEvent;
use crate::transport::{self, Transport, TransportEvent, WsSink};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};

/// Time given to the proxy to bring up its upstream leg before we configure
/// the session.
const SETTLE_DELAY: Duration = Duration::from_millis(250);

pub struct SocketProxyTransport {
    ws_tx: WsSink,
    closed: bool,
}

impl SocketProxyTransport {
    /// Open the proxy connection and run the handshake sequence.
    pub async fn open(
        config: &VoiceConfig,
    ) -> VoiceResult<(Self, UnboundedReceiver<TransportEvent>)> {
        let base = config.endpoint.url.as_deref().ok_or_else(|| {
            VoiceError::Configuration("no endpoint URL configured".to_string())
        })?;
        let url = ws_url(base);

        info!(url = %url, "Connecting to socket proxy");
        let (ws_stream, _response) = connect_async(url.as_str()).await?;
        let (ws_tx, ws_rx) = ws_stream.split();

        let (tx, rx) = mpsc::unbounded_channel();
        transport::spawn_reader(ws_rx, tx);

        let mut transport = Self {
            ws_tx,
            closed: false,
        };

        transport.send_event(&ClientEvent::ConnectRealtime).await?;

        // The proxy needs a moment to dial its upstream before it will
        // accept session configuration.
        tokio::time::sleep(SETTLE_DELAY).await;

        transport
            .send_event(&ClientEvent::session_update(&config.session))
            .await?;

        debug!("Socket proxy handshake complete");
        Ok((transport, rx))
    }

    async fn send_event(&mut self, event: &ClientEvent) -> VoiceResult<()> {
        let json = event.encode()?;
        self.ws_tx.send(Message::Text(json)).await?;
        Ok(())
    }
}

/// Map the configured endpoint to its WebSocket URL, adding the realtime
/// path when the endpoint is a bare base URL.
fn ws_url(base: &str) -> String {
    let converted = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base.to_string()
    };
    let trimmed = converted.trim_end_matches('/');
    if trimmed.ends_with("/realtime") {
        trimmed.to_string()
    } else {
        format!("{}/realtime", trimmed)
    }
}

#[async_trait]
impl Transport for SocketProxyTransport {
    async fn send_audio_frame(&mut self, pcm: &[u8]) -> VoiceResult<()> {
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
        // A close failure just means the socket is already gone.
        let _ = self.ws_tx.send(Message::Close(None)).await;
        debug!("Socket proxy transport closed");
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::SocketProxy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_url_derivation() {
        assert_eq!(ws_url("https://voice.example.com"), "wss://voice.example.com/realtime");
        assert_eq!(ws_url("http://localhost:8080/"), "ws://localhost:8080/realtime");
        assert_eq!(ws_url("wss://voice.example.com/realtime"), "wss://voice.example.com/realtime");
        assert_eq!(ws_url("ws://localhost:9000"), "ws://localhost:9000/realtime");
    }
}
