//! # Transport Adapters
//!
//! Two ways to reach the AI service behind one interface:
//! - [`socket::SocketProxyTransport`]: persistent WebSocket to a proxy that
//!   relays to the service
//! - [`peer::PeerSessionTransport`]: a negotiated session opened directly
//!   with the service
//!
//! The session never branches on which adapter is active; it holds a
//! `Box<dyn Transport>` and consumes [`TransportEvent`]s from the channel
//! the factory returned. Exactly one transport is live at a time - the
//! session closes the old one before opening a new one.

pub mod peer;
pub mod socket;

use crate::config::{TransportKind, VoiceConfig};
use crate::error::VoiceResult;
use crate::protocol::{self, ServerEvent};
use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

/// Write half of an open WebSocket.
pub(crate) type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// What the session receives from whichever transport is active.
#[derive(Debug)]
pub enum TransportEvent {
    /// A decoded inbound protocol envelope
    Event(ServerEvent),
    /// The connection ended (clean close or failure)
    Closed { reason: Option<String> },
}

/// The seam between the session and a concrete connection.
#[async_trait]
pub trait Transport: Send {
    /// Ship one frame of raw little-endian PCM16 audio.
    async fn send_audio_frame(&mut self, pcm: &[u8]) -> VoiceResult<()>;

    /// Send a user text turn (conversation item plus response trigger).
    async fn send_text(&mut self, text: &str) -> VoiceResult<()>;

    /// Mark the end of the user's audio turn.
    async fn commit_audio(&mut self) -> VoiceResult<()>;

    /// Close the connection. Idempotent.
    async fn close(&mut self) -> VoiceResult<()>;

    fn kind(&self) -> TransportKind;

    /// Suppress outbound audio without tearing the connection down. Only
    /// meaningful for the peer transport; the proxy transport simply stops
    /// being fed frames.
    async fn set_muted(&mut self, _muted: bool) {}
}

/// Opens transports. A trait so scenario tests can hand the session a mock
/// connection without any network.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(
        &self,
        config: &VoiceConfig,
    ) -> VoiceResult<(Box<dyn Transport>, UnboundedReceiver<TransportEvent>)>;
}

/// Production factory: picks the adapter named in the configuration.
pub struct DefaultTransportFactory;

#[async_trait]
impl TransportFactory for DefaultTransportFactory {
    async fn open(
        &self,
        config: &VoiceConfig,
    ) -> VoiceResult<(Box<dyn Transport>, UnboundedReceiver<TransportEvent>)> {
        info!(transport = config.endpoint.transport.as_str(), "Opening transport");
        match config.endpoint.transport {
            TransportKind::SocketProxy => {
                let (transport, events) = socket::SocketProxyTransport::open(config).await?;
                Ok((Box::new(transport), events))
            }
            TransportKind::PeerSession => {
                let (transport, events) = peer::PeerSessionTransport::open(config).await?;
                Ok((Box::new(transport), events))
            }
        }
    }
}

/// Pump the read half of a WebSocket into transport events until it ends.
///
/// Undecodable text frames are logged and skipped, never fatal. Binary
/// frames have no meaning in this protocol and are ignored.
pub(crate) fn spawn_reader(
    mut ws_rx: futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    tx: UnboundedSender<TransportEvent>,
) {
    tokio::spawn(async move {
        loop {
            match ws_rx.next().await {
                Some(Ok(Message::Text(text))) => match protocol::decode_server_event(&text) {
                    Ok(event) => {
                        if tx.send(TransportEvent::Event(event)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Skipping undecodable inbound envelope");
                    }
                },
                Some(Ok(Message::Binary(bytes))) => {
                    debug!(len = bytes.len(), "Ignoring binary frame");
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame.map(|f| f.reason.to_string());
                    let _ = tx.send(TransportEvent::Closed { reason });
                    break;
                }
                Some(Ok(_)) => {
                    // Ping/Pong answered by the library.
                }
                Some(Err(e)) => {
                    let _ = tx.send(TransportEvent::Closed {
                        reason: Some(e.to_string()),
                    });
                    break;
                }
                None => {
                    let _ = tx.send(TransportEvent::Closed { reason: None });
                    break;
                }
            }
        }
        debug!("Transport reader task exited");
    });
}
