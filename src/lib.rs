//! # Assistant Voice Client
//!
//! Realtime voice streaming client for a conversational AI service.
//! Captures microphone audio, streams it as PCM16 over a WebSocket
//! transport, receives incremental transcripts and assistant audio, and
//! manages the whole connection lifecycle: health prechecks, capped
//! exponential reconnection, and voice-activity-driven turn taking.
//!
//! ## Architecture:
//! - [`session`]: the single-writer event loop owning all session state
//! - [`health`]: preflight availability probe
//! - [`reconnect`] + [`timer`]: retry policy and the single pending-retry slot
//! - [`transport`]: socket-proxy and peer-session adapters behind one trait
//! - [`audio`]: capture pipeline, voice activity detection, playback
//! - [`protocol`]: the JSON envelope vocabulary on the wire
//!
//! ## Quick Start:
//! ```no_run
//! use assistant_voice_client::{config::VoiceConfig, session};
//!
//! # #[tokio::main] async fn main() -> anyhow::Result<()> {
//! let config = VoiceConfig::load()?;
//! config.validate()?;
//! let (client, mut events) = session::spawn(config);
//! client.connect();
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod fanout;
pub mod health;
pub mod message;
pub mod protocol;
pub mod reconnect;
pub mod session;
pub mod timer;
pub mod transport;

pub use config::VoiceConfig;
pub use error::{VoiceError, VoiceResult};
pub use session::{SessionEvent, SessionSnapshot, SessionState, VoiceClient};
