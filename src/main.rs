//! # Voice Client Demo
//!
//! Terminal harness for manual testing: loads configuration, starts a
//! session, connects, begins listening, prints transcript fragments as they
//! stream in, and plays assistant audio through the default output device.
//! Ctrl+C disconnects cleanly.

use assistant_voice_client::audio::playback::{AudioPayload, PlaybackEngine};
use assistant_voice_client::config::VoiceConfig;
use assistant_voice_client::session::{self, SessionEvent, SessionState};
use std::io::Write;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Initialize structured logging. RUST_LOG overrides the default filter.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("assistant_voice_client=debug,info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = VoiceConfig::load()?;
    config.validate()?;
    info!(
        transport = config.endpoint.transport.as_str(),
        configured = config.is_configured(),
        "Starting voice client"
    );

    // Playback stays on the main thread; the output stream is tied to the
    // thread that opened it.
    let mut playback = match PlaybackEngine::new(&config.audio) {
        Ok(engine) => Some(engine),
        Err(e) => {
            warn!(error = %e, "No audio output available, transcripts only");
            None
        }
    };

    let (client, mut events) = session::spawn(config);
    client.connect();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    SessionEvent::Connected => {
                        info!("Connected; starting to listen");
                        client.start_listening();
                    }
                    SessionEvent::StateChanged(state) => {
                        info!(state = state.as_str(), "Session state changed");
                        if state == SessionState::Error {
                            break;
                        }
                    }
                    SessionEvent::TranscriptDelta(delta) => {
                        print!("{}", delta);
                        let _ = std::io::stdout().flush();
                    }
                    SessionEvent::MessageAdded(message) => {
                        println!();
                        info!(role = ?message.role, chars = message.content.len(), "Turn completed");
                    }
                    SessionEvent::AssistantAudio(bytes) => {
                        if let Some(engine) = playback.as_mut() {
                            if let Err(e) = engine.play(Some(AudioPayload::Bytes(bytes))) {
                                warn!(error = %e, "Playback failed");
                            }
                        }
                    }
                    SessionEvent::ReconnectScheduled { attempt, delay } => {
                        warn!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting");
                    }
                    SessionEvent::Error(e) => {
                        error!(error = %e, "Session error");
                    }
                    SessionEvent::Disconnected => {
                        info!("Disconnected");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                client.disconnect();
                client.shutdown();
                break;
            }
        }
    }

    info!("Voice client exited");
    Ok(())
}
