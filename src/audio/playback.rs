//! # Audio Playback Engine
//!
//! Plays assistant audio through the default output device via rodio.
//!
//! ## Playback Contract:
//! - A payload is fully decoded before any sound starts; undecodable audio
//!   is rejected with a load error and never produces partial output
//! - Position polling runs every 100 ms while playing and tears itself down
//!   on pause/stop/end
//! - All device resources are released when the engine is dropped
//!
//! Payloads are either container formats rodio can decode (wav/mp3/ogg) or
//! raw mono little-endian PCM16 at the configured rate.

use crate::audio::frame;
use crate::config::AudioConfig;
use crate::error::{VoiceError, VoiceResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rodio::buffer::SamplesBuffer;
use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink, Source};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Audio handed to [`PlaybackEngine::play`].
#[derive(Debug, Clone)]
pub enum AudioPayload {
    /// Base64 text, optionally with a `data:...;base64,` prefix
    Base64(String),
    /// Raw bytes straight off the wire
    Bytes(Vec<u8>),
}

/// Observable playback state, mirrored for UI consumption.
#[derive(Debug, Clone)]
pub struct PlaybackState {
    pub is_playing: bool,
    pub is_loading: bool,
    /// Total duration of the loaded clip, when known
    pub duration: Option<Duration>,
    pub current_time: Duration,
    pub volume: f32,
    /// Last load or device failure, cleared on the next successful play
    pub error: Option<String>,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            is_playing: false,
            is_loading: false,
            duration: None,
            current_time: Duration::ZERO,
            volume: 1.0,
            error: None,
        }
    }
}

/// Playback engine bound to the default output device.
///
/// Not `Send`: the underlying output stream is tied to the thread that
/// opened it. Keep the engine on the thread (or LocalSet task) that created
/// it; the shared [`PlaybackState`] is what crosses threads.
pub struct PlaybackEngine {
    _stream: OutputStream,
    handle: OutputStreamHandle,
    sink: Arc<Sink>,
    state: Arc<Mutex<PlaybackState>>,
    sample_rate: u32,
    poller_active: Arc<AtomicBool>,
}

impl PlaybackEngine {
    /// Open the default output device.
    pub fn new(config: &AudioConfig) -> VoiceResult<Self> {
        let (stream, handle) = OutputStream::try_default()
            .map_err(|e| VoiceError::Playback(format!("no output device: {}", e)))?;
        let sink = Sink::try_new(&handle)
            .map_err(|e| VoiceError::Playback(format!("failed to create sink: {}", e)))?;

        Ok(Self {
            _stream: stream,
            handle,
            sink: Arc::new(sink),
            state: Arc::new(Mutex::new(PlaybackState::default())),
            sample_rate: config.sample_rate,
            poller_active: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Current observable state.
    pub fn state(&self) -> PlaybackState {
        self.state.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Shared handle to the state, for UI layers that poll from elsewhere.
    pub fn state_handle(&self) -> Arc<Mutex<PlaybackState>> {
        Arc::clone(&self.state)
    }

    /// Load and play a payload, replacing whatever is queued.
    ///
    /// `None` and empty payloads are ignored. The payload is decoded in full
    /// before playback starts; failures set the state error and return it.
    pub fn play(&mut self, payload: Option<AudioPayload>) -> VoiceResult<()> {
        let Some(payload) = payload else {
            debug!("play() called with no payload, ignoring");
            return Ok(());
        };

        self.with_state(|s| {
            s.is_loading = true;
            s.error = None;
        });

        let bytes = match payload {
            AudioPayload::Bytes(bytes) => bytes,
            AudioPayload::Base64(text) => {
                // Strip a data-URL prefix if present.
                let encoded = text.rsplit(',').next().unwrap_or(&text);
                match BASE64.decode(encoded.trim()) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        return Err(self.fail_load(format!("invalid base64 audio: {}", e)));
                    }
                }
            }
        };

        if bytes.is_empty() {
            self.with_state(|s| s.is_loading = false);
            return Ok(());
        }

        let (source, duration) = match self.decode(bytes) {
            Ok(decoded) => decoded,
            Err(e) => return Err(self.fail_load(e.to_string())),
        };

        // A stopped sink stays unusable on some backends; replace it.
        self.sink.stop();
        let sink = match Sink::try_new(&self.handle) {
            Ok(sink) => Arc::new(sink),
            Err(e) => return Err(self.fail_load(format!("failed to reopen sink: {}", e))),
        };
        sink.set_volume(self.state().volume);
        sink.append(source);
        self.sink = Arc::clone(&sink);

        self.with_state(|s| {
            s.is_loading = false;
            s.is_playing = true;
            s.duration = duration;
            s.current_time = Duration::ZERO;
        });

        self.spawn_poller();
        Ok(())
    }

    /// Pause playback, keeping position.
    pub fn pause(&mut self) {
        self.sink.pause();
        self.poller_active.store(false, Ordering::SeqCst);
        self.with_state(|s| s.is_playing = false);
    }

    /// Resume a paused clip.
    pub fn resume(&mut self) {
        if !self.sink.empty() {
            self.sink.play();
            self.with_state(|s| s.is_playing = true);
            self.spawn_poller();
        }
    }

    /// Stop playback and discard the queued clip.
    pub fn stop(&mut self) {
        self.sink.stop();
        self.poller_active.store(false, Ordering::SeqCst);
        self.with_state(|s| {
            s.is_playing = false;
            s.current_time = Duration::ZERO;
        });
    }

    /// Set volume in [0, 1].
    pub fn set_volume(&mut self, volume: f32) {
        let volume = volume.clamp(0.0, 1.0);
        self.sink.set_volume(volume);
        self.with_state(|s| s.volume = volume);
    }

    /// Seek to an absolute position in seconds.
    pub fn seek(&mut self, seconds: f64) -> VoiceResult<()> {
        let position = Duration::from_secs_f64(seconds.max(0.0));
        self.sink
            .try_seek(position)
            .map_err(|e| VoiceError::Playback(format!("seek failed: {}", e)))?;
        self.with_state(|s| s.current_time = position);
        Ok(())
    }

    /// Decode the payload completely. Tries container formats first, falls
    /// back to raw mono PCM16 at the configured rate.
    fn decode(
        &self,
        bytes: Vec<u8>,
    ) -> VoiceResult<(Box<dyn Source<Item = i16> + Send>, Option<Duration>)> {
        match Decoder::new(Cursor::new(bytes.clone())) {
            Ok(decoder) => {
                let duration = decoder.total_duration();
                Ok((Box::new(decoder.convert_samples()), duration))
            }
            Err(_) => {
                let samples = frame::le_bytes_to_pcm16(&bytes)
                    .map_err(|e| VoiceError::Playback(format!("undecodable audio: {}", e)))?;
                if samples.is_empty() {
                    return Err(VoiceError::Playback("empty audio payload".to_string()));
                }
                let duration =
                    Duration::from_secs_f64(samples.len() as f64 / self.sample_rate as f64);
                let buffer = SamplesBuffer::new(1, self.sample_rate, samples);
                Ok((Box::new(buffer), Some(duration)))
            }
        }
    }

    fn fail_load(&mut self, message: String) -> VoiceError {
        warn!(error = %message, "Audio load failed");
        self.with_state(|s| {
            s.is_loading = false;
            s.is_playing = false;
            s.error = Some(message.clone());
        });
        VoiceError::Playback(message)
    }

    /// 100 ms position poller. A fresh flag per play() supersedes any
    /// poller from the previous clip.
    fn spawn_poller(&mut self) {
        self.poller_active.store(false, Ordering::SeqCst);
        let active = Arc::new(AtomicBool::new(true));
        self.poller_active = Arc::clone(&active);

        let sink = Arc::clone(&self.sink);
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(100));
            loop {
                ticker.tick().await;
                if !active.load(Ordering::SeqCst) {
                    break;
                }
                if sink.empty() {
                    if let Ok(mut s) = state.lock() {
                        s.is_playing = false;
                        if let Some(duration) = s.duration {
                            s.current_time = duration;
                        }
                    }
                    break;
                }
                if let Ok(mut s) = state.lock() {
                    s.current_time = sink.get_pos();
                }
            }
        });
    }

    fn with_state(&self, f: impl FnOnce(&mut PlaybackState)) {
        if let Ok(mut state) = self.state.lock() {
            f(&mut state);
        }
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.poller_active.store(false, Ordering::SeqCst);
        self.sink.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_base64_prefix_stripping() {
        // The data-URL split logic used by play(): everything after the last comma.
        let text = "data:audio/wav;base64,AAAA";
        assert_eq!(text.rsplit(',').next().unwrap(), "AAAA");
        assert_eq!("AAAA".rsplit(',').next().unwrap(), "AAAA");
    }

    #[test]
    fn test_default_state() {
        let state = PlaybackState::default();
        assert!(!state.is_playing);
        assert!(!state.is_loading);
        assert!(state.duration.is_none());
        assert_eq!(state.current_time, Duration::ZERO);
        assert_eq!(state.volume, 1.0);
        assert!(state.error.is_none());
    }
}
