//! # Session State Machine
//!
//! The heart of the client: one event-loop task owns every piece of mutable
//! session state and is the only writer. Commands from the public handle,
//! inbound transport events, captured audio frames and reconnect timer
//! wakeups all funnel into the same `select!` loop, so no mutation ever
//! races another.
//!
//! ## Lifecycle:
//! `Idle → Connecting → Connected → {Listening, Speaking} → Disconnecting →
//! Disconnected`, with `Reconnecting` while a retry is pending and `Error`
//! when retries are refused or exhausted.
//!
//! ## Connection Rules:
//! - Every connect runs the health precheck first; `not_configured` and
//!   `unavailable` results disable automatic reconnection entirely
//! - Transport open failures feed the backoff policy; a single timer slot
//!   holds at most one pending retry
//! - At most one transport is live; the old one is closed before a
//!   replacement is opened

use crate::audio::capture::{start_capture, CaptureHandle};
use crate::audio::frame::AudioFrame;
use crate::audio::vad::{VadDecision, VoiceActivityDetector};
use crate::config::{TransportKind, VoiceConfig};
use crate::error::{VoiceError, VoiceResult};
use crate::fanout::CollaboratorClient;
use crate::health::{HealthProbe, HealthStatus, HttpHealthProbe};
use crate::message::Message;
use crate::protocol::{self, ServerEvent};
use crate::reconnect::{ReconnectPolicy, ReconnectState};
use crate::timer::TimerSlot;
use crate::transport::{DefaultTransportFactory, Transport, TransportEvent, TransportFactory};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    /// Connected with the microphone live
    Listening,
    /// Connected with assistant audio streaming in
    Speaking,
    /// A retry is scheduled or in flight
    Reconnecting,
    Disconnecting,
    Disconnected,
    /// Fatal or exhausted failure; no retry pending
    Error,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Listening => "listening",
            SessionState::Speaking => "speaking",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Disconnecting => "disconnecting",
            SessionState::Disconnected => "disconnected",
            SessionState::Error => "error",
        }
    }

    /// States with a live transport.
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            SessionState::Connected | SessionState::Listening | SessionState::Speaking
        )
    }
}

/// Point-in-time view published over a watch channel so UIs can render
/// state and retry progress without querying the loop.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub session_id: Option<String>,
    pub transport: Option<TransportKind>,
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
    pub last_health: Option<HealthStatus>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            session_id: None,
            transport: None,
            reconnect_attempts: 0,
            last_error: None,
            last_health: None,
        }
    }
}

/// Notifications pushed to the consumer of the client.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    StateChanged(SessionState),
    /// A completed conversation turn was appended to the log
    MessageAdded(Message),
    /// One streaming transcript fragment
    TranscriptDelta(String),
    /// Raw PCM16 assistant audio, ready for the playback engine
    AssistantAudio(Vec<u8>),
    Error(VoiceError),
    ReconnectScheduled { attempt: u32, delay: Duration },
}

/// Requests from the public handle into the loop.
#[derive(Debug)]
enum SessionCommand {
    Connect,
    Disconnect,
    StartListening,
    StopListening,
    SendText(String),
    ForceReconnect,
    CancelReconnect,
    ResetReconnectAttempts,
    Shutdown,
}

/// Wakeups the loop schedules for itself.
#[derive(Debug)]
enum InternalEvent {
    ReconnectTimerFired,
}

/// Public handle to a running session. Cheap to clone; all methods are
/// non-blocking sends into the loop.
#[derive(Clone)]
pub struct VoiceClient {
    commands: UnboundedSender<SessionCommand>,
    snapshot_rx: watch::Receiver<SessionSnapshot>,
}

impl VoiceClient {
    pub fn connect(&self) {
        let _ = self.commands.send(SessionCommand::Connect);
    }

    pub fn disconnect(&self) {
        let _ = self.commands.send(SessionCommand::Disconnect);
    }

    pub fn start_listening(&self) {
        let _ = self.commands.send(SessionCommand::StartListening);
    }

    pub fn stop_listening(&self) {
        let _ = self.commands.send(SessionCommand::StopListening);
    }

    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self.commands.send(SessionCommand::SendText(text.into()));
    }

    /// Tear down the current connection and dial again immediately.
    pub fn force_reconnect(&self) {
        let _ = self.commands.send(SessionCommand::ForceReconnect);
    }

    /// Drop any pending retry and stop reconnecting until the next connect.
    pub fn cancel_reconnect(&self) {
        let _ = self.commands.send(SessionCommand::CancelReconnect);
    }

    pub fn reset_reconnect_attempts(&self) {
        let _ = self.commands.send(SessionCommand::ResetReconnectAttempts);
    }

    /// Stop the session loop entirely.
    pub fn shutdown(&self) {
        let _ = self.commands.send(SessionCommand::Shutdown);
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Subscribe to snapshot changes.
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_rx.clone()
    }
}

/// Start a session with the production health probe and transport factory.
pub fn spawn(config: VoiceConfig) -> (VoiceClient, UnboundedReceiver<SessionEvent>) {
    let probe = Arc::new(HttpHealthProbe::new(&config));
    spawn_with(config, probe, Arc::new(DefaultTransportFactory))
}

/// Start a session with injected collaborators. This is the seam scenario
/// tests use to run the full loop without any network or audio hardware.
pub fn spawn_with(
    config: VoiceConfig,
    probe: Arc<dyn HealthProbe>,
    factory: Arc<dyn TransportFactory>,
) -> (VoiceClient, UnboundedReceiver<SessionEvent>) {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());
    let (internal_tx, internal_rx) = mpsc::unbounded_channel();

    let ctx = SessionContext {
        policy: ReconnectPolicy::new(config.reconnect.clone()),
        vad: VoiceActivityDetector::new(config.vad.clone()),
        fanout: CollaboratorClient::new(config.collaborators.clone()),
        config,
        probe,
        factory,
        state: SessionState::Idle,
        session_id: None,
        transport: None,
        transport_events: None,
        capture: None,
        frames_rx: None,
        reconnect: ReconnectState::new(),
        timer: TimerSlot::new(),
        internal_tx,
        transcript: String::new(),
        messages: Vec::new(),
        last_error: None,
        last_health: None,
        events_tx,
        snapshot_tx,
    };

    tokio::spawn(run_session(ctx, commands_rx, internal_rx));

    (
        VoiceClient {
            commands: commands_tx,
            snapshot_rx,
        },
        events_rx,
    )
}

/// Everything the loop owns. Threaded explicitly through every handler so
/// there is no ambient mutable state anywhere in the session.
struct SessionContext {
    config: VoiceConfig,
    probe: Arc<dyn HealthProbe>,
    factory: Arc<dyn TransportFactory>,
    policy: ReconnectPolicy,

    state: SessionState,
    session_id: Option<String>,

    transport: Option<Box<dyn Transport>>,
    transport_events: Option<UnboundedReceiver<TransportEvent>>,

    capture: Option<CaptureHandle>,
    frames_rx: Option<UnboundedReceiver<AudioFrame>>,
    vad: VoiceActivityDetector,

    reconnect: ReconnectState,
    timer: TimerSlot,
    internal_tx: UnboundedSender<InternalEvent>,

    /// Streaming transcript of the in-flight assistant turn
    transcript: String,
    /// Completed turns, insertion-ordered, never mutated after append
    messages: Vec<Message>,

    last_error: Option<String>,
    last_health: Option<HealthStatus>,

    fanout: CollaboratorClient,
    events_tx: UnboundedSender<SessionEvent>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
}

/// One loop iteration's reason for waking.
enum Wake {
    Command(Option<SessionCommand>),
    Transport(Option<TransportEvent>),
    Frame(Option<AudioFrame>),
    Internal(Option<InternalEvent>),
}

async fn next_transport_event(
    rx: &mut Option<UnboundedReceiver<TransportEvent>>,
) -> Option<TransportEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_frame(rx: &mut Option<UnboundedReceiver<AudioFrame>>) -> Option<AudioFrame> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn run_session(
    mut ctx: SessionContext,
    mut commands_rx: UnboundedReceiver<SessionCommand>,
    mut internal_rx: UnboundedReceiver<InternalEvent>,
) {
    info!("Session loop started");

    loop {
        let wake = tokio::select! {
            cmd = commands_rx.recv() => Wake::Command(cmd),
            event = next_transport_event(&mut ctx.transport_events) => Wake::Transport(event),
            frame = next_frame(&mut ctx.frames_rx) => Wake::Frame(frame),
            internal = internal_rx.recv() => Wake::Internal(internal),
        };

        match wake {
            Wake::Command(None) => {
                // Every handle dropped; shut down.
                ctx.disconnect().await;
                break;
            }
            Wake::Command(Some(SessionCommand::Shutdown)) => {
                ctx.disconnect().await;
                break;
            }
            Wake::Command(Some(command)) => ctx.handle_command(command).await,
            Wake::Transport(Some(event)) => ctx.handle_transport_event(event).await,
            Wake::Transport(None) => {
                // Reader task gone without a close frame; treat as closed.
                ctx.transport_events = None;
                ctx.handle_closed(None).await;
            }
            Wake::Frame(Some(frame)) => ctx.handle_frame(frame).await,
            Wake::Frame(None) => {
                ctx.frames_rx = None;
            }
            Wake::Internal(Some(InternalEvent::ReconnectTimerFired)) => {
                if ctx.state == SessionState::Reconnecting && ctx.reconnect.auto_reconnect {
                    debug!(attempt = ctx.reconnect.attempts + 1, "Reconnect timer fired");
                    ctx.connect().await;
                }
            }
            Wake::Internal(None) => {}
        }
    }

    info!("Session loop stopped");
}

impl SessionContext {
    async fn handle_command(&mut self, command: SessionCommand) {
        debug!(command = ?command, state = self.state.as_str(), "Handling command");
        match command {
            SessionCommand::Connect => {
                // A user-initiated connect starts a fresh attempt budget.
                self.timer.cancel();
                self.reconnect.reset();
                self.connect().await;
            }
            SessionCommand::Disconnect => self.disconnect().await,
            SessionCommand::StartListening => self.start_listening().await,
            SessionCommand::StopListening => self.stop_listening().await,
            SessionCommand::SendText(text) => self.send_text(text).await,
            SessionCommand::ForceReconnect => {
                self.timer.cancel();
                self.close_transport().await;
                self.reconnect.reset();
                self.connect().await;
            }
            SessionCommand::CancelReconnect => {
                self.timer.cancel();
                self.reconnect.auto_reconnect = false;
                self.reconnect.next_delay = None;
                if self.state == SessionState::Reconnecting {
                    self.set_state(SessionState::Disconnected);
                    self.emit(SessionEvent::Disconnected);
                }
            }
            SessionCommand::ResetReconnectAttempts => {
                self.reconnect.attempts = 0;
                self.publish_snapshot();
            }
            SessionCommand::Shutdown => unreachable!("handled by the loop"),
        }
    }

    /// Run the health precheck and open a transport.
    async fn connect(&mut self) {
        if self.state.is_connected() || self.state == SessionState::Connecting {
            debug!(state = self.state.as_str(), "connect() ignored in current state");
            return;
        }

        self.set_state(SessionState::Connecting);

        let health = self.probe.check().await;
        self.last_health = Some(health.status);

        match health.status {
            HealthStatus::NotConfigured => {
                // Retrying cannot help until the deployment is fixed.
                self.reconnect.auto_reconnect = false;
                self.fail(VoiceError::Configuration(
                    "voice service is not_configured: no endpoint URL".to_string(),
                ));
                return;
            }
            HealthStatus::Unavailable => {
                self.reconnect.auto_reconnect = false;
                let detail = health
                    .error
                    .unwrap_or_else(|| "service unavailable".to_string());
                self.fail(VoiceError::HealthCheck(format!(
                    "voice service unavailable: {}",
                    detail
                )));
                return;
            }
            HealthStatus::Available => {}
        }

        // Single-active-transport invariant: close before reopening.
        self.close_transport().await;

        match self.factory.open(&self.config).await {
            Ok((transport, events)) => {
                info!(transport = transport.kind().as_str(), "Transport connected");
                self.transport = Some(transport);
                self.transport_events = Some(events);
                self.reconnect.reset();
                self.last_error = None;
                self.set_state(SessionState::Connected);
                self.emit(SessionEvent::Connected);
            }
            Err(e) => {
                warn!(error = %e, "Transport open failed");
                self.schedule_reconnect(e).await;
            }
        }
    }

    /// Record a connection failure and either arm the retry timer or give
    /// up with a terminal error.
    async fn schedule_reconnect(&mut self, cause: VoiceError) {
        self.reconnect.attempts += 1;
        let attempts = self.reconnect.attempts;

        if !self.reconnect.auto_reconnect || !self.policy.should_retry(&cause, attempts) {
            let message = if cause.is_retriable() {
                format!(
                    "connection failed after {} attempts: {}",
                    attempts,
                    cause.message()
                )
            } else {
                cause.to_string()
            };
            error!(attempts, error = %cause, "Giving up on reconnection");
            self.fail(VoiceError::Connection(message));
            return;
        }

        let delay = self.policy.next_delay(attempts);
        self.reconnect.next_delay = Some(delay);
        info!(
            attempt = attempts + 1,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect attempt"
        );

        self.timer.arm(
            delay,
            self.internal_tx.clone(),
            InternalEvent::ReconnectTimerFired,
        );
        self.last_error = Some(cause.to_string());
        self.set_state(SessionState::Reconnecting);
        self.emit(SessionEvent::ReconnectScheduled {
            attempt: attempts + 1,
            delay,
        });
    }

    /// Orderly teardown: cancel timers, stop capture, close the transport.
    async fn disconnect(&mut self) {
        if matches!(
            self.state,
            SessionState::Idle | SessionState::Disconnected | SessionState::Disconnecting
        ) {
            debug!("disconnect() is a no-op in state {}", self.state.as_str());
            return;
        }

        self.set_state(SessionState::Disconnecting);
        self.timer.cancel();
        self.reconnect.auto_reconnect = false;
        self.reconnect.next_delay = None;

        self.stop_capture();
        self.close_transport().await;
        self.vad.reset();
        self.transcript.clear();
        self.session_id = None;

        self.set_state(SessionState::Disconnected);
        self.emit(SessionEvent::Disconnected);
    }

    async fn close_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                debug!(error = %e, "Transport close reported an error");
            }
        }
        self.transport_events = None;
    }

    fn stop_capture(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        self.frames_rx = None;
    }

    /// Open the microphone and enter `Listening`.
    async fn start_listening(&mut self) {
        if !self.state.is_connected() {
            warn!(state = self.state.as_str(), "start_listening ignored: not connected");
            return;
        }
        if self.state == SessionState::Listening {
            return;
        }

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        match start_capture(&self.config.audio, frames_tx) {
            Ok(handle) => {
                self.capture = Some(handle);
                self.frames_rx = Some(frames_rx);
                self.vad.reset();
                if let Some(transport) = self.transport.as_mut() {
                    transport.set_muted(false).await;
                }
                self.set_state(SessionState::Listening);
            }
            Err(e) => {
                // Media failures are user-actionable; never fed to the
                // reconnect policy and the connection stays up.
                error!(error = %e, "Microphone capture failed to start");
                self.last_error = Some(e.to_string());
                self.publish_snapshot();
                self.emit(SessionEvent::Error(e));
            }
        }
    }

    /// Stop the microphone, flush the tail, and commit the audio turn.
    async fn stop_listening(&mut self) {
        if self.capture.is_none() && self.state != SessionState::Listening {
            return;
        }

        self.stop_capture_and_flush().await;

        if let Some(transport) = self.transport.as_mut() {
            transport.set_muted(true).await;
            if let Err(e) = transport.commit_audio().await {
                warn!(error = %e, "Audio commit failed");
            }
        }

        if self.state == SessionState::Listening {
            self.set_state(SessionState::Connected);
        }
    }

    /// Stop capture and ship whatever frames are still queued, so the tail
    /// of the utterance reaches the service before the commit.
    async fn stop_capture_and_flush(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        if let Some(mut frames_rx) = self.frames_rx.take() {
            while let Ok(frame) = frames_rx.try_recv() {
                self.send_frame(&frame).await;
            }
        }
    }

    async fn send_frame(&mut self, frame: &AudioFrame) {
        if let Some(transport) = self.transport.as_mut() {
            if let Err(e) = transport.send_audio_frame(&frame.to_le_bytes()).await {
                // The reader task will surface the closure; just log here.
                warn!(error = %e, sequence = frame.sequence, "Audio frame send failed");
            }
        }
    }

    /// Send a user text turn.
    async fn send_text(&mut self, text: String) {
        if !self.state.is_connected() {
            warn!(state = self.state.as_str(), "send_text ignored: not connected");
            return;
        }
        let Some(transport) = self.transport.as_mut() else {
            return;
        };

        // A new turn starts; any stale streaming transcript is discarded.
        self.transcript.clear();

        match transport.send_text(&text).await {
            Ok(()) => {
                let message = Message::user(text.clone());
                self.fanout.persist_message(&message);
                self.fanout.text_input_event(&text);
                self.messages.push(message.clone());
                self.emit(SessionEvent::MessageAdded(message));
            }
            Err(e) => {
                warn!(error = %e, "Text send failed");
                self.emit(SessionEvent::Error(e));
            }
        }
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Event(event) => self.handle_server_event(event).await,
            TransportEvent::Closed { reason } => self.handle_closed(reason).await,
        }
    }

    async fn handle_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::SessionCreated { session } | ServerEvent::SessionUpdated { session } => {
                if let Some(id) = session.and_then(|s| s.id) {
                    debug!(session_id = %id, "Session acknowledged");
                    self.session_id = Some(id);
                    self.publish_snapshot();
                }
            }
            ServerEvent::SpeechStarted => debug!("Service detected speech start"),
            ServerEvent::SpeechStopped => debug!("Service detected speech stop"),
            ServerEvent::AudioTranscriptDelta { delta }
            | ServerEvent::OutputTextDelta { delta } => {
                self.transcript.push_str(&delta);
                self.emit(SessionEvent::TranscriptDelta(delta));
            }
            ServerEvent::AudioDelta { delta } => match protocol::decode_audio_payload(&delta) {
                Ok(bytes) => {
                    if self.state == SessionState::Connected {
                        self.set_state(SessionState::Speaking);
                    }
                    self.emit(SessionEvent::AssistantAudio(bytes));
                }
                Err(e) => warn!(error = %e, "Dropping undecodable audio delta"),
            },
            ServerEvent::ResponseDone | ServerEvent::ResponseCompleted => {
                self.finish_assistant_turn();
                if self.state == SessionState::Speaking {
                    self.set_state(SessionState::Connected);
                }
            }
            ServerEvent::ConversationItemCreated { item } => {
                if let Some(transcript) = item.and_then(|i| i.user_transcript()) {
                    let message = Message::user(transcript);
                    self.fanout.persist_message(&message);
                    self.messages.push(message.clone());
                    self.emit(SessionEvent::MessageAdded(message));
                }
            }
            ServerEvent::ErrorEvent { error } => {
                warn!(message = %error.message, "Service reported an error");
                let e = VoiceError::Protocol(error.message);
                self.last_error = Some(e.to_string());
                self.publish_snapshot();
                self.emit(SessionEvent::Error(e));
            }
            ServerEvent::Unknown => debug!("Ignoring unknown inbound envelope"),
        }
    }

    /// Flush the accumulated streaming transcript into a completed
    /// assistant message. Empty transcripts (audio-only turns with no
    /// transcript enabled) produce no message.
    fn finish_assistant_turn(&mut self) {
        if self.transcript.is_empty() {
            return;
        }
        let transcript = std::mem::take(&mut self.transcript);
        let message = Message::assistant(transcript.clone(), None);
        self.fanout.persist_message(&message);
        self.fanout.transcript_event(&transcript);
        self.messages.push(message.clone());
        self.emit(SessionEvent::MessageAdded(message));
    }

    /// The transport ended underneath us.
    async fn handle_closed(&mut self, reason: Option<String>) {
        if matches!(
            self.state,
            SessionState::Idle
                | SessionState::Disconnecting
                | SessionState::Disconnected
                | SessionState::Error
        ) {
            return;
        }

        let detail = reason.unwrap_or_else(|| "connection closed".to_string());
        warn!(reason = %detail, "Transport closed unexpectedly");

        self.stop_capture();
        self.transport = None;
        self.transport_events = None;

        if self.reconnect.auto_reconnect {
            self.schedule_reconnect(VoiceError::Connection(detail)).await;
        } else {
            self.set_state(SessionState::Disconnected);
            self.emit(SessionEvent::Disconnected);
        }
    }

    /// One captured frame: feed the detector, ship it, stop on silence.
    async fn handle_frame(&mut self, frame: AudioFrame) {
        if self.state != SessionState::Listening {
            return;
        }

        let decision = self.vad.process_frame(&frame.samples, frame.captured_at);
        self.send_frame(&frame).await;

        if decision == VadDecision::Stop {
            info!("Silence timeout reached; ending the listening turn");
            self.stop_listening().await;
        }
    }

    /// Enter a terminal error state with no retry pending.
    fn fail(&mut self, error: VoiceError) {
        error!(error = %error, "Session entered error state");
        self.timer.cancel();
        self.reconnect.next_delay = None;
        self.last_error = Some(error.to_string());
        self.set_state(SessionState::Error);
        self.emit(SessionEvent::Error(error));
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        debug!(from = self.state.as_str(), to = state.as_str(), "State transition");
        self.state = state;
        self.publish_snapshot();
        self.emit(SessionEvent::StateChanged(state));
    }

    fn publish_snapshot(&self) {
        let _ = self.snapshot_tx.send(SessionSnapshot {
            state: self.state,
            session_id: self.session_id.clone(),
            transport: self.transport.as_ref().map(|t| t.kind()),
            reconnect_attempts: self.reconnect.attempts,
            last_error: self.last_error.clone(),
            last_health: self.last_health,
        });
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconnectConfig;
    use crate::health::HealthSnapshot;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;

    struct StaticProbe(HealthStatus);

    #[async_trait]
    impl HealthProbe for StaticProbe {
        async fn check(&self) -> HealthSnapshot {
            match self.0 {
                HealthStatus::Available => HealthSnapshot::available(None),
                HealthStatus::Unavailable => HealthSnapshot::unavailable("down for maintenance"),
                HealthStatus::NotConfigured => HealthSnapshot::not_configured(),
            }
        }
    }

    /// Transport that records what was sent and whether it was closed.
    struct MockTransport {
        sent: Arc<Mutex<Vec<String>>>,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send_audio_frame(&mut self, pcm: &[u8]) -> VoiceResult<()> {
            self.sent.lock().unwrap().push(format!("audio:{}", pcm.len()));
            Ok(())
        }

        async fn send_text(&mut self, text: &str) -> VoiceResult<()> {
            self.sent.lock().unwrap().push(format!("text:{}", text));
            Ok(())
        }

        async fn commit_audio(&mut self) -> VoiceResult<()> {
            self.sent.lock().unwrap().push("commit".to_string());
            Ok(())
        }

        async fn close(&mut self) -> VoiceResult<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn kind(&self) -> TransportKind {
            TransportKind::SocketProxy
        }
    }

    /// Factory that either always fails or hands out mock transports while
    /// exposing a side channel for injecting server events.
    struct MockFactory {
        fail: bool,
        opens: AtomicU32,
        sent: Arc<Mutex<Vec<String>>>,
        closed_flags: Mutex<Vec<Arc<AtomicBool>>>,
        event_tx: Mutex<Option<UnboundedSender<TransportEvent>>>,
    }

    impl MockFactory {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                fail,
                opens: AtomicU32::new(0),
                sent: Arc::new(Mutex::new(Vec::new())),
                closed_flags: Mutex::new(Vec::new()),
                event_tx: Mutex::new(None),
            })
        }

        fn inject(&self, event: ServerEvent) {
            let tx = self.event_tx.lock().unwrap();
            tx.as_ref()
                .expect("no open transport")
                .send(TransportEvent::Event(event))
                .unwrap();
        }
    }

    #[async_trait]
    impl TransportFactory for MockFactory {
        async fn open(
            &self,
            _config: &VoiceConfig,
        ) -> VoiceResult<(Box<dyn Transport>, UnboundedReceiver<TransportEvent>)> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(VoiceError::Connection("refused".to_string()));
            }
            let closed = Arc::new(AtomicBool::new(false));
            self.closed_flags.lock().unwrap().push(Arc::clone(&closed));
            let (tx, rx) = mpsc::unbounded_channel();
            *self.event_tx.lock().unwrap() = Some(tx);
            Ok((
                Box::new(MockTransport {
                    sent: Arc::clone(&self.sent),
                    closed,
                }),
                rx,
            ))
        }
    }

    fn test_config() -> VoiceConfig {
        let mut config = VoiceConfig::default();
        config.endpoint.url = Some("wss://voice.test.invalid".to_string());
        config.reconnect = ReconnectConfig {
            max_attempts: 5,
            base_delay_ms: 1,
            max_delay_ms: 4,
            jitter_ms: 0,
        };
        config
    }

    async fn wait_for_state(rx: &mut watch::Receiver<SessionSnapshot>, target: SessionState) {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if rx.borrow().state == target {
                    return;
                }
                rx.changed().await.expect("session loop ended early");
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for state {:?}", target));
    }

    #[tokio::test]
    async fn test_healthy_connect_reaches_connected() {
        let factory = MockFactory::new(false);
        let (client, _events) = spawn_with(
            test_config(),
            Arc::new(StaticProbe(HealthStatus::Available)),
            factory.clone(),
        );

        client.connect();
        let mut watch = client.watch();
        wait_for_state(&mut watch, SessionState::Connected).await;

        let snapshot = client.snapshot();
        assert_eq!(snapshot.reconnect_attempts, 0);
        assert_eq!(snapshot.last_health, Some(HealthStatus::Available));
        assert!(snapshot.last_error.is_none());
        assert_eq!(factory.opens.load(Ordering::SeqCst), 1);

        client.shutdown();
    }

    #[tokio::test]
    async fn test_not_configured_is_terminal_without_retries() {
        let factory = MockFactory::new(false);
        let (client, mut events) = spawn_with(
            test_config(),
            Arc::new(StaticProbe(HealthStatus::NotConfigured)),
            factory.clone(),
        );

        client.connect();
        let mut watch = client.watch();
        wait_for_state(&mut watch, SessionState::Error).await;

        let snapshot = client.snapshot();
        assert!(snapshot.last_error.unwrap().contains("not_configured"));
        assert_eq!(snapshot.last_health, Some(HealthStatus::NotConfigured));
        // No transport was ever dialed and no retry was scheduled.
        assert_eq!(factory.opens.load(Ordering::SeqCst), 0);
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, SessionEvent::ReconnectScheduled { .. }));
        }

        // Connecting again is allowed and lands in the same place.
        client.connect();
        wait_for_state(&mut watch, SessionState::Error).await;
        assert_eq!(factory.opens.load(Ordering::SeqCst), 0);

        client.shutdown();
    }

    #[tokio::test]
    async fn test_failing_transport_exhausts_attempts_then_errors() {
        let factory = MockFactory::new(true);
        let (client, mut events) = spawn_with(
            test_config(),
            Arc::new(StaticProbe(HealthStatus::Available)),
            factory.clone(),
        );

        client.connect();
        let mut watch = client.watch();
        wait_for_state(&mut watch, SessionState::Error).await;

        let snapshot = client.snapshot();
        assert_eq!(snapshot.reconnect_attempts, 5);
        assert!(snapshot.last_error.unwrap().contains("after 5 attempts"));
        assert_eq!(factory.opens.load(Ordering::SeqCst), 5);

        // 5 failures means 4 scheduled retries before giving up.
        let mut scheduled = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::ReconnectScheduled { attempt, .. } = event {
                scheduled.push(attempt);
            }
        }
        assert_eq!(scheduled, vec![2, 3, 4, 5]);

        client.shutdown();
    }

    #[tokio::test]
    async fn test_text_turn_accumulates_deltas_into_one_message() {
        let factory = MockFactory::new(false);
        let (client, mut events) = spawn_with(
            test_config(),
            Arc::new(StaticProbe(HealthStatus::Available)),
            factory.clone(),
        );

        client.connect();
        let mut watch = client.watch();
        wait_for_state(&mut watch, SessionState::Connected).await;

        client.send_text("hello");

        // Wait for the user message so the send has been processed.
        let user = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(SessionEvent::MessageAdded(m)) = events.recv().await {
                    return m;
                }
            }
        })
        .await
        .expect("user message never arrived");
        assert_eq!(user.content, "hello");
        assert!(factory
            .sent
            .lock()
            .unwrap()
            .contains(&"text:hello".to_string()));

        for delta in ["Hi", " there", "!"] {
            factory.inject(ServerEvent::AudioTranscriptDelta {
                delta: delta.to_string(),
            });
        }
        factory.inject(ServerEvent::ResponseDone);

        let assistant = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(SessionEvent::MessageAdded(m)) = events.recv().await {
                    return m;
                }
            }
        })
        .await
        .expect("assistant message never arrived");
        assert_eq!(assistant.content, "Hi there!");

        // A second completion without new deltas adds nothing.
        factory.inject(ServerEvent::ResponseCompleted);
        tokio::time::sleep(Duration::from_millis(50)).await;
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, SessionEvent::MessageAdded(_)));
        }

        client.shutdown();
    }

    #[tokio::test]
    async fn test_force_reconnect_closes_old_transport_first() {
        let factory = MockFactory::new(false);
        let (client, _events) = spawn_with(
            test_config(),
            Arc::new(StaticProbe(HealthStatus::Available)),
            factory.clone(),
        );

        client.connect();
        let mut watch = client.watch();
        wait_for_state(&mut watch, SessionState::Connected).await;

        client.force_reconnect();
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if factory.opens.load(Ordering::SeqCst) == 2 {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("second transport never opened");
        wait_for_state(&mut watch, SessionState::Connected).await;

        let flags = factory.closed_flags.lock().unwrap();
        assert_eq!(flags.len(), 2);
        assert!(flags[0].load(Ordering::SeqCst), "old transport not closed");
        assert!(!flags[1].load(Ordering::SeqCst), "new transport closed");

        client.shutdown();
    }

    #[tokio::test]
    async fn test_disconnect_is_orderly_and_idempotent() {
        let factory = MockFactory::new(false);
        let (client, _events) = spawn_with(
            test_config(),
            Arc::new(StaticProbe(HealthStatus::Available)),
            factory.clone(),
        );

        client.connect();
        let mut watch = client.watch();
        wait_for_state(&mut watch, SessionState::Connected).await;

        client.disconnect();
        wait_for_state(&mut watch, SessionState::Disconnected).await;
        assert!(factory.closed_flags.lock().unwrap()[0].load(Ordering::SeqCst));

        // Repeat disconnects are harmless.
        client.disconnect();
        client.disconnect();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(client.snapshot().state, SessionState::Disconnected);

        client.shutdown();
    }

    #[tokio::test]
    async fn test_unexpected_close_triggers_reconnect() {
        let factory = MockFactory::new(false);
        let (client, mut events) = spawn_with(
            test_config(),
            Arc::new(StaticProbe(HealthStatus::Available)),
            factory.clone(),
        );

        client.connect();
        let mut watch = client.watch();
        wait_for_state(&mut watch, SessionState::Connected).await;

        // Kill the connection from the transport side.
        {
            let tx = factory.event_tx.lock().unwrap();
            tx.as_ref()
                .unwrap()
                .send(TransportEvent::Closed {
                    reason: Some("proxy restarted".to_string()),
                })
                .unwrap();
        }

        // The session schedules a retry and comes back up.
        tokio::time::timeout(Duration::from_secs(2), async {
            while factory.opens.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("reconnect never dialed");
        wait_for_state(&mut watch, SessionState::Connected).await;

        let mut saw_schedule = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SessionEvent::ReconnectScheduled { .. }) {
                saw_schedule = true;
            }
        }
        assert!(saw_schedule);

        client.shutdown();
    }

    #[tokio::test]
    async fn test_cancel_reconnect_stops_retrying() {
        let factory = MockFactory::new(true);
        let mut config = test_config();
        // Long delays so the cancel lands while a retry is pending.
        config.reconnect.base_delay_ms = 60_000;
        config.reconnect.max_delay_ms = 60_000;

        let (client, _events) = spawn_with(
            config,
            Arc::new(StaticProbe(HealthStatus::Available)),
            factory.clone(),
        );

        client.connect();
        let mut watch = client.watch();
        wait_for_state(&mut watch, SessionState::Reconnecting).await;
        assert_eq!(factory.opens.load(Ordering::SeqCst), 1);

        client.cancel_reconnect();
        wait_for_state(&mut watch, SessionState::Disconnected).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(factory.opens.load(Ordering::SeqCst), 1, "retry ran after cancel");

        client.shutdown();
    }
}
