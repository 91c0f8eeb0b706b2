//! # Message Protocol Codec
//!
//! Serializes and deserializes the JSON envelope vocabulary exchanged with
//! the conversational AI service.
//!
//! ## Message Format:
//! - **Client → Server**: JSON envelopes tagged by `type`; audio travels as
//!   base64-encoded 16-bit little-endian PCM inside
//!   `input_audio_buffer.append`
//! - **Server → Client**: incremental envelopes (partial transcripts, audio
//!   frames, lifecycle events), also tagged by `type`
//!
//! Unknown inbound types decode to [`ServerEvent::Unknown`] so that protocol
//! growth on the server side is never fatal to the client.

use crate::error::{VoiceError, VoiceResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Outbound envelopes produced by the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Handshake sent immediately after the socket-proxy connection opens
    #[serde(rename = "connect_realtime")]
    ConnectRealtime,

    /// Session configuration (modalities, instructions, voice, temperature)
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionUpdate },

    /// One frame of base64-encoded PCM16 audio
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioAppend { audio: String },

    /// End-of-turn marker committing all appended audio
    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioCommit,

    /// A user text turn
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },

    /// Ask the service to start generating a response
    #[serde(rename = "response.create")]
    ResponseCreate,
}

/// Body of the `session.update` envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionUpdate {
    pub modalities: Vec<String>,
    pub instructions: String,
    pub voice: String,
    pub temperature: f32,
}

/// A conversation item carried by `conversation.item.create`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationItem {
    #[serde(rename = "type")]
    pub item_type: String,
    pub role: String,
    pub content: Vec<ContentPart>,
}

/// One content part of a conversation item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub part_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
}

impl ClientEvent {
    /// Build the audio-append envelope from raw little-endian PCM16 bytes.
    pub fn audio_append(pcm_bytes: &[u8]) -> Self {
        ClientEvent::InputAudioAppend {
            audio: BASE64.encode(pcm_bytes),
        }
    }

    /// Build the two envelopes that make up one user text turn:
    /// the item itself followed by a `response.create` trigger.
    pub fn user_turn(text: &str) -> [Self; 2] {
        [
            ClientEvent::ConversationItemCreate {
                item: ConversationItem {
                    item_type: "message".to_string(),
                    role: "user".to_string(),
                    content: vec![ContentPart {
                        part_type: "input_text".to_string(),
                        text: Some(text.to_string()),
                        transcript: None,
                    }],
                },
            },
            ClientEvent::ResponseCreate,
        ]
    }

    /// Build the session configuration envelope from client settings.
    pub fn session_update(config: &crate::config::SessionConfig) -> Self {
        ClientEvent::SessionUpdate {
            session: SessionUpdate {
                modalities: config.modalities.clone(),
                instructions: config.instructions.clone(),
                voice: config.voice.clone(),
                temperature: config.temperature,
            },
        }
    }

    /// Serialize to the wire representation.
    pub fn encode(&self) -> VoiceResult<String> {
        serde_json::to_string(self).map_err(VoiceError::from)
    }
}

/// Inbound envelopes decoded from the service.
///
/// Variants mirror the wire `type` field. Anything unrecognized lands in
/// `Unknown` and is logged and skipped by the session, never treated as
/// fatal.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated {
        #[serde(default)]
        session: Option<SessionInfo>,
    },

    #[serde(rename = "session.updated")]
    SessionUpdated {
        #[serde(default)]
        session: Option<SessionInfo>,
    },

    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,

    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped,

    /// Partial transcript of the assistant's spoken output
    #[serde(rename = "response.audio_transcript.delta")]
    AudioTranscriptDelta { delta: String },

    /// Partial text of the assistant's written output
    #[serde(rename = "response.output_text.delta")]
    OutputTextDelta { delta: String },

    /// One chunk of base64-encoded assistant audio
    #[serde(rename = "response.audio.delta")]
    AudioDelta { delta: String },

    #[serde(rename = "response.done")]
    ResponseDone,

    #[serde(rename = "response.completed")]
    ResponseCompleted,

    /// Echo of a created conversation item (carries user transcripts)
    #[serde(rename = "conversation.item.created")]
    ConversationItemCreated {
        #[serde(default)]
        item: Option<CreatedItem>,
    },

    #[serde(rename = "error")]
    ErrorEvent {
        #[serde(default)]
        error: ErrorBody,
    },

    /// Any type the client does not know about (ignored, logged)
    #[serde(other)]
    Unknown,
}

/// Session metadata echoed in `session.created` / `session.updated`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionInfo {
    #[serde(default)]
    pub id: Option<String>,
}

/// Error payload of the `error` envelope.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub message: String,
}

/// Inbound conversation item body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreatedItem {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Vec<ContentPartIn>,
}

/// Content part of an inbound conversation item. The service reports user
/// speech either as plain `text` or as a `transcript` field depending on
/// the input modality.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContentPartIn {
    #[serde(rename = "type", default)]
    pub part_type: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub transcript: Option<String>,
}

impl CreatedItem {
    /// Extract the user-side transcript from the item, if this is a user
    /// item that carries one.
    pub fn user_transcript(&self) -> Option<String> {
        if self.role.as_deref() != Some("user") {
            return None;
        }
        self.content.iter().find_map(|part| {
            part.transcript
                .clone()
                .or_else(|| part.text.clone())
                .filter(|t| !t.is_empty())
        })
    }
}

/// Decode one inbound envelope from its wire text.
pub fn decode_server_event(text: &str) -> VoiceResult<ServerEvent> {
    serde_json::from_str(text).map_err(VoiceError::from)
}

/// Decode a base64 audio payload into raw PCM bytes.
pub fn decode_audio_payload(payload: &str) -> VoiceResult<Vec<u8>> {
    BASE64
        .decode(payload.trim())
        .map_err(|e| VoiceError::Protocol(format!("invalid base64 audio payload: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_handshake_shape() {
        let json = ClientEvent::ConnectRealtime.encode().unwrap();
        assert_eq!(json, r#"{"type":"connect_realtime"}"#);
    }

    #[test]
    fn test_audio_append_round_trip() {
        let pcm = vec![0u8, 1, 2, 3, 254, 255];
        let event = ClientEvent::audio_append(&pcm);
        let json = event.encode().unwrap();
        assert!(json.contains("input_audio_buffer.append"));

        let parsed: ClientEvent = serde_json::from_str(&json).unwrap();
        match parsed {
            ClientEvent::InputAudioAppend { audio } => {
                assert_eq!(decode_audio_payload(&audio).unwrap(), pcm);
            }
            other => panic!("wrong event type: {:?}", other),
        }
    }

    #[test]
    fn test_user_turn_produces_item_then_response_create() {
        let [item, trigger] = ClientEvent::user_turn("hello there");
        let item_json = item.encode().unwrap();
        assert!(item_json.contains("conversation.item.create"));
        assert!(item_json.contains("input_text"));
        assert!(item_json.contains("hello there"));
        assert_eq!(trigger.encode().unwrap(), r#"{"type":"response.create"}"#);
    }

    #[test]
    fn test_decode_transcript_delta() {
        let event =
            decode_server_event(r#"{"type":"response.audio_transcript.delta","delta":"Hi"}"#)
                .unwrap();
        match event {
            ServerEvent::AudioTranscriptDelta { delta } => assert_eq!(delta, "Hi"),
            other => panic!("wrong event type: {:?}", other),
        }
    }

    #[test]
    fn test_decode_unknown_type_is_not_fatal() {
        let event = decode_server_event(r#"{"type":"rate_limits.updated","limits":[]}"#).unwrap();
        assert!(matches!(event, ServerEvent::Unknown));
    }

    #[test]
    fn test_decode_error_event() {
        let event =
            decode_server_event(r#"{"type":"error","error":{"message":"session expired"}}"#)
                .unwrap();
        match event {
            ServerEvent::ErrorEvent { error } => assert_eq!(error.message, "session expired"),
            other => panic!("wrong event type: {:?}", other),
        }
    }

    #[test]
    fn test_user_transcript_extraction() {
        let event = decode_server_event(
            r#"{"type":"conversation.item.created","item":{"role":"user","content":[{"type":"input_audio","transcript":"what is my schedule"}]}}"#,
        )
        .unwrap();
        match event {
            ServerEvent::ConversationItemCreated { item } => {
                assert_eq!(
                    item.unwrap().user_transcript().as_deref(),
                    Some("what is my schedule")
                );
            }
            other => panic!("wrong event type: {:?}", other),
        }

        // Assistant items never yield a user transcript.
        let event = decode_server_event(
            r#"{"type":"conversation.item.created","item":{"role":"assistant","content":[{"type":"text","text":"hi"}]}}"#,
        )
        .unwrap();
        match event {
            ServerEvent::ConversationItemCreated { item } => {
                assert!(item.unwrap().user_transcript().is_none());
            }
            other => panic!("wrong event type: {:?}", other),
        }
    }

    #[test]
    fn test_session_update_shape() {
        let config = crate::config::VoiceConfig::default();
        let json = ClientEvent::session_update(&config.session).encode().unwrap();
        assert!(json.contains("session.update"));
        assert!(json.contains("modalities"));
        assert!(json.contains("alloy"));
    }
}
