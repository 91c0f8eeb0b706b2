//! # Conversation Messages
//!
//! Completed conversation turns. The session appends to its message log in
//! arrival order and never mutates an entry after insertion; streaming
//! deltas accumulate in the session's transcript buffer and only become a
//! `Message` once the turn completes.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Who produced a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// One completed conversation turn.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    /// Raw PCM16 audio for assistant turns that carried audio, if kept
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<Vec<u8>>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content, None)
    }

    pub fn assistant(content: impl Into<String>, audio: Option<Vec<u8>>) -> Self {
        Self::new(Role::Assistant, content, audio)
    }

    fn new(role: Role, content: impl Into<String>, audio: Option<Vec<u8>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            audio,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_constructors() {
        let user = Message::user("hello");
        assert_eq!(user.role, Role::User);
        assert_eq!(user.content, "hello");
        assert!(user.audio.is_none());

        let assistant = Message::assistant("hi there", Some(vec![1, 2, 3]));
        assert_eq!(assistant.role, Role::Assistant);
        assert_eq!(assistant.audio.as_deref(), Some(&[1u8, 2, 3][..]));
        assert_ne!(user.id, assistant.id);
    }

    #[test]
    fn test_message_serializes_role_snake_case() {
        let json = serde_json::to_string(&Message::user("hey")).unwrap();
        assert!(json.contains(r#""role":"user""#));
        assert!(json.contains(r#""content":"hey""#));
        // Absent audio is omitted entirely.
        assert!(!json.contains("audio"));
    }
}
