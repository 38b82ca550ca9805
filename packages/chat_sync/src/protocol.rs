//! Wire protocol for the chat WebSocket.
//!
//! JSON text frames, internally tagged by a `type` field with snake_case
//! event names and camelCase payload fields (the server's wire shape).

use serde::{Deserialize, Serialize};

use crate::model::Message;

/// Events sent FROM the client TO the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    /// First frame after the socket opens: bearer-token handshake.
    Authenticate { token: String },

    /// Subscribe to events for a conversation.
    JoinConversation { conversation_id: String },

    /// Notify the realtime side of a new message. Persistence itself goes
    /// through the REST collaborator; this only triggers server-side fan-out.
    SendMessage {
        conversation_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        files: Vec<String>,
    },

    /// Presence signal: local user started a typing session.
    TypingStart { conversation_id: String },

    /// Presence signal: local user stopped typing (empty input or idle).
    TypingStop { conversation_id: String },
}

/// Events received FROM the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// A complete message from another participant; appended if new.
    MessageReceived { message: Message },

    /// Incremental fragment of a streaming assistant reply.
    MessageChunk {
        message_id: String,
        chunk: String,
        #[serde(default)]
        is_complete: bool,
        /// Conversation to attach a first chunk to. When absent the event is
        /// attributed to the currently joined conversation.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<String>,
    },

    /// Canonical final form of a streamed message; always wins over
    /// locally assembled content.
    MessageComplete { message: Message },

    /// Remote participant typing presence.
    UserTyping {
        user_id: String,
        is_typing: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<String>,
    },

    /// Informational status from the server; logged, never fatal.
    ConnectionStatus {
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Server-reported error; surfaced to the UI, non-fatal to the socket.
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MessageRole, MessageStatus};
    use chrono::Utc;

    #[test]
    fn client_events_use_snake_case_tags_and_camel_case_fields() {
        let ev = ClientEvent::SendMessage {
            conversation_id: "c1".into(),
            content: "hi".into(),
            files: vec!["f1".into()],
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "send_message");
        assert_eq!(json["conversationId"], "c1");
        assert_eq!(json["files"][0], "f1");

        let ev = ClientEvent::TypingStart {
            conversation_id: "c1".into(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "typing_start");
    }

    #[test]
    fn chunk_event_roundtrip() {
        let raw = r#"{"type":"message_chunk","messageId":"m1","chunk":"Hel","isComplete":false}"#;
        let ev: ServerEvent = serde_json::from_str(raw).unwrap();
        match ev {
            ServerEvent::MessageChunk {
                message_id,
                chunk,
                is_complete,
                conversation_id,
            } => {
                assert_eq!(message_id, "m1");
                assert_eq!(chunk, "Hel");
                assert!(!is_complete);
                assert!(conversation_id.is_none());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn message_received_carries_full_message() {
        let msg = Message {
            id: "m1".into(),
            conversation_id: "c1".into(),
            role: MessageRole::Assistant,
            content: "hello".into(),
            status: MessageStatus::Complete,
            timestamp: Utc::now(),
            attachments: Vec::new(),
            tokens: Some(3),
        };
        let json = serde_json::to_string(&ServerEvent::MessageReceived { message: msg }).unwrap();
        let back: ServerEvent = serde_json::from_str(&json).unwrap();
        match back {
            ServerEvent::MessageReceived { message } => {
                assert_eq!(message.id, "m1");
                assert_eq!(message.role, MessageRole::Assistant);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unknown_event_type_is_an_error() {
        let raw = r#"{"type":"mystery_event","payload":1}"#;
        assert!(serde_json::from_str::<ServerEvent>(raw).is_err());
    }

    #[test]
    fn user_typing_defaults() {
        let raw = r#"{"type":"user_typing","userId":"alice","isTyping":true}"#;
        let ev: ServerEvent = serde_json::from_str(raw).unwrap();
        match ev {
            ServerEvent::UserTyping {
                user_id,
                is_typing,
                conversation_id,
            } => {
                assert_eq!(user_id, "alice");
                assert!(is_typing);
                assert!(conversation_id.is_none());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
