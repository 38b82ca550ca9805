//! Domain types shared across the store, transport, and protocol layers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

/// Delivery status of a message in the local store.
///
/// `content` is mutable only while an assistant message is `Streaming`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Optimistic local message awaiting server confirmation.
    Pending,
    /// Assistant reply being assembled from chunk events.
    Streaming,
    /// Confirmed by the server; content is final.
    #[default]
    Complete,
    /// Persistence failed; kept visible for retry or removal.
    Failed,
}

/// Reference to an uploaded file carried by a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// A single chat message.
///
/// `id` is server-assigned once persisted; before acknowledgment a locally
/// generated provisional id stands in. Reconciliation replaces the
/// provisional message wholesale — an id never changes identity in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(default)]
    pub status: MessageStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    /// Token count reported by the server, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u32>,
}

/// A conversation: ordered message sequence plus aggregate metadata.
///
/// Message order is causal send order; reconciliation preserves positions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub total_tokens: u64,
    /// Last per-request failure for this conversation (delete/rename/etc.),
    /// surfaced so a UI can offer retry. Cleared on the next success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Conversation {
    pub fn new(id: String, title: String, now: DateTime<Utc>) -> Self {
        Self {
            id,
            title,
            messages: Vec::new(),
            updated_at: now,
            total_tokens: 0,
            error: None,
        }
    }
}

/// Lifecycle of the single duplex connection, owned exclusively by the
/// connection manager. Every transition is broadcast; this is the only
/// channel by which other components learn connected/disconnected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Retry budget exhausted; only an explicit reconnect leaves this state.
    FailedPermanently,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Read-only connection snapshot published into the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionHealth {
    pub connected: bool,
    pub last_connected: Option<DateTime<Utc>>,
}
