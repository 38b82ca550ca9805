//! Conversation State Store
//!
//! The single source of truth for conversations, messages, typing sets, and
//! connection health snapshots. Every mutation goes through a method on
//! [`ChatStore`] — the websocket path and UI-facing actions never touch the
//! underlying collections directly. Consumers subscribe to a broadcast
//! channel of [`StoreEvent`]s to learn when a snapshot changed.

use std::collections::HashMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::SyncError;
use crate::model::{
    Attachment, ConnectionHealth, ConnectionState, Conversation, Message, MessageRole,
    MessageStatus,
};
use crate::presence::typing_summary;

/// Longest auto-derived conversation title, in characters.
const TITLE_MAX_CHARS: usize = 50;

/// Notification that some part of the store changed.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// The conversation list changed (created/removed/renamed/reordered).
    ConversationsChanged,
    /// Messages within one conversation changed.
    MessagesChanged { conversation_id: String },
    /// The typing set for one conversation changed.
    TypingChanged { conversation_id: String },
    /// The connection state transitioned.
    ConnectionChanged(ConnectionState),
    /// The server reported a non-fatal error event.
    ServerError {
        message: String,
        code: Option<String>,
    },
}

/// Outcome of feeding one chunk fragment into the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Fragment appended to a streaming message.
    Appended,
    /// Target message exists but is no longer streaming.
    NotStreaming,
    /// No message with that id anywhere in the store.
    NotFound,
}

pub struct ChatStore {
    conversations: Vec<Conversation>,
    /// Per-conversation typing participants with expiry, in arrival order.
    typing: HashMap<String, Vec<(String, Instant)>>,
    connection_state: ConnectionState,
    health: ConnectionHealth,
    events_tx: broadcast::Sender<StoreEvent>,
}

impl ChatStore {
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(256);
        Self {
            conversations: Vec::new(),
            typing: HashMap::new(),
            connection_state: ConnectionState::Disconnected,
            health: ConnectionHealth::default(),
            events_tx,
        }
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events_tx.subscribe()
    }

    fn notify(&self, event: StoreEvent) {
        // No receivers is fine (headless use, tests).
        let _ = self.events_tx.send(event);
    }

    // === Reads ===

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn conversation(&self, id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == id)
    }

    pub fn connection_state(&self) -> &ConnectionState {
        &self.connection_state
    }

    pub fn health(&self) -> ConnectionHealth {
        self.health.clone()
    }

    /// Participants currently typing in a conversation, expired entries
    /// filtered out at query time.
    pub fn typing_users(&self, conversation_id: &str, now: Instant) -> Vec<String> {
        self.typing
            .get(conversation_id)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(_, expires)| *expires > now)
                    .map(|(user, _)| user.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Human-readable typing summary for a conversation, or `None` when
    /// nobody is typing.
    pub fn typing_text(&self, conversation_id: &str, now: Instant) -> Option<String> {
        typing_summary(&self.typing_users(conversation_id, now))
    }

    // === Conversation mutations ===

    /// Replace the full conversation list (initial REST load).
    pub fn set_conversations(&mut self, conversations: Vec<Conversation>) {
        self.conversations = conversations;
        self.notify(StoreEvent::ConversationsChanged);
    }

    /// Insert a server-confirmed conversation at the head of the list,
    /// replacing any existing conversation with the same id in place.
    pub fn insert_conversation(&mut self, conversation: Conversation) {
        if let Some(existing) = self.conversations.iter_mut().find(|c| c.id == conversation.id) {
            *existing = conversation;
        } else {
            self.conversations.insert(0, conversation);
        }
        self.notify(StoreEvent::ConversationsChanged);
    }

    /// Create a local conversation (no server round-trip yet) and return its
    /// id. The title is derived from the first message when not given.
    pub fn create_local_conversation(&mut self, title: Option<&str>, now: DateTime<Utc>) -> String {
        let id = Uuid::new_v4().to_string();
        let title = title.unwrap_or("New conversation").to_string();
        self.conversations
            .insert(0, Conversation::new(id.clone(), title, now));
        self.notify(StoreEvent::ConversationsChanged);
        id
    }

    /// Optimistically remove a conversation. Returns its former index and
    /// contents so a caller applying a rollback policy can restore it.
    pub fn remove_conversation(&mut self, id: &str) -> Option<(usize, Conversation)> {
        let index = self.conversations.iter().position(|c| c.id == id)?;
        let conversation = self.conversations.remove(index);
        self.typing.remove(id);
        self.notify(StoreEvent::ConversationsChanged);
        Some((index, conversation))
    }

    /// Restore a conversation removed by [`remove_conversation`] at its
    /// original position (clamped if the list shrank meanwhile).
    pub fn restore_conversation(&mut self, index: usize, conversation: Conversation) {
        let index = index.min(self.conversations.len());
        self.conversations.insert(index, conversation);
        self.notify(StoreEvent::ConversationsChanged);
    }

    pub fn rename_conversation(&mut self, id: &str, title: &str, now: DateTime<Utc>) -> bool {
        let Some(conversation) = self.conversations.iter_mut().find(|c| c.id == id) else {
            return false;
        };
        conversation.title = title.to_string();
        conversation.updated_at = now;
        // A server-confirmed update supersedes any stale failure.
        conversation.error = None;
        self.notify(StoreEvent::ConversationsChanged);
        true
    }

    /// Surface (or clear) a per-request failure on a conversation.
    pub fn set_conversation_error(&mut self, id: &str, error: Option<String>) {
        if let Some(conversation) = self.conversations.iter_mut().find(|c| c.id == id) {
            conversation.error = error;
            self.notify(StoreEvent::ConversationsChanged);
        }
    }

    /// Replace the message list of a conversation (REST history load).
    pub fn set_messages(&mut self, conversation_id: &str, messages: Vec<Message>) -> bool {
        let Some(conversation) = self
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
        else {
            return false;
        };
        conversation.total_tokens = messages
            .iter()
            .filter_map(|m| m.tokens)
            .map(u64::from)
            .sum();
        conversation.messages = messages;
        conversation.error = None;
        self.notify(StoreEvent::MessagesChanged {
            conversation_id: conversation_id.to_string(),
        });
        true
    }

    // === Message mutations ===

    /// Append an inbound complete message, creating its conversation on
    /// first contact. A message whose id is already present is ignored
    /// (duplicate delivery).
    pub fn append_message(&mut self, message: Message) {
        let conversation_id = message.conversation_id.clone();
        let conversation = self.conversation_mut_or_create(&conversation_id, message.timestamp);
        if conversation.messages.iter().any(|m| m.id == message.id) {
            debug!(message_id = %message.id, "duplicate message ignored");
            return;
        }
        conversation.updated_at = message.timestamp;
        if let Some(tokens) = message.tokens {
            conversation.total_tokens += u64::from(tokens);
        }
        conversation.messages.push(message);
        self.notify(StoreEvent::MessagesChanged { conversation_id });
    }

    /// Synchronously append a provisional user message (status pending) and
    /// return it. The caller is responsible for requesting persistence and
    /// reconciling or failing the message afterwards.
    pub fn append_provisional(
        &mut self,
        conversation_id: &str,
        content: &str,
        attachments: Vec<Attachment>,
        now: DateTime<Utc>,
    ) -> Result<Message, SyncError> {
        let Some(conversation) = self
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
        else {
            return Err(SyncError::UnknownConversation(conversation_id.to_string()));
        };
        let message = Message {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            role: MessageRole::User,
            content: content.to_string(),
            status: MessageStatus::Pending,
            timestamp: now,
            attachments,
            tokens: None,
        };
        conversation.messages.push(message.clone());
        conversation.updated_at = now;
        if conversation.title == "New conversation" {
            conversation.title = derive_title(content);
        }
        self.notify(StoreEvent::MessagesChanged {
            conversation_id: conversation_id.to_string(),
        });
        Ok(message)
    }

    /// Replace a provisional message with its server-confirmed counterpart,
    /// preserving its position in the sequence. Matching is by the
    /// provisional correlation id, never by index.
    ///
    /// When the realtime echo of the send already delivered a message with
    /// the confirmed id, the provisional is dropped instead — one id, one
    /// message, and its tokens were already counted by the echo.
    pub fn reconcile_message(&mut self, provisional_id: &str, confirmed: Message) -> bool {
        for conversation in &mut self.conversations {
            let Some(position) = conversation
                .messages
                .iter()
                .position(|m| m.id == provisional_id)
            else {
                continue;
            };
            let conversation_id = conversation.id.clone();
            let echoed = confirmed.id != provisional_id
                && conversation.messages.iter().any(|m| m.id == confirmed.id);
            if echoed {
                debug!(provisional_id, confirmed = %confirmed.id, "confirmed message already echoed; dropping provisional");
                conversation.messages.remove(position);
            } else {
                if let Some(tokens) = confirmed.tokens {
                    conversation.total_tokens += u64::from(tokens);
                }
                conversation.updated_at = confirmed.timestamp;
                conversation.messages[position] = confirmed;
            }
            self.notify(StoreEvent::MessagesChanged { conversation_id });
            return true;
        }
        debug!(provisional_id, "reconcile target no longer in store");
        false
    }

    /// Mark a provisional message as failed; it stays visible for retry.
    pub fn mark_message_failed(&mut self, conversation_id: &str, message_id: &str) -> bool {
        let Some(conversation) = self
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
        else {
            return false;
        };
        let Some(message) = conversation.messages.iter_mut().find(|m| m.id == message_id) else {
            return false;
        };
        message.status = MessageStatus::Failed;
        self.notify(StoreEvent::MessagesChanged {
            conversation_id: conversation_id.to_string(),
        });
        true
    }

    /// Optimistically remove a message, returning its former index and
    /// contents for an optional rollback.
    pub fn remove_message(
        &mut self,
        conversation_id: &str,
        message_id: &str,
    ) -> Option<(usize, Message)> {
        let conversation = self
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)?;
        let index = conversation
            .messages
            .iter()
            .position(|m| m.id == message_id)?;
        let message = conversation.messages.remove(index);
        self.notify(StoreEvent::MessagesChanged {
            conversation_id: conversation_id.to_string(),
        });
        Some((index, message))
    }

    /// Restore a message removed by [`remove_message`] at its original
    /// position.
    pub fn restore_message(&mut self, conversation_id: &str, index: usize, message: Message) -> bool {
        let Some(conversation) = self
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
        else {
            return false;
        };
        let index = index.min(conversation.messages.len());
        conversation.messages.insert(index, message);
        self.notify(StoreEvent::MessagesChanged {
            conversation_id: conversation_id.to_string(),
        });
        true
    }

    // === Streaming support (driven by the reassembler) ===

    /// Begin a streaming assistant message from its first chunk fragment,
    /// creating the conversation on first contact. Any other streaming
    /// message in the conversation is sealed first so at most one message
    /// per conversation is ever in streaming status.
    pub fn start_streaming_message(
        &mut self,
        conversation_id: &str,
        message_id: &str,
        fragment: &str,
        now: DateTime<Utc>,
    ) {
        let conversation = self.conversation_mut_or_create(conversation_id, now);
        for message in conversation
            .messages
            .iter_mut()
            .filter(|m| m.status == MessageStatus::Streaming)
        {
            warn!(
                conversation_id,
                sealed = %message.id,
                incoming = message_id,
                "new stream started while another was in flight; sealing previous"
            );
            message.status = MessageStatus::Complete;
        }
        conversation.messages.push(Message {
            id: message_id.to_string(),
            conversation_id: conversation_id.to_string(),
            role: MessageRole::Assistant,
            content: fragment.to_string(),
            status: MessageStatus::Streaming,
            timestamp: now,
            attachments: Vec::new(),
            tokens: None,
        });
        conversation.updated_at = now;
        self.notify(StoreEvent::MessagesChanged {
            conversation_id: conversation_id.to_string(),
        });
    }

    /// Append a fragment to a streaming message, wherever it lives.
    pub fn append_chunk(&mut self, message_id: &str, fragment: &str) -> ChunkOutcome {
        for conversation in &mut self.conversations {
            if let Some(message) = conversation.messages.iter_mut().find(|m| m.id == message_id) {
                if message.status != MessageStatus::Streaming {
                    return ChunkOutcome::NotStreaming;
                }
                message.content.push_str(fragment);
                let conversation_id = conversation.id.clone();
                self.notify(StoreEvent::MessagesChanged { conversation_id });
                return ChunkOutcome::Appended;
            }
        }
        ChunkOutcome::NotFound
    }

    /// Close out a streaming message without replacing its content
    /// (a chunk arrived flagged as the last one).
    pub fn seal_streaming_message(&mut self, message_id: &str) -> bool {
        for conversation in &mut self.conversations {
            if let Some(message) = conversation.messages.iter_mut().find(|m| m.id == message_id) {
                if message.status != MessageStatus::Streaming {
                    return false;
                }
                message.status = MessageStatus::Complete;
                let conversation_id = conversation.id.clone();
                self.notify(StoreEvent::MessagesChanged { conversation_id });
                return true;
            }
        }
        false
    }

    /// Apply the canonical final form of a streamed message: replace the
    /// streaming message in place (same position), or append as a new
    /// complete message when no prior chunks arrived. The canonical payload
    /// always wins over locally assembled content. Idempotent.
    pub fn finalize_message(&mut self, mut message: Message) {
        message.status = MessageStatus::Complete;
        for conversation in &mut self.conversations {
            if let Some(slot) = conversation.messages.iter_mut().find(|m| m.id == message.id) {
                let conversation_id = conversation.id.clone();
                // Tokens land once: a locally assembled message (even one
                // sealed by a final-chunk flag) carries none yet, a
                // previously finalized one already counted them.
                if let (Some(tokens), None) = (message.tokens, slot.tokens) {
                    conversation.total_tokens += u64::from(tokens);
                }
                conversation.updated_at = message.timestamp;
                *slot = message;
                self.notify(StoreEvent::MessagesChanged { conversation_id });
                return;
            }
        }
        // No streaming message to replace (short reply, no chunks seen).
        self.append_message(message);
    }

    // === Typing presence ===

    /// Mark a participant as typing until `expires_at`; refreshes the expiry
    /// if already present, preserving arrival order.
    pub fn set_typing(&mut self, conversation_id: &str, user_id: &str, expires_at: Instant) {
        let entries = self.typing.entry(conversation_id.to_string()).or_default();
        if let Some(entry) = entries.iter_mut().find(|(user, _)| user == user_id) {
            entry.1 = expires_at;
        } else {
            entries.push((user_id.to_string(), expires_at));
        }
        self.notify(StoreEvent::TypingChanged {
            conversation_id: conversation_id.to_string(),
        });
    }

    pub fn clear_typing(&mut self, conversation_id: &str, user_id: &str) {
        if let Some(entries) = self.typing.get_mut(conversation_id) {
            let before = entries.len();
            entries.retain(|(user, _)| user != user_id);
            if entries.len() != before {
                self.notify(StoreEvent::TypingChanged {
                    conversation_id: conversation_id.to_string(),
                });
            }
        }
    }

    /// Drop typing entries whose TTL elapsed, so a crashed peer never leaves
    /// a permanently typing ghost.
    pub fn expire_typing(&mut self, now: Instant) {
        let mut changed = Vec::new();
        for (conversation_id, entries) in &mut self.typing {
            let before = entries.len();
            entries.retain(|(_, expires)| *expires > now);
            if entries.len() != before {
                changed.push(conversation_id.clone());
            }
        }
        for conversation_id in changed {
            self.notify(StoreEvent::TypingChanged { conversation_id });
        }
    }

    // === Connection snapshots (written only via the connection manager) ===

    pub fn set_connection_state(&mut self, state: ConnectionState, now: DateTime<Utc>) {
        if self.connection_state == state {
            return;
        }
        if state.is_connected() {
            self.health.connected = true;
            self.health.last_connected = Some(now);
        } else {
            self.health.connected = false;
        }
        self.connection_state = state.clone();
        self.notify(StoreEvent::ConnectionChanged(state));
    }

    /// Forward a server-reported error to subscribers.
    pub fn report_server_error(&self, message: String, code: Option<String>) {
        self.notify(StoreEvent::ServerError { message, code });
    }

    /// Clear all realtime state (logout / account switch).
    pub fn reset(&mut self) {
        self.conversations.clear();
        self.typing.clear();
        self.notify(StoreEvent::ConversationsChanged);
    }

    fn conversation_mut_or_create(
        &mut self,
        conversation_id: &str,
        now: DateTime<Utc>,
    ) -> &mut Conversation {
        if let Some(index) = self.conversations.iter().position(|c| c.id == conversation_id) {
            return &mut self.conversations[index];
        }
        self.conversations.insert(
            0,
            Conversation::new(
                conversation_id.to_string(),
                "New conversation".to_string(),
                now,
            ),
        );
        self.notify(StoreEvent::ConversationsChanged);
        &mut self.conversations[0]
    }
}

impl Default for ChatStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Derive a conversation title from its first message.
fn derive_title(content: &str) -> String {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return "New conversation".to_string();
    }
    let mut title: String = trimmed.chars().take(TITLE_MAX_CHARS).collect();
    if trimmed.chars().count() > TITLE_MAX_CHARS {
        title.push('…');
    }
    title
}
