//! Stream Reassembler
//!
//! Merges incremental `message_chunk` events and canonical
//! `message_complete` payloads into store mutations. Chunks for a given
//! message id arrive in order from the transport; the reassembler's job is
//! tolerating what the transport does not promise — duplicate finals, late
//! chunks after finalization, a complete event with no prior chunks —
//! without ever corrupting another message or reopening a finished one.

use std::collections::{HashSet, VecDeque};

use chrono::Utc;
use tracing::{debug, warn};

use crate::model::Message;
use crate::store::{ChatStore, ChunkOutcome};

/// How many finalized message ids to remember for late-chunk rejection.
const FINALIZED_MEMORY: usize = 1024;

pub struct StreamReassembler {
    /// Recently finalized ids, bounded FIFO. A chunk for any of these is a
    /// duplicate or out-of-order delivery and is discarded.
    finalized: HashSet<String>,
    finalized_order: VecDeque<String>,
}

impl StreamReassembler {
    pub fn new() -> Self {
        Self {
            finalized: HashSet::new(),
            finalized_order: VecDeque::new(),
        }
    }

    /// Feed one chunk event into the store.
    ///
    /// First chunk for an unknown id creates a streaming message in
    /// `conversation_hint`'s conversation; without a hint the chunk cannot
    /// be attributed and is dropped with a diagnostic.
    pub fn apply_chunk(
        &mut self,
        store: &mut ChatStore,
        conversation_hint: Option<&str>,
        message_id: &str,
        chunk: &str,
        is_complete: bool,
    ) {
        if self.finalized.contains(message_id) {
            warn!(message_id, "chunk for finalized message discarded");
            return;
        }

        match store.append_chunk(message_id, chunk) {
            ChunkOutcome::Appended => {}
            ChunkOutcome::NotStreaming => {
                // Completed outside our finalized window (e.g. history load).
                warn!(message_id, "chunk for non-streaming message discarded");
                return;
            }
            ChunkOutcome::NotFound => match conversation_hint {
                Some(conversation_id) => {
                    store.start_streaming_message(conversation_id, message_id, chunk, Utc::now());
                }
                None => {
                    warn!(message_id, "chunk with no conversation to attach to; discarded");
                    return;
                }
            },
        }

        if is_complete {
            debug!(message_id, "stream closed by final chunk flag");
            store.seal_streaming_message(message_id);
            self.mark_finalized(message_id);
        }
    }

    /// Apply the canonical complete message. Always wins over locally
    /// assembled content; replaces in place or appends when no chunks were
    /// seen. Safe to apply more than once.
    pub fn apply_complete(&mut self, store: &mut ChatStore, message: Message) {
        self.mark_finalized(&message.id);
        store.finalize_message(message);
    }

    fn mark_finalized(&mut self, message_id: &str) {
        if self.finalized.insert(message_id.to_string()) {
            self.finalized_order.push_back(message_id.to_string());
            while self.finalized_order.len() > FINALIZED_MEMORY {
                if let Some(evicted) = self.finalized_order.pop_front() {
                    self.finalized.remove(&evicted);
                }
            }
        }
    }
}

impl Default for StreamReassembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MessageRole, MessageStatus};

    fn canonical(id: &str, conversation_id: &str, content: &str) -> Message {
        Message {
            id: id.to_string(),
            conversation_id: conversation_id.to_string(),
            role: MessageRole::Assistant,
            content: content.to_string(),
            status: MessageStatus::Complete,
            timestamp: Utc::now(),
            attachments: Vec::new(),
            tokens: None,
        }
    }

    #[test]
    fn chunks_concatenate_in_arrival_order_then_canonical_wins() {
        let mut store = ChatStore::new();
        let mut reassembler = StreamReassembler::new();

        reassembler.apply_chunk(&mut store, Some("c1"), "m1", "Hel", false);
        reassembler.apply_chunk(&mut store, Some("c1"), "m1", "lo wor", false);

        // Correct intermediate state is plain concatenation.
        let partial = &store.conversation("c1").unwrap().messages[0];
        assert_eq!(partial.content, "Hello wor");
        assert_eq!(partial.status, MessageStatus::Streaming);

        reassembler.apply_chunk(&mut store, Some("c1"), "m1", "ld", false);
        reassembler.apply_complete(&mut store, canonical("m1", "c1", "Hello world"));

        let messages = &store.conversation("c1").unwrap().messages;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "Hello world");
        assert_eq!(messages[0].status, MessageStatus::Complete);
    }

    #[test]
    fn complete_without_chunks_appends_one_message() {
        let mut store = ChatStore::new();
        let mut reassembler = StreamReassembler::new();

        reassembler.apply_complete(&mut store, canonical("m1", "c1", "short"));

        let messages = &store.conversation("c1").unwrap().messages;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "short");
    }

    #[test]
    fn finalization_is_idempotent() {
        let mut store = ChatStore::new();
        let mut reassembler = StreamReassembler::new();

        reassembler.apply_chunk(&mut store, Some("c1"), "m1", "Hel", false);
        reassembler.apply_complete(&mut store, canonical("m1", "c1", "Hello"));
        reassembler.apply_complete(&mut store, canonical("m1", "c1", "Hello"));

        let messages = &store.conversation("c1").unwrap().messages;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "Hello");
    }

    #[test]
    fn late_chunk_never_reopens_a_finalized_message() {
        let mut store = ChatStore::new();
        let mut reassembler = StreamReassembler::new();

        reassembler.apply_chunk(&mut store, Some("c1"), "m1", "Hello", false);
        reassembler.apply_complete(&mut store, canonical("m1", "c1", "Hello world"));
        reassembler.apply_chunk(&mut store, Some("c1"), "m1", " trailing", false);

        let messages = &store.conversation("c1").unwrap().messages;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "Hello world");
        assert_eq!(messages[0].status, MessageStatus::Complete);
    }

    #[test]
    fn final_chunk_flag_seals_the_stream() {
        let mut store = ChatStore::new();
        let mut reassembler = StreamReassembler::new();

        reassembler.apply_chunk(&mut store, Some("c1"), "m1", "Hel", false);
        reassembler.apply_chunk(&mut store, Some("c1"), "m1", "lo", true);

        let messages = &store.conversation("c1").unwrap().messages;
        assert_eq!(messages[0].content, "Hello");
        assert_eq!(messages[0].status, MessageStatus::Complete);

        // A duplicate of the final chunk is discarded.
        reassembler.apply_chunk(&mut store, Some("c1"), "m1", "lo", true);
        assert_eq!(store.conversation("c1").unwrap().messages[0].content, "Hello");

        // The canonical payload still wins afterwards.
        reassembler.apply_complete(&mut store, canonical("m1", "c1", "Hello!"));
        assert_eq!(store.conversation("c1").unwrap().messages[0].content, "Hello!");
    }

    #[test]
    fn chunk_without_conversation_hint_is_dropped() {
        let mut store = ChatStore::new();
        let mut reassembler = StreamReassembler::new();

        reassembler.apply_chunk(&mut store, None, "m1", "orphan", false);
        assert!(store.conversations().is_empty());
    }

    #[test]
    fn chunks_do_not_disturb_other_messages() {
        let mut store = ChatStore::new();
        let mut reassembler = StreamReassembler::new();

        reassembler.apply_complete(&mut store, canonical("m0", "c1", "earlier"));
        reassembler.apply_chunk(&mut store, Some("c1"), "m1", "strea", false);
        reassembler.apply_chunk(&mut store, Some("c1"), "m1", "ming", false);

        let messages = &store.conversation("c1").unwrap().messages;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "earlier");
        assert_eq!(messages[1].content, "streaming");
    }
}
