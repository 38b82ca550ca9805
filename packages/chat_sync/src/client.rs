//! Sync client: the composition root.
//!
//! Wires the connection manager, stream reassembler, typing coordinator, and
//! conversation store together. One event-loop task serializes every
//! network-driven store mutation; UI-facing operations go through the same
//! store methods under the same lock. No module-level singletons — construct
//! one, pass handles around.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::ChatApi;
use crate::config::SyncConfig;
use crate::connection::{ConnectionManager, CredentialProvider};
use crate::error::SyncError;
use crate::model::{Attachment, ConnectionHealth, ConnectionState, Conversation, Message};
use crate::presence::{TypingCoordinator, TypingSignal};
use crate::protocol::{ClientEvent, ServerEvent};
use crate::reassembler::StreamReassembler;
use crate::store::{ChatStore, StoreEvent};

/// What to do with optimistically removed state when the remote delete
/// fails. The failure is surfaced either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RollbackPolicy {
    /// Leave the local removal in place (the original product behavior).
    #[default]
    KeepRemoved,
    /// Restore the removed entity at its former position.
    Restore,
}

pub struct SyncClient<A: ChatApi> {
    store: Arc<RwLock<ChatStore>>,
    connection: Arc<ConnectionManager>,
    api: Arc<A>,
    typing: Arc<Mutex<TypingCoordinator>>,
    current_conversation: Arc<Mutex<Option<String>>>,
    rollback_policy: RollbackPolicy,
    cancel: CancellationToken,
    #[cfg(test)]
    events_tx: mpsc::Sender<ServerEvent>,
}

impl<A: ChatApi + 'static> SyncClient<A> {
    pub fn new(config: SyncConfig, api: A, credentials: Arc<dyn CredentialProvider>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(256);
        let connection = Arc::new(ConnectionManager::new(
            config.ws_url.clone(),
            config.reconnect.clone(),
            credentials,
            events_tx.clone(),
        ));
        let store = Arc::new(RwLock::new(ChatStore::new()));
        let typing = Arc::new(Mutex::new(TypingCoordinator::new(
            config.typing.idle_timeout,
        )));
        let current_conversation = Arc::new(Mutex::new(None));
        let cancel = CancellationToken::new();

        let event_loop = EventLoop {
            store: store.clone(),
            typing: typing.clone(),
            connection: connection.clone(),
            current_conversation: current_conversation.clone(),
            typing_ttl: config.typing.ttl,
            sweep_interval: config.typing.sweep_interval,
            events_rx,
            status_rx: connection.subscribe_status(),
            reassembler: StreamReassembler::new(),
            cancel: cancel.clone(),
        };
        tokio::spawn(event_loop.run());

        Self {
            store,
            connection,
            api: Arc::new(api),
            typing,
            current_conversation,
            rollback_policy: RollbackPolicy::default(),
            cancel,
            #[cfg(test)]
            events_tx,
        }
    }

    pub fn set_rollback_policy(&mut self, policy: RollbackPolicy) {
        self.rollback_policy = policy;
    }

    // === Connection lifecycle (delegated) ===

    pub async fn connect(&self) {
        self.connection.connect().await;
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    pub async fn reconnect(&self) {
        self.connection.reconnect().await;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.connection.state().await
    }

    /// Stop the event loop and close the connection.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.connection.disconnect().await;
    }

    // === Snapshots ===

    pub async fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.store.read().await.subscribe()
    }

    pub async fn conversations(&self) -> Vec<Conversation> {
        self.store.read().await.conversations().to_vec()
    }

    pub async fn conversation(&self, id: &str) -> Option<Conversation> {
        self.store.read().await.conversation(id).cloned()
    }

    pub async fn health(&self) -> ConnectionHealth {
        self.store.read().await.health()
    }

    pub async fn typing_text(&self, conversation_id: &str) -> Option<String> {
        self.store
            .read()
            .await
            .typing_text(conversation_id, Instant::now())
    }

    // === Conversation operations ===

    pub async fn load_conversations(&self) -> Result<(), SyncError> {
        let conversations = self.api.list_conversations().await?;
        self.store.write().await.set_conversations(conversations);
        Ok(())
    }

    pub async fn create_conversation(
        &self,
        title: Option<&str>,
    ) -> Result<Conversation, SyncError> {
        let conversation = self.api.create_conversation(title).await?;
        self.store
            .write()
            .await
            .insert_conversation(conversation.clone());
        Ok(conversation)
    }

    /// Make a conversation current: subscribe to its realtime events and
    /// load its message history.
    pub async fn select_conversation(&self, conversation_id: &str) -> Result<(), SyncError> {
        if self.store.read().await.conversation(conversation_id).is_none() {
            return Err(SyncError::UnknownConversation(conversation_id.to_string()));
        }
        *self.current_conversation.lock().await = Some(conversation_id.to_string());
        self.connection
            .send(ClientEvent::JoinConversation {
                conversation_id: conversation_id.to_string(),
            })
            .await;

        match self.api.list_messages(conversation_id).await {
            Ok(messages) => {
                self.store
                    .write()
                    .await
                    .set_messages(conversation_id, messages);
                Ok(())
            }
            Err(err) => {
                self.store
                    .write()
                    .await
                    .set_conversation_error(conversation_id, Some(err.to_string()));
                Err(err)
            }
        }
    }

    pub async fn rename_conversation(
        &self,
        conversation_id: &str,
        title: &str,
    ) -> Result<(), SyncError> {
        match self.api.rename_conversation(conversation_id, title).await {
            Ok(_) => {
                self.store
                    .write()
                    .await
                    .rename_conversation(conversation_id, title, Utc::now());
                Ok(())
            }
            Err(err) => {
                self.store
                    .write()
                    .await
                    .set_conversation_error(conversation_id, Some(err.to_string()));
                Err(err)
            }
        }
    }

    /// Optimistically remove a conversation, then request the remote delete.
    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<(), SyncError> {
        let removed = self.store.write().await.remove_conversation(conversation_id);
        let Some((index, conversation)) = removed else {
            debug!(conversation_id, "delete of unknown conversation ignored");
            return Ok(());
        };
        {
            let mut current = self.current_conversation.lock().await;
            if current.as_deref() == Some(conversation_id) {
                *current = None;
            }
        }

        match self.api.delete_conversation(conversation_id).await {
            Ok(()) => Ok(()),
            Err(err) => {
                if self.rollback_policy == RollbackPolicy::Restore {
                    let mut store = self.store.write().await;
                    store.restore_conversation(index, conversation);
                    store.set_conversation_error(conversation_id, Some(err.to_string()));
                }
                Err(err)
            }
        }
    }

    // === Message operations ===

    /// Append a provisional user message, emit the realtime event, and
    /// request persistence. On success the provisional message is
    /// reconciled in place with the server-confirmed one; on failure it is
    /// marked failed and stays visible for retry.
    pub async fn send_message(
        &self,
        conversation_id: Option<&str>,
        content: &str,
        files: Vec<String>,
    ) -> Result<Message, SyncError> {
        let (conversation_id, provisional) = {
            let mut store = self.store.write().await;
            let conversation_id = match conversation_id {
                Some(id) => id.to_string(),
                None => match self.current_conversation.lock().await.clone() {
                    Some(id) => id,
                    None => store.create_local_conversation(None, Utc::now()),
                },
            };
            let attachments = files
                .iter()
                .map(|id| Attachment {
                    id: id.clone(),
                    name: id.clone(),
                    url: None,
                })
                .collect();
            let provisional =
                store.append_provisional(&conversation_id, content, attachments, Utc::now())?;
            (conversation_id, provisional)
        };

        // Sending a message ends the typing session.
        if self.typing.lock().await.end_session(&conversation_id) {
            self.connection
                .send(ClientEvent::TypingStop {
                    conversation_id: conversation_id.clone(),
                })
                .await;
        }

        // Realtime fan-out; dropped while disconnected, persistence below is
        // what the provisional message reconciles against.
        self.connection
            .send(ClientEvent::SendMessage {
                conversation_id: conversation_id.clone(),
                content: content.to_string(),
                files: files.clone(),
            })
            .await;

        match self.api.send_message(&conversation_id, content, &files).await {
            Ok(confirmed) => {
                self.store
                    .write()
                    .await
                    .reconcile_message(&provisional.id, confirmed.clone());
                Ok(confirmed)
            }
            Err(err) => {
                self.store
                    .write()
                    .await
                    .mark_message_failed(&conversation_id, &provisional.id);
                Err(err)
            }
        }
    }

    /// Optimistically remove a message, then request the remote delete.
    pub async fn delete_message(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<(), SyncError> {
        let removed = self
            .store
            .write()
            .await
            .remove_message(conversation_id, message_id);
        let Some((index, message)) = removed else {
            return Err(SyncError::UnknownMessage(message_id.to_string()));
        };

        match self.api.delete_message(conversation_id, message_id).await {
            Ok(()) => {
                self.store
                    .write()
                    .await
                    .set_conversation_error(conversation_id, None);
                Ok(())
            }
            Err(err) => {
                let mut store = self.store.write().await;
                store.set_conversation_error(conversation_id, Some(err.to_string()));
                if self.rollback_policy == RollbackPolicy::Restore {
                    store.restore_message(conversation_id, index, message);
                }
                Err(err)
            }
        }
    }

    // === Typing ===

    /// Feed the current input state of the composer. Emits `typing_start`
    /// once per session and `typing_stop` when the input empties; the idle
    /// debounce is handled by the event loop's sweep.
    pub async fn input_changed(&self, conversation_id: &str, text: &str) {
        let has_text = !text.trim().is_empty();
        let signal =
            self.typing
                .lock()
                .await
                .input_changed(conversation_id, has_text, Instant::now());
        match signal {
            Some(TypingSignal::Start) => {
                self.connection
                    .send(ClientEvent::TypingStart {
                        conversation_id: conversation_id.to_string(),
                    })
                    .await;
            }
            Some(TypingSignal::Stop) => {
                self.connection
                    .send(ClientEvent::TypingStop {
                        conversation_id: conversation_id.to_string(),
                    })
                    .await;
            }
            None => {}
        }
    }

    /// Clear all realtime state (logout / account switch).
    pub async fn reset(&self) {
        self.store.write().await.reset();
        *self.current_conversation.lock().await = None;
    }

    #[cfg(test)]
    pub(crate) async fn inject_event(&self, event: ServerEvent) {
        self.events_tx.send(event).await.expect("event loop gone");
    }
}

/// The single logical thread of control for network-driven mutations.
struct EventLoop {
    store: Arc<RwLock<ChatStore>>,
    typing: Arc<Mutex<TypingCoordinator>>,
    connection: Arc<ConnectionManager>,
    current_conversation: Arc<Mutex<Option<String>>>,
    typing_ttl: std::time::Duration,
    sweep_interval: std::time::Duration,
    events_rx: mpsc::Receiver<ServerEvent>,
    status_rx: broadcast::Receiver<ConnectionState>,
    reassembler: StreamReassembler,
    cancel: CancellationToken,
}

impl EventLoop {
    async fn run(mut self) {
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,

                event = self.events_rx.recv() => match event {
                    Some(event) => self.handle_server_event(event).await,
                    None => break,
                },

                status = self.status_rx.recv() => match status {
                    Ok(state) => self.handle_status(state).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "connection status updates lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },

                _ = sweep.tick() => self.sweep().await,
            }
        }
        debug!("sync event loop stopped");
    }

    async fn handle_status(&mut self, state: ConnectionState) {
        let reconnected = state.is_connected();
        self.store
            .write()
            .await
            .set_connection_state(state, Utc::now());

        // Conversation subscriptions do not survive the server side of a
        // reconnect; re-join the current one.
        if reconnected {
            let current = self.current_conversation.lock().await.clone();
            if let Some(conversation_id) = current {
                self.connection
                    .send(ClientEvent::JoinConversation { conversation_id })
                    .await;
            }
        }
    }

    async fn handle_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::MessageReceived { message } => {
                self.store.write().await.append_message(message);
            }
            ServerEvent::MessageChunk {
                message_id,
                chunk,
                is_complete,
                conversation_id,
            } => {
                let hint = match conversation_id {
                    Some(id) => Some(id),
                    None => self.current_conversation.lock().await.clone(),
                };
                let mut store = self.store.write().await;
                self.reassembler.apply_chunk(
                    &mut store,
                    hint.as_deref(),
                    &message_id,
                    &chunk,
                    is_complete,
                );
            }
            ServerEvent::MessageComplete { message } => {
                let mut store = self.store.write().await;
                self.reassembler.apply_complete(&mut store, message);
            }
            ServerEvent::UserTyping {
                user_id,
                is_typing,
                conversation_id,
            } => {
                let conversation_id = match conversation_id {
                    Some(id) => Some(id),
                    None => self.current_conversation.lock().await.clone(),
                };
                let Some(conversation_id) = conversation_id else {
                    debug!(user_id, "typing event with no conversation; ignored");
                    return;
                };
                let mut store = self.store.write().await;
                if is_typing {
                    store.set_typing(&conversation_id, &user_id, Instant::now() + self.typing_ttl);
                } else {
                    store.clear_typing(&conversation_id, &user_id);
                }
            }
            ServerEvent::ConnectionStatus { status, message } => {
                debug!(status, ?message, "server connection status");
            }
            ServerEvent::Error { message, code } => {
                warn!(%message, ?code, "server reported error");
                self.store.read().await.report_server_error(message, code);
            }
        }
    }

    async fn sweep(&mut self) {
        let now = Instant::now();
        self.store.write().await.expire_typing(now);
        let stops = self.typing.lock().await.idle_stops(now);
        for conversation_id in stops {
            self.connection
                .send(ClientEvent::TypingStop { conversation_id })
                .await;
        }
    }
}
