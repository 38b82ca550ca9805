//! Real-time chat synchronization client.
//!
//! Keeps a local conversation/message store continuously consistent with a
//! chat server over a duplex WebSocket plus a REST API: automatic
//! reconnection with exponential backoff, incremental assembly of streamed
//! assistant replies, typing presence in both directions, and optimistic
//! local mutations reconciled against server confirmations.
//!
//! [`SyncClient`] is the entry point; everything else is a collaborator it
//! wires together.

pub mod api;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod model;
pub mod presence;
pub mod protocol;
pub mod reassembler;
pub mod settings;
pub mod store;

pub use api::{ApiEnvelope, ChatApi, HttpApi};
pub use client::{RollbackPolicy, SyncClient};
pub use config::{FileConfig, SyncConfig, TypingConfig, load_config};
pub use connection::{ConnectionManager, CredentialProvider, ReconnectConfig, StaticCredentials};
pub use error::SyncError;
pub use model::{
    Attachment, ConnectionHealth, ConnectionState, Conversation, Message, MessageRole,
    MessageStatus,
};
pub use presence::{TypingCoordinator, TypingSignal, typing_summary};
pub use protocol::{ClientEvent, ServerEvent};
pub use reassembler::StreamReassembler;
pub use settings::{SettingsStore, Theme, UiSettings};
pub use store::{ChatStore, ChunkOutcome, StoreEvent};
