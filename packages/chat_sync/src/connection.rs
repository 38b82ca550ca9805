//! Transport Connection Manager
//!
//! Owns the single duplex WebSocket: lifecycle, bearer-token handshake, and
//! the reconnection policy. A supervisor task drives connect → session →
//! backoff cycles; explicit `disconnect()` is the only transition that
//! suppresses automatic reconnection. Every state transition is published on
//! a broadcast channel — the sole way other components learn about
//! connected/disconnected.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::model::ConnectionState;
use crate::protocol::{ClientEvent, ServerEvent};

/// Reconnection policy: delay = min(base × 2^attempt, max_delay), with the
/// attempt count capped. After the budget is exhausted the connection goes
/// `FailedPermanently` until an explicit `reconnect()`.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            max_attempts: 5,
        }
    }
}

/// Supplies the opaque bearer token for the handshake. Token acquisition is
/// out of scope; a missing token makes `connect()` settle in Disconnected
/// without surfacing an error (precondition, not failure).
pub trait CredentialProvider: Send + Sync + 'static {
    fn bearer_token(&self) -> Option<String>;
}

/// Fixed-token provider for tests and simple embedders.
pub struct StaticCredentials(Option<String>);

impl StaticCredentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    pub fn none() -> Self {
        Self(None)
    }
}

impl CredentialProvider for StaticCredentials {
    fn bearer_token(&self) -> Option<String> {
        self.0.clone()
    }
}

struct Shared {
    state: ConnectionState,
    attempt: u32,
    /// Bumped on every connect/disconnect so a superseded supervisor can
    /// tell its writes are stale and exit silently.
    epoch: u64,
    supervisor: Option<CancellationToken>,
    /// Sender into the live session's writer; `None` while disconnected, so
    /// outbound events are dropped rather than queued.
    session_tx: Option<mpsc::Sender<ClientEvent>>,
}

pub struct ConnectionManager {
    url: String,
    config: ReconnectConfig,
    credentials: Arc<dyn CredentialProvider>,
    shared: Arc<Mutex<Shared>>,
    status_tx: broadcast::Sender<ConnectionState>,
    events_tx: mpsc::Sender<ServerEvent>,
}

impl ConnectionManager {
    /// `events_tx` receives every parsed inbound server event; the caller
    /// owns the receiving end (the sync client's event loop).
    pub fn new(
        url: impl Into<String>,
        config: ReconnectConfig,
        credentials: Arc<dyn CredentialProvider>,
        events_tx: mpsc::Sender<ServerEvent>,
    ) -> Self {
        let (status_tx, _) = broadcast::channel(64);
        Self {
            url: url.into(),
            config,
            credentials,
            shared: Arc::new(Mutex::new(Shared {
                state: ConnectionState::Disconnected,
                attempt: 0,
                epoch: 0,
                supervisor: None,
                session_tx: None,
            })),
            status_tx,
            events_tx,
        }
    }

    /// Subscribe to connection state transitions.
    pub fn subscribe_status(&self) -> broadcast::Receiver<ConnectionState> {
        self.status_tx.subscribe()
    }

    pub async fn state(&self) -> ConnectionState {
        self.shared.lock().await.state.clone()
    }

    /// Start (or preempt into) a connection attempt. Idempotent: a no-op
    /// while already Connecting or Connected. A pending backoff timer is
    /// cancelled — a manual connect preempts the scheduled retry.
    pub async fn connect(&self) {
        let (cancel, epoch) = {
            let mut shared = self.shared.lock().await;
            match shared.state {
                ConnectionState::Connecting | ConnectionState::Connected => return,
                _ => {}
            }
            if let Some(previous) = shared.supervisor.take() {
                previous.cancel();
            }
            shared.epoch += 1;
            let cancel = CancellationToken::new();
            shared.supervisor = Some(cancel.clone());
            (cancel, shared.epoch)
        };

        let supervisor = Supervisor {
            url: self.url.clone(),
            config: self.config.clone(),
            credentials: self.credentials.clone(),
            shared: self.shared.clone(),
            status_tx: self.status_tx.clone(),
            events_tx: self.events_tx.clone(),
            cancel,
            epoch,
        };
        tokio::spawn(supervisor.run());
    }

    /// Deterministic shutdown. Unlike a transport failure, this suppresses
    /// automatic reconnection.
    pub async fn disconnect(&self) {
        let mut shared = self.shared.lock().await;
        shared.epoch += 1;
        if let Some(cancel) = shared.supervisor.take() {
            cancel.cancel();
        }
        shared.session_tx = None;
        if shared.state != ConnectionState::Disconnected {
            shared.state = ConnectionState::Disconnected;
            let _ = self.status_tx.send(ConnectionState::Disconnected);
        }
    }

    /// Explicit user-triggered reconnect: resets the attempt budget and
    /// connects from scratch.
    pub async fn reconnect(&self) {
        self.disconnect().await;
        self.shared.lock().await.attempt = 0;
        self.connect().await;
    }

    /// Hand an event to the live session. Dropped (with a debug log) while
    /// not Connected — callers own optimistic local application and later
    /// reconciliation, not the transport.
    pub async fn send(&self, event: ClientEvent) -> bool {
        let tx = {
            let shared = self.shared.lock().await;
            if !shared.state.is_connected() {
                debug!(?event, "dropping outbound event while disconnected");
                return false;
            }
            shared.session_tx.clone()
        };
        match tx {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }
}

/// How a session ended, from the supervisor's point of view.
enum SessionEnd {
    /// Explicit disconnect (or consumer gone) — no retry.
    Explicit,
    /// A newer connect/disconnect took over; exit without touching state.
    Superseded,
    /// Transport failure or server-side close — retry with backoff.
    Dropped,
}

struct Supervisor {
    url: String,
    config: ReconnectConfig,
    credentials: Arc<dyn CredentialProvider>,
    shared: Arc<Mutex<Shared>>,
    status_tx: broadcast::Sender<ConnectionState>,
    events_tx: mpsc::Sender<ServerEvent>,
    cancel: CancellationToken,
    epoch: u64,
}

impl Supervisor {
    async fn run(self) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            let Some(token) = self.credentials.bearer_token() else {
                debug!("no credential available; staying disconnected");
                self.set_state(ConnectionState::Disconnected).await;
                return;
            };
            if !self.set_state(ConnectionState::Connecting).await {
                return;
            }

            match self.run_session(token).await {
                SessionEnd::Explicit => {
                    self.set_state(ConnectionState::Disconnected).await;
                    return;
                }
                SessionEnd::Superseded => return,
                SessionEnd::Dropped => {}
            }

            let attempt = {
                let mut shared = self.shared.lock().await;
                if shared.epoch != self.epoch {
                    return;
                }
                shared.attempt += 1;
                shared.attempt
            };
            if attempt > self.config.max_attempts {
                warn!(
                    max_attempts = self.config.max_attempts,
                    "reconnect budget exhausted; waiting for explicit reconnect"
                );
                self.set_state(ConnectionState::FailedPermanently).await;
                return;
            }

            let delay = backoff_delay(attempt, self.config.base_delay, self.config.max_delay);
            info!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "scheduling reconnect"
            );
            if !self
                .set_state(ConnectionState::Reconnecting { attempt })
                .await
            {
                return;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One connect + handshake + read/write session. Returns how it ended.
    async fn run_session(&self, token: String) -> SessionEnd {
        let (ws, _) = match tokio_tungstenite::connect_async(&self.url).await {
            Ok(conn) => conn,
            Err(err) => {
                warn!(url = %self.url, error = %err, "websocket connect failed");
                return SessionEnd::Dropped;
            }
        };
        let (mut ws_write, mut ws_read) = ws.split();

        // Handshake: the bearer token is the first frame on the wire.
        let auth = ClientEvent::Authenticate { token };
        let json = match serde_json::to_string(&auth) {
            Ok(json) => json,
            Err(err) => {
                warn!(error = %err, "failed to encode handshake");
                return SessionEnd::Dropped;
            }
        };
        if let Err(err) = ws_write.send(tungstenite::Message::Text(json.into())).await {
            warn!(error = %err, "handshake send failed");
            return SessionEnd::Dropped;
        }

        let (session_tx, mut session_rx) = mpsc::channel::<ClientEvent>(64);
        {
            let mut shared = self.shared.lock().await;
            if shared.epoch != self.epoch {
                return SessionEnd::Superseded;
            }
            shared.state = ConnectionState::Connected;
            shared.attempt = 0;
            shared.session_tx = Some(session_tx);
            let _ = self.status_tx.send(ConnectionState::Connected);
        }
        info!(url = %self.url, "connected");

        let end = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break SessionEnd::Explicit,

                outbound = session_rx.recv() => {
                    let Some(event) = outbound else {
                        break SessionEnd::Dropped;
                    };
                    let json = match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(err) => {
                            warn!(error = %err, "failed to encode outbound event");
                            continue;
                        }
                    };
                    if let Err(err) = ws_write.send(tungstenite::Message::Text(json.into())).await {
                        warn!(error = %err, "websocket send failed");
                        break SessionEnd::Dropped;
                    }
                }

                inbound = ws_read.next() => {
                    match inbound {
                        Some(Ok(tungstenite::Message::Text(text))) => {
                            match serde_json::from_str::<ServerEvent>(text.as_str()) {
                                Ok(event) => {
                                    if self.events_tx.send(event).await.is_err() {
                                        // Consumer gone; nothing left to sync for.
                                        break SessionEnd::Explicit;
                                    }
                                }
                                Err(err) => {
                                    warn!(error = %err, "unrecognized server event discarded");
                                }
                            }
                        }
                        Some(Ok(tungstenite::Message::Close(frame))) => {
                            info!(?frame, "server closed connection");
                            break SessionEnd::Dropped;
                        }
                        Some(Ok(_)) => {} // ping/pong/binary
                        Some(Err(err)) => {
                            warn!(error = %err, "websocket read error");
                            break SessionEnd::Dropped;
                        }
                        None => {
                            info!("websocket stream ended");
                            break SessionEnd::Dropped;
                        }
                    }
                }
            }
        };

        // Tear down the session sender so sends drop instead of queueing.
        {
            let mut shared = self.shared.lock().await;
            if shared.epoch != self.epoch {
                return SessionEnd::Superseded;
            }
            shared.session_tx = None;
        }
        end
    }

    /// Write a state transition, unless a newer connect/disconnect already
    /// took over this manager. Returns false when superseded.
    async fn set_state(&self, state: ConnectionState) -> bool {
        let mut shared = self.shared.lock().await;
        if shared.epoch != self.epoch {
            return false;
        }
        if shared.state != state {
            shared.state = state.clone();
            let _ = self.status_tx.send(state);
        }
        true
    }
}

/// Exponential backoff delay for the given attempt (1-based).
pub(crate) fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 1u32 << attempt.min(20);
    base.saturating_mul(factor).min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_sequence_doubles_then_caps() {
        let base = Duration::from_millis(1000);
        let cap = Duration::from_millis(30_000);
        let delays: Vec<u64> = (1..=5)
            .map(|attempt| backoff_delay(attempt, base, cap).as_millis() as u64)
            .collect();
        assert_eq!(delays, [2000, 4000, 8000, 16000, 30_000]);
    }

    #[test]
    fn backoff_is_capped_for_large_attempts() {
        let base = Duration::from_millis(1000);
        let cap = Duration::from_millis(30_000);
        assert_eq!(backoff_delay(30, base, cap), cap);
    }

    #[tokio::test]
    async fn connect_without_credential_settles_disconnected() {
        let (events_tx, _events_rx) = mpsc::channel(8);
        let manager = ConnectionManager::new(
            "ws://127.0.0.1:1", // never dialed: no credential
            ReconnectConfig::default(),
            Arc::new(StaticCredentials::none()),
            events_tx,
        );
        manager.connect().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn send_while_disconnected_is_dropped() {
        let (events_tx, _events_rx) = mpsc::channel(8);
        let manager = ConnectionManager::new(
            "ws://127.0.0.1:1",
            ReconnectConfig::default(),
            Arc::new(StaticCredentials::new("tok")),
            events_tx,
        );
        let delivered = manager
            .send(ClientEvent::TypingStart {
                conversation_id: "c1".into(),
            })
            .await;
        assert!(!delivered);
    }
}
