//! Connection handle and the seam to the transport.
//!
//! A [`Connector`] establishes a [`Channel`] to the server. [`Connection`]
//! wraps the live channel together with the [`ConnectionStatus`] and
//! publishes every transition to the host's status display. Only the
//! context mutates it.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};

use crate::config::ServerConfig;
use crate::error::ConnectionError;
use crate::types::{
    ConnectionStatus, DiagnosticRecord, ServerEvent, ServerEventKind, ServerStatus, StopReason,
};

/// Settings the server may pull with `workspace/configuration`.
pub type SharedSettings = Arc<RwLock<serde_json::Value>>;

/// Bidirectional message channel to a running server.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Send a request and wait for its result.
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, ConnectionError>;

    /// Fire-and-forget. Notifications keep their relative order.
    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), ConnectionError>;

    /// Graceful shutdown. Must be safe to call more than once.
    async fn shutdown(&self);
}

/// Establishes channels. Everything the connector needs arrives through
/// [`ConnectParams`] so that each attempt sees the current configuration.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, params: ConnectParams) -> anyhow::Result<Arc<dyn Channel>>;
}

pub struct ConnectParams {
    pub server: ServerConfig,
    pub folders: Vec<url::Url>,
    pub settings: SharedSettings,
    pub events: EventSink,
}

/// Where a channel reports pushed diagnostics and its own death.
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: u64,
    tx: mpsc::Sender<ServerEvent>,
}

impl EventSink {
    pub(crate) fn new(generation: u64, tx: mpsc::Sender<ServerEvent>) -> Self {
        Self { generation, tx }
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub async fn diagnostics(&self, uri: String, records: Vec<DiagnosticRecord>) {
        self.send(ServerEventKind::Diagnostics { uri, records })
            .await;
    }

    pub async fn stopped(&self, reason: StopReason) {
        self.send(ServerEventKind::Stopped(reason)).await;
    }

    async fn send(&self, kind: ServerEventKind) {
        let event = ServerEvent {
            generation: self.generation,
            kind,
        };
        if self.tx.send(event).await.is_err() {
            tracing::debug!(
                generation = self.generation,
                "Context gone; dropping server event"
            );
        }
    }
}

/// The connection handle: status, live channel, and the generation of the
/// current (or most recent) connection attempt.
pub(crate) struct Connection {
    status: ConnectionStatus,
    channel: Option<Arc<dyn Channel>>,
    generation: u64,
    abort_pending: bool,
    published: watch::Sender<ServerStatus>,
}

impl Connection {
    pub fn new() -> Self {
        let (published, _) = watch::channel(ServerStatus::default());
        Self {
            status: ConnectionStatus::Stopped,
            channel: None,
            generation: 0,
            abort_pending: false,
            published,
        }
    }

    pub fn status(&self) -> &ConnectionStatus {
        &self.status
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn subscribe(&self) -> watch::Receiver<ServerStatus> {
        self.published.subscribe()
    }

    /// Stopped|Failed → Starting. Returns the generation for the new attempt.
    pub fn begin_start(&mut self) -> u64 {
        debug_assert!(self.channel.is_none(), "starting over a live channel");
        self.generation += 1;
        self.abort_pending = false;
        self.set_status(ConnectionStatus::Starting);
        self.generation
    }

    /// Ask the in-flight start to settle into Stopped instead of Running.
    /// Returns false when nothing is starting.
    pub fn request_abort(&mut self) -> bool {
        if matches!(self.status, ConnectionStatus::Starting) {
            self.abort_pending = true;
        }
        self.abort_pending
    }

    /// Starting → Running. If a stop arrived meanwhile the status goes
    /// straight to Stopped and the channel is handed back for teardown.
    pub fn established(&mut self, channel: Arc<dyn Channel>) -> Option<Arc<dyn Channel>> {
        if std::mem::take(&mut self.abort_pending) {
            self.set_status(ConnectionStatus::Stopped);
            return Some(channel);
        }
        self.channel = Some(channel);
        self.set_status(ConnectionStatus::Running);
        None
    }

    /// Starting → Failed, or Stopped if a stop arrived meanwhile.
    pub fn failed(&mut self, reason: String) {
        self.channel = None;
        if std::mem::take(&mut self.abort_pending) {
            self.set_status(ConnectionStatus::Stopped);
        } else {
            self.set_status(ConnectionStatus::Failed(reason));
        }
    }

    /// Any → Stopped, handing back the channel for teardown.
    pub fn take(&mut self) -> Option<Arc<dyn Channel>> {
        self.set_status(ConnectionStatus::Stopped);
        self.channel.take()
    }

    /// The channel of `generation` died on its own. Running → Failed, but
    /// only if that channel is still the live one.
    pub fn lost(&mut self, generation: u64, reason: &StopReason) -> Option<Arc<dyn Channel>> {
        if generation != self.generation || !self.status.is_running() {
            return None;
        }
        let reason = match reason {
            StopReason::Exited => "language server exited".to_string(),
            StopReason::Failed(e) => e.clone(),
        };
        self.set_status(ConnectionStatus::Failed(reason));
        self.channel.take()
    }

    /// The live channel, or `NotConnected` unless Running.
    pub fn channel(&self) -> Result<Arc<dyn Channel>, ConnectionError> {
        match (&self.status, &self.channel) {
            (ConnectionStatus::Running, Some(channel)) => Ok(channel.clone()),
            _ => Err(ConnectionError::NotConnected),
        }
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        tracing::debug!(from = %self.status, to = %status, "Connection status");
        self.published.send_replace(status.to_server_status());
        self.status = status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedConnector;
    use crate::types::Health;

    async fn channel(connector: &ScriptedConnector) -> Arc<dyn Channel> {
        let (tx, _rx) = mpsc::channel(4);
        connector
            .connect(ConnectParams {
                server: ServerConfig {
                    command: "fake".into(),
                    args: vec![],
                    request_timeout_secs: 1,
                    shutdown_timeout_secs: 1,
                },
                folders: vec![],
                settings: SharedSettings::default(),
                events: EventSink::new(1, tx),
            })
            .await
            .unwrap()
    }

    #[test]
    fn channel_requires_running() {
        let mut conn = Connection::new();
        assert_eq!(conn.channel().err(), Some(ConnectionError::NotConnected));

        conn.begin_start();
        assert_eq!(conn.channel().err(), Some(ConnectionError::NotConnected));

        conn.failed("spawn failed".into());
        assert_eq!(conn.channel().err(), Some(ConnectionError::NotConnected));
    }

    #[tokio::test]
    async fn transitions_are_published() {
        let connector = ScriptedConnector::new();
        let mut conn = Connection::new();
        let status = conn.subscribe();

        let generation = conn.begin_start();
        assert_eq!(generation, 1);
        assert_eq!(status.borrow().health, Health::Starting);

        assert!(conn.established(channel(&connector).await).is_none());
        assert_eq!(status.borrow().health, Health::Running);
        assert!(conn.channel().is_ok());

        assert!(conn.take().is_some());
        assert_eq!(*conn.status(), ConnectionStatus::Stopped);
        assert_eq!(status.borrow().health, Health::Stopped);
        assert!(conn.take().is_none());
    }

    #[tokio::test]
    async fn loss_of_stale_generation_is_ignored() {
        let connector = ScriptedConnector::new();
        let mut conn = Connection::new();

        conn.begin_start();
        let _ = conn.established(channel(&connector).await);
        conn.take();
        let current = conn.begin_start();
        let _ = conn.established(channel(&connector).await);

        assert!(conn.lost(current - 1, &StopReason::Exited).is_none());
        assert!(conn.status().is_running());

        assert!(conn.lost(current, &StopReason::Exited).is_some());
        assert_eq!(
            *conn.status(),
            ConnectionStatus::Failed("language server exited".into())
        );
        assert_eq!(conn.subscribe().borrow().health, Health::Error);
    }

    #[tokio::test]
    async fn abort_during_start_settles_stopped() {
        let connector = ScriptedConnector::new();
        let mut conn = Connection::new();
        assert!(!conn.request_abort());

        conn.begin_start();
        assert!(conn.request_abort());
        let handed_back = conn.established(channel(&connector).await);
        assert!(handed_back.is_some());
        assert_eq!(*conn.status(), ConnectionStatus::Stopped);
        assert!(conn.channel().is_err());

        conn.begin_start();
        conn.request_abort();
        conn.failed("spawn failed".into());
        assert_eq!(*conn.status(), ConnectionStatus::Stopped);

        // A fresh attempt is not affected by an earlier abort.
        conn.begin_start();
        assert!(conn.established(channel(&connector).await).is_none());
        assert!(conn.status().is_running());
    }
}
