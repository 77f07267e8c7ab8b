//! The client context: owns the connection, the diagnostics store and the
//! cleanup registry, and serializes every lifecycle transition.
//!
//! Start, stop, restart and dispose all run under one async transition
//! lock, so at most one connection is ever open and overlapping requests
//! resolve in arrival order. Requests and notifications never take that
//! lock; they clone the live channel and release every guard before
//! awaiting.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};

use crate::cleanup::{CleanupRegistry, CleanupToken, DrainReport};
use crate::config::{ClientConfig, ServerConfig};
use crate::connection::{ConnectParams, Connection, Connector, EventSink, SharedSettings};
use crate::diagnostics::DiagnosticsStore;
use crate::error::{ClientError, ConnectionError};
use crate::host::Host;
use crate::protocol;
use crate::types::{ConnectionStatus, DiagnosticRecord, ServerEvent, ServerEventKind, ServerStatus};

const EVENT_CHANNEL_CAPACITY: usize = 256;

pub struct Ctx {
    server: RwLock<ServerConfig>,
    settings: SharedSettings,
    folders: RwLock<Vec<PathBuf>>,
    host: Arc<dyn Host>,
    connector: Arc<dyn Connector>,
    connection: Mutex<Connection>,
    transition: tokio::sync::Mutex<()>,
    diagnostics: Mutex<DiagnosticsStore>,
    cleanup: CleanupRegistry,
    event_tx: mpsc::Sender<ServerEvent>,
    event_rx: Mutex<mpsc::Receiver<ServerEvent>>,
    disposed: AtomicBool,
}

impl std::fmt::Debug for Ctx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let connection = self.connection.lock();
        f.debug_struct("Ctx")
            .field("status", connection.status())
            .field("generation", &connection.generation())
            .field("folders", &*self.folders.read())
            .field("disposed", &self.disposed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Ctx {
    /// A stopped context. Nothing is spawned until [`Ctx::start`].
    #[must_use]
    pub fn new(
        config: ClientConfig,
        folders: Vec<PathBuf>,
        host: Arc<dyn Host>,
        connector: Arc<dyn Connector>,
    ) -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            server: RwLock::new(config.server),
            settings: Arc::new(RwLock::new(config.settings)),
            folders: RwLock::new(folders),
            host,
            connector,
            connection: Mutex::new(Connection::new()),
            transition: tokio::sync::Mutex::new(()),
            diagnostics: Mutex::new(DiagnosticsStore::new()),
            cleanup: CleanupRegistry::new(),
            event_tx,
            event_rx: Mutex::new(event_rx),
            disposed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.connection.lock().status().clone()
    }

    /// Status feed for the host's indicator. Every transition is published.
    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<ServerStatus> {
        self.connection.lock().subscribe()
    }

    #[must_use]
    pub fn host(&self) -> &Arc<dyn Host> {
        &self.host
    }

    #[must_use]
    pub fn folders(&self) -> Vec<PathBuf> {
        self.folders.read().clone()
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Start the server. A no-op when already running; fails fast with
    /// [`ClientError::AlreadyStarting`] while another start is in flight.
    pub async fn start(&self) -> Result<(), ClientError> {
        self.ensure_live()?;
        if matches!(self.connection.lock().status(), ConnectionStatus::Starting) {
            return Err(ClientError::AlreadyStarting);
        }
        let _transition = self.transition.lock().await;
        self.start_locked().await
    }

    /// Stop the server if one is running or starting. Never fails.
    ///
    /// A start in flight is not interrupted; it settles straight into
    /// Stopped and its connection is torn down before this returns.
    pub async fn stop(&self) {
        if self.connection.lock().request_abort() {
            tracing::info!("Stop requested while starting");
        }
        let _transition = self.transition.lock().await;
        self.stop_locked().await;
    }

    /// Stop, then start, as one transition.
    pub async fn restart(&self) -> Result<(), ClientError> {
        self.ensure_live()?;
        let _transition = self.transition.lock().await;
        self.stop_locked().await;
        self.start_locked().await
    }

    async fn start_locked(&self) -> Result<(), ClientError> {
        self.ensure_live()?;
        let generation = {
            let mut connection = self.connection.lock();
            if connection.status().is_running() {
                return Ok(());
            }
            connection.begin_start()
        };

        let params = ConnectParams {
            server: self.server.read().clone(),
            folders: self.folder_uris(),
            settings: self.settings.clone(),
            events: EventSink::new(generation, self.event_tx.clone()),
        };
        tracing::info!(generation, command = %params.server.command, "Starting language server");

        match self.connector.connect(params).await {
            Ok(channel) => {
                let aborted = self.connection.lock().established(channel);
                if let Some(channel) = aborted {
                    tracing::info!(generation, "Start superseded by stop; tearing down");
                    channel.shutdown().await;
                } else {
                    tracing::info!(generation, "Language server running");
                }
                Ok(())
            }
            Err(e) => {
                let reason = format!("{e:#}");
                tracing::warn!(generation, "Language server failed to start: {reason}");
                self.connection.lock().failed(reason.clone());
                self.host
                    .show_error(&format!("Failed to start the language server: {reason}"));
                Err(ClientError::StartFailed(reason))
            }
        }
    }

    async fn stop_locked(&self) {
        let channel = self.connection.lock().take();
        if let Some(channel) = channel {
            tracing::info!("Stopping language server");
            channel.shutdown().await;
        }
    }

    /// Replace the workspace folders. A running (or starting) server is
    /// restarted so it sees the new set; otherwise the folders are used by
    /// the next start.
    pub async fn on_workspace_folders_changed(
        &self,
        folders: Vec<PathBuf>,
    ) -> Result<(), ClientError> {
        *self.folders.write() = folders;
        let status = self.status();
        if matches!(status, ConnectionStatus::Running | ConnectionStatus::Starting) {
            tracing::info!("Workspace folders changed; restarting");
            self.restart().await
        } else {
            tracing::debug!(%status, "Workspace folders changed; server not running");
            Ok(())
        }
    }

    /// Apply reloaded configuration. Settings take effect immediately and
    /// the server is told to pull them; a changed launch line only applies
    /// on the next start.
    pub async fn on_configuration_changed(
        &self,
        config: Option<ClientConfig>,
    ) -> Result<(), ClientError> {
        if let Some(config) = config {
            let needs_restart = self.server.read().requires_restart(&config.server);
            *self.server.write() = config.server;
            *self.settings.write() = config.settings;
            if needs_restart && self.status().is_running() {
                self.host.show_info(
                    "Language server launch settings changed; run `restartServer` to apply them.",
                );
            }
        }

        if !self.status().is_running() {
            return Ok(());
        }
        if let Err(e) = self
            .send_notification(
                "workspace/didChangeConfiguration",
                Some(protocol::did_change_configuration_params()),
            )
            .await
        {
            tracing::warn!("Configuration change not delivered: {e}");
        }
        Ok(())
    }

    pub async fn send_request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, ConnectionError> {
        let channel = self.connection.lock().channel()?;
        channel.request(method, params).await
    }

    pub async fn send_notification(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), ConnectionError> {
        let channel = self.connection.lock().channel()?;
        channel.notify(method, params).await
    }

    /// Apply up to `budget` queued server events. Returns how many were
    /// handled.
    pub fn poll_events(&self, budget: usize) -> usize {
        let mut handled = 0;
        while handled < budget {
            let event = match self.event_rx.lock().try_recv() {
                Ok(event) => event,
                Err(_) => break,
            };
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    fn handle_event(&self, event: ServerEvent) {
        let ServerEvent { generation, kind } = event;
        match kind {
            ServerEventKind::Diagnostics { uri, records } => {
                if generation != self.connection.lock().generation() {
                    tracing::debug!(generation, %uri, "Dropping diagnostics from stale connection");
                    return;
                }
                self.put_diagnostics(uri, records);
            }
            ServerEventKind::Stopped(reason) => {
                let lost = self.connection.lock().lost(generation, &reason);
                let Some(channel) = lost else {
                    tracing::debug!(generation, ?reason, "Stale connection stopped");
                    return;
                };
                drop(channel);
                let status = self.status();
                tracing::warn!(generation, %status, "Language server connection lost");
                self.host.show_error(&format!("Language server {status}"));
            }
        }
    }

    pub(crate) fn put_diagnostics(&self, uri: String, records: Vec<DiagnosticRecord>) {
        tracing::debug!(%uri, count = records.len(), "Diagnostics updated");
        self.diagnostics.lock().put(uri, records);
    }

    /// Current batch for `uri`, empty if none.
    #[must_use]
    pub fn diagnostics(&self, uri: &str) -> Vec<DiagnosticRecord> {
        self.diagnostics
            .lock()
            .get(uri)
            .map(<[DiagnosticRecord]>::to_vec)
            .unwrap_or_default()
    }

    #[must_use]
    pub fn rendered_diagnostic(&self, uri: &str, index: usize) -> Option<String> {
        self.diagnostics
            .lock()
            .rendered(uri, index)
            .map(str::to_string)
    }

    pub fn clear_diagnostics(&self) {
        let mut store = self.diagnostics.lock();
        tracing::debug!(resources = store.resource_count(), "Clearing diagnostics");
        store.clear();
    }

    /// Register a teardown action, run on [`Ctx::dispose`] unless disposed
    /// earlier through the returned token.
    pub fn register_cleanup<F>(&self, action: F) -> CleanupToken
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.cleanup.register(action)
    }

    /// Stop the server and run every registered cleanup once. Later calls
    /// are no-ops returning an empty report.
    pub async fn dispose(&self) -> DrainReport {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return DrainReport::default();
        }
        self.connection.lock().request_abort();
        let _transition = self.transition.lock().await;
        self.stop_locked().await;
        let report = self.cleanup.drain();
        tracing::info!(
            ran = report.ran,
            failed = report.failures.len(),
            "Client disposed"
        );
        report
    }

    fn ensure_live(&self) -> Result<(), ClientError> {
        if self.is_disposed() {
            Err(ClientError::Disposed)
        } else {
            Ok(())
        }
    }

    fn folder_uris(&self) -> Vec<url::Url> {
        self.folders
            .read()
            .iter()
            .filter_map(|path| match protocol::path_to_file_uri(path) {
                Ok(uri) => Some(uri),
                Err(e) => {
                    tracing::warn!("Skipping workspace folder: {e}");
                    None
                }
            })
            .collect()
    }
}
