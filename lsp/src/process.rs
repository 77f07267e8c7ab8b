//! Stdio transport: a language server child process speaking framed
//! JSON-RPC on stdin/stdout.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::codec::{FrameReader, FrameWriter};
use crate::connection::{Channel, ConnectParams, Connector, EventSink, SharedSettings};
use crate::error::ConnectionError;
use crate::protocol::{self, Incoming, Notification, PublishDiagnosticsParams, Request};
use crate::types::StopReason;

const WRITER_CHANNEL_CAPACITY: usize = 64;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<serde_json::Value>>>>;

enum WriterCommand {
    Send(serde_json::Value),
    Shutdown,
}

/// Spawns the configured server binary for every connection attempt.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessConnector;

#[async_trait]
impl Connector for ProcessConnector {
    async fn connect(&self, params: ConnectParams) -> Result<Arc<dyn Channel>> {
        let channel = StdioChannel::spawn(params).await?;
        Ok(Arc::new(channel))
    }
}

struct StdioChannel {
    command: String,
    child: tokio::sync::Mutex<Child>,
    writer_tx: mpsc::Sender<WriterCommand>,
    next_id: AtomicU64,
    pending: PendingMap,
    request_timeout: Duration,
    shutdown_timeout: Duration,
    tasks: Vec<JoinHandle<()>>,
}

impl StdioChannel {
    async fn spawn(params: ConnectParams) -> Result<Self> {
        let ConnectParams {
            server,
            folders,
            settings,
            events,
        } = params;

        let resolved = which::which(&server.command)
            .with_context(|| format!("{} not found in PATH", server.command))?;
        let mut child = Command::new(&resolved)
            .args(&server.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning {}", server.command))?;

        let stdin = child.stdin.take().context("no stdin from child")?;
        let stdout = child.stdout.take().context("no stdout from child")?;
        let stderr = child.stderr.take().context("no stderr from child")?;

        let pending = PendingMap::default();
        let (writer_tx, writer_rx) = mpsc::channel(WRITER_CHANNEL_CAPACITY);

        let tasks = vec![
            tokio::spawn(write_loop(FrameWriter::new(stdin), writer_rx)),
            tokio::spawn(read_loop(
                FrameReader::new(stdout),
                pending.clone(),
                writer_tx.clone(),
                settings,
                events,
            )),
            tokio::spawn(forward_stderr(server.command.clone(), stderr)),
        ];

        let channel = Self {
            command: server.command.clone(),
            child: tokio::sync::Mutex::new(child),
            writer_tx,
            next_id: AtomicU64::new(1),
            pending,
            request_timeout: server.request_timeout(),
            shutdown_timeout: server.shutdown_timeout(),
            tasks,
        };

        // On failure `channel` drops here, which kills the child.
        channel.initialize(&folders).await?;
        tracing::info!(command = %channel.command, "Language server initialized");
        Ok(channel)
    }

    async fn initialize(&self, folders: &[url::Url]) -> Result<()> {
        let capabilities = self
            .request("initialize", Some(protocol::initialize_params(folders)))
            .await;
        if let Err(e) = capabilities {
            bail!("initialize handshake failed: {e}");
        }
        self.notify("initialized", Some(serde_json::json!({})))
            .await
            .context("sending initialized")?;
        Ok(())
    }

    async fn enqueue(&self, frame: serde_json::Value) -> Result<(), ConnectionError> {
        self.writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .map_err(|_| ConnectionError::Transport("writer channel closed".into()))
    }
}

#[async_trait]
impl Channel for StdioChannel {
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, ConnectionError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = serde_json::to_value(Request::new(id, method, params))
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        if let Err(e) = self.enqueue(frame).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(body)) => protocol::into_result(body),
            Ok(Err(_)) => Err(ConnectionError::Closed {
                method: method.to_string(),
            }),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(ConnectionError::Timeout {
                    method: method.to_string(),
                })
            }
        }
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), ConnectionError> {
        let frame = serde_json::to_value(Notification::new(method, params))
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;
        self.enqueue(frame).await
    }

    async fn shutdown(&self) {
        match tokio::time::timeout(self.shutdown_timeout, self.request("shutdown", None)).await {
            Ok(Ok(_)) => {
                let _ = self.notify("exit", None).await;
            }
            Ok(Err(e)) => tracing::debug!(command = %self.command, "shutdown request failed: {e}"),
            Err(_) => tracing::debug!(command = %self.command, "shutdown request timed out"),
        }
        let _ = self.writer_tx.send(WriterCommand::Shutdown).await;

        let mut child = self.child.lock().await;
        if tokio::time::timeout(self.shutdown_timeout, child.wait())
            .await
            .is_err()
        {
            tracing::debug!(command = %self.command, "Language server didn't exit in time, killing");
            let _ = child.kill().await;
        }
    }
}

impl Drop for StdioChannel {
    fn drop(&mut self) {
        // Reader must not report the death of a channel nobody owns anymore.
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn write_loop<W>(mut writer: FrameWriter<W>, mut rx: mpsc::Receiver<WriterCommand>)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(command) = rx.recv().await {
        match command {
            WriterCommand::Send(frame) => {
                if let Err(e) = writer.write_frame(&frame).await {
                    tracing::warn!("Language server write error: {e}");
                    break;
                }
            }
            WriterCommand::Shutdown => break,
        }
    }
}

async fn read_loop<R>(
    mut reader: FrameReader<R>,
    pending: PendingMap,
    writer_tx: mpsc::Sender<WriterCommand>,
    settings: SharedSettings,
    events: EventSink,
) where
    R: AsyncRead + Unpin,
{
    let reason = loop {
        match reader.read_frame().await {
            Ok(Some(frame)) => dispatch(frame, &pending, &writer_tx, &settings, &events).await,
            Ok(None) => break StopReason::Exited,
            Err(e) => break StopReason::Failed(e.to_string()),
        }
    };
    tracing::info!(generation = events.generation(), ?reason, "Language server reader stopped");
    // Wake every in-flight request with a closed channel.
    pending.lock().clear();
    events.stopped(reason).await;
}

async fn dispatch(
    frame: serde_json::Value,
    pending: &PendingMap,
    writer_tx: &mpsc::Sender<WriterCommand>,
    settings: &SharedSettings,
    events: &EventSink,
) {
    let Some(incoming) = protocol::classify(frame) else {
        tracing::trace!("Ignoring malformed JSON-RPC frame");
        return;
    };

    match incoming {
        Incoming::Response { id, body } => {
            let waiter = pending.lock().remove(&id);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(body);
                }
                None => tracing::trace!(id, "Response for unknown request"),
            }
        }
        Incoming::Request { id, method, params } => {
            let reply = if method == "workspace/configuration" {
                let result = protocol::configuration_result(&settings.read(), params.as_ref());
                protocol::response(&id, result)
            } else {
                tracing::debug!("Server sent request {method}; replying method not found");
                protocol::error_response(
                    &id,
                    protocol::METHOD_NOT_FOUND,
                    format!("Method not found: {method}"),
                )
            };
            let _ = writer_tx.send(WriterCommand::Send(reply)).await;
        }
        Incoming::Notification { method, params } => {
            if method != "textDocument/publishDiagnostics" {
                tracing::trace!("Ignoring notification {method}");
                return;
            }
            let Some(params) = params else { return };
            match serde_json::from_value::<PublishDiagnosticsParams>(params) {
                Ok(params) => {
                    let (uri, records) = params.into_records();
                    events.diagnostics(uri, records).await;
                }
                Err(e) => tracing::debug!("Failed to parse publishDiagnostics: {e}"),
            }
        }
    }
}

async fn forward_stderr<R>(command: String, stderr: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(target: "anvil_lsp::server_stderr", %command, "{line}");
    }
}
