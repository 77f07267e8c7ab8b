//! In-memory connector and host for exercising the context without a
//! server process.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::{ClientConfig, ServerConfig};
use crate::connection::{Channel, ConnectParams, Connector, EventSink};
use crate::content::ContentProvider;
use crate::ctx::Ctx;
use crate::error::ConnectionError;
use crate::host::Host;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SentKind {
    Request,
    Notification,
}

#[derive(Default)]
struct Script {
    connects: usize,
    open: usize,
    max_open: usize,
    fail_next: Option<String>,
    notify_error: Option<ConnectionError>,
    responses: HashMap<String, serde_json::Value>,
    sent: Vec<(SentKind, String, Option<serde_json::Value>)>,
    sink: Option<EventSink>,
    folders: Vec<url::Url>,
}

/// Connector whose channels answer from a canned response table and count
/// how many are open at once.
#[derive(Clone, Default)]
pub(crate) struct ScriptedConnector {
    script: Arc<Mutex<Script>>,
    delay: Option<Duration>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Make the next connection attempt fail with `reason`.
    pub fn fail_next(&self, reason: &str) {
        self.script.lock().fail_next = Some(reason.to_string());
    }

    /// Make every later notification on any channel fail with `error`.
    pub fn fail_notifications(&self, error: ConnectionError) {
        self.script.lock().notify_error = Some(error);
    }

    pub fn respond(&self, method: &str, result: serde_json::Value) {
        self.script
            .lock()
            .responses
            .insert(method.to_string(), result);
    }

    pub fn connects(&self) -> usize {
        self.script.lock().connects
    }

    pub fn open_channels(&self) -> usize {
        self.script.lock().open
    }

    pub fn max_open(&self) -> usize {
        self.script.lock().max_open
    }

    /// Event sink handed to the most recent connection.
    pub fn sink(&self) -> Option<EventSink> {
        self.script.lock().sink.clone()
    }

    /// Workspace folders handed to the most recent connection.
    pub fn last_folders(&self) -> Vec<url::Url> {
        self.script.lock().folders.clone()
    }

    pub fn sent(&self) -> Vec<(String, Option<serde_json::Value>)> {
        self.script
            .lock()
            .sent
            .iter()
            .map(|(_, method, params)| (method.clone(), params.clone()))
            .collect()
    }

    pub fn requests(&self) -> Vec<String> {
        self.methods(SentKind::Request)
    }

    pub fn notifications(&self) -> Vec<String> {
        self.methods(SentKind::Notification)
    }

    fn methods(&self, kind: SentKind) -> Vec<String> {
        self.script
            .lock()
            .sent
            .iter()
            .filter(|(k, _, _)| *k == kind)
            .map(|(_, method, _)| method.clone())
            .collect()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, params: ConnectParams) -> anyhow::Result<Arc<dyn Channel>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let mut script = self.script.lock();
        script.connects += 1;
        if let Some(reason) = script.fail_next.take() {
            anyhow::bail!(reason);
        }
        script.open += 1;
        script.max_open = script.max_open.max(script.open);
        script.sink = Some(params.events);
        script.folders = params.folders;
        drop(script);

        Ok(Arc::new(FakeChannel {
            script: self.script.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct FakeChannel {
    script: Arc<Mutex<Script>>,
    closed: AtomicBool,
}

impl FakeChannel {
    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.script.lock().open -= 1;
        }
    }

    fn check_open(&self, method: &str) -> Result<(), ConnectionError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(ConnectionError::Closed {
                method: method.to_string(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Channel for FakeChannel {
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, ConnectionError> {
        self.check_open(method)?;
        let mut script = self.script.lock();
        script
            .sent
            .push((SentKind::Request, method.to_string(), params));
        Ok(script
            .responses
            .get(method)
            .cloned()
            .unwrap_or(serde_json::Value::Null))
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), ConnectionError> {
        self.check_open(method)?;
        let mut script = self.script.lock();
        if let Some(error) = script.notify_error.clone() {
            return Err(error);
        }
        script
            .sent
            .push((SentKind::Notification, method.to_string(), params));
        Ok(())
    }

    async fn shutdown(&self) {
        self.close();
    }
}

impl Drop for FakeChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Host that records everything it is asked to do.
#[derive(Default)]
pub(crate) struct RecordingHost {
    infos: Mutex<Vec<String>>,
    errors: Mutex<Vec<String>>,
    locations: Mutex<Vec<serde_json::Value>>,
    edits: Mutex<Vec<serde_json::Value>>,
    builtins: Mutex<Vec<String>>,
    commands: Mutex<Vec<&'static str>>,
    providers: Mutex<HashMap<String, ContentProvider>>,
    declared: Option<Vec<String>>,
}

impl RecordingHost {
    pub fn declaring(names: Vec<String>) -> Self {
        Self {
            declared: Some(names),
            ..Self::default()
        }
    }

    pub fn infos(&self) -> Vec<String> {
        self.infos.lock().clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }

    pub fn locations(&self) -> Vec<serde_json::Value> {
        self.locations.lock().clone()
    }

    pub fn edits(&self) -> Vec<serde_json::Value> {
        self.edits.lock().clone()
    }

    pub fn builtins(&self) -> Vec<String> {
        self.builtins.lock().clone()
    }

    pub fn commands(&self) -> Vec<&'static str> {
        self.commands.lock().clone()
    }

    pub fn provider(&self, scheme: &str) -> Option<ContentProvider> {
        self.providers.lock().get(scheme).cloned()
    }
}

impl Host for RecordingHost {
    fn show_info(&self, message: &str) {
        self.infos.lock().push(message.to_string());
    }

    fn show_error(&self, message: &str) {
        self.errors.lock().push(message.to_string());
    }

    fn declared_commands(&self) -> Option<Vec<String>> {
        self.declared.clone()
    }

    fn register_commands(&self, names: &[&'static str]) {
        self.commands.lock().extend_from_slice(names);
    }

    fn unregister_commands(&self, names: &[&'static str]) {
        self.commands.lock().retain(|n| !names.contains(n));
    }

    fn register_content_provider(&self, scheme: &str, provider: ContentProvider) {
        self.providers.lock().insert(scheme.to_string(), provider);
    }

    fn unregister_content_provider(&self, scheme: &str) {
        self.providers.lock().remove(scheme);
    }

    fn open_location(&self, location: &serde_json::Value) {
        self.locations.lock().push(location.clone());
    }

    fn apply_workspace_edit(&self, edit: &serde_json::Value) {
        self.edits.lock().push(edit.clone());
    }

    fn run_builtin(&self, command: &str, _args: &[serde_json::Value]) {
        self.builtins.lock().push(command.to_string());
    }
}

pub(crate) fn test_config() -> ClientConfig {
    ClientConfig {
        server: ServerConfig {
            command: "rust-analyzer".into(),
            args: vec![],
            request_timeout_secs: 5,
            shutdown_timeout_secs: 1,
        },
        settings: serde_json::json!({}),
    }
}

pub(crate) fn test_ctx(connector: ScriptedConnector) -> Arc<Ctx> {
    test_ctx_with_host(connector).0
}

pub(crate) fn test_ctx_with_host(connector: ScriptedConnector) -> (Arc<Ctx>, Arc<RecordingHost>) {
    let host = Arc::new(RecordingHost::default());
    let ctx = Ctx::new(
        test_config(),
        vec![PathBuf::from("/work/anvil")],
        host.clone(),
        Arc::new(connector),
    );
    (ctx, host)
}
