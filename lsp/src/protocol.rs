//! JSON-RPC message shapes and the handful of LSP payloads the client
//! builds or consumes.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConnectionError;
use crate::types::{DiagnosticRecord, DiagnosticSeverity};

pub(crate) const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, thiserror::Error)]
#[error("cannot convert path to file URI: {}", path.display())]
pub struct PathToUriError {
    path: PathBuf,
}

#[derive(Debug, Serialize)]
pub(crate) struct Request<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl<'a> Request<'a> {
    pub fn new(id: u64, method: &'a str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Notification<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl<'a> Notification<'a> {
    pub fn new(method: &'a str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
        }
    }
}

/// Reply to a server-initiated request.
pub(crate) fn response(id: &serde_json::Value, result: serde_json::Value) -> serde_json::Value {
    serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

pub(crate) fn error_response(
    id: &serde_json::Value,
    code: i64,
    message: String,
) -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message }
    })
}

/// A frame read from the server, classified by shape.
#[derive(Debug)]
pub(crate) enum Incoming {
    Response {
        id: u64,
        body: serde_json::Value,
    },
    Request {
        id: serde_json::Value,
        method: String,
        params: Option<serde_json::Value>,
    },
    Notification {
        method: String,
        params: Option<serde_json::Value>,
    },
}

pub(crate) fn classify(frame: serde_json::Value) -> Option<Incoming> {
    let serde_json::Value::Object(mut map) = frame else {
        return None;
    };
    let method = match map.remove("method") {
        Some(serde_json::Value::String(method)) => Some(method),
        _ => None,
    };
    let id = map.remove("id");
    let params = map.remove("params");
    let is_reply = map.contains_key("result") || map.contains_key("error");

    match (id, method) {
        (Some(id), None) if is_reply => {
            let id = id.as_u64()?;
            Some(Incoming::Response {
                id,
                body: serde_json::Value::Object(map),
            })
        }
        (Some(id), Some(method)) => Some(Incoming::Request { id, method, params }),
        (None, Some(method)) => Some(Incoming::Notification { method, params }),
        _ => None,
    }
}

/// Unwrap a response body into its `result`, mapping a JSON-RPC `error`
/// member to [`ConnectionError::Server`].
pub(crate) fn into_result(body: serde_json::Value) -> Result<serde_json::Value, ConnectionError> {
    if let Some(error) = body.get("error") {
        return Err(ConnectionError::Server {
            code: error["code"].as_i64().unwrap_or_default(),
            message: error["message"]
                .as_str()
                .unwrap_or("unknown error")
                .to_string(),
        });
    }
    Ok(body.get("result").cloned().unwrap_or(serde_json::Value::Null))
}

pub(crate) fn initialize_params(folders: &[url::Url]) -> serde_json::Value {
    let workspace_folders: Vec<serde_json::Value> = folders
        .iter()
        .map(|uri| {
            let name = uri
                .path_segments()
                .and_then(|mut segments| segments.rfind(|s| !s.is_empty()))
                .unwrap_or("workspace");
            serde_json::json!({ "uri": uri.as_str(), "name": name })
        })
        .collect();

    serde_json::json!({
        "processId": std::process::id(),
        "rootUri": folders.first().map(url::Url::as_str),
        "capabilities": {
            "workspace": {
                "configuration": true,
                "didChangeConfiguration": { "dynamicRegistration": false },
                "workspaceFolders": true
            },
            "textDocument": {
                "publishDiagnostics": { "relatedInformation": false }
            }
        },
        "workspaceFolders": workspace_folders
    })
}

/// The server is expected to pull fresh values via `workspace/configuration`.
pub(crate) fn did_change_configuration_params() -> serde_json::Value {
    serde_json::json!({ "settings": {} })
}

/// Answer a `workspace/configuration` pull: one entry per requested item,
/// resolving dotted `section` names against `settings`.
pub(crate) fn configuration_result(
    settings: &serde_json::Value,
    params: Option<&serde_json::Value>,
) -> serde_json::Value {
    let items = params
        .and_then(|p| p.get("items"))
        .and_then(serde_json::Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let values = items
        .iter()
        .map(|item| match item.get("section").and_then(|s| s.as_str()) {
            Some(section) => section
                .split('.')
                .try_fold(settings, |value, key| value.get(key))
                .cloned()
                .unwrap_or(serde_json::Value::Null),
            None => settings.clone(),
        })
        .collect();
    serde_json::Value::Array(values)
}

#[derive(Debug, Deserialize)]
pub(crate) struct PublishDiagnosticsParams {
    pub uri: String,
    pub diagnostics: Vec<LspDiagnostic>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LspDiagnostic {
    pub range: LspRange,
    pub severity: Option<u64>,
    pub message: String,
    /// Server-defined; only a string `rendered` member is read.
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LspRange {
    pub start: LspPosition,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LspPosition {
    pub line: u32,
    pub character: u32,
}

impl LspDiagnostic {
    pub fn into_record(self, index: usize) -> DiagnosticRecord {
        DiagnosticRecord::new(
            index,
            self.severity
                .and_then(DiagnosticSeverity::from_lsp)
                .unwrap_or(DiagnosticSeverity::Warning),
            self.message,
            self.data
                .as_ref()
                .and_then(|d| d.get("rendered"))
                .and_then(serde_json::Value::as_str)
                .map(str::to_string),
            self.range.start.line,
            self.range.start.character,
        )
    }
}

impl PublishDiagnosticsParams {
    /// Records in server order, indexed by position.
    pub fn into_records(self) -> (String, Vec<DiagnosticRecord>) {
        let records = self
            .diagnostics
            .into_iter()
            .enumerate()
            .map(|(index, diag)| diag.into_record(index))
            .collect();
        (self.uri, records)
    }
}

pub fn path_to_file_uri(path: &Path) -> Result<url::Url, PathToUriError> {
    url::Url::from_directory_path(path).map_err(|()| PathToUriError {
        path: path.to_path_buf(),
    })
}
