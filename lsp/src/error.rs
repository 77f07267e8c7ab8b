//! Error taxonomy for the client layer.
//!
//! [`ConnectionError`] covers the wire; [`ClientError`] covers lifecycle,
//! dispatch and startup validation. Transport internals use `anyhow` and are flattened into
//! strings at this boundary.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("no active connection to the language server")]
    NotConnected,
    #[error("connection closed while awaiting a response to `{method}`")]
    Closed { method: String },
    #[error("request `{method}` timed out")]
    Timeout { method: String },
    #[error("server error {code}: {message}")]
    Server { code: i64, message: String },
    #[error("transport failure: {0}")]
    Transport(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("the language server is already starting")]
    AlreadyStarting,
    #[error("failed to start the language server: {0}")]
    StartFailed(String),
    #[error("the client has been disposed")]
    Disposed,
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Disagreement between the command table and the host's declared commands.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "command table mismatch: declared but unregistered {unregistered:?}, registered but undeclared {undeclared:?}"
)]
pub struct RegistryError {
    pub unregistered: Vec<String>,
    pub undeclared: Vec<String>,
}

impl ClientError {
    /// Whether this is the "not connected" condition that callers may choose
    /// to absorb.
    #[must_use]
    pub fn is_not_connected(&self) -> bool {
        matches!(self, Self::Connection(ConnectionError::NotConnected))
    }
}
