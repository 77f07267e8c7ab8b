//! Public types shared by the context, the connection and the host.
//!
//! The host observes [`ServerStatus`], reads [`DiagnosticRecord`]s through
//! the content provider, and never touches [`ServerEvent`] directly.

use std::fmt;

use serde::Serialize;

/// State of the connection to the language server.
///
/// Only the context makes transitions; start, stop and restart do so under
/// its transition lock.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Failed(String),
}

impl ConnectionStatus {
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Status object for host display.
    #[must_use]
    pub fn to_server_status(&self) -> ServerStatus {
        match self {
            Self::Stopped => ServerStatus::new(Health::Stopped, None),
            Self::Starting => ServerStatus::new(Health::Starting, None),
            Self::Running => ServerStatus::new(Health::Running, None),
            Self::Failed(reason) => ServerStatus::new(Health::Error, Some(reason.clone())),
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => f.write_str("stopped"),
            Self::Starting => f.write_str("starting"),
            Self::Running => f.write_str("running"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Stopped,
    Starting,
    Running,
    Error,
}

/// `{ health, reason? }` as surfaced to the host's status display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerStatus {
    pub health: Health,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ServerStatus {
    #[must_use]
    pub fn new(health: Health, reason: Option<String>) -> Self {
        Self { health, reason }
    }
}

impl Default for ServerStatus {
    fn default() -> Self {
        Self::new(Health::Stopped, None)
    }
}

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DiagnosticSeverity {
    Error = 1,
    Warning = 2,
    Information = 3,
    Hint = 4,
}

impl DiagnosticSeverity {
    /// Convert from LSP numeric severity (1=Error, 2=Warning, 3=Info, 4=Hint).
    #[must_use]
    pub fn from_lsp(value: u64) -> Option<Self> {
        match value {
            1 => Some(Self::Error),
            2 => Some(Self::Warning),
            3 => Some(Self::Information),
            4 => Some(Self::Hint),
            _ => None,
        }
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Information => "info",
            Self::Hint => "hint",
        }
    }
}

/// One finding pushed by the server for a resource.
///
/// Records are immutable once built; a new push for the same resource
/// replaces the whole batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticRecord {
    index: usize,
    severity: DiagnosticSeverity,
    message: String,
    /// Pre-rendered compiler output, when the server attached one.
    rendered: Option<String>,
    /// 0-indexed.
    line: u32,
    /// 0-indexed.
    col: u32,
}

impl DiagnosticRecord {
    #[must_use]
    pub fn new(
        index: usize,
        severity: DiagnosticSeverity,
        message: String,
        rendered: Option<String>,
        line: u32,
        col: u32,
    ) -> Self {
        Self {
            index,
            severity,
            message,
            rendered,
            line,
            col,
        }
    }

    /// Position of this record within its batch.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub fn severity(&self) -> DiagnosticSeverity {
        self.severity
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn rendered(&self) -> Option<&str> {
        self.rendered.as_deref()
    }

    #[must_use]
    pub fn line(&self) -> u32 {
        self.line
    }

    #[must_use]
    pub fn col(&self) -> u32 {
        self.col
    }
}

/// Why a connection's reader stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The server closed its output stream.
    Exited,
    Failed(String),
}

/// Event pushed by a live connection to its owning context.
///
/// `generation` identifies the connection that produced the event so that
/// late events from a torn-down connection can be discarded.
#[derive(Debug)]
pub struct ServerEvent {
    pub generation: u64,
    pub kind: ServerEventKind,
}

#[derive(Debug)]
pub enum ServerEventKind {
    Diagnostics {
        uri: String,
        records: Vec<DiagnosticRecord>,
    },
    Stopped(StopReason),
}
