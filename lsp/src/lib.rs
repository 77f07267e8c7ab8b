//! Language server client: connection lifecycle, command dispatch and
//! diagnostic documents for an editor host.
//!
//! [`init`] builds a [`Session`] for a host, registers its commands and the
//! diagnostics content provider, and starts the server. [`teardown`] undoes
//! all of it.

pub mod cleanup;
pub mod codec;
pub mod commands;
pub mod config;
pub mod connection;
pub mod content;
pub mod ctx;
pub mod error;
pub mod host;
pub mod process;
pub mod types;

pub(crate) mod diagnostics;
pub(crate) mod protocol;

#[cfg(test)]
pub(crate) mod testing;

use std::path::PathBuf;
use std::sync::Arc;

pub use cleanup::{CleanupRegistry, CleanupToken, DrainReport};
pub use commands::{Behavior, CommandEntry, CommandKind, CommandRegistry};
pub use config::{ClientConfig, ConfigError, ServerConfig};
pub use connection::{Channel, ConnectParams, Connector, EventSink};
pub use content::{ContentProvider, DIAGNOSTICS_SCHEME, DiagnosticUri, FALLBACK_TEXT};
pub use ctx::Ctx;
pub use error::{ClientError, ConnectionError, RegistryError};
pub use host::Host;
pub use process::ProcessConnector;
pub use types::{
    ConnectionStatus, DiagnosticRecord, DiagnosticSeverity, Health, ServerStatus, StopReason,
};

/// Everything a host holds between [`init`] and [`teardown`].
#[derive(Debug)]
pub struct Session {
    ctx: Arc<Ctx>,
    commands: CommandRegistry,
    content: ContentProvider,
}

impl Session {
    #[must_use]
    pub fn ctx(&self) -> &Arc<Ctx> {
        &self.ctx
    }

    #[must_use]
    pub fn commands(&self) -> &CommandRegistry {
        &self.commands
    }

    pub async fn dispatch(
        &self,
        name: &str,
        args: &[serde_json::Value],
    ) -> Result<Option<serde_json::Value>, ClientError> {
        self.commands.dispatch(&self.ctx, name, args).await
    }

    /// Text of a diagnostics virtual document.
    #[must_use]
    pub fn read_document(&self, uri: &str) -> String {
        self.content.provide_str(uri)
    }
}

/// Activate the client for `host`.
///
/// The command table is checked against the host's declared commands
/// first; a mismatch fails activation before anything is registered. A
/// server that fails to start also fails activation, after the failure has
/// been shown to the user and everything registered so far is undone.
pub async fn init(
    config: ClientConfig,
    folders: Vec<PathBuf>,
    host: Arc<dyn Host>,
    connector: Arc<dyn Connector>,
) -> Result<Session, ClientError> {
    let commands = CommandRegistry::new();
    if let Some(declared) = host.declared_commands()
        && let Err(e) = commands.validate(declared.as_slice())
    {
        tracing::error!("{e}");
        host.show_error(&format!("Activation failed: {e}"));
        return Err(e.into());
    }

    let ctx = Ctx::new(config, folders, host.clone(), connector);

    let names = commands.names();
    host.register_commands(&names);
    ctx.register_cleanup({
        let host = host.clone();
        move || {
            host.unregister_commands(&names);
            Ok(())
        }
    });

    let content = ContentProvider::new(&ctx);
    host.register_content_provider(DIAGNOSTICS_SCHEME, content.clone());
    ctx.register_cleanup({
        let host = host.clone();
        move || {
            host.unregister_content_provider(DIAGNOSTICS_SCHEME);
            Ok(())
        }
    });

    if let Err(e) = ctx.start().await {
        let report = ctx.dispose().await;
        tracing::debug!(ran = report.ran, "Activation rolled back");
        return Err(e);
    }

    Ok(Session {
        ctx,
        commands,
        content,
    })
}

/// Stop the server and run every registered cleanup.
pub async fn teardown(session: Session) -> DrainReport {
    session.ctx.dispose().await
}
