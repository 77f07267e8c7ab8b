//! Command registry.
//!
//! The table is plain data: each entry names a behavior for when the server
//! is running and one for when it is not. Which one runs is decided at
//! invocation time from the context's current status, never at
//! registration time.

use std::collections::{BTreeSet, HashMap};

use crate::ctx::Ctx;
use crate::error::{ClientError, RegistryError};
use crate::types::ConnectionStatus;

const ALREADY_STARTING: &str = "The language server is already starting.";
const NOT_RUNNING: &str = "The language server is not running. Run `startServer` to start it.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Invoked by the user.
    User,
    /// Invoked by the server through code actions, lenses and the like.
    /// Only the connected behavior is meaningful.
    Internal,
    /// Start/stop/restart; same behavior in every state.
    Lifecycle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Start,
    Stop,
    Restart,
    /// Send a request with the first argument as params; the result is the
    /// command's output.
    Request(&'static str),
    Notify(&'static str),
    /// Hand the first argument (a location or list of locations) to the host.
    ShowLocation,
    /// Hand the first argument (a workspace edit) to the host.
    ApplyEdit,
    /// `codeAction/resolve` the first argument, then apply its edit.
    ResolveCodeAction,
    ClearDiagnostics,
    /// Tell the user something, typically that the server is not running.
    Inform(&'static str),
    /// Fall back to one of the editor's own commands.
    Builtin(&'static str),
    Noop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandEntry {
    pub name: &'static str,
    pub kind: CommandKind,
    pub enabled: Behavior,
    pub disabled: Behavior,
}

impl CommandEntry {
    const fn user(name: &'static str, enabled: Behavior, disabled: Behavior) -> Self {
        Self {
            name,
            kind: CommandKind::User,
            enabled,
            disabled,
        }
    }

    const fn internal(name: &'static str, enabled: Behavior) -> Self {
        Self {
            name,
            kind: CommandKind::Internal,
            enabled,
            disabled: Behavior::Noop,
        }
    }

    const fn lifecycle(name: &'static str, behavior: Behavior) -> Self {
        Self {
            name,
            kind: CommandKind::Lifecycle,
            enabled: behavior,
            disabled: behavior,
        }
    }

    /// Behavior for `status`.
    #[must_use]
    pub fn resolve(&self, status: &ConnectionStatus) -> Behavior {
        if status.is_running() {
            self.enabled
        } else {
            self.disabled
        }
    }
}

const INFORM: Behavior = Behavior::Inform(NOT_RUNNING);

pub static COMMANDS: &[CommandEntry] = &[
    CommandEntry::user(
        "analyzerStatus",
        Behavior::Request("rust-analyzer/analyzerStatus"),
        INFORM,
    ),
    CommandEntry::user(
        "memoryUsage",
        Behavior::Request("rust-analyzer/memoryUsage"),
        INFORM,
    ),
    CommandEntry::user(
        "reloadWorkspace",
        Behavior::Request("rust-analyzer/reloadWorkspace"),
        Behavior::Start,
    ),
    CommandEntry::user(
        "rebuildProcMacros",
        Behavior::Request("rust-analyzer/rebuildProcMacros"),
        Behavior::Start,
    ),
    CommandEntry::user(
        "viewSyntaxTree",
        Behavior::Request("rust-analyzer/viewSyntaxTree"),
        INFORM,
    ),
    CommandEntry::user(
        "expandMacro",
        Behavior::Request("rust-analyzer/expandMacro"),
        INFORM,
    ),
    CommandEntry::user(
        "parentModule",
        Behavior::Request("experimental/parentModule"),
        INFORM,
    ),
    CommandEntry::user("ssr", Behavior::Request("experimental/ssr"), INFORM),
    CommandEntry::user(
        "openDocs",
        Behavior::Request("experimental/externalDocs"),
        INFORM,
    ),
    CommandEntry::user(
        "joinLines",
        Behavior::Request("experimental/joinLines"),
        Behavior::Noop,
    ),
    CommandEntry::user(
        "matchingBrace",
        Behavior::Request("experimental/matchingBrace"),
        Behavior::Noop,
    ),
    CommandEntry::user(
        "onEnter",
        Behavior::Request("experimental/onEnter"),
        Behavior::Builtin("type"),
    ),
    CommandEntry::user(
        "runFlycheck",
        Behavior::Notify("rust-analyzer/runFlycheck"),
        INFORM,
    ),
    CommandEntry::user(
        "cancelFlycheck",
        Behavior::Notify("rust-analyzer/cancelFlycheck"),
        Behavior::Noop,
    ),
    CommandEntry::user(
        "clearDiagnostics",
        Behavior::ClearDiagnostics,
        Behavior::ClearDiagnostics,
    ),
    CommandEntry::internal("showReferences", Behavior::ShowLocation),
    CommandEntry::internal("gotoLocation", Behavior::ShowLocation),
    CommandEntry::internal("resolveCodeAction", Behavior::ResolveCodeAction),
    CommandEntry::internal("applySnippetWorkspaceEdit", Behavior::ApplyEdit),
    CommandEntry::lifecycle("startServer", Behavior::Start),
    CommandEntry::lifecycle("stopServer", Behavior::Stop),
    CommandEntry::lifecycle("restartServer", Behavior::Restart),
];

#[derive(Debug, Clone)]
pub struct CommandRegistry {
    entries: HashMap<&'static str, &'static CommandEntry>,
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::from_table(COMMANDS)
    }
}

impl CommandRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_table(table: &'static [CommandEntry]) -> Self {
        let mut entries = HashMap::with_capacity(table.len());
        for entry in table {
            if entries.insert(entry.name, entry).is_some() {
                tracing::warn!(name = entry.name, "Duplicate command in table; last wins");
            }
        }
        Self { entries }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&'static CommandEntry> {
        self.entries.get(name).copied()
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.entries.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Compare the table against the host's declared command list. Run once
    /// at startup; dispatch itself never fails on an unknown name.
    pub fn validate<S: AsRef<str>>(&self, declared: &[S]) -> Result<(), RegistryError> {
        let declared: BTreeSet<&str> = declared.iter().map(AsRef::as_ref).collect();
        let registered: BTreeSet<&str> = self.entries.keys().copied().collect();

        let unregistered: Vec<String> = declared
            .difference(&registered)
            .map(|s| (*s).to_string())
            .collect();
        let undeclared: Vec<String> = registered
            .difference(&declared)
            .map(|s| (*s).to_string())
            .collect();

        if unregistered.is_empty() && undeclared.is_empty() {
            Ok(())
        } else {
            Err(RegistryError {
                unregistered,
                undeclared,
            })
        }
    }

    /// Run `name` against `ctx`.
    ///
    /// Unknown names are logged and ignored. A "not connected" failure is
    /// shown to the user for user commands and absorbed for internal ones.
    pub async fn dispatch(
        &self,
        ctx: &Ctx,
        name: &str,
        args: &[serde_json::Value],
    ) -> Result<Option<serde_json::Value>, ClientError> {
        let Some(entry) = self.get(name) else {
            tracing::warn!(name, "Dispatch of unregistered command ignored");
            return Ok(None);
        };

        let status = ctx.status();
        let behavior = entry.resolve(&status);
        tracing::debug!(name, %status, ?behavior, "Dispatching command");

        match execute(ctx, behavior, args).await {
            Err(e) if e.is_not_connected() => {
                match entry.kind {
                    CommandKind::Internal => {
                        tracing::debug!(name, "Internal command raced a disconnect; ignored");
                    }
                    CommandKind::User | CommandKind::Lifecycle => ctx.host().show_info(NOT_RUNNING),
                }
                Ok(None)
            }
            Err(ClientError::AlreadyStarting) => {
                match entry.kind {
                    CommandKind::Internal => {
                        tracing::debug!(name, "Internal command during start; ignored");
                    }
                    CommandKind::User | CommandKind::Lifecycle => {
                        ctx.host().show_info(ALREADY_STARTING);
                    }
                }
                Ok(None)
            }
            other => other,
        }
    }
}

async fn execute(
    ctx: &Ctx,
    behavior: Behavior,
    args: &[serde_json::Value],
) -> Result<Option<serde_json::Value>, ClientError> {
    let first = args.first();
    match behavior {
        Behavior::Start => ctx.start().await.map(|()| None),
        Behavior::Stop => {
            ctx.stop().await;
            Ok(None)
        }
        Behavior::Restart => ctx.restart().await.map(|()| None),
        Behavior::Request(method) => Ok(Some(ctx.send_request(method, first.cloned()).await?)),
        Behavior::Notify(method) => {
            ctx.send_notification(method, first.cloned()).await?;
            Ok(None)
        }
        Behavior::ShowLocation => {
            match first {
                Some(location) => ctx.host().open_location(location),
                None => tracing::warn!("Location command invoked without a location"),
            }
            Ok(None)
        }
        Behavior::ApplyEdit => {
            match first {
                Some(edit) => ctx.host().apply_workspace_edit(edit),
                None => tracing::warn!("Edit command invoked without an edit"),
            }
            Ok(None)
        }
        Behavior::ResolveCodeAction => {
            let resolved = ctx
                .send_request("codeAction/resolve", first.cloned())
                .await?;
            match resolved.get("edit") {
                Some(edit) => ctx.host().apply_workspace_edit(edit),
                None => tracing::debug!("Resolved code action carries no edit"),
            }
            Ok(Some(resolved))
        }
        Behavior::ClearDiagnostics => {
            ctx.clear_diagnostics();
            Ok(None)
        }
        Behavior::Inform(message) => {
            ctx.host().show_info(message);
            Ok(None)
        }
        Behavior::Builtin(command) => {
            ctx.host().run_builtin(command, args);
            Ok(None)
        }
        Behavior::Noop => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedConnector, test_ctx_with_host};

    #[test]
    fn names_are_unique() {
        let registry = CommandRegistry::new();
        assert_eq!(registry.names().len(), COMMANDS.len());
    }

    #[test]
    fn lifecycle_entries_ignore_status() {
        let registry = CommandRegistry::new();
        for name in ["startServer", "stopServer", "restartServer"] {
            let entry = registry.get(name).unwrap();
            assert_eq!(entry.kind, CommandKind::Lifecycle);
            assert_eq!(
                entry.resolve(&ConnectionStatus::Running),
                entry.resolve(&ConnectionStatus::Stopped)
            );
        }
    }

    #[test]
    fn every_disabled_behavior_degrades() {
        for entry in COMMANDS {
            let disabled = entry.resolve(&ConnectionStatus::Failed("x".into()));
            assert!(
                !matches!(disabled, Behavior::Request(_) | Behavior::Notify(_)),
                "{} needs a live server when disconnected",
                entry.name
            );
        }
    }

    #[test]
    fn internal_commands_are_noops_when_disconnected() {
        for entry in COMMANDS.iter().filter(|e| e.kind == CommandKind::Internal) {
            assert_eq!(entry.resolve(&ConnectionStatus::Stopped), Behavior::Noop);
        }
    }

    #[test]
    fn validate_reports_both_directions() {
        let registry = CommandRegistry::new();
        let mut declared: Vec<String> = registry.names().iter().map(|s| s.to_string()).collect();
        assert_eq!(registry.validate(declared.as_slice()), Ok(()));

        declared.retain(|n| n != "ssr");
        declared.push("renameEverything".into());
        let err = registry.validate(declared.as_slice()).unwrap_err();
        assert_eq!(err.unregistered, vec!["renameEverything"]);
        assert_eq!(err.undeclared, vec!["ssr"]);
    }

    #[tokio::test]
    async fn unknown_command_is_ignored() {
        let (ctx, host) = test_ctx_with_host(ScriptedConnector::new());
        let out = CommandRegistry::new()
            .dispatch(&ctx, "doesNotExist", &[])
            .await
            .unwrap();
        assert!(out.is_none());
        assert!(host.infos().is_empty());
    }

    #[tokio::test]
    async fn connected_dispatch_uses_enabled_behavior() {
        let connector = ScriptedConnector::new();
        connector.respond(
            "rust-analyzer/analyzerStatus",
            serde_json::json!("Workspaces: 1"),
        );
        let (ctx, host) = test_ctx_with_host(connector.clone());
        ctx.start().await.unwrap();

        let out = CommandRegistry::new()
            .dispatch(&ctx, "analyzerStatus", &[serde_json::json!({"textDocument": null})])
            .await
            .unwrap();

        assert_eq!(out, Some(serde_json::json!("Workspaces: 1")));
        assert_eq!(connector.requests(), vec!["rust-analyzer/analyzerStatus"]);
        assert!(host.infos().is_empty());
    }

    #[tokio::test]
    async fn disconnected_dispatch_uses_disabled_behavior() {
        let connector = ScriptedConnector::new();
        let (ctx, host) = test_ctx_with_host(connector.clone());
        let registry = CommandRegistry::new();

        registry.dispatch(&ctx, "analyzerStatus", &[]).await.unwrap();
        assert_eq!(host.infos(), vec![NOT_RUNNING.to_string()]);
        assert!(connector.requests().is_empty());

        registry
            .dispatch(&ctx, "onEnter", &[serde_json::json!("\n")])
            .await
            .unwrap();
        assert_eq!(host.builtins(), vec!["type".to_string()]);
    }

    #[tokio::test]
    async fn status_is_read_at_invocation_time() {
        let connector = ScriptedConnector::new();
        let (ctx, host) = test_ctx_with_host(connector.clone());
        let registry = CommandRegistry::new();

        registry.dispatch(&ctx, "memoryUsage", &[]).await.unwrap();
        assert_eq!(host.infos().len(), 1);

        ctx.start().await.unwrap();
        registry.dispatch(&ctx, "memoryUsage", &[]).await.unwrap();
        assert_eq!(host.infos().len(), 1);
        assert_eq!(connector.requests(), vec!["rust-analyzer/memoryUsage"]);

        ctx.stop().await;
        registry.dispatch(&ctx, "memoryUsage", &[]).await.unwrap();
        assert_eq!(host.infos().len(), 2);
    }

    #[tokio::test]
    async fn disabled_reload_starts_the_server() {
        let connector = ScriptedConnector::new();
        let (ctx, _host) = test_ctx_with_host(connector.clone());

        CommandRegistry::new()
            .dispatch(&ctx, "reloadWorkspace", &[])
            .await
            .unwrap();

        assert!(ctx.status().is_running());
        assert_eq!(connector.connects(), 1);
        assert!(connector.requests().is_empty());
    }

    #[tokio::test]
    async fn lifecycle_commands_drive_the_context() {
        let connector = ScriptedConnector::new();
        let (ctx, _host) = test_ctx_with_host(connector.clone());
        let registry = CommandRegistry::new();

        registry.dispatch(&ctx, "startServer", &[]).await.unwrap();
        assert!(ctx.status().is_running());

        registry.dispatch(&ctx, "restartServer", &[]).await.unwrap();
        assert!(ctx.status().is_running());
        assert_eq!(connector.connects(), 2);
        assert_eq!(connector.open_channels(), 1);

        registry.dispatch(&ctx, "stopServer", &[]).await.unwrap();
        assert_eq!(ctx.status(), ConnectionStatus::Stopped);
        assert_eq!(connector.open_channels(), 0);
    }

    #[tokio::test]
    async fn internal_commands_reach_the_host() {
        let connector = ScriptedConnector::new();
        connector.respond(
            "codeAction/resolve",
            serde_json::json!({ "title": "Fill match arms", "edit": { "changes": {} } }),
        );
        let (ctx, host) = test_ctx_with_host(connector.clone());
        ctx.start().await.unwrap();
        let registry = CommandRegistry::new();

        let location = serde_json::json!({ "uri": "file:///a.rs", "range": {} });
        registry
            .dispatch(&ctx, "gotoLocation", std::slice::from_ref(&location))
            .await
            .unwrap();
        registry
            .dispatch(&ctx, "resolveCodeAction", &[serde_json::json!({ "title": "Fill match arms" })])
            .await
            .unwrap();

        assert_eq!(host.locations(), vec![location]);
        assert_eq!(host.edits(), vec![serde_json::json!({ "changes": {} })]);
    }

    #[tokio::test]
    async fn internal_command_after_disconnect_is_silent() {
        let (ctx, host) = test_ctx_with_host(ScriptedConnector::new());
        CommandRegistry::new()
            .dispatch(&ctx, "resolveCodeAction", &[serde_json::json!({})])
            .await
            .unwrap();
        assert!(host.infos().is_empty());
        assert!(host.edits().is_empty());
    }

    #[tokio::test]
    async fn clear_diagnostics_works_in_any_state() {
        let (ctx, _host) = test_ctx_with_host(ScriptedConnector::new());
        ctx.put_diagnostics(
            "file:///a.rs".into(),
            vec![crate::types::DiagnosticRecord::new(
                0,
                crate::types::DiagnosticSeverity::Error,
                "e".into(),
                Some("e".into()),
                0,
                0,
            )],
        );
        CommandRegistry::new()
            .dispatch(&ctx, "clearDiagnostics", &[])
            .await
            .unwrap();
        assert!(ctx.rendered_diagnostic("file:///a.rs", 0).is_none());
    }

    #[tokio::test]
    async fn start_behavior_during_start_informs_instead_of_failing() {
        let connector = ScriptedConnector::new()
            .with_connect_delay(std::time::Duration::from_millis(50));
        let (ctx, host) = test_ctx_with_host(connector.clone());
        let mut status = ctx.subscribe_status();

        let starting = tokio::spawn({
            let ctx = ctx.clone();
            async move { ctx.start().await }
        });
        status
            .wait_for(|s| s.health == crate::types::Health::Starting)
            .await
            .unwrap();

        let registry = CommandRegistry::new();
        for name in ["reloadWorkspace", "startServer"] {
            let out = registry.dispatch(&ctx, name, &[]).await.unwrap();
            assert!(out.is_none(), "{name}");
        }
        assert_eq!(
            host.infos(),
            vec![ALREADY_STARTING.to_string(), ALREADY_STARTING.to_string()]
        );

        starting.await.unwrap().unwrap();
        assert!(ctx.status().is_running());
        assert_eq!(connector.connects(), 1);
    }
}
