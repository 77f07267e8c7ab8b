//! The editor side of the integration.
//!
//! Everything the client shows to the user or asks the editor to do goes
//! through [`Host`]. Only the two message methods are mandatory.

use crate::content::ContentProvider;

pub trait Host: Send + Sync {
    fn show_info(&self, message: &str);

    fn show_error(&self, message: &str);

    /// Command names the host declares. `None` skips the startup check of
    /// the command table.
    fn declared_commands(&self) -> Option<Vec<String>> {
        None
    }

    fn register_commands(&self, names: &[&'static str]) {
        tracing::debug!(count = names.len(), "Host ignores command registration");
    }

    fn unregister_commands(&self, names: &[&'static str]) {
        tracing::debug!(count = names.len(), "Host ignores command unregistration");
    }

    fn register_content_provider(&self, scheme: &str, _provider: ContentProvider) {
        tracing::debug!(scheme, "Host ignores content provider");
    }

    fn unregister_content_provider(&self, scheme: &str) {
        tracing::debug!(scheme, "Host ignores content provider removal");
    }

    /// Reveal a location (`{ uri, range }`) or a list of them.
    fn open_location(&self, location: &serde_json::Value) {
        tracing::debug!(%location, "Host cannot open locations");
    }

    fn apply_workspace_edit(&self, edit: &serde_json::Value) {
        tracing::debug!(%edit, "Host cannot apply workspace edits");
    }

    /// Run one of the editor's own commands, used when a command falls
    /// back to default editor behavior.
    fn run_builtin(&self, command: &str, args: &[serde_json::Value]) {
        tracing::debug!(command, args = args.len(), "Host has no builtin commands");
    }
}
