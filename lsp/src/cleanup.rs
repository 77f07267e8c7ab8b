//! Cleanup registry: teardown actions accumulated while the client is active.
//!
//! Every registered action runs exactly once: either early, through its
//! [`CleanupToken`], or when the registry is drained. Draining runs actions
//! in reverse registration order and keeps going when one fails or panics.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

type Action = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

#[derive(Default)]
struct Slots {
    next_id: u64,
    actions: Vec<(u64, Action)>,
    drained: bool,
}

/// Outcome of draining the registry.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub ran: usize,
    pub failures: Vec<String>,
}

#[derive(Clone, Default)]
pub struct CleanupRegistry {
    slots: Arc<Mutex<Slots>>,
}

impl CleanupRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `action`. After the registry has been drained the action is
    /// run immediately instead, so nothing registered late is dropped.
    pub fn register<F>(&self, action: F) -> CleanupToken
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let mut slots = self.slots.lock();
        let id = slots.next_id;
        slots.next_id += 1;

        if slots.drained {
            drop(slots);
            tracing::debug!(id, "Cleanup registered after drain; running now");
            if let Err(failure) = run(Box::new(action)) {
                tracing::warn!(id, "Cleanup action failed: {failure}");
            }
        } else {
            slots.actions.push((id, Box::new(action)));
        }

        CleanupToken {
            id,
            slots: Arc::downgrade(&self.slots),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.lock().actions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every pending action once, newest first.
    pub fn drain(&self) -> DrainReport {
        let actions = {
            let mut slots = self.slots.lock();
            slots.drained = true;
            std::mem::take(&mut slots.actions)
        };

        let mut report = DrainReport::default();
        for (id, action) in actions.into_iter().rev() {
            report.ran += 1;
            if let Err(failure) = run(action) {
                tracing::warn!(id, "Cleanup action failed: {failure}");
                report.failures.push(failure);
            }
        }
        report
    }
}

/// Handle for disposing one registered action ahead of the drain.
#[derive(Debug)]
pub struct CleanupToken {
    id: u64,
    slots: Weak<Mutex<Slots>>,
}

impl CleanupToken {
    /// Run the action now if it is still pending. Returns whether it ran.
    /// Calling this after the action already ran is a no-op.
    pub fn dispose(&self) -> bool {
        let Some(slots) = self.slots.upgrade() else {
            return false;
        };
        let action = {
            let mut slots = slots.lock();
            let Some(pos) = slots.actions.iter().position(|(id, _)| *id == self.id) else {
                return false;
            };
            slots.actions.remove(pos).1
        };
        if let Err(failure) = run(action) {
            tracing::warn!(id = self.id, "Cleanup action failed: {failure}");
        }
        true
    }
}

impl Drop for Slots {
    fn drop(&mut self) {
        if self.actions.is_empty() {
            return;
        }
        tracing::warn!(
            pending = self.actions.len(),
            "Cleanup registry dropped before drain; running pending actions"
        );
        for (id, action) in std::mem::take(&mut self.actions).into_iter().rev() {
            if let Err(failure) = run(action) {
                tracing::warn!(id, "Cleanup action failed: {failure}");
            }
        }
    }
}

fn run(action: Action) -> Result<(), String> {
    match catch_unwind(AssertUnwindSafe(action)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("{e:#}")),
        Err(panic) => Err(panic
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "cleanup action panicked".to_string())),
    }
}
