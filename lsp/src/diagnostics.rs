//! Diagnostics store: the latest batch the server pushed, per resource URI.

use std::collections::HashMap;

use crate::types::DiagnosticRecord;

#[derive(Debug, Default)]
pub struct DiagnosticsStore {
    batches: HashMap<String, Vec<DiagnosticRecord>>,
}

impl DiagnosticsStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the batch for `uri`. Batches are never merged; an empty push
    /// drops the resource entirely.
    pub fn put(&mut self, uri: String, batch: Vec<DiagnosticRecord>) {
        if batch.is_empty() {
            self.batches.remove(&uri);
        } else {
            self.batches.insert(uri, batch);
        }
    }

    #[must_use]
    pub fn get(&self, uri: &str) -> Option<&[DiagnosticRecord]> {
        self.batches.get(uri).map(Vec::as_slice)
    }

    /// Rendered text of one record, if the resource, index and text all exist.
    #[must_use]
    pub fn rendered(&self, uri: &str, index: usize) -> Option<&str> {
        self.get(uri)?.get(index)?.rendered()
    }

    pub fn clear(&mut self) {
        self.batches.clear();
    }

    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.batches.len()
    }
}
