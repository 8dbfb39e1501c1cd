//! Per-document, per-source diagnostic collections.
//!
//! Several independent producers (template validation, linters, policy
//! checks) publish diagnostics for the same document. Each producer owns
//! one source list; publishing replaces only that list. Every change
//! republishes the merged list for the document: all sources concatenated
//! in first-publish order, then stably sorted by (line, character).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use lsp_types::Diagnostic;

use crate::error::DiagnosticsError;

/// Delivers a document's full merged diagnostic list to the editor.
pub trait DiagnosticSink: Send + Sync {
    fn publish(&self, uri: &str, diagnostics: Vec<Diagnostic>) -> Result<(), String>;
}

/// Diagnostics for one document, keyed by source.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticCollection {
    sources: Vec<(String, Vec<Diagnostic>)>,
}

impl DiagnosticCollection {
    fn set(&mut self, source: &str, diagnostics: Vec<Diagnostic>) {
        match self.sources.iter_mut().find(|(name, _)| name == source) {
            Some((_, list)) => *list = diagnostics,
            None => self.sources.push((source.to_string(), diagnostics)),
        }
    }

    fn source_mut(&mut self, source: &str) -> Option<&mut Vec<Diagnostic>> {
        self.sources
            .iter_mut()
            .find(|(name, _)| name == source)
            .map(|(_, list)| list)
    }

    /// All sources concatenated, stably sorted by start position.
    pub fn merged(&self) -> Vec<Diagnostic> {
        let mut merged: Vec<Diagnostic> = self
            .sources
            .iter()
            .flat_map(|(_, list)| list.iter().cloned())
            .collect();
        merged.sort_by_key(|d| (d.range.start.line, d.range.start.character));
        merged
    }

    pub fn source_names(&self) -> Vec<String> {
        self.sources.iter().map(|(name, _)| name.clone()).collect()
    }
}

/// Merges and republishes diagnostics per document.
pub struct DiagnosticCoordinator {
    sink: Arc<dyn DiagnosticSink>,
    collections: Mutex<HashMap<String, DiagnosticCollection>>,
}

impl DiagnosticCoordinator {
    pub fn new(sink: Arc<dyn DiagnosticSink>) -> Self {
        Self {
            sink,
            collections: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, DiagnosticCollection>> {
        self.collections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace `source`'s list for `uri` and republish the merged list.
    pub fn publish(
        &self,
        source: &str,
        uri: &str,
        diagnostics: Vec<Diagnostic>,
    ) -> Result<(), DiagnosticsError> {
        // The lock is held through delivery so that publishes for one
        // document reach the sink in the order they were applied.
        let mut collections = self.lock();
        let collection = collections.entry(uri.to_string()).or_default();
        collection.set(source, diagnostics);
        let merged = collection.merged();
        self.deliver(uri, merged)
    }

    /// Forget every source for `uri` and publish an empty list.
    pub fn clear(&self, uri: &str) -> Result<(), DiagnosticsError> {
        let mut collections = self.lock();
        collections.remove(uri);
        self.deliver(uri, Vec::new())
    }

    /// Remove entries matching `predicate` from one source's list only.
    pub fn clear_one<P>(&self, uri: &str, source: &str, predicate: P) -> Result<(), DiagnosticsError>
    where
        P: Fn(&Diagnostic) -> bool,
    {
        let mut collections = self.lock();
        let Some(collection) = collections.get_mut(uri) else {
            return Ok(());
        };
        let Some(list) = collection.source_mut(source) else {
            return Ok(());
        };
        list.retain(|d| !predicate(d));
        let merged = collection.merged();
        self.deliver(uri, merged)
    }

    /// Retract a single diagnostic by the id stored in its `data` field.
    pub fn retract(
        &self,
        uri: &str,
        source: &str,
        diagnostic_id: &str,
    ) -> Result<(), DiagnosticsError> {
        self.clear_one(uri, source, |d| diagnostic_id_of(d) == Some(diagnostic_id))
    }

    pub fn current_diagnostics(&self, uri: &str) -> Vec<Diagnostic> {
        self.lock()
            .get(uri)
            .map(DiagnosticCollection::merged)
            .unwrap_or_default()
    }

    pub fn sources(&self, uri: &str) -> Vec<String> {
        self.lock()
            .get(uri)
            .map(DiagnosticCollection::source_names)
            .unwrap_or_default()
    }

    fn deliver(&self, uri: &str, diagnostics: Vec<Diagnostic>) -> Result<(), DiagnosticsError> {
        let count = diagnostics.len();
        self.sink.publish(uri, diagnostics).map_err(|message| {
            tracing::error!(uri, error = %message, "failed to publish diagnostics");
            DiagnosticsError::Publish {
                uri: uri.to_string(),
                message,
            }
        })?;
        tracing::debug!(uri, count, "published diagnostics");
        Ok(())
    }
}

/// The correlation id placed in a diagnostic's `data` by this crate.
pub fn diagnostic_id_of(diagnostic: &Diagnostic) -> Option<&str> {
    diagnostic
        .data
        .as_ref()
        .and_then(|data| data.get("diagnosticId"))
        .and_then(|id| id.as_str())
}
