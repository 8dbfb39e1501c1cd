//! Document state management for open templates in the editor.
//!
//! [`DocumentState`] is owned by the server loop. The workflow engine reads
//! it from its own tasks through [`SharedDocuments`], which implements both
//! the document-store and syntax-tree collaborators.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use stackward_engine::{
    DocumentStore, DocumentType, SyntaxTree, SyntaxTreeProvider, TemplateDocument,
};

use crate::template_tree::{detect_document_type, TemplateTree};

/// Tracks which documents are currently open in the editor.
#[derive(Default)]
pub struct DocumentState {
    documents: HashMap<String, DocumentInfo>,
}

/// Information about a single open document.
pub struct DocumentInfo {
    /// Editor-reported version number.
    pub version: i32,
    pub content: String,
    pub doc_type: DocumentType,
    /// Key-path index of `content`; absent while the text does not parse.
    pub tree: Option<Arc<TemplateTree>>,
}

impl DocumentInfo {
    fn new(uri: &str, version: i32, content: String) -> Self {
        let doc_type = detect_document_type(uri, &content);
        let tree = TemplateTree::parse(&content, doc_type).map(Arc::new);
        Self {
            version,
            content,
            doc_type,
            tree,
        }
    }
}

impl DocumentState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a newly opened document.
    pub fn open(&mut self, uri: &str, version: i32, content: String) {
        self.documents
            .insert(uri.to_owned(), DocumentInfo::new(uri, version, content));
    }

    /// Replace content for an already-open document.
    pub fn change(&mut self, uri: &str, version: i32, content: String) {
        if self.documents.contains_key(uri) {
            self.open(uri, version, content);
        }
    }

    /// Remove a closed document from tracking.
    pub fn close(&mut self, uri: &str) {
        self.documents.remove(uri);
    }

    pub fn get(&self, uri: &str) -> Option<&DocumentInfo> {
        self.documents.get(uri)
    }
}

/// Thread-safe handle on the open documents.
#[derive(Clone, Default)]
pub struct SharedDocuments {
    inner: Arc<RwLock<DocumentState>>,
}

impl SharedDocuments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, uri: &str, version: i32, content: String) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .open(uri, version, content);
    }

    pub fn change(&self, uri: &str, version: i32, content: String) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .change(uri, version, content);
    }

    pub fn close(&self, uri: &str) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .close(uri);
    }

    pub fn version(&self, uri: &str) -> Option<i32> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(uri)
            .map(|doc| doc.version)
    }
}

impl DocumentStore for SharedDocuments {
    fn get(&self, uri: &str) -> Option<TemplateDocument> {
        let state = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        state.get(uri).map(|doc| TemplateDocument {
            body: doc.content.clone(),
            doc_type: doc.doc_type,
        })
    }
}

impl SyntaxTreeProvider for SharedDocuments {
    fn tree(&self, uri: &str) -> Option<Arc<dyn SyntaxTree>> {
        let state = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        state
            .get(uri)
            .and_then(|doc| doc.tree.clone())
            .map(|tree| tree as Arc<dyn SyntaxTree>)
    }
}
