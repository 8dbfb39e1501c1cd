//! Delivery of merged diagnostics as `textDocument/publishDiagnostics`.

use std::sync::Arc;

use lsp_server::{Connection, Message, Notification};
use lsp_types::notification::{Notification as _, PublishDiagnostics};
use lsp_types::{Diagnostic, PublishDiagnosticsParams, Uri};
use stackward_engine::DiagnosticSink;

/// Sends each merged diagnostic list to the client over the connection.
pub struct LspDiagnosticSink {
    connection: Arc<Connection>,
}

impl LspDiagnosticSink {
    pub fn new(connection: Arc<Connection>) -> Self {
        Self { connection }
    }
}

impl DiagnosticSink for LspDiagnosticSink {
    fn publish(&self, uri: &str, diagnostics: Vec<Diagnostic>) -> Result<(), String> {
        let uri: Uri = uri
            .parse()
            .map_err(|e| format!("invalid document uri '{}': {}", uri, e))?;
        let params = PublishDiagnosticsParams {
            uri,
            diagnostics,
            version: None,
        };
        let not = Notification::new(PublishDiagnostics::METHOD.to_string(), params);
        self.connection
            .sender
            .send(Message::Notification(not))
            .map_err(|e| e.to_string())
    }
}
