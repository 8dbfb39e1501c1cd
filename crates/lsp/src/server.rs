//! LSP server main loop with request/notification dispatch.
//!
//! Uses `lsp-server` (synchronous, crossbeam-based) for the transport. The
//! workflow engine runs on a tokio runtime owned by the server: `*/start`
//! requests are answered from a spawned task once the change set exists,
//! status queries are answered inline.

use std::error::Error;
use std::sync::Arc;

use lsp_server::{Connection, ErrorCode, Message, Notification, Request, RequestId, Response};
use lsp_types::notification::{
    DidChangeTextDocument, DidCloseTextDocument, DidOpenTextDocument, Notification as _,
};
use lsp_types::{
    ServerCapabilities, TextDocumentSyncCapability, TextDocumentSyncKind, TextDocumentSyncOptions,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use stackward_core::WorkflowRequest;
use stackward_engine::operations::VALIDATION_SOURCE;
use stackward_engine::{
    DeploymentWorkflow, DiagnosticCoordinator, EngineContext, EngineSettings, FeatureFlags,
    RunStrategy, StackApi, ValidationRegistry, ValidationWorkflow, WorkflowEngine, WorkflowError,
};

use crate::diagnostics::LspDiagnosticSink;
use crate::document::SharedDocuments;
use crate::protocol::{self, DismissParams, WorkflowIdParams};

/// The remote side of the engine and its tunables.
pub struct Backend {
    pub api: Arc<dyn StackApi>,
    pub flags: Arc<dyn FeatureFlags>,
    pub settings: EngineSettings,
}

/// A failed request, ready to become an error response.
#[derive(Debug)]
struct RequestError {
    code: ErrorCode,
    message: String,
}

impl RequestError {
    fn invalid_params(message: impl ToString) -> Self {
        Self {
            code: ErrorCode::InvalidParams,
            message: message.to_string(),
        }
    }

    fn internal(message: impl ToString) -> Self {
        Self {
            code: ErrorCode::InternalError,
            message: message.to_string(),
        }
    }
}

impl From<WorkflowError> for RequestError {
    fn from(err: WorkflowError) -> Self {
        match err {
            WorkflowError::NotFound { .. } | WorkflowError::DocumentNotFound { .. } => {
                Self::invalid_params(err)
            }
            WorkflowError::AlreadyRunning { .. } | WorkflowError::Api(_) => Self::internal(err),
        }
    }
}

/// Editor-facing server state. One per connection.
pub struct Server {
    connection: Arc<Connection>,
    runtime: tokio::runtime::Runtime,
    documents: SharedDocuments,
    diagnostics: Arc<DiagnosticCoordinator>,
    validation: Arc<ValidationWorkflow>,
    deployment: Arc<DeploymentWorkflow>,
}

impl Server {
    pub fn new(connection: Arc<Connection>, backend: Backend) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("stackward-engine")
            .build()?;
        let documents = SharedDocuments::new();
        let diagnostics = Arc::new(DiagnosticCoordinator::new(Arc::new(
            LspDiagnosticSink::new(connection.clone()),
        )));
        let ctx = Arc::new(EngineContext {
            api: backend.api,
            documents: Arc::new(documents.clone()),
            trees: Arc::new(documents.clone()),
            flags: backend.flags,
            diagnostics: diagnostics.clone(),
            registry: Arc::new(ValidationRegistry::new()),
            settings: backend.settings,
        });
        Ok(Self {
            connection,
            runtime,
            documents,
            diagnostics,
            validation: Arc::new(ValidationWorkflow::validation(ctx.clone())),
            deployment: Arc::new(DeploymentWorkflow::deployment(ctx)),
        })
    }

    pub fn documents(&self) -> &SharedDocuments {
        &self.documents
    }

    pub fn diagnostics(&self) -> &DiagnosticCoordinator {
        &self.diagnostics
    }

    /// Dispatch one incoming message. Shutdown is handled by the caller.
    pub fn handle(&self, msg: Message) -> Result<(), Box<dyn Error>> {
        match msg {
            Message::Request(req) => self.handle_request(req),
            Message::Notification(not) => self.handle_notification(not),
            Message::Response(_) => Ok(()),
        }
    }

    /// Wait for every detached workflow run, so cleanup finishes.
    pub fn drain(&self) {
        self.runtime.block_on(async {
            self.validation.drain().await;
            self.deployment.drain().await;
        });
    }

    fn handle_request(&self, req: Request) -> Result<(), Box<dyn Error>> {
        let Request { id, method, params } = req;
        match method.as_str() {
            protocol::VALIDATION_START => self.start(id, params, self.validation.clone()),
            protocol::DEPLOYMENT_START => self.start(id, params, self.deployment.clone()),
            protocol::VALIDATION_STATUS => {
                let result = parse::<WorkflowIdParams>(params)
                    .and_then(|p| Ok(self.validation.get_status(&p.id)?));
                send_response(&self.connection, id, result)
            }
            protocol::VALIDATION_DESCRIBE => {
                let result = parse::<WorkflowIdParams>(params)
                    .and_then(|p| Ok(self.validation.describe_status(&p.id)?));
                send_response(&self.connection, id, result)
            }
            protocol::DEPLOYMENT_STATUS => {
                let result = parse::<WorkflowIdParams>(params)
                    .and_then(|p| Ok(self.deployment.get_status(&p.id)?));
                send_response(&self.connection, id, result)
            }
            protocol::DEPLOYMENT_DESCRIBE => {
                let result = parse::<WorkflowIdParams>(params)
                    .and_then(|p| Ok(self.deployment.describe_status(&p.id)?));
                send_response(&self.connection, id, result)
            }
            protocol::DIAGNOSTICS_DISMISS => {
                let result = parse::<DismissParams>(params).and_then(|p| {
                    self.diagnostics
                        .retract(&p.uri, VALIDATION_SOURCE, &p.diagnostic_id)
                        .map_err(RequestError::internal)
                });
                send_response(&self.connection, id, result)
            }
            _ => {
                let resp = Response::new_err(
                    id,
                    ErrorCode::MethodNotFound as i32,
                    format!("method not found: {}", method),
                );
                self.connection.sender.send(Message::Response(resp))?;
                Ok(())
            }
        }
    }

    fn start<S: RunStrategy>(
        &self,
        id: RequestId,
        params: serde_json::Value,
        engine: Arc<WorkflowEngine<S>>,
    ) -> Result<(), Box<dyn Error>> {
        let request = match parse::<WorkflowRequest>(params) {
            Ok(request) => request,
            Err(err) => return send_response::<()>(&self.connection, id, Err(err)),
        };
        let connection = self.connection.clone();
        self.runtime.spawn(async move {
            let result = engine.start(request).await.map_err(RequestError::from);
            if let Err(err) = send_response(&connection, id, result) {
                tracing::error!(error = %err, "could not answer start request");
            }
        });
        Ok(())
    }

    fn handle_notification(&self, not: Notification) -> Result<(), Box<dyn Error>> {
        match not.method.as_str() {
            m if m == DidOpenTextDocument::METHOD => {
                let params: lsp_types::DidOpenTextDocumentParams =
                    serde_json::from_value(not.params)?;
                self.documents.open(
                    params.text_document.uri.as_str(),
                    params.text_document.version,
                    params.text_document.text,
                );
            }
            m if m == DidChangeTextDocument::METHOD => {
                let params: lsp_types::DidChangeTextDocumentParams =
                    serde_json::from_value(not.params)?;
                // FULL sync: last content change has the entire document
                if let Some(change) = params.content_changes.into_iter().last() {
                    self.documents.change(
                        params.text_document.uri.as_str(),
                        params.text_document.version,
                        change.text,
                    );
                }
            }
            m if m == DidCloseTextDocument::METHOD => {
                let params: lsp_types::DidCloseTextDocumentParams =
                    serde_json::from_value(not.params)?;
                let uri = params.text_document.uri.as_str();
                self.documents.close(uri);
                if let Err(err) = self.diagnostics.clear(uri) {
                    tracing::warn!(uri, error = %err, "could not clear diagnostics");
                }
            }
            _ => {}
        }
        Ok(())
    }
}

fn parse<T: DeserializeOwned>(params: serde_json::Value) -> Result<T, RequestError> {
    serde_json::from_value(params).map_err(RequestError::invalid_params)
}

fn send_response<T: Serialize>(
    connection: &Connection,
    id: RequestId,
    result: Result<T, RequestError>,
) -> Result<(), Box<dyn Error>> {
    let resp = match result {
        Ok(value) => Response::new_ok(id, serde_json::to_value(value)?),
        Err(err) => Response::new_err(id, err.code as i32, err.message),
    };
    connection.sender.send(Message::Response(resp))?;
    Ok(())
}

pub fn build_capabilities() -> ServerCapabilities {
    ServerCapabilities {
        text_document_sync: Some(TextDocumentSyncCapability::Options(
            TextDocumentSyncOptions {
                open_close: Some(true),
                change: Some(TextDocumentSyncKind::FULL),
                ..Default::default()
            },
        )),
        ..Default::default()
    }
}

/// Run the LSP server over stdio until shutdown.
pub fn run(backend: Backend) -> Result<(), Box<dyn Error>> {
    let (connection, io_threads) = Connection::stdio();
    let connection = Arc::new(connection);

    // ── Initialize handshake ──────────────────────────────────────────
    let init_json = serde_json::to_value(build_capabilities())?;
    let _init_params: lsp_types::InitializeParams =
        serde_json::from_value(connection.initialize(init_json)?)?;

    let server = Server::new(connection.clone(), backend)?;
    tracing::info!("language server initialized");

    // ── Main loop ─────────────────────────────────────────────────────
    for msg in &connection.receiver {
        if let Message::Request(req) = &msg {
            if connection.handle_shutdown(req)? {
                server.drain();
                break;
            }
        }
        server.handle(msg)?;
    }

    drop(server);
    drop(connection);
    io_threads.join()?;
    Ok(())
}
