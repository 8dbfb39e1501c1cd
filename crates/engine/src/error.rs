/// A failed call to the remote stack-orchestration API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}", self.reason())]
pub struct ApiError {
    /// Service error code, e.g. `ValidationError` or `AlreadyExistsException`.
    pub code: Option<String>,
    pub message: String,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    /// An error with no service code (network failures, local faults).
    pub fn generic(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    /// Human-readable failure reason: `"<code>: <message>"`, or the bare
    /// message when the code is missing or the generic `Error`.
    pub fn reason(&self) -> String {
        match self.code.as_deref() {
            Some(code) if !code.is_empty() && code != "Error" => {
                format!("{}: {}", code, self.message)
            }
            _ => self.message.clone(),
        }
    }
}

/// Failure delivering diagnostics to the editor.
#[derive(Debug, thiserror::Error)]
pub enum DiagnosticsError {
    /// The sink refused or failed to deliver the merged list.
    #[error("failed to publish diagnostics for {uri}: {message}")]
    Publish { uri: String, message: String },
}

/// Errors surfaced synchronously by the workflow engine.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// No workflow with this id is known to the engine.
    #[error("workflow not found: {id}")]
    NotFound { id: String },

    /// The document named by the request could not be resolved.
    #[error("document not found: {uri}")]
    DocumentNotFound { uri: String },

    /// A workflow with this id is still in progress.
    #[error("workflow already running: {id}")]
    AlreadyRunning { id: String },

    /// Change-set creation failed before the run was launched.
    #[error(transparent)]
    Api(#[from] ApiError),
}
