//! stackward-engine: dry-run validation and deployment of cloud stacks.
//!
//! The engine drives a change set through creation, inspection and either
//! cleanup (validation) or execution (deployment) against a [`StackApi`],
//! and turns validation findings into editor diagnostics anchored at the
//! template location they concern.
//!
//! # Layout
//!
//! - [`retry`]: bounded retry with backoff, used around cleanup calls.
//! - [`operations`]: stateless change-set and stack operations.
//! - [`registry`]: stack-name-keyed store of in-flight validations.
//! - [`diagnostics`]: per-document, per-source diagnostic merging.
//! - [`workflow`]: the `start` / status surface and the run strategies.
//! - [`local`]: an in-process simulation of the remote service.

pub mod api;
pub mod collaborators;
pub mod diagnostics;
pub mod error;
pub mod local;
pub mod operations;
pub mod registry;
pub mod retry;
pub mod settings;
pub mod workflow;

pub use api::{StackApi, StackWaitTarget, WaiterOutcome};
pub use collaborators::{
    DocumentStore, DocumentType, FeatureFlags, RegionFeatureFlags, SyntaxTree,
    SyntaxTreeProvider, TemplateDocument,
};
pub use diagnostics::{diagnostic_id_of, DiagnosticCoordinator, DiagnosticSink};
pub use error::{ApiError, DiagnosticsError, WorkflowError};
pub use local::{ApiOperation, LocalStackApi};
pub use registry::ValidationRegistry;
pub use retry::{RetryError, RetryOptions};
pub use settings::EngineSettings;
pub use workflow::{
    DeploymentRun, DeploymentWorkflow, EngineContext, RunStrategy, ValidationRun,
    ValidationWorkflow, WorkflowEngine,
};
