//! stackward-core: domain types for dry-run validation and deployment of
//! cloud stack templates.
//!
//! These types are shared by the workflow engine and the editor-facing
//! server. They carry no behaviour beyond construction, phase ordering and
//! the [`WorkflowState::merge`] operation.

pub mod request;
pub mod stack;
pub mod validation;
pub mod workflow;

pub use request::{
    DeploymentMode, Parameter, ResourceToImport, TemplateUpload, WorkflowRequest,
};
pub use stack::{ChangeDetail, ChangeSetType, ResourceChange, StackChange, StackEvent};
pub use validation::{Validation, ValidationDetail, ValidationSeverity};
pub use workflow::{
    RunState, StartResponse, WorkflowDescription, WorkflowPhase, WorkflowState, WorkflowStatus,
    WorkflowUpdate,
};
