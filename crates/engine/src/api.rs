//! The remote stack-orchestration API as consumed by the engine.
//!
//! Payload types mirror the service's wire shapes (PascalCase) so that
//! recorded responses can be replayed from JSON. Mapping them into the
//! domain types of `stackward-core` happens in [`crate::operations`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stackward_core::{ChangeSetType, DeploymentMode, Parameter, ResourceToImport, StackEvent};

use crate::error::ApiError;

/// Stack status while a CREATE change set exists but was never executed.
pub const REVIEW_IN_PROGRESS: &str = "REVIEW_IN_PROGRESS";

/// Summary returned by `describe_stack`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StackSummary {
    pub stack_name: String,
    pub stack_status: String,
}

/// Template source for a change set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateSource {
    Body(String),
    Url(String),
}

/// Input to `create_change_set`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateChangeSetInput {
    pub stack_name: String,
    pub change_set_name: String,
    pub change_set_type: ChangeSetType,
    pub template: TemplateSource,
    pub parameters: Vec<Parameter>,
    pub capabilities: Vec<String>,
    pub resources_to_import: Vec<ResourceToImport>,
    pub deployment_mode: Option<DeploymentMode>,
}

/// Raw attribute-level change detail.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RawChangeDetail {
    #[serde(default)]
    pub target: Option<RawChangeTarget>,
    #[serde(default)]
    pub evaluation: Option<String>,
    #[serde(default)]
    pub change_source: Option<String>,
    #[serde(default)]
    pub causing_entity: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RawChangeTarget {
    #[serde(default)]
    pub attribute: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub requires_recreation: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RawResourceChange {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub logical_resource_id: Option<String>,
    #[serde(default)]
    pub physical_resource_id: Option<String>,
    #[serde(default)]
    pub resource_type: Option<String>,
    #[serde(default)]
    pub replacement: Option<String>,
    #[serde(default)]
    pub scope: Option<Vec<String>>,
    #[serde(default)]
    pub before_context: Option<String>,
    #[serde(default)]
    pub after_context: Option<String>,
    #[serde(default)]
    pub details: Option<Vec<RawChangeDetail>>,
}

/// One entry of a described change set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RawChange {
    #[serde(default, rename = "Type")]
    pub change_type: Option<String>,
    #[serde(default)]
    pub resource_change: Option<RawResourceChange>,
}

/// Output of `describe_change_set`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChangeSetDescription {
    pub status: String,
    #[serde(default)]
    pub status_reason: Option<String>,
    #[serde(default)]
    pub changes: Vec<RawChange>,
    #[serde(default)]
    pub next_token: Option<String>,
}

/// A raw operation event, as returned by `describe_events`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OperationEvent {
    #[serde(default)]
    pub event_id: Option<String>,
    /// e.g. `VALIDATION_ERROR`, `STACK_EVENT`.
    #[serde(default)]
    pub event_type: Option<String>,
    /// RFC 3339.
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub logical_resource_id: Option<String>,
    #[serde(default)]
    pub validation_name: Option<String>,
    #[serde(default)]
    pub validation_status_reason: Option<String>,
    /// `FAIL` or `WARN`.
    #[serde(default)]
    pub validation_failure_mode: Option<String>,
    #[serde(default)]
    pub validation_path: Option<String>,
}

pub const VALIDATION_ERROR_EVENT: &str = "VALIDATION_ERROR";

/// Input to `describe_events`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescribeEventsInput {
    pub stack_name: String,
    pub change_set_name: String,
    pub failures_only: bool,
    pub next_token: Option<String>,
}

/// One page of operation events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventsPage {
    pub events: Vec<OperationEvent>,
    pub next_token: Option<String>,
}

/// Which terminal-state waiter applies to a stack deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StackWaitTarget {
    Created,
    Updated,
    Imported,
}

impl From<ChangeSetType> for StackWaitTarget {
    fn from(change_set_type: ChangeSetType) -> Self {
        match change_set_type {
            ChangeSetType::Create => StackWaitTarget::Created,
            ChangeSetType::Update => StackWaitTarget::Updated,
            ChangeSetType::Import => StackWaitTarget::Imported,
        }
    }
}

/// How a waiter finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaiterOutcome {
    Success,
    /// The resource reached a failure state.
    Failure { reason: Option<String> },
    /// The waiter gave up polling.
    Timeout { reason: Option<String> },
    Aborted,
}

impl WaiterOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, WaiterOutcome::Success)
    }
}

/// Normalize a waiter result into an optional failure reason.
///
/// `None` means the waiter succeeded. Every failure variant yields a
/// reason, falling back to a fixed description when the service gave none.
pub fn waiter_failure_reason(result: &Result<WaiterOutcome, ApiError>) -> Option<String> {
    match result {
        Ok(WaiterOutcome::Success) => None,
        Ok(WaiterOutcome::Failure { reason }) => Some(
            reason
                .clone()
                .unwrap_or_else(|| "resource reached a failure state".to_string()),
        ),
        Ok(WaiterOutcome::Timeout { reason }) => Some(
            reason
                .clone()
                .unwrap_or_else(|| "timed out waiting for a terminal state".to_string()),
        ),
        Ok(WaiterOutcome::Aborted) => Some("waiter was aborted".to_string()),
        Err(err) => Some(err.reason()),
    }
}

/// Operations consumed from the remote stack-orchestration service.
///
/// Implementations must be `Send + Sync + 'static`; one instance is shared
/// by every detached workflow run.
#[async_trait]
pub trait StackApi: Send + Sync + 'static {
    /// Describe a stack. `Ok(None)` means the stack does not exist.
    async fn describe_stack(&self, stack_name: &str) -> Result<Option<StackSummary>, ApiError>;

    async fn create_change_set(&self, input: CreateChangeSetInput) -> Result<(), ApiError>;

    async fn describe_change_set(
        &self,
        stack_name: &str,
        change_set_name: &str,
        include_property_values: bool,
        next_token: Option<String>,
    ) -> Result<ChangeSetDescription, ApiError>;

    async fn delete_change_set(
        &self,
        stack_name: &str,
        change_set_name: &str,
    ) -> Result<(), ApiError>;

    /// Execute a change set. `client_request_token` makes retries idempotent.
    async fn execute_change_set(
        &self,
        stack_name: &str,
        change_set_name: &str,
        client_request_token: &str,
    ) -> Result<(), ApiError>;

    async fn delete_stack(&self, stack_name: &str) -> Result<(), ApiError>;

    /// Block until change-set creation reaches a terminal state.
    async fn wait_for_change_set_created(
        &self,
        stack_name: &str,
        change_set_name: &str,
    ) -> Result<WaiterOutcome, ApiError>;

    /// Block until the stack reaches the terminal state for `target`.
    async fn wait_for_stack(
        &self,
        stack_name: &str,
        target: StackWaitTarget,
    ) -> Result<WaiterOutcome, ApiError>;

    async fn describe_events(&self, input: DescribeEventsInput) -> Result<EventsPage, ApiError>;

    /// Most recent stack events first, at most `limit`.
    async fn describe_stack_events(
        &self,
        stack_name: &str,
        limit: usize,
    ) -> Result<Vec<StackEvent>, ApiError>;
}
