//! Workflow state: phases, run states, and the partial-update merge.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::request::DeploymentMode;
use crate::stack::{ChangeSetType, StackChange, StackEvent};
use crate::validation::ValidationDetail;

/// Fine-grained step label of a run.
///
/// Validation runs stop at `ValidationComplete` or `ValidationFailed`.
/// Deployment runs continue from `ValidationComplete` into the deployment
/// phases. A run never re-enters an in-progress phase once terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowPhase {
    ValidationInProgress,
    ValidationComplete,
    ValidationFailed,
    DeploymentInProgress,
    DeploymentComplete,
    DeploymentFailed,
}

impl WorkflowPhase {
    /// Whether a run in `self` may move to `next`. Staying put is allowed.
    pub fn can_advance_to(self, next: WorkflowPhase) -> bool {
        use WorkflowPhase::*;
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (ValidationInProgress, ValidationComplete)
                | (ValidationInProgress, ValidationFailed)
                | (ValidationComplete, DeploymentInProgress)
                | (ValidationComplete, DeploymentFailed)
                | (DeploymentInProgress, DeploymentComplete)
                | (DeploymentInProgress, DeploymentFailed)
        )
    }

    pub fn is_in_progress(self) -> bool {
        matches!(
            self,
            WorkflowPhase::ValidationInProgress | WorkflowPhase::DeploymentInProgress
        )
    }
}

/// Coarse outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    InProgress,
    Successful,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        self != RunState::InProgress
    }
}

/// One run's evolving record.
///
/// Created once by `start` and only changed through [`WorkflowState::merge`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowState {
    pub id: String,
    pub stack_name: String,
    pub change_set_name: String,
    pub change_set_type: ChangeSetType,
    pub phase: WorkflowPhase,
    pub state: RunState,
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    /// Set when `state` first becomes terminal.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub end_time: Option<OffsetDateTime>,
    pub changes: Vec<StackChange>,
    pub validation_details: Vec<ValidationDetail>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_events: Option<Vec<StackEvent>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_mode: Option<DeploymentMode>,
}

impl WorkflowState {
    /// Initial record: `VALIDATION_IN_PROGRESS`, in progress, started now.
    pub fn new(
        id: impl Into<String>,
        stack_name: impl Into<String>,
        change_set_name: impl Into<String>,
        change_set_type: ChangeSetType,
        deployment_mode: Option<DeploymentMode>,
    ) -> Self {
        Self {
            id: id.into(),
            stack_name: stack_name.into(),
            change_set_name: change_set_name.into(),
            change_set_type,
            phase: WorkflowPhase::ValidationInProgress,
            state: RunState::InProgress,
            start_time: OffsetDateTime::now_utc(),
            end_time: None,
            changes: Vec::new(),
            validation_details: Vec::new(),
            failure_reason: None,
            deployment_events: None,
            deployment_mode,
        }
    }

    /// Apply a partial update.
    ///
    /// Fields absent from `update` are left untouched; present fields
    /// overwrite. A phase that would move the run backwards is ignored and
    /// reported by returning `false`.
    pub fn merge(&mut self, update: WorkflowUpdate) -> bool {
        let mut accepted = true;
        if let Some(phase) = update.phase {
            if self.phase.can_advance_to(phase) {
                self.phase = phase;
            } else {
                accepted = false;
            }
        }
        if let Some(state) = update.state {
            if !self.state.is_terminal() || state.is_terminal() {
                self.state = state;
            } else {
                accepted = false;
            }
        }
        if let Some(changes) = update.changes {
            self.changes = changes;
        }
        if let Some(details) = update.validation_details {
            self.validation_details = details;
        }
        if let Some(reason) = update.failure_reason {
            self.failure_reason = Some(reason);
        }
        if let Some(events) = update.deployment_events {
            self.deployment_events = Some(events);
        }
        if self.state.is_terminal() && self.end_time.is_none() {
            self.end_time = Some(OffsetDateTime::now_utc());
        }
        accepted
    }

    pub fn status(&self) -> WorkflowStatus {
        WorkflowStatus {
            id: self.id.clone(),
            phase: self.phase,
            state: self.state,
            changes: self.changes.clone(),
        }
    }

    pub fn describe(&self) -> WorkflowDescription {
        WorkflowDescription {
            id: self.id.clone(),
            phase: self.phase,
            state: self.state,
            changes: self.changes.clone(),
            validation_details: self.validation_details.clone(),
            failure_reason: self.failure_reason.clone(),
            deployment_mode: self.deployment_mode,
            deployment_events: self.deployment_events.clone(),
        }
    }
}

/// A partial update to a [`WorkflowState`]; `None` means "leave as is".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkflowUpdate {
    pub phase: Option<WorkflowPhase>,
    pub state: Option<RunState>,
    pub changes: Option<Vec<StackChange>>,
    pub validation_details: Option<Vec<ValidationDetail>>,
    pub failure_reason: Option<String>,
    pub deployment_events: Option<Vec<StackEvent>>,
}

impl WorkflowUpdate {
    pub fn phase(phase: WorkflowPhase, state: RunState) -> Self {
        Self {
            phase: Some(phase),
            state: Some(state),
            ..Default::default()
        }
    }

    /// A terminal failure in `phase` with a human-readable reason.
    pub fn failed(phase: WorkflowPhase, reason: impl Into<String>) -> Self {
        Self {
            phase: Some(phase),
            state: Some(RunState::Failed),
            failure_reason: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn with_changes(mut self, changes: Vec<StackChange>) -> Self {
        self.changes = Some(changes);
        self
    }

    pub fn with_details(mut self, details: Vec<ValidationDetail>) -> Self {
        self.validation_details = Some(details);
        self
    }

    pub fn with_reason(mut self, reason: Option<String>) -> Self {
        self.failure_reason = reason;
        self
    }

    /// Combine two updates; fields set in `later` win.
    pub fn and(self, later: WorkflowUpdate) -> WorkflowUpdate {
        WorkflowUpdate {
            phase: later.phase.or(self.phase),
            state: later.state.or(self.state),
            changes: later.changes.or(self.changes),
            validation_details: later.validation_details.or(self.validation_details),
            failure_reason: later.failure_reason.or(self.failure_reason),
            deployment_events: later.deployment_events.or(self.deployment_events),
        }
    }
}

/// Result of `getStatus`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStatus {
    pub id: String,
    pub phase: WorkflowPhase,
    pub state: RunState,
    pub changes: Vec<StackChange>,
}

/// Result of `describeStatus`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDescription {
    pub id: String,
    pub phase: WorkflowPhase,
    pub state: RunState,
    pub changes: Vec<StackChange>,
    pub validation_details: Vec<ValidationDetail>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_mode: Option<DeploymentMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_events: Option<Vec<StackEvent>>,
}

/// Acknowledgement returned by `start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub id: String,
    pub change_set_name: String,
    pub stack_name: String,
}
