//! Validation findings and the stack-name-keyed validation record.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::request::{Parameter, TemplateUpload};
use crate::stack::StackChange;
use crate::workflow::WorkflowPhase;

/// Severity of a validation finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationSeverity {
    Error,
    Info,
}

/// One parsed validation finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationDetail {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// Name of the validation rule that produced the finding.
    pub validation_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logical_id: Option<String>,
    pub message: String,
    pub severity: ValidationSeverity,
    /// Slash-delimited path, e.g. `/Resources/Bucket/Properties/BucketName`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_property_path: Option<String>,
    /// Correlation id of the editor diagnostic issued for this finding, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic_id: Option<String>,
}

impl ValidationDetail {
    /// A finding produced by the engine itself rather than the remote API.
    pub fn synthesized(
        validation_name: impl Into<String>,
        message: impl Into<String>,
        severity: ValidationSeverity,
    ) -> Self {
        Self {
            timestamp: OffsetDateTime::now_utc(),
            validation_name: validation_name.into(),
            logical_id: None,
            message: message.into(),
            severity,
            resource_property_path: None,
            diagnostic_id: None,
        }
    }
}

/// The current validation against one stack, independent of workflow id.
///
/// At most one lives per stack name; see the engine's `ValidationRegistry`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Validation {
    pub uri: String,
    pub stack_name: String,
    pub change_set_name: String,
    pub parameters: Vec<Parameter>,
    pub capabilities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload: Option<TemplateUpload>,
    pub phase: WorkflowPhase,
    pub changes: Vec<StackChange>,
    pub validation_details: Vec<ValidationDetail>,
}
