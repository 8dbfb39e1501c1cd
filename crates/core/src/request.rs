//! Caller input to a validation or deployment workflow.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A single template parameter override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Parameter {
    pub key: String,
    pub value: String,
}

impl Parameter {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// An existing resource to bring under management with an `IMPORT` change set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceToImport {
    pub resource_type: String,
    pub logical_resource_id: String,
    /// Provider identifier properties, e.g. `{"BucketName": "my-bucket"}`.
    #[serde(default)]
    pub resource_identifier: BTreeMap<String, String>,
}

/// Upload location for templates too large to submit inline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateUpload {
    pub bucket: String,
    pub key: String,
}

impl TemplateUpload {
    /// The URL form the orchestration API accepts as a template location.
    pub fn template_url(&self) -> String {
        format!("https://{}.s3.amazonaws.com/{}", self.bucket, self.key)
    }
}

/// How the change set should reconcile the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentMode {
    Standard,
    RevertDrift,
}

impl DeploymentMode {
    pub fn as_str(self) -> &'static str {
        match self {
            DeploymentMode::Standard => "STANDARD",
            DeploymentMode::RevertDrift => "REVERT_DRIFT",
        }
    }
}

/// Input to `start` for both workflow kinds. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRequest {
    /// Caller-supplied correlation id; becomes the workflow id.
    pub id: String,
    pub uri: String,
    pub stack_name: String,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources_to_import: Option<Vec<ResourceToImport>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_change_set: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload: Option<TemplateUpload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_mode: Option<DeploymentMode>,
}

impl WorkflowRequest {
    pub fn new(
        id: impl Into<String>,
        uri: impl Into<String>,
        stack_name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            uri: uri.into(),
            stack_name: stack_name.into(),
            parameters: Vec::new(),
            capabilities: Vec::new(),
            resources_to_import: None,
            keep_change_set: None,
            upload: None,
            deployment_mode: None,
        }
    }

    /// Resources to import, treating an absent list as empty.
    pub fn imports(&self) -> &[ResourceToImport] {
        self.resources_to_import.as_deref().unwrap_or_default()
    }

    pub fn keeps_change_set(&self) -> bool {
        self.keep_change_set.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_minimal_request_with_defaults() {
        let req: WorkflowRequest = serde_json::from_value(serde_json::json!({
            "id": "wf-1",
            "uri": "file:///tmp/template.yaml",
            "stackName": "app"
        }))
        .unwrap();
        assert_eq!(req.stack_name, "app");
        assert!(req.parameters.is_empty());
        assert!(req.imports().is_empty());
        assert!(!req.keeps_change_set());
        assert_eq!(req.deployment_mode, None);
    }

    #[test]
    fn deserializes_full_request() {
        let req: WorkflowRequest = serde_json::from_value(serde_json::json!({
            "id": "wf-2",
            "uri": "file:///tmp/template.json",
            "stackName": "app",
            "parameters": [{"key": "Env", "value": "prod"}],
            "capabilities": ["CAPABILITY_IAM"],
            "resourcesToImport": [{
                "resourceType": "AWS::S3::Bucket",
                "logicalResourceId": "Bucket",
                "resourceIdentifier": {"BucketName": "existing"}
            }],
            "keepChangeSet": true,
            "upload": {"bucket": "templates", "key": "app.json"},
            "deploymentMode": "REVERT_DRIFT"
        }))
        .unwrap();
        assert_eq!(req.parameters, vec![Parameter::new("Env", "prod")]);
        assert_eq!(req.imports().len(), 1);
        assert!(req.keeps_change_set());
        assert_eq!(req.deployment_mode, Some(DeploymentMode::RevertDrift));
        assert_eq!(
            req.upload.unwrap().template_url(),
            "https://templates.s3.amazonaws.com/app.json"
        );
    }
}
