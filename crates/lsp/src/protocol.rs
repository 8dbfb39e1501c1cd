//! Custom request methods and their parameter shapes.
//!
//! `*/start` takes a `WorkflowRequest` and answers with a `StartResponse`;
//! `*/status` and `*/describe` take [`WorkflowIdParams`].

use serde::{Deserialize, Serialize};

pub const VALIDATION_START: &str = "stackward/validation/start";
pub const VALIDATION_STATUS: &str = "stackward/validation/status";
pub const VALIDATION_DESCRIBE: &str = "stackward/validation/describe";
pub const DEPLOYMENT_START: &str = "stackward/deployment/start";
pub const DEPLOYMENT_STATUS: &str = "stackward/deployment/status";
pub const DEPLOYMENT_DESCRIBE: &str = "stackward/deployment/describe";
pub const DIAGNOSTICS_DISMISS: &str = "stackward/diagnostics/dismiss";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowIdParams {
    pub id: String,
}

/// Retract one previously published validation diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DismissParams {
    pub uri: String,
    pub diagnostic_id: String,
}
