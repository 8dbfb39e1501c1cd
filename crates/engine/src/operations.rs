//! Stateless stack-action operations composed by the workflow runs.
//!
//! Everything here talks to the remote API through [`StackApi`] and to the
//! editor through the [`DiagnosticCoordinator`]; no state is kept between
//! calls.

use lsp_types::{Diagnostic, DiagnosticSeverity, NumberOrString, Range};
use rand::distributions::Alphanumeric;
use rand::Rng;
use stackward_core::{
    ChangeDetail, ChangeSetType, ResourceChange, StackChange, StackEvent, ValidationDetail,
    ValidationSeverity, WorkflowRequest,
};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::api::{
    waiter_failure_reason, CreateChangeSetInput, DescribeEventsInput, OperationEvent, RawChange,
    StackApi, StackWaitTarget, TemplateSource, REVIEW_IN_PROGRESS, VALIDATION_ERROR_EVENT,
};
use crate::collaborators::{SyntaxTree, SyntaxTreeProvider, TemplateDocument};
use crate::diagnostics::DiagnosticCoordinator;
use crate::error::{ApiError, DiagnosticsError};
use crate::retry::{self, RetryError, RetryOptions};

/// Prefix of every change set this engine creates.
pub const CHANGE_SET_PREFIX: &str = "stackward-";

/// Diagnostic source tag for validation findings.
pub const VALIDATION_SOURCE: &str = "stackward-validation";

const MAX_CHANGE_SET_NAME_LEN: usize = 128;
const CHANGE_SET_SUFFIX_LEN: usize = 8;

/// Outcome of waiting for a change set or stack to reach a terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalResult {
    Succeeded {
        changes: Vec<StackChange>,
        next_token: Option<String>,
    },
    Failed {
        reason: Option<String>,
    },
}

/// Build a unique change-set name: prefix, sanitized workflow id, random suffix.
pub fn change_set_name(workflow_id: &str) -> String {
    let sanitized: String = workflow_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(CHANGE_SET_SUFFIX_LEN)
        .map(char::from)
        .collect();
    let budget = MAX_CHANGE_SET_NAME_LEN - CHANGE_SET_PREFIX.len() - CHANGE_SET_SUFFIX_LEN - 1;
    let id_part: String = sanitized.chars().take(budget).collect();
    format!("{}{}-{}", CHANGE_SET_PREFIX, id_part, suffix)
}

/// Pick the change-set type for a request.
///
/// `IMPORT` when resources are being imported (the stack is not queried).
/// Otherwise `CREATE` when the stack is absent or still in review, else
/// `UPDATE`. A failed lookup is treated as "absent".
pub async fn resolve_change_set_type(api: &dyn StackApi, request: &WorkflowRequest) -> ChangeSetType {
    if !request.imports().is_empty() {
        return ChangeSetType::Import;
    }
    match api.describe_stack(&request.stack_name).await {
        Ok(Some(stack)) if stack.stack_status != REVIEW_IN_PROGRESS => ChangeSetType::Update,
        Ok(_) => ChangeSetType::Create,
        Err(err) => {
            tracing::debug!(
                stack_name = %request.stack_name,
                error = %err,
                "stack lookup failed, assuming CREATE"
            );
            ChangeSetType::Create
        }
    }
}

/// Submit a change set for `request` and return its name.
pub async fn create_change_set(
    api: &dyn StackApi,
    request: &WorkflowRequest,
    document: &TemplateDocument,
    change_set_type: ChangeSetType,
) -> Result<String, ApiError> {
    let name = change_set_name(&request.id);
    let template = match &request.upload {
        Some(upload) => TemplateSource::Url(upload.template_url()),
        None => TemplateSource::Body(document.body.clone()),
    };
    api.create_change_set(CreateChangeSetInput {
        stack_name: request.stack_name.clone(),
        change_set_name: name.clone(),
        change_set_type,
        template,
        parameters: request.parameters.clone(),
        capabilities: request.capabilities.clone(),
        resources_to_import: request.imports().to_vec(),
        deployment_mode: request.deployment_mode,
    })
    .await?;
    tracing::info!(
        workflow_id = %request.id,
        stack_name = %request.stack_name,
        change_set_name = %name,
        change_set_type = %change_set_type,
        "created change set"
    );
    Ok(name)
}

/// Wait for change-set creation, then fetch its normalized changes.
pub async fn wait_for_change_set_terminal(
    api: &dyn StackApi,
    stack_name: &str,
    change_set_name: &str,
) -> TerminalResult {
    let outcome = api
        .wait_for_change_set_created(stack_name, change_set_name)
        .await;
    if let Some(reason) = waiter_failure_reason(&outcome) {
        return TerminalResult::Failed {
            reason: Some(reason),
        };
    }
    match api
        .describe_change_set(stack_name, change_set_name, true, None)
        .await
    {
        Ok(description) => TerminalResult::Succeeded {
            changes: map_changes(description.changes),
            next_token: description.next_token,
        },
        Err(err) => TerminalResult::Failed {
            reason: Some(err.reason()),
        },
    }
}

/// Wait for a deployment using the waiter that matches its change-set type.
pub async fn wait_for_deployment_terminal(
    api: &dyn StackApi,
    stack_name: &str,
    target: StackWaitTarget,
) -> TerminalResult {
    let outcome = api.wait_for_stack(stack_name, target).await;
    match waiter_failure_reason(&outcome) {
        None => TerminalResult::Succeeded {
            changes: Vec::new(),
            next_token: None,
        },
        Some(reason) => TerminalResult::Failed {
            reason: Some(reason),
        },
    }
}

/// Page through every failure event recorded for a change set.
pub async fn fetch_all_failure_events(
    api: &dyn StackApi,
    stack_name: &str,
    change_set_name: &str,
) -> Result<Vec<OperationEvent>, ApiError> {
    let mut events = Vec::new();
    let mut next_token = None;
    loop {
        let page = api
            .describe_events(DescribeEventsInput {
                stack_name: stack_name.to_string(),
                change_set_name: change_set_name.to_string(),
                failures_only: true,
                next_token,
            })
            .await?;
        events.extend(page.events);
        match page.next_token {
            Some(token) if !token.is_empty() => next_token = Some(token),
            _ => break,
        }
    }
    Ok(events)
}

/// Keep only validation errors and map them to [`ValidationDetail`]s.
pub fn normalize_validation_events(events: &[OperationEvent]) -> Vec<ValidationDetail> {
    events
        .iter()
        .filter(|event| event.event_type.as_deref() == Some(VALIDATION_ERROR_EVENT))
        .map(|event| {
            let name = event.validation_name.clone().unwrap_or_default();
            let message = match (&event.validation_name, &event.validation_status_reason) {
                (Some(name), Some(reason)) => format!("{}: {}", name, reason),
                (None, Some(reason)) => reason.clone(),
                (Some(name), None) => name.clone(),
                (None, None) => "Validation failed".to_string(),
            };
            let severity = if event.validation_failure_mode.as_deref() == Some("FAIL") {
                ValidationSeverity::Error
            } else {
                ValidationSeverity::Info
            };
            ValidationDetail {
                timestamp: event
                    .timestamp
                    .as_deref()
                    .and_then(|ts| OffsetDateTime::parse(ts, &Rfc3339).ok())
                    .unwrap_or_else(OffsetDateTime::now_utc),
                validation_name: name,
                logical_id: event.logical_resource_id.clone(),
                message,
                severity,
                resource_property_path: event.validation_path.clone(),
                diagnostic_id: None,
            }
        })
        .collect()
}

/// Map raw change-set entries into [`StackChange`] rows.
pub fn map_changes(raw: Vec<RawChange>) -> Vec<StackChange> {
    raw.into_iter()
        .map(|change| StackChange {
            change_type: change.change_type.unwrap_or_else(|| "Resource".to_string()),
            resource_change: change.resource_change.map(|rc| ResourceChange {
                action: rc.action,
                logical_resource_id: rc.logical_resource_id,
                physical_resource_id: rc.physical_resource_id,
                resource_type: rc.resource_type,
                replacement: rc.replacement,
                scope: rc.scope.unwrap_or_default(),
                before_context: rc.before_context,
                after_context: rc.after_context,
                details: rc
                    .details
                    .unwrap_or_default()
                    .into_iter()
                    .map(|detail| {
                        let target = detail.target.unwrap_or_default();
                        ChangeDetail {
                            attribute: target.attribute,
                            name: target.name,
                            requires_recreation: target.requires_recreation,
                            evaluation: detail.evaluation,
                            change_source: detail.change_source,
                            causing_entity: detail.causing_entity,
                        }
                    })
                    .collect(),
            }),
        })
        .collect()
}

/// Source span for a finding: its property path if resolvable, else the
/// whole named resource.
pub fn locate_detail(tree: &dyn SyntaxTree, detail: &ValidationDetail) -> Option<Range> {
    let by_path = detail.resource_property_path.as_deref().and_then(|path| {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if segments.is_empty() {
            None
        } else {
            tree.resolve_path(&segments)
        }
    });
    by_path.or_else(|| {
        detail
            .logical_id
            .as_deref()
            .and_then(|id| tree.resolve_path(&["Resources", id]))
    })
}

/// Publish one editor diagnostic per locatable finding, as one batch.
///
/// Each published finding gets a fresh correlation id, stored both in the
/// diagnostic's `data` and on the detail. Findings without a span are
/// skipped. Returns the number of diagnostics published.
pub fn publish_positioned_diagnostics(
    coordinator: &DiagnosticCoordinator,
    trees: &dyn SyntaxTreeProvider,
    uri: &str,
    details: &mut [ValidationDetail],
) -> Result<usize, DiagnosticsError> {
    let tree = trees.tree(uri);
    let mut diagnostics = Vec::new();
    for detail in details.iter_mut() {
        let Some(range) = tree.as_deref().and_then(|tree| locate_detail(tree, detail)) else {
            tracing::debug!(uri, validation = %detail.validation_name, "no span for finding");
            continue;
        };
        let id = uuid::Uuid::new_v4().to_string();
        diagnostics.push(Diagnostic {
            range,
            severity: Some(match detail.severity {
                ValidationSeverity::Error => DiagnosticSeverity::ERROR,
                ValidationSeverity::Info => DiagnosticSeverity::INFORMATION,
            }),
            code: (!detail.validation_name.is_empty())
                .then(|| NumberOrString::String(detail.validation_name.clone())),
            source: Some(VALIDATION_SOURCE.to_string()),
            message: detail.message.clone(),
            data: Some(serde_json::json!({ "diagnosticId": id })),
            ..Default::default()
        });
        detail.diagnostic_id = Some(id);
    }
    let count = diagnostics.len();
    coordinator.publish(VALIDATION_SOURCE, uri, diagnostics)?;
    Ok(count)
}

/// Delete a change set, retrying per `policy`.
pub async fn delete_change_set(
    api: &dyn StackApi,
    policy: &RetryOptions,
    stack_name: &str,
    change_set_name: &str,
) -> Result<(), RetryError<ApiError>> {
    retry::run(&policy.named("DeleteChangeSet"), || {
        api.delete_change_set(stack_name, change_set_name)
    })
    .await
}

/// Delete the change set, then the stack it left in review.
///
/// The stack delete is attempted whether or not the change-set delete
/// succeeded; a change-set failure is logged here.
pub async fn delete_stack_and_change_set(
    api: &dyn StackApi,
    policy: &RetryOptions,
    stack_name: &str,
    change_set_name: &str,
) -> Result<(), RetryError<ApiError>> {
    if let Err(err) = delete_change_set(api, policy, stack_name, change_set_name).await {
        tracing::warn!(
            stack_name,
            change_set_name,
            error = %err,
            "change set cleanup failed before stack delete"
        );
    }
    retry::run(&policy.named("DeleteStack"), || api.delete_stack(stack_name)).await
}

/// Recent stack events, for display after a deployment.
pub async fn collect_stack_events(
    api: &dyn StackApi,
    stack_name: &str,
    limit: usize,
) -> Result<Vec<StackEvent>, ApiError> {
    api.describe_stack_events(stack_name, limit).await
}
