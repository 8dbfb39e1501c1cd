//! In-process simulation of the stack-orchestration service.
//!
//! `LocalStackApi` keeps stacks and change sets in memory and derives
//! change sets by diffing the `Resources` section of the submitted template
//! (JSON or YAML) against the deployed stack. It backs the CLI when no
//! remote client is configured and stands in for the service in tests:
//! failures can be scripted per operation, per change set and per
//! deployment, and every call is logged.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use stackward_core::{ChangeSetType, StackEvent};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::api::{
    ChangeSetDescription, CreateChangeSetInput, DescribeEventsInput, EventsPage, OperationEvent,
    RawChange, RawResourceChange, StackApi, StackSummary, StackWaitTarget, TemplateSource,
    WaiterOutcome, REVIEW_IN_PROGRESS,
};
use crate::error::ApiError;

/// Operations recorded in the call log and addressable by `fail_next`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiOperation {
    DescribeStack,
    CreateChangeSet,
    DescribeChangeSet,
    DeleteChangeSet,
    ExecuteChangeSet,
    DeleteStack,
    WaitForChangeSet,
    WaitForStack,
    DescribeEvents,
    DescribeStackEvents,
}

const NO_CHANGES_REASON: &str =
    "The submitted information didn't contain changes. Submit different information to create a change set.";

#[derive(Debug, Clone, PartialEq, Eq)]
struct ResourceSpec {
    resource_type: String,
    /// Canonical rendering of the resource's `Properties`, for change detection.
    properties: String,
}

#[derive(Debug, Clone)]
struct StackRecord {
    status: String,
    resources: BTreeMap<String, ResourceSpec>,
}

#[derive(Debug, Clone)]
struct ChangeSetRecord {
    change_set_type: ChangeSetType,
    status: String,
    status_reason: Option<String>,
    changes: Vec<RawChange>,
    resources: BTreeMap<String, ResourceSpec>,
}

#[derive(Default)]
struct LocalState {
    stacks: HashMap<String, StackRecord>,
    change_sets: HashMap<(String, String), ChangeSetRecord>,
    uploaded_templates: HashMap<String, String>,
    validation_events: HashMap<String, Vec<OperationEvent>>,
    change_set_failures: HashMap<String, String>,
    deployment_failures: HashMap<String, String>,
    stack_events: HashMap<String, Vec<StackEvent>>,
    scripted_errors: HashMap<ApiOperation, VecDeque<ApiError>>,
    /// Tokens already honoured, per change set.
    execute_tokens: HashSet<((String, String), String)>,
    calls: Vec<ApiOperation>,
    event_sequence: u64,
}

/// In-memory stack-orchestration backend.
pub struct LocalStackApi {
    state: Mutex<LocalState>,
    event_page_size: usize,
    wait_delay: Duration,
}

impl Default for LocalStackApi {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalStackApi {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LocalState::default()),
            event_page_size: 100,
            wait_delay: Duration::ZERO,
        }
    }

    /// Page size for `describe_events`.
    pub fn with_event_page_size(mut self, size: usize) -> Self {
        self.event_page_size = size.max(1);
        self
    }

    /// Simulated latency of every waiter.
    pub fn with_wait_delay(mut self, delay: Duration) -> Self {
        self.wait_delay = delay;
        self
    }

    fn lock(&self) -> MutexGuard<'_, LocalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Log the call and surface a scripted error, if any.
    fn begin(&self, operation: ApiOperation) -> Result<MutexGuard<'_, LocalState>, ApiError> {
        let mut state = self.lock();
        state.calls.push(operation);
        match state
            .scripted_errors
            .get_mut(&operation)
            .and_then(VecDeque::pop_front)
        {
            Some(err) => Err(err),
            None => Ok(state),
        }
    }

    // ── Scripting ────────────────────────────────────────────────────────

    /// Make the next call to `operation` fail with `error`. Queues.
    pub fn fail_next(&self, operation: ApiOperation, error: ApiError) {
        self.lock()
            .scripted_errors
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    /// Put a stack in `CREATE_COMPLETE` with the resources of `template`.
    pub fn deploy_stack(&self, stack_name: &str, template: &str) {
        let resources = parse_resources(template).unwrap_or_default();
        self.lock().stacks.insert(
            stack_name.to_string(),
            StackRecord {
                status: "CREATE_COMPLETE".to_string(),
                resources,
            },
        );
    }

    /// Make the template at `url` available to change sets created from it.
    pub fn upload_template(&self, url: &str, body: &str) {
        self.lock()
            .uploaded_templates
            .insert(url.to_string(), body.to_string());
    }

    /// Events returned by `describe_events` for any change set on `stack_name`.
    pub fn script_validation_events(&self, stack_name: &str, events: Vec<OperationEvent>) {
        self.lock()
            .validation_events
            .insert(stack_name.to_string(), events);
    }

    /// The next change set on `stack_name` ends `FAILED` with `reason`.
    pub fn fail_change_set(&self, stack_name: &str, reason: &str) {
        self.lock()
            .change_set_failures
            .insert(stack_name.to_string(), reason.to_string());
    }

    /// The next execution against `stack_name` rolls back with `reason`.
    pub fn fail_deployment(&self, stack_name: &str, reason: &str) {
        self.lock()
            .deployment_failures
            .insert(stack_name.to_string(), reason.to_string());
    }

    // ── Inspection ───────────────────────────────────────────────────────

    pub fn calls(&self) -> Vec<ApiOperation> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self, operation: ApiOperation) -> usize {
        self.lock().calls.iter().filter(|op| **op == operation).count()
    }

    pub fn stack_status(&self, stack_name: &str) -> Option<String> {
        self.lock()
            .stacks
            .get(stack_name)
            .map(|stack| stack.status.clone())
    }

    pub fn change_set_exists(&self, stack_name: &str, change_set_name: &str) -> bool {
        self.lock()
            .change_sets
            .contains_key(&(stack_name.to_string(), change_set_name.to_string()))
    }

    pub fn change_set_names(&self, stack_name: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock()
            .change_sets
            .keys()
            .filter(|(stack, _)| stack == stack_name)
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        names
    }
}

/// Extract `Resources` from a JSON or YAML template.
fn parse_resources(template: &str) -> Result<BTreeMap<String, ResourceSpec>, String> {
    let value: serde_yaml::Value = serde_yaml::from_str(template).map_err(|e| e.to_string())?;
    let Some(resources) = value.get("Resources") else {
        return Err("Template format error: At least one Resources member must be defined.".into());
    };
    let Some(mapping) = resources.as_mapping() else {
        return Err("Template format error: Resources must be a mapping.".into());
    };
    let mut specs = BTreeMap::new();
    for (key, body) in mapping {
        let Some(logical_id) = key.as_str() else {
            continue;
        };
        let resource_type = body
            .get("Type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| {
                format!(
                    "Template format error: [/Resources/{}] Every Resources object must contain a Type member.",
                    logical_id
                )
            })?
            .to_string();
        let properties = body
            .get("Properties")
            .map(|p| serde_yaml::to_string(p).unwrap_or_default())
            .unwrap_or_default();
        specs.insert(
            logical_id.to_string(),
            ResourceSpec {
                resource_type,
                properties,
            },
        );
    }
    Ok(specs)
}

fn physical_id(stack_name: &str, logical_id: &str) -> String {
    format!("{}-{}", stack_name, logical_id).to_lowercase()
}

fn resource_change(action: &str, logical_id: &str, resource_type: &str) -> RawChange {
    RawChange {
        change_type: Some("Resource".to_string()),
        resource_change: Some(RawResourceChange {
            action: Some(action.to_string()),
            logical_resource_id: Some(logical_id.to_string()),
            resource_type: Some(resource_type.to_string()),
            ..Default::default()
        }),
    }
}

fn diff_resources(
    stack_name: &str,
    old: &BTreeMap<String, ResourceSpec>,
    new: &BTreeMap<String, ResourceSpec>,
) -> Vec<RawChange> {
    let mut changes = Vec::new();
    for (logical_id, spec) in new {
        match old.get(logical_id) {
            None => changes.push(resource_change("Add", logical_id, &spec.resource_type)),
            Some(previous) if previous != spec => {
                let mut change = resource_change("Modify", logical_id, &spec.resource_type);
                if let Some(rc) = change.resource_change.as_mut() {
                    rc.physical_resource_id = Some(physical_id(stack_name, logical_id));
                    rc.replacement = Some(
                        if previous.resource_type == spec.resource_type {
                            "False"
                        } else {
                            "True"
                        }
                        .to_string(),
                    );
                    rc.scope = Some(vec!["Properties".to_string()]);
                }
                changes.push(change);
            }
            Some(_) => {}
        }
    }
    for (logical_id, spec) in old {
        if !new.contains_key(logical_id) {
            let mut change = resource_change("Remove", logical_id, &spec.resource_type);
            if let Some(rc) = change.resource_change.as_mut() {
                rc.physical_resource_id = Some(physical_id(stack_name, logical_id));
            }
            changes.push(change);
        }
    }
    changes
}

fn now_rfc3339() -> Option<String> {
    OffsetDateTime::now_utc().format(&Rfc3339).ok()
}

fn not_found(stack_name: &str, change_set_name: &str) -> ApiError {
    ApiError::new(
        "ChangeSetNotFoundException",
        format!(
            "ChangeSet [{}] does not exist for stack [{}]",
            change_set_name, stack_name
        ),
    )
}

impl LocalState {
    fn push_stack_event(
        &mut self,
        stack_name: &str,
        logical_id: &str,
        resource_type: &str,
        status: &str,
        reason: Option<String>,
    ) {
        self.event_sequence += 1;
        let event = StackEvent {
            event_id: format!("{}-{}", stack_name, self.event_sequence),
            logical_resource_id: Some(logical_id.to_string()),
            resource_type: Some(resource_type.to_string()),
            resource_status: Some(status.to_string()),
            resource_status_reason: reason,
            timestamp: now_rfc3339(),
        };
        self.stack_events
            .entry(stack_name.to_string())
            .or_default()
            .push(event);
    }
}

#[async_trait]
impl StackApi for LocalStackApi {
    async fn describe_stack(&self, stack_name: &str) -> Result<Option<StackSummary>, ApiError> {
        let state = self.begin(ApiOperation::DescribeStack)?;
        Ok(state.stacks.get(stack_name).map(|stack| StackSummary {
            stack_name: stack_name.to_string(),
            stack_status: stack.status.clone(),
        }))
    }

    async fn create_change_set(&self, input: CreateChangeSetInput) -> Result<(), ApiError> {
        let mut state = self.begin(ApiOperation::CreateChangeSet)?;
        let key = (input.stack_name.clone(), input.change_set_name.clone());
        if state.change_sets.contains_key(&key) {
            return Err(ApiError::new(
                "AlreadyExistsException",
                format!("ChangeSet [{}] already exists", input.change_set_name),
            ));
        }

        let existing = state.stacks.get(&input.stack_name).cloned();
        let in_review = existing
            .as_ref()
            .is_some_and(|stack| stack.status == REVIEW_IN_PROGRESS);
        match input.change_set_type {
            ChangeSetType::Create if existing.is_some() && !in_review => {
                return Err(ApiError::new(
                    "ValidationError",
                    format!(
                        "Stack [{}] already exists and cannot be created again with the changeSet [{}].",
                        input.stack_name, input.change_set_name
                    ),
                ));
            }
            ChangeSetType::Update if existing.is_none() || in_review => {
                return Err(ApiError::new(
                    "ValidationError",
                    format!("Stack [{}] does not exist", input.stack_name),
                ));
            }
            _ => {}
        }

        let body = match &input.template {
            TemplateSource::Body(body) => Ok(body.clone()),
            TemplateSource::Url(url) => state
                .uploaded_templates
                .get(url)
                .cloned()
                .ok_or_else(|| format!("Template URL [{}] could not be retrieved", url)),
        };
        let deployed = existing
            .as_ref()
            .map(|stack| stack.resources.clone())
            .unwrap_or_default();
        let parsed = body.and_then(|body| parse_resources(&body));

        let (status, status_reason, changes, resources) = match parsed {
            Err(reason) => ("FAILED", Some(reason), Vec::new(), deployed),
            Ok(resources) => {
                let changes = match input.change_set_type {
                    ChangeSetType::Import => input
                        .resources_to_import
                        .iter()
                        .map(|r| resource_change("Import", &r.logical_resource_id, &r.resource_type))
                        .collect(),
                    _ => diff_resources(&input.stack_name, &deployed, &resources),
                };
                if let Some(reason) = state.change_set_failures.remove(&input.stack_name) {
                    ("FAILED", Some(reason), Vec::new(), resources)
                } else if changes.is_empty() {
                    ("FAILED", Some(NO_CHANGES_REASON.to_string()), Vec::new(), resources)
                } else {
                    ("CREATE_COMPLETE", None, changes, resources)
                }
            }
        };

        if existing.is_none() {
            state.stacks.insert(
                input.stack_name.clone(),
                StackRecord {
                    status: REVIEW_IN_PROGRESS.to_string(),
                    resources: BTreeMap::new(),
                },
            );
        }
        state.change_sets.insert(
            key,
            ChangeSetRecord {
                change_set_type: input.change_set_type,
                status: status.to_string(),
                status_reason,
                changes,
                resources,
            },
        );
        Ok(())
    }

    async fn describe_change_set(
        &self,
        stack_name: &str,
        change_set_name: &str,
        _include_property_values: bool,
        _next_token: Option<String>,
    ) -> Result<ChangeSetDescription, ApiError> {
        let state = self.begin(ApiOperation::DescribeChangeSet)?;
        let record = state
            .change_sets
            .get(&(stack_name.to_string(), change_set_name.to_string()))
            .ok_or_else(|| not_found(stack_name, change_set_name))?;
        Ok(ChangeSetDescription {
            status: record.status.clone(),
            status_reason: record.status_reason.clone(),
            changes: record.changes.clone(),
            next_token: None,
        })
    }

    async fn delete_change_set(
        &self,
        stack_name: &str,
        change_set_name: &str,
    ) -> Result<(), ApiError> {
        let mut state = self.begin(ApiOperation::DeleteChangeSet)?;
        state
            .change_sets
            .remove(&(stack_name.to_string(), change_set_name.to_string()))
            .map(|_| ())
            .ok_or_else(|| not_found(stack_name, change_set_name))
    }

    async fn execute_change_set(
        &self,
        stack_name: &str,
        change_set_name: &str,
        client_request_token: &str,
    ) -> Result<(), ApiError> {
        let mut guard = self.begin(ApiOperation::ExecuteChangeSet)?;
        let state = &mut *guard;
        let key = (stack_name.to_string(), change_set_name.to_string());
        let token = (key.clone(), client_request_token.to_string());
        if state.execute_tokens.contains(&token) {
            return Ok(());
        }
        let record = match state.change_sets.get(&key) {
            Some(record) if record.status == "CREATE_COMPLETE" => record.clone(),
            Some(record) => {
                return Err(ApiError::new(
                    "InvalidChangeSetStatus",
                    format!(
                        "ChangeSet [{}] cannot be executed in its current status of [{}]",
                        change_set_name, record.status
                    ),
                ));
            }
            None => return Err(not_found(stack_name, change_set_name)),
        };
        state.execute_tokens.insert(token);

        let verb = match record.change_set_type {
            ChangeSetType::Create => "CREATE",
            ChangeSetType::Update => "UPDATE",
            ChangeSetType::Import => "IMPORT",
        };
        let failure = state.deployment_failures.remove(stack_name);
        for change in &record.changes {
            let Some(rc) = &change.resource_change else {
                continue;
            };
            let logical_id = rc.logical_resource_id.as_deref().unwrap_or_default();
            let resource_type = rc.resource_type.as_deref().unwrap_or_default();
            let (status, reason) = match &failure {
                Some(reason) => (format!("{}_FAILED", verb), Some(reason.clone())),
                None => (format!("{}_COMPLETE", verb), None),
            };
            state.push_stack_event(stack_name, logical_id, resource_type, &status, reason);
        }

        let previous = state.stacks.get(stack_name).cloned();
        let stack_status = match (&failure, record.change_set_type) {
            (None, _) => format!("{}_COMPLETE", verb),
            (Some(_), ChangeSetType::Create) => "ROLLBACK_COMPLETE".to_string(),
            (Some(_), _) => format!("{}_ROLLBACK_COMPLETE", verb),
        };
        let resources = match (&failure, previous) {
            (None, _) => record.resources.clone(),
            (Some(_), Some(previous)) => previous.resources,
            (Some(_), None) => BTreeMap::new(),
        };
        state.push_stack_event(
            stack_name,
            stack_name,
            "AWS::CloudFormation::Stack",
            &stack_status,
            failure.clone(),
        );
        state.stacks.insert(
            stack_name.to_string(),
            StackRecord {
                status: stack_status,
                resources,
            },
        );
        state.change_sets.retain(|(stack, _), _| stack != stack_name);
        Ok(())
    }

    async fn delete_stack(&self, stack_name: &str) -> Result<(), ApiError> {
        let mut state = self.begin(ApiOperation::DeleteStack)?;
        state.stacks.remove(stack_name);
        state.change_sets.retain(|(stack, _), _| stack != stack_name);
        Ok(())
    }

    async fn wait_for_change_set_created(
        &self,
        stack_name: &str,
        change_set_name: &str,
    ) -> Result<WaiterOutcome, ApiError> {
        if !self.wait_delay.is_zero() {
            tokio::time::sleep(self.wait_delay).await;
        }
        let state = self.begin(ApiOperation::WaitForChangeSet)?;
        let record = state
            .change_sets
            .get(&(stack_name.to_string(), change_set_name.to_string()))
            .ok_or_else(|| not_found(stack_name, change_set_name))?;
        Ok(match record.status.as_str() {
            "CREATE_COMPLETE" => WaiterOutcome::Success,
            _ => WaiterOutcome::Failure {
                reason: record.status_reason.clone(),
            },
        })
    }

    async fn wait_for_stack(
        &self,
        stack_name: &str,
        target: StackWaitTarget,
    ) -> Result<WaiterOutcome, ApiError> {
        if !self.wait_delay.is_zero() {
            tokio::time::sleep(self.wait_delay).await;
        }
        let state = self.begin(ApiOperation::WaitForStack)?;
        let Some(stack) = state.stacks.get(stack_name) else {
            return Ok(WaiterOutcome::Failure {
                reason: Some(format!("Stack [{}] does not exist", stack_name)),
            });
        };
        let expected = match target {
            StackWaitTarget::Created => "CREATE_COMPLETE",
            StackWaitTarget::Updated => "UPDATE_COMPLETE",
            StackWaitTarget::Imported => "IMPORT_COMPLETE",
        };
        if stack.status == expected {
            return Ok(WaiterOutcome::Success);
        }
        let reason = state
            .stack_events
            .get(stack_name)
            .and_then(|events| {
                events
                    .iter()
                    .rev()
                    .find_map(|e| e.resource_status_reason.clone())
            })
            .unwrap_or_else(|| "no reason reported".to_string());
        Ok(WaiterOutcome::Failure {
            reason: Some(format!(
                "Stack [{}] reached terminal status {}: {}",
                stack_name, stack.status, reason
            )),
        })
    }

    async fn describe_events(&self, input: DescribeEventsInput) -> Result<EventsPage, ApiError> {
        let state = self.begin(ApiOperation::DescribeEvents)?;
        let events: Vec<&OperationEvent> = state
            .validation_events
            .get(&input.stack_name)
            .map(|events| {
                events
                    .iter()
                    .filter(|event| {
                        !input.failures_only
                            || event
                                .event_type
                                .as_deref()
                                .is_some_and(|t| t.ends_with("ERROR") || t.ends_with("FAILURE"))
                    })
                    .collect()
            })
            .unwrap_or_default();
        let offset = match input.next_token.as_deref() {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| ApiError::new("ValidationError", "Invalid NextToken"))?,
            None => 0,
        };
        let end = (offset + self.event_page_size).min(events.len());
        let page = events
            .get(offset..end)
            .unwrap_or_default()
            .iter()
            .map(|event| (*event).clone())
            .collect();
        Ok(EventsPage {
            events: page,
            next_token: (end < events.len()).then(|| end.to_string()),
        })
    }

    async fn describe_stack_events(
        &self,
        stack_name: &str,
        limit: usize,
    ) -> Result<Vec<StackEvent>, ApiError> {
        let state = self.begin(ApiOperation::DescribeStackEvents)?;
        if !state.stacks.contains_key(stack_name) {
            return Err(ApiError::new(
                "ValidationError",
                format!("Stack with id {} does not exist", stack_name),
            ));
        }
        Ok(state
            .stack_events
            .get(stack_name)
            .map(|events| events.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackward_core::ResourceToImport;

    const ONE_BUCKET: &str = r#"{"Resources": {"Bucket": {"Type": "AWS::S3::Bucket"}}}"#;

    const BUCKET_AND_QUEUE_YAML: &str = "\
Resources:
  Bucket:
    Type: AWS::S3::Bucket
    Properties:
      BucketName: renamed
  Queue:
    Type: AWS::SQS::Queue
";

    fn input(
        stack: &str,
        name: &str,
        change_set_type: ChangeSetType,
        body: &str,
    ) -> CreateChangeSetInput {
        CreateChangeSetInput {
            stack_name: stack.to_string(),
            change_set_name: name.to_string(),
            change_set_type,
            template: TemplateSource::Body(body.to_string()),
            parameters: Vec::new(),
            capabilities: Vec::new(),
            resources_to_import: Vec::new(),
            deployment_mode: None,
        }
    }

    fn actions(description: &ChangeSetDescription) -> Vec<(String, String)> {
        description
            .changes
            .iter()
            .filter_map(|c| c.resource_change.as_ref())
            .map(|rc| {
                (
                    rc.action.clone().unwrap_or_default(),
                    rc.logical_resource_id.clone().unwrap_or_default(),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn create_puts_stack_in_review_and_adds_resources() {
        let api = LocalStackApi::new();
        api.create_change_set(input("app", "cs", ChangeSetType::Create, ONE_BUCKET))
            .await
            .unwrap();

        assert_eq!(api.stack_status("app").as_deref(), Some(REVIEW_IN_PROGRESS));
        assert_eq!(
            api.wait_for_change_set_created("app", "cs").await.unwrap(),
            WaiterOutcome::Success
        );
        let description = api.describe_change_set("app", "cs", true, None).await.unwrap();
        assert_eq!(actions(&description), vec![("Add".into(), "Bucket".into())]);
    }

    #[tokio::test]
    async fn update_diffs_against_deployed_resources() {
        let api = LocalStackApi::new();
        api.deploy_stack(
            "app",
            r#"{"Resources": {"Bucket": {"Type": "AWS::S3::Bucket"}, "Topic": {"Type": "AWS::SNS::Topic"}}}"#,
        );
        api.create_change_set(input(
            "app",
            "cs",
            ChangeSetType::Update,
            BUCKET_AND_QUEUE_YAML,
        ))
        .await
        .unwrap();

        let description = api.describe_change_set("app", "cs", true, None).await.unwrap();
        assert_eq!(
            actions(&description),
            vec![
                ("Modify".into(), "Bucket".into()),
                ("Add".into(), "Queue".into()),
                ("Remove".into(), "Topic".into()),
            ]
        );
    }

    #[tokio::test]
    async fn identical_template_fails_with_no_changes() {
        let api = LocalStackApi::new();
        api.deploy_stack("app", ONE_BUCKET);
        api.create_change_set(input("app", "cs", ChangeSetType::Update, ONE_BUCKET))
            .await
            .unwrap();

        match api.wait_for_change_set_created("app", "cs").await.unwrap() {
            WaiterOutcome::Failure { reason } => {
                assert!(reason.unwrap().contains("didn't contain changes"))
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_template_fails_change_set() {
        let api = LocalStackApi::new();
        api.create_change_set(input("app", "cs", ChangeSetType::Create, "Parameters: {}"))
            .await
            .unwrap();
        let description = api.describe_change_set("app", "cs", false, None).await.unwrap();
        assert_eq!(description.status, "FAILED");
        assert!(description
            .status_reason
            .unwrap()
            .contains("Template format error"));
    }

    #[tokio::test]
    async fn import_lists_imported_resources() {
        let api = LocalStackApi::new();
        let mut create = input("app", "cs", ChangeSetType::Import, ONE_BUCKET);
        create.resources_to_import = vec![ResourceToImport {
            resource_type: "AWS::S3::Bucket".into(),
            logical_resource_id: "Bucket".into(),
            resource_identifier: Default::default(),
        }];
        api.create_change_set(create).await.unwrap();
        let description = api.describe_change_set("app", "cs", true, None).await.unwrap();
        assert_eq!(actions(&description), vec![("Import".into(), "Bucket".into())]);
    }

    #[tokio::test]
    async fn execute_is_idempotent_per_token() {
        let api = LocalStackApi::new();
        api.create_change_set(input("app", "cs", ChangeSetType::Create, ONE_BUCKET))
            .await
            .unwrap();

        api.execute_change_set("app", "cs", "token-1").await.unwrap();
        api.execute_change_set("app", "cs", "token-1").await.unwrap();

        assert_eq!(api.stack_status("app").as_deref(), Some("CREATE_COMPLETE"));
        let events = api.describe_stack_events("app", 10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(
            api.wait_for_stack("app", StackWaitTarget::Created)
                .await
                .unwrap(),
            WaiterOutcome::Success
        );
    }

    #[tokio::test]
    async fn reused_token_on_a_new_change_set_executes() {
        let api = LocalStackApi::new();
        api.create_change_set(input("app", "cs-1", ChangeSetType::Create, ONE_BUCKET))
            .await
            .unwrap();
        api.execute_change_set("app", "cs-1", "dep").await.unwrap();

        api.create_change_set(input(
            "app",
            "cs-2",
            ChangeSetType::Update,
            BUCKET_AND_QUEUE_YAML,
        ))
        .await
        .unwrap();
        api.execute_change_set("app", "cs-2", "dep").await.unwrap();

        assert_eq!(api.stack_status("app").as_deref(), Some("UPDATE_COMPLETE"));
        assert!(api.change_set_names("app").is_empty());
        let events = api.describe_stack_events("app", 10).await.unwrap();
        assert!(events
            .iter()
            .any(|e| e.logical_resource_id.as_deref() == Some("Queue")));
    }

    #[tokio::test]
    async fn rejected_execute_does_not_burn_the_token() {
        let api = LocalStackApi::new();
        api.fail_change_set("app", "nope");
        api.create_change_set(input("app", "cs", ChangeSetType::Create, ONE_BUCKET))
            .await
            .unwrap();
        let err = api.execute_change_set("app", "cs", "t").await.unwrap_err();
        assert_eq!(err.code.as_deref(), Some("InvalidChangeSetStatus"));
        assert!(api.execute_change_set("app", "cs", "t").await.is_err());
    }

    #[tokio::test]
    async fn scripted_deployment_failure_rolls_back() {
        let api = LocalStackApi::new();
        api.fail_deployment("app", "Bucket name already taken");
        api.create_change_set(input("app", "cs", ChangeSetType::Create, ONE_BUCKET))
            .await
            .unwrap();
        api.execute_change_set("app", "cs", "t").await.unwrap();

        assert_eq!(api.stack_status("app").as_deref(), Some("ROLLBACK_COMPLETE"));
        match api
            .wait_for_stack("app", StackWaitTarget::Created)
            .await
            .unwrap()
        {
            WaiterOutcome::Failure { reason } => {
                assert!(reason.unwrap().contains("Bucket name already taken"))
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn scripted_errors_are_consumed_in_order() {
        let api = LocalStackApi::new();
        api.fail_next(ApiOperation::DeleteStack, ApiError::new("Throttling", "1"));
        assert!(api.delete_stack("app").await.is_err());
        assert!(api.delete_stack("app").await.is_ok());
        assert_eq!(api.call_count(ApiOperation::DeleteStack), 2);
    }

    #[tokio::test]
    async fn uploaded_template_is_resolved_by_url() {
        let api = LocalStackApi::new();
        api.upload_template("https://b.s3.amazonaws.com/t.json", ONE_BUCKET);
        let mut create = input("app", "cs", ChangeSetType::Create, "");
        create.template = TemplateSource::Url("https://b.s3.amazonaws.com/t.json".into());
        api.create_change_set(create).await.unwrap();
        assert_eq!(
            api.wait_for_change_set_created("app", "cs").await.unwrap(),
            WaiterOutcome::Success
        );
    }
}
