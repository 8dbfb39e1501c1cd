//! Scenario tests for the validation and deployment workflows, run against
//! the in-process stack backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lsp_types::{Diagnostic, Position, Range};
use stackward_core::{
    ChangeSetType, ResourceToImport, RunState, StackEvent, ValidationSeverity, WorkflowPhase,
    WorkflowRequest,
};
use stackward_engine::api::{
    ChangeSetDescription, CreateChangeSetInput, DescribeEventsInput, EventsPage, OperationEvent,
    StackSummary, VALIDATION_ERROR_EVENT,
};
use stackward_engine::workflow::ENHANCED_VALIDATION;
use stackward_engine::{
    ApiError, ApiOperation, DeploymentWorkflow, DiagnosticCoordinator, DiagnosticSink,
    DocumentStore, DocumentType, EngineContext, EngineSettings, LocalStackApi, RegionFeatureFlags,
    RetryOptions, StackApi, StackWaitTarget, SyntaxTree, SyntaxTreeProvider, TemplateDocument,
    ValidationRegistry, ValidationWorkflow, WaiterOutcome, WorkflowError,
};

const URI: &str = "file:///work/app.yaml";

const BUCKET: &str = "\
Resources:
  Bucket:
    Type: AWS::S3::Bucket
    Properties:
      BucketName: demo
";

const BUCKET_AND_QUEUE: &str = "\
Resources:
  Bucket:
    Type: AWS::S3::Bucket
    Properties:
      BucketName: demo
  Queue:
    Type: AWS::SQS::Queue
";

// ──────────────────────────────────────────────
// Collaborator doubles
// ──────────────────────────────────────────────

#[derive(Default)]
struct Documents(Mutex<HashMap<String, String>>);

impl Documents {
    fn open(&self, uri: &str, body: &str) {
        self.0.lock().unwrap().insert(uri.into(), body.into());
    }
}

impl DocumentStore for Documents {
    fn get(&self, uri: &str) -> Option<TemplateDocument> {
        self.0.lock().unwrap().get(uri).map(|body| TemplateDocument {
            body: body.clone(),
            doc_type: DocumentType::Yaml,
        })
    }
}

struct PathTree(HashMap<String, Range>);

impl SyntaxTree for PathTree {
    fn resolve_path(&self, segments: &[&str]) -> Option<Range> {
        self.0.get(&segments.join("/")).copied()
    }
}

#[derive(Default)]
struct Trees(Mutex<HashMap<String, Arc<PathTree>>>);

impl SyntaxTreeProvider for Trees {
    fn tree(&self, uri: &str) -> Option<Arc<dyn SyntaxTree>> {
        self.0
            .lock()
            .unwrap()
            .get(uri)
            .map(|tree| tree.clone() as Arc<dyn SyntaxTree>)
    }
}

#[derive(Default)]
struct RecordingSink(Mutex<Vec<(String, Vec<Diagnostic>)>>);

impl RecordingSink {
    fn last_for(&self, uri: &str) -> Option<Vec<Diagnostic>> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(u, _)| u == uri)
            .map(|(_, d)| d.clone())
    }
}

impl DiagnosticSink for RecordingSink {
    fn publish(&self, uri: &str, diagnostics: Vec<Diagnostic>) -> Result<(), String> {
        self.0.lock().unwrap().push((uri.to_string(), diagnostics));
        Ok(())
    }
}

struct Harness {
    api: Arc<LocalStackApi>,
    documents: Arc<Documents>,
    trees: Arc<Trees>,
    sink: Arc<RecordingSink>,
    registry: Arc<ValidationRegistry>,
    ctx: Arc<EngineContext>,
}

fn harness_with(api: LocalStackApi, flagged_regions: &[&str]) -> Harness {
    let api = Arc::new(api);
    let documents = Arc::new(Documents::default());
    let trees = Arc::new(Trees::default());
    let sink = Arc::new(RecordingSink::default());
    let registry = Arc::new(ValidationRegistry::new());
    let settings = EngineSettings {
        region: "us-east-1".into(),
        cleanup_retry: RetryOptions {
            max_attempts: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            total_timeout: Duration::from_secs(5),
            ..RetryOptions::default()
        },
        ..EngineSettings::default()
    };
    let ctx = Arc::new(EngineContext {
        api: api.clone(),
        documents: documents.clone(),
        trees: trees.clone(),
        flags: Arc::new(RegionFeatureFlags::new(flagged_regions.iter().copied())),
        diagnostics: Arc::new(DiagnosticCoordinator::new(sink.clone())),
        registry: registry.clone(),
        settings,
    });
    documents.open(URI, BUCKET);
    Harness {
        api,
        documents,
        trees,
        sink,
        registry,
        ctx,
    }
}

fn harness() -> Harness {
    harness_with(LocalStackApi::new(), &[])
}

fn request(id: &str) -> WorkflowRequest {
    WorkflowRequest::new(id, URI, "app")
}

fn validation_event(name: &str, path: &str, logical_id: &str) -> OperationEvent {
    OperationEvent {
        event_id: Some(format!("{}-1", name)),
        event_type: Some(VALIDATION_ERROR_EVENT.into()),
        timestamp: Some("2024-06-01T12:00:00Z".into()),
        logical_resource_id: Some(logical_id.into()),
        validation_name: Some(name.into()),
        validation_status_reason: Some("bucket name is taken".into()),
        validation_failure_mode: Some("FAIL".into()),
        validation_path: Some(path.into()),
    }
}

fn span(line: u32) -> Range {
    Range::new(Position::new(line, 4), Position::new(line, 20))
}

// ──────────────────────────────────────────────
// Validation
// ──────────────────────────────────────────────

#[tokio::test]
async fn dry_run_on_new_stack_removes_stack_and_change_set() {
    let h = harness();
    let engine = ValidationWorkflow::validation(h.ctx.clone());

    let started = engine.start(request("wf-1")).await.unwrap();
    assert!(started.change_set_name.starts_with("stackward-wf-1-"));
    assert_eq!(started.stack_name, "app");
    engine.join("wf-1").await;

    let status = engine.get_status("wf-1").unwrap();
    assert_eq!(status.phase, WorkflowPhase::ValidationComplete);
    assert_eq!(status.state, RunState::Successful);
    assert_eq!(status.changes.len(), 1);
    assert_eq!(h.api.stack_status("app"), None);
    assert!(h.api.change_set_names("app").is_empty());
    assert!(h.registry.get("app").is_none());
}

#[tokio::test]
async fn dry_run_on_existing_stack_only_deletes_change_set() {
    let h = harness();
    h.api.deploy_stack("app", BUCKET);
    h.documents.open(URI, BUCKET_AND_QUEUE);
    let engine = ValidationWorkflow::validation(h.ctx.clone());

    engine.start(request("wf")).await.unwrap();
    engine.join("wf").await;

    assert_eq!(
        engine.table().get("wf").unwrap().change_set_type,
        ChangeSetType::Update
    );
    assert_eq!(h.api.stack_status("app").as_deref(), Some("CREATE_COMPLETE"));
    assert!(h.api.change_set_names("app").is_empty());
    assert_eq!(h.api.call_count(ApiOperation::DeleteStack), 0);
}

#[tokio::test]
async fn kept_change_set_survives_the_run() {
    let h = harness();
    let engine = ValidationWorkflow::validation(h.ctx.clone());
    let mut req = request("wf");
    req.keep_change_set = Some(true);

    let started = engine.start(req).await.unwrap();
    engine.join("wf").await;

    assert!(h.api.change_set_exists("app", &started.change_set_name));
    assert_eq!(h.api.stack_status("app").as_deref(), Some("REVIEW_IN_PROGRESS"));
    assert_eq!(h.api.call_count(ApiOperation::DeleteChangeSet), 0);
    assert!(h.registry.is_empty());
}

#[tokio::test]
async fn unchanged_template_fails_validation_with_reason() {
    let h = harness();
    h.api.deploy_stack("app", BUCKET);
    let engine = ValidationWorkflow::validation(h.ctx.clone());

    engine.start(request("wf")).await.unwrap();
    engine.join("wf").await;

    let description = engine.describe_status("wf").unwrap();
    assert_eq!(description.phase, WorkflowPhase::ValidationFailed);
    assert_eq!(description.state, RunState::Failed);
    assert!(description
        .failure_reason
        .unwrap()
        .contains("didn't contain changes"));
    assert!(h.registry.is_empty());
}

#[tokio::test]
async fn import_request_skips_stack_lookup() {
    let h = harness();
    let engine = ValidationWorkflow::validation(h.ctx.clone());
    let mut req = request("wf");
    req.resources_to_import = Some(vec![ResourceToImport {
        resource_type: "AWS::S3::Bucket".into(),
        logical_resource_id: "Bucket".into(),
        resource_identifier: [("BucketName".to_string(), "demo".to_string())].into(),
    }]);

    engine.start(req).await.unwrap();
    engine.join("wf").await;

    assert_eq!(
        engine.table().get("wf").unwrap().change_set_type,
        ChangeSetType::Import
    );
    let calls = h.api.calls();
    let first_create = calls
        .iter()
        .position(|op| *op == ApiOperation::CreateChangeSet)
        .unwrap();
    assert!(!calls[..first_create].contains(&ApiOperation::DescribeStack));
}

#[tokio::test]
async fn flagged_region_publishes_positioned_diagnostics() {
    let h = harness_with(LocalStackApi::new().with_event_page_size(1), &["us-east-1"]);
    h.api.script_validation_events(
        "app",
        vec![
            validation_event("BucketName", "/Resources/Bucket/Properties/BucketName", "Bucket"),
            validation_event("Orphan", "/Resources/Nope", "Nope"),
        ],
    );
    h.trees.0.lock().unwrap().insert(
        URI.to_string(),
        Arc::new(PathTree(HashMap::from([(
            "Resources/Bucket/Properties/BucketName".to_string(),
            span(4),
        )]))),
    );
    let engine = ValidationWorkflow::validation(h.ctx.clone());

    engine.start(request("wf")).await.unwrap();
    engine.join("wf").await;

    let published = h.sink.last_for(URI).unwrap();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].range, span(4));
    assert_eq!(published[0].message, "BucketName: bucket name is taken");

    let description = engine.describe_status("wf").unwrap();
    assert_eq!(description.validation_details.len(), 2);
    assert_eq!(
        stackward_engine::diagnostic_id_of(&published[0]),
        description.validation_details[0].diagnostic_id.as_deref()
    );
    assert!(description.validation_details[1].diagnostic_id.is_none());
    assert_eq!(h.api.call_count(ApiOperation::DescribeEvents), 2);
}

#[tokio::test]
async fn unflagged_region_never_fetches_events() {
    let h = harness();
    h.api
        .script_validation_events("app", vec![validation_event("X", "/Resources/Bucket", "Bucket")]);
    let engine = ValidationWorkflow::validation(h.ctx.clone());

    engine.start(request("wf")).await.unwrap();
    engine.join("wf").await;

    assert_eq!(h.api.call_count(ApiOperation::DescribeEvents), 0);
    assert!(engine
        .describe_status("wf")
        .unwrap()
        .validation_details
        .is_empty());
}

#[tokio::test]
async fn cleanup_failure_does_not_change_outcome() {
    let h = harness();
    for _ in 0..10 {
        h.api
            .fail_next(ApiOperation::DeleteStack, ApiError::new("Throttling", "Rate exceeded"));
    }
    let engine = ValidationWorkflow::validation(h.ctx.clone());

    engine.start(request("wf")).await.unwrap();
    engine.join("wf").await;

    let status = engine.get_status("wf").unwrap();
    assert_eq!(status.state, RunState::Successful);
    assert_eq!(engine.describe_status("wf").unwrap().failure_reason, None);
    assert_eq!(h.api.call_count(ApiOperation::DeleteStack), 3);
    assert!(h.registry.is_empty());
}

// ──────────────────────────────────────────────
// Start / status surface
// ──────────────────────────────────────────────

#[tokio::test]
async fn unknown_id_is_not_found() {
    let h = harness();
    let engine = ValidationWorkflow::validation(h.ctx.clone());
    assert!(matches!(
        engine.get_status("missing"),
        Err(WorkflowError::NotFound { id }) if id == "missing"
    ));
    assert!(matches!(
        engine.describe_status("missing"),
        Err(WorkflowError::NotFound { .. })
    ));
}

#[tokio::test]
async fn missing_document_fails_before_any_remote_call() {
    let h = harness();
    let engine = ValidationWorkflow::validation(h.ctx.clone());
    let req = WorkflowRequest::new("wf", "file:///nowhere.yaml", "app");

    let err = engine.start(req).await.unwrap_err();

    assert!(matches!(err, WorkflowError::DocumentNotFound { .. }));
    assert!(h.api.calls().is_empty());
    assert!(engine.get_status("wf").is_err());
}

#[tokio::test]
async fn change_set_creation_error_is_returned_from_start() {
    let h = harness();
    h.api.fail_next(
        ApiOperation::CreateChangeSet,
        ApiError::new("InsufficientCapabilitiesException", "Requires CAPABILITY_IAM"),
    );
    let engine = ValidationWorkflow::validation(h.ctx.clone());

    let err = engine.start(request("wf")).await.unwrap_err();

    assert_eq!(
        err.to_string(),
        "InsufficientCapabilitiesException: Requires CAPABILITY_IAM"
    );
    assert!(h.registry.is_empty());
    assert!(engine.table().is_empty());
}

#[tokio::test]
async fn running_id_cannot_be_started_twice() {
    let h = harness_with(
        LocalStackApi::new().with_wait_delay(Duration::from_millis(100)),
        &[],
    );
    let engine = ValidationWorkflow::validation(h.ctx.clone());

    let first = engine.start(request("wf")).await.unwrap();
    assert_eq!(
        engine.get_status("wf").unwrap().phase,
        WorkflowPhase::ValidationInProgress
    );
    let second = engine.start(request("wf")).await;
    assert!(matches!(second, Err(WorkflowError::AlreadyRunning { .. })));
    assert_eq!(h.registry.get("app").unwrap().change_set_name, first.change_set_name);

    engine.join("wf").await;
    let again = engine.start(request("wf")).await.unwrap();
    assert_ne!(again.change_set_name, first.change_set_name);
    engine.drain().await;
    assert!(engine.get_status("wf").unwrap().state.is_terminal());
}

/// Delegates to `LocalStackApi` but yields to the scheduler before every
/// call, so concurrent starts interleave at each remote call.
struct Yielding(Arc<LocalStackApi>);

#[async_trait]
impl StackApi for Yielding {
    async fn describe_stack(&self, stack_name: &str) -> Result<Option<StackSummary>, ApiError> {
        tokio::task::yield_now().await;
        self.0.describe_stack(stack_name).await
    }

    async fn create_change_set(&self, input: CreateChangeSetInput) -> Result<(), ApiError> {
        tokio::task::yield_now().await;
        self.0.create_change_set(input).await
    }

    async fn describe_change_set(
        &self,
        stack_name: &str,
        change_set_name: &str,
        include_property_values: bool,
        next_token: Option<String>,
    ) -> Result<ChangeSetDescription, ApiError> {
        tokio::task::yield_now().await;
        self.0
            .describe_change_set(stack_name, change_set_name, include_property_values, next_token)
            .await
    }

    async fn delete_change_set(
        &self,
        stack_name: &str,
        change_set_name: &str,
    ) -> Result<(), ApiError> {
        tokio::task::yield_now().await;
        self.0.delete_change_set(stack_name, change_set_name).await
    }

    async fn execute_change_set(
        &self,
        stack_name: &str,
        change_set_name: &str,
        client_request_token: &str,
    ) -> Result<(), ApiError> {
        tokio::task::yield_now().await;
        self.0
            .execute_change_set(stack_name, change_set_name, client_request_token)
            .await
    }

    async fn delete_stack(&self, stack_name: &str) -> Result<(), ApiError> {
        tokio::task::yield_now().await;
        self.0.delete_stack(stack_name).await
    }

    async fn wait_for_change_set_created(
        &self,
        stack_name: &str,
        change_set_name: &str,
    ) -> Result<WaiterOutcome, ApiError> {
        tokio::task::yield_now().await;
        self.0
            .wait_for_change_set_created(stack_name, change_set_name)
            .await
    }

    async fn wait_for_stack(
        &self,
        stack_name: &str,
        target: StackWaitTarget,
    ) -> Result<WaiterOutcome, ApiError> {
        tokio::task::yield_now().await;
        self.0.wait_for_stack(stack_name, target).await
    }

    async fn describe_events(&self, input: DescribeEventsInput) -> Result<EventsPage, ApiError> {
        tokio::task::yield_now().await;
        self.0.describe_events(input).await
    }

    async fn describe_stack_events(
        &self,
        stack_name: &str,
        limit: usize,
    ) -> Result<Vec<StackEvent>, ApiError> {
        tokio::task::yield_now().await;
        self.0.describe_stack_events(stack_name, limit).await
    }
}

#[tokio::test]
async fn concurrent_starts_with_one_id_admit_a_single_run() {
    let h = harness();
    let ctx = Arc::new(EngineContext {
        api: Arc::new(Yielding(h.api.clone())),
        documents: h.ctx.documents.clone(),
        trees: h.ctx.trees.clone(),
        flags: h.ctx.flags.clone(),
        diagnostics: h.ctx.diagnostics.clone(),
        registry: h.registry.clone(),
        settings: h.ctx.settings.clone(),
    });
    let engine = ValidationWorkflow::validation(ctx);

    let (first, second) = tokio::join!(engine.start(request("wf")), engine.start(request("wf")));

    let first = first.unwrap();
    assert!(matches!(second, Err(WorkflowError::AlreadyRunning { id }) if id == "wf"));
    assert_eq!(h.api.call_count(ApiOperation::CreateChangeSet), 1);
    engine.drain().await;
    let state = engine.table().get("wf").unwrap();
    assert_eq!(state.change_set_name, first.change_set_name);
    assert_eq!(state.state, RunState::Successful);
}

#[tokio::test]
async fn failed_restart_keeps_the_previous_record() {
    let h = harness();
    let engine = ValidationWorkflow::validation(h.ctx.clone());
    let first = engine.start(request("wf")).await.unwrap();
    engine.join("wf").await;

    h.api.fail_next(
        ApiOperation::CreateChangeSet,
        ApiError::new("LimitExceededException", "too many change sets"),
    );
    assert!(engine.start(request("wf")).await.is_err());

    let state = engine.table().get("wf").unwrap();
    assert_eq!(state.change_set_name, first.change_set_name);
    assert_eq!(state.state, RunState::Successful);
    assert!(engine.start(request("wf")).await.is_ok());
    engine.drain().await;
}

// ──────────────────────────────────────────────
// Deployment
// ──────────────────────────────────────────────

#[tokio::test]
async fn failed_validation_never_executes() {
    let h = harness();
    h.api.fail_change_set("app", "Template error: unresolved resource dependencies");
    let engine = DeploymentWorkflow::deployment(h.ctx.clone());

    engine.start(request("dep")).await.unwrap();
    engine.join("dep").await;

    let description = engine.describe_status("dep").unwrap();
    assert_eq!(description.phase, WorkflowPhase::ValidationFailed);
    assert_eq!(description.state, RunState::Failed);
    assert_eq!(h.api.call_count(ApiOperation::ExecuteChangeSet), 0);
    let last = description.validation_details.last().unwrap();
    assert_eq!(last.severity, ValidationSeverity::Error);
    assert!(last.message.starts_with("Dry run failed"));
    assert!(h.registry.is_empty());
}

#[tokio::test]
async fn successful_deployment_records_events_and_keeps_stack() {
    let h = harness();
    let mut warning =
        validation_event("BucketPolicy", "/Resources/Bucket/Properties", "Bucket");
    warning.validation_failure_mode = Some("WARN".into());
    h.api.script_validation_events("app", vec![warning]);
    let engine = DeploymentWorkflow::deployment(h.ctx.clone());

    engine.start(request("dep")).await.unwrap();
    engine.join("dep").await;

    let description = engine.describe_status("dep").unwrap();
    assert_eq!(description.phase, WorkflowPhase::DeploymentComplete);
    assert_eq!(description.state, RunState::Successful);
    assert!(!description.deployment_events.unwrap().is_empty());
    assert!(description
        .validation_details
        .iter()
        .all(|d| d.validation_name == ENHANCED_VALIDATION));
    let mined = &description.validation_details[0];
    assert_eq!(mined.message, "BucketPolicy: bucket name is taken");
    assert_eq!(mined.logical_id.as_deref(), Some("Bucket"));
    assert_eq!(
        description.validation_details.last().unwrap().message,
        "Validation succeeded"
    );
    assert_eq!(h.api.stack_status("app").as_deref(), Some("CREATE_COMPLETE"));
    assert_eq!(h.api.call_count(ApiOperation::DeleteStack), 0);
    assert_eq!(h.api.call_count(ApiOperation::DeleteChangeSet), 0);
    // Failure events are fetched without the region flag.
    assert_eq!(h.api.call_count(ApiOperation::DescribeEvents), 1);
    assert!(h.registry.is_empty());
}

#[tokio::test]
async fn redeploying_with_a_reused_id_executes_the_new_change_set() {
    let h = harness();
    let engine = DeploymentWorkflow::deployment(h.ctx.clone());
    engine.start(request("dep")).await.unwrap();
    engine.join("dep").await;

    h.documents.open(URI, BUCKET_AND_QUEUE);
    engine.start(request("dep")).await.unwrap();
    engine.join("dep").await;

    let description = engine.describe_status("dep").unwrap();
    assert_eq!(description.phase, WorkflowPhase::DeploymentComplete);
    assert_eq!(h.api.stack_status("app").as_deref(), Some("UPDATE_COMPLETE"));
    assert!(h.api.change_set_names("app").is_empty());
    assert!(description
        .deployment_events
        .unwrap()
        .iter()
        .any(|e| e.logical_resource_id.as_deref() == Some("Queue")));
}

#[tokio::test]
async fn rolled_back_deployment_fails_with_reason() {
    let h = harness();
    h.api.deploy_stack("app", BUCKET);
    h.documents.open(URI, BUCKET_AND_QUEUE);
    h.api.fail_deployment("app", "Queue limit exceeded");
    let engine = DeploymentWorkflow::deployment(h.ctx.clone());

    engine.start(request("dep")).await.unwrap();
    engine.join("dep").await;

    let description = engine.describe_status("dep").unwrap();
    assert_eq!(description.phase, WorkflowPhase::DeploymentFailed);
    assert_eq!(description.state, RunState::Failed);
    assert!(description
        .failure_reason
        .unwrap()
        .contains("Queue limit exceeded"));
    assert_eq!(
        h.api.stack_status("app").as_deref(),
        Some("UPDATE_ROLLBACK_COMPLETE")
    );
}

#[tokio::test]
async fn execute_error_fails_deployment_without_waiting() {
    let h = harness();
    h.api.fail_next(
        ApiOperation::ExecuteChangeSet,
        ApiError::new("InvalidChangeSetStatus", "change set is not executable"),
    );
    let engine = DeploymentWorkflow::deployment(h.ctx.clone());

    engine.start(request("dep")).await.unwrap();
    engine.join("dep").await;

    let description = engine.describe_status("dep").unwrap();
    assert_eq!(description.phase, WorkflowPhase::DeploymentFailed);
    assert_eq!(
        description.failure_reason.as_deref(),
        Some("InvalidChangeSetStatus: change set is not executable")
    );
    assert_eq!(h.api.call_count(ApiOperation::WaitForStack), 0);
}

#[tokio::test]
async fn stack_event_failure_keeps_recorded_outcome() {
    let h = harness();
    h.api.fail_next(
        ApiOperation::DescribeStackEvents,
        ApiError::generic("connection reset"),
    );
    let engine = DeploymentWorkflow::deployment(h.ctx.clone());

    engine.start(request("dep")).await.unwrap();
    engine.join("dep").await;

    let description = engine.describe_status("dep").unwrap();
    assert_eq!(description.state, RunState::Successful);
    assert_eq!(description.deployment_events, None);
}

#[tokio::test]
async fn deployment_mode_is_echoed() {
    let h = harness();
    let engine = DeploymentWorkflow::deployment(h.ctx.clone());
    let mut req = request("dep");
    req.deployment_mode = Some(stackward_core::DeploymentMode::RevertDrift);

    engine.start(req).await.unwrap();
    engine.join("dep").await;

    assert_eq!(
        engine.describe_status("dep").unwrap().deployment_mode,
        Some(stackward_core::DeploymentMode::RevertDrift)
    );
}
