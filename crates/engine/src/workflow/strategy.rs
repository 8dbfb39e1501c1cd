//! Run bodies for the two workflow kinds.
//!
//! Both kinds share the validation phase; they differ in whether failure
//! events are fetched unconditionally, in what happens after a successful
//! dry run, and in cleanup. A run body never returns an error: every failed
//! step is turned into a reason string on the workflow record.

use async_trait::async_trait;
use stackward_core::{
    ChangeSetType, RunState, ValidationDetail, ValidationSeverity, WorkflowPhase, WorkflowRequest,
    WorkflowUpdate,
};

use super::table::WorkflowTable;
use super::EngineContext;
use crate::api::{StackWaitTarget, REVIEW_IN_PROGRESS};
use crate::operations::{self, TerminalResult};

/// Label of findings synthesized by deployment runs.
pub const ENHANCED_VALIDATION: &str = "Enhanced Validation";

/// Everything a detached run needs to know about what `start` did.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub request: WorkflowRequest,
    pub change_set_name: String,
    pub change_set_type: ChangeSetType,
}

impl RunContext {
    fn id(&self) -> &str {
        &self.request.id
    }

    fn stack_name(&self) -> &str {
        &self.request.stack_name
    }
}

/// The asynchronous body of a workflow kind.
#[async_trait]
pub trait RunStrategy: Send + Sync + 'static {
    /// Short name used in logs.
    fn kind(&self) -> &'static str;

    async fn run(&self, ctx: &EngineContext, table: &WorkflowTable, run: &RunContext);
}

/// When failure events are mined after the change-set wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFetchPolicy {
    /// Only where the region feature flag is on.
    FeatureFlag,
    /// Unconditionally; findings are labeled [`ENHANCED_VALIDATION`].
    Always,
}

impl EventFetchPolicy {
    fn applies(self, ctx: &EngineContext) -> bool {
        match self {
            EventFetchPolicy::Always => true,
            EventFetchPolicy::FeatureFlag => ctx.flags.is_enabled(&ctx.settings.region),
        }
    }

    fn label(self) -> Option<&'static str> {
        match self {
            EventFetchPolicy::Always => Some(ENHANCED_VALIDATION),
            EventFetchPolicy::FeatureFlag => None,
        }
    }
}

/// What the validation phase found.
#[derive(Debug, Clone)]
struct ValidationOutcome {
    succeeded: bool,
    reason: Option<String>,
    details: Vec<ValidationDetail>,
}

/// Wait for the change set, mine failure events, and record one terminal
/// validation update.
///
/// `complete_state` is the run state recorded on success: a dry run is
/// finished there, a deployment is not.
async fn validate(
    ctx: &EngineContext,
    table: &WorkflowTable,
    run: &RunContext,
    policy: EventFetchPolicy,
    complete_state: RunState,
) -> ValidationOutcome {
    let api = ctx.api.as_ref();
    let result =
        operations::wait_for_change_set_terminal(api, run.stack_name(), &run.change_set_name).await;

    let (mut update, succeeded, reason, changes) = match result {
        TerminalResult::Succeeded { changes, .. } => {
            tracing::info!(
                workflow_id = run.id(),
                change_set_name = %run.change_set_name,
                changes = changes.len(),
                "change set ready"
            );
            (
                WorkflowUpdate::phase(WorkflowPhase::ValidationComplete, complete_state)
                    .with_changes(changes.clone()),
                true,
                None,
                Some(changes),
            )
        }
        TerminalResult::Failed { reason } => {
            let reason = reason.unwrap_or_else(|| "change set creation failed".to_string());
            tracing::info!(
                workflow_id = run.id(),
                change_set_name = %run.change_set_name,
                reason = %reason,
                "dry run failed"
            );
            (
                WorkflowUpdate::failed(WorkflowPhase::ValidationFailed, reason.clone()),
                false,
                Some(reason),
                None,
            )
        }
    };

    let mut details = Vec::new();
    if policy.applies(ctx) {
        match operations::fetch_all_failure_events(api, run.stack_name(), &run.change_set_name)
            .await
        {
            Ok(events) => {
                details = operations::normalize_validation_events(&events);
                if let Some(label) = policy.label() {
                    // The rule name stays in the message.
                    for detail in &mut details {
                        detail.validation_name = label.to_string();
                    }
                }
                if let Err(err) = operations::publish_positioned_diagnostics(
                    &ctx.diagnostics,
                    ctx.trees.as_ref(),
                    &run.request.uri,
                    &mut details,
                ) {
                    tracing::warn!(workflow_id = run.id(), error = %err, "could not publish validation diagnostics");
                }
                update = update.with_details(details.clone());
            }
            Err(err) => {
                tracing::warn!(
                    workflow_id = run.id(),
                    error = %err,
                    "could not fetch validation events"
                );
            }
        }
    }

    let phase = if succeeded {
        WorkflowPhase::ValidationComplete
    } else {
        WorkflowPhase::ValidationFailed
    };
    ctx.registry
        .update(run.stack_name(), &run.change_set_name, |validation| {
            validation.phase = phase;
            if let Some(changes) = changes {
                validation.changes = changes;
            }
            if !details.is_empty() {
                validation.validation_details = details.clone();
            }
        });
    table.merge(run.id(), update);

    ValidationOutcome {
        succeeded,
        reason,
        details,
    }
}

/// Dry-run validation: the change set is never executed and is cleaned up
/// afterwards unless the caller asked to keep it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidationRun;

#[async_trait]
impl RunStrategy for ValidationRun {
    fn kind(&self) -> &'static str {
        "validation"
    }

    async fn run(&self, ctx: &EngineContext, table: &WorkflowTable, run: &RunContext) {
        validate(
            ctx,
            table,
            run,
            EventFetchPolicy::FeatureFlag,
            RunState::Successful,
        )
        .await;
        cleanup_dry_run(ctx, run).await;
    }
}

/// Always-run tail of a dry run. Failures are logged only.
async fn cleanup_dry_run(ctx: &EngineContext, run: &RunContext) {
    ctx.registry.remove(run.stack_name());
    if run.request.keeps_change_set() {
        tracing::debug!(
            workflow_id = run.id(),
            change_set_name = %run.change_set_name,
            "keeping change set"
        );
        return;
    }

    let api = ctx.api.as_ref();
    let policy = &ctx.settings.cleanup_retry;
    let in_review = matches!(
        api.describe_stack(run.stack_name()).await,
        Ok(Some(stack)) if stack.stack_status == REVIEW_IN_PROGRESS
    );
    let result = if in_review {
        operations::delete_stack_and_change_set(api, policy, run.stack_name(), &run.change_set_name)
            .await
    } else {
        operations::delete_change_set(api, policy, run.stack_name(), &run.change_set_name).await
    };
    match result {
        Ok(()) => tracing::debug!(
            workflow_id = run.id(),
            change_set_name = %run.change_set_name,
            stack_deleted = in_review,
            "cleaned up dry run"
        ),
        Err(err) => tracing::warn!(
            workflow_id = run.id(),
            stack_name = run.stack_name(),
            change_set_name = %run.change_set_name,
            error = %err,
            "dry run cleanup failed"
        ),
    }
}

/// Validate, then execute the change set and wait for the stack.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeploymentRun;

#[async_trait]
impl RunStrategy for DeploymentRun {
    fn kind(&self) -> &'static str {
        "deployment"
    }

    async fn run(&self, ctx: &EngineContext, table: &WorkflowTable, run: &RunContext) {
        deploy(ctx, table, run).await;
        ctx.registry.remove(run.stack_name());
    }
}

async fn deploy(ctx: &EngineContext, table: &WorkflowTable, run: &RunContext) {
    let outcome = validate(
        ctx,
        table,
        run,
        EventFetchPolicy::Always,
        RunState::InProgress,
    )
    .await;

    let mut details = outcome.details;
    if !outcome.succeeded {
        let reason = outcome.reason.unwrap_or_default();
        details.push(ValidationDetail::synthesized(
            ENHANCED_VALIDATION,
            format!("Dry run failed: {}", reason),
            ValidationSeverity::Error,
        ));
        table.merge(run.id(), WorkflowUpdate::default().with_details(details));
        return;
    }

    details.push(ValidationDetail::synthesized(
        ENHANCED_VALIDATION,
        "Validation succeeded",
        ValidationSeverity::Info,
    ));
    table.merge(run.id(), WorkflowUpdate::default().with_details(details));

    let api = ctx.api.as_ref();
    if let Err(err) = api
        .execute_change_set(run.stack_name(), &run.change_set_name, run.id())
        .await
    {
        tracing::warn!(workflow_id = run.id(), error = %err, "execute change set failed");
        table.merge(
            run.id(),
            WorkflowUpdate::failed(WorkflowPhase::DeploymentFailed, err.reason()),
        );
        record_stack_events(ctx, table, run).await;
        return;
    }

    table.merge(
        run.id(),
        WorkflowUpdate::phase(WorkflowPhase::DeploymentInProgress, RunState::InProgress),
    );
    tracing::info!(
        workflow_id = run.id(),
        stack_name = run.stack_name(),
        "deployment started"
    );

    let target = StackWaitTarget::from(run.change_set_type);
    let update = match operations::wait_for_deployment_terminal(api, run.stack_name(), target).await
    {
        TerminalResult::Succeeded { .. } => {
            tracing::info!(workflow_id = run.id(), "deployment complete");
            WorkflowUpdate::phase(WorkflowPhase::DeploymentComplete, RunState::Successful)
        }
        TerminalResult::Failed { reason } => {
            let reason = reason.unwrap_or_else(|| "deployment failed".to_string());
            tracing::info!(workflow_id = run.id(), reason = %reason, "deployment failed");
            WorkflowUpdate::failed(WorkflowPhase::DeploymentFailed, reason)
        }
    };
    table.merge(run.id(), update);
    record_stack_events(ctx, table, run).await;
}

async fn record_stack_events(ctx: &EngineContext, table: &WorkflowTable, run: &RunContext) {
    match operations::collect_stack_events(
        ctx.api.as_ref(),
        run.stack_name(),
        ctx.settings.stack_event_limit,
    )
    .await
    {
        Ok(events) => {
            table.merge(
                run.id(),
                WorkflowUpdate {
                    deployment_events: Some(events),
                    ..Default::default()
                },
            );
        }
        Err(err) => {
            tracing::warn!(workflow_id = run.id(), error = %err, "could not collect stack events");
        }
    }
}
