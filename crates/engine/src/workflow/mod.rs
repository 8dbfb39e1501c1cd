//! The workflow state machine: `start`, `get_status`, `describe_status`.
//!
//! One [`WorkflowEngine`] exists per workflow kind. It owns the id-keyed
//! table; the validation registry, diagnostic coordinator and remote API
//! are shared through [`EngineContext`]. `start` creates the change set
//! before returning and then spawns the rest of the run, which updates the
//! table as it goes. Callers poll by id.

mod strategy;
mod table;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use stackward_core::{
    ChangeSetType, StartResponse, Validation, WorkflowDescription, WorkflowPhase, WorkflowRequest, WorkflowState,
    WorkflowStatus, WorkflowUpdate,
};
use tokio::task::JoinHandle;

pub use strategy::{
    DeploymentRun, EventFetchPolicy, RunContext, RunStrategy, ValidationRun, ENHANCED_VALIDATION,
};
pub use table::WorkflowTable;

use crate::api::StackApi;
use crate::collaborators::{DocumentStore, FeatureFlags, SyntaxTreeProvider};
use crate::diagnostics::DiagnosticCoordinator;
use crate::error::WorkflowError;
use crate::operations;
use crate::registry::ValidationRegistry;
use crate::settings::EngineSettings;

/// State and collaborators shared by every workflow engine.
pub struct EngineContext {
    pub api: Arc<dyn StackApi>,
    pub documents: Arc<dyn DocumentStore>,
    pub trees: Arc<dyn SyntaxTreeProvider>,
    pub flags: Arc<dyn FeatureFlags>,
    pub diagnostics: Arc<DiagnosticCoordinator>,
    pub registry: Arc<ValidationRegistry>,
    pub settings: EngineSettings,
}

pub type ValidationWorkflow = WorkflowEngine<ValidationRun>;
pub type DeploymentWorkflow = WorkflowEngine<DeploymentRun>;

pub struct WorkflowEngine<S: RunStrategy> {
    ctx: Arc<EngineContext>,
    table: Arc<WorkflowTable>,
    strategy: Arc<S>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl ValidationWorkflow {
    pub fn validation(ctx: Arc<EngineContext>) -> Self {
        Self::new(ctx, ValidationRun)
    }
}

impl DeploymentWorkflow {
    pub fn deployment(ctx: Arc<EngineContext>) -> Self {
        Self::new(ctx, DeploymentRun)
    }
}

impl<S: RunStrategy> WorkflowEngine<S> {
    pub fn new(ctx: Arc<EngineContext>, strategy: S) -> Self {
        Self {
            ctx,
            table: Arc::new(WorkflowTable::new()),
            strategy: Arc::new(strategy),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create the change set, record the run, and launch it.
    ///
    /// Returns once the change set has been submitted; the run itself
    /// continues on a spawned task. Must be called within a tokio runtime.
    pub async fn start(&self, request: WorkflowRequest) -> Result<StartResponse, WorkflowError> {
        let document =
            self.ctx
                .documents
                .get(&request.uri)
                .ok_or_else(|| WorkflowError::DocumentNotFound {
                    uri: request.uri.clone(),
                })?;

        self.table.prune_completed(self.ctx.settings.retention);
        // Claim the id before the first remote call; the placeholder is
        // replaced once the change set exists.
        let provisional = if !request.imports().is_empty() {
            ChangeSetType::Import
        } else {
            ChangeSetType::Create
        };
        let displaced = self.table.try_insert(WorkflowState::new(
            request.id.clone(),
            request.stack_name.clone(),
            String::new(),
            provisional,
            request.deployment_mode,
        ))?;
        let reservation = Reservation {
            table: &self.table,
            id: &request.id,
            displaced: Some(displaced),
        };

        let api = self.ctx.api.as_ref();
        let change_set_type = operations::resolve_change_set_type(api, &request).await;
        let change_set_name =
            operations::create_change_set(api, &request, &document, change_set_type).await?;

        self.ctx.registry.add(Validation {
            uri: request.uri.clone(),
            stack_name: request.stack_name.clone(),
            change_set_name: change_set_name.clone(),
            parameters: request.parameters.clone(),
            capabilities: request.capabilities.clone(),
            upload: request.upload.clone(),
            phase: WorkflowPhase::ValidationInProgress,
            changes: Vec::new(),
            validation_details: Vec::new(),
        });
        self.table.replace(WorkflowState::new(
            request.id.clone(),
            request.stack_name.clone(),
            change_set_name.clone(),
            change_set_type,
            request.deployment_mode,
        ));
        reservation.commit();

        let response = StartResponse {
            id: request.id.clone(),
            change_set_name: change_set_name.clone(),
            stack_name: request.stack_name.clone(),
        };
        tracing::info!(
            kind = self.strategy.kind(),
            workflow_id = %request.id,
            stack_name = %request.stack_name,
            change_set_name = %change_set_name,
            "workflow started"
        );
        self.spawn(RunContext {
            request,
            change_set_name,
            change_set_type,
        });
        Ok(response)
    }

    fn spawn(&self, run: RunContext) {
        let id = run.request.id.clone();
        let ctx = self.ctx.clone();
        let table = self.table.clone();
        let strategy = self.strategy.clone();
        let body = {
            let run = run.clone();
            let ctx = ctx.clone();
            let table = table.clone();
            tokio::spawn(async move { strategy.run(&ctx, &table, &run).await })
        };
        let supervisor = tokio::spawn(async move {
            if let Err(err) = body.await {
                tracing::error!(workflow_id = %run.request.id, error = %err, "workflow run aborted");
                abort_run(&ctx, &table, &run, &err.to_string());
            }
        });

        let mut tasks = self.tasks();
        tasks.retain(|_, handle| !handle.is_finished());
        tasks.insert(id, supervisor);
    }

    pub fn get_status(&self, id: &str) -> Result<WorkflowStatus, WorkflowError> {
        self.record(id).map(|state| state.status())
    }

    pub fn describe_status(&self, id: &str) -> Result<WorkflowDescription, WorkflowError> {
        self.record(id).map(|state| state.describe())
    }

    fn record(&self, id: &str) -> Result<WorkflowState, WorkflowError> {
        self.table
            .get(id)
            .ok_or_else(|| WorkflowError::NotFound { id: id.to_string() })
    }

    /// Wait for the detached run of `id`, if one is still tracked.
    pub async fn join(&self, id: &str) {
        let handle = self.tasks().remove(id);
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::error!(workflow_id = id, error = %err, "workflow supervisor failed");
            }
        }
    }

    /// Wait for every detached run.
    pub async fn drain(&self) {
        let handles: Vec<(String, JoinHandle<()>)> = self.tasks().drain().collect();
        for (id, handle) in handles {
            if let Err(err) = handle.await {
                tracing::error!(workflow_id = %id, error = %err, "workflow supervisor failed");
            }
        }
    }

    pub fn table(&self) -> &WorkflowTable {
        &self.table
    }
}

/// A claimed workflow id whose change set is not yet created. Dropping it
/// uncommitted (an error or a cancelled `start`) restores the record it
/// displaced.
struct Reservation<'a> {
    table: &'a WorkflowTable,
    id: &'a str,
    displaced: Option<Option<WorkflowState>>,
}

impl Reservation<'_> {
    fn commit(mut self) {
        self.displaced = None;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if let Some(displaced) = self.displaced.take() {
            self.table.release(self.id, displaced);
        }
    }
}

/// Record a run that died without reaching its own terminal step.
fn abort_run(ctx: &EngineContext, table: &WorkflowTable, run: &RunContext, message: &str) {
    ctx.registry
        .remove_owned(&run.request.stack_name, &run.change_set_name);
    let Some(state) = table.get(&run.request.id) else {
        return;
    };
    if state.state.is_terminal() {
        return;
    }
    let phase = match state.phase {
        WorkflowPhase::ValidationInProgress => WorkflowPhase::ValidationFailed,
        _ => WorkflowPhase::DeploymentFailed,
    };
    table.merge(
        &run.request.id,
        WorkflowUpdate::failed(phase, format!("workflow run aborted: {}", message)),
    );
}
