// Orchestrator facade: the surface the (out-of-scope) handler layer calls.
//
// Wires the resolver, reconciler, queue, executor and status updater
// together. submit_spec parses, resolves against policy and providers,
// declares resources, and enqueues one task per resolved workflow in phase
// order.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use scoreflow_core::{
    resolve, AdminPolicy, AuditEntry, ExecutionFilter, NewAuditEntry, NewQueueTask,
    OrchestratorError, OrchestratorStore, Phase, Provider, ResourceFilter, ResourceHealth,
    ResourceInstance, Result, ScoreSpec, SourceTier, Step, SubmissionMetadata, Workflow,
    WorkflowExecution,
};
use scoreflow_providers::ProviderLoader;

use crate::executor::{ExecutorConfig, StepExecutor};
use crate::queue::{ActiveTaskInfo, QueueConfig, QueueStats, TaskQueue};
use crate::reconciler::ResourceReconciler;
use crate::runtime::StepRuntime;
use crate::status::spawn_status_updater;

/// Result of one spec submission
#[derive(Debug, Clone, Serialize)]
pub struct SubmitResult {
    pub app_name: String,
    /// Task ids in enqueue (phase) order
    pub submissions: Vec<i64>,
}

pub struct Orchestrator {
    store: Arc<dyn OrchestratorStore>,
    policy: AdminPolicy,
    providers: Arc<RwLock<Vec<Provider>>>,
    loader: ProviderLoader,
    queue: TaskQueue,
    /// Taken on shutdown; dropping the last executor reference closes the
    /// outcome channel
    executor: Mutex<Option<Arc<StepExecutor>>>,
    reconciler: ResourceReconciler,
    reconciler_handle: Mutex<Option<JoinHandle<()>>>,
    status_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn OrchestratorStore>,
        policy: AdminPolicy,
        initial_providers: Vec<Provider>,
        runtime: StepRuntime,
        loader: ProviderLoader,
        queue_capacity: usize,
    ) -> Self {
        let providers = Arc::new(RwLock::new(initial_providers));

        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let executor = Arc::new(StepExecutor::new(
            store.clone(),
            runtime,
            providers.clone(),
            outcome_tx,
            ExecutorConfig {
                max_workflow_duration: Duration::from_secs(policy.max_workflow_duration_seconds),
                ..Default::default()
            },
        ));

        let (status, status_handle) = spawn_status_updater(store.clone());
        let queue = TaskQueue::start(
            store.clone(),
            executor.clone(),
            status,
            QueueConfig {
                workers: policy.max_concurrent_workflows,
                capacity: queue_capacity,
            },
        );

        let reconciler = ResourceReconciler::new(store.clone(), providers.clone());
        let reconciler_handle = tokio::spawn(
            ResourceReconciler::new(store.clone(), providers.clone()).run(outcome_rx),
        );

        Self {
            store,
            policy,
            providers,
            loader,
            queue,
            executor: Mutex::new(Some(executor)),
            reconciler,
            reconciler_handle: Mutex::new(Some(reconciler_handle)),
            status_handle: Mutex::new(Some(status_handle)),
        }
    }

    /// Parse, resolve and enqueue a Score spec. Policy violations reject the
    /// whole submission; nothing is enqueued.
    pub async fn submit_spec(
        &self,
        text: &str,
        extra_metadata: SubmissionMetadata,
    ) -> Result<SubmitResult> {
        let spec = ScoreSpec::parse(text)?;
        let app_name = spec.name().to_string();

        let first_deployment = !self.store.has_executions_for_app(&app_name).await?;
        let providers = self.providers.read().clone();
        let plan = resolve(&spec, &self.policy, &providers, first_deployment)?;

        self.reconciler.declare_resources(&spec).await?;

        let metadata = submission_metadata(&spec, extra_metadata);
        let mut submissions = Vec::with_capacity(plan.len());
        for workflow in plan.ordered() {
            let task = self
                .queue
                .submit(NewQueueTask {
                    app_name: app_name.clone(),
                    workflow_name: workflow.name.clone(),
                    workflow: workflow.clone(),
                    spec: spec.clone(),
                    metadata: metadata.clone(),
                })
                .await?;
            submissions.push(task.task_id);
        }

        self.store
            .record_audit(NewAuditEntry::new(
                &app_name,
                "spec_submitted",
                serde_json::json!({
                    "workflows": plan.ordered().map(|w| w.name.clone()).collect::<Vec<_>>(),
                    "first_deployment": first_deployment,
                    "task_ids": submissions,
                }),
            ))
            .await?;

        info!(
            app = %app_name,
            workflows = submissions.len(),
            first_deployment,
            "spec submitted"
        );
        Ok(SubmitResult {
            app_name,
            submissions,
        })
    }

    /// Re-dispatch recoverable tasks from a previous process
    pub async fn recover(&self) -> Result<usize> {
        self.queue.recover().await
    }

    pub async fn list_executions(
        &self,
        filter: ExecutionFilter,
    ) -> Result<Vec<WorkflowExecution>> {
        self.store.list_executions(filter).await
    }

    pub async fn get_execution(&self, execution_id: Uuid) -> Result<WorkflowExecution> {
        self.store
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("execution {execution_id}")))
    }

    pub async fn list_resources(&self, filter: ResourceFilter) -> Result<Vec<ResourceInstance>> {
        self.store.list_resources(filter).await
    }

    pub async fn list_audit(&self, app_name: Option<&str>) -> Result<Vec<AuditEntry>> {
        self.store.list_audit(app_name).await
    }

    /// Store an externally observed health reading on a resource without
    /// altering its state
    pub async fn record_health(
        &self,
        app_name: &str,
        resource_name: &str,
        health: ResourceHealth,
    ) -> Result<()> {
        let resource = self
            .store
            .get_resource(app_name, resource_name)
            .await?
            .ok_or_else(|| {
                OrchestratorError::NotFound(format!("resource {app_name}/{resource_name}"))
            })?;
        self.store
            .record_resource_health(resource.id, health, chrono::Utc::now())
            .await
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn active_tasks(&self) -> Vec<ActiveTaskInfo> {
        self.queue.active_tasks()
    }

    /// Deliver a cancellation signal to the execution's worker
    pub async fn cancel_execution(&self, execution_id: Uuid) -> Result<()> {
        let execution = self.get_execution(execution_id).await?;
        if self.queue.cancel_task(execution.task_id) {
            self.store
                .record_audit(NewAuditEntry::new(
                    &execution.app_name,
                    "execution_cancelled",
                    serde_json::json!({"execution_id": execution_id, "task_id": execution.task_id}),
                ))
                .await?;
            Ok(())
        } else {
            Err(OrchestratorError::NotFound(format!(
                "execution {execution_id} is not running"
            )))
        }
    }

    /// Tear an application down: synthesize one workflow from the providers'
    /// delete-* workflows in reverse dependency order and enqueue it
    pub async fn delete_application(&self, app_name: &str) -> Result<SubmitResult> {
        let teardown = {
            let providers = self.providers.read();
            build_teardown_workflow(app_name, &providers)
        }
        .ok_or_else(|| {
            OrchestratorError::NotFound(format!(
                "no teardown workflows registered for {app_name}"
            ))
        })?;

        let resources = self
            .store
            .list_resources(ResourceFilter {
                app_name: Some(app_name.to_string()),
                ..Default::default()
            })
            .await?;

        let mut spec_text = format!("apiVersion: score.dev/v1b1\nmetadata:\n  name: {app_name}\n");
        if !resources.is_empty() {
            spec_text.push_str("resources:\n");
            for resource in &resources {
                spec_text.push_str(&format!(
                    "  {}:\n    type: {}\n",
                    resource.resource_name, resource.resource_type
                ));
            }
        }
        let spec = ScoreSpec::parse(&spec_text)?;

        let mut metadata = SubmissionMetadata::new();
        metadata.insert("TEARDOWN".to_string(), "true".to_string());

        let task = self
            .queue
            .submit(NewQueueTask {
                app_name: app_name.to_string(),
                workflow_name: teardown.name.clone(),
                workflow: teardown,
                spec,
                metadata,
            })
            .await?;

        self.store
            .record_audit(NewAuditEntry::new(
                app_name,
                "teardown_requested",
                serde_json::json!({"task_id": task.task_id}),
            ))
            .await?;

        Ok(SubmitResult {
            app_name: app_name.to_string(),
            submissions: vec![task.task_id],
        })
    }

    /// Reload provider bundles from the policy's sources; returns load
    /// warnings for the status surface
    pub async fn reload_providers(&self) -> Vec<String> {
        let report = self.loader.load_all(&self.policy.providers).await;
        let count = report.providers.len();
        *self.providers.write() = report.providers;
        info!(providers = count, warnings = report.warnings.len(), "providers reloaded");
        report.warnings
    }

    /// Escalated shutdown: cancel every in-flight task
    pub fn cancel_all(&self) {
        warn!("cancelling all in-flight tasks");
        self.queue.cancel_all();
    }

    /// Graceful shutdown: stop submissions, let in-flight tasks finish,
    /// drain the status and outcome channels. Idempotent.
    pub async fn shutdown(&self) {
        self.queue.stop().await;

        // Dropping the executor closes the outcome channel; the reconciler
        // drains and exits. The status channel closes with its last sender.
        drop(self.executor.lock().take());
        let reconciler_handle = self.reconciler_handle.lock().take();
        if let Some(handle) = reconciler_handle {
            if let Err(err) = handle.await {
                warn!(error = %err, "reconciler join failed");
            }
        }
        let status_handle = self.status_handle.lock().take();
        if let Some(handle) = status_handle {
            if let Err(err) = handle.await {
                warn!(error = %err, "status updater join failed");
            }
        }
        info!("orchestrator stopped");
    }
}

/// Base metadata for the `workflow.*` namespace: recognized spec metadata
/// keys uppercased, merged with caller-provided entries (caller wins)
fn submission_metadata(
    spec: &ScoreSpec,
    extra: SubmissionMetadata,
) -> SubmissionMetadata {
    let mut metadata = SubmissionMetadata::new();
    for (key, workflow_key) in [
        ("environment", "ENVIRONMENT"),
        ("product", "PRODUCT"),
        ("team", "TEAM"),
        ("costCenter", "COST_CENTER"),
        ("region", "REGION"),
    ] {
        if let Some(value) = spec.metadata.get(key) {
            metadata.insert(workflow_key.to_string(), value.to_string());
        }
    }
    metadata.extend(extra);
    metadata
}

/// Concatenate the providers' delete-* workflows in reverse dependency
/// order into one synthetic post-deployment workflow
fn build_teardown_workflow(app_name: &str, providers: &[Provider]) -> Option<Workflow> {
    let mut steps: Vec<Step> = Vec::new();
    for provider in providers.iter().rev() {
        let mut teardowns: Vec<&Workflow> = provider.teardown_workflows().collect();
        teardowns.sort_by(|a, b| b.name.cmp(&a.name));
        for workflow in teardowns {
            for step in &workflow.steps {
                let mut step = step.clone();
                step.name = format!("{}/{}", workflow.name, step.name);
                step.depends_on = step
                    .depends_on
                    .iter()
                    .map(|d| format!("{}/{}", workflow.name, d))
                    .collect();
                steps.push(step);
            }
        }
    }
    if steps.is_empty() {
        return None;
    }
    Some(Workflow {
        name: format!("teardown-{app_name}"),
        description: format!("Tear down {app_name}"),
        owner: "platform".to_string(),
        phase: Phase::PostDeployment,
        triggers: Vec::new(),
        steps,
        source_tier: SourceTier::Platform,
    })
}
