// In-memory store implementation.
//
// Keeps all orchestration state in process memory, making it the backend for
// unit tests and examples. Behavior mirrors the Postgres store, including
// transition validation and claim atomicity (a single write lock guards the
// whole state).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::model::{
    AuditEntry, ExecutionStatus, NewAuditEntry, NewQueueTask, QueueTask, ResourceHealth,
    ResourceInstance, ResourceState, StepExecution, TaskStatus, WorkflowExecution,
};
use crate::store::{ExecutionFilter, OrchestratorStore, ResourceFilter};

#[derive(Default)]
struct State {
    next_task_id: i64,
    tasks: BTreeMap<i64, QueueTask>,
    executions: HashMap<Uuid, WorkflowExecution>,
    steps: HashMap<Uuid, BTreeMap<i32, StepExecution>>,
    resources: HashMap<Uuid, ResourceInstance>,
    audit: Vec<AuditEntry>,
}

/// In-memory implementation of [`OrchestratorStore`]
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl State {
    fn resource_by_coords(&self, app: &str, name: &str) -> Option<&ResourceInstance> {
        self.resources
            .values()
            .find(|r| r.application_name == app && r.resource_name == name)
    }

    fn execution_with_steps(&self, execution: &WorkflowExecution) -> WorkflowExecution {
        let mut execution = execution.clone();
        if let Some(steps) = self.steps.get(&execution.execution_id) {
            execution.steps = steps.values().cloned().collect();
        }
        execution
    }
}

#[async_trait]
impl OrchestratorStore for InMemoryStore {
    async fn enqueue_task(&self, task: NewQueueTask) -> Result<QueueTask> {
        let mut state = self.state.write().await;
        state.next_task_id += 1;
        let task = QueueTask {
            task_id: state.next_task_id,
            app_name: task.app_name,
            workflow_name: task.workflow_name,
            workflow: task.workflow,
            spec: task.spec,
            metadata: task.metadata,
            status: TaskStatus::Pending,
            enqueued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
        };
        state.tasks.insert(task.task_id, task.clone());
        Ok(task)
    }

    async fn claim_task(&self, task_id: i64) -> Result<Option<QueueTask>> {
        let mut state = self.state.write().await;
        match state.tasks.get_mut(&task_id) {
            Some(task) if task.status == TaskStatus::Pending || task.status == TaskStatus::Running => {
                // Running tasks are claimable only during recovery; the
                // queue guarantees a single live claimant per task.
                task.status = TaskStatus::Running;
                task.started_at = Some(Utc::now());
                Ok(Some(task.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn update_task_status(
        &self,
        task_id: i64,
        status: TaskStatus,
        error_message: Option<String>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("task {task_id}")))?;
        task.status = status;
        task.error_message = error_message;
        if status.is_terminal() {
            task.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn get_task(&self, task_id: i64) -> Result<Option<QueueTask>> {
        Ok(self.state.read().await.tasks.get(&task_id).cloned())
    }

    async fn recoverable_task_ids(&self) -> Result<Vec<i64>> {
        let state = self.state.read().await;
        Ok(state
            .tasks
            .values()
            .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Running))
            .map(|t| t.task_id)
            .collect())
    }

    async fn create_execution(&self, execution: &WorkflowExecution) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .executions
            .insert(execution.execution_id, execution.clone());
        Ok(())
    }

    async fn execution_for_task(&self, task_id: i64) -> Result<Option<WorkflowExecution>> {
        let state = self.state.read().await;
        Ok(state
            .executions
            .values()
            .filter(|e| e.task_id == task_id)
            .max_by_key(|e| e.started_at)
            .map(|e| state.execution_with_steps(e)))
    }

    async fn update_execution_status(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let execution = state
            .executions
            .get_mut(&execution_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("execution {execution_id}")))?;
        execution.status = status;
        if status.is_terminal() {
            execution.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn record_step(&self, step: &StepExecution) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .steps
            .entry(step.execution_id)
            .or_default()
            .insert(step.index, step.clone());
        Ok(())
    }

    async fn steps_for_execution(&self, execution_id: Uuid) -> Result<Vec<StepExecution>> {
        let state = self.state.read().await;
        Ok(state
            .steps
            .get(&execution_id)
            .map(|steps| steps.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_execution(&self, execution_id: Uuid) -> Result<Option<WorkflowExecution>> {
        let state = self.state.read().await;
        Ok(state
            .executions
            .get(&execution_id)
            .map(|e| state.execution_with_steps(e)))
    }

    async fn list_executions(&self, filter: ExecutionFilter) -> Result<Vec<WorkflowExecution>> {
        let state = self.state.read().await;
        let mut executions: Vec<WorkflowExecution> = state
            .executions
            .values()
            .filter(|e| {
                filter
                    .app_name
                    .as_ref()
                    .is_none_or(|app| &e.app_name == app)
                    && filter
                        .workflow_name
                        .as_ref()
                        .is_none_or(|wf| &e.workflow_name == wf)
                    && filter.status.is_none_or(|s| e.status == s)
            })
            .map(|e| state.execution_with_steps(e))
            .collect();
        executions.sort_by_key(|e| std::cmp::Reverse(e.started_at));
        if let Some(limit) = filter.limit {
            executions.truncate(limit);
        }
        Ok(executions)
    }

    async fn has_executions_for_app(&self, app_name: &str) -> Result<bool> {
        let state = self.state.read().await;
        Ok(state.executions.values().any(|e| e.app_name == app_name))
    }

    async fn create_resource(&self, resource: ResourceInstance) -> Result<ResourceInstance> {
        let mut state = self.state.write().await;
        if let Some(existing) =
            state.resource_by_coords(&resource.application_name, &resource.resource_name)
        {
            return Ok(existing.clone());
        }
        state.resources.insert(resource.id, resource.clone());
        Ok(resource)
    }

    async fn get_resource(
        &self,
        app_name: &str,
        resource_name: &str,
    ) -> Result<Option<ResourceInstance>> {
        let state = self.state.read().await;
        Ok(state.resource_by_coords(app_name, resource_name).cloned())
    }

    async fn transition_resource(
        &self,
        id: Uuid,
        to: ResourceState,
        metadata: Option<serde_json::Map<String, serde_json::Value>>,
        error_message: Option<String>,
    ) -> Result<ResourceInstance> {
        let mut state = self.state.write().await;
        let resource = state
            .resources
            .get_mut(&id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("resource {id}")))?;

        if !resource.state.can_transition(to) {
            return Err(OrchestratorError::IllegalTransition {
                from: resource.state,
                to,
            });
        }

        resource.state = to;
        resource.updated_at = Utc::now();
        resource.error_message = error_message;
        if let Some(metadata) = metadata {
            for (key, value) in metadata {
                if key == "provider_id" {
                    if let Some(provider_id) = value.as_str() {
                        resource.provider_id = Some(provider_id.to_string());
                        continue;
                    }
                }
                resource.provider_metadata.insert(key, value);
            }
        }
        Ok(resource.clone())
    }

    async fn record_resource_health(
        &self,
        id: Uuid,
        health: ResourceHealth,
        observed_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let resource = state
            .resources
            .get_mut(&id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("resource {id}")))?;
        resource.health = health;
        resource.last_health_check = Some(observed_at);
        resource.updated_at = Utc::now();
        Ok(())
    }

    async fn list_resources(&self, filter: ResourceFilter) -> Result<Vec<ResourceInstance>> {
        let state = self.state.read().await;
        let mut resources: Vec<ResourceInstance> = state
            .resources
            .values()
            .filter(|r| {
                filter
                    .app_name
                    .as_ref()
                    .is_none_or(|app| &r.application_name == app)
                    && filter
                        .resource_type
                        .as_ref()
                        .is_none_or(|ty| &r.resource_type == ty)
                    && filter.state.is_none_or(|s| r.state == s)
            })
            .cloned()
            .collect();
        resources.sort_by(|a, b| {
            (&a.application_name, &a.resource_name).cmp(&(&b.application_name, &b.resource_name))
        });
        Ok(resources)
    }

    async fn record_audit(&self, entry: NewAuditEntry) -> Result<()> {
        let mut state = self.state.write().await;
        state.audit.push(AuditEntry {
            id: Uuid::now_v7(),
            app_name: entry.app_name,
            action: entry.action,
            detail: entry.detail,
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn list_audit(&self, app_name: Option<&str>) -> Result<Vec<AuditEntry>> {
        let state = self.state.read().await;
        Ok(state
            .audit
            .iter()
            .filter(|e| app_name.is_none_or(|app| e.app_name == app))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{Step, StepKind, Workflow};

    fn new_task(app: &str) -> NewQueueTask {
        let spec = crate::spec::ScoreSpec::parse(&format!(
            "apiVersion: score.dev/v1b1\nmetadata:\n  name: {app}\n"
        ))
        .unwrap();
        NewQueueTask {
            app_name: app.into(),
            workflow_name: "deploy".into(),
            spec,
            workflow: Workflow {
                name: "deploy".into(),
                description: String::new(),
                owner: String::new(),
                phase: Default::default(),
                triggers: vec![],
                steps: vec![Step {
                    name: "apply".into(),
                    kind: StepKind::Kubernetes,
                    config: serde_json::Map::new(),
                    when: None,
                    depends_on: vec![],
                    timeout: None,
                    continue_on_failure: false,
                }],
                source_tier: Default::default(),
            },
            metadata: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn task_ids_are_monotonic() {
        let store = InMemoryStore::new();
        let first = store.enqueue_task(new_task("demo")).await.unwrap();
        let second = store.enqueue_task(new_task("demo")).await.unwrap();
        assert!(second.task_id > first.task_id);
    }

    #[tokio::test]
    async fn claim_transitions_pending_to_running_once() {
        let store = InMemoryStore::new();
        let task = store.enqueue_task(new_task("demo")).await.unwrap();

        let claimed = store.claim_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(claimed.status, TaskStatus::Running);

        store
            .update_task_status(task.task_id, TaskStatus::Completed, None)
            .await
            .unwrap();
        assert!(store.claim_task(task.task_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn illegal_resource_transition_is_rejected_without_change() {
        let store = InMemoryStore::new();
        let resource = store
            .create_resource(ResourceInstance::requested(
                "demo",
                "db",
                "postgres",
                serde_json::Map::new(),
            ))
            .await
            .unwrap();

        let err = store
            .transition_resource(resource.id, ResourceState::Active, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::IllegalTransition { .. }));

        let unchanged = store.get_resource("demo", "db").await.unwrap().unwrap();
        assert_eq!(unchanged.state, ResourceState::Requested);
    }

    #[tokio::test]
    async fn resource_creation_is_idempotent_per_app_and_name() {
        let store = InMemoryStore::new();
        let first = store
            .create_resource(ResourceInstance::requested(
                "demo",
                "db",
                "postgres",
                serde_json::Map::new(),
            ))
            .await
            .unwrap();
        let second = store
            .create_resource(ResourceInstance::requested(
                "demo",
                "db",
                "postgres",
                serde_json::Map::new(),
            ))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn transition_merges_outputs_into_provider_metadata() {
        let store = InMemoryStore::new();
        let resource = store
            .create_resource(ResourceInstance::requested(
                "demo",
                "db",
                "postgres",
                serde_json::Map::new(),
            ))
            .await
            .unwrap();

        store
            .transition_resource(resource.id, ResourceState::Provisioning, None, None)
            .await
            .unwrap();

        let mut metadata = serde_json::Map::new();
        metadata.insert("outputs".into(), serde_json::json!({"host": "db.internal"}));
        metadata.insert("provider_id".into(), serde_json::json!("pg-cluster-7"));
        let active = store
            .transition_resource(resource.id, ResourceState::Active, Some(metadata), None)
            .await
            .unwrap();

        assert_eq!(active.state, ResourceState::Active);
        assert_eq!(active.provider_id.as_deref(), Some("pg-cluster-7"));
        assert_eq!(active.outputs()["host"], "db.internal");
    }

    #[tokio::test]
    async fn step_records_upsert_on_execution_and_index() {
        let store = InMemoryStore::new();
        let task = store.enqueue_task(new_task("demo")).await.unwrap();
        let execution = WorkflowExecution::start(&task);
        store.create_execution(&execution).await.unwrap();

        let mut step =
            StepExecution::pending(execution.execution_id, 0, "apply", StepKind::Kubernetes);
        step.mark_running();
        store.record_step(&step).await.unwrap();
        step.mark_completed(BTreeMap::new());
        store.record_step(&step).await.unwrap();

        let steps = store
            .steps_for_execution(execution.execution_id)
            .await
            .unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].status, crate::model::StepStatus::Completed);
    }
}
