// Store trait for durable orchestration state.
//
// The trait keeps the engine store-agnostic: production uses the Postgres
// implementation in scoreflow-storage, tests and examples use the in-memory
// implementation in this crate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::model::{
    AuditEntry, ExecutionStatus, NewAuditEntry, NewQueueTask, QueueTask, ResourceHealth,
    ResourceInstance, ResourceState, StepExecution, TaskStatus, WorkflowExecution,
};

/// Filter for execution queries
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub app_name: Option<String>,
    pub workflow_name: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub limit: Option<usize>,
}

/// Filter for resource queries
#[derive(Debug, Clone, Default)]
pub struct ResourceFilter {
    pub app_name: Option<String>,
    pub resource_type: Option<String>,
    pub state: Option<ResourceState>,
}

/// Durable storage of queued tasks, workflow executions, step records,
/// resource instances and audit entries.
///
/// The store exclusively owns all persisted entities; in-memory mirrors in
/// the queue are caches bounded by a single worker's claim.
#[async_trait]
pub trait OrchestratorStore: Send + Sync {
    // ------------------------------------------------------------------
    // Queue tasks
    // ------------------------------------------------------------------

    /// Insert a task with status `pending`, assigning the next task id
    async fn enqueue_task(&self, task: NewQueueTask) -> Result<QueueTask>;

    /// Atomically transition one specific `pending` task to `running` and
    /// return it; returns None when the task is not claimable
    async fn claim_task(&self, task_id: i64) -> Result<Option<QueueTask>>;

    /// Record a task status change; terminal statuses set `completed_at`
    async fn update_task_status(
        &self,
        task_id: i64,
        status: TaskStatus,
        error_message: Option<String>,
    ) -> Result<()>;

    async fn get_task(&self, task_id: i64) -> Result<Option<QueueTask>>;

    /// Tasks eligible for (re-)dispatch on restart: everything `pending`,
    /// plus `running` tasks whose worker no longer exists
    async fn recoverable_task_ids(&self) -> Result<Vec<i64>>;

    // ------------------------------------------------------------------
    // Executions and steps
    // ------------------------------------------------------------------

    async fn create_execution(&self, execution: &WorkflowExecution) -> Result<()>;

    /// Latest execution for a task, with step records attached
    async fn execution_for_task(&self, task_id: i64) -> Result<Option<WorkflowExecution>>;

    async fn update_execution_status(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
    ) -> Result<()>;

    /// Upsert one step record; unique on `(execution_id, index)`
    async fn record_step(&self, step: &StepExecution) -> Result<()>;

    async fn steps_for_execution(&self, execution_id: Uuid) -> Result<Vec<StepExecution>>;

    /// Execution with all step records, including bounded output tails
    async fn get_execution(&self, execution_id: Uuid) -> Result<Option<WorkflowExecution>>;

    async fn list_executions(&self, filter: ExecutionFilter) -> Result<Vec<WorkflowExecution>>;

    /// Whether any execution exists for the app (gates `first_deployment`)
    async fn has_executions_for_app(&self, app_name: &str) -> Result<bool>;

    // ------------------------------------------------------------------
    // Resource instances
    // ------------------------------------------------------------------

    /// Insert a resource instance; idempotent on `(application_name,
    /// resource_name)`, returning the existing row when present
    async fn create_resource(&self, resource: ResourceInstance) -> Result<ResourceInstance>;

    async fn get_resource(&self, app_name: &str, resource_name: &str)
        -> Result<Option<ResourceInstance>>;

    /// Validate the transition against the state-machine DAG and apply it,
    /// merging `metadata` into `provider_metadata`; fails with
    /// `IllegalTransition` otherwise
    async fn transition_resource(
        &self,
        id: Uuid,
        to: ResourceState,
        metadata: Option<serde_json::Map<String, serde_json::Value>>,
        error_message: Option<String>,
    ) -> Result<ResourceInstance>;

    /// Store a health observation without altering `state`
    async fn record_resource_health(
        &self,
        id: Uuid,
        health: ResourceHealth,
        observed_at: DateTime<Utc>,
    ) -> Result<()>;

    async fn list_resources(&self, filter: ResourceFilter) -> Result<Vec<ResourceInstance>>;

    // ------------------------------------------------------------------
    // Audit
    // ------------------------------------------------------------------

    async fn record_audit(&self, entry: NewAuditEntry) -> Result<()>;

    async fn list_audit(&self, app_name: Option<&str>) -> Result<Vec<AuditEntry>>;
}
