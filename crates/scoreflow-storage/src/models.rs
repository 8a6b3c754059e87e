// Database row types (internal, converted to the core domain records).
//
// Statuses and kinds travel as text; JSONB columns carry the workflow
// snapshot, submission metadata, step outputs and resource metadata.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use scoreflow_core::{
    AuditEntry, OrchestratorError, QueueTask, ResourceInstance, StepExecution, WorkflowExecution,
};

fn bad_row(context: &str, err: impl std::fmt::Display) -> OrchestratorError {
    OrchestratorError::store(format!("corrupt {context} row: {err}"))
}

#[derive(Debug, Clone, FromRow)]
pub struct QueueTaskRow {
    pub task_id: i64,
    pub app_name: String,
    pub workflow_name: String,
    pub workflow_snapshot: serde_json::Value,
    pub spec_snapshot: serde_json::Value,
    pub metadata: serde_json::Value,
    pub status: String,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl TryFrom<QueueTaskRow> for QueueTask {
    type Error = OrchestratorError;

    fn try_from(row: QueueTaskRow) -> Result<Self, Self::Error> {
        Ok(QueueTask {
            task_id: row.task_id,
            app_name: row.app_name,
            workflow_name: row.workflow_name,
            workflow: serde_json::from_value(row.workflow_snapshot)
                .map_err(|e| bad_row("queue_tasks.workflow_snapshot", e))?,
            spec: serde_json::from_value(row.spec_snapshot)
                .map_err(|e| bad_row("queue_tasks.spec_snapshot", e))?,
            metadata: serde_json::from_value(row.metadata)
                .map_err(|e| bad_row("queue_tasks.metadata", e))?,
            status: row
                .status
                .parse()
                .map_err(|e| bad_row("queue_tasks.status", e))?,
            enqueued_at: row.enqueued_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            error_message: row.error_message,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct WorkflowExecutionRow {
    pub execution_id: Uuid,
    pub task_id: i64,
    pub app_name: String,
    pub workflow_name: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub outputs: serde_json::Value,
}

impl TryFrom<WorkflowExecutionRow> for WorkflowExecution {
    type Error = OrchestratorError;

    fn try_from(row: WorkflowExecutionRow) -> Result<Self, Self::Error> {
        Ok(WorkflowExecution {
            execution_id: row.execution_id,
            task_id: row.task_id,
            app_name: row.app_name,
            workflow_name: row.workflow_name,
            status: row
                .status
                .parse()
                .map_err(|e| bad_row("workflow_executions.status", e))?,
            started_at: row.started_at,
            completed_at: row.completed_at,
            outputs: serde_json::from_value(row.outputs)
                .map_err(|e| bad_row("workflow_executions.outputs", e))?,
            steps: Vec::new(),
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct WorkflowStepRow {
    pub execution_id: Uuid,
    pub step_index: i32,
    pub name: String,
    pub kind: String,
    pub status: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub outputs: serde_json::Value,
    pub error_message: Option<String>,
    pub stdout_tail: String,
    pub stderr_tail: String,
}

impl TryFrom<WorkflowStepRow> for StepExecution {
    type Error = OrchestratorError;

    fn try_from(row: WorkflowStepRow) -> Result<Self, Self::Error> {
        Ok(StepExecution {
            execution_id: row.execution_id,
            index: row.step_index,
            name: row.name,
            kind: row
                .kind
                .parse()
                .map_err(|e| bad_row("workflow_steps.kind", e))?,
            status: row
                .status
                .parse()
                .map_err(|e| bad_row("workflow_steps.status", e))?,
            started_at: row.started_at,
            completed_at: row.completed_at,
            stdout_tail: row.stdout_tail,
            stderr_tail: row.stderr_tail,
            outputs: serde_json::from_value(row.outputs)
                .map_err(|e| bad_row("workflow_steps.outputs", e))?,
            error_message: row.error_message,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ResourceInstanceRow {
    pub id: Uuid,
    pub application_name: String,
    pub resource_name: String,
    pub resource_type: String,
    pub state: String,
    pub health: String,
    pub configuration: serde_json::Value,
    pub provider_metadata: serde_json::Value,
    pub provider_id: Option<String>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn json_object(
    value: serde_json::Value,
    context: &str,
) -> Result<serde_json::Map<String, serde_json::Value>, OrchestratorError> {
    match value {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(bad_row(context, format!("expected object, got {other}"))),
    }
}

impl TryFrom<ResourceInstanceRow> for ResourceInstance {
    type Error = OrchestratorError;

    fn try_from(row: ResourceInstanceRow) -> Result<Self, Self::Error> {
        Ok(ResourceInstance {
            id: row.id,
            application_name: row.application_name,
            resource_name: row.resource_name,
            resource_type: row.resource_type,
            state: row
                .state
                .parse()
                .map_err(|e| bad_row("resource_instances.state", e))?,
            health: row
                .health
                .parse()
                .map_err(|e| bad_row("resource_instances.health", e))?,
            configuration: json_object(row.configuration, "resource_instances.configuration")?,
            provider_metadata: json_object(
                row.provider_metadata,
                "resource_instances.provider_metadata",
            )?,
            provider_id: row.provider_id,
            last_health_check: row.last_health_check,
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct AuditEntryRow {
    pub id: Uuid,
    pub app_name: String,
    pub action: String,
    pub detail: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl From<AuditEntryRow> for AuditEntry {
    fn from(row: AuditEntryRow) -> Self {
        AuditEntry {
            id: row.id,
            app_name: row.app_name,
            action: row.action,
            detail: row.detail,
            created_at: row.created_at,
        }
    }
}
