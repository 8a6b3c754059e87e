// Postgres implementation of the OrchestratorStore trait.
//
// Row-level atomicity comes from Postgres; the claim path uses a
// conditional UPDATE so no task is ever handed to two workers, and resource
// transitions validate the state DAG inside a single transaction with the
// row locked.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use scoreflow_core::{
    AuditEntry, ExecutionFilter, ExecutionStatus, NewAuditEntry, NewQueueTask, OrchestratorError,
    OrchestratorStore, QueueTask, ResourceFilter, ResourceHealth, ResourceInstance, ResourceState,
    Result, StepExecution, TaskStatus, WorkflowExecution,
};

use crate::models::*;

const TASK_COLUMNS: &str = "task_id, app_name, workflow_name, workflow_snapshot, spec_snapshot, metadata, status, enqueued_at, started_at, completed_at, error_message";
const EXECUTION_COLUMNS: &str =
    "execution_id, task_id, app_name, workflow_name, status, started_at, completed_at, outputs";
const STEP_COLUMNS: &str = "execution_id, step_index, name, kind, status, started_at, completed_at, outputs, error_message, stdout_tail, stderr_tail";
const RESOURCE_COLUMNS: &str = "id, application_name, resource_name, resource_type, state, health, configuration, provider_metadata, provider_id, last_health_check, error_message, created_at, updated_at";

fn db_err(err: sqlx::Error) -> OrchestratorError {
    OrchestratorError::store(err.to_string())
}

fn json_err(err: serde_json::Error) -> OrchestratorError {
    OrchestratorError::store(err.to_string())
}

/// Postgres-backed orchestrator store
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create database connection from URL
    pub async fn from_url(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply pending migrations
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn fetch_steps(&self, execution_id: Uuid) -> Result<Vec<StepExecution>> {
        let rows = sqlx::query_as::<_, WorkflowStepRow>(&format!(
            "SELECT {STEP_COLUMNS} FROM workflow_steps WHERE execution_id = $1 ORDER BY step_index"
        ))
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn attach_steps(&self, execution: WorkflowExecutionRow) -> Result<WorkflowExecution> {
        let mut execution: WorkflowExecution = execution.try_into()?;
        execution.steps = self.fetch_steps(execution.execution_id).await?;
        Ok(execution)
    }
}

#[async_trait]
impl OrchestratorStore for Database {
    async fn enqueue_task(&self, task: NewQueueTask) -> Result<QueueTask> {
        let snapshot = serde_json::to_value(&task.workflow).map_err(json_err)?;
        let spec = serde_json::to_value(&task.spec).map_err(json_err)?;
        let metadata = serde_json::to_value(&task.metadata).map_err(json_err)?;

        let row = sqlx::query_as::<_, QueueTaskRow>(&format!(
            r#"
            INSERT INTO queue_tasks (app_name, workflow_name, workflow_snapshot, spec_snapshot, metadata, status)
            VALUES ($1, $2, $3, $4, $5, 'pending')
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(&task.app_name)
        .bind(&task.workflow_name)
        .bind(&snapshot)
        .bind(&spec)
        .bind(&metadata)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        row.try_into()
    }

    async fn claim_task(&self, task_id: i64) -> Result<Option<QueueTask>> {
        // `running` is claimable only during restart recovery; the queue
        // guarantees a single live claimant per task.
        let row = sqlx::query_as::<_, QueueTaskRow>(&format!(
            r#"
            UPDATE queue_tasks
            SET status = 'running', started_at = NOW()
            WHERE task_id = $1 AND status IN ('pending', 'running')
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(TryInto::try_into).transpose()
    }

    async fn update_task_status(
        &self,
        task_id: i64,
        status: TaskStatus,
        error_message: Option<String>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE queue_tasks
            SET status = $2,
                error_message = $3,
                completed_at = CASE WHEN $2 IN ('completed', 'failed', 'cancelled') THEN NOW() ELSE completed_at END
            WHERE task_id = $1
            "#,
        )
        .bind(task_id)
        .bind(status.as_str())
        .bind(&error_message)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_task(&self, task_id: i64) -> Result<Option<QueueTask>> {
        let row = sqlx::query_as::<_, QueueTaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM queue_tasks WHERE task_id = $1"
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(TryInto::try_into).transpose()
    }

    async fn recoverable_task_ids(&self) -> Result<Vec<i64>> {
        let ids: Vec<(i64,)> = sqlx::query_as(
            "SELECT task_id FROM queue_tasks WHERE status IN ('pending', 'running') ORDER BY task_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    async fn create_execution(&self, execution: &WorkflowExecution) -> Result<()> {
        let outputs = serde_json::to_value(&execution.outputs).map_err(json_err)?;
        sqlx::query(
            r#"
            INSERT INTO workflow_executions (execution_id, task_id, app_name, workflow_name, status, started_at, outputs)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(execution.execution_id)
        .bind(execution.task_id)
        .bind(&execution.app_name)
        .bind(&execution.workflow_name)
        .bind(execution.status.as_str())
        .bind(execution.started_at)
        .bind(&outputs)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn execution_for_task(&self, task_id: i64) -> Result<Option<WorkflowExecution>> {
        let row = sqlx::query_as::<_, WorkflowExecutionRow>(&format!(
            r#"
            SELECT {EXECUTION_COLUMNS} FROM workflow_executions
            WHERE task_id = $1
            ORDER BY started_at DESC
            LIMIT 1
            "#
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(row) => Ok(Some(self.attach_steps(row).await?)),
            None => Ok(None),
        }
    }

    async fn update_execution_status(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE workflow_executions
            SET status = $2,
                completed_at = CASE WHEN $2 <> 'running' THEN NOW() ELSE completed_at END
            WHERE execution_id = $1
            "#,
        )
        .bind(execution_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn record_step(&self, step: &StepExecution) -> Result<()> {
        let outputs = serde_json::to_value(&step.outputs).map_err(json_err)?;
        sqlx::query(
            r#"
            INSERT INTO workflow_steps (execution_id, step_index, name, kind, status, started_at, completed_at, outputs, error_message, stdout_tail, stderr_tail)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (execution_id, step_index) DO UPDATE SET
                status = EXCLUDED.status,
                started_at = EXCLUDED.started_at,
                completed_at = EXCLUDED.completed_at,
                outputs = EXCLUDED.outputs,
                error_message = EXCLUDED.error_message,
                stdout_tail = EXCLUDED.stdout_tail,
                stderr_tail = EXCLUDED.stderr_tail
            "#,
        )
        .bind(step.execution_id)
        .bind(step.index)
        .bind(&step.name)
        .bind(step.kind.as_str())
        .bind(step.status.as_str())
        .bind(step.started_at)
        .bind(step.completed_at)
        .bind(&outputs)
        .bind(&step.error_message)
        .bind(&step.stdout_tail)
        .bind(&step.stderr_tail)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn steps_for_execution(&self, execution_id: Uuid) -> Result<Vec<StepExecution>> {
        self.fetch_steps(execution_id).await
    }

    async fn get_execution(&self, execution_id: Uuid) -> Result<Option<WorkflowExecution>> {
        let row = sqlx::query_as::<_, WorkflowExecutionRow>(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow_executions WHERE execution_id = $1"
        ))
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(row) => Ok(Some(self.attach_steps(row).await?)),
            None => Ok(None),
        }
    }

    async fn list_executions(&self, filter: ExecutionFilter) -> Result<Vec<WorkflowExecution>> {
        let mut builder = sqlx::QueryBuilder::new(format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow_executions WHERE 1 = 1"
        ));
        if let Some(app) = &filter.app_name {
            builder.push(" AND app_name = ").push_bind(app);
        }
        if let Some(workflow) = &filter.workflow_name {
            builder.push(" AND workflow_name = ").push_bind(workflow);
        }
        if let Some(status) = filter.status {
            builder.push(" AND status = ").push_bind(status.as_str());
        }
        builder.push(" ORDER BY started_at DESC");
        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows: Vec<WorkflowExecutionRow> = builder
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        let mut executions = Vec::with_capacity(rows.len());
        for row in rows {
            executions.push(self.attach_steps(row).await?);
        }
        Ok(executions)
    }

    async fn has_executions_for_app(&self, app_name: &str) -> Result<bool> {
        let exists: Option<(i32,)> =
            sqlx::query_as("SELECT 1 FROM workflow_executions WHERE app_name = $1 LIMIT 1")
                .bind(app_name)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(exists.is_some())
    }

    async fn create_resource(&self, resource: ResourceInstance) -> Result<ResourceInstance> {
        let configuration =
            serde_json::Value::Object(resource.configuration.clone());
        let provider_metadata =
            serde_json::Value::Object(resource.provider_metadata.clone());

        // Idempotent on (application_name, resource_name): the no-op update
        // makes RETURNING yield the existing row on conflict.
        let row = sqlx::query_as::<_, ResourceInstanceRow>(&format!(
            r#"
            INSERT INTO resource_instances
                (id, application_name, resource_name, resource_type, state, health, configuration, provider_metadata, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
            ON CONFLICT (application_name, resource_name)
                DO UPDATE SET resource_type = resource_instances.resource_type
            RETURNING {RESOURCE_COLUMNS}
            "#
        ))
        .bind(resource.id)
        .bind(&resource.application_name)
        .bind(&resource.resource_name)
        .bind(&resource.resource_type)
        .bind(resource.state.as_str())
        .bind(resource.health.as_str())
        .bind(&configuration)
        .bind(&provider_metadata)
        .bind(resource.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        row.try_into()
    }

    async fn get_resource(
        &self,
        app_name: &str,
        resource_name: &str,
    ) -> Result<Option<ResourceInstance>> {
        let row = sqlx::query_as::<_, ResourceInstanceRow>(&format!(
            "SELECT {RESOURCE_COLUMNS} FROM resource_instances WHERE application_name = $1 AND resource_name = $2"
        ))
        .bind(app_name)
        .bind(resource_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(TryInto::try_into).transpose()
    }

    async fn transition_resource(
        &self,
        id: Uuid,
        to: ResourceState,
        metadata: Option<serde_json::Map<String, serde_json::Value>>,
        error_message: Option<String>,
    ) -> Result<ResourceInstance> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query_as::<_, ResourceInstanceRow>(&format!(
            "SELECT {RESOURCE_COLUMNS} FROM resource_instances WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| OrchestratorError::NotFound(format!("resource {id}")))?;

        let mut resource: ResourceInstance = row.try_into()?;
        if !resource.state.can_transition(to) {
            return Err(OrchestratorError::IllegalTransition {
                from: resource.state,
                to,
            });
        }

        resource.state = to;
        resource.error_message = error_message;
        resource.updated_at = Utc::now();
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

        sqlx::query(
            r#"
            UPDATE resource_instances
            SET state = $2, provider_metadata = $3, provider_id = $4, error_message = $5, updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(resource.state.as_str())
        .bind(serde_json::Value::Object(resource.provider_metadata.clone()))
        .bind(&resource.provider_id)
        .bind(&resource.error_message)
        .bind(resource.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(resource)
    }

    async fn record_resource_health(
        &self,
        id: Uuid,
        health: ResourceHealth,
        observed_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE resource_instances SET health = $2, last_health_check = $3, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(health.as_str())
        .bind(observed_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_resources(&self, filter: ResourceFilter) -> Result<Vec<ResourceInstance>> {
        let mut builder = sqlx::QueryBuilder::new(format!(
            "SELECT {RESOURCE_COLUMNS} FROM resource_instances WHERE 1 = 1"
        ));
        if let Some(app) = &filter.app_name {
            builder.push(" AND application_name = ").push_bind(app);
        }
        if let Some(resource_type) = &filter.resource_type {
            builder.push(" AND resource_type = ").push_bind(resource_type);
        }
        if let Some(state) = filter.state {
            builder.push(" AND state = ").push_bind(state.as_str());
        }
        builder.push(" ORDER BY application_name, resource_name");

        let rows: Vec<ResourceInstanceRow> = builder
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn record_audit(&self, entry: NewAuditEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO audit_log (id, app_name, action, detail) VALUES ($1, $2, $3, $4)",
        )
        .bind(Uuid::now_v7())
        .bind(&entry.app_name)
        .bind(&entry.action)
        .bind(&entry.detail)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_audit(&self, app_name: Option<&str>) -> Result<Vec<AuditEntry>> {
        let rows = match app_name {
            Some(app) => {
                sqlx::query_as::<_, AuditEntryRow>(
                    "SELECT id, app_name, action, detail, created_at FROM audit_log WHERE app_name = $1 ORDER BY created_at",
                )
                .bind(app)
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?
            }
            None => {
                sqlx::query_as::<_, AuditEntryRow>(
                    "SELECT id, app_name, action, detail, created_at FROM audit_log ORDER BY created_at",
                )
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?
            }
        };
        Ok(rows.into_iter().map(Into::into).collect())
    }
}
