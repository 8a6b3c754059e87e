// Domain records shared by storage, queue, executor and reconciler.
//
// Statuses are stored as text columns; every enum here carries as_str /
// FromStr so the database representation stays stable even if variants are
// reordered.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::spec::ScoreSpec;
use crate::workflow::{StepKind, SubmissionMetadata, Workflow};

macro_rules! status_enum {
    ($(#[$doc:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant,)+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!(concat!("unknown ", stringify!($name), ": {}"), other)),
                }
            }
        }
    };
}

status_enum! {
    /// Lifecycle of an enqueued unit of work
    TaskStatus {
        Pending => "pending",
        Running => "running",
        Completed => "completed",
        Failed => "failed",
        Cancelled => "cancelled",
    }
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

status_enum! {
    /// Lifecycle of a per-run execution record
    ExecutionStatus {
        Running => "running",
        Completed => "completed",
        Failed => "failed",
        Cancelled => "cancelled",
    }
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

status_enum! {
    /// Step state machine: pending -> running -> completed | failed | skipped
    StepStatus {
        Pending => "pending",
        Running => "running",
        Completed => "completed",
        Failed => "failed",
        Skipped => "skipped",
    }
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

status_enum! {
    /// Observable state of a provisioned asset
    ResourceState {
        Requested => "requested",
        Provisioning => "provisioning",
        Active => "active",
        Failed => "failed",
        Terminating => "terminating",
        Terminated => "terminated",
    }
}

impl ResourceState {
    /// Legal transitions form a DAG:
    /// requested -> provisioning -> {active | failed},
    /// failed -> provisioning (explicit retry submission),
    /// active -> terminating -> terminated.
    pub fn can_transition(&self, to: ResourceState) -> bool {
        use ResourceState::*;
        matches!(
            (self, to),
            (Requested, Provisioning)
                | (Provisioning, Active)
                | (Provisioning, Failed)
                | (Failed, Provisioning)
                | (Active, Terminating)
                | (Terminating, Terminated)
        )
    }
}

status_enum! {
    /// Health observation stored alongside state without altering it
    ResourceHealth {
        Unknown => "unknown",
        Healthy => "healthy",
        Degraded => "degraded",
        Unhealthy => "unhealthy",
    }
}

/// Enqueued unit of work carrying an immutable snapshot of the resolved
/// workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueTask {
    /// Unique, monotonic within a process lifetime (BIGSERIAL in Postgres)
    pub task_id: i64,
    pub app_name: String,
    pub workflow_name: String,
    pub workflow: Workflow,
    /// Snapshot of the submitted spec; the executor interpolates
    /// `application.*` and renders manifests from it
    pub spec: ScoreSpec,
    pub metadata: SubmissionMetadata,
    pub status: TaskStatus,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Input for enqueuing a task
#[derive(Debug, Clone)]
pub struct NewQueueTask {
    pub app_name: String,
    pub workflow_name: String,
    pub workflow: Workflow,
    pub spec: ScoreSpec,
    pub metadata: SubmissionMetadata,
}

/// Per-run record created once a task is claimed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub execution_id: Uuid,
    pub task_id: i64,
    pub app_name: String,
    pub workflow_name: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Workflow-level outputs (merged step outputs of interest)
    pub outputs: BTreeMap<String, String>,
    pub steps: Vec<StepExecution>,
}

impl WorkflowExecution {
    /// Create a fresh running execution for a claimed task
    pub fn start(task: &QueueTask) -> Self {
        Self {
            execution_id: Uuid::now_v7(),
            task_id: task.task_id,
            app_name: task.app_name.clone(),
            workflow_name: task.workflow_name.clone(),
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            outputs: BTreeMap::new(),
            steps: Vec::new(),
        }
    }
}

/// Bounded size of stdout/stderr tails retained per step
pub const OUTPUT_TAIL_LIMIT: usize = 64 * 1024;

/// Record of a single step within an execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub execution_id: Uuid,
    pub index: i32,
    pub name: String,
    pub kind: StepKind,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Last 64 KiB of child stdout
    pub stdout_tail: String,
    /// Last 64 KiB of child stderr
    pub stderr_tail: String,
    pub outputs: BTreeMap<String, String>,
    pub error_message: Option<String>,
}

impl StepExecution {
    pub fn pending(execution_id: Uuid, index: i32, name: &str, kind: StepKind) -> Self {
        Self {
            execution_id,
            index,
            name: name.to_string(),
            kind,
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            stdout_tail: String::new(),
            stderr_tail: String::new(),
            outputs: BTreeMap::new(),
            error_message: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.status = StepStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self, outputs: BTreeMap<String, String>) {
        self.status = StepStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.outputs = outputs;
    }

    pub fn mark_failed(&mut self, message: impl Into<String>) {
        self.status = StepStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error_message = Some(message.into());
    }

    pub fn mark_skipped(&mut self) {
        self.status = StepStatus::Skipped;
        self.completed_at = Some(Utc::now());
    }
}

/// Truncate captured output to the final `OUTPUT_TAIL_LIMIT` bytes on a
/// char boundary
pub fn bound_tail(text: &str) -> String {
    if text.len() <= OUTPUT_TAIL_LIMIT {
        return text.to_string();
    }
    let mut start = text.len() - OUTPUT_TAIL_LIMIT;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

/// Observable provisioned asset derived from one `resources` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceInstance {
    pub id: Uuid,
    pub application_name: String,
    pub resource_name: String,
    pub resource_type: String,
    pub state: ResourceState,
    pub health: ResourceHealth,
    /// The `params` mapping from the spec, interpolation placeholders intact
    pub configuration: serde_json::Map<String, serde_json::Value>,
    /// Provider-populated metadata; provisioner outputs live under `outputs`
    pub provider_metadata: serde_json::Map<String, serde_json::Value>,
    /// Opaque external identifier assigned by the provisioner
    pub provider_id: Option<String>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResourceInstance {
    /// Fresh instance in `requested`, as created at submission
    pub fn requested(
        app_name: &str,
        resource_name: &str,
        resource_type: &str,
        configuration: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            application_name: app_name.to_string(),
            resource_name: resource_name.to_string(),
            resource_type: resource_type.to_string(),
            state: ResourceState::Requested,
            health: ResourceHealth::Unknown,
            configuration,
            provider_metadata: serde_json::Map::new(),
            provider_id: None,
            last_health_check: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Provisioner outputs recorded on this instance, flattened to strings
    pub fn outputs(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        if let Some(serde_json::Value::Object(map)) = self.provider_metadata.get("outputs") {
            for (k, v) in map {
                match v {
                    serde_json::Value::String(s) => out.insert(k.clone(), s.clone()),
                    other => out.insert(k.clone(), other.to_string()),
                };
            }
        }
        out
    }
}

/// Append-only audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub app_name: String,
    pub action: String,
    pub detail: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Input for recording an audit entry
#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub app_name: String,
    pub action: String,
    pub detail: serde_json::Value,
}

impl NewAuditEntry {
    pub fn new(app_name: impl Into<String>, action: impl Into<String>, detail: serde_json::Value) -> Self {
        Self {
            app_name: app_name.into(),
            action: action.into(),
            detail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_dag_allows_provisioning_path() {
        assert!(ResourceState::Requested.can_transition(ResourceState::Provisioning));
        assert!(ResourceState::Provisioning.can_transition(ResourceState::Active));
        assert!(ResourceState::Provisioning.can_transition(ResourceState::Failed));
        assert!(ResourceState::Failed.can_transition(ResourceState::Provisioning));
        assert!(ResourceState::Active.can_transition(ResourceState::Terminating));
        assert!(ResourceState::Terminating.can_transition(ResourceState::Terminated));
    }

    #[test]
    fn resource_dag_rejects_shortcuts() {
        assert!(!ResourceState::Requested.can_transition(ResourceState::Active));
        assert!(!ResourceState::Active.can_transition(ResourceState::Requested));
        assert!(!ResourceState::Terminated.can_transition(ResourceState::Provisioning));
        assert!(!ResourceState::Requested.can_transition(ResourceState::Terminating));
    }

    #[test]
    fn statuses_round_trip_through_text() {
        for s in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(s.as_str().parse::<TaskStatus>().unwrap(), s);
        }
        assert_eq!(
            "provisioning".parse::<ResourceState>().unwrap(),
            ResourceState::Provisioning
        );
        assert!("done".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn bound_tail_keeps_last_bytes() {
        let long = "x".repeat(OUTPUT_TAIL_LIMIT + 10);
        assert_eq!(bound_tail(&long).len(), OUTPUT_TAIL_LIMIT);
        assert_eq!(bound_tail("short"), "short");
    }

    #[test]
    fn resource_outputs_flatten_to_strings() {
        let mut res = ResourceInstance::requested("demo", "db", "postgres", serde_json::Map::new());
        res.provider_metadata.insert(
            "outputs".into(),
            serde_json::json!({"host": "db.internal", "port": 5432}),
        );
        let outputs = res.outputs();
        assert_eq!(outputs["host"], "db.internal");
        assert_eq!(outputs["port"], "5432");
    }
}
