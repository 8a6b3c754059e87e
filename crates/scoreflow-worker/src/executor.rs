// Step executor: runs a single workflow from start to finish.
//
// Responsibilities: expand nested workflow steps, compute the dependency
// order, interpolate variables, dispatch each step kind, capture outputs,
// enforce deadlines, honor cancellation, and persist every step record
// before the next step starts (that durability is what makes restart
// recovery safe).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use scoreflow_adapters::{with_retries, AdapterError, CancelToken};
use scoreflow_core::{
    ExecutionContext, ExecutionStatus, OrchestratorError, OrchestratorStore, Provider, QueueTask,
    ResourceFilter, Result, Step, StepExecution, StepKind, StepStatus, WorkflowExecution,
};

use crate::events::StepOutcome;
use crate::runtime::StepRuntime;
use crate::steps::{self, StepInvocation};

/// Slack added to the outer deadline backstop so the runner's graceful
/// terminate path wins over a hard future drop
const DEADLINE_SLACK: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Workflow execution budget; per-step default is an even share
    pub max_workflow_duration: Duration,
    /// Nested workflow expansion bound, preventing cycles
    pub max_nesting_depth: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_workflow_duration: Duration::from_secs(30 * 60),
            max_nesting_depth: 3,
        }
    }
}

/// Terminal result of one workflow execution
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    pub error_message: Option<String>,
}

pub struct StepExecutor {
    store: Arc<dyn OrchestratorStore>,
    runtime: StepRuntime,
    providers: Arc<RwLock<Vec<Provider>>>,
    outcome_tx: mpsc::UnboundedSender<StepOutcome>,
    config: ExecutorConfig,
}

impl StepExecutor {
    pub fn new(
        store: Arc<dyn OrchestratorStore>,
        runtime: StepRuntime,
        providers: Arc<RwLock<Vec<Provider>>>,
        outcome_tx: mpsc::UnboundedSender<StepOutcome>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            runtime,
            providers,
            outcome_tx,
            config,
        }
    }

    /// Execute the task's workflow snapshot to a terminal status. Never
    /// returns Err for step failures; those become the outcome status.
    pub async fn execute(&self, task: &QueueTask, cancel: CancelToken) -> ExecutionOutcome {
        // Resume the prior execution for a re-claimed task, otherwise start
        // a fresh one.
        let execution = match self.store.execution_for_task(task.task_id).await {
            Ok(Some(existing)) if existing.status == ExecutionStatus::Running => {
                info!(
                    task_id = task.task_id,
                    execution_id = %existing.execution_id,
                    completed_steps = existing
                        .steps
                        .iter()
                        .filter(|s| s.status == StepStatus::Completed)
                        .count(),
                    "resuming execution"
                );
                existing
            }
            Ok(_) => {
                let execution = WorkflowExecution::start(task);
                if let Err(err) = self.store.create_execution(&execution).await {
                    return ExecutionOutcome {
                        execution_id: execution.execution_id,
                        status: ExecutionStatus::Failed,
                        error_message: Some(format!("create execution: {err}")),
                    };
                }
                execution
            }
            Err(err) => {
                return ExecutionOutcome {
                    execution_id: Uuid::now_v7(),
                    status: ExecutionStatus::Failed,
                    error_message: Some(format!("load execution: {err}")),
                }
            }
        };

        let (status, error_message) = match self.run_workflow(task, &execution, cancel).await {
            Ok(status) => (status, None),
            Err(err) => (ExecutionStatus::Failed, Some(err.to_string())),
        };

        if let Err(err) = self
            .store
            .update_execution_status(execution.execution_id, status)
            .await
        {
            warn!(execution_id = %execution.execution_id, error = %err, "failed to persist execution status");
        }

        ExecutionOutcome {
            execution_id: execution.execution_id,
            status,
            error_message,
        }
    }

    async fn run_workflow(
        &self,
        task: &QueueTask,
        execution: &WorkflowExecution,
        cancel: CancelToken,
    ) -> Result<ExecutionStatus> {
        let steps = self.expand_steps(&task.workflow.name, &task.workflow.steps, 0)?;
        let steps = order_steps(&task.workflow.name, steps)?;

        let mut ctx = ExecutionContext::new(Arc::new(task.spec.clone()), task.metadata.clone());
        let resources = self
            .store
            .list_resources(ResourceFilter {
                app_name: Some(task.app_name.clone()),
                ..Default::default()
            })
            .await?;
        for resource in resources {
            ctx.resources.insert(resource.resource_name.clone(), resource);
        }

        // Steps already completed by a previous claimant are never
        // re-executed; their outputs re-seed the interpolation context.
        let mut completed: HashMap<i32, StepExecution> = HashMap::new();
        for step in &execution.steps {
            if step.status == StepStatus::Completed {
                completed.insert(step.index, step.clone());
            }
        }

        let environment = ctx.environment().to_string();
        let started = Instant::now();
        let budget = self.config.max_workflow_duration;
        let default_step_timeout = budget / steps.len().max(1) as u32;

        for (index, step) in steps.iter().enumerate() {
            let index = index as i32;

            if let Some(prior) = completed.get(&index) {
                debug!(step = %step.name, "step already completed, skipping");
                ctx.record_step_outputs(
                    &prior.name,
                    terraform_like(prior.kind),
                    &prior.outputs,
                );
                continue;
            }

            if cancel.is_cancelled() {
                info!(step = %step.name, "cancellation requested before step start");
                return Ok(ExecutionStatus::Cancelled);
            }

            let remaining = budget.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                self.record_unstarted_failure(execution, index, step, "timeout")
                    .await;
                return Ok(ExecutionStatus::Failed);
            }
            let step_deadline = step
                .timeout
                .map(Duration::from_secs)
                .unwrap_or(default_step_timeout)
                .min(remaining);

            let mut record =
                StepExecution::pending(execution.execution_id, index, &step.name, step.kind);

            // `when` predicates that interpolate to a falsy value skip the
            // step entirely.
            let config = ctx.interpolated_config(step);
            if let Some(when) = &step.when {
                let predicate =
                    scoreflow_core::interpolate::interpolate(when, &ctx.variables());
                if is_falsy(&predicate) {
                    debug!(step = %step.name, predicate = %predicate, "when predicate false, skipping step");
                    record.mark_skipped();
                    self.store.record_step(&record).await?;
                    continue;
                }
            }

            record.mark_running();
            self.store.record_step(&record).await?;

            let resource_name = config
                .get("resource")
                .and_then(|v| v.as_str())
                .map(str::to_string);

            self.emit(StepOutcome::Started {
                execution_id: execution.execution_id,
                app_name: task.app_name.clone(),
                step_name: step.name.clone(),
                kind: step.kind,
                resource_name: resource_name.clone(),
            });

            info!(
                task_id = task.task_id,
                execution_id = %execution.execution_id,
                step = %step.name,
                kind = %step.kind,
                deadline_secs = step_deadline.as_secs(),
                "starting step"
            );

            let invocation = StepInvocation {
                app_name: &task.app_name,
                environment: &environment,
                step_name: &step.name,
                kind: step.kind,
                config,
                spec: &task.spec,
                deadline: step_deadline,
                cancel: cancel.clone(),
            };

            let attempt = with_retries(&step.name, || steps::dispatch(&self.runtime, &invocation));
            let result = match tokio::time::timeout(step_deadline + DEADLINE_SLACK, attempt).await
            {
                Ok(result) => result,
                Err(_) => Err(AdapterError::Timeout),
            };

            match result {
                Ok(success) => {
                    record.stdout_tail = scoreflow_core::model::bound_tail(&success.stdout);
                    record.stderr_tail = scoreflow_core::model::bound_tail(&success.stderr);
                    record.mark_completed(success.outputs.clone());
                    self.store.record_step(&record).await?;

                    ctx.record_step_outputs(&step.name, terraform_like(step.kind), &success.outputs);
                    if let Some(resource) = resource_name
                        .as_deref()
                        .and_then(|name| ctx.resources.get_mut(name))
                    {
                        // Local mirror only; the reconciler owns the durable
                        // transition.
                        let outputs: serde_json::Map<String, serde_json::Value> = success
                            .outputs
                            .iter()
                            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                            .collect();
                        resource
                            .provider_metadata
                            .insert("outputs".into(), serde_json::Value::Object(outputs));
                    }

                    self.emit(StepOutcome::Finished {
                        execution_id: execution.execution_id,
                        app_name: task.app_name.clone(),
                        step_name: step.name.clone(),
                        kind: step.kind,
                        resource_name,
                        success: true,
                        outputs: success.outputs,
                        error_message: None,
                    });
                }
                Err(err) => {
                    let message = match &err {
                        AdapterError::Cancelled => "cancelled".to_string(),
                        AdapterError::Timeout => "timeout".to_string(),
                        other => other.to_string(),
                    };
                    record.mark_failed(&message);
                    self.store.record_step(&record).await?;

                    self.emit(StepOutcome::Finished {
                        execution_id: execution.execution_id,
                        app_name: task.app_name.clone(),
                        step_name: step.name.clone(),
                        kind: step.kind,
                        resource_name,
                        success: false,
                        outputs: BTreeMap::new(),
                        error_message: Some(message.clone()),
                    });

                    if matches!(err, AdapterError::Cancelled) || cancel.is_cancelled() {
                        return Ok(ExecutionStatus::Cancelled);
                    }

                    if step.continue_on_failure {
                        warn!(step = %step.name, error = %message, "step failed, continuing");
                        continue;
                    }
                    warn!(step = %step.name, error = %message, "step failed, halting workflow");
                    return Ok(ExecutionStatus::Failed);
                }
            }
        }

        Ok(ExecutionStatus::Completed)
    }

    /// Record a failed step that never got to run (workflow budget spent)
    async fn record_unstarted_failure(
        &self,
        execution: &WorkflowExecution,
        index: i32,
        step: &Step,
        message: &str,
    ) {
        let mut record =
            StepExecution::pending(execution.execution_id, index, &step.name, step.kind);
        record.mark_failed(message);
        if let Err(err) = self.store.record_step(&record).await {
            warn!(step = %step.name, error = %err, "failed to record step failure");
        }
    }

    fn emit(&self, outcome: StepOutcome) {
        let _ = self.outcome_tx.send(outcome);
    }

    /// Inline nested `workflow` steps: the referenced `<provider>/<workflow>`
    /// golden path's steps replace the step, names prefixed with the nested
    /// workflow name. Depth is bounded to prevent cycles.
    fn expand_steps(&self, workflow: &str, steps: &[Step], depth: usize) -> Result<Vec<Step>> {
        if depth > self.config.max_nesting_depth {
            return Err(OrchestratorError::invalid_spec(format!(
                "workflow {workflow} exceeds nesting depth {}",
                self.config.max_nesting_depth
            )));
        }

        let mut expanded = Vec::new();
        // Maps a replaced workflow-step name to the last step of its
        // expansion, so sibling depends_on entries stay meaningful.
        let mut aliases: BTreeMap<String, String> = BTreeMap::new();

        for step in steps {
            if step.kind != StepKind::Workflow {
                expanded.push(step.clone());
                continue;
            }

            let coordinate = step.config_str("workflow").ok_or_else(|| {
                OrchestratorError::invalid_spec(format!(
                    "workflow step {} missing config key workflow",
                    step.name
                ))
            })?;
            let (provider_name, workflow_name) =
                coordinate.split_once('/').ok_or_else(|| {
                    OrchestratorError::invalid_spec(format!(
                        "workflow step {} must reference <provider>/<workflow>, got {coordinate}",
                        step.name
                    ))
                })?;

            let nested = {
                let providers = self.providers.read();
                providers
                    .iter()
                    .find(|p| p.name == provider_name)
                    .and_then(|p| p.golden_path(workflow_name))
                    .cloned()
            }
            .ok_or_else(|| {
                OrchestratorError::invalid_spec(format!(
                    "workflow step {} references unknown workflow {coordinate}",
                    step.name
                ))
            })?;

            let nested_steps =
                self.expand_steps(&nested.name, &nested.steps, depth + 1)?;
            let mut last_name = None;
            for mut nested_step in nested_steps {
                let local_deps: Vec<String> = nested_step
                    .depends_on
                    .iter()
                    .map(|d| format!("{workflow_name}/{d}"))
                    .collect();
                nested_step.depends_on = local_deps;
                nested_step.name = format!("{workflow_name}/{}", nested_step.name);
                last_name = Some(nested_step.name.clone());
                expanded.push(nested_step);
            }
            if let Some(last) = last_name {
                aliases.insert(step.name.clone(), last);
            }
        }

        if !aliases.is_empty() {
            for step in &mut expanded {
                for dep in &mut step.depends_on {
                    if let Some(target) = aliases.get(dep) {
                        *dep = target.clone();
                    }
                }
            }
        }

        Ok(expanded)
    }
}

fn terraform_like(kind: StepKind) -> bool {
    matches!(
        kind,
        StepKind::Terraform | StepKind::TerraformGenerate | StepKind::TfeStatus
    )
}

fn is_falsy(predicate: &str) -> bool {
    matches!(
        predicate.trim().to_ascii_lowercase().as_str(),
        "" | "false" | "no" | "0"
    )
}

/// Topological order respecting declared order among independents: repeatedly
/// emit the first not-yet-emitted step whose dependencies are all emitted.
pub fn order_steps(workflow: &str, steps: Vec<Step>) -> Result<Vec<Step>> {
    let names: HashMap<String, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.name.clone(), i))
        .collect();

    for step in &steps {
        for dep in &step.depends_on {
            if !names.contains_key(dep) {
                return Err(OrchestratorError::invalid_spec(format!(
                    "workflow {workflow}: step {} depends on unknown step {dep}",
                    step.name
                )));
            }
        }
    }

    let mut emitted = vec![false; steps.len()];
    let mut order = Vec::with_capacity(steps.len());
    while order.len() < steps.len() {
        let mut progressed = false;
        for (i, step) in steps.iter().enumerate() {
            if emitted[i] {
                continue;
            }
            let ready = step
                .depends_on
                .iter()
                .all(|dep| emitted[names[dep]]);
            if ready {
                emitted[i] = true;
                order.push(i);
                progressed = true;
                break;
            }
        }
        if !progressed {
            return Err(OrchestratorError::WorkflowCyclic {
                workflow: workflow.to_string(),
            });
        }
    }

    let mut steps: Vec<Option<Step>> = steps.into_iter().map(Some).collect();
    Ok(order
        .into_iter()
        .map(|i| steps[i].take().expect("each index emitted once"))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(name: &str, deps: &[&str]) -> Step {
        Step {
            name: name.into(),
            kind: StepKind::Shell,
            config: serde_json::Map::new(),
            when: None,
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            timeout: None,
            continue_on_failure: false,
        }
    }

    #[test]
    fn declared_order_is_kept_among_independents() {
        let ordered = order_steps(
            "wf",
            vec![step("a", &[]), step("b", &[]), step("c", &[])],
        )
        .unwrap();
        let names: Vec<_> = ordered.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn dependencies_reorder_when_needed() {
        let ordered = order_steps(
            "wf",
            vec![step("deploy", &["provision"]), step("provision", &[])],
        )
        .unwrap();
        let names: Vec<_> = ordered.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["provision", "deploy"]);
    }

    #[test]
    fn cycles_are_rejected() {
        let err = order_steps("wf", vec![step("a", &["b"]), step("b", &["a"])]).unwrap_err();
        assert!(matches!(err, OrchestratorError::WorkflowCyclic { .. }));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let err = order_steps("wf", vec![step("a", &["ghost"])]).unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidSpec(_)));
    }

    #[test]
    fn falsy_predicates() {
        assert!(is_falsy("false"));
        assert!(is_falsy(" NO "));
        assert!(is_falsy("0"));
        assert!(is_falsy(""));
        assert!(!is_falsy("true"));
        assert!(!is_falsy("${unresolved.flag}"));
    }
}
