// End-to-end engine tests against the in-memory store and fake process
// runner: submission through resolution, queueing, execution and resource
// reconciliation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use scoreflow_adapters::{CancelToken, CannedResponse, FakeProcessRunner, GiteaClient};
use scoreflow_core::{
    AdminPolicy, ExecutionFilter, ExecutionStatus, InMemoryStore, OrchestratorError,
    OrchestratorStore, Phase, Provider, ProviderCategory, ResourceState, ScoreSpec, SourceTier,
    Step, StepKind, StepStatus, SubmissionMetadata, TaskStatus, Trigger, Workflow,
    WorkflowExecution,
};
use scoreflow_providers::ProviderLoader;
use scoreflow_worker::{ExecutorConfig, Orchestrator, StepExecutor, StepRuntime, WorkspaceManager};

fn shell_step(name: &str, command: &str, continue_on_failure: bool) -> Step {
    let mut config = serde_json::Map::new();
    config.insert("command".into(), serde_json::Value::String(command.into()));
    Step {
        name: name.into(),
        kind: StepKind::Shell,
        config,
        when: None,
        depends_on: vec![],
        timeout: None,
        continue_on_failure,
    }
}

fn provisioner_provider() -> Provider {
    let workflow = Workflow {
        name: "provision-postgres".into(),
        description: "Provision a PostgreSQL cluster".into(),
        owner: "database-team".into(),
        phase: Phase::PreDeployment,
        triggers: vec![Trigger::ProductDeployment],
        steps: vec![{
            let mut step = shell_step("provision", "./provision.sh", false);
            step.kind = StepKind::ResourceProvisioning;
            step
        }],
        source_tier: SourceTier::Product,
    };
    Provider {
        name: "database-team".into(),
        version: "1.4.0".into(),
        owner: "database-team".into(),
        description: String::new(),
        category: ProviderCategory::Data,
        tags: vec!["ecommerce".into()],
        commit: None,
        provisioners: [("postgres".to_string(), workflow)].into_iter().collect(),
        golden_paths: BTreeMap::new(),
    }
}

struct Harness {
    store: Arc<InMemoryStore>,
    runner: FakeProcessRunner,
    orchestrator: Orchestrator,
    _workspaces: tempfile::TempDir,
}

fn harness(policy: AdminPolicy, providers: Vec<Provider>, capacity: usize) -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let runner = FakeProcessRunner::new();
    let workspaces = tempfile::TempDir::new().unwrap();
    let runtime = StepRuntime::new(
        Arc::new(runner.clone()),
        WorkspaceManager::new(workspaces.path()),
    );
    let loader = ProviderLoader::new(Arc::new(runner.clone()));
    let orchestrator = Orchestrator::new(
        store.clone() as Arc<dyn OrchestratorStore>,
        policy,
        providers,
        runtime,
        loader,
        capacity,
    );
    Harness {
        store,
        runner,
        orchestrator,
        _workspaces: workspaces,
    }
}

async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Duration::from_secs(10);
    let result = tokio::time::timeout(deadline, async {
        loop {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {what}");
}

async fn app_executions(store: &Arc<InMemoryStore>, app: &str) -> Vec<WorkflowExecution> {
    store
        .list_executions(ExecutionFilter {
            app_name: Some(app.to_string()),
            ..Default::default()
        })
        .await
        .unwrap()
}

async fn terminal_executions(
    store: &Arc<InMemoryStore>,
    app: &str,
    expected: usize,
) -> Vec<WorkflowExecution> {
    wait_for("executions to finish", || {
        let store = store.clone();
        let app = app.to_string();
        async move {
            let executions = app_executions(&store, &app).await;
            executions.len() == expected && executions.iter().all(|e| e.status.is_terminal())
        }
    })
    .await;
    app_executions(store, app).await
}

// Scenario: a disallowed step kind rejects the submission; no task created.
#[tokio::test]
async fn policy_rejects_disallowed_step_kind() {
    let mut policy = AdminPolicy::default();
    policy.allowed_step_kinds = [StepKind::Kubernetes].into_iter().collect();
    let h = harness(policy, vec![], 10);

    let err = h
        .orchestrator
        .submit_spec(
            r#"
apiVersion: score.dev/v1b1
metadata:
  name: demo
workflows:
  deploy:
    steps:
      - name: bad
        kind: shell
        config:
          command: echo hi
"#,
            SubmissionMetadata::new(),
        )
        .await
        .unwrap_err();

    let message = err.to_string();
    assert!(message.contains("DisallowedStepKind"), "{message}");
    assert!(message.contains("workflow=deploy"), "{message}");
    assert!(message.contains("step=bad"), "{message}");

    assert!(h.store.recoverable_task_ids().await.unwrap().is_empty());
    h.orchestrator.shutdown().await;
}

// Scenario: a required platform workflow nobody offers blocks every
// submission until the provider appears.
#[tokio::test]
async fn missing_platform_workflow_blocks_submission() {
    let mut policy = AdminPolicy::default();
    policy.required_platform_workflows = vec!["security-scan".into()];
    let h = harness(policy, vec![], 10);

    let err = h
        .orchestrator
        .submit_spec(
            "apiVersion: score.dev/v1b1\nmetadata:\n  name: demo\nworkflows:\n  deploy:\n    steps:\n      - name: apply\n        kind: kubernetes\n",
            SubmissionMetadata::new(),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("MissingPlatformWorkflow(security-scan)"));
    h.orchestrator.shutdown().await;
}

// Scenario: happy-path provisioning. The product provisioner runs in
// pre-deployment, moves the resource requested -> provisioning -> active
// with outputs, then the inline deploy workflow completes.
#[tokio::test]
async fn happy_path_provisioning() {
    let mut policy = AdminPolicy::default();
    policy
        .allowed_product_workflows
        .insert("ecommerce/provision-postgres".into());
    let h = harness(policy, vec![provisioner_provider()], 10);

    // The provisioner's shell command exports outputs as key=value lines.
    h.runner
        .respond(
            CannedResponse::new("sh")
                .stdout("host=db.internal\nport=5432\nconnection_string=postgres://db.internal:5432/demo\n"),
        )
        .await;

    let result = h
        .orchestrator
        .submit_spec(
            r#"
apiVersion: score.dev/v1b1
metadata:
  name: demo
  product: ecommerce
  environment: staging
resources:
  db:
    type: postgres
containers:
  web:
    image: registry.internal/demo:1.0
workflows:
  deploy:
    steps:
      - name: apply
        kind: kubernetes
"#,
            SubmissionMetadata::new(),
        )
        .await
        .unwrap();
    assert_eq!(result.submissions.len(), 2);

    let executions = terminal_executions(&h.store, "demo", 2).await;
    assert!(
        executions
            .iter()
            .all(|e| e.status == ExecutionStatus::Completed),
        "{executions:?}"
    );

    wait_for("resource to become active", || {
        let store = h.store.clone();
        async move {
            store
                .get_resource("demo", "db")
                .await
                .unwrap()
                .map(|r| r.state == ResourceState::Active)
                .unwrap_or(false)
        }
    })
    .await;

    let resource = h.store.get_resource("demo", "db").await.unwrap().unwrap();
    let outputs = resource.outputs();
    assert_eq!(outputs["host"], "db.internal");
    assert_eq!(outputs["port"], "5432");
    assert_eq!(outputs["connection_string"], "postgres://db.internal:5432/demo");

    h.orchestrator.shutdown().await;
}

// Scenario: continue_on_failure. The telemetry step fails, the workflow
// keeps going and completes.
#[tokio::test]
async fn continue_on_failure_keeps_the_workflow_going() {
    let h = harness(AdminPolicy::default(), vec![], 10);

    h.runner
        .respond(CannedResponse::new("sh").stdout("validated\n"))
        .await;
    h.runner
        .respond(CannedResponse::new("sh").exit_code(1).stderr("telemetry sink down"))
        .await;
    h.runner
        .respond(CannedResponse::new("sh").stdout("finalized\n"))
        .await;

    h.orchestrator
        .submit_spec(
            r#"
apiVersion: score.dev/v1b1
metadata:
  name: ops-demo
workflows:
  ops:
    steps:
      - name: validate
        kind: validation
        config:
          command: ./validate.sh
      - name: telemetry
        kind: shell
        continueOnFailure: true
        config:
          command: ./telemetry.sh
      - name: finalize
        kind: shell
        config:
          command: ./finalize.sh
"#,
            SubmissionMetadata::new(),
        )
        .await
        .unwrap();

    let executions = terminal_executions(&h.store, "ops-demo", 1).await;
    let execution = &executions[0];
    assert_eq!(execution.status, ExecutionStatus::Completed);

    let by_name: BTreeMap<&str, StepStatus> = execution
        .steps
        .iter()
        .map(|s| (s.name.as_str(), s.status))
        .collect();
    assert_eq!(by_name["validate"], StepStatus::Completed);
    assert_eq!(by_name["telemetry"], StepStatus::Failed);
    assert_eq!(by_name["finalize"], StepStatus::Completed);

    let telemetry = execution.steps.iter().find(|s| s.name == "telemetry").unwrap();
    assert!(telemetry.error_message.as_deref().unwrap().contains("telemetry sink down"));

    h.orchestrator.shutdown().await;
}

// Scenario: backpressure. W=2 workers busy, B=3 buffered, the next submit
// fails fast with QueueFull.
#[tokio::test]
async fn saturated_buffer_returns_queue_full() {
    let mut policy = AdminPolicy::default();
    policy.max_concurrent_workflows = 2;
    let h = harness(policy, vec![], 3);

    for _ in 0..6 {
        h.runner
            .respond(CannedResponse::new("sh").delay(Duration::from_secs(30)))
            .await;
    }

    let spec_for = |i: usize| {
        format!(
            "apiVersion: score.dev/v1b1\nmetadata:\n  name: app-{i}\nworkflows:\n  slow:\n    steps:\n      - name: wait\n        kind: shell\n        config:\n          command: ./wait.sh\n"
        )
    };

    for i in 0..2 {
        h.orchestrator
            .submit_spec(&spec_for(i), SubmissionMetadata::new())
            .await
            .unwrap();
    }
    wait_for("both workers busy", || {
        let busy = h.orchestrator.queue_stats().active == 2;
        async move { busy }
    })
    .await;

    for i in 2..5 {
        h.orchestrator
            .submit_spec(&spec_for(i), SubmissionMetadata::new())
            .await
            .unwrap();
    }
    assert_eq!(h.orchestrator.queue_stats().queue_size, 3);

    let err = h
        .orchestrator
        .submit_spec(&spec_for(5), SubmissionMetadata::new())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::QueueFull));

    // Drain: keep cancelling as workers pick up buffered tasks, then stop.
    wait_for("queued tasks to drain", || {
        h.orchestrator.cancel_all();
        let stats = h.orchestrator.queue_stats();
        let drained = stats.active == 0 && stats.queue_size == 0;
        async move { drained }
    })
    .await;
    h.orchestrator.shutdown().await;
}

// Scenario: cancellation mid-step. The in-flight step is asked to stop, the
// workflow reports cancelled, the third step never starts.
#[tokio::test]
async fn cancellation_stops_the_workflow_mid_step() {
    let h = harness(AdminPolicy::default(), vec![], 10);

    h.runner
        .respond(CannedResponse::new("sh").stdout("step one done\n"))
        .await;
    h.runner
        .respond(CannedResponse::new("sh").delay(Duration::from_secs(30)))
        .await;

    h.orchestrator
        .submit_spec(
            r#"
apiVersion: score.dev/v1b1
metadata:
  name: cancel-demo
workflows:
  rollout:
    steps:
      - name: prepare
        kind: shell
        config:
          command: ./prepare.sh
      - name: rollout
        kind: shell
        config:
          command: ./rollout.sh
      - name: announce
        kind: shell
        config:
          command: ./announce.sh
"#,
            SubmissionMetadata::new(),
        )
        .await
        .unwrap();

    // Wait until step 2 is running.
    wait_for("second step running", || {
        let store = h.store.clone();
        async move {
            app_executions(&store, "cancel-demo")
                .await
                .first()
                .map(|e| {
                    e.steps
                        .iter()
                        .any(|s| s.name == "rollout" && s.status == StepStatus::Running)
                })
                .unwrap_or(false)
        }
    })
    .await;

    let execution_id = app_executions(&h.store, "cancel-demo").await[0].execution_id;
    h.orchestrator.cancel_execution(execution_id).await.unwrap();

    let executions = terminal_executions(&h.store, "cancel-demo", 1).await;
    let execution = &executions[0];
    assert_eq!(execution.status, ExecutionStatus::Cancelled);

    let rollout = execution.steps.iter().find(|s| s.name == "rollout").unwrap();
    assert_eq!(rollout.status, StepStatus::Failed);
    assert_eq!(rollout.error_message.as_deref(), Some("cancelled"));
    assert!(
        !execution.steps.iter().any(|s| s.name == "announce"),
        "third step is never recorded as started"
    );

    let task_id = execution.task_id;
    wait_for("task cancelled", || {
        let store = h.store.clone();
        async move {
            store
                .get_task(task_id)
                .await
                .unwrap()
                .map(|t| t.status == TaskStatus::Cancelled)
                .unwrap_or(false)
        }
    })
    .await;

    h.orchestrator.shutdown().await;
}

// Scenario: restart recovery. A re-claimed task resumes from the first
// non-terminal step; completed steps are never re-executed and their
// outputs re-seed interpolation.
#[tokio::test]
async fn resumed_execution_skips_completed_steps() {
    let store = Arc::new(InMemoryStore::new());
    let runner = FakeProcessRunner::new();
    let workspaces = tempfile::TempDir::new().unwrap();
    let runtime = StepRuntime::new(
        Arc::new(runner.clone()),
        WorkspaceManager::new(workspaces.path()),
    );
    let providers = Arc::new(RwLock::new(Vec::new()));
    let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move { while outcome_rx.recv().await.is_some() {} });

    let executor = StepExecutor::new(
        store.clone() as Arc<dyn OrchestratorStore>,
        runtime,
        providers,
        outcome_tx,
        ExecutorConfig::default(),
    );

    let spec =
        ScoreSpec::parse("apiVersion: score.dev/v1b1\nmetadata:\n  name: resume-demo\n").unwrap();
    let workflow = Workflow {
        name: "rollout".into(),
        description: String::new(),
        owner: String::new(),
        phase: Phase::Deployment,
        triggers: vec![],
        steps: vec![
            shell_step("prepare", "./prepare.sh", false),
            shell_step("build", "deploy ${prepare.token}", false),
            shell_step("verify", "./verify.sh", false),
        ],
        source_tier: SourceTier::Application,
    };
    let task = store
        .enqueue_task(scoreflow_core::NewQueueTask {
            app_name: "resume-demo".into(),
            workflow_name: "rollout".into(),
            workflow,
            spec,
            metadata: SubmissionMetadata::new(),
        })
        .await
        .unwrap();

    // Simulate the previous process: claimed, step 0 completed durably,
    // then crashed.
    let claimed = store.claim_task(task.task_id).await.unwrap().unwrap();
    let execution = WorkflowExecution::start(&claimed);
    store.create_execution(&execution).await.unwrap();
    let mut prepare =
        scoreflow_core::StepExecution::pending(execution.execution_id, 0, "prepare", StepKind::Shell);
    prepare.mark_running();
    prepare.mark_completed([("token".to_string(), "abc123".to_string())].into());
    store.record_step(&prepare).await.unwrap();

    // Restart: re-claim and execute; prepare must not run again.
    let reclaimed = store.claim_task(task.task_id).await.unwrap().unwrap();
    let outcome = executor.execute(&reclaimed, CancelToken::never()).await;
    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert_eq!(outcome.execution_id, execution.execution_id);

    let lines = runner.command_lines("sh").await;
    assert_eq!(lines.len(), 2, "only build and verify ran: {lines:?}");
    assert!(
        lines[0].contains("deploy abc123"),
        "completed step outputs re-seed interpolation: {lines:?}"
    );

    let steps = store
        .steps_for_execution(execution.execution_id)
        .await
        .unwrap();
    assert_eq!(steps.len(), 3);
    assert!(steps.iter().all(|s| s.status == StepStatus::Completed));
}

// Nested workflow steps expand inline within the same execution.
#[tokio::test]
async fn nested_workflow_steps_run_inline() {
    let migrate = Workflow {
        name: "run-migration".into(),
        description: "Run schema migrations".into(),
        owner: "database-team".into(),
        phase: Phase::Deployment,
        triggers: vec![],
        steps: vec![
            shell_step("dump", "./dump.sh", false),
            shell_step("migrate", "./migrate.sh", false),
        ],
        source_tier: SourceTier::Product,
    };
    let mut provider = provisioner_provider();
    provider.golden_paths.insert("run-migration".into(), migrate);

    let h = harness(AdminPolicy::default(), vec![provider], 10);

    h.orchestrator
        .submit_spec(
            r#"
apiVersion: score.dev/v1b1
metadata:
  name: nested-demo
workflows:
  release:
    steps:
      - name: migrate-db
        kind: workflow
        config:
          workflow: database-team/run-migration
      - name: announce
        kind: shell
        config:
          command: ./announce.sh
"#,
            SubmissionMetadata::new(),
        )
        .await
        .unwrap();

    let executions = terminal_executions(&h.store, "nested-demo", 1).await;
    let execution = &executions[0];
    assert_eq!(execution.status, ExecutionStatus::Completed, "{execution:?}");

    let names: Vec<&str> = execution.steps.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(
        names,
        vec!["run-migration/dump", "run-migration/migrate", "announce"],
        "nested steps appended with offsets inside the parent execution"
    );

    h.orchestrator.shutdown().await;
}

// Git-backed step kinds run end-to-end: gitea-repo upserts the repository
// through the REST adapter and git-check-pr resolves the merged PR.
#[tokio::test]
async fn git_steps_run_end_to_end_against_a_stubbed_gitea() {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/repos/platform/git-demo"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/orgs/platform/repos"))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
            "name": "git-demo",
            "clone_url": "https://git.internal/platform/git-demo.git",
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/repos/platform/git-demo/pulls"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
            {"head": {"ref": "bootstrap"}, "state": "closed", "merged": true},
        ])))
        .mount(&server)
        .await;

    let store = Arc::new(InMemoryStore::new());
    let runner = FakeProcessRunner::new();
    let workspaces = tempfile::TempDir::new().unwrap();
    let runtime = StepRuntime::new(
        Arc::new(runner.clone()),
        WorkspaceManager::new(workspaces.path()),
    )
    .with_gitea(GiteaClient::new(server.uri(), "platform-bot", "pw").unwrap());
    let loader = ProviderLoader::new(Arc::new(runner.clone()));
    let orchestrator = Orchestrator::new(
        store.clone() as Arc<dyn OrchestratorStore>,
        AdminPolicy::default(),
        vec![],
        runtime,
        loader,
        10,
    );

    orchestrator
        .submit_spec(
            r#"
apiVersion: score.dev/v1b1
metadata:
  name: git-demo
workflows:
  bootstrap:
    steps:
      - name: repo
        kind: gitea-repo
        config:
          owner: platform
      - name: await-review
        kind: git-check-pr
        config:
          owner: platform
          repo: git-demo
          branch: bootstrap
"#,
            SubmissionMetadata::new(),
        )
        .await
        .unwrap();

    let executions = terminal_executions(&store, "git-demo", 1).await;
    let execution = &executions[0];
    assert_eq!(execution.status, ExecutionStatus::Completed, "{execution:?}");

    let repo = execution.steps.iter().find(|s| s.name == "repo").unwrap();
    assert_eq!(repo.status, StepStatus::Completed);
    assert_eq!(
        repo.outputs["clone_url"],
        "https://git.internal/platform/git-demo.git"
    );

    let review = execution
        .steps
        .iter()
        .find(|s| s.name == "await-review")
        .unwrap();
    assert_eq!(review.status, StepStatus::Completed);
    assert_eq!(review.outputs["pr_state"], "merged");

    orchestrator.shutdown().await;
}

// Re-submitting the same spec yields fresh task and execution ids.
#[tokio::test]
async fn resubmission_creates_distinct_ids() {
    let h = harness(AdminPolicy::default(), vec![], 10);
    let spec = "apiVersion: score.dev/v1b1\nmetadata:\n  name: twice\nworkflows:\n  deploy:\n    steps:\n      - name: apply\n        kind: shell\n        config:\n          command: ./deploy.sh\n";

    let first = h
        .orchestrator
        .submit_spec(spec, SubmissionMetadata::new())
        .await
        .unwrap();
    terminal_executions(&h.store, "twice", 1).await;

    let second = h
        .orchestrator
        .submit_spec(spec, SubmissionMetadata::new())
        .await
        .unwrap();
    assert_ne!(first.submissions, second.submissions);

    let executions = terminal_executions(&h.store, "twice", 2).await;
    assert_ne!(executions[0].execution_id, executions[1].execution_id);

    h.orchestrator.shutdown().await;
}
