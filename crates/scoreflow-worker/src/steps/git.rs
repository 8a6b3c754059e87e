// git-pr, git-check-pr, gitea-repo and git-commit-manifests step kinds.
//
// Repository and PR management speaks to the Gitea adapter; working-tree
// plumbing (clone, branch, commit, push) shells out to the git CLI through
// the process runner.

use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use scoreflow_adapters::{AdapterError, GiteaClient, PrState, ProcessRequest, Result};

use super::kubernetes::{render_deployment, render_service};
use super::{exec_checked, optional_str, poll_pause, require_str, StepInvocation, StepSuccess};
use crate::runtime::StepRuntime;

const PR_POLL_INTERVAL: Duration = Duration::from_secs(5);
const PR_POLL_BUDGET: Duration = Duration::from_secs(600);
const GIT_TIMEOUT: Duration = Duration::from_secs(120);

fn gitea(runtime: &StepRuntime) -> Result<&GiteaClient> {
    runtime
        .gitea
        .as_ref()
        .ok_or_else(|| AdapterError::permanent("git repository adapter not configured"))
}

fn commit_identity(request: ProcessRequest) -> ProcessRequest {
    request
        .env("GIT_AUTHOR_NAME", "scoreflow")
        .env("GIT_AUTHOR_EMAIL", "scoreflow@localhost")
        .env("GIT_COMMITTER_NAME", "scoreflow")
        .env("GIT_COMMITTER_EMAIL", "scoreflow@localhost")
}

/// gitea-repo: idempotent repository upsert; presence is success
pub async fn ensure_repo(
    runtime: &StepRuntime,
    invocation: &StepInvocation<'_>,
) -> Result<StepSuccess> {
    let gitea = gitea(runtime)?;
    let owner = require_str(&invocation.config, "owner")?;
    let name = optional_str(&invocation.config, "name").unwrap_or(invocation.app_name);
    let description = optional_str(&invocation.config, "description").unwrap_or("");

    let repo = gitea.ensure_repo(owner, name, description).await?;

    let mut success = StepSuccess::default();
    success
        .outputs
        .insert("clone_url".to_string(), repo.clone_url);
    success.outputs.insert("repo".to_string(), repo.name);
    Ok(success)
}

/// git-pr: fresh clone, branch, copy configured files under a canonical
/// sub-path, commit, push, open the PR. Every link in that chain is fatal.
pub async fn open_pr(runtime: &StepRuntime, invocation: &StepInvocation<'_>) -> Result<StepSuccess> {
    let gitea = gitea(runtime)?;
    let owner = require_str(&invocation.config, "owner")?;
    let repo = require_str(&invocation.config, "repo")?;
    let branch = require_str(&invocation.config, "branch")?;
    let commit_message = require_str(&invocation.config, "commitMessage")?;
    let base = optional_str(&invocation.config, "base").unwrap_or("main");
    let target_path = optional_str(&invocation.config, "targetPath").unwrap_or(".");

    let workspace = runtime
        .workspaces
        .fresh_step_dir(invocation.app_name, invocation.environment, invocation.step_name)
        .map_err(|e| AdapterError::permanent(e.to_string()))?;
    let checkout = workspace.join(repo);

    let clone_url = gitea.authenticated_clone_url(owner, repo);
    exec_checked(
        runtime.runner.as_ref(),
        ProcessRequest::new(
            "git",
            &["clone", &clone_url, &checkout.to_string_lossy()],
        )
        .timeout(GIT_TIMEOUT),
        invocation.cancel.clone(),
        "git clone",
    )
    .await?;

    let git = |args: &[&str]| {
        commit_identity(
            ProcessRequest::new("git", args)
                .cwd(&checkout)
                .timeout(GIT_TIMEOUT),
        )
    };

    exec_checked(
        runtime.runner.as_ref(),
        git(&["checkout", "-b", branch]),
        invocation.cancel.clone(),
        "git checkout",
    )
    .await?;

    // Copy the configured files into the canonical sub-path.
    let files = invocation
        .config
        .get("files")
        .and_then(|v| v.as_array())
        .ok_or_else(|| AdapterError::permanent("config key files must be a list"))?;
    let destination = checkout.join(target_path);
    fs::create_dir_all(&destination)
        .map_err(|e| AdapterError::permanent(format!("create {target_path}: {e}")))?;
    for file in files {
        let source = file
            .as_str()
            .ok_or_else(|| AdapterError::permanent("config key files must list paths"))?;
        let name = Path::new(source)
            .file_name()
            .ok_or_else(|| AdapterError::permanent(format!("bad file path {source}")))?;
        fs::copy(source, destination.join(name))
            .map_err(|e| AdapterError::permanent(format!("copy {source}: {e}")))?;
    }

    exec_checked(
        runtime.runner.as_ref(),
        git(&["add", "-A"]),
        invocation.cancel.clone(),
        "git add",
    )
    .await?;
    exec_checked(
        runtime.runner.as_ref(),
        git(&["commit", "-m", commit_message]),
        invocation.cancel.clone(),
        "git commit",
    )
    .await?;
    exec_checked(
        runtime.runner.as_ref(),
        git(&["push", "-u", "origin", branch]),
        invocation.cancel.clone(),
        "git push",
    )
    .await?;

    let title = optional_str(&invocation.config, "title").unwrap_or(commit_message);
    let body = optional_str(&invocation.config, "body").unwrap_or("");
    let pr = gitea
        .open_pull_request(owner, repo, branch, base, title, body)
        .await?;
    info!(owner, repo, branch, pr = pr.number, "opened pull request");

    let mut success = StepSuccess::default();
    success
        .outputs
        .insert("pr_number".to_string(), pr.number.to_string());
    success.outputs.insert("pr_url".to_string(), pr.html_url);
    success.outputs.insert("branch".to_string(), branch.to_string());
    Ok(success)
}

/// git-check-pr: poll the PR for the branch until MERGED (success) or
/// CLOSED without merge (failure); 5s interval, 10 minute budget
pub async fn check_pr(runtime: &StepRuntime, invocation: &StepInvocation<'_>) -> Result<StepSuccess> {
    let gitea = gitea(runtime)?;
    let owner = require_str(&invocation.config, "owner")?;
    let repo = require_str(&invocation.config, "repo")?;
    let branch = require_str(&invocation.config, "branch")?;

    let budget = PR_POLL_BUDGET.min(invocation.deadline);
    let started = Instant::now();
    let mut cancel = invocation.cancel.clone();

    loop {
        match gitea.pull_request_state(owner, repo, branch).await? {
            PrState::Merged => {
                let mut success = StepSuccess::default();
                success
                    .outputs
                    .insert("pr_state".to_string(), "merged".to_string());
                return Ok(success);
            }
            PrState::Closed => {
                return Err(AdapterError::permanent(format!(
                    "pull request for {branch} was closed without merge"
                )));
            }
            PrState::Open => debug!(owner, repo, branch, "pull request still open"),
        }

        if started.elapsed() + PR_POLL_INTERVAL > budget {
            return Err(AdapterError::Timeout);
        }
        poll_pause(PR_POLL_INTERVAL, &mut cancel).await?;
    }
}

/// git-commit-manifests: render the app's Kubernetes manifests, clone the
/// GitOps repo, write them at manifestPath, commit and push. An empty diff
/// is success, not failure.
pub async fn commit_manifests(
    runtime: &StepRuntime,
    invocation: &StepInvocation<'_>,
) -> Result<StepSuccess> {
    let gitea = gitea(runtime)?;
    let owner = require_str(&invocation.config, "owner")?;
    let repo = require_str(&invocation.config, "repo")?;
    let manifest_path = require_str(&invocation.config, "manifestPath")?;
    let branch = optional_str(&invocation.config, "branch").unwrap_or("main");
    let namespace = optional_str(&invocation.config, "namespace")
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}-{}", invocation.app_name, invocation.environment));

    let workspace = runtime
        .workspaces
        .fresh_step_dir(invocation.app_name, invocation.environment, invocation.step_name)
        .map_err(|e| AdapterError::permanent(e.to_string()))?;
    let checkout = workspace.join(repo);

    let clone_url = gitea.authenticated_clone_url(owner, repo);
    exec_checked(
        runtime.runner.as_ref(),
        ProcessRequest::new(
            "git",
            &[
                "clone",
                "--branch",
                branch,
                &clone_url,
                &checkout.to_string_lossy(),
            ],
        )
        .timeout(GIT_TIMEOUT),
        invocation.cancel.clone(),
        "git clone",
    )
    .await?;

    let target = checkout.join(manifest_path);
    fs::create_dir_all(&target)
        .map_err(|e| AdapterError::permanent(format!("create {manifest_path}: {e}")))?;
    fs::write(
        target.join("deployment.yaml"),
        render_deployment(invocation.spec, &namespace),
    )
    .map_err(|e| AdapterError::permanent(format!("write deployment: {e}")))?;
    fs::write(
        target.join("service.yaml"),
        render_service(invocation.spec, &namespace),
    )
    .map_err(|e| AdapterError::permanent(format!("write service: {e}")))?;

    let git = |args: &[&str]| {
        commit_identity(
            ProcessRequest::new("git", args)
                .cwd(&checkout)
                .timeout(GIT_TIMEOUT),
        )
    };

    exec_checked(
        runtime.runner.as_ref(),
        git(&["add", "-A"]),
        invocation.cancel.clone(),
        "git add",
    )
    .await?;

    // diff --cached --quiet exits 1 when there are staged changes.
    let diff = runtime
        .runner
        .run(git(&["diff", "--cached", "--quiet"]), invocation.cancel.clone())
        .await?;
    if diff.success() {
        info!(owner, repo, "manifests unchanged, nothing to commit");
        let mut success = StepSuccess::default();
        success
            .outputs
            .insert("changed".to_string(), "false".to_string());
        return Ok(success);
    }

    exec_checked(
        runtime.runner.as_ref(),
        git(&[
            "commit",
            "-m",
            &format!("update manifests for {}", invocation.app_name),
        ]),
        invocation.cancel.clone(),
        "git commit",
    )
    .await?;
    exec_checked(
        runtime.runner.as_ref(),
        git(&["push", "origin", branch]),
        invocation.cancel.clone(),
        "git push",
    )
    .await?;

    let mut success = StepSuccess::default();
    success
        .outputs
        .insert("changed".to_string(), "true".to_string());
    Ok(success)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use scoreflow_adapters::{CancelToken, CannedResponse, FakeProcessRunner};
    use scoreflow_core::{ScoreSpec, StepKind};

    use crate::workspace::WorkspaceManager;

    struct Rig {
        runner: FakeProcessRunner,
        runtime: StepRuntime,
        _workspaces: tempfile::TempDir,
    }

    fn rig(server: &MockServer) -> Rig {
        let runner = FakeProcessRunner::new();
        let workspaces = tempfile::TempDir::new().unwrap();
        let runtime = StepRuntime::new(
            Arc::new(runner.clone()),
            WorkspaceManager::new(workspaces.path()),
        )
        .with_gitea(GiteaClient::new(server.uri(), "platform-bot", "pw").unwrap());
        Rig {
            runner,
            runtime,
            _workspaces: workspaces,
        }
    }

    fn spec() -> ScoreSpec {
        ScoreSpec::parse("apiVersion: score.dev/v1b1\nmetadata:\n  name: demo\n").unwrap()
    }

    fn invocation(
        spec: &ScoreSpec,
        kind: StepKind,
        config: serde_json::Value,
    ) -> StepInvocation<'_> {
        StepInvocation {
            app_name: "demo",
            environment: "staging",
            step_name: "git-step",
            kind,
            config: serde_json::from_value(config).unwrap(),
            spec,
            deadline: Duration::from_secs(60),
            cancel: CancelToken::never(),
        }
    }

    #[tokio::test]
    async fn ensure_repo_reports_the_clone_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/repos/platform/demo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "demo",
                "clone_url": "https://git.internal/platform/demo.git",
            })))
            .mount(&server)
            .await;

        let rig = rig(&server);
        let spec = spec();
        let inv = invocation(
            &spec,
            StepKind::GiteaRepo,
            serde_json::json!({"owner": "platform"}),
        );

        let success = ensure_repo(&rig.runtime, &inv).await.unwrap();
        assert_eq!(success.outputs["repo"], "demo");
        assert_eq!(
            success.outputs["clone_url"],
            "https://git.internal/platform/demo.git"
        );
    }

    #[tokio::test]
    async fn open_pr_clones_branches_commits_pushes_then_opens() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/repos/platform/configs/pulls"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "number": 7,
                "html_url": "https://git.internal/platform/configs/pulls/7",
                "state": "open",
                "merged": false,
            })))
            .expect(1)
            .mount(&server)
            .await;

        let sources = tempfile::TempDir::new().unwrap();
        std::fs::write(sources.path().join("values.yaml"), "replicas: 2\n").unwrap();

        let rig = rig(&server);
        let spec = spec();
        let inv = invocation(
            &spec,
            StepKind::GitPr,
            serde_json::json!({
                "owner": "platform",
                "repo": "configs",
                "branch": "demo-update",
                "commitMessage": "update demo values",
                "targetPath": "apps/demo",
                "files": [sources.path().join("values.yaml").to_string_lossy().into_owned()],
            }),
        );

        let success = open_pr(&rig.runtime, &inv).await.unwrap();
        assert_eq!(success.outputs["pr_number"], "7");
        assert_eq!(success.outputs["branch"], "demo-update");

        let lines = rig.runner.command_lines("git").await;
        assert!(
            lines[0].starts_with("git clone http://platform-bot@"),
            "{lines:?}"
        );
        assert!(lines[1].contains("checkout -b demo-update"));
        assert!(lines.iter().any(|l| l.contains("commit -m update demo values")));
        assert!(lines.last().unwrap().contains("push -u origin demo-update"));
    }

    #[tokio::test]
    async fn check_pr_succeeds_on_merge_and_fails_on_close() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/repos/platform/configs/pulls"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"head": {"ref": "merged-branch"}, "state": "closed", "merged": true},
                {"head": {"ref": "rejected-branch"}, "state": "closed", "merged": false},
            ])))
            .mount(&server)
            .await;

        let rig = rig(&server);
        let spec = spec();

        let merged = invocation(
            &spec,
            StepKind::GitCheckPr,
            serde_json::json!({"owner": "platform", "repo": "configs", "branch": "merged-branch"}),
        );
        let success = check_pr(&rig.runtime, &merged).await.unwrap();
        assert_eq!(success.outputs["pr_state"], "merged");

        let rejected = invocation(
            &spec,
            StepKind::GitCheckPr,
            serde_json::json!({"owner": "platform", "repo": "configs", "branch": "rejected-branch"}),
        );
        let err = check_pr(&rig.runtime, &rejected).await.unwrap_err();
        assert!(matches!(err, AdapterError::Permanent(_)), "{err}");
    }

    #[tokio::test]
    async fn commit_manifests_with_empty_diff_is_success() {
        let server = MockServer::start().await;
        let rig = rig(&server);
        let spec = spec();
        let inv = invocation(
            &spec,
            StepKind::GitCommitManifests,
            serde_json::json!({"owner": "platform", "repo": "gitops", "manifestPath": "apps/demo"}),
        );

        // Every git command succeeds; diff --cached --quiet exiting 0 means
        // nothing is staged.
        let success = commit_manifests(&rig.runtime, &inv).await.unwrap();
        assert_eq!(success.outputs["changed"], "false");

        let lines = rig.runner.command_lines("git").await;
        assert!(
            !lines.iter().any(|l| l.contains(" commit ")),
            "empty diff must not commit: {lines:?}"
        );
    }

    #[tokio::test]
    async fn commit_manifests_pushes_when_the_diff_is_nonempty() {
        let server = MockServer::start().await;
        let rig = rig(&server);
        rig.runner
            .respond(CannedResponse::new("git").first_arg("diff").exit_code(1))
            .await;

        let spec = spec();
        let inv = invocation(
            &spec,
            StepKind::GitCommitManifests,
            serde_json::json!({"owner": "platform", "repo": "gitops", "manifestPath": "apps/demo"}),
        );

        let success = commit_manifests(&rig.runtime, &inv).await.unwrap();
        assert_eq!(success.outputs["changed"], "true");

        let lines = rig.runner.command_lines("git").await;
        assert!(lines.iter().any(|l| l.contains(" commit ")), "{lines:?}");
        assert!(lines.last().unwrap().contains("push origin main"));
    }
}
