// Step dispatch: one entry point per step kind, all sharing the pattern
// "take validated config, invoke adapter, capture outputs, map failures".
//
// Dispatch receives already-interpolated config. Nested `workflow` steps
// never reach here; the executor expands them inline beforehand.

mod argocd;
mod git;
mod kubernetes;
mod shell;
mod terraform;

use std::collections::BTreeMap;
use std::time::Duration;

use scoreflow_adapters::{
    AdapterError, CancelToken, ProcessOutput, ProcessRequest, ProcessRunner, Result,
};
use scoreflow_core::{ScoreSpec, StepKind};

use crate::runtime::StepRuntime;

/// Inputs for one step invocation
pub struct StepInvocation<'a> {
    pub app_name: &'a str,
    pub environment: &'a str,
    pub step_name: &'a str,
    pub kind: StepKind,
    /// Interpolated config
    pub config: serde_json::Map<String, serde_json::Value>,
    pub spec: &'a ScoreSpec,
    pub deadline: Duration,
    pub cancel: CancelToken,
}

/// Result of a successful step: outputs plus captured process tails
#[derive(Debug, Default)]
pub struct StepSuccess {
    pub outputs: BTreeMap<String, String>,
    pub stdout: String,
    pub stderr: String,
}

impl StepSuccess {
    pub fn with_outputs(outputs: BTreeMap<String, String>) -> Self {
        Self {
            outputs,
            ..Default::default()
        }
    }

    /// Append one command's captured streams
    pub fn absorb(&mut self, output: &ProcessOutput) {
        if !output.stdout.is_empty() {
            if !self.stdout.is_empty() {
                self.stdout.push('\n');
            }
            self.stdout.push_str(&output.stdout);
        }
        if !output.stderr.is_empty() {
            if !self.stderr.is_empty() {
                self.stderr.push('\n');
            }
            self.stderr.push_str(&output.stderr);
        }
    }
}

/// Route one invocation to its kind handler
pub async fn dispatch(runtime: &StepRuntime, invocation: &StepInvocation<'_>) -> Result<StepSuccess> {
    match invocation.kind {
        StepKind::Terraform => terraform::apply(runtime, invocation).await,
        StepKind::TerraformGenerate => terraform::generate(runtime, invocation).await,
        StepKind::TfeStatus => terraform::tfe_status(runtime, invocation).await,
        StepKind::Kubernetes => kubernetes::apply(runtime, invocation).await,
        StepKind::GitPr => git::open_pr(runtime, invocation).await,
        StepKind::GitCheckPr => git::check_pr(runtime, invocation).await,
        StepKind::GiteaRepo => git::ensure_repo(runtime, invocation).await,
        StepKind::GitCommitManifests => git::commit_manifests(runtime, invocation).await,
        StepKind::ArgocdApp => argocd::sync_application(runtime, invocation).await,
        StepKind::Ansible => shell::ansible(runtime, invocation).await,
        // Bucket provisioning goes through the object-store adapter instead
        // of a child command.
        StepKind::ResourceProvisioning if invocation.config.contains_key("bucket") => {
            shell::provision_bucket(runtime, invocation).await
        }
        StepKind::VaultSetup
        | StepKind::DatabaseMigration
        | StepKind::Validation
        | StepKind::Security
        | StepKind::Policy
        | StepKind::Tagging
        | StepKind::CostAnalysis
        | StepKind::ResourceProvisioning
        | StepKind::Shell => shell::command(runtime, invocation).await,
        StepKind::Workflow => Err(AdapterError::permanent(
            "nested workflow steps are expanded before dispatch",
        )),
    }
}

/// A required string config entry
pub(crate) fn require_str<'a>(
    config: &'a serde_json::Map<String, serde_json::Value>,
    key: &str,
) -> Result<&'a str> {
    config
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| AdapterError::permanent(format!("config key {key} is required")))
}

pub(crate) fn optional_str<'a>(
    config: &'a serde_json::Map<String, serde_json::Value>,
    key: &str,
) -> Option<&'a str> {
    config.get(key).and_then(|v| v.as_str())
}

/// Run a child process; a non-zero exit is a permanent failure carrying the
/// stderr tail
pub(crate) async fn exec_checked(
    runner: &dyn ProcessRunner,
    request: ProcessRequest,
    cancel: CancelToken,
    what: &str,
) -> Result<ProcessOutput> {
    let output = runner.run(request, cancel).await?;
    if output.success() {
        Ok(output)
    } else {
        Err(AdapterError::permanent(format!(
            "{what} failed (exit {}): {}",
            output.exit_code,
            output.stderr.trim()
        )))
    }
}

/// Sleep one poll interval, aborting promptly on cancellation
pub(crate) async fn poll_pause(interval: Duration, cancel: &mut CancelToken) -> Result<()> {
    tokio::select! {
        _ = tokio::time::sleep(interval) => Ok(()),
        _ = cancel.cancelled() => Err(AdapterError::Cancelled),
    }
}
