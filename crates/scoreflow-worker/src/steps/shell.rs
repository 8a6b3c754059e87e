// Shell-like step kinds.
//
// vault-setup, database-migration, validation, security, policy, tagging,
// cost-analysis, resource-provisioning and shell all share one contract:
// run the configured command in the step workspace, capture bounded tails,
// non-zero exit fails the step. ansible gets the same treatment with the
// playbook copied into the workspace first.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use scoreflow_adapters::{AdapterError, ProcessRequest, Result};

use super::{exec_checked, optional_str, require_str, StepInvocation, StepSuccess};
use crate::runtime::StepRuntime;

/// Generic child-command contract for the shell-like kinds
pub async fn command(runtime: &StepRuntime, invocation: &StepInvocation<'_>) -> Result<StepSuccess> {
    let command = require_str(&invocation.config, "command")?;
    let workspace = runtime
        .workspaces
        .step_dir(invocation.app_name, invocation.environment, invocation.step_name)
        .map_err(|e| AdapterError::permanent(e.to_string()))?;

    let mut request = ProcessRequest::new("sh", &["-c", command])
        .cwd(&workspace)
        .timeout(invocation.deadline);
    if let Some(env) = invocation.config.get("env").and_then(|v| v.as_object()) {
        for (key, value) in env {
            if let Some(value) = value.as_str() {
                request = request.env(key, value);
            }
        }
    }

    let output = exec_checked(
        runtime.runner.as_ref(),
        request,
        invocation.cancel.clone(),
        invocation.kind.as_str(),
    )
    .await?;

    let mut success = StepSuccess::with_outputs(parse_output_lines(&output.stdout));
    success.absorb(&output);
    Ok(success)
}

/// ansible: copy the playbook into the workspace and run ansible-playbook;
/// non-zero exit propagates as a step failure
pub async fn ansible(runtime: &StepRuntime, invocation: &StepInvocation<'_>) -> Result<StepSuccess> {
    let playbook = require_str(&invocation.config, "playbook")?;
    let workspace = runtime
        .workspaces
        .step_dir(invocation.app_name, invocation.environment, invocation.step_name)
        .map_err(|e| AdapterError::permanent(e.to_string()))?;

    let file_name = Path::new(playbook)
        .file_name()
        .ok_or_else(|| AdapterError::permanent(format!("bad playbook path {playbook}")))?;
    let local = workspace.join(file_name);
    fs::copy(playbook, &local)
        .map_err(|e| AdapterError::permanent(format!("copy playbook {playbook}: {e}")))?;

    let mut args = vec![local.to_string_lossy().into_owned()];
    if let Some(inventory) = optional_str(&invocation.config, "inventory") {
        args.push("-i".to_string());
        args.push(inventory.to_string());
    }
    if let Some(extra_vars) = invocation.config.get("extraVars").and_then(|v| v.as_object()) {
        for (key, value) in extra_vars {
            args.push("-e".to_string());
            let rendered = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            args.push(format!("{key}={rendered}"));
        }
    }

    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    let output = exec_checked(
        runtime.runner.as_ref(),
        ProcessRequest::new("ansible-playbook", &arg_refs)
            .cwd(&workspace)
            .timeout(invocation.deadline),
        invocation.cancel.clone(),
        "ansible-playbook",
    )
    .await?;

    let mut success = StepSuccess::default();
    success.absorb(&output);
    Ok(success)
}

/// resource-provisioning steps with a `bucket` config create the bucket
/// through the object-store adapter; presence of the bucket is success
pub async fn provision_bucket(
    runtime: &StepRuntime,
    invocation: &StepInvocation<'_>,
) -> Result<StepSuccess> {
    let client = runtime
        .object_store
        .as_ref()
        .ok_or_else(|| AdapterError::permanent("object store adapter not configured"))?;
    let bucket = require_str(&invocation.config, "bucket")?;

    client.ensure_alias(invocation.cancel.clone()).await?;
    client
        .ensure_bucket(bucket, invocation.cancel.clone())
        .await?;
    if let Some(policy) = optional_str(&invocation.config, "policy") {
        client
            .set_anonymous_policy(bucket, policy, invocation.cancel.clone())
            .await?;
    }

    let mut outputs = BTreeMap::new();
    outputs.insert("bucket".to_string(), bucket.to_string());
    Ok(StepSuccess::with_outputs(outputs))
}

/// Steps export values by printing `key=value` lines; anything else is
/// plain log output
fn parse_output_lines(stdout: &str) -> BTreeMap<String, String> {
    let mut outputs = BTreeMap::new();
    for line in stdout.lines() {
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            if !key.is_empty()
                && key
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            {
                outputs.insert(key.to_string(), value.trim().to_string());
            }
        }
    }
    outputs
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use scoreflow_adapters::{
        CancelToken, FakeProcessRunner, ObjectStoreClient, ObjectStoreConfig,
    };
    use scoreflow_core::{ScoreSpec, StepKind};

    use crate::workspace::WorkspaceManager;

    #[tokio::test]
    async fn bucket_config_routes_through_the_object_store() {
        let runner = FakeProcessRunner::new();
        let workspaces = tempfile::TempDir::new().unwrap();
        let runtime = StepRuntime::new(
            Arc::new(runner.clone()),
            WorkspaceManager::new(workspaces.path()),
        )
        .with_object_store(ObjectStoreClient::new(
            Arc::new(runner.clone()),
            ObjectStoreConfig {
                alias: "scoreflow".into(),
                endpoint: "http://minio.internal:9000".into(),
                access_key: "ak".into(),
                secret_key: "sk".into(),
            },
        ));

        let spec =
            ScoreSpec::parse("apiVersion: score.dev/v1b1\nmetadata:\n  name: demo\n").unwrap();
        let config: serde_json::Map<String, serde_json::Value> =
            serde_json::from_value(serde_json::json!({"bucket": "artifacts"})).unwrap();
        let invocation = StepInvocation {
            app_name: "demo",
            environment: "staging",
            step_name: "bucket",
            kind: StepKind::ResourceProvisioning,
            config,
            spec: &spec,
            deadline: Duration::from_secs(60),
            cancel: CancelToken::never(),
        };

        let success = provision_bucket(&runtime, &invocation).await.unwrap();
        assert_eq!(success.outputs["bucket"], "artifacts");

        let lines = runner.command_lines("mc").await;
        assert!(lines[0].starts_with("mc alias set scoreflow"));
        assert_eq!(lines[1], "mc mb --ignore-existing scoreflow/artifacts");
    }

    #[test]
    fn output_lines_parse_key_value_pairs() {
        let outputs = parse_output_lines("host=db.internal\nplain log line\nport = 5432\n");
        assert_eq!(outputs["host"], "db.internal");
        assert_eq!(outputs["port"], "5432");
        assert_eq!(outputs.len(), 2);
    }

    #[test]
    fn noisy_lines_are_ignored() {
        let outputs = parse_output_lines("a b = c\n== header ==\n");
        assert!(outputs.is_empty());
    }
}
