// terraform, terraform-generate and tfe-status step kinds.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use scoreflow_adapters::{AdapterError, ProcessRequest, Result};

use crate::workspace::copy_files_with_extension;

use super::{exec_checked, poll_pause, require_str, StepInvocation, StepSuccess};
use crate::runtime::StepRuntime;

const TFE_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// terraform: copy *.tf from config.path into the workspace, init, apply,
/// then collect `output -json` (absence of outputs is non-fatal)
pub async fn apply(runtime: &StepRuntime, invocation: &StepInvocation<'_>) -> Result<StepSuccess> {
    let path = require_str(&invocation.config, "path")?;
    let workspace = runtime
        .workspaces
        .step_dir(invocation.app_name, invocation.environment, path)
        .map_err(|e| AdapterError::permanent(e.to_string()))?;

    let copied = copy_files_with_extension(Path::new(path), &workspace, "tf")
        .map_err(|e| AdapterError::permanent(format!("copy terraform sources: {e:#}")))?;
    debug!(path, copied, "prepared terraform workspace");

    let mut success = StepSuccess::default();

    let init = exec_checked(
        runtime.runner.as_ref(),
        ProcessRequest::new("terraform", &["init", "-input=false", "-no-color"])
            .cwd(&workspace)
            .timeout(invocation.deadline),
        invocation.cancel.clone(),
        "terraform init",
    )
    .await?;
    success.absorb(&init);

    let applied = exec_checked(
        runtime.runner.as_ref(),
        ProcessRequest::new(
            "terraform",
            &["apply", "-auto-approve", "-input=false", "-no-color"],
        )
        .cwd(&workspace)
        .timeout(invocation.deadline),
        invocation.cancel.clone(),
        "terraform apply",
    )
    .await?;
    success.absorb(&applied);

    // Outputs are optional; a module with none is still a success.
    match runtime
        .runner
        .run(
            ProcessRequest::new("terraform", &["output", "-json"])
                .cwd(&workspace)
                .timeout(Duration::from_secs(60)),
            invocation.cancel.clone(),
        )
        .await
    {
        Ok(output) if output.success() => {
            success.outputs = parse_terraform_outputs(&output.stdout);
        }
        Ok(output) => {
            warn!(exit = output.exit_code, "terraform output failed, continuing without outputs");
        }
        Err(AdapterError::Cancelled) => return Err(AdapterError::Cancelled),
        Err(err) => {
            warn!(error = %err, "terraform output failed, continuing without outputs");
        }
    }

    Ok(success)
}

/// `terraform output -json` renders `{name: {value: ...}, ...}`
fn parse_terraform_outputs(stdout: &str) -> BTreeMap<String, String> {
    let mut outputs = BTreeMap::new();
    let Ok(serde_json::Value::Object(map)) = serde_json::from_str(stdout) else {
        return outputs;
    };
    for (name, entry) in map {
        if let Some(value) = entry.get("value") {
            let rendered = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            outputs.insert(name, rendered);
        }
    }
    outputs
}

/// terraform-generate: render a single main.tf from the resource config and
/// write it to config.outputDir; the file being present is success
pub async fn generate(
    _runtime: &StepRuntime,
    invocation: &StepInvocation<'_>,
) -> Result<StepSuccess> {
    let output_dir = require_str(&invocation.config, "outputDir")?;
    let resource = invocation
        .config
        .get("resource")
        .and_then(|v| v.as_object())
        .ok_or_else(|| AdapterError::permanent("config key resource must be a mapping"))?;

    let resource_type = resource
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or("null_resource");
    let resource_name = resource
        .get("name")
        .and_then(|v| v.as_str())
        .unwrap_or(invocation.app_name);

    let mut body = String::new();
    body.push_str(&format!("resource \"{resource_type}\" \"{resource_name}\" {{\n"));
    if let Some(params) = resource.get("params").and_then(|v| v.as_object()) {
        for (key, value) in params {
            match value {
                serde_json::Value::String(s) => {
                    body.push_str(&format!("  {key} = \"{s}\"\n"));
                }
                other => {
                    body.push_str(&format!("  {key} = {other}\n"));
                }
            }
        }
    }
    body.push_str("}\n");

    fs::create_dir_all(output_dir)
        .map_err(|e| AdapterError::permanent(format!("create {output_dir}: {e}")))?;
    let target = Path::new(output_dir).join("main.tf");
    fs::write(&target, body)
        .map_err(|e| AdapterError::permanent(format!("write {}: {e}", target.display())))?;

    info!(path = %target.display(), "generated terraform configuration");
    let mut outputs = BTreeMap::new();
    outputs.insert("path".to_string(), target.display().to_string());
    Ok(StepSuccess::with_outputs(outputs))
}

/// tfe-status: poll Terraform Enterprise until the workspace's latest run is
/// terminal; applied fetches outputs, errored/canceled/discarded fails
pub async fn tfe_status(
    runtime: &StepRuntime,
    invocation: &StepInvocation<'_>,
) -> Result<StepSuccess> {
    let tfe = runtime
        .tfe
        .as_ref()
        .ok_or_else(|| AdapterError::permanent("terraform enterprise adapter not configured"))?;
    let workspace = require_str(&invocation.config, "workspace")?;

    let workspace_id = tfe.workspace_id(workspace).await?;
    let started = Instant::now();
    let mut cancel = invocation.cancel.clone();

    loop {
        let state = tfe.latest_run_state(&workspace_id).await?;
        debug!(workspace, ?state, "terraform enterprise run state");

        use scoreflow_adapters::RunState::*;
        match state {
            Applied => {
                let outputs = tfe.workspace_outputs(&workspace_id).await?;
                return Ok(StepSuccess::with_outputs(outputs));
            }
            Errored | Canceled | Discarded => {
                return Err(AdapterError::permanent(format!(
                    "terraform enterprise run for {workspace} ended {state:?}"
                )));
            }
            InProgress => {}
        }

        if started.elapsed() + TFE_POLL_INTERVAL > invocation.deadline {
            return Err(AdapterError::Timeout);
        }
        poll_pause(TFE_POLL_INTERVAL, &mut cancel).await?;
    }
}
