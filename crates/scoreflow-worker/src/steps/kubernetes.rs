// kubernetes step kind: materialize manifests, ensure the namespace,
// apply, then best-effort pod status.

use std::fs;
use std::time::Duration;

use tracing::{debug, warn};

use scoreflow_adapters::{AdapterError, ProcessRequest, Result};
use scoreflow_core::ScoreSpec;

use super::{exec_checked, optional_str, StepInvocation, StepSuccess};
use crate::runtime::StepRuntime;

/// Render a Deployment manifest from the spec's containers
pub fn render_deployment(spec: &ScoreSpec, namespace: &str) -> String {
    let app = spec.name();
    let containers: Vec<serde_json::Value> = spec
        .containers
        .iter()
        .map(|(name, container)| {
            let env: Vec<serde_json::Value> = container
                .variables
                .iter()
                .map(|(k, v)| serde_json::json!({"name": k, "value": v}))
                .collect();
            let ports: Vec<serde_json::Value> = container
                .ports
                .iter()
                .map(|p| {
                    serde_json::json!({"containerPort": p.target_port.unwrap_or(p.port)})
                })
                .collect();
            serde_json::json!({
                "name": name,
                "image": container.image,
                "env": env,
                "ports": ports,
            })
        })
        .collect();

    let manifest = serde_json::json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": app,
            "namespace": namespace,
            "labels": {"app": app},
        },
        "spec": {
            "replicas": 1,
            "selector": {"matchLabels": {"app": app}},
            "template": {
                "metadata": {"labels": {"app": app}},
                "spec": {"containers": containers},
            },
        },
    });
    serde_yaml::to_string(&manifest).expect("deployment manifest serializes")
}

/// Render a Service manifest exposing the declared container ports
pub fn render_service(spec: &ScoreSpec, namespace: &str) -> String {
    let app = spec.name();
    let ports: Vec<serde_json::Value> = spec
        .containers
        .values()
        .flat_map(|c| c.ports.iter())
        .map(|p| {
            serde_json::json!({
                "port": p.port,
                "targetPort": p.target_port.unwrap_or(p.port),
            })
        })
        .collect();

    let manifest = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": app,
            "namespace": namespace,
            "labels": {"app": app},
        },
        "spec": {
            "selector": {"app": app},
            "ports": ports,
        },
    });
    serde_yaml::to_string(&manifest).expect("service manifest serializes")
}

/// Write the manifests for this step into its workspace; a supplied
/// `manifest` config block wins over rendering from the spec
pub fn materialize_manifests(
    invocation: &StepInvocation<'_>,
    workspace: &std::path::Path,
    namespace: &str,
) -> Result<Vec<String>> {
    let mut written = Vec::new();
    if let Some(manifest) = optional_str(&invocation.config, "manifest") {
        let path = workspace.join("manifest.yaml");
        fs::write(&path, manifest)
            .map_err(|e| AdapterError::permanent(format!("write manifest: {e}")))?;
        written.push("manifest.yaml".to_string());
    } else {
        fs::write(
            workspace.join("deployment.yaml"),
            render_deployment(invocation.spec, namespace),
        )
        .map_err(|e| AdapterError::permanent(format!("write deployment: {e}")))?;
        fs::write(
            workspace.join("service.yaml"),
            render_service(invocation.spec, namespace),
        )
        .map_err(|e| AdapterError::permanent(format!("write service: {e}")))?;
        written.push("deployment.yaml".to_string());
        written.push("service.yaml".to_string());
    }
    Ok(written)
}

pub async fn apply(runtime: &StepRuntime, invocation: &StepInvocation<'_>) -> Result<StepSuccess> {
    let namespace = optional_str(&invocation.config, "namespace")
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}-{}", invocation.app_name, invocation.environment));

    let workspace = runtime
        .workspaces
        .step_dir(invocation.app_name, invocation.environment, invocation.step_name)
        .map_err(|e| AdapterError::permanent(e.to_string()))?;

    materialize_manifests(invocation, &workspace, &namespace)?;

    let mut success = StepSuccess::default();

    // Idempotent namespace upsert: dry-run render piped through apply would
    // need a shell; get-then-create keeps it to plain invocations.
    let exists = runtime
        .runner
        .run(
            ProcessRequest::new("kubectl", &["get", "namespace", &namespace])
                .timeout(Duration::from_secs(30)),
            invocation.cancel.clone(),
        )
        .await?;
    if !exists.success() {
        let created = runtime
            .runner
            .run(
                ProcessRequest::new("kubectl", &["create", "namespace", &namespace])
                    .timeout(Duration::from_secs(30)),
                invocation.cancel.clone(),
            )
            .await?;
        if !created.success() && !created.stderr.contains("AlreadyExists") {
            return Err(AdapterError::permanent(format!(
                "create namespace {namespace} failed: {}",
                created.stderr.trim()
            )));
        }
    }

    // The apply itself is fatal on failure.
    let applied = exec_checked(
        runtime.runner.as_ref(),
        ProcessRequest::new(
            "kubectl",
            &["apply", "-f", ".", "-n", &namespace],
        )
        .cwd(&workspace)
        .timeout(invocation.deadline),
        invocation.cancel.clone(),
        "kubectl apply",
    )
    .await?;
    success.absorb(&applied);

    // Pod status is informational; failures here are not.
    match runtime
        .runner
        .run(
            ProcessRequest::new(
                "kubectl",
                &[
                    "get",
                    "pods",
                    "-n",
                    &namespace,
                    "-l",
                    &format!("app={}", invocation.app_name),
                ],
            )
            .timeout(Duration::from_secs(30)),
            invocation.cancel.clone(),
        )
        .await
    {
        Ok(pods) if pods.success() => {
            debug!(namespace = %namespace, "pod status captured");
            success.absorb(&pods);
        }
        Ok(pods) => warn!(namespace = %namespace, exit = pods.exit_code, "pod status query failed"),
        Err(AdapterError::Cancelled) => return Err(AdapterError::Cancelled),
        Err(err) => warn!(namespace = %namespace, error = %err, "pod status query failed"),
    }

    success.outputs.insert("namespace".to_string(), namespace);
    Ok(success)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ScoreSpec {
        ScoreSpec::parse(
            r#"
apiVersion: score.dev/v1b1
metadata:
  name: demo
containers:
  web:
    image: registry.internal/demo:1.0
    variables:
      LOG_LEVEL: info
    ports:
      - port: 80
        targetPort: 8080
"#,
        )
        .unwrap()
    }

    #[test]
    fn deployment_carries_image_env_and_ports() {
        let rendered = render_deployment(&spec(), "demo-staging");
        let manifest: serde_json::Value = serde_yaml::from_str(&rendered).unwrap();
        assert_eq!(manifest["kind"], "Deployment");
        assert_eq!(manifest["metadata"]["namespace"], "demo-staging");
        let container = &manifest["spec"]["template"]["spec"]["containers"][0];
        assert_eq!(container["image"], "registry.internal/demo:1.0");
        assert_eq!(container["env"][0]["name"], "LOG_LEVEL");
        assert_eq!(container["ports"][0]["containerPort"], 8080);
    }

    #[test]
    fn service_maps_port_to_target_port() {
        let rendered = render_service(&spec(), "demo-staging");
        let manifest: serde_json::Value = serde_yaml::from_str(&rendered).unwrap();
        assert_eq!(manifest["kind"], "Service");
        assert_eq!(manifest["spec"]["ports"][0]["port"], 80);
        assert_eq!(manifest["spec"]["ports"][0]["targetPort"], 8080);
    }
}
