// argocd-app step kind: authenticate, create the Application if absent,
// optionally wait for Synced + Healthy.

use std::time::{Duration, Instant};

use tracing::{debug, info};

use scoreflow_adapters::{AdapterError, ArgoApplication, Result};

use super::{optional_str, poll_pause, require_str, StepInvocation, StepSuccess};
use crate::runtime::StepRuntime;

const SYNC_POLL_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(300);

pub async fn sync_application(
    runtime: &StepRuntime,
    invocation: &StepInvocation<'_>,
) -> Result<StepSuccess> {
    let argocd = runtime
        .argocd
        .as_ref()
        .ok_or_else(|| AdapterError::permanent("argocd adapter not configured"))?;

    let name = optional_str(&invocation.config, "appName").unwrap_or(invocation.app_name);
    let app = ArgoApplication {
        name: name.to_string(),
        project: optional_str(&invocation.config, "project")
            .unwrap_or("default")
            .to_string(),
        repo_url: require_str(&invocation.config, "repoUrl")?.to_string(),
        path: optional_str(&invocation.config, "path").unwrap_or(".").to_string(),
        target_revision: optional_str(&invocation.config, "targetRevision")
            .unwrap_or("main")
            .to_string(),
        dest_namespace: optional_str(&invocation.config, "namespace")
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}-{}", invocation.app_name, invocation.environment)),
    };

    let token = argocd.authenticate().await?;
    argocd.ensure_application(&token, &app).await?;
    info!(app = %app.name, "argocd application ensured");

    let mut success = StepSuccess::default();
    success.outputs.insert("app".to_string(), app.name.clone());

    let wait = invocation
        .config
        .get("wait")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);
    if !wait {
        return Ok(success);
    }

    let budget = invocation
        .config
        .get("timeout")
        .and_then(|v| v.as_u64())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_SYNC_TIMEOUT)
        .min(invocation.deadline);
    let started = Instant::now();
    let mut cancel = invocation.cancel.clone();

    loop {
        let status = argocd.application_status(&token, &app.name).await?;
        debug!(app = %app.name, sync = %status.sync, health = %status.health, "argocd status");

        if status.is_synced_and_healthy() {
            success.outputs.insert("sync".to_string(), status.sync);
            success.outputs.insert("health".to_string(), status.health);
            return Ok(success);
        }
        if status.is_degraded() {
            return Err(AdapterError::permanent(format!(
                "application {} is OutOfSync and Degraded",
                app.name
            )));
        }

        if started.elapsed() + SYNC_POLL_INTERVAL > budget {
            return Err(AdapterError::Timeout);
        }
        poll_pause(SYNC_POLL_INTERVAL, &mut cancel).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use scoreflow_adapters::{ArgoCdClient, CancelToken, FakeProcessRunner};
    use scoreflow_core::{ScoreSpec, StepKind};

    use crate::workspace::WorkspaceManager;

    struct Rig {
        runtime: StepRuntime,
        _workspaces: tempfile::TempDir,
    }

    fn rig(server: &MockServer) -> Rig {
        let workspaces = tempfile::TempDir::new().unwrap();
        let runtime = StepRuntime::new(
            Arc::new(FakeProcessRunner::new()),
            WorkspaceManager::new(workspaces.path()),
        )
        .with_argocd(ArgoCdClient::new(server.uri(), "admin", "pw").unwrap());
        Rig {
            runtime,
            _workspaces: workspaces,
        }
    }

    fn spec() -> ScoreSpec {
        ScoreSpec::parse("apiVersion: score.dev/v1b1\nmetadata:\n  name: demo\n").unwrap()
    }

    fn invocation(
        spec: &ScoreSpec,
        config: serde_json::Value,
    ) -> StepInvocation<'_> {
        StepInvocation {
            app_name: "demo",
            environment: "staging",
            step_name: "argocd",
            kind: StepKind::ArgocdApp,
            config: serde_json::from_value(config).unwrap(),
            spec,
            deadline: Duration::from_secs(60),
            cancel: CancelToken::never(),
        }
    }

    async fn mount_session(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/api/v1/session"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "token": "t0k3n",
            })))
            .mount(server)
            .await;
    }

    async fn mount_app_status(server: &MockServer, sync: &str, health: &str) {
        // Serves both the exists-check and the status polls.
        Mock::given(method("GET"))
            .and(path("/api/v1/applications/demo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": {
                    "sync": {"status": sync},
                    "health": {"status": health},
                },
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn waits_until_synced_and_healthy() {
        let server = MockServer::start().await;
        mount_session(&server).await;
        mount_app_status(&server, "Synced", "Healthy").await;

        let rig = rig(&server);
        let spec = spec();
        let inv = invocation(
            &spec,
            serde_json::json!({"repoUrl": "https://git.internal/platform/gitops.git"}),
        );

        let success = sync_application(&rig.runtime, &inv).await.unwrap();
        assert_eq!(success.outputs["app"], "demo");
        assert_eq!(success.outputs["sync"], "Synced");
        assert_eq!(success.outputs["health"], "Healthy");
    }

    #[tokio::test]
    async fn out_of_sync_and_degraded_is_an_explicit_failure() {
        let server = MockServer::start().await;
        mount_session(&server).await;
        mount_app_status(&server, "OutOfSync", "Degraded").await;

        let rig = rig(&server);
        let spec = spec();
        let inv = invocation(
            &spec,
            serde_json::json!({"repoUrl": "https://git.internal/platform/gitops.git"}),
        );

        let err = sync_application(&rig.runtime, &inv).await.unwrap_err();
        assert!(matches!(err, AdapterError::Permanent(_)), "{err}");
    }

    #[tokio::test]
    async fn creates_the_application_and_skips_the_wait_when_asked() {
        let server = MockServer::start().await;
        mount_session(&server).await;
        Mock::given(method("GET"))
            .and(path("/api/v1/applications/demo"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/applications"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let rig = rig(&server);
        let spec = spec();
        let inv = invocation(
            &spec,
            serde_json::json!({
                "repoUrl": "https://git.internal/platform/gitops.git",
                "wait": false,
            }),
        );

        let success = sync_application(&rig.runtime, &inv).await.unwrap();
        assert_eq!(success.outputs["app"], "demo");
        assert!(!success.outputs.contains_key("sync"), "no wait, no status read");
    }
}
