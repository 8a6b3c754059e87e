// ArgoCD adapter: session authentication, create-if-absent application,
// application status reads.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

use crate::error::{check_status, AdapterError, Result};

/// Sync + health pair read from the application status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppStatus {
    pub sync: String,
    pub health: String,
}

impl AppStatus {
    pub fn is_synced_and_healthy(&self) -> bool {
        self.sync == "Synced" && self.health == "Healthy"
    }

    /// Explicit failure condition for the argocd-app step
    pub fn is_degraded(&self) -> bool {
        self.sync == "OutOfSync" && self.health == "Degraded"
    }
}

/// Desired ArgoCD application
#[derive(Debug, Clone, Serialize)]
pub struct ArgoApplication {
    pub name: String,
    pub project: String,
    pub repo_url: String,
    pub path: String,
    pub target_revision: String,
    pub dest_namespace: String,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    token: String,
}

/// REST client for an ArgoCD server
#[derive(Debug, Clone)]
pub struct ArgoCdClient {
    http: Client,
    base_url: String,
    username: String,
    password: String,
}

impl ArgoCdClient {
    pub fn new(
        base_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            // ArgoCD commonly runs with a self-signed certificate in-cluster
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(AdapterError::from)?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            username: username.into(),
            password: password.into(),
        })
    }

    /// Obtain a session token
    pub async fn authenticate(&self) -> Result<String> {
        let url = format!("{}/api/v1/session", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({
                "username": self.username,
                "password": self.password,
            }))
            .send()
            .await?;
        let response = check_status("argocd session", response)?;
        let session: SessionResponse = response.json().await.map_err(AdapterError::from)?;
        Ok(session.token)
    }

    /// Create the application if absent; an existing application is success
    pub async fn ensure_application(&self, token: &str, app: &ArgoApplication) -> Result<()> {
        let url = format!("{}/api/v1/applications/{}", self.base_url, app.name);
        let response = self
            .http
            .get(&url)
            .bearer_auth(token)
            .send()
            .await?;
        if response.status().is_success() {
            return Ok(());
        }
        if response.status().as_u16() != 404 {
            check_status("get application", response)?;
        }

        info!(app = %app.name, "creating ArgoCD application");
        let body = serde_json::json!({
            "metadata": { "name": app.name },
            "spec": {
                "project": app.project,
                "source": {
                    "repoURL": app.repo_url,
                    "path": app.path,
                    "targetRevision": app.target_revision,
                },
                "destination": {
                    "server": "https://kubernetes.default.svc",
                    "namespace": app.dest_namespace,
                },
                "syncPolicy": { "automated": { "prune": true, "selfHeal": true } },
            },
        });
        let response = self
            .http
            .post(format!("{}/api/v1/applications", self.base_url))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        check_status("create application", response)?;
        Ok(())
    }

    /// Read the application's sync and health status
    pub async fn application_status(&self, token: &str, name: &str) -> Result<AppStatus> {
        let url = format!("{}/api/v1/applications/{name}", self.base_url);
        let response = self.http.get(&url).bearer_auth(token).send().await?;
        let response = check_status("application status", response)?;
        let body: serde_json::Value = response.json().await.map_err(AdapterError::from)?;

        Ok(AppStatus {
            sync: body
                .pointer("/status/sync/status")
                .and_then(|v| v.as_str())
                .unwrap_or("Unknown")
                .to_string(),
            health: body
                .pointer("/status/health/status")
                .and_then(|v| v.as_str())
                .unwrap_or("Unknown")
                .to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_predicates() {
        let healthy = AppStatus {
            sync: "Synced".into(),
            health: "Healthy".into(),
        };
        assert!(healthy.is_synced_and_healthy());
        assert!(!healthy.is_degraded());

        let degraded = AppStatus {
            sync: "OutOfSync".into(),
            health: "Degraded".into(),
        };
        assert!(degraded.is_degraded());
        assert!(!degraded.is_synced_and_healthy());

        let progressing = AppStatus {
            sync: "OutOfSync".into(),
            health: "Progressing".into(),
        };
        assert!(!progressing.is_degraded());
    }
}
