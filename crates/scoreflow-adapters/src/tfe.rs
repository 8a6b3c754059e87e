// Terraform Enterprise adapter: run status and state outputs for a
// workspace, read-only.

use reqwest::Client;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{check_status, AdapterError, Result};

/// Status of the most recent run in a workspace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Terminal success
    Applied,
    /// Terminal failures
    Errored,
    Canceled,
    Discarded,
    /// Anything still in flight (planning, applying, pending, ...)
    InProgress,
}

impl RunState {
    fn from_api(status: &str) -> RunState {
        match status {
            "applied" => RunState::Applied,
            "errored" => RunState::Errored,
            "canceled" => RunState::Canceled,
            "discarded" => RunState::Discarded,
            _ => RunState::InProgress,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunState::InProgress)
    }
}

/// REST client for Terraform Enterprise / HCP Terraform
#[derive(Debug, Clone)]
pub struct TfeClient {
    http: Client,
    base_url: String,
    organization: String,
    token: String,
}

impl TfeClient {
    pub fn new(
        base_url: impl Into<String>,
        organization: impl Into<String>,
        token: impl Into<String>,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(AdapterError::from)?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            organization: organization.into(),
            token: token.into(),
        })
    }

    async fn get_json(&self, url: String, context: &str) -> Result<serde_json::Value> {
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .header("Content-Type", "application/vnd.api+json")
            .send()
            .await?;
        let response = check_status(context, response)?;
        response.json().await.map_err(AdapterError::from)
    }

    /// Resolve a workspace name to its external id
    pub async fn workspace_id(&self, workspace: &str) -> Result<String> {
        let body = self
            .get_json(
                format!(
                    "{}/api/v2/organizations/{}/workspaces/{workspace}",
                    self.base_url, self.organization
                ),
                "get workspace",
            )
            .await?;
        body.pointer("/data/id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| AdapterError::permanent(format!("workspace {workspace} has no id")))
    }

    /// Status of the latest run in the workspace
    pub async fn latest_run_state(&self, workspace_id: &str) -> Result<RunState> {
        let body = self
            .get_json(
                format!(
                    "{}/api/v2/workspaces/{workspace_id}/runs?page%5Bsize%5D=1",
                    self.base_url
                ),
                "list runs",
            )
            .await?;
        let status = body
            .pointer("/data/0/attributes/status")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                AdapterError::permanent(format!("workspace {workspace_id} has no runs"))
            })?;
        Ok(RunState::from_api(status))
    }

    /// Non-sensitive outputs of the current state version
    pub async fn workspace_outputs(&self, workspace_id: &str) -> Result<BTreeMap<String, String>> {
        let body = self
            .get_json(
                format!(
                    "{}/api/v2/workspaces/{workspace_id}/current-state-version?include=outputs",
                    self.base_url
                ),
                "current state version",
            )
            .await?;

        let mut outputs = BTreeMap::new();
        if let Some(included) = body.get("included").and_then(|v| v.as_array()) {
            for entry in included {
                let attrs = entry.get("attributes");
                let name = attrs
                    .and_then(|a| a.get("name"))
                    .and_then(|v| v.as_str());
                let sensitive = attrs
                    .and_then(|a| a.get("sensitive"))
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                let value = attrs.and_then(|a| a.get("value"));
                if let (Some(name), Some(value)) = (name, value) {
                    if sensitive {
                        continue;
                    }
                    let rendered = match value {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    outputs.insert(name.to_string(), rendered);
                }
            }
        }
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_states_classify_terminality() {
        assert!(RunState::from_api("applied").is_terminal());
        assert!(RunState::from_api("errored").is_terminal());
        assert!(RunState::from_api("canceled").is_terminal());
        assert!(RunState::from_api("discarded").is_terminal());
        assert!(!RunState::from_api("planning").is_terminal());
        assert!(!RunState::from_api("pending").is_terminal());
    }
}
