// Gitea repository adapter: create repo, open PR, poll PR status.
//
// Clone/push plumbing goes through the child-process runner (git CLI); this
// client only speaks the REST API.

use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{check_status, AdapterError, Result};

/// Terminal and non-terminal pull request states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrState {
    Open,
    /// Merged: success for git-check-pr
    Merged,
    /// Closed without merge: failure for git-check-pr
    Closed,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepoInfo {
    pub name: String,
    pub clone_url: String,
    #[serde(default)]
    pub default_branch: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequest {
    pub number: i64,
    #[serde(default)]
    pub html_url: String,
    pub state: String,
    #[serde(default)]
    pub merged: bool,
}

#[derive(Debug, Serialize)]
struct CreateRepoRequest<'a> {
    name: &'a str,
    description: &'a str,
    private: bool,
    auto_init: bool,
}

#[derive(Debug, Serialize)]
struct CreatePrRequest<'a> {
    title: &'a str,
    body: &'a str,
    head: &'a str,
    base: &'a str,
}

/// REST client for a Gitea instance
#[derive(Debug, Clone)]
pub struct GiteaClient {
    http: Client,
    base_url: String,
    auth_header: String,
    username: String,
}

impl GiteaClient {
    pub fn new(base_url: impl Into<String>, username: impl Into<String>, password: &str) -> Result<Self> {
        let username = username.into();
        let credentials =
            base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(AdapterError::from)?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_header: format!("Basic {credentials}"),
            username,
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Clone URL with embedded credentials for the git CLI
    pub fn authenticated_clone_url(&self, owner: &str, repo: &str) -> String {
        // base_url is scheme://host[:port]
        match self.base_url.split_once("://") {
            Some((scheme, rest)) => {
                format!("{scheme}://{}@{rest}/{owner}/{repo}.git", self.username)
            }
            None => format!("{}/{owner}/{repo}.git", self.base_url),
        }
    }

    /// Idempotent upsert: presence of the repository is success
    pub async fn ensure_repo(&self, owner: &str, name: &str, description: &str) -> Result<RepoInfo> {
        let url = format!("{}/api/v1/repos/{owner}/{name}", self.base_url);
        let response = self
            .http
            .get(&url)
            .header("Authorization", &self.auth_header)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            debug!(owner, repo = name, "repository already exists");
            return response.json().await.map_err(AdapterError::from);
        }
        if status.as_u16() != 404 {
            check_status("get repo", response)?;
        }

        info!(owner, repo = name, "creating repository");
        let create_url = format!("{}/api/v1/orgs/{owner}/repos", self.base_url);
        let response = self
            .http
            .post(&create_url)
            .header("Authorization", &self.auth_header)
            .json(&CreateRepoRequest {
                name,
                description,
                private: true,
                auto_init: true,
            })
            .send()
            .await?;
        let response = check_status("create repo", response)?;
        response.json().await.map_err(AdapterError::from)
    }

    /// Open a pull request from `head` into `base`
    pub async fn open_pull_request(
        &self,
        owner: &str,
        repo: &str,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<PullRequest> {
        let url = format!("{}/api/v1/repos/{owner}/{repo}/pulls", self.base_url);
        let response = self
            .http
            .post(&url)
            .header("Authorization", &self.auth_header)
            .json(&CreatePrRequest {
                title,
                body,
                head,
                base,
            })
            .send()
            .await?;
        let response = check_status("open pull request", response)?;
        response.json().await.map_err(AdapterError::from)
    }

    /// Current state of the pull request whose head is `branch`
    pub async fn pull_request_state(&self, owner: &str, repo: &str, branch: &str) -> Result<PrState> {
        let url = format!(
            "{}/api/v1/repos/{owner}/{repo}/pulls?state=all",
            self.base_url
        );
        let response = self
            .http
            .get(&url)
            .header("Authorization", &self.auth_header)
            .send()
            .await?;
        let response = check_status("list pull requests", response)?;
        let pulls: Vec<serde_json::Value> = response.json().await.map_err(AdapterError::from)?;

        let pr = pulls
            .iter()
            .find(|pr| {
                pr.pointer("/head/ref").and_then(|v| v.as_str()) == Some(branch)
            })
            .ok_or_else(|| {
                AdapterError::permanent(format!("no pull request found for branch {branch}"))
            })?;

        let merged = pr.get("merged").and_then(|v| v.as_bool()).unwrap_or(false);
        let state = pr.get("state").and_then(|v| v.as_str()).unwrap_or("open");
        Ok(classify_pr(merged, state))
    }
}

/// Gitea reports closure and merge separately; merged wins over closed
fn classify_pr(merged: bool, state: &str) -> PrState {
    match (merged, state) {
        (true, _) => PrState::Merged,
        (false, "closed") => PrState::Closed,
        _ => PrState::Open,
    }
}
