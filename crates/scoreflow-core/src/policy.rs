// Admin policy: platform-team governance over what runs and where
// workflows come from.
//
// Unknown top-level fields are ignored for forward compatibility; only
// structurally malformed documents are rejected.

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};
use crate::workflow::StepKind;

/// Platform-team governance document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminPolicy {
    /// Root directory for locally bundled workflows
    #[serde(default = "default_workflows_root")]
    pub workflows_root: PathBuf,

    /// Platform workflows that must exist and run on every submission
    #[serde(default)]
    pub required_platform_workflows: Vec<String>,

    /// `product/name` coordinates application teams may receive
    #[serde(default)]
    pub allowed_product_workflows: BTreeSet<String>,

    /// Step kinds admitted anywhere; defaults to the full enum
    #[serde(default = "default_allowed_step_kinds")]
    pub allowed_step_kinds: BTreeSet<StepKind>,

    /// Workflow execution budget in seconds
    #[serde(default = "default_max_workflow_duration")]
    pub max_workflow_duration_seconds: u64,

    /// Upper bound on concurrently running executions (worker pool size)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_workflows: usize,

    #[serde(default = "default_max_steps")]
    pub max_steps_per_workflow: usize,

    #[serde(default)]
    pub workflow_overrides: WorkflowOverrides,

    /// Admin credentials for the Git and ArgoCD adapters
    #[serde(default)]
    pub admin: AdminConnections,

    /// Where provider bundles are obtained from, in load order
    #[serde(default)]
    pub providers: Vec<ProviderSource>,
}

/// Adapter endpoints and admin credentials carried by the policy; anything
/// absent falls back to environment configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminConnections {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gitea_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gitea_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gitea_password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub argocd_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub argocd_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub argocd_password: Option<String>,
}

/// Same-name collision handling across tiers
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowOverrides {
    /// Platform's entry supersedes product's
    #[serde(default)]
    pub platform: bool,
    /// Product's entry supersedes application's
    #[serde(default)]
    pub product: bool,
}

fn default_workflows_root() -> PathBuf {
    PathBuf::from("workflows")
}

fn default_allowed_step_kinds() -> BTreeSet<StepKind> {
    StepKind::all().iter().copied().collect()
}

fn default_max_workflow_duration() -> u64 {
    30 * 60
}

fn default_max_concurrent() -> usize {
    5
}

fn default_max_steps() -> usize {
    20
}

impl Default for AdminPolicy {
    fn default() -> Self {
        Self {
            workflows_root: default_workflows_root(),
            required_platform_workflows: Vec::new(),
            allowed_product_workflows: BTreeSet::new(),
            allowed_step_kinds: default_allowed_step_kinds(),
            max_workflow_duration_seconds: default_max_workflow_duration(),
            max_concurrent_workflows: default_max_concurrent(),
            max_steps_per_workflow: default_max_steps(),
            workflow_overrides: WorkflowOverrides::default(),
            admin: AdminConnections::default(),
            providers: Vec::new(),
        }
    }
}

impl AdminPolicy {
    /// Parse a textual admin policy
    pub fn parse(text: &str) -> Result<AdminPolicy> {
        serde_yaml::from_str(text).map_err(|e| OrchestratorError::invalid_policy(e.to_string()))
    }

    /// Whether `product/workflow` is admitted for application teams
    pub fn allows_product_workflow(&self, product: &str, workflow: &str) -> bool {
        self.allowed_product_workflows
            .contains(&format!("{product}/{workflow}"))
    }
}

/// Provider bundle classification, used to pick the platform tier and to
/// scope product providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderCategory {
    Infrastructure,
    #[default]
    Service,
    Platform,
    Data,
    Storage,
    Security,
}

/// Where a provider bundle is obtained from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[default]
    Local,
    Git,
}

/// One provider bundle source entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSource {
    pub name: String,

    #[serde(default)]
    pub category: ProviderCategory,

    #[serde(default)]
    pub source: SourceKind,

    /// Filesystem path for `local`, clone URL for `git`
    pub location: String,

    /// Git ref; required when `source` is `git`
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}
