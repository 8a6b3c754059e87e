// Workflow, step and tier types shared by the spec model, provider bundles
// and the resolver.
//
// A Workflow is an ordered pipeline of Steps grouped into a Phase. Workflows
// come from three tiers (platform, product, application); the resolver is
// what combines them, this module only defines the shapes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Coarse ordering bucket applied across tiers
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    PreDeployment,
    #[default]
    Deployment,
    PostDeployment,
}

impl Phase {
    /// All phases in execution order
    pub const ALL: [Phase; 3] = [Phase::PreDeployment, Phase::Deployment, Phase::PostDeployment];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::PreDeployment => "pre-deployment",
            Phase::Deployment => "deployment",
            Phase::PostDeployment => "post-deployment",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Condition under which a provider workflow is included in a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Runs on every deployment of the owning product
    ProductDeployment,
    /// Runs only when the app has no prior execution on record
    FirstDeployment,
    /// Never included in automatic resolution
    Manual,
    /// Runs on every deployment regardless of product
    AllDeployments,
}

/// Which team owns a workflow and under which policy it is admitted
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum SourceTier {
    Platform,
    Product,
    #[default]
    Application,
}

impl SourceTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceTier::Platform => "platform",
            SourceTier::Product => "product",
            SourceTier::Application => "application",
        }
    }
}

impl std::fmt::Display for SourceTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The closed set of step kinds the executor can dispatch
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum StepKind {
    Terraform,
    TerraformGenerate,
    Ansible,
    Kubernetes,
    GitPr,
    GitCheckPr,
    TfeStatus,
    GiteaRepo,
    ArgocdApp,
    GitCommitManifests,
    VaultSetup,
    DatabaseMigration,
    Validation,
    Security,
    Policy,
    Tagging,
    CostAnalysis,
    ResourceProvisioning,
    Shell,
    /// Nested invocation of a `<provider>/<workflow>` coordinate
    Workflow,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Terraform => "terraform",
            StepKind::TerraformGenerate => "terraform-generate",
            StepKind::Ansible => "ansible",
            StepKind::Kubernetes => "kubernetes",
            StepKind::GitPr => "git-pr",
            StepKind::GitCheckPr => "git-check-pr",
            StepKind::TfeStatus => "tfe-status",
            StepKind::GiteaRepo => "gitea-repo",
            StepKind::ArgocdApp => "argocd-app",
            StepKind::GitCommitManifests => "git-commit-manifests",
            StepKind::VaultSetup => "vault-setup",
            StepKind::DatabaseMigration => "database-migration",
            StepKind::Validation => "validation",
            StepKind::Security => "security",
            StepKind::Policy => "policy",
            StepKind::Tagging => "tagging",
            StepKind::CostAnalysis => "cost-analysis",
            StepKind::ResourceProvisioning => "resource-provisioning",
            StepKind::Shell => "shell",
            StepKind::Workflow => "workflow",
        }
    }

    /// Every kind, in declaration order
    pub fn all() -> &'static [StepKind] {
        &[
            StepKind::Terraform,
            StepKind::TerraformGenerate,
            StepKind::Ansible,
            StepKind::Kubernetes,
            StepKind::GitPr,
            StepKind::GitCheckPr,
            StepKind::TfeStatus,
            StepKind::GiteaRepo,
            StepKind::ArgocdApp,
            StepKind::GitCommitManifests,
            StepKind::VaultSetup,
            StepKind::DatabaseMigration,
            StepKind::Validation,
            StepKind::Security,
            StepKind::Policy,
            StepKind::Tagging,
            StepKind::CostAnalysis,
            StepKind::ResourceProvisioning,
            StepKind::Shell,
            StepKind::Workflow,
        ]
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StepKind::all()
            .iter()
            .find(|k| k.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown step kind: {s}"))
    }
}

/// Atomic action with kind-specific config
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub name: String,
    pub kind: StepKind,

    /// Kind-specific configuration; string leaves are interpolated before
    /// dispatch
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,

    /// Optional predicate; the step is skipped when it evaluates false
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,

    /// Step names that must be terminal before this one starts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    /// Per-step deadline in seconds; defaults to an even share of the
    /// workflow budget
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    /// Record the failure but keep walking subsequent steps
    #[serde(default)]
    pub continue_on_failure: bool,
}

impl Step {
    /// Fetch a string config entry (uninterpolated)
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }

    /// Fetch a boolean config entry
    pub fn config_bool(&self, key: &str) -> Option<bool> {
        self.config.get(key).and_then(|v| v.as_bool())
    }
}

/// Ordered pipeline of steps, annotated with its source tier by the resolver
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    /// Workflow name; filled from the map key when declared inline in a spec
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub owner: String,

    #[serde(default)]
    pub phase: Phase,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggers: Vec<Trigger>,

    pub steps: Vec<Step>,

    #[serde(default)]
    pub source_tier: SourceTier,
}

impl Workflow {
    /// Whether this workflow fires for the given trigger set
    pub fn triggered_by(&self, trigger: Trigger) -> bool {
        self.triggers.contains(&trigger)
    }

    /// Look up a step by name
    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }
}

/// Metadata attached to a task submission (submitter, source, correlation,
/// environment bindings consumed through the `workflow.*` namespace)
pub type SubmissionMetadata = BTreeMap<String, String>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_kind_round_trips_through_strings() {
        for kind in StepKind::all() {
            let parsed: StepKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, *kind);
        }
    }

    #[test]
    fn step_kind_serde_uses_kebab_case() {
        let yaml = "kind: terraform-generate\nname: gen\n";
        let step: Step = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(step.kind, StepKind::TerraformGenerate);

        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["kind"], "terraform-generate");
    }

    #[test]
    fn unknown_step_kind_fails_deserialization() {
        let yaml = "kind: helm\nname: bad\n";
        assert!(serde_yaml::from_str::<Step>(yaml).is_err());
    }

    #[test]
    fn phases_order_pre_deploy_post() {
        assert!(Phase::PreDeployment < Phase::Deployment);
        assert!(Phase::Deployment < Phase::PostDeployment);
    }

    #[test]
    fn workflow_snapshot_round_trips_as_json() {
        let wf = Workflow {
            name: "deploy".into(),
            description: "deploy the app".into(),
            owner: "team-a".into(),
            phase: Phase::Deployment,
            triggers: vec![Trigger::ProductDeployment],
            steps: vec![Step {
                name: "apply".into(),
                kind: StepKind::Kubernetes,
                config: serde_json::Map::new(),
                when: None,
                depends_on: vec![],
                timeout: Some(120),
                continue_on_failure: false,
            }],
            source_tier: SourceTier::Product,
        };

        let json = serde_json::to_string(&wf).unwrap();
        let back: Workflow = serde_json::from_str(&json).unwrap();
        assert_eq!(back, wf);
    }
}
