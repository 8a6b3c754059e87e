// Materialized provider bundle: a manifest plus the workflows it registers
// as provisioners (keyed by resource type) or golden paths (keyed by name).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::policy::ProviderCategory;
use crate::workflow::Workflow;

/// `provider.yaml` contents
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderManifest {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default)]
    pub owner: String,

    /// Sibling directory holding the workflow documents
    #[serde(default = "default_workflows_dir")]
    pub workflows_dir: String,

    /// Resource types this provider can provision
    #[serde(default)]
    pub supported_resources: Vec<String>,

    /// Free-form tags; a non-platform provider serves product `P` when its
    /// tags contain `P`
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_version() -> String {
    "0.0.0".to_string()
}

fn default_workflows_dir() -> String {
    "workflows".to_string()
}

/// A loaded provider bundle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub name: String,
    pub version: String,
    pub owner: String,
    pub description: String,
    pub category: ProviderCategory,
    pub tags: Vec<String>,

    /// Resolved commit SHA when the bundle came from a Git ref
    pub commit: Option<String>,

    /// Workflows registered under a resource type
    pub provisioners: BTreeMap<String, Workflow>,

    /// Reusable multi-step workflows exposed by name
    pub golden_paths: BTreeMap<String, Workflow>,
}

impl Provider {
    /// The provisioner registered for a resource type, if any
    pub fn provisioner_for(&self, resource_type: &str) -> Option<&Workflow> {
        self.provisioners.get(resource_type)
    }

    /// A golden path by workflow name
    pub fn golden_path(&self, name: &str) -> Option<&Workflow> {
        self.golden_paths.get(name)
    }

    pub fn is_platform(&self) -> bool {
        self.category == ProviderCategory::Platform
    }

    /// Whether this provider contributes product-tier workflows for `product`
    pub fn serves_product(&self, product: &str) -> bool {
        !self.is_platform() && self.tags.iter().any(|t| t == product)
    }

    /// All teardown workflows (`delete-*`), used to synthesize the
    /// application teardown plan
    pub fn teardown_workflows(&self) -> impl Iterator<Item = &Workflow> {
        self.golden_paths
            .values()
            .filter(|w| w.name.starts_with("delete-"))
    }
}
