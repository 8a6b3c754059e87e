// Score specification model and parser.
//
// The spec is the input manifest: containers, resources and inline
// (application-tier) workflows. Parsing validates structural constraints
// only; variable placeholders of the form ${a.b.c} are preserved verbatim
// and resolved later by the step executor.

use std::collections::BTreeMap;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{OrchestratorError, Result};
use crate::workflow::{SourceTier, Workflow};

/// Accepted application names: DNS-label-ish, as enforced downstream by the
/// tools the workflows drive
static NAME_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9-]+$").unwrap());

const API_VERSION_PREFIX: &str = "score.dev/";

/// The input manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreSpec {
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    pub metadata: SpecMetadata,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub containers: BTreeMap<String, Container>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resources: BTreeMap<String, ResourceSpec>,

    /// Inline application-tier workflows, in document order
    #[serde(
        default,
        deserialize_with = "deserialize_workflow_map",
        serialize_with = "serialize_workflow_map",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub workflows: Vec<Workflow>,
}

/// `metadata` mapping; `name` is required, everything else is free-form
/// string pairs (`product`, `team`, `costCenter`, `environment`, ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecMetadata {
    pub name: String,

    #[serde(flatten)]
    pub extra: BTreeMap<String, String>,
}

impl SpecMetadata {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.extra.get(key).map(String::as_str)
    }

    pub fn product(&self) -> Option<&str> {
        self.get("product")
    }

    pub fn environment(&self) -> Option<&str> {
        self.get("environment")
    }
}

/// One container entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub image: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<ContainerPort>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerPort {
    pub port: u16,

    #[serde(
        default,
        rename = "targetPort",
        skip_serializing_if = "Option::is_none"
    )]
    pub target_port: Option<u16>,
}

/// One declared resource; `outputs` is filled in at runtime by the
/// provisioner, never by the submitter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    #[serde(rename = "type")]
    pub resource_type: String,

    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub params: serde_json::Map<String, serde_json::Value>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, String>,
}

impl ScoreSpec {
    /// Parse and validate a textual Score spec
    pub fn parse(text: &str) -> Result<ScoreSpec> {
        let spec: ScoreSpec = serde_yaml::from_str(text)
            .map_err(|e| OrchestratorError::invalid_spec(e.to_string()))?;
        spec.validate()?;
        Ok(spec)
    }

    /// Re-serialize; `parse(serialize(parse(x)))` equals `parse(x)` for
    /// well-formed inputs
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| OrchestratorError::invalid_spec(e.to_string()))
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    fn validate(&self) -> Result<()> {
        if !self.api_version.starts_with(API_VERSION_PREFIX) {
            return Err(OrchestratorError::invalid_spec(format!(
                "apiVersion must begin with {API_VERSION_PREFIX}, got {:?}",
                self.api_version
            )));
        }
        if !NAME_PATTERN.is_match(&self.metadata.name) {
            return Err(OrchestratorError::invalid_spec(format!(
                "metadata.name {:?} must match [a-z0-9-]+",
                self.metadata.name
            )));
        }
        for (name, resource) in &self.resources {
            if resource.resource_type.trim().is_empty() {
                return Err(OrchestratorError::invalid_spec(format!(
                    "resource {name} has an empty type"
                )));
            }
        }
        for workflow in &self.workflows {
            if workflow.steps.is_empty() {
                return Err(OrchestratorError::invalid_spec(format!(
                    "workflow {} declares no steps",
                    workflow.name
                )));
            }
        }
        Ok(())
    }
}

// Workflows are declared as a YAML mapping, but the application tier runs in
// declared order, so deserialize into a Vec walking entries in document
// order. The map key becomes the workflow name and the tier is pinned to
// Application.
fn deserialize_workflow_map<'de, D>(deserializer: D) -> std::result::Result<Vec<Workflow>, D::Error>
where
    D: Deserializer<'de>,
{
    struct WorkflowMapVisitor;

    impl<'de> Visitor<'de> for WorkflowMapVisitor {
        type Value = Vec<Workflow>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a mapping of workflow name to workflow")
        }

        fn visit_map<A>(self, mut access: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut workflows = Vec::with_capacity(access.size_hint().unwrap_or(0));
            while let Some((name, mut workflow)) = access.next_entry::<String, Workflow>()? {
                workflow.name = name;
                workflow.source_tier = SourceTier::Application;
                workflows.push(workflow);
            }
            Ok(workflows)
        }
    }

    deserializer.deserialize_map(WorkflowMapVisitor)
}

fn serialize_workflow_map<S>(
    workflows: &[Workflow],
    serializer: S,
) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let mut map = serializer.serialize_map(Some(workflows.len()))?;
    for workflow in workflows {
        map.serialize_entry(&workflow.name, workflow)?;
    }
    map.end()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::StepKind;

    const SPEC: &str = r#"
apiVersion: score.dev/v1b1
metadata:
  name: demo
  product: ecommerce
  environment: staging
containers:
  web:
    image: registry.internal/demo:1.4.2
    variables:
      DB_URL: ${resources.db.connection_string}
    ports:
      - port: 80
        targetPort: 8080
resources:
  db:
    type: postgres
    params:
      size: small
workflows:
  deploy:
    phase: deployment
    steps:
      - name: apply
        kind: kubernetes
        config:
          namespace: demo-staging
  verify:
    phase: post-deployment
    steps:
      - name: smoke
        kind: validation
        config:
          command: ./smoke.sh
"#;

    #[test]
    fn parses_a_complete_spec() {
        let spec = ScoreSpec::parse(SPEC).unwrap();
        assert_eq!(spec.name(), "demo");
        assert_eq!(spec.metadata.product(), Some("ecommerce"));
        assert_eq!(spec.metadata.environment(), Some("staging"));
        assert_eq!(spec.containers["web"].ports[0].target_port, Some(8080));
        assert_eq!(spec.resources["db"].resource_type, "postgres");

        // declared order is preserved
        assert_eq!(spec.workflows[0].name, "deploy");
        assert_eq!(spec.workflows[1].name, "verify");
        assert_eq!(spec.workflows[0].source_tier, SourceTier::Application);
        assert_eq!(spec.workflows[0].steps[0].kind, StepKind::Kubernetes);
    }

    #[test]
    fn placeholders_are_preserved_verbatim() {
        let spec = ScoreSpec::parse(SPEC).unwrap();
        assert_eq!(
            spec.containers["web"].variables["DB_URL"],
            "${resources.db.connection_string}"
        );
    }

    #[test]
    fn round_trips_through_serialization() {
        let spec = ScoreSpec::parse(SPEC).unwrap();
        let reparsed = ScoreSpec::parse(&spec.to_yaml().unwrap()).unwrap();
        assert_eq!(reparsed, spec);
    }

    #[test]
    fn rejects_foreign_api_version() {
        let err = ScoreSpec::parse("apiVersion: v1\nmetadata:\n  name: demo\n").unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidSpec(_)));
    }

    #[test]
    fn rejects_bad_name() {
        let err =
            ScoreSpec::parse("apiVersion: score.dev/v1b1\nmetadata:\n  name: Demo_App\n")
                .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidSpec(_)));
    }

    #[test]
    fn rejects_missing_name() {
        let err = ScoreSpec::parse("apiVersion: score.dev/v1b1\nmetadata: {}\n").unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidSpec(_)));
    }

    #[test]
    fn rejects_empty_resource_type() {
        let text = r#"
apiVersion: score.dev/v1b1
metadata:
  name: demo
resources:
  cache:
    type: ""
"#;
        let err = ScoreSpec::parse(text).unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidSpec(_)));
    }

    #[test]
    fn rejects_workflow_without_steps() {
        let text = r#"
apiVersion: score.dev/v1b1
metadata:
  name: demo
workflows:
  deploy:
    steps: []
"#;
        let err = ScoreSpec::parse(text).unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidSpec(_)));
    }

    #[test]
    fn rejects_unknown_step_kind() {
        let text = r#"
apiVersion: score.dev/v1b1
metadata:
  name: demo
workflows:
  deploy:
    steps:
      - name: bad
        kind: helm
"#;
        let err = ScoreSpec::parse(text).unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidSpec(_)));
    }
}
