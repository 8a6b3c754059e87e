// Execution context carried into every step invocation.
//
// Replaces any notion of a process-wide "current spec": the executor owns
// one context per run and threads it explicitly through step dispatch.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::interpolate;
use crate::model::ResourceInstance;
use crate::spec::ScoreSpec;
use crate::workflow::{Step, SubmissionMetadata};

/// Everything a step invocation may reference: the spec, the resolved
/// resources, outputs of prior steps and the submission metadata
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub spec: Arc<ScoreSpec>,

    /// Submission metadata, surfaced through the `workflow.*` namespace
    pub metadata: SubmissionMetadata,

    /// Resolved resource instances by resource name
    pub resources: BTreeMap<String, ResourceInstance>,

    /// Outputs of prior completed steps of the current workflow, by step name
    pub step_outputs: BTreeMap<String, BTreeMap<String, String>>,

    /// Golden-path parameters bound at submission
    pub parameters: BTreeMap<String, String>,
}

impl ExecutionContext {
    pub fn new(spec: Arc<ScoreSpec>, metadata: SubmissionMetadata) -> Self {
        Self {
            spec,
            metadata,
            resources: BTreeMap::new(),
            step_outputs: BTreeMap::new(),
            parameters: BTreeMap::new(),
        }
    }

    /// Deployment environment, from submission metadata first and spec
    /// metadata second
    pub fn environment(&self) -> &str {
        self.metadata
            .get("ENVIRONMENT")
            .map(String::as_str)
            .or_else(|| self.spec.metadata.environment())
            .unwrap_or("default")
    }

    /// Record a completed step's outputs for later interpolation.
    ///
    /// Outputs register under `<step-name>.*`; terraform-shaped steps merge
    /// into the `terraform.*` namespace as well.
    pub fn record_step_outputs(
        &mut self,
        step_name: &str,
        terraform_like: bool,
        outputs: &BTreeMap<String, String>,
    ) {
        if outputs.is_empty() {
            return;
        }
        self.step_outputs
            .entry(step_name.to_string())
            .or_default()
            .extend(outputs.clone());
        if terraform_like && step_name != "terraform" {
            self.step_outputs
                .entry("terraform".to_string())
                .or_default()
                .extend(outputs.clone());
        }
    }

    /// Build the flat variable namespace for interpolation
    pub fn variables(&self) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();

        vars.insert("application.name".to_string(), self.spec.name().to_string());
        for (key, value) in &self.spec.metadata.extra {
            vars.insert(format!("application.{key}"), value.clone());
        }

        for (name, resource) in &self.resources {
            vars.insert(
                format!("resources.{name}.type"),
                resource.resource_type.clone(),
            );
            vars.insert(
                format!("resources.{name}.state"),
                resource.state.to_string(),
            );
            if let Some(provider_id) = &resource.provider_id {
                vars.insert(format!("resources.{name}.id"), provider_id.clone());
            }
            for (key, value) in resource.outputs() {
                vars.insert(format!("resources.{name}.{key}"), value);
            }
        }

        for (key, value) in &self.metadata {
            vars.insert(format!("workflow.{key}"), value.clone());
        }

        for (step, outputs) in &self.step_outputs {
            for (key, value) in outputs {
                vars.insert(format!("{step}.{key}"), value.clone());
            }
        }

        for (key, value) in &self.parameters {
            vars.insert(format!("parameters.{key}"), value.clone());
        }

        vars
    }

    /// A step's config with every string leaf interpolated
    pub fn interpolated_config(
        &self,
        step: &Step,
    ) -> serde_json::Map<String, serde_json::Value> {
        interpolate::interpolate_config(&step.config, &self.variables())
    }
}
