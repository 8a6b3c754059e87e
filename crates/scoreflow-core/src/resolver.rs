// Workflow resolver: combines platform, product and application tiers into
// the per-phase execution plan, under the admin policy's allow-lists.
//
// Ordering is deliberate and stable:
//   - platform: requiredPlatformWorkflows declared order
//   - product: alphabetical by provider name, then workflow name
//   - application: spec document order
// Within each phase, tiers concatenate platform -> product -> application;
// phases run pre-deployment -> deployment -> post-deployment.

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::{PolicyViolation, Result};
use crate::policy::AdminPolicy;
use crate::provider::Provider;
use crate::spec::ScoreSpec;
use crate::workflow::{Phase, SourceTier, Trigger, Workflow};

/// The resolved plan: phase -> ordered workflows, each annotated with its
/// source tier
#[derive(Debug, Clone, Default)]
pub struct ResolvedPlan {
    pub phases: BTreeMap<Phase, Vec<Workflow>>,
}

impl ResolvedPlan {
    /// Workflows across all phases, in execution order
    pub fn ordered(&self) -> impl Iterator<Item = &Workflow> {
        Phase::ALL
            .iter()
            .filter_map(|phase| self.phases.get(phase))
            .flatten()
    }

    pub fn len(&self) -> usize {
        self.phases.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resolve the full set of workflows to run for one submission.
///
/// `first_deployment` reflects whether the store has any prior execution for
/// this app; it gates `first_deployment`-triggered product workflows.
pub fn resolve(
    spec: &ScoreSpec,
    policy: &AdminPolicy,
    providers: &[Provider],
    first_deployment: bool,
) -> Result<ResolvedPlan> {
    let mut tiers: Vec<Workflow> = Vec::new();

    // Platform tier: every required workflow must exist under a platform
    // provider.
    for name in &policy.required_platform_workflows {
        let workflow = providers
            .iter()
            .filter(|p| p.is_platform())
            .find_map(|p| p.golden_path(name))
            .ok_or_else(|| PolicyViolation::MissingPlatformWorkflow(name.clone()))?;

        let mut workflow = workflow.clone();
        workflow.source_tier = SourceTier::Platform;
        tiers.push(workflow);
    }

    // Product tier: providers serving metadata.product, filtered by the
    // product allow-list and by triggers.
    if let Some(product) = spec.metadata.product() {
        let mut product_providers: Vec<&Provider> = providers
            .iter()
            .filter(|p| p.serves_product(product))
            .collect();
        if product_providers.is_empty() {
            return Err(PolicyViolation::UnknownProduct(product.to_string()).into());
        }
        product_providers.sort_by(|a, b| a.name.cmp(&b.name));

        for provider in product_providers {
            let mut candidates: Vec<Workflow> = Vec::new();

            // Provisioners are instantiated once per declared resource of
            // their type, with the resource name bound into step config so
            // the reconciler can couple state transitions to outcomes.
            for (resource_type, workflow) in &provider.provisioners {
                if !policy.allows_product_workflow(product, &workflow.name) {
                    debug!(provider = %provider.name, workflow = %workflow.name, "provisioner not in allow-list");
                    continue;
                }
                if !automatically_included(workflow, first_deployment) {
                    continue;
                }
                let matching: Vec<&String> = spec
                    .resources
                    .iter()
                    .filter(|(_, r)| &r.resource_type == resource_type)
                    .map(|(name, _)| name)
                    .collect();
                for resource_name in &matching {
                    let mut instance = workflow.clone();
                    if matching.len() > 1 {
                        instance.name = format!("{}-{resource_name}", workflow.name);
                    }
                    for step in &mut instance.steps {
                        step.config
                            .entry("resource".to_string())
                            .or_insert_with(|| {
                                serde_json::Value::String(resource_name.to_string())
                            });
                    }
                    candidates.push(instance);
                }
            }

            for (name, workflow) in &provider.golden_paths {
                if !policy.allows_product_workflow(product, name) {
                    debug!(provider = %provider.name, workflow = %name, "product workflow not in allow-list");
                    continue;
                }
                if !automatically_included(workflow, first_deployment) {
                    continue;
                }
                candidates.push(workflow.clone());
            }

            candidates.sort_by(|a, b| a.name.cmp(&b.name));
            for mut workflow in candidates {
                workflow.source_tier = SourceTier::Product;
                tiers.push(workflow);
            }
        }
    }

    // Application tier: every inline workflow, declared order.
    for workflow in &spec.workflows {
        let mut workflow = workflow.clone();
        workflow.source_tier = SourceTier::Application;
        tiers.push(workflow);
    }

    apply_overrides(&mut tiers, policy);
    validate(&tiers, policy)?;

    // Phase grouping: tier concatenation above already encodes the
    // platform -> product -> application order within each phase.
    let mut plan = ResolvedPlan::default();
    for workflow in tiers {
        plan.phases.entry(workflow.phase).or_default().push(workflow);
    }
    Ok(plan)
}

/// Trigger gating for automatic resolution: `manual` is never included,
/// `first_deployment` only when the app has no prior execution. A workflow
/// with no triggers runs on every deployment.
fn automatically_included(workflow: &Workflow, first_deployment: bool) -> bool {
    if workflow.triggers.is_empty() {
        return true;
    }
    if workflow.triggered_by(Trigger::ProductDeployment)
        || workflow.triggered_by(Trigger::AllDeployments)
    {
        return true;
    }
    workflow.triggered_by(Trigger::FirstDeployment) && first_deployment
}

/// Same-logical-name collisions across adjacent tiers, decided by the
/// override flags; without a flag both remain (later tier runs later).
fn apply_overrides(tiers: &mut Vec<Workflow>, policy: &AdminPolicy) {
    let overrides = policy.workflow_overrides;
    if !overrides.platform && !overrides.product {
        return;
    }

    let mut drop = vec![false; tiers.len()];
    for (i, workflow) in tiers.iter().enumerate() {
        for other in tiers.iter() {
            let superseded = match (other.source_tier, workflow.source_tier) {
                (SourceTier::Platform, SourceTier::Product) => overrides.platform,
                (SourceTier::Product, SourceTier::Application) => overrides.product,
                _ => false,
            };
            if superseded && other.name == workflow.name {
                drop[i] = true;
            }
        }
    }

    let mut index = 0;
    tiers.retain(|_| {
        let keep = !drop[index];
        index += 1;
        keep
    });
}

fn validate(tiers: &[Workflow], policy: &AdminPolicy) -> Result<()> {
    for workflow in tiers {
        if workflow.steps.is_empty() {
            return Err(PolicyViolation::EmptyWorkflow(workflow.name.clone()).into());
        }
        if workflow.steps.len() > policy.max_steps_per_workflow {
            return Err(PolicyViolation::TooManySteps {
                workflow: workflow.name.clone(),
                count: workflow.steps.len(),
                max: policy.max_steps_per_workflow,
            }
            .into());
        }
        for step in &workflow.steps {
            if !policy.allowed_step_kinds.contains(&step.kind) {
                return Err(PolicyViolation::DisallowedStepKind {
                    workflow: workflow.name.clone(),
                    step: step.name.clone(),
                    kind: step.kind,
                }
                .into());
            }
        }
    }
    Ok(())
}
