// Resource lifecycle reconciler.
//
// Consumes step-outcome events from the executor and drives resource
// instances along requested -> provisioning -> active | failed, and
// active -> terminating -> terminated during teardown. The current state of
// the instance decides which leg applies, so provisioning and teardown
// share one binding rule: step.config.resource names the instance and a
// provisioner must be registered for its type.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use scoreflow_core::{OrchestratorStore, Provider, ResourceInstance, ResourceState, ScoreSpec};

use crate::events::StepOutcome;

pub struct ResourceReconciler {
    store: Arc<dyn OrchestratorStore>,
    providers: Arc<RwLock<Vec<Provider>>>,
}

impl ResourceReconciler {
    pub fn new(store: Arc<dyn OrchestratorStore>, providers: Arc<RwLock<Vec<Provider>>>) -> Self {
        Self { store, providers }
    }

    /// Create a `requested` instance for every `resources` entry in the
    /// spec; existing instances are left untouched
    pub async fn declare_resources(&self, spec: &ScoreSpec) -> scoreflow_core::Result<Vec<ResourceInstance>> {
        let mut instances = Vec::with_capacity(spec.resources.len());
        for (name, resource) in &spec.resources {
            let instance = self
                .store
                .create_resource(ResourceInstance::requested(
                    spec.name(),
                    name,
                    &resource.resource_type,
                    resource.params.clone(),
                ))
                .await?;
            debug!(
                app = spec.name(),
                resource = %name,
                state = %instance.state,
                "resource declared"
            );
            instances.push(instance);
        }
        Ok(instances)
    }

    /// Drain outcome events until the executor side closes the channel
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<StepOutcome>) {
        while let Some(outcome) = rx.recv().await {
            if let Err(err) = self.handle(&outcome).await {
                warn!(
                    app = outcome.app_name(),
                    resource = outcome.resource_name().unwrap_or("-"),
                    error = %err,
                    "reconcile failed"
                );
            }
        }
        info!("reconciler drained");
    }

    async fn handle(&self, outcome: &StepOutcome) -> scoreflow_core::Result<()> {
        let Some(resource_name) = outcome.resource_name() else {
            return Ok(());
        };
        let Some(resource) = self
            .store
            .get_resource(outcome.app_name(), resource_name)
            .await?
        else {
            debug!(
                app = outcome.app_name(),
                resource = resource_name,
                "outcome names an undeclared resource, ignoring"
            );
            return Ok(());
        };

        // Binding rule: only steps backed by a registered provisioner for
        // the instance's type move its state.
        if !self.has_provisioner(&resource.resource_type) {
            debug!(
                resource = resource_name,
                resource_type = %resource.resource_type,
                "no provisioner registered, ignoring outcome"
            );
            return Ok(());
        }

        match outcome {
            StepOutcome::Started { .. } => match resource.state {
                ResourceState::Requested | ResourceState::Failed => {
                    self.transition(&resource, ResourceState::Provisioning, None, None)
                        .await
                }
                ResourceState::Active => {
                    self.transition(&resource, ResourceState::Terminating, None, None)
                        .await
                }
                ResourceState::Provisioning | ResourceState::Terminating => {
                    // A later match on the same instance; first in
                    // dependency order already won.
                    warn!(
                        resource = resource_name,
                        state = %resource.state,
                        "additional provisioner match ignored"
                    );
                    Ok(())
                }
                ResourceState::Terminated => Ok(()),
            },
            StepOutcome::Finished {
                success,
                outputs,
                error_message,
                ..
            } => match (resource.state, success) {
                (ResourceState::Provisioning, true) => {
                    let mut metadata = serde_json::Map::new();
                    let rendered: serde_json::Map<String, serde_json::Value> = outputs
                        .iter()
                        .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                        .collect();
                    metadata.insert("outputs".into(), serde_json::Value::Object(rendered));
                    if let Some(provider_id) = outputs.get("provider_id") {
                        metadata.insert(
                            "provider_id".into(),
                            serde_json::Value::String(provider_id.clone()),
                        );
                    }
                    self.transition(&resource, ResourceState::Active, Some(metadata), None)
                        .await
                }
                (ResourceState::Provisioning, false) => {
                    self.transition(
                        &resource,
                        ResourceState::Failed,
                        None,
                        error_message.clone(),
                    )
                    .await
                }
                (ResourceState::Terminating, true) => {
                    self.transition(&resource, ResourceState::Terminated, None, None)
                        .await
                }
                (ResourceState::Terminating, false) => {
                    warn!(
                        resource = resource_name,
                        error = error_message.as_deref().unwrap_or("-"),
                        "teardown step failed, resource stays terminating"
                    );
                    Ok(())
                }
                _ => Ok(()),
            },
        }
    }

    async fn transition(
        &self,
        resource: &ResourceInstance,
        to: ResourceState,
        metadata: Option<serde_json::Map<String, serde_json::Value>>,
        error_message: Option<String>,
    ) -> scoreflow_core::Result<()> {
        // An IllegalTransition here indicates a programming bug; it
        // propagates to the caller and the resource row is untouched.
        let updated = self
            .store
            .transition_resource(resource.id, to, metadata, error_message)
            .await?;
        info!(
            app = %updated.application_name,
            resource = %updated.resource_name,
            from = %resource.state,
            to = %updated.state,
            "resource transitioned"
        );
        Ok(())
    }

    fn has_provisioner(&self, resource_type: &str) -> bool {
        self.providers
            .read()
            .iter()
            .any(|p| p.provisioner_for(resource_type).is_some())
    }
}
