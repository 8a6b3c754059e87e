// Shared runtime handed to step dispatch: the process runner, workspace
// manager and whichever REST adapters are configured. Steps that need an
// absent adapter fail permanently with a clear message.

use std::sync::Arc;

use scoreflow_adapters::{
    ArgoCdClient, GiteaClient, ObjectStoreClient, ProcessRunner, TfeClient,
};

use crate::workspace::WorkspaceManager;

#[derive(Clone)]
pub struct StepRuntime {
    pub runner: Arc<dyn ProcessRunner>,
    pub workspaces: WorkspaceManager,
    pub gitea: Option<GiteaClient>,
    pub argocd: Option<ArgoCdClient>,
    pub tfe: Option<TfeClient>,
    pub object_store: Option<ObjectStoreClient>,
}

impl StepRuntime {
    /// Runtime with only the process runner wired, enough for process-based
    /// steps; REST-backed kinds fail until their adapter is configured
    pub fn new(runner: Arc<dyn ProcessRunner>, workspaces: WorkspaceManager) -> Self {
        Self {
            runner,
            workspaces,
            gitea: None,
            argocd: None,
            tfe: None,
            object_store: None,
        }
    }

    pub fn with_gitea(mut self, gitea: GiteaClient) -> Self {
        self.gitea = Some(gitea);
        self
    }

    pub fn with_argocd(mut self, argocd: ArgoCdClient) -> Self {
        self.argocd = Some(argocd);
        self
    }

    pub fn with_tfe(mut self, tfe: TfeClient) -> Self {
        self.tfe = Some(tfe);
        self
    }

    pub fn with_object_store(mut self, object_store: ObjectStoreClient) -> Self {
        self.object_store = Some(object_store);
        self
    }
}
