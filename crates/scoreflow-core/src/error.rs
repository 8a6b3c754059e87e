// Error types for the orchestration core

use thiserror::Error;

use crate::model::ResourceState;
use crate::workflow::StepKind;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Errors that can occur while resolving, queueing or executing workflows
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Malformed Score spec; reported to the submitter, nothing is created
    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    /// Malformed admin policy
    #[error("invalid policy: {0}")]
    InvalidPolicy(String),

    /// Admin policy rejected the submission
    #[error("policy violation: {0}")]
    PolicyViolation(#[from] PolicyViolation),

    /// Submission buffer saturated; safe to retry after a delay
    #[error("queue full")]
    QueueFull,

    /// Step dependency graph contains a cycle
    #[error("workflow {workflow} has cyclic step dependencies")]
    WorkflowCyclic { workflow: String },

    /// A step failed permanently
    #[error("step {step} ({kind}) failed: {message}")]
    StepFailed {
        step: String,
        kind: StepKind,
        message: String,
    },

    /// Step or workflow exceeded its deadline
    #[error("timeout")]
    Timeout,

    /// User- or shutdown-initiated stop
    #[error("cancelled")]
    Cancelled,

    /// Reconciler rejected a resource state change; indicates a bug
    #[error("illegal resource transition {from} -> {to}")]
    IllegalTransition {
        from: ResourceState,
        to: ResourceState,
    },

    /// Restart found a running task without recoverable step records
    #[error("recovery inconsistency: {0}")]
    RecoveryInconsistency(String),

    /// Entity lookup failed
    #[error("not found: {0}")]
    NotFound(String),

    /// Persistence layer error
    #[error("store error: {0}")]
    Store(String),

    /// Internal error
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Policy violations detected during workflow resolution
///
/// These are reported to the submitter verbatim; no task is created.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyViolation {
    /// A workflow listed in `requiredPlatformWorkflows` is not offered by any
    /// platform provider
    #[error("MissingPlatformWorkflow({0})")]
    MissingPlatformWorkflow(String),

    /// A step uses a kind outside `allowedStepKinds`
    #[error("DisallowedStepKind(workflow={workflow}, step={step})")]
    DisallowedStepKind {
        workflow: String,
        step: String,
        kind: StepKind,
    },

    /// A workflow exceeds `maxStepsPerWorkflow`
    #[error("TooManySteps(workflow={workflow}, steps={count}, max={max})")]
    TooManySteps {
        workflow: String,
        count: usize,
        max: usize,
    },

    /// A workflow declares no steps
    #[error("EmptyWorkflow({0})")]
    EmptyWorkflow(String),

    /// `metadata.product` names a product no loaded provider serves
    #[error("UnknownProduct({0})")]
    UnknownProduct(String),
}

impl OrchestratorError {
    /// Create an invalid-spec error
    pub fn invalid_spec(msg: impl Into<String>) -> Self {
        OrchestratorError::InvalidSpec(msg.into())
    }

    /// Create an invalid-policy error
    pub fn invalid_policy(msg: impl Into<String>) -> Self {
        OrchestratorError::InvalidPolicy(msg.into())
    }

    /// Create a store error
    pub fn store(msg: impl Into<String>) -> Self {
        OrchestratorError::Store(msg.into())
    }

    /// Create a step-failed error
    pub fn step_failed(step: impl Into<String>, kind: StepKind, message: impl Into<String>) -> Self {
        OrchestratorError::StepFailed {
            step: step.into(),
            kind,
            message: message.into(),
        }
    }

    /// Whether the error is terminal for the whole submission (nothing enqueued)
    pub fn rejects_submission(&self) -> bool {
        matches!(
            self,
            OrchestratorError::InvalidSpec(_)
                | OrchestratorError::InvalidPolicy(_)
                | OrchestratorError::PolicyViolation(_)
                | OrchestratorError::QueueFull
        )
    }
}
