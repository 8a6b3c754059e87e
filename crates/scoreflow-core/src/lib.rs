// Core Orchestration Model
//
// This crate provides the store-agnostic model for the Score-driven workflow
// orchestrator: spec and policy parsing, provider and workflow types, the
// tier resolver, variable interpolation and the execution context.
//
// Key design decisions:
// - Uses the OrchestratorStore trait for pluggable persistence backends
//   (Postgres in production, in-memory for tests and examples)
// - No process-wide "current spec": ExecutionContext is passed explicitly
//   into every step invocation
// - Interpolation is string-in/string-out over a flat namespace map; it
//   never walks arbitrary object graphs
// - Statuses are stored as text with explicit as_str/FromStr so database
//   values survive enum reordering

pub mod context;
pub mod error;
pub mod interpolate;
pub mod model;
pub mod policy;
pub mod provider;
pub mod resolver;
pub mod spec;
pub mod store;
pub mod workflow;

// In-memory store for examples and testing
pub mod memory;

// Re-exports for convenience
pub use context::ExecutionContext;
pub use error::{OrchestratorError, PolicyViolation, Result};
pub use memory::InMemoryStore;
pub use model::{
    AuditEntry, ExecutionStatus, NewAuditEntry, NewQueueTask, QueueTask, ResourceHealth,
    ResourceInstance, ResourceState, StepExecution, StepStatus, TaskStatus, WorkflowExecution,
};
pub use policy::{
    AdminConnections, AdminPolicy, ProviderCategory, ProviderSource, SourceKind, WorkflowOverrides,
};
pub use provider::{Provider, ProviderManifest};
pub use resolver::{resolve, ResolvedPlan};
pub use spec::{Container, ResourceSpec, ScoreSpec, SpecMetadata};
pub use store::{ExecutionFilter, OrchestratorStore, ResourceFilter};
pub use workflow::{Phase, SourceTier, Step, StepKind, SubmissionMetadata, Trigger, Workflow};
