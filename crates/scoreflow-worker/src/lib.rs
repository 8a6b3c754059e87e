// Orchestration Engine
//
// The runtime half of Scoreflow: the bounded task queue with its worker
// pool, the step executor, the resource reconciler, and the orchestrator
// facade the handler layer calls.
//
// Key design decisions:
// - Workers claim durably before executing; step records persist before the
//   next step starts, so restart recovery resumes from the first
//   non-terminal step and never re-runs a completed one
// - A single status-updater task drains the status channel, keeping updates
//   for one execution in emission order
// - The executor emits step outcomes onto a channel the reconciler
//   consumes; the reconciler holds no reference back into the executor
// - Worker panics are isolated to the affected task; the pool keeps running

pub mod events;
pub mod executor;
pub mod orchestrator;
pub mod queue;
pub mod reconciler;
pub mod runtime;
pub mod status;
pub mod steps;
pub mod workspace;

pub use events::StepOutcome;
pub use executor::{ExecutionOutcome, ExecutorConfig, StepExecutor};
pub use orchestrator::{Orchestrator, SubmitResult};
pub use queue::{ActiveTaskInfo, QueueConfig, QueueStats, TaskQueue};
pub use reconciler::ResourceReconciler;
pub use runtime::StepRuntime;
pub use status::{spawn_status_updater, StatusSender, StatusUpdate};
pub use workspace::WorkspaceManager;
