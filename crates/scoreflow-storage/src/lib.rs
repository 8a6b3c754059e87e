// Scoreflow storage layer
//
// PostgreSQL persistence for queue tasks, workflow executions, step records,
// resource instances and the audit log. The Database type implements the
// core OrchestratorStore trait; the engine never sees sqlx.

pub mod models;
pub mod store;

pub use store::Database;
