// Step outcome events.
//
// The executor emits these onto a channel; the reconciler consumes them to
// drive resource state. This is the only coupling between the two - the
// reconciler owns no reference back into the executor.

use std::collections::BTreeMap;

use uuid::Uuid;

use scoreflow_core::StepKind;

/// One step lifecycle notification
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Started {
        execution_id: Uuid,
        app_name: String,
        step_name: String,
        kind: StepKind,
        /// `config.resource` after interpolation, when present
        resource_name: Option<String>,
    },
    Finished {
        execution_id: Uuid,
        app_name: String,
        step_name: String,
        kind: StepKind,
        resource_name: Option<String>,
        success: bool,
        outputs: BTreeMap<String, String>,
        error_message: Option<String>,
    },
}

impl StepOutcome {
    pub fn app_name(&self) -> &str {
        match self {
            StepOutcome::Started { app_name, .. } | StepOutcome::Finished { app_name, .. } => {
                app_name
            }
        }
    }

    pub fn resource_name(&self) -> Option<&str> {
        match self {
            StepOutcome::Started { resource_name, .. }
            | StepOutcome::Finished { resource_name, .. } => resource_name.as_deref(),
        }
    }
}
