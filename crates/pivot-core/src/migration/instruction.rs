use crate::domain::process_definition::ActivityId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maps one activity of the source definition onto one of the target definition
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MigrationInstruction {
    /// Activity in the source definition
    pub source_activity_id: ActivityId,

    /// Activity in the target definition
    pub target_activity_id: ActivityId,

    /// Recompute event names, conditions and timer due dates from the target activity
    #[serde(default)]
    pub update_event_trigger: bool,
}

impl MigrationInstruction {
    /// Create an instruction that keeps existing event triggers
    pub fn new(source: impl Into<ActivityId>, target: impl Into<ActivityId>) -> Self {
        Self {
            source_activity_id: source.into(),
            target_activity_id: target.into(),
            update_event_trigger: false,
        }
    }

    /// Recompute the event trigger when migrating
    pub fn with_update_event_trigger(mut self) -> Self {
        self.update_event_trigger = true;
        self
    }
}

impl fmt::Display for MigrationInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MigrationInstruction[sourceActivityId={}, targetActivityId={}, updateEventTrigger={}]",
            self.source_activity_id, self.target_activity_id, self.update_event_trigger
        )
    }
}
