//! Assertion utilities for process instance snapshots.
//!
//! Each helper returns a descriptive error instead of panicking so that
//! tests can decide between `unwrap()` and inspecting the mismatch.

use pivot_core::{ActivityId, ProcessDefinition, ProcessInstance};
use thiserror::Error;

/// Error type for snapshot validation failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InstanceAssertionError {
    /// Activity-instance tree differs
    #[error("Activity instance tree mismatch: expected {expected}, got {actual}")]
    TreeMismatch {
        /// Expected rendering
        expected: String,
        /// Actual rendering
        actual: String,
    },

    /// Active leaf activities differ
    #[error("Active activities mismatch: expected {expected:?}, got {actual:?}")]
    ActiveActivities {
        /// Expected activity ids
        expected: Vec<String>,
        /// Actual activity ids
        actual: Vec<String>,
    },

    /// Number of executions in an activity differs
    #[error("Expected {expected} executions in {activity}, got {actual}")]
    ExecutionCount {
        /// Activity
        activity: String,
        /// Expected count
        expected: usize,
        /// Actual count
        actual: usize,
    },

    /// The instance is not consistent with a definition
    #[error("Instance does not fit definition {definition}: {message}")]
    Inconsistent {
        /// Definition id
        definition: String,
        /// Violation
        message: String,
    },

    /// Two snapshots differ
    #[error("Snapshots differ: {0}")]
    SnapshotChanged(String),

    /// The instance has already ended
    #[error("Instance {0} has ended")]
    Ended(String),
}

/// Asserts the rendered activity-instance tree, e.g. `process[subProcess[userTask]]`
pub fn assert_activity_tree(
    instance: &ProcessInstance,
    expected: &str,
) -> Result<(), InstanceAssertionError> {
    let actual = instance
        .activity_instance_tree()
        .map(|tree| tree.describe())
        .ok_or_else(|| InstanceAssertionError::Ended(instance.id.to_string()))?;
    if actual != expected {
        return Err(InstanceAssertionError::TreeMismatch {
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

/// Asserts the sorted list of active leaf activities (duplicates included)
pub fn assert_active_activities(
    instance: &ProcessInstance,
    expected: &[&str],
) -> Result<(), InstanceAssertionError> {
    let actual: Vec<String> = instance
        .active_activity_ids()
        .into_iter()
        .map(|a| a.0)
        .collect();
    let mut expected: Vec<String> = expected.iter().map(|s| s.to_string()).collect();
    expected.sort();
    if actual != expected {
        return Err(InstanceAssertionError::ActiveActivities { expected, actual });
    }
    Ok(())
}

/// Asserts how many executions occupy an activity
pub fn assert_execution_count(
    instance: &ProcessInstance,
    activity: &str,
    expected: usize,
) -> Result<(), InstanceAssertionError> {
    let actual = instance.executions_in(&ActivityId::from(activity)).len();
    if actual != expected {
        return Err(InstanceAssertionError::ExecutionCount {
            activity: activity.to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}

/// Asserts that the instance is structurally valid for `definition`
pub fn assert_consistent_with(
    instance: &ProcessInstance,
    definition: &ProcessDefinition,
) -> Result<(), InstanceAssertionError> {
    instance
        .verify_against(definition)
        .map_err(|e| InstanceAssertionError::Inconsistent {
            definition: definition.id.to_string(),
            message: e.to_string(),
        })
}

/// Asserts that two snapshots are identical, field by field
pub fn assert_unchanged(
    before: &ProcessInstance,
    after: &ProcessInstance,
) -> Result<(), InstanceAssertionError> {
    if before == after {
        return Ok(());
    }
    let before_json = serde_json::to_string(&summary(before)).unwrap_or_default();
    let after_json = serde_json::to_string(&summary(after)).unwrap_or_default();
    Err(InstanceAssertionError::SnapshotChanged(format!(
        "{} != {}",
        before_json, after_json
    )))
}

fn summary(instance: &ProcessInstance) -> serde_json::Value {
    serde_json::json!({
        "definition": instance.process_definition_id.to_string(),
        "version": instance.version,
        "activities": instance
            .active_activity_ids()
            .into_iter()
            .map(|a| a.0)
            .collect::<Vec<_>>(),
        "subscriptions": instance.event_subscriptions.len(),
        "timers": instance.timer_jobs.len(),
        "incidents": instance.incidents.len(),
        "externalTasks": instance.external_tasks.len(),
    })
}
