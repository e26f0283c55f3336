use crate::domain::process_definition::ProcessDefinitionId;
use crate::domain::process_instance::ProcessInstanceId;
use crate::error::CoreError;
use crate::migration::report::{
    MigratingProcessInstanceValidationReport, MigrationPlanValidationReport,
};
use thiserror::Error;

/// Errors of plan construction and of migrating individual instances.
///
/// Every variant carries a stable code (see [`MigrationError::code`]).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MigrationError {
    /// The plan failed validation; nothing was touched
    #[error("{0}")]
    InvalidPlan(MigrationPlanValidationReport),

    /// No instance ids were given and the query matched nothing
    #[error("process instance ids is empty")]
    ProcessInstanceIdsEmpty,

    /// An instance id was empty
    #[error("process instance ids contains null value")]
    NullProcessInstanceId,

    /// The instance runs on another definition than the plan's source
    #[error(
        "Process instance '{instance_id}' runs on process definition '{actual}' but the migration plan's source is '{expected}'"
    )]
    WrongProcessDefinition {
        /// Instance
        instance_id: ProcessInstanceId,
        /// Source definition of the plan
        expected: ProcessDefinitionId,
        /// Definition the instance runs on
        actual: ProcessDefinitionId,
    },

    /// The instance does not exist
    #[error("Process instance '{0}' cannot be found")]
    ProcessInstanceNotFound(ProcessInstanceId),

    /// The instance kept changing while it was being migrated
    #[error("Process instance '{instance_id}' was modified concurrently; gave up after {attempts} attempts")]
    ConcurrentModification {
        /// Instance
        instance_id: ProcessInstanceId,
        /// Attempts made, including the first one
        attempts: u32,
    },

    /// The instance's runtime state cannot be migrated with this plan
    #[error("{0}")]
    InstanceValidation(MigratingProcessInstanceValidationReport),

    /// The transformer produced an inconsistent tree; the instance was left untouched
    #[error("Migration of process instance '{instance_id}' violates a structural invariant: {message}")]
    InvariantViolation {
        /// Instance
        instance_id: ProcessInstanceId,
        /// What went wrong
        message: String,
    },

    /// Reading or writing the instance failed
    #[error("Storage error: {0}")]
    Storage(CoreError),

    /// Recomputing an event trigger failed
    #[error("Cannot update event trigger: {0}")]
    TriggerEvaluation(CoreError),

    /// The batch was cancelled before this instance was migrated
    #[error("Migration of process instance '{0}' was cancelled")]
    Cancelled(ProcessInstanceId),
}

impl MigrationError {
    /// Stable error code
    pub fn code(&self) -> &'static str {
        match self {
            MigrationError::ProcessInstanceIdsEmpty => "MIG-001",
            MigrationError::NullProcessInstanceId => "MIG-002",
            MigrationError::WrongProcessDefinition { .. } => "MIG-003",
            MigrationError::ProcessInstanceNotFound(_) => "MIG-004",
            MigrationError::ConcurrentModification { .. } => "MIG-005",
            MigrationError::InstanceValidation(_) => "MIG-006",
            MigrationError::InvariantViolation { .. } => "MIG-007",
            MigrationError::Storage(_) => "MIG-008",
            MigrationError::TriggerEvaluation(_) => "MIG-009",
            MigrationError::InvalidPlan(_) => "MIG-010",
            MigrationError::Cancelled(_) => "MIG-011",
        }
    }
}

impl From<CoreError> for MigrationError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::ProcessInstanceNotFound(id) => {
                MigrationError::ProcessInstanceNotFound(ProcessInstanceId(id))
            }
            CoreError::ExpressionError(_) | CoreError::TimerError(_) => {
                MigrationError::TriggerEvaluation(err)
            }
            other => MigrationError::Storage(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        let id = ProcessInstanceId::from("pi");
        let cases = vec![
            (MigrationError::ProcessInstanceIdsEmpty, "MIG-001"),
            (MigrationError::NullProcessInstanceId, "MIG-002"),
            (
                MigrationError::WrongProcessDefinition {
                    instance_id: id.clone(),
                    expected: "a:1".into(),
                    actual: "b:1".into(),
                },
                "MIG-003",
            ),
            (MigrationError::ProcessInstanceNotFound(id.clone()), "MIG-004"),
            (
                MigrationError::ConcurrentModification {
                    instance_id: id.clone(),
                    attempts: 4,
                },
                "MIG-005",
            ),
            (
                MigrationError::InstanceValidation(MigratingProcessInstanceValidationReport::new(
                    id.clone(),
                )),
                "MIG-006",
            ),
            (
                MigrationError::InvariantViolation {
                    instance_id: id.clone(),
                    message: "broken".into(),
                },
                "MIG-007",
            ),
            (MigrationError::Storage(CoreError::StateStoreError("x".into())), "MIG-008"),
            (
                MigrationError::TriggerEvaluation(CoreError::ExpressionError("x".into())),
                "MIG-009",
            ),
            (
                MigrationError::InvalidPlan(MigrationPlanValidationReport::new(
                    "a:1".into(),
                    "b:1".into(),
                )),
                "MIG-010",
            ),
            (MigrationError::Cancelled(id), "MIG-011"),
        ];

        for (error, code) in cases {
            assert_eq!(error.code(), code, "{}", error);
        }
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            MigrationError::ProcessInstanceIdsEmpty.to_string(),
            "process instance ids is empty"
        );
        assert_eq!(
            MigrationError::NullProcessInstanceId.to_string(),
            "process instance ids contains null value"
        );
        assert_eq!(
            MigrationError::ProcessInstanceNotFound("pi".into()).to_string(),
            "Process instance 'pi' cannot be found"
        );
    }

    #[test]
    fn test_from_core_error() {
        assert_eq!(
            MigrationError::from(CoreError::ProcessInstanceNotFound("pi".into())),
            MigrationError::ProcessInstanceNotFound("pi".into())
        );
        assert_eq!(
            MigrationError::from(CoreError::ExpressionError("bad".into())).code(),
            "MIG-009"
        );
        assert_eq!(
            MigrationError::from(CoreError::StateStoreError("down".into())).code(),
            "MIG-008"
        );
    }
}
