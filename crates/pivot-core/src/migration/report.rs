//! Validation reports for migration plans and migrating instances.

use crate::domain::process_definition::{ActivityId, ProcessDefinitionId};
use crate::domain::process_instance::{ExecutionId, ProcessInstanceId};
use crate::migration::instruction::MigrationInstruction;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Failures of a single instruction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationInstructionValidationReport {
    /// The instruction
    pub instruction: MigrationInstruction,

    /// Failure messages in check order
    pub failures: Vec<String>,
}

/// Failures of a single plan variable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationVariableValidationReport {
    /// Variable name
    pub variable_name: String,

    /// Failure messages
    pub failures: Vec<String>,
}

/// Outcome of validating a migration plan; empty means the plan can be built
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationPlanValidationReport {
    /// Source definition
    pub source_process_definition_id: ProcessDefinitionId,

    /// Target definition
    pub target_process_definition_id: ProcessDefinitionId,

    /// Failing instructions, in plan order
    pub instruction_reports: Vec<MigrationInstructionValidationReport>,

    /// Failing variables, by name
    pub variable_reports: Vec<MigrationVariableValidationReport>,
}

impl MigrationPlanValidationReport {
    /// Create an empty report
    pub fn new(source: ProcessDefinitionId, target: ProcessDefinitionId) -> Self {
        Self {
            source_process_definition_id: source,
            target_process_definition_id: target,
            instruction_reports: Vec::new(),
            variable_reports: Vec::new(),
        }
    }

    /// Whether any instruction or variable failed
    pub fn has_failures(&self) -> bool {
        !self.instruction_reports.is_empty() || !self.variable_reports.is_empty()
    }

    /// All failure messages reported for instructions with the given source activity
    pub fn instruction_failures(&self, source_activity_id: &str) -> Vec<&str> {
        self.instruction_reports
            .iter()
            .filter(|r| r.instruction.source_activity_id.as_str() == source_activity_id)
            .flat_map(|r| r.failures.iter().map(String::as_str))
            .collect()
    }

    /// Failure messages reported for a variable
    pub fn variable_failures(&self, name: &str) -> Vec<&str> {
        self.variable_reports
            .iter()
            .filter(|r| r.variable_name == name)
            .flat_map(|r| r.failures.iter().map(String::as_str))
            .collect()
    }
}

impl fmt::Display for MigrationPlanValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Migration plan for process definition '{}' to '{}' is not valid:",
            self.source_process_definition_id, self.target_process_definition_id
        )?;
        for report in &self.instruction_reports {
            write!(f, "\n\t Migration instruction {} is not valid:", report.instruction)?;
            for failure in &report.failures {
                write!(f, "\n\t\t {}", failure)?;
            }
        }
        for report in &self.variable_reports {
            write!(f, "\n\t Migration variable {} is not valid:", report.variable_name)?;
            for failure in &report.failures {
                write!(f, "\n\t\t {}", failure)?;
            }
        }
        Ok(())
    }
}

/// Failures of one activity instance of a migrating process instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityInstanceValidationReport {
    /// Activity of the instance in the source definition
    pub source_activity_id: ActivityId,

    /// Execution backing the activity instance
    pub execution_id: ExecutionId,

    /// Failure messages
    pub failures: Vec<String>,
}

/// Outcome of checking one process instance against a plan before migrating it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigratingProcessInstanceValidationReport {
    /// Instance that was checked
    pub process_instance_id: ProcessInstanceId,

    /// Failing activity instances
    pub activity_instance_reports: Vec<ActivityInstanceValidationReport>,
}

impl MigratingProcessInstanceValidationReport {
    /// Create an empty report
    pub fn new(process_instance_id: ProcessInstanceId) -> Self {
        Self {
            process_instance_id,
            activity_instance_reports: Vec::new(),
        }
    }

    /// Whether any activity instance failed
    pub fn has_failures(&self) -> bool {
        !self.activity_instance_reports.is_empty()
    }

    /// Record a failure, grouping failures of the same execution
    pub fn add_failure(
        &mut self,
        source_activity_id: &ActivityId,
        execution_id: &ExecutionId,
        failure: impl Into<String>,
    ) {
        match self
            .activity_instance_reports
            .iter_mut()
            .find(|r| r.execution_id == *execution_id)
        {
            Some(report) => report.failures.push(failure.into()),
            None => self
                .activity_instance_reports
                .push(ActivityInstanceValidationReport {
                    source_activity_id: source_activity_id.clone(),
                    execution_id: execution_id.clone(),
                    failures: vec![failure.into()],
                }),
        }
    }

    /// All failure messages reported for activity instances of `source_activity_id`
    pub fn activity_instance_failures(&self, source_activity_id: &str) -> Vec<&str> {
        self.activity_instance_reports
            .iter()
            .filter(|r| r.source_activity_id.as_str() == source_activity_id)
            .flat_map(|r| r.failures.iter().map(String::as_str))
            .collect()
    }
}

impl fmt::Display for MigratingProcessInstanceValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Cannot migrate process instance '{}':",
            self.process_instance_id
        )?;
        for report in &self.activity_instance_reports {
            write!(
                f,
                "\n\t Cannot migrate activity instance '{}' of activity '{}':",
                report.execution_id, report.source_activity_id
            )?;
            for failure in &report.failures {
                write!(f, "\n\t\t {}", failure)?;
            }
        }
        Ok(())
    }
}
