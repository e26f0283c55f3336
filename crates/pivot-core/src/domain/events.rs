use crate::domain::process_definition::ProcessDefinitionId;
use crate::domain::process_instance::ProcessInstanceId;
use chrono::{DateTime, Utc};
use std::fmt::Debug;

/// Domain event trait for all events in the system
pub trait DomainEvent: Debug + Send + Sync {
    /// Returns the type of the event as a string
    fn event_type(&self) -> &'static str;

    /// Returns the process instance ID this event is associated with
    fn process_instance_id(&self) -> &ProcessInstanceId;

    /// Returns the timestamp when the event occurred
    fn timestamp(&self) -> DateTime<Utc>;
}

/// Event: Process instance started
#[derive(Debug)]
pub struct ProcessInstanceStarted {
    /// The unique identifier of the process instance
    pub process_instance_id: ProcessInstanceId,

    /// The definition the instance runs on
    pub process_definition_id: ProcessDefinitionId,

    /// The timestamp when the instance was started
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for ProcessInstanceStarted {
    fn event_type(&self) -> &'static str {
        "process_instance.started"
    }

    fn process_instance_id(&self) -> &ProcessInstanceId {
        &self.process_instance_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Event: Process instance completed
#[derive(Debug)]
pub struct ProcessInstanceCompleted {
    /// The unique identifier of the process instance
    pub process_instance_id: ProcessInstanceId,

    /// The definition the instance ran on
    pub process_definition_id: ProcessDefinitionId,

    /// The timestamp when the instance completed
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for ProcessInstanceCompleted {
    fn event_type(&self) -> &'static str {
        "process_instance.completed"
    }

    fn process_instance_id(&self) -> &ProcessInstanceId {
        &self.process_instance_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Event: Process instance moved to another definition
#[derive(Debug)]
pub struct ProcessInstanceMigrated {
    /// The unique identifier of the process instance
    pub process_instance_id: ProcessInstanceId,

    /// Definition before the migration
    pub source_process_definition_id: ProcessDefinitionId,

    /// Definition after the migration
    pub target_process_definition_id: ProcessDefinitionId,

    /// Number of operations the migration applied
    pub operation_count: usize,

    /// The timestamp when the migration was committed
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for ProcessInstanceMigrated {
    fn event_type(&self) -> &'static str {
        "process_instance.migrated"
    }

    fn process_instance_id(&self) -> &ProcessInstanceId {
        &self.process_instance_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Event: Migration of a process instance was rejected
#[derive(Debug)]
pub struct ProcessInstanceMigrationFailed {
    /// The unique identifier of the process instance
    pub process_instance_id: ProcessInstanceId,

    /// Stable error code
    pub code: &'static str,

    /// Failure description
    pub message: String,

    /// The timestamp when the failure was reported
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for ProcessInstanceMigrationFailed {
    fn event_type(&self) -> &'static str {
        "process_instance.migration_failed"
    }

    fn process_instance_id(&self) -> &ProcessInstanceId {
        &self.process_instance_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}
