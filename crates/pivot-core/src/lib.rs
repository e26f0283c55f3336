//!
//! Pivot Core - Process instance migration engine
//!
//! This crate holds the process tree model, the runtime snapshot of a
//! process instance, and the machinery that moves running instances from
//! one process definition version to another: plan validation, the
//! execution-tree transformer with its event/timer/incident relocator, and
//! the batch runner.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Domain layer - process definitions, instances and their repositories
pub mod domain;

/// Migration plans, validation and the instance transformer
pub mod migration;

/// Application services - the migration runner
pub mod application;

/// Core types
pub mod types;

/// Error types
pub mod error;

/// Time source
pub mod clock;

/// Expression evaluation for event names and conditions
pub mod expression;

/// Runner configuration
pub mod config;

// Re-export key types
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::MigrationConfig;
pub use error::CoreError;
pub use expression::{ExpressionEvaluator, JmesPathExpressionEvaluator};
pub use types::{TypedValue, ValueType};

// Re-export main API types for easy use
pub use application::migration_service::{
    DomainEventHandler, InstanceMigrationFailure, MigrationBatch, MigrationExecutionBuilder,
    MigrationExecutionReport, MigrationService,
};
pub use domain::process_definition::{
    Activity, ActivityId, ActivityType, EventDefinition, EventKind, MultiInstanceMode,
    ProcessDefinition, ProcessDefinitionId,
};
pub use domain::process_instance::{ExecutionId, ProcessInstance, ProcessInstanceId};
pub use domain::repository::{
    ProcessDefinitionRepository, ProcessInstanceQuery, ProcessInstanceRepository,
};
pub use migration::{
    MigrationError, MigrationInstruction, MigrationPlan, MigrationPlanBuilder,
    MigrationPlanValidationReport, MigrationTransformer,
};
