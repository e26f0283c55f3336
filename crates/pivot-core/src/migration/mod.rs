/// Migration instructions
pub mod instruction;

/// Migration plans and the plan builder
pub mod plan;

/// Activity type compatibility
pub mod compatibility;

/// Instruction validation rules
pub mod validation;

/// Validation reports
pub mod report;

/// Checks of a single instance against a plan
pub mod instance_validation;

/// Execution tree transformation
pub mod transformer;

/// Relocation of subscriptions, timers, incidents and external tasks
pub mod relocator;

/// Migration errors
pub mod error;

pub use error::MigrationError;
pub use instruction::MigrationInstruction;
pub use plan::{MigrationPlan, MigrationPlanBuilder};
pub use report::{MigratingProcessInstanceValidationReport, MigrationPlanValidationReport};
pub use transformer::{MigrationOperation, MigrationOutcome, MigrationTransformer};
