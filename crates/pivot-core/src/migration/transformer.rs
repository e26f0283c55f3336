//! Applies a migration plan to one process instance snapshot.
//!
//! The transformer works on a copy of the snapshot and never touches
//! storage. The execution tree is rebuilt top-down:
//!
//! - an execution whose activity is mapped is moved to the target activity,
//!   under the execution of its closest mapped ancestor; target scopes that
//!   have no counterpart in the source are synthesized on the way,
//! - an execution whose activity is not mapped but which has mapped
//!   descendants is dropped together with its local variables and its
//!   children are lifted to its parent,
//! - an execution without any mapped activity below it is removed with its
//!   whole subtree.
//!
//! Afterwards the plan variables are written to the root execution and the
//! [`Relocator`](crate::migration::relocator::Relocator) moves every
//! subscription, timer, incident and external task to its new coordinates.

use crate::clock::Clock;
use crate::domain::events::ProcessInstanceMigrated;
use crate::domain::process_definition::ActivityId;
use crate::domain::process_instance::{ExecutionId, ProcessInstance};
use crate::expression::ExpressionEvaluator;
use crate::migration::error::MigrationError;
use crate::migration::plan::MigrationPlan;
use crate::migration::relocator::Relocator;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// A single change the transformer applied to the snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationOperation {
    /// An execution moved to its target activity
    MigrateExecution {
        /// Execution
        execution_id: ExecutionId,
        /// Activity before
        source_activity_id: ActivityId,
        /// Activity after
        target_activity_id: ActivityId,
    },
    /// A scope execution was created for a target scope without source counterpart
    CreateScopeExecution {
        /// New execution
        execution_id: ExecutionId,
        /// Target scope activity
        activity_id: ActivityId,
    },
    /// An execution was removed
    RemoveExecution {
        /// Execution
        execution_id: ExecutionId,
        /// Its source activity
        activity_id: ActivityId,
    },
    /// A subscription moved to new coordinates
    RelocateSubscription {
        /// Subscription
        subscription_id: String,
        /// New owning execution
        execution_id: ExecutionId,
        /// New event activity
        activity_id: ActivityId,
    },
    /// A subscription was created for an event added by the target definition
    CreateSubscription {
        /// Subscription
        subscription_id: String,
        /// Owning execution
        execution_id: ExecutionId,
        /// Event activity
        activity_id: ActivityId,
    },
    /// A subscription was deleted
    DeleteSubscription {
        /// Subscription
        subscription_id: String,
    },
    /// A timer job moved to new coordinates
    RelocateTimer {
        /// Job
        job_id: String,
        /// New owning execution
        execution_id: ExecutionId,
        /// New timer activity
        activity_id: ActivityId,
        /// Due date after migration
        due_date: DateTime<Utc>,
    },
    /// A timer job was created for an event added by the target definition
    CreateTimer {
        /// Job
        job_id: String,
        /// Owning execution
        execution_id: ExecutionId,
        /// Timer activity
        activity_id: ActivityId,
    },
    /// A timer job was deleted
    DeleteTimer {
        /// Job
        job_id: String,
    },
    /// An open incident moved to new coordinates
    RelocateIncident {
        /// Incident
        incident_id: String,
        /// New owning execution
        execution_id: ExecutionId,
        /// New activity
        activity_id: ActivityId,
    },
    /// An open incident was closed together with its activity instance
    DeleteIncident {
        /// Incident
        incident_id: String,
    },
    /// An external task moved to its target activity
    RelocateExternalTask {
        /// Task
        task_id: String,
        /// New activity
        activity_id: ActivityId,
    },
    /// An external task was deleted
    DeleteExternalTask {
        /// Task
        task_id: String,
    },
    /// A plan variable was written to the root execution
    SetVariable {
        /// Variable name
        name: String,
    },
    /// A local variable disappeared with its removed scope execution
    DiscardVariable {
        /// Execution that held it
        execution_id: ExecutionId,
        /// Variable name
        name: String,
    },
}

/// Result of migrating one snapshot
#[derive(Debug, Clone)]
pub struct MigrationOutcome {
    /// The migrated snapshot, carrying a recorded `ProcessInstanceMigrated` event
    pub instance: ProcessInstance,

    /// Operations applied, in order
    pub operations: Vec<MigrationOperation>,
}

/// Applies a plan to instance snapshots
pub struct MigrationTransformer<'a> {
    plan: &'a MigrationPlan,
    evaluator: &'a dyn ExpressionEvaluator,
    clock: &'a dyn Clock,
}

/// Fate of a source execution
enum Fate {
    Migrate(ActivityId),
    Lift,
    Remove,
}

/// Mutable state of one transformation
struct TreeMigration<'a> {
    plan: &'a MigrationPlan,
    original: &'a ProcessInstance,
    next: ProcessInstance,
    operations: Vec<MigrationOperation>,
    synthesized: HashMap<(ExecutionId, ActivityId), ExecutionId>,
    entered: Vec<ExecutionId>,
    now: DateTime<Utc>,
}

impl<'a> MigrationTransformer<'a> {
    /// Create a transformer for one plan
    pub fn new(
        plan: &'a MigrationPlan,
        evaluator: &'a dyn ExpressionEvaluator,
        clock: &'a dyn Clock,
    ) -> Self {
        Self {
            plan,
            evaluator,
            clock,
        }
    }

    /// Migrate a snapshot. The input is left untouched; on error no partial
    /// result escapes.
    pub fn migrate(&self, instance: &ProcessInstance) -> Result<MigrationOutcome, MigrationError> {
        if instance.process_definition_id != *self.plan.source_process_definition_id() {
            return Err(MigrationError::WrongProcessDefinition {
                instance_id: instance.id.clone(),
                expected: self.plan.source_process_definition_id().clone(),
                actual: instance.process_definition_id.clone(),
            });
        }

        let now = self.clock.now();
        let mut migration = TreeMigration {
            plan: self.plan,
            original: instance,
            next: instance.clone(),
            operations: Vec::new(),
            synthesized: HashMap::new(),
            entered: Vec::new(),
            now,
        };

        let root = instance.root_execution.clone();
        migration.migrate_root(&root)?;
        migration.place_children(&root, &root)?;

        let transient = migration.apply_variables()?;

        let TreeMigration {
            mut next,
            mut operations,
            entered,
            ..
        } = migration;

        let target = self.plan.target();
        next.process_definition_id = target.id.clone();
        next.process_definition_key = target.key.clone();

        let relocator = Relocator::new(self.plan, self.evaluator, now, &transient);
        relocator.relocate(instance, &mut next, &mut operations)?;
        relocator.instantiate_added_events(&mut next, &entered, &mut operations)?;

        next.recompute_concurrency(target);
        next.updated_at = now;

        next.verify_against(target)
            .map_err(|e| MigrationError::InvariantViolation {
                instance_id: instance.id.clone(),
                message: e.to_string(),
            })?;

        next.record_event(Box::new(ProcessInstanceMigrated {
            process_instance_id: next.id.clone(),
            source_process_definition_id: instance.process_definition_id.clone(),
            target_process_definition_id: target.id.clone(),
            operation_count: operations.len(),
            timestamp: now,
        }));

        debug!(
            process_instance_id = %instance.id,
            target_process_definition_id = %target.id,
            operations = operations.len(),
            "Transformed process instance"
        );
        Ok(MigrationOutcome {
            instance: next,
            operations,
        })
    }
}

impl<'a> TreeMigration<'a> {
    fn invariant(&self, message: impl Into<String>) -> MigrationError {
        MigrationError::InvariantViolation {
            instance_id: self.original.id.clone(),
            message: message.into(),
        }
    }

    fn migrate_root(&mut self, root: &ExecutionId) -> Result<(), MigrationError> {
        let target_root = self.plan.target().root.clone();
        let source_root = self.plan.source().root.clone();
        let execution = self
            .next
            .execution_mut(root)
            .ok_or_else(|| MigrationError::InvariantViolation {
                instance_id: self.original.id.clone(),
                message: format!("Root execution {} is missing", root),
            })?;
        execution.activity_id = target_root.clone();
        self.operations.push(MigrationOperation::MigrateExecution {
            execution_id: root.clone(),
            source_activity_id: source_root,
            target_activity_id: target_root,
        });
        self.entered.push(root.clone());
        Ok(())
    }

    fn fate(&self, execution: &ExecutionId) -> Fate {
        let Some(source_execution) = self.original.execution(execution) else {
            return Fate::Remove;
        };
        if let Some(target) = self.plan.target_of(&source_execution.activity_id) {
            return Fate::Migrate(target.clone());
        }
        let has_mapped_descendant = self
            .original
            .subtree(execution)
            .iter()
            .skip(1)
            .filter_map(|id| self.original.execution(id))
            .any(|e| self.plan.target_of(&e.activity_id).is_some());
        if has_mapped_descendant {
            Fate::Lift
        } else {
            Fate::Remove
        }
    }

    /// Place the source children of `source_parent` under `new_parent`
    fn place_children(
        &mut self,
        source_parent: &ExecutionId,
        new_parent: &ExecutionId,
    ) -> Result<(), MigrationError> {
        let children = self
            .original
            .execution(source_parent)
            .map(|e| e.children.clone())
            .unwrap_or_default();

        for child in children {
            match self.fate(&child) {
                Fate::Migrate(target_activity) => {
                    self.migrate_execution(&child, new_parent, target_activity)?;
                    self.place_children(&child, &child)?;
                }
                Fate::Lift => {
                    self.lift_execution(&child)?;
                    self.place_children(&child, new_parent)?;
                }
                Fate::Remove => self.remove_execution(&child),
            }
        }
        Ok(())
    }

    fn migrate_execution(
        &mut self,
        id: &ExecutionId,
        new_parent: &ExecutionId,
        target_activity: ActivityId,
    ) -> Result<(), MigrationError> {
        let target = self.plan.target();
        let parent_activity = self
            .next
            .execution(new_parent)
            .map(|e| e.activity_id.clone())
            .ok_or_else(|| self.invariant(format!("Execution {} is missing", new_parent)))?;
        if !target.is_ancestor(&parent_activity, &target_activity) {
            return Err(self.invariant(format!(
                "Activity instance {} cannot move to '{}' below an instance of '{}'",
                id, target_activity, parent_activity
            )));
        }

        let mut scope_path: Vec<ActivityId> = target
            .ancestors(&target_activity)
            .into_iter()
            .take_while(|a| **a != parent_activity)
            .cloned()
            .collect();
        scope_path.reverse();

        let mut parent = new_parent.clone();
        for scope in scope_path {
            parent = self.ensure_scope_execution(&parent, scope)?;
        }

        let mut execution = self
            .next
            .detach_execution(id)
            .ok_or_else(|| self.invariant(format!("Execution {} is missing", id)))?;
        let source_activity = std::mem::replace(&mut execution.activity_id, target_activity.clone());
        execution.is_scope = target
            .activity(&target_activity)
            .map(|a| a.is_scope)
            .unwrap_or(execution.is_scope);
        self.next
            .attach_execution(&parent, execution)
            .map_err(|e| self.invariant(e.to_string()))?;

        self.operations.push(MigrationOperation::MigrateExecution {
            execution_id: id.clone(),
            source_activity_id: source_activity,
            target_activity_id: target_activity,
        });
        self.entered.push(id.clone());
        Ok(())
    }

    /// Reuse or create the execution of a target scope that has no source counterpart
    fn ensure_scope_execution(
        &mut self,
        parent: &ExecutionId,
        scope: ActivityId,
    ) -> Result<ExecutionId, MigrationError> {
        let key = (parent.clone(), scope.clone());
        if let Some(existing) = self.synthesized.get(&key) {
            return Ok(existing.clone());
        }
        let id = self
            .next
            .add_execution(parent, scope.clone(), true)
            .map_err(|e| self.invariant(e.to_string()))?;
        self.operations.push(MigrationOperation::CreateScopeExecution {
            execution_id: id.clone(),
            activity_id: scope,
        });
        self.synthesized.insert(key, id.clone());
        self.entered.push(id.clone());
        Ok(id)
    }

    fn lift_execution(&mut self, id: &ExecutionId) -> Result<(), MigrationError> {
        let execution = self
            .next
            .detach_execution(id)
            .ok_or_else(|| self.invariant(format!("Execution {} is missing", id)))?;
        for name in execution.variables.keys() {
            self.operations.push(MigrationOperation::DiscardVariable {
                execution_id: id.clone(),
                name: name.clone(),
            });
        }
        self.operations.push(MigrationOperation::RemoveExecution {
            execution_id: id.clone(),
            activity_id: execution.activity_id,
        });
        Ok(())
    }

    fn remove_execution(&mut self, id: &ExecutionId) {
        let ids: HashSet<ExecutionId> = self.next.subtree(id).into_iter().collect();
        for subscription in self
            .next
            .event_subscriptions
            .iter()
            .filter(|s| ids.contains(&s.execution_id))
        {
            self.operations.push(MigrationOperation::DeleteSubscription {
                subscription_id: subscription.id.clone(),
            });
        }
        for job in self
            .next
            .timer_jobs
            .iter()
            .filter(|t| ids.contains(&t.execution_id))
        {
            self.operations.push(MigrationOperation::DeleteTimer {
                job_id: job.id.clone(),
            });
        }
        for task in self
            .next
            .external_tasks
            .iter()
            .filter(|t| ids.contains(&t.execution_id))
        {
            self.operations.push(MigrationOperation::DeleteExternalTask {
                task_id: task.id.clone(),
            });
        }
        for incident in self
            .next
            .open_incidents()
            .into_iter()
            .filter(|i| ids.contains(&i.execution_id))
        {
            self.operations.push(MigrationOperation::DeleteIncident {
                incident_id: incident.id.clone(),
            });
        }

        for removed in self.next.remove_subtree(id, self.now) {
            self.operations.push(MigrationOperation::RemoveExecution {
                execution_id: removed.id,
                activity_id: removed.activity_id,
            });
        }
    }

    /// Write persistent plan variables to the root; return the transient ones
    fn apply_variables(&mut self) -> Result<serde_json::Map<String, serde_json::Value>, MigrationError> {
        let root = self.next.root_execution.clone();
        let mut transient = serde_json::Map::new();
        for (name, value) in self.plan.variables() {
            if value.transient {
                transient.insert(name.clone(), value.value.clone());
                continue;
            }
            self.next
                .set_variable_local(&root, name.clone(), value.clone())
                .map_err(|e| self.invariant(e.to_string()))?;
            self.operations
                .push(MigrationOperation::SetVariable { name: name.clone() });
        }
        Ok(transient)
    }
}
