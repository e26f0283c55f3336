//! Moves the entities attached to a migrated execution tree to their new
//! coordinates and subscribes events that only the target definition declares.
//!
//! An entity whose owning execution was removed during tree transformation
//! has already been dropped together with it. Owners that were lifted out of
//! the tree hand their entities to the nearest surviving ancestor.

use crate::domain::instantiation::{create_trigger, CreatedTrigger};
use crate::domain::process_definition::{Activity, ActivityId};
use crate::domain::process_instance::{
    EventSubscription, ExecutionId, IncidentState, ProcessInstance, SubscriptionKind,
};
use crate::expression::ExpressionEvaluator;
use crate::migration::error::MigrationError;
use crate::migration::plan::MigrationPlan;
use crate::migration::transformer::MigrationOperation;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{debug, trace};

/// Relocates subscriptions, timers, incidents and external tasks
pub struct Relocator<'a> {
    plan: &'a MigrationPlan,
    evaluator: &'a dyn ExpressionEvaluator,
    now: DateTime<Utc>,
    transient: &'a Map<String, Value>,
}

impl<'a> Relocator<'a> {
    /// Create a relocator. `transient` holds plan variables that are visible
    /// while re-evaluating triggers but never stored.
    pub fn new(
        plan: &'a MigrationPlan,
        evaluator: &'a dyn ExpressionEvaluator,
        now: DateTime<Utc>,
        transient: &'a Map<String, Value>,
    ) -> Self {
        Self {
            plan,
            evaluator,
            now,
            transient,
        }
    }

    /// Relocate every entity of `next`; `original` is the snapshot before
    /// the tree transformation
    pub fn relocate(
        &self,
        original: &ProcessInstance,
        next: &mut ProcessInstance,
        operations: &mut Vec<MigrationOperation>,
    ) -> Result<(), MigrationError> {
        self.relocate_subscriptions(original, next, operations)?;
        self.relocate_timers(original, next, operations)?;
        self.relocate_incidents(original, next, operations);
        self.relocate_external_tasks(next, operations);
        Ok(())
    }

    /// Subscribe target events scoped to the entered executions that no
    /// instruction maps onto
    pub fn instantiate_added_events(
        &self,
        next: &mut ProcessInstance,
        entered: &[ExecutionId],
        operations: &mut Vec<MigrationOperation>,
    ) -> Result<(), MigrationError> {
        let target = self.plan.target();
        for execution in entered {
            let Some(activity) = next.execution(execution).map(|e| e.activity_id.clone()) else {
                continue;
            };

            let mut events: Vec<&Activity> = target.events_scoped_to(&activity);
            if let Some(own) = target
                .activity(&activity)
                .filter(|a| target.event_scope(&a.id) == Some(&a.id))
                .filter(|a| a.has_persistent_event_trigger())
            {
                events.insert(0, own);
            }

            for event in events
                .into_iter()
                .filter(|e| !self.plan.is_target_of_instruction(&e.id))
            {
                let variables = self.variables(next, execution);
                let created =
                    create_trigger(next, event, execution, self.evaluator, &variables, self.now)?;
                match created {
                    Some(CreatedTrigger::Subscription(id)) => {
                        operations.push(MigrationOperation::CreateSubscription {
                            subscription_id: id,
                            execution_id: execution.clone(),
                            activity_id: event.id.clone(),
                        })
                    }
                    Some(CreatedTrigger::Timer(id)) => {
                        operations.push(MigrationOperation::CreateTimer {
                            job_id: id,
                            execution_id: execution.clone(),
                            activity_id: event.id.clone(),
                        })
                    }
                    None => {}
                }
                debug!(
                    process_instance_id = %next.id,
                    activity_id = %event.id,
                    "Added event trigger"
                );
            }
        }
        Ok(())
    }

    /// Variable context of an execution with the transient plan variables on top
    fn variables(&self, instance: &ProcessInstance, execution: &ExecutionId) -> Value {
        let mut context = instance.variable_context(execution);
        if let Value::Object(map) = &mut context {
            for (name, value) in self.transient {
                map.insert(name.clone(), value.clone());
            }
        }
        context
    }

    /// The owner itself when it survived, otherwise its nearest source
    /// ancestor that is still part of the tree
    fn surviving_owner(
        original: &ProcessInstance,
        next: &ProcessInstance,
        owner: &ExecutionId,
    ) -> Option<ExecutionId> {
        if next.execution(owner).is_some() {
            return Some(owner.clone());
        }
        original
            .ancestors_of(owner)
            .into_iter()
            .find(|e| next.execution(&e.id).is_some())
            .map(|e| e.id.clone())
    }

    /// Execution that should own the trigger of target event `event`: the
    /// nearest execution, starting at `from`, that runs the event's scope
    fn event_owner(&self, next: &ProcessInstance, from: &ExecutionId, event: &ActivityId) -> ExecutionId {
        let Some(scope) = self.plan.target().event_scope(event) else {
            return from.clone();
        };
        next.execution(from)
            .into_iter()
            .chain(next.ancestors_of(from))
            .find(|e| e.activity_id == *scope)
            .map(|e| e.id.clone())
            .unwrap_or_else(|| from.clone())
    }

    fn relocate_subscriptions(
        &self,
        original: &ProcessInstance,
        next: &mut ProcessInstance,
        operations: &mut Vec<MigrationOperation>,
    ) -> Result<(), MigrationError> {
        let subscriptions = std::mem::take(&mut next.event_subscriptions);
        let mut kept = Vec::with_capacity(subscriptions.len());

        for subscription in subscriptions {
            let relocated = if subscription.kind == SubscriptionKind::Compensate {
                self.relocate_compensation(original, next, subscription)
            } else {
                self.relocate_event_subscription(original, next, subscription)?
            };
            match relocated {
                Ok(subscription) => {
                    operations.push(MigrationOperation::RelocateSubscription {
                        subscription_id: subscription.id.clone(),
                        execution_id: subscription.execution_id.clone(),
                        activity_id: subscription.activity_id.clone(),
                    });
                    kept.push(subscription);
                }
                Err(subscription_id) => {
                    trace!(subscription_id = %subscription_id, "Deleting subscription");
                    operations.push(MigrationOperation::DeleteSubscription { subscription_id });
                }
            }
        }

        next.event_subscriptions = kept;
        Ok(())
    }

    /// `Ok(Err(id))` means the subscription is dropped
    fn relocate_event_subscription(
        &self,
        original: &ProcessInstance,
        next: &ProcessInstance,
        mut subscription: EventSubscription,
    ) -> Result<Result<EventSubscription, String>, MigrationError> {
        let Some(instruction) = self.plan.instruction_for(&subscription.activity_id) else {
            return Ok(Err(subscription.id));
        };
        let Some(survivor) = Self::surviving_owner(original, next, &subscription.execution_id)
        else {
            return Ok(Err(subscription.id));
        };
        let target_event = instruction.target_activity_id.clone();
        let owner = self.event_owner(next, &survivor, &target_event);

        if instruction.update_event_trigger {
            let name = self
                .plan
                .target()
                .activity(&target_event)
                .and_then(|a| a.event_definition.as_ref())
                .and_then(|d| d.name.as_ref());
            if let Some(name) = name {
                let variables = self.variables(next, &owner);
                subscription.event_name = Some(self.evaluator.evaluate_to_string(name, &variables)?);
            }
        }

        subscription.activity_id = target_event;
        subscription.execution_id = owner;
        Ok(Ok(subscription))
    }

    fn relocate_compensation(
        &self,
        original: &ProcessInstance,
        next: &ProcessInstance,
        mut subscription: EventSubscription,
    ) -> Result<EventSubscription, String> {
        let source = self.plan.source();
        let target = self.plan.target();
        let handler = match source.compensation_trigger_for(&subscription.activity_id) {
            Some(trigger) => self
                .plan
                .instruction_for(&trigger.id)
                .and_then(|i| target.activity(&i.target_activity_id))
                .and_then(|trigger| target.compensation_handler_of(trigger)),
            // completed scope whose handlers can still be compensated
            None => self
                .plan
                .instruction_for(&subscription.activity_id)
                .map(|i| &i.target_activity_id),
        }
        .cloned();
        let owner = Self::surviving_owner(original, next, &subscription.execution_id);

        match (handler, owner) {
            (Some(handler), Some(owner)) => {
                subscription.activity_id = handler;
                subscription.execution_id = owner;
                Ok(subscription)
            }
            _ => Err(subscription.id),
        }
    }

    fn relocate_timers(
        &self,
        original: &ProcessInstance,
        next: &mut ProcessInstance,
        operations: &mut Vec<MigrationOperation>,
    ) -> Result<(), MigrationError> {
        let target = self.plan.target();
        let jobs = std::mem::take(&mut next.timer_jobs);
        let mut kept = Vec::with_capacity(jobs.len());

        for mut job in jobs {
            let instruction = self.plan.instruction_for(&job.activity_id);
            let survivor = Self::surviving_owner(original, next, &job.execution_id);
            let (Some(instruction), Some(survivor)) = (instruction, survivor) else {
                operations.push(MigrationOperation::DeleteTimer { job_id: job.id });
                continue;
            };

            let target_event = instruction.target_activity_id.clone();
            let owner = self.event_owner(next, &survivor, &target_event);
            if instruction.update_event_trigger {
                let timer = target
                    .activity(&target_event)
                    .and_then(|a| a.event_definition.as_ref())
                    .and_then(|d| d.timer.as_ref());
                if let Some(timer) = timer {
                    let variables = self.variables(next, &owner);
                    let schedule = timer.schedule(self.now, self.evaluator, &variables)?;
                    job.due_date = schedule.due_date;
                    job.repeat = schedule.repeat;
                }
            }

            job.activity_id = target_event;
            job.execution_id = owner;
            job.process_definition_id = target.id.clone();
            job.suspended = next.suspended;
            operations.push(MigrationOperation::RelocateTimer {
                job_id: job.id.clone(),
                execution_id: job.execution_id.clone(),
                activity_id: job.activity_id.clone(),
                due_date: job.due_date,
            });
            kept.push(job);
        }

        next.timer_jobs = kept;
        Ok(())
    }

    fn relocate_incidents(
        &self,
        original: &ProcessInstance,
        next: &mut ProcessInstance,
        operations: &mut Vec<MigrationOperation>,
    ) {
        let target_id = self.plan.target().id.clone();
        let root = next.root_execution.clone();

        let moves: Vec<(usize, ExecutionId, ActivityId)> = next
            .incidents
            .iter()
            .enumerate()
            .filter(|(_, i)| i.state == IncidentState::Open)
            .map(|(index, incident)| {
                let owner = Self::surviving_owner(original, next, &incident.execution_id)
                    .unwrap_or_else(|| root.clone());
                let activity = self
                    .plan
                    .target_of(&incident.activity_id)
                    .cloned()
                    .or_else(|| next.execution(&owner).map(|e| e.activity_id.clone()))
                    .unwrap_or_else(|| self.plan.target().root.clone());
                (index, owner, activity)
            })
            .collect();

        for (index, owner, activity) in moves {
            if let Some(incident) = next.incidents.get_mut(index) {
                incident.execution_id = owner;
                incident.activity_id = activity;
                incident.process_definition_id = target_id.clone();
                operations.push(MigrationOperation::RelocateIncident {
                    incident_id: incident.id.clone(),
                    execution_id: incident.execution_id.clone(),
                    activity_id: incident.activity_id.clone(),
                });
            }
        }
    }

    fn relocate_external_tasks(&self, next: &mut ProcessInstance, operations: &mut Vec<MigrationOperation>) {
        let target = self.plan.target();
        let tasks = std::mem::take(&mut next.external_tasks);
        let mut kept = Vec::with_capacity(tasks.len());

        for mut task in tasks {
            let owner_alive = next.execution(&task.execution_id).is_some();
            match self.plan.target_of(&task.activity_id) {
                Some(activity) if owner_alive => {
                    task.activity_id = activity.clone();
                    task.process_definition_id = target.id.clone();
                    task.process_definition_key = target.key.clone();
                    operations.push(MigrationOperation::RelocateExternalTask {
                        task_id: task.id.clone(),
                        activity_id: task.activity_id.clone(),
                    });
                    kept.push(task);
                }
                _ => operations.push(MigrationOperation::DeleteExternalTask { task_id: task.id }),
            }
        }

        next.external_tasks = kept;
    }
}
