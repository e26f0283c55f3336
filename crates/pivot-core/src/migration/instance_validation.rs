//! Preconditions a running instance must meet before it can be migrated
//! with a given plan. These depend on runtime state (active activities,
//! registered compensation handlers) and are therefore checked per instance.

use crate::domain::process_definition::{ActivityType, EventKind};
use crate::domain::process_instance::{ProcessInstance, SubscriptionKind};
use crate::migration::plan::MigrationPlan;
use crate::migration::report::MigratingProcessInstanceValidationReport;

/// Check `instance` against `plan`, collecting every failure
pub fn validate_instance(
    instance: &ProcessInstance,
    plan: &MigrationPlan,
) -> Result<(), MigratingProcessInstanceValidationReport> {
    let source = plan.source();
    let mut report = MigratingProcessInstanceValidationReport::new(instance.id.clone());

    for execution in instance.executions.values() {
        let Some(activity) = source.activity(&execution.activity_id) else {
            continue;
        };
        let throws_compensation = matches!(
            activity.activity_type,
            ActivityType::IntermediateThrowEvent | ActivityType::EndEvent
        ) && activity.event_kind() == Some(EventKind::Compensation);
        if throws_compensation {
            report.add_failure(
                &execution.activity_id,
                &execution.id,
                "The type of the source activity is not supported for activity instance migration",
            );
        }
    }

    for subscription in instance
        .event_subscriptions
        .iter()
        .filter(|s| s.kind == SubscriptionKind::Compensate)
    {
        let Some(trigger) = source.compensation_trigger_for(&subscription.activity_id) else {
            // subscription of a completed scope, relocated with the scope itself
            if plan.instruction_for(&subscription.activity_id).is_none() {
                report.add_failure(
                    &source.root,
                    &instance.root_execution,
                    format!(
                        "Cannot migrate subscription for compensation of scope '{}'. There is no migration instruction for the scope",
                        subscription.activity_id
                    ),
                );
            }
            continue;
        };
        if plan.instruction_for(&trigger.id).is_some() {
            continue;
        }
        let trigger_kind = if trigger.is_compensation_boundary() {
            "compensation boundary event"
        } else {
            "compensation start event"
        };
        report.add_failure(
            &source.root,
            &instance.root_execution,
            format!(
                "Cannot migrate subscription for compensation handler '{}'. There is no migration instruction for the {}",
                subscription.activity_id, trigger_kind
            ),
        );
    }

    if report.has_failures() {
        Err(report)
    } else {
        Ok(())
    }
}
