//! Entering activities: creating executions and the triggers they wait on.
//!
//! [`InstanceStarter`] starts an instance directly before a set of
//! activities, creating the enclosing scope executions on the way. The
//! trigger helpers are shared with the migration transformer, which uses
//! them to subscribe events that only exist in the target definition.

use crate::clock::Clock;
use crate::domain::process_definition::{
    Activity, ActivityId, ActivityType, EventKind, MultiInstanceMode, ProcessDefinition,
};
use crate::domain::process_instance::{
    EventSubscription, ExecutionId, ExternalTask, ProcessInstance, ProcessInstanceId,
    SubscriptionKind, TimerJob, LOOP_COUNTER, NR_OF_ACTIVE_INSTANCES, NR_OF_COMPLETED_INSTANCES,
    NR_OF_INSTANCES,
};
use crate::expression::ExpressionEvaluator;
use crate::types::TypedValue;
use crate::CoreError;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;
use uuid::Uuid;

/// Default number of retries for new timer jobs
pub const DEFAULT_JOB_RETRIES: u32 = 3;

/// Identifies a trigger created for an event activity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreatedTrigger {
    /// An event subscription
    Subscription(String),
    /// A timer job
    Timer(String),
}

/// Create the subscription or timer job an event activity waits on,
/// owned by `owner`. Events without a persistent trigger create nothing.
pub fn create_trigger(
    instance: &mut ProcessInstance,
    event: &Activity,
    owner: &ExecutionId,
    evaluator: &dyn ExpressionEvaluator,
    variables: &Value,
    now: DateTime<Utc>,
) -> Result<Option<CreatedTrigger>, CoreError> {
    let Some(definition) = event.event_definition.as_ref() else {
        return Ok(None);
    };

    let kind = match definition.kind {
        EventKind::Message => SubscriptionKind::Message,
        EventKind::Signal => SubscriptionKind::Signal,
        EventKind::Conditional => SubscriptionKind::Conditional,
        EventKind::Timer => {
            let timer = definition.timer.as_ref().ok_or_else(|| {
                CoreError::TimerError(format!("Timer event {} has no timer definition", event.id))
            })?;
            let schedule = timer.schedule(now, evaluator, variables)?;
            let id = Uuid::new_v4().to_string();
            instance.timer_jobs.push(TimerJob {
                id: id.clone(),
                activity_id: event.id.clone(),
                execution_id: owner.clone(),
                process_definition_id: instance.process_definition_id.clone(),
                due_date: schedule.due_date,
                repeat: schedule.repeat,
                suspended: instance.suspended,
                retries: DEFAULT_JOB_RETRIES,
                exception_message: None,
            });
            return Ok(Some(CreatedTrigger::Timer(id)));
        }
        EventKind::Compensation | EventKind::Error | EventKind::Escalation => return Ok(None),
    };

    let event_name = match &definition.name {
        Some(name) => Some(evaluator.evaluate_to_string(name, variables)?),
        None => None,
    };
    let id = Uuid::new_v4().to_string();
    instance.event_subscriptions.push(EventSubscription {
        id: id.clone(),
        kind,
        event_name,
        activity_id: event.id.clone(),
        execution_id: owner.clone(),
        created_at: now,
    });
    Ok(Some(CreatedTrigger::Subscription(id)))
}

/// Create the triggers of every event scoped to `activity` (boundary events,
/// event sub process starts) plus the activity's own trigger when it waits
/// on one itself (receive tasks, intermediate catch events).
pub fn instantiate_triggers(
    instance: &mut ProcessInstance,
    definition: &ProcessDefinition,
    execution: &ExecutionId,
    activity: &ActivityId,
    evaluator: &dyn ExpressionEvaluator,
    now: DateTime<Utc>,
) -> Result<Vec<CreatedTrigger>, CoreError> {
    let variables = instance.variable_context(execution);
    let mut created = Vec::new();

    let mut events: Vec<&Activity> = definition.events_scoped_to(activity);
    if let Some(own) = definition
        .activity(activity)
        .filter(|a| definition.event_scope(&a.id) == Some(&a.id))
        .filter(|a| a.has_persistent_event_trigger())
    {
        events.insert(0, own);
    }

    for event in events {
        if let Some(trigger) = create_trigger(instance, event, execution, evaluator, &variables, now)? {
            created.push(trigger);
        }
    }

    if let Some(task) = definition
        .activity(activity)
        .filter(|a| a.activity_type == ActivityType::ExternalTask)
    {
        instance.external_tasks.push(ExternalTask {
            id: Uuid::new_v4().to_string(),
            activity_id: task.id.clone(),
            execution_id: execution.clone(),
            process_definition_id: instance.process_definition_id.clone(),
            process_definition_key: instance.process_definition_key.clone(),
            topic: task.topic.clone().unwrap_or_default(),
            worker_id: None,
            lock_expiration: None,
            retries: None,
            error_message: None,
            priority: 0,
        });
    }

    Ok(created)
}

/// Starts process instances directly before chosen activities
pub struct InstanceStarter<'a> {
    definition: &'a ProcessDefinition,
    evaluator: &'a dyn ExpressionEvaluator,
    clock: &'a dyn Clock,
}

impl<'a> InstanceStarter<'a> {
    /// Create a starter for one definition
    pub fn new(
        definition: &'a ProcessDefinition,
        evaluator: &'a dyn ExpressionEvaluator,
        clock: &'a dyn Clock,
    ) -> Self {
        Self {
            definition,
            evaluator,
            clock,
        }
    }

    /// Create an instance with its root variables and process-level triggers
    pub fn start(
        &self,
        id: ProcessInstanceId,
        business_key: Option<String>,
        variables: BTreeMap<String, TypedValue>,
    ) -> Result<ProcessInstance, CoreError> {
        let now = self.clock.now();
        let mut instance = ProcessInstance::new(id, self.definition, business_key, now);
        let root = instance.root_execution.clone();
        for (name, value) in variables.into_iter().filter(|(_, v)| !v.transient) {
            instance.set_variable_local(&root, name, value)?;
        }
        instantiate_triggers(
            &mut instance,
            self.definition,
            &root,
            &self.definition.root,
            self.evaluator,
            now,
        )?;
        debug!(
            process_instance_id = %instance.id,
            process_definition_id = %self.definition.id,
            "Started process instance"
        );
        Ok(instance)
    }

    /// Start an execution in `activity`, creating missing enclosing scopes
    pub fn start_before(
        &self,
        instance: &mut ProcessInstance,
        activity: &ActivityId,
    ) -> Result<ExecutionId, CoreError> {
        let target = self.mappable(activity)?;
        if target.is_multi_instance_body() {
            return Err(CoreError::ValidationError(format!(
                "Start the inner activity of {} with a number of instances instead",
                activity
            )));
        }
        let parent = self.ensure_scope_path(instance, activity)?;
        let execution = self.enter(instance, &parent, target)?;
        instance.recompute_concurrency(self.definition);
        Ok(execution)
    }

    /// Start a multi-instance activity with `instances` inner instances
    /// (one active at a time for sequential bodies). Returns the body execution.
    pub fn start_multi_instance(
        &self,
        instance: &mut ProcessInstance,
        inner: &ActivityId,
        instances: usize,
    ) -> Result<ExecutionId, CoreError> {
        let body = self
            .definition
            .enclosing_multi_instance_body(inner)
            .ok_or_else(|| {
                CoreError::ValidationError(format!("Activity {} is not multi-instance", inner))
            })?;
        let parent = self.ensure_scope_path(instance, &body.id)?;
        let body_execution = self.enter_body(instance, &parent, body, instances)?;
        instance.recompute_concurrency(self.definition);
        Ok(body_execution)
    }

    fn mappable(&self, activity: &ActivityId) -> Result<&'a Activity, CoreError> {
        self.definition.mappable_activity(activity).ok_or_else(|| {
            CoreError::ValidationError(format!("Activity {} does not exist", activity))
        })
    }

    /// Walk from the root to the flow scope of `activity`, reusing existing
    /// scope executions and creating the missing ones. Returns the execution
    /// of the flow scope.
    fn ensure_scope_path(
        &self,
        instance: &mut ProcessInstance,
        activity: &ActivityId,
    ) -> Result<ExecutionId, CoreError> {
        let mut path: Vec<ActivityId> = self
            .definition
            .ancestors(activity)
            .into_iter()
            .cloned()
            .collect();
        path.reverse();

        let mut current = instance.root_execution.clone();
        for scope in path.iter().skip(1) {
            let existing = instance
                .children_of(&current)
                .into_iter()
                .find(|e| e.activity_id == *scope && e.is_scope)
                .map(|e| e.id.clone());
            current = match existing {
                Some(id) => id,
                None => {
                    let scope_activity = self.mappable(scope)?;
                    if scope_activity.is_multi_instance_body() {
                        self.enter_body_without_inner(instance, &current, scope_activity, 1)?
                    } else {
                        self.enter(instance, &current, scope_activity)?
                    }
                }
            };
        }
        Ok(current)
    }

    fn enter(
        &self,
        instance: &mut ProcessInstance,
        parent: &ExecutionId,
        activity: &Activity,
    ) -> Result<ExecutionId, CoreError> {
        let execution = instance.add_execution(parent, activity.id.clone(), activity.is_scope)?;
        if let Some(loop_counter) = self.next_loop_counter(instance, parent) {
            instance.set_variable_local(&execution, LOOP_COUNTER, loop_counter.into())?;
        }
        instantiate_triggers(
            instance,
            self.definition,
            &execution,
            &activity.id,
            self.evaluator,
            self.clock.now(),
        )?;
        Ok(execution)
    }

    fn next_loop_counter(&self, instance: &ProcessInstance, parent: &ExecutionId) -> Option<i64> {
        let parent_execution = instance.execution(parent)?;
        let is_body = self
            .definition
            .activity(&parent_execution.activity_id)
            .map(|a| a.is_multi_instance_body())
            .unwrap_or(false);
        is_body.then(|| parent_execution.children.len() as i64 - 1)
    }

    fn enter_body_without_inner(
        &self,
        instance: &mut ProcessInstance,
        parent: &ExecutionId,
        body: &Activity,
        instances: usize,
    ) -> Result<ExecutionId, CoreError> {
        let execution = instance.add_execution(parent, body.id.clone(), true)?;
        let active = match body.activity_type {
            ActivityType::MultiInstanceBody(MultiInstanceMode::Sequential) => instances.min(1),
            _ => instances,
        };
        instance.set_variable_local(&execution, NR_OF_INSTANCES, (instances as i64).into())?;
        instance.set_variable_local(&execution, NR_OF_ACTIVE_INSTANCES, (active as i64).into())?;
        instance.set_variable_local(&execution, NR_OF_COMPLETED_INSTANCES, 0i64.into())?;
        instantiate_triggers(
            instance,
            self.definition,
            &execution,
            &body.id,
            self.evaluator,
            self.clock.now(),
        )?;
        Ok(execution)
    }

    fn enter_body(
        &self,
        instance: &mut ProcessInstance,
        parent: &ExecutionId,
        body: &Activity,
        instances: usize,
    ) -> Result<ExecutionId, CoreError> {
        let execution = self.enter_body_without_inner(instance, parent, body, instances)?;
        let inner = self.definition.inner_activity(&body.id).ok_or_else(|| {
            CoreError::ValidationError(format!("Multi-instance body {} has no inner activity", body.id))
        })?;
        let active = instance
            .execution(&execution)
            .and_then(|e| e.variable(NR_OF_ACTIVE_INSTANCES))
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        for _ in 0..active {
            self.enter(instance, &execution, inner)?;
        }
        Ok(execution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::domain::process_definition::EventDefinition;
    use crate::domain::timer::TimerDefinition;
    use crate::expression::JmesPathExpressionEvaluator;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn clock() -> FixedClock {
        FixedClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap())
    }

    #[test]
    fn test_start_before_creates_scope_path_and_boundary_triggers() {
        let def = ProcessDefinition::builder("process")
            .activity(Activity::sub_process("subProcess"))
            .activity(Activity::user_task("userTask").in_scope("subProcess"))
            .activity(Activity::boundary_event(
                "timer",
                "userTask",
                EventDefinition::timer(TimerDefinition::Duration("PT10M".into())),
            ))
            .activity(Activity::boundary_event(
                "message",
                "subProcess",
                EventDefinition::message("Message-${key}"),
            ))
            .build()
            .unwrap();
        let evaluator = JmesPathExpressionEvaluator::new();
        let clock = clock();
        let starter = InstanceStarter::new(&def, &evaluator, &clock);

        let mut variables = BTreeMap::new();
        variables.insert("key".to_string(), TypedValue::from("a"));
        let mut instance = starter
            .start(ProcessInstanceId::from("pi"), None, variables)
            .unwrap();
        let task = starter
            .start_before(&mut instance, &ActivityId::from("userTask"))
            .unwrap();

        assert_eq!(
            instance.activity_instance_tree().unwrap().describe(),
            "process[subProcess[userTask]]"
        );
        let timers = instance.timers_of(&task);
        assert_eq!(timers.len(), 1);
        assert_eq!(timers[0].due_date, clock.now() + Duration::minutes(10));

        let sub = instance.execution(&task).unwrap().parent_id.clone().unwrap();
        let subscriptions = instance.subscriptions_of(&sub);
        assert_eq!(subscriptions.len(), 1);
        assert_eq!(subscriptions[0].event_name.as_deref(), Some("Message-a"));
        instance.verify_against(&def).unwrap();
    }

    #[test]
    fn test_start_before_reuses_existing_scope() {
        let def = ProcessDefinition::builder("process")
            .activity(Activity::sub_process("subProcess"))
            .activity(Activity::user_task("a").in_scope("subProcess"))
            .activity(Activity::user_task("b").in_scope("subProcess"))
            .build()
            .unwrap();
        let evaluator = JmesPathExpressionEvaluator::new();
        let clock = clock();
        let starter = InstanceStarter::new(&def, &evaluator, &clock);
        let mut instance = starter
            .start(ProcessInstanceId::from("pi"), None, BTreeMap::new())
            .unwrap();
        let a = starter.start_before(&mut instance, &ActivityId::from("a")).unwrap();
        let b = starter.start_before(&mut instance, &ActivityId::from("b")).unwrap();

        assert_eq!(instance.executions_in(&ActivityId::from("subProcess")).len(), 1);
        assert!(instance.execution(&a).unwrap().is_concurrent);
        assert!(instance.execution(&b).unwrap().is_concurrent);
    }

    #[test]
    fn test_parallel_multi_instance_counters() {
        let def = ProcessDefinition::builder("process")
            .activity(Activity::user_task("userTask"))
            .multi_instance("userTask", MultiInstanceMode::Parallel)
            .build()
            .unwrap();
        let evaluator = JmesPathExpressionEvaluator::new();
        let clock = clock();
        let starter = InstanceStarter::new(&def, &evaluator, &clock);
        let mut instance = starter
            .start(ProcessInstanceId::from("pi"), None, BTreeMap::new())
            .unwrap();
        let body = starter
            .start_multi_instance(&mut instance, &ActivityId::from("userTask"), 3)
            .unwrap();

        let body_execution = instance.execution(&body).unwrap();
        assert_eq!(body_execution.variable(NR_OF_INSTANCES).unwrap().as_i64(), Some(3));
        assert_eq!(body_execution.variable(NR_OF_ACTIVE_INSTANCES).unwrap().as_i64(), Some(3));
        let mut counters: Vec<i64> = instance
            .children_of(&body)
            .iter()
            .map(|e| e.variable(LOOP_COUNTER).and_then(|v| v.as_i64()).unwrap())
            .collect();
        counters.sort();
        assert_eq!(counters, vec![0, 1, 2]);
        assert!(instance.children_of(&body).iter().all(|e| e.is_concurrent));
    }

    #[test]
    fn test_sequential_multi_instance_advances_on_completion() {
        let def = ProcessDefinition::builder("process")
            .activity(Activity::user_task("userTask"))
            .multi_instance("userTask", MultiInstanceMode::Sequential)
            .build()
            .unwrap();
        let evaluator = JmesPathExpressionEvaluator::new();
        let clock = clock();
        let starter = InstanceStarter::new(&def, &evaluator, &clock);
        let mut instance = starter
            .start(ProcessInstanceId::from("pi"), None, BTreeMap::new())
            .unwrap();
        let body = starter
            .start_multi_instance(&mut instance, &ActivityId::from("userTask"), 2)
            .unwrap();
        assert_eq!(instance.children_of(&body).len(), 1);

        let first = instance.children_of(&body)[0].id.clone();
        instance.complete_execution(&first, &def, clock.now()).unwrap();
        let second = instance.children_of(&body);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].variable(LOOP_COUNTER).unwrap().as_i64(), Some(1));

        let second = second[0].id.clone();
        instance.complete_execution(&second, &def, clock.now()).unwrap();
        assert!(instance.is_ended());
    }

    #[test]
    fn test_receive_task_and_external_task_triggers() {
        let def = ProcessDefinition::builder("process")
            .activity(Activity::receive_task("receiveTask", "Message"))
            .activity(Activity::external_task("externalTask", "foo"))
            .build()
            .unwrap();
        let evaluator = JmesPathExpressionEvaluator::new();
        let clock = clock();
        let starter = InstanceStarter::new(&def, &evaluator, &clock);
        let mut instance = starter
            .start(ProcessInstanceId::from("pi"), None, BTreeMap::new())
            .unwrap();
        let receive = starter
            .start_before(&mut instance, &ActivityId::from("receiveTask"))
            .unwrap();
        let external = starter
            .start_before(&mut instance, &ActivityId::from("externalTask"))
            .unwrap();

        assert_eq!(instance.subscriptions_of(&receive).len(), 1);
        assert_eq!(instance.external_tasks.len(), 1);
        assert_eq!(instance.external_tasks[0].execution_id, external);
        assert_eq!(instance.external_tasks[0].topic, "foo");
    }

    #[test]
    fn test_transient_start_variables_are_not_persisted() {
        let def = ProcessDefinition::builder("process")
            .activity(Activity::user_task("userTask"))
            .build()
            .unwrap();
        let evaluator = JmesPathExpressionEvaluator::new();
        let clock = clock();
        let starter = InstanceStarter::new(&def, &evaluator, &clock);
        let mut variables = BTreeMap::new();
        variables.insert("t".to_string(), TypedValue::transient(json!(1)));
        variables.insert("p".to_string(), TypedValue::new(json!(2)));
        let instance = starter
            .start(ProcessInstanceId::from("pi"), None, variables)
            .unwrap();
        let root = instance.root().unwrap();
        assert!(root.variable("t").is_none());
        assert!(root.variable("p").is_some());
    }
}
