//! Runtime snapshot of a running process instance.
//!
//! The snapshot is a tree of executions (one per activity instance, rooted
//! at the process instance itself) plus the entities attached to it:
//! event subscriptions, timer jobs, incidents and external tasks. Every
//! attached entity references an execution of the same snapshot.

use crate::domain::events::{DomainEvent, ProcessInstanceCompleted, ProcessInstanceStarted};
use crate::domain::process_definition::{
    ActivityId, ActivityType, MultiInstanceMode, ProcessDefinition, ProcessDefinitionId,
};
use crate::types::{string_id, TypedValue};
use crate::CoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

string_id!(
    /// Value object: Process instance ID
    ProcessInstanceId
);

string_id!(
    /// Value object: Execution ID
    ExecutionId
);

/// Number of instances a multi-instance body creates
pub const NR_OF_INSTANCES: &str = "nrOfInstances";
/// Number of inner instances still running
pub const NR_OF_ACTIVE_INSTANCES: &str = "nrOfActiveInstances";
/// Number of inner instances already completed
pub const NR_OF_COMPLETED_INSTANCES: &str = "nrOfCompletedInstances";
/// Index of an inner multi-instance execution
pub const LOOP_COUNTER: &str = "loopCounter";

/// Lifecycle state of a process instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessInstanceState {
    /// Instance has active executions
    Active,
    /// Instance ran to its end
    Completed,
}

/// One activity instance inside the execution tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    /// Unique identifier
    pub id: ExecutionId,

    /// Parent execution; `None` only for the root
    pub parent_id: Option<ExecutionId>,

    /// Activity this execution is currently in
    pub activity_id: ActivityId,

    /// Whether this execution owns a scope
    pub is_scope: bool,

    /// Whether this execution runs alongside siblings
    pub is_concurrent: bool,

    /// Child executions in creation order
    pub children: Vec<ExecutionId>,

    /// Local variables
    pub variables: BTreeMap<String, TypedValue>,
}

impl Execution {
    fn new(
        id: ExecutionId,
        parent_id: Option<ExecutionId>,
        activity_id: ActivityId,
        is_scope: bool,
    ) -> Self {
        Self {
            id,
            parent_id,
            activity_id,
            is_scope,
            is_concurrent: false,
            children: Vec::new(),
            variables: BTreeMap::new(),
        }
    }

    /// Read a local variable
    pub fn variable(&self, name: &str) -> Option<&TypedValue> {
        self.variables.get(name)
    }
}

/// Kind of a named event subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriptionKind {
    /// Waits for a correlated message
    Message,
    /// Waits for a broadcast signal
    Signal,
    /// Waits for a condition to become true
    Conditional,
    /// Registered compensation handler
    Compensate,
}

/// A named wait registered by an execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSubscription {
    /// Unique identifier
    pub id: String,

    /// Subscription kind
    pub kind: SubscriptionKind,

    /// Resolved message/signal name
    pub event_name: Option<String>,

    /// Event activity this subscription triggers (the handler for compensation)
    pub activity_id: ActivityId,

    /// Owning execution
    pub execution_id: ExecutionId,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

/// A scheduled timer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerJob {
    /// Unique identifier
    pub id: String,

    /// Timer event activity
    pub activity_id: ActivityId,

    /// Owning execution
    pub execution_id: ExecutionId,

    /// Definition the job belongs to
    pub process_definition_id: ProcessDefinitionId,

    /// When the timer fires
    pub due_date: DateTime<Utc>,

    /// Repeat expression for cycle timers
    pub repeat: Option<String>,

    /// Whether the job is suspended
    pub suspended: bool,

    /// Remaining retries
    pub retries: u32,

    /// Last failure message
    pub exception_message: Option<String>,
}

/// Kind of incident
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IncidentType {
    /// A job ran out of retries
    FailedJob,
    /// An external task ran out of retries
    FailedExternalTask,
    /// User-defined incident type
    Custom(String),
}

/// Resolution state of an incident
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IncidentState {
    /// Needs attention
    Open,
    /// Resolved by an operator
    Resolved,
    /// Removed together with the activity instance it belonged to
    Deleted,
}

/// A recorded failure attached to an execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incident {
    /// Unique identifier
    pub id: String,

    /// Kind of incident
    pub incident_type: IncidentType,

    /// Failure description
    pub message: Option<String>,

    /// Id of the failed job or external task
    pub configuration: Option<String>,

    /// Activity the incident occurred in
    pub activity_id: ActivityId,

    /// Owning execution
    pub execution_id: ExecutionId,

    /// Definition the incident belongs to
    pub process_definition_id: ProcessDefinitionId,

    /// Resolution state
    pub state: IncidentState,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// When the incident left the open state
    pub resolved_at: Option<DateTime<Utc>>,
}

/// A unit of work fetched and completed by an external worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalTask {
    /// Unique identifier
    pub id: String,

    /// External task activity
    pub activity_id: ActivityId,

    /// Owning execution
    pub execution_id: ExecutionId,

    /// Definition the task belongs to
    pub process_definition_id: ProcessDefinitionId,

    /// Key of that definition
    pub process_definition_key: String,

    /// Topic workers poll
    pub topic: String,

    /// Worker holding the lock
    pub worker_id: Option<String>,

    /// Lock expiry
    pub lock_expiration: Option<DateTime<Utc>>,

    /// Remaining retries, if set
    pub retries: Option<u32>,

    /// Last failure message
    pub error_message: Option<String>,

    /// Fetch priority
    pub priority: i64,
}

/// Aggregate: a running process instance
#[derive(Debug, Serialize, Deserialize)]
pub struct ProcessInstance {
    /// Unique identifier, also the id of the root execution
    pub id: ProcessInstanceId,

    /// Definition the instance runs on
    pub process_definition_id: ProcessDefinitionId,

    /// Key of that definition
    pub process_definition_key: String,

    /// Business key
    pub business_key: Option<String>,

    /// Lifecycle state
    pub state: ProcessInstanceState,

    /// Whether the instance is suspended
    pub suspended: bool,

    /// Optimistic concurrency version, bumped by every save
    pub version: u64,

    /// Root execution id
    pub root_execution: ExecutionId,

    /// All executions keyed by id
    pub executions: BTreeMap<ExecutionId, Execution>,

    /// Event subscriptions
    pub event_subscriptions: Vec<EventSubscription>,

    /// Timer jobs
    pub timer_jobs: Vec<TimerJob>,

    /// Incidents, including resolved and deleted ones
    pub incidents: Vec<Incident>,

    /// External tasks
    pub external_tasks: Vec<ExternalTask>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,

    /// Domain events
    #[serde(skip)]
    pub events: Vec<Box<dyn DomainEvent>>,
}

impl Clone for ProcessInstance {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            process_definition_id: self.process_definition_id.clone(),
            process_definition_key: self.process_definition_key.clone(),
            business_key: self.business_key.clone(),
            state: self.state,
            suspended: self.suspended,
            version: self.version,
            root_execution: self.root_execution.clone(),
            executions: self.executions.clone(),
            event_subscriptions: self.event_subscriptions.clone(),
            timer_jobs: self.timer_jobs.clone(),
            incidents: self.incidents.clone(),
            external_tasks: self.external_tasks.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            events: Vec::new(), // We don't clone domain events
        }
    }
}

impl PartialEq for ProcessInstance {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.process_definition_id == other.process_definition_id
            && self.process_definition_key == other.process_definition_key
            && self.business_key == other.business_key
            && self.state == other.state
            && self.suspended == other.suspended
            && self.version == other.version
            && self.root_execution == other.root_execution
            && self.executions == other.executions
            && self.event_subscriptions == other.event_subscriptions
            && self.timer_jobs == other.timer_jobs
            && self.incidents == other.incidents
            && self.external_tasks == other.external_tasks
            && self.created_at == other.created_at
            && self.updated_at == other.updated_at
    }
}

/// Node of the activity-instance tree derived from the executions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityInstance {
    /// Execution backing this activity instance
    pub execution_id: ExecutionId,

    /// Activity
    pub activity_id: ActivityId,

    /// Nested activity instances
    pub children: Vec<ActivityInstance>,
}

impl ActivityInstance {
    /// Render the tree as `activity[child, child[...]]`, children sorted by activity id
    pub fn describe(&self) -> String {
        if self.children.is_empty() {
            return self.activity_id.0.clone();
        }
        let mut children: Vec<String> = self.children.iter().map(|c| c.describe()).collect();
        children.sort();
        format!("{}[{}]", self.activity_id, children.join(", "))
    }
}

impl ProcessInstance {
    /// Create an instance with only its root execution
    pub fn new(
        id: ProcessInstanceId,
        definition: &ProcessDefinition,
        business_key: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let root_execution = ExecutionId(id.0.clone());
        let mut executions = BTreeMap::new();
        executions.insert(
            root_execution.clone(),
            Execution::new(root_execution.clone(), None, definition.root.clone(), true),
        );

        let mut instance = Self {
            id: id.clone(),
            process_definition_id: definition.id.clone(),
            process_definition_key: definition.key.clone(),
            business_key,
            state: ProcessInstanceState::Active,
            suspended: false,
            version: 0,
            root_execution,
            executions,
            event_subscriptions: Vec::new(),
            timer_jobs: Vec::new(),
            incidents: Vec::new(),
            external_tasks: Vec::new(),
            created_at: now,
            updated_at: now,
            events: Vec::with_capacity(4),
        };

        instance.record_event(Box::new(ProcessInstanceStarted {
            process_instance_id: id,
            process_definition_id: definition.id.clone(),
            timestamp: now,
        }));

        instance
    }

    /// Record a domain event
    pub fn record_event(&mut self, event: Box<dyn DomainEvent>) {
        self.events.push(event);
    }

    /// Take all recorded domain events
    pub fn take_events(&mut self) -> Vec<Box<dyn DomainEvent>> {
        std::mem::take(&mut self.events)
    }

    /// Whether the instance has ended
    pub fn is_ended(&self) -> bool {
        self.state == ProcessInstanceState::Completed
    }

    /// Root execution
    pub fn root(&self) -> Option<&Execution> {
        self.executions.get(&self.root_execution)
    }

    /// Look up an execution
    pub fn execution(&self, id: &ExecutionId) -> Option<&Execution> {
        self.executions.get(id)
    }

    /// Look up an execution for update
    pub fn execution_mut(&mut self, id: &ExecutionId) -> Option<&mut Execution> {
        self.executions.get_mut(id)
    }

    /// Children of an execution, in creation order
    pub fn children_of(&self, id: &ExecutionId) -> Vec<&Execution> {
        self.executions
            .get(id)
            .map(|e| {
                e.children
                    .iter()
                    .filter_map(|c| self.executions.get(c))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Strict ancestors of an execution, nearest first
    pub fn ancestors_of(&self, id: &ExecutionId) -> Vec<&Execution> {
        let mut result = Vec::new();
        let mut current = self.executions.get(id).and_then(|e| e.parent_id.as_ref());
        while let Some(parent) = current.and_then(|p| self.executions.get(p)) {
            result.push(parent);
            current = parent.parent_id.as_ref();
        }
        result
    }

    /// Ids of an execution and all its descendants, pre-order
    pub fn subtree(&self, id: &ExecutionId) -> Vec<ExecutionId> {
        let mut result = Vec::new();
        let mut stack = vec![id.clone()];
        while let Some(next) = stack.pop() {
            if let Some(execution) = self.executions.get(&next) {
                result.push(next);
                for child in execution.children.iter().rev() {
                    stack.push(child.clone());
                }
            }
        }
        result
    }

    /// Executions currently in `activity`
    pub fn executions_in(&self, activity: &ActivityId) -> Vec<&Execution> {
        self.executions
            .values()
            .filter(|e| e.activity_id == *activity)
            .collect()
    }

    /// Activities of all leaf executions, sorted
    pub fn active_activity_ids(&self) -> Vec<ActivityId> {
        let mut ids: Vec<ActivityId> = self
            .executions
            .values()
            .filter(|e| e.children.is_empty() && e.id != self.root_execution)
            .map(|e| e.activity_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Add a child execution under `parent`
    pub fn add_execution(
        &mut self,
        parent: &ExecutionId,
        activity_id: ActivityId,
        is_scope: bool,
    ) -> Result<ExecutionId, CoreError> {
        let id = ExecutionId(Uuid::new_v4().to_string());
        self.attach_execution(parent, Execution::new(id.clone(), None, activity_id, is_scope))?;
        Ok(id)
    }

    /// Attach an existing execution record under `parent`
    pub fn attach_execution(
        &mut self,
        parent: &ExecutionId,
        mut execution: Execution,
    ) -> Result<(), CoreError> {
        let parent_execution = self
            .executions
            .get_mut(parent)
            .ok_or_else(|| CoreError::ExecutionNotFound(parent.0.clone()))?;
        parent_execution.children.push(execution.id.clone());
        execution.parent_id = Some(parent.clone());
        self.executions.insert(execution.id.clone(), execution);
        Ok(())
    }

    /// Detach an execution from its parent and remove it, keeping its children
    /// in the map; the caller is responsible for re-parenting them
    pub fn detach_execution(&mut self, id: &ExecutionId) -> Option<Execution> {
        let execution = self.executions.remove(id)?;
        if let Some(parent) = execution
            .parent_id
            .as_ref()
            .and_then(|p| self.executions.get_mut(p))
        {
            parent.children.retain(|c| c != id);
        }
        Some(execution)
    }

    /// Remove an execution with its descendants and every entity they own.
    /// Open incidents of the removed executions are marked deleted.
    pub fn remove_subtree(&mut self, id: &ExecutionId, now: DateTime<Utc>) -> Vec<Execution> {
        let ids: HashSet<ExecutionId> = self.subtree(id).into_iter().collect();
        if let Some(parent) = self
            .executions
            .get(id)
            .and_then(|e| e.parent_id.clone())
            .and_then(|p| self.executions.get_mut(&p))
        {
            parent.children.retain(|c| c != id);
        }

        let removed = ids
            .iter()
            .filter_map(|e| self.executions.remove(e))
            .collect();
        self.remove_owned_entities(&ids, now);
        removed
    }

    fn remove_owned_entities(&mut self, ids: &HashSet<ExecutionId>, now: DateTime<Utc>) {
        self.event_subscriptions
            .retain(|s| !ids.contains(&s.execution_id));
        self.timer_jobs.retain(|t| !ids.contains(&t.execution_id));
        self.external_tasks
            .retain(|t| !ids.contains(&t.execution_id));
        for incident in self.incidents.iter_mut() {
            if ids.contains(&incident.execution_id) && incident.state == IncidentState::Open {
                incident.state = IncidentState::Deleted;
                incident.resolved_at = Some(now);
            }
        }
    }

    /// Recompute the concurrency flag of every execution: an execution is
    /// concurrent when it has siblings or runs inside a parallel multi-instance body
    pub fn recompute_concurrency(&mut self, definition: &ProcessDefinition) {
        let flags: Vec<(ExecutionId, bool)> = self
            .executions
            .values()
            .map(|e| {
                let concurrent = e
                    .parent_id
                    .as_ref()
                    .and_then(|p| self.executions.get(p))
                    .map(|parent| {
                        parent.children.len() > 1
                            || definition
                                .activity(&parent.activity_id)
                                .map(|a| {
                                    a.activity_type
                                        == ActivityType::MultiInstanceBody(
                                            MultiInstanceMode::Parallel,
                                        )
                                })
                                .unwrap_or(false)
                    })
                    .unwrap_or(false);
                (e.id.clone(), concurrent)
            })
            .collect();
        for (id, concurrent) in flags {
            if let Some(execution) = self.executions.get_mut(&id) {
                execution.is_concurrent = concurrent;
            }
        }
    }

    /// Variables visible from an execution, merged root first so that
    /// nearer scopes shadow outer ones. Transient values are included.
    pub fn variable_context(&self, id: &ExecutionId) -> serde_json::Value {
        let mut chain: Vec<&Execution> = self.ancestors_of(id);
        chain.reverse();
        if let Some(execution) = self.executions.get(id) {
            chain.push(execution);
        }
        let mut map = serde_json::Map::new();
        for execution in chain {
            for (name, value) in &execution.variables {
                map.insert(name.clone(), value.value.clone());
            }
        }
        serde_json::Value::Object(map)
    }

    /// Resolve a variable by walking up from an execution
    pub fn variable(&self, id: &ExecutionId, name: &str) -> Option<&TypedValue> {
        let execution = self.executions.get(id)?;
        execution.variables.get(name).or_else(|| {
            self.ancestors_of(id)
                .into_iter()
                .find_map(|e| e.variables.get(name))
        })
    }

    /// Set a variable on an execution
    pub fn set_variable_local(
        &mut self,
        id: &ExecutionId,
        name: impl Into<String>,
        value: TypedValue,
    ) -> Result<(), CoreError> {
        let execution = self
            .executions
            .get_mut(id)
            .ok_or_else(|| CoreError::ExecutionNotFound(id.0.clone()))?;
        execution.variables.insert(name.into(), value);
        Ok(())
    }

    /// Event subscriptions owned by an execution
    pub fn subscriptions_of(&self, id: &ExecutionId) -> Vec<&EventSubscription> {
        self.event_subscriptions
            .iter()
            .filter(|s| s.execution_id == *id)
            .collect()
    }

    /// Timer jobs owned by an execution
    pub fn timers_of(&self, id: &ExecutionId) -> Vec<&TimerJob> {
        self.timer_jobs
            .iter()
            .filter(|t| t.execution_id == *id)
            .collect()
    }

    /// Incidents that are still open
    pub fn open_incidents(&self) -> Vec<&Incident> {
        self.incidents
            .iter()
            .filter(|i| i.state == IncidentState::Open)
            .collect()
    }

    /// Register a compensation subscription on `execution`. `handler` is a
    /// compensation handler, or a completed scope whose handlers can still
    /// be compensated.
    pub fn add_compensation_subscription(
        &mut self,
        handler: ActivityId,
        execution: &ExecutionId,
        now: DateTime<Utc>,
    ) -> Result<String, CoreError> {
        if !self.executions.contains_key(execution) {
            return Err(CoreError::ExecutionNotFound(execution.0.clone()));
        }
        let id = Uuid::new_v4().to_string();
        self.event_subscriptions.push(EventSubscription {
            id: id.clone(),
            kind: SubscriptionKind::Compensate,
            event_name: None,
            activity_id: handler,
            execution_id: execution.clone(),
            created_at: now,
        });
        Ok(id)
    }

    /// Record an incident on an execution
    pub fn create_incident(
        &mut self,
        incident_type: IncidentType,
        execution: &ExecutionId,
        configuration: Option<String>,
        message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<String, CoreError> {
        let activity_id = self
            .executions
            .get(execution)
            .map(|e| e.activity_id.clone())
            .ok_or_else(|| CoreError::ExecutionNotFound(execution.0.clone()))?;
        let id = Uuid::new_v4().to_string();
        self.incidents.push(Incident {
            id: id.clone(),
            incident_type,
            message,
            configuration,
            activity_id,
            execution_id: execution.clone(),
            process_definition_id: self.process_definition_id.clone(),
            state: IncidentState::Open,
            created_at: now,
            resolved_at: None,
        });
        Ok(id)
    }

    /// Mark a timer job as failed with no retries left and open an incident for it
    pub fn fail_timer_job(
        &mut self,
        job_id: &str,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<String, CoreError> {
        let message = message.into();
        let job = self
            .timer_jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or_else(|| CoreError::ValidationError(format!("Timer job not found: {}", job_id)))?;
        job.retries = 0;
        job.exception_message = Some(message.clone());
        let (execution, activity) = (job.execution_id.clone(), job.activity_id.clone());

        let id = self.create_incident(
            IncidentType::FailedJob,
            &execution,
            Some(job_id.to_string()),
            Some(message),
            now,
        )?;
        if let Some(incident) = self.incidents.iter_mut().find(|i| i.id == id) {
            incident.activity_id = activity;
        }
        Ok(id)
    }

    /// Mark an external task as failed with no retries left and open an incident for it
    pub fn fail_external_task(
        &mut self,
        task_id: &str,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<String, CoreError> {
        let message = message.into();
        let task = self
            .external_tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or_else(|| {
                CoreError::ValidationError(format!("External task not found: {}", task_id))
            })?;
        task.retries = Some(0);
        task.error_message = Some(message.clone());
        let execution = task.execution_id.clone();

        self.create_incident(
            IncidentType::FailedExternalTask,
            &execution,
            Some(task_id.to_string()),
            Some(message),
            now,
        )
    }

    /// Lock an external task for a worker
    pub fn lock_external_task(
        &mut self,
        task_id: &str,
        worker_id: impl Into<String>,
        until: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let task = self
            .external_tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or_else(|| {
                CoreError::ValidationError(format!("External task not found: {}", task_id))
            })?;
        task.worker_id = Some(worker_id.into());
        task.lock_expiration = Some(until);
        Ok(())
    }

    /// Resolve an open incident
    pub fn resolve_incident(&mut self, incident_id: &str, now: DateTime<Utc>) -> Result<(), CoreError> {
        let incident = self
            .incidents
            .iter_mut()
            .find(|i| i.id == incident_id)
            .ok_or_else(|| {
                CoreError::ValidationError(format!("Incident not found: {}", incident_id))
            })?;
        if incident.state == IncidentState::Open {
            incident.state = IncidentState::Resolved;
            incident.resolved_at = Some(now);
        }
        Ok(())
    }

    /// Suspend or activate the instance together with its timer jobs
    pub fn set_suspended(&mut self, suspended: bool) {
        self.suspended = suspended;
        for job in self.timer_jobs.iter_mut() {
            job.suspended = suspended;
        }
    }

    /// Derive the activity-instance tree from the executions
    pub fn activity_instance_tree(&self) -> Option<ActivityInstance> {
        self.build_activity_instance(&self.root_execution)
    }

    fn build_activity_instance(&self, id: &ExecutionId) -> Option<ActivityInstance> {
        let execution = self.executions.get(id)?;
        Some(ActivityInstance {
            execution_id: execution.id.clone(),
            activity_id: execution.activity_id.clone(),
            children: execution
                .children
                .iter()
                .filter_map(|c| self.build_activity_instance(c))
                .collect(),
        })
    }

    /// Complete a leaf execution.
    ///
    /// Owned subscriptions, timers and external tasks go with it. Completing
    /// the last instance of a multi-instance body completes the body; a
    /// sequential body starts its next instance instead. Container scopes
    /// left without children complete in turn, and an empty root ends the
    /// instance.
    pub fn complete_execution(
        &mut self,
        id: &ExecutionId,
        definition: &ProcessDefinition,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let execution = self
            .executions
            .get(id)
            .ok_or_else(|| CoreError::ExecutionNotFound(id.0.clone()))?;
        if !execution.children.is_empty() {
            return Err(CoreError::ValidationError(format!(
                "Cannot complete execution {}: it has active children",
                id
            )));
        }
        if *id == self.root_execution {
            self.end(now);
            return Ok(());
        }

        let parent_id = execution.parent_id.clone();
        self.remove_subtree(id, now);
        self.updated_at = now;

        let Some(parent_id) = parent_id else {
            return Ok(());
        };
        let Some(parent) = self.executions.get(&parent_id) else {
            return Ok(());
        };
        let parent_activity = definition.activity(&parent.activity_id).cloned();

        if let Some(body) = parent_activity.filter(|a| a.is_multi_instance_body()) {
            let total = counter(parent, NR_OF_INSTANCES);
            let completed = counter(parent, NR_OF_COMPLETED_INSTANCES) + 1;
            let active = (counter(parent, NR_OF_ACTIVE_INSTANCES) - 1).max(0);
            self.set_variable_local(&parent_id, NR_OF_COMPLETED_INSTANCES, completed.into())?;

            let sequential =
                body.activity_type == ActivityType::MultiInstanceBody(MultiInstanceMode::Sequential);
            if sequential && completed < total {
                if let Some(inner) = definition.inner_activity(&body.id) {
                    let next = self.add_execution(&parent_id, inner.id.clone(), inner.is_scope)?;
                    self.set_variable_local(&next, LOOP_COUNTER, completed.into())?;
                }
                self.set_variable_local(&parent_id, NR_OF_ACTIVE_INSTANCES, 1i64.into())?;
            } else {
                self.set_variable_local(&parent_id, NR_OF_ACTIVE_INSTANCES, active.into())?;
            }
        }

        let parent_empty = self
            .executions
            .get(&parent_id)
            .map(|p| p.children.is_empty())
            .unwrap_or(false);
        if parent_empty {
            self.complete_execution(&parent_id, definition, now)?;
        } else {
            self.recompute_concurrency(definition);
        }
        Ok(())
    }

    fn end(&mut self, now: DateTime<Utc>) {
        let root: HashSet<ExecutionId> = [self.root_execution.clone()].into_iter().collect();
        self.remove_owned_entities(&root, now);
        self.state = ProcessInstanceState::Completed;
        self.updated_at = now;
        self.record_event(Box::new(ProcessInstanceCompleted {
            process_instance_id: self.id.clone(),
            process_definition_id: self.process_definition_id.clone(),
            timestamp: now,
        }));
    }

    /// Check the structural invariants of the snapshot against a definition:
    /// every execution is in an activity of the definition, every child's
    /// activity lies strictly below its parent's activity, and every
    /// attached entity references an existing execution.
    pub fn verify_against(&self, definition: &ProcessDefinition) -> Result<(), CoreError> {
        let root = self
            .root()
            .ok_or_else(|| CoreError::ExecutionNotFound(self.root_execution.0.clone()))?;
        if root.activity_id != definition.root {
            return Err(CoreError::ValidationError(format!(
                "Root execution is in {} instead of {}",
                root.activity_id, definition.root
            )));
        }

        for execution in self.executions.values() {
            if definition.activity(&execution.activity_id).is_none() {
                return Err(CoreError::ValidationError(format!(
                    "Execution {} is in unknown activity {}",
                    execution.id, execution.activity_id
                )));
            }
            if let Some(parent) = execution.parent_id.as_ref().and_then(|p| self.executions.get(p)) {
                if !definition.is_ancestor(&parent.activity_id, &execution.activity_id) {
                    return Err(CoreError::ValidationError(format!(
                        "Execution {} in {} is not nested in its parent's activity {}",
                        execution.id, execution.activity_id, parent.activity_id
                    )));
                }
                if !parent.children.contains(&execution.id) {
                    return Err(CoreError::ValidationError(format!(
                        "Execution {} is missing from its parent's children",
                        execution.id
                    )));
                }
            } else if execution.id != self.root_execution {
                return Err(CoreError::ValidationError(format!(
                    "Execution {} has no parent",
                    execution.id
                )));
            }
        }

        let owners = self
            .event_subscriptions
            .iter()
            .map(|s| (&s.id, &s.execution_id))
            .chain(self.timer_jobs.iter().map(|t| (&t.id, &t.execution_id)))
            .chain(self.external_tasks.iter().map(|t| (&t.id, &t.execution_id)))
            .chain(
                self.incidents
                    .iter()
                    .filter(|i| i.state == IncidentState::Open)
                    .map(|i| (&i.id, &i.execution_id)),
            );
        for (entity, owner) in owners {
            if !self.executions.contains_key(owner) {
                return Err(CoreError::ValidationError(format!(
                    "Entity {} references missing execution {}",
                    entity, owner
                )));
            }
        }

        Ok(())
    }
}

fn counter(execution: &Execution, name: &str) -> i64 {
    execution
        .variables
        .get(name)
        .and_then(|v| v.as_i64())
        .unwrap_or(0)
}
