//! Static process model: an ordered tree of activities.
//!
//! Every activity except the root has exactly one flow scope (its parent).
//! Multi-instance activities are modelled as a body activity named
//! `<inner>#multiInstanceBody` whose single child is the inner activity.
//! Event scopes are kept in a separate relation since they do not always
//! coincide with the flow scope (a boundary event's event scope is the
//! activity it is attached to).

use crate::domain::timer::TimerDefinition;
use crate::types::string_id;
use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

string_id!(
    /// Value object: Process definition ID
    ProcessDefinitionId
);

string_id!(
    /// Value object: Activity ID, unique within a process definition
    ActivityId
);

/// Suffix appended to the inner activity id to name a multi-instance body
pub const MULTI_INSTANCE_BODY_SUFFIX: &str = "#multiInstanceBody";

/// Build the id of the multi-instance body wrapping `inner`
pub fn multi_instance_body_id(inner: &str) -> ActivityId {
    ActivityId(format!("{}{}", inner, MULTI_INSTANCE_BODY_SUFFIX))
}

/// Execution mode of a multi-instance body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MultiInstanceMode {
    /// All instances run concurrently
    Parallel,
    /// Instances run one after another
    Sequential,
}

/// Closed set of activity kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivityType {
    /// The process itself (tree root)
    Process,
    /// Human task
    UserTask,
    /// Task waiting for a message
    ReceiveTask,
    /// Manual task
    ManualTask,
    /// Task completed by an external worker polling a topic
    ExternalTask,
    /// Task delegating to code
    ServiceTask,
    /// Task running a script
    ScriptTask,
    /// Embedded sub process
    SubProcess,
    /// Event sub process, started by its start event
    EventSubProcess,
    /// Transaction sub process
    Transaction,
    /// Call to another process definition
    CallActivity,
    /// Multi-instance body wrapping a single inner activity
    MultiInstanceBody(MultiInstanceMode),
    /// Parallel fork/join gateway
    ParallelGateway,
    /// Inclusive fork/join gateway
    InclusiveGateway,
    /// Exclusive gateway
    ExclusiveGateway,
    /// Event-based gateway
    EventBasedGateway,
    /// Start event (plain, or trigger of an event sub process)
    StartEvent,
    /// End event
    EndEvent,
    /// Event attached to another activity
    BoundaryEvent,
    /// Intermediate catching event
    IntermediateCatchEvent,
    /// Intermediate throwing event
    IntermediateThrowEvent,
}

impl ActivityType {
    /// Whether activities of this kind can contain other activities
    pub fn is_container(&self) -> bool {
        matches!(
            self,
            ActivityType::Process
                | ActivityType::SubProcess
                | ActivityType::EventSubProcess
                | ActivityType::Transaction
                | ActivityType::MultiInstanceBody(_)
        )
    }

    /// Whether activities of this kind always open a scope
    pub fn is_always_scope(&self) -> bool {
        self.is_container() || matches!(self, ActivityType::CallActivity)
    }

    /// Whether this is an event activity
    pub fn is_event(&self) -> bool {
        matches!(
            self,
            ActivityType::StartEvent
                | ActivityType::EndEvent
                | ActivityType::BoundaryEvent
                | ActivityType::IntermediateCatchEvent
                | ActivityType::IntermediateThrowEvent
        )
    }

    /// Whether this is a parallel or inclusive gateway
    pub fn is_joining_gateway(&self) -> bool {
        matches!(
            self,
            ActivityType::ParallelGateway | ActivityType::InclusiveGateway
        )
    }

    /// Name of the runtime behaviour implementing this kind
    pub fn behavior_name(&self) -> &'static str {
        match self {
            ActivityType::Process => "ProcessDefinitionBehavior",
            ActivityType::UserTask => "UserTaskActivityBehavior",
            ActivityType::ReceiveTask => "ReceiveTaskActivityBehavior",
            ActivityType::ManualTask => "TaskActivityBehavior",
            ActivityType::ExternalTask => "ExternalTaskActivityBehavior",
            ActivityType::ServiceTask => "ClassDelegateActivityBehavior",
            ActivityType::ScriptTask => "ScriptTaskActivityBehavior",
            ActivityType::SubProcess => "SubProcessActivityBehavior",
            ActivityType::EventSubProcess => "EventSubProcessActivityBehavior",
            ActivityType::Transaction => "TransactionActivityBehavior",
            ActivityType::CallActivity => "CallActivityBehavior",
            ActivityType::MultiInstanceBody(MultiInstanceMode::Parallel) => {
                "ParallelMultiInstanceActivityBehavior"
            }
            ActivityType::MultiInstanceBody(MultiInstanceMode::Sequential) => {
                "SequentialMultiInstanceActivityBehavior"
            }
            ActivityType::ParallelGateway => "ParallelGatewayActivityBehavior",
            ActivityType::InclusiveGateway => "InclusiveGatewayActivityBehavior",
            ActivityType::ExclusiveGateway => "ExclusiveGatewayActivityBehavior",
            ActivityType::EventBasedGateway => "EventBasedGatewayActivityBehavior",
            ActivityType::StartEvent => "NoneStartEventActivityBehavior",
            ActivityType::EndEvent => "NoneEndEventActivityBehavior",
            ActivityType::BoundaryEvent => "BoundaryEventActivityBehavior",
            ActivityType::IntermediateCatchEvent => "IntermediateCatchEventActivityBehavior",
            ActivityType::IntermediateThrowEvent => "IntermediateThrowEventActivityBehavior",
        }
    }
}

/// Kind of trigger carried by an event activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// Named message
    Message,
    /// Broadcast signal
    Signal,
    /// Timer
    Timer,
    /// Condition over variables
    Conditional,
    /// Compensation
    Compensation,
    /// Error
    Error,
    /// Escalation
    Escalation,
}

impl EventKind {
    fn capitalized(&self) -> &'static str {
        match self {
            EventKind::Message => "Message",
            EventKind::Signal => "Signal",
            EventKind::Timer => "Timer",
            EventKind::Conditional => "Conditional",
            EventKind::Compensation => "Compensation",
            EventKind::Error => "Error",
            EventKind::Escalation => "Escalation",
        }
    }

    fn lowercase(&self) -> &'static str {
        match self {
            EventKind::Message => "message",
            EventKind::Signal => "signal",
            EventKind::Timer => "timer",
            EventKind::Conditional => "conditional",
            EventKind::Compensation => "compensation",
            EventKind::Error => "error",
            EventKind::Escalation => "escalation",
        }
    }

    /// Whether the trigger is backed by a subscription or job that outlives a
    /// single step (message, signal, timer, conditional)
    pub fn is_persistent(&self) -> bool {
        matches!(
            self,
            EventKind::Message | EventKind::Signal | EventKind::Timer | EventKind::Conditional
        )
    }
}

/// Trigger definition of an event activity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDefinition {
    /// Trigger kind
    pub kind: EventKind,

    /// Message/signal name, may contain `${...}` placeholders
    pub name: Option<String>,

    /// Condition expression for conditional events
    pub condition: Option<String>,

    /// Timer definition for timer events
    pub timer: Option<TimerDefinition>,

    /// Whether triggering interrupts the event scope
    pub interrupting: bool,
}

impl EventDefinition {
    fn of(kind: EventKind) -> Self {
        Self {
            kind,
            name: None,
            condition: None,
            timer: None,
            interrupting: true,
        }
    }

    /// Message trigger
    pub fn message(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::of(EventKind::Message)
        }
    }

    /// Signal trigger
    pub fn signal(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::of(EventKind::Signal)
        }
    }

    /// Timer trigger
    pub fn timer(timer: TimerDefinition) -> Self {
        Self {
            timer: Some(timer),
            ..Self::of(EventKind::Timer)
        }
    }

    /// Conditional trigger
    pub fn conditional(condition: impl Into<String>) -> Self {
        Self {
            condition: Some(condition.into()),
            ..Self::of(EventKind::Conditional)
        }
    }

    /// Compensation trigger
    pub fn compensation() -> Self {
        Self::of(EventKind::Compensation)
    }

    /// Error trigger
    pub fn error(code: impl Into<String>) -> Self {
        Self {
            name: Some(code.into()),
            ..Self::of(EventKind::Error)
        }
    }

    /// Escalation trigger
    pub fn escalation(code: impl Into<String>) -> Self {
        Self {
            name: Some(code.into()),
            ..Self::of(EventKind::Escalation)
        }
    }

    /// Make the event non-interrupting
    pub fn non_interrupting(mut self) -> Self {
        self.interrupting = false;
        self
    }
}

/// A node of the process tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    /// Unique id within the definition
    pub id: ActivityId,

    /// Optional display name
    pub name: Option<String>,

    /// Activity kind
    pub activity_type: ActivityType,

    /// Whether instances of this activity own a scope execution
    pub is_scope: bool,

    /// Flow scope; `None` only for the root
    pub parent: Option<ActivityId>,

    /// Child activities in declaration order
    pub children: Vec<ActivityId>,

    /// Trigger definition for event activities
    pub event_definition: Option<EventDefinition>,

    /// Activity a boundary event is attached to
    pub attached_to: Option<ActivityId>,

    /// Handler activated by a compensation boundary event
    pub compensation_handler: Option<ActivityId>,

    /// Whether this activity only runs as a compensation handler
    pub is_for_compensation: bool,

    /// Number of incoming sequence flows (relevant for joining gateways)
    pub incoming_flows: usize,

    /// Topic for external tasks
    pub topic: Option<String>,

    #[serde(skip)]
    scope_override: Option<bool>,
}

impl Activity {
    /// Create an activity of the given kind, placed in the process root
    pub fn new(id: impl Into<String>, activity_type: ActivityType) -> Self {
        Self {
            id: ActivityId(id.into()),
            name: None,
            activity_type,
            is_scope: activity_type.is_always_scope(),
            parent: None,
            children: Vec::new(),
            event_definition: None,
            attached_to: None,
            compensation_handler: None,
            is_for_compensation: false,
            incoming_flows: 1,
            topic: None,
            scope_override: None,
        }
    }

    /// User task
    pub fn user_task(id: impl Into<String>) -> Self {
        Self::new(id, ActivityType::UserTask)
    }

    /// Receive task, waiting for `message`
    pub fn receive_task(id: impl Into<String>, message: impl Into<String>) -> Self {
        let mut activity = Self::new(id, ActivityType::ReceiveTask);
        activity.event_definition = Some(EventDefinition::message(message));
        activity
    }

    /// External task on `topic`
    pub fn external_task(id: impl Into<String>, topic: impl Into<String>) -> Self {
        let mut activity = Self::new(id, ActivityType::ExternalTask);
        activity.topic = Some(topic.into());
        activity
    }

    /// Service task
    pub fn service_task(id: impl Into<String>) -> Self {
        Self::new(id, ActivityType::ServiceTask)
    }

    /// Embedded sub process
    pub fn sub_process(id: impl Into<String>) -> Self {
        Self::new(id, ActivityType::SubProcess)
    }

    /// Event sub process
    pub fn event_sub_process(id: impl Into<String>) -> Self {
        Self::new(id, ActivityType::EventSubProcess)
    }

    /// Transaction sub process
    pub fn transaction(id: impl Into<String>) -> Self {
        Self::new(id, ActivityType::Transaction)
    }

    /// Parallel gateway with `incoming` sequence flows
    pub fn parallel_gateway(id: impl Into<String>, incoming: usize) -> Self {
        Self::new(id, ActivityType::ParallelGateway).incoming(incoming)
    }

    /// Inclusive gateway with `incoming` sequence flows
    pub fn inclusive_gateway(id: impl Into<String>, incoming: usize) -> Self {
        Self::new(id, ActivityType::InclusiveGateway).incoming(incoming)
    }

    /// Plain start event
    pub fn start_event(id: impl Into<String>) -> Self {
        Self::new(id, ActivityType::StartEvent)
    }

    /// Start event with a trigger, used inside event sub processes
    pub fn triggered_start_event(id: impl Into<String>, definition: EventDefinition) -> Self {
        let mut activity = Self::new(id, ActivityType::StartEvent);
        activity.event_definition = Some(definition);
        activity
    }

    /// End event
    pub fn end_event(id: impl Into<String>) -> Self {
        Self::new(id, ActivityType::EndEvent)
    }

    /// Boundary event attached to `attached_to`
    pub fn boundary_event(
        id: impl Into<String>,
        attached_to: impl Into<String>,
        definition: EventDefinition,
    ) -> Self {
        let mut activity = Self::new(id, ActivityType::BoundaryEvent);
        activity.attached_to = Some(ActivityId(attached_to.into()));
        activity.event_definition = Some(definition);
        activity
    }

    /// Compensation boundary event activating `handler`
    pub fn compensation_boundary_event(
        id: impl Into<String>,
        attached_to: impl Into<String>,
        handler: impl Into<String>,
    ) -> Self {
        let mut activity = Self::boundary_event(id, attached_to, EventDefinition::compensation());
        activity.compensation_handler = Some(ActivityId(handler.into()));
        activity
    }

    /// Intermediate catching event
    pub fn intermediate_catch_event(id: impl Into<String>, definition: EventDefinition) -> Self {
        let mut activity = Self::new(id, ActivityType::IntermediateCatchEvent);
        activity.event_definition = Some(definition);
        activity
    }

    /// Intermediate throwing event
    pub fn intermediate_throw_event(id: impl Into<String>, definition: EventDefinition) -> Self {
        let mut activity = Self::new(id, ActivityType::IntermediateThrowEvent);
        activity.event_definition = Some(definition);
        activity
    }

    /// Place the activity in the given flow scope
    pub fn in_scope(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(ActivityId(parent.into()));
        self
    }

    /// Force the scope flag
    pub fn scope(mut self, is_scope: bool) -> Self {
        self.scope_override = Some(is_scope);
        self
    }

    /// Set the number of incoming sequence flows
    pub fn incoming(mut self, incoming: usize) -> Self {
        self.incoming_flows = incoming;
        self
    }

    /// Set the display name
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Mark as a compensation handler
    pub fn for_compensation(mut self) -> Self {
        self.is_for_compensation = true;
        self
    }

    /// Whether this activity is a multi-instance body
    pub fn is_multi_instance_body(&self) -> bool {
        matches!(self.activity_type, ActivityType::MultiInstanceBody(_))
    }

    /// Event kind, if this activity carries a trigger
    pub fn event_kind(&self) -> Option<EventKind> {
        self.event_definition.as_ref().map(|d| d.kind)
    }

    /// Whether this activity waits on a message/signal/timer/conditional trigger
    pub fn has_persistent_event_trigger(&self) -> bool {
        self.event_kind().map(|k| k.is_persistent()).unwrap_or(false)
    }

    /// Whether this is a compensation boundary event
    pub fn is_compensation_boundary(&self) -> bool {
        self.activity_type == ActivityType::BoundaryEvent
            && self.event_kind() == Some(EventKind::Compensation)
    }
}

/// Aggregate: a deployed process definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    /// Unique identifier
    pub id: ProcessDefinitionId,

    /// Key shared by all versions; also the id of the root activity
    pub key: String,

    /// Deployment version
    pub version: u32,

    /// Root activity id
    pub root: ActivityId,

    activities: HashMap<ActivityId, Activity>,

    /// Pre-order traversal from the root
    order: Vec<ActivityId>,

    /// Event scope relation, separate from the flow-scope tree
    event_scopes: HashMap<ActivityId, ActivityId>,
}

impl ProcessDefinition {
    /// Start building a definition with the given key
    pub fn builder(key: impl Into<String>) -> ProcessDefinitionBuilder {
        ProcessDefinitionBuilder::new(key)
    }

    /// Look up any activity, including the root
    pub fn activity(&self, id: &ActivityId) -> Option<&Activity> {
        self.activities.get(id)
    }

    /// Look up an activity that migration instructions may reference.
    /// The root is excluded since it is implicitly mapped.
    pub fn mappable_activity(&self, id: &ActivityId) -> Option<&Activity> {
        if *id == self.root {
            None
        } else {
            self.activities.get(id)
        }
    }

    /// The root activity
    pub fn root_activity(&self) -> &Activity {
        // The builder always inserts the root.
        &self.activities[&self.root]
    }

    /// All activities in pre-order, root first
    pub fn activities(&self) -> impl Iterator<Item = &Activity> {
        self.order.iter().filter_map(move |id| self.activities.get(id))
    }

    /// Number of activities, including the root
    pub fn len(&self) -> usize {
        self.activities.len()
    }

    /// Always false: a definition contains at least its root
    pub fn is_empty(&self) -> bool {
        self.activities.is_empty()
    }

    /// Flow scope of an activity
    pub fn flow_scope(&self, id: &ActivityId) -> Option<&ActivityId> {
        self.activities.get(id).and_then(|a| a.parent.as_ref())
    }

    /// Strict ancestors, nearest first, ending with the root
    pub fn ancestors(&self, id: &ActivityId) -> Vec<&ActivityId> {
        let mut result = Vec::new();
        let mut current = self.flow_scope(id);
        while let Some(scope) = current {
            result.push(scope);
            current = self.flow_scope(scope);
        }
        result
    }

    /// Whether `ancestor` is a strict ancestor of `descendant`
    pub fn is_ancestor(&self, ancestor: &ActivityId, descendant: &ActivityId) -> bool {
        self.ancestors(descendant).into_iter().any(|a| a == ancestor)
    }

    /// Whether `ancestor` is `descendant` or one of its ancestors
    pub fn is_ancestor_or_self(&self, ancestor: &ActivityId, descendant: &ActivityId) -> bool {
        ancestor == descendant || self.is_ancestor(ancestor, descendant)
    }

    /// Event scope of an activity, if it declares one
    pub fn event_scope(&self, id: &ActivityId) -> Option<&ActivityId> {
        self.event_scopes.get(id)
    }

    /// Event activities other than `scope` itself whose event scope is `scope`
    /// and whose trigger lives in a subscription or job, in declaration order
    pub fn events_scoped_to(&self, scope: &ActivityId) -> Vec<&Activity> {
        self.activities()
            .filter(|a| a.id != *scope)
            .filter(|a| self.event_scopes.get(&a.id) == Some(scope))
            .filter(|a| a.has_persistent_event_trigger())
            .collect()
    }

    /// The multi-instance body directly enclosing `id`, if any
    pub fn enclosing_multi_instance_body(&self, id: &ActivityId) -> Option<&Activity> {
        self.flow_scope(id)
            .and_then(|p| self.activities.get(p))
            .filter(|p| p.is_multi_instance_body())
    }

    /// Inner activity of a multi-instance body
    pub fn inner_activity(&self, body: &ActivityId) -> Option<&Activity> {
        self.activities
            .get(body)
            .filter(|b| b.is_multi_instance_body())
            .and_then(|b| b.children.first())
            .and_then(|inner| self.activities.get(inner))
    }

    /// Event that triggers the compensation handler `handler`: either a
    /// compensation boundary event naming it, or the compensation start
    /// event of an event sub process
    pub fn compensation_trigger_for(&self, handler: &ActivityId) -> Option<&Activity> {
        self.activities().find(|a| {
            (a.is_compensation_boundary() && a.compensation_handler.as_ref() == Some(handler))
                || (a.activity_type == ActivityType::StartEvent
                    && a.event_kind() == Some(EventKind::Compensation)
                    && a.parent.as_ref() == Some(handler))
        })
    }

    /// Compensation handler activated by a compensation trigger event
    pub fn compensation_handler_of<'b>(&self, trigger: &'b Activity) -> Option<&'b ActivityId> {
        if trigger.is_compensation_boundary() {
            trigger.compensation_handler.as_ref()
        } else if trigger.activity_type == ActivityType::StartEvent
            && trigger.event_kind() == Some(EventKind::Compensation)
        {
            trigger.parent.as_ref()
        } else {
            None
        }
    }

    /// Whether `id` is the start event of an event sub process
    pub fn is_event_sub_process_start(&self, activity: &Activity) -> bool {
        activity.activity_type == ActivityType::StartEvent
            && activity
                .parent
                .as_ref()
                .and_then(|p| self.activities.get(p))
                .map(|p| p.activity_type == ActivityType::EventSubProcess)
                .unwrap_or(false)
    }

    /// Type name used when comparing two event activities, e.g.
    /// `boundaryMessage` or `startTimerEvent`
    pub fn event_type_name(&self, activity: &Activity) -> Option<String> {
        let kind = activity.event_kind()?;
        match activity.activity_type {
            ActivityType::BoundaryEvent => Some(format!("boundary{}", kind.capitalized())),
            ActivityType::IntermediateCatchEvent => Some(match kind {
                EventKind::Message => "intermediateMessageCatch".to_string(),
                EventKind::Signal => "intermediateSignalCatch".to_string(),
                EventKind::Timer => "intermediateTimer".to_string(),
                EventKind::Conditional => "intermediateConditional".to_string(),
                other => format!("intermediate{}Catch", other.capitalized()),
            }),
            ActivityType::IntermediateThrowEvent => {
                Some(format!("intermediate{}Throw", kind.capitalized()))
            }
            ActivityType::StartEvent => Some(match kind {
                EventKind::Timer => "startTimerEvent".to_string(),
                other => format!("{}StartEvent", other.lowercase()),
            }),
            _ => None,
        }
    }
}

/// Builder for process definitions; validates the tree on `build`
#[derive(Debug, Clone)]
pub struct ProcessDefinitionBuilder {
    key: String,
    id: Option<String>,
    version: u32,
    activities: Vec<Activity>,
    multi_instance: Vec<(ActivityId, MultiInstanceMode)>,
}

impl ProcessDefinitionBuilder {
    /// Create a builder for the given key
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            id: None,
            version: 1,
            activities: Vec::new(),
            multi_instance: Vec::new(),
        }
    }

    /// Set the definition id (defaults to `<key>:<version>`)
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the version
    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Add an activity
    pub fn activity(mut self, activity: Activity) -> Self {
        self.activities.push(activity);
        self
    }

    /// Wrap an already added activity in a multi-instance body
    pub fn multi_instance(mut self, inner: impl Into<String>, mode: MultiInstanceMode) -> Self {
        self.multi_instance.push((ActivityId(inner.into()), mode));
        self
    }

    /// Validate and build the definition
    pub fn build(self) -> Result<ProcessDefinition, CoreError> {
        let root_id = ActivityId(self.key.clone());
        let mut root = Activity::new(self.key.clone(), ActivityType::Process);
        root.incoming_flows = 0;

        let mut declared: Vec<Activity> = Vec::with_capacity(self.activities.len() + 1);
        let mut seen = HashSet::new();
        seen.insert(root_id.clone());

        for activity in self.activities {
            if activity.id.0.is_empty() {
                return Err(CoreError::ValidationError(
                    "Activity id must not be empty".to_string(),
                ));
            }
            if !seen.insert(activity.id.clone()) {
                return Err(CoreError::ValidationError(format!(
                    "Duplicate activity ID: {}",
                    activity.id
                )));
            }
            declared.push(activity);
        }

        // Wrap multi-instance activities in their body, placed where the inner
        // activity was declared. Boundary events of the inner activity move to the body.
        for (inner, mode) in &self.multi_instance {
            let position = declared.iter().position(|a| a.id == *inner).ok_or_else(|| {
                CoreError::ValidationError(format!(
                    "Multi-instance activity not found: {}",
                    inner
                ))
            })?;
            let body_id = multi_instance_body_id(inner.as_str());
            if !seen.insert(body_id.clone()) {
                return Err(CoreError::ValidationError(format!(
                    "Duplicate activity ID: {}",
                    body_id
                )));
            }
            let mut body = Activity::new(body_id.0.clone(), ActivityType::MultiInstanceBody(*mode));
            body.parent = declared[position].parent.clone();
            body.incoming_flows = declared[position].incoming_flows;
            declared[position].parent = Some(body_id.clone());
            for activity in declared.iter_mut() {
                if activity.activity_type == ActivityType::BoundaryEvent
                    && activity.attached_to.as_ref() == Some(inner)
                {
                    activity.attached_to = Some(body_id.clone());
                }
            }
            declared.insert(position, body);
        }

        // Boundary events share the flow scope of the activity they are attached to.
        let index: HashMap<ActivityId, usize> = declared
            .iter()
            .enumerate()
            .map(|(i, a)| (a.id.clone(), i))
            .collect();
        for i in 0..declared.len() {
            if declared[i].activity_type != ActivityType::BoundaryEvent {
                continue;
            }
            let attached = declared[i].attached_to.clone().ok_or_else(|| {
                CoreError::ValidationError(format!(
                    "Boundary event {} is not attached to an activity",
                    declared[i].id
                ))
            })?;
            let host = index.get(&attached).copied().ok_or_else(|| {
                CoreError::ValidationError(format!(
                    "Boundary event {} references non-existent activity: {}",
                    declared[i].id, attached
                ))
            })?;
            declared[i].parent = declared[host].parent.clone();
            if declared[host].scope_override.is_none() {
                declared[host].is_scope = true;
            }
        }

        for activity in declared.iter_mut() {
            if let Some(is_scope) = activity.scope_override {
                activity.is_scope = is_scope;
            }
            if activity.parent.is_none() {
                activity.parent = Some(root_id.clone());
            }
        }

        let mut activities: HashMap<ActivityId, Activity> = HashMap::new();
        let mut insertion: Vec<ActivityId> = Vec::new();
        insertion.push(root_id.clone());
        activities.insert(root_id.clone(), root);
        for activity in declared {
            insertion.push(activity.id.clone());
            activities.insert(activity.id.clone(), activity);
        }

        // Parent links must point at existing containers.
        for id in &insertion[1..] {
            let parent = activities[id].parent.clone().unwrap_or_else(|| root_id.clone());
            match activities.get(&parent) {
                Some(p) if p.activity_type.is_container() => {}
                Some(_) => {
                    return Err(CoreError::ValidationError(format!(
                        "Activity {} is placed in {} which cannot contain activities",
                        id, parent
                    )))
                }
                None => {
                    return Err(CoreError::ValidationError(format!(
                        "Activity {} references non-existent flow scope: {}",
                        id, parent
                    )))
                }
            }
        }

        check_for_cycles(&activities, &insertion)?;

        for id in &insertion[1..] {
            let parent = activities[id].parent.clone().unwrap_or_else(|| root_id.clone());
            if let Some(p) = activities.get_mut(&parent) {
                p.children.push(id.clone());
            }
        }

        for activity in activities.values() {
            if activity.is_multi_instance_body() && activity.children.len() != 1 {
                return Err(CoreError::ValidationError(format!(
                    "Multi-instance body {} must contain exactly one inner activity",
                    activity.id
                )));
            }
            if let Some(handler) = &activity.compensation_handler {
                if !activities.contains_key(handler) {
                    return Err(CoreError::ValidationError(format!(
                        "Compensation boundary event {} references non-existent handler: {}",
                        activity.id, handler
                    )));
                }
            }
        }

        let mut order = Vec::with_capacity(activities.len());
        collect_pre_order(&activities, &root_id, &mut order);

        let mut definition = ProcessDefinition {
            id: ProcessDefinitionId(
                self.id
                    .unwrap_or_else(|| format!("{}:{}", self.key, self.version)),
            ),
            key: self.key,
            version: self.version,
            root: root_id,
            activities,
            order,
            event_scopes: HashMap::new(),
        };
        definition.event_scopes = compute_event_scopes(&definition);

        Ok(definition)
    }
}

fn check_for_cycles(
    activities: &HashMap<ActivityId, Activity>,
    ids: &[ActivityId],
) -> Result<(), CoreError> {
    for id in ids {
        let mut visited = HashSet::new();
        let mut current = Some(id);
        while let Some(node) = current {
            if !visited.insert(node) {
                return Err(CoreError::ValidationError(format!(
                    "Cycle detected in flow scopes involving activity: {}",
                    id
                )));
            }
            current = activities.get(node).and_then(|a| a.parent.as_ref());
        }
    }
    Ok(())
}

fn collect_pre_order(
    activities: &HashMap<ActivityId, Activity>,
    id: &ActivityId,
    out: &mut Vec<ActivityId>,
) {
    out.push(id.clone());
    if let Some(activity) = activities.get(id) {
        for child in &activity.children {
            collect_pre_order(activities, child, out);
        }
    }
}

fn compute_event_scopes(definition: &ProcessDefinition) -> HashMap<ActivityId, ActivityId> {
    let mut scopes = HashMap::new();
    for activity in definition.activities() {
        let scope = match activity.activity_type {
            ActivityType::BoundaryEvent => activity.attached_to.clone(),
            ActivityType::StartEvent if definition.is_event_sub_process_start(activity) => activity
                .parent
                .as_ref()
                .and_then(|esp| definition.flow_scope(esp))
                .cloned(),
            ActivityType::EventSubProcess => activity.parent.clone(),
            ActivityType::IntermediateCatchEvent | ActivityType::ReceiveTask => {
                Some(activity.id.clone())
            }
            _ => None,
        };
        if let Some(scope) = scope {
            scopes.insert(activity.id.clone(), scope);
        }
    }
    scopes
}
