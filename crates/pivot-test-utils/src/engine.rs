//! A migration engine wired with in-memory collaborators.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use pivot_core::domain::events::DomainEvent;
use pivot_core::domain::instantiation::InstanceStarter;
use pivot_core::domain::repository::memory::{
    MemoryProcessDefinitionRepository, MemoryProcessInstanceRepository,
};
use pivot_core::{
    ActivityId, Clock, CoreError, DomainEventHandler, FixedClock, JmesPathExpressionEvaluator,
    MigrationConfig, MigrationError, MigrationExecutionReport, MigrationPlan,
    MigrationPlanBuilder, MigrationService, ProcessDefinition, ProcessDefinitionRepository,
    ProcessInstance, ProcessInstanceId, ProcessInstanceRepository, TypedValue,
};
use std::collections::BTreeMap;
use std::sync::Arc;

/// An event seen by [`RecordingEventHandler`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    /// Event type, e.g. `process_instance.migrated`
    pub event_type: &'static str,
    /// Instance the event belongs to
    pub process_instance_id: ProcessInstanceId,
}

/// Event handler that keeps every event it receives
#[derive(Debug, Default)]
pub struct RecordingEventHandler {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEventHandler {
    /// Events received so far
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    /// Events of one type
    pub fn of_type(&self, event_type: &str) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    /// Forget recorded events
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

#[async_trait]
impl DomainEventHandler for RecordingEventHandler {
    async fn handle_event(&self, event: Box<dyn DomainEvent>) -> Result<(), CoreError> {
        self.events.lock().push(RecordedEvent {
            event_type: event.event_type(),
            process_instance_id: event.process_instance_id().clone(),
        });
        Ok(())
    }
}

/// Test harness: deploy definitions, start instances, migrate them
pub struct TestEngine {
    /// Deployed definitions
    pub definitions: Arc<MemoryProcessDefinitionRepository>,
    /// Stored instances
    pub instances: Arc<MemoryProcessInstanceRepository>,
    /// Time source shared with the service
    pub clock: Arc<FixedClock>,
    /// Expression evaluator shared with the service
    pub evaluator: Arc<JmesPathExpressionEvaluator>,
    /// Events dispatched by the service
    pub events: Arc<RecordingEventHandler>,
    /// The migration runner under test
    pub service: MigrationService,
}

impl TestEngine {
    /// Engine with default configuration, clock at 2024-01-01T00:00:00Z
    pub fn new() -> Self {
        Self::with_config(MigrationConfig::default())
    }

    /// Engine with a custom configuration
    pub fn with_config(config: MigrationConfig) -> Self {
        crate::init_tracing();
        let definitions = Arc::new(MemoryProcessDefinitionRepository::new());
        let instances = Arc::new(MemoryProcessInstanceRepository::new());
        let clock = Arc::new(FixedClock::new(Self::epoch()));
        let evaluator = Arc::new(JmesPathExpressionEvaluator::new());
        let events = Arc::new(RecordingEventHandler::default());
        let service = MigrationService::new(
            definitions.clone(),
            instances.clone(),
            evaluator.clone(),
            clock.clone(),
            events.clone(),
            config,
        );
        Self {
            definitions,
            instances,
            clock,
            evaluator,
            events,
            service,
        }
    }

    /// Initial clock time
    pub fn epoch() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_default()
    }

    /// Deploy a definition
    pub async fn deploy(&self, definition: ProcessDefinition) -> anyhow::Result<Arc<ProcessDefinition>> {
        let id = definition.id.clone();
        self.definitions.save(definition).await?;
        self.definitions
            .find_by_id(&id)
            .await?
            .ok_or_else(|| anyhow!("definition {} vanished after deploy", id))
    }

    /// Start an instance with one execution in each of `activities`
    pub async fn start_before(
        &self,
        definition: &ProcessDefinition,
        id: &str,
        activities: &[&str],
    ) -> anyhow::Result<ProcessInstance> {
        self.start_with_variables(definition, id, activities, BTreeMap::new())
            .await
    }

    /// Like [`TestEngine::start_before`] with root variables
    pub async fn start_with_variables(
        &self,
        definition: &ProcessDefinition,
        id: &str,
        activities: &[&str],
        variables: BTreeMap<String, TypedValue>,
    ) -> anyhow::Result<ProcessInstance> {
        let starter = InstanceStarter::new(definition, self.evaluator.as_ref(), self.clock.as_ref());
        let mut instance = starter.start(ProcessInstanceId::from(id), None, variables)?;
        for activity in activities {
            starter
                .start_before(&mut instance, &ActivityId::from(*activity))
                .with_context(|| format!("starting {} before {}", id, activity))?;
        }
        self.instances.insert(&instance).await?;
        Ok(instance)
    }

    /// Start an instance inside a multi-instance activity with `instances` inner instances
    pub async fn start_multi_instance(
        &self,
        definition: &ProcessDefinition,
        id: &str,
        inner: &str,
        instances: usize,
    ) -> anyhow::Result<ProcessInstance> {
        let starter = InstanceStarter::new(definition, self.evaluator.as_ref(), self.clock.as_ref());
        let mut instance = starter.start(ProcessInstanceId::from(id), None, BTreeMap::new())?;
        starter.start_multi_instance(&mut instance, &ActivityId::from(inner), instances)?;
        self.instances.insert(&instance).await?;
        Ok(instance)
    }

    /// Load a stored instance
    pub async fn instance(&self, id: &str) -> anyhow::Result<ProcessInstance> {
        self.instances
            .find_by_id(&ProcessInstanceId::from(id))
            .await?
            .ok_or_else(|| anyhow!("process instance {} not found", id))
    }

    /// Store a modified instance with an optimistic version check
    pub async fn store(&self, instance: &ProcessInstance) -> anyhow::Result<ProcessInstance> {
        self.instances.save(instance, instance.version).await?;
        self.instance(&instance.id.0).await
    }

    /// Complete the (first) execution in `activity` and store the result
    pub async fn complete(&self, id: &str, activity: &str) -> anyhow::Result<ProcessInstance> {
        let mut instance = self.instance(id).await?;
        let definition = self
            .definitions
            .find_by_id(&instance.process_definition_id)
            .await?
            .ok_or_else(|| anyhow!("definition {} not found", instance.process_definition_id))?;
        let execution = instance
            .executions_in(&ActivityId::from(activity))
            .first()
            .map(|e| e.id.clone())
            .ok_or_else(|| anyhow!("no execution in {}", activity))?;
        instance.complete_execution(&execution, &definition, self.clock.now())?;
        self.store(&instance).await
    }

    /// Start a plan between two definitions
    pub fn plan(
        &self,
        source: &Arc<ProcessDefinition>,
        target: &Arc<ProcessDefinition>,
    ) -> MigrationPlanBuilder {
        MigrationPlan::builder(source.clone(), target.clone())
    }

    /// Migrate instances synchronously
    pub async fn migrate(
        &self,
        plan: &MigrationPlan,
        ids: &[&str],
    ) -> Result<MigrationExecutionReport, MigrationError> {
        self.service
            .new_migration(plan.clone())
            .process_instance_ids(ids.iter().copied())
            .execute()
            .await
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}
