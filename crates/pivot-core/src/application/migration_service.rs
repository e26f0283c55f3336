use crate::{
    clock::Clock,
    config::MigrationConfig,
    domain::events::{DomainEvent, ProcessInstanceMigrationFailed},
    domain::process_definition::ProcessDefinitionId,
    domain::process_instance::{ProcessInstance, ProcessInstanceId},
    domain::repository::{ProcessDefinitionRepository, ProcessInstanceQuery, ProcessInstanceRepository},
    expression::ExpressionEvaluator,
    migration::instance_validation::validate_instance,
    migration::{MigrationError, MigrationPlan, MigrationPlanBuilder, MigrationTransformer},
    CoreError,
};
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Handler for domain events
#[async_trait]
pub trait DomainEventHandler: Send + Sync {
    /// Handle a domain event
    async fn handle_event(&self, event: Box<dyn DomainEvent>) -> Result<(), CoreError>;
}

/// Service for migrating process instances between definitions
pub struct MigrationService {
    /// Repository for process definitions
    definition_repo: Arc<dyn ProcessDefinitionRepository>,

    /// Repository for process instances
    instance_repo: Arc<dyn ProcessInstanceRepository>,

    /// Evaluator for event names and timer expressions
    evaluator: Arc<dyn ExpressionEvaluator>,

    /// Time source
    clock: Arc<dyn Clock>,

    /// Event handler
    event_handler: Arc<dyn DomainEventHandler>,

    /// Runner configuration
    config: MigrationConfig,
}

impl MigrationService {
    /// Create a new migration service
    pub fn new(
        definition_repo: Arc<dyn ProcessDefinitionRepository>,
        instance_repo: Arc<dyn ProcessInstanceRepository>,
        evaluator: Arc<dyn ExpressionEvaluator>,
        clock: Arc<dyn Clock>,
        event_handler: Arc<dyn DomainEventHandler>,
        config: MigrationConfig,
    ) -> Self {
        Self {
            definition_repo,
            instance_repo,
            evaluator,
            clock,
            event_handler,
            config,
        }
    }

    /// Runner configuration
    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Start a plan between two deployed definitions
    pub async fn create_migration_plan(
        &self,
        source: &ProcessDefinitionId,
        target: &ProcessDefinitionId,
    ) -> Result<MigrationPlanBuilder, CoreError> {
        let source_definition = self
            .definition_repo
            .find_by_id(source)
            .await?
            .ok_or_else(|| CoreError::ProcessDefinitionNotFound(source.0.clone()))?;
        let target_definition = self
            .definition_repo
            .find_by_id(target)
            .await?
            .ok_or_else(|| CoreError::ProcessDefinitionNotFound(target.0.clone()))?;
        Ok(MigrationPlan::builder(source_definition, target_definition))
    }

    /// Select the instances a plan is applied to
    pub fn new_migration(&self, plan: MigrationPlan) -> MigrationExecutionBuilder {
        MigrationExecutionBuilder {
            service: self.clone(),
            plan,
            ids: Vec::new(),
            query: None,
        }
    }

    /// Migrate one instance in its own unit of work, retrying on
    /// concurrent modification. Returns the number of applied operations.
    pub async fn migrate_instance(
        &self,
        plan: &MigrationPlan,
        id: &ProcessInstanceId,
    ) -> Result<usize, MigrationError> {
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            let instance = self
                .instance_repo
                .find_by_id(id)
                .await?
                .ok_or_else(|| MigrationError::ProcessInstanceNotFound(id.clone()))?;
            let expected_version = instance.version;
            if instance.process_definition_id != *plan.source_process_definition_id() {
                return Err(MigrationError::WrongProcessDefinition {
                    instance_id: id.clone(),
                    expected: plan.source_process_definition_id().clone(),
                    actual: instance.process_definition_id.clone(),
                });
            }

            let outcome = {
                validate_instance(&instance, plan).map_err(MigrationError::InstanceValidation)?;
                MigrationTransformer::new(plan, self.evaluator.as_ref(), self.clock.as_ref())
                    .migrate(&instance)?
            };
            let operation_count = outcome.operations.len();
            let mut migrated = outcome.instance;

            match self.instance_repo.save(&migrated, expected_version).await {
                Ok(version) => {
                    migrated.version = version;
                    debug!(
                        process_instance_id = %id,
                        version,
                        operations = operation_count,
                        "Committed migrated process instance"
                    );
                    self.handle_events(&mut migrated).await;
                    return Ok(operation_count);
                }
                Err(CoreError::ConcurrentModification {
                    expected_version,
                    actual_version,
                    ..
                }) => {
                    if attempts > self.config.max_conflict_retries {
                        return Err(MigrationError::ConcurrentModification {
                            instance_id: id.clone(),
                            attempts,
                        });
                    }
                    warn!(
                        process_instance_id = %id,
                        expected_version,
                        actual_version,
                        attempt = attempts,
                        "Process instance changed during migration, retrying"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Migrate one instance and record the result in `report`. A panic while
    /// migrating is reported as an invariant violation of that instance.
    async fn migrate_into_report(
        &self,
        plan: &MigrationPlan,
        id: &ProcessInstanceId,
        report: &mut MigrationExecutionReport,
    ) {
        let result = AssertUnwindSafe(self.migrate_instance(plan, id))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| {
                error!(process_instance_id = %id, "Process instance migration panicked");
                Err(MigrationError::InvariantViolation {
                    instance_id: id.clone(),
                    message: format!("Migration panicked: {}", panic_message(&*payload)),
                })
            });
        match result {
            Ok(_) => report.migrated.push(id.clone()),
            Err(error) => {
                self.record_failure(id, &error).await;
                report.failures.push(InstanceMigrationFailure {
                    instance_id: id.clone(),
                    error,
                });
            }
        }
    }

    async fn record_failure(&self, id: &ProcessInstanceId, error: &MigrationError) {
        warn!(
            process_instance_id = %id,
            code = error.code(),
            error = %error,
            "Process instance migration failed"
        );
        let event = ProcessInstanceMigrationFailed {
            process_instance_id: id.clone(),
            code: error.code(),
            message: error.to_string(),
            timestamp: self.clock.now(),
        };
        if let Err(e) = self.event_handler.handle_event(Box::new(event)).await {
            error!(process_instance_id = %id, error = %e, "Failed to dispatch migration failure event");
        }
    }

    /// Dispatch the events recorded on a committed instance. The commit is
    /// final, so dispatch errors are logged and not propagated.
    async fn handle_events(&self, instance: &mut ProcessInstance) {
        for event in instance.take_events() {
            let event_type = event.event_type();
            if let Err(e) = self.event_handler.handle_event(event).await {
                error!(
                    process_instance_id = %instance.id,
                    event_type,
                    error = %e,
                    "Failed to dispatch domain event"
                );
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown cause")
}

/// Clone implementation for MigrationService
impl Clone for MigrationService {
    fn clone(&self) -> Self {
        Self {
            definition_repo: self.definition_repo.clone(),
            instance_repo: self.instance_repo.clone(),
            evaluator: self.evaluator.clone(),
            clock: self.clock.clone(),
            event_handler: self.event_handler.clone(),
            config: self.config.clone(),
        }
    }
}

/// Why one instance was not migrated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceMigrationFailure {
    /// Rejected instance
    pub instance_id: ProcessInstanceId,

    /// Reason, with a stable code
    pub error: MigrationError,
}

/// Per-instance result of a migration run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationExecutionReport {
    /// Committed instances, in processing order
    pub migrated: Vec<ProcessInstanceId>,

    /// Rejected instances, in processing order
    pub failures: Vec<InstanceMigrationFailure>,
}

impl MigrationExecutionReport {
    /// Whether every selected instance was migrated
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Failure recorded for an instance
    pub fn failure(&self, id: &str) -> Option<&MigrationError> {
        self.failures
            .iter()
            .find(|f| f.instance_id.0 == id)
            .map(|f| &f.error)
    }

    fn merge(&mut self, other: MigrationExecutionReport) {
        self.migrated.extend(other.migrated);
        self.failures.extend(other.failures);
    }
}

/// Selects the instances of one migration run and executes it
pub struct MigrationExecutionBuilder {
    service: MigrationService,
    plan: MigrationPlan,
    ids: Vec<ProcessInstanceId>,
    query: Option<ProcessInstanceQuery>,
}

impl MigrationExecutionBuilder {
    /// Add explicit instance ids
    pub fn process_instance_ids<I, T>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<ProcessInstanceId>,
    {
        self.ids.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Add the instances matching a query
    pub fn process_instance_query(mut self, query: ProcessInstanceQuery) -> Self {
        self.query = Some(query);
        self
    }

    /// Explicit ids followed by query results, without duplicates
    async fn resolve_ids(&self) -> Result<Vec<ProcessInstanceId>, MigrationError> {
        if self.ids.iter().any(|id| id.0.is_empty()) {
            return Err(MigrationError::NullProcessInstanceId);
        }
        let mut ids = self.ids.clone();
        if let Some(query) = &self.query {
            ids.extend(self.service.instance_repo.find_ids(query).await?);
        }

        let mut seen = HashSet::new();
        ids.retain(|id| seen.insert(id.clone()));
        if ids.is_empty() {
            return Err(MigrationError::ProcessInstanceIdsEmpty);
        }
        Ok(ids)
    }

    /// Migrate every selected instance in sequence
    pub async fn execute(self) -> Result<MigrationExecutionReport, MigrationError> {
        let ids = self.resolve_ids().await?;
        info!(
            source_process_definition_id = %self.plan.source_process_definition_id(),
            target_process_definition_id = %self.plan.target_process_definition_id(),
            instances = ids.len(),
            "Migrating process instances"
        );

        let mut report = MigrationExecutionReport::default();
        for id in &ids {
            self.service
                .migrate_into_report(&self.plan, id, &mut report)
                .await;
        }

        info!(
            migrated = report.migrated.len(),
            failed = report.failures.len(),
            "Migration finished"
        );
        Ok(report)
    }

    /// Submit the selected instances as a batch of work items processed in
    /// the background
    pub async fn execute_async(self) -> Result<MigrationBatch, MigrationError> {
        let ids = self.resolve_ids().await?;
        let config = self.service.config().clone();
        let batch_id = Uuid::new_v4();
        let cancelled = Arc::new(AtomicBool::new(false));
        let semaphore = Arc::new(Semaphore::new(config.worker_count.max(1)));
        let plan = Arc::new(self.plan);

        let mut work_items = Vec::new();
        for chunk in ids.chunks(config.batch_chunk_size.max(1)) {
            let chunk = chunk.to_vec();
            let service = self.service.clone();
            let plan = plan.clone();
            let semaphore = semaphore.clone();
            let cancelled = cancelled.clone();
            let partial = Arc::new(Mutex::new(MigrationExecutionReport::default()));
            let handle = tokio::spawn({
                let chunk = chunk.clone();
                let partial = partial.clone();
                async move {
                    let _permit = semaphore.acquire_owned().await;
                    for id in chunk {
                        let mut report = MigrationExecutionReport::default();
                        if cancelled.load(Ordering::SeqCst) {
                            let error = MigrationError::Cancelled(id.clone());
                            service.record_failure(&id, &error).await;
                            report.failures.push(InstanceMigrationFailure {
                                instance_id: id,
                                error,
                            });
                        } else {
                            service.migrate_into_report(&plan, &id, &mut report).await;
                        }
                        partial
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .merge(report);
                    }
                }
            });
            work_items.push(WorkItem {
                chunk,
                partial,
                handle,
            });
        }

        info!(
            batch_id = %batch_id,
            instances = ids.len(),
            work_items = work_items.len(),
            "Submitted migration batch"
        );
        Ok(MigrationBatch {
            id: batch_id,
            cancelled,
            work_items,
        })
    }
}

/// Handle of an asynchronous migration batch
pub struct MigrationBatch {
    /// Batch id
    pub id: Uuid,

    cancelled: Arc<AtomicBool>,

    work_items: Vec<WorkItem>,
}

/// One chunk of a batch and the results it has recorded so far
struct WorkItem {
    chunk: Vec<ProcessInstanceId>,
    partial: Arc<Mutex<MigrationExecutionReport>>,
    handle: JoinHandle<()>,
}

impl MigrationBatch {
    /// Stop migrating instances that have not been started yet. Instances
    /// already committed stay migrated.
    pub fn cancel(&self) {
        info!(batch_id = %self.id, "Cancelling migration batch");
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Number of work items in the batch
    pub fn work_item_count(&self) -> usize {
        self.work_items.len()
    }

    /// Wait for every work item and combine their reports in submission
    /// order. Instances an aborted work item never reached are reported as
    /// storage failures; the results it recorded before aborting are kept.
    pub async fn wait(self) -> MigrationExecutionReport {
        let (items, handles): (Vec<_>, Vec<_>) = self
            .work_items
            .into_iter()
            .map(|item| ((item.chunk, item.partial), item.handle))
            .unzip();
        let results = futures::future::join_all(handles).await;

        let mut report = MigrationExecutionReport::default();
        for ((chunk, partial), result) in items.into_iter().zip(results) {
            let mut partial = std::mem::take(&mut *partial.lock().unwrap_or_else(PoisonError::into_inner));
            if let Err(e) = result {
                error!(batch_id = %self.id, error = %e, "Migration work item aborted");
                let processed: HashSet<ProcessInstanceId> = partial
                    .migrated
                    .iter()
                    .chain(partial.failures.iter().map(|f| &f.instance_id))
                    .cloned()
                    .collect();
                for id in chunk.into_iter().filter(|id| !processed.contains(id)) {
                    partial.failures.push(InstanceMigrationFailure {
                        error: MigrationError::Storage(CoreError::Other(format!(
                            "Work item aborted: {}",
                            e
                        ))),
                        instance_id: id,
                    });
                }
            }
            report.merge(partial);
        }
        info!(
            batch_id = %self.id,
            migrated = report.migrated.len(),
            failed = report.failures.len(),
            "Migration batch finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::domain::instantiation::InstanceStarter;
    use crate::domain::process_definition::{Activity, ActivityId, ProcessDefinition};
    use crate::domain::repository::memory::{
        MemoryProcessDefinitionRepository, MemoryProcessInstanceRepository,
    };
    use crate::expression::JmesPathExpressionEvaluator;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingHandler {
        events: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl DomainEventHandler for RecordingHandler {
        async fn handle_event(&self, event: Box<dyn DomainEvent>) -> Result<(), CoreError> {
            if let Ok(mut events) = self.events.lock() {
                events.push(event.event_type());
            }
            Ok(())
        }
    }

    fn definition(key: &str) -> ProcessDefinition {
        ProcessDefinition::builder(key)
            .activity(Activity::user_task("userTask"))
            .build()
            .unwrap()
    }

    struct Fixture {
        service: MigrationService,
        instances: Arc<MemoryProcessInstanceRepository>,
        handler: Arc<RecordingHandler>,
        plan: MigrationPlan,
    }

    /// Memory repository whose `save` panics for one instance
    struct PanickingSaveRepository {
        inner: Arc<MemoryProcessInstanceRepository>,
        fails_on: ProcessInstanceId,
    }

    #[async_trait]
    impl ProcessInstanceRepository for PanickingSaveRepository {
        async fn find_by_id(
            &self,
            id: &ProcessInstanceId,
        ) -> Result<Option<ProcessInstance>, CoreError> {
            self.inner.find_by_id(id).await
        }

        async fn find_ids(
            &self,
            query: &ProcessInstanceQuery,
        ) -> Result<Vec<ProcessInstanceId>, CoreError> {
            self.inner.find_ids(query).await
        }

        async fn insert(&self, instance: &ProcessInstance) -> Result<(), CoreError> {
            self.inner.insert(instance).await
        }

        async fn save(
            &self,
            instance: &ProcessInstance,
            expected_version: u64,
        ) -> Result<u64, CoreError> {
            if instance.id == self.fails_on {
                panic!("lost connection while saving {}", instance.id);
            }
            self.inner.save(instance, expected_version).await
        }

        async fn delete(&self, id: &ProcessInstanceId) -> Result<(), CoreError> {
            self.inner.delete(id).await
        }
    }

    async fn fixture(instance_count: usize) -> Fixture {
        fixture_with(instance_count, |instances| instances).await
    }

    async fn fixture_with<F>(instance_count: usize, repository: F) -> Fixture
    where
        F: FnOnce(Arc<MemoryProcessInstanceRepository>) -> Arc<dyn ProcessInstanceRepository>,
    {
        let definitions = Arc::new(MemoryProcessDefinitionRepository::new());
        definitions.save(definition("source")).await.unwrap();
        definitions.save(definition("target")).await.unwrap();
        let instances = Arc::new(MemoryProcessInstanceRepository::new());
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()));
        let evaluator = Arc::new(JmesPathExpressionEvaluator::new());
        let handler = Arc::new(RecordingHandler::default());

        let source = definition("source");
        let starter = InstanceStarter::new(&source, evaluator.as_ref(), clock.as_ref());
        for i in 0..instance_count {
            let mut instance = starter
                .start(ProcessInstanceId(format!("pi-{}", i)), None, BTreeMap::new())
                .unwrap();
            starter
                .start_before(&mut instance, &ActivityId::from("userTask"))
                .unwrap();
            instances.insert(&instance).await.unwrap();
        }

        let service = MigrationService::new(
            definitions,
            repository(instances.clone()),
            evaluator,
            clock,
            handler.clone(),
            MigrationConfig {
                batch_chunk_size: 2,
                ..MigrationConfig::default()
            },
        );
        let plan = service
            .create_migration_plan(&ProcessDefinitionId::from("source:1"), &ProcessDefinitionId::from("target:1"))
            .await
            .unwrap()
            .map_equal_activities()
            .build()
            .unwrap();
        Fixture {
            service,
            instances,
            handler,
            plan,
        }
    }

    #[tokio::test]
    async fn test_execute_migrates_and_dispatches_events() {
        let f = fixture(2).await;
        let report = f
            .service
            .new_migration(f.plan.clone())
            .process_instance_ids(["pi-0", "pi-1", "pi-0"])
            .execute()
            .await
            .unwrap();

        assert!(report.is_success());
        assert_eq!(report.migrated.len(), 2);
        let stored = f
            .instances
            .find_by_id(&ProcessInstanceId::from("pi-0"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.process_definition_id, ProcessDefinitionId::from("target:1"));
        assert_eq!(stored.version, 1);
        let events = f.handler.events.lock().unwrap().clone();
        assert_eq!(events, vec!["process_instance.migrated", "process_instance.migrated"]);
    }

    #[tokio::test]
    async fn test_batch_level_errors() {
        let f = fixture(1).await;
        let empty = f
            .service
            .new_migration(f.plan.clone())
            .execute()
            .await
            .unwrap_err();
        assert_eq!(empty.code(), "MIG-001");

        let null = f
            .service
            .new_migration(f.plan.clone())
            .process_instance_ids(["pi-0", ""])
            .execute()
            .await
            .unwrap_err();
        assert_eq!(null.code(), "MIG-002");
    }

    #[tokio::test]
    async fn test_unknown_instance_does_not_stop_others() {
        let f = fixture(1).await;
        let report = f
            .service
            .new_migration(f.plan.clone())
            .process_instance_ids(["missing", "pi-0"])
            .execute()
            .await
            .unwrap();

        assert_eq!(report.migrated, vec![ProcessInstanceId::from("pi-0")]);
        assert_eq!(report.failure("missing").map(|e| e.code()), Some("MIG-004"));
        let events = f.handler.events.lock().unwrap().clone();
        assert!(events.contains(&"process_instance.migration_failed"));
    }

    #[tokio::test]
    async fn test_async_batch_by_query() {
        let f = fixture(5).await;
        let batch = f
            .service
            .new_migration(f.plan.clone())
            .process_instance_query(
                ProcessInstanceQuery::new().process_definition_id(ProcessDefinitionId::from("source:1")),
            )
            .execute_async()
            .await
            .unwrap();
        assert_eq!(batch.work_item_count(), 3);

        let report = batch.wait().await;
        assert_eq!(report.migrated.len(), 5);
        assert!(report.is_success());
    }

    #[tokio::test]
    async fn test_cancelled_batch_reports_remaining_instances() {
        let f = fixture(3).await;
        let batch = f
            .service
            .new_migration(f.plan.clone())
            .process_instance_ids(["pi-0", "pi-1", "pi-2"])
            .execute_async()
            .await
            .unwrap();
        batch.cancel();
        let report = batch.wait().await;

        assert_eq!(report.migrated.len() + report.failures.len(), 3);
        for failure in &report.failures {
            assert_eq!(failure.error.code(), "MIG-011");
        }
    }

    fn panics_on_pi_1(inner: Arc<MemoryProcessInstanceRepository>) -> Arc<dyn ProcessInstanceRepository> {
        Arc::new(PanickingSaveRepository {
            inner,
            fails_on: ProcessInstanceId::from("pi-1"),
        })
    }

    #[tokio::test]
    async fn test_panic_fails_only_its_instance() {
        let f = fixture_with(3, panics_on_pi_1).await;
        let report = f
            .service
            .new_migration(f.plan.clone())
            .process_instance_ids(["pi-0", "pi-1", "pi-2"])
            .execute()
            .await
            .unwrap();

        assert_eq!(
            report.migrated,
            vec![ProcessInstanceId::from("pi-0"), ProcessInstanceId::from("pi-2")]
        );
        let failure = report.failure("pi-1").unwrap();
        assert_eq!(failure.code(), "MIG-007");
        assert!(failure.to_string().contains("lost connection while saving pi-1"));

        let untouched = f
            .instances
            .find_by_id(&ProcessInstanceId::from("pi-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(untouched.process_definition_id, ProcessDefinitionId::from("source:1"));
        let events = f.handler.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                "process_instance.migrated",
                "process_instance.migration_failed",
                "process_instance.migrated"
            ]
        );
    }

    #[tokio::test]
    async fn test_panic_keeps_committed_instances_of_its_work_item() {
        let f = fixture_with(3, panics_on_pi_1).await;
        let batch = f
            .service
            .new_migration(f.plan.clone())
            .process_instance_ids(["pi-0", "pi-1", "pi-2"])
            .execute_async()
            .await
            .unwrap();
        assert_eq!(batch.work_item_count(), 2);

        let report = batch.wait().await;
        assert_eq!(
            report.migrated,
            vec![ProcessInstanceId::from("pi-0"), ProcessInstanceId::from("pi-2")]
        );
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failure("pi-1").map(|e| e.code()), Some("MIG-007"));
    }
}
