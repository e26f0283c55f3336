//! Repository traits for the Pivot core
//!
//! Persistence collaborators used by the migration runner. External crates
//! can implement these traits to provide different persistence mechanisms.
//! Instance saves are guarded by an optimistic version check so that a
//! migration never overwrites a concurrent change.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::process_definition::{ActivityId, ProcessDefinition, ProcessDefinitionId};
use super::process_instance::{ProcessInstance, ProcessInstanceId, ProcessInstanceState};
use crate::CoreError;

/// Filter selecting process instances
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInstanceQuery {
    /// Only instances of this definition
    pub process_definition_id: Option<ProcessDefinitionId>,

    /// Only instances with this business key
    pub business_key: Option<String>,

    /// Only instances with an execution in this activity
    pub activity_id: Option<ActivityId>,

    /// Only suspended (`true`) or active (`false`) instances
    pub suspended: Option<bool>,
}

impl ProcessInstanceQuery {
    /// Match every instance
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to a definition
    pub fn process_definition_id(mut self, id: ProcessDefinitionId) -> Self {
        self.process_definition_id = Some(id);
        self
    }

    /// Restrict to a business key
    pub fn business_key(mut self, key: impl Into<String>) -> Self {
        self.business_key = Some(key.into());
        self
    }

    /// Restrict to instances currently in an activity
    pub fn activity_id(mut self, id: ActivityId) -> Self {
        self.activity_id = Some(id);
        self
    }

    /// Restrict by suspension state
    pub fn suspended(mut self, suspended: bool) -> Self {
        self.suspended = Some(suspended);
        self
    }

    /// Whether an instance satisfies the filter; ended instances never match
    pub fn matches(&self, instance: &ProcessInstance) -> bool {
        instance.state == ProcessInstanceState::Active
            && self
                .process_definition_id
                .as_ref()
                .map_or(true, |id| instance.process_definition_id == *id)
            && self
                .business_key
                .as_ref()
                .map_or(true, |key| instance.business_key.as_ref() == Some(key))
            && self
                .activity_id
                .as_ref()
                .map_or(true, |a| !instance.executions_in(a).is_empty())
            && self.suspended.map_or(true, |s| instance.suspended == s)
    }
}

/// Repository for process definitions
#[async_trait]
pub trait ProcessDefinitionRepository: Send + Sync {
    /// Find a process definition by ID
    async fn find_by_id(
        &self,
        id: &ProcessDefinitionId,
    ) -> Result<Option<Arc<ProcessDefinition>>, CoreError>;

    /// Save a process definition
    async fn save(&self, definition: ProcessDefinition) -> Result<(), CoreError>;

    /// Delete a process definition
    async fn delete(&self, id: &ProcessDefinitionId) -> Result<(), CoreError>;

    /// List all process definition ids
    async fn list_definitions(&self) -> Result<Vec<ProcessDefinitionId>, CoreError>;
}

/// Repository for process instances
#[async_trait]
pub trait ProcessInstanceRepository: Send + Sync {
    /// Find a process instance by ID
    async fn find_by_id(&self, id: &ProcessInstanceId)
        -> Result<Option<ProcessInstance>, CoreError>;

    /// Ids of the instances matching a query, in a stable order
    async fn find_ids(
        &self,
        query: &ProcessInstanceQuery,
    ) -> Result<Vec<ProcessInstanceId>, CoreError>;

    /// Store a new instance
    async fn insert(&self, instance: &ProcessInstance) -> Result<(), CoreError>;

    /// Replace a stored instance if its stored version still equals
    /// `expected_version`. Returns the new version.
    async fn save(
        &self,
        instance: &ProcessInstance,
        expected_version: u64,
    ) -> Result<u64, CoreError>;

    /// Delete an instance
    async fn delete(&self, id: &ProcessInstanceId) -> Result<(), CoreError>;
}

/// Memory implementations for testing
#[cfg(feature = "testing")]
pub mod memory {
    use super::*;
    use dashmap::mapref::entry::Entry;
    use dashmap::DashMap;
    use std::collections::HashMap;
    use std::sync::RwLock;

    /// In-memory implementation of the process instance repository using a
    /// concurrent map to reduce lock contention
    pub struct MemoryProcessInstanceRepository {
        instances: Arc<DashMap<String, ProcessInstance>>,
    }

    impl MemoryProcessInstanceRepository {
        /// Create a new memory process instance repository
        pub fn new() -> Self {
            Self {
                instances: Arc::new(DashMap::with_capacity(64)),
            }
        }

        /// Number of stored instances
        pub fn len(&self) -> usize {
            self.instances.len()
        }

        /// Whether the repository is empty
        pub fn is_empty(&self) -> bool {
            self.instances.is_empty()
        }
    }

    impl Default for MemoryProcessInstanceRepository {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl ProcessInstanceRepository for MemoryProcessInstanceRepository {
        async fn find_by_id(
            &self,
            id: &ProcessInstanceId,
        ) -> Result<Option<ProcessInstance>, CoreError> {
            Ok(self.instances.get(&id.0).map(|instance| instance.clone()))
        }

        async fn find_ids(
            &self,
            query: &ProcessInstanceQuery,
        ) -> Result<Vec<ProcessInstanceId>, CoreError> {
            let mut ids: Vec<ProcessInstanceId> = self
                .instances
                .iter()
                .filter(|entry| query.matches(entry.value()))
                .map(|entry| entry.value().id.clone())
                .collect();
            ids.sort();
            Ok(ids)
        }

        async fn insert(&self, instance: &ProcessInstance) -> Result<(), CoreError> {
            match self.instances.entry(instance.id.0.clone()) {
                Entry::Occupied(_) => Err(CoreError::StateStoreError(format!(
                    "Process instance already exists: {}",
                    instance.id
                ))),
                Entry::Vacant(entry) => {
                    entry.insert(instance.clone());
                    Ok(())
                }
            }
        }

        async fn save(
            &self,
            instance: &ProcessInstance,
            expected_version: u64,
        ) -> Result<u64, CoreError> {
            match self.instances.entry(instance.id.0.clone()) {
                Entry::Occupied(mut entry) => {
                    let actual_version = entry.get().version;
                    if actual_version != expected_version {
                        return Err(CoreError::ConcurrentModification {
                            instance_id: instance.id.0.clone(),
                            expected_version,
                            actual_version,
                        });
                    }
                    let mut stored = instance.clone();
                    stored.version = expected_version + 1;
                    entry.insert(stored);
                    Ok(expected_version + 1)
                }
                Entry::Vacant(_) => Err(CoreError::ProcessInstanceNotFound(instance.id.0.clone())),
            }
        }

        async fn delete(&self, id: &ProcessInstanceId) -> Result<(), CoreError> {
            self.instances.remove(&id.0);
            Ok(())
        }
    }

    /// In-memory implementation of the process definition repository
    pub struct MemoryProcessDefinitionRepository {
        definitions: Arc<RwLock<HashMap<String, Arc<ProcessDefinition>>>>,
    }

    impl MemoryProcessDefinitionRepository {
        /// Create a new memory process definition repository
        pub fn new() -> Self {
            Self {
                definitions: Arc::new(RwLock::new(HashMap::new())),
            }
        }
    }

    impl Default for MemoryProcessDefinitionRepository {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl ProcessDefinitionRepository for MemoryProcessDefinitionRepository {
        async fn find_by_id(
            &self,
            id: &ProcessDefinitionId,
        ) -> Result<Option<Arc<ProcessDefinition>>, CoreError> {
            let definitions = self.definitions.read().map_err(|e| {
                CoreError::StateStoreError(format!("Failed to acquire read lock: {}", e))
            })?;

            Ok(definitions.get(&id.0).cloned())
        }

        async fn save(&self, definition: ProcessDefinition) -> Result<(), CoreError> {
            let mut definitions = self.definitions.write().map_err(|e| {
                CoreError::StateStoreError(format!("Failed to acquire write lock: {}", e))
            })?;

            definitions.insert(definition.id.0.clone(), Arc::new(definition));

            Ok(())
        }

        async fn delete(&self, id: &ProcessDefinitionId) -> Result<(), CoreError> {
            let mut definitions = self.definitions.write().map_err(|e| {
                CoreError::StateStoreError(format!("Failed to acquire write lock: {}", e))
            })?;

            definitions.remove(&id.0);

            Ok(())
        }

        async fn list_definitions(&self) -> Result<Vec<ProcessDefinitionId>, CoreError> {
            let definitions = self.definitions.read().map_err(|e| {
                CoreError::StateStoreError(format!("Failed to acquire read lock: {}", e))
            })?;

            let mut result: Vec<ProcessDefinitionId> = definitions
                .keys()
                .map(|id| ProcessDefinitionId(id.clone()))
                .collect();
            result.sort();

            Ok(result)
        }
    }
}
