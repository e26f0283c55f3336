//! Configuration for the migration runner
//!
//! Values come from `PIVOT_*` environment variables on top of defaults.

use serde::{Deserialize, Serialize};
use std::env;
use tracing::{info, warn};

/// Migration runner configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Work items of an async batch processed in parallel
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// How often a per-instance migration is retried after a concurrent modification
    #[serde(default = "default_max_conflict_retries")]
    pub max_conflict_retries: u32,

    /// Instances per async work item
    #[serde(default = "default_batch_chunk_size")]
    pub batch_chunk_size: usize,

    /// Tracing filter directive
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_worker_count() -> usize {
    4
}

fn default_max_conflict_retries() -> u32 {
    3
}

fn default_batch_chunk_size() -> usize {
    50
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            max_conflict_retries: default_max_conflict_retries(),
            batch_chunk_size: default_batch_chunk_size(),
            log_filter: default_log_filter(),
        }
    }
}

impl MigrationConfig {
    /// Load configuration from environment variables
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup, starting from defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(workers) = lookup("PIVOT_MIGRATION_WORKERS") {
            match workers.parse::<usize>() {
                Ok(n) if n > 0 => config.worker_count = n,
                _ => warn!("Invalid PIVOT_MIGRATION_WORKERS value: {}", workers),
            }
        }

        if let Some(retries) = lookup("PIVOT_MIGRATION_MAX_CONFLICT_RETRIES") {
            if let Ok(n) = retries.parse::<u32>() {
                config.max_conflict_retries = n;
            } else {
                warn!("Invalid PIVOT_MIGRATION_MAX_CONFLICT_RETRIES value: {}", retries);
            }
        }

        if let Some(chunk) = lookup("PIVOT_MIGRATION_BATCH_CHUNK_SIZE") {
            match chunk.parse::<usize>() {
                Ok(n) if n > 0 => config.batch_chunk_size = n,
                _ => warn!("Invalid PIVOT_MIGRATION_BATCH_CHUNK_SIZE value: {}", chunk),
            }
        }

        if let Some(filter) = lookup("PIVOT_LOG_FILTER") {
            config.log_filter = filter;
        }

        info!(
            worker_count = config.worker_count,
            max_conflict_retries = config.max_conflict_retries,
            batch_chunk_size = config.batch_chunk_size,
            "Loaded migration configuration"
        );
        config
    }
}
