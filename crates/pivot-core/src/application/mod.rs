/// Migration runner: plan creation and per-instance migration, sync or as a batch
pub mod migration_service;
