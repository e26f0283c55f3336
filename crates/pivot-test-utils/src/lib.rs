//! Testing utilities for the Pivot migration engine.
//!
//! This crate provides process-model fixtures, assertions over execution
//! trees, and a wired-up [`TestEngine`] with in-memory repositories and a
//! fixed clock, so that integration tests can deploy definitions, start
//! instances at arbitrary activities and migrate them in a few lines.

pub mod assertions;
pub mod engine;
pub mod fixtures;

pub use engine::{RecordedEvent, RecordingEventHandler, TestEngine};
pub use fixtures::ProcessModels;

use std::sync::Once;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Install a test subscriber once per process. `RUST_LOG` overrides the
/// default filter.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,pivot_core=debug"));
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_test_writer()
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}
