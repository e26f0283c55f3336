/// Process definition domain models
pub mod process_definition;

/// Process instance domain models
pub mod process_instance;

/// Entering activities and instantiating their triggers
pub mod instantiation;

/// Timer definitions
pub mod timer;

/// Domain events
pub mod events;

/// Repository interfaces
pub mod repository;
