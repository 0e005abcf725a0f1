//! Service layer module.
//!
//! Provides the service container that wires and runs all application services.

pub mod container;

pub use container::ServiceContainer;
