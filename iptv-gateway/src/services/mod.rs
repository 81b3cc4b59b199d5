//! Service layer: wiring and lifecycle of the gateway components.

pub mod container;

pub use container::ServiceContainer;
