//! HTTP API handlers for folio-engine

pub mod events;
pub mod executions;
pub mod health;
pub mod internal;
pub mod queue_ops;

pub use events::execution_event_stream;
pub use executions::execution_routes;
pub use health::health_routes;
pub use internal::internal_routes;
pub use queue_ops::queue_routes;
