//! # Folio Common Library
//!
//! Shared code for the Folio generation services including:
//! - Error types (Error enum, Result alias)
//! - Event types (ExecutionEvent enum) and the broadcast EventBus
//! - Configuration resolution (environment > config file > default)

pub mod config;
pub mod error;
pub mod events;

pub use error::{Error, Result};
pub use events::{EventBus, ExecutionEvent};
