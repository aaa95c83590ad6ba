//! Common error types for Folio

use thiserror::Error;

/// Common result type for Folio operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across Folio services
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Missing or unrecognized credential
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Recognized credential without the required entitlement
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Job queue or broker failure
    #[error("Queue error: {0}")]
    Queue(String),

    /// Text generation backend failure
    #[error("Generator error: {0}")]
    Generator(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}
