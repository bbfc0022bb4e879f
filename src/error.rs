//! Error types for the Ratewarden service.

use thiserror::Error;

/// Main error type for Ratewarden operations.
#[derive(Error, Debug)]
pub enum WardenError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Layered settings could not be loaded
    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    /// Counter store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of the distributed counter store.
///
/// These never reach a request handler: the circuit breaker absorbs them and
/// answers from the in-memory fallback instead.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The Redis client reported an error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The increment script returned something other than three integers
    #[error("Invalid script reply: {0}")]
    InvalidReply(String),

    /// The store refused the operation
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Result type alias for Ratewarden operations.
pub type Result<T> = std::result::Result<T, WardenError>;
