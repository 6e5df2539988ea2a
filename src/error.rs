//! Error types for workdeck.

use std::time::Duration;

/// Top-level error type for the agent.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("Execution error: {0}")]
    Exec(#[from] ExecError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the shared store or an agent's local cache.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Failed to open database: {0}")]
    Open(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Duplicate idempotency key: {0}")]
    DuplicateIdempotencyKey(String),

    #[error("Card not found: {0}")]
    NotFound(String),

    #[error("Card {id} is {from}, cannot transition to {to}")]
    InvalidTransition {
        id: String,
        from: String,
        to: String,
    },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Payload admission failures. A card that trips one of these is marked
/// FAILED before any execution is attempted.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("Payload too large: {size} bytes (limit {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Malformed payload: {0}")]
    Malformed(String),
}

/// Change-lifecycle failures. Each variant names the step that failed so the
/// card's result field is diagnosable on its own.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Commit message rejected (no conventional prefix): {0:?}")]
    MessageRejected(String),

    #[error("Lifecycle step '{step}' failed: {detail}")]
    Step { step: &'static str, detail: String },
}

/// Subprocess execution errors.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the agent.
pub type Result<T> = std::result::Result<T, Error>;
