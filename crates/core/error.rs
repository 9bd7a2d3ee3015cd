//! Error types for the waitq broker abstraction.

use thiserror::Error;

/// The main error type for the waitq crates.
///
/// Only broker-level lifecycle and connectivity failures are errors. Per-message
/// outcomes (handler failures, exhausted retries, rejected messages) stay inside
/// the consumer loop and are reported through [`Outcome`](crate::Outcome).
#[derive(Error, Debug)]
pub enum WaitqError {
    /// A data-plane operation was attempted while the broker is stopped.
    #[error("Broker is not running")]
    BrokerNotRunning,

    /// `start` was called on a broker that is already running.
    #[error("Broker is already running")]
    AlreadyRunning,

    /// The named queue is not registered with this broker.
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A message payload that cannot become message fields.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Backend-specific error.
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Result type alias using WaitqError.
pub type Result<T> = std::result::Result<T, WaitqError>;
