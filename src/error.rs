//! Error types for the messaging layer

use thiserror::Error;

/// Error type returned by domain handlers.
///
/// Handlers may fail with any error; the messaging layer only logs it and
/// decides whether to redeliver.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Messaging error types
#[derive(Debug, Error)]
pub enum MessagingError {
    /// Connection error to NATS server
    #[error("Connection error: {0}")]
    Connection(String),

    /// JetStream-specific error
    #[error("JetStream error: {0}")]
    JetStream(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Non-JSON codec failure
    #[error("Codec error: {0}")]
    Codec(String),

    /// Message publishing error
    #[error("Publish error: {0}")]
    Publish(String),

    /// Subscription error
    #[error("Subscribe error: {0}")]
    Subscribe(String),

    /// Request/reply error other than a timeout
    #[error("Request error: {0}")]
    Request(String),

    /// No reply arrived before the deadline
    #[error("Request to '{subject}' timed out")]
    Timeout {
        /// Subject the request was sent to
        subject: String,
    },

    /// Stream or consumer provisioning failed
    #[error("Provisioning error: {0}")]
    Provisioning(String),

    /// NATS client error
    #[error("NATS client error: {0}")]
    Client(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias for messaging operations
pub type Result<T> = std::result::Result<T, MessagingError>;

impl From<async_nats::Error> for MessagingError {
    fn from(err: async_nats::Error) -> Self {
        MessagingError::Client(err.to_string())
    }
}

/// Errors from the state collaborator
#[derive(Debug, Error)]
pub enum StoreError {
    /// Concurrent writers kept winning
    #[error("Update conflict after {attempts} attempts")]
    Conflict {
        /// Attempts made before giving up
        attempts: u32,
    },

    /// The mutation itself refused the current state
    #[error("Update rejected: {0}")]
    Rejected(#[source] BoxError),

    /// Storage backend failure
    #[error("Store error: {0}")]
    Backend(String),
}
