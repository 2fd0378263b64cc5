use crate::idempotency::path::PathError;
use thiserror::Error;

/// Failures raised by a persistence store adapter.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("conditional write rejected for idempotency key {key}")]
    ConditionalCheckFailed { key: String },

    #[error("idempotency record {key} not found")]
    RecordNotFound { key: String },

    #[error("store connection failed: {0}")]
    Connection(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("stored record {key} is corrupt: {reason}")]
    CorruptRecord { key: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PersistenceError {
    pub fn is_conditional_check_failed(&self) -> bool {
        matches!(self, PersistenceError::ConditionalCheckFailed { .. })
    }
}

/// Errors surfaced by the idempotency layer itself.
///
/// Producer errors are never wrapped in this type; callers convert these
/// into their own error through `From<IdempotencyError>`.
#[derive(Debug, Error)]
pub enum IdempotencyError {
    #[error("no idempotency key value found in the payload")]
    MissingIdempotencyKey,

    #[error("execution already in progress for idempotency key {key}")]
    AlreadyInProgress { key: String },

    #[error("payload does not match the stored record for idempotency key {key}")]
    Validation { key: String },

    #[error("{message}: {source}")]
    PersistenceLayer {
        message: String,
        #[source]
        source: PersistenceError,
    },

    #[error("invalid path expression: {0}")]
    InvalidPath(#[from] PathError),

    #[error("invalid idempotency configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to serialize payload: {0}")]
    PayloadSerialization(#[source] serde_json::Error),

    #[error("failed to serialize response: {0}")]
    ResponseSerialization(#[source] serde_json::Error),

    #[error("failed to deserialize stored response for idempotency key {key}: {source}")]
    ResponseDeserialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl IdempotencyError {
    pub fn persistence(message: impl Into<String>, source: PersistenceError) -> Self {
        IdempotencyError::PersistenceLayer {
            message: message.into(),
            source,
        }
    }

    /// Only a concurrent in-flight execution is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, IdempotencyError::AlreadyInProgress { .. })
    }
}

pub type Result<T> = std::result::Result<T, IdempotencyError>;
