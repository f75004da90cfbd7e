use thiserror::Error;

/// Storage layer error type.
///
/// Wraps backend I/O errors while preserving the full error chain, and
/// carries the validation failures shared by every backend.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// Attempt to enqueue an `(enrollment id, command uuid)` pair already
    /// present in storage.
    #[error("duplicate command (id={id}, uuid={uuid})")]
    DuplicateCommand { id: String, uuid: String },

    /// A response arrived for a command uuid with no live row.
    #[error("command not found: {0}")]
    CommandNotFound(String),

    /// An empty id or command uuid was used as a lookup key.
    #[error("empty id or command uuid")]
    EmptyKey,

    #[error("empty storage step")]
    EmptyStep,

    #[error("missing workflow name")]
    MissingWorkflowName,

    #[error("missing instance id")]
    MissingInstanceId,

    #[error("missing IDs")]
    MissingIds,

    #[error("missing commands")]
    MissingCommands,

    #[error("empty result report")]
    EmptyResultReport,

    #[error("missing event type")]
    MissingEvent,

    #[error("invalid event type: {0}")]
    InvalidEventType(String),

    /// A persisted record failed to parse back.
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// A composite record failed to (de)serialize.
    #[error("serialization error")]
    Serialization(#[from] serde_json::Error),

    /// An I/O operation failed.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// A database operation failed.
    #[cfg(feature = "sqlite")]
    #[error("database operation failed")]
    Database(#[from] rusqlite::Error),

    /// Failed to get a connection from the pool.
    #[cfg(feature = "sqlite")]
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// A Redis operation failed.
    #[cfg(feature = "redis")]
    #[error("redis error")]
    Redis(#[from] redis::RedisError),

    /// A connection could not be established.
    #[cfg(feature = "redis")]
    #[error("connection error: {0}")]
    Connection(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;
