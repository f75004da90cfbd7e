use thiserror::Error;

use crate::mdm::CodecError;
use crate::storage::StorageError;
use crate::BoxError;

/// Errors surfaced by the engine's public entry points.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// The named workflow is not registered.
    #[error("no such workflow: {0}")]
    NoSuchWorkflow(String),

    /// A start or step was requested with no enrollment ids.
    #[error("no IDs")]
    NoIds,

    /// An exclusive workflow already has incomplete steps on every
    /// requested id.
    #[error("workflow already started on {running} (of {total}) ids")]
    AlreadyRunning { running: usize, total: usize },

    /// A storage backend operation failed.
    #[error("storage error")]
    Storage(#[from] StorageError),

    /// Command serialization or response decoding failed.
    #[error("codec error")]
    Codec(#[from] CodecError),

    /// The MDM transport failed to enqueue or push. Stored step rows
    /// remain; the worker's re-push pass will retry waking the devices.
    #[error("transport error")]
    Transport(#[source] BoxError),

    /// No batch of a workflow start succeeded.
    #[error("workflow start failed for all ids")]
    NothingStarted,
}

pub type Result<T> = std::result::Result<T, EngineError>;
