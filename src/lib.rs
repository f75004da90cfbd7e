//! Praxis: a workflow engine for Apple MDM command orchestration.
//!
//! Higher-level *workflows* (enable FileVault and escrow the key, install a
//! profile set, lock a device, …) drive sequences of low-level MDM commands
//! against many enrolled devices. Praxis supplies the machinery every such
//! workflow would otherwise reimplement: command tracking, response
//! correlation, delayed steps, timeouts, APNs re-pushes, per-enrollment
//! exclusivity, and event dispatch.
//!
//! # Architecture
//!
//! - [`workflow`]: the contract a workflow satisfies ([`workflow::Workflow`])
//!   and the step/event types exchanged with the engine.
//! - [`engine`]: the [`engine::Engine`] facade that starts workflow
//!   instances, persists enqueued steps, correlates MDM responses back to
//!   steps, and fans out events; plus the periodic [`engine::Worker`].
//! - [`storage`]: the persistence contract and its backends (in-memory,
//!   flat key-value on disk, SQLite, optionally Redis).
//! - [`mdm`]: the protocol seam: check-in messages, command/response
//!   capability traits, the request-type response registry, and the
//!   transport traits the engine consumes.
//!
//! # Quick start
//!
//! ```ignore
//! use praxis::prelude::*;
//!
//! let storage = Arc::new(InMemStorage::new());
//! let enqueuer = Arc::new(MyMdmTransport::new());
//! let engine = Arc::new(Engine::new(storage.clone(), enqueuer.clone()));
//!
//! engine.register_workflow(Arc::new(DeviceInfoLogWorkflow::new(engine.clone())))?;
//! let instance_id = engine
//!     .start_workflow("com.example.devinfolog", b"", &[id], None, None)
//!     .await?;
//! ```
//!
//! The engine treats MDM command payloads as opaque bytes plus a command
//! UUID and request-type label; it never transports commands itself and
//! guarantees at-least-once (not exactly-once) delivery of step results to
//! workflows.

pub mod engine;
pub mod mdm;
pub mod storage;
pub mod workflow;

pub use engine::{Engine, EngineError, Worker, WorkflowFinder, WorkflowRegistry};
pub use mdm::{
    CheckinMessage, Enqueuer, MdmCommand, MdmResponse, PushEnqueuer, RawEnqueuer, ResponseRegistry,
};
pub use storage::{
    AllStorage, DiskStorage, EventSubscription, EventSubscriptionStorage, InMemStorage,
    ReadEventSubscriptionStorage, Storage, StorageError, WorkerStorage,
};
pub use workflow::{
    Config, ContextMarshaler, Event, EventFlag, Exclusivity, MdmContext, StepEnqueuer,
    StepEnqueueing, StepResult, StepStart, Workflow, WorkflowError,
};

#[cfg(feature = "sqlite")]
pub use storage::SqliteStorage;

/// A boxed error that can cross threads.
///
/// Workflow callbacks and transport implementations report failures with
/// this type; the engine logs them without needing to know the shape.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

// Re-export dependencies that appear in the public API so downstream
// crates don't hit version mismatches.
pub use chrono;
pub use uuid;

/// Prelude for convenient glob imports.
pub mod prelude {
    pub use crate::engine::{Engine, Worker};
    pub use crate::mdm::{
        CheckinMessage, Enqueuer, MdmCommand, MdmResponse, PushEnqueuer, RawEnqueuer,
        ResponseRegistry,
    };
    pub use crate::storage::{AllStorage, DiskStorage, InMemStorage, Storage};
    pub use crate::workflow::{
        Config, ContextMarshaler, Event, EventFlag, Exclusivity, MdmContext, StepEnqueuer,
        StepEnqueueing, StepResult, StepStart, Workflow,
    };

    #[cfg(feature = "sqlite")]
    pub use crate::storage::SqliteStorage;

    pub use std::sync::Arc;
    pub use uuid::Uuid;
}
