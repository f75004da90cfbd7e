//! Types and contracts for workflow engine storage backends.
//!
//! Storage exclusively owns all persisted engine state: steps, per
//! `(enrollment id, command uuid)` tracking rows, event subscriptions, and
//! workflow-start timestamps. The engine and worker observe that state
//! only through the traits here; correctness-bearing caches outside
//! storage are forbidden.
//!
//! Three backend families ship with the crate:
//!
//! - [`InMemStorage`]: the generic key-value implementation over an
//!   in-memory map bucket.
//! - [`DiskStorage`]: the same key-value implementation over a flat
//!   file-per-key bucket on disk.
//! - [`SqliteStorage`] (feature `sqlite`): a relational backend with
//!   transactional multi-step operations.
//!
//! With the `redis` feature the key-value implementation can also run
//! against a Redis server ([`RedisStorage`]).

mod error;
pub mod kv;

mod disk;
mod inmem;
#[cfg(feature = "redis")]
mod redis;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use disk::DiskStorage;
pub use error::{Result, StorageError};
pub use inmem::InMemStorage;
#[cfg(feature = "redis")]
pub use redis::{RedisBucket, RedisStorage};
#[cfg(feature = "sqlite")]
pub use sqlite::{PoolConfig, SqliteStorage};

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::workflow::EventFlag;

/// Common contextual information for steps; an approximately serialized
/// form of a workflow step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepContext {
    /// Workflow name, used to route results back through the engine's
    /// workflow registry.
    pub workflow_name: String,

    /// Unique id of this instance of a workflow.
    pub instance_id: String,

    /// Workflow step name; defined and used by the workflow. Empty when
    /// starting.
    pub step_name: String,

    /// Workflow step context in raw marshalled form.
    pub context: Vec<u8>,
}

impl StepContext {
    pub fn validate(&self) -> Result<()> {
        if self.workflow_name.is_empty() {
            return Err(StorageError::MissingWorkflowName);
        }
        if self.instance_id.is_empty() {
            return Err(StorageError::MissingInstanceId);
        }
        Ok(())
    }
}

/// A raw command: its UUID, request type, and serialized plist.
///
/// The raw bytes are only retained while a step is delayed; a step with no
/// `not_until` is considered already handed to the MDM server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepCommandRaw {
    pub command_uuid: String,
    pub request_type: String,
    /// Raw XML plist of the MDM command.
    pub command: Vec<u8>,
}

/// The result of one MDM command for one enrollment; an approximately
/// serialized form of a workflow step command response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepCommandResult {
    pub command_uuid: String,
    pub request_type: String,
    /// Raw XML plist result of the MDM command.
    pub result_report: Vec<u8>,
    /// Whether this specific command did *not* have a NotNow status.
    pub completed: bool,
}

impl StepCommandResult {
    pub fn validate(&self) -> Result<()> {
        if self.result_report.is_empty() {
            return Err(StorageError::EmptyResultReport);
        }
        Ok(())
    }
}

/// A step to be enqueued to the MDM server for its ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepEnqueueing {
    pub context: StepContext,
    pub ids: Vec<String>,
    pub commands: Vec<StepCommandRaw>,
}

impl StepEnqueueing {
    pub fn validate(&self) -> Result<()> {
        self.context.validate()?;
        if self.ids.is_empty() {
            return Err(StorageError::MissingIds);
        }
        if self.commands.is_empty() {
            return Err(StorageError::MissingCommands);
        }
        Ok(())
    }
}

/// A step for enqueueing plus its scheduling configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepEnqueuingWithConfig {
    pub step: StepEnqueueing,

    /// Wait until after this time to enqueue the step's commands. While
    /// set, backends must retain the raw command bytes so they can be
    /// sent later; once past (or never set) the raw bytes are discarded.
    pub not_until: Option<DateTime<Utc>>,

    /// The step times out if not complete by this time.
    pub timeout: Option<DateTime<Utc>>,
}

impl StepEnqueuingWithConfig {
    pub fn validate(&self) -> Result<()> {
        self.step.validate()
    }
}

/// The results of all of a step's MDM commands for one enrollment id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepResult {
    pub context: StepContext,
    pub ids: Vec<String>,
    pub commands: Vec<StepCommandResult>,
}

/// A user-configured subscription that starts a workflow on matching
/// events, with optional context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSubscription {
    pub event: String,
    pub workflow: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub context: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub event_context: String,
}

impl EventSubscription {
    pub fn validate(&self) -> Result<()> {
        if self.event.is_empty() {
            return Err(StorageError::MissingEvent);
        }
        if EventFlag::from_name(&self.event).is_none() {
            return Err(StorageError::InvalidEventType(self.event.clone()));
        }
        if self.workflow.is_empty() {
            return Err(StorageError::MissingWorkflowName);
        }
        Ok(())
    }

    /// The parsed event flag; validity is checked by [`Self::validate`].
    pub fn event_flag(&self) -> Option<EventFlag> {
        EventFlag::from_name(&self.event)
    }
}

/// The primary interface for engine storage backends.
///
/// Operations 2, 3 and 5 must be linearizable per step: no interleaving
/// may cause a step to be both completed-and-returned and
/// timed-out-and-returned. Backends accomplish this with a transaction or
/// a coarse write lock; no global ordering across steps is required.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Looks up the request type for an id/uuid pair.
    ///
    /// This is the authoritative "is this command engine-tracked?" check:
    /// `None` (without error) means the uuid did not originate with the
    /// engine and processing should stop.
    async fn retrieve_command_request_type(&self, id: &str, uuid: &str)
        -> Result<Option<String>>;

    /// Stores a command response; returns the completed step for the id.
    ///
    /// The returned step is `None` unless this response completes every
    /// command of its step for this id. A returned step's rows for the id
    /// are erased in the same logical operation, and the step row too once
    /// no rows for any id remain.
    async fn store_command_response_and_retrieve_completed_step(
        &self,
        id: &str,
        command: &StepCommandResult,
    ) -> Result<Option<StepResult>>;

    /// Atomically persists a step and its per-(id, command) rows.
    ///
    /// Rejects duplicate `(id, uuid)` pairs. When the step is not delayed
    /// the per-command `last_push` is initialized to `push_time` and the
    /// raw command bytes may be discarded; otherwise the raw bytes are
    /// retained and `last_push` stays unset.
    async fn store_step(
        &self,
        step: &StepEnqueuingWithConfig,
        push_time: DateTime<Utc>,
    ) -> Result<()>;

    /// Returns the subset of `ids` that have an outstanding (incomplete)
    /// step of the named workflow. Used for exclusivity checks.
    async fn retrieve_outstanding_workflow_status(
        &self,
        workflow_name: &str,
        ids: &[String],
    ) -> Result<Vec<String>>;

    /// Erases command rows for `id` (all workflows, or only
    /// `workflow_name`'s when given) plus any step row left without
    /// command rows for any id. Delayed steps are cancelled too.
    async fn cancel_steps(&self, id: &str, workflow_name: Option<&str>) -> Result<()>;

    /// The last time the workflow started for the id, or `None` if it has
    /// not yet started. Persisted with second precision.
    async fn retrieve_workflow_started(
        &self,
        id: &str,
        workflow_name: &str,
    ) -> Result<Option<DateTime<Utc>>>;

    /// Records the workflow start time for each id.
    async fn record_workflow_started(
        &self,
        ids: &[String],
        workflow_name: &str,
        started: DateTime<Utc>,
    ) -> Result<()>;

    /// Removes all workflow start times for the id.
    async fn clear_workflow_status(&self, id: &str) -> Result<()>;
}

/// Storage operations driven by the periodic worker.
///
/// `retrieve_steps_to_enqueue` and `retrieve_timed_out_steps` are mutually
/// exclusive per step: a step is either released for enqueueing or timed
/// out, never both.
#[async_trait]
pub trait WorkerStorage: Send + Sync {
    /// Fetches steps whose `not_until` has passed, atomically clearing the
    /// delay and setting `last_push = push_time` on all of their command
    /// rows. A retrieved step is permanently marked enqueued and will not
    /// be returned again; its raw command bytes are discarded by the
    /// backend after this call.
    async fn retrieve_steps_to_enqueue(
        &self,
        push_time: DateTime<Utc>,
    ) -> Result<Vec<StepEnqueueing>>;

    /// Fetches steps whose `timeout` has passed, one [`StepResult`] per
    /// enrollment id with whatever responses were captured so far. All
    /// rows of a retrieved step are permanently erased.
    async fn retrieve_timed_out_steps(&self) -> Result<Vec<StepResult>>;

    /// Finds the distinct enrollment ids whose oldest outstanding command
    /// was last pushed before `if_before`, updating those rows' last-push
    /// time to `push_time`. Retrieved ids are assumed to have been
    /// successfully APNs-pushed.
    async fn retrieve_and_mark_repushed(
        &self,
        if_before: DateTime<Utc>,
        push_time: DateTime<Utc>,
    ) -> Result<Vec<String>>;
}

/// Backends that can retrieve and query event subscriptions.
#[async_trait]
pub trait ReadEventSubscriptionStorage: Send + Sync {
    async fn retrieve_event_subscriptions(
        &self,
        names: &[String],
    ) -> Result<HashMap<String, EventSubscription>>;

    async fn retrieve_event_subscriptions_by_event(
        &self,
        flag: EventFlag,
    ) -> Result<Vec<EventSubscription>>;
}

/// Backends that can also write and delete event subscriptions.
#[async_trait]
pub trait EventSubscriptionStorage: ReadEventSubscriptionStorage {
    async fn store_event_subscription(&self, name: &str, sub: &EventSubscription) -> Result<()>;

    async fn delete_event_subscription(&self, name: &str) -> Result<()>;
}

/// The full set of interfaces a complete engine backend provides.
pub trait AllStorage: Storage + WorkerStorage + EventSubscriptionStorage {}

impl<T: Storage + WorkerStorage + EventSubscriptionStorage> AllStorage for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_validation() {
        let mut step = StepEnqueuingWithConfig::default();
        assert!(matches!(
            step.validate(),
            Err(StorageError::MissingWorkflowName)
        ));
        step.step.context.workflow_name = "test".to_string();
        assert!(matches!(
            step.validate(),
            Err(StorageError::MissingInstanceId)
        ));
        step.step.context.instance_id = "A".to_string();
        assert!(matches!(step.validate(), Err(StorageError::MissingIds)));
        step.step.ids.push("id1".to_string());
        assert!(matches!(step.validate(), Err(StorageError::MissingCommands)));
        step.step.commands.push(StepCommandRaw::default());
        assert!(step.validate().is_ok());
    }

    #[test]
    fn event_subscription_validation() {
        let mut sub = EventSubscription::default();
        assert!(matches!(sub.validate(), Err(StorageError::MissingEvent)));
        sub.event = "NotAnEvent".to_string();
        assert!(matches!(
            sub.validate(),
            Err(StorageError::InvalidEventType(_))
        ));
        sub.event = "TokenUpdate".to_string();
        assert!(matches!(
            sub.validate(),
            Err(StorageError::MissingWorkflowName)
        ));
        sub.workflow = "wf".to_string();
        assert!(sub.validate().is_ok());
    }
}
