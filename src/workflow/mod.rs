//! The contract between the engine and workflow implementations.
//!
//! A workflow is a named module that drives a business process by issuing
//! MDM command *steps* and reacting to their results. The engine calls
//! into a workflow at four points:
//!
//! - [`Workflow::start`]: a new instance was requested; enqueue the first
//!   step (or none, terminating immediately).
//! - [`Workflow::step_completed`]: every command of a step has a terminal
//!   (non-NotNow) response for one enrollment id.
//! - [`Workflow::step_timeout`]: a step failed to complete in time; the
//!   result carries whatever responses arrived.
//! - [`Workflow::event`]: an MDM event the workflow subscribed to in its
//!   [`Config`] occurred.
//!
//! Workflows enqueue steps through the [`StepEnqueuer`] seam (implemented
//! by the engine) and attach opaque per-step context via
//! [`ContextMarshaler`], which the engine stores as bytes and
//! reconstitutes on the way back using
//! [`Workflow::new_context_value`].
//!
//! Workflow implementations must be safe for concurrent invocations on
//! different instances and enrollment ids; the engine makes no
//! single-threading guarantee.

mod config;
mod context;
mod event;
mod step;

pub use config::{Config, Exclusivity};
pub use context::{ContextMarshaler, IntContext, MdmContext, StringContext};
pub use event::{Event, EventData, EventFlag};
pub use step::{StepEnqueueing, StepResult, StepStart};

use async_trait::async_trait;
use thiserror::Error;

use crate::engine::EngineError;
use crate::BoxError;

/// Errors workflow implementations commonly return from their callbacks.
///
/// The engine logs callback errors without inspecting them; these exist so
/// workflows don't each mint their own spelling of the same failure.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkflowError {
    /// Returned from [`Workflow::event`] by workflows with no event
    /// subscriptions.
    #[error("events not supported for this workflow")]
    EventsNotSupported,

    /// Returned from [`Workflow::step_timeout`] by workflows that never
    /// set timeouts.
    #[error("workflow does not utilize timeouts")]
    TimeoutNotUsed,

    /// A step came back with a different number of command results than
    /// were enqueued.
    #[error("mismatched number of commands in step result")]
    CommandLenMismatch,

    /// A step result named a step this workflow does not know.
    #[error("unknown step name")]
    UnknownStepName,

    /// A step's expected command result was not of the expected type.
    /// Workflows must not depend on result ordering.
    #[error("incorrect command type")]
    IncorrectCommandType,

    /// A step received a context value of the wrong type for its name.
    #[error("incorrect context type")]
    IncorrectContextType,
}

/// Workflows send MDM commands and process the results using steps.
#[async_trait]
pub trait Workflow: Send + Sync {
    /// The workflow name; reverse-DNS style by convention. Used to route
    /// actions back to this workflow, so it must be unique per engine.
    fn name(&self) -> &str;

    /// Static workflow-wide configuration. `None` means all defaults
    /// (exclusive, no event subscriptions, engine-default timeout).
    fn config(&self) -> Option<Config> {
        None
    }

    /// Returns a freshly instantiated context value for a step name, or
    /// `None` when steps of that name carry no context. The engine uses
    /// this to unmarshal stored context bytes before a callback.
    fn new_context_value(&self, step_name: &str) -> Option<Box<dyn ContextMarshaler>>;

    /// Starts a new workflow instance for the given enrollment ids.
    async fn start(&self, step: StepStart) -> Result<(), BoxError>;

    /// Called when all of a step's MDM commands have reported terminal
    /// results for one enrollment id. Results may be protocol errors;
    /// NotNow responses never reach this callback.
    async fn step_completed(&self, step: StepResult) -> Result<(), BoxError>;

    /// Called when at least one command in a step failed to complete in
    /// time. The result contains the responses captured so far.
    async fn step_timeout(&self, step: StepResult) -> Result<(), BoxError>;

    /// Called for MDM events this workflow subscribed to via
    /// [`Config::events`] or
    /// [`Config::all_command_response_request_types`].
    async fn event(&self, event: &Event, id: &str, mdm: &MdmContext) -> Result<(), BoxError>;
}

/// The seam through which workflows enqueue steps; implemented by the
/// engine.
#[async_trait]
pub trait StepEnqueuer: Send + Sync {
    /// Persists the step and sends its commands to the step's enrollment
    /// ids (immediately, or later when the step is delayed). The engine
    /// finds the workflow again by `workflow_name`.
    async fn enqueue_step(
        &self,
        workflow_name: &str,
        step: StepEnqueueing,
    ) -> Result<(), EngineError>;
}
