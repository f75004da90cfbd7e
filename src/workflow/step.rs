//! Step types exchanged between workflows and the engine.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::context::{ContextMarshaler, MdmContext};
use super::event::Event;
use crate::mdm::{MdmCommand, MdmResponse};

/// A step handed to an enqueuer for command delivery to enrollments.
///
/// A workflow may only target multiple enrollment ids when starting;
/// subsequent steps are per-id.
pub struct StepEnqueueing {
    /// Unique identifier of the workflow instance, carried from the step
    /// that produced this one.
    pub instance_id: String,

    /// Workflow-assigned step name, used by the workflow to tell its own
    /// steps apart and passed back to
    /// [`super::Workflow::new_context_value`].
    pub step_name: String,

    /// Opaque context stored with the step and returned with its result.
    pub context: Option<Box<dyn ContextMarshaler>>,

    /// Enrollment ids the step targets.
    pub ids: Vec<String>,

    /// The MDM commands making up this step.
    pub commands: Vec<Box<dyn MdmCommand>>,

    /// If any command has not completed by this time the entire step is
    /// considered timed out.
    pub timeout: Option<DateTime<Utc>>,

    /// The step is not sent to enrollments until this time has passed.
    pub not_until: Option<DateTime<Utc>>,
}

impl StepEnqueueing {
    /// A new empty step for a workflow instance.
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            step_name: String::new(),
            context: None,
            ids: Vec::new(),
            commands: Vec::new(),
            timeout: None,
            not_until: None,
        }
    }
}

/// Provided to a workflow when starting a new instance.
pub struct StepStart {
    pub instance_id: String,

    /// Empty when starting.
    pub step_name: String,

    /// The start context, unmarshalled into the workflow's
    /// `new_context_value("")` when one was supplied.
    pub context: Option<Box<dyn ContextMarshaler>>,

    pub mdm: MdmContext,

    /// Enrollment ids to start on.
    pub ids: Vec<String>,

    /// The event that triggered this start, for event-subscription and
    /// check-in driven starts.
    pub event: Option<Event>,
}

impl StepStart {
    /// A step enqueueing preserving this start's instance id and ids.
    pub fn new_step_enqueueing(&self) -> StepEnqueueing {
        StepEnqueueing {
            ids: self.ids.clone(),
            ..StepEnqueueing::new(self.instance_id.clone())
        }
    }
}

/// Given to a workflow when a step has completed or timed out.
#[derive(Debug)]
pub struct StepResult {
    pub instance_id: String,

    pub step_name: String,

    /// The step's stored context, unmarshalled into the workflow's
    /// `new_context_value(step_name)`.
    pub context: Option<Box<dyn ContextMarshaler>>,

    /// MDM context from the command response that completed the step.
    /// Responses seen earlier do not contribute theirs.
    pub mdm: MdmContext,

    /// The single enrollment id this result is for.
    pub id: String,

    /// One parsed response per command; order is unspecified. For
    /// timeouts, commands without a captured response are absent.
    pub command_results: Vec<Arc<dyn MdmResponse>>,
}

impl StepResult {
    /// A step enqueueing preserving this result's instance id and id.
    pub fn new_step_enqueueing(&self) -> StepEnqueueing {
        StepEnqueueing {
            ids: vec![self.id.clone()],
            ..StepEnqueueing::new(self.instance_id.clone())
        }
    }
}
