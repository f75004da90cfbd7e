use std::time::Duration;

use super::event::EventFlag;

/// Exclusivity mode for a workflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Exclusivity {
    /// The workflow can only start on an enrollment id with no other
    /// pending step of the same workflow. This is the default.
    #[default]
    Exclusive,

    /// The workflow can run simultaneous instances for an enrollment id.
    MultipleSimultaneous,
}

/// Static workflow-wide configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Default step timeout for this workflow. A step's own timeout
    /// overrides this; if neither is set the engine default applies.
    pub timeout: Option<Duration>,

    /// Whether simultaneous instances may run on one enrollment id.
    pub exclusivity: Exclusivity,

    /// Request types for which this workflow wants to see *every* command
    /// response the engine tracks, not just responses to its own
    /// commands. Delivered through [`super::Workflow::event`] as
    /// [`EventFlag::ALL_COMMAND_RESPONSE`] events.
    pub all_command_response_request_types: Vec<String>,

    /// Event subscriptions; OR individual [`EventFlag`] bits together.
    pub events: EventFlag,
}
