//! The boundary codec: conversions between workflow-level typed objects
//! and storage-level raw serialized forms.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::mdm::{self, CodecError, MdmCommand, MdmResponse, ResponseRegistry};
use crate::storage;
use crate::workflow::{self, Event, MdmContext, Workflow};

/// Builds the workflow start step from raw engine input, unmarshalling
/// the start context into the workflow's own context type.
pub(crate) fn step_start_from_engine(
    workflow: &dyn Workflow,
    instance_id: &str,
    raw_context: &[u8],
    ids: &[String],
    event: Option<&Event>,
    mdm: Option<&MdmContext>,
) -> Result<workflow::StepStart, CodecError> {
    // workflow step name is blank when starting
    let mut context = workflow.new_context_value("");
    if let Some(ctx) = context.as_deref_mut() {
        if !raw_context.is_empty() {
            ctx.unmarshal(raw_context).map_err(CodecError::Context)?;
        }
    }
    Ok(workflow::StepStart {
        instance_id: instance_id.to_string(),
        step_name: String::new(),
        context,
        mdm: mdm.cloned().unwrap_or_default(),
        ids: ids.to_vec(),
        event: event.cloned(),
    })
}

/// Converts a workflow command into its storage form, serializing it and
/// rejecting commands without a UUID or request type.
pub(crate) fn storage_command_from_workflow_command(
    cmd: &dyn MdmCommand,
) -> Result<storage::StepCommandRaw, CodecError> {
    mdm::validate_command(cmd)?;
    Ok(storage::StepCommandRaw {
        command_uuid: cmd.command_uuid().to_string(),
        request_type: cmd.request_type().to_string(),
        command: cmd.to_plist()?,
    })
}

/// Converts a workflow step enqueueing into a storage step, resolving the
/// effective timeout (step over `default_timeout`) and marshalling the
/// step context.
pub(crate) fn storage_step_from_enqueueing(
    workflow_name: &str,
    default_timeout: Option<DateTime<Utc>>,
    step: workflow::StepEnqueueing,
) -> Result<storage::StepEnqueuingWithConfig, CodecError> {
    let mut stored = storage::StepEnqueuingWithConfig {
        step: storage::StepEnqueueing {
            context: storage::StepContext {
                workflow_name: workflow_name.to_string(),
                instance_id: step.instance_id,
                step_name: step.step_name,
                context: Vec::new(),
            },
            ids: step.ids,
            commands: Vec::new(),
        },
        timeout: step.timeout.or(default_timeout),
        not_until: step.not_until,
    };
    if let Some(ctx) = &step.context {
        stored.step.context.context = ctx.marshal().map_err(CodecError::Context)?;
    }
    for cmd in &step.commands {
        stored
            .step
            .commands
            .push(storage_command_from_workflow_command(cmd.as_ref())?);
    }
    Ok(stored)
}

/// Decodes a raw response into its typed object and the storage command
/// result, applying the completion rule (`Status` neither empty nor
/// `NotNow`).
pub(crate) fn step_command_result_from_raw(
    registry: &ResponseRegistry,
    request_type: &str,
    raw: &[u8],
) -> Result<(storage::StepCommandResult, Arc<dyn MdmResponse>), CodecError> {
    let response: Arc<dyn MdmResponse> = Arc::from(registry.parse(request_type, raw)?);
    let result = storage::StepCommandResult {
        command_uuid: response.command_uuid().to_string(),
        request_type: request_type.to_string(),
        result_report: raw.to_vec(),
        completed: mdm::response_completed(response.status()),
    };
    Ok((result, response))
}

/// Converts a storage step result into a workflow step result.
///
/// As an optimization a `uuid` plus its already-parsed `response` can be
/// supplied to avoid re-decoding the response that completed the step.
/// With `ignore_empty_responses` set (timeouts), commands without a
/// captured report are skipped instead of parsed.
pub(crate) fn workflow_step_result_from_storage(
    registry: &ResponseRegistry,
    workflow: &dyn Workflow,
    stored: storage::StepResult,
    ignore_empty_responses: bool,
    uuid: Option<&str>,
    response: Option<Arc<dyn MdmResponse>>,
) -> Result<workflow::StepResult, CodecError> {
    // results (MDM command responses) can only be for a single id
    if stored.ids.len() != 1 {
        return Err(CodecError::IncorrectIdCount);
    }

    let mut context = workflow.new_context_value(&stored.context.step_name);
    if let Some(ctx) = context.as_deref_mut() {
        if !stored.context.context.is_empty() {
            ctx.unmarshal(&stored.context.context)
                .map_err(CodecError::Context)?;
        }
    }

    let mut result = workflow::StepResult {
        instance_id: stored.context.instance_id,
        step_name: stored.context.step_name.clone(),
        context,
        mdm: MdmContext::default(),
        id: stored.ids.into_iter().next().unwrap_or_default(),
        command_results: Vec::new(),
    };

    for cmd in &stored.commands {
        if uuid == Some(cmd.command_uuid.as_str()) {
            if let Some(response) = &response {
                result.command_results.push(response.clone());
                continue;
            }
        }
        if ignore_empty_responses && cmd.result_report.is_empty() {
            continue;
        }
        let parsed = registry.parse(&cmd.request_type, &cmd.result_report)?;
        result.command_results.push(Arc::from(parsed));
    }

    Ok(result)
}
