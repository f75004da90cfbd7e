//! The workflow engine: coordinates workflows with MDM servers.
//!
//! [`Engine`] is the public facade. It starts workflow instances (with
//! per-enrollment exclusivity checks), accepts step enqueueings from
//! workflows, receives MDM check-in / idle / command-response events,
//! correlates responses back to their steps, and calls back into
//! workflows when a step completes. The periodic [`Worker`] drives
//! delayed steps, timeouts, and APNs re-pushes.
//!
//! Every public entry point may be called concurrently from HTTP
//! handlers, the transport webhook, and the worker at once. The engine
//! holds no locks of its own across storage, transport, or workflow
//! calls; event fan-outs run one concurrent task per subscriber and await
//! them all before returning.

mod convert;
mod error;
mod registry;
mod worker;

pub use error::EngineError;
pub use registry::WorkflowRegistry;
pub use worker::{Worker, DEFAULT_POLL_INTERVAL, DEFAULT_REPUSH_INTERVAL};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::mdm::{CheckinMessage, Enqueuer, MdmResponse, ResponseRegistry};
use crate::storage::{EventSubscription, ReadEventSubscriptionStorage, Storage};
use crate::workflow::{
    Event, EventData, EventFlag, Exclusivity, MdmContext, StepEnqueuer, StepEnqueueing, Workflow,
};

/// The default workflow step timeout. A workflow's configured timeout
/// overrides this, and a step's own timeout overrides that.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(60 * 60 * 24 * 3);

/// Looks up workflows by name; implemented by [`Engine`] and consumed by
/// the [`Worker`].
pub trait WorkflowFinder: Send + Sync {
    fn find_workflow(&self, name: &str) -> Option<Arc<dyn Workflow>>;
}

/// The workflow engine.
///
/// Generic over its storage backend and MDM transport; workflows talk to
/// it through [`StepEnqueuer`] and the registration methods.
pub struct Engine<S, E> {
    storage: Arc<S>,
    enqueuer: Arc<E>,
    registry: WorkflowRegistry,
    event_storage: Option<Arc<dyn ReadEventSubscriptionStorage>>,
    response_registry: ResponseRegistry,
    default_timeout: Duration,
}

impl<S, E> Engine<S, E>
where
    S: Storage + 'static,
    E: Enqueuer + 'static,
{
    /// A new engine with default configuration: the bundled response
    /// registry, the default step timeout, and no event subscription
    /// storage.
    pub fn new(storage: Arc<S>, enqueuer: Arc<E>) -> Self {
        Self {
            storage,
            enqueuer,
            registry: WorkflowRegistry::new(),
            event_storage: None,
            response_registry: ResponseRegistry::with_core_types(),
            default_timeout: DEFAULT_STEP_TIMEOUT,
        }
    }

    /// Sets the engine-default step timeout. Zero disables it.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Turns on event subscription dispatch backed by the given storage.
    pub fn with_event_storage(mut self, storage: Arc<dyn ReadEventSubscriptionStorage>) -> Self {
        self.event_storage = Some(storage);
        self
    }

    /// Replaces the response registry (e.g. to add custom request types).
    pub fn with_response_registry(mut self, registry: ResponseRegistry) -> Self {
        self.response_registry = registry;
        self
    }

    /// The response registry in use.
    pub fn response_registry(&self) -> &ResponseRegistry {
        &self.response_registry
    }

    /// Associates the workflow with the engine by name.
    pub fn register_workflow(&self, workflow: Arc<dyn Workflow>) {
        self.registry.register(workflow);
    }

    /// Dissociates the named workflow from the engine.
    pub fn unregister_workflow(&self, name: &str) {
        self.registry.unregister(name);
    }

    /// The registered workflow by name.
    pub fn workflow(&self, name: &str) -> Option<Arc<dyn Workflow>> {
        self.registry.workflow(name)
    }

    /// Whether the workflow name is registered.
    pub fn workflow_registered(&self, name: &str) -> bool {
        self.registry.registered(name)
    }

    /// Starts a new workflow instance for the enrollment ids.
    ///
    /// Unless the workflow allows simultaneous instances, ids that
    /// already have an incomplete step of this workflow are dropped from
    /// the start (logged); if every id is dropped the start fails with
    /// [`EngineError::AlreadyRunning`].
    ///
    /// Returns the invented instance id as long as at least one batch
    /// started; individual batch failures are logged.
    pub async fn start_workflow(
        &self,
        name: &str,
        context: &[u8],
        ids: &[String],
        event: Option<&Event>,
        mdm: Option<&MdmContext>,
    ) -> Result<String, EngineError> {
        let workflow = self
            .registry
            .workflow(name)
            .ok_or_else(|| EngineError::NoSuchWorkflow(name.to_string()))?;
        if ids.is_empty() {
            return Err(EngineError::NoIds);
        }
        let mut ids = ids.to_vec();

        let exclusive = !matches!(
            workflow.config().map(|c| c.exclusivity),
            Some(Exclusivity::MultipleSimultaneous)
        );
        if exclusive {
            let running = self
                .storage
                .retrieve_outstanding_workflow_status(name, &ids)
                .await?;
            if !running.is_empty() {
                let total = ids.len();
                // continue only with ids that have no outstanding step
                ids.retain(|id| !running.contains(id));
                if ids.is_empty() {
                    return Err(EngineError::AlreadyRunning {
                        running: running.len(),
                        total,
                    });
                }
                debug!(
                    workflow_name = name,
                    running = running.len(),
                    total,
                    remaining = ids.len(),
                    "workflow already started on some ids"
                );
            }
        }

        // without multi-command transport support, fan the start out per
        // id so workflows can mint one command UUID per step obliviously
        let batches: Vec<Vec<String>> = if self.enqueuer.supports_multi_commands() {
            vec![ids]
        } else {
            ids.into_iter().map(|id| vec![id]).collect()
        };

        let instance_id = Uuid::new_v4().to_string();
        let mut started = false;

        for batch in batches {
            if batch.is_empty() {
                info!(workflow_name = name, "skipping empty id batch");
                continue;
            }
            let result: Result<(), crate::BoxError> = async {
                let step = convert::step_start_from_engine(
                    workflow.as_ref(),
                    &instance_id,
                    context,
                    &batch,
                    event,
                    mdm,
                )?;
                workflow.start(step).await?;
                self.storage
                    .record_workflow_started(&batch, name, Utc::now())
                    .await?;
                Ok(())
            }
            .await;
            match result {
                Ok(()) => {
                    started = true;
                    debug!(
                        workflow_name = name,
                        instance_id,
                        first_id = %batch[0],
                        count = batch.len(),
                        "starting workflow"
                    );
                }
                Err(e) => {
                    warn!(
                        workflow_name = name,
                        instance_id,
                        error = %e,
                        "starting workflow batch"
                    );
                }
            }
        }

        if started {
            Ok(instance_id)
        } else {
            Err(EngineError::NothingStarted)
        }
    }

    /// The engine- or workflow-default step timeout deadline.
    fn step_default_timeout(&self, workflow_name: &str) -> Option<DateTime<Utc>> {
        let mut timeout = (!self.default_timeout.is_zero()).then_some(self.default_timeout);
        if let Some(config) = self.registry.workflow(workflow_name).and_then(|w| w.config()) {
            if let Some(wf_timeout) = config.timeout {
                if !wf_timeout.is_zero() {
                    timeout = Some(wf_timeout);
                }
            }
        }
        let timeout = chrono::Duration::from_std(timeout?).ok()?;
        Some(Utc::now() + timeout)
    }

    /// Receives MDM command responses from the transport.
    ///
    /// Responses for commands the engine does not track are silently
    /// ignored. A response completing the last command of a step for an
    /// id triggers the workflow's `step_completed` callback.
    pub async fn mdm_command_response_event(
        &self,
        id: &str,
        uuid: &str,
        raw: &[u8],
        mdm: Option<&MdmContext>,
    ) -> Result<(), EngineError> {
        let Some(request_type) = self.storage.retrieve_command_request_type(id, uuid).await?
        else {
            // probably did not originate with the engine
            debug!(
                enrollment_id = id,
                command_uuid = uuid,
                "response for command not tracked by the engine"
            );
            return Ok(());
        };

        let (command_result, response) = match convert::step_command_result_from_raw(
            &self.response_registry,
            &request_type,
            raw,
        ) {
            Ok(converted) => converted,
            Err(e) => {
                info!(
                    enrollment_id = id,
                    command_uuid = uuid,
                    request_type,
                    error = %e,
                    "converting response"
                );
                return Err(e.into());
            }
        };

        let dispatch =
            self.dispatch_all_command_response(&request_type, id, response.clone(), mdm);

        let complete = async {
            let Some(stored) = self
                .storage
                .store_command_response_and_retrieve_completed_step(id, &command_result)
                .await?
            else {
                debug!(
                    enrollment_id = id,
                    command_uuid = uuid,
                    command_completed = command_result.completed,
                    "stored command response; step not yet complete"
                );
                return Ok(());
            };

            let workflow_name = stored.context.workflow_name.clone();
            let Some(workflow) = self.registry.workflow(&workflow_name) else {
                // the step's rows are already erased; its data is lost
                error!(
                    workflow_name,
                    enrollment_id = id,
                    "workflow for completed step not registered"
                );
                return Err(EngineError::NoSuchWorkflow(workflow_name));
            };

            let mut step_result = convert::workflow_step_result_from_storage(
                &self.response_registry,
                workflow.as_ref(),
                stored,
                false,
                Some(uuid),
                Some(response.clone()),
            )?;
            if let Some(mdm) = mdm {
                step_result.mdm = mdm.clone();
            }

            if let Err(e) = workflow.step_completed(step_result).await {
                info!(
                    workflow_name,
                    enrollment_id = id,
                    error = %e,
                    "completing workflow step"
                );
            } else {
                debug!(workflow_name, enrollment_id = id, "completed workflow step");
            }
            Ok(())
        };

        let ((), result) = tokio::join!(dispatch, complete);
        result
    }

    /// Fans an all-command-response event out to subscribed workflows.
    async fn dispatch_all_command_response(
        &self,
        request_type: &str,
        id: &str,
        response: Arc<dyn MdmResponse>,
        mdm: Option<&MdmContext>,
    ) {
        let workflows = self.registry.all_response_workflows(request_type);
        if workflows.is_empty() {
            return;
        }
        let event = Event::with_data(
            EventFlag::ALL_COMMAND_RESPONSE,
            EventData::Response(response),
        );
        let mdm = mdm.cloned().unwrap_or_default();
        join_all(workflows.iter().map(|workflow| {
            let event = &event;
            let mdm = &mdm;
            async move {
                if let Err(e) = workflow.event(event, id, mdm).await {
                    info!(
                        workflow_name = workflow.name(),
                        request_type,
                        enrollment_id = id,
                        error = %e,
                        "workflow all command response"
                    );
                }
            }
        }))
        .await;
    }

    /// Receives "Idle" command report statuses.
    ///
    /// Dispatches the Idle event to workflow-config subscribers, then
    /// evaluates `IdleNotStartedSince` subscriptions, the only event
    /// type allowed to start workflows from the Idle path.
    pub async fn mdm_idle_event(
        &self,
        id: &str,
        _raw: &[u8],
        mdm: Option<&MdmContext>,
        event_at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let event = Event::new(EventFlag::IDLE);
        self.dispatch_events(id, &event, mdm, false, true).await;

        let Some(event_storage) = &self.event_storage else {
            return Ok(());
        };

        let subscriptions = match event_storage
            .retrieve_event_subscriptions_by_event(EventFlag::IDLE_NOT_STARTED_SINCE)
            .await
        {
            Ok(subscriptions) => subscriptions,
            Err(e) => {
                info!(enrollment_id = id, error = %e, "retrieving event subscriptions");
                return Ok(());
            }
        };
        if subscriptions.is_empty() {
            return Ok(());
        }

        let event = Event::new(EventFlag::IDLE_NOT_STARTED_SINCE);
        join_all(
            subscriptions
                .iter()
                .map(|sub| self.idle_not_started_since(id, sub, &event, mdm, event_at)),
        )
        .await;
        Ok(())
    }

    async fn idle_not_started_since(
        &self,
        id: &str,
        sub: &EventSubscription,
        event: &Event,
        mdm: Option<&MdmContext>,
        event_at: DateTime<Utc>,
    ) {
        let started = match self.storage.retrieve_workflow_started(id, &sub.workflow).await {
            Ok(started) => started,
            Err(e) => {
                info!(
                    enrollment_id = id,
                    workflow_name = %sub.workflow,
                    error = %e,
                    "retrieving workflow status"
                );
                return;
            }
        };

        // the event context is the minimum seconds between runs
        if sub.event_context.is_empty() {
            info!(workflow_name = %sub.workflow, "event context is empty");
            return;
        }
        let since_seconds: i64 = match sub.event_context.parse() {
            Ok(seconds) if seconds >= 1 => seconds,
            Ok(_) => {
                info!(workflow_name = %sub.workflow, "event context less than 1 second");
                return;
            }
            Err(e) => {
                info!(
                    workflow_name = %sub.workflow,
                    error = %e,
                    "converting event context to integer"
                );
                return;
            }
        };

        let started = started.unwrap_or(DateTime::UNIX_EPOCH);
        if event_at <= started + chrono::Duration::seconds(since_seconds) {
            // ran recently enough
            return;
        }

        match self
            .start_workflow(
                &sub.workflow,
                sub.context.as_bytes(),
                &[id.to_string()],
                Some(event),
                mdm,
            )
            .await
        {
            Ok(instance_id) => {
                debug!(workflow_name = %sub.workflow, instance_id, "started workflow")
            }
            Err(e) => {
                info!(workflow_name = %sub.workflow, error = %e, "start workflow")
            }
        }
    }

    /// Receives MDM check-in messages.
    ///
    /// Authenticate and CheckOut abandon any outstanding steps for the id
    /// and erase its workflow status; re-enrollment must not be blocked
    /// by exclusivity against a prior life of the device.
    pub async fn mdm_checkin_event(
        &self,
        id: &str,
        checkin: CheckinMessage,
        mdm: Option<&MdmContext>,
    ) -> Result<(), EngineError> {
        let checkin = Arc::new(checkin);
        let data = EventData::Checkin(checkin.clone());
        let mut cancel_steps = false;
        let mut events = Vec::new();

        match checkin.as_ref() {
            CheckinMessage::Authenticate(_) => {
                cancel_steps = true;
                events.push(Event::with_data(EventFlag::AUTHENTICATE, data.clone()));
            }
            CheckinMessage::TokenUpdate(_) => {
                events.push(Event::with_data(EventFlag::TOKEN_UPDATE, data.clone()));
                // from a bare token update we can't tell whether an
                // enrollment happened, so send that event too
                events.push(Event::with_data(EventFlag::ENROLLMENT, data.clone()));
            }
            CheckinMessage::TokenUpdateEnrolling { enrolling, .. } => {
                events.push(Event::with_data(EventFlag::TOKEN_UPDATE, data.clone()));
                if *enrolling {
                    events.push(Event::with_data(EventFlag::ENROLLMENT, data.clone()));
                }
            }
            CheckinMessage::CheckOut(_) => {
                cancel_steps = true;
                events.push(Event::with_data(EventFlag::CHECK_OUT, data.clone()));
            }
        }

        if cancel_steps {
            self.storage.cancel_steps(id, None).await.map_err(|e| {
                warn!(enrollment_id = id, error = %e, "checkin event: cancel steps");
                e
            })?;
            self.storage.clear_workflow_status(id).await.map_err(|e| {
                warn!(enrollment_id = id, error = %e, "checkin event: clearing workflow status");
                e
            })?;
        }

        for event in &events {
            self.dispatch_events(id, event, mdm, true, true).await;
        }
        Ok(())
    }

    /// Dispatches an event to its subscribers: user-configured event
    /// subscriptions (which start workflows) and/or workflow-config
    /// subscriptions (which invoke `Workflow::event`). All spawned tasks
    /// are awaited before returning; their failures are logged and
    /// swallowed.
    pub(crate) async fn dispatch_events(
        &self,
        id: &str,
        event: &Event,
        mdm: Option<&MdmContext>,
        do_subscriptions: bool,
        do_workflow_configs: bool,
    ) {
        let mut subscriptions = Vec::new();
        if do_subscriptions {
            if let Some(event_storage) = &self.event_storage {
                match event_storage
                    .retrieve_event_subscriptions_by_event(event.flag)
                    .await
                {
                    Ok(subs) => subscriptions = subs,
                    Err(e) => info!(
                        event = %event.flag,
                        enrollment_id = id,
                        error = %e,
                        "retrieving event subscriptions"
                    ),
                }
            }
        }

        let workflows = if do_workflow_configs {
            self.registry.event_workflows(event.flag)
        } else {
            Vec::new()
        };

        let single_id = [id.to_string()];
        let mdm_ctx = mdm.cloned().unwrap_or_default();

        let subscription_dispatch = join_all(subscriptions.iter().map(|sub| {
            let single_id = &single_id;
            async move {
                match self
                    .start_workflow(&sub.workflow, sub.context.as_bytes(), single_id, Some(event), mdm)
                    .await
                {
                    Ok(instance_id) => debug!(
                        event = %event.flag,
                        workflow_name = %sub.workflow,
                        instance_id,
                        "started workflow"
                    ),
                    Err(e) => info!(
                        event = %event.flag,
                        workflow_name = %sub.workflow,
                        error = %e,
                        "start workflow"
                    ),
                }
            }
        }));

        let workflow_dispatch = join_all(workflows.iter().map(|workflow| {
            let mdm_ctx = &mdm_ctx;
            async move {
                if let Err(e) = workflow.event(event, id, mdm_ctx).await {
                    info!(
                        event = %event.flag,
                        workflow_name = workflow.name(),
                        error = %e,
                        "workflow event"
                    );
                } else {
                    debug!(
                        event = %event.flag,
                        workflow_name = workflow.name(),
                        "workflow event"
                    );
                }
            }
        }));

        tokio::join!(subscription_dispatch, workflow_dispatch);
    }
}

#[async_trait]
impl<S, E> StepEnqueuer for Engine<S, E>
where
    S: Storage + 'static,
    E: Enqueuer + 'static,
{
    async fn enqueue_step(
        &self,
        workflow_name: &str,
        step: StepEnqueueing,
    ) -> Result<(), EngineError> {
        let stored = convert::storage_step_from_enqueueing(
            workflow_name,
            self.step_default_timeout(workflow_name),
            step,
        )?;

        self.storage.store_step(&stored, Utc::now()).await?;

        if stored.not_until.is_none() {
            // not delaying, so send the commands now
            for cmd in &stored.step.commands {
                self.enqueuer
                    .enqueue(&stored.step.ids, &cmd.command)
                    .await
                    .map_err(|e| {
                        warn!(
                            workflow_name,
                            command_uuid = %cmd.command_uuid,
                            error = %e,
                            "enqueueing step command"
                        );
                        EngineError::Transport(e)
                    })?;
            }
        }

        debug!(
            workflow_name,
            instance_id = %stored.step.context.instance_id,
            step_name = %stored.step.context.step_name,
            first_id = %stored.step.ids[0],
            count = stored.step.ids.len(),
            command_count = stored.step.commands.len(),
            "enqueued step"
        );
        Ok(())
    }
}

impl<S, E> WorkflowFinder for Engine<S, E>
where
    S: Storage + 'static,
    E: Enqueuer + 'static,
{
    fn find_workflow(&self, name: &str) -> Option<Arc<dyn Workflow>> {
        self.registry.workflow(name)
    }
}
