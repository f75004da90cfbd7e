//! Periodic worker: polls storage for timed events on an interval.
//!
//! Each tick runs three phases in order: release delayed steps and send
//! their commands, deliver timed-out steps to their workflows, and send
//! APNs re-pushes to enrollments whose oldest outstanding command has
//! gone silent too long.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{convert, EngineError, WorkflowFinder};
use crate::mdm::{PushEnqueuer, ResponseRegistry};
use crate::storage::WorkerStorage;

/// Default worker polling interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60 * 5);

/// Default duration an MDM command may go without any response before its
/// enrollment id is sent a bare APNs push.
pub const DEFAULT_REPUSH_INTERVAL: Duration = Duration::from_secs(60 * 60 * 24);

/// The engine's periodic worker.
pub struct Worker<F, S, E> {
    finder: Arc<F>,
    storage: Arc<S>,
    enqueuer: Arc<E>,
    response_registry: ResponseRegistry,
    poll_interval: Duration,
    repush_interval: Duration,
}

impl<F, S, E> Worker<F, S, E>
where
    F: WorkflowFinder,
    S: WorkerStorage,
    E: PushEnqueuer,
{
    /// A new worker with default intervals and the bundled response
    /// registry.
    pub fn new(finder: Arc<F>, storage: Arc<S>, enqueuer: Arc<E>) -> Self {
        Self {
            finder,
            storage,
            enqueuer,
            response_registry: ResponseRegistry::with_core_types(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            repush_interval: DEFAULT_REPUSH_INTERVAL,
        }
    }

    /// Sets the polling interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the re-push interval. Zero disables the re-push phase.
    pub fn with_repush_interval(mut self, interval: Duration) -> Self {
        self.repush_interval = interval;
        self
    }

    /// Replaces the response registry used to decode stored result
    /// reports for timed-out steps. Keep it in sync with the engine's.
    pub fn with_response_registry(mut self, registry: ResponseRegistry) -> Self {
        self.response_registry = registry;
        self
    }

    /// Runs one tick of the worker's phases.
    pub async fn run_once(&self) -> Result<(), EngineError> {
        self.process_enqueueings().await.map_err(|e| {
            warn!(error = %e, "processing enqueueings");
            e
        })?;
        self.process_timeouts().await.map_err(|e| {
            warn!(error = %e, "processing timeouts");
            e
        })?;
        if !self.repush_interval.is_zero() {
            self.process_repushes().await.map_err(|e| {
                warn!(error = %e, "processing repushes");
                e
            })?;
        }
        Ok(())
    }

    /// Runs the worker until the cancellation token fires, finishing any
    /// in-flight tick first.
    pub async fn run(&self, cancel: CancellationToken) {
        debug!(interval = ?self.poll_interval, "starting worker");
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the first tick completes immediately; wait a full interval
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("worker received shutdown signal");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        warn!(error = %e, "worker tick");
                    }
                }
            }
        }
    }

    /// Sends the commands of previously-delayed steps that storage has
    /// released. Transport errors are logged per command; they do not
    /// reverse the release (re-pushes pick the devices up later).
    async fn process_enqueueings(&self) -> Result<(), EngineError> {
        let steps = self.storage.retrieve_steps_to_enqueue(Utc::now()).await?;

        for step in steps {
            if step.commands.is_empty() {
                info!(
                    instance_id = %step.context.instance_id,
                    workflow_name = %step.context.workflow_name,
                    "released step has no commands"
                );
                continue;
            }
            for cmd in &step.commands {
                if let Err(e) = self.enqueuer.enqueue(&step.ids, &cmd.command).await {
                    info!(
                        instance_id = %step.context.instance_id,
                        workflow_name = %step.context.workflow_name,
                        step_name = %step.context.step_name,
                        command_uuid = %cmd.command_uuid,
                        request_type = %cmd.request_type,
                        error = %e,
                        "enqueueing command"
                    );
                } else {
                    debug!(
                        instance_id = %step.context.instance_id,
                        command_uuid = %cmd.command_uuid,
                        first_id = %step.ids[0],
                        count = step.ids.len(),
                        "enqueueing command"
                    );
                }
            }
        }
        Ok(())
    }

    /// Delivers timed-out steps to their workflows.
    async fn process_timeouts(&self) -> Result<(), EngineError> {
        let steps = self.storage.retrieve_timed_out_steps().await?;

        for step in steps {
            if step.ids.len() != 1 {
                // step timeouts are per-enrollment id
                error!(
                    instance_id = %step.context.instance_id,
                    workflow_name = %step.context.workflow_name,
                    id_count = step.ids.len(),
                    "invalid count of step IDs in timed-out step"
                );
                continue;
            }
            let workflow_name = step.context.workflow_name.clone();
            let enrollment_id = step.ids[0].clone();
            let Some(workflow) = self.finder.find_workflow(&workflow_name) else {
                info!(
                    workflow_name,
                    enrollment_id,
                    error = %EngineError::NoSuchWorkflow(workflow_name.clone()),
                    "step timeout"
                );
                continue;
            };

            let step_result = match convert::workflow_step_result_from_storage(
                &self.response_registry,
                workflow.as_ref(),
                step,
                true,
                None,
                None,
            ) {
                Ok(step_result) => step_result,
                Err(e) => {
                    info!(workflow_name, enrollment_id, error = %e, "step timeout");
                    continue;
                }
            };

            if let Err(e) = workflow.step_timeout(step_result).await {
                info!(workflow_name, enrollment_id, error = %e, "step timeout");
            } else {
                debug!(workflow_name, enrollment_id, "step timeout");
            }
        }
        Ok(())
    }

    /// Sends bare APNs pushes to ids with long-outstanding commands.
    async fn process_repushes(&self) -> Result<(), EngineError> {
        let repush = chrono::Duration::from_std(self.repush_interval)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let now = Utc::now();
        let ids = self
            .storage
            .retrieve_and_mark_repushed(now - repush, now)
            .await?;
        if ids.is_empty() {
            return Ok(());
        }

        if let Err(e) = self.enqueuer.push(&ids).await {
            warn!(first_id = %ids[0], count = ids.len(), error = %e, "sending push");
            return Err(EngineError::Transport(e));
        }
        debug!(first_id = %ids[0], count = ids.len(), "processed repushes");
        Ok(())
    }
}
