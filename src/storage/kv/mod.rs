//! Generic key-value engine storage.
//!
//! [`KvStorage`] implements the full storage contract over four
//! [`KvBucket`]s: steps, id-commands, event subscriptions, and workflow
//! status. Multi-key operations are serialized by a coarse async lock, so
//! any bucket implementation that is individually safe for concurrent use
//! yields a correct backend. The in-memory and on-disk backends are this
//! storage over [`MapBucket`] and [`FsBucket`]; the `redis` feature plugs
//! in a Redis-backed bucket.

mod bucket;
mod event;
mod prim;
mod worker;

pub use bucket::{FsBucket, KvBucket, MapBucket};

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::error::{Result, StorageError};
use super::{StepCommandResult, StepEnqueuingWithConfig, StepResult, Storage};

/// Engine storage over key-value buckets.
pub struct KvStorage<B> {
    // coarse lock serializing multi-key step/command operations
    pub(super) lock: RwLock<()>,
    pub(super) step_store: B,
    pub(super) id_cmd_store: B,
    pub(super) event_store: B,
    pub(super) status_store: B,
}

impl<B: KvBucket> KvStorage<B> {
    /// Creates storage over explicit buckets: steps, id-commands, event
    /// subscriptions, workflow status.
    pub fn with_buckets(step_store: B, id_cmd_store: B, event_store: B, status_store: B) -> Self {
        Self {
            lock: RwLock::new(()),
            step_store,
            id_cmd_store,
            event_store,
            status_store,
        }
    }
}

fn status_key(id: &str, workflow_name: &str) -> String {
    format!("{id}.{workflow_name}")
}

#[async_trait]
impl<B: KvBucket> Storage for KvStorage<B> {
    async fn retrieve_command_request_type(
        &self,
        id: &str,
        uuid: &str,
    ) -> Result<Option<String>> {
        if id.is_empty() || uuid.is_empty() {
            return Err(StorageError::EmptyKey);
        }
        let _guard = self.lock.read().await;
        if !prim::id_cmd_exists(&self.id_cmd_store, id, uuid).await? {
            return Ok(None);
        }
        prim::get_id_cmd_req_type(&self.id_cmd_store, id, uuid)
            .await
            .map(Some)
    }

    async fn store_command_response_and_retrieve_completed_step(
        &self,
        id: &str,
        command: &StepCommandResult,
    ) -> Result<Option<StepResult>> {
        command.validate()?;
        let _guard = self.lock.write().await;

        if !prim::id_cmd_exists(&self.id_cmd_store, id, &command.command_uuid).await? {
            // command must exist for us to record a response against it
            return Err(StorageError::CommandNotFound(command.command_uuid.clone()));
        }

        prim::set_id_cmd_update(&self.id_cmd_store, id, command).await?;

        if !command.completed {
            // this command itself is not complete (NotNow), so the step
            // can't be. result recorded; wait for the next response.
            return Ok(None);
        }

        let step_id =
            prim::get_id_cmd_step_id(&self.id_cmd_store, id, &command.command_uuid).await?;
        let cmd_uuids = prim::get_step_cmds(&self.step_store, &step_id).await?;

        let mut commands = Vec::with_capacity(cmd_uuids.len());
        for uuid in &cmd_uuids {
            if *uuid != command.command_uuid
                && !prim::id_cmd_is_complete(&self.id_cmd_store, id, uuid).await?
            {
                // another command of the step is still pending for this id
                return Ok(None);
            }

            let mut result = StepCommandResult {
                command_uuid: uuid.clone(),
                completed: true,
                ..Default::default()
            };
            if *uuid == command.command_uuid {
                result.request_type = command.request_type.clone();
                result.result_report = command.result_report.clone();
            } else {
                result.result_report =
                    prim::get_id_cmd_result(&self.id_cmd_store, id, uuid).await?;
                result.request_type =
                    prim::get_id_cmd_req_type(&self.id_cmd_store, id, uuid).await?;
            }
            commands.push(result);
        }

        let mut step = prim::get_step_result(&self.step_store, &step_id).await?;
        step.ids = vec![id.to_string()];
        step.commands = commands;

        for uuid in &cmd_uuids {
            prim::delete_id_cmd(&self.id_cmd_store, id, uuid).await?;
        }

        prim::delete_step_if_all_ids_complete(
            &self.step_store,
            &self.id_cmd_store,
            &step_id,
            &cmd_uuids,
        )
        .await?;

        Ok(Some(step))
    }

    async fn store_step(
        &self,
        step: &StepEnqueuingWithConfig,
        push_time: DateTime<Utc>,
    ) -> Result<()> {
        step.validate()?;
        let _guard = self.lock.write().await;

        // a unique id tracks this step across its buckets
        let step_id = Uuid::new_v4().to_string();

        let mut seen = BTreeSet::new();
        for cmd in &step.step.commands {
            for id in &step.step.ids {
                if !seen.insert((id.clone(), cmd.command_uuid.clone())) {
                    return Err(StorageError::DuplicateCommand {
                        id: id.clone(),
                        uuid: cmd.command_uuid.clone(),
                    });
                }
                if prim::id_cmd_exists(&self.id_cmd_store, id, &cmd.command_uuid).await? {
                    return Err(StorageError::DuplicateCommand {
                        id: id.clone(),
                        uuid: cmd.command_uuid.clone(),
                    });
                }
            }
        }

        prim::set_step(&self.step_store, &step_id, step).await?;

        // delayed steps keep last_push unset until the worker releases them
        let last_push = step.not_until.is_none().then_some(push_time);

        for cmd in &step.step.commands {
            if step.not_until.is_some() {
                // the raw plist rides along under the step id standing in
                // as enrollment id until release
                prim::set_id_cmd(&self.id_cmd_store, &step_id, &step_id, cmd, None, true).await?;
            }
            for id in &step.step.ids {
                prim::set_id_cmd(&self.id_cmd_store, &step_id, id, cmd, last_push, false).await?;
            }
        }

        Ok(())
    }

    async fn retrieve_outstanding_workflow_status(
        &self,
        workflow_name: &str,
        ids: &[String],
    ) -> Result<Vec<String>> {
        let _guard = self.lock.read().await;
        let step_ids =
            prim::find_workflow_steps_with_ids(&self.step_store, Some(workflow_name), ids).await?;

        let mut outstanding = BTreeSet::new();
        for step_id in &step_ids {
            let cmd_uuids = prim::get_step_cmds(&self.step_store, step_id).await?;
            'ids: for id in ids {
                if outstanding.contains(id) {
                    continue;
                }
                for uuid in &cmd_uuids {
                    if !prim::id_cmd_exists(&self.id_cmd_store, id, uuid).await? {
                        // perhaps already completed (and deleted)
                        continue;
                    }
                    if !prim::id_cmd_is_complete(&self.id_cmd_store, id, uuid).await? {
                        outstanding.insert(id.clone());
                        continue 'ids;
                    }
                }
            }
        }

        Ok(outstanding.into_iter().collect())
    }

    async fn cancel_steps(&self, id: &str, workflow_name: Option<&str>) -> Result<()> {
        if id.is_empty() {
            return Err(StorageError::EmptyKey);
        }
        let _guard = self.lock.write().await;
        let ids = [id.to_string()];
        let step_ids =
            prim::find_workflow_steps_with_ids(&self.step_store, workflow_name, &ids).await?;

        for step_id in &step_ids {
            let cmd_uuids = prim::get_step_cmds(&self.step_store, step_id).await?;
            for uuid in &cmd_uuids {
                prim::delete_id_cmd(&self.id_cmd_store, id, uuid).await?;
            }

            // only remove the step once no command rows remain for any of
            // its ids
            let mut rows_remain = false;
            'remain: for step_enr_id in prim::get_step_ids(&self.step_store, step_id).await? {
                for uuid in &cmd_uuids {
                    if prim::id_cmd_exists(&self.id_cmd_store, &step_enr_id, uuid).await? {
                        rows_remain = true;
                        break 'remain;
                    }
                }
            }
            if !rows_remain {
                // clean up any retained raw bytes of a still-delayed step
                for uuid in &cmd_uuids {
                    prim::delete_id_cmd(&self.id_cmd_store, step_id, uuid).await?;
                }
                prim::delete_step(&self.step_store, step_id).await?;
            }
        }
        Ok(())
    }

    async fn retrieve_workflow_started(
        &self,
        id: &str,
        workflow_name: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let Some(raw) = self.status_store.get(&status_key(id, workflow_name)).await? else {
            return Ok(None);
        };
        let secs: i64 = std::str::from_utf8(&raw)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| StorageError::InvalidRecord("workflow started time".to_string()))?;
        Ok(DateTime::from_timestamp(secs, 0))
    }

    async fn record_workflow_started(
        &self,
        ids: &[String],
        workflow_name: &str,
        started: DateTime<Utc>,
    ) -> Result<()> {
        let value = started.timestamp().to_string().into_bytes();
        for id in ids {
            self.status_store
                .set(&status_key(id, workflow_name), value.clone())
                .await?;
        }
        Ok(())
    }

    async fn clear_workflow_status(&self, id: &str) -> Result<()> {
        let prefix = format!("{id}.");
        for key in self.status_store.keys().await? {
            if key.starts_with(&prefix) {
                self.status_store.delete(&key).await?;
            }
        }
        Ok(())
    }
}
