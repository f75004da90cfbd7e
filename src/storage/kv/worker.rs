//! Worker-driven operations for the key-value backend: releasing delayed
//! steps, collecting timeouts, and finding ids to re-push.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::bucket::KvBucket;
use super::{prim, KvStorage};
use crate::storage::error::{Result, StorageError};
use crate::storage::{StepCommandRaw, StepCommandResult, StepEnqueueing, StepResult, WorkerStorage};

/// Step ids whose `not_until` has passed.
async fn find_not_until_step_ids<B: KvBucket>(b: &B, now: DateTime<Utc>) -> Result<Vec<String>> {
    let mut step_ids = Vec::new();
    // a full scan; fine for the sizes this backend is aimed at
    for key in b.keys().await? {
        let Some(step_id) = key.strip_suffix(prim::SFX_STEP_NOT_UNTIL) else {
            continue;
        };
        let Some(raw) = b.get(&key).await? else {
            continue;
        };
        match prim::parse_time(&raw)? {
            Some(not_until) if not_until <= now => step_ids.push(step_id.to_string()),
            _ => {}
        }
    }
    Ok(step_ids)
}

/// Step ids whose `timeout` has passed.
async fn find_timed_out_step_ids<B: KvBucket>(b: &B, now: DateTime<Utc>) -> Result<Vec<String>> {
    let mut step_ids = Vec::new();
    for key in b.keys().await? {
        let Some(step_id) = key.strip_suffix(prim::SFX_STEP_TIMEOUT) else {
            continue;
        };
        let Some(raw) = b.get(&key).await? else {
            continue;
        };
        match prim::parse_time(&raw)? {
            Some(timeout) if timeout <= now => step_ids.push(step_id.to_string()),
            _ => {}
        }
    }
    Ok(step_ids)
}

/// Reads back a raw command retained for a delayed step.
async fn get_id_cmd_raw<B: KvBucket>(b: &B, id: &str, uuid: &str) -> Result<StepCommandRaw> {
    let request_type = prim::get_id_cmd_req_type(b, id, uuid).await?;
    let command = b
        .get(&prim::id_cmd_key(id, uuid, prim::SFX_CMD_RAW))
        .await?
        .unwrap_or_default();
    Ok(StepCommandRaw {
        command_uuid: uuid.to_string(),
        request_type,
        command,
    })
}

/// Reconstructs a released step's enqueueing, consuming the raw command
/// bytes held under the step id.
async fn get_step_enqueueing<B: KvBucket>(
    b: &B,
    cb: &B,
    step_id: &str,
) -> Result<StepEnqueueing> {
    let result = prim::get_step_result(b, step_id).await?;
    let mut step = StepEnqueueing {
        context: result.context,
        ids: prim::get_step_ids(b, step_id).await?,
        commands: Vec::new(),
    };

    for uuid in prim::get_step_cmds(b, step_id).await? {
        step.commands.push(get_id_cmd_raw(cb, step_id, &uuid).await?);
        prim::delete_id_cmd(cb, step_id, &uuid).await?;
    }

    Ok(step)
}

/// Builds a (possibly partial) command result for a timed-out step,
/// `None` when the row no longer exists.
async fn get_id_cmd_step_result<B: KvBucket>(
    b: &B,
    id: &str,
    uuid: &str,
) -> Result<Option<StepCommandResult>> {
    if !prim::id_cmd_exists(b, id, uuid).await? {
        return Ok(None);
    }
    let mut result = StepCommandResult {
        command_uuid: uuid.to_string(),
        completed: prim::id_cmd_is_complete(b, id, uuid).await?,
        request_type: prim::get_id_cmd_req_type(b, id, uuid).await?,
        result_report: Vec::new(),
    };
    if b.has(&prim::id_cmd_key(id, uuid, prim::SFX_CMD_RESULT)).await? {
        result.result_report = prim::get_id_cmd_result(b, id, uuid).await?;
    }
    Ok(Some(result))
}

#[async_trait]
impl<B: KvBucket> WorkerStorage for KvStorage<B> {
    async fn retrieve_steps_to_enqueue(
        &self,
        push_time: DateTime<Utc>,
    ) -> Result<Vec<StepEnqueueing>> {
        let _guard = self.lock.write().await;
        let step_ids = find_not_until_step_ids(&self.step_store, push_time).await?;

        let mut released = Vec::with_capacity(step_ids.len());
        for step_id in step_ids {
            let step =
                get_step_enqueueing(&self.step_store, &self.id_cmd_store, &step_id).await?;
            // no longer consider this step for future releases
            prim::delete_step_not_until(&self.step_store, &step_id).await?;
            for id in &step.ids {
                for cmd in &step.commands {
                    self.id_cmd_store
                        .set(
                            &prim::id_cmd_key(id, &cmd.command_uuid, prim::SFX_CMD_LAST_PUSH),
                            prim::format_time(push_time),
                        )
                        .await?;
                }
            }
            released.push(step);
        }

        Ok(released)
    }

    async fn retrieve_timed_out_steps(&self) -> Result<Vec<StepResult>> {
        let _guard = self.lock.write().await;
        let step_ids = find_timed_out_step_ids(&self.step_store, Utc::now()).await?;

        let mut steps = Vec::new();
        for step_id in step_ids {
            let step = prim::get_step_result(&self.step_store, &step_id).await?;
            let enr_ids = prim::get_step_ids(&self.step_store, &step_id).await?;
            let cmd_uuids = prim::get_step_cmds(&self.step_store, &step_id).await?;

            for id in &enr_ids {
                // a per-id copy for workflow processing
                let mut per_id = StepResult {
                    context: step.context.clone(),
                    ids: vec![id.clone()],
                    commands: Vec::new(),
                };

                for uuid in &cmd_uuids {
                    if let Some(result) =
                        get_id_cmd_step_result(&self.id_cmd_store, id, uuid).await?
                    {
                        per_id.commands.push(result);
                        prim::delete_id_cmd(&self.id_cmd_store, id, uuid).await?;
                    }
                }

                if !per_id.commands.is_empty() {
                    steps.push(per_id);
                }
            }

            // clean up any raw bytes a never-released delayed step held
            for uuid in &cmd_uuids {
                prim::delete_id_cmd(&self.id_cmd_store, &step_id, uuid).await?;
            }
            prim::delete_step(&self.step_store, &step_id).await?;
        }

        Ok(steps)
    }

    async fn retrieve_and_mark_repushed(
        &self,
        if_before: DateTime<Utc>,
        push_time: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let _guard = self.lock.write().await;

        let mut ids = BTreeSet::new();
        for key in self.id_cmd_store.keys().await? {
            let Some(id_cmd) = key.strip_suffix(prim::SFX_CMD_LAST_PUSH) else {
                continue;
            };
            let Some(raw) = self.id_cmd_store.get(&key).await? else {
                continue;
            };
            let Some(last_push) = prim::parse_time(&raw)? else {
                // unset while delayed; not eligible for re-push
                continue;
            };
            if last_push >= if_before {
                continue;
            }

            let id_key = format!("{id_cmd}{}", prim::SFX_CMD_ID);
            let id = self
                .id_cmd_store
                .get(&id_key)
                .await?
                .and_then(|raw| String::from_utf8(raw).ok())
                .ok_or_else(|| StorageError::InvalidRecord(format!("missing key: {id_key}")))?;

            self.id_cmd_store
                .set(&key, prim::format_time(push_time))
                .await?;
            ids.insert(id);
        }

        Ok(ids.into_iter().collect())
    }
}
