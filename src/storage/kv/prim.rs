//! Key layout and record primitives for the key-value backend.
//!
//! Two record families live in separate buckets:
//!
//! - step bucket: `{step_id}.meta|.ids|.ctx|.cmds|.notuntil|.timeout`
//! - id-command bucket: `{id}.{uuid}.step|.reqtype|.raw|.lastpush|.result|.done|.id`
//!
//! Composite values are JSON; timestamps are RFC 3339 text, with an empty
//! value standing for "unset".

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::bucket::KvBucket;
use crate::storage::error::{Result, StorageError};
use crate::storage::{StepCommandRaw, StepCommandResult, StepEnqueuingWithConfig, StepResult};

// step bucket key suffixes
pub(super) const SFX_STEP_META: &str = ".meta";
pub(super) const SFX_STEP_IDS: &str = ".ids";
pub(super) const SFX_STEP_CTX: &str = ".ctx";
pub(super) const SFX_STEP_CMDS: &str = ".cmds";
pub(super) const SFX_STEP_NOT_UNTIL: &str = ".notuntil";
pub(super) const SFX_STEP_TIMEOUT: &str = ".timeout";

// id-command bucket key suffixes
pub(super) const SFX_CMD_STEP_ID: &str = ".step";
pub(super) const SFX_CMD_REQ_TYPE: &str = ".reqtype";
pub(super) const SFX_CMD_RAW: &str = ".raw";
pub(super) const SFX_CMD_LAST_PUSH: &str = ".lastpush";
pub(super) const SFX_CMD_RESULT: &str = ".result";
pub(super) const SFX_CMD_COMPLETE: &str = ".done";
pub(super) const SFX_CMD_ID: &str = ".id";

const SFX_CMD_KEYS: &[&str] = &[
    SFX_CMD_STEP_ID,
    SFX_CMD_REQ_TYPE,
    SFX_CMD_RAW,
    SFX_CMD_LAST_PUSH,
    SFX_CMD_RESULT,
    SFX_CMD_COMPLETE,
    SFX_CMD_ID,
];

const SFX_STEP_KEYS: &[&str] = &[
    SFX_STEP_META,
    SFX_STEP_IDS,
    SFX_STEP_CTX,
    SFX_STEP_CMDS,
    SFX_STEP_NOT_UNTIL,
    SFX_STEP_TIMEOUT,
];

pub(super) fn step_key(step_id: &str, suffix: &str) -> String {
    format!("{step_id}{suffix}")
}

pub(super) fn id_cmd_key(id: &str, uuid: &str, suffix: &str) -> String {
    format!("{id}.{uuid}{suffix}")
}

pub(super) fn format_time(t: DateTime<Utc>) -> Vec<u8> {
    t.to_rfc3339().into_bytes()
}

pub(super) fn parse_time(raw: &[u8]) -> Result<Option<DateTime<Utc>>> {
    if raw.is_empty() {
        return Ok(None);
    }
    let s = std::str::from_utf8(raw)
        .map_err(|e| StorageError::InvalidRecord(format!("timestamp: {e}")))?;
    let t = DateTime::parse_from_rfc3339(s)
        .map_err(|e| StorageError::InvalidRecord(format!("timestamp: {e}")))?;
    Ok(Some(t.with_timezone(&Utc)))
}

/// Step metadata persisted under `.meta`.
#[derive(Serialize, Deserialize)]
struct StepMeta {
    instance_id: String,
    workflow_name: String,
    step_name: String,
}

async fn must_get<B: KvBucket>(b: &B, key: &str) -> Result<Vec<u8>> {
    b.get(key)
        .await?
        .ok_or_else(|| StorageError::InvalidRecord(format!("missing key: {key}")))
}

/// Writes the step records.
pub(super) async fn set_step<B: KvBucket>(
    b: &B,
    step_id: &str,
    step: &StepEnqueuingWithConfig,
) -> Result<()> {
    step.validate()?;

    let meta = StepMeta {
        instance_id: step.step.context.instance_id.clone(),
        workflow_name: step.step.context.workflow_name.clone(),
        step_name: step.step.context.step_name.clone(),
    };
    let cmd_uuids: Vec<&str> = step
        .step
        .commands
        .iter()
        .map(|c| c.command_uuid.as_str())
        .collect();

    b.set(&step_key(step_id, SFX_STEP_META), serde_json::to_vec(&meta)?)
        .await?;
    b.set(
        &step_key(step_id, SFX_STEP_IDS),
        serde_json::to_vec(&step.step.ids)?,
    )
    .await?;
    b.set(
        &step_key(step_id, SFX_STEP_CMDS),
        serde_json::to_vec(&cmd_uuids)?,
    )
    .await?;
    if !step.step.context.context.is_empty() {
        b.set(&step_key(step_id, SFX_STEP_CTX), step.step.context.context.clone())
            .await?;
    }
    if let Some(not_until) = step.not_until {
        b.set(&step_key(step_id, SFX_STEP_NOT_UNTIL), format_time(not_until))
            .await?;
    }
    if let Some(timeout) = step.timeout {
        b.set(&step_key(step_id, SFX_STEP_TIMEOUT), format_time(timeout))
            .await?;
    }
    Ok(())
}

/// The command UUIDs of a step.
pub(super) async fn get_step_cmds<B: KvBucket>(b: &B, step_id: &str) -> Result<Vec<String>> {
    let raw = must_get(b, &step_key(step_id, SFX_STEP_CMDS)).await?;
    Ok(serde_json::from_slice(&raw)?)
}

/// The enrollment ids a step was enqueued for.
pub(super) async fn get_step_ids<B: KvBucket>(b: &B, step_id: &str) -> Result<Vec<String>> {
    let raw = must_get(b, &step_key(step_id, SFX_STEP_IDS)).await?;
    Ok(serde_json::from_slice(&raw)?)
}

/// Populates a step result's context from a stored step; ids and commands
/// are filled in by the caller.
pub(super) async fn get_step_result<B: KvBucket>(b: &B, step_id: &str) -> Result<StepResult> {
    let raw = must_get(b, &step_key(step_id, SFX_STEP_META)).await?;
    let meta: StepMeta = serde_json::from_slice(&raw)?;

    let mut step = StepResult::default();
    step.context.instance_id = meta.instance_id;
    step.context.workflow_name = meta.workflow_name;
    step.context.step_name = meta.step_name;

    if let Some(ctx) = b.get(&step_key(step_id, SFX_STEP_CTX)).await? {
        step.context.context = ctx;
    }

    Ok(step)
}

pub(super) async fn get_id_cmd_req_type<B: KvBucket>(
    b: &B,
    id: &str,
    uuid: &str,
) -> Result<String> {
    let raw = must_get(b, &id_cmd_key(id, uuid, SFX_CMD_REQ_TYPE)).await?;
    String::from_utf8(raw).map_err(|e| StorageError::InvalidRecord(format!("request type: {e}")))
}

/// Writes the tracking records for one command of one enrollment id.
///
/// The raw plist is only written when `save_raw` is set (delayed steps
/// hold their bytes under the step id standing in as enrollment id).
pub(super) async fn set_id_cmd<B: KvBucket>(
    b: &B,
    step_id: &str,
    id: &str,
    cmd: &StepCommandRaw,
    last_push: Option<DateTime<Utc>>,
    save_raw: bool,
) -> Result<()> {
    b.set(
        &id_cmd_key(id, &cmd.command_uuid, SFX_CMD_STEP_ID),
        step_id.as_bytes().to_vec(),
    )
    .await?;
    b.set(
        &id_cmd_key(id, &cmd.command_uuid, SFX_CMD_REQ_TYPE),
        cmd.request_type.as_bytes().to_vec(),
    )
    .await?;
    b.set(
        &id_cmd_key(id, &cmd.command_uuid, SFX_CMD_ID),
        id.as_bytes().to_vec(),
    )
    .await?;
    if save_raw && !cmd.command.is_empty() {
        b.set(
            &id_cmd_key(id, &cmd.command_uuid, SFX_CMD_RAW),
            cmd.command.clone(),
        )
        .await?;
    }
    let last_push_bytes = last_push.map(format_time).unwrap_or_default();
    b.set(
        &id_cmd_key(id, &cmd.command_uuid, SFX_CMD_LAST_PUSH),
        last_push_bytes,
    )
    .await?;
    Ok(())
}

pub(super) async fn id_cmd_exists<B: KvBucket>(b: &B, id: &str, uuid: &str) -> Result<bool> {
    b.has(&id_cmd_key(id, uuid, SFX_CMD_STEP_ID)).await
}

pub(super) async fn id_cmd_is_complete<B: KvBucket>(b: &B, id: &str, uuid: &str) -> Result<bool> {
    b.has(&id_cmd_key(id, uuid, SFX_CMD_COMPLETE)).await
}

pub(super) async fn get_id_cmd_result<B: KvBucket>(b: &B, id: &str, uuid: &str) -> Result<Vec<u8>> {
    must_get(b, &id_cmd_key(id, uuid, SFX_CMD_RESULT)).await
}

/// Records a command's response, marking it complete when terminal.
pub(super) async fn set_id_cmd_update<B: KvBucket>(
    b: &B,
    id: &str,
    sc: &StepCommandResult,
) -> Result<()> {
    b.set(
        &id_cmd_key(id, &sc.command_uuid, SFX_CMD_RESULT),
        sc.result_report.clone(),
    )
    .await?;
    if sc.completed {
        b.set(&id_cmd_key(id, &sc.command_uuid, SFX_CMD_COMPLETE), vec![b'1'])
            .await?;
    }
    Ok(())
}

pub(super) async fn get_id_cmd_step_id<B: KvBucket>(b: &B, id: &str, uuid: &str) -> Result<String> {
    let raw = must_get(b, &id_cmd_key(id, uuid, SFX_CMD_STEP_ID)).await?;
    String::from_utf8(raw).map_err(|e| StorageError::InvalidRecord(format!("step id: {e}")))
}

async fn delete_keys_if_exist<B: KvBucket>(b: &B, keys: &[String]) -> Result<()> {
    for key in keys {
        b.delete(key).await?;
    }
    Ok(())
}

/// Deletes all keys for a command queued for an id.
pub(super) async fn delete_id_cmd<B: KvBucket>(b: &B, id: &str, uuid: &str) -> Result<()> {
    let keys: Vec<String> = SFX_CMD_KEYS
        .iter()
        .map(|sfx| id_cmd_key(id, uuid, sfx))
        .collect();
    delete_keys_if_exist(b, &keys).await
}

/// Deletes all keys for a step.
pub(super) async fn delete_step<B: KvBucket>(b: &B, step_id: &str) -> Result<()> {
    let keys: Vec<String> = SFX_STEP_KEYS
        .iter()
        .map(|sfx| step_key(step_id, sfx))
        .collect();
    delete_keys_if_exist(b, &keys).await
}

pub(super) async fn delete_step_not_until<B: KvBucket>(b: &B, step_id: &str) -> Result<()> {
    b.delete(&step_key(step_id, SFX_STEP_NOT_UNTIL)).await
}

/// Finds step ids of steps targeting any of `ids`, optionally restricted
/// to one workflow.
pub(super) async fn find_workflow_steps_with_ids<B: KvBucket>(
    b: &B,
    workflow_name: Option<&str>,
    ids: &[String],
) -> Result<Vec<String>> {
    let mut step_ids = Vec::new();

    // a full scan; fine for the sizes this backend is aimed at
    'keys: for key in b.keys().await? {
        let Some(step_id) = key.strip_suffix(SFX_STEP_META) else {
            continue;
        };
        if let Some(name) = workflow_name {
            let raw = must_get(b, &key).await?;
            let meta: StepMeta = serde_json::from_slice(&raw)?;
            if meta.workflow_name != name {
                continue;
            }
        }
        for step_id_enrollment in get_step_ids(b, step_id).await? {
            if ids.iter().any(|id| *id == step_id_enrollment) {
                step_ids.push(step_id.to_string());
                continue 'keys;
            }
        }
    }

    Ok(step_ids)
}

/// Deletes completed command rows of a step and, when none remain for any
/// of its ids, the step itself.
pub(super) async fn delete_step_if_all_ids_complete<B: KvBucket>(
    b: &B,
    cb: &B,
    step_id: &str,
    cmd_uuids: &[String],
) -> Result<()> {
    let step_ids = get_step_ids(b, step_id).await?;
    let mut cmds_to_delete = Vec::new();
    for id in &step_ids {
        for uuid in cmd_uuids {
            if !id_cmd_exists(cb, id, uuid).await? {
                // could be deleted already
                continue;
            }
            if !id_cmd_is_complete(cb, id, uuid).await? {
                // step is not complete, bail now
                return Ok(());
            }
            cmds_to_delete.push((id.clone(), uuid.clone()));
        }
    }

    for (id, uuid) in &cmds_to_delete {
        delete_id_cmd(cb, id, uuid).await?;
    }

    delete_step(b, step_id).await
}
