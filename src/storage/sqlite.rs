//! SQLite engine storage backend with connection pooling.
//!
//! Multi-step operations run inside one transaction each. The worker
//! operations use a claim-then-scan idiom: rows due for release or
//! timeout are first tagged with a per-tick random marker
//! (`not_until_proc` / `timeout_proc`), then selected and mutated by that
//! marker, which keeps two concurrent worker instances from processing
//! the same step.
//!
//! The async methods use `spawn_blocking` internally to keep rusqlite's
//! synchronous I/O off the async runtime.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rand::Rng;
use rusqlite::{params, params_from_iter, OptionalExtension};
use tracing::debug;

use super::error::{Result, StorageError};
use super::{
    EventSubscription, EventSubscriptionStorage, ReadEventSubscriptionStorage, StepCommandResult,
    StepContext, StepEnqueueing, StepEnqueuingWithConfig, StepResult, Storage, WorkerStorage,
};
use crate::workflow::EventFlag;

const DEFAULT_POOL_SIZE: u32 = 10;
const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 30;

/// Configuration for the SQLite connection pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections in the pool.
    pub max_size: u32,
    /// Minimum number of idle connections to maintain.
    pub min_idle: Option<u32>,
    /// Maximum time to wait for a connection from the pool.
    pub connection_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_POOL_SIZE,
            min_idle: Some(2),
            connection_timeout: Duration::from_secs(DEFAULT_CONNECTION_TIMEOUT_SECS),
        }
    }
}

/// SQLite-backed engine storage.
pub struct SqliteStorage {
    pool: Pool<SqliteConnectionManager>,
    db_path: String,
}

fn unix(t: DateTime<Utc>) -> i64 {
    t.timestamp()
}

fn claim_token(prefix: &str) -> String {
    let mut buf = [0u8; 20];
    rand::thread_rng().fill(&mut buf);
    format!("{prefix}.{}", hex::encode(buf))
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StorageError::Io(std::io::Error::other(e.to_string())))?
}

impl SqliteStorage {
    /// Opens (creating if needed) storage at the given database path.
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        Self::with_config(db_path, PoolConfig::default())
    }

    /// Opens storage with a custom pool configuration.
    pub fn with_config(db_path: impl AsRef<Path>, config: PoolConfig) -> Result<Self> {
        let db_path = db_path.as_ref().to_string_lossy().to_string();
        let manager = SqliteConnectionManager::file(&db_path);
        let pool = Self::build_pool(manager, &config)?;
        let storage = Self { pool, db_path };
        storage.initialize()?;
        Ok(storage)
    }

    /// An in-memory database, for tests.
    ///
    /// In-memory databases get a single pooled connection so every caller
    /// sees the same data.
    pub fn in_memory() -> Result<Self> {
        let config = PoolConfig {
            max_size: 1,
            min_idle: Some(0),
            ..PoolConfig::default()
        };
        let manager = SqliteConnectionManager::memory();
        let pool = Self::build_pool(manager, &config)?;
        let storage = Self {
            pool,
            db_path: ":memory:".to_string(),
        };
        storage.initialize()?;
        Ok(storage)
    }

    fn build_pool(
        manager: SqliteConnectionManager,
        config: &PoolConfig,
    ) -> Result<Pool<SqliteConnectionManager>> {
        let pool = Pool::builder()
            .max_size(config.max_size)
            .min_idle(config.min_idle)
            .connection_timeout(config.connection_timeout)
            .build(manager)?;
        Ok(pool)
    }

    fn initialize(&self) -> Result<()> {
        let conn = self.get_connection()?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS steps (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                workflow_name TEXT NOT NULL,
                instance_id TEXT NOT NULL,
                step_name TEXT NOT NULL DEFAULT '',
                context BLOB,
                not_until INTEGER,
                not_until_proc TEXT,
                timeout INTEGER,
                timeout_proc TEXT,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_steps_workflow ON steps(workflow_name);
            CREATE INDEX IF NOT EXISTS idx_steps_not_until ON steps(not_until);
            CREATE INDEX IF NOT EXISTS idx_steps_timeout ON steps(timeout);

            CREATE TABLE IF NOT EXISTS step_commands (
                step_id INTEGER NOT NULL,
                command_uuid TEXT NOT NULL,
                request_type TEXT NOT NULL,
                command BLOB NOT NULL,
                PRIMARY KEY (step_id, command_uuid)
            );

            CREATE TABLE IF NOT EXISTS id_commands (
                enrollment_id TEXT NOT NULL,
                command_uuid TEXT NOT NULL,
                step_id INTEGER NOT NULL,
                request_type TEXT NOT NULL,
                last_push INTEGER,
                result BLOB,
                completed INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (enrollment_id, command_uuid)
            );
            CREATE INDEX IF NOT EXISTS idx_id_commands_step ON id_commands(step_id);
            CREATE INDEX IF NOT EXISTS idx_id_commands_last_push ON id_commands(last_push);

            CREATE TABLE IF NOT EXISTS event_subscriptions (
                name TEXT PRIMARY KEY,
                event_type TEXT NOT NULL,
                workflow_name TEXT NOT NULL,
                context TEXT NOT NULL DEFAULT '',
                event_context TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS workflow_status (
                enrollment_id TEXT NOT NULL,
                workflow_name TEXT NOT NULL,
                last_started INTEGER NOT NULL,
                PRIMARY KEY (enrollment_id, workflow_name)
            );",
        )?;

        Ok(())
    }

    fn get_connection(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(StorageError::Pool)
    }

    /// The database path (`:memory:` for in-memory storage).
    pub fn db_path(&self) -> &str {
        &self.db_path
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn retrieve_command_request_type(
        &self,
        id: &str,
        uuid: &str,
    ) -> Result<Option<String>> {
        if id.is_empty() || uuid.is_empty() {
            return Err(StorageError::EmptyKey);
        }
        let conn = self.get_connection()?;
        let (id, uuid) = (id.to_string(), uuid.to_string());

        run_blocking(move || {
            let req_type = conn
                .query_row(
                    "SELECT request_type FROM id_commands
                     WHERE enrollment_id = ?1 AND command_uuid = ?2",
                    params![id, uuid],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(req_type)
        })
        .await
    }

    async fn store_command_response_and_retrieve_completed_step(
        &self,
        id: &str,
        command: &StepCommandResult,
    ) -> Result<Option<StepResult>> {
        command.validate()?;
        let mut conn = self.get_connection()?;
        let id = id.to_string();
        let sc = command.clone();

        run_blocking(move || {
            let tx = conn.transaction()?;

            let step_id: i64 = tx
                .query_row(
                    "SELECT step_id FROM id_commands
                     WHERE enrollment_id = ?1 AND command_uuid = ?2",
                    params![id, sc.command_uuid],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| StorageError::CommandNotFound(sc.command_uuid.clone()))?;

            if !sc.completed {
                // NotNow: record the report, leave the row pending
                tx.execute(
                    "UPDATE id_commands SET result = ?3
                     WHERE enrollment_id = ?1 AND command_uuid = ?2",
                    params![id, sc.command_uuid, sc.result_report],
                )?;
                tx.commit()?;
                return Ok(None);
            }

            let incomplete: i64 = tx.query_row(
                "SELECT COUNT(*) FROM id_commands
                 WHERE enrollment_id = ?1 AND step_id = ?2 AND completed = 0",
                params![id, step_id],
                |row| row.get(0),
            )?;

            if incomplete > 1 {
                // other commands of this step are still pending for this
                // id; record and wait
                tx.execute(
                    "UPDATE id_commands SET result = ?3, completed = 1
                     WHERE enrollment_id = ?1 AND command_uuid = ?2",
                    params![id, sc.command_uuid, sc.result_report],
                )?;
                tx.commit()?;
                return Ok(None);
            }

            // this is the last command to complete the step for this id
            let context = tx.query_row(
                "SELECT workflow_name, instance_id, step_name, context
                 FROM steps WHERE id = ?1",
                params![step_id],
                |row| {
                    Ok(StepContext {
                        workflow_name: row.get(0)?,
                        instance_id: row.get(1)?,
                        step_name: row.get(2)?,
                        context: row.get::<_, Option<Vec<u8>>>(3)?.unwrap_or_default(),
                    })
                },
            )?;

            let mut commands = vec![sc.clone()];
            {
                let mut stmt = tx.prepare(
                    "SELECT command_uuid, request_type, result FROM id_commands
                     WHERE enrollment_id = ?1 AND step_id = ?2 AND command_uuid <> ?3",
                )?;
                let rows = stmt.query_map(params![id, step_id, sc.command_uuid], |row| {
                    Ok(StepCommandResult {
                        command_uuid: row.get(0)?,
                        request_type: row.get(1)?,
                        result_report: row.get::<_, Option<Vec<u8>>>(2)?.unwrap_or_default(),
                        completed: true,
                    })
                })?;
                for row in rows {
                    commands.push(row?);
                }
            }

            tx.execute(
                "DELETE FROM id_commands WHERE enrollment_id = ?1 AND step_id = ?2",
                params![id, step_id],
            )?;
            tx.execute(
                "DELETE FROM step_commands WHERE step_id = ?1
                 AND NOT EXISTS (SELECT 1 FROM id_commands WHERE step_id = ?1)",
                params![step_id],
            )?;
            tx.execute(
                "DELETE FROM steps WHERE id = ?1
                 AND NOT EXISTS (SELECT 1 FROM id_commands WHERE step_id = ?1)",
                params![step_id],
            )?;
            tx.commit()?;

            Ok(Some(StepResult {
                context,
                ids: vec![id],
                commands,
            }))
        })
        .await
    }

    async fn store_step(
        &self,
        step: &StepEnqueuingWithConfig,
        push_time: DateTime<Utc>,
    ) -> Result<()> {
        step.validate()?;
        let mut conn = self.get_connection()?;
        let step = step.clone();
        let push_time = unix(push_time);

        run_blocking(move || {
            let tx = conn.transaction()?;

            tx.execute(
                "INSERT INTO steps
                   (workflow_name, instance_id, step_name, context, not_until, timeout, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    step.step.context.workflow_name,
                    step.step.context.instance_id,
                    step.step.context.step_name,
                    step.step.context.context,
                    step.not_until.map(unix),
                    step.timeout.map(unix),
                    unix(Utc::now()),
                ],
            )?;
            let step_id = tx.last_insert_rowid();

            for cmd in &step.step.commands {
                if step.not_until.is_some() {
                    tx.execute(
                        "INSERT INTO step_commands (step_id, command_uuid, request_type, command)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![step_id, cmd.command_uuid, cmd.request_type, cmd.command],
                    )
                    .map_err(|e| duplicate_or(e, "", &cmd.command_uuid))?;
                }
                for id in &step.step.ids {
                    tx.execute(
                        "INSERT INTO id_commands
                           (enrollment_id, command_uuid, step_id, request_type, last_push)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![
                            id,
                            cmd.command_uuid,
                            step_id,
                            cmd.request_type,
                            step.not_until.is_none().then_some(push_time),
                        ],
                    )
                    .map_err(|e| duplicate_or(e, id, &cmd.command_uuid))?;
                }
            }

            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn retrieve_outstanding_workflow_status(
        &self,
        workflow_name: &str,
        ids: &[String],
    ) -> Result<Vec<String>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.get_connection()?;
        let workflow_name = workflow_name.to_string();
        let ids = ids.to_vec();

        run_blocking(move || {
            let placeholders = vec!["?"; ids.len()].join(",");
            let sql = format!(
                "SELECT DISTINCT ic.enrollment_id FROM id_commands ic
                 JOIN steps s ON s.id = ic.step_id
                 WHERE s.workflow_name = ? AND ic.completed = 0
                   AND ic.enrollment_id IN ({placeholders})
                 ORDER BY ic.enrollment_id"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params_from_iter(std::iter::once(workflow_name).chain(ids)),
                |row| row.get(0),
            )?;
            let mut outstanding = Vec::new();
            for row in rows {
                outstanding.push(row?);
            }
            Ok(outstanding)
        })
        .await
    }

    async fn cancel_steps(&self, id: &str, workflow_name: Option<&str>) -> Result<()> {
        if id.is_empty() {
            return Err(StorageError::EmptyKey);
        }
        let mut conn = self.get_connection()?;
        let id = id.to_string();
        let workflow_name = workflow_name.map(str::to_string);

        run_blocking(move || {
            let tx = conn.transaction()?;
            match workflow_name {
                Some(wf) => {
                    tx.execute(
                        "DELETE FROM id_commands WHERE enrollment_id = ?1
                         AND step_id IN (SELECT id FROM steps WHERE workflow_name = ?2)",
                        params![id, wf],
                    )?;
                }
                None => {
                    tx.execute(
                        "DELETE FROM id_commands WHERE enrollment_id = ?1",
                        params![id],
                    )?;
                }
            }
            tx.execute(
                "DELETE FROM step_commands
                 WHERE step_id NOT IN (SELECT DISTINCT step_id FROM id_commands)",
                [],
            )?;
            tx.execute(
                "DELETE FROM steps
                 WHERE id NOT IN (SELECT DISTINCT step_id FROM id_commands)",
                [],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn retrieve_workflow_started(
        &self,
        id: &str,
        workflow_name: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let conn = self.get_connection()?;
        let (id, workflow_name) = (id.to_string(), workflow_name.to_string());

        run_blocking(move || {
            let secs: Option<i64> = conn
                .query_row(
                    "SELECT last_started FROM workflow_status
                     WHERE enrollment_id = ?1 AND workflow_name = ?2",
                    params![id, workflow_name],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(secs.and_then(|s| DateTime::from_timestamp(s, 0)))
        })
        .await
    }

    async fn record_workflow_started(
        &self,
        ids: &[String],
        workflow_name: &str,
        started: DateTime<Utc>,
    ) -> Result<()> {
        if ids.is_empty() {
            return Err(StorageError::MissingIds);
        }
        let conn = self.get_connection()?;
        let ids = ids.to_vec();
        let workflow_name = workflow_name.to_string();
        let started = unix(started);

        run_blocking(move || {
            for id in &ids {
                conn.execute(
                    "INSERT INTO workflow_status (enrollment_id, workflow_name, last_started)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT(enrollment_id, workflow_name)
                     DO UPDATE SET last_started = excluded.last_started",
                    params![id, workflow_name, started],
                )?;
            }
            Ok(())
        })
        .await
    }

    async fn clear_workflow_status(&self, id: &str) -> Result<()> {
        let conn = self.get_connection()?;
        let id = id.to_string();

        run_blocking(move || {
            conn.execute(
                "DELETE FROM workflow_status WHERE enrollment_id = ?1",
                params![id],
            )?;
            Ok(())
        })
        .await
    }
}

fn duplicate_or(err: rusqlite::Error, id: &str, uuid: &str) -> StorageError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            StorageError::DuplicateCommand {
                id: id.to_string(),
                uuid: uuid.to_string(),
            }
        }
        _ => err.into(),
    }
}

#[async_trait]
impl WorkerStorage for SqliteStorage {
    async fn retrieve_steps_to_enqueue(
        &self,
        push_time: DateTime<Utc>,
    ) -> Result<Vec<StepEnqueueing>> {
        let mut conn = self.get_connection()?;
        let push_time = unix(push_time);

        run_blocking(move || {
            let tx = conn.transaction()?;
            let token = claim_token("notu");

            let claimed = tx.execute(
                "UPDATE steps SET not_until_proc = ?1
                 WHERE not_until IS NOT NULL AND not_until <= ?2",
                params![token, push_time],
            )?;
            if claimed == 0 {
                tx.commit()?;
                return Ok(Vec::new());
            }
            debug!(count = claimed, "claimed delayed steps");

            let mut steps: BTreeMap<i64, StepEnqueueing> = BTreeMap::new();
            {
                let mut stmt = tx.prepare(
                    "SELECT id, workflow_name, instance_id, step_name
                     FROM steps WHERE not_until_proc = ?1",
                )?;
                let rows = stmt.query_map(params![token], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        StepEnqueueing {
                            context: StepContext {
                                workflow_name: row.get(1)?,
                                instance_id: row.get(2)?,
                                step_name: row.get(3)?,
                                context: Vec::new(),
                            },
                            ids: Vec::new(),
                            commands: Vec::new(),
                        },
                    ))
                })?;
                for row in rows {
                    let (step_id, step) = row?;
                    steps.insert(step_id, step);
                }
            }

            {
                let mut stmt = tx.prepare(
                    "SELECT DISTINCT ic.step_id, ic.enrollment_id FROM id_commands ic
                     JOIN steps s ON s.id = ic.step_id
                     WHERE s.not_until_proc = ?1
                     ORDER BY ic.enrollment_id",
                )?;
                let rows = stmt.query_map(params![token], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
                })?;
                for row in rows {
                    let (step_id, enrollment_id) = row?;
                    if let Some(step) = steps.get_mut(&step_id) {
                        step.ids.push(enrollment_id);
                    }
                }
            }

            {
                let mut stmt = tx.prepare(
                    "SELECT sc.step_id, sc.command_uuid, sc.request_type, sc.command
                     FROM step_commands sc
                     JOIN steps s ON s.id = sc.step_id
                     WHERE s.not_until_proc = ?1",
                )?;
                let rows = stmt.query_map(params![token], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        super::StepCommandRaw {
                            command_uuid: row.get(1)?,
                            request_type: row.get(2)?,
                            command: row.get(3)?,
                        },
                    ))
                })?;
                for row in rows {
                    let (step_id, cmd) = row?;
                    if let Some(step) = steps.get_mut(&step_id) {
                        step.commands.push(cmd);
                    }
                }
            }

            tx.execute(
                "DELETE FROM step_commands
                 WHERE step_id IN (SELECT id FROM steps WHERE not_until_proc = ?1)",
                params![token],
            )?;
            tx.execute(
                "UPDATE id_commands SET last_push = ?2
                 WHERE step_id IN (SELECT id FROM steps WHERE not_until_proc = ?1)",
                params![token, push_time],
            )?;
            tx.execute(
                "UPDATE steps SET not_until = NULL, not_until_proc = NULL
                 WHERE not_until_proc = ?1",
                params![token],
            )?;
            tx.commit()?;

            Ok(steps.into_values().collect())
        })
        .await
    }

    async fn retrieve_timed_out_steps(&self) -> Result<Vec<StepResult>> {
        let mut conn = self.get_connection()?;
        let now = unix(Utc::now());

        run_blocking(move || {
            let tx = conn.transaction()?;
            let token = claim_token("tout");

            let claimed = tx.execute(
                "UPDATE steps SET timeout_proc = ?1
                 WHERE timeout IS NOT NULL AND timeout <= ?2",
                params![token, now],
            )?;
            if claimed == 0 {
                tx.commit()?;
                return Ok(Vec::new());
            }
            debug!(count = claimed, "claimed timed-out steps");

            let mut contexts: BTreeMap<i64, StepContext> = BTreeMap::new();
            {
                let mut stmt = tx.prepare(
                    "SELECT id, workflow_name, instance_id, step_name, context
                     FROM steps WHERE timeout_proc = ?1",
                )?;
                let rows = stmt.query_map(params![token], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        StepContext {
                            workflow_name: row.get(1)?,
                            instance_id: row.get(2)?,
                            step_name: row.get(3)?,
                            context: row.get::<_, Option<Vec<u8>>>(4)?.unwrap_or_default(),
                        },
                    ))
                })?;
                for row in rows {
                    let (step_id, ctx) = row?;
                    contexts.insert(step_id, ctx);
                }
            }

            let mut results: BTreeMap<(i64, String), StepResult> = BTreeMap::new();
            {
                let mut stmt = tx.prepare(
                    "SELECT ic.step_id, ic.enrollment_id, ic.command_uuid,
                            ic.request_type, ic.result, ic.completed
                     FROM id_commands ic
                     JOIN steps s ON s.id = ic.step_id
                     WHERE s.timeout_proc = ?1",
                )?;
                let rows = stmt.query_map(params![token], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        StepCommandResult {
                            command_uuid: row.get(2)?,
                            request_type: row.get(3)?,
                            result_report: row.get::<_, Option<Vec<u8>>>(4)?.unwrap_or_default(),
                            completed: row.get(5)?,
                        },
                    ))
                })?;
                for row in rows {
                    let (step_id, enrollment_id, cmd) = row?;
                    let Some(ctx) = contexts.get(&step_id) else {
                        continue;
                    };
                    results
                        .entry((step_id, enrollment_id.clone()))
                        .or_insert_with(|| StepResult {
                            context: ctx.clone(),
                            ids: vec![enrollment_id],
                            commands: Vec::new(),
                        })
                        .commands
                        .push(cmd);
                }
            }

            tx.execute(
                "DELETE FROM step_commands
                 WHERE step_id IN (SELECT id FROM steps WHERE timeout_proc = ?1)",
                params![token],
            )?;
            tx.execute(
                "DELETE FROM id_commands
                 WHERE step_id IN (SELECT id FROM steps WHERE timeout_proc = ?1)",
                params![token],
            )?;
            tx.execute("DELETE FROM steps WHERE timeout_proc = ?1", params![token])?;
            tx.commit()?;

            Ok(results.into_values().collect())
        })
        .await
    }

    async fn retrieve_and_mark_repushed(
        &self,
        if_before: DateTime<Utc>,
        push_time: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let mut conn = self.get_connection()?;
        let if_before = unix(if_before);
        let push_time = unix(push_time);

        run_blocking(move || {
            let tx = conn.transaction()?;
            let mut ids = Vec::new();
            {
                let mut stmt = tx.prepare(
                    "SELECT DISTINCT enrollment_id FROM id_commands
                     WHERE last_push IS NOT NULL AND last_push < ?1
                     ORDER BY enrollment_id",
                )?;
                let rows = stmt.query_map(params![if_before], |row| row.get(0))?;
                for row in rows {
                    ids.push(row?);
                }
            }
            tx.execute(
                "UPDATE id_commands SET last_push = ?2
                 WHERE last_push IS NOT NULL AND last_push < ?1",
                params![if_before, push_time],
            )?;
            tx.commit()?;
            Ok(ids)
        })
        .await
    }
}

fn row_to_subscription(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventSubscription> {
    Ok(EventSubscription {
        event: row.get(0)?,
        workflow: row.get(1)?,
        context: row.get(2)?,
        event_context: row.get(3)?,
    })
}

#[async_trait]
impl ReadEventSubscriptionStorage for SqliteStorage {
    async fn retrieve_event_subscriptions(
        &self,
        names: &[String],
    ) -> Result<HashMap<String, EventSubscription>> {
        if names.is_empty() {
            return Ok(HashMap::new());
        }
        let conn = self.get_connection()?;
        let names = names.to_vec();

        run_blocking(move || {
            let placeholders = vec!["?"; names.len()].join(",");
            let sql = format!(
                "SELECT name, event_type, workflow_name, context, event_context
                 FROM event_subscriptions WHERE name IN ({placeholders})"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(names), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    EventSubscription {
                        event: row.get(1)?,
                        workflow: row.get(2)?,
                        context: row.get(3)?,
                        event_context: row.get(4)?,
                    },
                ))
            })?;
            let mut subscriptions = HashMap::new();
            for row in rows {
                let (name, sub) = row?;
                subscriptions.insert(name, sub);
            }
            Ok(subscriptions)
        })
        .await
    }

    async fn retrieve_event_subscriptions_by_event(
        &self,
        flag: EventFlag,
    ) -> Result<Vec<EventSubscription>> {
        let event_type = flag
            .name()
            .ok_or_else(|| StorageError::InvalidEventType(flag.to_string()))?;
        let conn = self.get_connection()?;

        run_blocking(move || {
            let mut stmt = conn.prepare(
                "SELECT event_type, workflow_name, context, event_context
                 FROM event_subscriptions WHERE event_type = ?1 ORDER BY name",
            )?;
            let rows = stmt.query_map(params![event_type], row_to_subscription)?;
            let mut subscriptions = Vec::new();
            for row in rows {
                subscriptions.push(row?);
            }
            Ok(subscriptions)
        })
        .await
    }
}

#[async_trait]
impl EventSubscriptionStorage for SqliteStorage {
    async fn store_event_subscription(&self, name: &str, sub: &EventSubscription) -> Result<()> {
        if name.is_empty() {
            return Err(StorageError::EmptyKey);
        }
        sub.validate()?;
        let conn = self.get_connection()?;
        let name = name.to_string();
        let sub = sub.clone();

        run_blocking(move || {
            conn.execute(
                "INSERT INTO event_subscriptions
                   (name, event_type, workflow_name, context, event_context)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(name) DO UPDATE SET
                   event_type = excluded.event_type,
                   workflow_name = excluded.workflow_name,
                   context = excluded.context,
                   event_context = excluded.event_context",
                params![name, sub.event, sub.workflow, sub.context, sub.event_context],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete_event_subscription(&self, name: &str) -> Result<()> {
        let conn = self.get_connection()?;
        let name = name.to_string();

        run_blocking(move || {
            conn.execute(
                "DELETE FROM event_subscriptions WHERE name = ?1",
                params![name],
            )?;
            Ok(())
        })
        .await
    }
}
