use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::traits::DurationStats;
use stepwise_core::types::{HistoryItem, Trigger, WorkflowId};
use stepwise_engine::Workflow;

/// A workflow as persisted, with its optimistic-concurrency version.
#[derive(Debug, Clone)]
pub struct StoredWorkflow {
    pub workflow: Workflow,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

/// Row of `list()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowSummary {
    pub id: WorkflowId,
    pub name: String,
    pub version: i64,
    pub completed: bool,
    pub canceled: bool,
    pub auto_execution_schedule: Option<DateTime<Utc>>,
}

/// SQLite store for workflow instances and their history log.
///
/// Instances are stored as JSON documents guarded by a version counter.
/// History rows are written once a step is exited and never changed
/// afterwards; only `delete` removes them.
pub struct SqliteWorkflowStore {
    conn: Mutex<Connection>,
}

fn db_err(e: rusqlite::Error) -> StepwiseError {
    StepwiseError::Database(e.to_string())
}

/// Fixed-width UTC timestamps, so that text comparison orders them.
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StepwiseError::Database(format!("bad timestamp '{}': {}", s, e)))
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS workflows (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        version INTEGER NOT NULL,
        completed INTEGER NOT NULL DEFAULT 0,
        canceled INTEGER NOT NULL DEFAULT 0,
        auto_execution_schedule TEXT,
        data TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_workflows_schedule
        ON workflows(auto_execution_schedule)
        WHERE completed = 0 AND canceled = 0;

    CREATE TABLE IF NOT EXISTS history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        workflow_id TEXT NOT NULL,
        sequence_key TEXT NOT NULL,
        position INTEGER NOT NULL,
        step_id TEXT NOT NULL,
        step_type TEXT NOT NULL,
        trigger TEXT NOT NULL,
        entered_at TEXT NOT NULL,
        exited_at TEXT NOT NULL,
        UNIQUE (workflow_id, sequence_key, position)
    );

    CREATE INDEX IF NOT EXISTS idx_history_type ON history(step_type);";

impl SqliteWorkflowStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StepwiseError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "Workflow store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StepwiseError::Database(e.to_string()))
    }

    /// Insert a new instance at version 1.
    pub fn create(&self, workflow: &Workflow) -> Result<i64> {
        let data = serde_json::to_string(workflow)?;
        let now = ts(Utc::now());
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute(
            "INSERT INTO workflows (id, name, version, completed, canceled, auto_execution_schedule, data, created_at, updated_at)
             VALUES (?1, ?2, 1, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                workflow.id.0,
                workflow.name,
                workflow.is_completed(),
                workflow.is_canceled(),
                workflow.auto_execution_schedule().map(ts),
                data,
                now,
            ],
        )
        .map_err(db_err)?;
        record_history(&tx, workflow)?;
        tx.commit().map_err(db_err)?;

        debug!(workflow_id = %workflow.id, "Workflow created");
        Ok(1)
    }

    pub fn load(&self, id: &WorkflowId) -> Result<Option<StoredWorkflow>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT data, version, updated_at FROM workflows WHERE id = ?1",
                params![id.0],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err)?;

        let Some((data, version, updated_at)) = row else {
            return Ok(None);
        };
        Ok(Some(StoredWorkflow {
            workflow: serde_json::from_str(&data)?,
            version,
            updated_at: parse_ts(&updated_at)?,
        }))
    }

    /// Persist `workflow` if the stored version is still `expected_version`.
    /// Returns the new version.
    pub fn save(&self, workflow: &Workflow, expected_version: i64) -> Result<i64> {
        let data = serde_json::to_string(workflow)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;

        let updated = tx
            .execute(
                "UPDATE workflows
                 SET version = version + 1, completed = ?3, canceled = ?4,
                     auto_execution_schedule = ?5, data = ?6, updated_at = ?7
                 WHERE id = ?1 AND version = ?2",
                params![
                    workflow.id.0,
                    expected_version,
                    workflow.is_completed(),
                    workflow.is_canceled(),
                    workflow.auto_execution_schedule().map(ts),
                    data,
                    ts(Utc::now()),
                ],
            )
            .map_err(db_err)?;

        if updated == 0 {
            let found: Option<i64> = tx
                .query_row(
                    "SELECT version FROM workflows WHERE id = ?1",
                    params![workflow.id.0],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;
            return Err(match found {
                Some(found) => StepwiseError::Conflict {
                    expected: expected_version,
                    found,
                },
                None => StepwiseError::Workflow(format!("unknown workflow {}", workflow.id)),
            });
        }

        record_history(&tx, workflow)?;
        tx.commit().map_err(db_err)?;

        debug!(workflow_id = %workflow.id, version = expected_version + 1, "Workflow saved");
        Ok(expected_version + 1)
    }

    /// Remove an instance and its history. Returns whether it existed.
    pub fn delete(&self, id: &WorkflowId) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute("DELETE FROM history WHERE workflow_id = ?1", params![id.0])
            .map_err(db_err)?;
        let deleted = tx
            .execute("DELETE FROM workflows WHERE id = ?1", params![id.0])
            .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(deleted > 0)
    }

    /// Unfinished instances whose execution schedule is at or before `now`.
    pub fn due(&self, now: DateTime<Utc>) -> Result<Vec<WorkflowId>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id FROM workflows
                 WHERE completed = 0 AND canceled = 0
                   AND auto_execution_schedule IS NOT NULL
                   AND auto_execution_schedule <= ?1
                 ORDER BY auto_execution_schedule, id",
            )
            .map_err(db_err)?;
        let ids = stmt
            .query_map(params![ts(now)], |row| row.get::<_, String>(0))
            .map_err(db_err)?
            .map(|r| r.map(WorkflowId).map_err(db_err))
            .collect::<Result<Vec<_>>>()?;
        Ok(ids)
    }

    pub fn list(&self) -> Result<Vec<WorkflowSummary>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, name, version, completed, canceled, auto_execution_schedule
                 FROM workflows ORDER BY created_at, id",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, bool>(3)?,
                    row.get::<_, bool>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;

        rows.into_iter()
            .map(|(id, name, version, completed, canceled, schedule)| {
                Ok(WorkflowSummary {
                    id: WorkflowId(id),
                    name,
                    version,
                    completed,
                    canceled,
                    auto_execution_schedule: schedule.as_deref().map(parse_ts).transpose()?,
                })
            })
            .collect()
    }

    /// Append one exited history item. Writing the same position twice is
    /// a no-op; open items are refused.
    pub fn append_history(
        &self,
        workflow_id: &WorkflowId,
        sequence_key: &str,
        position: usize,
        item: &HistoryItem,
    ) -> Result<bool> {
        let conn = self.lock()?;
        insert_history(&conn, workflow_id, sequence_key, position, item)
    }

    /// Logged history of one instance, in exit order.
    pub fn history(&self, workflow_id: &WorkflowId) -> Result<Vec<HistoryItem>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT step_id, step_type, trigger, entered_at, exited_at
                 FROM history WHERE workflow_id = ?1
                 ORDER BY exited_at, id",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![workflow_id.0], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;

        rows.into_iter()
            .map(|(step_id, step_type, trigger, entered_at, exited_at)| {
                let trigger: Trigger = serde_json::from_str(&trigger)?;
                Ok(HistoryItem {
                    step_id: step_id.into(),
                    step_type,
                    trigger,
                    entered_at: parse_ts(&entered_at)?,
                    exited_at: Some(parse_ts(&exited_at)?),
                })
            })
            .collect()
    }
}

fn insert_history(
    conn: &Connection,
    workflow_id: &WorkflowId,
    sequence_key: &str,
    position: usize,
    item: &HistoryItem,
) -> Result<bool> {
    let Some(exited_at) = item.exited_at else {
        return Err(StepwiseError::Workflow(format!(
            "history item for step '{}' is still open",
            item.step_id
        )));
    };
    let inserted = conn
        .execute(
            "INSERT OR IGNORE INTO history
                 (workflow_id, sequence_key, position, step_id, step_type, trigger, entered_at, exited_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                workflow_id.0,
                sequence_key,
                position as i64,
                item.step_id.0,
                item.step_type,
                serde_json::to_string(&item.trigger)?,
                ts(item.entered_at),
                ts(exited_at),
            ],
        )
        .map_err(db_err)?;
    Ok(inserted > 0)
}

/// Log every exited item of the instance that is not logged yet.
fn record_history(conn: &Connection, workflow: &Workflow) -> Result<()> {
    let mut appended = 0;
    for (key, position, item) in workflow.history_log() {
        if item.is_open() {
            continue;
        }
        if insert_history(conn, &workflow.id, &key, position, item)? {
            appended += 1;
        }
    }
    if appended > 0 {
        debug!(workflow_id = %workflow.id, appended, "History appended");
    }
    Ok(())
}

/// Averages over every logged traversal, across instances.
impl DurationStats for SqliteWorkflowStore {
    fn average_duration(&self, step_type: &str) -> Result<Option<Duration>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT entered_at, exited_at FROM history WHERE step_type = ?1")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![step_type], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;

        if rows.is_empty() {
            return Ok(None);
        }
        let mut total = Duration::zero();
        for (entered, exited) in &rows {
            total += parse_ts(exited)? - parse_ts(entered)?;
        }
        Ok(Some(total / rows.len() as i32))
    }
}
