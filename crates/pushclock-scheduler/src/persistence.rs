//! SQLite-backed Task Store, Execution Log Store and durable job table.
//! Survives restarts; every write commits immediately.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::de::DeserializeOwned;

use pushclock_core::error::{PushclockError, Result};
use pushclock_core::types::{
    AlertRule, AlertType, ExecutionLogEntry, ExecutionStatus, HookExecutionLogEntry, Task, TaskStatus,
};

use crate::jobs::JobRecord;

const TASK_COLUMNS: &str = "id, user_id, title, body, delivery, scheduled_time, is_recurring, cron_expression, \
     status, sent_time, error_msg, send_results, hooks_config, created_at, updated_at";

const EXECUTION_COLUMNS: &str = "id, task_id, job_id, execution_start, execution_end, duration_ms, status, \
     send_results, success_count, failure_count, worker_id, host, is_duplicate, duplicate_check_key, \
     error_message, error_trace";

const HOOK_COLUMNS: &str = "id, task_id, execution_log_id, hook_type, language, script_snapshot, started_at, \
     finished_at, duration_ms, status, output, error_message, return_data";

const ALERT_COLUMNS: &str = "id, user_id, task_id, name, rule_type, params, channel, channel_config, enabled, \
     cooldown_secs, last_triggered_at, trigger_count, created_at";

/// SQLite-backed persistence store for all scheduler data.
pub struct SchedulerDb {
    conn: Mutex<Connection>,
}

impl SchedulerDb {
    /// Open or create the scheduler database.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| PushclockError::Database(format!("DB open: {e}")))?;
        let db = Self { conn: Mutex::new(conn) };
        db.migrate()?;
        Ok(db)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| PushclockError::Database("connection lock poisoned".into()))
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 5000;

            -- Notification tasks
            CREATE TABLE IF NOT EXISTS notify_tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                title TEXT NOT NULL,
                body TEXT NOT NULL,
                delivery TEXT NOT NULL,          -- JSON: {mode: single|multi, ...}
                scheduled_time TEXT NOT NULL,
                is_recurring INTEGER NOT NULL DEFAULT 0,
                cron_expression TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                sent_time TEXT,
                error_msg TEXT,
                send_results TEXT,               -- JSON, multi-channel only
                hooks_config TEXT,               -- JSON keyed by hook type
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_notify_tasks_status ON notify_tasks(status);

            -- Live job registrations, one per task
            CREATE TABLE IF NOT EXISTS scheduler_jobs (
                id TEXT PRIMARY KEY,             -- task_{id} | recurring_task_{id}
                task_id INTEGER NOT NULL,
                trigger TEXT NOT NULL,           -- JSON: {type: date|cron, ...}
                next_run_time TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_scheduler_jobs_next ON scheduler_jobs(next_run_time);

            -- One row per firing attempt
            CREATE TABLE IF NOT EXISTS task_execution_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL,
                job_id TEXT NOT NULL,
                execution_start TEXT NOT NULL,
                execution_end TEXT,
                duration_ms INTEGER,
                status TEXT NOT NULL,            -- started|success|failed|skipped
                send_results TEXT,
                success_count INTEGER NOT NULL DEFAULT 0,
                failure_count INTEGER NOT NULL DEFAULT 0,
                worker_id TEXT NOT NULL,
                host TEXT NOT NULL,
                is_duplicate INTEGER NOT NULL DEFAULT 0,
                duplicate_check_key TEXT NOT NULL,
                error_message TEXT,
                error_trace TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_execution_logs_task ON task_execution_logs(task_id, execution_start);

            -- One row per hook invocation
            CREATE TABLE IF NOT EXISTS hook_execution_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL,
                execution_log_id INTEGER NOT NULL,
                hook_type TEXT NOT NULL,
                language TEXT NOT NULL,
                script_snapshot TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                duration_ms INTEGER,
                status TEXT NOT NULL,
                output TEXT,
                error_message TEXT,
                return_data TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_hook_logs_execution ON hook_execution_logs(execution_log_id);

            -- Alert rules
            CREATE TABLE IF NOT EXISTS alert_rules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                task_id INTEGER,
                name TEXT NOT NULL,
                rule_type TEXT NOT NULL,
                params TEXT NOT NULL,
                channel TEXT NOT NULL,
                channel_config TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                cooldown_secs INTEGER NOT NULL DEFAULT 0,
                last_triggered_at TEXT,
                trigger_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_alert_rules_owner ON alert_rules(user_id, rule_type);
            ",
        )
        .map_err(|e| PushclockError::Database(format!("Migration: {e}")))?;
        Ok(())
    }

    // ── Tasks ──────────────────────────────────────────────

    /// Insert a new task; returns its assigned id.
    pub fn insert_task(&self, task: &Task) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO notify_tasks (user_id, title, body, delivery, scheduled_time, is_recurring,
                cron_expression, status, sent_time, error_msg, send_results, hooks_config, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                task.user_id,
                task.title,
                task.body,
                serde_json::to_string(&task.delivery)?,
                ts(&task.scheduled_time),
                task.is_recurring,
                task.cron_expression,
                task.status.as_str(),
                task.sent_time.as_ref().map(ts),
                task.error_msg,
                to_json_opt(&task.send_results)?,
                to_json_opt(&task.hooks_config)?,
                ts(&task.created_at),
                ts(&task.updated_at),
            ],
        )
        .map_err(|e| PushclockError::Database(format!("Insert task: {e}")))?;
        Ok(conn.last_insert_rowid())
    }

    /// Overwrite a stored task; bumps `updated_at`.
    pub fn update_task(&self, task: &Task) -> Result<()> {
        let conn = self.conn()?;
        write_task(&conn, task)
    }

    /// Read, modify and write back a task under one connection lock, so no
    /// other write interleaves. Returns `None` when the task does not exist.
    pub fn modify_task<F>(&self, id: i64, f: F) -> Result<Option<Task>>
    where
        F: FnOnce(&mut Task) -> Result<()>,
    {
        let conn = self.conn()?;
        let Some(mut task) = read_task(&conn, id)? else {
            return Ok(None);
        };
        f(&mut task)?;
        write_task(&conn, &task)?;
        Ok(Some(task))
    }

    pub fn get_task(&self, id: i64) -> Result<Option<Task>> {
        let conn = self.conn()?;
        read_task(&conn, id)
    }

    /// Like `get_task`, but a missing row is an error.
    pub fn require_task(&self, id: i64) -> Result<Task> {
        self.get_task(id)?.ok_or(PushclockError::TaskNotFound(id))
    }

    pub fn tasks_with_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM notify_tasks WHERE status = ?1 ORDER BY scheduled_time"
            ))
            .map_err(|e| PushclockError::Database(format!("Prepare: {e}")))?;
        let rows = stmt
            .query_map(params![status.as_str()], row_to_task)
            .map_err(|e| PushclockError::Database(format!("Query tasks: {e}")))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| PushclockError::Database(format!("Read tasks: {e}")))
    }

    /// Physically delete a task. Its logs are kept for audit.
    pub fn delete_task(&self, id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn
            .execute("DELETE FROM notify_tasks WHERE id = ?1", params![id])
            .map_err(|e| PushclockError::Database(format!("Delete task: {e}")))?;
        Ok(changed > 0)
    }

    // ── Jobs ───────────────────────────────────────────────

    /// Register or replace a job.
    pub fn upsert_job(&self, job: &JobRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO scheduler_jobs (id, task_id, trigger, next_run_time, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                task_id = excluded.task_id,
                trigger = excluded.trigger,
                next_run_time = excluded.next_run_time",
            params![
                job.id,
                job.task_id,
                serde_json::to_string(&job.trigger)?,
                ts(&job.next_run_time),
                ts(&job.created_at),
            ],
        )
        .map_err(|e| PushclockError::Database(format!("Upsert job: {e}")))?;
        Ok(())
    }

    /// Returns whether a registration existed.
    pub fn remove_job(&self, id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn
            .execute("DELETE FROM scheduler_jobs WHERE id = ?1", params![id])
            .map_err(|e| PushclockError::Database(format!("Remove job: {e}")))?;
        Ok(changed > 0)
    }

    pub fn get_job(&self, id: &str) -> Result<Option<JobRecord>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, task_id, trigger, next_run_time, created_at FROM scheduler_jobs WHERE id = ?1",
            params![id],
            row_to_job,
        )
        .optional()
        .map_err(|e| PushclockError::Database(format!("Get job: {e}")))
    }

    pub fn list_jobs(&self) -> Result<Vec<JobRecord>> {
        self.query_jobs(
            "SELECT id, task_id, trigger, next_run_time, created_at FROM scheduler_jobs ORDER BY next_run_time",
            params![],
        )
    }

    /// Jobs whose fire time is at or before `now`, oldest first.
    pub fn due_jobs(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobRecord>> {
        self.query_jobs(
            "SELECT id, task_id, trigger, next_run_time, created_at FROM scheduler_jobs
             WHERE next_run_time <= ?1 ORDER BY next_run_time LIMIT ?2",
            params![ts(&now), limit as i64],
        )
    }

    /// Earliest registered fire time.
    pub fn next_due_time(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn()?;
        let raw: Option<String> = conn
            .query_row("SELECT MIN(next_run_time) FROM scheduler_jobs", [], |row| row.get(0))
            .map_err(|e| PushclockError::Database(format!("Next due: {e}")))?;
        raw.map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| PushclockError::Database(format!("Bad timestamp '{s}': {e}")))
        })
        .transpose()
    }

    /// Compare-and-set claim of a due job: advance it to `next`, or delete it
    /// when `next` is `None`. Fails (returns false) if the row changed since
    /// `job` was read, e.g. because it was unscheduled or re-registered.
    pub fn claim_job(&self, job: &JobRecord, next: Option<DateTime<Utc>>) -> Result<bool> {
        let conn = self.conn()?;
        let changed = match next {
            Some(next) => conn.execute(
                "UPDATE scheduler_jobs SET next_run_time = ?1 WHERE id = ?2 AND next_run_time = ?3",
                params![ts(&next), job.id, ts(&job.next_run_time)],
            ),
            None => conn.execute(
                "DELETE FROM scheduler_jobs WHERE id = ?1 AND next_run_time = ?2",
                params![job.id, ts(&job.next_run_time)],
            ),
        }
        .map_err(|e| PushclockError::Database(format!("Claim job: {e}")))?;
        Ok(changed == 1)
    }

    fn query_jobs(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<JobRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| PushclockError::Database(format!("Prepare: {e}")))?;
        let rows = stmt
            .query_map(args, row_to_job)
            .map_err(|e| PushclockError::Database(format!("Query jobs: {e}")))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| PushclockError::Database(format!("Read jobs: {e}")))
    }

    // ── Execution log ──────────────────────────────────────

    /// Append an execution entry; returns its id.
    pub fn insert_execution(&self, entry: &ExecutionLogEntry) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO task_execution_logs (task_id, job_id, execution_start, execution_end, duration_ms,
                status, send_results, success_count, failure_count, worker_id, host, is_duplicate,
                duplicate_check_key, error_message, error_trace)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                entry.task_id,
                entry.job_id,
                ts(&entry.execution_start),
                entry.execution_end.as_ref().map(ts),
                entry.duration_ms,
                entry.status.as_str(),
                to_json_opt(&entry.send_results)?,
                entry.success_count,
                entry.failure_count,
                entry.worker_id,
                entry.host,
                entry.is_duplicate,
                entry.duplicate_check_key,
                entry.error_message,
                entry.error_trace,
            ],
        )
        .map_err(|e| PushclockError::Database(format!("Insert execution: {e}")))?;
        Ok(conn.last_insert_rowid())
    }

    /// Fill in the outcome of a started entry.
    pub fn finish_execution(&self, entry: &ExecutionLogEntry) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE task_execution_logs SET execution_end = ?2, duration_ms = ?3, status = ?4,
                send_results = ?5, success_count = ?6, failure_count = ?7, error_message = ?8, error_trace = ?9
             WHERE id = ?1",
            params![
                entry.id,
                entry.execution_end.as_ref().map(ts),
                entry.duration_ms,
                entry.status.as_str(),
                to_json_opt(&entry.send_results)?,
                entry.success_count,
                entry.failure_count,
                entry.error_message,
                entry.error_trace,
            ],
        )
        .map_err(|e| PushclockError::Database(format!("Finish execution: {e}")))?;
        Ok(())
    }

    /// Entries with status `started` or `success` that began at or after `since`.
    pub fn count_active_since(&self, task_id: i64, since: DateTime<Utc>) -> Result<u32> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT COUNT(*) FROM task_execution_logs
             WHERE task_id = ?1 AND status IN ('started', 'success') AND execution_start >= ?2",
            params![task_id, ts(&since)],
            |row| row.get(0),
        )
        .map_err(|e| PushclockError::Database(format!("Duplicate check: {e}")))
    }

    /// All entries for a task that began at or after `since`, oldest first.
    pub fn executions_since(&self, task_id: i64, since: DateTime<Utc>) -> Result<Vec<ExecutionLogEntry>> {
        self.query_executions(
            &format!(
                "SELECT {EXECUTION_COLUMNS} FROM task_execution_logs
                 WHERE task_id = ?1 AND execution_start >= ?2 ORDER BY execution_start, id"
            ),
            params![task_id, ts(&since)],
        )
    }

    /// Most recent entries for a task, newest first.
    pub fn execution_history(&self, task_id: i64, limit: usize) -> Result<Vec<ExecutionLogEntry>> {
        self.query_executions(
            &format!(
                "SELECT {EXECUTION_COLUMNS} FROM task_execution_logs
                 WHERE task_id = ?1 ORDER BY execution_start DESC, id DESC LIMIT ?2"
            ),
            params![task_id, limit as i64],
        )
    }

    fn query_executions(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<ExecutionLogEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| PushclockError::Database(format!("Prepare: {e}")))?;
        let rows = stmt
            .query_map(args, row_to_execution)
            .map_err(|e| PushclockError::Database(format!("Query executions: {e}")))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| PushclockError::Database(format!("Read executions: {e}")))
    }

    // ── Hook log ───────────────────────────────────────────

    pub fn insert_hook_execution(&self, entry: &HookExecutionLogEntry) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO hook_execution_logs (task_id, execution_log_id, hook_type, language, script_snapshot,
                started_at, finished_at, duration_ms, status, output, error_message, return_data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                entry.task_id,
                entry.execution_log_id,
                entry.hook_type.as_str(),
                entry.language.as_str(),
                entry.script_snapshot,
                ts(&entry.started_at),
                entry.finished_at.as_ref().map(ts),
                entry.duration_ms,
                entry.status.as_str(),
                entry.output,
                entry.error_message,
                to_json_opt(&entry.return_data)?,
            ],
        )
        .map_err(|e| PushclockError::Database(format!("Insert hook execution: {e}")))?;
        Ok(conn.last_insert_rowid())
    }

    pub fn finish_hook_execution(&self, entry: &HookExecutionLogEntry) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE hook_execution_logs SET finished_at = ?2, duration_ms = ?3, status = ?4, output = ?5,
                error_message = ?6, return_data = ?7
             WHERE id = ?1",
            params![
                entry.id,
                entry.finished_at.as_ref().map(ts),
                entry.duration_ms,
                entry.status.as_str(),
                entry.output,
                entry.error_message,
                to_json_opt(&entry.return_data)?,
            ],
        )
        .map_err(|e| PushclockError::Database(format!("Finish hook execution: {e}")))?;
        Ok(())
    }

    pub fn hook_executions(&self, execution_log_id: i64) -> Result<Vec<HookExecutionLogEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {HOOK_COLUMNS} FROM hook_execution_logs WHERE execution_log_id = ?1 ORDER BY id"
            ))
            .map_err(|e| PushclockError::Database(format!("Prepare: {e}")))?;
        let rows = stmt
            .query_map(params![execution_log_id], row_to_hook_execution)
            .map_err(|e| PushclockError::Database(format!("Query hook executions: {e}")))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| PushclockError::Database(format!("Read hook executions: {e}")))
    }

    // ── Alert rules ────────────────────────────────────────

    pub fn insert_alert_rule(&self, rule: &AlertRule) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO alert_rules (user_id, task_id, name, rule_type, params, channel, channel_config,
                enabled, cooldown_secs, last_triggered_at, trigger_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                rule.user_id,
                rule.task_id,
                rule.name,
                rule.rule_type.as_str(),
                serde_json::to_string(&rule.params)?,
                rule.channel,
                serde_json::to_string(&rule.channel_config)?,
                rule.enabled,
                rule.cooldown_secs as i64,
                rule.last_triggered_at.as_ref().map(ts),
                rule.trigger_count,
                ts(&rule.created_at),
            ],
        )
        .map_err(|e| PushclockError::Database(format!("Insert alert rule: {e}")))?;
        Ok(conn.last_insert_rowid())
    }

    /// Enabled rules of `user_id` for `rule_type` that cover `task_id`.
    pub fn alert_rules_for(&self, user_id: i64, rule_type: AlertType, task_id: i64) -> Result<Vec<AlertRule>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {ALERT_COLUMNS} FROM alert_rules
                 WHERE user_id = ?1 AND rule_type = ?2 AND enabled = 1 AND (task_id IS NULL OR task_id = ?3)
                 ORDER BY id"
            ))
            .map_err(|e| PushclockError::Database(format!("Prepare: {e}")))?;
        let rows = stmt
            .query_map(params![user_id, rule_type.as_str(), task_id], row_to_alert_rule)
            .map_err(|e| PushclockError::Database(format!("Query alert rules: {e}")))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| PushclockError::Database(format!("Read alert rules: {e}")))
    }

    pub fn get_alert_rule(&self, id: i64) -> Result<Option<AlertRule>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {ALERT_COLUMNS} FROM alert_rules WHERE id = ?1"),
            params![id],
            row_to_alert_rule,
        )
        .optional()
        .map_err(|e| PushclockError::Database(format!("Get alert rule: {e}")))
    }

    pub fn record_alert_trigger(&self, rule_id: i64, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE alert_rules SET last_triggered_at = ?2, trigger_count = trigger_count + 1 WHERE id = ?1",
            params![rule_id, ts(&at)],
        )
        .map_err(|e| PushclockError::Database(format!("Record alert trigger: {e}")))?;
        Ok(())
    }
}

fn read_task(conn: &Connection, id: i64) -> Result<Option<Task>> {
    conn.query_row(
        &format!("SELECT {TASK_COLUMNS} FROM notify_tasks WHERE id = ?1"),
        params![id],
        row_to_task,
    )
    .optional()
    .map_err(|e| PushclockError::Database(format!("Get task: {e}")))
}

fn write_task(conn: &Connection, task: &Task) -> Result<()> {
    let changed = conn
        .execute(
            "UPDATE notify_tasks SET user_id = ?2, title = ?3, body = ?4, delivery = ?5, scheduled_time = ?6,
                is_recurring = ?7, cron_expression = ?8, status = ?9, sent_time = ?10, error_msg = ?11,
                send_results = ?12, hooks_config = ?13, updated_at = ?14
             WHERE id = ?1",
            params![
                task.id,
                task.user_id,
                task.title,
                task.body,
                serde_json::to_string(&task.delivery)?,
                ts(&task.scheduled_time),
                task.is_recurring,
                task.cron_expression,
                task.status.as_str(),
                task.sent_time.as_ref().map(ts),
                task.error_msg,
                to_json_opt(&task.send_results)?,
                to_json_opt(&task.hooks_config)?,
                ts(&Utc::now()),
            ],
        )
        .map_err(|e| PushclockError::Database(format!("Update task: {e}")))?;
    if changed == 0 {
        return Err(PushclockError::TaskNotFound(task.id));
    }
    Ok(())
}

// ── Row mapping ───────────────────────────────────────────

/// Fixed-width UTC text so lexical order matches time order.
fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn to_json_opt<T: serde::Serialize>(value: &Option<T>) -> Result<Option<String>> {
    value.as_ref().map(serde_json::to_string).transpose().map_err(Into::into)
}

fn conversion_err(idx: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| conversion_err(idx, e))
    })
    .transpose()
}

fn json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_err(idx, e))
}

fn opt_json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| serde_json::from_str(&s).map_err(|e| conversion_err(idx, e)))
        .transpose()
}

fn enum_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = PushclockError>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_err(idx, e))
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        body: row.get(3)?,
        delivery: json_col(row, 4)?,
        scheduled_time: ts_col(row, 5)?,
        is_recurring: row.get(6)?,
        cron_expression: row.get(7)?,
        status: enum_col(row, 8)?,
        sent_time: opt_ts_col(row, 9)?,
        error_msg: row.get(10)?,
        send_results: opt_json_col(row, 11)?,
        hooks_config: opt_json_col(row, 12)?,
        created_at: ts_col(row, 13)?,
        updated_at: ts_col(row, 14)?,
    })
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<JobRecord> {
    Ok(JobRecord {
        id: row.get(0)?,
        task_id: row.get(1)?,
        trigger: json_col(row, 2)?,
        next_run_time: ts_col(row, 3)?,
        created_at: ts_col(row, 4)?,
    })
}

fn row_to_execution(row: &Row<'_>) -> rusqlite::Result<ExecutionLogEntry> {
    let status: ExecutionStatus = enum_col(row, 6)?;
    Ok(ExecutionLogEntry {
        id: row.get(0)?,
        task_id: row.get(1)?,
        job_id: row.get(2)?,
        execution_start: ts_col(row, 3)?,
        execution_end: opt_ts_col(row, 4)?,
        duration_ms: row.get(5)?,
        status,
        send_results: opt_json_col(row, 7)?,
        success_count: row.get(8)?,
        failure_count: row.get(9)?,
        worker_id: row.get(10)?,
        host: row.get(11)?,
        is_duplicate: row.get(12)?,
        duplicate_check_key: row.get(13)?,
        error_message: row.get(14)?,
        error_trace: row.get(15)?,
    })
}

fn row_to_hook_execution(row: &Row<'_>) -> rusqlite::Result<HookExecutionLogEntry> {
    Ok(HookExecutionLogEntry {
        id: row.get(0)?,
        task_id: row.get(1)?,
        execution_log_id: row.get(2)?,
        hook_type: enum_col(row, 3)?,
        language: enum_col(row, 4)?,
        script_snapshot: row.get(5)?,
        started_at: ts_col(row, 6)?,
        finished_at: opt_ts_col(row, 7)?,
        duration_ms: row.get(8)?,
        status: enum_col(row, 9)?,
        output: row.get(10)?,
        error_message: row.get(11)?,
        return_data: opt_json_col(row, 12)?,
    })
}

fn row_to_alert_rule(row: &Row<'_>) -> rusqlite::Result<AlertRule> {
    let cooldown: i64 = row.get(9)?;
    Ok(AlertRule {
        id: row.get(0)?,
        user_id: row.get(1)?,
        task_id: row.get(2)?,
        name: row.get(3)?,
        rule_type: enum_col(row, 4)?,
        params: json_col(row, 5)?,
        channel: row.get(6)?,
        channel_config: json_col(row, 7)?,
        enabled: row.get(8)?,
        cooldown_secs: cooldown.max(0) as u64,
        last_triggered_at: opt_ts_col(row, 10)?,
        trigger_count: row.get(11)?,
        created_at: ts_col(row, 12)?,
    })
}
