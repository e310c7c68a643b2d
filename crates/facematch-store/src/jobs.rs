//! SQLite job queue.
//!
//! Status only ever moves `queued → running → succeeded | failed`. Every
//! transition is a conditional `UPDATE` on the expected current status (and,
//! once running, on the claiming worker), so two workers can never own the
//! same job and terminal jobs never change again.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

/// Error message recorded on queued jobs nobody claimed in time.
pub const EXPIRED_MESSAGE: &str = "expired before a worker claimed it";
pub const ABANDONED_MESSAGE: &str = "abandoned: worker lease expired before completion";

#[derive(Error, Debug)]
pub enum JobQueueError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("job {0} not found")]
    NotFound(String),
    #[error("job {id} is {status} and cannot make this transition")]
    NotClaimable { id: String, status: JobStatus },
    #[error("job payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("job store directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt job row: {0}")]
    Corrupt(String),
    #[error("job queue lock poisoned")]
    Poisoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = JobQueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            other => Err(JobQueueError::Corrupt(format!("unknown status {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Register,
    Search,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Register => "register",
            JobKind::Search => "search",
        }
    }
}

impl FromStr for JobKind {
    type Err = JobQueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "register" => Ok(JobKind::Register),
            "search" => Ok(JobKind::Search),
            other => Err(JobQueueError::Corrupt(format!("unknown kind {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub id: String,
    pub kind: JobKind,
    pub queue: String,
    pub status: JobStatus,
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub worker: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Outcome of one retention sweep.
#[derive(Debug, Default)]
pub struct PurgeReport {
    /// Queued jobs failed because nobody claimed them before their deadline.
    pub expired: Vec<JobRecord>,
    /// Running jobs failed because their worker's lease ran out.
    pub abandoned: Vec<JobRecord>,
    /// Terminal jobs deleted after their retention window.
    pub purged: usize,
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS jobs (
        id              TEXT PRIMARY KEY,
        queue           TEXT NOT NULL,
        kind            TEXT NOT NULL,
        status          TEXT NOT NULL,
        payload         TEXT NOT NULL,
        result          TEXT,
        error           TEXT,
        worker          TEXT,
        enqueued_at_ms  INTEGER NOT NULL,
        deadline_ms     INTEGER NOT NULL,
        lease_until_ms  INTEGER,
        started_at_ms   INTEGER,
        ended_at_ms     INTEGER
    );
    CREATE INDEX IF NOT EXISTS idx_jobs_queue_status ON jobs(queue, status, enqueued_at_ms);
";

const JOB_COLUMNS: &str =
    "id, queue, kind, status, payload, result, error, worker, enqueued_at_ms, started_at_ms, ended_at_ms";

pub struct SqliteJobQueue {
    conn: Mutex<Connection>,
}

impl SqliteJobQueue {
    pub fn open(path: &Path) -> Result<Self, JobQueueError> {
        crate::ensure_parent_dir(path)?;
        let conn = Connection::open(path)?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        tracing::info!(path = %path.display(), "job queue opened");
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self, JobQueueError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, JobQueueError> {
        self.conn.lock().map_err(|_| JobQueueError::Poisoned)
    }

    /// Enqueue a job; it must be claimed within `ttl` or the sweep fails it.
    pub fn submit(&self, queue: &str, kind: JobKind, payload: &Value, ttl: Duration) -> Result<JobRecord, JobQueueError> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let deadline = offset(now, ttl);

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO jobs (id, queue, kind, status, payload, enqueued_at_ms, deadline_ms)
             VALUES (?1, ?2, ?3, 'queued', ?4, ?5, ?6)",
            params![
                id,
                queue,
                kind.as_str(),
                serde_json::to_string(payload)?,
                now.timestamp_millis(),
                deadline.timestamp_millis(),
            ],
        )?;
        tracing::debug!(job_id = %id, queue, kind = kind.as_str(), "job submitted");
        fetch(&conn, &id)?.ok_or(JobQueueError::NotFound(id))
    }

    /// Atomically claim the oldest unexpired queued job of `queue`.
    ///
    /// The claim holds for `lease`; a job still running after that is failed
    /// by the sweep and can no longer be finished by its worker.
    pub fn claim_next(&self, queue: &str, worker: &str, lease: Duration) -> Result<Option<JobRecord>, JobQueueError> {
        let now = Utc::now();
        let now_ms = now.timestamp_millis();
        let lease_until_ms = offset(now, lease).timestamp_millis();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let candidate: Option<String> = tx
            .query_row(
                "SELECT id FROM jobs
                 WHERE queue = ?1 AND status = 'queued' AND deadline_ms > ?2
                 ORDER BY enqueued_at_ms, rowid
                 LIMIT 1",
                params![queue, now_ms],
                |row| row.get(0),
            )
            .optional()?;
        let Some(id) = candidate else {
            return Ok(None);
        };

        let changed = tx.execute(
            "UPDATE jobs SET status = 'running', worker = ?2, started_at_ms = ?3, lease_until_ms = ?4
             WHERE id = ?1 AND status = 'queued'",
            params![id, worker, now_ms, lease_until_ms],
        )?;
        if changed != 1 {
            return Ok(None);
        }
        let job = fetch(&tx, &id)?;
        tx.commit()?;
        Ok(job)
    }

    pub fn complete(&self, id: &str, worker: &str, result: &Value) -> Result<JobRecord, JobQueueError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE jobs SET status = 'succeeded', result = ?3, ended_at_ms = ?4
             WHERE id = ?1 AND status = 'running' AND worker = ?2",
            params![id, worker, serde_json::to_string(result)?, Utc::now().timestamp_millis()],
        )?;
        finish_transition(&conn, id, changed)
    }

    pub fn fail(&self, id: &str, worker: &str, error: &str) -> Result<JobRecord, JobQueueError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE jobs SET status = 'failed', error = ?3, ended_at_ms = ?4
             WHERE id = ?1 AND status = 'running' AND worker = ?2",
            params![id, worker, error, Utc::now().timestamp_millis()],
        )?;
        finish_transition(&conn, id, changed)
    }

    /// Pure read; unknown and purged ids are `NotFound`.
    pub fn get(&self, id: &str) -> Result<JobRecord, JobQueueError> {
        let conn = self.conn()?;
        fetch(&conn, id)?.ok_or_else(|| JobQueueError::NotFound(id.to_string()))
    }

    /// Fail queued jobs past their deadline and running jobs past their
    /// lease, then delete terminal jobs that ended more than `result_ttl`
    /// before `now`.
    pub fn purge_expired(&self, now: DateTime<Utc>, result_ttl: Duration) -> Result<PurgeReport, JobQueueError> {
        let now_ms = now.timestamp_millis();
        let cutoff_ms = ChronoDuration::from_std(result_ttl)
            .ok()
            .and_then(|ttl| now.checked_sub_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
            .timestamp_millis();

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let expired = fail_overdue(&tx, JobStatus::Queued, "deadline_ms", EXPIRED_MESSAGE, now_ms)?;
        let abandoned = fail_overdue(&tx, JobStatus::Running, "lease_until_ms", ABANDONED_MESSAGE, now_ms)?;

        let purged = tx.execute(
            "DELETE FROM jobs WHERE status IN ('succeeded', 'failed') AND ended_at_ms <= ?1",
            params![cutoff_ms],
        )?;
        tx.commit()?;

        if !expired.is_empty() || !abandoned.is_empty() || purged > 0 {
            tracing::info!(
                expired = expired.len(),
                abandoned = abandoned.len(),
                purged,
                "job retention sweep"
            );
        }
        Ok(PurgeReport {
            expired,
            abandoned,
            purged,
        })
    }

    /// Number of queued jobs waiting in `queue`.
    pub fn depth(&self, queue: &str) -> Result<u64, JobQueueError> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE queue = ?1 AND status = 'queued'",
            params![queue],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }
}

/// `now + span`, saturating at the far future.
fn offset(now: DateTime<Utc>, span: Duration) -> DateTime<Utc> {
    ChronoDuration::from_std(span)
        .ok()
        .and_then(|span| now.checked_add_signed(span))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Fail every `status` job whose `column` deadline is at or before `now_ms`.
fn fail_overdue(
    tx: &Connection,
    status: JobStatus,
    column: &str,
    message: &str,
    now_ms: i64,
) -> Result<Vec<JobRecord>, JobQueueError> {
    let ids: Vec<String> = {
        let mut stmt = tx.prepare(&format!("SELECT id FROM jobs WHERE status = ?1 AND {column} <= ?2"))?;
        let rows = stmt.query_map(params![status.as_str(), now_ms], |row| row.get(0))?;
        rows.collect::<Result<_, _>>()?
    };

    let mut failed = Vec::with_capacity(ids.len());
    for id in &ids {
        let changed = tx.execute(
            "UPDATE jobs SET status = 'failed', error = ?3, ended_at_ms = ?4
             WHERE id = ?1 AND status = ?2",
            params![id, status.as_str(), message, now_ms],
        )?;
        if changed == 1 {
            if let Some(job) = fetch(tx, id)? {
                failed.push(job);
            }
        }
    }
    Ok(failed)
}

/// Resolve a conditional terminal update: the updated row, or why it did not apply.
fn finish_transition(conn: &Connection, id: &str, changed: usize) -> Result<JobRecord, JobQueueError> {
    let job = fetch(conn, id)?.ok_or_else(|| JobQueueError::NotFound(id.to_string()))?;
    if changed != 1 {
        return Err(JobQueueError::NotClaimable {
            id: id.to_string(),
            status: job.status,
        });
    }
    Ok(job)
}

fn fetch(conn: &Connection, id: &str) -> Result<Option<JobRecord>, JobQueueError> {
    let raw = conn
        .query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
            params![id],
            read_raw_job,
        )
        .optional()?;
    raw.map(RawJob::into_record).transpose()
}

/// Column values as stored, decoded into a `JobRecord` outside the row callback.
struct RawJob {
    id: String,
    queue: String,
    kind: String,
    status: String,
    payload: String,
    result: Option<String>,
    error: Option<String>,
    worker: Option<String>,
    enqueued_at_ms: i64,
    started_at_ms: Option<i64>,
    ended_at_ms: Option<i64>,
}

fn read_raw_job(row: &Row<'_>) -> rusqlite::Result<RawJob> {
    Ok(RawJob {
        id: row.get(0)?,
        queue: row.get(1)?,
        kind: row.get(2)?,
        status: row.get(3)?,
        payload: row.get(4)?,
        result: row.get(5)?,
        error: row.get(6)?,
        worker: row.get(7)?,
        enqueued_at_ms: row.get(8)?,
        started_at_ms: row.get(9)?,
        ended_at_ms: row.get(10)?,
    })
}

impl RawJob {
    fn into_record(self) -> Result<JobRecord, JobQueueError> {
        Ok(JobRecord {
            kind: self.kind.parse()?,
            status: self.status.parse()?,
            payload: serde_json::from_str(&self.payload)?,
            result: self.result.as_deref().map(serde_json::from_str).transpose()?,
            error: self.error,
            worker: self.worker,
            enqueued_at: from_millis(self.enqueued_at_ms),
            started_at: self.started_at_ms.map(from_millis),
            ended_at: self.ended_at_ms.map(from_millis),
            id: self.id,
            queue: self.queue,
        })
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
