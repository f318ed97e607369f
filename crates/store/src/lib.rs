//! Durable store for jobs, transcript segments, and settings.
//!
//! One writer connection serialized behind a mutex, a small pool of reader
//! connections served round-robin. Every connection runs in WAL journal
//! mode so readers never block behind the writer. All operations hop onto
//! the blocking pool; writes issued from a single caller are observed in
//! issue order.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use uuid::Uuid;

use scribe_events::{JobStatus, SegmentPayload};

const READER_POOL_SIZE: usize = 4;

/// Error recorded on jobs recovered after an unclean shutdown.
pub const STALE_JOB_ERROR: &str = "Server restarted while job was in progress";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("store task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// One persisted transcription job.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub job_id: String,
    pub status: JobStatus,
    pub audio_path: String,
    pub model: String,
    pub language: String,
    pub translate: bool,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_duration_seconds: Option<f64>,
    pub created_at: String,
    pub updated_at: String,
}

/// Fields required to create a job row.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_id: String,
    pub audio_path: String,
    pub model: String,
    pub language: String,
    pub translate: bool,
}

/// One stored segment, including any user edit overlay.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredSegment {
    pub idx: i64,
    pub start: f64,
    pub end: f64,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edited_text: Option<String>,
}

/// One user edit to apply to a segment; an empty string clears the edit.
#[derive(Debug, Clone)]
pub struct SegmentEdit {
    pub idx: i64,
    pub edited_text: String,
}

struct StoreInner {
    writer: Mutex<Connection>,
    readers: Vec<Mutex<Connection>>,
    next_reader: AtomicUsize,
}

#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Open (creating if needed) the store at `path`.
    ///
    /// Schema creation is idempotent; pre-existing databases are migrated
    /// in place. This is the only store failure that is fatal to callers
    /// at startup.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Store> {
        let path = path.into();
        tokio::task::spawn_blocking(move || Store::open_blocking(&path))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }

    fn open_blocking(path: &Path) -> Result<Store> {
        let writer = open_connection(path)?;
        init_schema(&writer)?;
        migrate(&writer)?;

        let mut readers = Vec::with_capacity(READER_POOL_SIZE);
        for _ in 0..READER_POOL_SIZE {
            readers.push(Mutex::new(open_connection(path)?));
        }

        tracing::info!(path = %path.display(), "store opened");
        Ok(Store {
            inner: Arc::new(StoreInner {
                writer: Mutex::new(writer),
                readers,
                next_reader: AtomicUsize::new(0),
            }),
        })
    }

    /// Generate a fresh job identifier.
    pub fn new_job_id() -> String {
        Uuid::new_v4().to_string()
    }

    async fn write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut conn = inner.writer.lock().expect("store writer mutex poisoned");
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    async fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let idx = inner.next_reader.fetch_add(1, Ordering::Relaxed) % inner.readers.len();
            let conn = inner.readers[idx]
                .lock()
                .expect("store reader mutex poisoned");
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    /// Insert a job in QUEUED state with zero progress.
    ///
    /// Returns `false` instead of an error when the insert is rejected
    /// (e.g. duplicate id), so submission can report failure without
    /// treating it as an infrastructure fault.
    pub async fn create_job(&self, new: NewJob) -> Result<bool> {
        self.write(move |conn| {
            let now = now_utc();
            let result = conn.execute(
                "INSERT INTO jobs (job_id, status, audio_path, model, language, translate,
                                   progress, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0.0, ?7, ?7)",
                params![
                    new.job_id,
                    JobStatus::Queued.code(),
                    new.audio_path,
                    new.model,
                    new.language,
                    new.translate as i64,
                    now,
                ],
            );
            match result {
                Ok(_) => Ok(true),
                Err(e) => {
                    tracing::warn!(job_id = %new.job_id, error = %e, "failed to create job");
                    Ok(false)
                }
            }
        })
        .await
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        let job_id = job_id.to_string();
        self.read(move |conn| {
            let job = conn
                .query_row(
                    "SELECT job_id, status, audio_path, model, language, translate, progress,
                            error, audio_duration_seconds, created_at, updated_at
                     FROM jobs WHERE job_id = ?1",
                    [&job_id],
                    job_from_row,
                )
                .optional()?;
            Ok(job)
        })
        .await
    }

    /// Recent jobs, most recent first.
    pub async fn list_jobs(&self, limit: usize) -> Result<Vec<Job>> {
        self.read(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT job_id, status, audio_path, model, language, translate, progress,
                        error, audio_duration_seconds, created_at, updated_at
                 FROM jobs ORDER BY created_at DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map([limit as i64], job_from_row)?;
            let mut jobs = Vec::new();
            for row in rows {
                jobs.push(row?);
            }
            Ok(jobs)
        })
        .await
    }

    /// Advance a job's status; `error` is recorded only when provided.
    pub async fn update_job_status(
        &self,
        job_id: &str,
        status: JobStatus,
        error: Option<String>,
    ) -> Result<()> {
        let job_id = job_id.to_string();
        self.write(move |conn| {
            let now = now_utc();
            match error {
                Some(error) => conn.execute(
                    "UPDATE jobs SET status = ?1, error = ?2, updated_at = ?3 WHERE job_id = ?4",
                    params![status.code(), error, now, job_id],
                )?,
                None => conn.execute(
                    "UPDATE jobs SET status = ?1, updated_at = ?2 WHERE job_id = ?3",
                    params![status.code(), now, job_id],
                )?,
            };
            Ok(())
        })
        .await
    }

    /// Record progress. Monotonicity is the caller's responsibility.
    pub async fn update_job_progress(&self, job_id: &str, progress: f64) -> Result<()> {
        let job_id = job_id.to_string();
        self.write(move |conn| {
            conn.execute(
                "UPDATE jobs SET progress = ?1, updated_at = ?2 WHERE job_id = ?3",
                params![progress, now_utc(), job_id],
            )?;
            Ok(())
        })
        .await
    }

    /// Cache the probed audio duration on the job row.
    pub async fn update_job_duration(&self, job_id: &str, seconds: f64) -> Result<()> {
        let job_id = job_id.to_string();
        self.write(move |conn| {
            conn.execute(
                "UPDATE jobs SET audio_duration_seconds = ?1, updated_at = ?2 WHERE job_id = ?3",
                params![seconds, now_utc(), job_id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn cancel_job(&self, job_id: &str) -> Result<()> {
        self.update_job_status(job_id, JobStatus::Canceled, None).await
    }

    pub async fn delete_job(&self, job_id: &str) -> Result<bool> {
        let job_id = job_id.to_string();
        self.write(move |conn| {
            let affected = conn.execute("DELETE FROM jobs WHERE job_id = ?1", [&job_id])?;
            Ok(affected > 0)
        })
        .await
    }

    /// Recover from an unclean shutdown: every job still QUEUED or RUNNING
    /// is marked FAILED with a fixed error. Returns the number of rows
    /// updated. Segment rows are left untouched.
    pub async fn fail_stale_jobs(&self) -> Result<usize> {
        self.write(move |conn| {
            let affected = conn.execute(
                "UPDATE jobs SET status = ?1, error = ?2, updated_at = ?3
                 WHERE status IN (?4, ?5)",
                params![
                    JobStatus::Failed.code(),
                    STALE_JOB_ERROR,
                    now_utc(),
                    JobStatus::Queued.code(),
                    JobStatus::Running.code(),
                ],
            )?;
            Ok(affected)
        })
        .await
    }

    // ------------------------------------------------------------------
    // Segments
    // ------------------------------------------------------------------

    /// Insert a batch of segments in one transaction.
    ///
    /// Callers guarantee `idx` uniqueness; a conflicting batch is rolled
    /// back as a whole.
    pub async fn insert_segments_batch(
        &self,
        job_id: &str,
        segments: Vec<SegmentPayload>,
    ) -> Result<()> {
        if segments.is_empty() {
            return Ok(());
        }
        let job_id = job_id.to_string();
        self.write(move |conn| {
            let now = now_utc();
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO transcript_segments (job_id, idx, \"start\", \"end\", text, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                for seg in &segments {
                    stmt.execute(params![job_id, seg.idx, seg.start, seg.end, seg.text, now])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Segments with `idx > after_idx`, ascending. Pass `-1` for all.
    pub async fn get_segments(&self, job_id: &str, after_idx: i64) -> Result<Vec<StoredSegment>> {
        let job_id = job_id.to_string();
        self.read(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT idx, \"start\", \"end\", text, edited_text
                 FROM transcript_segments
                 WHERE job_id = ?1 AND idx > ?2
                 ORDER BY idx",
            )?;
            let rows = stmt.query_map(params![job_id, after_idx], |row| {
                Ok(StoredSegment {
                    idx: row.get(0)?,
                    start: row.get(1)?,
                    end: row.get(2)?,
                    text: row.get(3)?,
                    edited_text: row.get(4)?,
                })
            })?;
            let mut segments = Vec::new();
            for row in rows {
                segments.push(row?);
            }
            Ok(segments)
        })
        .await
    }

    /// Apply user edits in one transaction. An empty `edited_text` clears
    /// the override back to NULL.
    pub async fn save_segment_edits(&self, job_id: &str, edits: Vec<SegmentEdit>) -> Result<()> {
        if edits.is_empty() {
            return Ok(());
        }
        let job_id = job_id.to_string();
        self.write(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "UPDATE transcript_segments SET edited_text = ?1
                     WHERE job_id = ?2 AND idx = ?3",
                )?;
                for edit in &edits {
                    let value = (!edit.edited_text.is_empty()).then_some(&edit.edited_text);
                    stmt.execute(params![value, job_id, edit.idx])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.read(move |conn| {
            let value = conn
                .query_row("SELECT value FROM settings WHERE key = ?1", [&key], |row| {
                    row.get(0)
                })
                .optional()?;
            Ok(value)
        })
        .await
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let key = key.to_string();
        let value = value.to_string();
        self.write(move |conn| {
            conn.execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_all_settings(&self) -> Result<HashMap<String, String>> {
        self.read(move |conn| {
            let mut stmt = conn.prepare("SELECT key, value FROM settings")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            let mut settings = HashMap::new();
            for row in rows {
                let (key, value): (String, String) = row?;
                settings.insert(key, value);
            }
            Ok(settings)
        })
        .await
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    // journal_mode returns the resulting mode as a row.
    conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(conn)
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            job_id TEXT PRIMARY KEY,
            status INTEGER NOT NULL,
            audio_path TEXT NOT NULL,
            model TEXT NOT NULL,
            language TEXT NOT NULL DEFAULT 'auto',
            translate INTEGER NOT NULL DEFAULT 0,
            progress REAL NOT NULL DEFAULT 0.0,
            error TEXT,
            audio_duration_seconds REAL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS transcript_segments (
            job_id TEXT NOT NULL REFERENCES jobs(job_id) ON DELETE CASCADE,
            idx INTEGER NOT NULL,
            "start" REAL NOT NULL,
            "end" REAL NOT NULL,
            text TEXT NOT NULL,
            edited_text TEXT,
            created_at TEXT NOT NULL,
            PRIMARY KEY (job_id, idx)
        );

        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at);
        CREATE INDEX IF NOT EXISTS idx_segments_job ON transcript_segments(job_id);
        "#,
    )?;
    Ok(())
}

/// Add columns introduced after the first released schema.
fn migrate(conn: &Connection) -> Result<()> {
    let mut stmt = conn.prepare("PRAGMA table_info(transcript_segments)")?;
    let columns: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<_>>()?;
    if !columns.iter().any(|c| c == "edited_text") {
        conn.execute(
            "ALTER TABLE transcript_segments ADD COLUMN edited_text TEXT",
            [],
        )?;
        tracing::info!("migrated: added edited_text column");
    }
    Ok(())
}

fn job_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    let code: i64 = row.get(1)?;
    let status = JobStatus::from_code(code).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Integer,
            format!("invalid job status code {code}").into(),
        )
    })?;
    let translate: i64 = row.get(5)?;
    Ok(Job {
        job_id: row.get(0)?,
        status,
        audio_path: row.get(2)?,
        model: row.get(3)?,
        language: row.get(4)?,
        translate: translate != 0,
        progress: row.get(6)?,
        error: row.get(7)?,
        audio_duration_seconds: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn now_utc() -> String {
    Utc::now().to_rfc3339()
}
