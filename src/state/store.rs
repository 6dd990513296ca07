//! SQLite-backed state store.
//!
//! Four tables: `files`, `partial_downloads`, `volumes`, `products`.
//! Ownership is by worker: the Fetcher writes files and partials, the
//! Assembler and Converter advance volumes, the Renderer advances products.
//! Claim operations are conditional `UPDATE`s whose row count decides the
//! winner, so two workers racing for the same item cannot both succeed.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::error::{truncate_message, FailureKind, PipelineError, PipelineResult};

/// Upper bound for row-level error messages.
const MAX_ERROR_MESSAGE: usize = 500;

/// Processing state machine shared by volume and product rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> PipelineResult<Self> {
        match s {
            "pending" => Ok(ProcessingStatus::Pending),
            "processing" => Ok(ProcessingStatus::Processing),
            "completed" => Ok(ProcessingStatus::Completed),
            "failed" => Ok(ProcessingStatus::Failed),
            other => Err(PipelineError::CorruptRow(format!(
                "unknown status '{other}'"
            ))),
        }
    }

    /// Terminal states are never advanced by workers, only by operator
    /// resets.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessingStatus::Completed | ProcessingStatus::Failed)
    }
}

/// One remote artifact and its verified local materialization.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub filename: String,
    pub remote_path: String,
    pub local_path: PathBuf,
    pub size: u64,
    pub digest: Option<String>,
    pub radar: String,
    pub field: String,
    pub vol_code: String,
    pub vol_num: String,
    pub observation_instant: DateTime<Utc>,
}

/// Transient retry state for an in-flight fetch.
#[derive(Debug, Clone)]
pub struct PartialDownload {
    pub filename: String,
    pub remote_path: String,
    pub local_path: PathBuf,
    pub bytes_downloaded: u64,
    pub total_bytes: Option<u64>,
    pub attempt_count: u32,
    pub last_attempt: DateTime<Utc>,
}

/// Logical grouping of files constituting one scan volume.
#[derive(Debug, Clone)]
pub struct VolumeRow {
    pub volume_id: String,
    pub radar: String,
    pub vol_code: String,
    pub vol_num: String,
    pub observation_instant: DateTime<Utc>,
    pub expected_fields: Vec<String>,
    pub downloaded_fields: Vec<String>,
    pub is_complete: bool,
    pub status: ProcessingStatus,
    pub output_path: Option<PathBuf>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One generated visualization artifact for one volume.
#[derive(Debug, Clone)]
pub struct ProductRow {
    pub volume_id: String,
    pub product_type: String,
    pub status: ProcessingStatus,
    pub generated_at: Option<DateTime<Utc>>,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Snapshot of catalogue counts for the supervisor's statistics view.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub files_completed: u64,
    pub partial_downloads: u64,
    pub volumes_pending: u64,
    pub volumes_processing: u64,
    pub volumes_completed: u64,
    pub volumes_failed: u64,
    pub products_pending: u64,
    pub products_processing: u64,
    pub products_completed: u64,
    pub products_failed: u64,
}

/// Persistent catalogue of files, volumes, and generated products.
pub struct StateStore {
    conn: Mutex<Connection>,
}

fn to_iso(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_iso(s: &str) -> PipelineResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| PipelineError::CorruptRow(format!("bad timestamp '{s}': {e}")))
}

fn join_fields(fields: &[String]) -> String {
    fields.join(",")
}

fn split_fields(s: &str) -> Vec<String> {
    if s.is_empty() {
        Vec::new()
    } else {
        s.split(',').map(|f| f.to_string()).collect()
    }
}

impl StateStore {
    /// Open (or create) the catalogue at `path` and initialize the schema.
    pub fn open(path: &Path) -> PipelineResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        info!(path = %path.display(), "State store opened");
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn in_memory() -> PipelineResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> PipelineResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| PipelineError::StoreLockPoisoned)
    }

    fn init_schema(&self) -> PipelineResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS files (
                filename            TEXT PRIMARY KEY,
                remote_path         TEXT NOT NULL,
                local_path          TEXT NOT NULL,
                size                INTEGER NOT NULL,
                digest              TEXT,
                radar               TEXT NOT NULL,
                field               TEXT NOT NULL,
                vol_code            TEXT NOT NULL,
                vol_num             TEXT NOT NULL,
                observation_instant TEXT NOT NULL,
                status              TEXT NOT NULL DEFAULT 'completed',
                downloaded_at       TEXT NOT NULL,
                created_at          TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_files_radar_instant
                ON files(radar, observation_instant);
            CREATE INDEX IF NOT EXISTS idx_files_status ON files(status);

            CREATE TABLE IF NOT EXISTS partial_downloads (
                filename         TEXT PRIMARY KEY,
                remote_path      TEXT NOT NULL,
                local_path       TEXT NOT NULL,
                bytes_downloaded INTEGER NOT NULL DEFAULT 0,
                total_bytes      INTEGER,
                partial_digest   TEXT,
                attempt_count    INTEGER NOT NULL DEFAULT 0,
                last_attempt     TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS volumes (
                volume_id           TEXT PRIMARY KEY,
                radar               TEXT NOT NULL,
                vol_code            TEXT NOT NULL,
                vol_num             TEXT NOT NULL,
                observation_instant TEXT NOT NULL,
                expected_fields     TEXT NOT NULL,
                downloaded_fields   TEXT NOT NULL DEFAULT '',
                is_complete         INTEGER NOT NULL DEFAULT 0,
                status              TEXT NOT NULL DEFAULT 'pending',
                output_path         TEXT,
                error_message       TEXT,
                created_at          TEXT NOT NULL,
                updated_at          TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_volumes_radar_instant
                ON volumes(radar, observation_instant);
            CREATE INDEX IF NOT EXISTS idx_volumes_status ON volumes(status);

            CREATE TABLE IF NOT EXISTS products (
                volume_id     TEXT NOT NULL,
                product_type  TEXT NOT NULL,
                status        TEXT NOT NULL DEFAULT 'pending',
                generated_at  TEXT,
                error_type    TEXT,
                error_message TEXT,
                created_at    TEXT NOT NULL,
                updated_at    TEXT NOT NULL,
                PRIMARY KEY (volume_id, product_type),
                FOREIGN KEY (volume_id) REFERENCES volumes(volume_id)
            );
            CREATE INDEX IF NOT EXISTS idx_products_status ON products(status);
            "#,
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Files and partial downloads
    // ------------------------------------------------------------------

    /// Record a fully downloaded and verified file.
    ///
    /// One transaction: the file row is upserted and any partial row for the
    /// same key is deleted, so the two can never coexist.
    pub fn record_completed_file(&self, rec: &FileRecord) -> PipelineResult<()> {
        let now = to_iso(Utc::now());
        let mut guard = self.conn()?;
        let tx = guard.transaction()?;
        tx.execute(
            r#"
            INSERT OR REPLACE INTO files
                (filename, remote_path, local_path, size, digest, radar, field,
                 vol_code, vol_num, observation_instant, status, downloaded_at, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 'completed', ?11, ?11)
            "#,
            params![
                rec.filename,
                rec.remote_path,
                rec.local_path.to_string_lossy(),
                rec.size as i64,
                rec.digest,
                rec.radar,
                rec.field,
                rec.vol_code,
                rec.vol_num,
                to_iso(rec.observation_instant),
                now,
            ],
        )?;
        tx.execute(
            "DELETE FROM partial_downloads WHERE filename = ?1",
            params![rec.filename],
        )?;
        tx.commit()?;
        debug!(filename = %rec.filename, "Recorded completed file");
        Ok(())
    }

    /// Upsert retry state for an in-flight fetch.
    ///
    /// A completed file row for the same key makes this a no-op: a slower
    /// duplicate attempt must not resurrect a partial for a file that
    /// already landed.
    pub fn record_partial(&self, partial: &PartialDownload) -> PipelineResult<()> {
        let mut guard = self.conn()?;
        let tx = guard.transaction()?;
        let completed: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM files WHERE filename = ?1 AND status = 'completed'",
                params![partial.filename],
                |row| row.get(0),
            )
            .optional()?;
        if completed.is_some() {
            warn!(
                filename = %partial.filename,
                "Ignoring partial record for already-completed file"
            );
            return Ok(());
        }
        tx.execute(
            r#"
            INSERT INTO partial_downloads
                (filename, remote_path, local_path, bytes_downloaded, total_bytes,
                 attempt_count, last_attempt)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(filename) DO UPDATE SET
                bytes_downloaded = excluded.bytes_downloaded,
                total_bytes      = excluded.total_bytes,
                attempt_count    = excluded.attempt_count,
                last_attempt     = excluded.last_attempt
            "#,
            params![
                partial.filename,
                partial.remote_path,
                partial.local_path.to_string_lossy(),
                partial.bytes_downloaded as i64,
                partial.total_bytes.map(|b| b as i64),
                partial.attempt_count,
                to_iso(partial.last_attempt),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn is_file_completed(&self, filename: &str) -> PipelineResult<bool> {
        let conn = self.conn()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM files WHERE filename = ?1 AND status = 'completed'",
                params![filename],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Attempt count recorded so far for a filename (0 when no partial row).
    pub fn partial_attempts(&self, filename: &str) -> PipelineResult<u32> {
        let conn = self.conn()?;
        let attempts: Option<u32> = conn
            .query_row(
                "SELECT attempt_count FROM partial_downloads WHERE filename = ?1",
                params![filename],
                |row| row.get(0),
            )
            .optional()?;
        Ok(attempts.unwrap_or(0))
    }

    pub fn pending_partial_count(&self) -> PipelineResult<u64> {
        let conn = self.conn()?;
        let n: i64 =
            conn.query_row("SELECT COUNT(*) FROM partial_downloads", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// All partial rows, oldest attempt first. The Fetcher re-queues these
    /// every sweep so a failed file behind the resume point is not starved.
    pub fn pending_partials(&self) -> PipelineResult<Vec<PartialDownload>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT filename, remote_path, local_path, bytes_downloaded, total_bytes,
                    attempt_count, last_attempt
             FROM partial_downloads ORDER BY last_attempt ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, Option<i64>>(4)?,
                row.get::<_, u32>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (filename, remote_path, local_path, bytes, total, attempts, last) = row?;
            out.push(PartialDownload {
                filename,
                remote_path,
                local_path: PathBuf::from(local_path),
                bytes_downloaded: bytes as u64,
                total_bytes: total.map(|b| b as u64),
                attempt_count: attempts,
                last_attempt: parse_iso(&last)?,
            });
        }
        Ok(out)
    }

    /// Newest observation instant over completed files for a radar; the
    /// Fetcher resumes its walk just after this point.
    pub fn latest_observation_instant(
        &self,
        radar: &str,
    ) -> PipelineResult<Option<DateTime<Utc>>> {
        let conn = self.conn()?;
        let latest: Option<String> = conn.query_row(
            "SELECT MAX(observation_instant) FROM files
             WHERE radar = ?1 AND status = 'completed'",
            params![radar],
            |row| row.get(0),
        )?;
        latest.map(|s| parse_iso(&s)).transpose()
    }

    /// All completed files belonging to one volume identity.
    pub fn volume_files(
        &self,
        radar: &str,
        vol_code: &str,
        vol_num: &str,
        observation_instant: DateTime<Utc>,
    ) -> PipelineResult<Vec<FileRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT filename, remote_path, local_path, size, digest, radar, field,
                   vol_code, vol_num, observation_instant
            FROM files
            WHERE radar = ?1 AND vol_code = ?2 AND vol_num = ?3
              AND observation_instant = ?4 AND status = 'completed'
            ORDER BY field
            "#,
        )?;
        let rows = stmt.query_map(
            params![radar, vol_code, vol_num, to_iso(observation_instant)],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, String>(8)?,
                    row.get::<_, String>(9)?,
                ))
            },
        )?;
        let mut out = Vec::new();
        for row in rows {
            let (filename, remote_path, local_path, size, digest, radar, field, code, num, instant) =
                row?;
            out.push(FileRecord {
                filename,
                remote_path,
                local_path: PathBuf::from(local_path),
                size: size as u64,
                digest,
                radar,
                field,
                vol_code: code,
                vol_num: num,
                observation_instant: parse_iso(&instant)?,
            });
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Volumes
    // ------------------------------------------------------------------

    /// Ensure a volume row exists with the given expectation.
    pub fn upsert_volume(
        &self,
        volume_id: &str,
        radar: &str,
        vol_code: &str,
        vol_num: &str,
        observation_instant: DateTime<Utc>,
        expected_fields: &[String],
    ) -> PipelineResult<()> {
        let now = to_iso(Utc::now());
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO volumes
                (volume_id, radar, vol_code, vol_num, observation_instant,
                 expected_fields, downloaded_fields, is_complete, status,
                 created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, '', 0, 'pending', ?7, ?7)
            ON CONFLICT(volume_id) DO UPDATE SET
                expected_fields = excluded.expected_fields,
                updated_at      = excluded.updated_at
            "#,
            params![
                volume_id,
                radar,
                vol_code,
                vol_num,
                to_iso(observation_instant),
                join_fields(expected_fields),
                now,
            ],
        )?;
        Ok(())
    }

    /// Add a downloaded field to a volume and recompute completeness.
    ///
    /// `downloaded_fields` grows monotonically; completeness flips true once
    /// the downloaded set covers the expected set.
    pub fn add_field_to_volume(&self, volume_id: &str, field: &str) -> PipelineResult<bool> {
        let now = to_iso(Utc::now());
        let mut guard = self.conn()?;
        let tx = guard.transaction()?;
        let (expected_raw, downloaded_raw): (String, String) = tx.query_row(
            "SELECT expected_fields, downloaded_fields FROM volumes WHERE volume_id = ?1",
            params![volume_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let expected = split_fields(&expected_raw);
        let mut downloaded = split_fields(&downloaded_raw);
        if !downloaded.iter().any(|f| f == field) {
            downloaded.push(field.to_string());
        }
        let is_complete = !expected.is_empty()
            && expected.iter().all(|f| downloaded.iter().any(|d| d == f));
        tx.execute(
            "UPDATE volumes SET downloaded_fields = ?1, is_complete = ?2, updated_at = ?3
             WHERE volume_id = ?4",
            params![join_fields(&downloaded), is_complete as i64, now, volume_id],
        )?;
        tx.commit()?;
        if is_complete {
            debug!(volume_id, "Volume is now complete");
        }
        Ok(is_complete)
    }

    pub fn volume(&self, volume_id: &str) -> PipelineResult<Option<VolumeRow>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("{VOLUME_SELECT} WHERE volume_id = ?1"),
                params![volume_id],
                map_volume_row,
            )
            .optional()?;
        row.map(finish_volume_row).transpose()
    }

    /// Volumes the converter may try to claim, oldest observation first.
    ///
    /// Complete pending volumes always qualify. When `allow_incomplete` is
    /// set, incomplete volumes that have at least one field and were created
    /// before `incomplete_cutoff` qualify too.
    pub fn claimable_volumes(
        &self,
        allow_incomplete: bool,
        incomplete_cutoff: DateTime<Utc>,
    ) -> PipelineResult<Vec<VolumeRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            r#"{VOLUME_SELECT}
            WHERE status = 'pending'
              AND (is_complete = 1
                   OR (?1 = 1 AND downloaded_fields != '' AND created_at <= ?2))
            ORDER BY observation_instant ASC
            "#
        ))?;
        let rows = stmt.query_map(
            params![allow_incomplete as i64, to_iso(incomplete_cutoff)],
            map_volume_row,
        )?;
        collect_volume_rows(rows)
    }

    /// Claim a volume for processing. Returns true iff this caller won.
    pub fn claim_volume_for_processing(
        &self,
        volume_id: &str,
        allow_incomplete: bool,
    ) -> PipelineResult<bool> {
        let now = to_iso(Utc::now());
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE volumes SET status = 'processing', updated_at = ?1
             WHERE volume_id = ?2 AND status = 'pending'
               AND (is_complete = 1 OR ?3 = 1)",
            params![now, volume_id, allow_incomplete as i64],
        )?;
        Ok(changed == 1)
    }

    /// Terminal success: record the output container path.
    ///
    /// Must be called only after the container has been flushed to disk.
    pub fn mark_volume_processed(&self, volume_id: &str, output_path: &Path) -> PipelineResult<()> {
        let now = to_iso(Utc::now());
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE volumes
             SET status = 'completed', output_path = ?1, error_message = NULL, updated_at = ?2
             WHERE volume_id = ?3 AND status = 'processing'",
            params![output_path.to_string_lossy(), now, volume_id],
        )?;
        if changed == 0 {
            warn!(volume_id, "mark_volume_processed matched no processing row");
        }
        Ok(())
    }

    /// Terminal failure with a classified, bounded error message.
    pub fn mark_volume_failed(
        &self,
        volume_id: &str,
        kind: FailureKind,
        message: &str,
    ) -> PipelineResult<()> {
        let now = to_iso(Utc::now());
        let recorded = format!("{}: {}", kind, truncate_message(message, MAX_ERROR_MESSAGE));
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE volumes SET status = 'failed', error_message = ?1, updated_at = ?2
             WHERE volume_id = ?3 AND status = 'processing'",
            params![recorded, now, volume_id],
        )?;
        if changed == 0 {
            warn!(volume_id, "mark_volume_failed matched no processing row");
        }
        Ok(())
    }

    /// Operator action: re-queue a failed volume.
    pub fn reset_volume(&self, volume_id: &str) -> PipelineResult<bool> {
        let now = to_iso(Utc::now());
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE volumes SET status = 'pending', updated_at = ?1
             WHERE volume_id = ?2 AND status = 'failed'",
            params![now, volume_id],
        )?;
        Ok(changed == 1)
    }

    /// Volumes that still have actionable work: claimed, or complete and
    /// waiting. Incomplete pending volumes are excluded; once the window is
    /// exhausted they can never progress, so they must not block exit.
    pub fn actionable_volume_count(&self) -> PipelineResult<u64> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM volumes
             WHERE status = 'processing' OR (status = 'pending' AND is_complete = 1)",
            [],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    // ------------------------------------------------------------------
    // Products
    // ------------------------------------------------------------------

    /// Volumes whose container exists and whose product of `product_type`
    /// has not succeeded yet.
    pub fn list_volumes_for_rendering(
        &self,
        product_type: &str,
    ) -> PipelineResult<Vec<VolumeRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {VOLUME_COLUMNS}
            FROM volumes v
            LEFT JOIN products p
                ON v.volume_id = p.volume_id AND p.product_type = ?1
            WHERE v.status = 'completed'
              AND (p.status IS NULL OR p.status = 'pending' OR p.status = 'failed')
            ORDER BY v.observation_instant ASC
            "#
        ))?;
        let rows = stmt.query_map(params![product_type], map_volume_row)?;
        collect_volume_rows(rows)
    }

    /// Claim the `(volume, product_type)` slot. One transaction: the row is
    /// created lazily if missing, then conditionally advanced to
    /// `processing`. Returns true iff this caller won.
    pub fn claim_product(&self, volume_id: &str, product_type: &str) -> PipelineResult<bool> {
        let now = to_iso(Utc::now());
        let mut guard = self.conn()?;
        let tx = guard.transaction()?;
        let volume_status: Option<String> = tx
            .query_row(
                "SELECT status FROM volumes WHERE volume_id = ?1",
                params![volume_id],
                |row| row.get(0),
            )
            .optional()?;
        if volume_status.as_deref() != Some("completed") {
            return Ok(false);
        }
        tx.execute(
            "INSERT OR IGNORE INTO products
                 (volume_id, product_type, status, created_at, updated_at)
             VALUES (?1, ?2, 'pending', ?3, ?3)",
            params![volume_id, product_type, now],
        )?;
        let changed = tx.execute(
            "UPDATE products SET status = 'processing', updated_at = ?1
             WHERE volume_id = ?2 AND product_type = ?3
               AND status IN ('pending', 'failed')",
            params![now, volume_id, product_type],
        )?;
        tx.commit()?;
        Ok(changed == 1)
    }

    /// Advance a product row to a terminal (or reset) status.
    pub fn mark_product_status(
        &self,
        volume_id: &str,
        product_type: &str,
        status: ProcessingStatus,
        error: Option<(FailureKind, &str)>,
    ) -> PipelineResult<()> {
        let now = to_iso(Utc::now());
        let conn = self.conn()?;
        match status {
            ProcessingStatus::Completed => {
                conn.execute(
                    "UPDATE products
                     SET status = 'completed', generated_at = ?1,
                         error_type = NULL, error_message = NULL, updated_at = ?1
                     WHERE volume_id = ?2 AND product_type = ?3",
                    params![now, volume_id, product_type],
                )?;
            }
            ProcessingStatus::Failed => {
                let (kind, message) = error
                    .map(|(k, m)| (k.as_str(), truncate_message(m, MAX_ERROR_MESSAGE)))
                    .unwrap_or(("PLOT", String::new()));
                conn.execute(
                    "UPDATE products
                     SET status = 'failed', error_type = ?1, error_message = ?2, updated_at = ?3
                     WHERE volume_id = ?4 AND product_type = ?5",
                    params![kind, message, now, volume_id, product_type],
                )?;
            }
            other => {
                conn.execute(
                    "UPDATE products SET status = ?1, updated_at = ?2
                     WHERE volume_id = ?3 AND product_type = ?4",
                    params![other.as_str(), now, volume_id, product_type],
                )?;
            }
        }
        Ok(())
    }

    pub fn product(
        &self,
        volume_id: &str,
        product_type: &str,
    ) -> PipelineResult<Option<ProductRow>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT volume_id, product_type, status, generated_at, error_type,
                        error_message, updated_at
                 FROM products WHERE volume_id = ?1 AND product_type = ?2",
                params![volume_id, product_type],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()?;
        row.map(
            |(volume_id, product_type, status, generated_at, error_type, error_message, updated)| {
                Ok(ProductRow {
                    volume_id,
                    product_type,
                    status: ProcessingStatus::parse(&status)?,
                    generated_at: generated_at.map(|s| parse_iso(&s)).transpose()?,
                    error_type,
                    error_message,
                    updated_at: parse_iso(&updated)?,
                })
            },
        )
        .transpose()
    }

    // ------------------------------------------------------------------
    // Stuck-work recovery and statistics
    // ------------------------------------------------------------------

    /// Reset volumes stuck in `processing` longer than `timeout` back to
    /// `pending`. Returns the number of rows reset.
    pub fn reset_stuck_volumes(&self, timeout: chrono::Duration) -> PipelineResult<usize> {
        let now = Utc::now();
        let cutoff = to_iso(now - timeout);
        let conn = self.conn()?;
        let reset = conn.execute(
            "UPDATE volumes SET status = 'pending', updated_at = ?1
             WHERE status = 'processing' AND updated_at < ?2",
            params![to_iso(now), cutoff],
        )?;
        if reset > 0 {
            info!(reset, "Reset stuck volumes back to pending");
        }
        Ok(reset)
    }

    /// Same recovery for product rows.
    pub fn reset_stuck_products(&self, timeout: chrono::Duration) -> PipelineResult<usize> {
        let now = Utc::now();
        let cutoff = to_iso(now - timeout);
        let conn = self.conn()?;
        let reset = conn.execute(
            "UPDATE products SET status = 'pending', updated_at = ?1
             WHERE status = 'processing' AND updated_at < ?2",
            params![to_iso(now), cutoff],
        )?;
        if reset > 0 {
            info!(reset, "Reset stuck products back to pending");
        }
        Ok(reset)
    }

    pub fn stats(&self) -> PipelineResult<StoreStats> {
        let conn = self.conn()?;
        let mut stats = StoreStats::default();
        stats.files_completed = count(&conn, "SELECT COUNT(*) FROM files WHERE status = 'completed'")?;
        stats.partial_downloads = count(&conn, "SELECT COUNT(*) FROM partial_downloads")?;

        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM volumes GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, n) = row?;
            match status.as_str() {
                "pending" => stats.volumes_pending = n as u64,
                "processing" => stats.volumes_processing = n as u64,
                "completed" => stats.volumes_completed = n as u64,
                "failed" => stats.volumes_failed = n as u64,
                _ => {}
            }
        }

        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM products GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, n) = row?;
            match status.as_str() {
                "pending" => stats.products_pending = n as u64,
                "processing" => stats.products_processing = n as u64,
                "completed" => stats.products_completed = n as u64,
                "failed" => stats.products_failed = n as u64,
                _ => {}
            }
        }
        Ok(stats)
    }
}

const VOLUME_COLUMNS: &str = "v.volume_id, v.radar, v.vol_code, v.vol_num, v.observation_instant, \
     v.expected_fields, v.downloaded_fields, v.is_complete, v.status, v.output_path, \
     v.error_message, v.created_at, v.updated_at";

const VOLUME_SELECT: &str = "SELECT v.volume_id, v.radar, v.vol_code, v.vol_num, \
     v.observation_instant, v.expected_fields, v.downloaded_fields, v.is_complete, v.status, \
     v.output_path, v.error_message, v.created_at, v.updated_at FROM volumes v";

type RawVolumeRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    i64,
    String,
    Option<String>,
    Option<String>,
    String,
    String,
);

fn map_volume_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawVolumeRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
    ))
}

fn finish_volume_row(raw: RawVolumeRow) -> PipelineResult<VolumeRow> {
    let (
        volume_id,
        radar,
        vol_code,
        vol_num,
        instant,
        expected,
        downloaded,
        is_complete,
        status,
        output_path,
        error_message,
        created_at,
        updated_at,
    ) = raw;
    Ok(VolumeRow {
        volume_id,
        radar,
        vol_code,
        vol_num,
        observation_instant: parse_iso(&instant)?,
        expected_fields: split_fields(&expected),
        downloaded_fields: split_fields(&downloaded),
        is_complete: is_complete != 0,
        status: ProcessingStatus::parse(&status)?,
        output_path: output_path.map(PathBuf::from),
        error_message,
        created_at: parse_iso(&created_at)?,
        updated_at: parse_iso(&updated_at)?,
    })
}

fn collect_volume_rows(
    rows: impl Iterator<Item = rusqlite::Result<RawVolumeRow>>,
) -> PipelineResult<Vec<VolumeRow>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(finish_volume_row(row?)?);
    }
    Ok(out)
}

fn count(conn: &Connection, sql: &str) -> PipelineResult<u64> {
    let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
    Ok(n as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn instant() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap()
    }

    fn file_record(field: &str) -> FileRecord {
        FileRecord {
            filename: format!("RMA1_0315_01_{field}_20250101T120000Z.BUFR"),
            remote_path: format!("/L2/RMA1/2025/01/01/12/0000/RMA1_0315_01_{field}_20250101T120000Z.BUFR"),
            local_path: PathBuf::from(format!("/tmp/{field}.BUFR")),
            size: 1024,
            digest: Some("ab".repeat(32)),
            radar: "RMA1".into(),
            field: field.into(),
            vol_code: "0315".into(),
            vol_num: "01".into(),
            observation_instant: instant(),
        }
    }

    fn register_volume(store: &StateStore, expected: &[&str]) -> String {
        let id = "RMA1_0315_01_20250101T120000Z".to_string();
        let expected: Vec<String> = expected.iter().map(|s| s.to_string()).collect();
        store
            .upsert_volume(&id, "RMA1", "0315", "01", instant(), &expected)
            .unwrap();
        id
    }

    #[test]
    fn completed_file_round_trip() {
        let store = StateStore::in_memory().unwrap();
        let rec = file_record("DBZH");
        assert!(!store.is_file_completed(&rec.filename).unwrap());
        store.record_completed_file(&rec).unwrap();
        assert!(store.is_file_completed(&rec.filename).unwrap());
        assert_eq!(
            store.latest_observation_instant("RMA1").unwrap(),
            Some(instant())
        );
        assert_eq!(store.latest_observation_instant("RMA99").unwrap(), None);
    }

    #[test]
    fn partial_deleted_when_file_completes() {
        let store = StateStore::in_memory().unwrap();
        let rec = file_record("DBZH");
        store
            .record_partial(&PartialDownload {
                filename: rec.filename.clone(),
                remote_path: rec.remote_path.clone(),
                local_path: rec.local_path.clone(),
                bytes_downloaded: 17,
                total_bytes: Some(1024),
                attempt_count: 1,
                last_attempt: instant(),
            })
            .unwrap();
        assert_eq!(store.partial_attempts(&rec.filename).unwrap(), 1);
        assert_eq!(store.pending_partial_count().unwrap(), 1);

        store.record_completed_file(&rec).unwrap();
        assert_eq!(store.partial_attempts(&rec.filename).unwrap(), 0);
        assert_eq!(store.pending_partial_count().unwrap(), 0);
    }

    #[test]
    fn partial_never_coexists_with_completed() {
        let store = StateStore::in_memory().unwrap();
        let rec = file_record("DBZH");
        store.record_completed_file(&rec).unwrap();
        store
            .record_partial(&PartialDownload {
                filename: rec.filename.clone(),
                remote_path: rec.remote_path.clone(),
                local_path: rec.local_path.clone(),
                bytes_downloaded: 5,
                total_bytes: None,
                attempt_count: 1,
                last_attempt: instant(),
            })
            .unwrap();
        assert_eq!(store.pending_partial_count().unwrap(), 0);
    }

    #[test]
    fn volume_completeness_flips_when_covered() {
        let store = StateStore::in_memory().unwrap();
        let id = register_volume(&store, &["DBZH", "VRAD"]);

        assert!(!store.add_field_to_volume(&id, "DBZH").unwrap());
        let row = store.volume(&id).unwrap().unwrap();
        assert!(!row.is_complete);
        assert_eq!(row.downloaded_fields, vec!["DBZH".to_string()]);

        assert!(store.add_field_to_volume(&id, "VRAD").unwrap());
        let row = store.volume(&id).unwrap().unwrap();
        assert!(row.is_complete);
        assert_eq!(row.status, ProcessingStatus::Pending);
    }

    #[test]
    fn extra_field_does_not_break_completeness() {
        let store = StateStore::in_memory().unwrap();
        let id = register_volume(&store, &["DBZH"]);
        assert!(store.add_field_to_volume(&id, "DBZH").unwrap());
        // a field the expectation map never asked for
        assert!(store.add_field_to_volume(&id, "KDP").unwrap());
        let row = store.volume(&id).unwrap().unwrap();
        assert!(row.is_complete);
    }

    #[test]
    fn single_field_volume_completes_after_one_fetch() {
        let store = StateStore::in_memory().unwrap();
        let id = register_volume(&store, &["DBZH"]);
        assert!(store.add_field_to_volume(&id, "DBZH").unwrap());
    }

    #[test]
    fn only_one_claim_wins() {
        let store = StateStore::in_memory().unwrap();
        let id = register_volume(&store, &["DBZH"]);
        store.add_field_to_volume(&id, "DBZH").unwrap();

        assert!(store.claim_volume_for_processing(&id, false).unwrap());
        assert!(!store.claim_volume_for_processing(&id, false).unwrap());
    }

    #[test]
    fn incomplete_volume_cannot_be_claimed() {
        let store = StateStore::in_memory().unwrap();
        let id = register_volume(&store, &["DBZH", "VRAD"]);
        store.add_field_to_volume(&id, "DBZH").unwrap();
        assert!(!store.claim_volume_for_processing(&id, false).unwrap());
        // the incomplete-elevation path may take it
        assert!(store.claim_volume_for_processing(&id, true).unwrap());
    }

    #[test]
    fn volume_terminal_transitions() {
        let store = StateStore::in_memory().unwrap();
        let id = register_volume(&store, &["DBZH"]);
        store.add_field_to_volume(&id, "DBZH").unwrap();
        store.claim_volume_for_processing(&id, false).unwrap();
        store
            .mark_volume_processed(&id, Path::new("/out/vol.arrow"))
            .unwrap();
        let row = store.volume(&id).unwrap().unwrap();
        assert_eq!(row.status, ProcessingStatus::Completed);
        assert_eq!(row.output_path, Some(PathBuf::from("/out/vol.arrow")));
        assert!(row.error_message.is_none());
    }

    #[test]
    fn failed_volume_records_error_class() {
        let store = StateStore::in_memory().unwrap();
        let id = register_volume(&store, &["DBZH"]);
        store.add_field_to_volume(&id, "DBZH").unwrap();
        store.claim_volume_for_processing(&id, false).unwrap();
        store
            .mark_volume_failed(&id, FailureKind::GeometryMismatch, "gate size differs")
            .unwrap();
        let row = store.volume(&id).unwrap().unwrap();
        assert_eq!(row.status, ProcessingStatus::Failed);
        let msg = row.error_message.unwrap();
        assert!(msg.starts_with("GEOMETRY_MISMATCH"));

        // operator reset re-queues it
        assert!(store.reset_volume(&id).unwrap());
        let row = store.volume(&id).unwrap().unwrap();
        assert_eq!(row.status, ProcessingStatus::Pending);
    }

    #[test]
    fn rendering_candidates_respect_product_rows() {
        let store = StateStore::in_memory().unwrap();
        let id = register_volume(&store, &["DBZH"]);
        store.add_field_to_volume(&id, "DBZH").unwrap();

        // not completed yet: no candidates
        assert!(store.list_volumes_for_rendering("image").unwrap().is_empty());

        store.claim_volume_for_processing(&id, false).unwrap();
        store
            .mark_volume_processed(&id, Path::new("/out/vol.arrow"))
            .unwrap();
        assert_eq!(store.list_volumes_for_rendering("image").unwrap().len(), 1);

        assert!(store.claim_product(&id, "image").unwrap());
        assert!(!store.claim_product(&id, "image").unwrap());
        // processing product removes the volume from candidates
        assert!(store.list_volumes_for_rendering("image").unwrap().is_empty());

        store
            .mark_product_status(&id, "image", ProcessingStatus::Failed, Some((FailureKind::Plot, "no fields")))
            .unwrap();
        // failed products are offered again
        assert_eq!(store.list_volumes_for_rendering("image").unwrap().len(), 1);
        assert!(store.claim_product(&id, "image").unwrap());
        store
            .mark_product_status(&id, "image", ProcessingStatus::Completed, None)
            .unwrap();
        assert!(store.list_volumes_for_rendering("image").unwrap().is_empty());

        let product = store.product(&id, "image").unwrap().unwrap();
        assert_eq!(product.status, ProcessingStatus::Completed);
        assert!(product.generated_at.is_some());
        assert!(product.error_type.is_none());
    }

    #[test]
    fn product_claim_requires_completed_volume() {
        let store = StateStore::in_memory().unwrap();
        let id = register_volume(&store, &["DBZH"]);
        assert!(!store.claim_product(&id, "image").unwrap());
        assert!(store.product(&id, "image").unwrap().is_none());
    }

    #[test]
    fn stuck_rows_are_reset() {
        let store = StateStore::in_memory().unwrap();
        let id = register_volume(&store, &["DBZH"]);
        store.add_field_to_volume(&id, "DBZH").unwrap();
        store.claim_volume_for_processing(&id, false).unwrap();

        // nothing is stuck yet
        assert_eq!(
            store.reset_stuck_volumes(chrono::Duration::minutes(60)).unwrap(),
            0
        );
        // with a zero timeout the processing row counts as stuck
        assert_eq!(
            store.reset_stuck_volumes(chrono::Duration::seconds(-1)).unwrap(),
            1
        );
        let row = store.volume(&id).unwrap().unwrap();
        assert_eq!(row.status, ProcessingStatus::Pending);
    }

    #[test]
    fn stats_reflect_row_counts() {
        let store = StateStore::in_memory().unwrap();
        store.record_completed_file(&file_record("DBZH")).unwrap();
        let id = register_volume(&store, &["DBZH"]);
        store.add_field_to_volume(&id, "DBZH").unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.files_completed, 1);
        assert_eq!(stats.volumes_pending, 1);
        assert_eq!(stats.volumes_completed, 0);
    }

    #[test]
    fn claimable_volumes_ordered_oldest_first() {
        let store = StateStore::in_memory().unwrap();
        for (num, hour) in [("02", 13), ("01", 12)] {
            let t = Utc.with_ymd_and_hms(2025, 1, 1, hour, 0, 0).unwrap();
            let id = format!("RMA1_0315_{num}_{}", t.format("%Y%m%dT%H%M%SZ"));
            store
                .upsert_volume(&id, "RMA1", "0315", num, t, &["DBZH".to_string()])
                .unwrap();
            store.add_field_to_volume(&id, "DBZH").unwrap();
        }
        let rows = store.claimable_volumes(false, Utc::now()).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].observation_instant < rows[1].observation_instant);
    }
}
