use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Durable state store
///
/// Single-writer, multi-reader record of every download, chunk, and
/// attempt, backed by one SQLite file in WAL mode. Every mutating call
/// runs in one transaction that also bumps `state_version`, so snapshot
/// versions form a total order.
use crate::core::error::EngineError;
use crate::core::state::{ChunkState, DownloadState, AWAIT_OVERWRITE};
use crate::core::types::{
    AddRequest, Attempt, Chunk, Download, DownloadSummary, Priority, QueueSummary, Snapshot,
    TransferMode,
};

/// Options carried by a state transition
#[derive(Debug, Default, Clone)]
pub struct TransitionOpts {
    pub error_message: Option<String>,
    pub error_code: Option<String>,
}

impl TransitionOpts {
    pub fn error(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            error_code: Some(code.into()),
        }
    }

    pub fn await_overwrite() -> Self {
        Self {
            error_message: None,
            error_code: Some(AWAIT_OVERWRITE.to_string()),
        }
    }
}

/// File name of the embedded state database
pub const STATE_DB_FILE: &str = "downloads-state.db";

pub struct StateStore {
    conn: Mutex<Connection>,
    /// Cached copy of the meta row; avoids a query on every snapshot poll
    version: AtomicU64,
}

impl StateStore {
    /// Open (or create) the store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, EngineError> {
        let conn = Connection::open(path.as_ref())?;
        let store = Self::from_connection(conn)?;
        info!(path = ?path.as_ref(), version = store.current_version(), "State store opened");
        Ok(store)
    }

    /// In-memory store for tests
    pub fn open_in_memory() -> Result<Self, EngineError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, EngineError> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Self::init_schema(&conn)?;

        let version: u64 = conn.query_row(
            "SELECT value FROM meta WHERE key = 'state_version'",
            [],
            |row| row.get::<_, i64>(0),
        )? as u64;

        Ok(Self {
            conn: Mutex::new(conn),
            version: AtomicU64::new(version),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), EngineError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS downloads (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                url TEXT NOT NULL,
                save_path TEXT NOT NULL,
                total_bytes INTEGER,
                downloaded_bytes INTEGER NOT NULL DEFAULT 0,
                state TEXT NOT NULL DEFAULT 'queued',
                priority INTEGER NOT NULL DEFAULT 2,
                mode TEXT,
                expected_sha256 TEXT,
                error_message TEXT,
                error_code TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                state_changed_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS chunks (
                download_id INTEGER NOT NULL,
                chunk_index INTEGER NOT NULL,
                start_byte INTEGER NOT NULL,
                end_byte INTEGER NOT NULL,
                state TEXT NOT NULL DEFAULT 'pending',
                written_bytes INTEGER NOT NULL DEFAULT 0,
                attempts INTEGER NOT NULL DEFAULT 0,
                tail_hash TEXT,
                PRIMARY KEY (download_id, chunk_index),
                FOREIGN KEY (download_id) REFERENCES downloads(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS attempts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                download_id INTEGER NOT NULL,
                chunk_index INTEGER,
                attempt_number INTEGER NOT NULL,
                error_text TEXT NOT NULL,
                error_code TEXT NOT NULL,
                bytes_transferred INTEGER NOT NULL DEFAULT 0,
                timestamp TEXT NOT NULL,
                FOREIGN KEY (download_id) REFERENCES downloads(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_downloads_state ON downloads(state);
            CREATE INDEX IF NOT EXISTS idx_chunks_download
                ON chunks(download_id, chunk_index);
            CREATE INDEX IF NOT EXISTS idx_attempts_download
                ON attempts(download_id, timestamp);

            INSERT OR IGNORE INTO meta (key, value) VALUES ('state_version', 0);
            ",
        )?;
        Ok(())
    }

    /// Current snapshot version without touching the database
    pub fn current_version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    fn bump_version(tx: &rusqlite::Transaction) -> Result<u64, EngineError> {
        tx.execute(
            "UPDATE meta SET value = value + 1 WHERE key = 'state_version'",
            [],
        )?;
        let v: i64 = tx.query_row(
            "SELECT value FROM meta WHERE key = 'state_version'",
            [],
            |row| row.get(0),
        )?;
        Ok(v as u64)
    }

    /// Register a new download as QUEUED and return its id
    ///
    /// An explicit id that already exists is rejected; `add` is
    /// idempotent per id only in the sense that the second call fails
    /// cleanly without mutating anything.
    pub fn add(&self, req: &AddRequest) -> Result<i64, EngineError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        if let Some(id) = req.id {
            let exists: Option<i64> = tx
                .query_row("SELECT id FROM downloads WHERE id = ?1", [id], |row| {
                    row.get(0)
                })
                .optional()?;
            if exists.is_some() {
                return Err(EngineError::State(format!("duplicate add for id {id}")));
            }
            tx.execute(
                "INSERT INTO downloads
                    (id, url, save_path, total_bytes, priority, expected_sha256,
                     created_at, updated_at, state_changed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, ?7)",
                params![
                    id,
                    req.url,
                    req.save_path,
                    req.total_bytes_hint.map(|v| v as i64),
                    req.priority.unwrap_or_default().as_i64(),
                    req.expected_sha256,
                    now,
                ],
            )?;
        } else {
            tx.execute(
                "INSERT INTO downloads
                    (url, save_path, total_bytes, priority, expected_sha256,
                     created_at, updated_at, state_changed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?6)",
                params![
                    req.url,
                    req.save_path,
                    req.total_bytes_hint.map(|v| v as i64),
                    req.priority.unwrap_or_default().as_i64(),
                    req.expected_sha256,
                    now,
                ],
            )?;
        }
        let id = tx.last_insert_rowid();
        let version = Self::bump_version(&tx)?;
        tx.commit()?;
        self.version.store(version, Ordering::SeqCst);

        debug!(download_id = id, url = %req.url, "Download row added");
        Ok(id)
    }

    /// Apply a state transition, enforcing the allowed-transitions table
    pub fn set_state(
        &self,
        id: i64,
        new_state: DownloadState,
        opts: TransitionOpts,
    ) -> Result<u64, EngineError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let current_str: String = tx
            .query_row("SELECT state FROM downloads WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .optional()?
            .ok_or_else(|| EngineError::State(format!("download {id} not found")))?;
        let current = DownloadState::parse(&current_str)
            .ok_or_else(|| EngineError::State(format!("corrupt state '{current_str}'")))?;

        if !current.can_transition(new_state) {
            warn!(
                download_id = id,
                from = current.as_str(),
                to = new_state.as_str(),
                "Illegal state transition rejected"
            );
            return Err(EngineError::State(format!(
                "illegal transition {} -> {}",
                current.as_str(),
                new_state.as_str()
            )));
        }

        let now = Utc::now().to_rfc3339();
        tx.execute(
            "UPDATE downloads
             SET state = ?2, error_message = ?3, error_code = ?4,
                 updated_at = ?5, state_changed_at = ?5
             WHERE id = ?1",
            params![
                id,
                new_state.as_str(),
                opts.error_message,
                opts.error_code,
                now
            ],
        )?;
        let version = Self::bump_version(&tx)?;
        tx.commit()?;
        self.version.store(version, Ordering::SeqCst);

        info!(
            download_id = id,
            from = current.as_str(),
            to = new_state.as_str(),
            "State transition"
        );
        Ok(version)
    }

    /// Record the mode decided at start
    pub fn set_mode(&self, id: i64, mode: TransferMode) -> Result<(), EngineError> {
        self.write(|tx| {
            tx.execute(
                "UPDATE downloads SET mode = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, mode.as_str(), Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    /// Record the size resolved by the probe
    pub fn set_total_bytes(&self, id: i64, total: u64) -> Result<(), EngineError> {
        self.write(|tx| {
            tx.execute(
                "UPDATE downloads SET total_bytes = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, total as i64, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    pub fn set_priority(&self, id: i64, priority: Priority) -> Result<(), EngineError> {
        self.write(|tx| {
            tx.execute(
                "UPDATE downloads SET priority = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, priority.as_i64(), Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    /// Coalesced progress write for a single download
    pub fn update_progress(&self, id: i64, bytes: u64) -> Result<(), EngineError> {
        self.batch_update_progress(&[(id, bytes)])
    }

    /// Coalesced progress write for many downloads in one transaction
    ///
    /// `downloaded_bytes` never exceeds a known total; an unknown total
    /// leaves the value unbounded.
    pub fn batch_update_progress(&self, updates: &[(i64, u64)]) -> Result<(), EngineError> {
        if updates.is_empty() {
            return Ok(());
        }
        self.write(|tx| {
            let now = Utc::now().to_rfc3339();
            for (id, bytes) in updates {
                tx.execute(
                    "UPDATE downloads
                     SET downloaded_bytes = MIN(?2, COALESCE(total_bytes, ?2)),
                         updated_at = ?3
                     WHERE id = ?1",
                    params![id, *bytes as i64, now],
                )?;
            }
            Ok(())
        })
    }

    /// Install the chunk plan for a download
    ///
    /// A plan identical to the stored one is kept as-is so completed
    /// chunks survive a retry; any difference wipes and reinserts.
    pub fn upsert_chunks(&self, id: i64, ranges: &[(u32, u64, u64)]) -> Result<(), EngineError> {
        self.write(|tx| {
            let existing: Vec<(u32, u64, u64)> = {
                let mut stmt = tx.prepare(
                    "SELECT chunk_index, start_byte, end_byte FROM chunks
                     WHERE download_id = ?1 ORDER BY chunk_index",
                )?;
                let rows = stmt.query_map([id], |row| {
                    Ok((
                        row.get::<_, i64>(0)? as u32,
                        row.get::<_, i64>(1)? as u64,
                        row.get::<_, i64>(2)? as u64,
                    ))
                })?;
                rows.collect::<Result<Vec<_>, _>>()?
            };

            if existing == ranges {
                return Ok(());
            }
            if !existing.is_empty() {
                warn!(download_id = id, "Chunk plan changed, discarding stored chunks");
                tx.execute("DELETE FROM chunks WHERE download_id = ?1", [id])?;
            }
            for (index, start, end) in ranges {
                tx.execute(
                    "INSERT INTO chunks (download_id, chunk_index, start_byte, end_byte)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![id, index, *start as i64, *end as i64],
                )?;
            }
            Ok(())
        })
    }

    pub fn set_chunk_state(
        &self,
        id: i64,
        chunk_index: u32,
        state: ChunkState,
    ) -> Result<(), EngineError> {
        self.write(|tx| {
            tx.execute(
                "UPDATE chunks SET state = ?3 WHERE download_id = ?1 AND chunk_index = ?2",
                params![id, chunk_index, state.as_str()],
            )?;
            Ok(())
        })
    }

    /// Flush a chunk's written byte count, optionally with a fresh
    /// tail-hash checkpoint
    pub fn set_chunk_progress(
        &self,
        id: i64,
        chunk_index: u32,
        written_bytes: u64,
        tail_hash: Option<&str>,
    ) -> Result<(), EngineError> {
        self.write(|tx| {
            match tail_hash {
                Some(hash) => tx.execute(
                    "UPDATE chunks SET written_bytes = ?3, tail_hash = ?4
                     WHERE download_id = ?1 AND chunk_index = ?2",
                    params![id, chunk_index, written_bytes as i64, hash],
                )?,
                None => tx.execute(
                    "UPDATE chunks SET written_bytes = ?3
                     WHERE download_id = ?1 AND chunk_index = ?2",
                    params![id, chunk_index, written_bytes as i64],
                )?,
            };
            Ok(())
        })
    }

    pub fn bump_chunk_attempts(&self, id: i64, chunk_index: u32) -> Result<u32, EngineError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE chunks SET attempts = attempts + 1
             WHERE download_id = ?1 AND chunk_index = ?2",
            params![id, chunk_index],
        )?;
        let attempts: i64 = tx.query_row(
            "SELECT attempts FROM chunks WHERE download_id = ?1 AND chunk_index = ?2",
            params![id, chunk_index],
            |row| row.get(0),
        )?;
        let version = Self::bump_version(&tx)?;
        tx.commit()?;
        self.version.store(version, Ordering::SeqCst);
        Ok(attempts as u32)
    }

    /// Put every non-completed chunk back to PENDING for a retry pass
    pub fn reset_incomplete_chunks(&self, id: i64) -> Result<(), EngineError> {
        self.write(|tx| {
            tx.execute(
                "UPDATE chunks SET state = 'pending'
                 WHERE download_id = ?1 AND state != 'completed'",
                [id],
            )?;
            Ok(())
        })
    }

    /// Drop all chunk rows, e.g. after a fallback to simple mode
    pub fn delete_chunks(&self, id: i64) -> Result<(), EngineError> {
        self.write(|tx| {
            tx.execute("DELETE FROM chunks WHERE download_id = ?1", [id])?;
            Ok(())
        })
    }

    /// Append one attempt-log row
    pub fn record_attempt(
        &self,
        id: i64,
        chunk_index: Option<u32>,
        attempt_number: u32,
        error: &EngineError,
        bytes_transferred: u64,
    ) -> Result<(), EngineError> {
        self.write(|tx| {
            tx.execute(
                "INSERT INTO attempts
                    (download_id, chunk_index, attempt_number, error_text,
                     error_code, bytes_transferred, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id,
                    chunk_index,
                    attempt_number,
                    error.to_string(),
                    error.kind(),
                    bytes_transferred as i64,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    /// Fetch one download row
    pub fn get(&self, id: i64) -> Result<Download, EngineError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("{SELECT_DOWNLOAD} WHERE id = ?1"),
            [id],
            row_to_download,
        )
        .optional()?
        .ok_or_else(|| EngineError::State(format!("download {id} not found")))
    }

    /// Fetch all chunk rows of a download, ordered by index
    pub fn get_chunks(&self, id: i64) -> Result<Vec<Chunk>, EngineError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT download_id, chunk_index, start_byte, end_byte, state,
                    written_bytes, attempts, tail_hash
             FROM chunks WHERE download_id = ?1 ORDER BY chunk_index",
        )?;
        let rows = stmt.query_map([id], row_to_chunk)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Fetch the attempt log of a download, oldest first
    pub fn get_attempts(&self, id: i64) -> Result<Vec<Attempt>, EngineError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT download_id, chunk_index, attempt_number, error_text,
                    error_code, bytes_transferred, timestamp
             FROM attempts WHERE download_id = ?1 ORDER BY timestamp, id",
        )?;
        let rows = stmt.query_map([id], |row| {
            Ok(Attempt {
                download_id: row.get(0)?,
                chunk_index: row.get::<_, Option<i64>>(1)?.map(|v| v as u32),
                attempt_number: row.get::<_, i64>(2)? as u32,
                error_text: row.get(3)?,
                error_code: row.get(4)?,
                bytes_transferred: row.get::<_, i64>(5)? as u64,
                timestamp: parse_ts(&row.get::<_, String>(6)?),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Versioned snapshot of the whole queue
    ///
    /// Returns None when the caller's version is already current.
    pub fn snapshot(&self, min_version: Option<u64>) -> Result<Option<Snapshot>, EngineError> {
        let version = self.current_version();
        if min_version == Some(version) {
            return Ok(None);
        }
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!("{SELECT_DOWNLOAD} ORDER BY id"))?;
        let rows = stmt.query_map([], row_to_download)?;
        let items = rows
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(summarize)
            .collect();
        Ok(Some(Snapshot { version, items }))
    }

    pub fn list_by_state(
        &self,
        state: DownloadState,
        limit: usize,
    ) -> Result<Vec<Download>, EngineError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{SELECT_DOWNLOAD} WHERE state = ?1 ORDER BY id LIMIT ?2"
        ))?;
        let rows = stmt.query_map(
            params![state.as_str(), limit.min(i64::MAX as usize) as i64],
            row_to_download,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Aggregate counts per state
    pub fn summary(&self) -> Result<QueueSummary, EngineError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM downloads GROUP BY state")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?;
        let mut out = QueueSummary::default();
        for row in rows {
            let (state, count) = row?;
            match state.as_str() {
                "queued" => out.queued = count,
                "starting" => out.starting = count,
                "downloading" => out.downloading = count,
                "paused" => out.paused = count,
                "merging" => out.merging = count,
                "verifying" => out.verifying = count,
                "completed" => out.completed = count,
                "failed" => out.failed = count,
                "cancelled" => out.cancelled = count,
                _ => {}
            }
        }
        Ok(out)
    }

    /// Delete a terminal download and its dependent rows
    ///
    /// FAILED is not terminal (it still has the retry edge); a failed
    /// row is purged by cancelling it first.
    pub fn remove(&self, id: i64) -> Result<(), EngineError> {
        let current = self.get(id)?;
        if !current.state.is_terminal() {
            return Err(EngineError::State(format!(
                "cannot remove download {id} in state {}",
                current.state.as_str()
            )));
        }
        self.write(|tx| {
            tx.execute("DELETE FROM downloads WHERE id = ?1", [id])?;
            Ok(())
        })
    }

    /// Demote rows a crash left mid-flight back to PAUSED
    ///
    /// Parts stay on disk; checkpoints are validated on the next resume.
    pub fn recover_interrupted(&self) -> Result<usize, EngineError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();
        let changed = tx.execute(
            "UPDATE downloads
             SET state = 'paused', updated_at = ?1, state_changed_at = ?1
             WHERE state IN ('starting', 'downloading', 'merging', 'verifying')",
            [&now],
        )?;
        tx.execute(
            "UPDATE chunks SET state = 'paused' WHERE state = 'downloading'",
            [],
        )?;
        if changed > 0 {
            let version = Self::bump_version(&tx)?;
            tx.commit()?;
            self.version.store(version, Ordering::SeqCst);
            info!(recovered = changed, "Demoted interrupted downloads to paused");
        } else {
            tx.commit()?;
        }
        Ok(changed)
    }

    /// Run one mutating transaction with the version bump
    fn write<F>(&self, f: F) -> Result<(), EngineError>
    where
        F: FnOnce(&rusqlite::Transaction) -> Result<(), EngineError>,
    {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        f(&tx)?;
        let version = Self::bump_version(&tx)?;
        tx.commit()?;
        self.version.store(version, Ordering::SeqCst);
        Ok(())
    }
}

const SELECT_DOWNLOAD: &str = "SELECT id, url, save_path, total_bytes, downloaded_bytes, state,
        priority, mode, expected_sha256, error_message, error_code,
        created_at, updated_at, state_changed_at
 FROM downloads";

fn parse_ts(s: &str) -> DateTime<Utc> {
    s.parse::<DateTime<Utc>>().unwrap_or_else(|_| Utc::now())
}

fn row_to_download(row: &rusqlite::Row) -> rusqlite::Result<Download> {
    Ok(Download {
        id: row.get(0)?,
        url: row.get(1)?,
        save_path: row.get(2)?,
        total_bytes: row.get::<_, Option<i64>>(3)?.map(|v| v as u64),
        downloaded_bytes: row.get::<_, i64>(4)? as u64,
        state: DownloadState::parse(&row.get::<_, String>(5)?).unwrap_or(DownloadState::Failed),
        priority: Priority::from_i64(row.get(6)?).unwrap_or_default(),
        mode: row
            .get::<_, Option<String>>(7)?
            .and_then(|s| TransferMode::parse(&s)),
        expected_sha256: row.get(8)?,
        error_message: row.get(9)?,
        error_code: row.get(10)?,
        created_at: parse_ts(&row.get::<_, String>(11)?),
        updated_at: parse_ts(&row.get::<_, String>(12)?),
        state_changed_at: parse_ts(&row.get::<_, String>(13)?),
    })
}

fn row_to_chunk(row: &rusqlite::Row) -> rusqlite::Result<Chunk> {
    Ok(Chunk {
        download_id: row.get(0)?,
        chunk_index: row.get::<_, i64>(1)? as u32,
        start_byte: row.get::<_, i64>(2)? as u64,
        end_byte: row.get::<_, i64>(3)? as u64,
        state: ChunkState::parse(&row.get::<_, String>(4)?).unwrap_or(ChunkState::Pending),
        written_bytes: row.get::<_, i64>(5)? as u64,
        attempts: row.get::<_, i64>(6)? as u32,
        tail_hash: row.get(7)?,
    })
}

fn summarize(d: Download) -> DownloadSummary {
    let percent = d.progress_percent();
    DownloadSummary {
        id: d.id,
        url: d.url,
        save_path: d.save_path,
        state: d.state,
        priority: d.priority,
        mode: d.mode,
        total_bytes: d.total_bytes,
        downloaded_bytes: d.downloaded_bytes,
        percent,
        error_message: d.error_message,
        error_code: d.error_code,
        created_at: d.created_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> StateStore {
        StateStore::open_in_memory().unwrap()
    }

    fn add_one(store: &StateStore) -> i64 {
        store
            .add(&AddRequest {
                id: None,
                url: "https://files.example.org/a.bin".to_string(),
                save_path: "/downloads/a.bin".to_string(),
                total_bytes_hint: Some(1000),
                priority: None,
                expected_sha256: None,
            })
            .unwrap()
    }

    #[test]
    fn test_add_assigns_monotonic_ids() {
        let store = store();
        let a = add_one(&store);
        let b = add_one(&store);
        assert!(a >= 1);
        assert_eq!(b, a + 1);
    }

    #[test]
    fn test_duplicate_explicit_id_rejected() {
        let store = store();
        let req = AddRequest {
            id: Some(7),
            url: "https://files.example.org/a.bin".to_string(),
            save_path: "/downloads/a.bin".to_string(),
            total_bytes_hint: None,
            priority: None,
            expected_sha256: None,
        };
        assert_eq!(store.add(&req).unwrap(), 7);
        let err = store.add(&req).unwrap_err();
        assert_eq!(err.kind(), "state");
    }

    #[test]
    fn test_version_bumps_once_per_mutation() {
        let store = store();
        let v0 = store.current_version();
        let id = add_one(&store);
        assert_eq!(store.current_version(), v0 + 1);
        store
            .set_state(id, DownloadState::Starting, TransitionOpts::default())
            .unwrap();
        assert_eq!(store.current_version(), v0 + 2);
        store.update_progress(id, 10).unwrap();
        assert_eq!(store.current_version(), v0 + 3);
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let store = store();
        let id = add_one(&store);
        let err = store
            .set_state(id, DownloadState::Merging, TransitionOpts::default())
            .unwrap_err();
        assert_eq!(err.kind(), "state");
        // row untouched
        assert_eq!(store.get(id).unwrap().state, DownloadState::Queued);
    }

    #[test]
    fn test_full_chunked_lifecycle_transitions() {
        let store = store();
        let id = add_one(&store);
        for state in [
            DownloadState::Starting,
            DownloadState::Downloading,
            DownloadState::Merging,
            DownloadState::Verifying,
            DownloadState::Completed,
        ] {
            store.set_state(id, state, TransitionOpts::default()).unwrap();
        }
        assert_eq!(store.get(id).unwrap().state, DownloadState::Completed);
    }

    #[test]
    fn test_progress_clamped_to_total() {
        let store = store();
        let id = add_one(&store);
        store.update_progress(id, 5000).unwrap();
        assert_eq!(store.get(id).unwrap().downloaded_bytes, 1000);
    }

    #[test]
    fn test_snapshot_versioning() {
        let store = store();
        let id = add_one(&store);
        let snap = store.snapshot(None).unwrap().unwrap();
        assert_eq!(snap.items.len(), 1);
        assert_eq!(snap.items[0].id, id);

        // caller already current -> nothing
        assert!(store.snapshot(Some(snap.version)).unwrap().is_none());

        store.update_progress(id, 1).unwrap();
        let snap2 = store.snapshot(Some(snap.version)).unwrap().unwrap();
        assert!(snap2.version > snap.version);
    }

    #[test]
    fn test_chunk_upsert_preserves_identical_plan() {
        let store = store();
        let id = add_one(&store);
        let plan = vec![(0u32, 0u64, 499u64), (1, 500, 999)];
        store.upsert_chunks(id, &plan).unwrap();
        store.set_chunk_state(id, 0, ChunkState::Completed).unwrap();
        store.set_chunk_progress(id, 0, 500, Some("abc")).unwrap();

        // same plan again: completed chunk survives
        store.upsert_chunks(id, &plan).unwrap();
        let chunks = store.get_chunks(id).unwrap();
        assert_eq!(chunks[0].state, ChunkState::Completed);
        assert_eq!(chunks[0].written_bytes, 500);
        assert_eq!(chunks[0].tail_hash.as_deref(), Some("abc"));

        // different plan: wiped
        store.upsert_chunks(id, &[(0, 0, 999)]).unwrap();
        let chunks = store.get_chunks(id).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].state, ChunkState::Pending);
    }

    #[test]
    fn test_attempt_log() {
        let store = store();
        let id = add_one(&store);
        let err = EngineError::server(500, "boom");
        store.record_attempt(id, Some(2), 1, &err, 1024).unwrap();
        store.record_attempt(id, Some(2), 2, &err, 2048).unwrap();
        let attempts = store.get_attempts(id).unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].attempt_number, 1);
        assert_eq!(attempts[1].attempt_number, 2);
        assert_eq!(attempts[1].chunk_index, Some(2));
        assert_eq!(attempts[1].error_code, "server");
    }

    #[test]
    fn test_remove_requires_settled_state() {
        let store = store();
        let id = add_one(&store);
        assert!(store.remove(id).is_err());
        store
            .set_state(id, DownloadState::Cancelled, TransitionOpts::default())
            .unwrap();
        store.remove(id).unwrap();
        assert!(store.get(id).is_err());
    }

    #[test]
    fn test_remove_rejects_failed_rows() {
        let store = store();
        let id = add_one(&store);
        store
            .set_state(id, DownloadState::Starting, TransitionOpts::default())
            .unwrap();
        store
            .set_state(
                id,
                DownloadState::Failed,
                TransitionOpts::error("boom", "network"),
            )
            .unwrap();
        // failed still has the retry edge; purge goes through cancel
        assert_eq!(store.remove(id).unwrap_err().kind(), "state");
        store
            .set_state(id, DownloadState::Cancelled, TransitionOpts::default())
            .unwrap();
        store.remove(id).unwrap();
    }

    #[test]
    fn test_remove_cascades_chunks_and_attempts() {
        let store = store();
        let id = add_one(&store);
        store.upsert_chunks(id, &[(0, 0, 999)]).unwrap();
        store
            .record_attempt(id, Some(0), 1, &EngineError::Network("x".into()), 0)
            .unwrap();
        store
            .set_state(id, DownloadState::Cancelled, TransitionOpts::default())
            .unwrap();
        store.remove(id).unwrap();
        assert!(store.get_chunks(id).unwrap().is_empty());
        assert!(store.get_attempts(id).unwrap().is_empty());
    }

    #[test]
    fn test_recover_interrupted() {
        let store = store();
        let id = add_one(&store);
        store
            .set_state(id, DownloadState::Starting, TransitionOpts::default())
            .unwrap();
        store
            .set_state(id, DownloadState::Downloading, TransitionOpts::default())
            .unwrap();
        let recovered = store.recover_interrupted().unwrap();
        assert_eq!(recovered, 1);
        assert_eq!(store.get(id).unwrap().state, DownloadState::Paused);
    }

    #[test]
    fn test_await_overwrite_marker() {
        let store = store();
        let id = add_one(&store);
        store
            .set_state(id, DownloadState::Starting, TransitionOpts::default())
            .unwrap();
        store
            .set_state(id, DownloadState::Paused, TransitionOpts::await_overwrite())
            .unwrap();
        let d = store.get(id).unwrap();
        assert_eq!(d.state, DownloadState::Paused);
        assert_eq!(d.error_code.as_deref(), Some(AWAIT_OVERWRITE));
    }

    #[test]
    fn test_summary_counts() {
        let store = store();
        let a = add_one(&store);
        let _b = add_one(&store);
        store
            .set_state(a, DownloadState::Cancelled, TransitionOpts::default())
            .unwrap();
        let summary = store.summary().unwrap();
        assert_eq!(summary.queued, 1);
        assert_eq!(summary.cancelled, 1);
    }

    #[test]
    fn test_list_by_state() {
        let store = store();
        let _a = add_one(&store);
        let _b = add_one(&store);
        let queued = store.list_by_state(DownloadState::Queued, 10).unwrap();
        assert_eq!(queued.len(), 2);
        let one = store.list_by_state(DownloadState::Queued, 1).unwrap();
        assert_eq!(one.len(), 1);
    }
}
