//! State store trait and SQLite implementation.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use fs4::fs_std::FileExt;
use rusqlite::{Connection, OptionalExtension};

use super::error::StateError;
use super::schema;
use super::types::{
    ErrorKind, MigrationRecord, MigrationRun, MigrationSettings, RecordStatus, ResetScope,
    RunOutcome, StatusCounts,
};
use crate::transfer::AssetKind;

/// Durable record set for one migration run.
///
/// Object-safe so the engine can hold it as `Arc<dyn StateStore>`. Every
/// write is durable when the call returns.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn run(&self) -> Result<MigrationRun, StateError>;

    /// Insert or fully replace the record for `record.source_id`.
    async fn upsert(&self, record: &MigrationRecord) -> Result<(), StateError>;

    /// Upsert several records in one transaction: all or none.
    async fn upsert_many(&self, records: &[MigrationRecord]) -> Result<(), StateError>;

    async fn get(&self, source_id: &str) -> Result<Option<MigrationRecord>, StateError>;

    /// Records in ascending `source_id` order, optionally filtered by status.
    async fn list(&self, status: Option<RecordStatus>)
        -> Result<Vec<MigrationRecord>, StateError>;

    /// Records scheduled under `album_id`, ascending `source_id`.
    async fn list_album(&self, album_id: &str) -> Result<Vec<MigrationRecord>, StateError>;

    async fn counts(&self) -> Result<StatusCounts, StateError>;

    /// Move `failed_permanent` records back to `pending` with zero attempts.
    /// Resetting one member of a live-photo pair resets its partner too.
    ///
    /// Returns the number of records reset.
    async fn reset_permanent(&self, scope: &ResetScope) -> Result<u64, StateError>;

    async fn album_destination(&self, source_album_id: &str)
        -> Result<Option<String>, StateError>;

    async fn set_album_destination(
        &self,
        source_album_id: &str,
        name: &str,
        destination_album_id: &str,
    ) -> Result<(), StateError>;

    /// Record that `source_ids` belong to `source_album_id`. Idempotent.
    async fn add_members(
        &self,
        source_album_id: &str,
        source_ids: &[String],
    ) -> Result<(), StateError>;

    /// Completed members not yet added to the destination album, as
    /// `(source_id, destination_id)`.
    async fn unlinked_members(
        &self,
        source_album_id: &str,
    ) -> Result<Vec<(String, String)>, StateError>;

    async fn mark_linked(
        &self,
        source_album_id: &str,
        source_ids: &[String],
    ) -> Result<(), StateError>;

    async fn finish_run(&self, outcome: RunOutcome) -> Result<(), StateError>;
}

/// SQLite implementation, one database file per run.
pub struct SqliteStateStore {
    /// Wrapped in Mutex because rusqlite::Connection is not Sync.
    conn: Mutex<Connection>,
    /// Path to the database file (for error messages).
    path: PathBuf,
    run_id: String,
    /// Held for the store's lifetime; dropping it releases the lock.
    _lock: Option<std::fs::File>,
}

impl std::fmt::Debug for SqliteStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStateStore")
            .field("path", &self.path)
            .field("run_id", &self.run_id)
            .finish_non_exhaustive()
    }
}

const RECORD_COLUMNS: &str = "source_id, album_id, kind, pair_id, original_filename, size_bytes, \
     content_hash, declared_checksum, status, attempt_count, last_error_kind, last_error, \
     destination_id, staged_destination_id, local_temp_path, metadata_warning, updated_at";

const UPSERT_RECORD: &str = r#"
    INSERT INTO records (source_id, album_id, kind, pair_id, original_filename, size_bytes,
        content_hash, declared_checksum, status, attempt_count, last_error_kind, last_error,
        destination_id, staged_destination_id, local_temp_path, metadata_warning, updated_at)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
    ON CONFLICT(source_id) DO UPDATE SET
        album_id = excluded.album_id,
        kind = excluded.kind,
        pair_id = excluded.pair_id,
        original_filename = excluded.original_filename,
        size_bytes = excluded.size_bytes,
        content_hash = excluded.content_hash,
        declared_checksum = excluded.declared_checksum,
        status = excluded.status,
        attempt_count = excluded.attempt_count,
        last_error_kind = excluded.last_error_kind,
        last_error = excluded.last_error,
        destination_id = excluded.destination_id,
        staged_destination_id = excluded.staged_destination_id,
        local_temp_path = excluded.local_temp_path,
        metadata_warning = excluded.metadata_warning,
        updated_at = excluded.updated_at
"#;

/// Run ids become file names, so keep them to a portable character set.
pub fn validate_run_id(run_id: &str) -> Result<(), StateError> {
    let ok = !run_id.is_empty()
        && !run_id.starts_with('.')
        && run_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(StateError::InvalidRunId(run_id.to_string()))
    }
}

pub fn db_path(dir: &Path, run_id: &str) -> PathBuf {
    dir.join(format!("{run_id}.db"))
}

fn acquire_lock(dir: &Path, run_id: &str) -> Result<std::fs::File, StateError> {
    let lock_path = dir.join(format!("{run_id}.lock"));
    let file = std::fs::File::create(&lock_path).map_err(|e| StateError::Lock {
        path: lock_path.clone(),
        source: e,
    })?;
    file.try_lock_exclusive()
        .map_err(|_| StateError::Locked(lock_path))?;
    Ok(file)
}

fn classify_open_error(path: &Path, e: rusqlite::Error) -> StateError {
    match e.sqlite_error_code() {
        Some(rusqlite::ErrorCode::NotADatabase) | Some(rusqlite::ErrorCode::DatabaseCorrupt) => {
            StateError::Corrupt {
                path: path.to_path_buf(),
                detail: e.to_string(),
            }
        }
        _ => StateError::Open {
            path: path.to_path_buf(),
            source: e,
        },
    }
}

/// Open the file with durable settings. Every commit reaches disk before
/// returning.
fn open_connection(path: &Path) -> Result<Connection, StateError> {
    let conn = Connection::open(path).map_err(|e| classify_open_error(path, e))?;
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(|e| classify_open_error(path, e))?;
    conn.pragma_update(None, "synchronous", "FULL")
        .map_err(|e| classify_open_error(path, e))?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(|e| classify_open_error(path, e))?;
    Ok(conn)
}

fn insert_run(conn: &Connection, run: &MigrationRun) -> Result<(), StateError> {
    let album_ids = serde_json::to_string(&run.album_ids)
        .map_err(|e| StateError::Query(e.to_string()))?;
    let settings = serde_json::to_string(&run.settings)
        .map_err(|e| StateError::Query(e.to_string()))?;
    conn.execute(
        "INSERT INTO runs (run_id, album_ids, created_at, settings) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![run.run_id, album_ids, run.created_at.timestamp(), settings],
    )
    .map_err(StateError::query)?;
    Ok(())
}

/// Execute `f` inside BEGIN/COMMIT, rolling back on any error.
fn in_transaction<T>(
    conn: &Connection,
    f: impl FnOnce(&Connection) -> Result<T, StateError>,
) -> Result<T, StateError> {
    conn.execute("BEGIN TRANSACTION", [])
        .map_err(StateError::query)?;
    match f(conn) {
        Ok(value) => {
            conn.execute("COMMIT", []).map_err(StateError::query)?;
            Ok(value)
        }
        Err(e) => {
            let _ = conn.execute("ROLLBACK", []);
            Err(e)
        }
    }
}

fn timestamp(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0)
        .single()
        .unwrap_or(DateTime::UNIX_EPOCH)
}

fn write_record(
    stmt: &mut rusqlite::CachedStatement<'_>,
    record: &MigrationRecord,
    now: i64,
) -> Result<(), StateError> {
    stmt.execute(rusqlite::params![
        record.source_id,
        record.album_id,
        record.kind.as_str(),
        record.pair_id,
        record.original_filename,
        record.size_bytes as i64,
        record.content_hash,
        record.declared_checksum,
        record.status.as_str(),
        record.attempt_count as i64,
        record.last_error_kind.map(|k| k.as_str()),
        record.last_error,
        record.destination_id,
        record.staged_destination_id,
        record
            .local_temp_path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned()),
        record.metadata_warning,
        now,
    ])
    .map_err(StateError::query)?;
    Ok(())
}

impl SqliteStateStore {
    /// Create a new run and its database under `dir`.
    pub async fn create(
        dir: &Path,
        run_id: &str,
        album_ids: Vec<String>,
        settings: MigrationSettings,
    ) -> Result<(Self, MigrationRun), StateError> {
        validate_run_id(run_id)?;
        let dir = dir.to_path_buf();
        let run = MigrationRun {
            run_id: run_id.to_string(),
            album_ids,
            created_at: Utc::now(),
            settings,
            finished_at: None,
            outcome: None,
        };
        let run_clone = run.clone();

        let store = tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&dir).map_err(|e| StateError::Lock {
                path: dir.clone(),
                source: e,
            })?;
            let lock = acquire_lock(&dir, &run_clone.run_id)?;
            let path = db_path(&dir, &run_clone.run_id);
            if path.exists() {
                return Err(StateError::RunExists(run_clone.run_id.clone()));
            }
            let conn = open_connection(&path)?;
            schema::migrate(&conn)?;
            insert_run(&conn, &run_clone)?;
            tracing::debug!(run_id = %run_clone.run_id, "Created state database {}", path.display());
            Ok::<_, StateError>(Self {
                conn: Mutex::new(conn),
                path,
                run_id: run_clone.run_id,
                _lock: Some(lock),
            })
        })
        .await??;

        Ok((store, run))
    }

    /// Re-open an existing run.
    ///
    /// Runs SQLite's integrity check first; any problem is reported as
    /// [`StateError::Corrupt`] and the file is left untouched.
    pub async fn load(dir: &Path, run_id: &str) -> Result<(Self, MigrationRun), StateError> {
        validate_run_id(run_id)?;
        let dir = dir.to_path_buf();
        let run_id = run_id.to_string();

        let store = tokio::task::spawn_blocking(move || {
            let path = db_path(&dir, &run_id);
            if !path.exists() {
                return Err(StateError::RunNotFound {
                    run_id,
                    dir,
                });
            }
            let lock = acquire_lock(&dir, &run_id)?;
            let conn = open_connection(&path)?;
            let problems = schema::quick_check(&conn).map_err(|e| StateError::Corrupt {
                path: path.clone(),
                detail: e.to_string(),
            })?;
            if !problems.is_empty() {
                return Err(StateError::Corrupt {
                    path,
                    detail: problems.join("; "),
                });
            }
            schema::migrate(&conn)?;
            Ok::<_, StateError>(Self {
                conn: Mutex::new(conn),
                path,
                run_id,
                _lock: Some(lock),
            })
        })
        .await??;

        let run = store.run().await?;
        Ok((store, run))
    }

    /// Open an in-memory store with a fresh run (for testing).
    #[cfg(test)]
    pub fn open_in_memory(settings: MigrationSettings) -> Result<Self, StateError> {
        let conn = Connection::open_in_memory().map_err(|e| StateError::Open {
            path: PathBuf::from(":memory:"),
            source: e,
        })?;
        schema::migrate(&conn)?;
        insert_run(
            &conn,
            &MigrationRun {
                run_id: "test-run".into(),
                album_ids: Vec::new(),
                created_at: Utc::now(),
                settings,
                finished_at: None,
                outcome: None,
            },
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
            run_id: "test-run".into(),
            _lock: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StateError> {
        self.conn
            .lock()
            .map_err(|e| StateError::Query(e.to_string()))
    }

    fn corrupt(&self, detail: impl Into<String>) -> StateError {
        StateError::Corrupt {
            path: self.path.clone(),
            detail: detail.into(),
        }
    }

    /// Convert a row selected with [`RECORD_COLUMNS`].
    fn row_to_record(&self, row: &rusqlite::Row<'_>) -> Result<MigrationRecord, StateError> {
        let get_err = |e: rusqlite::Error| self.corrupt(e.to_string());

        let source_id: String = row.get(0).map_err(get_err)?;
        let kind_str: String = row.get(2).map_err(get_err)?;
        let status_str: String = row.get(8).map_err(get_err)?;
        let error_kind_str: Option<String> = row.get(10).map_err(get_err)?;

        let kind = AssetKind::from_str(&kind_str)
            .ok_or_else(|| self.corrupt(format!("record {source_id}: unknown kind '{kind_str}'")))?;
        let status = RecordStatus::from_str(&status_str).ok_or_else(|| {
            self.corrupt(format!("record {source_id}: unknown status '{status_str}'"))
        })?;
        let last_error_kind = match error_kind_str {
            Some(s) => Some(ErrorKind::from_str(&s).ok_or_else(|| {
                self.corrupt(format!("record {source_id}: unknown error kind '{s}'"))
            })?),
            None => None,
        };
        let size_bytes: i64 = row.get(5).map_err(get_err)?;
        let attempt_count: i64 = row.get(9).map_err(get_err)?;
        let local_temp_path: Option<String> = row.get(14).map_err(get_err)?;
        let updated_at: i64 = row.get(16).map_err(get_err)?;

        Ok(MigrationRecord {
            album_id: row.get(1).map_err(get_err)?,
            kind,
            pair_id: row.get(3).map_err(get_err)?,
            original_filename: row.get(4).map_err(get_err)?,
            size_bytes: size_bytes.max(0) as u64,
            content_hash: row.get(6).map_err(get_err)?,
            declared_checksum: row.get(7).map_err(get_err)?,
            status,
            attempt_count: attempt_count.max(0) as u32,
            last_error_kind,
            last_error: row.get(11).map_err(get_err)?,
            destination_id: row.get(12).map_err(get_err)?,
            staged_destination_id: row.get(13).map_err(get_err)?,
            local_temp_path: local_temp_path.map(PathBuf::from),
            metadata_warning: row.get(15).map_err(get_err)?,
            updated_at: timestamp(updated_at),
            source_id,
        })
    }

    fn query_records(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<MigrationRecord>, StateError> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare_cached(sql).map_err(StateError::query)?;
        let mut rows = stmt.query(params).map_err(StateError::query)?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().map_err(StateError::query)? {
            records.push(self.row_to_record(row)?);
        }
        Ok(records)
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn run(&self) -> Result<MigrationRun, StateError> {
        let conn = self.lock_conn()?;
        let row: Option<(String, i64, String, Option<i64>, Option<String>)> = conn
            .query_row(
                "SELECT album_ids, created_at, settings, finished_at, outcome FROM runs WHERE run_id = ?1",
                [&self.run_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )
            .optional()
            .map_err(StateError::query)?;

        let Some((album_ids, created_at, settings, finished_at, outcome)) = row else {
            return Err(self.corrupt(format!("missing run row for '{}'", self.run_id)));
        };
        let album_ids: Vec<String> = serde_json::from_str(&album_ids)
            .map_err(|e| self.corrupt(format!("run album_ids: {e}")))?;
        let settings: MigrationSettings = serde_json::from_str(&settings)
            .map_err(|e| self.corrupt(format!("run settings: {e}")))?;
        let outcome = match outcome {
            Some(s) => Some(
                RunOutcome::from_str(&s)
                    .ok_or_else(|| self.corrupt(format!("unknown run outcome '{s}'")))?,
            ),
            None => None,
        };

        Ok(MigrationRun {
            run_id: self.run_id.clone(),
            album_ids,
            created_at: timestamp(created_at),
            settings,
            finished_at: finished_at.map(timestamp),
            outcome,
        })
    }

    async fn upsert(&self, record: &MigrationRecord) -> Result<(), StateError> {
        let now = Utc::now().timestamp();
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare_cached(UPSERT_RECORD).map_err(StateError::query)?;
        write_record(&mut stmt, record, now)
    }

    async fn upsert_many(&self, records: &[MigrationRecord]) -> Result<(), StateError> {
        if records.is_empty() {
            return Ok(());
        }
        let now = Utc::now().timestamp();
        let conn = self.lock_conn()?;
        in_transaction(&conn, |conn| {
            let mut stmt = conn.prepare_cached(UPSERT_RECORD).map_err(StateError::query)?;
            for record in records {
                write_record(&mut stmt, record, now)?;
            }
            Ok(())
        })
    }

    async fn get(&self, source_id: &str) -> Result<Option<MigrationRecord>, StateError> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM records WHERE source_id = ?1");
        Ok(self.query_records(&sql, &[&source_id])?.into_iter().next())
    }

    async fn list(
        &self,
        status: Option<RecordStatus>,
    ) -> Result<Vec<MigrationRecord>, StateError> {
        match status {
            Some(status) => {
                let sql = format!(
                    "SELECT {RECORD_COLUMNS} FROM records WHERE status = ?1 ORDER BY source_id"
                );
                self.query_records(&sql, &[&status.as_str()])
            }
            None => {
                let sql = format!("SELECT {RECORD_COLUMNS} FROM records ORDER BY source_id");
                self.query_records(&sql, &[])
            }
        }
    }

    async fn list_album(&self, album_id: &str) -> Result<Vec<MigrationRecord>, StateError> {
        let sql =
            format!("SELECT {RECORD_COLUMNS} FROM records WHERE album_id = ?1 ORDER BY source_id");
        self.query_records(&sql, &[&album_id])
    }

    async fn counts(&self) -> Result<StatusCounts, StateError> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare_cached("SELECT status, COUNT(*) FROM records GROUP BY status")
            .map_err(StateError::query)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(StateError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StateError::query)?;

        let mut counts = StatusCounts::default();
        for (status, n) in rows {
            let status = RecordStatus::from_str(&status)
                .ok_or_else(|| self.corrupt(format!("unknown status '{status}'")))?;
            counts.add(status, n as u64);
        }
        Ok(counts)
    }

    async fn reset_permanent(&self, scope: &ResetScope) -> Result<u64, StateError> {
        let now = Utc::now().timestamp();
        let conn = self.lock_conn()?;
        let rows = match scope {
            ResetScope::AllFailed => conn.execute(
                "UPDATE records SET status = 'pending', attempt_count = 0, last_error_kind = NULL, \
                 last_error = NULL, updated_at = ?1 WHERE status = 'failed_permanent'",
                [now],
            ),
            ResetScope::One(source_id) => conn.execute(
                "UPDATE records SET status = 'pending', attempt_count = 0, last_error_kind = NULL, \
                 last_error = NULL, updated_at = ?1 \
                 WHERE status = 'failed_permanent' AND (source_id = ?2 OR pair_id IN \
                     (SELECT pair_id FROM records WHERE source_id = ?2 AND pair_id IS NOT NULL))",
                rusqlite::params![now, source_id],
            ),
        }
        .map_err(StateError::query)?;
        Ok(rows as u64)
    }

    async fn album_destination(
        &self,
        source_album_id: &str,
    ) -> Result<Option<String>, StateError> {
        let conn = self.lock_conn()?;
        let id: Option<Option<String>> = conn
            .query_row(
                "SELECT destination_album_id FROM albums WHERE source_album_id = ?1",
                [source_album_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(StateError::query)?;
        Ok(id.flatten())
    }

    async fn set_album_destination(
        &self,
        source_album_id: &str,
        name: &str,
        destination_album_id: &str,
    ) -> Result<(), StateError> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO albums (source_album_id, name, destination_album_id) VALUES (?1, ?2, ?3) \
             ON CONFLICT(source_album_id) DO UPDATE SET name = excluded.name, \
             destination_album_id = excluded.destination_album_id",
            rusqlite::params![source_album_id, name, destination_album_id],
        )
        .map_err(StateError::query)?;
        Ok(())
    }

    async fn add_members(
        &self,
        source_album_id: &str,
        source_ids: &[String],
    ) -> Result<(), StateError> {
        if source_ids.is_empty() {
            return Ok(());
        }
        let conn = self.lock_conn()?;
        in_transaction(&conn, |conn| {
            let mut stmt = conn
                .prepare_cached(
                    "INSERT OR IGNORE INTO album_members (source_album_id, source_id) VALUES (?1, ?2)",
                )
                .map_err(StateError::query)?;
            for source_id in source_ids {
                stmt.execute([source_album_id, source_id.as_str()])
                    .map_err(StateError::query)?;
            }
            Ok(())
        })
    }

    async fn unlinked_members(
        &self,
        source_album_id: &str,
    ) -> Result<Vec<(String, String)>, StateError> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare_cached(
                "SELECT m.source_id, r.destination_id FROM album_members m \
                 JOIN records r ON r.source_id = m.source_id \
                 WHERE m.source_album_id = ?1 AND m.linked = 0 \
                   AND r.status = 'completed' AND r.destination_id IS NOT NULL \
                 ORDER BY m.source_id",
            )
            .map_err(StateError::query)?;
        let rows = stmt
            .query_map([source_album_id], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(StateError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StateError::query)?;
        Ok(rows)
    }

    async fn mark_linked(
        &self,
        source_album_id: &str,
        source_ids: &[String],
    ) -> Result<(), StateError> {
        if source_ids.is_empty() {
            return Ok(());
        }
        let conn = self.lock_conn()?;
        in_transaction(&conn, |conn| {
            let mut stmt = conn
                .prepare_cached(
                    "UPDATE album_members SET linked = 1 WHERE source_album_id = ?1 AND source_id = ?2",
                )
                .map_err(StateError::query)?;
            for source_id in source_ids {
                stmt.execute([source_album_id, source_id.as_str()])
                    .map_err(StateError::query)?;
            }
            Ok(())
        })
    }

    async fn finish_run(&self, outcome: RunOutcome) -> Result<(), StateError> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE runs SET finished_at = ?1, outcome = ?2 WHERE run_id = ?3",
            rusqlite::params![Utc::now().timestamp(), outcome.as_str(), self.run_id],
        )
        .map_err(StateError::query)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::memory::{photo, video};

    fn record(id: &str, album: &str) -> MigrationRecord {
        MigrationRecord::new_pending(&photo(id, None), album)
    }

    fn store() -> SqliteStateStore {
        SqliteStateStore::open_in_memory(MigrationSettings::default()).unwrap()
    }

    #[tokio::test]
    async fn test_create_then_load_round_trips_run() {
        let dir = tempfile::tempdir().unwrap();
        let settings = MigrationSettings {
            batch_size: 7,
            ..Default::default()
        };
        let (store, run) = SqliteStateStore::create(
            dir.path(),
            "run-1",
            vec!["album-a".into()],
            settings.clone(),
        )
        .await
        .unwrap();
        assert!(dir.path().join("run-1.db").exists());
        store.upsert(&record("a1", "album-a")).await.unwrap();
        drop(store);

        let (store, loaded) = SqliteStateStore::load(dir.path(), "run-1").await.unwrap();
        assert_eq!(loaded.album_ids, run.album_ids);
        assert_eq!(loaded.settings, settings);
        assert_eq!(loaded.outcome, None);
        assert!(store.get("a1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_load_missing_run() {
        let dir = tempfile::tempdir().unwrap();
        let err = SqliteStateStore::load(dir.path(), "nope").await.unwrap_err();
        assert!(matches!(err, StateError::RunNotFound { .. }));
    }

    #[tokio::test]
    async fn test_create_existing_run_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) =
            SqliteStateStore::create(dir.path(), "dup", vec![], MigrationSettings::default())
                .await
                .unwrap();
        drop(store);
        let err =
            SqliteStateStore::create(dir.path(), "dup", vec![], MigrationSettings::default())
                .await
                .unwrap_err();
        assert!(matches!(err, StateError::RunExists(_)));
    }

    #[tokio::test]
    async fn test_second_open_is_locked_out() {
        let dir = tempfile::tempdir().unwrap();
        let (_store, _) =
            SqliteStateStore::create(dir.path(), "busy", vec![], MigrationSettings::default())
                .await
                .unwrap();
        let err = SqliteStateStore::load(dir.path(), "busy").await.unwrap_err();
        assert!(matches!(err, StateError::Locked(_)));
    }

    #[tokio::test]
    async fn test_invalid_run_id() {
        let dir = tempfile::tempdir().unwrap();
        for bad in ["", "../escape", "a/b", ".hidden"] {
            let err = SqliteStateStore::load(dir.path(), bad).await.unwrap_err();
            assert!(matches!(err, StateError::InvalidRunId(_)), "{bad}");
        }
    }

    #[tokio::test]
    async fn test_garbage_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("junk.db"), vec![0x42u8; 4096]).unwrap();
        let err = SqliteStateStore::load(dir.path(), "junk").await.unwrap_err();
        assert!(matches!(err, StateError::Corrupt { .. }), "got {err}");
    }

    #[tokio::test]
    async fn test_unknown_status_is_corrupt() {
        let store = store();
        store.upsert(&record("a1", "album")).await.unwrap();
        store
            .lock_conn()
            .unwrap()
            .execute("UPDATE records SET status = 'bogus'", [])
            .unwrap();
        assert!(matches!(
            store.get("a1").await,
            Err(StateError::Corrupt { .. })
        ));
        assert!(matches!(store.counts().await, Err(StateError::Corrupt { .. })));
    }

    #[tokio::test]
    async fn test_upsert_replaces_all_fields() {
        let store = store();
        let mut rec = record("a1", "album");
        store.upsert(&rec).await.unwrap();

        rec.status = RecordStatus::FailedTransient;
        rec.attempt_count = 2;
        rec.last_error_kind = Some(ErrorKind::ChecksumMismatch);
        rec.last_error = Some("digest differs".into());
        rec.local_temp_path = Some(PathBuf::from("/scratch/a1/a1.jpg"));
        rec.content_hash = Some("ab".repeat(32));
        store.upsert(&rec).await.unwrap();

        let got = store.get("a1").await.unwrap().unwrap();
        assert_eq!(got.status, RecordStatus::FailedTransient);
        assert_eq!(got.attempt_count, 2);
        assert_eq!(got.last_error_kind, Some(ErrorKind::ChecksumMismatch));
        assert_eq!(got.local_temp_path, rec.local_temp_path);
        assert_eq!(got.content_hash, rec.content_hash);
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_is_ordered_and_filtered() {
        let store = store();
        store
            .upsert_many(&[
                record("c", "x"),
                record("a", "x"),
                record("b", "y").with_status(RecordStatus::Completed),
            ])
            .await
            .unwrap();

        let all: Vec<_> = store
            .list(None)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.source_id)
            .collect();
        assert_eq!(all, vec!["a", "b", "c"]);

        let pending = store.list(Some(RecordStatus::Pending)).await.unwrap();
        assert_eq!(pending.len(), 2);

        let album_x: Vec<_> = store
            .list_album("x")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.source_id)
            .collect();
        assert_eq!(album_x, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_upsert_many_is_atomic() {
        let store = store();
        store.upsert(&record("a", "x")).await.unwrap();
        // A rejected second row must roll back the first.
        store
            .lock_conn()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER reject_b BEFORE INSERT ON records WHEN NEW.source_id = 'b' \
                 BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
            )
            .unwrap();
        let done = record("a", "x").with_status(RecordStatus::Completed);
        let result = store.upsert_many(&[done, record("b", "x")]).await;
        assert!(result.is_err());
        let a = store.get("a").await.unwrap().unwrap();
        assert_eq!(a.status, RecordStatus::Pending);
    }

    #[tokio::test]
    async fn test_counts() {
        let store = store();
        store
            .upsert_many(&[
                record("a", "x"),
                record("b", "x").with_status(RecordStatus::Uploading),
                record("c", "x").with_status(RecordStatus::Completed),
                record("d", "x").with_status(RecordStatus::FailedPermanent),
            ])
            .await
            .unwrap();
        let counts = store.counts().await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.in_flight, 1);
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.failed_permanent, 1);
        assert_eq!(counts.total(), 4);
    }

    #[tokio::test]
    async fn test_reset_permanent_one_resets_partner() {
        let store = store();
        let mut p = MigrationRecord::new_pending(&photo("p", Some("pair")), "x");
        let mut v = MigrationRecord::new_pending(&video("v", Some("pair")), "x");
        let mut other = record("o", "x");
        for r in [&mut p, &mut v, &mut other] {
            r.status = RecordStatus::FailedPermanent;
            r.attempt_count = 3;
            r.last_error_kind = Some(ErrorKind::PairedAssetFailed);
        }
        store.upsert_many(&[p, v, other]).await.unwrap();

        let n = store
            .reset_permanent(&ResetScope::One("p".into()))
            .await
            .unwrap();
        assert_eq!(n, 2);
        let v = store.get("v").await.unwrap().unwrap();
        assert_eq!(v.status, RecordStatus::Pending);
        assert_eq!(v.attempt_count, 0);
        assert_eq!(v.last_error_kind, None);
        let o = store.get("o").await.unwrap().unwrap();
        assert_eq!(o.status, RecordStatus::FailedPermanent);

        let n = store.reset_permanent(&ResetScope::AllFailed).await.unwrap();
        assert_eq!(n, 1);
    }

    #[tokio::test]
    async fn test_album_mapping_and_membership() {
        let store = store();
        assert_eq!(store.album_destination("src-1").await.unwrap(), None);
        store
            .set_album_destination("src-1", "Holiday", "dst-1")
            .await
            .unwrap();
        assert_eq!(
            store.album_destination("src-1").await.unwrap().as_deref(),
            Some("dst-1")
        );

        let mut done = record("a", "src-1").with_status(RecordStatus::Completed);
        done.destination_id = Some("dest-a".into());
        store
            .upsert_many(&[done, record("b", "src-1")])
            .await
            .unwrap();
        let ids = vec!["a".to_string(), "b".to_string()];
        store.add_members("src-1", &ids).await.unwrap();
        store.add_members("src-1", &ids).await.unwrap();

        let unlinked = store.unlinked_members("src-1").await.unwrap();
        assert_eq!(unlinked, vec![("a".to_string(), "dest-a".to_string())]);

        store.mark_linked("src-1", &["a".to_string()]).await.unwrap();
        assert!(store.unlinked_members("src-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_finish_run_records_outcome() {
        let store = store();
        store.finish_run(RunOutcome::Interrupted).await.unwrap();
        let run = store.run().await.unwrap();
        assert_eq!(run.outcome, Some(RunOutcome::Interrupted));
        assert!(run.finished_at.is_some());
    }
}
