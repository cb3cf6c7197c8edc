//! Embedded SQLite store for every memory record kind.
//!
//! One writer connection behind a timed lock, plus a pool of read-only
//! connections. The journal runs in WAL mode so readers never wait on the
//! writer; both waits are bounded by the configured busy timeout and surface
//! as [`Error::Busy`] when exceeded.
//!
//! Storage root layout:
//!
//! ```text
//! <root>/mnemo.db
//! <root>/backups/<timestamp>.db
//! <root>/vector_indices/manifest.json
//! ```

pub mod consolidation;
pub mod episodes;
pub mod mental_models;
pub mod messages;
pub mod migrations;
mod pool;
pub mod procedures;
pub mod records;
pub mod stats;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, DatabaseName, OpenFlags, Transaction, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use pool::ReaderPool;

/// Store file name under the storage root.
pub const DB_FILE: &str = "mnemo.db";
/// Snapshot directory under the storage root.
pub const BACKUP_DIR: &str = "backups";
/// Vector index metadata directory under the storage root.
pub const VECTOR_DIR: &str = "vector_indices";

const MANIFEST_FILE: &str = "manifest.json";

/// Options for opening a [`Database`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Bound on every lock wait (SQLite busy handler, writer lock, reader pool).
    pub busy_timeout: Duration,
    /// Number of read-only connections.
    pub pool_size: usize,
    /// Embedding model recorded in the vector manifest.
    pub embedding_model: String,
    /// Dimension every stored vector must have.
    pub embedding_dimension: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_secs(30),
            pool_size: 16,
            embedding_model: "hashing-bow-v1".to_string(),
            embedding_dimension: 384,
        }
    }
}

/// Contents of `vector_indices/manifest.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorManifest {
    pub model: String,
    pub dimension: usize,
    pub created_at: DateTime<Utc>,
}

/// Result of a WAL checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CheckpointReport {
    pub wal_frames: i64,
    pub checkpointed_frames: i64,
}

/// Database handle shared by the async [`crate::store::Store`] facade.
pub struct Database {
    root: PathBuf,
    path: PathBuf,
    writer: Mutex<Connection>,
    readers: ReaderPool,
    options: StoreOptions,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .field("pool_size", &self.readers.size())
            .finish()
    }
}

impl Database {
    /// Open (or create) the store under `root`.
    ///
    /// Fails with [`Error::Corrupt`] when the file fails its integrity check
    /// and with [`Error::Invalid`] when the vector manifest records a
    /// different embedding dimension.
    pub fn open(root: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        if options.pool_size == 0 {
            return Err(Error::invalid("pool_size must be at least 1"));
        }
        if options.embedding_dimension == 0 {
            return Err(Error::invalid("embedding_dimension must be at least 1"));
        }

        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(root.join(BACKUP_DIR))?;
        std::fs::create_dir_all(root.join(VECTOR_DIR))?;
        let path = root.join(DB_FILE);

        let writer = Connection::open(&path)?;
        configure_writer(&writer, options.busy_timeout)?;
        check_integrity(&writer)?;
        migrations::run_migrations(&writer)?;
        check_manifest(&root, &options)?;

        let mut readers = Vec::with_capacity(options.pool_size);
        for _ in 0..options.pool_size {
            let conn = Connection::open_with_flags(
                &path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            conn.busy_timeout(options.busy_timeout)?;
            readers.push(conn);
        }

        tracing::info!(
            path = %path.display(),
            pool_size = options.pool_size,
            dimension = options.embedding_dimension,
            "Opened memory store"
        );

        Ok(Self {
            readers: ReaderPool::new(readers, options.busy_timeout),
            writer: Mutex::new(writer),
            root,
            path,
            options,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// Embedding dimension enforced by the vector index.
    pub fn dimension(&self) -> usize {
        self.options.embedding_dimension
    }

    /// Run `f` against a pooled reader inside one read transaction.
    pub fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.readers.acquire()?;
        let tx = conn.unchecked_transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Run `f` as one `IMMEDIATE` write transaction.
    ///
    /// The cancel token is checked before the writer lock is taken and again
    /// right before commit; a cancelled unit rolls back whole.
    pub fn write<T, F>(&self, cancel: Option<&CancelToken>, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        if cancel.is_some_and(CancelToken::is_cancelled) {
            return Err(Error::Cancelled);
        }

        let mut conn = self.lock_writer()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;

        if cancel.is_some_and(CancelToken::is_cancelled) {
            tx.rollback()?;
            tracing::debug!("Rolled back cancelled write");
            return Err(Error::Cancelled);
        }

        tx.commit()?;
        Ok(value)
    }

    fn lock_writer(&self) -> Result<parking_lot::MutexGuard<'_, Connection>> {
        self.writer
            .try_lock_for(self.options.busy_timeout)
            .ok_or_else(|| {
                Error::Busy(format!(
                    "writer lock not acquired within {}ms",
                    self.options.busy_timeout.as_millis()
                ))
            })
    }

    /// Check connectivity.
    pub fn ping(&self) -> Result<()> {
        self.read(|conn| {
            conn.execute_batch("SELECT 1")?;
            Ok(())
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Durability
    // ─────────────────────────────────────────────────────────────────────────

    /// Fold the WAL into the main file and truncate it.
    ///
    /// An out-of-band copy of `mnemo.db` is only valid right after this returns Ok.
    pub fn checkpoint(&self) -> Result<CheckpointReport> {
        let conn = self.lock_writer()?;
        checkpoint_truncate(&conn)
    }

    /// Checkpoint, then write a compacted snapshot into `backups/`.
    pub fn backup(&self) -> Result<PathBuf> {
        let conn = self.lock_writer()?;
        checkpoint_truncate(&conn)?;

        let name = format!("mnemo-{}.db", Utc::now().format("%Y%m%dT%H%M%S%.3fZ"));
        let target = self.root.join(BACKUP_DIR).join(name);
        if target.exists() {
            return Err(Error::Busy(format!(
                "snapshot {} already exists",
                target.display()
            )));
        }

        conn.execute("VACUUM INTO ?1", params![target.to_string_lossy()])?;
        tracing::info!(snapshot = %target.display(), "Wrote store snapshot");
        Ok(target)
    }

    /// Replace the live contents with `snapshot` through the SQLite backup API.
    ///
    /// The snapshot is integrity-checked first; the live store is untouched
    /// when that check fails.
    pub fn restore(&self, snapshot: impl AsRef<Path>) -> Result<CheckpointReport> {
        let snapshot = snapshot.as_ref();
        if !snapshot.is_file() {
            return Err(Error::not_found("snapshot", snapshot.display().to_string()));
        }

        {
            let source = Connection::open_with_flags(snapshot, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
            check_integrity(&source)?;
            let version = migrations::schema_version(&source)?;
            if version > migrations::SCHEMA_VERSION {
                return Err(Error::invalid(format!(
                    "snapshot schema version {} is newer than supported version {}",
                    version,
                    migrations::SCHEMA_VERSION
                )));
            }
        }

        let mut conn = self.lock_writer()?;
        conn.restore(
            DatabaseName::Main,
            snapshot,
            None::<fn(rusqlite::backup::Progress)>,
        )?;
        configure_writer(&conn, self.options.busy_timeout)?;
        migrations::run_migrations(&conn)?;
        let report = checkpoint_truncate(&conn)?;

        tracing::info!(snapshot = %snapshot.display(), "Restored store from snapshot");
        Ok(report)
    }

    /// List snapshots in `backups/`, oldest first.
    pub fn list_backups(&self) -> Result<Vec<PathBuf>> {
        let mut snapshots: Vec<PathBuf> = std::fs::read_dir(self.root.join(BACKUP_DIR))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "db"))
            .collect();
        snapshots.sort();
        Ok(snapshots)
    }

    /// Full `PRAGMA integrity_check` on the live store.
    pub fn integrity_check(&self) -> Result<()> {
        self.read(|conn| {
            let result: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
            if result != "ok" {
                return Err(Error::Corrupt(result));
            }
            Ok(())
        })
    }

    /// Vector manifest written on first open.
    pub fn manifest(&self) -> Result<VectorManifest> {
        read_manifest(&self.root)?
            .ok_or_else(|| Error::not_found("vector manifest", self.root.display().to_string()))
    }
}

fn configure_writer(conn: &Connection, busy_timeout: Duration) -> Result<()> {
    conn.busy_timeout(busy_timeout)?;
    let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        tracing::warn!(mode = %mode, "Store did not switch to WAL journal mode");
    }
    conn.execute_batch("PRAGMA synchronous = NORMAL; PRAGMA foreign_keys = ON;")?;
    Ok(())
}

fn check_integrity(conn: &Connection) -> Result<()> {
    let result: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
    if result != "ok" {
        tracing::error!(result = %result, "Store failed integrity check");
        return Err(Error::Corrupt(result));
    }
    Ok(())
}

fn checkpoint_truncate(conn: &Connection) -> Result<CheckpointReport> {
    let (busy, wal_frames, checkpointed_frames): (i64, i64, i64) =
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?;
    if busy != 0 {
        return Err(Error::Busy("checkpoint blocked by active readers".into()));
    }
    tracing::debug!(wal_frames, checkpointed_frames, "Checkpointed WAL");
    Ok(CheckpointReport {
        wal_frames,
        checkpointed_frames,
    })
}

fn read_manifest(root: &Path) -> Result<Option<VectorManifest>> {
    let path = root.join(VECTOR_DIR).join(MANIFEST_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path)?;
    Ok(Some(serde_json::from_str(&content)?))
}

fn check_manifest(root: &Path, options: &StoreOptions) -> Result<()> {
    match read_manifest(root)? {
        Some(manifest) if manifest.dimension != options.embedding_dimension => {
            Err(Error::invalid(format!(
                "store vectors have dimension {} ({}), configured embedder produces {}",
                manifest.dimension, manifest.model, options.embedding_dimension
            )))
        }
        Some(manifest) => {
            if manifest.model != options.embedding_model {
                tracing::warn!(
                    stored = %manifest.model,
                    configured = %options.embedding_model,
                    "Embedding model differs from the one recorded in the manifest"
                );
            }
            Ok(())
        }
        None => {
            let manifest = VectorManifest {
                model: options.embedding_model.clone(),
                dimension: options.embedding_dimension,
                created_at: Utc::now(),
            };
            let path = root.join(VECTOR_DIR).join(MANIFEST_FILE);
            std::fs::write(path, serde_json::to_string_pretty(&manifest)?)?;
            Ok(())
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Row helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Milliseconds since the epoch, as stored in every timestamp column.
pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

pub(crate) fn tags_to_json(tags: &[String]) -> Result<String> {
    Ok(serde_json::to_string(tags)?)
}

pub(crate) fn tags_from_json(json: &str) -> Result<Vec<String>> {
    serde_json::from_str(json).map_err(|e| Error::Corrupt(format!("stored tags are not a string array: {}", e)))
}

/// Decode a JSON text column inside a row mapper.
pub(crate) fn json_column<T: serde::de::DeserializeOwned>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let json: String = row.get(idx)?;
    serde_json::from_str(&json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tempfile::TempDir;

    pub fn open_temp() -> (TempDir, Database) {
        let dir = TempDir::new().unwrap();
        let options = StoreOptions {
            busy_timeout: Duration::from_secs(2),
            pool_size: 4,
            embedding_model: "test".into(),
            embedding_dimension: 4,
        };
        let db = Database::open(dir.path(), options).unwrap();
        (dir, db)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::open_temp;
    use super::*;
    use crate::error::ErrorKind;
    use crate::types::{NewFact, NewRecord};

    fn fact(text: &str) -> NewRecord {
        NewRecord::Fact(NewFact {
            user_id: Some("u1".into()),
            text: text.into(),
            tags: vec![],
            confidence: 0.8,
            embedding: None,
        })
    }

    #[test]
    fn test_open_creates_layout() {
        let (dir, db) = open_temp();
        assert!(dir.path().join(DB_FILE).exists());
        assert!(dir.path().join(BACKUP_DIR).is_dir());
        assert_eq!(db.manifest().unwrap().dimension, 4);
        db.ping().unwrap();
    }

    #[test]
    fn test_corrupt_file_is_fatal() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join(DB_FILE), vec![0x42u8; 4096]).unwrap();

        let err = Database::open(dir.path(), StoreOptions::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupt);
        // The garbage file is left for the operator, never replaced.
        assert_eq!(std::fs::read(dir.path().join(DB_FILE)).unwrap()[0], 0x42);
    }

    #[test]
    fn test_dimension_mismatch_on_reopen() {
        let (dir, db) = open_temp();
        drop(db);

        let options = StoreOptions {
            embedding_dimension: 8,
            ..StoreOptions::default()
        };
        let err = Database::open(dir.path(), options).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);
    }

    #[test]
    fn test_cancelled_write_rolls_back() {
        let (_dir, db) = open_temp();
        let cancel = CancelToken::new();

        let err = db
            .write(Some(&cancel), |tx| {
                records::insert(tx, 4, &fact("half written"), Utc::now())?;
                cancel.cancel();
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));

        let count: i64 = db
            .read(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM records", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_failed_write_rolls_back() {
        let (_dir, db) = open_temp();
        let result: Result<()> = db.write(None, |tx| {
            records::insert(tx, 4, &fact("first"), Utc::now())?;
            Err(Error::invalid("abort"))
        });
        assert!(result.is_err());

        let count: i64 = db
            .read(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM records", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_writer_lock_timeout_is_busy() {
        let dir = tempfile::TempDir::new().unwrap();
        let options = StoreOptions {
            busy_timeout: Duration::from_millis(50),
            pool_size: 1,
            embedding_model: "test".into(),
            embedding_dimension: 4,
        };
        let db = std::sync::Arc::new(Database::open(dir.path(), options).unwrap());

        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let holder = {
            let db = db.clone();
            std::thread::spawn(move || {
                db.write(None, |_| {
                    started_tx.send(()).unwrap();
                    std::thread::sleep(Duration::from_millis(300));
                    Ok(())
                })
            })
        };
        started_rx.recv().unwrap();

        let err = db.write(None, |_| Ok(())).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);
        holder.join().unwrap().unwrap();
    }

    #[test]
    fn test_backup_and_restore_round_trip() {
        let (_dir, db) = open_temp();
        let kept = db
            .write(None, |tx| records::insert(tx, 4, &fact("kept"), Utc::now()))
            .unwrap();

        let snapshot = db.backup().unwrap();
        assert!(snapshot.exists());
        assert_eq!(db.list_backups().unwrap(), vec![snapshot.clone()]);

        let later = db
            .write(None, |tx| records::insert(tx, 4, &fact("after backup"), Utc::now()))
            .unwrap();

        db.restore(&snapshot).unwrap();
        assert!(db.read(|conn| records::get(conn, &kept)).is_ok());
        assert!(db.read(|conn| records::get(conn, &later)).unwrap_err().is_not_found());
        db.integrity_check().unwrap();
    }

    #[test]
    fn test_restore_rejects_corrupt_snapshot() {
        let (dir, db) = open_temp();
        let id = db
            .write(None, |tx| records::insert(tx, 4, &fact("live"), Utc::now()))
            .unwrap();

        let bogus = dir.path().join(BACKUP_DIR).join("bogus.db");
        std::fs::write(&bogus, vec![7u8; 2048]).unwrap();

        let err = db.restore(&bogus).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupt);
        assert!(db.read(|conn| records::get(conn, &id)).is_ok());
    }

    #[test]
    fn test_checkpoint_after_writes() {
        let (_dir, db) = open_temp();
        db.write(None, |tx| records::insert(tx, 4, &fact("x"), Utc::now()))
            .unwrap();
        let report = db.checkpoint().unwrap();
        assert_eq!(report.wal_frames, report.checkpointed_frames);
    }
}
