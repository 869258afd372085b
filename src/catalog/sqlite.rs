//! SQLite-backed [`Catalog`]. Grounded directly in the teacher's
//! `engine::db_ops::connection`/`indexer` (WAL pragmas, schema-on-open,
//! transactional batch insert) generalized from a single `paths` table to
//! snapshots/chunks/files.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::Connection;

use crate::error::{IngestError, Result};

use super::{ChunkMetadataEntry, Fingerprint, Snapshot, SnapshotState, Txn};

const WAL_PRAGMAS: &str = r#"
        PRAGMA synchronous = NORMAL;
        PRAGMA wal_autocheckpoint = 10000;
        PRAGMA journal_size_limit = 67108864;
        "#;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS snapshots (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT NOT NULL,
    created_at_ns INTEGER NOT NULL,
    state TEXT NOT NULL,
    file_count INTEGER NOT NULL,
    total_bytes INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS chunks (
    fingerprint TEXT PRIMARY KEY,
    size INTEGER NOT NULL,
    first_seen_ns INTEGER NOT NULL,
    last_access_ns INTEGER NOT NULL,
    refcount INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS files (
    manifest_id TEXT PRIMARY KEY,
    snapshot_id TEXT NOT NULL,
    path TEXT NOT NULL,
    total_size INTEGER NOT NULL,
    mtime_ns INTEGER NOT NULL,
    file_hash TEXT NOT NULL,
    chunk_hashes_json TEXT NOT NULL,
    FOREIGN KEY (snapshot_id) REFERENCES snapshots(id)
);
CREATE INDEX IF NOT EXISTS idx_files_snapshot ON files(snapshot_id);
"#;

fn apply_wal_and_schema(conn: &Connection, path_ctx: &str) -> Result<()> {
    conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
        .map_err(|e| IngestError::transient_io(format!("enable WAL{}: {}", path_ctx, e)))?;
    conn.execute_batch(WAL_PRAGMAS)
        .map_err(|e| IngestError::transient_io(format!("set WAL pragmas{}: {}", path_ctx, e)))?;
    conn.execute_batch(SCHEMA)
        .map_err(|e| IngestError::fatal(format!("create schema{}: {}", path_ctx, e)))?;
    Ok(())
}

/// SQLite-backed catalog. Opens a fresh connection per transaction (rather
/// than holding one shared handle) so the implementation faithfully models
/// the eventual, cross-connection read-after-write visibility the core's
/// retry logic is built to tolerate. `visibility_lag`, used only by tests,
/// artificially delays a fresh connection's view of rows committed by another.
pub struct SqliteCatalog {
    path: PathBuf,
    passphrase: Option<String>,
    visibility_lag: Duration,
}

impl SqliteCatalog {
    pub fn open(path: impl Into<PathBuf>, passphrase: Option<String>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(IngestError::from)?;
        }
        let cat = Self {
            path,
            passphrase,
            visibility_lag: Duration::ZERO,
        };
        // Ensure schema exists up front so the first real transaction never
        // races schema creation with a reader.
        let conn = cat.open_conn()?;
        drop(conn);
        Ok(cat)
    }

    /// Used only by tests exercising the persistence worker's bounded-retry path.
    pub fn with_visibility_lag(mut self, lag: Duration) -> Self {
        self.visibility_lag = lag;
        self
    }

    fn open_conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path).map_err(|e| {
            IngestError::transient_io(format!("open catalog at {}: {}", self.path.display(), e))
        })?;
        if let Some(ref key) = self.passphrase {
            conn.pragma_update(None, "key", key).map_err(|e| {
                IngestError::fatal(format!("set catalog passphrase: {}", e))
            })?;
        }
        apply_wal_and_schema(&conn, &format!(" at {}", self.path.display()))?;
        if !self.visibility_lag.is_zero() {
            std::thread::sleep(self.visibility_lag);
        }
        Ok(conn)
    }
}

fn read_snapshot(conn: &Connection, id: &str) -> Result<Option<Snapshot>> {
    conn.query_row(
        "SELECT id, name, description, created_at_ns, state, file_count, total_bytes \
         FROM snapshots WHERE id = ?1",
        [id],
        |row| {
            let state: String = row.get(4)?;
            Ok(Snapshot {
                id: row.get(0)?,
                name: row.get(1)?,
                description: row.get(2)?,
                created_at_ns: row.get(3)?,
                state: SnapshotState::parse(&state).unwrap_or(SnapshotState::Created),
                file_count: row.get::<_, i64>(5)?.max(0) as u64,
                total_bytes: row.get::<_, i64>(6)?.max(0) as u64,
            })
        },
    )
    .map(Some)
    .or_else(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        e => Err(IngestError::from(e)),
    })
}

fn read_chunk(conn: &Connection, fingerprint: &Fingerprint) -> Result<Option<ChunkMetadataEntry>> {
    let hex = fingerprint.to_hex();
    conn.query_row(
        "SELECT fingerprint, size, first_seen_ns, last_access_ns, refcount FROM chunks WHERE fingerprint = ?1",
        [&hex],
        |row| {
            let fp_hex: String = row.get(0)?;
            Ok(ChunkMetadataEntry {
                fingerprint: Fingerprint::from_hex(&fp_hex).unwrap_or(*fingerprint),
                size: row.get::<_, i64>(1)?.max(0) as u64,
                first_seen_ns: row.get(2)?,
                last_access_ns: row.get(3)?,
                refcount: row.get::<_, i64>(4)?.max(0) as u64,
            })
        },
    )
    .map(Some)
    .or_else(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        e => Err(IngestError::from(e)),
    })
}

impl super::Catalog for SqliteCatalog {
    fn begin_transaction(&self) -> Result<Box<dyn Txn<'_> + '_>> {
        let conn = self.open_conn()?;
        conn.execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| IngestError::transient_io(format!("begin transaction: {}", e)))?;
        Ok(Box::new(SqliteTxn {
            conn,
            finished: false,
        }))
    }

    fn get_snapshot(&self, id: &str) -> Result<Option<Snapshot>> {
        let conn = self.open_conn()?;
        read_snapshot(&conn, id)
    }

    fn get_chunk(&self, fingerprint: &Fingerprint) -> Result<Option<ChunkMetadataEntry>> {
        let conn = self.open_conn()?;
        read_chunk(&conn, fingerprint)
    }
}

struct SqliteTxn {
    conn: Connection,
    finished: bool,
}

impl Drop for SqliteTxn {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.conn.execute_batch("ROLLBACK");
        }
    }
}

impl<'c> Txn<'c> for SqliteTxn {
    fn create_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO snapshots \
                 (id, name, description, created_at_ns, state, file_count, total_bytes) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    snapshot.id,
                    snapshot.name,
                    snapshot.description,
                    snapshot.created_at_ns,
                    snapshot.state.as_str(),
                    snapshot.file_count as i64,
                    snapshot.total_bytes as i64,
                ],
            )
            .map_err(IngestError::from)?;
        Ok(())
    }

    fn get_snapshot(&mut self, id: &str) -> Result<Option<Snapshot>> {
        read_snapshot(&self.conn, id)
    }

    fn update_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        let n = self
            .conn
            .execute(
                "UPDATE snapshots SET name=?2, description=?3, state=?4, file_count=?5, total_bytes=?6 \
                 WHERE id=?1",
                rusqlite::params![
                    snapshot.id,
                    snapshot.name,
                    snapshot.description,
                    snapshot.state.as_str(),
                    snapshot.file_count as i64,
                    snapshot.total_bytes as i64,
                ],
            )
            .map_err(IngestError::from)?;
        if n == 0 {
            return Err(IngestError::referential_integrity(format!(
                "update_snapshot: snapshot {} not visible",
                snapshot.id
            )));
        }
        Ok(())
    }

    fn upsert_chunk(&mut self, entry: &ChunkMetadataEntry) -> Result<()> {
        let hex = entry.fingerprint.to_hex();
        self.conn
            .execute(
                "INSERT INTO chunks (fingerprint, size, first_seen_ns, last_access_ns, refcount) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(fingerprint) DO UPDATE SET \
                   size = CASE WHEN excluded.size > 0 THEN excluded.size ELSE chunks.size END, \
                   last_access_ns = excluded.last_access_ns, \
                   refcount = chunks.refcount + 1",
                rusqlite::params![
                    hex,
                    entry.size as i64,
                    entry.first_seen_ns,
                    entry.last_access_ns,
                    entry.refcount as i64,
                ],
            )
            .map_err(IngestError::from)?;
        Ok(())
    }

    fn get_chunk(&mut self, fingerprint: &Fingerprint) -> Result<Option<ChunkMetadataEntry>> {
        read_chunk(&self.conn, fingerprint)
    }

    fn insert_files(&mut self, manifests: &[super::FileManifest]) -> Result<()> {
        for m in manifests {
            if read_snapshot(&self.conn, &m.snapshot_id)?.is_none() {
                return Err(IngestError::referential_integrity(format!(
                    "insert_files: snapshot {} not visible",
                    m.snapshot_id
                )));
            }
            for h in &m.chunk_hashes {
                if read_chunk(&self.conn, h)?.is_none() {
                    return Err(IngestError::referential_integrity(format!(
                        "insert_files: chunk {} not visible",
                        h
                    )));
                }
            }
            let chunk_hashes_json = serde_json::to_string(
                &m.chunk_hashes.iter().map(|h| h.to_hex()).collect::<Vec<_>>(),
            )
            .map_err(|e| IngestError::fatal(format!("serialize chunk_hashes: {}", e)))?;
            self.conn
                .execute(
                    "INSERT OR REPLACE INTO files \
                     (manifest_id, snapshot_id, path, total_size, mtime_ns, file_hash, chunk_hashes_json) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![
                        m.manifest_id,
                        m.snapshot_id,
                        m.path.to_string_lossy(),
                        m.total_size as i64,
                        m.mtime_ns,
                        m.file_hash.to_hex(),
                        chunk_hashes_json,
                    ],
                )
                .map_err(IngestError::from)?;
        }
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        self.conn
            .execute_batch("COMMIT")
            .map_err(|e| IngestError::transient_io(format!("commit transaction: {}", e)))?;
        self.finished = true;
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<()> {
        self.conn
            .execute_batch("ROLLBACK")
            .map_err(|e| IngestError::transient_io(format!("rollback transaction: {}", e)))?;
        self.finished = true;
        Ok(())
    }
}

/// Returns the catalog directory for a given root, mirroring
/// `PackagePaths::default_catalog_dir` resolution used by the builder.
pub fn default_catalog_path(root: &Path) -> PathBuf {
    root.join(crate::config::PackagePaths::get().default_catalog_dir())
        .join("catalog.db3")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;

    fn temp_catalog() -> (tempfile::TempDir, SqliteCatalog) {
        let dir = tempfile::tempdir().unwrap();
        let cat = SqliteCatalog::open(dir.path().join("catalog.db3"), None).unwrap();
        (dir, cat)
    }

    #[test]
    fn create_and_read_back_snapshot() {
        let (_dir, cat) = temp_catalog();
        let snap = Snapshot::new("s1", "snap one", "");
        let mut txn = cat.begin_transaction().unwrap();
        txn.create_snapshot(&snap).unwrap();
        txn.commit().unwrap();

        let read = cat.get_snapshot("s1").unwrap();
        assert!(read.is_some());
        assert_eq!(read.unwrap().id, "s1");
    }

    #[test]
    fn insert_files_fails_without_visible_snapshot() {
        let (_dir, cat) = temp_catalog();
        let fp = Fingerprint([1u8; 32]);
        let manifest = super::super::FileManifest {
            manifest_id: "m1".into(),
            snapshot_id: "missing-snap".into(),
            path: PathBuf::from("a.txt"),
            total_size: 1,
            mtime_ns: 0,
            file_hash: fp,
            chunk_hashes: vec![fp],
            chunk_sizes: vec![1],
        };
        let mut txn = cat.begin_transaction().unwrap();
        let err = txn.insert_files(&[manifest]).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::ReferentialIntegrity);
    }

    #[test]
    fn insert_files_fails_without_visible_chunk() {
        let (_dir, cat) = temp_catalog();
        let snap = Snapshot::new("s1", "n", "");
        {
            let mut txn = cat.begin_transaction().unwrap();
            txn.create_snapshot(&snap).unwrap();
            txn.commit().unwrap();
        }
        let fp = Fingerprint([2u8; 32]);
        let manifest = super::super::FileManifest {
            manifest_id: "m1".into(),
            snapshot_id: "s1".into(),
            path: PathBuf::from("a.txt"),
            total_size: 1,
            mtime_ns: 0,
            file_hash: fp,
            chunk_hashes: vec![fp],
            chunk_sizes: vec![1],
        };
        let mut txn = cat.begin_transaction().unwrap();
        let err = txn.insert_files(&[manifest]).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::ReferentialIntegrity);
    }

    #[test]
    fn insert_files_succeeds_once_chunk_and_snapshot_visible() {
        let (_dir, cat) = temp_catalog();
        let snap = Snapshot::new("s1", "n", "");
        let fp = Fingerprint([3u8; 32]);
        let mut txn = cat.begin_transaction().unwrap();
        txn.create_snapshot(&snap).unwrap();
        txn.upsert_chunk(&ChunkMetadataEntry::placeholder(fp)).unwrap();
        let manifest = super::super::FileManifest {
            manifest_id: "m1".into(),
            snapshot_id: "s1".into(),
            path: PathBuf::from("a.txt"),
            total_size: 1,
            mtime_ns: 0,
            file_hash: fp,
            chunk_hashes: vec![fp],
            chunk_sizes: vec![1],
        };
        txn.insert_files(&[manifest]).unwrap();
        txn.commit().unwrap();

        assert!(cat.get_chunk(&fp).unwrap().is_some());
    }

    #[test]
    fn rollback_on_drop_without_commit() {
        let (_dir, cat) = temp_catalog();
        {
            let mut txn = cat.begin_transaction().unwrap();
            txn.create_snapshot(&Snapshot::new("s1", "n", "")).unwrap();
            // dropped without commit -> rollback
        }
        assert!(cat.get_snapshot("s1").unwrap().is_none());
    }
}
