//! Metadata catalog: data model (§3) and the `Catalog` external-interface
//! contract (§6), plus a concrete SQLite-backed implementation grounded in
//! the teacher's `engine::db_ops` (WAL pragmas, schema-on-open, transactional
//! batch writes).

mod sqlite;

pub use sqlite::SqliteCatalog;

use std::fmt;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Result;

/// Content fingerprint: a BLAKE3 digest used as a chunk's identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(64);
        for b in &self.0 {
            s.push_str(&format!("{:02x}", b));
        }
        s
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 64 {
            return None;
        }
        let mut out = [0u8; 32];
        for i in 0..32 {
            out[i] = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(Fingerprint(out))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Monotonic nanosecond timestamp, used instead of `Instant`/`SystemTime` directly
/// so catalog rows serialize to plain integers.
pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Lifecycle state of a [`Snapshot`]. A manifest may only reference an `Open` snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotState {
    Created,
    Open,
    Sealed,
}

impl SnapshotState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotState::Created => "CREATED",
            SnapshotState::Open => "OPEN",
            SnapshotState::Sealed => "SEALED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATED" => Some(SnapshotState::Created),
            "OPEN" => Some(SnapshotState::Open),
            "SEALED" => Some(SnapshotState::Sealed),
            _ => None,
        }
    }
}

/// Named collection of file manifests.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub id: String,
    pub name: String,
    pub description: String,
    pub created_at_ns: i64,
    pub state: SnapshotState,
    pub file_count: u64,
    pub total_bytes: u64,
}

impl Snapshot {
    pub fn new(id: impl Into<String>, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            created_at_ns: now_ns(),
            state: SnapshotState::Created,
            file_count: 0,
            total_bytes: 0,
        }
    }
}

/// Catalog row tracking one chunk fingerprint.
#[derive(Debug, Clone)]
pub struct ChunkMetadataEntry {
    pub fingerprint: Fingerprint,
    pub size: u64,
    pub first_seen_ns: i64,
    pub last_access_ns: i64,
    pub refcount: u64,
}

impl ChunkMetadataEntry {
    /// A size-0 placeholder for a fingerprint referenced before its byte
    /// length is known.
    pub fn placeholder(fingerprint: Fingerprint) -> Self {
        Self::reference(fingerprint, 0)
    }

    /// One more manifest reference to `fingerprint`. `Txn::upsert_chunk`
    /// increments the row's refcount on every call (insert or update) and
    /// fills in `size` the first time a non-zero value is given, leaving an
    /// already-recorded size untouched on later references.
    pub fn reference(fingerprint: Fingerprint, size: u64) -> Self {
        let now = now_ns();
        Self {
            fingerprint,
            size,
            first_seen_ns: now,
            last_access_ns: now,
            refcount: 1,
        }
    }
}

/// Record of one processed file: an ordered sequence of chunk fingerprints
/// bound to a snapshot. Immutable once inserted.
#[derive(Debug, Clone)]
pub struct FileManifest {
    pub manifest_id: String,
    pub snapshot_id: String,
    pub path: PathBuf,
    pub total_size: u64,
    pub mtime_ns: i64,
    pub file_hash: Fingerprint,
    pub chunk_hashes: Vec<Fingerprint>,
    /// Byte length of each entry in `chunk_hashes`, same order.
    pub chunk_sizes: Vec<u64>,
}

/// A single database transaction against the catalog. Dropping a `Txn`
/// without committing rolls it back.
pub trait Txn<'c> {
    fn create_snapshot(&mut self, snapshot: &Snapshot) -> Result<()>;
    fn get_snapshot(&mut self, id: &str) -> Result<Option<Snapshot>>;
    fn update_snapshot(&mut self, snapshot: &Snapshot) -> Result<()>;
    fn upsert_chunk(&mut self, entry: &ChunkMetadataEntry) -> Result<()>;
    fn get_chunk(&mut self, fingerprint: &Fingerprint) -> Result<Option<ChunkMetadataEntry>>;
    fn insert_files(&mut self, manifests: &[FileManifest]) -> Result<()>;
    fn commit(self: Box<Self>) -> Result<()>;
    fn rollback(self: Box<Self>) -> Result<()>;
}

/// The metadata catalog contract the ingest core depends on (§6). Implementations
/// may offer only eventual read-after-write visibility across independent
/// connections/transactions — the core's retry logic (persistence worker,
/// §4.5) is built to tolerate that.
pub trait Catalog: Send + Sync {
    fn begin_transaction(&self) -> Result<Box<dyn Txn<'_> + '_>>;
    fn get_snapshot(&self, id: &str) -> Result<Option<Snapshot>>;
    fn get_chunk(&self, fingerprint: &Fingerprint) -> Result<Option<ChunkMetadataEntry>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_hex_roundtrip() {
        let fp = Fingerprint([7u8; 32]);
        let hex = fp.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(Fingerprint::from_hex(&hex), Some(fp));
    }

    #[test]
    fn fingerprint_from_hex_rejects_bad_length() {
        assert_eq!(Fingerprint::from_hex("abcd"), None);
    }

    #[test]
    fn snapshot_state_roundtrip() {
        for s in [SnapshotState::Created, SnapshotState::Open, SnapshotState::Sealed] {
            assert_eq!(SnapshotState::parse(s.as_str()), Some(s));
        }
    }

    #[test]
    fn new_snapshot_starts_created() {
        let s = Snapshot::new("id-1", "n", "d");
        assert_eq!(s.state, SnapshotState::Created);
        assert_eq!(s.file_count, 0);
    }
}
