//! Content store: the external `ContentStore` contract (§6) plus a concrete
//! filesystem-backed implementation. Grounded in the sharded, content-addressed
//! blob layout and atomic temp-then-rename write pattern used by
//! `vrift-cas`'s `BatchCommitter` (from the example pack), adapted to the
//! teacher's `utils::tempfiles` atomic-rename idiom.

use std::fs;
use std::path::{Path, PathBuf};

use crate::catalog::Fingerprint;
use crate::error::{IngestError, Result};

/// The content store contract the ingest core depends on (§6). `store` must
/// be idempotent by content hash and safe for concurrent callers; a
/// conforming implementation may be only eventually consistent (a successful
/// `store` becomes visible to `exists` within a bounded staleness window) —
/// the core already tolerates retries against such a store.
pub trait ContentStore: Send + Sync {
    fn store(&self, bytes: &[u8]) -> Result<Fingerprint>;
    fn exists(&self, fingerprint: &Fingerprint) -> Result<bool>;
    fn retrieve(&self, fingerprint: &Fingerprint) -> Result<Vec<u8>>;
}

/// Filesystem-backed content store rooted at `<root>/blobs`, sharded two
/// levels deep by the first two hex bytes of the fingerprint:
/// `blobs/<hh>/<hh>/<hex>.bin`.
pub struct FsContentStore {
    root: PathBuf,
    hasher: Box<dyn crate::hash::Hasher>,
}

impl FsContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        Self::with_hasher(root, Box::new(crate::hash::Blake3Hasher))
    }

    pub fn with_hasher(root: impl Into<PathBuf>, hasher: Box<dyn crate::hash::Hasher>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("tmp")).map_err(IngestError::from)?;
        Ok(Self { root, hasher })
    }

    fn sharded_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        let hex = fingerprint.to_hex();
        self.root
            .join(&hex[0..2])
            .join(&hex[2..4])
            .join(format!("{}.bin", hex))
    }
}

impl ContentStore for FsContentStore {
    fn store(&self, bytes: &[u8]) -> Result<Fingerprint> {
        let fingerprint = self.hasher.hash(bytes);
        let dest = self.sharded_path(&fingerprint);
        if dest.exists() {
            // Idempotent: identical content already stored under this fingerprint.
            return Ok(fingerprint);
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(IngestError::from)?;
        }
        let tmp_name = format!(
            "{}-{:?}.tmp",
            fingerprint.to_hex(),
            std::thread::current().id()
        );
        let tmp_path = self.root.join("tmp").join(tmp_name);
        fs::write(&tmp_path, bytes).map_err(IngestError::from)?;
        match fs::rename(&tmp_path, &dest) {
            Ok(()) => Ok(fingerprint),
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                // Another writer may have raced us to the same destination;
                // that is still a successful, idempotent store.
                if dest.exists() {
                    Ok(fingerprint)
                } else {
                    Err(IngestError::from(e))
                }
            }
        }
    }

    fn exists(&self, fingerprint: &Fingerprint) -> Result<bool> {
        Ok(self.sharded_path(fingerprint).is_file())
    }

    fn retrieve(&self, fingerprint: &Fingerprint) -> Result<Vec<u8>> {
        let path = self.sharded_path(fingerprint);
        let file = fs::File::open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                IngestError::invalid_input(format!("chunk {} not found in store", fingerprint))
            } else {
                IngestError::from(e)
            }
        })?;
        let len = file.metadata().map_err(IngestError::from)?.len();
        if len > crate::config::ChunkingConsts::SINGLE_SHOT_THRESHOLD {
            // Memory-mapped read for large blobs, same size-threshold split the
            // teacher uses in `engine::hashing::hash_file`.
            let mmap = unsafe { memmap2::Mmap::map(&file) }.map_err(IngestError::from)?;
            Ok(mmap.to_vec())
        } else {
            use std::io::Read;
            let mut buf = Vec::with_capacity(len as usize);
            std::io::BufReader::new(file)
                .read_to_end(&mut buf)
                .map_err(IngestError::from)?;
            Ok(buf)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, FsContentStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsContentStore::new(dir.path().join("blobs")).unwrap();
        (dir, store)
    }

    #[test]
    fn store_then_retrieve_roundtrips() {
        let (_dir, store) = temp_store();
        let fp = store.store(b"hello world").unwrap();
        assert!(store.exists(&fp).unwrap());
        assert_eq!(store.retrieve(&fp).unwrap(), b"hello world");
    }

    #[test]
    fn store_is_idempotent_by_content() {
        let (_dir, store) = temp_store();
        let fp1 = store.store(b"same bytes").unwrap();
        let fp2 = store.store(b"same bytes").unwrap();
        assert_eq!(fp1, fp2);
    }

    #[test]
    fn distinct_content_yields_distinct_fingerprints() {
        let (_dir, store) = temp_store();
        let fp1 = store.store(b"a").unwrap();
        let fp2 = store.store(b"b").unwrap();
        assert_ne!(fp1, fp2);
    }

    #[test]
    fn retrieve_missing_fingerprint_is_invalid_input() {
        let (_dir, store) = temp_store();
        let err = store.retrieve(&Fingerprint([9u8; 32])).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidInput);
    }
}
