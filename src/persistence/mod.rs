//! Persistence Worker (C5): drains chunking results and batch-commits file
//! manifests under the active snapshot.
//!
//! Grounded in the teacher's `engine::db_ops::indexer` batch-transaction
//! shape (`flush_batch`: one transaction, one prepared statement, one
//! commit) and in `apply_index_diff_streaming`'s `recv_timeout`-then-drain
//! loop, generalized here to the bounded-retry, referential-integrity-aware
//! commit path the catalog's eventual cross-connection visibility requires
//! (§4.5) — a case the teacher's single-writer-connection design never had
//! to handle.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::catalog::{Catalog, ChunkMetadataEntry, FileManifest, Fingerprint, now_ns};
use crate::config::PersistenceConsts;
use crate::error::{ErrorKind, IngestError, Result};
use crate::progress::ProgressListener;

/// Live, monotonic counters for one run (§4.6). Owned by the Coordinator,
/// written to by the Persistence Worker after each successful commit.
#[derive(Debug, Default)]
pub struct RunCounters {
    pub detected_files: AtomicU64,
    pub processed_files: AtomicU64,
    pub skipped_files: AtomicU64,
    pub errored_files: AtomicU64,
    pub total_bytes: AtomicU64,
    pub processed_bytes: AtomicU64,
}

/// Point-in-time read of [`RunCounters`] for `status()` callers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunCountersSnapshot {
    pub detected_files: u64,
    pub processed_files: u64,
    pub skipped_files: u64,
    pub errored_files: u64,
    pub total_bytes: u64,
    pub processed_bytes: u64,
}

impl RunCounters {
    pub fn snapshot(&self) -> RunCountersSnapshot {
        RunCountersSnapshot {
            detected_files: self.detected_files.load(Ordering::Relaxed),
            processed_files: self.processed_files.load(Ordering::Relaxed),
            skipped_files: self.skipped_files.load(Ordering::Relaxed),
            errored_files: self.errored_files.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            processed_bytes: self.processed_bytes.load(Ordering::Relaxed),
        }
    }
}

/// One file's chunking output, ready to become a manifest row once bound to
/// a snapshot id. Produced by the Chunker, consumed by the Persistence Worker.
#[derive(Debug, Clone)]
pub struct ChunkedFile {
    pub path: PathBuf,
    pub mtime_ns: i64,
    pub total_size: u64,
    pub file_hash: Fingerprint,
    pub chunk_hashes: Vec<Fingerprint>,
    /// Byte length of each entry in `chunk_hashes`, same order.
    pub chunk_sizes: Vec<u64>,
}

fn mint_manifest_id(seq: u64) -> String {
    format!("file-{}-{}", now_ns(), seq)
}

fn to_manifest(item: &ChunkedFile, snapshot_id: &str, seq: u64) -> FileManifest {
    FileManifest {
        manifest_id: mint_manifest_id(seq),
        snapshot_id: snapshot_id.to_string(),
        path: item.path.clone(),
        total_size: item.total_size,
        mtime_ns: item.mtime_ns,
        file_hash: item.file_hash,
        chunk_hashes: item.chunk_hashes.clone(),
        chunk_sizes: item.chunk_sizes.clone(),
    }
}

/// Ensures every fingerprint a manifest's `chunk_hashes` references has a
/// catalog row and its reference count reflects this manifest (spec §3's
/// "reference count incremented on manifest insert"): one `upsert_chunk`
/// call per distinct fingerprint in the manifest, whether the row already
/// exists or not — `Txn::upsert_chunk`'s `ON CONFLICT` bumps refcount and
/// fills in `size` (the placeholder-size gap) either way.
fn ensure_chunks_visible(
    txn: &mut dyn crate::catalog::Txn<'_>,
    manifests: &[FileManifest],
) -> Result<()> {
    for m in manifests {
        let mut seen = std::collections::HashSet::new();
        for (i, h) in m.chunk_hashes.iter().enumerate() {
            if !seen.insert(*h) {
                continue;
            }
            let size = m.chunk_sizes.get(i).copied().unwrap_or(0);
            txn.upsert_chunk(&ChunkMetadataEntry::reference(*h, size))?;
        }
    }
    Ok(())
}

/// Bounded-retry visibility probe: waits for `fingerprint` to become visible
/// to a fresh read, up to `PersistenceConsts::MAX_RETRY_ATTEMPTS` attempts.
fn wait_for_chunk_visible(catalog: &dyn Catalog, fingerprint: &Fingerprint) -> Result<()> {
    for attempt in 1..=PersistenceConsts::MAX_RETRY_ATTEMPTS {
        if catalog.get_chunk(fingerprint)?.is_some() {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(
            PersistenceConsts::RETRY_BACKOFF_MS * attempt as u64,
        ));
    }
    Err(IngestError::referential_integrity(format!(
        "chunk {} not visible after {} attempts",
        fingerprint,
        PersistenceConsts::MAX_RETRY_ATTEMPTS
    )))
}

/// Commits one manifest with bounded retry, re-upserting placeholders and
/// re-probing visibility on each attempt (§4.5 step 7's per-item fallback).
fn commit_one_with_retry(catalog: &dyn Catalog, manifest: &FileManifest) -> Result<()> {
    let mut last_err = None;
    for attempt in 1..=PersistenceConsts::MAX_RETRY_ATTEMPTS {
        let outcome = (|| -> Result<()> {
            let mut txn = catalog.begin_transaction()?;
            if txn.get_snapshot(&manifest.snapshot_id)?.is_none() {
                return Err(IngestError::referential_integrity(format!(
                    "snapshot {} not visible",
                    manifest.snapshot_id
                )));
            }
            ensure_chunks_visible(txn.as_mut(), std::slice::from_ref(manifest))?;
            txn.insert_files(std::slice::from_ref(manifest))?;
            txn.commit()
        })();

        match outcome {
            Ok(()) => return Ok(()),
            Err(e) if e.kind == ErrorKind::ReferentialIntegrity => {
                for h in &manifest.chunk_hashes {
                    let _ = wait_for_chunk_visible(catalog, h);
                }
                last_err = Some(e);
                std::thread::sleep(Duration::from_millis(
                    PersistenceConsts::RETRY_BACKOFF_MS * attempt as u64,
                ));
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| IngestError::fatal("retry loop exited without an error")))
}

/// Attempts one batch commit: all manifests in a single transaction. On a
/// referential-integrity failure the whole batch is rolled back (dropping
/// the `Txn` does this) and the caller falls back to per-manifest retries.
fn try_commit_batch(catalog: &dyn Catalog, manifests: &[FileManifest]) -> Result<()> {
    let mut txn = catalog.begin_transaction()?;
    ensure_chunks_visible(txn.as_mut(), manifests)?;
    txn.insert_files(manifests)?;
    txn.commit()
}

/// Processes one batch per §4.5 steps 3-8: try the whole batch atomically,
/// and on referential-integrity failure fall back to committing each
/// manifest independently with bounded retry. Returns counts of
/// (committed, errored) files so the caller can update run counters.
fn process_batch(
    catalog: &dyn Catalog,
    items: &[ChunkedFile],
    snapshot_id: &str,
    next_seq: &AtomicU64,
) -> (Vec<(PathBuf, u64)>, Vec<(PathBuf, IngestError)>) {
    let manifests: Vec<FileManifest> = items
        .iter()
        .map(|item| to_manifest(item, snapshot_id, next_seq.fetch_add(1, Ordering::Relaxed)))
        .collect();

    match try_commit_batch(catalog, &manifests) {
        Ok(()) => {
            let committed = items
                .iter()
                .map(|i| (i.path.clone(), i.total_size))
                .collect();
            (committed, Vec::new())
        }
        Err(e) if e.kind == ErrorKind::ReferentialIntegrity => {
            let mut committed = Vec::new();
            let mut errored = Vec::new();
            for (item, manifest) in items.iter().zip(manifests.iter()) {
                match commit_one_with_retry(catalog, manifest) {
                    Ok(()) => committed.push((item.path.clone(), item.total_size)),
                    Err(e) => errored.push((item.path.clone(), e)),
                }
            }
            (committed, errored)
        }
        Err(e) => {
            // Non-referential-integrity failure (fatal/transient): the whole
            // batch is counted as errored; the run itself keeps going.
            let errored = items.iter().map(|i| (i.path.clone(), e_clone(&e))).collect();
            (Vec::new(), errored)
        }
    }
}

fn e_clone(e: &IngestError) -> IngestError {
    IngestError::new(e.kind, e.message.clone())
}

/// Handle to a running Persistence Worker thread. Dropping the handle
/// without calling [`shutdown`](Self::shutdown) detaches the worker; it
/// keeps draining until its channel disconnects.
pub struct PersistenceWorker {
    sender: Sender<ChunkedFile>,
    handle: Option<JoinHandle<()>>,
    catalog: Arc<dyn Catalog>,
    snapshot_id: String,
    counters: Arc<RunCounters>,
    fallback_seq: AtomicU64,
}

impl PersistenceWorker {
    /// Spawns the worker thread bound to `snapshot_id`. `batch_size` and
    /// `queue_capacity` default to [`PersistenceConsts`] when zero.
    pub fn spawn(
        catalog: Arc<dyn Catalog>,
        snapshot_id: String,
        queue_capacity: usize,
        batch_size: usize,
        counters: Arc<RunCounters>,
        listener: Arc<dyn ProgressListener>,
    ) -> Self {
        let queue_capacity = queue_capacity.max(1);
        let batch_size = batch_size.max(1);
        let (tx, rx) = crossbeam_channel::bounded(queue_capacity);

        let worker_catalog = Arc::clone(&catalog);
        let worker_counters = Arc::clone(&counters);
        let worker_snapshot_id = snapshot_id.clone();
        let handle = std::thread::spawn(move || {
            worker_loop(rx, worker_catalog, worker_snapshot_id, batch_size, worker_counters, listener);
        });

        Self {
            sender: tx,
            handle: Some(handle),
            catalog,
            snapshot_id,
            counters,
            fallback_seq: AtomicU64::new(0),
        }
    }

    /// Enqueue one chunked file. On a full queue the item is processed
    /// synchronously on the calling thread instead (§4.5's admission-control
    /// backpressure signal), so this call may block briefly on a catalog
    /// round trip in that case.
    pub fn submit(&self, item: ChunkedFile) {
        match self.sender.try_send(item) {
            Ok(()) => {}
            Err(TrySendError::Full(item)) | Err(TrySendError::Disconnected(item)) => {
                self.process_inline(item);
            }
        }
    }

    fn process_inline(&self, item: ChunkedFile) {
        let seq = self.fallback_seq.fetch_add(1, Ordering::Relaxed);
        let manifest = to_manifest(&item, &self.snapshot_id, seq);
        match commit_one_with_retry(self.catalog.as_ref(), &manifest) {
            Ok(()) => {
                self.counters.processed_files.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .processed_bytes
                    .fetch_add(item.total_size, Ordering::Relaxed);
            }
            Err(_) => {
                self.counters.errored_files.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Signals the worker to stop accepting more work conceptually (callers
    /// should stop calling `submit`), drains whatever remains, and joins the
    /// thread — up to `deadline`. Anything still queued when the deadline
    /// elapses is left for the caller to count as errored.
    pub fn shutdown(mut self, deadline: Duration) -> Result<()> {
        drop(self.sender);
        if let Some(handle) = self.handle.take() {
            let (done_tx, done_rx) = crossbeam_channel::bounded(1);
            std::thread::spawn(move || {
                let _ = handle.join();
                let _ = done_tx.send(());
            });
            match done_rx.recv_timeout(deadline) {
                Ok(()) => Ok(()),
                Err(_) => Err(IngestError::fatal(
                    "persistence worker did not finish draining within the shutdown deadline",
                )),
            }
        } else {
            Ok(())
        }
    }
}

fn worker_loop(
    rx: Receiver<ChunkedFile>,
    catalog: Arc<dyn Catalog>,
    snapshot_id: String,
    batch_size: usize,
    counters: Arc<RunCounters>,
    listener: Arc<dyn ProgressListener>,
) {
    let next_seq = AtomicU64::new(0);
    loop {
        let first = match rx.recv_timeout(Duration::from_millis(PersistenceConsts::FIRST_ITEM_WAIT_MS)) {
            Ok(item) => item,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let mut batch = Vec::with_capacity(batch_size);
        batch.push(first);
        while batch.len() < batch_size {
            match rx.try_recv() {
                Ok(item) => batch.push(item),
                Err(_) => break,
            }
        }

        let (committed, errored) = process_batch(catalog.as_ref(), &batch, &snapshot_id, &next_seq);

        if !committed.is_empty() {
            counters
                .processed_files
                .fetch_add(committed.len() as u64, Ordering::Relaxed);
            let bytes: u64 = committed.iter().map(|(_, size)| *size).sum();
            counters.processed_bytes.fetch_add(bytes, Ordering::Relaxed);
            listener.batch_committed(committed.len());
        }
        for (path, err) in &errored {
            counters.errored_files.fetch_add(1, Ordering::Relaxed);
            listener.error(Some(path), err.kind, &err.message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, Snapshot, SqliteCatalog};
    use crate::progress::NullProgressListener;

    fn open_catalog_with_snapshot(id: &str) -> (tempfile::TempDir, Arc<SqliteCatalog>) {
        let dir = tempfile::tempdir().unwrap();
        let cat = SqliteCatalog::open(dir.path().join("catalog.db3"), None).unwrap();
        let mut txn = cat.begin_transaction().unwrap();
        txn.create_snapshot(&Snapshot::new(id, "n", "")).unwrap();
        txn.commit().unwrap();
        (dir, Arc::new(cat))
    }

    fn sample_file(name: &str, n: u8) -> ChunkedFile {
        let fp = Fingerprint([n; 32]);
        ChunkedFile {
            path: PathBuf::from(name),
            mtime_ns: 0,
            total_size: 10,
            file_hash: fp,
            chunk_hashes: vec![fp],
            chunk_sizes: vec![10],
        }
    }

    #[test]
    fn submitted_files_are_committed_and_counted() {
        let (_dir, cat) = open_catalog_with_snapshot("s1");
        let counters = Arc::new(RunCounters::default());
        let worker = PersistenceWorker::spawn(
            cat.clone(),
            "s1".to_string(),
            10,
            5,
            Arc::clone(&counters),
            Arc::new(NullProgressListener),
        );

        for i in 0..7u8 {
            worker.submit(sample_file(&format!("f{i}.txt"), i + 1));
        }
        worker.shutdown(Duration::from_secs(5)).unwrap();

        assert_eq!(counters.snapshot().processed_files, 7);
        assert_eq!(counters.snapshot().errored_files, 0);
    }

    #[test]
    fn missing_chunk_is_auto_placeheld_and_committed() {
        let (_dir, cat) = open_catalog_with_snapshot("s1");
        let counters = Arc::new(RunCounters::default());
        let worker = PersistenceWorker::spawn(
            cat.clone(),
            "s1".to_string(),
            10,
            5,
            Arc::clone(&counters),
            Arc::new(NullProgressListener),
        );

        worker.submit(sample_file("only.txt", 42));
        worker.shutdown(Duration::from_secs(5)).unwrap();

        assert_eq!(counters.snapshot().processed_files, 1);
        assert!(cat.get_chunk(&Fingerprint([42u8; 32])).unwrap().is_some());
    }

    #[test]
    fn repeated_chunk_reference_bumps_refcount_and_fills_in_size() {
        let (_dir, cat) = open_catalog_with_snapshot("s1");
        let counters = Arc::new(RunCounters::default());
        let worker = PersistenceWorker::spawn(
            cat.clone(),
            "s1".to_string(),
            10,
            1,
            Arc::clone(&counters),
            Arc::new(NullProgressListener),
        );

        let fp = Fingerprint([9u8; 32]);
        worker.submit(ChunkedFile {
            path: PathBuf::from("a.txt"),
            mtime_ns: 0,
            total_size: 10,
            file_hash: fp,
            chunk_hashes: vec![fp],
            chunk_sizes: vec![10],
        });
        worker.submit(ChunkedFile {
            path: PathBuf::from("b.txt"),
            mtime_ns: 0,
            total_size: 10,
            file_hash: fp,
            chunk_hashes: vec![fp],
            chunk_sizes: vec![10],
        });
        worker.shutdown(Duration::from_secs(5)).unwrap();

        assert_eq!(counters.snapshot().processed_files, 2);
        let chunk = cat.get_chunk(&fp).unwrap().unwrap();
        assert_eq!(chunk.refcount, 2);
        assert_eq!(chunk.size, 10);
    }
}
