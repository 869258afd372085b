//! Ingest Coordinator (C6): owns one run end to end — snapshot lifecycle,
//! the directory scan, the chunking fan-out, and the persistence worker's
//! drain — behind a single state machine (`Idle -> Running -> Sealing ->
//! Done`). Grounded in the teacher's `engine::core::run_pipeline`/
//! `index::nefax_dir_with_opts` top-level orchestration shape, redone so
//! every collaborator (catalog, content store, worker pool, chunker,
//! persistence worker) is owned here instead of wired through module-level
//! singletons or re-opened per call.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::buffer_pool::BufferPool;
use crate::catalog::{Catalog, Snapshot, SnapshotState, SqliteCatalog, now_ns};
use crate::chunker::{ChunkOptions, Chunker};
use crate::config::{CoordinatorConsts, IngestOptions, PersistenceConsts};
use crate::error::{IngestError, Result};
use crate::hash::{Blake3Hasher, Hasher};
use crate::persistence::{ChunkedFile, PersistenceWorker, RunCounters, RunCountersSnapshot};
use crate::progress::{ProgressListener, RunSummary};
use crate::scanner::{ScanOptions, Scanner};
use crate::store::{ContentStore, FsContentStore};
use crate::workerpool::{PoolKind, Priority, WorkerPoolManager};

/// Lifecycle state of one coordinator run (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    Running,
    Sealing,
    Done,
}

/// Outcome of a completed (or partially completed) run.
#[derive(Debug, Clone)]
pub struct IngestReport {
    pub snapshot_id: String,
    pub counters: RunCountersSnapshot,
}

static SNAPSHOT_SEQ: AtomicUsize = AtomicUsize::new(0);

/// Mints a fresh snapshot id when the caller doesn't supply one. No RNG
/// dependency is justified for this alone, so uniqueness comes from the
/// wall clock plus a per-process sequence number, the same ingredients
/// `buffer_pool`'s jitter source already draws from.
fn mint_snapshot_id() -> String {
    let seq = SNAPSHOT_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("ingest-{}-{}-{}", now_ns() / 1_000_000, std::process::id(), seq)
}

/// Counting semaphore bounding concurrently in-flight file chunking calls
/// (§4.6: a file-level semaphore, default 4, distinct from the worker pool's
/// own thread counts). Same Condvar-based shape as the chunker's per-chunk
/// semaphore, one level up.
struct FileSemaphore {
    available: Mutex<usize>,
    condvar: Condvar,
}

impl FileSemaphore {
    fn new(permits: usize) -> Self {
        Self {
            available: Mutex::new(permits.max(1)),
            condvar: Condvar::new(),
        }
    }

    fn acquire(self: &Arc<Self>) -> FileSemaphorePermit {
        let mut avail = self.available.lock().unwrap();
        while *avail == 0 {
            avail = self.condvar.wait(avail).unwrap();
        }
        *avail -= 1;
        FileSemaphorePermit { sem: Arc::clone(self) }
    }
}

struct FileSemaphorePermit {
    sem: Arc<FileSemaphore>,
}

impl Drop for FileSemaphorePermit {
    fn drop(&mut self) {
        let mut avail = self.sem.available.lock().unwrap();
        *avail += 1;
        self.sem.condvar.notify_one();
    }
}

/// Tracks the number of chunking tasks currently in flight so the
/// coordinator can wait for them to drain before sealing the snapshot.
struct ActiveTracker {
    count: Mutex<usize>,
    condvar: Condvar,
}

impl ActiveTracker {
    fn new() -> Self {
        Self { count: Mutex::new(0), condvar: Condvar::new() }
    }

    fn increment(&self) {
        *self.count.lock().unwrap() += 1;
    }

    fn decrement(&self) {
        let mut count = self.count.lock().unwrap();
        *count -= 1;
        if *count == 0 {
            self.condvar.notify_all();
        }
    }

    /// Waits in `poll_interval` increments (logging progress between them)
    /// for at most `max_polls` intervals. Returns `false` on timeout.
    fn wait_until_drained(&self, poll_interval: Duration, max_polls: u64) -> bool {
        let mut count = self.count.lock().unwrap();
        for _ in 0..max_polls.max(1) {
            if *count == 0 {
                return true;
            }
            let (guard, timeout_result) = self.condvar.wait_timeout(count, poll_interval).unwrap();
            count = guard;
            if *count > 0 && timeout_result.timed_out() {
                log::debug!("{} chunking task(s) still in flight", *count);
            }
        }
        *count == 0
    }
}

/// One file's chunking pass, bound by `chunk_options`/`cancel`, run off the
/// scanning thread. Separated from the closure that submits it so the logic
/// is testable without a worker pool.
fn chunk_one_file(
    path: &Path,
    chunker: &Chunker,
    chunk_options: &ChunkOptions,
    cancel: &Arc<AtomicBool>,
) -> Result<ChunkedFile> {
    let meta = std::fs::symlink_metadata(path).map_err(|e| IngestError::from(e).with_path(path))?;
    let mtime_ns = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0);

    let result = chunker.chunk_file(path, chunk_options, cancel)?;

    Ok(ChunkedFile {
        path: path.to_path_buf(),
        mtime_ns,
        total_size: result.total_size,
        file_hash: result.file_hash,
        chunk_hashes: result.chunk_hashes,
        chunk_sizes: result.chunk_sizes,
    })
}

/// Owns one run end to end: the catalog, content store, worker pool,
/// buffer pool, chunker, scanner, and persistence worker. A single
/// coordinator instance is meant for one `start()` call; construct a fresh
/// one per run rather than reusing a `Done` instance.
pub struct IngestCoordinator {
    options: IngestOptions,
    catalog: Arc<dyn Catalog>,
    content_store: Arc<dyn ContentStore>,
    hasher: Arc<dyn Hasher>,
    worker_pool: Arc<WorkerPoolManager>,
    buffer_pool: Arc<BufferPool>,
    chunker: Arc<Chunker>,
    scanner: Scanner,
    listener: Arc<dyn ProgressListener>,
    counters: Arc<RunCounters>,
    state: Mutex<CoordinatorState>,
    cancel: Arc<AtomicBool>,
}

impl IngestCoordinator {
    /// Builds every collaborator from `options` (opening the catalog and
    /// content store, sizing the worker pool for `options.root`'s drive) but
    /// performs no I/O against the snapshot itself yet — that happens in
    /// [`start`](Self::start).
    pub fn new(options: IngestOptions, listener: Arc<dyn ProgressListener>) -> Result<Self> {
        options.validate()?;

        std::fs::create_dir_all(&options.store_dir).map_err(IngestError::from)?;
        if let Some(parent) = options.catalog_path.parent() {
            std::fs::create_dir_all(parent).map_err(IngestError::from)?;
        }

        let catalog: Arc<dyn Catalog> = Arc::new(SqliteCatalog::open(
            options.catalog_path.clone(),
            options.catalog_passphrase.clone(),
        )?);
        let content_store: Arc<dyn ContentStore> =
            Arc::new(FsContentStore::new(options.store_dir.clone())?);
        let hasher: Arc<dyn Hasher> = Arc::new(Blake3Hasher);
        let worker_pool = Arc::new(WorkerPoolManager::for_path(&options.root));
        let buffer_pool = Arc::new(BufferPool::new(
            &options.size_classes,
            options.max_concurrent_chunks.max(4),
        ));
        let chunker = Arc::new(Chunker::new(
            Arc::clone(&buffer_pool),
            Arc::clone(&worker_pool),
            Some(Arc::clone(&content_store)),
            Arc::clone(&hasher),
        ));

        Ok(Self {
            options,
            catalog,
            content_store,
            hasher,
            worker_pool,
            buffer_pool,
            chunker,
            scanner: Scanner::new(),
            listener,
            counters: Arc::new(RunCounters::default()),
            state: Mutex::new(CoordinatorState::Idle),
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn state(&self) -> CoordinatorState {
        *self.state.lock().unwrap()
    }

    /// The catalog backing this run, for callers (e.g. a `check`/verify
    /// subcommand) that want to inspect a sealed snapshot afterward.
    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }

    /// The content store backing this run, for the same reason.
    pub fn content_store(&self) -> &Arc<dyn ContentStore> {
        &self.content_store
    }

    /// The hasher used by this run's chunker.
    pub fn hasher(&self) -> &Arc<dyn Hasher> {
        &self.hasher
    }

    /// The worker pool backing this run's chunking fan-out.
    pub fn worker_pool(&self) -> &Arc<WorkerPoolManager> {
        &self.worker_pool
    }

    /// The buffer pool backing this run's reads.
    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.buffer_pool
    }

    /// Live counters for an in-flight or just-finished run (§4.6).
    pub fn status(&self) -> RunCountersSnapshot {
        self.counters.snapshot()
    }

    /// Requests cooperative cancellation; takes effect at the next scan or
    /// chunking boundary rather than immediately.
    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    /// Runs one ingest: resolves/creates the snapshot, scans and chunks
    /// `options.root`, drains the persistence worker, then seals the
    /// snapshot's aggregate counters. Fails with `Fatal` if this coordinator
    /// is already running.
    pub fn start(&self) -> Result<IngestReport> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != CoordinatorState::Idle {
                return Err(IngestError::fatal("coordinator is already running"));
            }
            *state = CoordinatorState::Running;
        }

        let outcome = self.run();

        *self.state.lock().unwrap() = CoordinatorState::Done;
        outcome
    }

    fn run(&self) -> Result<IngestReport> {
        let snapshot_id = self.open_snapshot()?;

        let worker = Arc::new(PersistenceWorker::spawn(
            Arc::clone(&self.catalog),
            snapshot_id.clone(),
            self.options.queue_capacity,
            self.options.batch_size,
            Arc::clone(&self.counters),
            Arc::clone(&self.listener),
        ));

        let resize_stop = Arc::new(AtomicBool::new(false));
        let buffer_pool = Arc::clone(&self.buffer_pool);
        self.worker_pool
            .spawn_periodic_resize(Arc::clone(&resize_stop), move || buffer_pool.run_adaptive_resize());

        let scan_outcome = self.scan_and_chunk(&worker);

        resize_stop.store(true, Ordering::Relaxed);

        *self.state.lock().unwrap() = CoordinatorState::Sealing;

        let worker = Arc::try_unwrap(worker).map_err(|_| {
            IngestError::fatal("persistence worker still has outstanding references at shutdown")
        })?;
        worker.shutdown(Duration::from_secs(PersistenceConsts::DEFAULT_SHUTDOWN_DEADLINE_SECS))?;

        scan_outcome?;

        self.seal_snapshot(&snapshot_id)?;

        let counters = self.counters.snapshot();
        self.listener.completed(&RunSummary {
            processed_files: counters.processed_files,
            skipped_files: counters.skipped_files,
            errored_files: counters.errored_files,
            total_bytes: counters.total_bytes,
            processed_bytes: counters.processed_bytes,
        });

        Ok(IngestReport { snapshot_id, counters })
    }

    /// Resolves the snapshot id (caller-supplied or freshly minted), creates
    /// the row if it doesn't already exist, and verifies it is visible to a
    /// fresh read before returning — the `SnapshotNotVisible` guard (§4.6).
    fn open_snapshot(&self) -> Result<String> {
        let id = self.options.snapshot_id.clone().unwrap_or_else(mint_snapshot_id);
        let name = self.options.snapshot_name.clone().unwrap_or_else(|| id.clone());

        if self.catalog.get_snapshot(&id)?.is_none() {
            let mut txn = self.catalog.begin_transaction()?;
            if txn.get_snapshot(&id)?.is_none() {
                let mut snap = Snapshot::new(id.as_str(), name.as_str(), "");
                snap.state = SnapshotState::Open;
                txn.create_snapshot(&snap)?;
            }
            txn.commit()?;
        }

        if self.catalog.get_snapshot(&id)?.is_none() {
            return Err(IngestError::fatal(format!("snapshot {} not visible after creation", id)));
        }

        Ok(id)
    }

    /// Scans `options.root`, submitting a bounded-concurrency chunking task
    /// per regular file found, forwarding each chunking result to the
    /// persistence worker. Blocks until every in-flight chunking task has
    /// finished before returning, regardless of whether the scan itself
    /// succeeded.
    fn scan_and_chunk(&self, worker: &Arc<PersistenceWorker>) -> Result<()> {
        let scan_options = ScanOptions {
            max_depth: None,
            follow_symlinks: self.options.follow_symlinks,
            include_patterns: self.options.include.clone(),
            exclude_patterns: self.options.exclude.clone(),
            streaming: true,
        };

        let semaphore = Arc::new(FileSemaphore::new(self.options.max_concurrent_files));
        let tracker = Arc::new(ActiveTracker::new());

        let mut chunk_opts = ChunkOptions::new(self.options.chunk_size, self.options.max_concurrent_chunks);
        chunk_opts.detect_sparse = self.options.detect_sparse;
        let chunk_options = Arc::new(chunk_opts);

        let scan_outcome = self.scanner.scan_directory(
            &self.options.root,
            &scan_options,
            self.listener.as_ref(),
            &self.cancel,
            |path| {
                self.counters.detected_files.fetch_add(1, Ordering::Relaxed);
                if let Ok(meta) = std::fs::metadata(&path) {
                    self.counters.total_bytes.fetch_add(meta.len(), Ordering::Relaxed);
                }

                let permit = semaphore.acquire();
                tracker.increment();

                let chunker = Arc::clone(&self.chunker);
                let worker = Arc::clone(worker);
                let counters = Arc::clone(&self.counters);
                let listener = Arc::clone(&self.listener);
                let chunk_options = Arc::clone(&chunk_options);
                let cancel = Arc::clone(&self.cancel);
                let tracker = Arc::clone(&tracker);

                self.worker_pool.submit(PoolKind::Cpu, Priority::Normal, move || {
                    let _permit = permit;
                    let result = chunk_one_file(&path, &chunker, &chunk_options, &cancel);
                    match result {
                        Ok(chunked) => worker.submit(chunked),
                        Err(e) => {
                            if e.kind.is_skip() {
                                counters.skipped_files.fetch_add(1, Ordering::Relaxed);
                            } else {
                                counters.errored_files.fetch_add(1, Ordering::Relaxed);
                            }
                            listener.error(Some(&path), e.kind, &e.message);
                        }
                    }
                    tracker.decrement();
                });
            },
        );

        let poll_interval = Duration::from_secs(CoordinatorConsts::DEFAULT_CHUNKING_TIMEOUT_SECS);
        let max_polls = (24 * 3600) / CoordinatorConsts::DEFAULT_CHUNKING_TIMEOUT_SECS.max(1);
        if !tracker.wait_until_drained(poll_interval, max_polls) {
            log::error!("timed out waiting for in-flight chunking tasks to drain");
        }

        match scan_outcome {
            Ok(result) => {
                self.counters.skipped_files.fetch_add(result.files_skipped, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Seals the snapshot: flips its state and writes its final aggregate
    /// counters, read from the run's own `RunCounters` rather than a COUNT
    /// query, since the coordinator already tracked them live.
    fn seal_snapshot(&self, snapshot_id: &str) -> Result<()> {
        let counters = self.counters.snapshot();
        let mut txn = self.catalog.begin_transaction()?;
        let mut snap = txn
            .get_snapshot(snapshot_id)?
            .ok_or_else(|| IngestError::fatal(format!("snapshot {} vanished before sealing", snapshot_id)))?;
        snap.state = SnapshotState::Sealed;
        snap.file_count = counters.processed_files;
        snap.total_bytes = counters.processed_bytes;
        txn.update_snapshot(&snap)?;
        txn.commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NullProgressListener;

    fn write_file(dir: &Path, name: &str, content: &[u8]) {
        std::fs::write(dir.join(name), content).unwrap();
    }

    #[test]
    fn ingests_a_small_tree_and_seals_the_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "a.txt", b"hello");
        write_file(dir.path(), "b.txt", b"world");
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        write_file(&dir.path().join("sub"), "c.txt", b"nested");

        let options = IngestOptions::builder(dir.path())
            .snapshot_id("snap-1")
            .max_concurrent_files(2)
            .build();
        let coordinator = IngestCoordinator::new(options, Arc::new(NullProgressListener)).unwrap();

        let report = coordinator.start().unwrap();
        assert_eq!(report.snapshot_id, "snap-1");
        assert_eq!(report.counters.processed_files, 3);
        assert_eq!(report.counters.errored_files, 0);
        assert_eq!(coordinator.state(), CoordinatorState::Done);

        let snap = coordinator.catalog().get_snapshot("snap-1").unwrap().unwrap();
        assert_eq!(snap.state, SnapshotState::Sealed);
        assert_eq!(snap.file_count, 3);
    }

    #[test]
    fn second_concurrent_start_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "a.txt", b"hello");
        let options = IngestOptions::builder(dir.path()).build();
        let coordinator = IngestCoordinator::new(options, Arc::new(NullProgressListener)).unwrap();

        coordinator.start().unwrap();
        let err = coordinator.start().unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Fatal);
    }

    #[test]
    fn mints_a_snapshot_id_when_none_supplied() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "a.txt", b"x");
        let options = IngestOptions::builder(dir.path()).build();
        let coordinator = IngestCoordinator::new(options, Arc::new(NullProgressListener)).unwrap();

        let report = coordinator.start().unwrap();
        assert!(report.snapshot_id.starts_with("ingest-"));
    }
}
