//! Progress listener contract (§6) and a `kdam`-based CLI implementation.
//!
//! The CLI listener follows the teacher's `engine::progress` batching
//! pattern: a shared [`kdam::Bar`] behind a `Mutex`, updated via `try_lock`
//! so a contended bar never blocks a worker thread — an update is simply
//! skipped and caught up on the next event.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use kdam::{Bar, BarExt};

use crate::error::ErrorKind;

/// Summary handed to [`ProgressListener::completed`] when a run finishes.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub processed_files: u64,
    pub skipped_files: u64,
    pub errored_files: u64,
    pub total_bytes: u64,
    pub processed_bytes: u64,
}

/// Outbound, optional lifecycle events (§6). Implementations must not block
/// the calling thread for long — they are invoked from hot paths (once per
/// file, once per batch commit).
pub trait ProgressListener: Send + Sync {
    fn scan_started(&self, _root: &Path) {}
    fn file_processed(&self, _path: &Path, _size: u64) {}
    fn batch_committed(&self, _n: usize) {}
    fn error(&self, _path: Option<&Path>, _kind: ErrorKind, _message: &str) {}
    fn completed(&self, _summary: &RunSummary) {}
}

/// Listener that discards every event; the default when no listener is wired.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgressListener;

impl ProgressListener for NullProgressListener {}

/// `kdam`-backed progress bar, batching updates to reduce lock contention
/// the same way the teacher's `report_progress_batched` does.
pub struct KdamProgressListener {
    bar: Mutex<Bar>,
    batch: usize,
}

impl KdamProgressListener {
    pub fn new(desc: &'static str) -> Arc<Self> {
        Arc::new(Self {
            bar: Mutex::new(kdam::tqdm!(total = 0, desc = desc, unit = " files")),
            batch: 1,
        })
    }

    fn update(&self, n: usize) {
        if let Ok(mut bar) = self.bar.try_lock() {
            let _ = bar.update(n);
        }
    }
}

impl ProgressListener for KdamProgressListener {
    fn scan_started(&self, root: &Path) {
        log::info!("scan started at {}", root.display());
    }

    fn file_processed(&self, _path: &Path, _size: u64) {
        self.update(self.batch);
    }

    fn batch_committed(&self, n: usize) {
        log::debug!("batch committed: {n} files");
    }

    fn error(&self, path: Option<&Path>, kind: ErrorKind, message: &str) {
        let where_ = path.map(|p| p.display().to_string()).unwrap_or_default();
        if kind.is_skip() {
            log::warn!("{kind} {where_}: {message}");
        } else {
            log::error!("{kind} {where_}: {message}");
        }
    }

    fn completed(&self, summary: &RunSummary) {
        if let Ok(mut bar) = self.bar.lock() {
            let _ = bar.refresh();
        }
        log::info!(
            "run complete: {} processed, {} skipped, {} errored, {} bytes",
            summary.processed_files,
            summary.skipped_files,
            summary.errored_files,
            summary.processed_bytes
        );
    }
}

/// Broadcasts every event to all of `listeners`. Used when both a CLI bar
/// and, say, a test-observing listener need to see the same run.
pub struct FanOutProgressListener {
    listeners: Vec<Arc<dyn ProgressListener>>,
}

impl FanOutProgressListener {
    pub fn new(listeners: Vec<Arc<dyn ProgressListener>>) -> Self {
        Self { listeners }
    }
}

impl ProgressListener for FanOutProgressListener {
    fn scan_started(&self, root: &Path) {
        for l in &self.listeners {
            l.scan_started(root);
        }
    }

    fn file_processed(&self, path: &Path, size: u64) {
        for l in &self.listeners {
            l.file_processed(path, size);
        }
    }

    fn batch_committed(&self, n: usize) {
        for l in &self.listeners {
            l.batch_committed(n);
        }
    }

    fn error(&self, path: Option<&Path>, kind: ErrorKind, message: &str) {
        for l in &self.listeners {
            l.error(path, kind, message);
        }
    }

    fn completed(&self, summary: &RunSummary) {
        for l in &self.listeners {
            l.completed(summary);
        }
    }
}

/// Convenience for callers (the scanner, in practice) that only need to
/// report a path was visited without a full [`ProgressListener`] instance.
pub fn noop_path_hook(_path: &PathBuf) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct CountingListener {
        files: AtomicU64,
    }

    impl ProgressListener for CountingListener {
        fn file_processed(&self, _path: &Path, _size: u64) {
            self.files.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn fan_out_reaches_every_listener() {
        let a = Arc::new(CountingListener { files: AtomicU64::new(0) });
        let b = Arc::new(CountingListener { files: AtomicU64::new(0) });
        let fan = FanOutProgressListener::new(vec![a.clone(), b.clone()]);
        fan.file_processed(Path::new("/tmp/x"), 10);
        assert_eq!(a.files.load(Ordering::SeqCst), 1);
        assert_eq!(b.files.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn null_listener_does_nothing_and_does_not_panic() {
        let n = NullProgressListener;
        n.scan_started(Path::new("/tmp"));
        n.file_processed(Path::new("/tmp/a"), 1);
        n.batch_committed(5);
        n.error(None, ErrorKind::Fatal, "boom");
        n.completed(&RunSummary::default());
    }
}
