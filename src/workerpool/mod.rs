//! Worker-Pool Manager (C2): four differentiated pools (cpu/io/batch/mgmt)
//! with priorities, bounded queues, caller-runs rejection, backpressure, and
//! adaptive resize. Threads and bounded `crossbeam-channel` queues are the
//! teacher's concurrency idiom throughout (`pipeline::context::create_pipeline_channels`,
//! `engine::core`); this module generalizes that single-purpose channel-pair
//! pattern into a reusable, named, multi-pool scheduler, since the teacher
//! itself has no general-purpose pool abstraction to borrow directly.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};

use crate::config::WorkerPoolConsts;
use crate::error::{IngestError, Result};

/// Ordered task priority; currently advisory (tasks run on a single FIFO
/// queue per pool) but recorded for observability and future priority
/// scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

/// The four differentiated pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    Cpu,
    Io,
    Batch,
    Mgmt,
}

type Task = Box<dyn FnOnce() + Send + 'static>;

struct QueuedTask {
    priority: Priority,
    task: Task,
}

#[derive(Debug, Default)]
struct PoolStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    exec_ns_min: AtomicU64,
    exec_ns_max: AtomicU64,
    exec_ns_sum: AtomicU64,
}

impl PoolStats {
    fn record_exec(&self, dur: Duration) {
        let ns = dur.as_nanos() as u64;
        self.exec_ns_sum.fetch_add(ns, Ordering::Relaxed);
        self.exec_ns_max.fetch_max(ns, Ordering::Relaxed);
        let mut cur = self.exec_ns_min.load(Ordering::Relaxed);
        loop {
            if cur != 0 && cur <= ns {
                break;
            }
            match self.exec_ns_min.compare_exchange_weak(
                cur,
                ns,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(v) => cur = v,
            }
        }
    }
}

/// Point-in-time observability snapshot for one pool.
#[derive(Debug, Clone)]
pub struct PoolStatsSnapshot {
    pub kind: PoolKind,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub rejected: u64,
    pub exec_ns_min: u64,
    pub exec_ns_max: u64,
    pub exec_ns_avg: u64,
    pub core_size: usize,
    pub max_size: usize,
    pub live_threads: usize,
    pub queued: usize,
}

struct Pool {
    kind: PoolKind,
    core_size: usize,
    configured_max: AtomicUsize,
    backpressure_max: AtomicUsize,
    queue_min: usize,
    tx: Sender<QueuedTask>,
    rx: Receiver<QueuedTask>,
    handles: Mutex<Vec<std::thread::JoinHandle<()>>>,
    stats: PoolStats,
    shutting_down: Arc<AtomicBool>,
    active: AtomicUsize,
    /// Actual live worker-thread count, distinct from `configured_max`
    /// (a target) so `resize()` has something real to grow/shrink.
    live_threads: AtomicUsize,
    /// Threads `resize()` wants retired; each idle worker claims one slot
    /// off this counter and exits instead of looping back to `recv`.
    pending_retirements: AtomicUsize,
}

impl Pool {
    fn new(kind: PoolKind, core_size: usize, max_size: usize, queue_min: usize) -> Arc<Self> {
        let (tx, rx) = crossbeam_channel::bounded(queue_min.max(core_size.max(1)));
        let pool = Arc::new(Self {
            kind,
            core_size,
            configured_max: AtomicUsize::new(max_size),
            backpressure_max: AtomicUsize::new(max_size),
            queue_min,
            tx,
            rx,
            handles: Mutex::new(Vec::new()),
            stats: PoolStats::default(),
            shutting_down: Arc::new(AtomicBool::new(false)),
            active: AtomicUsize::new(0),
            live_threads: AtomicUsize::new(0),
            pending_retirements: AtomicUsize::new(0),
        });
        pool.spawn_workers(core_size);
        pool
    }

    fn spawn_workers(self: &Arc<Self>, n: usize) {
        let mut handles = self.handles.lock().unwrap();
        for _ in 0..n {
            let pool = Arc::clone(self);
            handles.push(std::thread::spawn(move || pool.worker_loop()));
        }
        self.live_threads.fetch_add(n, Ordering::Relaxed);
    }

    /// Claims one pending retirement slot, if any, decrementing the live
    /// thread count. Returns `true` when this worker should exit.
    fn try_retire(&self) -> bool {
        loop {
            let pending = self.pending_retirements.load(Ordering::Relaxed);
            if pending == 0 {
                return false;
            }
            if self
                .pending_retirements
                .compare_exchange_weak(pending, pending - 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.live_threads.fetch_sub(1, Ordering::Relaxed);
                return true;
            }
        }
    }

    fn worker_loop(self: Arc<Self>) {
        loop {
            let item = match self
                .rx
                .recv_timeout(Duration::from_millis(200))
            {
                Ok(item) => item,
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    if self.shutting_down.load(Ordering::Acquire) && self.rx.is_empty() {
                        return;
                    }
                    if self.try_retire() {
                        return;
                    }
                    continue;
                }
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
            };
            self.run_task(item);
        }
    }

    fn run_task(&self, item: QueuedTask) {
        self.active.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();
        (item.task)();
        self.stats.record_exec(start.elapsed());
        self.stats.completed.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    fn effective_max(&self) -> usize {
        self.backpressure_max.load(Ordering::Relaxed)
    }

    /// Submit a task. On a full queue, the rejection policy is **caller-runs**:
    /// the task executes synchronously on the submitting thread instead of
    /// being dropped, which is itself the backpressure signal upstream feels.
    fn submit(&self, priority: Priority, task: Task) {
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        let queued = QueuedTask { priority, task };
        if let Err(e) = self.tx.try_send(queued) {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            let QueuedTask { task, .. } = e.into_inner();
            let start = Instant::now();
            task();
            self.stats.record_exec(start.elapsed());
            self.stats.completed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn apply_backpressure(&self, level: f64, k: f64) {
        let level = level.clamp(0.0, 1.0);
        let core = self.core_size;
        let configured = self.configured_max.load(Ordering::Relaxed);
        let new_max = ((configured as f64) * (1.0 - level * k)).max(core as f64) as usize;
        self.backpressure_max.store(new_max.max(core), Ordering::Relaxed);
    }

    fn release_backpressure(&self) {
        let configured = self.configured_max.load(Ordering::Relaxed);
        self.backpressure_max.store(configured, Ordering::Relaxed);
    }

    fn load(&self) -> f64 {
        let active = self.active.load(Ordering::Relaxed);
        let queued = self.rx.len();
        let max = self.effective_max().max(1);
        (active + queued) as f64 / max as f64
    }

    /// Adaptive resize per §4.2: grows the real worker-thread count on high
    /// load by spawning more threads up to the new max, shrinks it on low
    /// load by marking idle threads for retirement down toward the new max
    /// (never below `core_size`). `configured_max`/`backpressure_max` track
    /// the same target so `load()`'s ratio stays consistent with it.
    fn resize(self: &Arc<Self>) {
        let load = self.load();
        let configured = self.configured_max.load(Ordering::Relaxed);
        let mut new_max = configured;
        if load > WorkerPoolConsts::HIGH_LOAD {
            let ceiling = self.queue_min.max(configured) * 4;
            new_max = (((configured as f64) * WorkerPoolConsts::GROW_FACTOR) as usize)
                .min(ceiling)
                .max(configured);
        } else if load < WorkerPoolConsts::LOW_LOAD {
            new_max = (((configured as f64) * WorkerPoolConsts::SHRINK_FACTOR) as usize).max(self.core_size);
        }
        self.configured_max.store(new_max, Ordering::Relaxed);
        self.backpressure_max.store(new_max, Ordering::Relaxed);

        let current = self.live_threads.load(Ordering::Relaxed);
        if new_max > current {
            self.spawn_workers(new_max - current);
        } else if new_max < current {
            let floor = current.saturating_sub(self.core_size);
            let shed = (current - new_max).min(floor);
            if shed > 0 {
                self.pending_retirements.fetch_add(shed, Ordering::Relaxed);
            }
        }
    }

    fn failure_rate(&self) -> f64 {
        let submitted = self.stats.submitted.load(Ordering::Relaxed).max(1) as f64;
        let failed = self.stats.failed.load(Ordering::Relaxed) as f64;
        failed / submitted
    }

    fn snapshot(&self) -> PoolStatsSnapshot {
        let completed = self.stats.completed.load(Ordering::Relaxed).max(1);
        PoolStatsSnapshot {
            kind: self.kind,
            submitted: self.stats.submitted.load(Ordering::Relaxed),
            completed: self.stats.completed.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
            exec_ns_min: self.stats.exec_ns_min.load(Ordering::Relaxed),
            exec_ns_max: self.stats.exec_ns_max.load(Ordering::Relaxed),
            exec_ns_avg: self.stats.exec_ns_sum.load(Ordering::Relaxed) / completed,
            core_size: self.core_size,
            max_size: self.effective_max(),
            live_threads: self.live_threads.load(Ordering::Relaxed),
            queued: self.rx.len(),
        }
    }

    fn shutdown(&self, deadline: Duration) {
        self.shutting_down.store(true, Ordering::Release);
        let start = Instant::now();
        let mut handles = self.handles.lock().unwrap();
        for h in handles.drain(..) {
            let remaining = deadline.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                // Force-terminate: detach the thread, it will observe
                // shutting_down on its next poll and exit on its own.
                drop(h);
                continue;
            }
            let _ = h.join();
        }
    }
}

/// Differentiated scheduler owning the cpu/io/batch/mgmt pools.
pub struct WorkerPoolManager {
    cpu: Arc<Pool>,
    io: Arc<Pool>,
    batch: Arc<Pool>,
    mgmt: Arc<Pool>,
}

impl WorkerPoolManager {
    pub fn new(cpu_threads: usize, io_threads: usize) -> Self {
        let cpu = Pool::new(PoolKind::Cpu, cpu_threads.max(1), cpu_threads.max(1) * 2, WorkerPoolConsts::CPU_QUEUE_MIN);
        let io = Pool::new(
            PoolKind::Io,
            io_threads.max(1),
            io_threads.max(1) * 2,
            WorkerPoolConsts::IO_QUEUE_MIN,
        );
        let batch = Pool::new(PoolKind::Batch, 1, 2, WorkerPoolConsts::BATCH_QUEUE_MIN);
        let mgmt = Pool::new(PoolKind::Mgmt, 1, 1, WorkerPoolConsts::MGMT_QUEUE_MIN);
        Self { cpu, io, batch, mgmt }
    }

    /// Build from drive-type-informed thread counts, reusing the teacher's
    /// `disk_detect::determine_threads_for_drive` heuristic for the io pool's
    /// initial size while the cpu pool stays core-count based.
    pub fn for_path(root: &std::path::Path) -> Self {
        let cpu_threads = rayon::current_num_threads();
        let (io_threads, _drive) =
            crate::disk_detect::determine_threads_for_drive(root, cpu_threads);
        Self::new(cpu_threads, io_threads)
    }

    fn pool(&self, kind: PoolKind) -> &Arc<Pool> {
        match kind {
            PoolKind::Cpu => &self.cpu,
            PoolKind::Io => &self.io,
            PoolKind::Batch => &self.batch,
            PoolKind::Mgmt => &self.mgmt,
        }
    }

    pub fn submit<F>(&self, kind: PoolKind, priority: Priority, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pool(kind).submit(priority, Box::new(task));
    }

    /// Reduce the io/batch pools' effective max by `level` (`0.0`..=`1.0`).
    pub fn apply_backpressure(&self, level: f64) {
        self.io.apply_backpressure(level, WorkerPoolConsts::IO_BACKPRESSURE_K);
        self.batch
            .apply_backpressure(level, WorkerPoolConsts::BATCH_BACKPRESSURE_K);
    }

    pub fn release_backpressure(&self) {
        self.io.release_backpressure();
        self.batch.release_backpressure();
    }

    /// Run one adaptive-resize pass across every pool (§4.2). Driven by the
    /// periodic mgmt-pool task `spawn_periodic_resize` submits every 5-10s.
    pub fn run_adaptive_resize(&self) {
        for pool in [&self.cpu, &self.io, &self.batch, &self.mgmt] {
            pool.resize();
            if pool.failure_rate() > WorkerPoolConsts::FAILURE_RATE_WARN {
                log::warn!(
                    "{:?} pool failure rate {:.1}% exceeds warn threshold",
                    pool.kind,
                    pool.failure_rate() * 100.0
                );
            }
        }
    }

    /// Submits a long-running mgmt-pool task that calls `run_adaptive_resize`
    /// and `on_tick` every 5-10s (jittered within that band so many runs
    /// don't all tick in lockstep) until `stop` is set. Meant to be called
    /// once per run, right after the persistence worker starts.
    pub fn spawn_periodic_resize<F>(self: &Arc<Self>, stop: Arc<AtomicBool>, on_tick: F)
    where
        F: Fn() + Send + 'static,
    {
        let mgr = Arc::clone(self);
        self.mgmt.submit(Priority::Low, Box::new(move || {
            let span = WorkerPoolConsts::RESIZE_INTERVAL_SECS_MAX
                - WorkerPoolConsts::RESIZE_INTERVAL_SECS_MIN;
            let mut tick = 0u64;
            while !stop.load(Ordering::Relaxed) {
                let jitter = if span > 0 { tick % (span + 1) } else { 0 };
                let wait = Duration::from_secs(WorkerPoolConsts::RESIZE_INTERVAL_SECS_MIN + jitter);
                let mut waited = Duration::ZERO;
                while waited < wait {
                    if stop.load(Ordering::Relaxed) {
                        return;
                    }
                    let step = Duration::from_millis(200).min(wait - waited);
                    std::thread::sleep(step);
                    waited += step;
                }
                mgr.run_adaptive_resize();
                on_tick();
                tick += 1;
            }
        }));
    }

    pub fn stats(&self) -> Vec<PoolStatsSnapshot> {
        vec![
            self.cpu.snapshot(),
            self.io.snapshot(),
            self.batch.snapshot(),
            self.mgmt.snapshot(),
        ]
    }

    /// Two-phase shutdown: stop accepting new submissions conceptually (the
    /// caller should stop calling `submit`), drain until `deadline`, then
    /// force-terminate any remaining workers.
    pub fn shutdown(&self, deadline: Duration) -> Result<()> {
        for pool in [&self.cpu, &self.io, &self.batch, &self.mgmt] {
            pool.shutdown(deadline);
        }
        Ok(())
    }
}

impl Default for WorkerPoolManager {
    fn default() -> Self {
        let n = rayon::current_num_threads();
        Self::new(n, n * 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;

    #[test]
    fn submit_runs_task() {
        let mgr = WorkerPoolManager::new(2, 2);
        let counter = Arc::new(StdAtomicUsize::new(0));
        let c2 = Arc::clone(&counter);
        mgr.submit(PoolKind::Cpu, Priority::Normal, move || {
            c2.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        mgr.shutdown(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn caller_runs_when_queue_full() {
        // core_size 1, tiny queue -> quickly saturate and exercise caller-runs.
        let mgr = WorkerPoolManager::new(1, 1);
        let counter = Arc::new(StdAtomicUsize::new(0));
        for _ in 0..50 {
            let c = Arc::clone(&counter);
            mgr.submit(PoolKind::Mgmt, Priority::Low, move || {
                std::thread::sleep(Duration::from_millis(1));
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        std::thread::sleep(Duration::from_millis(500));
        assert_eq!(counter.load(Ordering::SeqCst), 50);
        mgr.shutdown(Duration::from_secs(2)).unwrap();
    }

    #[test]
    fn backpressure_reduces_and_restores_max() {
        let mgr = WorkerPoolManager::new(2, 4);
        let before = mgr.stats();
        let io_max_before = before.iter().find(|p| matches!(p.kind, PoolKind::Io)).unwrap().max_size;
        mgr.apply_backpressure(1.0);
        let after = mgr.stats();
        let io_max_after = after.iter().find(|p| matches!(p.kind, PoolKind::Io)).unwrap().max_size;
        assert!(io_max_after <= io_max_before);
        mgr.release_backpressure();
        let restored = mgr.stats();
        let io_max_restored = restored.iter().find(|p| matches!(p.kind, PoolKind::Io)).unwrap().max_size;
        assert_eq!(io_max_restored, io_max_before);
        mgr.shutdown(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn shutdown_completes_within_deadline() {
        let mgr = WorkerPoolManager::new(2, 2);
        mgr.shutdown(Duration::from_secs(1)).unwrap();
    }
}
