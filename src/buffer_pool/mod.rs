//! Tiered reusable buffer pool (C1). Size classes are powers of two; each
//! class holds a bounded lock-free MPMC queue of reusable buffers. Grounded
//! in the two-tier `BufferPool`/`BufferSubPool` + `PooledBuffer` RAII design
//! from the example pack's `arsync` buffer pool, generalized from two fixed
//! pools to N configurable size classes per the spec.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TryRecvError};

use crate::config::BufferPoolConsts;
use crate::error::{IngestError, Result};

/// Cheap jitter source: no external RNG dependency is justified for a single
/// backoff multiplier, so derive one from the current instant's low bits.
fn jitter_unit() -> f64 {
    let nanos = Instant::now().elapsed().subsec_nanos() as u64 ^ (std::process::id() as u64);
    ((nanos % 2000) as f64 / 1000.0) - 1.0
}

/// A buffer checked out from a [`BufferPool`] size class. Returned to its
/// pool automatically on drop (I5: no buffer is held by more than one owner,
/// and every exit path returns it).
pub struct PooledBuffer {
    data: Option<Vec<u8>>,
    class: Arc<SizeClass>,
}

impl PooledBuffer {
    pub fn as_slice(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.data.as_deref_mut().unwrap_or(&mut [])
    }

    /// Resize the logical length (capacity is fixed by the size class; this
    /// just adjusts how much of it is considered populated).
    pub fn set_len(&mut self, len: usize) {
        if let Some(ref mut v) = self.data {
            v.resize(len.min(v.capacity()), 0);
        }
    }

    pub fn capacity(&self) -> usize {
        self.class.capacity
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(mut buf) = self.data.take() {
            buf.clear();
            self.class.release(buf);
        }
    }
}

struct ResizeState {
    min: usize,
    max: usize,
    floor: usize,
    ceiling: usize,
    last_resize: Instant,
    failures_since_resize: u64,
}

struct SizeClass {
    capacity: usize,
    queue_tx: Sender<Vec<u8>>,
    queue_rx: Receiver<Vec<u8>>,
    total: AtomicUsize,
    in_use: AtomicUsize,
    acquisitions: AtomicU64,
    releases: AtomicU64,
    alloc_failures: AtomicU64,
    wait_ns_sum: AtomicU64,
    closed: std::sync::atomic::AtomicBool,
    resize: Mutex<ResizeState>,
}

impl SizeClass {
    fn new(capacity: usize, min: usize, max: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(max.max(1));
        Self {
            capacity,
            queue_tx: tx,
            queue_rx: rx,
            total: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
            acquisitions: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            alloc_failures: AtomicU64::new(0),
            wait_ns_sum: AtomicU64::new(0),
            closed: std::sync::atomic::AtomicBool::new(false),
            resize: Mutex::new(ResizeState {
                min,
                max,
                floor: min,
                ceiling: max.max(min * 8).max(64),
                last_resize: Instant::now(),
                failures_since_resize: 0,
            }),
        }
    }

    fn max(&self) -> usize {
        self.resize.lock().unwrap().max
    }

    fn acquire(&self) -> Result<Vec<u8>> {
        let start = Instant::now();
        let mut backoff = BufferPoolConsts::BACKOFF_START_NS;
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(IngestError::fatal("buffer pool closed"));
            }
            match self.queue_rx.try_recv() {
                Ok(buf) => {
                    self.in_use.fetch_add(1, Ordering::Relaxed);
                    self.acquisitions.fetch_add(1, Ordering::Relaxed);
                    self.wait_ns_sum
                        .fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);
                    return Ok(buf);
                }
                Err(TryRecvError::Disconnected) => {
                    return Err(IngestError::fatal("buffer pool closed"));
                }
                Err(TryRecvError::Empty) => {}
            }

            let total = self.total.load(Ordering::Relaxed);
            if total < self.max() {
                if self
                    .total
                    .compare_exchange(total, total + 1, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    self.in_use.fetch_add(1, Ordering::Relaxed);
                    self.acquisitions.fetch_add(1, Ordering::Relaxed);
                    self.wait_ns_sum
                        .fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);
                    return Ok(vec![0u8; self.capacity]);
                }
                continue;
            }

            self.alloc_failures.fetch_add(1, Ordering::Relaxed);
            self.resize.lock().unwrap().failures_since_resize += 1;

            let jitter = 1.0 + jitter_unit() * BufferPoolConsts::BACKOFF_JITTER;
            let sleep_ns = ((backoff as f64) * jitter).max(0.0) as u64;
            std::thread::sleep(Duration::from_nanos(sleep_ns));
            backoff = (backoff * 2).min(BufferPoolConsts::BACKOFF_CAP_NS);
        }
    }

    fn release(&self, buf: Vec<u8>) {
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        self.releases.fetch_add(1, Ordering::Relaxed);
        if self.closed.load(Ordering::Acquire) {
            self.total.fetch_sub(1, Ordering::Relaxed);
            return;
        }
        // Idempotent against over-release: if the queue is at capacity
        // (class shrank after this buffer was checked out) just drop it.
        if self.queue_tx.try_send(buf).is_err() {
            self.total.fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        while self.queue_rx.try_recv().is_ok() {}
    }

    /// Adaptive resize per §4.1: grow on high utilization/failure-rate,
    /// shrink on low utilization/failure-rate, trimming excess buffers above
    /// the new max down to the new min.
    fn maybe_resize(&self) {
        let mut state = self.resize.lock().unwrap();
        let elapsed = state.last_resize.elapsed();
        let enough_failures =
            state.failures_since_resize >= BufferPoolConsts::RESIZE_FAILURE_THRESHOLD;
        if elapsed < Duration::from_secs(BufferPoolConsts::RESIZE_INTERVAL_SECS) && !enough_failures
        {
            return;
        }

        let total = self.total.load(Ordering::Relaxed).max(1) as f64;
        let in_use = self.in_use.load(Ordering::Relaxed) as f64;
        let utilization = in_use / total;
        let acquisitions = self.acquisitions.load(Ordering::Relaxed).max(1) as f64;
        let failure_rate = self.alloc_failures.load(Ordering::Relaxed) as f64 / acquisitions;

        if utilization > BufferPoolConsts::HIGH_UTILIZATION
            || failure_rate > BufferPoolConsts::HIGH_FAILURE_RATE
        {
            state.max = (state.max * 2).min(state.ceiling);
            state.min = (state.min + 2).min(state.max);
        } else if utilization < BufferPoolConsts::LOW_UTILIZATION
            && failure_rate < BufferPoolConsts::LOW_FAILURE_RATE
        {
            state.max = (state.max / 2).max(state.floor);
            state.min = state.min.saturating_sub(1).max(state.floor.min(state.max));
        }

        let new_max = state.max;
        let new_min = state.min;
        state.last_resize = Instant::now();
        state.failures_since_resize = 0;
        drop(state);

        // Trim available (not in-use) buffers above new_min down toward it,
        // but never below new_max worth of capacity.
        while self.total.load(Ordering::Relaxed) > new_max.max(new_min) {
            match self.queue_rx.try_recv() {
                Ok(_) => {
                    self.total.fetch_sub(1, Ordering::Relaxed);
                }
                Err(_) => break,
            }
        }
    }
}

/// Per-class snapshot of pool statistics.
#[derive(Debug, Clone)]
pub struct ClassStats {
    pub capacity: usize,
    pub total: usize,
    pub available: usize,
    pub in_use: usize,
    pub acquisitions: u64,
    pub releases: u64,
    pub allocation_failures: u64,
    pub avg_wait_ns: u64,
}

/// Full stats snapshot across all size classes.
#[derive(Debug, Clone, Default)]
pub struct BufferPoolStats {
    pub classes: Vec<ClassStats>,
}

/// Tiered reusable buffer pool (C1).
pub struct BufferPool {
    classes: Vec<Arc<SizeClass>>,
}

impl BufferPool {
    /// `size_classes` must be ascending; each class starts with `min` = 0 and
    /// `max` = `initial_max_per_class`.
    pub fn new(size_classes: &[usize], initial_max_per_class: usize) -> Self {
        let mut classes: Vec<usize> = size_classes.to_vec();
        classes.sort_unstable();
        classes.dedup();
        Self {
            classes: classes
                .into_iter()
                .map(|cap| Arc::new(SizeClass::new(cap, 0, initial_max_per_class)))
                .collect(),
        }
    }

    fn class_for(&self, size: usize) -> Result<&Arc<SizeClass>> {
        self.classes
            .iter()
            .find(|c| c.capacity >= size)
            .ok_or_else(|| {
                IngestError::invalid_input(format!(
                    "no buffer size class large enough for {} bytes",
                    size
                ))
            })
    }

    pub fn acquire(&self, size: usize) -> Result<PooledBuffer> {
        let class = self.class_for(size)?;
        let data = class.acquire()?;
        Ok(PooledBuffer {
            data: Some(data),
            class: Arc::clone(class),
        })
    }

    /// Drop all pooled buffers; subsequent `acquire` fails with `PoolClosed`-equivalent Fatal.
    pub fn clear(&self) {
        for class in &self.classes {
            class.close();
        }
    }

    /// Run one adaptive-resize pass across every class. Intended to be
    /// invoked periodically by a mgmt-pool task (§4.2).
    pub fn run_adaptive_resize(&self) {
        for class in &self.classes {
            class.maybe_resize();
        }
    }

    pub fn stats(&self) -> BufferPoolStats {
        BufferPoolStats {
            classes: self
                .classes
                .iter()
                .map(|c| {
                    let acquisitions = c.acquisitions.load(Ordering::Relaxed);
                    let avg_wait_ns = if acquisitions > 0 {
                        c.wait_ns_sum.load(Ordering::Relaxed) / acquisitions
                    } else {
                        0
                    };
                    ClassStats {
                        capacity: c.capacity,
                        total: c.total.load(Ordering::Relaxed),
                        available: c.queue_rx.len(),
                        in_use: c.in_use.load(Ordering::Relaxed),
                        acquisitions,
                        releases: c.releases.load(Ordering::Relaxed),
                        allocation_failures: c.alloc_failures.load(Ordering::Relaxed),
                        avg_wait_ns,
                    }
                })
                .collect(),
        }
    }

    /// True when no class currently has a buffer checked out — used by P4 (no leaks after shutdown).
    pub fn all_returned(&self) -> bool {
        self.classes
            .iter()
            .all(|c| c.in_use.load(Ordering::Relaxed) == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn acquire_returns_buffer_of_requested_class() {
        let pool = BufferPool::new(&[4096, 16384], 4);
        let buf = pool.acquire(10).unwrap();
        assert_eq!(buf.capacity(), 4096);
    }

    #[test]
    fn release_on_drop_makes_buffer_reusable() {
        let pool = BufferPool::new(&[4096], 1);
        let ptr_before = {
            let buf = pool.acquire(10).unwrap();
            buf.as_slice().as_ptr()
        };
        let buf2 = pool.acquire(10).unwrap();
        assert_eq!(buf2.as_slice().as_ptr(), ptr_before);
    }

    #[test]
    fn acquire_too_large_is_invalid_input() {
        let pool = BufferPool::new(&[4096], 1);
        let err = pool.acquire(1 << 20).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidInput);
    }

    #[test]
    fn all_returned_is_true_after_every_buffer_dropped() {
        let pool = BufferPool::new(&[4096], 4);
        {
            let _a = pool.acquire(10).unwrap();
            let _b = pool.acquire(10).unwrap();
            assert!(!pool.all_returned());
        }
        assert!(pool.all_returned());
    }

    #[test]
    fn concurrent_acquire_release_never_exceeds_max() {
        let pool = Arc::new(BufferPool::new(&[4096], 2));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            handles.push(thread::spawn(move || {
                for _ in 0..50 {
                    let buf = pool.acquire(10).unwrap();
                    thread::yield_now();
                    drop(buf);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(pool.all_returned());
        let stats = pool.stats();
        assert!(stats.classes[0].total <= 2);
    }

    #[test]
    fn clear_causes_subsequent_acquire_to_fail() {
        let pool = BufferPool::new(&[4096], 1);
        pool.clear();
        let err = pool.acquire(10).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Fatal);
    }
}
