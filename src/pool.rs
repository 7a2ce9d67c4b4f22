//! Default worker pool backing the parallel stages.
//!
//! A fixed set of named threads pulls jobs from a shared injector queue.
//! [`ThreadPool::submit_indexed`] is the contract the fan-out adapter
//! builds on: the range `[lo, hi)` is split into per-worker blocks and a
//! completion latch tracks them, so [`CompletionHandle::wait`] returns once
//! every index has run or panicked. Panics are contained per index; one
//! failing item neither cancels its siblings nor hangs the waiter.

use crate::error::PoolError;
use crate::task::panic_message;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Shared indexed callable, invoked once per index of a fan-out.
pub type IndexedFn = Arc<dyn Fn(usize) + Send + Sync + 'static>;

struct PoolInner {
    queue: Mutex<VecDeque<Job>>,
    available: Condvar,
    stopped: AtomicBool,
    workers: usize,
}

/// Fixed-size worker pool with a shared injector queue.
pub struct ThreadPool {
    inner: Arc<PoolInner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
    /// Spawns `workers` threads (at least one) named `{name_prefix}-worker-N`.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Spawn`] when a thread cannot be created.
    pub fn new(workers: usize, name_prefix: &str) -> Result<Self, PoolError> {
        let workers = workers.max(1);
        let inner = Arc::new(PoolInner {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            stopped: AtomicBool::new(false),
            workers,
        });
        let mut threads = Vec::with_capacity(workers);
        for n in 0..workers {
            let inner = Arc::clone(&inner);
            let handle = std::thread::Builder::new()
                .name(format!("{name_prefix}-worker-{n}"))
                .spawn(move || worker_loop(&inner))?;
            threads.push(handle);
        }
        debug!(workers, "worker pool started");
        Ok(Self {
            inner,
            threads: Mutex::new(threads),
        })
    }

    /// Number of worker threads.
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.inner.workers
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Enqueues a single job.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Stopped`] after shutdown has been requested.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> Result<(), PoolError> {
        let mut queue = self.inner.queue.lock();
        if self.inner.stopped.load(Ordering::Acquire) {
            return Err(PoolError::Stopped);
        }
        queue.push_back(Box::new(job));
        drop(queue);
        self.inner.available.notify_one();
        Ok(())
    }

    /// Submits `f(i)` for every `i ∈ [lo, hi)`, split into per-worker
    /// blocks, and returns a handle to await their completion.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Stopped`] after shutdown has been requested; in
    /// that case nothing was enqueued.
    pub fn submit_indexed(
        &self,
        lo: usize,
        hi: usize,
        f: IndexedFn,
    ) -> Result<CompletionHandle, PoolError> {
        if hi <= lo {
            return Ok(CompletionHandle::ready());
        }
        let len = hi - lo;
        let blocks = len.min(self.inner.workers);
        let base = len / blocks;
        let rem = len % blocks;

        let latch = Arc::new(Latch::new(blocks));
        let mut queue = self.inner.queue.lock();
        if self.inner.stopped.load(Ordering::Acquire) {
            return Err(PoolError::Stopped);
        }
        let mut block_lo = lo;
        for b in 0..blocks {
            let block_hi = block_lo + base + usize::from(b < rem);
            let f = Arc::clone(&f);
            let guard = CountdownGuard(Arc::clone(&latch));
            queue.push_back(Box::new(move || {
                let _done = guard;
                for i in block_lo..block_hi {
                    run_contained(f.as_ref(), i);
                }
            }));
            block_lo = block_hi;
        }
        drop(queue);
        self.inner.available.notify_all();
        Ok(CompletionHandle { latch })
    }

    /// Requests shutdown, lets the workers drain the queue, and joins them.
    /// Idempotent.
    pub fn shutdown(&self) {
        {
            let _queue = self.inner.queue.lock();
            self.inner.stopped.store(true, Ordering::Release);
        }
        self.inner.available.notify_all();
        let threads: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        for handle in threads {
            let _ = handle.join();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("workers", &self.inner.workers)
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

fn worker_loop(inner: &PoolInner) {
    loop {
        let job = {
            let mut queue = inner.queue.lock();
            loop {
                if let Some(job) = queue.pop_front() {
                    break job;
                }
                if inner.stopped.load(Ordering::Acquire) {
                    return;
                }
                inner.available.wait(&mut queue);
            }
        };
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!("worker job panicked");
        }
    }
}

fn run_contained(f: &dyn Fn(usize), i: usize) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| f(i))) {
        error!(
            index = i,
            panic = panic_message(payload.as_ref()),
            "indexed task panicked"
        );
    }
}

struct Latch {
    remaining: Mutex<usize>,
    done: Condvar,
}

impl Latch {
    fn new(count: usize) -> Self {
        Self {
            remaining: Mutex::new(count),
            done: Condvar::new(),
        }
    }

    fn count_down(&self) {
        let mut remaining = self.remaining.lock();
        *remaining -= 1;
        if *remaining == 0 {
            self.done.notify_all();
        }
    }

    fn wait(&self) {
        let mut remaining = self.remaining.lock();
        while *remaining > 0 {
            self.done.wait(&mut remaining);
        }
    }
}

/// Counts a block as finished even when it unwinds.
struct CountdownGuard(Arc<Latch>);

impl Drop for CountdownGuard {
    fn drop(&mut self) {
        self.0.count_down();
    }
}

/// Awaits completion of an indexed submission.
pub struct CompletionHandle {
    latch: Arc<Latch>,
}

impl CompletionHandle {
    fn ready() -> Self {
        Self {
            latch: Arc::new(Latch::new(0)),
        }
    }

    /// Blocks until every submitted index has returned or panicked.
    pub fn wait(&self) {
        self.latch.wait();
    }
}
