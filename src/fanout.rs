//! Parallel fan-out adapter with inline fallback.
//!
//! Partitions an indexed range across the worker pool, runs the first chunk
//! inline on the calling thread, and awaits the rest. While a fan-out is in
//! flight a shared flag is raised; any fan-out call observing the flag
//! (typically a task on a worker thread calling back into the adapter) runs
//! entirely inline, so the pool is never re-entered recursively and a
//! nested call can never deadlock the awaiting dispatcher.

use crate::pool::{IndexedFn, ThreadPool};
use crate::task::panic_message;
use smallvec::SmallVec;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, warn};

/// Splits `len` items into at most `parts` contiguous chunks, earlier
/// chunks taking the remainder.
pub(crate) fn partition(len: usize, parts: usize) -> SmallVec<[(usize, usize); 8]> {
    let mut out = SmallVec::new();
    if len == 0 {
        return out;
    }
    let parts = parts.clamp(1, len);
    let base = len / parts;
    let rem = len % parts;
    let mut lo = 0;
    for p in 0..parts {
        let hi = lo + base + usize::from(p < rem);
        out.push((lo, hi));
        lo = hi;
    }
    out
}

/// Bounded fan-out over a shared worker pool.
pub(crate) struct FanOut {
    pool: Arc<ThreadPool>,
    active: AtomicBool,
}

impl FanOut {
    pub(crate) fn new(pool: Arc<ThreadPool>) -> Self {
        Self {
            pool,
            active: AtomicBool::new(false),
        }
    }

    /// Invokes `f(i)` for every `i ∈ [0, len)`, using the pool for all but
    /// the first chunk. `len == 0` is a no-op. Returns once every index has
    /// run or panicked.
    pub(crate) fn run(&self, len: usize, f: IndexedFn) {
        if len == 0 {
            return;
        }
        // A fan-out already in flight, or a stopped pool, degrades to
        // sequential execution on the calling thread.
        if self.active.load(Ordering::Acquire) || self.pool.is_stopped() {
            run_range(f.as_ref(), 0, len);
            return;
        }

        let chunks = partition(len, self.pool.thread_count() + 1);
        let (inline_lo, inline_hi) = chunks[0];
        let mut pending = None;
        let mut fallback = None;

        if chunks.len() > 1 {
            let lo = chunks[1].0;
            let hi = chunks[chunks.len() - 1].1;
            self.active.store(true, Ordering::Release);
            match self.pool.submit_indexed(lo, hi, Arc::clone(&f)) {
                Ok(handle) => pending = Some(handle),
                Err(err) => {
                    warn!(%err, "worker pool rejected fan-out; running remainder inline");
                    fallback = Some((lo, hi));
                }
            }
        }

        run_range(f.as_ref(), inline_lo, inline_hi);
        if let Some((lo, hi)) = fallback {
            run_range(f.as_ref(), lo, hi);
        }
        if let Some(handle) = pending {
            handle.wait();
        }
        if chunks.len() > 1 {
            self.active.store(false, Ordering::Release);
        }
    }
}

impl std::fmt::Debug for FanOut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanOut")
            .field("active", &self.active.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn run_range(f: &dyn Fn(usize), lo: usize, hi: usize) {
    for i in lo..hi {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| f(i))) {
            error!(
                index = i,
                panic = panic_message(payload.as_ref()),
                "fan-out task panicked"
            );
        }
    }
}
