//! Permit-based wake signal for the dispatcher thread.
//!
//! Submissions raise a permit with [`Parker::unpark`]; the dispatcher
//! consumes it in [`Parker::park`] / [`Parker::park_timeout`] between
//! ticks. Because the permit persists until consumed, a wake that arrives
//! after the end-of-tick merge but before the dispatcher actually blocks is
//! never lost: the next park returns immediately.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// One-permit parker built on an atomic flag plus a condvar.
#[derive(Debug, Default)]
pub(crate) struct Parker {
    notified: AtomicBool,
    waiting: AtomicUsize,
    mutex: Mutex<()>,
    cvar: Condvar,
}

impl Parker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    #[inline]
    fn lock_unpoisoned(&self) -> MutexGuard<'_, ()> {
        self.mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[inline]
    fn try_consume_permit(&self) -> bool {
        self.notified
            .compare_exchange(true, false, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Blocks until a permit is available, then consumes it.
    pub(crate) fn park(&self) {
        if self.try_consume_permit() {
            return;
        }
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.lock_unpoisoned();
        while !self.try_consume_permit() {
            guard = self
                .cvar
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        drop(guard);
    }

    /// Blocks until a permit is available or `duration` elapses. A pending
    /// permit is consumed either way.
    pub(crate) fn park_timeout(&self, duration: Duration) {
        if self.try_consume_permit() {
            return;
        }
        if duration.is_zero() {
            // A permit published by a racing unpark is still consumed so the
            // next park observes a clean slate.
            let _ = self.try_consume_permit();
            return;
        }
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let (guard, _timeout) = self
            .cvar
            .wait_timeout_while(self.lock_unpoisoned(), duration, |()| {
                !self.try_consume_permit()
            })
            .unwrap_or_else(PoisonError::into_inner);
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        drop(guard);
    }

    /// Publishes the permit and wakes the dispatcher if it is parked.
    ///
    /// Fast path: when the permit is already raised (bursts of submissions),
    /// the exchange fails and neither the mutex nor the condvar is touched.
    #[inline]
    pub(crate) fn unpark(&self) {
        if self
            .notified
            .compare_exchange(false, true, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        if self.waiting.load(Ordering::SeqCst) == 0 {
            // Nobody parked or preparing to park; the permit alone suffices.
            return;
        }
        // The mutex must be held across notify to close the window between a
        // parker's permit check and its wait (standard condvar protocol).
        let _guard = self.lock_unpoisoned();
        self.cvar.notify_one();
    }
}
