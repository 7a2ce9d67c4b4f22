//! Task payloads: one-shot posts and scheduled timers.
//!
//! A [`Task`] is invoked at most once. A [`ScheduledTask`] may be invoked
//! repeatedly when cycling; each firing re-enqueues a fresh entry rather
//! than mutating the registry in place. Panics inside callables are caught
//! here so that one bad task never takes down the dispatcher thread.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, trace};

pub(crate) type TaskFn = Box<dyn FnOnce() + Send + 'static>;
pub(crate) type CycleFn = Box<dyn FnMut() + Send + 'static>;

/// Extracts a printable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// A one-shot unit of work with an optional submission-relative expiry.
pub struct Task {
    callable: TaskFn,
    label: &'static str,
    submitted_at_ms: u64,
    expires_after_ms: u64,
}

impl Task {
    /// Wraps a callable, recording the submission timestamp the expiry gate
    /// is measured from. `expires_after_ms == 0` means no expiry.
    pub(crate) fn new(
        callable: TaskFn,
        label: &'static str,
        expires_after_ms: u64,
        now_ms: u64,
    ) -> Self {
        Self {
            callable,
            label,
            submitted_at_ms: now_ms,
            expires_after_ms,
        }
    }

    /// The context label supplied at submission.
    #[must_use]
    pub fn label(&self) -> &'static str {
        self.label
    }

    pub(crate) fn has_expired(&self, now_ms: u64) -> bool {
        self.expires_after_ms != 0 && now_ms > self.submitted_at_ms + self.expires_after_ms
    }

    /// Runs the callable unless it has expired. Returns true only when the
    /// callable ran to completion.
    pub(crate) fn execute(self, now_ms: u64) -> bool {
        if self.has_expired(now_ms) {
            trace!(task = self.label, "expired task dropped before invocation");
            return false;
        }
        let label = self.label;
        match catch_unwind(AssertUnwindSafe(self.callable)) {
            Ok(()) => true,
            Err(payload) => {
                error!(
                    task = label,
                    panic = panic_message(payload.as_ref()),
                    "task panicked; tick continues"
                );
                false
            }
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("label", &self.label)
            .field("submitted_at_ms", &self.submitted_at_ms)
            .field("expires_after_ms", &self.expires_after_ms)
            .finish_non_exhaustive()
    }
}

/// Shared cancellation latch for a scheduled task.
///
/// The latch is set from any thread via the cancel index; the dispatcher
/// observes it at fire time and discards the task without invocation.
#[derive(Debug, Default)]
pub(crate) struct CancelToken {
    cancelled: AtomicBool,
}

impl CancelToken {
    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// A timer entry: a callable due at an absolute deadline, optionally
/// re-armed every `period_ms` after a successful invocation.
pub struct ScheduledTask {
    id: u64,
    due_at_ms: u64,
    period_ms: u64,
    cycle: bool,
    label: &'static str,
    cancel: Arc<CancelToken>,
    callable: CycleFn,
}

impl ScheduledTask {
    pub(crate) fn new(
        id: u64,
        due_at_ms: u64,
        period_ms: u64,
        cycle: bool,
        label: &'static str,
        cancel: Arc<CancelToken>,
        callable: CycleFn,
    ) -> Self {
        Self {
            id,
            due_at_ms,
            period_ms,
            cycle,
            label,
            cancel,
            callable,
        }
    }

    /// The globally unique handle returned by `schedule`.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Absolute deadline on the tick clock.
    #[must_use]
    pub fn due_at_ms(&self) -> u64 {
        self.due_at_ms
    }

    /// Whether this task re-arms itself after each firing.
    #[must_use]
    pub fn is_cycle(&self) -> bool {
        self.cycle
    }

    /// The context label supplied at submission.
    #[must_use]
    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Advances the deadline by one period. Only meaningful for cycles.
    pub(crate) fn advance(&mut self) {
        self.due_at_ms += self.period_ms;
    }

    /// Fires the task. Returns false when it must not be re-armed: the
    /// cancel latch was observed (before or during the invocation, so a
    /// callable cancelling its own id disarms the cycle) or the callable
    /// panicked.
    pub(crate) fn execute(&mut self) -> bool {
        if self.cancel.is_cancelled() {
            trace!(task = self.label, id = self.id, "cancelled scheduled task discarded");
            return false;
        }
        if catch_unwind(AssertUnwindSafe(|| (self.callable)())).is_err() {
            error!(
                task = self.label,
                id = self.id,
                "scheduled task panicked; it will not be re-armed"
            );
            return false;
        }
        !self.cancel.is_cancelled()
    }
}

impl std::fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("id", &self.id)
            .field("due_at_ms", &self.due_at_ms)
            .field("period_ms", &self.period_ms)
            .field("cycle", &self.cycle)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}
