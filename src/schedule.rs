//! Time-ordered registry of scheduled tasks.
//!
//! The ordered set is keyed by `(due_at_ms, id)` so that tasks fire in
//! deadline order and, at equal deadlines, the older id fires first. The
//! set itself is owned exclusively by the dispatcher thread; cross-thread
//! cancellation goes through the separately locked [`CancelIndex`], which
//! maps ids to their cancel latches.

use crate::task::{CancelToken, ScheduledTask};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct ScheduleKey {
    due_at_ms: u64,
    id: u64,
}

/// Dispatcher-owned ordered set of future-due tasks.
#[derive(Default)]
pub(crate) struct ScheduleQueue {
    tasks: BTreeMap<ScheduleKey, ScheduledTask>,
}

impl ScheduleQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, task: ScheduledTask) {
        let key = ScheduleKey {
            due_at_ms: task.due_at_ms(),
            id: task.id(),
        };
        self.tasks.insert(key, task);
    }

    /// Earliest deadline in the registry, if any.
    pub(crate) fn next_deadline(&self) -> Option<u64> {
        self.tasks.keys().next().map(|key| key.due_at_ms)
    }

    /// Removes and returns the earliest task if its deadline has passed.
    pub(crate) fn pop_due(&mut self, now_ms: u64) -> Option<ScheduledTask> {
        let due = self.next_deadline()?;
        if due > now_ms {
            return None;
        }
        self.tasks.pop_first().map(|(_, task)| task)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }
}

/// Shared id → cancel-latch map.
///
/// Populated at submission time so an entry is cancellable even while the
/// task is still waiting in a submitter inbox. The dispatcher removes an
/// entry once its task has fired for the last time.
#[derive(Default)]
pub(crate) struct CancelIndex {
    entries: Mutex<HashMap<u64, Arc<CancelToken>>>,
}

impl CancelIndex {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, id: u64, token: Arc<CancelToken>) {
        self.entries.lock().insert(id, token);
    }

    /// Sets the latch for `id` and forgets the entry. Unknown ids (already
    /// fired, already cancelled, never existed) are a no-op.
    pub(crate) fn cancel(&self, id: u64) -> bool {
        if let Some(token) = self.entries.lock().remove(&id) {
            token.cancel();
            return true;
        }
        false
    }

    /// Drops the entry for a task that will never fire again.
    pub(crate) fn forget(&self, id: u64) {
        self.entries.lock().remove(&id);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
