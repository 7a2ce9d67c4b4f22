//! Thread-local execution context marker.
//!
//! While a callable runs, the thread that executes it carries a
//! [`DispatchContext`] describing the task's group, how it entered the
//! dispatcher, and its context label. Callables read it through
//! [`current`] to learn where they are running, most importantly whether
//! they hold the serial stage's exclusive access to world state.
//!
//! The marker is reset between tasks; on a thread that is not currently
//! executing a dispatched task, [`DispatchContext::kind`] is
//! [`DispatchKind::None`].

use crate::types::{DispatchKind, TaskGroup};
use std::cell::Cell;

/// Snapshot of the current thread's execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchContext {
    group: TaskGroup,
    kind: DispatchKind,
    task_name: &'static str,
}

impl DispatchContext {
    /// The marker value between tasks.
    pub(crate) const IDLE: DispatchContext = DispatchContext {
        group: TaskGroup::Serial,
        kind: DispatchKind::None,
        task_name: "",
    };

    /// The group of the currently running task.
    #[must_use]
    pub const fn group(self) -> TaskGroup {
        self.group
    }

    /// How the currently running task entered the dispatcher.
    #[must_use]
    pub const fn kind(self) -> DispatchKind {
        self.kind
    }

    /// The context label of the currently running task, or `""`.
    #[must_use]
    pub const fn task_name(self) -> &'static str {
        self.task_name
    }

    /// True when the current callable runs in a parallel stage and must not
    /// touch mutable world state.
    #[must_use]
    pub const fn is_async(self) -> bool {
        matches!(self.kind, DispatchKind::AsyncEvent)
    }
}

thread_local! {
    static CURRENT: Cell<DispatchContext> = const { Cell::new(DispatchContext::IDLE) };
}

/// Returns the current thread's context marker.
#[must_use]
pub fn current() -> DispatchContext {
    CURRENT.with(Cell::get)
}

/// Marks the start of a batch: group and kind are fixed, the task name is
/// filled in per task via [`set_task_name`].
pub(crate) fn enter(group: TaskGroup, kind: DispatchKind) {
    CURRENT.with(|c| {
        c.set(DispatchContext {
            group,
            kind,
            task_name: "",
        });
    });
}

/// Updates the task label without disturbing group/kind.
pub(crate) fn set_task_name(task_name: &'static str) {
    CURRENT.with(|c| {
        let mut ctx = c.get();
        ctx.task_name = task_name;
        c.set(ctx);
    });
}

/// Clears the marker back to idle.
pub(crate) fn reset() {
    CURRENT.with(|c| c.set(DispatchContext::IDLE));
}
