//! Per-submitter-thread task inboxes.
//!
//! Every thread that ever submits work gets one lazily created inbox per
//! dispatcher, found through thread-local storage. Submissions only touch
//! their own inbox's mutex, so the hot post path never contends with other
//! producers; the dispatcher drains inboxes one at a time during merge.
//!
//! An inbox lives until process exit. A thread that stops submitting simply
//! leaves an empty inbox behind, which the merge skips over cheaply.

use crate::task::{ScheduledTask, Task};
use crate::types::{TaskGroup, GROUP_COUNT};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::sync::Arc;

#[derive(Default)]
struct InboxState {
    groups: [Vec<Task>; GROUP_COUNT],
    scheduled: Vec<ScheduledTask>,
}

/// Mailbox owned by one submitting thread, drained by the dispatcher.
#[derive(Default)]
pub(crate) struct Inbox {
    state: Mutex<InboxState>,
}

impl Inbox {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, group: TaskGroup, task: Task) {
        self.state.lock().groups[group.ordinal()].push(task);
    }

    pub(crate) fn push_scheduled(&self, task: ScheduledTask) {
        self.state.lock().scheduled.push(task);
    }

    /// Moves the parallel-group portions into the dispatcher's arrays,
    /// leaving serial and scheduled entries untouched.
    pub(crate) fn drain_parallel(&self, dst: &mut [Vec<Task>; GROUP_COUNT]) {
        let mut state = self.state.lock();
        for g in TaskGroup::PARALLEL_START..GROUP_COUNT {
            if !state.groups[g].is_empty() {
                dst[g].append(&mut state.groups[g]);
            }
        }
    }

    /// Moves everything, all groups plus scheduled entries, into the
    /// dispatcher's structures.
    pub(crate) fn drain_all(
        &self,
        dst: &mut [Vec<Task>; GROUP_COUNT],
        scheduled: &mut Vec<ScheduledTask>,
    ) {
        let mut state = self.state.lock();
        for g in 0..GROUP_COUNT {
            if !state.groups[g].is_empty() {
                dst[g].append(&mut state.groups[g]);
            }
        }
        if !state.scheduled.is_empty() {
            scheduled.append(&mut state.scheduled);
        }
    }
}

thread_local! {
    /// Inboxes this thread has bound, one slot per dispatcher instance.
    static BOUND: RefCell<Vec<(u64, Arc<Inbox>)>> = const { RefCell::new(Vec::new()) };
}

/// Returns this thread's inbox for the given dispatcher, creating and
/// registering it on first use. `register` is invoked exactly once per
/// (thread, dispatcher) pair, outside of any inbox lock.
pub(crate) fn thread_inbox(dispatcher_id: u64, register: impl FnOnce(Arc<Inbox>)) -> Arc<Inbox> {
    BOUND.with(|slots| {
        let mut slots = slots.borrow_mut();
        if let Some((_, inbox)) = slots.iter().find(|(id, _)| *id == dispatcher_id) {
            return Arc::clone(inbox);
        }
        let inbox = Arc::new(Inbox::new());
        register(Arc::clone(&inbox));
        slots.push((dispatcher_id, Arc::clone(&inbox)));
        inbox
    })
}
