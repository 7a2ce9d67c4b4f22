//! Shared enums for task classification.
//!
//! Every task carries two pieces of classification: the [`TaskGroup`] it
//! executes under (which decides serial vs. fan-out execution and the order
//! of stages within a tick) and, while it is running, a [`DispatchKind`]
//! describing how it entered the dispatcher (plain post, async post, timer).

/// Execution group of a task.
///
/// `Serial` tasks run one at a time on the dispatcher thread and may mutate
/// shared world state. Parallel groups are fanned out over the worker pool,
/// strictly between serial batches, and must restrict themselves to
/// read-only or shard-local work.
///
/// Groups execute in ordinal order within a tick: `Serial` first, then each
/// parallel group.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskGroup {
    /// Sequential stage; exclusive logical access to mutable world state.
    Serial = 0,
    /// General-purpose parallel work.
    GenericParallel = 1,
    /// Pathfinding batches.
    Pathfinding = 2,
    /// Broadcast fan-out (e.g. packet serialization per receiver).
    Broadcast = 3,
}

/// Number of task groups, including `Serial`.
pub const GROUP_COUNT: usize = 4;

impl TaskGroup {
    /// All groups in execution order.
    pub const ALL: [TaskGroup; GROUP_COUNT] = [
        TaskGroup::Serial,
        TaskGroup::GenericParallel,
        TaskGroup::Pathfinding,
        TaskGroup::Broadcast,
    ];

    /// Ordinal of the first parallel group.
    pub const PARALLEL_START: usize = 1;

    /// Returns the group's ordinal (its stage index within a tick).
    #[must_use]
    pub const fn ordinal(self) -> usize {
        self as usize
    }

    /// Returns true for every group except `Serial`.
    #[must_use]
    pub const fn is_parallel(self) -> bool {
        !matches!(self, TaskGroup::Serial)
    }

    /// Returns a short human-readable name for diagnostics.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            TaskGroup::Serial => "serial",
            TaskGroup::GenericParallel => "generic-parallel",
            TaskGroup::Pathfinding => "pathfinding",
            TaskGroup::Broadcast => "broadcast",
        }
    }
}

/// How the currently running task entered the dispatcher.
///
/// `None` means the thread is not currently executing a dispatched task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchKind {
    /// Not inside a dispatched task.
    #[default]
    None,
    /// A task posted to the serial stage.
    Event,
    /// A task running in a parallel stage.
    AsyncEvent,
    /// A one-shot scheduled task fired by the timer walk.
    ScheduledEvent,
    /// A cycling scheduled task fired by the timer walk.
    CycleEvent,
}

impl DispatchKind {
    /// Returns a short human-readable name for diagnostics.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            DispatchKind::None => "none",
            DispatchKind::Event => "event",
            DispatchKind::AsyncEvent => "async-event",
            DispatchKind::ScheduledEvent => "scheduled-event",
            DispatchKind::CycleEvent => "cycle-event",
        }
    }
}
