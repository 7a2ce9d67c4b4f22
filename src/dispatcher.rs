//! The single-consumer tick loop and its submission façade.
//!
//! One dedicated thread owns all mutable dispatch state. Each iteration (a
//! tick) drains what producers buffered into their thread-local
//! inboxes, runs the serial batch to completion, fans parallel batches out
//! over the worker pool, fires due scheduled tasks, and then sleeps until
//! the next deadline or a wake signal.
//!
//! Ordering contract, per tick: `Serial` first, then each parallel group in
//! ordinal order. Async work posted from inside a serial task or a timer
//! callback runs in the *same* tick (a mid-tick merge picks it up); serial
//! work posted from inside a serial task runs in the *next* tick. Within
//! one submitter thread and one group, tasks are observed in FIFO order.
//!
//! # Example
//!
//! ```no_run
//! use tickloop::{Dispatcher, DispatcherConfig, TaskGroup};
//!
//! let dispatcher = Dispatcher::start(DispatcherConfig::default())?;
//! dispatcher.post(|| { /* mutate world state */ }, "apply player action");
//! dispatcher.post_async(|| { /* read-only batch work */ }, TaskGroup::GenericParallel);
//! let id = dispatcher.schedule(250, || { /* periodic */ }, "decay check", true);
//! dispatcher.cancel(id);
//! # Ok::<(), tickloop::StartError>(())
//! ```

use crate::clock::TickClock;
use crate::config::DispatcherConfig;
use crate::context;
use crate::error::StartError;
use crate::fanout::FanOut;
use crate::inbox::{self, Inbox};
use crate::parker::Parker;
use crate::pool::{IndexedFn, ThreadPool};
use crate::schedule::{CancelIndex, ScheduleQueue};
use crate::task::{CancelToken, ScheduledTask, Task};
use crate::types::{DispatchKind, TaskGroup, GROUP_COUNT};
use parking_lot::Mutex;
use std::array;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, trace};

/// Shared state reachable from both the façade and the tick loop.
struct Core {
    id: u64,
    clock: TickClock,
    parker: Parker,
    inboxes: Mutex<Vec<Arc<Inbox>>>,
    cancels: CancelIndex,
    next_task_id: AtomicU64,
    cycles: AtomicU64,
    shutdown: AtomicBool,
    fanout: FanOut,
    pool: Arc<ThreadPool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Core {
    fn thread_inbox(&self) -> Arc<Inbox> {
        inbox::thread_inbox(self.id, |created| self.inboxes.lock().push(created))
    }

    #[inline]
    fn notify(&self) {
        self.parker.unpark();
    }
}

/// Handle to a running dispatcher.
///
/// All methods take `&self`; share the dispatcher across producer threads
/// behind an `Arc` or a plain reference. Dropping the handle shuts the
/// dispatcher down and joins its threads.
pub struct Dispatcher {
    core: Arc<Core>,
}

impl Dispatcher {
    /// Starts the worker pool and the dispatcher thread.
    ///
    /// # Errors
    ///
    /// Returns [`StartError`] when the configuration is invalid or a thread
    /// cannot be spawned.
    pub fn start(config: DispatcherConfig) -> Result<Self, StartError> {
        static NEXT_DISPATCHER_ID: AtomicU64 = AtomicU64::new(1);

        config.validate()?;
        let workers = config.effective_worker_threads();
        let pool = Arc::new(ThreadPool::new(workers, &config.thread_name)?);
        let core = Arc::new(Core {
            id: NEXT_DISPATCHER_ID.fetch_add(1, Ordering::Relaxed),
            clock: TickClock::new(),
            parker: Parker::new(),
            inboxes: Mutex::new(Vec::new()),
            cancels: CancelIndex::new(),
            next_task_id: AtomicU64::new(1),
            cycles: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            fanout: FanOut::new(Arc::clone(&pool)),
            pool,
            thread: Mutex::new(None),
        });

        let handle = std::thread::Builder::new()
            .name(format!("{}-dispatch", config.thread_name))
            .spawn({
                let core = Arc::clone(&core);
                move || TickLoop::new(core).run()
            })
            .map_err(StartError::Spawn)?;
        core.thread.lock().replace(handle);
        info!(workers, "dispatcher started");
        Ok(Self { core })
    }

    /// Appends a serial task to the current thread's inbox and wakes the
    /// dispatcher. The task runs on the dispatcher thread with exclusive
    /// logical access to world state.
    pub fn post(&self, f: impl FnOnce() + Send + 'static, label: &'static str) {
        self.post_expiring(f, label, 0);
    }

    /// Like [`post`](Self::post), but the task is dropped without invocation
    /// when more than `expires_after_ms` elapse between submission and the
    /// serial batch that reaches it. `0` means no expiry.
    pub fn post_expiring(
        &self,
        f: impl FnOnce() + Send + 'static,
        label: &'static str,
        expires_after_ms: u64,
    ) {
        let task = Task::new(Box::new(f), label, expires_after_ms, self.core.clock.now_ms());
        self.core.thread_inbox().push(TaskGroup::Serial, task);
        self.core.notify();
    }

    /// Appends a task to the given parallel group. When called from inside
    /// a running task, the new task adopts the running task's context
    /// label. Async work posted mid-tick still runs within that tick.
    pub fn post_async(&self, f: impl FnOnce() + Send + 'static, group: TaskGroup) {
        debug_assert!(group.is_parallel(), "post_async requires a parallel group");
        let label = context::current().task_name();
        let task = Task::new(Box::new(f), label, 0, self.core.clock.now_ms());
        self.core.thread_inbox().push(group, task);
        self.core.notify();
    }

    /// Schedules `f` to fire `period_ms` from now on the serial stage and
    /// returns a cancellation handle. With `cycle == true` the task re-arms
    /// itself every `period_ms` after each successful invocation.
    pub fn schedule(
        &self,
        period_ms: u64,
        f: impl FnMut() + Send + 'static,
        label: &'static str,
        cycle: bool,
    ) -> u64 {
        let id = self.core.next_task_id.fetch_add(1, Ordering::Relaxed);
        let token = Arc::new(CancelToken::default());
        self.core.cancels.register(id, Arc::clone(&token));
        let due_at_ms = self.core.clock.now_ms() + period_ms;
        let task = ScheduledTask::new(id, due_at_ms, period_ms, cycle, label, token, Box::new(f));
        self.core.thread_inbox().push_scheduled(task);
        self.core.notify();
        id
    }

    /// Cancels a scheduled task. Safe from any thread; an unknown id
    /// (already fired, already cancelled, never existed) is a no-op.
    pub fn cancel(&self, id: u64) {
        if self.core.cancels.cancel(id) {
            debug!(id, "scheduled task cancelled");
        }
    }

    /// Runs `f` inline when the calling thread already holds serial
    /// semantics (it is not inside a parallel-stage task); otherwise posts
    /// it to the serial stage.
    pub fn try_post(&self, f: impl FnOnce() + Send + 'static, label: &'static str) {
        if context::current().is_async() {
            self.post(f, label);
        } else {
            f();
        }
    }

    /// Fans `f(i)` for `i ∈ [0, len)` out over the worker pool, running the
    /// first chunk inline and awaiting the rest. A nested call from inside
    /// a fan-out item executes fully inline on the item's thread.
    pub fn fan_out(&self, len: usize, f: impl Fn(usize) + Send + Sync + 'static) {
        self.core.fanout.run(len, Arc::new(f));
    }

    /// True once the first tick has refreshed the clock.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.core.clock.is_live()
    }

    /// Number of serial tasks executed successfully since startup.
    #[must_use]
    pub fn cycle_count(&self) -> u64 {
        self.core.cycles.load(Ordering::Relaxed)
    }

    /// Cached tick timestamp in milliseconds since startup.
    #[must_use]
    pub fn now_ms(&self) -> u64 {
        self.core.clock.now_ms()
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.core.shutdown.load(Ordering::Acquire)
    }

    /// Stops the tick loop and the worker pool and joins their threads.
    /// Idempotent. Must not be called from inside a dispatched task: the
    /// join would wait on the calling thread itself.
    pub fn shutdown(&self) {
        if !self.core.shutdown.swap(true, Ordering::AcqRel) {
            debug!("dispatcher shutdown requested");
        }
        self.core.parker.unpark();
        let handle = self.core.thread.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        self.core.pool.shutdown();
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("ready", &self.is_ready())
            .field("stopped", &self.is_stopped())
            .field("cycles", &self.cycle_count())
            .finish_non_exhaustive()
    }
}

/// Dispatcher-thread-local loop state. The pending-task arrays and the
/// scheduled registry live here, outside any lock: only this thread ever
/// touches them.
struct TickLoop {
    core: Arc<Core>,
    groups: [Vec<Task>; GROUP_COUNT],
    queue: ScheduleQueue,
    snapshot: Vec<Arc<Inbox>>,
    scratch_scheduled: Vec<ScheduledTask>,
}

impl TickLoop {
    fn new(core: Arc<Core>) -> Self {
        Self {
            core,
            groups: array::from_fn(|_| Vec::new()),
            queue: ScheduleQueue::new(),
            snapshot: Vec::new(),
            scratch_scheduled: Vec::new(),
        }
    }

    fn run(&mut self) {
        debug!("dispatcher loop running");
        while !self.core.shutdown.load(Ordering::Acquire) {
            self.core.clock.refresh();
            self.run_stages(TaskGroup::Serial.ordinal());
            self.fire_scheduled();
            self.merge_all();
            if !self.has_pending() {
                match self.queue.next_deadline() {
                    Some(due) => {
                        let remaining = due.saturating_sub(self.core.clock.now_ms());
                        self.core.parker.park_timeout(Duration::from_millis(remaining));
                    }
                    None => self.core.parker.park(),
                }
            }
        }
        debug!("dispatcher loop stopped");
    }

    /// Runs group stages in ordinal order starting at `start`, stopping at
    /// the first empty group. After the serial batch the parallel portions
    /// of every inbox are re-merged, so async follow-ups posted by serial
    /// tasks run in this same tick.
    fn run_stages(&mut self, start: usize) {
        for g in start..GROUP_COUNT {
            if self.groups[g].is_empty() {
                return;
            }
            if g == TaskGroup::Serial.ordinal() {
                self.run_serial();
                self.merge_parallel();
            } else {
                self.run_parallel(g);
            }
        }
    }

    fn run_serial(&mut self) {
        let tasks = mem::take(&mut self.groups[TaskGroup::Serial.ordinal()]);
        let now = self.core.clock.now_ms();
        let batch = tasks.len();
        context::enter(TaskGroup::Serial, DispatchKind::Event);
        for task in tasks {
            context::set_task_name(task.label());
            if task.execute(now) {
                self.core.cycles.fetch_add(1, Ordering::Relaxed);
            }
        }
        context::reset();
        trace!(batch, "serial batch complete");
    }

    fn run_parallel(&mut self, g: usize) {
        let tasks = mem::take(&mut self.groups[g]);
        let group = TaskGroup::ALL[g];
        let now = self.core.clock.now_ms();
        let batch = tasks.len();
        let slots: Arc<Vec<Mutex<Option<Task>>>> =
            Arc::new(tasks.into_iter().map(|t| Mutex::new(Some(t))).collect());
        let f: IndexedFn = Arc::new(move |i| {
            let Some(task) = slots[i].lock().take() else {
                return;
            };
            context::enter(group, DispatchKind::AsyncEvent);
            context::set_task_name(task.label());
            task.execute(now);
            context::reset();
        });
        self.core.fanout.run(batch, f);
        trace!(group = group.name(), batch, "parallel batch complete");
    }

    /// Walks the registry in deadline order, firing everything due. Cycles
    /// that survive are re-enqueued through the dispatcher's own inbox and
    /// merged back at end of tick, so a burst of same-deadline cycles does
    /// not reshuffle the registry once per firing. Async work posted by
    /// timer callbacks then runs via a parallel-only staged pass.
    fn fire_scheduled(&mut self) {
        let now = self.core.clock.now_ms();
        let own_inbox = self.core.thread_inbox();
        let mut fired = 0u32;
        while let Some(mut task) = self.queue.pop_due(now) {
            let kind = if task.is_cycle() {
                DispatchKind::CycleEvent
            } else {
                DispatchKind::ScheduledEvent
            };
            context::enter(TaskGroup::Serial, kind);
            context::set_task_name(task.label());
            if task.execute() && task.is_cycle() {
                task.advance();
                own_inbox.push_scheduled(task);
            } else {
                self.core.cancels.forget(task.id());
            }
            fired += 1;
        }
        if fired > 0 {
            context::reset();
            trace!(fired, "scheduled tasks fired");
        }
        self.merge_parallel();
        self.run_stages(TaskGroup::PARALLEL_START);
    }

    fn snapshot_inboxes(&mut self) {
        self.snapshot.clear();
        self.snapshot.extend(self.core.inboxes.lock().iter().cloned());
    }

    /// Async-only merge: parallel groups of every inbox, one inbox lock at
    /// a time. Serial entries stay put so mid-tick serial submissions never
    /// race into the current serial batch.
    fn merge_parallel(&mut self) {
        self.snapshot_inboxes();
        for inbox in &self.snapshot {
            inbox.drain_parallel(&mut self.groups);
        }
    }

    /// Full merge: every group plus scheduled submissions.
    fn merge_all(&mut self) {
        self.snapshot_inboxes();
        for inbox in &self.snapshot {
            inbox.drain_all(&mut self.groups, &mut self.scratch_scheduled);
        }
        for task in self.scratch_scheduled.drain(..) {
            self.queue.insert(task);
        }
    }

    fn has_pending(&self) -> bool {
        self.groups.iter().any(|tasks| !tasks.is_empty())
    }
}
