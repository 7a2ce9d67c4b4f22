//! Single-consumer game-tick dispatcher with a bounded parallel fan-out
//! stage.
//!
//! A game server mutates its authoritative world state under sequential
//! consistency: rather than locking every object, all mutations funnel
//! through one dispatcher thread. CPU-heavy, independent work still has to
//! use every core, so the serial stage is extended with group-scoped
//! parallel stages that fan out over a worker pool and are awaited before
//! the next serial batch.
//!
//! # Architecture
//!
//! - **Inboxes**: every submitting thread buffers work in its own
//!   mutex-guarded inbox; the hot post path never contends with other
//!   producers. The dispatcher drains inboxes once per tick (plus mid-tick
//!   async-only merges).
//! - **Tick loop**: refresh the clock, run the serial batch, fan out each
//!   parallel group, fire due timers, merge, sleep until the next deadline
//!   or a wake signal.
//! - **Scheduled registry**: an ordered set keyed by `(deadline, id)`;
//!   cycling tasks re-arm themselves through the inbox path.
//! - **Fan-out adapter**: partitions indexed work across the pool with an
//!   inline first chunk; nested fan-outs degrade to sequential execution so
//!   the pool is never re-entered recursively.
//!
//! # Threading contract
//!
//! Callables in the [`TaskGroup::Serial`] group hold exclusive logical
//! access to world state; callables in parallel groups must stay read-only
//! or shard-local. Tasks may freely submit further work but must never
//! block on other dispatched work; there is only one consumer.

pub mod clock;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod pool;
pub mod types;

mod fanout;
mod inbox;
mod parker;
mod schedule;
mod task;

pub use clock::TickClock;
pub use config::DispatcherConfig;
pub use context::{current as current_context, DispatchContext};
pub use dispatcher::Dispatcher;
pub use error::{ConfigError, PoolError, StartError};
pub use pool::{CompletionHandle, ThreadPool};
pub use types::{DispatchKind, TaskGroup, GROUP_COUNT};
