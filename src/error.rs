//! Error types and error handling strategy.
//!
//! The dispatcher swallows task-level failures by design: a panicking
//! callable is caught, logged with its context label, and the tick
//! continues. The typed errors here cover the boundaries where a caller can
//! actually react: configuration validation and worker-pool submission.
//!
//! - **Task failure**: caught, logged, swallowed; never surfaces as a value.
//! - **Expiry**: an overdue serial task is dropped silently before invocation.
//! - **Cancel miss**: cancelling an unknown id is treated as success.
//! - **Pool failure**: surfaces as [`PoolError`]; the fan-out adapter
//!   reacts by running the remainder inline on the calling thread.

use thiserror::Error;

/// Configuration validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The thread name prefix must not be empty.
    #[error("thread name prefix must not be empty")]
    EmptyThreadName,
    /// Worker thread count exceeds the supported maximum.
    #[error("worker thread count {0} exceeds the maximum of {max}", max = crate::config::MAX_WORKER_THREADS)]
    TooManyWorkers(usize),
}

/// Worker-pool submission and startup failures.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Shutdown has been requested; no further work is accepted.
    #[error("worker pool is stopped")]
    Stopped,
    /// A worker thread could not be spawned.
    #[error("failed to spawn worker thread")]
    Spawn(#[from] std::io::Error),
}

/// Dispatcher startup failures.
#[derive(Debug, Error)]
pub enum StartError {
    /// The supplied configuration failed validation.
    #[error("invalid dispatcher configuration")]
    Config(#[from] ConfigError),
    /// The worker pool could not be started.
    #[error("worker pool startup failed")]
    Pool(#[from] PoolError),
    /// The dispatcher thread could not be spawned.
    #[error("failed to spawn dispatcher thread")]
    Spawn(#[source] std::io::Error),
}
