//! Bounded batch execution and shutdown draining.
//!
//! - [`DrainLock`]: counts in-flight units of work so a shutdown can wait for them.
//! - [`BoundedRun`]: maps a batch of inputs with a concurrency limit, preserving input order.
mod error;
pub use error::{ConfigError, RunError, RunResult};

pub mod bounded;
pub use bounded::{BoundedRun, run_bounded, run_bounded_blocking};

pub mod drain;
pub use drain::{DrainGuard, DrainLock, DrainOutcome, DrainState, global};

mod config;
pub use config::{ENV_CONCURRENCY, ENV_DRAIN_TIMEOUT_MS, SyncConfig};

pub mod prelude {
    pub use crate::error::{RunError, RunResult};
    pub use crate::{BoundedRun, DrainGuard, DrainLock, DrainOutcome, global, run_bounded};
}
