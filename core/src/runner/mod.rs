//! Execution runner
//!
//! A [`Runner`] owns the pool of execution units. Each unit is a tokio task
//! running a simple loop: **check stop -> take loop ticket -> wait for rate
//! permit -> run a weighted task -> repeat**. Task panics are caught per
//! execution and reported as failures, so one bad task never takes down the
//! pool.
//!
//! The shared pieces units touch on every iteration, the [`LoopBudget`] and
//! the [`RateLimiter`], are lock-free atomics.
//!
//! # Example
//!
//! ```no_run
//! use boomer_core::{LocalRunner, Runner, Task};
//!
//! # async fn example() -> boomer_core::Result<()> {
//! let runner = Runner::new();
//! runner.set_tasks(vec![Task::new("ping", 1, || async {})]);
//! runner.set_loop_count(100);
//!
//! let local = LocalRunner::new(runner, 10, 5.0);
//! local.run().await?;
//! local.runner().wait_stopped().await;
//! # Ok(())
//! # }
//! ```

mod budget;
mod executor;
mod local;
mod rate_limiter;
mod state;

pub use budget::LoopBudget;
pub use executor::{Runner, SpawnComplete, PANIC_REQUEST_TYPE};
pub use local::LocalRunner;
pub use rate_limiter::{
    parse_ramp_spec, RampUpRateLimiter, RateLimiter, StableRateLimiter, DEFAULT_REFILL_PERIOD,
    RAMP_DISABLED,
};
pub use state::{RunnerState, StateCell};

#[cfg(test)]
mod tests;
