//! Shared iteration budget for bounded runs

use std::sync::atomic::{AtomicI64, Ordering};

/// Total number of task executions shared by all execution units
///
/// `0 <= finished <= acquired <= loop_count` holds at all times: `acquire`
/// is the only admission gate and never overshoots.
#[derive(Debug)]
pub struct LoopBudget {
    loop_count: i64,
    acquired: AtomicI64,
    finished: AtomicI64,
}

impl LoopBudget {
    /// Create a budget of `loop_count` executions
    pub fn new(loop_count: i64) -> Self {
        Self {
            loop_count: loop_count.max(0),
            acquired: AtomicI64::new(0),
            finished: AtomicI64::new(0),
        }
    }

    /// Take one ticket; `false` once the budget is spent
    pub fn acquire(&self) -> bool {
        self.acquired
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.loop_count).then_some(n + 1)
            })
            .is_ok()
    }

    /// Record one finished execution
    ///
    /// Returns `true` for exactly one caller: the one whose execution
    /// completes the budget.
    pub fn finish(&self) -> bool {
        self.finished.fetch_add(1, Ordering::AcqRel) + 1 == self.loop_count
    }

    /// All tickets executed
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire) >= self.loop_count
    }

    /// Configured number of executions
    pub fn loop_count(&self) -> i64 {
        self.loop_count
    }

    /// Tickets handed out so far
    pub fn acquired(&self) -> i64 {
        self.acquired.load(Ordering::Acquire)
    }

    /// Executions completed so far
    pub fn finished(&self) -> i64 {
        self.finished.load(Ordering::Acquire)
    }
}
