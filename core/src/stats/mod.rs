//! Statistics pipeline
//!
//! Execution units report request outcomes through a [`StatsRecorder`]. A
//! single consumer task per run folds them into [`RequestStats`] and pushes a
//! [`Snapshot`] to every registered [`Output`] on each report tick, plus a
//! final one when the run stops.

mod engine;
mod entry;
mod output;
mod snapshot;

pub use engine::{publish, RunnerView, StatsEngine, StatsRecorder, DEFAULT_REPORT_INTERVAL};
pub use entry::{
    FailureEvent, RequestStats, StatsEntry, SuccessEvent, TransactionEvent, TRANSACTION_TYPE,
};
pub use output::{render_errors, render_table, ConsoleOutput, Output};
pub use snapshot::{EntrySummary, ErrorSummary, Snapshot, TransactionCounts};
