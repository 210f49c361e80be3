//! Output sinks receiving stats snapshots

use super::snapshot::Snapshot;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt::Write as _;

/// Receiver of periodic stats snapshots
///
/// Sinks are invoked concurrently with each other and the stats engine
/// waits for every sink before the next tick, so a slow sink throttles
/// reporting without corrupting stats.
#[async_trait]
pub trait Output: Send + Sync {
    /// Called once when a run starts
    async fn on_start(&self) {}

    /// Called on every report tick and once more with the final snapshot
    async fn on_event(&self, snapshot: &Snapshot);

    /// Called once after the final snapshot
    async fn on_stop(&self) {}
}

/// Prints a stats table to stdout on every event and a summary on stop
#[derive(Debug, Default)]
pub struct ConsoleOutput {
    last: Mutex<Option<Snapshot>>,
}

impl ConsoleOutput {
    /// Create a console sink
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Output for ConsoleOutput {
    async fn on_event(&self, snapshot: &Snapshot) {
        println!("{}", render_table(snapshot));
        *self.last.lock() = Some(snapshot.clone());
    }

    async fn on_stop(&self) {
        let Some(snapshot) = self.last.lock().take() else {
            return;
        };
        println!("\n=== Final summary ===\n{}", render_table(&snapshot));
        if !snapshot.errors.is_empty() {
            println!("{}", render_errors(&snapshot));
        }
    }
}

/// Render the per-entry table followed by the total row
pub fn render_table(snapshot: &Snapshot) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} | state: {} | users: {} | transactions: {} passed, {} failed",
        snapshot.timestamp.format("%Y/%m/%d %H:%M:%S"),
        snapshot.state,
        snapshot.user_count,
        snapshot.transactions.passed,
        snapshot.transactions.failed,
    );
    let _ = writeln!(
        out,
        "{:<12} {:<40} {:>10} {:>8} {:>8} {:>8} {:>8} {:>8} {:>10} {:>10} {:>10}",
        "Type",
        "Name",
        "# reqs",
        "# fails",
        "Median",
        "Average",
        "Min",
        "Max",
        "Content",
        "# reqs/sec",
        "# fails/sec"
    );

    for entry in snapshot.stats.iter().chain(std::iter::once(&snapshot.total)) {
        let _ = writeln!(
            out,
            "{:<12} {:<40} {:>10} {:>8} {:>8} {:>8.1} {:>8} {:>8} {:>10.0} {:>10.2} {:>10.2}",
            truncate(&entry.request_type, 12),
            truncate(&entry.name, 40),
            entry.num_requests,
            entry.num_failures,
            entry.median_response_time,
            entry.avg_response_time,
            entry.min_response_time,
            entry.max_response_time,
            entry.avg_content_length,
            entry.current_rps,
            entry.current_fail_per_sec,
        );
    }
    out
}

/// Render the error table
pub fn render_errors(snapshot: &Snapshot) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{:>12}  {:<12} {:<30} Error", "Occurrences", "Type", "Name");
    for error in &snapshot.errors {
        let _ = writeln!(
            out,
            "{:>12}  {:<12} {:<30} {}",
            error.occurrences,
            truncate(&error.request_type, 12),
            truncate(&error.name, 30),
            error.error
        );
    }
    out
}

fn truncate(s: &str, width: usize) -> &str {
    match s.char_indices().nth(width) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
