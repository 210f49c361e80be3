//! Per-request statistics owned by the stats consumer

use super::snapshot::{EntrySummary, ErrorSummary, Snapshot, TransactionCounts};
use crate::runner::RunnerState;

use hdrhistogram::Histogram;
use std::collections::{BTreeMap, HashMap};

/// Seconds of per-second counters kept per entry
const ROLLING_WINDOW_SECS: i64 = 20;

/// Seconds averaged for the current request rate
const CURRENT_RPS_WINDOW_SECS: i64 = 10;

/// Request type recorded for transactions
pub const TRANSACTION_TYPE: &str = "transaction";

/// Successful request outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuccessEvent {
    /// Request type
    pub request_type: String,
    /// Request name
    pub name: String,
    /// Response time (ms)
    pub response_time: u64,
    /// Response size (bytes)
    pub content_length: u64,
    /// Completion time (unix ms)
    pub timestamp: i64,
}

/// Failed request outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureEvent {
    /// Request type
    pub request_type: String,
    /// Request name
    pub name: String,
    /// Response time (ms)
    pub response_time: u64,
    /// Error message
    pub error: String,
    /// Completion time (unix ms)
    pub timestamp: i64,
}

/// Transaction outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionEvent {
    /// Transaction name
    pub name: String,
    /// Whether the transaction passed
    pub success: bool,
    /// Elapsed time (ms)
    pub elapsed: u64,
    /// Bytes transferred
    pub content_size: u64,
    /// Completion time (unix ms)
    pub timestamp: i64,
}

/// Empty response-time histogram, auto-resizing with three significant figures
pub(crate) fn response_time_histogram() -> Histogram<u64> {
    Histogram::new(3).expect("3 significant figures is a valid precision")
}

/// Recorded values with their counts, lowest first
pub(crate) fn histogram_buckets(histogram: &Histogram<u64>) -> Vec<(u64, u64)> {
    histogram
        .iter_recorded()
        .map(|bucket| (bucket.value_iterated_to(), bucket.count_at_value()))
        .collect()
}

pub(crate) fn percentile(histogram: &Histogram<u64>, q: f64) -> u64 {
    if histogram.is_empty() {
        0
    } else {
        histogram.value_at_quantile(q)
    }
}

/// Rolling and cumulative stats for one (request type, name) key
pub struct StatsEntry {
    name: String,
    request_type: String,
    num_requests: u64,
    num_failures: u64,
    total_response_time: u64,
    min_response_time: u64,
    max_response_time: u64,
    total_content_length: u64,
    response_times: Histogram<u64>,
    num_reqs_per_sec: BTreeMap<i64, u64>,
    num_fail_per_sec: BTreeMap<i64, u64>,
    newest_sec: i64,
}

impl StatsEntry {
    /// Create an empty entry
    pub fn new(request_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            request_type: request_type.into(),
            num_requests: 0,
            num_failures: 0,
            total_response_time: 0,
            min_response_time: 0,
            max_response_time: 0,
            total_content_length: 0,
            response_times: response_time_histogram(),
            num_reqs_per_sec: BTreeMap::new(),
            num_fail_per_sec: BTreeMap::new(),
            newest_sec: i64::MIN,
        }
    }

    /// Record one request
    pub fn log(&mut self, response_time: u64, content_length: u64, timestamp_ms: i64) {
        self.num_requests += 1;
        self.total_content_length += content_length;
        self.total_response_time += response_time;
        if self.num_requests == 1 || response_time < self.min_response_time {
            self.min_response_time = response_time;
        }
        self.max_response_time = self.max_response_time.max(response_time);
        let _ = self.response_times.record(response_time);

        let sec = timestamp_ms.div_euclid(1000);
        Self::bump(&mut self.num_reqs_per_sec, sec, self.newest_sec);
        self.advance(sec);
    }

    /// Record one failure; the request itself is logged separately
    pub fn log_error(&mut self, timestamp_ms: i64) {
        self.num_failures += 1;
        let sec = timestamp_ms.div_euclid(1000);
        Self::bump(&mut self.num_fail_per_sec, sec, self.newest_sec);
        self.advance(sec);
    }

    fn bump(buckets: &mut BTreeMap<i64, u64>, sec: i64, newest_sec: i64) {
        // buckets older than the window are never (re)created
        if newest_sec == i64::MIN || sec > newest_sec - ROLLING_WINDOW_SECS {
            *buckets.entry(sec).or_insert(0) += 1;
        }
    }

    fn advance(&mut self, sec: i64) {
        if sec <= self.newest_sec {
            return;
        }
        self.newest_sec = sec;
        let cutoff = sec - ROLLING_WINDOW_SECS + 1;
        self.num_reqs_per_sec = self.num_reqs_per_sec.split_off(&cutoff);
        self.num_fail_per_sec = self.num_fail_per_sec.split_off(&cutoff);
    }

    /// Mean response time (ms)
    pub fn avg_response_time(&self) -> f64 {
        if self.num_requests == 0 {
            0.0
        } else {
            self.total_response_time as f64 / self.num_requests as f64
        }
    }

    /// Response time at quantile `q` (0.0 - 1.0)
    pub fn response_time_percentile(&self, q: f64) -> u64 {
        percentile(&self.response_times, q)
    }

    /// Requests recorded
    pub fn num_requests(&self) -> u64 {
        self.num_requests
    }

    /// Failures recorded
    pub fn num_failures(&self) -> u64 {
        self.num_failures
    }

    fn per_sec(buckets: &BTreeMap<i64, u64>, now_sec: i64) -> f64 {
        let from = now_sec - CURRENT_RPS_WINDOW_SECS;
        let count: u64 = buckets.range(from..now_sec).map(|(_, n)| n).sum();
        count as f64 / CURRENT_RPS_WINDOW_SECS as f64
    }

    /// Summary as of `now_sec` (unix seconds)
    pub fn summary(&self, now_sec: i64) -> EntrySummary {
        let avg_content_length = if self.num_requests == 0 {
            0.0
        } else {
            self.total_content_length as f64 / self.num_requests as f64
        };

        EntrySummary {
            name: self.name.clone(),
            request_type: self.request_type.clone(),
            num_requests: self.num_requests,
            num_failures: self.num_failures,
            total_response_time: self.total_response_time,
            min_response_time: self.min_response_time,
            max_response_time: self.max_response_time,
            avg_response_time: self.avg_response_time(),
            median_response_time: self.response_time_percentile(0.5),
            p90_response_time: self.response_time_percentile(0.9),
            p99_response_time: self.response_time_percentile(0.99),
            response_times: histogram_buckets(&self.response_times),
            total_content_length: self.total_content_length,
            avg_content_length,
            current_rps: Self::per_sec(&self.num_reqs_per_sec, now_sec),
            current_fail_per_sec: Self::per_sec(&self.num_fail_per_sec, now_sec),
        }
    }
}

impl std::fmt::Debug for StatsEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsEntry")
            .field("name", &self.name)
            .field("request_type", &self.request_type)
            .field("num_requests", &self.num_requests)
            .field("num_failures", &self.num_failures)
            .finish()
    }
}

/// All stats of one run, mutated only by the stats consumer
#[derive(Debug)]
pub struct RequestStats {
    entries: HashMap<(String, String), StatsEntry>,
    total: StatsEntry,
    errors: HashMap<(String, String, String), u64>,
    transactions: TransactionCounts,
}

impl RequestStats {
    /// Create empty stats
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            total: StatsEntry::new("", "Total"),
            errors: HashMap::new(),
            transactions: TransactionCounts::default(),
        }
    }

    fn entry(&mut self, request_type: &str, name: &str) -> &mut StatsEntry {
        self.entries
            .entry((request_type.to_string(), name.to_string()))
            .or_insert_with(|| StatsEntry::new(request_type, name))
    }

    /// Record a successful request
    pub fn log_success(&mut self, event: &SuccessEvent) {
        self.entry(&event.request_type, &event.name).log(
            event.response_time,
            event.content_length,
            event.timestamp,
        );
        self.total
            .log(event.response_time, event.content_length, event.timestamp);
    }

    /// Record a failed request
    pub fn log_failure(&mut self, event: &FailureEvent) {
        let entry = self.entry(&event.request_type, &event.name);
        entry.log(event.response_time, 0, event.timestamp);
        entry.log_error(event.timestamp);
        self.total.log(event.response_time, 0, event.timestamp);
        self.total.log_error(event.timestamp);

        *self
            .errors
            .entry((
                event.request_type.clone(),
                event.name.clone(),
                event.error.clone(),
            ))
            .or_insert(0) += 1;
    }

    /// Record a transaction outcome
    pub fn log_transaction(&mut self, event: &TransactionEvent) {
        if event.success {
            self.transactions.passed += 1;
            self.log_success(&SuccessEvent {
                request_type: TRANSACTION_TYPE.into(),
                name: event.name.clone(),
                response_time: event.elapsed,
                content_length: event.content_size,
                timestamp: event.timestamp,
            });
        } else {
            self.transactions.failed += 1;
            self.log_failure(&FailureEvent {
                request_type: TRANSACTION_TYPE.into(),
                name: event.name.clone(),
                response_time: event.elapsed,
                error: "transaction failed".into(),
                timestamp: event.timestamp,
            });
        }
    }

    /// Aggregate entry
    pub fn total(&self) -> &StatsEntry {
        &self.total
    }

    /// Entry for a key, if any request was recorded under it
    pub fn get(&self, request_type: &str, name: &str) -> Option<&StatsEntry> {
        self.entries
            .get(&(request_type.to_string(), name.to_string()))
    }

    /// Transaction counters
    pub fn transactions(&self) -> TransactionCounts {
        self.transactions
    }

    /// Build the report published to output sinks
    pub fn snapshot(&self, state: RunnerState, user_count: i64) -> Snapshot {
        let timestamp = chrono::Utc::now();
        let now_sec = timestamp.timestamp();

        let mut stats: Vec<EntrySummary> =
            self.entries.values().map(|e| e.summary(now_sec)).collect();
        stats.sort_by(|a, b| {
            (a.request_type.as_str(), a.name.as_str())
                .cmp(&(b.request_type.as_str(), b.name.as_str()))
        });

        let mut errors: Vec<ErrorSummary> = self
            .errors
            .iter()
            .map(|((request_type, name, error), occurrences)| ErrorSummary {
                name: name.clone(),
                request_type: request_type.clone(),
                error: error.clone(),
                occurrences: *occurrences,
            })
            .collect();
        errors.sort_by(|a, b| {
            b.occurrences
                .cmp(&a.occurrences)
                .then_with(|| a.error.cmp(&b.error))
                .then_with(|| a.request_type.cmp(&b.request_type))
                .then_with(|| a.name.cmp(&b.name))
        });

        Snapshot {
            timestamp,
            state,
            user_count,
            stats,
            total: self.total.summary(now_sec),
            errors,
            transactions: self.transactions,
        }
    }
}

impl Default for RequestStats {
    fn default() -> Self {
        Self::new()
    }
}
