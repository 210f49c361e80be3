//! Snapshot types published to output sinks

use super::entry::{histogram_buckets, percentile, response_time_histogram};
use crate::runner::RunnerState;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Point-in-time view of one stats entry (or of the total)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntrySummary {
    /// Request name
    pub name: String,
    /// Request type (method, protocol, "transaction", ...)
    pub request_type: String,
    /// Requests recorded, failures included
    pub num_requests: u64,
    /// Failed requests
    pub num_failures: u64,
    /// Sum of response times (ms)
    pub total_response_time: u64,
    /// Fastest response (ms)
    pub min_response_time: u64,
    /// Slowest response (ms)
    pub max_response_time: u64,
    /// Mean response time (ms)
    pub avg_response_time: f64,
    /// Median response time (ms)
    pub median_response_time: u64,
    /// 90th percentile response time (ms)
    pub p90_response_time: u64,
    /// 99th percentile response time (ms)
    pub p99_response_time: u64,
    /// Response-time histogram as `(value, count)` pairs, lowest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_times: Vec<(u64, u64)>,
    /// Sum of response sizes (bytes)
    pub total_content_length: u64,
    /// Mean response size (bytes)
    pub avg_content_length: f64,
    /// Requests per second over the recent window
    pub current_rps: f64,
    /// Failures per second over the recent window
    pub current_fail_per_sec: f64,
}

impl EntrySummary {
    /// Fold another summary for the same key into this one
    ///
    /// Counters, totals and rates add up; min/max combine. Percentiles are
    /// recomputed from the merged histograms; when either side came without
    /// one, the worst of the two is kept instead.
    pub fn merge(&mut self, other: &EntrySummary) {
        if other.num_requests == 0 {
            return;
        }
        self.min_response_time = if self.num_requests == 0 {
            other.min_response_time
        } else {
            self.min_response_time.min(other.min_response_time)
        };
        self.max_response_time = self.max_response_time.max(other.max_response_time);

        let exact = !other.response_times.is_empty()
            && (self.num_requests == 0 || !self.response_times.is_empty());
        if exact {
            let mut histogram = response_time_histogram();
            for &(value, count) in self.response_times.iter().chain(&other.response_times) {
                let _ = histogram.record_n(value, count);
            }
            self.median_response_time = percentile(&histogram, 0.5);
            self.p90_response_time = percentile(&histogram, 0.9);
            self.p99_response_time = percentile(&histogram, 0.99);
            self.response_times = histogram_buckets(&histogram);
        } else {
            self.median_response_time = self.median_response_time.max(other.median_response_time);
            self.p90_response_time = self.p90_response_time.max(other.p90_response_time);
            self.p99_response_time = self.p99_response_time.max(other.p99_response_time);
            self.response_times.clear();
        }

        self.num_requests += other.num_requests;
        self.num_failures += other.num_failures;
        self.total_response_time += other.total_response_time;
        self.total_content_length += other.total_content_length;
        self.current_rps += other.current_rps;
        self.current_fail_per_sec += other.current_fail_per_sec;

        self.avg_response_time = self.total_response_time as f64 / self.num_requests as f64;
        self.avg_content_length = self.total_content_length as f64 / self.num_requests as f64;
    }

    /// Failure ratio (0.0 - 1.0)
    pub fn fail_ratio(&self) -> f64 {
        if self.num_requests == 0 {
            0.0
        } else {
            self.num_failures as f64 / self.num_requests as f64
        }
    }
}

/// Occurrences of one distinct error
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSummary {
    /// Request name
    pub name: String,
    /// Request type
    pub request_type: String,
    /// Error message
    pub error: String,
    /// Times seen
    pub occurrences: u64,
}

/// Transaction outcome counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionCounts {
    /// Successful transactions
    pub passed: u64,
    /// Failed transactions
    pub failed: u64,
}

/// Report emitted to every output sink on each tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// When the snapshot was taken
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Runner state at snapshot time
    pub state: RunnerState,
    /// Live execution units
    pub user_count: i64,
    /// Per-entry stats sorted by (request type, name)
    pub stats: Vec<EntrySummary>,
    /// Aggregate over all entries
    pub total: EntrySummary,
    /// Distinct errors sorted by occurrences, most frequent first
    pub errors: Vec<ErrorSummary>,
    /// Transaction counters
    pub transactions: TransactionCounts,
}

impl Snapshot {
    /// Empty snapshot
    pub fn empty(state: RunnerState, user_count: i64) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            state,
            user_count,
            stats: Vec::new(),
            total: EntrySummary {
                name: "Total".into(),
                ..Default::default()
            },
            errors: Vec::new(),
            transactions: TransactionCounts::default(),
        }
    }

    /// Combine the latest snapshots of several workers into one
    pub fn aggregate<'a>(
        state: RunnerState,
        parts: impl IntoIterator<Item = &'a Snapshot>,
    ) -> Self {
        let mut merged = Self::empty(state, 0);
        let mut entries: BTreeMap<(String, String), EntrySummary> = BTreeMap::new();
        let mut errors: HashMap<(String, String, String), u64> = HashMap::new();

        for part in parts {
            merged.user_count += part.user_count;
            merged.total.merge(&part.total);
            merged.transactions.passed += part.transactions.passed;
            merged.transactions.failed += part.transactions.failed;
            for entry in &part.stats {
                entries
                    .entry((entry.request_type.clone(), entry.name.clone()))
                    .or_insert_with(|| EntrySummary {
                        name: entry.name.clone(),
                        request_type: entry.request_type.clone(),
                        ..Default::default()
                    })
                    .merge(entry);
            }
            for error in &part.errors {
                *errors
                    .entry((
                        error.request_type.clone(),
                        error.name.clone(),
                        error.error.clone(),
                    ))
                    .or_insert(0) += error.occurrences;
            }
        }

        merged.stats = entries.into_values().collect();
        merged.errors = errors
            .into_iter()
            .map(|((request_type, name, error), occurrences)| ErrorSummary {
                name,
                request_type,
                error,
                occurrences,
            })
            .collect();
        merged.errors.sort_by(|a, b| {
            b.occurrences
                .cmp(&a.occurrences)
                .then_with(|| a.request_type.cmp(&b.request_type))
                .then_with(|| a.name.cmp(&b.name))
                .then_with(|| a.error.cmp(&b.error))
        });
        merged
    }

    /// Snapshot as a generic JSON map, for sinks that push key/value data
    pub fn to_map(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fail_ratio() {
        let entry = EntrySummary {
            num_requests: 10,
            num_failures: 3,
            ..Default::default()
        };
        assert!((entry.fail_ratio() - 0.3).abs() < f64::EPSILON);
        assert_eq!(EntrySummary::default().fail_ratio(), 0.0);
    }

    fn entry(request_type: &str, name: &str, requests: u64, min: u64, max: u64) -> EntrySummary {
        EntrySummary {
            name: name.into(),
            request_type: request_type.into(),
            num_requests: requests,
            total_response_time: requests * 10,
            min_response_time: min,
            max_response_time: max,
            ..Default::default()
        }
    }

    #[test]
    fn test_merge_entries() {
        let mut merged = EntrySummary::default();
        merged.merge(&entry("GET", "/", 4, 5, 20));
        merged.merge(&entry("GET", "/", 6, 2, 15));
        merged.merge(&EntrySummary::default());

        assert_eq!(merged.num_requests, 10);
        assert_eq!(merged.min_response_time, 2);
        assert_eq!(merged.max_response_time, 20);
        assert!((merged.avg_response_time - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_merge_empty_summaries_stays_finite() {
        let mut merged = EntrySummary::default();
        merged.merge(&EntrySummary::default());
        assert_eq!(merged.num_requests, 0);
        assert_eq!(merged.avg_response_time, 0.0);
        assert_eq!(merged.avg_content_length, 0.0);

        let idle = Snapshot::empty(RunnerState::Stopped, 0);
        let merged = Snapshot::aggregate(RunnerState::Stopped, [&idle, &idle]);
        assert!(merged.total.avg_response_time.is_finite());
    }

    #[test]
    fn test_merge_percentiles_from_histograms() {
        use crate::stats::entry::StatsEntry;

        // one fast worker, one slow worker
        let mut fast = StatsEntry::new("GET", "/");
        let mut slow = StatsEntry::new("GET", "/");
        for _ in 0..90 {
            fast.log(10, 0, 0);
        }
        for _ in 0..10 {
            slow.log(1_000, 0, 0);
        }

        let mut merged = EntrySummary::default();
        merged.merge(&fast.summary(0));
        merged.merge(&slow.summary(0));
        assert_eq!(merged.num_requests, 100);
        assert_eq!(merged.median_response_time, 10);
        assert!(merged.p99_response_time >= 1_000 && merged.p99_response_time <= 1_001);
        assert_eq!(merged.response_times.iter().map(|(_, n)| n).sum::<u64>(), 100);

        // without histograms only the worst value is known
        let mut coarse = EntrySummary::default();
        coarse.merge(&EntrySummary {
            response_times: Vec::new(),
            ..fast.summary(0)
        });
        coarse.merge(&slow.summary(0));
        assert!(coarse.median_response_time >= 1_000);
        assert!(coarse.response_times.is_empty());
    }

    #[test]
    fn test_aggregate_worker_snapshots() {
        let mut a = Snapshot::empty(RunnerState::Running, 3);
        a.stats.push(entry("GET", "/", 4, 5, 20));
        a.total.merge(&entry("GET", "/", 4, 5, 20));
        a.errors.push(ErrorSummary {
            name: "/".into(),
            request_type: "GET".into(),
            error: "timeout".into(),
            occurrences: 1,
        });

        let mut b = Snapshot::empty(RunnerState::Running, 2);
        b.stats.push(entry("GET", "/", 6, 2, 15));
        b.stats.push(entry("POST", "/login", 1, 30, 30));
        b.total.merge(&entry("GET", "/", 6, 2, 15));
        b.total.merge(&entry("POST", "/login", 1, 30, 30));
        b.errors.push(ErrorSummary {
            name: "/".into(),
            request_type: "GET".into(),
            error: "timeout".into(),
            occurrences: 2,
        });
        b.transactions.passed = 7;

        let merged = Snapshot::aggregate(RunnerState::Running, [&a, &b]);
        assert_eq!(merged.user_count, 5);
        assert_eq!(merged.total.num_requests, 11);
        assert_eq!(merged.stats.len(), 2);
        assert_eq!(merged.stats[0].request_type, "GET");
        assert_eq!(merged.stats[0].num_requests, 10);
        assert_eq!(merged.errors.len(), 1);
        assert_eq!(merged.errors[0].occurrences, 3);
        assert_eq!(merged.transactions.passed, 7);
        assert_eq!(merged.total.name, "Total");
    }

    #[test]
    fn test_snapshot_map_keys() {
        let snapshot = Snapshot::empty(RunnerState::Running, 4);
        let map = snapshot.to_map().unwrap();

        assert_eq!(map["state"], "running");
        assert_eq!(map["user_count"], 4);
        assert_eq!(map["total"]["name"], "Total");
        assert!(map["stats"].as_array().unwrap().is_empty());
        assert_eq!(map["transactions"]["passed"], 0);
    }
}
