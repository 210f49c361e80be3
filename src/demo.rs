//! Built-in demo workload
//!
//! A sleep-based task that lets the engine be exercised end to end without
//! a system under test.

use boomer_core::{StatsRecorder, Task};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Parameters of the demo task; the master ships them to its workers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DemoWorkload {
    /// Mean simulated response time
    pub delay_ms: u64,
    /// Share of executions reported as failures, 0.0 to 1.0
    pub failure_rate: f64,
}

impl DemoWorkload {
    /// Tasks recording into `recorder`
    pub fn tasks(&self, recorder: StatsRecorder) -> Vec<Task> {
        let delay_ms = self.delay_ms;
        let failure_rate = self.failure_rate.clamp(0.0, 1.0);

        vec![Task::new("sleep", 1, move || {
            let recorder = recorder.clone();
            async move {
                let (jitter, fail) = {
                    let mut rng = rand::thread_rng();
                    (rng.gen_range(0..=delay_ms / 2), rng.gen_bool(failure_rate))
                };
                let started = Instant::now();
                tokio::time::sleep(Duration::from_millis(delay_ms / 2 + jitter)).await;
                let elapsed = started.elapsed().as_millis() as u64;

                if fail {
                    recorder
                        .record_failure("demo", "sleep", elapsed, "simulated failure")
                        .await;
                } else {
                    recorder.record_success("demo", "sleep", elapsed, 0).await;
                }
            }
        })]
    }

    /// Payload for `spawn` messages
    pub fn to_payload(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Decode a `spawn` payload
    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        match serde_json::from_slice(payload) {
            Ok(workload) => Some(workload),
            Err(e) => {
                tracing::warn!(error = %e, "Unrecognized demo payload");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_roundtrip() {
        let workload = DemoWorkload {
            delay_ms: 50,
            failure_rate: 0.1,
        };
        let payload = workload.to_payload().unwrap();
        assert_eq!(DemoWorkload::from_payload(&payload), Some(workload));
        assert_eq!(DemoWorkload::from_payload(b"garbage"), None);
    }
}
