//! boomer-core: Load-generation engine
//!
//! This crate provides everything a boomer process runs, in any of its
//! three participation modes:
//!
//! - Execution runner: weighted task selection, paced spawning, loop budget
//! - Rate limiting (stable and ramp-up)
//! - Statistics aggregation and output sinks
//! - Master/worker control plane over TCP
//! - The [`Boomer`] facade tying them together
//!
//! # Example
//!
//! ```no_run
//! use boomer_core::{Boomer, ConsoleOutput, Task};
//! use std::sync::Arc;
//!
//! # async fn example() -> boomer_core::Result<()> {
//! let mut boomer = Boomer::new(10, 2.0);
//! boomer.set_loop_count(1_000);
//! boomer.add_output(Arc::new(ConsoleOutput::new()));
//!
//! let recorder = boomer.recorder();
//! let task = Task::new("ping", 1, move || {
//!     let recorder = recorder.clone();
//!     async move {
//!         recorder.record_success("tcp", "ping", 3, 0).await;
//!     }
//! });
//! boomer.run(vec![task]).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod boomer;
pub mod channel;
pub mod cluster;
pub mod config;
pub mod error;
pub mod runner;
pub mod stats;
pub mod task;

pub use boomer::{shutdown_signal, Boomer};
pub use channel::ChannelConfig;
pub use cluster::{
    CpuProbe, MasterRunner, Message, MessageType, ProcessCpuProbe, TasksHook, WorkerRunner,
};
pub use config::{BoomerConfig, ConfigError, MasterConfig, Mode, WorkerConfig};
pub use error::{Error, Result};
pub use runner::{LocalRunner, RateLimiter, Runner, RunnerState};
pub use stats::{ConsoleOutput, Output, Snapshot, StatsRecorder};
pub use task::{Task, TaskSet};

#[cfg(test)]
mod integration_tests {
    use super::*;
    use crate::cluster::KEY_RUN;

    #[test]
    fn test_config_file_drives_facade() {
        let config: BoomerConfig = serde_json::from_str(
            r#"{
                "spawn_count": 20,
                "spawn_rate": 5.0,
                "loop_count": 500,
                "max_rps": 100,
                "request_increase_rate": "10/1s"
            }"#,
        )
        .unwrap();
        let boomer = Boomer::from_config(config).unwrap();
        assert_eq!(boomer.runner().loop_count(), 500);
        assert_eq!(boomer.config().mode, Mode::Standalone);
    }

    #[test]
    fn test_stats_message_carries_snapshot() {
        let mut snapshot = Snapshot::empty(RunnerState::Running, 4);
        snapshot.total.num_requests = 42;
        let message = Message::stats("w1", 2, snapshot);

        let line = serde_json::to_string(&message).unwrap();
        let decoded: Message = serde_json::from_str(&line).unwrap();
        assert_eq!(decoded.kind, MessageType::Stats);
        assert_eq!(decoded.get(KEY_RUN), Some(2));
        let snapshot = decoded.snapshot.unwrap();
        assert_eq!(snapshot.total.num_requests, 42);
        assert_eq!(snapshot.user_count, 4);
        assert_eq!(snapshot.state, RunnerState::Running);
    }
}
