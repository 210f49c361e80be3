//! Control-plane messages

use crate::runner::RunnerState;
use crate::stats::Snapshot;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Data key: execution units a worker should run
pub const KEY_SPAWN_COUNT: &str = "spawn_count";
/// Data key: units started per second
pub const KEY_SPAWN_RATE: &str = "spawn_rate";
/// Data key: units actually started
pub const KEY_COUNT: &str = "count";
/// Data key: runner state code
pub const KEY_STATE: &str = "state";
/// Data key: process CPU usage in percent
pub const KEY_CPU_USAGE: &str = "current_cpu_usage";
/// Data key: worker run sequence a stats report belongs to
pub const KEY_RUN: &str = "run";

/// Message kinds exchanged between master and workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Worker joins the registry
    Register,
    /// Worker is ready for work
    ClientReady,
    /// Begin or rebalance a run
    Spawn,
    /// Worker started spawning
    Spawning,
    /// Worker reached its target concurrency
    SpawningComplete,
    /// Liveness and telemetry
    Heartbeat,
    /// Stop the current run
    Stop,
    /// Worker stopped
    ClientStopped,
    /// Graceful departure, either direction
    Quit,
    /// Reserved
    Exception,
    /// Worker stats for the current run
    Stats,
}

/// Per-worker share of run limits, sent along with `spawn`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Task executions for this worker; 0 is unbounded
    pub loop_count: i64,
    /// Request ceiling per second for this worker; 0 is unlimited
    pub max_rps: i64,
    /// Ramp-up spec for this worker, `-1` when disabled
    pub request_increase_rate: String,
}

/// One control-plane message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message kind
    #[serde(rename = "type")]
    pub kind: MessageType,

    /// Worker the message is from or for
    pub node_id: String,

    /// Integer payload
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub data: HashMap<String, i64>,

    /// Opaque workload description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks: Option<Vec<u8>>,

    /// Run limits for the receiving worker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<Profile>,

    /// Worker stats snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Snapshot>,
}

impl Message {
    /// Message without payload
    pub fn new(kind: MessageType, node_id: impl Into<String>) -> Self {
        Self {
            kind,
            node_id: node_id.into(),
            data: HashMap::new(),
            tasks: None,
            profile: None,
            snapshot: None,
        }
    }

    /// Add an integer payload entry
    pub fn with_data(mut self, key: &str, value: i64) -> Self {
        self.data.insert(key.to_string(), value);
        self
    }

    /// Attach a workload description
    pub fn with_tasks(mut self, tasks: Option<Vec<u8>>) -> Self {
        self.tasks = tasks;
        self
    }

    /// Attach run limits
    pub fn with_profile(mut self, profile: Profile) -> Self {
        self.profile = Some(profile);
        self
    }

    /// `spawn` command
    pub fn spawn(node_id: impl Into<String>, spawn_count: i64, spawn_rate: i64) -> Self {
        Self::new(MessageType::Spawn, node_id)
            .with_data(KEY_SPAWN_COUNT, spawn_count)
            .with_data(KEY_SPAWN_RATE, spawn_rate)
    }

    /// `spawning_complete` acknowledgement
    pub fn spawning_complete(node_id: impl Into<String>, count: i64) -> Self {
        Self::new(MessageType::SpawningComplete, node_id).with_data(KEY_COUNT, count)
    }

    /// `heartbeat` with state and CPU usage
    pub fn heartbeat(node_id: impl Into<String>, state: RunnerState, cpu_usage: i64) -> Self {
        Self::new(MessageType::Heartbeat, node_id)
            .with_data(KEY_STATE, state.code())
            .with_data(KEY_CPU_USAGE, cpu_usage)
    }

    /// `stats` report for one worker run
    pub fn stats(node_id: impl Into<String>, run: i64, snapshot: Snapshot) -> Self {
        let mut message = Self::new(MessageType::Stats, node_id).with_data(KEY_RUN, run);
        message.snapshot = Some(snapshot);
        message
    }

    /// Integer payload entry
    pub fn get(&self, key: &str) -> Option<i64> {
        self.data.get(key).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let json = serde_json::to_value(Message::spawn("w1", 10, 2)).unwrap();
        assert_eq!(json["type"], "spawn");
        assert_eq!(json["node_id"], "w1");
        assert_eq!(json["data"]["spawn_count"], 10);
        assert_eq!(json["data"]["spawn_rate"], 2);
        assert!(json.get("tasks").is_none());
        assert!(json.get("profile").is_none());
    }

    #[test]
    fn test_parse_minimal_message() {
        let message: Message =
            serde_json::from_str(r#"{"type":"client_ready","node_id":"w7"}"#).unwrap();
        assert_eq!(message.kind, MessageType::ClientReady);
        assert!(message.data.is_empty());
        assert!(message.tasks.is_none());
    }

    #[test]
    fn test_heartbeat_payload() {
        let message = Message::heartbeat("w1", RunnerState::Running, 42);
        assert_eq!(message.get(KEY_STATE), Some(RunnerState::Running.code()));
        assert_eq!(message.get(KEY_CPU_USAGE), Some(42));
        assert_eq!(message.get(KEY_COUNT), None);
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(serde_json::from_str::<Message>(r#"{"type":"dance","node_id":"w1"}"#).is_err());
    }
}
