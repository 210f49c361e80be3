//! Run configuration types

use crate::channel::ChannelConfig;
use crate::runner::RAMP_DISABLED;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default master port
pub const DEFAULT_MASTER_PORT: u16 = 5557;

/// Interval between worker heartbeats and master liveness checks
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Heartbeat credits a worker gets back on every heartbeat
pub const HEARTBEAT_LIVENESS: i32 = 3;

/// Most execution units one run may start
pub const MAX_SPAWN_COUNT: i64 = 1_000_000;

/// How long the master waits for quit acknowledgements
pub const QUIT_TIMEOUT: Duration = Duration::from_secs(5);

/// How a boomer process participates in a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Run the workload locally
    #[default]
    Standalone,
    /// Connect to a master and run its share of the workload
    Worker,
    /// Coordinate workers without running the workload itself
    Master,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Standalone => "standalone",
            Self::Worker => "worker",
            Self::Master => "master",
        })
    }
}

/// Run configuration
///
/// Covers all three modes; fields that do not apply to the selected mode
/// are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BoomerConfig {
    /// Target number of execution units
    pub spawn_count: i64,

    /// Execution units started per second while spawning
    pub spawn_rate: f64,

    /// Total task executions per run; 0 is unbounded
    pub loop_count: i64,

    /// Request ceiling per second; 0 disables the stable limiter
    pub max_rps: i64,

    /// Ramp-up spec such as `2/2s`; `-1` disables ramping
    pub request_increase_rate: String,

    /// Participation mode
    pub mode: Mode,

    /// Master host (worker connects to it, master binds to it)
    pub master_host: String,

    /// Master port
    pub master_port: u16,

    /// Workers the master waits for before starting on its own; 0 waits
    /// for an explicit start
    pub expect_workers: usize,

    /// Longest the master waits for `expect_workers`, in seconds
    pub expect_workers_max_wait_secs: u64,

    /// Abort instead of starting when `expect_workers` never show up
    pub abort_on_expect_timeout: bool,

    /// Seconds between stats snapshots
    pub report_interval_secs: u64,

    /// Worker reconnect attempts before giving up
    pub max_reconnect_attempts: u32,

    /// Capacity of each stats queue
    pub stats_buffer: usize,
}

impl Default for BoomerConfig {
    fn default() -> Self {
        Self {
            spawn_count: 1,
            spawn_rate: 1.0,
            loop_count: 0,
            max_rps: 0,
            request_increase_rate: RAMP_DISABLED.to_string(),
            mode: Mode::Standalone,
            master_host: "127.0.0.1".to_string(),
            master_port: DEFAULT_MASTER_PORT,
            expect_workers: 0,
            expect_workers_max_wait_secs: 0,
            abort_on_expect_timeout: false,
            report_interval_secs: 3,
            max_reconnect_attempts: 30,
            stats_buffer: 10_000,
        }
    }
}

impl BoomerConfig {
    /// Create a config with the given spawn parameters
    pub fn new(spawn_count: i64, spawn_rate: f64) -> Self {
        Self {
            spawn_count,
            spawn_rate,
            ..Default::default()
        }
    }

    /// Set the participation mode
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the loop count
    pub fn with_loop_count(mut self, loop_count: i64) -> Self {
        self.loop_count = loop_count;
        self
    }

    /// Set the rate limit options
    pub fn with_rate_limit(mut self, max_rps: i64, request_increase_rate: impl Into<String>) -> Self {
        self.max_rps = max_rps;
        self.request_increase_rate = request_increase_rate.into();
        self
    }

    /// Set the master address
    pub fn with_master(mut self, host: impl Into<String>, port: u16) -> Self {
        self.master_host = host.into();
        self.master_port = port;
        self
    }

    /// Wait for `count` workers, at most `max_wait`, before auto-starting
    pub fn with_expect_workers(mut self, count: usize, max_wait: Duration) -> Self {
        self.expect_workers = count;
        self.expect_workers_max_wait_secs = max_wait.as_secs();
        self
    }

    /// Set the report interval
    pub fn with_report_interval(mut self, interval: Duration) -> Self {
        self.report_interval_secs = interval.as_secs();
        self
    }

    /// `host:port` of the master
    pub fn master_addr(&self) -> String {
        format!("{}:{}", self.master_host, self.master_port)
    }

    /// Interval between stats snapshots
    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }

    /// Stats queue sizes
    pub fn channels(&self) -> ChannelConfig {
        ChannelConfig::default().with_buffer(self.stats_buffer)
    }

    /// Master-side settings
    pub fn master_config(&self) -> MasterConfig {
        MasterConfig {
            bind_addr: self.master_addr(),
            spawn_count: self.spawn_count,
            spawn_rate: self.spawn_rate,
            loop_count: self.loop_count,
            max_rps: self.max_rps,
            request_increase_rate: self.request_increase_rate.clone(),
            expect_workers: self.expect_workers,
            expect_workers_max_wait: Duration::from_secs(self.expect_workers_max_wait_secs),
            abort_on_expect_timeout: self.abort_on_expect_timeout,
            ..MasterConfig::default()
        }
    }

    /// Worker-side settings
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            master_addr: self.master_addr(),
            max_reconnect_attempts: self.max_reconnect_attempts,
            ..WorkerConfig::default()
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.spawn_count < 1 {
            return Err(ConfigError::InvalidSpawnCount(
                "spawn count must be at least 1".into(),
            ));
        }

        if self.spawn_count > MAX_SPAWN_COUNT {
            return Err(ConfigError::InvalidSpawnCount(format!(
                "spawn count must be at most {MAX_SPAWN_COUNT}"
            )));
        }

        if !(self.spawn_rate.is_finite() && self.spawn_rate > 0.0) {
            return Err(ConfigError::InvalidSpawnRate(
                "spawn rate must be positive".into(),
            ));
        }

        if self.loop_count < 0 {
            return Err(ConfigError::InvalidLoopCount(
                "loop count must not be negative".into(),
            ));
        }

        if self.mode != Mode::Standalone {
            if self.master_host.trim().is_empty() {
                return Err(ConfigError::InvalidMasterAddress(
                    "master host must not be empty".into(),
                ));
            }
            if self.mode == Mode::Worker && self.master_port == 0 {
                return Err(ConfigError::InvalidMasterAddress(
                    "master port must not be 0".into(),
                ));
            }
        }

        if self.mode == Mode::Master && self.expect_workers == 0 {
            return Err(ConfigError::InvalidExpectWorkers(
                "master mode starts once at least 1 worker is expected".into(),
            ));
        }

        if self.report_interval_secs == 0 {
            return Err(ConfigError::InvalidReportInterval(
                "report interval must be at least 1 second".into(),
            ));
        }

        if self.stats_buffer == 0 {
            return Err(ConfigError::InvalidBuffer(
                "stats buffer must be at least 1".into(),
            ));
        }

        Ok(())
    }
}

/// Master-side settings
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Address to listen on
    pub bind_addr: String,
    /// Total execution units across all workers
    pub spawn_count: i64,
    /// Total spawn rate across all workers
    pub spawn_rate: f64,
    /// Total loop budget across all workers; 0 is unbounded
    pub loop_count: i64,
    /// Total request ceiling across all workers
    pub max_rps: i64,
    /// Ramp-up spec applied on every worker, step split between them
    pub request_increase_rate: String,
    /// Workers to wait for before auto-starting; 0 disables auto-start
    pub expect_workers: usize,
    /// Longest auto-start wait
    pub expect_workers_max_wait: Duration,
    /// Abort instead of starting when the wait times out
    pub abort_on_expect_timeout: bool,
    /// Liveness check period
    pub heartbeat_interval: Duration,
    /// Credits restored on every heartbeat
    pub heartbeat_liveness: i32,
    /// Wait for quit acknowledgements
    pub quit_timeout: Duration,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{DEFAULT_MASTER_PORT}"),
            spawn_count: 1,
            spawn_rate: 1.0,
            loop_count: 0,
            max_rps: 0,
            request_increase_rate: RAMP_DISABLED.to_string(),
            expect_workers: 0,
            expect_workers_max_wait: Duration::ZERO,
            abort_on_expect_timeout: false,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            heartbeat_liveness: HEARTBEAT_LIVENESS,
            quit_timeout: QUIT_TIMEOUT,
        }
    }
}

/// Worker-side settings
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Master `host:port`
    pub master_addr: String,
    /// Heartbeat period
    pub heartbeat_interval: Duration,
    /// Wait between reconnect attempts
    pub reconnect_interval: Duration,
    /// Reconnect attempts before giving up
    pub max_reconnect_attempts: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            master_addr: format!("127.0.0.1:{DEFAULT_MASTER_PORT}"),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            reconnect_interval: Duration::from_secs(1),
            max_reconnect_attempts: 30,
        }
    }
}

/// Configuration validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Invalid spawn count
    #[error("Invalid spawn count: {0}")]
    InvalidSpawnCount(String),

    /// Invalid spawn rate
    #[error("Invalid spawn rate: {0}")]
    InvalidSpawnRate(String),

    /// Invalid loop count
    #[error("Invalid loop count: {0}")]
    InvalidLoopCount(String),

    /// Invalid master address
    #[error("Invalid master address: {0}")]
    InvalidMasterAddress(String),

    /// Master mode without expected workers
    #[error("Invalid expected workers: {0}")]
    InvalidExpectWorkers(String),

    /// Invalid report interval
    #[error("Invalid report interval: {0}")]
    InvalidReportInterval(String),

    /// Invalid queue size
    #[error("Invalid buffer size: {0}")]
    InvalidBuffer(String),
}

impl From<ConfigError> for crate::error::Error {
    fn from(err: ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BoomerConfig::default();
        assert_eq!(config.spawn_count, 1);
        assert_eq!(config.mode, Mode::Standalone);
        assert_eq!(config.request_increase_rate, "-1");
        assert_eq!(config.report_interval(), Duration::from_secs(3));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder_pattern() {
        let config = BoomerConfig::new(100, 10.0)
            .with_mode(Mode::Master)
            .with_loop_count(1_000)
            .with_rate_limit(50, "5/2s")
            .with_master("0.0.0.0", 6000)
            .with_expect_workers(4, Duration::from_secs(30));

        assert_eq!(config.master_addr(), "0.0.0.0:6000");
        assert_eq!(config.max_rps, 50);
        assert!(config.validate().is_ok());

        let master = config.master_config();
        assert_eq!(master.bind_addr, "0.0.0.0:6000");
        assert_eq!(master.expect_workers, 4);
        assert_eq!(master.expect_workers_max_wait, Duration::from_secs(30));
        assert_eq!(master.loop_count, 1_000);
        assert_eq!(master.heartbeat_liveness, HEARTBEAT_LIVENESS);
    }

    #[test]
    fn test_config_validation_spawn_parameters() {
        assert!(BoomerConfig::new(0, 1.0).validate().is_err());
        assert!(BoomerConfig::new(MAX_SPAWN_COUNT, 1.0).validate().is_ok());
        assert!(BoomerConfig::new(MAX_SPAWN_COUNT + 1, 1.0)
            .validate()
            .is_err());
        assert!(BoomerConfig::new(1, 0.0).validate().is_err());
        assert!(BoomerConfig::new(1, f64::NAN).validate().is_err());
        assert!(BoomerConfig::new(1, 1.0)
            .with_loop_count(-1)
            .validate()
            .is_err());
    }

    #[test]
    fn test_config_validation_worker_address() {
        let config = BoomerConfig::new(1, 1.0)
            .with_mode(Mode::Worker)
            .with_master("", 5557);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidMasterAddress(_))
        ));

        let config = BoomerConfig::new(1, 1.0)
            .with_mode(Mode::Worker)
            .with_master("localhost", 0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_master_needs_workers() {
        let config = BoomerConfig::new(1, 1.0).with_mode(Mode::Master);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidExpectWorkers(_))
        ));
        assert!(config
            .with_expect_workers(1, Duration::ZERO)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_config_validation_report_interval() {
        let config = BoomerConfig::new(1, 1.0).with_report_interval(Duration::from_millis(10));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidReportInterval(_))
        ));
    }

    #[test]
    fn test_config_deserialization_fills_defaults() {
        let config: BoomerConfig =
            serde_json::from_str(r#"{"spawn_count": 50, "mode": "worker"}"#).unwrap();
        assert_eq!(config.spawn_count, 50);
        assert_eq!(config.mode, Mode::Worker);
        assert_eq!(config.master_port, DEFAULT_MASTER_PORT);
        assert_eq!(config.stats_buffer, 10_000);
    }

    #[test]
    fn test_config_error_converts() {
        let err: crate::error::Error = ConfigError::InvalidSpawnCount("zero".into()).into();
        assert!(matches!(err, crate::error::Error::Config(_)));
    }
}
