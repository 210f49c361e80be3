//! CLI argument parsing and command dispatch

use crate::demo::DemoWorkload;

use anyhow::{Context, Result};
use boomer_core::config::DEFAULT_MASTER_PORT;
use boomer_core::{Boomer, BoomerConfig, ConsoleOutput, Mode};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "boomer")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the whole workload in this process
    Standalone {
        #[command(flatten)]
        load: LoadArgs,

        #[command(flatten)]
        demo: DemoArgs,
    },
    /// Coordinate workers; starts once the expected workers are connected
    Master {
        #[command(flatten)]
        load: LoadArgs,

        #[command(flatten)]
        demo: DemoArgs,

        /// Address to listen on
        #[arg(long, default_value = "0.0.0.0")]
        bind_host: String,

        /// Port to listen on
        #[arg(long, default_value_t = DEFAULT_MASTER_PORT)]
        port: u16,

        /// Workers to wait for before starting
        #[arg(long, default_value_t = 1)]
        expect_workers: usize,

        /// Longest wait for the expected workers, in seconds; 0 waits forever
        #[arg(long, default_value_t = 0)]
        expect_workers_max_wait: u64,

        /// Quit instead of starting with fewer workers after the wait
        #[arg(long)]
        abort_on_expect_timeout: bool,
    },
    /// Run the master's share of the workload
    Worker {
        /// JSON config file with defaults for every flag
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Master host
        #[arg(long, default_value = "127.0.0.1")]
        master_host: String,

        /// Master port
        #[arg(long, default_value_t = DEFAULT_MASTER_PORT)]
        master_port: u16,

        /// Reconnect attempts before giving up
        #[arg(long)]
        max_reconnect_attempts: Option<u32>,

        #[command(flatten)]
        demo: DemoArgs,
    },
}

/// Run limits shared by standalone and master mode
#[derive(Args, Debug, Clone)]
pub struct LoadArgs {
    /// JSON config file with defaults for every flag
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Execution units to run
    #[arg(short = 'n', long)]
    pub spawn_count: Option<i64>,

    /// Execution units started per second
    #[arg(short = 'r', long)]
    pub spawn_rate: Option<f64>,

    /// Total task executions; 0 runs until stopped
    #[arg(short, long)]
    pub loop_count: Option<i64>,

    /// Task executions per second ceiling; 0 is unlimited
    #[arg(long)]
    pub max_rps: Option<i64>,

    /// Ramp-up spec such as `10/1s`; -1 disables ramping
    #[arg(long, allow_hyphen_values = true)]
    pub request_increase_rate: Option<String>,

    /// Seconds between stats reports
    #[arg(long)]
    pub report_interval: Option<u64>,
}

impl LoadArgs {
    fn apply(&self, config: &mut BoomerConfig) {
        if let Some(spawn_count) = self.spawn_count {
            config.spawn_count = spawn_count;
        }
        if let Some(spawn_rate) = self.spawn_rate {
            config.spawn_rate = spawn_rate;
        }
        if let Some(loop_count) = self.loop_count {
            config.loop_count = loop_count;
        }
        if let Some(max_rps) = self.max_rps {
            config.max_rps = max_rps;
        }
        if let Some(spec) = &self.request_increase_rate {
            config.request_increase_rate = spec.clone();
        }
        if let Some(secs) = self.report_interval {
            config.report_interval_secs = secs;
        }
    }
}

/// Demo task parameters
#[derive(Args, Debug, Clone)]
pub struct DemoArgs {
    /// Mean simulated response time in milliseconds
    #[arg(long, default_value_t = 100)]
    pub task_delay_ms: u64,

    /// Share of executions reported as failures
    #[arg(long, default_value_t = 0.0)]
    pub failure_rate: f64,
}

impl From<&DemoArgs> for DemoWorkload {
    fn from(args: &DemoArgs) -> Self {
        Self {
            delay_ms: args.task_delay_ms,
            failure_rate: args.failure_rate,
        }
    }
}

/// Execute the parsed command
pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Standalone { load, demo } => {
            let mut config = load_config(load.config.as_ref())?;
            load.apply(&mut config);
            config.mode = Mode::Standalone;

            let boomer = build(config)?;
            let tasks = DemoWorkload::from(&demo).tasks(boomer.recorder());
            boomer.run(tasks).await.context("standalone run failed")
        }
        Commands::Master {
            load,
            demo,
            bind_host,
            port,
            expect_workers,
            expect_workers_max_wait,
            abort_on_expect_timeout,
        } => {
            let mut config = load_config(load.config.as_ref())?;
            load.apply(&mut config);
            config = config
                .with_mode(Mode::Master)
                .with_master(bind_host, port)
                .with_expect_workers(
                    expect_workers,
                    Duration::from_secs(expect_workers_max_wait),
                );
            config.abort_on_expect_timeout = abort_on_expect_timeout;

            let mut boomer = build(config)?;
            let payload = DemoWorkload::from(&demo)
                .to_payload()
                .context("failed to encode demo workload")?;
            boomer.set_tasks_payload(payload);
            boomer.run(Vec::new()).await.context("master run failed")
        }
        Commands::Worker {
            config,
            master_host,
            master_port,
            max_reconnect_attempts,
            demo,
        } => {
            let mut config = load_config(config.as_ref())?
                .with_mode(Mode::Worker)
                .with_master(master_host, master_port);
            if let Some(attempts) = max_reconnect_attempts {
                config.max_reconnect_attempts = attempts;
            }

            let mut boomer = build(config)?;
            let recorder = boomer.recorder();
            boomer.set_tasks_hook(Arc::new(move |payload: &[u8]| {
                DemoWorkload::from_payload(payload).map(|workload| workload.tasks(recorder.clone()))
            }));
            let tasks = DemoWorkload::from(&demo).tasks(boomer.recorder());
            boomer.run(tasks).await.context("worker run failed")
        }
    }
}

fn build(config: BoomerConfig) -> Result<Boomer> {
    let mut boomer = Boomer::from_config(config).context("invalid configuration")?;
    boomer.add_output(Arc::new(ConsoleOutput::new()));
    Ok(boomer)
}

fn load_config(path: Option<&PathBuf>) -> Result<BoomerConfig> {
    let Some(path) = path else {
        return Ok(BoomerConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}
