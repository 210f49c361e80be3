//! Boomer facade
//!
//! One entry point for all three participation modes. Configure it, hand
//! it the tasks and call [`Boomer::run`]; it returns when the run is over
//! or the process receives SIGINT/SIGTERM.

use crate::cluster::{CpuProbe, MasterRunner, TasksHook, WorkerRunner};
use crate::config::{BoomerConfig, Mode, QUIT_TIMEOUT};
use crate::error::{Error, Result};
use crate::runner::{LocalRunner, RateLimiter, Runner, RAMP_DISABLED};
use crate::stats::{Output, StatsRecorder};
use crate::task::Task;

use std::sync::Arc;

/// Load generator facade
pub struct Boomer {
    config: BoomerConfig,
    runner: Runner,
    outputs: Vec<Arc<dyn Output>>,
    tasks_payload: Option<Vec<u8>>,
    tasks_hook: Option<TasksHook>,
    cpu_probe: Option<Arc<dyn CpuProbe>>,
}

impl Boomer {
    /// Standalone boomer with default settings
    pub fn new(spawn_count: i64, spawn_rate: f64) -> Self {
        Self::build(BoomerConfig::new(spawn_count, spawn_rate))
    }

    /// Boomer from a validated config
    pub fn from_config(config: BoomerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: BoomerConfig) -> Self {
        let runner = Runner::with_stats(&config.channels(), config.report_interval());
        let mut boomer = Self {
            config,
            runner,
            outputs: Vec::new(),
            tasks_payload: None,
            tasks_hook: None,
            cpu_probe: None,
        };
        let (max_rps, spec) = (
            boomer.config.max_rps,
            boomer.config.request_increase_rate.clone(),
        );
        boomer.set_rate_limiter(max_rps, &spec);
        boomer.runner.set_loop_count(boomer.config.loop_count);
        boomer
    }

    /// Limit task executions per second
    ///
    /// `max_rps <= 0` with spec `-1` disables limiting; a ramp-up spec such
    /// as `10/1s` selects the ramp-up limiter. An invalid spec is logged and
    /// the run goes unlimited.
    pub fn set_rate_limiter(&mut self, max_rps: i64, request_increase_rate: &str) {
        match RateLimiter::from_options(max_rps, request_increase_rate) {
            Ok(limiter) => {
                self.config.max_rps = max_rps;
                self.config.request_increase_rate = request_increase_rate.to_string();
                self.runner.set_rate_limiter(limiter);
            }
            Err(e) => {
                tracing::error!(
                    max_rps,
                    request_increase_rate,
                    error = %e,
                    "Invalid rate limit, running without one"
                );
                self.config.max_rps = 0;
                self.config.request_increase_rate = RAMP_DISABLED.to_string();
                self.runner.set_rate_limiter(None);
            }
        }
    }

    /// Total task executions for the run; 0 is unbounded
    pub fn set_loop_count(&mut self, loop_count: i64) {
        self.config.loop_count = loop_count;
        self.runner.set_loop_count(loop_count);
    }

    /// Register an output sink
    ///
    /// Standalone and worker modes report their local stats to it; master
    /// mode reports the aggregate of all workers.
    pub fn add_output(&mut self, output: Arc<dyn Output>) {
        self.runner.add_output(Arc::clone(&output));
        self.outputs.push(output);
    }

    /// Select standalone, worker or master mode
    pub fn set_mode(&mut self, mode: Mode) {
        self.config.mode = mode;
    }

    /// Workload description the master sends with every `spawn`
    pub fn set_tasks_payload(&mut self, payload: Vec<u8>) {
        self.tasks_payload = Some(payload);
    }

    /// Hook a worker uses to build tasks from the master's payload
    pub fn set_tasks_hook(&mut self, hook: TasksHook) {
        self.tasks_hook = Some(hook);
    }

    /// CPU usage source for worker heartbeats
    pub fn set_cpu_probe(&mut self, probe: Arc<dyn CpuProbe>) {
        self.cpu_probe = Some(probe);
    }

    /// Recorder tasks report request outcomes to
    pub fn recorder(&self) -> StatsRecorder {
        self.runner.recorder()
    }

    /// Local runner
    pub fn runner(&self) -> &Runner {
        &self.runner
    }

    /// Effective configuration
    pub fn config(&self) -> &BoomerConfig {
        &self.config
    }

    /// Run until the workload is done or a shutdown signal arrives
    pub async fn run(&self, tasks: Vec<Task>) -> Result<()> {
        self.config.validate()?;
        tracing::info!(
            mode = %self.config.mode,
            spawn_count = self.config.spawn_count,
            spawn_rate = self.config.spawn_rate,
            loop_count = self.config.loop_count,
            "Starting boomer"
        );

        match self.config.mode {
            Mode::Standalone => self.run_standalone(tasks).await,
            Mode::Worker => self.run_worker(tasks).await,
            Mode::Master => self.run_master().await,
        }
    }

    async fn run_standalone(&self, tasks: Vec<Task>) -> Result<()> {
        if tasks.is_empty() {
            return Err(Error::Config("no tasks to run".into()));
        }
        self.runner.set_tasks(tasks);

        let local = LocalRunner::new(
            self.runner.clone(),
            self.config.spawn_count,
            self.config.spawn_rate,
        );
        local.run().await?;

        tokio::select! {
            state = self.runner.wait_stopped() => tracing::info!(%state, "Run finished"),
            _ = shutdown_signal() => tracing::info!("Shutdown signal received, stopping"),
        }
        local.quit().await;
        Ok(())
    }

    async fn run_worker(&self, tasks: Vec<Task>) -> Result<()> {
        if !tasks.is_empty() {
            self.runner.set_tasks(tasks);
        }

        let worker = WorkerRunner::new(self.runner.clone(), self.config.worker_config());
        if let Some(probe) = &self.cpu_probe {
            worker.set_cpu_probe(Arc::clone(probe));
        }
        if let Some(hook) = &self.tasks_hook {
            worker.set_tasks_hook(Arc::clone(hook));
        }
        tracing::info!(
            node_id = %worker.node_id(),
            master = %self.config.master_addr(),
            "Connecting to master"
        );

        let session = worker.run();
        tokio::pin!(session);
        tokio::select! {
            result = &mut session => return result,
            _ = shutdown_signal() => {
                tracing::info!("Shutdown signal received, leaving the cluster");
                worker.request_quit();
            }
        }

        match tokio::time::timeout(QUIT_TIMEOUT, session).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!("Timed out leaving the cluster");
                self.runner.quit().await;
                Ok(())
            }
        }
    }

    async fn run_master(&self) -> Result<()> {
        let master = MasterRunner::new(self.config.master_config(), self.config.report_interval());
        for output in &self.outputs {
            master.add_output(Arc::clone(output));
        }
        master.set_tasks_payload(self.tasks_payload.clone());
        master.listen().await?;

        tokio::select! {
            state = master.wait_finished() => tracing::info!(%state, "Distributed run finished"),
            _ = shutdown_signal() => tracing::info!("Shutdown signal received, stopping workers"),
        }
        master.quit().await;
        Ok(())
    }
}

impl std::fmt::Debug for Boomer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Boomer")
            .field("config", &self.config)
            .field("runner", &self.runner)
            .field("outputs", &self.outputs.len())
            .finish()
    }
}

/// Resolves on SIGINT or, on unix, SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
