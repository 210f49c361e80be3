//! Worker runner
//!
//! Connects to the master, registers, sends heartbeats and stats, and
//! drives the local [`Runner`] from the master's commands. Commands are
//! dispatched on `(runner state, message type)`.

use super::message::{Message, MessageType, KEY_SPAWN_COUNT, KEY_SPAWN_RATE};
use super::transport::{spawn_writer, MessageReader};
use crate::config::{WorkerConfig, MAX_SPAWN_COUNT, QUIT_TIMEOUT};
use crate::error::{Error, Result};
use crate::runner::{RateLimiter, Runner, RunnerState, SpawnComplete};
use crate::stats::{Output, Snapshot};
use crate::task::Task;

use async_trait::async_trait;
use rand::Rng;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Source of the CPU usage reported in heartbeats
pub trait CpuProbe: Send + Sync {
    /// Process CPU usage in percent
    fn cpu_usage(&self) -> i64;
}

impl<F> CpuProbe for F
where
    F: Fn() -> i64 + Send + Sync,
{
    fn cpu_usage(&self) -> i64 {
        self()
    }
}

/// CPU usage of the current process, sampled through `sysinfo`
///
/// Each call reports usage since the previous call, so the first sample
/// is taken on construction.
pub struct ProcessCpuProbe {
    pid: Option<Pid>,
    system: Mutex<System>,
}

impl ProcessCpuProbe {
    /// Probe for this process
    pub fn new() -> Self {
        let probe = Self {
            pid: sysinfo::get_current_pid().ok(),
            system: Mutex::new(System::new()),
        };
        probe.cpu_usage();
        probe
    }
}

impl Default for ProcessCpuProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuProbe for ProcessCpuProbe {
    fn cpu_usage(&self) -> i64 {
        let Some(pid) = self.pid else {
            return 0;
        };
        let mut system = self.system.lock();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_cpu(),
        );
        system
            .process(pid)
            .map(|process| process.cpu_usage().round() as i64)
            .unwrap_or(0)
    }
}

/// Turns the workload description sent by the master into tasks
///
/// Returning `None` keeps the tasks the worker already has.
pub type TasksHook = Arc<dyn Fn(&[u8]) -> Option<Vec<Task>> + Send + Sync>;

/// How a session with the master ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Quit was requested by either side
    Quit,
    /// Connection lost
    Lost,
}

/// Runs the master's share of the workload on this process
#[derive(Clone)]
pub struct WorkerRunner {
    inner: Arc<WorkerInner>,
}

struct WorkerInner {
    runner: Runner,
    config: WorkerConfig,
    node_id: String,
    cpu_probe: RwLock<Arc<dyn CpuProbe>>,
    tasks_hook: RwLock<Option<TasksHook>>,
    session: Arc<RwLock<Option<mpsc::Sender<Message>>>>,
    run: Arc<AtomicI64>,
    quit: watch::Sender<bool>,
}

impl WorkerRunner {
    /// Create a worker with a generated node id
    pub fn new(runner: Runner, config: WorkerConfig) -> Self {
        Self::with_node_id(runner, config, generate_node_id())
    }

    /// Create a worker with an explicit node id
    pub fn with_node_id(runner: Runner, config: WorkerConfig, node_id: impl Into<String>) -> Self {
        let node_id = node_id.into();
        let session = Arc::new(RwLock::new(None));
        let run = Arc::new(AtomicI64::new(0));
        runner.add_output(Arc::new(ReportingOutput {
            node_id: node_id.clone(),
            session: Arc::clone(&session),
            run: Arc::clone(&run),
        }));

        let (quit, _) = watch::channel(false);
        let cpu_probe: Arc<dyn CpuProbe> = Arc::new(ProcessCpuProbe::new());
        Self {
            inner: Arc::new(WorkerInner {
                runner,
                config,
                node_id,
                cpu_probe: RwLock::new(cpu_probe),
                tasks_hook: RwLock::new(None),
                session,
                run,
                quit,
            }),
        }
    }

    /// Node id sent with every message
    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    /// Local runner
    pub fn runner(&self) -> &Runner {
        &self.inner.runner
    }

    /// Replace the CPU usage source
    pub fn set_cpu_probe(&self, probe: Arc<dyn CpuProbe>) {
        *self.inner.cpu_probe.write() = probe;
    }

    /// Install a hook for workload descriptions sent with `spawn`
    pub fn set_tasks_hook(&self, hook: TasksHook) {
        *self.inner.tasks_hook.write() = Some(hook);
    }

    /// Ask the worker to quit; [`run`](Self::run) tells the master and returns
    pub fn request_quit(&self) {
        self.inner.quit.send_replace(true);
    }

    /// Connect to the master and serve it until quit
    ///
    /// Reconnects after a fixed backoff when the connection fails or drops;
    /// gives up with [`Error::Transport`] after the configured number of
    /// consecutive failed attempts.
    pub async fn run(&self) -> Result<()> {
        let config = &self.inner.config;
        let mut quit_rx = self.inner.quit.subscribe();
        let mut failures = 0u32;

        loop {
            if *quit_rx.borrow() {
                self.inner.runner.quit().await;
                return Ok(());
            }

            match TcpStream::connect(&config.master_addr).await {
                Ok(stream) => {
                    failures = 0;
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
                    }
                    let (reader, writer) = stream.into_split();
                    match self.serve(reader, writer).await {
                        Ok(SessionEnd::Quit) => return Ok(()),
                        Ok(SessionEnd::Lost) => {}
                        Err(e) => tracing::warn!(error = %e, "Session with master failed"),
                    }
                }
                Err(e) => {
                    failures += 1;
                    if failures > config.max_reconnect_attempts {
                        return Err(Error::Transport(format!(
                            "could not reach master at {} after {} attempts: {e}",
                            config.master_addr, failures
                        )));
                    }
                    tracing::warn!(
                        addr = %config.master_addr,
                        attempt = failures,
                        error = %e,
                        "Failed to connect to master, retrying"
                    );
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(config.reconnect_interval) => {}
                _ = quit_requested(&mut quit_rx) => {}
            }
        }
    }

    /// Serve one connection to the master
    pub async fn serve<R, W>(&self, reader: R, writer: W) -> Result<SessionEnd>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let node_id = self.inner.node_id.clone();
        let (tx, writer_task) = spawn_writer(writer);
        for kind in [MessageType::Register, MessageType::ClientReady] {
            tx.send(Message::new(kind, node_id.clone()))
                .await
                .map_err(|_| Error::Transport("connection to master closed".into()))?;
        }
        tracing::info!(node_id = %node_id, "Registered with master");

        *self.inner.session.write() = Some(tx.clone());
        let heartbeat = AbortOnDrop(tokio::spawn(heartbeat_loop(self.clone(), tx.clone())));

        let mut quit_rx = self.inner.quit.subscribe();
        let mut reader = MessageReader::new(reader);
        let end = loop {
            let next = tokio::select! {
                next = reader.next() => next,
                _ = quit_requested(&mut quit_rx) => {
                    tracing::info!(node_id = %node_id, "Quitting");
                    self.inner.runner.quit().await;
                    send(&tx, Message::new(MessageType::Quit, node_id.clone())).await;
                    break SessionEnd::Quit;
                }
            };
            match next {
                Ok(Some(message)) => {
                    if let Some(end) = self.handle(message, &tx).await {
                        break end;
                    }
                }
                Ok(None) => {
                    tracing::warn!(node_id = %node_id, "Master closed the connection");
                    break SessionEnd::Lost;
                }
                Err(e) => {
                    tracing::warn!(node_id = %node_id, error = %e, "Connection to master failed");
                    break SessionEnd::Lost;
                }
            }
        };

        drop(heartbeat);
        *self.inner.session.write() = None;
        if end == SessionEnd::Lost && self.inner.runner.state().is_active() {
            tracing::warn!(node_id = %node_id, "Stopping run after losing the master");
            self.inner.runner.stop().await;
        }
        drop(tx);

        match tokio::time::timeout(QUIT_TIMEOUT, writer_task).await {
            Ok(Ok(Err(e))) => tracing::debug!(error = %e, "Writer to master failed"),
            Ok(Err(e)) => tracing::warn!(error = %e, "Writer task failed"),
            Err(_) => tracing::warn!("Timed out flushing messages to master"),
            Ok(Ok(Ok(()))) => {}
        }
        Ok(end)
    }

    async fn handle(&self, message: Message, tx: &mpsc::Sender<Message>) -> Option<SessionEnd> {
        let node_id = &self.inner.node_id;
        if message.node_id != *node_id {
            tracing::debug!(target_node = %message.node_id, "Ignoring message for another node");
            return None;
        }

        let runner = &self.inner.runner;
        let state = runner.state();
        match (state, message.kind) {
            (_, MessageType::Quit) => {
                tracing::info!(node_id = %node_id, "Master asked to quit");
                runner.quit().await;
                send(tx, Message::new(MessageType::Quit, node_id.clone())).await;
                Some(SessionEnd::Quit)
            }
            (RunnerState::Quitting, kind) => {
                tracing::debug!(?kind, "Quitting, message ignored");
                None
            }
            (_, MessageType::Spawn) => {
                self.on_spawn(message, tx).await;
                None
            }
            (RunnerState::Spawning | RunnerState::Running, MessageType::Stop) => {
                tracing::info!(node_id = %node_id, "Master asked to stop");
                runner.stop().await;
                send(tx, Message::new(MessageType::ClientStopped, node_id.clone())).await;
                send(tx, Message::new(MessageType::ClientReady, node_id.clone())).await;
                None
            }
            (state, kind) => {
                tracing::debug!(%state, ?kind, "Message ignored in current state");
                None
            }
        }
    }

    async fn on_spawn(&self, message: Message, tx: &mpsc::Sender<Message>) {
        let (count, rate) = match spawn_params(&message) {
            Ok(params) => params,
            Err(e) => {
                tracing::warn!(error = %e, "Spawn ignored");
                let exception = Message::new(MessageType::Exception, self.inner.node_id.clone());
                send(tx, exception).await;
                return;
            }
        };

        let runner = &self.inner.runner;
        if let Some(payload) = message.tasks.as_deref() {
            let hook = self.inner.tasks_hook.read().clone();
            if let Some(hook) = hook {
                match hook(payload) {
                    Some(tasks) => runner.set_tasks(tasks),
                    None => tracing::warn!("Task payload not understood, keeping current tasks"),
                }
            }
        }

        if let Some(profile) = &message.profile {
            runner.set_loop_count(profile.loop_count);
            match RateLimiter::from_options(profile.max_rps, &profile.request_increase_rate) {
                Ok(limiter) => runner.set_rate_limiter(limiter),
                Err(e) => {
                    tracing::error!(error = %e, "Invalid rate limit from master, running unlimited");
                    runner.set_rate_limiter(None);
                }
            }
        }

        let node_id = self.inner.node_id.clone();
        send(tx, Message::new(MessageType::Spawning, node_id.clone())).await;

        let complete_tx = tx.clone();
        let on_complete: SpawnComplete = Box::new(move |spawned| {
            if let Err(e) = complete_tx.try_send(Message::spawning_complete(node_id, spawned)) {
                tracing::warn!(error = %e, "Failed to report spawning complete");
            }
        });

        match runner.start_spawning(count, rate as f64, Some(on_complete)).await {
            Ok(()) => {
                let run = self.inner.run.fetch_add(1, Ordering::AcqRel) + 1;
                tracing::info!(count, rate, run, "Spawning");
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to start spawning");
                send(tx, Message::new(MessageType::Exception, self.inner.node_id.clone())).await;
            }
        }
    }
}

impl std::fmt::Debug for WorkerRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRunner")
            .field("node_id", &self.inner.node_id)
            .field("master_addr", &self.inner.config.master_addr)
            .field("runner", &self.inner.runner)
            .finish()
    }
}

/// Sends the worker's snapshots to the master
struct ReportingOutput {
    node_id: String,
    session: Arc<RwLock<Option<mpsc::Sender<Message>>>>,
    run: Arc<AtomicI64>,
}

#[async_trait]
impl Output for ReportingOutput {
    async fn on_event(&self, snapshot: &Snapshot) {
        let Some(tx) = self.session.read().clone() else {
            return;
        };
        let run = self.run.load(Ordering::Acquire);
        send(&tx, Message::stats(self.node_id.clone(), run, snapshot.clone())).await;
    }
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn heartbeat_loop(worker: WorkerRunner, tx: mpsc::Sender<Message>) {
    let mut ticker = tokio::time::interval(worker.inner.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let cpu = worker.inner.cpu_probe.read().cpu_usage();
        let message = Message::heartbeat(
            worker.inner.node_id.clone(),
            worker.inner.runner.state(),
            cpu,
        );
        if tx.send(message).await.is_err() {
            break;
        }
    }
}

fn spawn_params(message: &Message) -> Result<(i64, i64)> {
    match (message.get(KEY_SPAWN_COUNT), message.get(KEY_SPAWN_RATE)) {
        (Some(count), Some(_)) if !(0..=MAX_SPAWN_COUNT).contains(&count) => Err(
            Error::Protocol(format!("spawn count {count} outside 0..={MAX_SPAWN_COUNT}")),
        ),
        (Some(count), Some(rate)) => Ok((count, rate)),
        _ => Err(Error::Protocol(format!(
            "spawn without {KEY_SPAWN_COUNT} or {KEY_SPAWN_RATE}"
        ))),
    }
}

async fn send(tx: &mpsc::Sender<Message>, message: Message) {
    let kind = message.kind;
    if tx.send(message).await.is_err() {
        tracing::debug!(?kind, "Connection to master closed, message dropped");
    }
}

async fn quit_requested(quit: &mut watch::Receiver<bool>) {
    let _ = quit.wait_for(|quit| *quit).await;
}

fn generate_node_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "boomer".to_string());
    format!("{host}_{:016x}", rand::thread_rng().gen::<u64>())
}
