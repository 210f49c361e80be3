//! Master runner
//!
//! The master never runs tasks itself. It keeps a registry of connected
//! workers, detects missing ones through heartbeat credits, splits the run
//! between active workers and re-splits it whenever workers join or leave.

use super::message::{
    Message, MessageType, Profile, KEY_COUNT, KEY_CPU_USAGE, KEY_RUN, KEY_STATE,
};
use super::registry::{WorkerNode, WorkerRegistry};
use super::transport::{spawn_writer, MessageReader};
use crate::config::MasterConfig;
use crate::error::{Error, Result};
use crate::runner::{parse_ramp_spec, RunnerState, StateCell, RAMP_DISABLED};
use crate::stats::{publish, Output, Snapshot};

use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Coordinates a distributed run
#[derive(Clone)]
pub struct MasterRunner {
    inner: Arc<MasterInner>,
}

struct MasterInner {
    config: MasterConfig,
    report_interval: Duration,
    registry: WorkerRegistry,
    state: StateCell,
    outputs: RwLock<Vec<Arc<dyn Output>>>,
    tasks_payload: RwLock<Option<Vec<u8>>>,
    /// Stats of workers that left during the current run
    retired: Mutex<Vec<Snapshot>>,
    /// One-slot queue: at most one rebalance is ever pending
    rebalance_tx: mpsc::Sender<()>,
    rebalance_rx: Mutex<Option<mpsc::Receiver<()>>>,
    /// Serializes start, stop, rebalance and quit
    control: tokio::sync::Mutex<()>,
    shutdown: watch::Sender<bool>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl MasterRunner {
    /// Create a master; nothing runs until [`listen`](Self::listen) or
    /// [`spawn_background`](Self::spawn_background)
    pub fn new(config: MasterConfig, report_interval: Duration) -> Self {
        let (rebalance_tx, rebalance_rx) = mpsc::channel(1);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(MasterInner {
                config,
                report_interval,
                registry: WorkerRegistry::new(),
                state: StateCell::default(),
                outputs: RwLock::new(Vec::new()),
                tasks_payload: RwLock::new(None),
                retired: Mutex::new(Vec::new()),
                rebalance_tx,
                rebalance_rx: Mutex::new(Some(rebalance_rx)),
                control: tokio::sync::Mutex::new(()),
                shutdown,
                background: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register an output sink for aggregated worker stats
    pub fn add_output(&self, output: Arc<dyn Output>) {
        self.inner.outputs.write().push(output);
    }

    /// Workload description sent to workers with every `spawn`
    pub fn set_tasks_payload(&self, payload: Option<Vec<u8>>) {
        *self.inner.tasks_payload.write() = payload;
    }

    /// Distributed run state
    pub fn state(&self) -> RunnerState {
        self.inner.state.load()
    }

    /// Worker registry
    pub fn registry(&self) -> &WorkerRegistry {
        &self.inner.registry
    }

    /// Workers that are neither missing nor quitting
    pub fn active_worker_count(&self) -> usize {
        self.inner.registry.active_count()
    }

    /// Bind the control port and accept workers in the background
    ///
    /// Also starts the liveness checker, rebalancer, reporter and, when
    /// configured, auto-start. Returns the bound address.
    pub async fn listen(&self) -> Result<SocketAddr> {
        let listener = TcpListener::bind(&self.inner.config.bind_addr).await?;
        let addr = listener.local_addr()?;
        tracing::info!(%addr, "Master listening for workers");

        let master = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        let accept = tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            tracing::debug!(%peer, "Worker connected");
                            let (reader, writer) = stream.into_split();
                            master.attach(reader, writer);
                        }
                        Err(e) => tracing::warn!(error = %e, "Failed to accept worker connection"),
                    },
                    _ = shutdown_requested(&mut shutdown) => break,
                }
            }
        });
        self.inner.background.lock().push(accept);

        self.spawn_background();
        Ok(addr)
    }

    /// Start the liveness checker, rebalancer, reporter and auto-start
    ///
    /// Idempotent.
    pub fn spawn_background(&self) {
        let Some(rebalance_rx) = self.inner.rebalance_rx.lock().take() else {
            return;
        };

        let mut handles = vec![
            tokio::spawn(heartbeat_loop(self.clone())),
            tokio::spawn(rebalance_loop(self.clone(), rebalance_rx)),
            tokio::spawn(report_loop(self.clone())),
        ];
        if self.inner.config.expect_workers > 0 {
            handles.push(tokio::spawn(auto_start(self.clone())));
        }
        self.inner.background.lock().extend(handles);
    }

    /// Serve one worker connection
    ///
    /// Messages are handled in arrival order on the returned task. The
    /// connection counts as the worker's departure when it closes.
    pub fn attach<R, W>(&self, reader: R, writer: W) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (sender, _writer) = spawn_writer(writer);
        let master = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();

        tokio::spawn(async move {
            let mut reader = MessageReader::new(reader);
            let mut bound: Option<String> = None;
            loop {
                let next = tokio::select! {
                    next = reader.next() => next,
                    _ = shutdown_requested(&mut shutdown) => break,
                };
                match next {
                    Ok(Some(message)) if message.kind == MessageType::Register => {
                        master.register(&message.node_id, &sender);
                        bound = Some(message.node_id);
                    }
                    Ok(Some(message)) => master.handle_message(message).await,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "Worker connection failed");
                        break;
                    }
                }
            }

            if let Some(id) = bound {
                if let Some(node) = master.inner.registry.remove_if_bound(&id, &sender) {
                    tracing::warn!(node_id = %id, "Worker connection closed");
                    master.departed(&id, Some(node.as_ref())).await;
                }
            }
        })
    }

    /// Ask for a rebalance
    ///
    /// Returns `false` when one is already pending; the pending one will
    /// see the latest registry.
    pub fn request_rebalance(&self) -> bool {
        self.inner.rebalance_tx.try_send(()).is_ok()
    }

    /// Start a run across all active workers
    pub async fn start(&self) -> Result<()> {
        let _control = self.inner.control.lock().await;
        self.start_locked().await
    }

    /// Stop the run on every worker
    ///
    /// The run reaches `Stopped` once every worker has acknowledged.
    pub async fn stop(&self) {
        let _control = self.inner.control.lock().await;
        if !matches!(self.state(), RunnerState::Spawning | RunnerState::Running) {
            return;
        }

        self.inner.state.update_state(RunnerState::Stopping);
        tracing::info!("Stopping run on all workers");
        for node in self.inner.registry.active() {
            if is_busy(node.state()) {
                node.set_state(RunnerState::Stopping);
                self.send_to(&node, Message::new(MessageType::Stop, node.id.clone()))
                    .await;
            }
        }
        self.settle().await;
    }

    /// Tell every worker to quit and shut the master down
    ///
    /// Waits up to the configured quit timeout for acknowledgements, then
    /// closes all remaining connections.
    pub async fn quit(&self) {
        let _control = self.inner.control.lock().await;
        let previous = self.state();
        self.inner.state.update_state(RunnerState::Quitting);

        let nodes = self.inner.registry.snapshot();
        tracing::info!(workers = nodes.len(), "Sending quit to all workers");
        for node in &nodes {
            if let Err(e) = node.send(Message::new(MessageType::Quit, node.id.clone())).await {
                tracing::debug!(node_id = %node.id, error = %e, "Quit not delivered");
            }
        }

        if !nodes.is_empty() {
            let registry = &self.inner.registry;
            let acknowledged = tokio::time::timeout(self.inner.config.quit_timeout, async {
                while !registry.is_empty() {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            })
            .await;
            if acknowledged.is_err() {
                tracing::warn!(
                    remaining = registry.len(),
                    "Timed out waiting for quit acknowledgements, closing connections"
                );
            }
        }

        if matches!(
            previous,
            RunnerState::Spawning | RunnerState::Running | RunnerState::Stopping
        ) {
            self.publish_final(RunnerState::Quitting).await;
        }

        self.inner.registry.clear();
        self.inner.shutdown.send_replace(true);
        for handle in self.inner.background.lock().drain(..) {
            handle.abort();
        }
    }

    /// Wait until the run stopped or the master quit
    pub async fn wait_finished(&self) -> RunnerState {
        self.inner
            .state
            .wait_for(|state| matches!(state, RunnerState::Stopped | RunnerState::Quitting))
            .await
    }

    /// Aggregate of the latest stats of every worker in the current run
    pub fn snapshot(&self) -> Snapshot {
        let mut parts = self.inner.retired.lock().clone();
        for node in self.inner.registry.snapshot() {
            parts.extend(node.stats());
        }
        Snapshot::aggregate(self.state(), &parts)
    }

    fn register(&self, id: &str, sender: &mpsc::Sender<Message>) {
        let node = Arc::new(WorkerNode::new(
            id,
            sender.clone(),
            self.inner.config.heartbeat_liveness,
        ));
        if self.inner.registry.insert(node).is_some() {
            tracing::info!(node_id = %id, "Worker re-registered");
        } else {
            tracing::info!(
                node_id = %id,
                workers = self.inner.registry.len(),
                "Worker registered"
            );
        }
    }

    async fn handle_message(&self, message: Message) {
        let Some(node) = self.inner.registry.get(&message.node_id) else {
            tracing::warn!(
                node_id = %message.node_id,
                kind = ?message.kind,
                "Message from unregistered worker ignored"
            );
            return;
        };

        if node.state() == RunnerState::Missing
            && !matches!(message.kind, MessageType::Quit | MessageType::Stats)
        {
            tracing::debug!(
                node_id = %node.id,
                kind = ?message.kind,
                "Missing worker must register again, message ignored"
            );
            return;
        }

        match message.kind {
            MessageType::ClientReady => {
                node.set_state(RunnerState::Init);
                tracing::info!(
                    node_id = %node.id,
                    active = self.active_worker_count(),
                    "Worker ready"
                );
                if self.state() == RunnerState::Running {
                    self.request_rebalance();
                }
            }
            MessageType::Spawning => node.set_state(RunnerState::Spawning),
            MessageType::SpawningComplete => {
                let count = message.get(KEY_COUNT).unwrap_or_default();
                node.set_spawn_count(count);
                node.set_state(RunnerState::Running);
                tracing::debug!(node_id = %node.id, count, "Worker finished spawning");
                self.settle().await;
            }
            MessageType::Heartbeat => self.on_heartbeat(&node, &message).await,
            MessageType::Stats => {
                let run = message.get(KEY_RUN).unwrap_or_default();
                match message.snapshot {
                    Some(snapshot) => node.record_stats(run, snapshot),
                    None => tracing::warn!(node_id = %node.id, "Stats message without snapshot"),
                }
            }
            MessageType::ClientStopped => {
                node.set_state(RunnerState::Stopped);
                tracing::debug!(node_id = %node.id, "Worker stopped");
                self.settle().await;
            }
            MessageType::Quit => {
                if self.inner.registry.remove(&node.id).is_some() {
                    tracing::info!(node_id = %node.id, "Worker quit");
                    self.departed(&node.id, Some(node.as_ref())).await;
                }
            }
            MessageType::Exception => {
                tracing::warn!(node_id = %node.id, "Worker reported an exception");
                if node.state() == RunnerState::Spawning {
                    node.set_state(RunnerState::Init);
                    self.settle().await;
                }
            }
            MessageType::Register | MessageType::Spawn | MessageType::Stop => {
                tracing::warn!(
                    node_id = %node.id,
                    kind = ?message.kind,
                    "Unexpected message from worker ignored"
                );
            }
        }
    }

    async fn on_heartbeat(&self, node: &WorkerNode, message: &Message) {
        node.reset_heartbeat(self.inner.config.heartbeat_liveness);
        if let Some(cpu) = message.get(KEY_CPU_USAGE) {
            node.set_cpu_usage(cpu);
        }

        let reported = message
            .get(KEY_STATE)
            .and_then(RunnerState::from_code)
            .unwrap_or(RunnerState::Init);
        // a spawn is in flight; the worker's own acknowledgement moves it on
        if node.state() != RunnerState::Spawning || is_busy(reported) {
            node.set_state(reported);
        }
        self.settle().await;
    }

    /// Bookkeeping after a worker left the registry
    async fn departed(&self, id: &str, node: Option<&WorkerNode>) {
        if let Some(node) = node {
            self.inner.retired.lock().extend(node.stats());
        }

        let active = self.active_worker_count();
        tracing::info!(node_id = %id, active, "Worker left");
        match self.state() {
            RunnerState::Spawning | RunnerState::Running if active == 0 => {
                self.finish_run("no active workers left").await;
            }
            RunnerState::Spawning | RunnerState::Running => {
                self.request_rebalance();
            }
            RunnerState::Stopping => self.settle().await,
            _ => {}
        }
    }

    /// Send to one worker; a failed send counts as its departure
    async fn send_to(&self, node: &Arc<WorkerNode>, message: Message) -> bool {
        match node.send(message).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(node_id = %node.id, error = %e, "Send to worker failed");
                if self.inner.registry.remove(&node.id).is_some() {
                    self.departed(&node.id, Some(node.as_ref())).await;
                }
                false
            }
        }
    }

    async fn start_locked(&self) -> Result<()> {
        let workers = self.inner.registry.active();
        if workers.is_empty() {
            return Err(Error::Runner("no active workers to start".into()));
        }

        let previous = self.state();
        if !matches!(previous, RunnerState::Spawning | RunnerState::Running) {
            self.inner.retired.lock().clear();
            for node in self.inner.registry.snapshot() {
                node.clear_stats();
            }
            let outputs = self.inner.outputs.read().clone();
            futures::future::join_all(outputs.iter().map(|o| o.on_start())).await;
        }
        self.inner.state.update_state(RunnerState::Spawning);

        let config = &self.inner.config;
        let n = workers.len();
        let spawn_rate = ((config.spawn_rate / n as f64).ceil() as i64).max(1);
        let ramp = ramp_share(&config.request_increase_rate, n);
        let payload = self.inner.tasks_payload.read().clone();

        tracing::info!(
            workers = n,
            spawn_count = config.spawn_count,
            spawn_rate = config.spawn_rate,
            "Distributing run"
        );

        for (index, node) in workers.iter().enumerate() {
            let loop_count = if config.loop_count > 0 {
                share(config.loop_count, n, index)
            } else {
                0
            };
            if config.loop_count > 0 && loop_count == 0 {
                tracing::debug!(node_id = %node.id, "No loop budget left for worker, not spawning");
                continue;
            }
            let max_rps = if config.max_rps > 0 {
                share(config.max_rps, n, index).max(1)
            } else {
                0
            };

            let count = share(config.spawn_count, n, index);
            let message = Message::spawn(node.id.clone(), count, spawn_rate)
                .with_profile(Profile {
                    loop_count,
                    max_rps,
                    request_increase_rate: ramp.clone(),
                })
                .with_tasks(payload.clone());

            node.set_state(RunnerState::Spawning);
            if self.send_to(node, message).await {
                tracing::debug!(node_id = %node.id, count, spawn_rate, "Sent spawn");
            }
        }
        Ok(())
    }

    async fn rebalance(&self) {
        let _control = self.inner.control.lock().await;
        if !matches!(self.state(), RunnerState::Spawning | RunnerState::Running) {
            return;
        }

        let active = self.active_worker_count();
        if active == 0 {
            self.finish_run("no active workers left").await;
            return;
        }

        tracing::info!(workers = active, "Rebalancing run");
        if let Err(e) = self.start_locked().await {
            tracing::warn!(error = %e, "Rebalance failed");
        }
    }

    /// Advance the run state from what the workers reported
    async fn settle(&self) {
        let workers = self.inner.registry.active();
        let spawning = workers.iter().any(|n| n.state() == RunnerState::Spawning);
        let running = workers.iter().any(|n| n.state() == RunnerState::Running);
        let busy = workers.iter().any(|n| is_busy(n.state()));

        match self.state() {
            RunnerState::Spawning | RunnerState::Running if !busy => {
                self.finish_run("all workers stopped").await
            }
            RunnerState::Spawning if !spawning && running => {
                if self
                    .inner
                    .state
                    .compare_and_set(RunnerState::Spawning, RunnerState::Running)
                {
                    tracing::info!(workers = workers.len(), "All workers finished spawning");
                }
            }
            RunnerState::Stopping if !busy => self.finish_run("stop acknowledged").await,
            _ => {}
        }
    }

    /// Move to `Stopped` once and publish the final aggregate
    async fn finish_run(&self, reason: &str) {
        let current = self.state();
        if !matches!(
            current,
            RunnerState::Spawning | RunnerState::Running | RunnerState::Stopping
        ) || !self.inner.state.compare_and_set(current, RunnerState::Stopped)
        {
            return;
        }
        tracing::info!(reason, "Run stopped");
        self.publish_final(RunnerState::Stopped).await;
    }

    async fn publish_final(&self, state: RunnerState) {
        let mut snapshot = self.snapshot();
        snapshot.state = state;
        let outputs = self.inner.outputs.read().clone();
        publish(&outputs, &snapshot).await;
        futures::future::join_all(outputs.iter().map(|o| o.on_stop())).await;
    }

    async fn check_heartbeats(&self) {
        for node in self.inner.registry.snapshot() {
            if node.state() == RunnerState::Missing {
                continue;
            }
            if node.tick_heartbeat() <= 0 {
                node.set_state(RunnerState::Missing);
                tracing::warn!(
                    node_id = %node.id,
                    active = self.active_worker_count(),
                    "Worker missed heartbeats, marked missing"
                );
            }
        }

        if self.state() == RunnerState::Running && self.active_worker_count() == 0 {
            self.finish_run("all workers missing").await;
        }
    }
}

impl std::fmt::Debug for MasterRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterRunner")
            .field("state", &self.state())
            .field("workers", &self.inner.registry.len())
            .field("active", &self.active_worker_count())
            .finish()
    }
}

fn is_busy(state: RunnerState) -> bool {
    matches!(
        state,
        RunnerState::Spawning | RunnerState::Running | RunnerState::Stopping
    )
}

/// `index`-th of `n` near-equal parts of `total`; earlier parts take the
/// remainder
fn share(total: i64, n: usize, index: usize) -> i64 {
    let n = n as i64;
    let index = index as i64;
    total / n + i64::from(index < total % n)
}

/// Split a ramp-up step between `n` workers
fn ramp_share(spec: &str, n: usize) -> String {
    match parse_ramp_spec(spec) {
        Ok(Some((step, period))) => {
            let step = (step / n as i64).max(1);
            format!("{step}/{}ms", period.as_millis())
        }
        Ok(None) => RAMP_DISABLED.to_string(),
        Err(e) => {
            tracing::error!(error = %e, "Invalid ramp-up spec, workers run without ramp");
            RAMP_DISABLED.to_string()
        }
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn heartbeat_loop(master: MasterRunner) {
    let period = master.inner.config.heartbeat_interval;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        master.check_heartbeats().await;
    }
}

async fn rebalance_loop(master: MasterRunner, mut requests: mpsc::Receiver<()>) {
    while requests.recv().await.is_some() {
        master.rebalance().await;
    }
}

async fn report_loop(master: MasterRunner) {
    let period = master.inner.report_interval;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if is_busy(master.state()) {
            let snapshot = master.snapshot();
            let outputs = master.inner.outputs.read().clone();
            publish(&outputs, &snapshot).await;
        }
    }
}

async fn auto_start(master: MasterRunner) {
    let expected = master.inner.config.expect_workers;
    let max_wait = master.inner.config.expect_workers_max_wait;
    let deadline = Instant::now() + max_wait;
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!(expected, ?max_wait, "Waiting for workers before starting");
    loop {
        ticker.tick().await;
        let active = master.active_worker_count();
        if active >= expected {
            tracing::info!(active, "Expected workers connected, starting");
            break;
        }
        if !max_wait.is_zero() && Instant::now() >= deadline {
            if master.inner.config.abort_on_expect_timeout || active == 0 {
                tracing::error!(active, expected, "Expected workers did not connect, aborting");
                master.quit().await;
                return;
            }
            tracing::warn!(active, expected, "Expected workers did not connect, starting anyway");
            break;
        }
    }

    if let Err(e) = master.start().await {
        tracing::error!(error = %e, "Auto-start failed");
    }
}
