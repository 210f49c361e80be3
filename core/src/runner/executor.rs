//! Execution-unit pool and run lifecycle

use super::budget::LoopBudget;
use super::rate_limiter::RateLimiter;
use super::state::{RunnerState, StateCell};
use crate::channel::ChannelConfig;
use crate::config::MAX_SPAWN_COUNT;
use crate::error::{Error, Result};
use crate::stats::{Output, RunnerView, StatsEngine, StatsRecorder, DEFAULT_REPORT_INTERVAL};
use crate::task::{Task, TaskSet};

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Request type under which task panics are reported
pub const PANIC_REQUEST_TYPE: &str = "panic";

/// Callback invoked once every unit of a spawn cycle has been started
pub type SpawnComplete = Box<dyn FnOnce(i64) + Send + 'static>;

/// Owner of the execution-unit pool
///
/// A `Runner` is cheap to clone; clones share the same pool, stats engine
/// and state. Each call to [`Runner::start_spawning`] begins a new cycle with
/// fresh stats, a fresh stop signal and, when a loop count is set, a fresh
/// loop budget.
#[derive(Clone)]
pub struct Runner {
    inner: Arc<Inner>,
}

struct Inner {
    tasks: RwLock<Arc<TaskSet>>,
    rate_limiter: RwLock<Option<Arc<RateLimiter>>>,
    loop_count: AtomicI64,
    state: Arc<StateCell>,
    user_count: Arc<AtomicI64>,
    stats: StatsEngine,
    generation: AtomicU64,
    cycle: tokio::sync::Mutex<Option<Cycle>>,
}

/// Everything owned by one spawn cycle
struct Cycle {
    id: u64,
    stop_tx: watch::Sender<bool>,
    finish_tx: watch::Sender<bool>,
    rate_limiter: Option<Arc<RateLimiter>>,
    spawner: JoinHandle<()>,
    units: Arc<Mutex<Vec<JoinHandle<()>>>>,
    consumer: JoinHandle<()>,
}

/// Shared by every unit of a cycle
struct UnitContext {
    cycle: u64,
    tasks: Arc<TaskSet>,
    rate_limiter: Option<Arc<RateLimiter>>,
    budget: Option<Arc<LoopBudget>>,
    recorder: StatsRecorder,
    runner: Weak<Inner>,
}

impl Runner {
    /// Create a runner with default queue sizes and report interval
    pub fn new() -> Self {
        Self::with_stats(&ChannelConfig::default(), DEFAULT_REPORT_INTERVAL)
    }

    /// Create a runner with explicit stats queue sizes and report interval
    pub fn with_stats(channels: &ChannelConfig, report_interval: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                tasks: RwLock::new(Arc::new(TaskSet::default())),
                rate_limiter: RwLock::new(None),
                loop_count: AtomicI64::new(0),
                state: Arc::new(StateCell::default()),
                user_count: Arc::new(AtomicI64::new(0)),
                stats: StatsEngine::new(channels, report_interval),
                generation: AtomicU64::new(0),
                cycle: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Replace the workload; takes effect on the next spawn cycle
    pub fn set_tasks(&self, tasks: Vec<Task>) {
        *self.inner.tasks.write() = Arc::new(TaskSet::new(tasks));
    }

    /// Replace the rate limiter; `None` runs unlimited
    pub fn set_rate_limiter(&self, rate_limiter: Option<RateLimiter>) {
        *self.inner.rate_limiter.write() = rate_limiter.map(Arc::new);
    }

    /// Total task executions per cycle across all units; `<= 0` is unbounded
    pub fn set_loop_count(&self, loop_count: i64) {
        self.inner.loop_count.store(loop_count, Ordering::Release);
    }

    /// Configured loop count
    pub fn loop_count(&self) -> i64 {
        self.inner.loop_count.load(Ordering::Acquire)
    }

    /// Handle for task bodies to report outcomes
    pub fn recorder(&self) -> StatsRecorder {
        self.inner.stats.recorder()
    }

    /// Register an output sink; takes effect on the next spawn cycle
    pub fn add_output(&self, output: Arc<dyn Output>) {
        self.inner.stats.add_output(output);
    }

    /// Current lifecycle state
    pub fn state(&self) -> RunnerState {
        self.inner.state.load()
    }

    /// Shared state cell, for callers that drive or observe transitions
    pub fn state_cell(&self) -> &Arc<StateCell> {
        &self.inner.state
    }

    /// Live execution units
    pub fn current_users(&self) -> i64 {
        self.inner.user_count.load(Ordering::Acquire)
    }

    /// Begin a new spawn cycle
    ///
    /// Stops the previous cycle first, then starts `count` execution units
    /// paced `1_000_000 / rate` microseconds apart (no pacing when `rate` is
    /// not positive). Returns once the cycle is set up; spawning continues
    /// in the background and `on_complete` runs with the number of units
    /// started, right before the state becomes `Running`.
    pub async fn start_spawning(
        &self,
        count: i64,
        rate: f64,
        on_complete: Option<SpawnComplete>,
    ) -> Result<()> {
        let tasks = self.inner.tasks.read().clone();
        if tasks.is_empty() {
            return Err(Error::Runner("no tasks registered".into()));
        }
        if count > MAX_SPAWN_COUNT {
            return Err(Error::Runner(format!(
                "spawn count {count} exceeds {MAX_SPAWN_COUNT}"
            )));
        }

        let mut slot = self.inner.cycle.lock().await;
        stop_cycle(&self.inner, &mut slot).await;

        let id = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let (stop_tx, stop_rx) = watch::channel(false);
        let (finish_tx, finish_rx) = watch::channel(false);
        let rate_limiter = self.inner.rate_limiter.read().clone();
        let loop_count = self.loop_count();
        let budget = (loop_count > 0).then(|| Arc::new(LoopBudget::new(loop_count)));

        self.inner.state.update_state(RunnerState::Spawning);
        let consumer = self.inner.stats.spawn_consumer(
            RunnerView {
                state: Arc::clone(&self.inner.state),
                user_count: Arc::clone(&self.inner.user_count),
            },
            finish_rx,
        );

        if let Some(limiter) = &rate_limiter {
            limiter.start();
        }

        tracing::info!(
            cycle = id,
            count,
            rate,
            loop_count,
            rate_limited = rate_limiter.is_some(),
            "Spawning execution units"
        );

        let context = Arc::new(UnitContext {
            cycle: id,
            tasks,
            rate_limiter: rate_limiter.clone(),
            budget,
            recorder: self.recorder(),
            runner: Arc::downgrade(&self.inner),
        });
        let units = Arc::new(Mutex::new(Vec::new()));
        let spawner = tokio::spawn(spawn_units(
            Arc::clone(&self.inner),
            context,
            Arc::clone(&units),
            count.max(0),
            pacing(rate),
            stop_rx,
            on_complete,
        ));

        *slot = Some(Cycle {
            id,
            stop_tx,
            finish_tx,
            rate_limiter,
            spawner,
            units,
            consumer,
        });
        Ok(())
    }

    /// Stop the current cycle
    ///
    /// Units finish their in-flight iteration, then the stats consumer
    /// publishes a final snapshot covering every completed execution.
    /// No-op when nothing is running.
    pub async fn stop(&self) {
        let mut slot = self.inner.cycle.lock().await;
        stop_cycle(&self.inner, &mut slot).await;
    }

    /// Stop and move to `Quitting`
    pub async fn quit(&self) {
        self.stop().await;
        self.inner.state.update_state(RunnerState::Quitting);
    }

    /// Wait until the runner is `Stopped` or `Quitting`
    pub async fn wait_stopped(&self) -> RunnerState {
        self.inner
            .state
            .wait_for(|state| matches!(state, RunnerState::Stopped | RunnerState::Quitting))
            .await
    }
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("state", &self.state())
            .field("current_users", &self.current_users())
            .field("loop_count", &self.loop_count())
            .field("tasks", &self.inner.tasks.read().len())
            .finish()
    }
}

fn pacing(rate: f64) -> Duration {
    if rate > 0.0 && rate.is_finite() {
        Duration::from_micros((1_000_000.0 / rate) as u64)
    } else {
        Duration::ZERO
    }
}

async fn stop_cycle(inner: &Inner, slot: &mut Option<Cycle>) {
    let Some(cycle) = slot.take() else {
        return;
    };

    inner.state.update_state(RunnerState::Stopping);
    cycle.stop_tx.send_replace(true);
    if let Some(limiter) = &cycle.rate_limiter {
        limiter.stop();
    }

    if let Err(e) = cycle.spawner.await {
        tracing::warn!(cycle = cycle.id, error = %e, "Spawner task failed");
    }
    let units = std::mem::take(&mut *cycle.units.lock());
    let total = units.len();
    for result in futures::future::join_all(units).await {
        if let Err(e) = result {
            tracing::warn!(cycle = cycle.id, error = %e, "Execution unit failed");
        }
    }
    inner.user_count.store(0, Ordering::Release);
    inner.state.update_state(RunnerState::Stopped);

    cycle.finish_tx.send_replace(true);
    if let Err(e) = cycle.consumer.await {
        tracing::warn!(cycle = cycle.id, error = %e, "Stats consumer failed");
    }
    tracing::info!(cycle = cycle.id, units = total, "Run stopped");
}

async fn spawn_units(
    inner: Arc<Inner>,
    context: Arc<UnitContext>,
    units: Arc<Mutex<Vec<JoinHandle<()>>>>,
    count: i64,
    interval: Duration,
    mut stop_rx: watch::Receiver<bool>,
    on_complete: Option<SpawnComplete>,
) {
    let mut spawned = 0;
    for _ in 0..count {
        if !interval.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = stopped(&mut stop_rx) => {}
            }
        }
        if *stop_rx.borrow() {
            tracing::debug!(cycle = context.cycle, spawned, "Spawning interrupted");
            return;
        }

        inner.user_count.fetch_add(1, Ordering::AcqRel);
        let handle = tokio::spawn(run_unit(
            Arc::clone(&context),
            Arc::clone(&inner.user_count),
            stop_rx.clone(),
        ));
        units.lock().push(handle);
        spawned += 1;
    }

    tracing::info!(cycle = context.cycle, spawned, "All execution units spawned");
    if let Some(callback) = on_complete {
        callback(spawned);
    }
    inner
        .state
        .compare_and_set(RunnerState::Spawning, RunnerState::Running);
}

async fn run_unit(
    context: Arc<UnitContext>,
    user_count: Arc<AtomicI64>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        if *stop_rx.borrow() {
            break;
        }

        if let Some(budget) = &context.budget {
            if !budget.acquire() {
                break;
            }
        }

        // a blocked tick keeps its loop ticket and retries after the refill
        if let Some(limiter) = &context.rate_limiter {
            let mut blocked = true;
            while blocked {
                tokio::select! {
                    result = limiter.acquire_wait() => blocked = result,
                    _ = stopped(&mut stop_rx) => break,
                }
            }
            if blocked {
                break;
            }
        }

        let Some(task) = context.tasks.select() else {
            break;
        };
        let outcome = AssertUnwindSafe(async { task.run().await })
            .catch_unwind()
            .await;
        if let Err(payload) = outcome {
            let message = panic_message(payload.as_ref());
            tracing::error!(task = %task.name, panic = %message, "Task panicked");
            context
                .recorder
                .record_failure(PANIC_REQUEST_TYPE, &task.name, 0, message)
                .await;
        }

        if let Some(budget) = &context.budget {
            if budget.finish() {
                tracing::info!(
                    cycle = context.cycle,
                    loop_count = budget.loop_count(),
                    "Loop budget exhausted, stopping"
                );
                if let Some(inner) = context.runner.upgrade() {
                    let cycle = context.cycle;
                    tokio::spawn(async move {
                        let mut slot = inner.cycle.lock().await;
                        if slot.as_ref().is_some_and(|c| c.id == cycle) {
                            stop_cycle(&inner, &mut slot).await;
                        }
                    });
                }
                break;
            }
        }
    }
    user_count.fetch_sub(1, Ordering::AcqRel);
}

async fn stopped(stop_rx: &mut watch::Receiver<bool>) {
    let _ = stop_rx.wait_for(|stop| *stop).await;
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "task panicked".to_string()
    }
}
