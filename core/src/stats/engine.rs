//! Single-consumer stats engine
//!
//! Execution units push outcomes through a cloneable [`StatsRecorder`]. One
//! consumer task per run drains the queues into a [`RequestStats`] it owns
//! exclusively, and publishes a [`Snapshot`] to every output on each tick.

use super::entry::{FailureEvent, RequestStats, SuccessEvent, TransactionEvent};
use super::output::Output;
use super::snapshot::Snapshot;
use crate::channel::ChannelConfig;
use crate::runner::{RunnerState, StateCell};

use parking_lot::RwLock;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Default interval between snapshots
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(3);

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Handle used by task bodies to report outcomes
///
/// Sending waits while a queue is full; that backpressure shows up as a
/// stall in the reporting task, never as lost events.
#[derive(Debug, Clone)]
pub struct StatsRecorder {
    successes: mpsc::Sender<SuccessEvent>,
    failures: mpsc::Sender<FailureEvent>,
    transactions: mpsc::Sender<TransactionEvent>,
}

impl StatsRecorder {
    /// Report a successful request
    pub async fn record_success(
        &self,
        request_type: &str,
        name: &str,
        response_time: u64,
        content_length: u64,
    ) {
        let event = SuccessEvent {
            request_type: request_type.to_string(),
            name: name.to_string(),
            response_time,
            content_length,
            timestamp: now_ms(),
        };
        let _ = self.successes.send(event).await;
    }

    /// Report a failed request
    pub async fn record_failure(
        &self,
        request_type: &str,
        name: &str,
        response_time: u64,
        error: impl Into<String>,
    ) {
        let event = FailureEvent {
            request_type: request_type.to_string(),
            name: name.to_string(),
            response_time,
            error: error.into(),
            timestamp: now_ms(),
        };
        let _ = self.failures.send(event).await;
    }

    /// Report a transaction outcome
    pub async fn record_transaction(
        &self,
        name: &str,
        success: bool,
        elapsed: u64,
        content_size: u64,
    ) {
        let event = TransactionEvent {
            name: name.to_string(),
            success,
            elapsed,
            content_size,
            timestamp: now_ms(),
        };
        let _ = self.transactions.send(event).await;
    }
}

struct Inbox {
    successes: mpsc::Receiver<SuccessEvent>,
    failures: mpsc::Receiver<FailureEvent>,
    transactions: mpsc::Receiver<TransactionEvent>,
}

impl Inbox {
    fn discard_pending(&mut self) {
        while self.successes.try_recv().is_ok() {}
        while self.failures.try_recv().is_ok() {}
        while self.transactions.try_recv().is_ok() {}
    }

    fn drain_into(&mut self, stats: &mut RequestStats) {
        while let Ok(event) = self.transactions.try_recv() {
            stats.log_transaction(&event);
        }
        while let Ok(event) = self.successes.try_recv() {
            stats.log_success(&event);
        }
        while let Ok(event) = self.failures.try_recv() {
            stats.log_failure(&event);
        }
    }
}

/// What the consumer reads from the runner when building a snapshot
#[derive(Debug, Clone)]
pub struct RunnerView {
    /// Runner state
    pub state: Arc<StateCell>,
    /// Live execution units
    pub user_count: Arc<AtomicI64>,
}

/// Owner of the stats queues and output sinks
pub struct StatsEngine {
    recorder: StatsRecorder,
    inbox: Arc<Mutex<Inbox>>,
    outputs: RwLock<Vec<Arc<dyn Output>>>,
    report_interval: Duration,
}

impl StatsEngine {
    /// Create an engine with the given queue sizes and report interval
    pub fn new(channels: &ChannelConfig, report_interval: Duration) -> Self {
        let (success_tx, success_rx) = mpsc::channel(channels.success_buffer.max(1));
        let (failure_tx, failure_rx) = mpsc::channel(channels.failure_buffer.max(1));
        let (transaction_tx, transaction_rx) = mpsc::channel(channels.transaction_buffer.max(1));

        Self {
            recorder: StatsRecorder {
                successes: success_tx,
                failures: failure_tx,
                transactions: transaction_tx,
            },
            inbox: Arc::new(Mutex::new(Inbox {
                successes: success_rx,
                failures: failure_rx,
                transactions: transaction_rx,
            })),
            outputs: RwLock::new(Vec::new()),
            report_interval,
        }
    }

    /// Recorder handle for task bodies
    pub fn recorder(&self) -> StatsRecorder {
        self.recorder.clone()
    }

    /// Register an output sink
    pub fn add_output(&self, output: Arc<dyn Output>) {
        self.outputs.write().push(output);
    }

    /// Registered output sinks
    pub fn outputs(&self) -> Vec<Arc<dyn Output>> {
        self.outputs.read().clone()
    }

    /// Interval between snapshots
    pub fn report_interval(&self) -> Duration {
        self.report_interval
    }

    /// Start the consumer for one run with fresh stats
    ///
    /// The consumer exits after `finish` fires (or the runner reaches
    /// Stopped/Quitting), having drained the queues and published a final
    /// snapshot. A new consumer waits for the previous one to release the
    /// queues.
    pub fn spawn_consumer(&self, view: RunnerView, finish: watch::Receiver<bool>) -> JoinHandle<()> {
        let outputs = self.outputs();
        let interval = self.report_interval;
        match Arc::clone(&self.inbox).try_lock_owned() {
            Ok(mut inbox) => {
                // reset before any unit of the new run can record
                inbox.discard_pending();
                tokio::spawn(consume(inbox, outputs, view, interval, finish))
            }
            Err(_) => {
                let inbox = Arc::clone(&self.inbox);
                tokio::spawn(async move {
                    let inbox = inbox.lock_owned().await;
                    consume(inbox, outputs, view, interval, finish).await;
                })
            }
        }
    }
}

impl std::fmt::Debug for StatsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsEngine")
            .field("outputs", &self.outputs.read().len())
            .field("report_interval", &self.report_interval)
            .finish()
    }
}

/// Publish one snapshot to every sink concurrently and wait for all of them
pub async fn publish(outputs: &[Arc<dyn Output>], snapshot: &Snapshot) {
    futures::future::join_all(outputs.iter().map(|o| o.on_event(snapshot))).await;
}

async fn consume(
    mut inbox: tokio::sync::OwnedMutexGuard<Inbox>,
    outputs: Vec<Arc<dyn Output>>,
    view: RunnerView,
    interval: Duration,
    mut finish: watch::Receiver<bool>,
) {
    let mut stats = RequestStats::new();
    futures::future::join_all(outputs.iter().map(|o| o.on_start())).await;

    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let Inbox {
        successes,
        failures,
        transactions,
    } = &mut *inbox;

    loop {
        if *finish.borrow() {
            break;
        }
        tokio::select! {
            Some(event) = transactions.recv() => stats.log_transaction(&event),
            Some(event) = successes.recv() => stats.log_success(&event),
            Some(event) = failures.recv() => stats.log_failure(&event),
            _ = ticker.tick() => {
                let state = view.state.load();
                if matches!(state, RunnerState::Stopped | RunnerState::Quitting) {
                    break;
                }
                let snapshot = stats.snapshot(state, view.user_count.load(Ordering::Acquire));
                publish(&outputs, &snapshot).await;
            }
            changed = finish.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    inbox.drain_into(&mut stats);
    let snapshot = stats.snapshot(view.state.load(), view.user_count.load(Ordering::Acquire));
    tracing::debug!(
        requests = snapshot.total.num_requests,
        failures = snapshot.total.num_failures,
        "publishing final stats snapshot"
    );
    publish(&outputs, &snapshot).await;
    futures::future::join_all(outputs.iter().map(|o| o.on_stop())).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;

    #[derive(Default)]
    struct CollectingOutput {
        events: SyncMutex<Vec<Snapshot>>,
        started: SyncMutex<u32>,
        stopped: SyncMutex<u32>,
    }

    #[async_trait]
    impl Output for CollectingOutput {
        async fn on_start(&self) {
            *self.started.lock() += 1;
        }

        async fn on_event(&self, snapshot: &Snapshot) {
            self.events.lock().push(snapshot.clone());
        }

        async fn on_stop(&self) {
            *self.stopped.lock() += 1;
        }
    }

    fn view(state: RunnerState) -> RunnerView {
        RunnerView {
            state: Arc::new(StateCell::new(state)),
            user_count: Arc::new(AtomicI64::new(0)),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_and_final_snapshots() {
        let engine = StatsEngine::new(&ChannelConfig::default(), Duration::from_secs(3));
        let output = Arc::new(CollectingOutput::default());
        engine.add_output(output.clone());

        let view = view(RunnerState::Running);
        let (finish_tx, finish_rx) = watch::channel(false);
        let consumer = engine.spawn_consumer(view.clone(), finish_rx);

        let recorder = engine.recorder();
        recorder.record_success("GET", "/", 10, 5).await;
        recorder.record_failure("GET", "/", 20, "boom").await;

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(output.events.lock().len(), 1);

        recorder.record_transaction("flow", true, 30, 0).await;
        view.state.update_state(RunnerState::Stopped);
        finish_tx.send_replace(true);
        consumer.await.unwrap();

        let events = output.events.lock();
        let last = events.last().unwrap();
        assert_eq!(last.total.num_requests, 3);
        assert_eq!(last.total.num_failures, 1);
        assert_eq!(last.transactions.passed, 1);
        assert_eq!(last.state, RunnerState::Stopped);
        assert_eq!(*output.started.lock(), 1);
        assert_eq!(*output.stopped.lock(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consumer_exits_when_runner_stops() {
        let engine = StatsEngine::new(&ChannelConfig::default(), Duration::from_secs(1));
        let output = Arc::new(CollectingOutput::default());
        engine.add_output(output.clone());

        let view = view(RunnerState::Running);
        let (_finish_tx, finish_rx) = watch::channel(false);
        let consumer = engine.spawn_consumer(view.clone(), finish_rx);

        view.state.update_state(RunnerState::Stopped);
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        consumer.await.unwrap();

        assert_eq!(output.events.lock().len(), 1);
        assert_eq!(*output.stopped.lock(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_run_starts_from_zero() {
        let engine = StatsEngine::new(&ChannelConfig::default(), Duration::from_secs(60));
        let output = Arc::new(CollectingOutput::default());
        engine.add_output(output.clone());
        let recorder = engine.recorder();

        for _ in 0..2 {
            let view = view(RunnerState::Running);
            let (finish_tx, finish_rx) = watch::channel(false);
            let consumer = engine.spawn_consumer(view, finish_rx);
            recorder.record_success("GET", "/", 1, 0).await;
            tokio::task::yield_now().await;
            finish_tx.send_replace(true);
            consumer.await.unwrap();
        }

        let events = output.events.lock();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|s| s.total.num_requests == 1));
    }

    #[tokio::test]
    async fn test_publish_waits_for_all_outputs() {
        let outputs: Vec<Arc<dyn Output>> = vec![
            Arc::new(CollectingOutput::default()),
            Arc::new(CollectingOutput::default()),
        ];
        let snapshot = Snapshot::empty(RunnerState::Running, 0);
        publish(&outputs, &snapshot).await;
    }
}
