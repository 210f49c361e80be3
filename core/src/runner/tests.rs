//! Integration tests for the Runner module

use super::*;
use crate::error::Error;
use crate::stats::{Output, Snapshot};
use crate::task::Task;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Helpers
// ============================================================================

#[derive(Default)]
struct CollectingOutput {
    events: Mutex<Vec<Snapshot>>,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl CollectingOutput {
    fn last(&self) -> Option<Snapshot> {
        self.events.lock().last().cloned()
    }
}

#[async_trait]
impl Output for CollectingOutput {
    async fn on_start(&self) {
        self.starts.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_event(&self, snapshot: &Snapshot) {
        self.events.lock().push(snapshot.clone());
    }

    async fn on_stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

fn counting_task(name: &str, counter: Arc<AtomicUsize>) -> Task {
    Task::new(name, 1, move || {
        let counter = Arc::clone(&counter);
        async move {
            tokio::task::yield_now().await;
            counter.fetch_add(1, Ordering::SeqCst);
        }
    })
}

fn sleeping_task(counter: Arc<AtomicUsize>, runner: &Runner) -> Task {
    let recorder = runner.recorder();
    Task::new("work", 1, move || {
        let counter = Arc::clone(&counter);
        let recorder = recorder.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            counter.fetch_add(1, Ordering::SeqCst);
            recorder.record_success("task", "work", 10, 0).await;
        }
    })
}

async fn wait_stopped(runner: &Runner) {
    tokio::time::timeout(Duration::from_secs(30), runner.wait_stopped())
        .await
        .expect("runner did not stop");
    // the budget-triggered stop holds the cycle lock until the final
    // snapshot is out; this returns once it is released
    runner.stop().await;
}

// ============================================================================
// Loop budget
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_loop_budget_is_exact() {
    let counter = Arc::new(AtomicUsize::new(0));
    let runner = Runner::new();
    runner.set_tasks(vec![counting_task("count", Arc::clone(&counter))]);
    runner.set_loop_count(10);

    let local = LocalRunner::new(runner.clone(), 10, 0.0);
    local.run().await.unwrap();
    wait_stopped(&runner).await;

    assert_eq!(counter.load(Ordering::SeqCst), 10);
    assert_eq!(runner.state(), RunnerState::Stopped);
    assert_eq!(runner.current_users(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_loop_budget_larger_than_units() {
    let counter = Arc::new(AtomicUsize::new(0));
    let runner = Runner::new();
    runner.set_tasks(vec![counting_task("count", Arc::clone(&counter))]);
    runner.set_loop_count(1_000);

    runner.start_spawning(7, 0.0, None).await.unwrap();
    wait_stopped(&runner).await;

    assert_eq!(counter.load(Ordering::SeqCst), 1_000);
}

#[tokio::test(start_paused = true)]
async fn test_loop_budget_exact_under_rate_limit() {
    let counter = Arc::new(AtomicUsize::new(0));
    let runner = Runner::new();
    runner.set_tasks(vec![counting_task("count", Arc::clone(&counter))]);
    runner.set_loop_count(7);
    runner.set_rate_limiter(Some(RateLimiter::Stable(StableRateLimiter::new(3))));

    runner.start_spawning(5, 0.0, None).await.unwrap();
    wait_stopped(&runner).await;

    assert_eq!(counter.load(Ordering::SeqCst), 7);
}

// ============================================================================
// Panic isolation
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_panicking_task_is_isolated() {
    let panics = Arc::new(AtomicUsize::new(0));
    let successes = Arc::new(AtomicUsize::new(0));

    let panic_counter = Arc::clone(&panics);
    let panicking = Task::new("explode", 1, move || {
        let panic_counter = Arc::clone(&panic_counter);
        async move {
            panic_counter.fetch_add(1, Ordering::SeqCst);
            panic!("task exploded");
        }
    });

    let runner = Runner::new();
    let output = Arc::new(CollectingOutput::default());
    runner.add_output(output.clone());
    runner.set_tasks(vec![panicking, counting_task("ok", Arc::clone(&successes))]);
    runner.set_loop_count(50);

    runner.start_spawning(5, 0.0, None).await.unwrap();
    wait_stopped(&runner).await;

    let panicked = panics.load(Ordering::SeqCst);
    assert_eq!(panicked + successes.load(Ordering::SeqCst), 50);

    let snapshot = output.last().unwrap();
    assert_eq!(snapshot.total.num_failures as usize, panicked);
    if panicked > 0 {
        let entry = snapshot
            .stats
            .iter()
            .find(|e| e.request_type == PANIC_REQUEST_TYPE)
            .unwrap();
        assert_eq!(entry.name, "explode");
        assert_eq!(snapshot.errors[0].error, "task exploded");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_runner_survives_only_panicking_tasks() {
    let runner = Runner::new();
    runner.set_tasks(vec![Task::new("explode", 1, || async {
        panic!("always");
    })]);
    runner.set_loop_count(20);

    runner.start_spawning(4, 0.0, None).await.unwrap();
    wait_stopped(&runner).await;

    assert_eq!(runner.state(), RunnerState::Stopped);
}

// ============================================================================
// Stop ordering
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_graceful_stop_ordering() {
    let counter = Arc::new(AtomicUsize::new(0));
    let runner = Runner::new();
    let output = Arc::new(CollectingOutput::default());
    runner.add_output(output.clone());
    runner.set_tasks(vec![sleeping_task(Arc::clone(&counter), &runner)]);

    runner.start_spawning(8, 0.0, None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(205)).await;
    runner.stop().await;

    let executed = counter.load(Ordering::SeqCst);
    assert!(executed > 0);

    let snapshot = output.last().unwrap();
    assert_eq!(snapshot.total.num_requests as usize, executed);
    assert_eq!(snapshot.state, RunnerState::Stopped);
    assert_eq!(output.stops.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(counter.load(Ordering::SeqCst), executed);
    assert_eq!(runner.current_users(), 0);
}

#[tokio::test]
async fn test_stop_when_idle_is_noop() {
    let runner = Runner::new();
    runner.stop().await;
    assert_eq!(runner.state(), RunnerState::Init);
}

#[tokio::test]
async fn test_start_without_tasks_fails() {
    let runner = Runner::new();
    assert!(runner.start_spawning(1, 1.0, None).await.is_err());
    assert_eq!(runner.state(), RunnerState::Init);
}

#[tokio::test]
async fn test_start_rejects_oversized_spawn_count() {
    let counter = Arc::new(AtomicUsize::new(0));
    let runner = Runner::new();
    runner.set_tasks(vec![sleeping_task(Arc::clone(&counter), &runner)]);

    let err = runner
        .start_spawning(1i64 << 61, 1.0, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Runner(_)));
    assert_eq!(runner.state(), RunnerState::Init);
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_quit() {
    let counter = Arc::new(AtomicUsize::new(0));
    let runner = Runner::new();
    runner.set_tasks(vec![sleeping_task(Arc::clone(&counter), &runner)]);

    runner.start_spawning(2, 0.0, None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    runner.quit().await;

    assert_eq!(runner.state(), RunnerState::Quitting);
    assert_eq!(runner.wait_stopped().await, RunnerState::Quitting);
}

// ============================================================================
// Spawning
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_spawn_pacing() {
    let counter = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicI64::new(-1));
    let runner = Runner::new();
    runner.set_tasks(vec![sleeping_task(Arc::clone(&counter), &runner)]);

    let done = Arc::clone(&completed);
    runner
        .start_spawning(
            4,
            2.0,
            Some(Box::new(move |spawned| done.store(spawned, Ordering::SeqCst))),
        )
        .await
        .unwrap();
    assert_eq!(runner.state(), RunnerState::Spawning);

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert_eq!(runner.current_users(), 2);
    assert_eq!(runner.state(), RunnerState::Spawning);

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert_eq!(runner.current_users(), 4);
    assert_eq!(runner.state(), RunnerState::Running);
    assert_eq!(completed.load(Ordering::SeqCst), 4);

    runner.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_interrupts_spawning() {
    let counter = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicI64::new(-1));
    let runner = Runner::new();
    runner.set_tasks(vec![sleeping_task(Arc::clone(&counter), &runner)]);

    let done = Arc::clone(&completed);
    runner
        .start_spawning(
            100,
            1.0,
            Some(Box::new(move |spawned| done.store(spawned, Ordering::SeqCst))),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    runner.stop().await;

    assert_eq!(runner.state(), RunnerState::Stopped);
    assert_eq!(completed.load(Ordering::SeqCst), -1);
}

#[tokio::test(start_paused = true)]
async fn test_respawn_restarts_with_fresh_stats() {
    let counter = Arc::new(AtomicUsize::new(0));
    let runner = Runner::new();
    let output = Arc::new(CollectingOutput::default());
    runner.add_output(output.clone());
    runner.set_tasks(vec![sleeping_task(Arc::clone(&counter), &runner)]);

    runner.start_spawning(2, 0.0, None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    runner.start_spawning(3, 0.0, None).await.unwrap();
    let first_run = output.last().unwrap();
    assert!(first_run.total.num_requests > 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(runner.current_users(), 3);
    assert_eq!(runner.state(), RunnerState::Running);

    runner.stop().await;
    let second_run = output.last().unwrap();

    assert_eq!(output.starts.load(Ordering::SeqCst), 2);
    assert_eq!(output.stops.load(Ordering::SeqCst), 2);
    let total = counter.load(Ordering::SeqCst);
    assert_eq!(
        second_run.total.num_requests as usize,
        total - first_run.total.num_requests as usize
    );
    assert!(second_run.total.num_requests > 0);
}

// ============================================================================
// Rate limiting
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_stable_rate_limit_caps_executions() {
    let counter = Arc::new(AtomicUsize::new(0));
    let runner = Runner::new();
    runner.set_tasks(vec![counting_task("count", Arc::clone(&counter))]);
    runner.set_rate_limiter(Some(RateLimiter::Stable(StableRateLimiter::new(5))));

    runner.start_spawning(4, 0.0, None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    runner.stop().await;

    let executed = counter.load(Ordering::SeqCst);
    assert!((10..=15).contains(&executed), "executed {executed}");
}

#[tokio::test(start_paused = true)]
async fn test_stop_releases_units_blocked_on_limiter() {
    let counter = Arc::new(AtomicUsize::new(0));
    let runner = Runner::new();
    runner.set_tasks(vec![counting_task("count", Arc::clone(&counter))]);
    runner.set_rate_limiter(Some(RateLimiter::Stable(StableRateLimiter::with_period(
        1,
        Duration::from_secs(3_600),
    ))));

    runner.start_spawning(3, 0.0, None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    tokio::time::timeout(Duration::from_secs(5), runner.stop())
        .await
        .expect("stop hung on blocked units");
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}
