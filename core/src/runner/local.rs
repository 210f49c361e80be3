//! Standalone runner

use super::executor::Runner;
use crate::error::Result;

/// Runs the whole workload in this process
#[derive(Debug, Clone)]
pub struct LocalRunner {
    runner: Runner,
    spawn_count: i64,
    spawn_rate: f64,
}

impl LocalRunner {
    /// Wrap a configured runner
    pub fn new(runner: Runner, spawn_count: i64, spawn_rate: f64) -> Self {
        Self {
            runner,
            spawn_count,
            spawn_rate,
        }
    }

    /// Start spawning; returns once the cycle is set up
    pub async fn run(&self) -> Result<()> {
        let target = self.spawn_count;
        self.runner
            .start_spawning(
                self.spawn_count,
                self.spawn_rate,
                Some(Box::new(move |spawned| {
                    tracing::info!(spawned, target, "Spawning complete");
                })),
            )
            .await
    }

    /// Stop the run and wait for the final snapshot
    pub async fn stop(&self) {
        self.runner.stop().await;
    }

    /// Stop and quit
    pub async fn quit(&self) {
        self.runner.quit().await;
    }

    /// Underlying runner
    pub fn runner(&self) -> &Runner {
        &self.runner
    }
}
