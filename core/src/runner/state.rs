//! Runner lifecycle state

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::watch;

/// Lifecycle state of a runner or of a worker tracked by the master
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum RunnerState {
    /// Created, nothing spawned yet
    Init = 1,
    /// Ramping execution units up
    Spawning = 2,
    /// Target concurrency reached
    Running = 3,
    /// Stop signal sent, units draining
    Stopping = 4,
    /// All units exited
    Stopped = 5,
    /// Shutting down for good
    Quitting = 6,
    /// Worker missed its heartbeats (master-side marker)
    Missing = 7,
}

impl RunnerState {
    /// Decode from the wire / atomic representation
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Init),
            2 => Some(Self::Spawning),
            3 => Some(Self::Running),
            4 => Some(Self::Stopping),
            5 => Some(Self::Stopped),
            6 => Some(Self::Quitting),
            7 => Some(Self::Missing),
            _ => None,
        }
    }

    /// Wire / atomic representation
    pub fn code(self) -> i64 {
        self as u8 as i64
    }

    /// Spawning or Running
    pub fn is_active(self) -> bool {
        matches!(self, Self::Spawning | Self::Running)
    }

    /// Lowercase name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Spawning => "spawning",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Quitting => "quitting",
            Self::Missing => "missing",
        }
    }
}

impl std::fmt::Display for RunnerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Atomic state cell with change notification
///
/// Reads and compare/set go through the atomic; every successful write is
/// also published on a watch channel so callers can await transitions.
#[derive(Debug)]
pub struct StateCell {
    code: AtomicU8,
    changes: watch::Sender<RunnerState>,
}

impl StateCell {
    /// Create a cell holding `initial`
    pub fn new(initial: RunnerState) -> Self {
        let (changes, _) = watch::channel(initial);
        Self {
            code: AtomicU8::new(initial as u8),
            changes,
        }
    }

    /// Current state
    pub fn load(&self) -> RunnerState {
        RunnerState::from_code(i64::from(self.code.load(Ordering::Acquire)))
            .unwrap_or(RunnerState::Init)
    }

    /// Unconditionally set the state
    pub fn update_state(&self, state: RunnerState) {
        self.code.store(state as u8, Ordering::Release);
        self.changes.send_replace(state);
    }

    /// Set `new` only if the current state is `current`
    pub fn compare_and_set(&self, current: RunnerState, new: RunnerState) -> bool {
        let swapped = self
            .code
            .compare_exchange(current as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if swapped {
            self.changes.send_replace(new);
        }
        swapped
    }

    /// Subscribe to state transitions
    pub fn subscribe(&self) -> watch::Receiver<RunnerState> {
        self.changes.subscribe()
    }

    /// Wait until `pred` holds for the current state
    pub async fn wait_for(&self, pred: impl Fn(RunnerState) -> bool) -> RunnerState {
        let mut rx = self.subscribe();
        loop {
            let state = self.load();
            if pred(state) {
                return state;
            }
            if rx.changed().await.is_err() {
                return self.load();
            }
        }
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new(RunnerState::Init)
    }
}
