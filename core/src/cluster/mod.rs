//! Master/worker control plane
//!
//! Workers connect to the master over TCP and exchange newline-delimited
//! JSON [`Message`]s. The master keeps a [`WorkerRegistry`], tracks
//! liveness with heartbeat credits and splits the run between active
//! workers; each worker drives a local [`Runner`](crate::Runner) from the
//! commands it receives and streams its stats back.
//!
//! ```text
//! worker                      master
//!   | register, client_ready ->  |
//!   | <- spawn (count, rate)     |
//!   | spawning, spawning_complete ->
//!   | heartbeat, stats (periodic) ->
//!   | <- stop                    |
//!   | client_stopped, client_ready ->
//!   | <- quit / quit ->          |
//! ```

mod master;
mod message;
mod registry;
mod transport;
mod worker;


pub use master::MasterRunner;
pub use message::{
    Message, MessageType, Profile, KEY_COUNT, KEY_CPU_USAGE, KEY_RUN, KEY_SPAWN_COUNT,
    KEY_SPAWN_RATE, KEY_STATE,
};
pub use registry::{WorkerNode, WorkerRegistry};
pub use transport::{encode, spawn_writer, MessageReader, MAX_FRAME_SIZE, OUTBOUND_BUFFER};
pub use worker::{CpuProbe, ProcessCpuProbe, SessionEnd, TasksHook, WorkerRunner};
