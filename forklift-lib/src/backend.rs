//! Worker spawning backends.
//!
//! The pool talks to workers through this facade so the test suite
//! (and hosts that cannot re-execute themselves) can run the identical
//! worker runtime on in-process threads instead of child processes.

use std::collections::HashMap;
use std::io;
use std::sync::mpsc::Sender;
use std::time::Duration;

use serde_json::Value;

use forklift_core::{ResultFrame, WorkerCommand};

pub mod inproc;
pub mod process;

/// Everything a new worker needs at startup: the shared-state snapshot
/// it seeds its mirror from, the init plan, and the log level.
#[derive(Debug, Clone)]
pub struct WorkerSeed {
    pub worker_id: usize,
    pub globals: HashMap<String, Value>,
    pub init_funcs: Vec<(String, Value)>,
    pub log_level: Option<String>,
}

/// Events flowing into the result dispatcher.
#[derive(Debug)]
pub enum PoolEvent {
    /// A frame arrived from a worker.
    Frame(usize, ResultFrame),
    /// A worker's result channel closed (clean exit or crash).
    Exited(usize),
    /// Pool shutdown: stop the dispatcher.
    Shutdown,
}

/// Spawns workers.
///
/// Implementations deliver the `Init` handshake themselves, forward
/// every frame the worker emits to `events` in emission order, and
/// follow the last frame with exactly one `Exited`.
pub trait WorkerBackend: Send + Sync {
    fn launch(
        &self,
        seed: WorkerSeed,
        events: Sender<PoolEvent>,
    ) -> io::Result<Box<dyn WorkerHandle>>;
}

/// One live worker as seen from the pool.
pub trait WorkerHandle: Send {
    /// Queue a command to the worker. Commands to one worker are
    /// delivered in send order; that per-worker order is the only
    /// delivery guarantee the pool relies on.
    fn send(&mut self, command: &WorkerCommand) -> io::Result<()>;

    /// Best-effort immediate termination.
    fn kill(&mut self);

    /// Wait up to `timeout` for the worker to exit on its own.
    /// Returns whether it exited.
    fn wait_timeout(&mut self, timeout: Duration) -> bool;
}
