//! In-process worker backend.
//!
//! Runs the identical worker runtime on a `std::thread` with channel
//! transport instead of pipes. The test suite is built on this; hosts
//! that cannot re-execute their own binary can select it too, trading
//! process isolation for simplicity.
//!
//! `kill()` cannot interrupt a running work function (threads are not
//! killable); it halts the frame sink and abandons the thread, which
//! the pool observes as a worker death once the function returns.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use forklift_core::{ResultFrame, WorkerCommand};

use super::{PoolEvent, WorkerBackend, WorkerHandle, WorkerSeed};
use crate::worker::{FrameSink, Runtime};

/// Spawns workers as threads inside the pool's own process.
#[derive(Debug, Default)]
pub struct InprocBackend;

impl WorkerBackend for InprocBackend {
    fn launch(
        &self,
        seed: WorkerSeed,
        events: Sender<PoolEvent>,
    ) -> io::Result<Box<dyn WorkerHandle>> {
        let worker_id = seed.worker_id;
        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();
        let halted = Arc::new(AtomicBool::new(false));
        let runtime = Arc::new(Runtime::new(worker_id));

        let sink = ChannelSink {
            worker_id,
            events: events.clone(),
            halted: Arc::clone(&halted),
        };
        let serve_runtime = Arc::clone(&runtime);
        let join = thread::Builder::new()
            .name(format!("forklift-worker-{}", worker_id))
            .spawn(move || {
                serve_runtime.serve(seed, &command_rx, &sink);
                let _ = events.send(PoolEvent::Exited(worker_id));
            })?;

        Ok(Box::new(InprocHandle {
            runtime,
            command_tx: Some(command_tx),
            halted,
            join: Some(join),
        }))
    }
}

struct ChannelSink {
    worker_id: usize,
    events: Sender<PoolEvent>,
    halted: Arc<AtomicBool>,
}

impl FrameSink for ChannelSink {
    fn emit(&self, frame: &ResultFrame) -> bool {
        // A halted worker is "dead": nothing it produces may reach the
        // pool, mirroring a killed process whose pipe is gone.
        if self.halted.load(Ordering::SeqCst) {
            return false;
        }
        self.events
            .send(PoolEvent::Frame(self.worker_id, frame.clone()))
            .is_ok()
    }
}

struct InprocHandle {
    runtime: Arc<Runtime>,
    command_tx: Option<Sender<WorkerCommand>>,
    halted: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle for InprocHandle {
    fn send(&mut self, command: &WorkerCommand) -> io::Result<()> {
        // Route like the process-mode stdin router: notifications are
        // applied immediately, everything else queues for the command
        // loop.
        if let WorkerCommand::Notify { name, payload } = command {
            self.runtime.handle_notification(name, payload);
            return Ok(());
        }
        match self.command_tx.as_ref() {
            Some(tx) => tx
                .send(command.clone())
                .map_err(|_| io::Error::other("worker command channel closed")),
            None => Err(io::Error::other("worker command channel closed")),
        }
    }

    fn kill(&mut self) {
        self.halted.store(true, Ordering::SeqCst);
        // Disconnecting the channel wakes a blocked command loop; a
        // thread inside user code finishes its item first.
        self.command_tx = None;
        self.join = None;
    }

    fn wait_timeout(&mut self, timeout: Duration) -> bool {
        let Some(join) = self.join.take() else {
            return true;
        };
        let deadline = Instant::now() + timeout;
        while !join.is_finished() {
            if Instant::now() >= deadline {
                self.join = Some(join);
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
        let _ = join.join();
        true
    }
}
