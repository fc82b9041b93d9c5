//! Child-process worker backend.
//!
//! Workers are the host binary re-executed with [`WORKER_ENV`] set;
//! [`crate::init`] detects the variable and turns the process into a
//! worker before the host's `main` does anything else. Frames travel
//! as JSON lines over the child's stdin/stdout; stderr is inherited so
//! worker logs land with the host's.

use std::io::{self, BufReader};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::mpsc::Sender;
use std::thread;
use std::time::{Duration, Instant};

use forklift_core::{ResultFrame, WorkerCommand, read_frame, write_frame};

use super::{PoolEvent, WorkerBackend, WorkerHandle, WorkerSeed};

/// Environment variable marking a process as a pool worker. The value
/// is the worker id.
pub const WORKER_ENV: &str = "FORKLIFT_WORKER";

/// Spawns workers as child processes of the host binary.
#[derive(Debug, Default)]
pub struct ProcessBackend;

impl WorkerBackend for ProcessBackend {
    fn launch(
        &self,
        seed: WorkerSeed,
        events: Sender<PoolEvent>,
    ) -> io::Result<Box<dyn WorkerHandle>> {
        let exe = std::env::current_exe()?;
        let mut child = Command::new(exe)
            .env(WORKER_ENV, seed.worker_id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("worker stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("worker stdout not captured"))?;

        let worker_id = seed.worker_id;
        log::debug!("spawned worker {} (pid {})", worker_id, child.id());

        // Handshake before anything else so the worker can seed its
        // state mirror and run init funcs.
        write_frame(
            &mut stdin,
            &WorkerCommand::Init {
                worker_id,
                globals: seed.globals,
                init_funcs: seed.init_funcs,
                log_level: seed.log_level,
            },
        )?;

        thread::Builder::new()
            .name(format!("forklift-reader-{}", worker_id))
            .spawn(move || read_loop(worker_id, stdout, events))?;

        Ok(Box::new(ProcessHandle {
            child,
            stdin: Some(stdin),
        }))
    }
}

/// Forward every result frame to the dispatcher; EOF means the worker
/// is gone. Clean exit and crash look the same here; the dispatcher
/// tells them apart by whether the worker was holding a submission.
fn read_loop(worker_id: usize, stdout: ChildStdout, events: Sender<PoolEvent>) {
    let mut reader = BufReader::new(stdout);
    loop {
        match read_frame::<ResultFrame>(&mut reader) {
            Ok(Some(frame)) => {
                if events.send(PoolEvent::Frame(worker_id, frame)).is_err() {
                    break; // dispatcher gone
                }
            }
            Ok(None) => break,
            Err(err) => {
                log::warn!("worker {}: unreadable result frame: {}", worker_id, err);
                break;
            }
        }
    }
    let _ = events.send(PoolEvent::Exited(worker_id));
}

struct ProcessHandle {
    child: Child,
    stdin: Option<ChildStdin>,
}

impl WorkerHandle for ProcessHandle {
    fn send(&mut self, command: &WorkerCommand) -> io::Result<()> {
        match self.stdin.as_mut() {
            Some(stdin) => write_frame(stdin, command),
            None => Err(io::Error::other("worker stdin closed")),
        }
    }

    fn kill(&mut self) {
        // Closing stdin doubles as a shutdown signal if the kill races
        // a normally-exiting child.
        self.stdin = None;
        if let Err(err) = self.child.kill() {
            log::warn!("failed to kill worker process: {}", err);
        }
        let _ = self.child.try_wait();
    }

    fn wait_timeout(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    log::debug!("worker process exited with {}", status);
                    return true;
                }
                Ok(None) => {}
                Err(err) => {
                    log::warn!("failed to poll worker process: {}", err);
                    return false;
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }
}
