//! Worker-side runtime: handshake, notification listener, command loop.
//!
//! The same [`Runtime`] serves both backends. In a worker process the
//! router thread owns stdin: `Notify` frames are applied immediately
//! (even while user code runs on the command loop), `Run`/`Shutdown`
//! are forwarded in order to the command loop's channel. The
//! in-process backend routes at the send side instead and feeds the
//! command loop directly.

use std::any::Any;
use std::io::{self, BufRead};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;

use serde_json::Value;

use forklift_core::{
    NOTIFY_CANCEL, NOTIFY_UPDATE_LOG_LEVEL, NOTIFY_UPDATE_STATE_VALUE, ResultFrame, StateMap,
    SubmissionFrame, WorkError, WorkErrorKind, WorkerCommand, cancel_key, read_frame, write_frame,
};

use crate::backend::WorkerSeed;
use crate::backend::process::WORKER_ENV;
use crate::registry::{self, Resolved, WorkContext};

/// Where the command loop emits result frames.
///
/// Returns whether the frame was accepted; `false` stops the loop
/// (the pool is gone, or an in-process worker was killed).
pub(crate) trait FrameSink: Send {
    fn emit(&self, frame: &ResultFrame) -> bool;
}

/// State mirror of the worker process set up by [`init`], consulted by
/// the free-function cancel predicate.
static WORKER_STATE: OnceLock<StateMap> = OnceLock::new();

pub(crate) fn worker_state() -> Option<&'static StateMap> {
    WORKER_STATE.get()
}

/// Per-worker runtime: the shared-state mirror plus notification and
/// submission handling. One instance per worker, process or thread.
pub(crate) struct Runtime {
    worker_id: usize,
    state: StateMap,
}

impl Runtime {
    pub(crate) fn new(worker_id: usize) -> Self {
        Self {
            worker_id,
            state: StateMap::new(),
        }
    }

    pub(crate) fn state(&self) -> &StateMap {
        &self.state
    }

    /// Apply one notification. Runs on the listener/router thread (or
    /// the pool's sending thread for in-process workers); must stay
    /// quick and must never take down the worker.
    pub(crate) fn handle_notification(&self, name: &str, payload: &Value) {
        match name {
            NOTIFY_UPDATE_LOG_LEVEL => match payload.as_str() {
                Some(level) => apply_log_level(level),
                None => log::warn!("update_log_level payload is not a string"),
            },
            NOTIFY_UPDATE_STATE_VALUE => {
                let Some(key) = payload.get("key").and_then(Value::as_str) else {
                    log::warn!("update_state_value payload has no key");
                    return;
                };
                let value = payload.get("value").cloned().unwrap_or(Value::Null);
                self.state.set(key, value);
            }
            NOTIFY_CANCEL => match payload.as_u64() {
                Some(id) => {
                    log::debug!("worker {}: cancel flag raised for {}", self.worker_id, id);
                    self.state.set(&cancel_key(id), Value::Bool(true));
                }
                None => log::warn!("cancel payload is not a submission id"),
            },
            custom => registry::run_notification(custom, payload),
        }
    }

    /// Serve commands until shutdown. Seeds the mirror, signals
    /// `Started`, runs init funcs in registration order, signals
    /// `Loaded`, then loops over submissions.
    pub(crate) fn serve(
        &self,
        seed: WorkerSeed,
        commands: &Receiver<WorkerCommand>,
        sink: &dyn FrameSink,
    ) {
        self.state.seed(seed.globals);
        if let Some(ref level) = seed.log_level {
            apply_log_level(level);
        }
        if !sink.emit(&ResultFrame::Started) {
            return;
        }
        for (key, args) in &seed.init_funcs {
            self.run_init_func(key, args.clone());
        }
        if !sink.emit(&ResultFrame::Loaded) {
            return;
        }
        log::debug!("worker {}: ready", self.worker_id);

        loop {
            match commands.recv() {
                Ok(WorkerCommand::Run(frame)) => {
                    if !self.run_submission(frame, sink) {
                        return;
                    }
                }
                // Reachable for in-process workers; the process router
                // already consumed notifications.
                Ok(WorkerCommand::Notify { name, payload }) => {
                    self.handle_notification(&name, &payload);
                }
                Ok(WorkerCommand::Init { .. }) => {
                    log::warn!(
                        "worker {}: unexpected Init after handshake",
                        self.worker_id
                    );
                }
                Ok(WorkerCommand::Shutdown) | Err(_) => break,
            }
        }
        log::debug!("worker {}: command loop exiting", self.worker_id);
    }

    /// Init funcs run before any submission. Failures are logged and
    /// the worker keeps going; a worker with a broken init func is
    /// still better than a hole in the pool.
    fn run_init_func(&self, key: &str, args: Value) {
        let Some(resolved) = registry::resolve(key) else {
            log::error!("worker {}: init func '{}' is not registered", self.worker_id, key);
            return;
        };
        let ctx = WorkContext::new(0, self.state.clone());
        let outcome = match resolved {
            Resolved::Single(func) => {
                panic::catch_unwind(AssertUnwindSafe(|| func(ctx, args).map(|_| ())))
            }
            Resolved::Producer(func) => panic::catch_unwind(AssertUnwindSafe(|| {
                // An init producer is drained for its side effects.
                func(ctx, args).map(|iter| {
                    for item in iter {
                        if let Err(err) = item {
                            log::error!("init func '{}' item failed: {}", key, err);
                        }
                    }
                })
            })),
        };
        match outcome {
            Ok(Ok(())) => log::debug!("worker {}: init func '{}' done", self.worker_id, key),
            Ok(Err(err)) => log::error!("worker {}: init func '{}' failed: {}", self.worker_id, key, err),
            Err(payload) => log::error!(
                "worker {}: init func '{}' panicked: {}",
                self.worker_id,
                key,
                panic_text(payload.as_ref())
            ),
        }
    }

    /// Execute one submission and emit its frames. Returns `false` if
    /// the sink rejected a frame and the loop should stop.
    fn run_submission(&self, frame: SubmissionFrame, sink: &dyn FrameSink) -> bool {
        let SubmissionFrame { id, key, args, .. } = frame;
        let Some(resolved) = registry::resolve(&key) else {
            return sink.emit(&ResultFrame::Error {
                id,
                kind: WorkErrorKind::UnknownCallable,
                message: format!("no work function registered under key '{}'", key),
                detail: None,
            });
        };
        let ctx = WorkContext::new(id, self.state.clone());
        let sent = match resolved {
            Resolved::Single(func) => self.run_single(id, &*func, ctx, args, sink),
            Resolved::Producer(func) => self.run_stream(id, &*func, ctx, args, sink),
        };
        // The local cancel flag is dead once the terminal frame is out.
        self.state.remove(&cancel_key(id));
        sent
    }

    fn run_single(
        &self,
        id: u64,
        func: &(dyn Fn(WorkContext, Value) -> Result<Value, registry::BoxError> + Send + Sync),
        ctx: WorkContext,
        args: Value,
        sink: &dyn FrameSink,
    ) -> bool {
        let probe = ctx.clone();
        let frame = match panic::catch_unwind(AssertUnwindSafe(|| func(ctx, args))) {
            Ok(Ok(payload)) => {
                if probe.is_cancelled() {
                    ResultFrame::Cancelled { id }
                } else {
                    ResultFrame::Value { id, payload }
                }
            }
            Ok(Err(err)) => error_frame(id, &err),
            Err(payload) => panic_frame(id, payload.as_ref()),
        };
        sink.emit(&frame)
    }

    fn run_stream(
        &self,
        id: u64,
        func: &(dyn Fn(WorkContext, Value) -> Result<registry::WorkStream, registry::BoxError>
              + Send
              + Sync),
        ctx: WorkContext,
        args: Value,
        sink: &dyn FrameSink,
    ) -> bool {
        let probe = ctx.clone();
        let mut iter = match panic::catch_unwind(AssertUnwindSafe(|| func(ctx, args))) {
            Ok(Ok(iter)) => iter,
            Ok(Err(err)) => return sink.emit(&error_frame(id, &err)),
            Err(payload) => return sink.emit(&panic_frame(id, payload.as_ref())),
        };
        loop {
            // Checked both before pulling and before emitting so a
            // cancel that lands while the producer is mid-item still
            // suppresses that item.
            if probe.is_cancelled() {
                return sink.emit(&ResultFrame::Cancelled { id });
            }
            match panic::catch_unwind(AssertUnwindSafe(|| iter.next())) {
                Ok(Some(Ok(payload))) => {
                    if probe.is_cancelled() {
                        return sink.emit(&ResultFrame::Cancelled { id });
                    }
                    if !sink.emit(&ResultFrame::StreamValue { id, payload }) {
                        return false;
                    }
                }
                Ok(Some(Err(err))) => return sink.emit(&error_frame(id, &err)),
                Ok(None) => return sink.emit(&ResultFrame::StreamEnd { id }),
                Err(payload) => return sink.emit(&panic_frame(id, payload.as_ref())),
            }
        }
    }
}

/// Build the transported error for a failed work function, with the
/// error chain captured as detail text.
pub(crate) fn user_work_error(err: &registry::BoxError) -> WorkError {
    let mut work_error = WorkError::user(err.to_string());
    if let Some(chain) = error_chain(&**err) {
        work_error = work_error.with_detail(chain);
    }
    work_error
}

/// Build the transported error for a panicking work function.
pub(crate) fn panic_work_error(payload: &(dyn Any + Send)) -> WorkError {
    WorkError::user(format!("work function panicked: {}", panic_text(payload)))
}

fn error_frame(id: u64, err: &registry::BoxError) -> ResultFrame {
    let work_error = user_work_error(err);
    ResultFrame::Error {
        id,
        kind: work_error.kind,
        message: work_error.message,
        detail: work_error.detail,
    }
}

fn panic_frame(id: u64, payload: &(dyn Any + Send)) -> ResultFrame {
    let work_error = panic_work_error(payload);
    ResultFrame::Error {
        id,
        kind: work_error.kind,
        message: work_error.message,
        detail: work_error.detail,
    }
}

fn panic_text(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

/// Join the error chain below `err` into transported detail text.
fn error_chain(err: &(dyn std::error::Error + 'static)) -> Option<String> {
    let mut parts = Vec::new();
    let mut source = err.source();
    while let Some(cause) = source {
        parts.push(cause.to_string());
        source = cause.source();
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(": "))
    }
}

pub(crate) fn apply_log_level(level: &str) {
    match level.parse::<log::LevelFilter>() {
        Ok(filter) => {
            log::set_max_level(filter);
            log::debug!("log level set to {}", filter);
        }
        Err(_) => log::warn!("unrecognized log level '{}'", level),
    }
}

// -- Process-mode entrypoint --

/// Detect worker mode.
///
/// Call at the top of the host's `main()`, after registering work
/// functions and custom notifications. When the process was spawned as
/// a pool worker this runs the worker to completion and exits; it
/// never returns in a worker. In the host process it is a no-op.
pub fn init() {
    let Ok(raw) = std::env::var(WORKER_ENV) else {
        return;
    };
    let worker_id: usize = raw.parse().unwrap_or(0);
    let code = worker_main(worker_id);
    std::process::exit(code);
}

fn worker_main(worker_id: usize) -> i32 {
    // The unlocked handle stays usable after moving to the router
    // thread; nothing else in a worker reads stdin.
    let mut reader = io::BufReader::new(io::stdin());

    let seed = match read_frame::<WorkerCommand>(&mut reader) {
        Ok(Some(WorkerCommand::Init {
            worker_id: id,
            globals,
            init_funcs,
            log_level,
        })) => WorkerSeed {
            worker_id: id,
            globals,
            init_funcs,
            log_level,
        },
        other => {
            log::error!("worker {}: bad handshake: {:?}", worker_id, other);
            return 1;
        }
    };

    let runtime = Arc::new(Runtime::new(worker_id));
    let _ = WORKER_STATE.set(runtime.state().clone());

    let (command_tx, command_rx) = mpsc::channel();
    let router_runtime = Arc::clone(&runtime);
    let router = thread::Builder::new()
        .name(format!("forklift-router-{}", worker_id))
        .spawn(move || router_loop(&router_runtime, reader, command_tx));
    if let Err(err) = router {
        log::error!("worker {}: failed to start router thread: {}", worker_id, err);
        return 1;
    }

    let sink = StdoutSink {
        out: Mutex::new(io::stdout()),
    };
    runtime.serve(seed, &command_rx, &sink);
    // Process exit reaps the router thread; stdout closing tells the
    // pool we are gone.
    0
}

/// The notification listener of a worker process. Owns stdin after the
/// handshake: acts on `Notify` immediately, forwards the rest.
fn router_loop(
    runtime: &Runtime,
    mut reader: impl BufRead,
    commands: Sender<WorkerCommand>,
) {
    loop {
        match read_frame::<WorkerCommand>(&mut reader) {
            Ok(Some(WorkerCommand::Notify { name, payload })) => {
                runtime.handle_notification(&name, &payload);
            }
            Ok(Some(command)) => {
                if commands.send(command).is_err() {
                    break; // command loop is gone
                }
            }
            Ok(None) => break, // pool closed our stdin: shut down
            Err(err) => {
                log::warn!("unreadable command frame: {}", err);
                break;
            }
        }
    }
    // Dropping the sender wakes a blocked command loop.
}

struct StdoutSink {
    out: Mutex<io::Stdout>,
}

impl FrameSink for StdoutSink {
    fn emit(&self, frame: &ResultFrame) -> bool {
        let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
        match write_frame(&mut *out, frame) {
            Ok(()) => true,
            Err(err) => {
                log::error!("failed to emit result frame: {}", err);
                false
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/worker_tests.rs"]
mod tests;
