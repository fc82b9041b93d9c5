//! The pool controller: lifecycle, submission routing, cancellation,
//! and shutdown.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;

use forklift_core::{
    Notification, OffloadError, PoolOptions, SubmissionFrame, SubmissionId, WorkError,
    WorkerCommand, cancel_key, next_submission_id,
};

use crate::backend::process::ProcessBackend;
use crate::backend::{PoolEvent, WorkerBackend, WorkerHandle, WorkerSeed};
use crate::dispatch;
use crate::future::{FutureInner, LastValueHandler, ResultHandler, WorkFuture};
use crate::registry::{self, Resolved, WorkContext};
use crate::worker;

/// Pool lifecycle. Transitions are monotonic; a stopped pool is never
/// restarted within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Lifecycle {
    Uninitialized = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    Stopped = 4,
}

impl Lifecycle {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Lifecycle::Uninitialized,
            1 => Lifecycle::Starting,
            2 => Lifecycle::Running,
            3 => Lifecycle::Stopping,
            _ => Lifecycle::Stopped,
        }
    }
}

/// One submission awaiting its terminal frame. The handler and future
/// stay main-side; only the [`SubmissionFrame`] travels.
pub(crate) struct Pending {
    pub(crate) handler: Box<dyn ResultHandler>,
    pub(crate) future: Arc<FutureInner>,
    pub(crate) created: Instant,
}

pub(crate) struct WorkerSlot {
    pub(crate) id: usize,
    pub(crate) handle: Option<Box<dyn WorkerHandle>>,
    pub(crate) alive: bool,
    pub(crate) started: bool,
    pub(crate) loaded: bool,
    /// The submission this worker is executing, for crash fail-out.
    pub(crate) current: Option<SubmissionId>,
}

/// Scheduler state: the FIFO submission queue and the worker table.
/// Workers pull in queue order; whichever slot frees up next takes the
/// head of the queue.
#[derive(Default)]
pub(crate) struct Sched {
    pub(crate) queue: VecDeque<SubmissionFrame>,
    pub(crate) workers: Vec<WorkerSlot>,
}

pub(crate) struct PoolInner {
    pub(crate) options: PoolOptions,
    pub(crate) backend: Box<dyn WorkerBackend>,
    lifecycle: AtomicU8,
    lifecycle_mu: Mutex<()>,
    lifecycle_cond: Condvar,
    offload_enabled: AtomicBool,
    fail_open: AtomicBool,
    /// Authoritative shared-state map; workers hold mirrors.
    pub(crate) state: forklift_core::StateMap,
    init_funcs: Mutex<Vec<(String, Value)>>,
    pending: Mutex<HashMap<SubmissionId, Pending>>,
    sched: Mutex<Sched>,
    pub(crate) sched_cond: Condvar,
    events_tx: Mutex<Option<Sender<PoolEvent>>>,
    dispatcher: Mutex<Option<thread::JoinHandle<()>>>,
}

enum Route {
    Dispatch,
    Local,
}

/// A pool of worker processes for offloading CPU-bound work.
///
/// Cloning yields another handle to the same pool. The pool does not
/// stop itself on drop; call [`Pool::stop`] before the host exits so
/// worker processes are reaped.
#[derive(Clone)]
pub struct Pool {
    pub(crate) inner: Arc<PoolInner>,
}

impl Pool {
    /// A pool using the child-process backend.
    pub fn new(options: PoolOptions) -> Self {
        Self::with_backend(options, Box::new(ProcessBackend))
    }

    /// A pool with an injected worker backend (tests use
    /// [`crate::backend::inproc::InprocBackend`]).
    pub fn with_backend(options: PoolOptions, backend: Box<dyn WorkerBackend>) -> Self {
        let inner = Arc::new(PoolInner {
            offload_enabled: AtomicBool::new(options.offload_enabled),
            fail_open: AtomicBool::new(options.fail_open),
            options,
            backend,
            lifecycle: AtomicU8::new(Lifecycle::Uninitialized as u8),
            lifecycle_mu: Mutex::new(()),
            lifecycle_cond: Condvar::new(),
            state: forklift_core::StateMap::new(),
            init_funcs: Mutex::new(Vec::new()),
            pending: Mutex::new(HashMap::new()),
            sched: Mutex::new(Sched::default()),
            sched_cond: Condvar::new(),
            events_tx: Mutex::new(None),
            dispatcher: Mutex::new(None),
        });
        Self { inner }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.inner.lifecycle()
    }

    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    /// Register a work function (by registry key) to run exactly once
    /// in each worker after spawn, before it accepts submissions, in
    /// registration order.
    pub fn add_init_func(&self, key: &str, args: impl Serialize) -> Result<(), OffloadError> {
        if registry::registered_kind(key).is_none() {
            return Err(WorkError::unknown_callable(key).into());
        }
        let args = serialize_args(key, args)?;
        if self.inner.lifecycle() != Lifecycle::Uninitialized {
            return Err(OffloadError::InvalidState(
                "init funcs must be registered before start_workers",
            ));
        }
        self.inner.init_funcs_guard().push((key.to_string(), args));
        Ok(())
    }

    /// Seed `current_state` and other named values workers inherit.
    pub fn prepare_globals(&self, globals: HashMap<String, Value>) -> Result<(), OffloadError> {
        if self.inner.lifecycle() != Lifecycle::Uninitialized {
            return Err(OffloadError::InvalidState(
                "globals must be prepared before start_workers",
            ));
        }
        self.inner.state.seed(globals);
        Ok(())
    }

    /// Spawn workers and block until every one has signaled
    /// start-complete. `count` is clamped to `max(1, cpus - 1)`.
    /// Idempotent while `Running`.
    pub fn start_workers(&self, count: Option<usize>) -> Result<(), OffloadError> {
        let inner = &self.inner;
        loop {
            match inner.lifecycle() {
                Lifecycle::Running => return Ok(()),
                Lifecycle::Stopping | Lifecycle::Stopped => {
                    return Err(OffloadError::InvalidState("pool has been stopped"));
                }
                Lifecycle::Uninitialized => {
                    if inner.advance(Lifecycle::Uninitialized, Lifecycle::Starting) {
                        break;
                    }
                }
                Lifecycle::Starting => {
                    // Another thread is starting; follow its outcome.
                    inner.wait_while_starting();
                }
            }
        }

        let cpus = thread::available_parallelism().map(|n| n.get()).unwrap_or(2);
        let n = inner.options.effective_worker_count(count, cpus);
        log::info!("starting {} workers", n);

        let (events_tx, events_rx) = mpsc::channel();
        *inner.events_tx_guard() = Some(events_tx.clone());

        let dispatch_inner = Arc::clone(inner);
        let dispatcher = thread::Builder::new()
            .name("forklift-dispatch".to_string())
            .spawn(move || dispatch::run(&dispatch_inner, &events_rx))
            .map_err(|err| OffloadError::Spawn(err.to_string()))?;
        *inner.dispatcher_guard() = Some(dispatcher);

        {
            let mut sched = inner.sched_guard();
            for worker_id in 0..n {
                let seed = inner.worker_seed(worker_id);
                match inner.backend.launch(seed, events_tx.clone()) {
                    Ok(handle) => sched.workers.push(WorkerSlot {
                        id: worker_id,
                        handle: Some(handle),
                        alive: true,
                        started: false,
                        loaded: false,
                        current: None,
                    }),
                    Err(err) => {
                        log::error!("failed to spawn worker {}: {}", worker_id, err);
                        drop(sched);
                        self.stop(Some(Duration::from_secs(1)));
                        return Err(OffloadError::Spawn(err.to_string()));
                    }
                }
            }
        }

        // Start-complete from every worker (or its death trying).
        {
            let mut sched = inner.sched_guard();
            while !sched.workers.iter().all(|w| w.started || !w.alive) {
                sched = inner
                    .sched_cond
                    .wait(sched)
                    .unwrap_or_else(|e| e.into_inner());
            }
            let dead = sched.workers.iter().filter(|w| !w.alive).count();
            if dead > 0 {
                drop(sched);
                self.stop(Some(Duration::from_secs(1)));
                return Err(OffloadError::Spawn(format!(
                    "{} workers died during startup",
                    dead
                )));
            }
        }

        inner.set_lifecycle(Lifecycle::Running);
        log::info!("pool running with {} workers", n);
        Ok(())
    }

    /// Submit a unit of work and receive its future. Uses the default
    /// last-value handler.
    pub fn submit(&self, key: &str, args: impl Serialize) -> Result<WorkFuture, OffloadError> {
        self.submit_with_handler(key, args, Box::new(LastValueHandler::default()))
    }

    /// Submit with a custom result handler. Whether the submission
    /// streams is determined by how `key` was registered.
    pub fn submit_with_handler(
        &self,
        key: &str,
        args: impl Serialize,
        handler: Box<dyn ResultHandler>,
    ) -> Result<WorkFuture, OffloadError> {
        let streaming = registry::registered_kind(key)
            .ok_or_else(|| WorkError::unknown_callable(key))?;
        let args = serialize_args(key, args)?;
        let id = next_submission_id();
        let future = FutureInner::new();
        let handle = WorkFuture::new(id, Arc::clone(&future), Arc::downgrade(&self.inner));

        match self.route()? {
            Route::Local => self.inner.run_local(id, key, args, handler, &future),
            Route::Dispatch => {
                self.inner.pending_guard().insert(
                    id,
                    Pending {
                        handler,
                        future,
                        created: Instant::now(),
                    },
                );
                self.inner.enqueue(SubmissionFrame {
                    id,
                    key: key.to_string(),
                    args,
                    streaming,
                });
            }
        }
        Ok(handle)
    }

    /// Submit to a key registered with
    /// [`crate::registry::register_producer`], delivering each produced
    /// value through `handler` as it arrives.
    pub fn submit_streaming(
        &self,
        key: &str,
        args: impl Serialize,
        handler: Box<dyn ResultHandler>,
    ) -> Result<WorkFuture, OffloadError> {
        match registry::registered_kind(key) {
            Some(true) => self.submit_with_handler(key, args, handler),
            Some(false) => Err(WorkError::new(
                forklift_core::WorkErrorKind::UnknownCallable,
                format!("'{}' is registered as single-shot, not a producer", key),
            )
            .into()),
            None => Err(WorkError::unknown_callable(key).into()),
        }
    }

    /// Stop the pool: shutdown sentinel to every worker, wait up to
    /// `timeout` (default from options) for clean exits, force-kill
    /// stragglers, complete every outstanding future as `Cancelled`.
    /// Best-effort and idempotent; never fails.
    pub fn stop(&self, timeout: Option<Duration>) {
        let inner = &self.inner;
        {
            let _guard = inner.lifecycle_guard();
            match inner.lifecycle() {
                Lifecycle::Stopping | Lifecycle::Stopped => return,
                Lifecycle::Uninitialized => {
                    inner.store_lifecycle(Lifecycle::Stopped);
                    return;
                }
                Lifecycle::Starting | Lifecycle::Running => {
                    inner.store_lifecycle(Lifecycle::Stopping);
                }
            }
        }
        let timeout = timeout.unwrap_or_else(|| inner.options.stop_timeout());
        log::info!("stopping pool (timeout {:?})", timeout);

        // Sentinel on every worker's channel, then take the handles so
        // nothing dispatches behind our back.
        let handles: Vec<(usize, Box<dyn WorkerHandle>)> = {
            let mut sched = inner.sched_guard();
            for slot in &mut sched.workers {
                if !slot.alive {
                    continue;
                }
                if let Some(handle) = slot.handle.as_mut() {
                    if let Err(err) = handle.send(&WorkerCommand::Shutdown) {
                        log::debug!("worker {}: shutdown send failed: {}", slot.id, err);
                    }
                }
            }
            sched
                .workers
                .iter_mut()
                .filter_map(|slot| {
                    slot.alive = false;
                    slot.loaded = false;
                    slot.handle.take().map(|h| (slot.id, h))
                })
                .collect()
        };
        // Wake submitters blocked on a full queue.
        inner.sched_cond.notify_all();

        let deadline = Instant::now() + timeout;
        for (worker_id, mut handle) in handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !handle.wait_timeout(remaining) {
                log::warn!("worker {} did not exit in time, killing", worker_id);
                handle.kill();
                if !handle.wait_timeout(Duration::from_secs(1)) {
                    log::warn!("worker {} could not be reaped", worker_id);
                }
            }
        }

        // Stop the dispatcher, then cancel whatever never completed.
        if let Some(tx) = inner.events_tx_guard().take() {
            let _ = tx.send(PoolEvent::Shutdown);
        }
        if let Some(join) = inner.dispatcher_guard().take() {
            let _ = join.join();
        }
        let drained: Vec<(SubmissionId, Pending)> =
            inner.pending_guard().drain().collect();
        for (id, mut entry) in drained {
            entry.handler.on_cancel();
            entry.future.complete(Err(OffloadError::Cancelled));
            inner.state.remove(&cancel_key(id));
        }
        inner.sched_guard().queue.clear();

        inner.set_lifecycle(Lifecycle::Stopped);
        log::info!("pool stopped");
    }

    /// Allow dispatch to workers for subsequent submissions.
    pub fn enable_offload(&self) {
        self.inner.offload_enabled.store(true, Ordering::SeqCst);
    }

    /// Route subsequent submissions away from workers (fail-open then
    /// executes locally).
    pub fn disable_offload(&self) {
        self.inner.offload_enabled.store(false, Ordering::SeqCst);
    }

    /// Make subsequent non-dispatchable submissions fail instead of
    /// running locally.
    pub fn disable_fail_open(&self) {
        self.inner.fail_open.store(false, Ordering::SeqCst);
    }

    /// Number of live worker processes.
    pub fn current_process_count(&self) -> usize {
        self.inner
            .sched_guard()
            .workers
            .iter()
            .filter(|w| w.alive)
            .count()
    }

    /// Whether `start_workers` has completed in this process.
    pub fn processes_started(&self) -> bool {
        self.inner.lifecycle() >= Lifecycle::Running
    }

    /// Block until `start_workers` completes. Returns whether it did
    /// within `timeout`.
    pub fn wait_for_process_start(&self, timeout: Duration) -> bool {
        let inner = &self.inner;
        let deadline = Instant::now() + timeout;
        let mut guard = inner.lifecycle_guard();
        loop {
            if inner.lifecycle() >= Lifecycle::Running {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (g, _) = inner
                .lifecycle_cond
                .wait_timeout(guard, remaining)
                .unwrap_or_else(|e| e.into_inner());
            guard = g;
        }
    }

    /// Block until every live worker has finished its init funcs.
    /// Returns whether the pool reached that point within `timeout`.
    pub fn wait_for_complete_load(&self, timeout: Duration) -> bool {
        let inner = &self.inner;
        let deadline = Instant::now() + timeout;
        let mut sched = inner.sched_guard();
        loop {
            let any_alive = sched.workers.iter().any(|w| w.alive);
            let all_loaded = sched.workers.iter().all(|w| w.loaded || !w.alive);
            if any_alive && all_loaded && inner.lifecycle() >= Lifecycle::Running {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (g, _) = inner
                .sched_cond
                .wait_timeout(sched, remaining)
                .unwrap_or_else(|e| e.into_inner());
            sched = g;
        }
    }

    /// Publish a notification to every live worker. Delivery to one
    /// worker preserves enqueue order; fan-out across workers is not
    /// globally ordered.
    pub fn enqueue_notification(&self, name: &str, payload: Value) {
        self.inner.broadcast(&Notification::new(name, payload));
    }

    /// Set the logger level here and in every worker.
    pub fn update_log_level(&self, level: &str) {
        worker::apply_log_level(level);
        self.inner.broadcast(&Notification::update_log_level(level));
    }

    /// Update one shared-state key in the authoritative map and fan the
    /// change out to worker mirrors. A `null` value removes the key.
    pub fn update_state_value(&self, key: &str, value: Value) {
        self.inner.state.set(key, value.clone());
        self.inner
            .broadcast(&Notification::update_state_value(key, value));
    }

    /// Read one shared-state value from the authoritative map.
    pub fn state_value(&self, key: &str) -> Option<Value> {
        self.inner.state.get(key)
    }

    fn route(&self) -> Result<Route, OffloadError> {
        let inner = &self.inner;
        loop {
            let lifecycle = inner.lifecycle();
            let offload = inner.offload_enabled.load(Ordering::SeqCst);
            match lifecycle {
                Lifecycle::Running if offload => return Ok(Route::Dispatch),
                Lifecycle::Starting if offload => {
                    // Submissions racing start_workers block until the
                    // pool is Running (or the start fails).
                    inner.wait_while_starting();
                }
                _ => {
                    if inner.fail_open.load(Ordering::SeqCst) {
                        return Ok(Route::Local);
                    }
                    // Explicitly disabled offload is a policy rejection
                    // in any state; submitting before start with
                    // offload still intended is caller misuse.
                    if !offload {
                        return Err(OffloadError::OffloadDisabled);
                    }
                    if lifecycle == Lifecycle::Uninitialized {
                        return Err(OffloadError::InvalidState("pool not started"));
                    }
                    return Err(OffloadError::OffloadDisabled);
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn kill_worker(&self, worker_id: usize) {
        let mut sched = self.inner.sched_guard();
        if let Some(slot) = sched.workers.get_mut(worker_id) {
            if let Some(handle) = slot.handle.as_mut() {
                handle.kill();
            }
        }
    }
}

impl PoolInner {
    pub(crate) fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::SeqCst))
    }

    fn lifecycle_guard(&self) -> MutexGuard<'_, ()> {
        self.lifecycle_mu.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store a new lifecycle state and wake waiters. Callers must not
    /// regress the state machine.
    fn store_lifecycle(&self, next: Lifecycle) {
        self.lifecycle.store(next as u8, Ordering::SeqCst);
        self.lifecycle_cond.notify_all();
    }

    fn set_lifecycle(&self, next: Lifecycle) {
        let _guard = self.lifecycle_guard();
        self.store_lifecycle(next);
    }

    fn advance(&self, from: Lifecycle, to: Lifecycle) -> bool {
        let _guard = self.lifecycle_guard();
        if self.lifecycle() == from {
            self.store_lifecycle(to);
            true
        } else {
            false
        }
    }

    /// Park until the lifecycle moves past `Starting`.
    fn wait_while_starting(&self) {
        let guard = self.lifecycle_guard();
        if self.lifecycle() == Lifecycle::Starting {
            let _guard = self
                .lifecycle_cond
                .wait(guard)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    pub(crate) fn sched_guard(&self) -> MutexGuard<'_, Sched> {
        self.sched.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn pending_guard(&self) -> MutexGuard<'_, HashMap<SubmissionId, Pending>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn init_funcs_guard(&self) -> MutexGuard<'_, Vec<(String, Value)>> {
        self.init_funcs.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn events_tx_guard(&self) -> MutexGuard<'_, Option<Sender<PoolEvent>>> {
        self.events_tx.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn dispatcher_guard(&self) -> MutexGuard<'_, Option<thread::JoinHandle<()>>> {
        self.dispatcher.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn worker_seed(&self, worker_id: usize) -> WorkerSeed {
        WorkerSeed {
            worker_id,
            globals: self.state.snapshot(),
            init_funcs: self.init_funcs_guard().clone(),
            log_level: self.options.worker_log_level.clone(),
        }
    }

    /// Queue a submission, respecting the optional queue bound, and
    /// hand it to an idle worker if one is free.
    fn enqueue(&self, frame: SubmissionFrame) {
        let mut sched = self.sched_guard();
        if let Some(capacity) = self.options.queue_capacity {
            while sched.queue.len() >= capacity && self.lifecycle() == Lifecycle::Running {
                sched = self
                    .sched_cond
                    .wait(sched)
                    .unwrap_or_else(|e| e.into_inner());
            }
        }
        sched.queue.push_back(frame);
        self.try_dispatch(&mut sched);
    }

    /// Feed queued submissions to idle, loaded workers in FIFO order.
    pub(crate) fn try_dispatch(&self, sched: &mut Sched) {
        loop {
            if sched.queue.is_empty() {
                return;
            }
            let Some(slot_index) = sched
                .workers
                .iter()
                .position(|w| w.alive && w.loaded && w.current.is_none() && w.handle.is_some())
            else {
                return;
            };
            let Some(frame) = sched.queue.pop_front() else {
                return;
            };
            let id = frame.id;
            let slot = &mut sched.workers[slot_index];
            let sent = match slot.handle.as_mut() {
                Some(handle) => handle.send(&WorkerCommand::Run(frame.clone())),
                None => Err(io::Error::other("worker handle missing")),
            };
            match sent {
                Ok(()) => {
                    slot.current = Some(id);
                    log::debug!("submission {} dispatched to worker {}", id, slot.id);
                    if let Some(entry) = self.pending_guard().get(&id) {
                        entry.future.set_running();
                    }
                    self.sched_cond.notify_all();
                }
                Err(err) => {
                    // The reader thread will report the death; the
                    // submission goes back to the head of the queue.
                    log::warn!("worker {}: dispatch failed: {}", slot.id, err);
                    slot.alive = false;
                    sched.queue.push_front(frame);
                }
            }
        }
    }

    /// Cancel a submission.
    ///
    /// Before pickup: removed from the queue and completed `Cancelled`
    /// without any worker seeing it. In flight: the cancel flag is
    /// raised (false→true only) and fanned out for cooperative
    /// observation.
    pub(crate) fn cancel(&self, id: SubmissionId) {
        let removed = {
            let mut sched = self.sched_guard();
            match sched.queue.iter().position(|f| f.id == id) {
                Some(index) => {
                    sched.queue.remove(index);
                    self.sched_cond.notify_all();
                    true
                }
                None => false,
            }
        };
        if removed {
            if let Some(mut entry) = self.pending_guard().remove(&id) {
                entry.handler.on_cancel();
                entry.future.complete(Err(OffloadError::Cancelled));
            }
            self.state.remove(&cancel_key(id));
            log::debug!("submission {} cancelled before pickup", id);
            return;
        }
        if !self.pending_guard().contains_key(&id) {
            return; // already terminal; the flag was purged with it
        }
        self.state.set(&cancel_key(id), Value::Bool(true));
        self.broadcast(&Notification::cancel(id));
    }

    /// Send a notification to every live worker.
    pub(crate) fn broadcast(&self, notification: &Notification) {
        let command = WorkerCommand::Notify {
            name: notification.name.clone(),
            payload: notification.payload.clone(),
        };
        let mut sched = self.sched_guard();
        for slot in &mut sched.workers {
            if !slot.alive {
                continue;
            }
            if let Some(handle) = slot.handle.as_mut() {
                if let Err(err) = handle.send(&command) {
                    log::warn!("worker {}: notification send failed: {}", slot.id, err);
                    slot.alive = false;
                }
            }
        }
    }

    /// Fail-open execution: run the work synchronously on the calling
    /// thread and complete the future before `submit` returns.
    fn run_local(
        &self,
        id: SubmissionId,
        key: &str,
        args: Value,
        mut handler: Box<dyn ResultHandler>,
        future: &Arc<FutureInner>,
    ) {
        log::debug!("executing submission {} locally (fail-open)", id);
        future.set_running();
        let ctx = WorkContext::new(id, self.state.clone());
        let outcome = match registry::resolve(key) {
            Some(Resolved::Single(func)) => local_single(&*func, ctx, args, handler.as_mut()),
            Some(Resolved::Producer(func)) => local_stream(&*func, ctx, args, handler.as_mut()),
            None => Err(WorkError::unknown_callable(key).into()),
        };
        if matches!(outcome, Err(OffloadError::Cancelled)) {
            handler.on_cancel();
        }
        self.state.remove(&cancel_key(id));
        future.complete(outcome);
    }
}

fn serialize_args(key: &str, args: impl Serialize) -> Result<Value, OffloadError> {
    serde_json::to_value(args).map_err(|err| {
        WorkError::serialization(format!("arguments for '{}' are not serializable", key))
            .with_detail(err.to_string())
            .into()
    })
}

fn local_single(
    func: &(dyn Fn(WorkContext, Value) -> Result<Value, registry::BoxError> + Send + Sync),
    ctx: WorkContext,
    args: Value,
    handler: &mut dyn ResultHandler,
) -> Result<Value, OffloadError> {
    let probe = ctx.clone();
    match panic::catch_unwind(AssertUnwindSafe(|| func(ctx, args))) {
        Ok(Ok(value)) => {
            if probe.is_cancelled() {
                return Err(OffloadError::Cancelled);
            }
            handler.handle_result(value);
            Ok(handler.finalize_result())
        }
        Ok(Err(err)) => Err(worker::user_work_error(&err).into()),
        Err(payload) => Err(worker::panic_work_error(payload.as_ref()).into()),
    }
}

fn local_stream(
    func: &(dyn Fn(WorkContext, Value) -> Result<registry::WorkStream, registry::BoxError>
          + Send
          + Sync),
    ctx: WorkContext,
    args: Value,
    handler: &mut dyn ResultHandler,
) -> Result<Value, OffloadError> {
    let probe = ctx.clone();
    let mut iter = match panic::catch_unwind(AssertUnwindSafe(|| func(ctx, args))) {
        Ok(Ok(iter)) => iter,
        Ok(Err(err)) => return Err(worker::user_work_error(&err).into()),
        Err(payload) => return Err(worker::panic_work_error(payload.as_ref()).into()),
    };
    loop {
        if probe.is_cancelled() {
            return Err(OffloadError::Cancelled);
        }
        match panic::catch_unwind(AssertUnwindSafe(|| iter.next())) {
            Ok(Some(Ok(value))) => handler.handle_result(value),
            Ok(Some(Err(err))) => return Err(worker::user_work_error(&err).into()),
            Ok(None) => return Ok(handler.finalize_result()),
            Err(payload) => return Err(worker::panic_work_error(payload.as_ref()).into()),
        }
    }
}

#[cfg(test)]
#[path = "tests/pool_tests.rs"]
mod tests;
