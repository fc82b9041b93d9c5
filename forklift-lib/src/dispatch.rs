//! The result dispatcher: a single main-process thread draining the
//! pool event channel, matching frames to pending futures by
//! submission id, and driving result handlers.
//!
//! Handler code is user code: every invocation is wrapped in
//! `catch_unwind` so a bad handler fails its own future instead of
//! taking the dispatcher down.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::Receiver;

use serde_json::Value;

use forklift_core::{
    Notification, OffloadError, ResultFrame, SubmissionId, WorkError, WorkErrorKind, cancel_key,
};

use crate::backend::{PoolEvent, WorkerSeed};
use crate::pool::{Lifecycle, Pending, PoolInner};

pub(crate) fn run(inner: &PoolInner, events: &Receiver<PoolEvent>) {
    log::debug!("result dispatcher running");
    loop {
        let event = match events.recv() {
            Ok(event) => event,
            Err(_) => break, // every sender gone
        };
        match event {
            PoolEvent::Shutdown => break,
            PoolEvent::Frame(worker_id, frame) => handle_frame(inner, worker_id, frame),
            PoolEvent::Exited(worker_id) => handle_exit(inner, worker_id),
        }
    }
    log::debug!("result dispatcher exiting");
}

fn handle_frame(inner: &PoolInner, worker_id: usize, frame: ResultFrame) {
    match frame {
        ResultFrame::Started => {
            let mut sched = inner.sched_guard();
            if let Some(slot) = sched.workers.get_mut(worker_id) {
                slot.started = true;
            }
            inner.sched_cond.notify_all();
        }
        ResultFrame::Loaded => {
            let mut sched = inner.sched_guard();
            if let Some(slot) = sched.workers.get_mut(worker_id) {
                slot.loaded = true;
                log::debug!("worker {} loaded", worker_id);
            }
            // A freshly loaded worker can take queued work right away.
            inner.try_dispatch(&mut sched);
            inner.sched_cond.notify_all();
        }
        ResultFrame::StreamValue { id, payload } => deliver_stream_value(inner, id, payload),
        ResultFrame::Value { id, payload } => {
            complete(inner, id, |entry| {
                entry.handler.handle_result(payload);
                Ok(entry.handler.finalize_result())
            });
            free_worker(inner, worker_id, id);
        }
        ResultFrame::StreamEnd { id } => {
            complete(inner, id, |entry| Ok(entry.handler.finalize_result()));
            free_worker(inner, worker_id, id);
        }
        ResultFrame::Error {
            id,
            kind,
            message,
            detail,
        } => {
            complete(inner, id, move |_| {
                Err(WorkError {
                    kind,
                    message,
                    detail,
                }
                .into())
            });
            free_worker(inner, worker_id, id);
        }
        ResultFrame::Cancelled { id } => {
            complete(inner, id, |entry| {
                entry.handler.on_cancel();
                Err(OffloadError::Cancelled)
            });
            free_worker(inner, worker_id, id);
        }
    }
}

/// Partial delivery: the future stays `Running`; only the handler sees
/// the value.
fn deliver_stream_value(inner: &PoolInner, id: SubmissionId, payload: Value) {
    let mut pending = inner.pending_guard();
    let Some(entry) = pending.get_mut(&id) else {
        log::debug!("dropping stream value for unknown submission {}", id);
        return;
    };
    let delivery =
        panic::catch_unwind(AssertUnwindSafe(|| entry.handler.handle_result(payload)));
    if delivery.is_err() {
        log::error!("result handler panicked for submission {}", id);
        if let Some(entry) = pending.remove(&id) {
            entry.future.complete(Err(WorkError::new(
                WorkErrorKind::User,
                "result handler panicked",
            )
            .into()));
        }
        drop(pending);
        purge_cancel_flag(inner, id);
    }
}

/// Terminal delivery: remove the pending entry, run `outcome` (handler
/// finalization) outside any lock, settle the future, purge the cancel
/// flag.
fn complete<F>(inner: &PoolInner, id: SubmissionId, outcome: F)
where
    F: FnOnce(&mut Pending) -> Result<Value, OffloadError>,
{
    let Some(mut entry) = inner.pending_guard().remove(&id) else {
        log::debug!("dropping frame for unknown submission {}", id);
        return;
    };
    let result = match panic::catch_unwind(AssertUnwindSafe(|| outcome(&mut entry))) {
        Ok(result) => result,
        Err(_) => {
            log::error!("result handler panicked for submission {}", id);
            Err(WorkError::new(WorkErrorKind::User, "result handler panicked").into())
        }
    };
    log::debug!(
        "submission {} finished in {:?}",
        id,
        entry.created.elapsed()
    );
    entry.future.complete(result);
    purge_cancel_flag(inner, id);
}

/// After a terminal frame the cancel flag (if any) is dead; drop it
/// from the authoritative map and tell worker mirrors to do the same.
fn purge_cancel_flag(inner: &PoolInner, id: SubmissionId) {
    let key = cancel_key(id);
    if inner.state.remove(&key) {
        inner.broadcast(&Notification::update_state_value(&key, Value::Null));
    }
}

/// A terminal frame frees the worker slot that held the submission, and
/// the next queued submission (if any) goes out immediately.
fn free_worker(inner: &PoolInner, worker_id: usize, id: SubmissionId) {
    let mut sched = inner.sched_guard();
    if let Some(slot) = sched.workers.get_mut(worker_id) {
        if slot.current == Some(id) {
            slot.current = None;
        }
    }
    inner.try_dispatch(&mut sched);
    inner.sched_cond.notify_all();
}

/// A worker's result channel closed. During shutdown that is expected;
/// while running it is a crash: the held submission fails with a
/// worker-crash error and the slot is respawned so the pool keeps its
/// capacity.
fn handle_exit(inner: &PoolInner, worker_id: usize) {
    let held = {
        let mut sched = inner.sched_guard();
        let Some(slot) = sched.workers.get_mut(worker_id) else {
            return;
        };
        slot.alive = false;
        slot.loaded = false;
        slot.handle = None;
        slot.current.take()
    };

    if inner.lifecycle() >= Lifecycle::Stopping {
        log::debug!("worker {} exited during shutdown", worker_id);
        return;
    }

    match held {
        Some(id) => {
            log::warn!("worker {} died while holding submission {}", worker_id, id);
            complete(inner, id, |_| Err(WorkError::worker_crash(worker_id).into()));
        }
        None => log::warn!("worker {} exited unexpectedly", worker_id),
    }

    respawn(inner, worker_id);
}

fn respawn(inner: &PoolInner, worker_id: usize) {
    let Some(events) = inner.events_tx_guard().clone() else {
        return;
    };
    let seed: WorkerSeed = inner.worker_seed(worker_id);
    match inner.backend.launch(seed, events) {
        Ok(handle) => {
            let mut sched = inner.sched_guard();
            if let Some(slot) = sched.workers.get_mut(worker_id) {
                slot.handle = Some(handle);
                slot.alive = true;
                slot.started = false;
                slot.loaded = false;
                slot.current = None;
            }
            log::info!("worker {} respawned", worker_id);
        }
        Err(err) => log::error!("failed to respawn worker {}: {}", worker_id, err),
    }
}
