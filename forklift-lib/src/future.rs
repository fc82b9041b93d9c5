//! Per-submission futures and result handlers.

use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use serde_json::Value;

use forklift_core::{OffloadError, SubmissionId};

use crate::pool::PoolInner;

/// Lifecycle of a submission's future.
///
/// Streaming submissions stay `Running` across partial deliveries;
/// only the terminal frame moves them to a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutureState {
    /// Queued, not yet picked up by a worker.
    Pending,
    /// Dispatched (or executing locally under fail-open).
    Running,
    /// Completed with a value.
    Done,
    /// Completed with a transported error.
    Failed,
    /// Cancelled before producing a value.
    Cancelled,
}

impl FutureState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FutureState::Done | FutureState::Failed | FutureState::Cancelled
        )
    }
}

struct Completion {
    phase: FutureState,
    outcome: Option<Result<Value, OffloadError>>,
}

/// Shared completion cell behind every [`WorkFuture`] clone.
pub(crate) struct FutureInner {
    completion: Mutex<Completion>,
    cond: Condvar,
}

impl FutureInner {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            completion: Mutex::new(Completion {
                phase: FutureState::Pending,
                outcome: None,
            }),
            cond: Condvar::new(),
        })
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, Completion> {
        self.completion.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn phase(&self) -> FutureState {
        self.locked().phase
    }

    /// Pending → Running; a no-op in any other phase.
    pub(crate) fn set_running(&self) {
        let mut c = self.locked();
        if c.phase == FutureState::Pending {
            c.phase = FutureState::Running;
        }
    }

    /// Complete the future. The first completion wins; later calls are
    /// dropped so a terminal frame racing a stop() drain cannot flip a
    /// settled result.
    pub(crate) fn complete(&self, outcome: Result<Value, OffloadError>) {
        let mut c = self.locked();
        if c.phase.is_terminal() {
            log::debug!("dropping completion for already-settled future");
            return;
        }
        c.phase = match &outcome {
            Ok(_) => FutureState::Done,
            Err(OffloadError::Cancelled) => FutureState::Cancelled,
            Err(_) => FutureState::Failed,
        };
        c.outcome = Some(outcome);
        self.cond.notify_all();
    }
}

/// Handle to one submission's eventual result. Clones share the same
/// underlying completion.
#[derive(Clone)]
pub struct WorkFuture {
    id: SubmissionId,
    inner: Arc<FutureInner>,
    pool: Weak<PoolInner>,
}

impl WorkFuture {
    pub(crate) fn new(id: SubmissionId, inner: Arc<FutureInner>, pool: Weak<PoolInner>) -> Self {
        Self { id, inner, pool }
    }

    pub fn id(&self) -> SubmissionId {
        self.id
    }

    pub fn state(&self) -> FutureState {
        self.inner.phase()
    }

    /// Block until the future reaches a terminal state.
    pub fn wait(&self) {
        let mut c = self.inner.locked();
        while !c.phase.is_terminal() {
            c = self.inner.cond.wait(c).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Block up to `timeout`. Returns whether the future is terminal.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut c = self.inner.locked();
        let deadline = std::time::Instant::now() + timeout;
        while !c.phase.is_terminal() {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (guard, _) = self
                .inner
                .cond
                .wait_timeout(c, remaining)
                .unwrap_or_else(|e| e.into_inner());
            c = guard;
        }
        true
    }

    /// Block until completion and return the outcome.
    pub fn result(&self) -> Result<Value, OffloadError> {
        self.wait();
        self.outcome_clone()
    }

    /// The outcome if the future is already terminal.
    pub fn try_result(&self) -> Option<Result<Value, OffloadError>> {
        let c = self.inner.locked();
        if c.phase.is_terminal() {
            c.outcome.clone()
        } else {
            None
        }
    }

    /// Request cooperative cancellation.
    ///
    /// Sets the shared cancel flag for this submission and notifies
    /// every worker. If the submission has not been picked up yet it is
    /// removed from the queue and this future completes `Cancelled`
    /// synchronously, without any worker ever seeing it.
    pub fn cancel(&self) {
        match self.pool.upgrade() {
            Some(pool) => pool.cancel(self.id),
            // Pool is gone; nothing can complete this future anymore.
            None => self.inner.complete(Err(OffloadError::Cancelled)),
        }
    }

    fn outcome_clone(&self) -> Result<Value, OffloadError> {
        self.inner
            .locked()
            .outcome
            .clone()
            .unwrap_or(Err(OffloadError::Cancelled))
    }
}

impl std::fmt::Debug for WorkFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkFuture")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Per-submission result post-processing.
///
/// `handle_result` receives every delivered value: the single value of
/// a one-shot submission, or each produced item of a streaming one.
/// `finalize_result` runs once after the last value and produces what
/// the future completes with. Both run on the result dispatcher thread
/// (or the submitting thread under fail-open), so keep them short.
pub trait ResultHandler: Send {
    fn handle_result(&mut self, value: Value);

    fn finalize_result(&mut self) -> Value;

    /// Called when the submission ends in cancellation.
    fn on_cancel(&mut self) {}
}

/// Default handler: keeps the last delivered value and returns it.
#[derive(Debug, Default)]
pub struct LastValueHandler {
    last: Option<Value>,
}

impl ResultHandler for LastValueHandler {
    fn handle_result(&mut self, value: Value) {
        self.last = Some(value);
    }

    fn finalize_result(&mut self) -> Value {
        self.last.take().unwrap_or(Value::Null)
    }
}

/// Streaming handler that accumulates every delivered value into an
/// array.
#[derive(Debug, Default)]
pub struct CollectHandler {
    items: Vec<Value>,
}

impl ResultHandler for CollectHandler {
    fn handle_result(&mut self, value: Value) {
        self.items.push(value);
    }

    fn finalize_result(&mut self) -> Value {
        Value::Array(std::mem::take(&mut self.items))
    }
}
