//! Work-function and notification registries.
//!
//! Worker processes are the host binary re-executed, so callables
//! cross the process boundary by string key: the host registers every
//! work function before [`crate::init`], both the pool process and
//! each worker rebuild the same table from the same code, and
//! submissions carry only the key. `submit` validates keys eagerly so
//! an unknown callable fails in the caller, not in a worker.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use serde_json::Value;

use forklift_core::{StateMap, SubmissionId, cancel_key};

/// Error type user work functions return.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The lazy sequence a producer returns: finite, non-restartable,
/// iterated exactly once by the worker.
pub type WorkStream = Box<dyn Iterator<Item = Result<Value, BoxError>> + Send>;

type WorkFn = Arc<dyn Fn(WorkContext, Value) -> Result<Value, BoxError> + Send + Sync>;
type ProducerFn = Arc<dyn Fn(WorkContext, Value) -> Result<WorkStream, BoxError> + Send + Sync>;
type NotificationFn = Arc<dyn Fn(&Value) + Send + Sync>;

/// Invocation context handed to every work function.
///
/// Cheap to clone; producers move a clone into their iterator so
/// per-item cancel checks stay possible.
#[derive(Clone)]
pub struct WorkContext {
    id: SubmissionId,
    state: StateMap,
}

impl WorkContext {
    pub(crate) fn new(id: SubmissionId, state: StateMap) -> Self {
        Self { id, state }
    }

    /// The id of the submission being executed. Zero for init funcs.
    pub fn submission_id(&self) -> SubmissionId {
        self.id
    }

    /// The cooperative-cancel predicate. Work functions should poll
    /// this between chunks of work; the library never interrupts user
    /// code asynchronously.
    pub fn is_cancelled(&self) -> bool {
        self.state.flag(&cancel_key(self.id))
    }

    /// Read one shared-state value.
    pub fn state_value(&self, key: &str) -> Option<Value> {
        self.state.get(key)
    }

    /// The host-defined `current_state` bag, if seeded.
    pub fn current_state(&self) -> Option<Value> {
        self.state.get(forklift_core::CURRENT_STATE_KEY)
    }
}

/// A registered work function, resolved by key.
#[derive(Clone)]
pub(crate) enum Resolved {
    Single(WorkFn),
    Producer(ProducerFn),
}

#[derive(Default)]
struct Registries {
    work: HashMap<String, Resolved>,
    notifications: HashMap<String, NotificationFn>,
}

fn registries() -> MutexGuard<'static, Registries> {
    static REGISTRIES: OnceLock<Mutex<Registries>> = OnceLock::new();
    REGISTRIES
        .get_or_init(|| Mutex::new(Registries::default()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}

/// Register a single-shot work function under `key`.
///
/// Must run before [`crate::init`] so worker processes build the same
/// table. Re-registering a key replaces the previous function.
pub fn register_work<F>(key: &str, func: F)
where
    F: Fn(WorkContext, Value) -> Result<Value, BoxError> + Send + Sync + 'static,
{
    let previous = registries()
        .work
        .insert(key.to_string(), Resolved::Single(Arc::new(func)));
    if previous.is_some() {
        log::warn!("work function '{}' re-registered", key);
    }
}

/// Register a producer (streaming) work function under `key`.
pub fn register_producer<F>(key: &str, func: F)
where
    F: Fn(WorkContext, Value) -> Result<WorkStream, BoxError> + Send + Sync + 'static,
{
    let previous = registries()
        .work
        .insert(key.to_string(), Resolved::Producer(Arc::new(func)));
    if previous.is_some() {
        log::warn!("producer '{}' re-registered", key);
    }
}

/// Register a custom notification handler for the current process.
///
/// To be effective in workers this must run before [`crate::init`]
/// (i.e. before `start_workers` spawns anything).
pub fn register_notification<F>(name: &str, func: F)
where
    F: Fn(&Value) + Send + Sync + 'static,
{
    registries()
        .notifications
        .insert(name.to_string(), Arc::new(func));
}

pub(crate) fn resolve(key: &str) -> Option<Resolved> {
    registries().work.get(key).cloned()
}

/// Whether `key` is registered, and if so whether it is a producer.
pub(crate) fn registered_kind(key: &str) -> Option<bool> {
    registries()
        .work
        .get(key)
        .map(|r| matches!(r, Resolved::Producer(_)))
}

/// Invoke a custom notification handler. Handler panics are caught and
/// logged; the listener thread must survive bad handlers.
pub(crate) fn run_notification(name: &str, payload: &Value) {
    let Some(handler) = registries().notifications.get(name).cloned() else {
        log::warn!("no handler registered for notification '{}'", name);
        return;
    };
    if panic::catch_unwind(AssertUnwindSafe(|| handler(payload))).is_err() {
        log::error!("notification handler '{}' panicked", name);
    }
}
