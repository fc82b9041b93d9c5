//! Process-wide pool facade.
//!
//! Most hosts use a single pool for the whole process; these free
//! functions mirror the [`Pool`] API over a lazily created singleton
//! backed by child processes. Hosts that need non-default options call
//! [`configure`] before anything else touches the pool.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use forklift_core::{OffloadError, PoolOptions, SubmissionId, cancel_key};

use crate::future::{ResultHandler, WorkFuture};
use crate::pool::Pool;
use crate::{registry, worker};

static GLOBAL: OnceLock<Pool> = OnceLock::new();

/// The process-wide pool, created on first use with default options.
pub fn pool() -> &'static Pool {
    GLOBAL.get_or_init(|| Pool::new(PoolOptions::default()))
}

/// Install options for the process-wide pool. Fails once the pool has
/// already been created.
pub fn configure(options: PoolOptions) -> Result<(), OffloadError> {
    GLOBAL
        .set(Pool::new(options))
        .map_err(|_| OffloadError::InvalidState("global pool already in use"))
}

/// See [`Pool::add_init_func`].
pub fn add_init_func(key: &str, args: impl Serialize) -> Result<(), OffloadError> {
    pool().add_init_func(key, args)
}

/// See [`Pool::prepare_globals`].
pub fn prepare_globals(globals: HashMap<String, Value>) -> Result<(), OffloadError> {
    pool().prepare_globals(globals)
}

/// See [`Pool::start_workers`].
pub fn start_workers(count: Option<usize>) -> Result<(), OffloadError> {
    pool().start_workers(count)
}

/// See [`Pool::stop`].
pub fn stop(timeout: Option<Duration>) {
    pool().stop(timeout)
}

/// See [`Pool::submit`].
pub fn submit(key: &str, args: impl Serialize) -> Result<WorkFuture, OffloadError> {
    pool().submit(key, args)
}

/// See [`Pool::submit_with_handler`].
pub fn submit_with_handler(
    key: &str,
    args: impl Serialize,
    handler: Box<dyn ResultHandler>,
) -> Result<WorkFuture, OffloadError> {
    pool().submit_with_handler(key, args, handler)
}

/// See [`Pool::submit_streaming`].
pub fn submit_streaming(
    key: &str,
    args: impl Serialize,
    handler: Box<dyn ResultHandler>,
) -> Result<WorkFuture, OffloadError> {
    pool().submit_streaming(key, args, handler)
}

/// See [`Pool::enable_offload`].
pub fn enable_offload() {
    pool().enable_offload()
}

/// See [`Pool::disable_offload`].
pub fn disable_offload() {
    pool().disable_offload()
}

/// See [`Pool::disable_fail_open`].
pub fn disable_fail_open() {
    pool().disable_fail_open()
}

/// See [`Pool::current_process_count`].
pub fn current_process_count() -> usize {
    pool().current_process_count()
}

/// See [`Pool::processes_started`].
pub fn processes_started() -> bool {
    pool().processes_started()
}

/// See [`Pool::wait_for_process_start`].
pub fn wait_for_process_start(timeout: Duration) -> bool {
    pool().wait_for_process_start(timeout)
}

/// See [`Pool::wait_for_complete_load`].
pub fn wait_for_complete_load(timeout: Duration) -> bool {
    pool().wait_for_complete_load(timeout)
}

/// Register a handler for a custom notification name in the current
/// process. Must run before `start_workers` (and before [`crate::init`])
/// to be visible inside workers.
pub fn add_custom_notification<F>(name: &str, handler: F)
where
    F: Fn(&Value) + Send + Sync + 'static,
{
    registry::register_notification(name, handler);
}

/// See [`Pool::enqueue_notification`].
pub fn enqueue_notification(name: &str, payload: Value) {
    pool().enqueue_notification(name, payload)
}

/// See [`Pool::update_log_level`].
pub fn update_log_level(level: &str) {
    pool().update_log_level(level)
}

/// See [`Pool::update_state_value`].
pub fn update_state_value(key: &str, value: Value) {
    pool().update_state_value(key, value)
}

/// The cooperative-cancel predicate as a free function.
///
/// Inside a worker process this consults the worker's state mirror; in
/// the host process it consults the global pool's map. Work functions
/// should prefer [`crate::registry::WorkContext::is_cancelled`], which
/// also covers in-process workers of non-global pools.
pub fn is_cancelled(id: SubmissionId) -> bool {
    if let Some(state) = worker::worker_state() {
        return state.flag(&cancel_key(id));
    }
    match GLOBAL.get() {
        Some(pool) => pool.inner.state.flag(&cancel_key(id)),
        None => false,
    }
}
