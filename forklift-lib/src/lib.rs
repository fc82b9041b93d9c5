//! forklift: offload CPU-bound work to worker processes without
//! blocking the host's event loop.
//!
//! The host registers work functions by string key, calls [`init`] at
//! the top of `main` (worker processes are the host binary re-executed;
//! `init` turns them into workers), starts the pool, and submits work.
//! Results come back through per-submission futures; producer-style
//! functions stream partial values through a [`ResultHandler`];
//! cancellation is cooperative via a shared flag that work functions
//! poll.
//!
//! ```no_run
//! use serde_json::{Value, json};
//!
//! fn main() -> Result<(), forklift_lib::OffloadError> {
//!     forklift_lib::register_work("add", |_ctx, args: Value| {
//!         let a = args[0].as_i64().unwrap_or(0);
//!         let b = args[1].as_i64().unwrap_or(0);
//!         Ok(json!(a + b))
//!     });
//!     forklift_lib::init(); // never returns in a worker process
//!
//!     forklift_lib::start_workers(Some(2))?;
//!     let fut = forklift_lib::submit("add", json!([2, 3]))?;
//!     assert_eq!(fut.result()?, json!(5));
//!     forklift_lib::stop(None);
//!     Ok(())
//! }
//! ```

// Re-export everything from forklift-core so hosts depend on one crate.
pub use forklift_core::*;

pub mod backend;
mod dispatch;
pub mod future;
pub mod global;
pub mod pool;
pub mod registry;
mod worker;

pub use future::{CollectHandler, FutureState, LastValueHandler, ResultHandler, WorkFuture};
pub use global::{
    add_custom_notification, add_init_func, configure, current_process_count, disable_fail_open,
    disable_offload, enable_offload, enqueue_notification, is_cancelled, prepare_globals,
    processes_started, stop, submit, submit_streaming, submit_with_handler, start_workers,
    update_log_level, update_state_value, wait_for_complete_load, wait_for_process_start,
};
pub use pool::{Lifecycle, Pool};
pub use registry::{
    BoxError, WorkContext, WorkStream, register_notification, register_producer, register_work,
};
pub use worker::init;
