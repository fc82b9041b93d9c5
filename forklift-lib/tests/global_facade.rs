//! The process-wide pool facade.
//!
//! A single test drives the whole sequence: the global pool is one per
//! process, so interleaved tests would see each other's policy flags.

mod common;

use serde_json::json;

use forklift_lib::{OffloadError, PoolOptions};

#[test]
fn global_pool_fail_open_sequence() {
    common::register_all();

    // No workers are ever spawned in this test.
    forklift_lib::disable_offload();
    let fut = forklift_lib::submit("add", json!([1, 2])).unwrap();
    assert_eq!(fut.result().unwrap(), json!(3));
    assert_eq!(forklift_lib::current_process_count(), 0);
    assert!(!forklift_lib::processes_started());
    assert!(!forklift_lib::is_cancelled(12345));

    // The pool exists now, so late configuration is refused.
    assert!(forklift_lib::configure(PoolOptions::default()).is_err());

    forklift_lib::disable_fail_open();
    assert!(matches!(
        forklift_lib::submit("add", json!([1, 2])),
        Err(OffloadError::OffloadDisabled)
    ));

    // Stopping an unstarted pool is a no-op, and a stopped pool never
    // comes back.
    forklift_lib::stop(None);
    assert!(matches!(
        forklift_lib::start_workers(None),
        Err(OffloadError::InvalidState(_))
    ));
}
