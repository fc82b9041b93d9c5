//! Lifecycle, ordering, and accounting invariants.

mod common;

use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;

use forklift_lib::{FutureState, Lifecycle};

use common::{entries_with, inproc_pool, started_pool};

#[test]
fn submissions_dispatch_in_fifo_order() {
    let pool = started_pool(1);
    let futures: Vec<_> = (0..6)
        .map(|i| {
            pool.submit("record", json!({"tag": "fifo", "value": i}))
                .unwrap()
        })
        .collect();
    for fut in &futures {
        fut.wait();
    }
    let expected: Vec<String> = (0..6).map(|i| format!("fifo:{}", i)).collect();
    assert_eq!(entries_with("fifo"), expected);
    pool.stop(None);
}

#[test]
fn init_funcs_run_once_per_worker_in_order() {
    let pool = inproc_pool(1);
    pool.add_init_func("init_marker", json!({"tag": "lio", "n": 1}))
        .unwrap();
    pool.add_init_func("init_marker", json!({"tag": "lio", "n": 2}))
        .unwrap();
    pool.start_workers(None).unwrap();
    assert!(pool.wait_for_complete_load(Duration::from_secs(5)));

    assert_eq!(entries_with("init-lio"), ["init-lio:1", "init-lio:2"]);

    // Init funcs precede any submission.
    let fut = pool
        .submit("record", json!({"tag": "lio-sub", "value": 0}))
        .unwrap();
    fut.wait();
    assert_eq!(entries_with("init-lio").len(), 2);
    pool.stop(None);
}

#[test]
fn worker_count_is_clamped() {
    let cpus = thread::available_parallelism().map(|n| n.get()).unwrap_or(2);
    let ceiling = cpus.saturating_sub(1).max(1);

    let pool = common::inproc_pool(1);
    // The configured count of one wins over the huge request ceiling.
    pool.start_workers(Some(1)).unwrap();
    assert_eq!(pool.current_process_count(), 1);
    pool.stop(None);

    let pool = {
        common::register_all();
        let options = forklift_lib::PoolOptions::default();
        forklift_lib::Pool::with_backend(
            options,
            Box::new(forklift_lib::backend::inproc::InprocBackend),
        )
    };
    pool.start_workers(Some(1000)).unwrap();
    assert_eq!(pool.current_process_count(), ceiling);
    pool.stop(None);
}

#[test]
fn stop_cancels_outstanding_futures() {
    let pool = started_pool(1);

    // One in flight (uncancellable sleep slice loop never sees a flag,
    // so it holds the worker), one queued behind it.
    let in_flight = pool.submit("sleep_ms", json!(2000)).unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    while in_flight.state() != FutureState::Running {
        assert!(Instant::now() < deadline);
        thread::sleep(Duration::from_millis(5));
    }
    let queued = pool.submit("identity", json!(1)).unwrap();

    pool.stop(Some(Duration::from_millis(200)));

    assert_eq!(pool.lifecycle(), Lifecycle::Stopped);
    assert!(in_flight.state().is_terminal());
    assert!(queued.state().is_terminal());
    assert!(matches!(
        queued.result(),
        Err(forklift_lib::OffloadError::Cancelled)
    ));
    assert_eq!(pool.current_process_count(), 0);
}

#[test]
fn start_waits_and_accounting_reports() {
    let pool = inproc_pool(2);
    assert!(!pool.processes_started());
    assert!(!pool.wait_for_process_start(Duration::from_millis(50)));
    assert!(!pool.wait_for_complete_load(Duration::from_millis(50)));
    assert_eq!(pool.current_process_count(), 0);

    pool.start_workers(None).unwrap();
    assert!(pool.processes_started());
    assert!(pool.wait_for_process_start(Duration::from_millis(50)));
    assert!(pool.wait_for_complete_load(Duration::from_secs(5)));
    let cpus = thread::available_parallelism().map(|n| n.get()).unwrap_or(2);
    let expected = 2.min(cpus.saturating_sub(1).max(1));
    assert_eq!(pool.current_process_count(), expected);
    assert_eq!(pool.lifecycle(), Lifecycle::Running);

    pool.stop(None);
    assert_eq!(pool.current_process_count(), 0);
}
