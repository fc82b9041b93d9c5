use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use serde_json::{Value, json};

use super::*;
use crate::backend::inproc::InprocBackend;
use crate::future::FutureState;
use forklift_core::WorkErrorKind;

fn register_fixtures() {
    static ONCE: OnceLock<()> = OnceLock::new();
    ONCE.get_or_init(|| {
        let _ = env_logger::builder().is_test(true).try_init();
        registry::register_work("pt_add", |_ctx, args: Value| {
            let a = args[0].as_i64().unwrap_or(0);
            let b = args[1].as_i64().unwrap_or(0);
            Ok(json!(a + b))
        });
        registry::register_work("pt_sleep", |_ctx, args: Value| {
            let ms = args.as_u64().unwrap_or(0);
            std::thread::sleep(Duration::from_millis(ms));
            Ok(json!("slept"))
        });
    });
}

fn inproc_pool(worker_count: usize) -> Pool {
    register_fixtures();
    let options = PoolOptions {
        worker_count: Some(worker_count),
        ..PoolOptions::default()
    };
    Pool::with_backend(options, Box::new(InprocBackend))
}

#[test]
fn worker_crash_fails_submission_and_pool_recovers() {
    let pool = inproc_pool(1);
    pool.start_workers(None).unwrap();
    assert!(pool.wait_for_complete_load(Duration::from_secs(5)));

    let fut = pool.submit("pt_sleep", json!(200)).unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    while fut.state() != FutureState::Running {
        assert!(Instant::now() < deadline, "submission never dispatched");
        std::thread::sleep(Duration::from_millis(5));
    }

    pool.kill_worker(0);
    match fut.result() {
        Err(OffloadError::Work(err)) => assert_eq!(err.kind, WorkErrorKind::WorkerCrash),
        other => panic!("expected worker-crash error, got {:?}", other),
    }

    // The slot is respawned; the pool keeps working.
    let fut = pool.submit("pt_add", json!([3, 4])).unwrap();
    assert_eq!(fut.result().unwrap(), json!(7));
    pool.stop(Some(Duration::from_secs(2)));
}

#[test]
fn lifecycle_misuse_is_rejected() {
    let pool = inproc_pool(1);
    pool.start_workers(Some(1)).unwrap();

    assert!(matches!(
        pool.add_init_func("pt_add", json!([1, 2])),
        Err(OffloadError::InvalidState(_))
    ));
    assert!(matches!(
        pool.prepare_globals(HashMap::new()),
        Err(OffloadError::InvalidState(_))
    ));

    // Idempotent while running.
    pool.start_workers(None).unwrap();
    assert_eq!(pool.lifecycle(), Lifecycle::Running);

    pool.stop(Some(Duration::from_secs(2)));
    assert_eq!(pool.lifecycle(), Lifecycle::Stopped);
    assert!(matches!(
        pool.start_workers(None),
        Err(OffloadError::InvalidState(_))
    ));
    // Double stop is a no-op.
    pool.stop(None);
    assert_eq!(pool.lifecycle(), Lifecycle::Stopped);
}

#[test]
fn submit_policy_before_start() {
    let pool = inproc_pool(1);
    pool.disable_fail_open();

    // Offload still intended but the pool was never started.
    assert!(matches!(
        pool.submit("pt_add", json!([1, 2])),
        Err(OffloadError::InvalidState(_))
    ));

    // Explicitly disabled offload is a policy rejection instead.
    pool.disable_offload();
    assert!(matches!(
        pool.submit("pt_add", json!([1, 2])),
        Err(OffloadError::OffloadDisabled)
    ));
}

#[test]
fn bad_submissions_are_rejected_eagerly() {
    let pool = inproc_pool(1);

    match pool.submit("pt_missing", json!(null)) {
        Err(OffloadError::Work(err)) => assert_eq!(err.kind, WorkErrorKind::UnknownCallable),
        other => panic!("expected unknown-callable error, got {:?}", other),
    }

    // JSON object keys must be strings; this map cannot be encoded.
    let mut unencodable = HashMap::new();
    unencodable.insert(vec![1u8], 2i32);
    match pool.submit("pt_add", unencodable) {
        Err(OffloadError::Work(err)) => assert_eq!(err.kind, WorkErrorKind::Serialization),
        other => panic!("expected serialization error, got {:?}", other),
    }
}

#[test]
fn add_init_func_requires_registered_key() {
    let pool = inproc_pool(1);
    match pool.add_init_func("pt_missing", json!(null)) {
        Err(OffloadError::Work(err)) => assert_eq!(err.kind, WorkErrorKind::UnknownCallable),
        other => panic!("expected unknown-callable error, got {:?}", other),
    }
}
