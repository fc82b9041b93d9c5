//! End-to-end scenarios over the in-process backend: single-shot,
//! streaming, cancellation, failures, and fail-open local execution.

mod common;

use std::sync::mpsc;
use std::time::{Duration, Instant};

use serde_json::{Value, json};

use forklift_lib::{
    CollectHandler, FutureState, OffloadError, ResultHandler, WorkErrorKind,
};

use common::{entries_with, inproc_pool, started_pool};

/// Forwards every delivered value over a channel so tests can react
/// mid-stream, and keeps the last value for finalization.
struct TapHandler {
    tx: mpsc::Sender<Value>,
    last: Option<Value>,
}

impl TapHandler {
    fn new() -> (Box<Self>, mpsc::Receiver<Value>) {
        let (tx, rx) = mpsc::channel();
        (Box::new(Self { tx, last: None }), rx)
    }
}

impl ResultHandler for TapHandler {
    fn handle_result(&mut self, value: Value) {
        let _ = self.tx.send(value.clone());
        self.last = Some(value);
    }

    fn finalize_result(&mut self) -> Value {
        self.last.take().unwrap_or(Value::Null)
    }
}

#[test]
fn single_shot_success() {
    let pool = started_pool(2);
    let fut = pool.submit("add", json!([2, 3])).unwrap();
    assert_eq!(fut.result().unwrap(), json!(5));
    pool.stop(None);
    assert_eq!(pool.current_process_count(), 0);
}

#[test]
fn streaming_default_handler_keeps_last_value() {
    let pool = started_pool(1);
    let fut = pool.submit("count_to_three", json!(null)).unwrap();
    assert_eq!(fut.result().unwrap(), json!(30));
    pool.stop(None);
}

#[test]
fn streaming_collect_handler_returns_all_values() {
    let pool = started_pool(1);
    let fut = pool
        .submit_streaming("count_to_three", json!(null), Box::new(CollectHandler::default()))
        .unwrap();
    assert_eq!(fut.result().unwrap(), json!([10, 20, 30]));
    pool.stop(None);
}

#[test]
fn submit_streaming_rejects_single_shot_keys() {
    let pool = inproc_pool(1);
    match pool.submit_streaming("add", json!([1, 2]), Box::new(CollectHandler::default())) {
        Err(OffloadError::Work(err)) => assert_eq!(err.kind, WorkErrorKind::UnknownCallable),
        other => panic!("expected rejection, got {:?}", other),
    }
}

#[test]
fn cancel_before_pickup_never_reaches_a_worker() {
    let pool = started_pool(1);

    // Occupy the only worker, then queue a recorded submission.
    let blocker = pool.submit("sleep_ms", json!(300)).unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    while blocker.state() != FutureState::Running {
        assert!(Instant::now() < deadline, "blocker never dispatched");
        std::thread::sleep(Duration::from_millis(5));
    }

    let queued = pool
        .submit("record", json!({"tag": "s3", "value": 1}))
        .unwrap();
    queued.cancel();

    assert!(matches!(queued.result(), Err(OffloadError::Cancelled)));
    assert_eq!(queued.state(), FutureState::Cancelled);

    // Let the blocker finish, then confirm the cancelled submission
    // was never executed anywhere.
    assert_eq!(blocker.result().unwrap(), json!("slept"));
    assert!(entries_with("s3").is_empty());
    pool.stop(None);
}

#[test]
fn cooperative_cancel_mid_stream() {
    let pool = started_pool(1);
    let (handler, values) = TapHandler::new();
    let fut = pool
        .submit_streaming("count_until_cancelled", json!(null), handler)
        .unwrap();

    // Receive 0, 1, 2, then cancel.
    for expected in 0..3u64 {
        let value = values
            .recv_timeout(Duration::from_secs(2))
            .expect("stream stalled");
        assert_eq!(value, json!(expected));
    }
    fut.cancel();

    assert!(matches!(fut.result(), Err(OffloadError::Cancelled)));
    // Nothing past the cancellation point is ever delivered.
    assert!(values.recv_timeout(Duration::from_millis(100)).is_err());
    pool.stop(None);
}

#[test]
fn user_failure_is_surfaced_with_detail() {
    let pool = started_pool(1);
    match pool.submit("fail", json!(null)).unwrap().result() {
        Err(OffloadError::Work(err)) => {
            assert_eq!(err.kind, WorkErrorKind::User);
            assert!(err.message.contains("boom"));
        }
        other => panic!("expected user failure, got {:?}", other),
    }
    // A panicking work function is captured the same way.
    match pool.submit("panic", json!(null)).unwrap().result() {
        Err(OffloadError::Work(err)) => {
            assert_eq!(err.kind, WorkErrorKind::User);
            assert!(err.message.contains("kaboom"));
        }
        other => panic!("expected panic capture, got {:?}", other),
    }
    // The pool survives both.
    assert_eq!(
        pool.submit("identity", json!(7)).unwrap().result().unwrap(),
        json!(7)
    );
    pool.stop(None);
}

#[test]
fn mid_stream_failure_fails_the_future() {
    let pool = started_pool(1);
    let (handler, values) = TapHandler::new();
    let fut = pool.submit_streaming("stream_fail", json!(null), handler).unwrap();
    match fut.result() {
        Err(OffloadError::Work(err)) => {
            assert_eq!(err.kind, WorkErrorKind::User);
            assert!(err.message.contains("stream broke"));
        }
        other => panic!("expected stream failure, got {:?}", other),
    }
    // The value produced before the failure was delivered.
    assert_eq!(values.try_recv().unwrap(), json!(1));
    pool.stop(None);
}

#[test]
fn fail_open_runs_locally_then_policy_rejects() {
    let pool = inproc_pool(2);

    // Offload disabled, fail-open on: runs synchronously, no workers.
    pool.disable_offload();
    let fut = pool.submit("add", json!([1, 2])).unwrap();
    assert_eq!(fut.result().unwrap(), json!(3));
    assert_eq!(pool.current_process_count(), 0);

    // Streaming also works locally, through the handler.
    let fut = pool
        .submit_streaming("count_to_three", json!(null), Box::new(CollectHandler::default()))
        .unwrap();
    assert_eq!(fut.result().unwrap(), json!([10, 20, 30]));

    pool.disable_fail_open();
    assert!(matches!(
        pool.submit("add", json!([1, 2])),
        Err(OffloadError::OffloadDisabled)
    ));
}
