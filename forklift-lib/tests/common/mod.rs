//! Shared fixtures for the integration tests: registered work
//! functions and in-process pool factories.
//!
//! In-process workers share the test process, so ordering invariants
//! (FIFO dispatch, init-func order, notification order) are directly
//! observable through a tagged execution log.

// Each integration test binary compiles its own copy; not every test
// uses every helper.
#![allow(dead_code)]

use std::sync::{Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use serde_json::{Value, json};

use forklift_lib::backend::inproc::InprocBackend;
use forklift_lib::{Pool, PoolOptions};

pub fn execution_log() -> &'static Mutex<Vec<String>> {
    static LOG: OnceLock<Mutex<Vec<String>>> = OnceLock::new();
    LOG.get_or_init(|| Mutex::new(Vec::new()))
}

pub fn push_log(entry: impl Into<String>) {
    execution_log()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .push(entry.into());
}

/// Log entries starting with `tag:`, in append order. Tests use unique
/// tags so parallel tests cannot see each other's entries.
pub fn entries_with(tag: &str) -> Vec<String> {
    let prefix = format!("{}:", tag);
    execution_log()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .iter()
        .filter(|e| e.starts_with(&prefix))
        .cloned()
        .collect()
}

pub fn register_all() {
    static ONCE: OnceLock<()> = OnceLock::new();
    ONCE.get_or_init(|| {
        let _ = env_logger::builder().is_test(true).try_init();

        forklift_lib::register_work("add", |_ctx, args: Value| {
            let a = args[0].as_i64().unwrap_or(0);
            let b = args[1].as_i64().unwrap_or(0);
            Ok(json!(a + b))
        });

        forklift_lib::register_work("identity", |_ctx, args: Value| Ok(args));

        forklift_lib::register_work("fail", |_ctx, _args: Value| Err("boom".into()));

        forklift_lib::register_work(
            "panic",
            |_ctx, _args: Value| -> Result<Value, forklift_lib::BoxError> { panic!("kaboom") },
        );

        // Appends "<tag>:<value>" to the shared log and echoes the value.
        forklift_lib::register_work("record", |_ctx, args: Value| {
            let tag = args["tag"].as_str().unwrap_or("?").to_string();
            let value = args["value"].clone();
            push_log(format!("{}:{}", tag, value));
            Ok(value)
        });

        // Sleeps in small slices, returning early if cancelled.
        forklift_lib::register_work("sleep_ms", |ctx, args: Value| {
            let total = args.as_u64().unwrap_or(0);
            let mut slept = 0;
            while slept < total {
                if ctx.is_cancelled() {
                    return Ok(json!("interrupted"));
                }
                thread::sleep(Duration::from_millis(5));
                slept += 5;
            }
            Ok(json!("slept"))
        });

        forklift_lib::register_producer("count_to_three", |_ctx, _args: Value| {
            let items = [10i64, 20, 30];
            Ok(Box::new(items.into_iter().map(|v| Ok(json!(v)))) as forklift_lib::WorkStream)
        });

        // Yields 0, 1, 2 quickly, then parks until the cancel flag
        // lands; whatever it yields next must never be delivered.
        forklift_lib::register_producer("count_until_cancelled", |ctx, _args: Value| {
            let probe = ctx.clone();
            let iter = (0u64..).map(move |i| {
                if i >= 3 {
                    while !probe.is_cancelled() {
                        thread::sleep(Duration::from_millis(2));
                    }
                }
                Ok(json!(i))
            });
            Ok(Box::new(iter) as forklift_lib::WorkStream)
        });

        forklift_lib::register_producer("stream_fail", |_ctx, _args: Value| {
            let items: Vec<Result<Value, forklift_lib::BoxError>> =
                vec![Ok(json!(1)), Err("stream broke".into())];
            Ok(Box::new(items.into_iter()) as forklift_lib::WorkStream)
        });

        // Init func: appends "init-<tag>:<n>" so per-worker init order
        // is observable.
        forklift_lib::register_work("init_marker", |_ctx, args: Value| {
            let tag = args["tag"].as_str().unwrap_or("?").to_string();
            let n = args["n"].clone();
            push_log(format!("init-{}:{}", tag, n));
            Ok(Value::Null)
        });

        forklift_lib::register_work("read_state", |ctx, args: Value| {
            let key = args.as_str().unwrap_or("");
            Ok(ctx.state_value(key).unwrap_or(Value::Null))
        });

        // Custom notification handler: appends "note-<tag>:<i>".
        forklift_lib::add_custom_notification("note", |payload| {
            let tag = payload["tag"].as_str().unwrap_or("?");
            push_log(format!("note-{}:{}", tag, payload["i"]));
        });
    });
}

pub fn inproc_pool(workers: usize) -> Pool {
    register_all();
    let options = PoolOptions {
        worker_count: Some(workers),
        ..PoolOptions::default()
    };
    Pool::with_backend(options, Box::new(InprocBackend))
}

pub fn started_pool(workers: usize) -> Pool {
    let pool = inproc_pool(workers);
    pool.start_workers(None).expect("start_workers failed");
    assert!(pool.wait_for_complete_load(Duration::from_secs(5)));
    pool
}
