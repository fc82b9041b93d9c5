//! forklift CLI
//!
//! Demonstration and diagnostics binary for the forklift work-offload
//! pool. Registers sample work functions, spawns real worker processes
//! (this binary re-executed), and drives submissions through them:
//! single-shot work, streaming, cooperative cancellation, and a small
//! throughput benchmark.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use serde_json::{Value, json};

use forklift_lib::{CollectHandler, PoolOptions, WorkContext};

#[derive(Parser)]
#[command(name = "forklift", version, about = "Work-offload pool demo and diagnostics")]
struct Cli {
    /// TOML options file for the pool (worker_count, queue_capacity, ...).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level filter (error, warn, info, debug, trace).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// End-to-end demo: single-shot, streaming, cancellation.
    Demo {
        /// Worker processes to spawn (default: cores - 1).
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Time a batch of CPU-bound submissions across the pool.
    Bench {
        /// Submissions to issue.
        #[arg(long, default_value_t = 64)]
        items: usize,

        /// Recursion depth per item (bigger = slower).
        #[arg(long, default_value_t = 27)]
        depth: u64,

        /// Worker processes to spawn (default: cores - 1).
        #[arg(long)]
        workers: Option<usize>,
    },
}

/// Naive recursive fibonacci with a periodic cancel check. Returns
/// `None` once the cancel flag is observed.
fn fib(n: u64, ctx: &WorkContext, calls: &mut u64) -> Option<u64> {
    *calls += 1;
    if *calls % 100_000 == 0 && ctx.is_cancelled() {
        return None;
    }
    if n < 2 {
        return Some(n);
    }
    Some(fib(n - 1, ctx, calls)? + fib(n - 2, ctx, calls)?)
}

fn register_functions() {
    forklift_lib::register_work("add", |_ctx, args: Value| {
        let a = args[0].as_i64().unwrap_or(0);
        let b = args[1].as_i64().unwrap_or(0);
        Ok(json!(a + b))
    });

    forklift_lib::register_work("fib", |ctx, args: Value| {
        let n = args.as_u64().unwrap_or(0);
        let mut calls = 0;
        match fib(n, &ctx, &mut calls) {
            Some(value) => Ok(json!(value)),
            // The cancel flag is set; the worker reports Cancelled.
            None => Ok(Value::Null),
        }
    });

    forklift_lib::register_producer("countdown", |_ctx, args: Value| {
        let n = args.as_u64().unwrap_or(0);
        let iter = (0..=n).rev().map(|i| {
            std::thread::sleep(Duration::from_millis(50));
            Ok(json!(i))
        });
        Ok(Box::new(iter) as forklift_lib::WorkStream)
    });

    forklift_lib::register_work("setup", |ctx, _args: Value| {
        log::info!(
            "worker initialized (state: {})",
            ctx.current_state().unwrap_or(Value::Null)
        );
        Ok(Value::Null)
    });
}

fn main() {
    register_functions();

    // Worker processes log to stderr like the host; stdout carries
    // result frames, so the logger must never write there.
    if std::env::var_os(forklift_lib::backend::process::WORKER_ENV).is_some() {
        env_logger::Builder::from_default_env()
            .target(env_logger::Target::Stderr)
            .init();
    }
    forklift_lib::init(); // never returns in a worker process

    let cli = Cli::parse();
    env_logger::Builder::from_default_env()
        .filter_level(cli.log_level.parse().unwrap_or(log::LevelFilter::Info))
        .init();

    let result = match cli.command {
        Command::Demo { workers } => run_demo(&cli, workers),
        Command::Bench {
            items,
            depth,
            workers,
        } => run_bench(&cli, items, depth, workers),
    };
    if let Err(err) = result {
        log::error!("{}", err);
        std::process::exit(1);
    }
}

fn load_options(cli: &Cli) -> Result<PoolOptions, Box<dyn std::error::Error>> {
    let mut options = match &cli.config {
        Some(path) => PoolOptions::load(path)?,
        None => PoolOptions::default(),
    };
    if options.worker_log_level.is_none() {
        options.worker_log_level = Some(cli.log_level.clone());
    }
    Ok(options)
}

fn run_demo(cli: &Cli, workers: Option<usize>) -> Result<(), Box<dyn std::error::Error>> {
    forklift_lib::configure(load_options(cli)?)?;
    forklift_lib::add_init_func("setup", json!(null))?;
    forklift_lib::prepare_globals(
        [(
            forklift_lib::CURRENT_STATE_KEY.to_string(),
            json!({"mode": "demo"}),
        )]
        .into_iter()
        .collect(),
    )?;

    forklift_lib::start_workers(workers)?;
    log::info!("{} workers running", forklift_lib::current_process_count());

    // Single-shot.
    let fut = forklift_lib::submit("add", json!([2, 3]))?;
    log::info!("add(2, 3) = {}", fut.result()?);

    // Streaming, collected into an array.
    let fut = forklift_lib::submit_streaming(
        "countdown",
        json!(5),
        Box::new(CollectHandler::default()),
    )?;
    log::info!("countdown(5) = {}", fut.result()?);

    // Cooperative cancellation mid-flight.
    let fut = forklift_lib::submit("fib", json!(42))?;
    std::thread::sleep(Duration::from_millis(150));
    fut.cancel();
    match fut.result() {
        Err(err) if err.is_cancelled() => log::info!("fib(42) cancelled cooperatively"),
        Ok(value) => log::info!("fib(42) finished before the cancel landed: {}", value),
        Err(err) => return Err(err.into()),
    }

    forklift_lib::stop(None);
    log::info!("pool stopped");
    Ok(())
}

fn run_bench(
    cli: &Cli,
    items: usize,
    depth: u64,
    workers: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    forklift_lib::configure(load_options(cli)?)?;
    forklift_lib::start_workers(workers)?;
    let worker_count = forklift_lib::current_process_count();
    log::info!("benchmarking {} x fib({}) on {} workers", items, depth, worker_count);

    let started = Instant::now();
    let futures: Vec<_> = (0..items)
        .map(|_| forklift_lib::submit("fib", json!(depth)))
        .collect::<Result<_, _>>()?;
    for fut in &futures {
        fut.result()?;
    }
    let elapsed = started.elapsed();
    log::info!(
        "{} items in {:.2?} ({:.1} items/s)",
        items,
        elapsed,
        items as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );

    forklift_lib::stop(None);
    Ok(())
}
