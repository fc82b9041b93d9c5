//! Pool configuration.
//!
//! Hosts usually rely on the defaults, but every knob can come from a
//! TOML document (e.g. a `forklift.toml` shipped next to the host's own
//! settings file).

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Tunables for a pool. All fields have working defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolOptions {
    /// Worker count; `None` uses every available core but one.
    pub worker_count: Option<usize>,

    /// Bound on the submission queue; `None` is unbounded. While the
    /// bound is reached, `submit` blocks until a slot frees up.
    pub queue_capacity: Option<usize>,

    /// Seconds `stop()` waits for workers to exit before force-killing.
    pub stop_timeout_secs: f64,

    /// Whether submissions may be offloaded to workers at all.
    pub offload_enabled: bool,

    /// Whether submissions fall back to local, synchronous execution
    /// when offload is unavailable.
    pub fail_open: bool,

    /// Log level filter handed to workers at spawn (e.g. "info").
    /// `None` leaves the worker at whatever the host's logger set up.
    pub worker_log_level: Option<String>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            worker_count: None,
            queue_capacity: None,
            stop_timeout_secs: 10.0,
            offload_enabled: true,
            fail_open: true,
            worker_log_level: None,
        }
    }
}

impl PoolOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.stop_timeout_secs.max(0.0))
    }

    /// Parse options from a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self, OptionsError> {
        Ok(toml::from_str(contents)?)
    }

    /// Load options from a TOML file.
    pub fn load(path: &Path) -> Result<Self, OptionsError> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    /// Resolve the worker count for `start_workers(requested)`.
    ///
    /// Never more than `available_cpus - 1` (one core stays with the
    /// host's own event loop), never less than one.
    pub fn effective_worker_count(&self, requested: Option<usize>, available_cpus: usize) -> usize {
        let ceiling = available_cpus.saturating_sub(1).max(1);
        requested
            .or(self.worker_count)
            .unwrap_or(ceiling)
            .clamp(1, ceiling)
    }
}

/// Errors from reading an options file.
#[derive(Debug, Error)]
pub enum OptionsError {
    /// I/O error reading the options file
    #[error("I/O error reading options: {0}")]
    Io(#[from] std::io::Error),

    /// The options file is not valid TOML or has unknown fields
    #[error("invalid options file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[cfg(test)]
#[path = "tests/options_tests.rs"]
mod tests;
