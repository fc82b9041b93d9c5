//! Notification plane types.
//!
//! A notification is a named payload fanned out to every live worker's
//! command channel. Built-in names are handled by the worker runtime;
//! custom names resolve against per-process handler registrations.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::SubmissionId;

/// Built-in: set the process logger level. Payload: a level filter
/// string ("off", "error", "warn", "info", "debug", "trace").
pub const NOTIFY_UPDATE_LOG_LEVEL: &str = "update_log_level";

/// Built-in: update one shared-state key. Payload:
/// `{"key": <string>, "value": <any>}`; a `null` value removes the key.
pub const NOTIFY_UPDATE_STATE_VALUE: &str = "update_state_value";

/// Built-in: raise the cancel flag for a submission. Payload: the
/// submission id as a number.
pub const NOTIFY_CANCEL: &str = "cancel";

/// A named notification with an arbitrary serializable payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub name: String,
    pub payload: Value,
}

impl Notification {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }

    pub fn update_log_level(level: &str) -> Self {
        Self::new(NOTIFY_UPDATE_LOG_LEVEL, Value::String(level.to_string()))
    }

    pub fn update_state_value(key: &str, value: Value) -> Self {
        Self::new(NOTIFY_UPDATE_STATE_VALUE, json!({ "key": key, "value": value }))
    }

    pub fn cancel(id: SubmissionId) -> Self {
        Self::new(NOTIFY_CANCEL, json!(id))
    }
}
