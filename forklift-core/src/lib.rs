//! Shared types for the forklift work-offload manager.
//!
//! Submission ids, wire frames and their line codec, transported error
//! kinds, notifications, the shared state map, and pool options. This
//! crate is policy-free; the pool machinery lives in `forklift-lib`.

pub mod error;
pub mod frame;
pub mod id;
pub mod notify;
pub mod options;
pub mod state;

pub use error::{OffloadError, WorkError, WorkErrorKind};
pub use frame::{ResultFrame, SubmissionFrame, WorkerCommand, read_frame, write_frame};
pub use id::{SubmissionId, next_submission_id};
pub use notify::{
    NOTIFY_CANCEL, NOTIFY_UPDATE_LOG_LEVEL, NOTIFY_UPDATE_STATE_VALUE, Notification,
};
pub use options::{OptionsError, PoolOptions};
pub use state::{CURRENT_STATE_KEY, StateGuard, StateMap, cancel_key};
