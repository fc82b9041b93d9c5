use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier for a single submitted unit of work.
///
/// Monotonically increasing, allocated in the main process. An id is
/// never reused within a process, so late frames from a dead worker
/// can always be attributed (and dropped) safely.
pub type SubmissionId = u64;

static NEXT_SUBMISSION_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate the next submission id.
pub fn next_submission_id() -> SubmissionId {
    NEXT_SUBMISSION_ID.fetch_add(1, Ordering::Relaxed)
}
