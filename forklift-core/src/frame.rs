//! Wire protocol between the pool and its workers.
//!
//! Frames cross the process boundary as JSON Lines: one serialized
//! frame per newline-terminated line. The command channel (pool →
//! worker) carries submissions, notifications, and the shutdown
//! sentinel; the result channel (worker → pool) carries handshake
//! signals and per-submission result frames.

use std::collections::HashMap;
use std::io::{self, BufRead, Write};

use serde::{Deserialize, Serialize};

use crate::SubmissionId;
use crate::error::WorkErrorKind;

/// A unit of work as it crosses the process boundary.
///
/// The handler reference and creation instant stay in the pool's
/// pending table; only what the worker needs travels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionFrame {
    pub id: SubmissionId,
    /// Registered work-function key (see the registry in `forklift-lib`).
    pub key: String,
    pub args: serde_json::Value,
    /// Whether the function is a producer of many values.
    pub streaming: bool,
}

/// Frames sent from the pool to a worker on its command channel.
///
/// Notifications share the channel with submissions. The worker-side
/// router acts on `Notify` immediately and forwards `Run`/`Shutdown`
/// to the command loop, so per-worker order is preserved while
/// notifications are still handled mid-run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkerCommand {
    /// Handshake: snapshot of process-wide state and the init plan.
    Init {
        worker_id: usize,
        globals: HashMap<String, serde_json::Value>,
        /// Registered work keys to invoke once, in order, before
        /// accepting submissions.
        init_funcs: Vec<(String, serde_json::Value)>,
        log_level: Option<String>,
    },
    Run(SubmissionFrame),
    Notify {
        name: String,
        payload: serde_json::Value,
    },
    Shutdown,
}

/// Frames sent from a worker back to the pool on its result channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResultFrame {
    /// Handshake acknowledged; the worker process is up.
    Started,
    /// All init funcs have run; the worker accepts submissions.
    Loaded,
    /// Single-shot success.
    Value {
        id: SubmissionId,
        payload: serde_json::Value,
    },
    /// One produced item of a streaming submission.
    StreamValue {
        id: SubmissionId,
        payload: serde_json::Value,
    },
    /// Normal exhaustion of a streaming submission.
    StreamEnd { id: SubmissionId },
    /// The submission failed; `detail` is the error chain / panic text.
    Error {
        id: SubmissionId,
        kind: WorkErrorKind,
        message: String,
        detail: Option<String>,
    },
    /// The worker observed the cancel flag and aborted the submission.
    Cancelled { id: SubmissionId },
}

impl ResultFrame {
    /// The submission this frame belongs to, if any.
    pub fn submission_id(&self) -> Option<SubmissionId> {
        match self {
            ResultFrame::Started | ResultFrame::Loaded => None,
            ResultFrame::Value { id, .. }
            | ResultFrame::StreamValue { id, .. }
            | ResultFrame::StreamEnd { id }
            | ResultFrame::Error { id, .. }
            | ResultFrame::Cancelled { id } => Some(*id),
        }
    }

    /// Whether this frame completes its submission. Exactly one
    /// terminal frame is produced per submission.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ResultFrame::Value { .. }
                | ResultFrame::StreamEnd { .. }
                | ResultFrame::Error { .. }
                | ResultFrame::Cancelled { .. }
        )
    }
}

/// Write one frame as a JSON line and flush it.
pub fn write_frame<T: Serialize>(writer: &mut impl Write, frame: &T) -> io::Result<()> {
    let line = serde_json::to_string(frame).map_err(io::Error::other)?;
    writer.write_all(line.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()
}

/// Read one frame from a JSON line. Returns `Ok(None)` on EOF, which
/// on the result channel means the worker is gone.
pub fn read_frame<T: for<'de> Deserialize<'de>>(reader: &mut impl BufRead) -> io::Result<Option<T>> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    let frame = serde_json::from_str(line.trim_end()).map_err(io::Error::other)?;
    Ok(Some(frame))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_classification() {
        let value = ResultFrame::Value {
            id: 7,
            payload: serde_json::json!(5),
        };
        let stream = ResultFrame::StreamValue {
            id: 7,
            payload: serde_json::json!(5),
        };
        assert!(value.is_terminal());
        assert!(!stream.is_terminal());
        assert!(ResultFrame::StreamEnd { id: 7 }.is_terminal());
        assert!(ResultFrame::Cancelled { id: 7 }.is_terminal());
        assert!(!ResultFrame::Started.is_terminal());
        assert_eq!(value.submission_id(), Some(7));
        assert_eq!(ResultFrame::Loaded.submission_id(), None);
    }

    #[test]
    fn frames_survive_the_line_codec() {
        let mut buf = Vec::new();
        let run = WorkerCommand::Run(SubmissionFrame {
            id: 3,
            key: "add".into(),
            args: serde_json::json!([2, 3]),
            streaming: false,
        });
        write_frame(&mut buf, &run).unwrap();
        write_frame(&mut buf, &WorkerCommand::Shutdown).unwrap();

        let mut reader = io::BufReader::new(buf.as_slice());
        let first: WorkerCommand = read_frame(&mut reader).unwrap().unwrap();
        match first {
            WorkerCommand::Run(frame) => {
                assert_eq!(frame.id, 3);
                assert_eq!(frame.key, "add");
            }
            other => panic!("unexpected frame: {:?}", other),
        }
        let second: WorkerCommand = read_frame(&mut reader).unwrap().unwrap();
        assert!(matches!(second, WorkerCommand::Shutdown));
        let eof: Option<WorkerCommand> = read_frame(&mut reader).unwrap();
        assert!(eof.is_none());
    }
}
