//! Wire-level protocol values shared by dispatchers, workers and futures.
//!
//! Everything stored in the shared state or published on the task stream is
//! encoded here, so any compliant implementation can interoperate:
//!
//! | Value | Encoding |
//! |-------|----------|
//! | status | ASCII decimal: `0` not started, `1` running, `2` complete, `3` error |
//! | heartbeat | Unix seconds as decimal text, e.g. `1760601600.123456` |
//! | success result | JSON of the returned value |
//! | failure result | JSON [`TaskFailure`]; any other text reads back as an execution failure |
//! | stream message | JSON [`StreamMessage`] |

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Field of the operation's cancel mapping; its value is the Unix time at
/// which cancellation was requested.
pub const CANCEL_FIELD: &str = "requested_at";

/// Task lifecycle status.
///
/// Transitions are monotonic along the numeric codes:
///
/// ```text
/// NotStarted(0) -> Running(1) -> Complete(2) | Error(3)
/// ```
///
/// A running task may be re-entered as running when its message is
/// reclaimed from a dead worker; terminal states accept nothing.
///
/// # Examples
///
/// ```
/// use remote_futures::protocol::TaskStatus;
///
/// assert!(TaskStatus::NotStarted.can_transition_to(TaskStatus::Running));
/// assert!(TaskStatus::Running.can_transition_to(TaskStatus::Error));
/// assert!(!TaskStatus::Complete.can_transition_to(TaskStatus::Running));
/// assert_eq!(TaskStatus::decode(b"2"), Some(TaskStatus::Complete));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Published, not yet claimed by a worker.
    NotStarted,
    /// Claimed and executing.
    Running,
    /// Finished successfully (terminal).
    Complete,
    /// Finished with an error (terminal).
    Error,
}

impl TaskStatus {
    /// All statuses in protocol order.
    pub const ALL: [Self; 4] = [Self::NotStarted, Self::Running, Self::Complete, Self::Error];

    /// Numeric protocol code.
    pub fn code(self) -> u8 {
        match self {
            Self::NotStarted => 0,
            Self::Running => 1,
            Self::Complete => 2,
            Self::Error => 3,
        }
    }

    /// Parses a numeric protocol code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::NotStarted),
            1 => Some(Self::Running),
            2 => Some(Self::Complete),
            3 => Some(Self::Error),
            _ => None,
        }
    }

    /// Encodes the status as stored in the status mapping.
    pub fn encode(self) -> Vec<u8> {
        self.code().to_string().into_bytes()
    }

    /// Decodes a stored status value. Returns `None` for anything that is
    /// not one of the four codes.
    pub fn decode(raw: &[u8]) -> Option<Self> {
        std::str::from_utf8(raw)
            .ok()
            .and_then(|s| s.trim().parse::<u8>().ok())
            .and_then(Self::from_code)
    }

    /// Returns `true` for `Complete` and `Error`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }

    /// Returns `true` if a reader may observe `next` after `self`.
    ///
    /// Codes never decrease and terminal states are final. The only
    /// self-transition allowed is `Running -> Running` (re-claim).
    pub fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::NotStarted => next != Self::NotStarted,
            Self::Running => next.code() >= Self::Running.code(),
            Self::Complete | Self::Error => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::Running => write!(f, "running"),
            Self::Complete => write!(f, "complete"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Category of a stored task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The function returned an error.
    Execution,
    /// A future declared the worker dead after its heartbeat went stale.
    PresumedDead,
    /// A future gave up on a task that was never claimed.
    DispatchTimeout,
    /// The worker was asked to terminate while running the task.
    Interrupted,
    /// The operation was cancelled.
    Cancelled,
    /// The worker has no function registered under the requested name.
    UnknownFunction,
}

/// Structured error description stored in the results mapping of a task
/// whose status is `Error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// Failure category.
    pub kind: FailureKind,
    /// Human-readable description.
    pub message: String,
}

impl TaskFailure {
    /// Creates a failure description.
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Encodes the failure for the results mapping.
    pub fn encode(&self) -> Vec<u8> {
        // Serializing a struct of an enum and a string cannot fail.
        serde_json::to_vec(self).unwrap_or_else(|_| self.message.clone().into_bytes())
    }

    /// Decodes a stored failure. Text that is not a JSON failure record is
    /// taken verbatim as an execution error message.
    pub fn decode(raw: &[u8]) -> Self {
        serde_json::from_slice(raw).unwrap_or_else(|_| {
            Self::new(FailureKind::Execution, String::from_utf8_lossy(raw).into_owned())
        })
    }
}

/// One published unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMessage {
    /// Operation the task belongs to.
    pub operation_id: String,
    /// Task identifier, unique within the operation.
    pub task_id: String,
    /// Name the worker's function registry resolves.
    pub function: String,
    /// Serialized arguments; positional tuples serialize as arrays.
    pub arguments: Value,
    /// Unix seconds at publish time.
    pub emitted_at: f64,
}

impl StreamMessage {
    /// Encodes the message as a stream payload.
    ///
    /// # Errors
    ///
    /// Fails only if `arguments` holds values JSON cannot represent.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decodes a stream payload.
    ///
    /// # Errors
    ///
    /// Returns the JSON error for malformed payloads.
    pub fn decode(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }
}

/// Current time as fractional Unix seconds.
pub fn unix_now() -> f64 {
    let now = chrono::Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1_000_000.0
}

/// Encodes a Unix timestamp for the heartbeat and liveness mappings.
pub fn encode_timestamp(ts: f64) -> Vec<u8> {
    format!("{ts:.6}").into_bytes()
}

/// Decodes a stored Unix timestamp.
pub fn decode_timestamp(raw: &[u8]) -> Option<f64> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|ts| ts.is_finite())
}
