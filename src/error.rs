//! Error types surfaced by dispatchers, future handles and workers.

use std::time::Duration;

use remote_futures_store::StoreError;
use thiserror::Error;

use crate::protocol::{FailureKind, TaskFailure};

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the protocol.
///
/// Variants fall into three groups:
///
/// - **Terminal task outcomes** (`TaskExecution`, `WorkerPresumedDead`,
///   `DispatchTimeout`, `Interrupted`, `Cancelled`, `UnknownFunction`) are
///   stored in the shared state and surfaced by
///   [`RemoteFuture::result`](crate::future::RemoteFuture::result).
/// - **Retryable conditions** (`NoListener`, `WaitTimeout`) are raised
///   without touching task state.
/// - **Substrate failures** (`Infrastructure`) mean the coordination store
///   or stream could not be reached; they say nothing about the task.
#[derive(Debug, Error)]
pub enum Error {
    /// No worker is listening for the application.
    #[error("no active listener for application {application}")]
    NoListener {
        /// Application that was checked.
        application: String,
    },

    /// The function raised an error on the worker.
    #[error("task {task_id} failed: {message}")]
    TaskExecution {
        /// Failed task.
        task_id: String,
        /// Worker-provided error description.
        message: String,
    },

    /// The task's heartbeat went stale; its worker is presumed dead.
    #[error("task {task_id}: worker presumed dead ({message})")]
    WorkerPresumedDead {
        /// Abandoned task.
        task_id: String,
        /// Detection details.
        message: String,
    },

    /// The task never left NOT_STARTED within the dispatch timeout.
    #[error("task {task_id} was never picked up ({message})")]
    DispatchTimeout {
        /// Task that was never claimed.
        task_id: String,
        /// Detection details.
        message: String,
    },

    /// The worker received a termination request while running the task.
    #[error("task {task_id} interrupted: {message}")]
    Interrupted {
        /// Interrupted task.
        task_id: String,
        /// Interruption details.
        message: String,
    },

    /// The operation was cancelled before the task finished.
    #[error("task {task_id} cancelled")]
    Cancelled {
        /// Cancelled task.
        task_id: String,
    },

    /// No worker function is registered under the requested name.
    #[error("task {task_id}: {message}")]
    UnknownFunction {
        /// Task referencing the missing function.
        task_id: String,
        /// Error details naming the function.
        message: String,
    },

    /// The caller's bounded wait expired; task state is unaffected.
    #[error("timed out after {waited:?} waiting for operation {operation_id}")]
    WaitTimeout {
        /// Operation being waited on.
        operation_id: String,
        /// How long the caller waited.
        waited: Duration,
    },

    /// The coordination store or stream failed.
    #[error("coordination substrate error: {0}")]
    Infrastructure(#[from] StoreError),

    /// Arguments or results could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid or inconsistent configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// An application name or identifier cannot be used in storage keys.
    #[error("invalid namespace component {component:?}: {reason}")]
    InvalidNamespace {
        /// The rejected value.
        component: String,
        /// Why it was rejected.
        reason: &'static str,
    },
}

impl Error {
    /// Returns `true` for conditions the caller may retry without side
    /// effects (`NoListener`, `WaitTimeout`).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NoListener { .. } | Self::WaitTimeout { .. })
    }

    /// Returns `true` if this error describes a terminal task outcome
    /// recorded in the shared state.
    pub fn is_task_failure(&self) -> bool {
        matches!(
            self,
            Self::TaskExecution { .. }
                | Self::WorkerPresumedDead { .. }
                | Self::DispatchTimeout { .. }
                | Self::Interrupted { .. }
                | Self::Cancelled { .. }
                | Self::UnknownFunction { .. }
        )
    }

    /// Reconstructs the caller-facing error from a stored failure.
    pub fn from_failure(task_id: &str, failure: TaskFailure) -> Self {
        let task_id = task_id.to_string();
        let message = failure.message;
        match failure.kind {
            FailureKind::Execution => Self::TaskExecution { task_id, message },
            FailureKind::PresumedDead => Self::WorkerPresumedDead { task_id, message },
            FailureKind::DispatchTimeout => Self::DispatchTimeout { task_id, message },
            FailureKind::Interrupted => Self::Interrupted { task_id, message },
            FailureKind::Cancelled => Self::Cancelled { task_id },
            FailureKind::UnknownFunction => Self::UnknownFunction { task_id, message },
        }
    }
}
