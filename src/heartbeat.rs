//! Heartbeats for running tasks.
//!
//! A [`HeartbeatMonitor`] is started by the worker right after it writes
//! RUNNING and stopped before the terminal write. Every tick it:
//!
//! 1. checks the operation's cancel marker and the task's status entry; a
//!    present marker or a vanished entry fires the task's cancellation token
//!    and ends the monitor,
//! 2. stops if the task is no longer RUNNING,
//! 3. otherwise writes `heartbeat[task_id] = now`.
//!
//! The first tick happens immediately. The monitor's task is aborted when the
//! monitor is dropped, so an aborted worker stops heartbeating at once.

use std::sync::Arc;
use std::time::Duration;

use remote_futures_store::{StateStore, StoreError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::namespace::OperationNamespace;
use crate::protocol::{encode_timestamp, unix_now, TaskStatus, CANCEL_FIELD};

/// Why a monitor loop ended on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatExit {
    /// The operation's cancel marker was found.
    Cancelled,
    /// The task's status entry disappeared (the operation was purged).
    Purged,
    /// The task left RUNNING (another party wrote a terminal state).
    LeftRunning,
}

/// Periodic heartbeat writer bound to one task.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    task_id: String,
    handle: JoinHandle<HeartbeatExit>,
}

impl HeartbeatMonitor {
    /// Starts heartbeating `task_id` every `period`.
    ///
    /// `task_cancel` is fired when the monitor observes that the operation
    /// was cancelled or purged.
    pub fn start(
        store: Arc<dyn StateStore>,
        namespace: OperationNamespace,
        task_id: impl Into<String>,
        period: Duration,
        task_cancel: CancellationToken,
    ) -> Self {
        let task_id = task_id.into();
        let handle = tokio::spawn(run(
            store,
            namespace,
            task_id.clone(),
            period,
            task_cancel,
        ));
        Self { task_id, handle }
    }

    /// Task this monitor heartbeats.
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Returns `true` once the loop has exited on its own.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stops heartbeating. No heartbeat write is started after this returns.
    pub fn stop(self) {
        // Drop aborts the loop.
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn run(
    store: Arc<dyn StateStore>,
    namespace: OperationNamespace,
    task_id: String,
    period: Duration,
    task_cancel: CancellationToken,
) -> HeartbeatExit {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match tick(store.as_ref(), &namespace, &task_id).await {
            Ok(None) => {}
            Ok(Some(exit)) => {
                if exit != HeartbeatExit::LeftRunning {
                    task_cancel.cancel();
                }
                tracing::debug!(
                    operation_id = %namespace.operation_id(),
                    task_id = %task_id,
                    ?exit,
                    "heartbeat stopped"
                );
                return exit;
            }
            Err(e) => {
                tracing::warn!(
                    operation_id = %namespace.operation_id(),
                    task_id = %task_id,
                    error = %e,
                    "heartbeat write failed"
                );
            }
        }
    }
}

async fn tick(
    store: &dyn StateStore,
    namespace: &OperationNamespace,
    task_id: &str,
) -> Result<Option<HeartbeatExit>, StoreError> {
    if store
        .read_field(&namespace.cancel_key(), CANCEL_FIELD)
        .await?
        .is_some()
    {
        return Ok(Some(HeartbeatExit::Cancelled));
    }
    match store.read_field(&namespace.status_key(), task_id).await? {
        None => return Ok(Some(HeartbeatExit::Purged)),
        Some(raw) if TaskStatus::decode(&raw) != Some(TaskStatus::Running) => {
            return Ok(Some(HeartbeatExit::LeftRunning));
        }
        Some(_) => {}
    }
    store
        .write_field(
            &namespace.heartbeat_key(),
            task_id,
            &encode_timestamp(unix_now()),
        )
        .await?;
    tracing::trace!(task_id = %task_id, "heartbeat");
    Ok(None)
}
