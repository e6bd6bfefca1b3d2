//! Future handles: client-side resolution of remote tasks.
//!
//! A [`RemoteFuture`] tracks one task, a [`MapHandle`] tracks every task of a
//! map operation. Both share an [`Operation`] that holds the local view of
//! each task and runs the polling tick:
//!
//! 1. read the operation's status mapping (one round trip for all tasks),
//! 2. COMPLETE / ERROR resolve with the stored result,
//! 3. RUNNING tasks have their heartbeat checked (one more round trip, only
//!    when some task is running). A heartbeat older than the staleness
//!    threshold, or no heartbeat for longer than the grace period, makes the
//!    future write ERROR `presumed_dead` itself,
//! 4. NOT_STARTED tasks escalate to ERROR `dispatch_timeout` when a dispatch
//!    timeout is configured and has elapsed,
//! 5. a missing status entry means the operation was purged: the task
//!    resolves as cancelled.
//!
//! Escalation is a conditional write: it only lands if the task still holds
//! the status the verdict was drawn from. Otherwise the future adopts
//! whatever terminal state won, so concurrent detectors and a worker
//! finishing late agree on a single outcome.
//!
//! # Disposal
//!
//! Closing (or dropping) the last open handle of an operation disposes it:
//! the cancel marker is published if some task is still pending, so workers
//! abort it, and the operation's keys are deleted unless `purge` is false.
//! Closing a [`MapHandle`] disposes the operation even if sub-handles remain.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use remote_futures_store::StateStore;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{FailurePolicy, ProtocolConfig};
use crate::error::{Error, Result};
use crate::namespace::OperationNamespace;
use crate::protocol::{
    decode_timestamp, encode_timestamp, unix_now, FailureKind, TaskFailure, TaskStatus,
    CANCEL_FIELD,
};
use crate::transition;

/// Local view of one task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskState {
    /// Not resolved yet; carries the last observed status.
    Pending(TaskStatus),
    /// Resolved successfully with the decoded result.
    Complete(Value),
    /// Resolved with an error.
    Failed(TaskFailure),
}

impl TaskState {
    /// Returns `true` once the task is resolved.
    pub fn is_resolved(&self) -> bool {
        !matches!(self, Self::Pending(_))
    }

    fn from_terminal(status: TaskStatus, result: Option<&Vec<u8>>) -> Self {
        match status {
            TaskStatus::Complete => Self::Complete(
                result
                    .map(|raw| {
                        serde_json::from_slice(raw).unwrap_or_else(|_| {
                            Value::String(String::from_utf8_lossy(raw).into_owned())
                        })
                    })
                    .unwrap_or(Value::Null),
            ),
            _ => Self::Failed(result.map_or_else(
                || TaskFailure::new(FailureKind::Execution, "task failed without a description"),
                |raw| TaskFailure::decode(raw),
            )),
        }
    }
}

struct TaskTracker {
    state: watch::Sender<TaskState>,
    dispatched_at: Instant,
    running_since: Option<Instant>,
}

impl TaskTracker {
    fn new() -> Self {
        let (state, _) = watch::channel(TaskState::Pending(TaskStatus::NotStarted));
        Self {
            state,
            dispatched_at: Instant::now(),
            running_since: None,
        }
    }

    fn is_resolved(&self) -> bool {
        self.state.borrow().is_resolved()
    }

    /// Sets a terminal state unless one is already set.
    fn resolve(&self, outcome: TaskState) -> bool {
        self.state.send_if_modified(|current| {
            if current.is_resolved() {
                false
            } else {
                *current = outcome;
                true
            }
        })
    }

    fn observe_running(&mut self) -> Instant {
        self.state.send_if_modified(|current| {
            if *current == TaskState::Pending(TaskStatus::NotStarted) {
                *current = TaskState::Pending(TaskStatus::Running);
                true
            } else {
                false
            }
        });
        *self.running_since.get_or_insert_with(Instant::now)
    }
}

/// Shared state of one dispatched operation.
pub struct Operation {
    namespace: OperationNamespace,
    store: Arc<dyn StateStore>,
    config: ProtocolConfig,
    task_ids: Vec<String>,
    tasks: Mutex<HashMap<String, TaskTracker>>,
    open_handles: AtomicUsize,
    disposed: AtomicBool,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("namespace", &self.namespace)
            .field("task_ids", &self.task_ids)
            .field("open_handles", &self.open_handles.load(Ordering::Relaxed))
            .field("disposed", &self.disposed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Operation {
    /// Tracks `task_ids` of the operation at `namespace`, all NOT_STARTED.
    pub(crate) fn new(
        namespace: OperationNamespace,
        store: Arc<dyn StateStore>,
        config: ProtocolConfig,
        task_ids: Vec<String>,
    ) -> Arc<Self> {
        let tasks = task_ids
            .iter()
            .map(|id| (id.clone(), TaskTracker::new()))
            .collect();
        Arc::new(Self {
            namespace,
            store,
            config,
            task_ids,
            tasks: Mutex::new(tasks),
            open_handles: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
            poller: Mutex::new(None),
        })
    }

    /// Keys of the operation.
    pub fn namespace(&self) -> &OperationNamespace {
        &self.namespace
    }

    /// Task ids in submission order.
    pub fn task_ids(&self) -> &[String] {
        &self.task_ids
    }

    /// Returns `true` once the operation has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn state_of(&self, task_id: &str) -> Option<TaskState> {
        self.tasks
            .lock()
            .get(task_id)
            .map(|tracker| tracker.state.borrow().clone())
    }

    fn all_resolved(&self, ids: &[String]) -> bool {
        let tasks = self.tasks.lock();
        ids.iter()
            .all(|id| tasks.get(id).is_none_or(TaskTracker::is_resolved))
    }

    fn resolve_local(&self, ids: &[String], failure: &TaskFailure) -> bool {
        let tasks = self.tasks.lock();
        let mut any = false;
        for id in ids {
            if let Some(tracker) = tasks.get(id) {
                any |= tracker.resolve(TaskState::Failed(failure.clone()));
            }
        }
        any
    }

    /// Runs one polling tick for the unresolved tasks among `ids`.
    async fn refresh(&self, ids: &[String]) -> Result<()> {
        let pending: Vec<String> = {
            let tasks = self.tasks.lock();
            ids.iter()
                .filter(|id| tasks.get(*id).is_some_and(|t| !t.is_resolved()))
                .cloned()
                .collect()
        };
        if pending.is_empty() {
            return Ok(());
        }

        let statuses = self.store.read_all(&self.namespace.status_key()).await?;
        let observed = |id: &String| statuses.get(id).and_then(|raw| TaskStatus::decode(raw));
        let heartbeats = if pending
            .iter()
            .any(|id| observed(id) == Some(TaskStatus::Running))
        {
            self.store.read_all(&self.namespace.heartbeat_key()).await?
        } else {
            HashMap::new()
        };
        let results = if pending
            .iter()
            .any(|id| observed(id).is_some_and(TaskStatus::is_terminal))
        {
            self.store.read_all(&self.namespace.results_key()).await?
        } else {
            HashMap::new()
        };

        let now = unix_now();
        let staleness = self.config.staleness_threshold().as_secs_f64();
        let mut escalations = Vec::new();
        {
            let mut tasks = self.tasks.lock();
            for id in &pending {
                let Some(tracker) = tasks.get_mut(id) else {
                    continue;
                };
                let Some(raw) = statuses.get(id) else {
                    tracing::debug!(task_id = %id, "status entry gone, operation purged");
                    tracker.resolve(TaskState::Failed(TaskFailure::new(
                        FailureKind::Cancelled,
                        "operation purged",
                    )));
                    continue;
                };
                match TaskStatus::decode(raw) {
                    None => {
                        tracing::warn!(task_id = %id, "unreadable task status");
                    }
                    Some(status @ (TaskStatus::Complete | TaskStatus::Error)) => {
                        tracker.resolve(TaskState::from_terminal(status, results.get(id)));
                    }
                    Some(TaskStatus::Running) => {
                        let since = tracker.observe_running();
                        match heartbeats.get(id).and_then(|raw| decode_timestamp(raw)) {
                            Some(beat) if now - beat > staleness => {
                                escalations.push((
                                    id.clone(),
                                    TaskStatus::Running,
                                    TaskFailure::new(
                                        FailureKind::PresumedDead,
                                        format!("no heartbeat for {:.1}s", now - beat),
                                    ),
                                ));
                            }
                            Some(_) => {}
                            None if since.elapsed() > self.config.heartbeat_grace() => {
                                escalations.push((
                                    id.clone(),
                                    TaskStatus::Running,
                                    TaskFailure::new(
                                        FailureKind::PresumedDead,
                                        format!(
                                            "running for {:.1}s without a heartbeat",
                                            since.elapsed().as_secs_f64()
                                        ),
                                    ),
                                ));
                            }
                            None => {}
                        }
                    }
                    Some(TaskStatus::NotStarted) => {
                        if let Some(timeout) = self.config.dispatch_timeout() {
                            if tracker.dispatched_at.elapsed() > timeout {
                                escalations.push((
                                    id.clone(),
                                    TaskStatus::NotStarted,
                                    TaskFailure::new(
                                        FailureKind::DispatchTimeout,
                                        format!("not claimed within {:.1}s", timeout.as_secs_f64()),
                                    ),
                                ));
                            }
                        }
                    }
                }
            }
        }

        for (task_id, observed, failure) in escalations {
            self.escalate(&task_id, observed, failure).await?;
        }
        Ok(())
    }

    /// Writes a synthesized terminal error for `task_id` if it still holds
    /// `observed`; otherwise adopts whatever state it moved to.
    async fn escalate(
        &self,
        task_id: &str,
        observed: TaskStatus,
        failure: TaskFailure,
    ) -> Result<()> {
        let declared = transition::resolve_from(
            self.store.as_ref(),
            &self.namespace,
            task_id,
            observed,
            TaskStatus::Error,
            &failure.encode(),
        )
        .await?;
        let outcome = if declared {
            tracing::warn!(
                operation_id = %self.namespace.operation_id(),
                task_id = %task_id,
                kind = ?failure.kind,
                reason = %failure.message,
                "declaring task failed"
            );
            TaskState::Failed(failure)
        } else {
            let current = self
                .store
                .read_field(&self.namespace.status_key(), task_id)
                .await?;
            match current.as_deref().map(TaskStatus::decode) {
                None => TaskState::Failed(TaskFailure::new(
                    FailureKind::Cancelled,
                    "operation purged",
                )),
                Some(Some(status)) if status.is_terminal() => {
                    let result = self
                        .store
                        .read_field(&self.namespace.results_key(), task_id)
                        .await?;
                    TaskState::from_terminal(status, result.as_ref())
                }
                Some(_) => {
                    tracing::debug!(task_id = %task_id, "task moved on, verdict withdrawn");
                    return Ok(());
                }
            }
        };
        if let Some(tracker) = self.tasks.lock().get(task_id) {
            tracker.resolve(outcome);
        }
        Ok(())
    }

    async fn wait(&self, ids: &[String], timeout: Option<Duration>) -> Result<()> {
        self.wait_until(ids, timeout, |op| op.all_resolved(ids)).await
    }

    /// Polls until `done` holds or `timeout` expires.
    async fn wait_until(
        &self,
        ids: &[String],
        timeout: Option<Duration>,
        done: impl Fn(&Self) -> bool,
    ) -> Result<()> {
        let started = Instant::now();
        let deadline = timeout.map(|t| started + t);
        loop {
            self.refresh(ids).await?;
            if done(self) {
                return Ok(());
            }
            let mut pause = self.config.poll_interval();
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Err(Error::WaitTimeout {
                        operation_id: self.namespace.operation_id().to_string(),
                        waited: started.elapsed(),
                    });
                }
                pause = pause.min(deadline - now);
            }
            tokio::time::sleep(pause).await;
        }
    }

    async fn publish_cancel(&self) -> Result<()> {
        self.store
            .write_field(
                &self.namespace.cancel_key(),
                CANCEL_FIELD,
                &encode_timestamp(unix_now()),
            )
            .await?;
        Ok(())
    }

    /// Publishes the cancel marker and resolves the pending tasks among `ids`
    /// locally as cancelled. Returns whether any was pending.
    async fn cancel(&self, ids: &[String]) -> Result<bool> {
        if self.all_resolved(ids) {
            return Ok(false);
        }
        self.publish_cancel().await?;
        tracing::info!(operation_id = %self.namespace.operation_id(), "operation cancelled");
        Ok(self.resolve_local(
            ids,
            &TaskFailure::new(FailureKind::Cancelled, "cancelled by caller"),
        ))
    }

    fn acquire(self: &Arc<Self>) {
        self.open_handles.fetch_add(1, Ordering::AcqRel);
    }

    /// Releases one handle; returns `true` if it was the last one.
    fn release(&self) -> bool {
        self.open_handles
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            == Ok(1)
    }

    /// Publishes the cancel marker for pending tasks and deletes the
    /// operation's keys when `purge` is set. Idempotent.
    pub(crate) async fn dispose(&self, purge: bool) -> Result<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(poller) = self.poller.lock().take() {
            poller.abort();
        }
        let all = self.task_ids.clone();
        if !self.all_resolved(&all) {
            self.publish_cancel().await?;
            self.resolve_local(
                &all,
                &TaskFailure::new(FailureKind::Cancelled, "operation closed"),
            );
        }
        if purge {
            for key in self.namespace.operation_keys() {
                self.store.delete_key(&key).await?;
            }
        }
        tracing::debug!(
            operation_id = %self.namespace.operation_id(),
            purge,
            "operation disposed"
        );
        Ok(())
    }

    /// Disposes from a synchronous context (handle drop).
    fn dispose_detached(self: Arc<Self>) {
        if self.is_disposed() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    let purge = self.config.purge_on_close;
                    if let Err(e) = self.dispose(purge).await {
                        tracing::warn!(
                            operation_id = %self.namespace.operation_id(),
                            error = %e,
                            "failed to dispose dropped operation"
                        );
                    }
                });
            }
            Err(_) => {
                tracing::debug!(
                    operation_id = %self.namespace.operation_id(),
                    "dropped outside a runtime, operation keys left in place"
                );
            }
        }
    }

    /// Starts the background poller driving subscriptions, once.
    fn ensure_poller(self: &Arc<Self>) {
        let mut poller = self.poller.lock();
        if poller.as_ref().is_some_and(|h| !h.is_finished()) || self.is_disposed() {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.poll_interval();
        *poller = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(op) = weak.upgrade() else {
                    break;
                };
                if op.is_disposed() || op.all_resolved(&op.task_ids) || !op.has_subscribers() {
                    break;
                }
                if let Err(e) = op.refresh(&op.task_ids).await {
                    tracing::warn!(
                        operation_id = %op.namespace.operation_id(),
                        error = %e,
                        "background poll failed"
                    );
                }
            }
        }));
    }

    fn has_subscribers(&self) -> bool {
        self.tasks
            .lock()
            .values()
            .any(|tracker| tracker.state.receiver_count() > 0)
    }

    fn subscribe(self: &Arc<Self>, task_id: &str) -> Option<watch::Receiver<TaskState>> {
        let receiver = self
            .tasks
            .lock()
            .get(task_id)
            .map(|tracker| tracker.state.subscribe())?;
        self.ensure_poller();
        Some(receiver)
    }
}

fn decode_outcome<T: DeserializeOwned>(task_id: &str, state: TaskState) -> Result<T> {
    match state {
        TaskState::Complete(value) => Ok(serde_json::from_value(value)?),
        TaskState::Failed(failure) => Err(Error::from_failure(task_id, failure)),
        TaskState::Pending(_) => Err(Error::Cancelled {
            task_id: task_id.to_string(),
        }),
    }
}

/// Handle to one remote task.
#[derive(Debug)]
pub struct RemoteFuture {
    operation: Arc<Operation>,
    task_id: String,
    closed: AtomicBool,
}

impl RemoteFuture {
    pub(crate) fn new(operation: Arc<Operation>, task_id: String) -> Self {
        operation.acquire();
        Self {
            operation,
            task_id,
            closed: AtomicBool::new(false),
        }
    }

    /// Task tracked by this handle.
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Operation the task belongs to.
    pub fn operation_id(&self) -> &str {
        self.operation.namespace.operation_id()
    }

    /// Keys of the owning operation.
    pub fn namespace(&self) -> &OperationNamespace {
        &self.operation.namespace
    }

    /// Last locally observed state, without polling.
    pub fn state(&self) -> TaskState {
        self.operation
            .state_of(&self.task_id)
            .unwrap_or(TaskState::Pending(TaskStatus::NotStarted))
    }

    /// Returns `true` once the task is resolved locally.
    pub fn is_resolved(&self) -> bool {
        self.state().is_resolved()
    }

    /// Runs one polling tick and returns the resulting state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Infrastructure`] if the store cannot be read.
    pub async fn poll_once(&self) -> Result<TaskState> {
        self.operation
            .refresh(std::slice::from_ref(&self.task_id))
            .await?;
        Ok(self.state())
    }

    /// Waits for the task to resolve, without decoding its outcome.
    ///
    /// # Errors
    ///
    /// [`Error::WaitTimeout`] if `timeout` expires first, or
    /// [`Error::Infrastructure`] on store failures.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<TaskState> {
        self.operation
            .wait(std::slice::from_ref(&self.task_id), timeout)
            .await?;
        Ok(self.state())
    }

    /// Waits for the task and returns its decoded result.
    ///
    /// `None` waits indefinitely. A wait timeout leaves the task untouched;
    /// the call may be retried.
    ///
    /// # Errors
    ///
    /// The task's stored failure (execution, presumed dead, dispatch timeout,
    /// interrupted, cancelled, unknown function), [`Error::WaitTimeout`],
    /// [`Error::Serialization`] if the result does not decode as `T`, or
    /// [`Error::Infrastructure`].
    pub async fn result<T: DeserializeOwned>(&self, timeout: Option<Duration>) -> Result<T> {
        let state = self.wait(timeout).await?;
        decode_outcome(&self.task_id, state)
    }

    /// Watches the task's state. A background poller keeps the receiver
    /// current until the task resolves or every receiver is dropped.
    ///
    /// Must be called within a Tokio runtime.
    pub fn subscribe(&self) -> watch::Receiver<TaskState> {
        self.operation
            .subscribe(&self.task_id)
            .unwrap_or_else(|| watch::channel(self.state()).1)
    }

    /// Publishes the operation's cancel marker and resolves this task locally
    /// as cancelled. Returns `false` if it had already resolved.
    ///
    /// The marker is operation-wide: sibling tasks of a map operation are
    /// cancelled on the workers as well.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Infrastructure`] if the marker cannot be written.
    pub async fn cancel(&self) -> Result<bool> {
        self.operation
            .cancel(std::slice::from_ref(&self.task_id))
            .await
    }

    /// Releases the handle. If it was the last open handle of the operation,
    /// the operation is disposed; `purge` decides whether its keys are
    /// deleted. Safe to call more than once.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Infrastructure`] if disposal fails.
    pub async fn close(&self, purge: bool) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.operation.release() {
            self.operation.dispose(purge).await?;
        }
        Ok(())
    }
}

impl Drop for RemoteFuture {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) && self.operation.release() {
            Arc::clone(&self.operation).dispose_detached();
        }
    }
}

/// Handle to every task of a map operation.
#[derive(Debug)]
pub struct MapHandle {
    operation: Option<Arc<Operation>>,
    failure_policy: FailurePolicy,
    closed: AtomicBool,
}

impl MapHandle {
    pub(crate) fn new(operation: Arc<Operation>, failure_policy: FailurePolicy) -> Self {
        operation.acquire();
        Self {
            operation: Some(operation),
            failure_policy,
            closed: AtomicBool::new(false),
        }
    }

    /// Handle over no tasks, returned for empty inputs.
    pub(crate) fn empty(failure_policy: FailurePolicy) -> Self {
        Self {
            operation: None,
            failure_policy,
            closed: AtomicBool::new(false),
        }
    }

    /// Overrides the bulk failure policy for this handle.
    #[must_use]
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Bulk failure policy in effect.
    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    /// Operation id, `None` for an empty map.
    pub fn operation_id(&self) -> Option<&str> {
        self.operation
            .as_ref()
            .map(|op| op.namespace.operation_id())
    }

    /// Task ids in submission order.
    pub fn task_ids(&self) -> &[String] {
        self.operation
            .as_ref()
            .map_or(&[] as &[String], |op| op.task_ids())
    }

    /// Number of tasks.
    pub fn len(&self) -> usize {
        self.task_ids().len()
    }

    /// Returns `true` for a map over no inputs.
    pub fn is_empty(&self) -> bool {
        self.task_ids().is_empty()
    }

    /// Local state of every task, in submission order.
    pub fn states(&self) -> Vec<TaskState> {
        let Some(op) = &self.operation else {
            return Vec::new();
        };
        op.task_ids
            .iter()
            .map(|id| {
                op.state_of(id)
                    .unwrap_or(TaskState::Pending(TaskStatus::NotStarted))
            })
            .collect()
    }

    /// Individually resolvable handle for the task at `index`. It shares the
    /// operation: closing it only releases it.
    pub fn future(&self, index: usize) -> Option<RemoteFuture> {
        let op = self.operation.as_ref()?;
        let task_id = op.task_ids.get(index)?.clone();
        Some(RemoteFuture::new(Arc::clone(op), task_id))
    }

    /// Converts into one handle per task. The operation is disposed when the
    /// last of them is released.
    ///
    /// After [`close`](Self::close) the handles still report the local view
    /// the operation was left in.
    pub fn into_futures(mut self) -> Vec<RemoteFuture> {
        let Some(op) = self.operation.take() else {
            return Vec::new();
        };
        let futures = op
            .task_ids
            .iter()
            .map(|id| RemoteFuture::new(Arc::clone(&op), id.clone()))
            .collect();
        // The map handle's own reference goes away without disposing; close
        // already gave it up.
        if !self.closed.swap(true, Ordering::AcqRel) {
            op.release();
        }
        futures
    }

    /// Waits for every task and returns the results in submission order.
    ///
    /// With [`FailurePolicy::WaitForAll`] the first error in submission order
    /// is returned once every task is terminal; with
    /// [`FailurePolicy::FailFast`] the first error observed is returned
    /// immediately.
    ///
    /// # Errors
    ///
    /// A task failure, [`Error::WaitTimeout`], [`Error::Serialization`] or
    /// [`Error::Infrastructure`].
    pub async fn results<T: DeserializeOwned>(&self, timeout: Option<Duration>) -> Result<Vec<T>> {
        let Some(op) = &self.operation else {
            return Ok(Vec::new());
        };
        let ids = op.task_ids.clone();
        match self.failure_policy {
            FailurePolicy::WaitForAll => op.wait(&ids, timeout).await?,
            FailurePolicy::FailFast => {
                op.wait_until(&ids, timeout, |op| {
                    op.all_resolved(&ids)
                        || ids
                            .iter()
                            .any(|id| matches!(op.state_of(id), Some(TaskState::Failed(_))))
                })
                .await?;
            }
        }
        let states = self.states();
        if let Some((id, failure)) = ids.iter().zip(&states).find_map(|(id, state)| match state {
            TaskState::Failed(failure) => Some((id, failure.clone())),
            _ => None,
        }) {
            return Err(Error::from_failure(id, failure));
        }
        ids.iter()
            .zip(states)
            .map(|(id, state)| decode_outcome(id, state))
            .collect()
    }

    /// Waits for every task and returns each outcome separately, in
    /// submission order.
    ///
    /// # Errors
    ///
    /// Only [`Error::WaitTimeout`] and [`Error::Infrastructure`]; task
    /// failures are reported per item.
    pub async fn results_per_item<T: DeserializeOwned>(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Vec<Result<T>>> {
        let Some(op) = &self.operation else {
            return Ok(Vec::new());
        };
        let ids = op.task_ids.clone();
        op.wait(&ids, timeout).await?;
        Ok(ids
            .iter()
            .zip(self.states())
            .map(|(id, state)| decode_outcome(id, state))
            .collect())
    }

    /// Watches the task at `index`. See [`RemoteFuture::subscribe`].
    pub fn subscribe(&self, index: usize) -> Option<watch::Receiver<TaskState>> {
        let op = self.operation.as_ref()?;
        let task_id = op.task_ids.get(index)?;
        op.subscribe(task_id)
    }

    /// Cancels every pending task. Returns whether any was pending.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Infrastructure`] if the marker cannot be written.
    pub async fn cancel(&self) -> Result<bool> {
        match &self.operation {
            Some(op) => op.cancel(&op.task_ids).await,
            None => Ok(false),
        }
    }

    /// Disposes the operation, including every sub-handle's view of it.
    /// Safe to call more than once.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Infrastructure`] if disposal fails.
    pub async fn close(&self, purge: bool) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(op) = &self.operation {
            op.release();
            op.dispose(purge).await?;
        }
        Ok(())
    }
}

impl Drop for MapHandle {
    fn drop(&mut self) {
        let Some(op) = self.operation.take() else {
            return;
        };
        if !self.closed.swap(true, Ordering::AcqRel) && op.release() {
            op.dispose_detached();
        }
    }
}
