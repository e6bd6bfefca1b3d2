//! Stream consumer that executes tasks.
//!
//! A [`Worker`] joins the application's consumer group and runs every message
//! it receives through the claim rules:
//!
//! | Observed state | Action |
//! |----------------|--------|
//! | status entry absent (operation purged) | acknowledge, skip |
//! | cancel marker present | NOT_STARTED becomes ERROR `cancelled`; acknowledge |
//! | COMPLETE or ERROR | acknowledge, skip |
//! | RUNNING, fresh heartbeat | leave pending, skip |
//! | NOT_STARTED, or RUNNING with stale heartbeat | execute |
//!
//! Executing means writing RUNNING, heartbeating through a
//! [`HeartbeatMonitor`], invoking the registered function and writing
//! the result followed by the terminal status. Each of these status writes
//! is conditional on the task still being NOT_STARTED or RUNNING at that
//! instant, so a terminal state written by someone else in the meantime (a
//! future that presumed this worker dead) is never overwritten.
//!
//! Entries left pending by crashed workers are reclaimed on a fixed interval
//! once they have been idle long enough.
//!
//! # Termination
//!
//! [`WorkerHandle::terminate`] is the graceful-termination hook: in-flight
//! tasks are cancelled, recorded as ERROR `interrupted` and left
//! unacknowledged, unless their operation was cancelled, in which case they are
//! acknowledged. [`WorkerHandle::kill`] aborts everything without running the
//! hook, as a process crash would.

use std::sync::Arc;

use remote_futures_store::{StateStore, StoreError, StreamEntry, TaskStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::ProtocolConfig;
use crate::error::Result;
use crate::function::{describe_error, FunctionRegistry, TaskContext};
use crate::heartbeat::HeartbeatMonitor;
use crate::listener::ListenerBeacon;
use crate::namespace::{new_id, Application, OperationNamespace};
use crate::protocol::{
    decode_timestamp, unix_now, FailureKind, StreamMessage, TaskFailure, TaskStatus, CANCEL_FIELD,
};
use crate::transition;

/// Worker configuration and collaborators. Call [`Worker::start`] to run it.
pub struct Worker {
    inner: Inner,
}

struct Inner {
    application: Application,
    worker_id: String,
    store: Arc<dyn StateStore>,
    stream: Arc<dyn TaskStream>,
    functions: Arc<FunctionRegistry>,
    config: ProtocolConfig,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("application", &self.inner.application)
            .field("worker_id", &self.inner.worker_id)
            .field("functions", &self.inner.functions)
            .finish_non_exhaustive()
    }
}

/// How one execution ended.
enum Outcome {
    Returned(anyhow::Result<serde_json::Value>),
    Stopped,
}

impl Worker {
    /// Creates a worker with a random id.
    pub fn new(
        application: Application,
        store: Arc<dyn StateStore>,
        stream: Arc<dyn TaskStream>,
        functions: Arc<FunctionRegistry>,
        config: ProtocolConfig,
    ) -> Self {
        Self {
            inner: Inner {
                application,
                worker_id: new_id(),
                store,
                stream,
                functions,
                config,
            },
        }
    }

    /// Overrides the consumer name used in the group and liveness mapping.
    #[must_use]
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.inner.worker_id = worker_id.into();
        self
    }

    /// Consumer name of this worker.
    pub fn worker_id(&self) -> &str {
        &self.inner.worker_id
    }

    /// Joins the consumer group, publishes liveness and starts consuming.
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid or the consumer group cannot be
    /// created.
    pub async fn start(self) -> Result<WorkerHandle> {
        let inner = Arc::new(self.inner);
        inner.config.validate()?;
        inner
            .stream
            .ensure_group(&inner.application.stream(), &inner.application.group())
            .await?;

        let beacon = Arc::new(ListenerBeacon::new(
            Arc::clone(&inner.store),
            &inner.application,
            inner.worker_id.clone(),
        ));
        // Liveness is visible before start returns.
        beacon.beat().await?;

        let shutdown = CancellationToken::new();
        tracing::info!(
            application = %inner.application,
            worker_id = %inner.worker_id,
            functions = ?inner.functions.names(),
            max_concurrency = inner.config.max_concurrency,
            "worker started"
        );
        let worker_id = inner.worker_id.clone();
        let join = tokio::spawn(supervise(inner, beacon, shutdown.clone()));
        Ok(WorkerHandle {
            worker_id,
            shutdown,
            join: Some(join),
        })
    }
}

/// Handle to a running worker.
///
/// Dropping the handle requests graceful termination without waiting for it.
#[derive(Debug)]
pub struct WorkerHandle {
    worker_id: String,
    shutdown: CancellationToken,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Consumer name of the worker.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Token cancelled when termination is requested.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Returns `true` once the worker loop has exited.
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Runs the graceful-termination hook and waits for in-flight tasks to
    /// settle.
    pub async fn terminate(mut self) {
        self.shutdown.cancel();
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                tracing::warn!(worker_id = %self.worker_id, error = %e, "worker loop panicked");
            }
        }
    }

    /// Aborts the worker immediately without the termination hook. Running
    /// tasks stop heartbeating and keep their RUNNING status, and their
    /// stream entries stay pending.
    pub fn kill(mut self) {
        if let Some(join) = self.join.take() {
            join.abort();
        }
        tracing::info!(worker_id = %self.worker_id, "worker killed");
    }

    /// Requests termination on Ctrl-C or, on Unix, SIGTERM.
    pub fn install_signal_hook(&self) -> JoinHandle<()> {
        let shutdown = self.shutdown.clone();
        let worker_id = self.worker_id.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = shutdown.cancelled() => return,
                () = termination_signal() => {}
            }
            tracing::info!(worker_id = %worker_id, "termination signal received");
            shutdown.cancel();
        })
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if self.join.is_some() {
            self.shutdown.cancel();
        }
    }
}

#[cfg(unix)]
async fn termination_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "cannot listen for SIGTERM, falling back to Ctrl-C");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn termination_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Aborts the wrapped task on drop.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn supervise(inner: Arc<Inner>, beacon: Arc<ListenerBeacon>, shutdown: CancellationToken) {
    let semaphore = Arc::new(Semaphore::new(inner.config.max_concurrency));
    let mut tasks: JoinSet<()> = JoinSet::new();
    let beacon_stop = CancellationToken::new();
    let mut beacon_task = AbortOnDrop(
        Arc::clone(&beacon).spawn(inner.config.heartbeat_period(), beacon_stop.clone()),
    );

    let mut reclaim = tokio::time::interval(inner.config.reclaim_interval());
    reclaim.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut read = Box::pin(next_entry(Arc::clone(&inner), Arc::clone(&semaphore)));
    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            _ = reclaim.tick() => {
                if let Err(e) = reclaim_idle(&inner, &semaphore, &mut tasks, &shutdown).await {
                    tracing::warn!(worker_id = %inner.worker_id, error = %e, "reclaim failed");
                }
            }
            (permit, entry) = &mut read => {
                if let (Some(permit), Some(entry)) = (permit, entry) {
                    let inner = Arc::clone(&inner);
                    let shutdown = shutdown.clone();
                    tasks.spawn(async move {
                        let _permit = permit;
                        process(&inner, entry, &shutdown).await;
                    });
                }
                read.set(next_entry(Arc::clone(&inner), Arc::clone(&semaphore)));
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    tracing::error!(worker_id = %inner.worker_id, error = %e, "task runner panicked");
                }
            }
        }
    }

    tracing::info!(
        worker_id = %inner.worker_id,
        in_flight = tasks.len(),
        "worker terminating"
    );
    tracing::debug!(
        worker_id = %inner.worker_id,
        "abandoning in-flight stream read, any entry it received stays pending"
    );
    drop(read);
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            tracing::error!(worker_id = %inner.worker_id, error = %e, "task runner panicked");
        }
    }
    beacon_stop.cancel();
    if let Err(e) = (&mut beacon_task.0).await {
        tracing::debug!(worker_id = %inner.worker_id, error = %e, "liveness task ended abnormally");
    }
    if let Err(e) = beacon.remove().await {
        tracing::warn!(worker_id = %inner.worker_id, error = %e, "failed to remove liveness");
    }
    tracing::info!(worker_id = %inner.worker_id, "worker stopped");
}

/// Waits for capacity, then reads one entry. Read failures are logged and
/// yield `None` after a back-off.
async fn next_entry(
    inner: Arc<Inner>,
    semaphore: Arc<Semaphore>,
) -> (Option<OwnedSemaphorePermit>, Option<StreamEntry>) {
    let Ok(permit) = semaphore.acquire_owned().await else {
        return (None, None);
    };
    let stream = inner.application.stream();
    let group = inner.application.group();
    match inner
        .stream
        .read_group(&stream, &group, &inner.worker_id, inner.config.read_block())
        .await
    {
        Ok(entry) => (Some(permit), entry),
        Err(StoreError::NotFound { .. }) => {
            tracing::warn!(stream = %stream, group = %group, "consumer group missing, recreating");
            if let Err(e) = inner.stream.ensure_group(&stream, &group).await {
                tracing::warn!(error = %e, "failed to recreate consumer group");
                tokio::time::sleep(inner.config.read_block()).await;
            }
            (Some(permit), None)
        }
        Err(e) => {
            tracing::warn!(worker_id = %inner.worker_id, error = %e, "stream read failed");
            tokio::time::sleep(inner.config.read_block()).await;
            (Some(permit), None)
        }
    }
}

/// Claims entries other consumers left pending for too long.
async fn reclaim_idle(
    inner: &Arc<Inner>,
    semaphore: &Arc<Semaphore>,
    tasks: &mut JoinSet<()>,
    shutdown: &CancellationToken,
) -> std::result::Result<(), StoreError> {
    let stream = inner.application.stream();
    let group = inner.application.group();
    let min_idle = inner.config.reclaim_idle();
    let pending = inner
        .stream
        .pending_older_than(&stream, &group, min_idle, inner.config.max_concurrency)
        .await?;
    if pending.is_empty() {
        return Ok(());
    }
    let ids: Vec<String> = pending.into_iter().map(|p| p.id).collect();
    let claimed = inner
        .stream
        .claim(&stream, &group, &inner.worker_id, min_idle, &ids)
        .await?;
    for entry in claimed {
        tracing::info!(
            worker_id = %inner.worker_id,
            entry_id = %entry.id,
            "reclaimed idle stream entry"
        );
        let inner = Arc::clone(inner);
        let semaphore = Arc::clone(semaphore);
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return;
            };
            if shutdown.is_cancelled() {
                tracing::debug!(entry_id = %entry.id, "terminating, reclaimed entry stays pending");
                return;
            }
            process(&inner, entry, &shutdown).await;
        });
    }
    Ok(())
}

/// Applies the claim rules to one entry and executes it if due.
async fn process(inner: &Inner, entry: StreamEntry, shutdown: &CancellationToken) {
    let message = match StreamMessage::decode(&entry.payload) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(entry_id = %entry.id, error = %e, "dropping malformed stream message");
            acknowledge(inner, &entry.id).await;
            return;
        }
    };
    let namespace = match inner.application.operation(message.operation_id.clone()) {
        Ok(namespace) => namespace,
        Err(e) => {
            tracing::warn!(entry_id = %entry.id, error = %e, "dropping stream message");
            acknowledge(inner, &entry.id).await;
            return;
        }
    };
    if let Err(e) = claim_and_run(inner, &namespace, &entry, &message, shutdown).await {
        // Entry stays pending and is reclaimed later.
        tracing::warn!(
            operation_id = %message.operation_id,
            task_id = %message.task_id,
            error = %e,
            "task processing failed"
        );
    }
}

async fn claim_and_run(
    inner: &Inner,
    namespace: &OperationNamespace,
    entry: &StreamEntry,
    message: &StreamMessage,
    shutdown: &CancellationToken,
) -> std::result::Result<(), StoreError> {
    let store = inner.store.as_ref();
    let task_id = message.task_id.as_str();

    let Some(raw_status) = store.read_field(&namespace.status_key(), task_id).await? else {
        tracing::debug!(task_id = %task_id, "operation purged, skipping");
        acknowledge(inner, &entry.id).await;
        return Ok(());
    };
    let Some(status) = TaskStatus::decode(&raw_status) else {
        tracing::warn!(task_id = %task_id, "unreadable task status, skipping");
        acknowledge(inner, &entry.id).await;
        return Ok(());
    };

    if cancel_requested(store, namespace).await? {
        if status == TaskStatus::NotStarted {
            let failure = TaskFailure::new(FailureKind::Cancelled, "operation cancelled");
            finish(inner, namespace, task_id, TaskStatus::Error, &failure.encode()).await?;
        }
        acknowledge(inner, &entry.id).await;
        return Ok(());
    }

    match status {
        TaskStatus::Complete | TaskStatus::Error => {
            tracing::debug!(task_id = %task_id, %status, "duplicate delivery of finished task");
            acknowledge(inner, &entry.id).await;
            return Ok(());
        }
        TaskStatus::Running => {
            let heartbeat = store
                .read_field(&namespace.heartbeat_key(), task_id)
                .await?
                .and_then(|raw| decode_timestamp(&raw));
            let threshold = inner.config.staleness_threshold().as_secs_f64();
            if heartbeat.is_some_and(|ts| unix_now() - ts <= threshold) {
                tracing::debug!(task_id = %task_id, "task still owned by a live worker");
                return Ok(());
            }
            tracing::info!(task_id = %task_id, "re-running task abandoned by a dead worker");
        }
        TaskStatus::NotStarted => {}
    }

    execute(inner, namespace, entry, message, shutdown).await
}

async fn execute(
    inner: &Inner,
    namespace: &OperationNamespace,
    entry: &StreamEntry,
    message: &StreamMessage,
    shutdown: &CancellationToken,
) -> std::result::Result<(), StoreError> {
    let store = Arc::clone(&inner.store);
    let task_id = message.task_id.as_str();
    if shutdown.is_cancelled() {
        tracing::debug!(task_id = %task_id, "terminating, leaving entry pending for another worker");
        return Ok(());
    }

    if !transition::mark_running(store.as_ref(), namespace, task_id).await? {
        tracing::debug!(task_id = %task_id, "task resolved before it could start");
        acknowledge(inner, &entry.id).await;
        return Ok(());
    }
    tracing::info!(
        operation_id = %message.operation_id,
        task_id = %task_id,
        function = %message.function,
        worker_id = %inner.worker_id,
        "task claimed"
    );

    let task_token = shutdown.child_token();
    let monitor = HeartbeatMonitor::start(
        Arc::clone(&store),
        namespace.clone(),
        task_id,
        inner.config.heartbeat_period(),
        task_token.clone(),
    );

    let ctx = TaskContext::new(&message.operation_id, task_id, task_token.clone());
    let Some(call) = inner
        .functions
        .invoke(&message.function, message.arguments.clone(), ctx)
    else {
        monitor.stop();
        tracing::warn!(task_id = %task_id, function = %message.function, "unknown function");
        let failure = TaskFailure::new(
            FailureKind::UnknownFunction,
            format!("no function registered as {:?}", message.function),
        );
        finish(inner, namespace, task_id, TaskStatus::Error, &failure.encode()).await?;
        acknowledge(inner, &entry.id).await;
        return Ok(());
    };

    let outcome = tokio::select! {
        biased;
        () = task_token.cancelled() => Outcome::Stopped,
        result = call => Outcome::Returned(result),
    };
    monitor.stop();

    match outcome {
        Outcome::Returned(Ok(value)) => {
            let payload = serde_json::to_vec(&value)
                .map_err(|e| StoreError::Protocol { message: e.to_string() })?;
            finish(inner, namespace, task_id, TaskStatus::Complete, &payload).await?;
            tracing::info!(task_id = %task_id, "task complete");
            acknowledge(inner, &entry.id).await;
        }
        Outcome::Returned(Err(e)) => {
            let failure = TaskFailure::new(FailureKind::Execution, describe_error(&e));
            finish(inner, namespace, task_id, TaskStatus::Error, &failure.encode()).await?;
            tracing::info!(task_id = %task_id, error = %failure.message, "task failed");
            acknowledge(inner, &entry.id).await;
        }
        Outcome::Stopped => {
            if cancel_requested(store.as_ref(), namespace).await?
                || store
                    .read_field(&namespace.status_key(), task_id)
                    .await?
                    .is_none()
            {
                let failure = TaskFailure::new(FailureKind::Cancelled, "operation cancelled");
                finish(inner, namespace, task_id, TaskStatus::Error, &failure.encode()).await?;
                tracing::info!(task_id = %task_id, "task cancelled");
                acknowledge(inner, &entry.id).await;
            } else {
                let failure = TaskFailure::new(
                    FailureKind::Interrupted,
                    format!("worker {} terminated while running the task", inner.worker_id),
                );
                finish(inner, namespace, task_id, TaskStatus::Error, &failure.encode()).await?;
                // Left pending on purpose: the stream redelivers it.
                tracing::info!(task_id = %task_id, "task interrupted by termination");
            }
        }
    }
    Ok(())
}

async fn cancel_requested(
    store: &dyn StateStore,
    namespace: &OperationNamespace,
) -> std::result::Result<bool, StoreError> {
    Ok(store
        .read_field(&namespace.cancel_key(), CANCEL_FIELD)
        .await?
        .is_some())
}

/// Writes the result, then the terminal status, unless the task already
/// reached a terminal state or the operation was purged.
async fn finish(
    inner: &Inner,
    namespace: &OperationNamespace,
    task_id: &str,
    status: TaskStatus,
    payload: &[u8],
) -> std::result::Result<(), StoreError> {
    let store = inner.store.as_ref();
    if transition::resolve(store, namespace, task_id, status, payload).await? {
        return Ok(());
    }
    match store.read_field(&namespace.status_key(), task_id).await? {
        None => tracing::debug!(task_id = %task_id, "operation purged, dropping outcome"),
        Some(raw) => tracing::warn!(
            task_id = %task_id,
            current = ?TaskStatus::decode(&raw),
            attempted = %status,
            "task already resolved elsewhere, keeping existing outcome"
        ),
    }
    Ok(())
}

async fn acknowledge(inner: &Inner, entry_id: &str) {
    let stream = inner.application.stream();
    let group = inner.application.group();
    if let Err(e) = inner.stream.acknowledge(&stream, &group, entry_id).await {
        tracing::warn!(entry_id = %entry_id, error = %e, "acknowledge failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode_timestamp;
    use pretty_assertions::assert_eq;
    use remote_futures_store::{InMemoryStateStore, InMemoryTaskStream};
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        store: Arc<InMemoryStateStore>,
        stream: Arc<InMemoryTaskStream>,
        app: Application,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: Arc::new(InMemoryStateStore::new()),
                stream: Arc::new(InMemoryTaskStream::new()),
                app: Application::new("app").unwrap(),
            }
        }

        fn worker(&self) -> Worker {
            let mut functions = FunctionRegistry::new();
            functions
                .register("add", |(a, b): (i64, i64)| async move { Ok(a + b) })
                .register("boom", |(): ()| async move {
                    Err::<(), _>(anyhow::anyhow!("RuntimeError: boom"))
                })
                .register("sleep", |(ms,): (u64,)| async move {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(ms)
                });
            Worker::new(
                self.app.clone(),
                self.store.clone(),
                self.stream.clone(),
                Arc::new(functions),
                ProtocolConfig::fast(),
            )
        }

        async fn publish(&self, function: &str, args: serde_json::Value) -> OperationNamespace {
            let ns = self.app.new_operation();
            self.store
                .write_field(&ns.status_key(), ns.operation_id(), &TaskStatus::NotStarted.encode())
                .await
                .unwrap();
            let message = StreamMessage {
                operation_id: ns.operation_id().to_string(),
                task_id: ns.operation_id().to_string(),
                function: function.to_string(),
                arguments: args,
                emitted_at: unix_now(),
            };
            self.stream
                .append(&self.app.stream(), &message.encode().unwrap())
                .await
                .unwrap();
            ns
        }

        async fn status(&self, ns: &OperationNamespace) -> Option<TaskStatus> {
            self.store
                .read_field(&ns.status_key(), ns.operation_id())
                .await
                .unwrap()
                .and_then(|raw| TaskStatus::decode(&raw))
        }

        async fn result(&self, ns: &OperationNamespace) -> Option<Vec<u8>> {
            self.store
                .read_field(&ns.results_key(), ns.operation_id())
                .await
                .unwrap()
        }

        async fn wait_for(&self, ns: &OperationNamespace, wanted: TaskStatus) {
            for _ in 0..200 {
                if self.status(ns).await == Some(wanted) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("task never reached {wanted}");
        }
    }

    #[tokio::test]
    async fn executes_and_acknowledges() {
        let fx = Fixture::new();
        let handle = fx.worker().start().await.unwrap();
        let ns = fx.publish("add", json!([3, 8])).await;
        fx.wait_for(&ns, TaskStatus::Complete).await;
        assert_eq!(fx.result(&ns).await.unwrap(), b"11".to_vec());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fx.stream.pending_count(&fx.app.stream(), &fx.app.group()), 0);
        handle.terminate().await;
    }

    #[tokio::test]
    async fn function_error_is_recorded() {
        let fx = Fixture::new();
        let handle = fx.worker().start().await.unwrap();
        let ns = fx.publish("boom", serde_json::Value::Null).await;
        fx.wait_for(&ns, TaskStatus::Error).await;
        let failure = TaskFailure::decode(&fx.result(&ns).await.unwrap());
        assert_eq!(failure.kind, FailureKind::Execution);
        assert!(failure.message.contains("boom"));
        handle.terminate().await;
    }

    #[tokio::test]
    async fn unknown_function_is_recorded() {
        let fx = Fixture::new();
        let handle = fx.worker().start().await.unwrap();
        let ns = fx.publish("nope", json!([])).await;
        fx.wait_for(&ns, TaskStatus::Error).await;
        let failure = TaskFailure::decode(&fx.result(&ns).await.unwrap());
        assert_eq!(failure.kind, FailureKind::UnknownFunction);
        handle.terminate().await;
    }

    #[tokio::test]
    async fn purged_operation_is_skipped() {
        let fx = Fixture::new();
        let ns = fx.publish("add", json!([1, 1])).await;
        fx.store.delete_key(&ns.status_key()).await.unwrap();
        let handle = fx.worker().start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fx.status(&ns).await, None);
        assert_eq!(fx.stream.pending_count(&fx.app.stream(), &fx.app.group()), 0);
        handle.terminate().await;
    }

    #[tokio::test]
    async fn cancelled_before_start_is_not_run() {
        let fx = Fixture::new();
        let ns = fx.publish("add", json!([1, 1])).await;
        fx.store
            .write_field(&ns.cancel_key(), CANCEL_FIELD, &encode_timestamp(unix_now()))
            .await
            .unwrap();
        let handle = fx.worker().start().await.unwrap();
        fx.wait_for(&ns, TaskStatus::Error).await;
        let failure = TaskFailure::decode(&fx.result(&ns).await.unwrap());
        assert_eq!(failure.kind, FailureKind::Cancelled);
        handle.terminate().await;
    }

    #[tokio::test]
    async fn fresh_running_task_is_left_alone() {
        let fx = Fixture::new();
        let ns = fx.publish("add", json!([1, 1])).await;
        fx.store
            .write_field(&ns.status_key(), ns.operation_id(), &TaskStatus::Running.encode())
            .await
            .unwrap();
        fx.store
            .write_field(&ns.heartbeat_key(), ns.operation_id(), &encode_timestamp(unix_now()))
            .await
            .unwrap();
        let handle = fx.worker().start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fx.status(&ns).await, Some(TaskStatus::Running));
        assert_eq!(fx.stream.pending_count(&fx.app.stream(), &fx.app.group()), 1);
        handle.kill();
    }

    #[tokio::test]
    async fn stale_running_task_is_rerun() {
        let fx = Fixture::new();
        let ns = fx.publish("add", json!([2, 2])).await;
        fx.store
            .write_field(&ns.status_key(), ns.operation_id(), &TaskStatus::Running.encode())
            .await
            .unwrap();
        fx.store
            .write_field(
                &ns.heartbeat_key(),
                ns.operation_id(),
                &encode_timestamp(unix_now() - 60.0),
            )
            .await
            .unwrap();
        let handle = fx.worker().start().await.unwrap();
        fx.wait_for(&ns, TaskStatus::Complete).await;
        assert_eq!(fx.result(&ns).await.unwrap(), b"4".to_vec());
        handle.terminate().await;
    }

    #[tokio::test]
    async fn terminal_status_written_elsewhere_is_kept() {
        let fx = Fixture::new();
        let handle = fx.worker().start().await.unwrap();
        let ns = fx.publish("sleep", json!([150])).await;
        fx.wait_for(&ns, TaskStatus::Running).await;
        let presumed = TaskFailure::new(FailureKind::PresumedDead, "stale");
        fx.store
            .write_field(&ns.results_key(), ns.operation_id(), &presumed.encode())
            .await
            .unwrap();
        fx.store
            .write_field(&ns.status_key(), ns.operation_id(), &TaskStatus::Error.encode())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(fx.status(&ns).await, Some(TaskStatus::Error));
        assert_eq!(
            TaskFailure::decode(&fx.result(&ns).await.unwrap()).kind,
            FailureKind::PresumedDead
        );
        handle.terminate().await;
    }

    #[tokio::test]
    async fn terminate_interrupts_and_leaves_entry_pending() {
        let fx = Fixture::new();
        let handle = fx.worker().start().await.unwrap();
        let ns = fx.publish("sleep", json!([5_000])).await;
        fx.wait_for(&ns, TaskStatus::Running).await;
        handle.terminate().await;

        assert_eq!(fx.status(&ns).await, Some(TaskStatus::Error));
        let failure = TaskFailure::decode(&fx.result(&ns).await.unwrap());
        assert_eq!(failure.kind, FailureKind::Interrupted);
        assert_eq!(fx.stream.pending_count(&fx.app.stream(), &fx.app.group()), 1);
        assert!(!fx.store.contains_key(&fx.app.listeners_key()));
    }

    #[tokio::test]
    async fn cancel_marker_stops_running_task() {
        let fx = Fixture::new();
        let handle = fx.worker().start().await.unwrap();
        let ns = fx.publish("sleep", json!([5_000])).await;
        fx.wait_for(&ns, TaskStatus::Running).await;
        fx.store
            .write_field(&ns.cancel_key(), CANCEL_FIELD, &encode_timestamp(unix_now()))
            .await
            .unwrap();
        fx.wait_for(&ns, TaskStatus::Error).await;
        let failure = TaskFailure::decode(&fx.result(&ns).await.unwrap());
        assert_eq!(failure.kind, FailureKind::Cancelled);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fx.stream.pending_count(&fx.app.stream(), &fx.app.group()), 0);
        handle.terminate().await;
    }

    #[tokio::test]
    async fn kill_stops_heartbeats() {
        let fx = Fixture::new();
        let handle = fx.worker().start().await.unwrap();
        let ns = fx.publish("sleep", json!([5_000])).await;
        fx.wait_for(&ns, TaskStatus::Running).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.kill();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let last = fx
            .store
            .read_field(&ns.heartbeat_key(), ns.operation_id())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        let later = fx
            .store
            .read_field(&ns.heartbeat_key(), ns.operation_id())
            .await
            .unwrap();
        assert_eq!(last, later);
        assert_eq!(fx.status(&ns).await, Some(TaskStatus::Running));
    }

    #[tokio::test]
    async fn reclaims_entries_of_dead_consumers() {
        let fx = Fixture::new();
        fx.stream
            .ensure_group(&fx.app.stream(), &fx.app.group())
            .await
            .unwrap();
        let ns = fx.publish("add", json!([5, 5])).await;
        // A consumer that read the entry and died before touching the status.
        let taken = fx
            .stream
            .read_group(&fx.app.stream(), &fx.app.group(), "ghost", Duration::ZERO)
            .await
            .unwrap();
        assert!(taken.is_some());

        let handle = fx.worker().start().await.unwrap();
        fx.wait_for(&ns, TaskStatus::Complete).await;
        assert_eq!(fx.result(&ns).await.unwrap(), b"10".to_vec());
        handle.terminate().await;
    }

    #[tokio::test]
    async fn malformed_messages_are_dropped() {
        let fx = Fixture::new();
        let handle = fx.worker().start().await.unwrap();
        fx.stream
            .append(&fx.app.stream(), b"{not json")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fx.stream.pending_count(&fx.app.stream(), &fx.app.group()), 0);
        handle.terminate().await;
    }

    #[tokio::test]
    async fn liveness_is_published_while_running() {
        let fx = Fixture::new();
        let handle = fx.worker().with_worker_id("w-1").start().await.unwrap();
        assert_eq!(handle.worker_id(), "w-1");
        assert!(fx
            .store
            .read_field(&fx.app.listeners_key(), "w-1")
            .await
            .unwrap()
            .is_some());
        handle.terminate().await;
        assert!(fx
            .store
            .read_field(&fx.app.listeners_key(), "w-1")
            .await
            .unwrap()
            .is_none());
    }
}
