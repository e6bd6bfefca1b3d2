//! Task dispatch.
//!
//! [`Dispatcher::submit`] and [`Dispatcher::map`] create an operation, write
//! every task's NOT_STARTED status and only then publish the stream messages,
//! so a worker never claims a task whose status entry does not exist yet.
//! Both fail with [`Error::NoListener`] before touching the store if no worker
//! is listening.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use remote_futures_store::{StateStore, TaskStream};
use serde::Serialize;
use serde_json::Value;

use crate::config::ProtocolConfig;
use crate::error::{Error, Result};
use crate::future::{MapHandle, Operation, RemoteFuture};
use crate::listener::ListenerRegistry;
use crate::namespace::{new_id, Application, OperationNamespace};
use crate::protocol::{unix_now, StreamMessage, TaskStatus};

/// Publishes tasks for one application.
pub struct Dispatcher {
    application: Application,
    store: Arc<dyn StateStore>,
    stream: Arc<dyn TaskStream>,
    listeners: Arc<dyn ListenerRegistry>,
    config: ProtocolConfig,
    outstanding: Mutex<Vec<Weak<Operation>>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("application", &self.application)
            .field("outstanding", &self.outstanding.lock().len())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Creates a dispatcher. `listeners` gates every submission.
    pub fn new(
        application: Application,
        store: Arc<dyn StateStore>,
        stream: Arc<dyn TaskStream>,
        listeners: Arc<dyn ListenerRegistry>,
        config: ProtocolConfig,
    ) -> Self {
        Self {
            application,
            store,
            stream,
            listeners,
            config,
            outstanding: Mutex::new(Vec::new()),
        }
    }

    /// Application tasks are published for.
    pub fn application(&self) -> &Application {
        &self.application
    }

    /// Protocol configuration handed to every future.
    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// Publishes one call of `function` and returns its future.
    ///
    /// `args` is serialized to JSON; positional arguments are passed as a
    /// tuple, e.g. `(3, 8)`.
    ///
    /// # Errors
    ///
    /// [`Error::NoListener`] if no worker is listening (nothing is written),
    /// [`Error::Serialization`] for unserializable arguments, or
    /// [`Error::Infrastructure`] if the store or stream fails.
    pub async fn submit<A: Serialize>(&self, function: &str, args: A) -> Result<RemoteFuture> {
        let arguments = serde_json::to_value(args)?;
        self.ensure_listener().await?;

        let namespace = self.application.new_operation();
        let task_id = namespace.operation_id().to_string();
        self.publish(&namespace, function, vec![(task_id.clone(), arguments)])
            .await?;
        tracing::debug!(
            operation_id = %namespace.operation_id(),
            function = %function,
            "submitted task"
        );

        let operation = self.track(namespace, vec![task_id.clone()]);
        Ok(RemoteFuture::new(operation, task_id))
    }

    /// Publishes one call of `function` per element of `args`, all under one
    /// operation, and returns a handle over them in input order.
    ///
    /// An empty input returns an empty handle without touching the store.
    ///
    /// # Errors
    ///
    /// Same as [`submit`](Self::submit).
    pub async fn map<A, I>(&self, function: &str, args: I) -> Result<MapHandle>
    where
        A: Serialize,
        I: IntoIterator<Item = A>,
    {
        let arguments = args
            .into_iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<Value>, _>>()?;
        if arguments.is_empty() {
            return Ok(MapHandle::empty(self.config.failure_policy));
        }
        self.ensure_listener().await?;

        let namespace = self.application.new_operation();
        let tasks: Vec<(String, Value)> = arguments
            .into_iter()
            .map(|arguments| (new_id(), arguments))
            .collect();
        let task_ids: Vec<String> = tasks.iter().map(|(id, _)| id.clone()).collect();
        self.publish(&namespace, function, tasks).await?;
        tracing::debug!(
            operation_id = %namespace.operation_id(),
            function = %function,
            tasks = task_ids.len(),
            "submitted map"
        );

        let operation = self.track(namespace, task_ids);
        Ok(MapHandle::new(operation, self.config.failure_policy))
    }

    /// Disposes every operation whose handles are still alive.
    ///
    /// # Errors
    ///
    /// Returns the first disposal failure; the remaining operations are
    /// still attempted.
    pub async fn dispose_outstanding(&self, purge: bool) -> Result<()> {
        let operations: Vec<Arc<Operation>> = self
            .outstanding
            .lock()
            .drain(..)
            .filter_map(|weak| weak.upgrade())
            .collect();
        let mut first_error = None;
        for operation in operations {
            if let Err(e) = operation.dispose(purge).await {
                tracing::warn!(
                    operation_id = %operation.namespace().operation_id(),
                    error = %e,
                    "failed to dispose operation"
                );
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn ensure_listener(&self) -> Result<()> {
        if self.listeners.has_active_listener(&self.application).await? {
            Ok(())
        } else {
            tracing::debug!(application = %self.application, "no active listener");
            Err(Error::NoListener {
                application: self.application.name().to_string(),
            })
        }
    }

    /// Writes every NOT_STARTED status, then appends every message. On a
    /// failed append the status mapping is removed again.
    async fn publish(
        &self,
        namespace: &OperationNamespace,
        function: &str,
        tasks: Vec<(String, Value)>,
    ) -> Result<()> {
        let status_key = namespace.status_key();
        for (task_id, _) in &tasks {
            let created = self
                .store
                .write_field_if_absent(&status_key, task_id, &TaskStatus::NotStarted.encode())
                .await?;
            if !created {
                tracing::warn!(task_id = %task_id, "status already present, not resetting it");
            }
        }

        let stream = self.application.stream();
        for (task_id, arguments) in tasks {
            let message = StreamMessage {
                operation_id: namespace.operation_id().to_string(),
                task_id,
                function: function.to_string(),
                arguments,
                emitted_at: unix_now(),
            };
            let appended = match message.encode() {
                Ok(payload) => self.stream.append(&stream, &payload).await.map_err(Error::from),
                Err(e) => Err(Error::from(e)),
            };
            if let Err(e) = appended {
                if let Err(cleanup) = self.store.delete_key(&status_key).await {
                    tracing::warn!(
                        operation_id = %namespace.operation_id(),
                        error = %cleanup,
                        "failed to remove statuses of unpublished operation"
                    );
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn track(&self, namespace: OperationNamespace, task_ids: Vec<String>) -> Arc<Operation> {
        let operation = Operation::new(
            namespace,
            Arc::clone(&self.store),
            self.config.clone(),
            task_ids,
        );
        let mut outstanding = self.outstanding.lock();
        outstanding.retain(|weak| weak.strong_count() > 0);
        outstanding.push(Arc::downgrade(&operation));
        operation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::StaticListenerRegistry;
    use pretty_assertions::assert_eq;
    use remote_futures_store::{InMemoryStateStore, InMemoryTaskStream};

    fn dispatcher(
        listening: bool,
    ) -> (Dispatcher, Arc<InMemoryStateStore>, Arc<InMemoryTaskStream>) {
        let store = Arc::new(InMemoryStateStore::new());
        let stream = Arc::new(InMemoryTaskStream::new());
        let listeners = if listening {
            StaticListenerRegistry::always()
        } else {
            StaticListenerRegistry::never()
        };
        let dispatcher = Dispatcher::new(
            Application::new("app").unwrap(),
            store.clone(),
            stream.clone(),
            Arc::new(listeners),
            ProtocolConfig::fast(),
        );
        (dispatcher, store, stream)
    }

    #[tokio::test]
    async fn submit_writes_status_then_message() {
        let (dispatcher, store, stream) = dispatcher(true);
        let future = dispatcher.submit("add", (3, 8)).await.unwrap();
        assert_eq!(future.task_id(), future.operation_id());

        let status = store
            .read_field(&future.namespace().status_key(), future.task_id())
            .await
            .unwrap();
        assert_eq!(status, Some(b"0".to_vec()));
        assert_eq!(stream.len("app:tasks"), 1);

        stream.ensure_group("app:tasks", "app:workers").await.unwrap();
        let entry = stream
            .read_group("app:tasks", "app:workers", "w", std::time::Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        let message = StreamMessage::decode(&entry.payload).unwrap();
        assert_eq!(message.function, "add");
        assert_eq!(message.arguments, serde_json::json!([3, 8]));
        assert_eq!(message.task_id, future.task_id());
        future.close(false).await.unwrap();
    }

    #[tokio::test]
    async fn no_listener_writes_nothing() {
        let (dispatcher, store, stream) = dispatcher(false);
        let err = dispatcher.submit("add", (1, 2)).await.unwrap_err();
        assert!(matches!(err, Error::NoListener { .. }));
        assert!(err.is_retryable());
        assert!(store.keys().is_empty());
        assert!(stream.is_empty("app:tasks"));

        let err = dispatcher.map("square", [(2,), (3,)]).await.unwrap_err();
        assert!(matches!(err, Error::NoListener { .. }));
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn map_shares_one_operation() {
        let (dispatcher, store, stream) = dispatcher(true);
        let map = dispatcher
            .map("square", [(2,), (3,), (4,)])
            .await
            .unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(stream.len("app:tasks"), 3);
        let op = map.operation_id().unwrap().to_string();
        let statuses = store
            .read_all(&format!("app:{op}:status"))
            .await
            .unwrap();
        assert_eq!(statuses.len(), 3);
        for id in map.task_ids() {
            assert_eq!(statuses[id], b"0".to_vec());
        }
    }

    #[tokio::test]
    async fn empty_map_touches_nothing() {
        let (dispatcher, store, stream) = dispatcher(false);
        let map = dispatcher
            .map("square", Vec::<(i64,)>::new())
            .await
            .unwrap();
        assert!(map.is_empty());
        assert_eq!(map.results::<i64>(None).await.unwrap(), Vec::<i64>::new());
        assert!(store.keys().is_empty());
        assert!(stream.is_empty("app:tasks"));
    }

    #[tokio::test]
    async fn dispose_outstanding_purges_live_operations() {
        let (dispatcher, store, _stream) = dispatcher(true);
        let future = dispatcher.submit("add", (1, 1)).await.unwrap();
        let _map = dispatcher.map("square", [(5,)]).await.unwrap();
        dispatcher.dispose_outstanding(true).await.unwrap();
        assert!(store.keys().is_empty());
        assert!(matches!(
            future.result::<i64>(None).await,
            Err(Error::Cancelled { .. })
        ));
    }
}
