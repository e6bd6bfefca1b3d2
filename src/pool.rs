//! Scoped entry point.
//!
//! A [`Pool`] bundles a [`Dispatcher`] with zero or more local workers over
//! the same store and stream. [`Pool::shutdown`] disposes every outstanding
//! future and then terminates the workers gracefully.
//!
//! ```no_run
//! use remote_futures::Pool;
//!
//! # async fn example() -> remote_futures::Result<()> {
//! let pool = Pool::builder("demo")
//!     .function("add", |(a, b): (i64, i64)| async move { Ok(a + b) })
//!     .workers(2)
//!     .start()
//!     .await?;
//!
//! let sum: i64 = pool.submit("add", (3, 8)).await?.result(None).await?;
//! assert_eq!(sum, 11);
//! pool.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::sync::Arc;

use remote_futures_store::{InMemoryStateStore, InMemoryTaskStream, StateStore, TaskStream};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::ProtocolConfig;
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::function::{FunctionRegistry, TaskContext};
use crate::future::{MapHandle, RemoteFuture};
use crate::listener::{ListenerRegistry, StoreListenerRegistry};
use crate::namespace::Application;
use crate::worker::{Worker, WorkerHandle};

/// Builder for [`Pool`].
pub struct PoolBuilder {
    application: String,
    store: Option<Arc<dyn StateStore>>,
    stream: Option<Arc<dyn TaskStream>>,
    listeners: Option<Arc<dyn ListenerRegistry>>,
    functions: FunctionRegistry,
    config: Option<ProtocolConfig>,
    workers: usize,
}

impl std::fmt::Debug for PoolBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolBuilder")
            .field("application", &self.application)
            .field("functions", &self.functions)
            .field("config", &self.config)
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}

impl PoolBuilder {
    fn new(application: impl Into<String>) -> Self {
        Self {
            application: application.into(),
            store: None,
            stream: None,
            listeners: None,
            functions: FunctionRegistry::new(),
            config: None,
            workers: 1,
        }
    }

    /// Shared state store. Defaults to a fresh in-memory store.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Task stream. Defaults to a fresh in-memory stream.
    #[must_use]
    pub fn stream(mut self, stream: Arc<dyn TaskStream>) -> Self {
        self.stream = Some(stream);
        self
    }

    /// Listener registry gating submissions. Defaults to the store-backed
    /// registry.
    #[must_use]
    pub fn listener_registry(mut self, listeners: Arc<dyn ListenerRegistry>) -> Self {
        self.listeners = Some(listeners);
        self
    }

    /// Protocol configuration. Defaults to [`ProtocolConfig::load`].
    #[must_use]
    pub fn config(mut self, config: ProtocolConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Number of local workers. Zero makes a dispatch-only pool that relies
    /// on workers in other processes.
    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Replaces the function registry of the local workers.
    #[must_use]
    pub fn functions(mut self, functions: FunctionRegistry) -> Self {
        self.functions = functions;
        self
    }

    /// Registers a function with the local workers.
    #[must_use]
    pub fn function<A, R, F, Fut>(mut self, name: impl Into<String>, function: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        self.functions.register(name, function);
        self
    }

    /// Registers a context-aware function with the local workers.
    #[must_use]
    pub fn function_with_context<A, R, F, Fut>(
        mut self,
        name: impl Into<String>,
        function: F,
    ) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        self.functions.register_with_context(name, function);
        self
    }

    /// Starts the local workers and returns the pool.
    ///
    /// # Errors
    ///
    /// Fails on invalid names or configuration, or if a worker cannot join
    /// the stream.
    pub async fn start(self) -> Result<Pool> {
        let application = Application::new(self.application)?;
        let config = match self.config {
            Some(config) => {
                config.validate()?;
                config
            }
            None => ProtocolConfig::load()?,
        };
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryStateStore::new()) as Arc<dyn StateStore>);
        let stream = self
            .stream
            .unwrap_or_else(|| Arc::new(InMemoryTaskStream::new()) as Arc<dyn TaskStream>);
        let listeners = self.listeners.unwrap_or_else(|| {
            Arc::new(StoreListenerRegistry::new(
                Arc::clone(&store),
                config.listener_threshold(),
            )) as Arc<dyn ListenerRegistry>
        });

        let functions = Arc::new(self.functions);
        let mut workers = Vec::with_capacity(self.workers);
        for _ in 0..self.workers {
            let worker = Worker::new(
                application.clone(),
                Arc::clone(&store),
                Arc::clone(&stream),
                Arc::clone(&functions),
                config.clone(),
            );
            match worker.start().await {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    for started in workers {
                        started.terminate().await;
                    }
                    return Err(e);
                }
            }
        }

        let dispatcher = Dispatcher::new(
            application,
            Arc::clone(&store),
            Arc::clone(&stream),
            listeners,
            config,
        );
        tracing::info!(
            application = %dispatcher.application(),
            workers = workers.len(),
            "pool started"
        );
        Ok(Pool {
            dispatcher,
            workers,
            store,
            stream,
        })
    }
}

/// Dispatcher plus local workers.
pub struct Pool {
    dispatcher: Dispatcher,
    workers: Vec<WorkerHandle>,
    store: Arc<dyn StateStore>,
    stream: Arc<dyn TaskStream>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("dispatcher", &self.dispatcher)
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}

impl Pool {
    /// Starts building a pool for `application`.
    pub fn builder(application: impl Into<String>) -> PoolBuilder {
        PoolBuilder::new(application)
    }

    /// The pool's dispatcher.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Shared state store in use.
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Task stream in use.
    pub fn stream(&self) -> &Arc<dyn TaskStream> {
        &self.stream
    }

    /// Handles of the local workers.
    pub fn workers(&self) -> &[WorkerHandle] {
        &self.workers
    }

    /// See [`Dispatcher::submit`].
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::submit`].
    pub async fn submit<A: Serialize>(&self, function: &str, args: A) -> Result<RemoteFuture> {
        self.dispatcher.submit(function, args).await
    }

    /// See [`Dispatcher::map`].
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::map`].
    pub async fn map<A, I>(&self, function: &str, args: I) -> Result<MapHandle>
    where
        A: Serialize,
        I: IntoIterator<Item = A>,
    {
        self.dispatcher.map(function, args).await
    }

    /// Kills the local worker at `index` without its termination hook, as a
    /// crash would. Returns `false` if there is no such worker.
    pub fn kill_worker(&mut self, index: usize) -> bool {
        if index >= self.workers.len() {
            return false;
        }
        self.workers.remove(index).kill();
        true
    }

    /// Disposes outstanding futures, then terminates the local workers.
    ///
    /// # Errors
    ///
    /// Returns the first disposal failure; workers are terminated regardless.
    pub async fn shutdown(self) -> Result<()> {
        let purge = self.dispatcher.config().purge_on_close;
        let disposed = self.dispatcher.dispose_outstanding(purge).await;
        for worker in self.workers {
            worker.terminate().await;
        }
        tracing::info!(application = %self.dispatcher.application(), "pool stopped");
        disposed
    }
}

/// Connects a [`Pool`] builder to Redis for both the state store and the
/// stream.
///
/// The stream gets its own connection for blocking reads, so heartbeats and
/// status writes never queue behind a worker's `XREADGROUP`.
///
/// # Errors
///
/// Returns [`Error::Infrastructure`](crate::Error::Infrastructure) if the
/// connection fails.
#[cfg(feature = "redis")]
pub async fn redis_backends(
    url: &str,
    key_prefix: Option<&str>,
) -> Result<(Arc<dyn StateStore>, Arc<dyn TaskStream>)> {
    use remote_futures_store::redis::{connect, RedisStateStore, RedisTaskStream};

    let conn = connect(url).await?;
    let blocking = connect(url).await?;
    let mut store = RedisStateStore::with_connection(conn.clone());
    let mut stream = RedisTaskStream::with_connections(conn, blocking);
    if let Some(prefix) = key_prefix {
        store = store.with_prefix(prefix);
        stream = stream.with_prefix(prefix);
    }
    Ok((Arc::new(store), Arc::new(stream)))
}
