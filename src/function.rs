//! Worker-side function registry.
//!
//! Stream messages name the function to run; each worker resolves that name
//! through a [`FunctionRegistry`]. Functions are ordinary async closures over
//! deserializable arguments that return `anyhow::Result` of a serializable
//! value. Positional arguments travel as a JSON array, so a function taking
//! `(i64, i64)` is called with `[3, 8]`.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Per-task execution context handed to context-aware functions.
#[derive(Debug, Clone)]
pub struct TaskContext {
    operation_id: String,
    task_id: String,
    cancellation: CancellationToken,
}

impl TaskContext {
    /// Creates a context. Workers build one per claimed task.
    pub fn new(
        operation_id: impl Into<String>,
        task_id: impl Into<String>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            operation_id: operation_id.into(),
            task_id: task_id.into(),
            cancellation,
        }
    }

    /// Operation the task belongs to.
    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    /// Task being executed.
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Returns `true` once the task has been cancelled or the worker is
    /// terminating.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Completes when the task is cancelled or the worker terminates.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await;
    }

    /// The underlying token, for handing to nested work.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }
}

type Handler =
    Arc<dyn Fn(Value, TaskContext) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Name-to-function table consulted by workers.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    handlers: HashMap<String, Handler>,
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("FunctionRegistry")
            .field("functions", &names)
            .finish()
    }
}

impl FunctionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `function` under `name`, replacing any previous entry.
    ///
    /// # Examples
    ///
    /// ```
    /// use remote_futures::function::FunctionRegistry;
    ///
    /// let mut registry = FunctionRegistry::new();
    /// registry.register("add", |(a, b): (i64, i64)| async move { Ok(a + b) });
    /// assert!(registry.contains("add"));
    /// ```
    pub fn register<A, R, F, Fut>(&mut self, name: impl Into<String>, function: F) -> &mut Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        self.register_with_context(name, move |args: A, _ctx: TaskContext| function(args))
    }

    /// Registers a function that also receives the [`TaskContext`], so it can
    /// observe cancellation at its own await points.
    pub fn register_with_context<A, R, F, Fut>(
        &mut self,
        name: impl Into<String>,
        function: F,
    ) -> &mut Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let name = name.into();
        let label = name.clone();
        let function = Arc::new(function);
        let handler: Handler = Arc::new(move |raw: Value, ctx: TaskContext| {
            let function = Arc::clone(&function);
            let label = label.clone();
            async move {
                let args: A = serde_json::from_value(raw)
                    .map_err(|e| anyhow::anyhow!("invalid arguments for {label}: {e}"))?;
                let value = function(args, ctx).await?;
                Ok::<Value, anyhow::Error>(serde_json::to_value(value)?)
            }
            .boxed()
        });
        self.handlers.insert(name, handler);
        self
    }

    /// Returns `true` if `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Starts `name` with serialized `arguments`. Returns `None` if nothing is
    /// registered under `name`.
    pub fn invoke(
        &self,
        name: &str,
        arguments: Value,
        ctx: TaskContext,
    ) -> Option<BoxFuture<'static, anyhow::Result<Value>>> {
        self.handlers.get(name).map(|handler| handler(arguments, ctx))
    }
}

/// Renders an error and its cause chain as one line.
pub(crate) fn describe_error(err: &anyhow::Error) -> String {
    format!("{err:#}")
}
