//! # remote-futures
//!
//! Futures that resolve across process boundaries.
//!
//! A submitting process publishes work items to an append-only task stream;
//! independent worker processes consume them, and every task's lifecycle is
//! mirrored in a shared key/field store:
//!
//! ```text
//! Dispatcher --append--> Task Stream --read_group--> Worker
//!     |                                                |
//!     | status = NOT_STARTED              status, heartbeat, results
//!     v                                                v
//!  Shared State Store  <------- polling ------- RemoteFuture
//! ```
//!
//! Statuses only move forward (`NOT_STARTED -> RUNNING -> COMPLETE | ERROR`).
//! Workers prove liveness with heartbeats; a future that sees a running
//! task's heartbeat go stale declares the worker dead and records the failure
//! itself. Delivery is at-least-once: stream entries left pending by a dead
//! worker are reclaimed, and the claim rules make re-delivery idempotent.
//!
//! ## Crates
//!
//! - `remote-futures` (this crate): protocol, worker, dispatcher, futures.
//! - `remote-futures-store`: the [`StateStore`] and [`TaskStream`]
//!   capabilities with in-memory and Redis backends.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::time::Duration;
//! use remote_futures::Pool;
//!
//! # async fn example() -> remote_futures::Result<()> {
//! let pool = Pool::builder("demo")
//!     .function("square", |(x,): (i64,)| async move { Ok(x * x) })
//!     .start()
//!     .await?;
//!
//! let squares: Vec<i64> = pool
//!     .map("square", [(2,), (3,), (4,)])
//!     .await?
//!     .results(Some(Duration::from_secs(10)))
//!     .await?;
//! assert_eq!(squares, vec![4, 9, 16]);
//! pool.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature flags
//!
//! - `logging` (default): [`logging::init_logging`] on `tracing-subscriber`.
//! - `redis`: Redis backends and `pool::redis_backends`.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod function;
pub mod future;
pub mod heartbeat;
pub mod listener;
#[cfg(feature = "logging")]
pub mod logging;
pub mod namespace;
pub mod pool;
pub mod protocol;
mod transition;
pub mod worker;

pub use config::{FailurePolicy, ProtocolConfig};
pub use dispatcher::Dispatcher;
pub use error::{Error, Result};
pub use function::{FunctionRegistry, TaskContext};
pub use future::{MapHandle, RemoteFuture, TaskState};
pub use listener::{ListenerRegistry, StaticListenerRegistry, StoreListenerRegistry};
pub use namespace::{Application, OperationNamespace};
pub use pool::{Pool, PoolBuilder};
pub use protocol::{FailureKind, StreamMessage, TaskFailure, TaskStatus};
pub use remote_futures_store::{StateStore, StoreError, TaskStream};
pub use worker::{Worker, WorkerHandle};
