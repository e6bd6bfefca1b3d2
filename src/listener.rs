//! Listener liveness.
//!
//! Every running worker refreshes its own field of the application's
//! liveness mapping (`{application}:listeners`) once per heartbeat period.
//! Dispatchers consult a [`ListenerRegistry`] before publishing: if nobody
//! refreshed recently the submit fails fast with
//! [`Error::NoListener`](crate::Error::NoListener) instead of queueing work
//! no one will pick up. The check is a hint; a worker may still die right
//! after it.
//!
//! The check never writes. A stale field is skipped, not deleted, so a check
//! racing with a worker's refresh cannot remove a fresh liveness entry.
//! Fields disappear when their worker stops.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use remote_futures_store::{StateStore, StoreError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::namespace::Application;
use crate::protocol::{decode_timestamp, encode_timestamp, unix_now};

/// Answers whether some worker is listening for an application.
#[async_trait]
pub trait ListenerRegistry: Send + Sync {
    /// Returns `true` if at least one listener refreshed its liveness
    /// recently.
    async fn has_active_listener(&self, application: &Application) -> Result<bool>;
}

/// Registry backed by the liveness mapping in the shared state store.
pub struct StoreListenerRegistry {
    store: Arc<dyn StateStore>,
    threshold: Duration,
}

impl std::fmt::Debug for StoreListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreListenerRegistry")
            .field("threshold", &self.threshold)
            .finish_non_exhaustive()
    }
}

impl StoreListenerRegistry {
    /// Treats listeners whose timestamp is older than `threshold` as gone.
    pub fn new(store: Arc<dyn StateStore>, threshold: Duration) -> Self {
        Self { store, threshold }
    }
}

#[async_trait]
impl ListenerRegistry for StoreListenerRegistry {
    async fn has_active_listener(&self, application: &Application) -> Result<bool> {
        let listeners = self.store.read_all(&application.listeners_key()).await?;
        let now = unix_now();
        let threshold = self.threshold.as_secs_f64();
        let active = listeners.values().any(|raw| {
            decode_timestamp(raw).is_some_and(|ts| now - ts <= threshold)
        });
        if !active && !listeners.is_empty() {
            tracing::debug!(
                application = %application,
                stale = listeners.len(),
                "only stale listeners registered"
            );
        }
        Ok(active)
    }
}

/// Registry with a fixed answer.
#[derive(Debug, Clone, Copy)]
pub struct StaticListenerRegistry {
    active: bool,
}

impl StaticListenerRegistry {
    /// Always reports an active listener.
    pub fn always() -> Self {
        Self { active: true }
    }

    /// Never reports an active listener.
    pub fn never() -> Self {
        Self { active: false }
    }
}

#[async_trait]
impl ListenerRegistry for StaticListenerRegistry {
    async fn has_active_listener(&self, _application: &Application) -> Result<bool> {
        Ok(self.active)
    }
}

/// Worker-side liveness writer.
pub struct ListenerBeacon {
    store: Arc<dyn StateStore>,
    key: String,
    worker_id: String,
}

impl std::fmt::Debug for ListenerBeacon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerBeacon")
            .field("key", &self.key)
            .field("worker_id", &self.worker_id)
            .finish_non_exhaustive()
    }
}

impl ListenerBeacon {
    /// Beacon for `worker_id` listening on `application`.
    pub fn new(
        store: Arc<dyn StateStore>,
        application: &Application,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            key: application.listeners_key(),
            worker_id: worker_id.into(),
        }
    }

    /// Writes the current time as this worker's liveness.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn beat(&self) -> std::result::Result<(), StoreError> {
        self.store
            .write_field(&self.key, &self.worker_id, &encode_timestamp(unix_now()))
            .await
    }

    /// Removes this worker's liveness field.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn remove(&self) -> std::result::Result<bool, StoreError> {
        self.store.delete_field(&self.key, &self.worker_id).await
    }

    /// Beats every `period` until `stop` is cancelled. The caller removes the
    /// field afterwards if the shutdown is graceful.
    pub fn spawn(self: Arc<Self>, period: Duration, stop: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    () = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.beat().await {
                            tracing::warn!(worker_id = %self.worker_id, error = %e, "liveness write failed");
                        }
                    }
                }
            }
        })
    }
}
