//! Protocol tunables.
//!
//! Configuration can be loaded from:
//! 1. TOML file (`.remote-futures.toml`)
//! 2. Environment variables (with `REMOTE_FUTURES_` prefix)
//!
//! Environment variables override TOML configuration.
//!
//! # Example TOML Configuration
//!
//! ```toml
//! [protocol]
//! heartbeat_period_ms = 1000
//! staleness_threshold_ms = 5000
//! poll_interval_ms = 250
//! max_concurrency = 4
//! failure_policy = "fail_fast"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default configuration file name, looked up in the working directory.
pub const CONFIG_FILE: &str = ".remote-futures.toml";

const ENV_PREFIX: &str = "REMOTE_FUTURES_";

/// How a bulk wait over a map operation treats task errors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Wait until every task is terminal, then report the first error in
    /// submission order.
    #[default]
    WaitForAll,
    /// Report the first error as soon as it is observed.
    FailFast,
}

impl std::str::FromStr for FailurePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "wait_for_all" => Ok(Self::WaitForAll),
            "fail_fast" => Ok(Self::FailFast),
            other => Err(Error::Config(format!("unknown failure policy {other:?}"))),
        }
    }
}

/// Timing and behaviour of the task-state protocol.
///
/// All durations are stored in milliseconds; the accessor methods return
/// [`Duration`]s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Heartbeat period `P` for running tasks and worker liveness.
    pub heartbeat_period_ms: u64,

    /// Staleness threshold `T` after which a running task's worker is
    /// presumed dead.
    pub staleness_threshold_ms: u64,

    /// How long a future tolerates a RUNNING task without any heartbeat.
    pub heartbeat_grace_ms: u64,

    /// Escalate NOT_STARTED tasks to ERROR after this long. Disabled when
    /// unset.
    pub dispatch_timeout_ms: Option<u64>,

    /// Future polling interval.
    pub poll_interval_ms: u64,

    /// A listener is active if its liveness timestamp is younger than this.
    pub listener_threshold_ms: u64,

    /// Pending stream entries idle longer than this are reclaimed.
    pub reclaim_idle_ms: u64,

    /// How often a worker scans for reclaimable entries.
    pub reclaim_interval_ms: u64,

    /// Maximum time a worker blocks on one stream read.
    pub read_block_ms: u64,

    /// Concurrent tasks per worker.
    pub max_concurrency: usize,

    /// Bulk wait policy for map operations.
    pub failure_policy: FailurePolicy,

    /// Whether disposing a future deletes its operation keys.
    pub purge_on_close: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            heartbeat_period_ms: 1000,
            staleness_threshold_ms: 5000,
            heartbeat_grace_ms: 5000,
            dispatch_timeout_ms: None,
            poll_interval_ms: 250,
            listener_threshold_ms: 5000,
            reclaim_idle_ms: 30_000,
            reclaim_interval_ms: 5000,
            read_block_ms: 1000,
            max_concurrency: 1,
            failure_policy: FailurePolicy::WaitForAll,
            purge_on_close: true,
        }
    }
}

impl ProtocolConfig {
    /// Load configuration from file and environment.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. TOML configuration file
    /// 3. Default values
    ///
    /// # Errors
    ///
    /// Fails if the file exists but does not parse, or if the resulting
    /// configuration does not validate.
    pub fn load() -> Result<Self> {
        let mut config = if let Ok(contents) = std::fs::read_to_string(CONFIG_FILE) {
            Self::from_toml(&contents)?
        } else {
            Self::default()
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path, then apply environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or parsed, or does not validate.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("cannot read {}: {e}", path.as_ref().display()))
        })?;
        let mut config = Self::from_toml(&contents)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML content (the `[protocol]` table).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for malformed TOML or mistyped fields.
    pub fn from_toml(content: &str) -> Result<Self> {
        #[derive(Deserialize)]
        struct FullConfig {
            #[serde(default)]
            protocol: ProtocolConfig,
        }

        let full: FullConfig =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        Ok(full.protocol)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(format!("{ENV_PREFIX}{name}")).ok())
    }

    /// Applies overrides from a lookup of upper-case field names.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        fn parse<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T> {
            raw.trim()
                .parse()
                .map_err(|_| Error::Config(format!("{ENV_PREFIX}{name}: invalid value {raw:?}")))
        }

        fn set<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            name: &str,
            field: &mut T,
        ) -> Result<()> {
            if let Some(raw) = lookup(name) {
                *field = parse(name, &raw)?;
            }
            Ok(())
        }

        set(&lookup, "HEARTBEAT_PERIOD_MS", &mut self.heartbeat_period_ms)?;
        set(&lookup, "STALENESS_THRESHOLD_MS", &mut self.staleness_threshold_ms)?;
        set(&lookup, "HEARTBEAT_GRACE_MS", &mut self.heartbeat_grace_ms)?;
        set(&lookup, "POLL_INTERVAL_MS", &mut self.poll_interval_ms)?;
        set(&lookup, "LISTENER_THRESHOLD_MS", &mut self.listener_threshold_ms)?;
        set(&lookup, "RECLAIM_IDLE_MS", &mut self.reclaim_idle_ms)?;
        set(&lookup, "RECLAIM_INTERVAL_MS", &mut self.reclaim_interval_ms)?;
        set(&lookup, "READ_BLOCK_MS", &mut self.read_block_ms)?;
        set(&lookup, "MAX_CONCURRENCY", &mut self.max_concurrency)?;
        set(&lookup, "PURGE_ON_CLOSE", &mut self.purge_on_close)?;

        if let Some(raw) = lookup("DISPATCH_TIMEOUT_MS") {
            self.dispatch_timeout_ms = match raw.trim() {
                "" | "0" | "none" | "off" => None,
                value => Some(parse("DISPATCH_TIMEOUT_MS", value)?),
            };
        }
        if let Some(raw) = lookup("FAILURE_POLICY") {
            self.failure_policy = raw.parse()?;
        }
        Ok(())
    }

    /// Rejects inconsistent timing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if any period is zero, if `T <= P`, or if
    /// the worker has no concurrency.
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("heartbeat_period_ms", self.heartbeat_period_ms),
            ("staleness_threshold_ms", self.staleness_threshold_ms),
            ("poll_interval_ms", self.poll_interval_ms),
            ("listener_threshold_ms", self.listener_threshold_ms),
            ("reclaim_interval_ms", self.reclaim_interval_ms),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be greater than zero")));
            }
        }
        if self.staleness_threshold_ms <= self.heartbeat_period_ms {
            return Err(Error::Config(format!(
                "staleness_threshold_ms ({}) must exceed heartbeat_period_ms ({})",
                self.staleness_threshold_ms, self.heartbeat_period_ms
            )));
        }
        if self.listener_threshold_ms <= self.heartbeat_period_ms {
            return Err(Error::Config(format!(
                "listener_threshold_ms ({}) must exceed heartbeat_period_ms ({})",
                self.listener_threshold_ms, self.heartbeat_period_ms
            )));
        }
        if self.max_concurrency == 0 {
            return Err(Error::Config(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.staleness_threshold_ms < 3 * self.heartbeat_period_ms {
            tracing::warn!(
                staleness_threshold_ms = self.staleness_threshold_ms,
                heartbeat_period_ms = self.heartbeat_period_ms,
                "staleness threshold below three heartbeat periods; slow writes may be taken for dead workers"
            );
        }
        Ok(())
    }

    /// Heartbeat period `P`.
    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.heartbeat_period_ms)
    }

    /// Staleness threshold `T`.
    pub fn staleness_threshold(&self) -> Duration {
        Duration::from_millis(self.staleness_threshold_ms)
    }

    /// Missing-heartbeat grace period.
    pub fn heartbeat_grace(&self) -> Duration {
        Duration::from_millis(self.heartbeat_grace_ms)
    }

    /// Dispatch timeout, if escalation is enabled.
    pub fn dispatch_timeout(&self) -> Option<Duration> {
        self.dispatch_timeout_ms.map(Duration::from_millis)
    }

    /// Future polling interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Listener liveness threshold.
    pub fn listener_threshold(&self) -> Duration {
        Duration::from_millis(self.listener_threshold_ms)
    }

    /// Minimum idle time before a pending entry is reclaimed.
    pub fn reclaim_idle(&self) -> Duration {
        Duration::from_millis(self.reclaim_idle_ms)
    }

    /// Reclaim scan interval.
    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_millis(self.reclaim_interval_ms)
    }

    /// Maximum blocking time of one stream read.
    pub fn read_block(&self) -> Duration {
        Duration::from_millis(self.read_block_ms)
    }

    /// Short timings suitable for tests and local development.
    pub fn fast() -> Self {
        Self {
            heartbeat_period_ms: 50,
            staleness_threshold_ms: 300,
            heartbeat_grace_ms: 300,
            poll_interval_ms: 20,
            listener_threshold_ms: 300,
            reclaim_idle_ms: 500,
            reclaim_interval_ms: 100,
            read_block_ms: 50,
            ..Self::default()
        }
    }
}
