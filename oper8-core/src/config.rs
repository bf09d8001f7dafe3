//! Process-wide configuration for the watch/scheduler/leader-election/logging/retry
//! surface. Deserialized with `serde` from a layered source (environment variables
//! prefixed `OPER8_`, falling back to defaults) and validated eagerly at construction.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be >= {minimum}, got {actual}")]
    TooSmall { field: &'static str, minimum: u64, actual: u64 },
    #[error("{field} must be > 0")]
    MustBePositive { field: &'static str },
    #[error("failed to parse environment configuration: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaderElectionMode {
    Disabled,
    LeaderForLife,
    LeaderWithLease,
    Annotation,
}

/// Watch-stream reconnection policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Server-side long-poll timeout advertised to the API server (~1h default).
    pub server_timeout: Duration,
    /// Client-side timeout forcing reconnection before the server-side one fires.
    pub client_timeout: Duration,
    /// Consecutive failures tolerated before the watch is declared fatally broken.
    pub retry_budget: u32,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            server_timeout: Duration::from_secs(3600),
            client_timeout: Duration::from_secs(30),
            retry_budget: 5,
        }
    }
}

/// Reconcile scheduler bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of reconciles running concurrently across all resources.
    pub max_concurrent_reconciles: usize,
    /// Per-worker join timeout during shutdown; workers exceeding it are abandoned.
    pub worker_join_timeout: Duration,
    /// When set, every resource is requeued this long after a reconcile that didn't
    /// already ask for a timed requeue, independent of any per-controller policy.
    pub periodic_resync: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_reconciles: 8,
            worker_join_timeout: Duration::from_secs(30),
            periodic_resync: None,
        }
    }
}

/// Leader election tuning: poll interval and lease duration apply to
/// `LeaderForLife` and `LeaderWithLease`; `poll_interval` must be >= 1s.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaderElectionConfig {
    pub mode: LeaderElectionMode,
    pub poll_interval: Duration,
    pub lease_duration: Duration,
    /// Namespace the operator Pod runs in; required by `LeaderForLife`/`LeaderWithLease`.
    pub namespace: Option<String>,
    /// Name of the lock object (`ConfigMap` or `Lease`) shared across replicas.
    pub lock_name: String,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            mode: LeaderElectionMode::Disabled,
            poll_interval: Duration::from_secs(10),
            lease_duration: Duration::from_secs(30),
            namespace: None,
            lock_name: "oper8-leader".to_string(),
        }
    }
}

/// Logging overrides the framework reads off the CR's annotations and/or environment:
/// default level, per-channel filters, thread-id toggle, JSON format toggle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub default_level: String,
    pub json_format: bool,
    pub include_thread_id: bool,
    /// Per-channel (target) level overrides, e.g. `"oper8_runtime::dispatcher=debug"`.
    pub channel_filters: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default_level: "info".to_string(),
            json_format: false,
            include_thread_id: false,
            channel_filters: Vec::new(),
        }
    }
}

/// Conflict-retry policy used by the cluster adapter's apply/patch/setStatus paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(200),
        }
    }
}

/// Top-level configuration surface, layered from `OPER8_`-prefixed environment variables
/// over these defaults, threaded through the controller as one object rather than
/// scattered keyword arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub watch: WatchConfig,
    pub scheduler: SchedulerConfig,
    pub leader_election: LeaderElectionConfig,
    pub logging: LoggingConfig,
    pub retry: RetryConfig,
    /// Minimum period between heartbeat-file writes; must be >= 1s.
    pub heartbeat_period: Duration,
    /// Path to the heartbeat file the health-check collaborator polls.
    pub heartbeat_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            watch: WatchConfig::default(),
            scheduler: SchedulerConfig::default(),
            leader_election: LeaderElectionConfig::default(),
            logging: LoggingConfig::default(),
            retry: RetryConfig::default(),
            heartbeat_period: Duration::from_secs(10),
            heartbeat_path: None,
        }
    }
}

impl Config {
    /// Load configuration from `OPER8_`-prefixed environment variables (double
    /// underscore separates nested fields, e.g. `OPER8_SCHEDULER__MAX_CONCURRENT_RECONCILES`)
    /// layered over these defaults, then validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();
        let raw = config::Config::builder()
            .set_default("watch.server_timeout_secs", defaults.watch.server_timeout.as_secs())
            .map_err(|e| ConfigError::Parse(e.to_string()))?
            .set_default("watch.client_timeout_secs", defaults.watch.client_timeout.as_secs())
            .map_err(|e| ConfigError::Parse(e.to_string()))?
            .set_default("watch.retry_budget", defaults.watch.retry_budget)
            .map_err(|e| ConfigError::Parse(e.to_string()))?
            .set_default("scheduler.max_concurrent_reconciles", defaults.scheduler.max_concurrent_reconciles as u64)
            .map_err(|e| ConfigError::Parse(e.to_string()))?
            .set_default("scheduler.worker_join_timeout_secs", defaults.scheduler.worker_join_timeout.as_secs())
            .map_err(|e| ConfigError::Parse(e.to_string()))?
            .set_default("scheduler.periodic_resync_secs", 0u64)
            .map_err(|e| ConfigError::Parse(e.to_string()))?
            .set_default("leader_election.mode", "disabled")
            .map_err(|e| ConfigError::Parse(e.to_string()))?
            .set_default("leader_election.poll_interval_secs", defaults.leader_election.poll_interval.as_secs())
            .map_err(|e| ConfigError::Parse(e.to_string()))?
            .set_default("leader_election.lease_duration_secs", defaults.leader_election.lease_duration.as_secs())
            .map_err(|e| ConfigError::Parse(e.to_string()))?
            .set_default("leader_election.lock_name", defaults.leader_election.lock_name.clone())
            .map_err(|e| ConfigError::Parse(e.to_string()))?
            .set_default("logging.default_level", defaults.logging.default_level.clone())
            .map_err(|e| ConfigError::Parse(e.to_string()))?
            .set_default("logging.json_format", defaults.logging.json_format)
            .map_err(|e| ConfigError::Parse(e.to_string()))?
            .set_default("logging.include_thread_id", defaults.logging.include_thread_id)
            .map_err(|e| ConfigError::Parse(e.to_string()))?
            .set_default("retry.max_attempts", defaults.retry.max_attempts)
            .map_err(|e| ConfigError::Parse(e.to_string()))?
            .set_default("retry.base_backoff_millis", defaults.retry.base_backoff.as_millis() as u64)
            .map_err(|e| ConfigError::Parse(e.to_string()))?
            .set_default("heartbeat_period_secs", 10u64)
            .map_err(|e| ConfigError::Parse(e.to_string()))?
            .add_source(config::Environment::with_prefix("OPER8").separator("__"))
            .build()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;

        let env_shape: EnvShape = raw.try_deserialize().map_err(|e| ConfigError::Parse(e.to_string()))?;
        let config = env_shape.into_config();
        config.validate()?;
        Ok(config)
    }

    /// Validate invariants eagerly at construction: the leader-election
    /// poll interval must be at least one second, concurrency and retry bounds must be
    /// positive, and the heartbeat period must be at least one second.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.leader_election.poll_interval < Duration::from_secs(1) {
            return Err(ConfigError::TooSmall {
                field: "leader_election.poll_interval",
                minimum: 1,
                actual: self.leader_election.poll_interval.as_secs(),
            });
        }
        if self.scheduler.max_concurrent_reconciles == 0 {
            return Err(ConfigError::MustBePositive { field: "scheduler.max_concurrent_reconciles" });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::MustBePositive { field: "retry.max_attempts" });
        }
        if self.heartbeat_period < Duration::from_secs(1) {
            return Err(ConfigError::TooSmall {
                field: "heartbeat_period",
                minimum: 1,
                actual: self.heartbeat_period.as_secs(),
            });
        }
        Ok(())
    }
}

/// Mirrors [`Config`] with every [`Duration`] flattened to a primitive so the `config`
/// crate's environment source (which only ever produces strings/numbers/bools) can
/// deserialize it directly; [`EnvShape::into_config`] reassembles the public shape.
#[derive(Debug, Deserialize)]
struct EnvShape {
    watch: EnvWatch,
    scheduler: EnvScheduler,
    leader_election: EnvLeaderElection,
    logging: LoggingConfig,
    retry: EnvRetry,
    heartbeat_period_secs: u64,
    heartbeat_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EnvWatch {
    server_timeout_secs: u64,
    client_timeout_secs: u64,
    retry_budget: u32,
}

#[derive(Debug, Deserialize)]
struct EnvScheduler {
    max_concurrent_reconciles: usize,
    worker_join_timeout_secs: u64,
    /// `0` means no global periodic resync is configured.
    periodic_resync_secs: u64,
}

#[derive(Debug, Deserialize)]
struct EnvLeaderElection {
    mode: LeaderElectionMode,
    poll_interval_secs: u64,
    lease_duration_secs: u64,
    namespace: Option<String>,
    lock_name: String,
}

#[derive(Debug, Deserialize)]
struct EnvRetry {
    max_attempts: u32,
    base_backoff_millis: u64,
}

impl EnvShape {
    fn into_config(self) -> Config {
        Config {
            watch: WatchConfig {
                server_timeout: Duration::from_secs(self.watch.server_timeout_secs),
                client_timeout: Duration::from_secs(self.watch.client_timeout_secs),
                retry_budget: self.watch.retry_budget,
            },
            scheduler: SchedulerConfig {
                max_concurrent_reconciles: self.scheduler.max_concurrent_reconciles,
                worker_join_timeout: Duration::from_secs(self.scheduler.worker_join_timeout_secs),
                periodic_resync: (self.scheduler.periodic_resync_secs > 0).then(|| Duration::from_secs(self.scheduler.periodic_resync_secs)),
            },
            leader_election: LeaderElectionConfig {
                mode: self.leader_election.mode,
                poll_interval: Duration::from_secs(self.leader_election.poll_interval_secs),
                lease_duration: Duration::from_secs(self.leader_election.lease_duration_secs),
                namespace: self.leader_election.namespace,
                lock_name: self.leader_election.lock_name,
            },
            logging: self.logging,
            retry: RetryConfig {
                max_attempts: self.retry.max_attempts,
                base_backoff: Duration::from_millis(self.retry.base_backoff_millis),
            },
            heartbeat_period: Duration::from_secs(self.heartbeat_period_secs),
            heartbeat_path: self.heartbeat_path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config {
            heartbeat_period: Duration::from_secs(5),
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_sub_second_leader_poll_interval() {
        let mut config = Config { heartbeat_period: Duration::from_secs(5), ..Config::default() };
        config.leader_election.poll_interval = Duration::from_millis(500);
        assert!(matches!(config.validate(), Err(ConfigError::TooSmall { field: "leader_election.poll_interval", .. })));
    }

    #[test]
    fn rejects_zero_concurrency_cap() {
        let mut config = Config { heartbeat_period: Duration::from_secs(5), ..Config::default() };
        config.scheduler.max_concurrent_reconciles = 0;
        assert!(matches!(config.validate(), Err(ConfigError::MustBePositive { .. })));
    }

    #[test]
    fn rejects_sub_second_heartbeat_period() {
        let config = Config { heartbeat_period: Duration::from_millis(100), ..Config::default() };
        assert!(matches!(config.validate(), Err(ConfigError::TooSmall { field: "heartbeat_period", .. })));
    }
}
