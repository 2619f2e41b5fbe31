//! Configuration for rangeshift components

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node ID (unique identifier)
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Coordinator-specific config
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Migration tunables
    #[serde(default)]
    pub migration: MigrationConfig,

    /// Shards hosted in-process
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_node_id() -> String {
    "coord-1".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            coordinator: CoordinatorConfig::default(),
            migration: MigrationConfig::default(),
            cluster: ClusterConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load `rangeshift.toml` (optional) overlaid with `RANGESHIFT_*` env vars.
    ///
    /// Falls back to defaults when neither source is usable.
    pub fn load() -> Self {
        Self::load_from("rangeshift").unwrap_or_else(|e| {
            tracing::warn!(error = %e, "falling back to default configuration");
            Self::default()
        })
    }

    /// Load from an explicit file stem or path
    pub fn load_from(path: &str) -> crate::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("RANGESHIFT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::Error::InvalidConfig(e.to_string()))?;

        let cfg: Config = settings
            .try_deserialize()
            .map_err(|e| crate::Error::InvalidConfig(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> crate::Result<()> {
        self.migration.validate()?;
        let mut seen = std::collections::HashSet::new();
        for shard in &self.cluster.shards {
            if !seen.insert(shard.as_str()) {
                return Err(crate::Error::InvalidConfig(format!(
                    "duplicate shard id: {}",
                    shard
                )));
            }
        }
        Ok(())
    }
}

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Bind address for HTTP API
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// RocksDB path for operation documents and routing (in-memory if unset)
    #[serde(default)]
    pub db_path: Option<PathBuf>,

    /// Delay between `advance` passes that made no progress
    #[serde(default = "default_advance_interval")]
    pub advance_interval_ms: u64,

    /// A participant unreachable for longer than this forces an abort
    /// (only before the commit point)
    #[serde(default = "default_participant_timeout")]
    pub participant_timeout_ms: u64,

    /// Per-call RPC retry budget
    #[serde(default = "default_rpc_retries")]
    pub rpc_retries: usize,

    /// Initial RPC retry backoff
    #[serde(default = "default_rpc_backoff")]
    pub rpc_backoff_ms: u64,

    /// How long a finished operation document stays visible
    #[serde(default = "default_quiesce_period")]
    pub quiesce_period_ms: u64,
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7000))
}
fn default_advance_interval() -> u64 {
    50
}
fn default_participant_timeout() -> u64 {
    30_000
}
fn default_rpc_retries() -> usize {
    3
}
fn default_rpc_backoff() -> u64 {
    20
}
fn default_quiesce_period() -> u64 {
    5 * 60 * 1000
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            db_path: None,
            advance_interval_ms: default_advance_interval(),
            participant_timeout_ms: default_participant_timeout(),
            rpc_retries: default_rpc_retries(),
            rpc_backoff_ms: default_rpc_backoff(),
            quiesce_period_ms: default_quiesce_period(),
        }
    }
}

impl CoordinatorConfig {
    pub fn advance_interval(&self) -> Duration {
        Duration::from_millis(self.advance_interval_ms)
    }

    pub fn participant_timeout(&self) -> Duration {
        Duration::from_millis(self.participant_timeout_ms)
    }

    pub fn rpc_backoff(&self) -> Duration {
        Duration::from_millis(self.rpc_backoff_ms)
    }

    pub fn quiesce_period(&self) -> Duration {
        Duration::from_millis(self.quiesce_period_ms)
    }
}

/// Migration tunables.
///
/// The commit threshold and the number of consecutive samples are policy,
/// not semantics; both are exposed rather than fixed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Recipient apply lag considered "caught up"
    #[serde(default = "default_commit_lag_threshold")]
    pub commit_lag_threshold_ms: u64,

    /// Consecutive sub-threshold polls required before the critical section
    #[serde(default = "default_commit_consecutive_samples")]
    pub commit_consecutive_samples: usize,

    /// Commit monitor poll interval
    #[serde(default = "default_commit_poll_interval")]
    pub commit_poll_interval_ms: u64,

    /// Bound on write unavailability; overruns alert, they never abort
    #[serde(default = "default_critical_section_max")]
    pub critical_section_max_ms: u64,

    /// Failed all-donor acquisitions tolerated before aborting
    #[serde(default = "default_critical_section_acquire_attempts")]
    pub critical_section_acquire_attempts: u32,

    /// Documents per initial-copy batch
    #[serde(default = "default_clone_batch_size")]
    pub clone_batch_size: usize,

    /// Mutations per change-stream batch
    #[serde(default = "default_apply_batch_size")]
    pub apply_batch_size: usize,

    /// Recipient background loop interval
    #[serde(default = "default_recipient_tick")]
    pub recipient_tick_ms: u64,
}

fn default_commit_lag_threshold() -> u64 {
    50
}
fn default_commit_consecutive_samples() -> usize {
    2
}
fn default_commit_poll_interval() -> u64 {
    25
}
fn default_critical_section_max() -> u64 {
    5_000
}
fn default_critical_section_acquire_attempts() -> u32 {
    10
}
fn default_clone_batch_size() -> usize {
    500
}
fn default_apply_batch_size() -> usize {
    1_000
}
fn default_recipient_tick() -> u64 {
    5
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            commit_lag_threshold_ms: default_commit_lag_threshold(),
            commit_consecutive_samples: default_commit_consecutive_samples(),
            commit_poll_interval_ms: default_commit_poll_interval(),
            critical_section_max_ms: default_critical_section_max(),
            critical_section_acquire_attempts: default_critical_section_acquire_attempts(),
            clone_batch_size: default_clone_batch_size(),
            apply_batch_size: default_apply_batch_size(),
            recipient_tick_ms: default_recipient_tick(),
        }
    }
}

impl MigrationConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.commit_consecutive_samples == 0 {
            return Err(crate::Error::InvalidConfig(
                "commit_consecutive_samples must be at least 1".into(),
            ));
        }
        if self.clone_batch_size == 0 || self.apply_batch_size == 0 {
            return Err(crate::Error::InvalidConfig(
                "batch sizes must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn commit_lag_threshold(&self) -> Duration {
        Duration::from_millis(self.commit_lag_threshold_ms)
    }

    pub fn commit_poll_interval(&self) -> Duration {
        Duration::from_millis(self.commit_poll_interval_ms)
    }

    pub fn critical_section_max(&self) -> Duration {
        Duration::from_millis(self.critical_section_max_ms)
    }

    pub fn recipient_tick(&self) -> Duration {
        Duration::from_millis(self.recipient_tick_ms)
    }
}

/// In-process cluster layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_shards")]
    pub shards: Vec<String>,
}

fn default_shards() -> Vec<String> {
    vec!["shard-a".to_string(), "shard-b".to_string()]
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            shards: default_shards(),
        }
    }
}
