//! Configuration for shardmesh components
//!
//! A single TOML file describes the cluster layout (`[cluster]`) together with
//! the ambient settings of the tools that operate on it. Every field outside
//! `[cluster]` has a default, and any value can be overridden from the
//! environment with `SHARDMESH__SECTION__FIELD`.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Cluster name, used to namespace the root key and cache files
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,

    /// Cluster layout
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub stats: StatsConfig,

    #[serde(default)]
    pub redist: RedistConfig,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_cluster_name() -> String {
    "shardmesh".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file, with environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(config::Environment::with_prefix("SHARDMESH").separator("__"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Parse configuration from an in-memory TOML document.
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}

/// Shard-to-node mapping algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MappingAlg {
    /// Partitioned primary/secondary shards per zone
    V1,
    /// Every zone is primary for every shard
    V2,
}

impl MappingAlg {
    pub fn from_version(version: u32) -> Result<Self> {
        match version {
            0 | 1 => Ok(MappingAlg::V1),
            2 => Ok(MappingAlg::V2),
            v => Err(Error::Config(format!("unsupported alg_version {}", v))),
        }
    }

    pub fn version(&self) -> u32 {
        match self {
            MappingAlg::V1 => 1,
            MappingAlg::V2 => 2,
        }
    }
}

/// Cluster layout: zones, shards and the endpoint of every node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_alg_version")]
    pub alg_version: u32,

    pub num_zones: u32,

    pub num_shards: u32,

    /// `conn_info[zone][node]` is the `host:port` of that node
    #[serde(default)]
    pub conn_info: Vec<Vec<String>>,

    /// Storage hosts per zone, combined with `ss_ports` when `conn_info` is empty
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ss_hosts: Vec<Vec<String>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ss_ports: Vec<u16>,
}

fn default_alg_version() -> u32 {
    1
}

impl ClusterConfig {
    pub fn mapping_alg(&self) -> Result<MappingAlg> {
        MappingAlg::from_version(self.alg_version)
    }

    /// Largest node count of any zone.
    pub fn max_nodes_per_zone(&self) -> usize {
        self.conn_info.iter().map(Vec::len).max().unwrap_or(0)
    }

    /// Node count per zone, as given by the endpoint lists.
    pub fn node_counts(&self) -> Vec<usize> {
        self.conn_info.iter().map(Vec::len).collect()
    }

    /// Check the layout invariants, generating `conn_info` from
    /// `ss_hosts`/`ss_ports` first when it is empty.
    pub fn validate(&mut self) -> Result<()> {
        if self.alg_version == 0 {
            self.alg_version = 1;
        }
        self.mapping_alg()?;

        if self.num_zones == 0 {
            return Err(Error::Config("num_zones is 0".into()));
        }
        if self.num_shards == 0 {
            return Err(Error::Config("num_shards is 0".into()));
        }

        let num_zones = self.num_zones as usize;
        if self.conn_info.is_empty()
            && self.ss_hosts.len() == num_zones
            && !self.ss_ports.is_empty()
        {
            self.conn_info = self
                .ss_hosts
                .iter()
                .map(|hosts| {
                    hosts
                        .iter()
                        .flat_map(|host| {
                            self.ss_ports.iter().map(move |port| format!("{}:{}", host, port))
                        })
                        .collect()
                })
                .collect();
        }

        if self.conn_info.len() != num_zones {
            return Err(Error::Config(format!(
                "num_zones={} does not match conn_info zone count {}",
                self.num_zones,
                self.conn_info.len()
            )));
        }

        let mut seen = HashSet::new();
        for (zone, endpoints) in self.conn_info.iter().enumerate() {
            if endpoints.is_empty() {
                return Err(Error::Config(format!(
                    "missing connection info for zone {}",
                    zone
                )));
            }
            for addr in endpoints {
                if addr.len() <= 2 || addr.starts_with(':') || addr.ends_with(':') {
                    return Err(Error::Config(format!(
                        "bad address '{}' in zone {}",
                        addr, zone
                    )));
                }
                if !seen.insert(addr.as_str()) {
                    return Err(Error::Config(format!(
                        "duplicate endpoint '{}' in zone {}",
                        addr, zone
                    )));
                }
            }
        }

        let max_nodes = self.max_nodes_per_zone();
        if (self.num_shards as usize) < max_nodes {
            return Err(Error::Config(format!(
                "num_shards={} is smaller than the largest zone ({} nodes)",
                self.num_shards, max_nodes
            )));
        }

        Ok(())
    }
}

/// Coordination store and local cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Path of the store file for the `file` backend
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    #[serde(default = "default_cache_name")]
    pub cache_name: String,

    #[serde(default)]
    pub read_retry: RetryPolicy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    #[default]
    File,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("./shardmesh-store.json")
}
fn default_cache_dir() -> PathBuf {
    PathBuf::from("./")
}
fn default_cache_name() -> String {
    "store_cache".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_store_path(),
            cache_dir: default_cache_dir(),
            cache_name: default_cache_name(),
            read_retry: RetryPolicy::default(),
        }
    }
}

/// Backoff for reads from the coordination store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    /// Attempt `i` sleeps `i * base_backoff_ms` plus jitter
    #[serde(default = "default_base_backoff")]
    pub base_backoff_ms: u64,

    #[serde(default = "default_max_jitter")]
    pub max_jitter_ms: u64,
}

fn default_attempts() -> u32 {
    5
}
fn default_base_backoff() -> u64 {
    1000
}
fn default_max_jitter() -> u64 {
    2000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            base_backoff_ms: default_base_backoff(),
            max_jitter_ms: default_max_jitter(),
        }
    }
}

impl RetryPolicy {
    /// Retry without sleeping, for tests and tools that must not block.
    pub fn immediate(attempts: u32) -> Self {
        Self {
            attempts,
            base_backoff_ms: 0,
            max_jitter_ms: 0,
        }
    }
}

/// Node health tracking
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsConfig {
    #[serde(default)]
    pub timeout_stats_enabled: bool,

    #[serde(default)]
    pub resp_time_stats_enabled: bool,

    /// Timeouts within the window that mark a node down
    #[serde(default = "default_markdown_threshold")]
    pub markdown_threshold: u32,

    #[serde(default = "default_markdown_expiration")]
    pub markdown_expiration_base_secs: u64,

    #[serde(default = "default_ema_window")]
    pub ema_window_size: u32,

    #[serde(default = "default_timeout_window_size")]
    pub timeout_window_size: u32,

    #[serde(default = "default_timeout_window_unit")]
    pub timeout_window_unit_secs: u64,
}

fn default_markdown_threshold() -> u32 {
    10
}
fn default_markdown_expiration() -> u64 {
    300
}
fn default_ema_window() -> u32 {
    39
}
fn default_timeout_window_size() -> u32 {
    5
}
fn default_timeout_window_unit() -> u64 {
    60
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            timeout_stats_enabled: false,
            resp_time_stats_enabled: false,
            markdown_threshold: default_markdown_threshold(),
            markdown_expiration_base_secs: default_markdown_expiration(),
            ema_window_size: default_ema_window(),
            timeout_window_size: default_timeout_window_size(),
            timeout_window_unit_secs: default_timeout_window_unit(),
        }
    }
}

impl StatsConfig {
    pub fn enabled(&self) -> bool {
        self.timeout_stats_enabled || self.resp_time_stats_enabled
    }
}

/// Redistribution coordinator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedistConfig {
    /// Shards allowed to miss the finish state before commit
    #[serde(default)]
    pub max_failures: u32,

    #[serde(default = "default_min_wait")]
    pub min_wait_secs: u64,

    /// Give up waiting after this long; 0 waits indefinitely
    #[serde(default)]
    pub max_wait_secs: u64,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Pause after publishing a zone markdown, so routers observe it
    #[serde(default = "default_markdown_settle")]
    pub markdown_settle_ms: u64,

    #[serde(default)]
    pub rate_limit: u32,

    /// Where commit dumps the per-shard redistribution state
    #[serde(default)]
    pub state_dump_path: Option<PathBuf>,
}

fn default_min_wait() -> u64 {
    10
}
fn default_poll_interval() -> u64 {
    10_000
}
fn default_markdown_settle() -> u64 {
    30_000
}

impl Default for RedistConfig {
    fn default() -> Self {
        Self {
            max_failures: 0,
            min_wait_secs: default_min_wait(),
            max_wait_secs: 0,
            poll_interval_ms: default_poll_interval(),
            markdown_settle_ms: default_markdown_settle(),
            rate_limit: 0,
            state_dump_path: None,
        }
    }
}

impl RedistConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn markdown_settle(&self) -> Duration {
        Duration::from_millis(self.markdown_settle_ms)
    }
}

/// Topology runtime settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Bound on waiting for a standby topology's connections
    #[serde(default = "default_standby_timeout")]
    pub standby_ready_timeout_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_ms: u64,
}

fn default_standby_timeout() -> u64 {
    20
}
fn default_connect_timeout() -> u64 {
    1000
}
fn default_reconnect_interval() -> u64 {
    1000
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            standby_ready_timeout_secs: default_standby_timeout(),
            connect_timeout_ms: default_connect_timeout(),
            reconnect_interval_ms: default_reconnect_interval(),
        }
    }
}

impl RuntimeConfig {
    pub fn standby_ready_timeout(&self) -> Duration {
        Duration::from_secs(self.standby_ready_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}
