//! Coordination store access
//!
//! The committed topology, the redistribution record and the zone markdown
//! all live in an external consistent key-value store. This module defines
//! the backend capability ([`KvBackend`]), the key schema, the typed
//! reader/writer pair built on top of it, and the local durable cache used as
//! a read fallback.

pub mod cache;
pub mod file;
pub mod keys;
pub mod memory;
pub mod reader;
pub mod redist;
pub mod writer;

pub use cache::ClusterCache;
pub use file::FileKv;
pub use memory::MemoryKv;
pub use reader::{ClusterReader, StoreReader};
pub use redist::{MigrationStats, MigrationStatus, RedistPhase, ZoneProgress};
pub use writer::{ClusterWriter, DryRunSink, KvSink, StoreSink, TopologyWriter};

use crate::common::{Error, Result, RetryPolicy, StoreBackend, StoreConfig};
use crate::topology::Cluster;
use async_trait::async_trait;
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// One operation of an atomic transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    Put { key: String, value: String },
    Delete { key: String },
    DeletePrefix { prefix: String },
    /// Delete every key in `[begin, end)`
    DeleteRange { begin: String, end: String },
}

impl TxnOp {
    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        TxnOp::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        TxnOp::Delete { key: key.into() }
    }

    pub fn delete_prefix(prefix: impl Into<String>) -> Self {
        TxnOp::DeletePrefix {
            prefix: prefix.into(),
        }
    }

    pub fn delete_range(begin: impl Into<String>, end: impl Into<String>) -> Self {
        TxnOp::DeleteRange {
            begin: begin.into(),
            end: end.into(),
        }
    }
}

/// Change notification; `value` is `None` for a deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEvent {
    pub key: String,
    pub value: Option<String>,
}

/// Versioned read/write/watch primitives of the coordination store
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Every key starting with `prefix`, in key order.
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>>;

    async fn put(&self, key: &str, value: &str) -> Result<()>;

    /// Delete `key`, or every key starting with it when `prefix` is set.
    async fn delete(&self, key: &str, prefix: bool) -> Result<()>;

    /// Apply all of `ops` atomically.
    async fn txn(&self, ops: Vec<TxnOp>) -> Result<()>;

    /// Stream of changes made after this call.
    fn subscribe(&self) -> broadcast::Receiver<KvEvent>;
}

/// Open the backend selected by `cfg`.
pub fn open_backend(cfg: &StoreConfig) -> Result<Arc<dyn KvBackend>> {
    let kv: Arc<dyn KvBackend> = match cfg.backend {
        StoreBackend::Memory => Arc::new(MemoryKv::new()),
        StoreBackend::File => Arc::new(FileKv::open(&cfg.path)?),
    };
    Ok(kv)
}

/// Apply `ops` to `map` and return the resulting change events.
pub(crate) fn apply_ops(map: &mut BTreeMap<String, String>, ops: Vec<TxnOp>) -> Vec<KvEvent> {
    let mut events = Vec::new();

    for op in ops {
        let removed: Vec<String> = match op {
            TxnOp::Put { key, value } => {
                map.insert(key.clone(), value.clone());
                events.push(KvEvent {
                    key,
                    value: Some(value),
                });
                continue;
            }
            TxnOp::Delete { key } => {
                if !map.contains_key(&key) {
                    continue;
                }
                vec![key]
            }
            TxnOp::DeletePrefix { prefix } => map
                .range(prefix.clone()..)
                .take_while(|(k, _)| k.starts_with(&prefix))
                .map(|(k, _)| k.clone())
                .collect(),
            TxnOp::DeleteRange { begin, end } => {
                if begin >= end {
                    continue;
                }
                map.range(begin..end).map(|(k, _)| k.clone()).collect()
            }
        };
        for key in removed {
            map.remove(&key);
            events.push(KvEvent { key, value: None });
        }
    }
    events
}

/// Read the committed topology, falling back to the cache between attempts.
///
/// A cached topology is accepted only when its version equals
/// `expected_version`; anything else keeps the loop on the live store. After
/// the last failed attempt the store error is returned.
pub async fn read_with_retry(
    reader: &dyn ClusterReader,
    cache: Option<&ClusterCache>,
    expected_version: u32,
    policy: RetryPolicy,
) -> Result<(Cluster, u32)> {
    let attempts = policy.attempts.max(1);
    let mut last_err = None;

    for attempt in 1..=attempts {
        match reader.read().await {
            Ok(read) => return Ok(read),
            Err(e) => {
                tracing::warn!("read attempt {}/{} failed: {}", attempt, attempts, e);
                last_err = Some(e);
            }
        }

        if attempt > 1 {
            if let Some(cache) = cache {
                match cache.read().await {
                    Ok((cluster, version)) if version == expected_version => {
                        tracing::warn!("using cached topology version {}", version);
                        return Ok((cluster, version));
                    }
                    Ok((_, version)) => tracing::warn!(
                        "cached topology version {} is not the expected {}",
                        version,
                        expected_version
                    ),
                    Err(e) => tracing::warn!("cache read failed: {}", e),
                }
            }
        }

        if attempt < attempts {
            tokio::time::sleep(backoff(&policy, attempt)).await;
        }
    }

    Err(match last_err {
        Some(Error::StoreUnavailable(msg)) => Error::StoreUnavailable(msg),
        Some(e) => Error::StoreUnavailable(format!(
            "no topology after {} attempts: {}",
            attempts, e
        )),
        None => Error::StoreUnavailable("no read attempted".into()),
    })
}

fn backoff(policy: &RetryPolicy, attempt: u32) -> Duration {
    let jitter = if policy.max_jitter_ms > 0 {
        rand::thread_rng().gen_range(0..policy.max_jitter_ms)
    } else {
        0
    };
    Duration::from_millis(attempt as u64 * policy.base_backoff_ms + jitter)
}
