//! Topology and redistribution writes
//!
//! [`TopologyWriter`] turns clusters and phase changes into key writes and
//! sends them to a [`KvSink`]. The live sink persists them to the store; the
//! dry-run sink renders the same writes as text for an operator preview, so
//! the coordinator never needs to know which one it drives.

use crate::common::{hostname, Error, Result};
use crate::store::keys::{self, TAG_REDIST_PREFIX};
use crate::store::redist::{RedistPhase, STATE_BEGIN, TARGET_STATE_INIT};
use crate::store::{KvBackend, TxnOp};
use crate::topology::Cluster;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::io::{self, Write};
use std::sync::Arc;

/// Destination of key writes
#[async_trait]
pub trait KvSink: Send + Sync {
    async fn put(&self, key: &str, value: &str) -> Result<()>;
    async fn delete(&self, key: &str, prefix: bool) -> Result<()>;
    async fn txn(&self, ops: Vec<TxnOp>) -> Result<()>;
}

/// Writes into the coordination store
pub struct StoreSink(pub Arc<dyn KvBackend>);

#[async_trait]
impl KvSink for StoreSink {
    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.0.put(key, value).await
    }

    async fn delete(&self, key: &str, prefix: bool) -> Result<()> {
        self.0.delete(key, prefix).await
    }

    async fn txn(&self, ops: Vec<TxnOp>) -> Result<()> {
        self.0.txn(ops).await
    }
}

/// Renders writes to `W` instead of applying them
pub struct DryRunSink<W> {
    out: Mutex<W>,
}

impl<W: io::Write + Send> DryRunSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

#[async_trait]
impl<W: io::Write + Send> KvSink for DryRunSink<W> {
    async fn put(&self, key: &str, value: &str) -> Result<()> {
        writeln!(self.out.lock(), "{}={}", key, value)?;
        Ok(())
    }

    async fn delete(&self, key: &str, prefix: bool) -> Result<()> {
        writeln!(self.out.lock(), "delete: key={} prefix={}", key, prefix)?;
        Ok(())
    }

    async fn txn(&self, ops: Vec<TxnOp>) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut out = self.out.lock();
        writeln!(out, "===txn begin:")?;
        for op in &ops {
            match op {
                TxnOp::Put { key, value } => writeln!(out, "{}={}", key, value)?,
                TxnOp::Delete { key } => writeln!(out, "delete: key={}", key)?,
                TxnOp::DeletePrefix { prefix } => {
                    writeln!(out, "delete: key={} prefix=true", prefix)?
                }
                TxnOp::DeleteRange { begin, end } => {
                    writeln!(out, "delete: beginKey={}", begin)?;
                    writeln!(out, "          endKey={}", end)?;
                }
            }
        }
        writeln!(out, "===txn end, ops_count={}", ops.len())?;
        Ok(())
    }
}

/// Writes of the committed topology and the redistribution record
#[async_trait]
pub trait ClusterWriter: Send + Sync {
    /// Publish `cluster` as committed `version` (at least 1), clearing any
    /// redistribution record. Only the cluster's redistribution zones are
    /// rewritten.
    async fn write(&self, cluster: &Cluster, version: u32) -> Result<()>;

    /// Record the candidate topology and the shards each node must hand over.
    async fn write_redist_info(&self, current: &Cluster, candidate: &Cluster) -> Result<()>;

    async fn write_redist_start(
        &self,
        enable: bool,
        zone: u32,
        source: bool,
        rate_limit: u32,
    ) -> Result<()>;

    async fn write_redist_abort(&self, num_zones: u32) -> Result<()>;

    async fn write_redist_resume(&self, zone: u32, rate_limit: u32) -> Result<()>;

    /// Publish the hard markdown zone, or clear it.
    async fn write_zone_markdown(&self, zone: Option<u32>) -> Result<()>;

    /// Stamp who last changed the cluster.
    async fn write_root_key(&self, cluster_name: &str) -> Result<()>;
}

pub struct TopologyWriter<S> {
    sink: S,
}

impl<S: KvSink> TopologyWriter<S> {
    pub fn new(sink: S) -> Self {
        Self { sink }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }
}

impl TopologyWriter<StoreSink> {
    pub fn live(kv: Arc<dyn KvBackend>) -> Self {
        Self::new(StoreSink(kv))
    }
}

/// Endpoint of a node, required for every node that is written out.
fn endpoint(cluster: &Cluster, zone: u32, node: u32) -> Result<&str> {
    cluster.endpoint(zone, node).ok_or_else(|| {
        Error::Validation(format!("no endpoint for zone {} node {}", zone, node))
    })
}

#[async_trait]
impl<S: KvSink> ClusterWriter for TopologyWriter<S> {
    async fn write(&self, cluster: &Cluster, version: u32) -> Result<()> {
        let num_zones = cluster.num_zones();
        let mut ops = Vec::new();

        // Nodes beyond the new count of a zone
        for tag_key in [keys::node_ipport as fn(u32, u32) -> String, keys::node_shards] {
            for zone in cluster.redist_zones() {
                let num_nodes = cluster.zone(zone).map_or(0, |z| z.num_nodes);
                ops.push(TxnOp::delete_range(
                    tag_key(zone, num_nodes),
                    tag_key(zone + 1, 0),
                ));
            }
        }
        ops.push(TxnOp::delete_prefix(TAG_REDIST_PREFIX));

        ops.push(TxnOp::put(keys::TAG_NUM_ZONES, num_zones.to_string()));
        ops.push(TxnOp::put(keys::TAG_NUM_SHARDS, cluster.num_shards().to_string()));
        for zone in cluster.redist_zones() {
            let Some(z) = cluster.zone(zone) else {
                continue;
            };
            for node in &z.nodes {
                ops.push(TxnOp::put(
                    keys::node_ipport(zone, node.node_id),
                    endpoint(cluster, zone, node.node_id)?,
                ));
            }
        }
        for zone in cluster.redist_zones() {
            let Some(z) = cluster.zone(zone) else {
                continue;
            };
            for node in &z.nodes {
                ops.push(TxnOp::put(
                    keys::node_shards(zone, node.node_id),
                    node.to_value(),
                ));
            }
        }

        ops.push(TxnOp::put(
            keys::TAG_ALG_VERSION,
            cluster.config.alg_version.to_string(),
        ));
        ops.push(TxnOp::put(keys::TAG_VERSION, version.max(1).to_string()));

        tracing::info!("writing topology version {}", version.max(1));
        self.sink.txn(ops).await
    }

    async fn write_redist_info(&self, current: &Cluster, candidate: &Cluster) -> Result<()> {
        if current.num_zones() != candidate.num_zones()
            || current.num_shards() != candidate.num_shards()
        {
            let msg = format!(
                "number of zones ({}, {}) or shards ({}, {}) do not match",
                current.num_zones(),
                candidate.num_zones(),
                current.num_shards(),
                candidate.num_shards()
            );
            tracing::error!("{}", msg);
            return Err(Error::Validation(msg));
        }

        self.sink.delete(TAG_REDIST_PREFIX, true).await?;
        tracing::info!("shard moves:\n{}", current.change_map(candidate));

        let map = candidate.shard_map();
        let num_zones = current.num_zones() as usize;
        let mut targets: Vec<BTreeSet<u32>> = vec![BTreeSet::new(); num_zones];

        for zone in candidate.redist_zones() {
            let Some(z) = current.zone(zone) else {
                continue;
            };
            for node in &z.nodes {
                let mut changes = Vec::new();
                for shard in node.shards() {
                    let new_node = map.node_id(shard, zone)?;
                    if new_node == node.node_id {
                        continue;
                    }
                    changes.push(format!("{}{}{}", shard, keys::COMP_DELIMITER, new_node));
                    self.sink
                        .put(&keys::redist_state(zone, node.node_id, shard), STATE_BEGIN)
                        .await?;
                    targets[zone as usize].insert(new_node);
                }

                if !changes.is_empty() {
                    let value = changes.join(&keys::SHARD_MOVE_SEPARATOR.to_string());
                    self.sink
                        .put(&keys::redist_from(zone, node.node_id), &value)
                        .await?;
                }
            }
        }

        let mut ops = Vec::new();
        let old_len = |zone: u32| current.zone(zone).map_or(0, |z| z.len());
        let new_len = |zone: u32| candidate.zone(zone).map_or(0, |z| z.len());

        for zone in candidate.redist_zones() {
            for node in old_len(zone)..new_len(zone) {
                let node = node as u32;
                ops.push(TxnOp::put(
                    keys::redist_node_ipport(zone, node),
                    endpoint(candidate, zone, node)?,
                ));
            }
        }
        for zone in candidate.redist_zones() {
            let Some(z) = candidate.zone(zone) else {
                continue;
            };
            for node in &z.nodes {
                ops.push(TxnOp::put(
                    keys::redist_node_shards(zone, node.node_id),
                    node.to_value(),
                ));
            }
        }
        for zone in candidate.redist_zones() {
            ops.push(TxnOp::put(
                keys::redist_enable(zone),
                RedistPhase::Ready.to_value(),
            ));
        }
        for zone in candidate.redist_zones() {
            let (old, new) = (old_len(zone), new_len(zone));
            if old == new {
                continue;
            }
            // A shrinking zone only waits on nodes that receive shards
            let shrinking = old > new;
            let start = if shrinking { 0 } else { old };
            for node in start..new {
                let node = node as u32;
                if shrinking && !targets[zone as usize].contains(&node) {
                    continue;
                }
                ops.push(TxnOp::put(
                    keys::redist_tgt_state(zone, node),
                    TARGET_STATE_INIT,
                ));
            }
        }

        self.sink.txn(ops).await
    }

    async fn write_redist_start(
        &self,
        enable: bool,
        zone: u32,
        source: bool,
        rate_limit: u32,
    ) -> Result<()> {
        let phase = match (enable, source) {
            (false, _) => RedistPhase::Disabled,
            (true, true) => RedistPhase::Source { rate_limit },
            (true, false) => RedistPhase::Target,
        };
        tracing::info!("zone {}: redistribution phase {}", zone, phase);
        self.sink
            .put(&keys::redist_enable(zone), &phase.to_value())
            .await
    }

    async fn write_redist_abort(&self, num_zones: u32) -> Result<()> {
        let mut ops = vec![
            TxnOp::delete_prefix(keys::TAG_REDIST_FROM),
            TxnOp::delete_prefix(keys::TAG_REDIST_NODE_PREFIX),
            TxnOp::delete_prefix(keys::TAG_REDIST_STATE),
            TxnOp::delete_prefix(keys::TAG_REDIST_TGT_STATE),
        ];
        for zone in 0..num_zones {
            ops.push(TxnOp::put(
                keys::redist_enable(zone),
                RedistPhase::AbortAll.to_value(),
            ));
        }
        tracing::info!("aborting redistribution in {} zones", num_zones);
        self.sink.txn(ops).await
    }

    async fn write_redist_resume(&self, zone: u32, rate_limit: u32) -> Result<()> {
        let phase = RedistPhase::Resume { rate_limit };
        tracing::info!("zone {}: redistribution phase {}", zone, phase);
        self.sink
            .put(&keys::redist_enable(zone), &phase.to_value())
            .await
    }

    async fn write_zone_markdown(&self, zone: Option<u32>) -> Result<()> {
        match zone {
            Some(zone) => {
                tracing::info!("zone {} marked down", zone);
                self.sink
                    .put(keys::TAG_ZONE_MARKDOWN, &zone.to_string())
                    .await
            }
            None => self.sink.delete(keys::TAG_ZONE_MARKDOWN, false).await,
        }
    }

    async fn write_root_key(&self, cluster_name: &str) -> Result<()> {
        let cwd = std::env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let value = format!(
            "{}|{}|{}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            hostname(),
            cwd
        );
        self.sink.put(&keys::root_key(cluster_name), &value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ClusterConfig;
    use crate::store::MemoryKv;

    fn cluster(counts: &[usize], num_shards: u32) -> Cluster {
        let config = ClusterConfig {
            alg_version: 1,
            num_zones: counts.len() as u32,
            num_shards,
            conn_info: counts
                .iter()
                .enumerate()
                .map(|(z, &n)| (0..n).map(|i| format!("10.0.{}.{}:5080", z, i)).collect())
                .collect(),
            ..Default::default()
        };
        let mut cluster = Cluster::new(config);
        cluster.populate_from_config().unwrap();
        cluster
    }

    #[tokio::test]
    async fn test_write_publishes_version_last() {
        let kv = Arc::new(MemoryKv::new());
        let writer = TopologyWriter::live(kv.clone());
        writer.write(&cluster(&[2, 2], 16), 0).await.unwrap();

        let data = kv.snapshot();
        assert_eq!(data.get("version").map(String::as_str), Some("1"));
        assert_eq!(data.get("numzones").map(String::as_str), Some("2"));
        assert_eq!(
            data.get("node_ipport_01_001").map(String::as_str),
            Some("10.0.1.1:5080")
        );
        assert!(data.contains_key("node_shards_00_000"));
    }

    #[tokio::test]
    async fn test_write_drops_removed_nodes() {
        let kv = Arc::new(MemoryKv::new());
        let writer = TopologyWriter::live(kv.clone());
        writer.write(&cluster(&[3, 2], 16), 1).await.unwrap();
        writer.write(&cluster(&[2, 2], 16), 2).await.unwrap();

        let data = kv.snapshot();
        assert!(!data.contains_key("node_ipport_00_002"));
        assert!(!data.contains_key("node_shards_00_002"));
        assert!(data.contains_key("node_shards_01_001"));
    }

    #[tokio::test]
    async fn test_redist_info_records_moves() {
        let kv = Arc::new(MemoryKv::new());
        let writer = TopologyWriter::live(kv.clone());
        let current = cluster(&[2, 2], 32);
        let mut candidate = Cluster::new(cluster(&[3, 2], 32).config);
        candidate.set_redist_zone(Some(0));
        candidate.populate_from_redist(Some(&current.zones)).unwrap();

        writer.write_redist_info(&current, &candidate).await.unwrap();
        let data = kv.snapshot();

        let moves = current.moved_shards(&candidate);
        let states = data.keys().filter(|k| k.starts_with("redist_state_00_")).count();
        assert_eq!(states, moves.len());
        assert!(data.keys().all(|k| !k.starts_with("redist_state_01_")));
        assert_eq!(data.get("redist_enable_00").map(String::as_str), Some("ready"));
        assert!(!data.contains_key("redist_enable_01"));
        assert_eq!(
            data.get("redist_node_ipport_00_002").map(String::as_str),
            Some("10.0.0.2:5080")
        );
        assert_eq!(data.get("redist_tgtstate_00_002").map(String::as_str), Some("init"));
        assert!(data.contains_key("redist_from_00_000"));
    }

    #[tokio::test]
    async fn test_abort_clears_candidate() {
        let kv = Arc::new(MemoryKv::new());
        let writer = TopologyWriter::live(kv.clone());
        kv.put("redist_from_00_000", "1_2").await.unwrap();
        kv.put("redist_node_shards_00_000", "1|").await.unwrap();
        kv.put("version", "4").await.unwrap();

        writer.write_redist_abort(2).await.unwrap();
        let data = kv.snapshot();
        assert!(!data.contains_key("redist_from_00_000"));
        assert!(!data.contains_key("redist_node_shards_00_000"));
        assert_eq!(data.get("redist_enable_01").map(String::as_str), Some("abort_all"));
        assert_eq!(data.get("version").map(String::as_str), Some("4"));
    }

    #[tokio::test]
    async fn test_dry_run_renders_txn() {
        let writer = TopologyWriter::new(DryRunSink::new(Vec::new()));
        writer.write_redist_start(true, 1, true, 300).await.unwrap();
        writer.write_redist_abort(1).await.unwrap();

        let text = String::from_utf8(writer.into_sink().into_inner()).unwrap();
        assert!(text.contains("redist_enable_01=yes_source_rl|ratelimit=300"));
        assert!(text.contains("===txn begin:"));
        assert!(text.contains("===txn end, ops_count=5"));
    }
}
