//! Topology reads from the coordination store

use crate::common::{ClusterConfig, Error, Result};
use crate::store::keys::{self, parse_zone_node};
use crate::store::redist::RedistPhase;
use crate::store::{ClusterCache, KvBackend};
use crate::topology::{Cluster, Node, Zone};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

#[async_trait]
pub trait ClusterReader: Send + Sync {
    /// Committed topology and its version.
    async fn read(&self) -> Result<(Cluster, u32)>;

    /// Committed topology extended with the nodes a redistribution adds, so
    /// storage nodes can reach their future peers.
    async fn read_with_redist_info(&self) -> Result<(Cluster, u32)>;

    /// Replace the zones of `cluster` with the candidate layout of its
    /// redistribution zones.
    async fn read_redist_node_shards(&self, cluster: &mut Cluster) -> Result<()>;
}

/// [`ClusterReader`] over a [`KvBackend`], caching every successful read
#[derive(Clone)]
pub struct StoreReader {
    kv: Arc<dyn KvBackend>,
    cache: Option<ClusterCache>,
}

impl StoreReader {
    pub fn new(kv: Arc<dyn KvBackend>) -> Self {
        Self { kv, cache: None }
    }

    pub fn with_cache(mut self, cache: ClusterCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn cache(&self) -> Option<&ClusterCache> {
        self.cache.as_ref()
    }

    pub async fn get_value(&self, key: &str) -> Result<Option<String>> {
        self.kv.get(key).await
    }

    async fn get_u32(&self, key: &str) -> Result<Option<u32>> {
        match self.kv.get(key).await? {
            None => Ok(None),
            Some(v) => v
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| Error::Corrupted(format!("{}='{}' is not a number", key, v))),
        }
    }

    async fn require_u32(&self, key: &str) -> Result<u32> {
        self.get_u32(key)
            .await?
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    /// Committed version, 0 when nothing was ever stored.
    pub async fn version(&self) -> Result<u32> {
        Ok(self.get_u32(keys::TAG_VERSION).await?.unwrap_or(0))
    }

    /// Stored mapping version, 1 when absent.
    pub async fn alg_version(&self) -> Result<u32> {
        Ok(self.get_u32(keys::TAG_ALG_VERSION).await?.unwrap_or(1))
    }

    pub async fn num_zones(&self) -> Result<u32> {
        self.require_u32(keys::TAG_NUM_ZONES).await
    }

    /// Phase flag of `zone`, if any.
    pub async fn phase(&self, zone: u32) -> Result<Option<RedistPhase>> {
        Ok(self
            .kv
            .get(&keys::redist_enable(zone))
            .await?
            .and_then(|v| RedistPhase::parse(&v)))
    }

    /// Endpoints by zone and node read from `tag` keys.
    async fn read_endpoints(&self, tag: &str, num_zones: u32) -> Result<Vec<Vec<String>>> {
        let mut conn_info = vec![Vec::new(); num_zones as usize];
        for (key, value) in self.kv.get_prefix(tag).await? {
            let Some((zone, node)) = parse_zone_node(&key, tag) else {
                continue;
            };
            let Some(endpoints) = conn_info.get_mut(zone as usize) else {
                tracing::warn!("ignoring {}: zone out of range", key);
                continue;
            };
            let node = node as usize;
            if endpoints.len() <= node {
                endpoints.resize(node + 1, String::new());
            }
            endpoints[node] = value;
        }
        Ok(conn_info)
    }

    /// Nodes by zone read from `tag` keys; zones without keys stay empty.
    async fn read_zones(&self, tag: &str, num_zones: u32) -> Result<Vec<Zone>> {
        let mut nodes: Vec<Vec<Option<Node>>> = vec![Vec::new(); num_zones as usize];
        for (key, value) in self.kv.get_prefix(tag).await? {
            let Some((zone, node)) = parse_zone_node(&key, tag) else {
                continue;
            };
            let Some(zone_nodes) = nodes.get_mut(zone as usize) else {
                tracing::warn!("ignoring {}: zone out of range", key);
                continue;
            };
            let ix = node as usize;
            if zone_nodes.len() <= ix {
                zone_nodes.resize(ix + 1, None);
            }
            zone_nodes[ix] = Some(Node::from_value(zone, node, &value)?);
        }

        nodes
            .into_iter()
            .enumerate()
            .map(|(zone, zone_nodes)| {
                let zone = zone as u32;
                let nodes = zone_nodes
                    .into_iter()
                    .enumerate()
                    .map(|(node, n)| {
                        n.ok_or_else(|| {
                            Error::Corrupted(format!(
                                "{}: zone {} node {} missing",
                                tag, zone, node
                            ))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Zone::with_nodes(zone, nodes))
            })
            .collect()
    }

    fn write_cache(&self, cluster: &Cluster, version: u32, for_redist: bool) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.write(cluster, version, for_redist) {
                tracing::error!("failed to write topology cache: {}", e);
            }
        }
    }

    /// Moves of `(zone, node)`: shard to new node.
    pub async fn read_redist_change_map(&self, zone: u32, node: u32) -> Result<BTreeMap<u32, u32>> {
        let key = keys::redist_from(zone, node);
        let Some(value) = self.kv.get(&key).await? else {
            return Ok(BTreeMap::new());
        };
        let mut changes = BTreeMap::new();
        for (shard, to) in parse_changes(&key, &value)? {
            changes.insert(shard, to);
        }
        Ok(changes)
    }

    /// Shards that `(zone, node)` receives during the redistribution.
    pub async fn read_redist_target_shards(&self, zone: u32, node: u32) -> Result<BTreeSet<u32>> {
        let prefix = keys::zone_prefix(keys::TAG_REDIST_FROM, zone);
        let mut shards = BTreeSet::new();
        for (key, value) in self.kv.get_prefix(&prefix).await? {
            for (shard, to) in parse_changes(&key, &value)? {
                if to == node {
                    shards.insert(shard);
                }
            }
        }
        Ok(shards)
    }

    /// Every key of the redistribution record.
    pub async fn redist_state_dump(&self) -> Result<BTreeMap<String, String>> {
        Ok(self
            .kv
            .get_prefix(keys::TAG_REDIST_PREFIX)
            .await?
            .into_iter()
            .collect())
    }
}

/// Parse a `shard_node|shard_node` change list.
fn parse_changes(key: &str, value: &str) -> Result<Vec<(u32, u32)>> {
    value
        .split(keys::SHARD_MOVE_SEPARATOR)
        .filter(|c| !c.is_empty())
        .map(|change| {
            let parsed = change
                .split_once(keys::COMP_DELIMITER)
                .and_then(|(s, n)| Some((s.parse().ok()?, n.parse().ok()?)));
            parsed.ok_or_else(|| Error::Corrupted(format!("{}: bad change '{}'", key, change)))
        })
        .collect()
}

#[async_trait]
impl ClusterReader for StoreReader {
    async fn read(&self) -> Result<(Cluster, u32)> {
        let version = self.require_u32(keys::TAG_VERSION).await?;
        let alg_version = self.alg_version().await?;
        let num_shards = self.require_u32(keys::TAG_NUM_SHARDS).await?;
        let num_zones = self.require_u32(keys::TAG_NUM_ZONES).await?;

        let conn_info = self.read_endpoints(keys::TAG_NODE_IPPORT, num_zones).await?;
        let zones = self.read_zones(keys::TAG_NODE_SHARDS, num_zones).await?;

        for zone in 0..num_zones as usize {
            if conn_info[zone].is_empty() {
                tracing::error!("endpoints missing for zone {}", zone);
                return Err(Error::Corrupted(format!("endpoints missing for zone {}", zone)));
            }
            if zones[zone].is_empty() {
                tracing::error!("shard layout missing for zone {}", zone);
                return Err(Error::Corrupted(format!(
                    "shard layout missing for zone {}",
                    zone
                )));
            }
        }

        let mut cluster = Cluster::new(ClusterConfig {
            alg_version,
            num_zones,
            num_shards,
            conn_info,
            ..Default::default()
        });
        cluster.zones = zones;

        self.write_cache(&cluster, version, false);
        Ok((cluster, version))
    }

    async fn read_with_redist_info(&self) -> Result<(Cluster, u32)> {
        let (mut cluster, version) = self.read().await?;
        let num_zones = cluster.num_zones();

        let extra_endpoints = self
            .read_endpoints(keys::TAG_REDIST_NODE_IPPORT, num_zones)
            .await?;
        let extra_zones = self
            .read_zones(keys::TAG_REDIST_NODE_SHARDS, num_zones)
            .await?;

        for (zone, endpoints) in extra_endpoints.into_iter().enumerate() {
            let current = &mut cluster.config.conn_info[zone];
            if endpoints.len() > current.len() {
                let from = current.len();
                current.extend(endpoints.into_iter().skip(from));
            }
        }

        let mut for_redist = false;
        for (zone, extra) in extra_zones.into_iter().enumerate() {
            let current = &mut cluster.zones[zone];
            if extra.len() > current.len() {
                let from = current.len();
                current.nodes.extend(extra.nodes.into_iter().skip(from));
                current.num_nodes = current.nodes.len() as u32;
                for_redist = true;
            }
        }

        tracing::info!("topology adjusted with new nodes:\n{}", cluster.dump());
        self.write_cache(&cluster, version, for_redist);
        Ok((cluster, version))
    }

    async fn read_redist_node_shards(&self, cluster: &mut Cluster) -> Result<()> {
        let num_zones = cluster.num_zones();
        let mut aborted = vec![false; num_zones as usize];
        for zone in 0..num_zones {
            aborted[zone as usize] = self.phase(zone).await? == Some(RedistPhase::AbortZone);
        }

        cluster.zones = self
            .read_zones(keys::TAG_REDIST_NODE_SHARDS, num_zones)
            .await?;

        let mut missing = Vec::new();
        for zone in cluster.redist_zones() {
            let present = !cluster.zones[zone as usize].is_empty();
            match (present, aborted[zone as usize]) {
                (false, false) => {
                    tracing::error!("candidate shards missing for zone {}", zone);
                    missing.push(zone);
                }
                (true, true) => {
                    return Err(Error::Redist(format!(
                        "candidate shards left behind for skipped zone {}",
                        zone
                    )));
                }
                _ => {}
            }
        }

        if !missing.is_empty() {
            return Err(Error::Redist(format!(
                "candidate shards missing for zones {:?}",
                missing
            )));
        }
        Ok(())
    }
}
