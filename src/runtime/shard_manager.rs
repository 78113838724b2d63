//! ShardManager: routes shards to node connections for one topology version
//!
//! A manager owns one processor per `(zone, node)` of its topology. When a
//! new version is installed, processors whose endpoint did not change are
//! carried over instead of reconnecting, and the old manager only shuts down
//! the ones the new manager did not take.

use crate::common::{shard_info, Error, MappingAlg, Result, StatsConfig};
use crate::runtime::markdown::ZoneMarkdown;
use crate::runtime::processor::{ConnectionFactory, OutboundProcessor};
use crate::runtime::stats::{ClusterStats, ProcStat};
use crate::topology::{Cluster, ShardMap};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Processors serving one shard, in the order requests should try them.
/// Each processor comes with its position in the shard's replica list.
#[derive(Debug, Clone)]
pub struct Route {
    pub shard_id: u32,
    pub processors: Vec<(Arc<OutboundProcessor>, usize)>,
}

/// Shards by how many of their zones are connected
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectivityStats {
    /// Every zone connected
    pub ok: u32,
    /// Fewer than a write quorum
    pub bad: u32,
    /// More than a write quorum but not all
    pub warn: u32,
    /// Exactly a write quorum
    pub alert: u32,
}

pub struct ShardManager {
    alg: MappingAlg,
    num_zones: u32,
    num_shards: u32,
    shard_map: ShardMap,
    processors: Vec<Vec<Arc<OutboundProcessor>>>,
    stats: Option<Arc<ClusterStats>>,
    markdown: Arc<ZoneMarkdown>,
}

impl ShardManager {
    /// Build the manager for `cluster`, reusing processors of `current`
    /// whose endpoint is unchanged. Must run inside a tokio runtime.
    pub fn new(
        cluster: &Cluster,
        factory: &dyn ConnectionFactory,
        stats_cfg: &StatsConfig,
        markdown: Arc<ZoneMarkdown>,
        current: Option<&ShardManager>,
    ) -> Result<Self> {
        let conn_info = &cluster.config.conn_info;
        if conn_info.is_empty() {
            return Err(Error::Config("cluster has no connection info".into()));
        }
        let alg = cluster.alg()?;
        let num_zones = cluster.num_zones();

        let mut processors = Vec::with_capacity(num_zones as usize);
        for zone in 0..num_zones {
            let endpoints = conn_info.get(zone as usize).map(Vec::as_slice).unwrap_or_default();
            let mut row = Vec::with_capacity(endpoints.len());
            for (node, endpoint) in endpoints.iter().enumerate() {
                let node = node as u32;
                let reused = current
                    .and_then(|m| m.processor(zone, node))
                    .filter(|p| p.conn_info() == endpoint);
                match reused {
                    Some(p) => {
                        tracing::debug!("reuse connection to {} (zone={}, node={})", endpoint, zone, node);
                        row.push(Arc::clone(p));
                    }
                    None => {
                        tracing::debug!("connect to {} (zone={}, node={})", endpoint, zone, node);
                        let conn = factory.init(endpoint);
                        conn.start();
                        row.push(Arc::new(OutboundProcessor::new(zone, node, conn)));
                    }
                }
            }
            processors.push(row);
        }

        let stats = stats_cfg.enabled().then(|| {
            let max_nodes = cluster.config.max_nodes_per_zone() as u32;
            let stats = Arc::new(ClusterStats::new(num_zones, max_nodes, stats_cfg));
            stats.run();
            stats
        });

        tracing::info!(
            "shard manager initialized (zones: {}, shards: {})",
            num_zones,
            cluster.num_shards()
        );
        Ok(Self {
            alg,
            num_zones,
            num_shards: cluster.num_shards(),
            shard_map: cluster.shard_map(),
            processors,
            stats,
            markdown,
        })
    }

    pub fn alg(&self) -> MappingAlg {
        self.alg
    }

    pub fn num_zones(&self) -> u32 {
        self.num_zones
    }

    pub fn num_shards(&self) -> u32 {
        self.num_shards
    }

    pub fn shard_map(&self) -> &ShardMap {
        &self.shard_map
    }

    pub fn stats(&self) -> Option<&Arc<ClusterStats>> {
        self.stats.as_ref()
    }

    pub fn processor(&self, zone: u32, node: u32) -> Option<&Arc<OutboundProcessor>> {
        self.processors.get(zone as usize)?.get(node as usize)
    }

    fn is_up(&self, zone: u32, node: u32) -> bool {
        self.processor(zone, node).is_some_and(|p| p.is_connected())
    }

    fn is_soft_marked(&self, zone: u32, node: u32) -> bool {
        self.stats
            .as_ref()
            .is_some_and(|s| s.is_marked_down(zone, node))
    }

    /// Route for `key`.
    pub fn get_ss_processors(&self, key: &[u8], write_quorum: usize) -> Result<Route> {
        let (shard, start_zone) = shard_info(key, self.num_shards, self.num_zones, self.alg);
        self.get_ss_processors_for_shard(shard, start_zone, write_quorum)
    }

    /// Route for `shard`, trying zones from `start_zone`.
    ///
    /// The hard markdown zone is left out unless too few healthy replicas
    /// would remain to reach `write_quorum`. Soft-marked nodes go last and
    /// disconnected nodes are dropped.
    pub fn get_ss_processors_for_shard(
        &self,
        shard: u32,
        start_zone: u32,
        write_quorum: usize,
    ) -> Result<Route> {
        let nodes = self.shard_map.get_nodes(shard, start_zone)?;

        let mut markdown_zone = self.markdown.check();
        if markdown_zone.is_some() {
            let up = nodes
                .iter()
                .filter(|&&(z, n)| self.is_up(z, n) && !self.is_soft_marked(z, n))
                .count();
            if up <= write_quorum {
                markdown_zone = None;
            }
        }

        let mut processors = Vec::with_capacity(nodes.len());
        let mut soft_marked = Vec::new();
        for (pos, &(zone, node)) in nodes.iter().enumerate() {
            if markdown_zone == Some(zone) {
                continue;
            }
            if self.is_soft_marked(zone, node) {
                soft_marked.push(pos);
                continue;
            }
            if let Some(p) = self.processor(zone, node).filter(|p| p.is_connected()) {
                processors.push((Arc::clone(p), pos));
            }
        }
        for pos in soft_marked {
            let (zone, node) = nodes[pos];
            if let Some(p) = self.processor(zone, node).filter(|p| p.is_connected()) {
                processors.push((Arc::clone(p), pos));
            }
        }

        Ok(Route {
            shard_id: shard,
            processors,
        })
    }

    /// Connected zones of `shard`.
    fn connected_zones(&self, shard: u32) -> usize {
        (0..self.num_zones)
            .filter(|&zone| {
                self.shard_map
                    .entry(shard, zone)
                    .is_some_and(|e| self.is_up(zone, e.node_id))
            })
            .count()
    }

    fn write_quorum(&self) -> usize {
        (self.num_zones as usize + 1) / 2
    }

    /// Every shard reaches a write quorum of connected zones.
    pub fn is_connectivity_ok(&self) -> bool {
        if self.processors.is_empty() {
            return false;
        }
        let quorum = self.write_quorum();
        (0..self.num_shards).all(|shard| self.connected_zones(shard) >= quorum)
    }

    pub fn connectivity_stats(&self) -> ConnectivityStats {
        let mut stats = ConnectivityStats::default();
        if self.processors.is_empty() {
            return stats;
        }
        let quorum = self.write_quorum();
        let all = self.num_zones as usize;
        for shard in 0..self.num_shards {
            let ok = self.connected_zones(shard);
            if ok == all {
                stats.ok += 1;
            } else if ok < quorum {
                stats.bad += 1;
            } else if ok == quorum {
                stats.alert += 1;
            } else {
                stats.warn += 1;
            }
        }
        stats
    }

    /// Connection state by zone and node.
    pub fn connectivity(&self) -> Vec<Vec<bool>> {
        self.processors
            .iter()
            .map(|row| row.iter().map(|p| p.is_connected()).collect())
            .collect()
    }

    /// `zone:host` of disconnected nodes holding a shard that has fewer than
    /// a write quorum plus `level` connected zones.
    pub fn bad_shard_hosts(&self, level: u32) -> Vec<String> {
        let needed = self.write_quorum() + level as usize;
        let mut hosts = BTreeSet::new();
        for shard in 0..self.num_shards {
            let mut bad = BTreeSet::new();
            for zone in 0..self.num_zones {
                let Some(entry) = self.shard_map.entry(shard, zone) else {
                    continue;
                };
                if self.is_up(zone, entry.node_id) {
                    continue;
                }
                let host = self
                    .processor(zone, entry.node_id)
                    .map(|p| p.conn_info().split(':').next().unwrap_or_default().to_string())
                    .unwrap_or_default();
                bad.insert(format!("{}:{}", zone, host));
            }
            if (self.num_zones as usize).saturating_sub(bad.len()) < needed {
                hosts.extend(bad);
            }
        }
        hosts.into_iter().collect()
    }

    /// Report one request outcome to the health statistics.
    pub fn send_stats(&self, zone: u32, node: u32, timeout: bool, proc_time_us: i64) {
        if let Some(stats) = &self.stats {
            stats.send(ProcStat {
                zone,
                node,
                timeout,
                proc_time_us: proc_time_us.clamp(0, i32::MAX as i64) as i32,
            });
        }
    }

    /// Close every connection `next` did not carry over, then wait for them
    /// to drain.
    pub async fn shutdown(&self, next: Option<&ShardManager>) {
        let mut closing = Vec::new();
        for row in &self.processors {
            for p in row {
                let kept = next
                    .and_then(|m| m.processor(p.zone(), p.node()))
                    .is_some_and(|n| n.conn_info() == p.conn_info());
                if kept {
                    tracing::debug!("keep connection to {} ({})", p.conn_info(), p.name());
                    continue;
                }
                tracing::debug!("close connection to {} ({})", p.conn_info(), p.name());
                p.connection().shutdown();
                closing.push(Arc::clone(p));
            }
        }
        for p in &closing {
            p.connection().wait_shutdown().await;
        }

        if let Some(stats) = &self.stats {
            stats.quit();
        }
        tracing::info!("closed {} unused outbound connections", closing.len());
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::common::ClusterConfig;
    use crate::runtime::processor::NodeConnection;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    pub struct FakeConn {
        endpoint: String,
        pub connected: AtomicBool,
        pub shut: AtomicBool,
    }

    #[async_trait]
    impl NodeConnection for FakeConn {
        fn start(&self) {}

        fn shutdown(&self) {
            self.shut.store(true, Ordering::SeqCst);
            self.connected.store(false, Ordering::SeqCst);
        }

        async fn wait_shutdown(&self) {}

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn conn_info(&self) -> &str {
            &self.endpoint
        }
    }

    /// Connections that start out connected and can be toggled by endpoint
    #[derive(Default)]
    pub struct FakeFactory {
        pub created: AtomicUsize,
        pub conns: Mutex<HashMap<String, Arc<FakeConn>>>,
    }

    impl FakeFactory {
        pub fn set_connected(&self, endpoint: &str, connected: bool) {
            if let Some(c) = self.conns.lock().get(endpoint) {
                c.connected.store(connected, Ordering::SeqCst);
            }
        }

        pub fn conn(&self, endpoint: &str) -> Option<Arc<FakeConn>> {
            self.conns.lock().get(endpoint).cloned()
        }
    }

    impl ConnectionFactory for FakeFactory {
        fn init(&self, endpoint: &str) -> Arc<dyn NodeConnection> {
            self.created.fetch_add(1, Ordering::SeqCst);
            let conn = Arc::new(FakeConn {
                endpoint: endpoint.to_string(),
                connected: AtomicBool::new(true),
                shut: AtomicBool::new(false),
            });
            self.conns.lock().insert(endpoint.to_string(), Arc::clone(&conn));
            conn
        }
    }

    fn cluster(counts: &[usize], num_shards: u32) -> Cluster {
        let mut cluster = Cluster::new(ClusterConfig {
            alg_version: 1,
            num_zones: counts.len() as u32,
            num_shards,
            conn_info: counts
                .iter()
                .enumerate()
                .map(|(z, &n)| (0..n).map(|i| format!("10.1.{}.{}:5080", z, i)).collect())
                .collect(),
            ..Default::default()
        });
        cluster.populate_from_config().unwrap();
        cluster
    }

    fn stats_cfg() -> StatsConfig {
        StatsConfig {
            timeout_stats_enabled: true,
            markdown_threshold: 1,
            ..Default::default()
        }
    }

    fn zones(route: &Route) -> Vec<u32> {
        route.processors.iter().map(|(p, _)| p.zone()).collect()
    }

    #[tokio::test]
    async fn test_route_primary_first() {
        let factory = FakeFactory::default();
        let c = cluster(&[2, 2, 2], 12);
        let mgr =
            ShardManager::new(&c, &factory, &StatsConfig::default(), Arc::default(), None).unwrap();
        assert!(mgr.is_connectivity_ok());

        let route = mgr.get_ss_processors_for_shard(1, 2, 2).unwrap();
        assert_eq!(route.shard_id, 1);
        assert_eq!(zones(&route), vec![2, 0, 1]);
        let positions: Vec<usize> = route.processors.iter().map(|(_, pos)| *pos).collect();
        assert_eq!(positions, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_disconnected_dropped() {
        let factory = FakeFactory::default();
        let c = cluster(&[1, 1, 1], 6);
        let mgr =
            ShardManager::new(&c, &factory, &StatsConfig::default(), Arc::default(), None).unwrap();
        factory.set_connected("10.1.0.0:5080", false);

        let route = mgr.get_ss_processors_for_shard(0, 0, 2).unwrap();
        assert!(!zones(&route).contains(&0));
        assert_eq!(route.processors.len(), 2);
        assert!(mgr.is_connectivity_ok());

        factory.set_connected("10.1.1.0:5080", false);
        assert!(!mgr.is_connectivity_ok());
        assert_eq!(mgr.connectivity_stats().bad, 6);
        assert_eq!(mgr.bad_shard_hosts(0), vec!["0:10.1.0.0", "1:10.1.1.0"]);
    }

    #[tokio::test]
    async fn test_soft_marked_last() {
        let factory = FakeFactory::default();
        let c = cluster(&[1, 1, 1], 6);
        let mgr = ShardManager::new(&c, &factory, &stats_cfg(), Arc::default(), None).unwrap();
        let stats = mgr.stats().unwrap();
        stats.process_sample(
            &ProcStat {
                zone: 0,
                node: 0,
                timeout: true,
                proc_time_us: 0,
            },
            6000,
        );

        let route = mgr.get_ss_processors_for_shard(1, 0, 2).unwrap();
        assert_eq!(zones(&route), vec![2, 1, 0]);
        mgr.shutdown(None).await;
    }

    #[tokio::test]
    async fn test_hard_markdown_excluded() {
        let factory = FakeFactory::default();
        let c = cluster(&[1, 1, 1], 6);
        let markdown = Arc::new(ZoneMarkdown::new());
        let mgr = ShardManager::new(&c, &factory, &StatsConfig::default(), markdown.clone(), None)
            .unwrap();

        markdown.mark_down(1);
        let route = mgr.get_ss_processors_for_shard(1, 0, 2).unwrap();
        assert_eq!(zones(&route), vec![0, 2]);

        // Zone 0 down: excluding zone 1 as well would leave one replica
        factory.set_connected("10.1.0.0:5080", false);
        let route = mgr.get_ss_processors_for_shard(1, 0, 2).unwrap();
        assert_eq!(zones(&route), vec![2, 1]);
    }

    #[tokio::test]
    async fn test_carry_over_and_shutdown() {
        let factory = FakeFactory::default();
        let old = ShardManager::new(
            &cluster(&[2, 2], 8),
            &factory,
            &StatsConfig::default(),
            Arc::default(),
            None,
        )
        .unwrap();
        assert_eq!(factory.created.load(Ordering::SeqCst), 4);

        let new = ShardManager::new(
            &cluster(&[3, 2], 8),
            &factory,
            &StatsConfig::default(),
            Arc::default(),
            Some(&old),
        )
        .unwrap();
        assert_eq!(factory.created.load(Ordering::SeqCst), 5);
        assert!(Arc::ptr_eq(
            old.processor(0, 1).unwrap(),
            new.processor(0, 1).unwrap()
        ));

        old.shutdown(Some(&new)).await;
        for (_, conn) in factory.conns.lock().iter() {
            assert!(!conn.shut.load(Ordering::SeqCst));
        }
        new.shutdown(None).await;
        assert!(factory.conn("10.1.0.2:5080").unwrap().shut.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_key_routing_matches_shard_info() {
        let factory = FakeFactory::default();
        let c = cluster(&[2, 2, 2], 32);
        let mgr =
            ShardManager::new(&c, &factory, &StatsConfig::default(), Arc::default(), None).unwrap();
        let (shard, _) = shard_info(b"user:42", 32, 3, MappingAlg::V1);
        let route = mgr.get_ss_processors(b"user:42", 2).unwrap();
        assert_eq!(route.shard_id, shard);
        assert_eq!(route.processors.len(), 3);
    }
}
