//! ShardMap: `shard → zone → node` lookup derived from a cluster

use crate::common::{Error, Result};
use crate::topology::Cluster;
use std::fmt::Write;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShardMapEntry {
    pub node_id: u32,
    pub is_primary: bool,
    assigned: bool,
}

/// Read-only routing index, rebuilt from a [`Cluster`] and never edited.
#[derive(Debug, Clone, Default)]
pub struct ShardMap {
    num_zones: u32,
    num_shards: u32,
    shards: Vec<Vec<ShardMapEntry>>,
}

impl ShardMap {
    pub fn new(cluster: &Cluster) -> Self {
        let num_zones = cluster.config.num_zones;
        let num_shards = cluster.config.num_shards;
        let mut shards =
            vec![vec![ShardMapEntry::default(); num_zones as usize]; num_shards as usize];

        for zone in &cluster.zones {
            if zone.zone_id >= num_zones {
                continue;
            }
            for node in &zone.nodes {
                let placed = node
                    .primary_shards
                    .iter()
                    .map(|&s| (s, true))
                    .chain(node.secondary_shards.iter().map(|&s| (s, false)));
                for (shard, is_primary) in placed {
                    match shards.get_mut(shard as usize) {
                        Some(row) => {
                            row[zone.zone_id as usize] = ShardMapEntry {
                                node_id: node.node_id,
                                is_primary,
                                assigned: true,
                            }
                        }
                        None => tracing::warn!(
                            "shard {} on node {}/{} is out of range (num_shards={})",
                            shard,
                            zone.zone_id,
                            node.node_id,
                            num_shards
                        ),
                    }
                }
            }
        }

        Self {
            num_zones,
            num_shards,
            shards,
        }
    }

    pub fn num_zones(&self) -> u32 {
        self.num_zones
    }

    pub fn num_shards(&self) -> u32 {
        self.num_shards
    }

    pub fn entry(&self, shard: u32, zone: u32) -> Option<ShardMapEntry> {
        self.shards
            .get(shard as usize)
            .and_then(|row| row.get(zone as usize))
            .filter(|e| e.assigned)
            .copied()
    }

    /// Node serving `shard` in `zone`.
    pub fn node_id(&self, shard: u32, zone: u32) -> Result<u32> {
        if shard >= self.num_shards || zone >= self.num_zones {
            return Err(Error::NotFound(format!(
                "shard {} zone {} out of range ({} shards, {} zones)",
                shard, zone, self.num_shards, self.num_zones
            )));
        }
        self.entry(shard, zone)
            .map(|e| e.node_id)
            .ok_or_else(|| Error::NotFound(format!("shard {} has no node in zone {}", shard, zone)))
    }

    /// `(zone, node)` pairs serving `shard`: primary zones first, walking the
    /// zones from `start_zone`, then secondary zones in the same order.
    pub fn get_nodes(&self, shard: u32, start_zone: u32) -> Result<Vec<(u32, u32)>> {
        let row = self
            .shards
            .get(shard as usize)
            .ok_or_else(|| Error::NotFound(format!("shard {} out of range", shard)))?;
        if self.num_zones == 0 {
            return Ok(Vec::new());
        }

        let rotation = (0..self.num_zones).map(|i| (start_zone + i) % self.num_zones);
        let mut primaries = Vec::with_capacity(self.num_zones as usize);
        let mut secondaries = Vec::new();
        for zone in rotation {
            let entry = row[zone as usize];
            if !entry.assigned {
                continue;
            }
            if entry.is_primary {
                primaries.push((zone, entry.node_id));
            } else {
                secondaries.push((zone, entry.node_id));
            }
        }
        primaries.extend(secondaries);
        Ok(primaries)
    }

    /// One line per shard, `zone:node` with `*` marking primaries.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (shard, row) in self.shards.iter().enumerate() {
            let _ = write!(out, "shard {:>5}:", shard);
            for (zone, entry) in row.iter().enumerate() {
                if entry.assigned {
                    let mark = if entry.is_primary { "*" } else { "" };
                    let _ = write!(out, " {}:{}{}", zone, entry.node_id, mark);
                }
            }
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ClusterConfig;

    fn three_zone_cluster() -> Cluster {
        let mut cluster = Cluster::new(ClusterConfig {
            alg_version: 1,
            num_zones: 3,
            num_shards: 6,
            conn_info: vec![
                vec!["a0:1".into(), "a1:1".into()],
                vec!["b0:1".into()],
                vec!["c0:1".into()],
            ],
            ..Default::default()
        });
        cluster.populate_from_config().unwrap();
        cluster
    }

    #[test]
    fn test_get_nodes_primary_first() {
        let cluster = three_zone_cluster();
        let map = cluster.shard_map();

        // Shard 1: residue 1 is secondary in zone 1 only
        let nodes = map.get_nodes(1, 2).unwrap();
        let zones: Vec<u32> = nodes.iter().map(|(z, _)| *z).collect();
        assert_eq!(zones, vec![2, 0, 1]);
        assert!(!map.entry(1, 1).unwrap().is_primary);
    }

    #[test]
    fn test_node_id_matches_cluster() {
        let cluster = three_zone_cluster();
        let map = cluster.shard_map();
        for zone in &cluster.zones {
            for node in &zone.nodes {
                for shard in node.shards() {
                    assert_eq!(map.node_id(shard, zone.zone_id).unwrap(), node.node_id);
                }
            }
        }
        assert!(map.node_id(6, 0).is_err());
        assert!(map.node_id(0, 3).is_err());
    }

    #[test]
    fn test_dump_lists_every_shard() {
        let cluster = three_zone_cluster();
        let dump = cluster.shard_map().dump();
        assert_eq!(dump.lines().count(), 6);
        assert!(dump.contains("shard     0:"));
    }
}
