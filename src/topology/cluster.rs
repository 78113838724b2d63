//! Cluster: configuration plus the populated zones of one topology version

use crate::common::{ClusterConfig, Error, MappingAlg, Result};
use crate::placement::{match_zones, new_zones, Filter};
use crate::topology::{Node, ShardMap, Zone};
use std::fmt::Write;

/// A shard that changes node within a zone between two topologies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardMove {
    pub zone_id: u32,
    pub shard_id: u32,
    pub from_node: u32,
    pub to_node: u32,
    pub is_primary: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cluster {
    pub config: ClusterConfig,
    pub zones: Vec<Zone>,
    redist_zone: Option<u32>,
}

impl Cluster {
    pub fn new(config: ClusterConfig) -> Self {
        Self {
            config,
            zones: Vec::new(),
            redist_zone: None,
        }
    }

    pub fn num_zones(&self) -> u32 {
        self.config.num_zones
    }

    pub fn num_shards(&self) -> u32 {
        self.config.num_shards
    }

    pub fn alg(&self) -> Result<MappingAlg> {
        self.config.mapping_alg()
    }

    /// Restrict redistribution to one zone; `None` covers every zone.
    pub fn set_redist_zone(&mut self, zone: Option<u32>) {
        self.redist_zone = zone;
    }

    pub fn redist_zone(&self) -> Option<u32> {
        self.redist_zone
    }

    pub fn is_redist_zone(&self, zone: u32) -> bool {
        self.redist_zone.map_or(true, |z| z == zone)
    }

    /// Zones taking part in the current redistribution.
    pub fn redist_zones(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.num_zones()).filter(move |z| self.is_redist_zone(*z))
    }

    pub fn zone(&self, zone_id: u32) -> Option<&Zone> {
        self.zones.get(zone_id as usize)
    }

    pub fn node(&self, zone_id: u32, node_id: u32) -> Option<&Node> {
        self.zone(zone_id).and_then(|z| z.node(node_id))
    }

    pub fn endpoint(&self, zone_id: u32, node_id: u32) -> Option<&str> {
        self.config
            .conn_info
            .get(zone_id as usize)
            .and_then(|z| z.get(node_id as usize))
            .map(String::as_str)
    }

    /// Check a populated cluster: every zone has nodes and endpoints, and
    /// there are at least as many logical nodes as physical endpoints.
    pub fn validate(&self) -> Result<()> {
        let num_zones = self.num_zones() as usize;
        if num_zones == 0 {
            return Err(Error::Validation("num_zones is 0".into()));
        }
        if self.zones.len() != num_zones {
            return Err(Error::Validation(format!(
                "num_zones={} but {} zones populated",
                num_zones,
                self.zones.len()
            )));
        }

        for (zone_id, zone) in self.zones.iter().enumerate() {
            let endpoints = self.config.conn_info.get(zone_id).map_or(0, Vec::len);
            if zone.is_empty() || endpoints == 0 {
                return Err(Error::Validation(format!("missing zone {} info", zone_id)));
            }
            if zone.len() < endpoints {
                return Err(Error::Validation(format!(
                    "zone {}: {} logical nodes for {} physical nodes",
                    zone_id,
                    zone.len(),
                    endpoints
                )));
            }
        }
        Ok(())
    }

    /// First topology of a new cluster, computed from the configuration alone.
    pub fn populate_from_config(&mut self) -> Result<()> {
        self.config.validate()?;
        self.populate_from_redist(None)
    }

    /// Compute the topology for the node counts in `conn_info`, moving as few
    /// shards as possible away from `current`.
    pub fn populate_from_redist(&mut self, current: Option<&[Zone]>) -> Result<()> {
        let alg = self.alg()?;
        let num_zones = self.num_zones();
        let num_shards = self.num_shards();
        let counts = self.config.node_counts();
        if counts.len() != num_zones as usize || counts.iter().any(|&n| n == 0) {
            return Err(Error::Config(format!(
                "conn_info must list at least one node for each of {} zones",
                num_zones
            )));
        }

        match alg {
            MappingAlg::V2 => {
                if let Some(current) = current {
                    let current_counts: Vec<usize> = current.iter().map(Zone::len).collect();
                    let expected = new_zones(num_zones, num_shards, &current_counts);
                    match_zones(&expected, current).map_err(|e| {
                        Error::TopologyDrift(format!(
                            "current topology is not what the mapping expects: {}",
                            e
                        ))
                    })?;
                }
                self.zones = new_zones(num_zones, num_shards, &counts);
            }
            MappingAlg::V1 => {
                let empty: Vec<Zone>;
                let base = match current {
                    Some(zones) => zones,
                    None => {
                        empty = (0..num_zones).map(Zone::empty).collect();
                        &empty
                    }
                };
                let (mut work, mut filter) = Filter::clone_zones(base, num_zones);
                self.zones = filter.expand_nodes(&mut work, &counts, num_shards, alg);
            }
        }

        tracing::debug!("populated topology:\n{}", self.dump());
        Ok(())
    }

    /// Fill every absent zone from `current`, returning the zones copied.
    pub fn merge_with(&mut self, current: &Cluster) -> Vec<u32> {
        let num_zones = self.num_zones() as usize;
        while self.zones.len() < num_zones {
            let zone_id = self.zones.len() as u32;
            self.zones.push(Zone::empty(zone_id));
        }
        if self.config.conn_info.len() < num_zones {
            self.config.conn_info.resize(num_zones, Vec::new());
        }

        let mut skipped = Vec::new();
        for zone_id in 0..num_zones {
            if !self.zones[zone_id].is_empty() {
                continue;
            }
            if let Some(zone) = current.zones.get(zone_id) {
                self.zones[zone_id] = zone.clone();
            }
            if let Some(endpoints) = current.config.conn_info.get(zone_id) {
                self.config.conn_info[zone_id] = endpoints.clone();
            }
            skipped.push(zone_id as u32);
        }
        skipped
    }

    pub fn shard_map(&self) -> ShardMap {
        ShardMap::new(self)
    }

    /// Shards of the redistribution zones that sit on a different node in
    /// `candidate`, in node order.
    pub fn moved_shards(&self, candidate: &Cluster) -> Vec<ShardMove> {
        let map = candidate.shard_map();
        let mut moves = Vec::new();
        for zone in &self.zones {
            if !candidate.is_redist_zone(zone.zone_id) {
                continue;
            }
            for node in &zone.nodes {
                let held = node
                    .primary_shards
                    .iter()
                    .map(|&s| (s, true))
                    .chain(node.secondary_shards.iter().map(|&s| (s, false)));
                for (shard_id, is_primary) in held {
                    let Ok(to_node) = map.node_id(shard_id, zone.zone_id) else {
                        continue;
                    };
                    if to_node != node.node_id {
                        moves.push(ShardMove {
                            zone_id: zone.zone_id,
                            shard_id,
                            from_node: node.node_id,
                            to_node,
                            is_primary,
                        });
                    }
                }
            }
        }
        moves
    }

    /// Human-readable list of shard moves from this topology to `candidate`.
    pub fn change_map(&self, candidate: &Cluster) -> String {
        let mut out = String::new();
        let moves = self.moved_shards(candidate);
        for zone_id in candidate.redist_zones() {
            let in_zone: Vec<_> = moves.iter().filter(|m| m.zone_id == zone_id).collect();
            let _ = writeln!(out, "zone {}: {} shards move", zone_id, in_zone.len());
            for m in in_zone {
                let role = if m.is_primary { "primary" } else { "secondary" };
                let _ = writeln!(
                    out,
                    "  shard {:>5} ({}) node {} -> node {}",
                    m.shard_id, role, m.from_node, m.to_node
                );
            }
        }
        out
    }

    pub fn dump(&self) -> String {
        let mut out = format!(
            "alg_version={} num_zones={} num_shards={}\n",
            self.config.alg_version,
            self.num_zones(),
            self.num_shards()
        );
        for zone in &self.zones {
            let _ = write!(out, "{}", zone);
            if let Some(endpoints) = self.config.conn_info.get(zone.zone_id as usize) {
                let _ = writeln!(out, "  endpoints: {}", endpoints.join(", "));
            }
        }
        out
    }
}
