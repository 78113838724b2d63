//! Filter: shard positions tracked while a topology is being expanded
//!
//! When several zones grow at once, the shards moved onto new nodes in one
//! zone should not also be the ones moved in the other zones. The filter
//! remembers where every shard sits in every zone and scores candidate moves
//! so that a shard already living on new nodes elsewhere is moved last.

use crate::common::MappingAlg;
use crate::topology::{is_primary, Node, Zone};
use std::collections::HashMap;

const SCORE_SCALE: i64 = 1000;
const PRIMARY_WEIGHT: i64 = 10;
const SECONDARY_WEIGHT: i64 = 9;

#[derive(Debug, Clone, Default)]
pub struct Filter {
    shard_pos: Vec<HashMap<u32, u32>>,
    base: u32,
}

impl Filter {
    pub fn new(num_zones: u32) -> Self {
        Self {
            shard_pos: vec![HashMap::new(); num_zones as usize],
            base: 0,
        }
    }

    pub fn num_zones(&self) -> u32 {
        self.shard_pos.len() as u32
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn set_base(&mut self, base: u32) {
        self.base = base;
    }

    fn init_zone(&mut self, zone: u32) {
        if let Some(pos) = self.shard_pos.get_mut(zone as usize) {
            pos.clear();
        }
    }

    /// Nodes at or above `base` did not exist before this expansion.
    fn in_range(&self, node_id: u32) -> bool {
        self.base > 0 && node_id >= self.base
    }

    fn set(&mut self, zone: u32, shard: u32, node_id: u32) {
        if let Some(pos) = self.shard_pos.get_mut(zone as usize) {
            pos.insert(shard, node_id);
        }
    }

    /// Node holding `shard` in `zone`; unknown shards read as node 0.
    pub fn get(&self, zone: u32, shard: u32) -> u32 {
        self.shard_pos
            .get(zone as usize)
            .and_then(|pos| pos.get(&shard))
            .copied()
            .unwrap_or(0)
    }

    /// Copy `current` into work zones and record where each shard sits.
    /// `base` becomes the smallest node count of any zone.
    pub fn clone_zones(current: &[Zone], num_zones: u32) -> (Vec<Zone>, Filter) {
        let mut filter = Filter::new(num_zones);
        let mut work = Vec::with_capacity(num_zones as usize);
        let mut base = 1000u32;

        for zone_id in 0..num_zones {
            let nodes: Vec<Node> = current
                .get(zone_id as usize)
                .map(|z| z.nodes.clone())
                .unwrap_or_default();
            base = base.min(nodes.len() as u32);

            for (node_id, node) in nodes.iter().enumerate() {
                for shard in node.shards() {
                    filter.set(zone_id, shard, node_id as u32);
                }
            }
            work.push(Zone::with_nodes(zone_id, nodes));
        }

        filter.set_base(base);
        (work, filter)
    }

    /// Grow or shrink every work zone to `node_counts[zone]` nodes and return
    /// the resulting zones.
    ///
    /// Zones grow in lock-step, one node per round across all zones, so each
    /// move is scored against the moves already made in the other zones.
    pub fn expand_nodes(
        &mut self,
        work: &mut [Zone],
        node_counts: &[usize],
        num_shards: u32,
        alg: MappingAlg,
    ) -> Vec<Zone> {
        let num_zones = work.len().min(node_counts.len());
        let mut zones: Vec<Zone> = (0..work.len() as u32).map(Zone::empty).collect();
        let max_nodes = node_counts.iter().copied().max().unwrap_or(0);

        for i in 0..num_zones {
            let zone_id = i as u32;
            let wanted = node_counts[i];
            if wanted == 0 {
                continue;
            }

            if !work[i].is_empty() {
                let extra = work[i].len().saturating_sub(wanted);
                for _ in 0..extra {
                    work[i].remove_one_node(alg);
                }
                if work[i].len() >= wanted {
                    zones[i] = Zone::with_nodes(zone_id, work[i].nodes[..wanted].to_vec());
                }
                continue;
            }

            // New zone: one node holding everything
            self.init_zone(zone_id);
            for shard in 0..num_shards {
                self.set(zone_id, shard, 0);
            }
            let mut first = Node::new(zone_id, 0);
            first.init_shards(self.num_zones(), num_shards, alg);
            work[i] = Zone::with_nodes(zone_id, vec![first]);
            if wanted == 1 {
                zones[i] = work[i].clone();
            }
        }

        for j in 1..max_nodes {
            for i in 0..num_zones {
                if j < work[i].len() {
                    continue;
                }
                work[i].add_one_node(alg, Some(&mut *self));
                if j + 1 == node_counts[i] {
                    zones[i] = Zone::with_nodes(i as u32, work[i].nodes[..=j].to_vec());
                }
            }
        }

        zones
    }

    /// Pick which of `shards` to move to `(target_zone, target_node)` and
    /// record the move.
    ///
    /// Each candidate scores `count * 1000 + max_node`, where `count` sums a
    /// weight for every other zone whose copy of the shard already sits on a
    /// new node and `max_node` is the highest node id holding it elsewhere.
    /// The first lowest score wins.
    pub fn select_shard_for_move(
        &mut self,
        shards: &[u32],
        target_zone: u32,
        target_node: u32,
        alg: MappingAlg,
    ) -> usize {
        if shards.len() == 1 {
            self.set(target_zone, shards[0], target_node);
            return 0;
        }

        let num_zones = self.num_zones();
        let mut ix = 0;
        let mut min = 1000 * SCORE_SCALE;

        for (i, &shard) in shards.iter().enumerate() {
            let mut max: i64 = -1;
            let mut count: i64 = 0;
            for zone in (0..num_zones).filter(|&z| z != target_zone) {
                let node_id = self.get(zone, shard);
                max = max.max(node_id as i64);
                if self.in_range(node_id) {
                    count += if is_primary(shard, zone, num_zones, alg) {
                        PRIMARY_WEIGHT
                    } else {
                        SECONDARY_WEIGHT
                    };
                }
            }

            let score = count * SCORE_SCALE + max;
            if score >= 0 && score < min {
                min = score;
                ix = i;
            }
        }

        if let Some(&shard) = shards.get(ix) {
            self.set(target_zone, shard, target_node);
        }
        ix
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::placement::validate_zones;

    fn initial(counts: &[usize], num_shards: u32) -> Vec<Zone> {
        let num_zones = counts.len() as u32;
        let empty: Vec<Zone> = (0..num_zones).map(Zone::empty).collect();
        let (mut work, mut filter) = Filter::clone_zones(&empty, num_zones);
        filter.expand_nodes(&mut work, counts, num_shards, MappingAlg::V1)
    }

    #[test]
    fn test_clone_zones_records_positions() {
        let zones = initial(&[2, 3], 20);
        let (work, filter) = Filter::clone_zones(&zones, 2);
        assert_eq!(work, zones);
        assert_eq!(filter.base(), 2);
        for zone in &zones {
            for node in &zone.nodes {
                for shard in node.shards() {
                    assert_eq!(filter.get(zone.zone_id, shard), node.node_id);
                }
            }
        }
    }

    #[test]
    fn test_expand_from_nothing_is_partitioned() {
        let zones = initial(&[3, 1, 5], 64);
        assert_eq!(zones.iter().map(Zone::len).collect::<Vec<_>>(), vec![3, 1, 5]);
        validate_zones(&zones, 64, MappingAlg::V1).unwrap();
    }

    #[test]
    fn test_expand_grow_and_shrink() {
        let current = initial(&[3, 3, 3], 48);
        let (mut work, mut filter) = Filter::clone_zones(&current, 3);
        let zones = filter.expand_nodes(&mut work, &[4, 3, 2], 48, MappingAlg::V1);

        assert_eq!(zones.iter().map(Zone::len).collect::<Vec<_>>(), vec![4, 3, 2]);
        assert_eq!(zones[1], current[1]);
        validate_zones(&zones, 48, MappingAlg::V1).unwrap();
    }

    #[test]
    fn test_select_prefers_shard_not_yet_on_new_nodes() {
        let mut filter = Filter::new(3);
        filter.set_base(2);
        // Shard 10 already moved to new node 2 in zones 1 and 2
        filter.set(1, 10, 2);
        filter.set(2, 10, 2);
        // Shard 11 still on original nodes
        filter.set(1, 11, 1);
        filter.set(2, 11, 0);
        // Shard 12 moved in one zone
        filter.set(1, 12, 3);
        filter.set(2, 12, 1);

        let ix = filter.select_shard_for_move(&[10, 12, 11], 0, 2, MappingAlg::V1);
        assert_eq!(ix, 2);
        assert_eq!(filter.get(0, 11), 2);
    }

    #[test]
    fn test_select_is_min_risk() {
        let mut filter = Filter::new(4);
        filter.set_base(3);
        let shards: Vec<u32> = (0..8).collect();
        for &shard in &shards {
            for zone in 1..4 {
                // Spread shards over old and new nodes
                filter.set(zone, shard, (shard + zone) % 5);
            }
        }

        let score = |f: &Filter, shard: u32| -> i64 {
            let mut count = 0;
            let mut max = -1;
            for zone in 1..4 {
                let node = f.get(zone, shard);
                max = max.max(node as i64);
                if node >= 3 {
                    count += if is_primary(shard, zone, 4, MappingAlg::V1) { 10 } else { 9 };
                }
            }
            count * 1000 + max
        };
        let before: Vec<i64> = shards.iter().map(|&s| score(&filter, s)).collect();

        let ix = filter.select_shard_for_move(&shards, 0, 3, MappingAlg::V1);
        assert!(before.iter().all(|&s| s >= before[ix]));
        assert_eq!(before.iter().position(|&s| s == before[ix]), Some(ix));
    }

    #[test]
    fn test_single_shard() {
        let mut filter = Filter::new(2);
        assert_eq!(filter.select_shard_for_move(&[7], 1, 4, MappingAlg::V1), 0);
        assert_eq!(filter.get(1, 7), 4);
    }
}
