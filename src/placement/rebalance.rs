//! Incremental rebalancing of one zone
//!
//! Adding a node takes shards from the most loaded nodes until the new node
//! is within one shard of them; removing the last node hands its shards to
//! the least loaded nodes. Only moved shards change owner.

use crate::common::MappingAlg;
use crate::placement::Filter;
use crate::topology::{Node, Zone};

impl Node {
    /// Remove and return one primary shard to move to `(target_zone, target_node)`.
    pub fn take_primary(
        &mut self,
        alg: MappingAlg,
        filter: Option<&mut Filter>,
        target_zone: u32,
        target_node: u32,
    ) -> Option<u32> {
        let last = self.primary_shards.len().checked_sub(1)?;
        let mut ix = match filter {
            Some(filter) => filter.select_shard_for_move(
                &self.primary_shards,
                target_zone,
                target_node,
                alg,
            ),
            None => 0,
        };
        if alg == MappingAlg::V2 {
            ix = last;
        }
        Some(self.primary_shards.swap_remove(ix.min(last)))
    }

    /// Remove and return one secondary shard to move to `(target_zone, target_node)`.
    pub fn take_secondary(
        &mut self,
        alg: MappingAlg,
        filter: Option<&mut Filter>,
        target_zone: u32,
        target_node: u32,
    ) -> Option<u32> {
        let last = self.secondary_shards.len().checked_sub(1)?;
        let ix = match filter {
            Some(filter) => filter.select_shard_for_move(
                &self.secondary_shards,
                target_zone,
                target_node,
                alg,
            ),
            None => 0,
        };
        Some(self.secondary_shards.swap_remove(ix.min(last)))
    }
}

#[derive(Clone, Copy)]
enum Role {
    Primary,
    Secondary,
}

impl Role {
    fn len(self, node: &Node) -> usize {
        match self {
            Role::Primary => node.primary_len(),
            Role::Secondary => node.secondary_len(),
        }
    }

    fn take(
        self,
        node: &mut Node,
        alg: MappingAlg,
        filter: Option<&mut Filter>,
        target_zone: u32,
        target_node: u32,
    ) -> Option<u32> {
        match self {
            Role::Primary => node.take_primary(alg, filter, target_zone, target_node),
            Role::Secondary => node.take_secondary(alg, filter, target_zone, target_node),
        }
    }

    fn push(self, node: &mut Node, shard: u32) {
        match self {
            Role::Primary => node.primary_shards.push(shard),
            Role::Secondary => node.secondary_shards.push(shard),
        }
    }
}

impl Zone {
    /// Build a zone of `num_nodes` nodes by starting from one node holding
    /// every shard and adding the others one at a time.
    pub fn from_config(
        zone_id: u32,
        num_nodes: usize,
        num_zones: u32,
        num_shards: u32,
        alg: MappingAlg,
    ) -> Self {
        let mut first = Node::new(zone_id, 0);
        first.init_shards(num_zones, num_shards, alg);
        let mut zone = Zone::with_nodes(zone_id, vec![first]);
        for _ in 1..num_nodes {
            zone.add_one_node(alg, None);
        }
        zone
    }

    /// Append a node and move shards to it until it is balanced with the rest.
    pub fn add_one_node(&mut self, alg: MappingAlg, mut filter: Option<&mut Filter>) {
        let zone_id = self.zone_id;
        let mut target = Node::new(zone_id, self.nodes.len() as u32);

        self.fill_target(&mut target, Role::Primary, alg, filter.as_deref_mut());

        if alg == MappingAlg::V2 {
            target.primary_shards.sort_unstable();
        } else {
            self.fill_target(&mut target, Role::Secondary, alg, filter);
        }

        self.nodes.push(target);
        self.sync_num_nodes();
    }

    fn fill_target(
        &mut self,
        target: &mut Node,
        role: Role,
        alg: MappingAlg,
        mut filter: Option<&mut Filter>,
    ) {
        if self.nodes.is_empty() {
            return;
        }

        // Donors by shard count, heaviest first
        let mut order: Vec<usize> = (0..self.nodes.len()).collect();
        if alg == MappingAlg::V1 {
            order.sort_by(|&a, &b| role.len(&self.nodes[b]).cmp(&role.len(&self.nodes[a])));
        }

        let mut curr = 0;
        loop {
            let donor = match (alg, role) {
                // Last node among those holding the most primaries
                (MappingAlg::V2, Role::Primary) => {
                    let mut max = 0;
                    let mut donor = 0;
                    for (i, node) in self.nodes.iter().enumerate() {
                        if node.primary_len() >= max {
                            max = node.primary_len();
                            donor = i;
                        }
                    }
                    donor
                }
                _ => order[curr],
            };

            if role.len(target) + 1 >= role.len(&self.nodes[donor]) {
                break;
            }
            let Some(shard) = role.take(
                &mut self.nodes[donor],
                alg,
                filter.as_deref_mut(),
                target.zone_id,
                target.node_id,
            ) else {
                break;
            };
            role.push(target, shard);

            if alg == MappingAlg::V2 {
                continue;
            }

            let next = curr + 1;
            if next >= order.len() {
                curr = 0;
                continue;
            }
            // Stay with the heaviest donors until the current one drops below the next
            if role.len(&self.nodes[donor]) >= role.len(&self.nodes[order[next]]) {
                curr = 0;
            } else {
                curr = next;
            }
        }
    }

    /// Drop the last node, handing its shards to the least loaded nodes.
    pub fn remove_one_node(&mut self, alg: MappingAlg) {
        let Some(last) = self.nodes.len().checked_sub(1) else {
            return;
        };
        if last == 0 {
            return;
        }

        self.drain_last(last, Role::Primary, alg);
        self.drain_last(last, Role::Secondary, alg);

        self.nodes.truncate(last);
        self.sync_num_nodes();
    }

    fn drain_last(&mut self, last: usize, role: Role, alg: MappingAlg) {
        // Recipients by shard count, lightest first
        let mut order: Vec<usize> = (0..last).collect();
        order.sort_by_key(|&i| role.len(&self.nodes[i]));

        let mut curr = 0;
        loop {
            let recipient = order[curr];
            let (zone_id, node_id) = (self.zone_id, self.nodes[recipient].node_id);
            let Some(shard) = role.take(&mut self.nodes[last], alg, None, zone_id, node_id) else {
                break;
            };
            role.push(&mut self.nodes[recipient], shard);

            let next = curr + 1;
            if next >= last {
                curr = 0;
                continue;
            }
            if role.len(&self.nodes[recipient]) <= role.len(&self.nodes[order[next]]) {
                curr = 0;
            } else {
                curr = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sorted(mut v: Vec<u32>) -> Vec<u32> {
        v.sort_unstable();
        v
    }

    #[test]
    fn test_scale_out_two_zones_four_shards() {
        let mut zone = Zone::from_config(0, 1, 2, 4, MappingAlg::V1);
        assert_eq!(zone.nodes[0].primary_shards, vec![0, 1, 2, 3]);

        zone.add_one_node(MappingAlg::V1, None);

        assert_eq!(zone.len(), 2);
        assert_eq!(zone.num_nodes, 2);
        assert_eq!(zone.nodes[0].primary_len(), 2);
        assert_eq!(zone.nodes[1].primary_len(), 2);
        let all = sorted(zone.nodes.iter().flat_map(|n| n.primary_shards.clone()).collect());
        assert_eq!(all, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_add_node_moves_only_to_new_node() {
        let mut zone = Zone::from_config(1, 3, 3, 60, MappingAlg::V1);
        let before = zone.clone();
        zone.add_one_node(MappingAlg::V1, None);

        for (old, new) in before.nodes.iter().zip(zone.nodes.iter()) {
            for shard in new.shards() {
                assert!(old.holds(shard), "shard {} appeared on node {}", shard, new.node_id);
            }
        }
        let moved = zone.nodes[3].total_len();
        assert!(moved > 0 && moved <= 60 / 4 + 2);
        let all = sorted(zone.nodes.iter().flat_map(|n| n.shards()).collect());
        assert_eq!(all, (0..60).collect::<Vec<_>>());
    }

    #[test]
    fn test_balanced_after_growth() {
        let zone = Zone::from_config(0, 7, 3, 100, MappingAlg::V1);
        let primaries: Vec<usize> = zone.nodes.iter().map(Node::primary_len).collect();
        let (min, max) = (
            *primaries.iter().min().unwrap(),
            *primaries.iter().max().unwrap(),
        );
        assert!(max - min <= 2, "unbalanced primaries {:?}", primaries);
    }

    #[test]
    fn test_remove_one_node() {
        let mut zone = Zone::from_config(0, 4, 2, 32, MappingAlg::V1);
        let kept: Vec<Node> = zone.nodes[..3].to_vec();
        zone.remove_one_node(MappingAlg::V1);

        assert_eq!(zone.len(), 3);
        for (old, new) in kept.iter().zip(zone.nodes.iter()) {
            for shard in old.shards() {
                assert!(new.holds(shard));
            }
        }
        let all = sorted(zone.nodes.iter().flat_map(|n| n.primary_shards.clone()).collect());
        assert_eq!(all, (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn test_remove_single_node_is_noop() {
        let mut zone = Zone::from_config(0, 1, 2, 8, MappingAlg::V1);
        zone.remove_one_node(MappingAlg::V1);
        assert_eq!(zone.len(), 1);
        assert_eq!(zone.nodes[0].total_len(), 8);
    }

    #[test]
    fn test_v2_new_node_sorted() {
        let zone = Zone::from_config(0, 3, 3, 30, MappingAlg::V2);
        assert_eq!(zone.nodes[0].primary_shards, (0..10).collect::<Vec<_>>());
        for node in &zone.nodes[1..] {
            let mut s = node.primary_shards.clone();
            s.sort_unstable();
            assert_eq!(s, node.primary_shards);
            assert!(node.secondary_shards.is_empty());
        }
        let total: usize = zone.nodes.iter().map(Node::primary_len).sum();
        assert_eq!(total, 30);
    }
}
