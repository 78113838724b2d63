//! Placement of shards on nodes
//!
//! Two mappings are supported:
//! - `V1` partitions each zone's shards into primaries and secondaries by
//!   [`is_primary`](crate::topology::is_primary) and rebalances incrementally
//!   when node counts change, steered by a [`Filter`].
//! - `V2` replicates every shard in every zone; a zone's layout depends only
//!   on its node count, which makes drift against a recorded layout detectable
//!   with [`match_zones`].

pub mod filter;
pub mod rebalance;

pub use filter::Filter;

use crate::common::{Error, MappingAlg, Result};
use crate::topology::{is_primary, Zone};

/// Full-replication layout for the given node count of each zone.
pub fn new_zones(num_zones: u32, num_shards: u32, node_counts: &[usize]) -> Vec<Zone> {
    (0..num_zones)
        .map(|zone_id| {
            let count = node_counts.get(zone_id as usize).copied().unwrap_or(0);
            Zone::from_config(zone_id, count, num_zones, num_shards, MappingAlg::V2)
        })
        .collect()
}

/// Require `current` to equal `expected` node by node, shard lists included.
pub fn match_zones(expected: &[Zone], current: &[Zone]) -> Result<()> {
    if expected.len() != current.len() {
        return Err(mismatch(format!(
            "expected {} zones, found {}",
            expected.len(),
            current.len()
        )));
    }

    for (want, have) in expected.iter().zip(current) {
        if want.len() != have.len() {
            return Err(mismatch(format!(
                "zone {}: expected {} nodes, found {}",
                want.zone_id,
                want.len(),
                have.len()
            )));
        }
        for (a, b) in want.nodes.iter().zip(&have.nodes) {
            if a.primary_shards != b.primary_shards {
                return Err(mismatch(format!(
                    "zone {} node {}: primary shards {:?} != expected {:?}",
                    want.zone_id, a.node_id, b.primary_shards, a.primary_shards
                )));
            }
            if a.secondary_shards != b.secondary_shards {
                return Err(mismatch(format!(
                    "zone {} node {}: secondary shards {:?} != expected {:?}",
                    want.zone_id, a.node_id, b.secondary_shards, a.secondary_shards
                )));
            }
        }
    }
    Ok(())
}

fn mismatch(msg: String) -> Error {
    tracing::error!("zone mismatch: {}", msg);
    Error::Validation(msg)
}

/// Check the shard layout of every zone.
///
/// Each zone must be non-empty, record its node count, and hold every shard
/// in `0..num_shards` exactly once, primaries and secondaries agreeing with
/// the primary rule. All violations are logged; the first is returned.
pub fn validate_zones(zones: &[Zone], num_shards: u32, alg: MappingAlg) -> Result<()> {
    let num_zones = zones.len() as u32;
    let mut problems = Vec::new();

    for (zone_id, zone) in zones.iter().enumerate() {
        let zone_id = zone_id as u32;
        if zone.is_empty() {
            problems.push(format!("zone {} has no nodes", zone_id));
            continue;
        }
        if zone.num_nodes as usize != zone.len() {
            problems.push(format!(
                "zone {}: num_nodes={} but {} nodes",
                zone_id,
                zone.num_nodes,
                zone.len()
            ));
        }

        let mut owner: Vec<Option<u32>> = vec![None; num_shards as usize];
        for node in &zone.nodes {
            let held = node
                .primary_shards
                .iter()
                .map(|&s| (s, true))
                .chain(node.secondary_shards.iter().map(|&s| (s, false)));
            for (shard, primary) in held {
                if primary != is_primary(shard, zone_id, num_zones, alg) {
                    let role = if primary { "primary" } else { "secondary" };
                    problems.push(format!(
                        "zone {} node {}: shard {} must not be {}",
                        zone_id, node.node_id, shard, role
                    ));
                }
                match owner.get_mut(shard as usize) {
                    None => problems.push(format!(
                        "zone {} node {}: shard {} out of range (num_shards={})",
                        zone_id, node.node_id, shard, num_shards
                    )),
                    Some(Some(other)) => problems.push(format!(
                        "zone {}: shard {} on both node {} and node {}",
                        zone_id, shard, other, node.node_id
                    )),
                    Some(slot) => *slot = Some(node.node_id),
                }
            }
        }

        let missing = owner.iter().filter(|o| o.is_none()).count();
        if missing > 0 {
            problems.push(format!("zone {}: {} shards unassigned", zone_id, missing));
        }
    }

    for problem in &problems {
        tracing::error!("invalid topology: {}", problem);
    }
    match problems.len() {
        0 => Ok(()),
        1 => Err(Error::Validation(problems.remove(0))),
        n => Err(Error::Validation(format!(
            "{} (and {} more)",
            problems.remove(0),
            n - 1
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_zones_full_replication() {
        let zones = new_zones(3, 40, &[2, 4, 1]);
        validate_zones(&zones, 40, MappingAlg::V2).unwrap();
        assert_eq!(zones[1].len(), 4);
        for zone in &zones {
            assert_eq!(zone.total_shards(), 40);
        }
    }

    #[test]
    fn test_match_zones() {
        let a = new_zones(2, 16, &[2, 3]);
        let b = new_zones(2, 16, &[2, 3]);
        match_zones(&a, &b).unwrap();

        let c = new_zones(2, 16, &[2, 2]);
        assert!(matches!(match_zones(&a, &c), Err(Error::Validation(_))));

        let mut d = b.clone();
        d[0].nodes[1].primary_shards.reverse();
        assert!(match_zones(&a, &d).is_err());
    }

    #[test]
    fn test_validate_detects_duplicate() {
        let mut zones = new_zones(1, 8, &[2]);
        let shard = zones[0].nodes[0].primary_shards[0];
        zones[0].nodes[1].primary_shards.push(shard);
        let err = validate_zones(&zones, 8, MappingAlg::V2).unwrap_err();
        assert!(err.to_string().contains("on both node"));
    }

    #[test]
    fn test_validate_detects_out_of_range_and_missing() {
        let mut zones = new_zones(1, 8, &[2]);
        let shard = zones[0].nodes[1].primary_shards.pop().unwrap();
        zones[0].nodes[1].primary_shards.push(shard + 100);
        let err = validate_zones(&zones, 8, MappingAlg::V2).unwrap_err();
        assert!(err.to_string().contains("out of range"));
        assert!(err.to_string().contains("1 more"));
    }

    #[test]
    fn test_validate_detects_wrong_role() {
        // Under the partitioned mapping zone 0 is secondary for shard 0
        let zones = new_zones(3, 9, &[1, 1, 1]);
        let err = validate_zones(&zones, 9, MappingAlg::V1).unwrap_err();
        assert!(err.to_string().contains("must not be primary"));
    }

    #[test]
    fn test_validate_empty_zone() {
        let zones = vec![Zone::empty(0)];
        assert!(validate_zones(&zones, 4, MappingAlg::V1).is_err());
    }
}
