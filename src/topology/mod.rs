//! Topology model
//!
//! A cluster is a set of zones, each an ordered list of nodes, and every node
//! serves a subset of the cluster's shards as primary or secondary. The
//! [`ShardMap`] is the read-only index derived from it for routing.

pub mod cluster;
pub mod node;
pub mod shardmap;
pub mod zone;

pub use cluster::Cluster;
pub use node::Node;
pub use shardmap::{ShardMap, ShardMapEntry};
pub use zone::Zone;

use crate::common::MappingAlg;

/// Whether `zone` holds `shard` as a primary.
///
/// Under the partitioned mapping the `(num_zones - 1) / 2` zones starting at
/// `shard % num_zones` hold it as secondary, the rest as primary. Storage
/// nodes and routers on both sides of a redistribution evaluate this rule, so
/// its edge cases must not change.
pub fn is_primary(shard: u32, zone: u32, num_zones: u32, alg: MappingAlg) -> bool {
    if alg == MappingAlg::V2 {
        return true;
    }
    if num_zones == 0 {
        return true;
    }

    let m = shard % num_zones;
    let width = (num_zones - 1) / 2;
    if m >= zone && m < zone + width {
        return false;
    }
    if m + num_zones < zone + width {
        return false;
    }
    true
}
