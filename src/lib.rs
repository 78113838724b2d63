//! # shardmesh
//!
//! Topology and data placement for a sharded, multi-zone key-value cluster:
//! - Topology model: zones of nodes, each serving primary and secondary shards
//! - Deterministic placement and incremental rebalancing when nodes are added
//!   or removed
//! - A multi-phase redistribution coordinator that moves a live cluster to a
//!   new topology through a coordination store
//! - A runtime shard manager that routes requests to node connections,
//!   excludes unhealthy nodes and hot-swaps to new topology versions
//!
//! ## Architecture
//!
//! ```text
//!  operator ── shardmesh-clustermgr
//!                   │ prepare / start / commit
//!           ┌───────▼──────────────┐
//!           │  Coordination store  │  version, node_shards_*, redist_*
//!           └───────┬──────────────┘
//!                   │ watch
//!   ┌───────────────▼───────────────┐
//!   │ TopologyStore (router side)   │
//!   │  [gen A | gen B] active index │
//!   │  ShardManager ─ processors    │
//!   └──┬────────────┬────────────┬──┘
//!      │            │            │
//!  ┌───▼────┐   ┌───▼────┐   ┌───▼────┐
//!  │ Zone 0 │   │ Zone 1 │   │ Zone 2 │
//!  │ nodes  │   │ nodes  │   │ nodes  │
//!  └────────┘   └────────┘   └────────┘
//! ```
//!
//! ## Usage
//!
//! ### Bring up a cluster
//! ```bash
//! shardmesh-clustermgr --config cluster.toml store
//! ```
//!
//! ### Add nodes
//! ```bash
//! # Prepare, move every zone and commit in one go
//! shardmesh-clustermgr --config cluster.toml --new-config bigger.toml redist auto
//!
//! # Or step by step, one zone at a time
//! shardmesh-clustermgr --config cluster.toml --new-config bigger.toml redist prepare --zone 0
//! shardmesh-clustermgr --config cluster.toml redist start-tgt --zone 0
//! shardmesh-clustermgr --config cluster.toml redist start-src --zone 0 --ratelimit 5000
//! shardmesh-clustermgr --config cluster.toml --new-config bigger.toml redist commit --zone 0
//! ```

#![allow(clippy::result_large_err)]

pub mod common;
pub mod coordinator;
pub mod placement;
pub mod runtime;
pub mod store;
pub mod topology;

// Re-export commonly used types
pub use common::{ClusterConfig, Config, Error, MappingAlg, Result};
pub use coordinator::Redistributor;
pub use runtime::{ShardManager, TopologyStore};
pub use store::{ClusterCache, KvBackend};
pub use topology::{Cluster, Node, ShardMap, Zone};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
