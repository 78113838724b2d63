//! Topology runtime
//!
//! What a router holds at run time: the shard manager built from the
//! committed topology, the store that swaps it when a new version is
//! published, and the health state that shapes routing:
//! - soft markdown of single nodes, from request timeouts ([`ClusterStats`])
//! - hard markdown of a whole zone, from operators ([`ZoneMarkdown`])

pub mod markdown;
pub mod processor;
pub mod shard_manager;
pub mod stats;
pub mod topology_store;

pub use markdown::ZoneMarkdown;
pub use processor::{
    ConnectionFactory, NodeConnection, OutboundProcessor, TcpConnection, TcpConnectionFactory,
};
pub use shard_manager::{ConnectivityStats, Route, ShardManager};
pub use stats::{ClusterStats, ProcStat};
pub use topology_store::TopologyStore;
