//! Common utilities and types shared across shardmesh

pub mod config;
pub mod error;
pub mod hash;
pub mod utils;

pub use config::{
    ClusterConfig, Config, MappingAlg, RedistConfig, RetryPolicy, RuntimeConfig, StatsConfig,
    StoreBackend, StoreConfig,
};
pub use error::{Error, Result};
pub use hash::{hash32, shard_info, shard_key};
pub use utils::{hostname, parse_duration, timestamp_now};
