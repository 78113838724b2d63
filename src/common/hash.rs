//! Key hashing for shard routing
//!
//! A key is mapped to a shard by a 32-bit hash of its bytes (the first four
//! bytes of its BLAKE3 digest, little endian). The same hash picks the zone a
//! lookup starts from, so every router computes the same `(shard, zone)` pair.

use crate::common::MappingAlg;

/// 32-bit routing hash of a key
pub fn hash32(key: &[u8]) -> u32 {
    let hash = blake3::hash(key);
    let bytes = hash.as_bytes();
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Compute shard ID for a key
pub fn shard_key(key: &[u8], num_shards: u32) -> u32 {
    if num_shards == 0 {
        return 0;
    }
    hash32(key) % num_shards
}

/// Compute `(shard_id, start_zone)` for a key.
///
/// Under the partitioned mapping the start zone follows from the shard id;
/// under full replication it comes from the upper half of the hash so that
/// load spreads over zones independently of the shard.
pub fn shard_info(key: &[u8], num_shards: u32, num_zones: u32, alg: MappingAlg) -> (u32, u32) {
    if num_shards == 0 || num_zones == 0 {
        return (0, 0);
    }
    let hash = hash32(key);
    let shard_id = hash % num_shards;
    let start_zone = match alg {
        MappingAlg::V1 => (shard_id + 1) % num_zones,
        MappingAlg::V2 => (hash >> 16) % num_zones,
    };
    (shard_id, start_zone)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_key_deterministic() {
        let key = b"test-key";
        assert_eq!(shard_key(key, 256), shard_key(key, 256));
        assert!(shard_key(key, 256) < 256);
    }

    #[test]
    fn test_shard_info_v1_start_zone() {
        for i in 0..100u32 {
            let key = format!("key-{}", i);
            let (shard, zone) = shard_info(key.as_bytes(), 64, 3, MappingAlg::V1);
            assert!(shard < 64);
            assert_eq!(zone, (shard + 1) % 3);
        }
    }

    #[test]
    fn test_shard_info_v2_uses_upper_bits() {
        let key = b"some-key";
        let hash = hash32(key);
        let (shard, zone) = shard_info(key, 1024, 5, MappingAlg::V2);
        assert_eq!(shard, hash % 1024);
        assert_eq!(zone, (hash >> 16) % 5);
    }

    #[test]
    fn test_zero_counts() {
        assert_eq!(shard_key(b"k", 0), 0);
        assert_eq!(shard_info(b"k", 0, 3, MappingAlg::V1), (0, 0));
    }
}
