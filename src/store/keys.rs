//! Key schema of the coordination store
//!
//! Keys are a tag followed by zero-padded ids: `tag_ZZ` for a zone,
//! `tag_ZZ_NNN` for a node and `tag_ZZ_NNN_SSSSS` for a shard of a node.
//! Padding keeps the lexical order of keys equal to the numeric order of ids,
//! which range deletes rely on.

pub const COMP_DELIMITER: char = '_';

// === Committed topology ===
pub const TAG_VERSION: &str = "version";
pub const TAG_ALG_VERSION: &str = "algver";
pub const TAG_NUM_ZONES: &str = "numzones";
pub const TAG_NUM_SHARDS: &str = "numshards";
pub const TAG_NODE_IPPORT: &str = "node_ipport";
pub const TAG_NODE_SHARDS: &str = "node_shards";
pub const TAG_ZONE_MARKDOWN: &str = "zonemarkdown";
pub const TAG_ROOT: &str = "root";

// === Redistribution record ===
pub const TAG_REDIST_PREFIX: &str = "redist";
pub const TAG_REDIST_ENABLE: &str = "redist_enable";
pub const TAG_REDIST_FROM: &str = "redist_from";
pub const TAG_REDIST_NODE_PREFIX: &str = "redist_node";
pub const TAG_REDIST_NODE_IPPORT: &str = "redist_node_ipport";
pub const TAG_REDIST_NODE_SHARDS: &str = "redist_node_shards";
pub const TAG_REDIST_STATE: &str = "redist_state";
pub const TAG_REDIST_STATE_SUMMARY: &str = "redist_state_summary";
pub const TAG_REDIST_TGT_STATE: &str = "redist_tgtstate";

/// Separator between the entries of a `redist_from` change list
pub const SHARD_MOVE_SEPARATOR: char = '|';
/// Separator between a phase value and its fields
pub const FIELD_SEPARATOR: char = '|';
pub const KEY_VALUE_SEPARATOR: char = '=';
pub const TAG_RATE_LIMIT: &str = "ratelimit";

/// Build `tag_ZZ_NNN_SSSSS...` from up to any number of ids.
pub fn key(tag: &str, ids: &[u32]) -> String {
    let mut key = tag.to_string();
    for (i, id) in ids.iter().enumerate() {
        let part = match i {
            0 => format!("{}{:02}", COMP_DELIMITER, id),
            1 => format!("{}{:03}", COMP_DELIMITER, id),
            _ => format!("{}{:05}", COMP_DELIMITER, id),
        };
        key.push_str(&part);
    }
    key
}

/// Prefix matching every key of `tag` under one zone.
///
/// The trailing delimiter keeps zone 1 from matching zone 10.
pub fn zone_prefix(tag: &str, zone: u32) -> String {
    format!("{}{}", key(tag, &[zone]), COMP_DELIMITER)
}

pub fn node_ipport(zone: u32, node: u32) -> String {
    key(TAG_NODE_IPPORT, &[zone, node])
}

pub fn node_shards(zone: u32, node: u32) -> String {
    key(TAG_NODE_SHARDS, &[zone, node])
}

pub fn redist_enable(zone: u32) -> String {
    key(TAG_REDIST_ENABLE, &[zone])
}

pub fn redist_from(zone: u32, node: u32) -> String {
    key(TAG_REDIST_FROM, &[zone, node])
}

pub fn redist_node_ipport(zone: u32, node: u32) -> String {
    key(TAG_REDIST_NODE_IPPORT, &[zone, node])
}

pub fn redist_node_shards(zone: u32, node: u32) -> String {
    key(TAG_REDIST_NODE_SHARDS, &[zone, node])
}

pub fn redist_state(zone: u32, node: u32, shard: u32) -> String {
    key(TAG_REDIST_STATE, &[zone, node, shard])
}

pub fn redist_tgt_state(zone: u32, node: u32) -> String {
    key(TAG_REDIST_TGT_STATE, &[zone, node])
}

pub fn root_key(cluster_name: &str) -> String {
    format!("{}{}{}", TAG_ROOT, COMP_DELIMITER, cluster_name)
}

/// `(zone, node)` of a key built as `tag_ZZ_NNN`, or `None` for a key of
/// another shape.
pub fn parse_zone_node(key: &str, tag: &str) -> Option<(u32, u32)> {
    let rest = key.strip_prefix(tag)?.strip_prefix(COMP_DELIMITER)?;
    let mut parts = rest.split(COMP_DELIMITER);
    let zone = parts.next()?.parse().ok()?;
    let node = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((zone, node))
}

/// `value|ratelimit=N` for a positive rate limit, `value` otherwise.
pub fn with_rate_limit(value: &str, rate_limit: u32) -> String {
    if rate_limit == 0 {
        return value.to_string();
    }
    format!(
        "{}{}{}{}{}",
        value, FIELD_SEPARATOR, TAG_RATE_LIMIT, KEY_VALUE_SEPARATOR, rate_limit
    )
}

/// Rate limit carried by a phase value; 0 when absent or malformed.
pub fn parse_rate_limit(value: &str) -> u32 {
    let mut fields = value.split(FIELD_SEPARATOR);
    let _ = fields.next();
    let Some(field) = fields.next() else {
        return 0;
    };
    match field.split_once(KEY_VALUE_SEPARATOR) {
        Some((TAG_RATE_LIMIT, limit)) => limit.parse().unwrap_or(0),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_padding() {
        assert_eq!(key(TAG_VERSION, &[]), "version");
        assert_eq!(redist_enable(3), "redist_enable_03");
        assert_eq!(node_ipport(1, 7), "node_ipport_01_007");
        assert_eq!(redist_state(0, 12, 345), "redist_state_00_012_00345");
        assert_eq!(zone_prefix(TAG_REDIST_FROM, 2), "redist_from_02_");
    }

    #[test]
    fn test_key_order_matches_ids() {
        assert!(node_ipport(0, 9) < node_ipport(0, 10));
        assert!(node_ipport(0, 999) < node_ipport(1, 0));
    }

    #[test]
    fn test_parse_zone_node() {
        assert_eq!(parse_zone_node("node_shards_02_015", TAG_NODE_SHARDS), Some((2, 15)));
        assert_eq!(
            parse_zone_node("redist_node_ipport_00_003", TAG_REDIST_NODE_IPPORT),
            Some((0, 3))
        );
        assert_eq!(parse_zone_node("node_shards_02", TAG_NODE_SHARDS), None);
        assert_eq!(parse_zone_node("node_shards_x_1", TAG_NODE_SHARDS), None);
        assert_eq!(parse_zone_node("redist_state_00_001_00002", TAG_REDIST_STATE), None);
    }

    #[test]
    fn test_rate_limit() {
        assert_eq!(with_rate_limit("yes_source_rl", 500), "yes_source_rl|ratelimit=500");
        assert_eq!(with_rate_limit("yes_source", 0), "yes_source");
        assert_eq!(parse_rate_limit("yes_source_rl|ratelimit=500"), 500);
        assert_eq!(parse_rate_limit("yes_source"), 0);
        assert_eq!(parse_rate_limit("yes_source_rl|ratelimit=abc"), 0);
        assert_eq!(parse_rate_limit("yes_source_rl|speed=5"), 0);
    }
}
