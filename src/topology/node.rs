//! Node: the primary and secondary shards one storage node serves

use crate::common::{Error, MappingAlg, Result};
use crate::topology::is_primary;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Separator between the primary and secondary halves of a stored node value
pub const PRI_SEC_DELIMITER: char = '|';

/// Separator between shard ids in a stored node value
pub const SHARD_DELIMITER: char = ',';

/// One storage node of a zone
///
/// Shard lists are ordered. Rebalancing moves shards by position, so two nodes
/// holding the same set in a different order are not interchangeable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub zone_id: u32,
    pub node_id: u32,
    #[serde(default)]
    pub primary_shards: Vec<u32>,
    #[serde(default)]
    pub secondary_shards: Vec<u32>,
}

impl Node {
    pub fn new(zone_id: u32, node_id: u32) -> Self {
        Self {
            zone_id,
            node_id,
            primary_shards: Vec::new(),
            secondary_shards: Vec::new(),
        }
    }

    /// Place every shard on this node, split by the primary rule of its zone.
    pub fn init_shards(&mut self, num_zones: u32, num_shards: u32, alg: MappingAlg) {
        self.primary_shards.clear();
        self.secondary_shards.clear();
        for shard in 0..num_shards {
            if is_primary(shard, self.zone_id, num_zones, alg) {
                self.primary_shards.push(shard);
            } else {
                self.secondary_shards.push(shard);
            }
        }
    }

    pub fn primary_len(&self) -> usize {
        self.primary_shards.len()
    }

    pub fn secondary_len(&self) -> usize {
        self.secondary_shards.len()
    }

    pub fn total_len(&self) -> usize {
        self.primary_shards.len() + self.secondary_shards.len()
    }

    /// All shards held by this node, primaries first.
    pub fn shards(&self) -> impl Iterator<Item = u32> + '_ {
        self.primary_shards
            .iter()
            .chain(self.secondary_shards.iter())
            .copied()
    }

    pub fn holds(&self, shard: u32) -> bool {
        self.shards().any(|s| s == shard)
    }

    /// Encode as `"p1,p2|s1,s2"` for the coordination store.
    pub fn to_value(&self) -> String {
        let join = |shards: &[u32]| {
            shards
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
                .join(&SHARD_DELIMITER.to_string())
        };
        format!(
            "{}{}{}",
            join(&self.primary_shards),
            PRI_SEC_DELIMITER,
            join(&self.secondary_shards)
        )
    }

    /// Decode a value written by [`Node::to_value`].
    pub fn from_value(zone_id: u32, node_id: u32, value: &str) -> Result<Self> {
        let (primary, secondary) = value.split_once(PRI_SEC_DELIMITER).ok_or_else(|| {
            Error::Corrupted(format!(
                "node {}/{}: missing '{}' in '{}'",
                zone_id, node_id, PRI_SEC_DELIMITER, value
            ))
        })?;

        let parse = |part: &str| -> Result<Vec<u32>> {
            part.split(SHARD_DELIMITER)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse::<u32>().map_err(|_| {
                        Error::Corrupted(format!(
                            "node {}/{}: bad shard id '{}'",
                            zone_id, node_id, s
                        ))
                    })
                })
                .collect()
        };

        Ok(Self {
            zone_id,
            node_id,
            primary_shards: parse(primary)?,
            secondary_shards: parse(secondary)?,
        })
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "node {:>3} primary({})={:?}",
            self.node_id,
            self.primary_len(),
            self.primary_shards
        )?;
        if !self.secondary_shards.is_empty() {
            write!(
                f,
                " secondary({})={:?}",
                self.secondary_len(),
                self.secondary_shards
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_encoding() {
        let node = Node {
            zone_id: 1,
            node_id: 2,
            primary_shards: vec![3, 0, 7],
            secondary_shards: vec![5],
        };
        assert_eq!(node.to_value(), "3,0,7|5");
        assert_eq!(Node::from_value(1, 2, "3,0,7|5").unwrap(), node);
    }

    #[test]
    fn test_empty_sides() {
        let node = Node::from_value(0, 0, "1,2|").unwrap();
        assert_eq!(node.primary_shards, vec![1, 2]);
        assert!(node.secondary_shards.is_empty());

        let node = Node::from_value(0, 4, "|").unwrap();
        assert_eq!(node.total_len(), 0);
        assert_eq!(node.to_value(), "|");
    }

    #[test]
    fn test_malformed_value() {
        assert!(matches!(
            Node::from_value(0, 0, "1,2,3"),
            Err(Error::Corrupted(_))
        ));
        assert!(matches!(
            Node::from_value(0, 0, "1,x|"),
            Err(Error::Corrupted(_))
        ));
    }

    #[test]
    fn test_init_shards_three_zones() {
        let mut node = Node::new(0, 0);
        node.init_shards(3, 6, MappingAlg::V1);
        assert_eq!(node.total_len(), 6);
        // Zone 0 is secondary for shards congruent to 0 mod 3
        assert_eq!(node.secondary_shards, vec![0, 3]);
        assert_eq!(node.primary_shards, vec![1, 2, 4, 5]);
        assert!(node.holds(3));
    }
}
