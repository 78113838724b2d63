//! Zone: an ordered list of nodes in one failure domain

use crate::topology::Node;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    pub zone_id: u32,
    pub num_nodes: u32,
    #[serde(default)]
    pub nodes: Vec<Node>,
}

impl Zone {
    /// A zone without nodes, standing for "not part of this topology".
    pub fn empty(zone_id: u32) -> Self {
        Self {
            zone_id,
            num_nodes: 0,
            nodes: Vec::new(),
        }
    }

    pub fn with_nodes(zone_id: u32, nodes: Vec<Node>) -> Self {
        Self {
            zone_id,
            num_nodes: nodes.len() as u32,
            nodes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Number of shards held across all nodes of this zone.
    pub fn total_shards(&self) -> usize {
        self.nodes.iter().map(Node::total_len).sum()
    }

    pub fn node(&self, node_id: u32) -> Option<&Node> {
        self.nodes.get(node_id as usize)
    }

    pub(crate) fn sync_num_nodes(&mut self) {
        self.num_nodes = self.nodes.len() as u32;
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "zone {} ({} nodes)", self.zone_id, self.nodes.len())?;
        for node in &self.nodes {
            writeln!(f, "  {}", node)?;
        }
        Ok(())
    }
}
