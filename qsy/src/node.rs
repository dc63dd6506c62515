//! Registry of connected nodes.
//!
//! Only the terminal controller touches the registry. The socket halves of a
//! node live in the receiver and sender workers, keyed by physical id; the
//! registry keeps what the terminal needs to report and route.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use qsy_core::PhysicalId;

/// A connected node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Node {
    /// Id the node announced.
    pub physical_id: PhysicalId,
    /// Address of its control connection.
    pub address: SocketAddr,
}

/// Connected nodes ordered by physical id.
#[derive(Debug, Default)]
pub(crate) struct NodeRegistry {
    nodes: BTreeMap<PhysicalId, Node>,
}

impl NodeRegistry {
    /// Register a node, returning `false` if the id is already taken.
    pub(crate) fn insert(&mut self, node: Node) -> bool {
        if self.nodes.contains_key(&node.physical_id) {
            return false;
        }
        self.nodes.insert(node.physical_id, node);
        true
    }

    pub(crate) fn remove(&mut self, physical_id: PhysicalId) -> Option<Node> {
        self.nodes.remove(&physical_id)
    }

    pub(crate) fn contains(&self, physical_id: PhysicalId) -> bool {
        self.nodes.contains_key(&physical_id)
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Ids in ascending order.
    pub(crate) fn ids(&self) -> Vec<PhysicalId> {
        self.nodes.keys().copied().collect()
    }

    /// Remove every node.
    pub(crate) fn drain(&mut self) -> Vec<Node> {
        std::mem::take(&mut self.nodes).into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(physical_id: PhysicalId) -> Node {
        Node {
            physical_id,
            address: SocketAddr::from(([10, 0, 0, physical_id as u8], 3000)),
        }
    }

    #[test]
    fn test_ids_are_sorted() {
        let mut registry = NodeRegistry::default();
        for id in [9, 2, 5] {
            assert!(registry.insert(node(id)));
        }
        assert_eq!(registry.ids(), vec![2, 5, 9]);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_duplicate_insert_keeps_first() {
        let mut registry = NodeRegistry::default();
        assert!(registry.insert(node(4)));
        let mut other = node(4);
        other.address = SocketAddr::from(([10, 0, 0, 99], 3000));
        assert!(!registry.insert(other));
        assert_eq!(registry.remove(4), Some(node(4)));
        assert!(!registry.contains(4));
        assert_eq!(registry.remove(4), None);
    }

    #[test]
    fn test_drain_empties() {
        let mut registry = NodeRegistry::default();
        registry.insert(node(1));
        registry.insert(node(2));
        assert_eq!(registry.drain().len(), 2);
        assert_eq!(registry.len(), 0);
    }
}
