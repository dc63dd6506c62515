//! Mapping between logical ids of a routine and physical node ids.

use qsy_core::PhysicalId;

/// Bijection logical id ↔ physical id for one execution.
///
/// Logical id `i` is the `i`-th entry of the physical list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAssociation {
    physical: Vec<PhysicalId>,
}

impl NodeAssociation {
    /// Association from an explicit list, index = logical id.
    ///
    /// Duplicate physical ids are dropped, keeping the first occurrence.
    pub fn new(physical_ids: impl IntoIterator<Item = PhysicalId>) -> Self {
        let mut physical: Vec<PhysicalId> = Vec::new();
        for id in physical_ids {
            if !physical.contains(&id) {
                physical.push(id);
            }
        }
        Self { physical }
    }

    /// Bind `count` logical nodes to the lowest connected physical ids, in
    /// ascending order. `None` when fewer than `count` nodes are connected.
    pub fn lowest(connected: impl IntoIterator<Item = PhysicalId>, count: usize) -> Option<Self> {
        let mut ids: Vec<PhysicalId> = connected.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() < count {
            return None;
        }
        ids.truncate(count);
        Some(Self { physical: ids })
    }

    /// Physical id of a logical node.
    pub fn physical(&self, logical_id: usize) -> Option<PhysicalId> {
        self.physical.get(logical_id).copied()
    }

    /// Logical id of a physical node.
    pub fn logical(&self, physical_id: PhysicalId) -> Option<usize> {
        self.physical.iter().position(|&id| id == physical_id)
    }

    /// Whether the physical node takes part.
    pub fn contains(&self, physical_id: PhysicalId) -> bool {
        self.physical.contains(&physical_id)
    }

    /// Number of logical nodes.
    pub fn len(&self) -> usize {
        self.physical.len()
    }

    /// Whether no node takes part.
    pub fn is_empty(&self) -> bool {
        self.physical.is_empty()
    }

    /// Physical ids in logical order.
    pub fn physical_ids(&self) -> &[PhysicalId] {
        &self.physical
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lowest_ids_ascending() {
        let association = NodeAssociation::lowest([30, 7, 19, 2], 3).expect("enough nodes");
        assert_eq!(association.physical_ids(), &[2, 7, 19]);
        assert_eq!(association.physical(1), Some(7));
        assert_eq!(association.logical(19), Some(2));
        assert_eq!(association.logical(30), None);
        assert!(!association.contains(30));
    }

    #[test]
    fn test_not_enough_nodes() {
        assert!(NodeAssociation::lowest([1, 2], 3).is_none());
        assert!(NodeAssociation::lowest([1, 1, 1], 2).is_none());
    }

    #[test]
    fn test_explicit_order_kept() {
        let association = NodeAssociation::new([9, 3, 9, 5]);
        assert_eq!(association.physical_ids(), &[9, 3, 5]);
        assert_eq!(association.len(), 3);
    }
}
