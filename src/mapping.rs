//! Bijective mapping store between nodes of two trees.

use indextree::NodeId;

/// A bijective association between source-tree and destination-tree nodes.
///
/// Dense tables indexed by `NodeId` give O(1) lookups in both directions;
/// the pair list preserves insertion order for iteration. A store is created
/// empty before a matching run, populated monotonically during it (pairs are
/// added, never removed), and treated as read-only by consumers afterwards.
#[derive(Debug)]
pub struct Mapping {
    /// Source node to destination node, indexed by the source `NodeId`.
    src_to_dst: Vec<Option<NodeId>>,
    /// Destination node to source node, indexed by the destination `NodeId`.
    dst_to_src: Vec<Option<NodeId>>,
    /// All linked pairs, in insertion order.
    pairs: Vec<(NodeId, NodeId)>,
}

impl Default for Mapping {
    fn default() -> Self {
        Self::new()
    }
}

impl Mapping {
    /// Create a new empty mapping.
    pub fn new() -> Self {
        Self {
            src_to_dst: Vec::new(),
            dst_to_src: Vec::new(),
            pairs: Vec::new(),
        }
    }

    /// Create an empty mapping with preallocated lookup tables.
    pub fn with_capacity(src_nodes: usize, dst_nodes: usize) -> Self {
        Self {
            src_to_dst: vec![None; src_nodes],
            dst_to_src: vec![None; dst_nodes],
            pairs: Vec::new(),
        }
    }

    /// Record that `src` corresponds to `dst`.
    ///
    /// Both nodes must be unmapped: callers check matchability first, and
    /// linking an already-mapped node is a contract violation, not a
    /// recoverable condition.
    #[inline]
    pub fn link(&mut self, src: NodeId, dst: NodeId) {
        debug_assert!(!self.is_src_mapped(src), "source node linked twice");
        debug_assert!(!self.is_dst_mapped(dst), "destination node linked twice");

        let src_idx = usize::from(src);
        let dst_idx = usize::from(dst);

        if src_idx >= self.src_to_dst.len() {
            self.src_to_dst.resize(src_idx + 1, None);
        }
        if dst_idx >= self.dst_to_src.len() {
            self.dst_to_src.resize(dst_idx + 1, None);
        }

        self.src_to_dst[src_idx] = Some(dst);
        self.dst_to_src[dst_idx] = Some(src);
        self.pairs.push((src, dst));
    }

    /// Whether a source-tree node is part of some pair.
    #[inline(always)]
    pub fn is_src_mapped(&self, src: NodeId) -> bool {
        let idx = usize::from(src);
        self.src_to_dst.get(idx).is_some_and(|opt| opt.is_some())
    }

    /// Whether a destination-tree node is part of some pair.
    #[inline(always)]
    pub fn is_dst_mapped(&self, dst: NodeId) -> bool {
        let idx = usize::from(dst);
        self.dst_to_src.get(idx).is_some_and(|opt| opt.is_some())
    }

    /// Partner of a source-tree node, or `None` if unmapped.
    #[inline(always)]
    pub fn dst_for(&self, src: NodeId) -> Option<NodeId> {
        let idx = usize::from(src);
        self.src_to_dst.get(idx).copied().flatten()
    }

    /// Partner of a destination-tree node, or `None` if unmapped.
    #[inline(always)]
    pub fn src_for(&self, dst: NodeId) -> Option<NodeId> {
        let idx = usize::from(dst);
        self.dst_to_src.get(idx).copied().flatten()
    }

    /// All linked pairs, in insertion order.
    pub fn pairs(&self) -> impl Iterator<Item = (NodeId, NodeId)> + '_ {
        self.pairs.iter().copied()
    }

    /// Number of linked pairs.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Whether no pairs have been linked.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{NodeData, Tree};

    fn two_nodes() -> (Tree, NodeId, NodeId) {
        let mut tree = Tree::new(NodeData::unlabeled(0));
        let a = tree.add_child(tree.root, NodeData::new(1, "a"));
        let b = tree.add_child(tree.root, NodeData::new(1, "b"));
        (tree, a, b)
    }

    #[test]
    fn link_and_lookup_both_directions() {
        let (_src, a1, a2) = two_nodes();
        let (_dst, b1, b2) = two_nodes();

        let mut mapping = Mapping::new();
        assert!(mapping.is_empty());

        mapping.link(a1, b2);
        mapping.link(a2, b1);

        assert_eq!(mapping.len(), 2);
        assert!(mapping.is_src_mapped(a1));
        assert!(mapping.is_dst_mapped(b2));
        assert_eq!(mapping.dst_for(a1), Some(b2));
        assert_eq!(mapping.src_for(b2), Some(a1));
        assert_eq!(mapping.dst_for(a2), Some(b1));
        assert_eq!(mapping.src_for(b1), Some(a2));
    }

    #[test]
    fn unmapped_nodes_report_absent() {
        let (src, a1, _) = two_nodes();
        let mapping = Mapping::with_capacity(src.node_count(), src.node_count());
        assert!(!mapping.is_src_mapped(a1));
        assert!(!mapping.is_dst_mapped(a1));
        assert_eq!(mapping.dst_for(a1), None);
        assert_eq!(mapping.src_for(a1), None);
    }

    #[test]
    fn pairs_iterate_in_insertion_order() {
        let (_src, a1, a2) = two_nodes();
        let (_dst, b1, b2) = two_nodes();

        let mut mapping = Mapping::new();
        mapping.link(a2, b1);
        mapping.link(a1, b2);

        let pairs: Vec<_> = mapping.pairs().collect();
        assert_eq!(pairs, vec![(a2, b1), (a1, b2)]);
    }

    #[test]
    #[should_panic(expected = "linked twice")]
    #[cfg(debug_assertions)]
    fn double_link_is_a_contract_violation() {
        let (_src, a1, _) = two_nodes();
        let (_dst, b1, b2) = two_nodes();

        let mut mapping = Mapping::new();
        mapping.link(a1, b1);
        mapping.link(a1, b2);
    }
}
