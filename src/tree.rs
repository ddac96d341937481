//! Arena-backed tree representation with cached structural metrics.
//!
//! A [`Tree`] is built once by a producer (a language front end, a document
//! parser, ...) with children already in final document order, then
//! [`Tree::refresh`]ed, and from that point on treated as structurally
//! immutable by the matching engine. Nodes live in an `indextree` arena and
//! are addressed by [`NodeId`] handles; the parent link is a non-owning
//! index, never an ownership relation.

use core::fmt::Write;
use std::collections::VecDeque;

use indextree::{Arena, NodeEdge, NodeId};

/// Fixed-width content digest of a subtree.
///
/// Combined bottom-up from the node's own (kind, label) signature and the
/// digests of its children, in order. Equal digests are only a fast
/// pre-filter for structural equality: collisions are possible, so every
/// consumer confirms with [`Tree::isomorphic`] before treating two subtrees
/// as clones.
pub type Digest = u64;

/// The payload carried by every node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeData {
    /// Integer category classifying the node's syntactic/structural role.
    /// Two nodes are *compatible* iff their kinds are equal.
    pub kind: u32,
    /// Textual payload. The empty string is the "no label" sentinel.
    pub label: String,
    /// Byte offset of the node's span in the originating document.
    /// Opaque to the matcher, used only for tie-breaking.
    pub pos: usize,
    /// Byte length of the node's span. Carried through unchanged.
    pub len: usize,
}

impl NodeData {
    /// A labeled node with an empty document span.
    pub fn new(kind: u32, label: impl Into<String>) -> Self {
        Self {
            kind,
            label: label.into(),
            pos: 0,
            len: 0,
        }
    }

    /// A node with a label and a document span.
    pub fn spanned(kind: u32, label: impl Into<String>, pos: usize, len: usize) -> Self {
        Self {
            kind,
            label: label.into(),
            pos,
            len,
        }
    }

    /// An unlabeled node.
    pub fn unlabeled(kind: u32) -> Self {
        Self::new(kind, "")
    }
}

/// One arena slot: payload plus cached metrics.
///
/// Metrics are valid only after [`Tree::refresh`].
#[derive(Debug, Clone)]
struct Slot {
    data: NodeData,
    size: usize,
    height: usize,
    depth: usize,
    digest: Digest,
}

impl Slot {
    fn fresh(data: NodeData) -> Self {
        Self {
            data,
            size: 0,
            height: 0,
            depth: 0,
            digest: 0,
        }
    }
}

/// A tree of [`NodeData`] nodes stored in an `indextree` arena.
#[derive(Debug)]
pub struct Tree {
    arena: Arena<Slot>,
    /// The root node.
    pub root: NodeId,
}

impl Tree {
    /// Create a tree containing only a root node.
    pub fn new(data: NodeData) -> Self {
        let mut arena = Arena::new();
        let root = arena.new_node(Slot::fresh(data));
        Self { arena, root }
    }

    /// Append a child under `parent`, after any existing children.
    ///
    /// Metrics are stale after this; call [`Tree::refresh`] before matching.
    pub fn add_child(&mut self, parent: NodeId, data: NodeData) -> NodeId {
        let child = self.arena.new_node(Slot::fresh(data));
        parent.append(child, &mut self.arena);
        child
    }

    /// Total number of nodes in the tree.
    pub fn node_count(&self) -> usize {
        self.arena.count()
    }

    fn slot(&self, id: NodeId) -> &Slot {
        self.arena[id].get()
    }

    /// The node's kind tag.
    pub fn kind(&self, id: NodeId) -> u32 {
        self.slot(id).data.kind
    }

    /// The node's label ("" when unlabeled).
    pub fn label(&self, id: NodeId) -> &str {
        &self.slot(id).data.label
    }

    /// Whether the node carries a real label.
    pub fn has_label(&self, id: NodeId) -> bool {
        !self.slot(id).data.label.is_empty()
    }

    /// Byte offset of the node's document span.
    pub fn pos(&self, id: NodeId) -> usize {
        self.slot(id).data.pos
    }

    /// Byte length of the node's document span.
    pub fn len(&self, id: NodeId) -> usize {
        self.slot(id).data.len
    }

    /// Number of nodes in the subtree, including the node itself.
    /// Valid after [`Tree::refresh`].
    pub fn size(&self, id: NodeId) -> usize {
        self.slot(id).size
    }

    /// Longest downward path length; 0 for leaves. Valid after [`Tree::refresh`].
    pub fn height(&self, id: NodeId) -> usize {
        self.slot(id).height
    }

    /// Distance from the root; 0 at the root. Valid after [`Tree::refresh`].
    pub fn depth(&self, id: NodeId) -> usize {
        self.slot(id).depth
    }

    /// Content digest of the subtree. Valid after [`Tree::refresh`].
    pub fn digest(&self, id: NodeId) -> Digest {
        self.slot(id).digest
    }

    /// The node's parent, or `None` at the root.
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.arena[id].parent()
    }

    /// The node's children, in document order.
    pub fn children(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        id.children(&self.arena)
    }

    /// Number of immediate children.
    pub fn child_count(&self, id: NodeId) -> usize {
        id.children(&self.arena).count()
    }

    /// Whether the node has no children.
    pub fn is_leaf(&self, id: NodeId) -> bool {
        self.arena[id].first_child().is_none()
    }

    /// 0-based index of the node among its parent's children, or `None` at
    /// the root.
    pub fn position_in_parent(&self, id: NodeId) -> Option<usize> {
        let parent = self.parent(id)?;
        parent.children(&self.arena).position(|c| c == id)
    }

    /// 0-based index of `child` among `parent`'s children, or `None` if it
    /// is not an immediate child.
    pub fn child_position(&self, parent: NodeId, child: NodeId) -> Option<usize> {
        parent.children(&self.arena).position(|c| c == child)
    }

    /// Proper ancestors of the node, nearest first. Empty at the root.
    pub fn ancestors(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        id.ancestors(&self.arena).skip(1)
    }

    /// Pre-order (depth-first) traversal of the subtree, including `id`.
    pub fn pre_order(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        id.descendants(&self.arena)
    }

    /// Proper descendants of the node, in pre-order. Excludes `id` itself.
    pub fn descendants(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        id.descendants(&self.arena).skip(1)
    }

    /// Post-order traversal of the subtree: children before parents.
    pub fn post_order(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        id.traverse(&self.arena).filter_map(|edge| match edge {
            NodeEdge::End(n) => Some(n),
            NodeEdge::Start(_) => None,
        })
    }

    /// Breadth-first traversal of the subtree, including `id`.
    pub fn breadth_first(&self, id: NodeId) -> BreadthFirst<'_> {
        BreadthFirst {
            arena: &self.arena,
            queue: VecDeque::from([id]),
        }
    }

    /// Leaves of the subtree, in document order.
    pub fn leaves(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.pre_order(id).filter(|&n| self.is_leaf(n))
    }

    /// Structurally independent copy of the whole tree.
    ///
    /// The copy has its own arena; nothing is shared with the original, so
    /// the two may be matched against each other or used on different
    /// threads.
    pub fn deep_copy(&self) -> Self {
        Self {
            arena: self.arena.clone(),
            root: self.root,
        }
    }

    /// Whether the two nodes have equal kinds.
    pub fn is_compatible(&self, id: NodeId, other: &Tree, other_id: NodeId) -> bool {
        self.kind(id) == other.kind(other_id)
    }

    /// Whether the two nodes have equal kinds and equal labels.
    pub fn is_similar(&self, id: NodeId, other: &Tree, other_id: NodeId) -> bool {
        self.is_compatible(id, other, other_id) && self.label(id) == other.label(other_id)
    }

    /// Whether the two subtrees are exact structural clones.
    ///
    /// Requires equal digests *and* the exact recursive check: digest
    /// equality alone is never trusted, a collision must not produce a
    /// false positive.
    pub fn is_clone(&self, id: NodeId, other: &Tree, other_id: NodeId) -> bool {
        self.digest(id) == other.digest(other_id) && self.isomorphic(id, other, other_id)
    }

    /// Exact recursive structural equality: equal kind, equal label, and
    /// children pairwise isomorphic in order.
    pub fn isomorphic(&self, id: NodeId, other: &Tree, other_id: NodeId) -> bool {
        let a = &self.slot(id).data;
        let b = &other.slot(other_id).data;
        if a.kind != b.kind || a.label != b.label {
            return false;
        }
        let mut ours = id.children(&self.arena);
        let mut theirs = other_id.children(&other.arena);
        loop {
            match (ours.next(), theirs.next()) {
                (None, None) => return true,
                (Some(x), Some(y)) => {
                    if !self.isomorphic(x, other, y) {
                        return false;
                    }
                }
                _ => return false,
            }
        }
    }

    /// Recompute all four cached metrics.
    ///
    /// Must be called after any structural edit and before matching. The
    /// passes are idempotent, so calling this twice is wasteful but harmless.
    pub fn refresh(&mut self) {
        self.compute_sizes();
        self.compute_depths();
        self.compute_heights();
        self.compute_digests();
    }

    /// Recompute `size` for every node, bottom-up.
    pub fn compute_sizes(&mut self) {
        let post: Vec<NodeId> = self.post_order(self.root).collect();
        for &id in &post {
            let size = 1 + id
                .children(&self.arena)
                .map(|c| self.arena[c].get().size)
                .sum::<usize>();
            self.arena[id].get_mut().size = size;
        }
    }

    /// Recompute `depth` for every node, top-down.
    pub fn compute_depths(&mut self) {
        let pre: Vec<NodeId> = self.pre_order(self.root).collect();
        for &id in &pre {
            let depth = match self.arena[id].parent() {
                Some(p) => self.arena[p].get().depth + 1,
                None => 0,
            };
            self.arena[id].get_mut().depth = depth;
        }
    }

    /// Recompute `height` for every node, bottom-up.
    pub fn compute_heights(&mut self) {
        let post: Vec<NodeId> = self.post_order(self.root).collect();
        for &id in &post {
            let height = id
                .children(&self.arena)
                .map(|c| self.arena[c].get().height + 1)
                .max()
                .unwrap_or(0);
            self.arena[id].get_mut().height = height;
        }
    }

    /// Recompute `digest` for every node, bottom-up.
    ///
    /// The digest is order-sensitive over children: `A(B, C)` and `A(C, B)`
    /// hash differently. Reordered-but-identical subtrees therefore fall
    /// through to the bottom-up matching phase, which recovers them; the
    /// policy is pinned by tests.
    pub fn compute_digests(&mut self) {
        let post: Vec<NodeId> = self.post_order(self.root).collect();
        let mut buf = Vec::new();
        for &id in &post {
            buf.clear();
            {
                let data = &self.arena[id].get().data;
                buf.extend_from_slice(&data.kind.to_le_bytes());
                buf.extend_from_slice(&(data.label.len() as u64).to_le_bytes());
                buf.extend_from_slice(data.label.as_bytes());
            }
            for c in id.children(&self.arena) {
                buf.extend_from_slice(&self.arena[c].get().digest.to_le_bytes());
            }
            let digest = rapidhash::rapidhash(&buf);
            self.arena[id].get_mut().digest = digest;
        }
    }

    /// Indented one-node-per-line dump of a subtree. Debug aid.
    pub fn to_tree_string(&self, id: NodeId) -> String {
        let mut out = String::new();
        let mut stack = vec![(id, 0usize)];
        while let Some((n, indent)) = stack.pop() {
            for _ in 0..indent {
                out.push_str("  ");
            }
            let data = &self.slot(n).data;
            if data.label.is_empty() {
                let _ = writeln!(out, "{}", data.kind);
            } else {
                let _ = writeln!(out, "{}: {}", data.kind, data.label);
            }
            let children: Vec<NodeId> = self.children(n).collect();
            for &c in children.iter().rev() {
                stack.push((c, indent + 1));
            }
        }
        out
    }
}

/// Breadth-first traversal iterator. See [`Tree::breadth_first`].
pub struct BreadthFirst<'a> {
    arena: &'a Arena<Slot>,
    queue: VecDeque<NodeId>,
}

impl Iterator for BreadthFirst<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.queue.pop_front()?;
        self.queue.extend(id.children(self.arena));
        Some(id)
    }
}

/// A read-only grouping of top-level nodes under a synthetic root.
///
/// Algorithms that want a single traversal entry point over several
/// independent top-level nodes of one tree can use this view. It exposes no
/// mutating API at all: where the classic design had a "fake" node whose
/// mutators threw at run time, misuse here is simply unrepresentable.
pub struct VirtualRoot<'a> {
    tree: &'a Tree,
    tops: Vec<NodeId>,
}

impl<'a> VirtualRoot<'a> {
    /// Group `tops` (nodes of `tree`) under a synthetic root.
    pub fn new(tree: &'a Tree, tops: Vec<NodeId>) -> Self {
        Self { tree, tops }
    }

    /// The grouped top-level nodes, in order.
    pub fn children(&self) -> &[NodeId] {
        &self.tops
    }

    /// Pre-order traversal over all grouped subtrees, left to right.
    /// The synthetic root itself yields no node.
    pub fn pre_order(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.tops.iter().flat_map(|&t| self.tree.pre_order(t))
    }

    /// Node count of the grouping, counting the synthetic root.
    pub fn size(&self) -> usize {
        1 + self.tops.iter().map(|&t| self.tree.size(t)).sum::<usize>()
    }

    /// Height of the grouping: one above the tallest grouped subtree.
    pub fn height(&self) -> usize {
        self.tops
            .iter()
            .map(|&t| self.tree.height(t) + 1)
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// root(0) -> f(1,"f") -> [x(2,"x"), y(2,"y")], g(1,"g")
    fn sample() -> Tree {
        let mut tree = Tree::new(NodeData::unlabeled(0));
        let f = tree.add_child(tree.root, NodeData::new(1, "f"));
        tree.add_child(f, NodeData::new(2, "x"));
        tree.add_child(f, NodeData::new(2, "y"));
        tree.add_child(tree.root, NodeData::new(1, "g"));
        tree.refresh();
        tree
    }

    #[test]
    fn metrics_after_refresh() {
        let tree = sample();
        assert_eq!(tree.size(tree.root), 5);
        assert_eq!(tree.height(tree.root), 2);
        assert_eq!(tree.depth(tree.root), 0);

        let f = tree.children(tree.root).next().unwrap();
        assert_eq!(tree.size(f), 3);
        assert_eq!(tree.height(f), 1);
        assert_eq!(tree.depth(f), 1);

        let x = tree.children(f).next().unwrap();
        assert_eq!(tree.size(x), 1);
        assert_eq!(tree.height(x), 0);
        assert_eq!(tree.depth(x), 2);
        assert!(tree.is_leaf(x));
    }

    #[test]
    fn size_invariant_holds_everywhere() {
        let tree = sample();
        for n in tree.pre_order(tree.root) {
            let expected = 1 + tree.children(n).map(|c| tree.size(c)).sum::<usize>();
            assert_eq!(tree.size(n), expected);
        }
        assert_eq!(tree.size(tree.root), tree.node_count());
    }

    #[test]
    fn refresh_is_idempotent() {
        let mut tree = sample();
        let before: Vec<_> = tree
            .pre_order(tree.root)
            .map(|n| (tree.size(n), tree.height(n), tree.depth(n), tree.digest(n)))
            .collect();
        tree.refresh();
        let after: Vec<_> = tree
            .pre_order(tree.root)
            .map(|n| (tree.size(n), tree.height(n), tree.depth(n), tree.digest(n)))
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn identical_trees_have_equal_digests() {
        let a = sample();
        let b = sample();
        assert_eq!(a.digest(a.root), b.digest(b.root));
        assert!(a.is_clone(a.root, &b, b.root));
    }

    #[test]
    fn label_change_changes_digest() {
        let a = sample();
        let mut b = Tree::new(NodeData::unlabeled(0));
        let f = b.add_child(b.root, NodeData::new(1, "f"));
        b.add_child(f, NodeData::new(2, "x"));
        b.add_child(f, NodeData::new(2, "z")); // was "y"
        b.add_child(b.root, NodeData::new(1, "g"));
        b.refresh();
        assert_ne!(a.digest(a.root), b.digest(b.root));
        assert!(!a.is_clone(a.root, &b, b.root));
    }

    #[test]
    fn digest_is_order_sensitive() {
        let mut a = Tree::new(NodeData::unlabeled(0));
        a.add_child(a.root, NodeData::new(1, "b"));
        a.add_child(a.root, NodeData::new(1, "c"));
        a.refresh();

        let mut b = Tree::new(NodeData::unlabeled(0));
        b.add_child(b.root, NodeData::new(1, "c"));
        b.add_child(b.root, NodeData::new(1, "b"));
        b.refresh();

        assert_ne!(a.digest(a.root), b.digest(b.root));
        assert!(!a.isomorphic(a.root, &b, b.root));
    }

    #[test]
    fn isomorphic_rejects_arity_mismatch() {
        let mut a = Tree::new(NodeData::new(1, "f"));
        a.add_child(a.root, NodeData::new(2, "x"));
        a.refresh();

        let mut b = Tree::new(NodeData::new(1, "f"));
        b.add_child(b.root, NodeData::new(2, "x"));
        b.add_child(b.root, NodeData::new(2, "x"));
        b.refresh();

        assert!(!a.isomorphic(a.root, &b, b.root));
        assert!(!a.is_clone(a.root, &b, b.root));
    }

    #[test]
    fn position_and_span_do_not_affect_digest() {
        let mut a = Tree::new(NodeData::spanned(1, "f", 0, 10));
        a.refresh();
        let mut b = Tree::new(NodeData::spanned(1, "f", 500, 3));
        b.refresh();
        assert_eq!(a.digest(a.root), b.digest(b.root));
        assert!(a.is_clone(a.root, &b, b.root));
    }

    #[test]
    fn traversal_orders() {
        let tree = sample();
        let labels = |ids: Vec<NodeId>| -> Vec<String> {
            ids.iter()
                .map(|&n| {
                    if tree.has_label(n) {
                        tree.label(n).to_string()
                    } else {
                        "root".to_string()
                    }
                })
                .collect()
        };

        let pre = labels(tree.pre_order(tree.root).collect());
        assert_eq!(pre, ["root", "f", "x", "y", "g"]);

        let post = labels(tree.post_order(tree.root).collect());
        assert_eq!(post, ["x", "y", "f", "g", "root"]);

        let bfs = labels(tree.breadth_first(tree.root).collect());
        assert_eq!(bfs, ["root", "f", "g", "x", "y"]);
    }

    #[test]
    fn traversals_are_restartable() {
        let tree = sample();
        let first: Vec<NodeId> = tree.post_order(tree.root).collect();
        let second: Vec<NodeId> = tree.post_order(tree.root).collect();
        assert_eq!(first, second);

        let first: Vec<NodeId> = tree.breadth_first(tree.root).collect();
        let second: Vec<NodeId> = tree.breadth_first(tree.root).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn descendants_exclude_self() {
        let tree = sample();
        let f = tree.children(tree.root).next().unwrap();
        let desc: Vec<NodeId> = tree.descendants(f).collect();
        assert_eq!(desc.len(), 2);
        assert!(!desc.contains(&f));
    }

    #[test]
    fn position_in_parent() {
        let tree = sample();
        let mut children = tree.children(tree.root);
        let f = children.next().unwrap();
        let g = children.next().unwrap();
        assert_eq!(tree.position_in_parent(f), Some(0));
        assert_eq!(tree.position_in_parent(g), Some(1));
        assert_eq!(tree.position_in_parent(tree.root), None);

        assert_eq!(tree.child_position(tree.root, g), Some(1));
        let x = tree.children(f).next().unwrap();
        assert_eq!(tree.child_position(tree.root, x), None, "not an immediate child");
    }

    #[test]
    fn ancestors_nearest_first() {
        let tree = sample();
        let f = tree.children(tree.root).next().unwrap();
        let x = tree.children(f).next().unwrap();
        let anc: Vec<NodeId> = tree.ancestors(x).collect();
        assert_eq!(anc, vec![f, tree.root]);
        assert_eq!(tree.ancestors(tree.root).count(), 0);
    }

    #[test]
    fn leaves_in_document_order() {
        let tree = sample();
        let leaves: Vec<String> = tree
            .leaves(tree.root)
            .map(|n| tree.label(n).to_string())
            .collect();
        assert_eq!(leaves, ["x", "y", "g"]);
    }

    #[test]
    fn deep_copy_is_independent_clone() {
        let tree = sample();
        let mut copy = tree.deep_copy();
        assert!(tree.is_clone(tree.root, &copy, copy.root));

        copy.add_child(copy.root, NodeData::new(9, "extra"));
        copy.refresh();
        assert!(!tree.is_clone(tree.root, &copy, copy.root));
        assert_eq!(tree.node_count(), 5);
    }

    #[test]
    fn virtual_root_groups_tops_read_only() {
        let tree = sample();
        let tops: Vec<NodeId> = tree.children(tree.root).collect();
        let group = VirtualRoot::new(&tree, tops.clone());

        assert_eq!(group.children(), &tops[..]);
        assert_eq!(group.size(), 1 + 3 + 1);
        assert_eq!(group.height(), 2);

        let visited: Vec<NodeId> = group.pre_order().collect();
        assert_eq!(visited.len(), 4);
        assert!(!visited.contains(&tree.root));
    }

    #[test]
    fn compatibility_and_similarity() {
        let mut a = Tree::new(NodeData::spanned(1, "f", 4, 12));
        a.refresh();
        let mut b = Tree::new(NodeData::spanned(1, "g", 80, 3));
        b.refresh();
        let mut c = Tree::new(NodeData::new(2, "f"));
        c.refresh();

        assert_eq!(a.len(a.root), 12);
        assert!(a.is_compatible(a.root, &b, b.root));
        assert!(!a.is_similar(a.root, &b, b.root));
        assert!(!a.is_compatible(a.root, &c, c.root));

        let mut same = Tree::new(NodeData::spanned(1, "f", 900, 1));
        same.refresh();
        assert!(a.is_similar(a.root, &same, same.root));
    }

    #[test]
    fn tree_string_dump() {
        let tree = sample();
        let dump = tree.to_tree_string(tree.root);
        assert_eq!(dump, "0\n  1: f\n    2: x\n    2: y\n  1: g\n");
    }
}
