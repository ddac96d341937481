//! Two-phase structural matching.
//!
//! 1. Top-down: greedily commit whole isomorphic subtrees, tallest first,
//!    found by height-bucketed digest search.
//! 2. Bottom-up: match remaining internal nodes by descendant-overlap
//!    similarity (Dice coefficient), with a bounded exact alignment to
//!    recover correspondences among their children afterwards.

use crate::mapping::Mapping;
use crate::tree::{Digest, Tree};
use crate::{debug, trace};
use core::cell::RefCell;
use indextree::NodeId;
use rapidhash::{RapidHashMap as HashMap, RapidHashSet as HashSet};
use std::collections::BTreeMap;

#[cfg(feature = "matching-stats")]
thread_local! {
    static DICE_CALLS: RefCell<usize> = const { RefCell::new(0) };
    static DICE_UNIQUE_SRC: RefCell<HashSet<NodeId>> = RefCell::new(HashSet::default());
    static DICE_UNIQUE_DST: RefCell<HashSet<NodeId>> = RefCell::new(HashSet::default());
}

/// Reset matching statistics (call before `match_trees`)
#[cfg(feature = "matching-stats")]
pub fn reset_stats() {
    DICE_CALLS.with(|c| *c.borrow_mut() = 0);
    DICE_UNIQUE_SRC.with(|s| s.borrow_mut().clear());
    DICE_UNIQUE_DST.with(|s| s.borrow_mut().clear());
}

/// Get matching statistics: (total_dice_calls, unique_src_nodes, unique_dst_nodes)
#[cfg(feature = "matching-stats")]
pub fn get_stats() -> (usize, usize, usize) {
    let calls = DICE_CALLS.with(|c| *c.borrow());
    let unique_src = DICE_UNIQUE_SRC.with(|s| s.borrow().len());
    let unique_dst = DICE_UNIQUE_DST.with(|s| s.borrow().len());
    (calls, unique_src, unique_dst)
}

/// Configuration for the matching engine.
#[derive(Debug, Clone)]
pub struct MatchingConfig {
    /// Below this height, subtrees are no longer eligible for top-down
    /// mass-matching. The default of 0 keeps exact leaf matches eligible;
    /// raising it trades leaf recall for fewer spurious leaf matches.
    pub min_height: usize,

    /// Below this Dice score, a bottom-up candidate pair is rejected.
    pub min_dice: f64,

    /// At or above this product of unmatched-descendant counts, the exact
    /// recovery alignment is skipped for performance.
    pub max_recovery_size: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            min_height: 0,
            min_dice: 0.5,
            max_recovery_size: 100,
        }
    }
}

/// Whether a pair may still be linked: kind-compatible and neither side
/// already mapped.
pub fn is_matchable(src: &Tree, a: NodeId, dst: &Tree, b: NodeId, mapping: &Mapping) -> bool {
    src.is_compatible(a, dst, b) && !mapping.is_src_mapped(a) && !mapping.is_dst_mapped(b)
}

/// Compute the matching between two refreshed trees.
///
/// Both trees must have been [`Tree::refresh`]ed since their last structural
/// edit; matching trees with stale metrics is a programming error, detected
/// defensively in debug builds. The engine never fails at run time: nodes
/// that attract no qualifying candidate simply remain unmatched.
///
/// Every pair committed by the top-down phase is an exact structural match;
/// bottom-up pairs are best-effort approximate matches at or above
/// [`MatchingConfig::min_dice`]. The result is a bijection, and every pair
/// is kind-compatible.
pub fn match_trees(src: &Tree, dst: &Tree, config: &MatchingConfig) -> Mapping {
    debug_assert_eq!(
        src.size(src.root),
        src.node_count(),
        "source tree metrics are stale, call refresh() before matching"
    );
    debug_assert_eq!(
        dst.size(dst.root),
        dst.node_count(),
        "destination tree metrics are stale, call refresh() before matching"
    );

    debug!(
        nodes_src = src.node_count(),
        nodes_dst = dst.node_count(),
        "match_trees start"
    );
    let mut mapping = Mapping::with_capacity(src.node_count(), dst.node_count());

    top_down_phase(src, dst, &mut mapping, config);
    debug!(matched = mapping.len(), "after top_down_phase");

    bottom_up_phase(src, dst, &mut mapping, config);
    debug!(matched = mapping.len(), "after bottom_up_phase");

    mapping
}

/// Frontier of unprocessed nodes, bucketed by subtree height so the tallest
/// candidates are always processed first.
#[derive(Default)]
struct HeightQueue {
    buckets: BTreeMap<usize, Vec<NodeId>>,
}

impl HeightQueue {
    fn push(&mut self, tree: &Tree, id: NodeId) {
        self.buckets.entry(tree.height(id)).or_default().push(id);
    }

    fn peek_max(&self) -> Option<usize> {
        self.buckets.keys().next_back().copied()
    }

    /// Remove and return all nodes at the current maximum height.
    fn pop_max(&mut self) -> Vec<NodeId> {
        match self.buckets.pop_last() {
            Some((_, nodes)) => nodes,
            None => Vec::new(),
        }
    }

    /// Replace a node with its children in the frontier (descend).
    fn open(&mut self, tree: &Tree, id: NodeId) {
        for c in tree.children(id) {
            self.push(tree, c);
        }
    }
}

/// Phase 1: top-down matching.
///
/// Maintains one height-bucketed frontier per tree. Each round processes the
/// currently tallest nodes: unequal frontier heights descend the taller side;
/// equal heights partition both candidate lists by digest. A digest shared by
/// exactly one candidate per side is confirmed with the exact clone check and
/// mass-matched; an ambiguous group links only its best-scoring pair this
/// round. Whatever stays unmatched descends into its children, until the
/// frontiers are exhausted or fall below `min_height`.
fn top_down_phase(src: &Tree, dst: &Tree, mapping: &mut Mapping, config: &MatchingConfig) {
    trace!("top_down_phase start");

    let mut q_src = HeightQueue::default();
    let mut q_dst = HeightQueue::default();
    q_src.push(src, src.root);
    q_dst.push(dst, dst.root);

    loop {
        let (Some(h_src), Some(h_dst)) = (q_src.peek_max(), q_dst.peek_max()) else {
            break;
        };
        if h_src < config.min_height || h_dst < config.min_height {
            break;
        }

        // Descend the taller frontier until both expose the same height.
        if h_src > h_dst {
            for id in q_src.pop_max() {
                if !mapping.is_src_mapped(id) {
                    q_src.open(src, id);
                }
            }
            continue;
        }
        if h_dst > h_src {
            for id in q_dst.pop_max() {
                if !mapping.is_dst_mapped(id) {
                    q_dst.open(dst, id);
                }
            }
            continue;
        }

        // Equal heights: this round's candidates. Nodes matched by an
        // earlier mass-match are dropped here.
        let round_src: Vec<NodeId> = q_src
            .pop_max()
            .into_iter()
            .filter(|&id| !mapping.is_src_mapped(id))
            .collect();
        let round_dst: Vec<NodeId> = q_dst
            .pop_max()
            .into_iter()
            .filter(|&id| !mapping.is_dst_mapped(id))
            .collect();

        trace!(
            height = h_src,
            src_candidates = round_src.len(),
            dst_candidates = round_dst.len(),
            "top_down round"
        );

        let mut by_digest_src: HashMap<Digest, Vec<NodeId>> = HashMap::default();
        for &id in &round_src {
            by_digest_src.entry(src.digest(id)).or_default().push(id);
        }
        let mut by_digest_dst: HashMap<Digest, Vec<NodeId>> = HashMap::default();
        for &id in &round_dst {
            by_digest_dst.entry(dst.digest(id)).or_default().push(id);
        }

        // Visit digest groups in round order so runs are reproducible.
        let mut seen: HashSet<Digest> = HashSet::default();
        for &first in &round_src {
            let digest = src.digest(first);
            if !seen.insert(digest) {
                continue;
            }
            let group_src = &by_digest_src[&digest];
            let Some(group_dst) = by_digest_dst.get(&digest) else {
                continue;
            };

            if group_src.len() == 1 && group_dst.len() == 1 {
                let (a, b) = (group_src[0], group_dst[0]);
                // Digest equality is not proof: confirm before mass-matching.
                if src.is_clone(a, dst, b) {
                    trace!(
                        a = usize::from(a),
                        b = usize::from(b),
                        height = h_src,
                        "top_down: unique digest match"
                    );
                    link_isomorphic_subtrees(src, dst, a, b, mapping);
                }
            } else if let Some((a, b)) = best_ambiguous_pair(src, dst, group_src, group_dst, mapping)
            {
                trace!(
                    a = usize::from(a),
                    b = usize::from(b),
                    group_src = group_src.len(),
                    group_dst = group_dst.len(),
                    "top_down: ambiguous group resolved"
                );
                link_isomorphic_subtrees(src, dst, a, b, mapping);
            }
        }

        // Whatever this round left unmatched descends normally.
        for &id in &round_src {
            if !mapping.is_src_mapped(id) {
                q_src.open(src, id);
            }
        }
        for &id in &round_dst {
            if !mapping.is_dst_mapped(id) {
                q_dst.open(dst, id);
            }
        }
    }
}

/// Pick the single best pair from an ambiguous digest group.
///
/// Candidate pairs must pass the exact clone check (the group shares a
/// digest, not necessarily a structure). Scoring: most already-matched
/// ancestor pairs, then smallest absolute document-position distance, then
/// first in traversal order. Strict improvement keeps the result stable.
fn best_ambiguous_pair(
    src: &Tree,
    dst: &Tree,
    group_src: &[NodeId],
    group_dst: &[NodeId],
    mapping: &Mapping,
) -> Option<(NodeId, NodeId)> {
    let mut best: Option<(NodeId, NodeId, usize, usize)> = None;
    for &a in group_src {
        for &b in group_dst {
            if !src.is_clone(a, dst, b) {
                continue;
            }
            let ancestors = matched_ancestor_pairs(src, dst, a, b, mapping);
            let pos_dist = src.pos(a).abs_diff(dst.pos(b));
            let better = match best {
                None => true,
                Some((_, _, best_anc, best_dist)) => {
                    ancestors > best_anc || (ancestors == best_anc && pos_dist < best_dist)
                }
            };
            if better {
                best = Some((a, b, ancestors, pos_dist));
            }
        }
    }
    best.map(|(a, b, _, _)| (a, b))
}

/// Count ancestor pairs of (a, b) that are already linked to each other.
fn matched_ancestor_pairs(
    src: &Tree,
    dst: &Tree,
    a: NodeId,
    b: NodeId,
    mapping: &Mapping,
) -> usize {
    let dst_ancestors: HashSet<NodeId> = dst.ancestors(b).collect();
    src.ancestors(a)
        .filter(|&anc| {
            mapping
                .dst_for(anc)
                .is_some_and(|m| dst_ancestors.contains(&m))
        })
        .count()
}

/// Link two isomorphic subtrees pair by pair via a parallel pre-order walk.
///
/// Each descendant pair is itself isomorphic by construction, so no further
/// candidate search is needed. Pairs where either side is already mapped
/// (by an earlier round) are skipped along with their subtrees.
fn link_isomorphic_subtrees(
    src: &Tree,
    dst: &Tree,
    a: NodeId,
    b: NodeId,
    mapping: &mut Mapping,
) {
    if mapping.is_src_mapped(a) || mapping.is_dst_mapped(b) {
        return;
    }
    mapping.link(a, b);

    for (ca, cb) in src.children(a).zip(dst.children(b)) {
        link_isomorphic_subtrees(src, dst, ca, cb, mapping);
    }
}

/// Lazily computed descendant sets, materialized only for nodes that are
/// actually scored. Descendant sets exclude the node itself.
struct LazyDescendantMap<'a> {
    tree: &'a Tree,
    cache: RefCell<HashMap<NodeId, HashSet<NodeId>>>,
}

impl<'a> LazyDescendantMap<'a> {
    fn new(tree: &'a Tree) -> Self {
        Self {
            tree,
            cache: RefCell::new(HashMap::default()),
        }
    }

    fn get_or_compute(&self, id: NodeId) -> impl core::ops::Deref<Target = HashSet<NodeId>> + '_ {
        if !self.cache.borrow().contains_key(&id) {
            let descendants: HashSet<NodeId> = self.tree.descendants(id).collect();
            self.cache.borrow_mut().insert(id, descendants);
        }
        core::cell::Ref::map(self.cache.borrow(), |m| m.get(&id).unwrap())
    }
}

/// Phase 2: bottom-up matching.
///
/// Visits unmatched source nodes in post-order, so a node's
/// descendant-matching information is complete before the node itself is
/// considered. Leaves and nodes with zero matched descendants carry no
/// signal and are skipped. Candidates are unmapped, kind-compatible
/// destination nodes, scored by the Dice coefficient over matched
/// descendant pairs; the best candidate links if it clears `min_dice`, with
/// ties broken by document-position distance and then traversal order.
/// Nodes that clear nothing stay unmatched, which is final.
fn bottom_up_phase(src: &Tree, dst: &Tree, mapping: &mut Mapping, config: &MatchingConfig) {
    let desc_src = LazyDescendantMap::new(src);
    let desc_dst = LazyDescendantMap::new(dst);

    // Index destination candidates by kind, in traversal order.
    let mut dst_by_kind: HashMap<u32, Vec<NodeId>> = HashMap::default();
    for b in dst.pre_order(dst.root) {
        if !mapping.is_dst_mapped(b) {
            dst_by_kind.entry(dst.kind(b)).or_default().push(b);
        }
    }

    for a in src.post_order(src.root) {
        if mapping.is_src_mapped(a) || src.is_leaf(a) {
            continue;
        }

        // No matched descendant means no signal to score on.
        if !src.descendants(a).any(|d| mapping.is_src_mapped(d)) {
            continue;
        }

        let Some(candidates) = dst_by_kind.get(&src.kind(a)) else {
            continue;
        };

        let mut best: Option<(NodeId, f64, usize)> = None;
        for &b in candidates {
            if mapping.is_dst_mapped(b) {
                continue;
            }

            let score = dice_coefficient(a, b, mapping, &desc_src, &desc_dst);
            trace!(
                a = usize::from(a),
                b = usize::from(b),
                score,
                "bottom_up: dice score"
            );
            let pos_dist = src.pos(a).abs_diff(dst.pos(b));
            let better = match best {
                None => true,
                Some((_, best_score, best_dist)) => {
                    score > best_score || (score == best_score && pos_dist < best_dist)
                }
            };
            if better {
                best = Some((b, score, pos_dist));
            }
        }

        if let Some((b, score, _)) = best
            && score >= config.min_dice
        {
            trace!(
                a = usize::from(a),
                b = usize::from(b),
                score,
                "bottom_up: container match"
            );
            mapping.link(a, b);
            recover_descendants(src, dst, a, b, mapping, config);
        }
    }
}

/// Compute the Dice coefficient between two nodes:
///
/// `dice(a, b) = 2 * |matched descendant pairs spanning a and b| / (|desc(a)| + |desc(b)|)`
fn dice_coefficient(
    a: NodeId,
    b: NodeId,
    mapping: &Mapping,
    desc_src_map: &LazyDescendantMap<'_>,
    desc_dst_map: &LazyDescendantMap<'_>,
) -> f64 {
    #[cfg(feature = "matching-stats")]
    {
        DICE_CALLS.with(|c| *c.borrow_mut() += 1);
        DICE_UNIQUE_SRC.with(|s| {
            s.borrow_mut().insert(a);
        });
        DICE_UNIQUE_DST.with(|s| {
            s.borrow_mut().insert(b);
        });
    }

    let desc_a = desc_src_map.get_or_compute(a);
    let desc_b = desc_dst_map.get_or_compute(b);

    let common = desc_a
        .iter()
        .filter(|&&d| {
            mapping
                .dst_for(d)
                .is_some_and(|m| desc_b.contains(&m))
        })
        .count();

    if desc_a.is_empty() && desc_b.is_empty() {
        1.0
    } else {
        2.0 * common as f64 / (desc_a.len() + desc_b.len()) as f64
    }
}

/// Bounded exact refinement after a container pair links.
///
/// Dice similarity alone is too coarse to recover fine-grained
/// correspondences (individual identifiers, say) once the surrounding
/// containers are known to correspond. Align the pair's immediate unmatched
/// children by longest common subsequence with subtree isomorphism as the
/// equality predicate, and mass-link every aligned pair. Order-preserving,
/// so linked pairs never cross in sibling order. Skipped when the product
/// of the two sides' unmatched-descendant counts reaches
/// `max_recovery_size`.
fn recover_descendants(
    src: &Tree,
    dst: &Tree,
    a: NodeId,
    b: NodeId,
    mapping: &mut Mapping,
    config: &MatchingConfig,
) {
    let unmatched_src = src
        .descendants(a)
        .filter(|&d| !mapping.is_src_mapped(d))
        .count();
    let unmatched_dst = dst
        .descendants(b)
        .filter(|&d| !mapping.is_dst_mapped(d))
        .count();
    if unmatched_src * unmatched_dst >= config.max_recovery_size {
        trace!(
            a = usize::from(a),
            b = usize::from(b),
            unmatched_src,
            unmatched_dst,
            "recovery skipped, size limit"
        );
        return;
    }

    let rows: Vec<NodeId> = src
        .children(a)
        .filter(|&c| !mapping.is_src_mapped(c))
        .collect();
    let cols: Vec<NodeId> = dst
        .children(b)
        .filter(|&c| !mapping.is_dst_mapped(c))
        .collect();
    if rows.is_empty() || cols.is_empty() {
        return;
    }

    // Longest common subsequence over clone equality.
    let mut table = vec![vec![0usize; cols.len() + 1]; rows.len() + 1];
    for (i, &ra) in rows.iter().enumerate() {
        for (j, &cb) in cols.iter().enumerate() {
            table[i + 1][j + 1] = if src.is_clone(ra, dst, cb) {
                table[i][j] + 1
            } else {
                table[i][j + 1].max(table[i + 1][j])
            };
        }
    }

    let (mut i, mut j) = (rows.len(), cols.len());
    while i > 0 && j > 0 {
        if table[i][j] == table[i - 1][j - 1] + 1 && src.is_clone(rows[i - 1], dst, cols[j - 1]) {
            trace!(
                a = usize::from(rows[i - 1]),
                b = usize::from(cols[j - 1]),
                "recovery: aligned pair"
            );
            link_isomorphic_subtrees(src, dst, rows[i - 1], cols[j - 1], mapping);
            i -= 1;
            j -= 1;
        } else if table[i - 1][j] >= table[i][j - 1] {
            i -= 1;
        } else {
            j -= 1;
        }
    }
}
