//! # Petaurus
//!
//! Structural matching between two versions of a hierarchically structured
//! document (typically two abstract syntax trees of a program): which nodes
//! of the old tree correspond to which nodes of the new one, across
//! insertions, deletions and reordering.
//!
//! Named after *Petaurus breviceps* (the sugar glider), another marsupial at
//! home in gum trees.
//!
//! ## Algorithm Overview
//!
//! The matcher follows GumTree (Falleri et al., ASE 2014) and runs in two
//! phases:
//!
//! 1. **Top-down matching**: commit whole isomorphic subtrees, tallest
//!    first, found by height-bucketed digest search (Merkle-tree style)
//! 2. **Bottom-up matching**: match remaining internal nodes by structural
//!    similarity (Dice coefficient over matched descendants), refining each
//!    freshly matched container with a bounded exact child alignment
//!
//! The output is a [`Mapping`]: a bijection between nodes of the two trees,
//! ready for a downstream edit-script generator. The matching is a fast
//! heuristic, not an optimal tree-edit-distance solver.
//!
//! ## Usage
//!
//! ```
//! use petaurus::{MatchingConfig, NodeData, Tree, match_trees};
//!
//! let mut old = Tree::new(NodeData::unlabeled(0));
//! let f = old.add_child(old.root, NodeData::new(1, "f"));
//! old.add_child(f, NodeData::new(2, "x"));
//! old.refresh();
//!
//! let mut new = Tree::new(NodeData::unlabeled(0));
//! let f = new.add_child(new.root, NodeData::new(1, "f"));
//! new.add_child(f, NodeData::new(2, "x"));
//! new.refresh();
//!
//! let mapping = match_trees(&old, &new, &MatchingConfig::default());
//! assert_eq!(mapping.len(), 3);
//! ```

#![warn(missing_docs)]
#![warn(clippy::std_instead_of_core)]

pub use indextree;

mod tracing_macros;
pub(crate) use tracing_macros::{debug, trace};

/// Bijective mapping store
pub mod mapping;
/// Two-phase matching engine
pub mod matching;
/// Tree representation with cached structural metrics
pub mod tree;

pub use mapping::Mapping;
#[cfg(feature = "matching-stats")]
pub use matching::{get_stats, reset_stats};
pub use matching::{MatchingConfig, is_matchable, match_trees};
pub use tree::{BreadthFirst, Digest, NodeData, Tree, VirtualRoot};
