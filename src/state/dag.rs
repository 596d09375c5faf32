//! State-versioning DAG.
//!
//! One node per finalized block, keyed by state root, with parent edges to
//! prior roots. The DAG records lineage only; canonical ordering stays
//! linear by block height. Traversals are iterative to keep deep histories
//! off the call stack.

use std::collections::{HashMap, HashSet};

use crate::Hash;

/// A node in the state-versioning DAG.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StateNode {
    pub root_hash: Hash,
    pub parents: Vec<Hash>,
    pub height: u64,
}

/// Errors from DAG mutation.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DagError {
    #[error("state node already exists")]
    DuplicateNode,
}

/// Keyed node table plus a child-adjacency map.
#[derive(Debug, Default)]
pub struct StateDag {
    nodes: HashMap<Hash, StateNode>,
    children: HashMap<Hash, Vec<Hash>>,
}

impl StateDag {
    pub fn new() -> Self {
        StateDag::default()
    }

    /// Insert a node, recording child edges from each of its parents.
    pub fn insert(&mut self, node: StateNode) -> Result<(), DagError> {
        if self.nodes.contains_key(&node.root_hash) {
            return Err(DagError::DuplicateNode);
        }
        for parent in &node.parents {
            self.children.entry(*parent).or_default().push(node.root_hash);
        }
        self.nodes.insert(node.root_hash, node);
        Ok(())
    }

    pub fn get(&self, root: &Hash) -> Option<&StateNode> {
        self.nodes.get(root)
    }

    pub fn contains(&self, root: &Hash) -> bool {
        self.nodes.contains_key(root)
    }

    /// Roots with no children, sorted for deterministic reporting.
    pub fn tips(&self) -> Vec<Hash> {
        let mut tips: Vec<Hash> = self
            .nodes
            .keys()
            .filter(|root| {
                self.children
                    .get(*root)
                    .map(|c| c.is_empty())
                    .unwrap_or(true)
            })
            .copied()
            .collect();
        tips.sort_unstable();
        tips
    }

    /// Remove every node unreachable from the finalized root by walking its
    /// parent lineage (iterative DFS). Returns the number of nodes removed.
    pub fn prune(&mut self, finalized_root: &Hash) -> usize {
        let mut keep: HashSet<Hash> = HashSet::new();
        let mut stack = vec![*finalized_root];
        while let Some(root) = stack.pop() {
            if !keep.insert(root) {
                continue;
            }
            if let Some(node) = self.nodes.get(&root) {
                for parent in &node.parents {
                    if !keep.contains(parent) {
                        stack.push(*parent);
                    }
                }
            }
        }

        let before = self.nodes.len();
        self.nodes.retain(|root, _| keep.contains(root));
        self.children.retain(|root, _| keep.contains(root));
        for child_list in self.children.values_mut() {
            child_list.retain(|c| keep.contains(c));
        }
        before - self.nodes.len()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
