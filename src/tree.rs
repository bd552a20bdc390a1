/// Tree structure for continuous trait likelihoods.
///
/// Represents a rooted binary tree with branch lengths.
/// Nodes are indexed 0..n_nodes, with tips first, then internal nodes.

use crate::error::{Result, TraitError};

/// Read-only view of a rooted binary tree.
///
/// The likelihood engine only ever queries the tree through this trait, so
/// any tree representation with dense node indices can drive it. Tips must
/// occupy indices `0..external_node_count()`.
pub trait TreeView {
    fn node_count(&self) -> usize;

    fn external_node_count(&self) -> usize;

    /// Index of the root node.
    fn root(&self) -> usize;

    fn is_external(&self, node: usize) -> bool;

    fn is_root(&self, node: usize) -> bool {
        node == self.root()
    }

    /// Child `which` (0 or 1) of an internal node.
    fn child(&self, node: usize, which: usize) -> usize;

    fn parent(&self, node: usize) -> Option<usize>;

    /// Height above the most recent tip.
    fn node_height(&self, node: usize) -> f64;

    /// Length of the branch above `node` (zero for the root).
    fn branch_length(&self, node: usize) -> f64;

    /// Optional display name for a tip, used in log messages.
    fn taxon_name(&self, _node: usize) -> Option<&str> {
        None
    }

    /// Sum of all branch lengths.
    fn total_branch_length(&self) -> f64 {
        (0..self.node_count())
            .filter(|&n| !self.is_root(n))
            .map(|n| self.branch_length(n))
            .sum()
    }

    /// Post-order traversal of nodes (children before parents, root last).
    fn post_order(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.node_count());
        let mut stack = vec![(self.root(), false)];

        while let Some((node, expanded)) = stack.pop() {
            if expanded || self.is_external(node) {
                order.push(node);
                continue;
            }
            stack.push((node, true));
            // child 1 pushed first so child 0 is finished first
            stack.push((self.child(node, 1), false));
            stack.push((self.child(node, 0), false));
        }
        order
    }

    /// Pre-order traversal of nodes (parents before children, root first).
    fn pre_order(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.node_count());
        let mut stack = vec![self.root()];

        while let Some(node) = stack.pop() {
            order.push(node);
            if !self.is_external(node) {
                stack.push(self.child(node, 1));
                stack.push(self.child(node, 0));
            }
        }
        order
    }
}

#[derive(Debug, Clone)]
pub struct Tree {
    pub n_nodes: usize,
    pub n_tips: usize,
    pub parent_indices: Vec<i32>,
    branch_lengths: Vec<f64>,
    pub children: Vec<Vec<usize>>,
    pub root_index: usize,
    heights: Vec<f64>,
    taxon_names: Vec<String>,
}

impl Tree {
    /// Build tree from structure arrays.
    ///
    /// # Arguments
    /// * `parent_indices` - Parent index for each node (-1 for root)
    /// * `branch_lengths` - Branch length for each node (ignored for the root)
    /// * `n_tips` - Number of tip nodes; tips are nodes `0..n_tips`
    ///
    /// # Errors
    /// Returns a configuration error if the arrays disagree in length, there
    /// is not exactly one root, a tip has children, an internal node does not
    /// have exactly two children, a branch length is negative, or some node
    /// is unreachable from the root.
    pub fn from_structure(
        parent_indices: Vec<i32>,
        branch_lengths: Vec<f64>,
        n_tips: usize,
    ) -> Result<Self> {
        let n_nodes = parent_indices.len();

        if branch_lengths.len() != n_nodes {
            return Err(TraitError::config(
                "parent_indices and branch_lengths must have same length",
            ));
        }
        if n_tips == 0 || n_tips > n_nodes {
            return Err(TraitError::config(format!(
                "n_tips = {} is incompatible with {} nodes",
                n_tips, n_nodes
            )));
        }

        // Build children lists
        let mut children = vec![Vec::new(); n_nodes];
        let mut roots = Vec::new();
        for (child_idx, &parent_idx) in parent_indices.iter().enumerate() {
            if parent_idx < 0 {
                roots.push(child_idx);
            } else if (parent_idx as usize) < n_nodes {
                children[parent_idx as usize].push(child_idx);
            } else {
                return Err(TraitError::invalid_index(parent_idx as usize, n_nodes));
            }
        }

        let root_index = match roots.as_slice() {
            [root] => *root,
            [] => return Err(TraitError::config("No root node found (no node with parent_idx == -1)")),
            _ => {
                return Err(TraitError::config(format!(
                    "Expected one root, found {}",
                    roots.len()
                )))
            }
        };

        for (node, kids) in children.iter().enumerate() {
            let expected = if node < n_tips { 0 } else { 2 };
            if kids.len() != expected {
                return Err(TraitError::config(format!(
                    "Node {} has {} children, expected {}",
                    node,
                    kids.len(),
                    expected
                )));
            }
        }

        if let Some(node) = branch_lengths
            .iter()
            .enumerate()
            .position(|(n, &len)| n != root_index && !(len >= 0.0))
        {
            return Err(TraitError::config(format!(
                "Branch length of node {} must be non-negative",
                node
            )));
        }

        let mut tree = Tree {
            n_nodes,
            n_tips,
            parent_indices,
            branch_lengths,
            children,
            root_index,
            heights: vec![0.0; n_nodes],
            taxon_names: Vec::new(),
        };

        if tree.pre_order().len() != n_nodes {
            return Err(TraitError::config("Some nodes are not reachable from the root"));
        }

        tree.update_heights();
        Ok(tree)
    }

    /// Attach tip names (one per tip, in tip index order).
    pub fn with_taxon_names(mut self, names: Vec<String>) -> Result<Self> {
        if names.len() != self.n_tips {
            return Err(TraitError::config(format!(
                "Got {} taxon names for {} tips",
                names.len(),
                self.n_tips
            )));
        }
        self.taxon_names = names;
        Ok(self)
    }

    /// Change the branch above `node`; node heights are recomputed.
    pub fn set_branch_length(&mut self, node: usize, length: f64) -> Result<()> {
        if node >= self.n_nodes {
            return Err(TraitError::invalid_index(node, self.n_nodes));
        }
        if !(length >= 0.0) {
            return Err(TraitError::config(format!(
                "Branch length of node {} must be non-negative",
                node
            )));
        }
        self.branch_lengths[node] = length;
        self.update_heights();
        Ok(())
    }

    /// Heights measured from the deepest tip, so the youngest tip sits at zero.
    fn update_heights(&mut self) {
        let mut depth = vec![0.0; self.n_nodes];
        for node in self.pre_order() {
            if let Some(parent) = self.parent(node) {
                depth[node] = depth[parent] + self.branch_lengths[node];
            }
        }
        let max_depth = depth.iter().cloned().fold(0.0_f64, f64::max);
        for (height, d) in self.heights.iter_mut().zip(depth.iter()) {
            *height = max_depth - d;
        }
    }
}

impl TreeView for Tree {
    fn node_count(&self) -> usize {
        self.n_nodes
    }

    fn external_node_count(&self) -> usize {
        self.n_tips
    }

    fn root(&self) -> usize {
        self.root_index
    }

    fn is_external(&self, node: usize) -> bool {
        self.children[node].is_empty()
    }

    fn child(&self, node: usize, which: usize) -> usize {
        self.children[node][which]
    }

    fn parent(&self, node: usize) -> Option<usize> {
        let parent = self.parent_indices[node];
        if parent < 0 {
            None
        } else {
            Some(parent as usize)
        }
    }

    fn node_height(&self, node: usize) -> f64 {
        self.heights[node]
    }

    fn branch_length(&self, node: usize) -> f64 {
        if node == self.root_index {
            0.0
        } else {
            self.branch_lengths[node]
        }
    }

    fn taxon_name(&self, node: usize) -> Option<&str> {
        self.taxon_names.get(node).map(|s| s.as_str())
    }
}
