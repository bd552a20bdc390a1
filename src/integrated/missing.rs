//! Missing-data tracker.
//!
//! Classifies every node as observed, partially missing or completely
//! missing. Internal nodes carry no data and are always completely missing,
//! which is what tells the sampler to draw them.

use ndarray::Array3;
use tracing::info;

use crate::error::{Result, TraitError};
use crate::tree::TreeView;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MissingStatus {
    Observed,
    /// Some but not all trait entries are missing.
    Partial,
    Complete,
}

#[derive(Clone, Debug)]
pub struct MissingTraits {
    status: Vec<MissingStatus>,
    missing_indices: Vec<usize>,
}

impl MissingTraits {
    /// Classify nodes from indices into the flattened tip data.
    ///
    /// Tip `t` owns flattened entries `t * dim .. (t + 1) * dim`.
    ///
    /// # Errors
    /// Returns an invalid-index error for entries beyond the last tip.
    pub fn new<T: TreeView>(tree: &T, missing_indices: &[usize], dim: usize) -> Result<Self> {
        let n_tips = tree.external_node_count();
        let limit = n_tips * dim;

        let mut missing_count = vec![0usize; n_tips];
        let mut sorted: Vec<usize> = missing_indices.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        for &index in &sorted {
            if index >= limit {
                return Err(TraitError::invalid_index(index, limit));
            }
            missing_count[index / dim] += 1;
        }

        let mut status = vec![MissingStatus::Complete; tree.node_count()];
        for (tip, &count) in missing_count.iter().enumerate() {
            status[tip] = if count == 0 {
                MissingStatus::Observed
            } else if count == dim {
                MissingStatus::Complete
            } else {
                MissingStatus::Partial
            };

            if count > 0 {
                let label = tree
                    .taxon_name(tip)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("tip {}", tip));
                let kind = if count == dim { "completely" } else { "partially" };
                info!(taxon = %label, missing = count, "marking taxon as {} missing", kind);
            }
        }

        Ok(Self {
            status,
            missing_indices: sorted,
        })
    }

    pub fn status(&self, node: usize) -> MissingStatus {
        self.status[node]
    }

    pub fn is_completely_missing(&self, node: usize) -> bool {
        self.status[node] == MissingStatus::Complete
    }

    pub fn is_partially_missing(&self, node: usize) -> bool {
        self.status[node] == MissingStatus::Partial
    }

    /// Sorted, de-duplicated flattened indices.
    pub fn missing_indices(&self) -> &[usize] {
        &self.missing_indices
    }

    /// Precision-weighted average of two child means into `out_node`.
    ///
    /// A child with zero precision is ignored entirely so placeholder values
    /// stored for missing tips never leak into the parent. When both
    /// precisions are zero the parent gets a zero vector. A child with
    /// infinite precision pins the parent to its own mean; callers reject
    /// two infinite children before merging.
    pub fn compute_weighted_average(
        &self,
        mean_cache: &mut Array3<f64>,
        node0: usize,
        precision0: f64,
        node1: usize,
        precision1: f64,
        out_node: usize,
    ) {
        let (_, num_data, dim_trait) = mean_cache.dim();
        let total_precision = precision0 + precision1;

        for k in 0..num_data {
            for i in 0..dim_trait {
                let value = if total_precision == 0.0 {
                    0.0
                } else if precision0 == 0.0 || precision1.is_infinite() {
                    mean_cache[[node1, k, i]]
                } else if precision1 == 0.0 || precision0.is_infinite() {
                    mean_cache[[node0, k, i]]
                } else {
                    (mean_cache[[node0, k, i]] * precision0 + mean_cache[[node1, k, i]] * precision1)
                        / total_precision
                };
                mean_cache[[out_node, k, i]] = value;
            }
        }
    }
}
