//! Double-buffered node caches.
//!
//! Every per-node quantity the peeling pass produces lives in a
//! [`Checkpointed`] buffer: `store` snapshots the live copy, `restore` swaps
//! the snapshot back in without copying.

use ndarray::Array3;

use super::missing::MissingTraits;

/// A live value plus a stored snapshot of it.
#[derive(Clone, Debug)]
pub struct Checkpointed<T: Clone> {
    live: T,
    stored: T,
}

impl<T: Clone> Checkpointed<T> {
    pub fn new(value: T) -> Self {
        Self {
            stored: value.clone(),
            live: value,
        }
    }

    pub fn live(&self) -> &T {
        &self.live
    }

    pub fn live_mut(&mut self) -> &mut T {
        &mut self.live
    }

    pub fn stored(&self) -> &T {
        &self.stored
    }

    /// Copy the live value into the snapshot, reusing its allocation.
    pub fn store(&mut self) {
        self.stored.clone_from(&self.live);
    }

    /// Swap the snapshot back in. The previous live value becomes the
    /// snapshot and is overwritten by the next `store`.
    pub fn restore(&mut self) {
        std::mem::swap(&mut self.live, &mut self.stored);
    }
}

/// Drift shifts involved in one merge: the two child branches, and the
/// merged node's own branch unless it is the root.
#[derive(Clone, Debug)]
pub struct MergeShifts {
    pub child0: Vec<f64>,
    pub child1: Vec<f64>,
    pub this: Option<Vec<f64>>,
}

/// Conditional means per node, shaped `(node, dataset, trait)`.
///
/// The drift variant also keeps drift-corrected means. Without drift the
/// corrected cache is the mean cache itself.
#[derive(Clone, Debug)]
pub enum MeanCache {
    Plain {
        mean: Checkpointed<Array3<f64>>,
    },
    Drift {
        mean: Checkpointed<Array3<f64>>,
        corrected: Checkpointed<Array3<f64>>,
    },
}

impl MeanCache {
    pub fn plain(n_nodes: usize, num_data: usize, dim_trait: usize) -> Self {
        MeanCache::Plain {
            mean: Checkpointed::new(Array3::zeros((n_nodes, num_data, dim_trait))),
        }
    }

    /// Switch to the drift variant, keeping the current means.
    pub fn into_drift(self) -> Self {
        match self {
            MeanCache::Plain { mean } => MeanCache::Drift {
                corrected: mean.clone(),
                mean,
            },
            drift => drift,
        }
    }

    /// Switch back to the plain variant, keeping the current means.
    pub fn into_plain(self) -> Self {
        match self {
            MeanCache::Drift { mean, .. } => MeanCache::Plain { mean },
            plain => plain,
        }
    }

    pub fn has_drift(&self) -> bool {
        matches!(self, MeanCache::Drift { .. })
    }

    pub fn mean(&self) -> &Array3<f64> {
        match self {
            MeanCache::Plain { mean } | MeanCache::Drift { mean, .. } => mean.live(),
        }
    }

    pub fn mean_mut(&mut self) -> &mut Array3<f64> {
        match self {
            MeanCache::Plain { mean } | MeanCache::Drift { mean, .. } => mean.live_mut(),
        }
    }

    pub fn corrected(&self) -> &Array3<f64> {
        match self {
            MeanCache::Plain { mean } => mean.live(),
            MeanCache::Drift { corrected, .. } => corrected.live(),
        }
    }

    pub fn corrected_mut(&mut self) -> &mut Array3<f64> {
        match self {
            MeanCache::Plain { mean } => mean.live_mut(),
            MeanCache::Drift { corrected, .. } => corrected.live_mut(),
        }
    }

    /// Number of datasets and trait dimensions per node.
    pub fn shape(&self) -> (usize, usize) {
        let (_, num_data, dim_trait) = self.mean().dim();
        (num_data, dim_trait)
    }

    /// Write a flattened `[dataset][trait]` vector into a node's means.
    pub fn set_node_values(&mut self, node: usize, values: &[f64]) {
        let (_, dim_trait) = self.shape();
        let mean = self.mean_mut();
        for (j, &value) in values.iter().enumerate() {
            mean[[node, j / dim_trait, j % dim_trait]] = value;
        }
    }

    /// Write one entry of a node's flattened means.
    pub fn set_node_value(&mut self, node: usize, offset: usize, value: f64) {
        let (_, dim_trait) = self.shape();
        self.mean_mut()[[node, offset / dim_trait, offset % dim_trait]] = value;
    }

    /// A node's means flattened as `[dataset][trait]`.
    pub fn node_values(&self, node: usize) -> Vec<f64> {
        self.mean().slice(ndarray::s![node, .., ..]).iter().copied().collect()
    }

    /// Conditional means of one dataset at a node.
    pub fn datum(&self, node: usize, dataset: usize) -> Vec<f64> {
        self.mean().slice(ndarray::s![node, dataset, ..]).to_vec()
    }

    pub fn store(&mut self) {
        match self {
            MeanCache::Plain { mean } => mean.store(),
            MeanCache::Drift { mean, corrected } => {
                mean.store();
                corrected.store();
            }
        }
    }

    pub fn restore(&mut self) {
        match self {
            MeanCache::Plain { mean } => mean.restore(),
            MeanCache::Drift { mean, corrected } => {
                mean.restore();
                corrected.restore();
            }
        }
    }

    /// Merge two children into `this`.
    ///
    /// Plain caches take the precision-weighted average of the child means.
    /// Drift caches first subtract each child's branch drift, average the
    /// corrected child means into `this`, then store `this`'s own corrected
    /// mean (equal to its mean at the root).
    #[allow(clippy::too_many_arguments)]
    pub fn compute_mean_caches(
        &mut self,
        this: usize,
        child0: usize,
        child1: usize,
        precision0: f64,
        precision1: f64,
        missing: &MissingTraits,
        shifts: Option<&MergeShifts>,
    ) {
        match self {
            MeanCache::Plain { mean } => {
                missing.compute_weighted_average(mean.live_mut(), child0, precision0, child1, precision1, this);
            }
            MeanCache::Drift { mean, corrected } => {
                let mean = mean.live_mut();
                let corrected = corrected.live_mut();
                let (_, num_data, dim_trait) = mean.dim();
                let shift_at = |shift: Option<&Vec<f64>>, i: usize| shift.map_or(0.0, |s| s[i]);

                for k in 0..num_data {
                    for i in 0..dim_trait {
                        corrected[[child0, k, i]] =
                            mean[[child0, k, i]] - shift_at(shifts.map(|s| &s.child0), i);
                        corrected[[child1, k, i]] =
                            mean[[child1, k, i]] - shift_at(shifts.map(|s| &s.child1), i);
                    }
                }

                missing.compute_weighted_average(corrected, child0, precision0, child1, precision1, this);

                let this_shift = shifts.and_then(|s| s.this.as_ref());
                for k in 0..num_data {
                    for i in 0..dim_trait {
                        let value = corrected[[this, k, i]];
                        mean[[this, k, i]] = value;
                        corrected[[this, k, i]] = value - shift_at(this_shift, i);
                    }
                }
            }
        }
    }
}
