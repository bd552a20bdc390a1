//! Configuration for the integrated trait likelihood.

/// Options controlling how the likelihood engine rescales branches,
/// integrates the root, checkpoints state and samples ancestors.
#[derive(Clone, Debug)]
pub struct TraitLikelihoodConfig {
    /// Independent replicate datasets per tip, sharing tree and diffusion.
    pub num_data: usize,
    /// Keep double buffers so `restore_state` is an O(1) swap.
    /// Without them a restore forces recomputation.
    pub cache_branches: bool,
    /// Divide branch lengths by the tree normaliser.
    pub scale_by_time: bool,
    /// Normalise by total tree length instead of root height.
    pub use_tree_length: bool,
    /// Divide by branch rates instead of multiplying.
    pub reciprocal_rates: bool,
    /// Apply the root integrator after peeling.
    pub integrate_root: bool,
    /// Accumulate Wishart sufficient statistics while peeling.
    pub compute_wishart_statistics: bool,
    /// Let the ancestral sampler descend below the root.
    pub peel_descendants: bool,
    /// RNG seed for ancestral draws; entropy when None.
    pub seed: Option<u64>,
}

impl Default for TraitLikelihoodConfig {
    fn default() -> Self {
        Self {
            num_data: 1,
            cache_branches: true,
            scale_by_time: false,
            use_tree_length: false,
            reciprocal_rates: false,
            integrate_root: true,
            compute_wishart_statistics: false,
            peel_descendants: true,
            seed: None,
        }
    }
}
