//! The integrated trait likelihood engine.
//!
//! Owns the per-node caches, gates recomputation behind a dirty flag and
//! implements the store/restore protocol an MCMC driver relies on. The
//! passes themselves live in `peeling` and `sampler`.

use ndarray::{Array2, Array3};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;

use super::cache::{Checkpointed, MeanCache};
use super::missing::MissingTraits;
use super::root::RootIntegrator;
use super::wishart::WishartStatistics;
use crate::config::TraitLikelihoodConfig;
use crate::diffusion::{BranchRateModel, DiffusionModel, StrictClock};
use crate::error::{Result, TraitError};
use crate::tree::{Tree, TreeView};

/// Observed trait values at the tips.
///
/// `tips[t]` holds `num_data * dim_trait` values laid out as
/// `[dataset][trait]`. `missing_indices` index the concatenation of all tip
/// vectors.
#[derive(Clone, Debug, Default)]
pub struct TraitData {
    pub tips: Vec<Vec<f64>>,
    pub missing_indices: Vec<usize>,
}

impl TraitData {
    pub fn new(tips: Vec<Vec<f64>>) -> Self {
        Self {
            tips,
            missing_indices: Vec::new(),
        }
    }

    pub fn with_missing(tips: Vec<Vec<f64>>, missing_indices: Vec<usize>) -> Self {
        Self { tips, missing_indices }
    }

    /// One row per tip. NaN entries become missing and are stored as 0.
    ///
    /// # Errors
    /// Returns a configuration error for an infinite entry.
    pub fn from_matrix(values: ndarray::ArrayView2<f64>) -> Result<Self> {
        let dim = values.ncols();
        let mut missing_indices = Vec::new();
        let mut tips = Vec::with_capacity(values.nrows());
        for (tip, row) in values.outer_iter().enumerate() {
            let mut tip_values = Vec::with_capacity(dim);
            for (i, &v) in row.iter().enumerate() {
                if v.is_nan() {
                    missing_indices.push(tip * dim + i);
                    tip_values.push(0.0);
                } else if v.is_infinite() {
                    return Err(TraitError::config(format!(
                        "trait value {} of tip {} is infinite",
                        i, tip
                    )));
                } else {
                    tip_values.push(v);
                }
            }
            tips.push(tip_values);
        }
        Ok(Self { tips, missing_indices })
    }
}

/// Likelihood of multivariate Brownian trait data on a tree with all
/// internal node states integrated out.
pub struct IntegratedTraitLikelihood<T: TreeView = Tree> {
    pub(super) tree: T,
    pub(super) diffusion: DiffusionModel,
    pub(super) rate_model: Box<dyn BranchRateModel>,
    pub(super) drift_models: Option<Vec<Box<dyn BranchRateModel>>>,
    pub(super) root_integrator: Box<dyn RootIntegrator>,
    pub(super) config: TraitLikelihoodConfig,
    pub(super) missing: MissingTraits,
    pub(super) dim_trait: usize,
    pub(super) num_data: usize,
    pub(super) tree_normaliser: f64,

    pub(super) cache: MeanCache,
    pub(super) upper_precision: Checkpointed<Vec<f64>>,
    pub(super) lower_precision: Checkpointed<Vec<f64>>,
    pub(super) log_remainders: Checkpointed<Vec<f64>>,
    pub(super) drawn_states: Checkpointed<Array3<f64>>,
    pub(super) wishart: Option<WishartStatistics>,
    stored_wishart: Option<WishartStatistics>,

    log_likelihood: f64,
    stored_log_likelihood: f64,
    likelihood_known: bool,
    stored_likelihood_known: bool,
    pub(super) states_redrawn: bool,
    stored_states_redrawn: bool,

    pub(super) rng: StdRng,
}

impl<T: TreeView> IntegratedTraitLikelihood<T> {
    /// Build an engine over `tree`.
    ///
    /// # Errors
    /// Configuration errors for a tip count that does not match the tree,
    /// a tip vector shorter than `num_data * dim_trait`, a root prior of the
    /// wrong dimension or `num_data == 0`. An invalid-index error for a
    /// missing index beyond the tip data.
    pub fn new(
        tree: T,
        diffusion: DiffusionModel,
        data: TraitData,
        root_integrator: Box<dyn RootIntegrator>,
        config: TraitLikelihoodConfig,
    ) -> Result<Self> {
        let dim_trait = diffusion.dim();
        let num_data = config.num_data;
        if num_data == 0 {
            return Err(TraitError::config("num_data must be at least 1"));
        }
        if root_integrator.dim() != dim_trait {
            return Err(TraitError::config(format!(
                "root prior has dimension {} but the diffusion has dimension {}",
                root_integrator.dim(),
                dim_trait
            )));
        }
        let n_tips = tree.external_node_count();
        if data.tips.len() != n_tips {
            return Err(TraitError::config(format!(
                "expected trait data for {} tips, got {}",
                n_tips,
                data.tips.len()
            )));
        }

        let dim = dim_trait * num_data;
        let missing = MissingTraits::new(&tree, &data.missing_indices, dim)?;

        let n_nodes = tree.node_count();
        let mut cache = MeanCache::plain(n_nodes, num_data, dim_trait);
        for (tip, values) in data.tips.iter().enumerate() {
            if values.len() < dim {
                return Err(TraitError::config(format!(
                    "the trait parameter for the tip with index {} is too short ({} < {})",
                    tip,
                    values.len(),
                    dim
                )));
            }
            cache.set_node_values(tip, &values[..dim]);
        }

        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(Self {
            tree,
            diffusion,
            rate_model: Box::new(StrictClock::default()),
            drift_models: None,
            root_integrator,
            missing,
            dim_trait,
            num_data,
            tree_normaliser: 1.0,
            cache,
            upper_precision: Checkpointed::new(vec![0.0; n_nodes]),
            lower_precision: Checkpointed::new(vec![0.0; n_nodes]),
            log_remainders: Checkpointed::new(vec![0.0; n_nodes]),
            drawn_states: Checkpointed::new(Array3::zeros((n_nodes, num_data, dim_trait))),
            wishart: None,
            stored_wishart: None,
            log_likelihood: 0.0,
            stored_log_likelihood: 0.0,
            likelihood_known: false,
            stored_likelihood_known: false,
            states_redrawn: false,
            stored_states_redrawn: false,
            rng,
            config,
        })
    }

    /// Rescale branches by `rate_model`.
    pub fn with_rate_model(mut self, rate_model: Box<dyn BranchRateModel>) -> Self {
        self.set_rate_model(rate_model);
        self
    }

    /// Add one drift rate model per trait dimension.
    pub fn with_drift_models(mut self, drift_models: Vec<Box<dyn BranchRateModel>>) -> Result<Self> {
        self.set_drift_models(Some(drift_models))?;
        Ok(self)
    }

    pub fn set_rate_model(&mut self, rate_model: Box<dyn BranchRateModel>) {
        self.rate_model = rate_model;
        self.make_dirty();
    }

    /// Replace or remove the drift models, switching the mean cache
    /// variant to match.
    pub fn set_drift_models(&mut self, drift_models: Option<Vec<Box<dyn BranchRateModel>>>) -> Result<()> {
        if let Some(models) = &drift_models {
            if models.len() != self.dim_trait {
                return Err(TraitError::config(format!(
                    "expected {} drift models, one per trait dimension, got {}",
                    self.dim_trait,
                    models.len()
                )));
            }
        }
        let cache = std::mem::replace(&mut self.cache, MeanCache::plain(0, 0, 0));
        self.cache = if drift_models.is_some() {
            cache.into_drift()
        } else {
            cache.into_plain()
        };
        self.drift_models = drift_models;
        self.make_dirty();
        Ok(())
    }

    /// Log-likelihood, recomputed by a full peeling pass only when dirty.
    pub fn get_log_likelihood(&mut self) -> Result<f64> {
        if !self.likelihood_known {
            self.log_likelihood = self.calculate_log_likelihood()?;
            self.likelihood_known = true;
        }
        Ok(self.log_likelihood)
    }

    pub fn make_dirty(&mut self) {
        self.likelihood_known = false;
        self.states_redrawn = false;
    }

    pub fn is_likelihood_known(&self) -> bool {
        self.likelihood_known
    }

    pub fn are_states_redrawn(&self) -> bool {
        self.states_redrawn
    }

    /// Drawn trait vector at `node`, flattened as `[dataset][trait]`.
    /// Samples all ancestral states first if the current draw is stale.
    pub fn get_trait_for_node(&mut self, node: usize) -> Result<Vec<f64>> {
        let n_nodes = self.tree.node_count();
        if node >= n_nodes {
            return Err(TraitError::invalid_index(node, n_nodes));
        }
        self.get_log_likelihood()?;
        if !self.states_redrawn {
            self.redraw_ancestral_states()?;
        }
        Ok(self
            .drawn_states
            .live()
            .slice(ndarray::s![node, .., ..])
            .iter()
            .copied()
            .collect())
    }

    pub fn root_trait(&mut self) -> Result<Vec<f64>> {
        let root = self.tree.root();
        self.get_trait_for_node(root)
    }

    /// Draw a fresh set of ancestral states from their joint posterior.
    pub fn redraw_ancestral_states(&mut self) -> Result<()> {
        self.get_log_likelihood()?;
        debug!("redrawing ancestral states");
        self.pre_order_traverse_sample()?;
        self.states_redrawn = true;
        Ok(())
    }

    /// All drawn states, shaped `(node, dataset, trait)`.
    pub fn drawn_states(&self) -> &Array3<f64> {
        self.drawn_states.live()
    }

    pub fn store_state(&mut self) {
        debug!(log_likelihood = self.log_likelihood, "storing likelihood state");
        self.stored_log_likelihood = self.log_likelihood;
        self.stored_likelihood_known = self.likelihood_known;
        self.stored_states_redrawn = self.states_redrawn;
        self.stored_wishart.clone_from(&self.wishart);

        // tip data lives in the mean cache, so it is always checkpointed
        self.cache.store();
        if self.config.cache_branches {
            self.upper_precision.store();
            self.lower_precision.store();
            self.log_remainders.store();
            self.drawn_states.store();
        }
    }

    pub fn restore_state(&mut self) {
        self.log_likelihood = self.stored_log_likelihood;
        self.likelihood_known = self.stored_likelihood_known;
        self.states_redrawn = self.stored_states_redrawn;
        std::mem::swap(&mut self.wishart, &mut self.stored_wishart);

        self.cache.restore();
        if self.config.cache_branches {
            self.upper_precision.restore();
            self.lower_precision.restore();
            self.log_remainders.restore();
            self.drawn_states.restore();
        } else {
            self.make_dirty();
        }
        debug!(log_likelihood = self.log_likelihood, known = self.likelihood_known, "restored likelihood state");
    }

    /// Replace all values of one tip.
    pub fn set_tip_values(&mut self, tip: usize, values: &[f64]) -> Result<()> {
        let n_tips = self.tree.external_node_count();
        if tip >= n_tips {
            return Err(TraitError::invalid_index(tip, n_tips));
        }
        let dim = self.dim();
        if values.len() < dim {
            return Err(TraitError::config(format!(
                "the trait parameter for the tip with index {} is too short ({} < {})",
                tip,
                values.len(),
                dim
            )));
        }
        self.cache.set_node_values(tip, &values[..dim]);
        self.make_dirty();
        Ok(())
    }

    /// Update one entry of the flattened tip data.
    pub fn set_tip_value(&mut self, flat_index: usize, value: f64) -> Result<()> {
        let dim = self.dim();
        let limit = self.tree.external_node_count() * dim;
        if flat_index >= limit {
            return Err(TraitError::invalid_index(flat_index, limit));
        }
        self.cache.set_node_value(flat_index / dim, flat_index % dim, value);
        self.make_dirty();
        Ok(())
    }

    pub fn tip_data_values(&self, tip: usize) -> Result<Vec<f64>> {
        let n_tips = self.tree.external_node_count();
        if tip >= n_tips {
            return Err(TraitError::invalid_index(tip, n_tips));
        }
        Ok(self.cache.node_values(tip))
    }

    /// Conditional precision at the root after peeling.
    pub fn total_tree_precision(&mut self) -> Result<f64> {
        self.get_log_likelihood()?;
        Ok(self.lower_precision.live()[self.tree.root()])
    }

    pub fn upper_precisions(&self) -> &[f64] {
        self.upper_precision.live()
    }

    pub fn lower_precisions(&self) -> &[f64] {
        self.lower_precision.live()
    }

    pub fn log_remainders(&self) -> &[f64] {
        self.log_remainders.live()
    }

    pub fn sum_log_remainders(&self) -> f64 {
        self.log_remainders.live().iter().sum()
    }

    pub fn mean_cache(&self) -> &Array3<f64> {
        self.cache.mean()
    }

    /// Same storage as `mean_cache` unless drift models are set.
    pub fn corrected_mean_cache(&self) -> &Array3<f64> {
        self.cache.corrected()
    }

    /// Statistics from the last peeling pass, when enabled.
    pub fn wishart_statistics(&self) -> Option<&WishartStatistics> {
        self.wishart.as_ref()
    }

    pub fn set_compute_wishart_statistics(&mut self, enabled: bool) {
        self.config.compute_wishart_statistics = enabled;
        self.make_dirty();
    }

    pub fn missing_traits(&self) -> &MissingTraits {
        &self.missing
    }

    pub fn tree(&self) -> &T {
        &self.tree
    }

    /// Mutable tree access. Marks the likelihood dirty.
    pub fn tree_mut(&mut self) -> &mut T {
        self.make_dirty();
        &mut self.tree
    }

    pub fn diffusion(&self) -> &DiffusionModel {
        &self.diffusion
    }

    /// Mutable diffusion access. Marks the likelihood dirty.
    pub fn diffusion_mut(&mut self) -> &mut DiffusionModel {
        self.make_dirty();
        &mut self.diffusion
    }

    /// Mutable rate model access. Marks the likelihood dirty.
    pub fn rate_model_mut(&mut self) -> &mut Box<dyn BranchRateModel> {
        self.make_dirty();
        &mut self.rate_model
    }

    pub fn config(&self) -> &TraitLikelihoodConfig {
        &self.config
    }

    pub fn dim_trait(&self) -> usize {
        self.dim_trait
    }

    pub fn num_data(&self) -> usize {
        self.num_data
    }

    /// Values per node: `num_data * dim_trait`.
    pub fn dim(&self) -> usize {
        self.num_data * self.dim_trait
    }

    pub fn precision_matrix(&self) -> &Array2<f64> {
        self.diffusion.precision_matrix()
    }
}
