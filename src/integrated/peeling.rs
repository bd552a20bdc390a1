//! Post-order peeling pass.
//!
//! Each node gets a conditional mean and a scalar precision (in units of
//! Σ⁻¹) summarising the tips below it. Merging two children integrates out
//! the node's own trait and leaves a remainder density; the likelihood is
//! the sum of all remainders plus the root term.

use ndarray::Array2;
use tracing::{debug, debug_span, trace};

use super::cache::MergeShifts;
use super::likelihood::IntegratedTraitLikelihood;
use super::missing::MissingStatus;
use super::wishart::WishartStatistics;
use crate::diffusion::drift_shift;
use crate::error::{Result, TraitError};
use crate::linalg::{quadratic_product, scaled_product_and_square, LOG_SQRT_2_PI};
use crate::tree::TreeView;

impl<T: TreeView> IntegratedTraitLikelihood<T> {
    /// Divisor applied to every branch when scaling by time.
    fn compute_tree_normaliser(&self) -> f64 {
        if !self.config.scale_by_time {
            1.0
        } else if self.config.use_tree_length {
            self.tree.total_branch_length()
        } else {
            self.tree.node_height(self.tree.root())
        }
    }

    /// Branch length above `node` in diffusion units.
    pub(super) fn rescaled_branch_length(&self, node: usize) -> f64 {
        let mut length = self.tree.branch_length(node);
        let rate = self.rate_model.branch_rate(node);
        if self.config.reciprocal_rates {
            length /= rate;
        } else {
            length *= rate;
        }
        length / self.tree_normaliser
    }

    /// Drift accumulated along the branch above `node`, if drift is modelled.
    pub(super) fn shift_for_branch(&self, node: usize) -> Option<Vec<f64>> {
        self.drift_models
            .as_ref()
            .map(|models| drift_shift(models, node, self.tree.branch_length(node)))
    }

    fn merge_shifts(&self, this: usize, child0: usize, child1: usize) -> Option<MergeShifts> {
        let models = self.drift_models.as_ref()?;
        let shift = |node: usize| drift_shift(models, node, self.tree.branch_length(node));
        Some(MergeShifts {
            child0: shift(child0),
            child1: shift(child1),
            this: (!self.tree.is_root(this)).then(|| shift(this)),
        })
    }

    pub(super) fn calculate_log_likelihood(&mut self) -> Result<f64> {
        let precision = self.diffusion.precision_matrix().clone();
        let log_det = self.diffusion.log_det_precision_matrix();
        let dim_trait = self.dim_trait;

        if let Some(tip) = (0..self.tree.external_node_count()).find(|&tip| self.missing.is_partially_missing(tip)) {
            return Err(TraitError::not_implemented(format!(
                "likelihood with partially missing traits (tip {})",
                tip
            )));
        }

        self.tree_normaliser = self.compute_tree_normaliser();
        self.wishart = self
            .config
            .compute_wishart_statistics
            .then(|| WishartStatistics::new(dim_trait));

        {
            let _span = debug_span!("peel", nodes = self.tree.node_count()).entered();
            self.post_order_traverse(&precision, log_det)?;
        }
        trace!(
            upper = ?self.upper_precision.live(),
            lower = ?self.lower_precision.live(),
            remainders = ?self.log_remainders.live(),
            "peeled caches"
        );

        let root = self.tree.root();
        let root_precision = self.lower_precision.live()[root];
        let mut scaled_precision_mean = vec![0.0; dim_trait];
        let mut log_likelihood = 0.0;

        if root_precision.is_infinite() && !self.config.integrate_root {
            return Err(TraitError::numeric(
                "root sits at zero distance from an observed tip; its conditional density is degenerate",
            ));
        }

        for k in 0..self.num_data {
            let root_mean = self.cache.datum(root, k);
            if root_precision.is_infinite() {
                log_likelihood += self.root_integrator.log_prior_density_at_root(
                    &root_mean,
                    &precision,
                    log_det,
                    self.wishart.as_mut(),
                )?;
                continue;
            }

            let y_ay = scaled_product_and_square(&root_mean, &mut scaled_precision_mean, &precision, root_precision);

            if root_precision != 0.0 {
                log_likelihood += -(dim_trait as f64) * LOG_SQRT_2_PI
                    + 0.5 * (log_det + dim_trait as f64 * root_precision.ln() - y_ay);
            }
            if self.config.integrate_root {
                log_likelihood += self.root_integrator.integrate_log_likelihood_at_root(
                    &root_mean,
                    &mut scaled_precision_mean,
                    &precision,
                    root_precision,
                    self.wishart.as_mut(),
                )?;
            }
        }

        log_likelihood += self.sum_log_remainders();
        self.states_redrawn = false;

        debug!(log_likelihood, root_precision, "computed integrated trait likelihood");
        Ok(log_likelihood)
    }

    fn post_order_traverse(&mut self, precision: &Array2<f64>, log_det: f64) -> Result<()> {
        for node in self.tree.post_order() {
            self.log_remainders.live_mut()[node] = 0.0;

            if self.tree.is_external(node) {
                let (upper, lower) = match self.missing.status(node) {
                    MissingStatus::Observed => (1.0 / self.rescaled_branch_length(node), f64::INFINITY),
                    // partial tips are rejected before peeling
                    MissingStatus::Partial | MissingStatus::Complete => (0.0, 0.0),
                };
                self.upper_precision.live_mut()[node] = upper;
                self.lower_precision.live_mut()[node] = lower;
                continue;
            }

            let child0 = self.tree.child(node, 0);
            let child1 = self.tree.child(node, 1);
            let precision0 = self.upper_precision.live()[child0];
            let precision1 = self.upper_precision.live()[child1];
            if precision0.is_infinite() && precision1.is_infinite() {
                return Err(TraitError::numeric(format!(
                    "both children of node {} sit at zero distance from observed tips",
                    node
                )));
            }
            let total_precision = precision0 + precision1;
            self.lower_precision.live_mut()[node] = total_precision;

            let shifts = self.merge_shifts(node, child0, child1);
            self.cache
                .compute_mean_caches(node, child0, child1, precision0, precision1, &self.missing, shifts.as_ref());

            if !self.tree.is_root(node) {
                let this_precision = 1.0 / self.rescaled_branch_length(node);
                self.upper_precision.live_mut()[node] = if this_precision.is_infinite() {
                    total_precision
                } else if total_precision.is_infinite() {
                    this_precision
                } else {
                    total_precision * this_precision / (total_precision + this_precision)
                };
            }

            if precision0 != 0.0 && precision1 != 0.0 {
                self.increment_remainder_densities(node, child0, child1, precision0, precision1, precision, log_det);
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn increment_remainder_densities(
        &mut self,
        this: usize,
        child0: usize,
        child1: usize,
        precision0: f64,
        precision1: f64,
        precision: &Array2<f64>,
        log_det: f64,
    ) {
        let dim_trait = self.dim_trait;
        // a child pinned by a zero-length branch leaves N(c_other; c_pinned, Σ / p_other)
        let pinned = precision0.is_infinite() || precision1.is_infinite();
        let remainder_precision = if precision0.is_infinite() {
            precision1
        } else if precision1.is_infinite() {
            precision0
        } else {
            precision0 * precision1 / (precision0 + precision1)
        };
        let normaliser =
            -(dim_trait as f64) * LOG_SQRT_2_PI + 0.5 * (dim_trait as f64 * remainder_precision.ln() + log_det);

        let corrected = self.cache.corrected();
        let mean = self.cache.mean();
        let mut remainder = 0.0;

        for k in 0..self.num_data {
            let c0: Vec<f64> = (0..dim_trait).map(|i| corrected[[child0, k, i]]).collect();
            let c1: Vec<f64> = (0..dim_trait).map(|i| corrected[[child1, k, i]]).collect();
            let parent: Vec<f64> = (0..dim_trait).map(|i| mean[[this, k, i]]).collect();

            if pinned {
                let contrast: Vec<f64> = c0.iter().zip(&c1).map(|(a, b)| a - b).collect();
                remainder += normaliser - 0.5 * remainder_precision * quadratic_product(&contrast, precision, &contrast);
                if let Some(stats) = self.wishart.as_mut() {
                    stats.add_outer_product(&contrast, &contrast, remainder_precision);
                }
                continue;
            }

            let child0_ss = quadratic_product(&c0, precision, &c0) * precision0;
            let child1_ss = quadratic_product(&c1, precision, &c1) * precision1;
            let weighted: Vec<f64> = c0
                .iter()
                .zip(&c1)
                .map(|(a, b)| a * precision0 + b * precision1)
                .collect();
            let cross_ss = quadratic_product(&weighted, precision, &parent);

            remainder += normaliser - 0.5 * (child0_ss + child1_ss - cross_ss);

            if let Some(stats) = self.wishart.as_mut() {
                stats.add_merge(&c0, precision0, &c1, precision1, &parent);
            }
        }

        if let Some(stats) = self.wishart.as_mut() {
            stats.increment_df(1);
        }
        self.log_remainders.live_mut()[this] += remainder;
    }
}

#[cfg(test)]
mod tests {
    use crate::config::TraitLikelihoodConfig;
    use crate::diffusion::{DiffusionModel, StrictClock};
    use crate::error::TraitError;
    use crate::integrated::likelihood::{IntegratedTraitLikelihood, TraitData};
    use crate::integrated::root::ConjugateRootPrior;
    use crate::linalg::LOG_SQRT_2_PI;
    use crate::tree::Tree;
    use ndarray::array;

    fn cherry_tree() -> Tree {
        // ((0:1, 1:1)3:1, 2:2)4
        Tree::from_structure(vec![3, 3, 4, 4, -1], vec![1.0, 1.0, 2.0, 1.0, 0.0], 3).unwrap()
    }

    fn engine(tips: Vec<Vec<f64>>, missing: Vec<usize>, dim: usize) -> IntegratedTraitLikelihood {
        let diffusion = if dim == 1 {
            DiffusionModel::univariate(1.0).unwrap()
        } else {
            DiffusionModel::new(array![[2.0, 0.5], [0.5, 1.0]]).unwrap()
        };
        IntegratedTraitLikelihood::new(
            cherry_tree(),
            diffusion,
            TraitData::with_missing(tips, missing),
            Box::new(ConjugateRootPrior::new(vec![0.0; dim], 1.0).unwrap()),
            TraitLikelihoodConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_precisions() {
        let mut engine = engine(vec![vec![0.0], vec![1.0], vec![3.0]], vec![], 1);
        engine.get_log_likelihood().unwrap();

        let upper = engine.upper_precisions();
        let lower = engine.lower_precisions();
        assert_eq!(upper[0], 1.0);
        assert_eq!(upper[2], 0.5);
        assert!(lower[0].is_infinite());
        // node 3: total 2, own branch 1 => 2/3
        assert!((lower[3] - 2.0).abs() < 1e-12);
        assert!((upper[3] - 2.0 / 3.0).abs() < 1e-12);
        // root: 2/3 + 1/2
        assert!((lower[4] - 7.0 / 6.0).abs() < 1e-12);
        assert_eq!(upper[4], 0.0);

        // means: node 3 at 0.5, root (0.5 * 2/3 + 3 * 1/2) / (7/6)
        assert!((engine.mean_cache()[[3, 0, 0]] - 0.5).abs() < 1e-12);
        assert!((engine.mean_cache()[[4, 0, 0]] - (1.0 / 3.0 + 1.5) / (7.0 / 6.0)).abs() < 1e-12);
    }

    #[test]
    fn test_remainders_only_on_internal_nodes() {
        let mut engine = engine(vec![vec![0.0], vec![1.0], vec![3.0]], vec![], 1);
        engine.get_log_likelihood().unwrap();
        let remainders = engine.log_remainders();
        assert_eq!(&remainders[..3], &[0.0, 0.0, 0.0]);
        assert!(remainders[3] < 0.0);
        assert!(remainders[4] < 0.0);
        assert!((engine.sum_log_remainders() - (remainders[3] + remainders[4])).abs() < 1e-15);
    }

    #[test]
    fn test_zero_length_internal_branch() {
        let tree = Tree::from_structure(vec![3, 3, 4, 4, -1], vec![1.0, 1.0, 2.0, 0.0, 0.0], 3).unwrap();
        let mut engine = IntegratedTraitLikelihood::new(
            tree,
            DiffusionModel::univariate(1.0).unwrap(),
            TraitData::new(vec![vec![0.0], vec![1.0], vec![3.0]]),
            Box::new(ConjugateRootPrior::new(vec![0.0], 1.0).unwrap()),
            TraitLikelihoodConfig::default(),
        )
        .unwrap();
        assert!(engine.get_log_likelihood().unwrap().is_finite());
        // infinite branch precision passes the subtree precision through
        assert!((engine.upper_precisions()[3] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_both_children_missing() {
        // tips 0 and 1 both missing: node 3 is uninformative
        let mut engine = engine(vec![vec![9.0], vec![9.0], vec![3.0]], vec![0, 1], 1);
        let log_likelihood = engine.get_log_likelihood().unwrap();
        assert_eq!(engine.lower_precisions()[3], 0.0);
        assert_eq!(engine.upper_precisions()[3], 0.0);
        assert_eq!(engine.mean_cache()[[3, 0, 0]], 0.0);
        assert_eq!(engine.log_remainders()[4], 0.0);

        // only tip 2 remains: N(3; 0, t2 + 1/κ) = N(3; 0, 3)
        let variance: f64 = 3.0;
        let expected = -crate::linalg::LOG_SQRT_2_PI - 0.5 * variance.ln() - 4.5 / variance;
        assert!((log_likelihood - expected).abs() < 1e-12);
    }

    #[test]
    fn test_partial_tip_is_rejected() {
        let tips = vec![vec![0.0, 1.0], vec![1.0, 2.0], vec![3.0, -1.0]];
        let mut partial = engine(tips.clone(), vec![1], 2);
        assert!(matches!(partial.get_log_likelihood(), Err(TraitError::NotImplemented { .. })));
        assert!(!partial.is_likelihood_known());

        // a completely missing tip is still fine
        let mut complete = engine(tips, vec![0, 1], 2);
        assert!(complete.get_log_likelihood().unwrap().is_finite());
    }

    #[test]
    fn test_partial_replicate_is_rejected() {
        // one missing replicate value must not drop the other replicate
        let tree = Tree::from_structure(vec![4, 4, 5, 5, 6, 6, -1], vec![1.0; 7], 4).unwrap();
        let mut engine = IntegratedTraitLikelihood::new(
            tree,
            DiffusionModel::univariate(1.0).unwrap(),
            TraitData::with_missing(
                vec![vec![0.0, 1.0], vec![2.0, 1.0], vec![4.0, -1.0], vec![6.0, 0.0]],
                vec![7],
            ),
            Box::new(ConjugateRootPrior::new(vec![0.0], 1.0).unwrap()),
            TraitLikelihoodConfig {
                num_data: 2,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(engine.missing_traits().is_partially_missing(3));
        assert!(matches!(engine.get_log_likelihood(), Err(TraitError::NotImplemented { .. })));
    }

    #[test]
    fn test_zero_length_tip_branch() {
        // ((0:0, 1:1)3:1, 2:2)4 with tips 1, 2, 3: node 3 is tip 0.
        // Marginal covariance [[2,2,1],[2,3,1],[1,1,3]], det 5, x'C⁻¹x = 4.
        let tree = Tree::from_structure(vec![3, 3, 4, 4, -1], vec![0.0, 1.0, 2.0, 1.0, 0.0], 3).unwrap();
        let mut engine = IntegratedTraitLikelihood::new(
            tree,
            DiffusionModel::univariate(1.0).unwrap(),
            TraitData::new(vec![vec![1.0], vec![2.0], vec![3.0]]),
            Box::new(ConjugateRootPrior::new(vec![0.0], 1.0).unwrap()),
            TraitLikelihoodConfig {
                compute_wishart_statistics: true,
                ..Default::default()
            },
        )
        .unwrap();
        let log_likelihood = engine.get_log_likelihood().unwrap();
        let expected = -3.0 * LOG_SQRT_2_PI - 0.5 * 5.0_f64.ln() - 2.0;
        assert!((log_likelihood - expected).abs() < 1e-12);

        assert_eq!(engine.mean_cache()[[3, 0, 0]], 1.0);
        assert!(engine.lower_precisions()[3].is_infinite());
        assert_eq!(engine.upper_precisions()[3], 1.0);
        // N(2; 1, 1)
        assert!((engine.log_remainders()[3] - (-LOG_SQRT_2_PI - 0.5)).abs() < 1e-12);

        // (1 - 2)² from the pinned merge, (1/3)(1 - 3)² at the root merge and
        // (3/5)(5/3)² from the root prior: the quadratic form x'C⁻¹x
        let stats = engine.wishart_statistics().unwrap();
        assert!((stats.scale_matrix()[[0, 0]] - 4.0).abs() < 1e-9);
        assert_eq!(stats.df(), 3);
    }

    #[test]
    fn test_zero_length_tip_under_root() {
        // ((0:1, 1:1)3:1, 2:0)4 with tips 0, 1, 3: the root equals tip 2, so
        // the likelihood is N(3; 0, 1) times the density of tips 0 and 1
        // given the root, N((0, 1); (3, 3), [[2, 1], [1, 2]]).
        let tree = Tree::from_structure(vec![3, 3, 4, 4, -1], vec![1.0, 1.0, 0.0, 1.0, 0.0], 3).unwrap();
        let mut engine = IntegratedTraitLikelihood::new(
            tree,
            DiffusionModel::univariate(1.0).unwrap(),
            TraitData::new(vec![vec![0.0], vec![1.0], vec![3.0]]),
            Box::new(ConjugateRootPrior::new(vec![0.0], 1.0).unwrap()),
            TraitLikelihoodConfig {
                compute_wishart_statistics: true,
                ..Default::default()
            },
        )
        .unwrap();
        let log_likelihood = engine.get_log_likelihood().unwrap();
        let expected = -3.0 * LOG_SQRT_2_PI - 0.5 * 3.0_f64.ln() - 7.0 / 3.0 - 4.5;
        assert!((log_likelihood - expected).abs() < 1e-12);
        assert!(engine.total_tree_precision().unwrap().is_infinite());

        // 1/2 (0 - 1)² + 2/3 (1/2 - 3)² from the merges, κ 3² from the root
        let stats = engine.wishart_statistics().unwrap();
        assert!((stats.scale_matrix()[[0, 0]] - (14.0 / 3.0 + 9.0)).abs() < 1e-9);
        assert_eq!(stats.df(), 3);
    }

    #[test]
    fn test_pinned_root_needs_integration() {
        let tree = Tree::from_structure(vec![3, 3, 4, 4, -1], vec![1.0, 1.0, 0.0, 1.0, 0.0], 3).unwrap();
        let mut engine = IntegratedTraitLikelihood::new(
            tree,
            DiffusionModel::univariate(1.0).unwrap(),
            TraitData::new(vec![vec![0.0], vec![1.0], vec![3.0]]),
            Box::new(ConjugateRootPrior::new(vec![0.0], 1.0).unwrap()),
            TraitLikelihoodConfig {
                integrate_root: false,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(matches!(engine.get_log_likelihood(), Err(TraitError::Numeric { .. })));
    }

    #[test]
    fn test_zero_length_siblings_rejected() {
        let tree = Tree::from_structure(vec![3, 3, 4, 4, -1], vec![0.0, 0.0, 2.0, 1.0, 0.0], 3).unwrap();
        let mut engine = IntegratedTraitLikelihood::new(
            tree,
            DiffusionModel::univariate(1.0).unwrap(),
            TraitData::new(vec![vec![1.0], vec![2.0], vec![3.0]]),
            Box::new(ConjugateRootPrior::new(vec![0.0], 1.0).unwrap()),
            TraitLikelihoodConfig::default(),
        )
        .unwrap();
        assert!(matches!(engine.get_log_likelihood(), Err(TraitError::Numeric { .. })));
    }

    #[test]
    fn test_tree_length_normaliser() {
        // total length 5: same as dividing every branch by 5
        let mut normalised = IntegratedTraitLikelihood::new(
            cherry_tree(),
            DiffusionModel::univariate(1.0).unwrap(),
            TraitData::new(vec![vec![0.0], vec![1.0], vec![3.0]]),
            Box::new(ConjugateRootPrior::new(vec![0.0], 1.0).unwrap()),
            TraitLikelihoodConfig {
                scale_by_time: true,
                use_tree_length: true,
                ..Default::default()
            },
        )
        .unwrap();
        normalised.get_log_likelihood().unwrap();

        let mut reference = IntegratedTraitLikelihood::new(
            Tree::from_structure(vec![3, 3, 4, 4, -1], vec![0.2, 0.2, 0.4, 0.2, 0.0], 3).unwrap(),
            DiffusionModel::univariate(1.0).unwrap(),
            TraitData::new(vec![vec![0.0], vec![1.0], vec![3.0]]),
            Box::new(ConjugateRootPrior::new(vec![0.0], 1.0).unwrap()),
            TraitLikelihoodConfig::default(),
        )
        .unwrap();
        reference.get_log_likelihood().unwrap();

        assert!((normalised.sum_log_remainders() - reference.sum_log_remainders()).abs() < 1e-12);
    }

    #[test]
    fn test_drift_corrected_means() {
        let mut engine = engine(vec![vec![0.0], vec![1.0], vec![3.0]], vec![], 1)
            .with_drift_models(vec![Box::new(StrictClock::new(0.5))])
            .unwrap();
        engine.get_log_likelihood().unwrap();

        let corrected = engine.corrected_mean_cache();
        let mean = engine.mean_cache();
        // tips: corrected = value - 0.5 * length
        assert!((corrected[[0, 0, 0]] + 0.5).abs() < 1e-12);
        assert!((corrected[[2, 0, 0]] - 2.0).abs() < 1e-12);
        // node 3 averages corrected children, then subtracts its own shift
        assert!((mean[[3, 0, 0]] - 0.0).abs() < 1e-12);
        assert!((corrected[[3, 0, 0]] + 0.5).abs() < 1e-12);
        // root corrected equals mean
        assert_eq!(corrected[[4, 0, 0]], mean[[4, 0, 0]]);
    }

    #[test]
    fn test_integrate_root_disabled() {
        let mut integrated = engine(vec![vec![0.0], vec![1.0], vec![3.0]], vec![], 1);
        let with_prior = integrated.get_log_likelihood().unwrap();

        let mut conditional = IntegratedTraitLikelihood::new(
            cherry_tree(),
            DiffusionModel::univariate(1.0).unwrap(),
            TraitData::new(vec![vec![0.0], vec![1.0], vec![3.0]]),
            Box::new(ConjugateRootPrior::new(vec![0.0], 1.0).unwrap()),
            TraitLikelihoodConfig {
                integrate_root: false,
                ..Default::default()
            },
        )
        .unwrap();
        let without_prior = conditional.get_log_likelihood().unwrap();
        assert!((with_prior - without_prior).abs() > 1e-6);
        assert_eq!(integrated.sum_log_remainders(), conditional.sum_log_remainders());
    }
}
