//! Pre-order ancestral state sampler.
//!
//! Draws node traits from their joint posterior given the tips, parents
//! before children, using the conditional means and precisions left by the
//! last peeling pass.

use ndarray::Array2;
use tracing::trace;

use super::likelihood::IntegratedTraitLikelihood;
use super::missing::MissingStatus;
use crate::error::{Result, TraitError};
use crate::linalg::draw_multivariate_normal;
use crate::tree::TreeView;

impl<T: TreeView> IntegratedTraitLikelihood<T> {
    /// Fill the drawn-state cache. Requires fresh peeled caches.
    pub(super) fn pre_order_traverse_sample(&mut self) -> Result<()> {
        let precision = self.diffusion.precision_matrix().clone();
        let variance = self.diffusion.variance_matrix().clone();
        let root = self.tree.root();

        let order = if self.config.peel_descendants {
            self.tree.pre_order()
        } else {
            vec![root]
        };

        for node in order {
            if node == root {
                self.draw_root(root, &precision, &variance)?;
                continue;
            }
            match self.missing.status(node) {
                MissingStatus::Observed => {
                    for k in 0..self.num_data {
                        for i in 0..self.dim_trait {
                            self.drawn_states.live_mut()[[node, k, i]] = self.cache.mean()[[node, k, i]];
                        }
                    }
                }
                MissingStatus::Partial => {
                    return Err(TraitError::not_implemented(format!(
                        "sampling partially missing traits (node {})",
                        node
                    )));
                }
                MissingStatus::Complete => self.draw_given_parent(node, &variance)?,
            }
        }

        trace!(states = ?self.drawn_states.live(), "drew ancestral states");
        Ok(())
    }

    fn draw_root(&mut self, root: usize, precision: &Array2<f64>, variance: &Array2<f64>) -> Result<()> {
        let root_precision = self.lower_precision.live()[root];
        for k in 0..self.num_data {
            let mut root_mean = self.cache.datum(root, k);
            if root_precision.is_infinite() {
                for (i, value) in root_mean.into_iter().enumerate() {
                    self.drawn_states.live_mut()[[root, k, i]] = value;
                }
                continue;
            }
            let root_variance = self.root_integrator.marginal_root_mean_and_variance(
                &mut root_mean,
                precision,
                variance,
                root_precision,
            )?;
            let draw = draw_multivariate_normal(&mut self.rng, &root_mean, &root_variance)?;
            for (i, value) in draw.into_iter().enumerate() {
                self.drawn_states.live_mut()[[root, k, i]] = value;
            }
        }
        Ok(())
    }

    /// Draw `node` from N((parent p_b + mean p_n) / (p_b + p_n), Σ / (p_b + p_n))
    /// where `p_b` is the branch precision and `p_n` the subtree precision.
    /// An infinite `p_n` pins the node to its subtree mean.
    fn draw_given_parent(&mut self, node: usize, variance: &Array2<f64>) -> Result<()> {
        let n_nodes = self.tree.node_count();
        let parent = self
            .tree
            .parent(node)
            .ok_or_else(|| TraitError::invalid_index(node, n_nodes))?;
        let branch_precision = 1.0 / self.rescaled_branch_length(node);
        let node_precision = self.lower_precision.live()[node];
        let total_precision = branch_precision + node_precision;
        let shift = self.shift_for_branch(node);

        for k in 0..self.num_data {
            let parent_informed: Vec<f64> = (0..self.dim_trait)
                .map(|i| {
                    let drift = shift.as_ref().map_or(0.0, |s| s[i]);
                    self.drawn_states.live()[[parent, k, i]] + drift
                })
                .collect();

            let draw = if node_precision.is_infinite() {
                (0..self.dim_trait).map(|i| self.cache.mean()[[node, k, i]]).collect()
            } else if branch_precision.is_infinite() {
                parent_informed
            } else {
                let mean: Vec<f64> = if node_precision == 0.0 {
                    parent_informed
                } else {
                    parent_informed
                        .iter()
                        .enumerate()
                        .map(|(i, &p)| {
                            (p * branch_precision + self.cache.mean()[[node, k, i]] * node_precision) / total_precision
                        })
                        .collect()
                };
                draw_multivariate_normal(&mut self.rng, &mean, &(variance / total_precision))?
            };

            for (i, value) in draw.into_iter().enumerate() {
                self.drawn_states.live_mut()[[node, k, i]] = value;
            }
        }
        Ok(())
    }
}
