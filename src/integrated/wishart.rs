//! Wishart sufficient statistics collected during peeling.
//!
//! The scale matrix accumulates the weighted outer products whose trace
//! against Σ⁻¹ reproduces the quadratic terms of the likelihood, so an
//! external Gibbs step can draw Σ⁻¹ from its conjugate Wishart posterior.

use ndarray::Array2;

/// Outer-product scale matrix plus degrees of freedom.
#[derive(Clone, Debug, PartialEq)]
pub struct WishartStatistics {
    scale_matrix: Array2<f64>,
    df: usize,
}

impl WishartStatistics {
    pub fn new(dim: usize) -> Self {
        Self {
            scale_matrix: Array2::zeros((dim, dim)),
            df: 0,
        }
    }

    pub fn scale_matrix(&self) -> &Array2<f64> {
        &self.scale_matrix
    }

    pub fn df(&self) -> usize {
        self.df
    }

    pub fn increment_df(&mut self, by: usize) {
        self.df += by;
    }

    /// Add `weight · a bᵀ` to the scale matrix.
    pub fn add_outer_product(&mut self, a: &[f64], b: &[f64], weight: f64) {
        for (i, &ai) in a.iter().enumerate() {
            for (j, &bj) in b.iter().enumerate() {
                self.scale_matrix[[i, j]] += weight * ai * bj;
            }
        }
    }

    /// Outer products of one merge of two child means into their parent:
    /// `p0 c0 c0ᵀ + p1 c1 c1ᵀ - (p0 c0 + p1 c1) parentᵀ`.
    pub fn add_merge(&mut self, child0: &[f64], precision0: f64, child1: &[f64], precision1: f64, parent: &[f64]) {
        for i in 0..child0.len() {
            let w_child0 = child0[i] * precision0;
            let w_child1 = child1[i] * precision1;
            for j in 0..child0.len() {
                self.scale_matrix[[i, j]] +=
                    w_child0 * child0[j] + w_child1 * child1[j] - (w_child0 + w_child1) * parent[j];
            }
        }
    }

    pub fn clear(&mut self) {
        self.scale_matrix.fill(0.0);
        self.df = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_matches_squared_difference() {
        // p0 x² + p1 y² - (p0 x + p1 y) m = p0 p1 / (p0 + p1) (x - y)²
        let (x, y, p0, p1) = (1.0, 4.0, 2.0, 1.0);
        let m = (p0 * x + p1 * y) / (p0 + p1);
        let mut stats = WishartStatistics::new(1);
        stats.add_merge(&[x], p0, &[y], p1, &[m]);

        let expected = p0 * p1 / (p0 + p1) * (x - y) * (x - y);
        assert!((stats.scale_matrix()[[0, 0]] - expected).abs() < 1e-12);
    }

    #[test]
    fn test_outer_product_and_clear() {
        let mut stats = WishartStatistics::new(2);
        stats.add_outer_product(&[1.0, 2.0], &[3.0, 4.0], 0.5);
        stats.increment_df(2);
        assert_eq!(stats.scale_matrix()[[1, 0]], 3.0);
        assert_eq!(stats.scale_matrix()[[0, 1]], 2.0);
        assert_eq!(stats.df(), 2);

        stats.clear();
        assert_eq!(stats.df(), 0);
        assert!(stats.scale_matrix().iter().all(|&v| v == 0.0));
    }
}
