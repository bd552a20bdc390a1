//! Root integration strategies.
//!
//! After peeling, the root carries a conditional mean `y` with scalar
//! precision `p` (in units of Σ⁻¹). A [`RootIntegrator`] integrates the
//! unknown root trait against its prior, contributing an extra
//! log-likelihood term, and supplies the marginal root distribution the
//! ancestral sampler starts from.

use ndarray::Array2;

use super::wishart::WishartStatistics;
use crate::error::{Result, TraitError};
use crate::linalg::{
    cholesky_lower, log_det_from_cholesky, quadratic_product, solve_spd, spd_inverse, weighted_average, LOG_SQRT_2_PI,
};

/// Prior on the root trait, integrated out analytically.
pub trait RootIntegrator: Send + Sync {
    /// Trait dimension the prior is defined over.
    fn dim(&self) -> usize;

    /// Log-likelihood contribution of integrating the root against the prior.
    ///
    /// On entry `scaled_precision_mean` holds `p Σ⁻¹ y`; it may be
    /// overwritten. When `wishart` is given, the prior's outer-product
    /// contribution is added to it.
    fn integrate_log_likelihood_at_root(
        &self,
        conditional_root_mean: &[f64],
        scaled_precision_mean: &mut [f64],
        tree_precision: &Array2<f64>,
        conditional_root_precision: f64,
        wishart: Option<&mut WishartStatistics>,
    ) -> Result<f64>;

    /// Log prior density of a root pinned to `root` by a zero-length path
    /// to an observed tip. This replaces the root term and the integration
    /// hook when the conditional root precision is infinite.
    fn log_prior_density_at_root(
        &self,
        root: &[f64],
        tree_precision: &Array2<f64>,
        log_det_tree_precision: f64,
        wishart: Option<&mut WishartStatistics>,
    ) -> Result<f64>;

    /// Replace `root_mean` with the posterior mean of the root trait and
    /// return its posterior variance.
    fn marginal_root_mean_and_variance(
        &self,
        root_mean: &mut [f64],
        tree_precision: &Array2<f64>,
        tree_variance: &Array2<f64>,
        conditional_root_precision: f64,
    ) -> Result<Array2<f64>>;
}

/// Conjugate normal prior `root ~ N(z, Σ / κ)`.
///
/// The prior sample size κ measures the prior in the same units as the
/// tree's conditional root precision, so the posterior is `N(m, Σ/(p+κ))`
/// with `m = (p y + κ z)/(p + κ)`.
#[derive(Clone, Debug)]
pub struct ConjugateRootPrior {
    mean: Vec<f64>,
    sample_size: f64,
}

impl ConjugateRootPrior {
    pub fn new(mean: Vec<f64>, sample_size: f64) -> Result<Self> {
        if mean.is_empty() {
            return Err(TraitError::config("root prior mean must not be empty"));
        }
        if !(sample_size > 0.0) || !sample_size.is_finite() {
            return Err(TraitError::config(format!(
                "root prior sample size must be positive and finite, got {}",
                sample_size
            )));
        }
        Ok(Self { mean, sample_size })
    }

    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    pub fn sample_size(&self) -> f64 {
        self.sample_size
    }
}

impl RootIntegrator for ConjugateRootPrior {
    fn dim(&self) -> usize {
        self.mean.len()
    }

    fn integrate_log_likelihood_at_root(
        &self,
        conditional_root_mean: &[f64],
        scaled_precision_mean: &mut [f64],
        tree_precision: &Array2<f64>,
        conditional_root_precision: f64,
        wishart: Option<&mut WishartStatistics>,
    ) -> Result<f64> {
        let dim = self.mean.len();
        let p = conditional_root_precision;
        let kappa = self.sample_size;
        let total_precision = p + kappa;

        // posterior mean reuses the scratch buffer
        let posterior_mean = scaled_precision_mean;
        weighted_average(conditional_root_mean, p, &self.mean, kappa, posterior_mean);

        let posterior_square = total_precision * quadratic_product(posterior_mean, tree_precision, posterior_mean);
        let prior_square = kappa * quadratic_product(&self.mean, tree_precision, &self.mean);

        if let Some(stats) = wishart {
            stats.add_outer_product(conditional_root_mean, conditional_root_mean, p);
            stats.add_outer_product(&self.mean, &self.mean, kappa);
            stats.add_outer_product(posterior_mean, posterior_mean, -total_precision);
            stats.increment_df(1);
        }

        Ok(0.5 * (dim as f64 * (kappa / total_precision).ln() - prior_square + posterior_square))
    }

    fn log_prior_density_at_root(
        &self,
        root: &[f64],
        tree_precision: &Array2<f64>,
        log_det_tree_precision: f64,
        wishart: Option<&mut WishartStatistics>,
    ) -> Result<f64> {
        let dim = self.mean.len() as f64;
        let kappa = self.sample_size;
        let offset: Vec<f64> = root.iter().zip(&self.mean).map(|(r, z)| r - z).collect();

        if let Some(stats) = wishart {
            stats.add_outer_product(&offset, &offset, kappa);
            stats.increment_df(1);
        }

        Ok(-dim * LOG_SQRT_2_PI
            + 0.5 * (log_det_tree_precision + dim * kappa.ln() - kappa * quadratic_product(&offset, tree_precision, &offset)))
    }

    fn marginal_root_mean_and_variance(
        &self,
        root_mean: &mut [f64],
        _tree_precision: &Array2<f64>,
        tree_variance: &Array2<f64>,
        conditional_root_precision: f64,
    ) -> Result<Array2<f64>> {
        let total_precision = conditional_root_precision + self.sample_size;
        let conditional = root_mean.to_vec();
        weighted_average(&conditional, conditional_root_precision, &self.mean, self.sample_size, root_mean);
        Ok(tree_variance / total_precision)
    }
}

/// Normal prior `root ~ N(z, B⁻¹)` with a precision `B` independent of Σ.
#[derive(Clone, Debug)]
pub struct SemiConjugateRootPrior {
    mean: Vec<f64>,
    precision: Array2<f64>,
    log_det_precision: f64,
}

impl SemiConjugateRootPrior {
    pub fn new(mean: Vec<f64>, precision: Array2<f64>) -> Result<Self> {
        if precision.nrows() != mean.len() || precision.ncols() != mean.len() {
            return Err(TraitError::config(format!(
                "root prior precision must be {}x{}",
                mean.len(),
                mean.len()
            )));
        }
        let lower = cholesky_lower(&precision)
            .ok_or_else(|| TraitError::config("root prior precision must be positive-definite"))?;
        Ok(Self {
            log_det_precision: log_det_from_cholesky(&lower),
            mean,
            precision,
        })
    }

    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    pub fn precision(&self) -> &Array2<f64> {
        &self.precision
    }

    /// Posterior precision `p Σ⁻¹ + B`.
    fn posterior_precision(&self, tree_precision: &Array2<f64>, p: f64) -> Array2<f64> {
        tree_precision * p + &self.precision
    }

    /// `B z`
    fn prior_shift(&self) -> Vec<f64> {
        self.precision.dot(&ndarray::ArrayView1::from(&self.mean[..])).to_vec()
    }
}

impl RootIntegrator for SemiConjugateRootPrior {
    fn dim(&self) -> usize {
        self.mean.len()
    }

    fn integrate_log_likelihood_at_root(
        &self,
        _conditional_root_mean: &[f64],
        scaled_precision_mean: &mut [f64],
        tree_precision: &Array2<f64>,
        conditional_root_precision: f64,
        _wishart: Option<&mut WishartStatistics>,
    ) -> Result<f64> {
        let posterior_precision = self.posterior_precision(tree_precision, conditional_root_precision);
        let lower = cholesky_lower(&posterior_precision)
            .ok_or_else(|| TraitError::numeric("posterior root precision is not positive-definite"))?;

        for (c, b) in scaled_precision_mean.iter_mut().zip(self.prior_shift()) {
            *c += b;
        }
        let solved = solve_spd(&posterior_precision, scaled_precision_mean)?;
        let c_square: f64 = scaled_precision_mean.iter().zip(&solved).map(|(c, x)| c * x).sum();
        let prior_square = quadratic_product(&self.mean, &self.precision, &self.mean);

        Ok(0.5 * (self.log_det_precision - log_det_from_cholesky(&lower) + c_square - prior_square))
    }

    fn log_prior_density_at_root(
        &self,
        root: &[f64],
        _tree_precision: &Array2<f64>,
        _log_det_tree_precision: f64,
        _wishart: Option<&mut WishartStatistics>,
    ) -> Result<f64> {
        let offset: Vec<f64> = root.iter().zip(&self.mean).map(|(r, z)| r - z).collect();
        Ok(-(self.mean.len() as f64) * LOG_SQRT_2_PI
            + 0.5 * (self.log_det_precision - quadratic_product(&offset, &self.precision, &offset)))
    }

    fn marginal_root_mean_and_variance(
        &self,
        root_mean: &mut [f64],
        tree_precision: &Array2<f64>,
        _tree_variance: &Array2<f64>,
        conditional_root_precision: f64,
    ) -> Result<Array2<f64>> {
        let posterior_precision = self.posterior_precision(tree_precision, conditional_root_precision);
        let data_shift = tree_precision.dot(&ndarray::ArrayView1::from(&root_mean[..])) * conditional_root_precision;
        let rhs: Vec<f64> = data_shift.iter().zip(self.prior_shift()).map(|(a, b)| a + b).collect();

        let posterior_mean = solve_spd(&posterior_precision, &rhs)?;
        root_mean.copy_from_slice(&posterior_mean);
        spd_inverse(&posterior_precision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::scaled_product_and_square;
    use ndarray::array;

    fn log_normal(x: f64, mean: f64, variance: f64) -> f64 {
        -LOG_SQRT_2_PI - 0.5 * variance.ln() - 0.5 * (x - mean) * (x - mean) / variance
    }

    /// Root term plus integration, as the likelihood assembles it.
    fn root_contribution(prior: &dyn RootIntegrator, y: &[f64], precision: &Array2<f64>, p: f64) -> f64 {
        let dim = y.len() as f64;
        let log_det = log_det_from_cholesky(&cholesky_lower(precision).unwrap());
        let mut ay = vec![0.0; y.len()];
        let y_ay = scaled_product_and_square(y, &mut ay, precision, p);
        let root_term = -dim * LOG_SQRT_2_PI + 0.5 * (log_det + dim * p.ln() - y_ay);
        root_term + prior.integrate_log_likelihood_at_root(y, &mut ay, precision, p, None).unwrap()
    }

    #[test]
    fn test_conjugate_matches_marginal_density() {
        // y | root ~ N(root, σ²/p), root ~ N(z, σ²/κ)  =>  y ~ N(z, σ²(1/p + 1/κ))
        let sigma2 = 2.0;
        let precision = array![[1.0 / sigma2]];
        let (y, p, z, kappa) = (3.0, 0.75, 1.0, 0.5);
        let prior = ConjugateRootPrior::new(vec![z], kappa).unwrap();

        let value = root_contribution(&prior, &[y], &precision, p);
        let expected = log_normal(y, z, sigma2 * (1.0 / p + 1.0 / kappa));
        assert!((value - expected).abs() < 1e-12);
    }

    #[test]
    fn test_semi_conjugate_matches_marginal_density() {
        // root ~ N(z, 1/b) independent of σ²
        let sigma2 = 2.0;
        let precision = array![[1.0 / sigma2]];
        let (y, p, z, b) = (3.0, 0.75, 1.0, 4.0);
        let prior = SemiConjugateRootPrior::new(vec![z], array![[b]]).unwrap();

        let value = root_contribution(&prior, &[y], &precision, p);
        let expected = log_normal(y, z, sigma2 / p + 1.0 / b);
        assert!((value - expected).abs() < 1e-12);
    }

    #[test]
    fn test_priors_agree_when_b_is_scaled_precision() {
        let precision = array![[2.0, 0.5], [0.5, 1.0]];
        let kappa = 0.3;
        let z = vec![0.5, -1.0];
        let y = [1.0, 2.0];
        let p = 1.7;

        let conjugate = ConjugateRootPrior::new(z.clone(), kappa).unwrap();
        let semi = SemiConjugateRootPrior::new(z, &precision * kappa).unwrap();

        let a = root_contribution(&conjugate, &y, &precision, p);
        let b = root_contribution(&semi, &y, &precision, p);
        assert!((a - b).abs() < 1e-10);

        let variance = spd_inverse(&precision).unwrap();
        let mut mean_a = y.to_vec();
        let mut mean_b = y.to_vec();
        let var_a = conjugate
            .marginal_root_mean_and_variance(&mut mean_a, &precision, &variance, p)
            .unwrap();
        let var_b = semi
            .marginal_root_mean_and_variance(&mut mean_b, &precision, &variance, p)
            .unwrap();
        for i in 0..2 {
            assert!((mean_a[i] - mean_b[i]).abs() < 1e-10);
            for j in 0..2 {
                assert!((var_a[[i, j]] - var_b[[i, j]]).abs() < 1e-10);
            }
        }
    }

    #[test]
    fn test_conjugate_marginal_root() {
        let precision = array![[1.0]];
        let variance = array![[1.0]];
        let prior = ConjugateRootPrior::new(vec![0.0], 1.0).unwrap();
        let mut root = vec![3.0];
        let var = prior
            .marginal_root_mean_and_variance(&mut root, &precision, &variance, 4.0 / 3.0)
            .unwrap();
        // (4/3 * 3) / (7/3) = 12/7
        assert!((root[0] - 12.0 / 7.0).abs() < 1e-12);
        assert!((var[[0, 0]] - 3.0 / 7.0).abs() < 1e-12);
    }

    #[test]
    fn test_conjugate_wishart_contribution() {
        let precision = array![[1.0]];
        let prior = ConjugateRootPrior::new(vec![0.0], 1.0).unwrap();
        let mut stats = WishartStatistics::new(1);
        let p = 4.0 / 3.0;
        let y = [3.0];
        let mut ay = [p * 3.0];
        prior
            .integrate_log_likelihood_at_root(&y, &mut ay, &precision, p, Some(&mut stats))
            .unwrap();
        // p κ / (p + κ) (y - z)² = (4/3)/(7/3) * 9 = 36/7
        assert!((stats.scale_matrix()[[0, 0]] - 36.0 / 7.0).abs() < 1e-12);
        assert_eq!(stats.df(), 1);
    }

    #[test]
    fn test_pinned_root_prior_density() {
        let sigma2: f64 = 2.0;
        let precision = array![[1.0 / sigma2]];
        let log_det = -sigma2.ln();
        let (root, z, kappa, b) = (3.0, 1.0, 0.5, 4.0);

        let conjugate = ConjugateRootPrior::new(vec![z], kappa).unwrap();
        let mut stats = WishartStatistics::new(1);
        let value = conjugate
            .log_prior_density_at_root(&[root], &precision, log_det, Some(&mut stats))
            .unwrap();
        assert!((value - log_normal(root, z, sigma2 / kappa)).abs() < 1e-12);
        // κ (root - z)²
        assert!((stats.scale_matrix()[[0, 0]] - 2.0).abs() < 1e-12);
        assert_eq!(stats.df(), 1);

        let semi = SemiConjugateRootPrior::new(vec![z], array![[b]]).unwrap();
        let value = semi.log_prior_density_at_root(&[root], &precision, log_det, None).unwrap();
        assert!((value - log_normal(root, z, 1.0 / b)).abs() < 1e-12);
    }

    #[test]
    fn test_rejects_bad_priors() {
        assert!(ConjugateRootPrior::new(vec![0.0], 0.0).is_err());
        assert!(ConjugateRootPrior::new(vec![], 1.0).is_err());
        assert!(SemiConjugateRootPrior::new(vec![0.0, 0.0], array![[1.0]]).is_err());
        assert!(SemiConjugateRootPrior::new(vec![0.0], array![[-1.0]]).is_err());
    }
}
