//! Multivariate Brownian diffusion and branch-rate models.
//!
//! The diffusion model carries the trait precision matrix Σ⁻¹ shared by all
//! branches. Branch-rate models rescale branch lengths into precision units
//! and, one per trait dimension, act as drift rates.

use ndarray::Array2;

use crate::error::{Result, TraitError};
use crate::linalg::{cholesky_lower, log_det_from_cholesky, spd_inverse};

/// Multivariate Brownian diffusion with precision matrix Σ⁻¹.
#[derive(Clone, Debug)]
pub struct DiffusionModel {
    precision: Array2<f64>,
    variance: Array2<f64>,
    log_det_precision: f64,
}

impl DiffusionModel {
    /// Create a diffusion model from its precision matrix.
    ///
    /// # Errors
    /// Returns a configuration error unless the matrix is square, symmetric
    /// and positive-definite.
    pub fn new(precision: Array2<f64>) -> Result<Self> {
        let (variance, log_det_precision) = Self::validate(&precision)?;
        Ok(Self {
            precision,
            variance,
            log_det_precision,
        })
    }

    /// Create a diffusion model from its variance matrix Σ.
    pub fn from_variance(variance: Array2<f64>) -> Result<Self> {
        let precision = spd_inverse(&variance)
            .map_err(|_| TraitError::config("diffusion variance must be positive-definite"))?;
        Self::new(precision)
    }

    /// One-dimensional diffusion with variance σ².
    pub fn univariate(variance: f64) -> Result<Self> {
        if !(variance > 0.0) {
            return Err(TraitError::config("diffusion variance must be positive"));
        }
        Self::new(Array2::from_elem((1, 1), 1.0 / variance))
    }

    fn validate(precision: &Array2<f64>) -> Result<(Array2<f64>, f64)> {
        let dim = precision.nrows();
        if dim == 0 || precision.ncols() != dim {
            return Err(TraitError::config(format!(
                "precision matrix must be square and non-empty, got {}x{}",
                precision.nrows(),
                precision.ncols()
            )));
        }
        for i in 0..dim {
            for j in 0..i {
                let (a, b) = (precision[[i, j]], precision[[j, i]]);
                if (a - b).abs() > 1e-10 * a.abs().max(b.abs()).max(1.0) {
                    return Err(TraitError::config("precision matrix must be symmetric"));
                }
            }
        }
        let lower = cholesky_lower(precision)
            .ok_or_else(|| TraitError::config("precision matrix must be positive-definite"))?;
        let variance = spd_inverse(precision)?;
        Ok((variance, log_det_from_cholesky(&lower)))
    }

    /// Number of trait dimensions.
    pub fn dim(&self) -> usize {
        self.precision.nrows()
    }

    pub fn precision_matrix(&self) -> &Array2<f64> {
        &self.precision
    }

    /// Σ, cached alongside the precision.
    pub fn variance_matrix(&self) -> &Array2<f64> {
        &self.variance
    }

    pub fn determinant_precision_matrix(&self) -> f64 {
        self.log_det_precision.exp()
    }

    pub fn log_det_precision_matrix(&self) -> f64 {
        self.log_det_precision
    }

    /// Replace the precision matrix, keeping the dimension.
    pub fn set_precision_matrix(&mut self, precision: Array2<f64>) -> Result<()> {
        if precision.nrows() != self.dim() {
            return Err(TraitError::config(format!(
                "precision matrix dimension changed from {} to {}",
                self.dim(),
                precision.nrows()
            )));
        }
        let (variance, log_det_precision) = Self::validate(&precision)?;
        self.precision = precision;
        self.variance = variance;
        self.log_det_precision = log_det_precision;
        Ok(())
    }
}

/// Per-branch rate multiplier.
///
/// Used both to rescale branch lengths and, one model per trait dimension,
/// as the drift rate along each branch.
pub trait BranchRateModel: Send + Sync {
    /// Rate on the branch above `node`.
    fn branch_rate(&self, node: usize) -> f64;
}

/// Same rate on every branch.
#[derive(Clone, Debug)]
pub struct StrictClock {
    pub rate: f64,
}

impl StrictClock {
    pub fn new(rate: f64) -> Self {
        Self { rate }
    }
}

impl Default for StrictClock {
    fn default() -> Self {
        Self { rate: 1.0 }
    }
}

impl BranchRateModel for StrictClock {
    fn branch_rate(&self, _node: usize) -> f64 {
        self.rate
    }
}

/// Explicit rate for every node's branch, indexed by node.
#[derive(Clone, Debug)]
pub struct PerBranchRates {
    rates: Vec<f64>,
}

impl PerBranchRates {
    pub fn new(rates: Vec<f64>) -> Self {
        Self { rates }
    }

    pub fn set_rate(&mut self, node: usize, rate: f64) -> Result<()> {
        let n = self.rates.len();
        let slot = self
            .rates
            .get_mut(node)
            .ok_or_else(|| TraitError::invalid_index(node, n))?;
        *slot = rate;
        Ok(())
    }

    pub fn rates(&self) -> &[f64] {
        &self.rates
    }
}

impl BranchRateModel for PerBranchRates {
    fn branch_rate(&self, node: usize) -> f64 {
        self.rates.get(node).copied().unwrap_or(1.0)
    }
}

/// Drift accumulated along the branch above `node`, one entry per trait
/// dimension: `rate_i(node) * branch_length`.
pub fn drift_shift(drift_models: &[Box<dyn BranchRateModel>], node: usize, branch_length: f64) -> Vec<f64> {
    drift_models
        .iter()
        .map(|model| model.branch_rate(node) * branch_length)
        .collect()
}
