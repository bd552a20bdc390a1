//! Small dense linear-algebra helpers for trait-dimension matrices.
//!
//! Trait dimensions are small (a handful of correlated traits). Callers
//! work with `ndarray` matrices; factorisations go through `nalgebra`.

use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use ndarray::Array2;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::{Result, TraitError};

/// log(sqrt(2π)), the per-dimension normalising constant of a Gaussian.
pub const LOG_SQRT_2_PI: f64 = 0.918_938_533_204_672_7;

/// Compute xᵀ A y.
pub fn quadratic_product(x: &[f64], a: &Array2<f64>, y: &[f64]) -> f64 {
    let mut sum = 0.0;
    for (i, &xi) in x.iter().enumerate() {
        for (j, &yj) in y.iter().enumerate() {
            sum += xi * a[[i, j]] * yj;
        }
    }
    sum
}

/// Fill `ay` with `scale · A y` and return yᵀ (scale · A) y.
pub fn scaled_product_and_square(y: &[f64], ay: &mut [f64], a: &Array2<f64>, scale: f64) -> f64 {
    let mut y_ay = 0.0;
    for i in 0..y.len() {
        ay[i] = 0.0;
        for (j, &yj) in y.iter().enumerate() {
            ay[i] += a[[i, j]] * yj * scale;
        }
        y_ay += y[i] * ay[i];
    }
    y_ay
}

/// Precision-weighted average of two vectors written into `out`.
///
/// Callers guarantee `weight0 + weight1 != 0`.
pub fn weighted_average(in0: &[f64], weight0: f64, in1: &[f64], weight1: f64, out: &mut [f64]) {
    let total_inverse_weight = 1.0 / (weight0 + weight1);
    for ((o, &a), &b) in out.iter_mut().zip(in0.iter()).zip(in1.iter()) {
        *o = (a * weight0 + b * weight1) * total_inverse_weight;
    }
}

fn to_dmatrix(matrix: &Array2<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(matrix.nrows(), matrix.ncols(), |i, j| matrix[[i, j]])
}

fn to_array(matrix: &DMatrix<f64>) -> Array2<f64> {
    Array2::from_shape_fn((matrix.nrows(), matrix.ncols()), |(i, j)| matrix[(i, j)])
}

/// Cholesky decomposition, or None if the matrix is not square or not
/// positive-definite.
fn factorise(matrix: &Array2<f64>) -> Option<Cholesky<f64, Dyn>> {
    if matrix.nrows() != matrix.ncols() {
        return None;
    }
    Cholesky::new(to_dmatrix(matrix))
}

/// Lower-triangular Cholesky factor L with A = L Lᵀ.
///
/// Returns None if the matrix is not square or not positive-definite.
pub fn cholesky_lower(matrix: &Array2<f64>) -> Option<Array2<f64>> {
    factorise(matrix).map(|cholesky| to_array(&cholesky.l()))
}

/// log|A| from its Cholesky factor.
pub fn log_det_from_cholesky(lower: &Array2<f64>) -> f64 {
    2.0 * lower.diag().iter().map(|d| d.ln()).sum::<f64>()
}

/// Solve A x = b for symmetric positive-definite A.
pub fn solve_spd(a: &Array2<f64>, b: &[f64]) -> Result<Vec<f64>> {
    let cholesky = factorise(a).ok_or_else(|| TraitError::numeric("matrix is not positive-definite"))?;
    let x = cholesky.solve(&DVector::from_column_slice(b));
    Ok(x.iter().copied().collect())
}

/// Inverse of a symmetric positive-definite matrix.
pub fn spd_inverse(a: &Array2<f64>) -> Result<Array2<f64>> {
    let cholesky = factorise(a).ok_or_else(|| TraitError::numeric("matrix is not positive-definite"))?;
    Ok(to_array(&cholesky.inverse()))
}

/// Draw from N(mean, variance).
///
/// # Errors
/// Returns a numeric error if `variance` is not positive-definite.
pub fn draw_multivariate_normal<R: Rng + ?Sized>(
    rng: &mut R,
    mean: &[f64],
    variance: &Array2<f64>,
) -> Result<Vec<f64>> {
    let lower = cholesky_lower(variance).ok_or_else(|| {
        TraitError::numeric("variance matrix for multivariate normal draw is not positive-definite")
    })?;
    let z: Vec<f64> = (0..mean.len()).map(|_| rng.sample(StandardNormal)).collect();

    let mut draw = mean.to_vec();
    for (i, value) in draw.iter_mut().enumerate() {
        for k in 0..=i {
            *value += lower[[i, k]] * z[k];
        }
    }
    Ok(draw)
}
