use pyo3::exceptions::{PyNotImplementedError, PyValueError};
use pyo3::prelude::*;
use pyo3::wrap_pyfunction;
use numpy::{PyArray1, PyArray3, PyReadonlyArray1, PyReadonlyArray2, PyReadonlyArray3};
use ndarray::Array3;

use crate::batch::{compute_log_likelihoods_parallel, sample_ancestral_states_parallel};
use crate::config::TraitLikelihoodConfig;
use crate::diffusion::DiffusionModel;
use crate::error::TraitError;
use crate::integrated::{ConjugateRootPrior, TraitData};
use crate::tree::Tree;

impl From<TraitError> for PyErr {
    fn from(err: TraitError) -> PyErr {
        match err {
            TraitError::NotImplemented { .. } => PyNotImplementedError::new_err(err.to_string()),
            _ => PyValueError::new_err(err.to_string()),
        }
    }
}

fn build_inputs(
    parent_indices: PyReadonlyArray1<i32>,
    branch_lengths: PyReadonlyArray1<f64>,
    precision: PyReadonlyArray2<f64>,
    root_mean: PyReadonlyArray1<f64>,
    root_sample_size: f64,
    n_tips: usize,
) -> PyResult<(Tree, DiffusionModel, ConjugateRootPrior)> {
    let tree = Tree::from_structure(
        parent_indices.as_array().to_vec(),
        branch_lengths.as_array().to_vec(),
        n_tips,
    )?;
    let diffusion = DiffusionModel::new(precision.as_array().to_owned())?;
    let prior = ConjugateRootPrior::new(root_mean.as_array().to_vec(), root_sample_size)?;
    Ok((tree, diffusion, prior))
}

/// Compute integrated trait log-likelihoods for many datasets in parallel.
///
/// # Arguments
/// * `parent_indices` - Parent index for each node (-1 for root)
/// * `branch_lengths` - Branch length for each node
/// * `tip_traits` - (n_datasets, n_tips, dim) trait values; NaN marks missing, infinities are rejected
/// * `precision` - (dim, dim) diffusion precision matrix
/// * `root_mean` - (dim,) prior mean of the root trait
/// * `root_sample_size` - prior sample size of the root trait
/// * `n_tips` - Number of tip nodes
///
/// # Returns
/// * Vector of log-likelihoods, one per dataset
#[pyfunction]
#[pyo3(signature = (parent_indices, branch_lengths, tip_traits, precision, root_mean, root_sample_size, n_tips))]
fn compute_trait_likelihoods_parallel<'py>(
    py: Python<'py>,
    parent_indices: PyReadonlyArray1<i32>,
    branch_lengths: PyReadonlyArray1<f64>,
    tip_traits: PyReadonlyArray3<f64>,
    precision: PyReadonlyArray2<f64>,
    root_mean: PyReadonlyArray1<f64>,
    root_sample_size: f64,
    n_tips: usize,
) -> PyResult<&'py PyArray1<f64>> {
    let (tree, diffusion, prior) =
        build_inputs(parent_indices, branch_lengths, precision, root_mean, root_sample_size, n_tips)?;

    let traits = tip_traits.as_array();
    let datasets = traits
        .outer_iter()
        .map(TraitData::from_matrix)
        .collect::<Result<Vec<TraitData>, TraitError>>()?;

    let config = TraitLikelihoodConfig::default();
    let log_likelihoods = py.allow_threads(|| {
        compute_log_likelihoods_parallel(&tree, &diffusion, &prior, &datasets, &config)
    })?;

    Ok(PyArray1::from_vec(py, log_likelihoods))
}

/// Draw ancestral trait values from their posterior given the tips.
///
/// # Arguments
/// * `parent_indices` - Parent index for each node (-1 for root)
/// * `branch_lengths` - Branch length for each node
/// * `tip_traits` - (n_tips, dim) trait values; NaN marks a missing tip
/// * `precision` - (dim, dim) diffusion precision matrix
/// * `root_mean` - (dim,) prior mean of the root trait
/// * `root_sample_size` - prior sample size of the root trait
/// * `n_tips` - Number of tip nodes
/// * `n_samples` - Number of independent draws
/// * `seed` - RNG seed; draw `i` uses `seed + i`
///
/// # Returns
/// * (n_samples, n_nodes, dim) array of drawn node traits
#[pyfunction]
#[pyo3(signature = (parent_indices, branch_lengths, tip_traits, precision, root_mean, root_sample_size, n_tips, n_samples, seed=0))]
fn sample_ancestral_traits<'py>(
    py: Python<'py>,
    parent_indices: PyReadonlyArray1<i32>,
    branch_lengths: PyReadonlyArray1<f64>,
    tip_traits: PyReadonlyArray2<f64>,
    precision: PyReadonlyArray2<f64>,
    root_mean: PyReadonlyArray1<f64>,
    root_sample_size: f64,
    n_tips: usize,
    n_samples: usize,
    seed: u64,
) -> PyResult<&'py PyArray3<f64>> {
    let (tree, diffusion, prior) =
        build_inputs(parent_indices, branch_lengths, precision, root_mean, root_sample_size, n_tips)?;
    let data = TraitData::from_matrix(tip_traits.as_array())?;
    let dim = diffusion.dim();
    let n_nodes = tree.n_nodes;

    let config = TraitLikelihoodConfig::default();
    let samples = py.allow_threads(|| {
        sample_ancestral_states_parallel(&tree, &diffusion, &prior, &data, &config, n_samples, seed)
    })?;

    let mut draws = Array3::<f64>::zeros((n_samples, n_nodes, dim));
    for (s, sample) in samples.iter().enumerate() {
        draws.index_axis_mut(ndarray::Axis(0), s).assign(sample);
    }
    Ok(PyArray3::from_owned_array(py, draws))
}

/// Python module definition
#[pymodule]
fn traitpeel(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(compute_trait_likelihoods_parallel, m)?)?;
    m.add_function(wrap_pyfunction!(sample_ancestral_traits, m)?)?;
    Ok(())
}
