//! Integrated likelihood of multivariate Brownian trait data on a tree.
//!
//! Internal node traits are integrated out analytically by a post-order
//! peeling pass; a pre-order pass draws them back from their joint
//! posterior. The engine keeps double-buffered caches so an MCMC driver can
//! store state, evaluate a proposal and roll back cheaply.
//!
//! ```ignore
//! let tree = Tree::from_structure(vec![2, 2, -1], vec![1.0, 1.0, 0.0], 2)?;
//! let mut engine = IntegratedTraitLikelihood::new(
//!     tree,
//!     DiffusionModel::univariate(1.0)?,
//!     TraitData::new(vec![vec![0.5], vec![1.5]]),
//!     Box::new(ConjugateRootPrior::new(vec![0.0], 1.0)?),
//!     TraitLikelihoodConfig::default(),
//! )?;
//! let log_likelihood = engine.get_log_likelihood()?;
//! ```

pub mod batch;
pub mod config;
pub mod diffusion;
pub mod error;
pub mod integrated;
pub mod linalg;
pub mod tree;

#[cfg(feature = "python")]
mod python;

pub use batch::{compute_log_likelihoods_parallel, sample_ancestral_states_parallel};
pub use config::TraitLikelihoodConfig;
pub use diffusion::{BranchRateModel, DiffusionModel, PerBranchRates, StrictClock};
pub use error::{Result, TraitError};
pub use integrated::{
    ConjugateRootPrior, IntegratedTraitLikelihood, MissingStatus, MissingTraits, RootIntegrator,
    SemiConjugateRootPrior, TraitData, WishartStatistics,
};
pub use tree::{Tree, TreeView};
