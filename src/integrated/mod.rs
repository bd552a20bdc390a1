//! Integrated multivariate Brownian trait likelihood.
//!
//! This module provides:
//! - MissingTraits: per-node observed/partial/complete classification
//! - MeanCache: double-buffered conditional means, plain or drift-corrected
//! - RootIntegrator: root prior strategies (conjugate and semi-conjugate)
//! - WishartStatistics: conjugate sufficient statistics for Σ⁻¹
//! - IntegratedTraitLikelihood: peeling, ancestral sampling, store/restore

pub mod missing;
pub mod cache;
pub mod root;
pub mod wishart;
pub mod likelihood;
mod peeling;
mod sampler;

pub use missing::{MissingStatus, MissingTraits};
pub use cache::{Checkpointed, MeanCache, MergeShifts};
pub use root::{ConjugateRootPrior, RootIntegrator, SemiConjugateRootPrior};
pub use wishart::WishartStatistics;
pub use likelihood::{IntegratedTraitLikelihood, TraitData};
