//! Error types for the trait likelihood engine.

use thiserror::Error;

/// Errors raised while building or querying a trait likelihood.
///
/// Degenerate numerics (zero precision, zero-length branches) are handled
/// in-line and never surface here.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TraitError {
    /// Malformed inputs: short tip vectors, non-binary trees, bad matrices.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Index outside the valid range for tips, nodes or flattened trait data.
    #[error("Index {index} out of range (limit {limit})")]
    InvalidIndex { index: usize, limit: usize },

    /// Feature reached that the engine deliberately does not support.
    #[error("Not implemented: {feature}")]
    NotImplemented { feature: String },

    /// Matrix factorisation failures during sampling or root marginalisation.
    #[error("Numeric error: {message}")]
    Numeric { message: String },
}

/// Type alias for Results using TraitError
pub type Result<T> = std::result::Result<T, TraitError>;

impl TraitError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn invalid_index(index: usize, limit: usize) -> Self {
        Self::InvalidIndex { index, limit }
    }

    /// Create an unsupported-feature error
    pub fn not_implemented(feature: impl Into<String>) -> Self {
        Self::NotImplemented {
            feature: feature.into(),
        }
    }

    /// Create a numeric error
    pub fn numeric(message: impl Into<String>) -> Self {
        Self::Numeric {
            message: message.into(),
        }
    }
}
