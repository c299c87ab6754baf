//! Error types for Replegar operations.
//!
//! Provides rich error context for library consumers.

use std::fmt;

/// Main error type for Replegar operations.
///
/// Every failure mode is detected eagerly, at construction or at the
/// start of a weight transfer. A model that would violate a structural
/// invariant is never built.
///
/// # Examples
///
/// ```
/// use replegar::error::ReplegarError;
///
/// let err = ReplegarError::InvalidTopology {
///     message: "branch set has no branches".to_string(),
/// };
/// assert!(err.to_string().contains("invalid topology"));
/// ```
#[derive(Debug)]
pub enum ReplegarError {
    /// Malformed branch, skip, or stage configuration.
    InvalidTopology {
        /// Description of the violated constraint
        message: String,
    },

    /// Source and target unit sequences disagree during weight transfer.
    TopologyMismatch {
        /// Expected topology description
        expected: String,
        /// Actual topology found
        actual: String,
    },

    /// Reparameterization requested on a unit that is already fused.
    AlreadyFused {
        /// Name of the offending unit
        unit: String,
    },

    /// Pretrained weights requested together with an inference-mode model.
    IncompatibleRequest {
        /// Description of the conflicting request
        message: String,
    },

    /// A feature key was selected that the model does not expose.
    UnknownFeatureKey {
        /// The unrecognized key
        key: String,
    },
}

impl fmt::Display for ReplegarError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplegarError::InvalidTopology { message } => {
                write!(f, "invalid topology: {message}")
            }
            ReplegarError::TopologyMismatch { expected, actual } => {
                write!(f, "topology mismatch: expected {expected}, got {actual}")
            }
            ReplegarError::AlreadyFused { unit } => {
                write!(f, "unit '{unit}' is already reparameterized")
            }
            ReplegarError::IncompatibleRequest { message } => {
                write!(f, "incompatible request: {message}")
            }
            ReplegarError::UnknownFeatureKey { key } => {
                write!(f, "unknown feature key: '{key}'")
            }
        }
    }
}

impl std::error::Error for ReplegarError {}

impl ReplegarError {
    /// Create an [`ReplegarError::InvalidTopology`] from a message.
    #[must_use]
    pub fn invalid_topology(message: impl Into<String>) -> Self {
        Self::InvalidTopology {
            message: message.into(),
        }
    }

    /// Create a [`ReplegarError::TopologyMismatch`] from descriptions of both sides.
    #[must_use]
    pub fn topology_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::TopologyMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }
}

/// Convenience type alias for Results.
pub type Result<T> = std::result::Result<T, ReplegarError>;
