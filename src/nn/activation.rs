//! Activation functions.
//!
//! Activations are modeled as a value enum rather than layer structs:
//! every reparameterizable unit carries its activation kind as part of
//! its static topology, and the kind must survive the training-to-
//! inference rewrite unchanged.
//!
//! # References
//!
//! - Nair, V., & Hinton, G. E. (2010). Rectified linear units improve restricted
//!   Boltzmann machines. ICML.

use crate::tensor::Tensor;

/// Activation applied after a unit's linear part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// ReLU(x) = max(0, x)
    ReLU,
    /// Pass-through (no nonlinearity).
    Identity,
}

impl Activation {
    /// Apply the activation elementwise.
    #[must_use]
    pub fn apply(&self, input: &Tensor) -> Tensor {
        match self {
            Activation::ReLU => input.relu(),
            Activation::Identity => input.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relu_clamps_negatives() {
        let x = Tensor::from_slice(&[-2.0, -0.1, 0.0, 3.0]);
        let y = Activation::ReLU.apply(&x);
        assert_eq!(y.data(), &[0.0, 0.0, 0.0, 3.0]);
    }

    #[test]
    fn test_identity_is_noop() {
        let x = Tensor::from_slice(&[-2.0, 3.0]);
        let y = Activation::Identity.apply(&x);
        assert_eq!(y.data(), x.data());
    }
}
