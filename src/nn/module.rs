//! The `Module` trait shared by all layers.

use crate::tensor::Tensor;

/// Common interface for neural network layers.
///
/// A module transforms an input tensor into an output tensor and
/// exposes its learnable parameters for inspection or weight loading.
pub trait Module {
    /// Compute the forward pass.
    fn forward(&self, input: &Tensor) -> Tensor;

    /// Get references to all learnable parameters.
    fn parameters(&self) -> Vec<&Tensor> {
        Vec::new()
    }

    /// Get mutable references to all learnable parameters.
    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        Vec::new()
    }
}
