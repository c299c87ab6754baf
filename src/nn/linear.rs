//! Fully connected (linear) layer.
//!
//! Implements the transformation y = xW^T + b, used by the
//! classification head.

use crate::error::{ReplegarError, Result};
use crate::nn::init::{kaiming_uniform, zeros};
use crate::nn::module::Module;
use crate::tensor::Tensor;

/// Fully connected layer: y = xW^T + b
///
/// # Shape
///
/// - Input: `(N, in_features)`
/// - Output: `(N, out_features)`
pub struct Linear {
    /// Weight matrix, shape: [`out_features`, `in_features`]
    weight: Tensor,
    /// Bias vector, shape: [`out_features`]
    bias: Tensor,
    /// Number of input features
    in_features: usize,
    /// Number of output features
    out_features: usize,
}

impl Linear {
    /// Create a new Linear layer with Kaiming initialization.
    #[must_use]
    pub fn new(in_features: usize, out_features: usize) -> Self {
        Self::with_seed(in_features, out_features, None)
    }

    /// Create a Linear layer with a specific random seed.
    #[must_use]
    pub fn with_seed(in_features: usize, out_features: usize, seed: Option<u64>) -> Self {
        let weight = kaiming_uniform(&[out_features, in_features], in_features, seed);
        let bias = zeros(&[out_features]);

        Self {
            weight,
            bias,
            in_features,
            out_features,
        }
    }

    /// Get input feature count.
    #[must_use]
    pub fn in_features(&self) -> usize {
        self.in_features
    }

    /// Get output feature count.
    #[must_use]
    pub fn out_features(&self) -> usize {
        self.out_features
    }

    /// Get the weight matrix.
    #[must_use]
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Get the bias vector.
    #[must_use]
    pub fn bias(&self) -> &Tensor {
        &self.bias
    }

    /// Overwrite weight and bias, e.g. from externally trained parameters.
    ///
    /// # Errors
    ///
    /// Returns [`ReplegarError::TopologyMismatch`] if the shapes differ
    /// from the layer's own.
    pub fn assign(&mut self, weight: &Tensor, bias: &Tensor) -> Result<()> {
        if weight.shape() != self.weight.shape() || bias.shape() != self.bias.shape() {
            return Err(ReplegarError::topology_mismatch(
                format!("weight {:?}, bias {:?}", self.weight.shape(), self.bias.shape()),
                format!("weight {:?}, bias {:?}", weight.shape(), bias.shape()),
            ));
        }
        self.weight = weight.clone();
        self.bias = bias.clone();
        Ok(())
    }
}

impl Module for Linear {
    fn forward(&self, input: &Tensor) -> Tensor {
        assert_eq!(
            input.ndim(),
            2,
            "Linear expects 2D input [N, features], got {}D",
            input.ndim()
        );
        let shape = input.shape();
        let (batch_size, features) = (shape[0], shape[1]);
        assert_eq!(
            features, self.in_features,
            "Expected {} input features, got {}",
            self.in_features, features
        );

        let input_data = input.data();
        let weight_data = self.weight.data();
        let bias_data = self.bias.data();

        let mut output = vec![0.0; batch_size * self.out_features];
        for n in 0..batch_size {
            for o in 0..self.out_features {
                let mut sum = bias_data[o];
                for i in 0..self.in_features {
                    sum += input_data[n * self.in_features + i]
                        * weight_data[o * self.in_features + i];
                }
                output[n * self.out_features + o] = sum;
            }
        }

        Tensor::new(&output, &[batch_size, self.out_features])
    }

    fn parameters(&self) -> Vec<&Tensor> {
        vec![&self.weight, &self.bias]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        vec![&mut self.weight, &mut self.bias]
    }
}

impl std::fmt::Debug for Linear {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Linear")
            .field("in_features", &self.in_features)
            .field("out_features", &self.out_features)
            .finish_non_exhaustive()
    }
}
