//! Replegar: reparameterizable convolutional backbones in pure Rust.
//!
//! The crate builds image backbones that exist in two interchangeable
//! forms. During training a unit is a set of parallel convolution
//! branches plus an optional identity path, each followed by frozen
//! normalization statistics. For inference the branches are folded
//! into one equivalent convolution, so the deployed model pays for a
//! single kernel per unit while keeping the exact function the wide
//! form learned.
//!
//! # Quick Start
//!
//! ```
//! use replegar::prelude::*;
//!
//! let spec = VariantSpec {
//!     num_blocks: vec![1, 1],
//!     num_channels: vec![8, 16],
//!     stem_channels: 8,
//!     branch_size: 2,
//! };
//! let config = AssembleConfig {
//!     classes: 10,
//!     seed: Some(42),
//!     ..AssembleConfig::default()
//! };
//!
//! let trained = assemble(&spec, Mode::Training, &config).unwrap();
//! let deployed = trained.get_reparameterized_model().unwrap();
//!
//! let x = Tensor::ones(&[1, 3, 32, 32]);
//! let logits = deployed.forward(&x);
//! assert_eq!(logits.shape(), &[1, 10]);
//! ```
//!
//! # Modules
//!
//! - [`tensor`]: Dense `[N, C, H, W]` float tensors
//! - [`nn`]: Convolution, pooling, linear, activation, initialization
//! - [`reparam`]: Branch sets, the fusion engine, and units
//! - [`model`]: Assembly, variants, feature extraction, weight transfer
//! - [`error`]: The crate-wide error type
//!
//! # References
//!
//! - Vasu et al. (2022): "MobileOne: An Improved One millisecond
//!   Mobile Backbone"
//! - Ding et al. (2021): "RepVGG: Making VGG-style ConvNets Great
//!   Again"

pub mod error;
pub mod model;
pub mod nn;
pub mod reparam;
pub mod tensor;

/// Commonly used types, importable in one line.
pub mod prelude {
    pub use crate::error::{ReplegarError, Result};
    pub use crate::model::{
        assemble, pretrained, transfer, variant, AssembleConfig, Mode, Model, VariantSpec,
        WeightsDescriptor, VARIANT_NAMES,
    };
    pub use crate::nn::{Activation, Module};
    pub use crate::reparam::{fuse, AffineOperator, BranchSet, NormStats, Unit, UnitTopology};
    pub use crate::tensor::Tensor;
}
