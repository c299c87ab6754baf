//! Execution-engine building blocks.
//!
//! This module holds the plain layers the backbone is built from:
//! the grouped convolution primitive, pooling, the linear classifier,
//! activations, and weight initialization. The reparameterization
//! machinery itself lives in [`crate::reparam`].

mod activation;
mod conv;
pub mod init;
mod linear;
mod module;

pub use activation::Activation;
pub use conv::{conv2d, GlobalAvgPool2d};
pub use linear::Linear;
pub use module::Module;
