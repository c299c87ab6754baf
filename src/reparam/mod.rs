//! Reparameterizable units and the branch-fusion engine.
//!
//! A unit is trained as a set of parallel convolution branches (plus an
//! optional identity path) and deployed as a single convolution that
//! computes the same function. The rewrite is exact up to floating
//! point rounding: batch-norm statistics are folded into each branch,
//! kernels are padded to a common footprint, and everything is summed
//! into one operator.
//!
//! # References
//!
//! - Vasu, P. K. A., et al. (2023). MobileOne: An improved one
//!   millisecond mobile backbone. CVPR.
//! - Ding, X., et al. (2021). RepVGG: Making VGG-style ConvNets great
//!   again. CVPR.

mod branch;
mod fuse;
mod operator;
mod unit;

pub use branch::BranchSet;
pub use fuse::fuse;
pub use operator::{AffineOperator, NormStats};
pub use unit::{Unit, UnitState, UnitTopology};
