//! The parallel branches of one reparameterizable unit.

use crate::error::{ReplegarError, Result};
use crate::reparam::operator::{AffineOperator, NormStats};
use crate::tensor::Tensor;

/// An unordered collection of parallel convolution branches, plus an
/// optional identity ("skip") path.
///
/// Branch order is irrelevant to the computed output; the stored order
/// only makes iteration deterministic. All branches must agree on
/// stride, output channels, and groups so their outputs can be summed.
#[derive(Debug, Clone)]
pub struct BranchSet {
    /// Parallel convolution branches, at least one
    branches: Vec<AffineOperator>,
    /// Whether an additive identity path is present
    has_skip: bool,
    /// Normalization applied on the identity path (only meaningful
    /// when `has_skip` is set)
    skip_norm: Option<NormStats>,
}

impl BranchSet {
    /// Create a branch set.
    ///
    /// The skip path's *validity* (matching channel counts, stride 1)
    /// is checked by the fusion engine and by the unit constructor;
    /// here only the branch collection itself is validated.
    ///
    /// # Errors
    ///
    /// Returns [`ReplegarError::InvalidTopology`] if no branches are
    /// given, if the branches disagree on stride, output channels,
    /// input channels, or groups, or if `skip_norm` covers a different
    /// channel count.
    pub fn new(
        branches: Vec<AffineOperator>,
        has_skip: bool,
        skip_norm: Option<NormStats>,
    ) -> Result<Self> {
        let Some(first) = branches.first() else {
            return Err(ReplegarError::invalid_topology(
                "branch set has no branches",
            ));
        };

        for (i, branch) in branches.iter().enumerate() {
            if branch.stride() != first.stride()
                || branch.out_channels() != first.out_channels()
                || branch.in_channels() != first.in_channels()
                || branch.groups() != first.groups()
            {
                return Err(ReplegarError::invalid_topology(format!(
                    "branch {i} disagrees with branch 0: \
                     stride {} vs {}, out {} vs {}, in {} vs {}, groups {} vs {}",
                    branch.stride(),
                    first.stride(),
                    branch.out_channels(),
                    first.out_channels(),
                    branch.in_channels(),
                    first.in_channels(),
                    branch.groups(),
                    first.groups()
                )));
            }
        }

        if let Some(ref n) = skip_norm {
            if n.channels() != first.out_channels() {
                return Err(ReplegarError::invalid_topology(format!(
                    "skip norm covers {} channels, branches produce {}",
                    n.channels(),
                    first.out_channels()
                )));
            }
        }

        Ok(Self {
            branches,
            has_skip,
            skip_norm,
        })
    }

    /// The parallel branches, in deterministic iteration order.
    #[must_use]
    pub fn branches(&self) -> &[AffineOperator] {
        &self.branches
    }

    /// Mutable access to the branches, e.g. for weight loading.
    pub fn branches_mut(&mut self) -> &mut [AffineOperator] {
        &mut self.branches
    }

    /// Whether an identity path is present.
    #[must_use]
    pub fn has_skip(&self) -> bool {
        self.has_skip
    }

    /// Normalization on the identity path, if any.
    #[must_use]
    pub fn skip_norm(&self) -> Option<&NormStats> {
        self.skip_norm.as_ref()
    }

    /// Mutable normalization on the identity path.
    pub fn skip_norm_mut(&mut self) -> Option<&mut NormStats> {
        self.skip_norm.as_mut()
    }

    /// Input channel count.
    #[must_use]
    pub fn in_channels(&self) -> usize {
        self.branches[0].in_channels()
    }

    /// Output channel count.
    #[must_use]
    pub fn out_channels(&self) -> usize {
        self.branches[0].out_channels()
    }

    /// Shared stride of all branches.
    #[must_use]
    pub fn stride(&self) -> usize {
        self.branches[0].stride()
    }

    /// Shared group count of all branches.
    #[must_use]
    pub fn groups(&self) -> usize {
        self.branches[0].groups()
    }

    /// Largest spatial kernel size across branches.
    #[must_use]
    pub fn kernel_size(&self) -> usize {
        self.branches
            .iter()
            .map(AffineOperator::kernel_size)
            .max()
            .unwrap_or(1)
    }

    /// Training-time forward pass: every branch computes independently
    /// and the outputs (plus the identity path) are summed.
    ///
    /// # Panics
    ///
    /// Panics on input shape mismatch, and on a skip path whose shapes
    /// cannot be added (such sets are rejected before a model is
    /// built).
    #[must_use]
    pub fn forward(&self, input: &Tensor) -> Tensor {
        let mut sum = self.branches[0].apply(input);
        for branch in &self.branches[1..] {
            sum = sum.add(&branch.apply(input));
        }
        if self.has_skip {
            let skip = match &self.skip_norm {
                Some(stats) => stats.apply(input),
                None => input.clone(),
            };
            sum = sum.add(&skip);
        }
        sum
    }
}
