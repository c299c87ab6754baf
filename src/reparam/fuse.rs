//! The branch-fusion engine.
//!
//! Collapses a [`BranchSet`] into one equivalent [`AffineOperator`]:
//!
//! 1. fold each branch's normalization statistics into its kernel and
//!    bias, using the branch's stored eps;
//! 2. zero-pad smaller kernels to the largest spatial footprint,
//!    centering them;
//! 3. synthesize an identity kernel for the skip path (folding its
//!    normalization the same way);
//! 4. sum kernels and biases elementwise.
//!
//! The function is pure and deterministic. Equivalence to the
//! multi-branch forward holds within floating-point tolerance; the
//! division by `sqrt(var + eps)` introduces rounding, so outputs are
//! not bit-identical.

use crate::error::{ReplegarError, Result};
use crate::reparam::branch::BranchSet;
use crate::reparam::operator::AffineOperator;
use crate::tensor::Tensor;

/// Fuse a branch set into a single equivalent operator.
///
/// # Errors
///
/// Returns [`ReplegarError::InvalidTopology`] if the set has no
/// branches, if the branches disagree on stride/channels/groups, or if
/// a skip path is requested with `in_channels != out_channels` or
/// `stride != 1`. A skip that cannot be represented is never silently
/// dropped.
pub fn fuse(branch_set: &BranchSet) -> Result<AffineOperator> {
    let branches = branch_set.branches();
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
                "branch {i} disagrees with branch 0 on stride, channels, or groups"
            )));
        }
    }

    let in_channels = first.in_channels();
    let out_channels = first.out_channels();
    let stride = first.stride();
    let groups = first.groups();
    let target_size = branch_set.kernel_size();

    if branch_set.has_skip() {
        if in_channels != out_channels {
            return Err(ReplegarError::invalid_topology(format!(
                "skip path requires in_channels == out_channels, got {in_channels} and {out_channels}"
            )));
        }
        if stride != 1 {
            return Err(ReplegarError::invalid_topology(format!(
                "skip path requires stride 1, got {stride}"
            )));
        }
    }

    let in_per_group = in_channels / groups;
    let mut kernel = Tensor::zeros(&[out_channels, in_per_group, target_size, target_size]);
    let mut bias = Tensor::zeros(&[out_channels]);

    for branch in branches {
        let folded = branch.fold_norm();
        accumulate(&mut kernel, &mut bias, &folded, target_size);
    }

    if branch_set.has_skip() {
        let identity = AffineOperator::new(
            identity_kernel(out_channels, groups, target_size),
            Tensor::zeros(&[out_channels]),
            stride,
            groups,
            branch_set.skip_norm().cloned(),
        )?;
        let folded = identity.fold_norm();
        accumulate(&mut kernel, &mut bias, &folded, target_size);
    }

    AffineOperator::new(kernel, bias, stride, groups, None)
}

/// Add a folded branch into the running kernel/bias sums, centering
/// its kernel within the target footprint.
fn accumulate(kernel: &mut Tensor, bias: &mut Tensor, folded: &AffineOperator, target: usize) {
    let padded = pad_kernel(folded.kernel(), target);
    debug_assert_eq!(padded.shape(), kernel.shape());

    for (acc, v) in kernel.data_mut().iter_mut().zip(padded.data()) {
        *acc += v;
    }
    for (acc, v) in bias.data_mut().iter_mut().zip(folded.bias().data()) {
        *acc += v;
    }
}

/// Zero-pad a `[O, I/g, k, k]` kernel to `[O, I/g, target, target]`,
/// centering the original: padding offset is `(target - k) / 2` per
/// spatial axis.
fn pad_kernel(kernel: &Tensor, target: usize) -> Tensor {
    let shape = kernel.shape();
    let (out_channels, in_per_group, k) = (shape[0], shape[1], shape[2]);
    if k == target {
        return kernel.clone();
    }

    let offset = (target - k) / 2;
    let mut padded = Tensor::zeros(&[out_channels, in_per_group, target, target]);
    {
        let src = kernel.data();
        let dst = padded.data_mut();
        for oc in 0..out_channels {
            for ic in 0..in_per_group {
                for row in 0..k {
                    for col in 0..k {
                        let s = oc * in_per_group * k * k + ic * k * k + row * k + col;
                        let d = oc * in_per_group * target * target
                            + ic * target * target
                            + (row + offset) * target
                            + (col + offset);
                        dst[d] = src[s];
                    }
                }
            }
        }
    }
    padded
}

/// The implicit kernel of an identity path: zero everywhere except a
/// single 1 at the spatial center, wired so that output channel `oc`
/// reads input channel `oc` (respecting groups).
fn identity_kernel(channels: usize, groups: usize, size: usize) -> Tensor {
    let in_per_group = channels / groups;
    let center = size / 2;
    let mut kernel = Tensor::zeros(&[channels, in_per_group, size, size]);
    {
        let data = kernel.data_mut();
        for oc in 0..channels {
            // Within its group slice, channel oc reads local input
            // index oc % in_per_group, which is global channel oc.
            let ic_local = oc % in_per_group;
            let idx = oc * in_per_group * size * size
                + ic_local * size * size
                + center * size
                + center;
            data[idx] = 1.0;
        }
    }
    kernel
}
