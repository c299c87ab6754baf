//! A single convolution branch: kernel, bias, and optional
//! normalization statistics.

use crate::error::{ReplegarError, Result};
use crate::nn::conv2d;
use crate::nn::init::{kaiming_uniform, ones, zeros};
use crate::tensor::Tensor;

/// Per-channel batch-norm statistics attached to a convolution.
///
/// The statistics are frozen running estimates; this crate only ever
/// evaluates them (training updates them elsewhere). The per-instance
/// `eps` travels with the statistics because folding must use the
/// exact value the branch was trained with.
#[derive(Debug, Clone, PartialEq)]
pub struct NormStats {
    /// Learnable scale (gamma), shape `[channels]`
    scale: Tensor,
    /// Learnable shift (beta), shape `[channels]`
    shift: Tensor,
    /// Running mean, shape `[channels]`
    mean: Tensor,
    /// Running variance, shape `[channels]`
    var: Tensor,
    /// Numerical-stability constant
    eps: f32,
}

impl NormStats {
    /// Create normalization statistics from explicit tensors.
    ///
    /// # Errors
    ///
    /// Returns [`ReplegarError::InvalidTopology`] if the vectors do not
    /// all have the same length.
    pub fn new(scale: Tensor, shift: Tensor, mean: Tensor, var: Tensor, eps: f32) -> Result<Self> {
        let channels = scale.numel();
        if shift.numel() != channels || mean.numel() != channels || var.numel() != channels {
            return Err(ReplegarError::invalid_topology(format!(
                "norm statistics disagree on channel count: scale={}, shift={}, mean={}, var={}",
                scale.numel(),
                shift.numel(),
                mean.numel(),
                var.numel()
            )));
        }
        Ok(Self {
            scale,
            shift,
            mean,
            var,
            eps,
        })
    }

    /// Freshly initialized statistics: unit scale and variance, zero
    /// shift and mean, default eps.
    #[must_use]
    pub fn fresh(channels: usize) -> Self {
        Self {
            scale: ones(&[channels]),
            shift: zeros(&[channels]),
            mean: zeros(&[channels]),
            var: ones(&[channels]),
            eps: 1e-5,
        }
    }

    /// Number of channels these statistics cover.
    #[must_use]
    pub fn channels(&self) -> usize {
        self.scale.numel()
    }

    /// The stored eps value.
    #[must_use]
    pub fn eps(&self) -> f32 {
        self.eps
    }

    /// The affine form of channel `c`: returns `(t, offset)` such that
    /// normalizing a value `y` equals `y * t + offset`.
    #[must_use]
    pub fn affine(&self, c: usize) -> (f32, f32) {
        let t = self.scale.data()[c] / (self.var.data()[c] + self.eps).sqrt();
        let offset = self.shift.data()[c] - self.mean.data()[c] * t;
        (t, offset)
    }

    /// Apply the normalization to a `[N, C, H, W]` tensor.
    ///
    /// # Panics
    ///
    /// Panics if the channel dimension doesn't match.
    #[must_use]
    pub fn apply(&self, input: &Tensor) -> Tensor {
        assert_eq!(input.ndim(), 4, "NormStats expects 4D input [N, C, H, W]");
        let shape = input.shape();
        let (batch_size, channels, h, w) = (shape[0], shape[1], shape[2], shape[3]);
        assert_eq!(
            channels,
            self.channels(),
            "Expected {} channels, got {}",
            self.channels(),
            channels
        );

        let input_data = input.data();
        let mut output = vec![0.0; input_data.len()];
        let spatial = h * w;

        for n in 0..batch_size {
            for c in 0..channels {
                let (t, offset) = self.affine(c);
                let base = n * channels * spatial + c * spatial;
                for s in 0..spatial {
                    output[base + s] = input_data[base + s] * t + offset;
                }
            }
        }

        Tensor::new(&output, shape)
    }
}

/// One linear operator: a grouped convolution with bias, optionally
/// followed by per-channel normalization.
///
/// This is the unit of currency of the fusion engine: branches enter
/// as `AffineOperator`s with normalization, and fusion produces one
/// `AffineOperator` without.
#[derive(Debug, Clone)]
pub struct AffineOperator {
    /// Kernel, shape `[out_channels, in_channels / groups, k, k]`
    kernel: Tensor,
    /// Bias, shape `[out_channels]`
    bias: Tensor,
    /// Spatial stride
    stride: usize,
    /// Convolution groups (`in_channels` for depthwise)
    groups: usize,
    /// Normalization folded away by the fusion engine
    norm: Option<NormStats>,
}

impl AffineOperator {
    /// Create an operator from explicit parameters.
    ///
    /// # Errors
    ///
    /// Returns [`ReplegarError::InvalidTopology`] if the kernel is not
    /// square 4D, the bias length disagrees with the kernel's output
    /// channels, the channel counts don't divide into `groups`, or the
    /// normalization covers a different channel count.
    pub fn new(
        kernel: Tensor,
        bias: Tensor,
        stride: usize,
        groups: usize,
        norm: Option<NormStats>,
    ) -> Result<Self> {
        if kernel.ndim() != 4 {
            return Err(ReplegarError::invalid_topology(format!(
                "kernel must be 4D [O, I/g, k, k], got {}D",
                kernel.ndim()
            )));
        }
        let kshape = kernel.shape();
        if kshape[2] != kshape[3] {
            return Err(ReplegarError::invalid_topology(format!(
                "kernel must be square, got {}x{}",
                kshape[2], kshape[3]
            )));
        }
        let out_channels = kshape[0];
        if bias.numel() != out_channels {
            return Err(ReplegarError::invalid_topology(format!(
                "bias length {} doesn't match {out_channels} output channels",
                bias.numel()
            )));
        }
        if stride == 0 || groups == 0 {
            return Err(ReplegarError::invalid_topology(
                "stride and groups must be at least 1",
            ));
        }
        if out_channels % groups != 0 {
            return Err(ReplegarError::invalid_topology(format!(
                "{out_channels} output channels not divisible by {groups} groups"
            )));
        }
        if let Some(ref n) = norm {
            if n.channels() != out_channels {
                return Err(ReplegarError::invalid_topology(format!(
                    "norm covers {} channels, operator has {out_channels}",
                    n.channels()
                )));
            }
        }

        Ok(Self {
            kernel,
            bias,
            stride,
            groups,
            norm,
        })
    }

    /// Create an operator with Kaiming-initialized kernel, zero bias,
    /// and (optionally) fresh normalization statistics.
    ///
    /// # Errors
    ///
    /// Returns [`ReplegarError::InvalidTopology`] on inconsistent
    /// channel/group counts.
    pub fn random(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        groups: usize,
        with_norm: bool,
        seed: Option<u64>,
    ) -> Result<Self> {
        if groups == 0 || in_channels % groups != 0 {
            return Err(ReplegarError::invalid_topology(format!(
                "{in_channels} input channels not divisible by {groups} groups"
            )));
        }
        let in_per_group = in_channels / groups;
        let fan_in = in_per_group * kernel_size * kernel_size;
        let kernel = kaiming_uniform(
            &[out_channels, in_per_group, kernel_size, kernel_size],
            fan_in,
            seed,
        );
        let bias = zeros(&[out_channels]);
        let norm = with_norm.then(|| NormStats::fresh(out_channels));
        Self::new(kernel, bias, stride, groups, norm)
    }

    /// Output channel count.
    #[must_use]
    pub fn out_channels(&self) -> usize {
        self.kernel.shape()[0]
    }

    /// Input channel count (per-group count times groups).
    #[must_use]
    pub fn in_channels(&self) -> usize {
        self.kernel.shape()[1] * self.groups
    }

    /// Spatial kernel size (kernels are square).
    #[must_use]
    pub fn kernel_size(&self) -> usize {
        self.kernel.shape()[2]
    }

    /// Spatial stride.
    #[must_use]
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Convolution groups.
    #[must_use]
    pub fn groups(&self) -> usize {
        self.groups
    }

    /// Whether normalization statistics are attached.
    #[must_use]
    pub fn has_norm(&self) -> bool {
        self.norm.is_some()
    }

    /// The attached normalization statistics, if any.
    #[must_use]
    pub fn norm(&self) -> Option<&NormStats> {
        self.norm.as_ref()
    }

    /// The kernel tensor.
    #[must_use]
    pub fn kernel(&self) -> &Tensor {
        &self.kernel
    }

    /// The bias tensor.
    #[must_use]
    pub fn bias(&self) -> &Tensor {
        &self.bias
    }

    /// Replace the kernel, e.g. with externally trained weights.
    ///
    /// # Errors
    ///
    /// Returns [`ReplegarError::TopologyMismatch`] if the new kernel
    /// changes the channel layout.
    pub fn set_kernel(&mut self, kernel: Tensor) -> Result<()> {
        if kernel.ndim() != 4
            || kernel.shape()[0] != self.out_channels()
            || kernel.shape()[1] != self.kernel.shape()[1]
        {
            return Err(ReplegarError::topology_mismatch(
                format!("kernel channels {:?}", &self.kernel.shape()[..2]),
                format!("{:?}", kernel.shape()),
            ));
        }
        self.kernel = kernel;
        Ok(())
    }

    /// Replace the bias, e.g. with externally trained weights.
    ///
    /// # Errors
    ///
    /// Returns [`ReplegarError::TopologyMismatch`] on a length change.
    pub fn set_bias(&mut self, bias: Tensor) -> Result<()> {
        if bias.numel() != self.out_channels() {
            return Err(ReplegarError::topology_mismatch(
                format!("bias of length {}", self.out_channels()),
                format!("length {}", bias.numel()),
            ));
        }
        self.bias = bias;
        Ok(())
    }

    /// Replace the normalization statistics.
    ///
    /// # Errors
    ///
    /// Returns [`ReplegarError::InvalidTopology`] on a channel-count
    /// mismatch.
    pub fn set_norm(&mut self, norm: Option<NormStats>) -> Result<()> {
        if let Some(ref n) = norm {
            if n.channels() != self.out_channels() {
                return Err(ReplegarError::invalid_topology(format!(
                    "norm covers {} channels, operator has {}",
                    n.channels(),
                    self.out_channels()
                )));
            }
        }
        self.norm = norm;
        Ok(())
    }

    /// Apply the operator to a `[N, C, H, W]` tensor.
    ///
    /// Convolution uses "same" padding (`kernel_size / 2`), so all
    /// branches of a unit agree on output spatial shape.
    #[must_use]
    pub fn apply(&self, input: &Tensor) -> Tensor {
        let padding = self.kernel_size() / 2;
        let conv = conv2d(
            input,
            &self.kernel,
            &self.bias,
            self.stride,
            padding,
            self.groups,
        );
        match &self.norm {
            Some(stats) => stats.apply(&conv),
            None => conv,
        }
    }

    /// Fold the normalization statistics into kernel and bias.
    ///
    /// For output channel `c` with affine form `(t, offset)`:
    /// the kernel row is scaled by `t` and the bias becomes
    /// `bias * t + offset`. The result carries no normalization.
    #[must_use]
    pub fn fold_norm(&self) -> AffineOperator {
        let Some(stats) = &self.norm else {
            return self.clone();
        };

        let kshape = self.kernel.shape().to_vec();
        let row_len: usize = kshape[1..].iter().product();

        let mut kernel = self.kernel.clone();
        let mut bias = self.bias.clone();
        for c in 0..kshape[0] {
            let (t, offset) = stats.affine(c);
            for v in &mut kernel.data_mut()[c * row_len..(c + 1) * row_len] {
                *v *= t;
            }
            let b = &mut bias.data_mut()[c];
            *b = *b * t + offset;
        }

        AffineOperator {
            kernel,
            bias,
            stride: self.stride,
            groups: self.groups,
            norm: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(scale: &[f32], shift: &[f32], mean: &[f32], var: &[f32], eps: f32) -> NormStats {
        NormStats::new(
            Tensor::from_slice(scale),
            Tensor::from_slice(shift),
            Tensor::from_slice(mean),
            Tensor::from_slice(var),
            eps,
        )
        .unwrap()
    }

    #[test]
    fn test_norm_stats_rejects_ragged_lengths() {
        let err = NormStats::new(
            Tensor::from_slice(&[1.0, 1.0]),
            Tensor::from_slice(&[0.0]),
            Tensor::from_slice(&[0.0, 0.0]),
            Tensor::from_slice(&[1.0, 1.0]),
            1e-5,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            crate::error::ReplegarError::InvalidTopology { .. }
        ));
    }

    #[test]
    fn test_norm_affine_hand_computed() {
        // scale=2, shift=1, mean=3, var=4, eps=0 -> t = 2/2 = 1, offset = 1 - 3 = -2
        let s = stats(&[2.0], &[1.0], &[3.0], &[4.0], 0.0);
        let (t, offset) = s.affine(0);
        assert!((t - 1.0).abs() < 1e-6);
        assert!((offset + 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_norm_apply_matches_affine() {
        let s = stats(&[2.0], &[1.0], &[3.0], &[4.0], 0.0);
        let x = Tensor::new(&[5.0, 7.0, 9.0, 11.0], &[1, 1, 2, 2]);
        let y = s.apply(&x);
        // (x - 3) / 2 * 2 + 1 = x - 2
        assert_eq!(y.data(), &[3.0, 5.0, 7.0, 9.0]);
    }

    #[test]
    fn test_fold_norm_matches_apply() {
        let op = AffineOperator::new(
            Tensor::new(&[0.5, -1.0, 2.0, 0.25], &[1, 1, 2, 2]),
            Tensor::from_slice(&[0.3]),
            1,
            1,
            Some(stats(&[1.5], &[-0.2], &[0.4], &[2.0], 1e-3)),
        )
        .unwrap();

        let x = Tensor::new(
            &[1.0, -2.0, 0.5, 3.0, -1.0, 2.0, 0.0, 1.0, -0.5],
            &[1, 1, 3, 3],
        );
        let y_norm = op.apply(&x);
        let y_folded = op.fold_norm().apply(&x);

        assert!(!op.fold_norm().has_norm());
        assert!(y_norm.max_abs_diff(&y_folded) < 1e-5);
    }

    #[test]
    fn test_fold_norm_uses_stored_eps() {
        // Large eps changes the scaling noticeably; folding must honor it.
        let kernel = Tensor::ones(&[1, 1, 1, 1]);
        let bias = Tensor::zeros(&[1]);
        let op = AffineOperator::new(
            kernel,
            bias,
            1,
            1,
            Some(stats(&[1.0], &[0.0], &[0.0], &[1.0], 3.0)),
        )
        .unwrap();

        let folded = op.fold_norm();
        // t = 1 / sqrt(1 + 3) = 0.5
        assert!((folded.kernel().data()[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_new_rejects_non_square_kernel() {
        let err = AffineOperator::new(
            Tensor::zeros(&[1, 1, 3, 1]),
            Tensor::zeros(&[1]),
            1,
            1,
            None,
        )
        .unwrap_err();
        assert!(err.to_string().contains("square"));
    }

    #[test]
    fn test_new_rejects_bias_mismatch() {
        let err = AffineOperator::new(
            Tensor::zeros(&[2, 1, 1, 1]),
            Tensor::zeros(&[3]),
            1,
            1,
            None,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            crate::error::ReplegarError::InvalidTopology { .. }
        ));
    }

    #[test]
    fn test_random_depthwise_shapes() {
        let op = AffineOperator::random(8, 8, 3, 1, 8, true, Some(11)).unwrap();
        assert_eq!(op.kernel().shape(), &[8, 1, 3, 3]);
        assert_eq!(op.in_channels(), 8);
        assert_eq!(op.out_channels(), 8);
        assert!(op.has_norm());
    }

    #[test]
    fn test_apply_same_padding_keeps_spatial_shape() {
        let op = AffineOperator::random(2, 4, 3, 1, 1, false, Some(3)).unwrap();
        let x = Tensor::ones(&[1, 2, 5, 5]);
        let y = op.apply(&x);
        assert_eq!(y.shape(), &[1, 4, 5, 5]);
    }
}
