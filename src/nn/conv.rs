//! Grouped 2D convolution and pooling.
//!
//! The convolution here is the crate's execution engine: a direct
//! (non-GEMM) implementation that supports stride, symmetric zero
//! padding, and grouped kernels, which covers both the dense and the
//! depthwise units of the backbone.

use crate::nn::module::Module;
use crate::tensor::Tensor;

/// Apply a grouped 2D convolution.
///
/// # Shape
///
/// - `input`: `(N, C_in, H, W)`
/// - `kernel`: `(C_out, C_in / groups, kH, kW)`
/// - `bias`: `(C_out,)`
/// - Output: `(N, C_out, H_out, W_out)` where
///   `H_out = (H + 2*padding - kH) / stride + 1`
///
/// With `groups == 1` this is a dense convolution; with
/// `groups == C_in == C_out` it is depthwise.
///
/// # Panics
///
/// Panics if the shapes are inconsistent with `groups` or with each
/// other. Shape errors here are programming errors: every caller in
/// this crate validates topology at construction time.
#[must_use]
pub fn conv2d(
    input: &Tensor,
    kernel: &Tensor,
    bias: &Tensor,
    stride: usize,
    padding: usize,
    groups: usize,
) -> Tensor {
    assert_eq!(
        input.ndim(),
        4,
        "conv2d expects 4D input [N, C, H, W], got {}D",
        input.ndim()
    );
    assert_eq!(
        kernel.ndim(),
        4,
        "conv2d expects 4D kernel [O, I/g, kH, kW], got {}D",
        kernel.ndim()
    );

    let shape = input.shape();
    let (batch_size, in_channels, in_h, in_w) = (shape[0], shape[1], shape[2], shape[3]);

    let kshape = kernel.shape();
    let (out_channels, in_per_group, kernel_h, kernel_w) =
        (kshape[0], kshape[1], kshape[2], kshape[3]);

    assert_eq!(
        in_channels,
        in_per_group * groups,
        "Expected {} input channels for {groups} groups, got {}",
        in_per_group * groups,
        in_channels
    );
    assert_eq!(
        out_channels % groups,
        0,
        "Output channels {out_channels} not divisible by groups {groups}"
    );
    assert_eq!(bias.numel(), out_channels, "Bias length mismatch");

    let out_h = (in_h + 2 * padding - kernel_h) / stride + 1;
    let out_w = (in_w + 2 * padding - kernel_w) / stride + 1;
    let out_per_group = out_channels / groups;

    let mut output = vec![0.0; batch_size * out_channels * out_h * out_w];

    let input_data = input.data();
    let kernel_data = kernel.data();
    let bias_data = bias.data();

    for n in 0..batch_size {
        for oc in 0..out_channels {
            let group = oc / out_per_group;
            for oh in 0..out_h {
                for ow in 0..out_w {
                    let mut sum = 0.0;

                    for ic_local in 0..in_per_group {
                        let ic = group * in_per_group + ic_local;
                        for kh in 0..kernel_h {
                            for kw in 0..kernel_w {
                                let ih = oh * stride + kh;
                                let iw = ow * stride + kw;

                                let val = if ih < padding
                                    || ih >= in_h + padding
                                    || iw < padding
                                    || iw >= in_w + padding
                                {
                                    0.0
                                } else {
                                    let actual_ih = ih - padding;
                                    let actual_iw = iw - padding;
                                    input_data[n * in_channels * in_h * in_w
                                        + ic * in_h * in_w
                                        + actual_ih * in_w
                                        + actual_iw]
                                };

                                let k_idx = oc * in_per_group * kernel_h * kernel_w
                                    + ic_local * kernel_h * kernel_w
                                    + kh * kernel_w
                                    + kw;
                                sum += val * kernel_data[k_idx];
                            }
                        }
                    }

                    output[n * out_channels * out_h * out_w
                        + oc * out_h * out_w
                        + oh * out_w
                        + ow] = sum + bias_data[oc];
                }
            }
        }
    }

    Tensor::new(&output, &[batch_size, out_channels, out_h, out_w])
}

/// Global Average Pooling 2D.
///
/// Pools over the entire spatial dimension, outputting one value per channel.
///
/// # Shape
///
/// - Input: `(N, C, H, W)`
/// - Output: `(N, C)`
#[derive(Debug, Default)]
pub struct GlobalAvgPool2d;

impl GlobalAvgPool2d {
    /// Create a new `GlobalAvgPool2d` layer.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Module for GlobalAvgPool2d {
    fn forward(&self, input: &Tensor) -> Tensor {
        assert_eq!(
            input.ndim(),
            4,
            "GlobalAvgPool2d expects 4D input [N, C, H, W]"
        );

        let shape = input.shape();
        let (batch_size, channels, h, w) = (shape[0], shape[1], shape[2], shape[3]);
        let spatial_size = (h * w) as f32;

        let mut output = vec![0.0; batch_size * channels];
        let input_data = input.data();

        for n in 0..batch_size {
            for c in 0..channels {
                let mut sum = 0.0;
                for i in 0..h {
                    for j in 0..w {
                        sum += input_data[n * channels * h * w + c * h * w + i * w + j];
                    }
                }
                output[n * channels + c] = sum / spatial_size;
            }
        }

        Tensor::new(&output, &[batch_size, channels])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conv2d_identity_kernel() {
        // 1x1 kernel with weight 1.0 reproduces the input.
        let x = Tensor::new(&[1.0, 2.0, 3.0, 4.0], &[1, 1, 2, 2]);
        let k = Tensor::ones(&[1, 1, 1, 1]);
        let b = Tensor::zeros(&[1]);

        let y = conv2d(&x, &k, &b, 1, 0, 1);
        assert_eq!(y.shape(), &[1, 1, 2, 2]);
        assert_eq!(y.data(), x.data());
    }

    #[test]
    fn test_conv2d_3x3_same_padding_sums_neighborhood() {
        // All-ones 3x3 kernel with padding 1: each output is the sum of
        // the 3x3 neighborhood.
        let x = Tensor::ones(&[1, 1, 3, 3]);
        let k = Tensor::ones(&[1, 1, 3, 3]);
        let b = Tensor::zeros(&[1]);

        let y = conv2d(&x, &k, &b, 1, 1, 1);
        assert_eq!(y.shape(), &[1, 1, 3, 3]);
        // Center sees 9 ones, corners see 4.
        assert_eq!(y.data()[4], 9.0);
        assert_eq!(y.data()[0], 4.0);
    }

    #[test]
    fn test_conv2d_stride_two() {
        let x = Tensor::ones(&[1, 1, 4, 4]);
        let k = Tensor::ones(&[1, 1, 3, 3]);
        let b = Tensor::zeros(&[1]);

        let y = conv2d(&x, &k, &b, 2, 1, 1);
        assert_eq!(y.shape(), &[1, 1, 2, 2]);
    }

    #[test]
    fn test_conv2d_depthwise_keeps_channels_separate() {
        // Two channels, depthwise 1x1 kernels scaling by 2 and 3.
        let x = Tensor::new(&[1.0, 1.0, 1.0, 1.0], &[1, 2, 1, 2]);
        let k = Tensor::new(&[2.0, 3.0], &[2, 1, 1, 1]);
        let b = Tensor::zeros(&[2]);

        let y = conv2d(&x, &k, &b, 1, 0, 2);
        assert_eq!(y.data(), &[2.0, 2.0, 3.0, 3.0]);
    }

    #[test]
    fn test_conv2d_bias_added() {
        let x = Tensor::zeros(&[1, 1, 2, 2]);
        let k = Tensor::ones(&[1, 1, 1, 1]);
        let b = Tensor::from_slice(&[0.5]);

        let y = conv2d(&x, &k, &b, 1, 0, 1);
        assert!(y.data().iter().all(|&v| (v - 0.5).abs() < 1e-7));
    }

    #[test]
    fn test_global_avg_pool() {
        let x = Tensor::new(&[1.0, 2.0, 3.0, 4.0, 10.0, 20.0, 30.0, 40.0], &[1, 2, 2, 2]);
        let y = GlobalAvgPool2d::new().forward(&x);
        assert_eq!(y.shape(), &[1, 2]);
        assert!((y.data()[0] - 2.5).abs() < 1e-6);
        assert!((y.data()[1] - 25.0).abs() < 1e-6);
    }
}
