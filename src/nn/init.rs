//! Weight initialization functions.
//!
//! Initialization schemes from the literature:
//!
//! - Kaiming/He (He et al., 2015) - for `ReLU` activations
//!
//! # References
//!
//! - He, K., et al. (2015). Delving deep into rectifiers: Surpassing human-level
//!   performance on `ImageNet` classification. ICCV.

use crate::tensor::Tensor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Kaiming uniform initialization (He et al., 2015).
///
/// Samples from U(-bound, bound) where bound = sqrt(6 / `fan_in`).
/// Optimal for `ReLU` activations.
///
/// # Arguments
///
/// * `shape` - Shape of the tensor
/// * `fan_in` - Number of input features
/// * `seed` - Optional random seed
#[must_use]
pub fn kaiming_uniform(shape: &[usize], fan_in: usize, seed: Option<u64>) -> Tensor {
    let bound = (6.0 / fan_in as f32).sqrt();
    uniform(shape, -bound, bound, seed)
}

/// Uniform distribution initialization.
///
/// Samples from U(low, high).
#[must_use]
pub fn uniform(shape: &[usize], low: f32, high: f32, seed: Option<u64>) -> Tensor {
    let numel: usize = shape.iter().product();
    let mut rng = match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    };

    let data: Vec<f32> = (0..numel).map(|_| rng.gen_range(low..high)).collect();

    Tensor::new(&data, shape)
}

/// Normal distribution initialization.
///
/// Samples from N(mean, std).
#[must_use]
pub fn normal(shape: &[usize], mean: f32, std: f32, seed: Option<u64>) -> Tensor {
    let numel: usize = shape.iter().product();
    let mut rng = match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    };

    // Box-Muller transform for normal distribution
    let data: Vec<f32> = (0..numel)
        .map(|_| {
            let u1: f32 = rng.gen_range(0.0001_f32..1.0_f32);
            let u2: f32 = rng.gen_range(0.0_f32..1.0_f32);
            let z = (-2.0_f32 * u1.ln()).sqrt() * (2.0_f32 * std::f32::consts::PI * u2).cos();
            mean + std * z
        })
        .collect();

    Tensor::new(&data, shape)
}

/// Constant initialization.
#[must_use]
pub fn constant(shape: &[usize], value: f32) -> Tensor {
    let numel: usize = shape.iter().product();
    Tensor::new(&vec![value; numel], shape)
}

/// Zeros initialization.
#[must_use]
pub fn zeros(shape: &[usize]) -> Tensor {
    constant(shape, 0.0)
}

/// Ones initialization.
#[must_use]
pub fn ones(shape: &[usize]) -> Tensor {
    constant(shape, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kaiming_uniform_bounds() {
        let t = kaiming_uniform(&[100, 50], 50, Some(42));
        let bound = (6.0 / 50.0_f32).sqrt();

        for &val in t.data() {
            assert!(val >= -bound && val <= bound);
        }
    }

    #[test]
    fn test_kaiming_uniform_reproducible() {
        let t1 = kaiming_uniform(&[10, 10], 10, Some(42));
        let t2 = kaiming_uniform(&[10, 10], 10, Some(42));
        assert_eq!(t1.data(), t2.data());
    }

    #[test]
    fn test_normal_mean_std() {
        let t = normal(&[10000], 5.0, 2.0, Some(42));

        let mean: f32 = t.data().iter().sum::<f32>() / t.numel() as f32;
        let var: f32 = t.data().iter().map(|x| (x - mean).powi(2)).sum::<f32>() / t.numel() as f32;
        let std = var.sqrt();

        // Allow 10% tolerance for statistical tests
        assert!((mean - 5.0).abs() < 0.5, "Mean {mean} too far from 5.0");
        assert!((std - 2.0).abs() < 0.3, "Std {std} too far from 2.0");
    }

    #[test]
    fn test_constant_zeros_ones() {
        let c = constant(&[5, 5], 3.14);
        assert!(c.data().iter().all(|&x| (x - 3.14).abs() < 1e-6));

        let z = zeros(&[3, 3]);
        assert!(z.data().iter().all(|&x| x == 0.0));

        let o = ones(&[3, 3]);
        assert!(o.data().iter().all(|&x| x == 1.0));
    }

    #[test]
    fn test_uniform_no_seed() {
        let t1 = uniform(&[100], 0.0, 1.0, None);
        let t2 = uniform(&[100], 0.0, 1.0, None);

        // Very unlikely to be identical
        let same = t1
            .data()
            .iter()
            .zip(t2.data())
            .all(|(a, b)| (a - b).abs() < 1e-10);
        assert!(!same, "Two entropy-seeded tensors should differ");
    }
}
