//! The architecture assembler.
//!
//! Lays out a backbone from a compact hyperparameter record: a stem,
//! stages of depthwise/pointwise unit pairs, and a classification
//! head, recording named feature checkpoints along the way.
//!
//! Named variants live in an explicit static table; there is no hidden
//! registry. Each variant is just a [`VariantSpec`] value plus an
//! optional pretrained-weights descriptor.

use serde::{Deserialize, Serialize};

use crate::error::{ReplegarError, Result};
use crate::model::{Head, Mode, Model, Stage};
use crate::nn::Activation;
use crate::reparam::{Unit, UnitTopology};

/// Input image channels (RGB).
const IMAGE_CHANNELS: usize = 3;

/// Release URL the pretrained weight files are published under.
pub const WEIGHTS_ORIGIN: &str =
    "https://github.com/james77777778/keras-image-models/releases/download/0.1.2/";

/// Names of the known variants, smallest to largest.
pub const VARIANT_NAMES: [&str; 4] = ["s0", "s1", "s2", "s3"];

/// Immutable structural hyperparameters of one named architecture.
///
/// Constructed once (from the static table or by hand), consumed by
/// [`assemble`], never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantSpec {
    /// Blocks per stage
    pub num_blocks: Vec<usize>,
    /// Output channel width per stage
    pub num_channels: Vec<usize>,
    /// Stem output channels
    pub stem_channels: usize,
    /// Parallel conv branches per reparameterizable unit
    pub branch_size: usize,
}

impl VariantSpec {
    /// The smallest variant (4 branches per unit).
    #[must_use]
    pub fn s0() -> Self {
        Self {
            num_blocks: vec![2, 8, 10, 1],
            num_channels: vec![48, 128, 256, 1024],
            stem_channels: 48,
            branch_size: 4,
        }
    }

    /// Variant s1.
    #[must_use]
    pub fn s1() -> Self {
        Self {
            num_blocks: vec![2, 8, 10, 1],
            num_channels: vec![96, 192, 512, 1280],
            stem_channels: 64,
            branch_size: 1,
        }
    }

    /// Variant s2.
    #[must_use]
    pub fn s2() -> Self {
        Self {
            num_blocks: vec![2, 8, 10, 1],
            num_channels: vec![96, 256, 640, 2048],
            stem_channels: 64,
            branch_size: 1,
        }
    }

    /// The largest variant.
    #[must_use]
    pub fn s3() -> Self {
        Self {
            num_blocks: vec![2, 8, 10, 1],
            num_channels: vec![128, 320, 768, 2048],
            stem_channels: 64,
            branch_size: 1,
        }
    }
}

/// Where a variant's pretrained weights can be obtained.
///
/// The crate never downloads or parses these files itself; trained
/// parameters arrive as already-materialized tensors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightsDescriptor {
    /// Dataset the weights were trained on
    pub source_name: String,
    /// Release URL
    pub origin_url: String,
    /// File name within the release
    pub file_name: String,
}

/// Look up a named variant's hyperparameters.
#[must_use]
pub fn variant(name: &str) -> Option<VariantSpec> {
    match name {
        "s0" => Some(VariantSpec::s0()),
        "s1" => Some(VariantSpec::s1()),
        "s2" => Some(VariantSpec::s2()),
        "s3" => Some(VariantSpec::s3()),
        _ => None,
    }
}

/// Look up a named variant's pretrained-weights descriptor.
#[must_use]
pub fn pretrained(name: &str) -> Option<WeightsDescriptor> {
    let file_name = match name {
        "s0" => "mobileones0_mobileone_s0.apple_in1k.keras",
        "s1" => "mobileones1_mobileone_s1.apple_in1k.keras",
        "s2" => "mobileones2_mobileone_s2.apple_in1k.keras",
        "s3" => "mobileones3_mobileone_s3.apple_in1k.keras",
        _ => return None,
    };
    Some(WeightsDescriptor {
        source_name: "imagenet".to_string(),
        origin_url: WEIGHTS_ORIGIN.to_string(),
        file_name: file_name.to_string(),
    })
}

/// Options for [`assemble`] beyond the structural hyperparameters.
#[derive(Debug, Clone)]
pub struct AssembleConfig {
    /// Classifier output count (ignored when `include_top` is false)
    pub classes: usize,
    /// Whether to build the linear classifier on top of the pooling
    pub include_top: bool,
    /// Pretrained weights the caller intends to load. Only a marker:
    /// carrying one together with [`Mode::Inference`] is rejected.
    pub weights: Option<WeightsDescriptor>,
    /// Seed for weight initialization (None: entropy)
    pub seed: Option<u64>,
}

impl Default for AssembleConfig {
    fn default() -> Self {
        Self {
            classes: 1000,
            include_top: true,
            weights: None,
            seed: None,
        }
    }
}

/// Assemble a backbone model from a hyperparameter record.
///
/// Deterministic given `spec`, `mode`, and config: the same inputs
/// produce the same unit topology and the same feature-key set in the
/// same order.
///
/// # Errors
///
/// - [`ReplegarError::IncompatibleRequest`] if `mode` is
///   [`Mode::Inference`] and `config.weights` is set. Pretrained
///   weights are only distributed for the multi-branch topology;
///   assemble in training mode, load, then transfer.
/// - [`ReplegarError::InvalidTopology`] if `num_blocks` and
///   `num_channels` differ in length, are empty, or any count is zero.
pub fn assemble(spec: &VariantSpec, mode: Mode, config: &AssembleConfig) -> Result<Model> {
    if mode == Mode::Inference && config.weights.is_some() {
        return Err(ReplegarError::IncompatibleRequest {
            message: "pretrained weights are only available for the training topology; \
                      assemble with Mode::Training, load the weights, then transfer"
                .to_string(),
        });
    }
    if spec.num_blocks.len() != spec.num_channels.len() {
        return Err(ReplegarError::invalid_topology(format!(
            "num_blocks has {} stages but num_channels has {}",
            spec.num_blocks.len(),
            spec.num_channels.len()
        )));
    }
    if spec.num_blocks.is_empty() {
        return Err(ReplegarError::invalid_topology("spec has no stages"));
    }
    if spec.num_blocks.contains(&0) {
        return Err(ReplegarError::invalid_topology(
            "every stage needs at least one block",
        ));
    }
    if spec.stem_channels == 0 || spec.branch_size == 0 {
        return Err(ReplegarError::invalid_topology(
            "stem_channels and branch_size must be at least 1",
        ));
    }

    // Each unit gets a well-separated slice of the seed space so the
    // two modes (and repeated assemblies) stay deterministic.
    let make_unit = |index: usize,
                     topology: UnitTopology,
                     branch_size: usize,
                     has_skip: bool,
                     has_scale: bool|
     -> Result<Unit> {
        let seed = config.seed.map(|s| s.wrapping_add(index as u64 * 10_000));
        match mode {
            Mode::Training => Unit::training(topology, branch_size, has_skip, has_scale, seed),
            Mode::Inference => Unit::inference(topology, seed),
        }
    };

    let mut features: Vec<(String, usize)> = Vec::new();
    let mut next_index: usize = 0;

    // Stem: 3x3, stride 2, single branch.
    let stem = make_unit(
        next_index,
        UnitTopology {
            name: "stem".to_string(),
            in_channels: IMAGE_CHANNELS,
            out_channels: spec.stem_channels,
            kernel_size: 3,
            stride: 2,
            groups: 1,
            activation: Activation::ReLU,
        },
        1,
        false,
        true,
    )?;
    next_index += 1;
    features.push(("STEM_S2".to_string(), 0));

    // Stages: each block is a depthwise unit followed by a pointwise
    // channel-expanding unit. The first block of a stage downsamples.
    let mut in_channels = spec.stem_channels;
    let mut cumulative_stride = 2;
    let mut stages = Vec::with_capacity(spec.num_blocks.len());

    for (stage_idx, (&channels, &blocks)) in spec
        .num_channels
        .iter()
        .zip(spec.num_blocks.iter())
        .enumerate()
    {
        cumulative_stride *= 2;
        let mut units = Vec::with_capacity(blocks * 2);

        for block_idx in 0..blocks {
            let stride = if block_idx == 0 { 2 } else { 1 };

            // Depthwise: skip only where the spatial shape is kept.
            units.push(make_unit(
                next_index,
                UnitTopology {
                    name: format!("stages_{stage_idx}_{}", block_idx * 2),
                    in_channels,
                    out_channels: in_channels,
                    kernel_size: 3,
                    stride,
                    groups: in_channels,
                    activation: Activation::ReLU,
                },
                spec.branch_size,
                stride == 1,
                true,
            )?);
            next_index += 1;

            // Pointwise: skip only where the width is kept; no 1x1
            // scale branch on top of 1x1 main branches.
            units.push(make_unit(
                next_index,
                UnitTopology {
                    name: format!("stages_{stage_idx}_{}", block_idx * 2 + 1),
                    in_channels,
                    out_channels: channels,
                    kernel_size: 1,
                    stride: 1,
                    groups: 1,
                    activation: Activation::ReLU,
                },
                spec.branch_size,
                in_channels == channels,
                false,
            )?);
            next_index += 1;

            in_channels = channels;
        }

        features.push((
            format!("BLOCK{stage_idx}_S{cumulative_stride}"),
            next_index - 1,
        ));
        stages.push(Stage::new(channels, units));
    }

    let head = Head::new(
        in_channels,
        config.include_top.then_some(config.classes),
        config.seed.map(|s| s.wrapping_add(u64::MAX / 2)),
    );

    Ok(Model::from_parts(
        spec.clone(),
        config.clone(),
        mode,
        stem,
        stages,
        head,
        features,
    ))
}
