//! One reparameterizable building block.

use crate::error::{ReplegarError, Result};
use crate::nn::{Activation, Module};
use crate::reparam::branch::BranchSet;
use crate::reparam::fuse::fuse;
use crate::reparam::operator::{AffineOperator, NormStats};
use crate::tensor::Tensor;

/// The static topology of a unit.
///
/// These fields never change across the training/inference rewrite;
/// weight transfer requires them to agree exactly between source and
/// target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitTopology {
    /// Unit name, unique within a model
    pub name: String,
    /// Input channel count
    pub in_channels: usize,
    /// Output channel count
    pub out_channels: usize,
    /// Spatial kernel size of the main branches
    pub kernel_size: usize,
    /// Spatial stride
    pub stride: usize,
    /// Convolution groups (`in_channels` for depthwise)
    pub groups: usize,
    /// Activation applied after the linear part
    pub activation: Activation,
}

impl UnitTopology {
    /// Compact description for error messages.
    #[must_use]
    pub fn describe(&self) -> String {
        format!(
            "{} ({}->{}ch, k{}, s{}, g{}, {:?})",
            self.name,
            self.in_channels,
            self.out_channels,
            self.kernel_size,
            self.stride,
            self.groups,
            self.activation
        )
    }
}

/// The two computational forms a unit can take.
#[derive(Debug, Clone)]
pub enum UnitState {
    /// Multi-branch form used during training
    Training(BranchSet),
    /// Single fused operator used at inference time
    Inference(AffineOperator),
}

/// A reparameterizable unit: static topology plus either a branch set
/// or a fused operator.
///
/// Both forms expose the same forward contract; for equal topology and
/// correctly fused weights they compute the same function within
/// floating-point tolerance.
#[derive(Debug, Clone)]
pub struct Unit {
    topology: UnitTopology,
    state: UnitState,
}

impl Unit {
    /// Build a unit in the multi-branch training form.
    ///
    /// The branch set consists of `branch_size` convolutions at the
    /// unit's kernel size, plus a 1x1 "scale" branch when
    /// `has_scale` is set and the kernel size exceeds 1, plus a
    /// normalized identity path when `has_skip` is set.
    ///
    /// # Errors
    ///
    /// Returns [`ReplegarError::InvalidTopology`] if `branch_size` is
    /// zero, the channel counts don't divide into groups, or a skip is
    /// requested with `stride != 1` or `in_channels != out_channels`.
    pub fn training(
        topology: UnitTopology,
        branch_size: usize,
        has_skip: bool,
        has_scale: bool,
        seed: Option<u64>,
    ) -> Result<Self> {
        if branch_size == 0 {
            return Err(ReplegarError::invalid_topology(format!(
                "unit '{}' requests zero branches",
                topology.name
            )));
        }
        if has_skip && (topology.stride != 1 || topology.in_channels != topology.out_channels) {
            return Err(ReplegarError::invalid_topology(format!(
                "unit '{}' requests a skip path with stride {} and {}->{} channels",
                topology.name, topology.stride, topology.in_channels, topology.out_channels
            )));
        }

        let mut branches = Vec::with_capacity(branch_size + 1);
        for i in 0..branch_size {
            branches.push(AffineOperator::random(
                topology.in_channels,
                topology.out_channels,
                topology.kernel_size,
                topology.stride,
                topology.groups,
                true,
                seed.map(|s| s.wrapping_add(i as u64)),
            )?);
        }
        if has_scale && topology.kernel_size > 1 {
            branches.push(AffineOperator::random(
                topology.in_channels,
                topology.out_channels,
                1,
                topology.stride,
                topology.groups,
                true,
                seed.map(|s| s.wrapping_add(1009)),
            )?);
        }
        let skip_norm = has_skip.then(|| NormStats::fresh(topology.out_channels));
        let branch_set = BranchSet::new(branches, has_skip, skip_norm)?;

        Ok(Self {
            topology,
            state: UnitState::Training(branch_set),
        })
    }

    /// Build a unit in the fused inference form, with freshly
    /// initialized (untrained) weights.
    ///
    /// # Errors
    ///
    /// Returns [`ReplegarError::InvalidTopology`] on inconsistent
    /// channel/group counts.
    pub fn inference(topology: UnitTopology, seed: Option<u64>) -> Result<Self> {
        let fused = AffineOperator::random(
            topology.in_channels,
            topology.out_channels,
            topology.kernel_size,
            topology.stride,
            topology.groups,
            false,
            seed,
        )?;
        Ok(Self {
            topology,
            state: UnitState::Inference(fused),
        })
    }

    /// The unit's static topology.
    #[must_use]
    pub fn topology(&self) -> &UnitTopology {
        &self.topology
    }

    /// The unit's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.topology.name
    }

    /// The current computational form.
    #[must_use]
    pub fn state(&self) -> &UnitState {
        &self.state
    }

    /// Whether the unit is in the fused inference form.
    #[must_use]
    pub fn is_fused(&self) -> bool {
        matches!(self.state, UnitState::Inference(_))
    }

    /// The branch set, if in training form.
    #[must_use]
    pub fn branch_set(&self) -> Option<&BranchSet> {
        match &self.state {
            UnitState::Training(bs) => Some(bs),
            UnitState::Inference(_) => None,
        }
    }

    /// Mutable branch set, e.g. for weight loading.
    pub fn branch_set_mut(&mut self) -> Option<&mut BranchSet> {
        match &mut self.state {
            UnitState::Training(bs) => Some(bs),
            UnitState::Inference(_) => None,
        }
    }

    /// The fused operator, if in inference form.
    #[must_use]
    pub fn fused(&self) -> Option<&AffineOperator> {
        match &self.state {
            UnitState::Training(_) => None,
            UnitState::Inference(op) => Some(op),
        }
    }

    /// Mutable fused operator, e.g. for weight transfer.
    pub fn fused_mut(&mut self) -> Option<&mut AffineOperator> {
        match &mut self.state {
            UnitState::Training(_) => None,
            UnitState::Inference(op) => Some(op),
        }
    }

    /// Rewrite this unit into its fused inference form, preserving all
    /// static topology fields.
    ///
    /// # Errors
    ///
    /// Returns [`ReplegarError::AlreadyFused`] if the unit is already
    /// in the inference form, or an [`ReplegarError::InvalidTopology`]
    /// bubbled up from the fusion engine.
    pub fn into_inference(self) -> Result<Self> {
        match self.state {
            UnitState::Inference(_) => Err(ReplegarError::AlreadyFused {
                unit: self.topology.name,
            }),
            UnitState::Training(ref bs) => {
                let fused = fuse(bs)?;
                Ok(Self {
                    topology: self.topology,
                    state: UnitState::Inference(fused),
                })
            }
        }
    }
}

impl Module for Unit {
    /// Forward pass: dispatches on the unit's form, then applies the
    /// activation.
    fn forward(&self, input: &Tensor) -> Tensor {
        let linear = match &self.state {
            UnitState::Training(bs) => bs.forward(input),
            UnitState::Inference(op) => op.apply(input),
        };
        self.topology.activation.apply(&linear)
    }
}
