//! Backbone models: stages, the classification head, and the
//! feature-extraction surface.

mod assemble;
mod transfer;

pub use assemble::{assemble, pretrained, variant, AssembleConfig, VariantSpec, WeightsDescriptor, VARIANT_NAMES};
pub use transfer::transfer;

use crate::error::{ReplegarError, Result};
use crate::nn::{GlobalAvgPool2d, Linear, Module};
use crate::reparam::Unit;
use crate::tensor::Tensor;

/// Whether a model is built in the multi-branch training form or the
/// fused inference form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Multi-branch units, richer gradient paths
    Training,
    /// Single-branch fused units, minimal inference latency
    Inference,
}

/// A group of units sharing an output channel width.
#[derive(Debug)]
pub struct Stage {
    channels: usize,
    units: Vec<Unit>,
}

impl Stage {
    pub(crate) fn new(channels: usize, units: Vec<Unit>) -> Self {
        Self { channels, units }
    }

    /// Output channel width of the stage.
    #[must_use]
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// The units of the stage, in execution order.
    #[must_use]
    pub fn units(&self) -> &[Unit] {
        &self.units
    }
}

/// Classification head: global average pooling plus an optional linear
/// classifier.
#[derive(Debug)]
pub struct Head {
    pool: GlobalAvgPool2d,
    classifier: Option<Linear>,
}

impl Head {
    pub(crate) fn new(in_features: usize, classes: Option<usize>, seed: Option<u64>) -> Self {
        Self {
            pool: GlobalAvgPool2d::new(),
            classifier: classes.map(|c| Linear::with_seed(in_features, c, seed)),
        }
    }

    /// The classifier layer, if the head was built with one.
    #[must_use]
    pub fn classifier(&self) -> Option<&Linear> {
        self.classifier.as_ref()
    }

    /// Mutable classifier, e.g. for weight loading.
    pub fn classifier_mut(&mut self) -> Option<&mut Linear> {
        self.classifier.as_mut()
    }

    /// Pool (and classify, when a classifier is present) the final
    /// feature map.
    #[must_use]
    pub fn forward(&self, input: &Tensor) -> Tensor {
        let pooled = self.pool.forward(input);
        match &self.classifier {
            Some(linear) => linear.forward(&pooled),
            None => pooled,
        }
    }
}

/// A full backbone: stem unit, stages, head, and named feature
/// checkpoints.
///
/// The feature map holds indices into the flat unit sequence (stem is
/// index 0); insertion order matches traversal order and keys are
/// unique.
#[derive(Debug)]
pub struct Model {
    spec: VariantSpec,
    config: AssembleConfig,
    mode: Mode,
    stem: Unit,
    stages: Vec<Stage>,
    head: Head,
    features: Vec<(String, usize)>,
}

impl Model {
    pub(crate) fn from_parts(
        spec: VariantSpec,
        config: AssembleConfig,
        mode: Mode,
        stem: Unit,
        stages: Vec<Stage>,
        head: Head,
        features: Vec<(String, usize)>,
    ) -> Self {
        Self {
            spec,
            config,
            mode,
            stem,
            stages,
            head,
            features,
        }
    }

    /// The hyperparameters this model was assembled from.
    #[must_use]
    pub fn spec(&self) -> &VariantSpec {
        &self.spec
    }

    /// The model's form (training or inference).
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// The stages, in execution order.
    #[must_use]
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// The classification head.
    #[must_use]
    pub fn head(&self) -> &Head {
        &self.head
    }

    /// Mutable classification head.
    pub fn head_mut(&mut self) -> &mut Head {
        &mut self.head
    }

    /// Number of units in the flat sequence (stem included).
    #[must_use]
    pub fn num_units(&self) -> usize {
        1 + self.stages.iter().map(|s| s.units.len()).sum::<usize>()
    }

    /// The flat unit sequence: stem first, then every stage in order.
    #[must_use]
    pub fn units(&self) -> Vec<&Unit> {
        let mut units = Vec::with_capacity(self.num_units());
        units.push(&self.stem);
        for stage in &self.stages {
            units.extend(stage.units.iter());
        }
        units
    }

    /// Mutable flat unit sequence.
    pub fn units_mut(&mut self) -> Vec<&mut Unit> {
        let mut units: Vec<&mut Unit> = vec![&mut self.stem];
        for stage in &mut self.stages {
            units.extend(stage.units.iter_mut());
        }
        units
    }

    /// Feature checkpoint keys, in traversal order.
    #[must_use]
    pub fn feature_keys(&self) -> Vec<&str> {
        self.features.iter().map(|(k, _)| k.as_str()).collect()
    }

    /// Run the full forward pass, returning the head output.
    #[must_use]
    pub fn forward(&self, input: &Tensor) -> Tensor {
        let mut x = input.clone();
        for unit in self.units() {
            x = unit.forward(&x);
        }
        self.head.forward(&x)
    }

    /// Run the forward pass and also return named feature checkpoints.
    ///
    /// When `keys` is given, only the selected features are returned
    /// (still in traversal order); otherwise all checkpoints are.
    ///
    /// # Errors
    ///
    /// Returns [`ReplegarError::UnknownFeatureKey`] before any compute
    /// if a selected key is not exposed by this model.
    pub fn forward_features(
        &self,
        input: &Tensor,
        keys: Option<&[&str]>,
    ) -> Result<(Tensor, Vec<(String, Tensor)>)> {
        if let Some(keys) = keys {
            for key in keys {
                if !self.features.iter().any(|(name, _)| name == key) {
                    return Err(ReplegarError::UnknownFeatureKey {
                        key: (*key).to_string(),
                    });
                }
            }
        }

        let selected: Vec<&(String, usize)> = self
            .features
            .iter()
            .filter(|(name, _)| keys.map_or(true, |ks| ks.contains(&name.as_str())))
            .collect();

        let mut x = input.clone();
        let mut taps = Vec::with_capacity(selected.len());
        for (i, unit) in self.units().iter().enumerate() {
            x = unit.forward(&x);
            if let Some((name, _)) = selected.iter().find(|(_, idx)| *idx == i) {
                taps.push((name.clone(), x.clone()));
            }
        }

        Ok((self.head.forward(&x), taps))
    }

    /// Assemble the fused inference twin of this model and transfer
    /// the weights into it.
    ///
    /// # Errors
    ///
    /// Propagates assembly and transfer errors; this model is left
    /// untouched either way.
    pub fn get_reparameterized_model(&self) -> Result<Model> {
        let mut config = self.config.clone();
        config.weights = None;
        let mut target = assemble(&self.spec, Mode::Inference, &config)?;
        transfer(self, &mut target)?;
        Ok(target)
    }
}
