//! All-or-nothing weight transfer between topology-equal models.
//!
//! Transfer is the bridge between the two model forms: a trained
//! multi-branch model on one side, a fused single-branch model on the
//! other. Each source unit is folded down to one operator and the
//! results are written into the target only after every unit has been
//! validated, so a failed transfer never leaves the target partially
//! overwritten.

use rayon::prelude::*;

use crate::error::{ReplegarError, Result};
use crate::model::Model;
use crate::reparam::{fuse, AffineOperator, UnitState};

/// Transfer the weights of `source` into `target`, fusing multi-branch
/// units along the way.
///
/// `target` must be a fused (inference-form) model with unit-for-unit
/// identical topology. Units of `source` that are already fused are
/// copied as-is; multi-branch units are fused first. The head
/// classifier is copied verbatim when both models carry one.
///
/// On error the target is untouched: validation and fusion both run to
/// completion before the first write.
///
/// # Errors
///
/// - [`ReplegarError::TopologyMismatch`] if the models disagree on
///   unit count, any unit's topology, or the classifier shape.
/// - [`ReplegarError::IncompatibleRequest`] if the target has
///   unfused units, or exactly one of the models carries a classifier.
/// - Fusion errors from corrupt source weights propagate unchanged.
pub fn transfer(source: &Model, target: &mut Model) -> Result<()> {
    let source_units = source.units();

    if source_units.len() != target.num_units() {
        return Err(ReplegarError::topology_mismatch(
            format!("{} units", source_units.len()),
            format!("{} units", target.num_units()),
        ));
    }
    for (s, t) in source_units.iter().zip(target.units()) {
        if s.topology() != t.topology() {
            return Err(ReplegarError::topology_mismatch(
                s.topology().describe(),
                t.topology().describe(),
            ));
        }
        if !t.is_fused() {
            return Err(ReplegarError::IncompatibleRequest {
                message: format!(
                    "transfer target unit '{}' is in the multi-branch form; \
                     assemble the target in inference mode",
                    t.name()
                ),
            });
        }
    }

    match (source.head().classifier(), target.head().classifier()) {
        (Some(s), Some(t)) => {
            if s.weight().shape() != t.weight().shape() {
                return Err(ReplegarError::topology_mismatch(
                    format!("classifier weight {:?}", s.weight().shape()),
                    format!("{:?}", t.weight().shape()),
                ));
            }
        }
        (None, None) => {}
        (s, _) => {
            let (with, without) = if s.is_some() {
                ("source", "target")
            } else {
                ("target", "source")
            };
            return Err(ReplegarError::IncompatibleRequest {
                message: format!(
                    "{with} model has a classifier head but the {without} does not"
                ),
            });
        }
    }

    // Fusion is independent per unit.
    let fused: Vec<AffineOperator> = source_units
        .par_iter()
        .map(|unit| match unit.state() {
            UnitState::Training(bs) => fuse(bs),
            UnitState::Inference(op) => Ok(op.clone()),
        })
        .collect::<Result<Vec<_>>>()?;

    // Topology equality does not guarantee the source weights are
    // intact: a branch kernel replaced with a wrong spatial size fuses
    // fine but produces the wrong shape. Check every fused result
    // against the target before touching it.
    for (op, t) in fused.iter().zip(target.units()) {
        if let Some(dst) = t.fused() {
            if dst.kernel().shape() != op.kernel().shape() {
                return Err(ReplegarError::topology_mismatch(
                    format!("fused kernel {:?} for unit '{}'", dst.kernel().shape(), t.name()),
                    format!("{:?}", op.kernel().shape()),
                ));
            }
        }
    }

    for (op, t) in fused.into_iter().zip(target.units_mut()) {
        let dst = t
            .fused_mut()
            .ok_or_else(|| ReplegarError::IncompatibleRequest {
                message: "transfer target unit lost its fused form".to_string(),
            })?;
        dst.set_kernel(op.kernel().clone())?;
        dst.set_bias(op.bias().clone())?;
    }

    let head_params = source
        .head()
        .classifier()
        .map(|l| (l.weight().clone(), l.bias().clone()));
    if let (Some((weight, bias)), Some(classifier)) =
        (head_params, target.head_mut().classifier_mut())
    {
        classifier.assign(&weight, &bias)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{assemble, AssembleConfig, Mode, VariantSpec};
    use crate::nn::init::uniform;
    use crate::tensor::Tensor;

    fn tiny_spec() -> VariantSpec {
        VariantSpec {
            num_blocks: vec![1, 1],
            num_channels: vec![4, 8],
            stem_channels: 4,
            branch_size: 2,
        }
    }

    fn tiny_config() -> AssembleConfig {
        AssembleConfig {
            classes: 3,
            include_top: true,
            weights: None,
            seed: Some(17),
        }
    }

    fn pair() -> (Model, Model) {
        let source = assemble(&tiny_spec(), Mode::Training, &tiny_config()).unwrap();
        let target = assemble(&tiny_spec(), Mode::Inference, &tiny_config()).unwrap();
        (source, target)
    }

    #[test]
    fn test_transfer_preserves_function() {
        let (source, mut target) = pair();
        transfer(&source, &mut target).unwrap();

        let x = uniform(&[1, 3, 16, 16], -1.0, 1.0, Some(5));
        let before = source.forward(&x);
        let after = target.forward(&x);
        assert_eq!(before.shape(), after.shape());
        assert!(before.max_abs_diff(&after) < 1e-4);
    }

    #[test]
    fn test_transfer_copies_classifier() {
        let (source, mut target) = pair();
        transfer(&source, &mut target).unwrap();
        assert_eq!(
            source.head().classifier().unwrap().weight(),
            target.head().classifier().unwrap().weight()
        );
    }

    #[test]
    fn test_unit_count_mismatch_rejected() {
        let source = assemble(&tiny_spec(), Mode::Training, &tiny_config()).unwrap();
        let mut other_spec = tiny_spec();
        other_spec.num_blocks = vec![1, 2];
        let mut target = assemble(&other_spec, Mode::Inference, &tiny_config()).unwrap();

        let err = transfer(&source, &mut target).unwrap_err();
        assert!(matches!(err, ReplegarError::TopologyMismatch { .. }));
    }

    #[test]
    fn test_channel_mismatch_rejected() {
        let source = assemble(&tiny_spec(), Mode::Training, &tiny_config()).unwrap();
        let mut other_spec = tiny_spec();
        other_spec.num_channels = vec![4, 16];
        let mut target = assemble(&other_spec, Mode::Inference, &tiny_config()).unwrap();

        let err = transfer(&source, &mut target).unwrap_err();
        assert!(matches!(err, ReplegarError::TopologyMismatch { .. }));
    }

    #[test]
    fn test_unfused_target_rejected() {
        let source = assemble(&tiny_spec(), Mode::Training, &tiny_config()).unwrap();
        let mut target = assemble(&tiny_spec(), Mode::Training, &tiny_config()).unwrap();

        let err = transfer(&source, &mut target).unwrap_err();
        assert!(matches!(err, ReplegarError::IncompatibleRequest { .. }));
    }

    #[test]
    fn test_classifier_presence_mismatch_rejected() {
        let source = assemble(&tiny_spec(), Mode::Training, &tiny_config()).unwrap();
        let mut headless = tiny_config();
        headless.include_top = false;
        let mut target = assemble(&tiny_spec(), Mode::Inference, &headless).unwrap();

        let err = transfer(&source, &mut target).unwrap_err();
        assert!(matches!(err, ReplegarError::IncompatibleRequest { .. }));
    }

    #[test]
    fn test_failed_transfer_leaves_target_untouched() {
        let (mut source, mut target) = pair();

        // Corrupt one source branch with a wrong spatial size. The
        // branch still fuses, but the fused kernel no longer matches
        // the target.
        let units = source.units_mut();
        let bad = units.into_iter().nth(2).unwrap();
        let bs = bad.branch_set_mut().unwrap();
        let out = bs.out_channels();
        let in_per_group = bs.in_channels() / bs.groups();
        bs.branches_mut()[0]
            .set_kernel(Tensor::zeros(&[out, in_per_group, 5, 5]))
            .unwrap();

        let snapshot: Vec<Tensor> = target
            .units()
            .iter()
            .map(|u| u.fused().unwrap().kernel().clone())
            .collect();

        let err = transfer(&source, &mut target).unwrap_err();
        assert!(matches!(err, ReplegarError::TopologyMismatch { .. }));

        for (unit, old) in target.units().iter().zip(&snapshot) {
            assert_eq!(unit.fused().unwrap().kernel(), old);
        }
    }
}
