//! End-to-end tests: assemble a backbone, fold it for inference, and
//! check the two forms agree.

use replegar::prelude::*;

fn tiny_spec() -> VariantSpec {
    VariantSpec {
        num_blocks: vec![1, 2],
        num_channels: vec![4, 8],
        stem_channels: 4,
        branch_size: 2,
    }
}

fn tiny_config() -> AssembleConfig {
    AssembleConfig {
        classes: 5,
        include_top: true,
        weights: None,
        seed: Some(1234),
    }
}

fn random_image(seed: u64) -> Tensor {
    replegar::nn::init::uniform(&[2, 3, 32, 32], -1.0, 1.0, Some(seed))
}

#[test]
fn folded_model_matches_training_model() {
    let trained = assemble(&tiny_spec(), Mode::Training, &tiny_config()).unwrap();
    let deployed = trained.get_reparameterized_model().unwrap();
    assert_eq!(deployed.mode(), Mode::Inference);

    let x = random_image(7);
    let before = trained.forward(&x);
    let after = deployed.forward(&x);

    assert_eq!(before.shape(), &[2, 5]);
    assert_eq!(before.shape(), after.shape());
    assert!(
        before.max_abs_diff(&after) < 1e-4,
        "outputs diverged by {}",
        before.max_abs_diff(&after)
    );
}

#[test]
fn folding_leaves_the_source_untouched() {
    let trained = assemble(&tiny_spec(), Mode::Training, &tiny_config()).unwrap();
    let x = random_image(11);
    let before = trained.forward(&x);

    let _ = trained.get_reparameterized_model().unwrap();

    let after = trained.forward(&x);
    assert_eq!(before, after);
    assert_eq!(trained.mode(), Mode::Training);
}

#[test]
fn feature_checkpoints_follow_the_downsampling_schedule() {
    let trained = assemble(&tiny_spec(), Mode::Training, &tiny_config()).unwrap();
    assert_eq!(
        trained.feature_keys(),
        vec!["STEM_S2", "BLOCK0_S4", "BLOCK1_S8"]
    );

    let x = random_image(3);
    let (logits, taps) = trained.forward_features(&x, None).unwrap();
    assert_eq!(logits.shape(), &[2, 5]);

    let shapes: Vec<(&str, &[usize])> = taps
        .iter()
        .map(|(name, t)| (name.as_str(), t.shape()))
        .collect();
    assert_eq!(
        shapes,
        vec![
            ("STEM_S2", &[2, 4, 16, 16][..]),
            ("BLOCK0_S4", &[2, 4, 8, 8][..]),
            ("BLOCK1_S8", &[2, 8, 4, 4][..]),
        ]
    );
}

#[test]
fn feature_selection_keeps_traversal_order() {
    let trained = assemble(&tiny_spec(), Mode::Training, &tiny_config()).unwrap();
    let x = random_image(9);

    // Request order must not matter.
    let (_, taps) = trained
        .forward_features(&x, Some(&["BLOCK1_S8", "STEM_S2"]))
        .unwrap();
    let names: Vec<&str> = taps.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, vec!["STEM_S2", "BLOCK1_S8"]);
}

#[test]
fn unknown_feature_key_is_rejected_before_compute() {
    let trained = assemble(&tiny_spec(), Mode::Training, &tiny_config()).unwrap();
    let x = random_image(2);

    let err = trained
        .forward_features(&x, Some(&["STEM_S2", "BLOCK7_S64"]))
        .unwrap_err();
    assert!(matches!(err, ReplegarError::UnknownFeatureKey { ref key } if key == "BLOCK7_S64"));
    assert!(err.to_string().contains("BLOCK7_S64"));
}

#[test]
fn folded_features_match_training_features() {
    let trained = assemble(&tiny_spec(), Mode::Training, &tiny_config()).unwrap();
    let deployed = trained.get_reparameterized_model().unwrap();
    assert_eq!(trained.feature_keys(), deployed.feature_keys());

    let x = random_image(13);
    let (_, taps_a) = trained.forward_features(&x, None).unwrap();
    let (_, taps_b) = deployed.forward_features(&x, None).unwrap();

    for ((name_a, tap_a), (name_b, tap_b)) in taps_a.iter().zip(&taps_b) {
        assert_eq!(name_a, name_b);
        assert!(tap_a.max_abs_diff(tap_b) < 1e-4);
    }
}

#[test]
fn pretrained_request_requires_training_mode() {
    let mut config = tiny_config();
    config.weights = pretrained("s0");
    assert!(config.weights.is_some());

    let err = assemble(&tiny_spec(), Mode::Inference, &config).unwrap_err();
    assert!(matches!(err, ReplegarError::IncompatibleRequest { .. }));

    assert!(assemble(&tiny_spec(), Mode::Training, &config).is_ok());
}

#[test]
fn named_variants_assemble_in_both_modes() {
    // Full ImageNet variants are too large for a forward pass here;
    // assembling them still exercises the whole topology path.
    for name in VARIANT_NAMES {
        let spec = variant(name).unwrap();
        let config = AssembleConfig {
            seed: Some(0),
            ..AssembleConfig::default()
        };
        let trained = assemble(&spec, Mode::Training, &config).unwrap();
        let fused = assemble(&spec, Mode::Inference, &config).unwrap();
        assert_eq!(trained.num_units(), fused.num_units());
        assert_eq!(
            trained.feature_keys(),
            vec!["STEM_S2", "BLOCK0_S4", "BLOCK1_S8", "BLOCK2_S16", "BLOCK3_S32"]
        );
    }
}

#[test]
fn headless_backbone_returns_pooled_features() {
    let config = AssembleConfig {
        include_top: false,
        ..tiny_config()
    };
    let model = assemble(&tiny_spec(), Mode::Training, &config).unwrap();
    assert!(model.head().classifier().is_none());

    let x = random_image(21);
    let pooled = model.forward(&x);
    assert_eq!(pooled.shape(), &[2, 8]);
}

#[test]
fn variant_spec_survives_serialization() {
    let spec = variant("s0").unwrap();
    let json = serde_json::to_string_pretty(&spec).unwrap();
    let back: VariantSpec = serde_json::from_str(&json).unwrap();
    assert_eq!(spec, back);
    assert_eq!(back.branch_size, 4);
}
