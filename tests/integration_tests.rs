use anyhow::Result;
use approx::assert_relative_eq;
use libtest_mimic::{Arguments, Trial};
use ndarray::{Array, Array4};
use rand::{rngs::StdRng, Rng, SeedableRng};
use vesselseg::{
    dataset::Dataset,
    error::Error,
    learn::{
        criterion::{Criterion, Target, WeightedCrossEntropy},
        neural_network::{
            backbone::{Backbone, BackboneConfig, EncoderSource},
            layer::Activation,
            registry::{LayerParams, LayerParamsRegistry},
            topology::{NetworkTopology, StageDef},
            Network, NetworkBuilder,
        },
    },
};

fn main() {
    let args = Arguments::from_args();
    let _ = env_logger::builder().is_test(true).try_init();
    let tests = registry_tests()
        .into_iter()
        .chain(assembly_tests())
        .chain(objective_tests())
        .chain(network_tests())
        .collect();
    libtest_mimic::run(&args, tests).exit()
}

fn error_of(result: Result<impl std::fmt::Debug>) -> Error {
    result
        .unwrap_err()
        .downcast_ref::<Error>()
        .cloned()
        .unwrap()
}

fn registry_tests() -> Vec<Trial> {
    vec![
        Trial::test("merge_is_idempotent", || {
            merge_is_idempotent();
            Ok(())
        }),
        Trial::test("merge_rejects_unknown_stage", || {
            merge_rejects_unknown_stage();
            Ok(())
        }),
    ]
}

fn merge_is_idempotent() {
    let overrides: LayerParamsRegistry = serde_json::from_str(
        r#"{
            "conv_1_1": {"ks": 5, "dilation": 2},
            "conv_4_1": {"output_channels": 1024, "keep_prob": 0.5},
            "pool_3": {"add_to_input": false}
        }"#,
    )
    .unwrap();
    for topology in [NetworkTopology::small(), NetworkTopology::large()] {
        let defaults = topology.defaults();
        let once = defaults.merge(&overrides).unwrap();
        let twice = once.merge(&overrides).unwrap();
        assert_eq!(once, twice);
        let conv = once.get("conv_1_1").unwrap();
        assert_eq!(conv.kernel_size, Some(5));
        assert_eq!(conv.dilation, Some(2));
        // Fields that are not overridden keep their defaults.
        assert_eq!(conv.output_channels, Some(64));
        assert_eq!(conv.batch_norm, Some(true));
        for (name, params) in defaults.iter() {
            if overrides.get(name).is_none() {
                assert_eq!(once.get(name), Some(params));
            }
        }
    }
}

fn merge_rejects_unknown_stage() {
    let overrides = LayerParamsRegistry::new().with("conv_9_9", LayerParams::conv(3, 8));
    let error = error_of(NetworkTopology::small().defaults().merge(&overrides));
    assert!(error.is_configuration());
    let error = error_of(
        Network::builder()
            .layer_params(overrides)
            .build()
            .map(|network| network.description()),
    );
    assert!(error.is_configuration());
}

fn assembly_tests() -> Vec<Trial> {
    vec![
        Trial::test("assembly_is_deterministic", || {
            assembly_is_deterministic();
            Ok(())
        }),
        Trial::test("pool_unpool_restores_shape", || {
            pool_unpool_restores_shape();
            Ok(())
        }),
        Trial::test("skip_channel_mismatch", || {
            skip_channel_mismatch();
            Ok(())
        }),
        Trial::test("description_skips_pools", || {
            description_skips_pools();
            Ok(())
        }),
        Trial::test("dataset_families_restore_fit_shape", || {
            dataset_families_restore_fit_shape();
            Ok(())
        }),
    ]
}

fn assembly_is_deterministic() {
    for dataset in Dataset::ALL {
        let topology = dataset.topology();
        let a = topology
            .assemble(dataset.fit_shape(), Activation::default())
            .unwrap();
        let b = topology
            .assemble(dataset.fit_shape(), Activation::default())
            .unwrap();
        assert_eq!(a, b, "{dataset}");
    }
    let a = tiny_builder().build().unwrap().checkpoint().unwrap();
    let b = tiny_builder().build().unwrap().checkpoint().unwrap();
    let a = serde_json::to_value(&a).unwrap();
    let b = serde_json::to_value(&b).unwrap();
    assert_eq!(a, b);
}

fn pool_unpool_topology() -> NetworkTopology {
    let defaults = [("pool_1", LayerParams::pool(2)), ("up_1", LayerParams::pool(2))]
        .into_iter()
        .collect();
    NetworkTopology::new(
        "pool_unpool",
        vec![StageDef::pool("pool_1")],
        vec![StageDef::unpool("up_1")],
        defaults,
    )
}

fn pool_unpool_restores_shape() {
    let mut rng = StdRng::seed_from_u64(0);
    for (height, width) in [(256, 256), (255, 129), (7, 3), (2, 2)] {
        let mut network = Network::builder()
            .topology(pool_unpool_topology())
            .input_shape(height, width)
            .build()
            .unwrap();
        let images = Array4::from_shape_simple_fn([1, height, width, 1], || rng.gen::<f32>());
        let predictions = network.predict(images.view()).unwrap();
        assert_eq!(predictions.shape(), &[1, height, width, 1]);
        let pooled = &network.layer_outputs()[0].1;
        assert_eq!(pooled.shape(), &[1, height / 2, width / 2, 1]);
    }
}

fn skip_channel_mismatch() {
    let defaults = [
        ("conv_1", LayerParams::conv(3, 8)),
        ("pool_1", LayerParams::pool(2).with_skip(true)),
        ("conv_2", LayerParams::conv(3, 16)),
        ("up_1", LayerParams::pool(2).with_skip(true)),
        ("convt_1", LayerParams::conv(3, 1)),
    ]
    .into_iter()
    .collect();
    let topology = NetworkTopology::new(
        "mismatch",
        vec![
            StageDef::conv("conv_1"),
            StageDef::pool("pool_1"),
            StageDef::conv("conv_2"),
        ],
        vec![StageDef::unpool("up_1"), StageDef::conv_transpose("convt_1")],
        defaults,
    );
    let error = error_of(
        Network::builder()
            .topology(topology)
            .input_shape(64, 64)
            .build()
            .map(|network| network.description()),
    );
    assert!(error.is_shape(), "{error:?}");
}

fn description_skips_pools() {
    let defaults = [
        ("conv_1", LayerParams::conv(3, 64)),
        ("pool_1", LayerParams::pool(2)),
        ("conv_2", LayerParams::conv(3, 128)),
    ]
    .into_iter()
    .collect();
    let topology = NetworkTopology::new(
        "described",
        vec![
            StageDef::conv("conv_1"),
            StageDef::pool("pool_1"),
            StageDef::conv("conv_2"),
        ],
        vec![],
        defaults,
    );
    let assembly = topology.assemble([32, 32, 1], Activation::Relu).unwrap();
    assert_eq!(assembly.description(), "C3,64,1C3,128,1");
}

fn dataset_families_restore_fit_shape() {
    for dataset in [Dataset::Drive, Dataset::Stare, Dataset::Chase] {
        let assembly = dataset
            .topology()
            .assemble(dataset.fit_shape(), Activation::default())
            .unwrap();
        assert_eq!(assembly.output_shape(), dataset.fit_shape(), "{dataset}");
    }
    let assembly = Dataset::Dsa
        .topology()
        .assemble(Dataset::Dsa.fit_shape(), Activation::default())
        .unwrap();
    assert_eq!(assembly.output_shape(), [1024, 1024, 1]);
    assert!(assembly
        .decoder()
        .iter()
        .filter(|stage| stage.spec().kind.to_string() == "unpool")
        .all(|stage| stage.spec().skip));
}

fn objective_tests() -> Vec<Trial> {
    vec![Trial::test("weighted_cross_entropy_scales_positives", || {
        weighted_cross_entropy_scales_positives();
        Ok(())
    })]
}

fn weighted_cross_entropy_scales_positives() {
    let mut rng = StdRng::seed_from_u64(1);
    let logits = Array::from_shape_simple_fn([2, 5, 7, 1], || rng.gen_range(-6f32..6.));
    let truth = Array4::<f32>::ones(logits.raw_dim());
    let target = Target::new(truth.view());
    let unweighted = WeightedCrossEntropy::new(1.)
        .unwrap()
        .eval(logits.view(), &target)
        .unwrap();
    for c in [0.5f32, 2., 10.] {
        let weighted = WeightedCrossEntropy::new(c)
            .unwrap()
            .eval(logits.view(), &target)
            .unwrap();
        assert_relative_eq!(weighted, c * unweighted, max_relative = 1e-5);
    }
}

fn tiny_topology() -> NetworkTopology {
    let defaults = [
        ("conv_1", LayerParams::conv(3, 8)),
        ("pool_1", LayerParams::pool(2).with_skip(true)),
        ("conv_2", LayerParams::conv(3, 16)),
        ("convt_2", LayerParams::conv(3, 8)),
        ("up_1", LayerParams::pool(2).with_skip(true)),
        (
            "convt_1",
            LayerParams::conv(3, 1).with_activation("identity"),
        ),
    ]
    .into_iter()
    .collect();
    NetworkTopology::new(
        "tiny",
        vec![
            StageDef::conv("conv_1"),
            StageDef::pool("pool_1"),
            StageDef::conv("conv_2"),
        ],
        vec![
            StageDef::conv_transpose("convt_2"),
            StageDef::unpool("up_1"),
            StageDef::conv_transpose("convt_1"),
        ],
        defaults,
    )
}

fn tiny_builder() -> NetworkBuilder {
    Network::builder()
        .topology(tiny_topology())
        .input_shape(16, 16)
        .objective("wce", 2.)
        .learning_rate(1e-2, serde_json::Value::Null)
        .seed(7)
}

/// A bright diagonal line on a noisy background.
fn vessel_batch(size: usize, seed: u64) -> (Array4<f32>, Array4<f32>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let truth = Array4::from_shape_fn([1, size, size, 1], |(_, y, x, _)| {
        ((y as isize - x as isize).abs() <= 1) as u8 as f32
    });
    let images = truth.mapv(|t| t + 0.2 * rng.gen::<f32>());
    (images, truth)
}

fn network_tests() -> Vec<Trial> {
    vec![
        Trial::test("small_network_preserves_shape", || {
            small_network_preserves_shape();
            Ok(())
        }),
        Trial::test("train_step_reduces_loss", || {
            train_step_reduces_loss();
            Ok(())
        }),
        Trial::test("objectives_train", || {
            objectives_train();
            Ok(())
        }),
        Trial::test("regularization_adds_penalty", || {
            regularization_adds_penalty();
            Ok(())
        }),
        Trial::test("checkpoint_round_trip", || {
            checkpoint_round_trip();
            Ok(())
        }),
        Trial::test("checkpoint_mismatch", || {
            checkpoint_mismatch();
            Ok(())
        }),
        Trial::test("conv_transpose_rejects_batches", || {
            conv_transpose_rejects_batches();
            Ok(())
        }),
        Trial::test("backbone_network", || {
            backbone_network();
            Ok(())
        }),
        Trial::test("learning_rate_decays", || {
            learning_rate_decays();
            Ok(())
        }),
        Trial::test("every_conv_layer_normalizes", || {
            every_conv_layer_normalizes();
            Ok(())
        }),
        Trial::test("stage_activation_takes_network_leak", || {
            stage_activation_takes_network_leak();
            Ok(())
        }),
    ]
}

fn small_network_preserves_shape() {
    let defaults = [
        ("conv_1", LayerParams::conv(3, 8)),
        ("pool_1", LayerParams::pool(2)),
        ("conv_2", LayerParams::conv(3, 8)),
        ("up_1", LayerParams::pool(2)),
        (
            "convt_1",
            LayerParams::conv(3, 1).with_activation("identity"),
        ),
    ]
    .into_iter()
    .collect();
    let topology = NetworkTopology::new(
        "symmetric",
        vec![
            StageDef::conv("conv_1"),
            StageDef::pool("pool_1"),
            StageDef::conv("conv_2"),
        ],
        vec![StageDef::unpool("up_1"), StageDef::conv_transpose("convt_1")],
        defaults,
    );
    let mut network = Network::builder()
        .topology(topology)
        .input_shape(64, 64)
        .seed(0)
        .build()
        .unwrap();
    assert_eq!(network.description(), "C3,8,1C3,8,1C3,1,1");
    let (images, truth) = vessel_batch(64, 0);
    let evaluation = network
        .evaluate(images.view(), truth.view(), None)
        .unwrap();
    assert_eq!(evaluation.logits.shape(), &[1, 64, 64, 1]);
    assert_eq!(evaluation.predictions.shape(), &[1, 64, 64, 1]);
    assert!(evaluation.loss.is_finite());
}

fn train_step_reduces_loss() {
    let mut network = tiny_builder()
        .optimizer("adam", serde_json::Value::Null)
        .build()
        .unwrap();
    let (images, truth) = vessel_batch(16, 1);
    let first = network
        .train_step(images.view(), truth.view(), None)
        .unwrap();
    let mut last = first;
    for _ in 0..30 {
        last = network
            .train_step(images.view(), truth.view(), None)
            .unwrap();
    }
    assert_eq!(network.global_step(), 31);
    assert!(last < first, "{first} -> {last}");
}

fn objectives_train() {
    let (images, truth) = vessel_batch(16, 2);
    let weights = truth.mapv(|t| 1. + t);
    for (objective, constant) in [("wce", 5.), ("gdice", 0.), ("ss", 0.7)] {
        for optimizer in ["adam", "rmsprop", "adadelta"] {
            let mut network = tiny_builder()
                .objective(objective, constant)
                .optimizer(optimizer, serde_json::Value::Null)
                .build()
                .unwrap();
            for _ in 0..2 {
                let loss = network
                    .train_step(images.view(), truth.view(), Some(weights.view()))
                    .unwrap();
                assert!(loss.is_finite(), "{objective} {optimizer}");
            }
        }
    }
}

fn regularization_adds_penalty() {
    let (images, truth) = vessel_batch(16, 3);
    let mut plain = tiny_builder().build().unwrap();
    let mut penalized = tiny_builder().regularizer("L2", 1e-2).build().unwrap();
    let plain = plain.evaluate(images.view(), truth.view(), None).unwrap();
    let penalized = penalized
        .evaluate(images.view(), truth.view(), None)
        .unwrap();
    assert_eq!(plain.logits, penalized.logits);
    assert!(penalized.loss > plain.loss);
}

fn checkpoint_round_trip() {
    let (images, truth) = vessel_batch(16, 4);
    let mut network = tiny_builder().build().unwrap();
    for _ in 0..3 {
        network
            .train_step(images.view(), truth.view(), None)
            .unwrap();
    }
    let expected = network
        .evaluate(images.view(), truth.view(), None)
        .unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tiny.json");
    network.save_checkpoint(&path).unwrap();
    let mut restored = tiny_builder().seed(8).build().unwrap();
    restored.load_checkpoint(&path).unwrap();
    assert_eq!(restored.global_step(), 3);
    let evaluation = restored
        .evaluate(images.view(), truth.view(), None)
        .unwrap();
    assert_eq!(evaluation.logits, expected.logits);
    assert_eq!(evaluation.loss, expected.loss);
    // Training resumes with the restored optimizer state.
    let a = network
        .train_step(images.view(), truth.view(), None)
        .unwrap();
    let b = restored
        .train_step(images.view(), truth.view(), None)
        .unwrap();
    assert_relative_eq!(a, b, max_relative = 1e-4);
}

fn checkpoint_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tiny.json");
    tiny_builder().build().unwrap().save_checkpoint(&path).unwrap();

    let wider = LayerParamsRegistry::new().with(
        "conv_2",
        LayerParams {
            output_channels: Some(32),
            ..LayerParams::default()
        },
    );
    let mut network = tiny_builder().layer_params(wider).build().unwrap();
    let error = error_of(network.load_checkpoint(&path));
    assert!(error.is_shape(), "{error:?}");
    assert_eq!(network.global_step(), 0);

    let mut other = Network::builder()
        .topology(pool_unpool_topology())
        .input_shape(16, 16)
        .build()
        .unwrap();
    let error = error_of(other.load_checkpoint(&path));
    assert!(error.is_configuration(), "{error:?}");
}

fn conv_transpose_rejects_batches() {
    let mut network = tiny_builder().build().unwrap();
    let images = Array4::<f32>::zeros([2, 16, 16, 1]);
    let error = error_of(network.predict(images.view()));
    assert!(error.is_shape(), "{error:?}");
}

fn backbone_network() {
    let config = BackboneConfig::new(Backbone::Vgg16)
        .with_output_layer("block1_pool")
        .with_skip_connections(true);
    let mut network = Network::builder()
        .encoder(EncoderSource::Backbone(config))
        .input_shape(16, 16)
        .preprocess(true)
        .seed(3)
        .build()
        .unwrap();
    assert_eq!(network.name(), "vgg16");
    let names: Vec<_> = network
        .layer_descriptions()
        .into_iter()
        .map(|(name, _)| name.to_owned())
        .collect();
    assert_eq!(
        names,
        [
            "block1_conv1",
            "block1_conv2",
            "block1_pool",
            "block1_unpool",
            "block1_conv2_t",
            "block1_conv1_t"
        ]
    );
    let (images, truth) = vessel_batch(16, 5);
    let loss = network
        .train_step(images.view(), truth.view(), None)
        .unwrap();
    assert!(loss.is_finite());
    // The single channel input is triplicated before the first stage.
    let predictions = network.predict(images.view()).unwrap();
    assert_eq!(predictions.shape(), &[1, 16, 16, 1]);
    assert_eq!(network.layers().next().unwrap().input_shape(), [16, 16, 3]);
}

fn learning_rate_decays() {
    let mut network = tiny_builder()
        .learning_rate(
            0.1,
            serde_json::json!({"decay_epochs": 1, "decay_rate": 0.5, "staircase": true}),
        )
        .steps_per_epoch(2)
        .build()
        .unwrap();
    let (images, truth) = vessel_batch(16, 6);
    let mut rates = Vec::new();
    for _ in 0..4 {
        rates.push(network.learning_rate());
        network
            .train_step(images.view(), truth.view(), None)
            .unwrap();
    }
    assert_eq!(rates, [0.1, 0.1, 0.05, 0.05]);
}

fn every_conv_layer_normalizes() {
    let backbone = BackboneConfig::new(Backbone::Vgg16).with_output_layer("block1_pool");
    for builder in [
        tiny_builder(),
        tiny_builder().encoder(EncoderSource::Backbone(backbone)),
    ] {
        let network = builder.build().unwrap();
        for layer in network.layers() {
            let names: Vec<_> = layer
                .parameters()
                .into_iter()
                .map(|(name, _)| name)
                .collect();
            if layer.kind().is_conv_like() {
                assert_eq!(names, ["W", "b", "beta"], "{}", layer.name());
                assert_eq!(layer.statistics().len(), 2, "{}", layer.name());
            } else {
                assert!(names.is_empty(), "{}", layer.name());
            }
        }
    }
    let overrides =
        LayerParamsRegistry::new().with("convt_1", LayerParams::default().with_batch_norm(false));
    let error = error_of(
        tiny_builder()
            .layer_params(overrides)
            .build()
            .map(|network| network.description()),
    );
    assert!(error.is_configuration(), "{error:?}");
}

fn stage_activation_takes_network_leak() {
    let overrides: LayerParamsRegistry =
        serde_json::from_str(r#"{"conv_2": {"activation": "lrelu"}}"#).unwrap();
    let network = tiny_builder()
        .activation("relu", 0.3)
        .layer_params(overrides)
        .build()
        .unwrap();
    let activations: Vec<_> = network
        .layers()
        .filter(|layer| layer.kind().is_conv_like())
        .map(|layer| (layer.name().to_owned(), layer.activation()))
        .collect();
    assert_eq!(
        activations,
        [
            ("conv_1".to_owned(), Activation::Relu),
            ("conv_2".to_owned(), Activation::LeakyRelu { leak: 0.3 }),
            ("convt_2".to_owned(), Activation::Relu),
            ("convt_1".to_owned(), Activation::Identity),
        ]
    );
}
