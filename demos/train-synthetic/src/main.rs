use anyhow::{Context, Result};
use clap::Parser;
use ndarray::{s, Array4, ArrayView4, Axis};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{fs, path::PathBuf};
use vesselseg::learn::{
    neural_network::{
        backbone::EncoderSource, registry::LayerParamsRegistry, Network, NetworkBuilder,
        NetworkConfig,
    },
    Stats, Summary,
};

/// Trains a segmentation network on synthetic vessel images.
#[derive(Parser, Debug)]
#[command(version)]
struct Options {
    /// A json network config, ie `{"dataset": "drive", "objective": "gdice"}`.
    #[arg(long)]
    config: Option<PathBuf>,
    /// The height and width of the images.
    #[arg(long, default_value_t = 32)]
    size: usize,
    /// Divides the output channels of every convolution.
    #[arg(long, default_value_t = 16)]
    channel_divisor: usize,
    #[arg(long, default_value_t = 5)]
    epochs: usize,
    #[arg(long, default_value_t = 16)]
    train_images: usize,
    #[arg(long, default_value_t = 4)]
    test_images: usize,
    #[arg(long, default_value_t = 0)]
    seed: u64,
    /// Saves a checkpoint after training.
    #[arg(long)]
    checkpoint: Option<PathBuf>,
}

/// Random lines of random intensity on a noisy background, and their masks.
fn synthetic_vessels(count: usize, size: usize, rng: &mut StdRng) -> (Array4<f32>, Array4<f32>) {
    let mut images = Array4::zeros([count, size, size, 1]);
    let mut truth = Array4::zeros([count, size, size, 1]);
    for (mut image, mut mask) in images
        .axis_iter_mut(Axis(0))
        .zip(truth.axis_iter_mut(Axis(0)))
    {
        for _ in 0..rng.gen_range(1..4) {
            let (x0, y0) = (rng.gen_range(0..size), rng.gen_range(0..size));
            let angle = rng.gen_range(0. ..std::f32::consts::PI);
            let intensity = rng.gen_range(0.5f32..1.);
            let (dx, dy) = (angle.cos(), angle.sin());
            for t in -(size as isize)..size as isize {
                let x = x0 as f32 + t as f32 * dx;
                let y = y0 as f32 + t as f32 * dy;
                if (0. ..size as f32).contains(&x) && (0. ..size as f32).contains(&y) {
                    let (x, y) = (x as usize, y as usize);
                    image[(y, x, 0)] = intensity;
                    mask[(y, x, 0)] = 1.;
                }
            }
        }
        image.mapv_inplace(|x| x + 0.25 * rng.gen::<f32>());
    }
    (images, truth)
}

/// Narrows the convolutions of the configured family.
fn narrowed(config: &NetworkConfig, divisor: usize) -> LayerParamsRegistry {
    let defaults = config.dataset.topology().defaults().clone();
    let mut layer_params: LayerParamsRegistry = defaults
        .iter()
        .map(|(name, params)| {
            let mut params = params.clone();
            if let Some(channels) = params.output_channels.as_mut() {
                *channels = (*channels / divisor).max(1);
            }
            (name, params)
        })
        .collect();
    for (name, params) in config.layer_params.iter() {
        let merged = match layer_params.get(name) {
            Some(base) => base.merge(params),
            None => params.clone(),
        };
        layer_params.insert(name, merged);
    }
    layer_params
}

fn batches<'a>(
    images: &'a Array4<f32>,
    truth: &'a Array4<f32>,
) -> impl Iterator<Item = (ArrayView4<'a, f32>, ArrayView4<'a, f32>)> + 'a {
    (0..images.len_of(Axis(0))).map(move |i| {
        (
            images.slice(s![i..i + 1, .., .., ..]),
            truth.slice(s![i..i + 1, .., .., ..]),
        )
    })
}

fn main() -> Result<()> {
    env_logger::init();
    let options = Options::parse();
    let mut config: NetworkConfig = match options.config.as_ref() {
        Some(path) => {
            let json = fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&json)?
        }
        None => NetworkConfig::default(),
    };
    config.input_shape = Some([options.size, options.size]);
    config.seed.get_or_insert(options.seed);
    config.steps_per_epoch.get_or_insert(options.train_images as u64);
    if matches!(config.encoder, EncoderSource::Stages) && options.channel_divisor > 1 {
        config.layer_params = narrowed(&config, options.channel_divisor);
    }
    let mut network: Network = NetworkBuilder::from(config).build()?;
    println!(
        "{} network {} with {} parameters",
        network.name(),
        network.description(),
        network.parameter_count()
    );

    let mut rng = StdRng::seed_from_u64(options.seed);
    let (train_images, train_truth) =
        synthetic_vessels(options.train_images, options.size, &mut rng);
    let (test_images, test_truth) = synthetic_vessels(options.test_images, options.size, &mut rng);

    let mut summary = Summary::default();
    while summary.epoch() < options.epochs {
        summary.run_epoch(|_| {
            let mut train = Stats::default();
            for (images, truth) in batches(&train_images, &train_truth) {
                let loss = network.train_step(images, truth, None)?;
                train.add(images.len_of(Axis(0)), loss);
            }
            let mut test = Stats::default();
            for (images, truth) in batches(&test_images, &test_truth) {
                let evaluation = network.evaluate(images, truth, None)?;
                test.add(images.len_of(Axis(0)), evaluation.loss);
            }
            Ok((train, test))
        })?;
        println!("{summary:#?}");
    }
    if let Some(path) = options.checkpoint.as_ref() {
        network.save_checkpoint(path)?;
        log::info!("saved {}", path.display());
    }
    network.finalize()
}
