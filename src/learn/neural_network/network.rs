//! The network base: forward pass, loss, training step, evaluation and checkpoints.
//!
//! A [`Network`] is built with a [`NetworkBuilder`] (or from a [`NetworkConfig`]), which
//! resolves every name, assembles the topology and allocates the layers. Building either
//! succeeds with a network ready to train, or fails before any parameter is allocated.
//!
//!```no_run
//! # use anyhow::Result;
//! # use ndarray::Array4;
//! # use vesselseg::{dataset::Dataset, learn::neural_network::Network};
//! # fn main() -> Result<()> {
//! let mut network = Network::builder()
//!     .dataset(Dataset::Drive)
//!     .objective("wce", 10.)
//!     .regularizer("L2", 1e-4)
//!     .optimizer("Adam", serde_json::json!({"beta1": 0.9}))
//!     .seed(0)
//!     .build()?;
//! let images = Array4::<f32>::zeros([1, 584, 584, 1]);
//! let truth = Array4::<f32>::zeros([1, 584, 584, 1]);
//! let loss = network.train_step(images.view(), truth.view(), None)?;
//! let evaluation = network.evaluate(images.view(), truth.view(), None)?;
//! println!("{loss} {}", evaluation.loss);
//! # Ok(())
//! # }
//!```
use super::{
    autograd::{ParameterD, Variable4},
    backbone::EncoderSource,
    criterion::{Objective, RegularizationAccumulator, Regularizer},
    layer::{
        standardize, tile_channels, Activation, ActivationPolicy, Context, Layer, Mode, StageKind,
        WeightInit,
    },
    optimizer::{LearningRate, Optimizer, OptimizerKind},
    registry::LayerParamsRegistry,
    topology::NetworkTopology,
};
use crate::{
    dataset::Dataset,
    error::{configuration_error, shape_error, Error},
    learn::criterion::{sigmoid, Target},
};
use anyhow::{Context as _, Result};
use ndarray::{ArcArray, Array1, Array4, ArrayView4, Ix4};
use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::{
    collections::{BTreeMap, BTreeSet},
    fs::File,
    io::{BufReader, BufWriter},
    path::Path,
};

/// Regularizer arguments, see [`Regularizer::from_args`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegularizerArgs {
    /// "L1" or "L2".
    pub name: String,
    /// The scale of the penalty.
    pub scale: f32,
}

/// Serializable configuration of a network.
///
/// Every field has a default, so partial JSON documents are accepted. Names are only resolved
/// by [`NetworkBuilder::build`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    /// Selects the family and the input shape.
    pub dataset: Dataset,
    /// `[height, width]` overriding the fit shape of the dataset.
    pub input_shape: Option<[usize; 2]>,
    /// The encoder.
    pub encoder: EncoderSource,
    /// Weight initialization.
    pub weight_init: WeightInit,
    /// Activation name, see [`Activation::from_name`].
    pub activation: String,
    /// The leak of every leaky relu, including stages that override the activation.
    pub leak: f32,
    /// Overrides of the default layer params of the family.
    pub layer_params: LayerParamsRegistry,
    /// Objective name, see [`Objective::from_name`].
    pub objective: String,
    /// The tuning constant of the objective.
    pub tuning_constant: f32,
    /// The weight penalty.
    pub regularizer: Option<RegularizerArgs>,
    /// Optimizer name, see [`OptimizerKind::from_name_and_kwargs`].
    pub optimizer: String,
    /// Optimizer arguments.
    pub optimizer_kwargs: JsonValue,
    /// The base learning rate.
    pub learning_rate: f32,
    /// Learning rate decay, see [`LearningRate::from_rate_and_kwargs`].
    pub learning_rate_kwargs: JsonValue,
    /// Used to convert `decay_epochs` to steps.
    pub steps_per_epoch: Option<u64>,
    /// The number of images per step.
    pub batch_size: usize,
    /// The number of output channels.
    pub classes: usize,
    /// Standardize each image before the encoder.
    pub preprocess: bool,
    /// Seeds weight initialization and dropout.
    pub seed: Option<u64>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            dataset: Dataset::Drive,
            input_shape: None,
            encoder: EncoderSource::default(),
            weight_init: WeightInit::default(),
            activation: "lrelu".into(),
            leak: Activation::DEFAULT_LEAK,
            layer_params: LayerParamsRegistry::default(),
            objective: "wce".into(),
            tuning_constant: 1.,
            regularizer: None,
            optimizer: "Adam".into(),
            optimizer_kwargs: JsonValue::Null,
            learning_rate: LearningRate::default().rate(),
            learning_rate_kwargs: JsonValue::Null,
            steps_per_epoch: None,
            batch_size: 1,
            classes: 1,
            preprocess: false,
            seed: None,
        }
    }
}

/// Builds a [`Network`].
#[derive(Debug, Default, Clone)]
pub struct NetworkBuilder {
    config: NetworkConfig,
    topology: Option<NetworkTopology>,
}

impl From<NetworkConfig> for NetworkBuilder {
    fn from(config: NetworkConfig) -> Self {
        Self {
            config,
            topology: None,
        }
    }
}

impl NetworkBuilder {
    /// A builder with the default config.
    pub fn new() -> Self {
        Self::default()
    }
    /// The config.
    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }
    /// Selects the family and input shape of `dataset`. Defaults to [`Dataset::Drive`].
    pub fn dataset(mut self, dataset: Dataset) -> Self {
        self.config.dataset = dataset;
        self
    }
    /// Uses `topology` instead of the family of the dataset.
    pub fn topology(mut self, topology: NetworkTopology) -> Self {
        self.topology.replace(topology);
        self
    }
    /// Overrides the input height and width.
    pub fn input_shape(mut self, height: usize, width: usize) -> Self {
        self.config.input_shape.replace([height, width]);
        self
    }
    /// The encoder source. Defaults to [`EncoderSource::Stages`].
    pub fn encoder(mut self, encoder: EncoderSource) -> Self {
        self.config.encoder = encoder;
        self
    }
    /// Weight initialization. Defaults to [`WeightInit::Default`].
    pub fn weight_init(mut self, weight_init: WeightInit) -> Self {
        self.config.weight_init = weight_init;
        self
    }
    /// The activation name and leak. Defaults to ("lrelu", 0.2).
    pub fn activation(mut self, name: impl Into<String>, leak: f32) -> Self {
        self.config.activation = name.into();
        self.config.leak = leak;
        self
    }
    /// Overrides the layer params of the family.
    pub fn layer_params(mut self, layer_params: LayerParamsRegistry) -> Self {
        self.config.layer_params = layer_params;
        self
    }
    /// The objective name and tuning constant. Defaults to ("wce", 1).
    pub fn objective(mut self, name: impl Into<String>, tuning_constant: f32) -> Self {
        self.config.objective = name.into();
        self.config.tuning_constant = tuning_constant;
        self
    }
    /// Adds a weight penalty.
    pub fn regularizer(mut self, name: impl Into<String>, scale: f32) -> Self {
        self.config.regularizer.replace(RegularizerArgs {
            name: name.into(),
            scale,
        });
        self
    }
    /// The optimizer name and arguments. Defaults to "Adam".
    pub fn optimizer(mut self, name: impl Into<String>, kwargs: JsonValue) -> Self {
        self.config.optimizer = name.into();
        self.config.optimizer_kwargs = kwargs;
        self
    }
    /// The learning rate and decay arguments. Defaults to a constant 0.001.
    pub fn learning_rate(mut self, rate: f32, kwargs: JsonValue) -> Self {
        self.config.learning_rate = rate;
        self.config.learning_rate_kwargs = kwargs;
        self
    }
    /// The number of steps per epoch.
    pub fn steps_per_epoch(mut self, steps_per_epoch: u64) -> Self {
        self.config.steps_per_epoch.replace(steps_per_epoch);
        self
    }
    /// The batch size. Defaults to 1.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.config.batch_size = batch_size;
        self
    }
    /// The number of classes. Defaults to 1.
    pub fn classes(mut self, classes: usize) -> Self {
        self.config.classes = classes;
        self
    }
    /// Standardize each image. Defaults to false.
    pub fn preprocess(mut self, preprocess: bool) -> Self {
        self.config.preprocess = preprocess;
        self
    }
    /// Seeds the network.
    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed.replace(seed);
        self
    }
    /// Builds the network.
    ///
    /// **Errors**
    /// - [`Error::Configuration`](crate::error::Error::Configuration) for unrecognized names,
    ///   out of range values, overrides of unknown stages, or a final stage that does not output
    ///   `classes` channels.
    /// - [`Error::Shape`](crate::error::Error::Shape) if the stages do not fit together or the
    ///   decoder does not restore the input shape.
    pub fn build(self) -> Result<Network> {
        let Self { config, topology } = self;
        let activation = ActivationPolicy::from_name(&config.activation, config.leak)?;
        let objective = Objective::from_name(&config.objective, config.tuning_constant)?;
        let regularizer = config
            .regularizer
            .as_ref()
            .map(|args| Regularizer::from_args(&args.name, args.scale))
            .transpose()?;
        let optimizer =
            OptimizerKind::from_name_and_kwargs(&config.optimizer, &config.optimizer_kwargs)?;
        let learning_rate = LearningRate::from_rate_and_kwargs(
            config.learning_rate,
            &config.learning_rate_kwargs,
            config.steps_per_epoch,
        )?;
        if config.batch_size == 0 {
            return Err(configuration_error!("batch size must be positive"));
        }
        if config.classes == 0 {
            return Err(configuration_error!("classes must be positive"));
        }
        let topology = match &config.encoder {
            EncoderSource::Stages => topology.unwrap_or_else(|| config.dataset.topology()),
            EncoderSource::Backbone(backbone) => backbone.topology(config.classes)?,
        };
        let topology = topology.with_overrides(&config.layer_params)?;
        let [height, width] = config.input_shape.unwrap_or_else(|| {
            let [height, width, _] = config.dataset.fit_shape();
            [height, width]
        });
        let channels = Dataset::IMAGE_CHANNELS;
        let encoder_channels = config.encoder.input_channels().unwrap_or(channels);
        let assembly = topology
            .assemble([height, width, encoder_channels], activation)
            .with_context(|| format!("assembling {}", topology.name()))?;
        let [output_height, output_width, output_channels] = assembly.output_shape();
        if [output_height, output_width] != [height, width] {
            return Err(shape_error!(
                "{} maps {height}x{width} to {output_height}x{output_width}",
                topology.name()
            ));
        }
        if output_channels != config.classes {
            return Err(configuration_error!(
                "the last stage of {} outputs {output_channels} channels, expected {} classes",
                topology.name(),
                config.classes
            ));
        }
        if config.batch_size > 1 {
            if let Some(stage) = assembly
                .stages()
                .find(|stage| stage.spec().kind == StageKind::ConvTranspose)
            {
                return Err(configuration_error!(
                    "batch size {} is not supported by the transpose convolution {}",
                    config.batch_size,
                    stage.spec().name
                ));
            }
        }
        let mut rng = config
            .seed
            .map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
        let (encoder, decoder) = assembly.instantiate(config.weight_init, &mut rng)?;
        let network = Network {
            name: topology.name().to_owned(),
            input_shape: [height, width, channels],
            tile_input: config
                .encoder
                .input_channels()
                .map(|encoder_channels| encoder_channels / channels),
            preprocess: config.preprocess,
            batch_size: config.batch_size,
            encoder,
            decoder,
            objective,
            regularizer,
            optimizer,
            learning_rate,
            global_step: 0,
            rng,
            layer_outputs: Vec::new(),
            state: NetworkState::GraphBuilt,
        };
        log::info!(
            "built {} network {} with {} parameters",
            network.name,
            network.description(),
            network.parameter_count()
        );
        Ok(network)
    }
}

/// The lifecycle of a [`Network`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::IsVariant)]
pub enum NetworkState {
    /// Built, not yet trained or evaluated.
    GraphBuilt,
    /// The last call was a training step.
    Training,
    /// The last call was an evaluation.
    Evaluating,
    /// Released, see [`Network::finalize`].
    Finalized,
}

/// The output of [`Network::evaluate`].
#[derive(Debug, Clone)]
pub struct Evaluation {
    /// `sigmoid(logits)`
    pub predictions: Array4<f32>,
    /// The output of the last stage.
    pub logits: Array4<f32>,
    /// The objective plus the weight penalty.
    pub loss: f32,
}

/// A saved [`Network`], see [`Network::checkpoint`].
///
/// Parameters are keyed by `"<layer>/<param>"`, batch normalization statistics by
/// `"<layer>/moving_mean"` and `"<layer>/moving_variance"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    global_step: u64,
    parameters: BTreeMap<String, ParameterD>,
    statistics: BTreeMap<String, Array1<f32>>,
}

impl Checkpoint {
    /// The number of completed training steps.
    pub fn global_step(&self) -> u64 {
        self.global_step
    }
    /// The keys of the parameters and statistics.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.parameters
            .keys()
            .chain(self.statistics.keys())
            .map(String::as_str)
    }
}

/// An encoder decoder network.
#[derive(Debug)]
pub struct Network {
    name: String,
    input_shape: [usize; 3],
    tile_input: Option<usize>,
    preprocess: bool,
    batch_size: usize,
    encoder: Vec<Box<dyn Layer>>,
    decoder: Vec<Box<dyn Layer>>,
    objective: Objective,
    regularizer: Option<Regularizer>,
    optimizer: OptimizerKind,
    learning_rate: LearningRate,
    global_step: u64,
    rng: StdRng,
    layer_outputs: Vec<(String, ArcArray<f32, Ix4>)>,
    state: NetworkState,
}

impl Network {
    /// A [`NetworkBuilder`].
    pub fn builder() -> NetworkBuilder {
        NetworkBuilder::new()
    }
    /// The name of the family.
    pub fn name(&self) -> &str {
        &self.name
    }
    /// The input shape `[height, width, channels]`.
    pub fn input_shape(&self) -> [usize; 3] {
        self.input_shape
    }
    /// The configured batch size.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
    /// The objective.
    pub fn objective(&self) -> Objective {
        self.objective
    }
    /// The state.
    pub fn state(&self) -> NetworkState {
        self.state
    }
    /// The number of completed training steps.
    pub fn global_step(&self) -> u64 {
        self.global_step
    }
    /// The learning rate of the next step.
    pub fn learning_rate(&self) -> f32 {
        self.learning_rate.at(self.global_step)
    }
    /// The encoder then decoder layers.
    pub fn layers(&self) -> impl Iterator<Item = &(dyn Layer + 'static)> + '_ {
        self.encoder
            .iter()
            .chain(self.decoder.iter())
            .map(|layer| layer.as_ref())
    }
    fn layers_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn Layer>> + '_ {
        self.encoder.iter_mut().chain(self.decoder.iter_mut())
    }
    /// The description of every layer, by name. Pools and unpools are empty.
    pub fn layer_descriptions(&self) -> Vec<(&str, String)> {
        self.layers()
            .map(|layer| (layer.name(), layer.description()))
            .collect()
    }
    /// The concatenated descriptions of every layer, ie "C3,64,1C3,128,1".
    pub fn description(&self) -> String {
        self.layers().map(|layer| layer.description()).collect()
    }
    /// The number of trainable elements.
    pub fn parameter_count(&self) -> usize {
        self.layers().map(|layer| layer.parameter_count()).sum()
    }
    /// The output of every layer during the last forward pass, by name.
    pub fn layer_outputs(&self) -> &[(String, ArcArray<f32, Ix4>)] {
        &self.layer_outputs
    }
    fn ensure_active(&self) -> Result<()> {
        if self.state.is_finalized() {
            return Err(Error::InvalidState(format!("{} network is finalized", self.name)).into());
        }
        Ok(())
    }
    fn check_batch(&self, what: &str, batch: &ArrayView4<f32>, channels: usize) -> Result<()> {
        let [height, width, _] = self.input_shape;
        let shape = batch.shape();
        if shape[0] == 0 || shape[1..] != [height, width, channels] {
            return Err(shape_error!(
                "{what} must be [batch, {height}, {width}, {channels}], found {shape:?}"
            ));
        }
        Ok(())
    }
    fn forward(
        &mut self,
        images: ArrayView4<f32>,
        mode: Mode,
    ) -> Result<(Variable4, RegularizationAccumulator)> {
        self.check_batch("images", &images, self.input_shape[2])?;
        let images = if self.preprocess {
            standardize(images)
        } else {
            images.to_owned()
        };
        let mut x = Variable4::from(images);
        if let Some(copies) = self.tile_input {
            x = tile_channels(&x, copies)?;
        }
        let mut regularization = RegularizationAccumulator::default();
        let mut context = Context::new(mode, &mut self.rng, &mut regularization);
        let mut skips = Vec::<Option<Variable4>>::new();
        self.layer_outputs.clear();
        for layer in self.encoder.iter_mut().chain(self.decoder.iter_mut()) {
            let aux = match layer.kind() {
                StageKind::Pool => {
                    skips.push(layer.skip().then(|| x.clone()));
                    None
                }
                StageKind::Unpool => {
                    let skip = skips.pop().flatten();
                    if layer.skip() {
                        let skip = skip.ok_or_else(|| {
                            configuration_error!("{} has no skip tensor to fuse", layer.name())
                        })?;
                        Some(skip)
                    } else {
                        None
                    }
                }
                StageKind::Conv | StageKind::ConvTranspose => None,
            };
            x = layer
                .forward(x, aux, &mut context)
                .with_context(|| format!("forward {}", layer.name()))?;
            self.layer_outputs
                .push((layer.name().to_owned(), x.value().clone()));
        }
        Ok((x, regularization))
    }
    fn set_training(&mut self, training: bool) {
        for layer in self.layers_mut() {
            for (_, parameter) in layer.parameters_mut() {
                parameter.set_training(training);
            }
        }
    }
    /// Performs a training step, returning the loss.
    ///
    /// `images` and `truth` are `[batch, height, width, 1]`. `weights` are per pixel loss weights
    /// for the weighted cross entropy, ignored by the other objectives.
    ///
    /// **Errors**
    /// - [`Error::Shape`](crate::error::Error::Shape) if the batch does not match the network.
    /// - [`Error::Numerical`](crate::error::Error::Numerical) if the loss is not finite. The
    ///   parameters are not updated and the global step does not advance.
    /// - [`Error::InvalidState`](crate::error::Error::InvalidState) if finalized.
    pub fn train_step<'a>(
        &mut self,
        images: ArrayView4<f32>,
        truth: ArrayView4<'a, f32>,
        weights: Option<ArrayView4<'a, f32>>,
    ) -> Result<f32> {
        self.ensure_active()?;
        self.state = NetworkState::Training;
        self.set_training(true);
        let result = self.train_step_impl(images, truth, weights);
        self.set_training(false);
        result
    }
    fn train_step_impl<'a>(
        &mut self,
        images: ArrayView4<f32>,
        truth: ArrayView4<'a, f32>,
        weights: Option<ArrayView4<'a, f32>>,
    ) -> Result<f32> {
        let (logits, regularization) = self.forward(images, Mode::Train)?;
        let mut target = Target::new(truth);
        if let Some(weights) = weights {
            target = target.with_weights(weights);
        }
        let mut loss = self.objective.loss(logits, &target)?;
        if let Some(regularizer) = self.regularizer.as_ref() {
            loss = loss.add(&regularizer.penalty(regularization))?;
        }
        let value = loss.item();
        if !value.is_finite() {
            log::warn!(
                "{} network loss is {value} at step {}",
                self.name,
                self.global_step
            );
            return Err(Error::Numerical {
                step: self.global_step,
                loss: value,
            }
            .into());
        }
        loss.backward()?;
        std::mem::drop(loss);
        let learning_rate = self.learning_rate.at(self.global_step);
        let optimizer = &self.optimizer;
        for layer in self.encoder.iter_mut().chain(self.decoder.iter_mut()) {
            let name = layer.name().to_owned();
            for (key, parameter) in layer.parameters_mut() {
                optimizer
                    .update(learning_rate, parameter)
                    .with_context(|| format!("updating {name}/{key}"))?;
            }
        }
        self.global_step += 1;
        log::trace!(
            "{} step {} loss = {value} learning_rate = {learning_rate}",
            self.name,
            self.global_step
        );
        Ok(value)
    }
    /// Computes the predictions without a loss.
    ///
    /// **Errors**
    ///
    /// See [`evaluate()`](Self::evaluate).
    pub fn predict(&mut self, images: ArrayView4<f32>) -> Result<Array4<f32>> {
        self.ensure_active()?;
        self.state = NetworkState::Evaluating;
        let (logits, _) = self.forward(images, Mode::Eval)?;
        Ok(logits.value().mapv(sigmoid))
    }
    /// Evaluates a batch without updating any parameter or statistic.
    ///
    /// **Errors**
    /// - [`Error::Shape`](crate::error::Error::Shape) if the batch does not match the network.
    /// - [`Error::InvalidState`](crate::error::Error::InvalidState) if finalized.
    pub fn evaluate<'a>(
        &mut self,
        images: ArrayView4<f32>,
        truth: ArrayView4<'a, f32>,
        weights: Option<ArrayView4<'a, f32>>,
    ) -> Result<Evaluation> {
        self.ensure_active()?;
        self.state = NetworkState::Evaluating;
        let (logits, regularization) = self.forward(images, Mode::Eval)?;
        let logits_value = logits.value().to_owned();
        let mut target = Target::new(truth);
        if let Some(weights) = weights {
            target = target.with_weights(weights);
        }
        let mut loss = self.objective.loss(logits, &target)?.item();
        if let Some(regularizer) = self.regularizer.as_ref() {
            loss += regularizer.penalty(regularization).item();
        }
        Ok(Evaluation {
            predictions: logits_value.mapv(sigmoid),
            logits: logits_value,
            loss,
        })
    }
    /// Copies the parameters, statistics and global step.
    ///
    /// **Errors**
    ///
    /// [`Error::InvalidState`](crate::error::Error::InvalidState) if finalized.
    pub fn checkpoint(&self) -> Result<Checkpoint> {
        self.ensure_active()?;
        let mut parameters = BTreeMap::new();
        let mut statistics = BTreeMap::new();
        for layer in self.layers() {
            for (key, parameter) in layer.parameters() {
                parameters.insert(format!("{}/{key}", layer.name()), parameter.clone());
            }
            for (key, statistic) in layer.statistics() {
                statistics.insert(format!("{}/{key}", layer.name()), statistic.clone());
            }
        }
        Ok(Checkpoint {
            global_step: self.global_step,
            parameters,
            statistics,
        })
    }
    /// Restores a checkpoint.
    ///
    /// Nothing is modified unless every key and shape matches.
    ///
    /// **Errors**
    /// - [`Error::Configuration`](crate::error::Error::Configuration) if a key is missing or
    ///   unknown.
    /// - [`Error::Shape`](crate::error::Error::Shape) if a shape differs.
    /// - [`Error::InvalidState`](crate::error::Error::InvalidState) if finalized.
    pub fn restore(&mut self, checkpoint: Checkpoint) -> Result<()> {
        self.ensure_active()?;
        let Checkpoint {
            global_step,
            mut parameters,
            mut statistics,
        } = checkpoint;
        let mut expected = BTreeSet::new();
        for layer in self.layers() {
            for (key, parameter) in layer.parameters() {
                let key = format!("{}/{key}", layer.name());
                let saved = parameters
                    .get(&key)
                    .ok_or_else(|| configuration_error!("checkpoint is missing {key}"))?;
                if saved.shape() != parameter.shape() {
                    return Err(shape_error!(
                        "checkpoint {key} is {:?}, expected {:?}",
                        saved.shape(),
                        parameter.shape()
                    ));
                }
                expected.insert(key);
            }
            for (key, statistic) in layer.statistics() {
                let key = format!("{}/{key}", layer.name());
                let saved = statistics
                    .get(&key)
                    .ok_or_else(|| configuration_error!("checkpoint is missing {key}"))?;
                if saved.len() != statistic.len() {
                    return Err(shape_error!(
                        "checkpoint {key} has {} elements, expected {}",
                        saved.len(),
                        statistic.len()
                    ));
                }
                expected.insert(key);
            }
        }
        if let Some(key) = parameters
            .keys()
            .chain(statistics.keys())
            .find(|key| !expected.contains(*key))
        {
            return Err(configuration_error!("checkpoint has unknown key {key}"));
        }
        for layer in self.layers_mut() {
            let name = layer.name().to_owned();
            for (key, parameter) in layer.parameters_mut() {
                if let Some(saved) = parameters.remove(&format!("{name}/{key}")) {
                    *parameter = saved;
                }
            }
            for (key, statistic) in layer.statistics_mut() {
                if let Some(saved) = statistics.remove(&format!("{name}/{key}")) {
                    *statistic = saved;
                }
            }
        }
        self.global_step = global_step;
        Ok(())
    }
    /// Saves a [`checkpoint()`](Self::checkpoint) as JSON.
    ///
    /// **Errors**
    ///
    /// See [`checkpoint()`](Self::checkpoint), or if the file can not be written.
    pub fn save_checkpoint(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let checkpoint = self.checkpoint()?;
        let writer = BufWriter::new(
            File::create(path).with_context(|| format!("creating {}", path.display()))?,
        );
        serde_json::to_writer(writer, &checkpoint)?;
        log::info!(
            "saved {} network at step {} to {}",
            self.name,
            self.global_step,
            path.display()
        );
        Ok(())
    }
    /// Loads a checkpoint saved with [`save_checkpoint()`](Self::save_checkpoint).
    ///
    /// **Errors**
    ///
    /// See [`restore()`](Self::restore), or if the file can not be read.
    pub fn load_checkpoint(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.ensure_active()?;
        let path = path.as_ref();
        let reader = BufReader::new(
            File::open(path).with_context(|| format!("opening {}", path.display()))?,
        );
        let checkpoint: Checkpoint = serde_json::from_reader(reader)?;
        self.restore(checkpoint)
            .with_context(|| format!("restoring {}", path.display()))?;
        log::info!(
            "loaded {} network at step {} from {}",
            self.name,
            self.global_step,
            path.display()
        );
        Ok(())
    }
    /// Releases the layers.
    ///
    /// **Errors**
    ///
    /// [`Error::InvalidState`](crate::error::Error::InvalidState) if already finalized.
    pub fn finalize(&mut self) -> Result<()> {
        self.ensure_active()?;
        self.encoder.clear();
        self.decoder.clear();
        self.layer_outputs.clear();
        self.state = NetworkState::Finalized;
        log::info!("finalized {} network", self.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learn::neural_network::{registry::LayerParams, topology::StageDef};

    fn tiny() -> NetworkTopology {
        let defaults = [
            ("conv_1", LayerParams::conv(3, 4)),
            ("pool_1", LayerParams::pool(2).with_skip(true)),
            ("conv_2", LayerParams::conv(3, 4)),
            ("convt_2", LayerParams::conv(3, 4)),
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

    fn builder() -> NetworkBuilder {
        Network::builder()
            .topology(tiny())
            .input_shape(8, 8)
            .seed(1)
    }

    fn error_of(error: &anyhow::Error) -> &Error {
        error.downcast_ref::<Error>().unwrap()
    }

    #[test]
    fn build_resolves_names() {
        for builder in [
            builder().activation("swish", 0.),
            builder().objective("focal", 1.),
            builder().optimizer("sgd", JsonValue::Null),
            builder().regularizer("L3", 1.),
            builder().classes(2),
            builder().batch_size(2),
        ] {
            let error = builder.build().unwrap_err();
            assert!(error_of(&error).is_configuration(), "{error:?}");
        }
    }

    #[test]
    fn stage_overrides_take_network_leak() {
        let overrides =
            LayerParamsRegistry::new().with("conv_2", LayerParams::default().with_activation("lrelu"));
        let network = builder()
            .activation("relu", 0.3)
            .layer_params(overrides)
            .build()
            .unwrap();
        let activations: Vec<_> = network
            .layers()
            .map(|layer| (layer.name(), layer.activation()))
            .collect();
        assert_eq!(activations[0], ("conv_1", Activation::Relu));
        assert_eq!(activations[2], ("conv_2", Activation::LeakyRelu { leak: 0.3 }));
        assert_eq!(activations[5], ("convt_1", Activation::Identity));
    }

    #[test]
    fn build_rejects_unrestored_shape() {
        let defaults = [
            ("conv_1", LayerParams::conv(3, 4)),
            ("pool_1", LayerParams::pool(2)),
            ("convt_1", LayerParams::conv(3, 1)),
        ]
        .into_iter()
        .collect();
        let topology = NetworkTopology::new(
            "unmirrored",
            vec![StageDef::conv("conv_1"), StageDef::pool("pool_1")],
            vec![StageDef::conv_transpose("convt_1")],
            defaults,
        );
        let error = builder().topology(topology).build().unwrap_err();
        assert!(error_of(&error).is_shape(), "{error:?}");
    }

    #[test]
    fn config_from_json() {
        let config: NetworkConfig = serde_json::from_str(
            r#"{
                "dataset": "stare",
                "activation": "relu",
                "layer_params": {"conv_1_1": {"ks": 5}},
                "regularizer": {"name": "L2", "scale": 0.001},
                "learning_rate_kwargs": {"decay_steps": 10, "decay_rate": 0.5}
            }"#,
        )
        .unwrap();
        assert_eq!(config.dataset, Dataset::Stare);
        assert_eq!(config.batch_size, 1);
        assert!(serde_json::from_str::<NetworkConfig>(r#"{"epochs": 1}"#).is_err());
        let builder = NetworkBuilder::from(config);
        assert_eq!(builder.config().objective, "wce");
    }

    #[test]
    fn forward_records_layer_outputs() {
        let mut network = builder().build().unwrap();
        assert_eq!(network.state(), NetworkState::GraphBuilt);
        let images = Array4::from_shape_fn([1, 8, 8, 1], |(_, y, x, _)| (y * 8 + x) as f32 / 64.);
        let predictions = network.predict(images.view()).unwrap();
        assert_eq!(predictions.shape(), &[1, 8, 8, 1]);
        assert!(predictions.iter().all(|p| (0. ..=1.).contains(p)));
        let names: Vec<_> = network
            .layer_outputs()
            .iter()
            .map(|(name, output)| (name.as_str(), output.shape()[1]))
            .collect();
        assert_eq!(
            names,
            [
                ("conv_1", 8),
                ("pool_1", 4),
                ("conv_2", 4),
                ("convt_2", 4),
                ("up_1", 8),
                ("convt_1", 8)
            ]
        );
        assert_eq!(network.state(), NetworkState::Evaluating);
    }

    #[test]
    fn wrong_batch_is_shape_error() {
        let mut network = builder().build().unwrap();
        let images = Array4::<f32>::zeros([1, 8, 8, 3]);
        let error = network.predict(images.view()).unwrap_err();
        assert!(error_of(&error).is_shape());
    }

    #[test]
    fn non_finite_loss_leaves_parameters() {
        let mut network = builder().build().unwrap();
        let before = network.checkpoint().unwrap();
        let images = Array4::<f32>::zeros([1, 8, 8, 1]);
        let truth = Array4::from_elem([1, 8, 8, 1], f32::NAN);
        let error = network
            .train_step(images.view(), truth.view(), None)
            .unwrap_err();
        assert!(matches!(error_of(&error), Error::Numerical { step: 0, .. }));
        assert_eq!(network.global_step(), 0);
        let after = network.checkpoint().unwrap();
        for (key, parameter) in before.parameters.iter() {
            assert_eq!(parameter.value(), after.parameters[key].value(), "{key}");
        }
    }

    #[test]
    fn evaluate_does_not_mutate() {
        let mut network = builder().regularizer("L1", 1e-3).build().unwrap();
        let images = Array4::from_shape_fn([1, 8, 8, 1], |(_, y, x, _)| ((y + x) % 3) as f32);
        let truth = images.mapv(|x| (x > 1.) as u8 as f32);
        let before = network.checkpoint().unwrap();
        let first = network
            .evaluate(images.view(), truth.view(), None)
            .unwrap();
        let second = network
            .evaluate(images.view(), truth.view(), None)
            .unwrap();
        assert_eq!(first.loss, second.loss);
        assert_eq!(first.logits, second.logits);
        let after = network.checkpoint().unwrap();
        assert_eq!(before.statistics, after.statistics);
        assert_eq!(network.global_step(), 0);
    }

    #[test]
    fn finalize_invalidates() {
        let mut network = builder().build().unwrap();
        network.finalize().unwrap();
        assert!(network.state().is_finalized());
        let images = Array4::<f32>::zeros([1, 8, 8, 1]);
        for error in [
            network.predict(images.view()).unwrap_err(),
            network.checkpoint().unwrap_err(),
            network.finalize().unwrap_err(),
        ] {
            assert!(error_of(&error).is_invalid_state());
        }
    }
}
