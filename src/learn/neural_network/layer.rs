//! Layers of the encoder and decoder stacks.
//!
//! Every layer is constructed from a [`StagePlan`], which fixes its input and output shapes.
//! [`Forward::forward`] checks its inputs against those shapes before computing anything, so a
//! network that was planned successfully can only fail at runtime on malformed batches.
use super::{
    autograd::{Parameter, ParameterD, Variable4},
    criterion::RegularizationAccumulator,
    registry::LayerSpec,
    topology::StagePlan,
};
use crate::error::{configuration_error, shape_error};
use anyhow::Result;
use ndarray::{Array, Array1, Array4, Ix1, Ix4};
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal, Uniform};
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Debug},
    marker::PhantomData,
    str::FromStr,
};

mod conv;
mod norm;
mod pool;

use conv::{bias_add, conv2_same, conv2_transpose_same};
use norm::{dropout, BatchNorm};
pub(crate) use norm::standardize;
use pool::{max_pool2, unpool2};
pub(crate) use pool::tile_channels;

mod sealed {
    pub trait ConvKindBase {}
}
use sealed::ConvKindBase;

/// Training or inference.
///
/// Threaded through every forward call. Dropout is only applied in [`Mode::Train`], and batch
/// normalization uses batch statistics (updating its moving statistics) in [`Mode::Train`] and the
/// moving statistics in [`Mode::Eval`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Inference.
    #[default]
    Eval,
    /// Training.
    Train,
}

/// The kind of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// [`Conv`].
    #[display(fmt = "conv")]
    Conv,
    /// [`ConvTranspose`].
    #[display(fmt = "conv_transpose")]
    ConvTranspose,
    /// [`Pool`].
    #[display(fmt = "pool")]
    Pool,
    /// [`Unpool`].
    #[display(fmt = "unpool")]
    Unpool,
}

impl StageKind {
    /// Whether the stage is a convolution or transpose convolution.
    pub fn is_conv_like(&self) -> bool {
        matches!(self, Self::Conv | Self::ConvTranspose)
    }
}

/// Activation functions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum Activation {
    /// `max(x, 0)`
    Relu,
    /// `max(x, leak * x)`
    LeakyRelu {
        /// The slope for negative inputs, in `[0, 1)`.
        leak: f32,
    },
    /// No activation.
    Identity,
}

impl Default for Activation {
    fn default() -> Self {
        Self::LeakyRelu {
            leak: Self::DEFAULT_LEAK,
        }
    }
}

impl Activation {
    /// The default leak of [`Activation::LeakyRelu`].
    pub const DEFAULT_LEAK: f32 = 0.2;
    /// Parses an activation by name.
    ///
    /// Recognized names are "relu", "lrelu" / "leaky_relu" and "identity" / "none". `leak` is
    /// only used by the leaky relu.
    ///
    /// **Errors**
    ///
    /// [`Error::Configuration`](crate::error::Error::Configuration) if the name is not recognized
    /// or `leak` is out of range.
    pub fn from_name(name: &str, leak: f32) -> Result<Self> {
        match name {
            "relu" => Ok(Self::Relu),
            "lrelu" | "leaky_relu" => {
                if !(0. ..1.).contains(&leak) {
                    return Err(configuration_error!(
                        "activation leak must be in [0, 1), found {leak}"
                    ));
                }
                Ok(Self::LeakyRelu { leak })
            }
            "identity" | "none" => Ok(Self::Identity),
            _ => Err(configuration_error!(
                "activation function {name:?} not recognized"
            )),
        }
    }
    /// The name, as accepted by [`from_name()`](Self::from_name).
    pub fn name(&self) -> &'static str {
        match self {
            Self::Relu => "relu",
            Self::LeakyRelu { .. } => "lrelu",
            Self::Identity => "identity",
        }
    }
    fn forward(&self, input: &Variable4) -> Variable4 {
        let slope = match *self {
            Self::Relu => 0.,
            Self::LeakyRelu { leak } => leak,
            Self::Identity => return input.clone(),
        };
        let x = input.value();
        let output = x.mapv(|x| if x > 0. { x } else { slope * x });
        let mut builder = Variable4::builder();
        if let Some(node) = input.node() {
            let x = x.clone();
            builder.edge(node, move |output_grad| {
                let mut input_grad = output_grad.into_owned();
                input_grad.zip_mut_with(&x, |dy, x| {
                    if *x <= 0. {
                        *dy *= slope;
                    }
                });
                Ok(input_grad.into_shared())
            });
        }
        builder.build(output.into_shared())
    }
}

/// The activation of a network and the leak of every leaky relu in it.
///
/// Stages that name their own activation take the leak of the network, whatever the network
/// activation is.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActivationPolicy {
    /// Used by stages without an activation override.
    pub activation: Activation,
    /// The leak of "lrelu" overrides.
    pub leak: f32,
}

impl ActivationPolicy {
    /// Parses the network activation `name` with `leak`, see [`Activation::from_name`].
    ///
    /// **Errors**
    ///
    /// [`Error::Configuration`](crate::error::Error::Configuration) if the name is not recognized
    /// or `leak` is out of range.
    pub fn from_name(name: &str, leak: f32) -> Result<Self> {
        if !(0. ..1.).contains(&leak) {
            return Err(configuration_error!(
                "activation leak must be in [0, 1), found {leak}"
            ));
        }
        Ok(Self {
            activation: Activation::from_name(name, leak)?,
            leak,
        })
    }
    /// Resolves a stage override by name, or the network activation.
    pub(crate) fn resolve(&self, name: Option<&str>) -> Result<Activation> {
        match name {
            Some(name) => Activation::from_name(name, self.leak),
            None => Ok(self.activation),
        }
    }
}

impl From<Activation> for ActivationPolicy {
    fn from(activation: Activation) -> Self {
        let leak = match activation {
            Activation::LeakyRelu { leak } => leak,
            _ => Activation::DEFAULT_LEAK,
        };
        Self { activation, leak }
    }
}

/// Weight initialization schemes.
///
/// Fans are computed from the weight shape `[k, k, a, b]` as `fan_in = k * k * a` and
/// `fan_out = k * k * b`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WeightInit {
    /// Glorot uniform, `limit = sqrt(6 / (fan_in + fan_out))`.
    #[default]
    #[serde(rename = "default")]
    Default,
    /// Variance scaling over the fan in with a factor of 2, truncated normal.
    He,
    /// Glorot normal, truncated.
    #[serde(rename = "Xnormal")]
    XNormal,
}

impl FromStr for WeightInit {
    type Err = anyhow::Error;
    fn from_str(name: &str) -> Result<Self> {
        match name {
            "default" => Ok(Self::Default),
            "He" => Ok(Self::He),
            "Xnormal" => Ok(Self::XNormal),
            _ => Err(configuration_error!(
                "weight init {name:?} not recognized, expected \"default\", \"He\" or \"Xnormal\""
            )),
        }
    }
}

impl WeightInit {
    fn sample(&self, shape: [usize; 4], rng: &mut StdRng) -> Result<Array4<f32>> {
        let [kh, kw, a, b] = shape;
        let fan_in = (kh * kw * a).max(1) as f32;
        let fan_out = (kh * kw * b).max(1) as f32;
        let sigma = match self {
            Self::Default => {
                let limit = (6. / (fan_in + fan_out)).sqrt();
                let uniform = Uniform::new_inclusive(-limit, limit);
                return Ok(Array::from_shape_simple_fn(shape, || uniform.sample(&mut *rng)));
            }
            // 1.3 corrects for the variance lost to truncation.
            Self::He => (1.3 * 2. / fan_in).sqrt(),
            Self::XNormal => (1.3 * 2. / (fan_in + fan_out)).sqrt(),
        };
        let normal = Normal::new(0f32, sigma)?;
        Ok(Array::from_shape_simple_fn(shape, || loop {
            let x = normal.sample(&mut *rng);
            if x.abs() <= 2. * sigma {
                break x;
            }
        }))
    }
}

/// State shared by the layers during a forward pass.
pub struct Context<'a> {
    mode: Mode,
    rng: &'a mut StdRng,
    regularization: &'a mut RegularizationAccumulator,
}

impl<'a> Context<'a> {
    pub(crate) fn new(
        mode: Mode,
        rng: &'a mut StdRng,
        regularization: &'a mut RegularizationAccumulator,
    ) -> Self {
        Self {
            mode,
            rng,
            regularization,
        }
    }
    /// The mode.
    pub fn mode(&self) -> Mode {
        self.mode
    }
}

/// A trait for the forward pass.
pub trait Forward {
    /// Computes the forward pass.
    ///
    /// `aux` is the skip tensor fused by an [`Unpool`] with `skip` enabled, it must be `None` for
    /// every other stage.
    ///
    /// # Autograd
    /// Operations on [`Variable`](super::autograd::Variable) are expected to apply backward ops via
    /// [`VariableBuilder`](super::autograd::builder::VariableBuilder).
    ///
    /// **Errors**
    ///
    /// [`Error::Shape`](crate::error::Error::Shape) if the input does not match the planned shape.
    fn forward(
        &mut self,
        input: Variable4,
        aux: Option<Variable4>,
        context: &mut Context,
    ) -> Result<Variable4>;
}

/// A stage of the encoder or decoder.
pub trait Layer: Forward + Debug + Send + Sync + 'static {
    /// The unique name of the stage.
    fn name(&self) -> &str;
    /// The kind of the stage.
    fn kind(&self) -> StageKind;
    /// The input shape `[height, width, channels]`.
    fn input_shape(&self) -> [usize; 3];
    /// The output shape `[height, width, channels]`.
    fn output_shape(&self) -> [usize; 3];
    /// Whether an [`Unpool`] fuses its skip tensor, or a [`Pool`] provides one.
    fn skip(&self) -> bool {
        false
    }
    /// The activation applied to the output.
    fn activation(&self) -> Activation {
        Activation::Identity
    }
    /// One line description of the configuration, empty for stages without one.
    fn description(&self) -> String {
        String::new()
    }
    /// Trainable parameters, by parameter name.
    fn parameters(&self) -> Vec<(&'static str, &ParameterD)> {
        Vec::new()
    }
    /// Mutable references to the trainable parameters, by parameter name.
    fn parameters_mut(&mut self) -> Vec<(&'static str, &mut ParameterD)> {
        Vec::new()
    }
    /// Non trainable state, ie batch normalization statistics, by name.
    fn statistics(&self) -> Vec<(&'static str, &Array1<f32>)> {
        Vec::new()
    }
    /// Mutable references to the non trainable state.
    fn statistics_mut(&mut self) -> Vec<(&'static str, &mut Array1<f32>)> {
        Vec::new()
    }
    /// The number of trainable elements.
    fn parameter_count(&self) -> usize {
        self.parameters().iter().map(|(_, p)| p.len()).sum()
    }
}

fn check_input(name: &str, input: &[usize], expected: [usize; 3]) -> Result<()> {
    if input.len() != 4 || input[0] == 0 || input[1..] != expected {
        return Err(shape_error!(
            "{name} expects input [batch, {}, {}, {}], found {input:?}",
            expected[0],
            expected[1],
            expected[2]
        ));
    }
    Ok(())
}

fn reject_aux(name: &str, aux: Option<&Variable4>) -> Result<()> {
    if aux.is_some() {
        return Err(configuration_error!("{name} does not fuse a skip tensor"));
    }
    Ok(())
}

/// Marker trait for [`ConvBase`].
pub trait ConvKind: Debug + Default + Send + Sync + 'static + ConvKindBase {
    #[doc(hidden)]
    const KIND: StageKind;
    #[doc(hidden)]
    fn weight_shape(kernel: usize, inputs: usize, outputs: usize) -> [usize; 4];
    #[doc(hidden)]
    fn convolve(input: &Variable4, weight: &Variable4, dilation: usize) -> Result<Variable4>;
}

/// Marker for [`Conv`].
#[derive(Debug, Default, Clone, Copy)]
pub struct Direct;

impl ConvKindBase for Direct {}

impl ConvKind for Direct {
    const KIND: StageKind = StageKind::Conv;
    fn weight_shape(kernel: usize, inputs: usize, outputs: usize) -> [usize; 4] {
        [kernel, kernel, inputs, outputs]
    }
    fn convolve(input: &Variable4, weight: &Variable4, dilation: usize) -> Result<Variable4> {
        conv2_same(input, weight, dilation)
    }
}

/// Marker for [`ConvTranspose`].
#[derive(Debug, Default, Clone, Copy)]
pub struct Transpose;

impl ConvKindBase for Transpose {}

impl ConvKind for Transpose {
    const KIND: StageKind = StageKind::ConvTranspose;
    fn weight_shape(kernel: usize, inputs: usize, outputs: usize) -> [usize; 4] {
        [kernel, kernel, outputs, inputs]
    }
    fn convolve(input: &Variable4, weight: &Variable4, dilation: usize) -> Result<Variable4> {
        // The output geometry is pinned to a single image.
        let batch = input.shape()[0];
        if batch > 1 {
            return Err(shape_error!(
                "transpose convolution supports a batch size of 1, found {batch}"
            ));
        }
        conv2_transpose_same(input, weight, dilation)
    }
}

/// Convolution stage.
///
/// Computes `activation(batch_norm(dropout(conv(x))) + b)`, where dropout is only applied in
/// [`Mode::Train`]. Every convolution normalizes its output. The output has the same spatial
/// size as the input for any dilation.
///
/// See [`Conv`] and [`ConvTranspose`].
pub struct ConvBase<K: ConvKind> {
    name: String,
    kernel_size: usize,
    dilation: usize,
    output_channels: usize,
    keep_prob: f32,
    activation: Activation,
    input_shape: [usize; 3],
    weight: ParameterD,
    bias: ParameterD,
    batch_norm: BatchNorm,
    _m: PhantomData<K>,
}

/// Dilated convolution, weights are `[k, k, inputs, outputs]`.
pub type Conv = ConvBase<Direct>;

/// Dilated transpose convolution, weights are `[k, k, outputs, inputs]`.
///
/// Only a batch size of 1 is supported, larger batches fail with
/// [`Error::Shape`](crate::error::Error::Shape).
pub type ConvTranspose = ConvBase<Transpose>;

impl<K: ConvKind> ConvBase<K> {
    /// Creates the stage from `plan`, initializing the weight with `weight_init`.
    ///
    /// The bias and the batch normalization offset are zero.
    pub fn from_plan(plan: &StagePlan, weight_init: WeightInit, rng: &mut StdRng) -> Result<Self> {
        let spec: &LayerSpec = plan.spec();
        if spec.kind != K::KIND {
            return Err(configuration_error!(
                "can not build a {} from the {} stage {}",
                K::KIND,
                spec.kind,
                spec.name
            ));
        }
        let output_channels = spec.output_channels.ok_or_else(|| {
            configuration_error!("{} is missing output_channels", spec.name)
        })?;
        let input_shape = plan.input_shape();
        let weight_shape = K::weight_shape(spec.kernel_size, input_shape[2], output_channels);
        let weight = weight_init.sample(weight_shape, rng)?;
        let layer = Self {
            name: spec.name.clone(),
            kernel_size: spec.kernel_size,
            dilation: spec.dilation,
            output_channels,
            keep_prob: spec.keep_prob,
            activation: spec.activation,
            input_shape,
            weight: Parameter::from(weight.into_dyn()),
            bias: Parameter::from(Array1::zeros(output_channels).into_dyn()),
            batch_norm: BatchNorm::new(output_channels),
            _m: PhantomData,
        };
        log::debug!(
            "{} {}: {:?} -> {:?} {}",
            K::KIND,
            layer.name,
            layer.input_shape,
            layer.output_shape(),
            layer.description(),
        );
        Ok(layer)
    }
}

impl<K: ConvKind> Forward for ConvBase<K> {
    fn forward(
        &mut self,
        input: Variable4,
        aux: Option<Variable4>,
        context: &mut Context,
    ) -> Result<Variable4> {
        check_input(&self.name, input.shape(), self.input_shape)?;
        reject_aux(&self.name, aux.as_ref())?;
        let weight = self.weight.to_variable().into_dimensionality::<Ix4>()?;
        let mut output = K::convolve(&input, &weight, self.dilation)
            .map_err(|e| e.context(format!("{} failed", self.name)))?;
        context.regularization.push(weight);
        if context.mode == Mode::Train {
            output = dropout(&output, self.keep_prob, &mut *context.rng)?;
        }
        let output = self.batch_norm.forward(&output, context.mode)?;
        let bias = self.bias.to_variable().into_dimensionality::<Ix1>()?;
        let output = bias_add(&output, &bias)?;
        Ok(self.activation.forward(&output))
    }
}

impl<K: ConvKind> Layer for ConvBase<K> {
    fn name(&self) -> &str {
        &self.name
    }
    fn kind(&self) -> StageKind {
        K::KIND
    }
    fn input_shape(&self) -> [usize; 3] {
        self.input_shape
    }
    fn output_shape(&self) -> [usize; 3] {
        [self.input_shape[0], self.input_shape[1], self.output_channels]
    }
    fn description(&self) -> String {
        format!(
            "C{},{},{}",
            self.kernel_size, self.output_channels, self.dilation
        )
    }
    fn activation(&self) -> Activation {
        self.activation
    }
    fn parameters(&self) -> Vec<(&'static str, &ParameterD)> {
        vec![
            ("W", &self.weight),
            ("b", &self.bias),
            ("beta", self.batch_norm.beta()),
        ]
    }
    fn parameters_mut(&mut self) -> Vec<(&'static str, &mut ParameterD)> {
        vec![
            ("W", &mut self.weight),
            ("b", &mut self.bias),
            ("beta", self.batch_norm.beta_mut()),
        ]
    }
    fn statistics(&self) -> Vec<(&'static str, &Array1<f32>)> {
        self.batch_norm.statistics().into()
    }
    fn statistics_mut(&mut self) -> Vec<(&'static str, &mut Array1<f32>)> {
        self.batch_norm.statistics_mut().into()
    }
}

impl<K: ConvKind> Debug for ConvBase<K> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct(if K::KIND == StageKind::Conv {
            "Conv"
        } else {
            "ConvTranspose"
        })
        .field("name", &self.name)
        .field("kernel_size", &self.kernel_size)
        .field("dilation", &self.dilation)
        .field("output_channels", &self.output_channels)
        .field("keep_prob", &self.keep_prob)
        .field("activation", &self.activation)
        .field("input_shape", &self.input_shape)
        .finish()
    }
}

/// Max pooling stage, downsamples by `kernel_size` with a non overlapping window.
#[derive(Debug)]
pub struct Pool {
    name: String,
    kernel_size: usize,
    skip: bool,
    input_shape: [usize; 3],
    output_shape: [usize; 3],
}

impl Pool {
    /// Creates the stage from `plan`.
    pub fn from_plan(plan: &StagePlan) -> Result<Self> {
        let spec = plan.spec();
        if spec.kind != StageKind::Pool {
            return Err(configuration_error!(
                "can not build a pool from the {} stage {}",
                spec.kind,
                spec.name
            ));
        }
        let layer = Self {
            name: spec.name.clone(),
            kernel_size: spec.kernel_size,
            skip: spec.skip,
            input_shape: plan.input_shape(),
            output_shape: plan.output_shape(),
        };
        log::debug!(
            "pool {}: {:?} -> {:?}",
            layer.name,
            layer.input_shape,
            layer.output_shape
        );
        Ok(layer)
    }
}

impl Forward for Pool {
    fn forward(
        &mut self,
        input: Variable4,
        aux: Option<Variable4>,
        _context: &mut Context,
    ) -> Result<Variable4> {
        check_input(&self.name, input.shape(), self.input_shape)?;
        reject_aux(&self.name, aux.as_ref())?;
        max_pool2(&input, self.kernel_size)
    }
}

impl Layer for Pool {
    fn name(&self) -> &str {
        &self.name
    }
    fn kind(&self) -> StageKind {
        StageKind::Pool
    }
    fn input_shape(&self) -> [usize; 3] {
        self.input_shape
    }
    fn output_shape(&self) -> [usize; 3] {
        self.output_shape
    }
    fn skip(&self) -> bool {
        self.skip
    }
}

/// Nearest neighbour upsampling stage.
///
/// Restores the input shape of the mirrored [`Pool`], and optionally adds the skip tensor
/// recorded by that pool.
#[derive(Debug)]
pub struct Unpool {
    name: String,
    kernel_size: usize,
    skip: bool,
    input_shape: [usize; 3],
    output_shape: [usize; 3],
}

impl Unpool {
    /// Creates the stage from `plan`.
    pub fn from_plan(plan: &StagePlan) -> Result<Self> {
        let spec = plan.spec();
        if spec.kind != StageKind::Unpool {
            return Err(configuration_error!(
                "can not build an unpool from the {} stage {}",
                spec.kind,
                spec.name
            ));
        }
        let layer = Self {
            name: spec.name.clone(),
            kernel_size: spec.kernel_size,
            skip: spec.skip,
            input_shape: plan.input_shape(),
            output_shape: plan.output_shape(),
        };
        log::debug!(
            "unpool {}: {:?} -> {:?} skip = {}",
            layer.name,
            layer.input_shape,
            layer.output_shape,
            layer.skip
        );
        Ok(layer)
    }
}

impl Forward for Unpool {
    fn forward(
        &mut self,
        input: Variable4,
        aux: Option<Variable4>,
        _context: &mut Context,
    ) -> Result<Variable4> {
        check_input(&self.name, input.shape(), self.input_shape)?;
        let [height, width, channels] = self.output_shape;
        let aux = match (self.skip, aux) {
            (true, Some(aux)) => {
                let expected = [input.shape()[0], height, width, channels];
                if aux.shape() != expected {
                    return Err(shape_error!(
                        "{} can not fuse a skip tensor of shape {:?} into {expected:?}",
                        self.name,
                        aux.shape()
                    ));
                }
                Some(aux)
            }
            (true, None) => {
                return Err(configuration_error!("{} is missing its skip tensor", self.name));
            }
            (false, aux) => {
                reject_aux(&self.name, aux.as_ref())?;
                None
            }
        };
        let output = unpool2(&input, self.kernel_size, height, width)?;
        if let Some(aux) = aux {
            output.add(&aux)
        } else {
            Ok(output)
        }
    }
}

impl Layer for Unpool {
    fn name(&self) -> &str {
        &self.name
    }
    fn kind(&self) -> StageKind {
        StageKind::Unpool
    }
    fn input_shape(&self) -> [usize; 3] {
        self.input_shape
    }
    fn output_shape(&self) -> [usize; 3] {
        self.output_shape
    }
    fn skip(&self) -> bool {
        self.skip
    }
}

/// Creates the layer for `plan`.
pub(crate) fn layer_from_plan(
    plan: &StagePlan,
    weight_init: WeightInit,
    rng: &mut StdRng,
) -> Result<Box<dyn Layer>> {
    Ok(match plan.spec().kind {
        StageKind::Conv => Box::new(Conv::from_plan(plan, weight_init, rng)?),
        StageKind::ConvTranspose => Box::new(ConvTranspose::from_plan(plan, weight_init, rng)?),
        StageKind::Pool => Box::new(Pool::from_plan(plan)?),
        StageKind::Unpool => Box::new(Unpool::from_plan(plan)?),
    })
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::Error,
        learn::neural_network::{autograd::Variable, registry::LayerParams, topology::StagePlan},
    };
    use ndarray::Array4;
    use rand::SeedableRng;

    fn conv_plan(name: &str, kind: StageKind, input: [usize; 3], params: LayerParams) -> StagePlan {
        let spec = LayerSpec::resolve(name, kind, &params, Activation::Relu).unwrap();
        StagePlan::infer(spec, input).unwrap()
    }

    fn context_parts() -> (StdRng, RegularizationAccumulator) {
        (StdRng::seed_from_u64(0), RegularizationAccumulator::default())
    }

    #[test]
    fn activation_names() {
        assert_eq!(Activation::from_name("relu", 0.2).unwrap(), Activation::Relu);
        assert_eq!(
            Activation::from_name("lrelu", 0.1).unwrap(),
            Activation::LeakyRelu { leak: 0.1 }
        );
        assert_eq!(
            Activation::from_name("leaky_relu", 0.2).unwrap(),
            Activation::LeakyRelu { leak: 0.2 }
        );
        assert_eq!(Activation::from_name("none", 0.2).unwrap(), Activation::Identity);
        let error = Activation::from_name("tanh", 0.2).unwrap_err();
        assert!(error.downcast_ref::<Error>().unwrap().is_configuration());
        assert!(Activation::from_name("lrelu", 1.5).is_err());
    }

    #[test]
    fn leaky_relu_gradient() {
        let x = Array::from_iter((0..24).map(|i| i as f32 * 0.35 - 4.05))
            .into_shape((1, 2, 3, 4))
            .unwrap();
        testing::check_gradient(x, |x: Variable<Ix4>| {
            Ok(Activation::LeakyRelu { leak: 0.2 }.forward(&x))
        });
    }

    #[test]
    fn weight_init_names() {
        assert_eq!("default".parse::<WeightInit>().unwrap(), WeightInit::Default);
        assert_eq!("He".parse::<WeightInit>().unwrap(), WeightInit::He);
        assert_eq!("Xnormal".parse::<WeightInit>().unwrap(), WeightInit::XNormal);
        assert!("xavier".parse::<WeightInit>().is_err());
    }

    #[test]
    fn weight_init_is_seeded_and_bounded() {
        for init in [WeightInit::Default, WeightInit::He, WeightInit::XNormal] {
            let a = init.sample([3, 3, 8, 16], &mut StdRng::seed_from_u64(7)).unwrap();
            let b = init.sample([3, 3, 8, 16], &mut StdRng::seed_from_u64(7)).unwrap();
            assert_eq!(a, b);
            let bound = match init {
                WeightInit::Default => (6f32 / (72. + 144.)).sqrt(),
                WeightInit::He => 2. * (2.6f32 / 72.).sqrt(),
                WeightInit::XNormal => 2. * (2.6f32 / (72. + 144.)).sqrt(),
            };
            assert!(a.iter().all(|x| x.abs() <= bound + 1e-6), "{init:?}");
        }
    }

    #[test]
    fn conv_preserves_spatial_shape_and_describes() {
        let params = LayerParams::conv(3, 4).with_dilation(2);
        let plan = conv_plan("conv_1_1", StageKind::Conv, [9, 7, 2], params);
        let (mut rng, mut regularization) = context_parts();
        let mut conv = Conv::from_plan(&plan, WeightInit::He, &mut rng).unwrap();
        assert_eq!(conv.description(), "C3,4,2");
        assert_eq!(conv.output_shape(), [9, 7, 4]);
        let mut context = Context::new(Mode::Eval, &mut rng, &mut regularization);
        let output = conv
            .forward(Variable::from(Array4::ones((2, 9, 7, 2))), None, &mut context)
            .unwrap();
        assert_eq!(output.shape(), &[2, 9, 7, 4]);
        assert_eq!(regularization.len(), 1);
        let names: Vec<_> = conv.parameters().into_iter().map(|(name, _)| name).collect();
        assert_eq!(names, ["W", "b", "beta"]);
        assert_eq!(conv.statistics().len(), 2);
    }

    #[test]
    fn conv_stages_always_normalize() {
        let (mut rng, _) = context_parts();
        for kind in [StageKind::Conv, StageKind::ConvTranspose] {
            let plan = conv_plan("stage", kind, [4, 4, 2], LayerParams::conv(3, 1));
            assert!(plan.spec().batch_norm);
            let layer = layer_from_plan(&plan, WeightInit::Default, &mut rng).unwrap();
            let names: Vec<_> = layer.parameters().into_iter().map(|(name, _)| name).collect();
            assert_eq!(names, ["W", "b", "beta"], "{kind}");
            let names: Vec<_> = layer.statistics().into_iter().map(|(name, _)| name).collect();
            assert_eq!(names, ["moving_mean", "moving_variance"], "{kind}");
        }
        let params = LayerParams::conv(3, 4).with_batch_norm(false);
        let error = LayerSpec::resolve("conv_1_1", StageKind::Conv, &params, Activation::Relu)
            .unwrap_err();
        assert!(error.downcast_ref::<Error>().unwrap().is_configuration());
    }

    #[test]
    fn conv_rejects_wrong_input() {
        let plan = conv_plan("conv_1_1", StageKind::Conv, [8, 8, 1], LayerParams::conv(3, 4));
        let (mut rng, mut regularization) = context_parts();
        let mut conv = Conv::from_plan(&plan, WeightInit::Default, &mut rng).unwrap();
        let mut context = Context::new(Mode::Eval, &mut rng, &mut regularization);
        let error = conv
            .forward(Variable::from(Array4::ones((1, 8, 8, 3))), None, &mut context)
            .unwrap_err();
        assert!(error.downcast_ref::<Error>().unwrap().is_shape());
    }

    #[test]
    fn conv_transpose_rejects_batches() {
        let plan = conv_plan(
            "convt_1_1",
            StageKind::ConvTranspose,
            [4, 4, 2],
            LayerParams::conv(3, 1),
        );
        let (mut rng, mut regularization) = context_parts();
        let mut convt = ConvTranspose::from_plan(&plan, WeightInit::Default, &mut rng).unwrap();
        let mut context = Context::new(Mode::Eval, &mut rng, &mut regularization);
        let output = convt
            .forward(Variable::from(Array4::ones((1, 4, 4, 2))), None, &mut context)
            .unwrap();
        assert_eq!(output.shape(), &[1, 4, 4, 1]);
        let error = convt
            .forward(Variable::from(Array4::ones((2, 4, 4, 2))), None, &mut context)
            .unwrap_err();
        assert!(error.root_cause().downcast_ref::<Error>().unwrap().is_shape());
    }

    #[test]
    fn unpool_checks_skip_before_computing() {
        let spec = LayerSpec::resolve(
            "up_1",
            StageKind::Unpool,
            &LayerParams::pool(2).with_skip(true),
            Activation::Relu,
        )
        .unwrap();
        let plan = StagePlan::unpool(spec, [4, 4, 3], [8, 8, 3], true).unwrap();
        let mut unpool = Unpool::from_plan(&plan).unwrap();
        let (mut rng, mut regularization) = context_parts();
        let mut context = Context::new(Mode::Train, &mut rng, &mut regularization);
        let input = Variable::from(Array4::ones((1, 4, 4, 3)));
        let error = unpool
            .forward(
                input.clone(),
                Some(Variable::from(Array4::ones((1, 8, 8, 2)))),
                &mut context,
            )
            .unwrap_err();
        assert!(error.downcast_ref::<Error>().unwrap().is_shape());
        let output = unpool
            .forward(input, Some(Variable::from(Array4::ones((1, 8, 8, 3)))), &mut context)
            .unwrap();
        assert!(output.value().iter().all(|x| *x == 2.));
    }
}
