//! Network topologies and the assembler.
//!
//! A [`NetworkTopology`] is an ordered list of encoder and decoder stages plus the default
//! [`LayerParamsRegistry`] of the family. [`NetworkTopology::assemble`] resolves every stage and
//! infers its shapes in a single linear pass, so that every mismatch surfaces before any
//! parameter is allocated.
//!
//! Skip connections follow a stack discipline: every pool pushes its input shape, every unpool
//! pops the most recent one and restores it. An unpool with `skip` adds the tensor its mirrored
//! pool recorded.
use super::{
    layer::{layer_from_plan, ActivationPolicy, Layer, StageKind, WeightInit},
    registry::{LayerParams, LayerParamsRegistry, LayerSpec},
};
use crate::error::{configuration_error, shape_error};
use anyhow::Result;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A named stage of a topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDef {
    /// The name, used as the key into the registry and for checkpoints.
    pub name: String,
    /// The kind.
    pub kind: StageKind,
}

impl StageDef {
    /// A stage named `name` of `kind`.
    pub fn new(name: impl Into<String>, kind: StageKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
    /// A convolution.
    pub fn conv(name: impl Into<String>) -> Self {
        Self::new(name, StageKind::Conv)
    }
    /// A transpose convolution.
    pub fn conv_transpose(name: impl Into<String>) -> Self {
        Self::new(name, StageKind::ConvTranspose)
    }
    /// A max pool.
    pub fn pool(name: impl Into<String>) -> Self {
        Self::new(name, StageKind::Pool)
    }
    /// An unpool.
    pub fn unpool(name: impl Into<String>) -> Self {
        Self::new(name, StageKind::Unpool)
    }
}

/// Ordered encoder and decoder stages with default parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkTopology {
    name: String,
    encoder: Vec<StageDef>,
    decoder: Vec<StageDef>,
    defaults: LayerParamsRegistry,
}

impl NetworkTopology {
    /// Creates a topology.
    ///
    /// `defaults` should have params for every stage, this is checked by
    /// [`assemble()`](Self::assemble).
    pub fn new(
        name: impl Into<String>,
        encoder: Vec<StageDef>,
        decoder: Vec<StageDef>,
        defaults: LayerParamsRegistry,
    ) -> Self {
        Self {
            name: name.into(),
            encoder,
            decoder,
            defaults,
        }
    }
    /// The 6 block VGG style family.
    ///
    /// The encoder has 5 pools, the decoder mirrors it with transpose convolutions and adds the
    /// input of every pool back at its unpool.
    pub fn large() -> Self {
        let encoder = vec![
            StageDef::conv("conv_1_1"),
            StageDef::pool("pool_1"),
            StageDef::conv("conv_2_1"),
            StageDef::pool("pool_2"),
            StageDef::conv("conv_3_1"),
            StageDef::conv("conv_3_2"),
            StageDef::pool("pool_3"),
            StageDef::conv("conv_4_1"),
            StageDef::conv("conv_4_2"),
            StageDef::pool("pool_4"),
            StageDef::conv("conv_5_1"),
            StageDef::conv("conv_5_2"),
            StageDef::pool("pool_5"),
            StageDef::conv("conv_6_1"),
            StageDef::conv("conv_6_2"),
        ];
        let decoder = vec![
            StageDef::conv_transpose("convt_6_2"),
            StageDef::conv_transpose("convt_6_1"),
            StageDef::unpool("up_5"),
            StageDef::conv_transpose("convt_5_2"),
            StageDef::conv_transpose("convt_5_1"),
            StageDef::unpool("up_4"),
            StageDef::conv_transpose("convt_4_2"),
            StageDef::conv_transpose("convt_4_1"),
            StageDef::unpool("up_3"),
            StageDef::conv_transpose("convt_3_2"),
            StageDef::conv_transpose("convt_3_1"),
            StageDef::unpool("up_2"),
            StageDef::conv_transpose("convt_2_1"),
            StageDef::unpool("up_1"),
            StageDef::conv_transpose("convt_1_1"),
        ];
        let conv = |kernel_size, output_channels| {
            LayerParams::conv(kernel_size, output_channels)
                .with_keep_prob(1.)
                .with_batch_norm(true)
        };
        let pool = || LayerParams::pool(2).with_skip(true);
        let defaults = [
            ("conv_1_1", conv(3, 64)),
            ("pool_1", pool()),
            ("conv_2_1", conv(3, 128)),
            ("pool_2", pool()),
            ("conv_3_1", conv(3, 256)),
            ("conv_3_2", conv(3, 256)),
            ("pool_3", pool()),
            ("conv_4_1", conv(3, 512)),
            ("conv_4_2", conv(3, 512)),
            ("pool_4", pool()),
            ("conv_5_1", conv(3, 512)),
            ("conv_5_2", conv(3, 512)),
            ("pool_5", pool()),
            ("conv_6_1", conv(7, 4096)),
            ("conv_6_2", conv(1, 4096)),
            ("convt_6_2", conv(1, 4096)),
            ("convt_6_1", conv(7, 512)),
            ("up_5", pool()),
            ("convt_5_2", conv(3, 512)),
            ("convt_5_1", conv(3, 512)),
            ("up_4", pool()),
            ("convt_4_2", conv(3, 512)),
            ("convt_4_1", conv(3, 256)),
            ("up_3", pool()),
            ("convt_3_2", conv(3, 256)),
            ("convt_3_1", conv(3, 128)),
            ("up_2", pool()),
            ("convt_2_1", conv(3, 64)),
            ("up_1", pool()),
            ("convt_1_1", conv(3, 1).with_activation("identity")),
        ]
        .into_iter()
        .collect();
        Self::new("large", encoder, decoder, defaults)
    }
    /// The 4 block family.
    ///
    /// The encoder has 3 pools, the decoder is symmetric with skip connections at every unpool.
    pub fn small() -> Self {
        let encoder = vec![
            StageDef::conv("conv_1_1"),
            StageDef::pool("pool_1"),
            StageDef::conv("conv_2_1"),
            StageDef::pool("pool_2"),
            StageDef::conv("conv_3_1"),
            StageDef::conv("conv_3_2"),
            StageDef::pool("pool_3"),
            StageDef::conv("conv_4_1"),
            StageDef::conv("conv_4_2"),
        ];
        let decoder = vec![
            StageDef::conv_transpose("convt_5_1"),
            StageDef::conv_transpose("convt_5_2"),
            StageDef::unpool("up_6"),
            StageDef::conv_transpose("convt_6_1"),
            StageDef::conv_transpose("convt_6_2"),
            StageDef::unpool("up_7"),
            StageDef::conv_transpose("convt_7_1"),
            StageDef::unpool("up_8"),
            StageDef::conv_transpose("convt_8_1"),
        ];
        let conv = |kernel_size, output_channels| {
            LayerParams::conv(kernel_size, output_channels)
                .with_dilation(1)
                .with_keep_prob(1.)
                .with_batch_norm(true)
        };
        let pool = || LayerParams::pool(2).with_skip(true);
        let defaults = [
            ("conv_1_1", conv(3, 64)),
            ("pool_1", pool()),
            ("conv_2_1", conv(3, 128)),
            ("pool_2", pool()),
            ("conv_3_1", conv(3, 256)),
            ("conv_3_2", conv(3, 256)),
            ("pool_3", pool()),
            ("conv_4_1", conv(7, 4096)),
            ("conv_4_2", conv(1, 4096)),
            ("convt_5_1", conv(1, 4096)),
            ("convt_5_2", conv(7, 256)),
            ("up_6", pool()),
            ("convt_6_1", conv(3, 256)),
            ("convt_6_2", conv(3, 128)),
            ("up_7", pool()),
            ("convt_7_1", conv(3, 64)),
            ("up_8", pool()),
            ("convt_8_1", conv(3, 1).with_activation("identity")),
        ]
        .into_iter()
        .collect();
        Self::new("small", encoder, decoder, defaults)
    }
    /// The name of the family.
    pub fn name(&self) -> &str {
        &self.name
    }
    /// The encoder stages.
    pub fn encoder(&self) -> &[StageDef] {
        &self.encoder
    }
    /// The decoder stages.
    pub fn decoder(&self) -> &[StageDef] {
        &self.decoder
    }
    /// The default parameters.
    pub fn defaults(&self) -> &LayerParamsRegistry {
        &self.defaults
    }
    /// Merges `overrides` into the defaults.
    ///
    /// See [`LayerParamsRegistry::merge`].
    pub fn with_overrides(mut self, overrides: &LayerParamsRegistry) -> Result<Self> {
        self.defaults = self.defaults.merge(overrides)?;
        Ok(self)
    }
    /// Resolves and shape checks every stage for an input of `[height, width, channels]`.
    ///
    /// `activation` is the network activation, an [`Activation`](super::layer::Activation) or an [`ActivationPolicy`]
    /// carrying the leak of per stage "lrelu" overrides.
    ///
    /// **Errors**
    /// - [`Error::Configuration`](crate::error::Error::Configuration) for duplicate names,
    ///   unresolvable params, an unpool without a pool to mirror, or a skip from a pool that does
    ///   not record one.
    /// - [`Error::Shape`](crate::error::Error::Shape) if a pool window does not fit, an unpool can
    ///   not restore its pool's shape, or a skip tensor does not match.
    pub fn assemble(
        &self,
        input_shape: [usize; 3],
        activation: impl Into<ActivationPolicy>,
    ) -> Result<Assembly> {
        let activation: ActivationPolicy = activation.into();
        if input_shape.contains(&0) {
            return Err(shape_error!("invalid input shape {input_shape:?}"));
        }
        let mut names = HashSet::new();
        let mut pools = Vec::<PoolRecord>::new();
        let mut shape = input_shape;
        let mut plan_stages = |stages: &[StageDef]| -> Result<Vec<StagePlan>> {
            let mut plans = Vec::with_capacity(stages.len());
            for stage in stages {
                if !names.insert(stage.name.clone()) {
                    return Err(configuration_error!(
                        "duplicate stage {:?} in {}",
                        stage.name,
                        self.name
                    ));
                }
                let spec = self.defaults.resolve(&stage.name, stage.kind, activation)?;
                let plan = match stage.kind {
                    StageKind::Unpool => {
                        let pool = pools.pop().ok_or_else(|| {
                            configuration_error!("{} has no pool to mirror", stage.name)
                        })?;
                        StagePlan::unpool(spec, shape, pool.input_shape, pool.skip).map_err(
                            |e| e.context(format!("{} mirrors {}", stage.name, pool.name)),
                        )?
                    }
                    kind => {
                        let plan = StagePlan::infer(spec, shape)?;
                        if kind == StageKind::Pool {
                            pools.push(PoolRecord {
                                name: stage.name.clone(),
                                input_shape: shape,
                                skip: plan.spec.skip,
                            });
                        }
                        plan
                    }
                };
                shape = plan.output_shape;
                plans.push(plan);
            }
            Ok(plans)
        };
        let encoder = plan_stages(&self.encoder)?;
        let decoder = plan_stages(&self.decoder)?;
        Ok(Assembly {
            input_shape,
            encoder,
            decoder,
        })
    }
}

struct PoolRecord {
    name: String,
    input_shape: [usize; 3],
    skip: bool,
}

/// A resolved stage with its inferred shapes.
#[derive(Debug, Clone, PartialEq)]
pub struct StagePlan {
    spec: LayerSpec,
    input_shape: [usize; 3],
    output_shape: [usize; 3],
}

impl StagePlan {
    /// Infers the output shape of a convolution or pool.
    pub(crate) fn infer(spec: LayerSpec, input_shape: [usize; 3]) -> Result<Self> {
        let [height, width, channels] = input_shape;
        let output_shape = match spec.kind {
            StageKind::Conv | StageKind::ConvTranspose => {
                let output_channels = spec.output_channels.ok_or_else(|| {
                    configuration_error!("{} is missing output_channels", spec.name)
                })?;
                [height, width, output_channels]
            }
            StageKind::Pool => {
                let k = spec.kernel_size;
                if height < k || width < k {
                    return Err(shape_error!(
                        "{} can not pool {height}x{width} with a {k}x{k} window",
                        spec.name
                    ));
                }
                [height / k, width / k, channels]
            }
            StageKind::Unpool => {
                return Err(configuration_error!(
                    "{} must be planned against its mirrored pool",
                    spec.name
                ));
            }
        };
        Ok(Self {
            spec,
            input_shape,
            output_shape,
        })
    }
    /// Plans an unpool restoring `pool_input_shape`.
    ///
    /// If the unpool fuses a skip tensor, `pool_skip` must be true and the channels must match.
    pub(crate) fn unpool(
        spec: LayerSpec,
        input_shape: [usize; 3],
        pool_input_shape: [usize; 3],
        pool_skip: bool,
    ) -> Result<Self> {
        let k = spec.kernel_size;
        let [height, width, channels] = input_shape;
        let [pool_height, pool_width, pool_channels] = pool_input_shape;
        if pool_height / k != height || pool_width / k != width {
            return Err(shape_error!(
                "{} can not upsample {height}x{width} by {k} to {pool_height}x{pool_width}",
                spec.name
            ));
        }
        if spec.skip {
            if !pool_skip {
                return Err(configuration_error!(
                    "{} fuses a skip tensor but its pool does not record one",
                    spec.name
                ));
            }
            if pool_channels != channels {
                return Err(shape_error!(
                    "{} can not add a skip tensor of {pool_channels} channels to {channels} channels",
                    spec.name
                ));
            }
        }
        Ok(Self {
            spec,
            input_shape,
            output_shape: [pool_height, pool_width, channels],
        })
    }
    /// The resolved spec.
    pub fn spec(&self) -> &LayerSpec {
        &self.spec
    }
    /// The input shape `[height, width, channels]`.
    pub fn input_shape(&self) -> [usize; 3] {
        self.input_shape
    }
    /// The output shape `[height, width, channels]`.
    pub fn output_shape(&self) -> [usize; 3] {
        self.output_shape
    }
    /// The number of trainable elements the stage will allocate.
    pub fn parameter_count(&self) -> usize {
        match self.spec.output_channels {
            Some(outputs) if self.spec.kind.is_conv_like() => {
                let k = self.spec.kernel_size;
                k * k * self.input_shape[2] * outputs + 2 * outputs
            }
            _ => 0,
        }
    }
}

/// The planned encoder and decoder of a network.
#[derive(Debug, Clone, PartialEq)]
pub struct Assembly {
    input_shape: [usize; 3],
    encoder: Vec<StagePlan>,
    decoder: Vec<StagePlan>,
}

impl Assembly {
    /// The input shape `[height, width, channels]`.
    pub fn input_shape(&self) -> [usize; 3] {
        self.input_shape
    }
    /// The encoder stages.
    pub fn encoder(&self) -> &[StagePlan] {
        &self.encoder
    }
    /// The decoder stages.
    pub fn decoder(&self) -> &[StagePlan] {
        &self.decoder
    }
    /// Encoder then decoder stages.
    pub fn stages(&self) -> impl Iterator<Item = &StagePlan> {
        self.encoder.iter().chain(self.decoder.iter())
    }
    /// The output shape of the last stage.
    pub fn output_shape(&self) -> [usize; 3] {
        self.stages()
            .last()
            .map_or(self.input_shape, StagePlan::output_shape)
    }
    /// The concatenated descriptions of every stage.
    pub fn description(&self) -> String {
        self.stages().map(|stage| stage.spec.description()).collect()
    }
    /// The number of trainable elements.
    pub fn parameter_count(&self) -> usize {
        self.stages().map(StagePlan::parameter_count).sum()
    }
    /// Creates the encoder and decoder layers.
    pub fn instantiate(
        &self,
        weight_init: WeightInit,
        rng: &mut StdRng,
    ) -> Result<(Vec<Box<dyn Layer>>, Vec<Box<dyn Layer>>)> {
        let mut build = |plans: &[StagePlan]| {
            plans
                .iter()
                .map(|plan| layer_from_plan(plan, weight_init, rng))
                .collect::<Result<Vec<_>>>()
        };
        let encoder = build(&self.encoder)?;
        let decoder = build(&self.decoder)?;
        Ok((encoder, decoder))
    }
}
