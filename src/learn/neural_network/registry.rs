//! Layer parameters by stage name.
//!
//! A [`LayerParamsRegistry`] maps each stage of a network family to a partial [`LayerParams`]
//! record. Callers override the defaults of a family with a registry of their own, see
//! [`LayerParamsRegistry::merge`]. Each stage is then resolved into a complete [`LayerSpec`].
//!
//! Registries deserialize from JSON, with the field aliases `ks` for `kernel_size` and
//! `add_to_input` for `skip`:
//!
//!```
//! # use vesselseg::learn::neural_network::registry::LayerParamsRegistry;
//! let overrides: LayerParamsRegistry = serde_json::from_str(r#"{
//!     "conv_1_1": {"ks": 5, "dilation": 2},
//!     "up_8": {"add_to_input": false}
//! }"#).unwrap();
//! assert_eq!(overrides.get("conv_1_1").unwrap().kernel_size, Some(5));
//!```
use super::layer::{Activation, ActivationPolicy, StageKind};
use crate::error::configuration_error;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Partial parameters of a stage.
///
/// Unknown fields are rejected when deserializing.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LayerParams {
    /// The kernel size, or the window of a pool / unpool.
    #[serde(alias = "ks", default, skip_serializing_if = "Option::is_none")]
    pub kernel_size: Option<usize>,
    /// The dilation rate of a convolution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dilation: Option<usize>,
    /// The number of output channels of a convolution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_channels: Option<usize>,
    /// The probability of keeping an element in dropout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_prob: Option<f32>,
    /// Every convolution normalizes its output, only `true` is accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_norm: Option<bool>,
    /// Whether an unpool adds the skip tensor of its mirrored pool, or whether a pool records one.
    #[serde(alias = "add_to_input", default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<bool>,
    /// Activation name overriding the network activation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activation: Option<String>,
}

impl LayerParams {
    /// Convolution parameters with `kernel_size` and `output_channels`.
    pub fn conv(kernel_size: usize, output_channels: usize) -> Self {
        Self {
            kernel_size: Some(kernel_size),
            output_channels: Some(output_channels),
            ..Self::default()
        }
    }
    /// Pool or unpool parameters with `kernel_size`.
    pub fn pool(kernel_size: usize) -> Self {
        Self {
            kernel_size: Some(kernel_size),
            ..Self::default()
        }
    }
    /// Sets the dilation.
    pub fn with_dilation(self, dilation: usize) -> Self {
        Self {
            dilation: Some(dilation),
            ..self
        }
    }
    /// Sets the keep probability.
    pub fn with_keep_prob(self, keep_prob: f32) -> Self {
        Self {
            keep_prob: Some(keep_prob),
            ..self
        }
    }
    /// Sets batch normalization.
    pub fn with_batch_norm(self, batch_norm: bool) -> Self {
        Self {
            batch_norm: Some(batch_norm),
            ..self
        }
    }
    /// Sets skip.
    pub fn with_skip(self, skip: bool) -> Self {
        Self {
            skip: Some(skip),
            ..self
        }
    }
    /// Sets the activation by name.
    pub fn with_activation(self, activation: impl Into<String>) -> Self {
        Self {
            activation: Some(activation.into()),
            ..self
        }
    }
    /// Fields set in `overrides` replace those of `self`.
    pub fn merge(&self, overrides: &Self) -> Self {
        Self {
            kernel_size: overrides.kernel_size.or(self.kernel_size),
            dilation: overrides.dilation.or(self.dilation),
            output_channels: overrides.output_channels.or(self.output_channels),
            keep_prob: overrides.keep_prob.or(self.keep_prob),
            batch_norm: overrides.batch_norm.or(self.batch_norm),
            skip: overrides.skip.or(self.skip),
            activation: overrides
                .activation
                .clone()
                .or_else(|| self.activation.clone()),
        }
    }
    fn conv_fields(&self) -> impl Iterator<Item = &'static str> + '_ {
        [
            ("dilation", self.dilation.is_some()),
            ("output_channels", self.output_channels.is_some()),
            ("keep_prob", self.keep_prob.is_some()),
            ("batch_norm", self.batch_norm.is_some()),
            ("activation", self.activation.is_some()),
        ]
        .into_iter()
        .filter_map(|(field, set)| set.then_some(field))
    }
}

/// Parameters by stage name.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayerParamsRegistry {
    layers: BTreeMap<String, LayerParams>,
}

impl LayerParamsRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }
    /// Adds `params` for `name`, builder style.
    pub fn with(mut self, name: impl Into<String>, params: LayerParams) -> Self {
        self.insert(name, params);
        self
    }
    /// Inserts `params` for `name`, returning the previous params.
    pub fn insert(&mut self, name: impl Into<String>, params: LayerParams) -> Option<LayerParams> {
        self.layers.insert(name.into(), params)
    }
    /// The params of `name`.
    pub fn get(&self, name: &str) -> Option<&LayerParams> {
        self.layers.get(name)
    }
    /// Whether `name` has params.
    pub fn contains(&self, name: &str) -> bool {
        self.layers.contains_key(name)
    }
    /// Iterates over names and params, ordered by name.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &LayerParams)> {
        self.layers
            .iter()
            .map(|(name, params)| (name.as_str(), params))
    }
    /// The number of stages.
    pub fn len(&self) -> usize {
        self.layers.len()
    }
    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
    /// Deep merges `overrides` into `self`.
    ///
    /// For every name in `overrides`, the fields it sets replace those of `self`. Names not in
    /// `overrides` are untouched. Merging the same overrides again has no further effect.
    ///
    /// **Errors**
    ///
    /// [`Error::Configuration`](crate::error::Error::Configuration) if `overrides` names a stage
    /// that `self` does not have.
    pub fn merge(&self, overrides: &Self) -> Result<Self> {
        let mut merged = self.clone();
        for (name, params) in overrides.layers.iter() {
            let defaults = merged.layers.get_mut(name).ok_or_else(|| {
                configuration_error!(
                    "unknown stage {name:?} in layer params, expected one of {:?}",
                    self.layers.keys().collect::<Vec<_>>()
                )
            })?;
            *defaults = defaults.merge(params);
        }
        Ok(merged)
    }
    /// Resolves the spec of stage `name` of `kind`.
    ///
    /// `activation` is the network activation, used unless the stage overrides it. Overrides
    /// take the leak of `activation`.
    ///
    /// **Errors**
    ///
    /// [`Error::Configuration`](crate::error::Error::Configuration) if `name` has no params or
    /// they are incomplete, out of range, or not applicable to `kind`.
    pub fn resolve(
        &self,
        name: &str,
        kind: StageKind,
        activation: impl Into<ActivationPolicy>,
    ) -> Result<LayerSpec> {
        let params = self
            .get(name)
            .ok_or_else(|| configuration_error!("no layer params for stage {name:?}"))?;
        LayerSpec::resolve(name, kind, params, activation)
    }
}

impl<S: Into<String>> FromIterator<(S, LayerParams)> for LayerParamsRegistry {
    fn from_iter<I: IntoIterator<Item = (S, LayerParams)>>(iter: I) -> Self {
        Self {
            layers: iter
                .into_iter()
                .map(|(name, params)| (name.into(), params))
                .collect(),
        }
    }
}

/// The complete, validated configuration of one stage.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerSpec {
    /// Unique within a network.
    pub name: String,
    /// The kind of stage.
    pub kind: StageKind,
    /// Kernel or window size, > 0.
    pub kernel_size: usize,
    /// >= 1, 1 for pools.
    pub dilation: usize,
    /// Output channels of a convolution, `None` for pools.
    pub output_channels: Option<usize>,
    /// In (0, 1].
    pub keep_prob: f32,
    /// Whether batch normalization is applied, true for every convolution.
    pub batch_norm: bool,
    /// The activation, [`Activation::Identity`] for pools.
    pub activation: Activation,
    /// Skip connection.
    pub skip: bool,
}

impl LayerSpec {
    /// Resolves `params` for the stage `name` of `kind`.
    ///
    /// Convolutions require `kernel_size` and `output_channels`, `dilation` defaults to 1,
    /// `keep_prob` to 1 and the activation to the one of `activation`. An activation named by
    /// `params` takes the leak of `activation`. Convolutions always normalize, `batch_norm` may
    /// only be true. Pools and unpools require `kernel_size`, accept `skip` and reject the
    /// convolution fields. Convolutions do not take skip connections.
    ///
    /// **Errors**
    ///
    /// [`Error::Configuration`](crate::error::Error::Configuration) on missing, invalid or
    /// inapplicable fields.
    pub fn resolve(
        name: &str,
        kind: StageKind,
        params: &LayerParams,
        activation: impl Into<ActivationPolicy>,
    ) -> Result<Self> {
        let kernel_size = params
            .kernel_size
            .ok_or_else(|| configuration_error!("{name} is missing kernel_size"))?;
        if kernel_size == 0 {
            return Err(configuration_error!("{name} has kernel_size 0"));
        }
        let skip = params.skip.unwrap_or(false);
        if !kind.is_conv_like() {
            let fields: Vec<_> = params.conv_fields().collect();
            if !fields.is_empty() {
                return Err(configuration_error!(
                    "{kind} stage {name} does not accept {fields:?}"
                ));
            }
            return Ok(Self {
                name: name.into(),
                kind,
                kernel_size,
                dilation: 1,
                output_channels: None,
                keep_prob: 1.,
                batch_norm: false,
                activation: Activation::Identity,
                skip,
            });
        }
        if skip {
            return Err(configuration_error!(
                "{kind} stage {name} can not take a skip connection, skips are fused by unpools"
            ));
        }
        let output_channels = params
            .output_channels
            .ok_or_else(|| configuration_error!("{name} is missing output_channels"))?;
        if output_channels == 0 {
            return Err(configuration_error!("{name} has 0 output_channels"));
        }
        let dilation = params.dilation.unwrap_or(1);
        if dilation == 0 {
            return Err(configuration_error!("{name} has dilation 0"));
        }
        let keep_prob = params.keep_prob.unwrap_or(1.);
        if !(keep_prob > 0. && keep_prob <= 1.) {
            return Err(configuration_error!(
                "{name} has keep_prob {keep_prob}, expected (0, 1]"
            ));
        }
        if params.batch_norm == Some(false) {
            return Err(configuration_error!(
                "{kind} stage {name} can not disable batch normalization"
            ));
        }
        let policy: ActivationPolicy = activation.into();
        let activation = policy.resolve(params.activation.as_deref())?;
        Ok(Self {
            name: name.into(),
            kind,
            kernel_size,
            dilation,
            output_channels: Some(output_channels),
            keep_prob,
            batch_norm: true,
            activation,
            skip,
        })
    }
    /// `"C{kernel},{channels},{dilation}"` for convolutions, empty for pools.
    pub fn description(&self) -> String {
        match self.output_channels {
            Some(channels) if self.kind.is_conv_like() => {
                format!("C{},{},{}", self.kernel_size, channels, self.dilation)
            }
            _ => String::new(),
        }
    }
}
