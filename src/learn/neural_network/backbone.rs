//! Classification backbones as encoders.
//!
//! A backbone replaces the encoder of a family with the convolutional base of an image
//! classification network, optionally sliced at a named layer. The decoder is derived by
//! mirroring the encoder: every convolution becomes a transpose convolution restoring the
//! convolution's input channels, every pool becomes an unpool.
//!
//! Backbones expect 3 channel images, the single input channel is always triplicated before the
//! first stage.
//!
//!```
//! # use vesselseg::learn::neural_network::backbone::{Backbone, BackboneConfig};
//! let config = BackboneConfig::new(Backbone::Vgg16).with_output_layer("block2_pool");
//! let topology = config.topology(1).unwrap();
//! assert_eq!(topology.encoder().len(), 6);
//! assert_eq!(topology.decoder().last().unwrap().name, "block1_conv1_t");
//!```
use super::{
    registry::{LayerParams, LayerParamsRegistry},
    topology::{NetworkTopology, StageDef},
};
use crate::error::configuration_error;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// The number of channels a backbone consumes.
pub const BACKBONE_INPUT_CHANNELS: usize = 3;

/// Convolutional bases of the VGG family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backbone {
    /// 13 convolutions in 5 blocks.
    Vgg16,
    /// 16 convolutions in 5 blocks.
    Vgg19,
}

impl FromStr for Backbone {
    type Err = anyhow::Error;
    fn from_str(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "vgg16" => Ok(Self::Vgg16),
            "vgg19" => Ok(Self::Vgg19),
            _ => Err(configuration_error!(
                "backbone {name:?} not recognized, expected \"vgg16\" or \"vgg19\""
            )),
        }
    }
}

impl Backbone {
    /// `(convolutions, channels)` per block.
    fn blocks(&self) -> [(usize, usize); 5] {
        match self {
            Self::Vgg16 => [(2, 64), (2, 128), (3, 256), (3, 512), (3, 512)],
            Self::Vgg19 => [(2, 64), (2, 128), (4, 256), (4, 512), (4, 512)],
        }
    }
    /// The stages of the convolutional base with their output channels, named
    /// `blockN_convM` and `blockN_pool`.
    pub fn stages(&self) -> Vec<(StageDef, usize)> {
        let mut stages = Vec::new();
        for (block, (convs, channels)) in self.blocks().into_iter().enumerate() {
            let block = block + 1;
            for conv in 1..=convs {
                stages.push((StageDef::conv(format!("block{block}_conv{conv}")), channels));
            }
            stages.push((StageDef::pool(format!("block{block}_pool")), channels));
        }
        stages
    }
}

/// What happens to the weights of a backbone.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackbonePolicy {
    /// The topology of the backbone is kept, its weights are initialized like any other stage.
    ///
    /// Pretrained statistics would interact with the batch normalization of the decoder.
    #[default]
    RandomlyInitializedTopology,
}

/// Configures a backbone encoder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackboneConfig {
    /// The backbone.
    pub backbone: Backbone,
    /// The last stage of the encoder, the whole base if `None`.
    #[serde(default)]
    pub output_layer: Option<String>,
    /// Whether unpools add the input of their mirrored pool.
    #[serde(default)]
    pub skip_connections: bool,
    /// The weight policy.
    #[serde(default)]
    pub policy: BackbonePolicy,
}

impl BackboneConfig {
    /// The whole base of `backbone`, without skip connections.
    pub fn new(backbone: Backbone) -> Self {
        Self {
            backbone,
            output_layer: None,
            skip_connections: false,
            policy: BackbonePolicy::default(),
        }
    }
    /// Slices the base at `output_layer`, inclusive.
    pub fn with_output_layer(self, output_layer: impl Into<String>) -> Self {
        Self {
            output_layer: Some(output_layer.into()),
            ..self
        }
    }
    /// Enables skip connections.
    pub fn with_skip_connections(self, skip_connections: bool) -> Self {
        Self {
            skip_connections,
            ..self
        }
    }
    /// Derives the topology, the last decoder stage outputs `classes` channels.
    ///
    /// **Errors**
    ///
    /// [`Error::Configuration`](crate::error::Error::Configuration) if the output layer is not a
    /// stage of the backbone.
    pub fn topology(&self, classes: usize) -> Result<NetworkTopology> {
        match self.policy {
            BackbonePolicy::RandomlyInitializedTopology => (),
        }
        let mut stages = self.backbone.stages();
        if let Some(output_layer) = self.output_layer.as_deref() {
            let position = stages
                .iter()
                .position(|(stage, _)| stage.name == output_layer)
                .ok_or_else(|| {
                    configuration_error!(
                        "{output_layer:?} is not a layer of {:?}",
                        self.backbone
                    )
                })?;
            stages.truncate(position + 1);
        }
        let mut defaults = LayerParamsRegistry::new();
        let mut encoder = Vec::with_capacity(stages.len());
        // Mirrored stages with the channels they restore.
        let mut mirrored = Vec::with_capacity(stages.len());
        let mut channels = BACKBONE_INPUT_CHANNELS;
        for (stage, outputs) in stages {
            if stage.kind.is_conv_like() {
                defaults.insert(
                    stage.name.clone(),
                    LayerParams::conv(3, outputs).with_activation("relu"),
                );
                mirrored.push((StageDef::conv_transpose(format!("{}_t", stage.name)), channels));
            } else {
                defaults.insert(
                    stage.name.clone(),
                    LayerParams::pool(2).with_skip(self.skip_connections),
                );
                let name = stage.name.replace("_pool", "_unpool");
                mirrored.push((StageDef::unpool(name), channels));
            }
            channels = outputs;
            encoder.push(stage);
        }
        let last = mirrored.iter().position(|(stage, _)| stage.kind.is_conv_like());
        let mut decoder = Vec::with_capacity(mirrored.len());
        for (index, (stage, restored)) in mirrored.into_iter().enumerate().rev() {
            let params = if stage.kind.is_conv_like() {
                if Some(index) == last {
                    LayerParams::conv(3, classes).with_activation("identity")
                } else {
                    LayerParams::conv(3, restored)
                }
            } else {
                LayerParams::pool(2).with_skip(self.skip_connections)
            };
            defaults.insert(stage.name.clone(), params);
            decoder.push(stage);
        }
        let name = format!("{:?}", self.backbone).to_ascii_lowercase();
        Ok(NetworkTopology::new(name, encoder, decoder, defaults))
    }
}

/// Where the encoder comes from.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderSource {
    /// The stages of the network family.
    #[default]
    Stages,
    /// A classification backbone.
    Backbone(BackboneConfig),
}

impl EncoderSource {
    /// Whether the input is triplicated before the encoder.
    pub fn input_channels(&self) -> Option<usize> {
        match self {
            Self::Stages => None,
            Self::Backbone(_) => Some(BACKBONE_INPUT_CHANNELS),
        }
    }
}
