/*!
Encoder decoder networks.

A network is assembled from a [`NetworkTopology`](topology::NetworkTopology), an ordered list of
named stages whose parameters are resolved from a
[`LayerParamsRegistry`](registry::LayerParamsRegistry). The encoder may instead come from a
classification [`backbone`].

# Example
```no_run
# use anyhow::Result;
# use vesselseg::{
#     dataset::Dataset,
#     learn::neural_network::{registry::{LayerParams, LayerParamsRegistry}, Network},
# };
# fn main() -> Result<()> {
let overrides = LayerParamsRegistry::new()
    .with("conv_1_1", LayerParams::default().with_dilation(2));
let network = Network::builder()
    .dataset(Dataset::Stare)
    .layer_params(overrides)
    .build()?;
assert!(network.description().starts_with("C3,64,2"));
# Ok(())
# }
```
*/

/// Variables and Parameters
pub mod autograd;
/// Backbone encoders.
pub mod backbone;
/// Objectives and weight penalties on variables.
pub mod criterion;
/// Layers
pub mod layer;
mod network;
/// Optimizers
pub mod optimizer;
pub mod registry;
pub mod topology;

pub use network::{
    Checkpoint, Evaluation, Network, NetworkBuilder, NetworkConfig, NetworkState, RegularizerArgs,
};
