/*!
# **vesselseg**
Configurable convolutional encoder decoder networks for pixel wise vessel segmentation of retinal
and angiographic images.

Networks are described declaratively: a [`NetworkTopology`](learn::neural_network::topology::NetworkTopology)
names every stage, a [`LayerParamsRegistry`](learn::neural_network::registry::LayerParamsRegistry)
holds their parameters, and the assembler checks every shape before allocating anything. Training
runs on the host with a small reverse mode [`autograd`](learn::neural_network::autograd).

# Errors
Every public operation returns [`anyhow::Result`], see [`error::Error`] for the conditions that can
be recovered from it.

# Logging
The crate logs through [`log`]. Layer construction is logged at debug, network construction and
checkpoints at info, training steps at trace.
*/
#![warn(missing_docs)]

/// Dataset geometries.
pub mod dataset;
/// Errors.
pub mod error;
/// Machine Learning.
pub mod learn;
