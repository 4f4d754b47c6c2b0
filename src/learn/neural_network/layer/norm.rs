use super::Mode;
use crate::{
    error::shape_error,
    learn::neural_network::autograd::{Parameter, ParameterD, Variable1, Variable4},
};
use anyhow::Result;
use ndarray::{Array1, Array2, Array4, ArrayView1, ArrayView4, Axis, Ix1};
use rand::Rng;
use rand_distr::{Bernoulli, Distribution};
use serde::{Deserialize, Serialize};

const EPSILON: f32 = 1e-3;
const MOVING_DECAY: f32 = 0.999;

fn channel_matrix(array: ArrayView4<f32>) -> Result<Array2<f32>> {
    let channels = array.shape()[3];
    let rows = array.len() / channels.max(1);
    Ok(array
        .as_standard_layout()
        .into_owned()
        .into_shape((rows, channels))?)
}

/// Batch normalization over the batch and spatial axes, with a learned offset and no scale.
///
/// In [`Mode::Train`] the batch statistics are used and folded into the moving statistics.
/// In [`Mode::Eval`] the moving statistics are used.
#[derive(Debug, Serialize, Deserialize)]
pub struct BatchNorm {
    beta: ParameterD,
    moving_mean: Array1<f32>,
    moving_variance: Array1<f32>,
}

impl BatchNorm {
    pub(crate) fn new(channels: usize) -> Self {
        Self {
            beta: Parameter::from(Array1::zeros(channels).into_dyn()),
            moving_mean: Array1::zeros(channels),
            moving_variance: Array1::ones(channels),
        }
    }
    pub(crate) fn channels(&self) -> usize {
        self.beta.len()
    }
    pub(crate) fn beta(&self) -> &ParameterD {
        &self.beta
    }
    pub(crate) fn beta_mut(&mut self) -> &mut ParameterD {
        &mut self.beta
    }
    pub(crate) fn statistics(&self) -> [(&'static str, &Array1<f32>); 2] {
        [
            ("moving_mean", &self.moving_mean),
            ("moving_variance", &self.moving_variance),
        ]
    }
    pub(crate) fn statistics_mut(&mut self) -> [(&'static str, &mut Array1<f32>); 2] {
        [
            ("moving_mean", &mut self.moving_mean),
            ("moving_variance", &mut self.moving_variance),
        ]
    }
    pub(crate) fn forward(&mut self, input: &Variable4, mode: Mode) -> Result<Variable4> {
        let channels = input.shape()[3];
        if channels != self.channels() {
            return Err(shape_error!(
                "batch norm over {} channels, found {:?}",
                self.channels(),
                input.shape()
            ));
        }
        let beta = self.beta.to_variable().into_dimensionality::<Ix1>()?;
        match mode {
            Mode::Train => {
                let (output, mean, variance) = batch_norm_train(input, &beta)?;
                self.moving_mean
                    .zip_mut_with(&mean, |m, x| *m = *m * MOVING_DECAY + x * (1. - MOVING_DECAY));
                self.moving_variance.zip_mut_with(&variance, |v, x| {
                    *v = *v * MOVING_DECAY + x * (1. - MOVING_DECAY)
                });
                Ok(output)
            }
            Mode::Eval => batch_norm_infer(
                input,
                &beta,
                self.moving_mean.view(),
                self.moving_variance.view(),
            ),
        }
    }
}

fn offset_grad(output_grad: ArrayView4<f32>) -> Result<Array1<f32>> {
    Ok(channel_matrix(output_grad)?.sum_axis(Axis(0)))
}

/// Normalizes with the batch statistics, returns the output and the batch mean and variance.
fn batch_norm_train(
    input: &Variable4,
    beta: &Variable1,
) -> Result<(Variable4, Array1<f32>, Array1<f32>)> {
    let dim = input.dim();
    let x = channel_matrix(input.value().view())?;
    let rows = x.nrows() as f32;
    let mean = x.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(x.ncols()));
    let centered = &x - &mean;
    let variance = centered.mapv(|x| x * x).sum_axis(Axis(0)) / rows.max(1.);
    let inv_std = variance.mapv(|v| 1. / (v + EPSILON).sqrt());
    let normalized = &centered * &inv_std;
    let output = (&normalized + &beta.value().view()).into_shape(dim)?;
    let mut builder = Variable4::builder();
    if let Some(node) = input.node() {
        builder.edge(node, move |output_grad| {
            let dy = channel_matrix(output_grad.view())?;
            let sum_dy = dy.sum_axis(Axis(0));
            let sum_dy_xhat = (&dy * &normalized).sum_axis(Axis(0));
            let dx = (&dy * rows - &sum_dy - &normalized * &sum_dy_xhat) * &inv_std / rows;
            Ok(dx.into_shape(dim)?.into_shared())
        });
    }
    if let Some(node) = beta.node() {
        builder.edge(node, |output_grad| {
            Ok(offset_grad(output_grad.view())?.into_shared())
        });
    }
    Ok((builder.build(output.into_shared()), mean, variance))
}

fn batch_norm_infer(
    input: &Variable4,
    beta: &Variable1,
    mean: ArrayView1<f32>,
    variance: ArrayView1<f32>,
) -> Result<Variable4> {
    let inv_std = variance.mapv(|v| 1. / (v + EPSILON).sqrt());
    let output = (input.value() - &mean) * &inv_std + &beta.value().view();
    let mut builder = Variable4::builder();
    if let Some(node) = input.node() {
        builder.edge(node, move |output_grad| {
            Ok((&output_grad * &inv_std).into_shared())
        });
    }
    if let Some(node) = beta.node() {
        builder.edge(node, |output_grad| {
            Ok(offset_grad(output_grad.view())?.into_shared())
        });
    }
    Ok(builder.build(output.into_shared()))
}

/// Per image standardization, `(x - mean) / max(std, 1 / sqrt(n))` over each image.
pub(crate) fn standardize(images: ArrayView4<f32>) -> Array4<f32> {
    let mut output = images.to_owned();
    for mut image in output.outer_iter_mut() {
        let n = image.len().max(1) as f32;
        let mean = image.sum() / n;
        let variance = image.fold(0., |acc, x| acc + (x - mean) * (x - mean)) / n;
        let scale = variance.sqrt().max(1. / n.sqrt());
        image.mapv_inplace(|x| (x - mean) / scale);
    }
    output
}

/// Inverted dropout, kept elements are scaled by `1 / keep_prob`.
///
/// Identity when `keep_prob` is 1.
pub(crate) fn dropout<R: Rng>(input: &Variable4, keep_prob: f32, rng: &mut R) -> Result<Variable4> {
    if keep_prob >= 1. {
        return Ok(input.clone());
    }
    let bernoulli = Bernoulli::new(keep_prob.into())?;
    let scale = 1. / keep_prob;
    let mask = Array4::from_shape_simple_fn(input.raw_dim(), || {
        if bernoulli.sample(&mut *rng) {
            scale
        } else {
            0.
        }
    });
    let output = input.value() * &mask;
    let mut builder = Variable4::builder();
    if let Some(node) = input.node() {
        builder.edge(node, move |output_grad| Ok((&output_grad * &mask).into_shared()));
    }
    Ok(builder.build(output.into_shared()))
}
