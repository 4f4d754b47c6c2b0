use crate::{
    error::shape_error,
    learn::neural_network::autograd::{Variable1, Variable4},
};
use anyhow::Result;
use ndarray::{s, Array2, Array4, ArrayView2, ArrayView4, Axis};
use std::sync::{Arc, OnceLock};

/// Padding before the first row / column for SAME output with `kernel` and `dilation`.
///
/// The remainder of the effective kernel is padded after.
pub(super) fn same_padding(kernel: usize, dilation: usize) -> usize {
    ((kernel - 1) * dilation) / 2
}

fn source_index(position: usize, offset: usize, pad: usize, len: usize) -> Option<usize> {
    (position + offset)
        .checked_sub(pad)
        .filter(|index| *index < len)
}

/// Unfolds NHWC `input` into rows of `[kernel, kernel, channels]` patches, one row per output
/// pixel.
fn im2col(input: ArrayView4<f32>, kernel: usize, dilation: usize) -> Array2<f32> {
    let (n, h, w, c) = input.dim();
    let pad = same_padding(kernel, dilation);
    let mut cols = Array2::zeros((n * h * w, kernel * kernel * c));
    for b in 0..n {
        for y in 0..h {
            for x in 0..w {
                let mut row = cols.row_mut((b * h + y) * w + x);
                for ky in 0..kernel {
                    let iy = if let Some(iy) = source_index(y, ky * dilation, pad, h) {
                        iy
                    } else {
                        continue;
                    };
                    for kx in 0..kernel {
                        if let Some(ix) = source_index(x, kx * dilation, pad, w) {
                            let offset = (ky * kernel + kx) * c;
                            row.slice_mut(s![offset..offset + c])
                                .assign(&input.slice(s![b, iy, ix, ..]));
                        }
                    }
                }
            }
        }
    }
    cols
}

/// Adjoint of [`im2col`], summing overlapping patches into an NHWC array of `dim`.
fn col2im(
    cols: ArrayView2<f32>,
    dim: (usize, usize, usize, usize),
    kernel: usize,
    dilation: usize,
) -> Array4<f32> {
    let (n, h, w, c) = dim;
    let pad = same_padding(kernel, dilation);
    let mut output = Array4::zeros(dim);
    for b in 0..n {
        for y in 0..h {
            for x in 0..w {
                let row = cols.row((b * h + y) * w + x);
                for ky in 0..kernel {
                    let iy = if let Some(iy) = source_index(y, ky * dilation, pad, h) {
                        iy
                    } else {
                        continue;
                    };
                    for kx in 0..kernel {
                        if let Some(ix) = source_index(x, kx * dilation, pad, w) {
                            let offset = (ky * kernel + kx) * c;
                            let mut target = output.slice_mut(s![b, iy, ix, ..]);
                            target += &row.slice(s![offset..offset + c]);
                        }
                    }
                }
            }
        }
    }
    output
}

fn into_matrix(array: ArrayView4<f32>, rows: usize, cols: usize) -> Result<Array2<f32>> {
    Ok(array
        .as_standard_layout()
        .into_owned()
        .into_shape((rows, cols))?)
}

fn check_kernel(weight: &Variable4) -> Result<usize> {
    let (kh, kw, _, _) = weight.dim();
    if kh != kw || kh == 0 {
        return Err(shape_error!(
            "expected a square kernel, found {:?}",
            weight.shape()
        ));
    }
    Ok(kh)
}

/// Dilated 2-D convolution with SAME padding, stride 1.
///
/// `input` is `[n, h, w, inputs]`, `weight` is `[k, k, inputs, outputs]`. The output is
/// `[n, h, w, outputs]` for any dilation.
pub(crate) fn conv2_same(
    input: &Variable4,
    weight: &Variable4,
    dilation: usize,
) -> Result<Variable4> {
    let kernel = check_kernel(weight)?;
    let (n, h, w, ic) = input.dim();
    let (_, _, wic, oc) = weight.dim();
    if ic != wic {
        return Err(shape_error!(
            "convolution expects {wic} input channels, found {:?}",
            input.shape()
        ));
    }
    let cols = im2col(input.value().view(), kernel, dilation);
    let weight_matrix = into_matrix(weight.value().view(), kernel * kernel * ic, oc)?;
    let output = cols.dot(&weight_matrix).into_shape((n, h, w, oc))?;
    let mut builder = Variable4::builder();
    if let Some(node) = input.node() {
        let weight_matrix = weight_matrix.clone();
        builder.edge(node, move |output_grad| {
            let output_grad = into_matrix(output_grad.view(), n * h * w, oc)?;
            let cols_grad = output_grad.dot(&weight_matrix.t());
            Ok(col2im(cols_grad.view(), (n, h, w, ic), kernel, dilation).into_shared())
        });
    }
    if let Some(node) = weight.node() {
        builder.edge(node, move |output_grad| {
            let output_grad = into_matrix(output_grad.view(), n * h * w, oc)?;
            let weight_grad = cols.t().dot(&output_grad);
            Ok(weight_grad
                .into_shape((kernel, kernel, ic, oc))?
                .into_shared())
        });
    }
    Ok(builder.build(output.into_shared()))
}

/// Dilated 2-D transpose convolution with SAME padding, stride 1.
///
/// `input` is `[n, h, w, inputs]`, `weight` is `[k, k, outputs, inputs]`. This is the adjoint
/// of [`conv2_same`] with the same weight, the output is `[n, h, w, outputs]`.
pub(crate) fn conv2_transpose_same(
    input: &Variable4,
    weight: &Variable4,
    dilation: usize,
) -> Result<Variable4> {
    let kernel = check_kernel(weight)?;
    let (n, h, w, ic) = input.dim();
    let (_, _, oc, wic) = weight.dim();
    if ic != wic {
        return Err(shape_error!(
            "transpose convolution expects {wic} input channels, found {:?}",
            input.shape()
        ));
    }
    let input_matrix = into_matrix(input.value().view(), n * h * w, ic)?;
    let weight_matrix = into_matrix(weight.value().view(), kernel * kernel * oc, ic)?;
    let cols = input_matrix.dot(&weight_matrix.t());
    let output = col2im(cols.view(), (n, h, w, oc), kernel, dilation);
    let mut builder = Variable4::builder();
    // Both edges unfold the output gradient, share it.
    let output_grad_cols = Arc::new(OnceLock::<Array2<f32>>::new());
    if let Some(node) = input.node() {
        let output_grad_cols = output_grad_cols.clone();
        let weight_matrix = weight_matrix.clone();
        builder.edge(node, move |output_grad| {
            let cols = output_grad_cols
                .get_or_init(|| im2col(output_grad.view(), kernel, dilation));
            Ok(cols.dot(&weight_matrix).into_shape((n, h, w, ic))?.into_shared())
        });
    }
    if let Some(node) = weight.node() {
        builder.edge(node, move |output_grad| {
            let cols = output_grad_cols
                .get_or_init(|| im2col(output_grad.view(), kernel, dilation));
            Ok(cols
                .t()
                .dot(&input_matrix)
                .into_shape((kernel, kernel, oc, ic))?
                .into_shared())
        });
    }
    Ok(builder.build(output.into_shared()))
}

/// Adds `bias` to every pixel, `bias` has one element per channel.
pub(crate) fn bias_add(input: &Variable4, bias: &Variable1) -> Result<Variable4> {
    let channels = input.shape()[3];
    if bias.shape() != [channels] {
        return Err(shape_error!(
            "bias of shape {:?} does not match {channels} channels",
            bias.shape()
        ));
    }
    let mut builder = Variable4::builder();
    if let Some(node) = input.node() {
        builder.edge(node, Ok);
    }
    if let Some(node) = bias.node() {
        builder.edge(node, move |output_grad| {
            let rows = output_grad.len() / channels.max(1);
            let output_grad = into_matrix(output_grad.view(), rows, channels)?;
            Ok(output_grad.sum_axis(Axis(0)).into_shared())
        });
    }
    let output = input.value() + &bias.value().view();
    Ok(builder.build(output.into_shared()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learn::neural_network::{autograd::Variable, layer::testing::check_gradient};
    use approx::assert_relative_eq;
    use ndarray::{Array, Array1, Ix4};

    fn ramp(shape: (usize, usize, usize, usize), scale: f32) -> Array4<f32> {
        let len = shape.0 * shape.1 * shape.2 * shape.3;
        Array::from_iter((0..len).map(|i| ((i * 7 % 13) as f32 - 6.) * scale))
            .into_shape(shape)
            .unwrap()
    }

    #[test]
    fn identity_kernel_is_identity() {
        let input = ramp((1, 5, 4, 1), 0.5);
        let mut weight = Array4::<f32>::zeros((3, 3, 1, 1));
        weight[[1, 1, 0, 0]] = 1.;
        for dilation in 1..=3 {
            let output = conv2_same(
                &Variable::from(input.clone()),
                &Variable::from(weight.clone()),
                dilation,
            )
            .unwrap();
            assert_eq!(output.value(), &input);
        }
    }

    #[test]
    fn same_padding_preserves_spatial_shape() {
        let input = Variable::from(ramp((2, 7, 6, 3), 0.1));
        for (kernel, dilation) in [(1, 1), (2, 1), (3, 2), (7, 1), (4, 3)] {
            let weight = Variable::from(ramp((kernel, kernel, 3, 5), 0.01));
            let output = conv2_same(&input, &weight, dilation).unwrap();
            assert_eq!(output.shape(), &[2, 7, 6, 5]);
            let weight = Variable::from(ramp((kernel, kernel, 4, 3), 0.01));
            let output = conv2_transpose_same(&input, &weight, dilation).unwrap();
            assert_eq!(output.shape(), &[2, 7, 6, 4]);
        }
    }

    #[test]
    fn box_filter_sums_neighbours() {
        let input = Array4::<f32>::ones((1, 3, 3, 1));
        let weight = Array4::<f32>::ones((3, 3, 1, 1));
        let output = conv2_same(&Variable::from(input), &Variable::from(weight), 1).unwrap();
        let expected = Array::from_shape_vec(
            (1, 3, 3, 1),
            vec![4., 6., 4., 6., 9., 6., 4., 6., 4.],
        )
        .unwrap();
        assert_eq!(output.value(), &expected);
    }

    #[test]
    fn transpose_is_adjoint_of_conv() {
        // <conv(x), y> == <x, conv_t(y)> with the same weight.
        let x = ramp((1, 6, 5, 2), 0.3);
        let y = ramp((1, 6, 5, 3), 0.2);
        let weight = ramp((3, 3, 2, 3), 0.05);
        for dilation in [1, 2] {
            let conv_x =
                conv2_same(&Variable::from(x.clone()), &Variable::from(weight.clone()), dilation)
                    .unwrap();
            // The transpose weight is [k, k, outputs, inputs] = [k, k, 2, 3].
            let conv_t_y =
                conv2_transpose_same(&Variable::from(y.clone()), &Variable::from(weight.clone()), dilation)
                    .unwrap();
            let lhs = (conv_x.value() * &y).sum();
            let rhs = (&x * conv_t_y.value()).sum();
            assert_relative_eq!(lhs, rhs, epsilon = 1e-3);
        }
    }

    #[test]
    fn conv_input_gradient() {
        let weight = Variable::from(ramp((3, 3, 2, 3), 0.1));
        check_gradient(ramp((1, 4, 5, 2), 0.2), |x: Variable<Ix4>| {
            conv2_same(&x, &weight, 2)
        });
    }

    #[test]
    fn conv_weight_gradient() {
        let input = Variable::from(ramp((2, 4, 4, 2), 0.2));
        check_gradient(ramp((3, 3, 2, 2), 0.1), |w: Variable<Ix4>| {
            conv2_same(&input, &w, 1)
        });
    }

    #[test]
    fn conv_transpose_gradients() {
        let weight = Variable::from(ramp((3, 3, 2, 3), 0.1));
        check_gradient(ramp((1, 4, 5, 3), 0.2), |x: Variable<Ix4>| {
            conv2_transpose_same(&x, &weight, 1)
        });
        let input = Variable::from(ramp((1, 4, 4, 3), 0.2));
        check_gradient(ramp((2, 2, 2, 3), 0.1), |w: Variable<Ix4>| {
            conv2_transpose_same(&input, &w, 2)
        });
    }

    #[test]
    fn bias_gradient_sums_pixels() {
        let input = Variable::from(ramp((2, 3, 3, 4), 0.2));
        check_gradient(Array1::from(vec![0.1f32, -0.2, 0.3, 0.]), |b: Variable1| {
            bias_add(&input, &b)
        });
    }

    #[test]
    fn channel_mismatch_is_shape_error() {
        let input = Variable::from(ramp((1, 4, 4, 2), 0.1));
        let weight = Variable::from(ramp((3, 3, 3, 2), 0.1));
        let error = conv2_same(&input, &weight, 1).unwrap_err();
        assert!(error
            .downcast_ref::<crate::error::Error>()
            .unwrap()
            .is_shape());
    }
}
