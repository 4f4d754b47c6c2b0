use crate::{
    error::shape_error,
    learn::neural_network::autograd::Variable4,
};
use anyhow::Result;
use ndarray::{Array4, Axis};

/// Max pooling with a `kernel` x `kernel` window, stride `kernel` and VALID padding.
///
/// Trailing rows / columns that do not fill a window are dropped.
pub(crate) fn max_pool2(input: &Variable4, kernel: usize) -> Result<Variable4> {
    let (n, h, w, c) = input.dim();
    if kernel == 0 || h < kernel || w < kernel {
        return Err(shape_error!(
            "can not pool {:?} with a {kernel}x{kernel} window",
            input.shape()
        ));
    }
    let (oh, ow) = (h / kernel, w / kernel);
    let x = input.value();
    let mut output = Array4::<f32>::zeros((n, oh, ow, c));
    // Source coordinates of each maximum, for the backward pass.
    let mut argmax = Vec::with_capacity(output.len());
    for b in 0..n {
        for y in 0..oh {
            for xo in 0..ow {
                for ch in 0..c {
                    let mut best = (y * kernel, xo * kernel);
                    let mut max = x[[b, best.0, best.1, ch]];
                    for ky in 0..kernel {
                        for kx in 0..kernel {
                            let (iy, ix) = (y * kernel + ky, xo * kernel + kx);
                            let value = x[[b, iy, ix, ch]];
                            if value > max {
                                max = value;
                                best = (iy, ix);
                            }
                        }
                    }
                    output[[b, y, xo, ch]] = max;
                    argmax.push(best);
                }
            }
        }
    }
    let mut builder = Variable4::builder();
    if let Some(node) = input.node() {
        builder.edge(node, move |output_grad| {
            let mut input_grad = Array4::zeros((n, h, w, c));
            let sources = argmax.iter();
            for (((b, _, _, ch), dy), (iy, ix)) in output_grad.indexed_iter().zip(sources) {
                input_grad[[b, *iy, *ix, ch]] += *dy;
            }
            Ok(input_grad.into_shared())
        });
    }
    Ok(builder.build(output.into_shared()))
}

/// Nearest neighbour upsampling by `kernel` to `height` x `width`.
///
/// Inverts [`max_pool2`] geometrically, the target is the shape of the pool's input so that
/// dimensions dropped by VALID pooling are restored. Output pixel `(y, x)` reads input pixel
/// `(min(y / kernel, h - 1), min(x / kernel, w - 1))`.
pub(crate) fn unpool2(
    input: &Variable4,
    kernel: usize,
    height: usize,
    width: usize,
) -> Result<Variable4> {
    let (n, h, w, c) = input.dim();
    if kernel == 0 || height / kernel != h || width / kernel != w {
        return Err(shape_error!(
            "can not unpool {:?} by {kernel} to {height}x{width}",
            input.shape()
        ));
    }
    let source = move |y: usize, x: usize| ((y / kernel).min(h - 1), (x / kernel).min(w - 1));
    let x = input.value();
    let output = Array4::from_shape_fn((n, height, width, c), |(b, y, xo, ch)| {
        let (iy, ix) = source(y, xo);
        x[[b, iy, ix, ch]]
    });
    let mut builder = Variable4::builder();
    if let Some(node) = input.node() {
        builder.edge(node, move |output_grad| {
            let mut input_grad = Array4::zeros((n, h, w, c));
            for ((b, y, xo, ch), dy) in output_grad.indexed_iter() {
                let (iy, ix) = source(y, xo);
                input_grad[[b, iy, ix, ch]] += *dy;
            }
            Ok(input_grad.into_shared())
        });
    }
    Ok(builder.build(output.into_shared()))
}

/// Repeats a single channel `copies` times along the channel axis.
pub(crate) fn tile_channels(input: &Variable4, copies: usize) -> Result<Variable4> {
    let (n, h, w, c) = input.dim();
    if c != 1 {
        return Err(shape_error!(
            "expected a single channel input, found {:?}",
            input.shape()
        ));
    }
    let x = input.value();
    let output = Array4::from_shape_fn((n, h, w, copies), |(b, y, xo, _)| x[[b, y, xo, 0]]);
    let mut builder = Variable4::builder();
    if let Some(node) = input.node() {
        builder.edge(node, |output_grad| {
            Ok(output_grad
                .sum_axis(Axis(3))
                .insert_axis(Axis(3))
                .into_shared())
        });
    }
    Ok(builder.build(output.into_shared()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learn::neural_network::{autograd::Variable, layer::testing::check_gradient};
    use ndarray::{Array, Ix4};

    fn distinct(shape: (usize, usize, usize, usize)) -> Array4<f32> {
        let len = shape.0 * shape.1 * shape.2 * shape.3;
        // Distinct values so that the maximum of each window is unique.
        Array::from_iter((0..len).map(|i| ((i * 37) % 101) as f32 * 0.1))
            .into_shape(shape)
            .unwrap()
    }

    #[test]
    fn max_pool_drops_remainder() {
        let input = Variable::from(distinct((2, 7, 5, 3)));
        let output = max_pool2(&input, 2).unwrap();
        assert_eq!(output.shape(), &[2, 3, 2, 3]);
        let x = input.value();
        for ch in 0..3 {
            let expected = [x[[1, 4, 2, ch]], x[[1, 4, 3, ch]], x[[1, 5, 2, ch]], x[[1, 5, 3, ch]]]
                .into_iter()
                .fold(f32::MIN, f32::max);
            assert_eq!(output.value()[[1, 2, 1, ch]], expected);
        }
    }

    #[test]
    fn max_pool_too_small_is_shape_error() {
        let input = Variable::from(distinct((1, 2, 8, 1)));
        let error = max_pool2(&input, 3).unwrap_err();
        assert!(error
            .downcast_ref::<crate::error::Error>()
            .unwrap()
            .is_shape());
    }

    #[test]
    fn unpool_restores_pooled_shape() {
        for (h, w, kernel) in [(7, 5, 2), (8, 8, 2), (9, 10, 3), (584, 565, 2)] {
            let input = Variable::from(Array4::<f32>::ones((1, h, w, 1)));
            let pooled = max_pool2(&input, kernel).unwrap();
            let output = unpool2(&pooled, kernel, h, w).unwrap();
            assert_eq!(output.shape(), &[1, h, w, 1]);
        }
    }

    #[test]
    fn unpool_repeats_nearest() {
        let input = Variable::from(
            Array::from_shape_vec((1, 2, 2, 1), vec![1f32, 2., 3., 4.]).unwrap(),
        );
        let output = unpool2(&input, 2, 5, 4).unwrap();
        let expected = Array::from_shape_vec(
            (1, 5, 4, 1),
            vec![
                1f32, 1., 2., 2., //
                1., 1., 2., 2., //
                3., 3., 4., 4., //
                3., 3., 4., 4., //
                3., 3., 4., 4.,
            ],
        )
        .unwrap();
        assert_eq!(output.value(), &expected);
    }

    #[test]
    fn unpool_rejects_inconsistent_target() {
        let input = Variable::from(Array4::<f32>::ones((1, 3, 3, 1)));
        assert!(unpool2(&input, 2, 8, 6).is_err());
    }

    #[test]
    fn pool_gradients() {
        check_gradient(distinct((1, 5, 6, 2)), |x: Variable<Ix4>| max_pool2(&x, 2));
        check_gradient(distinct((2, 2, 3, 2)), |x: Variable<Ix4>| unpool2(&x, 2, 5, 7));
        check_gradient(distinct((1, 3, 3, 1)), |x: Variable<Ix4>| tile_channels(&x, 3));
    }
}
