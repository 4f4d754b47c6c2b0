//! Segmentation objectives on logits.
//!
//! Each objective computes the loss and its gradient with respect to the logits on the host.
//! [`neural_network::criterion`](super::neural_network::criterion) lifts them onto variables.
use crate::error::{configuration_error, shape_error};
use anyhow::Result;
use ndarray::{Array4, ArrayView4, Zip};

/// Evaluates a criterion on an input and a target.
pub trait Criterion<X, T> {
    /// The output.
    type Output;
    /// Evaluates the criterion.
    fn eval(&self, input: X, target: T) -> Result<Self::Output>;
}

/// Ground truth for a batch of logits.
#[derive(Debug, Clone, Copy)]
pub struct Target<'a> {
    truth: ArrayView4<'a, f32>,
    weights: Option<ArrayView4<'a, f32>>,
}

impl<'a> Target<'a> {
    /// A target with a ground truth mask in `[0, 1]`, with the shape of the logits.
    pub fn new(truth: ArrayView4<'a, f32>) -> Self {
        Self {
            truth,
            weights: None,
        }
    }
    /// Adds a per pixel loss weight.
    ///
    /// Only used by the weighted cross entropy.
    pub fn with_weights(self, weights: ArrayView4<'a, f32>) -> Self {
        Self {
            weights: Some(weights),
            ..self
        }
    }
    /// The ground truth.
    pub fn truth(&self) -> ArrayView4<'a, f32> {
        self.truth
    }
    /// The per pixel weights.
    pub fn weights(&self) -> Option<ArrayView4<'a, f32>> {
        self.weights
    }
    fn check(&self, logits: &ArrayView4<f32>) -> Result<()> {
        if self.truth.shape() != logits.shape() {
            return Err(shape_error!(
                "ground truth of shape {:?} does not match logits of shape {:?}",
                self.truth.shape(),
                logits.shape()
            ));
        }
        if let Some(weights) = self.weights.as_ref() {
            if weights.shape() != logits.shape() {
                return Err(shape_error!(
                    "loss weights of shape {:?} do not match logits of shape {:?}",
                    weights.shape(),
                    logits.shape()
                ));
            }
        }
        Ok(())
    }
}

/// A loss on logits with its gradient.
pub trait SegmentationLoss {
    /// The loss and the gradient of the loss with respect to `logits`.
    ///
    /// **Errors**
    ///
    /// [`Error::Shape`](crate::error::Error::Shape) if `target` does not match `logits`.
    fn loss_and_grad(&self, logits: ArrayView4<f32>, target: &Target)
        -> Result<(f32, Array4<f32>)>;
}

impl<'a, 'b, 'c, L: SegmentationLoss> Criterion<ArrayView4<'a, f32>, &'b Target<'c>> for L {
    type Output = f32;
    fn eval(&self, input: ArrayView4<'a, f32>, target: &'b Target<'c>) -> Result<f32> {
        Ok(self.loss_and_grad(input, target)?.0)
    }
}

pub(crate) fn sigmoid(x: f32) -> f32 {
    if x >= 0. {
        1. / (1. + (-x).exp())
    } else {
        let e = x.exp();
        e / (1. + e)
    }
}

/// `log(1 + exp(-x))`
fn softplus_neg(x: f32) -> f32 {
    (-x).max(0.) + (-x.abs()).exp().ln_1p()
}

/// Cross entropy on logits with the positive class weighted by `pos_weight`.
///
/// Per pixel `(1 - t) x + (1 + (c - 1) t) log(1 + exp(-x))`, averaged over the pixels, or
/// weighted by the target weights as `sum(w l) / sum(w)`. A target with zero total weight has
/// a loss of 0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightedCrossEntropy {
    pos_weight: f32,
}

impl WeightedCrossEntropy {
    /// **Errors**
    ///
    /// [`Error::Configuration`](crate::error::Error::Configuration) if `pos_weight` is not
    /// positive.
    pub fn new(pos_weight: f32) -> Result<Self> {
        if !(pos_weight > 0. && pos_weight.is_finite()) {
            return Err(configuration_error!(
                "weighted cross entropy requires a positive weight, found {pos_weight}"
            ));
        }
        Ok(Self { pos_weight })
    }
    /// The weight of the positive class.
    pub fn pos_weight(&self) -> f32 {
        self.pos_weight
    }
}

impl SegmentationLoss for WeightedCrossEntropy {
    fn loss_and_grad(
        &self,
        logits: ArrayView4<f32>,
        target: &Target,
    ) -> Result<(f32, Array4<f32>)> {
        target.check(&logits)?;
        let c = self.pos_weight;
        let mut loss = Array4::zeros(logits.raw_dim());
        let mut grad = Array4::zeros(logits.raw_dim());
        Zip::from(&mut loss)
            .and(&mut grad)
            .and(&logits)
            .and(&target.truth)
            .for_each(|l, g, &x, &t| {
                let coef = 1. + (c - 1.) * t;
                *l = (1. - t) * x + coef * softplus_neg(x);
                *g = (1. - t) - coef * sigmoid(-x);
            });
        if let Some(weights) = target.weights.as_ref() {
            let total = weights.sum();
            if total <= 0. {
                return Ok((0., Array4::zeros(logits.raw_dim())));
            }
            let loss = (&loss * weights).sum() / total;
            grad.zip_mut_with(weights, |g, w| *g *= w / total);
            Ok((loss, grad))
        } else {
            let n = logits.len().max(1) as f32;
            grad.mapv_inplace(|g| g / n);
            Ok((loss.sum() / n, grad))
        }
    }
}

/// Generalized Dice loss over foreground and background.
///
/// With `p = sigmoid(x)`, each class `l` is weighted by `1 / (sum r_l)^2`, and the loss is
/// `1 - 2 sum_l w_l sum r_l p_l / sum_l w_l sum (r_l + p_l)`. A class absent from the ground
/// truth gets a weight of 0.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct GeneralizedDice;

impl SegmentationLoss for GeneralizedDice {
    fn loss_and_grad(
        &self,
        logits: ArrayView4<f32>,
        target: &Target,
    ) -> Result<(f32, Array4<f32>)> {
        target.check(&logits)?;
        let p = logits.mapv(sigmoid);
        let t = target.truth;
        let class_weight = |sum: f32| if sum > 0. { 1. / (sum * sum) } else { 0. };
        let w1 = class_weight(t.sum());
        let w0 = class_weight(t.mapv(|t| 1. - t).sum());
        let mut intersection = 0f32;
        let mut union = 0f32;
        Zip::from(&p).and(&t).for_each(|&p, &t| {
            intersection += w1 * t * p + w0 * (1. - t) * (1. - p);
            union += w1 * (t + p) + w0 * ((1. - t) + (1. - p));
        });
        if union <= 0. {
            return Ok((0., Array4::zeros(logits.raw_dim())));
        }
        let loss = 1. - 2. * intersection / union;
        let mut grad = Array4::zeros(logits.raw_dim());
        Zip::from(&mut grad)
            .and(&p)
            .and(&t)
            .for_each(|g, &p, &t| {
                let d_intersection = w1 * t - w0 * (1. - t);
                let d_union = w1 - w0;
                let dp = -2. * (d_intersection * union - intersection * d_union) / (union * union);
                *g = dp * p * (1. - p);
            });
        Ok((loss, grad))
    }
}

/// Sensitivity specificity loss.
///
/// With `p = sigmoid(x)`, `r sum (t - p)^2 t / sum t + (1 - r) sum (t - p)^2 (1 - t) / sum (1 - t)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensitivitySpecificity {
    ratio: f32,
}

impl SensitivitySpecificity {
    /// **Errors**
    ///
    /// [`Error::Configuration`](crate::error::Error::Configuration) if `ratio` is not in
    /// `[0, 1]`.
    pub fn new(ratio: f32) -> Result<Self> {
        if !(0. ..=1.).contains(&ratio) {
            return Err(configuration_error!(
                "sensitivity specificity ratio must be in [0, 1], found {ratio}"
            ));
        }
        Ok(Self { ratio })
    }
    /// The weight of the sensitivity term.
    pub fn ratio(&self) -> f32 {
        self.ratio
    }
}

impl SegmentationLoss for SensitivitySpecificity {
    fn loss_and_grad(
        &self,
        logits: ArrayView4<f32>,
        target: &Target,
    ) -> Result<(f32, Array4<f32>)> {
        target.check(&logits)?;
        let r = self.ratio;
        let t = target.truth;
        let positives = t.sum().max(f32::EPSILON);
        let negatives = t.mapv(|t| 1. - t).sum().max(f32::EPSILON);
        let p = logits.mapv(sigmoid);
        let mut sensitivity = 0f32;
        let mut specificity = 0f32;
        let mut grad = Array4::zeros(logits.raw_dim());
        Zip::from(&mut grad)
            .and(&p)
            .and(&t)
            .for_each(|g, &p, &t| {
                let e = t - p;
                sensitivity += e * e * t;
                specificity += e * e * (1. - t);
                let dp = -2. * e * (r * t / positives + (1. - r) * (1. - t) / negatives);
                *g = dp * p * (1. - p);
            });
        let loss = r * sensitivity / positives + (1. - r) * specificity / negatives;
        Ok((loss, grad))
    }
}
