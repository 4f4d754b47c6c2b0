use super::autograd::{Variable0, Variable4};
use crate::{
    error::configuration_error,
    learn::criterion::{
        Criterion, GeneralizedDice, SegmentationLoss, SensitivitySpecificity, Target,
        WeightedCrossEntropy,
    },
};
use anyhow::Result;
use ndarray::{ArcArray, Ix0};
use serde::{Deserialize, Serialize};

impl<'a, 'b, L: SegmentationLoss> Criterion<Variable4, &'b Target<'a>> for L {
    type Output = Variable0;
    fn eval(&self, input: Variable4, target: &'b Target<'a>) -> Result<Variable0> {
        let (loss, grad) = self.loss_and_grad(input.value().view(), target)?;
        let mut builder = Variable0::builder();
        if let Some(node) = input.node() {
            builder.edge(node, move |output_grad: ArcArray<f32, Ix0>| {
                let dy = output_grad[()];
                Ok(grad.mapv(|dx| dx * dy).into_shared())
            });
        }
        Ok(builder.build(ArcArray::from_elem((), loss)))
    }
}

/// The training objective.
///
/// Constructed by name with [`from_name`](Objective::from_name):
/// - "wce": weighted cross entropy, the tuning constant is the positive class weight.
/// - "gdice": generalized Dice, the tuning constant is ignored.
/// - "ss": sensitivity specificity, the tuning constant is the sensitivity ratio.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name")]
pub enum Objective {
    /// See [`WeightedCrossEntropy`].
    #[serde(rename = "wce")]
    WeightedCrossEntropy {
        /// The positive class weight.
        tuning_constant: f32,
    },
    /// See [`GeneralizedDice`].
    #[serde(rename = "gdice")]
    GeneralizedDice,
    /// See [`SensitivitySpecificity`].
    #[serde(rename = "ss")]
    SensitivitySpecificity {
        /// The weight of the sensitivity term.
        tuning_constant: f32,
    },
}

impl Default for Objective {
    fn default() -> Self {
        Self::WeightedCrossEntropy {
            tuning_constant: 1.,
        }
    }
}

impl Objective {
    /// Parses the objective from its name.
    ///
    /// **Errors**
    ///
    /// [`Error::Configuration`](crate::error::Error::Configuration) if the name is not
    /// recognized or the tuning constant is out of range for the objective.
    pub fn from_name(name: &str, tuning_constant: f32) -> Result<Self> {
        let objective = match name {
            "wce" => Self::WeightedCrossEntropy { tuning_constant },
            "gdice" => Self::GeneralizedDice,
            "ss" => Self::SensitivitySpecificity { tuning_constant },
            _ => {
                return Err(configuration_error!(
                    "unknown objective {name:?}, expected one of \"wce\", \"gdice\", \"ss\""
                ))
            }
        };
        objective.validate()?;
        Ok(objective)
    }
    /// The name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::WeightedCrossEntropy { .. } => "wce",
            Self::GeneralizedDice => "gdice",
            Self::SensitivitySpecificity { .. } => "ss",
        }
    }
    pub(crate) fn validate(&self) -> Result<()> {
        match *self {
            Self::WeightedCrossEntropy { tuning_constant } => {
                WeightedCrossEntropy::new(tuning_constant)?;
            }
            Self::GeneralizedDice => (),
            Self::SensitivitySpecificity { tuning_constant } => {
                SensitivitySpecificity::new(tuning_constant)?;
            }
        }
        Ok(())
    }
    /// The loss of `logits`.
    pub fn loss(&self, logits: Variable4, target: &Target) -> Result<Variable0> {
        match *self {
            Self::WeightedCrossEntropy { tuning_constant } => {
                WeightedCrossEntropy::new(tuning_constant)?.eval(logits, target)
            }
            Self::GeneralizedDice => GeneralizedDice.eval(logits, target),
            Self::SensitivitySpecificity { tuning_constant } => {
                SensitivitySpecificity::new(tuning_constant)?.eval(logits, target)
            }
        }
    }
}

/// Collects the convolution weights seen during a forward pass.
#[derive(Default, Debug)]
pub struct RegularizationAccumulator {
    weights: Vec<Variable4>,
}

impl RegularizationAccumulator {
    pub(crate) fn push(&mut self, weight: Variable4) {
        self.weights.push(weight);
    }
    /// The number of weights.
    pub fn len(&self) -> usize {
        self.weights.len()
    }
    /// Whether no weights were collected.
    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}

/// Weight penalty added to the loss.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name")]
pub enum Regularizer {
    /// `scale * sum |w|`
    L1 {
        /// The scale.
        scale: f32,
    },
    /// `scale * sum w^2 / 2`
    L2 {
        /// The scale.
        scale: f32,
    },
}

impl Regularizer {
    /// Parses "L1" or "L2", case insensitive.
    ///
    /// **Errors**
    ///
    /// [`Error::Configuration`](crate::error::Error::Configuration) for other names or a
    /// negative scale.
    pub fn from_args(name: &str, scale: f32) -> Result<Self> {
        if !(scale >= 0. && scale.is_finite()) {
            return Err(configuration_error!(
                "regularization scale must be non-negative, found {scale}"
            ));
        }
        match name.to_ascii_lowercase().as_str() {
            "l1" => Ok(Self::L1 { scale }),
            "l2" => Ok(Self::L2 { scale }),
            _ => Err(configuration_error!(
                "unknown regularizer {name:?}, expected \"L1\" or \"L2\""
            )),
        }
    }
    /// The scale.
    pub fn scale(&self) -> f32 {
        match *self {
            Self::L1 { scale } | Self::L2 { scale } => scale,
        }
    }
    /// The penalty of the accumulated weights.
    ///
    /// Consumes the accumulator so the weights are only referenced by the penalty.
    pub fn penalty(&self, accumulator: RegularizationAccumulator) -> Variable0 {
        let mut builder = Variable0::builder();
        let mut total = 0f32;
        for weight in accumulator.weights {
            let value = weight.value().clone();
            match *self {
                Self::L1 { scale } => {
                    total += scale * value.fold(0., |acc, w| acc + w.abs());
                    if let Some(node) = weight.node() {
                        builder.edge(node, move |output_grad: ArcArray<f32, Ix0>| {
                            let dy = scale * output_grad[()];
                            let sign = |w: f32| if w == 0. { 0. } else { w.signum() };
                            Ok(value.mapv(|w| dy * sign(w)).into_shared())
                        });
                    }
                }
                Self::L2 { scale } => {
                    total += scale * value.fold(0., |acc, w| acc + w * w) / 2.;
                    if let Some(node) = weight.node() {
                        builder.edge(node, move |output_grad: ArcArray<f32, Ix0>| {
                            let dy = scale * output_grad[()];
                            Ok(value.mapv(|w| dy * w).into_shared())
                        });
                    }
                }
            }
        }
        builder.build(ArcArray::from_elem((), total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learn::neural_network::autograd::Parameter;
    use approx::assert_relative_eq;
    use ndarray::{Array, Array4};

    #[test]
    fn objective_names() {
        assert_eq!(
            Objective::from_name("wce", 2.).unwrap(),
            Objective::WeightedCrossEntropy {
                tuning_constant: 2.
            }
        );
        assert_eq!(Objective::from_name("gdice", 0.).unwrap().name(), "gdice");
        assert_eq!(Objective::from_name("ss", 0.5).unwrap().name(), "ss");
        for (name, constant) in [("dice", 1.), ("ss", 2.), ("wce", -1.)] {
            let error = Objective::from_name(name, constant).unwrap_err();
            assert!(error
                .downcast_ref::<crate::error::Error>()
                .unwrap()
                .is_configuration());
        }
    }

    #[test]
    fn objective_serde() {
        let objective: Objective =
            serde_json::from_str(r#"{"name": "ss", "tuning_constant": 0.25}"#).unwrap();
        assert_eq!(
            objective,
            Objective::SensitivitySpecificity {
                tuning_constant: 0.25
            }
        );
    }

    #[test]
    fn loss_backward_reaches_logits() {
        let mut logits = Parameter::from(
            Array::from_iter((0..8).map(|i| i as f32 - 4.))
                .into_shape((1, 2, 4, 1))
                .unwrap(),
        );
        logits.set_training(true);
        let truth = Array4::from_shape_fn((1, 2, 4, 1), |(_, y, _, _)| y as f32);
        let target = Target::new(truth.view());
        let objective = Objective::from_name("wce", 3.).unwrap();
        let (expected, grad) = WeightedCrossEntropy::new(3.)
            .unwrap()
            .loss_and_grad(logits.value().view(), &target)
            .unwrap();
        let loss = objective.loss(logits.to_variable(), &target).unwrap();
        assert_relative_eq!(loss.item(), expected);
        loss.backward().unwrap();
        assert_eq!(logits.grad().unwrap(), grad);
    }

    #[test]
    fn regularizer_penalty_and_gradient() {
        let mut weight = Parameter::from(
            Array::from_shape_vec((1, 1, 2, 2), vec![1f32, -2., 0., 3.]).unwrap(),
        );
        weight.set_training(true);
        for (regularizer, expected, expected_grad) in [
            (Regularizer::from_args("L1", 0.5).unwrap(), 3., vec![0.5f32, -0.5, 0., 0.5]),
            (Regularizer::from_args("l2", 0.5).unwrap(), 3.5, vec![0.5f32, -1., 0., 1.5]),
        ] {
            weight.set_training(true);
            let mut accumulator = RegularizationAccumulator::default();
            accumulator.push(weight.to_variable());
            assert_eq!(accumulator.len(), 1);
            let penalty = regularizer.penalty(accumulator);
            assert_relative_eq!(penalty.item(), expected);
            penalty.backward().unwrap();
            assert_eq!(
                weight.grad().unwrap().iter().copied().collect::<Vec<_>>(),
                expected_grad
            );
        }
    }

    #[test]
    fn unknown_regularizer() {
        assert!(Regularizer::from_args("L3", 1.).is_err());
        assert!(Regularizer::from_args("L2", -1.).is_err());
    }
}
