use super::autograd::ParameterD;
use crate::error::configuration_error;
use anyhow::Result;
use ndarray::{ArrayD, Zip};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Optimizer builders.
pub mod builder {
    use super::*;

    /// Builder for creating an [`Adam`].
    pub struct AdamBuilder {
        adam: Adam,
    }

    impl AdamBuilder {
        pub(super) fn new() -> Self {
            Self {
                adam: Adam::default(),
            }
        }
        /// Decay of the first moment. Default is 0.9.
        pub fn beta1(mut self, beta1: f32) -> Self {
            self.adam.beta1 = beta1;
            self
        }
        /// Decay of the second moment. Default is 0.999.
        pub fn beta2(mut self, beta2: f32) -> Self {
            self.adam.beta2 = beta2;
            self
        }
        /// Numerical stability term. Default is 1e-8.
        pub fn epsilon(mut self, epsilon: f32) -> Self {
            self.adam.epsilon = epsilon;
            self
        }
        /// Builds the optimizer.
        pub fn build(self) -> Adam {
            self.adam
        }
    }

    /// Builder for creating a [`RmsProp`].
    pub struct RmsPropBuilder {
        rms_prop: RmsProp,
    }

    impl RmsPropBuilder {
        pub(super) fn new() -> Self {
            Self {
                rms_prop: RmsProp::default(),
            }
        }
        /// Decay of the mean square. Default is 0.9.
        pub fn decay(mut self, decay: f32) -> Self {
            self.rms_prop.decay = decay;
            self
        }
        /// Momentum. Default is 0.
        pub fn momentum(mut self, momentum: f32) -> Self {
            self.rms_prop.momentum = momentum;
            self
        }
        /// Numerical stability term. Default is 1e-10.
        pub fn epsilon(mut self, epsilon: f32) -> Self {
            self.rms_prop.epsilon = epsilon;
            self
        }
        /// Builds the optimizer.
        pub fn build(self) -> RmsProp {
            self.rms_prop
        }
    }

    /// Builder for creating an [`Adadelta`].
    pub struct AdadeltaBuilder {
        adadelta: Adadelta,
    }

    impl AdadeltaBuilder {
        pub(super) fn new() -> Self {
            Self {
                adadelta: Adadelta::default(),
            }
        }
        /// Decay of the accumulators. Default is 0.95.
        pub fn rho(mut self, rho: f32) -> Self {
            self.adadelta.rho = rho;
            self
        }
        /// Numerical stability term. Default is 1e-8.
        pub fn epsilon(mut self, epsilon: f32) -> Self {
            self.adadelta.epsilon = epsilon;
            self
        }
        /// Builds the optimizer.
        pub fn build(self) -> Adadelta {
            self.adadelta
        }
    }
}
use builder::*;

/// [`State`] value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    /// A tensor, the same shape as the parameter.
    Tensor(ArrayD<f32>),
    /// An elem.
    Elem(f32),
}

/// Optimizer State.
///
/// Created with [`Parameter::init_optimizer_state()`](super::autograd::Parameter::init_optimizer_state).
/// Stores per parameter training progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    name: String,
    key_values: Vec<(String, Value)>,
}

impl State {
    pub(crate) fn new(name: String, key_values: Vec<(String, Value)>) -> Self {
        Self { name, key_values }
    }
    /// Name of the [`Optimizer`].
    pub fn name(&self) -> &str {
        &self.name
    }
    /// Iterator over keys and values.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.key_values
            .iter()
            .map(|(key, value)| (key.as_str(), value))
    }
    /// Iterator over keys and mutable values.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut Value)> {
        self.key_values
            .iter_mut()
            .map(|(key, value)| (key.as_str(), value))
    }
    fn tensors_mut<const N: usize>(&mut self) -> Option<[&mut ArrayD<f32>; N]> {
        let tensors: Vec<_> = self
            .key_values
            .iter_mut()
            .filter_map(|(_, value)| match value {
                Value::Tensor(tensor) => Some(tensor),
                Value::Elem(_) => None,
            })
            .collect();
        tensors.try_into().ok()
    }
    fn elem_mut(&mut self, key: &str) -> Option<&mut f32> {
        self.key_values
            .iter_mut()
            .find_map(|(k, value)| match value {
                Value::Elem(elem) if k.as_str() == key => Some(elem),
                _ => None,
            })
    }
}

/// Optimizer.
pub trait Optimizer {
    /// Name stored in the parameter's [`State`].
    fn name(&self) -> &'static str;
    /// Performs the optimization, updating the parameter with `learning_rate`.
    ///
    /// Parameters without a gradient are left untouched.
    fn update(&self, learning_rate: f32, parameter: &mut ParameterD) -> Result<()>;
}

fn state_matches(parameter: &ParameterD, name: &str) -> bool {
    parameter
        .optimizer_state()
        .map_or(false, |state| state.name() == name)
}

fn zeros_like(parameter: &ParameterD) -> Value {
    Value::Tensor(ArrayD::zeros(parameter.raw_dim()))
}

/// Adam.
///
/// `lr_t = lr * sqrt(1 - beta2^t) / (1 - beta1^t)`, `w -= lr_t * m / (sqrt(v) + epsilon)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Adam {
    beta1: f32,
    beta2: f32,
    epsilon: f32,
}

impl Default for Adam {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

impl Adam {
    /// An Adam builder.
    pub fn builder() -> AdamBuilder {
        AdamBuilder::new()
    }
}

impl Optimizer for Adam {
    fn name(&self) -> &'static str {
        "Adam"
    }
    fn update(&self, learning_rate: f32, parameter: &mut ParameterD) -> Result<()> {
        let grad = if let Some(grad) = parameter.grad() {
            grad
        } else {
            return Ok(());
        };
        if !state_matches(parameter, self.name()) {
            let key_values = vec![
                ("m".to_string(), zeros_like(parameter)),
                ("v".to_string(), zeros_like(parameter)),
                ("t".to_string(), Value::Elem(0.)),
            ];
            parameter.init_optimizer_state(self.name(), key_values);
        }
        let Self {
            beta1,
            beta2,
            epsilon,
        } = *self;
        let (value, state) = parameter.value_view_optimizer_state_mut();
        let state = state.ok_or_else(|| configuration_error!("missing Adam state"))?;
        let t = {
            let t = state
                .elem_mut("t")
                .ok_or_else(|| configuration_error!("missing Adam step"))?;
            *t += 1.;
            *t
        };
        let [m, v] = state
            .tensors_mut::<2>()
            .ok_or_else(|| configuration_error!("malformed Adam state"))?;
        let lr_t = learning_rate * (1. - beta2.powf(t)).sqrt() / (1. - beta1.powf(t));
        Zip::from(value)
            .and(&grad)
            .and(m)
            .and(v)
            .for_each(|w, &g, m, v| {
                *m = beta1 * *m + (1. - beta1) * g;
                *v = beta2 * *v + (1. - beta2) * g * g;
                *w -= lr_t * *m / (v.sqrt() + epsilon);
            });
        Ok(())
    }
}

/// RMSProp.
///
/// The mean square accumulator starts at one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RmsProp {
    decay: f32,
    momentum: f32,
    epsilon: f32,
}

impl Default for RmsProp {
    fn default() -> Self {
        Self {
            decay: 0.9,
            momentum: 0.,
            epsilon: 1e-10,
        }
    }
}

impl RmsProp {
    /// A RmsProp builder.
    pub fn builder() -> RmsPropBuilder {
        RmsPropBuilder::new()
    }
}

impl Optimizer for RmsProp {
    fn name(&self) -> &'static str {
        "RMSProp"
    }
    fn update(&self, learning_rate: f32, parameter: &mut ParameterD) -> Result<()> {
        let grad = if let Some(grad) = parameter.grad() {
            grad
        } else {
            return Ok(());
        };
        if !state_matches(parameter, self.name()) {
            let key_values = vec![
                (
                    "ms".to_string(),
                    Value::Tensor(ArrayD::ones(parameter.raw_dim())),
                ),
                ("mom".to_string(), zeros_like(parameter)),
            ];
            parameter.init_optimizer_state(self.name(), key_values);
        }
        let Self {
            decay,
            momentum,
            epsilon,
        } = *self;
        let (value, state) = parameter.value_view_optimizer_state_mut();
        let [ms, mom] = state
            .and_then(|state| state.tensors_mut::<2>())
            .ok_or_else(|| configuration_error!("malformed RMSProp state"))?;
        Zip::from(value)
            .and(&grad)
            .and(ms)
            .and(mom)
            .for_each(|w, &g, ms, mom| {
                *ms = decay * *ms + (1. - decay) * g * g;
                *mom = momentum * *mom + learning_rate * g / (*ms + epsilon).sqrt();
                *w -= *mom;
            });
        Ok(())
    }
}

/// Adadelta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Adadelta {
    rho: f32,
    epsilon: f32,
}

impl Default for Adadelta {
    fn default() -> Self {
        Self {
            rho: 0.95,
            epsilon: 1e-8,
        }
    }
}

impl Adadelta {
    /// An Adadelta builder.
    pub fn builder() -> AdadeltaBuilder {
        AdadeltaBuilder::new()
    }
}

impl Optimizer for Adadelta {
    fn name(&self) -> &'static str {
        "Adadelta"
    }
    fn update(&self, learning_rate: f32, parameter: &mut ParameterD) -> Result<()> {
        let grad = if let Some(grad) = parameter.grad() {
            grad
        } else {
            return Ok(());
        };
        if !state_matches(parameter, self.name()) {
            let key_values = vec![
                ("accum".to_string(), zeros_like(parameter)),
                ("accum_update".to_string(), zeros_like(parameter)),
            ];
            parameter.init_optimizer_state(self.name(), key_values);
        }
        let Self { rho, epsilon } = *self;
        let (value, state) = parameter.value_view_optimizer_state_mut();
        let [accum, accum_update] = state
            .and_then(|state| state.tensors_mut::<2>())
            .ok_or_else(|| configuration_error!("malformed Adadelta state"))?;
        Zip::from(value)
            .and(&grad)
            .and(accum)
            .and(accum_update)
            .for_each(|w, &g, accum, accum_update| {
                *accum = rho * *accum + (1. - rho) * g * g;
                let update = (*accum_update + epsilon).sqrt() / (*accum + epsilon).sqrt() * g;
                *accum_update = rho * *accum_update + (1. - rho) * update * update;
                *w -= learning_rate * update;
            });
        Ok(())
    }
}

/// The optimizer family selected at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OptimizerKind {
    /// [`Adam`].
    Adam(Adam),
    /// [`RmsProp`].
    #[serde(rename = "rmsprop")]
    RmsProp(RmsProp),
    /// [`Adadelta`].
    Adadelta(Adadelta),
}

impl Default for OptimizerKind {
    fn default() -> Self {
        Self::Adam(Adam::default())
    }
}

fn from_kwargs<T: DeserializeOwned>(name: &str, kwargs: &JsonValue) -> Result<T> {
    let kwargs = if kwargs.is_null() {
        JsonValue::Object(Default::default())
    } else {
        kwargs.clone()
    };
    serde_json::from_value(kwargs)
        .map_err(|e| configuration_error!("invalid {name} arguments: {e}"))
}

impl OptimizerKind {
    /// Selects an optimizer by `name` ("adam", "rmsprop" or "adadelta"), overriding its
    /// defaults with `kwargs`.
    ///
    /// **Errors**
    ///
    /// [`Error::Configuration`](crate::error::Error::Configuration) for an unknown name or
    /// unknown keyword.
    pub fn from_name_and_kwargs(name: &str, kwargs: &JsonValue) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "adam" => Ok(Self::Adam(from_kwargs(name, kwargs)?)),
            "rmsprop" => Ok(Self::RmsProp(from_kwargs(name, kwargs)?)),
            "adadelta" => Ok(Self::Adadelta(from_kwargs(name, kwargs)?)),
            _ => Err(configuration_error!("optimizer {name:?} not recognized")),
        }
    }
}

impl Optimizer for OptimizerKind {
    fn name(&self) -> &'static str {
        match self {
            Self::Adam(x) => x.name(),
            Self::RmsProp(x) => x.name(),
            Self::Adadelta(x) => x.name(),
        }
    }
    fn update(&self, learning_rate: f32, parameter: &mut ParameterD) -> Result<()> {
        match self {
            Self::Adam(x) => x.update(learning_rate, parameter),
            Self::RmsProp(x) => x.update(learning_rate, parameter),
            Self::Adadelta(x) => x.update(learning_rate, parameter),
        }
    }
}

/// Exponential learning rate decay.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExponentialDecay {
    /// Steps per decay period.
    pub decay_steps: u64,
    /// Multiplier applied once per period.
    pub decay_rate: f32,
    /// Whether the exponent is floored to whole periods.
    #[serde(default)]
    pub staircase: bool,
}

/// Learning rate schedule.
///
/// Either constant, or `rate * decay_rate^(step / decay_steps)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LearningRate {
    rate: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    decay: Option<ExponentialDecay>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct LearningRateKwargs {
    #[serde(default)]
    decay_steps: Option<u64>,
    #[serde(default)]
    decay_epochs: Option<u64>,
    #[serde(default)]
    decay_rate: Option<f32>,
    #[serde(default)]
    staircase: bool,
}

impl LearningRate {
    /// A constant learning rate.
    pub fn constant(rate: f32) -> Self {
        Self { rate, decay: None }
    }
    /// Adds exponential decay.
    pub fn with_decay(self, decay: ExponentialDecay) -> Self {
        Self {
            decay: Some(decay),
            ..self
        }
    }
    /// Parses `(rate, kwargs)`, ie `(0.001, {"decay_epochs": 50, "decay_rate": 0.1, "staircase": true})`.
    ///
    /// `decay_epochs` is converted to steps with `steps_per_epoch`.
    ///
    /// **Errors**
    ///
    /// [`Error::Configuration`](crate::error::Error::Configuration) if the rate is not positive,
    /// on unknown keys, if only one of the decay period / rate is given, or if `decay_epochs` is
    /// given without `steps_per_epoch`.
    pub fn from_rate_and_kwargs(
        rate: f32,
        kwargs: &JsonValue,
        steps_per_epoch: Option<u64>,
    ) -> Result<Self> {
        if !(rate > 0. && rate.is_finite()) {
            return Err(configuration_error!("learning rate {rate} must be positive"));
        }
        let kwargs: LearningRateKwargs = from_kwargs("learning rate", kwargs)?;
        let decay_steps = match (kwargs.decay_steps, kwargs.decay_epochs) {
            (Some(_), Some(_)) => {
                return Err(configuration_error!(
                    "decay_steps and decay_epochs are mutually exclusive"
                ))
            }
            (Some(steps), None) => Some(steps),
            (None, Some(epochs)) => {
                let steps_per_epoch = steps_per_epoch.ok_or_else(|| {
                    configuration_error!("decay_epochs requires the number of steps per epoch")
                })?;
                Some(epochs * steps_per_epoch)
            }
            (None, None) => None,
        };
        let decay = match (decay_steps, kwargs.decay_rate) {
            (Some(decay_steps), Some(decay_rate)) => {
                if decay_steps == 0 {
                    return Err(configuration_error!("decay period must be positive"));
                }
                Some(ExponentialDecay {
                    decay_steps,
                    decay_rate,
                    staircase: kwargs.staircase,
                })
            }
            (None, None) => None,
            _ => {
                return Err(configuration_error!(
                    "learning rate decay needs both a period and a rate"
                ))
            }
        };
        Ok(Self { rate, decay })
    }
    /// The base rate.
    pub fn rate(&self) -> f32 {
        self.rate
    }
    /// The learning rate at `step`.
    pub fn at(&self, step: u64) -> f32 {
        if let Some(decay) = self.decay.as_ref() {
            let mut exponent = step as f64 / decay.decay_steps as f64;
            if decay.staircase {
                exponent = exponent.floor();
            }
            (self.rate as f64 * (decay.decay_rate as f64).powf(exponent)) as f32
        } else {
            self.rate
        }
    }
}

impl Default for LearningRate {
    fn default() -> Self {
        Self::constant(0.001)
    }
}
