use derive_more::IsVariant;

/// Errors raised while building, running or restoring a network.
///
/// Public functions return [`anyhow::Result`]; the underlying cause is always one of these
/// variants and can be recovered with [`anyhow::Error::downcast_ref`]:
///
///```
/// # use vesselseg::{error::Error, learn::neural_network::registry::LayerParamsRegistry};
/// let defaults = LayerParamsRegistry::new();
/// let overrides: LayerParamsRegistry = serde_json::from_str(r#"{"conv_9_9": {"ks": 3}}"#).unwrap();
/// let error = defaults.merge(&overrides).unwrap_err();
/// assert!(error.downcast_ref::<Error>().unwrap().is_configuration());
///```
#[derive(Debug, Clone, PartialEq, IsVariant, thiserror::Error)]
pub enum Error {
    /// Unrecognized names, unknown or duplicate stages, out of range values.
    ///
    /// Always fatal at construction.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Channel or spatial mismatch between adjacent stages, at skip fusion, or when restoring a
    /// checkpoint.
    #[error("shape error: {0}")]
    Shape(String),
    /// The loss became non-finite during training.
    ///
    /// Parameters are left untouched, recovery is up to the caller.
    #[error("numerical error: loss is {loss} at step {step}")]
    Numerical {
        /// The global step that produced the loss.
        step: u64,
        /// The non-finite loss.
        loss: f32,
    },
    /// The network was used after [`finalize()`](crate::learn::neural_network::Network::finalize).
    #[error("invalid state: {0}")]
    InvalidState(String),
}

macro_rules! configuration_error {
    ($($arg:tt)*) => {
        anyhow::Error::from($crate::error::Error::Configuration(format!($($arg)*)))
    };
}

macro_rules! shape_error {
    ($($arg:tt)*) => {
        anyhow::Error::from($crate::error::Error::Shape(format!($($arg)*)))
    };
}

pub(crate) use configuration_error;
pub(crate) use shape_error;
