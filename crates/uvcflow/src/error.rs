use uvcflow_core::prelude::{ErrorClass, StreamFormat};
use uvcflow_device::DeviceError;

use crate::config::ConfigError;

/// Errors raised while assembling or starting a pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("pipeline config rejected: {0}")]
    InvalidConfig(String),
    #[error("pipeline needs a {0}")]
    MissingComponent(&'static str),
    #[error("failed to spawn {stage} stage: {source}")]
    StageSpawn {
        stage: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("pull delivery already taken")]
    DeliveryTaken,
}

impl PipelineError {
    /// Stable string code for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::Device(err) => err.code(),
            PipelineError::Config(err) => err.code(),
            PipelineError::InvalidConfig(_) => "invalid_config",
            PipelineError::MissingComponent(_) => "missing_component",
            PipelineError::StageSpawn { .. } => "stage_spawn",
            PipelineError::DeliveryTaken => "delivery_taken",
        }
    }

    /// Map onto the shared error taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            PipelineError::Device(err) => err.class(),
            PipelineError::InvalidConfig(_) => ErrorClass::ConfigurationUnsupported,
            PipelineError::StageSpawn { .. } => ErrorClass::ResourceExhausted,
            PipelineError::Config(_)
            | PipelineError::MissingComponent(_)
            | PipelineError::DeliveryTaken => ErrorClass::DeviceProtocolFailure,
        }
    }
}

/// Errors returned by [`ControlSurface`](crate::control::ControlSurface).
///
/// # Example
/// ```rust
/// use uvcflow::prelude::*;
///
/// let err = ControlError::QueueFull;
/// assert!(err.retryable());
/// assert_eq!(err.class(), ErrorClass::ResourceExhausted);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    #[error("control queue full")]
    QueueFull,
    #[error("control queue closed")]
    Closed,
    #[error("format {0} is not advertised by the capture device")]
    ConfigurationUnsupported(StreamFormat),
}

impl ControlError {
    /// Stable string code for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            ControlError::QueueFull => "queue_full",
            ControlError::Closed => "closed",
            ControlError::ConfigurationUnsupported(_) => "configuration_unsupported",
        }
    }

    /// Map onto the shared error taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            ControlError::QueueFull => ErrorClass::ResourceExhausted,
            ControlError::Closed => ErrorClass::DeviceProtocolFailure,
            ControlError::ConfigurationUnsupported(_) => ErrorClass::ConfigurationUnsupported,
        }
    }

    /// Whether posting again later can succeed.
    pub fn retryable(&self) -> bool {
        matches!(self, ControlError::QueueFull)
    }
}
