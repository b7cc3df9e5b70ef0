use uvcflow_core::prelude::{ErrorClass, StreamFormat};

/// Errors reported by capture, encoder and transport devices.
///
/// # Example
/// ```rust
/// use uvcflow_device::prelude::*;
///
/// assert!(DeviceError::NoFrameReady.retryable());
/// let err = DeviceError::NotSupported { format: StreamFormat::default() };
/// assert_eq!(err.class(), ErrorClass::ConfigurationUnsupported);
/// assert_eq!(err.code(), "not_supported");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    /// No filled slot is available yet.
    #[error("no frame ready")]
    NoFrameReady,
    /// The device does not advertise the requested format.
    #[error("format {format} not supported by device")]
    NotSupported {
        /// Requested format.
        format: StreamFormat,
    },
    /// Encoder refused the input buffer.
    #[error("encoder rejected input: {0}")]
    Rejected(String),
    /// Encoder produced no usable output.
    #[error("encoder output failed: {0}")]
    OutputFailed(String),
    /// Slot index not currently checked out.
    #[error("slot {index} is not checked out")]
    UnknownSlot {
        /// Offending index.
        index: usize,
    },
    /// Transport refused the frame.
    #[error("transport failed: {0}")]
    Transport(String),
    /// Unexpected negotiation or configuration failure.
    #[error("device protocol failure: {0}")]
    Protocol(String),
}

impl DeviceError {
    /// Stable string code for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            DeviceError::NoFrameReady => "no_frame_ready",
            DeviceError::NotSupported { .. } => "not_supported",
            DeviceError::Rejected(_) => "rejected",
            DeviceError::OutputFailed(_) => "output_failed",
            DeviceError::UnknownSlot { .. } => "unknown_slot",
            DeviceError::Transport(_) => "transport",
            DeviceError::Protocol(_) => "protocol",
        }
    }

    /// Map onto the shared error taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            DeviceError::NoFrameReady => ErrorClass::Transient,
            DeviceError::NotSupported { .. } => ErrorClass::ConfigurationUnsupported,
            DeviceError::Rejected(_) | DeviceError::OutputFailed(_) | DeviceError::Transport(_) => {
                ErrorClass::ResourceExhausted
            }
            DeviceError::UnknownSlot { .. } | DeviceError::Protocol(_) => {
                ErrorClass::DeviceProtocolFailure
            }
        }
    }

    /// Whether retrying the same call later can succeed.
    pub fn retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient)
    }
}
