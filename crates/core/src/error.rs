/// Coarse error classes shared by every stage.
///
/// Stages use the class to decide between retrying, dropping a frame, or giving up on their
/// own main loop; no class is ever propagated across a stage boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Device not ready, no frame available, timeout. Retried silently.
    Transient,
    /// Allocation failure or full channel. The current frame is dropped and counted.
    ResourceExhausted,
    /// Unexpected negotiation or configuration failure. Fatal for the affected stage only.
    DeviceProtocolFailure,
    /// Requested configuration is not offered by the device. The request is rejected.
    ConfigurationUnsupported,
}

/// Errors raised by frame slot and frame pool operations.
///
/// # Example
/// ```rust
/// use uvcflow_core::prelude::{ErrorClass, SlotError};
///
/// let err = SlotError::AllocationFailed { requested: 4096, in_use: 0, budget: 1024 };
/// assert_eq!(err.class(), ErrorClass::ResourceExhausted);
/// assert_eq!(err.code(), "allocation_failed");
/// ```
#[derive(Debug, thiserror::Error)]
pub enum SlotError {
    /// The frame allocator refused the request.
    #[error("frame allocation of {requested} bytes failed ({in_use}/{budget} bytes in use)")]
    AllocationFailed {
        /// Requested capacity.
        requested: usize,
        /// Bytes leased at the time of the request.
        in_use: usize,
        /// Allocator budget.
        budget: usize,
    },
    /// A zero-capacity frame was requested.
    #[error("zero-capacity frame requested")]
    ZeroCapacity,
    /// Payload does not fit the slot.
    #[error("payload of {len} bytes exceeds slot capacity {capacity}")]
    Overflow {
        /// Payload length.
        len: usize,
        /// Slot capacity.
        capacity: usize,
    },
    /// Borrowed device slots cannot be written by the pipeline.
    #[error("slot {index} is borrowed from a device and read-only")]
    ReadOnly {
        /// Slot index.
        index: usize,
    },
    /// The owning device rejected a slot return.
    #[error("returning slot {index} to {owner} failed: {reason}")]
    ReturnFailed {
        /// Owner label.
        owner: String,
        /// Slot index.
        index: usize,
        /// Device-provided detail.
        reason: String,
    },
}

impl SlotError {
    /// Stable string code for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            SlotError::AllocationFailed { .. } => "allocation_failed",
            SlotError::ZeroCapacity => "zero_capacity",
            SlotError::Overflow { .. } => "overflow",
            SlotError::ReadOnly { .. } => "read_only",
            SlotError::ReturnFailed { .. } => "return_failed",
        }
    }

    /// Map onto the shared error taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            SlotError::AllocationFailed { .. } | SlotError::Overflow { .. } => {
                ErrorClass::ResourceExhausted
            }
            SlotError::ZeroCapacity => ErrorClass::ResourceExhausted,
            SlotError::ReadOnly { .. } | SlotError::ReturnFailed { .. } => {
                ErrorClass::DeviceProtocolFailure
            }
        }
    }
}
