#![doc = include_str!("../README.md")]

use std::{fmt, sync::Arc};

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use smallvec::SmallVec;

use uvcflow_core::prelude::*;

mod error;
pub mod virtual_backend;

pub use error::DeviceError;

/// Formats and ring geometry advertised by a capture device.
///
/// # Example
/// ```rust
/// use uvcflow_device::prelude::*;
///
/// let descriptor = DeviceDescriptor::new("cam0", [StreamFormat::default()], 4);
/// assert!(descriptor.supports(&StreamFormat::default()));
/// let vga = StreamFormat::new(FourCc::MJPG, Resolution::new(640, 480).unwrap());
/// assert!(descriptor.check(&vga).is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceDescriptor {
    /// Human-readable device name.
    pub name: String,
    /// Advertised stream formats.
    pub formats: SmallVec<[StreamFormat; 4]>,
    /// Number of slots in the device ring.
    pub slot_count: usize,
}

impl DeviceDescriptor {
    /// Build a descriptor.
    pub fn new(
        name: impl Into<String>,
        formats: impl IntoIterator<Item = StreamFormat>,
        slot_count: usize,
    ) -> Self {
        Self {
            name: name.into(),
            formats: formats.into_iter().collect(),
            slot_count,
        }
    }

    /// Whether `format` is advertised.
    pub fn supports(&self, format: &StreamFormat) -> bool {
        self.formats.iter().any(|f| f == format)
    }

    /// Validate a requested format against the advertised list.
    pub fn check(&self, format: &StreamFormat) -> Result<(), DeviceError> {
        if self.supports(format) {
            Ok(())
        } else {
            Err(DeviceError::NotSupported { format: *format })
        }
    }
}

/// Sensor side: a ring of fixed slots filled by hardware.
pub trait CaptureDevice: Send {
    /// Advertised formats.
    fn descriptor(&self) -> &DeviceDescriptor;

    /// Negotiate `format`.
    fn configure(&mut self, format: StreamFormat) -> Result<(), DeviceError>;

    /// Check out the next filled slot. `NoFrameReady` when none is available yet.
    fn checkout_capture_slot(&mut self) -> Result<SlotCheckout, DeviceError>;

    /// Give a slot back so it can be refilled.
    fn return_capture_slot(&mut self, index: usize) -> Result<(), DeviceError>;
}

/// Hardware encoder handling one input/output exchange at a time.
pub trait EncoderDevice: Send {
    /// Negotiate the input format.
    fn configure(&mut self, format: StreamFormat) -> Result<(), DeviceError>;

    /// Queue raw input for encoding.
    fn submit_encode_input(&mut self, data: &[u8]) -> Result<(), DeviceError>;

    /// Collect the encoded output of the current exchange.
    fn receive_encode_output(&mut self) -> Result<Bytes, DeviceError>;

    /// Hand the output buffer back and end the exchange. Also aborts a failed exchange.
    fn finish_exchange(&mut self);

    /// Codec of the produced bitstream.
    fn query_output_format(&self) -> CodecTag;
}

/// Downstream consumer of encoded frames (the USB video-class function).
pub trait Transport: Send {
    /// Called synchronously for every encoded frame.
    fn on_frame_ready(&mut self, payload: &[u8], timestamp: u64) -> Result<(), DeviceError>;
}

/// Shared, lock-guarded capture device.
///
/// Also the [`SlotOwner`] for every borrowed slot the device hands out.
///
/// # Example
/// ```rust
/// use uvcflow_device::prelude::*;
///
/// let camera = VirtualCamera::new(VirtualCameraConfig::default());
/// let ledger = camera.ledger();
/// let handle = CaptureHandle::new(camera);
/// handle.lock().configure(StreamFormat::default()).unwrap();
/// let checkout = handle.lock().checkout_capture_slot().unwrap();
/// handle.slot_owner().return_slot(checkout.index).unwrap();
/// assert_eq!(ledger.outstanding(), 0);
/// ```
#[derive(Clone)]
pub struct CaptureHandle {
    device: Arc<Mutex<Box<dyn CaptureDevice>>>,
    label: Arc<str>,
}

impl CaptureHandle {
    /// Wrap a device.
    pub fn new(device: impl CaptureDevice + 'static) -> Self {
        let label = Arc::from(device.descriptor().name.as_str());
        Self {
            device: Arc::new(Mutex::new(Box::new(device))),
            label,
        }
    }

    /// Block until the device lock is held.
    pub fn lock(&self) -> MutexGuard<'_, Box<dyn CaptureDevice>> {
        self.device.lock()
    }

    /// Copy of the device descriptor.
    pub fn descriptor(&self) -> DeviceDescriptor {
        self.device.lock().descriptor().clone()
    }

    /// Device name.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Owner handle to attach to borrowed slots.
    pub fn slot_owner(&self) -> Arc<dyn SlotOwner> {
        Arc::new(self.clone())
    }
}

impl SlotOwner for CaptureHandle {
    fn label(&self) -> &str {
        &self.label
    }

    fn return_slot(&self, index: usize) -> Result<(), SlotError> {
        self.device
            .lock()
            .return_capture_slot(index)
            .map_err(|err| SlotError::ReturnFailed {
                owner: self.label.to_string(),
                index,
                reason: err.to_string(),
            })
    }
}

impl fmt::Debug for CaptureHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureHandle")
            .field("label", &self.label)
            .finish()
    }
}

/// Shared, lock-guarded encoder. Holding the lock is holding the single exchange in flight.
#[derive(Clone)]
pub struct EncoderHandle {
    device: Arc<Mutex<Box<dyn EncoderDevice>>>,
}

impl EncoderHandle {
    /// Wrap an encoder.
    pub fn new(device: impl EncoderDevice + 'static) -> Self {
        Self {
            device: Arc::new(Mutex::new(Box::new(device))),
        }
    }

    /// Block until the encoder lock is held.
    pub fn lock(&self) -> MutexGuard<'_, Box<dyn EncoderDevice>> {
        self.device.lock()
    }
}

impl fmt::Debug for EncoderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncoderHandle").finish_non_exhaustive()
    }
}

pub mod prelude {
    pub use crate::{
        CaptureDevice, CaptureHandle, DeviceDescriptor, DeviceError, EncoderDevice,
        EncoderHandle, Transport,
        virtual_backend::{
            DeliveredFrame, EncoderFaults, RecordingTransport, SlotLedger, VirtualCamera,
            VirtualCameraConfig, VirtualEncoder, frame_id,
        },
    };
    pub use uvcflow_core::prelude::*;
}
