//! In-memory devices for tests and demos.
//!
//! Payloads carry a frame id in their first bytes so the output side can tell which capture
//! produced a delivered frame.
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;

use uvcflow_core::prelude::*;

use crate::{CaptureDevice, DeviceDescriptor, DeviceError, EncoderDevice, Transport};

const SOI: [u8; 2] = [0xff, 0xd8];
const EOI: [u8; 2] = [0xff, 0xd9];

/// Read the frame id out of a raw virtual capture or a virtual MJPEG payload.
///
/// # Example
/// ```rust
/// use uvcflow_device::prelude::frame_id;
///
/// let mut raw = 42u64.to_le_bytes().to_vec();
/// raw.extend_from_slice(&[0; 8]);
/// assert_eq!(frame_id(&raw), Some(42));
/// ```
pub fn frame_id(payload: &[u8]) -> Option<u64> {
    let body = payload.strip_prefix(&SOI).unwrap_or(payload);
    let id: [u8; 8] = body.get(..8)?.try_into().ok()?;
    Some(u64::from_le_bytes(id))
}

/// Checkout/return bookkeeping for a [`VirtualCamera`].
#[derive(Debug, Default)]
pub struct SlotLedger {
    checkouts: AtomicU64,
    returns: AtomicU64,
    double_returns: AtomicU64,
}

impl SlotLedger {
    /// Slots handed out so far.
    pub fn checkouts(&self) -> u64 {
        self.checkouts.load(Ordering::SeqCst)
    }

    /// Slots given back so far.
    pub fn returns(&self) -> u64 {
        self.returns.load(Ordering::SeqCst)
    }

    /// Returns of slots that were not checked out.
    pub fn double_returns(&self) -> u64 {
        self.double_returns.load(Ordering::SeqCst)
    }

    /// Slots currently held by the pipeline.
    pub fn outstanding(&self) -> u64 {
        self.checkouts().saturating_sub(self.returns())
    }
}

/// Settings for a [`VirtualCamera`].
#[derive(Debug, Clone)]
pub struct VirtualCameraConfig {
    /// Device name.
    pub name: String,
    /// Advertised formats.
    pub formats: Vec<StreamFormat>,
    /// Slots in the ring.
    pub slot_count: usize,
    /// Bytes per slot.
    pub slot_capacity: usize,
    /// Bytes written per frame (clamped to the slot capacity).
    pub frame_len: usize,
    /// Minimum spacing between frames; `None` produces frames as fast as they are asked for.
    pub frame_interval: Option<Duration>,
    /// Stop producing after this many frames.
    pub frame_limit: Option<u64>,
    /// Make `configure` fail with a protocol error.
    pub fail_configure: bool,
}

impl Default for VirtualCameraConfig {
    fn default() -> Self {
        Self {
            name: "virtual-camera".into(),
            formats: vec![StreamFormat::default()],
            slot_count: 4,
            slot_capacity: 4096,
            frame_len: 1024,
            frame_interval: None,
            frame_limit: None,
            fail_configure: false,
        }
    }
}

/// Virtual sensor with a fixed slot ring.
///
/// # Example
/// ```rust
/// use uvcflow_device::prelude::*;
///
/// let mut camera = VirtualCamera::new(VirtualCameraConfig {
///     slot_count: 1,
///     ..VirtualCameraConfig::default()
/// });
/// camera.configure(StreamFormat::default()).unwrap();
/// let slot = camera.checkout_capture_slot().unwrap();
/// assert_eq!(frame_id(&slot.data), Some(0));
/// assert_eq!(camera.checkout_capture_slot().unwrap_err(), DeviceError::NoFrameReady);
/// camera.return_capture_slot(slot.index).unwrap();
/// assert!(camera.return_capture_slot(slot.index).is_err());
/// assert_eq!(camera.ledger().double_returns(), 1);
/// ```
pub struct VirtualCamera {
    config: VirtualCameraConfig,
    descriptor: DeviceDescriptor,
    configured: Option<StreamFormat>,
    checked_out: Vec<bool>,
    cursor: usize,
    produced: u64,
    last_frame: Option<Instant>,
    ledger: Arc<SlotLedger>,
}

impl VirtualCamera {
    /// Create a camera from `config`.
    pub fn new(config: VirtualCameraConfig) -> Self {
        let slot_count = config.slot_count.max(1);
        let descriptor =
            DeviceDescriptor::new(config.name.clone(), config.formats.iter().copied(), slot_count);
        Self {
            config,
            descriptor,
            configured: None,
            checked_out: vec![false; slot_count],
            cursor: 0,
            produced: 0,
            last_frame: None,
            ledger: Arc::new(SlotLedger::default()),
        }
    }

    /// Shared ledger, readable after the camera moved into a pipeline.
    pub fn ledger(&self) -> Arc<SlotLedger> {
        self.ledger.clone()
    }

    fn next_free(&self) -> Option<usize> {
        let n = self.checked_out.len();
        (0..n)
            .map(|offset| (self.cursor + offset) % n)
            .find(|&idx| !self.checked_out[idx])
    }

    fn fill(&self, id: u64) -> Bytes {
        let len = self.config.frame_len.clamp(8, self.config.slot_capacity.max(8));
        let mut buf = BytesMut::with_capacity(len);
        buf.put_u64_le(id);
        buf.put_bytes((id % 256) as u8, len - 8);
        buf.freeze()
    }
}

impl CaptureDevice for VirtualCamera {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn configure(&mut self, format: StreamFormat) -> Result<(), DeviceError> {
        if self.config.fail_configure {
            return Err(DeviceError::Protocol("format negotiation refused".into()));
        }
        self.descriptor.check(&format)?;
        self.configured = Some(format);
        Ok(())
    }

    fn checkout_capture_slot(&mut self) -> Result<SlotCheckout, DeviceError> {
        if self.configured.is_none() {
            return Err(DeviceError::Protocol("capture device not configured".into()));
        }
        if self.config.frame_limit.is_some_and(|limit| self.produced >= limit) {
            return Err(DeviceError::NoFrameReady);
        }
        if let (Some(interval), Some(last)) = (self.config.frame_interval, self.last_frame) {
            if last.elapsed() < interval {
                return Err(DeviceError::NoFrameReady);
            }
        }
        let index = self.next_free().ok_or(DeviceError::NoFrameReady)?;
        let id = self.produced;
        let data = self.fill(id);
        self.checked_out[index] = true;
        self.cursor = (index + 1) % self.checked_out.len();
        self.produced += 1;
        self.last_frame = Some(Instant::now());
        self.ledger.checkouts.fetch_add(1, Ordering::SeqCst);
        Ok(SlotCheckout {
            index,
            bytes_used: data.len(),
            capacity: self.config.slot_capacity.max(data.len()),
            data,
        })
    }

    fn return_capture_slot(&mut self, index: usize) -> Result<(), DeviceError> {
        match self.checked_out.get_mut(index) {
            Some(flag) if *flag => {
                *flag = false;
                self.ledger.returns.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Some(_) => {
                self.ledger.double_returns.fetch_add(1, Ordering::SeqCst);
                tracing::warn!(index, "virtual camera: slot returned twice");
                Err(DeviceError::UnknownSlot { index })
            }
            None => Err(DeviceError::UnknownSlot { index }),
        }
    }
}

/// Fault injection for [`VirtualEncoder`]. Counts are 1-based exchange numbers.
#[derive(Debug, Clone, Default)]
pub struct EncoderFaults {
    /// Reject every Nth input submission.
    pub reject_input_every: Option<u64>,
    /// Fail every Nth output collection.
    pub fail_output_every: Option<u64>,
    /// Simulated encode time.
    pub latency: Option<Duration>,
    /// Make `configure` fail with a protocol error.
    pub fail_configure: bool,
}

/// Virtual encoder producing MJPEG-framed output that echoes the input frame id.
///
/// # Example
/// ```rust
/// use uvcflow_device::prelude::*;
///
/// let mut encoder = VirtualEncoder::new(FourCc::MJPG);
/// let mut raw = 7u64.to_le_bytes().to_vec();
/// raw.resize(256, 0);
/// encoder.submit_encode_input(&raw).unwrap();
/// let out = encoder.receive_encode_output().unwrap();
/// encoder.finish_exchange();
/// assert_eq!(&out[..2], &[0xff, 0xd8]);
/// assert_eq!(frame_id(&out), Some(7));
/// ```
pub struct VirtualEncoder {
    codec: CodecTag,
    faults: EncoderFaults,
    pending: Option<Bytes>,
    in_flight: bool,
    submissions: u64,
    collections: u64,
}

impl VirtualEncoder {
    /// Encoder with no faults.
    pub fn new(codec: CodecTag) -> Self {
        Self::with_faults(codec, EncoderFaults::default())
    }

    /// Encoder with fault injection.
    pub fn with_faults(codec: CodecTag, faults: EncoderFaults) -> Self {
        Self {
            codec,
            faults,
            pending: None,
            in_flight: false,
            submissions: 0,
            collections: 0,
        }
    }

    fn compress(input: &[u8]) -> Bytes {
        let body = (input.len() / 10).max(8);
        let mut out = BytesMut::with_capacity(body + 4);
        out.put_slice(&SOI);
        match input.get(..8) {
            Some(id) => out.put_slice(id),
            None => out.put_bytes(0, 8),
        }
        out.put_bytes(0x55, body - 8);
        out.put_slice(&EOI);
        out.freeze()
    }
}

fn nth(every: Option<u64>, count: u64) -> bool {
    every.is_some_and(|n| n > 0 && count % n == 0)
}

impl EncoderDevice for VirtualEncoder {
    fn configure(&mut self, _format: StreamFormat) -> Result<(), DeviceError> {
        if self.faults.fail_configure {
            return Err(DeviceError::Protocol("encoder refused input format".into()));
        }
        Ok(())
    }

    fn submit_encode_input(&mut self, data: &[u8]) -> Result<(), DeviceError> {
        if self.in_flight {
            return Err(DeviceError::Rejected("exchange already in flight".into()));
        }
        self.submissions += 1;
        if nth(self.faults.reject_input_every, self.submissions) {
            return Err(DeviceError::Rejected(format!(
                "input {} refused",
                self.submissions
            )));
        }
        if let Some(latency) = self.faults.latency {
            std::thread::sleep(latency);
        }
        self.pending = Some(Self::compress(data));
        self.in_flight = true;
        Ok(())
    }

    fn receive_encode_output(&mut self) -> Result<Bytes, DeviceError> {
        let Some(out) = self.pending.take() else {
            return Err(DeviceError::OutputFailed("no input queued".into()));
        };
        self.collections += 1;
        if nth(self.faults.fail_output_every, self.collections) {
            return Err(DeviceError::OutputFailed(format!(
                "output {} lost",
                self.collections
            )));
        }
        Ok(out)
    }

    fn finish_exchange(&mut self) {
        self.pending = None;
        self.in_flight = false;
    }

    fn query_output_format(&self) -> CodecTag {
        self.codec
    }
}

/// One frame seen by a [`RecordingTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredFrame {
    /// Capture timestamp.
    pub timestamp: u64,
    /// Payload size.
    pub len: usize,
    /// Frame id recovered from the payload.
    pub frame_id: Option<u64>,
}

/// Transport that records what it receives. Clones share the same log.
///
/// # Example
/// ```rust
/// use uvcflow_device::prelude::*;
///
/// let transport = RecordingTransport::new();
/// let mut sink = transport.clone();
/// sink.on_frame_ready(&[0xff, 0xd8, 3, 0, 0, 0, 0, 0, 0, 0], 10).unwrap();
/// assert_eq!(transport.frames()[0].frame_id, Some(3));
/// ```
#[derive(Clone, Default)]
pub struct RecordingTransport {
    frames: Arc<Mutex<Vec<DeliveredFrame>>>,
    fail_every: Option<u64>,
    calls: Arc<AtomicU64>,
}

impl RecordingTransport {
    /// Transport that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport that refuses every Nth frame.
    pub fn failing_every(n: u64) -> Self {
        Self {
            fail_every: Some(n),
            ..Self::default()
        }
    }

    /// Frames accepted so far.
    pub fn frames(&self) -> Vec<DeliveredFrame> {
        self.frames.lock().clone()
    }

    /// Number of frames accepted so far.
    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    /// Whether nothing was accepted yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Transport for RecordingTransport {
    fn on_frame_ready(&mut self, payload: &[u8], timestamp: u64) -> Result<(), DeviceError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if nth(self.fail_every, call) {
            return Err(DeviceError::Transport(format!("frame {call} refused")));
        }
        self.frames.lock().push(DeliveredFrame {
            timestamp,
            len: payload.len(),
            frame_id: frame_id(payload),
        });
        Ok(())
    }
}
