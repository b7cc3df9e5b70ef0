//! Control events and the host-facing control surface.
use std::{collections::VecDeque, fmt, sync::Arc};

use parking_lot::Mutex;

use uvcflow_core::prelude::*;
use uvcflow_device::DeviceDescriptor;

use crate::error::ControlError;

/// Raw event kind: start streaming.
pub const RAW_START_STREAM: u32 = 0;
/// Raw event kind: stop streaming.
pub const RAW_STOP_STREAM: u32 = 1;
/// Raw event kind: reset frame counters.
pub const RAW_RESET_COUNTERS: u32 = 2;
/// Raw event kind: change pixel format (payload: four ASCII bytes).
pub const RAW_CHANGE_FORMAT: u32 = 3;
/// Raw event kind: change resolution (payload: width and height as little-endian `u32`s).
pub const RAW_CHANGE_RESOLUTION: u32 = 4;
/// Raw event kind: error report (payload: UTF-8 message).
pub const RAW_ERROR_REPORT: u32 = 5;

/// Event consumed by the supervisor stage.
///
/// # Example
/// ```rust
/// use uvcflow::prelude::*;
///
/// assert_eq!(ControlEvent::from_raw(1, &[]), ControlEvent::StopStream);
/// assert_eq!(ControlEvent::from_raw(42, &[]), ControlEvent::Unknown(42));
/// let report = ControlEvent::from_raw(5, b"sensor hot");
/// assert_eq!(report, ControlEvent::ErrorReport("sensor hot".into()));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// Begin streaming, optionally asserting the format the host negotiated.
    StartStream(Option<StreamFormat>),
    StopStream,
    ResetCounters,
    /// Acknowledged but not applied at runtime.
    ChangeFormat(Option<FourCc>),
    /// Acknowledged but not applied at runtime.
    ChangeResolution(Option<Resolution>),
    /// Recorded in the error history; no state change.
    ErrorReport(String),
    /// Unrecognised raw kind; logged and discarded.
    Unknown(u32),
}

impl ControlEvent {
    /// Decode a raw `(kind, payload)` pair as posted by transport glue code.
    pub fn from_raw(kind: u32, payload: &[u8]) -> Self {
        match kind {
            RAW_START_STREAM => ControlEvent::StartStream(None),
            RAW_STOP_STREAM => ControlEvent::StopStream,
            RAW_RESET_COUNTERS => ControlEvent::ResetCounters,
            RAW_CHANGE_FORMAT => ControlEvent::ChangeFormat(
                payload
                    .get(..4)
                    .and_then(|b| <[u8; 4]>::try_from(b).ok())
                    .map(FourCc::new),
            ),
            RAW_CHANGE_RESOLUTION => {
                let dims = payload.get(..8).and_then(|b| {
                    let w = u32::from_le_bytes(b[..4].try_into().ok()?);
                    let h = u32::from_le_bytes(b[4..].try_into().ok()?);
                    Resolution::new(w, h)
                });
                ControlEvent::ChangeResolution(dims)
            }
            RAW_ERROR_REPORT => {
                ControlEvent::ErrorReport(String::from_utf8_lossy(payload).into_owned())
            }
            other => ControlEvent::Unknown(other),
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            ControlEvent::StartStream(_) => "start_stream",
            ControlEvent::StopStream => "stop_stream",
            ControlEvent::ResetCounters => "reset_counters",
            ControlEvent::ChangeFormat(_) => "change_format",
            ControlEvent::ChangeResolution(_) => "change_resolution",
            ControlEvent::ErrorReport(_) => "error_report",
            ControlEvent::Unknown(_) => "unknown",
        }
    }
}

/// One entry in the [`ErrorHistory`].
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ErrorRecord {
    /// Monotonic microseconds when the supervisor recorded it.
    pub timestamp: u64,
    pub message: String,
}

/// Bounded ring of the most recent error reports. Clones share the ring.
#[derive(Clone)]
pub struct ErrorHistory {
    inner: Arc<Mutex<VecDeque<ErrorRecord>>>,
    capacity: usize,
}

impl ErrorHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Append, evicting the oldest entry when full.
    pub fn push(&self, record: ErrorRecord) {
        let mut ring = self.inner.lock();
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(record);
    }

    /// Oldest first.
    pub fn recent(&self) -> Vec<ErrorRecord> {
        self.inner.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for ErrorHistory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorHistory")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Current fill level of the pipeline channels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueDepths {
    /// Raw frames waiting for the encoder.
    pub capture_to_encode: usize,
    /// Encoded frames waiting for delivery.
    pub encode_to_delivery: usize,
    /// Pending control events.
    pub control: usize,
}

/// Read-only view of the three channels for depth reporting.
#[derive(Clone, Debug)]
pub struct DepthProbe {
    capture: BoundedRx<FrameSlot>,
    delivery: BoundedRx<FrameSlot>,
    control: BoundedRx<ControlEvent>,
}

impl DepthProbe {
    pub(crate) fn new(
        capture: BoundedRx<FrameSlot>,
        delivery: BoundedRx<FrameSlot>,
        control: BoundedRx<ControlEvent>,
    ) -> Self {
        Self {
            capture,
            delivery,
            control,
        }
    }

    /// Items currently queued on each channel.
    pub fn depths(&self) -> QueueDepths {
        QueueDepths {
            capture_to_encode: self.capture.len(),
            encode_to_delivery: self.delivery.len(),
            control: self.control.len(),
        }
    }

    /// Fixed capacity of each channel.
    pub fn capacities(&self) -> QueueDepths {
        QueueDepths {
            capture_to_encode: self.capture.capacity(),
            encode_to_delivery: self.delivery.capacity(),
            control: self.control.capacity(),
        }
    }
}

/// Host-facing handle for posting control events and reading pipeline state.
///
/// Cheap to clone; every clone posts into the same supervisor queue.
#[derive(Clone, Debug)]
pub struct ControlSurface {
    tx: BoundedTx<ControlEvent>,
    descriptor: Arc<DeviceDescriptor>,
    counters: Arc<FrameCounters>,
    probe: DepthProbe,
    errors: ErrorHistory,
}

impl ControlSurface {
    pub(crate) fn new(
        tx: BoundedTx<ControlEvent>,
        descriptor: Arc<DeviceDescriptor>,
        counters: Arc<FrameCounters>,
        probe: DepthProbe,
        errors: ErrorHistory,
    ) -> Self {
        Self {
            tx,
            descriptor,
            counters,
            probe,
            errors,
        }
    }

    /// Queue an event for the supervisor without blocking.
    pub fn post_control_event(&self, event: ControlEvent) -> Result<(), ControlError> {
        let name = event.name();
        match self.tx.try_send(event) {
            SendOutcome::Accepted => {
                tracing::debug!(event = name, "control event posted");
                Ok(())
            }
            SendOutcome::Full(_) => {
                tracing::warn!(event = name, "control queue full, event rejected");
                Err(ControlError::QueueFull)
            }
            SendOutcome::Closed(_) => Err(ControlError::Closed),
        }
    }

    /// Decode and post a raw `(kind, payload)` event.
    pub fn post_raw_event(&self, kind: u32, payload: &[u8]) -> Result<(), ControlError> {
        self.post_control_event(ControlEvent::from_raw(kind, payload))
    }

    /// Validate `format` against the capture device and post `StartStream`.
    pub fn request_start(&self, format: Option<StreamFormat>) -> Result<(), ControlError> {
        if let Some(format) = format
            && !self.descriptor.supports(&format)
        {
            tracing::warn!(%format, "start rejected: format not advertised");
            return Err(ControlError::ConfigurationUnsupported(format));
        }
        self.post_control_event(ControlEvent::StartStream(format))
    }

    /// Post `StopStream`.
    pub fn request_stop(&self) -> Result<(), ControlError> {
        self.post_control_event(ControlEvent::StopStream)
    }

    /// Consistent counter snapshot.
    pub fn get_counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// Current channel fill levels.
    pub fn get_queue_depths(&self) -> QueueDepths {
        self.probe.depths()
    }

    /// Channel capacities.
    pub fn get_queue_capacities(&self) -> QueueDepths {
        self.probe.capacities()
    }

    /// Most recent error reports, oldest first.
    pub fn recent_errors(&self) -> Vec<ErrorRecord> {
        self.errors.recent()
    }

    /// Formats the capture device advertises.
    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surface(control_depth: usize) -> (ControlSurface, BoundedRx<ControlEvent>) {
        let (ctl_tx, ctl_rx) = bounded(control_depth);
        let (_cap_tx, cap_rx) = bounded(3);
        let (_del_tx, del_rx) = bounded(3);
        let descriptor = Arc::new(DeviceDescriptor::new("cam", [StreamFormat::default()], 4));
        let surface = ControlSurface::new(
            ctl_tx,
            descriptor,
            Arc::new(FrameCounters::new()),
            DepthProbe::new(cap_rx, del_rx, ctl_rx.clone()),
            ErrorHistory::new(4),
        );
        (surface, ctl_rx)
    }

    #[test]
    fn raw_resolution_payload_decodes() {
        let mut payload = 640u32.to_le_bytes().to_vec();
        payload.extend_from_slice(&480u32.to_le_bytes());
        assert_eq!(
            ControlEvent::from_raw(RAW_CHANGE_RESOLUTION, &payload),
            ControlEvent::ChangeResolution(Resolution::new(640, 480))
        );
        assert_eq!(
            ControlEvent::from_raw(RAW_CHANGE_RESOLUTION, &[1, 2]),
            ControlEvent::ChangeResolution(None)
        );
        assert_eq!(
            ControlEvent::from_raw(RAW_CHANGE_FORMAT, b"H264"),
            ControlEvent::ChangeFormat(Some(FourCc::H264))
        );
    }

    #[test]
    fn full_control_queue_reports_queue_full() {
        let (surface, _rx) = surface(2);
        surface.post_control_event(ControlEvent::StopStream).unwrap();
        surface.post_raw_event(RAW_RESET_COUNTERS, &[]).unwrap();
        assert_eq!(
            surface.post_control_event(ControlEvent::StopStream),
            Err(ControlError::QueueFull)
        );
        assert_eq!(surface.get_queue_depths().control, 2);
        assert_eq!(surface.get_queue_capacities().capture_to_encode, 3);
    }

    #[test]
    fn unadvertised_start_is_rejected_before_queueing() {
        let (surface, rx) = surface(4);
        let vga = StreamFormat::new(FourCc::MJPG, Resolution::new(640, 480).unwrap());
        assert_eq!(
            surface.request_start(Some(vga)),
            Err(ControlError::ConfigurationUnsupported(vga))
        );
        assert!(rx.is_empty());
        surface.request_start(Some(StreamFormat::default())).unwrap();
        assert_eq!(rx.len(), 1);
    }

    #[test]
    fn error_history_evicts_oldest() {
        let history = ErrorHistory::new(2);
        for (i, msg) in ["a", "b", "c"].into_iter().enumerate() {
            history.push(ErrorRecord {
                timestamp: i as u64,
                message: msg.into(),
            });
        }
        let recent: Vec<_> = history.recent().into_iter().map(|r| r.message).collect();
        assert_eq!(recent, vec!["b", "c"]);
    }
}
