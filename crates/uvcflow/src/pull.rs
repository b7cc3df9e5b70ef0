//! Host-driven delivery: the transport pulls encoded frames instead of a delivery stage pushing.
use std::{fmt, sync::Arc, time::Duration};

use uvcflow_core::prelude::*;

/// An encoded frame lent to the host. Give it back with [`PullDelivery::return_frame`];
/// dropping it releases the buffer as well.
pub struct FrameHandle {
    frame: FrameSlot,
}

impl FrameHandle {
    /// Encoded bytes.
    pub fn data(&self) -> &[u8] {
        self.frame.data()
    }

    pub fn len(&self) -> usize {
        self.frame.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frame.is_empty()
    }

    /// Capture timestamp in monotonic microseconds.
    pub fn timestamp(&self) -> u64 {
        self.frame.meta().timestamp
    }

    /// Capture sequence number.
    pub fn sequence(&self) -> u64 {
        self.frame.meta().sequence
    }

    /// Encoder output format.
    pub fn codec_tag(&self) -> Option<CodecTag> {
        self.frame.meta().codec_tag
    }
}

impl fmt::Debug for FrameHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameHandle")
            .field("sequence", &self.sequence())
            .field("len", &self.len())
            .finish()
    }
}

/// Consumer end of the encode→delivery channel, handed to the host.
pub struct PullDelivery {
    rx: BoundedRx<FrameSlot>,
    counters: Arc<FrameCounters>,
    flags: Arc<ReadinessFlags>,
    handed_out: u64,
}

impl PullDelivery {
    pub(crate) fn new(
        rx: BoundedRx<FrameSlot>,
        counters: Arc<FrameCounters>,
        flags: Arc<ReadinessFlags>,
    ) -> Self {
        Self {
            rx,
            counters,
            flags,
            handed_out: 0,
        }
    }

    /// Wait up to `timeout` for the next encoded frame. Returns `None` on timeout or once the
    /// pipeline is shutting down.
    pub fn request_next_frame(&mut self, timeout: Duration) -> Option<FrameHandle> {
        if self.flags.is_shutdown() {
            return None;
        }
        match self.rx.recv_timeout(timeout) {
            RecvOutcome::Data(frame) => {
                self.counters.record_delivered(frame.meta().epoch);
                self.handed_out += 1;
                tracing::trace!(sequence = frame.meta().sequence, len = frame.len(), "frame pulled");
                Some(FrameHandle { frame })
            }
            RecvOutcome::Timeout | RecvOutcome::Closed => None,
        }
    }

    /// Give a frame back once the host is done with it.
    pub fn return_frame(&self, handle: FrameHandle) {
        handle.frame.discard();
    }

    /// Frames handed out so far.
    pub fn handed_out(&self) -> u64 {
        self.handed_out
    }
}

impl fmt::Debug for PullDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PullDelivery")
            .field("queued", &self.rx.len())
            .field("handed_out", &self.handed_out)
            .finish()
    }
}
