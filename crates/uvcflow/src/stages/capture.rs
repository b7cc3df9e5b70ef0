use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use uvcflow_core::prelude::*;
use uvcflow_device::{CaptureHandle, DeviceError};

use crate::{config::StageTiming, error::PipelineError, metrics::StageMetrics, stages::Stage};

const STAGE: &str = "capture";

/// Capture stage states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    WaitCameraReady,
    WaitStreamingActive,
    Capturing,
    Draining,
    Terminated,
}

/// What one capture attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// Frame forwarded to the encode stage.
    Forwarded { sequence: u64 },
    /// Encode queue full; slot returned and frame counted as dropped.
    Dropped { sequence: u64 },
    /// Device had nothing ready.
    NoFrame,
    /// Device call failed; retried next cycle.
    DeviceError,
    /// Downstream channel is closed.
    Closed,
}

/// Checks filled slots out of the capture device and forwards them, borrowed, to encode.
pub struct CaptureStage {
    device: CaptureHandle,
    owner: Arc<dyn SlotOwner>,
    tx: BoundedTx<FrameSlot>,
    flags: Arc<ReadinessFlags>,
    counters: Arc<FrameCounters>,
    metrics: StageMetrics,
    clock: MonotonicClock,
    timing: StageTiming,
    format: StreamFormat,
    state: CaptureState,
    sequence: u64,
    forwarded: u64,
    dropped: u64,
    /// Consecutive failed checkouts; only the first is logged at warn.
    failure_streak: u64,
}

impl CaptureStage {
    /// Stage that checks out camera slots and forwards them on `tx`.
    pub fn new(
        device: CaptureHandle,
        tx: BoundedTx<FrameSlot>,
        flags: Arc<ReadinessFlags>,
        counters: Arc<FrameCounters>,
        timing: StageTiming,
        format: StreamFormat,
    ) -> Self {
        let owner = device.slot_owner();
        Self {
            device,
            owner,
            tx,
            flags,
            counters,
            metrics: StageMetrics::default(),
            clock: MonotonicClock::new(),
            timing,
            format,
            state: CaptureState::WaitCameraReady,
            sequence: 0,
            forwarded: 0,
            dropped: 0,
            failure_streak: 0,
        }
    }

    /// Record per-frame timing into `metrics`.
    pub fn with_metrics(mut self, metrics: StageMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Stamp frames with `clock`.
    pub fn with_clock(mut self, clock: MonotonicClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    /// Advance the state machine by one step.
    pub fn step(&mut self) -> CaptureState {
        let wake = FlagSet::from(Flag::Shutdown);
        self.state = match self.state {
            CaptureState::WaitCameraReady => {
                self.flags
                    .wait_any(wake.with(Flag::CaptureReady), self.timing.poll);
                if self.flags.is_shutdown() {
                    CaptureState::Draining
                } else if self.flags.is_set(Flag::CaptureReady) {
                    CaptureState::WaitStreamingActive
                } else {
                    CaptureState::WaitCameraReady
                }
            }
            CaptureState::WaitStreamingActive => {
                self.flags
                    .wait_any(wake.with(Flag::StreamingActive), self.timing.idle);
                if self.flags.is_shutdown() {
                    CaptureState::Draining
                } else if self.flags.is_streaming() {
                    tracing::debug!(stage = STAGE, "streaming active");
                    CaptureState::Capturing
                } else {
                    CaptureState::WaitStreamingActive
                }
            }
            CaptureState::Capturing => {
                if self.flags.is_shutdown() {
                    CaptureState::Draining
                } else if !self.flags.is_streaming() {
                    tracing::debug!(stage = STAGE, "streaming paused");
                    CaptureState::WaitStreamingActive
                } else {
                    match self.capture_once() {
                        CaptureOutcome::Forwarded { .. } | CaptureOutcome::Dropped { .. } => {
                            pause(self.timing.capture_yield);
                            CaptureState::Capturing
                        }
                        CaptureOutcome::NoFrame | CaptureOutcome::DeviceError => {
                            pause(self.timing.checkout_retry);
                            CaptureState::Capturing
                        }
                        CaptureOutcome::Closed => CaptureState::Draining,
                    }
                }
            }
            CaptureState::Draining => {
                self.tx.close();
                CaptureState::Terminated
            }
            CaptureState::Terminated => CaptureState::Terminated,
        };
        self.state
    }

    /// Check out one slot and try to forward it.
    pub fn capture_once(&mut self) -> CaptureOutcome {
        let start = Instant::now();
        let (checkout, timestamp, epoch) = {
            let mut device = self.device.lock();
            let checkout = device.checkout_capture_slot();
            (checkout, self.clock.now_micros(), self.counters.epoch())
        };
        let checkout = match checkout {
            Ok(checkout) => checkout,
            Err(DeviceError::NoFrameReady) => {
                tracing::trace!(stage = STAGE, "no frame ready");
                return CaptureOutcome::NoFrame;
            }
            Err(err) => {
                if self.failure_streak == 0 {
                    tracing::warn!(stage = STAGE, code = err.code(), error = %err, "checkout failed");
                } else {
                    tracing::debug!(stage = STAGE, code = err.code(), error = %err, streak = self.failure_streak, "checkout still failing");
                }
                self.failure_streak += 1;
                return CaptureOutcome::DeviceError;
            }
        };
        if self.failure_streak > 0 {
            tracing::info!(stage = STAGE, failures = self.failure_streak, "checkout recovered");
            self.failure_streak = 0;
        }

        let sequence = self.sequence;
        self.sequence += 1;
        let index = checkout.index;
        let frame = FrameSlot::checkout_borrowed(
            self.owner.clone(),
            checkout,
            FrameMeta::captured(timestamp, sequence, epoch),
        );
        self.counters.record_captured(epoch);

        let outcome = match self.tx.try_send(frame) {
            SendOutcome::Accepted => {
                tracing::trace!(stage = STAGE, sequence, index, "frame forwarded");
                self.forwarded += 1;
                CaptureOutcome::Forwarded { sequence }
            }
            SendOutcome::Full(frame) => {
                tracing::warn!(stage = STAGE, sequence, index, "encode queue full, dropping frame");
                frame.discard();
                self.counters.record_dropped(epoch);
                self.dropped += 1;
                CaptureOutcome::Dropped { sequence }
            }
            SendOutcome::Closed(frame) => {
                frame.discard();
                self.counters.record_dropped(epoch);
                self.dropped += 1;
                CaptureOutcome::Closed
            }
        };
        self.metrics.record(start.elapsed());
        outcome
    }
}

impl Stage for CaptureStage {
    fn name(&self) -> &'static str {
        STAGE
    }

    fn init(&mut self) -> Result<(), PipelineError> {
        self.device.lock().configure(self.format)?;
        tracing::info!(stage = STAGE, device = self.device.label(), format = %self.format, "camera configured");
        self.flags.mark_ready(StageId::Capture);
        Ok(())
    }

    fn run(&mut self) {
        while self.step() != CaptureState::Terminated {}
    }

    fn terminate(&mut self) {
        self.flags.clear_ready(StageId::Capture);
        tracing::info!(
            stage = STAGE,
            captured = self.sequence,
            forwarded = self.forwarded,
            dropped = self.dropped,
            "capture stage stopped"
        );
    }
}

fn pause(dur: Duration) {
    if dur.is_zero() {
        thread::yield_now();
    } else {
        thread::sleep(dur);
    }
}
