use std::{sync::Arc, time::Instant};

use uvcflow_core::prelude::*;
use uvcflow_device::Transport;

use crate::{config::StageTiming, error::PipelineError, metrics::StageMetrics, stages::Stage};

const STAGE: &str = "delivery";

/// Delivery stage states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    WaitStreamingActive,
    Delivering,
    Terminated,
}

/// Hands encoded frames to the transport and releases them.
pub struct DeliveryStage {
    transport: Box<dyn Transport>,
    rx: BoundedRx<FrameSlot>,
    flags: Arc<ReadinessFlags>,
    counters: Arc<FrameCounters>,
    metrics: StageMetrics,
    timing: StageTiming,
    state: DeliveryState,
    delivered: u64,
    failed: u64,
}

impl DeliveryStage {
    /// Stage that hands encoded frames from `rx` to `transport`.
    pub fn new(
        transport: Box<dyn Transport>,
        rx: BoundedRx<FrameSlot>,
        flags: Arc<ReadinessFlags>,
        counters: Arc<FrameCounters>,
        timing: StageTiming,
    ) -> Self {
        Self {
            transport,
            rx,
            flags,
            counters,
            metrics: StageMetrics::default(),
            timing,
            state: DeliveryState::WaitStreamingActive,
            delivered: 0,
            failed: 0,
        }
    }

    /// Record per-frame transport time into `metrics`.
    pub fn with_metrics(mut self, metrics: StageMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Advance the state machine by one step.
    pub fn step(&mut self) -> DeliveryState {
        self.state = match self.state {
            DeliveryState::WaitStreamingActive => {
                self.flags.wait_any(
                    FlagSet::from(Flag::Shutdown).with(Flag::StreamingActive),
                    self.timing.idle,
                );
                if self.flags.is_shutdown() {
                    DeliveryState::Terminated
                } else if self.flags.is_streaming() {
                    DeliveryState::Delivering
                } else {
                    DeliveryState::WaitStreamingActive
                }
            }
            DeliveryState::Delivering => {
                if self.flags.is_shutdown() {
                    DeliveryState::Terminated
                } else if !self.flags.is_streaming() {
                    DeliveryState::WaitStreamingActive
                } else {
                    match self.rx.recv_timeout(self.timing.poll) {
                        RecvOutcome::Data(frame) => {
                            self.deliver(frame);
                            DeliveryState::Delivering
                        }
                        RecvOutcome::Timeout => DeliveryState::Delivering,
                        RecvOutcome::Closed => DeliveryState::Terminated,
                    }
                }
            }
            DeliveryState::Terminated => DeliveryState::Terminated,
        };
        self.state
    }

    /// Hand one frame to the transport. Returns whether the transport accepted it.
    pub fn deliver(&mut self, frame: FrameSlot) -> bool {
        let start = Instant::now();
        let meta = *frame.meta();
        let accepted = match self.transport.on_frame_ready(frame.data(), meta.timestamp) {
            Ok(()) => {
                self.counters.record_delivered(meta.epoch);
                self.delivered += 1;
                tracing::trace!(stage = STAGE, sequence = meta.sequence, len = frame.len(), "frame delivered");
                true
            }
            Err(err) => {
                tracing::warn!(stage = STAGE, sequence = meta.sequence, code = err.code(), error = %err, "transport refused frame");
                self.counters.record_dropped(meta.epoch);
                self.failed += 1;
                false
            }
        };
        if let Err(frame) = frame.release_owned() {
            frame.discard();
        }
        self.metrics.record(start.elapsed());
        accepted
    }
}

impl Stage for DeliveryStage {
    fn name(&self) -> &'static str {
        STAGE
    }

    fn init(&mut self) -> Result<(), PipelineError> {
        self.flags.mark_ready(StageId::Delivery);
        Ok(())
    }

    fn run(&mut self) {
        while self.step() != DeliveryState::Terminated {}
    }

    fn terminate(&mut self) {
        self.flags.clear_ready(StageId::Delivery);
        tracing::info!(
            stage = STAGE,
            delivered = self.delivered,
            failed = self.failed,
            "delivery stage stopped"
        );
    }
}
