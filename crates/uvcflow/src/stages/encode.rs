use std::{sync::Arc, time::Instant};

use uvcflow_core::prelude::*;
use uvcflow_device::EncoderHandle;

use crate::{config::StageTiming, error::PipelineError, metrics::StageMetrics, stages::Stage};

const STAGE: &str = "encode";

/// Encode stage states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeState {
    WaitEncodeReady,
    WaitStreamingActive,
    Encoding,
    Terminated,
}

/// What one encode attempt did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeOutcome {
    /// Output forwarded to delivery.
    Forwarded { sequence: u64, len: usize },
    /// Frame discarded; input slot returned.
    Dropped { sequence: u64, reason: &'static str },
    /// Nothing arrived within the poll interval.
    Idle,
    /// Upstream channel closed.
    Closed,
}

/// Moves borrowed capture slots through the encoder into owned output slots.
///
/// Only one exchange is in flight: the encoder lock is held from input submission until the
/// output has been copied out.
pub struct EncodeStage {
    encoder: EncoderHandle,
    rx: BoundedRx<FrameSlot>,
    tx: BoundedTx<FrameSlot>,
    pool: FramePool,
    flags: Arc<ReadinessFlags>,
    counters: Arc<FrameCounters>,
    metrics: StageMetrics,
    timing: StageTiming,
    format: StreamFormat,
    state: EncodeState,
    encoded: u64,
    dropped: u64,
}

impl EncodeStage {
    /// Stage that encodes frames from `rx` into `pool` memory and forwards them on `tx`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        encoder: EncoderHandle,
        rx: BoundedRx<FrameSlot>,
        tx: BoundedTx<FrameSlot>,
        pool: FramePool,
        flags: Arc<ReadinessFlags>,
        counters: Arc<FrameCounters>,
        timing: StageTiming,
        format: StreamFormat,
    ) -> Self {
        Self {
            encoder,
            rx,
            tx,
            pool,
            flags,
            counters,
            metrics: StageMetrics::default(),
            timing,
            format,
            state: EncodeState::WaitEncodeReady,
            encoded: 0,
            dropped: 0,
        }
    }

    /// Record per-frame exchange time into `metrics`.
    pub fn with_metrics(mut self, metrics: StageMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn state(&self) -> EncodeState {
        self.state
    }

    /// Advance the state machine by one step.
    pub fn step(&mut self) -> EncodeState {
        let wake = FlagSet::from(Flag::Shutdown);
        self.state = match self.state {
            EncodeState::WaitEncodeReady => {
                self.flags
                    .wait_any(wake.with(Flag::EncodeReady), self.timing.poll);
                if self.flags.is_shutdown() {
                    EncodeState::Terminated
                } else if self.flags.is_set(Flag::EncodeReady) {
                    EncodeState::WaitStreamingActive
                } else {
                    EncodeState::WaitEncodeReady
                }
            }
            EncodeState::WaitStreamingActive => {
                self.flags
                    .wait_any(wake.with(Flag::StreamingActive), self.timing.idle);
                if self.flags.is_shutdown() {
                    EncodeState::Terminated
                } else if self.flags.is_streaming() {
                    EncodeState::Encoding
                } else {
                    EncodeState::WaitStreamingActive
                }
            }
            EncodeState::Encoding => {
                if self.flags.is_shutdown() {
                    EncodeState::Terminated
                } else if !self.flags.is_streaming() {
                    EncodeState::WaitStreamingActive
                } else {
                    match self.encode_next() {
                        EncodeOutcome::Closed => EncodeState::Terminated,
                        _ => EncodeState::Encoding,
                    }
                }
            }
            EncodeState::Terminated => EncodeState::Terminated,
        };
        self.state
    }

    /// Wait up to one poll interval for a captured frame and encode it.
    pub fn encode_next(&mut self) -> EncodeOutcome {
        match self.rx.recv_timeout(self.timing.poll) {
            RecvOutcome::Data(frame) => self.encode_frame(frame),
            RecvOutcome::Timeout => EncodeOutcome::Idle,
            RecvOutcome::Closed => EncodeOutcome::Closed,
        }
    }

    /// Run one input/output exchange for `frame` and forward the result.
    pub fn encode_frame(&mut self, frame: FrameSlot) -> EncodeOutcome {
        let start = Instant::now();
        let meta = *frame.meta();

        let handle = self.encoder.clone();
        let mut encoder = handle.lock();
        if let Err(err) = encoder.submit_encode_input(frame.data()) {
            tracing::warn!(stage = STAGE, sequence = meta.sequence, code = err.code(), error = %err, "encoder rejected input");
            encoder.finish_exchange();
            return self.drop_input(frame, "input_rejected");
        }
        let output = match encoder.receive_encode_output() {
            Ok(output) => output,
            Err(err) => {
                tracing::warn!(stage = STAGE, sequence = meta.sequence, code = err.code(), error = %err, "encoder output failed");
                encoder.finish_exchange();
                return self.drop_input(frame, "output_failed");
            }
        };
        let out_meta = meta.encoded(encoder.query_output_format());
        let encoded = FrameSlot::alloc_owned(&self.pool, output.len(), out_meta).and_then(|mut slot| {
            slot.write(&output)?;
            Ok(slot)
        });
        encoder.finish_exchange();
        let encoded = match encoded {
            Ok(slot) => slot,
            Err(err) => {
                tracing::warn!(stage = STAGE, sequence = meta.sequence, code = err.code(), error = %err, "output allocation failed");
                return self.drop_input(frame, "allocation_failed");
            }
        };
        drop(encoder);

        match frame.return_borrowed() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::error!(stage = STAGE, sequence = meta.sequence, code = err.code(), error = %err, "input slot return failed");
            }
            Err(owned) => {
                owned.discard();
            }
        }
        self.counters.record_encoded(meta.epoch);
        self.encoded += 1;
        self.metrics.record(start.elapsed());

        let len = encoded.len();
        match self.tx.try_send(encoded) {
            SendOutcome::Accepted => {
                tracing::trace!(stage = STAGE, sequence = meta.sequence, len, "frame encoded");
                EncodeOutcome::Forwarded {
                    sequence: meta.sequence,
                    len,
                }
            }
            SendOutcome::Full(encoded) | SendOutcome::Closed(encoded) => {
                tracing::warn!(stage = STAGE, sequence = meta.sequence, "delivery queue full, dropping frame");
                encoded.discard();
                self.counters.record_dropped(meta.epoch);
                self.dropped += 1;
                EncodeOutcome::Dropped {
                    sequence: meta.sequence,
                    reason: "delivery_full",
                }
            }
        }
    }

    fn drop_input(&mut self, frame: FrameSlot, reason: &'static str) -> EncodeOutcome {
        let meta = *frame.meta();
        frame.discard();
        self.counters.record_dropped(meta.epoch);
        self.dropped += 1;
        EncodeOutcome::Dropped {
            sequence: meta.sequence,
            reason,
        }
    }
}

impl Stage for EncodeStage {
    fn name(&self) -> &'static str {
        STAGE
    }

    fn init(&mut self) -> Result<(), PipelineError> {
        self.encoder.lock().configure(self.format)?;
        tracing::info!(stage = STAGE, format = %self.format, "encoder configured");
        self.flags.mark_ready(StageId::Encode);
        Ok(())
    }

    fn run(&mut self) {
        while self.step() != EncodeState::Terminated {}
    }

    fn terminate(&mut self) {
        self.flags.clear_ready(StageId::Encode);
        tracing::info!(
            stage = STAGE,
            encoded = self.encoded,
            dropped = self.dropped,
            "encode stage stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uvcflow_device::prelude::*;

    struct Rig {
        stage: EncodeStage,
        camera: CaptureHandle,
        ledger: Arc<SlotLedger>,
        out: BoundedRx<FrameSlot>,
        counters: Arc<FrameCounters>,
    }

    fn rig(faults: EncoderFaults, budget: usize, out_depth: usize) -> Rig {
        let camera = VirtualCamera::new(VirtualCameraConfig::default());
        let ledger = camera.ledger();
        let camera = CaptureHandle::new(camera);
        camera.lock().configure(StreamFormat::default()).unwrap();
        let (_in_tx, in_rx) = bounded(3);
        let (out_tx, out) = bounded(out_depth);
        let counters = Arc::new(FrameCounters::new());
        let stage = EncodeStage::new(
            EncoderHandle::new(VirtualEncoder::with_faults(FourCc::MJPG, faults)),
            in_rx,
            out_tx,
            FramePool::with_budget(budget, 2),
            Arc::new(ReadinessFlags::new()),
            counters.clone(),
            StageTiming::default(),
            StreamFormat::default(),
        );
        Rig {
            stage,
            camera,
            ledger,
            out,
            counters,
        }
    }

    fn captured(rig: &Rig, sequence: u64) -> FrameSlot {
        let checkout = rig.camera.lock().checkout_capture_slot().unwrap();
        FrameSlot::checkout_borrowed(
            rig.camera.slot_owner(),
            checkout,
            FrameMeta::captured(1_000 + sequence, sequence, 0),
        )
    }

    #[test]
    fn encoded_frame_keeps_identity_and_returns_input() {
        let mut rig = rig(EncoderFaults::default(), 1 << 20, 3);
        let frame = captured(&rig, 4);
        assert!(matches!(
            rig.stage.encode_frame(frame),
            EncodeOutcome::Forwarded { sequence: 4, .. }
        ));
        assert_eq!(rig.ledger.outstanding(), 0);
        let RecvOutcome::Data(out) = rig.out.try_recv() else {
            panic!("expected encoded frame");
        };
        assert!(!out.is_borrowed());
        assert_eq!(out.meta().timestamp, 1_004);
        assert_eq!(out.meta().codec_tag, Some(FourCc::MJPG));
        assert_eq!(frame_id(out.data()), Some(0));
        assert_eq!(rig.counters.snapshot().encoded, 1);
    }

    #[test]
    fn rejected_input_returns_slot_and_counts_drop() {
        let mut rig = rig(
            EncoderFaults {
                reject_input_every: Some(1),
                ..EncoderFaults::default()
            },
            1 << 20,
            3,
        );
        let frame = captured(&rig, 0);
        assert_eq!(
            rig.stage.encode_frame(frame),
            EncodeOutcome::Dropped {
                sequence: 0,
                reason: "input_rejected"
            }
        );
        assert_eq!(rig.ledger.outstanding(), 0);
        assert_eq!(rig.counters.snapshot().dropped, 1);
    }

    #[test]
    fn failed_output_aborts_exchange() {
        let mut rig = rig(
            EncoderFaults {
                fail_output_every: Some(2),
                ..EncoderFaults::default()
            },
            1 << 20,
            3,
        );
        let first = captured(&rig, 0);
        let second = captured(&rig, 1);
        let third = captured(&rig, 2);
        assert!(matches!(rig.stage.encode_frame(first), EncodeOutcome::Forwarded { .. }));
        assert!(matches!(
            rig.stage.encode_frame(second),
            EncodeOutcome::Dropped { reason: "output_failed", .. }
        ));
        assert!(matches!(rig.stage.encode_frame(third), EncodeOutcome::Forwarded { .. }));
        assert_eq!(rig.ledger.outstanding(), 0);
    }

    #[test]
    fn exhausted_pool_drops_frame() {
        let mut rig = rig(EncoderFaults::default(), 16, 3);
        let frame = captured(&rig, 0);
        assert!(matches!(
            rig.stage.encode_frame(frame),
            EncodeOutcome::Dropped { reason: "allocation_failed", .. }
        ));
        assert_eq!(rig.ledger.outstanding(), 0);
        let snap = rig.counters.snapshot();
        assert_eq!((snap.encoded, snap.dropped), (0, 1));
    }

    #[test]
    fn full_delivery_queue_releases_output() {
        let mut rig = rig(EncoderFaults::default(), 1 << 20, 1);
        let a = captured(&rig, 0);
        let b = captured(&rig, 1);
        assert!(matches!(rig.stage.encode_frame(a), EncodeOutcome::Forwarded { .. }));
        assert!(matches!(
            rig.stage.encode_frame(b),
            EncodeOutcome::Dropped { reason: "delivery_full", .. }
        ));
        let snap = rig.counters.snapshot();
        assert_eq!((snap.encoded, snap.dropped), (2, 1));
        assert_eq!(rig.ledger.outstanding(), 0);
    }
}
