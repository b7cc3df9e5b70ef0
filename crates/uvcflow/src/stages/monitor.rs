use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use uvcflow_core::prelude::*;

use crate::{
    control::{DepthProbe, QueueDepths},
    error::PipelineError,
    metrics::{PipelineMetrics, StageTimingReport},
    stages::Stage,
};

const STAGE: &str = "monitor";

/// Periodic pipeline health summary.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct MonitorReport {
    /// `StreamingActive` at sample time.
    pub streaming: bool,
    pub counters: CounterSnapshot,
    /// Items queued per channel.
    pub depths: QueueDepths,
    /// Fixed channel capacities.
    pub capacities: QueueDepths,
    /// Per-stage timing windows.
    pub capture: StageTimingReport,
    pub encode: StageTimingReport,
    pub delivery: StageTimingReport,
    /// Encoded-frame allocator usage.
    pub pool: FramePoolStats,
}

/// Logs a [`MonitorReport`] every interval and keeps the latest one.
pub struct MonitorStage {
    flags: Arc<ReadinessFlags>,
    counters: Arc<FrameCounters>,
    probe: DepthProbe,
    metrics: PipelineMetrics,
    pool: FramePool,
    interval: Duration,
    latest: Arc<Mutex<Option<MonitorReport>>>,
    reports: u64,
}

impl MonitorStage {
    /// Stage that samples pipeline state every `interval`.
    pub fn new(
        flags: Arc<ReadinessFlags>,
        counters: Arc<FrameCounters>,
        probe: DepthProbe,
        metrics: PipelineMetrics,
        pool: FramePool,
        interval: Duration,
    ) -> Self {
        Self {
            flags,
            counters,
            probe,
            metrics,
            pool,
            interval,
            latest: Arc::new(Mutex::new(None)),
            reports: 0,
        }
    }

    /// Shared slot the stage publishes its latest report into.
    pub fn latest(&self) -> Arc<Mutex<Option<MonitorReport>>> {
        self.latest.clone()
    }

    /// Build a report from the current pipeline state.
    pub fn report(&self) -> MonitorReport {
        MonitorReport {
            streaming: self.flags.is_streaming(),
            counters: self.counters.snapshot(),
            depths: self.probe.depths(),
            capacities: self.probe.capacities(),
            capture: self.metrics.capture.timing(),
            encode: self.metrics.encode.timing(),
            delivery: self.metrics.delivery.timing(),
            pool: self.pool.stats(),
        }
    }

    /// Build, log and publish one report.
    pub fn tick(&mut self) -> MonitorReport {
        let report = self.report();
        tracing::info!(
            stage = STAGE,
            streaming = report.streaming,
            captured = report.counters.captured,
            encoded = report.counters.encoded,
            delivered = report.counters.delivered,
            dropped = report.counters.dropped,
            capture_depth = report.depths.capture_to_encode,
            delivery_depth = report.depths.encode_to_delivery,
            control_depth = report.depths.control,
            encode_fps = report.encode.fps.unwrap_or(0.0),
            pool_in_use = report.pool.in_use,
            "pipeline status"
        );
        if !report.counters.is_ordered() {
            tracing::error!(stage = STAGE, counters = ?report.counters, "frame counters out of order");
        }
        *self.latest.lock() = Some(report.clone());
        self.reports += 1;
        report
    }
}

impl Stage for MonitorStage {
    fn name(&self) -> &'static str {
        STAGE
    }

    fn init(&mut self) -> Result<(), PipelineError> {
        Ok(())
    }

    fn run(&mut self) {
        while !self.flags.wait_any(Flag::Shutdown.into(), self.interval) {
            self.tick();
        }
    }

    fn terminate(&mut self) {
        tracing::info!(stage = STAGE, reports = self.reports, "monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ControlEvent;

    #[test]
    fn tick_publishes_current_state() {
        let flags = Arc::new(ReadinessFlags::new());
        let counters = Arc::new(FrameCounters::new());
        let (_cap_tx, cap_rx) = bounded::<FrameSlot>(3);
        let (_del_tx, del_rx) = bounded::<FrameSlot>(3);
        let (ctl_tx, ctl_rx) = bounded::<ControlEvent>(10);
        assert!(ctl_tx.try_send(ControlEvent::StopStream).is_accepted());
        let mut stage = MonitorStage::new(
            flags,
            counters.clone(),
            DepthProbe::new(cap_rx, del_rx, ctl_rx),
            PipelineMetrics::default(),
            FramePool::with_budget(1024, 1),
            Duration::from_millis(5),
        );
        counters.record_captured(counters.epoch());

        let latest = stage.latest();
        assert!(latest.lock().is_none());
        let report = stage.tick();
        assert_eq!(report.counters.captured, 1);
        assert_eq!(report.depths.control, 1);
        assert_eq!(report.capacities.control, 10);
        assert!(!report.streaming);
        assert_eq!(latest.lock().as_ref(), Some(&report));
    }

    #[test]
    fn report_serializes_to_json() {
        let (_a, cap_rx) = bounded::<FrameSlot>(1);
        let (_b, del_rx) = bounded::<FrameSlot>(1);
        let (_c, ctl_rx) = bounded::<ControlEvent>(1);
        let stage = MonitorStage::new(
            Arc::new(ReadinessFlags::new()),
            Arc::new(FrameCounters::new()),
            DepthProbe::new(cap_rx, del_rx, ctl_rx),
            PipelineMetrics::default(),
            FramePool::with_budget(64, 0),
            Duration::from_secs(1),
        );
        let json = serde_json::to_value(stage.report()).unwrap();
        assert_eq!(json["pool"]["budget"], 64);
        assert_eq!(json["counters"]["dropped"], 0);
    }

    #[test]
    fn run_returns_on_shutdown() {
        let flags = Arc::new(ReadinessFlags::new());
        let (_a, cap_rx) = bounded::<FrameSlot>(1);
        let (_b, del_rx) = bounded::<FrameSlot>(1);
        let (_c, ctl_rx) = bounded::<ControlEvent>(1);
        let mut stage = MonitorStage::new(
            flags.clone(),
            Arc::new(FrameCounters::new()),
            DepthProbe::new(cap_rx, del_rx, ctl_rx),
            PipelineMetrics::default(),
            FramePool::with_budget(64, 0),
            Duration::from_secs(60),
        );
        flags.request_shutdown();
        stage.run();
        assert!(stage.latest().lock().is_none());
    }
}
