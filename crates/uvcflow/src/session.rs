//! Pipeline assembly, startup and teardown.
use std::{
    fmt,
    sync::Arc,
    thread::JoinHandle,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use uvcflow_core::prelude::*;
use uvcflow_device::{CaptureDevice, CaptureHandle, EncoderDevice, EncoderHandle, Transport};

use crate::{
    config::PipelineConfig,
    control::{ControlEvent, ControlSurface, DepthProbe, ErrorHistory},
    error::PipelineError,
    metrics::PipelineMetrics,
    pull::PullDelivery,
    stages::{
        CaptureStage, DeliveryStage, EncodeStage, MonitorReport, MonitorStage, StageStatus,
        StatusCell, SupervisorStage, spawn_stage,
    },
};

/// Collects devices and settings, then starts the stage threads.
///
/// # Example
/// ```rust
/// use uvcflow::prelude::*;
///
/// let pipeline = PipelineBuilder::new(PipelineConfig::default())
///     .capture_device(VirtualCamera::new(VirtualCameraConfig::default()))
///     .encoder_device(VirtualEncoder::new(FourCc::MJPG))
///     .transport(RecordingTransport::new())
///     .start()
///     .unwrap();
/// assert!(pipeline.wait_ready(std::time::Duration::from_secs(1)));
/// let report = pipeline.shutdown();
/// assert_eq!(report.counters.captured, 0);
/// ```
pub struct PipelineBuilder {
    config: PipelineConfig,
    capture: Option<CaptureHandle>,
    encoder: Option<EncoderHandle>,
    transport: Option<Box<dyn Transport>>,
    pull: bool,
}

impl PipelineBuilder {
    /// Start from `config` with no devices attached.
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            capture: None,
            encoder: None,
            transport: None,
            pull: false,
        }
    }

    /// Camera to capture from. Required.
    pub fn capture_device(mut self, device: impl CaptureDevice + 'static) -> Self {
        self.capture = Some(CaptureHandle::new(device));
        self
    }

    /// Encoder for captured frames. Required.
    pub fn encoder_device(mut self, device: impl EncoderDevice + 'static) -> Self {
        self.encoder = Some(EncoderHandle::new(device));
        self
    }

    /// Push encoded frames into `transport` from a delivery stage.
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Box::new(transport));
        self
    }

    /// Skip the delivery stage; the host pulls frames through [`Pipeline::take_pull_delivery`].
    pub fn pull_delivery(mut self) -> Self {
        self.pull = true;
        self
    }

    /// Validate, build the channels and spawn every stage.
    pub fn start(self) -> Result<Pipeline, PipelineError> {
        let config = self.config.sanitized();
        let capture = self
            .capture
            .ok_or(PipelineError::MissingComponent("capture device"))?;
        let encoder = self
            .encoder
            .ok_or(PipelineError::MissingComponent("encoder device"))?;
        let transport = match (self.transport, self.pull) {
            (Some(_), true) => {
                return Err(PipelineError::InvalidConfig(
                    "a transport and pull delivery are mutually exclusive".into(),
                ));
            }
            (None, false) => return Err(PipelineError::MissingComponent("transport")),
            (transport, _) => transport,
        };

        let descriptor = Arc::new(capture.descriptor());
        if !descriptor.supports(&config.stream) {
            return Err(PipelineError::InvalidConfig(format!(
                "{} does not advertise {}",
                descriptor.name, config.stream
            )));
        }

        let timing = config.stage_timing();
        let (capture_tx, capture_rx) = bounded::<FrameSlot>(config.capture_queue_depth);
        let (delivery_tx, delivery_rx) = bounded::<FrameSlot>(config.delivery_queue_depth);
        let (control_tx, control_rx) = bounded::<ControlEvent>(config.control_queue_depth);

        let flags = Arc::new(ReadinessFlags::new());
        let switch = flags
            .streaming_switch()
            .ok_or(PipelineError::MissingComponent("streaming switch"))?;
        let counters = Arc::new(FrameCounters::paused());
        let pool = FramePool::with_budget(config.frame_budget_bytes, config.pool_max_free);
        let metrics = PipelineMetrics::default();
        let clock = MonotonicClock::new();
        let errors = ErrorHistory::new(config.error_history);
        let probe = DepthProbe::new(capture_rx.clone(), delivery_rx.clone(), control_rx.clone());
        let control = ControlSurface::new(
            control_tx,
            descriptor.clone(),
            counters.clone(),
            probe.clone(),
            errors.clone(),
        );

        let monitor = MonitorStage::new(
            flags.clone(),
            counters.clone(),
            probe,
            metrics.clone(),
            pool.clone(),
            config.monitor_period(),
        );

        let mut pipeline = Pipeline {
            flags: flags.clone(),
            counters: counters.clone(),
            control,
            latest: monitor.latest(),
            stages: Vec::with_capacity(5),
            pool: pool.clone(),
            pull: None,
            capture_rx: capture_rx.clone(),
            delivery_rx: delivery_rx.clone(),
            control_rx: control_rx.clone(),
            pull_mode: self.pull,
            started: Instant::now(),
            stopped: false,
        };

        // Any early return below drops `pipeline`, which shuts down what already started.
        pipeline.spawn(
            SupervisorStage::new(
                control_rx,
                switch,
                flags.clone(),
                counters.clone(),
                descriptor,
                config.stream,
                errors,
                timing,
            )
            .with_clock(clock),
        )?;
        match transport {
            Some(transport) => pipeline.spawn(
                DeliveryStage::new(
                    transport,
                    delivery_rx,
                    flags.clone(),
                    counters.clone(),
                    timing,
                )
                .with_metrics(metrics.delivery.clone()),
            )?,
            None => {
                pipeline.pull = Some(PullDelivery::new(delivery_rx, counters.clone(), flags.clone()));
            }
        }
        pipeline.spawn(
            EncodeStage::new(
                encoder,
                capture_rx,
                delivery_tx,
                pool,
                flags.clone(),
                counters.clone(),
                timing,
                config.stream,
            )
            .with_metrics(metrics.encode.clone()),
        )?;
        pipeline.spawn(
            CaptureStage::new(capture, capture_tx, flags, counters, timing, config.stream)
                .with_metrics(metrics.capture.clone())
                .with_clock(clock),
        )?;
        pipeline.spawn(monitor)?;

        tracing::info!(
            stream = %config.stream,
            capture_depth = config.capture_queue_depth,
            delivery_depth = config.delivery_queue_depth,
            pull = pipeline.pull_mode,
            "pipeline started"
        );
        Ok(pipeline)
    }
}

impl fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("config", &self.config)
            .field("capture", &self.capture)
            .field("has_encoder", &self.encoder.is_some())
            .field("has_transport", &self.transport.is_some())
            .field("pull", &self.pull)
            .finish()
    }
}

struct StageHandle {
    name: &'static str,
    status: StatusCell,
    join: Option<JoinHandle<()>>,
}

/// Summary returned by [`Pipeline::shutdown`].
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ShutdownReport {
    /// Counters after teardown accounting.
    pub counters: CounterSnapshot,
    /// Frames still queued at shutdown, released and counted as dropped.
    pub released_during_teardown: usize,
    /// Final status of each stage, in spawn order.
    pub stages: Vec<(&'static str, StageStatus)>,
    /// Time from `Shutdown` to the last stage joining.
    pub elapsed: Duration,
}

/// A running pipeline. Dropping it shuts it down.
pub struct Pipeline {
    flags: Arc<ReadinessFlags>,
    counters: Arc<FrameCounters>,
    control: ControlSurface,
    latest: Arc<Mutex<Option<MonitorReport>>>,
    stages: Vec<StageHandle>,
    pool: FramePool,
    pull: Option<PullDelivery>,
    capture_rx: BoundedRx<FrameSlot>,
    delivery_rx: BoundedRx<FrameSlot>,
    control_rx: BoundedRx<ControlEvent>,
    pull_mode: bool,
    started: Instant,
    stopped: bool,
}

impl Pipeline {
    fn spawn<S>(&mut self, stage: S) -> Result<(), PipelineError>
    where
        S: crate::stages::Stage + 'static,
    {
        let name = stage.name();
        let status = StatusCell::default();
        let join = spawn_stage(stage, status.clone())?;
        self.stages.push(StageHandle {
            name,
            status,
            join: Some(join),
        });
        Ok(())
    }

    /// Host-facing control handle.
    pub fn control(&self) -> ControlSurface {
        self.control.clone()
    }

    /// Current counter values.
    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// Shared readiness and streaming bits.
    pub fn flags(&self) -> &Arc<ReadinessFlags> {
        &self.flags
    }

    /// Allocator backing encoded frames.
    pub fn frame_pool(&self) -> &FramePool {
        &self.pool
    }

    /// Most recent monitor report, if one has been produced.
    pub fn latest_report(&self) -> Option<MonitorReport> {
        self.latest.lock().clone()
    }

    /// Current status of every stage, in spawn order.
    pub fn stage_statuses(&self) -> Vec<(&'static str, StageStatus)> {
        self.stages
            .iter()
            .map(|stage| (stage.name, stage.status.get()))
            .collect()
    }

    /// Status of the stage called `name`.
    pub fn stage_status(&self, name: &str) -> Option<StageStatus> {
        self.stages
            .iter()
            .find(|stage| stage.name == name)
            .map(|stage| stage.status.get())
    }

    /// Wait until every frame stage has raised its readiness bit.
    pub fn wait_ready(&self, timeout: Duration) -> bool {
        let mut mask = FlagSet::from(Flag::CaptureReady).with(Flag::EncodeReady);
        if !self.pull_mode {
            mask = mask.with(Flag::DeliveryReady);
        }
        self.flags.wait_all(mask, timeout)
    }

    /// Take the pull-side consumer. Only available when built with
    /// [`PipelineBuilder::pull_delivery`], and only once.
    pub fn take_pull_delivery(&mut self) -> Result<PullDelivery, PipelineError> {
        if !self.pull_mode {
            return Err(PipelineError::MissingComponent("pull delivery"));
        }
        self.pull.take().ok_or(PipelineError::DeliveryTaken)
    }

    /// Signal shutdown, join every stage and release frames still queued.
    pub fn shutdown(mut self) -> ShutdownReport {
        self.teardown()
    }

    fn teardown(&mut self) -> ShutdownReport {
        self.stopped = true;
        let begin = Instant::now();
        self.flags.request_shutdown();
        for stage in &mut self.stages {
            let Some(join) = stage.join.take() else {
                continue;
            };
            if join.join().is_err() {
                tracing::error!(stage = stage.name, "stage thread panicked");
                stage.status.set(StageStatus::Failed("panicked".into()));
            }
        }
        let elapsed = begin.elapsed();

        self.control_rx.close();
        self.control_rx.drain();
        // Wakes a host blocked in `PullDelivery::request_next_frame`.
        self.capture_rx.close();
        self.delivery_rx.close();
        let mut released = 0;
        for frame in self
            .capture_rx
            .drain()
            .into_iter()
            .chain(self.delivery_rx.drain())
        {
            self.counters.record_dropped(frame.meta().epoch);
            frame.discard();
            released += 1;
        }
        if released > 0 {
            tracing::debug!(released, "released queued frames during teardown");
        }

        let report = ShutdownReport {
            counters: self.counters.snapshot(),
            released_during_teardown: released,
            stages: self.stage_statuses(),
            elapsed,
        };
        tracing::info!(
            captured = report.counters.captured,
            encoded = report.counters.encoded,
            delivered = report.counters.delivered,
            dropped = report.counters.dropped,
            released,
            uptime_ms = self.started.elapsed().as_millis() as u64,
            "pipeline stopped"
        );
        report
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if !self.stopped {
            self.teardown();
        }
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("flags", &self.flags)
            .field("counters", &self.counters.snapshot())
            .field("stages", &self.stage_statuses())
            .finish()
    }
}
