use std::sync::Arc;

use uvcflow_core::prelude::*;
use uvcflow_device::DeviceDescriptor;

use crate::{
    config::StageTiming,
    control::{ControlEvent, ErrorHistory, ErrorRecord},
    error::PipelineError,
    stages::Stage,
};

const STAGE: &str = "supervisor";

/// Result of handling one control event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    Started,
    Stopped,
    CountersReset { epoch: u64 },
    /// Requested format is not advertised; nothing changed.
    Rejected(StreamFormat),
    /// Acknowledged; runtime reconfiguration is not implemented.
    Unimplemented(&'static str),
    ErrorRecorded,
    Ignored(u32),
}

/// Consumes control events and owns the `StreamingActive` flag.
pub struct SupervisorStage {
    rx: BoundedRx<ControlEvent>,
    switch: StreamingSwitch,
    counters: Arc<FrameCounters>,
    flags: Arc<ReadinessFlags>,
    descriptor: Arc<DeviceDescriptor>,
    active_format: StreamFormat,
    errors: ErrorHistory,
    clock: MonotonicClock,
    timing: StageTiming,
    handled: u64,
}

impl SupervisorStage {
    /// Stage that applies control events from `rx`. Owns the only `StreamingSwitch`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rx: BoundedRx<ControlEvent>,
        switch: StreamingSwitch,
        flags: Arc<ReadinessFlags>,
        counters: Arc<FrameCounters>,
        descriptor: Arc<DeviceDescriptor>,
        active_format: StreamFormat,
        errors: ErrorHistory,
        timing: StageTiming,
    ) -> Self {
        Self {
            rx,
            switch,
            counters,
            flags,
            descriptor,
            active_format,
            errors,
            clock: MonotonicClock::new(),
            timing,
            handled: 0,
        }
    }

    /// Stamp error records with `clock`, normally the one capture stamps frames with.
    pub fn with_clock(mut self, clock: MonotonicClock) -> Self {
        self.clock = clock;
        self
    }

    /// Apply one event.
    pub fn handle(&mut self, event: ControlEvent) -> EventOutcome {
        self.handled += 1;
        match event {
            ControlEvent::StartStream(requested) => {
                if let Some(format) = requested {
                    if !self.descriptor.supports(&format) {
                        tracing::warn!(stage = STAGE, %format, "start rejected: format not advertised");
                        return EventOutcome::Rejected(format);
                    }
                    if format != self.active_format {
                        tracing::warn!(
                            stage = STAGE,
                            requested = %format,
                            active = %self.active_format,
                            "runtime format change not implemented, streaming active format"
                        );
                    }
                }
                self.counters.set_counting(true);
                self.switch.activate();
                tracing::info!(stage = STAGE, format = %self.active_format, "streaming started");
                EventOutcome::Started
            }
            ControlEvent::StopStream => {
                self.counters.set_counting(false);
                self.switch.deactivate();
                tracing::info!(stage = STAGE, "streaming stopped");
                EventOutcome::Stopped
            }
            ControlEvent::ResetCounters => {
                let epoch = self.counters.reset();
                tracing::info!(stage = STAGE, epoch, "counters reset");
                EventOutcome::CountersReset { epoch }
            }
            ControlEvent::ChangeFormat(code) => {
                tracing::warn!(stage = STAGE, ?code, "format change not implemented");
                EventOutcome::Unimplemented("change_format")
            }
            ControlEvent::ChangeResolution(resolution) => {
                tracing::warn!(stage = STAGE, ?resolution, "resolution change not implemented");
                EventOutcome::Unimplemented("change_resolution")
            }
            ControlEvent::ErrorReport(message) => {
                tracing::error!(stage = STAGE, %message, "error reported");
                self.errors.push(ErrorRecord {
                    timestamp: self.clock.now_micros(),
                    message,
                });
                EventOutcome::ErrorRecorded
            }
            ControlEvent::Unknown(code) => {
                tracing::warn!(stage = STAGE, code, "unknown control event discarded");
                EventOutcome::Ignored(code)
            }
        }
    }
}

impl Stage for SupervisorStage {
    fn name(&self) -> &'static str {
        STAGE
    }

    fn init(&mut self) -> Result<(), PipelineError> {
        Ok(())
    }

    fn run(&mut self) {
        while !self.flags.is_shutdown() {
            match self.rx.recv_timeout(self.timing.poll) {
                RecvOutcome::Data(event) => {
                    self.handle(event);
                }
                RecvOutcome::Timeout => {}
                RecvOutcome::Closed => break,
            }
        }
    }

    fn terminate(&mut self) {
        tracing::info!(stage = STAGE, handled = self.handled, "supervisor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor() -> (SupervisorStage, Arc<ReadinessFlags>, Arc<FrameCounters>, ErrorHistory) {
        let flags = Arc::new(ReadinessFlags::new());
        let counters = Arc::new(FrameCounters::paused());
        let errors = ErrorHistory::new(4);
        let (_tx, rx) = bounded(10);
        let switch = flags.streaming_switch().unwrap();
        let stage = SupervisorStage::new(
            rx,
            switch,
            flags.clone(),
            counters.clone(),
            Arc::new(DeviceDescriptor::new("cam", [StreamFormat::default()], 4)),
            StreamFormat::default(),
            errors.clone(),
            StageTiming::default(),
        );
        (stage, flags, counters, errors)
    }

    #[test]
    fn start_and_stop_toggle_streaming_and_counting() {
        let (mut stage, flags, counters, _) = supervisor();
        assert_eq!(stage.handle(ControlEvent::StartStream(None)), EventOutcome::Started);
        assert!(flags.is_streaming());
        assert!(counters.is_counting());
        assert_eq!(stage.handle(ControlEvent::StopStream), EventOutcome::Stopped);
        assert!(!flags.is_streaming());
        assert!(!counters.is_counting());
    }

    #[test]
    fn unadvertised_start_changes_nothing() {
        let (mut stage, flags, counters, _) = supervisor();
        let vga = StreamFormat::new(FourCc::YUYV, Resolution::new(640, 480).unwrap());
        assert_eq!(
            stage.handle(ControlEvent::StartStream(Some(vga))),
            EventOutcome::Rejected(vga)
        );
        assert!(!flags.is_streaming());
        assert!(!counters.is_counting());
    }

    #[test]
    fn error_reports_are_recorded_without_flag_change() {
        let (mut stage, flags, _, errors) = supervisor();
        assert_eq!(
            stage.handle(ControlEvent::ErrorReport("encoder stalled".into())),
            EventOutcome::ErrorRecorded
        );
        assert_eq!(errors.recent()[0].message, "encoder stalled");
        assert!(!flags.is_streaming());
    }

    #[test]
    fn error_timestamps_follow_the_shared_clock() {
        let clock = MonotonicClock::new();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let (stage, _, _, errors) = supervisor();
        let mut stage = stage.with_clock(clock);
        stage.handle(ControlEvent::ErrorReport("late".into()));
        assert!(errors.recent()[0].timestamp >= 20_000);
    }

    #[test]
    fn reconfiguration_and_unknown_events_are_acknowledged() {
        let (mut stage, _, _, _) = supervisor();
        assert_eq!(
            stage.handle(ControlEvent::ChangeFormat(Some(FourCc::H264))),
            EventOutcome::Unimplemented("change_format")
        );
        assert_eq!(
            stage.handle(ControlEvent::ChangeResolution(None)),
            EventOutcome::Unimplemented("change_resolution")
        );
        assert_eq!(stage.handle(ControlEvent::Unknown(99)), EventOutcome::Ignored(99));
    }

    #[test]
    fn reset_bumps_epoch() {
        let (mut stage, _, counters, _) = supervisor();
        stage.handle(ControlEvent::StartStream(None));
        let epoch = counters.epoch();
        counters.record_captured(epoch);
        assert_eq!(
            stage.handle(ControlEvent::ResetCounters),
            EventOutcome::CountersReset { epoch: epoch + 1 }
        );
        assert_eq!(counters.snapshot().captured, 0);
    }
}
