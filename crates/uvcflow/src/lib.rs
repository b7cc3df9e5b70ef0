#![doc = include_str!("../README.md")]

pub use uvcflow_core as core;
pub use uvcflow_device as device;

pub use thiserror;

pub mod config;
pub mod control;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod pull;
pub mod session;
pub mod stages;

pub mod prelude {
    pub use crate::config::{ConfigError, PipelineConfig, StageTiming};
    pub use crate::control::{
        ControlEvent, ControlSurface, ErrorHistory, ErrorRecord, QueueDepths,
    };
    pub use crate::error::{ControlError, PipelineError};
    pub use crate::logging::{LogFormat, LogLevel, init_logging, init_logging_from_env};
    pub use crate::metrics::{PipelineMetrics, StageMetrics, StageTimingReport};
    pub use crate::pull::{FrameHandle, PullDelivery};
    pub use crate::session::{Pipeline, PipelineBuilder, ShutdownReport};
    pub use crate::stages::{EventOutcome, MonitorReport, StageStatus};
    pub use uvcflow_device::prelude::*;
}
