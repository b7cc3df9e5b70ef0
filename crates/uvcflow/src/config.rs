use std::{path::Path, time::Duration};

use uvcflow_core::prelude::StreamFormat;

use crate::logging::{LogFormat, LogLevel};

/// Default capture→encode channel depth (frames).
pub const DEFAULT_CAPTURE_QUEUE_DEPTH: usize = 3;
/// Default encode→delivery channel depth (frames).
pub const DEFAULT_DELIVERY_QUEUE_DEPTH: usize = 3;
/// Default control-event channel depth.
pub const DEFAULT_CONTROL_QUEUE_DEPTH: usize = 10;
/// Default shutdown poll interval (milliseconds).
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
/// Default idle wait while streaming is inactive (milliseconds).
pub const DEFAULT_IDLE_INTERVAL_MS: u64 = 100;
/// Default wait after `NoFrameReady` (milliseconds).
pub const DEFAULT_CHECKOUT_RETRY_MS: u64 = 10;
/// Default yield after each captured frame (milliseconds).
pub const DEFAULT_CAPTURE_YIELD_MS: u64 = 1;
/// Default monitor report interval (milliseconds).
pub const DEFAULT_MONITOR_INTERVAL_MS: u64 = 5_000;
/// Default encoded-frame memory budget (bytes).
pub const DEFAULT_FRAME_BUDGET_BYTES: usize = 8 << 20;
/// Default number of recycled encoded-frame buffers kept.
pub const DEFAULT_POOL_MAX_FREE: usize = 4;
/// Default number of retained error reports.
pub const DEFAULT_ERROR_HISTORY: usize = 16;

/// Errors raised while loading a configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    /// Stable string code for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            ConfigError::Io { .. } => "config_io",
            ConfigError::Parse(_) => "config_parse",
        }
    }
}

/// Pipeline tunables.
///
/// Missing JSON fields fall back to their defaults.
///
/// # Example
/// ```rust
/// use uvcflow::prelude::*;
///
/// let cfg = PipelineConfig::from_json_str(r#"{ "poll_interval_ms": 20 }"#).unwrap();
/// assert_eq!(cfg.poll_interval_ms, 20);
/// assert_eq!(cfg.capture_queue_depth, 3);
///
/// let cfg = PipelineConfig::new().capture_queue_depth(0).sanitized();
/// assert_eq!(cfg.capture_queue_depth, 1);
/// ```
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub capture_queue_depth: usize,
    pub delivery_queue_depth: usize,
    pub control_queue_depth: usize,
    pub poll_interval_ms: u64,
    pub idle_interval_ms: u64,
    pub checkout_retry_ms: u64,
    pub capture_yield_ms: u64,
    pub monitor_interval_ms: u64,
    pub frame_budget_bytes: usize,
    pub pool_max_free: usize,
    pub stream: StreamFormat,
    pub error_history: usize,
    pub log_format: LogFormat,
    pub log_level: LogLevel,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            capture_queue_depth: DEFAULT_CAPTURE_QUEUE_DEPTH,
            delivery_queue_depth: DEFAULT_DELIVERY_QUEUE_DEPTH,
            control_queue_depth: DEFAULT_CONTROL_QUEUE_DEPTH,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            idle_interval_ms: DEFAULT_IDLE_INTERVAL_MS,
            checkout_retry_ms: DEFAULT_CHECKOUT_RETRY_MS,
            capture_yield_ms: DEFAULT_CAPTURE_YIELD_MS,
            monitor_interval_ms: DEFAULT_MONITOR_INTERVAL_MS,
            frame_budget_bytes: DEFAULT_FRAME_BUDGET_BYTES,
            pool_max_free: DEFAULT_POOL_MAX_FREE,
            stream: StreamFormat::default(),
            error_history: DEFAULT_ERROR_HISTORY,
            log_format: LogFormat::default(),
            log_level: LogLevel::default(),
        }
    }
}

impl PipelineConfig {
    /// Defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse JSON.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(json)?;
        Ok(cfg.sanitized())
    }

    /// Read and parse a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    /// Clamp depths and intervals to usable minimums.
    pub fn sanitized(self) -> Self {
        Self {
            capture_queue_depth: self.capture_queue_depth.max(1),
            delivery_queue_depth: self.delivery_queue_depth.max(1),
            control_queue_depth: self.control_queue_depth.max(1),
            poll_interval_ms: self.poll_interval_ms.max(1),
            idle_interval_ms: self.idle_interval_ms.max(1),
            checkout_retry_ms: self.checkout_retry_ms.max(1),
            capture_yield_ms: self.capture_yield_ms,
            monitor_interval_ms: self.monitor_interval_ms.max(1),
            frame_budget_bytes: self.frame_budget_bytes.max(1),
            pool_max_free: self.pool_max_free,
            stream: self.stream,
            error_history: self.error_history.max(1),
            log_format: self.log_format,
            log_level: self.log_level,
        }
    }

    /// Override both frame channel depths.
    pub fn queue_depths(mut self, capture: usize, delivery: usize) -> Self {
        self.capture_queue_depth = capture;
        self.delivery_queue_depth = delivery;
        self
    }

    /// Override the capture→encode depth.
    pub fn capture_queue_depth(mut self, depth: usize) -> Self {
        self.capture_queue_depth = depth;
        self
    }

    /// Override the control-event depth.
    pub fn control_queue_depth(mut self, depth: usize) -> Self {
        self.control_queue_depth = depth;
        self
    }

    /// Override the shutdown poll interval.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Override the idle wait while streaming is inactive.
    pub fn idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Override capture retry and yield timings.
    pub fn capture_timing(mut self, retry: Duration, yield_after: Duration) -> Self {
        self.checkout_retry_ms = retry.as_millis() as u64;
        self.capture_yield_ms = yield_after.as_millis() as u64;
        self
    }

    /// Override the monitor report interval.
    pub fn monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Override encoded-frame pool sizing.
    pub fn frame_pool(mut self, budget_bytes: usize, max_free: usize) -> Self {
        self.frame_budget_bytes = budget_bytes;
        self.pool_max_free = max_free;
        self
    }

    /// Override the stream format negotiated at stage start.
    pub fn stream(mut self, format: StreamFormat) -> Self {
        self.stream = format;
        self
    }

    /// Override how many error reports are kept.
    pub fn error_history(mut self, len: usize) -> Self {
        self.error_history = len;
        self
    }

    pub(crate) fn stage_timing(&self) -> StageTiming {
        StageTiming {
            poll: Duration::from_millis(self.poll_interval_ms),
            idle: Duration::from_millis(self.idle_interval_ms),
            checkout_retry: Duration::from_millis(self.checkout_retry_ms),
            capture_yield: Duration::from_millis(self.capture_yield_ms),
        }
    }

    pub(crate) fn monitor_period(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }
}

/// Wait and sleep durations handed to each stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StageTiming {
    /// Bounded wait used to re-check `Shutdown`.
    pub poll: Duration,
    /// Wait while streaming is inactive.
    pub idle: Duration,
    /// Wait after `NoFrameReady`.
    pub checkout_retry: Duration,
    /// Pause after each captured frame.
    pub capture_yield: Duration,
}

impl Default for StageTiming {
    fn default() -> Self {
        PipelineConfig::default().stage_timing()
    }
}
