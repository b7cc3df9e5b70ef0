use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

/// Per-frame durations a stage keeps for its rolling figures, unless resized.
pub const SAMPLE_WINDOW: usize = 120;

/// Per-stage processing times over a sliding window of recent frames.
///
/// Clones share one ledger: the stage records, the monitor reads.
///
/// # Example
/// ```rust
/// use std::time::Duration;
/// use uvcflow::prelude::StageMetrics;
///
/// let encode = StageMetrics::default();
/// let reader = encode.clone();
/// encode.record(Duration::from_millis(4));
/// encode.record(Duration::from_millis(6));
/// assert_eq!(reader.total_samples(), 2);
/// assert_eq!(reader.last_millis(), Some(6.0));
/// ```
#[derive(Clone)]
pub struct StageMetrics {
    ledger: Arc<Mutex<Ledger>>,
}

impl Default for StageMetrics {
    fn default() -> Self {
        Self {
            ledger: Arc::new(Mutex::new(Ledger::new(SAMPLE_WINDOW))),
        }
    }
}

struct Ledger {
    /// (completed at, time taken)
    recent: VecDeque<(Instant, Duration)>,
    capacity: usize,
    /// Sum of `recent` durations.
    window_sum: Duration,
    lifetime: u64,
    newest: Option<Duration>,
}

impl Ledger {
    fn new(capacity: usize) -> Self {
        Self {
            recent: VecDeque::with_capacity(capacity),
            capacity,
            window_sum: Duration::ZERO,
            lifetime: 0,
            newest: None,
        }
    }

    fn evict_excess(&mut self) {
        while self.recent.len() > self.capacity {
            if let Some((_, took)) = self.recent.pop_front() {
                self.window_sum = self.window_sum.saturating_sub(took);
            }
        }
    }
}

fn as_millis_f64(d: Duration) -> f64 {
    d.as_nanos() as f64 / 1_000_000.0
}

impl StageMetrics {
    /// Record how long one frame spent in the stage.
    pub fn record(&self, took: Duration) {
        let mut ledger = self.ledger.lock();
        ledger.lifetime += 1;
        ledger.newest = Some(took);
        ledger.window_sum = ledger.window_sum.saturating_add(took);
        ledger.recent.push_back((Instant::now(), took));
        ledger.evict_excess();
    }

    /// Resize the sliding window; never below one sample.
    pub fn set_window_size(&self, window: usize) {
        let mut ledger = self.ledger.lock();
        ledger.capacity = window.max(1);
        ledger.evict_excess();
    }

    pub fn total_samples(&self) -> u64 {
        self.ledger.lock().lifetime
    }

    /// Mean over the window, in milliseconds.
    pub fn avg_millis(&self) -> Option<f64> {
        let ledger = self.ledger.lock();
        let n = ledger.recent.len();
        (n > 0).then(|| as_millis_f64(ledger.window_sum) / n as f64)
    }

    pub fn last_millis(&self) -> Option<f64> {
        self.ledger.lock().newest.map(as_millis_f64)
    }

    /// Completions per second across the window. Needs two samples with distinct times.
    pub fn fps(&self) -> Option<f64> {
        let ledger = self.ledger.lock();
        let (oldest, _) = ledger.recent.front()?;
        let (latest, _) = ledger.recent.back()?;
        let span = latest.saturating_duration_since(*oldest).as_secs_f64();
        let intervals = ledger.recent.len().saturating_sub(1);
        (intervals > 0 && span > 0.0).then(|| intervals as f64 / span)
    }

    /// Point-in-time summary.
    pub fn timing(&self) -> StageTimingReport {
        StageTimingReport {
            samples: self.total_samples(),
            avg_ms: self.avg_millis(),
            fps: self.fps(),
        }
    }
}

/// Summary of a [`StageMetrics`] window.
#[derive(Clone, Copy, Debug, Default, PartialEq, serde::Serialize)]
pub struct StageTimingReport {
    pub samples: u64,
    pub avg_ms: Option<f64>,
    pub fps: Option<f64>,
}

/// Timing for the three frame stages.
#[derive(Clone, Default)]
pub struct PipelineMetrics {
    pub capture: StageMetrics,
    pub encode: StageMetrics,
    pub delivery: StageMetrics,
}
