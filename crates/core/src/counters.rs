use parking_lot::RwLock;

/// Consistent view of the pipeline frame counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CounterSnapshot {
    /// Frames checked out of the capture device.
    pub captured: u64,
    /// Frames that produced encoder output.
    pub encoded: u64,
    /// Frames handed to the transport.
    pub delivered: u64,
    /// Frames discarded anywhere in the pipeline.
    pub dropped: u64,
    /// Generation of these counters; bumped by every reset and every pause or resume.
    pub epoch: u64,
}

impl CounterSnapshot {
    /// Whether `captured >= encoded >= delivered` holds.
    pub fn is_ordered(&self) -> bool {
        self.captured >= self.encoded && self.encoded >= self.delivered
    }
}

/// Pipeline frame counters.
///
/// Every update takes the epoch the frame was captured under; updates from an older epoch are
/// ignored so a reset can never leave `encoded` above `captured`. While counting is paused only
/// `dropped` moves; pausing and resuming start a new epoch so a frame is only counted downstream
/// if it was counted at capture.
///
/// # Example
/// ```rust
/// use uvcflow_core::prelude::FrameCounters;
///
/// let counters = FrameCounters::new();
/// let epoch = counters.epoch();
/// counters.record_captured(epoch);
/// counters.reset();
/// counters.record_encoded(epoch);
/// let snap = counters.snapshot();
/// assert_eq!((snap.captured, snap.encoded), (0, 0));
/// ```
#[derive(Debug)]
pub struct FrameCounters {
    inner: RwLock<CounterState>,
}

#[derive(Debug, Default)]
struct CounterState {
    snapshot: CounterSnapshot,
    paused: bool,
}

impl FrameCounters {
    /// All counters zero at epoch 0, counting enabled.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(CounterState::default()),
        }
    }

    /// Counters that start paused.
    pub fn paused() -> Self {
        let counters = Self::new();
        counters.set_counting(false);
        counters
    }

    /// Current epoch, stamped on frames at capture.
    pub fn epoch(&self) -> u64 {
        self.inner.read().snapshot.epoch
    }

    /// Enable or pause captured/encoded/delivered accounting.
    pub fn set_counting(&self, enabled: bool) {
        let mut guard = self.inner.write();
        if guard.paused == enabled {
            guard.paused = !enabled;
            guard.snapshot.epoch = guard.snapshot.epoch.wrapping_add(1);
        }
    }

    /// Whether captured/encoded/delivered updates are applied.
    pub fn is_counting(&self) -> bool {
        !self.inner.read().paused
    }

    /// Count a captured frame.
    pub fn record_captured(&self, epoch: u64) -> bool {
        self.bump(epoch, true, |c| c.captured += 1)
    }

    /// Count an encoded frame.
    pub fn record_encoded(&self, epoch: u64) -> bool {
        self.bump(epoch, true, |c| c.encoded += 1)
    }

    /// Count a delivered frame.
    pub fn record_delivered(&self, epoch: u64) -> bool {
        self.bump(epoch, true, |c| c.delivered += 1)
    }

    /// Count a dropped frame.
    pub fn record_dropped(&self, epoch: u64) -> bool {
        self.bump(epoch, false, |c| c.dropped += 1)
    }

    /// Zero all four counters in one step and start a new epoch.
    pub fn reset(&self) -> u64 {
        let mut guard = self.inner.write();
        let epoch = guard.snapshot.epoch.wrapping_add(1);
        guard.snapshot = CounterSnapshot {
            epoch,
            ..CounterSnapshot::default()
        };
        epoch
    }

    /// Consistent copy of all counters.
    pub fn snapshot(&self) -> CounterSnapshot {
        self.inner.read().snapshot
    }

    fn bump(&self, epoch: u64, gated: bool, apply: impl FnOnce(&mut CounterSnapshot)) -> bool {
        let mut guard = self.inner.write();
        if guard.snapshot.epoch != epoch || (gated && guard.paused) {
            return false;
        }
        apply(&mut guard.snapshot);
        true
    }
}

impl Default for FrameCounters {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    #[test]
    fn reset_zeroes_everything_and_bumps_epoch() {
        let counters = FrameCounters::new();
        for _ in 0..3 {
            counters.record_captured(0);
            counters.record_encoded(0);
        }
        counters.record_dropped(0);
        assert_eq!(counters.reset(), 1);
        let snap = counters.snapshot();
        assert_eq!(
            snap,
            CounterSnapshot {
                epoch: 1,
                ..CounterSnapshot::default()
            }
        );
    }

    #[test]
    fn stale_epoch_updates_are_ignored() {
        let counters = FrameCounters::new();
        assert!(counters.record_captured(0));
        counters.reset();
        assert!(!counters.record_encoded(0));
        assert!(!counters.record_delivered(0));
        assert!(counters.snapshot().is_ordered());
    }

    #[test]
    fn paused_counters_only_count_drops() {
        let counters = FrameCounters::paused();
        let paused_epoch = counters.epoch();
        assert!(!counters.record_captured(paused_epoch));
        assert!(counters.record_dropped(paused_epoch));
        counters.set_counting(true);
        assert!(!counters.record_encoded(paused_epoch));
        assert!(counters.record_captured(counters.epoch()));
        let snap = counters.snapshot();
        assert_eq!((snap.captured, snap.encoded, snap.dropped), (1, 0, 1));
    }

    #[test]
    fn snapshots_stay_ordered_under_concurrent_reset() {
        let counters = Arc::new(FrameCounters::new());
        let writer = {
            let counters = counters.clone();
            thread::spawn(move || {
                for _ in 0..2_000 {
                    let epoch = counters.epoch();
                    counters.record_captured(epoch);
                    counters.record_encoded(epoch);
                    counters.record_delivered(epoch);
                }
            })
        };
        for _ in 0..50 {
            counters.reset();
            assert!(counters.snapshot().is_ordered());
        }
        writer.join().unwrap();
        assert!(counters.snapshot().is_ordered());
    }
}
