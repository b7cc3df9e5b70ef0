use std::sync::atomic::{AtomicU64, Ordering};

/// Allocation outcomes recorded by a [`FramePool`](crate::slot::FramePool).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolEvent {
    /// Served from the free list.
    Hit,
    /// Free list could not serve the request.
    Miss,
    /// Fresh buffer allocated.
    Allocated,
    /// Request refused: over budget or out of memory.
    Exhausted,
}

/// Relaxed event tallies for a frame pool.
///
/// # Example
/// ```rust
/// use uvcflow_core::metrics::{PoolEvent, PoolMetrics};
///
/// let metrics = PoolMetrics::default();
/// metrics.record(PoolEvent::Hit);
/// metrics.record(PoolEvent::Exhausted);
/// assert_eq!(metrics.count(PoolEvent::Hit), 1);
/// assert_eq!(metrics.count(PoolEvent::Miss), 0);
/// ```
#[derive(Debug, Default)]
pub struct PoolMetrics {
    tallies: [AtomicU64; 4],
}

impl PoolMetrics {
    pub fn record(&self, event: PoolEvent) {
        self.tallies[event as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self, event: PoolEvent) -> u64 {
        self.tallies[event as usize].load(Ordering::Relaxed)
    }
}
