use parking_lot::{Condvar, Mutex};
use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

/// Pipeline stage that owns a readiness bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageId {
    /// Sensor capture.
    Capture,
    /// Hardware encode.
    Encode,
    /// Transport delivery.
    Delivery,
}

impl StageId {
    /// Readiness flag owned by this stage.
    pub fn ready_flag(self) -> Flag {
        match self {
            StageId::Capture => Flag::CaptureReady,
            StageId::Encode => Flag::EncodeReady,
            StageId::Delivery => Flag::DeliveryReady,
        }
    }

    /// Lowercase name used in logs and thread names.
    pub fn as_str(self) -> &'static str {
        match self {
            StageId::Capture => "capture",
            StageId::Encode => "encode",
            StageId::Delivery => "delivery",
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single bit in [`ReadinessFlags`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flag {
    /// Capture device configured.
    CaptureReady,
    /// Encoder configured.
    EncodeReady,
    /// Transport attached.
    DeliveryReady,
    /// Frames should flow.
    StreamingActive,
    /// Stop everything. Never cleared.
    Shutdown,
}

impl Flag {
    const fn bit(self) -> u8 {
        match self {
            Flag::CaptureReady => 1 << 0,
            Flag::EncodeReady => 1 << 1,
            Flag::DeliveryReady => 1 << 2,
            Flag::StreamingActive => 1 << 3,
            Flag::Shutdown => 1 << 4,
        }
    }
}

/// Set of [`Flag`]s used as a wait mask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlagSet(u8);

impl FlagSet {
    /// Empty set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Add a flag.
    pub const fn with(self, flag: Flag) -> Self {
        Self(self.0 | flag.bit())
    }

    /// Whether `flag` is in the set.
    pub const fn contains(self, flag: Flag) -> bool {
        self.0 & flag.bit() != 0
    }

    fn intersects(self, bits: u8) -> bool {
        self.0 & bits != 0
    }

    fn subset_of(self, bits: u8) -> bool {
        self.0 & bits == self.0
    }
}

impl From<Flag> for FlagSet {
    fn from(flag: Flag) -> Self {
        FlagSet::empty().with(flag)
    }
}

/// Shared readiness/shutdown bit-set with wait-for-any/all.
///
/// Stage bits are set and cleared by their stage; `StreamingActive` can only be changed through
/// the single [`StreamingSwitch`]; `Shutdown` is set-only.
///
/// # Example
/// ```rust
/// use std::time::Duration;
/// use uvcflow_core::prelude::{Flag, ReadinessFlags, StageId};
///
/// let flags = ReadinessFlags::new();
/// flags.mark_ready(StageId::Capture);
/// assert!(flags.wait_any(Flag::CaptureReady.into(), Duration::from_millis(1)));
/// flags.request_shutdown();
/// assert!(flags.is_shutdown());
/// ```
pub struct ReadinessFlags {
    bits: Mutex<u8>,
    changed: Condvar,
    switch_issued: AtomicBool,
}

impl ReadinessFlags {
    /// All bits clear.
    pub fn new() -> Self {
        Self {
            bits: Mutex::new(0),
            changed: Condvar::new(),
            switch_issued: AtomicBool::new(false),
        }
    }

    /// Set the readiness bit for `stage`.
    pub fn mark_ready(&self, stage: StageId) {
        self.set(stage.ready_flag());
    }

    /// Clear the readiness bit for `stage`.
    pub fn clear_ready(&self, stage: StageId) {
        self.clear(stage.ready_flag());
    }

    /// Set `Shutdown`. Idempotent and irreversible.
    pub fn request_shutdown(&self) {
        self.set(Flag::Shutdown);
    }

    /// Whether `Shutdown` has been requested.
    pub fn is_shutdown(&self) -> bool {
        self.is_set(Flag::Shutdown)
    }

    /// Whether `StreamingActive` is set.
    pub fn is_streaming(&self) -> bool {
        self.is_set(Flag::StreamingActive)
    }

    /// Read a single flag.
    pub fn is_set(&self, flag: Flag) -> bool {
        *self.bits.lock() & flag.bit() != 0
    }

    /// Issue the capability that toggles `StreamingActive`. Only the first call succeeds.
    pub fn streaming_switch(self: &Arc<Self>) -> Option<StreamingSwitch> {
        self.switch_issued
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| StreamingSwitch {
                flags: self.clone(),
            })
    }

    /// Wait until any flag in `mask` is set, up to `timeout`. Returns whether one is.
    pub fn wait_any(&self, mask: FlagSet, timeout: Duration) -> bool {
        self.wait_for(timeout, |bits| mask.intersects(bits))
    }

    /// Wait until every flag in `mask` is set, up to `timeout`. Returns whether they are.
    pub fn wait_all(&self, mask: FlagSet, timeout: Duration) -> bool {
        self.wait_for(timeout, |bits| mask.subset_of(bits))
    }

    fn wait_for(&self, timeout: Duration, done: impl Fn(u8) -> bool) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut bits = self.bits.lock();
        while !done(*bits) {
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut bits, deadline).timed_out() {
                        return done(*bits);
                    }
                }
                None => self.changed.wait(&mut bits),
            }
        }
        true
    }

    fn set(&self, flag: Flag) {
        let mut bits = self.bits.lock();
        *bits |= flag.bit();
        self.changed.notify_all();
    }

    fn clear(&self, flag: Flag) {
        if flag == Flag::Shutdown {
            return;
        }
        let mut bits = self.bits.lock();
        *bits &= !flag.bit();
        self.changed.notify_all();
    }
}

impl Default for ReadinessFlags {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ReadinessFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadinessFlags")
            .field("bits", &format_args!("{:#07b}", *self.bits.lock()))
            .finish()
    }
}

/// Exclusive right to start and stop streaming.
pub struct StreamingSwitch {
    flags: Arc<ReadinessFlags>,
}

impl StreamingSwitch {
    /// Set `StreamingActive`.
    pub fn activate(&self) {
        self.flags.set(Flag::StreamingActive);
    }

    /// Clear `StreamingActive`.
    pub fn deactivate(&self) {
        self.flags.clear(Flag::StreamingActive);
    }

    /// Current state.
    pub fn is_active(&self) -> bool {
        self.flags.is_streaming()
    }
}

impl fmt::Debug for StreamingSwitch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingSwitch")
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn streaming_switch_is_issued_once() {
        let flags = Arc::new(ReadinessFlags::new());
        let switch = flags.streaming_switch().expect("first switch");
        assert!(flags.streaming_switch().is_none());
        switch.activate();
        assert!(flags.is_streaming());
        switch.deactivate();
        assert!(!flags.is_streaming());
    }

    #[test]
    fn shutdown_cannot_be_cleared() {
        let flags = ReadinessFlags::new();
        flags.request_shutdown();
        flags.clear(Flag::Shutdown);
        assert!(flags.is_shutdown());
    }

    #[test]
    fn wait_all_requires_every_bit() {
        let flags = ReadinessFlags::new();
        let mask = FlagSet::empty()
            .with(Flag::CaptureReady)
            .with(Flag::EncodeReady);
        flags.mark_ready(StageId::Capture);
        assert!(!flags.wait_all(mask, Duration::from_millis(5)));
        flags.mark_ready(StageId::Encode);
        assert!(flags.wait_all(mask, Duration::from_millis(5)));
        flags.clear_ready(StageId::Capture);
        assert!(!flags.is_set(Flag::CaptureReady));
    }

    #[test]
    fn unbounded_wait_returns_when_flag_is_raised() {
        let flags = Arc::new(ReadinessFlags::new());
        let waiter = flags.clone();
        let handle = thread::spawn(move || {
            waiter.wait_any(FlagSet::from(Flag::EncodeReady), Duration::MAX)
        });
        thread::sleep(Duration::from_millis(10));
        flags.mark_ready(StageId::Encode);
        assert!(handle.join().unwrap());
    }

    #[test]
    fn waiter_wakes_on_shutdown() {
        let flags = Arc::new(ReadinessFlags::new());
        let waiter = flags.clone();
        let handle = thread::spawn(move || {
            waiter.wait_any(
                FlagSet::from(Flag::StreamingActive).with(Flag::Shutdown),
                Duration::from_secs(5),
            )
        });
        thread::sleep(Duration::from_millis(10));
        flags.request_shutdown();
        assert!(handle.join().unwrap());
    }
}
