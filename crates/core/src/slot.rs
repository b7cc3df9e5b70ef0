use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Instant,
};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::{
    error::SlotError,
    format::CodecTag,
    metrics::{PoolEvent, PoolMetrics},
};

/// Owner of driver-backed frame slots.
///
/// Implemented by device handles that hand out fixed-index slots from a mapped ring. The
/// pipeline never frees that memory; it only checks slots out and returns them.
pub trait SlotOwner: Send + Sync {
    /// Short label used in logs.
    fn label(&self) -> &str;

    /// Hand slot `index` back to the device so it can be refilled.
    fn return_slot(&self, index: usize) -> Result<(), SlotError>;
}

/// A filled slot checked out of a device ring.
///
/// `data` views the slot memory; it stays valid until the slot is returned.
#[derive(Debug, Clone)]
pub struct SlotCheckout {
    /// Ring index of the slot.
    pub index: usize,
    /// Bytes written by the device.
    pub bytes_used: usize,
    /// Backing size fixed by the device.
    pub capacity: usize,
    /// View over the slot memory.
    pub data: Bytes,
}

/// Metadata stamped at capture and carried unchanged to delivery.
///
/// Only `codec_tag` changes along the way, and only in the encode stage.
///
/// # Example
/// ```rust
/// use uvcflow_core::prelude::{FourCc, FrameMeta};
///
/// let meta = FrameMeta::captured(1_000, 7, 0);
/// let encoded = meta.encoded(FourCc::MJPG);
/// assert_eq!(encoded.sequence, 7);
/// assert_eq!(encoded.timestamp, 1_000);
/// assert_eq!(encoded.codec_tag, Some(FourCc::MJPG));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMeta {
    /// Capture time in monotonic microseconds.
    pub timestamp: u64,
    /// Per-pipeline frame number.
    pub sequence: u64,
    /// Counter epoch at capture time.
    pub epoch: u64,
    /// Output encoding, set by the encode stage.
    pub codec_tag: Option<CodecTag>,
}

impl FrameMeta {
    /// Metadata for a freshly captured frame.
    pub fn captured(timestamp: u64, sequence: u64, epoch: u64) -> Self {
        Self {
            timestamp,
            sequence,
            epoch,
            codec_tag: None,
        }
    }

    /// Same frame identity with the encoder's codec tag attached.
    pub fn encoded(self, codec_tag: CodecTag) -> Self {
        Self {
            codec_tag: Some(codec_tag),
            ..self
        }
    }
}

/// Monotonic clock used to stamp frames.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Start a clock at zero.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Microseconds since the clock was created.
    pub fn now_micros(&self) -> u64 {
        self.origin.elapsed().as_micros().min(u64::MAX as u128) as u64
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Slot memory borrowed from a device.
///
/// Not `Clone`: the only way to give it back is [`BorrowedSlot::return_to_owner`], which
/// consumes it. Dropping an unreturned slot returns it as a last resort and logs a warning.
pub struct BorrowedSlot {
    owner: Option<Arc<dyn SlotOwner>>,
    index: usize,
    bytes_used: usize,
    capacity: usize,
    data: Bytes,
}

impl BorrowedSlot {
    /// Ring index of the slot.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Bytes written by the device.
    pub fn as_slice(&self) -> &[u8] {
        let end = self.bytes_used.min(self.data.len());
        &self.data[..end]
    }

    /// Give the slot back to its device.
    pub fn return_to_owner(mut self) -> Result<(), SlotError> {
        match self.owner.take() {
            Some(owner) => {
                tracing::trace!(owner = owner.label(), index = self.index, "slot returned");
                owner.return_slot(self.index)
            }
            None => Ok(()),
        }
    }
}

impl Drop for BorrowedSlot {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.take() {
            tracing::warn!(
                owner = owner.label(),
                index = self.index,
                "borrowed slot dropped without explicit return; returning it now"
            );
            if let Err(err) = owner.return_slot(self.index) {
                tracing::error!(error = %err, "late slot return failed");
            }
        }
    }
}

impl fmt::Debug for BorrowedSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BorrowedSlot")
            .field("owner", &self.owner.as_ref().map(|o| o.label().to_owned()))
            .field("index", &self.index)
            .field("bytes_used", &self.bytes_used)
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Buffer allocated from a [`FramePool`].
///
/// When dropped, the buffer goes back to the pool and its bytes are credited to the budget.
pub struct OwnedBuffer {
    pool: Arc<PoolInner>,
    buf: Option<Vec<u8>>,
    reserved: usize,
}

impl OwnedBuffer {
    /// Borrow the written bytes.
    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }

    /// Current length.
    pub fn len(&self) -> usize {
        self.buf.as_ref().map(|b| b.len()).unwrap_or(0)
    }

    /// Whether nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capacity reserved against the pool budget.
    pub fn capacity(&self) -> usize {
        self.reserved
    }

    /// Replace the contents with `data`.
    pub fn fill_from(&mut self, data: &[u8]) -> Result<(), SlotError> {
        if data.len() > self.reserved {
            return Err(SlotError::Overflow {
                len: data.len(),
                capacity: self.reserved,
            });
        }
        if let Some(buf) = self.buf.as_mut() {
            buf.clear();
            buf.extend_from_slice(data);
        }
        Ok(())
    }

    /// Free the buffer back to its pool.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for OwnedBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.recycle(buf, self.reserved);
        }
    }
}

impl fmt::Debug for OwnedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedBuffer")
            .field("len", &self.len())
            .field("capacity", &self.reserved)
            .finish()
    }
}

/// Byte-budgeted pool handing out recyclable frame buffers.
///
/// The budget models the finite frame memory of the device; once it is spent, allocation
/// fails with [`SlotError::AllocationFailed`] instead of growing.
///
/// # Example
/// ```rust
/// use uvcflow_core::prelude::FramePool;
///
/// let pool = FramePool::with_budget(1024, 2);
/// let a = pool.alloc(600).unwrap();
/// assert!(pool.alloc(600).is_err());
/// drop(a);
/// assert!(pool.alloc(600).is_ok());
/// ```
#[derive(Clone)]
pub struct FramePool {
    inner: Arc<PoolInner>,
}

impl FramePool {
    /// Create a pool that leases at most `budget` bytes at once and keeps up to `max_free`
    /// recycled buffers.
    pub fn with_budget(budget: usize, max_free: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::with_capacity(max_free)),
                budget,
                in_use: AtomicUsize::new(0),
                max_free,
                metrics: PoolMetrics::default(),
            }),
        }
    }

    /// Lease a buffer able to hold `capacity` bytes.
    pub fn alloc(&self, capacity: usize) -> Result<OwnedBuffer, SlotError> {
        if capacity == 0 {
            return Err(SlotError::ZeroCapacity);
        }
        self.inner.reserve(capacity)?;
        let buf = match self.inner.take_free(capacity) {
            Some(buf) => {
                self.inner.metrics.record(PoolEvent::Hit);
                buf
            }
            None => {
                self.inner.metrics.record(PoolEvent::Miss);
                let mut buf = Vec::new();
                if buf.try_reserve_exact(capacity).is_err() {
                    self.inner.unreserve(capacity);
                    self.inner.metrics.record(PoolEvent::Exhausted);
                    return Err(SlotError::AllocationFailed {
                        requested: capacity,
                        in_use: self.inner.in_use.load(Ordering::Acquire),
                        budget: self.inner.budget,
                    });
                }
                self.inner.metrics.record(PoolEvent::Allocated);
                buf
            }
        };
        Ok(OwnedBuffer {
            pool: self.inner.clone(),
            buf: Some(buf),
            reserved: capacity,
        })
    }

    /// Snapshot of pool usage.
    pub fn stats(&self) -> FramePoolStats {
        FramePoolStats {
            budget: self.inner.budget,
            in_use: self.inner.in_use.load(Ordering::Acquire),
            free_buffers: self.inner.free.lock().len(),
            hits: self.inner.metrics.count(PoolEvent::Hit),
            misses: self.inner.metrics.count(PoolEvent::Miss),
            allocations: self.inner.metrics.count(PoolEvent::Allocated),
            exhaustions: self.inner.metrics.count(PoolEvent::Exhausted),
        }
    }
}

impl fmt::Debug for FramePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramePool")
            .field("stats", &self.stats())
            .finish()
    }
}

/// Point-in-time view of a [`FramePool`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FramePoolStats {
    /// Configured byte budget.
    pub budget: usize,
    /// Bytes currently leased.
    pub in_use: usize,
    /// Recycled buffers waiting for reuse.
    pub free_buffers: usize,
    /// Allocations served from the free list.
    pub hits: u64,
    /// Allocations that needed a fresh buffer.
    pub misses: u64,
    /// Fresh buffers allocated.
    pub allocations: u64,
    /// Allocations refused.
    pub exhaustions: u64,
}

struct PoolInner {
    free: Mutex<Vec<Vec<u8>>>,
    budget: usize,
    in_use: AtomicUsize,
    max_free: usize,
    metrics: PoolMetrics,
}

impl PoolInner {
    fn reserve(&self, capacity: usize) -> Result<(), SlotError> {
        let mut current = self.in_use.load(Ordering::Acquire);
        loop {
            let next = current.saturating_add(capacity);
            if next > self.budget {
                self.metrics.record(PoolEvent::Exhausted);
                return Err(SlotError::AllocationFailed {
                    requested: capacity,
                    in_use: current,
                    budget: self.budget,
                });
            }
            match self.in_use.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    fn unreserve(&self, capacity: usize) {
        self.in_use.fetch_sub(capacity, Ordering::AcqRel);
    }

    fn take_free(&self, capacity: usize) -> Option<Vec<u8>> {
        let mut free = self.free.lock();
        let pos = free.iter().position(|b| b.capacity() >= capacity)?;
        Some(free.swap_remove(pos))
    }

    fn recycle(&self, mut buf: Vec<u8>, reserved: usize) {
        buf.clear();
        {
            let mut free = self.free.lock();
            if free.len() < self.max_free {
                free.push(buf);
            }
        }
        self.unreserve(reserved);
    }
}

/// Frame payload: pipeline-owned memory or a slot borrowed from a device.
#[derive(Debug)]
pub enum Payload {
    /// Allocated and freed by the pipeline.
    Owned(OwnedBuffer),
    /// Checked out of a device ring; must be returned.
    Borrowed(BorrowedSlot),
}

/// What happened to a frame's payload when it was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposal {
    /// Owned memory went back to the pool.
    Released,
    /// Borrowed slot went back to its device.
    Returned {
        /// Ring index handed back.
        index: usize,
    },
    /// The device refused the slot return (logged).
    ReturnFailed {
        /// Ring index that failed.
        index: usize,
    },
}

/// Unit of frame data moving through the pipeline.
///
/// # Example
/// ```rust
/// use uvcflow_core::prelude::*;
///
/// let pool = FramePool::with_budget(4096, 1);
/// let meta = FrameMeta::captured(10, 0, 0).encoded(FourCc::MJPG);
/// let mut frame = FrameSlot::alloc_owned(&pool, 16, meta).unwrap();
/// frame.write(b"jpeg").unwrap();
/// assert_eq!(frame.data(), b"jpeg");
/// assert_eq!(frame.discard(), Disposal::Released);
/// ```
#[derive(Debug)]
pub struct FrameSlot {
    meta: FrameMeta,
    payload: Payload,
}

impl FrameSlot {
    /// Allocate an owned slot of `capacity` bytes.
    pub fn alloc_owned(
        pool: &FramePool,
        capacity: usize,
        meta: FrameMeta,
    ) -> Result<Self, SlotError> {
        let buf = pool.alloc(capacity)?;
        Ok(Self {
            meta,
            payload: Payload::Owned(buf),
        })
    }

    /// Wrap a device checkout as a borrowed slot.
    pub fn checkout_borrowed(
        owner: Arc<dyn SlotOwner>,
        checkout: SlotCheckout,
        meta: FrameMeta,
    ) -> Self {
        Self {
            meta,
            payload: Payload::Borrowed(BorrowedSlot {
                owner: Some(owner),
                index: checkout.index,
                bytes_used: checkout.bytes_used,
                capacity: checkout.capacity,
                data: checkout.data,
            }),
        }
    }

    /// Frame metadata.
    pub fn meta(&self) -> &FrameMeta {
        &self.meta
    }

    /// Payload bytes.
    pub fn data(&self) -> &[u8] {
        match &self.payload {
            Payload::Owned(buf) => buf.as_slice(),
            Payload::Borrowed(slot) => slot.as_slice(),
        }
    }

    /// Logical size.
    pub fn len(&self) -> usize {
        self.data().len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Backing size.
    pub fn capacity(&self) -> usize {
        match &self.payload {
            Payload::Owned(buf) => buf.capacity(),
            Payload::Borrowed(slot) => slot.capacity,
        }
    }

    /// Whether the payload is a device slot.
    pub fn is_borrowed(&self) -> bool {
        matches!(self.payload, Payload::Borrowed(_))
    }

    /// Write into an owned payload. Borrowed slots are read-only.
    pub fn write(&mut self, data: &[u8]) -> Result<(), SlotError> {
        match &mut self.payload {
            Payload::Owned(buf) => buf.fill_from(data),
            Payload::Borrowed(slot) => Err(SlotError::ReadOnly { index: slot.index }),
        }
    }

    /// Split into metadata and payload so the caller handles each variant explicitly.
    pub fn into_parts(self) -> (FrameMeta, Payload) {
        (self.meta, self.payload)
    }

    /// Hand a borrowed slot back to its device, consuming the frame so it cannot be
    /// returned twice. An owned frame comes back untouched in `Err`.
    pub fn return_borrowed(self) -> Result<Result<(), SlotError>, FrameSlot> {
        match self.payload {
            Payload::Borrowed(slot) => Ok(slot.return_to_owner()),
            payload => Err(FrameSlot {
                meta: self.meta,
                payload,
            }),
        }
    }

    /// Free owned memory back to its pool. A borrowed frame comes back untouched in `Err`.
    pub fn release_owned(self) -> Result<(), FrameSlot> {
        match self.payload {
            Payload::Owned(buf) => {
                buf.release();
                Ok(())
            }
            payload => Err(FrameSlot {
                meta: self.meta,
                payload,
            }),
        }
    }

    /// Run the cleanup that matches the payload: return a borrowed slot or release owned
    /// memory.
    pub fn discard(self) -> Disposal {
        match self.payload {
            Payload::Owned(buf) => {
                buf.release();
                Disposal::Released
            }
            Payload::Borrowed(slot) => {
                let index = slot.index;
                match slot.return_to_owner() {
                    Ok(()) => Disposal::Returned { index },
                    Err(err) => {
                        tracing::error!(index, error = %err, "slot return failed");
                        Disposal::ReturnFailed { index }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[derive(Default)]
    struct CountingOwner {
        returns: AtomicU64,
    }

    impl SlotOwner for CountingOwner {
        fn label(&self) -> &str {
            "test"
        }

        fn return_slot(&self, _index: usize) -> Result<(), SlotError> {
            self.returns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn checkout(index: usize) -> SlotCheckout {
        SlotCheckout {
            index,
            bytes_used: 4,
            capacity: 8,
            data: Bytes::from_static(b"abcdefgh"),
        }
    }

    #[test]
    fn borrowed_slot_returns_exactly_once_when_discarded() {
        let owner = Arc::new(CountingOwner::default());
        let slot = FrameSlot::checkout_borrowed(owner.clone(), checkout(2), FrameMeta::captured(0, 0, 0));
        assert!(slot.is_borrowed());
        assert_eq!(slot.data(), b"abcd");
        assert_eq!(slot.capacity(), 8);
        assert_eq!(slot.discard(), Disposal::Returned { index: 2 });
        assert_eq!(owner.returns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_borrowed_slot_is_returned_by_destructor() {
        let owner = Arc::new(CountingOwner::default());
        {
            let _slot =
                FrameSlot::checkout_borrowed(owner.clone(), checkout(0), FrameMeta::captured(0, 0, 0));
        }
        assert_eq!(owner.returns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn explicit_return_disarms_destructor() {
        let owner = Arc::new(CountingOwner::default());
        let slot = FrameSlot::checkout_borrowed(owner.clone(), checkout(1), FrameMeta::captured(0, 0, 0));
        let slot = slot.release_owned().unwrap_err();
        slot.return_borrowed().unwrap().unwrap();
        assert_eq!(owner.returns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn owned_frame_is_not_returned_to_a_device() {
        let pool = FramePool::with_budget(64, 1);
        let frame = FrameSlot::alloc_owned(&pool, 16, FrameMeta::captured(0, 0, 0)).unwrap();
        let frame = frame.return_borrowed().unwrap_err();
        assert_eq!(pool.stats().in_use, 16);
        frame.release_owned().unwrap();
        assert_eq!(pool.stats().in_use, 0);
    }

    #[test]
    fn borrowed_payload_is_read_only() {
        let owner = Arc::new(CountingOwner::default());
        let mut slot =
            FrameSlot::checkout_borrowed(owner.clone(), checkout(3), FrameMeta::captured(0, 0, 0));
        assert!(matches!(slot.write(b"x"), Err(SlotError::ReadOnly { index: 3 })));
        slot.discard();
        assert_eq!(owner.returns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pool_budget_is_credited_on_release() {
        let pool = FramePool::with_budget(100, 4);
        let a = FrameSlot::alloc_owned(&pool, 60, FrameMeta::captured(0, 0, 0)).unwrap();
        let err = FrameSlot::alloc_owned(&pool, 60, FrameMeta::captured(0, 1, 0)).unwrap_err();
        assert!(matches!(err, SlotError::AllocationFailed { requested: 60, .. }));
        assert_eq!(pool.stats().in_use, 60);
        assert_eq!(a.discard(), Disposal::Released);
        assert_eq!(pool.stats().in_use, 0);
        let _b = FrameSlot::alloc_owned(&pool, 60, FrameMeta::captured(0, 2, 0)).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.exhaustions, 1);
    }

    #[test]
    fn owned_write_rejects_overflow() {
        let pool = FramePool::with_budget(100, 1);
        let mut frame = FrameSlot::alloc_owned(&pool, 2, FrameMeta::captured(0, 0, 0)).unwrap();
        assert!(matches!(frame.write(b"abc"), Err(SlotError::Overflow { len: 3, capacity: 2 })));
        frame.write(b"ab").unwrap();
        assert_eq!(frame.len(), 2);
    }

    #[test]
    fn zero_capacity_is_refused() {
        let pool = FramePool::with_budget(100, 1);
        assert!(matches!(pool.alloc(0), Err(SlotError::ZeroCapacity)));
    }

    #[test]
    fn clock_is_monotonic() {
        let clock = MonotonicClock::new();
        let a = clock.now_micros();
        let b = clock.now_micros();
        assert!(b >= a);
    }
}
