use crossbeam_queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};
use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

/// What happened to a value offered with [`BoundedTx::try_send`].
///
/// A rejected value is handed back so the caller can run its cleanup.
///
/// # Example
/// ```rust
/// use uvcflow_core::prelude::{bounded, SendOutcome};
///
/// let (tx, _rx) = bounded::<u8>(1);
/// assert!(tx.try_send(1).is_accepted());
/// match tx.try_send(2) {
///     SendOutcome::Full(v) => assert_eq!(v, 2),
///     other => panic!("unexpected {other:?}"),
/// }
/// ```
#[must_use = "a rejected value must be cleaned up by the caller"]
#[derive(Debug, PartialEq, Eq)]
pub enum SendOutcome<T> {
    /// Value is queued.
    Accepted,
    /// No room; the value comes back.
    Full(T),
    /// Channel closed; the value comes back.
    Closed(T),
}

impl<T> SendOutcome<T> {
    /// Whether the value was enqueued.
    pub fn is_accepted(&self) -> bool {
        matches!(self, SendOutcome::Accepted)
    }

    /// Take back the rejected value, if any.
    pub fn into_rejected(self) -> Option<T> {
        match self {
            SendOutcome::Accepted => None,
            SendOutcome::Full(v) | SendOutcome::Closed(v) => Some(v),
        }
    }
}

/// What a receive produced.
///
/// # Example
/// ```rust
/// use std::time::Duration;
/// use uvcflow_core::prelude::{bounded, RecvOutcome};
///
/// let (_tx, rx) = bounded::<u8>(1);
/// assert!(matches!(rx.recv_timeout(Duration::from_millis(1)), RecvOutcome::Timeout));
/// ```
#[derive(Debug, PartialEq, Eq)]
pub enum RecvOutcome<T> {
    /// Oldest queued value.
    Data(T),
    /// Nothing arrived before the deadline.
    Timeout,
    /// Closed and empty. Values queued before `close` are still delivered first.
    Closed,
}

/// Producer side of a [`bounded`] channel. Clones share the channel.
pub struct BoundedTx<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> Clone for BoundedTx<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> BoundedTx<T> {
    /// Enqueue unless full or closed. Never blocks.
    pub fn try_send(&self, value: T) -> SendOutcome<T> {
        if self.inner.closed.load(Ordering::Acquire) {
            return SendOutcome::Closed(value);
        }
        match self.inner.queue.push(value) {
            Ok(()) => {
                self.inner.notify();
                SendOutcome::Accepted
            }
            Err(value) => SendOutcome::Full(value),
        }
    }

    /// Items currently queued.
    pub fn len(&self) -> usize {
        self.inner.queue.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.inner.queue.is_empty()
    }

    /// Fixed capacity.
    pub fn capacity(&self) -> usize {
        self.inner.queue.capacity()
    }

    /// Close the queue to further sends and wake any waiting receiver.
    pub fn close(&self) {
        self.inner.close();
    }
}

/// Consumer side of a [`bounded`] channel.
pub struct BoundedRx<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> Clone for BoundedRx<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> BoundedRx<T> {
    /// Receive without blocking. `Timeout` means "empty right now".
    pub fn try_recv(&self) -> RecvOutcome<T> {
        match self.inner.queue.pop() {
            Some(value) => RecvOutcome::Data(value),
            None if self.inner.closed.load(Ordering::Acquire) => RecvOutcome::Closed,
            None => RecvOutcome::Timeout,
        }
    }

    /// Block for at most `timeout` waiting for a value.
    pub fn recv_timeout(&self, timeout: Duration) -> RecvOutcome<T> {
        // No deadline when it would overflow `Instant`.
        let deadline = Instant::now().checked_add(timeout);
        loop {
            match self.try_recv() {
                RecvOutcome::Timeout => {}
                other => return other,
            }
            let mut guard = self.inner.lock.lock();
            if !self.inner.queue.is_empty() || self.inner.closed.load(Ordering::Acquire) {
                continue;
            }
            match deadline {
                Some(deadline) => {
                    if self.inner.ready.wait_until(&mut guard, deadline).timed_out() {
                        drop(guard);
                        return self.try_recv();
                    }
                }
                None => self.inner.ready.wait(&mut guard),
            }
        }
    }

    /// Remove every queued value.
    pub fn drain(&self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.inner.queue.len());
        while let Some(value) = self.inner.queue.pop() {
            out.push(value);
        }
        out
    }

    /// Items currently queued.
    pub fn len(&self) -> usize {
        self.inner.queue.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.inner.queue.is_empty()
    }

    /// Fixed capacity.
    pub fn capacity(&self) -> usize {
        self.inner.queue.capacity()
    }

    /// Same as [`BoundedTx::close`].
    pub fn close(&self) {
        self.inner.close();
    }
}

impl<T> fmt::Debug for BoundedTx<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedTx")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl<T> fmt::Debug for BoundedRx<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedRx")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

struct QueueInner<T> {
    queue: ArrayQueue<T>,
    closed: AtomicBool,
    lock: Mutex<()>,
    ready: Condvar,
}

impl<T> QueueInner<T> {
    fn notify(&self) {
        let _guard = self.lock.lock();
        self.ready.notify_all();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify();
    }
}

/// Create a bounded queue with the given capacity (clamped to at least one).
///
/// # Example
/// ```rust
/// use std::time::Duration;
/// use uvcflow_core::prelude::{bounded, RecvOutcome};
///
/// let (tx, rx) = bounded::<u8>(3);
/// assert!(tx.try_send(1).is_accepted());
/// assert_eq!(rx.recv_timeout(Duration::from_millis(10)), RecvOutcome::Data(1));
/// ```
pub fn bounded<T>(capacity: usize) -> (BoundedTx<T>, BoundedRx<T>) {
    let inner = Arc::new(QueueInner {
        queue: ArrayQueue::new(capacity.max(1)),
        closed: AtomicBool::new(false),
        lock: Mutex::new(()),
        ready: Condvar::new(),
    });
    (
        BoundedTx {
            inner: inner.clone(),
        },
        BoundedRx { inner },
    )
}
