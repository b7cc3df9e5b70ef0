#![doc = include_str!("../README.md")]

pub mod counters;
pub mod error;
pub mod flags;
pub mod format;
pub mod metrics;
pub mod queue;
pub mod slot;

pub mod prelude {
    pub use crate::{
        counters::{CounterSnapshot, FrameCounters},
        error::{ErrorClass, SlotError},
        flags::{Flag, FlagSet, ReadinessFlags, StageId, StreamingSwitch},
        format::{CodecTag, FourCc, Resolution, StreamFormat},
        metrics::{PoolEvent, PoolMetrics},
        queue::{BoundedRx, BoundedTx, RecvOutcome, SendOutcome, bounded},
        slot::{
            BorrowedSlot, Disposal, FrameMeta, FramePool, FramePoolStats, FrameSlot,
            MonotonicClock, OwnedBuffer, Payload, SlotCheckout, SlotOwner,
        },
    };
}
