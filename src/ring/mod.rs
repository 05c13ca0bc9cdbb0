//! Lock-free packet rings shared with the TUN driver.
//!
//! A ring carries length-prefixed IP packets in one direction between this
//! process and the kernel driver backing a TUN device. Two implementations
//! exist behind the [`PacketRing`] trait:
//!
//! - [`SharedRing`]: the driver-interop implementation. Bit-exact binary
//!   layout over one contiguous memory region, cursors accessed with relaxed
//!   atomics because the kernel-mode producer cannot take a user-mode lock.
//! - [`ChannelRing`]: a conventional mutex-backed ring for fully in-process
//!   pairs (fd-bridged endpoints, tests). Same capacity accounting, same
//!   error surface, no wire layout.
//!
//! Synchronization across the privilege boundary is carried by [`Signal`]
//! events, not by the cursor atomics: whichever side produced data fires the
//! signal if the other side declared itself blocked (the "alertable" flag).

mod channel;
mod shared;

pub use channel::ChannelRing;
pub use shared::{RingDescriptor, SharedRing};

use std::sync::Arc;

use tokio::sync::Notify;

use crate::error::RingError;

/// Packets are padded to this boundary inside a ring. Keeps the driver's
/// cursor arithmetic branch-free.
pub const PACKET_ALIGNMENT: usize = 4;

/// Length-prefix header stored in front of every packet.
pub const PACKET_HEADER_SIZE: usize = 4;

/// Largest IP packet a ring accepts.
pub const MAX_PACKET_SIZE: usize = 0xFFFF;

/// Slack appended after the logical capacity so one maximum-size packet can
/// always be written contiguously across the wrap boundary.
pub const TRAILING_SLACK: usize = 0x10000;

/// Ring capacity bounds. Must be a power of two.
pub const MIN_RING_CAPACITY: usize = 128 * 1024;
pub const MAX_RING_CAPACITY: usize = 64 * 1024 * 1024;

/// Default per-direction ring capacity.
pub const DEFAULT_RING_CAPACITY: usize = 4 * 1024 * 1024;

/// Round `size` up to the packet alignment boundary.
#[inline]
pub(crate) const fn align_up(size: usize) -> usize {
    (size + (PACKET_ALIGNMENT - 1)) & !(PACKET_ALIGNMENT - 1)
}

/// Wrap a cursor position into `[0, capacity)`. Capacity must be a power of
/// two; cursor arithmetic relies on two's-complement wrapping.
#[inline]
pub(crate) const fn wrap(position: usize, capacity: usize) -> usize {
    position & (capacity - 1)
}

/// Check a ring capacity against the architectural bounds.
pub fn valid_capacity(capacity: usize) -> bool {
    capacity.is_power_of_two() && (MIN_RING_CAPACITY..=MAX_RING_CAPACITY).contains(&capacity)
}

/// One-direction packet ring contract.
///
/// Exactly one producer and one consumer own a ring at a time; `&self`
/// methods are safe to call concurrently from the two sides but not from two
/// producers or two consumers.
pub trait PacketRing: Send + Sync {
    /// Append one packet. Fails fast with [`RingError::Full`] on
    /// backpressure; never blocks, never partially writes.
    fn write(&self, packet: &[u8]) -> Result<(), RingError>;

    /// Pop one packet. `Ok(None)` when the ring is empty;
    /// [`RingError::Corrupt`] when the contents can no longer be trusted.
    fn read(&self) -> Result<Option<Vec<u8>>, RingError>;

    /// True iff a read would return `Ok(None)` right now.
    fn is_empty(&self) -> bool;

    /// Mark whether the consumer is about to block. Producers fire
    /// [`PacketRing::ready`] after a write iff this is set.
    fn set_alertable(&self, alertable: bool);

    /// The data-ready event for this ring.
    fn ready(&self) -> &Signal;

    /// Logical capacity in bytes.
    fn capacity(&self) -> usize;
}

/// Edge-style wakeup event, the user-space stand-in for the per-ring OS
/// event handle. Firing while nobody waits leaves one wakeup pending, so the
/// poll-then-wait pattern never loses a write that races the block.
#[derive(Clone, Default)]
pub struct Signal {
    notify: Arc<Notify>,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the event, waking one waiter (or leaving one wakeup pending).
    pub fn raise(&self) {
        self.notify.notify_one();
    }

    /// Wait until the event fires.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }

    /// Consume any pending wakeup without blocking.
    pub fn drain(&self) {
        use futures::FutureExt;
        while self.notify.notified().now_or_never().is_some() {}
    }
}

impl std::fmt::Debug for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal").finish_non_exhaustive()
    }
}
