//! Mutex-backed packet ring for fully in-process pairs.
//!
//! Byte-stream device backends and tests never share memory with a kernel
//! driver, so they get a conventional queue behind the same [`PacketRing`]
//! contract: identical aligned-byte capacity accounting, identical error
//! surface, no binary layout to corrupt.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::RingError;

use super::{
    align_up, valid_capacity, PacketRing, Signal, MAX_PACKET_SIZE, PACKET_ALIGNMENT,
    PACKET_HEADER_SIZE,
};

struct Queue {
    packets: VecDeque<Vec<u8>>,
    /// Aligned bytes currently queued, mirroring the shared ring's cursors.
    used: usize,
}

/// In-process [`PacketRing`] with no shared-memory layout.
pub struct ChannelRing {
    queue: Mutex<Queue>,
    capacity: usize,
    alertable: AtomicBool,
    ready: Signal,
}

impl ChannelRing {
    /// Build a ring with the given logical capacity. Out-of-bounds
    /// capacities are clamped into range rather than rejected; this ring
    /// has no driver to agree with on the number.
    pub fn new(capacity: usize, ready: Signal) -> Self {
        let capacity = if valid_capacity(capacity) {
            capacity
        } else {
            capacity
                .next_power_of_two()
                .clamp(super::MIN_RING_CAPACITY, super::MAX_RING_CAPACITY)
        };
        Self {
            queue: Mutex::new(Queue {
                packets: VecDeque::new(),
                used: 0,
            }),
            capacity,
            alertable: AtomicBool::new(false),
            ready,
        }
    }
}

impl PacketRing for ChannelRing {
    fn write(&self, packet: &[u8]) -> Result<(), RingError> {
        if packet.len() > MAX_PACKET_SIZE {
            return Err(RingError::PacketTooLarge {
                size: packet.len(),
                max: MAX_PACKET_SIZE,
            });
        }
        let aligned = align_up(PACKET_HEADER_SIZE + packet.len());
        {
            let mut queue = self.queue.lock();
            let available = self.capacity - PACKET_ALIGNMENT - queue.used;
            if aligned > available {
                return Err(RingError::Full {
                    needed: aligned,
                    available,
                });
            }
            queue.packets.push_back(packet.to_vec());
            queue.used += aligned;
        }
        if self.alertable.load(Ordering::Relaxed) {
            self.ready.raise();
        }
        Ok(())
    }

    fn read(&self) -> Result<Option<Vec<u8>>, RingError> {
        let mut queue = self.queue.lock();
        match queue.packets.pop_front() {
            Some(packet) => {
                queue.used -= align_up(PACKET_HEADER_SIZE + packet.len());
                Ok(Some(packet))
            }
            None => Ok(None),
        }
    }

    fn is_empty(&self) -> bool {
        self.queue.lock().packets.is_empty()
    }

    fn set_alertable(&self, alertable: bool) {
        self.alertable.store(alertable, Ordering::Relaxed);
    }

    fn ready(&self) -> &Signal {
        &self.ready
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

impl std::fmt::Debug for ChannelRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let queue = self.queue.lock();
        f.debug_struct("ChannelRing")
            .field("capacity", &self.capacity)
            .field("queued", &queue.packets.len())
            .field("used", &queue.used)
            .finish()
    }
}
