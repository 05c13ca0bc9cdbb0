//! Shared-memory ring with the driver wire layout.
//!
//! Region layout, in one contiguous allocation handed to the driver via the
//! register-rings control call:
//!
//! ```text
//! offset 0   u32 head        consumer cursor
//! offset 4   u32 tail        producer cursor
//! offset 8   i32 alertable   consumer-is-blocked flag
//! offset 12  data[capacity + TRAILING_SLACK]
//! ```
//!
//! Every packet occupies `align_up(4 + len)` bytes starting with a 32-bit
//! little-endian length. Cursors wrap modulo `capacity`; the trailing slack
//! lets a packet that straddles the logical end be written with a single
//! contiguous copy.
//!
//! Cursor accesses are `Relaxed` atomics. They only prevent torn reads of a
//! multi-byte offset; the actual producer/consumer handoff is synchronized
//! by the ring's [`Signal`] (the driver cannot take a user-mode lock, so
//! this boundary must stay lock-free).

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use crate::error::{CorruptKind, Error, RingError};

use super::{
    align_up, valid_capacity, wrap, PacketRing, Signal, MAX_PACKET_SIZE, PACKET_HEADER_SIZE,
    TRAILING_SLACK,
};

/// head + tail + alertable.
const RING_HEADER_SIZE: usize = 12;

/// Base address and size of a ring region, as passed to the driver's
/// register-rings control call together with the ring's event handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingDescriptor {
    pub base: usize,
    pub size: usize,
}

/// Owned, aligned allocation for one ring region.
struct RingMemory {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl RingMemory {
    fn allocate(capacity: usize) -> Result<Self, Error> {
        let size = RING_HEADER_SIZE + capacity + TRAILING_SLACK;
        let layout = Layout::from_size_align(size, 8)
            .map_err(|e| Error::Internal(format!("ring layout: {e}")))?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw)
            .ok_or_else(|| Error::Internal("ring allocation failed".into()))?;
        Ok(Self { ptr, layout })
    }
}

impl Drop for RingMemory {
    fn drop(&mut self) {
        // SAFETY: ptr was obtained from alloc_zeroed with this layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// One direction of the shared-memory packet transport.
///
/// The driver co-owns the region for its lifetime; the owning endpoint must
/// not free it until the device connection is closed (see
/// `TunEndpoint::close`).
pub struct SharedRing {
    mem: RingMemory,
    capacity: usize,
    ready: Signal,
}

// SAFETY: all access to the region goes through atomics (cursors, flag) or
// through spans that the cursor protocol guarantees are owned by exactly one
// side at a time.
unsafe impl Send for SharedRing {}
unsafe impl Sync for SharedRing {}

impl SharedRing {
    /// Allocate a zeroed ring. `capacity` must be a power of two within the
    /// architectural bounds.
    pub fn new(capacity: usize, ready: Signal) -> Result<Self, Error> {
        if !valid_capacity(capacity) {
            return Err(Error::InvalidConfig(format!(
                "ring capacity {capacity} is not a power of two within bounds"
            )));
        }
        Ok(Self {
            mem: RingMemory::allocate(capacity)?,
            capacity,
            ready,
        })
    }

    /// Descriptor for the register-rings control call.
    pub fn descriptor(&self) -> RingDescriptor {
        RingDescriptor {
            base: self.mem.ptr.as_ptr() as usize,
            size: RING_HEADER_SIZE + self.capacity + TRAILING_SLACK,
        }
    }

    fn head_cell(&self) -> &AtomicU32 {
        // SAFETY: offset 0 of an 8-aligned, zero-initialized region.
        unsafe { &*self.mem.ptr.as_ptr().cast::<AtomicU32>() }
    }

    fn tail_cell(&self) -> &AtomicU32 {
        // SAFETY: offset 4, 4-aligned, inside the allocation.
        unsafe { &*self.mem.ptr.as_ptr().add(4).cast::<AtomicU32>() }
    }

    fn alertable_cell(&self) -> &AtomicI32 {
        // SAFETY: offset 8, 4-aligned, inside the allocation.
        unsafe { &*self.mem.ptr.as_ptr().add(8).cast::<AtomicI32>() }
    }

    fn data_ptr(&self) -> *mut u8 {
        // SAFETY: the data area starts right after the ring header.
        unsafe { self.mem.ptr.as_ptr().add(RING_HEADER_SIZE) }
    }

    fn head(&self) -> usize {
        self.head_cell().load(Ordering::Relaxed) as usize
    }

    fn tail(&self) -> usize {
        self.tail_cell().load(Ordering::Relaxed) as usize
    }

    #[cfg(test)]
    fn set_tail(&self, tail: usize) {
        self.tail_cell().store(tail as u32, Ordering::Relaxed);
    }

    /// Overwrite the length header of the packet at `head`. Test hook for
    /// exercising the corruption guards end to end.
    #[cfg(test)]
    pub(crate) fn poke_head_header(&self, value: u32) {
        let head = self.head();
        // SAFETY: head < capacity whenever the ring held a packet; the
        // header span is within the data area.
        unsafe {
            let bytes = value.to_le_bytes();
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.data_ptr().add(head), 4);
        }
    }
}

impl PacketRing for SharedRing {
    fn write(&self, packet: &[u8]) -> Result<(), RingError> {
        if packet.len() > MAX_PACKET_SIZE {
            return Err(RingError::PacketTooLarge {
                size: packet.len(),
                max: MAX_PACKET_SIZE,
            });
        }

        let head = self.head();
        let tail = self.tail();
        if head >= self.capacity || tail >= self.capacity {
            return Err(RingError::Corrupt(CorruptKind::CursorOutOfRange));
        }

        let aligned = align_up(PACKET_HEADER_SIZE + packet.len());
        // Free span between the producer cursor and the consumer cursor,
        // holding one alignment unit back so a full ring never looks empty.
        let available = wrap(
            head.wrapping_sub(tail).wrapping_sub(super::PACKET_ALIGNMENT),
            self.capacity,
        );
        if aligned > available {
            return Err(RingError::Full {
                needed: aligned,
                available,
            });
        }

        // SAFETY: tail < capacity and aligned <= align_up(4 + MAX_PACKET_SIZE),
        // so the span ends within capacity + TRAILING_SLACK. The consumer
        // never touches bytes at or past `tail`.
        unsafe {
            let dst = self.data_ptr().add(tail);
            let len_le = (packet.len() as u32).to_le_bytes();
            std::ptr::copy_nonoverlapping(len_le.as_ptr(), dst, PACKET_HEADER_SIZE);
            std::ptr::copy_nonoverlapping(
                packet.as_ptr(),
                dst.add(PACKET_HEADER_SIZE),
                packet.len(),
            );
        }

        self.tail_cell()
            .store(wrap(tail + aligned, self.capacity) as u32, Ordering::Relaxed);

        if self.alertable_cell().load(Ordering::Relaxed) != 0 {
            self.ready.raise();
        }
        Ok(())
    }

    fn read(&self) -> Result<Option<Vec<u8>>, RingError> {
        let head = self.head();
        let tail = self.tail();
        if head == tail {
            return Ok(None);
        }
        if head >= self.capacity || tail >= self.capacity {
            return Err(RingError::Corrupt(CorruptKind::CursorOutOfRange));
        }

        let unread = wrap(tail.wrapping_sub(head), self.capacity);
        if unread < PACKET_HEADER_SIZE {
            return Err(RingError::Corrupt(CorruptKind::TruncatedHeader));
        }

        // SAFETY: head < capacity; the header span is within the data area
        // and owned by the consumer until `head` advances.
        let declared = unsafe {
            let mut len_le = [0u8; PACKET_HEADER_SIZE];
            std::ptr::copy_nonoverlapping(
                self.data_ptr().add(head),
                len_le.as_mut_ptr(),
                PACKET_HEADER_SIZE,
            );
            u32::from_le_bytes(len_le) as usize
        };

        if declared > MAX_PACKET_SIZE {
            return Err(RingError::Corrupt(CorruptKind::OversizedPacket));
        }
        let aligned = align_up(PACKET_HEADER_SIZE + declared);
        if aligned > unread {
            return Err(RingError::Corrupt(CorruptKind::TruncatedPacket));
        }

        let mut packet = vec![0u8; declared];
        // SAFETY: the packet span is within capacity + TRAILING_SLACK and
        // owned by the consumer; wiping it before advancing `head` keeps
        // stale packet bytes from leaking into later reads.
        unsafe {
            let src = self.data_ptr().add(head + PACKET_HEADER_SIZE);
            std::ptr::copy_nonoverlapping(src, packet.as_mut_ptr(), declared);
            std::ptr::write_bytes(src, 0, declared);
        }

        self.head_cell()
            .store(wrap(head + aligned, self.capacity) as u32, Ordering::Relaxed);
        Ok(Some(packet))
    }

    fn is_empty(&self) -> bool {
        self.head() == self.tail()
    }

    fn set_alertable(&self, alertable: bool) {
        self.alertable_cell()
            .store(i32::from(alertable), Ordering::Relaxed);
    }

    fn ready(&self) -> &Signal {
        &self.ready
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

impl std::fmt::Debug for SharedRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRing")
            .field("capacity", &self.capacity)
            .field("head", &self.head())
            .field("tail", &self.tail())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::super::MIN_RING_CAPACITY;
    use super::*;

    fn ring() -> SharedRing {
        SharedRing::new(MIN_RING_CAPACITY, Signal::new()).unwrap()
    }

    #[test]
    fn rejects_bad_capacity() {
        assert!(SharedRing::new(12345, Signal::new()).is_err());
        assert!(SharedRing::new(MIN_RING_CAPACITY / 2, Signal::new()).is_err());
    }

    #[test]
    fn round_trip_single_packet() {
        let ring = ring();
        let packet: Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8).collect();
        ring.write(&packet).unwrap();
        assert_eq!(ring.read().unwrap().unwrap(), packet);
        assert!(ring.read().unwrap().is_none());
    }

    #[test]
    fn round_trip_size_extremes() {
        let ring = ring();
        ring.write(&[0xAB]).unwrap();
        let max = vec![0x5A; MAX_PACKET_SIZE];
        ring.write(&max).unwrap();
        assert_eq!(ring.read().unwrap().unwrap(), vec![0xAB]);
        assert_eq!(ring.read().unwrap().unwrap(), max);
    }

    #[test]
    fn rejects_oversized_packet() {
        let ring = ring();
        let err = ring.write(&vec![0; MAX_PACKET_SIZE + 1]).unwrap_err();
        assert!(matches!(err, RingError::PacketTooLarge { .. }));
    }

    #[test]
    fn fifo_order() {
        let ring = ring();
        let packets: Vec<Vec<u8>> = (0..32u8).map(|i| vec![i; 64 + i as usize]).collect();
        for p in &packets {
            ring.write(p).unwrap();
        }
        for p in &packets {
            assert_eq!(ring.read().unwrap().unwrap(), *p);
        }
        assert!(ring.read().unwrap().is_none());
    }

    #[test]
    fn capacity_invariant_preserves_earlier_packets() {
        let ring = ring();
        let payload = vec![0xC3u8; 4092]; // 4096 aligned with header
        let mut written = 0usize;
        let mut count = 0usize;
        loop {
            match ring.write(&payload) {
                Ok(()) => {
                    written += align_up(PACKET_HEADER_SIZE + payload.len());
                    count += 1;
                }
                Err(RingError::Full { available, .. }) => {
                    // The write that would overflow fails cleanly.
                    assert!(written + align_up(PACKET_HEADER_SIZE + payload.len())
                        > MIN_RING_CAPACITY - super::super::PACKET_ALIGNMENT);
                    assert!(available < align_up(PACKET_HEADER_SIZE + payload.len()));
                    break;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        // Everything written before the failed write reads back intact.
        for _ in 0..count {
            assert_eq!(ring.read().unwrap().unwrap(), payload);
        }
        assert!(ring.read().unwrap().is_none());
    }

    #[test]
    fn wraparound_uses_trailing_slack() {
        let ring = ring();
        let big = vec![0x7Eu8; 40_000];
        // Advance the cursors close to the logical end.
        for _ in 0..3 {
            ring.write(&big).unwrap();
            assert_eq!(ring.read().unwrap().unwrap(), big);
        }
        // This packet starts before the end of the buffer and extends into
        // the trailing slack.
        let straddler: Vec<u8> = (0..30_000u32).map(|i| (i % 239) as u8).collect();
        ring.write(&straddler).unwrap();
        assert_eq!(ring.read().unwrap().unwrap(), straddler);
        // Cursors wrapped back below capacity.
        assert!(ring.head() < ring.capacity());
        assert_eq!(ring.head(), ring.tail());
    }

    #[test]
    fn corrupt_length_header_detected() {
        let ring = ring();
        ring.write(&[1, 2, 3, 4]).unwrap();
        ring.poke_head_header(MAX_PACKET_SIZE as u32 + 1);
        assert_eq!(
            ring.read().unwrap_err(),
            RingError::Corrupt(CorruptKind::OversizedPacket)
        );
    }

    #[test]
    fn truncated_packet_detected() {
        let ring = ring();
        ring.write(&vec![9u8; 100]).unwrap();
        // Producer cursor claims less data than the packet declares.
        ring.set_tail(ring.head() + PACKET_HEADER_SIZE);
        assert_eq!(
            ring.read().unwrap_err(),
            RingError::Corrupt(CorruptKind::TruncatedPacket)
        );
    }

    #[test]
    fn cursor_out_of_range_detected() {
        let ring = ring();
        ring.write(&[1]).unwrap();
        ring.set_tail(ring.capacity() + 8);
        assert!(matches!(
            ring.read().unwrap_err(),
            RingError::Corrupt(CorruptKind::CursorOutOfRange)
        ));
        assert!(matches!(
            ring.write(&[2]).unwrap_err(),
            RingError::Corrupt(CorruptKind::CursorOutOfRange)
        ));
    }

    #[test]
    fn read_wipes_consumed_bytes() {
        let ring = ring();
        ring.write(&[0xFFu8; 32]).unwrap();
        let head_before = ring.head();
        ring.read().unwrap().unwrap();
        // SAFETY (test): inspect the consumed span directly.
        let leaked = unsafe {
            std::slice::from_raw_parts(ring.data_ptr().add(head_before + PACKET_HEADER_SIZE), 32)
        };
        assert!(leaked.iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn write_signals_only_when_alertable() {
        let signal = Signal::new();
        let ring = SharedRing::new(MIN_RING_CAPACITY, signal.clone()).unwrap();

        ring.write(&[1]).unwrap();
        use futures::FutureExt;
        assert!(signal.wait().now_or_never().is_none());

        ring.set_alertable(true);
        ring.write(&[2]).unwrap();
        assert!(signal.wait().now_or_never().is_some());
    }
}
