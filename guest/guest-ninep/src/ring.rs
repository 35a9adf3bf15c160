//! Flexible byte rings and the shared interface page.
//!
//! Each direction is a power-of-two byte buffer with free-running 32-bit
//! producer and consumer indices; positions are taken modulo the ring
//! size by masking, the indices themselves never wrap back to zero
//! mid-stream. `consumed <= produced <= consumed + size` holds from each
//! side's view as long as both honor the ordering rules in
//! [`transport`](crate::transport).

use core::sync::atomic::{AtomicU8, AtomicU32, Ordering};

use guest_gnttab::GrantRef;
use guest_mm::PAGE_SHIFT;

/// Default ring order: 16 pages split between the two directions.
pub const DEFAULT_RING_ORDER: usize = 4;

/// Bytes per direction for a ring of `order`: half of `2^order` pages.
#[inline]
#[must_use]
pub const fn ring_size(order: usize) -> u32 {
    1 << (order + PAGE_SHIFT - 1)
}

/// One direction's data area.
///
/// The bytes are shared with the peer domain, so they are atomics;
/// cross-domain ordering comes from the index publications, the byte
/// accesses themselves are relaxed.
pub struct RingBuffer<'a> {
    data: &'a [AtomicU8],
}

impl<'a> RingBuffer<'a> {
    /// Wrap a shared byte area; the length must be a power of two.
    #[must_use]
    pub fn new(data: &'a [AtomicU8]) -> Self {
        assert!(data.len().is_power_of_two());
        Self { data }
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    #[inline]
    fn mask(&self, idx: u32) -> usize {
        (idx & (self.size() - 1)) as usize
    }

    /// Copy `src` onto the ring at free-running index `idx`, wrapping
    /// transparently.
    pub fn write(&self, idx: u32, src: &[u8]) {
        for (i, &b) in src.iter().enumerate() {
            self.data[self.mask(idx.wrapping_add(i as u32))].store(b, Ordering::Relaxed);
        }
    }

    /// Copy from the ring at free-running index `idx` into `dst`.
    pub fn read(&self, idx: u32, dst: &mut [u8]) {
        for (i, b) in dst.iter_mut().enumerate() {
            *b = self.data[self.mask(idx.wrapping_add(i as u32))].load(Ordering::Relaxed);
        }
    }
}

/// The shared interface page: ring geometry, grant references for the
/// data area, and the four ring indices.
///
/// The frontend produces on `out` and consumes on `in`; the backend the
/// other way around. Each side only ever stores to its own two indices.
pub struct IntfPage {
    pub in_prod: AtomicU32,
    pub in_cons: AtomicU32,
    pub out_prod: AtomicU32,
    pub out_cons: AtomicU32,
    ring_order: usize,
    refs: alloc::vec::Vec<GrantRef>,
}

impl IntfPage {
    /// Interface for a ring of `order`, with the grant references of the
    /// `2^order` data pages in order.
    #[must_use]
    pub fn new(ring_order: usize, refs: alloc::vec::Vec<GrantRef>) -> Self {
        assert_eq!(refs.len(), 1 << ring_order);
        Self {
            in_prod: AtomicU32::new(0),
            in_cons: AtomicU32::new(0),
            out_prod: AtomicU32::new(0),
            out_cons: AtomicU32::new(0),
            ring_order,
            refs,
        }
    }

    #[must_use]
    pub fn ring_order(&self) -> usize {
        self.ring_order
    }

    #[must_use]
    pub fn grant_refs(&self) -> &[GrantRef] {
        &self.refs
    }
}
