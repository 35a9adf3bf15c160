//! # Guest physical page management
//!
//! All guest RAM is handed out in page-frame granularity by a binary buddy
//! allocator backed by an allocation bitmap:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              Buddy Page Allocator                   │
//! │    • power-of-two runs, order-indexed free lists    │
//! │    • split on alloc, bitmap-checked merge on free   │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │              Allocation Bitmap                      │
//! │    • one bit per page frame, set = allocated        │
//! │    • free-page counter for the balloon hook         │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! The allocator is initialized from a platform memory map ([`memmap`]) and
//! can be grown at runtime by a ballooning driver through [`BalloonHook`].
//!
//! No locking happens inside this crate: the balloon resize path and the
//! alloc/free paths both mutate the bitmap, so callers serialize through an
//! exclusive borrow (or a surrounding lock) exactly as they would with
//! interrupts disabled.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod bitmap;
mod buddy;
pub mod memmap;

pub use bitmap::AllocBitmap;
pub use buddy::{BalloonHook, BuddyAllocator, MAX_ORDER, VirtMode, alloc_pages_balloon};

/// log2 of the page size.
pub const PAGE_SHIFT: usize = 12;

/// Size of one page frame in bytes.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// A guest physical frame number.
///
/// This is the guest's own view of physical memory; translation to machine
/// frames (under paravirtualization) happens in the vmem layer.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct Pfn(pub usize);

impl Pfn {
    #[must_use]
    pub const fn from_addr(addr: u64) -> Self {
        Self((addr >> PAGE_SHIFT) as usize)
    }

    #[must_use]
    pub const fn addr(self) -> u64 {
        (self.0 as u64) << PAGE_SHIFT
    }
}

impl core::fmt::Debug for Pfn {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "pfn {:#x}", self.0)
    }
}

/// Round `addr` up to the next page boundary.
#[inline]
#[must_use]
pub const fn round_pgup(addr: u64) -> u64 {
    (addr + (PAGE_SIZE as u64 - 1)) & !(PAGE_SIZE as u64 - 1)
}

/// Round `addr` down to a page boundary.
#[inline]
#[must_use]
pub const fn round_pgdown(addr: u64) -> u64 {
    addr & !(PAGE_SIZE as u64 - 1)
}
