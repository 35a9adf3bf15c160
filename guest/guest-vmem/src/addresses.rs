//! Virtual addresses and 4-level paging geometry.
//!
//! A virtual address decomposes into per-level table indices:
//!
//! ```text
//! 63      48 47     39 38     30 29     21 20     12 11        0
//! ┌─────────┬─────────┬─────────┬─────────┬─────────┬──────────┐
//! │  sign   │ L4 idx  │ L3 idx  │ L2 idx  │ L1 idx  │  offset  │
//! └─────────┴─────────┴─────────┴─────────┴─────────┴──────────┘
//! ```
//!
//! Levels are numbered 1 (4 KiB pages) through [`TOP_LEVEL`]; a leaf may
//! sit at level 2 as a 2 MiB large page.

use guest_mm::{PAGE_SHIFT, PAGE_SIZE};

/// A paging level, 1-based; 1 is the terminal (smallest-page) level.
pub type Level = usize;

/// Number of paging levels.
pub const TOP_LEVEL: Level = 4;

/// Bits of virtual address consumed below each level's index.
const LEVEL_SHIFTS: [u32; TOP_LEVEL + 1] = [0, 12, 21, 30, 39];

/// Index bits per level.
const INDEX_BITS: u32 = 9;

/// log2 of the bytes one entry at `level` covers.
#[inline]
#[must_use]
pub const fn level_shift(level: Level) -> u32 {
    LEVEL_SHIFTS[level]
}

/// Bytes covered by one entry at `level` (4 KiB, 2 MiB, 1 GiB, 512 GiB).
#[inline]
#[must_use]
pub const fn level_span(level: Level) -> u64 {
    1 << LEVEL_SHIFTS[level]
}

/// Table index selecting the entry for `va` at `level`.
#[inline]
#[must_use]
pub const fn level_index(va: VirtAddr, level: Level) -> usize {
    ((va.as_u64() >> LEVEL_SHIFTS[level]) & ((1 << INDEX_BITS) - 1)) as usize
}

/// A virtual address in the single kernel address space.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct VirtAddr(u64);

impl VirtAddr {
    #[inline]
    #[must_use]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Round down to the start of the page containing this address.
    #[inline]
    #[must_use]
    pub const fn page_base(self) -> Self {
        Self(self.0 & !(PAGE_SIZE as u64 - 1))
    }

    /// Round up to `align` bytes (a power of two).
    #[inline]
    #[must_use]
    pub const fn align_up(self, align: u64) -> Self {
        debug_assert!(align.is_power_of_two());
        Self((self.0 + align - 1) & !(align - 1))
    }

    /// Offset by a number of pages.
    #[inline]
    #[must_use]
    pub const fn add_pages(self, n: usize) -> Self {
        Self(self.0 + ((n as u64) << PAGE_SHIFT))
    }
}

impl core::fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "va {:#x}", self.0)
    }
}
