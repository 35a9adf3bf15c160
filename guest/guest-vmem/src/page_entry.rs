//! The 64-bit page-table entry and the table page holding 512 of them.

use bitfield_struct::bitfield;
use guest_mm::Pfn;

use crate::addresses::Level;

/// Entries per table page.
pub const TABLE_ENTRIES: usize = 512;

/// A single x86-64 page-table entry, the common superset of all four
/// levels.
///
/// The frame-number field holds a guest frame under hardware
/// virtualization and a machine frame under paravirtualization; the
/// [`PhysMapper`](crate::PhysMapper) implementation decides which. Bits
/// `dirty` and `global` are meaningful on leaf entries only, and
/// `large_page` turns a level-2 or level-3 entry into a leaf.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageEntry {
    /// Present (P): the entry maps something.
    pub present: bool,
    /// Writable (RW).
    pub writable: bool,
    /// User-mode accessible (US).
    pub user_access: bool,
    /// Write-through caching (PWT).
    pub write_through: bool,
    /// Caching disabled (PCD).
    pub cache_disabled: bool,
    /// Accessed (A), set by the CPU.
    pub accessed: bool,
    /// Dirty (D), set by the CPU on write; leaf only.
    pub dirty: bool,
    /// Page Size (PS): leaf at level 2 (2 MiB) or level 3 (1 GiB).
    pub large_page: bool,
    /// Global (G): survives address-space switches; leaf only.
    pub global: bool,
    #[bits(3)]
    pub os_available: u8,
    /// Frame-number bits [51:12].
    #[bits(40)]
    frame_bits: u64,
    #[bits(11)]
    __: u16,
    /// No-Execute (NX).
    pub no_execute: bool,
}

impl PageEntry {
    /// Frame number stored in the entry.
    #[inline]
    #[must_use]
    pub const fn frame(self) -> Pfn {
        Pfn(self.frame_bits() as usize)
    }

    #[inline]
    pub const fn set_frame(&mut self, frame: Pfn) {
        self.set_frame_bits(frame.0 as u64);
    }

    #[inline]
    #[must_use]
    pub const fn with_frame(self, frame: Pfn) -> Self {
        self.with_frame_bits(frame.0 as u64)
    }

    /// Non-leaf entry pointing at a next-level table.
    #[inline]
    #[must_use]
    pub const fn new_table(frame: Pfn) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_frame(frame)
    }

    /// Kernel read-write data leaf.
    #[inline]
    #[must_use]
    pub const fn new_leaf_rw(frame: Pfn) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_no_execute(true)
            .with_frame(frame)
    }

    /// Whether this entry terminates a walk at `level`: not present, a
    /// large page, or at the lowest level.
    #[inline]
    #[must_use]
    pub const fn is_leaf(self, level: Level) -> bool {
        level == 1 || !self.present() || self.large_page()
    }
}

/// One page worth of entries.
#[derive(Clone)]
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntry; TABLE_ENTRIES],
}

impl PageTable {
    /// An empty (all not-present) table. New table pages must reach this
    /// state before being linked into a parent, so a half-built table is
    /// never visible as valid mappings.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            entries: [PageEntry::new(); TABLE_ENTRIES],
        }
    }

    #[inline]
    #[must_use]
    pub const fn entry(&self, index: usize) -> PageEntry {
        self.entries[index]
    }

    #[inline]
    pub const fn set_entry(&mut self, index: usize, entry: PageEntry) {
        self.entries[index] = entry;
    }

    /// Iterate over `(index, entry)` pairs of present entries.
    pub fn present_entries(&self) -> impl Iterator<Item = (usize, PageEntry)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.present())
            .map(|(i, e)| (i, *e))
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::empty()
    }
}
