//! Platform memory map.
//!
//! A normalized list of physical address ranges with their usability, as
//! reported by the platform at boot (hypervisor memory map or firmware
//! tables). The page allocator frees exactly the [`RegionKind::Ram`]
//! ranges; everything else stays permanently allocated.

use alloc::vec::Vec;

use crate::{PAGE_SHIFT, Pfn, round_pgdown, round_pgup};

/// Usability class of a physical range.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegionKind {
    /// Usable RAM.
    Ram,
    /// Reserved by the platform; never touch.
    Reserved,
    /// ACPI reclaimable tables.
    Acpi,
    /// ACPI non-volatile storage.
    Nvs,
    /// Known-bad or otherwise unusable memory.
    Unusable,
}

/// One contiguous physical range.
#[derive(Copy, Clone, Debug)]
pub struct MemoryRegion {
    pub addr: u64,
    pub size: u64,
    pub kind: RegionKind,
}

impl MemoryRegion {
    #[must_use]
    pub const fn new(addr: u64, size: u64, kind: RegionKind) -> Self {
        Self { addr, size, kind }
    }

    /// One past the last byte of the region.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.addr + self.size
    }
}

/// The full map, sorted by base address.
pub struct MemoryMap {
    regions: Vec<MemoryRegion>,
}

impl MemoryMap {
    /// Build a map from raw regions; sorts by base and drops empty entries.
    #[must_use]
    pub fn new(mut regions: Vec<MemoryRegion>) -> Self {
        regions.retain(|r| r.size > 0);
        regions.sort_unstable_by_key(|r| r.addr);
        Self { regions }
    }

    #[must_use]
    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    /// Highest byte address covered by any usable RAM region.
    #[must_use]
    pub fn ram_end(&self) -> u64 {
        self.regions
            .iter()
            .filter(|r| r.kind == RegionKind::Ram)
            .map(MemoryRegion::end)
            .max()
            .unwrap_or(0)
    }

    /// Total usable RAM pages (whole pages only).
    #[must_use]
    pub fn nr_ram_pages(&self) -> usize {
        self.regions
            .iter()
            .filter(|r| r.kind == RegionKind::Ram)
            .map(|r| ((round_pgdown(r.end()) - round_pgup(r.addr)) >> PAGE_SHIFT) as usize)
            .sum()
    }

    /// How many of the `nr_pages` frames starting at `first` lie in one
    /// usable RAM region. Zero when `first` itself is not usable RAM.
    ///
    /// Ballooning uses this to size hypervisor populate requests so a
    /// request never straddles a hole in the map.
    #[must_use]
    pub fn max_contig_pages(&self, first: Pfn, nr_pages: usize) -> usize {
        let addr = first.addr();
        for r in &self.regions {
            if r.kind == RegionKind::Ram && r.addr <= addr && addr < r.end() {
                let room = ((round_pgdown(r.end()) - addr) >> PAGE_SHIFT) as usize;
                return nr_pages.min(room);
            }
        }
        0
    }
}
