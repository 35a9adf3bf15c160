//! # Guest virtual memory
//!
//! Page-table construction, traversal, and mutation for a single flat
//! kernel address space on 4-level x86-64 paging:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │           Demand-Mapping Region Manager                │
//! │  allocate_ondemand · map_frames_ex · unmap_frames      │
//! └──────────────────────────┬─────────────────────────────┘
//!                            │
//! ┌──────────────────────────▼─────────────────────────────┐
//! │              Generic Page-Table Walker                 │
//! │  visits every leaf entry in a VA range; the visitor    │
//! │  may rewrite entries and the walker follows tables     │
//! │  the visitor installs                                  │
//! └──────────────────────────┬─────────────────────────────┘
//!                            │
//! ┌──────────────────────────▼─────────────────────────────┐
//! │     PhysMapper / MmuUpdater / FrameSource seams        │
//! │  frame contents access · privileged entry updates      │
//! │  (direct write vs. validated batch) · table frames     │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! Under paravirtualization page-table entries hold machine frame numbers
//! and every entry write goes through a validated hypervisor batch; under
//! hardware virtualization entries hold guest frames and writes are plain
//! stores. Both variants hide behind [`PhysMapper`] and [`MmuUpdater`], so
//! the walker and the region manager are written once. Hosted tests supply
//! an arena-backed mapper instead of real memory.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod addresses;
mod mapping;
mod p2m;
mod page_entry;
mod walker;

pub use addresses::{Level, TOP_LEVEL, VirtAddr, level_index, level_shift, level_span};
pub use mapping::{
    DemandRegion, MAP_BATCH, do_map_frames, get_pte, map_frames_ex, need_pte,
    set_range_readonly, unmap_frames,
};
pub use p2m::{Mfn, P2mTable};
pub use page_entry::{PageEntry, PageTable, TABLE_ENTRIES};
pub use walker::{FrameSource, MmuUpdate, MmuUpdater, PhysMapper, PteLoc, walk_range};

use guest_mm::Pfn;
use thiserror::Error;

/// Mapping-layer failures. Resource exhaustion and rejected privileged
/// updates are reported here; structural page-table corruption panics.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum MapError {
    /// The frame source could not supply a page for a new table.
    #[error("out of page-table frames")]
    OutOfTableFrames,
    /// The privileged update mechanism rejected a batch of entry writes.
    #[error("page-table update batch rejected at entry {0}")]
    UpdateRejected(usize),
    /// No free demand-map gap of the requested shape exists.
    #[error("no free virtual address range of {0} pages")]
    NoVirtualSpace(usize),
}

/// Direct-write [`MmuUpdater`] for hardware-virtualized mode: every entry
/// update is a plain store through the mapper.
#[derive(Debug, Default)]
pub struct DirectUpdater;

impl MmuUpdater for DirectUpdater {
    fn apply(
        &mut self,
        mapper: &mut dyn PhysMapper,
        updates: &[MmuUpdate],
    ) -> Result<(), MapError> {
        for u in updates {
            mapper.table_mut(u.loc.table).set_entry(u.loc.index, u.entry);
        }
        Ok(())
    }
}

/// Let the buddy allocator hand out page-table pages directly.
impl FrameSource for guest_mm::BuddyAllocator {
    fn alloc_table_frame(&mut self) -> Option<Pfn> {
        self.alloc_page()
    }

    fn free_table_frame(&mut self, frame: Pfn) {
        self.free_page(frame);
    }
}
