//! Binary buddy page allocator.
//!
//! Free memory is kept as maximal power-of-two runs of pages ("chunks") on
//! per-order free lists. Allocation splits the smallest satisfying chunk
//! down to the requested order; freeing merges a chunk with its buddy (the
//! adjacent equal-sized run found by flipping the order bit of the base
//! PFN) for as long as that buddy is itself a whole free chunk of the same
//! order.
//!
//! The free lists are index-based: instead of link nodes embedded in the
//! free pages themselves, a side arena holds `next`/`prev` PFN links and
//! the chunk order per frame. Push, pop, and arbitrary unlink stay O(1) and
//! the pages' contents are never interpreted by the allocator.

use alloc::vec::Vec;

use crate::memmap::{MemoryMap, RegionKind};
use crate::{AllocBitmap, PAGE_SHIFT, Pfn, round_pgdown, round_pgup};

/// One above the largest supported order: `address-bits - page-shift`.
pub const MAX_ORDER: usize = usize::BITS as usize - PAGE_SHIFT;

/// 2 MiB, the large-page granularity HVM boot mapping works in.
const LARGE_PAGE_SIZE: u64 = 1 << 21;

const NIL: u32 = u32::MAX;
const NO_CHUNK: u8 = u8::MAX;

/// How the guest is virtualized; decides the manageable address range.
#[derive(Copy, Clone, Debug)]
pub enum VirtMode {
    /// Shared address space with the hypervisor: everything at or above the
    /// hypervisor's reserved virtual area is off limits.
    Paravirt { hypervisor_virt_start: u64 },
    /// Hardware virtualized: the early boot mapping uses large pages, so
    /// the managed range starts at a large-page boundary.
    Hvm,
}

/// Clamp the `[min, max)` byte range the allocator may manage according to
/// the virtualization mode.
#[must_use]
pub fn clamp_range(mode: VirtMode, min: u64, max: u64) -> (u64, u64) {
    match mode {
        VirtMode::Paravirt {
            hypervisor_virt_start,
        } => {
            if max > hypervisor_virt_start {
                log::warn!(
                    "truncating managed memory from {max:#x} to {hypervisor_virt_start:#x} \
                     to keep out of the hypervisor area"
                );
                (min, hypervisor_virt_start)
            } else {
                (min, max)
            }
        }
        VirtMode::Hvm => (
            (min + LARGE_PAGE_SIZE - 1) & !(LARGE_PAGE_SIZE - 1),
            max,
        ),
    }
}

/// Free-list links for one frame; only meaningful while the frame is the
/// base of a free chunk.
#[derive(Copy, Clone)]
struct ChunkLink {
    next: u32,
    prev: u32,
}

/// The buddy allocator for all guest RAM.
///
/// Single instance per kernel, owned by the memory-management init path and
/// passed by reference. Not internally locked; see the crate docs.
pub struct BuddyAllocator {
    bitmap: AllocBitmap,
    /// Head PFN of the free list per order, [`NIL`] when empty.
    free_heads: [u32; MAX_ORDER],
    links: Vec<ChunkLink>,
    /// Order of the free chunk based at this frame, [`NO_CHUNK`] otherwise.
    chunk_order: Vec<u8>,
}

impl BuddyAllocator {
    /// Initialize the allocator for the byte range `[min, max)`, freeing
    /// every usable RAM region of `map` that intersects it.
    ///
    /// Regions are carved into the largest alignment-respecting
    /// power-of-two chunks, so a well-aligned region reconstitutes into a
    /// handful of maximal chunks rather than a sea of single pages.
    #[must_use]
    pub fn new(map: &MemoryMap, min: u64, max: u64) -> Self {
        let min = round_pgup(min);
        let max = round_pgdown(max);
        log::info!("MM: initialise page allocator for {min:#x}-{max:#x}");

        let max_pfn = (max >> PAGE_SHIFT) as usize;
        let mut alloc = Self {
            bitmap: AllocBitmap::new_all_allocated(max_pfn),
            free_heads: [NIL; MAX_ORDER],
            links: alloc::vec![ChunkLink { next: NIL, prev: NIL }; max_pfn],
            chunk_order: alloc::vec![NO_CHUNK; max_pfn],
        };

        for region in map.regions() {
            if region.kind != RegionKind::Ram {
                continue;
            }
            let r_min = round_pgup(region.addr.max(min));
            let r_max = round_pgdown((region.addr + region.size).min(max));
            if r_min >= r_max {
                continue;
            }
            log::info!("    adding memory range {r_min:#x}-{r_max:#x}");

            let first = (r_min >> PAGE_SHIFT) as usize;
            let count = ((r_max - r_min) >> PAGE_SHIFT) as usize;
            alloc.bitmap.mark_free(first, count);
            alloc.seed_chunks(first, count);
        }

        alloc
    }

    /// Link an already-bitmap-free run of pages into the free lists as
    /// maximal chunks. The next chunk is limited by the alignment of the
    /// base but must not exceed the remaining run.
    fn seed_chunks(&mut self, mut pfn: usize, mut count: usize) {
        while count > 0 {
            let align = if pfn == 0 {
                MAX_ORDER - 1
            } else {
                pfn.trailing_zeros() as usize
            };
            let fit = (usize::BITS - 1 - count.leading_zeros()) as usize;
            let order = align.min(fit).min(MAX_ORDER - 1);
            self.enqueue(pfn, order);
            pfn += 1 << order;
            count -= 1 << order;
        }
    }

    /// Frames currently free.
    #[must_use]
    pub const fn nr_free_pages(&self) -> usize {
        self.bitmap.nr_free_pages()
    }

    /// Whether `pfn` is marked allocated in the bitmap.
    #[must_use]
    pub fn allocated_in_map(&self, pfn: Pfn) -> bool {
        self.bitmap.allocated(pfn.0)
    }

    /// Allocate `2^order` contiguous page-aligned frames.
    ///
    /// Returns `None` when no sufficiently large run exists; the caller
    /// decides whether that is fatal. See [`alloc_pages_balloon`] for the
    /// variant that tries to grow memory first.
    pub fn alloc_pages(&mut self, order: usize) -> Option<Pfn> {
        if order >= MAX_ORDER {
            return None;
        }

        // Smallest order that can satisfy the request.
        let from = (order..MAX_ORDER).find(|&i| self.free_heads[i] != NIL);
        let Some(mut i) = from else {
            log::warn!("cannot handle page request order {order}");
            return None;
        };

        let pfn = self.pop_head(i);

        // Split back down, re-queueing the upper half at each step.
        while i > order {
            i -= 1;
            self.enqueue(pfn + (1 << i), i);
        }

        self.bitmap.mark_allocated(pfn, 1 << order);
        Some(Pfn(pfn))
    }

    /// Allocate a single frame.
    pub fn alloc_page(&mut self) -> Option<Pfn> {
        self.alloc_pages(0)
    }

    /// Return `2^order` frames starting at `base` to the free lists,
    /// merging with free buddies while climbing orders.
    ///
    /// # Panics
    /// If any frame in the run is not currently allocated; a double free is
    /// a kernel bug, not an environmental condition.
    pub fn free_pages(&mut self, base: Pfn, order: usize) {
        assert!(order < MAX_ORDER, "free_pages: order {order} out of range");
        let mut pfn = base.0;
        let mut order = order;

        self.bitmap.mark_free(pfn, 1 << order);

        while order + 1 < MAX_ORDER {
            let buddy = pfn ^ (1 << order);
            if buddy >= self.chunk_order.len()
                || self.bitmap.allocated(buddy)
                || self.chunk_order[buddy] != order as u8
            {
                break;
            }

            // Committed to merging: pull the buddy off its list and treat
            // the pair as one chunk at the next order up.
            self.unlink(buddy);
            pfn &= !(1 << order);
            order += 1;
        }

        self.enqueue(pfn, order);
    }

    /// Free a single frame.
    pub fn free_page(&mut self, base: Pfn) {
        self.free_pages(base, 0);
    }

    /// Grow coverage so frames up to `max_pfn` can be ballooned in. New
    /// frames come up allocated; the balloon driver frees them as the
    /// hypervisor populates them.
    pub fn extend_to(&mut self, max_pfn: usize) {
        if max_pfn > self.chunk_order.len() {
            self.bitmap.extend_to(max_pfn);
            self.links
                .resize(max_pfn, ChunkLink { next: NIL, prev: NIL });
            self.chunk_order.resize(max_pfn, NO_CHUNK);
        }
    }

    /// Verify free-list / bitmap agreement; every chunk base must be free
    /// in the bitmap and doubly linked consistently.
    ///
    /// # Panics
    /// On any inconsistency.
    pub fn sanity_check(&self) {
        for order in 0..MAX_ORDER {
            let mut prev = NIL;
            let mut head = self.free_heads[order];
            while head != NIL {
                let pfn = head as usize;
                assert!(!self.bitmap.allocated(pfn), "free chunk {pfn:#x} allocated in map");
                assert_eq!(self.chunk_order[pfn], order as u8);
                assert_eq!(self.links[pfn].prev, prev);
                prev = head;
                head = self.links[pfn].next;
            }
        }
    }

    fn enqueue(&mut self, pfn: usize, order: usize) {
        let head = self.free_heads[order];
        self.chunk_order[pfn] = order as u8;
        self.links[pfn] = ChunkLink { next: head, prev: NIL };
        if head != NIL {
            self.links[head as usize].prev = pfn as u32;
        }
        self.free_heads[order] = pfn as u32;
    }

    fn pop_head(&mut self, order: usize) -> usize {
        let pfn = self.free_heads[order] as usize;
        self.unlink(pfn);
        pfn
    }

    fn unlink(&mut self, pfn: usize) {
        let order = self.chunk_order[pfn];
        debug_assert_ne!(order, NO_CHUNK);
        let ChunkLink { next, prev } = self.links[pfn];
        if prev == NIL {
            self.free_heads[order as usize] = next;
        } else {
            self.links[prev as usize].next = next;
        }
        if next != NIL {
            self.links[next as usize].prev = prev;
        }
        self.chunk_order[pfn] = NO_CHUNK;
    }

    /// Snapshot of the free lists as `(order, base_pfn)` pairs, sorted.
    /// Test/diagnostic helper.
    #[must_use]
    pub fn free_chunks(&self) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        for order in 0..MAX_ORDER {
            let mut head = self.free_heads[order];
            while head != NIL {
                out.push((order, head as usize));
                head = self.links[head as usize].next;
            }
        }
        out.sort_unstable();
        out
    }
}

/// Growth hook consulted before an allocation is allowed to fail.
///
/// The balloon driver implements this; it may block (cooperatively) while
/// asking the hypervisor for more memory, but only when it is safe to do so
/// (interrupts enabled, no balloon operation already in flight). Policy
/// lives entirely in the implementation.
pub trait BalloonHook {
    /// Ensure at least `needed` frames are free, growing the domain if
    /// possible. Returns whether the allocation should proceed.
    fn chk_free_pages(&mut self, alloc: &mut BuddyAllocator, needed: usize) -> bool;
}

/// [`BuddyAllocator::alloc_pages`] preceded by the balloon check, the way
/// every allocation in the original kernel goes.
pub fn alloc_pages_balloon(
    alloc: &mut BuddyAllocator,
    balloon: &mut dyn BalloonHook,
    order: usize,
) -> Option<Pfn> {
    if !balloon.chk_free_pages(alloc, 1 << order) {
        log::warn!("cannot handle page request order {order}");
        return None;
    }
    alloc.alloc_pages(order)
}
