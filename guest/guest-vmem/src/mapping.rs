//! PTE lookup, demand mapping, and range (un)mapping on top of the walker.

use alloc::vec::Vec;
use core::ops::ControlFlow;

use guest_mm::{PAGE_SHIFT, Pfn};

use crate::MapError;
use crate::addresses::{Level, VirtAddr, level_span};
use crate::page_entry::PageEntry;
use crate::walker::{FrameSource, MmuUpdate, MmuUpdater, PhysMapper, PteLoc, walk_range};

/// Entry updates queued per privileged batch. Bounded so the batch fits
/// comfortably on a kernel stack.
pub const MAP_BATCH: usize = 64;

/// Look up the leaf entry covering `va`.
///
/// Always yields exactly one leaf: a present mapping (level 1 or a large
/// page) or the first not-present entry on the path, whose level tells
/// how much of the hierarchy is missing.
pub fn get_pte<M: PhysMapper>(
    mapper: &mut M,
    root: Pfn,
    va: VirtAddr,
) -> (PageEntry, Level, PteLoc) {
    let flow = walk_range(mapper, root, va, va, &mut |_, _, lvl, _, loc, e| {
        ControlFlow::Break((*e, lvl, loc))
    });
    match flow {
        ControlFlow::Break(found) => found,
        // [va, va] visits at least one leaf.
        ControlFlow::Continue(()) => unreachable!("walk visited no entry for {va:?}"),
    }
}

/// Locate the level-1 entry for `va`, installing missing intermediate
/// tables from `frames` on the way down.
///
/// Each new table page is zeroed before it is linked into its parent. If
/// `va` is already covered by a present large page, that entry's location
/// is returned instead of splitting the mapping.
pub fn need_pte<M: PhysMapper>(
    mapper: &mut M,
    frames: &mut dyn FrameSource,
    root: Pfn,
    va: VirtAddr,
) -> Result<PteLoc, MapError> {
    let flow = walk_range(mapper, root, va, va, &mut |m, _, lvl, _, loc, e| {
        if lvl > 1 && !e.present() {
            let Some(f) = frames.alloc_table_frame() else {
                return ControlFlow::Break(Err(MapError::OutOfTableFrames));
            };
            m.zero_frame(f);
            *e = PageEntry::new_table(f);
            return ControlFlow::Continue(());
        }
        ControlFlow::Break(Ok(loc))
    });
    match flow {
        ControlFlow::Break(r) => r,
        ControlFlow::Continue(()) => unreachable!("walk visited no entry for {va:?}"),
    }
}

/// A fixed virtual-address window frames are bound into on demand.
#[derive(Copy, Clone, Debug)]
pub struct DemandRegion {
    base: VirtAddr,
    nr_pages: usize,
}

impl DemandRegion {
    #[must_use]
    pub const fn new(base: VirtAddr, nr_pages: usize) -> Self {
        Self { base, nr_pages }
    }

    #[must_use]
    pub const fn base(&self) -> VirtAddr {
        self.base
    }

    /// Reserve `n` contiguous virtual pages aligned to `align_pages`
    /// (a power of two), by scanning for a gap with no present mappings.
    ///
    /// The scan probes through [`get_pte`], so an entirely absent
    /// intermediate table skips its whole span in one step rather than
    /// page by page.
    pub fn allocate_ondemand<M: PhysMapper>(
        &self,
        mapper: &mut M,
        root: Pfn,
        n: usize,
        align_pages: usize,
    ) -> Option<VirtAddr> {
        let align = (align_pages as u64) << PAGE_SHIFT;
        let end = self.base.add_pages(self.nr_pages);
        let mut va = self.base.align_up(align);

        'candidate: while va.add_pages(n) <= end {
            let mut probe = va;
            while probe < va.add_pages(n) {
                let (entry, level, _) = get_pte(mapper, root, probe);
                let span = level_span(level);
                let span_end = (probe.as_u64() & !(span - 1)) + span;
                if entry.present() {
                    // Blocked; restart just past the blocking mapping.
                    va = VirtAddr::new(span_end).align_up(align);
                    continue 'candidate;
                }
                probe = VirtAddr::new(span_end);
            }
            return Some(va);
        }

        log::warn!("allocate_ondemand: no free virtual area of {n} pages");
        None
    }
}

/// Bind `n` frames into virtual memory starting at `va`.
///
/// The frame for page `i` is `frame_list[i * stride] + i * incr`, which
/// covers the common shapes: a dense list (`stride 1, incr 0`), one
/// contiguous run from a single base (`stride 0, incr 1`), and a strided
/// grant list. Entry permissions come from `prototype`; its frame field
/// is overwritten per page.
///
/// Updates are submitted in batches of [`MAP_BATCH`]. A rejected batch
/// aborts the call with the error; pages mapped by earlier batches stay
/// mapped, and the caller is expected to unmap the whole range if it
/// cannot use the partial result.
#[allow(clippy::too_many_arguments)]
pub fn do_map_frames<M: PhysMapper>(
    mapper: &mut M,
    frames: &mut dyn FrameSource,
    updater: &mut dyn MmuUpdater,
    root: Pfn,
    va: VirtAddr,
    frame_list: &[Pfn],
    stride: usize,
    incr: usize,
    n: usize,
    prototype: PageEntry,
) -> Result<(), MapError> {
    let mut batch: Vec<MmuUpdate> = Vec::with_capacity(MAP_BATCH.min(n));

    for i in 0..n {
        let frame = Pfn(frame_list[i * stride].0 + i * incr);
        let loc = need_pte(mapper, frames, root, va.add_pages(i))?;
        batch.push(MmuUpdate {
            loc,
            entry: prototype.with_frame(frame),
        });
        if batch.len() == MAP_BATCH {
            updater.apply(mapper, &batch)?;
            batch.clear();
        }
    }
    if !batch.is_empty() {
        updater.apply(mapper, &batch)?;
    }
    Ok(())
}

/// Reserve a demand-map gap and bind frames into it; the one-call path
/// device frontends use to map backend-granted pages.
#[allow(clippy::too_many_arguments)]
pub fn map_frames_ex<M: PhysMapper>(
    region: &DemandRegion,
    mapper: &mut M,
    frames: &mut dyn FrameSource,
    updater: &mut dyn MmuUpdater,
    root: Pfn,
    frame_list: &[Pfn],
    stride: usize,
    incr: usize,
    n: usize,
    align_pages: usize,
    prototype: PageEntry,
) -> Result<VirtAddr, MapError> {
    let va = region
        .allocate_ondemand(mapper, root, n, align_pages)
        .ok_or(MapError::NoVirtualSpace(n))?;
    do_map_frames(
        mapper, frames, updater, root, va, frame_list, stride, incr, n, prototype,
    )?;
    Ok(va)
}

/// Invalidate the `n` page mappings starting at `va` and flush their
/// translation-cache entries. Not-present entries in the range are
/// skipped.
pub fn unmap_frames<M: PhysMapper>(
    mapper: &mut M,
    updater: &mut dyn MmuUpdater,
    root: Pfn,
    va: VirtAddr,
    n: usize,
) -> Result<(), MapError> {
    let mut batch: Vec<MmuUpdate> = Vec::new();
    let to = va.add_pages(n - 1);
    let flow: ControlFlow<()> = walk_range(mapper, root, va, to, &mut |_, _, lvl, _, loc, e| {
        if lvl == 1 && e.present() {
            batch.push(MmuUpdate {
                loc,
                entry: PageEntry::new(),
            });
        }
        ControlFlow::Continue(())
    });
    debug_assert!(flow.is_continue());

    for chunk in batch.chunks(MAP_BATCH) {
        updater.apply(mapper, chunk)?;
    }
    for i in 0..n {
        mapper.flush_va(va.add_pages(i));
    }
    Ok(())
}

/// Drop write permission on every present level-1 mapping in
/// `[from, to]`, flushing each affected page. Used to protect the text
/// segment after startup.
pub fn set_range_readonly<M: PhysMapper>(mapper: &mut M, root: Pfn, from: VirtAddr, to: VirtAddr) {
    let mut flushed: Vec<VirtAddr> = Vec::new();
    let flow: ControlFlow<()> = walk_range(mapper, root, from, to, &mut |_, va, lvl, _, _, e| {
        if lvl == 1 && e.present() && e.writable() {
            e.set_writable(false);
            flushed.push(va);
        }
        ControlFlow::Continue(())
    });
    debug_assert!(flow.is_continue());
    for va in flushed {
        mapper.flush_va(va);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DirectUpdater;
    use crate::walker::tests::{TestFrames, TestPhys, map_2m, map_4k};

    const REGION: DemandRegion = DemandRegion::new(VirtAddr::new(0x8000_0000), 4096);

    #[test]
    fn get_pte_reports_missing_level() {
        let mut phys = TestPhys::new();
        let root = phys.new_table();
        let (e, lvl, _) = get_pte(&mut phys, root, VirtAddr::new(0x1000));
        assert!(!e.present());
        assert_eq!(lvl, 4);

        map_4k(&mut phys, root, VirtAddr::new(0x1000), Pfn(0x42));
        let (e, lvl, _) = get_pte(&mut phys, root, VirtAddr::new(0x1000));
        assert!(e.present());
        assert_eq!(lvl, 1);
        assert_eq!(e.frame(), Pfn(0x42));
    }

    #[test]
    fn need_pte_builds_the_path_once() {
        let mut phys = TestPhys::new();
        let root = phys.new_table();
        let mut frames = TestFrames::new();
        let va = VirtAddr::new(0x1234_5000);

        let loc = need_pte(&mut phys, &mut frames, root, va).unwrap();
        // Entry exists but is still not-present until someone writes it.
        assert!(!phys.table(loc.table).entry(loc.index).present());

        // A second call finds the same slot without allocating again.
        let loc2 = need_pte(&mut phys, &mut frames, root, va).unwrap();
        assert_eq!(loc, loc2);
    }

    #[test]
    fn need_pte_returns_large_page_entry() {
        let mut phys = TestPhys::new();
        let root = phys.new_table();
        let mut frames = TestFrames::new();
        let base = VirtAddr::new(0x4000_0000);
        map_2m(&mut phys, root, base, Pfn(0x200));

        let loc = need_pte(&mut phys, &mut frames, root, VirtAddr::new(0x4000_7000)).unwrap();
        assert!(phys.table(loc.table).entry(loc.index).large_page());
    }

    #[test]
    fn need_pte_fails_without_table_frames() {
        let mut phys = TestPhys::new();
        let root = phys.new_table();
        let mut frames = TestFrames::limited(1);
        let err = need_pte(&mut phys, &mut frames, root, VirtAddr::new(0)).unwrap_err();
        assert_eq!(err, MapError::OutOfTableFrames);
    }

    #[test]
    fn ondemand_gap_respects_alignment_and_blockers() {
        let mut phys = TestPhys::new();
        let root = phys.new_table();
        // Occupy the second page of the region.
        map_4k(&mut phys, root, REGION.base().add_pages(1), Pfn(0xaa));

        // One page fits right at the base.
        let va = REGION.allocate_ondemand(&mut phys, root, 1, 1).unwrap();
        assert_eq!(va, REGION.base());

        // Two contiguous pages must start past the blocker.
        let va = REGION.allocate_ondemand(&mut phys, root, 2, 1).unwrap();
        assert_eq!(va, REGION.base().add_pages(2));

        // 16-page alignment skips to the next aligned slot.
        let va = REGION.allocate_ondemand(&mut phys, root, 16, 16).unwrap();
        assert_eq!(va, REGION.base().add_pages(16));
    }

    #[test]
    fn ondemand_exhaustion_returns_none() {
        let mut phys = TestPhys::new();
        let root = phys.new_table();
        let small = DemandRegion::new(VirtAddr::new(0x8000_0000), 8);
        assert!(small.allocate_ondemand(&mut phys, root, 9, 1).is_none());
    }

    #[test]
    fn map_frames_round_trip() {
        let mut phys = TestPhys::new();
        let root = phys.new_table();
        let mut frames = TestFrames::new();
        let mut updater = DirectUpdater;
        let proto = PageEntry::new_leaf_rw(Pfn(0));

        // One contiguous physical run from a single base frame.
        let va = map_frames_ex(
            &REGION,
            &mut phys,
            &mut frames,
            &mut updater,
            root,
            &[Pfn(0x100)],
            0,
            1,
            3,
            1,
            proto,
        )
        .unwrap();

        for i in 0..3 {
            let (e, lvl, _) = get_pte(&mut phys, root, va.add_pages(i));
            assert_eq!(lvl, 1);
            assert_eq!(e.frame(), Pfn(0x100 + i));
            assert!(e.writable());
        }

        unmap_frames(&mut phys, &mut updater, root, va, 3).unwrap();
        for i in 0..3 {
            let (e, _, _) = get_pte(&mut phys, root, va.add_pages(i));
            assert!(!e.present());
        }
        assert_eq!(phys.flushes.len(), 3);
    }

    #[test]
    fn strided_frame_list() {
        let mut phys = TestPhys::new();
        let root = phys.new_table();
        let mut frames = TestFrames::new();
        let mut updater = DirectUpdater;
        let list = [Pfn(10), Pfn(99), Pfn(20), Pfn(99), Pfn(30)];

        let va = REGION.allocate_ondemand(&mut phys, root, 3, 1).unwrap();
        do_map_frames(
            &mut phys,
            &mut frames,
            &mut updater,
            root,
            va,
            &list,
            2,
            0,
            3,
            PageEntry::new_leaf_rw(Pfn(0)),
        )
        .unwrap();

        for (i, want) in [10, 20, 30].into_iter().enumerate() {
            let (e, _, _) = get_pte(&mut phys, root, va.add_pages(i));
            assert_eq!(e.frame(), Pfn(want));
        }
    }

    #[test]
    fn rejected_batch_leaves_partial_mappings() {
        /// Applies the first batch, rejects the second.
        struct FlakyUpdater {
            applied: usize,
        }
        impl MmuUpdater for FlakyUpdater {
            fn apply(
                &mut self,
                mapper: &mut dyn PhysMapper,
                updates: &[MmuUpdate],
            ) -> Result<(), MapError> {
                if self.applied > 0 {
                    return Err(MapError::UpdateRejected(self.applied));
                }
                self.applied += updates.len();
                DirectUpdater.apply(mapper, updates)
            }
        }

        let mut phys = TestPhys::new();
        let root = phys.new_table();
        let mut frames = TestFrames::new();
        let mut updater = FlakyUpdater { applied: 0 };

        let va = REGION.allocate_ondemand(&mut phys, root, MAP_BATCH + 8, 1).unwrap();
        let err = do_map_frames(
            &mut phys,
            &mut frames,
            &mut updater,
            root,
            va,
            &[Pfn(0x500)],
            0,
            1,
            MAP_BATCH + 8,
            PageEntry::new_leaf_rw(Pfn(0)),
        )
        .unwrap_err();
        assert_eq!(err, MapError::UpdateRejected(MAP_BATCH));

        // First batch landed, the rest did not; no rollback happens.
        let (e, _, _) = get_pte(&mut phys, root, va);
        assert!(e.present());
        let (e, _, _) = get_pte(&mut phys, root, va.add_pages(MAP_BATCH));
        assert!(!e.present());
    }

    #[test]
    fn readonly_range_clears_writable() {
        let mut phys = TestPhys::new();
        let root = phys.new_table();
        for i in 0..4 {
            map_4k(&mut phys, root, VirtAddr::new(i << 12), Pfn(0x10 + i as usize));
        }

        set_range_readonly(&mut phys, root, VirtAddr::new(0x1000), VirtAddr::new(0x2fff));
        for i in 0..4u64 {
            let (e, _, _) = get_pte(&mut phys, root, VirtAddr::new(i << 12));
            assert_eq!(e.writable(), !(1..=2).contains(&i));
        }
        assert_eq!(phys.flushes.len(), 2);
    }
}
