//! Generic iterative page-table walker.
//!
//! One traversal engine serves every page-table use: looking up an
//! existing entry, installing missing intermediate tables, flipping
//! permission bits over a range, and tearing mappings down. The visitor
//! decides; the walker only navigates.

use core::ops::ControlFlow;

use guest_mm::Pfn;

use crate::addresses::{Level, TOP_LEVEL, VirtAddr, level_index, level_span};
use crate::page_entry::{PageEntry, PageTable};
use crate::MapError;

/// Access to page-table frame contents.
///
/// The kernel proper implements this over its direct physical map (with
/// machine-to-physical translation under paravirtualization); tests use a
/// frame-indexed arena. Either way the walker never chases raw pointers.
pub trait PhysMapper {
    /// Borrow the table page stored in `frame`.
    fn table(&self, frame: Pfn) -> &PageTable;

    /// Borrow the table page stored in `frame` mutably.
    ///
    /// This is the unprivileged view; entry writes that the hypervisor
    /// must validate go through an [`MmuUpdater`] instead.
    fn table_mut(&mut self, frame: Pfn) -> &mut PageTable;

    /// Clear a freshly allocated frame so it can be linked in as a table.
    fn zero_frame(&mut self, frame: Pfn);

    /// Drop the translation cache entry for `va` after an unmap or a
    /// permission tightening.
    fn flush_va(&mut self, va: VirtAddr);
}

/// Supplier of page frames for new intermediate tables.
pub trait FrameSource {
    fn alloc_table_frame(&mut self) -> Option<Pfn>;
    fn free_table_frame(&mut self, frame: Pfn);
}

/// Location of one page-table entry: which table frame, which slot.
///
/// The safe stand-in for the entry's address; pair it with the mapper (or
/// an updater batch) to read or rewrite the entry later.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PteLoc {
    pub table: Pfn,
    pub index: usize,
}

/// One queued privileged entry write.
#[derive(Copy, Clone, Debug)]
pub struct MmuUpdate {
    pub loc: PteLoc,
    pub entry: PageEntry,
}

/// Privileged page-table update mechanism.
///
/// Paravirtualized guests submit validated batches to the hypervisor;
/// hardware-virtualized guests write directly
/// ([`DirectUpdater`](crate::DirectUpdater)). A batch either applies fully
/// or fails as a unit from the caller's view, but updates from *earlier*
/// batches of the same logical operation stay applied.
pub trait MmuUpdater {
    fn apply(
        &mut self,
        mapper: &mut dyn PhysMapper,
        updates: &[MmuUpdate],
    ) -> Result<(), MapError>;
}

/// Visit every leaf entry covering `[from, to]`, inclusive of the page
/// containing `to`, in ascending virtual-address order.
///
/// A "leaf" is whatever terminates the walk for its address: a terminal
/// level-1 entry, a large-page entry, or a not-present entry at any
/// level. The visitor receives the covering address, the entry's level
/// and location, and the entry value itself; changes to the entry are
/// written back through the mapper. Leaf-ness is re-evaluated after the
/// visitor returns, so a visitor that replaces a not-present entry with a
/// table link makes the walker descend into the new table rather than
/// skip its span.
///
/// `ControlFlow::Break` from the visitor aborts the walk and is returned
/// as-is.
pub fn walk_range<M, F, B>(
    mapper: &mut M,
    root: Pfn,
    from: VirtAddr,
    to: VirtAddr,
    visit: &mut F,
) -> ControlFlow<B>
where
    M: PhysMapper,
    F: FnMut(&mut M, VirtAddr, Level, bool, PteLoc, &mut PageEntry) -> ControlFlow<B>,
{
    let mut tables = [root; TOP_LEVEL + 1];
    let mut level = TOP_LEVEL;
    let mut va = from.page_base().as_u64();
    let last = to.as_u64();

    while va <= last {
        let idx = level_index(VirtAddr::new(va), level);
        let before = mapper.table(tables[level]).entry(idx);
        let mut entry = before;

        if !entry.is_leaf(level) {
            level -= 1;
            tables[level] = entry.frame();
            continue;
        }

        let loc = PteLoc {
            table: tables[level],
            index: idx,
        };
        visit(mapper, VirtAddr::new(va), level, true, loc, &mut entry)?;
        if entry.into_bits() != before.into_bits() {
            mapper.table_mut(loc.table).set_entry(idx, entry);
        }

        // The visitor may have linked in a table; follow it.
        if !entry.is_leaf(level) {
            level -= 1;
            tables[level] = entry.frame();
            continue;
        }

        // Advance past everything this entry covers, climbing back up
        // whenever the step crossed a table boundary.
        let span = level_span(level);
        let Some(next) = (va & !(span - 1)).checked_add(span) else {
            break;
        };
        while level < TOP_LEVEL
            && level_index(VirtAddr::new(next), level) <= level_index(VirtAddr::new(va), level)
        {
            level += 1;
        }
        va = next;
    }

    ControlFlow::Continue(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use guest_mm::PAGE_SHIFT;
    use std::collections::HashMap;

    /// Arena-backed physical memory: table pages keyed by frame number.
    pub struct TestPhys {
        tables: HashMap<usize, PageTable>,
        next_frame: usize,
        pub flushes: Vec<VirtAddr>,
    }

    impl TestPhys {
        pub fn new() -> Self {
            Self {
                tables: HashMap::new(),
                next_frame: 0x1000,
                flushes: Vec::new(),
            }
        }

        /// Allocate a fresh table frame outside the walker (test setup).
        pub fn new_table(&mut self) -> Pfn {
            let f = Pfn(self.next_frame);
            self.next_frame += 1;
            self.tables.insert(f.0, PageTable::empty());
            f
        }
    }

    impl PhysMapper for TestPhys {
        fn table(&self, frame: Pfn) -> &PageTable {
            &self.tables[&frame.0]
        }

        fn table_mut(&mut self, frame: Pfn) -> &mut PageTable {
            self.tables.get_mut(&frame.0).expect("unknown table frame")
        }

        fn zero_frame(&mut self, frame: Pfn) {
            self.tables.insert(frame.0, PageTable::empty());
        }

        fn flush_va(&mut self, va: VirtAddr) {
            self.flushes.push(va);
        }
    }

    /// Hands out frame numbers from a private counter, optionally bounded.
    pub struct TestFrames {
        next: usize,
        left: usize,
    }

    impl TestFrames {
        pub fn new() -> Self {
            Self {
                next: 0x8000,
                left: usize::MAX,
            }
        }

        pub fn limited(count: usize) -> Self {
            Self {
                next: 0x8000,
                left: count,
            }
        }
    }

    impl FrameSource for TestFrames {
        fn alloc_table_frame(&mut self) -> Option<Pfn> {
            if self.left == 0 {
                return None;
            }
            self.left -= 1;
            let f = Pfn(self.next);
            self.next += 1;
            Some(f)
        }

        fn free_table_frame(&mut self, _frame: Pfn) {}
    }

    /// Hand-build a 4-level path mapping `va` to `frame` at level 1.
    pub fn map_4k(phys: &mut TestPhys, root: Pfn, va: VirtAddr, frame: Pfn) {
        let mut table = root;
        for level in (2..=TOP_LEVEL).rev() {
            let idx = level_index(va, level);
            let e = phys.table(table).entry(idx);
            let next = if e.present() {
                e.frame()
            } else {
                let f = phys.new_table();
                phys.table_mut(table).set_entry(idx, PageEntry::new_table(f));
                f
            };
            table = next;
        }
        let idx = level_index(va, 1);
        phys.table_mut(table)
            .set_entry(idx, PageEntry::new_leaf_rw(frame));
    }

    /// Install a 2 MiB large-page leaf at level 2.
    pub fn map_2m(phys: &mut TestPhys, root: Pfn, va: VirtAddr, frame: Pfn) {
        let mut table = root;
        for level in (3..=TOP_LEVEL).rev() {
            let idx = level_index(va, level);
            let e = phys.table(table).entry(idx);
            let next = if e.present() {
                e.frame()
            } else {
                let f = phys.new_table();
                phys.table_mut(table).set_entry(idx, PageEntry::new_table(f));
                f
            };
            table = next;
        }
        let idx = level_index(va, 2);
        let leaf = PageEntry::new_leaf_rw(frame).with_large_page(true);
        phys.table_mut(table).set_entry(idx, leaf);
    }

    fn collect_leaves(
        phys: &mut TestPhys,
        root: Pfn,
        from: VirtAddr,
        to: VirtAddr,
    ) -> Vec<(u64, Level, bool)> {
        let mut out = Vec::new();
        let flow: ControlFlow<()> = walk_range(phys, root, from, to, &mut |_, va, lvl, leaf, _, e| {
            out.push((va.as_u64(), lvl, e.present()));
            assert!(leaf);
            ControlFlow::Continue(())
        });
        assert!(flow.is_continue());
        out
    }

    #[test]
    fn single_page_walk_visits_one_leaf() {
        let mut phys = TestPhys::new();
        let root = phys.new_table();
        let va = VirtAddr::new(0x4020_3000);
        map_4k(&mut phys, root, va, Pfn(0x77));

        let leaves = collect_leaves(&mut phys, root, va, va);
        assert_eq!(leaves, vec![(va.as_u64(), 1, true)]);
    }

    #[test]
    fn large_page_reports_level_two() {
        let mut phys = TestPhys::new();
        let root = phys.new_table();
        let va = VirtAddr::new(0x4000_0000);
        map_2m(&mut phys, root, va, Pfn(0x200));

        let leaves = collect_leaves(&mut phys, root, va, va);
        assert_eq!(leaves, vec![(va.as_u64(), 2, true)]);
        // Any address inside the large page resolves to the same leaf.
        let inner = VirtAddr::new(0x4000_0000 + 0x12_3456);
        let leaves = collect_leaves(&mut phys, root, inner, inner);
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].1, 2);
    }

    #[test]
    fn range_walk_crosses_table_boundary() {
        let mut phys = TestPhys::new();
        let root = phys.new_table();
        // Map the last page of one L1 table and the first of the next.
        let a = VirtAddr::new(0x1ff << PAGE_SHIFT);
        let b = VirtAddr::new(0x200 << PAGE_SHIFT);
        map_4k(&mut phys, root, a, Pfn(1));
        map_4k(&mut phys, root, b, Pfn(2));

        let leaves = collect_leaves(&mut phys, root, a, b);
        assert_eq!(
            leaves,
            vec![(a.as_u64(), 1, true), (b.as_u64(), 1, true)]
        );
    }

    #[test]
    fn unmapped_region_is_one_high_level_leaf() {
        let mut phys = TestPhys::new();
        let root = phys.new_table();
        // Nothing mapped: the whole first 512 GiB is one not-present L4
        // entry, visited once no matter how wide the range.
        let leaves = collect_leaves(
            &mut phys,
            root,
            VirtAddr::new(0),
            VirtAddr::new(level_span(4) - 1),
        );
        assert_eq!(leaves, vec![(0, 4, false)]);
    }

    #[test]
    fn break_propagates_and_stops() {
        let mut phys = TestPhys::new();
        let root = phys.new_table();
        for i in 0..4 {
            map_4k(
                &mut phys,
                root,
                VirtAddr::new((i as u64) << PAGE_SHIFT),
                Pfn(i + 1),
            );
        }
        let mut seen = 0;
        let flow = walk_range(
            &mut phys,
            root,
            VirtAddr::new(0),
            VirtAddr::new(3 << PAGE_SHIFT),
            &mut |_, _, _, _, _, e| {
                seen += 1;
                if e.frame() == Pfn(2) {
                    ControlFlow::Break(e.frame())
                } else {
                    ControlFlow::Continue(())
                }
            },
        );
        assert_eq!(flow, ControlFlow::Break(Pfn(2)));
        assert_eq!(seen, 2);
    }

    #[test]
    fn walker_follows_table_installed_by_visitor() {
        let mut phys = TestPhys::new();
        let root = phys.new_table();
        let va = VirtAddr::new(0x7000);
        let mut frames = TestFrames::new();
        let mut levels = Vec::new();

        let flow: ControlFlow<()> =
            walk_range(&mut phys, root, va, va, &mut |m, _, lvl, _, _, e| {
                levels.push(lvl);
                if lvl > 1 && !e.present() {
                    let f = frames.alloc_table_frame().unwrap();
                    m.zero_frame(f);
                    *e = PageEntry::new_table(f);
                }
                ControlFlow::Continue(())
            });
        assert!(flow.is_continue());
        // Visited the not-present entry at each level on the way down.
        assert_eq!(levels, vec![4, 3, 2, 1]);
    }
}
