//! PFN ↔ MFN indirection for paravirtualized guests.
//!
//! The hypervisor hands a paravirtualized guest an arbitrary set of
//! machine frames; the guest keeps a dense physical-to-machine table so
//! page-table entries (which must hold machine frames) can be built from
//! guest frame numbers. Hardware-virtualized guests use the identity
//! mapping.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use guest_mm::Pfn;

/// A machine frame number, the hypervisor's view of a frame.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct Mfn(pub usize);

impl core::fmt::Debug for Mfn {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "mfn {:#x}", self.0)
    }
}

/// Dense PFN→MFN table with a reverse index.
pub struct P2mTable {
    forward: Vec<Mfn>,
    reverse: BTreeMap<usize, Pfn>,
}

impl P2mTable {
    /// Build from the hypervisor-provided machine frame list, indexed by
    /// PFN.
    #[must_use]
    pub fn new(frames: impl IntoIterator<Item = Mfn>) -> Self {
        let forward: Vec<Mfn> = frames.into_iter().collect();
        let reverse = forward
            .iter()
            .enumerate()
            .map(|(pfn, &mfn)| (mfn.0, Pfn(pfn)))
            .collect();
        Self { forward, reverse }
    }

    /// Identity table for hardware-virtualized guests.
    #[must_use]
    pub fn identity(nr_frames: usize) -> Self {
        Self::new((0..nr_frames).map(Mfn))
    }

    #[must_use]
    pub fn nr_frames(&self) -> usize {
        self.forward.len()
    }

    /// Machine frame backing `pfn`.
    ///
    /// # Panics
    /// If `pfn` is beyond the table; translating an unknown frame is a
    /// kernel bug.
    #[must_use]
    pub fn pfn_to_mfn(&self, pfn: Pfn) -> Mfn {
        self.forward[pfn.0]
    }

    /// Guest frame a machine frame currently backs, if any.
    #[must_use]
    pub fn mfn_to_pfn(&self, mfn: Mfn) -> Option<Pfn> {
        self.reverse.get(&mfn.0).copied()
    }

    /// Rebind `pfn` to a new machine frame, as after a balloon or grant
    /// transfer exchanged the backing frame.
    pub fn set(&mut self, pfn: Pfn, mfn: Mfn) {
        let old = core::mem::replace(&mut self.forward[pfn.0], mfn);
        self.reverse.remove(&old.0);
        self.reverse.insert(mfn.0, pfn);
    }
}
