//! Grant allocation and the per-entry lifecycle.

use alloc::vec::Vec;
use core::sync::atomic::{Ordering, fence};

use guest_mm::{BuddyAllocator, Pfn};
use guest_sync::{Semaphore, SpinLock, relax};
use guest_vmem::{Mfn, P2mTable};
use thiserror::Error;

use crate::{GrantFlags, GrantRef, GrantSlot, NR_RESERVED_ENTRIES};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum GrantError {
    /// The peer still holds a mapping of the granted frame; the entry was
    /// not freed. Callers treat this as terminal for the grant.
    #[error("grant still in use by peer")]
    StillInUse,
}

const NIL: u32 = u32::MAX;

/// Index-linked free list over the entry array.
struct FreeList {
    head: u32,
    next: Vec<u32>,
}

impl FreeList {
    fn push(&mut self, r: GrantRef) {
        self.next[r.0 as usize] = self.head;
        self.head = r.0;
    }

    fn pop(&mut self) -> GrantRef {
        // The semaphore guarantees a free entry exists.
        debug_assert_ne!(self.head, NIL);
        let r = self.head;
        self.head = self.next[r as usize];
        GrantRef(r)
    }
}

/// The guest side of the grant table.
///
/// `shared` is the entry array visible to the hypervisor and the peer;
/// the free list and semaphore are guest-private. One instance per
/// kernel.
pub struct GrantTable<'a> {
    shared: &'a [GrantSlot],
    free: SpinLock<FreeList>,
    sem: Semaphore,
}

impl<'a> GrantTable<'a> {
    /// Wrap the shared entry array; all entries above the reserved range
    /// start out free.
    ///
    /// # Panics
    /// If the array is not larger than the reserved range.
    #[must_use]
    pub fn new(shared: &'a [GrantSlot]) -> Self {
        assert!(shared.len() > NR_RESERVED_ENTRIES);
        let mut list = FreeList {
            head: NIL,
            next: alloc::vec![NIL; shared.len()],
        };
        for r in (NR_RESERVED_ENTRIES..shared.len()).rev() {
            list.push(GrantRef(r as u32));
        }
        Self {
            shared,
            free: SpinLock::new(list),
            sem: Semaphore::new(shared.len() - NR_RESERVED_ENTRIES),
        }
    }

    /// Free entries right now (racy; diagnostics only).
    #[must_use]
    pub fn free_entries(&self) -> usize {
        self.sem.available()
    }

    fn get_free_entry(&self) -> GrantRef {
        self.sem.acquire();
        self.free.lock().pop()
    }

    fn put_free_entry(&self, r: GrantRef) {
        self.free.lock().push(r);
        self.sem.release();
    }

    /// Grant `domid` access to `frame`, blocking until an entry is free.
    ///
    /// The frame and domain are written before the flags, with a release
    /// fence in between, so the peer can never observe a half-initialized
    /// entry behind published flags.
    pub fn grant_access(&self, domid: u16, frame: Mfn, readonly: bool) -> GrantRef {
        let r = self.get_free_entry();
        let slot = &self.shared[r.0 as usize];
        slot.frame.store(frame.0 as u32, Ordering::Relaxed);
        slot.domid.store(domid, Ordering::Relaxed);
        fence(Ordering::Release);
        let mut flags = GrantFlags::PERMIT_ACCESS;
        if readonly {
            flags |= GrantFlags::READONLY;
        }
        slot.flags.store(flags.bits(), Ordering::Release);
        r
    }

    /// Offer `pfn` for ownership transfer to `domid`.
    pub fn grant_transfer(&self, domid: u16, pfn: Pfn) -> GrantRef {
        let r = self.get_free_entry();
        let slot = &self.shared[r.0 as usize];
        slot.frame.store(pfn.0 as u32, Ordering::Relaxed);
        slot.domid.store(domid, Ordering::Relaxed);
        fence(Ordering::Release);
        slot.flags
            .store(GrantFlags::ACCEPT_TRANSFER.bits(), Ordering::Release);
        r
    }

    /// Revoke an access grant and free its entry.
    ///
    /// Refuses (and keeps the entry granted) while the peer's reading or
    /// writing bits are set; freeing then would dangle a mapped frame.
    ///
    /// # Panics
    /// If `r` is reserved or out of range; ending a grant this code never
    /// issued is a kernel bug.
    pub fn end_access(&self, r: GrantRef) -> Result<(), GrantError> {
        let idx = r.0 as usize;
        assert!(
            (NR_RESERVED_ENTRIES..self.shared.len()).contains(&idx),
            "bad grant reference {r:?}"
        );
        let slot = &self.shared[idx];
        loop {
            let flags = slot.flags.load(Ordering::Acquire);
            if GrantFlags::from_bits_retain(flags)
                .intersects(GrantFlags::READING | GrantFlags::WRITING)
            {
                log::warn!("{r:?} still in use ({flags:#x})");
                return Err(GrantError::StillInUse);
            }
            if slot
                .flags
                .compare_exchange(flags, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        self.put_free_entry(r);
        Ok(())
    }

    /// Finish a transfer grant.
    ///
    /// If the peer never committed, the entry is reclaimed and `None`
    /// returned. Once committed, polls until the peer completes, then
    /// returns the frame the peer handed back.
    pub fn end_transfer(&self, r: GrantRef) -> Option<Mfn> {
        let idx = r.0 as usize;
        assert!(
            (NR_RESERVED_ENTRIES..self.shared.len()).contains(&idx),
            "bad grant reference {r:?}"
        );
        let slot = &self.shared[idx];

        let mut flags;
        loop {
            flags = slot.flags.load(Ordering::Acquire);
            if GrantFlags::from_bits_retain(flags).contains(GrantFlags::TRANSFER_COMMITTED) {
                break;
            }
            // Not picked up yet; try to pull the offer back.
            if slot
                .flags
                .compare_exchange(flags, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.put_free_entry(r);
                return None;
            }
        }

        while !GrantFlags::from_bits_retain(flags).contains(GrantFlags::TRANSFER_COMPLETED) {
            relax();
            flags = slot.flags.load(Ordering::Acquire);
        }

        // Completion observed with acquire ordering; the frame is valid.
        let frame = slot.frame.load(Ordering::Acquire);
        self.put_free_entry(r);
        Some(Mfn(frame as usize))
    }
}

/// Allocate a fresh page and grant the peer access to it; how a frontend
/// obtains each shared data page for a ring.
pub fn alloc_and_grant(
    table: &GrantTable<'_>,
    alloc: &mut BuddyAllocator,
    p2m: &P2mTable,
    domid: u16,
    readonly: bool,
) -> Option<(Pfn, GrantRef)> {
    let pfn = alloc.alloc_page()?;
    let r = table.grant_access(domid, p2m.pfn_to_mfn(pfn), readonly);
    Some((pfn, r))
}
