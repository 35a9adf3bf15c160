//! # Grant table
//!
//! Grants are the capability system of inter-domain I/O: a grant entry
//! names one frame, one peer domain, and what the peer may do with the
//! frame (map it read-only or read-write, or take ownership of it). The
//! entry array lives in memory shared with the hypervisor, which updates
//! the activity bits as the peer maps and unmaps the frame; everything
//! the guest writes there must therefore be published with the proper
//! ordering, and nothing may be torn down while the peer's activity bits
//! are still set.
//!
//! Entries are a scarce fixed pool. Callers block on a counting semaphore
//! when none are free rather than growing the table.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod table;

pub use table::{GrantError, GrantTable, alloc_and_grant};

use core::sync::atomic::{AtomicU16, AtomicU32, Ordering};

use bitflags::bitflags;
use guest_mm::PAGE_SIZE;

/// Frames backing the shared grant-entry array.
pub const NR_GRANT_FRAMES: usize = 4;

/// Entries in the shared array.
pub const NR_GRANT_ENTRIES: usize = NR_GRANT_FRAMES * PAGE_SIZE / core::mem::size_of::<GrantSlot>();

/// Low references are reserved for special uses (console, xenstore);
/// the allocator never hands them out.
pub const NR_RESERVED_ENTRIES: usize = 8;

bitflags! {
    /// Grant-entry flag word, hypervisor ABI.
    ///
    /// The low two bits are the entry type; the meaning of the bits above
    /// depends on it. `TRANSFER_COMMITTED`/`TRANSFER_COMPLETED` reuse the
    /// bit positions of `READONLY`/`READING` on transfer-type entries.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct GrantFlags: u16 {
        /// Peer may map the frame (access-type entry).
        const PERMIT_ACCESS = 1;
        /// Peer may take ownership of the frame (transfer-type entry).
        const ACCEPT_TRANSFER = 2;
        /// Access entry: peer may only map read-only.
        const READONLY = 1 << 2;
        /// Access entry: peer currently holds a read mapping.
        const READING = 1 << 3;
        /// Access entry: peer currently holds a write mapping.
        const WRITING = 1 << 4;
        /// Transfer entry: the peer has started the transfer.
        const TRANSFER_COMMITTED = 1 << 2;
        /// Transfer entry: the transferred frame is ready to be read.
        const TRANSFER_COMPLETED = 1 << 3;
    }
}

/// One entry of the shared grant array.
///
/// Written by the guest, read and flag-updated by the hypervisor, so all
/// fields are atomics. `frame` and `domid` must be visible before the
/// flags publish the entry; the flag store carries release ordering.
#[repr(C)]
pub struct GrantSlot {
    flags: AtomicU16,
    domid: AtomicU16,
    frame: AtomicU32,
}

impl GrantSlot {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            flags: AtomicU16::new(0),
            domid: AtomicU16::new(0),
            frame: AtomicU32::new(0),
        }
    }

    /// Current flag word; acquire-ordered so data the flags guard (the
    /// transferred frame number) is safe to read afterwards.
    #[must_use]
    pub fn flags(&self) -> GrantFlags {
        GrantFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    /// Peer-side helper: set activity/transfer bits the way the
    /// hypervisor would. Test and diagnostic use only.
    pub fn peer_set_flags(&self, flags: GrantFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// Peer-side helper: clear activity bits.
    pub fn peer_clear_flags(&self, flags: GrantFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Peer-side helper: store the frame resulting from a transfer.
    pub fn peer_set_frame(&self, frame: u32) {
        self.frame.store(frame, Ordering::Release);
    }
}

impl Default for GrantSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// A grant reference: an index into the shared entry array, handed to
/// the peer domain so it can name the granted frame.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct GrantRef(pub u32);

impl core::fmt::Debug for GrantRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "gref {}", self.0)
    }
}
