//! # Guest kernel synchronization primitives
//!
//! The guest runs cooperative green threads: nothing preempts a thread
//! except event-channel callbacks, and those never block. The primitives
//! here therefore come in two flavors:
//!
//! - [`SpinLock`] for short, non-blocking critical sections (free-list
//!   mutations, request-pool bookkeeping).
//! - [`Semaphore`] for scarce countable resources where the caller may
//!   have to wait for another thread to release a unit (grant slots, the
//!   per-direction ring composition tokens).
//!
//! Waiting is a spin-with-relax loop. On the real scheduler the relax hook
//! yields to the next runnable thread; hosted tests run on OS threads where
//! the pause instruction is good enough.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod semaphore;
mod spin_lock;

pub use semaphore::Semaphore;
pub use spin_lock::{SpinLock, SpinLockGuard};

/// Back off once inside a wait loop.
///
/// Single suspension point of the crate; a cooperative scheduler would hook
/// its yield here.
#[inline]
pub fn relax() {
    core::hint::spin_loop();
}
