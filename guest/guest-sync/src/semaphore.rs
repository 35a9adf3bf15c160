use core::sync::atomic::{AtomicUsize, Ordering};

use crate::relax;

/// A counting semaphore over a bounded resource pool.
///
/// `acquire` spins until a unit is available; in the cooperative model the
/// spin yields to the scheduler between probes, so a blocked thread makes
/// no progress but lets everyone else run. A count of one gives the
/// mutual-exclusion token used to serialize ring message composition.
pub struct Semaphore {
    count: AtomicUsize,
}

impl Semaphore {
    #[must_use]
    pub const fn new(count: usize) -> Self {
        Self {
            count: AtomicUsize::new(count),
        }
    }

    /// Take one unit without blocking.
    #[inline]
    pub fn try_acquire(&self) -> bool {
        self.count
            .fetch_update(Ordering::Acquire, Ordering::Relaxed, |c| c.checked_sub(1))
            .is_ok()
    }

    /// Take one unit, waiting for another holder to release if none is free.
    pub fn acquire(&self) {
        while !self.try_acquire() {
            while self.count.load(Ordering::Relaxed) == 0 {
                relax();
            }
        }
    }

    /// Return one unit, waking any spinning acquirer.
    #[inline]
    pub fn release(&self) {
        self.count.fetch_add(1, Ordering::Release);
    }

    /// Units currently available (racy; for diagnostics only).
    #[inline]
    pub fn available(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }
}
