//! Per-page allocation bitmap.
//!
//! One bit per page frame, set when the frame is allocated. Ranges are
//! marked with word-granularity fills for the interior and partial masks at
//! both ends, so marking a multi-megabyte run touches each word once.

use alloc::vec::Vec;

const BITS_PER_WORD: usize = usize::BITS as usize;

/// Bit mask with all bits `>= n` set (`n < BITS_PER_WORD`).
#[inline]
const fn mask_high(n: usize) -> usize {
    !0 << n
}

/// Bit mask with all bits `< n` set (`n < BITS_PER_WORD`).
#[inline]
const fn mask_low(n: usize) -> usize {
    (1usize << n) - 1
}

/// Allocation state for every page frame up to a maximum PFN, plus the
/// free-page counter the balloon check consults.
pub struct AllocBitmap {
    words: Vec<usize>,
    nr_free: usize,
}

impl AllocBitmap {
    /// Create a bitmap covering `nr_pages` frames, all marked **allocated**.
    ///
    /// Initialization then frees exactly the usable RAM ranges into it, so
    /// holes and reserved regions stay allocated forever.
    #[must_use]
    pub fn new_all_allocated(nr_pages: usize) -> Self {
        let words = nr_pages.div_ceil(BITS_PER_WORD);
        Self {
            words: alloc::vec![!0; words],
            nr_free: 0,
        }
    }

    /// Number of frames the bitmap covers (rounded up to a full word).
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.words.len() * BITS_PER_WORD
    }

    /// Frames currently marked free.
    #[must_use]
    pub const fn nr_free_pages(&self) -> usize {
        self.nr_free
    }

    /// Whether `page` is marked allocated. Frames beyond the covered range
    /// count as allocated, which keeps buddy merging from walking off the
    /// end of memory.
    #[must_use]
    pub fn allocated(&self, page: usize) -> bool {
        self.words
            .get(page / BITS_PER_WORD)
            .is_none_or(|w| w & (1 << (page % BITS_PER_WORD)) != 0)
    }

    /// Mark `nr_pages` frames starting at `first_page` allocated.
    ///
    /// # Panics
    /// If any frame in the range is already allocated (double-alloc) or the
    /// range exceeds the bitmap; both are kernel bugs.
    pub fn mark_allocated(&mut self, first_page: usize, nr_pages: usize) {
        self.fill(first_page, nr_pages, true);
        self.nr_free -= nr_pages;
    }

    /// Mark `nr_pages` frames starting at `first_page` free.
    ///
    /// # Panics
    /// If any frame in the range is already free (double-free) or the range
    /// exceeds the bitmap.
    pub fn mark_free(&mut self, first_page: usize, nr_pages: usize) {
        self.fill(first_page, nr_pages, false);
        self.nr_free += nr_pages;
    }

    /// Extend coverage to `nr_pages` frames; new frames come up allocated.
    pub fn extend_to(&mut self, nr_pages: usize) {
        let words = nr_pages.div_ceil(BITS_PER_WORD);
        if words > self.words.len() {
            self.words.resize(words, !0);
        }
    }

    fn fill(&mut self, first_page: usize, nr_pages: usize, set: bool) {
        if nr_pages == 0 {
            return;
        }
        let end_page = first_page + nr_pages;
        assert!(
            end_page <= self.capacity(),
            "bitmap range {first_page:#x}+{nr_pages:#x} out of bounds"
        );

        let mut idx = first_page / BITS_PER_WORD;
        let start_off = first_page % BITS_PER_WORD;
        let end_idx = end_page / BITS_PER_WORD;
        let end_off = end_page % BITS_PER_WORD;

        if idx == end_idx {
            self.apply(idx, mask_low(end_off) & mask_high(start_off), set);
        } else {
            self.apply(idx, mask_high(start_off), set);
            idx += 1;
            while idx < end_idx {
                self.apply(idx, !0, set);
                idx += 1;
            }
            if end_off != 0 {
                self.apply(idx, mask_low(end_off), set);
            }
        }
    }

    fn apply(&mut self, idx: usize, mask: usize, set: bool) {
        let w = &mut self.words[idx];
        if set {
            assert_eq!(*w & mask, 0, "double allocation in bitmap word {idx}");
            *w |= mask;
        } else {
            assert_eq!(*w & mask, mask, "double free in bitmap word {idx}");
            *w &= !mask;
        }
    }
}
