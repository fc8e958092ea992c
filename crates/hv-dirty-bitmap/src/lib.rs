#![forbid(unsafe_code)]

//! Per-slot dirty page bitmaps and the clear-window alignment algorithm.
//!
//! The hypervisor reports dirty pages in 64-bit-word-aligned chunks regardless of the host word
//! size, so every bitmap here is sized as `round_up(pages, 64) / 8` bytes and stored as `u64`
//! words. The clear path has the non-obvious part: the kernel's clear-dirty-log call only accepts
//! ranges whose start is aligned to a 64-page boundary and whose length is either a 64-page
//! multiple or runs to the end of the slot. [`ClearWindow`] computes the smallest such window
//! covering a caller's arbitrary `(start, count)` range; callers then either pass a word slice
//! straight out of the live bitmap (fast path) or build a padded copy via
//! [`DirtyBitmap::copy_window`] (slow path) so that the alignment padding is never actually
//! cleared on the kernel side.

use core::fmt;

/// Alignment granule (in pages) required by the kernel's clear-dirty-log interface.
pub const CLEAR_ALIGN_PAGES: u64 = 64;

const WORD_BITS: u64 = 64;

/// Errors from bitmap construction and range operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitmapError {
    /// The requested page range does not fit within the bitmap.
    RangeOutOfBounds { start: u64, count: u64, pages: u64 },
}

impl fmt::Display for BitmapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BitmapError::RangeOutOfBounds { start, count, pages } => write!(
                f,
                "page range out of bounds: start={start} count={count} pages={pages}"
            ),
        }
    }
}

impl std::error::Error for BitmapError {}

/// One bit per guest page, set when the page has been written since the last clear.
///
/// Storage is always a whole number of `u64` words covering `round_up(pages, 64)` bits; the
/// trailing pad bits beyond `pages` are kept at zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirtyBitmap {
    pages: u64,
    words: Box<[u64]>,
}

impl DirtyBitmap {
    /// Allocate an all-clear bitmap for `pages` pages.
    pub fn new(pages: u64) -> Self {
        let words = pages.div_ceil(WORD_BITS) as usize;
        Self {
            pages,
            words: vec![0u64; words].into_boxed_slice(),
        }
    }

    /// Number of pages tracked.
    pub fn pages(&self) -> u64 {
        self.pages
    }

    /// Backing storage size in bytes (`round_up(pages, 64) / 8`).
    pub fn byte_len(&self) -> usize {
        self.words.len() * 8
    }

    /// Backing words, least-significant bit of word 0 = page 0.
    pub fn words(&self) -> &[u64] {
        &self.words
    }

    #[inline]
    fn index(page: u64) -> (usize, u32) {
        ((page / WORD_BITS) as usize, (page % WORD_BITS) as u32)
    }

    /// Mark `page` dirty.
    pub fn set(&mut self, page: u64) {
        debug_assert!(page < self.pages);
        let (w, b) = Self::index(page);
        self.words[w] |= 1u64 << b;
    }

    /// Test whether `page` is dirty.
    pub fn test(&self, page: u64) -> bool {
        let (w, b) = Self::index(page);
        self.words[w] & (1u64 << b) != 0
    }

    /// True when no page is dirty.
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Total number of dirty pages.
    pub fn count_ones(&self) -> u64 {
        self.words.iter().map(|w| w.count_ones() as u64).sum()
    }

    /// Iterate over dirty page numbers in ascending order.
    pub fn iter_ones(&self) -> impl Iterator<Item = u64> + '_ {
        self.words.iter().enumerate().flat_map(|(wi, &word)| {
            let base = wi as u64 * WORD_BITS;
            (0..WORD_BITS).filter_map(move |b| (word & (1u64 << b) != 0).then_some(base + b))
        })
    }

    /// Reset every bit to zero.
    pub fn clear_all(&mut self) {
        self.words.fill(0);
    }

    /// Mark every page dirty. Trailing pad bits stay clear.
    pub fn set_all(&mut self) {
        self.words.fill(u64::MAX);
        let tail = self.pages % WORD_BITS;
        if tail != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= range_mask(0, tail as u32 - 1);
            }
        }
    }

    /// Merge another bitmap of the same geometry via logical OR.
    pub fn or_assign(&mut self, other: &DirtyBitmap) {
        debug_assert_eq!(self.pages, other.pages);
        self.or_words(&other.words);
    }

    /// Merge a kernel-reported bitmap into this one via logical OR.
    ///
    /// `src` may be shorter than the backing storage (a kernel that reports fewer trailing words
    /// simply contributes nothing there) but must not be longer.
    pub fn or_words(&mut self, src: &[u64]) {
        debug_assert!(src.len() <= self.words.len());
        for (dst, &s) in self.words.iter_mut().zip(src) {
            *dst |= s;
        }
    }

    /// Clear exactly `[start, start + count)`. Bits outside the range never change.
    pub fn clear_range(&mut self, start: u64, count: u64) -> Result<(), BitmapError> {
        let end = start
            .checked_add(count)
            .filter(|&e| e <= self.pages)
            .ok_or(BitmapError::RangeOutOfBounds {
                start,
                count,
                pages: self.pages,
            })?;
        if count == 0 {
            return Ok(());
        }
        let (first_word, first_bit) = Self::index(start);
        let (last_word, last_bit) = Self::index(end - 1);
        if first_word == last_word {
            let mask = range_mask(first_bit, last_bit);
            self.words[first_word] &= !mask;
        } else {
            self.words[first_word] &= !range_mask(first_bit, 63);
            for w in &mut self.words[first_word + 1..last_word] {
                *w = 0;
            }
            self.words[last_word] &= !range_mask(0, last_bit);
        }
        Ok(())
    }

    /// Build the slow-path temporary bitmap for a kernel clear call.
    ///
    /// Copies `num_pages` bits starting at `first_page` (which must be 64-page aligned, so this is
    /// a word-range copy) and zeroes the first `lead_clear` bits of the copy. Those leading bits
    /// exist only to satisfy the kernel's alignment requirement; clearing unknown dirty bits there
    /// would lose track of guest writes that have not yet been pulled into this bitmap.
    pub fn copy_window(&self, first_page: u64, num_pages: u64, lead_clear: u64) -> Vec<u64> {
        debug_assert_eq!(first_page % CLEAR_ALIGN_PAGES, 0);
        debug_assert!(lead_clear < num_pages);
        let first_word = (first_page / WORD_BITS) as usize;
        let nwords = num_pages.div_ceil(WORD_BITS) as usize;
        let mut out = vec![0u64; nwords];
        let avail = self.words.len().saturating_sub(first_word).min(nwords);
        out[..avail].copy_from_slice(&self.words[first_word..first_word + avail]);
        // Zero the alignment padding at the front of the window.
        let mut remaining = lead_clear;
        for w in out.iter_mut() {
            if remaining == 0 {
                break;
            }
            if remaining >= WORD_BITS {
                *w = 0;
                remaining -= WORD_BITS;
            } else {
                *w &= !range_mask(0, remaining as u32 - 1);
                remaining = 0;
            }
        }
        out
    }
}

/// Bit mask covering bits `[lo, hi]` inclusive within one word.
#[inline]
fn range_mask(lo: u32, hi: u32) -> u64 {
    debug_assert!(lo <= hi && hi < 64);
    let span = hi - lo + 1;
    if span == 64 {
        u64::MAX
    } else {
        ((1u64 << span) - 1) << lo
    }
}

/// The 64-page-aligned window the kernel-facing clear call must use for a caller range.
///
/// `first_page` is `start` rounded down to a [`CLEAR_ALIGN_PAGES`] boundary, `start_delta` is the
/// number of pad pages that rounding introduced, and `num_pages` is the requested length plus the
/// pad, rounded up to a 64-page multiple and capped at the slot's end (the kernel accepts a
/// non-multiple length only when it runs to the end of the slot).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClearWindow {
    pub first_page: u64,
    pub num_pages: u64,
    pub start_delta: u64,
    requested: u64,
}

impl ClearWindow {
    /// Compute the window for clearing `[start, start + count)` within a slot of `slot_pages`
    /// pages. Returns an error if the caller range does not fit in the slot.
    pub fn compute(start: u64, count: u64, slot_pages: u64) -> Result<Self, BitmapError> {
        let oob = BitmapError::RangeOutOfBounds {
            start,
            count,
            pages: slot_pages,
        };
        let end = start.checked_add(count).filter(|&e| e <= slot_pages).ok_or(oob)?;
        debug_assert!(end <= slot_pages);

        let first_page = start & !(CLEAR_ALIGN_PAGES - 1);
        let start_delta = start - first_page;
        let mut num_pages =
            (count + start_delta).div_ceil(CLEAR_ALIGN_PAGES) * CLEAR_ALIGN_PAGES;
        if num_pages > slot_pages - first_page {
            num_pages = slot_pages - first_page;
        }
        Ok(Self {
            first_page,
            num_pages,
            start_delta,
            requested: count,
        })
    }

    /// True when the window equals the caller's range exactly, so a pointer into the live bitmap
    /// can be handed to the kernel as-is.
    pub fn is_fast_path(&self) -> bool {
        self.start_delta == 0 && self.num_pages == self.requested
    }

    /// Number of `u64` words covering the window.
    pub fn word_len(&self) -> usize {
        self.num_pages.div_ceil(WORD_BITS) as usize
    }

    /// Word offset of the window within the slot bitmap.
    pub fn first_word(&self) -> usize {
        (self.first_page / WORD_BITS) as usize
    }
}
