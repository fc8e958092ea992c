//! Region-to-slot geometry: page alignment of region events and splitting into
//! maximum-slot-size chunks.
//!
//! The same split must come out every time a range is revisited: the sync and clear paths look
//! slots up by exact `(start, size)` match, so chunk boundaries are a pure function of the
//! aligned range and the configured maximum.

/// Align a region to page boundaries: round the start up, truncate the size down. A region
/// entirely smaller than one page after alignment is a no-op (`None`).
pub(crate) fn align_region(addr: u64, size: u64, page_size: u64) -> Option<(u64, u64)> {
    let mask = page_size - 1;
    let aligned = addr.checked_add(mask)? & !mask;
    let delta = aligned - addr;
    if delta > size {
        return None;
    }
    let aligned_size = (size - delta) & !mask;
    (aligned_size != 0).then_some((aligned, aligned_size))
}

/// Consecutive `(start, len)` chunks of at most `max_slot_size` covering an aligned range.
pub(crate) fn chunks(start: u64, size: u64, max_slot_size: Option<u64>) -> Chunks {
    Chunks {
        next: start,
        remaining: size,
        max: max_slot_size.unwrap_or(u64::MAX),
    }
}

pub(crate) struct Chunks {
    next: u64,
    remaining: u64,
    max: u64,
}

impl Iterator for Chunks {
    type Item = (u64, u64);

    fn next(&mut self) -> Option<(u64, u64)> {
        if self.remaining == 0 {
            return None;
        }
        let len = self.remaining.min(self.max);
        let start = self.next;
        self.next += len;
        self.remaining -= len;
        Some((start, len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn sub_page_regions_vanish() {
        assert_eq!(align_region(0x1001, 4095, 4096), None);
        assert_eq!(align_region(0x1001, 4096, 4096), None);
        assert_eq!(align_region(0, 0, 4096), None);
    }

    #[test]
    fn misaligned_region_shrinks_to_page_bounds() {
        // 3 pages starting 1 byte past a page boundary: start rounds up a page, size truncates
        // to 2 pages.
        let (start, size) = align_region(0x1001, 3 * 4096, 4096).unwrap();
        assert_eq!(start, 0x2000);
        assert_eq!(size, 2 * 4096);
    }

    #[test]
    fn aligned_region_is_untouched() {
        assert_eq!(
            align_region(0x10000, 0x8000, 4096),
            Some((0x10000, 0x8000))
        );
    }

    #[test]
    fn chunking_respects_max_slot_size() {
        let out: Vec<_> = chunks(0x1000, 0x5000, Some(0x2000)).collect();
        assert_eq!(
            out,
            vec![(0x1000, 0x2000), (0x3000, 0x2000), (0x5000, 0x1000)]
        );
        let unbounded: Vec<_> = chunks(0x1000, 0x5000, None).collect();
        assert_eq!(unbounded, vec![(0x1000, 0x5000)]);
    }

    proptest! {
        // Aligning then chunking then re-joining reproduces exactly the page-aligned range, with
        // contiguous, non-overlapping chunks.
        #[test]
        fn alignment_and_chunking_are_idempotent(
            addr in 0u64..(1 << 40),
            size in 1u64..(1 << 30),
            max_pages in 1u64..512,
        ) {
            let page = 4096u64;
            let Some((start, len)) = align_region(addr, size, page) else {
                // Only sub-page leftovers may vanish.
                prop_assert!(size < 2 * page);
                return Ok(());
            };
            prop_assert_eq!(start % page, 0);
            prop_assert_eq!(len % page, 0);
            prop_assert!(start >= addr);
            prop_assert!(start + len <= addr + size);

            let max = max_pages * page;
            let parts: Vec<_> = chunks(start, len, Some(max)).collect();
            let mut cursor = start;
            for &(cstart, clen) in &parts {
                prop_assert_eq!(cstart, cursor, "chunks must be contiguous and non-overlapping");
                prop_assert!(clen <= max);
                prop_assert!(clen > 0);
                cursor += clen;
            }
            prop_assert_eq!(cursor, start + len, "chunks must re-join to the aligned range");

            // Revisiting the same region must reproduce the same split.
            let again: Vec<_> = chunks(start, len, Some(max)).collect();
            prop_assert_eq!(parts, again);
        }
    }
}
