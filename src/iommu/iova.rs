// SPDX-License-Identifier: MPL-2.0

//! IOVA allocation within kernel-permitted ranges.
//!
//! Two disciplines share the same range list. Sticky allocations come from
//! a linear cursor that walks the ranges bottom-up and never frees;
//! fragmentation is tolerated because sticky mappings are long-lived and
//! infrequent. Ephemeral allocations come from a watermark growing downward
//! from the top of the last range; an IOVA handed out there is not reused
//! until every ephemeral mapping of the batch is gone, which avoids a race
//! between a late device write and a new mapping at the same address.

use log::{debug, info};

use crate::{Error, Result, mem};

/// Default permitted interval when the kernel cannot report one: be
/// conservative and stay within 39 address bits.
pub(crate) const IOVA_MIN: u64 = 0x10000;
pub(crate) const IOVA_MAX_39BITS: u64 = 1 << 39;

/// A kernel-permitted IOVA interval; both bounds are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IovaRange {
    pub start: u64,
    pub last: u64,
}

#[derive(Debug)]
pub(crate) struct IovaAllocator {
    ranges: Vec<IovaRange>,
    next_sticky: u64,
    next_ephemeral: u64,
    ephemeral_top: u64,
}

impl IovaAllocator {
    /// Builds the allocator over the transport-reported ranges.
    ///
    /// The range list is immutable afterwards. Ranges may arrive in any
    /// order; they are sorted once here.
    pub(crate) fn new(mut ranges: Vec<IovaRange>) -> Self {
        if ranges.is_empty() {
            info!("no iova ranges reported; using conservative default");
            ranges.push(IovaRange {
                start: IOVA_MIN,
                last: IOVA_MAX_39BITS - 1,
            });
        }
        ranges.sort_by_key(|r| r.start);

        let top = ranges
            .last()
            .unwrap()
            .last
            .checked_add(1)
            .unwrap_or_else(|| u64::MAX & !(mem::page_size() as u64 - 1));

        Self {
            ranges,
            next_sticky: IOVA_MIN,
            next_ephemeral: top,
            ephemeral_top: top,
        }
    }

    pub(crate) fn ranges(&self) -> &[IovaRange] {
        &self.ranges
    }

    /// Allocates `len` bytes of sticky IOVA space.
    ///
    /// `len` must be a positive multiple of the page size. The cursor only
    /// moves on success.
    pub(crate) fn alloc_sticky(&mut self, len: u64) -> Result<u64> {
        if len == 0 || len % mem::page_size() as u64 != 0 {
            debug!("sticky iova length {:#x} is not page aligned", len);
            return Err(Error::InvalidArgs);
        }

        let last_range = self.ranges.len() - 1;
        for (i, r) in self.ranges.iter().enumerate() {
            // The tail of the last range above the ephemeral watermark is
            // reserved for in-flight ephemeral mappings.
            let last = if i == last_range {
                r.last.min(self.next_ephemeral.saturating_sub(1))
            } else {
                r.last
            };

            if last < self.next_sticky {
                continue;
            }
            let next = self.next_sticky.max(r.start);
            if next > last || last - next + 1 < len {
                continue;
            }

            self.next_sticky = next + len;
            return Ok(next);
        }

        Err(Error::NoMemory)
    }

    /// Carves `len` bytes (rounded up to the page size) off the ephemeral
    /// watermark.
    ///
    /// The caller accounts for the allocation with the live-ephemeral
    /// counter; [`recycle_ephemeral`](Self::recycle_ephemeral) resets the
    /// watermark once the counter drains.
    pub(crate) fn alloc_ephemeral(&mut self, len: usize) -> Result<u64> {
        let len = mem::page_align_up(len) as u64;
        let r = *self.ranges.last().unwrap();

        let Some(iova) = self.next_ephemeral.checked_sub(len) else {
            return Err(Error::NoMemory);
        };
        if iova < r.start.max(self.next_sticky) {
            debug!("ephemeral iova space exhausted");
            return Err(Error::NoMemory);
        }

        self.next_ephemeral = iova;
        Ok(iova)
    }

    /// Resets the ephemeral watermark to the top of its region.
    ///
    /// Must only be called once no ephemeral mapping is live.
    pub(crate) fn recycle_ephemeral(&mut self) {
        self.next_ephemeral = self.ephemeral_top;
    }

    #[cfg(test)]
    pub(crate) fn ephemeral_watermark(&self) -> u64 {
        self.next_ephemeral
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pgsz() -> u64 {
        mem::page_size() as u64
    }

    #[test]
    fn sticky_allocations_are_adjacent_from_the_default_range() {
        let mut alloc = IovaAllocator::new(Vec::new());
        let a = alloc.alloc_sticky(pgsz()).unwrap();
        let b = alloc.alloc_sticky(pgsz()).unwrap();
        assert_eq!(a, 0x10000);
        assert_eq!(b, 0x10000 + pgsz());
    }

    #[test]
    fn unaligned_or_empty_lengths_are_rejected() {
        let mut alloc = IovaAllocator::new(Vec::new());
        assert!(matches!(alloc.alloc_sticky(0), Err(Error::InvalidArgs)));
        assert!(matches!(alloc.alloc_sticky(pgsz() - 1), Err(Error::InvalidArgs)));
        // A failed allocation must not move the cursor.
        assert_eq!(alloc.alloc_sticky(pgsz()).unwrap(), 0x10000);
    }

    #[test]
    fn allocation_skips_ranges_that_do_not_fit() {
        let ranges = vec![
            IovaRange {
                start: 0x10000,
                last: 0x10000 + pgsz() - 1,
            },
            IovaRange {
                start: 0x100000,
                last: 0x100000 + 8 * pgsz() - 1,
            },
        ];
        let mut alloc = IovaAllocator::new(ranges);
        // Two pages do not fit in the first range.
        assert_eq!(alloc.alloc_sticky(2 * pgsz()).unwrap(), 0x100000);
        // One page still fits there, but the cursor has moved past it.
        assert_eq!(alloc.alloc_sticky(pgsz()).unwrap(), 0x100000 + 2 * pgsz());
    }

    #[test]
    fn allocation_fails_when_no_range_fits() {
        let ranges = vec![IovaRange {
            start: 0x10000,
            last: 0x10000 + 2 * pgsz() - 1,
        }];
        let mut alloc = IovaAllocator::new(ranges);
        assert!(alloc.alloc_sticky(2 * pgsz()).is_ok());
        assert!(matches!(alloc.alloc_sticky(pgsz()), Err(Error::NoMemory)));
    }

    #[test]
    fn ranges_are_sorted_at_init() {
        let ranges = vec![
            IovaRange {
                start: 0x200000,
                last: 0x200000 + pgsz() - 1,
            },
            IovaRange {
                start: 0x10000,
                last: 0x10000 + pgsz() - 1,
            },
        ];
        let alloc = IovaAllocator::new(ranges);
        assert_eq!(alloc.ranges()[0].start, 0x10000);
    }

    #[test]
    fn ephemeral_watermark_grows_downward_and_recycles() {
        let mut alloc = IovaAllocator::new(Vec::new());
        let top = alloc.ephemeral_watermark();

        let a = alloc.alloc_ephemeral(1).unwrap();
        assert_eq!(a, top - pgsz());
        let b = alloc.alloc_ephemeral(pgsz() as usize + 1).unwrap();
        assert_eq!(b, top - 3 * pgsz());

        alloc.recycle_ephemeral();
        assert_eq!(alloc.ephemeral_watermark(), top);
        // After a recycle the same addresses are handed out again.
        assert_eq!(alloc.alloc_ephemeral(1).unwrap(), a);
    }

    #[test]
    fn ephemeral_allocation_stops_at_the_sticky_cursor() {
        let ranges = vec![IovaRange {
            start: 0x10000,
            last: 0x10000 + 4 * pgsz() - 1,
        }];
        let mut alloc = IovaAllocator::new(ranges);
        for _ in 0..4 {
            alloc.alloc_ephemeral(1).unwrap();
        }
        assert!(matches!(alloc.alloc_ephemeral(1), Err(Error::NoMemory)));
    }

    #[test]
    fn sticky_stays_below_the_ephemeral_watermark() {
        let ranges = vec![IovaRange {
            start: 0x10000,
            last: 0x10000 + 4 * pgsz() - 1,
        }];
        let mut alloc = IovaAllocator::new(ranges);
        alloc.alloc_ephemeral(1).unwrap();
        alloc.alloc_ephemeral(1).unwrap();
        // Two pages remain below the watermark.
        assert!(alloc.alloc_sticky(2 * pgsz()).is_ok());
        assert!(matches!(alloc.alloc_sticky(pgsz()), Err(Error::NoMemory)));
    }
}
