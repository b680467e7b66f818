//! Reserved-region tracking.
//!
//! A reserved region is an address range the host must never hand out on its own. Reserving a
//! range blanks it on the host (inaccessible, unbacked, but occupied), so fixed-address
//! allocations can later be carved out of it deterministically.
//!
//! [`ReservedAreas`] keeps the ranges sorted and coalesced. The bookkeeping methods
//! ([`mark`](ReservedAreas::mark), [`unmark`](ReservedAreas::unmark),
//! [`query`](ReservedAreas::query)) never touch the host; [`reserve`](ReservedAreas::reserve)
//! and [`release`](ReservedAreas::release) do.

use std::{io, ops::Range};

use crate::memory::host;

/// How a range relates to the reserved regions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display)]
pub enum ReservationState {
    /// No byte of the range is reserved.
    NotReserved,
    /// The whole range lies inside a single reserved region.
    Reserved,
    /// The range straddles a reserved boundary.
    PartiallyReserved,
}

/// Sorted, coalesced set of reserved address ranges.
#[derive(Clone, Debug, Default)]
pub struct ReservedAreas {
    areas: Vec<Range<usize>>,
}

impl ReservedAreas {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the reserved ranges in ascending order.
    #[must_use]
    pub fn areas(&self) -> &[Range<usize>] {
        &self.areas
    }

    /// Records `range` as reserved, merging it with touching or overlapping regions.
    pub fn mark(&mut self, range: Range<usize>) {
        if range.is_empty() {
            return;
        }
        let mut merged = range;
        self.areas.retain(|area| {
            if area.start <= merged.end && merged.start <= area.end {
                merged.start = merged.start.min(area.start);
                merged.end = merged.end.max(area.end);
                false
            } else {
                true
            }
        });
        let pos = self.areas.partition_point(|area| area.start < merged.start);
        self.areas.insert(pos, merged);
    }

    /// Removes `range` from the reserved set, splitting regions as needed.
    pub fn unmark(&mut self, range: Range<usize>) {
        if range.is_empty() {
            return;
        }
        let mut kept = Vec::with_capacity(self.areas.len() + 1);
        for area in self.areas.drain(..) {
            if area.end <= range.start || range.end <= area.start {
                kept.push(area);
                continue;
            }
            if area.start < range.start {
                kept.push(area.start..range.start);
            }
            if range.end < area.end {
                kept.push(range.end..area.end);
            }
        }
        self.areas = kept;
    }

    /// Classifies `[base, base + size)` against the reserved regions.
    #[must_use]
    pub fn query(&self, base: usize, size: usize) -> ReservationState {
        let end = base.saturating_add(size);
        for area in &self.areas {
            if area.end <= base {
                continue;
            }
            if end <= area.start {
                break;
            }
            return if area.start <= base && end <= area.end {
                ReservationState::Reserved
            } else {
                ReservationState::PartiallyReserved
            };
        }
        ReservationState::NotReserved
    }

    /// Returns the parts of `range` that are reserved.
    #[must_use]
    pub fn overlapping(&self, range: Range<usize>) -> Vec<Range<usize>> {
        self.areas
            .iter()
            .filter(|area| area.start < range.end && range.start < area.end)
            .map(|area| area.start.max(range.start)..area.end.min(range.end))
            .collect()
    }

    /// Blanks `range` on the host and records it as reserved.
    ///
    /// # Errors
    ///
    /// Returns the host error if the range could not be blanked; nothing is recorded then.
    pub fn reserve(&mut self, range: Range<usize>) -> io::Result<()> {
        if range.is_empty() {
            return Ok(());
        }
        host::blank(range.start, range.len())?;
        self.mark(range);
        Ok(())
    }

    /// Unmarks `range`, releasing its reserved parts to the host when `unmap` is set.
    ///
    /// # Errors
    ///
    /// Returns the first host error from `munmap`; the range is unmarked regardless.
    pub fn release(&mut self, range: Range<usize>, unmap: bool) -> io::Result<()> {
        let reserved = if unmap {
            self.overlapping(range.clone())
        } else {
            Vec::new()
        };
        self.unmark(range);

        let mut result = Ok(());
        for part in reserved {
            if let Err(err) = host::munmap(part.start, part.len()) {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_coalesces() {
        let mut areas = ReservedAreas::new();
        areas.mark(0x3000..0x4000);
        areas.mark(0x1000..0x2000);
        areas.mark(0x2000..0x3000);
        assert_eq!(areas.areas(), &[0x1000..0x4000]);

        areas.mark(0x8000..0x9000);
        areas.mark(0x3800..0x8800);
        assert_eq!(areas.areas(), &[0x1000..0x9000]);
    }

    #[test]
    fn test_unmark_splits() {
        let mut areas = ReservedAreas::new();
        areas.mark(0x1000..0x9000);
        areas.unmark(0x3000..0x4000);
        assert_eq!(areas.areas(), &[0x1000..0x3000, 0x4000..0x9000]);

        areas.unmark(0x0..0x2000);
        assert_eq!(areas.areas(), &[0x2000..0x3000, 0x4000..0x9000]);
    }

    #[test]
    fn test_query_states() {
        let mut areas = ReservedAreas::new();
        areas.mark(0x10000..0x20000);
        areas.mark(0x40000..0x50000);

        assert_eq!(areas.query(0x0, 0x1000), ReservationState::NotReserved);
        assert_eq!(areas.query(0x20000, 0x20000), ReservationState::NotReserved);
        assert_eq!(areas.query(0x10000, 0x10000), ReservationState::Reserved);
        assert_eq!(areas.query(0x41000, 0x1000), ReservationState::Reserved);
        assert_eq!(
            areas.query(0x1f000, 0x2000),
            ReservationState::PartiallyReserved
        );
        assert_eq!(
            areas.query(0xf000, 0x2000),
            ReservationState::PartiallyReserved
        );
    }

    #[test]
    fn test_overlapping_clips() {
        let mut areas = ReservedAreas::new();
        areas.mark(0x1000..0x2000);
        areas.mark(0x3000..0x4000);
        assert_eq!(
            areas.overlapping(0x1800..0x3800),
            vec![0x1800..0x2000, 0x3000..0x3800]
        );
    }

    #[test]
    fn test_reserve_and_release_on_host() {
        let page = host::page_size();
        let base = host::anon_mmap(0, 4 * page, libc::PROT_NONE).unwrap();

        let mut areas = ReservedAreas::new();
        areas.reserve(base..base + 4 * page).unwrap();
        assert_eq!(areas.query(base, page), ReservationState::Reserved);

        areas.release(base..base + 4 * page, true).unwrap();
        assert_eq!(areas.query(base, page), ReservationState::NotReserved);
        assert!(areas.areas().is_empty());
    }
}
