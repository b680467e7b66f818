//! Address-space allocator.
//!
//! [`VmState`] is everything the process-wide lock protects: the view registry, the reserved
//! regions and the current user-space ceiling. Its methods find or validate address ranges,
//! obtain host mappings for them, and create and destroy views.
//!
//! # Placement
//!
//! Floating requests over-allocate by one granularity unit and trim the result down to an
//! aligned block. Fixed requests consult the reserved regions first:
//!
//! | Reservation | Action |
//! |-------------|--------|
//! | not reserved | hinted host allocation, which must land exactly on the requested base |
//! | fully reserved | carved out of the reservation in place |
//! | partially reserved | rejected with conflicting addresses |

use std::ops::Range;

use crate::{
    memory::{
        host,
        registry::ViewRegistry,
        reserved::{ReservationState, ReservedAreas},
        view::{MemoryType, Ownership, View},
        AddressSpaceConfig, PageFlags,
    },
    Error, Result,
};

/// State guarded by the address-space lock.
#[derive(Debug)]
pub(crate) struct VmState {
    pub(crate) config: AddressSpaceConfig,
    pub(crate) user_space_limit: usize,
    pub(crate) views: ViewRegistry,
    pub(crate) reserved: ReservedAreas,
}

impl VmState {
    pub(crate) fn new(config: AddressSpaceConfig) -> Self {
        Self {
            user_space_limit: config.user_space_limit,
            config,
            views: ViewRegistry::new(),
            reserved: ReservedAreas::new(),
        }
    }

    fn granularity_mask(&self) -> usize {
        self.config.granularity - 1
    }

    /// Obtains a host mapping for a new view and returns its base.
    ///
    /// `base` must be page-aligned and `size` a page multiple. The mapping gets the host
    /// protection of `vprot`.
    pub(crate) fn map_view(
        &mut self,
        base: Option<usize>,
        size: usize,
        vprot: PageFlags,
    ) -> Result<usize> {
        let prot = vprot.to_host();

        let Some(base) = base else {
            let view_size = size
                .checked_add(self.config.granularity)
                .ok_or(Error::NoMemory)?;
            let ptr = host::anon_mmap(0, view_size, prot).map_err(|e| Error::from_host_alloc(&e))?;
            return Ok(self.unmap_extra_space(ptr, view_size, size));
        };

        match self.reserved.query(base, size) {
            ReservationState::PartiallyReserved => Err(Error::ConflictingAddresses),
            ReservationState::Reserved => {
                if self.views.find_range(base, size).is_some() {
                    return Err(Error::ConflictingAddresses);
                }
                let ptr = host::anon_mmap_fixed(base, size, prot)
                    .map_err(|e| Error::from_host_alloc(&e))?;
                if ptr != base {
                    return Err(Error::NoMemory);
                }
                Ok(base)
            }
            ReservationState::NotReserved => {
                let ptr =
                    host::anon_mmap(base, size, prot).map_err(|e| Error::from_host_alloc(&e))?;
                if ptr != base {
                    if ptr >= self.user_space_limit {
                        self.add_reserved_area(ptr, size);
                    } else if let Err(err) = host::munmap(ptr, size) {
                        log::warn!("failed to release misplaced mapping at {ptr:#x}: {err}");
                    }
                    return Err(Error::ConflictingAddresses);
                }
                Ok(base)
            }
        }
    }

    /// Trims an over-sized mapping down to `wanted` bytes starting at a granularity boundary.
    fn unmap_extra_space(&self, ptr: usize, total: usize, wanted: usize) -> usize {
        let mask = self.granularity_mask();
        let mut ptr = ptr;
        let mut total = total;
        if ptr & mask != 0 {
            let extra = mask + 1 - (ptr & mask);
            if let Err(err) = host::munmap(ptr, extra) {
                log::warn!("failed to trim {ptr:#x}-{:#x}: {err}", ptr + extra);
            }
            ptr += extra;
            total -= extra;
        }
        if total > wanted {
            if let Err(err) = host::munmap(ptr + wanted, total - wanted) {
                log::warn!("failed to trim {:#x}-{:#x}: {err}", ptr + wanted, ptr + total);
            }
        }
        ptr
    }

    /// Obtains a host mapping for a new view that ends at or below `ceiling`.
    ///
    /// Candidate bases are tried top-down on granularity boundaries, skipping views and
    /// reserved regions. Fails with [`Error::NoMemory`] once the low reserved limit is reached.
    fn map_view_below(&mut self, ceiling: usize, size: usize, vprot: PageFlags) -> Result<usize> {
        let prot = vprot.to_host();
        let mask = self.granularity_mask();
        let floor = self.config.low_reserved_limit.max(self.config.granularity);
        let step = |candidate: usize| candidate.checked_sub(mask + 1).filter(|c| *c >= floor);

        let mut next = ceiling.checked_sub(size).map(|top| top & !mask);
        while let Some(candidate) = next.filter(|c| *c >= floor) {
            if let Some(view) = self.views.find_range(candidate, size) {
                next = view.base().checked_sub(size).map(|below| below & !mask);
                continue;
            }
            if self.reserved.query(candidate, size) != ReservationState::NotReserved {
                next = step(candidate);
                continue;
            }
            let ptr =
                host::anon_mmap(candidate, size, prot).map_err(|e| Error::from_host_alloc(&e))?;
            if ptr == candidate {
                return Ok(candidate);
            }
            if let Err(err) = host::munmap(ptr, size) {
                log::warn!("failed to release misplaced mapping at {ptr:#x}: {err}");
            }
            next = step(candidate);
        }
        log::debug!("no room for {size:#x} bytes below {ceiling:#x}");
        Err(Error::NoMemory)
    }

    /// Creates and registers a view that ends at or below `ceiling`.
    pub(crate) fn create_view_below(
        &mut self,
        ceiling: usize,
        size: usize,
        kind: MemoryType,
        vprot: PageFlags,
    ) -> Result<usize> {
        let base = self.map_view_below(ceiling, size, vprot)?;
        self.register_view(View::new(base, size, kind, Ownership::Owned, vprot))
    }

    /// Creates and registers a view backed by a fresh host mapping.
    ///
    /// On failure no host mapping is left behind.
    pub(crate) fn create_view(
        &mut self,
        base: Option<usize>,
        size: usize,
        kind: MemoryType,
        vprot: PageFlags,
    ) -> Result<usize> {
        let base = self.map_view(base, size, vprot)?;
        self.register_view(View::new(base, size, kind, Ownership::Owned, vprot))
    }

    /// Registers `view` over an existing host mapping.
    ///
    /// If registration fails and the view owns its mapping, the mapping is released.
    pub(crate) fn register_view(&mut self, view: View) -> Result<usize> {
        let (base, size, ownership) = (view.base(), view.size(), view.ownership());
        match self.views.insert(view) {
            Ok(_superseded) => Ok(base),
            Err(err) => {
                if ownership == Ownership::Owned {
                    self.unmap_area(base, size);
                }
                Err(err)
            }
        }
    }

    /// Unregisters the view based at `base` and releases its host mapping.
    ///
    /// Externally owned mappings are left alone. The backing descriptor is closed unless it
    /// was already detached.
    pub(crate) fn delete_view(&mut self, base: usize) -> Option<View> {
        let mut view = self.views.remove(base)?;
        if view.ownership() == Ownership::Owned {
            self.unmap_area(view.base(), view.size());
        }
        drop(view.take_backing());
        log::trace!(
            "deleted view {:#x}-{:#x} {:?}",
            view.base(),
            view.end(),
            view.kind()
        );
        Some(view)
    }

    /// Releases `[base, base + size)` to the host.
    ///
    /// Parts inside a reserved region are blanked instead, so the reservation survives.
    pub(crate) fn unmap_area(&mut self, base: usize, size: usize) {
        let end = base + size;
        let mut cursor = base;
        for part in self.reserved.overlapping(base..end) {
            if cursor < part.start {
                if let Err(err) = host::munmap(cursor, part.start - cursor) {
                    log::warn!("failed to unmap {cursor:#x}-{:#x}: {err}", part.start);
                }
            }
            if let Err(err) = host::blank(part.start, part.len()) {
                log::warn!("failed to blank {:#x}-{:#x}: {err}", part.start, part.end);
            }
            cursor = part.end;
        }
        if cursor < end {
            if let Err(err) = host::munmap(cursor, end - cursor) {
                log::warn!("failed to unmap {cursor:#x}-{end:#x}: {err}");
            }
        }
    }

    /// Reserves `[base, base + size)`.
    ///
    /// The part below the user-space ceiling is released to the host instead of being
    /// reserved.
    pub(crate) fn add_reserved_area(&mut self, base: usize, size: usize) {
        let mut range = base..base.saturating_add(size);
        if range.start < self.user_space_limit {
            let below = range.start..range.end.min(self.user_space_limit);
            if let Err(err) = host::munmap(below.start, below.len()) {
                log::warn!("failed to release {:#x}-{:#x}: {err}", below.start, below.end);
            }
            range.start = below.end;
        }
        if range.is_empty() {
            return;
        }
        log::debug!("reserving {:#x}-{:#x}", range.start, range.end);
        if let Err(err) = self.reserved.reserve(range.clone()) {
            log::warn!("failed to reserve {:#x}-{:#x}: {err}", range.start, range.end);
        }
    }

    /// Releases reservations inside `range`.
    ///
    /// Parts covered by views stay reserved; the gaps between them are unmarked and returned
    /// to the host.
    pub(crate) fn release_reserved_area(&mut self, range: Range<usize>) {
        let covered: Vec<Range<usize>> = self
            .views
            .iter()
            .filter(|view| view.intersects(range.start, range.len()))
            .map(|view| view.base().max(range.start)..view.end().min(range.end))
            .collect();

        let mut cursor = range.start;
        let mut gaps = Vec::with_capacity(covered.len() + 1);
        for part in covered {
            if cursor < part.start {
                gaps.push(cursor..part.start);
            }
            cursor = cursor.max(part.end);
        }
        if cursor < range.end {
            gaps.push(cursor..range.end);
        }

        for gap in gaps {
            if let Err(err) = self.reserved.release(gap.clone(), true) {
                log::warn!("failed to release {:#x}-{:#x}: {err}", gap.start, gap.end);
            }
        }
    }

    /// Destroys every view.
    pub(crate) fn clear(&mut self) {
        let bases: Vec<usize> = self.views.iter().map(View::base).collect();
        for base in bases {
            self.delete_view(base);
        }
    }
}
