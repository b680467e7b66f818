//! The address space and its public operations.
//!
//! [`AddressSpace`] is the context object every operation goes through. It owns the view
//! registry and the reserved regions behind a single lock; each public method takes the lock
//! once, for its whole duration, so concurrent calls are fully serialized.
//!
//! # Operations
//!
//! | Method | NT counterpart |
//! |--------|----------------|
//! | [`allocate`](AddressSpace::allocate) | `NtAllocateVirtualMemory` |
//! | [`free`](AddressSpace::free) | `NtFreeVirtualMemory` |
//! | [`protect`](AddressSpace::protect) | `NtProtectVirtualMemory` |
//! | [`query`](AddressSpace::query) | `NtQueryVirtualMemory` |
//! | [`lock`](AddressSpace::lock) / [`unlock`](AddressSpace::unlock) | `NtLockVirtualMemory` / `NtUnlockVirtualMemory` |
//! | [`map_view_of_file`](AddressSpace::map_view_of_file) | `NtMapViewOfSection` |
//! | [`unmap_view`](AddressSpace::unmap_view) | `NtUnmapViewOfSection` |
//! | [`load_image`](AddressSpace::load_image) | image section mapping |

use std::{
    os::fd::BorrowedFd,
    sync::{Mutex, MutexGuard},
};

use bitflags::bitflags;

use crate::{
    loader::{self, ImageMapping},
    memory::{
        allocator::VmState,
        host,
        mapping::map_file_into_view,
        reserved::ReservationState,
        view::{MemoryType, Ownership, View, ViewInfo},
        FaultKind, MemoryState, PageFlags, Protection,
    },
    Error, Result,
};

#[cfg(target_pointer_width = "64")]
const DEFAULT_ADDRESS_SPACE_LIMIT: usize = 0x7fff_ffff_0000;
#[cfg(target_pointer_width = "64")]
const DEFAULT_USER_SPACE_LIMIT: usize = DEFAULT_ADDRESS_SPACE_LIMIT;

#[cfg(not(target_pointer_width = "64"))]
const DEFAULT_ADDRESS_SPACE_LIMIT: usize = 0xc000_0000;
#[cfg(not(target_pointer_width = "64"))]
const DEFAULT_USER_SPACE_LIMIT: usize = 0x7fff_0000;

bitflags! {
    /// Allocation and free type flags.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct AllocationType: u32 {
        /// `MEM_COMMIT`
        const COMMIT = 0x1000;
        /// `MEM_RESERVE`
        const RESERVE = 0x2000;
        /// `MEM_DECOMMIT`
        const DECOMMIT = 0x4000;
        /// `MEM_RELEASE`
        const RELEASE = 0x8000;
        /// `MEM_TOP_DOWN`, accepted and ignored
        const TOP_DOWN = 0x10_0000;
        /// The caller, not the address space, owns the host mapping.
        const SYSTEM = 0x8000_0000;
    }
}

/// Layout parameters of an [`AddressSpace`].
///
/// # Example
///
/// ```rust,no_run
/// use ntvirt::memory::{AddressSpace, AddressSpaceConfig};
///
/// let config = AddressSpaceConfig::new()
///     .with_user_space_limit(0x7fff_0000)
///     .with_low_reserved_limit(0x110000);
/// let space = AddressSpace::with_config(config)?;
/// # Ok::<(), ntvirt::Error>(())
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddressSpaceConfig {
    /// Ceiling of the default user address space.
    ///
    /// Queries past it fail when no view lies above. Raised to
    /// [`address_space_limit`](Self::address_space_limit) by
    /// [`AddressSpace::use_large_address_space`].
    pub user_space_limit: usize,

    /// Highest address any view may reach.
    pub address_space_limit: usize,

    /// Alignment of floating allocations and of reserving fixed allocations.
    pub granularity: usize,

    /// Image loads never use a preferred base below this address.
    pub low_reserved_limit: usize,

    /// Largest size a single allocation may request.
    pub max_allocation_size: usize,
}

impl Default for AddressSpaceConfig {
    fn default() -> Self {
        Self {
            user_space_limit: DEFAULT_USER_SPACE_LIMIT,
            address_space_limit: DEFAULT_ADDRESS_SPACE_LIMIT,
            granularity: 0x1_0000,
            low_reserved_limit: 0x11_0000,
            max_allocation_size: 0x7fff_0000,
        }
    }
}

impl AddressSpaceConfig {
    /// Creates a configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the user-space ceiling.
    #[must_use]
    pub fn with_user_space_limit(mut self, limit: usize) -> Self {
        self.user_space_limit = limit;
        self
    }

    /// Sets the highest address any view may reach.
    #[must_use]
    pub fn with_address_space_limit(mut self, limit: usize) -> Self {
        self.address_space_limit = limit;
        self
    }

    /// Sets the allocation granularity. Must be a power of two of at least one host page.
    #[must_use]
    pub fn with_granularity(mut self, granularity: usize) -> Self {
        self.granularity = granularity;
        self
    }

    /// Sets the low area image loads must leave free.
    #[must_use]
    pub fn with_low_reserved_limit(mut self, limit: usize) -> Self {
        self.low_reserved_limit = limit;
        self
    }

    /// Sets the largest size a single allocation may request.
    #[must_use]
    pub fn with_max_allocation_size(mut self, size: usize) -> Self {
        self.max_allocation_size = size;
        self
    }

    fn validate(&self) -> Result<()> {
        if !self.granularity.is_power_of_two()
            || self.granularity < host::page_size()
            || self.user_space_limit > self.address_space_limit
        {
            return Err(Error::InvalidParameter);
        }
        Ok(())
    }
}

/// Result of [`AddressSpace::query`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryBasicInformation {
    /// The queried address rounded down to a page.
    pub base_address: usize,
    /// Base of the containing view, 0 for free memory.
    pub allocation_base: usize,
    /// Bytes from `base_address` sharing the same state and protection.
    pub region_size: usize,
    /// Current protection; empty for reserved and `NOACCESS` for free memory.
    pub protect: Protection,
    /// Protection the view was created with; empty for free memory.
    pub allocation_protect: Protection,
    /// Free, reserved or committed.
    pub state: MemoryState,
    /// Backing kind, `None` for free memory.
    pub kind: Option<MemoryType>,
}

/// An NT-style virtual address space on top of the host's memory mappings.
///
/// # Thread Safety
///
/// All state sits behind one [`Mutex`]; every method holds it for its whole duration.
///
/// # Example
///
/// ```rust,no_run
/// use ntvirt::memory::{AddressSpace, AllocationType, Protection};
///
/// let space = AddressSpace::new();
/// let (base, size) = space.allocate(
///     None,
///     0x10000,
///     AllocationType::RESERVE | AllocationType::COMMIT,
///     Protection::READWRITE,
/// )?;
/// let old = space.protect(base, size, Protection::READONLY)?;
/// assert_eq!(old, Protection::READWRITE);
/// space.free(base, 0, AllocationType::RELEASE)?;
/// # Ok::<(), ntvirt::Error>(())
/// ```
#[derive(Debug)]
pub struct AddressSpace {
    state: Mutex<VmState>,
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressSpace {
    /// Creates an empty address space with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(VmState::new(AddressSpaceConfig::default())),
        }
    }

    /// Creates an empty address space with `config`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] if the granularity is not a power of two of at least
    /// one host page, or the user-space ceiling lies above the address-space limit.
    pub fn with_config(config: AddressSpaceConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            state: Mutex::new(VmState::new(config)),
        })
    }

    fn state(&self) -> Result<MutexGuard<'_, VmState>> {
        self.state.lock().map_err(|_| Error::LockError)
    }

    /// Returns the configuration this address space was created with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockError`] if the lock is poisoned.
    pub fn config(&self) -> Result<AddressSpaceConfig> {
        Ok(self.state()?.config.clone())
    }

    /// Returns the current user-space ceiling.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockError`] if the lock is poisoned.
    pub fn user_space_limit(&self) -> Result<usize> {
        Ok(self.state()?.user_space_limit)
    }

    /// Reserves and/or commits memory.
    ///
    /// Without a base, a new view is placed at a granularity-aligned address of the host's
    /// choosing. With a base, reserving rounds it down to the granularity and committing rounds
    /// it down to a page; the size is recomputed to cover the original range in whole pages.
    /// Committing without [`AllocationType::RESERVE`] requires the range to lie inside one
    /// existing view.
    ///
    /// With [`AllocationType::SYSTEM`] the range is registered as a committed view over host
    /// memory the caller already mapped, and is never unmapped by this address space.
    ///
    /// # Arguments
    ///
    /// * `base` - Requested base address, or `None` to let the host choose
    /// * `size` - Requested size in bytes
    /// * `alloc_type` - Combination of `RESERVE`, `COMMIT`, `TOP_DOWN` and `SYSTEM`
    /// * `protect` - Protection of the allocated pages
    ///
    /// # Returns
    ///
    /// The base and size actually allocated.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidParameter`] for a zero size, a bad flag combination, commit without a
    ///   base, or a base below the granularity, wrapping or beyond the address-space limit
    /// - [`Error::WorkingSetLimitRange`] if `size` exceeds the allocation ceiling
    /// - [`Error::ConflictingAddresses`] if the fixed range cannot be placed
    /// - [`Error::NotMappedView`] if a commit range is not inside one view
    /// - [`Error::AccessDenied`] if the host refused the commit
    /// - [`Error::NoMemory`] if the host is out of memory
    pub fn allocate(
        &self,
        base: Option<usize>,
        size: usize,
        alloc_type: AllocationType,
        protect: Protection,
    ) -> Result<(usize, usize)> {
        if size == 0 {
            return Err(Error::InvalidParameter);
        }

        let mut state = self.state()?;
        if size > state.config.max_allocation_size {
            return Err(Error::WorkingSetLimitRange);
        }

        let mask = host::page_mask();
        let (base, size) = match base {
            Some(addr) => {
                let align = if alloc_type.contains(AllocationType::RESERVE) {
                    state.config.granularity - 1
                } else {
                    mask
                };
                let base = host::round_addr(addr, align);
                let end = addr
                    .checked_add(size)
                    .and_then(|end| end.checked_add(mask))
                    .ok_or(Error::InvalidParameter)?
                    & !mask;
                if base < state.config.granularity || end > state.config.address_space_limit {
                    return Err(Error::InvalidParameter);
                }
                (Some(base), end - base)
            }
            None => (None, host::round_size(0, size).ok_or(Error::InvalidParameter)?),
        };

        let known = AllocationType::COMMIT
            | AllocationType::RESERVE
            | AllocationType::TOP_DOWN
            | AllocationType::SYSTEM;
        let placing = AllocationType::COMMIT | AllocationType::RESERVE | AllocationType::SYSTEM;
        if !alloc_type.intersects(placing) || !(alloc_type - known).is_empty() {
            log::warn!("invalid allocation type flags {:#x}", alloc_type.bits());
            return Err(Error::InvalidParameter);
        }
        if alloc_type.contains(AllocationType::TOP_DOWN) {
            log::warn!("top-down allocation requested, placing normally");
        }

        let mut vprot = PageFlags::from_protection(protect);
        if alloc_type.contains(AllocationType::COMMIT) {
            vprot |= PageFlags::COMMITTED;
        }

        if alloc_type.contains(AllocationType::SYSTEM) {
            let base = base.ok_or(Error::InvalidParameter)?;
            if state
                .views
                .iter()
                .any(|view| view.intersects(base, size) && view.ownership() == Ownership::Owned)
            {
                return Err(Error::ConflictingAddresses);
            }
            let view = View::new(
                base,
                size,
                MemoryType::Private,
                Ownership::External,
                vprot | PageFlags::COMMITTED,
            );
            let base = state.register_view(view)?;
            return Ok((base, size));
        }

        if alloc_type.contains(AllocationType::RESERVE) {
            let base = state.create_view(base, size, MemoryType::Private, vprot)?;
            return Ok((base, size));
        }

        let base = base.ok_or(Error::InvalidParameter)?;
        let view = state
            .views
            .find_mut(base)
            .filter(|view| view.covers(base, size))
            .ok_or(Error::NotMappedView)?;
        view.set_protection(base, size, vprot)
            .map_err(|_| Error::AccessDenied)?;
        Ok((base, size))
    }

    /// Releases or decommits memory of an allocated view.
    ///
    /// - [`AllocationType::RELEASE`] destroys the view; `addr` must be its base and `size` 0.
    /// - [`AllocationType::DECOMMIT`] discards the contents of the covered pages and marks them
    ///   reserved. A size of 0 decommits to the end of the view.
    /// - [`AllocationType::SYSTEM`] forgets the view without unmapping it. The returned range
    ///   is what the caller must unmap; its size is 0 when the view lies in a reserved region.
    ///
    /// # Returns
    ///
    /// The base and size that were freed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] if `addr` is not inside an allocated view, the free
    /// type is not exactly one of the above, or the range does not match the rules above.
    pub fn free(
        &self,
        addr: usize,
        size: usize,
        free_type: AllocationType,
    ) -> Result<(usize, usize)> {
        let size = host::round_size(addr, size).ok_or(Error::InvalidParameter)?;
        let base = host::round_addr(addr, host::page_mask());
        if base == 0 {
            return Err(Error::InvalidParameter);
        }

        let mut state = self.state()?;
        let (view_base, view_size, view_end) = state
            .views
            .find(base)
            .filter(|view| view.kind() == MemoryType::Private)
            .map(|view| (view.base(), view.size(), view.end()))
            .ok_or(Error::InvalidParameter)?;

        if free_type == AllocationType::SYSTEM {
            let unmap_size = match state.reserved.query(view_base, view_size) {
                ReservationState::NotReserved => view_size,
                _ => 0,
            };
            if let Some(mut view) = state.views.remove(view_base) {
                drop(view.take_backing());
            }
            log::trace!("forgot system view {view_base:#x}-{view_end:#x}");
            Ok((view_base, unmap_size))
        } else if free_type == AllocationType::RELEASE {
            if size != 0 || base != view_base {
                return Err(Error::InvalidParameter);
            }
            state.delete_view(view_base);
            Ok((base, 0))
        } else if free_type == AllocationType::DECOMMIT {
            let size = if size == 0 { view_end - base } else { size };
            if size > view_end - base {
                return Err(Error::InvalidParameter);
            }
            host::anon_mmap_fixed(base, size, libc::PROT_NONE)?;
            if let Some(view) = state.views.find_mut(base) {
                view.update_flags(base, size, |flags| flags - PageFlags::COMMITTED)?;
            }
            Ok((base, size))
        } else {
            log::warn!("invalid free type flags {:#x}", free_type.bits());
            Err(Error::InvalidParameter)
        }
    }

    /// Changes the protection of committed pages.
    ///
    /// Either every page of the range changes or none does.
    ///
    /// # Returns
    ///
    /// The previous protection of the first page.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidParameter`] if the range is not inside one view
    /// - [`Error::NotCommitted`] if any page of the range is not committed
    /// - [`Error::AccessDenied`] if the host refused the change
    pub fn protect(&self, addr: usize, size: usize, protect: Protection) -> Result<Protection> {
        let size = host::round_size(addr, size).ok_or(Error::InvalidParameter)?;
        let base = host::round_addr(addr, host::page_mask());
        let vprot = PageFlags::from_protection(protect) | PageFlags::COMMITTED;

        let mut state = self.state()?;
        let view = state
            .views
            .find_mut(base)
            .filter(|view| view.covers(base, size))
            .ok_or(Error::InvalidParameter)?;

        let old = view
            .flags_at(base)
            .map(|flags| flags.to_protection().0)
            .ok_or(Error::InvalidParameter)?;
        if !view.is_committed(base, size)? {
            return Err(Error::NotCommitted);
        }
        view.set_protection(base, size, vprot)
            .map_err(|_| Error::AccessDenied)?;
        Ok(old)
    }

    /// Describes the memory at `addr`.
    ///
    /// Inside a view the reported region is the run of pages sharing the queried page's state
    /// and protection. In a gap the region extends to the next view, or to the user-space
    /// ceiling (or address-space limit, if views exist above the ceiling) when none follows.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WorkingSetLimitRange`] if `addr` lies beyond the address-space limit,
    /// or beyond the user-space ceiling with no view above it.
    pub fn query(&self, addr: usize) -> Result<MemoryBasicInformation> {
        let page = host::page_size();
        let base = host::round_addr(addr, host::page_mask());

        let state = self.state()?;
        if base >= state.config.address_space_limit {
            return Err(Error::WorkingSetLimitRange);
        }

        if let Some(view) = state.views.find(base) {
            let index = (base - view.base()) / page;
            let flags = view.pages().get(index).ok_or(Error::PageOutOfBounds {
                index,
                count: view.pages().len(),
            })?;
            let (protect, mem_state) = flags.to_protection();
            let protect = if mem_state == MemoryState::Reserve {
                Protection::empty()
            } else {
                protect
            };
            return Ok(MemoryBasicInformation {
                base_address: base,
                allocation_base: view.base(),
                region_size: view.pages().run_length(index) * page,
                protect,
                allocation_protect: view.protect().to_protection().0,
                state: mem_state,
                kind: Some(view.kind()),
            });
        }

        let end = match state.views.next_at_or_after(base) {
            Some(next) => next.base(),
            None => {
                let alloc_base = state.views.previous(base).map_or(0, View::end);
                if alloc_base <= state.user_space_limit {
                    if base >= state.user_space_limit {
                        return Err(Error::WorkingSetLimitRange);
                    }
                    state.user_space_limit
                } else {
                    state.config.address_space_limit
                }
            }
        };

        Ok(MemoryBasicInformation {
            base_address: base,
            allocation_base: 0,
            region_size: end - base,
            protect: Protection::NOACCESS,
            allocation_protect: Protection::empty(),
            state: MemoryState::Free,
            kind: None,
        })
    }

    /// Accepts a page-locking request. The host offers no pinning, so nothing is locked.
    ///
    /// # Returns
    ///
    /// The page-rounded range.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] if the rounded range overflows.
    pub fn lock(&self, addr: usize, size: usize) -> Result<(usize, usize)> {
        let size = host::round_size(addr, size).ok_or(Error::InvalidParameter)?;
        Ok((host::round_addr(addr, host::page_mask()), size))
    }

    /// Accepts a page-unlocking request. See [`lock`](Self::lock).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] if the rounded range overflows.
    pub fn unlock(&self, addr: usize, size: usize) -> Result<(usize, usize)> {
        self.lock(addr, size)
    }

    /// Maps `size` bytes of `fd` starting at `offset` into a new view.
    ///
    /// A size of 0 maps to the end of the file. Writable protections map the file shared,
    /// everything else privately. Unless the file is on removable media, the view keeps a
    /// duplicate of `fd` until it is unmapped.
    ///
    /// # Returns
    ///
    /// The base and size of the new view.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidParameter`] if `base` is not granularity-aligned or the requested
    ///   range extends past the end of the file
    /// - [`Error::ConflictingAddresses`] if the fixed range cannot be placed
    /// - [`Error::NotSupported`] if a shared writable mapping is impossible on this file
    /// - [`Error::Host`] for descriptor and mapping failures
    pub fn map_view_of_file(
        &self,
        fd: BorrowedFd<'_>,
        base: Option<usize>,
        size: usize,
        offset: u64,
        protect: Protection,
        removable: bool,
    ) -> Result<(usize, usize)> {
        let file_size = host::file_size(fd)?;
        let size = if size == 0 {
            if offset >= file_size {
                return Err(Error::InvalidParameter);
            }
            usize::try_from(file_size - offset).map_err(|_| Error::InvalidParameter)?
        } else {
            let end = offset.checked_add(size as u64);
            if !end.is_some_and(|end| end <= file_size) {
                log::debug!("view {offset:#x}+{size:#x} exceeds file of {file_size:#x} bytes");
                return Err(Error::InvalidParameter);
            }
            size
        };
        let view_size = host::round_size(0, size).ok_or(Error::InvalidParameter)?;
        let vprot = PageFlags::from_protection(protect);
        let backing = if removable {
            None
        } else {
            Some(fd.try_clone_to_owned()?)
        };

        let mut state = self.state()?;
        if let Some(addr) = base {
            if addr & (state.config.granularity - 1) != 0 {
                return Err(Error::InvalidParameter);
            }
        }

        let base = state.create_view(base, view_size, MemoryType::Mapped, vprot)?;
        let result = match state.views.find_mut(base) {
            Some(view) => {
                map_file_into_view(view, 0, size, fd, offset, vprot, removable).map(|()| {
                    if let Some(backing) = backing {
                        view.set_backing(backing);
                    }
                })
            }
            None => Err(Error::InternalConsistency(format!(
                "view {base:#x} vanished after creation"
            ))),
        };
        if let Err(err) = result {
            state.delete_view(base);
            return Err(err);
        }
        Ok((base, view_size))
    }

    /// Unmaps the file or image view based at `base`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotMappedView`] if `base` is not the base of a mapped or image view.
    pub fn unmap_view(&self, base: usize) -> Result<()> {
        let mut state = self.state()?;
        state
            .views
            .find(base)
            .filter(|view| view.base() == base && view.kind() != MemoryType::Private)
            .ok_or(Error::NotMappedView)?;
        state.delete_view(base);
        Ok(())
    }

    /// Loads an executable image into a new view.
    ///
    /// # Returns
    ///
    /// The base the image was loaded at.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidImageFormat`] for malformed headers, an unsupported machine type, or
    ///   sections outside the image or beyond the end of the file
    /// - [`Error::ConflictingAddresses`] if the image had to be moved but has no relocations
    /// - [`Error::NoMemory`] if no address range could be obtained
    ///
    /// On failure nothing of the image stays mapped.
    pub fn load_image(&self, image: &ImageMapping<'_>) -> Result<usize> {
        let mut state = self.state()?;
        loader::map_image(&mut state, image)
    }

    /// Classifies a host protection fault at `addr`.
    ///
    /// A guard page hit clears the guard, so the same fault is reported only once.
    ///
    /// # Arguments
    ///
    /// * `addr` - Faulting address
    /// * `stack_limit` - Lowest valid stack address of the faulting thread, if known
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockError`] if the lock is poisoned.
    pub fn handle_fault(&self, addr: usize, stack_limit: Option<usize>) -> Result<FaultKind> {
        Ok(self.state()?.handle_fault(addr, stack_limit))
    }

    /// Hands the host range `[base, base + size)` over as a reserved region.
    ///
    /// The range is blanked, replacing whatever the caller had mapped there. Fixed-address
    /// allocations inside it are later carved out of the reservation.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidParameter`] if the range is empty, unaligned or wraps
    /// - [`Error::ConflictingAddresses`] if the range intersects a view
    /// - [`Error::Host`] if the range could not be blanked
    pub fn reserve_area(&self, base: usize, size: usize) -> Result<()> {
        let mask = host::page_mask();
        let end = base.checked_add(size).ok_or(Error::InvalidParameter)?;
        if size == 0 || base & mask != 0 || size & mask != 0 {
            return Err(Error::InvalidParameter);
        }

        let mut state = self.state()?;
        if state.views.find_range(base, size).is_some() {
            return Err(Error::ConflictingAddresses);
        }
        state.reserved.reserve(base..end)?;
        log::debug!("reserved {base:#x}-{end:#x}");
        Ok(())
    }

    /// Classifies `[base, base + size)` against the reserved regions.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockError`] if the lock is poisoned.
    pub fn reservation_state(&self, base: usize, size: usize) -> Result<ReservationState> {
        Ok(self.state()?.reserved.query(base, size))
    }

    /// Raises the user-space ceiling to the address-space limit.
    ///
    /// Reserved regions between the two are released, except for the parts covered by views.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockError`] if the lock is poisoned.
    pub fn use_large_address_space(&self) -> Result<()> {
        let mut state = self.state()?;
        let (old, new) = (state.user_space_limit, state.config.address_space_limit);
        if old < new {
            state.release_reserved_area(old..new);
            state.user_space_limit = new;
            log::debug!("user space limit raised from {old:#x} to {new:#x}");
        }
        Ok(())
    }

    /// Returns a snapshot of every view in ascending address order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockError`] if the lock is poisoned.
    pub fn views(&self) -> Result<Vec<ViewInfo>> {
        Ok(self.state()?.views.iter().map(View::info).collect())
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        let state = match self.state.get_mut() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rw_commit() -> AllocationType {
        AllocationType::RESERVE | AllocationType::COMMIT
    }

    #[test]
    fn test_config_builder() {
        let config = AddressSpaceConfig::new()
            .with_user_space_limit(0x7fff_0000)
            .with_granularity(0x2_0000)
            .with_max_allocation_size(0x1000_0000);
        assert_eq!(config.user_space_limit, 0x7fff_0000);
        assert_eq!(config.granularity, 0x2_0000);
        assert_eq!(config.low_reserved_limit, 0x11_0000);
        assert!(AddressSpace::with_config(config).is_ok());

        let bad = AddressSpaceConfig::new().with_granularity(0x3000);
        assert!(matches!(
            AddressSpace::with_config(bad),
            Err(Error::InvalidParameter)
        ));
    }

    #[test]
    fn test_allocate_validation() {
        let space = AddressSpace::new();
        let rw = Protection::READWRITE;

        assert!(matches!(
            space.allocate(None, 0, rw_commit(), rw),
            Err(Error::InvalidParameter)
        ));
        assert!(matches!(
            space.allocate(None, 0x8000_0000, rw_commit(), rw),
            Err(Error::WorkingSetLimitRange)
        ));
        assert!(matches!(
            space.allocate(None, 0x1000, AllocationType::COMMIT, rw),
            Err(Error::InvalidParameter)
        ));
        assert!(matches!(
            space.allocate(None, 0x1000, AllocationType::TOP_DOWN, rw),
            Err(Error::InvalidParameter)
        ));
        assert!(matches!(
            space.allocate(None, 0x1000, AllocationType::RESERVE | AllocationType::RELEASE, rw),
            Err(Error::InvalidParameter)
        ));
        assert!(matches!(
            space.allocate(Some(0x8000), 0x1000, AllocationType::RESERVE, rw),
            Err(Error::InvalidParameter)
        ));
        assert!(matches!(
            space.allocate(Some(usize::MAX - 0x1000), 0x2000, AllocationType::RESERVE, rw),
            Err(Error::InvalidParameter)
        ));
    }

    #[test]
    fn test_top_down_is_accepted() {
        let space = AddressSpace::new();
        let (base, size) = space
            .allocate(
                None,
                0x1000,
                AllocationType::RESERVE | AllocationType::TOP_DOWN,
                Protection::READONLY,
            )
            .unwrap();
        assert_eq!(base & 0xffff, 0);
        assert_eq!(size, host::round_size(0, 0x1000).unwrap());
    }

    #[test]
    fn test_commit_outside_view() {
        let space = AddressSpace::new();
        let (base, size) = space
            .allocate(None, 0x10000, AllocationType::RESERVE, Protection::READWRITE)
            .unwrap();
        let err = space
            .allocate(
                Some(base + size - 0x1000),
                0x2000,
                AllocationType::COMMIT,
                Protection::READWRITE,
            )
            .unwrap_err();
        assert!(matches!(err, Error::NotMappedView));
    }

    #[test]
    fn test_release_rules() {
        let space = AddressSpace::new();
        let page = host::page_size();
        let (base, _) = space
            .allocate(None, 4 * page, rw_commit(), Protection::READWRITE)
            .unwrap();

        assert!(matches!(
            space.free(base, page, AllocationType::RELEASE),
            Err(Error::InvalidParameter)
        ));
        assert!(matches!(
            space.free(base + page, 0, AllocationType::RELEASE),
            Err(Error::InvalidParameter)
        ));
        assert!(matches!(
            space.free(base, 0, AllocationType::RELEASE | AllocationType::DECOMMIT),
            Err(Error::InvalidParameter)
        ));
        assert_eq!(space.free(base, 0, AllocationType::RELEASE).unwrap(), (base, 0));
        assert!(space.views().unwrap().is_empty());
    }

    #[test]
    fn test_decommit_to_end_of_view() {
        let space = AddressSpace::new();
        let page = host::page_size();
        let (base, _) = space
            .allocate(None, 4 * page, rw_commit(), Protection::READWRITE)
            .unwrap();

        let (start, size) = space
            .free(base + page, 0, AllocationType::DECOMMIT)
            .unwrap();
        assert_eq!((start, size), (base + page, 3 * page));

        let info = space.query(base).unwrap();
        assert_eq!(info.state, MemoryState::Commit);
        assert_eq!(info.region_size, page);

        let info = space.query(base + 2 * page).unwrap();
        assert_eq!(info.state, MemoryState::Reserve);
        assert_eq!(info.protect, Protection::empty());
        assert_eq!(info.base_address, base + 2 * page);
        assert_eq!(info.region_size, 2 * page);
    }

    #[test]
    fn test_protect_outside_view() {
        let space = AddressSpace::new();
        let (base, size) = space
            .allocate(None, 0x10000, rw_commit(), Protection::READWRITE)
            .unwrap();
        assert!(matches!(
            space.protect(base, size + 1, Protection::READONLY),
            Err(Error::InvalidParameter)
        ));
    }

    #[test]
    fn test_lock_rounds() {
        let space = AddressSpace::new();
        let page = host::page_size();
        assert_eq!(space.lock(page + 1, 2).unwrap(), (page, page));
        assert_eq!(space.unlock(page - 1, 2).unwrap(), (0, 2 * page));
    }
}
