//! Views: contiguous, page-aligned regions with independent per-page protection.

use std::{ops::Range, os::fd::OwnedFd};

use crate::{
    memory::{host, PageFlags, PageMap, Protection},
    Result,
};

/// Kind of memory backing a view, as reported by a query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display)]
pub enum MemoryType {
    /// `MEM_PRIVATE` - anonymous memory from an allocation
    Private,
    /// `MEM_MAPPED` - a projection of a file or section
    Mapped,
    /// `MEM_IMAGE` - a loaded executable image
    Image,
}

impl MemoryType {
    /// Returns the NT `MEM_*` value of this type.
    #[must_use]
    pub fn to_raw(self) -> u32 {
        match self {
            MemoryType::Private => 0x2_0000,
            MemoryType::Mapped => 0x4_0000,
            MemoryType::Image => 0x100_0000,
        }
    }
}

/// Who is responsible for the host mapping under a view.
///
/// Only [`Ownership::External`] views may be superseded silently when a new view is created
/// on top of them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Ownership {
    /// The host mapping was created by this address space and is unmapped with the view.
    Owned,
    /// The host mapping belongs to someone else; the view only observes it.
    External,
}

/// Read-only description of a view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ViewInfo {
    /// Base address of the view.
    pub base: usize,
    /// Size of the view in bytes.
    pub size: usize,
    /// Backing kind.
    pub kind: MemoryType,
    /// Ownership of the host mapping.
    pub ownership: Ownership,
    /// Protection the view was created with.
    pub allocation_protect: Protection,
}

/// A mapped region of the address space.
#[derive(Debug)]
pub struct View {
    base: usize,
    size: usize,
    kind: MemoryType,
    ownership: Ownership,
    /// Creation protection, including [`PageFlags::IMAGE`] for image views.
    protect: PageFlags,
    pages: PageMap,
    backing: Option<OwnedFd>,
}

impl View {
    /// Creates the bookkeeping for a view at `[base, base + size)`.
    ///
    /// Every page starts out with `vprot` minus [`PageFlags::IMAGE`]. No host call is made.
    #[must_use]
    pub fn new(
        base: usize,
        size: usize,
        kind: MemoryType,
        ownership: Ownership,
        vprot: PageFlags,
    ) -> Self {
        Self {
            base,
            size,
            kind,
            ownership,
            protect: vprot,
            pages: PageMap::new(size / host::page_size(), vprot - PageFlags::IMAGE),
            backing: None,
        }
    }

    /// Base address.
    #[must_use]
    pub fn base(&self) -> usize {
        self.base
    }

    /// Size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// One past the last address.
    #[must_use]
    pub fn end(&self) -> usize {
        self.base + self.size
    }

    /// Backing kind.
    #[must_use]
    pub fn kind(&self) -> MemoryType {
        self.kind
    }

    /// Ownership of the host mapping.
    #[must_use]
    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    /// Creation protection.
    #[must_use]
    pub fn protect(&self) -> PageFlags {
        self.protect
    }

    /// Per-page protection map.
    #[must_use]
    pub fn pages(&self) -> &PageMap {
        &self.pages
    }

    /// Attaches the descriptor backing this view. It is closed when the view is destroyed.
    pub fn set_backing(&mut self, fd: OwnedFd) {
        self.backing = Some(fd);
    }

    /// Returns `true` if the view keeps a backing descriptor open.
    #[must_use]
    pub fn has_backing(&self) -> bool {
        self.backing.is_some()
    }

    /// Detaches the backing descriptor, if any.
    pub fn take_backing(&mut self) -> Option<OwnedFd> {
        self.backing.take()
    }

    /// Returns `true` if `addr` lies inside the view.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr - self.base < self.size
    }

    /// Returns `true` if `[addr, addr + size)` lies entirely inside the view.
    #[must_use]
    pub fn covers(&self, addr: usize, size: usize) -> bool {
        addr >= self.base && addr - self.base <= self.size && size <= self.end() - addr
    }

    /// Returns `true` if `[addr, addr + size)` intersects the view.
    #[must_use]
    pub fn intersects(&self, addr: usize, size: usize) -> bool {
        addr < self.end() && self.base < addr.saturating_add(size)
    }

    /// Returns the page indices covering `[addr, addr + size)`.
    ///
    /// The range is expected to be page-aligned and inside the view; accessors on the page map
    /// reject it otherwise.
    #[must_use]
    pub fn page_range(&self, addr: usize, size: usize) -> Range<usize> {
        let page = host::page_size();
        let start = addr.saturating_sub(self.base) / page;
        start..start + size / page
    }

    /// Returns the flags of the page containing `addr`.
    #[must_use]
    pub fn flags_at(&self, addr: usize) -> Option<PageFlags> {
        if !self.contains(addr) {
            return None;
        }
        self.pages.get((addr - self.base) / host::page_size())
    }

    /// Returns `true` if every page of `[addr, addr + size)` is committed.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::PageOutOfBounds`] if the range leaves the view.
    pub fn is_committed(&self, addr: usize, size: usize) -> Result<bool> {
        self.pages
            .all(self.page_range(addr, size), PageFlags::is_committed)
    }

    /// Sets the pages of `[addr, addr + size)` to `vprot`, on the host and in the page map.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::PageOutOfBounds`] if the range leaves the view, or
    /// [`crate::Error::Host`] if the host refused the protection change. Neither leaves the
    /// page map changed.
    pub fn set_protection(&mut self, addr: usize, size: usize, vprot: PageFlags) -> Result<()> {
        let pages = self.page_range(addr, size);
        self.pages.slice(pages.clone())?;
        host::mprotect(addr, size, vprot.to_host())?;
        self.pages.fill(pages, vprot)
    }

    /// Rewrites the flags of `[addr, addr + size)` through `f` without touching the host.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::PageOutOfBounds`] if the range leaves the view.
    pub fn update_flags<F>(&mut self, addr: usize, size: usize, f: F) -> Result<()>
    where
        F: Fn(PageFlags) -> PageFlags,
    {
        let pages = self.page_range(addr, size);
        self.pages.update(pages, f)
    }

    /// Sets the flags of `[addr, addr + size)` without touching the host.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::PageOutOfBounds`] if the range leaves the view.
    pub fn fill_flags(&mut self, addr: usize, size: usize, vprot: PageFlags) -> Result<()> {
        let pages = self.page_range(addr, size);
        self.pages.fill(pages, vprot)
    }

    /// Returns the read-only description of this view.
    #[must_use]
    pub fn info(&self) -> ViewInfo {
        ViewInfo {
            base: self.base,
            size: self.size,
            kind: self.kind,
            ownership: self.ownership,
            allocation_protect: self.protect.to_protection().0,
        }
    }
}
