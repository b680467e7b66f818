//! Process-facing memory operations.
//!
//! [`ProcessMemory`] pairs the caller's own [`AddressSpace`] with a [`ProcessMemoryChannel`]
//! for copying memory between processes. Every operation names its target with a
//! [`ProcessHandle`]:
//!
//! - Operations that change or inspect the address-space layout (allocate, free, protect,
//!   query, lock, unlock, map, unmap, image loading) only accept
//!   [`ProcessHandle::Current`]. Other targets fail with [`Error::AccessDenied`] before the
//!   address-space lock is taken.
//! - [`ProcessMemory::read`] and [`ProcessMemory::write`] accept any target and go through the
//!   channel without touching the view registry.
//!
//! # Example
//!
//! ```rust,no_run
//! use ntvirt::prelude::*;
//!
//! let memory = ProcessMemory::new();
//! let (base, _) = memory.allocate(
//!     ProcessHandle::Current,
//!     None,
//!     0x10000,
//!     AllocationType::RESERVE | AllocationType::COMMIT,
//!     Protection::READWRITE,
//! )?;
//! memory.write(ProcessHandle::Current, base, b"hello")?;
//! # Ok::<(), ntvirt::Error>(())
//! ```

use std::os::fd::BorrowedFd;

use crate::{
    loader::ImageMapping,
    memory::{host, AddressSpace, AllocationType, MemoryBasicInformation, Protection},
    Error, Result,
};

/// Identifies the process an operation targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProcessHandle {
    /// The calling process
    Current,
    /// Another process, by host process id
    Other(libc::pid_t),
}

impl ProcessHandle {
    /// Returns `true` for the calling process.
    ///
    /// An [`ProcessHandle::Other`] carrying the caller's own pid counts as current.
    #[must_use]
    pub fn is_current(self) -> bool {
        match self {
            ProcessHandle::Current => true,
            ProcessHandle::Other(pid) => pid == host::current_pid(),
        }
    }
}

/// Copies memory to and from the address space of a process.
pub trait ProcessMemoryChannel: Send + Sync {
    /// Reads process memory at `addr` into `buf`, returning the number of bytes read.
    ///
    /// # Errors
    ///
    /// Returns an error if the target cannot be accessed.
    fn read(&self, process: ProcessHandle, addr: usize, buf: &mut [u8]) -> Result<usize>;

    /// Writes `buf` into process memory at `addr`, returning the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns an error if the target cannot be accessed.
    fn write(&self, process: ProcessHandle, addr: usize, buf: &[u8]) -> Result<usize>;
}

/// Channel over the host's `process_vm_readv`/`process_vm_writev`.
#[cfg(target_os = "linux")]
#[derive(Debug, Default, Clone, Copy)]
pub struct HostChannel;

#[cfg(target_os = "linux")]
impl HostChannel {
    fn pid(process: ProcessHandle) -> libc::pid_t {
        match process {
            ProcessHandle::Current => host::current_pid(),
            ProcessHandle::Other(pid) => pid,
        }
    }

    fn map_err(err: std::io::Error) -> Error {
        match err.raw_os_error() {
            Some(libc::EFAULT) => Error::InvalidParameter,
            Some(libc::EPERM | libc::ESRCH) => Error::AccessDenied,
            _ => Error::Host(err),
        }
    }
}

#[cfg(target_os = "linux")]
impl ProcessMemoryChannel for HostChannel {
    fn read(&self, process: ProcessHandle, addr: usize, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        host::process_read(Self::pid(process), addr, buf).map_err(Self::map_err)
    }

    fn write(&self, process: ProcessHandle, addr: usize, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        host::process_write(Self::pid(process), addr, buf).map_err(Self::map_err)
    }
}

/// The caller's address space together with a channel to other processes.
pub struct ProcessMemory {
    space: AddressSpace,
    channel: Box<dyn ProcessMemoryChannel>,
}

impl std::fmt::Debug for ProcessMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessMemory")
            .field("space", &self.space)
            .finish_non_exhaustive()
    }
}

#[cfg(target_os = "linux")]
impl Default for ProcessMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessMemory {
    /// Creates a default address space with the host channel.
    #[cfg(target_os = "linux")]
    #[must_use]
    pub fn new() -> Self {
        Self::with_channel(AddressSpace::new(), Box::new(HostChannel))
    }

    /// Combines an address space with a custom channel.
    #[must_use]
    pub fn with_channel(space: AddressSpace, channel: Box<dyn ProcessMemoryChannel>) -> Self {
        Self { space, channel }
    }

    /// Returns the underlying address space.
    #[must_use]
    pub fn space(&self) -> &AddressSpace {
        &self.space
    }

    fn require_current(process: ProcessHandle, operation: &str) -> Result<()> {
        if process.is_current() {
            Ok(())
        } else {
            log::warn!("rejecting cross-process {operation} on {process:?}");
            Err(Error::AccessDenied)
        }
    }

    /// See [`AddressSpace::allocate`].
    ///
    /// # Errors
    ///
    /// [`Error::AccessDenied`] for another process, otherwise as [`AddressSpace::allocate`].
    pub fn allocate(
        &self,
        process: ProcessHandle,
        base: Option<usize>,
        size: usize,
        alloc_type: AllocationType,
        protect: Protection,
    ) -> Result<(usize, usize)> {
        Self::require_current(process, "allocate")?;
        self.space.allocate(base, size, alloc_type, protect)
    }

    /// See [`AddressSpace::free`].
    ///
    /// # Errors
    ///
    /// [`Error::AccessDenied`] for another process, otherwise as [`AddressSpace::free`].
    pub fn free(
        &self,
        process: ProcessHandle,
        addr: usize,
        size: usize,
        free_type: AllocationType,
    ) -> Result<(usize, usize)> {
        Self::require_current(process, "free")?;
        self.space.free(addr, size, free_type)
    }

    /// See [`AddressSpace::protect`].
    ///
    /// # Errors
    ///
    /// [`Error::AccessDenied`] for another process, otherwise as [`AddressSpace::protect`].
    pub fn protect(
        &self,
        process: ProcessHandle,
        addr: usize,
        size: usize,
        protect: Protection,
    ) -> Result<Protection> {
        Self::require_current(process, "protect")?;
        self.space.protect(addr, size, protect)
    }

    /// See [`AddressSpace::query`].
    ///
    /// # Errors
    ///
    /// [`Error::AccessDenied`] for another process, otherwise as [`AddressSpace::query`].
    pub fn query(&self, process: ProcessHandle, addr: usize) -> Result<MemoryBasicInformation> {
        Self::require_current(process, "query")?;
        self.space.query(addr)
    }

    /// See [`AddressSpace::lock`].
    ///
    /// # Errors
    ///
    /// [`Error::AccessDenied`] for another process.
    pub fn lock(&self, process: ProcessHandle, addr: usize, size: usize) -> Result<(usize, usize)> {
        Self::require_current(process, "lock")?;
        self.space.lock(addr, size)
    }

    /// See [`AddressSpace::unlock`].
    ///
    /// # Errors
    ///
    /// [`Error::AccessDenied`] for another process.
    pub fn unlock(
        &self,
        process: ProcessHandle,
        addr: usize,
        size: usize,
    ) -> Result<(usize, usize)> {
        Self::require_current(process, "unlock")?;
        self.space.unlock(addr, size)
    }

    /// See [`AddressSpace::map_view_of_file`].
    ///
    /// # Errors
    ///
    /// [`Error::AccessDenied`] for another process, otherwise as
    /// [`AddressSpace::map_view_of_file`].
    pub fn map_view_of_file(
        &self,
        process: ProcessHandle,
        fd: BorrowedFd<'_>,
        base: Option<usize>,
        size: usize,
        offset: u64,
        protect: Protection,
        removable: bool,
    ) -> Result<(usize, usize)> {
        Self::require_current(process, "map")?;
        self.space
            .map_view_of_file(fd, base, size, offset, protect, removable)
    }

    /// See [`AddressSpace::unmap_view`].
    ///
    /// # Errors
    ///
    /// [`Error::AccessDenied`] for another process, otherwise as [`AddressSpace::unmap_view`].
    pub fn unmap_view(&self, process: ProcessHandle, base: usize) -> Result<()> {
        Self::require_current(process, "unmap")?;
        self.space.unmap_view(base)
    }

    /// See [`AddressSpace::load_image`].
    ///
    /// # Errors
    ///
    /// [`Error::AccessDenied`] for another process, otherwise as [`AddressSpace::load_image`].
    pub fn load_image(&self, process: ProcessHandle, image: &ImageMapping<'_>) -> Result<usize> {
        Self::require_current(process, "image load")?;
        self.space.load_image(image)
    }

    /// Reads memory of `process` at `addr` into `buf` through the channel.
    ///
    /// # Errors
    ///
    /// Whatever the channel reports.
    pub fn read(&self, process: ProcessHandle, addr: usize, buf: &mut [u8]) -> Result<usize> {
        self.channel.read(process, addr, buf)
    }

    /// Writes `buf` into memory of `process` at `addr` through the channel.
    ///
    /// # Errors
    ///
    /// Whatever the channel reports.
    pub fn write(&self, process: ProcessHandle, addr: usize, buf: &[u8]) -> Result<usize> {
        self.channel.write(process, addr, buf)
    }
}
