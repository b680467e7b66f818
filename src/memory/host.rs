//! Thin wrappers over the host's memory-mapping syscalls.
//!
//! Every `unsafe` call into `mmap`, `munmap`, `mprotect`, `pread` and the cross-process copy
//! syscalls lives here. The wrappers take plain addresses and sizes and report failures as
//! [`std::io::Error`] carrying the host `errno`; translating those into the NT failure
//! vocabulary is up to the callers.
//!
//! # Safety Contract
//!
//! The fixed-address functions ([`anon_mmap_fixed`], [`file_mmap_fixed`], [`blank`]) replace
//! whatever is mapped at the target range. Callers only use them on ranges they own: views in
//! the registry, reserved regions, or host memory the caller handed over explicitly.

use std::{
    io,
    os::fd::{AsRawFd, BorrowedFd},
    sync::OnceLock,
};

use libc::{c_int, c_void};

/// Returns the host page size.
///
/// Read once via `sysconf` and cached for the lifetime of the process.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        // SAFETY: sysconf has no memory safety preconditions
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        usize::try_from(size).unwrap_or(0x1000)
    })
}

/// Returns the host page size minus one.
#[inline]
pub fn page_mask() -> usize {
    page_size() - 1
}

/// Rounds `addr` down to a multiple of `mask + 1`.
#[inline]
pub fn round_addr(addr: usize, mask: usize) -> usize {
    addr & !mask
}

/// Returns the number of bytes of whole pages covering `[addr, addr + size)`.
///
/// Returns `None` if the rounded range does not fit the address space.
#[inline]
pub fn round_size(addr: usize, size: usize) -> Option<usize> {
    let mask = page_mask();
    size.checked_add((addr & mask) + mask).map(|s| s & !mask)
}

fn check_map(ptr: *mut c_void) -> io::Result<usize> {
    if ptr == libc::MAP_FAILED {
        Err(io::Error::last_os_error())
    } else {
        Ok(ptr as usize)
    }
}

/// Maps anonymous private memory, using `addr` as a placement hint only.
///
/// The host is free to return a different address than the hint; callers compare.
pub fn anon_mmap(addr: usize, size: usize, prot: c_int) -> io::Result<usize> {
    // SAFETY: without MAP_FIXED the host never replaces existing mappings
    let ptr = unsafe {
        libc::mmap(
            addr as *mut c_void,
            size,
            prot,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    check_map(ptr)
}

/// Maps anonymous private memory exactly at `addr`, replacing what was there.
pub fn anon_mmap_fixed(addr: usize, size: usize, prot: c_int) -> io::Result<usize> {
    // SAFETY: callers own the target range, see the module documentation
    let ptr = unsafe {
        libc::mmap(
            addr as *mut c_void,
            size,
            prot,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
            -1,
            0,
        )
    };
    check_map(ptr)
}

/// Replaces `[addr, addr + size)` with inaccessible, unbacked memory.
///
/// The range stays occupied on the host so nothing else can be placed there.
pub fn blank(addr: usize, size: usize) -> io::Result<()> {
    // SAFETY: callers own the target range, see the module documentation
    let ptr = unsafe {
        libc::mmap(
            addr as *mut c_void,
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    check_map(ptr).map(|_| ())
}

/// Maps `size` bytes of `fd` starting at `offset` exactly at `addr`.
///
/// `shared` selects `MAP_SHARED` over `MAP_PRIVATE`.
pub fn file_mmap_fixed(
    addr: usize,
    size: usize,
    prot: c_int,
    shared: bool,
    fd: BorrowedFd<'_>,
    offset: u64,
) -> io::Result<usize> {
    let offset = libc::off_t::try_from(offset)
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
    let flags = libc::MAP_FIXED
        | if shared {
            libc::MAP_SHARED
        } else {
            libc::MAP_PRIVATE
        };
    // SAFETY: callers own the target range, see the module documentation
    let ptr = unsafe {
        libc::mmap(
            addr as *mut c_void,
            size,
            prot,
            flags,
            fd.as_raw_fd(),
            offset,
        )
    };
    check_map(ptr)
}

/// Releases `[addr, addr + size)` back to the host.
pub fn munmap(addr: usize, size: usize) -> io::Result<()> {
    if size == 0 {
        return Ok(());
    }
    // SAFETY: callers own the target range, see the module documentation
    if unsafe { libc::munmap(addr as *mut c_void, size) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Changes the host protection of `[addr, addr + size)`.
pub fn mprotect(addr: usize, size: usize, prot: c_int) -> io::Result<()> {
    if size == 0 {
        return Ok(());
    }
    // SAFETY: mprotect only changes access rights of pages the caller owns
    if unsafe { libc::mprotect(addr as *mut c_void, size, prot) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Reads up to `size` bytes of `fd` at `offset` into memory at `addr`.
///
/// Stops early at end of file and returns the number of bytes read. The target range must be
/// mapped writable.
pub fn pread_into(addr: usize, size: usize, fd: BorrowedFd<'_>, offset: u64) -> io::Result<usize> {
    let mut done = 0usize;
    while done < size {
        let pos = libc::off_t::try_from(offset + done as u64)
            .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        // SAFETY: [addr, addr + size) is writable memory owned by the caller
        let ret = unsafe {
            libc::pread(
                fd.as_raw_fd(),
                (addr + done) as *mut c_void,
                size - done,
                pos,
            )
        };
        match ret {
            0 => break,
            n if n < 0 => {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            // n > 0 here, the conversion cannot fail
            n => done += usize::try_from(n).unwrap_or(0),
        }
    }
    Ok(done)
}

/// Returns the size in bytes of the file behind `fd`.
pub fn file_size(fd: BorrowedFd<'_>) -> io::Result<u64> {
    // SAFETY: fstat writes into the zeroed buffer only
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd.as_raw_fd(), &mut stat) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(u64::try_from(stat.st_size).unwrap_or(0))
}

/// Copies memory of process `pid` at `remote` into `buf`.
///
/// Returns the number of bytes copied, which is short if the remote range ends in an
/// unmapped page.
#[cfg(target_os = "linux")]
pub fn process_read(pid: libc::pid_t, remote: usize, buf: &mut [u8]) -> io::Result<usize> {
    let local = libc::iovec {
        iov_base: buf.as_mut_ptr().cast::<c_void>(),
        iov_len: buf.len(),
    };
    let remote = libc::iovec {
        iov_base: remote as *mut c_void,
        iov_len: buf.len(),
    };
    // SAFETY: the local iovec covers `buf`; the kernel validates the remote range
    let ret = unsafe { libc::process_vm_readv(pid, &local, 1, &remote, 1, 0) };
    usize::try_from(ret).map_err(|_| io::Error::last_os_error())
}

/// Copies `buf` into memory of process `pid` at `remote`.
///
/// Returns the number of bytes copied.
#[cfg(target_os = "linux")]
pub fn process_write(pid: libc::pid_t, remote: usize, buf: &[u8]) -> io::Result<usize> {
    let local = libc::iovec {
        iov_base: buf.as_ptr().cast_mut().cast::<c_void>(),
        iov_len: buf.len(),
    };
    let remote = libc::iovec {
        iov_base: remote as *mut c_void,
        iov_len: buf.len(),
    };
    // SAFETY: the kernel only reads the local iovec; it validates the remote range
    let ret = unsafe { libc::process_vm_writev(pid, &local, 1, &remote, 1, 0) };
    usize::try_from(ret).map_err(|_| io::Error::last_os_error())
}

/// Returns the host process id of the caller.
pub fn current_pid() -> libc::pid_t {
    // SAFETY: getpid has no preconditions
    unsafe { libc::getpid() }
}

/// Zeroes `[addr, addr + len)`.
///
/// # Safety
///
/// The range must be mapped writable and owned by the caller.
pub unsafe fn zero(addr: usize, len: usize) {
    std::ptr::write_bytes(addr as *mut u8, 0, len);
}

/// Returns a byte slice over `[addr, addr + len)`.
///
/// # Safety
///
/// The range must be mapped readable, owned by the caller, and stay mapped and unaliased by
/// writers for the lifetime `'a`.
pub unsafe fn bytes<'a>(addr: usize, len: usize) -> &'a [u8] {
    std::slice::from_raw_parts(addr as *const u8, len)
}

/// Returns a mutable byte slice over `[addr, addr + len)`.
///
/// # Safety
///
/// The range must be mapped writable, owned by the caller, and stay mapped and otherwise
/// unaliased for the lifetime `'a`.
pub unsafe fn bytes_mut<'a>(addr: usize, len: usize) -> &'a mut [u8] {
    std::slice::from_raw_parts_mut(addr as *mut u8, len)
}
