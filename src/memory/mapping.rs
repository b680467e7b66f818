//! Section and file mapping engine.
//!
//! Projects file content into part of a view. The direct path maps the file with `MAP_FIXED`;
//! when the host cannot map the file at the requested offset, the engine falls back to
//! anonymous memory filled by a synchronous read.

use std::os::fd::BorrowedFd;

use crate::{
    memory::{host, view::View, PageFlags},
    Error, Result,
};

/// Host errors after which the read fallback may be used.
fn can_fall_back(errno: Option<i32>) -> bool {
    matches!(errno, Some(libc::EINVAL | libc::ENOEXEC | libc::ENODEV))
}

/// Maps `size` bytes of `fd` at `offset` into `view`, `start` bytes past its base.
///
/// Writable requests map the file shared, everything else privately. On removable media
/// non-shared requests go straight to the read fallback. Afterwards the covered pages carry
/// `vprot` plus [`PageFlags::COMMITTED`].
///
/// # Arguments
///
/// * `view` - The view receiving the mapping
/// * `start` - Page-aligned offset into the view
/// * `size` - Number of bytes to map
/// * `fd` - Backing file
/// * `offset` - File offset, not necessarily page-aligned
/// * `vprot` - Protection of the mapped pages
/// * `removable` - Whether the backing file lives on removable media
///
/// # Errors
///
/// - [`Error::InvalidParameter`] if the range leaves the view
/// - [`Error::NotSupported`] if a shared writable mapping is impossible on this file
/// - [`Error::Host`] for any other host failure
pub fn map_file_into_view(
    view: &mut View,
    start: usize,
    size: usize,
    fd: BorrowedFd<'_>,
    offset: u64,
    vprot: PageFlags,
    removable: bool,
) -> Result<()> {
    if start >= view.size() || size > view.size() - start {
        return Err(Error::InvalidParameter);
    }

    let vprot = vprot | PageFlags::COMMITTED;
    let prot = vprot.to_host();
    let shared_write = vprot.contains(PageFlags::WRITE);
    let addr = view.base() + start;

    let mut mapped = false;
    if !removable || shared_write {
        match host::file_mmap_fixed(addr, size, prot, shared_write, fd, offset) {
            Ok(_) => mapped = true,
            Err(err) if can_fall_back(err.raw_os_error()) => {
                if shared_write {
                    log::error!("shared writable mapping at {addr:#x} not supported: {err}");
                    return Err(Error::NotSupported);
                }
                log::debug!("mapping {addr:#x} from file offset {offset:#x} by reading: {err}");
            }
            Err(err) => return Err(Error::Host(err)),
        }
    }

    if !mapped {
        host::anon_mmap_fixed(addr, size, libc::PROT_READ | libc::PROT_WRITE)?;
        host::pread_into(addr, size, fd, offset)?;
        if prot != libc::PROT_READ | libc::PROT_WRITE {
            host::mprotect(addr, size, prot)?;
        }
    }

    let size = host::round_size(start, size).ok_or(Error::InvalidParameter)?;
    view.fill_flags(addr, size, vprot)
}
