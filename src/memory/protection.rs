//! Page protection vocabularies and the translations between them.
//!
//! Three representations of "what may a page do" exist side by side:
//!
//! - [`Protection`] - the NT `PAGE_*` constants callers pass in and receive back
//! - [`PageFlags`] - the internal per-page flag byte, the canonical form stored in every view
//! - host `PROT_*` bits - what `mmap`/`mprotect` get to see
//!
//! Only [`PageFlags`] is ever stored. The other two are derived from it on demand by the pure
//! functions in this module.
//!
//! # Write-Copy
//!
//! `PAGE_WRITECOPY` translates to `READ | WRITECOPY` internally, and reports back as
//! `PAGE_WRITECOPY` no matter whether the write bit is also present. The host mapping grants
//! write access for write-copy pages, since private duplication is handled by mapping the
//! backing file privately rather than by the page-fault path.
//!
//! # Guard Pages
//!
//! A guard page never gets host access, whatever its other bits say, and reports as
//! `PAGE_NOACCESS | PAGE_GUARD` until its first access clears the guard bit.

use bitflags::bitflags;

bitflags! {
    /// NT page protection constants.
    ///
    /// Exactly one of the eight base values is expected, optionally combined with
    /// [`GUARD`](Self::GUARD) and/or [`NOCACHE`](Self::NOCACHE). Unknown base values
    /// translate to "no access".
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Protection: u32 {
        /// `PAGE_NOACCESS`
        const NOACCESS = 0x01;
        /// `PAGE_READONLY`
        const READONLY = 0x02;
        /// `PAGE_READWRITE`
        const READWRITE = 0x04;
        /// `PAGE_WRITECOPY`
        const WRITECOPY = 0x08;
        /// `PAGE_EXECUTE`
        const EXECUTE = 0x10;
        /// `PAGE_EXECUTE_READ`
        const EXECUTE_READ = 0x20;
        /// `PAGE_EXECUTE_READWRITE`
        const EXECUTE_READWRITE = 0x40;
        /// `PAGE_EXECUTE_WRITECOPY`
        const EXECUTE_WRITECOPY = 0x80;
        /// `PAGE_GUARD` modifier
        const GUARD = 0x100;
        /// `PAGE_NOCACHE` modifier
        const NOCACHE = 0x200;
    }
}

bitflags! {
    /// Internal per-page protection and state flags.
    ///
    /// One byte per page is kept for every view. [`COMMITTED`](Self::COMMITTED) separates
    /// committed from reserved-only pages; [`IMAGE`](Self::IMAGE) only appears in a view's
    /// creation protection, never in its page map.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct PageFlags: u8 {
        /// Page is readable.
        const READ = 0x01;
        /// Page is writable.
        const WRITE = 0x02;
        /// Page is executable.
        const EXEC = 0x04;
        /// Page is write-copy.
        const WRITECOPY = 0x08;
        /// Page raises a one-shot guard violation on first access.
        const GUARD = 0x10;
        /// Page is uncached.
        const NOCACHE = 0x20;
        /// Page is committed.
        const COMMITTED = 0x40;
        /// Page belongs to a loaded image.
        const IMAGE = 0x80;
    }
}

/// Allocation state of a page, as reported by a query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display)]
pub enum MemoryState {
    /// `MEM_COMMIT`
    Commit,
    /// `MEM_RESERVE`
    Reserve,
    /// `MEM_FREE`
    Free,
}

impl MemoryState {
    /// Returns the NT `MEM_*` value of this state.
    #[must_use]
    pub fn to_raw(self) -> u32 {
        match self {
            MemoryState::Commit => 0x1000,
            MemoryState::Reserve => 0x2000,
            MemoryState::Free => 0x1_0000,
        }
    }
}

/// Base protection for each combination of `READ | WRITE | EXEC | WRITECOPY`.
const NT_PROTECTION: [Protection; 16] = [
    Protection::NOACCESS,          // 0
    Protection::READONLY,          // READ
    Protection::READWRITE,         // WRITE
    Protection::READWRITE,         // READ | WRITE
    Protection::EXECUTE,           // EXEC
    Protection::EXECUTE_READ,      // READ | EXEC
    Protection::EXECUTE_READWRITE, // WRITE | EXEC
    Protection::EXECUTE_READWRITE, // READ | WRITE | EXEC
    Protection::WRITECOPY,         // WRITECOPY
    Protection::WRITECOPY,         // READ | WRITECOPY
    Protection::WRITECOPY,         // WRITE | WRITECOPY
    Protection::WRITECOPY,         // READ | WRITE | WRITECOPY
    Protection::EXECUTE_WRITECOPY, // EXEC | WRITECOPY
    Protection::EXECUTE_WRITECOPY, // READ | EXEC | WRITECOPY
    Protection::EXECUTE_WRITECOPY, // WRITE | EXEC | WRITECOPY
    Protection::EXECUTE_WRITECOPY, // READ | WRITE | EXEC | WRITECOPY
];

impl PageFlags {
    /// Translates an NT protection value into page flags.
    ///
    /// The mapping is total: any unrecognized base value yields no access. Guard and
    /// no-cache modifiers are overlaid on the base translation. The result never has
    /// [`COMMITTED`](Self::COMMITTED) set; callers add it where the operation commits.
    ///
    /// # Arguments
    ///
    /// * `protect` - The NT protection value to translate
    #[must_use]
    pub fn from_protection(protect: Protection) -> Self {
        let base = Protection::from_bits_retain(protect.bits() & 0xff);
        let mut flags = if base == Protection::READONLY {
            Self::READ
        } else if base == Protection::READWRITE {
            Self::READ | Self::WRITE
        } else if base == Protection::WRITECOPY {
            Self::READ | Self::WRITECOPY
        } else if base == Protection::EXECUTE {
            Self::EXEC
        } else if base == Protection::EXECUTE_READ {
            Self::EXEC | Self::READ
        } else if base == Protection::EXECUTE_READWRITE {
            Self::EXEC | Self::READ | Self::WRITE
        } else if base == Protection::EXECUTE_WRITECOPY {
            Self::EXEC | Self::READ | Self::WRITECOPY
        } else {
            Self::empty()
        };

        if protect.contains(Protection::GUARD) {
            flags |= Self::GUARD;
        }
        if protect.contains(Protection::NOCACHE) {
            flags |= Self::NOCACHE;
        }
        flags
    }

    /// Translates page flags back into an NT protection value and allocation state.
    ///
    /// Guard pages always report `PAGE_NOACCESS | PAGE_GUARD`.
    #[must_use]
    pub fn to_protection(self) -> (Protection, MemoryState) {
        let mut protect = if self.contains(Self::GUARD) {
            Protection::NOACCESS | Protection::GUARD
        } else {
            NT_PROTECTION[usize::from(self.bits() & 0x0f)]
        };
        if self.contains(Self::NOCACHE) {
            protect |= Protection::NOCACHE;
        }

        let state = if self.contains(Self::COMMITTED) {
            MemoryState::Commit
        } else {
            MemoryState::Reserve
        };
        (protect, state)
    }

    /// Translates page flags into host `PROT_*` bits.
    ///
    /// Nothing is granted unless the page is committed and not a guard page.
    #[must_use]
    pub fn to_host(self) -> libc::c_int {
        let mut prot = libc::PROT_NONE;
        if self.contains(Self::COMMITTED) && !self.contains(Self::GUARD) {
            if self.contains(Self::READ) {
                prot |= libc::PROT_READ;
            }
            if self.intersects(Self::WRITE | Self::WRITECOPY) {
                prot |= libc::PROT_WRITE;
            }
            if self.contains(Self::EXEC) {
                prot |= libc::PROT_EXEC;
            }
        }
        prot
    }

    /// Returns `true` if the page is committed.
    #[must_use]
    pub fn is_committed(self) -> bool {
        self.contains(Self::COMMITTED)
    }
}
