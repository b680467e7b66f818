use thiserror::Error;

macro_rules! invalid_image {
    // Single string version
    ($msg:expr) => {
        crate::Error::InvalidImageFormat {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::InvalidImageFormat {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which covers every failure an address space operation can report.
///
/// Each call returns at most one of these. The first eight variants are the NT failure
/// vocabulary callers compare against; the remaining ones describe host-level problems that
/// do not have a dedicated NT code. Use [`Error::status`] to compare results without
/// matching on payloads.
///
/// # Error Categories
///
/// ## Parameter Errors
/// - [`Error::InvalidParameter`] - Bad size, alignment or flag combination
/// - [`Error::WorkingSetLimitRange`] - Size or address beyond the configured ceiling
///
/// ## Address Space Errors
/// - [`Error::NoMemory`] - The host refused to provide memory
/// - [`Error::ConflictingAddresses`] - The requested range cannot be placed where asked
/// - [`Error::NotCommitted`] - The range contains reserved-only pages
/// - [`Error::NotMappedView`] - The range is not covered by a suitable view
/// - [`Error::AccessDenied`] - Cross-process target, or the host refused a protection change
///
/// ## Image Errors
/// - [`Error::InvalidImageFormat`] - Malformed or unsupported executable image
/// - [`Error::GoblinErr`] - Header parsing failure reported by goblin
///
/// # Examples
///
/// ```rust,no_run
/// use ntvirt::{memory::{AddressSpace, AllocationType, Protection}, Error, Status};
///
/// let space = AddressSpace::new();
/// match space.allocate(None, 0, AllocationType::RESERVE, Protection::READWRITE) {
///     Ok(_) => unreachable!(),
///     Err(e) => assert_eq!(e.status(), Status::InvalidParameter),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The caller supplied an invalid size, alignment, address or flag combination.
    #[error("Invalid parameter")]
    InvalidParameter,

    /// The host could not provide the requested memory.
    #[error("Not enough memory to complete the operation")]
    NoMemory,

    /// The requested range overlaps memory that cannot be superseded.
    #[error("Conflicting addresses")]
    ConflictingAddresses,

    /// At least one page of the range is reserved but not committed.
    #[error("Pages are not committed")]
    NotCommitted,

    /// The target is another process, or the host refused the protection change.
    #[error("Access denied")]
    AccessDenied,

    /// The size or address exceeds the configured address space ceiling.
    #[error("Working set limit range exceeded")]
    WorkingSetLimitRange,

    /// The executable image could not be loaded.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was wrong with the image
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Invalid image format - {file}:{line}: {message}")]
    InvalidImageFormat {
        /// The message to be printed for the InvalidImageFormat error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// The address range is not covered by a view suitable for the operation.
    #[error("Not a mapped view")]
    NotMappedView,

    /// The backing file cannot provide the requested kind of mapping.
    ///
    /// Raised for shared writable mappings on filesystems without `mmap` support,
    /// since those cannot be emulated by reading the file.
    #[error("Mapping not supported by the backing file")]
    NotSupported,

    /// A page index fell outside of a view's protection map.
    #[error("Page {index} out of bounds for a view of {count} pages")]
    PageOutOfBounds {
        /// The offending page index
        index: usize,
        /// Number of pages tracked by the view
        count: usize,
    },

    /// The view registry is in a state that should be impossible.
    ///
    /// Raised when a new view overlaps a view this subsystem manages itself. Debug builds
    /// assert before returning this.
    #[error("Internal consistency violation: {0}")]
    InternalConsistency(String),

    /// A host syscall failed with an error not covered by a dedicated code.
    #[error("{0}")]
    Host(#[from] std::io::Error),

    /// Error from the goblin crate during PE header parsing.
    #[error("{0}")]
    GoblinErr(#[from] goblin::error::Error),

    /// Failed to lock the process-wide address space state.
    #[error("Failed to lock target")]
    LockError,
}

/// Payload-free classification of an [`Error`].
///
/// This is the code callers compare against. Translating it into numeric platform codes is
/// left to the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display)]
pub enum Status {
    /// See [`Error::InvalidParameter`].
    InvalidParameter,
    /// See [`Error::NoMemory`].
    NoMemory,
    /// See [`Error::ConflictingAddresses`].
    ConflictingAddresses,
    /// See [`Error::NotCommitted`].
    NotCommitted,
    /// See [`Error::AccessDenied`].
    AccessDenied,
    /// See [`Error::WorkingSetLimitRange`].
    WorkingSetLimitRange,
    /// See [`Error::InvalidImageFormat`] and [`Error::GoblinErr`].
    InvalidImageFormat,
    /// See [`Error::NotMappedView`].
    NotMappedView,
    /// See [`Error::NotSupported`].
    NotSupported,
    /// Host failures without a dedicated code, lock poisoning and registry corruption.
    InternalError,
}

impl Error {
    /// Returns the payload-free [`Status`] of this error.
    ///
    /// Host errors are classified by their `errno` where a dedicated code exists.
    #[must_use]
    pub fn status(&self) -> Status {
        match self {
            Error::InvalidParameter | Error::PageOutOfBounds { .. } => Status::InvalidParameter,
            Error::NoMemory => Status::NoMemory,
            Error::ConflictingAddresses => Status::ConflictingAddresses,
            Error::NotCommitted => Status::NotCommitted,
            Error::AccessDenied => Status::AccessDenied,
            Error::WorkingSetLimitRange => Status::WorkingSetLimitRange,
            Error::InvalidImageFormat { .. } | Error::GoblinErr(_) => Status::InvalidImageFormat,
            Error::NotMappedView => Status::NotMappedView,
            Error::NotSupported => Status::NotSupported,
            Error::Host(err) => match err.raw_os_error() {
                Some(libc::ENOMEM) => Status::NoMemory,
                Some(libc::EACCES | libc::EPERM) => Status::AccessDenied,
                Some(libc::EINVAL) => Status::InvalidParameter,
                _ => Status::InternalError,
            },
            Error::InternalConsistency(_) | Error::LockError => Status::InternalError,
        }
    }

    /// Converts a failed host allocation into the allocator's failure vocabulary.
    ///
    /// `ENOMEM` becomes [`Error::NoMemory`], anything else [`Error::InvalidParameter`].
    pub(crate) fn from_host_alloc(err: &std::io::Error) -> Self {
        if err.raw_os_error() == Some(libc::ENOMEM) {
            Error::NoMemory
        } else {
            Error::InvalidParameter
        }
    }
}
