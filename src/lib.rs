// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(clippy::too_many_arguments)]
//#![deny(unsafe_code)]
// - 'memory/host.rs' wraps mmap, munmap, mprotect, pread and the cross-process copy syscalls

//! # ntvirt
//!
//! An NT-style virtual address space on top of a POSIX host.
//!
//! `ntvirt` reproduces the Windows virtual-memory model (reserve, commit and decommit of
//! regions, per-page protection with guard pages and copy-on-write, file-backed and
//! image-backed views) using the host's `mmap`, `mprotect` and `munmap`. It also maps 32-bit
//! PE images into the address space, section by section, with base relocation.
//!
//! # Architecture
//!
//! - **Protection translation**: NT `PAGE_*` values, internal page flags, host `PROT_*` bits
//! - **Reserved regions**: host ranges held back so fixed-address requests stay satisfiable
//! - **View registry**: every live region with its own per-page flags
//! - **Mapping engine**: file content projected into views, falling back to reads when the
//!   host cannot map the file directly
//! - **Image loader**: header validation, section mapping, relocation, final protections
//! - **Fault classification**: guard-page, stack-overflow and access-violation faults
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use ntvirt::prelude::*;
//!
//! let space = AddressSpace::new();
//!
//! // Reserve 1 MiB, then commit the first page read-write
//! let (base, _) = space.allocate(None, 0x10_0000, AllocationType::RESERVE, Protection::NOACCESS)?;
//! space.allocate(Some(base), 0x1000, AllocationType::COMMIT, Protection::READWRITE)?;
//!
//! let info = space.query(base)?;
//! assert_eq!(info.state, MemoryState::Commit);
//! assert_eq!(info.protect, Protection::READWRITE);
//!
//! space.free(base, 0, AllocationType::RELEASE)?;
//! # Ok::<(), ntvirt::Error>(())
//! ```
//!
//! ## Loading an image
//!
//! ```rust,no_run
//! use std::fs::File;
//! use ntvirt::prelude::*;
//!
//! let file = File::open("program.exe")?;
//! let space = AddressSpace::new();
//! let base = space.load_image(&ImageMapping::from_file(&file)?)?;
//! println!("loaded at {base:#x}");
//! # Ok::<(), ntvirt::Error>(())
//! ```
//!
//! # Thread Safety
//!
//! Each [`memory::AddressSpace`] serializes all of its operations behind one lock. It is
//! [`Send`] and [`Sync`] and can be shared between threads through an [`std::sync::Arc`].
//!
//! # Logging
//!
//! Diagnostics go through the [`log`] facade. No logger is installed by this crate.

#[macro_use]
pub(crate) mod error;

/// Shared functionality which is used in unit- and integration-tests
#[cfg(test)]
pub(crate) mod test;

/// Convenient re-exports of the most commonly used types.
///
/// # Example
///
/// ```rust,no_run
/// use ntvirt::prelude::*;
///
/// let space = AddressSpace::new();
/// let (base, size) = space.allocate(
///     None,
///     0x10000,
///     AllocationType::RESERVE | AllocationType::COMMIT,
///     Protection::READWRITE,
/// )?;
/// # Ok::<(), ntvirt::Error>(())
/// ```
pub mod prelude;

/// PE image loading.
///
/// Maps i386 PE images into an address space: places the image view, maps headers and
/// sections from the file, applies base relocations and sets per-section protections.
///
/// # Key Types
///
/// - [`loader::ImageMapping`] - Image file descriptor plus layout parameters
/// - [`loader::RelocationKind`] - Decoded base relocation entry type
///
/// # Main Functions
///
/// - [`loader::apply_relocations`] - Applies a base relocation directory to a mapped image
pub mod loader;

/// Virtual address space management.
///
/// # Key Types
///
/// - [`memory::AddressSpace`] - The address space and all of its public operations
/// - [`memory::AddressSpaceConfig`] - Layout parameters
/// - [`memory::Protection`] / [`memory::PageFlags`] - External and internal protection
/// - [`memory::MemoryBasicInformation`] - Query results
/// - [`memory::FaultKind`] - Fault classification outcome
pub mod memory;

/// Process-facing operations with target validation and cross-process copies.
///
/// # Key Types
///
/// - [`process::ProcessMemory`] - Address space plus inter-process channel
/// - [`process::ProcessHandle`] - Target of an operation
/// - [`process::ProcessMemoryChannel`] - Cross-process copy interface
pub mod process;

/// `ntvirt` Result type
///
/// A type alias for `std::result::Result<T, Error>` where the error type is always
/// [`Error`]. This is used consistently throughout the crate for error handling.
pub type Result<T> = std::result::Result<T, Error>;

/// `ntvirt` Error type
///
/// The main error type for all operations in this crate, carrying the NT failure vocabulary
/// plus host-level failures.
pub use error::{Error, Status};
