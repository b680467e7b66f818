//! Virtual address space management.
//!
//! This module reproduces the NT virtual-memory model (reserve, commit, decommit, per-page
//! protection, file and image views) on top of the host's `mmap`/`mprotect`/`munmap`.
//!
//! # Core Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`AddressSpace`] | Context object exposing every public operation behind one lock |
//! | [`AddressSpaceConfig`] | Layout parameters: ceilings, granularity, low reserved area |
//! | [`Protection`] | NT `PAGE_*` protection constants |
//! | [`PageFlags`] | Internal per-page flags, the canonical protection representation |
//! | [`AllocationType`] | NT `MEM_*` allocation and free type flags |
//! | [`MemoryBasicInformation`] | Result of a query |
//! | [`FaultKind`] | Outcome of classifying a protection fault |
//! | [`ReservationState`] | How a range relates to the reserved regions |
//!
//! # Layering
//!
//! 1. **Protection translation** - pure conversions between [`Protection`], [`PageFlags`] and
//!    host `PROT_*` bits
//! 2. **Reserved regions** - ranges the host must never hand out on its own
//! 3. **View registry** - ordered, non-overlapping views, each with its own page map
//! 4. **Allocator** - placement, creation and destruction of views
//! 5. **Mapping engine** - file content projected into views, with a read fallback
//! 6. **Public surface** - [`AddressSpace`]
//!
//! # Thread Safety
//!
//! [`AddressSpace`] serializes every operation through a single [`std::sync::Mutex`]. No
//! operation blocks on anything but synchronous host calls while holding it.

mod addressspace;
pub(crate) mod allocator;
mod fault;
pub mod host;
pub(crate) mod mapping;
mod page;
mod protection;
pub(crate) mod registry;
mod reserved;
pub(crate) mod view;

pub use addressspace::{AddressSpace, AddressSpaceConfig, AllocationType, MemoryBasicInformation};
pub use fault::FaultKind;
pub use page::PageMap;
pub use protection::{MemoryState, PageFlags, Protection};
pub use reserved::{ReservationState, ReservedAreas};
pub use view::{MemoryType, Ownership, ViewInfo};
