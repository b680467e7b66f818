//! # ntvirt Prelude
//!
//! The most commonly used types of the crate, for glob imports.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all ntvirt operations
pub use crate::Error;

/// Stable failure codes
pub use crate::Status;

/// The result type used throughout ntvirt
pub use crate::Result;

// ================================================================================================
// Address Space
// ================================================================================================

pub use crate::memory::{
    AddressSpace, AddressSpaceConfig, AllocationType, FaultKind, MemoryBasicInformation,
    MemoryState, MemoryType, PageFlags, Protection, ReservationState, ViewInfo,
};

// ================================================================================================
// Image Loading
// ================================================================================================

pub use crate::loader::{ImageMapping, RelocationKind};

// ================================================================================================
// Processes
// ================================================================================================

pub use crate::process::{ProcessHandle, ProcessMemory, ProcessMemoryChannel};
