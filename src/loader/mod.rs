//! PE image loading.
//!
//! Images are mapped as a single [`crate::memory::MemoryType::Image`] view covering their
//! whole virtual size. Only 32-bit x86 images are accepted.
//!
//! # Key Components
//!
//! - [`ImageMapping`] - Descriptor of an image file and its layout
//! - [`apply_relocations`] - Base relocation processing for images loaded away from their
//!   preferred base
//! - [`RelocationKind`] - Decoded relocation entry types
//!
//! # Loading Steps
//!
//! 1. Place the view at the preferred base, or anywhere if that range is taken
//! 2. Map and parse the headers
//! 3. Map every section copy-on-write from the file, or shared from the shared descriptor
//! 4. Apply base relocations if the image moved
//! 5. Give the header and each section its final protection

mod image;
mod relocation;

pub(crate) use image::map_image;
pub use image::{ImageMapping, SUPPORTED_MACHINE};
pub use relocation::{apply_relocations, RelocationKind};
