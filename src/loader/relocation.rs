//! Base relocation processing for 32-bit images.
//!
//! The base relocation table is a list of blocks, each covering one 4 KiB page of the image:
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 4 | Page RVA |
//! | 4 | 4 | Block size, header included |
//! | 8 | 2 * n | Entries: type in the high 4 bits, page offset in the low 12 bits |
//!
//! Fixups add the difference between the actual and the preferred base to the value at the
//! entry's location, truncated to the width of the fixup.

use crate::Result;

/// Kind of a single base relocation entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RelocationKind {
    /// `IMAGE_REL_BASED_ABSOLUTE` - padding, no fixup
    Absolute,
    /// `IMAGE_REL_BASED_HIGH` - add the high 16 bits of the delta to a 16-bit value
    High,
    /// `IMAGE_REL_BASED_LOW` - add the low 16 bits of the delta to a 16-bit value
    Low,
    /// `IMAGE_REL_BASED_HIGHLOW` - add the delta to a 32-bit value
    HighLow,
    /// Any other type; skipped with a warning
    Unsupported(u8),
}

impl RelocationKind {
    /// Decodes the type nibble of a relocation entry.
    #[must_use]
    pub fn from_entry(entry: u16) -> Self {
        match (entry >> 12) as u8 {
            0 => RelocationKind::Absolute,
            1 => RelocationKind::High,
            2 => RelocationKind::Low,
            3 => RelocationKind::HighLow,
            other => RelocationKind::Unsupported(other),
        }
    }

    /// Number of bytes the fixup touches.
    #[must_use]
    pub fn width(self) -> usize {
        match self {
            RelocationKind::Absolute | RelocationKind::Unsupported(_) => 0,
            RelocationKind::High | RelocationKind::Low => 2,
            RelocationKind::HighLow => 4,
        }
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    let raw = bytes.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

fn read_u16(bytes: &[u8], offset: usize) -> Option<u16> {
    let raw = bytes.get(offset..offset.checked_add(2)?)?;
    Some(u16::from_le_bytes([raw[0], raw[1]]))
}

fn apply_fixup(image: &mut [u8], target: usize, kind: RelocationKind, delta: u32) {
    // Callers checked target + width against the image
    match kind {
        RelocationKind::Absolute | RelocationKind::Unsupported(_) => {}
        RelocationKind::High | RelocationKind::Low => {
            let value = u16::from_le_bytes([image[target], image[target + 1]]);
            let add = if kind == RelocationKind::High {
                (delta >> 16) as u16
            } else {
                delta as u16
            };
            image[target..target + 2].copy_from_slice(&value.wrapping_add(add).to_le_bytes());
        }
        RelocationKind::HighLow => {
            let value = u32::from_le_bytes([
                image[target],
                image[target + 1],
                image[target + 2],
                image[target + 3],
            ]);
            image[target..target + 4].copy_from_slice(&value.wrapping_add(delta).to_le_bytes());
        }
    }
}

/// Applies the base relocations of a mapped image.
///
/// Blocks naming a page beyond the image and entries whose target leaves the image are skipped
/// with a warning; some images legitimately describe pages past their nominal size. A block
/// smaller than its own header ends the walk.
///
/// # Arguments
///
/// * `image` - The whole mapped image, starting at its base
/// * `dir_rva` - RVA of the base relocation directory
/// * `dir_size` - Size of the base relocation directory
/// * `delta` - Actual base minus preferred base, truncated to 32 bits
///
/// # Returns
///
/// The number of fixups applied.
///
/// # Errors
///
/// Returns [`crate::Error::InvalidImageFormat`] if the directory lies outside the image or a
/// block overruns the directory.
pub fn apply_relocations(
    image: &mut [u8],
    dir_rva: u32,
    dir_size: u32,
    delta: u32,
) -> Result<usize> {
    let start = dir_rva as usize;
    let end = start
        .checked_add(dir_size as usize)
        .filter(|end| *end <= image.len())
        .ok_or_else(|| {
            invalid_image!(
                "relocation directory {:#x}+{:#x} outside image of {:#x} bytes",
                dir_rva,
                dir_size,
                image.len()
            )
        })?;

    let mut applied = 0usize;
    let mut offset = start;
    while offset + 8 <= end {
        let header = (read_u32(image, offset), read_u32(image, offset + 4));
        let (Some(page_rva), Some(block_size)) = header else {
            break;
        };
        let block_size = block_size as usize;
        // Zero padding or a terminator ends the list
        if block_size < 8 {
            break;
        }
        if offset + block_size > end {
            return Err(invalid_image!(
                "relocation block at {:#x} of {:#x} bytes overruns directory end {:#x}",
                offset,
                block_size,
                end
            ));
        }

        let count = (block_size - 8) / 2;
        let page = page_rva as usize;
        if page >= image.len() {
            log::warn!(
                "skipping {count} relocations for page {page_rva:#x} beyond image of {:#x} bytes",
                image.len()
            );
            offset += block_size;
            continue;
        }

        for index in 0..count {
            let Some(entry) = read_u16(image, offset + 8 + index * 2) else {
                break;
            };
            let kind = RelocationKind::from_entry(entry);
            let target = page + usize::from(entry & 0x0fff);
            match kind {
                RelocationKind::Absolute => {}
                RelocationKind::Unsupported(ty) => {
                    log::warn!("unsupported relocation type {ty} at rva {target:#x}");
                }
                _ if target + kind.width() > image.len() => {
                    log::warn!("relocation at rva {target:#x} beyond image, skipped");
                }
                _ => {
                    apply_fixup(image, target, kind, delta);
                    applied += 1;
                }
            }
        }
        offset += block_size;
    }
    Ok(applied)
}
