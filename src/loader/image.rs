//! Mapping of PE images into an address space.
//!
//! An image is loaded into a single view of its full virtual size. The header page is mapped
//! first and parsed with goblin; the sections are then projected from the file one by one,
//! relocated if the view did not land on the preferred base, and finally given their
//! per-section protections.
//!
//! Images whose section alignment is below the host page size cannot be mapped section by
//! section. They are mapped as one block instead, which requires every section to sit at the
//! same offset in the file as in memory.

use std::{
    fs::File,
    os::{
        fd::{AsFd, BorrowedFd},
        unix::fs::FileExt,
    },
};

use goblin::pe::{
    data_directories::DataDirectoryType, header::Header, section_table::SectionTable,
};

use crate::{
    loader::relocation::apply_relocations,
    memory::{
        allocator::VmState,
        host,
        mapping::map_file_into_view,
        view::{MemoryType, View},
        PageFlags,
    },
    Error, Result,
};

/// The one machine type images may be built for (`IMAGE_FILE_MACHINE_I386`).
pub const SUPPORTED_MACHINE: u16 = 0x014c;

const SIZEOF_COFF_HEADER: usize = 20;
const SIZEOF_SECTION_HEADER: usize = 40;
const SECTOR_ALIGN: usize = 0x1ff;
/// Images end at or below 4 GiB.
const IMAGE_CEILING: u64 = 0x1_0000_0000;

/// Section characteristics used by the loader.
mod scn {
    /// `IMAGE_SCN_MEM_SHARED`
    pub const MEM_SHARED: u32 = 0x1000_0000;
    /// `IMAGE_SCN_MEM_EXECUTE`
    pub const MEM_EXECUTE: u32 = 0x2000_0000;
    /// `IMAGE_SCN_MEM_READ`
    pub const MEM_READ: u32 = 0x4000_0000;
    /// `IMAGE_SCN_MEM_WRITE`
    pub const MEM_WRITE: u32 = 0x8000_0000;
}

/// Name of a machine type for diagnostics.
fn machine_name(machine: u16) -> String {
    match machine {
        0x0000 => "Unknown".to_string(),
        0x0200 => "IA-64".to_string(),
        0x8664 => "AMD-64".to_string(),
        0x0184 => "Alpha".to_string(),
        0x01f0 => "PowerPC".to_string(),
        other => format!("Unknown-{other:04x}"),
    }
}

/// Everything needed to map an image file.
///
/// # Example
///
/// ```rust,no_run
/// use std::fs::File;
/// use ntvirt::{loader::ImageMapping, memory::AddressSpace};
///
/// let file = File::open("program.exe")?;
/// let image = ImageMapping::from_file(&file)?;
/// let space = AddressSpace::new();
/// let base = space.load_image(&image)?;
/// # Ok::<(), ntvirt::Error>(())
/// ```
#[derive(Clone, Copy, Debug)]
pub struct ImageMapping<'a> {
    /// Descriptor of the image file, used for every private mapping.
    pub fd: BorrowedFd<'a>,
    /// Base address the image was linked for.
    pub preferred_base: usize,
    /// Size of the image in memory.
    pub total_size: usize,
    /// Size of the headers at the start of the file.
    pub header_size: usize,
    /// Descriptor of the shared copy of the image, backing shared writable sections.
    pub shared_fd: Option<BorrowedFd<'a>>,
    /// Whether the image file lives on removable media.
    pub removable: bool,
}

impl<'a> ImageMapping<'a> {
    /// Describes an image file with explicit layout parameters.
    #[must_use]
    pub fn new(
        fd: BorrowedFd<'a>,
        preferred_base: usize,
        total_size: usize,
        header_size: usize,
    ) -> Self {
        Self {
            fd,
            preferred_base,
            total_size,
            header_size,
            shared_fd: None,
            removable: false,
        }
    }

    /// Describes an image file, taking the layout parameters from its optional header.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Host`] if the file cannot be read, or
    /// [`Error::InvalidImageFormat`] if it has no valid PE header.
    pub fn from_file(file: &'a File) -> Result<Self> {
        let mut buf = vec![0u8; host::page_size()];
        let mut len = 0;
        while len < buf.len() {
            match file.read_at(&mut buf[len..], len as u64)? {
                0 => break,
                n => len += n,
            }
        }
        buf.truncate(len);

        let header = Header::parse(&buf).map_err(|e| invalid_image!("bad PE header: {}", e))?;
        let optional = header
            .optional_header
            .ok_or_else(|| invalid_image!("missing optional header"))?;
        Ok(Self::new(
            file.as_fd(),
            usize::try_from(optional.windows_fields.image_base)
                .map_err(|_| invalid_image!("image base out of range"))?,
            optional.windows_fields.size_of_image as usize,
            optional.windows_fields.size_of_headers as usize,
        ))
    }

    /// Sets the descriptor backing shared writable sections.
    #[must_use]
    pub fn with_shared_fd(mut self, fd: BorrowedFd<'a>) -> Self {
        self.shared_fd = Some(fd);
        self
    }

    /// Marks the image file as living on removable media.
    ///
    /// The file is then read rather than mapped where possible, and no descriptor is kept
    /// once loading completes.
    #[must_use]
    pub fn with_removable(mut self, removable: bool) -> Self {
        self.removable = removable;
        self
    }
}

/// The parts of the PE headers the loader needs, copied out of the mapped header page.
struct ImageHeaders {
    machine: u16,
    image_base: u64,
    section_alignment: usize,
    file_alignment: usize,
    entry_point: usize,
    imports: Option<(u32, u32)>,
    relocations: Option<(u32, u32)>,
    sections: Vec<SectionTable>,
}

impl ImageHeaders {
    fn parse(bytes: &[u8]) -> Result<Self> {
        let header = Header::parse(bytes).map_err(|e| invalid_image!("bad PE header: {}", e))?;
        let optional = header
            .optional_header
            .ok_or_else(|| invalid_image!("missing optional header"))?;

        let machine = header.coff_header.machine;
        if machine != SUPPORTED_MACHINE {
            let name = machine_name(machine);
            log::error!("trying to load PE image for unsupported architecture {name}");
            return Err(invalid_image!("unsupported architecture {}", name));
        }

        let table = header.dos_header.pe_pointer as usize
            + 4
            + SIZEOF_COFF_HEADER
            + header.coff_header.size_of_optional_header as usize;
        let count = header.coff_header.number_of_sections as usize;
        if table + count * SIZEOF_SECTION_HEADER > bytes.len() {
            return Err(invalid_image!(
                "section table of {} entries at {:#x} exceeds headers of {:#x} bytes",
                count,
                table,
                bytes.len()
            ));
        }
        let mut offset = table;
        let sections = header
            .coff_header
            .sections(bytes, &mut offset)
            .map_err(|e| invalid_image!("bad section table: {}", e))?;

        let directory = |wanted: DataDirectoryType| {
            optional
                .data_directories
                .dirs()
                .find(|(kind, dd)| *kind == wanted && dd.virtual_address != 0 && dd.size != 0)
                .map(|(_, dd)| (dd.virtual_address, dd.size))
        };

        Ok(Self {
            machine,
            image_base: optional.windows_fields.image_base,
            section_alignment: optional.windows_fields.section_alignment as usize,
            file_alignment: optional.windows_fields.file_alignment as usize,
            entry_point: optional.standard_fields.address_of_entry_point as usize,
            imports: directory(DataDirectoryType::ImportTable),
            relocations: directory(DataDirectoryType::BaseRelocationTable),
            sections,
        })
    }
}

fn section_name(section: &SectionTable) -> String {
    String::from_utf8_lossy(&section.name)
        .trim_end_matches('\0')
        .to_string()
}

/// Virtual size of a section rounded up to whole pages.
fn section_map_size(section: &SectionTable) -> Option<usize> {
    let size = if section.virtual_size != 0 {
        section.virtual_size
    } else {
        section.size_of_raw_data
    };
    host::round_size(0, size as usize)
}

/// Loads `image` into a new image view of `state` and returns its base.
///
/// # Errors
///
/// - [`Error::InvalidImageFormat`] for malformed headers, an unsupported machine type, a
///   section outside the image or beyond the end of the file, or an unaligned image whose
///   sections are not at their virtual offsets
/// - [`Error::ConflictingAddresses`] if the image had to be moved but has no relocations
/// - [`Error::NoMemory`] if no address range could be obtained
/// - [`Error::Host`] for mapping failures
///
/// On failure the image view is destroyed.
pub(crate) fn map_image(state: &mut VmState, image: &ImageMapping<'_>) -> Result<usize> {
    let total_size = host::round_size(0, image.total_size)
        .filter(|size| *size != 0)
        .ok_or_else(|| invalid_image!("image size {:#x} invalid", image.total_size))?;
    if image.header_size == 0 || image.header_size > total_size {
        return Err(invalid_image!(
            "header size {:#x} invalid for image of {:#x} bytes",
            image.header_size,
            total_size
        ));
    }

    let vprot = PageFlags::COMMITTED
        | PageFlags::READ
        | PageFlags::EXEC
        | PageFlags::WRITECOPY
        | PageFlags::IMAGE;

    // Relocation deltas are 32-bit, so the whole image must stay addressable by i386 code
    let ceiling = usize::try_from(IMAGE_CEILING)
        .unwrap_or(usize::MAX)
        .min(state.config.address_space_limit);
    let preferred = image.preferred_base;
    let usable = preferred >= state.config.low_reserved_limit
        && preferred & host::page_mask() == 0
        && preferred
            .checked_add(total_size)
            .is_some_and(|end| end <= ceiling);
    let mut result = Err(Error::ConflictingAddresses);
    if usable {
        result = state.create_view(Some(preferred), total_size, MemoryType::Image, vprot);
    }
    let base = match result {
        Err(Error::ConflictingAddresses) => {
            state.create_view_below(ceiling, total_size, MemoryType::Image, vprot)?
        }
        other => other?,
    };

    match load_into_view(state, base, total_size, image) {
        Ok(()) => {
            log::debug!(
                "loaded image {:#x}-{:#x} (preferred {:#x})",
                base,
                base + total_size,
                preferred
            );
            Ok(base)
        }
        Err(err) => {
            state.delete_view(base);
            Err(err)
        }
    }
}

fn load_into_view(
    state: &mut VmState,
    base: usize,
    total_size: usize,
    image: &ImageMapping<'_>,
) -> Result<()> {
    let page = host::page_size();
    let mask = host::page_mask();
    let fd = image.fd;
    let file_size = host::file_size(fd)?;
    if file_size < image.header_size as u64 {
        return Err(invalid_image!(
            "file of {:#x} bytes shorter than its {:#x} byte headers",
            file_size,
            image.header_size
        ));
    }
    let view = state
        .views
        .find_mut(base)
        .ok_or_else(|| Error::InternalConsistency(format!("image view {base:#x} vanished")))?;

    // Header page
    let header_size = image.header_size;
    map_file_into_view(
        view,
        0,
        header_size,
        fd,
        0,
        PageFlags::READ | PageFlags::WRITECOPY,
        image.removable,
    )?;
    if header_size & mask != 0 {
        // SAFETY: the header page is committed write-copy inside the image view
        unsafe { host::zero(base + header_size, page - (header_size & mask)) };
    }

    // SAFETY: the header pages were just mapped readable
    let headers = ImageHeaders::parse(unsafe { host::bytes(base, header_size) })?;
    if (base as u64).saturating_add(total_size as u64) > IMAGE_CEILING {
        log::error!("image at {base:#x}+{total_size:#x} is out of 32-bit reach");
        return Err(Error::ConflictingAddresses);
    }
    let delta = (base as u64).wrapping_sub(headers.image_base) as u32;
    let moved = base as u64 != headers.image_base;

    if headers.section_alignment < page {
        let rounded_file = host::round_size(0, usize::try_from(file_size).unwrap_or(usize::MAX))
            .unwrap_or(total_size);
        map_file_into_view(
            view,
            0,
            total_size.min(rounded_file),
            fd,
            0,
            PageFlags::READ | PageFlags::WRITECOPY,
            image.removable,
        )?;

        if headers.file_alignment != headers.section_alignment {
            return Err(invalid_image!(
                "unaligned image with file alignment {:#x} != section alignment {:#x}",
                headers.file_alignment,
                headers.section_alignment
            ));
        }
        if let Some(section) = headers
            .sections
            .iter()
            .find(|s| s.virtual_address != s.pointer_to_raw_data)
        {
            return Err(invalid_image!(
                "unaligned image section {} at rva {:#x} but file offset {:#x}",
                section_name(section),
                section.virtual_address,
                section.pointer_to_raw_data
            ));
        }

        view.set_protection(
            base,
            total_size,
            PageFlags::COMMITTED | PageFlags::READ | PageFlags::WRITECOPY | PageFlags::EXEC,
        )?;
        if moved {
            relocate(base, total_size, &headers, delta)?;
        }
    } else {
        map_sections(view, total_size, file_size, &headers, image)?;
        if moved {
            relocate(base, total_size, &headers, delta)?;
        }
        set_section_protections(view, header_size, &headers)?;
    }

    if !image.removable {
        view.set_backing(fd.try_clone_to_owned()?);
    }
    Ok(())
}

fn map_sections(
    view: &mut View,
    total_size: usize,
    file_size: u64,
    headers: &ImageHeaders,
    image: &ImageMapping<'_>,
) -> Result<()> {
    let mask = host::page_mask();
    let base = view.base();
    let rounded_file = (file_size + SECTOR_ALIGN as u64) & !(SECTOR_ALIGN as u64);
    let mut pos = 0u64;

    for section in &headers.sections {
        let name = section_name(section);
        let va = section.virtual_address as usize;
        let map_size =
            section_map_size(section).ok_or_else(|| invalid_image!("section {} too large", name))?;

        let raw = section.pointer_to_raw_data as usize;
        let file_start = raw & !SECTOR_ALIGN;
        let raw_size = (section.size_of_raw_data as usize + (raw & SECTOR_ALIGN) + SECTOR_ALIGN)
            & !SECTOR_ALIGN;
        let file_len = raw_size.min(map_size);

        let end = host::round_size(va, map_size).and_then(|size| va.checked_add(size));
        if va > total_size || !end.is_some_and(|end| end <= total_size) {
            log::warn!("section {name} too large ({va:#x}+{map_size:#x}/{total_size:#x})");
            return Err(invalid_image!(
                "section {} at {:#x}+{:#x} exceeds image of {:#x} bytes",
                name,
                va,
                map_size,
                total_size
            ));
        }

        let shared = section.characteristics & scn::MEM_SHARED != 0
            && section.characteristics & scn::MEM_WRITE != 0;
        if let (true, Some(shared_fd)) = (shared, image.shared_fd) {
            log::trace!(
                "mapping shared section {name} at {:#x} off {pos:#x} size {map_size:#x}",
                base + va
            );
            map_file_into_view(
                view,
                va,
                map_size,
                shared_fd,
                pos,
                PageFlags::READ | PageFlags::WRITE,
                false,
            )?;

            if let Some((imports_rva, imports_size)) = headers.imports {
                let imports_rva = imports_rva as usize;
                if imports_rva >= va && imports_rva < va + map_size {
                    let sub_start = imports_rva & !mask;
                    let sub_end = host::round_size(imports_rva, imports_size as usize)
                        .map_or(va + map_size, |size| (sub_start + size).min(va + map_size));
                    if sub_end > sub_start {
                        map_file_into_view(
                            view,
                            sub_start,
                            sub_end - sub_start,
                            image.fd,
                            (file_start + (sub_start - va)) as u64,
                            PageFlags::READ | PageFlags::WRITECOPY,
                            false,
                        )?;
                    }
                }
            }
            pos += map_size as u64;
            continue;
        }
        if shared {
            log::debug!("no shared descriptor for section {name}, mapping it privately");
        }

        log::trace!(
            "mapping section {name} at {:#x} off {:#x} size {file_len:#x} virt {map_size:#x}",
            base + va,
            section.pointer_to_raw_data
        );
        if raw == 0 || file_len == 0 {
            continue;
        }

        let file_end = file_start + file_len;
        if raw as u64 >= file_size || file_end as u64 > rounded_file {
            log::error!("could not map section {name}, file probably truncated");
            return Err(invalid_image!(
                "section {} at file offset {:#x}+{:#x} beyond file of {:#x} bytes",
                name,
                raw,
                file_len,
                file_size
            ));
        }
        map_file_into_view(
            view,
            va,
            file_len,
            image.fd,
            file_start as u64,
            PageFlags::READ | PageFlags::WRITECOPY,
            image.removable,
        )?;

        // Sector rounding pulls in file bytes past the raw data; clear them up to the page end
        let data_end = ((raw & SECTOR_ALIGN) + section.size_of_raw_data as usize).min(map_size);
        let clear_end = host::round_size(0, file_len).map_or(map_size, |size| size.min(map_size));
        if data_end < clear_end {
            // SAFETY: the section pages were just mapped write-copy inside the view
            unsafe { host::zero(base + va + data_end, clear_end - data_end) };
        }
    }
    Ok(())
}

fn relocate(base: usize, total_size: usize, headers: &ImageHeaders, delta: u32) -> Result<()> {
    let Some((rva, size)) = headers.relocations else {
        log::error!(
            "image at {base:#x} needs relocation from {:#x} but has no relocation records",
            headers.image_base
        );
        return Err(Error::ConflictingAddresses);
    };
    log::debug!(
        "relocating image from {:#x} to {base:#x} (machine {:#x})",
        headers.image_base,
        headers.machine
    );
    // SAFETY: the whole view is committed and host-writable until final protections apply
    let image = unsafe { host::bytes_mut(base, total_size) };
    apply_relocations(image, rva, size, delta)?;
    Ok(())
}

fn set_section_protections(
    view: &mut View,
    header_size: usize,
    headers: &ImageHeaders,
) -> Result<()> {
    let base = view.base();
    let header_pages = host::round_size(0, header_size).unwrap_or(host::page_size());
    view.set_protection(base, header_pages, PageFlags::COMMITTED | PageFlags::READ)?;

    for section in &headers.sections {
        let va = section.virtual_address as usize;
        let Some(size) = section_map_size(section) else {
            continue;
        };

        let mut vprot = PageFlags::COMMITTED;
        if section.characteristics & scn::MEM_READ != 0 {
            vprot |= PageFlags::READ;
        }
        if section.characteristics & scn::MEM_WRITE != 0 {
            vprot |= PageFlags::READ | PageFlags::WRITE | PageFlags::WRITECOPY;
        }
        if section.characteristics & scn::MEM_EXECUTE != 0 {
            vprot |= PageFlags::EXEC;
        }
        if headers.entry_point >= va && headers.entry_point < va + size {
            vprot |= PageFlags::EXEC;
        }

        if let Err(err) = view.set_protection(base + va, size, vprot) {
            log::warn!(
                "failed to set {:#x} protection on section {}: {err}",
                section.characteristics,
                section_name(section)
            );
        }
    }
    Ok(())
}
