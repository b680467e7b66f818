//! Builder for small PE32 images used by the loader tests.
//!
//! The generated image has three sections:
//!
//! | Section | Contents |
//! |---------|----------|
//! | `.text` | Entry point, a 32-bit pointer into `.data` and two 16-bit relocation slots |
//! | `.data` | A marker followed by filler, with a larger virtual than raw size |
//! | `.reloc` | One relocation block covering the three slots in `.text` |
//!
//! This file only depends on `std` and `tempfile` so integration tests can include it by path.

#![allow(dead_code)]

use std::io::Write;

/// Default preferred base of the generated images.
pub const IMAGE_BASE: u32 = 0x1000_0000;
/// Offset of the 32-bit pointer in `.text`.
pub const SLOT_HIGHLOW: usize = 0x10;
/// Offset of the 16-bit high-half slot in `.text`.
pub const SLOT_HIGH: usize = 0x20;
/// Offset of the 16-bit low-half slot in `.text`.
pub const SLOT_LOW: usize = 0x24;
/// Initial value of the low-half slot.
pub const LOW_VALUE: u16 = 0x1234;
/// Marker at the start of `.data`.
pub const DATA_MARKER: &[u8; 4] = b"DATA";

const PE_OFFSET: usize = 0x80;
const OPTIONAL_OFFSET: usize = PE_OFFSET + 4 + 20;
const SECTION_TABLE: usize = OPTIONAL_OFFSET + 0xe0;
const HEADER_SIZE: usize = 0x200;
/// Bytes of `.data` content present in the file.
const DATA_FILE_LEN: usize = 0x400;

const SCN_CODE: u32 = 0x0000_0020;
const SCN_INITIALIZED_DATA: u32 = 0x0000_0040;
const SCN_DISCARDABLE: u32 = 0x0200_0000;
const SCN_SHARED: u32 = 0x1000_0000;
const SCN_EXECUTE: u32 = 0x2000_0000;
const SCN_READ: u32 = 0x4000_0000;
const SCN_WRITE: u32 = 0x8000_0000;

/// Placement of one section, both in memory and in the file.
#[derive(Clone, Copy, Debug)]
pub struct SectionLayout {
    pub name: &'static [u8],
    pub rva: u32,
    pub virtual_size: u32,
    pub file_offset: u32,
    pub raw_size: u32,
    pub characteristics: u32,
}

/// Builds a minimal i386 PE image.
#[derive(Clone, Debug)]
pub struct PeBuilder {
    machine: u16,
    image_base: u32,
    relocations: bool,
    shared_data: bool,
    imports: bool,
    unaligned: bool,
    entry_point: Option<u32>,
    data_raw_size: Option<u32>,
    truncate: Option<usize>,
}

impl Default for PeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PeBuilder {
    pub fn new() -> Self {
        Self {
            machine: 0x014c,
            image_base: IMAGE_BASE,
            relocations: true,
            shared_data: false,
            imports: false,
            unaligned: false,
            entry_point: None,
            data_raw_size: None,
            truncate: None,
        }
    }

    pub fn machine(mut self, machine: u16) -> Self {
        self.machine = machine;
        self
    }

    /// Links the image for `base` instead of [`IMAGE_BASE`].
    pub fn image_base(mut self, base: u32) -> Self {
        self.image_base = base;
        self
    }

    pub fn preferred_base(&self) -> u32 {
        self.image_base
    }

    /// Leaves the base relocation directory empty.
    pub fn without_relocations(mut self) -> Self {
        self.relocations = false;
        self
    }

    /// Marks `.data` as a shared section.
    pub fn shared_data(mut self) -> Self {
        self.shared_data = true;
        self
    }

    /// Points the import directory into `.data`.
    pub fn with_imports(mut self) -> Self {
        self.imports = true;
        self
    }

    /// Uses a section alignment of 0x200, below the page size.
    pub fn unaligned(mut self) -> Self {
        self.unaligned = true;
        self
    }

    pub fn entry_point(mut self, rva: u32) -> Self {
        self.entry_point = Some(rva);
        self
    }

    /// Declares `size` bytes of raw data for `.data`. The file still carries the full filler.
    pub fn data_raw_size(mut self, size: u32) -> Self {
        self.data_raw_size = Some(size);
        self
    }

    /// Cuts the generated file to `len` bytes.
    pub fn truncate(mut self, len: usize) -> Self {
        self.truncate = Some(len);
        self
    }

    pub fn header_size(&self) -> usize {
        HEADER_SIZE
    }

    pub fn size_of_image(&self) -> u32 {
        if self.unaligned {
            0xa00
        } else {
            0x5000
        }
    }

    /// Layout of `.text`, `.data` and `.reloc`, in that order.
    pub fn sections(&self) -> [SectionLayout; 3] {
        let data_flags = SCN_INITIALIZED_DATA
            | SCN_READ
            | SCN_WRITE
            | if self.shared_data { SCN_SHARED } else { 0 };
        let (text_rva, data_rva, data_vsize, reloc_rva) = if self.unaligned {
            (0x200, 0x400, 0x400, 0x800)
        } else {
            (0x1000, 0x2000, 0x1800, 0x4000)
        };
        [
            SectionLayout {
                name: b".text",
                rva: text_rva,
                virtual_size: 0x200,
                file_offset: 0x200,
                raw_size: 0x200,
                characteristics: SCN_CODE | SCN_EXECUTE | SCN_READ,
            },
            SectionLayout {
                name: b".data",
                rva: data_rva,
                virtual_size: data_vsize,
                file_offset: 0x400,
                raw_size: self.data_raw_size.unwrap_or(DATA_FILE_LEN as u32),
                characteristics: data_flags,
            },
            SectionLayout {
                name: b".reloc",
                rva: reloc_rva,
                virtual_size: 0x10,
                file_offset: 0x800,
                raw_size: 0x200,
                characteristics: SCN_INITIALIZED_DATA | SCN_READ | SCN_DISCARDABLE,
            },
        ]
    }

    pub fn text(&self) -> SectionLayout {
        self.sections()[0]
    }

    pub fn data(&self) -> SectionLayout {
        self.sections()[1]
    }

    /// RVA and size of the import directory, when enabled.
    pub fn import_directory(&self) -> Option<(u32, u32)> {
        self.imports.then(|| (self.data().rva + 0x100, 0x28))
    }

    /// Value of the 32-bit slot before relocation: the address of `.data`.
    pub fn highlow_value(&self) -> u32 {
        self.image_base + self.data().rva
    }

    /// Value of the high-half slot before relocation.
    pub fn high_value(&self) -> u16 {
        (self.image_base >> 16) as u16
    }

    pub fn build(&self) -> Vec<u8> {
        let mut b = vec![0u8; 0xa00];
        let put16 = |b: &mut Vec<u8>, off: usize, v: u16| {
            b[off..off + 2].copy_from_slice(&v.to_le_bytes());
        };
        let put32 = |b: &mut Vec<u8>, off: usize, v: u32| {
            b[off..off + 4].copy_from_slice(&v.to_le_bytes());
        };
        let sections = self.sections();
        let alignment = if self.unaligned { 0x200 } else { 0x1000 };

        b[0..2].copy_from_slice(b"MZ");
        put32(&mut b, 0x3c, PE_OFFSET as u32);
        b[PE_OFFSET..PE_OFFSET + 4].copy_from_slice(b"PE\0\0");

        let coff = PE_OFFSET + 4;
        put16(&mut b, coff, self.machine);
        put16(&mut b, coff + 2, sections.len() as u16);
        put16(&mut b, coff + 16, 0xe0);
        put16(&mut b, coff + 18, 0x0102);

        let opt = OPTIONAL_OFFSET;
        put16(&mut b, opt, 0x10b);
        b[opt + 2] = 6;
        put32(&mut b, opt + 4, sections[0].raw_size);
        put32(&mut b, opt + 8, sections[1].raw_size + sections[2].raw_size);
        put32(&mut b, opt + 16, self.entry_point.unwrap_or(sections[0].rva));
        put32(&mut b, opt + 20, sections[0].rva);
        put32(&mut b, opt + 24, sections[1].rva);
        put32(&mut b, opt + 28, self.image_base);
        put32(&mut b, opt + 32, alignment);
        put32(&mut b, opt + 36, 0x200);
        put16(&mut b, opt + 40, 4);
        put16(&mut b, opt + 48, 4);
        put32(&mut b, opt + 56, self.size_of_image());
        put32(&mut b, opt + 60, HEADER_SIZE as u32);
        put16(&mut b, opt + 68, 3);
        put32(&mut b, opt + 72, 0x10_0000);
        put32(&mut b, opt + 76, 0x1000);
        put32(&mut b, opt + 80, 0x10_0000);
        put32(&mut b, opt + 84, 0x1000);
        put32(&mut b, opt + 92, 16);

        let dirs = opt + 96;
        if let Some((rva, size)) = self.import_directory() {
            put32(&mut b, dirs + 8, rva);
            put32(&mut b, dirs + 12, size);
        }
        if self.relocations {
            put32(&mut b, dirs + 5 * 8, sections[2].rva);
            put32(&mut b, dirs + 5 * 8 + 4, 16);
        }

        for (index, section) in sections.iter().enumerate() {
            let entry = SECTION_TABLE + index * 40;
            b[entry..entry + section.name.len()].copy_from_slice(section.name);
            put32(&mut b, entry + 8, section.virtual_size);
            put32(&mut b, entry + 12, section.rva);
            put32(&mut b, entry + 16, section.raw_size);
            put32(&mut b, entry + 20, section.file_offset);
            put32(&mut b, entry + 36, section.characteristics);
        }

        let text = sections[0].file_offset as usize;
        b[text] = 0xc3;
        put32(&mut b, text + SLOT_HIGHLOW, self.highlow_value());
        put16(&mut b, text + SLOT_HIGH, self.high_value());
        put16(&mut b, text + SLOT_LOW, LOW_VALUE);

        let data = sections[1].file_offset as usize;
        b[data..data + 4].copy_from_slice(DATA_MARKER);
        for byte in &mut b[data + 4..data + DATA_FILE_LEN] {
            *byte = 0xaa;
        }

        let reloc = sections[2].file_offset as usize;
        put32(&mut b, reloc, sections[0].rva);
        put32(&mut b, reloc + 4, 16);
        put16(&mut b, reloc + 8, 0x3000 | SLOT_HIGHLOW as u16);
        put16(&mut b, reloc + 10, 0x1000 | SLOT_HIGH as u16);
        put16(&mut b, reloc + 12, 0x2000 | SLOT_LOW as u16);

        if let Some(len) = self.truncate {
            b.truncate(len);
        }
        b
    }

    /// Writes the image to a fresh temporary file.
    pub fn write_temp(&self) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&self.build()).unwrap();
        file.flush().unwrap();
        file
    }
}
