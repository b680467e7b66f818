//! Integration tests for file views.

mod common;

use std::{
    io::{Read, Seek, SeekFrom},
    os::fd::AsFd,
};

use common::{pattern, read_bytes, temp_file, write_bytes};
use ntvirt::{memory::host, prelude::*};

#[test]
fn test_scenario_unaligned_offset_uses_read_fallback() -> Result<()> {
    let content = pattern(0x3000);
    let file = temp_file(&content);
    let space = AddressSpace::new();

    let (base, size) = space.map_view_of_file(
        file.as_file().as_fd(),
        None,
        0x1000,
        0x123,
        Protection::READONLY,
        false,
    )?;
    assert_eq!(size, host::round_size(0, 0x1000).unwrap());
    assert_eq!(read_bytes(base, 0x1000), &content[0x123..0x1123]);

    let info = space.query(base)?;
    assert_eq!(info.kind, Some(MemoryType::Mapped));
    assert_eq!(info.state, MemoryState::Commit);
    assert_eq!(info.protect, Protection::READONLY);
    Ok(())
}

#[test]
fn test_shared_writable_view_reaches_file() -> Result<()> {
    let content = pattern(0x2000);
    let mut file = temp_file(&content);
    let space = AddressSpace::new();

    let (base, _) = space.map_view_of_file(
        file.as_file().as_fd(),
        None,
        0x2000,
        0,
        Protection::READWRITE,
        false,
    )?;
    assert_eq!(read_bytes(base, 0x2000), content);
    write_bytes(base + 0x1010, b"written through");

    let mut disk = vec![0u8; 15];
    let handle = file.as_file_mut();
    handle.seek(SeekFrom::Start(0x1010)).unwrap();
    handle.read_exact(&mut disk).unwrap();
    assert_eq!(disk, b"written through");

    space.unmap_view(base)?;
    assert!(space.views()?.is_empty());
    Ok(())
}

#[test]
fn test_shared_writable_view_needs_aligned_offset() {
    let file = temp_file(&pattern(0x3000));
    let space = AddressSpace::new();

    let err = space
        .map_view_of_file(
            file.as_file().as_fd(),
            None,
            0x1000,
            0x123,
            Protection::READWRITE,
            false,
        )
        .unwrap_err();
    assert_eq!(err.status(), Status::NotSupported);
    assert!(space.views().unwrap().is_empty());
}

#[test]
fn test_map_to_end_of_file() -> Result<()> {
    let content = pattern(0x2800);
    let file = temp_file(&content);
    let space = AddressSpace::new();
    let page = host::page_size();

    let (base, size) = space.map_view_of_file(
        file.as_file().as_fd(),
        None,
        0,
        0x1000,
        Protection::WRITECOPY,
        false,
    )?;
    assert_eq!(size, host::round_size(0, 0x1800).unwrap());
    assert_eq!(read_bytes(base, 0x1800), &content[0x1000..]);

    // Private copy, the file stays untouched
    write_bytes(base, b"private");
    assert_eq!(read_bytes(base, 7), b"private");
    let mut disk = Vec::new();
    file.reopen().unwrap().read_to_end(&mut disk).unwrap();
    assert_eq!(disk, content);

    let err = space
        .map_view_of_file(file.as_file().as_fd(), None, 0, 0x2800, Protection::READONLY, false)
        .unwrap_err();
    assert_eq!(err.status(), Status::InvalidParameter);

    let err = space
        .map_view_of_file(
            file.as_file().as_fd(),
            Some(base + page),
            0x1000,
            0,
            Protection::READONLY,
            false,
        )
        .unwrap_err();
    assert_eq!(err.status(), Status::InvalidParameter);
    Ok(())
}

#[test]
fn test_view_past_end_of_file_is_rejected() {
    let file = temp_file(&pattern(0x1000));
    let space = AddressSpace::new();
    for (size, offset) in [(0x2000, 0), (0x1000, 0x800), (0x10, 0x1000)] {
        let err = space
            .map_view_of_file(
                file.as_file().as_fd(),
                None,
                size,
                offset,
                Protection::READONLY,
                false,
            )
            .unwrap_err();
        assert_eq!(err.status(), Status::InvalidParameter);
    }
    assert!(space.views().unwrap().is_empty());
}

#[test]
fn test_removable_media_is_read() -> Result<()> {
    let content = pattern(0x2000);
    let file = temp_file(&content);
    let space = AddressSpace::new();

    let (base, _) = space.map_view_of_file(
        file.as_file().as_fd(),
        None,
        0x2000,
        0,
        Protection::READONLY,
        true,
    )?;
    assert_eq!(read_bytes(base, 0x2000), content);
    drop(file);
    assert_eq!(read_bytes(base, 0x2000), content);
    Ok(())
}

#[test]
fn test_unmap_view_rules() -> Result<()> {
    let file = temp_file(&pattern(0x1000));
    let space = AddressSpace::new();
    let page = host::page_size();

    let (base, _) = space.map_view_of_file(
        file.as_file().as_fd(),
        None,
        0x1000,
        0,
        Protection::READONLY,
        false,
    )?;
    assert_eq!(
        space.unmap_view(base + page).unwrap_err().status(),
        Status::NotMappedView
    );

    let (private, _) = space.allocate(
        None,
        0x10000,
        AllocationType::RESERVE | AllocationType::COMMIT,
        Protection::READWRITE,
    )?;
    assert_eq!(
        space.unmap_view(private).unwrap_err().status(),
        Status::NotMappedView
    );
    // Mapped views are not released through free
    assert_eq!(
        space.free(base, 0, AllocationType::RELEASE).unwrap_err().status(),
        Status::InvalidParameter
    );

    space.unmap_view(base)?;
    assert_eq!(space.query(base)?.state, MemoryState::Free);
    assert_eq!(space.views()?.len(), 1);
    Ok(())
}
